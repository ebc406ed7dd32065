use std::collections::BTreeMap;

use itertools::Itertools;

use crate::repository::interface::Error as RepositoryError;

/// Field name -> human-readable reason, ordered by field name
pub type FieldErrors = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} {name:?} already exists")]
    NameConflict { kind: &'static str, name: String },

    #[error("Invalid identifier {name:?}: {reason}")]
    InvalidIdentifier { name: String, reason: String },

    #[error("Field name {name:?} is reserved for system fields")]
    ReservedFieldName { name: String },

    #[error("Invalid options for field {field:?}: {reason}")]
    InvalidFieldOptions { field: String, reason: String },

    #[error("Validation failed: {}", describe(.errors))]
    ValidationFailed { errors: FieldErrors },

    #[error("Relation integrity violated: {}", describe(.errors))]
    RelationIntegrityError { errors: FieldErrors },

    /// The table was left exactly as it was before the attempt
    #[error("Migration of table {table:?} failed: {cause}")]
    MigrationError { table: String, cause: String },

    #[error("Invalid query: {reason}")]
    QueryCompileError { reason: String },

    #[error("Access to {action} on collection {collection:?} denied")]
    AccessDenied {
        collection: String,
        action: &'static str,
    },

    #[error("Cancelled by hook: {reason}")]
    HookRejected { reason: String },

    #[error("Internal SQL error: {0:?}")]
    SqlxError(sqlx::Error),

    #[error("Failed parsing JSON: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    ConfigError(#[from] config::ConfigError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

fn describe(errors: &FieldErrors) -> String {
    errors
        .iter()
        .map(|(field, reason)| format!("{field}: {reason}"))
        .join("; ")
}

impl Error {
    pub(crate) fn query(reason: impl Into<String>) -> Self {
        Error::QueryCompileError {
            reason: reason.into(),
        }
    }

    pub(crate) fn single_field(field: &str, reason: impl Into<String>) -> Self {
        Error::ValidationFailed {
            errors: FieldErrors::from([(field.to_string(), reason.into())]),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::SqlxError(err)
    }
}

impl From<RepositoryError> for Error {
    fn from(err: RepositoryError) -> Error {
        Error::SqlxError(match err {
            RepositoryError::UniqueConstraintViolation(e) => e,
            RepositoryError::FKConstraintViolation(e) => e,
            RepositoryError::SqlxError(e) => e,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_lists_every_field() {
        let err = Error::ValidationFailed {
            errors: FieldErrors::from([
                ("views".to_string(), "must be a number".to_string()),
                ("title".to_string(), "missing required value".to_string()),
            ]),
        };

        assert_eq!(
            err.to_string(),
            "Validation failed: title: missing required value; views: must be a number"
        );
    }
}
