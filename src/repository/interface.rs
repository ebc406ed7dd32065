use std::str::FromStr;

use crate::data_types::{
    Collection, CollectionId, CollectionRules, CollectionType, Field, FieldId, FieldKind,
    FieldType, Timestamp,
};

#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Eq)]
pub struct CollectionRecord {
    pub id: CollectionId,
    pub name: String,
    pub collection_type: String,
    pub list_rule: Option<String>,
    pub view_rule: Option<String>,
    pub create_rule: Option<String>,
    pub update_rule: Option<String>,
    pub delete_rule: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Eq)]
pub struct FieldRecord {
    pub id: FieldId,
    pub collection_id: CollectionId,
    pub name: String,
    pub field_type: String,
    pub required: i64,
    pub options: String,
    pub position: i64,
    pub created_at: Timestamp,
}

/// Every field in the catalog joined with the name of its collection
#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Eq)]
pub struct AllFieldsResult {
    pub collection_name: String,
    #[sqlx(flatten)]
    pub field: FieldRecord,
}

/// An index or trigger as recorded in `sqlite_master`
#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Eq)]
pub struct SchemaObjectResult {
    pub object_type: String,
    pub name: String,
    pub sql: String,
}

/// Catalog writes that have to commit in the same transaction as a table rebuild
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogWrite {
    InsertField(FieldRecord),
    UpdateField(FieldRecord),
    DeleteField(FieldId),
    TouchCollection {
        id: CollectionId,
        updated_at: Timestamp,
    },
}

/// Wrapper for conversion of database-specific error codes into actual errors
#[derive(Debug)]
pub enum Error {
    UniqueConstraintViolation(sqlx::Error),
    FKConstraintViolation(sqlx::Error),

    // All other errors
    SqlxError(sqlx::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::SqlxError(sqlx::Error::RowNotFound))
    }

    /// Message of the underlying database error, if there is one
    pub fn database_message(&self) -> Option<&str> {
        let inner = match self {
            Error::UniqueConstraintViolation(e)
            | Error::FKConstraintViolation(e)
            | Error::SqlxError(e) => e,
        };
        match inner {
            sqlx::Error::Database(d) => Some(d.message()),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::SqlxError(err)
    }
}

impl CollectionRecord {
    pub fn from_collection(collection: &Collection) -> Self {
        let rules = &collection.rules;
        Self {
            id: collection.id.clone(),
            name: collection.name.clone(),
            collection_type: collection.collection_type.to_string(),
            list_rule: rules.list.clone(),
            view_rule: rules.view.clone(),
            create_rule: rules.create.clone(),
            update_rule: rules.update.clone(),
            delete_rule: rules.delete.clone(),
            created_at: collection.created_at.clone(),
            updated_at: collection.updated_at.clone(),
        }
    }

    pub fn into_collection(self) -> Collection {
        // Rows are only ever written through `from_collection`
        let collection_type =
            CollectionType::from_str(&self.collection_type).unwrap_or_default();

        Collection {
            id: self.id,
            name: self.name,
            collection_type,
            rules: CollectionRules {
                list: self.list_rule,
                view: self.view_rule,
                create: self.create_rule,
                update: self.update_rule,
                delete: self.delete_rule,
            },
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

impl FieldRecord {
    pub fn from_field(field: &Field) -> serde_json::Result<Self> {
        Ok(Self {
            id: field.id.clone(),
            collection_id: field.collection_id.clone(),
            name: field.name.clone(),
            field_type: field.kind.field_type().to_string(),
            required: field.required as i64,
            options: field.kind.options_json()?,
            position: field.position,
            created_at: field.created_at.clone(),
        })
    }

    pub fn into_field(self) -> serde_json::Result<Field> {
        let field_type = FieldType::from_str(&self.field_type).map_err(|e| {
            serde::de::Error::custom(format!("unknown field type {:?}: {e}", self.field_type))
        })?;
        let kind = FieldKind::from_parts(field_type, &self.options)?;

        Ok(Field {
            id: self.id,
            collection_id: self.collection_id,
            name: self.name,
            required: self.required != 0,
            kind,
            position: self.position,
            created_at: self.created_at,
        })
    }
}
