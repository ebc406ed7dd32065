//! Payload validation compiled from catalog field definitions at runtime.

pub mod field;

use serde_json::Value;
use sqlx::sqlite::SqliteConnection;
use tracing::debug;

use crate::data_types::{CollectionId, CollectionType, Field, FieldType, Record, RecordId};
use crate::error::{Error, FieldErrors, Result};
use crate::identifier::quote_identifier;
use crate::repository::sqlite::SqliteRepository;
use crate::sql_value::SqlValue;

pub use field::{coerce, normalize_datetime, to_logical, FieldError, FieldSpec};

const MISSING_REQUIRED: &str = "missing required value";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Every required field has to be present
    Create,
    /// Only the keys present in the payload are checked
    Update,
}

/// A relation value that still has to be resolved against its target table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationRef {
    pub field: String,
    pub collection_id: CollectionId,
    pub id: RecordId,
}

/// Output of a successful validation: storage-ready values in field order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Validated {
    pub values: Vec<(String, SqlValue)>,
    pub relations: Vec<RelationRef>,
}

impl Validated {
    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.values
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }
}

#[derive(Debug, Clone)]
struct CompiledField {
    name: String,
    required: bool,
    spec: FieldSpec,
}

/// Validator for the user-defined fields of one collection
#[derive(Debug, Clone)]
pub struct Validator {
    collection_type: CollectionType,
    fields: Vec<CompiledField>,
}

pub struct ValidationCompiler;

impl ValidationCompiler {
    /// Build a validator from the current field list of a collection.
    /// Fails with `InvalidFieldOptions` if any stored options can't be compiled.
    pub fn compile(collection_type: CollectionType, fields: &[Field]) -> Result<Validator> {
        let fields = fields
            .iter()
            .map(|field| {
                let spec = FieldSpec::compile(&field.kind).map_err(|e| {
                    Error::InvalidFieldOptions {
                        field: field.name.clone(),
                        reason: e.0,
                    }
                })?;
                Ok(CompiledField {
                    name: field.name.clone(),
                    required: field.required,
                    spec,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Validator {
            collection_type,
            fields,
        })
    }
}

fn is_blank(field_type: FieldType, raw: &Value) -> bool {
    match (field_type, raw) {
        (FieldType::Text | FieldType::Relation | FieldType::File, Value::String(s)) => {
            s.trim().is_empty()
        }
        _ => false,
    }
}

impl Validator {
    /// Check every user key of `payload`, collecting one reason per failing field.
    /// System keys are left to the caller.
    pub fn validate(&self, payload: &Record, mode: Mode) -> Result<Validated, FieldErrors> {
        let mut errors = FieldErrors::new();
        let mut validated = Validated::default();

        for key in payload.keys() {
            if self.collection_type.is_system_field(key) {
                continue;
            }
            if !self.fields.iter().any(|f| &f.name == key) {
                errors.insert(key.clone(), "unknown field".to_string());
            }
        }

        for field in &self.fields {
            let field_type = field.spec.field_type();

            let raw = match payload.get(&field.name) {
                Some(raw) => raw,
                None => {
                    if mode == Mode::Create && field.required {
                        errors.insert(field.name.clone(), MISSING_REQUIRED.to_string());
                    }
                    continue;
                }
            };

            if raw.is_null() || is_blank(field_type, raw) {
                if field.required {
                    errors.insert(field.name.clone(), MISSING_REQUIRED.to_string());
                    continue;
                }
                // An empty id or file name clears the value
                if raw.is_null() || field_type != FieldType::Text {
                    validated.values.push((field.name.clone(), SqlValue::Null));
                    continue;
                }
            }

            match field.spec.validate(raw) {
                Ok(value) => {
                    if let (FieldSpec::Relation { collection_id }, SqlValue::Text(id)) =
                        (&field.spec, &value)
                    {
                        validated.relations.push(RelationRef {
                            field: field.name.clone(),
                            collection_id: collection_id.clone(),
                            id: id.clone(),
                        });
                    }
                    validated.values.push((field.name.clone(), value));
                }
                Err(e) => {
                    errors.insert(field.name.clone(), e.0);
                }
            }
        }

        if errors.is_empty() {
            Ok(validated)
        } else {
            Err(errors)
        }
    }

    /// Make sure every relation value points at an existing record. Runs on the
    /// connection of the mutation so that the check and the write see the same data.
    pub async fn check_relations(
        &self,
        conn: &mut SqliteConnection,
        validated: &Validated,
    ) -> Result<()> {
        let mut errors = FieldErrors::new();

        for relation in &validated.relations {
            let target =
                match SqliteRepository::get_collection_by_id(&mut *conn, &relation.collection_id)
                    .await
                {
                    Ok(target) => target,
                    Err(e) if e.is_not_found() => {
                        errors.insert(
                            relation.field.clone(),
                            "target collection no longer exists".to_string(),
                        );
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };

            let query = format!(
                "SELECT 1 FROM {} WHERE id = $1",
                quote_identifier(&target.name)
            );
            let found = sqlx::query(&query)
                .bind(&relation.id)
                .fetch_optional(&mut *conn)
                .await?;

            if found.is_none() {
                debug!(
                    "Dangling reference {}.{} -> {}",
                    target.name, relation.field, relation.id
                );
                errors.insert(
                    relation.field.clone(),
                    format!("no record {:?} in collection {:?}", relation.id, target.name),
                );
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::RelationIntegrityError { errors })
        }
    }
}
