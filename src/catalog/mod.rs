//! The metadata catalog: collections and their fields, stored in the database
//! next to the tables they describe. Every change to the catalog commits in
//! the same transaction as the DDL that makes the physical table match it.

pub mod plan;
mod repository;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteConnection;
use sqlx::Connection;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

use crate::data_types::{
    timestamp_now, Collection, CollectionId, CollectionRules, CollectionSchema,
    CollectionType, Field, FieldDefinition,
};
use crate::engine::IdGenerator;
use crate::error::{Error, FieldErrors, Result};
use crate::identifier::{
    quote_identifier, validate_collection_name, validate_identifier, SHADOW_PREFIX,
};
use crate::query::ColumnSet;
use crate::repository::interface::{
    CatalogWrite, CollectionRecord, Error as RepositoryError, FieldRecord,
};
use crate::repository::sqlite::SqliteRepository;
use crate::schema::{ColumnRename, MigrationPlan, SchemaSynchronizer, FIELDS_CHANGED};
use crate::sql_value::SqlValue;
use crate::validation::FieldSpec;

use plan::{classify, FieldChange};
use repository::{
    collection_not_found, field_not_found, load_collection, load_fields, load_schema,
    relation_targets, resolve_definition,
};

/// Published after a structural change has been committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaEvent {
    CollectionCreated {
        id: CollectionId,
        name: String,
    },
    CollectionUpdated {
        id: CollectionId,
        name: String,
        previous_name: String,
    },
    CollectionDeleted {
        id: CollectionId,
        name: String,
    },
    FieldsChanged {
        id: CollectionId,
        name: String,
    },
    IndexesChanged {
        id: CollectionId,
        name: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionUpdate {
    /// Renames the table along with the collection
    pub name: Option<String>,
    pub rules: Option<CollectionRules>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub sql: String,
}

#[derive(Clone)]
pub struct MetadataStore {
    repository: Arc<SqliteRepository>,
    synchronizer: SchemaSynchronizer,
    ids: Arc<dyn IdGenerator>,
    events: broadcast::Sender<SchemaEvent>,
    /// Held for the whole of a structural change, from reading the schema to commit
    schema_lock: Arc<Mutex<()>>,
}

fn check_definitions(
    collection_type: CollectionType,
    definitions: &[&FieldDefinition],
) -> Result<()> {
    let mut seen = HashSet::new();
    for definition in definitions {
        validate_identifier(&definition.name)?;
        if collection_type.is_system_field(&definition.name) {
            return Err(Error::ReservedFieldName {
                name: definition.name.clone(),
            });
        }
        if !seen.insert(definition.name.to_ascii_lowercase()) {
            return Err(Error::NameConflict {
                kind: "Field",
                name: definition.name.clone(),
            });
        }
        FieldSpec::compile(&definition.kind).map_err(|e| Error::InvalidFieldOptions {
            field: definition.name.clone(),
            reason: e.0,
        })?;
    }
    Ok(())
}

/// Validate a default against the (new) field definition
fn compile_default(definition: &FieldDefinition, default: Option<&Value>) -> Result<Option<SqlValue>> {
    let default = match default {
        Some(value) if !value.is_null() => value,
        _ => return Ok(None),
    };
    let spec = FieldSpec::compile(&definition.kind).map_err(|e| Error::InvalidFieldOptions {
        field: definition.name.clone(),
        reason: e.0,
    })?;
    spec.validate(default)
        .map(Some)
        .map_err(|e| Error::single_field(&definition.name, format!("invalid default: {e}")))
}

/// Fails when the catalog no longer matches the fields a change was planned from
async fn ensure_fields_unchanged(
    conn: &mut SqliteConnection,
    schema: &CollectionSchema,
) -> Result<()> {
    let expected = schema
        .fields
        .iter()
        .map(FieldRecord::from_field)
        .collect::<serde_json::Result<Vec<_>>>()?;
    if SqliteRepository::fields_match(conn, &schema.collection.id, &expected).await? {
        Ok(())
    } else {
        Err(Error::MigrationError {
            table: schema.collection.name.clone(),
            cause: FIELDS_CHANGED.to_string(),
        })
    }
}

async fn table_exists(conn: &mut SqliteConnection, name: &str) -> Result<bool> {
    Ok(SqliteRepository::schema_object_exists(conn, "table", name).await?)
}

impl MetadataStore {
    pub fn new(
        repository: Arc<SqliteRepository>,
        ids: Arc<dyn IdGenerator>,
        events: broadcast::Sender<SchemaEvent>,
        schema_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            synchronizer: SchemaSynchronizer::new(repository.clone()),
            repository,
            ids,
            events,
            schema_lock,
        }
    }

    fn publish(&self, event: SchemaEvent) {
        debug!("Publishing schema event {event:?}");
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    fn new_field(&self, collection_id: &str, definition: FieldDefinition, position: i64) -> Field {
        Field {
            id: self.ids.generate(),
            collection_id: collection_id.to_string(),
            name: definition.name,
            required: definition.required,
            kind: definition.kind,
            position,
            created_at: timestamp_now(),
        }
    }

    pub async fn create_collection(
        &self,
        name: &str,
        collection_type: CollectionType,
        fields: Vec<FieldDefinition>,
        rules: Option<CollectionRules>,
    ) -> Result<CollectionSchema> {
        let _guard = self.schema_lock.lock().await;
        validate_collection_name(name)?;
        check_definitions(collection_type, &fields.iter().collect_vec())?;

        let now = timestamp_now();
        let collection = Collection {
            id: self.ids.generate(),
            name: name.to_string(),
            collection_type,
            rules: rules.unwrap_or_default(),
            created_at: now.clone(),
            updated_at: now,
        };

        let mut tx = self.repository.begin().await?;

        if SqliteRepository::get_collection(&mut tx, name).await.is_ok()
            || table_exists(&mut tx, name).await?
        {
            return Err(Error::NameConflict {
                kind: "Collection",
                name: name.to_string(),
            });
        }

        let mut targets = HashMap::new();
        let mut resolved = Vec::with_capacity(fields.len());
        for (position, definition) in fields.into_iter().enumerate() {
            let definition = resolve_definition(
                &mut tx,
                definition,
                (&collection.id, &collection.name),
                &mut targets,
            )
            .await?;
            resolved.push(self.new_field(&collection.id, definition, position as i64));
        }

        SqliteRepository::insert_collection(&mut tx, &CollectionRecord::from_collection(&collection))
            .await
            .map_err(|e| match e {
                RepositoryError::UniqueConstraintViolation(_) => Error::NameConflict {
                    kind: "Collection",
                    name: name.to_string(),
                },
                e => e.into(),
            })?;
        let records = resolved
            .iter()
            .map(FieldRecord::from_field)
            .collect::<serde_json::Result<Vec<_>>>()?;
        SqliteRepository::insert_fields(&mut tx, &records).await?;
        SchemaSynchronizer::create_table(&mut tx, name, collection_type, &resolved, &targets)
            .await?;

        tx.commit().await?;

        info!(
            "Created {collection_type} collection {name} with {} field(s)",
            resolved.len()
        );
        self.publish(SchemaEvent::CollectionCreated {
            id: collection.id.clone(),
            name: collection.name.clone(),
        });

        Ok(CollectionSchema {
            collection,
            fields: resolved,
        })
    }

    pub async fn get_collection(&self, name: &str) -> Result<Collection> {
        let mut conn = self.repository.acquire().await?;
        load_collection(&mut conn, name).await
    }

    pub async fn get_collection_by_id(&self, id: &str) -> Result<Collection> {
        let mut conn = self.repository.acquire().await?;
        SqliteRepository::get_collection_by_id(&mut conn, id)
            .await
            .map(CollectionRecord::into_collection)
            .map_err(|e| match e {
                RepositoryError::SqlxError(sqlx::error::Error::RowNotFound) => {
                    collection_not_found(id)
                }
                e => e.into(),
            })
    }

    pub async fn get_fields(&self, name: &str) -> Result<Vec<Field>> {
        Ok(self.get_schema(name).await?.fields)
    }

    pub async fn get_schema(&self, name: &str) -> Result<CollectionSchema> {
        let mut conn = self.repository.acquire().await?;
        load_schema(&mut conn, name).await
    }

    pub async fn list_collections(&self) -> Result<Vec<CollectionSchema>> {
        let mut conn = self.repository.acquire().await?;
        let collections = SqliteRepository::list_collections(&mut conn).await?;
        let all_fields = SqliteRepository::list_all_fields(&mut conn).await?;

        let mut fields_by_collection: HashMap<CollectionId, Vec<Field>> = HashMap::new();
        for (collection_id, fields) in &all_fields
            .into_iter()
            .group_by(|f| f.field.collection_id.clone())
        {
            let fields = fields
                .map(|f| f.field.into_field())
                .collect::<serde_json::Result<Vec<_>>>()?;
            fields_by_collection
                .entry(collection_id)
                .or_default()
                .extend(fields);
        }

        Ok(collections
            .into_iter()
            .map(|record| {
                let fields = fields_by_collection.remove(&record.id).unwrap_or_default();
                CollectionSchema {
                    collection: record.into_collection(),
                    fields,
                }
            })
            .collect())
    }

    pub async fn update_collection(
        &self,
        name: &str,
        update: CollectionUpdate,
    ) -> Result<Collection> {
        let _guard = self.schema_lock.lock().await;
        let mut tx = self.repository.begin().await?;
        let mut collection = load_collection(&mut tx, name).await?;
        let previous_name = collection.name.clone();

        if let Some(new_name) = update.name.filter(|n| *n != collection.name) {
            validate_collection_name(&new_name)?;

            let case_only = new_name.eq_ignore_ascii_case(&collection.name);
            if !case_only
                && (SqliteRepository::get_collection(&mut tx, &new_name).await.is_ok()
                    || table_exists(&mut tx, &new_name).await?)
            {
                return Err(Error::NameConflict {
                    kind: "Collection",
                    name: new_name,
                });
            }

            if case_only {
                // SQLite compares table names case-insensitively
                let temporary = format!("{SHADOW_PREFIX}{new_name}");
                SchemaSynchronizer::rename_table(&mut tx, &collection.name, &temporary).await?;
                SchemaSynchronizer::rename_table(&mut tx, &temporary, &new_name).await?;
            } else {
                SchemaSynchronizer::rename_table(&mut tx, &collection.name, &new_name).await?;
            }
            collection.name = new_name;
        }

        if let Some(rules) = update.rules {
            collection.rules = rules;
        }
        collection.updated_at = timestamp_now();

        SqliteRepository::update_collection(&mut tx, &CollectionRecord::from_collection(&collection))
            .await
            .map_err(|e| match e {
                RepositoryError::UniqueConstraintViolation(_) => Error::NameConflict {
                    kind: "Collection",
                    name: collection.name.clone(),
                },
                e => e.into(),
            })?;

        tx.commit().await?;

        if previous_name != collection.name {
            info!("Renamed collection {previous_name} to {}", collection.name);
        }
        self.publish(SchemaEvent::CollectionUpdated {
            id: collection.id.clone(),
            name: collection.name.clone(),
            previous_name,
        });
        Ok(collection)
    }

    /// Drops the table and the catalog rows. Refused while relation fields of
    /// other collections point at it.
    pub async fn delete_collection(&self, name: &str) -> Result<()> {
        let _guard = self.schema_lock.lock().await;
        let mut conn = self.repository.acquire().await?;

        // Dropping a table runs an implicit DELETE, which self-referencing rows would trip on
        SchemaSynchronizer::disable_foreign_keys(&mut conn).await?;
        let result = async {
            let mut tx = conn.begin().await?;
            let collection = load_collection(&mut tx, name).await?;

            let referencing = SqliteRepository::find_relations_to(&mut tx, &collection.id).await?;
            if !referencing.is_empty() {
                let errors: FieldErrors = referencing
                    .into_iter()
                    .map(|(collection_name, field_name)| {
                        (
                            format!("{collection_name}.{field_name}"),
                            format!("references collection {:?}", collection.name),
                        )
                    })
                    .collect();
                return Err(Error::RelationIntegrityError { errors });
            }

            SqliteRepository::delete_collection(&mut tx, &collection.id).await?;
            SchemaSynchronizer::drop_table(&mut tx, &collection.name).await?;
            tx.commit().await?;
            Ok::<_, Error>(collection)
        }
        .await;
        let restored = SchemaSynchronizer::enable_foreign_keys(&mut conn).await;
        let collection = result?;
        restored?;

        info!("Deleted collection {}", collection.name);
        self.publish(SchemaEvent::CollectionDeleted {
            id: collection.id,
            name: collection.name,
        });
        Ok(())
    }

    /// Optional fields are added in place; required ones rebuild the table,
    /// filling existing rows with `default`
    pub async fn add_field(
        &self,
        collection: &str,
        definition: FieldDefinition,
        default: Option<Value>,
    ) -> Result<Field> {
        let _guard = self.schema_lock.lock().await;
        let mut conn = self.repository.acquire().await?;
        let schema = load_schema(&mut conn, collection).await?;
        let this = &schema.collection;

        let mut all = schema.fields.iter().map(FieldDefinition::from).collect_vec();
        all.push(definition.clone());
        check_definitions(this.collection_type, &all.iter().collect_vec())?;

        let mut targets = relation_targets(&mut conn, this, &schema.fields).await?;
        let definition =
            resolve_definition(&mut conn, definition, (&this.id, &this.name), &mut targets).await?;
        drop(conn);

        let default = compile_default(&definition, default.as_ref())?;
        let position = schema.fields.iter().map(|f| f.position + 1).max().unwrap_or(0);
        let field = self.new_field(&this.id, definition, position);
        let touch = CatalogWrite::TouchCollection {
            id: this.id.clone(),
            updated_at: timestamp_now(),
        };

        if field.required {
            let mut new_fields = schema.fields.clone();
            new_fields.push(field.clone());
            let plan = MigrationPlan {
                collection_id: this.id.clone(),
                table: this.name.clone(),
                collection_type: this.collection_type,
                old_fields: schema.fields.clone(),
                new_fields,
                rename: None,
                defaults: default
                    .map(|d| HashMap::from([(field.name.clone(), d)]))
                    .unwrap_or_default(),
                targets,
            };
            self.synchronizer
                .migrate_table(&plan, &[CatalogWrite::InsertField(FieldRecord::from_field(&field)?), touch])
                .await?;
        } else {
            let mut tx = self.repository.begin().await?;
            ensure_fields_unchanged(&mut tx, &schema).await?;
            SqliteRepository::insert_fields(&mut tx, &[FieldRecord::from_field(&field)?]).await?;
            SchemaSynchronizer::add_column(&mut tx, &this.name, &field, &targets).await?;
            if let Some(default) = default {
                let sql = format!(
                    "UPDATE {} SET {} = $1",
                    quote_identifier(&this.name),
                    quote_identifier(&field.name)
                );
                default.bind(sqlx::query(&sql)).execute(&mut *tx).await?;
            }
            SqliteRepository::apply(&mut tx, &touch).await?;
            tx.commit().await?;
        }

        info!("Added field {} to collection {}", field.name, this.name);
        self.publish(SchemaEvent::FieldsChanged {
            id: this.id.clone(),
            name: this.name.clone(),
        });
        Ok(field)
    }

    /// Options-only changes touch the catalog alone, a plain rename is done in
    /// place and anything else rebuilds the table
    pub async fn update_field(
        &self,
        collection: &str,
        field_name: &str,
        definition: FieldDefinition,
        default: Option<Value>,
    ) -> Result<Field> {
        let _guard = self.schema_lock.lock().await;
        let mut conn = self.repository.acquire().await?;
        let schema = load_schema(&mut conn, collection).await?;
        let this = &schema.collection;
        let old = schema
            .field(field_name)
            .cloned()
            .ok_or_else(|| field_not_found(field_name))?;

        let all = schema
            .fields
            .iter()
            .map(|f| {
                if f.id == old.id {
                    definition.clone()
                } else {
                    FieldDefinition::from(f)
                }
            })
            .collect_vec();
        check_definitions(this.collection_type, &all.iter().collect_vec())?;

        let mut targets = relation_targets(&mut conn, this, &schema.fields).await?;
        let definition =
            resolve_definition(&mut conn, definition, (&this.id, &this.name), &mut targets).await?;
        drop(conn);

        let default = compile_default(&definition, default.as_ref())?;
        let change = classify(&old, &definition);
        let field = Field {
            name: definition.name,
            required: definition.required,
            kind: definition.kind,
            ..old.clone()
        };
        let writes = [
            CatalogWrite::UpdateField(FieldRecord::from_field(&field)?),
            CatalogWrite::TouchCollection {
                id: this.id.clone(),
                updated_at: timestamp_now(),
            },
        ];

        match change {
            FieldChange::MetadataOnly | FieldChange::Rename => {
                let mut tx = self.repository.begin().await?;
                ensure_fields_unchanged(&mut tx, &schema).await?;
                if change == FieldChange::Rename {
                    SchemaSynchronizer::rename_column(&mut tx, &this.name, &old.name, &field.name)
                        .await?;
                }
                for write in &writes {
                    SqliteRepository::apply(&mut tx, write).await?;
                }
                tx.commit().await?;
            }
            FieldChange::Rebuild { rename } => {
                let new_fields = schema
                    .fields
                    .iter()
                    .map(|f| if f.id == field.id { field.clone() } else { f.clone() })
                    .collect();
                let plan = MigrationPlan {
                    collection_id: this.id.clone(),
                    table: this.name.clone(),
                    collection_type: this.collection_type,
                    old_fields: schema.fields.clone(),
                    new_fields,
                    rename: rename.then(|| ColumnRename {
                        field_id: field.id.clone(),
                        from: old.name.clone(),
                        to: field.name.clone(),
                    }),
                    defaults: default
                        .map(|d| HashMap::from([(field.name.clone(), d)]))
                        .unwrap_or_default(),
                    targets,
                };
                self.synchronizer.migrate_table(&plan, &writes).await?;
            }
        }

        info!(
            "Updated field {} of collection {} ({change:?})",
            field.name, this.name
        );
        self.publish(SchemaEvent::FieldsChanged {
            id: this.id.clone(),
            name: this.name.clone(),
        });
        Ok(field)
    }

    pub async fn remove_field(&self, collection: &str, field_name: &str) -> Result<()> {
        let _guard = self.schema_lock.lock().await;
        let mut conn = self.repository.acquire().await?;
        let schema = load_schema(&mut conn, collection).await?;
        let this = &schema.collection;
        let field = schema
            .field(field_name)
            .cloned()
            .ok_or_else(|| field_not_found(field_name))?;
        let new_fields = schema
            .fields
            .iter()
            .filter(|f| f.id != field.id)
            .cloned()
            .collect_vec();
        let targets = relation_targets(&mut conn, this, &new_fields).await?;
        drop(conn);

        let plan = MigrationPlan {
            collection_id: this.id.clone(),
            table: this.name.clone(),
            collection_type: this.collection_type,
            old_fields: schema.fields.clone(),
            new_fields,
            rename: None,
            defaults: HashMap::new(),
            targets,
        };
        let writes = [
            CatalogWrite::DeleteField(field.id.clone()),
            CatalogWrite::TouchCollection {
                id: this.id.clone(),
                updated_at: timestamp_now(),
            },
        ];
        self.synchronizer.migrate_table(&plan, &writes).await?;

        info!("Removed field {} from collection {}", field.name, this.name);
        self.publish(SchemaEvent::FieldsChanged {
            id: this.id.clone(),
            name: this.name.clone(),
        });
        Ok(())
    }

    /// Secondary index over `fields`; it survives table rebuilds until one of
    /// its columns is removed
    pub async fn create_index(
        &self,
        collection: &str,
        index_name: &str,
        fields: &[&str],
        unique: bool,
    ) -> Result<()> {
        let _guard = self.schema_lock.lock().await;
        let mut tx = self.repository.begin().await?;
        let schema = load_schema(&mut tx, collection).await?;
        let this = &schema.collection;

        let columns = ColumnSet::new(this.collection_type, &schema.fields);
        let names = fields
            .iter()
            .map(|name| {
                columns
                    .get(name)
                    .map(|c| c.name.clone())
                    .ok_or_else(|| field_not_found(name))
            })
            .collect::<Result<Vec<_>>>()?;

        SchemaSynchronizer::create_index(&mut tx, &this.name, index_name, &names, unique)
            .await
            .map_err(|e| match e {
                Error::SqlxError(sqlx::Error::Database(ref d))
                    if d.message().contains("UNIQUE constraint failed") =>
                {
                    Error::MigrationError {
                        table: this.name.clone(),
                        cause: format!("existing rows violate unique index {index_name}"),
                    }
                }
                e => e,
            })?;
        SqliteRepository::touch_collection(&mut tx, &this.id, &timestamp_now()).await?;
        tx.commit().await?;

        info!("Created index {index_name} on collection {}", this.name);
        self.publish(SchemaEvent::IndexesChanged {
            id: this.id.clone(),
            name: this.name.clone(),
        });
        Ok(())
    }

    pub async fn drop_index(&self, collection: &str, index_name: &str) -> Result<()> {
        let _guard = self.schema_lock.lock().await;
        let mut tx = self.repository.begin().await?;
        let this = load_collection(&mut tx, collection).await?;

        let index = SqliteRepository::list_schema_objects(&mut tx, &this.name)
            .await?
            .into_iter()
            .find(|o| o.object_type == "index" && o.name.eq_ignore_ascii_case(index_name))
            .ok_or_else(|| Error::NotFound {
                kind: "Index",
                name: index_name.to_string(),
            })?;

        SchemaSynchronizer::drop_index(&mut tx, &index.name).await?;
        SqliteRepository::touch_collection(&mut tx, &this.id, &timestamp_now()).await?;
        tx.commit().await?;

        info!("Dropped index {} on collection {}", index.name, this.name);
        self.publish(SchemaEvent::IndexesChanged {
            id: this.id,
            name: this.name,
        });
        Ok(())
    }

    pub async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexInfo>> {
        let mut conn = self.repository.acquire().await?;
        let this = load_collection(&mut conn, collection).await?;

        Ok(SqliteRepository::list_schema_objects(&mut conn, &this.name)
            .await?
            .into_iter()
            .filter(|o| o.object_type == "index")
            .map(|o| IndexInfo {
                name: o.name,
                sql: o.sql,
            })
            .collect())
    }

    pub async fn get_schema_by_id(&self, id: &str) -> Result<CollectionSchema> {
        let collection = self.get_collection_by_id(id).await?;
        let mut conn = self.repository.acquire().await?;
        let fields = load_fields(&mut conn, &collection.id).await?;
        Ok(CollectionSchema { collection, fields })
    }
}
