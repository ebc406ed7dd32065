//! Record CRUD over collection tables, derived entirely from the catalog.

pub mod hooks;

use std::collections::HashMap;
use std::sync::Arc;

use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use sqlx::sqlite::SqliteConnection;
use sqlx::Row;
use tracing::debug;

use crate::catalog::MetadataStore;
use crate::data_types::{
    timestamp_now, Collection, CollectionSchema, CollectionType, FieldType, Record, RecordId,
    CREATED_AT, EMAIL, ID, PASSWORD_HASH, UPDATED_AT, VERIFIED,
};
use crate::engine::IdGenerator;
use crate::error::{Error, FieldErrors, Result};
use crate::identifier::quote_identifier;
use crate::query::{ColumnSet, ListOptions, ListResult, QueryCompiler};
use crate::repository::interface::Error as RepositoryError;
use crate::repository::sqlite::SqliteRepository;
use crate::sql_value::{bind_all, SqlValue};
use crate::validation::{coerce, to_logical, Mode, ValidationCompiler};

pub use hooks::{AccessChecker, AuthContext, NoHooks, RecordHooks};

lazy_static! {
    static ref RECORD_ID: Regex =
        Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("record id pattern is valid");
    static ref EMAIL_ADDRESS: Regex =
        Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email pattern is valid");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    List,
    View,
    Create,
    Update,
    Delete,
}

impl Action {
    fn name(&self) -> &'static str {
        match self {
            Action::List => "list",
            Action::View => "view",
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }

    fn rule<'a>(&self, collection: &'a Collection) -> Option<&'a str> {
        let rules = &collection.rules;
        match self {
            Action::List => rules.list.as_deref(),
            Action::View => rules.view.as_deref(),
            Action::Create => rules.create.as_deref(),
            Action::Update => rules.update.as_deref(),
            Action::Delete => rules.delete.as_deref(),
        }
    }
}

fn record_not_found(id: &str) -> Error {
    Error::NotFound {
        kind: "Record",
        name: id.to_string(),
    }
}

/// Map a constraint failure of an INSERT/UPDATE/DELETE to the error the caller
/// can act on
fn interpret_write_error(error: RepositoryError, id: &str) -> Error {
    match error {
        RepositoryError::UniqueConstraintViolation(_) => {
            let message = error.database_message().unwrap_or_default();
            // "UNIQUE constraint failed: posts.slug, posts.lang"
            let columns = message
                .split_once(": ")
                .map(|(_, columns)| {
                    columns
                        .split(", ")
                        .filter_map(|c| c.rsplit('.').next())
                        .map(str::to_string)
                        .collect_vec()
                })
                .unwrap_or_default();

            if columns.iter().any(|c| c == ID) {
                return Error::NameConflict {
                    kind: "Record",
                    name: id.to_string(),
                };
            }
            Error::ValidationFailed {
                errors: columns
                    .into_iter()
                    .map(|c| (c, "value must be unique".to_string()))
                    .collect(),
            }
        }
        RepositoryError::FKConstraintViolation(_) => Error::RelationIntegrityError {
            errors: FieldErrors::from([(
                ID.to_string(),
                format!("record {id:?} is still referenced by other records"),
            )]),
        },
        e => e.into(),
    }
}

#[derive(Clone)]
pub struct RecordStore {
    repository: Arc<SqliteRepository>,
    metadata: MetadataStore,
    compiler: QueryCompiler,
    ids: Arc<dyn IdGenerator>,
    access: Option<Arc<dyn AccessChecker>>,
    hooks: Arc<dyn RecordHooks>,
}

impl RecordStore {
    pub fn new(
        repository: Arc<SqliteRepository>,
        metadata: MetadataStore,
        compiler: QueryCompiler,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            repository,
            metadata,
            compiler,
            ids,
            access: None,
            hooks: Arc::new(NoHooks),
        }
    }

    pub fn with_access_checker(mut self, access: Arc<dyn AccessChecker>) -> Self {
        self.access = Some(access);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn RecordHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    fn check_access(
        &self,
        collection: &Collection,
        action: Action,
        auth: &AuthContext,
        record: Option<&Record>,
    ) -> Result<()> {
        let allowed = match &self.access {
            Some(checker) => checker.can_access(action.rule(collection), auth, record),
            None => true,
        };
        if allowed {
            Ok(())
        } else {
            Err(Error::AccessDenied {
                collection: collection.name.clone(),
                action: action.name(),
            })
        }
    }

    /// Validate and normalize the system keys of a payload (id on create, the
    /// auth fields), leaving user fields to the collection's validator
    fn system_values(
        &self,
        collection_type: CollectionType,
        payload: &Record,
        mode: Mode,
        errors: &mut FieldErrors,
    ) -> Vec<(String, SqlValue)> {
        let mut values = vec![];

        if collection_type == CollectionType::Auth {
            match payload.get(EMAIL) {
                Some(Value::String(email)) if EMAIL_ADDRESS.is_match(email.trim()) => {
                    values.push((EMAIL.to_string(), SqlValue::from(email.trim())));
                }
                Some(Value::Null) | None if mode == Mode::Update => {
                    if payload.contains_key(EMAIL) {
                        errors.insert(EMAIL.to_string(), "missing required value".to_string());
                    }
                }
                Some(Value::Null) | None => {
                    errors.insert(EMAIL.to_string(), "missing required value".to_string());
                }
                Some(_) => {
                    errors.insert(EMAIL.to_string(), "must be a valid email address".to_string());
                }
            }

            match payload.get(PASSWORD_HASH) {
                Some(Value::String(hash)) if !hash.is_empty() => {
                    values.push((PASSWORD_HASH.to_string(), SqlValue::from(hash.as_str())));
                }
                None if mode == Mode::Update => {}
                _ => {
                    errors.insert(
                        PASSWORD_HASH.to_string(),
                        "missing required value".to_string(),
                    );
                }
            }

            match payload.get(VERIFIED) {
                Some(Value::Null) | None => {
                    if mode == Mode::Create {
                        values.push((VERIFIED.to_string(), SqlValue::from(false)));
                    }
                }
                Some(raw) => match coerce(FieldType::Boolean, raw) {
                    Ok(value) => values.push((VERIFIED.to_string(), value)),
                    Err(e) => {
                        errors.insert(VERIFIED.to_string(), e.0);
                    }
                },
            }
        }

        values
    }

    fn record_id(&self, payload: &Record, errors: &mut FieldErrors) -> RecordId {
        match payload.get(ID) {
            None | Some(Value::Null) => self.ids.generate(),
            Some(Value::String(id)) if RECORD_ID.is_match(id) => id.clone(),
            Some(_) => {
                errors.insert(
                    ID.to_string(),
                    "must be 1-64 letters, digits, '_' or '-'".to_string(),
                );
                String::new()
            }
        }
    }

    async fn fetch_record(
        &self,
        conn: &mut SqliteConnection,
        schema: &CollectionSchema,
        id: &str,
    ) -> Result<Record> {
        let columns = ColumnSet::new(schema.collection.collection_type, &schema.fields);
        let sql = self.compiler.compile_get(&schema.collection.name, &columns);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| record_not_found(id))?;
        Ok(columns.decode_row(&row)?)
    }

    /// The record as it would read back, for access checks and hooks
    fn candidate(schema: &CollectionSchema, values: &[(String, SqlValue)]) -> Record {
        let columns = ColumnSet::new(schema.collection.collection_type, &schema.fields);
        values
            .iter()
            .filter_map(|(name, value)| {
                let column = columns.get(name)?;
                match to_logical(column.kind.field_type(), value.clone()) {
                    Value::Null => None,
                    logical => Some((name.clone(), logical)),
                }
            })
            .collect()
    }

    pub async fn create(
        &self,
        collection: &str,
        payload: Record,
        auth: &AuthContext,
    ) -> Result<Record> {
        let schema = self.metadata.get_schema(collection).await?;
        let this = &schema.collection;
        let validator = ValidationCompiler::compile(this.collection_type, &schema.fields)?;

        let mut errors = FieldErrors::new();
        let id = self.record_id(&payload, &mut errors);
        let system = self.system_values(this.collection_type, &payload, Mode::Create, &mut errors);
        let validated = match validator.validate(&payload, Mode::Create) {
            Ok(validated) => Some(validated),
            Err(field_errors) => {
                errors.extend(field_errors);
                None
            }
        };
        let validated = match validated {
            Some(validated) if errors.is_empty() => validated,
            _ => return Err(Error::ValidationFailed { errors }),
        };

        let now = timestamp_now();
        let mut values = vec![
            (ID.to_string(), SqlValue::from(id.as_str())),
            (CREATED_AT.to_string(), SqlValue::from(now.as_str())),
            (UPDATED_AT.to_string(), SqlValue::from(now.as_str())),
        ];
        values.extend(system);
        values.extend(validated.values.iter().cloned());

        let candidate = Self::candidate(&schema, &values);
        self.check_access(this, Action::Create, auth, Some(&candidate))?;
        self.hooks
            .before_create(this, &candidate)
            .await
            .map_err(|reason| Error::HookRejected { reason })?;

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_identifier(&this.name),
            values.iter().map(|(name, _)| quote_identifier(name)).join(", "),
            values.iter().map(|_| "?").join(", ")
        );
        let params = values.into_iter().map(|(_, value)| value).collect_vec();

        let mut tx = self.repository.begin().await?;
        validator.check_relations(&mut tx, &validated).await?;
        bind_all(sqlx::query(&sql), &params)
            .execute(&mut *tx)
            .await
            .map_err(|e| interpret_write_error(SqliteRepository::interpret_error(e), &id))?;
        let record = self.fetch_record(&mut tx, &schema, &id).await?;
        tx.commit().await?;

        debug!("Created record {id} in {}", this.name);
        self.hooks.after_create(this, &record).await;
        Ok(record)
    }

    pub async fn get(
        &self,
        collection: &str,
        id: &str,
        auth: &AuthContext,
        expand: &[String],
    ) -> Result<Record> {
        let schema = self.metadata.get_schema(collection).await?;
        let mut record = {
            let mut conn = self.repository.acquire().await?;
            self.fetch_record(&mut conn, &schema, id).await?
        };

        self.check_access(&schema.collection, Action::View, auth, Some(&record))?;
        self.expand(&schema, std::slice::from_mut(&mut record), expand, auth)
            .await?;
        Ok(record)
    }

    pub async fn list(
        &self,
        collection: &str,
        options: &ListOptions,
        auth: &AuthContext,
    ) -> Result<ListResult> {
        let schema = self.metadata.get_schema(collection).await?;
        self.check_access(&schema.collection, Action::List, auth, None)?;

        let columns = ColumnSet::new(schema.collection.collection_type, &schema.fields);
        let compiled = self
            .compiler
            .compile(&schema.collection.name, &columns, options)?;
        // Fail on a bad expand before touching the table
        self.compiler.plan_expand(&columns, &options.expand)?;

        // The count and the page read from the same snapshot
        let (total_items, mut items) = {
            let mut tx = self.repository.begin().await?;
            let total: i64 = bind_all(sqlx::query(&compiled.count_sql), &compiled.params)
                .fetch_one(&mut *tx)
                .await?
                .try_get(0)?;
            let rows = bind_all(sqlx::query(&compiled.sql), &compiled.params)
                .fetch_all(&mut *tx)
                .await?;
            tx.commit().await?;
            let items = rows
                .iter()
                .map(|row| columns.decode_row(row))
                .collect::<Result<Vec<_>, _>>()?;
            (total.max(0) as u64, items)
        };

        self.expand(&schema, &mut items, &options.expand, auth)
            .await?;

        Ok(ListResult::new(
            compiled.page,
            compiled.per_page,
            total_items,
            items,
        ))
    }

    pub async fn update(
        &self,
        collection: &str,
        id: &str,
        payload: Record,
        auth: &AuthContext,
    ) -> Result<Record> {
        let schema = self.metadata.get_schema(collection).await?;
        let this = &schema.collection;
        let validator = ValidationCompiler::compile(this.collection_type, &schema.fields)?;

        let mut errors = FieldErrors::new();
        match payload.get(ID) {
            None => {}
            Some(Value::String(given)) if given == id => {}
            Some(_) => {
                errors.insert(ID.to_string(), "can't be changed".to_string());
            }
        }
        let system = self.system_values(this.collection_type, &payload, Mode::Update, &mut errors);
        let validated = match validator.validate(&payload, Mode::Update) {
            Ok(validated) if errors.is_empty() => validated,
            Ok(_) => return Err(Error::ValidationFailed { errors }),
            Err(field_errors) => {
                errors.extend(field_errors);
                return Err(Error::ValidationFailed { errors });
            }
        };

        let existing = {
            let mut conn = self.repository.acquire().await?;
            self.fetch_record(&mut conn, &schema, id).await?
        };
        self.check_access(this, Action::Update, auth, Some(&existing))?;

        let mut values = system;
        values.extend(validated.values.iter().cloned());
        let changes = Self::candidate(&schema, &values);
        self.hooks
            .before_update(this, &existing, &changes)
            .await
            .map_err(|reason| Error::HookRejected { reason })?;

        values.push((UPDATED_AT.to_string(), SqlValue::from(timestamp_now())));
        let sql = format!(
            "UPDATE {} SET {} WHERE id = ?",
            quote_identifier(&this.name),
            values
                .iter()
                .map(|(name, _)| format!("{} = ?", quote_identifier(name)))
                .join(", ")
        );
        let mut params = values.into_iter().map(|(_, value)| value).collect_vec();
        params.push(SqlValue::from(id));

        let mut tx = self.repository.begin().await?;
        validator.check_relations(&mut tx, &validated).await?;
        let result = bind_all(sqlx::query(&sql), &params)
            .execute(&mut *tx)
            .await
            .map_err(|e| interpret_write_error(SqliteRepository::interpret_error(e), id))?;
        if result.rows_affected() == 0 {
            return Err(record_not_found(id));
        }
        let record = self.fetch_record(&mut tx, &schema, id).await?;
        tx.commit().await?;

        debug!("Updated record {id} in {}", this.name);
        self.hooks.after_update(this, &record).await;
        Ok(record)
    }

    pub async fn delete(&self, collection: &str, id: &str, auth: &AuthContext) -> Result<()> {
        let schema = self.metadata.get_schema(collection).await?;
        let this = &schema.collection;

        let existing = {
            let mut conn = self.repository.acquire().await?;
            self.fetch_record(&mut conn, &schema, id).await?
        };
        self.check_access(this, Action::Delete, auth, Some(&existing))?;
        self.hooks
            .before_delete(this, &existing)
            .await
            .map_err(|reason| Error::HookRejected { reason })?;

        let sql = format!("DELETE FROM {} WHERE id = ?", quote_identifier(&this.name));
        let mut tx = self.repository.begin().await?;
        let result = sqlx::query(&sql)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| interpret_write_error(SqliteRepository::interpret_error(e), id))?;
        if result.rows_affected() == 0 {
            return Err(record_not_found(id));
        }
        tx.commit().await?;

        debug!("Deleted record {id} from {}", this.name);
        self.hooks.after_delete(this, &existing).await;
        Ok(())
    }

    /// Replace relation ids with the records they point at, one lookup per
    /// expanded field. Records the caller may not view stay as plain ids.
    /// Returns the number of lookups run.
    pub async fn expand(
        &self,
        schema: &CollectionSchema,
        records: &mut [Record],
        expand: &[String],
        auth: &AuthContext,
    ) -> Result<usize> {
        let columns = ColumnSet::new(schema.collection.collection_type, &schema.fields);
        let targets = self.compiler.plan_expand(&columns, expand)?;
        let mut lookups = 0;

        for target in targets {
            let ids = records
                .iter()
                .filter_map(|r| r.get(&target.field).and_then(Value::as_str))
                .map(str::to_string)
                .unique()
                .collect_vec();
            if ids.is_empty() {
                continue;
            }

            let target_schema = self.metadata.get_schema_by_id(&target.collection_id).await?;
            let target_columns = ColumnSet::new(
                target_schema.collection.collection_type,
                &target_schema.fields,
            );
            let lookup = self.compiler.compile_lookup(
                &target_schema.collection.name,
                &target_columns,
                &ids,
            );

            let rows = {
                let mut conn = self.repository.acquire().await?;
                bind_all(sqlx::query(&lookup.sql), &lookup.params)
                    .fetch_all(&mut *conn)
                    .await?
            };
            lookups += 1;

            let mut resolved = HashMap::with_capacity(rows.len());
            for row in &rows {
                let record = target_columns.decode_row(row)?;
                let visible = self
                    .check_access(&target_schema.collection, Action::View, auth, Some(&record))
                    .is_ok();
                if let (true, Some(Value::String(id))) = (visible, record.get(ID)) {
                    resolved.insert(id.clone(), record.clone());
                }
            }

            for record in records.iter_mut() {
                let expanded = record
                    .get(&target.field)
                    .and_then(Value::as_str)
                    .and_then(|id| resolved.get(id))
                    .cloned();
                if let Some(expanded) = expanded {
                    record.insert(target.field.clone(), Value::Object(expanded));
                }
            }
        }

        Ok(lookups)
    }
}
