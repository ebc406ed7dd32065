//! Shadow-table rebuild, for changes SQLite's ALTER TABLE can't express.
//!
//! The whole rebuild, including the catalog writes describing it, runs in one
//! transaction on a connection with foreign key enforcement switched off. The
//! pragma is a no-op inside a transaction, so it's flipped before BEGIN and
//! restored after COMMIT/ROLLBACK whatever the outcome.

use std::collections::HashMap;

use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use sqlx::sqlite::SqliteConnection;
use sqlx::{Connection, Row};
use tracing::{info, warn};

use crate::data_types::{CollectionId, CollectionType, Field, FieldId};
use crate::error::{Error, Result};
use crate::identifier::{quote_identifier, SHADOW_PREFIX};
use crate::repository::interface::{CatalogWrite, FieldRecord, SchemaObjectResult};
use crate::repository::sqlite::SqliteRepository;
use crate::sql_value::{bind_all, SqlValue};
use crate::validation::{to_logical, FieldSpec};

use super::{execute_ddl, SchemaSynchronizer};

const COPY_BATCH_SIZE: i64 = 500;

/// Cause reported when the catalog moved on after a change was planned
pub const FIELDS_CHANGED: &str = "fields of the collection changed while the change was planned";

lazy_static! {
    // Trigger name and table are skipped; the event clause and the body are kept
    static ref TRIGGER_HEADER: Regex = Regex::new(
        r#"(?is)^\s*CREATE\s+(?:TEMP(?:ORARY)?\s+)?TRIGGER\s+(?:IF\s+NOT\s+EXISTS\s+)?(?:"(?:[^"]|"")*"|\S+)(.*?)\bON\s+(?:"(?:[^"]|"")*"|\S+)(.*)$"#
    )
    .expect("trigger pattern is valid");
}

/// A field renamed as part of the same rebuild. The column is renamed in place
/// before the copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRename {
    pub field_id: FieldId,
    pub from: String,
    pub to: String,
}

/// Old and new shape of a table. Fields are matched by id, so a field present
/// in both lists keeps its data; one missing from `new_fields` is removed.
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    pub collection_id: CollectionId,
    pub table: String,
    pub collection_type: CollectionType,
    pub old_fields: Vec<Field>,
    pub new_fields: Vec<Field>,
    pub rename: Option<ColumnRename>,
    /// Values for rows that would otherwise be NULL in a required column, by field name
    pub defaults: HashMap<String, SqlValue>,
    /// Collection id -> table name, for relation columns
    pub targets: HashMap<CollectionId, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub rows_copied: u64,
    pub indexes_recreated: usize,
    /// Indexes and triggers that referenced a removed column
    pub indexes_dropped: usize,
}

/// Where a new column gets its value from
#[derive(Debug)]
enum Source {
    /// Index into the SELECT list of the old table
    Copy(usize),
    Convert {
        index: usize,
        old: Field,
        spec: FieldSpec,
    },
    Missing,
}

#[derive(Debug)]
struct ColumnMapping {
    name: String,
    source: Source,
    required: bool,
    default: Option<SqlValue>,
}

impl MigrationPlan {
    fn old_column_name<'a>(&'a self, field: &'a Field) -> &'a str {
        match &self.rename {
            Some(rename) if rename.field_id == field.id => &rename.to,
            _ => &field.name,
        }
    }

    /// Columns read from the old table: system columns, then kept fields
    fn select_columns(&self) -> Vec<String> {
        let system = self
            .collection_type
            .system_fields()
            .iter()
            .map(|s| s.to_string());
        let kept = self
            .old_fields
            .iter()
            .filter(|old| self.new_fields.iter().any(|new| new.id == old.id))
            .map(|old| self.old_column_name(old).to_string());
        system.chain(kept).collect()
    }

    fn removed_columns(&self) -> Vec<String> {
        self.old_fields
            .iter()
            .filter(|old| !self.new_fields.iter().any(|new| new.id == old.id))
            .map(|old| self.old_column_name(old).to_string())
            .collect()
    }

    fn mappings(&self, select: &[String]) -> Result<Vec<ColumnMapping>> {
        let system = self
            .collection_type
            .system_fields()
            .iter()
            .enumerate()
            .map(|(index, name)| ColumnMapping {
                name: name.to_string(),
                source: Source::Copy(index),
                required: false,
                default: None,
            })
            .collect_vec();

        let mut user = Vec::with_capacity(self.new_fields.len());
        for new in &self.new_fields {
            let old = self.old_fields.iter().find(|old| old.id == new.id);
            let source = match old {
                None => Source::Missing,
                Some(old) => {
                    let old_name = self.old_column_name(old);
                    let index = select
                        .iter()
                        .position(|c| c == old_name)
                        .ok_or_else(|| self.error(format!("column {old_name:?} not found")))?;

                    if old.kind.field_type() == new.kind.field_type() {
                        Source::Copy(index)
                    } else {
                        let spec = FieldSpec::compile(&new.kind).map_err(|e| {
                            Error::InvalidFieldOptions {
                                field: new.name.clone(),
                                reason: e.0,
                            }
                        })?;
                        Source::Convert {
                            index,
                            old: old.clone(),
                            spec,
                        }
                    }
                }
            };

            user.push(ColumnMapping {
                name: new.name.clone(),
                source,
                required: new.required,
                default: self.defaults.get(&new.name).cloned(),
            });
        }

        Ok(system.into_iter().chain(user).collect())
    }

    fn error(&self, cause: impl Into<String>) -> Error {
        Error::MigrationError {
            table: self.table.clone(),
            cause: cause.into(),
        }
    }
}

impl ColumnMapping {
    fn value(&self, plan: &MigrationPlan, row: &[SqlValue], record_id: &str) -> Result<SqlValue> {
        let value = match &self.source {
            Source::Copy(index) => row[*index].clone(),
            Source::Missing => SqlValue::Null,
            Source::Convert { index, old, spec } => match &row[*index] {
                SqlValue::Null => SqlValue::Null,
                stored => {
                    let logical = to_logical(old.kind.field_type(), stored.clone());
                    spec.validate(&logical).map_err(|e| {
                        plan.error(format!(
                            "can't convert {:?} of record {record_id:?} to {}: {e}",
                            self.name,
                            spec.field_type()
                        ))
                    })?
                }
            },
        };

        match (value, &self.default) {
            (SqlValue::Null, Some(default)) if self.required => Ok(default.clone()),
            (value, _) => Ok(value),
        }
    }
}

fn mentions_column(sql: &str, column: &str) -> bool {
    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(column)))
        .map(|re| re.is_match(sql))
        .unwrap_or(true)
}

/// The part of an index or trigger statement that can name columns of the table
fn column_clauses(object: &SchemaObjectResult) -> String {
    if object.object_type == "trigger" {
        if let Some(captures) = TRIGGER_HEADER.captures(&object.sql) {
            return format!("{} {}", &captures[1], &captures[2]);
        }
        return object.sql.clone();
    }
    match object.sql.find('(') {
        Some(start) => object.sql[start..].to_string(),
        None => object.sql.clone(),
    }
}

/// First removed column an index or trigger depends on. Plain index columns
/// come from `pragma_index_info`; expressions and trigger bodies are searched
/// by name.
async fn removed_dependency(
    conn: &mut SqliteConnection,
    object: &SchemaObjectResult,
    removed: &[String],
) -> Result<Option<String>> {
    if removed.is_empty() {
        return Ok(None);
    }

    if object.object_type == "index" {
        let columns: Vec<Option<String>> =
            sqlx::query_scalar("SELECT name FROM pragma_index_info($1)")
                .bind(&object.name)
                .fetch_all(&mut *conn)
                .await?;
        if !columns.is_empty() && columns.iter().all(Option::is_some) {
            let key = removed
                .iter()
                .find(|r| columns.iter().flatten().any(|c| c.eq_ignore_ascii_case(r)));
            // A partial index can also depend on columns in its WHERE clause
            let predicate = object
                .sql
                .to_ascii_uppercase()
                .rfind(" WHERE ")
                .map(|start| &object.sql[start..]);
            return Ok(key
                .or_else(|| predicate.and_then(|p| removed.iter().find(|r| mentions_column(p, r))))
                .cloned());
        }
    }

    let clauses = column_clauses(object);
    Ok(removed.iter().find(|r| mentions_column(&clauses, r)).cloned())
}

impl SchemaSynchronizer {
    /// Rebuild `plan.table` into its new shape and apply `catalog_writes` in
    /// the same transaction. On failure the table and the catalog are unchanged.
    pub async fn migrate_table(
        &self,
        plan: &MigrationPlan,
        catalog_writes: &[CatalogWrite],
    ) -> Result<MigrationReport> {
        let mut conn = self.repository.acquire().await?;

        Self::disable_foreign_keys(&mut conn).await?;
        let result = Self::rebuild(&mut conn, plan, catalog_writes).await;
        let restored = Self::enable_foreign_keys(&mut conn).await;

        let report = result?;
        restored?;

        info!(
            "Rebuilt table {}: {} row(s) copied, {} index(es)/trigger(s) recreated, {} dropped",
            plan.table, report.rows_copied, report.indexes_recreated, report.indexes_dropped
        );
        Ok(report)
    }

    async fn rebuild(
        conn: &mut SqliteConnection,
        plan: &MigrationPlan,
        catalog_writes: &[CatalogWrite],
    ) -> Result<MigrationReport> {
        let mut tx = conn.begin().await?;

        match Self::rebuild_in_transaction(&mut tx, plan, catalog_writes).await {
            Ok(report) => {
                tx.commit().await.map_err(|e| plan.error(e.to_string()))?;
                Ok(report)
            }
            Err(e) => {
                warn!("Rolling back rebuild of table {}: {e}", plan.table);
                if let Err(rollback) = tx.rollback().await {
                    warn!("Rollback of table {} failed: {rollback}", plan.table);
                }
                Err(match e {
                    e @ (Error::MigrationError { .. } | Error::InvalidFieldOptions { .. }) => e,
                    other => plan.error(other.to_string()),
                })
            }
        }
    }

    async fn rebuild_in_transaction(
        conn: &mut SqliteConnection,
        plan: &MigrationPlan,
        catalog_writes: &[CatalogWrite],
    ) -> Result<MigrationReport> {
        let table = quote_identifier(&plan.table);

        let expected = plan
            .old_fields
            .iter()
            .map(FieldRecord::from_field)
            .collect::<serde_json::Result<Vec<_>>>()?;
        if !SqliteRepository::fields_match(conn, &plan.collection_id, &expected).await? {
            return Err(plan.error(FIELDS_CHANGED));
        }

        if let Some(rename) = &plan.rename {
            Self::rename_column(conn, &plan.table, &rename.from, &rename.to).await?;
        }

        // Indexes and triggers go away with the old table; decide what to bring back
        // while their column lists can still be inspected
        let removed = plan.removed_columns();
        let mut snapshot = vec![];
        for object in SqliteRepository::list_schema_objects(conn, &plan.table).await? {
            let dependency = removed_dependency(conn, &object, &removed).await?;
            snapshot.push((object, dependency));
        }
        let select = plan.select_columns();
        let mappings = plan.mappings(&select)?;

        // Fail fast on required columns that would end up NULL
        for mapping in mappings.iter().filter(|m| m.required && m.default.is_none()) {
            let null_rows: i64 = match &mapping.source {
                Source::Missing => {
                    sqlx::query(&format!("SELECT COUNT(*) FROM {table}"))
                        .fetch_one(&mut *conn)
                        .await?
                        .try_get(0)?
                }
                Source::Copy(index) | Source::Convert { index, .. } => {
                    sqlx::query(&format!(
                        "SELECT COUNT(*) FROM {table} WHERE {} IS NULL",
                        quote_identifier(&select[*index])
                    ))
                    .fetch_one(&mut *conn)
                    .await?
                    .try_get(0)?
                }
            };
            if null_rows > 0 {
                return Err(plan.error(format!(
                    "cannot make field required: {null_rows} rows are NULL"
                )));
            }
        }

        let shadow = format!("{SHADOW_PREFIX}{}", plan.table);
        execute_ddl(conn, &format!("DROP TABLE IF EXISTS {}", quote_identifier(&shadow))).await?;
        Self::create_table(
            conn,
            &shadow,
            plan.collection_type,
            &plan.new_fields,
            &plan.targets,
        )
        .await?;

        let select_sql = format!(
            "SELECT rowid, {} FROM {table} WHERE rowid > $1 ORDER BY rowid LIMIT {COPY_BATCH_SIZE}",
            select.iter().map(|c| quote_identifier(c)).join(", ")
        );
        let insert_sql = format!(
            "INSERT INTO {} (rowid, {}) VALUES ({})",
            quote_identifier(&shadow),
            mappings.iter().map(|m| quote_identifier(&m.name)).join(", "),
            std::iter::repeat("?").take(mappings.len() + 1).join(", ")
        );

        let mut rows_copied = 0u64;
        let mut last_rowid = i64::MIN;
        loop {
            let batch = sqlx::query(&select_sql)
                .bind(last_rowid)
                .fetch_all(&mut *conn)
                .await?;
            if batch.is_empty() {
                break;
            }

            for row in &batch {
                let rowid: i64 = row.try_get(0)?;
                let values = (1..=select.len())
                    .map(|i| SqlValue::decode(row, i))
                    .collect::<Result<Vec<_>, _>>()?;
                let record_id = values
                    .first()
                    .and_then(SqlValue::as_text)
                    .unwrap_or_default()
                    .to_string();

                let mut params = Vec::with_capacity(mappings.len() + 1);
                params.push(SqlValue::Integer(rowid));
                for mapping in &mappings {
                    params.push(mapping.value(plan, &values, &record_id)?);
                }

                bind_all(sqlx::query(&insert_sql), &params)
                    .execute(&mut *conn)
                    .await?;
                last_rowid = rowid;
                rows_copied += 1;
            }
        }

        Self::drop_table(conn, &plan.table).await?;
        Self::rename_table(conn, &shadow, &plan.table).await?;

        let mut report = MigrationReport {
            rows_copied,
            ..Default::default()
        };
        for (object, dependency) in snapshot {
            if let Some(column) = dependency {
                warn!(
                    "Dropping {} {} on table {}: it references removed column {column}",
                    object.object_type, object.name, plan.table
                );
                report.indexes_dropped += 1;
                continue;
            }
            execute_ddl(conn, &object.sql).await?;
            report.indexes_recreated += 1;
        }

        for write in catalog_writes {
            SqliteRepository::apply(conn, write).await?;
        }

        let violations = sqlx::query("PRAGMA foreign_key_check")
            .fetch_all(&mut *conn)
            .await?;
        if !violations.is_empty() {
            let tables = violations
                .iter()
                .filter_map(|row| row.try_get::<String, _>(0).ok())
                .unique()
                .join(", ");
            return Err(plan.error(format!(
                "{} foreign key violation(s) after rebuild (in {tables})",
                violations.len()
            )));
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::data_types::{FieldDefinition, FieldKind};
    use crate::repository::interface::CollectionRecord;
    use crate::testutils::in_memory_repository;

    fn field(id: &str, def: FieldDefinition, position: i64) -> Field {
        Field {
            id: id.to_string(),
            collection_id: "c_posts".to_string(),
            name: def.name,
            required: def.required,
            kind: def.kind,
            position,
            created_at: "2024-01-01T00:00:00.000000Z".to_string(),
        }
    }

    async fn setup() -> (SchemaSynchronizer, Vec<Field>) {
        let repository = Arc::new(in_memory_repository().await);
        let fields = vec![
            field("f_title", FieldDefinition::text("title"), 0),
            field("f_views", FieldDefinition::text("views"), 1),
        ];

        let mut conn = repository.acquire().await.unwrap();
        SqliteRepository::insert_collection(
            &mut conn,
            &CollectionRecord {
                id: "c_posts".to_string(),
                name: "posts".to_string(),
                collection_type: "base".to_string(),
                list_rule: None,
                view_rule: None,
                create_rule: None,
                update_rule: None,
                delete_rule: None,
                created_at: "2024-01-01T00:00:00.000000Z".to_string(),
                updated_at: "2024-01-01T00:00:00.000000Z".to_string(),
            },
        )
        .await
        .unwrap();
        SqliteRepository::insert_fields(
            &mut conn,
            &fields
                .iter()
                .map(|f| FieldRecord::from_field(f).unwrap())
                .collect_vec(),
        )
        .await
        .unwrap();
        SchemaSynchronizer::create_table(
            &mut conn,
            "posts",
            CollectionType::Base,
            &fields,
            &HashMap::new(),
        )
        .await
        .unwrap();
        for (id, title, views) in [("p1", "a", Some("10")), ("p2", "b", None)] {
            sqlx::query(
                "INSERT INTO posts (id, created_at, updated_at, title, views) VALUES ($1, 'x', 'x', $2, $3)",
            )
            .bind(id)
            .bind(title)
            .bind(views)
            .execute(&mut *conn)
            .await
            .unwrap();
        }
        execute_ddl(&mut conn, "CREATE INDEX idx_posts_views ON posts (views)")
            .await
            .unwrap();
        execute_ddl(&mut conn, "CREATE INDEX idx_posts_title ON posts (title)")
            .await
            .unwrap();

        (SchemaSynchronizer::new(repository), fields)
    }

    async fn catalog_fields(conn: &mut SqliteConnection) -> Vec<Field> {
        SqliteRepository::list_fields(conn, "c_posts")
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.into_field().unwrap())
            .collect()
    }

    fn plan(old_fields: Vec<Field>, new_fields: Vec<Field>) -> MigrationPlan {
        MigrationPlan {
            collection_id: "c_posts".to_string(),
            table: "posts".to_string(),
            collection_type: CollectionType::Base,
            old_fields,
            new_fields,
            rename: None,
            defaults: HashMap::new(),
            targets: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_retype_column() {
        let (synchronizer, fields) = setup().await;
        let new_fields = vec![
            fields[0].clone(),
            field("f_views", FieldDefinition::number("views"), 1),
        ];

        let report = synchronizer
            .migrate_table(&plan(fields, new_fields), &[])
            .await
            .unwrap();
        assert_eq!(
            report,
            MigrationReport {
                rows_copied: 2,
                indexes_recreated: 2,
                indexes_dropped: 0
            }
        );

        let mut conn = synchronizer.repository.acquire().await.unwrap();
        let views: Vec<Option<f64>> = sqlx::query_scalar("SELECT views FROM posts ORDER BY id")
            .fetch_all(&mut *conn)
            .await
            .unwrap();
        assert_eq!(views, vec![Some(10.0), None]);
    }

    #[tokio::test]
    async fn test_remove_column_drops_its_index() {
        let (synchronizer, fields) = setup().await;

        let report = synchronizer
            .migrate_table(&plan(fields.clone(), vec![fields[0].clone()]), &[])
            .await
            .unwrap();
        assert_eq!(report.indexes_recreated, 1);
        assert_eq!(report.indexes_dropped, 1);

        let mut conn = synchronizer.repository.acquire().await.unwrap();
        let objects = SqliteRepository::list_schema_objects(&mut conn, "posts")
            .await
            .unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].name, "idx_posts_title");
    }

    #[tokio::test]
    async fn test_required_without_default_fails_fast() {
        let (synchronizer, fields) = setup().await;
        let new_fields = vec![
            fields[0].clone(),
            field("f_views", FieldDefinition::text("views").required(), 1),
        ];

        let err = synchronizer
            .migrate_table(&plan(fields.clone(), new_fields.clone()), &[])
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("cannot make field required: 1 rows are NULL"));

        let mut with_default = plan(fields, new_fields);
        with_default
            .defaults
            .insert("views".to_string(), SqlValue::from("0"));
        synchronizer
            .migrate_table(&with_default, &[])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_conversion_leaves_table_untouched() {
        let (synchronizer, fields) = setup().await;
        let mut conn = synchronizer.repository.acquire().await.unwrap();
        sqlx::query("UPDATE posts SET views = 'lots' WHERE id = 'p2'")
            .execute(&mut *conn)
            .await
            .unwrap();
        let before = SqliteRepository::table_sql(&mut conn, "posts").await.unwrap();
        drop(conn);

        let new_fields = vec![
            fields[0].clone(),
            field(
                "f_views",
                FieldDefinition::new("views", FieldKind::Number(Default::default())),
                1,
            ),
        ];
        let err = synchronizer
            .migrate_table(&plan(fields, new_fields), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MigrationError { .. }));

        let mut conn = synchronizer.repository.acquire().await.unwrap();
        assert_eq!(
            SqliteRepository::table_sql(&mut conn, "posts").await.unwrap(),
            before
        );
        let views: Vec<Option<String>> = sqlx::query_scalar("SELECT views FROM posts ORDER BY id")
            .fetch_all(&mut *conn)
            .await
            .unwrap();
        assert_eq!(views, vec![Some("10".to_string()), Some("lots".to_string())]);

        // Enforcement is back on after the failure
        let enabled: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(enabled, 1);
    }

    #[test]
    fn test_column_clauses_skip_names() {
        let index = SchemaObjectResult {
            object_type: "index".to_string(),
            name: "tags_label".to_string(),
            sql: r#"CREATE INDEX "tags_label" ON "tags" ("label" COLLATE NOCASE)"#.to_string(),
        };
        assert_eq!(column_clauses(&index), r#"("label" COLLATE NOCASE)"#);
        assert!(!mentions_column(&column_clauses(&index), "tags"));

        let trigger = SchemaObjectResult {
            object_type: "trigger".to_string(),
            name: "posts_touch".to_string(),
            sql: "CREATE TRIGGER posts_touch AFTER UPDATE OF views ON posts BEGIN \
                  UPDATE posts SET updated_at = NEW.updated_at WHERE id = NEW.id; END"
                .to_string(),
        };
        let clauses = column_clauses(&trigger);
        assert!(mentions_column(&clauses, "views"));
        assert!(mentions_column(&clauses, "updated_at"));
        assert!(!mentions_column(&clauses, "posts_touch"));
    }

    #[tokio::test]
    async fn test_removed_column_named_like_the_table_keeps_other_indexes() {
        let (synchronizer, _) = setup().await;
        let mut conn = synchronizer.repository.acquire().await.unwrap();
        let fields = vec![
            field("f_posts", FieldDefinition::text("posts"), 2),
            field("f_label", FieldDefinition::text("label"), 3),
        ];
        execute_ddl(&mut conn, r#"ALTER TABLE posts ADD COLUMN "posts" TEXT"#)
            .await
            .unwrap();
        execute_ddl(&mut conn, r#"ALTER TABLE posts ADD COLUMN "label" TEXT"#)
            .await
            .unwrap();
        execute_ddl(&mut conn, "CREATE INDEX idx_posts_label ON posts (label)")
            .await
            .unwrap();
        execute_ddl(
            &mut conn,
            "CREATE INDEX idx_posts_partial ON posts (title) WHERE posts IS NOT NULL",
        )
        .await
        .unwrap();
        SqliteRepository::insert_fields(
            &mut conn,
            &fields
                .iter()
                .map(|f| FieldRecord::from_field(f).unwrap())
                .collect_vec(),
        )
        .await
        .unwrap();
        let old_fields = catalog_fields(&mut conn).await;
        drop(conn);

        let new_fields = old_fields
            .iter()
            .filter(|f| f.id != "f_posts")
            .cloned()
            .collect_vec();
        let report = synchronizer
            .migrate_table(&plan(old_fields, new_fields), &[])
            .await
            .unwrap();
        assert_eq!(report.indexes_recreated, 3);
        assert_eq!(report.indexes_dropped, 1);

        let mut conn = synchronizer.repository.acquire().await.unwrap();
        let names = SqliteRepository::list_schema_objects(&mut conn, "posts")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.name)
            .sorted()
            .collect_vec();
        assert_eq!(
            names,
            vec!["idx_posts_label", "idx_posts_title", "idx_posts_views"]
        );
    }

    #[tokio::test]
    async fn test_stale_plan_is_rejected() {
        let (synchronizer, fields) = setup().await;
        let mut conn = synchronizer.repository.acquire().await.unwrap();
        let before = SqliteRepository::table_sql(&mut conn, "posts").await.unwrap();

        // Another change lands after the plan was made
        let slug = field("f_slug", FieldDefinition::text("slug"), 2);
        SqliteRepository::insert_fields(&mut conn, &[FieldRecord::from_field(&slug).unwrap()])
            .await
            .unwrap();
        execute_ddl(&mut conn, r#"ALTER TABLE posts ADD COLUMN "slug" TEXT"#)
            .await
            .unwrap();
        drop(conn);

        let new_fields = vec![
            fields[0].clone(),
            field("f_views", FieldDefinition::number("views"), 1),
        ];
        let err = synchronizer
            .migrate_table(&plan(fields, new_fields), &[])
            .await
            .unwrap_err();
        match err {
            Error::MigrationError { cause, .. } => assert_eq!(cause, FIELDS_CHANGED),
            other => panic!("unexpected error {other:?}"),
        }

        let mut conn = synchronizer.repository.acquire().await.unwrap();
        let after = SqliteRepository::table_sql(&mut conn, "posts").await.unwrap();
        assert_ne!(after, before);
        assert!(after.contains(r#""slug""#));
        assert_eq!(catalog_fields(&mut conn).await.len(), 3);
    }
}
