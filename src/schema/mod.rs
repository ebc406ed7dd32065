//! Keeps physical tables in line with the catalog. Cheap changes are single
//! statements on the caller's connection; everything SQLite can't ALTER in
//! place goes through the shadow-table rebuild in `migrate`.

pub mod ddl;
pub mod migrate;

use std::collections::HashMap;
use std::sync::Arc;

use itertools::Itertools;
use sqlx::sqlite::SqliteConnection;
use tracing::debug;

use crate::data_types::{CollectionId, CollectionType, Field};
use crate::error::{Error, Result};
use crate::identifier::{quote_identifier, validate_identifier};
use crate::repository::sqlite::SqliteRepository;

pub use migrate::{ColumnRename, MigrationPlan, MigrationReport, FIELDS_CHANGED};

#[derive(Debug, Clone)]
pub struct SchemaSynchronizer {
    repository: Arc<SqliteRepository>,
}

pub(crate) async fn execute_ddl(conn: &mut SqliteConnection, sql: &str) -> Result<()> {
    debug!("Executing DDL: {sql}");
    sqlx::query(sql).execute(&mut *conn).await?;
    Ok(())
}

impl SchemaSynchronizer {
    pub fn new(repository: Arc<SqliteRepository>) -> Self {
        Self { repository }
    }

    pub async fn create_table(
        conn: &mut SqliteConnection,
        table: &str,
        collection_type: CollectionType,
        fields: &[Field],
        targets: &HashMap<CollectionId, String>,
    ) -> Result<()> {
        let sql = ddl::create_table_sql(table, collection_type, fields, targets)?;
        execute_ddl(conn, &sql).await
    }

    /// Only for optional fields: existing rows get NULL
    pub async fn add_column(
        conn: &mut SqliteConnection,
        table: &str,
        field: &Field,
        targets: &HashMap<CollectionId, String>,
    ) -> Result<()> {
        if field.required {
            return Err(Error::MigrationError {
                table: table.to_string(),
                cause: format!(
                    "required field {:?} can't be added in place, it needs a rebuild",
                    field.name
                ),
            });
        }

        let sql = format!(
            "ALTER TABLE {} ADD COLUMN {}",
            quote_identifier(table),
            ddl::column_definition(field, targets)?
        );
        execute_ddl(conn, &sql).await
    }

    pub async fn rename_column(
        conn: &mut SqliteConnection,
        table: &str,
        from: &str,
        to: &str,
    ) -> Result<()> {
        let sql = format!(
            "ALTER TABLE {} RENAME COLUMN {} TO {}",
            quote_identifier(table),
            quote_identifier(from),
            quote_identifier(to)
        );
        execute_ddl(conn, &sql).await
    }

    /// Relation columns elsewhere that reference `from` are rewritten by SQLite
    pub async fn rename_table(conn: &mut SqliteConnection, from: &str, to: &str) -> Result<()> {
        let sql = format!(
            "ALTER TABLE {} RENAME TO {}",
            quote_identifier(from),
            quote_identifier(to)
        );
        execute_ddl(conn, &sql).await
    }

    pub async fn drop_table(conn: &mut SqliteConnection, table: &str) -> Result<()> {
        let sql = format!("DROP TABLE {}", quote_identifier(table));
        execute_ddl(conn, &sql).await
    }

    pub async fn create_index(
        conn: &mut SqliteConnection,
        table: &str,
        index_name: &str,
        columns: &[String],
        unique: bool,
    ) -> Result<()> {
        validate_identifier(index_name)?;
        if columns.is_empty() {
            return Err(Error::InvalidIdentifier {
                name: index_name.to_string(),
                reason: "an index needs at least one column".to_string(),
            });
        }
        if SqliteRepository::schema_object_exists(conn, "index", index_name).await?
            || SqliteRepository::schema_object_exists(conn, "table", index_name).await?
        {
            return Err(Error::NameConflict {
                kind: "Index",
                name: index_name.to_string(),
            });
        }

        let sql = format!(
            "CREATE {}INDEX {} ON {} ({})",
            if unique { "UNIQUE " } else { "" },
            quote_identifier(index_name),
            quote_identifier(table),
            columns.iter().map(|c| quote_identifier(c)).join(", ")
        );
        execute_ddl(conn, &sql).await
    }

    pub async fn drop_index(conn: &mut SqliteConnection, index_name: &str) -> Result<()> {
        let sql = format!("DROP INDEX {}", quote_identifier(index_name));
        execute_ddl(conn, &sql).await
    }

    /// Has to run outside of a transaction: SQLite ignores the pragma inside one
    pub async fn disable_foreign_keys(conn: &mut SqliteConnection) -> Result<()> {
        execute_ddl(conn, "PRAGMA foreign_keys = OFF").await
    }

    pub async fn enable_foreign_keys(conn: &mut SqliteConnection) -> Result<()> {
        execute_ddl(conn, "PRAGMA foreign_keys = ON").await
    }
}
