use std::str::FromStr;
use std::time::Duration;

use futures::TryStreamExt;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions,
};
use sqlx::{migrate::Migrator, Pool, QueryBuilder, Row, Sqlite, Transaction};

use crate::data_types::{FieldId, Timestamp};

use super::interface::{
    AllFieldsResult, CatalogWrite, CollectionRecord, Error, FieldRecord, Result,
    SchemaObjectResult,
};

const COLLECTION_COLUMNS: &str = r#"
    id, name, type AS collection_type, list_rule, view_rule, create_rule,
    update_rule, delete_rule, created_at, updated_at"#;

const FIELD_INSERT_CHUNK: usize = 100;

const FIELD_COLUMNS: &str = r#"
    _fields.id, _fields.collection_id, _fields.name, _fields.type AS field_type,
    _fields.required, _fields.options, _fields.position, _fields.created_at"#;

/// Connection settings for `SqliteRepository::try_new`
#[derive(Debug, Clone)]
pub struct SqliteSettings {
    pub dsn: String,
    pub journal_mode: SqliteJournalMode,
    pub max_connections: u32,
    pub busy_timeout: Duration,
}

/// Owner of the connection pool and of every query against the catalog tables.
///
/// Catalog queries take an explicit connection so that they can run inside the
/// same transaction as the DDL they describe; use `acquire` or `begin` to get one.
#[derive(Debug, Clone)]
pub struct SqliteRepository {
    pub executor: Pool<Sqlite>,
}

impl SqliteRepository {
    pub const MIGRATOR: Migrator = sqlx::migrate!("migrations/sqlite");

    pub async fn try_new(settings: &SqliteSettings) -> std::result::Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(&settings.dsn)?
            .create_if_missing(true)
            .journal_mode(settings.journal_mode)
            .foreign_keys(true)
            .busy_timeout(settings.busy_timeout);

        // An in-memory database lives exactly as long as its last connection, so
        // keep a single connection open for the lifetime of the pool
        let pool_options = if settings.dsn.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(settings.max_connections)
        };

        let pool = pool_options.connect_with(options).await?;
        let repo = Self { executor: pool };
        repo.setup().await?;
        Ok(repo)
    }

    async fn setup(&self) -> std::result::Result<(), sqlx::Error> {
        Self::MIGRATOR
            .run(&self.executor)
            .await
            .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
    }

    pub async fn close(&self) {
        self.executor.close().await
    }

    pub async fn acquire(&self) -> Result<PoolConnection<Sqlite>> {
        self.executor.acquire().await.map_err(Self::interpret_error)
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        self.executor.begin().await.map_err(Self::interpret_error)
    }

    pub fn interpret_error(error: sqlx::Error) -> Error {
        if let sqlx::Error::Database(ref d) = error {
            // Reference: https://www.sqlite.org/rescode.html
            let message = d.message();

            // For some reason, sqlx doesn't return the proper errcode for FK violations,
            // even though it's calling sqlite3_extended_errcode which is meant to return full codes.
            // Unique constraint violations do return the correct code though.
            if message.contains("FOREIGN KEY constraint failed") {
                return Error::FKConstraintViolation(error);
            }
            if message.contains("UNIQUE constraint failed") {
                return Error::UniqueConstraintViolation(error);
            }
        }
        Error::SqlxError(error)
    }

    // Collections

    pub async fn get_collection(
        conn: &mut SqliteConnection,
        name: &str,
    ) -> Result<CollectionRecord> {
        let query =
            format!("SELECT {COLLECTION_COLUMNS} FROM _collections WHERE name = $1");
        sqlx::query_as(&query)
            .bind(name)
            .fetch_one(&mut *conn)
            .await
            .map_err(Self::interpret_error)
    }

    pub async fn get_collection_by_id(
        conn: &mut SqliteConnection,
        id: &str,
    ) -> Result<CollectionRecord> {
        let query = format!("SELECT {COLLECTION_COLUMNS} FROM _collections WHERE id = $1");
        sqlx::query_as(&query)
            .bind(id)
            .fetch_one(&mut *conn)
            .await
            .map_err(Self::interpret_error)
    }

    pub async fn list_collections(
        conn: &mut SqliteConnection,
    ) -> Result<Vec<CollectionRecord>> {
        let query = format!("SELECT {COLLECTION_COLUMNS} FROM _collections ORDER BY name");
        sqlx::query_as::<_, CollectionRecord>(&query)
            .fetch(&mut *conn)
            .try_collect()
            .await
            .map_err(Self::interpret_error)
    }

    pub async fn insert_collection(
        conn: &mut SqliteConnection,
        collection: &CollectionRecord,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO _collections (
                id, name, type, list_rule, view_rule, create_rule, update_rule,
                delete_rule, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
        )
        .bind(&collection.id)
        .bind(&collection.name)
        .bind(&collection.collection_type)
        .bind(&collection.list_rule)
        .bind(&collection.view_rule)
        .bind(&collection.create_rule)
        .bind(&collection.update_rule)
        .bind(&collection.delete_rule)
        .bind(&collection.created_at)
        .bind(&collection.updated_at)
        .execute(&mut *conn)
        .await
        .map_err(Self::interpret_error)?;
        Ok(())
    }

    pub async fn update_collection(
        conn: &mut SqliteConnection,
        collection: &CollectionRecord,
    ) -> Result<()> {
        // Do RETURNING(id) here and ask for the ID back with fetch_one() to force a
        // row not found error if the collection doesn't exist
        sqlx::query(
            r#"UPDATE _collections SET name = $1, list_rule = $2, view_rule = $3,
                create_rule = $4, update_rule = $5, delete_rule = $6, updated_at = $7
            WHERE id = $8 RETURNING id"#,
        )
        .bind(&collection.name)
        .bind(&collection.list_rule)
        .bind(&collection.view_rule)
        .bind(&collection.create_rule)
        .bind(&collection.update_rule)
        .bind(&collection.delete_rule)
        .bind(&collection.updated_at)
        .bind(&collection.id)
        .fetch_one(&mut *conn)
        .await
        .map_err(Self::interpret_error)?;
        Ok(())
    }

    pub async fn touch_collection(
        conn: &mut SqliteConnection,
        id: &str,
        updated_at: &Timestamp,
    ) -> Result<()> {
        sqlx::query("UPDATE _collections SET updated_at = $1 WHERE id = $2 RETURNING id")
            .bind(updated_at)
            .bind(id)
            .fetch_one(&mut *conn)
            .await
            .map_err(Self::interpret_error)?;
        Ok(())
    }

    /// Fields are deleted explicitly rather than through the cascade, since
    /// table drops run with foreign key enforcement switched off
    pub async fn delete_collection(conn: &mut SqliteConnection, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM _fields WHERE collection_id = $1")
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(Self::interpret_error)?;

        sqlx::query("DELETE FROM _collections WHERE id = $1 RETURNING id")
            .bind(id)
            .fetch_one(&mut *conn)
            .await
            .map_err(Self::interpret_error)?;
        Ok(())
    }

    // Fields

    pub async fn list_fields(
        conn: &mut SqliteConnection,
        collection_id: &str,
    ) -> Result<Vec<FieldRecord>> {
        let query = format!(
            "SELECT {FIELD_COLUMNS} FROM _fields WHERE collection_id = $1 ORDER BY position"
        );
        sqlx::query_as::<_, FieldRecord>(&query)
            .bind(collection_id)
            .fetch(&mut *conn)
            .try_collect()
            .await
            .map_err(Self::interpret_error)
    }

    pub async fn list_all_fields(conn: &mut SqliteConnection) -> Result<Vec<AllFieldsResult>> {
        let query = format!(
            r#"SELECT _collections.name AS collection_name, {FIELD_COLUMNS}
            FROM _fields
            INNER JOIN _collections ON _collections.id = _fields.collection_id
            ORDER BY collection_name, _fields.position"#
        );
        sqlx::query_as::<_, AllFieldsResult>(&query)
            .fetch(&mut *conn)
            .try_collect()
            .await
            .map_err(Self::interpret_error)
    }

    /// Relation fields in other collections pointing at `collection_id`, as
    /// `(collection name, field name)` pairs
    pub async fn find_relations_to(
        conn: &mut SqliteConnection,
        collection_id: &str,
    ) -> Result<Vec<(String, String)>> {
        let all = Self::list_all_fields(conn).await?;
        Ok(all
            .into_iter()
            .filter(|r| r.field.collection_id != collection_id)
            .filter_map(|r| {
                let field = r.field.into_field().ok()?;
                (field.kind.relation_target() == Some(collection_id))
                    .then_some((r.collection_name, field.name))
            })
            .collect())
    }

    /// Whether the catalog still holds exactly `expected` for the collection
    pub async fn fields_match(
        conn: &mut SqliteConnection,
        collection_id: &str,
        expected: &[FieldRecord],
    ) -> Result<bool> {
        Ok(Self::list_fields(conn, collection_id).await? == expected)
    }

    pub async fn insert_fields(conn: &mut SqliteConnection, fields: &[FieldRecord]) -> Result<()> {
        // Eight binds per row; chunks keep each statement under SQLite's bind limit
        for chunk in fields.chunks(FIELD_INSERT_CHUNK) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO _fields (id, collection_id, name, type, required, options, position, created_at) ",
            );
            builder.push_values(chunk, |mut b, field| {
                b.push_bind(field.id.clone())
                    .push_bind(field.collection_id.clone())
                    .push_bind(field.name.clone())
                    .push_bind(field.field_type.clone())
                    .push_bind(field.required)
                    .push_bind(field.options.clone())
                    .push_bind(field.position)
                    .push_bind(field.created_at.clone());
            });

            builder
                .build()
                .execute(&mut *conn)
                .await
                .map_err(Self::interpret_error)?;
        }
        Ok(())
    }

    pub async fn update_field(conn: &mut SqliteConnection, field: &FieldRecord) -> Result<()> {
        sqlx::query(
            r#"UPDATE _fields SET name = $1, type = $2, required = $3, options = $4
            WHERE id = $5 RETURNING id"#,
        )
        .bind(&field.name)
        .bind(&field.field_type)
        .bind(field.required)
        .bind(&field.options)
        .bind(&field.id)
        .fetch_one(&mut *conn)
        .await
        .map_err(Self::interpret_error)?;
        Ok(())
    }

    pub async fn delete_field(conn: &mut SqliteConnection, id: &FieldId) -> Result<()> {
        sqlx::query("DELETE FROM _fields WHERE id = $1 RETURNING id")
            .bind(id)
            .fetch_one(&mut *conn)
            .await
            .map_err(Self::interpret_error)?;
        Ok(())
    }

    pub async fn apply(conn: &mut SqliteConnection, write: &CatalogWrite) -> Result<()> {
        match write {
            CatalogWrite::InsertField(field) => {
                Self::insert_fields(conn, std::slice::from_ref(field)).await
            }
            CatalogWrite::UpdateField(field) => Self::update_field(conn, field).await,
            CatalogWrite::DeleteField(id) => Self::delete_field(conn, id).await,
            CatalogWrite::TouchCollection { id, updated_at } => {
                Self::touch_collection(conn, id, updated_at).await
            }
        }
    }

    // Engine schema catalog

    /// Explicitly created indexes and triggers of a table. Automatic indexes
    /// (primary key, UNIQUE columns) have no SQL and come back with the table DDL.
    pub async fn list_schema_objects(
        conn: &mut SqliteConnection,
        table_name: &str,
    ) -> Result<Vec<SchemaObjectResult>> {
        sqlx::query_as::<_, SchemaObjectResult>(
            r#"SELECT type AS object_type, name, sql FROM sqlite_master
            WHERE tbl_name = $1 AND type IN ('index', 'trigger') AND sql IS NOT NULL
            ORDER BY type, name"#,
        )
        .bind(table_name)
        .fetch(&mut *conn)
        .try_collect()
        .await
        .map_err(Self::interpret_error)
    }

    pub async fn schema_object_exists(
        conn: &mut SqliteConnection,
        object_type: &str,
        name: &str,
    ) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM sqlite_master WHERE type = $1 AND name = $2 COLLATE NOCASE",
        )
        .bind(object_type)
        .bind(name)
        .fetch_one(&mut *conn)
        .await
        .map_err(Self::interpret_error)?;

        let count: i64 = row.try_get("count").map_err(Self::interpret_error)?;
        Ok(count > 0)
    }

    pub async fn table_sql(conn: &mut SqliteConnection, table_name: &str) -> Result<String> {
        let row = sqlx::query("SELECT sql FROM sqlite_master WHERE type = 'table' AND name = $1")
            .bind(table_name)
            .fetch_one(&mut *conn)
            .await
            .map_err(Self::interpret_error)?;
        row.try_get("sql").map_err(Self::interpret_error)
    }
}
