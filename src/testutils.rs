use crate::config::schema::Database;
use crate::repository::sqlite::SqliteRepository;

pub async fn in_memory_repository() -> SqliteRepository {
    SqliteRepository::try_new(&Database::in_memory().settings())
        .await
        .expect("Error setting up the database")
}
