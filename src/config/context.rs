use std::sync::Arc;

use tracing::info;

use crate::repository::sqlite::SqliteRepository;

use super::schema::PetrelConfig;

/// Open the catalog database described by the config and bring its catalog
/// tables up to date
pub async fn build_repository(
    config: &PetrelConfig,
) -> Result<Arc<SqliteRepository>, sqlx::Error> {
    let settings = config.database.settings();
    let repository = SqliteRepository::try_new(&settings).await?;

    info!(
        "Opened database {} (journal mode {:?}, up to {} connections)",
        settings.dsn, settings.journal_mode, settings.max_connections
    );

    Ok(Arc::new(repository))
}
