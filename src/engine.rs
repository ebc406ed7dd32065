use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tracing::info;
use uuid::Uuid;

use crate::catalog::{MetadataStore, SchemaEvent};
use crate::config::context::build_repository;
use crate::config::schema::{load_config, PetrelConfig};
use crate::error::Result;
use crate::query::QueryCompiler;
use crate::records::{AccessChecker, RecordHooks, RecordStore};
use crate::repository::sqlite::SqliteRepository;

const SCHEMA_EVENT_CAPACITY: usize = 64;

/// Source of ids for collections, fields and records
pub trait IdGenerator: Send + Sync + Debug {
    fn generate(&self) -> String;
}

/// Random UUID v4 in its 32-character simple form
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn generate(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }
}

/// Owns the connection pool and wires the catalog and the record store
/// together. Cheap to clone; every clone shares the same pool.
#[derive(Clone)]
pub struct Engine {
    repository: Arc<SqliteRepository>,
    compiler: QueryCompiler,
    ids: Arc<dyn IdGenerator>,
    access: Option<Arc<dyn AccessChecker>>,
    hooks: Option<Arc<dyn RecordHooks>>,
    events: broadcast::Sender<SchemaEvent>,
    schema_lock: Arc<Mutex<()>>,
}

impl Engine {
    pub async fn open(config: &PetrelConfig) -> Result<Self> {
        let repository = build_repository(config).await?;
        let (events, _) = broadcast::channel(SCHEMA_EVENT_CAPACITY);

        Ok(Self {
            repository,
            compiler: QueryCompiler::from_config(&config.query),
            ids: Arc::new(UuidGenerator),
            access: None,
            hooks: None,
            events,
            schema_lock: Arc::new(Mutex::new(())),
        })
    }

    pub async fn open_path(path: &Path) -> Result<Self> {
        let config = load_config(path)?;
        Self::open(&config).await
    }

    pub async fn in_memory() -> Result<Self> {
        Self::open(&PetrelConfig::in_memory()).await
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_access_checker(mut self, access: Arc<dyn AccessChecker>) -> Self {
        self.access = Some(access);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn RecordHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn metadata(&self) -> MetadataStore {
        MetadataStore::new(
            self.repository.clone(),
            self.ids.clone(),
            self.events.clone(),
            self.schema_lock.clone(),
        )
    }

    pub fn records(&self) -> RecordStore {
        let mut records = RecordStore::new(
            self.repository.clone(),
            self.metadata(),
            self.compiler,
            self.ids.clone(),
        );
        if let Some(access) = &self.access {
            records = records.with_access_checker(access.clone());
        }
        if let Some(hooks) = &self.hooks {
            records = records.with_hooks(hooks.clone());
        }
        records
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchemaEvent> {
        self.events.subscribe()
    }

    pub fn repository(&self) -> &Arc<SqliteRepository> {
        &self.repository
    }

    pub async fn close(&self) {
        info!("Closing engine");
        self.repository.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_generator() {
        let id = UuidGenerator.generate();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, UuidGenerator.generate());
    }
}
