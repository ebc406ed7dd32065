use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::data_types::{Collection, Record};

/// Who is performing an operation, as established by the caller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthContext {
    pub is_admin: bool,
    /// The authenticated record (e.g. a user), if any
    pub principal: Option<Value>,
}

impl AuthContext {
    pub fn admin() -> Self {
        Self {
            is_admin: true,
            principal: None,
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn principal(principal: Value) -> Self {
        Self {
            is_admin: false,
            principal: Some(principal),
        }
    }
}

/// Evaluates a collection's access rule. The rule language itself lives
/// outside of this crate; only the verdict is used here.
pub trait AccessChecker: Send + Sync {
    fn can_access(&self, rule: Option<&str>, auth: &AuthContext, record: Option<&Record>) -> bool;
}

impl<F> AccessChecker for F
where
    F: Fn(Option<&str>, &AuthContext, Option<&Record>) -> bool + Send + Sync,
{
    fn can_access(&self, rule: Option<&str>, auth: &AuthContext, record: Option<&Record>) -> bool {
        self(rule, auth, record)
    }
}

/// Callbacks around record mutations. `before_*` runs before the transaction
/// starts and cancels the operation by returning an error; `after_*` only runs
/// once the change is committed.
#[async_trait]
pub trait RecordHooks: Send + Sync {
    async fn before_create(&self, _collection: &Collection, _record: &Record) -> Result<(), String> {
        Ok(())
    }

    async fn after_create(&self, _collection: &Collection, _record: &Record) {}

    async fn before_update(
        &self,
        _collection: &Collection,
        _existing: &Record,
        _changes: &Record,
    ) -> Result<(), String> {
        Ok(())
    }

    async fn after_update(&self, _collection: &Collection, _record: &Record) {}

    async fn before_delete(&self, _collection: &Collection, _record: &Record) -> Result<(), String> {
        Ok(())
    }

    async fn after_delete(&self, _collection: &Collection, _record: &Record) {}
}

/// Hooks that do nothing
#[derive(Debug, Default)]
pub struct NoHooks;

impl RecordHooks for NoHooks {}
