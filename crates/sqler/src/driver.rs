//! The driver adapter (C3): the abstract per-dialect executor the core
//! orchestrates but never implements. A concrete adapter (Oracle, Postgres,
//! …) is deliberately out of scope; `sqler_test_support::FakeDriver` stands
//! in for tests.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::PrivateOptions;
use crate::error::DriverError;
use crate::value::Value;

/// One result-set row, column name to value. Driver-defined column order is
/// not preserved — callers that need it should carry it in `Value::Text`
/// column-name markers themselves; the core never orders or types rows.
pub type Row = HashMap<String, Value>;

/// Read-only snapshot of a driver's pool state, returned by `state()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionPoolState {
    pub count: u32,
    pub in_use: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverState {
    pub pending: u64,
    pub connection: ConnectionPoolState,
}

/// Diagnostic context handed to a driver call, independent of the SQL or
/// binds themselves — used only for the driver's own logging.
#[derive(Debug, Clone, Default)]
pub struct ExecMeta {
    pub name: Option<String>,
    pub file: PathBuf,
}

/// Abstract per-dialect executor. The core only orchestrates these calls; it
/// never inspects driver internals and never chooses a concrete
/// implementation.
#[async_trait]
pub trait DriverAdapter: Send + Sync {
    /// Opens the pool. Called once per connection during `Manager::init`.
    async fn init(&self, options: &PrivateOptions) -> Result<(), DriverError>;

    /// Starts a transaction and returns its driver-generated id.
    async fn begin_transaction(
        &self,
        options: Option<&serde_json::Value>,
    ) -> Result<String, DriverError>;

    async fn commit_transaction(&self, id: &str) -> Result<(), DriverError>;

    async fn rollback_transaction(&self, id: &str) -> Result<(), DriverError>;

    /// Executes already-templated `sql` with `binds`. `fragments` and `meta`
    /// are diagnostic context only; the driver never re-derives them.
    async fn exec(
        &self,
        sql: &str,
        binds: &HashMap<String, Value>,
        fragments: &HashSet<String>,
        meta: &ExecMeta,
        driver_options: Option<&serde_json::Value>,
    ) -> Result<Vec<Row>, DriverError>;

    /// Releases pooled resources, returning the count released.
    async fn close(&self) -> Result<usize, DriverError>;

    async fn state(&self) -> DriverState;
}

/// Opaque transaction handle returned by `ConnectionRuntime::begin_transaction`.
/// The id is a driver-generated GUID-format string; commit/rollback delegate
/// back to the same driver instance that created it.
pub struct TransactionHandle {
    id: String,
    driver: Arc<dyn DriverAdapter>,
}

impl TransactionHandle {
    pub fn new(id: impl Into<String>, driver: Arc<dyn DriverAdapter>) -> Self {
        Self { id: id.into(), driver }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn commit(&self) -> Result<(), DriverError> {
        self.driver.commit_transaction(&self.id).await
    }

    pub async fn rollback(&self) -> Result<(), DriverError> {
        self.driver.rollback_transaction(&self.id).await
    }
}
