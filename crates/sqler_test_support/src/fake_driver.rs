//! Deterministic fake driver adapter for tests. Grounded on the teacher's
//! `FakeDriver`: a builder over an `Arc`-shared state with `RwLock`/`Mutex`
//! interior mutability and poison-recovering accessors, so the same handle
//! can be cloned into a connection runtime while a test still inspects calls
//! made through it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use sqler::config::PrivateOptions;
use sqler::driver::{ConnectionPoolState, DriverAdapter, DriverState, ExecMeta, Row};
use sqler::error::DriverError;
use sqler::value::Value;

#[derive(Debug, Clone)]
enum FakeOutcome {
    Success(Vec<Row>),
    Error(String),
}

impl FakeOutcome {
    fn into_result(self) -> Result<Vec<Row>, DriverError> {
        match self {
            Self::Success(rows) => Ok(rows),
            Self::Error(message) => Err(Box::from(message)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutedCall {
    pub sql: String,
    pub binds: HashMap<String, Value>,
}

#[derive(Default)]
struct FakeDriverState {
    outcomes: RwLock<HashMap<String, FakeOutcome>>,
    default_outcome: RwLock<Option<FakeOutcome>>,
    executed: Mutex<Vec<ExecutedCall>>,
    transactions: Mutex<Vec<String>>,
    init_error: RwLock<Option<String>>,
    close_error: RwLock<Option<String>>,
    close_calls: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct FakeDriver {
    state: Arc<FakeDriverState>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_result(self, sql: impl Into<String>, rows: Vec<Row>) -> Self {
        rwlock_write(&self.state.outcomes).insert(sql.into(), FakeOutcome::Success(rows));
        self
    }

    pub fn with_error(self, sql: impl Into<String>, message: impl Into<String>) -> Self {
        rwlock_write(&self.state.outcomes).insert(sql.into(), FakeOutcome::Error(message.into()));
        self
    }

    pub fn with_default_result(self, rows: Vec<Row>) -> Self {
        *rwlock_write(&self.state.default_outcome) = Some(FakeOutcome::Success(rows));
        self
    }

    pub fn with_default_error(self, message: impl Into<String>) -> Self {
        *rwlock_write(&self.state.default_outcome) = Some(FakeOutcome::Error(message.into()));
        self
    }

    pub fn with_init_error(self, message: impl Into<String>) -> Self {
        *rwlock_write(&self.state.init_error) = Some(message.into());
        self
    }

    pub fn with_close_error(self, message: impl Into<String>) -> Self {
        *rwlock_write(&self.state.close_error) = Some(message.into());
        self
    }

    pub fn executed_calls(&self) -> Vec<ExecutedCall> {
        mutex_lock(&self.state.executed).clone()
    }

    pub fn transaction_log(&self) -> Vec<String> {
        mutex_lock(&self.state.transactions).clone()
    }

    pub fn close_calls(&self) -> usize {
        self.state.close_calls.load(Ordering::Relaxed)
    }

    pub fn as_driver_arc(self) -> Arc<dyn DriverAdapter> {
        Arc::new(self)
    }
}

#[async_trait]
impl DriverAdapter for FakeDriver {
    async fn init(&self, _options: &PrivateOptions) -> Result<(), DriverError> {
        match rwlock_read(&self.state.init_error).clone() {
            Some(message) => Err(Box::from(message)),
            None => Ok(()),
        }
    }

    async fn begin_transaction(
        &self,
        _options: Option<&serde_json::Value>,
    ) -> Result<String, DriverError> {
        let id = uuid::Uuid::new_v4().to_string();
        mutex_lock(&self.state.transactions).push(format!("begin:{id}"));
        Ok(id)
    }

    async fn commit_transaction(&self, id: &str) -> Result<(), DriverError> {
        mutex_lock(&self.state.transactions).push(format!("commit:{id}"));
        Ok(())
    }

    async fn rollback_transaction(&self, id: &str) -> Result<(), DriverError> {
        mutex_lock(&self.state.transactions).push(format!("rollback:{id}"));
        Ok(())
    }

    async fn exec(
        &self,
        sql: &str,
        binds: &HashMap<String, Value>,
        _fragments: &HashSet<String>,
        _meta: &ExecMeta,
        _driver_options: Option<&serde_json::Value>,
    ) -> Result<Vec<Row>, DriverError> {
        mutex_lock(&self.state.executed).push(ExecutedCall {
            sql: sql.to_string(),
            binds: binds.clone(),
        });

        if let Some(outcome) = rwlock_read(&self.state.outcomes).get(sql).cloned() {
            return outcome.into_result();
        }
        if let Some(outcome) = rwlock_read(&self.state.default_outcome).clone() {
            return outcome.into_result();
        }
        Ok(Vec::new())
    }

    async fn close(&self) -> Result<usize, DriverError> {
        self.state.close_calls.fetch_add(1, Ordering::Relaxed);
        match rwlock_read(&self.state.close_error).clone() {
            Some(message) => Err(Box::from(message)),
            None => Ok(1),
        }
    }

    async fn state(&self) -> DriverState {
        DriverState {
            pending: 0,
            connection: ConnectionPoolState { count: 1, in_use: 0 },
        }
    }
}

fn rwlock_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poison) => poison.into_inner(),
    }
}

fn rwlock_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poison) => poison.into_inner(),
    }
}

fn mutex_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poison) => poison.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::runtime::Runtime;

    #[test]
    fn exec_uses_configured_outcome_and_records_calls() {
        let driver = FakeDriver::new().with_error("SELECT boom", "boom");
        let rt = Runtime::new().unwrap();
        let result = rt.block_on(driver.exec(
            "SELECT boom",
            &HashMap::new(),
            &HashSet::new(),
            &ExecMeta::default(),
            None,
        ));
        assert!(result.is_err());
        assert_eq!(driver.executed_calls().len(), 1);
    }

    #[test]
    fn unconfigured_sql_returns_empty_rows() {
        let driver = FakeDriver::new();
        let rt = Runtime::new().unwrap();
        let result = rt
            .block_on(driver.exec(
                "SELECT 1",
                &HashMap::new(),
                &HashSet::new(),
                &ExecMeta::default(),
                None,
            ))
            .unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn begin_commit_rollback_are_logged_in_order() {
        let driver = FakeDriver::new();
        let rt = Runtime::new().unwrap();
        let id = rt.block_on(driver.begin_transaction(None)).unwrap();
        rt.block_on(driver.commit_transaction(&id)).unwrap();
        assert_eq!(
            driver.transaction_log(),
            vec![format!("begin:{id}"), format!("commit:{id}")]
        );
    }
}
