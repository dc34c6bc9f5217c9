//! The manager / dispatcher (C7): owns every registered connection, drives
//! C3/C5 initialization, and implements the series-vs-parallel dispatch rule
//! over per-connection operations. Re-exports `binds.rs`'s static utilities
//! per the design's component-design section.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::cache::CacheSurface;
use crate::catalog::Catalog;
use crate::config::{ConnectionConfig, PrivateOptions};
use crate::driver::{DriverAdapter, DriverState, TransactionHandle};
use crate::error::{ExecutionError, RedactedOptions, SqlerError};
use crate::execution::ExecutionService;

pub use crate::binds::{generate_cache_key, interpolate, named_bind_sequence, positional_binds};

/// Everything a prepared function needs from its connection: the static
/// config, the execution service wrapping the driver, and the live cache
/// handle (swappable via `Manager::set_cache`).
pub struct ConnectionRuntime {
    pub config: ConnectionConfig,
    pub execution: ExecutionService,
    pub cache: RwLock<Option<Arc<dyn CacheSurface>>>,
}

impl ConnectionRuntime {
    /// Starts a transaction and returns a handle whose `commit`/`rollback`
    /// delegate back through this connection's driver.
    pub async fn begin_transaction(
        &self,
        options: Option<&serde_json::Value>,
    ) -> Result<TransactionHandle, SqlerError> {
        let id = self
            .execution
            .driver()
            .begin_transaction(options)
            .await
            .map_err(|e| driver_err(RESERVED_TX_LABEL, e))?;
        Ok(TransactionHandle::new(id, self.execution.driver().clone()))
    }
}

const RESERVED_TX_LABEL: &str = "beginTransaction";

fn driver_err(label: &str, source: crate::error::DriverError) -> SqlerError {
    SqlerError::Execution(ExecutionError::new(
        None,
        PathBuf::from(label),
        String::new(),
        RedactedOptions::default(),
        Vec::new(),
        source,
    ))
}

/// One registered connection: its runtime plus the namespace catalog built
/// over it and the driver-initialization flag `Manager::init` consults.
pub struct ConnectionEntry {
    pub runtime: Arc<ConnectionRuntime>,
    pub catalog: RwLock<Catalog>,
    private_options: PrivateOptions,
    initialized: AtomicBool,
}

impl ConnectionEntry {
    pub fn runtime(&self) -> &Arc<ConnectionRuntime> {
        &self.runtime
    }

    pub fn catalog(&self) -> &RwLock<Catalog> {
        &self.catalog
    }
}

/// Per-call dispatch options for `init`/`state`/`close`: which connections
/// to target, the manager-wide series/returnErrors policy, and
/// per-connection overrides of either.
#[derive(Clone, Default)]
pub struct DispatchOptions {
    pub names: Option<Vec<String>>,
    pub execute_in_series: bool,
    pub return_errors: bool,
    pub per_connection_series: HashMap<String, bool>,
    pub per_connection_return_errors: HashMap<String, bool>,
}

/// Aggregated dispatch outcome: one entry per connection name that
/// succeeded, plus `(name, error)` pairs for connections whose effective
/// `returnErrors` policy was true. A connection whose effective
/// `returnErrors` is false never shows up here — its failure instead makes
/// `Manager::init`/`state`/`close` return `Err` directly; see
/// `Manager::run_dispatch`.
#[derive(Debug)]
pub struct DispatchResult<T> {
    pub by_name: HashMap<String, T>,
    pub errors: Vec<(String, SqlerError)>,
}

/// Owns the set of named connections. Construction order is preserved in
/// `order` so that series dispatch has a deterministic iteration order.
pub struct Manager {
    main_path: PathBuf,
    connections: HashMap<String, Arc<ConnectionEntry>>,
    order: Vec<String>,
    initialized: AtomicBool,
}

impl Manager {
    pub fn new(main_path: impl Into<PathBuf>) -> Self {
        Self {
            main_path: main_path.into(),
            connections: HashMap::new(),
            order: Vec::new(),
            initialized: AtomicBool::new(false),
        }
    }

    /// Registers and immediately initializes one connection. A name
    /// collision is always fatal, even after `Manager::init` has already
    /// run once.
    pub async fn add_connection(
        &mut self,
        config: ConnectionConfig,
        driver: Arc<dyn DriverAdapter>,
        private_options: PrivateOptions,
        cache: Option<Arc<dyn CacheSurface>>,
    ) -> Result<(), SqlerError> {
        if self.connections.contains_key(&config.name) {
            return Err(SqlerError::configuration(format!(
                "connection `{}` is already registered",
                config.name
            )));
        }

        let sql_dir = config.sql_dir(&self.main_path);
        let execution = ExecutionService::new(driver, config.dialect.clone(), config.version);
        let runtime = Arc::new(ConnectionRuntime {
            config: config.clone(),
            execution,
            cache: RwLock::new(cache),
        });

        runtime
            .execution
            .driver()
            .init(&private_options)
            .await
            .map_err(|e| driver_err(&config.name, e))?;

        let catalog = Catalog::build(&sql_dir, &runtime)?;

        let entry = Arc::new(ConnectionEntry {
            runtime,
            catalog: RwLock::new(catalog),
            private_options,
            initialized: AtomicBool::new(true),
        });

        self.order.push(config.name.clone());
        self.connections.insert(config.name, entry);
        Ok(())
    }

    pub fn connection(&self, name: &str) -> Option<&Arc<ConnectionEntry>> {
        self.connections.get(name)
    }

    /// Runs C3 initialization across every connection not already
    /// initialized (normally none, since `add_connection` initializes
    /// eagerly). A second call at the manager level is always fatal.
    pub async fn init(&self, opts: DispatchOptions) -> Result<DispatchResult<()>, SqlerError> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(SqlerError::configuration(
                "Manager::init was already called once for this manager",
            ));
        }
        self.run_dispatch(&opts, |entry| async move {
            if entry.initialized.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            entry
                .runtime
                .execution
                .driver()
                .init(&entry.private_options)
                .await
                .map_err(|e| driver_err(&entry.runtime.config.name, e))
        })
        .await
    }

    pub async fn state(&self, opts: DispatchOptions) -> Result<DispatchResult<DriverState>, SqlerError> {
        self.run_dispatch(&opts, |entry| async move {
            Ok(entry.runtime.execution.driver().state().await)
        })
        .await
    }

    pub async fn close(&self, opts: DispatchOptions) -> Result<DispatchResult<usize>, SqlerError> {
        self.run_dispatch(&opts, |entry| async move {
            entry
                .runtime
                .execution
                .driver()
                .close()
                .await
                .map_err(|e| driver_err(&entry.runtime.config.name, e))
        })
        .await
    }

    /// Swaps the live cache handle for each targeted connection. `CacheSurface`
    /// has no enumeration method, so an `is_transfer` request can only be
    /// honored as "install the new backend"; migrating existing entries would
    /// need a richer trait and is out of scope (see DESIGN.md).
    pub fn set_cache(&self, cache: Arc<dyn CacheSurface>, is_transfer: bool, opts: &DispatchOptions) {
        if is_transfer {
            log::warn!(
                "set_cache requested a transfer but CacheSurface cannot enumerate existing \
                 entries; the old backend's entries are left behind"
            );
        }
        for (_, entry) in self.select(&opts.names) {
            let mut guard = entry.runtime.cache.write().unwrap_or_else(|poisoned| {
                log::warn!("cache lock poisoned for {}, recovering", entry.runtime.config.name);
                poisoned.into_inner()
            });
            *guard = Some(cache.clone());
        }
    }

    fn select(&self, names: &Option<Vec<String>>) -> Vec<(String, Arc<ConnectionEntry>)> {
        self.order
            .iter()
            .filter(|name| names.as_ref().is_none_or(|wanted| wanted.iter().any(|n| n == *name)))
            .filter_map(|name| self.connections.get(name).map(|entry| (name.clone(), entry.clone())))
            .collect()
    }

    fn is_series(&self, name: &str, opts: &DispatchOptions) -> bool {
        opts.per_connection_series
            .get(name)
            .copied()
            .unwrap_or(opts.execute_in_series)
    }

    fn returns_errors(&self, name: &str, opts: &DispatchOptions) -> bool {
        opts.per_connection_return_errors
            .get(name)
            .copied()
            .unwrap_or(opts.return_errors)
    }

    /// Runs `op` over every selected connection. Connections whose effective
    /// policy is series run sequentially, in registration order; the
    /// parallel group is then started concurrently via `tokio::spawn` and
    /// awaited together with `futures::future::join_all`. A failure on a
    /// connection whose effective `returnErrors` is true is collected into
    /// `errors`; a failure on a connection whose effective `returnErrors` is
    /// false instead fails the whole dispatch, surfaced as `Err` — for the
    /// series group this also skips every connection after it (including the
    /// whole parallel group); for the parallel group, every task has already
    /// been spawned by the time any of them can fail, so the rest still run
    /// to completion and their successes are discarded along with `errors`.
    async fn run_dispatch<T, F, Fut>(&self, opts: &DispatchOptions, op: F) -> Result<DispatchResult<T>, SqlerError>
    where
        T: Send + 'static,
        F: Fn(Arc<ConnectionEntry>) -> Fut,
        Fut: Future<Output = Result<T, SqlerError>> + Send + 'static,
    {
        let candidates = self.select(&opts.names);
        let (series, parallel): (Vec<_>, Vec<_>) =
            candidates.into_iter().partition(|(name, _)| self.is_series(name, opts));

        let mut by_name = HashMap::new();
        let mut errors = Vec::new();

        for (name, entry) in series {
            match op(entry).await {
                Ok(value) => {
                    by_name.insert(name, value);
                }
                Err(err) => {
                    if self.returns_errors(&name, opts) {
                        errors.push((name, err));
                    } else {
                        return Err(err);
                    }
                }
            }
        }

        let handles = parallel.into_iter().map(|(name, entry)| {
            let fut = op(entry);
            tokio::spawn(async move { (name, fut.await) })
        });
        let joined = futures::future::join_all(handles).await;

        let mut propagate = None;
        for outcome in joined {
            let (name, result) = outcome.expect("connection dispatch task panicked");
            match result {
                Ok(value) => {
                    by_name.insert(name, value);
                }
                Err(err) => {
                    if self.returns_errors(&name, opts) {
                        errors.push((name, err));
                    } else if propagate.is_none() {
                        propagate = Some(err);
                    }
                }
            }
        }

        if let Some(err) = propagate {
            return Err(err);
        }

        Ok(DispatchResult { by_name, errors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use std::time::{Duration, Instant};

    fn config(name: &str) -> ConnectionConfig {
        ConnectionConfig::new(name, name, "oracle")
    }

    #[tokio::test]
    async fn duplicate_connection_name_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("finance")).unwrap();
        let mut manager = Manager::new(dir.path());
        let driver = Arc::new(sqler_test_support::FakeDriver::new());
        manager
            .add_connection(config("finance"), driver.clone(), PrivateOptions::new(), None)
            .await
            .unwrap();
        let err = manager
            .add_connection(config("finance"), driver, PrivateOptions::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SqlerError::Configuration(_)));
    }

    #[tokio::test]
    async fn second_manager_init_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("finance")).unwrap();
        let mut manager = Manager::new(dir.path());
        let driver = Arc::new(sqler_test_support::FakeDriver::new());
        manager
            .add_connection(config("finance"), driver, PrivateOptions::new(), None)
            .await
            .unwrap();
        manager.init(DispatchOptions::default()).await.unwrap();
        let err = manager.init(DispatchOptions::default()).await.unwrap_err();
        assert!(matches!(err, SqlerError::Configuration(_)));
    }

    #[tokio::test]
    async fn series_dispatch_does_not_overlap() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        std::fs::create_dir_all(dir.path().join("b")).unwrap();
        let mut manager = Manager::new(dir.path());

        struct SleepyDriver;
        #[async_trait::async_trait]
        impl DriverAdapter for SleepyDriver {
            async fn init(&self, _: &PrivateOptions) -> Result<(), crate::error::DriverError> {
                Ok(())
            }
            async fn begin_transaction(
                &self,
                _: Option<&serde_json::Value>,
            ) -> Result<String, crate::error::DriverError> {
                Ok("tx-sleepy".to_string())
            }
            async fn commit_transaction(&self, _: &str) -> Result<(), crate::error::DriverError> {
                Ok(())
            }
            async fn rollback_transaction(&self, _: &str) -> Result<(), crate::error::DriverError> {
                Ok(())
            }
            async fn exec(
                &self,
                _: &str,
                _: &HashMap<String, Value>,
                _: &std::collections::HashSet<String>,
                _: &crate::driver::ExecMeta,
                _: Option<&serde_json::Value>,
            ) -> Result<Vec<crate::driver::Row>, crate::error::DriverError> {
                Ok(vec![])
            }
            async fn close(&self) -> Result<usize, crate::error::DriverError> {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(1)
            }
            async fn state(&self) -> DriverState {
                DriverState::default()
            }
        }

        manager
            .add_connection(config("a"), Arc::new(SleepyDriver), PrivateOptions::new(), None)
            .await
            .unwrap();
        manager
            .add_connection(config("b"), Arc::new(SleepyDriver), PrivateOptions::new(), None)
            .await
            .unwrap();

        let started = Instant::now();
        let opts = DispatchOptions {
            execute_in_series: true,
            ..Default::default()
        };
        manager.close(opts).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
    }
}
