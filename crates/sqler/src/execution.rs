//! The execution service (C4): one instance per connection, wrapping a
//! driver adapter. Applies the template engine, logs, calls the driver, and
//! on failure attaches the diagnostic envelope described in `error.rs`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::DateFormatter;
use crate::driver::{DriverAdapter, ExecMeta, Row};
use crate::error::{ExecutionError, RedactedOptions, SqlerError};
use crate::template;
use crate::value::Value;

/// Per-call options recognized by a prepared-function invocation and handed
/// down to the execution service.
#[derive(Clone)]
pub struct ExecOptions {
    pub name: Option<String>,
    pub crud_type: Option<String>,
    pub binds: HashMap<String, Value>,
    pub auto_commit: bool,
    pub transaction_id: Option<String>,
    pub prepare_statement: Option<bool>,
    pub driver_options: Option<serde_json::Value>,
    pub date_formatter: Option<DateFormatter>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            name: None,
            crud_type: None,
            binds: HashMap::new(),
            auto_commit: true,
            transaction_id: None,
            prepare_statement: None,
            driver_options: None,
            date_formatter: None,
        }
    }
}

/// How an execution failure is reported: propagated as `Err`, or captured
/// into `ExecResult::error` and returned, with an optional side-channel
/// handler called either way.
#[derive(Clone, Default)]
pub struct ErrorOptions {
    pub return_errors: bool,
    pub include_bind_values: bool,
    pub handler: Option<Arc<dyn Fn(&SqlerError) + Send + Sync>>,
}

impl fmt::Debug for ErrorOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorOptions")
            .field("return_errors", &self.return_errors)
            .field("include_bind_values", &self.include_bind_values)
            .field("handler", &self.handler.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl ErrorOptions {
    /// The `errorOpts === true` shorthand from the distilled spec: return
    /// errors, redact bind values, no handler.
    pub fn return_errors() -> Self {
        Self {
            return_errors: true,
            ..Default::default()
        }
    }
}

/// The uniform shape every prepared-function invocation resolves to.
pub struct ExecResult {
    pub rows: Option<Vec<Row>>,
    pub error: Option<SqlerError>,
    pub unprepare: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl fmt::Debug for ExecResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecResult")
            .field("rows", &self.rows)
            .field("error", &self.error)
            .field("unprepare", &self.unprepare.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// One instance per connection. Owns nothing but a driver handle and the
/// dialect/version pair the template engine gates against.
pub struct ExecutionService {
    driver: Arc<dyn DriverAdapter>,
    dialect: String,
    version: f64,
}

impl ExecutionService {
    pub fn new(driver: Arc<dyn DriverAdapter>, dialect: impl Into<String>, version: f64) -> Self {
        Self {
            driver,
            dialect: dialect.into(),
            version,
        }
    }

    pub fn driver(&self) -> &Arc<dyn DriverAdapter> {
        &self.driver
    }

    /// The five steps of §4.4: rewrite, log, call, wrap-on-failure,
    /// log-on-success.
    pub async fn exec(
        &self,
        file: &Path,
        raw_sql: &str,
        mut exec_opts: ExecOptions,
        active_fragments: &HashSet<String>,
        error_opts: Option<&ErrorOptions>,
    ) -> Result<ExecResult, SqlerError> {
        let sql = template::rewrite(
            raw_sql,
            &mut exec_opts.binds,
            &self.dialect,
            self.version,
            active_fragments,
        );

        log::debug!(
            "exec {} ({}): {}",
            exec_opts.name.as_deref().unwrap_or("<unnamed>"),
            file.display(),
            sql
        );

        let meta = ExecMeta {
            name: exec_opts.name.clone(),
            file: file.to_path_buf(),
        };

        match self
            .driver
            .exec(
                &sql,
                &exec_opts.binds,
                active_fragments,
                &meta,
                exec_opts.driver_options.as_ref(),
            )
            .await
        {
            Ok(rows) => {
                log::debug!("{} row(s) returned", rows.len());
                Ok(ExecResult {
                    rows: Some(rows),
                    error: None,
                    unprepare: None,
                })
            }
            Err(source) => {
                self.wrap_failure(&exec_opts, file, sql, active_fragments, error_opts, source)
            }
        }
    }

    fn wrap_failure(
        &self,
        exec_opts: &ExecOptions,
        file: &Path,
        sql: String,
        active_fragments: &HashSet<String>,
        error_opts: Option<&ErrorOptions>,
        source: crate::error::DriverError,
    ) -> Result<ExecResult, SqlerError> {
        let include_values = error_opts.map(|o| o.include_bind_values).unwrap_or(false);
        let redacted = RedactedOptions {
            name: exec_opts.name.clone(),
            crud_type: exec_opts.crud_type.clone(),
            bind_keys: exec_opts.binds.keys().cloned().collect(),
            bind_values: include_values.then(|| exec_opts.binds.clone()),
            auto_commit: exec_opts.auto_commit,
            transaction_id: exec_opts.transaction_id.clone(),
            prepare_statement: exec_opts.prepare_statement,
        };
        let mut fragments: Vec<String> = active_fragments.iter().cloned().collect();
        fragments.sort();

        let err = SqlerError::Execution(ExecutionError::new(
            exec_opts.name.clone(),
            file.to_path_buf(),
            sql,
            redacted,
            fragments,
            source,
        ));

        if let Some(opts) = error_opts {
            if let Some(handler) = &opts.handler {
                handler(&err);
            }
            if opts.return_errors {
                log::error!("{err}");
                return Ok(ExecResult {
                    rows: None,
                    error: Some(err),
                    unprepare: None,
                });
            }
        }
        log::error!("{err}");
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{ConnectionPoolState, DriverState};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FlakyDriver {
        fail: bool,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DriverAdapter for FlakyDriver {
        async fn init(&self, _options: &crate::config::PrivateOptions) -> Result<(), crate::error::DriverError> {
            Ok(())
        }

        async fn begin_transaction(
            &self,
            _options: Option<&serde_json::Value>,
        ) -> Result<String, crate::error::DriverError> {
            Ok("tx-flaky".to_string())
        }

        async fn commit_transaction(&self, _id: &str) -> Result<(), crate::error::DriverError> {
            Ok(())
        }

        async fn rollback_transaction(&self, _id: &str) -> Result<(), crate::error::DriverError> {
            Ok(())
        }

        async fn exec(
            &self,
            sql: &str,
            _binds: &HashMap<String, Value>,
            _fragments: &HashSet<String>,
            _meta: &ExecMeta,
            _driver_options: Option<&serde_json::Value>,
        ) -> Result<Vec<Row>, crate::error::DriverError> {
            self.calls.lock().unwrap().push(sql.to_string());
            if self.fail {
                Err(Box::from("connection reset"))
            } else {
                Ok(vec![])
            }
        }

        async fn close(&self) -> Result<usize, crate::error::DriverError> {
            Ok(0)
        }

        async fn state(&self) -> DriverState {
            DriverState {
                pending: 0,
                connection: ConnectionPoolState::default(),
            }
        }
    }

    #[tokio::test]
    async fn successful_exec_returns_rows() {
        let driver = Arc::new(FlakyDriver {
            fail: false,
            calls: Mutex::new(Vec::new()),
        });
        let service = ExecutionService::new(driver, "oracle", 1.0);
        let result = service
            .exec(
                Path::new("db/finance/read.report.sql"),
                "SELECT 1",
                ExecOptions::default(),
                &HashSet::new(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(result.rows.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn failed_exec_propagates_by_default() {
        let driver = Arc::new(FlakyDriver {
            fail: true,
            calls: Mutex::new(Vec::new()),
        });
        let service = ExecutionService::new(driver, "oracle", 1.0);
        let err = service
            .exec(
                Path::new("db/finance/read.report.sql"),
                "SELECT 1",
                ExecOptions::default(),
                &HashSet::new(),
                None,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("report.sql"));
    }

    #[tokio::test]
    async fn failed_exec_returns_error_when_requested() {
        let driver = Arc::new(FlakyDriver {
            fail: true,
            calls: Mutex::new(Vec::new()),
        });
        let service = ExecutionService::new(driver, "oracle", 1.0);
        let result = service
            .exec(
                Path::new("db/finance/read.report.sql"),
                "SELECT 1",
                ExecOptions::default(),
                &HashSet::new(),
                Some(&ErrorOptions::return_errors()),
            )
            .await
            .unwrap();
        assert!(result.error.is_some());
        assert!(result.rows.is_none());
    }

    #[tokio::test]
    async fn bind_values_are_redacted_unless_requested() {
        let driver = Arc::new(FlakyDriver {
            fail: true,
            calls: Mutex::new(Vec::new()),
        });
        let service = ExecutionService::new(driver, "oracle", 1.0);
        let mut opts = ExecOptions::default();
        opts.binds.insert("secret".to_string(), Value::Text("shh".into()));
        let result = service
            .exec(
                Path::new("db/finance/read.report.sql"),
                "SELECT :secret",
                opts,
                &HashSet::new(),
                Some(&ErrorOptions::return_errors()),
            )
            .await
            .unwrap();
        let SqlerError::Execution(exec_err) = result.error.unwrap() else {
            panic!("expected an execution error");
        };
        assert!(exec_err.options.bind_values.is_none());
        assert_eq!(exec_err.options.bind_keys, vec!["secret".to_string()]);
    }
}
