//! The prepared function (C6): a closure-equivalent struct capturing
//! per-file metadata and a shared connection runtime. `invoke` implements
//! the six steps of the design's prepared-function-runtime section: CRUD
//! resolution, bind merging with date formatting, the autoCommit/transaction
//! invariant, SQL resolution via cache or captured text, and delegation to
//! the execution service.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use std::sync::RwLock;

use regex::Regex;

use crate::catalog::PreparedMeta;
use crate::config::DateFormatter;
use crate::error::{SqlerError, ValidationError};
use crate::execution::{ErrorOptions, ExecOptions, ExecResult};
use crate::manager::ConnectionRuntime;
use crate::value::Value;

/// Caller-facing per-invocation options. Distinct from `ExecOptions`, which
/// is the already-resolved, downstream shape handed to the execution
/// service.
#[derive(Clone, Default)]
pub struct InvokeOptions {
    pub name: Option<String>,
    /// CRUD override; overrides the catalog's inferred type when present.
    pub crud_type: Option<String>,
    pub binds: HashMap<String, Value>,
    pub auto_commit: Option<bool>,
    pub transaction_id: Option<String>,
    pub prepare_statement: Option<bool>,
    pub driver_options: Option<serde_json::Value>,
    pub date_formatter: Option<DateFormatter>,
}

pub struct PreparedFunction {
    meta: PreparedMeta,
    connection: Arc<ConnectionRuntime>,
    captured_sql: RwLock<Option<String>>,
}

impl PreparedFunction {
    pub fn new(meta: PreparedMeta, connection: Arc<ConnectionRuntime>) -> Self {
        Self {
            meta,
            connection,
            captured_sql: RwLock::new(None),
        }
    }

    pub fn meta(&self) -> &PreparedMeta {
        &self.meta
    }

    pub async fn invoke(
        &self,
        opts: InvokeOptions,
        active_fragments: &HashSet<String>,
        error_opts: Option<&ErrorOptions>,
    ) -> Result<ExecResult, SqlerError> {
        let crud = self.resolve_crud(&opts)?;

        let formatter = opts
            .date_formatter
            .as_ref()
            .or(self.connection.config.date_formatter.as_ref());
        let binds = self.merge_binds(&opts.binds, formatter);

        let auto_commit = opts.auto_commit.unwrap_or(true);
        if !auto_commit && opts.transaction_id.is_none() && opts.prepare_statement != Some(true) {
            return Err(SqlerError::Validation(ValidationError::autocommit_without_transaction(
                self.meta.path.clone(),
            )));
        }

        let exec_opts = ExecOptions {
            name: opts.name.clone().or_else(|| Some(self.meta.name.clone())),
            crud_type: Some(crud),
            binds,
            auto_commit,
            transaction_id: opts.transaction_id,
            prepare_statement: opts.prepare_statement,
            driver_options: opts.driver_options,
            date_formatter: opts.date_formatter,
        };

        let sql = self.resolve_sql()?;

        self.connection
            .execution
            .exec(&self.meta.path, &sql, exec_opts, active_fragments, error_opts)
            .await
    }

    fn resolve_crud(&self, opts: &InvokeOptions) -> Result<String, SqlerError> {
        if let Some(override_type) = &opts.crud_type {
            return Ok(override_type.to_uppercase());
        }
        match self.meta.crud {
            Some(crud) => Ok(crud.as_str().to_string()),
            None => Err(SqlerError::Validation(ValidationError::missing_crud_type(
                self.meta.path.clone(),
            ))),
        }
    }

    fn merge_binds(
        &self,
        call_binds: &HashMap<String, Value>,
        formatter: Option<&DateFormatter>,
    ) -> HashMap<String, Value> {
        let mut merged = HashMap::new();
        for (key, value) in &self.connection.config.binds {
            if !call_binds.contains_key(key) {
                merged.insert(key.clone(), format_if_date(value.clone(), formatter));
            }
        }
        for (key, value) in call_binds {
            merged.insert(key.clone(), format_if_date(value.clone(), formatter));
        }
        merged
    }

    fn resolve_sql(&self) -> Result<String, SqlerError> {
        let cache = {
            let guard = self
                .connection
                .cache
                .read()
                .unwrap_or_else(|poisoned| {
                    log::warn!("connection cache lock poisoned, recovering");
                    poisoned.into_inner()
                });
            guard.clone()
        };

        match cache {
            Some(cache) => {
                if let Some(entry) = cache.get(&self.meta.cache_key) {
                    return Ok(entry.item);
                }
                let text = read_and_substitute(&self.meta, &self.connection.config.substitutes)?;
                if let Err(err) = cache.set(&self.meta.cache_key, text.clone(), None) {
                    log::warn!("cache.set failed for {}: {err}", self.meta.cache_key);
                }
                Ok(text)
            }
            None => {
                if let Some(text) = self.captured_sql_snapshot() {
                    return Ok(text);
                }
                let text = read_and_substitute(&self.meta, &self.connection.config.substitutes)?;
                *self
                    .captured_sql
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(text.clone());
                Ok(text)
            }
        }
    }

    fn captured_sql_snapshot(&self) -> Option<String> {
        self.captured_sql
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

fn format_if_date(value: Value, formatter: Option<&DateFormatter>) -> Value {
    match formatter {
        Some(formatter) if value.is_date_like() => formatter.format(&value),
        _ => value,
    }
}

fn read_and_substitute(meta: &PreparedMeta, substitutes: &[(String, String)]) -> Result<String, SqlerError> {
    let mut text = fs::read_to_string(&meta.path)?;
    for (pattern, replacement) in substitutes {
        match Regex::new(pattern) {
            Ok(re) => text = re.replace_all(&text, replacement.as_str()).into_owned(),
            Err(err) => log::warn!("invalid substitute pattern `{pattern}` for {}: {err}", meta.path.display()),
        }
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::config::ConnectionConfig;
    use crate::execution::ExecutionService;
    use std::sync::RwLock as StdRwLock;
    use tempfile::tempdir;

    fn connection_with_binds(binds: &[(&str, Value)]) -> Arc<ConnectionRuntime> {
        let driver = Arc::new(sqler_test_support::FakeDriver::new());
        let mut config = ConnectionConfig::new("id-1", "finance", "oracle");
        for (k, v) in binds {
            config = config.with_bind(*k, v.clone());
        }
        Arc::new(ConnectionRuntime {
            config,
            execution: ExecutionService::new(driver, "oracle", 0.0),
            cache: StdRwLock::new(None),
        })
    }

    #[tokio::test]
    async fn missing_crud_type_fails_before_any_driver_call() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("unknown.sql"), "SELECT 1").unwrap();
        let connection = connection_with_binds(&[]);
        let catalog = Catalog::build(dir.path(), &connection).unwrap();
        let function = catalog.lookup("unknown").unwrap();
        let err = function
            .invoke(InvokeOptions::default(), &HashSet::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SqlerError::Validation(_)));
    }

    #[tokio::test]
    async fn explicit_type_override_resolves_crud() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("unknown.sql"), "SELECT 1").unwrap();
        let connection = connection_with_binds(&[]);
        let catalog = Catalog::build(dir.path(), &connection).unwrap();
        let function = catalog.lookup("unknown").unwrap();
        let opts = InvokeOptions {
            crud_type: Some("read".to_string()),
            ..Default::default()
        };
        let result = function.invoke(opts, &HashSet::new(), None).await.unwrap();
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn autocommit_false_without_transaction_fails_before_any_driver_call() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("read.a.sql"), "SELECT 1").unwrap();
        let connection = connection_with_binds(&[]);
        let catalog = Catalog::build(dir.path(), &connection).unwrap();
        let function = catalog.lookup("read.a").unwrap();
        let opts = InvokeOptions {
            auto_commit: Some(false),
            ..Default::default()
        };
        let err = function.invoke(opts, &HashSet::new(), None).await.unwrap_err();
        assert!(err.to_string().contains("beginTransaction"));
    }

    #[tokio::test]
    async fn call_binds_override_connection_defaults() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("read.a.sql"), "SELECT :id").unwrap();
        let connection = connection_with_binds(&[("id", Value::Int(1))]);
        let catalog = Catalog::build(dir.path(), &connection).unwrap();
        let function = catalog.lookup("read.a").unwrap();
        let mut call_binds = HashMap::new();
        call_binds.insert("id".to_string(), Value::Int(42));
        let opts = InvokeOptions {
            binds: call_binds,
            ..Default::default()
        };
        let merged = function.merge_binds(&opts.binds, None);
        assert_eq!(merged.get("id"), Some(&Value::Int(42)));
    }
}
