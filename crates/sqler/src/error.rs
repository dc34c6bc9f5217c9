use std::collections::HashMap;
use std::path::PathBuf;

use thiserror::Error;

use crate::value::Value;

/// Opaque error type returned by a `DriverAdapter`. The core never inspects
/// driver internals, so it only needs `Error + Send + Sync` to wrap and log
/// the failure; it does not downcast it.
pub type DriverError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Top-level error type for every fallible operation in this crate.
///
/// Mirrors the error kinds in the design's error-handling section one to
/// one: `Configuration` and `Catalog` errors are always fatal, `Validation`
/// errors are raised before any driver I/O, and `Execution` wraps whatever
/// the driver adapter returned.
#[derive(Debug, Error)]
pub enum SqlerError {
    /// Missing required config, unknown dialect, duplicate connection name,
    /// missing credentials. Always fatal at construction.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Reserved-name collision or I/O error during a catalog scan.
    #[error("catalog error: {0}")]
    Catalog(String),

    /// Missing/invalid CRUD type or an autoCommit/transaction invariant
    /// violation, raised before any driver I/O.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The driver adapter returned or threw during execution.
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// Filesystem error while resolving a `.sql` file's text.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SqlerError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn catalog(msg: impl Into<String>) -> Self {
        Self::Catalog(msg.into())
    }
}

/// A validation failure raised before any driver call, always attached to
/// the `.sql` file it concerns.
#[derive(Debug, Error)]
#[error("{message} (file: {})", file.display())]
pub struct ValidationError {
    pub message: String,
    pub file: PathBuf,
}

impl ValidationError {
    pub fn new(message: impl Into<String>, file: impl Into<PathBuf>) -> Self {
        Self {
            message: message.into(),
            file: file.into(),
        }
    }

    pub fn missing_crud_type(file: impl Into<PathBuf>) -> Self {
        let file = file.into();
        Self::new(
            format!(
                "{} has no inferred CRUD type from its filename; call with an explicit `type`",
                file.display()
            ),
            file,
        )
    }

    pub fn autocommit_without_transaction(file: impl Into<PathBuf>) -> Self {
        let file = file.into();
        Self::new(
            format!(
                "{} was invoked with autoCommit=false but no transactionId and no \
                 prepareStatement; call beginTransaction() first or pass \
                 prepareStatement=true",
                file.display()
            ),
            file,
        )
    }
}

/// A redacted snapshot of the options a prepared function was invoked with,
/// attached to an `ExecutionError`'s diagnostic envelope.
///
/// Bind values are dropped to keys-only unless the caller opted in via
/// `ErrorOptions::include_bind_values`.
#[derive(Debug, Clone, Default)]
pub struct RedactedOptions {
    pub name: Option<String>,
    pub crud_type: Option<String>,
    pub bind_keys: Vec<String>,
    pub bind_values: Option<HashMap<String, Value>>,
    pub auto_commit: bool,
    pub transaction_id: Option<String>,
    pub prepare_statement: Option<bool>,
}

/// Wraps a driver failure in the diagnostic envelope described in the
/// design's execution-service section: `{name, file, sql, options,
/// fragments}`, alongside the original cause.
#[derive(Debug, Error)]
#[error("execution failed for {} ({}): {source}", name.as_deref().unwrap_or("<unnamed>"), file.display())]
pub struct ExecutionError {
    pub name: Option<String>,
    pub file: PathBuf,
    pub sql: String,
    pub options: RedactedOptions,
    pub fragments: Vec<String>,
    #[source]
    pub source: DriverError,
}

impl ExecutionError {
    pub fn new(
        name: Option<String>,
        file: PathBuf,
        sql: String,
        options: RedactedOptions,
        fragments: Vec<String>,
        source: DriverError,
    ) -> Self {
        Self {
            name,
            file,
            sql,
            options,
            fragments,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_names_the_file() {
        let err = ValidationError::missing_crud_type("db/finance/adjust.sql");
        assert!(err.to_string().contains("adjust.sql"));
    }

    #[test]
    fn autocommit_error_suggests_begin_transaction() {
        let err = ValidationError::autocommit_without_transaction("db/finance/adjust.sql");
        assert!(err.to_string().contains("beginTransaction"));
    }

    #[test]
    fn execution_error_wraps_source() {
        let source: DriverError = Box::from("connection reset");
        let err = ExecutionError::new(
            Some("adjust".into()),
            PathBuf::from("db/finance/adjust.sql"),
            "UPDATE t SET x = 1".into(),
            RedactedOptions::default(),
            vec![],
            source,
        );
        assert!(err.to_string().contains("adjust.sql"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
