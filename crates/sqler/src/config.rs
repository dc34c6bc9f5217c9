use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::value::Value;

/// How a per-call or per-connection date value is rendered before it is
/// handed to the driver.
///
/// `Iso8601` is the literal `true` from the design's date-formatting rule;
/// `Custom` is a user-supplied callback. Only `Iso8601` round-trips through
/// (de)serialization — a closure can't be serialized, so configs loaded from
/// JSON/TOML get `Iso8601` or nothing, and callers wire up `Custom` in code.
#[derive(Clone)]
pub enum DateFormatter {
    Iso8601,
    Custom(Arc<dyn Fn(&Value) -> Option<String> + Send + Sync>),
}

impl DateFormatter {
    /// Apply the date-formatting rule: ISO for the literal-true case, the
    /// callback's return value when it produces one, otherwise the original
    /// value unchanged.
    pub fn format(&self, value: &Value) -> Value {
        let formatted = match self {
            DateFormatter::Iso8601 => value.to_iso8601(),
            DateFormatter::Custom(f) => f(value),
        };
        match formatted {
            Some(text) => Value::Text(text),
            None => value.clone(),
        }
    }
}

impl fmt::Debug for DateFormatter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DateFormatter::Iso8601 => write!(f, "DateFormatter::Iso8601"),
            DateFormatter::Custom(_) => write!(f, "DateFormatter::Custom(..)"),
        }
    }
}

/// Immutable connection descriptor, constructed once and registered with the
/// `Manager`. Everything except `date_formatter` can be loaded from a plain
/// config file by a host application; `date_formatter` is wired up in code
/// when it needs to be a callback rather than the ISO-8601 default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Credential lookup key into the manager's `PrivateOptions` map.
    pub id: String,
    /// Namespace key; unique within a manager.
    pub name: String,
    /// Lowercase dialect selector (normalized in `new`).
    pub dialect: String,
    /// SQL root override; defaults to `name` when absent.
    pub dir: Option<String>,
    #[serde(default)]
    pub version: f64,
    /// Regex-source / replacement pairs applied once at file-read time, in
    /// order.
    #[serde(default)]
    pub substitutes: Vec<(String, String)>,
    #[serde(default)]
    pub binds: HashMap<String, Value>,
    #[serde(skip)]
    pub date_formatter: Option<DateFormatter>,
    #[serde(default)]
    pub log_tags: Vec<String>,
}

impl ConnectionConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>, dialect: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            dialect: dialect.into().to_lowercase(),
            dir: None,
            version: 0.0,
            substitutes: Vec::new(),
            binds: HashMap::new(),
            date_formatter: None,
            log_tags: Vec::new(),
        }
    }

    pub fn with_dir(mut self, dir: impl Into<String>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn with_version(mut self, version: f64) -> Self {
        self.version = version;
        self
    }

    pub fn with_bind(mut self, key: impl Into<String>, value: Value) -> Self {
        self.binds.insert(key.into(), value);
        self
    }

    pub fn with_date_formatter(mut self, formatter: DateFormatter) -> Self {
        self.date_formatter = Some(formatter);
        self
    }

    /// Resolves the SQL root directory for this connection under `main_path`.
    pub fn sql_dir(&self, main_path: &Path) -> PathBuf {
        main_path.join(self.dir.as_deref().unwrap_or(&self.name))
    }
}

/// Credentials and host for one connection, keyed by `ConnectionConfig::id`.
/// Cloned defensively before being handed to a driver adapter so the driver
/// cannot mutate the manager's copy.
#[derive(Clone, Default)]
pub struct PrivateOptions {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<SecretString>,
    /// Driver-specific fields the core does not interpret.
    pub extra: HashMap<String, serde_json::Value>,
}

impl fmt::Debug for PrivateOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("extra", &self.extra)
            .finish()
    }
}

impl PrivateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(SecretString::from(password.into()));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_lowercases_dialect() {
        let cfg = ConnectionConfig::new("id-1", "finance", "ORACLE");
        assert_eq!(cfg.dialect, "oracle");
    }

    #[test]
    fn sql_dir_defaults_to_name() {
        let cfg = ConnectionConfig::new("id-1", "finance", "oracle");
        assert_eq!(cfg.sql_dir(Path::new("/root")), PathBuf::from("/root/finance"));
    }

    #[test]
    fn sql_dir_honors_override() {
        let cfg = ConnectionConfig::new("id-1", "finance", "oracle").with_dir("fin-scripts");
        assert_eq!(
            cfg.sql_dir(Path::new("/root")),
            PathBuf::from("/root/fin-scripts")
        );
    }

    #[test]
    fn private_options_debug_redacts_password() {
        let opts = PrivateOptions::new().with_password("hunter2");
        let rendered = format!("{:?}", opts);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn iso8601_formatter_formats_dates() {
        let v = Value::Date(chrono::NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        let formatted = DateFormatter::Iso8601.format(&v);
        assert_eq!(formatted, Value::Text("2024-01-02".into()));
    }

    #[test]
    fn custom_formatter_falls_back_to_original_when_none() {
        let formatter = DateFormatter::Custom(Arc::new(|_: &Value| None));
        let original = Value::Int(5);
        assert_eq!(formatter.format(&original), original);
    }
}
