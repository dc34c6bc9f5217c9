//! `sqler`: a multi-dialect SQL orchestration manager. Turns a directory
//! tree of `.sql` files into a hierarchical catalog of prepared functions
//! over one or more named database connections. Concrete dialect drivers,
//! cache backends, and logging sinks are deliberately out of scope; see
//! `sqler_test_support` for test doubles and DESIGN.md for the grounding
//! ledger.

pub mod binds;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod driver;
pub mod error;
pub mod execution;
pub mod manager;
pub mod prepared;
pub mod template;
pub mod value;

pub use binds::{generate_cache_key, interpolate, named_bind_sequence, positional_binds};
pub use cache::{CacheEntry, CacheError, CacheSurface};
pub use catalog::{Catalog, CrudType, NamespaceBranch, NamespaceNode, PreparedMeta, RESERVED_NAME};
pub use config::{ConnectionConfig, DateFormatter, PrivateOptions};
pub use driver::{ConnectionPoolState, DriverAdapter, DriverState, ExecMeta, Row, TransactionHandle};
pub use error::{DriverError, ExecutionError, RedactedOptions, SqlerError, ValidationError};
pub use execution::{ErrorOptions, ExecOptions, ExecResult, ExecutionService};
pub use manager::{ConnectionEntry, ConnectionRuntime, DispatchOptions, DispatchResult, Manager};
pub use prepared::{InvokeOptions, PreparedFunction};
pub use value::Value;
