//! The catalog builder (C5): walks a connection's SQL root, builds the
//! namespace tree of prepared functions, and supports rescans that preserve
//! identity by cache key. Grounded on the teacher's `ScriptsDirectory`
//! filesystem walk (`fs::read_dir`, folders-then-files, skip hidden entries).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::binds::generate_cache_key;
use crate::error::SqlerError;
use crate::manager::ConnectionRuntime;
use crate::prepared::PreparedFunction;

/// The name reserved at every level of the namespace tree for the
/// connection-level `beginTransaction` operation (exposed as
/// `ConnectionRuntime::begin_transaction`, not as a tree leaf — its return
/// shape, a `TransactionHandle`, does not fit the uniform `ExecResult` every
/// other leaf produces).
pub const RESERVED_NAME: &str = "beginTransaction";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrudType {
    Create,
    Read,
    Update,
    Delete,
}

impl CrudType {
    fn parse(token: &str) -> Option<Self> {
        match token.to_uppercase().as_str() {
            "CREATE" => Some(Self::Create),
            "READ" => Some(Self::Read),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Read => "READ",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

/// Metadata recorded for each `.sql` file discovered during a scan.
#[derive(Debug, Clone)]
pub struct PreparedMeta {
    /// Dotted form, e.g. `finance.read.annual.report`.
    pub name: String,
    pub path: PathBuf,
    /// The last basename token before `.sql`, or `"sql"` when the basename
    /// has no intermediate dot.
    pub ext: String,
    pub crud: Option<CrudType>,
    pub cache_key: String,
}

/// A namespace branch: a directory, or the connection root. `name` is the
/// pre-collapse display name (empty for the connection root); `children` is
/// keyed by the collapsed segment.
pub struct NamespaceBranch {
    pub name: String,
    pub children: HashMap<String, NamespaceNode>,
}

pub enum NamespaceNode {
    Branch(NamespaceBranch),
    Leaf(Arc<PreparedFunction>),
}

impl NamespaceNode {
    pub fn as_branch(&self) -> Option<&NamespaceBranch> {
        match self {
            NamespaceNode::Branch(b) => Some(b),
            NamespaceNode::Leaf(_) => None,
        }
    }

    pub fn as_leaf(&self) -> Option<&Arc<PreparedFunction>> {
        match self {
            NamespaceNode::Leaf(f) => Some(f),
            NamespaceNode::Branch(_) => None,
        }
    }
}

/// One per connection: the namespace tree plus the scan logic that builds
/// and refreshes it.
pub struct Catalog {
    root: NamespaceBranch,
}

impl Catalog {
    /// Walks `sql_root` and builds a fresh namespace tree, failing on any
    /// reserved-name collision or unreadable directory.
    pub fn build(sql_root: &Path, connection: &Arc<ConnectionRuntime>) -> Result<Self, SqlerError> {
        let previous = HashMap::new();
        let children = scan_dir(sql_root, sql_root, connection, &previous)?;
        Ok(Self {
            root: NamespaceBranch {
                name: String::new(),
                children,
            },
        })
    }

    /// Re-walks `sql_root`. Files whose cache key matches an existing leaf
    /// keep the same `Arc<PreparedFunction>` (identity preserved across
    /// rescans); files no longer on disk are simply absent from the rebuilt
    /// tree (detached).
    pub fn rescan(&mut self, sql_root: &Path, connection: &Arc<ConnectionRuntime>) -> Result<(), SqlerError> {
        let mut previous = HashMap::new();
        collect_by_cache_key(&self.root, &mut previous);
        let children = scan_dir(sql_root, sql_root, connection, &previous)?;
        self.root = NamespaceBranch {
            name: String::new(),
            children,
        };
        Ok(())
    }

    pub fn root(&self) -> &NamespaceBranch {
        &self.root
    }

    /// Resolves a dotted path (e.g. `"finance.read.annual.report"`) to its
    /// prepared function. Stands in for the dynamic `db.a.b.c` dispatch the
    /// source language allows — see DESIGN.md.
    pub fn lookup(&self, path: &str) -> Option<Arc<PreparedFunction>> {
        let mut children = &self.root.children;
        let mut parts = path.split('.').peekable();
        while let Some(part) = parts.next() {
            let node = children.get(part)?;
            if parts.peek().is_none() {
                return node.as_leaf().cloned();
            }
            children = &node.as_branch()?.children;
        }
        None
    }
}

fn collect_by_cache_key(branch: &NamespaceBranch, out: &mut HashMap<String, Arc<PreparedFunction>>) {
    for child in branch.children.values() {
        match child {
            NamespaceNode::Leaf(f) => {
                out.insert(f.meta().cache_key.clone(), f.clone());
            }
            NamespaceNode::Branch(b) => collect_by_cache_key(b, out),
        }
    }
}

fn collapse_key(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    let mut last_was_underscore = false;
    for c in segment.chars() {
        if c.is_alphanumeric() {
            out.push(c);
            last_was_underscore = false;
        } else if !last_was_underscore {
            out.push('_');
            last_was_underscore = true;
        }
    }
    out
}

fn scan_dir(
    dir: &Path,
    sql_root: &Path,
    connection: &Arc<ConnectionRuntime>,
    previous: &HashMap<String, Arc<PreparedFunction>>,
) -> Result<HashMap<String, NamespaceNode>, SqlerError> {
    let read_dir = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) => {
            return Err(SqlerError::catalog(format!(
                "failed to read SQL directory {}: {e}",
                dir.display()
            )));
        }
    };

    let mut children = HashMap::new();
    for entry in read_dir {
        let entry = entry.map_err(|e| {
            SqlerError::catalog(format!("failed to read entry under {}: {e}", dir.display()))
        })?;
        let path = entry.path();
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();
        if name.starts_with('.') {
            continue;
        }

        if path.is_dir() {
            reject_reserved(&name)?;
            let sub_children = scan_dir(&path, sql_root, connection, previous)?;
            children.insert(
                collapse_key(&name),
                NamespaceNode::Branch(NamespaceBranch {
                    name: name.to_string(),
                    children: sub_children,
                }),
            );
        } else if path.extension().and_then(|e| e.to_str()) == Some("sql") {
            insert_leaf(&path, sql_root, connection, previous, &mut children)?;
        }
    }
    Ok(children)
}

fn reject_reserved(name: &str) -> Result<(), SqlerError> {
    if name == RESERVED_NAME {
        return Err(SqlerError::catalog(format!(
            "`{RESERVED_NAME}` is reserved and cannot be used as a directory or file name"
        )));
    }
    Ok(())
}

fn insert_leaf(
    path: &Path,
    sql_root: &Path,
    connection: &Arc<ConnectionRuntime>,
    previous: &HashMap<String, Arc<PreparedFunction>>,
    root_children: &mut HashMap<String, NamespaceNode>,
) -> Result<(), SqlerError> {
    let basename = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| SqlerError::catalog(format!("non-UTF-8 file name: {}", path.display())))?;
    let tokens: Vec<&str> = basename.split('.').collect();
    for token in &tokens {
        reject_reserved(token)?;
    }

    let ext = if tokens.len() > 1 {
        tokens[tokens.len() - 1].to_string()
    } else {
        "sql".to_string()
    };

    let dir_components: Vec<String> = path
        .strip_prefix(sql_root)
        .unwrap_or(path)
        .parent()
        .into_iter()
        .flat_map(|p| p.components())
        .filter_map(|c| c.as_os_str().to_str().map(str::to_string))
        .collect();

    let mut name_parts = dir_components.clone();
    name_parts.extend(tokens.iter().map(|t| t.to_string()));
    let name = name_parts.join(".");

    let cache_key = generate_cache_key(&connection.config.dialect, &connection.config.name, &name, &ext);

    let crud = CrudType::parse(tokens[0]);
    let meta = PreparedMeta {
        name,
        path: path.to_path_buf(),
        ext,
        crud,
        cache_key: cache_key.clone(),
    };

    let leaf = match previous.get(&cache_key) {
        Some(existing) => existing.clone(),
        None => Arc::new(PreparedFunction::new(meta, connection.clone())),
    };

    // Directory nesting is already handled by `scan_dir`'s own recursion —
    // `root_children` here is local to the file's own directory. Only the
    // basename's own dotted tokens (besides the last) still need nesting.
    let mut children = root_children;
    for token in &tokens[..tokens.len() - 1] {
        let key = collapse_key(token);
        let entry = children.entry(key).or_insert_with(|| {
            NamespaceNode::Branch(NamespaceBranch {
                name: token.to_string(),
                children: HashMap::new(),
            })
        });
        children = match entry {
            NamespaceNode::Branch(b) => &mut b.children,
            NamespaceNode::Leaf(_) => unreachable!("basename segment collided with a leaf"),
        };
    }
    let leaf_key = collapse_key(tokens[tokens.len() - 1]);
    children.insert(leaf_key, NamespaceNode::Leaf(leaf));
    Ok(())
}
