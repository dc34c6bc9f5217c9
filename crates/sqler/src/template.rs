//! The pure SQL rewrite pipeline: conjunction expansion, simple array-bind
//! expansion, then dialect/version/fragment gating, in that order. Every
//! pass is a regex-driven text transform; none of them touch a driver or the
//! filesystem.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::binds::find_bind_tokens;
use crate::value::Value;

fn and_or_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)\[\[(AND|OR)\s+(.*?):([A-Za-z_][A-Za-z0-9_]*)(.*?)\]\]").unwrap()
    })
}

fn dialect_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)(?:--)?\[\[!\s+([A-Za-z_][A-Za-z0-9_]*)\]\](.*?)(?:--)?\[\[!\]\]")
            .unwrap()
    })
}

fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?is)(?:--)?\[\[version\s*(<=|>=|<>|=|<|>)\s*([0-9]+(?:\.[0-9]+)?)\]\](.*?)(?:--)?\[\[version\]\]",
        )
        .unwrap()
    })
}

fn fragment_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)(?:--)?\[\[\?\s+([A-Za-z_][A-Za-z0-9_]*)\]\](.*?)(?:--)?\[\[\?\]\]")
            .unwrap()
    })
}

/// Rewrites `sql` against `binds`, `dialect_name`, `version` and
/// `active_fragments`, in the five-pass order the design lays out:
/// conjunction expansion, simple expansion, dialect gating, version gating,
/// fragment gating. Array binds consumed by either expansion pass are
/// written back into `binds` under their suffixed keys, so the caller's map
/// reflects every bind actually referenced by the returned SQL.
pub fn rewrite(
    sql: &str,
    binds: &mut HashMap<String, Value>,
    dialect_name: &str,
    version: f64,
    active_fragments: &HashSet<String>,
) -> String {
    let sql = expand_conjunctions(sql, binds);
    let sql = expand_simple(&sql, binds);
    let sql = gate_dialect(&sql, dialect_name);
    let sql = gate_version(&sql, version);
    gate_fragment(&sql, active_fragments)
}

fn expand_array_bind(name: &str, binds: &mut HashMap<String, Value>) -> Option<Vec<String>> {
    let items = match binds.get(name) {
        Some(Value::Array(items)) if !items.is_empty() => items.clone(),
        _ => return None,
    };
    let mut names = Vec::with_capacity(items.len());
    for (i, value) in items.into_iter().enumerate() {
        let key = if i == 0 {
            name.to_string()
        } else {
            format!("{name}{i}")
        };
        binds.insert(key.clone(), value);
        names.push(key);
    }
    Some(names)
}

fn expand_conjunctions(sql: &str, binds: &mut HashMap<String, Value>) -> String {
    let re = and_or_regex();
    let mut out = String::with_capacity(sql.len());
    let mut last = 0;
    for caps in re.captures_iter(sql) {
        let m = caps.get(0).unwrap();
        out.push_str(&sql[last..m.start()]);
        let conjunction = &caps[1];
        let prefix = &caps[2];
        let name = &caps[3];
        let suffix = &caps[4];
        match expand_array_bind(name, binds) {
            Some(names) => {
                let copies: Vec<String> = names
                    .iter()
                    .map(|key| format!("{prefix}:{key}{suffix}"))
                    .collect();
                out.push_str(&copies.join(&format!(" {conjunction} ")));
            }
            None => out.push_str(m.as_str()),
        }
        last = m.end();
    }
    out.push_str(&sql[last..]);
    out
}

fn expand_simple(sql: &str, binds: &mut HashMap<String, Value>) -> String {
    let tokens = find_bind_tokens(sql);
    let mut out = String::with_capacity(sql.len());
    let mut last = 0;
    for (start, end, name) in tokens {
        out.push_str(&sql[last..start]);
        match expand_array_bind(name, binds) {
            Some(names) => {
                let joined = names
                    .iter()
                    .map(|key| format!(":{key}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                out.push_str(&joined);
            }
            None => out.push_str(&sql[start..end]),
        }
        last = end;
    }
    out.push_str(&sql[last..]);
    out
}

/// Applies a gated-block regex, inserting the captured inner text when
/// `keep` holds and nothing otherwise. When the inserted text is blank and
/// the block sits on its own line (a newline immediately precedes and
/// follows it), the surrounding newline run is collapsed to exactly one
/// blank line rather than left to accumulate one gap per dropped tag line.
fn apply_gate(sql: &str, re: &Regex, inner_group: usize, mut keep: impl FnMut(&Captures) -> bool) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut last = 0;
    for caps in re.captures_iter(sql) {
        let m = caps.get(0).unwrap();
        out.push_str(&sql[last..m.start()]);
        let insert = if keep(&caps) { &caps[inner_group] } else { "" };
        if insert.trim().is_empty() {
            let after = &sql[m.end()..];
            let after_newlines = after.bytes().take_while(|&b| b == b'\n').count();
            if out.ends_with('\n') && after_newlines > 0 {
                while out.ends_with('\n') {
                    out.pop();
                }
                out.push('\n');
                out.push('\n');
                last = m.end() + after_newlines;
                continue;
            }
        }
        out.push_str(insert);
        last = m.end();
    }
    out.push_str(&sql[last..]);
    out
}

fn gate_dialect(sql: &str, dialect_name: &str) -> String {
    let dialect_name = dialect_name.to_lowercase();
    apply_gate(sql, dialect_regex(), 2, |caps| {
        caps[1].to_lowercase() == dialect_name
    })
}

#[derive(Debug, Clone, Copy)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl CompareOp {
    fn parse(text: &str) -> Option<Self> {
        match text {
            "=" => Some(Self::Eq),
            "<>" => Some(Self::Ne),
            "<" => Some(Self::Lt),
            ">" => Some(Self::Gt),
            "<=" => Some(Self::Le),
            ">=" => Some(Self::Ge),
            _ => None,
        }
    }

    fn holds(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::Eq => lhs == rhs,
            Self::Ne => lhs != rhs,
            Self::Lt => lhs < rhs,
            Self::Gt => lhs > rhs,
            Self::Le => lhs <= rhs,
            Self::Ge => lhs >= rhs,
        }
    }
}

fn gate_version(sql: &str, version: f64) -> String {
    apply_gate(sql, version_regex(), 3, |caps| {
        let op = match CompareOp::parse(&caps[1]) {
            Some(op) => op,
            None => return false,
        };
        let operand: f64 = match caps[2].parse() {
            Ok(n) => n,
            Err(_) => return false,
        };
        op.holds(version, operand)
    })
}

fn gate_fragment(sql: &str, active_fragments: &HashSet<String>) -> String {
    apply_gate(sql, fragment_regex(), 2, |caps| active_fragments.contains(&caps[1]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binds(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn conjunction_expansion_joins_copies_and_suppresses_first_suffix() {
        let mut b = binds(&[(
            "id",
            Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
        )]);
        let sql = expand_conjunctions("WHERE [[AND x = :id]]", &mut b);
        assert_eq!(sql, "WHERE x = :id AND x = :id1 AND x = :id2");
        assert_eq!(b.get("id1"), Some(&Value::Int(2)));
        assert_eq!(b.get("id2"), Some(&Value::Int(3)));
    }

    #[test]
    fn conjunction_block_left_unchanged_when_bind_is_not_an_array() {
        let mut b = binds(&[("id", Value::Int(5))]);
        let sql = expand_conjunctions("WHERE [[AND x = :id]]", &mut b);
        assert_eq!(sql, "WHERE [[AND x = :id]]");
    }

    #[test]
    fn simple_expansion_only_touches_remaining_bare_tokens() {
        let mut b = binds(&[(
            "ids",
            Value::Array(vec![Value::Int(1), Value::Int(2)]),
        )]);
        let sql = expand_simple("WHERE x IN (:ids)", &mut b);
        assert_eq!(sql, "WHERE x IN (:ids, :ids1)");
    }

    #[test]
    fn dialect_gate_keeps_matching_block_and_drops_others() {
        let sql = "SELECT 1\n[[! oracle]]\n, SUBSTR(x, 1, 1) y\n[[!]]\nFROM t";
        assert!(rewrite(sql, &mut HashMap::new(), "oracle", 0.0, &HashSet::new())
            .contains("SUBSTR"));
        assert!(!rewrite(sql, &mut HashMap::new(), "postgres", 0.0, &HashSet::new())
            .contains("SUBSTR"));
    }

    #[test]
    fn dialect_gate_tolerates_comment_embedded_tags() {
        let sql = "SELECT 1\n--[[! oracle]]\n, SUBSTR(x, 1, 1) y\n--[[!]]\nFROM t";
        assert!(rewrite(sql, &mut HashMap::new(), "oracle", 0.0, &HashSet::new())
            .contains("SUBSTR"));
    }

    #[test]
    fn version_gate_supports_all_six_comparisons() {
        let make = |op: &str| format!("SELECT 1 [[version {op} 2]] , 2 [[version]]");
        assert!(rewrite(&make("="), &mut HashMap::new(), "oracle", 2.0, &HashSet::new()).contains(", 2"));
        assert!(!rewrite(&make("="), &mut HashMap::new(), "oracle", 3.0, &HashSet::new()).contains(", 2"));
        assert!(rewrite(&make("<>"), &mut HashMap::new(), "oracle", 3.0, &HashSet::new()).contains(", 2"));
        assert!(rewrite(&make("<"), &mut HashMap::new(), "oracle", 1.0, &HashSet::new()).contains(", 2"));
        assert!(rewrite(&make(">"), &mut HashMap::new(), "oracle", 3.0, &HashSet::new()).contains(", 2"));
        assert!(rewrite(&make("<="), &mut HashMap::new(), "oracle", 2.0, &HashSet::new()).contains(", 2"));
        assert!(rewrite(&make(">="), &mut HashMap::new(), "oracle", 2.0, &HashSet::new()).contains(", 2"));
    }

    #[test]
    fn fragment_gate_keeps_block_only_when_key_is_active() {
        let sql = "SELECT 1 [[? audit]] , created_by [[?]]";
        let mut active = HashSet::new();
        active.insert("audit".to_string());
        assert!(rewrite(sql, &mut HashMap::new(), "oracle", 0.0, &active).contains("created_by"));
        assert!(!rewrite(sql, &mut HashMap::new(), "oracle", 0.0, &HashSet::new())
            .contains("created_by"));
    }

    #[test]
    fn dropped_block_between_newlines_leaves_a_single_blank_line() {
        let sql = "SELECT 1\n\n[[! oracle]]\nSUBSTR(x,1,1)\n[[!]]\n\nFROM t";
        let out = rewrite(sql, &mut HashMap::new(), "postgres", 0.0, &HashSet::new());
        assert!(!out.contains("\n\n\n"));
    }

    #[test]
    fn full_pipeline_runs_expansion_before_gating() {
        let mut b = binds(&[(
            "ids",
            Value::Array(vec![Value::Int(1), Value::Int(2)]),
        )]);
        let sql = "SELECT * FROM t WHERE x IN (:ids) [[? audit]] AND audited = 1 [[?]]";
        let mut active = HashSet::new();
        active.insert("audit".to_string());
        let out = rewrite(sql, &mut b, "oracle", 0.0, &active);
        assert_eq!(out, "SELECT * FROM t WHERE x IN (:ids, :ids1) AND audited = 1 ");
    }
}
