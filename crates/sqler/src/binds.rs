//! Manager-level static utilities: `generateCacheKey`, `namedBindSequence`,
//! `positionalBinds`, and `interpolate` from the design's component-design
//! section for the manager/dispatcher.

use std::collections::HashMap;

use crate::error::SqlerError;
use crate::value::Value;

/// Deterministic cache key, stable across process restarts given identical
/// configuration: `"sqler:{dialect}:{connName}:db:{name}:{ext}"`.
pub fn generate_cache_key(dialect: &str, conn_name: &str, method_name: &str, ext: &str) -> String {
    format!("sqler:{dialect}:{conn_name}:db:{method_name}:{ext}")
}

/// Find every `:identifier` bind token in `sql` that lies outside a
/// single-quoted string literal (`\\` escapes the following character,
/// including an escaped quote). Returns `(byte_start, byte_end, name)`
/// triples in source order.
pub(crate) fn find_bind_tokens(sql: &str) -> Vec<(usize, usize, &str)> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut in_string = false;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if in_string {
            if c == b'\\' {
                i += 2;
                continue;
            }
            if c == b'\'' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        if c == b'\'' {
            in_string = true;
            i += 1;
            continue;
        }
        if c == b':' && i + 1 < bytes.len() && is_ident_start(bytes[i + 1]) {
            let start = i;
            let mut j = i + 1;
            while j < bytes.len() && is_ident_continue(bytes[j]) {
                j += 1;
            }
            tokens.push((start, j, &sql[i + 1..j]));
            i = j;
            continue;
        }
        i += 1;
    }
    tokens
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_continue(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Emit `count` copies of `sql`, each with every `:name` token rewritten to
/// `:name{i}` for copy index `i`. The first copy (`i == 0`) is left
/// unchanged — the same suppressed-suffix-zero quirk the bind expander
/// preserves.
pub fn named_bind_sequence(sql: &str, count: usize) -> Vec<String> {
    (0..count)
        .map(|i| {
            if i == 0 {
                return sql.to_string();
            }
            let tokens = find_bind_tokens(sql);
            let mut out = String::with_capacity(sql.len() + tokens.len() * 2);
            let mut last = 0;
            for (start, end, name) in tokens {
                out.push_str(&sql[last..start]);
                out.push(':');
                out.push_str(name);
                out.push_str(&i.to_string());
                last = end;
            }
            out.push_str(&sql[last..]);
            out
        })
        .collect()
}

/// Rewrite named binds (`:name`) in `sql` to positional `placeholder`
/// tokens, pushing the matching value from `object` into `array` in the
/// order encountered. An unbound name is a hard error.
pub fn positional_binds(
    sql: &str,
    object: &HashMap<String, Value>,
    array: &mut Vec<Value>,
    placeholder: &str,
) -> Result<String, SqlerError> {
    let tokens = find_bind_tokens(sql);
    let mut out = String::with_capacity(sql.len());
    let mut last = 0;
    for (start, end, name) in tokens {
        let value = object.get(name).ok_or_else(|| {
            SqlerError::catalog(format!("positional bind `:{name}` has no matching value"))
        })?;
        out.push_str(&sql[last..start]);
        out.push_str(placeholder);
        array.push(value.clone());
        last = end;
    }
    out.push_str(&sql[last..]);
    Ok(out)
}

/// Recursive copy from `source` into `dest`, substituting `${NAME}`
/// references found in string values against `interpolator` (falling back
/// to `dest` when `interpolator` is `None`). Objects recurse; arrays recurse
/// element-wise; every other JSON shape (numbers, bools, null) passes
/// through atomically. `validator(path, value)` may reject an entry, in
/// which case it is skipped rather than copied.
pub fn interpolate(
    dest: &mut serde_json::Value,
    source: &serde_json::Value,
    interpolator: Option<&serde_json::Value>,
    validator: Option<&dyn Fn(&str, &serde_json::Value) -> bool>,
) {
    // Snapshot the fallback interpolation source (`dest` itself) before any
    // mutation, since the recursive walk below overwrites `dest` in place.
    let interpolator_value = interpolator.cloned().unwrap_or_else(|| dest.clone());
    interpolate_at(dest, source, interpolator_value, validator, "");
}

fn interpolate_at(
    dest: &mut serde_json::Value,
    source: &serde_json::Value,
    interpolator: serde_json::Value,
    validator: Option<&dyn Fn(&str, &serde_json::Value) -> bool>,
    path: &str,
) {
    match source {
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, value) in map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                if let Some(validator) = validator {
                    if !validator(&child_path, value) {
                        continue;
                    }
                }
                let mut child = serde_json::Value::Null;
                interpolate_at(&mut child, value, interpolator.clone(), validator, &child_path);
                out.insert(key.clone(), child);
            }
            *dest = serde_json::Value::Object(out);
        }
        serde_json::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (idx, value) in items.iter().enumerate() {
                let child_path = format!("{path}[{idx}]");
                if let Some(validator) = validator {
                    if !validator(&child_path, value) {
                        continue;
                    }
                }
                let mut child = serde_json::Value::Null;
                interpolate_at(&mut child, value, interpolator.clone(), validator, &child_path);
                out.push(child);
            }
            *dest = serde_json::Value::Array(out);
        }
        serde_json::Value::String(text) => {
            *dest = serde_json::Value::String(substitute_references(text, &interpolator));
        }
        // Numbers, bools, null pass through atomically.
        other => *dest = other.clone(),
    }
}

fn substitute_references(text: &str, interpolator: &serde_json::Value) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(marker) = rest.find("${") {
        out.push_str(&rest[..marker]);
        let after_marker = &rest[marker + 2..];
        match after_marker.find('}') {
            Some(end) => {
                let name = &after_marker[..end];
                match interpolator.get(name) {
                    Some(value) => out.push_str(&json_scalar_to_string(value)),
                    None => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after_marker[end + 1..];
            }
            None => {
                out.push_str("${");
                rest = after_marker;
            }
        }
    }
    out.push_str(rest);
    out
}

fn json_scalar_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
