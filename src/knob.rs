//! # Knobs
//!
//! Flat knob names and their untyped scalar values, as they travel from the
//! collector to the recommendation service and back to the driver.
//!
//! A key carries at most one namespace prefix, the text before its first
//! `.`. The prefix is either a role known to the [`RoleMap`] (the knob lives
//! in that role's per-node configuration), the literal `global` (a global
//! variable of the live system), or anything else, in which case the whole
//! key is treated as a global variable name.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Namespace prefix that explicitly marks a global-scope knob.
pub const GLOBAL_NAMESPACE: &str = "global";

// ---------------------------------------------------------------------------
// KnobValue
// ---------------------------------------------------------------------------

/// An untyped scalar knob or metric value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KnobValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl KnobValue {
    /// Guess the narrowest scalar for a raw textual value read from a source.
    ///
    /// Integers win over floats; non-finite floats stay text.
    pub fn infer(raw: &str) -> KnobValue {
        let trimmed = raw.trim();
        if let Ok(i) = trimmed.parse::<i64>() {
            return KnobValue::Int(i);
        }
        match trimmed.parse::<f64>() {
            Ok(f) if f.is_finite() => KnobValue::Float(f),
            _ => KnobValue::Text(raw.to_string()),
        }
    }

    /// Numeric view, if the value is or parses as a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            KnobValue::Int(i) => Some(*i as f64),
            KnobValue::Float(f) => Some(*f),
            KnobValue::Bool(_) => None,
            KnobValue::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Render as a literal for the right-hand side of a `SET` statement.
    pub fn to_sql_literal(&self) -> String {
        match self {
            KnobValue::Bool(true) => "ON".to_string(),
            KnobValue::Bool(false) => "OFF".to_string(),
            KnobValue::Int(i) => i.to_string(),
            KnobValue::Float(f) => f.to_string(),
            KnobValue::Text(s) => {
                let mut out = String::with_capacity(s.len() + 2);
                out.push('\'');
                for c in s.chars() {
                    match c {
                        '\'' => out.push_str("''"),
                        '\\' => out.push_str("\\\\"),
                        other => out.push(other),
                    }
                }
                out.push('\'');
                out
            }
        }
    }

    /// Convert into a YAML scalar for the topology document.
    pub fn to_yaml(&self) -> serde_yaml::Value {
        match self {
            KnobValue::Bool(b) => serde_yaml::Value::Bool(*b),
            KnobValue::Int(i) => serde_yaml::Value::Number((*i).into()),
            KnobValue::Float(f) => serde_yaml::Value::Number((*f).into()),
            KnobValue::Text(s) => serde_yaml::Value::String(s.clone()),
        }
    }
}

impl From<serde_json::Value> for KnobValue {
    /// Total conversion: nested or null values are kept as their JSON text.
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Bool(b) => KnobValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => KnobValue::Int(i),
                None => KnobValue::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => KnobValue::Text(s),
            other => KnobValue::Text(other.to_string()),
        }
    }
}

impl From<&str> for KnobValue {
    fn from(s: &str) -> Self {
        KnobValue::Text(s.to_string())
    }
}

impl From<String> for KnobValue {
    fn from(s: String) -> Self {
        KnobValue::Text(s)
    }
}

impl From<i64> for KnobValue {
    fn from(i: i64) -> Self {
        KnobValue::Int(i)
    }
}

impl From<f64> for KnobValue {
    fn from(f: f64) -> Self {
        KnobValue::Float(f)
    }
}

impl From<bool> for KnobValue {
    fn from(b: bool) -> Self {
        KnobValue::Bool(b)
    }
}

impl fmt::Display for KnobValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KnobValue::Bool(b) => write!(f, "{b}"),
            KnobValue::Int(i) => write!(f, "{i}"),
            KnobValue::Float(x) => write!(f, "{x}"),
            KnobValue::Text(s) => write!(f, "{s}"),
        }
    }
}

// ---------------------------------------------------------------------------
// RoleMap / KnobScope
// ---------------------------------------------------------------------------

/// Where a knob is applied, derived from its namespace prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnobScope<'a> {
    /// A global variable of the live system; `name` has any `global.` prefix stripped.
    Global { name: &'a str },
    /// A per-node configuration entry of every node of `role`.
    Role { role: &'a str, name: &'a str },
}

/// Known roles, each mapped to the topology section listing its nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleMap(BTreeMap<String, String>);

impl Default for RoleMap {
    fn default() -> Self {
        RoleMap::from_pairs([
            ("tidb", "tidb_servers"),
            ("tikv", "tikv_servers"),
            ("pd", "pd_servers"),
            ("tiflash", "tiflash_servers"),
        ])
    }
}

impl RoleMap {
    pub fn from_pairs<I, R, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (R, S)>,
        R: Into<String>,
        S: Into<String>,
    {
        RoleMap(
            pairs
                .into_iter()
                .map(|(r, s)| (r.into(), s.into()))
                .collect(),
        )
    }

    /// Topology section holding the nodes of `role`.
    pub fn section(&self, role: &str) -> Option<&str> {
        self.0.get(role).map(String::as_str)
    }

    pub fn contains(&self, role: &str) -> bool {
        self.0.contains_key(role)
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Classify `key` by its namespace prefix.
    pub fn classify<'k>(&self, key: &'k str) -> KnobScope<'k> {
        match key.split_once('.') {
            Some((prefix, rest)) if prefix == GLOBAL_NAMESPACE => KnobScope::Global { name: rest },
            Some((prefix, rest)) if !rest.is_empty() && self.contains(prefix) => KnobScope::Role {
                role: prefix,
                name: rest,
            },
            _ => KnobScope::Global { name: key },
        }
    }
}

/// True when `name` is safe to splice into `SET @@GLOBAL.<name>`.
///
/// Dot-separated, non-empty segments of ASCII alphanumerics, `_` and `-`.
pub fn is_valid_variable_name(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|seg| {
            !seg.is_empty()
                && seg
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        })
        && !name.starts_with('-')
}

// ---------------------------------------------------------------------------
// KnobSet
// ---------------------------------------------------------------------------

/// Ordered mapping of knob key to value, with no duplicate keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KnobSet(BTreeMap<String, KnobValue>);

/// A knob set split by destination.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionedKnobs {
    /// `(variable name, value)` in key order, `global.` prefix stripped.
    pub globals: Vec<(String, KnobValue)>,
    /// Role → knob set holding only that role's keys (prefix kept).
    pub by_role: BTreeMap<String, KnobSet>,
}

impl PartitionedKnobs {
    /// Every namespaced knob, prefix kept, as one set.
    pub fn role_knobs(&self) -> KnobSet {
        let mut all = KnobSet::new();
        for set in self.by_role.values() {
            for (k, v) in set.iter() {
                all.insert(k.clone(), v.clone());
            }
        }
        all
    }

    pub fn roles(&self) -> Vec<String> {
        self.by_role.keys().cloned().collect()
    }
}

impl KnobSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless the key is already present; returns whether it was inserted.
    pub fn insert_first(&mut self, key: impl Into<String>, value: impl Into<KnobValue>) -> bool {
        use std::collections::btree_map::Entry;
        match self.0.entry(key.into()) {
            Entry::Vacant(slot) => {
                slot.insert(value.into());
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    /// Insert, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<KnobValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&KnobValue> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &KnobValue)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    /// Split into global variables and per-role knobs.
    pub fn partition(&self, roles: &RoleMap) -> PartitionedKnobs {
        let mut out = PartitionedKnobs::default();
        for (key, value) in &self.0 {
            match roles.classify(key) {
                KnobScope::Global { name } => out.globals.push((name.to_string(), value.clone())),
                KnobScope::Role { role, .. } => {
                    out.by_role
                        .entry(role.to_string())
                        .or_default()
                        .insert(key.clone(), value.clone());
                }
            }
        }
        out
    }

    /// Scope-wrapped JSON document: `{"global": {...}, "local": null}`.
    pub fn to_scoped_json(&self) -> serde_json::Value {
        serde_json::json!({ "global": self.0, "local": serde_json::Value::Null })
    }
}

impl FromIterator<(String, KnobValue)> for KnobSet {
    fn from_iter<T: IntoIterator<Item = (String, KnobValue)>>(iter: T) -> Self {
        KnobSet(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a KnobSet {
    type Item = (&'a String, &'a KnobValue);
    type IntoIter = std::collections::btree_map::Iter<'a, String, KnobValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("global.timeout", KnobScope::Global { name: "timeout" })]
    #[case("tidb_mem_quota_query", KnobScope::Global { name: "tidb_mem_quota_query" })]
    #[case("tikv.storage.block-cache.capacity", KnobScope::Role { role: "tikv", name: "storage.block-cache.capacity" })]
    #[case("tidb.performance.max-procs", KnobScope::Role { role: "tidb", name: "performance.max-procs" })]
    #[case("unknown.x", KnobScope::Global { name: "unknown.x" })]
    #[case("tidb.", KnobScope::Global { name: "tidb." })]
    fn classify_by_prefix(#[case] key: &str, #[case] expected: KnobScope<'static>) {
        assert_eq!(RoleMap::default().classify(key), expected);
    }

    #[test]
    fn classify_uses_configured_roles_only() {
        let roles = RoleMap::from_pairs([("roleA", "a_servers")]);
        assert_eq!(
            roles.classify("roleA.cache_size"),
            KnobScope::Role { role: "roleA", name: "cache_size" }
        );
        assert_eq!(
            roles.classify("tikv.cache_size"),
            KnobScope::Global { name: "tikv.cache_size" }
        );
    }

    #[rstest]
    #[case(KnobValue::Int(30), "30")]
    #[case(KnobValue::Float(0.5), "0.5")]
    #[case(KnobValue::Bool(true), "ON")]
    #[case(KnobValue::Bool(false), "OFF")]
    #[case(KnobValue::Text("256MB".into()), "'256MB'")]
    #[case(KnobValue::Text("it's".into()), "'it''s'")]
    #[case(KnobValue::Text("a\\b".into()), "'a\\\\b'")]
    fn sql_literal(#[case] value: KnobValue, #[case] expected: &str) {
        assert_eq!(value.to_sql_literal(), expected);
    }

    #[rstest]
    #[case("tidb_mem_quota_query", true)]
    #[case("tidb.performance.max-procs", true)]
    #[case("", false)]
    #[case("a..b", false)]
    #[case("x; DROP TABLE t", false)]
    #[case("-leading", false)]
    fn variable_name_validation(#[case] name: &str, #[case] ok: bool) {
        assert_eq!(is_valid_variable_name(name), ok);
    }

    #[test]
    fn infer_prefers_integer_then_float_then_text() {
        assert_eq!(KnobValue::infer("42"), KnobValue::Int(42));
        assert_eq!(KnobValue::infer("1.25"), KnobValue::Float(1.25));
        assert_eq!(KnobValue::infer("NaN"), KnobValue::Text("NaN".into()));
        assert_eq!(KnobValue::infer("256MB"), KnobValue::Text("256MB".into()));
    }

    #[test]
    fn insert_first_keeps_first_writer() {
        let mut set = KnobSet::new();
        assert!(set.insert_first("a.x", "1"));
        assert!(!set.insert_first("a.x", "2"));
        assert_eq!(set.get("a.x"), Some(&KnobValue::Text("1".into())));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn insert_overwrites() {
        let mut set = KnobSet::new();
        set.insert("k", 1i64);
        set.insert("k", 2i64);
        assert_eq!(set.get("k"), Some(&KnobValue::Int(2)));
    }

    #[test]
    fn partition_splits_globals_and_roles() {
        let mut set = KnobSet::new();
        set.insert("global.timeout", 30i64);
        set.insert("tidb_enable_x", true);
        set.insert("tikv.raftstore.sync-log", false);
        set.insert("tidb.log.level", "warn");
        let parts = set.partition(&RoleMap::default());
        assert_eq!(
            parts.globals,
            vec![
                ("timeout".to_string(), KnobValue::Int(30)),
                ("tidb_enable_x".to_string(), KnobValue::Bool(true)),
            ]
        );
        assert_eq!(parts.roles(), vec!["tidb".to_string(), "tikv".to_string()]);
        assert_eq!(parts.role_knobs().len(), 2);
        assert!(parts.by_role["tikv"].get("tikv.raftstore.sync-log").is_some());
    }

    #[test]
    fn from_json_is_total() {
        assert_eq!(KnobValue::from(serde_json::json!(7)), KnobValue::Int(7));
        assert_eq!(KnobValue::from(serde_json::json!(7.5)), KnobValue::Float(7.5));
        assert_eq!(KnobValue::from(serde_json::json!("x")), KnobValue::Text("x".into()));
        assert_eq!(KnobValue::from(serde_json::json!(null)), KnobValue::Text("null".into()));
        assert_eq!(
            KnobValue::from(serde_json::json!([1, 2])),
            KnobValue::Text("[1,2]".into())
        );
    }

    #[test]
    fn scoped_json_has_global_and_null_local() {
        let mut set = KnobSet::new();
        set.insert("a.x", "1");
        let v = set.to_scoped_json();
        assert_eq!(v["global"]["a.x"], "1");
        assert!(v["local"].is_null());
    }
}
