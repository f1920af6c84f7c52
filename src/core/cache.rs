//! Fingerprinting and bounded caching of tool results.
//!
//! A fingerprint is the deterministic identity of `(tool name, parameters)`:
//! equal invocations produce equal fingerprints regardless of parameter key
//! order. The cache is insertion-ordered FIFO with TTL as the primary
//! eviction driver; `get` self-enforces expiry so correctness never depends
//! on a periodic sweep.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::tools::spec::ToolResult;

// === Fingerprinting ===

/// Deterministic identity for a tool invocation.
#[must_use]
pub fn fingerprint(tool_name: &str, params: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(params, &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(tool_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Canonical serialization: object keys sorted recursively, arrays kept in
/// order, scalars rendered by serde_json.
pub(crate) fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Canonical string form of a parameter value, used for dedup identities.
#[must_use]
pub fn canonical_params(params: &Value) -> String {
    let mut out = String::new();
    write_canonical(params, &mut out);
    out
}

// === Cache ===

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub result: ToolResult,
    pub inserted_at: Instant,
    pub expires_at: Instant,
}

/// Bounded, TTL-aware cache of tool results keyed by fingerprint.
#[derive(Debug)]
pub struct ToolCache {
    entries: HashMap<String, CacheEntry>,
    /// Insertion order, oldest first.
    order: VecDeque<String>,
    max_entries: usize,
    default_ttl: Duration,
}

impl ToolCache {
    #[must_use]
    pub fn new(max_entries: usize, default_ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            max_entries,
            default_ttl,
        }
    }

    /// Look up an unexpired entry. Expired entries are removed and
    /// reported as a miss.
    pub fn get(&mut self, fingerprint: &str) -> Option<ToolResult> {
        let expired = match self.entries.get(fingerprint) {
            Some(entry) => entry.expires_at <= Instant::now(),
            None => return None,
        };
        if expired {
            self.remove(fingerprint);
            return None;
        }
        self.entries.get(fingerprint).map(|e| e.result.clone())
    }

    pub fn put(&mut self, fingerprint: impl Into<String>, result: ToolResult) {
        self.put_with_ttl(fingerprint, result, self.default_ttl);
    }

    /// Insert a result, evicting first so the size cap holds at every
    /// instant, never transiently after insertion.
    pub fn put_with_ttl(&mut self, fingerprint: impl Into<String>, result: ToolResult, ttl: Duration) {
        if self.max_entries == 0 {
            return;
        }
        let fingerprint = fingerprint.into();

        // Replacement keeps the slot but refreshes insertion order.
        self.remove(&fingerprint);
        self.sweep();
        while self.entries.len() >= self.max_entries {
            let Some(oldest) = self.order.front().cloned() else {
                break;
            };
            self.remove(&oldest);
        }

        let now = Instant::now();
        self.order.push_back(fingerprint.clone());
        self.entries.insert(
            fingerprint.clone(),
            CacheEntry {
                fingerprint,
                result,
                inserted_at: now,
                expires_at: now + ttl,
            },
        );
    }

    /// Proactively drop expired entries. Optional; `get` enforces expiry
    /// on its own.
    pub fn sweep(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.expires_at <= now)
            .map(|e| e.fingerprint.clone())
            .collect();
        for fingerprint in expired {
            self.remove(&fingerprint);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove(&mut self, fingerprint: &str) {
        if self.entries.remove(fingerprint).is_some() {
            self.order.retain(|f| f != fingerprint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn fingerprint_ignores_key_order() {
        let a = fingerprint("read_file", &json!({"path": "a.txt", "lines": 10}));
        let b = fingerprint("read_file", &json!({"lines": 10, "path": "a.txt"}));
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_sorts_nested_objects() {
        let a = fingerprint("t", &json!({"outer": {"x": 1, "y": [{"b": 2, "a": 1}]}}));
        let b = fingerprint("t", &json!({"outer": {"y": [{"a": 1, "b": 2}], "x": 1}}));
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_differs_by_tool_and_params() {
        let base = fingerprint("grep", &json!({"pattern": "x"}));
        assert_ne!(base, fingerprint("grep", &json!({"pattern": "y"})));
        assert_ne!(base, fingerprint("find", &json!({"pattern": "x"})));
        // Array order matters.
        assert_ne!(
            fingerprint("t", &json!({"items": [1, 2]})),
            fingerprint("t", &json!({"items": [2, 1]}))
        );
    }

    #[test]
    fn size_cap_holds_after_every_put() {
        let mut cache = ToolCache::new(3, Duration::from_secs(60));
        for i in 0..10 {
            cache.put(format!("fp{i}"), ToolResult::success(format!("r{i}")));
            assert!(cache.len() <= 3, "cap violated after put {i}");
        }
        // Oldest-first eviction: only the three newest survive.
        assert!(cache.get("fp6").is_none());
        assert!(cache.get("fp7").is_some());
        assert!(cache.get("fp9").is_some());
    }

    #[test]
    fn replacement_does_not_grow_the_cache() {
        let mut cache = ToolCache::new(2, Duration::from_secs(60));
        cache.put("fp", ToolResult::success("one"));
        cache.put("fp", ToolResult::success("two"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("fp").unwrap().content, "two");
    }

    #[test]
    fn expired_entry_is_a_miss_and_is_removed() {
        let mut cache = ToolCache::new(8, Duration::from_secs(60));
        cache.put_with_ttl("fp", ToolResult::success("stale"), Duration::ZERO);
        assert!(cache.get("fp").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn sweep_drops_only_expired_entries() {
        let mut cache = ToolCache::new(8, Duration::from_secs(60));
        cache.put_with_ttl("old", ToolResult::success("stale"), Duration::ZERO);
        cache.put("fresh", ToolResult::success("ok"));
        cache.sweep();
        assert_eq!(cache.len(), 1);
        assert!(cache.get("fresh").is_some());
    }

    #[test]
    fn clear_empties_everything() {
        let mut cache = ToolCache::new(8, Duration::from_secs(60));
        cache.put("a", ToolResult::success("1"));
        cache.put("b", ToolResult::success("2"));
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn zero_capacity_cache_stores_nothing() {
        let mut cache = ToolCache::new(0, Duration::from_secs(60));
        cache.put("fp", ToolResult::success("x"));
        assert!(cache.is_empty());
    }
}
