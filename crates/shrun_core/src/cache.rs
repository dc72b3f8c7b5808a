//! Time-bounded cache of external command results.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::result::CommandResult;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a (64 bit) over the command name and its arguments, each argument
/// preceded by a zero byte. Argument order matters.
pub fn cache_key(name: &str, args: &[String]) -> u64 {
    fn feed(mut hash: u64, bytes: &[u8]) -> u64 {
        for b in bytes {
            hash ^= u64::from(*b);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        hash
    }

    let mut hash = feed(FNV_OFFSET_BASIS, name.as_bytes());
    for arg in args {
        hash = feed(hash, &[0]);
        hash = feed(hash, arg.as_bytes());
    }
    hash
}

/// Lifetime of a cached result, by command name.
pub fn ttl_for(name: &str) -> Duration {
    match name {
        "ls" | "pwd" | "whoami" | "date" => Duration::from_secs(30),
        "echo" | "cat" | "grep" => Duration::from_secs(2 * 60),
        "find" | "stat" | "file" => Duration::from_secs(5 * 60),
        _ => Duration::from_secs(60),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    result: CommandResult,
    created_at: Instant,
    expires_at: Instant,
    // insertion order; Instants can tie on fast inserts
    seq: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<u64, CacheEntry>,
    next_seq: u64,
}

/// Thread-safe result cache keyed by [`cache_key`].
///
/// Lookups take the read lock and only escalate to the write lock to purge
/// an entry found expired.
#[derive(Debug)]
pub struct CommandCache {
    inner: RwLock<Inner>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CommandCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            capacity: capacity.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, name: &str, args: &[String]) -> Option<CommandResult> {
        let key = cache_key(name, args);
        let now = Instant::now();

        let expired = {
            let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
            match inner.entries.get(&key) {
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                Some(entry) if now < entry.expires_at => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.result.clone());
                }
                Some(_) => true,
            }
        };

        if expired {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            // another thread may have replaced it meanwhile
            if inner
                .entries
                .get(&key)
                .is_some_and(|entry| now >= entry.expires_at)
            {
                inner.entries.remove(&key);
                shrun_log_debug!(command = name, "expired cache entry purged");
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn put(&self, name: &str, args: &[String], result: CommandResult) {
        self.put_with_ttl(name, args, result, ttl_for(name));
    }

    pub fn put_with_ttl(&self, name: &str, args: &[String], result: CommandResult, ttl: Duration) {
        let key = cache_key(name, args);
        let now = Instant::now();
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            Self::evict_oldest(&mut inner);
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            key,
            CacheEntry {
                result,
                created_at: now,
                expires_at: now + ttl,
                seq,
            },
        );
    }

    fn evict_oldest(inner: &mut Inner) {
        let oldest = inner
            .entries
            .iter()
            .min_by_key(|(_, entry)| (entry.created_at, entry.seq))
            .map(|(key, _)| *key);
        if let Some(key) = oldest {
            inner.entries.remove(&key);
        }
    }

    pub fn invalidate(&self, name: &str, args: &[String]) {
        let key = cache_key(name, args);
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .remove(&key);
    }

    /// Drop every entry and reset the hit/miss counters.
    pub fn clear(&self) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .clear();
        self.reset_stats();
    }

    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    /// Keys are hashes, so a prefix cannot be matched: any non-empty prefix
    /// clears the whole cache.
    pub fn invalidate_all_with_prefix(&self, prefix: &str) {
        if prefix.is_empty() {
            return;
        }
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::ExecutionMode;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn result(output: &str) -> CommandResult {
        CommandResult::success("cmd", ExecutionMode::Process, output)
    }

    #[test]
    fn key_matches_reference_fnv1a() {
        // FNV-1a 64 of the empty input is the offset basis; "a" is a known vector
        assert_eq!(cache_key("", &[]), 0xcbf29ce484222325);
        assert_eq!(cache_key("a", &[]), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn key_separates_arguments() {
        assert_ne!(cache_key("ab", &[]), cache_key("a", &args(&["b"])));
        assert_ne!(cache_key("a", &args(&["b", "c"])), cache_key("a", &args(&["c", "b"])));
        assert_eq!(cache_key("a", &args(&["b"])), cache_key("a", &args(&["b"])));
    }

    #[test]
    fn ttl_heuristic() {
        assert_eq!(ttl_for("ls"), Duration::from_secs(30));
        assert_eq!(ttl_for("date"), Duration::from_secs(30));
        assert_eq!(ttl_for("grep"), Duration::from_secs(120));
        assert_eq!(ttl_for("stat"), Duration::from_secs(300));
        assert_eq!(ttl_for("uname"), Duration::from_secs(60));
    }

    #[test]
    fn hit_and_miss_are_counted() {
        let cache = CommandCache::new(4);
        assert!(cache.get("echo", &args(&["hi"])).is_none());
        cache.put("echo", &args(&["hi"]), result("hi\n"));
        assert_eq!(cache.get("echo", &args(&["hi"])).unwrap().output, "hi\n");
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                size: 1
            }
        );
    }

    #[test]
    fn reset_stats_keeps_entries() {
        let cache = CommandCache::new(4);
        cache.put("echo", &[], result("x"));
        cache.get("echo", &[]);
        cache.get("nope", &[]);
        cache.reset_stats();
        assert_eq!(cache.stats(), CacheStats { hits: 0, misses: 0, size: 1 });
        assert!(cache.get("echo", &[]).is_some());
    }

    #[test]
    fn full_cache_evicts_exactly_the_oldest() {
        let cache = CommandCache::new(2);
        cache.put("a", &[], result("a"));
        cache.put("b", &[], result("b"));
        cache.put("c", &[], result("c"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a", &[]).is_none());
        assert!(cache.get("b", &[]).is_some());
        assert!(cache.get("c", &[]).is_some());
    }

    #[test]
    fn replacing_a_key_does_not_evict() {
        let cache = CommandCache::new(2);
        cache.put("a", &[], result("a1"));
        cache.put("b", &[], result("b"));
        cache.put("a", &[], result("a2"));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a", &[]).unwrap().output, "a2");
        assert!(cache.get("b", &[]).is_some());
    }

    #[test]
    fn expired_entries_are_purged_on_lookup() {
        let cache = CommandCache::new(4);
        cache.put_with_ttl("ls", &[], result("x"), Duration::ZERO);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("ls", &[]).is_none());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn invalidation() {
        let cache = CommandCache::new(4);
        cache.put("a", &args(&["1"]), result("a"));
        cache.put("b", &[], result("b"));
        cache.invalidate("a", &args(&["1"]));
        assert_eq!(cache.len(), 1);

        cache.invalidate_all_with_prefix("");
        assert_eq!(cache.len(), 1);
        cache.invalidate_all_with_prefix("zzz");
        assert!(cache.is_empty());
    }

    #[test]
    fn clear_resets_stats() {
        let cache = CommandCache::new(4);
        cache.put("a", &[], result("a"));
        let _ = cache.get("a", &[]);
        let _ = cache.get("b", &[]);
        cache.clear();
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 0,
                misses: 0,
                size: 0
            }
        );
        assert_eq!(cache.capacity(), 4);
    }
}
