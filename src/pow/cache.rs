use std::collections::HashMap;
use std::sync::Mutex;

use crate::util::now_unix;

struct Entry {
    value: String,
    expire_at: i64,
}

/// Short-lived map from challenge fingerprint to the encoded PoW answer.
/// Entries expire one second before the challenge itself so a cached answer
/// is never submitted against a dead challenge.
#[derive(Default)]
pub struct AnswerCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl AnswerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(e) if e.expire_at > 0 && now_unix() >= e.expire_at => {
                entries.remove(key);
                None
            }
            Some(e) => Some(e.value.clone()),
            None => None,
        }
    }

    pub fn set(&self, key: &str, value: &str, expire_at: i64) {
        if expire_at > 0 && now_unix() >= expire_at {
            return;
        }
        self.entries.lock().unwrap().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expire_at: expire_at - 1,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_returns_unexpired_values() {
        let cache = AnswerCache::new();
        cache.set("k", "answer", now_unix() + 60);
        assert_eq!(cache.get("k").as_deref(), Some("answer"));
    }

    #[test]
    fn expired_entry_is_deleted_on_read() {
        let cache = AnswerCache::new();
        // Stored expiry is expire_at - 1, so "now + 1" is already stale.
        cache.set("k", "answer", now_unix() + 1);
        assert_eq!(cache.get("k"), None);
        assert!(cache.entries.lock().unwrap().is_empty());
    }

    #[test]
    fn write_of_already_expired_challenge_is_dropped() {
        let cache = AnswerCache::new();
        cache.set("k", "answer", now_unix() - 5);
        assert!(cache.entries.lock().unwrap().is_empty());
    }

    #[test]
    fn missing_key_misses() {
        let cache = AnswerCache::new();
        assert_eq!(cache.get("nope"), None);
    }
}
