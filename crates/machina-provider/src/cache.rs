use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use machina_domain::ErrorReason;
use tracing::debug;

use crate::error::ProviderError;

/// A memoized validation outcome. Errors are stored structurally so the
/// terminal-vs-transient classification survives the round trip through the
/// cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    Invalid {
        reason: Option<ErrorReason>,
        message: String,
    },
}

impl Verdict {
    pub fn from_result(result: &Result<(), ProviderError>) -> Self {
        match result {
            Ok(()) => Verdict::Valid,
            Err(e) => Verdict::Invalid {
                reason: e.reason(),
                message: e.to_string(),
            },
        }
    }

    pub fn into_result(self) -> Result<(), ProviderError> {
        match self {
            Verdict::Valid => Ok(()),
            Verdict::Invalid {
                reason: Some(reason),
                message,
            } => Err(ProviderError::Terminal { reason, message }),
            Verdict::Invalid {
                reason: None,
                message,
            } => Err(ProviderError::Upstream(message)),
        }
    }
}

struct Entry {
    verdict: Verdict,
    inserted_at: Instant,
}

/// Fingerprint-keyed memo of validation verdicts, suppressing repeated
/// expensive upstream calls for unchanged specs. Process-local; providers
/// re-check upstream whenever the cache misses, so no cross-process
/// coherency is attempted.
pub struct ValidationCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, Entry>>,
}

impl Default for ValidationCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(5 * 60))
    }
}

impl ValidationCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// The janitor interval callers should sweep at; equal to the TTL.
    pub fn sweep_interval(&self) -> Duration {
        self.ttl
    }

    /// Cached verdict for `fingerprint`, or None on miss/expiry.
    pub fn lookup(&self, fingerprint: &str) -> Option<Verdict> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get(fingerprint)?;
        if entry.inserted_at.elapsed() >= self.ttl {
            return None;
        }
        Some(entry.verdict.clone())
    }

    pub fn insert(&self, fingerprint: impl Into<String>, verdict: Verdict) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            fingerprint.into(),
            Entry {
                verdict,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop expired entries. Lookups already ignore them; the sweep keeps the
    /// map from growing with dead fingerprints.
    pub fn sweep(&self) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, e| e.inserted_at.elapsed() < self.ttl);
        let swept = before - entries.len();
        if swept > 0 {
            debug!(swept, remaining = entries.len(), "validation cache sweep");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use machina_domain::spec_fingerprint;
    use serde_json::json;

    #[test]
    fn miss_then_hit() {
        let cache = ValidationCache::default();
        let fp = spec_fingerprint(&json!({ "flavor": "m1.tiny" }));
        assert!(cache.lookup(&fp).is_none());

        cache.insert(fp.clone(), Verdict::Valid);
        assert_eq!(cache.lookup(&fp), Some(Verdict::Valid));
    }

    #[test]
    fn distinct_fingerprints_do_not_share_entries() {
        let cache = ValidationCache::default();
        let a = spec_fingerprint(&json!({ "flavor": "m1.tiny" }));
        let b = spec_fingerprint(&json!({ "flavor": "m1.small" }));
        cache.insert(a, Verdict::Valid);
        assert!(cache.lookup(&b).is_none());
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = ValidationCache::new(Duration::from_millis(20));
        cache.insert("fp", Verdict::Valid);
        assert!(cache.lookup("fp").is_some());

        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.lookup("fp").is_none());

        cache.sweep();
        assert!(cache.is_empty());
    }

    #[test]
    fn error_verdicts_keep_their_classification() {
        let terminal = Verdict::from_result(&Err(ProviderError::invalid_config("bad flavor")));
        match terminal.clone().into_result() {
            Err(e) => {
                assert!(e.is_terminal());
                assert_eq!(e.reason(), Some(ErrorReason::InvalidConfiguration));
            }
            Ok(()) => panic!("expected error"),
        }

        let transient = Verdict::from_result(&Err(ProviderError::Upstream("timeout".into())));
        match transient.into_result() {
            Err(e) => assert!(!e.is_terminal()),
            Ok(()) => panic!("expected error"),
        }
    }

    #[test]
    fn nil_verdicts_are_cached_too() {
        let cache = ValidationCache::default();
        cache.insert("fp", Verdict::from_result(&Ok(())));
        assert!(cache.lookup("fp").unwrap().into_result().is_ok());
    }
}
