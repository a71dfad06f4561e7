//! Per-layer path-set cache.
//!
//! Keyed by the layer's content hash, the cache memoizes the set of file
//! paths claimed by any rpm package in that layer. Entries are held by
//! weak reference: as long as any caller keeps its [`PathSet`] alive,
//! lookups reuse it; when the last strong reference drops, the set's own
//! `Drop` takes the cache lock and clears the dead entry, so a later
//! request recomputes. Concurrent first requests for one key share a
//! single computation through an in-flight latch.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::fs::LayerFs;
use crate::scanner::{self, ScanConfig};

// ── PathSet ────────────────────────────────────────────────────────

/// The set of file paths declared by any rpm package in one layer.
///
/// Paths are stored `/`-separated without the leading `/`. The type is
/// deliberately neither `Clone` nor `Copy`: a `PathSet` is shared through
/// its `Arc`, and its drop is the cache's eviction hook.
#[derive(Debug)]
pub struct PathSet {
    paths: HashSet<String>,
    key: String,
    owner: Weak<CacheInner>,
}

impl PathSet {
    /// Membership check; a leading `/` on the query is ignored.
    pub fn contains(&self, path: &str) -> bool {
        self.paths.contains(path.trim_start_matches('/'))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// The layer key this set was computed for.
    pub fn layer(&self) -> &str {
        &self.key
    }
}

impl Drop for PathSet {
    fn drop(&mut self) {
        let Some(inner) = self.owner.upgrade() else {
            return;
        };
        let mut entries = inner.entries.lock().unwrap();
        // Only clear the entry if it is ours (dead); a recomputation may
        // already have replaced it.
        if let Some(Entry::Ready(weak)) = entries.get(&self.key) {
            if weak.upgrade().is_none() {
                entries.remove(&self.key);
            }
        }
    }
}

// ── Cache ──────────────────────────────────────────────────────────

enum Entry {
    /// A computation is running; waiters share its latch.
    InFlight(Arc<Latch>),
    /// A published result, held weakly.
    Ready(Weak<PathSet>),
}

type SharedResult = std::result::Result<Arc<PathSet>, Arc<Error>>;

struct Latch {
    state: Mutex<Option<SharedResult>>,
    cv: Condvar,
}

impl Latch {
    fn new() -> Self {
        Self { state: Mutex::new(None), cv: Condvar::new() }
    }
}

struct CacheInner {
    entries: Mutex<HashMap<String, Entry>>,
}

/// Process-wide memoization of per-layer path sets.
pub struct PathSetCache {
    inner: Arc<CacheInner>,
}

enum Role {
    Hit(Arc<PathSet>),
    Win(Arc<Latch>),
    Wait(Arc<Latch>),
}

impl PathSetCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CacheInner { entries: Mutex::new(HashMap::new()) }),
        }
    }

    /// The process-wide instance, initialized on first use.
    pub fn global() -> &'static PathSetCache {
        static GLOBAL: OnceLock<PathSetCache> = OnceLock::new();
        GLOBAL.get_or_init(PathSetCache::new)
    }

    /// Live entry count (in-flight and published). Drains to zero once
    /// every caller drops its sets; tests assert on this.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch or compute the path set for `key`.
    ///
    /// Exactly one concurrent caller runs the layer scan; the rest wait on
    /// its latch and share the identical `Arc`. A failure is shared too:
    /// every caller of the failed flight sees [`Error::Shared`] wrapping
    /// the one underlying error. Cancellation preempts only the waiting
    /// caller, never the computation other callers depend on.
    pub fn get(
        &self,
        key: &str,
        fs: &Arc<dyn LayerFs>,
        config: &ScanConfig,
        token: &CancelToken,
    ) -> Result<Arc<PathSet>> {
        let role = {
            let mut entries = self.inner.entries.lock().unwrap();
            // A dead weak under a live entry means the value was reclaimed
            // before its finalizer ran: treat the key as absent.
            let existing = match entries.get(key) {
                Some(Entry::Ready(weak)) => weak.upgrade().map(Role::Hit),
                Some(Entry::InFlight(latch)) => Some(Role::Wait(latch.clone())),
                None => None,
            };
            match existing {
                Some(role) => role,
                None => {
                    let latch = Arc::new(Latch::new());
                    entries.insert(key.to_string(), Entry::InFlight(latch.clone()));
                    Role::Win(latch)
                }
            }
        };

        match role {
            Role::Hit(set) => Ok(set),
            Role::Win(latch) => self.compute_and_publish(key, fs, config, token, latch),
            Role::Wait(latch) => Self::wait(&latch, token),
        }
    }

    fn compute_and_publish(
        &self,
        key: &str,
        fs: &Arc<dyn LayerFs>,
        config: &ScanConfig,
        token: &CancelToken,
        latch: Arc<Latch>,
    ) -> Result<Arc<PathSet>> {
        let result: SharedResult = scanner::file_paths_in_layer(fs, config, token)
            .map(|paths| {
                Arc::new(PathSet {
                    paths,
                    key: key.to_string(),
                    owner: Arc::downgrade(&self.inner),
                })
            })
            .map_err(Arc::new);

        {
            let mut entries = self.inner.entries.lock().unwrap();
            match &result {
                Ok(set) => {
                    entries.insert(key.to_string(), Entry::Ready(Arc::downgrade(set)));
                }
                Err(_) => {
                    entries.remove(key);
                }
            }
        }

        let mut state = latch.state.lock().unwrap();
        *state = Some(result.clone());
        drop(state);
        latch.cv.notify_all();

        result.map_err(Error::Shared)
    }

    fn wait(latch: &Latch, token: &CancelToken) -> Result<Arc<PathSet>> {
        let mut state = latch.state.lock().unwrap();
        loop {
            if let Some(result) = state.as_ref() {
                return result.clone().map_err(Error::Shared);
            }
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let (guard, _) = latch
                .cv
                .wait_timeout(state, Duration::from_millis(10))
                .unwrap();
            state = guard;
        }
    }

    /// Plant a dead entry, modeling a value reclaimed before its
    /// finalizer ran.
    #[cfg(test)]
    fn plant_dead_entry(&self, key: &str) {
        let dead = Weak::new();
        self.inner
            .entries
            .lock()
            .unwrap()
            .insert(key.to_string(), Entry::Ready(dead));
    }
}

impl Default for PathSetCache {
    fn default() -> Self {
        Self::new()
    }
}
