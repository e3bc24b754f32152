/**
 * location.rs
 *
 * Shared location cache. Written by the session task, read by the
 * synchronous query callback; the mutex is held only for the copy.
 */

use std::sync::Mutex;

/// A single location fix as received from the paired client.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LocationFix {
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: f64,
    pub facing: f64,

    /// Sender-side timestamp, milliseconds. Strictly increasing across
    /// accepted fixes.
    pub timestamp_ms: u64,
}

struct CacheInner {
    fix: LocationFix,
    fresh: bool,
}

/// Most recent location fix plus a freshness flag.
///
/// `fresh` distinguishes "never received a fix" from a real reading;
/// it is set on the first accepted write and stays set for the cache
/// lifetime.
pub struct LocationCache {
    inner: Mutex<CacheInner>,
}

impl LocationCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                fix: LocationFix::default(),
                fresh: false,
            }),
        }
    }

    /// Store a fix if it is strictly newer than the cached one.
    ///
    /// Returns whether the fix was applied. Stale and duplicate
    /// timestamps leave the cache untouched, so out-of-order delivery
    /// can never roll the reading backwards.
    pub fn write(&self, fix: LocationFix) -> bool {
        let mut inner = self.inner.lock().unwrap();

        if inner.fresh && fix.timestamp_ms <= inner.fix.timestamp_ms {
            return false;
        }

        inner.fix = fix;
        inner.fresh = true;
        true
    }

    /// Snapshot the cached fix and its freshness flag.
    pub fn read(&self) -> (LocationFix, bool) {
        let inner = self.inner.lock().unwrap();
        (inner.fix, inner.fresh)
    }
}

impl Default for LocationCache {
    fn default() -> Self {
        Self::new()
    }
}
