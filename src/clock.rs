//! The two process-wide version counters.
//!
//! `global_version` orders committed transactions: every successful
//! non-empty commit installs a fresh value into the stripes it wrote.
//! `greedy_version` hands out strictly-ordered priority timestamps to the
//! contention manager; it never appears in a stripe.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::{Version, MAX_VERSION};

static GLOBAL_VERSION: AtomicU64 = AtomicU64::new(0);
static GREEDY_VERSION: AtomicU64 = AtomicU64::new(0);

/// Current value of the global version clock.
#[inline]
pub(crate) fn global_version() -> Version {
    GLOBAL_VERSION.load(Ordering::Acquire)
}

/// Increments the global version clock and returns its new value.
///
/// The version space is bounded by [`MAX_VERSION`]; the two top bits are
/// reserved for the read-lock commit flag. Exhaustion is not handled, only
/// detected in debug builds (u64 versions make it unreachable in practice).
#[inline]
pub(crate) fn next_global_version() -> Version {
    let new_version = GLOBAL_VERSION.fetch_add(1, Ordering::AcqRel) + 1;
    debug_assert!(new_version < MAX_VERSION);
    new_version
}

/// Increments the greedy clock and returns its pre-increment value.
///
/// Pre-increment keeps the timestamps strictly ordered starting at 0;
/// lower timestamp means higher contention-manager priority.
#[inline]
pub(crate) fn next_greedy_version() -> Version {
    GREEDY_VERSION.fetch_add(1, Ordering::AcqRel)
}
