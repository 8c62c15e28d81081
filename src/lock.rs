//! The two per-stripe locks.
//!
//! Each stripe of the lock table pairs a [`ReadLock`] (the committed
//! version of the stripe plus a transient commit flag in the top bit) with
//! a [`WriteLock`] (the owning engine's address plus a lock bit in the low
//! bit). Together they carry every happens-before edge of the protocol:
//! acquire on the write-lock CAS, release on the version-installing store.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::engine::TransactionEngine;
use crate::Version;

/// Version stamp of a stripe with a commit flag in the top bit.
///
/// Readers spin while the flag is set: it marks the window between a
/// committer publishing its write-set stripes and installing the new
/// version. Only the stripe's write-lock owner may set or clear it.
pub(crate) struct ReadLock {
    version: AtomicU64,
}

impl ReadLock {
    /// The bit where the commit flag is stored. (Different from the lock
    /// mask of [`WriteLock`].)
    pub(crate) const LOCK_MASK: Version = 1 << 63;

    pub(crate) const fn new() -> Self {
        Self {
            version: AtomicU64::new(0),
        }
    }

    /// Current version including the commit flag.
    #[inline]
    pub(crate) fn get(&self) -> Version {
        self.version.load(Ordering::Acquire)
    }

    /// Sets the commit flag. No validity tests are performed.
    ///
    /// Relaxed is enough: visibility to readers rides on the release store
    /// of the guarded word that follows it in the commit sequence.
    #[inline]
    pub(crate) fn lock(&self) {
        self.version.fetch_or(Self::LOCK_MASK, Ordering::Relaxed);
    }

    /// Clears the commit flag, keeping the version. No validity tests are
    /// performed.
    #[inline]
    pub(crate) fn unlock(&self) {
        self.version.fetch_and(!Self::LOCK_MASK, Ordering::Release);
    }

    /// Clears the commit flag and installs `new_version`.
    ///
    /// `new_version` must stay below [`MAX_VERSION`](crate::MAX_VERSION) so
    /// the flag bit is never clobbered.
    #[inline]
    pub(crate) fn unlock_with(&self, new_version: Version) {
        debug_assert_eq!(new_version & Self::LOCK_MASK, 0);
        self.version.store(new_version, Ordering::Release);
    }
}

/// Owner-plus-bit word guarding a stripe for writing.
///
/// Value `0` means unlocked; any other value is the owning engine's
/// address with the low bit set. Engine allocations are 64-byte aligned so
/// the low bit is always free for the tag.
pub(crate) struct WriteLock {
    value: AtomicUsize,
}

impl WriteLock {
    /// The bit where the lock is stored. (Different from the lock mask of
    /// [`ReadLock`].)
    pub(crate) const LOCK_MASK: usize = 0b1;

    pub(crate) const fn new() -> Self {
        Self {
            value: AtomicUsize::new(0),
        }
    }

    /// Attempts to acquire the stripe for `owner`. Returns false if any
    /// transaction (including `owner`) already holds it.
    #[inline]
    pub(crate) fn try_lock(&self, owner: *const TransactionEngine) -> bool {
        self.value
            .compare_exchange(
                0,
                owner as usize | Self::LOCK_MASK,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Releases the stripe. No validity tests are performed.
    #[inline]
    pub(crate) fn unlock(&self) {
        self.value.store(0, Ordering::Release);
    }

    /// Returns true if any transaction holds the stripe.
    #[inline]
    pub(crate) fn is_locked(&self) -> bool {
        self.value.load(Ordering::Acquire) & Self::LOCK_MASK != 0
    }

    /// Returns true if `owner` holds the stripe.
    #[inline]
    pub(crate) fn is_locked_by(&self, owner: *const TransactionEngine) -> bool {
        self.value.load(Ordering::Acquire) == owner as usize | Self::LOCK_MASK
    }

    /// Current owner of the stripe, null if unlocked.
    ///
    /// The returned pointer is a hint: the owner may release the lock (or
    /// the engine may be recycled to another thread) at any moment after
    /// the load. Engines are never deallocated, so the pointed-to atomics
    /// stay readable; callers must not infer liveness from a non-null
    /// result.
    #[inline]
    pub(crate) fn owner(&self) -> *const TransactionEngine {
        (self.value.load(Ordering::Acquire) & !Self::LOCK_MASK) as *const TransactionEngine
    }
}

/// One stripe of the lock table.
pub(crate) struct LockEntry {
    pub(crate) read: ReadLock,
    pub(crate) write: WriteLock,
}

impl LockEntry {
    pub(crate) const fn new() -> Self {
        Self {
            read: ReadLock::new(),
            write: WriteLock::new(),
        }
    }
}

// Indexing the table with a bitmask expects a power-of-two entry size;
// the protocol expects 16 bytes on 64-bit targets.
const _: () = assert!(core::mem::size_of::<LockEntry>() == 16);
const _: () = assert!(core::mem::size_of::<LockEntry>().is_power_of_two());
