//! The per-thread transaction engine.
//!
//! One engine exists per OS thread. It owns the transaction's private
//! bookkeeping (read set, write-lock set, write-data buffer), drives the
//! optimistic read / locked write protocols against the shared stripe
//! table, and validates and publishes at commit. Cross-thread traffic goes
//! exclusively through the stripe locks, the clocks, and the two atomics
//! other engines are allowed to touch: `cm_ts` and `abort_requested`.
//!
//! # Engine lifetime
//!
//! Engines are 64-byte aligned so their address fits in a write-lock word
//! with the low tag bit free. They are allocated on `thread_init`, handed
//! back to a free pool when the thread exits, and never deallocated: a
//! stale owner pointer read out of a write lock therefore always points at
//! live atomics, even if the owning thread is long gone.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crossbeam_utils::Backoff;
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};

use crate::clock;
use crate::error::TransactionError;
use crate::lock::{ReadLock, WriteLock};
use crate::pool::{PoolEntry, PooledList};
use crate::table::{self, LockIndex, LockTable};
use crate::{Version, Word, WORD_ALIGN_MASK};

/// Write-set size at which a transaction claims a greedy-clock timestamp
/// and with it priority over lighter transactions.
pub const CM_PRIORITY_THRESHOLD: usize = 10;

/// Saturation bound for the exponential backoff budget, in nanoseconds.
pub const CM_MAX_BACKOFF_NS: u64 = 1 << 16;

const CM_BACKOFF_JITTER_MASK: u64 = 0xF;

#[derive(Clone, Copy, Default)]
struct ReadSetEntry {
    index: LockIndex,
    version: Version,
}

impl PoolEntry for ReadSetEntry {
    type Key = LockIndex;

    fn key(&self) -> LockIndex {
        self.index
    }

    fn rekey(&mut self, key: LockIndex) {
        self.index = key;
    }
}

#[derive(Clone, Copy, Default)]
struct WriteSetEntry {
    index: LockIndex,
}

impl PoolEntry for WriteSetEntry {
    type Key = LockIndex;

    fn key(&self) -> LockIndex {
        self.index
    }

    fn rekey(&mut self, key: LockIndex) {
        self.index = key;
    }
}

#[derive(Clone, Copy, Default)]
struct WriteData {
    address: usize,
    data: Word,
    mask: Word,
}

impl WriteData {
    fn set(&mut self, data: Word, mask: Word) {
        self.data = data;
        self.mask = mask;
    }

    /// Merges a later write into the buffer: new bits override old bits
    /// within the overlap, masks union.
    fn extend(&mut self, data: Word, mask: Word) {
        self.data = (self.data & !mask) | (data & mask);
        self.mask |= mask;
    }
}

impl PoolEntry for WriteData {
    type Key = usize;

    fn key(&self) -> usize {
        self.address
    }

    fn rekey(&mut self, key: usize) {
        self.address = key;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum State {
    Uninitialized,
    Initialized,
    ReadWriteRunning,
    ReadOnlyRunning,
}

impl State {
    #[inline]
    fn is_running(self) -> bool {
        matches!(self, State::ReadWriteRunning | State::ReadOnlyRunning)
    }
}

/// Whether a nested atomic block can join the currently running
/// transaction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Promotion {
    NoRunning,
    Compatible,
    Incompatible,
}

/// Reads the guarded word through an atomic view.
///
/// Rust has no blessed racy plain load; the `AtomicU64` view makes the
/// access defined, and Acquire pairs with the committing store so a read
/// that observes new data also observes the commit flag that preceded it.
///
/// # Safety
///
/// `address` must be word-aligned and point to memory valid for the
/// duration of the enclosing transaction.
#[inline]
unsafe fn load_word(address: usize) -> Word {
    debug_assert_eq!(address & WORD_ALIGN_MASK, 0);
    (*(address as *const AtomicU64)).load(Ordering::Acquire)
}

/// Publishes a word through the same atomic view as [`load_word`].
///
/// # Safety
///
/// As for [`load_word`], and the stripe's write lock must be held.
#[inline]
unsafe fn store_word(address: usize, value: Word) {
    debug_assert_eq!(address & WORD_ALIGN_MASK, 0);
    (*(address as *const AtomicU64)).store(value, Ordering::Release);
}

/// The transaction state machine for one thread.
#[repr(align(64))]
pub(crate) struct TransactionEngine {
    lock_table: &'static LockTable,
    state: State,
    /// Global-clock value at the latest `begin` or successful extension;
    /// upper bound for safely readable versions.
    snapshot: Version,

    /// Contention-manager timestamp; `MAX` until the transaction grows
    /// past [`CM_PRIORITY_THRESHOLD`] stripes. Read by other engines.
    cm_ts: AtomicU64,
    /// Cooperative abort hint, set by higher-priority contenders and
    /// polled at every transactional access.
    abort_requested: AtomicBool,
    cm_backoff: u64,

    read_set: PooledList<ReadSetEntry>,
    write_set: PooledList<WriteSetEntry>,
    write_data: PooledList<WriteData>,

    rng: SmallRng,
}

// The engine address is packed into write-lock words with a one-bit tag.
const _: () = assert!(core::mem::align_of::<TransactionEngine>() == 64);

impl TransactionEngine {
    pub(crate) fn boxed() -> Box<Self> {
        Box::new(Self {
            lock_table: table::lock_table(),
            state: State::Uninitialized,
            snapshot: 0,
            cm_ts: AtomicU64::new(Version::MAX),
            abort_requested: AtomicBool::new(false),
            cm_backoff: 0,
            read_set: PooledList::new(),
            write_set: PooledList::new(),
            write_data: PooledList::new(),
            rng: SmallRng::from_entropy(),
        })
    }

    /// One-time (per acquisition) initialization. Idempotent: calling
    /// `thread_init` twice on a thread is harmless.
    pub(crate) fn init(&mut self) {
        if self.state != State::Uninitialized {
            return;
        }

        self.read_set.clear();
        self.write_set.clear();
        self.write_data.clear();
        self.cm_ts.store(Version::MAX, Ordering::Relaxed);
        self.abort_requested.store(false, Ordering::Relaxed);
        self.cm_backoff = 0;
        self.state = State::Initialized;
    }

    pub(crate) fn read_write_compatibility(&self) -> Promotion {
        match self.state {
            State::ReadWriteRunning => Promotion::Compatible,
            State::ReadOnlyRunning => Promotion::Incompatible,
            _ => Promotion::NoRunning,
        }
    }

    pub(crate) fn read_only_compatibility(&self) -> Promotion {
        match self.state {
            State::ReadWriteRunning | State::ReadOnlyRunning => Promotion::Compatible,
            _ => Promotion::NoRunning,
        }
    }

    /// Starts a read-write transaction, or restarts the one already
    /// running on this engine (applying the backoff policy first).
    pub(crate) fn begin_read_write(&mut self) {
        if self.state == State::ReadWriteRunning {
            self.cm_on_restart();
        } else {
            debug_assert_eq!(self.state, State::Initialized);
            self.cm_on_start();
        }

        self.abort_requested.store(false, Ordering::Relaxed);
        self.snapshot = clock::global_version();
        self.state = State::ReadWriteRunning;
    }

    /// Read-only counterpart of [`begin_read_write`].
    ///
    /// [`begin_read_write`]: Self::begin_read_write
    pub(crate) fn begin_read_only(&mut self) {
        if self.state == State::ReadOnlyRunning {
            self.cm_on_restart();
        } else {
            debug_assert_eq!(self.state, State::Initialized);
            self.cm_on_start();
        }

        self.abort_requested.store(false, Ordering::Relaxed);
        self.snapshot = clock::global_version();
        self.state = State::ReadOnlyRunning;
    }

    /// Transactionally reads the word at `address`.
    ///
    /// # Safety
    ///
    /// `address` must be word-aligned and valid for reads until the
    /// transaction ends.
    pub(crate) unsafe fn read_word(
        &mut self,
        address: *const Word,
    ) -> Result<Word, TransactionError> {
        debug_assert!(self.state.is_running());
        self.check_abort_request()?;

        let address = address as usize;
        let index = table::lock_index(address);
        let me: *const TransactionEngine = self;
        let entry = self.lock_table.entry(index);

        if entry.write.is_locked_by(me) {
            // Read-your-own-writes. A colliding address on a stripe we
            // locked for a different word has no buffered entry; plain
            // memory is current, since nobody else can commit under our
            // write lock.
            if let Some(buffered) = self.write_data.get(address) {
                return Ok(buffered.data);
            }
            return Ok(load_word(address));
        }

        let backoff = Backoff::new();
        let mut v1 = entry.read.get();
        let data = loop {
            if v1 & ReadLock::LOCK_MASK != 0 {
                // A commit to this stripe is in flight.
                backoff.snooze();
                v1 = entry.read.get();
                continue;
            }

            let data = load_word(address);

            let v2 = entry.read.get();
            if v2 == v1 {
                break data;
            }
            v1 = v2;
            backoff.spin();
        };

        // First observation of a stripe wins; re-reads keep the version
        // the validation set was built on.
        match self.read_set.get_or_create(index) {
            Some((read_entry, created)) => {
                if created {
                    read_entry.version = v1;
                }
            }
            None => {
                self.rollback();
                return Err(TransactionError::CapacityExceeded);
            }
        }

        if v1 > self.snapshot && !self.extend() {
            self.rollback();
            return Err(TransactionError::ReadInconsistent);
        }

        Ok(data)
    }

    /// Transactionally writes `data & mask` into the word at `address`.
    ///
    /// # Safety
    ///
    /// `address` must be word-aligned and valid for reads and writes until
    /// the transaction ends.
    pub(crate) unsafe fn write_word(
        &mut self,
        address: *mut Word,
        data: Word,
        mask: Word,
    ) -> Result<(), TransactionError> {
        debug_assert_eq!(self.state, State::ReadWriteRunning);
        self.check_abort_request()?;

        let address = address as usize;
        let index = table::lock_index(address);
        let me: *const TransactionEngine = self;
        let entry = self.lock_table.entry(index);

        if entry.write.is_locked_by(me) {
            match self.write_data.get(address) {
                Some(buffered) => buffered.extend(data, mask),
                None => {
                    let merged = merge_with_memory(address, data, mask);
                    match self.write_data.create(address) {
                        Some(slot) => slot.set(merged, mask),
                        None => {
                            self.rollback();
                            return Err(TransactionError::CapacityExceeded);
                        }
                    }
                }
            }
            return Ok(());
        }

        // Reserve pool space before the CAS: acquiring first and running
        // out of slots afterwards would strand the lock outside the
        // write set, where rollback cannot find it.
        if self.write_set.is_full() || self.write_data.is_full() {
            self.rollback();
            return Err(TransactionError::CapacityExceeded);
        }

        let backoff = Backoff::new();
        loop {
            if entry.write.is_locked() {
                if self.cm_should_abort(&entry.write) {
                    self.rollback();
                    return Err(TransactionError::WriteContention);
                }
                backoff.snooze();
                continue;
            }
            if entry.write.try_lock(me) {
                break;
            }
            backoff.spin();
        }

        self.write_set
            .create(index)
            .expect("write-set capacity reserved before acquire");

        if entry.read.get() > self.snapshot && !self.extend() {
            self.rollback();
            return Err(TransactionError::ReadInconsistent);
        }

        let merged = merge_with_memory(address, data, mask);
        self.write_data
            .create(address)
            .expect("write-data capacity reserved before acquire")
            .set(merged, mask);

        self.cm_on_write();
        Ok(())
    }

    /// Slides the snapshot forward to the current global version without
    /// restarting. Fails if any read has been overwritten in the meantime.
    fn extend(&mut self) -> bool {
        let new_version = clock::global_version();
        if self.validate_read_set() {
            self.snapshot = new_version;
            return true;
        }
        false
    }

    /// Checks that every stripe in the read set still carries the version
    /// it was observed at. A stripe mid-commit by this very transaction
    /// (commit flag up, write lock ours) does not invalidate.
    fn validate_read_set(&self) -> bool {
        let me: *const TransactionEngine = self;
        for entry in self.read_set.iter() {
            let lock = self.lock_table.entry(entry.index);
            let current = lock.read.get();
            if current != entry.version
                && !(current & ReadLock::LOCK_MASK != 0 && lock.write.is_locked_by(me))
            {
                return false;
            }
        }
        true
    }

    /// Attempts to commit the running transaction.
    ///
    /// On success the engine returns to `Initialized`. On validation
    /// failure all locks are released and the recoverable error asks the
    /// retry loop to run the transaction again.
    pub(crate) fn commit(&mut self) -> Result<(), TransactionError> {
        debug_assert!(self.state.is_running());

        if self.state == State::ReadOnlyRunning {
            // Reads extended as they went; nothing to validate or publish.
            self.state = State::Initialized;
            return Ok(());
        }

        if !self.write_set.is_empty() {
            for entry in self.write_set.iter() {
                self.lock_table.entry(entry.index).read.lock();
            }

            let new_version = clock::next_global_version();

            if new_version > self.snapshot + 1 {
                // At least one other transaction committed while this one
                // ran; the read set may be stale.
                if !self.validate_read_set() {
                    for entry in self.write_set.iter() {
                        self.lock_table.entry(entry.index).read.unlock();
                    }
                    self.rollback();
                    return Err(TransactionError::CommitValidation);
                }
            }

            for data in self.write_data.iter() {
                // SAFETY: write_word's caller guaranteed the address for
                // the life of the transaction, and the stripe's write lock
                // is still held.
                unsafe { commit_data(data) };
            }

            for entry in self.write_set.iter() {
                let lock = self.lock_table.entry(entry.index);
                // Install the new version before releasing the write lock:
                // a reader that observes the stripe unlocked must also
                // observe the committed version.
                lock.read.unlock_with(new_version);
                lock.write.unlock();
            }
        }

        self.read_set.clear();
        self.write_set.clear();
        self.write_data.clear();
        self.state = State::Initialized;
        Ok(())
    }

    /// Releases every held write lock and clears the sets. The engine
    /// state is untouched; the retry loop decides between restart and
    /// [`end`](Self::end).
    pub(crate) fn rollback(&mut self) {
        for entry in self.write_set.iter() {
            self.lock_table.entry(entry.index).write.unlock();
        }

        self.read_set.clear();
        self.write_set.clear();
        self.write_data.clear();
    }

    /// Terminates the running transaction without committing.
    pub(crate) fn end(&mut self) {
        debug_assert!(self.state.is_running());
        self.rollback();
        self.state = State::Initialized;
    }

    pub(crate) fn end_if_running(&mut self) {
        if self.state.is_running() {
            self.end();
        }
    }

    fn cm_on_start(&mut self) {
        self.cm_ts.store(Version::MAX, Ordering::Relaxed);
        self.cm_backoff = 0;
    }

    /// Bounded exponential backoff with jitter, applied before re-running
    /// an aborted transaction. The claimed priority timestamp survives the
    /// restart so heavy transactions eventually win their stripes.
    fn cm_on_restart(&mut self) {
        self.cm_backoff += self.rng.next_u64() & CM_BACKOFF_JITTER_MASK;
        std::thread::sleep(Duration::from_nanos(self.cm_backoff));
        self.cm_backoff = (self.cm_backoff << 1).min(CM_MAX_BACKOFF_NS);
    }

    /// Claims a priority timestamp once the write set crosses the
    /// threshold. Lower timestamp wins conflicts from then on.
    fn cm_on_write(&mut self) {
        if self.cm_ts.load(Ordering::Relaxed) == Version::MAX
            && self.write_set.len() >= CM_PRIORITY_THRESHOLD
        {
            self.cm_ts.store(clock::next_greedy_version(), Ordering::Release);
        }
    }

    /// Conflict policy for a write attempt on a stripe someone else holds.
    ///
    /// A transaction without priority always yields. One with priority
    /// yields only to a higher-priority holder; otherwise it marks the
    /// holder for cooperative abort and keeps spinning.
    fn cm_should_abort(&self, lock: &WriteLock) -> bool {
        let ts = self.cm_ts.load(Ordering::Relaxed);
        if ts == Version::MAX {
            return true;
        }

        let owner = lock.owner();
        if !owner.is_null() {
            // SAFETY: engines are recycled, never deallocated, so even a
            // stale owner pointer refers to live atomics. The loaded
            // values are treated as hints only.
            let owner = unsafe { &*owner };
            if owner.cm_ts.load(Ordering::Acquire) < ts {
                return true;
            }

            owner.abort_requested.store(true, Ordering::Release);
        }

        false
    }

    /// Honors a cooperative abort request from a higher-priority
    /// contender blocked on one of our stripes.
    fn check_abort_request(&mut self) -> Result<(), TransactionError> {
        if self.state == State::ReadWriteRunning
            && self.abort_requested.swap(false, Ordering::Relaxed)
        {
            self.rollback();
            return Err(TransactionError::WriteContention);
        }
        Ok(())
    }
}

/// Publishes one buffered write, folding unmasked bits of the current
/// memory word back in.
///
/// # Safety
///
/// `data.address` must be valid for reads and writes and its stripe's
/// write lock held.
unsafe fn commit_data(data: &WriteData) {
    let current = load_word(data.address);
    store_word(data.address, (current & !data.mask) | (data.data & data.mask));
}

/// Completes a partially-masked write to a full buffered word so that
/// read-your-own-writes returns it bit-for-bit.
///
/// # Safety
///
/// `address` must be valid for reads; the stripe's write lock must be
/// held by the calling transaction.
unsafe fn merge_with_memory(address: usize, data: Word, mask: Word) -> Word {
    if mask == Word::MAX {
        data
    } else {
        (data & mask) | (load_word(address) & !mask)
    }
}

//
// Thread-local plumbing
//

struct EnginePtr(*mut TransactionEngine);

// Engine pointers move between threads only through the free pool, after
// the previous owner has fully released the engine.
unsafe impl Send for EnginePtr {}

/// Engines released by exited threads, ready for reuse. Entries are never
/// deallocated; see the module docs.
static FREE_ENGINES: Mutex<Vec<EnginePtr>> = Mutex::new(Vec::new());

struct EngineHandle {
    ptr: Cell<*mut TransactionEngine>,
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        let ptr = self.ptr.get();
        if ptr.is_null() {
            return;
        }

        // SAFETY: this thread owned the engine exclusively and is done
        // with it.
        let engine = unsafe { &mut *ptr };
        engine.end_if_running();
        engine.state = State::Uninitialized;

        FREE_ENGINES.lock().unwrap().push(EnginePtr(ptr));
    }
}

thread_local! {
    static ENGINE: EngineHandle = EngineHandle {
        ptr: Cell::new(std::ptr::null_mut()),
    };
}

fn acquire_engine() -> *mut TransactionEngine {
    if let Some(EnginePtr(recycled)) = FREE_ENGINES.lock().unwrap().pop() {
        return recycled;
    }
    Box::into_raw(TransactionEngine::boxed())
}

/// Binds an engine to the current thread, allocating the global lock
/// table on first use anywhere in the process.
pub(crate) fn thread_init() {
    ENGINE.with(|handle| {
        if handle.ptr.get().is_null() {
            handle.ptr.set(acquire_engine());
        }
        // SAFETY: the engine is owned exclusively by this thread.
        unsafe { &mut *handle.ptr.get() }.init();
    });
}

/// Runs `f` against this thread's engine.
///
/// Errors with [`TransactionError::Uninitialized`] when the thread never
/// ran [`thread_init`](crate::thread_init).
pub(crate) fn with<R>(
    f: impl FnOnce(&mut TransactionEngine) -> R,
) -> Result<R, TransactionError> {
    ENGINE.with(|handle| {
        let ptr = handle.ptr.get();
        if ptr.is_null() {
            return Err(TransactionError::Uninitialized);
        }
        // SAFETY: the engine is single-writer (this thread), and `f`
        // never re-enters `with`.
        Ok(f(unsafe { &mut *ptr }))
    })
}
