#![doc(
    html_logo_url = "https://raw.githubusercontent.com/vertexclique/petek/master/art/petek-square.svg"
)]
//! Petek: word-granularity software transactional memory.
//!
//! Petek lets application threads group arbitrary reads and writes of
//! ordinary in-memory words into transactions that execute atomically and
//! in some serializable order. A transaction either commits, making all
//! of its writes visible at a single logical instant, or aborts and is
//! transparently retried.
//!
//! # Architecture
//!
//! The algorithm is SwissTM-style: a fixed table of stripes, each guarded
//! by a version-stamped read lock and an owner-tagged write lock, ordered
//! by a global version clock.
//!
//! - **Reads**: optimistic. A pre/post version check brackets every load;
//!   a reader that falls behind the clock extends its snapshot instead of
//!   restarting.
//! - **Writes**: eager locking, buffered data. A writer owns its stripes
//!   from first write to commit; the new values publish under a fresh
//!   clock value.
//! - **Contention**: timestamp priority with bounded randomized backoff.
//!   Transactions that grow heavy claim a greedy-clock timestamp and win
//!   their stripes; light transactions retry cheaply.
//!
//! DANGER AHEAD: don't run IO bound operations inside an atomic closure.
//! The closure may be retried multiple times, which is not what you want
//! for side effects.
//!
//! # Example
//!
//! ```
//! use petek::{atomic, thread_init, TrVar};
//!
//! thread_init();
//!
//! let accounts = [TrVar::new(100i64), TrVar::new(0i64)];
//!
//! atomic(|| {
//!     let a = accounts[0].get()?;
//!     let b = accounts[1].get()?;
//!     accounts[0].set(a - 50)?;
//!     accounts[1].set(b + 50)
//! })
//! .unwrap();
//! ```

mod access;
mod atomic;
mod clock;
mod engine;
mod error;
mod lock;
mod pool;
mod table;
mod var;

pub use access::{read, write, Scalar};
pub use atomic::{atomic, atomic_read, read_word, write_word};
pub use engine::{CM_MAX_BACKOFF_NS, CM_PRIORITY_THRESHOLD};
pub use error::TransactionError;
pub use pool::SET_CAPACITY;
pub use table::LOCK_TABLE_LEN;
pub use var::TrVar;

/// The unit of transactional access.
pub type Word = u64;

/// The type used to represent version timestamps.
pub type Version = u64;

/// The highest allowed version number; the bits above it are reserved for
/// the read-lock commit flag.
pub const MAX_VERSION: Version = u64::MAX >> 2;

/// The bitmask of bits that must be zero in a word-aligned address.
pub(crate) const WORD_ALIGN_MASK: usize = core::mem::align_of::<Word>() - 1;

/// One-time per-thread initialization.
///
/// Binds a transaction engine to the calling thread (allocating the
/// process-wide stripe table on the very first call anywhere) and must
/// run before any other transactional operation on the thread. Calling it
/// again is harmless.
pub fn thread_init() {
    engine::thread_init();
}
