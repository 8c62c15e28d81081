//! Transaction entry points: retry loop, nesting rules, and the raw word
//! primitives.
//!
//! [`atomic`] and [`atomic_read`] wrap a closure in a transaction and
//! re-run it until it commits. A nested call from inside a compatible
//! running transaction flattens: the closure simply executes as part of
//! the enclosing transaction and only the outermost frame commits.

use crate::engine::{self, Promotion};
use crate::error::TransactionError;
use crate::Word;

/// Ends the thread's transaction when the closure unwinds, so a panic
/// cannot leave stripes locked behind it.
struct EndOnPanic;

impl Drop for EndOnPanic {
    fn drop(&mut self) {
        if std::thread::panicking() {
            let _ = engine::with(|engine| engine.end_if_running());
        }
    }
}

/// Atomically executes `f`. Reads and writes are allowed.
///
/// Starts a read-write transaction, or joins a running read-write
/// transaction; inside a running read-only transaction the call fails
/// with [`TransactionError::IncompatibleNesting`].
///
/// `f` may run multiple times before it commits; be careful about
/// directly mutating captured state. Recoverable transaction errors must
/// be propagated out of `f` (with `?`) for the retry machinery to see
/// them; any other error terminates the transaction and is returned
/// unchanged.
///
/// # Example
///
/// ```
/// use petek::{atomic, thread_init, TrVar};
///
/// thread_init();
/// let var = TrVar::new(10u64);
///
/// atomic(|| {
///     let value = var.get()?;
///     var.set(value + 1)
/// })
/// .unwrap();
/// ```
pub fn atomic<F, R>(mut f: F) -> Result<R, TransactionError>
where
    F: FnMut() -> Result<R, TransactionError>,
{
    match engine::with(|engine| engine.read_write_compatibility())? {
        // Flatten: commit belongs to the outermost frame.
        Promotion::Compatible => return f(),
        Promotion::Incompatible => return Err(TransactionError::IncompatibleNesting),
        Promotion::NoRunning => {}
    }

    loop {
        engine::with(|engine| engine.begin_read_write())?;
        let _guard = EndOnPanic;

        match f() {
            Ok(value) => match engine::with(|engine| engine.commit())? {
                Ok(()) => return Ok(value),
                Err(error) if error.recoverable() => continue,
                Err(error) => {
                    engine::with(|engine| engine.end_if_running())?;
                    return Err(error);
                }
            },
            Err(error) if error.recoverable() => continue,
            Err(error) => {
                engine::with(|engine| engine.end())?;
                return Err(error);
            }
        }
    }
}

/// Atomically executes `f`. Only reads are allowed.
///
/// Starts a read-only transaction, or joins any running transaction.
/// Retry and error semantics match [`atomic`].
pub fn atomic_read<F, R>(mut f: F) -> Result<R, TransactionError>
where
    F: FnMut() -> Result<R, TransactionError>,
{
    match engine::with(|engine| engine.read_only_compatibility())? {
        Promotion::Compatible => return f(),
        Promotion::Incompatible => return Err(TransactionError::IncompatibleNesting),
        Promotion::NoRunning => {}
    }

    loop {
        engine::with(|engine| engine.begin_read_only())?;
        let _guard = EndOnPanic;

        match f() {
            Ok(value) => match engine::with(|engine| engine.commit())? {
                Ok(()) => return Ok(value),
                Err(error) if error.recoverable() => continue,
                Err(error) => {
                    engine::with(|engine| engine.end_if_running())?;
                    return Err(error);
                }
            },
            Err(error) if error.recoverable() => continue,
            Err(error) => {
                engine::with(|engine| engine.end())?;
                return Err(error);
            }
        }
    }
}

/// Atomically reads the word at `address`. Must be called within a
/// transaction.
///
/// # Safety
///
/// `address` must be word-aligned and valid for reads until the enclosing
/// transaction commits or ends.
pub unsafe fn read_word(address: *const Word) -> Result<Word, TransactionError> {
    engine::with(|engine| unsafe { engine.read_word(address) })?
}

/// Atomically writes the bits of `data` selected by `mask` into the word
/// at `address`. Must be called within a read-write transaction.
///
/// # Safety
///
/// `address` must be word-aligned and valid for reads and writes until
/// the enclosing transaction commits or ends.
pub unsafe fn write_word(
    address: *mut Word,
    data: Word,
    mask: Word,
) -> Result<(), TransactionError> {
    engine::with(|engine| unsafe { engine.write_word(address, data, mask) })?
}
