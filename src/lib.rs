//! A reentrant, exclusive lock over one byte (or the whole) of an open file.
//!
//! A [`RangedLock`] layers a thread-level reentrant mutex outside an OS
//! advisory record lock. Threads of one process are serialized by the mutex,
//! processes by the record lock, and the mutex holder may re-enter as often as
//! it likes. The record lock is taken only by the outermost acquisition and
//! dropped only by the matching outermost release.
//!
//! # Examples
//!
//! ```
//! use ranged_lock::RangedLock;
//!
//! # fn main() -> std::io::Result<()> {
//! let file = tempfile::tempfile()?;
//! let lock = RangedLock::at(&file, 5)?;
//!
//! {
//!     let _outer = lock.lock()?;
//!     let _inner = lock.lock()?; // same thread, no second OS call
//!     assert_eq!(lock.depth(), 2);
//! }
//! // both levels were released when the guards went out of scope
//! assert!(!lock.is_locked());
//! # Ok(())
//! # }
//! ```
//!
//! One instance is meant to be shared by every thread that guards the region,
//! for example behind an `Arc`:
//!
//! ```
//! use ranged_lock::RangedLock;
//! use std::sync::Arc;
//! use std::thread;
//!
//! # fn main() -> std::io::Result<()> {
//! let file = Arc::new(tempfile::tempfile()?);
//! let lock = Arc::new(RangedLock::whole(file));
//!
//! let guard = lock.lock()?;
//! let other = Arc::clone(&lock);
//! let busy = thread::spawn(move || other.try_lock().map(|g| g.is_none()))
//!     .join()
//!     .unwrap()?;
//! assert!(busy);
//! drop(guard);
//! # Ok(())
//! # }
//! ```
//!
//! The manual protocol mirrors the guard: every successful [`acquire`] must be
//! paired with one [`release`] on the same thread.
//!
//! ```
//! use ranged_lock::RangedLock;
//!
//! # fn main() -> std::io::Result<()> {
//! let file = tempfile::tempfile()?;
//! let lock = RangedLock::new(&file, None)?;
//!
//! if lock.acquire(false)? {
//!     // ... touch the file ...
//!     lock.release()?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! [`acquire`]: RangedLock::acquire
//! [`release`]: RangedLock::release

use std::fs::File;
use std::io::{self, ErrorKind};
use std::marker::PhantomData;
use std::mem;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::fmt;

use lock_api::RawReentrantMutex;
use log::{debug, trace, warn};
use parking_lot::{RawMutex, RawThreadId};

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        mod windows;
        pub use self::windows::{raw_file_lock, raw_file_unlock};
    } else if #[cfg(unix)] {
        mod unix;
        pub use self::unix::{raw_file_lock, raw_file_unlock};
    } else {
        // Unknown target_family
    }
}

/// The part of a file covered by a lock.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Span {
    /// The entire file, including bytes appended after locking.
    Whole,
    /// The single byte at the given offset.
    Byte(u64),
}

impl Span {
    /// Builds a span from an optional offset, `None` meaning the whole file.
    ///
    /// Offsets that do not fit a signed 64-bit file offset are rejected with
    /// [`ErrorKind::InvalidInput`].
    pub fn new(offset: Option<u64>) -> io::Result<Span> {
        match offset {
            None => Ok(Span::Whole),
            Some(off) if off > i64::MAX as u64 => Err(ErrorKind::InvalidInput.into()),
            Some(off) => Ok(Span::Byte(off)),
        }
    }

    #[inline]
    pub fn offset(&self) -> Option<u64> {
        match *self {
            Span::Whole => None,
            Span::Byte(off) => Some(off),
        }
    }

    #[inline]
    pub fn is_whole(&self) -> bool {
        *self == Span::Whole
    }
}

/// A handle that can take and drop an exclusive advisory lock over a [`Span`].
///
/// Implementations must report contention in non-waiting mode as
/// [`ErrorKind::WouldBlock`]; any other error is treated as fatal by
/// [`RangedLock`]. The lock need not be reentrant: [`RangedLock`] calls
/// `lock_range` once per outermost acquisition.
pub trait LockFile {
    fn lock_range(&self, span: Span, wait: bool) -> io::Result<()>;
    fn unlock_range(&self, span: Span) -> io::Result<()>;
}

impl LockFile for File {
    #[inline]
    fn lock_range(&self, span: Span, wait: bool) -> io::Result<()> {
        raw_file_lock(self, span, wait)
    }

    #[inline]
    fn unlock_range(&self, span: Span) -> io::Result<()> {
        raw_file_unlock(self, span)
    }
}

/// A reentrant exclusive lock over a [`Span`] of a file.
///
/// The file is borrowed through `T` (`&File`, `Arc<File>`, ...) and is never
/// closed by the lock. Exactly one `RangedLock` should exist per protected
/// span within a process: two instances over the same span keep separate
/// reentrancy counts, and since record locks are owned by the process, the
/// second would neither see nor be blocked by the first.
pub struct RangedLock<T>
where
    T: Deref,
    T::Target: LockFile,
{
    file: T,
    span: Span,
    // Written only by the thread owning `mutex`.
    depth: AtomicUsize,
    mutex: RawReentrantMutex<RawMutex, RawThreadId>,
}

impl<T> fmt::Debug for RangedLock<T>
where
    T: Deref,
    T::Target: LockFile,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RangedLock::{:?}(depth {})", self.span, self.depth())
    }
}

impl<T> RangedLock<T>
where
    T: Deref,
    T::Target: LockFile,
{
    /// Creates a lock over the byte at `offset`, or over the whole file when
    /// `offset` is `None`.
    pub fn new(file: T, offset: Option<u64>) -> io::Result<Self> {
        Ok(Self::with_span(file, Span::new(offset)?))
    }

    /// Creates a lock over the byte at `offset`.
    pub fn at(file: T, offset: u64) -> io::Result<Self> {
        Self::new(file, Some(offset))
    }

    /// Creates a lock over the whole file.
    pub fn whole(file: T) -> Self {
        Self::with_span(file, Span::Whole)
    }

    fn with_span(file: T, span: Span) -> Self {
        RangedLock {
            file,
            span,
            depth: AtomicUsize::new(0),
            mutex: RawReentrantMutex::INIT,
        }
    }

    #[inline]
    pub fn span(&self) -> Span {
        self.span
    }

    #[inline]
    pub fn offset(&self) -> Option<u64> {
        self.span.offset()
    }

    #[inline]
    pub fn file(&self) -> &T::Target {
        &self.file
    }

    /// Current nesting depth of the holding thread, zero when unheld.
    #[inline]
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Returns true while any thread holds the lock.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.depth() > 0
    }

    #[inline]
    pub fn is_owned_by_current_thread(&self) -> bool {
        self.mutex.is_owned_by_current_thread()
    }

    /// Acquires one level of the lock.
    ///
    /// With `blocking` set, waits for other threads and then, on the outermost
    /// level only, for other processes, and always returns `Ok(true)` unless
    /// the OS call fails. Without it, returns `Ok(false)` at once if another
    /// thread or process holds the span; nothing is held in that case.
    ///
    /// On an OS error the thread mutex is released before the error is
    /// returned.
    pub fn acquire(&self, blocking: bool) -> io::Result<bool> {
        if blocking {
            self.mutex.lock();
        } else if !self.mutex.try_lock() {
            trace!("{:?} held by another thread", self.span);
            return Ok(false);
        }

        if self.depth.load(Ordering::Acquire) == 0 {
            debug!("lock {:?} (blocking={})", self.span, blocking);
            if let Err(e) = self.file.lock_range(self.span, blocking) {
                // SAFETY: the mutex was locked by this thread just above.
                unsafe { self.mutex.unlock() };
                return match e.kind() {
                    ErrorKind::WouldBlock if !blocking => {
                        debug!("{:?} held by another process", self.span);
                        Ok(false)
                    }
                    _ => Err(e),
                };
            }
            debug!("locked {:?}", self.span);
        } else {
            trace!("re-enter {:?} at depth {}", self.span, self.depth());
        }

        self.depth.fetch_add(1, Ordering::AcqRel);
        Ok(true)
    }

    /// Releases one level of the lock.
    ///
    /// The outermost release drops the OS lock and then the thread mutex. The
    /// mutex is released even when the OS unlock fails, in which case that
    /// error is returned.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread does not hold the lock, which includes
    /// releasing more times than acquiring.
    pub fn release(&self) -> io::Result<()> {
        assert!(
            self.mutex.is_owned_by_current_thread(),
            "release of {:?} by a thread that does not hold it",
            self.span
        );
        let prev = self.depth.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "release of {:?} below depth zero", self.span);

        let result = if prev > 1 {
            trace!("leave {:?} at depth {}", self.span, prev - 1);
            Ok(())
        } else {
            debug!("unlock {:?}", self.span);
            self.file.unlock_range(self.span)
        };

        // SAFETY: ownership by this thread was checked above.
        unsafe { self.mutex.unlock() };
        result
    }

    /// Acquires the lock, waiting as long as needed, and returns a guard that
    /// releases it when dropped.
    pub fn lock(&self) -> io::Result<RangedLockGuard<'_, T>> {
        self.acquire(true)?;
        Ok(RangedLockGuard::new(self))
    }

    /// Acquires the lock only if no other thread or process holds it.
    pub fn try_lock(&self) -> io::Result<Option<RangedLockGuard<'_, T>>> {
        if self.acquire(false)? {
            Ok(Some(RangedLockGuard::new(self)))
        } else {
            Ok(None)
        }
    }
}

impl<T> Drop for RangedLock<T>
where
    T: Deref,
    T::Target: LockFile,
{
    fn drop(&mut self) {
        // Only reachable when acquire calls were left unbalanced.
        if *self.depth.get_mut() > 0 {
            warn!("{:?} dropped while held, unlocking", self.span);
            let _ = self.file.unlock_range(self.span);
        }
    }
}

/// One level of a held [`RangedLock`], released on drop.
///
/// The guard must stay on the thread that acquired it.
#[must_use = "if unused the lock will immediately release"]
pub struct RangedLockGuard<'a, T>
where
    T: Deref,
    T::Target: LockFile,
{
    lock: &'a RangedLock<T>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T> RangedLockGuard<'a, T>
where
    T: Deref,
    T::Target: LockFile,
{
    fn new(lock: &'a RangedLock<T>) -> Self {
        RangedLockGuard {
            lock,
            _not_send: PhantomData,
        }
    }

    #[inline]
    pub fn ranged_lock(&self) -> &'a RangedLock<T> {
        self.lock
    }

    /// Releases this level now, reporting a failed OS unlock that dropping
    /// the guard would only log.
    pub fn unlock(self) -> io::Result<()> {
        let lock = self.lock;
        mem::forget(self);
        lock.release()
    }
}

impl<T> fmt::Debug for RangedLockGuard<'_, T>
where
    T: Deref,
    T::Target: LockFile,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RangedLockGuard({:?})", self.lock)
    }
}

impl<T> Deref for RangedLockGuard<'_, T>
where
    T: Deref,
    T::Target: LockFile,
{
    type Target = T::Target;

    fn deref(&self) -> &T::Target {
        self.lock.file()
    }
}

impl<T> Drop for RangedLockGuard<'_, T>
where
    T: Deref,
    T::Target: LockFile,
{
    #[inline]
    fn drop(&mut self) {
        if let Err(e) = self.lock.release() {
            warn!("unlock of {:?} failed: {}", self.lock.span, e);
        }
    }
}
