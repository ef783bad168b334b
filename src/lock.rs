//! Scoped, bounds-checked access to the bytes behind a handle.
//!
//! [`with_lock`] pins a block through the native `lock` primitive, hands the
//! callback a [`LockedView`] whose lifetime ends with the callback, and
//! always issues the matching `unlock`, including when the callback panics.
//!
//! ```text
//! with_lock(api, handle, len, f)
//!   ├── handle.raw_value()         disposed/null → InvalidHandle
//!   ├── api.lock(raw)              failure → LockFailed, no unlock
//!   ├── api.size(raw) / bounds     failure → unlock, error
//!   ├── f(&mut view)               panic → unlock during unwind
//!   └── api.unlock(raw)
//! ```
//!
//! The view copies bytes in and out instead of lending slices, so nested
//! locks of the same block on one thread never alias a live `&mut [u8]`.

use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::error::{HandleError, HandleResult};
use crate::handle::{HandleValue, NativeHandle};
use crate::native::NativeApi;

/// Bounds-checked window over a locked native block.
pub struct LockedView<'a> {
    base: NonNull<u8>,
    len: usize,
    handle: HandleValue,
    _scope: PhantomData<&'a mut [u8]>,
}

impl LockedView<'_> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The handle this view was locked through.
    pub fn handle(&self) -> HandleValue {
        self.handle
    }

    fn check(&self, offset: usize, count: usize) -> HandleResult<()> {
        match offset.checked_add(count) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(HandleError::BoundsExceeded {
                requested: offset.saturating_add(count),
                available: self.len,
            }),
        }
    }

    /// Copy `out.len()` bytes starting at `offset` into `out`.
    pub fn read_at(&self, offset: usize, out: &mut [u8]) -> HandleResult<()> {
        self.check(offset, out.len())?;
        // SAFETY: range checked against the locked length; `out` is caller
        // memory and cannot overlap the native block.
        unsafe {
            out.as_mut_ptr()
                .copy_from_nonoverlapping(self.base.as_ptr().add(offset), out.len());
        }
        Ok(())
    }

    /// Copy `bytes` into the block starting at `offset`.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> HandleResult<()> {
        self.check(offset, bytes.len())?;
        // SAFETY: as in `read_at`.
        unsafe {
            self.base
                .as_ptr()
                .add(offset)
                .copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
        }
        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<u8> {
        let mut byte = [0u8; 1];
        self.read_at(index, &mut byte).ok().map(|_| byte[0])
    }

    pub fn set(&mut self, index: usize, value: u8) -> HandleResult<()> {
        self.write_at(index, &[value])
    }

    pub fn fill(&mut self, value: u8) {
        // SAFETY: exactly `len` bytes are valid while locked.
        unsafe { self.base.as_ptr().write_bytes(value, self.len) }
    }

    /// Copy the whole view out.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len];
        // SAFETY: `out` has exactly `len` bytes.
        unsafe {
            out.as_mut_ptr()
                .copy_from_nonoverlapping(self.base.as_ptr(), self.len);
        }
        out
    }
}

impl std::fmt::Debug for LockedView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedView")
            .field("handle", &format_args!("{}", self.handle))
            .field("len", &self.len)
            .finish()
    }
}

/// Guard pairing one native `lock` with exactly one `unlock`.
pub(crate) struct ScopedLock<'a, A: NativeApi + ?Sized> {
    api: &'a A,
    view: LockedView<'a>,
    armed: bool,
}

impl<'a, A: NativeApi + ?Sized> ScopedLock<'a, A> {
    pub(crate) fn acquire(
        api: &'a A,
        handle: &'a NativeHandle,
        length: Option<usize>,
    ) -> HandleResult<Self> {
        let raw = handle.raw_value()?;
        let base = api.lock(raw).map_err(|err| match err {
            HandleError::LockFailed { .. } => err,
            other => HandleError::LockFailed {
                raw: raw.as_u64(),
                reason: other.to_string(),
            },
        })?;
        tracing::trace!(handle = %raw, "locked native block");

        let mut guard = Self {
            api,
            view: LockedView {
                base,
                len: 0,
                handle: raw,
                _scope: PhantomData,
            },
            armed: true,
        };

        let available = api.size(raw)?;
        let len = match length {
            Some(requested) if requested > available => {
                return Err(HandleError::BoundsExceeded {
                    requested,
                    available,
                });
            }
            Some(requested) => requested,
            None => available,
        };
        guard.view.len = len;
        Ok(guard)
    }

    pub(crate) fn view(&mut self) -> &mut LockedView<'a> {
        &mut self.view
    }

    /// Unlock on the success path, surfacing a failing unlock.
    pub(crate) fn release(mut self) -> HandleResult<()> {
        self.armed = false;
        let raw = self.view.handle;
        tracing::trace!(handle = %raw, "unlocking native block");
        self.api.unlock(raw).map_err(|err| match err {
            HandleError::LockFailed { .. } => err,
            other => HandleError::LockFailed {
                raw: raw.as_u64(),
                reason: other.to_string(),
            },
        })
    }
}

impl<A: NativeApi + ?Sized> Drop for ScopedLock<'_, A> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let raw = self.view.handle;
        if let Err(err) = self.api.unlock(raw) {
            tracing::warn!(handle = %raw, error = %err, "unlock failed while unwinding scoped lock");
        }
    }
}

/// Run `f` with the bytes behind `handle` locked.
///
/// `length` limits the view to a prefix of the block; `None` exposes the
/// whole block. Nested calls on the same handle rely on the native lock
/// count; each lock is paired with one unlock.
///
/// # Examples
///
/// ```
/// use handlegrip::lock::with_lock;
/// use handlegrip::native::{HeapNativeApi, NativeApi};
///
/// let api = HeapNativeApi::default();
/// let handle = api.allocate(4).unwrap();
///
/// with_lock(&api, &handle, None, |view| view.write_at(0, b"abcd")).unwrap().unwrap();
/// let bytes = with_lock(&api, &handle, Some(2), |view| view.to_vec()).unwrap();
/// assert_eq!(bytes, b"ab");
/// ```
pub fn with_lock<A, R>(
    api: &A,
    handle: &NativeHandle,
    length: Option<usize>,
    f: impl FnOnce(&mut LockedView<'_>) -> R,
) -> HandleResult<R>
where
    A: NativeApi + ?Sized,
{
    let mut guard = ScopedLock::acquire(api, handle, length)?;
    let out = f(guard.view());
    guard.release()?;
    Ok(out)
}

/// Run `f` with two handles locked.
///
/// Locking follows the pair sorted by raw value, not the argument order:
/// with `A` the lower and `B` the higher raw value, the native calls are
/// always `lock(A)`, `lock(B)`, `unlock(B)`, `unlock(A)`. So
/// `with_locks(api, &h9, &h3, ..)` locks `h3` first. Two call sites locking
/// the same pair can therefore never deadlock against each other. The
/// callback still receives the views in argument order. Passing the same
/// handle twice takes two nested locks on it.
pub fn with_locks<A, R>(
    api: &A,
    first: &NativeHandle,
    second: &NativeHandle,
    f: impl FnOnce(&mut LockedView<'_>, &mut LockedView<'_>) -> R,
) -> HandleResult<R>
where
    A: NativeApi + ?Sized,
{
    let in_order = first.raw_value()? <= second.raw_value()?;
    let (low, high) = if in_order {
        (first, second)
    } else {
        (second, first)
    };

    let mut outer = ScopedLock::acquire(api, low, None)?;
    let mut inner = ScopedLock::acquire(api, high, None)?;

    let out = if in_order {
        f(outer.view(), inner.view())
    } else {
        f(inner.view(), outer.view())
    };

    let inner_result = inner.release();
    let outer_result = outer.release();
    inner_result.and(outer_result)?;
    Ok(out)
}
