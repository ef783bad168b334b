//! Instrumented native API for verifying call order and pairing.

use std::collections::HashSet;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::{HeapNativeApi, NativeApi};
use crate::error::{HandleError, HandleResult};
use crate::handle::{HandleValue, HandleWidth, NativeHandle};

/// One primitive invocation, in the order it reached the collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeCall {
    Allocate { size: usize },
    Free(HandleValue),
    Lock(HandleValue),
    Unlock(HandleValue),
    Resize(HandleValue, usize),
    Size(HandleValue),
    Decode { len: usize },
}

/// Wrapper recording every call made to an inner [`NativeApi`].
///
/// Failures can be injected per handle for `free` and `lock`, and globally
/// for `decode_text`; injected failures are still recorded as calls.
///
/// # Examples
///
/// ```
/// use handlegrip::native::{NativeApi, NativeCall, RecordingNativeApi};
///
/// let api = RecordingNativeApi::default();
/// let handle = api.allocate(4).unwrap();
/// let raw = handle.raw_value().unwrap();
/// api.free(raw).unwrap();
///
/// assert_eq!(
///     api.calls(),
///     vec![NativeCall::Allocate { size: 4 }, NativeCall::Free(raw)]
/// );
/// assert_eq!(api.free_count(raw), 1);
/// ```
pub struct RecordingNativeApi<A = HeapNativeApi> {
    inner: A,
    calls: Mutex<Vec<NativeCall>>,
    failing_frees: Mutex<HashSet<u64>>,
    failing_locks: Mutex<HashSet<u64>>,
    failing_decode: AtomicBool,
}

impl<A: NativeApi> RecordingNativeApi<A> {
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
            failing_frees: Mutex::new(HashSet::new()),
            failing_locks: Mutex::new(HashSet::new()),
            failing_decode: AtomicBool::new(false),
        }
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    /// Snapshot of all calls so far.
    pub fn calls(&self) -> Vec<NativeCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn count_calls(&self, predicate: impl Fn(&NativeCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|call| predicate(call)).count()
    }

    /// Number of `free` calls that targeted `handle`.
    pub fn free_count(&self, handle: HandleValue) -> usize {
        self.count_calls(|call| *call == NativeCall::Free(handle))
    }

    pub fn total_frees(&self) -> usize {
        self.count_calls(|call| matches!(call, NativeCall::Free(_)))
    }

    pub fn lock_calls(&self) -> usize {
        self.count_calls(|call| matches!(call, NativeCall::Lock(_)))
    }

    pub fn unlock_calls(&self) -> usize {
        self.count_calls(|call| matches!(call, NativeCall::Unlock(_)))
    }

    pub fn decode_calls(&self) -> usize {
        self.count_calls(|call| matches!(call, NativeCall::Decode { .. }))
    }

    /// Lock and unlock calls only, in order.
    pub fn lock_sequence(&self) -> Vec<NativeCall> {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, NativeCall::Lock(_) | NativeCall::Unlock(_)))
            .cloned()
            .collect()
    }

    /// Make every later `free` of `handle` fail without reaching the inner API.
    pub fn fail_free_for(&self, handle: HandleValue) {
        self.failing_frees.lock().insert(handle.as_u64());
    }

    /// Make every later `lock` of `handle` fail without reaching the inner API.
    pub fn fail_lock_for(&self, handle: HandleValue) {
        self.failing_locks.lock().insert(handle.as_u64());
    }

    pub fn set_decode_failure(&self, fail: bool) {
        self.failing_decode.store(fail, Ordering::Release);
    }

    fn record(&self, call: NativeCall) {
        self.calls.lock().push(call);
    }
}

impl Default for RecordingNativeApi<HeapNativeApi> {
    fn default() -> Self {
        Self::new(HeapNativeApi::default())
    }
}

// SAFETY: every memory-related call is forwarded unchanged to `inner`, which
// upholds the contract; injected failures never hand out an address.
unsafe impl<A: NativeApi> NativeApi for RecordingNativeApi<A> {
    fn handle_width(&self) -> HandleWidth {
        self.inner.handle_width()
    }

    fn allocate(&self, size: usize) -> HandleResult<NativeHandle> {
        self.record(NativeCall::Allocate { size });
        self.inner.allocate(size)
    }

    fn free(&self, handle: HandleValue) -> HandleResult<()> {
        self.record(NativeCall::Free(handle));
        if self.failing_frees.lock().contains(&handle.as_u64()) {
            return Err(HandleError::InvalidHandle {
                raw: handle.as_u64(),
                reason: "injected free failure",
            });
        }
        self.inner.free(handle)
    }

    fn lock(&self, handle: HandleValue) -> HandleResult<NonNull<u8>> {
        self.record(NativeCall::Lock(handle));
        if self.failing_locks.lock().contains(&handle.as_u64()) {
            return Err(HandleError::LockFailed {
                raw: handle.as_u64(),
                reason: "injected lock failure".into(),
            });
        }
        self.inner.lock(handle)
    }

    fn unlock(&self, handle: HandleValue) -> HandleResult<()> {
        self.record(NativeCall::Unlock(handle));
        self.inner.unlock(handle)
    }

    fn resize(&self, handle: HandleValue, new_size: usize) -> HandleResult<()> {
        self.record(NativeCall::Resize(handle, new_size));
        self.inner.resize(handle, new_size)
    }

    fn size(&self, handle: HandleValue) -> HandleResult<usize> {
        self.record(NativeCall::Size(handle));
        self.inner.size(handle)
    }

    fn decode_text(&self, bytes: &[u8]) -> HandleResult<String> {
        self.record(NativeCall::Decode { len: bytes.len() });
        if self.failing_decode.load(Ordering::Acquire) {
            return Err(HandleError::Decode("injected decode failure".into()));
        }
        self.inner.decode_text(bytes)
    }
}
