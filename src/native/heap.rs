//! In-process native API backed by boxed byte blocks.

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::ThreadId;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use super::NativeApi;
use crate::error::{HandleError, HandleResult};
use crate::handle::{HandleValue, HandleWidth, NativeHandle};

struct BlockState {
    data: Box<[u8]>,
    owner: Option<ThreadId>,
    lock_count: usize,
    freed: bool,
}

struct Block {
    state: Mutex<BlockState>,
    unlocked: Condvar,
}

/// Block allocator that behaves like a movable-memory native heap.
///
/// Locks are reentrant for the locking thread and exclusive across threads:
/// a second thread locking the same block waits until the first releases
/// every nested lock. Freeing or resizing a locked block fails.
///
/// # Examples
///
/// ```
/// use handlegrip::native::{HeapNativeApi, NativeApi};
/// use handlegrip::handle::HandleWidth;
///
/// let api = HeapNativeApi::new(HandleWidth::Wide);
/// let handle = api.allocate(16).unwrap();
/// let raw = handle.raw_value().unwrap();
/// assert_eq!(api.size(raw).unwrap(), 16);
/// api.free(raw).unwrap();
/// assert!(api.free(raw).is_err());
/// ```
pub struct HeapNativeApi {
    width: HandleWidth,
    next_handle: AtomicU64,
    blocks: DashMap<u64, Arc<Block>>,
    allocated_bytes: AtomicUsize,
    byte_limit: Option<usize>,
}

impl HeapNativeApi {
    pub fn new(width: HandleWidth) -> Self {
        Self::with_first_handle(width, 1)
    }

    /// Start numbering handles at `first`, e.g. above `u32::MAX` to exercise
    /// wide-only values.
    pub fn with_first_handle(width: HandleWidth, first: u64) -> Self {
        Self {
            width,
            next_handle: AtomicU64::new(first.max(1)),
            blocks: DashMap::new(),
            allocated_bytes: AtomicUsize::new(0),
            byte_limit: None,
        }
    }

    /// Fail allocations that would push the live total above `limit` bytes.
    pub fn with_byte_limit(mut self, limit: usize) -> Self {
        self.byte_limit = Some(limit);
        self
    }

    /// Number of blocks not yet freed.
    pub fn live_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Bytes held by live blocks.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes.load(Ordering::Acquire)
    }

    /// Current lock count of a block, if it exists.
    pub fn lock_count(&self, handle: HandleValue) -> Option<usize> {
        let block = self.block(handle).ok()?;
        let state = block.state.lock();
        Some(state.lock_count)
    }

    fn block(&self, handle: HandleValue) -> HandleResult<Arc<Block>> {
        self.blocks
            .get(&handle.as_u64())
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(HandleError::InvalidHandle {
                raw: handle.as_u64(),
                reason: "block is not allocated",
            })
    }

    fn reserve(&self, additional: usize) -> HandleResult<()> {
        let Some(limit) = self.byte_limit else {
            self.allocated_bytes.fetch_add(additional, Ordering::AcqRel);
            return Ok(());
        };

        self.allocated_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(additional).filter(|total| *total <= limit)
            })
            .map(|_| ())
            .map_err(|current| HandleError::Allocation {
                requested: additional,
                reason: format!("byte limit {limit} reached ({current} in use)"),
            })
    }

    fn release_bytes(&self, amount: usize) {
        self.allocated_bytes.fetch_sub(amount, Ordering::AcqRel);
    }
}

impl Default for HeapNativeApi {
    fn default() -> Self {
        Self::new(HandleWidth::native())
    }
}

// SAFETY: block data lives in a boxed slice that is only replaced by
// `resize` and dropped by `free`, both of which refuse while the lock count
// is non-zero. Cross-thread locks wait on `unlocked`, so only the owning
// thread can reach the memory between `lock` and the final `unlock`.
unsafe impl NativeApi for HeapNativeApi {
    fn handle_width(&self) -> HandleWidth {
        self.width
    }

    fn allocate(&self, size: usize) -> HandleResult<NativeHandle> {
        let raw = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let value = HandleValue::new(self.width, raw).map_err(|err| HandleError::Allocation {
            requested: size,
            reason: err.to_string(),
        })?;

        self.reserve(size)?;

        let block = Block {
            state: Mutex::new(BlockState {
                data: vec![0u8; size].into_boxed_slice(),
                owner: None,
                lock_count: 0,
                freed: false,
            }),
            unlocked: Condvar::new(),
        };
        self.blocks.insert(raw, Arc::new(block));

        tracing::trace!(handle = %value, size, "allocated native block");
        Ok(NativeHandle::from_raw(value))
    }

    fn free(&self, handle: HandleValue) -> HandleResult<()> {
        let block = self.block(handle)?;
        let mut state = block.state.lock();

        if state.freed {
            return Err(HandleError::InvalidHandle {
                raw: handle.as_u64(),
                reason: "block is not allocated",
            });
        }
        if state.lock_count > 0 {
            return Err(HandleError::LockFailed {
                raw: handle.as_u64(),
                reason: format!("cannot free a block locked {} time(s)", state.lock_count),
            });
        }

        state.freed = true;
        let size = state.data.len();
        state.data = Box::default();
        drop(state);

        self.blocks.remove(&handle.as_u64());
        self.release_bytes(size);
        tracing::trace!(handle = %handle, size, "freed native block");
        Ok(())
    }

    fn lock(&self, handle: HandleValue) -> HandleResult<NonNull<u8>> {
        let block = self.block(handle).map_err(|err| HandleError::LockFailed {
            raw: handle.as_u64(),
            reason: err.to_string(),
        })?;
        let me = std::thread::current().id();
        let mut state = block.state.lock();

        while state.owner.is_some_and(|owner| owner != me) {
            block.unlocked.wait(&mut state);
        }

        if state.freed {
            return Err(HandleError::LockFailed {
                raw: handle.as_u64(),
                reason: "block was freed".into(),
            });
        }

        state.owner = Some(me);
        state.lock_count += 1;
        NonNull::new(state.data.as_mut_ptr()).ok_or_else(|| HandleError::LockFailed {
            raw: handle.as_u64(),
            reason: "block has no address".into(),
        })
    }

    fn unlock(&self, handle: HandleValue) -> HandleResult<()> {
        let block = self.block(handle).map_err(|err| HandleError::LockFailed {
            raw: handle.as_u64(),
            reason: err.to_string(),
        })?;
        let mut state = block.state.lock();

        if state.lock_count == 0 || state.owner != Some(std::thread::current().id()) {
            return Err(HandleError::LockFailed {
                raw: handle.as_u64(),
                reason: "block is not locked by this thread".into(),
            });
        }

        state.lock_count -= 1;
        if state.lock_count == 0 {
            state.owner = None;
            block.unlocked.notify_all();
        }
        Ok(())
    }

    fn resize(&self, handle: HandleValue, new_size: usize) -> HandleResult<()> {
        let block = self.block(handle)?;
        let mut state = block.state.lock();

        if state.lock_count > 0 {
            return Err(HandleError::Allocation {
                requested: new_size,
                reason: "cannot resize a locked block".into(),
            });
        }

        let old_size = state.data.len();
        if new_size > old_size {
            self.reserve(new_size - old_size)?;
        } else {
            self.release_bytes(old_size - new_size);
        }

        let mut data = std::mem::take(&mut state.data).into_vec();
        data.resize(new_size, 0);
        state.data = data.into_boxed_slice();
        Ok(())
    }

    fn size(&self, handle: HandleValue) -> HandleResult<usize> {
        let block = self.block(handle)?;
        let state = block.state.lock();
        Ok(state.data.len())
    }

    fn decode_text(&self, bytes: &[u8]) -> HandleResult<String> {
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|err| HandleError::Decode(err.to_string()))
    }
}
