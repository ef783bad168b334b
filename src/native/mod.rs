//! Boundary to the native API collaborator.
//!
//! The core consumes exactly the primitives of [`NativeApi`]. Everything
//! else the native library offers lives in the domain layers on top.
//!
//! ## Implementations
//!
//! - [`HeapNativeApi`]: an in-process block allocator honouring the full
//!   contract (lock counts, resize refused while locked).
//! - [`RecordingNativeApi`]: wraps another implementation, records every call
//!   in order and can inject failures for chosen handles.

use std::ptr::NonNull;

use crate::error::HandleResult;
use crate::handle::{HandleValue, HandleWidth, NativeHandle};

pub mod heap;
pub mod recording;

pub use heap::HeapNativeApi;
pub use recording::{NativeCall, RecordingNativeApi};

/// Primitive operations of a handle-based native memory API.
///
/// Handles are passed as raw [`HandleValue`]s: disposed-flag checks are the
/// core's job, the collaborator only validates that the value names a live
/// block.
///
/// # Safety
///
/// Implementors must guarantee that a pointer returned by [`lock`] stays
/// valid for reads and writes of [`size`] bytes until the matching
/// [`unlock`], that the block is neither moved, resized nor freed while its
/// lock count is non-zero, and that no other thread can obtain the same
/// block's memory while it is locked. Nested locks by the locking thread are
/// allowed and counted.
///
/// [`lock`]: NativeApi::lock
/// [`unlock`]: NativeApi::unlock
/// [`size`]: NativeApi::size
pub unsafe trait NativeApi: Send + Sync {
    /// Width of the handles this API produces.
    fn handle_width(&self) -> HandleWidth;

    /// Allocate a block of `size` bytes.
    fn allocate(&self, size: usize) -> HandleResult<NativeHandle>;

    /// Release a block. Fails with `InvalidHandle` if it was already freed.
    fn free(&self, handle: HandleValue) -> HandleResult<()>;

    /// Pin a block and return its base address.
    fn lock(&self, handle: HandleValue) -> HandleResult<NonNull<u8>>;

    /// Undo one `lock`.
    fn unlock(&self, handle: HandleValue) -> HandleResult<()>;

    /// Change the size of an unlocked block, preserving its prefix.
    fn resize(&self, handle: HandleValue, new_size: usize) -> HandleResult<()>;

    /// Current size of a block in bytes.
    fn size(&self, handle: HandleValue) -> HandleResult<usize>;

    /// Decode native-encoded text into a host string.
    fn decode_text(&self, bytes: &[u8]) -> HandleResult<String>;
}
