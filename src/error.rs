//! Error types for the handle lifecycle core.

use thiserror::Error;

use crate::owner_graph::NodeId;

/// Errors that can occur while driving native handles.
///
/// # Examples
///
/// ```
/// use handlegrip::error::{HandleError, HandleResult};
///
/// let overflow = HandleError::HandleOverflow { value: 0x1_0000_0000 };
/// assert_eq!(
///     overflow.to_string(),
///     "Handle value 0x100000000 does not fit in a narrow handle"
/// );
///
/// let failure: HandleResult<u32> = Err(overflow);
/// assert!(failure.is_err());
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandleError {
    /// The handle is null or already disposed
    #[error("Invalid handle {raw:#x}: {reason}")]
    InvalidHandle { raw: u64, reason: &'static str },
    /// A wide value was narrowed but does not fit in 32 bits
    #[error("Handle value {value:#x} does not fit in a narrow handle")]
    HandleOverflow { value: u64 },
    /// The native lock or unlock primitive reported a failure
    #[error("Lock failed for handle {raw:#x}: {reason}")]
    LockFailed { raw: u64, reason: String },
    /// The native allocate or resize primitive failed
    #[error("Allocation of {requested} bytes failed: {reason}")]
    Allocation { requested: usize, reason: String },
    /// The proxy object has already been torn down
    #[error("Object {node} has been disposed")]
    ObjectDisposed { node: NodeId },
    /// Cascading teardown completed with failures
    #[error(
        "Disposal completed with {} error(s), first: {}",
        .errors.len(),
        .errors.first().map(ToString::to_string).unwrap_or_default()
    )]
    PartialDisposal { errors: Vec<HandleError> },
    /// A requested view is larger than the native block
    #[error("Requested {requested} bytes but the block holds {available}")]
    BoundsExceeded { requested: usize, available: usize },
    /// The native text decoder rejected its input
    #[error("Text decode failed: {0}")]
    Decode(String),

    #[error("Background reclaimer could not start: {0}")]
    Reclaimer(String),
}

impl HandleError {
    /// Build a `PartialDisposal` from collected errors, flattening nested
    /// partial failures. Returns `None` when nothing failed.
    pub fn from_disposal_errors(errors: Vec<HandleError>) -> Option<HandleError> {
        let mut flat = Vec::with_capacity(errors.len());
        for error in errors {
            match error {
                HandleError::PartialDisposal { errors } => flat.extend(errors),
                other => flat.push(other),
            }
        }

        if flat.is_empty() {
            None
        } else {
            Some(HandleError::PartialDisposal { errors: flat })
        }
    }

    /// The first underlying error of a partial disposal, or `self`.
    pub fn first(&self) -> &HandleError {
        match self {
            HandleError::PartialDisposal { errors } => errors.first().unwrap_or(self),
            other => other,
        }
    }
}

/// Result type for handle operations
pub type HandleResult<T> = Result<T, HandleError>;
