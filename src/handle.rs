//! Portable native handle representation.
//!
//! A [`HandleValue`] is the raw word a native API hands out, in either a
//! 32-bit or a 64-bit flavour. A [`NativeHandle`] wraps a value together
//! with a shared disposed flag: clones observe the same flag, so once any
//! owner frees the resource every other copy refuses to expose the raw value.

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{HandleError, HandleResult};

/// Physical word width of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleWidth {
    Narrow,
    Wide,
}

impl HandleWidth {
    /// The width matching the target's pointer size.
    pub const fn native() -> Self {
        if cfg!(target_pointer_width = "64") {
            HandleWidth::Wide
        } else {
            HandleWidth::Narrow
        }
    }

    pub const fn bits(self) -> u32 {
        match self {
            HandleWidth::Narrow => 32,
            HandleWidth::Wide => 64,
        }
    }
}

/// Raw handle word in one of the two physical widths.
///
/// Equality, hashing and ordering compare the numeric value only, so a
/// narrow and a wide value naming the same resource are the same handle.
///
/// ```
/// use handlegrip::handle::HandleValue;
///
/// let wide = HandleValue::Wide(0x1_0000_0000);
/// assert!(wide.narrow().is_err());
///
/// let small = HandleValue::Wide(1);
/// let narrow = small.narrow().unwrap();
/// assert_eq!(narrow, HandleValue::Narrow(1));
/// assert_eq!(narrow.widen(), small);
/// ```
#[derive(Debug, Clone, Copy)]
pub enum HandleValue {
    Narrow(u32),
    Wide(u64),
}

impl HandleValue {
    /// Build a value of the requested width from a raw word.
    pub fn new(width: HandleWidth, raw: u64) -> HandleResult<Self> {
        match width {
            HandleWidth::Wide => Ok(HandleValue::Wide(raw)),
            HandleWidth::Narrow => HandleValue::Wide(raw).narrow(),
        }
    }

    pub const fn null(width: HandleWidth) -> Self {
        match width {
            HandleWidth::Narrow => HandleValue::Narrow(0),
            HandleWidth::Wide => HandleValue::Wide(0),
        }
    }

    pub const fn width(self) -> HandleWidth {
        match self {
            HandleValue::Narrow(_) => HandleWidth::Narrow,
            HandleValue::Wide(_) => HandleWidth::Wide,
        }
    }

    pub const fn as_u64(self) -> u64 {
        match self {
            HandleValue::Narrow(v) => v as u64,
            HandleValue::Wide(v) => v,
        }
    }

    /// True for the native "no resource" sentinel.
    pub const fn is_null(self) -> bool {
        self.as_u64() == 0
    }

    /// Lossless conversion to the wide variant.
    pub const fn widen(self) -> HandleValue {
        HandleValue::Wide(self.as_u64())
    }

    /// Conversion to the narrow variant; fails if the value needs more than
    /// 32 bits.
    pub fn narrow(self) -> HandleResult<HandleValue> {
        match self {
            HandleValue::Narrow(_) => Ok(self),
            HandleValue::Wide(v) => u32::try_from(v)
                .map(HandleValue::Narrow)
                .map_err(|_| HandleError::HandleOverflow { value: v }),
        }
    }

    /// Convert to the given width.
    pub fn to_width(self, width: HandleWidth) -> HandleResult<HandleValue> {
        match width {
            HandleWidth::Wide => Ok(self.widen()),
            HandleWidth::Narrow => self.narrow(),
        }
    }
}

impl PartialEq for HandleValue {
    fn eq(&self, other: &Self) -> bool {
        self.as_u64() == other.as_u64()
    }
}

impl Eq for HandleValue {}

impl Hash for HandleValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_u64().hash(state);
    }
}

impl PartialOrd for HandleValue {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HandleValue {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.as_u64().cmp(&other.as_u64())
    }
}

impl fmt::Display for HandleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.as_u64())
    }
}

impl From<u32> for HandleValue {
    fn from(value: u32) -> Self {
        HandleValue::Narrow(value)
    }
}

impl From<u64> for HandleValue {
    fn from(value: u64) -> Self {
        HandleValue::Wide(value)
    }
}

impl TryFrom<HandleValue> for u32 {
    type Error = HandleError;

    fn try_from(value: HandleValue) -> Result<Self, Self::Error> {
        match value.narrow()? {
            HandleValue::Narrow(v) => Ok(v),
            HandleValue::Wide(v) => Err(HandleError::HandleOverflow { value: v }),
        }
    }
}

struct HandleCell {
    value: HandleValue,
    disposed: AtomicBool,
}

/// Reference to a native resource with a shared disposed flag.
///
/// # Examples
///
/// ```
/// use handlegrip::handle::NativeHandle;
///
/// let handle = NativeHandle::from_raw(42u32);
/// assert_eq!(handle.raw_value().unwrap().as_u64(), 42);
///
/// let copy = handle.clone();
/// handle.mark_disposed();
/// assert!(copy.raw_value().is_err());
/// ```
#[derive(Clone)]
pub struct NativeHandle {
    cell: Arc<HandleCell>,
}

impl NativeHandle {
    /// Wrap a raw value. Never fails; the value is opaque.
    pub fn from_raw(value: impl Into<HandleValue>) -> Self {
        Self {
            cell: Arc::new(HandleCell {
                value: value.into(),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn null(width: HandleWidth) -> Self {
        Self::from_raw(HandleValue::null(width))
    }

    pub fn is_null(&self) -> bool {
        self.cell.value.is_null()
    }

    pub fn width(&self) -> HandleWidth {
        self.cell.value.width()
    }

    pub fn is_disposed(&self) -> bool {
        self.cell.disposed.load(Ordering::Acquire)
    }

    /// Flag the handle as freed. Idempotent; returns `true` only for the call
    /// that performed the transition.
    pub fn mark_disposed(&self) -> bool {
        !self.cell.disposed.swap(true, Ordering::AcqRel)
    }

    /// The raw value of a live, non-null handle.
    pub fn raw_value(&self) -> HandleResult<HandleValue> {
        let value = self.raw_value_allow_null()?;
        if value.is_null() {
            return Err(HandleError::InvalidHandle {
                raw: 0,
                reason: "null handle",
            });
        }
        Ok(value)
    }

    /// The raw value of a live handle, permitting the null sentinel.
    pub fn raw_value_allow_null(&self) -> HandleResult<HandleValue> {
        if self.is_disposed() {
            return Err(HandleError::InvalidHandle {
                raw: self.cell.value.as_u64(),
                reason: "handle has been disposed",
            });
        }
        Ok(self.cell.value)
    }

    /// Atomically mark the handle disposed and hand back its value for the
    /// native free. `None` if it was already disposed or is null, so at most
    /// one caller ever frees a given handle.
    pub(crate) fn retire(&self) -> Option<HandleValue> {
        if self.is_null() {
            self.mark_disposed();
            return None;
        }
        self.mark_disposed().then_some(self.cell.value)
    }

    /// The stored value regardless of state, for diagnostics only.
    pub(crate) fn peek(&self) -> HandleValue {
        self.cell.value
    }

    /// True if both handles share one disposed flag (clones of one handle).
    pub fn same_handle(&self, other: &NativeHandle) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeHandle")
            .field("value", &format_args!("{}", self.cell.value))
            .field("width", &self.width())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
