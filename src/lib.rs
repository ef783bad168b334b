//! Lifecycle core for proxies over handle-based native resources.
//!
//! - [`handle`]: narrow/wide handle values and the shared disposed flag
//! - [`lock`]: scoped, bounds-checked access to locked native bytes
//! - [`owner_graph`]: parent/child proxies, cascading disposal and deferred
//!   reclamation of unreachable nodes
//! - [`cache`] and [`text`]: a weight-bounded LRU cache and its text-decoding
//!   instantiation
//! - [`native`]: the collaborator boundary plus an in-process heap and a
//!   recording wrapper
//!
//! ```
//! use handlegrip::native::RecordingNativeApi;
//! use handlegrip::owner_graph::OwnerGraph;
//! use std::sync::Arc;
//!
//! let api = Arc::new(RecordingNativeApi::default());
//! let graph = OwnerGraph::new(api.clone());
//!
//! let parent = graph.register(None)?;
//! let child = graph.register(Some(&parent))?;
//! let buffer = child.allocate(64)?;
//!
//! child.with_lock(&buffer, None, |view| view.fill(0x2a))?;
//! let bytes = child.with_lock(&buffer, None, |view| view.to_vec())?;
//! assert!(bytes.iter().all(|b| *b == 0x2a));
//!
//! parent.dispose()?;
//! assert_eq!(api.total_frees(), 1);
//! # Ok::<(), handlegrip::HandleError>(())
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod handle;
pub mod lock;
pub mod native;
pub mod owner_graph;
pub mod text;

pub use cache::{CacheStats, Weigher, WeightedLruCache};
pub use config::CoreConfig;
pub use error::{HandleError, HandleResult};
pub use handle::{HandleValue, HandleWidth, NativeHandle};
pub use lock::{LockedView, with_lock, with_locks};
pub use native::NativeApi;
pub use owner_graph::{ApiObject, GraphStats, NodeId, NodeState, OwnerGraph, ReclaimReport};
pub use text::TextDecodeCache;
