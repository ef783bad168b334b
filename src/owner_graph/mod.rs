//! Ownership graph of proxy objects wrapping native resources.
//!
//! Every proxy is an [`ApiObject`] registered in an [`OwnerGraph`]. A parent
//! holds its children strongly; a child only remembers its parent weakly,
//! so dropping the last reference to a parent releases the whole subtree.
//!
//! ## Teardown paths
//!
//! ```text
//! explicit                       implicit
//! ─────────                      ─────────
//! ApiObject::dispose()           last reference dropped
//!   ├── Live → Disposing           ├── children dropped first
//!   ├── dispose children           ├── handles queued (ReclaimQueue)
//!   ├── free own handles (LIFO)    └── sweep frees them later:
//!   └── → Disposed                     reclaim() / background / graph drop
//! ```
//!
//! Explicit disposal is the primary mechanism. The sweep is a safety net
//! with no latency guarantee, but every queued node is processed exactly
//! once, at the latest when the graph itself is dropped.

mod node;
mod reclaim;

pub use node::{ApiObject, NodeState};
pub use reclaim::{FailedReclaim, ReclaimReport};

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::CoreConfig;
use crate::error::{HandleError, HandleResult};
use crate::handle::NativeHandle;
use crate::native::NativeApi;
use node::ObjectInner;
use reclaim::ReclaimQueue;

/// Identifier of a node, unique within its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

#[derive(Default)]
struct GraphCounters {
    registered: AtomicUsize,
    disposed: AtomicUsize,
    reclaimed: AtomicUsize,
    handles_freed: AtomicUsize,
    failed_frees: AtomicUsize,
}

/// Snapshot of graph activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphStats {
    /// Nodes ever registered
    pub registered: usize,
    /// Nodes currently reachable
    pub live: usize,
    /// Nodes torn down through `dispose`
    pub disposed: usize,
    /// Nodes torn down by a reclamation sweep
    pub reclaimed: usize,
    /// Unreachable nodes waiting for a sweep
    pub pending: usize,
    /// Native frees performed by either path
    pub handles_freed: usize,
    /// Native frees that failed on either path
    pub failed_frees: usize,
}

pub(crate) struct GraphShared {
    api: Arc<dyn NativeApi>,
    nodes: DashMap<NodeId, Weak<ObjectInner>>,
    next_id: AtomicU64,
    reclaim: ReclaimQueue,
    counters: GraphCounters,
    reclaim_interval: Duration,
    background_running: AtomicBool,
    shut_down: AtomicBool,
    reclaimer: Mutex<Option<rayon::ThreadPool>>,
}

impl GraphShared {
    pub(crate) fn api(&self) -> &dyn NativeApi {
        &*self.api
    }

    fn sweep(&self) -> ReclaimReport {
        let report = self.reclaim.sweep(&*self.api);
        self.counters
            .reclaimed
            .fetch_add(report.nodes_reclaimed, Ordering::Relaxed);
        self.counters
            .handles_freed
            .fetch_add(report.handles_freed, Ordering::Relaxed);
        self.counters
            .failed_frees
            .fetch_add(report.failures, Ordering::Relaxed);

        if !report.is_empty() {
            tracing::debug!(
                nodes = report.nodes_reclaimed,
                handles = report.handles_freed,
                failures = report.failures,
                "reclamation sweep finished"
            );
        }
        report
    }

    pub(crate) fn record_disposal(&self, freed: usize, failed: usize) {
        self.counters.disposed.fetch_add(1, Ordering::Relaxed);
        self.record_frees(freed, failed);
    }

    pub(crate) fn record_frees(&self, freed: usize, failed: usize) {
        self.counters.handles_freed.fetch_add(freed, Ordering::Relaxed);
        self.counters.failed_frees.fetch_add(failed, Ordering::Relaxed);
    }
}

impl Drop for GraphShared {
    fn drop(&mut self) {
        // Every node holds the graph, so nothing can enqueue after this.
        let report = self.sweep();
        tracing::debug!(
            nodes = report.nodes_reclaimed,
            failures = report.failures,
            "owner graph dropped, final sweep done"
        );
    }
}

/// Registry of proxy objects and their native allocations.
///
/// Cloning an `OwnerGraph` yields another handle to the same graph.
///
/// # Examples
///
/// ```
/// use handlegrip::native::RecordingNativeApi;
/// use handlegrip::owner_graph::OwnerGraph;
/// use std::sync::Arc;
///
/// let api = Arc::new(RecordingNativeApi::default());
/// let graph = OwnerGraph::new(api.clone());
///
/// let database = graph.register(None).unwrap();
/// let note = graph.register(Some(&database)).unwrap();
/// let buffer = note.allocate(64).unwrap();
/// let raw = buffer.raw_value().unwrap();
///
/// database.dispose().unwrap();
/// assert!(note.is_disposed());
/// assert!(buffer.is_disposed());
/// assert_eq!(api.free_count(raw), 1);
/// ```
#[derive(Clone)]
pub struct OwnerGraph {
    shared: Arc<GraphShared>,
}

impl OwnerGraph {
    /// Create a graph over `api` with the default configuration.
    pub fn new(api: Arc<dyn NativeApi>) -> Self {
        Self::with_config(api, &CoreConfig::default())
    }

    /// Create a graph, starting the background reclaimer if configured.
    pub fn with_config(api: Arc<dyn NativeApi>, config: &CoreConfig) -> Self {
        if api.handle_width() != config.handle_width {
            tracing::warn!(
                configured = ?config.handle_width,
                native = ?api.handle_width(),
                "native API handle width differs from configuration"
            );
        }

        let graph = Self {
            shared: Arc::new(GraphShared {
                api,
                nodes: DashMap::new(),
                next_id: AtomicU64::new(1),
                reclaim: ReclaimQueue::new(),
                counters: GraphCounters::default(),
                reclaim_interval: config.reclaim_interval,
                background_running: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                reclaimer: Mutex::new(None),
            }),
        };

        if config.background_reclaim {
            if let Err(err) = graph.start_background_reclaimer() {
                tracing::warn!(error = %err, "background reclaimer unavailable, sweeping on demand only");
            }
        }
        graph
    }

    pub fn api(&self) -> &Arc<dyn NativeApi> {
        &self.shared.api
    }

    /// Register a new proxy under `parent`, or as a root.
    ///
    /// Fails with `ObjectDisposed` if the parent is already torn down.
    pub fn register(&self, parent: Option<&ApiObject>) -> HandleResult<ApiObject> {
        let id = NodeId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let object = ApiObject::attach(Arc::clone(&self.shared), id, parent)?;
        self.shared.counters.registered.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            node = %id,
            parent = ?parent.map(ApiObject::id),
            "registered proxy object"
        );
        Ok(object)
    }

    /// Register a proxy that takes ownership of an existing handle.
    ///
    /// If registration fails the handle stays with the caller.
    pub fn adopt(&self, handle: NativeHandle, parent: Option<&ApiObject>) -> HandleResult<ApiObject> {
        handle.raw_value()?;
        let object = self.register(parent)?;
        object.add_allocation(handle)?;
        Ok(object)
    }

    /// Look up a still-reachable node.
    pub fn node(&self, id: NodeId) -> Option<ApiObject> {
        let weak = self.shared.nodes.get(&id).map(|entry| entry.value().clone())?;
        ApiObject::upgrade(&weak)
    }

    /// Number of nodes neither disposed nor unreachable.
    pub fn live_nodes(&self) -> usize {
        self.shared.nodes.len()
    }

    /// Unreachable nodes waiting for a sweep.
    pub fn pending_reclaims(&self) -> usize {
        self.shared.reclaim.pending()
    }

    /// Run a reclamation sweep now.
    pub fn reclaim(&self) -> ReclaimReport {
        self.shared.sweep()
    }

    /// Frees that failed during disposal or sweeps and are waiting for a retry.
    pub fn failed_reclamations(&self) -> Vec<FailedReclaim> {
        self.shared.reclaim.quarantine()
    }

    /// Retry every quarantined free. Handles whose free fails again stay
    /// quarantined.
    pub fn retry_failed_frees(&self) -> ReclaimReport {
        let report = self.shared.reclaim.retry_quarantined(&*self.shared.api);
        self.shared.counters.handles_freed.fetch_add(report.handles_freed, Ordering::Relaxed);
        if !report.is_empty() {
            tracing::debug!(
                handles = report.handles_freed,
                failures = report.failures,
                "retried quarantined frees"
            );
        }
        report
    }

    /// Start sweeping on a dedicated single-thread pool, woken by new
    /// unreachable nodes or every `reclaim_interval`. Idempotent.
    ///
    /// The sweeper only holds the graph weakly and exits once the graph is
    /// shut down or dropped. It never occupies a worker of the global rayon
    /// pool, so any number of graphs can sweep in the background at once.
    pub fn start_background_reclaimer(&self) -> HandleResult<()> {
        if self.shared.background_running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .thread_name(|index| format!("handlegrip-reclaimer-{}", index))
            .build()
        {
            Ok(pool) => pool,
            Err(err) => {
                self.shared.background_running.store(false, Ordering::Release);
                return Err(HandleError::Reclaimer(err.to_string()));
            }
        };

        let weak = Arc::downgrade(&self.shared);
        let notifications = self.shared.reclaim.notifications();
        let interval = self.shared.reclaim_interval;
        tracing::debug!(?interval, "starting background reclaimer");

        pool.spawn(move || {
            loop {
                match notifications.recv_timeout(interval) {
                    Ok(()) | Err(flume::RecvTimeoutError::Timeout) => {}
                    Err(flume::RecvTimeoutError::Disconnected) => break,
                }

                let Some(shared) = weak.upgrade() else {
                    break;
                };
                if shared.shut_down.load(Ordering::Acquire) {
                    shared.background_running.store(false, Ordering::Release);
                    break;
                }
                shared.sweep();
            }
            tracing::debug!("background reclaimer stopped");
        });
        *self.shared.reclaimer.lock() = Some(pool);
        Ok(())
    }

    /// Stop the background reclaimer and sweep whatever is queued.
    ///
    /// Nodes that become unreachable afterwards are still reclaimed by
    /// explicit sweeps or when the graph is dropped.
    pub fn shutdown(&self) -> ReclaimReport {
        self.shared.shut_down.store(true, Ordering::Release);
        self.shared.reclaim.notify();
        self.shared.sweep()
    }

    pub fn stats(&self) -> GraphStats {
        let counters = &self.shared.counters;
        GraphStats {
            registered: counters.registered.load(Ordering::Relaxed),
            live: self.shared.nodes.len(),
            disposed: counters.disposed.load(Ordering::Relaxed),
            reclaimed: counters.reclaimed.load(Ordering::Relaxed),
            pending: self.shared.reclaim.pending(),
            handles_freed: counters.handles_freed.load(Ordering::Relaxed),
            failed_frees: counters.failed_frees.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn from_shared(shared: Arc<GraphShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn forget(shared: &GraphShared, id: NodeId) {
        shared.nodes.remove(&id);
    }

    pub(crate) fn enqueue(shared: &GraphShared, node: NodeId, handles: Vec<NativeHandle>) {
        shared.reclaim.enqueue(reclaim::PendingReclaim { node, handles });
    }
}

impl fmt::Debug for OwnerGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnerGraph").field("stats", &self.stats()).finish()
    }
}
