//! Proxy objects and their teardown.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::reclaim::FailedReclaim;
use super::{GraphShared, NodeId, OwnerGraph};
use crate::error::{HandleError, HandleResult};
use crate::handle::{HandleValue, NativeHandle};
use crate::lock::{self, LockedView};

const LIVE: u8 = 0;
const DISPOSING: u8 = 1;
const DISPOSED: u8 = 2;

/// Lifecycle state of a node. `Disposed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Live,
    /// Teardown in progress; re-entrant disposal is a no-op.
    Disposing,
    Disposed,
}

impl NodeState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            LIVE => NodeState::Live,
            DISPOSING => NodeState::Disposing,
            _ => NodeState::Disposed,
        }
    }
}

/// Node-scoped native accesses in progress, and frees waiting for them.
#[derive(Default)]
struct AccessState {
    in_flight: usize,
    deferred: Vec<HandleValue>,
}

/// Marks one node-scoped access; the last one out performs deferred frees.
struct AccessGuard<'a> {
    node: &'a ObjectInner,
}

impl Drop for AccessGuard<'_> {
    fn drop(&mut self) {
        let deferred = {
            let mut access = self.node.access.lock();
            access.in_flight -= 1;
            if access.in_flight == 0 {
                std::mem::take(&mut access.deferred)
            } else {
                Vec::new()
            }
        };
        if deferred.is_empty() {
            return;
        }

        let mut errors = Vec::new();
        let (freed, failed) = self.node.free_retired(deferred, &mut errors);
        self.node.graph.record_frees(freed, failed);
        tracing::debug!(node = %self.node.id, freed, failed, "performed frees deferred by disposal");
    }
}

pub(crate) struct ObjectInner {
    id: NodeId,
    state: AtomicU8,
    access: Mutex<AccessState>,
    parent: Mutex<Weak<ObjectInner>>,
    children: Mutex<Vec<Arc<ObjectInner>>>,
    allocations: Mutex<Vec<NativeHandle>>,
    graph: Arc<GraphShared>,
}

impl ObjectInner {
    fn state(&self) -> NodeState {
        NodeState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Register a node-scoped access. Fails once disposal has begun, so no
    /// new access can start after `dispose` checked for running ones.
    fn enter(&self) -> HandleResult<AccessGuard<'_>> {
        let mut access = self.access.lock();
        if self.state() != NodeState::Live {
            return Err(HandleError::ObjectDisposed { node: self.id });
        }
        access.in_flight += 1;
        Ok(AccessGuard { node: self })
    }

    /// Free already retired handle values in the given order. Failures are
    /// quarantined so the graph can retry them.
    fn free_retired(&self, raws: Vec<HandleValue>, errors: &mut Vec<HandleError>) -> (usize, usize) {
        let mut freed = 0;
        let mut failed = 0;
        for raw in raws {
            match self.graph.api().free(raw) {
                Ok(()) => freed += 1,
                Err(err) => {
                    tracing::warn!(node = %self.id, handle = %raw, error = %err, "native free failed during dispose");
                    failed += 1;
                    self.graph.reclaim.quarantine_failure(FailedReclaim {
                        node: self.id,
                        handle: raw,
                        error: err.clone(),
                    });
                    errors.push(err);
                }
            }
        }
        (freed, failed)
    }

    fn dispose(&self) -> HandleResult<()> {
        if self
            .state
            .compare_exchange(LIVE, DISPOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        let mut errors = Vec::new();

        // Registration checks the state under this lock, so no child can be
        // added once the list is taken.
        let children = std::mem::take(&mut *self.children.lock());
        for child in children.iter().rev() {
            if let Err(err) = child.dispose() {
                errors.push(err);
            }
        }
        drop(children);

        let allocations = std::mem::take(&mut *self.allocations.lock());
        let retired: Vec<HandleValue> = allocations
            .iter()
            .rev()
            .filter_map(NativeHandle::retire)
            .collect();

        // A node-scoped lock still running keeps its block pinned; the last
        // access to finish frees instead.
        let to_free = {
            let mut access = self.access.lock();
            if access.in_flight > 0 {
                tracing::debug!(node = %self.id, in_flight = access.in_flight, handles = retired.len(), "deferring frees until node accesses finish");
                access.deferred.extend(retired);
                Vec::new()
            } else {
                retired
            }
        };
        let (freed, failed) = self.free_retired(to_free, &mut errors);

        self.state.store(DISPOSED, Ordering::Release);
        self.detach_from_parent();
        OwnerGraph::forget(&self.graph, self.id);
        self.graph.record_disposal(freed, failed);

        tracing::debug!(node = %self.id, freed, failed, "disposed proxy object");

        match HandleError::from_disposal_errors(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn detach_from_parent(&self) {
        let parent = self.parent.lock().upgrade();
        let Some(parent) = parent else {
            return;
        };

        let removed = {
            let mut siblings = parent.children.lock();
            siblings
                .iter()
                .position(|child| child.id == self.id)
                .map(|index| siblings.remove(index))
        };
        drop(removed);
    }
}

impl Drop for ObjectInner {
    fn drop(&mut self) {
        OwnerGraph::forget(&self.graph, self.id);
        if *self.state.get_mut() != LIVE {
            return;
        }

        // Post-order: children this node kept alive go first.
        drop(std::mem::take(self.children.get_mut()));

        let handles = std::mem::take(self.allocations.get_mut());
        OwnerGraph::enqueue(&self.graph, self.id, handles);
    }
}

/// A managed proxy in an [`OwnerGraph`].
///
/// Cloning shares the node. Every operation first checks that the node is
/// still live and fails with [`HandleError::ObjectDisposed`] otherwise.
#[derive(Clone)]
pub struct ApiObject {
    inner: Arc<ObjectInner>,
}

impl ApiObject {
    pub(crate) fn attach(
        graph: Arc<GraphShared>,
        id: NodeId,
        parent: Option<&ApiObject>,
    ) -> HandleResult<Self> {
        let inner = Arc::new(ObjectInner {
            id,
            state: AtomicU8::new(LIVE),
            access: Mutex::new(AccessState::default()),
            parent: Mutex::new(Weak::new()),
            children: Mutex::new(Vec::new()),
            allocations: Mutex::new(Vec::new()),
            graph,
        });

        if let Some(parent) = parent {
            let mut siblings = parent.inner.children.lock();
            if parent.inner.state() != NodeState::Live {
                drop(siblings);
                // Never registered, nothing to reclaim.
                inner.state.store(DISPOSED, Ordering::Release);
                return Err(HandleError::ObjectDisposed { node: parent.id() });
            }
            *inner.parent.lock() = Arc::downgrade(&parent.inner);
            inner.graph.nodes.insert(id, Arc::downgrade(&inner));
            siblings.push(Arc::clone(&inner));
        } else {
            inner.graph.nodes.insert(id, Arc::downgrade(&inner));
        }

        Ok(Self { inner })
    }

    pub(crate) fn upgrade(weak: &Weak<ObjectInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    // id, state, is_disposed, check_disposed and graph are state queries and
    // work on disposed nodes; every other operation fails with ObjectDisposed.

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn state(&self) -> NodeState {
        self.inner.state()
    }

    pub fn is_disposed(&self) -> bool {
        self.state() != NodeState::Live
    }

    /// Fail with `ObjectDisposed` unless the node is live.
    pub fn check_disposed(&self) -> HandleResult<()> {
        match self.state() {
            NodeState::Live => Ok(()),
            _ => Err(HandleError::ObjectDisposed { node: self.id() }),
        }
    }

    /// The graph this node belongs to.
    pub fn graph(&self) -> OwnerGraph {
        OwnerGraph::from_shared(Arc::clone(&self.inner.graph))
    }

    /// Hand ownership of `handle` to this node; it is freed when the node is
    /// disposed or reclaimed.
    pub fn add_allocation(&self, handle: NativeHandle) -> HandleResult<()> {
        handle.raw_value()?;
        let mut allocations = self.inner.allocations.lock();
        self.check_disposed()?;
        allocations.push(handle);
        Ok(())
    }

    /// Allocate `size` native bytes owned by this node.
    pub fn allocate(&self, size: usize) -> HandleResult<NativeHandle> {
        self.check_disposed()?;
        let api = self.inner.graph.api();
        let handle = api.allocate(size)?;

        if let Err(err) = self.add_allocation(handle.clone()) {
            if let Some(raw) = handle.retire() {
                if let Err(free_err) = api.free(raw) {
                    tracing::warn!(node = %self.id(), handle = %raw, error = %free_err, "could not free orphaned allocation");
                }
            }
            return Err(err);
        }

        tracing::trace!(node = %self.id(), handle = %handle.peek(), size, "node allocated native block");
        Ok(handle)
    }

    /// Remove `handle` from this node without freeing it.
    pub fn release_allocation(&self, handle: &NativeHandle) -> HandleResult<NativeHandle> {
        self.check_disposed()?;
        let mut allocations = self.inner.allocations.lock();
        let index = allocations
            .iter()
            .position(|owned| owned.same_handle(handle))
            .ok_or_else(|| not_owned(handle))?;
        Ok(allocations.remove(index))
    }

    pub fn owns(&self, handle: &NativeHandle) -> HandleResult<bool> {
        self.check_disposed()?;
        Ok(self.holds(handle))
    }

    fn holds(&self, handle: &NativeHandle) -> bool {
        self.inner
            .allocations
            .lock()
            .iter()
            .any(|owned| owned.same_handle(handle))
    }

    fn ensure_owned(&self, handle: &NativeHandle) -> HandleResult<()> {
        if self.holds(handle) {
            Ok(())
        } else {
            Err(not_owned(handle))
        }
    }

    /// [`lock::with_lock`] on a handle owned by this node.
    ///
    /// A `dispose` that starts while the callback runs does not free the
    /// node's handles until the lock is released.
    pub fn with_lock<R>(
        &self,
        handle: &NativeHandle,
        length: Option<usize>,
        f: impl FnOnce(&mut LockedView<'_>) -> R,
    ) -> HandleResult<R> {
        let _access = self.inner.enter()?;
        self.ensure_owned(handle)?;
        lock::with_lock(self.inner.graph.api(), handle, length, f)
    }

    /// [`lock::with_locks`] on two handles owned by this node.
    pub fn with_locks<R>(
        &self,
        first: &NativeHandle,
        second: &NativeHandle,
        f: impl FnOnce(&mut LockedView<'_>, &mut LockedView<'_>) -> R,
    ) -> HandleResult<R> {
        let _access = self.inner.enter()?;
        self.ensure_owned(first)?;
        self.ensure_owned(second)?;
        lock::with_locks(self.inner.graph.api(), first, second, f)
    }

    pub fn resize(&self, handle: &NativeHandle, new_size: usize) -> HandleResult<()> {
        let _access = self.inner.enter()?;
        self.ensure_owned(handle)?;
        self.inner.graph.api().resize(handle.raw_value()?, new_size)
    }

    pub fn size_of(&self, handle: &NativeHandle) -> HandleResult<usize> {
        let _access = self.inner.enter()?;
        self.ensure_owned(handle)?;
        self.inner.graph.api().size(handle.raw_value()?)
    }

    pub fn children(&self) -> HandleResult<Vec<ApiObject>> {
        self.check_disposed()?;
        Ok(self
            .inner
            .children
            .lock()
            .iter()
            .map(|inner| ApiObject {
                inner: Arc::clone(inner),
            })
            .collect())
    }

    /// The parent, or `None` for a root or a node whose parent is gone.
    pub fn parent(&self) -> HandleResult<Option<ApiObject>> {
        self.check_disposed()?;
        let parent = self.inner.parent.lock().clone();
        Ok(Self::upgrade(&parent))
    }

    /// Handles currently owned by this node, in acquisition order.
    pub fn allocations(&self) -> HandleResult<Vec<NativeHandle>> {
        self.check_disposed()?;
        Ok(self.inner.allocations.lock().clone())
    }

    /// Tear down this node and its descendants, children first.
    ///
    /// Own handles are freed in reverse acquisition order. If another thread
    /// is inside a node-scoped lock, the frees happen when that lock is
    /// released. Disposing a node that is already disposed, or mid-disposal,
    /// does nothing. Every failure is collected and returned as one
    /// [`HandleError::PartialDisposal`] and quarantined for
    /// [`OwnerGraph::retry_failed_frees`]; the node ends up disposed either
    /// way.
    pub fn dispose(&self) -> HandleResult<()> {
        self.inner.dispose()
    }

    /// Consume the proxy and dispose it.
    pub fn close(self) -> HandleResult<()> {
        self.dispose()
    }
}

fn not_owned(handle: &NativeHandle) -> HandleError {
    HandleError::InvalidHandle {
        raw: handle.peek().as_u64(),
        reason: "handle is not owned by this object",
    }
}

impl fmt::Debug for ApiObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiObject")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{NativeApi, NativeCall, RecordingNativeApi};

    fn setup() -> (Arc<RecordingNativeApi>, OwnerGraph) {
        let api = Arc::new(RecordingNativeApi::default());
        let graph = OwnerGraph::new(api.clone());
        (api, graph)
    }

    #[test]
    fn dispose_frees_own_handles_lifo() {
        let (api, graph) = setup();
        let node = graph.register(None).unwrap();
        let a = node.allocate(1).unwrap().raw_value().unwrap();
        let b = node.allocate(1).unwrap().raw_value().unwrap();
        api.clear_calls();

        node.dispose().unwrap();
        assert_eq!(api.calls(), vec![NativeCall::Free(b), NativeCall::Free(a)]);
        assert_eq!(node.state(), NodeState::Disposed);
    }

    #[test]
    fn second_dispose_is_noop() {
        let (api, graph) = setup();
        let node = graph.register(None).unwrap();
        let raw = node.allocate(1).unwrap().raw_value().unwrap();

        node.dispose().unwrap();
        node.dispose().unwrap();
        assert_eq!(api.free_count(raw), 1);
        assert_eq!(graph.stats().disposed, 1);
    }

    #[test]
    fn operations_after_dispose_fail() {
        let (_api, graph) = setup();
        let node = graph.register(None).unwrap();
        let handle = node.allocate(4).unwrap();
        node.dispose().unwrap();

        let expected = HandleError::ObjectDisposed { node: node.id() };
        assert_eq!(node.allocate(1).unwrap_err(), expected);
        assert_eq!(node.with_lock(&handle, None, |_| ()).unwrap_err(), expected);
        assert_eq!(node.size_of(&handle).unwrap_err(), expected);
        assert_eq!(node.check_disposed().unwrap_err(), expected);
        assert_eq!(node.owns(&handle).unwrap_err(), expected);
        assert_eq!(node.children().unwrap_err(), expected);
        assert_eq!(node.parent().unwrap_err(), expected);
        assert_eq!(node.allocations().unwrap_err(), expected);
    }

    #[test]
    fn dispose_inside_lock_callback_frees_after_unlock() {
        let (api, graph) = setup();
        let node = graph.register(None).unwrap();
        let handle = node.allocate(4).unwrap();
        let raw = handle.raw_value().unwrap();

        let disposed = node
            .with_lock(&handle, None, |view| {
                view.fill(1);
                node.dispose()
            })
            .unwrap();
        assert!(disposed.is_ok());
        assert!(node.is_disposed());
        assert_eq!(api.free_count(raw), 1);
        assert_eq!(api.lock_calls(), api.unlock_calls());
        assert_eq!(api.inner().live_blocks(), 0);
        assert_eq!(graph.stats().handles_freed, 1);
    }

    #[test]
    fn failures_are_aggregated_and_siblings_still_freed() {
        let (api, graph) = setup();
        let root = graph.register(None).unwrap();
        let left = graph.register(Some(&root)).unwrap();
        let right = graph.register(Some(&root)).unwrap();

        let bad = left.allocate(1).unwrap().raw_value().unwrap();
        let good = right.allocate(1).unwrap().raw_value().unwrap();
        let own = root.allocate(1).unwrap().raw_value().unwrap();
        api.fail_free_for(bad);

        let err = root.dispose().unwrap_err();
        match &err {
            HandleError::PartialDisposal { errors } => assert_eq!(errors.len(), 1),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(api.free_count(good), 1);
        assert_eq!(api.free_count(own), 1);
        assert!(left.is_disposed() && right.is_disposed() && root.is_disposed());

        let quarantined = graph.failed_reclamations();
        assert_eq!(quarantined.len(), 1);
        assert_eq!(quarantined[0].handle, bad);
    }

    #[test]
    fn unowned_handles_are_rejected() {
        let (api, graph) = setup();
        let node = graph.register(None).unwrap();
        let stranger = api.allocate(2).unwrap();

        assert!(matches!(
            node.with_lock(&stranger, None, |_| ()),
            Err(HandleError::InvalidHandle { .. })
        ));
        assert!(node.resize(&stranger, 4).is_err());
    }

    #[test]
    fn released_allocation_is_not_freed() {
        let (api, graph) = setup();
        let node = graph.register(None).unwrap();
        let handle = node.allocate(2).unwrap();
        let raw = handle.raw_value().unwrap();

        let released = node.release_allocation(&handle).unwrap();
        assert!(released.same_handle(&handle));
        assert!(!node.owns(&handle).unwrap());
        node.dispose().unwrap();
        assert_eq!(api.free_count(raw), 0);
        assert!(!handle.is_disposed());
    }

    #[test]
    fn resize_goes_through_owner() {
        let (_api, graph) = setup();
        let node = graph.register(None).unwrap();
        let handle = node.allocate(2).unwrap();
        node.resize(&handle, 10).unwrap();
        assert_eq!(node.size_of(&handle).unwrap(), 10);
    }

    #[test]
    fn disposed_child_leaves_parent_list() {
        let (_api, graph) = setup();
        let root = graph.register(None).unwrap();
        let child = graph.register(Some(&root)).unwrap();
        assert_eq!(root.children().unwrap().len(), 1);

        child.dispose().unwrap();
        assert!(root.children().unwrap().is_empty());
        assert!(root.check_disposed().is_ok());
    }

    #[test]
    fn dropped_child_handle_stays_owned_by_parent() {
        let (api, graph) = setup();
        let root = graph.register(None).unwrap();
        let raw = {
            let child = graph.register(Some(&root)).unwrap();
            child.allocate(3).unwrap().raw_value().unwrap()
        };

        assert_eq!(graph.pending_reclaims(), 0);
        root.dispose().unwrap();
        assert_eq!(api.free_count(raw), 1);
    }
}
