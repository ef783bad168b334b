//! Deferred reclamation of unreachable proxies.
//!
//! When the last strong reference to a live node goes away (no user proxy,
//! no parent holding it), its drop hands the node's handles to this queue
//! instead of freeing them inline. A sweep, run explicitly, by the background
//! reclaimer or when the graph itself goes away, frees them.

use std::sync::atomic::{AtomicUsize, Ordering};

use flume::{Receiver, Sender};
use parking_lot::Mutex;

use super::NodeId;
use crate::error::HandleError;
use crate::handle::{HandleValue, NativeHandle};
use crate::native::NativeApi;

/// Handles of one unreachable node awaiting their native free.
pub(crate) struct PendingReclaim {
    pub(crate) node: NodeId,
    pub(crate) handles: Vec<NativeHandle>,
}

/// A native free that failed during disposal or a sweep.
///
/// The node stays out of the reclaimed count so a leak is never reported as
/// a success. The handle value is kept so the free can be retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedReclaim {
    pub node: NodeId,
    pub handle: HandleValue,
    pub error: HandleError,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Nodes whose every handle was freed
    pub nodes_reclaimed: usize,
    /// Native frees that succeeded
    pub handles_freed: usize,
    /// Native frees that failed and were quarantined
    pub failures: usize,
}

impl ReclaimReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub(crate) struct ReclaimQueue {
    sender: Sender<PendingReclaim>,
    receiver: Receiver<PendingReclaim>,
    notify_sender: Sender<()>,
    notify_receiver: Receiver<()>,
    quarantine: Mutex<Vec<FailedReclaim>>,
    sweep_lock: Mutex<()>,
    pending: AtomicUsize,
}

impl ReclaimQueue {
    pub(crate) fn new() -> Self {
        let (sender, receiver) = flume::unbounded();
        let (notify_sender, notify_receiver) = flume::bounded(1);

        Self {
            sender,
            receiver,
            notify_sender,
            notify_receiver,
            quarantine: Mutex::new(Vec::new()),
            sweep_lock: Mutex::new(()),
            pending: AtomicUsize::new(0),
        }
    }

    pub(crate) fn enqueue(&self, record: PendingReclaim) {
        tracing::trace!(
            node = %record.node,
            handles = record.handles.len(),
            "queued unreachable node for reclamation"
        );
        self.pending.fetch_add(1, Ordering::AcqRel);
        // The receiver lives in the same struct, so the channel is never
        // disconnected while `self` exists.
        let _ = self.sender.send(record);
        self.notify();
    }

    pub(crate) fn notify(&self) {
        let _ = self.notify_sender.try_send(());
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn notifications(&self) -> Receiver<()> {
        self.notify_receiver.clone()
    }

    pub(crate) fn quarantine(&self) -> Vec<FailedReclaim> {
        self.quarantine.lock().clone()
    }

    pub(crate) fn quarantine_failure(&self, failure: FailedReclaim) {
        self.quarantine.lock().push(failure);
    }

    /// Try every quarantined free once more; those failing again stay.
    pub(crate) fn retry_quarantined(&self, api: &dyn NativeApi) -> ReclaimReport {
        let _sweeping = self.sweep_lock.lock();
        let failed = std::mem::take(&mut *self.quarantine.lock());
        let mut report = ReclaimReport::default();
        let mut still_failing = Vec::new();

        for mut failure in failed {
            match api.free(failure.handle) {
                Ok(()) => report.handles_freed += 1,
                Err(error) => {
                    report.failures += 1;
                    failure.error = error;
                    still_failing.push(failure);
                }
            }
        }

        self.quarantine.lock().extend(still_failing);
        report
    }

    /// Free everything queued so far, in queue order.
    ///
    /// Sweeps are serialized: when this returns, every record enqueued
    /// before the call has been processed by this or a concurrent sweep.
    pub(crate) fn sweep(&self, api: &dyn NativeApi) -> ReclaimReport {
        let _sweeping = self.sweep_lock.lock();
        let mut report = ReclaimReport::default();

        for record in self.receiver.try_iter() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            let mut node_failed = false;

            for handle in record.handles.iter().rev() {
                let Some(raw) = handle.retire() else {
                    continue;
                };
                match api.free(raw) {
                    Ok(()) => report.handles_freed += 1,
                    Err(error) => {
                        tracing::warn!(
                            node = %record.node,
                            handle = %raw,
                            error = %error,
                            "reclamation could not free native handle"
                        );
                        node_failed = true;
                        report.failures += 1;
                        self.quarantine_failure(FailedReclaim {
                            node: record.node,
                            handle: raw,
                            error,
                        });
                    }
                }
            }

            if !node_failed {
                report.nodes_reclaimed += 1;
            }
        }

        report
    }
}
