//! Explicit disposal: idempotence, cascading order and use-after-free.

mod common;

use std::sync::{Arc, Barrier};
use std::time::Duration;

use handlegrip::native::{NativeApi, NativeCall};
use handlegrip::{HandleError, NodeState, with_lock};

#[test]
fn sequential_double_dispose_frees_once() {
    let (api, graph) = common::recording_graph();
    let node = graph.register(None).unwrap();
    let handles: Vec<_> = (0..3).map(|_| node.allocate(8).unwrap()).collect();
    let raws: Vec<_> = handles.iter().map(|h| h.raw_value().unwrap()).collect();

    node.dispose().unwrap();
    node.dispose().unwrap();

    for raw in raws {
        assert_eq!(api.free_count(raw), 1);
    }
    assert_eq!(api.inner().live_blocks(), 0);
}

#[test]
fn concurrent_dispose_frees_once() {
    for _ in 0..50 {
        let (api, graph) = common::recording_graph();
        let root = graph.register(None).unwrap();
        let child = graph.register(Some(&root)).unwrap();
        let raws: Vec<_> = (0..4)
            .map(|i| {
                let owner = if i % 2 == 0 { &root } else { &child };
                owner.allocate(4).unwrap().raw_value().unwrap()
            })
            .collect();

        let barrier = Arc::new(Barrier::new(3));
        let workers: Vec<_> = [root.clone(), root.clone(), child.clone()]
            .into_iter()
            .map(|node| {
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    node.dispose()
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap().unwrap();
        }
        for raw in raws {
            assert_eq!(api.free_count(raw), 1);
        }
        assert_eq!(root.state(), NodeState::Disposed);
        assert_eq!(graph.live_nodes(), 0);
    }
}

#[test]
fn deep_chain_disposes_children_before_parents() {
    const DEPTH: usize = 50;
    let (api, graph) = common::recording_graph();

    let root = graph.register(None).unwrap();
    let mut chain = vec![root.clone()];
    for _ in 1..DEPTH {
        let parent = chain.last().unwrap().clone();
        chain.push(graph.register(Some(&parent)).unwrap());
    }
    let raws: Vec<_> = chain
        .iter()
        .map(|node| node.allocate(1).unwrap().raw_value().unwrap())
        .collect();
    api.clear_calls();

    root.dispose().unwrap();

    let frees: Vec<_> = api
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            NativeCall::Free(raw) => Some(raw),
            _ => None,
        })
        .collect();
    let deepest_first: Vec<_> = raws.iter().rev().copied().collect();
    assert_eq!(frees, deepest_first);
    assert!(chain.iter().all(|node| node.is_disposed()));
    assert_eq!(graph.stats().disposed, DEPTH);
}

#[test]
fn wide_tree_disposes_every_node_once() {
    let (api, graph) = common::recording_graph();
    let root = graph.register(None).unwrap();
    let mut frontier = vec![root.clone()];
    let mut raws = Vec::new();

    for _ in 0..3 {
        let mut next = Vec::new();
        for parent in &frontier {
            for _ in 0..3 {
                let child = graph.register(Some(parent)).unwrap();
                raws.push(child.allocate(2).unwrap().raw_value().unwrap());
                next.push(child);
            }
        }
        frontier = next;
    }

    root.dispose().unwrap();
    assert_eq!(api.total_frees(), raws.len());
    for raw in raws {
        assert_eq!(api.free_count(raw), 1);
    }
    assert_eq!(graph.stats().disposed, 1 + 3 + 9 + 27);
}

#[test]
fn access_after_dispose_is_rejected() {
    let (api, graph) = common::recording_graph();
    let node = graph.register(None).unwrap();
    let handle = node.allocate(16).unwrap();
    node.dispose().unwrap();
    api.clear_calls();

    assert!(matches!(
        node.with_lock(&handle, None, |_| ()),
        Err(HandleError::ObjectDisposed { .. })
    ));
    assert!(matches!(
        with_lock(&*api, &handle, None, |_| ()),
        Err(HandleError::InvalidHandle { .. })
    ));
    assert!(handle.raw_value().is_err());
    assert_eq!(api.lock_calls(), 0);
}

#[test]
fn partial_disposal_reports_every_failure() {
    let (api, graph) = common::recording_graph();
    let root = graph.register(None).unwrap();
    let a = graph.register(Some(&root)).unwrap();
    let b = graph.register(Some(&root)).unwrap();

    let bad_a = a.allocate(1).unwrap().raw_value().unwrap();
    let bad_b = b.allocate(1).unwrap().raw_value().unwrap();
    let good = root.allocate(1).unwrap().raw_value().unwrap();
    api.fail_free_for(bad_a);
    api.fail_free_for(bad_b);

    let err = root.dispose().unwrap_err();
    let HandleError::PartialDisposal { errors } = &err else {
        panic!("expected partial disposal, got {err:?}");
    };
    assert_eq!(errors.len(), 2);
    assert!(matches!(err.first(), HandleError::InvalidHandle { .. }));
    assert_eq!(api.free_count(good), 1);
    assert_eq!(root.state(), NodeState::Disposed);
    assert_eq!(graph.stats().failed_frees, 2);

    // Already attempted; a second dispose does not retry.
    root.dispose().unwrap();
    assert_eq!(api.free_count(bad_a), 1);
}

#[test]
fn registration_under_disposed_parent_fails() {
    let (_api, graph) = common::recording_graph();
    let parent = graph.register(None).unwrap();
    parent.dispose().unwrap();

    assert_eq!(
        graph.register(Some(&parent)).unwrap_err(),
        HandleError::ObjectDisposed { node: parent.id() }
    );
}

#[test]
fn adopted_handle_is_freed_with_its_owner() {
    let (api, graph) = common::recording_graph();
    let parent = graph.register(None).unwrap();
    let handle = api.allocate(32).unwrap();
    let raw = handle.raw_value().unwrap();

    let proxy = graph.adopt(handle, Some(&parent)).unwrap();
    assert_eq!(proxy.parent().unwrap().unwrap().id(), parent.id());

    parent.close().unwrap();
    assert_eq!(api.free_count(raw), 1);
    assert!(proxy.is_disposed());
}

#[test]
fn dispose_while_another_thread_holds_a_lock_frees_after_unlock() {
    for _ in 0..10 {
        let (api, graph) = common::recording_graph();
        let node = graph.register(None).unwrap();
        let handle = node.allocate(16).unwrap();
        let raw = handle.raw_value().unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let holder = {
            let node = node.clone();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                node.with_lock(&handle, None, |view| {
                    barrier.wait();
                    std::thread::sleep(Duration::from_millis(20));
                    view.fill(7);
                })
            })
        };

        barrier.wait();
        node.dispose().unwrap();
        assert!(node.is_disposed());

        holder.join().unwrap().unwrap();
        assert_eq!(api.free_count(raw), 1);
        assert_eq!(api.lock_calls(), api.unlock_calls());
        assert_eq!(api.inner().live_blocks(), 0);
        assert!(graph.failed_reclamations().is_empty());
        assert_eq!(graph.stats().failed_frees, 0);
    }
}

#[test]
fn cascading_dispose_waits_for_a_locked_descendant() {
    let (api, graph) = common::recording_graph();
    let root = graph.register(None).unwrap();
    let locked = graph.register(Some(&root)).unwrap();
    let idle = graph.register(Some(&root)).unwrap();
    let busy = locked.allocate(8).unwrap();
    let busy_raw = busy.raw_value().unwrap();
    let idle_raw = idle.allocate(8).unwrap().raw_value().unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let holder = {
        let locked = locked.clone();
        let barrier = Arc::clone(&barrier);
        std::thread::spawn(move || {
            locked.with_lock(&busy, None, |_| {
                barrier.wait();
                std::thread::sleep(Duration::from_millis(20));
            })
        })
    };

    barrier.wait();
    root.dispose().unwrap();
    assert_eq!(api.free_count(idle_raw), 1);
    assert!(locked.is_disposed());

    holder.join().unwrap().unwrap();
    assert_eq!(api.free_count(busy_raw), 1);
    assert_eq!(api.inner().live_blocks(), 0);
    assert_eq!(graph.stats().handles_freed, 2);
}

#[test]
fn directly_locked_handle_is_freed_on_retry() {
    let (api, graph) = common::recording_graph();
    let node = graph.register(None).unwrap();
    let handle = node.allocate(4).unwrap();
    let raw = handle.raw_value().unwrap();

    let held = with_lock(&*api, &handle, None, |_| {
        let err = node.dispose().unwrap_err();
        assert!(matches!(err, HandleError::PartialDisposal { .. }));
        graph.retry_failed_frees()
    })
    .unwrap();
    assert_eq!(held.failures, 1);
    assert_eq!(graph.failed_reclamations().len(), 1);
    assert_eq!(api.inner().live_blocks(), 1);

    let report = graph.retry_failed_frees();
    assert_eq!(report.handles_freed, 1);
    assert!(graph.failed_reclamations().is_empty());
    assert_eq!(api.inner().live_blocks(), 0);
}
