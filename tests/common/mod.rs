//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use handlegrip::native::RecordingNativeApi;
use handlegrip::owner_graph::OwnerGraph;
use tracing_subscriber::EnvFilter;

/// Route library logs to the test harness; `RUST_LOG` controls the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A graph over a fresh recording heap.
pub fn recording_graph() -> (Arc<RecordingNativeApi>, OwnerGraph) {
    init_tracing();
    let api = Arc::new(RecordingNativeApi::default());
    let graph = OwnerGraph::new(api.clone());
    (api, graph)
}
