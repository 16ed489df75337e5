//! Cluster state change notifications.

use keystone_common::ClusterState;
use std::sync::Arc;

/// Delivered to every listener after a state is applied
#[derive(Debug, Clone)]
pub struct ClusterChangedEvent {
    /// Reason tag (task source or replication origin)
    source: String,
    /// Newly applied state
    state: Arc<ClusterState>,
    /// State replaced by this change
    previous_state: Arc<ClusterState>,
}

impl ClusterChangedEvent {
    pub fn new(
        source: impl Into<String>,
        state: Arc<ClusterState>,
        previous_state: Arc<ClusterState>,
    ) -> Self {
        Self {
            source: source.into(),
            state,
            previous_state,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn state(&self) -> &Arc<ClusterState> {
        &self.state
    }

    /// Whether the local node holds the master role in the new state
    pub fn local_node_master(&self) -> bool {
        self.state.is_local_node_master()
    }

    pub fn metadata_changed(&self) -> bool {
        self.state.metadata() != self.previous_state.metadata()
    }

    pub fn master_changed(&self) -> bool {
        self.state.master_node_id() != self.previous_state.master_node_id()
    }
}
