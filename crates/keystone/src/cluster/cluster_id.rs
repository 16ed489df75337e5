//! Cluster identity assignment.
//!
//! Every node watches committed cluster state for the `cluster_id` transient
//! setting and caches it the first time it becomes visible. Only the elected
//! master, and only on the `state-recovered` notification that follows its
//! election, generates a fresh identifier when none is committed yet. The
//! identifier is proposed through the regular update-task pipeline and every
//! node (the proposer included) picks it up by adoption once committed.
//!
//! Two masters racing during a leadership handover may both propose; the
//! update task refuses to overwrite an already committed identifier, so the
//! store admits exactly one and the loser adopts the winner.

use keystone_common::constants::{CLUSTER_ID_SETTINGS_KEY, sources};
use keystone_common::{ClusterId, ClusterState, KeystoneError, Metadata, Priority};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};

use super::{ClusterChangedEvent, ClusterStateListener, ClusterStateSubmitter, ClusterStateUpdateTask};

/// Identifier generated by this node and not yet committed or rejected
type Proposal = Arc<Mutex<Option<ClusterId>>>;

/// Assigns and caches the cluster-wide identifier
pub struct ClusterIdService {
    /// Local node ID (log context only)
    node_id: String,
    /// Where identifier proposals are sent
    submitter: Arc<dyn ClusterStateSubmitter>,
    /// Adopted identifier, written at most once
    cluster_id: OnceLock<ClusterId>,
    /// In-flight proposal; also guards read-decide-generate-submit
    proposal: Proposal,
}

impl ClusterIdService {
    pub fn new(node_id: impl Into<String>, submitter: Arc<dyn ClusterStateSubmitter>) -> Self {
        Self {
            node_id: node_id.into(),
            submitter,
            cluster_id: OnceLock::new(),
            proposal: Arc::new(Mutex::new(None)),
        }
    }

    /// The adopted cluster identifier, if one has been committed and observed
    pub fn current_identifier(&self) -> Option<ClusterId> {
        self.cluster_id.get().cloned()
    }

    /// Returns true if the identifier is already cached
    fn apply_cluster_id_from_settings(&self, state: &ClusterState) -> bool {
        if let Some(cached) = self.cluster_id.get() {
            if let Some(visible) = state.cluster_id() {
                if &visible != cached {
                    tracing::warn!(
                        node = %self.node_id,
                        cached = %cached,
                        visible = %visible,
                        "Committed ClusterId differs from the adopted one, keeping adopted"
                    );
                }
            }
            return true;
        }

        let Some(cluster_id) = state.cluster_id() else {
            return false;
        };

        if self.cluster_id.set(cluster_id.clone()).is_ok() {
            tracing::debug!(
                node = %self.node_id,
                cluster_id = %cluster_id,
                "Read ClusterId from settings"
            );
        }

        if let Some(proposed) = self.proposal.lock().take() {
            if proposed != cluster_id {
                tracing::info!(
                    node = %self.node_id,
                    proposed = %proposed,
                    committed = %cluster_id,
                    "Proposed ClusterId lost to an already committed one"
                );
            }
        }

        true
    }

    fn generate_and_announce(&self) {
        let cluster_id = {
            let mut proposal = self.proposal.lock();

            // Re-check under the guard: another delivery thread may have won
            if self.cluster_id.get().is_some() {
                return;
            }
            if let Some(pending) = proposal.as_ref() {
                tracing::trace!(
                    node = %self.node_id,
                    cluster_id = %pending,
                    "ClusterId proposal already in flight"
                );
                return;
            }

            let cluster_id = ClusterId::generate();
            *proposal = Some(cluster_id.clone());
            cluster_id
        };

        tracing::debug!(
            node = %self.node_id,
            cluster_id = %cluster_id,
            "Generated ClusterId"
        );

        self.save_cluster_id_to_settings(cluster_id);
    }

    fn save_cluster_id_to_settings(&self, cluster_id: ClusterId) {
        tracing::trace!(node = %self.node_id, "Announcing new cluster_id to all nodes");

        let task = NewClusterIdTask {
            cluster_id,
            proposal: self.proposal.clone(),
        };
        self.submitter
            .submit_state_update_task(sources::NEW_CLUSTER_ID, Priority::Urgent, Box::new(task));
    }
}

impl ClusterStateListener for ClusterIdService {
    fn cluster_changed(&self, event: &ClusterChangedEvent) {
        tracing::trace!(
            node = %self.node_id,
            source = event.source(),
            version = event.state().version(),
            "Receiving new cluster state"
        );

        if self.apply_cluster_id_from_settings(event.state()) {
            return;
        }

        if event.source() == sources::STATE_RECOVERED && event.local_node_master() {
            self.generate_and_announce();
        }
    }
}

/// Merges a freshly generated identifier into the transient settings
struct NewClusterIdTask {
    cluster_id: ClusterId,
    proposal: Proposal,
}

impl ClusterStateUpdateTask for NewClusterIdTask {
    fn execute(&self, current: &ClusterState) -> Result<ClusterState, KeystoneError> {
        match current.cluster_id() {
            Some(committed) if committed == self.cluster_id => return Ok(current.clone()),
            Some(committed) => {
                return Err(KeystoneError::Superseded(format!(
                    "cluster_id already committed as [{committed}]"
                )));
            }
            None => {}
        }

        let mut transient_settings = current.metadata().transient_settings().clone();
        transient_settings.put(CLUSTER_ID_SETTINGS_KEY, self.cluster_id.value());

        let metadata = Metadata {
            persistent_settings: current.metadata().persistent_settings().clone(),
            transient_settings,
        };

        Ok(current.clone().with_metadata(metadata).with_derived_blocks())
    }

    fn on_failure(&self, source: &str, error: &KeystoneError) {
        tracing::error!(
            source = source,
            cluster_id = %self.cluster_id,
            error = %error,
            "failed to perform [{}]",
            source
        );

        let mut proposal = self.proposal.lock();
        if proposal.as_ref() == Some(&self.cluster_id) {
            *proposal = None;
        }
    }
}
