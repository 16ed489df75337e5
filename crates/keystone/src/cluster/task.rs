//! Seams between the cluster state service and its collaborators.

use keystone_common::{ClusterState, KeystoneError, Priority};

use super::ClusterChangedEvent;

/// A state transform submitted for serialized execution on the master.
pub trait ClusterStateUpdateTask: Send + 'static {
    /// Compute the next state from `current`.
    ///
    /// Must be pure and deterministic: the service may run it against any
    /// snapshot and only commits the result if it differs from `current`.
    fn execute(&self, current: &ClusterState) -> Result<ClusterState, KeystoneError>;

    /// Called when the task was rejected or `execute` returned an error
    fn on_failure(&self, source: &str, error: &KeystoneError);

    /// Called once the result of `execute` has been applied (or was a no-op)
    fn cluster_state_processed(&self, _source: &str, _old: &ClusterState, _new: &ClusterState) {}
}

/// Observer of committed cluster state changes
pub trait ClusterStateListener: Send + Sync {
    fn cluster_changed(&self, event: &ClusterChangedEvent);
}

/// Entry point for proposing state mutations.
///
/// Submission never blocks and never returns an error directly; failures are
/// reported through [`ClusterStateUpdateTask::on_failure`].
pub trait ClusterStateSubmitter: Send + Sync {
    fn submit_state_update_task(
        &self,
        source: &str,
        priority: Priority,
        task: Box<dyn ClusterStateUpdateTask>,
    );
}
