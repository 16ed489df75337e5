//! Operator settings updates.

use keystone_common::constants::CLUSTER_ID_SETTINGS_KEY;
use keystone_common::{ClusterState, KeystoneError, Metadata, Settings};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::ClusterStateUpdateTask;

/// Outcome of a settings update: the committed state version
pub type SettingsReply = oneshot::Receiver<Result<u64, KeystoneError>>;

/// Merges operator-supplied settings into cluster metadata
pub struct UpdateSettingsTask {
    persistent: Settings,
    transient: Settings,
    reply: Mutex<Option<oneshot::Sender<Result<u64, KeystoneError>>>>,
}

impl UpdateSettingsTask {
    pub fn new(persistent: Settings, transient: Settings) -> (Self, SettingsReply) {
        let (tx, rx) = oneshot::channel();
        let task = Self {
            persistent,
            transient,
            reply: Mutex::new(Some(tx)),
        };
        (task, rx)
    }

    fn respond(&self, result: Result<u64, KeystoneError>) {
        if let Some(tx) = self.reply.lock().take() {
            let _ = tx.send(result);
        }
    }
}

impl ClusterStateUpdateTask for UpdateSettingsTask {
    fn execute(&self, current: &ClusterState) -> Result<ClusterState, KeystoneError> {
        if self.persistent.get(CLUSTER_ID_SETTINGS_KEY).is_some()
            || self.transient.get(CLUSTER_ID_SETTINGS_KEY).is_some()
        {
            return Err(KeystoneError::InvalidInput(format!(
                "[{CLUSTER_ID_SETTINGS_KEY}] is assigned by the cluster and cannot be updated"
            )));
        }

        let mut metadata = Metadata::clone(current.metadata());
        metadata.persistent_settings.merge(&self.persistent);
        metadata.transient_settings.merge(&self.transient);

        Ok(current.clone().with_metadata(metadata).with_derived_blocks())
    }

    fn on_failure(&self, source: &str, error: &KeystoneError) {
        tracing::warn!(source = source, error = %error, "Settings update rejected");
        self.respond(Err(error.clone()));
    }

    fn cluster_state_processed(&self, _source: &str, _old: &ClusterState, new: &ClusterState) {
        self.respond(Ok(new.version()));
    }
}
