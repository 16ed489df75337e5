//! Cluster state service.
//!
//! Owns this node's view of replicated cluster state and applies every change
//! from a single task:
//! - update tasks, executed one at a time in priority order (master only)
//! - states published by the master (followers)
//! - master election changes, with gateway recovery when this node wins
//!
//! Listeners are notified synchronously from the same task, in registration
//! order, after each applied change. Committed states on the master are
//! fanned out over a broadcast channel for replication to followers.

use anyhow::Result;
use keystone_common::constants::{RECOVERY_RETRY_SECS, STATE_BROADCAST_CAPACITY, sources};
use keystone_common::{ClusterState, KeystoneError, Metadata, Priority};
use parking_lot::RwLock;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;

use super::{ClusterChangedEvent, ClusterStateListener, ClusterStateSubmitter, ClusterStateUpdateTask};
use crate::gateway::Gateway;

enum Command {
    Submit(PendingTask),
    Publish(ClusterState),
    ElectMaster(Option<String>),
}

struct PendingTask {
    source: String,
    priority: Priority,
    /// Submission order, FIFO within a priority
    seq: u64,
    task: Box<dyn ClusterStateUpdateTask>,
}

impl PendingTask {
    fn rank(&self) -> (Priority, Reverse<u64>) {
        (self.priority, Reverse(self.seq))
    }
}

impl PartialEq for PendingTask {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank()
    }
}

impl Eq for PendingTask {}

impl PartialOrd for PendingTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// Cheap, cloneable access to a running [`ClusterService`]
#[derive(Clone)]
pub struct ClusterHandle {
    node_id: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<RwLock<Arc<ClusterState>>>,
    published: broadcast::Sender<Arc<ClusterState>>,
    seq: Arc<AtomicU64>,
}

impl ClusterHandle {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Currently applied state snapshot
    pub fn state(&self) -> Arc<ClusterState> {
        self.state.read().clone()
    }

    /// Report the outcome of master election to this node
    pub fn elect_master(&self, master_node_id: Option<String>) -> Result<(), KeystoneError> {
        self.commands
            .send(Command::ElectMaster(master_node_id))
            .map_err(|_| KeystoneError::QueueClosed)
    }

    /// Apply a state published by the master
    pub fn apply_published(&self, state: ClusterState) -> Result<(), KeystoneError> {
        self.commands
            .send(Command::Publish(state))
            .map_err(|_| KeystoneError::QueueClosed)
    }

    /// Committed states published while this node is master
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ClusterState>> {
        self.published.subscribe()
    }
}

impl ClusterStateSubmitter for ClusterHandle {
    fn submit_state_update_task(
        &self,
        source: &str,
        priority: Priority,
        task: Box<dyn ClusterStateUpdateTask>,
    ) {
        let pending = PendingTask {
            source: source.to_string(),
            priority,
            seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
            task,
        };

        if let Err(mpsc::error::SendError(Command::Submit(pending))) =
            self.commands.send(Command::Submit(pending))
        {
            pending.task.on_failure(&pending.source, &KeystoneError::QueueClosed);
        }
    }
}

/// Single-writer owner of the local cluster state
pub struct ClusterService {
    node_id: String,
    state: Arc<RwLock<Arc<ClusterState>>>,
    commands: mpsc::UnboundedReceiver<Command>,
    listeners: Vec<Arc<dyn ClusterStateListener>>,
    gateway: Gateway,
    published: broadcast::Sender<Arc<ClusterState>>,
    queue: BinaryHeap<PendingTask>,
    /// Master and version of the last applied publication
    last_applied: Option<(String, u64)>,
    /// Elected master whose gateway recovery has not succeeded yet
    recovery_pending: bool,
    recovery_retry: Duration,
}

impl ClusterService {
    pub fn new(node_id: impl Into<String>, gateway: Gateway) -> (Self, ClusterHandle) {
        let node_id = node_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let (published, _) = broadcast::channel(STATE_BROADCAST_CAPACITY);
        let state = Arc::new(RwLock::new(Arc::new(ClusterState::empty(node_id.clone()))));

        let handle = ClusterHandle {
            node_id: Arc::from(node_id.as_str()),
            commands: tx,
            state: state.clone(),
            published: published.clone(),
            seq: Arc::new(AtomicU64::new(0)),
        };

        let service = Self {
            node_id,
            state,
            commands: rx,
            listeners: Vec::new(),
            gateway,
            published,
            queue: BinaryHeap::new(),
            last_applied: None,
            recovery_pending: false,
            recovery_retry: Duration::from_secs(RECOVERY_RETRY_SECS),
        };

        (service, handle)
    }

    /// Interval between gateway recovery attempts after a failed load
    pub fn with_recovery_retry(mut self, interval: Duration) -> Self {
        // tokio intervals reject a zero period
        self.recovery_retry = interval.max(Duration::from_millis(1));
        self
    }

    /// Register a listener; must happen before `run`
    pub fn add_listener(&mut self, listener: Arc<dyn ClusterStateListener>) {
        self.listeners.push(listener);
    }

    /// Process commands until shutdown
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        tracing::info!(
            node = %self.node_id,
            gateway = self.gateway.kind(),
            listeners = self.listeners.len(),
            "Cluster state service started"
        );

        let mut retry = tokio::time::interval(self.recovery_retry);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    let was_pending = self.recovery_pending;
                    self.accept(command).await;
                    if was_pending && self.recovery_pending {
                        self.retry_recovery().await;
                    } else if self.recovery_pending {
                        retry.reset();
                    }
                    self.drain().await;
                }
                _ = retry.tick(), if self.recovery_pending => {
                    self.retry_recovery().await;
                    self.drain().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!(node = %self.node_id, "Cluster state service shutting down");
                    break;
                }
            }
        }

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Submit(pending) = command {
                self.queue.push(pending);
            }
        }
        while let Some(pending) = self.queue.pop() {
            pending.task.on_failure(&pending.source, &KeystoneError::QueueClosed);
        }

        Ok(())
    }

    fn current(&self) -> Arc<ClusterState> {
        self.state.read().clone()
    }

    async fn accept(&mut self, command: Command) {
        match command {
            Command::Submit(pending) => self.queue.push(pending),
            Command::Publish(state) => self.apply_published(state).await,
            Command::ElectMaster(master) => self.elect_master(master).await,
        }
    }

    /// Run queued tasks, picking up new commands between tasks
    async fn drain(&mut self) {
        loop {
            while let Ok(command) = self.commands.try_recv() {
                self.accept(command).await;
            }
            let Some(pending) = self.queue.pop() else {
                break;
            };
            self.run_task(pending).await;
        }
    }

    async fn run_task(&mut self, pending: PendingTask) {
        let current = self.current();

        if !current.is_local_node_master() {
            pending.task.on_failure(
                &pending.source,
                &KeystoneError::NotMaster {
                    node_id: self.node_id.clone(),
                },
            );
            return;
        }

        let next = match pending.task.execute(&current) {
            Ok(next) => next,
            Err(e) => {
                tracing::debug!(source = %pending.source, error = %e, "Update task failed");
                pending.task.on_failure(&pending.source, &e);
                return;
            }
        };

        if next.same_content(&current) {
            tracing::trace!(source = %pending.source, "Update task left cluster state unchanged");
            pending
                .task
                .cluster_state_processed(&pending.source, &current, &current);
            return;
        }

        let next = next
            .for_local_node(self.node_id.clone())
            .with_version(current.version() + 1);
        let applied = self.commit(&pending.source, next).await;
        pending
            .task
            .cluster_state_processed(&pending.source, &current, &applied);
    }

    async fn elect_master(&mut self, master: Option<String>) {
        let current = self.current();
        if current.master_node_id() == master.as_deref() {
            return;
        }

        let elected_self = master.as_deref() == Some(self.node_id.as_str());
        let changed = ClusterState::clone(&current).with_master(master.clone());

        if !elected_self {
            tracing::info!(node = %self.node_id, master = ?master, "Master changed");
            self.recovery_pending = false;
            self.commit(sources::ELECTED_MASTER, changed).await;
            return;
        }

        tracing::info!(node = %self.node_id, "Elected as master, recovering cluster state");

        match self.gateway.load().await {
            Ok(recovered) => self.commit_recovered(changed, recovered).await,
            Err(e) => {
                tracing::error!(
                    node = %self.node_id,
                    error = %e,
                    retry_in = ?self.recovery_retry,
                    "Failed to recover cluster metadata from gateway"
                );
                self.recovery_pending = true;
                self.commit(sources::ELECTED_MASTER, changed).await;
            }
        }
    }

    /// Re-attempt gateway recovery for an election that could not load it
    async fn retry_recovery(&mut self) {
        let current = self.current();
        if !current.is_local_node_master() {
            self.recovery_pending = false;
            return;
        }

        match self.gateway.load().await {
            Ok(recovered) => {
                tracing::info!(node = %self.node_id, "Recovered cluster state from gateway");
                self.recovery_pending = false;
                self.commit_recovered(ClusterState::clone(&current), recovered)
                    .await;
            }
            Err(e) => {
                tracing::warn!(node = %self.node_id, error = %e, "Gateway recovery still failing");
            }
        }
    }

    async fn commit_recovered(&mut self, base: ClusterState, recovered: Metadata) {
        let current = self.current();

        // State already replicated to this node is newer than the gateway copy
        let metadata = if current.metadata().is_empty() {
            recovered
        } else {
            current.metadata().clone()
        };

        let next = base
            .with_metadata(metadata)
            .with_derived_blocks()
            .with_version(current.version() + 1);
        self.commit(sources::STATE_RECOVERED, next).await;
    }

    async fn apply_published(&mut self, state: ClusterState) {
        let Some(master) = state.master_node_id().map(str::to_string) else {
            tracing::warn!(node = %self.node_id, "Ignoring published state without a master");
            return;
        };
        if master == self.node_id {
            return;
        }

        let version = state.version();
        if let Some((last_master, last_version)) = &self.last_applied {
            if *last_master == master && version <= *last_version {
                tracing::trace!(master = %master, version, "Ignoring stale published state");
                return;
            }
        }

        let source = format!("receive(from master [{master}])");
        self.last_applied = Some((master, version));
        self.commit(&source, state.for_local_node(self.node_id.clone()))
            .await;
    }

    async fn commit(&mut self, source: &str, next: ClusterState) -> Arc<ClusterState> {
        let next = Arc::new(next);
        let previous = std::mem::replace(&mut *self.state.write(), next.clone());

        let event = ClusterChangedEvent::new(source, next.clone(), previous);

        tracing::debug!(
            node = %self.node_id,
            source = source,
            version = next.version(),
            master_changed = event.master_changed(),
            "Applied cluster state"
        );

        if event.metadata_changed() {
            if let Err(e) = self.gateway.persist(next.metadata()).await {
                tracing::warn!(node = %self.node_id, error = %e, "Failed to persist cluster metadata");
            }
        }

        for listener in &self.listeners {
            listener.cluster_changed(&event);
        }

        if next.is_local_node_master() {
            // No subscribers is fine for a single-node cluster
            let _ = self.published.send(next.clone());
        }

        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterIdService, UpdateSettingsTask};
    use crate::gateway::MemoryGateway;
    use keystone_common::constants::{CLUSTER_ID_SETTINGS_KEY, SETTING_READ_ONLY};
    use keystone_common::{ClusterBlock, ClusterId, Metadata, Settings};
    use parking_lot::Mutex;
    use std::time::Duration;

    struct Node {
        handle: ClusterHandle,
        cluster_id: Arc<ClusterIdService>,
        gateway: MemoryGateway,
        shutdown: broadcast::Sender<()>,
    }

    fn spawn_node(node_id: &str, gateway: MemoryGateway) -> Node {
        spawn_node_with_retry(node_id, gateway, Duration::from_secs(60))
    }

    fn spawn_node_with_retry(node_id: &str, gateway: MemoryGateway, retry: Duration) -> Node {
        let (service, handle) = ClusterService::new(node_id, Gateway::Memory(gateway.clone()));
        let mut service = service.with_recovery_retry(retry);
        let cluster_id = Arc::new(ClusterIdService::new(node_id, Arc::new(handle.clone())));
        service.add_listener(cluster_id.clone());

        let (shutdown, _) = broadcast::channel(1);
        tokio::spawn(service.run(shutdown.subscribe()));

        Node {
            handle,
            cluster_id,
            gateway,
            shutdown,
        }
    }

    /// Forward every state the leader publishes to the follower
    fn replicate(leader: &ClusterHandle, follower: &ClusterHandle) {
        let mut rx = leader.subscribe();
        let follower = follower.clone();
        tokio::spawn(async move {
            while let Ok(state) = rx.recv().await {
                if follower.apply_published(ClusterState::clone(&state)).is_err() {
                    break;
                }
            }
        });
    }

    async fn wait_for(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_single_node_assigns_cluster_id() {
        let node = spawn_node("node-1", MemoryGateway::default());
        assert_eq!(node.cluster_id.current_identifier(), None);

        node.handle.elect_master(Some("node-1".into())).unwrap();
        wait_for(|| node.cluster_id.current_identifier().is_some()).await;

        let assigned = node.cluster_id.current_identifier().unwrap();
        let state = node.handle.state();
        assert_eq!(state.cluster_id(), Some(assigned.clone()));
        assert!(state.is_local_node_master());

        wait_for(|| node.gateway.stored().is_some_and(|m| !m.is_empty())).await;
        let stored = node.gateway.stored().unwrap();
        assert_eq!(
            stored.transient_settings().get(CLUSTER_ID_SETTINGS_KEY),
            Some(assigned.value())
        );

        let _ = node.shutdown.send(());
    }

    #[tokio::test]
    async fn test_restart_keeps_persisted_cluster_id() {
        let mut metadata = Metadata::default();
        metadata
            .transient_settings
            .put(CLUSTER_ID_SETTINGS_KEY, "previous-run");
        let node = spawn_node("node-1", MemoryGateway::with_metadata(metadata));

        node.handle.elect_master(Some("node-1".into())).unwrap();
        wait_for(|| node.cluster_id.current_identifier().is_some()).await;

        assert_eq!(
            node.cluster_id.current_identifier(),
            Some(ClusterId::new("previous-run"))
        );
        // Recovery commit only; no identifier task ran on top of it
        assert_eq!(node.handle.state().version(), 1);

        let _ = node.shutdown.send(());
    }

    #[tokio::test]
    async fn test_failed_recovery_is_retried_on_next_command() {
        let gateway = MemoryGateway::default();
        gateway.fail_next_loads(1);
        let node = spawn_node("node-1", gateway);

        node.handle.elect_master(Some("node-1".into())).unwrap();
        wait_for(|| node.handle.state().is_local_node_master()).await;
        assert_eq!(node.cluster_id.current_identifier(), None);

        // Same master again: no election change, but recovery runs
        node.handle.elect_master(Some("node-1".into())).unwrap();
        wait_for(|| node.cluster_id.current_identifier().is_some()).await;

        assert_eq!(
            node.handle.state().cluster_id(),
            node.cluster_id.current_identifier()
        );

        let _ = node.shutdown.send(());
    }

    #[tokio::test]
    async fn test_failed_recovery_is_retried_on_interval() {
        let mut metadata = Metadata::default();
        metadata
            .transient_settings
            .put(CLUSTER_ID_SETTINGS_KEY, "persisted");
        let gateway = MemoryGateway::with_metadata(metadata);
        gateway.fail_next_loads(3);
        let node = spawn_node_with_retry("node-1", gateway, Duration::from_millis(20));

        node.handle.elect_master(Some("node-1".into())).unwrap();
        wait_for(|| node.cluster_id.current_identifier().is_some()).await;

        // The persisted value is recovered, not replaced by a fresh one
        assert_eq!(
            node.cluster_id.current_identifier(),
            Some(ClusterId::new("persisted"))
        );

        let _ = node.shutdown.send(());
    }

    #[tokio::test]
    async fn test_losing_mastership_cancels_pending_recovery() {
        let gateway = MemoryGateway::default();
        gateway.fail_next_loads(1);
        let node = spawn_node_with_retry("node-1", gateway, Duration::from_millis(50));

        node.handle.elect_master(Some("node-1".into())).unwrap();
        node.handle.elect_master(Some("other".into())).unwrap();
        wait_for(|| node.handle.state().master_node_id() == Some("other")).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(node.cluster_id.current_identifier(), None);
        assert!(node.handle.state().metadata().is_empty());

        let _ = node.shutdown.send(());
    }

    #[tokio::test]
    async fn test_follower_adopts_leader_cluster_id() {
        let leader = spawn_node("leader", MemoryGateway::default());
        let follower = spawn_node("follower", MemoryGateway::default());
        replicate(&leader.handle, &follower.handle);

        follower.handle.elect_master(Some("leader".into())).unwrap();
        leader.handle.elect_master(Some("leader".into())).unwrap();

        wait_for(|| follower.cluster_id.current_identifier().is_some()).await;
        wait_for(|| leader.cluster_id.current_identifier().is_some()).await;

        assert_eq!(
            follower.cluster_id.current_identifier(),
            leader.cluster_id.current_identifier()
        );
        assert!(!follower.handle.state().is_local_node_master());
        assert_eq!(follower.handle.state().version(), leader.handle.state().version());

        let _ = leader.shutdown.send(());
        let _ = follower.shutdown.send(());
    }

    #[tokio::test]
    async fn test_task_on_follower_is_rejected() {
        let node = spawn_node("node-1", MemoryGateway::default());
        node.handle.elect_master(Some("other".into())).unwrap();

        let (task, rx) = UpdateSettingsTask::new(Settings::new().with("a", "b"), Settings::new());
        node.handle
            .submit_state_update_task("test", Priority::High, Box::new(task));

        let result = rx.await.unwrap();
        assert!(matches!(result, Err(KeystoneError::NotMaster { .. })));
        assert_eq!(node.cluster_id.current_identifier(), None);

        let _ = node.shutdown.send(());
    }

    #[tokio::test]
    async fn test_settings_update_recomputes_read_only_block() {
        let node = spawn_node("node-1", MemoryGateway::default());
        node.handle.elect_master(Some("node-1".into())).unwrap();
        wait_for(|| node.cluster_id.current_identifier().is_some()).await;

        let (task, rx) =
            UpdateSettingsTask::new(Settings::new(), Settings::new().with(SETTING_READ_ONLY, "true"));
        node.handle
            .submit_state_update_task("test", Priority::High, Box::new(task));
        let version = rx.await.unwrap().unwrap();

        let state = node.handle.state();
        assert_eq!(state.version(), version);
        assert!(state.blocks().has_global_block(ClusterBlock::ReadOnly));
        assert!(state.cluster_id().is_some());

        let _ = node.shutdown.send(());
    }

    struct RecordingTask {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl ClusterStateUpdateTask for RecordingTask {
        fn execute(&self, current: &ClusterState) -> Result<ClusterState, KeystoneError> {
            Ok(current.clone())
        }

        fn on_failure(&self, _source: &str, error: &KeystoneError) {
            panic!("unexpected failure: {error}");
        }

        fn cluster_state_processed(&self, _source: &str, _old: &ClusterState, _new: &ClusterState) {
            self.log.lock().push(self.label);
        }
    }

    #[tokio::test]
    async fn test_tasks_run_in_priority_order() {
        let (service, handle) = ClusterService::new("node-1", Gateway::Memory(MemoryGateway::default()));
        let log = Arc::new(Mutex::new(Vec::new()));

        handle.elect_master(Some("node-1".into())).unwrap();
        for (label, priority) in [
            ("low", Priority::Low),
            ("normal-1", Priority::Normal),
            ("urgent", Priority::Urgent),
            ("normal-2", Priority::Normal),
            ("high", Priority::High),
        ] {
            let task = RecordingTask {
                label,
                log: log.clone(),
            };
            handle.submit_state_update_task(label, priority, Box::new(task));
        }

        let (shutdown, _) = broadcast::channel(1);
        tokio::spawn(service.run(shutdown.subscribe()));

        wait_for(|| log.lock().len() == 5).await;
        assert_eq!(
            *log.lock(),
            vec!["urgent", "high", "normal-1", "normal-2", "low"]
        );
        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_reports_queue_closed() {
        let (service, handle) = ClusterService::new("node-1", Gateway::Memory(MemoryGateway::default()));
        drop(service);

        let (task, rx) = UpdateSettingsTask::new(Settings::new(), Settings::new());
        handle.submit_state_update_task("test", Priority::Normal, Box::new(task));

        assert_eq!(rx.await.unwrap(), Err(KeystoneError::QueueClosed));
        assert!(handle.elect_master(None).is_err());
    }
}
