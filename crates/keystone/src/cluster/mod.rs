//! Cluster coordination modules.
//!
//! Implements:
//! - Cluster state service (update-task queue, listeners, replication fan-out)
//! - One-time cluster identity assignment
//! - Operator settings updates
//! - State replication to followers over UDP

mod cluster_id;
mod event;
mod replication;
mod service;
mod settings;
mod task;

pub use cluster_id::ClusterIdService;
pub use event::ClusterChangedEvent;
pub use replication::{ReplicationConfig, ReplicationService};
pub use service::{ClusterHandle, ClusterService};
pub use settings::UpdateSettingsTask;
pub use task::{ClusterStateListener, ClusterStateSubmitter, ClusterStateUpdateTask};
