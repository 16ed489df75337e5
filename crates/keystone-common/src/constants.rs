//! Shared constants for Keystone components.

/// Default Redis connection URL
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Default Keystone HTTP listen address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8900";

/// Default UDP address for receiving replicated cluster state
pub const DEFAULT_REPLICATION_ADDR: &str = "127.0.0.1:8901";

/// Seconds between re-sends of the latest state to followers
pub const REPUBLISH_INTERVAL_SECS: u64 = 5;

/// Seconds between gateway recovery attempts after a failed load
pub const RECOVERY_RETRY_SECS: u64 = 5;

/// Transient settings key holding the committed cluster identifier
pub const CLUSTER_ID_SETTINGS_KEY: &str = "cluster_id";

/// Setting that places the whole cluster in read-only mode
pub const SETTING_READ_ONLY: &str = "cluster.blocks.read_only";

/// Capacity of the committed-state fan-out channel
pub const STATE_BROADCAST_CAPACITY: usize = 64;

/// Update task sources (also used as event reason tags)
pub mod sources {
    /// Cluster state recovered from the gateway after this node became master
    pub const STATE_RECOVERED: &str = "state-recovered";

    /// Leader announcing a freshly generated cluster identifier
    pub const NEW_CLUSTER_ID: &str = "new_cluster_id";

    /// Operator-driven settings update
    pub const UPDATE_SETTINGS: &str = "cluster_update_settings";

    /// Master election changed
    pub const ELECTED_MASTER: &str = "elected-master";
}

/// Redis key names
pub mod redis_keys {
    /// Persisted cluster metadata document
    pub const METADATA: &str = "keystone:metadata";
}

/// HTTP header names
pub mod headers {
    /// Committed cluster identifier, once known
    pub const X_CLUSTER_ID: &str = "x-cluster-id";

    /// Node ID of the responding node
    pub const X_NODE_ID: &str = "x-node-id";
}
