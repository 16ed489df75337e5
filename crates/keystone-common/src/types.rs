//! Core types shared across Keystone components.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::constants::{CLUSTER_ID_SETTINGS_KEY, SETTING_READ_ONLY};

/// Cluster-wide identifier, assigned once per cluster lifetime.
///
/// A random 128-bit token rendered as a hyphenated UUID string.
/// Compared and cloned by value; carries no identity beyond its contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(String);

impl ClusterId {
    /// Generate a brand-new random identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap a value read back from settings
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn value(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ClusterId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ClusterId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Flat string-keyed settings map
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Settings(BTreeMap<String, String>);

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Read a boolean setting.
    ///
    /// `false`, `0`, `off` and `no` are false; any other present value is true.
    pub fn get_as_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(value) => !matches!(value, "false" | "0" | "off" | "no"),
            None => default,
        }
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Builder-style `put`
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.put(key, value);
        self
    }

    /// Copy every entry of `other` over this map
    pub fn merge(&mut self, other: &Settings) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Cluster-wide metadata carried in every state snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Settings that survive a full cluster restart
    #[serde(default)]
    pub persistent_settings: Settings,

    /// Settings scoped to the running cluster
    #[serde(default)]
    pub transient_settings: Settings,
}

impl Metadata {
    pub fn persistent_settings(&self) -> &Settings {
        &self.persistent_settings
    }

    pub fn transient_settings(&self) -> &Settings {
        &self.transient_settings
    }

    /// True when either scope asks for read-only mode
    pub fn read_only(&self) -> bool {
        self.persistent_settings.get_as_bool(SETTING_READ_ONLY, false)
            || self.transient_settings.get_as_bool(SETTING_READ_ONLY, false)
    }

    pub fn is_empty(&self) -> bool {
        self.persistent_settings.is_empty() && self.transient_settings.is_empty()
    }
}

/// Cluster-level blocks restricting operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterBlock {
    /// Cluster metadata and data are read-only
    ReadOnly,
}

/// Set of active global blocks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterBlocks(BTreeSet<ClusterBlock>);

impl ClusterBlocks {
    pub fn add_global_block(&mut self, block: ClusterBlock) {
        self.0.insert(block);
    }

    pub fn remove_global_block(&mut self, block: ClusterBlock) {
        self.0.remove(&block);
    }

    pub fn has_global_block(&self, block: ClusterBlock) -> bool {
        self.0.contains(&block)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Priority hint for cluster state update tasks
///
/// Ordered so that `Urgent` compares greatest.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// Versioned snapshot of replicated cluster state as seen by one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    /// Monotonic version, bumped on every committed change
    pub version: u64,

    /// Node this snapshot belongs to
    pub local_node_id: String,

    /// Currently elected master, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_node_id: Option<String>,

    /// Cluster-wide settings
    pub metadata: Metadata,

    /// Active global blocks
    pub blocks: ClusterBlocks,
}

impl ClusterState {
    /// Empty state for a node that has not yet joined or recovered anything
    pub fn empty(local_node_id: impl Into<String>) -> Self {
        Self {
            version: 0,
            local_node_id: local_node_id.into(),
            master_node_id: None,
            metadata: Metadata::default(),
            blocks: ClusterBlocks::default(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn blocks(&self) -> &ClusterBlocks {
        &self.blocks
    }

    pub fn local_node_id(&self) -> &str {
        &self.local_node_id
    }

    pub fn master_node_id(&self) -> Option<&str> {
        self.master_node_id.as_deref()
    }

    pub fn is_local_node_master(&self) -> bool {
        self.master_node_id.as_deref() == Some(self.local_node_id.as_str())
    }

    /// Committed cluster identifier, if one is visible in this snapshot
    pub fn cluster_id(&self) -> Option<ClusterId> {
        self.metadata
            .transient_settings
            .get(CLUSTER_ID_SETTINGS_KEY)
            .map(ClusterId::from)
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_master(mut self, master_node_id: Option<String>) -> Self {
        self.master_node_id = master_node_id;
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Re-home a snapshot published by another node onto this one
    pub fn for_local_node(mut self, local_node_id: impl Into<String>) -> Self {
        self.local_node_id = local_node_id.into();
        self
    }

    /// Recompute derived global blocks from the current metadata
    pub fn with_derived_blocks(mut self) -> Self {
        if self.metadata.read_only() {
            self.blocks.add_global_block(ClusterBlock::ReadOnly);
        } else {
            self.blocks.remove_global_block(ClusterBlock::ReadOnly);
        }
        self
    }

    /// True when `other` carries the same replicated content
    pub fn same_content(&self, other: &ClusterState) -> bool {
        self.master_node_id == other.master_node_id
            && self.metadata == other.metadata
            && self.blocks == other.blocks
    }
}
