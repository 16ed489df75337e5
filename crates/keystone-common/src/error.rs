//! Common error types for Keystone components.

use thiserror::Error;

/// Common errors across Keystone components
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeystoneError {
    /// Update task submitted to a node that is not the elected master
    #[error("Node [{node_id}] is not the elected master")]
    NotMaster { node_id: String },

    /// Update task lost against an already committed value
    #[error("Superseded: {0}")]
    Superseded(String),

    /// The cluster state service is no longer accepting tasks
    #[error("Cluster state update queue is closed")]
    QueueClosed,

    /// Invalid input/request
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl KeystoneError {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotMaster { .. } => 503,
            Self::Superseded(_) => 409,
            Self::QueueClosed => 503,
            Self::InvalidInput(_) => 400,
        }
    }

    /// Returns true if a later attempt may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotMaster { .. } | Self::Superseded(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_failures_are_retryable() {
        let not_master = KeystoneError::NotMaster {
            node_id: "node-1".to_string(),
        };
        assert!(not_master.is_retryable());
        assert_eq!(not_master.status_code(), 503);
        assert_eq!(
            not_master.to_string(),
            "Node [node-1] is not the elected master"
        );

        assert!(KeystoneError::Superseded("cluster_id".into()).is_retryable());
        assert!(!KeystoneError::QueueClosed.is_retryable());
        assert!(!KeystoneError::InvalidInput("empty key".into()).is_retryable());
    }
}
