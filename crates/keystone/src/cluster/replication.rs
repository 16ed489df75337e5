//! Cluster state replication (UDP)
//!
//! The master sends every committed state to its peers as one JSON datagram
//! and re-sends the latest state on an interval, so a follower that dropped a
//! packet or started late still converges. Followers hand received states to
//! their cluster state service, which discards stale versions.

use anyhow::{Context, Result};
use keystone_common::ClusterState;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use super::ClusterHandle;

/// Largest UDP payload over IPv4
const MAX_PACKET_SIZE: usize = 65_507;

/// Replication transport configuration
#[derive(Clone, Debug)]
pub struct ReplicationConfig {
    /// Local receive address (e.g., "10.100.0.1:8901")
    pub bind_addr: String,
    /// Peer addresses to publish to
    pub peers: Vec<String>,
    /// Re-send interval for the latest state while master
    pub republish_interval: Duration,
}

/// Datagram carrying one published state
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatePacket {
    /// Sending node
    pub from: String,
    /// Committed state as applied on the sender
    pub state: ClusterState,
}

/// Publishes committed states to peers and applies states received from them
pub struct ReplicationService {
    config: ReplicationConfig,
    cluster: ClusterHandle,
}

impl ReplicationService {
    pub fn new(config: ReplicationConfig, cluster: ClusterHandle) -> Self {
        Self { config, cluster }
    }

    /// Bind the receive socket; done up front so bind errors fail startup
    pub async fn bind(&self) -> Result<UdpSocket> {
        UdpSocket::bind(&self.config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind replication socket on {}", self.config.bind_addr))
    }

    /// Run the state publisher
    pub async fn run_publisher(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("Failed to bind replication sender socket")?;

        let mut published = self.cluster.subscribe();
        let mut republish = tokio::time::interval(self.config.republish_interval);
        republish.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            peers = ?self.config.peers,
            interval = ?self.config.republish_interval,
            "Replication publisher started"
        );

        loop {
            tokio::select! {
                result = published.recv() => {
                    match result {
                        Ok(state) => self.publish(&socket, &state).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped, "Publisher lagged, sending latest state");
                            let state = self.cluster.state();
                            if state.is_local_node_master() {
                                self.publish(&socket, &state).await;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = republish.tick() => {
                    let state = self.cluster.state();
                    if state.is_local_node_master() {
                        self.publish(&socket, &state).await;
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Replication publisher shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Run the state receiver on a socket from [`ReplicationService::bind`]
    pub async fn run_receiver(
        &self,
        socket: UdpSocket,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];

        tracing::info!(
            addr = ?socket.local_addr().ok(),
            "Replication receiver started"
        );

        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, addr)) => self.handle_packet(&buf[..len], addr),
                        Err(e) => {
                            tracing::warn!(error = %e, "Replication receive error");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Replication receiver shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn publish(&self, socket: &UdpSocket, state: &ClusterState) {
        let packet = StatePacket {
            from: self.cluster.node_id().to_string(),
            state: state.clone(),
        };
        let bytes = match serde_json::to_vec(&packet) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize state packet");
                return;
            }
        };
        if bytes.len() > MAX_PACKET_SIZE {
            tracing::error!(
                size = bytes.len(),
                version = state.version(),
                "Cluster state too large for one datagram"
            );
            return;
        }

        for peer in &self.config.peers {
            if let Err(e) = socket.send_to(&bytes, peer).await {
                tracing::warn!(peer = %peer, error = %e, "Failed to send cluster state");
            }
        }
    }

    fn handle_packet(&self, data: &[u8], addr: SocketAddr) {
        let packet: StatePacket = match serde_json::from_slice(data) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(peer = %addr, error = %e, "Invalid state packet");
                return;
            }
        };

        if packet.from == self.cluster.node_id() {
            return;
        }

        tracing::trace!(
            from = %packet.from,
            peer = %addr,
            version = packet.state.version(),
            "Received cluster state"
        );

        if let Err(e) = self.cluster.apply_published(packet.state) {
            tracing::warn!(from = %packet.from, error = %e, "Failed to apply received state");
        }
    }
}
