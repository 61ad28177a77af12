//! Best-effort UDP broadcast of usage updates between peer nodes.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use prost::Message;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{info, trace, warn};

use crate::grpc::proto::waterline::v1::Update;
use crate::quota::QuotaManager;

/// Upper bound on an encoded update datagram.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Errors that can occur in mesh transport operations.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Failed to bind mesh socket: {0}")]
    Bind(std::io::Error),
    #[error("Failed to publish update: {0}")]
    Publish(String),
}

/// Sink for outbound usage updates.
///
/// The reconciliation task depends only on this trait, so tests and
/// alternative transports can stand in for the UDP mesh.
#[async_trait]
pub trait UpdatePublisher: Send + Sync {
    /// Publish an update to all peers. Best effort.
    async fn publish(&self, update: &Update) -> Result<(), MeshError>;
}

/// UDP transport broadcasting updates to a static peer list.
///
/// Updates are prost-encoded, one datagram per peer. Delivery is
/// unordered and unreliable; the reconciliation protocol tolerates loss,
/// reordering and delivery back to the sender.
pub struct UdpMesh {
    socket: Arc<UdpSocket>,
    peers: Vec<SocketAddr>,
}

impl UdpMesh {
    /// Bind the mesh socket.
    pub async fn bind(listen_addr: SocketAddr, peers: Vec<SocketAddr>) -> Result<Self, MeshError> {
        let socket = UdpSocket::bind(listen_addr).await.map_err(MeshError::Bind)?;

        info!(
            listen_addr = %listen_addr,
            peer_count = peers.len(),
            "mesh transport bound"
        );

        Ok(Self {
            socket: Arc::new(socket),
            peers,
        })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Spawn the receive loop, forwarding decoded updates to the manager.
    ///
    /// Undecodable datagrams are dropped with a warning; the manager
    /// discards its own broadcasts by origin id.
    pub fn spawn_receiver(&self, manager: Arc<QuotaManager>) -> JoinHandle<()> {
        let socket = Arc::clone(&self.socket);

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, from)) => match Update::decode(&buf[..len]) {
                        Ok(update) => {
                            trace!(
                                from = %from,
                                origin = %update.origin_id,
                                allocations = update.allocations.len(),
                                "received usage update"
                            );
                            manager.apply_update(&update);
                        }
                        Err(e) => {
                            warn!(from = %from, error = %e, "dropping undecodable update");
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "mesh receive failed");
                    }
                }
            }
        })
    }
}

#[async_trait]
impl UpdatePublisher for UdpMesh {
    async fn publish(&self, update: &Update) -> Result<(), MeshError> {
        let payload = update.encode_to_vec();

        if payload.len() > MAX_DATAGRAM {
            return Err(MeshError::Publish(format!(
                "update of {} bytes exceeds datagram limit",
                payload.len()
            )));
        }

        for peer in &self.peers {
            if let Err(e) = self.socket.send_to(&payload, peer).await {
                warn!(peer = %peer, error = %e, "failed to send update to peer");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuotaConfig;
    use crate::grpc::proto::waterline::v1::Allocation;
    use crate::quota::unix_now;
    use std::time::Duration;

    fn test_quota_config() -> QuotaConfig {
        QuotaConfig {
            window_secs: 3600,
            rate_limit: 10,
            total_limit: 0,
            idle_ttl_secs: 7200,
            flush_interval_secs: 1,
            slide_interval_secs: 3600,
            sweep_interval_secs: 3600,
        }
    }

    fn test_update(origin: &str, total: i64) -> Update {
        Update {
            origin_id: origin.to_string(),
            timestamp: unix_now(),
            allocations: vec![Allocation {
                resource: "api".to_string(),
                bucket: "global".to_string(),
                total,
                timestamp: unix_now(),
            }],
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
        for _ in 0..50 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_publish_reaches_peer_manager() {
        let loopback: SocketAddr = "127.0.0.1:0".parse().unwrap();

        let receiver = UdpMesh::bind(loopback, Vec::new()).await.unwrap();
        let receiver_addr = receiver.local_addr().unwrap();

        let manager = Arc::new(QuotaManager::new(test_quota_config()));
        receiver.spawn_receiver(Arc::clone(&manager));

        let sender = UdpMesh::bind(loopback, vec![receiver_addr]).await.unwrap();
        sender.publish(&test_update("peer", 4)).await.unwrap();

        assert!(
            wait_for(|| manager.window_total("api", "global") == Some(4)).await,
            "update should arrive and merge"
        );

        manager.stop();
    }

    #[tokio::test]
    async fn test_self_originated_update_is_discarded() {
        let loopback: SocketAddr = "127.0.0.1:0".parse().unwrap();

        let mesh = UdpMesh::bind(loopback, Vec::new()).await.unwrap();
        let addr = mesh.local_addr().unwrap();

        let manager = Arc::new(QuotaManager::new(test_quota_config()));
        mesh.spawn_receiver(Arc::clone(&manager));

        // Loop the node's own broadcast back to itself.
        let sender = UdpMesh::bind(loopback, vec![addr]).await.unwrap();
        sender
            .publish(&test_update(manager.id(), 4))
            .await
            .unwrap();
        sender.publish(&test_update("peer", 2)).await.unwrap();

        // The peer update lands, the self-originated one never does.
        assert!(wait_for(|| manager.window_total("api", "global") == Some(2)).await);

        manager.stop();
    }

    #[tokio::test]
    async fn test_undecodable_datagram_is_dropped() {
        let loopback: SocketAddr = "127.0.0.1:0".parse().unwrap();

        let mesh = UdpMesh::bind(loopback, Vec::new()).await.unwrap();
        let addr = mesh.local_addr().unwrap();

        let manager = Arc::new(QuotaManager::new(test_quota_config()));
        mesh.spawn_receiver(Arc::clone(&manager));

        let raw = UdpSocket::bind(loopback).await.unwrap();
        raw.send_to(b"not an update", addr).await.unwrap();

        // A valid update sent afterwards still gets through.
        let sender = UdpMesh::bind(loopback, vec![addr]).await.unwrap();
        sender.publish(&test_update("peer", 3)).await.unwrap();

        assert!(wait_for(|| manager.window_total("api", "global") == Some(3)).await);
        assert_eq!(manager.counter_count(), 1);

        manager.stop();
    }
}
