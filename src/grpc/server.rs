//! gRPC server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::Server;
use tracing::{error, info};

use super::proto::waterline::v1::quota_server::QuotaServer;
use super::service::QuotaServiceImpl;
use crate::error::{Result, WaterlineError};
use crate::quota::QuotaManager;

/// gRPC server for the quota admission service.
pub struct GrpcServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The quota manager instance
    manager: Arc<QuotaManager>,
}

impl GrpcServer {
    /// Create a new gRPC server.
    pub fn new(addr: SocketAddr, manager: Arc<QuotaManager>) -> Self {
        Self { addr, manager }
    }

    /// Start the gRPC server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        let service = QuotaServiceImpl::new(self.manager);

        info!(addr = %self.addr, "Starting gRPC server for Quota service");

        Server::builder()
            .add_service(QuotaServer::new(service))
            .serve(self.addr)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                WaterlineError::Grpc(e)
            })
    }

    /// Start the gRPC server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let service = QuotaServiceImpl::new(self.manager);

        info!(
            addr = %self.addr,
            "Starting gRPC server for Quota service with graceful shutdown"
        );

        Server::builder()
            .add_service(QuotaServer::new(service))
            .serve_with_shutdown(self.addr, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                WaterlineError::Grpc(e)
            })
    }
}
