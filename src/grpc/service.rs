//! Quota admission service implementation.

use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, instrument, warn};

use super::proto::waterline::v1::{
    allocate_response, quota_server::Quota, AllocateRequest, AllocateResponse,
};

use crate::quota::{AllocateError, QuotaManager};

/// Implementation of the Quota gRPC interface.
pub struct QuotaServiceImpl {
    /// The quota manager instance
    manager: Arc<QuotaManager>,
}

impl QuotaServiceImpl {
    /// Create a new QuotaServiceImpl backed by the given manager.
    pub fn new(manager: Arc<QuotaManager>) -> Self {
        Self { manager }
    }
}

#[tonic::async_trait]
impl Quota for QuotaServiceImpl {
    /// Admit an allocation request against the configured limits.
    ///
    /// Rejections are carried in the response status so callers can
    /// distinguish "slow down" from "service degraded"; transport errors
    /// are reserved for malformed requests.
    #[instrument(
        skip(self, request),
        fields(
            resource = %request.get_ref().resource,
            bucket = %request.get_ref().bucket,
            amount = request.get_ref().amount
        )
    )]
    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> Result<Response<AllocateResponse>, Status> {
        let req = request.into_inner();

        // Validate the request
        if req.resource.is_empty() {
            warn!("Received allocation request with empty resource");
            return Err(Status::invalid_argument("resource is required"));
        }

        if req.bucket.is_empty() {
            warn!("Received allocation request with empty bucket");
            return Err(Status::invalid_argument("bucket is required"));
        }

        if req.amount <= 0 {
            warn!("Received allocation request with non-positive amount");
            return Err(Status::invalid_argument("amount must be positive"));
        }

        let (status, allocation) = match self.manager.allocate(&req.resource, &req.bucket, req.amount)
        {
            Ok(granted) => (allocate_response::Status::Ok, granted),
            Err(AllocateError::TooManyRequests) => {
                (allocate_response::Status::RejectTooManyRequests, 0)
            }
            Err(AllocateError::ServerError) => (allocate_response::Status::RejectServerError, 0),
        };

        debug!(
            resource = %req.resource,
            bucket = %req.bucket,
            status = ?status,
            allocation,
            "Allocation decision made"
        );

        Ok(Response::new(AllocateResponse {
            status: status.into(),
            allocation,
        }))
    }
}
