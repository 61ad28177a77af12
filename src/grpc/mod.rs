//! gRPC server module for the quota admission service.

mod server;
mod service;

pub use server::GrpcServer;
pub use service::QuotaServiceImpl;

// Include the generated protobuf code
pub mod proto {
    pub mod waterline {
        pub mod v1 {
            tonic::include_proto!("waterline.v1");
        }
    }
}

// Re-export commonly used types
pub use proto::waterline::v1::{
    quota_server::QuotaServer, AllocateRequest, AllocateResponse, Allocation, Update,
};
