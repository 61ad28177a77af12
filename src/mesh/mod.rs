//! Peer mesh transport for reconciliation broadcasts.
//!
//! Each node periodically broadcasts its locally accepted usage to a
//! static peer list over UDP and merges the updates it receives. The
//! channel is best effort; the quota protocol tolerates loss, duplication
//! and delivery back to the sender.

mod transport;

pub use transport::{MeshError, UdpMesh, UpdatePublisher};
