//! CSI driver for a ZFS-based NAS appliance.
//!
//! This library provides:
//! - CSI Identity, Controller, and Node service implementations
//! - Platform-specific mount/unmount operations
//!
//! The driver talks to the appliance over a single JSON-RPC/WebSocket
//! connection managed by `appliance-client`; there is no second network hop
//! to a local per-node agent.

/// CSI proto generated types.
pub mod csi {
    tonic::include_proto!("csi.v1");
}

pub mod controller;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod node;
pub mod platform;

pub use controller::ControllerService;
pub use identity::IdentityService;
pub use node::NodeService;
