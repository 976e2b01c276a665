//! Appliance client library: the JSON-RPC-over-WebSocket connection to the
//! ZFS appliance's management API, and the volume engine built on top of it.
//!
//! This crate has no binary target. It is linked directly into the
//! `csi-driver` process and driven in-process by the Controller service;
//! there is no second network hop to a local agent.

pub mod client;
pub mod engine;
pub mod error;
pub mod metadata;
pub mod metrics;
pub mod naming;
pub mod retry;
pub mod types;

pub use client::{ApplianceClient, ApplianceConfig};
pub use engine::{Engine, EngineConfig};
pub use error::{ApplianceError, Result};
