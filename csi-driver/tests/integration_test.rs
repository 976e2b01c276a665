//! Integration tests for csi-driver
//!
//! These exercise the Identity and Node gRPC service implementations
//! directly (no kubelet, no real iSCSI/NVMe-oF/NFS gear) the way the
//! Controller service is covered by its own in-module tests: plain
//! `#[tokio::test]` functions calling the generated trait methods.

use std::collections::HashMap;
use std::sync::Arc;

use tonic::Request;

use csi_driver::csi;
use csi_driver::csi::identity_server::Identity;
use csi_driver::csi::node_server::Node;
use csi_driver::error::to_status;
use csi_driver::identity::ReadinessState;
use csi_driver::{IdentityService, NodeService};

use appliance_client::ApplianceError;

#[tokio::test]
async fn identity_reports_driver_name_and_version() {
    let service = IdentityService::new();
    let response = service
        .get_plugin_info(Request::new(csi::GetPluginInfoRequest {}))
        .await
        .unwrap()
        .into_inner();

    assert_eq!(response.name, csi_driver::identity::DRIVER_NAME);
    assert!(!response.vendor_version.is_empty());
}

#[tokio::test]
async fn identity_probe_follows_shared_readiness_state() {
    let readiness = Arc::new(ReadinessState::new());
    let service = IdentityService::with_readiness(readiness.clone());

    let not_ready = service
        .probe(Request::new(csi::ProbeRequest {}))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(not_ready.ready, Some(false));

    readiness.set_ready(true);
    let ready = service
        .probe(Request::new(csi::ProbeRequest {}))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(ready.ready, Some(true));
}

#[tokio::test]
async fn node_get_info_and_capabilities() {
    let service = NodeService::new("worker-1".to_string());

    let info = service
        .node_get_info(Request::new(csi::NodeGetInfoRequest {}))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(info.node_id, "worker-1");
    assert_eq!(info.max_volumes_per_node, 0);

    let caps = service
        .node_get_capabilities(Request::new(csi::NodeGetCapabilitiesRequest {}))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(caps.capabilities.len(), 3);
}

#[tokio::test]
async fn node_stage_volume_rejects_missing_volume_id() {
    let service = NodeService::new("worker-1".to_string());
    let req = csi::NodeStageVolumeRequest {
        volume_id: String::new(),
        publish_context: HashMap::new(),
        staging_target_path: "/var/lib/kubelet/plugins/tns.csi.io/staging/vol1".to_string(),
        volume_capability: None,
        secrets: HashMap::new(),
        volume_context: HashMap::new(),
    };

    let status = service.node_stage_volume(Request::new(req)).await.unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
}

#[tokio::test]
async fn node_stage_volume_rejects_missing_protocol_in_context() {
    let service = NodeService::new("worker-1".to_string());
    let req = csi::NodeStageVolumeRequest {
        volume_id: "pvc-1".to_string(),
        publish_context: HashMap::new(),
        staging_target_path: "/var/lib/kubelet/plugins/tns.csi.io/staging/pvc-1".to_string(),
        volume_capability: None,
        secrets: HashMap::new(),
        volume_context: HashMap::new(),
    };

    let status = service.node_stage_volume(Request::new(req)).await.unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
}

#[tokio::test]
async fn node_unstage_volume_rejects_relative_path() {
    let service = NodeService::new("worker-1".to_string());
    let req = csi::NodeUnstageVolumeRequest {
        volume_id: "pvc-1".to_string(),
        staging_target_path: "relative/path".to_string(),
    };

    let status = service.node_unstage_volume(Request::new(req)).await.unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
}

#[test]
fn error_mapping_matches_the_csi_error_table() {
    assert_eq!(
        to_status(ApplianceError::InvalidArgument("bad size".into())).code(),
        tonic::Code::InvalidArgument
    );
    assert_eq!(
        to_status(ApplianceError::AlreadyExists("tank/x".into())).code(),
        tonic::Code::AlreadyExists
    );
    assert_eq!(
        to_status(ApplianceError::Unauthenticated).code(),
        tonic::Code::Unauthenticated
    );
    assert_eq!(
        to_status(ApplianceError::Canceled).code(),
        tonic::Code::Cancelled
    );
    assert_eq!(
        to_status(ApplianceError::RetriesExhausted {
            attempts: 3,
            source: Box::new(ApplianceError::NetworkRetryable("timeout".into())),
        })
        .code(),
        tonic::Code::Unavailable
    );
}
