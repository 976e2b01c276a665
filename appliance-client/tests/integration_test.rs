//! Cross-module integration tests for the appliance client.
//!
//! These exercise naming, metadata, and type parsing together the way the
//! volume engine composes them, without requiring a live appliance
//! connection (which needs a real WebSocket endpoint and API key).

use std::collections::HashMap;

use appliance_client::metadata::VolumeMarker;
use appliance_client::naming::{self, DatasetPath, NameContext};
use appliance_client::types::{DeleteStrategy, Protocol, StorageClassParams};

fn storage_class_params(pairs: &[(&str, &str)]) -> StorageClassParams {
    StorageClassParams {
        raw: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
    }
}

#[test]
fn storage_class_params_drive_naming_end_to_end() {
    let params = storage_class_params(&[
        ("protocol", "iscsi"),
        ("deleteStrategy", "retain"),
        ("zfs.compression", "zstd"),
    ]);
    assert_eq!(params.protocol().unwrap(), Protocol::Iscsi);
    assert_eq!(params.delete_strategy().unwrap(), DeleteStrategy::Retain);

    let ctx = NameContext {
        pvc_name: "data-claim".to_string(),
        pvc_namespace: "prod".to_string(),
        pv_name: "pvc-11111111-2222-3333-4444-555555555555".to_string(),
    };
    let dataset_path = naming::dataset_path_for_volume(
        "tank",
        Some("csi"),
        "{PVCNamespace}-{PVCName}",
        "pvc-",
        "",
        &ctx,
    )
    .unwrap();
    assert_eq!(dataset_path.as_str(), "tank/csi/pvc-prod-data-claim");

    let target_name =
        naming::iscsi_target_name_for_dataset("iqn.2024-01.io.tns.csi", &dataset_path).unwrap();
    assert_eq!(target_name.as_str(), "iqn.2024-01.io.tns.csi:pvc-prod-data-claim");
}

#[test]
fn volume_marker_survives_a_full_properties_roundtrip_with_unknown_keys() {
    let dataset_path = DatasetPath::new("tank/csi/pvc-roundtrip").unwrap();
    let marker = VolumeMarker::new(
        "pvc-roundtrip".to_string(),
        "staging".to_string(),
        "staging-claim".to_string(),
        5 * 1024 * 1024 * 1024,
        DeleteStrategy::Delete,
        Protocol::Nvmeof,
    );

    let mut properties = marker.to_properties();
    // Simulate an unrelated property another tool wrote under the same namespace.
    properties.insert("tns-csi:operator-notes".to_string(), "do-not-touch".to_string());

    let decoded = VolumeMarker::from_properties(&properties).unwrap();
    assert_eq!(decoded.csi_volume_name, "pvc-roundtrip");
    assert_eq!(decoded.protocol, Protocol::Nvmeof);
    assert_eq!(
        decoded.unknown.get("operator-notes"),
        Some(&"do-not-touch".to_string())
    );

    let nqn = naming::nqn_for_dataset(&dataset_path).unwrap();
    assert_eq!(nqn.as_str(), "nqn.2137.csi.tns:pvc-roundtrip");
}

#[test]
fn dataset_without_managed_by_marker_is_not_csi_managed() {
    let mut properties: HashMap<String, String> = HashMap::new();
    properties.insert("some:other-property".to_string(), "value".to_string());
    assert!(VolumeMarker::from_properties(&properties).is_none());
}

#[test]
fn snapshot_label_matches_detached_dataset_naming() {
    let snapshot_id = "b3f1c8b0-6f2a-4e0b-9f9a-1f2e3d4c5b6a";
    let label = naming::snapshot_label(snapshot_id);
    let detached_dataset =
        DatasetPath::new(format!("tank/csi-detached-snapshots/{snapshot_id}")).unwrap();
    assert!(label.starts_with("snap-"));
    assert_eq!(detached_dataset.leaf(), snapshot_id);
}
