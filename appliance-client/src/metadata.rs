//! The `tns-csi:*` user-property marker written onto every volume's dataset.
//!
//! The marker is how `CreateVolume` replay and `ListVolumes` recognize a
//! dataset as CSI-managed, and how adoption recognizes a pre-existing one as
//! adoptable. It is versioned so that a future driver release can evolve the
//! key set without breaking datasets written by an older one.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{DeleteStrategy, Protocol};

pub const PROPERTY_NAMESPACE: &str = "tns-csi";

fn default_schema_version() -> u32 {
    1
}

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// The decoded `tns-csi:*` user properties for a managed dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMarker {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,

    /// Always `"tns-csi"`; lets a shared pool distinguish this driver's
    /// datasets from another CSI driver's or from hand-managed ones.
    pub managed_by: String,

    pub csi_volume_name: String,
    pub pvc_namespace: String,
    pub pvc_name: String,
    pub requested_size: i64,
    pub delete_strategy: DeleteStrategy,
    pub protocol: Protocol,

    /// Set when a pre-existing dataset was adopted rather than created by
    /// this driver; governs whether `DeleteVolume` may destroy it at all.
    #[serde(default)]
    pub adoptable: bool,

    /// Properties read back that this schema version doesn't recognize,
    /// preserved verbatim on read-modify-write so a downgrade doesn't lose them.
    #[serde(flatten)]
    pub unknown: HashMap<String, String>,
}

impl VolumeMarker {
    pub fn new(
        csi_volume_name: String,
        pvc_namespace: String,
        pvc_name: String,
        requested_size: i64,
        delete_strategy: DeleteStrategy,
        protocol: Protocol,
    ) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            managed_by: PROPERTY_NAMESPACE.to_string(),
            csi_volume_name,
            pvc_namespace,
            pvc_name,
            requested_size,
            delete_strategy,
            protocol,
            adoptable: false,
            unknown: HashMap::new(),
        }
    }

    pub fn needs_migration(&self) -> bool {
        self.schema_version < CURRENT_SCHEMA_VERSION
    }

    /// No-op today; the hook exists so a future schema bump has a single
    /// place to rename/reshape keys read from an older marker.
    pub fn migrate(mut self) -> Self {
        if self.needs_migration() {
            self.schema_version = CURRENT_SCHEMA_VERSION;
        }
        self
    }

    /// Flattens to the `tns-csi:<key>` -> value map sent as ZFS user properties.
    pub fn to_properties(&self) -> HashMap<String, String> {
        let mut props = HashMap::new();
        props.insert(
            format!("{PROPERTY_NAMESPACE}:schema-version"),
            self.schema_version.to_string(),
        );
        props.insert(format!("{PROPERTY_NAMESPACE}:managed-by"), self.managed_by.clone());
        props.insert(
            format!("{PROPERTY_NAMESPACE}:csi-volume-name"),
            self.csi_volume_name.clone(),
        );
        props.insert(
            format!("{PROPERTY_NAMESPACE}:pvc-namespace"),
            self.pvc_namespace.clone(),
        );
        props.insert(format!("{PROPERTY_NAMESPACE}:pvc-name"), self.pvc_name.clone());
        props.insert(
            format!("{PROPERTY_NAMESPACE}:requested-size"),
            self.requested_size.to_string(),
        );
        props.insert(
            format!("{PROPERTY_NAMESPACE}:delete-strategy"),
            self.delete_strategy.to_string(),
        );
        props.insert(format!("{PROPERTY_NAMESPACE}:protocol"), self.protocol.to_string());
        props.insert(
            format!("{PROPERTY_NAMESPACE}:adoptable"),
            self.adoptable.to_string(),
        );
        for (k, v) in &self.unknown {
            props.insert(format!("{PROPERTY_NAMESPACE}:{k}"), v.clone());
        }
        props
    }

    /// Parses the `tns-csi:*` subset of a dataset's user properties.
    ///
    /// Returns `None` if the dataset carries no `managed-by` marker at all,
    /// which the engine treats as "not CSI-managed" rather than an error.
    pub fn from_properties(props: &HashMap<String, String>) -> Option<Self> {
        let prefix = format!("{PROPERTY_NAMESPACE}:");
        let strip = |key: &str| props.get(key).cloned();

        let managed_by = strip(&format!("{prefix}managed-by"))?;

        let mut known_suffixes = [
            "schema-version",
            "managed-by",
            "csi-volume-name",
            "pvc-namespace",
            "pvc-name",
            "requested-size",
            "delete-strategy",
            "protocol",
            "adoptable",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>();
        known_suffixes.sort();

        let unknown = props
            .iter()
            .filter_map(|(k, v)| {
                let suffix = k.strip_prefix(&prefix)?;
                if known_suffixes.binary_search(&suffix.to_string()).is_ok() {
                    None
                } else {
                    Some((suffix.to_string(), v.clone()))
                }
            })
            .collect();

        let marker = VolumeMarker {
            schema_version: strip(&format!("{prefix}schema-version"))
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_schema_version),
            managed_by,
            csi_volume_name: strip(&format!("{prefix}csi-volume-name")).unwrap_or_default(),
            pvc_namespace: strip(&format!("{prefix}pvc-namespace")).unwrap_or_default(),
            pvc_name: strip(&format!("{prefix}pvc-name")).unwrap_or_default(),
            requested_size: strip(&format!("{prefix}requested-size"))
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            delete_strategy: strip(&format!("{prefix}delete-strategy"))
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            protocol: strip(&format!("{prefix}protocol"))
                .and_then(|v| v.parse().ok())
                .unwrap_or(Protocol::Nfs),
            adoptable: strip(&format!("{prefix}adoptable"))
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            unknown,
        };

        Some(marker.migrate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VolumeMarker {
        VolumeMarker::new(
            "pvc-abc123".to_string(),
            "default".to_string(),
            "my-claim".to_string(),
            10 * 1024 * 1024 * 1024,
            DeleteStrategy::Delete,
            Protocol::Nfs,
        )
    }

    #[test]
    fn roundtrips_through_properties() {
        let marker = sample();
        let props = marker.to_properties();
        let decoded = VolumeMarker::from_properties(&props).unwrap();
        assert_eq!(decoded.csi_volume_name, "pvc-abc123");
        assert_eq!(decoded.requested_size, 10 * 1024 * 1024 * 1024);
        assert_eq!(decoded.delete_strategy, DeleteStrategy::Delete);
        assert_eq!(decoded.protocol, Protocol::Nfs);
        assert!(!decoded.adoptable);
    }

    #[test]
    fn absent_marker_is_none() {
        let props = HashMap::new();
        assert!(VolumeMarker::from_properties(&props).is_none());
    }

    #[test]
    fn unrecognized_keys_survive_roundtrip() {
        let mut props = sample().to_properties();
        props.insert("tns-csi:future-field".to_string(), "some-value".to_string());
        let decoded = VolumeMarker::from_properties(&props).unwrap();
        assert_eq!(
            decoded.unknown.get("future-field"),
            Some(&"some-value".to_string())
        );
        let reencoded = decoded.to_properties();
        assert_eq!(
            reencoded.get("tns-csi:future-field"),
            Some(&"some-value".to_string())
        );
    }

    #[test]
    fn old_schema_version_migrates_on_load() {
        let mut props = sample().to_properties();
        props.insert("tns-csi:schema-version".to_string(), "0".to_string());
        let decoded = VolumeMarker::from_properties(&props).unwrap();
        assert_eq!(decoded.schema_version, CURRENT_SCHEMA_VERSION);
        assert!(!decoded.needs_migration());
    }
}
