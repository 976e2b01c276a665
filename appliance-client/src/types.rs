//! Core domain types shared across the naming, metadata, and volume engine modules.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Backing protocol for a CSI volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Nfs,
    Nvmeof,
    Iscsi,
}

impl Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Nfs => write!(f, "nfs"),
            Protocol::Nvmeof => write!(f, "nvmeof"),
            Protocol::Iscsi => write!(f, "iscsi"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProtocolParseError(String);

impl Display for ProtocolParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown protocol '{}': expected 'nfs', 'nvmeof', or 'iscsi'",
            self.0
        )
    }
}

impl std::error::Error for ProtocolParseError {}

impl FromStr for Protocol {
    type Err = ProtocolParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nfs" => Ok(Protocol::Nfs),
            "nvmeof" | "nvme" => Ok(Protocol::Nvmeof),
            "iscsi" => Ok(Protocol::Iscsi),
            _ => Err(ProtocolParseError(s.to_string())),
        }
    }
}

/// What `DeleteVolume` does to the backing dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteStrategy {
    #[default]
    Delete,
    Retain,
}

impl Display for DeleteStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeleteStrategy::Delete => write!(f, "delete"),
            DeleteStrategy::Retain => write!(f, "retain"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeleteStrategyParseError(String);

impl Display for DeleteStrategyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown deleteStrategy '{}': expected 'delete' or 'retain'",
            self.0
        )
    }
}

impl std::error::Error for DeleteStrategyParseError {}

impl FromStr for DeleteStrategy {
    type Err = DeleteStrategyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "" | "delete" => Ok(DeleteStrategy::Delete),
            "retain" => Ok(DeleteStrategy::Retain),
            _ => Err(DeleteStrategyParseError(s.to_string())),
        }
    }
}

/// Where a new volume's content comes from.
#[derive(Debug, Clone)]
pub enum ContentSource {
    Empty,
    Snapshot { snapshot_id: String },
    Volume { source_volume_id: String },
}

/// Protocol-specific attachment parameters returned to the node plugin via `volume_context`.
#[derive(Debug, Clone)]
pub enum AttachParams {
    Nfs {
        server: String,
        export_path: String,
    },
    Nvmeof {
        nqn: String,
        transport_addr: String,
        transport_port: u16,
    },
    Iscsi {
        iqn: String,
        portal: String,
        lun: u32,
    },
}

/// A fully resolved volume as returned by the engine to the CSI glue layer.
#[derive(Debug, Clone)]
pub struct Volume {
    pub volume_id: String,
    pub protocol: Protocol,
    pub capacity_bytes: i64,
    pub dataset_path: String,
    pub attach_params: AttachParams,
    pub fs_type: Option<String>,
}

/// A ZFS (or detached-dataset) snapshot as returned to the CSI glue layer.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub source_volume_id: String,
    pub created_at: i64,
    pub size_bytes: i64,
    pub detached: bool,
}

/// StorageClass / VolumeSnapshotClass parameters, lightly typed.
///
/// `zfs.*`-prefixed keys are passed through verbatim to dataset creation;
/// everything else is a recognized knob from the external interface table.
#[derive(Debug, Clone, Default)]
pub struct StorageClassParams {
    pub raw: HashMap<String, String>,
}

impl StorageClassParams {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.raw.get(key).map(String::as_str)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    pub fn protocol(&self) -> Result<Protocol, ProtocolParseError> {
        self.get("protocol").unwrap_or("").parse()
    }

    pub fn delete_strategy(&self) -> Result<DeleteStrategy, DeleteStrategyParseError> {
        self.get("deleteStrategy").unwrap_or("").parse()
    }

    /// `zfs.<property>` pass-through properties, with the prefix stripped.
    pub fn zfs_properties(&self) -> HashMap<String, String> {
        self.raw
            .iter()
            .filter_map(|(k, v)| k.strip_prefix("zfs.").map(|prop| (prop.to_string(), v.clone())))
            .collect()
    }

    /// Dataset-creation-time encryption knobs, if `encryption=true` was set.
    pub fn encryption(&self) -> Option<EncryptionOptions> {
        if !self.get_bool("encryption") {
            return None;
        }
        Some(EncryptionOptions {
            algorithm: self.get("encryptionAlgorithm").map(str::to_string),
            generate_key: self.get_bool("encryptionGenerateKey"),
        })
    }
}

/// `encryption`/`encryptionAlgorithm`/`encryptionGenerateKey` StorageClass
/// parameters, resolved at dataset-creation time. Only meaningful on a fresh
/// dataset: a clone/restore inherits its origin's encryption instead.
#[derive(Debug, Clone)]
pub struct EncryptionOptions {
    pub algorithm: Option<String>,
    pub generate_key: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_roundtrip() {
        assert_eq!("nfs".parse::<Protocol>().unwrap(), Protocol::Nfs);
        assert_eq!("NVMEOF".parse::<Protocol>().unwrap(), Protocol::Nvmeof);
        assert_eq!("nvme".parse::<Protocol>().unwrap(), Protocol::Nvmeof);
        assert_eq!("iscsi".parse::<Protocol>().unwrap(), Protocol::Iscsi);
        assert!("smb".parse::<Protocol>().is_err());
    }

    #[test]
    fn delete_strategy_defaults_to_delete() {
        assert_eq!("".parse::<DeleteStrategy>().unwrap(), DeleteStrategy::Delete);
        assert_eq!(
            "retain".parse::<DeleteStrategy>().unwrap(),
            DeleteStrategy::Retain
        );
    }

    #[test]
    fn zfs_properties_strips_prefix() {
        let mut raw = HashMap::new();
        raw.insert("zfs.compression".to_string(), "lz4".to_string());
        raw.insert("protocol".to_string(), "nfs".to_string());
        let params = StorageClassParams { raw };
        let props = params.zfs_properties();
        assert_eq!(props.get("compression"), Some(&"lz4".to_string()));
        assert_eq!(props.len(), 1);
    }

    #[test]
    fn encryption_absent_by_default() {
        let params = StorageClassParams::default();
        assert!(params.encryption().is_none());
    }

    #[test]
    fn encryption_reads_algorithm_and_generate_key() {
        let mut raw = HashMap::new();
        raw.insert("encryption".to_string(), "true".to_string());
        raw.insert("encryptionAlgorithm".to_string(), "AES-256-GCM".to_string());
        raw.insert("encryptionGenerateKey".to_string(), "true".to_string());
        let params = StorageClassParams { raw };
        let enc = params.encryption().unwrap();
        assert_eq!(enc.algorithm.as_deref(), Some("AES-256-GCM"));
        assert!(enc.generate_key);
    }
}
