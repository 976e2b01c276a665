//! Identifier newtypes and name-derivation rules.
//!
//! Dataset paths, NVMe-oF subsystem NQNs, and iSCSI target names are all
//! derived from a Kubernetes PV/PVC triple via a small `{Key}` template
//! substitution, then validated against the appliance's identifier charset.

use std::fmt::{self, Display};
use std::str::FromStr;

use crate::error::{ApplianceError, Result};

const MAX_IDENTIFIER_LEN: usize = 223;

/// Enforces the charset the appliance accepts for dataset/share/target names:
/// alphanumeric plus `_`, `-`, `.`, `:`, with no `..` path traversal and a
/// 223-byte ceiling (ZFS's own dataset component limit).
fn validate_identifier(kind: &str, s: &str) -> Result<()> {
    if s.is_empty() {
        return Err(ApplianceError::InvalidArgument(format!("{kind} must not be empty")));
    }
    if s.len() > MAX_IDENTIFIER_LEN {
        return Err(ApplianceError::InvalidArgument(format!(
            "{kind} '{s}' exceeds {MAX_IDENTIFIER_LEN} bytes"
        )));
    }
    if s.contains("..") {
        return Err(ApplianceError::InvalidArgument(format!(
            "{kind} '{s}' must not contain '..'"
        )));
    }
    if !s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':' | '/'))
    {
        return Err(ApplianceError::InvalidArgument(format!(
            "{kind} '{s}' contains characters outside [A-Za-z0-9_.:/-]"
        )));
    }
    Ok(())
}

/// A validated, slash-separated ZFS dataset path, e.g. `tank/csi/pvc-1234`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatasetPath(String);

impl DatasetPath {
    pub fn new(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        validate_identifier("dataset path", &s)?;
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn pool(&self) -> &str {
        self.0.split('/').next().unwrap_or(&self.0)
    }

    /// The final path component, used as the default snapshot/share label root.
    pub fn leaf(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    pub fn child(&self, leaf: &str) -> Result<Self> {
        Self::new(format!("{}/{}", self.0, leaf))
    }
}

impl Display for DatasetPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DatasetPath {
    type Err = ApplianceError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// A validated NVMe Qualified Name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Nqn(String);

impl Nqn {
    pub fn new(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        validate_identifier("NQN", &s)?;
        if !s.starts_with("nqn.") {
            return Err(ApplianceError::InvalidArgument(format!(
                "NQN '{s}' must start with 'nqn.'"
            )));
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Nqn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A validated iSCSI target name (IQN form).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IscsiTargetName(String);

impl IscsiTargetName {
    pub fn new(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        validate_identifier("iSCSI target name", &s)?;
        if !s.starts_with("iqn.") {
            return Err(ApplianceError::InvalidArgument(format!(
                "iSCSI target name '{s}' must start with 'iqn.'"
            )));
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for IscsiTargetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The subset of PV/PVC identity fields a name template can reference.
#[derive(Debug, Clone, Default)]
pub struct NameContext {
    pub pvc_name: String,
    pub pvc_namespace: String,
    pub pv_name: String,
}

/// Renders `{PVCName}`, `{PVCNamespace}`, `{PVName}` placeholders against `ctx`.
///
/// Unrecognized `{...}` placeholders are left verbatim rather than rejected,
/// so operators can template against future fields without a driver upgrade.
fn render_template(template: &str, ctx: &NameContext) -> String {
    template
        .replace("{PVCName}", &ctx.pvc_name)
        .replace("{PVCNamespace}", &ctx.pvc_namespace)
        .replace("{PVName}", &ctx.pv_name)
}

/// Builds the full dataset path for a new volume:
/// `pool[/parentDataset]/<prefix><rendered template><suffix>`.
pub fn dataset_path_for_volume(
    pool: &str,
    parent_dataset: Option<&str>,
    name_template: &str,
    name_prefix: &str,
    name_suffix: &str,
    ctx: &NameContext,
) -> Result<DatasetPath> {
    let rendered = render_template(name_template, ctx);
    let leaf = format!("{name_prefix}{rendered}{name_suffix}");
    let base = match parent_dataset {
        Some(parent) => format!("{pool}/{parent}"),
        None => pool.to_string(),
    };
    DatasetPath::new(format!("{base}/{leaf}"))
}

/// `nqn.2137.csi.tns:<leaf>`, where leaf is the dataset's final path component.
pub fn nqn_for_dataset(dataset: &DatasetPath) -> Result<Nqn> {
    Nqn::new(format!("nqn.2137.csi.tns:{}", dataset.leaf()))
}

/// Base IQN plus lowercased dataset leaf, per the appliance's iSCSI naming convention.
pub fn iscsi_target_name_for_dataset(base_iqn: &str, dataset: &DatasetPath) -> Result<IscsiTargetName> {
    IscsiTargetName::new(format!("{base_iqn}:{}", dataset.leaf().to_lowercase()))
}

/// `snap-<snapshotID>`, the label used for both regular and pre-detach snapshots.
pub fn snapshot_label(snapshot_id: &str) -> String {
    format!("snap-{snapshot_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> NameContext {
        NameContext {
            pvc_name: "my-claim".to_string(),
            pvc_namespace: "default".to_string(),
            pv_name: "pvc-abc123".to_string(),
        }
    }

    #[test]
    fn renders_dataset_path_with_parent() {
        let path = dataset_path_for_volume(
            "tank",
            Some("csi"),
            "{PVCNamespace}-{PVCName}",
            "pvc-",
            "",
            &ctx(),
        )
        .unwrap();
        assert_eq!(path.as_str(), "tank/csi/pvc-default-my-claim");
    }

    #[test]
    fn renders_dataset_path_without_parent() {
        let path = dataset_path_for_volume("tank", None, "{PVName}", "", "", &ctx()).unwrap();
        assert_eq!(path.as_str(), "tank/pvc-abc123");
    }

    #[test]
    fn rejects_traversal() {
        let err = DatasetPath::new("tank/../etc").unwrap_err();
        assert!(matches!(err, ApplianceError::InvalidArgument(_)));
    }

    #[test]
    fn nqn_derivation() {
        let path = DatasetPath::new("tank/csi/pvc-abc123").unwrap();
        let nqn = nqn_for_dataset(&path).unwrap();
        assert_eq!(nqn.as_str(), "nqn.2137.csi.tns:pvc-abc123");
    }

    #[test]
    fn iscsi_name_lowercases_leaf() {
        let path = DatasetPath::new("tank/csi/PVC-ABC123").unwrap();
        let name = iscsi_target_name_for_dataset("iqn.2005-10.org.freenas.ctl", &path).unwrap();
        assert_eq!(name.as_str(), "iqn.2005-10.org.freenas.ctl:pvc-abc123");
    }

    #[test]
    fn snapshot_label_format() {
        assert_eq!(snapshot_label("snap-id-1"), "snap-snap-id-1");
    }
}
