//! The volume engine: everything above the raw JSON-RPC client that knows
//! how to turn a CSI `CreateVolume`/`DeleteVolume`/snapshot/expand call into
//! the right sequence of `pool.dataset.*`, `sharing.nfs.*`, `nvmet.*`,
//! `iscsi.*`, and `zfs.snapshot.*` calls.

pub mod iscsi;
pub mod nfs;
pub mod nvmeof;
pub mod snapshot;
pub mod volume;

use crate::client::ApplianceClient;
use crate::naming::{DatasetPath, NameContext};
use crate::types::Protocol;

pub use snapshot::{CreateSnapshotRequest, DetachPolicy};
pub use volume::{CreateVolumeRequest, ExpandVolumeRequest, ExpandVolumeResult};

/// Static, cluster-wide configuration the engine needs for naming and for
/// choosing where new datasets/exports land. Most fields mirror a
/// StorageClass's `parameters` map but a handful (pool, templates, base
/// IQN/NQN prefix) are driver-wide and set once at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub pool: String,
    pub parent_dataset: Option<String>,
    pub name_template: String,
    pub name_prefix: String,
    pub name_suffix: String,
    pub base_iqn: String,
    pub nfs_server: String,
    pub nvme_transport_addr: String,
    pub nvme_transport_port: u16,
    pub iscsi_portal: String,
    pub detached_snapshot_dataset: String,
}

impl EngineConfig {
    pub fn name_context(&self, pvc_name: &str, pvc_namespace: &str, pv_name: &str) -> NameContext {
        NameContext {
            pvc_name: pvc_name.to_string(),
            pvc_namespace: pvc_namespace.to_string(),
            pv_name: pv_name.to_string(),
        }
    }
}

/// Entry point the CSI glue layer holds: one per process, shared across all
/// concurrent RPCs via `Arc<Engine>`.
pub struct Engine {
    pub client: ApplianceClient,
    pub config: EngineConfig,
}

impl Engine {
    pub fn new(client: ApplianceClient, config: EngineConfig) -> Self {
        Self { client, config }
    }

    pub async fn create_volume(&self, req: CreateVolumeRequest) -> crate::error::Result<crate::types::Volume> {
        volume::create_volume(self, req).await
    }

    pub async fn delete_volume(&self, volume_id: &str) -> crate::error::Result<()> {
        volume::delete_volume(self, volume_id).await
    }

    pub async fn expand_volume(&self, req: ExpandVolumeRequest) -> crate::error::Result<ExpandVolumeResult> {
        volume::expand_volume(self, req).await
    }

    pub async fn create_snapshot(
        &self,
        req: CreateSnapshotRequest,
    ) -> crate::error::Result<crate::types::Snapshot> {
        snapshot::create_snapshot(self, req).await
    }

    pub async fn delete_snapshot(&self, snapshot_id: &str) -> crate::error::Result<()> {
        snapshot::delete_snapshot(self, snapshot_id).await
    }

    /// Lists snapshots, optionally scoped to a single source volume's dataset.
    pub async fn list_snapshots(
        &self,
        source_volume_dataset: Option<&DatasetPath>,
    ) -> crate::error::Result<Vec<crate::types::Snapshot>> {
        snapshot::list_snapshots(self, source_volume_dataset).await
    }

    pub async fn list_volumes(&self) -> crate::error::Result<Vec<crate::types::Volume>> {
        volume::list_volumes(self).await
    }

    pub async fn get_capacity_bytes(&self) -> crate::error::Result<i64> {
        volume::get_capacity_bytes(self).await
    }
}

/// Dispatches to the protocol-specific export creation, used by
/// [`volume::create_volume`] once the backing dataset exists.
pub(crate) async fn create_export(
    engine: &Engine,
    protocol: Protocol,
    dataset_path: &crate::naming::DatasetPath,
) -> crate::error::Result<crate::types::AttachParams> {
    match protocol {
        Protocol::Nfs => nfs::share_dataset(engine, dataset_path).await,
        Protocol::Nvmeof => nvmeof::export_zvol(engine, dataset_path).await,
        Protocol::Iscsi => iscsi::export_zvol(engine, dataset_path).await,
    }
}

/// Dispatches to the protocol-specific export teardown. Idempotent: a
/// not-found response from the appliance is swallowed, not propagated.
pub(crate) async fn delete_export(
    engine: &Engine,
    protocol: Protocol,
    dataset_path: &crate::naming::DatasetPath,
) -> crate::error::Result<()> {
    let result = match protocol {
        Protocol::Nfs => nfs::unshare_dataset(engine, dataset_path).await,
        Protocol::Nvmeof => nvmeof::unexport_zvol(engine, dataset_path).await,
        Protocol::Iscsi => iscsi::unexport_zvol(engine, dataset_path).await,
    };
    match result {
        Err(crate::error::ApplianceError::NotFound(_)) => Ok(()),
        other => other,
    }
}
