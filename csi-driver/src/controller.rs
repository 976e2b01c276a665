//! CSI Controller Service Implementation
//!
//! Translates CreateVolume/DeleteVolume/snapshot/expand RPCs into calls
//! against the in-process appliance engine. There is no second network hop:
//! the engine itself owns the single JSON-RPC/WebSocket connection to the
//! appliance.

use std::collections::HashMap;
use std::sync::Arc;

use appliance_client::engine::{CreateSnapshotRequest, CreateVolumeRequest, DetachPolicy, Engine, ExpandVolumeRequest};
use appliance_client::types::{AttachParams, ContentSource, StorageClassParams, Volume};
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::csi;
use crate::error::to_status;

const DEFAULT_VOLUME_SIZE: i64 = 1024 * 1024 * 1024;

/// CSI Controller service, backed by a shared appliance engine handle.
pub struct ControllerService {
    engine: Arc<Engine>,
}

impl ControllerService {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    fn get_volume_size(capacity_range: Option<&csi::CapacityRange>) -> i64 {
        capacity_range
            .map(|range| {
                if range.required_bytes > 0 {
                    range.required_bytes
                } else if range.limit_bytes > 0 {
                    range.limit_bytes
                } else {
                    DEFAULT_VOLUME_SIZE
                }
            })
            .unwrap_or(DEFAULT_VOLUME_SIZE)
    }

    fn content_source(source: Option<&csi::VolumeContentSource>) -> Result<ContentSource, Status> {
        let Some(source) = source else { return Ok(ContentSource::Empty) };
        match &source.r#type {
            Some(csi::volume_content_source::Type::Snapshot(s)) => Ok(ContentSource::Snapshot {
                snapshot_id: s.snapshot_id.clone(),
            }),
            Some(csi::volume_content_source::Type::Volume(v)) => {
                let dataset = dataset_path_from_handle(&v.volume_id)?;
                Ok(ContentSource::Volume { source_volume_id: dataset })
            }
            None => Ok(ContentSource::Empty),
        }
    }

    fn volume_to_csi(volume: &Volume) -> csi::Volume {
        let mut volume_context = HashMap::new();
        volume_context.insert("protocol".to_string(), volume.protocol.to_string());
        volume_context.insert("dataset_path".to_string(), volume.dataset_path.clone());
        if let Some(fs_type) = &volume.fs_type {
            volume_context.insert("fs_type".to_string(), fs_type.clone());
        }
        match &volume.attach_params {
            AttachParams::Nfs { server, export_path } => {
                volume_context.insert("server".to_string(), server.clone());
                volume_context.insert("export_path".to_string(), export_path.clone());
            }
            AttachParams::Nvmeof { nqn, transport_addr, transport_port } => {
                volume_context.insert("nqn".to_string(), nqn.clone());
                volume_context.insert("transport_addr".to_string(), transport_addr.clone());
                volume_context.insert("transport_port".to_string(), transport_port.to_string());
            }
            AttachParams::Iscsi { iqn, portal, lun } => {
                volume_context.insert("iqn".to_string(), iqn.clone());
                volume_context.insert("portal".to_string(), portal.clone());
                volume_context.insert("lun".to_string(), lun.to_string());
            }
        }

        csi::Volume {
            capacity_bytes: volume.capacity_bytes,
            volume_id: volume.volume_id.clone(),
            volume_context,
            content_source: None,
            accessible_topology: vec![],
        }
    }

    fn snapshot_to_csi(snapshot: &appliance_client::types::Snapshot) -> csi::Snapshot {
        csi::Snapshot {
            size_bytes: snapshot.size_bytes,
            snapshot_id: snapshot.snapshot_id.clone(),
            source_volume_id: snapshot.source_volume_id.clone(),
            creation_time: snapshot.created_at,
            ready_to_use: true,
        }
    }
}

/// Extracts the dataset path component out of a `<protocol>#<server>#<dataset>`
/// volume handle, without needing the handle's protocol/server fields.
fn dataset_path_from_handle(volume_id: &str) -> Result<String, Status> {
    volume_id
        .splitn(3, '#')
        .nth(2)
        .map(str::to_string)
        .ok_or_else(|| Status::invalid_argument(format!("malformed volume id '{volume_id}'")))
}

#[tonic::async_trait]
impl csi::controller_server::Controller for ControllerService {
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> Result<Response<csi::CreateVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.name.is_empty() {
            return Err(Status::invalid_argument("volume name is required"));
        }

        let capacity_bytes = Self::get_volume_size(req.capacity_range.as_ref());
        let content_source = Self::content_source(req.volume_content_source.as_ref())?;
        let params = StorageClassParams { raw: req.parameters.clone() };

        let pvc_name = params.get("csi.storage.k8s.io/pvc/name").unwrap_or(&req.name).to_string();
        let pvc_namespace = params.get("csi.storage.k8s.io/pvc/namespace").unwrap_or("").to_string();
        let pv_name = params.get("csi.storage.k8s.io/pv/name").unwrap_or(&req.name).to_string();

        info!(name = %req.name, capacity_bytes, "CreateVolume request");

        let volume = self
            .engine
            .create_volume(CreateVolumeRequest {
                csi_volume_name: req.name.clone(),
                pvc_name,
                pvc_namespace,
                pv_name,
                capacity_bytes,
                params,
                content_source,
            })
            .await
            .map_err(to_status)?;

        info!(volume_id = %volume.volume_id, "volume created");

        Ok(Response::new(csi::CreateVolumeResponse {
            volume: Some(Self::volume_to_csi(&volume)),
        }))
    }

    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> Result<Response<csi::DeleteVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume id is required"));
        }

        info!(volume_id = %req.volume_id, "DeleteVolume request");
        match self.engine.delete_volume(&req.volume_id).await {
            Ok(()) => {}
            Err(appliance_client::ApplianceError::NotFound(_)) => {
                warn!(volume_id = %req.volume_id, "volume already gone, treating delete as successful");
            }
            Err(e) => return Err(to_status(e)),
        }

        Ok(Response::new(csi::DeleteVolumeResponse {}))
    }

    async fn controller_expand_volume(
        &self,
        request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume id is required"));
        }
        let capacity_range = req
            .capacity_range
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("capacity range is required for volume expansion"))?;
        let new_capacity_bytes = if capacity_range.required_bytes > 0 {
            capacity_range.required_bytes
        } else {
            capacity_range.limit_bytes
        };
        if new_capacity_bytes <= 0 {
            return Err(Status::invalid_argument("required or limit bytes must be positive"));
        }

        debug!(volume_id = %req.volume_id, new_capacity_bytes, "ControllerExpandVolume request");

        let result = self
            .engine
            .expand_volume(ExpandVolumeRequest {
                volume_id: req.volume_id.clone(),
                new_capacity_bytes,
            })
            .await
            .map_err(to_status)?;

        Ok(Response::new(csi::ControllerExpandVolumeResponse {
            capacity_bytes: result.capacity_bytes,
            node_expansion_required: result.node_expansion_required,
        }))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        use csi::controller_service_capability::{rpc::Type as RpcType, Rpc, Type};

        let capability = |t: RpcType| csi::ControllerServiceCapability {
            r#type: Some(Type::Rpc(Rpc { r#type: t as i32 })),
        };

        Ok(Response::new(csi::ControllerGetCapabilitiesResponse {
            capabilities: vec![
                capability(RpcType::CreateDeleteVolume),
                capability(RpcType::CreateDeleteSnapshot),
                capability(RpcType::ListSnapshots),
                capability(RpcType::ListVolumes),
                capability(RpcType::GetCapacity),
                capability(RpcType::ExpandVolume),
                capability(RpcType::CloneVolume),
            ],
        }))
    }

    async fn create_snapshot(
        &self,
        request: Request<csi::CreateSnapshotRequest>,
    ) -> Result<Response<csi::CreateSnapshotResponse>, Status> {
        let req = request.into_inner();
        if req.source_volume_id.is_empty() {
            return Err(Status::invalid_argument("source volume id is required"));
        }
        if req.name.is_empty() {
            return Err(Status::invalid_argument("snapshot name is required"));
        }

        let source_dataset = dataset_path_from_handle(&req.source_volume_id)?;
        let source_dataset = appliance_client::naming::DatasetPath::new(source_dataset)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let params = StorageClassParams { raw: req.parameters.clone() };
        let detach = if params.get_bool("detachedSnapshots") {
            DetachPolicy::Detached
        } else {
            DetachPolicy::Regular
        };

        info!(source_volume_id = %req.source_volume_id, name = %req.name, "CreateSnapshot request");

        let snapshot = self
            .engine
            .create_snapshot(CreateSnapshotRequest {
                snapshot_id: req.name.clone(),
                source_volume_dataset: source_dataset,
                detach,
            })
            .await
            .map_err(to_status)?;

        Ok(Response::new(csi::CreateSnapshotResponse {
            snapshot: Some(Self::snapshot_to_csi(&snapshot)),
        }))
    }

    async fn delete_snapshot(
        &self,
        request: Request<csi::DeleteSnapshotRequest>,
    ) -> Result<Response<csi::DeleteSnapshotResponse>, Status> {
        let req = request.into_inner();
        if req.snapshot_id.is_empty() {
            return Err(Status::invalid_argument("snapshot id is required"));
        }

        info!(snapshot_id = %req.snapshot_id, "DeleteSnapshot request");
        match self.engine.delete_snapshot(&req.snapshot_id).await {
            Ok(()) => {}
            Err(appliance_client::ApplianceError::NotFound(_)) => {
                warn!(snapshot_id = %req.snapshot_id, "snapshot already gone, treating delete as successful");
            }
            Err(e) => return Err(to_status(e)),
        }

        Ok(Response::new(csi::DeleteSnapshotResponse {}))
    }

    async fn list_snapshots(
        &self,
        request: Request<csi::ListSnapshotsRequest>,
    ) -> Result<Response<csi::ListSnapshotsResponse>, Status> {
        let req = request.into_inner();

        let source_dataset = if req.source_volume_id.is_empty() {
            None
        } else {
            Some(
                appliance_client::naming::DatasetPath::new(dataset_path_from_handle(&req.source_volume_id)?)
                    .map_err(|e| Status::invalid_argument(e.to_string()))?,
            )
        };

        let mut snapshots = self
            .engine
            .list_snapshots(source_dataset.as_ref())
            .await
            .map_err(to_status)?;

        if !req.snapshot_id.is_empty() {
            snapshots.retain(|s| s.snapshot_id == req.snapshot_id);
        }

        let entries = snapshots
            .iter()
            .map(|s| csi::list_snapshots_response::Entry {
                snapshot: Some(Self::snapshot_to_csi(s)),
            })
            .collect();

        Ok(Response::new(csi::ListSnapshotsResponse {
            entries,
            next_token: String::new(),
        }))
    }

    async fn list_volumes(
        &self,
        _request: Request<csi::ListVolumesRequest>,
    ) -> Result<Response<csi::ListVolumesResponse>, Status> {
        let volumes = self.engine.list_volumes().await.map_err(to_status)?;
        let entries = volumes
            .iter()
            .map(|v| csi::list_volumes_response::Entry {
                volume: Some(Self::volume_to_csi(v)),
                status: None,
            })
            .collect();

        Ok(Response::new(csi::ListVolumesResponse {
            entries,
            next_token: String::new(),
        }))
    }

    async fn get_capacity(
        &self,
        _request: Request<csi::GetCapacityRequest>,
    ) -> Result<Response<csi::GetCapacityResponse>, Status> {
        let available_capacity = self.engine.get_capacity_bytes().await.map_err(to_status)?;
        Ok(Response::new(csi::GetCapacityResponse { available_capacity }))
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume id is required"));
        }

        // A dataset that isn't managed by this driver doesn't validate.
        dataset_path_from_handle(&req.volume_id)?;

        Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
            confirmed: Some(csi::validate_volume_capabilities_response::Confirmed {
                volume_context: req.volume_context,
                volume_capabilities: req.volume_capabilities,
                parameters: req.parameters,
            }),
            message: String::new(),
        }))
    }

    async fn controller_publish_volume(
        &self,
        _request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        Err(Status::unimplemented("ControllerPublishVolume is not supported"))
    }

    async fn controller_unpublish_volume(
        &self,
        _request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        Err(Status::unimplemented("ControllerUnpublishVolume is not supported"))
    }

    async fn controller_get_volume(
        &self,
        _request: Request<csi::ControllerGetVolumeRequest>,
    ) -> Result<Response<csi::ControllerGetVolumeResponse>, Status> {
        Err(Status::unimplemented("ControllerGetVolume is not supported"))
    }

    async fn controller_modify_volume(
        &self,
        _request: Request<csi::ControllerModifyVolumeRequest>,
    ) -> Result<Response<csi::ControllerModifyVolumeResponse>, Status> {
        Err(Status::unimplemented("ControllerModifyVolume is not supported"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_volume_size_prefers_required_bytes() {
        let range = csi::CapacityRange {
            required_bytes: 2 * 1024 * 1024 * 1024,
            limit_bytes: 5 * 1024 * 1024 * 1024,
        };
        assert_eq!(
            ControllerService::get_volume_size(Some(&range)),
            2 * 1024 * 1024 * 1024
        );
    }

    #[test]
    fn get_volume_size_falls_back_to_limit_bytes() {
        let range = csi::CapacityRange { required_bytes: 0, limit_bytes: 5 * 1024 * 1024 * 1024 };
        assert_eq!(
            ControllerService::get_volume_size(Some(&range)),
            5 * 1024 * 1024 * 1024
        );
    }

    #[test]
    fn get_volume_size_defaults_when_unset() {
        assert_eq!(ControllerService::get_volume_size(None), DEFAULT_VOLUME_SIZE);
        let range = csi::CapacityRange { required_bytes: 0, limit_bytes: 0 };
        assert_eq!(ControllerService::get_volume_size(Some(&range)), DEFAULT_VOLUME_SIZE);
    }

    #[test]
    fn dataset_path_from_handle_extracts_third_field() {
        let path = dataset_path_from_handle("nfs#nas1.example.com#tank/csi/pvc-abc").unwrap();
        assert_eq!(path, "tank/csi/pvc-abc");
    }

    #[test]
    fn dataset_path_from_handle_rejects_malformed_id() {
        assert!(dataset_path_from_handle("not-a-handle").is_err());
    }
}
