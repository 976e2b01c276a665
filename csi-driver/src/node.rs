//! CSI Node Service Implementation
//!
//! Implements the two-phase stage/publish attachment model: staging connects
//! the backing transport (NFS mount, NVMe-oF/iSCSI block device) at a
//! node-global path; publishing bind-mounts that staging path into the
//! pod-specific target. All operations are idempotent: re-issuing a stage
//! or publish against state that's already in place returns success.

use std::collections::HashMap;
use std::process::Command;
use std::sync::Arc;

use tokio::sync::Mutex;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::csi;
use crate::platform::{Platform, StorageOps};

const CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
const CONNECT_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(500);

/// What a staged volume was connected as, recorded so `NodeUnstageVolume`
/// (given only a `volume_id` and staging path, no `volume_context`) can
/// decide whether it's safe to disconnect the transport. This table lives
/// in memory only and does not survive a node-plugin restart. A dangling
/// transport left behind by a crash is reconciled the next time that
/// target is staged or unstaged.
#[derive(Debug, Clone)]
struct Attachment {
    protocol: String,
    target: String,
    device: Option<String>,
    fs_type: String,
}

/// CSI Node Service
pub struct NodeService {
    node_id: String,
    attachments: Mutex<HashMap<String, Attachment>>,
    volume_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl NodeService {
    pub fn new(node_id: String) -> Self {
        Self {
            node_id,
            attachments: Mutex::new(HashMap::new()),
            volume_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the per-volume mutex, creating it if this is the first time
    /// `volume_id` has been seen. Guards the connect/format/mount sequence
    /// in stage and the unmount/disconnect sequence in unstage so concurrent
    /// RPCs for the same volume serialize instead of racing on the same
    /// device.
    async fn lock_for(&self, volume_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.volume_locks.lock().await;
        locks
            .entry(volume_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn validate_path(path: &str) -> Result<(), Status> {
    if path.is_empty() {
        return Err(Status::invalid_argument("path must not be empty"));
    }
    if !path.starts_with('/') {
        return Err(Status::invalid_argument("path must be absolute"));
    }
    if path.contains("..") {
        return Err(Status::invalid_argument("path must not contain '..'"));
    }
    Ok(())
}

fn require(volume_context: &HashMap<String, String>, key: &str) -> Result<String, Status> {
    volume_context
        .get(key)
        .cloned()
        .ok_or_else(|| Status::invalid_argument(format!("volume_context missing '{key}'")))
}

fn mount_fs_type(capability: Option<&csi::VolumeCapability>) -> Option<String> {
    let access_type = capability?.access_type.as_ref()?;
    match access_type {
        csi::volume_capability::AccessType::Mount(m) if !m.fs_type.is_empty() => {
            Some(m.fs_type.clone())
        }
        _ => None,
    }
}

fn mount_flags(capability: Option<&csi::VolumeCapability>) -> Vec<String> {
    match capability.and_then(|c| c.access_type.as_ref()) {
        Some(csi::volume_capability::AccessType::Mount(m)) => m.mount_flags.clone(),
        _ => vec![],
    }
}

/// Waits, up to `CONNECT_TIMEOUT`, for `find` to successfully resolve a
/// device path. NVMe-oF and iSCSI logins return before the kernel has
/// necessarily enumerated the namespace/LUN, so staging polls rather than
/// trusting the connect call's return to mean the device node exists.
async fn wait_for_device(find: impl Fn() -> Result<String, Status>) -> Result<String, Status> {
    let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
    loop {
        match find() {
            Ok(device) => return Ok(device),
            Err(e) => {
                if tokio::time::Instant::now() >= deadline {
                    return Err(e);
                }
                tokio::time::sleep(CONNECT_POLL_INTERVAL).await;
            }
        }
    }
}

/// Connects the NVMe-oF or iSCSI transport for `protocol` if not already
/// connected, waits for the device node, formats it if it has no
/// filesystem yet, and returns the resolved device path.
async fn stage_block_device(
    protocol: &str,
    target: &str,
    portal_or_addr: Option<&str>,
    port: Option<&str>,
    fs_type: &str,
) -> Result<String, Status> {
    let device = match protocol {
        "iscsi" => {
            if !Platform::is_iscsi_connected(target) {
                Platform::connect_iscsi(target, portal_or_addr)?;
            }
            wait_for_device(|| Platform::find_iscsi_device(target)).await?
        }
        "nvmeof" => {
            if !Platform::is_nvmeof_connected(target) {
                Platform::connect_nvmeof(target, portal_or_addr, port)?;
            }
            wait_for_device(|| Platform::find_nvmeof_device(target)).await?
        }
        other => return Err(Status::invalid_argument(format!("unsupported protocol '{other}'"))),
    };

    if Platform::needs_formatting(&device)? {
        info!(device = %device, fs_type = %fs_type, "device has no filesystem, formatting");
        Platform::format_device(&device, fs_type)?;
    }

    Ok(device)
}

#[tonic::async_trait]
impl csi::node_server::Node for NodeService {
    async fn node_stage_volume(
        &self,
        request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume_id is required"));
        }
        validate_path(&req.staging_target_path)?;

        let lock = self.lock_for(&req.volume_id).await;
        let _guard = lock.lock().await;

        if Platform::is_mounted(&req.staging_target_path)? {
            debug!(volume_id = %req.volume_id, "already staged, returning success");
            return Ok(Response::new(csi::NodeStageVolumeResponse {}));
        }

        let protocol = require(&req.volume_context, "protocol")?;
        let fs_type = mount_fs_type(req.volume_capability.as_ref())
            .unwrap_or_else(|| Platform::default_fs_type().to_string());

        let attachment = match protocol.as_str() {
            "nfs" => {
                // Stage is a no-op for NFS: the export is mounted directly
                // at publish time, there is nothing node-global to prepare.
                Attachment {
                    protocol,
                    target: require(&req.volume_context, "server")?,
                    device: None,
                    fs_type,
                }
            }
            "iscsi" => {
                let iqn = require(&req.volume_context, "iqn")?;
                let portal = req.volume_context.get("portal").cloned();
                let device =
                    stage_block_device("iscsi", &iqn, portal.as_deref(), None, &fs_type).await?;
                Platform::mount_device(&device, &req.staging_target_path, &fs_type)?;
                Attachment {
                    protocol,
                    target: iqn,
                    device: Some(device),
                    fs_type,
                }
            }
            "nvmeof" => {
                let nqn = require(&req.volume_context, "nqn")?;
                let addr = req.volume_context.get("transport_addr").cloned();
                let port = req.volume_context.get("transport_port").cloned();
                let device = stage_block_device(
                    "nvmeof",
                    &nqn,
                    addr.as_deref(),
                    port.as_deref(),
                    &fs_type,
                )
                .await?;
                Platform::mount_device(&device, &req.staging_target_path, &fs_type)?;
                Attachment {
                    protocol,
                    target: nqn,
                    device: Some(device),
                    fs_type,
                }
            }
            other => return Err(Status::invalid_argument(format!("unsupported protocol '{other}'"))),
        };

        self.attachments
            .lock()
            .await
            .insert(req.volume_id.clone(), attachment);

        Ok(Response::new(csi::NodeStageVolumeResponse {}))
    }

    async fn node_unstage_volume(
        &self,
        request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume_id is required"));
        }
        validate_path(&req.staging_target_path)?;

        let lock = self.lock_for(&req.volume_id).await;
        let _guard = lock.lock().await;

        Platform::unmount(&req.staging_target_path)?;

        let mut attachments = self.attachments.lock().await;
        let Some(removed) = attachments.remove(&req.volume_id) else {
            // No record of this volume: either it was NFS (nothing to
            // disconnect) or the plugin restarted since staging. Unmounting
            // the staging path above is all that's required either way.
            debug!(volume_id = %req.volume_id, "no attachment record on unstage, skipping disconnect");
            return Ok(Response::new(csi::NodeUnstageVolumeResponse {}));
        };

        let still_referenced = attachments
            .values()
            .any(|a| a.protocol == removed.protocol && a.target == removed.target);
        drop(attachments);

        if still_referenced {
            debug!(target = %removed.target, "other volumes still reference this transport, skipping disconnect");
            return Ok(Response::new(csi::NodeUnstageVolumeResponse {}));
        }

        match removed.protocol.as_str() {
            "iscsi" => Platform::disconnect_iscsi(&removed.target)?,
            "nvmeof" => Platform::disconnect_nvmeof(&removed.target)?,
            _ => {}
        }

        Ok(Response::new(csi::NodeUnstageVolumeResponse {}))
    }

    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume_id is required"));
        }
        validate_path(&req.target_path)?;

        if Platform::is_mounted(&req.target_path)? {
            debug!(volume_id = %req.volume_id, "already published, returning success");
            return Ok(Response::new(csi::NodePublishVolumeResponse {}));
        }

        let protocol = require(&req.volume_context, "protocol")?;
        if protocol == "nfs" {
            let server = require(&req.volume_context, "server")?;
            let export_path = require(&req.volume_context, "export_path")?;
            let options = mount_flags(req.volume_capability.as_ref());
            Platform::mount_nfs(&server, &export_path, &req.target_path, &options)?;
        } else {
            validate_path(&req.staging_target_path)?;
            Platform::bind_mount(&req.staging_target_path, &req.target_path)?;
        }

        if req.readonly {
            let flags = mount_flags(req.volume_capability.as_ref());
            debug!(target_path = %req.target_path, ?flags, "readonly publish requested");
            let output = Command::new("mount")
                .args(["-o", "remount,ro", &req.target_path])
                .output()
                .map_err(|e| Status::internal(format!("failed to remount readonly: {e}")))?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(Status::internal(format!("readonly remount failed: {stderr}")));
            }
        }

        Ok(Response::new(csi::NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume_id is required"));
        }
        validate_path(&req.target_path)?;

        Platform::unmount(&req.target_path)?;

        Ok(Response::new(csi::NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_volume_stats(
        &self,
        request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume_id is required"));
        }
        let path = if !req.volume_path.is_empty() {
            &req.volume_path
        } else {
            &req.staging_target_path
        };
        validate_path(path)?;

        if !Platform::is_mounted(path)? {
            return Err(Status::not_found(format!("{path} is not mounted")));
        }

        let (bytes_total, bytes_used, bytes_available) = disk_usage_bytes(path)?;
        let (inodes_total, inodes_used, inodes_available) = inode_usage(path)?;

        Ok(Response::new(csi::NodeGetVolumeStatsResponse {
            usage: vec![
                csi::VolumeUsage {
                    available: bytes_available,
                    total: bytes_total,
                    used: bytes_used,
                    unit: csi::volume_usage::Unit::Bytes as i32,
                },
                csi::VolumeUsage {
                    available: inodes_available,
                    total: inodes_total,
                    used: inodes_used,
                    unit: csi::volume_usage::Unit::Inodes as i32,
                },
            ],
            volume_condition: None,
        }))
    }

    async fn node_expand_volume(
        &self,
        request: Request<csi::NodeExpandVolumeRequest>,
    ) -> Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume_id is required"));
        }
        let path = if !req.volume_path.is_empty() {
            &req.volume_path
        } else {
            &req.staging_target_path
        };
        validate_path(path)?;

        let attachments = self.attachments.lock().await;
        let attachment = attachments.get(&req.volume_id).cloned();
        drop(attachments);

        let Some(attachment) = attachment else {
            return Err(Status::failed_precondition(format!(
                "no attachment record for volume '{}'; restage the volume before expanding",
                req.volume_id
            )));
        };

        let fs_type = mount_fs_type(req.volume_capability.as_ref()).unwrap_or(attachment.fs_type);

        if let Some(device) = &attachment.device {
            Platform::rescan_device(device, &attachment.protocol)?;
            Platform::resize_filesystem(device, path, &fs_type)?;
        }

        let (capacity_bytes, _, _) = disk_usage_bytes(path)?;
        Ok(Response::new(csi::NodeExpandVolumeResponse { capacity_bytes }))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        use csi::node_service_capability::{rpc::Type as RpcType, Rpc, Type};

        let capability = |t: RpcType| csi::NodeServiceCapability {
            r#type: Some(Type::Rpc(Rpc { r#type: t as i32 })),
        };

        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities: vec![
                capability(RpcType::StageUnstageVolume),
                capability(RpcType::GetVolumeStats),
                capability(RpcType::ExpandVolume),
            ],
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: 0,
            accessible_topology: None,
        }))
    }
}

/// Parses `df -Pk <path>` output for total/used/available bytes.
fn disk_usage_bytes(path: &str) -> Result<(i64, i64, i64), Status> {
    let output = Command::new("df")
        .args(["-Pk", path])
        .output()
        .map_err(|e| Status::internal(format!("failed to execute df: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Status::internal(format!("df failed: {stderr}")));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let fields = stdout
        .lines()
        .nth(1)
        .map(|line| line.split_whitespace().collect::<Vec<_>>())
        .ok_or_else(|| Status::internal("unexpected df output"))?;
    if fields.len() < 4 {
        return Err(Status::internal("unexpected df output"));
    }
    let kb_total: i64 = fields[1].parse().unwrap_or(0);
    let kb_used: i64 = fields[2].parse().unwrap_or(0);
    let kb_available: i64 = fields[3].parse().unwrap_or(0);
    Ok((kb_total * 1024, kb_used * 1024, kb_available * 1024))
}

/// Parses `df -Pi <path>` output for total/used/available inode counts.
fn inode_usage(path: &str) -> Result<(i64, i64, i64), Status> {
    let output = Command::new("df")
        .args(["-Pi", path])
        .output()
        .map_err(|e| Status::internal(format!("failed to execute df: {e}")))?;
    if !output.status.success() {
        // Inode reporting isn't universal (some filesystems report 0/0);
        // treat failure to query it as "unknown" rather than fatal.
        warn!(path = %path, "df -Pi failed, reporting zero inode usage");
        return Ok((0, 0, 0));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let fields = stdout
        .lines()
        .nth(1)
        .map(|line| line.split_whitespace().collect::<Vec<_>>())
        .unwrap_or_default();
    if fields.len() < 4 {
        return Ok((0, 0, 0));
    }
    let total: i64 = fields[1].parse().unwrap_or(0);
    let used: i64 = fields[2].parse().unwrap_or(0);
    let available: i64 = fields[3].parse().unwrap_or(0);
    Ok((total, used, available))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_path_rejects_empty() {
        assert!(validate_path("").is_err());
    }

    #[test]
    fn validate_path_rejects_relative() {
        assert!(validate_path("var/lib").is_err());
    }

    #[test]
    fn validate_path_rejects_traversal() {
        assert!(validate_path("/var/../etc").is_err());
    }

    #[test]
    fn validate_path_accepts_absolute() {
        assert!(validate_path("/var/lib/kubelet/plugins/tns.csi.io/staging/vol1").is_ok());
    }

    #[test]
    fn require_returns_missing_key_as_invalid_argument() {
        let ctx = HashMap::new();
        let err = require(&ctx, "protocol").unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn node_get_info_reports_configured_node_id() {
        let service = NodeService::new("node-1".to_string());
        let response = csi::node_server::Node::node_get_info(&service, Request::new(csi::NodeGetInfoRequest {}))
            .await
            .unwrap();
        assert_eq!(response.into_inner().node_id, "node-1");
    }

    #[tokio::test]
    async fn node_get_capabilities_reports_stage_stats_expand() {
        let service = NodeService::new("node-1".to_string());
        let response = csi::node_server::Node::node_get_capabilities(
            &service,
            Request::new(csi::NodeGetCapabilitiesRequest {}),
        )
        .await
        .unwrap();
        assert_eq!(response.into_inner().capabilities.len(), 3);
    }

    #[tokio::test]
    async fn lock_for_returns_the_same_mutex_for_repeated_calls() {
        let service = NodeService::new("node-1".to_string());
        let a = service.lock_for("vol-1").await;
        let b = service.lock_for("vol-1").await;
        assert!(Arc::ptr_eq(&a, &b));
    }
}
