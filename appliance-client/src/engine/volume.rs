//! `CreateVolume`/`DeleteVolume`/`ControllerExpandVolume` semantics.

use serde_json::{json, Value};

use crate::engine::{create_export, delete_export, Engine};
use crate::error::{ApplianceError, Result};
use crate::metadata::VolumeMarker;
use crate::naming::{self, DatasetPath};
use crate::retry::{retry_default, retry_deletion};
use crate::types::{AttachParams, ContentSource, Protocol, StorageClassParams, Volume};

pub struct CreateVolumeRequest {
    pub csi_volume_name: String,
    pub pvc_name: String,
    pub pvc_namespace: String,
    pub pv_name: String,
    pub capacity_bytes: i64,
    pub params: StorageClassParams,
    pub content_source: ContentSource,
}

pub struct ExpandVolumeRequest {
    pub volume_id: String,
    pub new_capacity_bytes: i64,
}

/// `<protocol>#<server>#<datasetPath>`, e.g. `nfs#nas1.example.com#tank/csi/pvc-abc`.
fn volume_handle(protocol: Protocol, server: &str, dataset: &DatasetPath) -> String {
    format!("{protocol}#{server}#{dataset}")
}

fn parse_volume_handle(volume_id: &str) -> Result<(Protocol, String, DatasetPath)> {
    let mut parts = volume_id.splitn(3, '#');
    let (Some(protocol), Some(server), Some(dataset)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(ApplianceError::InvalidArgument(format!(
            "malformed volume id '{volume_id}'"
        )));
    };
    let protocol: Protocol = protocol
        .parse()
        .map_err(|e: crate::types::ProtocolParseError| ApplianceError::InvalidArgument(e.to_string()))?;
    Ok((protocol, server.to_string(), DatasetPath::new(dataset)?))
}

fn server_for(engine: &Engine, protocol: Protocol) -> String {
    match protocol {
        Protocol::Nfs => engine.config.nfs_server.clone(),
        Protocol::Nvmeof => engine.config.nvme_transport_addr.clone(),
        Protocol::Iscsi => engine.config.iscsi_portal.clone(),
    }
}

async fn query_dataset(engine: &Engine, path: &DatasetPath) -> Result<Option<Value>> {
    let filters = json!([["id", "=", path.as_str()]]);
    let result = engine
        .client
        .call_default("pool.dataset.query", json!([filters]))
        .await?;
    Ok(result.as_array().and_then(|a| a.first()).cloned())
}

fn decode_marker(dataset: &Value) -> Option<VolumeMarker> {
    let props = dataset.get("user_properties")?.as_object()?;
    let flat = props
        .iter()
        .filter_map(|(k, v)| v.get("value").and_then(|v| v.as_str()).map(|s| (k.clone(), s.to_string())))
        .collect();
    VolumeMarker::from_properties(&flat)
}

pub async fn create_volume(engine: &Engine, req: CreateVolumeRequest) -> Result<Volume> {
    let protocol = req
        .params
        .protocol()
        .map_err(|e| ApplianceError::InvalidArgument(e.to_string()))?;
    let delete_strategy = req
        .params
        .delete_strategy()
        .map_err(|e| ApplianceError::InvalidArgument(e.to_string()))?;

    let ctx = engine
        .config
        .name_context(&req.pvc_name, &req.pvc_namespace, &req.pv_name);
    let dataset_path = naming::dataset_path_for_volume(
        &engine.config.pool,
        engine.config.parent_dataset.as_deref(),
        &engine.config.name_template,
        &engine.config.name_prefix,
        &engine.config.name_suffix,
        &ctx,
    )?;

    let mark_adoptable = req.params.get_bool("markAdoptable");
    let existing = query_dataset(engine, &dataset_path).await?;

    let adopting;
    if let Some(existing) = &existing {
        match decode_marker(existing) {
            Some(marker)
                if marker.csi_volume_name == req.csi_volume_name
                    && marker.requested_size >= req.capacity_bytes =>
            {
                // Idempotent replay: same PVC asked for the same (or smaller) size again.
                let attach_params = create_export(engine, protocol, &dataset_path).await?;
                return Ok(Volume {
                    volume_id: volume_handle(protocol, &server_for(engine, protocol), &dataset_path),
                    protocol,
                    capacity_bytes: marker.requested_size,
                    dataset_path: dataset_path.to_string(),
                    attach_params,
                    fs_type: None,
                });
            }
            Some(marker) if marker.csi_volume_name == req.csi_volume_name => {
                return Err(ApplianceError::AlreadyExists(format!(
                    "dataset '{dataset_path}' already exists with a smaller size than requested"
                )))
            }
            Some(marker)
                if marker.adoptable
                    && req.params.get_bool("adoptExisting")
                    && marker.pvc_namespace == req.pvc_namespace
                    && marker.pvc_name == req.pvc_name =>
            {
                adopting = true;
            }
            Some(_) => {
                return Err(ApplianceError::AlreadyExists(format!(
                    "dataset '{dataset_path}' is managed by a different volume"
                )))
            }
            None => {
                return Err(ApplianceError::FailedPrecondition(format!(
                    "dataset '{dataset_path}' already exists and carries no adoption marker"
                )))
            }
        }
    } else {
        adopting = false;
        create_dataset(engine, protocol, &dataset_path, req.capacity_bytes, &req.params, &req.content_source)
            .await?;
    }

    let marker = VolumeMarker {
        adoptable: mark_adoptable,
        ..VolumeMarker::new(
            req.csi_volume_name.clone(),
            req.pvc_namespace.clone(),
            req.pvc_name.clone(),
            req.capacity_bytes,
            delete_strategy,
            protocol,
        )
    };
    if let Err(e) = write_marker(engine, &dataset_path, &marker).await {
        if !adopting {
            let _ = destroy_dataset(engine, &dataset_path).await;
        }
        return Err(e);
    }

    let attach_params = match create_export(engine, protocol, &dataset_path).await {
        Ok(params) => params,
        Err(e) => {
            if !adopting {
                let _ = destroy_dataset(engine, &dataset_path).await;
            }
            return Err(e);
        }
    };

    Ok(Volume {
        volume_id: volume_handle(protocol, &server_for(engine, protocol), &dataset_path),
        protocol,
        capacity_bytes: req.capacity_bytes,
        dataset_path: dataset_path.to_string(),
        attach_params,
        fs_type: None,
    })
}

async fn create_dataset(
    engine: &Engine,
    protocol: Protocol,
    path: &DatasetPath,
    capacity_bytes: i64,
    params: &StorageClassParams,
    content_source: &ContentSource,
) -> Result<()> {
    match content_source {
        ContentSource::Empty => {
            let dataset_type = if matches!(protocol, Protocol::Nfs) { "FILESYSTEM" } else { "VOLUME" };
            let mut body = serde_json::Map::new();
            body.insert("name".into(), json!(path.as_str()));
            body.insert("type".into(), json!(dataset_type));
            if dataset_type == "VOLUME" {
                body.insert("volsize".into(), json!(capacity_bytes));
                body.insert("sparse".into(), json!(true));
            } else {
                body.insert("quota".into(), json!(capacity_bytes));
            }
            for (k, v) in params.zfs_properties() {
                body.insert(k, json!(v));
            }
            if let Some(enc) = params.encryption() {
                body.insert("encryption".into(), json!(true));
                let mut opts = serde_json::Map::new();
                opts.insert("generate_key".into(), json!(enc.generate_key));
                if let Some(algorithm) = &enc.algorithm {
                    opts.insert("algorithm".into(), json!(algorithm));
                }
                body.insert("encryption_options".into(), Value::Object(opts));
            }
            let body = Value::Object(body);
            retry_default(|| {
                let body = body.clone();
                async { engine.client.call_default("pool.dataset.create", json!([body])).await }
            })
            .await?;
            Ok(())
        }
        ContentSource::Snapshot { snapshot_id } | ContentSource::Volume { source_volume_id: snapshot_id } => {
            let is_clone_from_volume = matches!(content_source, ContentSource::Volume { .. });
            let snap_name = if is_clone_from_volume {
                // CreateVolume-from-volume clones a fresh transient snapshot of the source first.
                let label = naming::snapshot_label(&uuid::Uuid::new_v4().to_string());
                let create_params = json!({ "dataset": snapshot_id, "name": label });
                retry_default(|| {
                    let create_params = create_params.clone();
                    async { engine.client.call_default("zfs.snapshot.create", json!([create_params])).await }
                })
                .await?;
                format!("{snapshot_id}@{label}")
            } else {
                snapshot_id.clone()
            };

            let clone_params = json!({ "snapshot": snap_name, "dataset_dst": path.as_str() });
            retry_default(|| {
                let clone_params = clone_params.clone();
                async { engine.client.call_default("zfs.snapshot.clone", json!([clone_params])).await }
            })
            .await?;

            // A plain restore-from-snapshot stays a live clone with its origin
            // link intact unless the StorageClass asked to sever it; cloning
            // from a PVC always promotes since the transient snapshot below is
            // about to be deleted out from under the clone anyway.
            if is_clone_from_volume || params.get_bool("detached") {
                retry_default(|| async {
                    engine.client.call_default("pool.dataset.promote", json!([path.as_str()])).await
                })
                .await?;
            }

            if is_clone_from_volume {
                retry_default(|| {
                    let snap_name = snap_name.clone();
                    async { engine.client.call_default("zfs.snapshot.delete", json!([snap_name])).await }
                })
                .await?;
            }

            Ok(())
        }
    }
}

async fn write_marker(engine: &Engine, path: &DatasetPath, marker: &VolumeMarker) -> Result<()> {
    let props: serde_json::Map<String, Value> = marker
        .to_properties()
        .into_iter()
        .map(|(k, v)| (k, json!({ "value": v })))
        .collect();
    let body = json!({ "user_properties": Value::Object(props) });
    retry_default(|| {
        let body = body.clone();
        async {
            engine
                .client
                .call_default("pool.dataset.update", json!([path.as_str(), body]))
                .await
        }
    })
    .await?;
    Ok(())
}

async fn destroy_dataset(engine: &Engine, path: &DatasetPath) -> Result<()> {
    retry_deletion(|| async {
        engine
            .client
            .call_default("pool.dataset.delete", json!([path.as_str(), { "recursive": true }]))
            .await
    })
    .await
}

pub async fn delete_volume(engine: &Engine, volume_id: &str) -> Result<()> {
    let (protocol, _server, dataset_path) = parse_volume_handle(volume_id)?;

    let Some(existing) = query_dataset(engine, &dataset_path).await? else {
        // Already gone: DeleteVolume is idempotent.
        return Ok(());
    };

    delete_export(engine, protocol, &dataset_path).await?;

    let retain = decode_marker(&existing)
        .map(|m| m.delete_strategy == crate::types::DeleteStrategy::Retain)
        .unwrap_or(false);
    if retain {
        return Ok(());
    }

    destroy_dataset(engine, &dataset_path).await
}

/// Result of [`expand_volume`]: the capacity now recorded on the backend, and
/// whether the node plugin still needs to grow a filesystem on top of it.
/// NFS quotas take effect immediately; block devices need `NodeExpandVolume`
/// to observe the larger device and resize in place.
pub struct ExpandVolumeResult {
    pub capacity_bytes: i64,
    pub node_expansion_required: bool,
}

pub async fn expand_volume(engine: &Engine, req: ExpandVolumeRequest) -> Result<ExpandVolumeResult> {
    let (protocol, _server, dataset_path) = parse_volume_handle(&req.volume_id)?;
    let node_expansion_required = !matches!(protocol, Protocol::Nfs);
    let existing = query_dataset(engine, &dataset_path)
        .await?
        .ok_or_else(|| ApplianceError::NotFound(format!("volume '{}' not found", req.volume_id)))?;

    let marker = decode_marker(&existing);
    if let Some(marker) = &marker {
        if req.new_capacity_bytes <= marker.requested_size {
            // Idempotent replay: already at or beyond the requested size.
            return Ok(ExpandVolumeResult {
                capacity_bytes: marker.requested_size,
                node_expansion_required: false,
            });
        }
    }

    let field = if matches!(protocol, Protocol::Nfs) { "quota" } else { "volsize" };
    let body = json!({ field: req.new_capacity_bytes });
    retry_default(|| {
        let body = body.clone();
        async {
            engine
                .client
                .call_default("pool.dataset.update", json!([dataset_path.as_str(), body]))
                .await
        }
    })
    .await?;

    if let Some(mut marker) = marker {
        marker.requested_size = req.new_capacity_bytes;
        write_marker(engine, &dataset_path, &marker).await?;
    }

    Ok(ExpandVolumeResult {
        capacity_bytes: req.new_capacity_bytes,
        node_expansion_required,
    })
}

pub async fn list_volumes(engine: &Engine) -> Result<Vec<Volume>> {
    let filters = json!([["user_properties.tns-csi:managed-by.value", "=", "tns-csi"]]);
    let result = engine
        .client
        .call_default("pool.dataset.query", json!([filters]))
        .await?;
    let datasets = result.as_array().cloned().unwrap_or_default();

    let mut volumes = Vec::with_capacity(datasets.len());
    for dataset in datasets {
        let Some(marker) = decode_marker(&dataset) else { continue };
        let Some(id) = dataset.get("id").and_then(|v| v.as_str()) else { continue };
        let Ok(dataset_path) = DatasetPath::new(id) else { continue };
        let server = server_for(engine, marker.protocol);
        let attach_params = match marker.protocol {
            Protocol::Nfs => AttachParams::Nfs {
                server: server.clone(),
                export_path: format!("/mnt/{dataset_path}"),
            },
            Protocol::Nvmeof => AttachParams::Nvmeof {
                nqn: naming::nqn_for_dataset(&dataset_path)?.to_string(),
                transport_addr: engine.config.nvme_transport_addr.clone(),
                transport_port: engine.config.nvme_transport_port,
            },
            Protocol::Iscsi => AttachParams::Iscsi {
                iqn: naming::iscsi_target_name_for_dataset(&engine.config.base_iqn, &dataset_path)?.to_string(),
                portal: engine.config.iscsi_portal.clone(),
                lun: 0,
            },
        };
        volumes.push(Volume {
            volume_id: volume_handle(marker.protocol, &server, &dataset_path),
            protocol: marker.protocol,
            capacity_bytes: marker.requested_size,
            dataset_path: dataset_path.to_string(),
            attach_params,
            fs_type: None,
        });
    }
    Ok(volumes)
}

pub async fn get_capacity_bytes(engine: &Engine) -> Result<i64> {
    let filters = json!([["name", "=", engine.config.pool]]);
    let result = engine.client.call_default("pool.query", json!([filters])).await?;
    Ok(result
        .as_array()
        .and_then(|a| a.first())
        .and_then(|p| p.get("free"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_handle_roundtrips() {
        let path = DatasetPath::new("tank/csi/pvc-abc").unwrap();
        let handle = volume_handle(Protocol::Nfs, "nas1.example.com", &path);
        assert_eq!(handle, "nfs#nas1.example.com#tank/csi/pvc-abc");
        let (protocol, server, parsed) = parse_volume_handle(&handle).unwrap();
        assert_eq!(protocol, Protocol::Nfs);
        assert_eq!(server, "nas1.example.com");
        assert_eq!(parsed, path);
    }

    #[test]
    fn rejects_malformed_handle() {
        assert!(parse_volume_handle("not-a-handle").is_err());
    }
}
