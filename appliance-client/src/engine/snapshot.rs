//! Snapshot creation/deletion, including the detached-snapshot path that
//! replicates a point-in-time copy out of the live dataset tree so it
//! survives the source volume's deletion.

use serde_json::{json, Value};

use crate::engine::Engine;
use crate::error::{ApplianceError, Result};
use crate::naming::{self, DatasetPath};
use crate::retry::{retry_default, retry_deletion};
use crate::types::Snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachPolicy {
    Regular,
    Detached,
}

pub struct CreateSnapshotRequest {
    pub snapshot_id: String,
    pub source_volume_dataset: DatasetPath,
    pub detach: DetachPolicy,
}

pub async fn create_snapshot(engine: &Engine, req: CreateSnapshotRequest) -> Result<Snapshot> {
    let label = naming::snapshot_label(&req.snapshot_id);
    let full_name = format!("{}@{}", req.source_volume_dataset, label);

    let existing = engine
        .client
        .call_default("zfs.snapshot.query", json!([[["id", "=", full_name]]]))
        .await?;
    if existing.as_array().map(Vec::is_empty).unwrap_or(true) {
        let params = json!({ "dataset": req.source_volume_dataset.as_str(), "name": label });
        retry_default(|| {
            let params = params.clone();
            async { engine.client.call_default("zfs.snapshot.create", json!([params])).await }
        })
        .await?;
    }

    match req.detach {
        DetachPolicy::Regular => {
            let stat = query_snapshot(engine, &full_name).await?;
            Ok(Snapshot {
                snapshot_id: full_name,
                source_volume_id: req.source_volume_dataset.to_string(),
                created_at: creation_timestamp(stat.as_ref()),
                size_bytes: used_bytes(stat.as_ref()),
                detached: false,
            })
        }
        DetachPolicy::Detached => {
            let detached_path = DatasetPath::new(format!(
                "{}/{}",
                engine.config.detached_snapshot_dataset, req.snapshot_id
            ))?;
            let params = json!({
                "naming_schema": detached_path.as_str(),
                "transport": "LOCAL",
                "source_datasets": [req.source_volume_dataset.as_str()],
                "name_pattern": full_name,
            });
            retry_default(|| {
                let params = params.clone();
                async { engine.client.call_default("replication.run_onetime", json!([params])).await }
            })
            .await?;

            poll_job_completion(engine, &req.snapshot_id).await?;

            let stat = query_snapshot(engine, detached_path.as_str()).await?;
            Ok(Snapshot {
                snapshot_id: detached_path.to_string(),
                source_volume_id: req.source_volume_dataset.to_string(),
                created_at: creation_timestamp(stat.as_ref()),
                size_bytes: used_bytes(stat.as_ref()),
                detached: true,
            })
        }
    }
}

/// Lists all detached snapshots (those living under the driver's detached
/// snapshot dataset) plus regular snapshots whose source is still present,
/// by scanning `zfs.snapshot.query` for entries named `snap-*` under the
/// managed pool tree.
pub async fn list_snapshots(engine: &Engine, source_volume_dataset: Option<&DatasetPath>) -> Result<Vec<Snapshot>> {
    let filters = match source_volume_dataset {
        Some(dataset) => json!([["id", "^", format!("{dataset}@")]]),
        None => json!([["id", "~", format!("^{}/", engine.config.pool)]]),
    };
    let result = engine.client.call_default("zfs.snapshot.query", json!([filters])).await?;
    let entries = result.as_array().cloned().unwrap_or_default();

    let mut snapshots = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(id) = entry.get("id").and_then(|v| v.as_str()) else { continue };
        let detached = id.starts_with(&format!("{}/", engine.config.detached_snapshot_dataset));
        let source_volume_id = match id.split_once('@') {
            Some((dataset, _label)) => dataset.to_string(),
            None => engine.config.detached_snapshot_dataset.clone(),
        };
        snapshots.push(Snapshot {
            snapshot_id: id.to_string(),
            source_volume_id,
            created_at: creation_timestamp(Some(&entry)),
            size_bytes: used_bytes(Some(&entry)),
            detached,
        });
    }
    Ok(snapshots)
}

pub async fn delete_snapshot(engine: &Engine, snapshot_id: &str) -> Result<()> {
    // snapshot_id is either `dataset@snap-<id>` (regular) or a detached
    // dataset path (`pool/csi-detached-snapshots/<id>`); both are destroyed
    // the same way on the appliance side.
    retry_deletion(|| async {
        engine
            .client
            .call_default("zfs.snapshot.delete", json!([snapshot_id]))
            .await
    })
    .await
}

async fn query_snapshot(engine: &Engine, name: &str) -> Result<Option<Value>> {
    let result = engine
        .client
        .call_default("zfs.snapshot.query", json!([[["id", "=", name]], { "extra": { "retention": false } }]))
        .await?;
    Ok(result.as_array().and_then(|a| a.first()).cloned())
}

fn property_i64(stat: Option<&Value>, name: &str) -> i64 {
    stat.and_then(|s| s.get("properties"))
        .and_then(|p| p.get(name))
        .and_then(|u| u.get("parsed"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0)
}

fn used_bytes(stat: Option<&Value>) -> i64 {
    property_i64(stat, "used")
}

/// The appliance reports each ZFS object's creation time as a `creation`
/// property; the driver trusts that over its own clock so restarts and
/// replayed `CreateSnapshot` calls report a stable value.
fn creation_timestamp(stat: Option<&Value>) -> i64 {
    property_i64(stat, "creation")
}

/// Polls `core.get_jobs` at roughly 1s cadence until the replication job
/// tied to this snapshot id finishes, per the appliance's async-job pattern.
async fn poll_job_completion(engine: &Engine, snapshot_id: &str) -> Result<()> {
    for _ in 0..300 {
        let jobs = engine.client.call_default("core.get_jobs", json!([])).await?;
        let Some(jobs) = jobs.as_array() else { break };
        let matching = jobs.iter().find(|j| {
            j.get("arguments")
                .and_then(|a| a.as_array())
                .map(|a| a.iter().any(|v| v.to_string().contains(snapshot_id)))
                .unwrap_or(false)
        });
        match matching.and_then(|j| j.get("state")).and_then(|s| s.as_str()) {
            Some("SUCCESS") => return Ok(()),
            Some("FAILED") | Some("ABORTED") => {
                return Err(ApplianceError::ApiPermanent(format!(
                    "detached snapshot replication job failed for {snapshot_id}"
                )))
            }
            _ => {}
        }
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }
    Err(ApplianceError::ApiRetryable(format!(
        "timed out waiting for detached snapshot replication job for {snapshot_id}"
    )))
}
