//! iSCSI export lifecycle: target, extent, and target-extent binding at LUN
//! 0, backed by `iscsi.target.*`, `iscsi.extent.*`, and `iscsi.targetextent.*`.

use serde_json::json;

use crate::engine::Engine;
use crate::error::{ApplianceError, Result};
use crate::naming::{self, DatasetPath};
use crate::retry::retry_default;
use crate::types::AttachParams;

const LUN: u32 = 0;

async fn find_target_id(engine: &Engine, name: &str) -> Result<Option<i64>> {
    let filters = json!([["name", "=", name]]);
    let result = engine.client.call_default("iscsi.target.query", json!([filters])).await?;
    Ok(result
        .as_array()
        .and_then(|a| a.first())
        .and_then(|t| t.get("id"))
        .and_then(|id| id.as_i64()))
}

async fn find_extent_id(engine: &Engine, path: &DatasetPath) -> Result<Option<i64>> {
    let filters = json!([["disk", "=", format!("zvol/{}", path.as_str())]]);
    let result = engine.client.call_default("iscsi.extent.query", json!([filters])).await?;
    Ok(result
        .as_array()
        .and_then(|a| a.first())
        .and_then(|e| e.get("id"))
        .and_then(|id| id.as_i64()))
}

pub async fn export_zvol(engine: &Engine, path: &DatasetPath) -> Result<AttachParams> {
    let target_name = naming::iscsi_target_name_for_dataset(&engine.config.base_iqn, path)?;

    let target_id = match find_target_id(engine, target_name.as_str()).await? {
        Some(id) => id,
        None => {
            let params = json!({ "name": target_name.as_str() });
            let result = retry_default(|| {
                let params = params.clone();
                async { engine.client.call_default("iscsi.target.create", json!([params])).await }
            })
            .await?;
            result
                .get("id")
                .and_then(|v| v.as_i64())
                .ok_or_else(|| ApplianceError::ApiPermanent("iscsi.target.create returned no id".into()))?
        }
    };

    let extent_id = match find_extent_id(engine, path).await? {
        Some(id) => id,
        None => {
            let params = json!({
                "name": path.leaf(),
                "type": "DISK",
                "disk": format!("zvol/{}", path.as_str()),
            });
            match retry_default(|| {
                let params = params.clone();
                async { engine.client.call_default("iscsi.extent.create", json!([params])).await }
            })
            .await
            {
                Ok(result) => result
                    .get("id")
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| ApplianceError::ApiPermanent("iscsi.extent.create returned no id".into()))?,
                Err(e) => {
                    let _ = retry_default(|| async {
                        engine.client.call_default("iscsi.target.delete", json!([target_id])).await
                    })
                    .await;
                    return Err(e);
                }
            }
        }
    };

    let bind_filters = json!([["target", "=", target_id], ["extent", "=", extent_id]]);
    let existing_bind = engine
        .client
        .call_default("iscsi.targetextent.query", json!([bind_filters]))
        .await?;
    if existing_bind.as_array().map(Vec::is_empty).unwrap_or(true) {
        let params = json!({ "target": target_id, "extent": extent_id, "lunid": LUN });
        retry_default(|| {
            let params = params.clone();
            async { engine.client.call_default("iscsi.targetextent.create", json!([params])).await }
        })
        .await?;
    }

    Ok(AttachParams::Iscsi {
        iqn: target_name.to_string(),
        portal: engine.config.iscsi_portal.clone(),
        lun: LUN,
    })
}

pub async fn unexport_zvol(engine: &Engine, path: &DatasetPath) -> Result<()> {
    let target_name = naming::iscsi_target_name_for_dataset(&engine.config.base_iqn, path)?;
    let Some(target_id) = find_target_id(engine, target_name.as_str()).await? else {
        return Err(ApplianceError::NotFound(format!("no iSCSI target for {target_name}")));
    };
    let extent_id = find_extent_id(engine, path).await?;

    // Deleting the target cascades to its target-extent bindings.
    retry_default(|| async { engine.client.call_default("iscsi.target.delete", json!([target_id])).await })
        .await?;

    if let Some(extent_id) = extent_id {
        retry_default(|| async {
            engine.client.call_default("iscsi.extent.delete", json!([extent_id])).await
        })
        .await?;
    }
    Ok(())
}
