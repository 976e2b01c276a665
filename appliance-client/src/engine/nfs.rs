//! NFS share lifecycle, backed by `sharing.nfs.*`.

use serde_json::json;

use crate::engine::Engine;
use crate::error::{ApplianceError, Result};
use crate::naming::DatasetPath;
use crate::retry::retry_default;
use crate::types::AttachParams;

async fn find_share_id(engine: &Engine, path: &DatasetPath) -> Result<Option<i64>> {
    let filters = json!([["path", "=", format!("/mnt/{}", path.as_str())]]);
    let result = engine
        .client
        .call_default("sharing.nfs.query", json!([filters]))
        .await?;
    let shares = result.as_array().cloned().unwrap_or_default();
    Ok(shares.first().and_then(|s| s.get("id")).and_then(|id| id.as_i64()))
}

pub async fn share_dataset(engine: &Engine, path: &DatasetPath) -> Result<AttachParams> {
    if find_share_id(engine, path).await?.is_none() {
        let params = json!({
            "path": format!("/mnt/{}", path.as_str()),
            "enabled": true,
        });
        retry_default(|| {
            let params = params.clone();
            async { engine.client.call_default("sharing.nfs.create", json!([params])).await }
        })
        .await?;
    }

    Ok(AttachParams::Nfs {
        server: engine.config.nfs_server.clone(),
        export_path: format!("/mnt/{}", path.as_str()),
    })
}

pub async fn unshare_dataset(engine: &Engine, path: &DatasetPath) -> Result<()> {
    let Some(id) = find_share_id(engine, path).await? else {
        return Err(ApplianceError::NotFound(format!("no NFS share for {path}")));
    };
    retry_default(|| async { engine.client.call_default("sharing.nfs.delete", json!([id])).await })
        .await?;
    Ok(())
}
