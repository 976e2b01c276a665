//! NVMe-oF (TCP transport) export lifecycle: subsystem, namespace, and port,
//! backed by `nvmet.subsys.*`, `nvmet.namespace.*`, `nvmet.port.*`, and
//! `nvmet.port_subsys.*`.

use serde_json::json;

use crate::engine::Engine;
use crate::error::{ApplianceError, Result};
use crate::naming::{self, DatasetPath};
use crate::retry::retry_default;
use crate::types::AttachParams;

async fn find_subsys_id(engine: &Engine, nqn: &str) -> Result<Option<i64>> {
    let filters = json!([["nqn", "=", nqn]]);
    let result = engine
        .client
        .call_default("nvmet.subsys.query", json!([filters]))
        .await?;
    Ok(result
        .as_array()
        .and_then(|a| a.first())
        .and_then(|s| s.get("id"))
        .and_then(|id| id.as_i64()))
}

async fn find_port_id(engine: &Engine, addr: &str, port: u16) -> Result<Option<i64>> {
    let filters = json!([["addr_traddr", "=", addr], ["addr_trsvcid", "=", port.to_string()]]);
    let result = engine.client.call_default("nvmet.port.query", json!([filters])).await?;
    Ok(result
        .as_array()
        .and_then(|a| a.first())
        .and_then(|s| s.get("id"))
        .and_then(|id| id.as_i64()))
}

/// Resolves the id of the single preconfigured TCP port this appliance
/// listens on for NVMe-oF. Per spec, the port itself is operator-provisioned
/// out of band, not something `CreateVolume` may create on demand: a pool
/// with no NVMe-oF port configured is a prerequisite failure, not something
/// this call can repair.
async fn ensure_port(engine: &Engine) -> Result<i64> {
    find_port_id(engine, &engine.config.nvme_transport_addr, engine.config.nvme_transport_port)
        .await?
        .ok_or_else(|| {
            ApplianceError::FailedPrecondition(format!(
                "no NVMe-oF TCP port configured on the appliance for {}:{}",
                engine.config.nvme_transport_addr, engine.config.nvme_transport_port
            ))
        })
}

pub async fn export_zvol(engine: &Engine, path: &DatasetPath) -> Result<AttachParams> {
    let nqn = naming::nqn_for_dataset(path)?;

    let subsys_id = match find_subsys_id(engine, nqn.as_str()).await? {
        Some(id) => id,
        None => {
            let params = json!({ "nqn": nqn.as_str(), "allow_any_host": true });
            let result = retry_default(|| {
                let params = params.clone();
                async { engine.client.call_default("nvmet.subsys.create", json!([params])).await }
            })
            .await?;
            result
                .get("id")
                .and_then(|v| v.as_i64())
                .ok_or_else(|| ApplianceError::ApiPermanent("nvmet.subsys.create returned no id".into()))?
        }
    };

    let ns_filters = json!([["subsys", "=", subsys_id]]);
    let existing_ns = engine
        .client
        .call_default("nvmet.namespace.query", json!([ns_filters]))
        .await?;
    if existing_ns.as_array().map(Vec::is_empty).unwrap_or(true) {
        let params = json!({
            "subsys_id": subsys_id,
            "device_type": "ZVOL",
            "device_path": format!("zvol/{}", path.as_str()),
            "nsid": 1,
        });
        if let Err(e) = retry_default(|| {
            let params = params.clone();
            async { engine.client.call_default("nvmet.namespace.create", json!([params])).await }
        })
        .await
        {
            let _ = retry_default(|| async {
                engine.client.call_default("nvmet.subsys.delete", json!([subsys_id])).await
            })
            .await;
            return Err(e);
        }
    }

    let port_id = ensure_port(engine).await?;
    let link_filters = json!([["port", "=", port_id], ["subsys", "=", subsys_id]]);
    let existing_link = engine
        .client
        .call_default("nvmet.port_subsys.query", json!([link_filters]))
        .await?;
    if existing_link.as_array().map(Vec::is_empty).unwrap_or(true) {
        let params = json!({ "port_id": port_id, "subsys_id": subsys_id });
        retry_default(|| {
            let params = params.clone();
            async { engine.client.call_default("nvmet.port_subsys.create", json!([params])).await }
        })
        .await?;
    }

    Ok(AttachParams::Nvmeof {
        nqn: nqn.to_string(),
        transport_addr: engine.config.nvme_transport_addr.clone(),
        transport_port: engine.config.nvme_transport_port,
    })
}

pub async fn unexport_zvol(engine: &Engine, path: &DatasetPath) -> Result<()> {
    let nqn = naming::nqn_for_dataset(path)?;
    let Some(subsys_id) = find_subsys_id(engine, nqn.as_str()).await? else {
        return Err(ApplianceError::NotFound(format!("no NVMe-oF subsystem for {nqn}")));
    };
    // Deleting the subsystem cascades to its namespaces and port links on the appliance side.
    retry_default(|| async {
        engine
            .client
            .call_default("nvmet.subsys.delete", json!([subsys_id]))
            .await
    })
    .await?;
    Ok(())
}
