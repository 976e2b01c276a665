//! tns-csi driver binary: wires the appliance client into the CSI Identity,
//! Controller, and Node gRPC services and serves them over a Unix domain
//! socket, as kubelet expects of a CSI plugin.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tonic::transport::Server;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use csi_driver::csi::controller_server::ControllerServer;
use csi_driver::csi::identity_server::IdentityServer;
use csi_driver::csi::node_server::NodeServer;
use csi_driver::identity::ReadinessState;
use csi_driver::{ControllerService, IdentityService, NodeService};

use appliance_client::{ApplianceClient, ApplianceConfig, Engine, EngineConfig};

/// CLI arguments for the CSI driver
#[derive(Parser, Debug)]
#[command(name = "csi-driver")]
#[command(about = "CSI driver for a ZFS-based NAS appliance")]
struct Args {
    /// CSI endpoint (unix socket path)
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///var/run/csi/csi.sock")]
    endpoint: String,

    /// Node ID for this CSI node
    #[arg(long, env = "CSI_NODE_ID")]
    node_id: Option<String>,

    /// WebSocket URL of the appliance's management API
    #[arg(long, env = "APPLIANCE_URL")]
    appliance_url: Option<String>,

    /// API key used to authenticate with the appliance
    #[arg(long, env = "APPLIANCE_API_KEY")]
    appliance_api_key: Option<String>,

    /// Path to a file containing the appliance API key, as an alternative
    /// to passing it directly on the command line
    #[arg(long, env = "APPLIANCE_API_KEY_FILE")]
    appliance_api_key_file: Option<String>,

    /// ZFS pool the engine provisions volumes into
    #[arg(long, env = "ZFS_POOL", default_value = "tank")]
    zfs_pool: String,

    /// Dataset under the pool to provision volumes into, if not the pool root
    #[arg(long, env = "ZFS_PARENT_DATASET")]
    zfs_parent_dataset: Option<String>,

    /// Dataset name template; see naming::render_template
    #[arg(long, env = "NAME_TEMPLATE", default_value = "{PVCName}")]
    name_template: String,

    #[arg(long, env = "NAME_PREFIX", default_value = "")]
    name_prefix: String,

    #[arg(long, env = "NAME_SUFFIX", default_value = "")]
    name_suffix: String,

    /// Base IQN prefix for iSCSI target names
    #[arg(long, env = "BASE_IQN", default_value = "iqn.2137.csi.tns")]
    base_iqn: String,

    /// NFS server address advertised in volume contexts
    #[arg(long, env = "NFS_SERVER")]
    nfs_server: Option<String>,

    /// NVMe-oF transport address advertised in volume contexts
    #[arg(long, env = "NVME_TRANSPORT_ADDR")]
    nvme_transport_addr: Option<String>,

    /// NVMe-oF transport port advertised in volume contexts
    #[arg(long, env = "NVME_TRANSPORT_PORT", default_value = "4420")]
    nvme_transport_port: u16,

    /// iSCSI portal address advertised in volume contexts
    #[arg(long, env = "ISCSI_PORTAL")]
    iscsi_portal: Option<String>,

    /// Dataset detached snapshots are replicated into
    #[arg(long, env = "DETACHED_SNAPSHOT_DATASET", default_value = "tank/csi-detached-snapshots")]
    detached_snapshot_dataset: String,

    /// Run in controller mode (enables the Controller service)
    #[arg(long, env = "CSI_CONTROLLER", default_value = "false")]
    controller: bool,

    /// Run in node mode (enables the Node service)
    #[arg(long, env = "CSI_NODE", default_value = "true")]
    node: bool,

    /// Address to serve Prometheus metrics on, e.g. 0.0.0.0:9100
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error), or an `EnvFilter` spec
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn resolve_api_key(args: &Args) -> Result<String, Box<dyn std::error::Error>> {
    if let Some(key) = &args.appliance_api_key {
        return Ok(key.clone());
    }
    if let Some(path) = &args.appliance_api_key_file {
        return Ok(std::fs::read_to_string(path)?.trim().to_string());
    }
    Err("one of --appliance-api-key or --appliance-api-key-file is required".into())
}

/// Removes a stale socket file from a prior run before binding, mirroring
/// what most CSI node plugins do since kubelet doesn't clean up after a
/// crashed plugin.
fn bind_unix_socket(endpoint: &str) -> Result<tokio::net::UnixListener, Box<dyn std::error::Error>> {
    let path = endpoint
        .strip_prefix("unix://")
        .ok_or("endpoint must be a unix:// socket path")?;
    if Path::new(path).exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = Path::new(path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(tokio::net::UnixListener::bind(path)?)
}

/// Keeps the Identity service's readiness state in sync with the appliance
/// client's authenticated-connection status: Probe succeeds iff the
/// appliance client currently reports itself authenticated.
async fn track_readiness(client: ApplianceClient, readiness: Arc<ReadinessState>) {
    let mut last = false;
    loop {
        let ready = client.is_ready();
        if ready != last {
            csi_driver::metrics::set_appliance_connected(ready);
            if ready {
                info!("appliance client authenticated, reporting ready");
            } else {
                warn!("appliance client not authenticated, reporting not ready");
                csi_driver::metrics::record_reconnect();
            }
            readiness.set_ready(ready);
            last = ready;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let node_id = match &args.node_id {
        Some(id) => id.clone(),
        None => hostname::get()?.to_string_lossy().to_string(),
    };

    info!(
        endpoint = %args.endpoint,
        node_id = %node_id,
        controller_mode = %args.controller,
        node_mode = %args.node,
        "starting tns-csi driver"
    );

    if let Some(addr) = &args.metrics_addr {
        let addr: SocketAddr = addr.parse()?;
        csi_driver::metrics::init_metrics(addr)?;
    }

    let readiness = Arc::new(ReadinessState::new());
    let identity_service = IdentityService::with_readiness(readiness.clone());

    let mut server = Server::builder().add_service(IdentityServer::new(identity_service));

    // Only the controller side needs a live appliance connection; a
    // node-only process never talks to the appliance directly.
    let appliance_client = if args.controller {
        let url = args
            .appliance_url
            .as_deref()
            .ok_or("--appliance-url is required in controller mode")?;
        let appliance_config = ApplianceConfig {
            url: url.parse()?,
            api_key: resolve_api_key(&args)?,
        };
        let client = ApplianceClient::spawn(appliance_config);
        tokio::spawn(track_readiness(client.clone(), readiness.clone()));
        Some(client)
    } else {
        readiness.set_ready(true);
        None
    };

    if let Some(client) = appliance_client {
        let engine_config = EngineConfig {
            pool: args.zfs_pool.clone(),
            parent_dataset: args.zfs_parent_dataset.clone(),
            name_template: args.name_template.clone(),
            name_prefix: args.name_prefix.clone(),
            name_suffix: args.name_suffix.clone(),
            base_iqn: args.base_iqn.clone(),
            nfs_server: args.nfs_server.clone().unwrap_or_default(),
            nvme_transport_addr: args.nvme_transport_addr.clone().unwrap_or_default(),
            nvme_transport_port: args.nvme_transport_port,
            iscsi_portal: args.iscsi_portal.clone().unwrap_or_default(),
            detached_snapshot_dataset: args.detached_snapshot_dataset.clone(),
        };
        let engine = Arc::new(Engine::new(client, engine_config));
        server = server.add_service(ControllerServer::new(ControllerService::new(engine)));
    }

    if args.node {
        server = server.add_service(NodeServer::new(NodeService::new(node_id)));
    }

    let listener = bind_unix_socket(&args.endpoint)?;
    let incoming = tokio_stream::wrappers::UnixListenerStream::new(listener);

    server.serve_with_incoming(incoming).await?;

    Ok(())
}
