//! JSON-RPC 2.0 over WebSocket client for the management API.
//!
//! A single authenticated connection is held per process. A background task
//! owns the socket and multiplexes concurrent callers: each request gets a
//! monotonic id and a oneshot reply channel registered before the frame is
//! sent, so out-of-order responses still land on the right caller. The
//! connection is kept alive with a periodic ping; if nothing is heard from
//! the appliance for too long the connection is declared broken and the
//! manager reconnects with exponential backoff.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::error::{ApplianceError, Result};
use crate::metrics;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const STALE_AFTER: Duration = Duration::from_secs(90);
const RECONNECT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(30);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
struct RpcRequest {
    id: u64,
    jsonrpc: &'static str,
    method: String,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    message: String,
}

enum Outgoing {
    Call {
        id: u64,
        method: String,
        params: Value,
    },
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

/// Handle to the appliance's JSON-RPC API. Cheaply cloneable; all clones
/// share the same underlying connection and request multiplexer.
#[derive(Clone)]
pub struct ApplianceClient {
    tx: mpsc::Sender<Outgoing>,
    ready: watch::Receiver<bool>,
    next_id: Arc<AtomicU64>,
    pending: PendingMap,
}

/// Connection parameters, resolved once at startup from CLI flags/env.
#[derive(Debug, Clone)]
pub struct ApplianceConfig {
    pub url: url::Url,
    pub api_key: String,
}

impl ApplianceClient {
    /// Spawns the background connection manager and returns immediately; the
    /// manager connects, authenticates, and begins reconnecting on its own.
    /// Callers should poll [`ApplianceClient::wait_ready`] or
    /// [`ApplianceClient::is_ready`] before relying on low-latency calls.
    pub fn spawn(config: ApplianceConfig) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let (ready_tx, ready_rx) = watch::channel(false);
        let next_id = Arc::new(AtomicU64::new(1));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(connection_manager(config, rx, ready_tx, next_id.clone(), pending.clone()));

        Self { tx, ready: ready_rx, next_id, pending }
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub async fn wait_ready(&mut self) {
        let _ = self.ready.wait_for(|ready| *ready).await;
    }

    /// Issues one JSON-RPC call and awaits its response, subject to `timeout`.
    ///
    /// The request id is assigned here (not inside the connection manager) so
    /// that a timeout can prune this call's `pending` entry itself; otherwise
    /// a method that occasionally stalls past its timeout (a wedged
    /// `core.get_jobs` poll, say) would leak one `pending` entry per timeout
    /// for the life of the connection.
    pub async fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(id, reply_tx);

        if self
            .tx
            .send(Outgoing::Call { id, method: method.to_string(), params })
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            return Err(ApplianceError::NetworkRetryable("appliance connection manager stopped".into()));
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ApplianceError::NetworkRetryable(
                "appliance connection closed before response".into(),
            )),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ApplianceError::ApiRetryable(format!("{method} timed out after {timeout:?}")))
            }
        }
    }

    /// Calls `method` with `params` using [`DEFAULT_CALL_TIMEOUT`].
    pub async fn call_default(&self, method: &str, params: Value) -> Result<Value> {
        self.call(method, params, DEFAULT_CALL_TIMEOUT).await
    }
}

async fn connection_manager(
    config: ApplianceConfig,
    mut rx: mpsc::Receiver<Outgoing>,
    ready_tx: watch::Sender<bool>,
    next_id: Arc<AtomicU64>,
    pending: PendingMap,
) {
    let mut backoff = RECONNECT_INITIAL_BACKOFF;

    loop {
        let _ = ready_tx.send(false);
        metrics::set_appliance_connected(false);

        match run_one_connection(&config, &mut rx, &ready_tx, &next_id, &pending).await {
            Ok(()) => {
                info!("appliance connection closed cleanly, reconnecting");
                backoff = RECONNECT_INITIAL_BACKOFF;
            }
            Err(err) => {
                warn!(error = %err, ?backoff, "appliance connection failed, retrying");
            }
        }

        drain_pending(&pending, "appliance connection lost").await;
        metrics::record_reconnect();

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(RECONNECT_MAX_BACKOFF);
    }
}

async fn drain_pending(pending: &PendingMap, reason: &str) {
    let mut guard = pending.lock().await;
    for (_, tx) in guard.drain() {
        let _ = tx.send(Err(ApplianceError::NetworkRetryable(reason.to_string())));
    }
}

/// Runs a single connection lifetime: connect, authenticate, then pump
/// outgoing calls and incoming frames until the socket closes or goes stale.
/// Returns `Ok(())` on a clean remote close, `Err` on any other failure.
async fn run_one_connection(
    config: &ApplianceConfig,
    rx: &mut mpsc::Receiver<Outgoing>,
    ready_tx: &watch::Sender<bool>,
    next_id: &Arc<AtomicU64>,
    pending: &PendingMap,
) -> Result<()> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(config.url.as_str())
        .await
        .map_err(|e| ApplianceError::NetworkRetryable(e.to_string()))?;
    let (mut write, mut read) = ws_stream.split();

    let login_id = next_id.fetch_add(1, Ordering::Relaxed);
    let login_req = RpcRequest {
        id: login_id,
        jsonrpc: "2.0",
        method: "auth.login_with_api_key".to_string(),
        params: Value::Array(vec![Value::String(config.api_key.clone())]),
    };
    write
        .send(Message::Text(serde_json::to_string(&login_req).unwrap().into()))
        .await
        .map_err(|e| ApplianceError::NetworkRetryable(e.to_string()))?;

    let login_reply = tokio::time::timeout(DEFAULT_CALL_TIMEOUT, read.next())
        .await
        .map_err(|_| ApplianceError::NetworkRetryable("timed out waiting for login response".into()))?
        .ok_or_else(|| ApplianceError::NetworkRetryable("connection closed during login".into()))?
        .map_err(|e| ApplianceError::NetworkRetryable(e.to_string()))?;

    let login_ok = match login_reply {
        Message::Text(text) => {
            let parsed: RpcResponse = serde_json::from_str(&text)
                .map_err(|e| ApplianceError::ApiPermanent(format!("malformed login response: {e}")))?;
            match parsed.error {
                Some(body) => return Err(ApplianceError::Unauthenticated.context(&body.message)),
                None => parsed.result.and_then(|v| v.as_bool()).unwrap_or(true),
            }
        }
        _ => return Err(ApplianceError::ApiPermanent("unexpected login response frame".into())),
    };
    if !login_ok {
        return Err(ApplianceError::Unauthenticated);
    }

    let _ = ready_tx.send(true);
    metrics::set_appliance_connected(true);
    info!("authenticated with appliance");

    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    let mut last_activity = tokio::time::Instant::now();

    loop {
        let stale_in = STALE_AFTER.saturating_sub(last_activity.elapsed());
        metrics::set_inflight_requests(pending.lock().await.len());

        tokio::select! {
            _ = tokio::time::sleep(stale_in) => {
                return Err(ApplianceError::NetworkRetryable("no activity from appliance within staleness window".into()));
            }
            _ = keepalive.tick() => {
                if write.send(Message::Ping(Vec::new().into())).await.is_err() {
                    return Err(ApplianceError::NetworkRetryable("failed to send keepalive ping".into()));
                }
            }
            outgoing = rx.recv() => {
                match outgoing {
                    None => return Ok(()),
                    Some(Outgoing::Call { id, method, params }) => {
                        // `pending` already holds this id's reply sender: `call()`
                        // registers it before handing the request off here, so it
                        // can prune the entry itself if this call times out.
                        let req = RpcRequest { id, jsonrpc: "2.0", method, params };
                        let body = serde_json::to_string(&req).unwrap();
                        if write.send(Message::Text(body.into())).await.is_err() {
                            if let Some(tx) = pending.lock().await.remove(&id) {
                                let _ = tx.send(Err(ApplianceError::NetworkRetryable("failed to send request".into())));
                            }
                            return Err(ApplianceError::NetworkRetryable("write half closed".into()));
                        }
                    }
                }
            }
            frame = read.next() => {
                last_activity = tokio::time::Instant::now();
                match frame {
                    None => return Ok(()),
                    Some(Err(e)) => return Err(ApplianceError::NetworkRetryable(e.to_string())),
                    Some(Ok(Message::Text(text))) => dispatch_response(&text, pending).await,
                    Some(Ok(Message::Close(_))) => return Ok(()),
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

async fn dispatch_response(text: &str, pending: &PendingMap) {
    let parsed: RpcResponse = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "dropping malformed JSON-RPC frame");
            return;
        }
    };
    let Some(id) = parsed.id else { return };
    let Some(tx) = pending.lock().await.remove(&id) else {
        debug!(id, "response for unknown/already-completed request id");
        return;
    };
    let result = match parsed.error {
        Some(body) => Err(ApplianceError::from_wire_message(&body.message)),
        None => Ok(parsed.result.unwrap_or(Value::Null)),
    };
    let _ = tx.send(result);
}

impl ApplianceError {
    fn context(self, detail: &str) -> Self {
        match self {
            ApplianceError::Unauthenticated => {
                ApplianceError::ApiPermanent(format!("authentication failed: {detail}"))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_request_serializes_with_positional_params() {
        let req = RpcRequest {
            id: 7,
            jsonrpc: "2.0",
            method: "pool.dataset.query".to_string(),
            params: Value::Array(vec![Value::String("tank".into())]),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"id\":7"));
        assert!(json.contains("\"method\":\"pool.dataset.query\""));
    }

    #[test]
    fn rpc_response_parses_error_body() {
        let text = r#"{"id":3,"jsonrpc":"2.0","error":{"code":1,"message":"dataset is busy"}}"#;
        let parsed: RpcResponse = serde_json::from_str(text).unwrap();
        assert_eq!(parsed.id, Some(3));
        assert_eq!(parsed.error.unwrap().message, "dataset is busy");
    }

    #[test]
    fn rpc_response_parses_success_body() {
        let text = r#"{"id":3,"jsonrpc":"2.0","result":{"id":"tank/foo"}}"#;
        let parsed: RpcResponse = serde_json::from_str(text).unwrap();
        assert_eq!(parsed.id, Some(3));
        assert!(parsed.error.is_none());
        assert!(parsed.result.is_some());
    }
}
