//! Unix socket server speaking the daemon's JSON-RPC contract

use crate::state::{ConnectionId, DaemonState, Outbox};
use anyhow::{bail, Result};
use haggle_protocol::{
    codes, methods, Attribute, DataObject, DataObjectId, Event, EventKind, Request, Response,
    RpcError,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct MockDaemonConfig {
    /// Largest inline payload accepted by `dataobjects.publish`
    pub max_payload_bytes: usize,
    /// Apply at most this many interests per batch, reporting the shortfall
    /// through `accepted`. Simulates a daemon without atomic batches.
    pub batch_limit: Option<usize>,
    /// Methods answered with `INTERNAL_ERROR` whatever their params
    pub refused_methods: Vec<String>,
}

impl Default for MockDaemonConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: 1024 * 1024,
            batch_limit: None,
            refused_methods: Vec::new(),
        }
    }
}

/// Stand-in daemon listening on a Unix socket
pub struct MockDaemon {
    listener: UnixListener,
    socket_path: PathBuf,
    state: Arc<DaemonState>,
    config: Arc<MockDaemonConfig>,
    shutdown_tx: broadcast::Sender<()>,
}

impl MockDaemon {
    pub async fn bind(path: &Path) -> Result<Self> {
        Self::bind_with(path, MockDaemonConfig::default()).await
    }

    pub async fn bind_with(path: &Path, config: MockDaemonConfig) -> Result<Self> {
        if path.exists() {
            if UnixStream::connect(path).await.is_ok() {
                bail!("another daemon is already listening on {}", path.display());
            }
            debug!(socket = %path.display(), "Removing stale socket");
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(path)?;
        let (shutdown_tx, _) = broadcast::channel(1);
        info!(socket = %path.display(), "Mock daemon listening");

        Ok(Self {
            listener,
            socket_path: path.to_path_buf(),
            state: Arc::new(DaemonState::new()),
            config: Arc::new(config),
            shutdown_tx,
        })
    }

    pub fn state(&self) -> Arc<DaemonState> {
        self.state.clone()
    }

    /// Get a shutdown sender for external shutdown triggers
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Serve connections until shutdown is signalled
    pub async fn run(self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, _)) => {
                            let state = self.state.clone();
                            let config = self.config.clone();
                            let shutdown_tx = self.shutdown_tx.clone();
                            let shutdown_rx = self.shutdown_tx.subscribe();
                            tokio::spawn(async move {
                                if let Err(e) = handle_client(stream, state, config, shutdown_tx, shutdown_rx).await {
                                    error!("Client error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        haggle_protocol::remove_socket(&self.socket_path);
        Ok(())
    }
}

/// Per-connection context handed to method handlers
struct Connection {
    id: ConnectionId,
    outbox: Outbox,
    state: Arc<DaemonState>,
    config: Arc<MockDaemonConfig>,
}

/// What the connection loop does after a request
struct Outcome {
    response: Option<Response>,
    shutdown: bool,
}

async fn handle_client(
    stream: UnixStream,
    state: Arc<DaemonState>,
    config: Arc<MockDaemonConfig>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let (outbox, lines) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_loop(writer, lines));

    let conn = Connection {
        id: ConnectionId::new(),
        outbox,
        state,
        config,
    };
    debug!(conn = %conn.id, "Client connected");

    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let result = loop {
        line.clear();
        let read = tokio::select! {
            read = reader.read_line(&mut line) => read,
            _ = shutdown_rx.recv() => break Ok(()),
        };
        match read {
            Ok(0) => break Ok(()),
            Ok(_) => {}
            Err(e) => break Err(e.into()),
        }

        let outcome = match serde_json::from_str::<Request>(&line) {
            Ok(req) => {
                conn.state.count_request();
                handle_request(&req, &conn)
            }
            Err(e) => {
                warn!("Parse error: {}", e);
                Outcome {
                    response: Some(Response::error(None, codes::PARSE_ERROR, e.to_string())),
                    shutdown: false,
                }
            }
        };

        if let Some(response) = outcome.response {
            match response.to_json_line() {
                Ok(json) => {
                    let _ = conn.outbox.send(json);
                }
                Err(e) => error!("Failed to encode response: {}", e),
            }
        }
        if outcome.shutdown {
            let notified = conn.state.broadcast(&Event::Shutdown(0));
            info!(notified, "Daemon shutdown requested by client");
            let _ = shutdown_tx.send(());
        }
    };

    conn.state.detach(conn.id);
    debug!(conn = %conn.id, "Client disconnected");
    drop(conn);
    // Let queued responses and events drain before the socket closes
    let _ = tokio::time::timeout(Duration::from_secs(1), writer_task).await;
    result
}

async fn write_loop(mut writer: OwnedWriteHalf, mut lines: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = lines.recv().await {
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            debug!("Client write failed: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

fn handle_request(req: &Request, conn: &Connection) -> Outcome {
    debug!(method = %req.method, conn = %conn.id, "Request");

    let refused = conn.config.refused_methods.iter().any(|m| *m == req.method);
    let result = match req.method.as_str() {
        _ if refused => Err(RpcError::new(
            codes::INTERNAL_ERROR,
            format!("{} refused by daemon configuration", req.method),
        )),
        methods::PING => Ok(json!("pong")),
        methods::SESSION_REGISTER => session_register(req, conn),
        methods::SESSION_RELEASE => session_release(req, conn),
        methods::SESSION_UNREGISTER => session_unregister(req, conn),
        methods::EVENT_REGISTER => event_register(req, conn),
        methods::INTERESTS_ADD => interests_add(req, conn),
        methods::INTERESTS_REMOVE => interests_remove(req, conn),
        methods::INTERESTS_GET => interests_get(req, conn),
        methods::DATAOBJECTS_PUBLISH => dataobjects_publish(req, conn),
        methods::DATAOBJECTS_DELETE => dataobjects_delete(req, conn),
        methods::DATAOBJECTS_GET => dataobjects_get(req, conn),
        methods::DAEMON_SHUTDOWN => daemon_shutdown(req, conn),
        other => Err(RpcError::new(
            codes::METHOD_NOT_FOUND,
            format!("Method not found: {}", other),
        )),
    };

    if let Err(err) = &result {
        debug!(method = %req.method, code = err.code, "Request failed: {}", err.message);
    }

    let shutdown = req.method == methods::DAEMON_SHUTDOWN && result.is_ok();
    let response = if req.is_notification() {
        None
    } else {
        Some(match result {
            Ok(value) => Response::success(req.id.clone(), value),
            Err(err) => Response::failure(req.id.clone(), err),
        })
    };

    Outcome { response, shutdown }
}

fn require_str<'a>(req: &'a Request, name: &str) -> Result<&'a str, RpcError> {
    req.params.get(name).and_then(Value::as_str).ok_or_else(|| {
        RpcError::new(
            codes::INVALID_PARAMS,
            format!("Missing or invalid '{}' parameter", name),
        )
    })
}

fn require_param<T: DeserializeOwned>(req: &Request, name: &str) -> Result<T, RpcError> {
    let value = req.params.get(name).cloned().ok_or_else(|| {
        RpcError::new(
            codes::INVALID_PARAMS,
            format!("Missing '{}' parameter", name),
        )
    })?;
    serde_json::from_value(value).map_err(|e| {
        RpcError::new(
            codes::INVALID_PARAMS,
            format!("Invalid '{}' parameter: {}", name, e),
        )
    })
}

fn session_register(req: &Request, conn: &Connection) -> Result<Value, RpcError> {
    let name = require_str(req, "name")?;
    let registration = conn.state.register(name, conn.id, conn.outbox.clone())?;
    Ok(json!(registration))
}

fn session_release(req: &Request, conn: &Connection) -> Result<Value, RpcError> {
    conn.state.release(require_str(req, "resource_id")?)?;
    Ok(Value::Null)
}

fn session_unregister(req: &Request, conn: &Connection) -> Result<Value, RpcError> {
    conn.state.unregister(require_str(req, "name")?)?;
    Ok(Value::Null)
}

fn event_register(req: &Request, conn: &Connection) -> Result<Value, RpcError> {
    let resource_id = require_str(req, "resource_id")?;
    let kind: EventKind = require_param(req, "kind")?;
    conn.state.register_event(resource_id, kind)?;
    Ok(Value::Null)
}

fn interests_add(req: &Request, conn: &Connection) -> Result<Value, RpcError> {
    let resource_id = require_str(req, "resource_id")?;
    let interests: Vec<Attribute> = require_param(req, "interests")?;
    let accepted = conn
        .state
        .add_interests(resource_id, interests, conn.config.batch_limit)?;
    Ok(json!({ "accepted": accepted }))
}

fn interests_remove(req: &Request, conn: &Connection) -> Result<Value, RpcError> {
    let resource_id = require_str(req, "resource_id")?;
    let interests: Vec<Attribute> = require_param(req, "interests")?;
    let accepted = conn.state.remove_interests(resource_id, &interests)?;
    Ok(json!({ "accepted": accepted }))
}

fn interests_get(req: &Request, conn: &Connection) -> Result<Value, RpcError> {
    conn.state.queue_interests(require_str(req, "resource_id")?)?;
    Ok(json!({ "queued": true }))
}

fn dataobjects_publish(req: &Request, conn: &Connection) -> Result<Value, RpcError> {
    let resource_id = require_str(req, "resource_id")?;
    let object: DataObject = require_param(req, "data_object")?;
    let id = conn
        .state
        .publish(resource_id, object, conn.config.max_payload_bytes)?;
    Ok(json!({ "id": id }))
}

fn dataobjects_delete(req: &Request, conn: &Connection) -> Result<Value, RpcError> {
    let resource_id = require_str(req, "resource_id")?;
    let id: DataObjectId = require_param(req, "id")?;
    if !conn.state.delete(resource_id, &id)? {
        debug!(%id, "Delete of unknown data object");
    }
    Ok(Value::Null)
}

fn dataobjects_get(req: &Request, conn: &Connection) -> Result<Value, RpcError> {
    let queued = conn
        .state
        .queue_matching_objects(require_str(req, "resource_id")?)?;
    Ok(json!({ "queued": queued }))
}

fn daemon_shutdown(req: &Request, conn: &Connection) -> Result<Value, RpcError> {
    conn.state.check(require_str(req, "resource_id")?)?;
    Ok(json!({ "status": 0 }))
}
