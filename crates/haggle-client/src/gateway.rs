//! Cross-process call gateway
//!
//! One gateway wraps one daemon connection. Requests are JSON-RPC lines; a
//! reader task demultiplexes whatever the daemon writes back: responses are
//! matched to their waiting caller by id, pushed events go to the event
//! channel in arrival order.

use crate::error::{HaggleError, Result};
use haggle_protocol::{is_event_message, Event, Request, RequestId, Response};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

pub(crate) struct Gateway {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Pending,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    call_timeout: Option<Duration>,
}

impl Gateway {
    /// Connect to the daemon socket
    ///
    /// Returns the gateway and the receiving end of the event channel. The
    /// channel closes when the daemon closes the connection.
    pub async fn connect(
        path: &Path,
        call_timeout: Option<Duration>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Event>)> {
        let stream = UnixStream::connect(path).await.map_err(|e| {
            HaggleError::DaemonUnreachable(format!("{}: {}", path.display(), e))
        })?;
        let (read, write) = stream.into_split();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        let reader = tokio::spawn(read_loop(
            BufReader::new(read),
            pending.clone(),
            event_tx,
            connected.clone(),
        ));

        Ok((
            Self {
                writer: tokio::sync::Mutex::new(write),
                pending,
                next_id: AtomicU64::new(1),
                connected,
                reader,
                call_timeout,
            },
            event_rx,
        ))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send a request and wait for its response
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        // Checked after registering so a concurrent disconnect either drains
        // our sender or is visible here.
        if !self.is_connected() {
            self.forget(id);
            return Err(HaggleError::DaemonUnreachable(
                "connection to daemon is closed".into(),
            ));
        }

        let line = Request::new(id, method, params).to_json_line()?;
        debug!(method, id, "Sending request to daemon");
        if let Err(e) = self.write_line(&line).await {
            self.forget(id);
            return Err(e);
        }

        let response = match self.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(response) => response,
                Err(_) => {
                    self.forget(id);
                    return Err(HaggleError::DaemonUnreachable(format!(
                        "{} timed out after {:?}",
                        method, limit
                    )));
                }
            },
            None => rx.await,
        };

        let response = response.map_err(|_| {
            HaggleError::DaemonUnreachable(format!("connection closed during {}", method))
        })?;
        response.into_result().map_err(HaggleError::from)
    }

    /// Send a request without waiting for (or expecting) a response
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        if !self.is_connected() {
            return Err(HaggleError::DaemonUnreachable(
                "connection to daemon is closed".into(),
            ));
        }
        let line = Request::notification(method, params).to_json_line()?;
        debug!(method, "Sending notification to daemon");
        self.write_line(&line).await
    }

    /// Close the write side and stop reading
    pub async fn close(&self) {
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                debug!("Error shutting down daemon connection: {}", e);
            }
        }
        self.reader.abort();
        self.connected.store(false, Ordering::SeqCst);
        self.pending.lock().unwrap().clear();
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| HaggleError::DaemonUnreachable(format!("write failed: {}", e)))
    }

    fn forget(&self, id: u64) {
        self.pending.lock().unwrap().remove(&id);
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    mut reader: BufReader<OwnedReadHalf>,
    pending: Pending,
    events: mpsc::UnboundedSender<Event>,
    connected: Arc<AtomicBool>,
) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("Connection closed by daemon");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("Failed to read from daemon: {}", e);
                break;
            }
        }

        let msg: Value = match serde_json::from_str(&line) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "Discarding malformed message from daemon");
                continue;
            }
        };

        if is_event_message(&msg) {
            match serde_json::from_value::<Event>(msg) {
                // Receiver gone means the handle is being torn down
                Ok(event) => {
                    let _ = events.send(event);
                }
                Err(e) => warn!(error = %e, "Discarding undecodable event from daemon"),
            }
            continue;
        }

        let response: Response = match serde_json::from_value(msg) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Discarding unrecognised message from daemon");
                continue;
            }
        };

        let waiter = match &response.id {
            Some(RequestId::Number(id)) => pending.lock().unwrap().remove(id),
            _ => None,
        };
        match waiter {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => debug!(id = ?response.id, "Response for unknown request"),
        }
    }

    connected.store(false, Ordering::SeqCst);
    // Dropping the senders wakes every waiting caller with an error
    pending.lock().unwrap().clear();
}
