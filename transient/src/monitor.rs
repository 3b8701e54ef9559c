//! Monitor-protocol client: line-delimited JSON messages over a Unix-domain
//! stream socket, with reply and event dispatch tables.
//!
//! On connect, the server's greeting line is read and discarded, then a
//! capability-negotiation command is sent and its reply awaited before any
//! other command may be issued. Replies carry a numeric `id` matching a
//! previously sent command; events carry a string `event`. A background
//! reader task dispatches each inbound message to the right table, clearing
//! the `id` entry once its one reply has been delivered.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::{TransientError, TransientResult};

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;
type EventSubs = Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Value>>>>>;

pub struct MonitorClient {
    next_id: AtomicU64,
    pending: PendingReplies,
    event_subs: EventSubs,
    writer: mpsc::UnboundedSender<String>,
}

impl MonitorClient {
    /// Connect to the monitor socket at `path`, retrying on connection
    /// refusal with a fixed sub-second backoff until `connect_timeout`
    /// elapses, then perform the capability handshake.
    pub async fn connect(path: &Path, connect_timeout: Duration) -> TransientResult<Self> {
        let started = std::time::Instant::now();
        let stream = loop {
            match UnixStream::connect(path).await {
                Ok(stream) => break stream,
                Err(e) if started.elapsed() < connect_timeout => {
                    tracing::debug!(error = %e, "monitor connect refused, retrying");
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                Err(e) => {
                    return Err(TransientError::retrieval(
                        format!("connecting to monitor socket {}", path.display()),
                        e,
                    ))
                }
            }
        };

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        // Discard the greeting line.
        let mut greeting = String::new();
        reader.read_line(&mut greeting).await?;

        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let event_subs: EventSubs = Arc::new(Mutex::new(HashMap::new()));
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(line) = writer_rx.recv().await {
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if write_half.write_all(b"\r\n").await.is_err() {
                    break;
                }
            }
        });

        let reader_pending = pending.clone();
        let reader_events = event_subs.clone();
        tokio::spawn(async move {
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break, // EOF: client closes cleanly, no more callbacks fire
                    Ok(_) => {}
                    Err(_) => break,
                }
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
                    continue;
                };

                if let Some(id) = value.get("id").and_then(Value::as_u64) {
                    let mut pending = reader_pending.lock().await;
                    if let Some(tx) = pending.remove(&id) {
                        let _ = tx.send(value);
                    }
                } else if let Some(event) = value.get("event").and_then(Value::as_str) {
                    let subs = reader_events.lock().await;
                    if let Some(callbacks) = subs.get(event) {
                        for cb in callbacks {
                            let _ = cb.send(value.clone());
                        }
                    }
                }
            }
        });

        let client = MonitorClient {
            next_id: AtomicU64::new(1),
            pending,
            event_subs,
            writer: writer_tx,
        };

        client
            .send_sync(
                serde_json::json!({"execute": "qmp_capabilities"}),
                Duration::from_secs(5),
            )
            .await?;

        Ok(client)
    }

    /// Allocate a new id, register `cb`'s receiver, and send `msg` (with the
    /// id merged in) without waiting for the reply.
    pub async fn send_async(&self, mut msg: Value) -> TransientResult<oneshot::Receiver<Value>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if let Value::Object(map) = &mut msg {
            map.insert("id".to_string(), serde_json::json!(id));
        }
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let line = serde_json::to_string(&msg)
            .map_err(|e| TransientError::Internal(format!("encoding monitor command: {e}")))?;
        self.writer
            .send(line)
            .map_err(|_| TransientError::Internal("monitor writer task has exited".into()))?;
        Ok(rx)
    }

    /// Send `msg` and block until its reply arrives or `timeout` elapses.
    pub async fn send_sync(&self, msg: Value, timeout: Duration) -> TransientResult<Value> {
        let rx = self.send_async(msg).await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TransientError::Internal(
                "monitor reader task dropped pending reply".into(),
            )),
            Err(_) => Err(TransientError::validation(
                "timed out waiting for monitor reply",
            )),
        }
    }

    /// Subscribe to a named event; the returned receiver yields every
    /// future occurrence in arrival order.
    pub async fn subscribe_event(&self, event: &str) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.event_subs
            .lock()
            .await
            .entry(event.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// `find_ssh_port_forward`: issue the `info usernet` human-monitor
    /// command and parse the host port forwarding to guest port 22.
    pub async fn find_ssh_port_forward(&self) -> TransientResult<Option<u16>> {
        let reply = self
            .send_sync(
                serde_json::json!({
                    "execute": "human-monitor-command",
                    "arguments": {"command-line": "info usernet"},
                }),
                Duration::from_secs(5),
            )
            .await?;

        let text = reply
            .get("return")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(parse_usernet_ssh_port(text))
    }
}

/// Parse the `info usernet` table for a `HOST_FORWARD` row whose
/// destination port is guest port `22`.
///
/// Row shape: `Protocol[State] FD SrcAddr SrcPort DestAddr DestPort RecvQ SendQ`,
/// e.g. `TCP[HOST_FORWARD]  15  127.0.0.1  10022  10.0.2.15  22  0  0`.
fn parse_usernet_ssh_port(text: &str) -> Option<u16> {
    for line in text.lines() {
        if !line.contains("HOST_FORWARD") {
            continue;
        }
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 6 {
            continue;
        }
        if cols[5] == "22" {
            if let Ok(port) = cols[3].parse() {
                return Some(port);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_usernet_redirection_table() {
        let text = "VLAN -1 (net0):\n  \
             Protocol[State]    FD  Source Address  Port   Dest. Address  Port RecvQ SendQ\n  \
             TCP[HOST_FORWARD]  15  127.0.0.1       10022  10.0.2.15      22   0     0\n";
        assert_eq!(parse_usernet_ssh_port(text), Some(10022));
    }

    #[test]
    fn no_redirection_returns_none() {
        assert_eq!(parse_usernet_ssh_port("Redirection rules:\n"), None);
    }
}
