//! Slave side of the peer link.
//!
//! The slave binds only the command socket; everything else is an outbound
//! connection to the master.  Push channels (sync, heartbeat, file) open a
//! short-lived connection per frame group -- the master funnels every
//! accepted connection into one collector, so connection identity carries
//! no meaning on that side.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec, LinesCodec};
use tracing::{debug, info, warn};
use tt_protocol::{FileHeader, FileKind, Heartbeat, StatusMessage, SyncFrame, Trigger, TriggerMessage};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error("connect to {addr} timed out")]
    ConnectTimeout { addr: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("malformed frame: {0}")]
    Frame(#[from] serde_json::Error),
}

async fn connect(addr: &str) -> Result<TcpStream, PeerError> {
    tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| PeerError::ConnectTimeout {
            addr: addr.to_owned(),
        })?
        .map_err(|source| PeerError::Connect {
            addr: addr.to_owned(),
            source,
        })
}

// ---------------------------------------------------------------------------
// Trigger subscription
// ---------------------------------------------------------------------------

/// Connects to the master's trigger fan-out (retrying until it appears)
/// and forwards received triggers.
pub fn spawn_trigger_subscriber(
    addr: String,
    mut shutdown: watch::Receiver<bool>,
) -> (mpsc::Receiver<Trigger>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(8);
    let task = tokio::spawn(async move {
        loop {
            let stream = tokio::select! {
                connected = connect(&addr) => match connected {
                    Ok(stream) => stream,
                    Err(e) => {
                        debug!(error = %e, "trigger channel not up yet");
                        tokio::time::sleep(RECONNECT_BACKOFF).await;
                        continue;
                    }
                },
                _ = shutdown.changed() => return,
            };
            info!(addr = %addr, "subscribed to trigger channel");
            let mut lines = FramedRead::new(stream, LinesCodec::new());
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                    line = lines.next() => match line {
                        None => {
                            warn!("trigger channel closed; reconnecting");
                            break;
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "trigger channel error; reconnecting");
                            break;
                        }
                        Some(Ok(line)) => match serde_json::from_str::<TriggerMessage>(&line) {
                            Ok(TriggerMessage::Trigger(trigger)) => {
                                if tx.send(trigger).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => warn!(error = %e, line = %line, "unparseable trigger frame"),
                        },
                    }
                }
            }
            tokio::time::sleep(RECONNECT_BACKOFF).await;
        }
    });
    (rx, task)
}

// ---------------------------------------------------------------------------
// Push channels
// ---------------------------------------------------------------------------

/// Push one frame on the sync channel (ready / trigger-timestamp echo).
pub async fn push_sync_frame(addr: &str, frame: &SyncFrame) -> Result<(), PeerError> {
    let stream = connect(addr).await?;
    let mut sink = FramedWrite::new(stream, LinesCodec::new());
    sink.send(frame.to_line()?)
        .await
        .map_err(|e| PeerError::Transport(e.to_string()))?;
    sink.into_inner()
        .shutdown()
        .await
        .map_err(|e| PeerError::Transport(e.to_string()))?;
    Ok(())
}

/// Push one file (header frame + payload frame) on the file channel.
pub async fn push_file(
    addr: &str,
    kind: FileKind,
    name: &str,
    payload: Bytes,
) -> Result<(), PeerError> {
    let stream = connect(addr).await?;
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(256 * 1024 * 1024)
        .new_codec();
    let mut sink = FramedWrite::new(stream, codec);
    let header = FileHeader {
        kind,
        name: name.to_owned(),
        len: payload.len() as u64,
    };
    sink.send(Bytes::from(serde_json::to_vec(&header)?))
        .await
        .map_err(|e| PeerError::Transport(e.to_string()))?;
    sink.send(payload)
        .await
        .map_err(|e| PeerError::Transport(e.to_string()))?;
    sink.into_inner()
        .shutdown()
        .await
        .map_err(|e| PeerError::Transport(e.to_string()))?;
    info!(name, ?kind, len = header.len, "file pushed to master");
    Ok(())
}

/// Periodically push heartbeats carrying the current state name.
pub fn spawn_heartbeat_pusher<F>(
    addr: String,
    interval: Duration,
    status: F,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    F: Fn() -> String + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
            let heartbeat = StatusMessage::Heartbeat(Heartbeat {
                status: status(),
                timestamp: chrono::Utc::now().timestamp_millis().max(0) as u64,
            });
            let Ok(line) = serde_json::to_string(&heartbeat) else {
                continue;
            };
            match connect(&addr).await {
                Ok(stream) => {
                    let mut sink = FramedWrite::new(stream, LinesCodec::new());
                    if let Err(e) = sink.send(line).await {
                        debug!(error = %e, "heartbeat push failed");
                    }
                    let _ = sink.into_inner().shutdown().await;
                }
                Err(e) => debug!(error = %e, "heartbeat connect failed"),
            }
        }
    })
}
