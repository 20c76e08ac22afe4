//! Master side of the five-socket peer link.
//!
//! The master binds the trigger fan-out plus three collector sockets
//! (sync, file, heartbeat) and connects out to the slave's command socket.
//! Collector listeners accept any number of slave connections and funnel
//! parsed frames into one channel each, so the controller only ever reads
//! from plain receivers.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, FramedRead, FramedWrite, LengthDelimitedCodec, LinesCodec};
use tracing::{debug, warn};
use tt_protocol::{
    CommandRequest, CommandResponse, FileHeader, Heartbeat, StatusMessage, SyncFrame,
    TriggerMessage,
};

/// Deadline for one command round trip.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadline for one frame on the file channel.
pub const FILE_FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Empty receive cycles tolerated before a file transfer is abandoned.
pub const FILE_MAX_EMPTY_CYCLES: u32 = 20;

const COLLECTOR_QUEUE: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("bind {socket} on {addr}: {source}")]
    Bind {
        socket: &'static str,
        addr: String,
        source: std::io::Error,
    },
    #[error("connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error("{what} timed out after {timeout:?}")]
    Timeout {
        what: &'static str,
        timeout: Duration,
    },
    #[error("peer link closed")]
    Closed,
    #[error("transport: {0}")]
    Transport(String),
    #[error("malformed frame: {0}")]
    Frame(#[from] serde_json::Error),
    #[error("file transfer: {0}")]
    FileTransfer(String),
}

// ---------------------------------------------------------------------------
// Trigger fan-out
// ---------------------------------------------------------------------------

type LineSink = FramedWrite<TcpStream, LinesCodec>;

/// Publishes trigger messages to every connected subscriber.
pub struct TriggerPublisher {
    subscribers: Arc<Mutex<Vec<LineSink>>>,
    accept_task: JoinHandle<()>,
}

impl TriggerPublisher {
    fn spawn(listener: TcpListener) -> Self {
        let subscribers: Arc<Mutex<Vec<LineSink>>> = Arc::new(Mutex::new(Vec::new()));
        let accept_subscribers = subscribers.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((socket, peer)) = listener.accept().await else {
                    break;
                };
                debug!(%peer, "trigger subscriber connected");
                accept_subscribers
                    .lock()
                    .await
                    .push(FramedWrite::new(socket, LinesCodec::new()));
            }
        });
        TriggerPublisher {
            subscribers,
            accept_task,
        }
    }

    /// Send the message to every subscriber; dead subscribers are dropped.
    /// Returns how many subscribers were reached.
    pub async fn publish(&self, msg: &TriggerMessage) -> Result<usize, PeerError> {
        let line = serde_json::to_string(msg)?;
        let mut subscribers = self.subscribers.lock().await;
        let mut alive = Vec::with_capacity(subscribers.len());
        let mut reached = 0;
        for mut sink in subscribers.drain(..) {
            match sink.send(line.clone()).await {
                Ok(()) => {
                    reached += 1;
                    alive.push(sink);
                }
                Err(e) => warn!(error = %e, "dropping dead trigger subscriber"),
            }
        }
        *subscribers = alive;
        Ok(reached)
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }
}

impl Drop for TriggerPublisher {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

// ---------------------------------------------------------------------------
// Command client
// ---------------------------------------------------------------------------

/// Request/reply link to the slave's command socket.
pub struct CommandClient {
    framed: Framed<TcpStream, LinesCodec>,
    addr: String,
}

impl CommandClient {
    pub async fn connect(addr: &str) -> Result<Self, PeerError> {
        let stream = tokio::time::timeout(COMMAND_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::Timeout {
                what: "command connect",
                timeout: COMMAND_TIMEOUT,
            })?
            .map_err(|source| PeerError::Connect {
                addr: addr.to_owned(),
                source,
            })?;
        Ok(CommandClient {
            framed: Framed::new(stream, LinesCodec::new()),
            addr: addr.to_owned(),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn request(&mut self, req: &CommandRequest) -> Result<CommandResponse, PeerError> {
        let line = serde_json::to_string(req)?;
        self.framed
            .send(line)
            .await
            .map_err(|e| PeerError::Transport(e.to_string()))?;
        let reply = tokio::time::timeout(COMMAND_TIMEOUT, self.framed.next())
            .await
            .map_err(|_| PeerError::Timeout {
                what: "command reply",
                timeout: COMMAND_TIMEOUT,
            })?
            .ok_or(PeerError::Closed)?
            .map_err(|e| PeerError::Transport(e.to_string()))?;
        Ok(serde_json::from_str(&reply)?)
    }
}

// ---------------------------------------------------------------------------
// Collectors
// ---------------------------------------------------------------------------

fn spawn_line_collector<T, F>(listener: TcpListener, parse: F) -> (mpsc::Receiver<T>, JoinHandle<()>)
where
    T: Send + 'static,
    F: Fn(&str) -> Option<T> + Send + Sync + Clone + 'static,
{
    let (tx, rx) = mpsc::channel(COLLECTOR_QUEUE);
    let accept = tokio::spawn(async move {
        loop {
            let Ok((socket, peer)) = listener.accept().await else {
                break;
            };
            debug!(%peer, "collector connection");
            let tx = tx.clone();
            let parse = parse.clone();
            tokio::spawn(async move {
                let mut lines = FramedRead::new(socket, LinesCodec::new());
                while let Some(Ok(line)) = lines.next().await {
                    match parse(&line) {
                        Some(frame) => {
                            if tx.send(frame).await.is_err() {
                                return;
                            }
                        }
                        None => warn!(line = %line, "unparseable frame dropped"),
                    }
                }
            });
        }
    });
    (rx, accept)
}

/// Receives header+payload frame pairs on the file channel.
pub struct FileReceiver {
    frames: mpsc::Receiver<Bytes>,
    accept_task: JoinHandle<()>,
}

impl FileReceiver {
    fn spawn(listener: TcpListener) -> Self {
        let (tx, frames) = mpsc::channel::<Bytes>(COLLECTOR_QUEUE);
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((socket, peer)) = listener.accept().await else {
                    break;
                };
                debug!(%peer, "file sender connected");
                let tx = tx.clone();
                tokio::spawn(async move {
                    // Full binary files can be large; raise the frame cap.
                    let codec = LengthDelimitedCodec::builder()
                        .max_frame_length(256 * 1024 * 1024)
                        .new_codec();
                    let mut frames = FramedRead::new(socket, codec);
                    while let Some(Ok(frame)) = frames.next().await {
                        if tx.send(frame.freeze()).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        FileReceiver {
            frames,
            accept_task,
        }
    }

    async fn next_frame(&mut self) -> Result<Bytes, PeerError> {
        let mut empty_cycles = 0u32;
        loop {
            match tokio::time::timeout(FILE_FRAME_TIMEOUT, self.frames.recv()).await {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => return Err(PeerError::Closed),
                Err(_) => {
                    empty_cycles += 1;
                    debug!(cycle = empty_cycles, "file receiver waiting");
                    if empty_cycles >= FILE_MAX_EMPTY_CYCLES {
                        return Err(PeerError::Timeout {
                            what: "file frame",
                            timeout: FILE_FRAME_TIMEOUT,
                        });
                    }
                }
            }
        }
    }

    /// Receive one complete file: a JSON header frame then its payload.
    pub async fn recv_file(&mut self) -> Result<(FileHeader, Bytes), PeerError> {
        let header: FileHeader = serde_json::from_slice(&self.next_frame().await?)?;
        let payload = self.next_frame().await?;
        if payload.len() as u64 != header.len {
            return Err(PeerError::FileTransfer(format!(
                "payload length {} does not match header {}",
                payload.len(),
                header.len
            )));
        }
        Ok((header, payload))
    }
}

impl Drop for FileReceiver {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

// ---------------------------------------------------------------------------
// MasterPeer
// ---------------------------------------------------------------------------

/// All bound master-side sockets plus the actual ports (relevant when the
/// configuration asked for ephemeral ports).
pub struct MasterPeer {
    pub trigger: TriggerPublisher,
    pub sync: mpsc::Receiver<SyncFrame>,
    pub heartbeats: mpsc::Receiver<Heartbeat>,
    pub files: FileReceiver,
    trigger_port: u16,
    sync_port: u16,
    status_port: u16,
    file_port: u16,
    collector_tasks: Vec<JoinHandle<()>>,
}

impl MasterPeer {
    /// Bind the trigger, sync, heartbeat, and file sockets on `bind_addr`.
    pub async fn bind(
        bind_addr: &str,
        trigger_port: u16,
        sync_port: u16,
        status_port: u16,
        file_port: u16,
    ) -> Result<Self, PeerError> {
        let bind = |socket: &'static str, port: u16| {
            let addr = format!("{bind_addr}:{port}");
            async move {
                TcpListener::bind(&addr)
                    .await
                    .map_err(|source| PeerError::Bind {
                        socket,
                        addr,
                        source,
                    })
            }
        };
        let trigger_listener = bind("trigger", trigger_port).await?;
        let sync_listener = bind("sync", sync_port).await?;
        let status_listener = bind("status", status_port).await?;
        let file_listener = bind("file", file_port).await?;

        let trigger_port = trigger_listener.local_addr().map_or(trigger_port, |a| a.port());
        let sync_port = sync_listener.local_addr().map_or(sync_port, |a| a.port());
        let status_port = status_listener.local_addr().map_or(status_port, |a| a.port());
        let file_port = file_listener.local_addr().map_or(file_port, |a| a.port());

        let (sync, sync_task) =
            spawn_line_collector(sync_listener, |line| SyncFrame::from_line(line).ok());
        let (heartbeats, status_task) = spawn_line_collector(status_listener, |line| {
            serde_json::from_str::<StatusMessage>(line)
                .ok()
                .map(|StatusMessage::Heartbeat(hb)| hb)
        });

        Ok(MasterPeer {
            trigger: TriggerPublisher::spawn(trigger_listener),
            sync,
            heartbeats,
            files: FileReceiver::spawn(file_listener),
            trigger_port,
            sync_port,
            status_port,
            file_port,
            collector_tasks: vec![sync_task, status_task],
        })
    }

    pub fn trigger_port(&self) -> u16 {
        self.trigger_port
    }

    pub fn sync_port(&self) -> u16 {
        self.sync_port
    }

    pub fn status_port(&self) -> u16 {
        self.status_port
    }

    pub fn file_port(&self) -> u16 {
        self.file_port
    }
}

impl Drop for MasterPeer {
    fn drop(&mut self) {
        for task in &self.collector_tasks {
            task.abort();
        }
    }
}
