//! Test doubles for the two local instrument services.
//!
//! [`MockTimeController`] and [`MockDlt`] are real TCP servers on ephemeral
//! ports with scripted replies, so adapter and pipeline code is exercised
//! over genuine sockets.  [`StreamPusher`] plays the role of DLT's stream
//! side, pushing length-prefixed timestamp batches at a stream client.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, FramedWrite, LengthDelimitedCodec, LinesCodec};

// ---------------------------------------------------------------------------
// MockTimeController
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TcState {
    replies: HashMap<String, String>,
    muted: HashSet<String>,
    log: Vec<String>,
    stage: String,
}

/// A scripted SCPI endpoint.
///
/// Unscripted commands get defaults: queries reply `0`, writes reply an
/// empty line.  `REC:PLAY` / `REC:STOP` flip the stage reported by
/// `REC:STAGe?` unless a fixed stage reply was scripted.
pub struct MockTimeController {
    port: u16,
    state: Arc<Mutex<TcState>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl MockTimeController {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock TC");
        let port = listener.local_addr().expect("local addr").port();
        let state = Arc::new(Mutex::new(TcState {
            stage: "STOPPED".to_owned(),
            ..TcState::default()
        }));
        let tasks: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_state = state.clone();
        let accept_tasks = tasks.clone();
        let accept = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let state = accept_state.clone();
                let conn = tokio::spawn(serve_tc(socket, state));
                accept_tasks.lock().unwrap().push(conn);
            }
        });
        tasks.lock().unwrap().push(accept);

        MockTimeController { port, state, tasks }
    }

    pub fn addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    /// Script an exact reply for an exact command.
    pub fn set_reply(&self, cmd: &str, reply: &str) {
        self.state
            .lock()
            .unwrap()
            .replies
            .insert(cmd.to_owned(), reply.to_owned());
    }

    /// Swallow a command without replying (provokes client timeouts).
    pub fn mute(&self, cmd: &str) {
        self.state.lock().unwrap().muted.insert(cmd.to_owned());
    }

    /// Every command received so far, in arrival order.
    pub fn command_log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }
}

impl Drop for MockTimeController {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

async fn serve_tc(socket: TcpStream, state: Arc<Mutex<TcState>>) {
    let mut framed = Framed::new(socket, LinesCodec::new());
    while let Some(Ok(cmd)) = framed.next().await {
        let reply = {
            let mut state = state.lock().unwrap();
            state.log.push(cmd.clone());
            if state.muted.contains(&cmd) {
                continue;
            }
            if cmd == "REC:PLAY" {
                state.stage = "PLAYING".to_owned();
            } else if cmd == "REC:STOP" {
                state.stage = "STOPPED".to_owned();
            }
            if let Some(reply) = state.replies.get(&cmd) {
                reply.clone()
            } else if cmd == "*IDN?" {
                "MockTC,0.1".to_owned()
            } else if cmd == "REC:STAGe?" {
                state.stage.clone()
            } else if cmd.ends_with('?') {
                "0".to_owned()
            } else {
                String::new()
            }
        };
        if framed.send(reply).await.is_err() {
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// MockDlt
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DltState {
    active: Vec<String>,
    statuses: HashMap<String, serde_json::Value>,
    failures: HashMap<String, String>,
    stopped: Vec<String>,
    /// Batches pushed at each stream port when `start-stream` arrives.
    push_batches: Option<Vec<Vec<u64>>>,
    next_status: Option<(u64, f64)>,
}

/// A scripted DataLinkTarget command endpoint.
pub struct MockDlt {
    port: u16,
    state: Arc<Mutex<DltState>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl MockDlt {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock DLT");
        let port = listener.local_addr().expect("local addr").port();
        let state = Arc::new(Mutex::new(DltState::default()));
        let tasks: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_state = state.clone();
        let accept_tasks = tasks.clone();
        let accept = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let state = accept_state.clone();
                let conn = tokio::spawn(serve_dlt(socket, state));
                accept_tasks.lock().unwrap().push(conn);
            }
        });
        tasks.lock().unwrap().push(accept);

        MockDlt { port, state, tasks }
    }

    pub fn addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    /// Pre-populate the active acquisition list.
    pub fn add_acquisition(&self, id: &str) {
        self.state.lock().unwrap().active.push(id.to_owned());
    }

    /// Script the `status --id` reply for one acquisition.
    pub fn set_status(&self, id: &str, acquisitions_count: u64, inactivity: f64) {
        self.state.lock().unwrap().statuses.insert(
            id.to_owned(),
            serde_json::json!({
                "acquisitions_count": acquisitions_count,
                "inactivity": inactivity,
            }),
        );
    }

    /// Script an `{error: ...}` reply for one exact command line.
    pub fn fail_command(&self, cmd: &str, description: &str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(cmd.to_owned(), description.to_owned());
    }

    /// Ids stopped via `stop --id`, in order.
    pub fn stopped_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().stopped.clone()
    }

    /// When `start-stream` arrives, connect to the requested stream port,
    /// push these batches, then an end-of-stream frame.  Newly started
    /// acquisitions report `acquisitions_count = batches.len()` and the
    /// given inactivity, so a drain loop completes naturally.
    pub fn push_on_start(&self, batches: Vec<Vec<u64>>, reported_inactivity: f64) {
        let mut state = self.state.lock().unwrap();
        state.next_status = Some((batches.len() as u64, reported_inactivity));
        state.push_batches = Some(batches);
    }

    /// Close the listener and every open connection.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl Drop for MockDlt {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn serve_dlt(socket: TcpStream, state: Arc<Mutex<DltState>>) {
    let mut framed = Framed::new(socket, LinesCodec::new());
    while let Some(Ok(cmd)) = framed.next().await {
        let reply = dlt_reply(&cmd, &state);
        if framed.send(reply.to_string()).await.is_err() {
            break;
        }
    }
}

fn dlt_reply(cmd: &str, state: &Arc<Mutex<DltState>>) -> serde_json::Value {
    let mut state = state.lock().unwrap();
    if let Some(description) = state.failures.get(cmd) {
        return serde_json::json!({ "error": { "description": description } });
    }
    if cmd == "list" {
        return serde_json::json!(state.active.clone());
    }
    if let Some(id) = cmd.strip_prefix("stop --id ") {
        let id = id.trim().to_owned();
        state.stopped.push(id.clone());
        state.active.retain(|a| *a != id);
        let status = state
            .statuses
            .get(&id)
            .cloned()
            .unwrap_or_else(|| serde_json::json!({ "acquisitions_count": 0, "inactivity": 0.0 }));
        return serde_json::json!({ "status": status });
    }
    if let Some(id) = cmd.strip_prefix("status --id ") {
        let id = id.trim();
        return state
            .statuses
            .get(id)
            .cloned()
            .unwrap_or_else(|| serde_json::json!({ "acquisitions_count": 0, "inactivity": 0.0 }));
    }
    if cmd.starts_with("start-stream ") {
        let channel = field(cmd, "--channel").unwrap_or_default();
        let id = format!("acq-{channel}");
        state.active.push(id.clone());
        if let Some((count, inactivity)) = state.next_status {
            state.statuses.insert(
                id.clone(),
                serde_json::json!({ "acquisitions_count": count, "inactivity": inactivity }),
            );
        }
        if let Some(batches) = state.push_batches.clone() {
            if let Some(port) = field(cmd, "--stream-port").and_then(|p| p.parse::<u16>().ok()) {
                tokio::spawn(async move {
                    let mut pusher = StreamPusher::connect(port).await;
                    for batch in batches {
                        pusher.push_timestamps(&batch).await;
                    }
                    pusher.finish().await;
                });
            }
        }
        return serde_json::json!({ "id": id });
    }
    serde_json::json!({})
}

fn field(cmd: &str, name: &str) -> Option<String> {
    let mut words = cmd.split_whitespace();
    while let Some(word) = words.next() {
        if word == name {
            return words.next().map(str::to_owned);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// StreamPusher
// ---------------------------------------------------------------------------

/// Pushes length-prefixed binary frames at a stream client, standing in for
/// DLT's stream side.
pub struct StreamPusher {
    sink: FramedWrite<TcpStream, LengthDelimitedCodec>,
}

impl StreamPusher {
    pub async fn connect(port: u16) -> Self {
        let socket = TcpStream::connect(("127.0.0.1", port))
            .await
            .expect("connect stream pusher");
        StreamPusher {
            sink: FramedWrite::new(socket, LengthDelimitedCodec::new()),
        }
    }

    pub async fn push(&mut self, bytes: &[u8]) {
        self.sink
            .send(Bytes::copy_from_slice(bytes))
            .await
            .expect("push frame");
    }

    pub async fn push_timestamps(&mut self, timestamps: &[u64]) {
        let bytes: Vec<u8> = timestamps.iter().flat_map(|t| t.to_le_bytes()).collect();
        self.push(&bytes).await;
    }

    /// Send the zero-length end-of-stream frame.
    pub async fn finish(&mut self) {
        self.sink.send(Bytes::new()).await.expect("push end of stream");
    }
}
