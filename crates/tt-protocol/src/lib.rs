// tt-protocol: Master/slave peer-link message types and serialization.
//
// The peer link is five TCP socket pairs carrying newline-delimited JSON
// (the file channel additionally carries raw length-prefixed payload
// frames).  Each JSON message is discriminated by a top-level `command`
// field, except heartbeats which use `type` -- both tags are part of the
// frozen wire format and must not change.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Port defaults
// ---------------------------------------------------------------------------

/// Trigger channel (master binds, slave subscribes).
pub const DEFAULT_TRIGGER_PORT: u16 = 5557;
/// Heartbeat/status channel (master binds, slave pushes).
pub const DEFAULT_STATUS_PORT: u16 = 5559;
/// Bulk file transfer channel (master binds, slave pushes).
pub const DEFAULT_FILE_PORT: u16 = 5560;
/// Command/response channel (slave binds, master connects).
pub const DEFAULT_COMMAND_PORT: u16 = 5561;
/// Sync/ready channel (master binds, slave pushes).
pub const DEFAULT_SYNC_PORT: u16 = 5562;

/// The single bare-string frame a slave pushes on the sync channel once its
/// trigger subscription is live.
pub const READY_FOR_TRIGGER: &str = "ready_for_trigger";

// ---------------------------------------------------------------------------
// Command channel (C): master -> slave requests
// ---------------------------------------------------------------------------

/// All requests the master can issue on the command channel.
///
/// Serializes with the request name in the `command` field:
///
/// ```json
/// { "command": "request_ready", "sequence": 3 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum CommandRequest {
    Ping { sequence: u32 },
    Status { sequence: u32 },
    RequestReady { sequence: u32 },
    RequestPartialData { sequence: u32 },
    RequestFullData { sequence: u32 },
    RequestTextData { sequence: u32 },
}

impl CommandRequest {
    pub fn sequence(&self) -> u32 {
        match *self {
            CommandRequest::Ping { sequence }
            | CommandRequest::Status { sequence }
            | CommandRequest::RequestReady { sequence }
            | CommandRequest::RequestPartialData { sequence }
            | CommandRequest::RequestFullData { sequence }
            | CommandRequest::RequestTextData { sequence } => sequence,
        }
    }
}

/// Outcome discriminator for command responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Slave reply on the command channel.
///
/// `data` carries request-specific payload (e.g. a [`StatusReport`] for
/// `status` requests) and is omitted from the wire when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub status: ResponseStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl CommandResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        CommandResponse {
            status: ResponseStatus::Ok,
            message: message.into(),
            data: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        CommandResponse {
            status: ResponseStatus::Error,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Trigger channel (T): master -> slave
// ---------------------------------------------------------------------------

/// The acquisition trigger.
///
/// `timestamp` is the master's wall clock in nanoseconds at dispatch.  The
/// wall clocks of the two nodes are unrelated; the offset computation is
/// what establishes the relation afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub timestamp: u64,
    pub sequence: u32,
    /// Acquisition duration in seconds.
    pub duration: f64,
    pub channels: Vec<i32>,
}

/// Messages on the trigger channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum TriggerMessage {
    Trigger(Trigger),
}

// ---------------------------------------------------------------------------
// Sync channel (Y): slave -> master
// ---------------------------------------------------------------------------

/// The slave's wall clock at trigger reception, echoed back to the master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerTimestamp {
    pub slave_trigger_timestamp: u64,
    pub sequence: u32,
}

/// JSON messages on the sync channel (the ready frame is a bare string and
/// is handled by [`SyncFrame`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum SyncMessage {
    TriggerTimestamp(TriggerTimestamp),
}

/// One frame on the sync channel.
///
/// The wire carries either the bare line `ready_for_trigger` or a JSON
/// [`SyncMessage`]; `from_line`/`to_line` keep both forms intact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncFrame {
    Ready,
    TriggerTimestamp(TriggerTimestamp),
}

impl SyncFrame {
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        match self {
            SyncFrame::Ready => Ok(READY_FOR_TRIGGER.to_owned()),
            SyncFrame::TriggerTimestamp(ts) => {
                serde_json::to_string(&SyncMessage::TriggerTimestamp(ts.clone()))
            }
        }
    }

    pub fn from_line(line: &str) -> Result<Self, FrameError> {
        let line = line.trim();
        if line == READY_FOR_TRIGGER {
            return Ok(SyncFrame::Ready);
        }
        match serde_json::from_str::<SyncMessage>(line) {
            Ok(SyncMessage::TriggerTimestamp(ts)) => Ok(SyncFrame::TriggerTimestamp(ts)),
            Err(e) => Err(FrameError::Json(e)),
        }
    }
}

// ---------------------------------------------------------------------------
// Heartbeat channel (H): slave -> master
// ---------------------------------------------------------------------------

/// Periodic liveness report.  `timestamp` is the slave's wall clock in
/// milliseconds; `status` is the slave's current state name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub status: String,
    pub timestamp: u64,
}

/// Messages on the heartbeat channel, tagged on `type` (not `command`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusMessage {
    Heartbeat(Heartbeat),
}

// ---------------------------------------------------------------------------
// File channel (F): slave -> master
// ---------------------------------------------------------------------------

/// What a transferred file contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    /// First-10% prefix of the merged binary records, for offset computation.
    Partial,
    /// The complete merged binary file.
    Full,
    /// The merged text file.
    Text,
}

/// Header frame preceding each raw payload frame on the file channel.
///
/// Carrying the kind explicitly replaces the size-threshold heuristic the
/// receiver would otherwise need to classify incoming files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    pub kind: FileKind,
    pub name: String,
    /// Payload length in bytes; must match the following frame.
    pub len: u64,
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Node-local session lifecycle.
///
/// Transitions: `Idle -> Starting -> Running -> Draining -> Completed`,
/// with `Error` reachable from any non-terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Draining,
    Completed,
    Error { message: String },
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Draining => "draining",
            SessionState::Completed => "completed",
            SessionState::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Error { .. })
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Status payload returned in `data` for `status` requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub state: SessionState,
    /// 0..=100.
    pub progress: u8,
}

// ---------------------------------------------------------------------------
// Frame errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}
