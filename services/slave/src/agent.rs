//! The slave agent.
//!
//! Serves the command channel, subscribes to triggers, and on trigger runs
//! the local acquisition pipeline.  Data files are held until the master
//! requests them; command handling stays responsive throughout because the
//! pipeline runs on its own task and handlers only touch shared state.

use crate::config::SlaveConfig;
use crate::peer::{self, PeerError};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tagger_core::acquisition::{self, AcquisitionConfig, AcquisitionOutcome};
use tagger_core::dlt::DltLink;
use tagger_core::scpi::{RecordMode, TcLink};
use tagger_core::timetag::{self, TimeTag};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};
use tt_protocol::{
    CommandRequest, CommandResponse, FileKind, SessionState, StatusReport, SyncFrame, Trigger,
    TriggerTimestamp,
};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
const READY_FRAME_DELAY: Duration = Duration::from_millis(500);
const FILE_SEND_DELAY: Duration = Duration::from_millis(500);
const INSTRUMENT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum SlaveError {
    #[error("bind command socket on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Results of the last completed acquisition, held for master requests.
struct SessionData {
    records: Vec<TimeTag>,
    binary_path: PathBuf,
    text_path: Option<PathBuf>,
    fallback: bool,
}

struct AgentCtx {
    cfg: SlaveConfig,
    state: Mutex<StatusReport>,
    data: Mutex<Option<SessionData>>,
}

impl AgentCtx {
    fn set_state(&self, state: SessionState, progress: u8) {
        let mut report = self.state.lock().unwrap();
        info!(state = %state, progress, "state transition");
        report.state = state;
        report.progress = progress;
    }

    fn status(&self) -> StatusReport {
        self.state.lock().unwrap().clone()
    }
}

pub struct SlaveAgent {
    ctx: Arc<AgentCtx>,
    command_listener: TcpListener,
    command_port: u16,
    shutdown: watch::Receiver<bool>,
}

/// Read-only view of the agent's state, for the binary's exit code.
#[derive(Clone)]
pub struct StateHandle {
    ctx: Arc<AgentCtx>,
}

impl StateHandle {
    pub fn state(&self) -> SessionState {
        self.ctx.status().state
    }
}

impl SlaveAgent {
    /// Bind the command listener.  Everything else is outbound and is
    /// connected lazily by `run`.
    pub async fn bind(
        cfg: SlaveConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, SlaveError> {
        let addr = format!("{}:{}", cfg.bind_address, cfg.command_port);
        let command_listener =
            TcpListener::bind(&addr)
                .await
                .map_err(|source| SlaveError::Bind { addr, source })?;
        let command_port = command_listener
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(cfg.command_port);
        info!(command_port, "command channel listening");
        Ok(SlaveAgent {
            ctx: Arc::new(AgentCtx {
                cfg,
                state: Mutex::new(StatusReport {
                    state: SessionState::Idle,
                    progress: 0,
                }),
                data: Mutex::new(None),
            }),
            command_listener,
            command_port,
            shutdown,
        })
    }

    /// The bound command port (relevant when configured as 0).
    pub fn command_port(&self) -> u16 {
        self.command_port
    }

    pub fn state_handle(&self) -> StateHandle {
        StateHandle {
            ctx: self.ctx.clone(),
        }
    }

    /// Serve until shutdown.
    pub async fn run(self) -> Result<(), SlaveError> {
        let SlaveAgent {
            ctx,
            command_listener,
            command_port: _,
            mut shutdown,
        } = self;

        let (mut triggers, trigger_task) = peer::spawn_trigger_subscriber(
            ctx.cfg.master_trigger_addr(),
            shutdown.clone(),
        );

        let hb_ctx = ctx.clone();
        let heartbeat_task = peer::spawn_heartbeat_pusher(
            ctx.cfg.master_status_addr(),
            HEARTBEAT_INTERVAL,
            move || hb_ctx.status().state.name().to_owned(),
            shutdown.clone(),
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                trigger = triggers.recv() => match trigger {
                    Some(trigger) => {
                        let ctx = ctx.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            handle_trigger(ctx, trigger, shutdown).await;
                        });
                    }
                    None => break,
                },
                accepted = command_listener.accept() => match accepted {
                    Ok((socket, master)) => {
                        debug!(%master, "command connection accepted");
                        let ctx = ctx.clone();
                        tokio::spawn(serve_commands(socket, ctx));
                    }
                    Err(e) => warn!(error = %e, "command accept failed"),
                },
            }
        }

        trigger_task.abort();
        heartbeat_task.abort();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Trigger handling
// ---------------------------------------------------------------------------

async fn handle_trigger(ctx: Arc<AgentCtx>, trigger: Trigger, shutdown: watch::Receiver<bool>) {
    let slave_trigger_ns = chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default()
        .max(0) as u64;
    info!(
        sequence = trigger.sequence,
        master_ns = trigger.timestamp,
        slave_ns = slave_trigger_ns,
        duration = trigger.duration,
        "trigger received"
    );
    if matches!(
        ctx.status().state,
        SessionState::Starting | SessionState::Running | SessionState::Draining
    ) {
        // A re-published trigger for the session already in flight.
        debug!(sequence = trigger.sequence, "acquisition already in progress; trigger ignored");
        return;
    }

    let echo = SyncFrame::TriggerTimestamp(TriggerTimestamp {
        slave_trigger_timestamp: slave_trigger_ns,
        sequence: trigger.sequence,
    });
    if let Err(e) = peer::push_sync_frame(&ctx.cfg.master_sync_addr(), &echo).await {
        warn!(error = %e, "failed to echo trigger timestamp");
    }

    ctx.set_state(SessionState::Starting, 10);
    let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let acq = AcquisitionConfig {
        tc_address: ctx.cfg.slave_tc.clone(),
        channels: trigger.channels.clone(),
        duration_secs: trigger.duration,
        mode: RecordMode::Streaming,
        stream_base_port: ctx.cfg.stream_base_port,
        output_dir: ctx.cfg.output_dir.clone(),
        file_stem: format!("slave_results_{stamp}"),
        text_output: ctx.cfg.text_output,
    };

    let outcome: Result<AcquisitionOutcome, String> = async {
        let mut tc = TcLink::connect(&ctx.cfg.slave_tc, INSTRUMENT_TIMEOUT)
            .await
            .map_err(|e| e.to_string())?;
        let identity = tc.identity().await.map_err(|e| e.to_string())?;
        info!(identity = %identity, "time controller connected");
        let mut dlt = match DltLink::connect(&ctx.cfg.dlt_address, INSTRUMENT_TIMEOUT).await {
            Ok(dlt) => Some(dlt),
            Err(e) => {
                warn!(error = %e, "DLT unreachable; acquisition will run degraded");
                None
            }
        };
        ctx.set_state(SessionState::Running, 50);
        acquisition::run_acquisition(&mut tc, dlt.as_mut(), &acq, shutdown)
            .await
            .map_err(|e| e.to_string())
    }
    .await;

    match outcome {
        Ok(outcome) => {
            if !outcome.channel_errors.is_empty() {
                warn!(
                    errors = outcome.channel_errors.len(),
                    "acquisition completed with channel errors"
                );
            }
            info!(
                records = outcome.records.len(),
                fallback = outcome.fallback,
                "acquisition data ready; waiting for master requests"
            );
            *ctx.data.lock().unwrap() = Some(SessionData {
                records: outcome.records,
                binary_path: outcome.binary_path,
                text_path: outcome.text_path,
                fallback: outcome.fallback,
            });
            ctx.set_state(SessionState::Draining, 90);
        }
        Err(message) => {
            warn!(error = %message, "acquisition failed");
            ctx.set_state(SessionState::Error { message }, 100);
        }
    }
}

// ---------------------------------------------------------------------------
// Command handling
// ---------------------------------------------------------------------------

async fn serve_commands(socket: TcpStream, ctx: Arc<AgentCtx>) {
    let mut framed = Framed::new(socket, LinesCodec::new());
    while let Some(line) = framed.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "command channel error");
                return;
            }
        };
        let response = match serde_json::from_str::<CommandRequest>(&line) {
            Ok(request) => {
                debug!(sequence = request.sequence(), "command received");
                handle_request(&ctx, &request)
            }
            Err(e) => CommandResponse::error(format!("unknown command: {e}")),
        };
        let Ok(reply) = serde_json::to_string(&response) else {
            continue;
        };
        if framed.send(reply).await.is_err() {
            return;
        }
    }
    debug!("command connection closed");
}

fn handle_request(ctx: &Arc<AgentCtx>, request: &CommandRequest) -> CommandResponse {
    match request {
        CommandRequest::Ping { .. } => CommandResponse::ok("pong"),
        CommandRequest::Status { .. } => {
            let report = ctx.status();
            match serde_json::to_value(&report) {
                Ok(data) => CommandResponse::ok("status").with_data(data),
                Err(e) => CommandResponse::error(format!("status serialization: {e}")),
            }
        }
        CommandRequest::RequestReady { .. } => {
            let sync_addr = ctx.cfg.master_sync_addr();
            tokio::spawn(async move {
                // Give the master time to arm its sync receiver.
                tokio::time::sleep(READY_FRAME_DELAY).await;
                if let Err(e) = peer::push_sync_frame(&sync_addr, &SyncFrame::Ready).await {
                    warn!(error = %e, "failed to push ready frame");
                }
            });
            CommandResponse::ok("ready frame scheduled")
        }
        CommandRequest::RequestPartialData { .. } => {
            let data = ctx.data.lock().unwrap();
            match data.as_ref() {
                None => CommandResponse::error("no data available yet"),
                Some(d) if d.fallback => {
                    CommandResponse::error("no merged data available (fallback mode)")
                }
                Some(d) => {
                    let count = timetag::partial_count(d.records.len() as u64) as usize;
                    let blob = Bytes::from(timetag::encode_records(&d.records[..count]));
                    schedule_file_push(ctx, FileKind::Partial, "slave_partial_data.bin", blob);
                    CommandResponse::ok(format!("partial data will be sent ({count} records)"))
                }
            }
        }
        CommandRequest::RequestFullData { .. } => {
            let data = ctx.data.lock().unwrap();
            match data.as_ref() {
                None => CommandResponse::error("no data available yet"),
                Some(d) => {
                    let name = file_name_of(&d.binary_path, "slave_results.bin");
                    let blob = Bytes::from(timetag::encode_records(&d.records));
                    schedule_file_push(ctx, FileKind::Full, &name, blob);
                    ctx.set_state(SessionState::Completed, 100);
                    CommandResponse::ok(format!("full data will be sent ({} records)", d.records.len()))
                }
            }
        }
        CommandRequest::RequestTextData { .. } => {
            let data = ctx.data.lock().unwrap();
            match data.as_ref().and_then(|d| d.text_path.clone()) {
                None => CommandResponse::error("no text file available"),
                Some(path) => match std::fs::read(&path) {
                    Ok(bytes) => {
                        let name = file_name_of(&path, "slave_results.txt");
                        schedule_file_push(ctx, FileKind::Text, &name, Bytes::from(bytes));
                        CommandResponse::ok("text data will be sent")
                    }
                    Err(e) => CommandResponse::error(format!("cannot read text file: {e}")),
                },
            }
        }
    }
}

fn file_name_of(path: &std::path::Path, fallback: &str) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| fallback.to_owned())
}

fn schedule_file_push(ctx: &Arc<AgentCtx>, kind: FileKind, name: &str, payload: Bytes) {
    let addr = ctx.cfg.master_file_addr();
    let name = name.to_owned();
    tokio::spawn(async move {
        tokio::time::sleep(FILE_SEND_DELAY).await;
        if let Err(e) = peer::push_file(&addr, kind, &name, payload).await {
            warn!(error = %e, ?kind, "file push failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn ctx() -> Arc<AgentCtx> {
        Arc::new(AgentCtx {
            cfg: SlaveConfig {
                slave_tc: "127.0.0.1:5555".to_owned(),
                master_address: "127.0.0.1".to_owned(),
                dlt_address: "127.0.0.1:6060".to_owned(),
                bind_address: "127.0.0.1".to_owned(),
                trigger_port: 0,
                status_port: 0,
                file_port: 0,
                command_port: 0,
                sync_port: 0,
                stream_base_port: 0,
                output_dir: std::env::temp_dir(),
                verbose: false,
                text_output: false,
            },
            state: Mutex::new(StatusReport {
                state: SessionState::Idle,
                progress: 0,
            }),
            data: Mutex::new(None),
        })
    }

    fn stored_data(records: Vec<TimeTag>, fallback: bool) -> SessionData {
        SessionData {
            records,
            binary_path: Path::new("slave_results_x.bin").to_owned(),
            text_path: None,
            fallback,
        }
    }

    #[tokio::test]
    async fn ping_answers_ok() {
        let ctx = ctx();
        let response = handle_request(&ctx, &CommandRequest::Ping { sequence: 1 });
        assert!(response.is_ok());
    }

    #[tokio::test]
    async fn status_reports_state_and_progress() {
        let ctx = ctx();
        ctx.set_state(SessionState::Running, 50);
        let response = handle_request(&ctx, &CommandRequest::Status { sequence: 2 });
        let data = response.data.unwrap();
        assert_eq!(data["state"], "running");
        assert_eq!(data["progress"], 50);
    }

    #[tokio::test]
    async fn partial_data_request_errors_before_any_acquisition() {
        let ctx = ctx();
        let response =
            handle_request(&ctx, &CommandRequest::RequestPartialData { sequence: 3 });
        assert!(!response.is_ok());
    }

    #[tokio::test]
    async fn partial_data_request_errors_in_fallback_mode() {
        let ctx = ctx();
        let records = vec![TimeTag {
            channel: 1,
            timestamp: 5,
        }];
        *ctx.data.lock().unwrap() = Some(stored_data(records, true));
        let response =
            handle_request(&ctx, &CommandRequest::RequestPartialData { sequence: 4 });
        assert!(!response.is_ok());
        assert!(response.message.contains("fallback"));
    }

    #[tokio::test]
    async fn text_data_request_errors_without_text_file() {
        let ctx = ctx();
        *ctx.data.lock().unwrap() = Some(stored_data(Vec::new(), false));
        let response = handle_request(&ctx, &CommandRequest::RequestTextData { sequence: 5 });
        assert!(!response.is_ok());
    }
}
