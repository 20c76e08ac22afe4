//! The master session controller.
//!
//! Drives one acquisition session end to end: readiness handshake, trigger
//! dispatch, local pipeline, status confirmation, partial-data transfer,
//! offset computation, and the final report.  Worker failures surface as
//! [`SessionError`]; the binary maps them to the `Error` state and exit
//! code 1.

use crate::config::MasterConfig;
use crate::peer::{CommandClient, MasterPeer, PeerError};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tagger_core::acquisition::{self, AcquisitionConfig, AcquisitionError, AcquisitionOutcome};
use tagger_core::dlt::DltLink;
use tagger_core::scpi::{RecordMode, TcLink};
use tagger_core::sync::{self, OffsetStats, ReportContext, SyncError};
use tagger_core::timetag;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tt_protocol::{
    CommandRequest, FileHeader, FileKind, SessionState, SyncFrame, Trigger, TriggerMessage,
    TriggerTimestamp,
};

/// `request_ready` attempts before giving up on the slave.
pub const READY_RETRIES: u32 = 5;
/// Back-off between `request_ready` attempts.
pub const READY_BACKOFF: Duration = Duration::from_millis(500);
/// How long each attempt waits for the ready frame.
pub const READY_WAIT: Duration = Duration::from_secs(2);
/// Trigger re-publishes tolerated before aborting.
pub const TRIGGER_REPUBLISH_LIMIT: u32 = 3;

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(500);
const STATUS_POLLS_PER_TRIGGER: u32 = 4;
const DATA_REQUEST_RETRIES: u32 = 10;
const DATA_REQUEST_BACKOFF: Duration = Duration::from_secs(1);
const INSTRUMENT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("slave unavailable: {0}")]
    SlaveUnavailable(String),
    #[error("slave never signalled ready for trigger")]
    ReadyTimeout,
    #[error("slave did not start running after trigger")]
    SlaveNotRunning,
    #[error("slave data transfer failed: {0}")]
    SlaveData(String),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),
    #[error("file: {0}")]
    File(#[from] timetag::FileError),
    #[error("synchronisation: {0}")]
    Sync(#[from] SyncError),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("local pipeline task failed: {0}")]
    PipelineJoin(String),
}

/// What a completed session produced.
#[derive(Debug)]
pub struct SessionSummary {
    pub state: SessionState,
    pub master_binary: PathBuf,
    pub record_count: usize,
    pub offset: Option<OffsetStats>,
    pub report_path: Option<PathBuf>,
    pub corrected_path: Option<PathBuf>,
    pub completed_with_errors: bool,
}

pub struct SessionController {
    cfg: MasterConfig,
    peer: MasterPeer,
    command: CommandClient,
    command_sequence: u32,
    trigger_sequence: u32,
    master_trigger_ns: u64,
    slave_trigger_ns: Option<u64>,
}

impl SessionController {
    /// Connect the command channel; failure here means the slave is absent.
    pub async fn connect(cfg: MasterConfig, peer: MasterPeer) -> Result<Self, SessionError> {
        let addr = cfg.slave_command_addr();
        let command = CommandClient::connect(&addr)
            .await
            .map_err(|e| SessionError::SlaveUnavailable(e.to_string()))?;
        info!(slave = %addr, "command channel connected");
        Ok(SessionController {
            cfg,
            peer,
            command,
            command_sequence: 0,
            trigger_sequence: 0,
            master_trigger_ns: 0,
            slave_trigger_ns: None,
        })
    }

    pub fn wall_clock_ns() -> u64 {
        chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .max(0) as u64
    }

    fn next_command_sequence(&mut self) -> u32 {
        self.command_sequence += 1;
        self.command_sequence
    }

    /// The sequence the most recent trigger was published with.
    pub fn trigger_sequence(&self) -> u32 {
        self.trigger_sequence
    }

    pub fn slave_trigger_ns(&self) -> Option<u64> {
        self.slave_trigger_ns
    }

    // -----------------------------------------------------------------------
    // Protocol steps
    // -----------------------------------------------------------------------

    /// Step 1: verify the slave answers on the command channel.
    pub async fn ping_slave(&mut self) -> Result<(), SessionError> {
        let sequence = self.next_command_sequence();
        let response = self
            .command
            .request(&CommandRequest::Ping { sequence })
            .await
            .map_err(|e| SessionError::SlaveUnavailable(e.to_string()))?;
        if response.is_ok() {
            info!("slave reachable");
            Ok(())
        } else {
            Err(SessionError::SlaveUnavailable(response.message))
        }
    }

    /// Step 2: request readiness until the ready frame is observed.
    /// Returns the number of attempts used.
    pub async fn await_slave_ready(&mut self) -> Result<u32, SessionError> {
        for attempt in 1..=READY_RETRIES {
            let sequence = self.next_command_sequence();
            match self
                .command
                .request(&CommandRequest::RequestReady { sequence })
                .await
            {
                Ok(response) if response.is_ok() => {}
                Ok(response) => warn!(message = %response.message, "request_ready rejected"),
                Err(e) => warn!(error = %e, "request_ready failed"),
            }

            let deadline = tokio::time::Instant::now() + READY_WAIT;
            loop {
                let now = tokio::time::Instant::now();
                if now >= deadline {
                    break;
                }
                match tokio::time::timeout(deadline - now, self.peer.sync.recv()).await {
                    Ok(Some(SyncFrame::Ready)) => {
                        info!(attempt, "slave ready for trigger");
                        return Ok(attempt);
                    }
                    Ok(Some(SyncFrame::TriggerTimestamp(ts))) => self.note_trigger_echo(&ts),
                    Ok(None) => return Err(PeerError::Closed.into()),
                    Err(_) => break,
                }
            }
            warn!(attempt, "no ready frame observed; retrying");
            tokio::time::sleep(READY_BACKOFF).await;
        }
        Err(SessionError::ReadyTimeout)
    }

    /// Step 3: record the dispatch wall clock and publish the trigger.
    /// Every publish (including re-publishes) increments the sequence.
    pub async fn publish_trigger(&mut self) -> Result<(), SessionError> {
        self.trigger_sequence += 1;
        self.master_trigger_ns = Self::wall_clock_ns();
        let msg = TriggerMessage::Trigger(Trigger {
            timestamp: self.master_trigger_ns,
            sequence: self.trigger_sequence,
            duration: self.cfg.duration_secs,
            channels: self.cfg.channels.clone(),
        });
        let reached = self.peer.trigger.publish(&msg).await?;
        info!(
            sequence = self.trigger_sequence,
            reached, timestamp_ns = self.master_trigger_ns, "trigger published"
        );
        Ok(())
    }

    /// Step 5: confirm the slave reports `running`, re-publishing the
    /// trigger a bounded number of times.
    pub async fn confirm_slave_running(&mut self) -> Result<(), SessionError> {
        for republish in 0..=TRIGGER_REPUBLISH_LIMIT {
            if republish > 0 {
                warn!(republish, "slave not running; re-publishing trigger");
                self.publish_trigger().await?;
            }
            for _ in 0..STATUS_POLLS_PER_TRIGGER {
                tokio::time::sleep(STATUS_POLL_INTERVAL).await;
                self.drain_side_channels();
                match self.slave_state().await {
                    // Short acquisitions can already be past `running` by
                    // the first poll; any of these confirms the trigger took.
                    Ok(Some(state))
                        if matches!(state.as_str(), "running" | "draining" | "completed") =>
                    {
                        info!(%state, "slave confirmed acquiring");
                        return Ok(());
                    }
                    Ok(state) => debug!(?state, "slave not running yet"),
                    Err(e) => warn!(error = %e, "status poll failed"),
                }
            }
        }
        Err(SessionError::SlaveNotRunning)
    }

    async fn slave_state(&mut self) -> Result<Option<String>, SessionError> {
        let sequence = self.next_command_sequence();
        let response = self
            .command
            .request(&CommandRequest::Status { sequence })
            .await?;
        Ok(response
            .data
            .as_ref()
            .and_then(|d| d.get("state"))
            .and_then(|s| s.as_str())
            .map(str::to_owned))
    }

    /// Pull any queued sync frames and heartbeats off the collectors.
    fn drain_side_channels(&mut self) {
        while let Ok(frame) = self.peer.sync.try_recv() {
            if let SyncFrame::TriggerTimestamp(ts) = frame {
                self.note_trigger_echo(&ts);
            }
        }
        while let Ok(hb) = self.peer.heartbeats.try_recv() {
            debug!(status = %hb.status, timestamp = hb.timestamp, "heartbeat");
        }
    }

    fn note_trigger_echo(&mut self, ts: &TriggerTimestamp) {
        info!(
            slave_trigger_ns = ts.slave_trigger_timestamp,
            sequence = ts.sequence,
            "slave trigger timestamp received"
        );
        self.slave_trigger_ns = Some(ts.slave_trigger_timestamp);
    }

    /// The trigger-timestamp offset (slave minus master), when known.
    pub fn trigger_offset_ns(&self) -> Option<i64> {
        self.slave_trigger_ns
            .map(|slave| slave as i64 - self.master_trigger_ns as i64)
    }

    // -----------------------------------------------------------------------
    // Local pipeline
    // -----------------------------------------------------------------------

    fn spawn_pipeline(
        &self,
    ) -> (
        watch::Sender<bool>,
        JoinHandle<Result<AcquisitionOutcome, AcquisitionError>>,
    ) {
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let acq = AcquisitionConfig {
            tc_address: self.cfg.master_tc.clone(),
            channels: self.cfg.channels.clone(),
            duration_secs: self.cfg.duration_secs,
            mode: RecordMode::Streaming,
            stream_base_port: self.cfg.stream_base_port,
            output_dir: self.cfg.output_dir.clone(),
            file_stem: format!("master_results_{stamp}"),
            text_output: self.cfg.text_output,
        };
        let tc_addr = self.cfg.master_tc.clone();
        let dlt_addr = self.cfg.dlt_address.clone();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut tc = TcLink::connect(&tc_addr, INSTRUMENT_TIMEOUT).await?;
            let identity = tc.identity().await?;
            info!(identity = %identity, "time controller connected");
            let mut dlt = match DltLink::connect(&dlt_addr, INSTRUMENT_TIMEOUT).await {
                Ok(dlt) => Some(dlt),
                Err(e) => {
                    warn!(error = %e, "DLT unreachable; acquisition will run degraded");
                    None
                }
            };
            acquisition::run_acquisition(&mut tc, dlt.as_mut(), &acq, stop_rx).await
        });
        (stop_tx, handle)
    }

    // -----------------------------------------------------------------------
    // Data transfer
    // -----------------------------------------------------------------------

    /// Ask the slave for a file and receive it, retrying while the slave
    /// still reports its data as unavailable.
    async fn fetch_slave_file(
        &mut self,
        kind: FileKind,
    ) -> Result<(FileHeader, Bytes), SessionError> {
        let mut last_message = String::new();
        for attempt in 1..=DATA_REQUEST_RETRIES {
            let sequence = self.next_command_sequence();
            let request = match kind {
                FileKind::Partial => CommandRequest::RequestPartialData { sequence },
                FileKind::Full => CommandRequest::RequestFullData { sequence },
                FileKind::Text => CommandRequest::RequestTextData { sequence },
            };
            let response = self.command.request(&request).await?;
            if response.is_ok() {
                let (header, payload) = self.peer.files.recv_file().await?;
                if header.kind != kind {
                    return Err(SessionError::SlaveData(format!(
                        "expected {kind:?} file, slave sent {:?}",
                        header.kind
                    )));
                }
                return Ok((header, payload));
            }
            last_message = response.message;
            debug!(attempt, message = %last_message, "slave data not ready");
            tokio::time::sleep(DATA_REQUEST_BACKOFF).await;
        }
        Err(SessionError::SlaveData(last_message))
    }

    fn save_received_file(&self, header: &FileHeader, payload: &[u8]) -> Result<PathBuf, SessionError> {
        // Only the file-name component of the announced name is honoured.
        let name = Path::new(&header.name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "slave_file.bin".to_owned());
        let path = self.cfg.output_dir.join(name);
        std::fs::write(&path, payload)?;
        info!(path = %path.display(), bytes = payload.len(), kind = ?header.kind, "slave file saved");
        Ok(path)
    }

    // -----------------------------------------------------------------------
    // Session
    // -----------------------------------------------------------------------

    /// Run the whole session.  On success the master is `Completed`; any
    /// error maps to the `Error` state in the binary.
    pub async fn run(mut self) -> Result<SessionSummary, SessionError> {
        info!(state = %SessionState::Starting, "session starting");
        self.ping_slave().await?;
        self.await_slave_ready().await?;
        self.publish_trigger().await?;

        let (pipeline_stop, pipeline) = self.spawn_pipeline();
        info!(state = %SessionState::Running, "acquisition running");

        if let Err(e) = self.confirm_slave_running().await {
            let _ = pipeline_stop.send(true);
            let _ = pipeline.await;
            return Err(e);
        }

        let outcome = pipeline
            .await
            .map_err(|e| SessionError::PipelineJoin(e.to_string()))??;
        info!(
            state = %SessionState::Draining,
            records = outcome.records.len(),
            "local acquisition complete"
        );
        self.drain_side_channels();

        // Partial data drives the offset computation.
        let (partial_header, partial_payload) = self.fetch_slave_file(FileKind::Partial).await?;
        self.save_received_file(&partial_header, &partial_payload)?;
        let slave_partial = timetag::decode_records(&partial_payload)?;

        let master_prefix_len =
            timetag::partial_count(outcome.records.len() as u64) as usize;
        let master_prefix: Vec<u64> = outcome.records[..master_prefix_len]
            .iter()
            .map(|t| t.timestamp)
            .collect();
        let slave_prefix: Vec<u64> = slave_partial.iter().map(|t| t.timestamp).collect();

        let (offset, report_path, corrected_path) =
            match sync::compute_offset(&master_prefix, &slave_prefix) {
                Ok(stats) => {
                    let report_path = self.write_report(&stats)?;
                    let corrected_path =
                        sync::write_corrected_master(&outcome.binary_path, stats.correction_ps())?;
                    (Some(stats), Some(report_path), Some(corrected_path))
                }
                Err(SyncError::NoValidSamples) => {
                    warn!("cannot calculate sync: no valid offset samples");
                    (None, None, None)
                }
                Err(e) => return Err(e.into()),
            };

        // Bulk data for offline analysis; failures here are not fatal.
        match self.fetch_slave_file(FileKind::Full).await {
            Ok((header, payload)) => {
                self.save_received_file(&header, &payload)?;
            }
            Err(e) => warn!(error = %e, "full data transfer failed"),
        }
        if self.cfg.text_output {
            match self.fetch_slave_file(FileKind::Text).await {
                Ok((header, payload)) => {
                    self.save_received_file(&header, &payload)?;
                }
                Err(e) => warn!(error = %e, "text data transfer failed"),
            }
        }

        info!(state = %SessionState::Completed, "session completed");
        Ok(SessionSummary {
            state: SessionState::Completed,
            master_binary: outcome.binary_path,
            record_count: outcome.records.len(),
            offset,
            report_path,
            corrected_path,
            completed_with_errors: !outcome.channel_errors.is_empty(),
        })
    }

    fn write_report(&self, stats: &OffsetStats) -> Result<PathBuf, SessionError> {
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let path = self
            .cfg
            .output_dir
            .join(format!("offset_report_{stamp}.txt"));
        let ctx = ReportContext {
            master_address: self.cfg.master_tc.clone(),
            slave_address: self.cfg.slave.clone(),
            trigger_offset_ns: self.trigger_offset_ns(),
        };
        sync::write_report(&path, &ctx, stats)?;
        info!(path = %path.display(), "offset report written");
        Ok(path)
    }
}
