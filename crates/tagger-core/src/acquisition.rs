//! Per-node acquisition pipeline.
//!
//! One call to [`run_acquisition`] drives a complete local acquisition:
//! reference unlink, record setup, per-channel stream ingestion through
//! DLT, merge, drain, close-out, and file output.  When DLT is unreachable
//! the pipeline degrades to polling the Time Controller directly -- no
//! interleaved merge, no sub-acquisition offsets, data preserved.

use crate::dlt::{DltError, DltLink};
use crate::merge::{ChannelSource, MergeError, Merger};
use crate::scpi::{DEAD_TIME_PS, RecordMode, TcError, TcLink};
use crate::stream::{BATCH_QUEUE_DEPTH, StreamClient, StreamError};
use crate::timetag::{self, ChannelId, FileError, TimeTag};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// How long to wait for a worker task before abandoning it on shutdown.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum AcquisitionError {
    #[error(transparent)]
    Tc(#[from] TcError),
    #[error(transparent)]
    Dlt(#[from] DltError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    File(#[from] FileError),
}

#[derive(Debug, Clone)]
pub struct AcquisitionConfig {
    /// The TC address DLT should pull the streams from.
    pub tc_address: String,
    pub channels: Vec<ChannelId>,
    pub duration_secs: f64,
    pub mode: RecordMode,
    pub stream_base_port: u16,
    pub output_dir: PathBuf,
    /// Output files are `<stem>.txt` / `<stem>.bin` in `output_dir`.
    pub file_stem: String,
    pub text_output: bool,
}

impl AcquisitionConfig {
    pub fn binary_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.bin", self.file_stem))
    }

    pub fn text_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.txt", self.file_stem))
    }

    pub fn pwid_ps(&self) -> u64 {
        (self.duration_secs * 1e12) as u64
    }

    pub fn pper_ps(&self) -> u64 {
        self.pwid_ps() + DEAD_TIME_PS
    }
}

#[derive(Debug)]
pub struct AcquisitionOutcome {
    /// Merged records in output order (fallback: raw per-channel order).
    pub records: Vec<TimeTag>,
    pub binary_path: PathBuf,
    pub text_path: Option<PathBuf>,
    /// Per-channel close-out problems; non-empty means "completed with errors".
    pub channel_errors: Vec<String>,
    /// True when the direct-poll fallback produced the data.
    pub fallback: bool,
}

/// Run one acquisition to completion.
///
/// `dlt` is `None` when the DLT connect already failed; a failure while
/// starting the streams also falls back to direct polling.
pub async fn run_acquisition(
    tc: &mut TcLink,
    mut dlt: Option<&mut DltLink>,
    cfg: &AcquisitionConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<AcquisitionOutcome, AcquisitionError> {
    for &channel in &cfg.channels {
        tc.unlink_reference(channel).await?;
    }

    if let Some(dlt) = dlt.as_deref_mut() {
        if let Err(e) = dlt.close_active_acquisitions().await {
            warn!(error = %e, "could not close stale acquisitions");
        }
        tc.configure_record(cfg.mode, cfg.pwid_ps(), cfg.pper_ps()).await?;
        match start_streams(tc, dlt, cfg, shutdown.clone()).await {
            Ok(streams) => return streamed_run(tc, dlt, cfg, streams, shutdown).await,
            // Only a DLT failure degrades to direct polling; instrument
            // failures are fatal.
            Err(AcquisitionError::Dlt(e)) => {
                warn!(error = %e, "DLT stream setup failed; falling back to direct TC polling");
            }
            Err(e) => return Err(e),
        }
    }
    fallback_run(tc, cfg, shutdown).await
}

// ---------------------------------------------------------------------------
// Streamed path
// ---------------------------------------------------------------------------

struct StartedStreams {
    handles: Vec<(ChannelId, JoinHandle<Result<(), StreamError>>)>,
    sources: Vec<ChannelSource>,
    acquisition_ids: BTreeMap<ChannelId, String>,
}

async fn start_streams(
    tc: &mut TcLink,
    dlt: &mut DltLink,
    cfg: &AcquisitionConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<StartedStreams, AcquisitionError> {
    let mut handles = Vec::new();
    let mut sources = Vec::new();
    let mut acquisition_ids = BTreeMap::new();
    for &channel in &cfg.channels {
        tc.clear_errors(channel).await?;
        let (tx, rx) = mpsc::channel(BATCH_QUEUE_DEPTH);
        let client =
            StreamClient::bind(channel, cfg.stream_base_port, tx, shutdown.clone()).await?;
        let port = client.local_port();
        let id = dlt.start_stream(&cfg.tc_address, channel, port).await?;
        tc.set_send(channel, true).await?;
        info!(channel, port, id = %id, "stream started");
        handles.push((channel, tokio::spawn(client.run())));
        sources.push(ChannelSource {
            channel,
            batches: rx,
        });
        acquisition_ids.insert(channel, id);
    }
    Ok(StartedStreams {
        handles,
        sources,
        acquisition_ids,
    })
}

async fn streamed_run(
    tc: &mut TcLink,
    dlt: &mut DltLink,
    cfg: &AcquisitionConfig,
    streams: StartedStreams,
    mut shutdown: watch::Receiver<bool>,
) -> Result<AcquisitionOutcome, AcquisitionError> {
    let text_path = cfg.text_path();
    let (expect_tx, expect_rx) = watch::channel(true);
    let merger = Merger::new(streams.sources, &text_path, cfg.pper_ps(), expect_rx).await?;
    let merger_handle = tokio::spawn(merger.run());

    tc.play().await?;
    info!(duration_secs = cfg.duration_secs, "acquisition in progress");
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs_f64(cfg.duration_secs)) => {}
        _ = shutdown.changed() => {
            warn!("acquisition interrupted by shutdown");
        }
    }
    tc.stop().await?;

    let drain = DrainParams {
        transfer_timeout_secs: cfg.duration_secs.max(2.0),
        ..DrainParams::default()
    };
    wait_end_of_acquisition(tc, dlt, &streams.acquisition_ids, &drain).await;
    let mut channel_errors = close_acquisition(tc, dlt, &streams.acquisition_ids).await;

    // No more batches will arrive: stop the clients, then let the merger
    // drain whatever is buffered.
    for (channel, handle) in streams.handles {
        match tokio::time::timeout(JOIN_TIMEOUT, handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                warn!(channel, error = %e, "stream client ended with error");
                channel_errors.push(format!("channel {channel}: {e}"));
            }
            Ok(Err(join_err)) => {
                warn!(channel, error = %join_err, "stream client task failed");
                channel_errors.push(format!("channel {channel}: task failed"));
            }
            Err(_) => {
                warn!(channel, "stream client did not stop in time; abandoning");
            }
        }
    }
    let _ = expect_tx.send(false);
    let outcome = merger_handle
        .await
        .map_err(|e| MergeError::Io {
            path: text_path.clone(),
            source: std::io::Error::other(e),
        })??;

    let binary_path = cfg.binary_path();
    timetag::write_binary(&binary_path, &outcome.records)?;
    info!(
        records = outcome.records.len(),
        binary = %binary_path.display(),
        text = %text_path.display(),
        "acquisition outputs written"
    );
    Ok(AcquisitionOutcome {
        records: outcome.records,
        binary_path,
        text_path: Some(text_path),
        channel_errors,
        fallback: false,
    })
}

// ---------------------------------------------------------------------------
// Drain
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DrainParams {
    pub sleep: Duration,
    pub natural_inactivity_secs: f64,
    pub hard_timeout: Duration,
    /// Per-channel inactivity budget before the transfer is declared stuck.
    pub transfer_timeout_secs: f64,
}

impl Default for DrainParams {
    fn default() -> Self {
        DrainParams {
            sleep: Duration::from_secs(1),
            natural_inactivity_secs: 1.0,
            hard_timeout: Duration::from_secs(30),
            transfer_timeout_secs: 4.0,
        }
    }
}

impl DrainParams {
    fn max_iters(&self) -> u32 {
        (self.hard_timeout.as_secs_f64() / self.sleep.as_secs_f64()) as u32 + 10
    }
}

/// Wait until every channel's timestamp transfer has ended.
///
/// Never fails the session: DLT errors mark the channel done, and the
/// iteration bound forces completion with a warning.
pub async fn wait_end_of_acquisition(
    tc: &mut TcLink,
    dlt: &mut DltLink,
    acquisition_ids: &BTreeMap<ChannelId, String>,
    params: &DrainParams,
) {
    let finite_records = match tc.record_count().await {
        Ok(count) => count,
        Err(e) => {
            warn!(error = %e, "REC:NUMber? failed; assuming infinite");
            None
        }
    };
    let mut timeout = params
        .transfer_timeout_secs
        .max(params.sleep.as_secs_f64() + 1.0)
        .max(params.natural_inactivity_secs);
    if finite_records.is_none() {
        timeout += params.natural_inactivity_secs;
    }

    let mut done: BTreeMap<ChannelId, bool> =
        acquisition_ids.keys().map(|&ch| (ch, false)).collect();
    let mut iters = 0u32;
    while done.values().any(|&d| !d) {
        if iters >= params.max_iters() {
            warn!("drain iteration bound reached; forcing completion");
            break;
        }
        iters += 1;
        tokio::time::sleep(params.sleep).await;

        let playing = match tc.stage().await {
            Ok(stage) => stage.to_uppercase().contains("PLAY"),
            Err(e) => {
                warn!(error = %e, "REC:STAGe? failed");
                false
            }
        };

        let mut max_acq_count = 0u64;
        for (&channel, id) in acquisition_ids {
            if done[&channel] {
                continue;
            }
            let status = match dlt.status(id).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(channel, error = %e, "DLT status failed; marking channel done");
                    done.insert(channel, true);
                    continue;
                }
            };
            if status.has_error() {
                warn!(channel, "DLT reports acquisition error; marking channel done");
                done.insert(channel, true);
                continue;
            }
            max_acq_count = max_acq_count.max(status.acquisitions_count);
            if playing {
                continue;
            }
            let finished = match finite_records {
                None => {
                    status.acquisitions_count > 0
                        && status.acquisitions_count == max_acq_count
                        && status.inactivity > params.natural_inactivity_secs
                }
                Some(n) => status.acquisitions_count >= n,
            };
            if finished {
                done.insert(channel, true);
            } else if status.inactivity > timeout {
                warn!(channel, inactivity = status.inactivity, "timestamp transfer timeout");
                done.insert(channel, true);
            }
        }
    }
}

/// Stop each DLT acquisition and collect per-channel problems.  Errors on
/// this path are logged and swallowed so file output always proceeds.
async fn close_acquisition(
    tc: &mut TcLink,
    dlt: &mut DltLink,
    acquisition_ids: &BTreeMap<ChannelId, String>,
) -> Vec<String> {
    let _ = dlt.list().await;
    let mut statuses = BTreeMap::new();
    for (&channel, id) in acquisition_ids {
        match dlt.stop_acquisition(id).await {
            Ok(status) => {
                statuses.insert(channel, status);
            }
            Err(e) => {
                warn!(channel, error = %e, "stop acquisition failed");
                statuses.insert(channel, None);
            }
        }
    }
    let expected_count = statuses
        .values()
        .filter_map(|s| s.as_ref().map(|s| s.acquisitions_count))
        .max()
        .unwrap_or(0)
        .max(1);

    let mut problems = Vec::new();
    for (&channel, status) in &statuses {
        let mut errors: Vec<String> = Vec::new();
        if let Some(status) = status {
            for entry in &status.errors {
                errors.push(entry.description.clone());
            }
            if status.acquisitions_count < expected_count {
                errors.push(format!(
                    "end of acquisition not properly registered ({}/{expected_count})",
                    status.acquisitions_count
                ));
            }
        }
        if let Err(e) = tc.set_send(channel, false).await {
            warn!(channel, error = %e, "SEND OFF failed");
        }
        match tc.error_count(channel).await {
            Ok(0) => {}
            Ok(_) => {
                errors.push("the Time Controller reports timestamps acquisition errors".to_owned());
            }
            Err(e) => warn!(channel, error = %e, "ERRORS? failed"),
        }
        for error in &errors {
            warn!(channel, error = %error, "channel closed with error");
            problems.push(format!("channel {channel}: {error}"));
        }
    }
    problems
}

// ---------------------------------------------------------------------------
// Fallback path (DLT unreachable)
// ---------------------------------------------------------------------------

async fn fallback_run(
    tc: &mut TcLink,
    cfg: &AcquisitionConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<AcquisitionOutcome, AcquisitionError> {
    tc.configure_record(RecordMode::SingleShot, cfg.pwid_ps(), cfg.pper_ps()).await?;
    tc.play().await?;
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs_f64(cfg.duration_secs)) => {}
        _ = shutdown.changed() => {}
    }
    tc.stop().await?;

    // Only the first channel holding data is preserved on this path.
    let mut records: Vec<TimeTag> = Vec::new();
    for &channel in &cfg.channels {
        let count = match tc.data_count(channel).await {
            Ok(count) => count,
            Err(e) => {
                warn!(channel, error = %e, "DATA:COUNt? failed");
                continue;
            }
        };
        info!(channel, count, "polled timestamps");
        if count == 0 {
            continue;
        }
        let values = tc.data_values(channel).await?;
        records.extend(values.into_iter().map(|timestamp| TimeTag {
            channel,
            timestamp,
        }));
        break;
    }

    let binary_path = cfg.binary_path();
    timetag::write_binary(&binary_path, &records)?;
    let text_path = if cfg.text_output {
        let path = cfg.text_path();
        timetag::write_text(&path, &records, &cfg.channels)?;
        Some(path)
    } else {
        None
    };
    info!(
        records = records.len(),
        binary = %binary_path.display(),
        "fallback outputs written"
    );
    Ok(AcquisitionOutcome {
        records,
        binary_path,
        text_path,
        channel_errors: Vec::new(),
        fallback: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tt_test_utils::{MockDlt, MockTimeController};

    fn fast_drain() -> DrainParams {
        DrainParams {
            sleep: Duration::from_millis(20),
            natural_inactivity_secs: 1.0,
            hard_timeout: Duration::from_millis(200),
            transfer_timeout_secs: 0.1,
        }
    }

    async fn links(tc: &MockTimeController, dlt: &MockDlt) -> (TcLink, DltLink) {
        (
            TcLink::connect(&tc.addr(), Duration::from_secs(1)).await.unwrap(),
            DltLink::connect(&dlt.addr(), Duration::from_secs(1)).await.unwrap(),
        )
    }

    fn ids(pairs: &[(ChannelId, &str)]) -> BTreeMap<ChannelId, String> {
        pairs.iter().map(|&(ch, id)| (ch, id.to_owned())).collect()
    }

    #[tokio::test]
    async fn drain_finishes_in_finite_mode_when_counts_reach_target() {
        let tc = MockTimeController::spawn().await;
        let dlt = MockDlt::spawn().await;
        tc.set_reply("REC:NUMber?", "1");
        tc.set_reply("REC:STAGe?", "STOPPED");
        dlt.set_status("a1", 1, 0.0);
        dlt.set_status("a2", 1, 0.0);

        let (mut tc_link, mut dlt_link) = links(&tc, &dlt).await;
        wait_end_of_acquisition(
            &mut tc_link,
            &mut dlt_link,
            &ids(&[(1, "a1"), (2, "a2")]),
            &fast_drain(),
        )
        .await;
    }

    #[tokio::test]
    async fn drain_finishes_in_infinite_mode_on_natural_inactivity() {
        let tc = MockTimeController::spawn().await;
        let dlt = MockDlt::spawn().await;
        tc.set_reply("REC:NUMber?", "INF");
        tc.set_reply("REC:STAGe?", "STOPPED");
        dlt.set_status("a1", 2, 1.5);

        let (mut tc_link, mut dlt_link) = links(&tc, &dlt).await;
        wait_end_of_acquisition(&mut tc_link, &mut dlt_link, &ids(&[(1, "a1")]), &fast_drain())
            .await;
    }

    #[tokio::test]
    async fn drain_terminates_within_bound_when_dlt_dies_mid_loop() {
        let tc = MockTimeController::spawn().await;
        let dlt = MockDlt::spawn().await;
        tc.set_reply("REC:NUMber?", "INF");
        tc.set_reply("REC:STAGe?", "PLAYING");
        dlt.set_status("a1", 0, 0.0);
        dlt.set_status("a2", 0, 0.0);

        let (mut tc_link, mut dlt_link) = links(&tc, &dlt).await;
        // Kill DLT after the first pass; every status call then errors and
        // the channels are marked done.
        dlt.shutdown();

        let start = std::time::Instant::now();
        wait_end_of_acquisition(
            &mut tc_link,
            &mut dlt_link,
            &ids(&[(1, "a1"), (2, "a2")]),
            &fast_drain(),
        )
        .await;
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn drain_respects_iteration_bound_when_nothing_finishes() {
        let tc = MockTimeController::spawn().await;
        let dlt = MockDlt::spawn().await;
        tc.set_reply("REC:NUMber?", "INF");
        tc.set_reply("REC:STAGe?", "PLAYING");
        dlt.set_status("a1", 0, 0.0);

        let (mut tc_link, mut dlt_link) = links(&tc, &dlt).await;
        let params = fast_drain();
        let start = std::time::Instant::now();
        wait_end_of_acquisition(&mut tc_link, &mut dlt_link, &ids(&[(1, "a1")]), &params).await;
        // max_iters = 200/20 + 10 = 20 iterations of 20 ms.
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn fallback_keeps_only_the_first_channel_with_data() {
        let tc = MockTimeController::spawn().await;
        tc.set_reply("RAW1:DATA:COUNt?", "0");
        tc.set_reply("RAW2:DATA:COUNt?", "3");
        tc.set_reply("RAW2:DATA:VALue?", "100,200,300");
        tc.set_reply("RAW3:DATA:COUNt?", "2");
        tc.set_reply("RAW3:DATA:VALue?", "900,901");

        let dir = tempfile::tempdir().unwrap();
        let cfg = AcquisitionConfig {
            tc_address: tc.addr(),
            channels: vec![1, 2, 3],
            duration_secs: 0.01,
            mode: RecordMode::Streaming,
            stream_base_port: 0,
            output_dir: dir.path().to_owned(),
            file_stem: "slave_results".to_owned(),
            text_output: true,
        };
        let mut tc_link = TcLink::connect(&tc.addr(), Duration::from_secs(1)).await.unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let outcome = run_acquisition(&mut tc_link, None, &cfg, stop_rx).await.unwrap();

        assert!(outcome.fallback);
        let channels: Vec<ChannelId> = outcome.records.iter().map(|t| t.channel).collect();
        assert_eq!(channels, vec![2, 2, 2]);
        let stored = timetag::read_binary(&outcome.binary_path).unwrap();
        assert_eq!(stored, outcome.records);
        assert!(outcome.text_path.unwrap().exists());
        // Fallback pins the record mode to a single sub-acquisition.
        assert!(tc.command_log().contains(&"REC:NUM 1".to_owned()));
    }
}
