//! End-to-end session: real master controller and slave agent on localhost,
//! instruments replaced by scripted mocks.  The slave's timestamps carry a
//! constant 50 ns shift, which the offset computation must recover.

use master::config::MasterConfig;
use master::controller::SessionController;
use master::peer::MasterPeer;
use slave::agent::SlaveAgent;
use slave::config::SlaveConfig;
use tagger_core::sync::QualityTier;
use tagger_core::timetag;
use tokio::sync::watch;
use tt_protocol::SessionState;
use tt_test_utils::{MockDlt, MockTimeController};

const MASTER_TIMESTAMPS: [u64; 4] = [1_000_000, 2_000_000, 3_000_000, 4_000_000];
const SHIFT_PS: u64 = 50_000; // 50 ns

#[tokio::test]
async fn full_session_produces_report_and_corrected_master() {
    let master_tc = MockTimeController::spawn().await;
    let master_dlt = MockDlt::spawn().await;
    let slave_tc = MockTimeController::spawn().await;
    let slave_dlt = MockDlt::spawn().await;

    master_tc.set_reply("REC:NUMber?", "INF");
    slave_tc.set_reply("REC:NUMber?", "INF");
    master_dlt.push_on_start(vec![MASTER_TIMESTAMPS.to_vec()], 2.0);
    slave_dlt.push_on_start(
        vec![MASTER_TIMESTAMPS.iter().map(|t| t + SHIFT_PS).collect()],
        2.0,
    );

    let master_dir = tempfile::tempdir().unwrap();
    let slave_dir = tempfile::tempdir().unwrap();

    // Master binds ephemeral peer sockets first so the slave can be pointed
    // at the real ports.
    let peer = MasterPeer::bind("127.0.0.1", 0, 0, 0, 0).await.unwrap();

    let slave_cfg = SlaveConfig {
        slave_tc: slave_tc.addr(),
        master_address: "127.0.0.1".to_owned(),
        dlt_address: slave_dlt.addr(),
        bind_address: "127.0.0.1".to_owned(),
        trigger_port: peer.trigger_port(),
        status_port: peer.status_port(),
        file_port: peer.file_port(),
        command_port: 0,
        sync_port: peer.sync_port(),
        stream_base_port: 0,
        output_dir: slave_dir.path().to_owned(),
        verbose: false,
        text_output: true,
    };
    let (_slave_stop, slave_stop_rx) = watch::channel(false);
    let agent = SlaveAgent::bind(slave_cfg, slave_stop_rx).await.unwrap();
    let command_port = agent.command_port();
    let slave_state = agent.state_handle();
    tokio::spawn(agent.run());

    let cfg = MasterConfig {
        master_tc: master_tc.addr(),
        slave: "127.0.0.1".to_owned(),
        dlt_address: master_dlt.addr(),
        bind_address: "127.0.0.1".to_owned(),
        trigger_port: peer.trigger_port(),
        status_port: peer.status_port(),
        file_port: peer.file_port(),
        command_port,
        sync_port: peer.sync_port(),
        stream_base_port: 0,
        output_dir: master_dir.path().to_owned(),
        duration_secs: 0.2,
        channels: vec![1],
        verbose: false,
        text_output: true,
    };

    let controller = SessionController::connect(cfg, peer).await.unwrap();
    let summary = controller.run().await.unwrap();

    assert_eq!(summary.state, SessionState::Completed);
    assert_eq!(summary.record_count, MASTER_TIMESTAMPS.len());
    assert!(!summary.completed_with_errors);

    // Offset statistics: exact 50 ns shift, no jitter.
    let stats = summary.offset.expect("offset should be computable");
    assert!((stats.mean_ps - SHIFT_PS as f64).abs() < 1e-6);
    assert!(stats.stddev_ps.abs() < 1e-6);
    assert_eq!(stats.quality, QualityTier::Excellent);

    // Report file: header block and verdict.
    let report = std::fs::read_to_string(summary.report_path.unwrap()).unwrap();
    assert!(report.contains("Slave: 127.0.0.1"));
    assert!(report.contains("Excellent synchronization"));

    // Corrected master equals the slave timeline.
    let corrected = timetag::read_binary(&summary.corrected_path.unwrap()).unwrap();
    let corrected_ts: Vec<u64> = corrected.iter().map(|t| t.timestamp).collect();
    let expected: Vec<u64> = MASTER_TIMESTAMPS.iter().map(|t| t + SHIFT_PS).collect();
    assert_eq!(corrected_ts, expected);

    // Master kept the slave's transfers: partial, full, and text.
    let saved: Vec<String> = std::fs::read_dir(master_dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert!(saved.iter().any(|n| n == "slave_partial_data.bin"));
    assert!(saved.iter().any(|n| n.starts_with("slave_results_") && n.ends_with(".bin")));
    assert!(saved.iter().any(|n| n.starts_with("slave_results_") && n.ends_with(".txt")));

    // The slave reached its terminal state after serving the files.
    assert_eq!(slave_state.state(), SessionState::Completed);

    // Streaming mode uses an infinite recording on both nodes.
    assert!(master_tc.command_log().contains(&"REC:NUM INF".to_owned()));
    assert!(slave_tc.command_log().contains(&"REC:NUM INF".to_owned()));

    // The slave's merged text file round-trips to the shifted records.
    let slave_partial =
        timetag::read_binary(&master_dir.path().join("slave_partial_data.bin")).unwrap();
    let slave_ts: Vec<u64> = slave_partial.iter().map(|t| t.timestamp).collect();
    assert_eq!(slave_ts, expected);
}
