//! Degraded path: DLT unreachable on the slave.  The agent must fall back
//! to direct TC polling, refuse partial-data requests (no merged data), and
//! still serve the full binary.

use futures_util::{SinkExt, StreamExt};
use slave::agent::SlaveAgent;
use slave::config::SlaveConfig;
use std::time::Duration;
use tagger_core::timetag;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::codec::{Framed, FramedRead, LengthDelimitedCodec, LinesCodec};
use tt_protocol::{CommandRequest, CommandResponse, FileHeader, FileKind, SessionState, SyncFrame};
use tt_test_utils::MockTimeController;

async fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// Accept connections and discard their lines (heartbeat sink).
fn absorb_lines(listener: TcpListener) {
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut lines = FramedRead::new(socket, LinesCodec::new());
                while let Some(Ok(_)) = lines.next().await {}
            });
        }
    });
}

#[tokio::test]
async fn dlt_unreachable_falls_back_and_partial_request_errors() {
    let tc = MockTimeController::spawn().await;
    tc.set_reply("RAW1:DATA:COUNt?", "3");
    tc.set_reply("RAW1:DATA:VALue?", "10,20,30");

    let (trigger_listener, trigger_port) = listener().await;
    let (sync_listener, sync_port) = listener().await;
    let (status_listener, status_port) = listener().await;
    let (file_listener, file_port) = listener().await;
    absorb_lines(status_listener);

    let out_dir = tempfile::tempdir().unwrap();
    let cfg = SlaveConfig {
        slave_tc: tc.addr(),
        master_address: "127.0.0.1".to_owned(),
        // Nothing listens here: the DLT connect must fail.
        dlt_address: "127.0.0.1:9".to_owned(),
        bind_address: "127.0.0.1".to_owned(),
        trigger_port,
        status_port,
        file_port,
        command_port: 0,
        sync_port,
        stream_base_port: 0,
        output_dir: out_dir.path().to_owned(),
        verbose: false,
        text_output: false,
    };

    let (_stop_tx, stop_rx) = watch::channel(false);
    let agent = SlaveAgent::bind(cfg, stop_rx).await.unwrap();
    let command_port = agent.command_port();
    let state = agent.state_handle();
    tokio::spawn(agent.run());

    // Deliver the trigger over the fan-out channel.
    let (socket, _) = trigger_listener.accept().await.unwrap();
    let mut trigger_sink = Framed::new(socket, LinesCodec::new());
    trigger_sink
        .send(
            serde_json::json!({
                "command": "trigger",
                "timestamp": 123u64,
                "sequence": 1,
                "duration": 0.05,
                "channels": [1],
            })
            .to_string(),
        )
        .await
        .unwrap();

    // The slave echoes its trigger timestamp on the sync channel.
    let (sync_socket, _) = sync_listener.accept().await.unwrap();
    let mut sync_lines = FramedRead::new(sync_socket, LinesCodec::new());
    let echo = sync_lines.next().await.unwrap().unwrap();
    match SyncFrame::from_line(&echo).unwrap() {
        SyncFrame::TriggerTimestamp(ts) => assert_eq!(ts.sequence, 1),
        other => panic!("expected trigger timestamp echo, got {other:?}"),
    }

    // Wait for the fallback acquisition to finish.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if state.state() == SessionState::Draining {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "slave never reached draining, state: {:?}",
            state.state()
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Partial data is refused on the fallback path.
    let command = tokio::net::TcpStream::connect(("127.0.0.1", command_port))
        .await
        .unwrap();
    let mut command = Framed::new(command, LinesCodec::new());
    command
        .send(serde_json::to_string(&CommandRequest::RequestPartialData { sequence: 1 }).unwrap())
        .await
        .unwrap();
    let reply: CommandResponse =
        serde_json::from_str(&command.next().await.unwrap().unwrap()).unwrap();
    assert!(!reply.is_ok());
    assert!(reply.message.contains("fallback"));

    // Full data is still served.
    command
        .send(serde_json::to_string(&CommandRequest::RequestFullData { sequence: 2 }).unwrap())
        .await
        .unwrap();
    let reply: CommandResponse =
        serde_json::from_str(&command.next().await.unwrap().unwrap()).unwrap();
    assert!(reply.is_ok());

    let (file_socket, _) = file_listener.accept().await.unwrap();
    let mut frames = FramedRead::new(file_socket, LengthDelimitedCodec::new());
    let header: FileHeader =
        serde_json::from_slice(&frames.next().await.unwrap().unwrap()).unwrap();
    assert_eq!(header.kind, FileKind::Full);
    let payload = frames.next().await.unwrap().unwrap();
    assert_eq!(payload.len() as u64, header.len);

    let records = timetag::decode_records(&payload).unwrap();
    let pairs: Vec<(i32, u64)> = records.iter().map(|t| (t.channel, t.timestamp)).collect();
    assert_eq!(pairs, vec![(1, 10), (1, 20), (1, 30)]);
}
