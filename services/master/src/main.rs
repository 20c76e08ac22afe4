use clap::Parser;
use master::config::MasterConfig;
use master::controller::SessionController;
use master::peer::MasterPeer;
use std::path::PathBuf;
use tagger_core::dlt::DEFAULT_DLT_PORT;
use tagger_core::scpi::DEFAULT_TC_PORT;
use tagger_core::stream::DEFAULT_STREAM_BASE_PORT;
use tracing::{error, info};
use tt_protocol::{
    DEFAULT_COMMAND_PORT, DEFAULT_FILE_PORT, DEFAULT_STATUS_PORT, DEFAULT_SYNC_PORT,
    DEFAULT_TRIGGER_PORT,
};

/// Master controller for a two-node timestamp acquisition session.
#[derive(Debug, Parser)]
#[command(name = "master", version, about)]
struct Args {
    /// Address of the master's Time Controller (host or host:port)
    #[arg(long = "master-tc")]
    master_tc: String,

    /// Hostname or IP of the slave node
    #[arg(long)]
    slave: String,

    #[arg(long = "trigger-port", default_value_t = DEFAULT_TRIGGER_PORT)]
    trigger_port: u16,

    #[arg(long = "status-port", default_value_t = DEFAULT_STATUS_PORT)]
    status_port: u16,

    #[arg(long = "file-port", default_value_t = DEFAULT_FILE_PORT)]
    file_port: u16,

    #[arg(long = "command-port", default_value_t = DEFAULT_COMMAND_PORT)]
    command_port: u16,

    #[arg(long = "sync-port", default_value_t = DEFAULT_SYNC_PORT)]
    sync_port: u16,

    /// Directory the output files are written to
    #[arg(long = "output-dir", default_value = ".")]
    output_dir: PathBuf,

    /// Acquisition duration in seconds
    #[arg(long, default_value_t = 1.0)]
    duration: f64,

    /// Channels to acquire, comma separated
    #[arg(long, value_delimiter = ',', default_value = "1,2,3,4")]
    channels: Vec<i32>,

    /// Enable debug logging
    #[arg(long, short)]
    verbose: bool,

    /// Also request/write text-format outputs
    #[arg(long = "text-output")]
    text_output: bool,
}

fn with_default_port(addr: &str, port: u16) -> String {
    if addr.contains(':') {
        addr.to_owned()
    } else {
        format!("{addr}:{port}")
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();
    info!(version = env!("CARGO_PKG_VERSION"), "master starting");

    let cfg = MasterConfig {
        master_tc: with_default_port(&args.master_tc, DEFAULT_TC_PORT),
        slave: args.slave,
        dlt_address: format!("127.0.0.1:{DEFAULT_DLT_PORT}"),
        bind_address: "0.0.0.0".to_owned(),
        trigger_port: args.trigger_port,
        status_port: args.status_port,
        file_port: args.file_port,
        command_port: args.command_port,
        sync_port: args.sync_port,
        stream_base_port: DEFAULT_STREAM_BASE_PORT,
        output_dir: args.output_dir,
        duration_secs: args.duration,
        channels: args.channels,
        verbose: args.verbose,
        text_output: args.text_output,
    };

    if !cfg.output_dir.is_dir() {
        error!(dir = %cfg.output_dir.display(), "output directory does not exist");
        std::process::exit(1);
    }

    let peer = match MasterPeer::bind(
        &cfg.bind_address,
        cfg.trigger_port,
        cfg.sync_port,
        cfg.status_port,
        cfg.file_port,
    )
    .await
    {
        Ok(peer) => peer,
        Err(e) => {
            error!(error = %e, "failed to bind peer sockets");
            std::process::exit(1);
        }
    };

    let controller = match SessionController::connect(cfg, peer).await {
        Ok(controller) => controller,
        Err(e) => {
            error!(error = %e, "session failed");
            std::process::exit(1);
        }
    };

    match controller.run().await {
        Ok(summary) => {
            info!(
                state = %summary.state,
                records = summary.record_count,
                with_errors = summary.completed_with_errors,
                report = summary
                    .report_path
                    .as_ref()
                    .map_or_else(|| "none".to_owned(), |p| p.display().to_string()),
                "session summary"
            );
        }
        Err(e) => {
            error!(state = "error", error = %e, "session failed");
            std::process::exit(1);
        }
    }
}
