use clap::Parser;
use slave::agent::SlaveAgent;
use slave::config::SlaveConfig;
use std::path::PathBuf;
use tagger_core::dlt::DEFAULT_DLT_PORT;
use tagger_core::scpi::DEFAULT_TC_PORT;
use tagger_core::stream::DEFAULT_STREAM_BASE_PORT;
use tracing::{error, info};
use tt_protocol::{
    DEFAULT_COMMAND_PORT, DEFAULT_FILE_PORT, DEFAULT_STATUS_PORT, DEFAULT_SYNC_PORT,
    DEFAULT_TRIGGER_PORT, SessionState,
};

/// Slave agent for a two-node timestamp acquisition session.
#[derive(Debug, Parser)]
#[command(name = "slave", version, about)]
struct Args {
    /// Address of the slave's Time Controller (host or host:port)
    #[arg(long = "slave-tc")]
    slave_tc: String,

    /// Hostname or IP of the master node
    #[arg(long = "master-address")]
    master_address: String,

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

    /// Enable debug logging
    #[arg(long, short)]
    verbose: bool,

    /// Also write text-format outputs
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
    info!(version = env!("CARGO_PKG_VERSION"), "slave starting");

    let cfg = SlaveConfig {
        slave_tc: with_default_port(&args.slave_tc, DEFAULT_TC_PORT),
        master_address: args.master_address,
        dlt_address: format!("127.0.0.1:{DEFAULT_DLT_PORT}"),
        bind_address: "0.0.0.0".to_owned(),
        trigger_port: args.trigger_port,
        status_port: args.status_port,
        file_port: args.file_port,
        command_port: args.command_port,
        sync_port: args.sync_port,
        stream_base_port: DEFAULT_STREAM_BASE_PORT,
        output_dir: args.output_dir,
        verbose: args.verbose,
        text_output: args.text_output,
    };

    if !cfg.output_dir.is_dir() {
        error!(dir = %cfg.output_dir.display(), "output directory does not exist");
        std::process::exit(1);
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let agent = match SlaveAgent::bind(cfg, shutdown_rx).await {
        Ok(agent) => agent,
        Err(e) => {
            error!(error = %e, "failed to start slave agent");
            std::process::exit(1);
        }
    };
    let state = agent.state_handle();

    tokio::select! {
        result = agent.run() => {
            if let Err(e) = result {
                error!(error = %e, "slave agent failed");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            let _ = shutdown_tx.send(true);
        }
    }

    match state.state() {
        SessionState::Error { message } => {
            error!(error = %message, "session ended in error");
            std::process::exit(1);
        }
        state => info!(state = %state, "slave stopped"),
    }
}
