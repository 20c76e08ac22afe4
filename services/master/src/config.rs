//! Master configuration.

use std::path::PathBuf;
use tagger_core::ChannelId;

#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// The master's Time Controller SCPI endpoint, `host:port`.
    pub master_tc: String,
    /// The slave host (command connections go to `slave:command_port`).
    pub slave: String,
    /// Local DLT endpoint, `host:port`.
    pub dlt_address: String,
    /// Address the peer-link listeners bind on.
    pub bind_address: String,
    pub trigger_port: u16,
    pub status_port: u16,
    pub file_port: u16,
    pub command_port: u16,
    pub sync_port: u16,
    pub stream_base_port: u16,
    pub output_dir: PathBuf,
    pub duration_secs: f64,
    pub channels: Vec<ChannelId>,
    pub verbose: bool,
    pub text_output: bool,
}

impl MasterConfig {
    /// The slave's command endpoint.
    pub fn slave_command_addr(&self) -> String {
        format!("{}:{}", self.slave, self.command_port)
    }
}
