//! Slave configuration.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct SlaveConfig {
    /// The slave's Time Controller SCPI endpoint, `host:port`.
    pub slave_tc: String,
    /// Hostname or IP of the master node.
    pub master_address: String,
    /// Local DLT endpoint, `host:port`.
    pub dlt_address: String,
    /// Address the command listener binds on.
    pub bind_address: String,
    pub trigger_port: u16,
    pub status_port: u16,
    pub file_port: u16,
    pub command_port: u16,
    pub sync_port: u16,
    pub stream_base_port: u16,
    pub output_dir: PathBuf,
    pub verbose: bool,
    pub text_output: bool,
}

impl SlaveConfig {
    pub fn master_trigger_addr(&self) -> String {
        format!("{}:{}", self.master_address, self.trigger_port)
    }

    pub fn master_sync_addr(&self) -> String {
        format!("{}:{}", self.master_address, self.sync_port)
    }

    pub fn master_status_addr(&self) -> String {
        format!("{}:{}", self.master_address, self.status_port)
    }

    pub fn master_file_addr(&self) -> String {
        format!("{}:{}", self.master_address, self.file_port)
    }
}
