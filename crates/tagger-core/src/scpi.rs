//! Time Controller adapter.
//!
//! The TC speaks a line-oriented SCPI dialect over TCP (default port 5555).
//! Every command is synchronous request/reply; [`TcLink::exec`] sends the
//! command bytes and returns the reply with its trailing newline stripped.
//! Concurrent callers serialise on `&mut self`.

use crate::timetag::ChannelId;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::debug;

/// Default SCPI service port on a Time Controller.
pub const DEFAULT_TC_PORT: u16 = 5555;

/// Dead time between sub-acquisitions, in picoseconds (40 ns).
pub const DEAD_TIME_PS: u64 = 40_000;

#[derive(Debug, thiserror::Error)]
pub enum TcError {
    #[error("unable to connect to Time Controller at {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error("no reply to `{cmd}` within {timeout:?}")]
    Timeout { cmd: String, timeout: Duration },
    #[error("Time Controller link closed")]
    Closed,
    #[error("transport: {0}")]
    Transport(String),
    #[error("unparseable reply to `{cmd}`: `{reply}`")]
    Parse { cmd: String, reply: String },
}

impl From<LinesCodecError> for TcError {
    fn from(e: LinesCodecError) -> Self {
        TcError::Transport(e.to_string())
    }
}

/// Whether a recording plays sub-acquisitions until stopped or exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordMode {
    /// `REC:NUM INF`: sub-acquisitions repeat until `REC:STOP`.
    Streaming,
    /// `REC:NUM 1`: a single sub-acquisition.
    SingleShot,
}

impl RecordMode {
    fn scpi_count(self) -> &'static str {
        match self {
            RecordMode::Streaming => "INF",
            RecordMode::SingleShot => "1",
        }
    }
}

/// A request/reply link to one Time Controller.
pub struct TcLink {
    framed: Framed<TcpStream, LinesCodec>,
    addr: String,
    timeout: Duration,
}

impl TcLink {
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self, TcError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TcError::Connect {
                addr: addr.to_owned(),
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            })?
            .map_err(|source| TcError::Connect {
                addr: addr.to_owned(),
                source,
            })?;
        Ok(TcLink {
            framed: Framed::new(stream, LinesCodec::new()),
            addr: addr.to_owned(),
            timeout,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send one command and return the reply line (newline stripped).
    pub async fn exec(&mut self, cmd: &str) -> Result<String, TcError> {
        self.framed.send(cmd).await?;
        let reply = tokio::time::timeout(self.timeout, self.framed.next())
            .await
            .map_err(|_| TcError::Timeout {
                cmd: cmd.to_owned(),
                timeout: self.timeout,
            })?
            .ok_or(TcError::Closed)??;
        debug!(cmd, reply = %reply, "tc exec");
        Ok(reply)
    }

    async fn exec_u64(&mut self, cmd: &str) -> Result<u64, TcError> {
        let reply = self.exec(cmd).await?;
        reply.trim().parse().map_err(|_| TcError::Parse {
            cmd: cmd.to_owned(),
            reply,
        })
    }

    // -----------------------------------------------------------------------
    // Typed commands
    // -----------------------------------------------------------------------

    pub async fn identity(&mut self) -> Result<String, TcError> {
        self.exec("*IDN?").await
    }

    /// `RAW<k>:REF:LINK NONE` -- detach the channel from any reference.
    pub async fn unlink_reference(&mut self, channel: ChannelId) -> Result<(), TcError> {
        self.exec(&format!("RAW{channel}:REF:LINK NONE")).await?;
        Ok(())
    }

    /// Arm a manual-trigger recording of `mode` sub-acquisitions with the
    /// given width and period (both picoseconds).
    pub async fn configure_record(
        &mut self,
        mode: RecordMode,
        pwid_ps: u64,
        pper_ps: u64,
    ) -> Result<(), TcError> {
        self.exec("REC:TRIG:ARM:MODE MANUal").await?;
        self.exec("REC:ENABle ON").await?;
        self.exec("REC:STOP").await?;
        self.exec(&format!("REC:NUM {}", mode.scpi_count())).await?;
        self.exec(&format!("REC:PWID {pwid_ps};PPER {pper_ps}")).await?;
        Ok(())
    }

    pub async fn clear_errors(&mut self, channel: ChannelId) -> Result<(), TcError> {
        self.exec(&format!("RAW{channel}:ERRORS:CLEAR")).await?;
        Ok(())
    }

    pub async fn set_send(&mut self, channel: ChannelId, on: bool) -> Result<(), TcError> {
        let state = if on { "ON" } else { "OFF" };
        self.exec(&format!("RAW{channel}:SEND {state}")).await?;
        Ok(())
    }

    /// `RAW<k>:ERRORS?` -- per-channel acquisition error count.
    pub async fn error_count(&mut self, channel: ChannelId) -> Result<u64, TcError> {
        self.exec_u64(&format!("RAW{channel}:ERRORS?")).await
    }

    pub async fn play(&mut self) -> Result<(), TcError> {
        self.exec("REC:PLAY").await?;
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<(), TcError> {
        self.exec("REC:STOP").await?;
        Ok(())
    }

    /// `REC:STAGe?` -- the raw stage string, e.g. `PLAYING` or `STOPPED`.
    pub async fn stage(&mut self) -> Result<String, TcError> {
        self.exec("REC:STAGe?").await
    }

    /// `REC:NUMber?` -- the configured sub-acquisition count, or `None`
    /// when the recording is infinite (`INF` or any non-numeric reply).
    pub async fn record_count(&mut self) -> Result<Option<u64>, TcError> {
        let reply = self.exec("REC:NUMber?").await?;
        Ok(reply.trim().parse().ok())
    }

    // -----------------------------------------------------------------------
    // Direct-poll fallback (used when DLT is unreachable)
    // -----------------------------------------------------------------------

    /// `RAW<k>:DATA:COUNt?` -- timestamps currently held for the channel.
    pub async fn data_count(&mut self, channel: ChannelId) -> Result<u64, TcError> {
        self.exec_u64(&format!("RAW{channel}:DATA:COUNt?")).await
    }

    /// `RAW<k>:DATA:VALue?` -- the buffered timestamps as a comma-separated
    /// decimal list.  Unparseable entries are skipped.
    pub async fn data_values(&mut self, channel: ChannelId) -> Result<Vec<u64>, TcError> {
        let reply = self.exec(&format!("RAW{channel}:DATA:VALue?")).await?;
        Ok(reply
            .split(',')
            .filter_map(|part| part.trim().parse().ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tt_test_utils::MockTimeController;

    #[tokio::test]
    async fn exec_strips_newline_and_returns_reply() {
        let tc = MockTimeController::spawn().await;
        tc.set_reply("*IDN?", "MockTC,0.1");
        let mut link = TcLink::connect(&tc.addr(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(link.identity().await.unwrap(), "MockTC,0.1");
    }

    #[tokio::test]
    async fn record_count_parses_finite_and_infinite() {
        let tc = MockTimeController::spawn().await;
        let mut link = TcLink::connect(&tc.addr(), Duration::from_secs(2))
            .await
            .unwrap();

        tc.set_reply("REC:NUMber?", "INF");
        assert_eq!(link.record_count().await.unwrap(), None);

        tc.set_reply("REC:NUMber?", "5");
        assert_eq!(link.record_count().await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn data_values_parses_comma_separated_decimals() {
        let tc = MockTimeController::spawn().await;
        tc.set_reply("RAW1:DATA:VALue?", " 100, 250,9,  ");
        let mut link = TcLink::connect(&tc.addr(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(link.data_values(1).await.unwrap(), vec![100, 250, 9]);
    }

    #[tokio::test]
    async fn configure_record_issues_setup_sequence() {
        let tc = MockTimeController::spawn().await;
        let mut link = TcLink::connect(&tc.addr(), Duration::from_secs(2))
            .await
            .unwrap();
        link.configure_record(RecordMode::Streaming, 200_000_000_000, 200_000_040_000)
            .await
            .unwrap();
        let log = tc.command_log();
        assert!(log.contains(&"REC:NUM INF".to_owned()));
        assert!(log.contains(&"REC:PWID 200000000000;PPER 200000040000".to_owned()));
    }

    #[tokio::test]
    async fn unanswered_command_times_out() {
        let tc = MockTimeController::spawn().await;
        tc.mute("REC:PLAY");
        let mut link = TcLink::connect(&tc.addr(), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(matches!(link.play().await, Err(TcError::Timeout { .. })));
    }
}
