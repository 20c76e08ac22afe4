//! DataLinkTarget adapter.
//!
//! DLT is a pre-existing local service (default port 6060) that relays
//! per-channel timestamp byte streams off a Time Controller.  Commands and
//! replies are single JSON lines; a reply object carrying
//! `error.description` is surfaced as [`DltError::Service`].
//!
//! This adapter never launches DLT.  A failed connect is reported to the
//! caller, which degrades to direct TC polling.

use crate::timetag::ChannelId;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

/// Default DataLinkTarget command port.
pub const DEFAULT_DLT_PORT: u16 = 6060;

#[derive(Debug, thiserror::Error)]
pub enum DltError {
    #[error("unable to connect to DataLinkTarget at {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error("DataLinkTarget: {0}")]
    Service(String),
    #[error("no reply to `{cmd}` within {timeout:?}")]
    Timeout { cmd: String, timeout: Duration },
    #[error("DataLinkTarget link closed")]
    Closed,
    #[error("transport: {0}")]
    Transport(String),
    #[error("malformed reply to `{cmd}`: {source}")]
    Malformed {
        cmd: String,
        source: serde_json::Error,
    },
    #[error("reply to `{cmd}` missing field `{field}`")]
    MissingField { cmd: String, field: &'static str },
}

impl From<LinesCodecError> for DltError {
    fn from(e: LinesCodecError) -> Self {
        DltError::Transport(e.to_string())
    }
}

/// Per-acquisition status as reported by `status --id`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DltStatus {
    #[serde(default)]
    pub acquisitions_count: u64,
    /// Seconds since the acquisition last produced data.
    #[serde(default)]
    pub inactivity: f64,
    /// Non-null when the acquisition failed.
    #[serde(default)]
    pub error: Option<serde_json::Value>,
    #[serde(default)]
    pub errors: Vec<DltErrorEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DltErrorEntry {
    #[serde(default)]
    pub description: String,
}

impl DltStatus {
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A request/reply link to the local DataLinkTarget service.
pub struct DltLink {
    framed: Framed<TcpStream, LinesCodec>,
    timeout: Duration,
}

impl DltLink {
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self, DltError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| DltError::Connect {
                addr: addr.to_owned(),
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            })?
            .map_err(|source| DltError::Connect {
                addr: addr.to_owned(),
                source,
            })?;
        Ok(DltLink {
            framed: Framed::new(stream, LinesCodec::new()),
            timeout,
        })
    }

    /// Send one command and parse the JSON reply.  An empty reply line maps
    /// to `None`.
    pub async fn exec(&mut self, cmd: &str) -> Result<Option<serde_json::Value>, DltError> {
        self.framed.send(cmd).await?;
        let reply = tokio::time::timeout(self.timeout, self.framed.next())
            .await
            .map_err(|_| DltError::Timeout {
                cmd: cmd.to_owned(),
                timeout: self.timeout,
            })?
            .ok_or(DltError::Closed)??;
        debug!(cmd, reply = %reply, "dlt exec");
        if reply.trim().is_empty() {
            return Ok(None);
        }
        let value: serde_json::Value =
            serde_json::from_str(&reply).map_err(|source| DltError::Malformed {
                cmd: cmd.to_owned(),
                source,
            })?;
        if let Some(error) = value.get("error") {
            if !error.is_null() {
                let description = error
                    .get("description")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("unknown error");
                return Err(DltError::Service(description.to_owned()));
            }
        }
        Ok(Some(value))
    }

    // -----------------------------------------------------------------------
    // Typed commands
    // -----------------------------------------------------------------------

    /// `list` -- ids of all active acquisitions.
    pub async fn list(&mut self) -> Result<Vec<String>, DltError> {
        let reply = self.exec("list").await?;
        let ids = reply
            .as_ref()
            .and_then(|v| v.as_array())
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| id.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();
        Ok(ids)
    }

    /// `stop --id` -- stop an acquisition; returns its final status object
    /// when the reply carries one.
    pub async fn stop_acquisition(&mut self, id: &str) -> Result<Option<DltStatus>, DltError> {
        let reply = self.exec(&format!("stop --id {id}")).await?;
        let status = reply
            .as_ref()
            .and_then(|v| v.get("status"))
            .and_then(|s| serde_json::from_value(s.clone()).ok());
        Ok(status)
    }

    /// `start-stream` -- begin relaying a channel to a local stream port.
    /// Returns the acquisition id.
    pub async fn start_stream(
        &mut self,
        tc_addr: &str,
        channel: ChannelId,
        stream_port: u16,
    ) -> Result<String, DltError> {
        let cmd =
            format!("start-stream --address {tc_addr} --channel {channel} --stream-port {stream_port}");
        let reply = self.exec(&cmd).await?;
        reply
            .as_ref()
            .and_then(|v| v.get("id"))
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned)
            .ok_or(DltError::MissingField {
                cmd,
                field: "id",
            })
    }

    /// `status --id` -- current status of one acquisition.
    pub async fn status(&mut self, id: &str) -> Result<DltStatus, DltError> {
        let cmd = format!("status --id {id}");
        let reply = self.exec(&cmd).await?;
        match reply {
            Some(value) => serde_json::from_value(value).map_err(|source| DltError::Malformed {
                cmd,
                source,
            }),
            None => Ok(DltStatus::default()),
        }
    }

    /// Stop every acquisition left over from a previous run.  Per-id stop
    /// failures are logged and skipped so one stale id cannot block setup.
    pub async fn close_active_acquisitions(&mut self) -> Result<(), DltError> {
        for id in self.list().await? {
            debug!(id = %id, "closing active acquisition");
            if let Err(e) = self.stop_acquisition(&id).await {
                warn!(id = %id, error = %e, "failed to close acquisition");
            }
        }
        Ok(())
    }
}
