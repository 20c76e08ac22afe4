//! Per-channel timestamp stream ingestion.
//!
//! DLT connects to a local port (`base + channel`) and pushes
//! length-prefixed frames; every frame is a whole number of 8-byte
//! little-endian picosecond timestamps.  A zero-length frame signals
//! end-of-stream.  Batches are forwarded in arrival order into a bounded
//! channel owned by the merger -- the client never reorders, deduplicates,
//! or filters.

use crate::timetag::ChannelId;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};
use tracing::{debug, info, warn};

/// Default base for per-channel stream ports (`base + channel`).
pub const DEFAULT_STREAM_BASE_PORT: u16 = 4241;

/// Batches queued per channel before the stream client back-pressures.
pub const BATCH_QUEUE_DEPTH: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("channel {channel}: bind {addr}: {source}")]
    Bind {
        channel: ChannelId,
        addr: String,
        source: std::io::Error,
    },
    #[error("channel {channel}: frame length {len} is not a multiple of 8")]
    BadFrame { channel: ChannelId, len: usize },
    #[error("channel {channel}: transport: {source}")]
    Transport {
        channel: ChannelId,
        source: std::io::Error,
    },
}

/// Decode one batch into timestamps.  The caller has already validated the
/// length is a multiple of 8.
pub fn decode_timestamps(batch: &[u8]) -> impl Iterator<Item = u64> + '_ {
    batch
        .chunks_exact(8)
        .map(|word| u64::from_le_bytes(word.try_into().unwrap()))
}

/// One channel's stream listener.
///
/// Bind first (so the port is known before DLT is told to connect), then
/// `run` to completion on its own task.
pub struct StreamClient {
    channel: ChannelId,
    listener: TcpListener,
    batches: mpsc::Sender<Bytes>,
    shutdown: watch::Receiver<bool>,
}

impl StreamClient {
    pub async fn bind(
        channel: ChannelId,
        base_port: u16,
        batches: mpsc::Sender<Bytes>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, StreamError> {
        // Base 0 binds an ephemeral port; the caller reads it back via
        // `local_port` and hands it to DLT.
        let port = if base_port == 0 {
            0
        } else {
            base_port + channel as u16
        };
        let addr = format!("127.0.0.1:{port}");
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| StreamError::Bind {
                channel,
                addr: addr.clone(),
                source,
            })?;
        debug!(channel, %addr, "stream client listening");
        Ok(StreamClient {
            channel,
            listener,
            batches,
            shutdown,
        })
    }

    /// The bound local port (useful when binding with a zero base).
    pub fn local_port(&self) -> u16 {
        self.listener
            .local_addr()
            .map(|a| a.port())
            .unwrap_or_default()
    }

    /// Accept the single DLT connection and forward batches until
    /// end-of-stream, disconnect, transport error, or shutdown.
    pub async fn run(mut self) -> Result<(), StreamError> {
        let channel = self.channel;
        let socket = tokio::select! {
            accepted = self.listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    debug!(channel, %peer, "stream source connected");
                    socket
                }
                Err(source) => return Err(StreamError::Transport { channel, source }),
            },
            _ = self.shutdown.changed() => {
                debug!(channel, "stream client shut down before connect");
                return Ok(());
            }
        };
        self.pump(socket).await
    }

    async fn pump(&mut self, socket: TcpStream) -> Result<(), StreamError> {
        let channel = self.channel;
        // One frame is one sub-acquisition's worth of timestamps; allow well
        // beyond the codec's 8 MiB default.
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(64 * 1024 * 1024)
            .new_codec();
        let mut frames = FramedRead::new(socket, codec);
        let mut received: usize = 0;
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    // A dropped sender counts as shutdown.
                    if changed.is_err() || *self.shutdown.borrow() {
                        debug!(channel, "stream client shutting down");
                        return Ok(());
                    }
                }
                frame = frames.next() => match frame {
                    None => {
                        info!(channel, batches = received, "stream source disconnected");
                        return Ok(());
                    }
                    Some(Err(source)) => {
                        return Err(StreamError::Transport { channel, source });
                    }
                    Some(Ok(bytes)) => {
                        if bytes.is_empty() {
                            info!(channel, batches = received, "end of stream");
                            return Ok(());
                        }
                        if bytes.len() % 8 != 0 {
                            warn!(channel, len = bytes.len(), "dropping stream: bad frame length");
                            return Err(StreamError::BadFrame { channel, len: bytes.len() });
                        }
                        received += 1;
                        debug!(
                            channel,
                            timestamps = bytes.len() / 8,
                            batch = received,
                            "buffering batch"
                        );
                        if self.batches.send(bytes.freeze()).await.is_err() {
                            // Merger is gone; nothing left to feed.
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tt_test_utils::StreamPusher;

    fn batch(values: &[u64]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    async fn bind_client(
        tx: mpsc::Sender<Bytes>,
        shutdown: watch::Receiver<bool>,
    ) -> (StreamClient, u16) {
        // Channel 0 with base 0 binds an ephemeral port.
        let client = StreamClient::bind(0, 0, tx, shutdown).await.unwrap();
        let port = client.local_port();
        (client, port)
    }

    #[tokio::test]
    async fn forwards_batches_in_arrival_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (client, port) = bind_client(tx, stop_rx).await;
        let task = tokio::spawn(client.run());

        let mut pusher = StreamPusher::connect(port).await;
        pusher.push(&batch(&[5])).await;
        pusher.push(&batch(&[4, 9])).await;
        pusher.finish().await;

        task.await.unwrap().unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from(batch(&[5])));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from(batch(&[4, 9])));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn end_of_stream_only_leaves_empty_buffer_and_exits_cleanly() {
        let (tx, mut rx) = mpsc::channel(8);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (client, port) = bind_client(tx, stop_rx).await;
        let task = tokio::spawn(client.run());

        let mut pusher = StreamPusher::connect(port).await;
        pusher.finish().await;

        task.await.unwrap().unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn misaligned_frame_is_a_stream_error() {
        let (tx, _rx) = mpsc::channel(8);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (client, port) = bind_client(tx, stop_rx).await;
        let task = tokio::spawn(client.run());

        let mut pusher = StreamPusher::connect(port).await;
        pusher.push(&[1, 2, 3]).await;

        match task.await.unwrap() {
            Err(StreamError::BadFrame { len: 3, .. }) => {}
            other => panic!("expected BadFrame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn peer_disconnect_terminates_with_buffer_intact() {
        let (tx, mut rx) = mpsc::channel(8);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (client, port) = bind_client(tx, stop_rx).await;
        let task = tokio::spawn(client.run());

        let mut pusher = StreamPusher::connect(port).await;
        pusher.push(&batch(&[77])).await;
        drop(pusher);

        task.await.unwrap().unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from(batch(&[77])));
        assert!(rx.recv().await.is_none());
    }
}
