//! Deterministic k-way merge of per-channel batch streams.
//!
//! The Time Controller restarts its counter at every sub-acquisition, so
//! the i-th batch of each channel is lifted onto the common timeline by
//! adding `PPER * i` before merging.  Output is non-decreasing by
//! timestamp; equal timestamps order by channel id ascending.
//!
//! The merger owns all batch queues; stream clients only send into them.
//! While `expect_more` holds it merges index `i` only once every channel
//! has delivered batch `i`; afterwards it drains whatever is left, treating
//! missing channels as empty.

use crate::stream::decode_timestamps;
use crate::timetag::{ChannelId, TimeTag};
use bytes::Bytes;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Pause between readiness checks while acquisition is ongoing.
pub const MERGE_QUANTUM: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error(
        "channel {channel}: timestamp {timestamp} + sub-acquisition offset {offset} overflows 64 bits"
    )]
    Overflow {
        channel: ChannelId,
        timestamp: u64,
        offset: u64,
    },
    #[error("sub-acquisition offset overflows 64 bits at batch index {index}")]
    OffsetOverflow { index: u64 },
    #[error("output file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// One channel's batch feed into the merger.
pub struct ChannelSource {
    pub channel: ChannelId,
    pub batches: mpsc::Receiver<Bytes>,
}

struct ChannelSlot {
    channel: ChannelId,
    batches: mpsc::Receiver<Bytes>,
    queue: VecDeque<Bytes>,
    closed: bool,
}

impl ChannelSlot {
    /// Move everything currently buffered in the channel into the queue.
    fn pump(&mut self) {
        loop {
            match self.batches.try_recv() {
                Ok(batch) => self.queue.push_back(batch),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
            }
        }
    }
}

/// Result of a completed merge run.
#[derive(Debug)]
pub struct MergeOutcome {
    /// Every merged record, in output order.
    pub records: Vec<TimeTag>,
    /// Sub-acquisition batches consumed (the final merge index).
    pub batches_merged: u64,
}

pub struct Merger {
    slots: Vec<ChannelSlot>,
    pper_ps: u64,
    out_path: PathBuf,
    out: tokio::io::BufWriter<tokio::fs::File>,
    expect_more: watch::Receiver<bool>,
    merge_index: u64,
    records: Vec<TimeTag>,
}

impl Merger {
    /// Open the output file and take ownership of the channel feeds.
    /// `expect_more` starts true and is flipped false once all stream
    /// clients have been joined.
    pub async fn new(
        sources: Vec<ChannelSource>,
        output_path: &Path,
        pper_ps: u64,
        expect_more: watch::Receiver<bool>,
    ) -> Result<Self, MergeError> {
        let file = tokio::fs::File::create(output_path)
            .await
            .map_err(|source| MergeError::Io {
                path: output_path.to_owned(),
                source,
            })?;
        Ok(Merger {
            slots: sources
                .into_iter()
                .map(|s| ChannelSlot {
                    channel: s.channel,
                    batches: s.batches,
                    queue: VecDeque::new(),
                    closed: false,
                })
                .collect(),
            pper_ps,
            out_path: output_path.to_owned(),
            out: tokio::io::BufWriter::new(file),
            expect_more,
            merge_index: 0,
            records: Vec::new(),
        })
    }

    pub async fn run(mut self) -> Result<MergeOutcome, MergeError> {
        while *self.expect_more.borrow() {
            tokio::select! {
                _ = tokio::time::sleep(MERGE_QUANTUM) => {}
                changed = self.expect_more.changed() => {
                    // A dropped sender means no more data is coming.
                    if changed.is_err() {
                        break;
                    }
                }
            }
            self.pump_all();
            while self.all_ready() {
                self.merge_round(false).await?;
            }
        }
        // Drain: channels may have ended unevenly; merge whatever is left,
        // advancing the shared index past missing slots.
        loop {
            self.pump_all();
            if !self.any_ready() {
                break;
            }
            self.merge_round(true).await?;
        }
        self.out.flush().await.map_err(|source| MergeError::Io {
            path: self.out_path.clone(),
            source,
        })?;
        info!(
            records = self.records.len(),
            batches = self.merge_index,
            "merge complete"
        );
        Ok(MergeOutcome {
            records: self.records,
            batches_merged: self.merge_index,
        })
    }

    fn pump_all(&mut self) {
        for slot in &mut self.slots {
            slot.pump();
        }
    }

    fn all_ready(&self) -> bool {
        self.slots.iter().all(|s| !s.queue.is_empty())
    }

    fn any_ready(&self) -> bool {
        self.slots.iter().any(|s| !s.queue.is_empty())
    }

    /// Merge the batch at the current index across channels.  In the drain
    /// phase (`partial`) channels without a queued batch contribute nothing.
    async fn merge_round(&mut self, partial: bool) -> Result<(), MergeError> {
        let offset = self
            .pper_ps
            .checked_mul(self.merge_index)
            .ok_or(MergeError::OffsetOverflow {
                index: self.merge_index,
            })?;
        let mut merged: Vec<TimeTag> = Vec::new();
        for slot in &mut self.slots {
            let Some(batch) = slot.queue.pop_front() else {
                debug_assert!(partial, "non-drain round requires every channel ready");
                continue;
            };
            for timestamp in decode_timestamps(&batch) {
                let adjusted =
                    timestamp
                        .checked_add(offset)
                        .ok_or(MergeError::Overflow {
                            channel: slot.channel,
                            timestamp,
                            offset,
                        })?;
                merged.push(TimeTag {
                    channel: slot.channel,
                    timestamp: adjusted,
                });
            }
        }
        // Stable sort: within-batch arrival order survives for identical
        // (timestamp, channel) pairs.
        merged.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.channel.cmp(&b.channel)));

        let mut lines = String::with_capacity(merged.len() * 24);
        for tag in &merged {
            lines.push_str(&format!("{};{}\n", tag.channel, tag.timestamp));
        }
        self.out
            .write_all(lines.as_bytes())
            .await
            .map_err(|source| MergeError::Io {
                path: self.out_path.clone(),
                source,
            })?;

        self.merge_index += 1;
        debug!(
            batch = self.merge_index,
            merged = merged.len(),
            total = self.records.len() + merged.len(),
            "merged timestamp block"
        );
        self.records.extend(merged);
        Ok(())
    }
}
