//! On-disk timestamp formats.
//!
//! Two formats, both little-endian / UTF-8:
//!
//! - **Binary**: a `u64` record count, then one 12-byte record per tag
//!   (`u64` picosecond timestamp followed by `u32` channel id).
//! - **Text**: optional `#`-prefixed header lines, then `channel;timestamp`
//!   data lines.  Readers skip empty and `#` lines.
//!
//! The binary payload helpers (`encode_records`/`decode_records`) are also
//! the wire format for bulk file transfer between the nodes.

use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::Path;

/// Channel identifier as carried on the wire (small positive integers).
pub type ChannelId = i32;

/// One timestamp with its originating channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeTag {
    pub channel: ChannelId,
    /// Picoseconds.
    pub timestamp: u64,
}

const RECORD_LEN: usize = 12;
const COUNT_LEN: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("truncated file: header says {expected} records, payload holds {found}")]
    Truncated { expected: u64, found: u64 },
    #[error("missing record count header ({len} bytes)")]
    MissingHeader { len: usize },
    #[error("line {line}: malformed record `{text}`")]
    MalformedLine { line: usize, text: String },
}

// ---------------------------------------------------------------------------
// Binary format
// ---------------------------------------------------------------------------

/// Encode records into the binary payload: count header then records.
pub fn encode_records(records: &[TimeTag]) -> Vec<u8> {
    let mut out = Vec::with_capacity(COUNT_LEN + records.len() * RECORD_LEN);
    out.extend_from_slice(&(records.len() as u64).to_le_bytes());
    for tag in records {
        out.extend_from_slice(&tag.timestamp.to_le_bytes());
        out.extend_from_slice(&(tag.channel as u32).to_le_bytes());
    }
    out
}

/// Decode a full binary payload.  The header count must match the payload.
pub fn decode_records(bytes: &[u8]) -> Result<Vec<TimeTag>, FileError> {
    decode_prefix(bytes, 1.0)
}

/// Decode the first `ceil(N * fraction)` records (at least one when N > 0).
pub fn decode_prefix(bytes: &[u8], fraction: f64) -> Result<Vec<TimeTag>, FileError> {
    if bytes.len() < COUNT_LEN {
        return Err(FileError::MissingHeader { len: bytes.len() });
    }
    let count = u64::from_le_bytes(bytes[..COUNT_LEN].try_into().unwrap());
    let available = ((bytes.len() - COUNT_LEN) / RECORD_LEN) as u64;
    if available < count {
        return Err(FileError::Truncated {
            expected: count,
            found: available,
        });
    }
    let take = prefix_count(count, fraction);
    let mut records = Vec::with_capacity(take as usize);
    for i in 0..take as usize {
        let base = COUNT_LEN + i * RECORD_LEN;
        let timestamp = u64::from_le_bytes(bytes[base..base + 8].try_into().unwrap());
        let channel = u32::from_le_bytes(bytes[base + 8..base + 12].try_into().unwrap()) as ChannelId;
        records.push(TimeTag { channel, timestamp });
    }
    Ok(records)
}

/// How many records a "first `fraction`" read returns: `max(1, ceil(N*f))`
/// when N > 0, clamped to N; zero when the file is empty.
pub fn prefix_count(total: u64, fraction: f64) -> u64 {
    if total == 0 {
        return 0;
    }
    let wanted = (total as f64 * fraction).ceil() as u64;
    wanted.max(1).min(total)
}

/// The partial-data selection sent to the master: the first 10% of the
/// records, or at least 10 when there are fewer than 100 in total.
pub fn partial_count(total: u64) -> u64 {
    if total == 0 {
        return 0;
    }
    prefix_count(total, 0.10).max(10.min(total))
}

pub fn write_binary(path: &Path, records: &[TimeTag]) -> Result<(), FileError> {
    fs::write(path, encode_records(records))?;
    Ok(())
}

pub fn read_binary(path: &Path) -> Result<Vec<TimeTag>, FileError> {
    decode_records(&fs::read(path)?)
}

/// Read the first `ceil(N * fraction)` records of a binary file.
pub fn read_binary_prefix(path: &Path, fraction: f64) -> Result<Vec<TimeTag>, FileError> {
    decode_prefix(&fs::read(path)?, fraction)
}

// ---------------------------------------------------------------------------
// Text format
// ---------------------------------------------------------------------------

/// Write a text file with a `#` header block and `channel;timestamp` lines.
pub fn write_text(path: &Path, records: &[TimeTag], channels: &[ChannelId]) -> Result<(), FileError> {
    let file = fs::File::create(path)?;
    let mut out = std::io::BufWriter::new(file);
    writeln!(out, "# generated: {}", Utc::now().to_rfc3339())?;
    writeln!(
        out,
        "# channels: {}",
        channels
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    )?;
    writeln!(out, "# total: {}", records.len())?;
    writeln!(out, "# channel;timestamp")?;
    for tag in records {
        writeln!(out, "{};{}", tag.channel, tag.timestamp)?;
    }
    out.flush()?;
    Ok(())
}

/// Read a text file, skipping empty and `#` lines.
pub fn read_text(path: &Path) -> Result<Vec<TimeTag>, FileError> {
    parse_text(&fs::read_to_string(path)?)
}

pub fn parse_text(content: &str) -> Result<Vec<TimeTag>, FileError> {
    let mut records = Vec::new();
    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let malformed = || FileError::MalformedLine {
            line: idx + 1,
            text: raw.to_owned(),
        };
        let (channel, timestamp) = line.split_once(';').ok_or_else(malformed)?;
        records.push(TimeTag {
            channel: channel.trim().parse().map_err(|_| malformed())?,
            timestamp: timestamp.trim().parse().map_err(|_| malformed())?,
        });
    }
    Ok(records)
}

/// Convert a text file to the binary format, preserving record order.
pub fn text_to_binary(text_path: &Path, binary_path: &Path) -> Result<(), FileError> {
    let records = read_text(text_path)?;
    write_binary(binary_path, &records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(channel: ChannelId, timestamp: u64) -> TimeTag {
        TimeTag { channel, timestamp }
    }

    #[test]
    fn binary_round_trip_preserves_records() {
        let records = vec![tag(1, 5), tag(2, 5), tag(1, u64::MAX), tag(4, 0)];
        let back = decode_records(&encode_records(&records)).unwrap();
        assert_eq!(back, records);
    }

    #[test]
    fn empty_binary_file_is_readable() {
        let bytes = encode_records(&[]);
        assert_eq!(bytes.len(), 8);
        assert!(decode_records(&bytes).unwrap().is_empty());
    }

    #[test]
    fn header_count_matches_record_count() {
        let bytes = encode_records(&[tag(1, 10), tag(2, 20), tag(3, 30)]);
        let count = u64::from_le_bytes(bytes[..8].try_into().unwrap());
        assert_eq!(count, 3);
        assert_eq!(bytes.len(), 8 + 3 * 12);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let mut bytes = encode_records(&[tag(1, 10), tag(2, 20)]);
        bytes.truncate(bytes.len() - 12);
        assert!(matches!(
            decode_records(&bytes),
            Err(FileError::Truncated {
                expected: 2,
                found: 1
            })
        ));
    }

    #[test]
    fn prefix_count_law() {
        assert_eq!(prefix_count(0, 0.10), 0);
        assert_eq!(prefix_count(1, 0.10), 1);
        assert_eq!(prefix_count(9, 0.10), 1);
        assert_eq!(prefix_count(100, 0.10), 10);
        assert_eq!(prefix_count(101, 0.10), 11);
        assert_eq!(prefix_count(5, 1.0), 5);
    }

    #[test]
    fn partial_count_is_at_least_ten_for_small_files() {
        assert_eq!(partial_count(0), 0);
        assert_eq!(partial_count(4), 4);
        assert_eq!(partial_count(50), 10);
        assert_eq!(partial_count(100), 10);
        assert_eq!(partial_count(1000), 100);
    }

    #[test]
    fn prefix_decode_returns_exactly_the_prefix() {
        let records: Vec<_> = (0..40).map(|i| tag(1 + (i % 2) as i32, i * 7)).collect();
        let bytes = encode_records(&records);
        let prefix = decode_prefix(&bytes, 0.10).unwrap();
        assert_eq!(prefix.len(), 4);
        assert_eq!(prefix, records[..4]);
    }

    #[test]
    fn text_round_trip_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        let txt = dir.path().join("merged.txt");
        let bin = dir.path().join("merged.bin");
        let records = vec![tag(1, 100), tag(2, 100), tag(1, 250)];

        write_text(&txt, &records, &[1, 2]).unwrap();
        text_to_binary(&txt, &bin).unwrap();
        assert_eq!(read_binary(&bin).unwrap(), records);

        let txt2 = dir.path().join("merged2.txt");
        write_text(&txt2, &read_binary(&bin).unwrap(), &[1, 2]).unwrap();
        assert_eq!(read_text(&txt2).unwrap(), records);
    }

    #[test]
    fn text_reader_skips_headers_and_blank_lines() {
        let content = "# generated: now\n\n1;10\n# comment\n2;20\n\n";
        let records = parse_text(content).unwrap();
        assert_eq!(records, vec![tag(1, 10), tag(2, 20)]);
    }

    #[test]
    fn text_reader_rejects_garbage() {
        assert!(matches!(
            parse_text("1;ten"),
            Err(FileError::MalformedLine { line: 1, .. })
        ));
        assert!(parse_text("no-separator").is_err());
    }
}
