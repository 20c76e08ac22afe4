//! Post-acquisition offset computation.
//!
//! Both nodes contribute the first-10% prefix of their merged records.  The
//! inter-node offset is estimated from pairs whose consecutive-difference
//! ratio is close to 1 (both instruments saw the same event spacing); pairs
//! outside the 0.9..1.1 band are dropped silently.  Statistics are carried
//! in the input unit (picoseconds); the report prints nanoseconds.

use crate::timetag::{FileError, TimeTag, read_binary, write_binary};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

const PS_PER_NS: f64 = 1000.0;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("cannot calculate sync: no valid offset samples")]
    NoValidSamples,
    #[error("file: {0}")]
    File(#[from] FileError),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Synchronisation quality, judged on the sample standard deviation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityTier {
    Excellent,
    Good,
    Acceptable,
    Poor,
}

impl QualityTier {
    pub fn from_stddev_ns(stddev_ns: f64) -> Self {
        if stddev_ns < 100.0 {
            QualityTier::Excellent
        } else if stddev_ns < 500.0 {
            QualityTier::Good
        } else if stddev_ns < 1000.0 {
            QualityTier::Acceptable
        } else {
            QualityTier::Poor
        }
    }

    pub fn verdict(self) -> &'static str {
        match self {
            QualityTier::Excellent => "Excellent synchronization",
            QualityTier::Good => "Good synchronization",
            QualityTier::Acceptable => "Acceptable synchronization",
            QualityTier::Poor => "Poor synchronization",
        }
    }
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            QualityTier::Excellent => "Excellent",
            QualityTier::Good => "Good",
            QualityTier::Acceptable => "Acceptable",
            QualityTier::Poor => "Poor",
        })
    }
}

/// Offset statistics over the accepted samples, in picoseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct OffsetStats {
    pub mean_ps: f64,
    pub min_ps: i64,
    pub max_ps: i64,
    pub stddev_ps: f64,
    pub sample_count: usize,
    pub quality: QualityTier,
}

impl OffsetStats {
    pub fn mean_ns(&self) -> f64 {
        self.mean_ps / PS_PER_NS
    }

    pub fn stddev_ns(&self) -> f64 {
        self.stddev_ps / PS_PER_NS
    }

    /// The signed correction applied to master timestamps.
    pub fn correction_ps(&self) -> i64 {
        self.mean_ps.round() as i64
    }
}

/// Estimate the slave-minus-master offset from the two prefix vectors.
///
/// Sample `i` is accepted when `0.9 < dS[i]/dM[i] < 1.1`, with value
/// `S[i] - M[i]`.  Returns [`SyncError::NoValidSamples`] when nothing
/// passes the filter (including empty or single-element inputs).
pub fn compute_offset(master: &[u64], slave: &[u64]) -> Result<OffsetStats, SyncError> {
    let pairs = master.len().min(slave.len());
    let mut offsets: Vec<i64> = Vec::new();
    for i in 0..pairs.saturating_sub(1) {
        let dm = master[i + 1] as i128 - master[i] as i128;
        let ds = slave[i + 1] as i128 - slave[i] as i128;
        if dm == 0 {
            continue;
        }
        let ratio = ds as f64 / dm as f64;
        if ratio > 0.9 && ratio < 1.1 {
            offsets.push((slave[i] as i128 - master[i] as i128) as i64);
        }
    }
    if offsets.is_empty() {
        return Err(SyncError::NoValidSamples);
    }

    let n = offsets.len() as f64;
    let mean = offsets.iter().map(|&o| o as f64).sum::<f64>() / n;
    let variance = offsets
        .iter()
        .map(|&o| {
            let d = o as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    let stddev = variance.sqrt();
    let stats = OffsetStats {
        mean_ps: mean,
        min_ps: *offsets.iter().min().unwrap(),
        max_ps: *offsets.iter().max().unwrap(),
        stddev_ps: stddev,
        sample_count: offsets.len(),
        quality: QualityTier::from_stddev_ns(stddev / PS_PER_NS),
    };
    info!(
        samples = stats.sample_count,
        mean_ns = stats.mean_ns(),
        stddev_ns = stats.stddev_ns(),
        quality = %stats.quality,
        "offset computed"
    );
    Ok(stats)
}

/// Shift every record by the signed correction, clamping at zero.
pub fn apply_correction(records: &mut [TimeTag], correction_ps: i64) {
    for tag in records {
        let shifted = tag.timestamp as i128 + correction_ps as i128;
        tag.timestamp = shifted.clamp(0, u64::MAX as i128) as u64;
    }
}

/// `corrected_` sibling of a master output file.
pub fn corrected_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("corrected_{name}"))
}

/// Read the full master binary, apply the correction, and write the
/// `corrected_` file alongside.  Returns the corrected path.
pub fn write_corrected_master(
    master_binary: &Path,
    correction_ps: i64,
) -> Result<PathBuf, SyncError> {
    let mut records = read_binary(master_binary)?;
    apply_correction(&mut records, correction_ps);
    let path = corrected_path(master_binary);
    write_binary(&path, &records)?;
    info!(path = %path.display(), correction_ps, "corrected master file written");
    Ok(path)
}

/// Fixed header context for the offset report.
#[derive(Debug, Clone)]
pub struct ReportContext {
    pub master_address: String,
    pub slave_address: String,
    /// `slave_trigger_ns - master_trigger_ns`, when the echo was received.
    pub trigger_offset_ns: Option<i64>,
}

/// Write the offset report: header block, data statistics, quality verdict.
pub fn write_report(
    path: &Path,
    ctx: &ReportContext,
    stats: &OffsetStats,
) -> Result<(), SyncError> {
    let file = std::fs::File::create(path)?;
    let mut out = std::io::BufWriter::new(file);
    writeln!(out, "=== SYNCHRONIZATION REPORT ===")?;
    writeln!(out, "Master: {}", ctx.master_address)?;
    writeln!(out, "Slave: {}", ctx.slave_address)?;
    match ctx.trigger_offset_ns {
        Some(offset) => writeln!(out, "Trigger timestamp offset: {offset} ns")?,
        None => writeln!(out, "Trigger timestamp offset: unavailable")?,
    }
    writeln!(out)?;
    writeln!(out, "Data timestamp statistics:")?;
    writeln!(out, "Min offset: {:.3} ns", stats.min_ps as f64 / PS_PER_NS)?;
    writeln!(out, "Max offset: {:.3} ns", stats.max_ps as f64 / PS_PER_NS)?;
    writeln!(out, "Mean offset: {:.3} ns", stats.mean_ns())?;
    writeln!(out, "Standard deviation: {:.3} ns", stats.stddev_ns())?;
    writeln!(
        out,
        "Range: {:.3} ns",
        (stats.max_ps - stats.min_ps) as f64 / PS_PER_NS
    )?;
    writeln!(out, "Samples used: {}", stats.sample_count)?;
    writeln!(out)?;
    writeln!(out, "{}", stats.quality.verdict())?;
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(values: &[u64]) -> Vec<TimeTag> {
        values
            .iter()
            .map(|&timestamp| TimeTag {
                channel: 1,
                timestamp,
            })
            .collect()
    }

    #[test]
    fn uniform_shift_yields_exact_mean_and_zero_spread() {
        let stats = compute_offset(&[100, 200, 300, 400], &[150, 250, 350, 450]).unwrap();
        assert!((stats.mean_ps - 50.0).abs() < f64::EPSILON);
        assert_eq!(stats.min_ps, 50);
        assert_eq!(stats.max_ps, 50);
        assert!(stats.stddev_ps.abs() < f64::EPSILON);
        assert_eq!(stats.sample_count, 3);
        assert_eq!(stats.quality, QualityTier::Excellent);
    }

    #[test]
    fn out_of_band_ratios_are_dropped_silently() {
        // Master spacing 100 everywhere; slave alternates matching spacing
        // with a 2x spacing that must be filtered out.
        let master = [0u64, 100, 200, 300, 400, 500];
        let slave = [50u64, 150, 350, 450, 650, 750];
        // dS: 100,200,100,200,100 -> ratios 1,2,1,2,1: indices 0,2,4 pass.
        let stats = compute_offset(&master, &slave).unwrap();
        assert_eq!(stats.sample_count, 3);
        assert_eq!(stats.min_ps, 50);
        assert_eq!(stats.max_ps, 250);
    }

    #[test]
    fn no_valid_samples_is_an_error() {
        assert!(matches!(
            compute_offset(&[0, 100, 200], &[0, 1000, 2000]),
            Err(SyncError::NoValidSamples)
        ));
        assert!(matches!(
            compute_offset(&[], &[]),
            Err(SyncError::NoValidSamples)
        ));
        assert!(matches!(
            compute_offset(&[1], &[1]),
            Err(SyncError::NoValidSamples)
        ));
    }

    #[test]
    fn zero_master_spacing_cannot_poison_the_ratio() {
        let stats = compute_offset(&[100, 100, 200, 300], &[150, 150, 250, 350]).unwrap();
        // The i=0 pair (dM=0) is skipped; the remaining pairs pass.
        assert_eq!(stats.sample_count, 2);
    }

    #[test]
    fn quality_tiers_follow_stddev_thresholds() {
        assert_eq!(QualityTier::from_stddev_ns(0.0), QualityTier::Excellent);
        assert_eq!(QualityTier::from_stddev_ns(99.9), QualityTier::Excellent);
        assert_eq!(QualityTier::from_stddev_ns(100.0), QualityTier::Good);
        assert_eq!(QualityTier::from_stddev_ns(499.0), QualityTier::Good);
        assert_eq!(QualityTier::from_stddev_ns(500.0), QualityTier::Acceptable);
        assert_eq!(QualityTier::from_stddev_ns(1000.0), QualityTier::Poor);
    }

    #[test]
    fn correction_shifts_and_clamps_at_zero() {
        let mut records = tags(&[0, 10, 100]);
        apply_correction(&mut records, -50);
        let shifted: Vec<u64> = records.iter().map(|t| t.timestamp).collect();
        assert_eq!(shifted, vec![0, 0, 50]);

        let mut records = tags(&[100, 200, 300, 400]);
        apply_correction(&mut records, 50);
        let shifted: Vec<u64> = records.iter().map(|t| t.timestamp).collect();
        assert_eq!(shifted, vec![150, 250, 350, 450]);
    }

    #[test]
    fn corrected_file_lands_next_to_the_original() {
        let dir = tempfile::tempdir().unwrap();
        let master = dir.path().join("master_results.bin");
        write_binary(&master, &tags(&[100, 200])).unwrap();

        let corrected = write_corrected_master(&master, 50).unwrap();
        assert_eq!(
            corrected.file_name().unwrap().to_str().unwrap(),
            "corrected_master_results.bin"
        );
        let back = read_binary(&corrected).unwrap();
        let shifted: Vec<u64> = back.iter().map(|t| t.timestamp).collect();
        assert_eq!(shifted, vec![150, 250]);
    }

    #[test]
    fn report_contains_header_stats_and_verdict() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offset_report.txt");
        let stats = compute_offset(&[100, 200, 300, 400], &[150, 250, 350, 450]).unwrap();
        let ctx = ReportContext {
            master_address: "10.0.0.1:5555".to_owned(),
            slave_address: "10.0.0.2".to_owned(),
            trigger_offset_ns: Some(1234),
        };
        write_report(&path, &ctx, &stats).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("Master: 10.0.0.1:5555"));
        assert!(text.contains("Slave: 10.0.0.2"));
        assert!(text.contains("Trigger timestamp offset: 1234 ns"));
        assert!(text.contains("Mean offset: 0.050 ns"));
        assert!(text.contains("Samples used: 3"));
        assert!(text.contains("Excellent synchronization"));
    }
}
