//! Timings file writer and reader.
//!
//! The file is plain comma-separated text with a commented header:
//!
//! ```text
//! # fps=2
//! # streamMB=6
//! # subscribe=true
//! # wait=1
//! # totaltime=30
//! # sys/tg_test/1/ampli, sys/tg_test/1/State
//! 0.412,0.388
//! 0.401,nan
//! ```
//!
//! One column per attribute, one row per poll. Series shorter than the longest
//! one are padded with `nan`.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing::info;

use crate::error::{AppResult, StressError};
use crate::measurement::{RunParameters, TimingSeries, TimingTable};

/// Token written for cells past the end of a series.
pub const MISSING: &str = "nan";

/// Contents of a timings file.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedTimings {
    /// `key=value` header entries, in file order
    pub parameters: Vec<(String, String)>,
    /// Timing table with padding removed
    pub table: TimingTable,
}

/// Name of the results file for a run finishing at `now`.
pub fn timestamped_filename(now: DateTime<Local>) -> String {
    format!("timings_{}.csv", now.format("%Y%m%d_%H%M%S"))
}

/// Write `table` with the run parameters as header to `out`.
pub fn write_timings<W: Write>(
    mut out: W,
    table: &TimingTable,
    params: &RunParameters,
) -> AppResult<()> {
    for (key, value) in params.header_entries() {
        writeln!(out, "# {key}={value}")?;
    }
    let columns: Vec<&str> = table.attributes().collect();
    writeln!(out, "# {}", columns.join(", "))?;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(&mut out);

    for row in 0..table.max_len() {
        let record: Vec<String> = table
            .iter()
            .map(|(_, series)| {
                series
                    .get(row)
                    .map_or_else(|| MISSING.to_string(), |ms| format!("{ms:.3}"))
            })
            .collect();
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Write `table` to the file at `path`, replacing it if it exists.
pub fn save_timings(path: &Path, table: &TimingTable, params: &RunParameters) -> AppResult<()> {
    let file = File::create(path)?;
    let mut out = BufWriter::new(file);
    write_timings(&mut out, table, params)?;
    out.flush()?;
    Ok(())
}

/// Write `table` to a new timestamped file in `dir` and return its path.
///
/// `dir` is created if it does not exist.
pub fn save_timestamped(
    dir: &Path,
    table: &TimingTable,
    params: &RunParameters,
) -> AppResult<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(timestamped_filename(Local::now()));
    save_timings(&path, table, params)?;
    info!(path = %path.display(), "Results saved to {}", path.display());
    Ok(path)
}

/// Parse a timings file written by [`write_timings`].
///
/// The last comment line names the columns. Earlier comment lines holding a
/// `=` are run parameters. `nan` cells are dropped, so every series comes back
/// with its original length.
pub fn read_timings<R: Read>(mut input: R) -> AppResult<LoadedTimings> {
    let mut text = String::new();
    input.read_to_string(&mut text)?;

    let comments: Vec<&str> = text
        .lines()
        .take_while(|line| line.starts_with('#'))
        .map(|line| line.trim_start_matches('#').trim())
        .collect();
    let (header, param_lines) = comments
        .split_last()
        .ok_or_else(|| StressError::Format("missing column header".into()))?;

    let parameters = param_lines
        .iter()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    let columns: Vec<String> = if header.is_empty() {
        Vec::new()
    } else {
        header.split(',').map(|c| c.trim().to_string()).collect()
    };
    let mut series: Vec<TimingSeries> = vec![TimingSeries::new(); columns.len()];

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    for (row, record) in reader.records().enumerate() {
        let record = record?;
        if record.len() != columns.len() {
            return Err(StressError::Format(format!(
                "row {} has {} cells, expected {}",
                row + 1,
                record.len(),
                columns.len()
            )));
        }
        for (col, cell) in record.iter().enumerate() {
            if cell.eq_ignore_ascii_case(MISSING) {
                continue;
            }
            let value: f64 = cell.parse().map_err(|_| {
                StressError::Format(format!("row {}: '{}' is not a number", row + 1, cell))
            })?;
            series[col].push(value);
        }
    }

    Ok(LoadedTimings {
        parameters,
        table: columns.into_iter().zip(series).collect(),
    })
}

/// Read the timings file at `path`.
pub fn load_timings(path: &Path) -> AppResult<LoadedTimings> {
    read_timings(File::open(path)?)
}
