//! Append-only telemetry log and its tail reader.
//!
//! One record per line:
//!
//! ```text
//! 2024-05-01 12:00:00.250,21.5000,22.0000,23.0000,1.0000,1.0000
//! ```
//!
//! A timestamp with millisecond resolution followed by the numeric fields at a
//! fixed decimal precision. Each record is serialised into one buffer and
//! appended with a single `write_all`, so a concurrent reader never sees a
//! record interleaved with another.
//!
//! The tail reader never scans the whole file. It guesses an average record
//! length, seeks back `n` records' worth from the end, and widens the guess by
//! [`TAIL_GROWTH`] until it has `n` complete lines or reaches the start.

use crate::error::{AppResult, TestbedError};
use chrono::{Local, NaiveDateTime};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace};

/// Timestamp layout written to the log.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Accepts any number of fractional digits when reading.
const TIMESTAMP_PARSE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Factor applied to the record length estimate after a short tail pass.
pub const TAIL_GROWTH: f64 = 1.3;

/// Record length assumed when the first line cannot be measured.
pub const DEFAULT_RECORD_LEN_HINT: usize = 64;

/// Longest first line measured for the estimate.
const MAX_PROBE_LEN: u64 = 4096;

/// One line of the telemetry log.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    /// Local wall-clock time of the tick
    pub timestamp: NaiveDateTime,
    /// Device readings followed by instrument readings
    pub fields: Vec<f64>,
}

impl TelemetryRecord {
    /// Record with an explicit timestamp.
    pub fn new(timestamp: NaiveDateTime, fields: Vec<f64>) -> Self {
        Self { timestamp, fields }
    }

    /// Record stamped with the local wall clock.
    pub fn now(fields: Vec<f64>) -> Self {
        Self::new(Local::now().naive_local(), fields)
    }

    /// Serialise as one newline-terminated CSV line.
    pub fn to_line(&self, precision: usize) -> AppResult<Vec<u8>> {
        let mut row = Vec::with_capacity(self.fields.len() + 1);
        row.push(self.timestamp.format(TIMESTAMP_FORMAT).to_string());
        row.extend(self.fields.iter().map(|v| format!("{:.*}", precision, v)));

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());
        writer
            .write_record(&row)
            .map_err(|e| TestbedError::Io(e.into()))?;
        writer
            .into_inner()
            .map_err(|e| TestbedError::Io(e.into_error()))
    }

    /// Parse one line. Surrounding whitespace is ignored.
    pub fn parse(line: &str) -> AppResult<Self> {
        let malformed = |reason: String| TestbedError::MalformedRecord {
            line: line.to_string(),
            reason,
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .trim(csv::Trim::All)
            .from_reader(line.trim().as_bytes());
        let row = reader
            .records()
            .next()
            .ok_or_else(|| malformed("empty line".to_string()))?
            .map_err(|e| malformed(e.to_string()))?;

        let mut columns = row.iter();
        let stamp = columns
            .next()
            .ok_or_else(|| malformed("missing timestamp".to_string()))?;
        let timestamp = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_PARSE_FORMAT)
            .map_err(|e| malformed(format!("bad timestamp '{}': {}", stamp, e)))?;

        let fields = columns
            .map(|c| {
                c.parse::<f64>()
                    .map_err(|e| malformed(format!("bad field '{}': {}", c, e)))
            })
            .collect::<AppResult<Vec<f64>>>()?;

        Ok(Self { timestamp, fields })
    }
}

/// The last records of a log, oldest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TailWindow {
    /// Records in file order
    pub records: Vec<TelemetryRecord>,
    /// Records exist before the first one in `records`.
    pub has_more: bool,
}

impl TailWindow {
    /// Number of records returned.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no record was returned.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Result of [`TelemetryLog::clear`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearOutcome {
    /// The file existed and was deleted
    Removed,
    /// There was no file to delete
    NotFound,
}

/// Handle on one log file. Holds no open descriptor between calls.
#[derive(Debug, Clone)]
pub struct TelemetryLog {
    path: PathBuf,
    precision: usize,
    record_len_hint: usize,
}

impl TelemetryLog {
    /// Handle on `path`, writing fields with `precision` decimals.
    pub fn new(path: impl Into<PathBuf>, precision: usize) -> Self {
        Self {
            path: path.into(),
            precision,
            record_len_hint: DEFAULT_RECORD_LEN_HINT,
        }
    }

    /// Initial record length guess used when the first line cannot be measured.
    pub fn with_record_len_hint(mut self, hint: usize) -> Self {
        self.record_len_hint = hint.max(1);
        self
    }

    /// File the log writes to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decimal places written per field.
    pub fn precision(&self) -> usize {
        self.precision
    }

    /// Append one record, creating the directory and file if needed.
    pub fn append(&self, record: &TelemetryRecord) -> AppResult<()> {
        let line = record.to_line(self.precision)?;
        self.ensure_parent()?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| TestbedError::log_io(&self.path, e))?;
        file.write_all(&line)
            .map_err(|e| TestbedError::log_io(&self.path, e))?;
        trace!(path = %self.path.display(), bytes = line.len(), "Record appended");
        Ok(())
    }

    /// Return the last `n` records.
    ///
    /// A missing file is an empty log. Blank lines are skipped; any other
    /// unparseable line in the window is an error.
    pub fn tail(&self, n: usize) -> AppResult<TailWindow> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(TailWindow::default()),
            Err(e) => return Err(TestbedError::log_io(&self.path, e)),
        };
        let io_err = |e| TestbedError::log_io(&self.path, e);

        // Later appends are outside this snapshot
        let len = file.metadata().map_err(io_err)?.len();
        if len == 0 {
            return Ok(TailWindow::default());
        }
        if n == 0 {
            return Ok(TailWindow {
                records: Vec::new(),
                has_more: self.has_any_record(&mut file, len)?,
            });
        }

        let mut estimate = self.estimate_record_len(&mut file, len)? as f64;
        let mut passes = 0usize;

        loop {
            passes += 1;
            let back = (estimate * n as f64).ceil() as u64;
            let start = len.saturating_sub(back);
            let lines = read_complete_lines(&mut file, start, len).map_err(io_err)?;

            if lines.len() >= n || start == 0 {
                let has_more = lines.len() > n || start > 0;
                let skip = lines.len().saturating_sub(n);
                let records = lines[skip..]
                    .iter()
                    .map(|line| TelemetryRecord::parse(line))
                    .collect::<AppResult<Vec<_>>>()?;
                debug!(
                    path = %self.path.display(),
                    requested = n,
                    returned = records.len(),
                    passes,
                    "Tail read"
                );
                return Ok(TailWindow { records, has_more });
            }

            trace!(
                found = lines.len(),
                requested = n,
                estimate,
                "Growing tail estimate"
            );
            estimate *= TAIL_GROWTH;
        }
    }

    /// Every record in the log, oldest first.
    pub fn read_all(&self) -> AppResult<Vec<TelemetryRecord>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(TestbedError::log_io(&self.path, e)),
        };

        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| TestbedError::log_io(&self.path, e))?;
            if !line.trim().is_empty() {
                records.push(TelemetryRecord::parse(&line)?);
            }
        }
        Ok(records)
    }

    /// Delete the log file.
    pub fn clear(&self) -> AppResult<ClearOutcome> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "Telemetry log cleared");
                Ok(ClearOutcome::Removed)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(ClearOutcome::NotFound),
            Err(e) => Err(TestbedError::log_io(&self.path, e)),
        }
    }

    /// Write `records` to `{dir}/{label}.csv`, replacing any previous file.
    pub fn archive(
        &self,
        dir: &Path,
        label: &str,
        records: &[TelemetryRecord],
    ) -> AppResult<PathBuf> {
        let path = dir.join(format!("{}.csv", label));
        fs::create_dir_all(dir).map_err(|e| TestbedError::log_io(dir, e))?;

        let mut buffer = Vec::new();
        for record in records {
            buffer.extend(record.to_line(self.precision)?);
        }
        fs::write(&path, buffer).map_err(|e| TestbedError::log_io(&path, e))?;

        info!(path = %path.display(), records = records.len(), "Window archived");
        Ok(path)
    }

    fn ensure_parent(&self) -> AppResult<()> {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() && !dir.exists() => {
                fs::create_dir_all(dir).map_err(|e| TestbedError::log_io(dir, e))
            }
            _ => Ok(()),
        }
    }

    /// Length of the first line including its newline, or the configured hint.
    fn estimate_record_len(&self, file: &mut File, len: u64) -> AppResult<usize> {
        let probe = read_range(file, 0, len.min(MAX_PROBE_LEN))
            .map_err(|e| TestbedError::log_io(&self.path, e))?;
        Ok(probe
            .iter()
            .position(|&b| b == b'\n')
            .filter(|&pos| pos > 0)
            .map(|pos| pos + 1)
            .unwrap_or(self.record_len_hint)
            .max(1))
    }

    fn has_any_record(&self, file: &mut File, len: u64) -> AppResult<bool> {
        let bytes = read_range(file, 0, len).map_err(|e| TestbedError::log_io(&self.path, e))?;
        Ok(bytes.iter().any(|b| !b.is_ascii_whitespace()))
    }
}

fn read_range(file: &mut File, start: u64, end: u64) -> io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(start))?;
    let mut buffer = Vec::with_capacity((end - start) as usize);
    file.take(end - start).read_to_end(&mut buffer)?;
    Ok(buffer)
}

/// Non-blank lines that start at or after `start` and end before `end`.
///
/// Reading from `start - 1` and dropping everything up to the first newline
/// discards a partial leading line but keeps a line that begins exactly at
/// `start`.
fn read_complete_lines(file: &mut File, start: u64, end: u64) -> io::Result<Vec<String>> {
    let from = start.saturating_sub(1);
    let bytes = read_range(file, from, end)?;

    let body = if start == 0 {
        &bytes[..]
    } else {
        match bytes.iter().position(|&b| b == b'\n') {
            Some(pos) => &bytes[pos + 1..],
            None => &[][..],
        }
    };

    Ok(String::from_utf8_lossy(body)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, NaiveDate};
    use tempfile::tempdir;
    use tracing_test::traced_test;

    fn stamp(offset_ms: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_milli_opt(12, 0, 0, 0)
            .unwrap()
            + ChronoDuration::milliseconds(offset_ms)
    }

    fn record(i: usize) -> TelemetryRecord {
        TelemetryRecord::new(stamp(i as i64 * 250), vec![i as f64, 1.5, -2.25])
    }

    fn write_records(log: &TelemetryLog, count: usize) {
        for i in 0..count {
            log.append(&record(i)).unwrap();
        }
    }

    #[test]
    fn line_format_is_fixed_precision() {
        let line = record(3).to_line(4).unwrap();
        assert_eq!(
            String::from_utf8(line).unwrap(),
            "2024-05-01 12:00:00.750,3.0000,1.5000,-2.2500\n"
        );
    }

    #[test]
    fn parse_reads_written_line() {
        let parsed = TelemetryRecord::parse("2024-05-01 12:00:00.750,3.0000,1.5000,-2.2500\n").unwrap();
        assert_eq!(parsed, record(3));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(
            TelemetryRecord::parse("not a time,1.0"),
            Err(TestbedError::MalformedRecord { .. })
        ));
        assert!(matches!(
            TelemetryRecord::parse("2024-05-01 12:00:00.000,abc"),
            Err(TestbedError::MalformedRecord { .. })
        ));
    }

    #[test]
    fn tail_of_ten_records() {
        let dir = tempdir().unwrap();
        let log = TelemetryLog::new(dir.path().join("run.csv"), 4);
        write_records(&log, 10);

        let window = log.tail(3).unwrap();
        assert_eq!(window.records, vec![record(7), record(8), record(9)]);
        assert!(window.has_more);

        let window = log.tail(20).unwrap();
        assert_eq!(window.len(), 10);
        assert_eq!(window.records[0], record(0));
        assert!(!window.has_more);

        let window = log.tail(10).unwrap();
        assert_eq!(window.len(), 10);
        assert!(!window.has_more);
    }

    #[test]
    fn tail_returns_min_of_n_and_m() {
        let dir = tempdir().unwrap();
        let log = TelemetryLog::new(dir.path().join("run.csv"), 4);
        let n = 5;

        for m in 0..=12 {
            let window = log.tail(n).unwrap();
            assert_eq!(window.len(), m.min(n), "m = {}", m);
            assert_eq!(window.has_more, m > n, "m = {}", m);
            if m > 0 {
                assert_eq!(window.records.last(), Some(&record(m - 1)));
            }
            log.append(&record(m)).unwrap();
        }
    }

    #[test]
    #[traced_test]
    fn tail_grows_estimate_when_first_line_is_short() {
        let dir = tempdir().unwrap();
        let log = TelemetryLog::new(dir.path().join("run.csv"), 2);

        log.append(&TelemetryRecord::new(stamp(0), vec![1.0])).unwrap();
        for i in 1..=8 {
            log.append(&TelemetryRecord::new(
                stamp(i),
                vec![123456.0, 654321.0, 111111.0, 222222.0],
            ))
            .unwrap();
        }

        let window = log.tail(4).unwrap();
        assert_eq!(window.len(), 4);
        assert!(window.has_more);
        assert_eq!(window.records[3].timestamp, stamp(8));
        assert!(logs_contain("Growing tail estimate"));

        let window = log.tail(9).unwrap();
        assert_eq!(window.len(), 9);
        assert_eq!(window.records[0].fields, vec![1.0]);
        assert!(!window.has_more);
    }

    #[test]
    fn tail_zero_reports_existing_records() {
        let dir = tempdir().unwrap();
        let log = TelemetryLog::new(dir.path().join("run.csv"), 4);

        let window = log.tail(0).unwrap();
        assert!(window.is_empty() && !window.has_more);

        write_records(&log, 2);
        let window = log.tail(0).unwrap();
        assert!(window.is_empty());
        assert!(window.has_more);
    }

    #[test]
    fn tail_skips_blank_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.csv");
        fs::write(
            &path,
            "2024-05-01 12:00:00.000,1.0\n\n2024-05-01 12:00:01.000,2.0\n\n",
        )
        .unwrap();

        let window = TelemetryLog::new(&path, 1).tail(5).unwrap();
        assert_eq!(window.len(), 2);
        assert_eq!(window.records[1].fields, vec![2.0]);
    }

    #[test]
    fn missing_file_is_empty_log() {
        let dir = tempdir().unwrap();
        let log = TelemetryLog::new(dir.path().join("absent.csv"), 4);
        assert_eq!(log.tail(3).unwrap(), TailWindow::default());
        assert!(log.read_all().unwrap().is_empty());
        assert_eq!(log.clear().unwrap(), ClearOutcome::NotFound);
    }

    #[test]
    fn append_creates_directories_and_clear_removes_file() {
        let dir = tempdir().unwrap();
        let log = TelemetryLog::new(dir.path().join("nested/deeper/run.csv"), 4);
        write_records(&log, 3);

        assert_eq!(log.read_all().unwrap().len(), 3);
        assert_eq!(log.clear().unwrap(), ClearOutcome::Removed);
        assert!(!log.path().exists());
        assert!(log.tail(3).unwrap().is_empty());
    }

    #[test]
    fn archive_writes_window_to_labeled_file() {
        let dir = tempdir().unwrap();
        let log = TelemetryLog::new(dir.path().join("run.csv"), 4);
        let records = vec![record(0), record(1)];

        let path = log
            .archive(&dir.path().join("archive"), "run_setpoint_1.500", &records)
            .unwrap();
        assert!(path.ends_with("archive/run_setpoint_1.500.csv"));
        assert_eq!(TelemetryLog::new(&path, 4).read_all().unwrap(), records);
    }
}
