//! Append-only log of timestamped readings.
//!
//! The on-disk form is a two-column CSV (`timestamp,value`) with RFC 3339
//! timestamps, so captures can be opened in a spreadsheet directly.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, SecondsFormat};
use thiserror::Error;

const HEADER: [&str; 2] = ["timestamp", "value"];

/// Errors from a capture sink.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Parse error at row {row}: {message}")]
    Parse { row: usize, message: String },
}

/// One captured reading.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRecord {
    pub timestamp: DateTime<Local>,
    pub value: f64,
}

/// Where appended records end up.
pub trait CaptureSink {
    fn write(&mut self, record: &CaptureRecord) -> Result<(), CaptureError>;
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Vec<CaptureRecord>,
}

impl MemorySink {
    pub fn records(&self) -> &[CaptureRecord] {
        &self.records
    }
}

impl CaptureSink for MemorySink {
    fn write(&mut self, record: &CaptureRecord) -> Result<(), CaptureError> {
        self.records.push(record.clone());
        Ok(())
    }
}

/// Appends records to a CSV file. Existing rows are never touched.
pub struct CsvSink {
    writer: csv::Writer<std::fs::File>,
    path: PathBuf,
}

impl CsvSink {
    /// Open `path` for appending, writing the header only if the file is new or empty.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CaptureError> {
        let path = path.as_ref().to_path_buf();
        let has_rows = std::fs::metadata(&path)
            .map(|meta| meta.len() > 0)
            .unwrap_or(false);

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(file);

        if !has_rows {
            writer.write_record(HEADER)?;
            writer.flush()?;
        }

        Ok(Self { writer, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record of a capture file, in file order.
    pub fn read_records<P: AsRef<Path>>(path: P) -> Result<Vec<CaptureRecord>, CaptureError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)?;

        let mut records = Vec::new();
        for (index, row) in reader.records().enumerate() {
            let row = row?;
            // Header is line 1
            let line = index + 2;
            let (timestamp, value) = match (row.get(0), row.get(1)) {
                (Some(timestamp), Some(value)) => (timestamp, value),
                _ => {
                    return Err(CaptureError::Parse {
                        row: line,
                        message: "expected two columns".into(),
                    })
                }
            };
            let timestamp = DateTime::parse_from_rfc3339(timestamp)
                .map_err(|e| CaptureError::Parse {
                    row: line,
                    message: format!("bad timestamp '{timestamp}': {e}"),
                })?
                .with_timezone(&Local);
            let value = value.trim().parse::<f64>().map_err(|e| CaptureError::Parse {
                row: line,
                message: format!("bad value '{value}': {e}"),
            })?;
            records.push(CaptureRecord { timestamp, value });
        }
        Ok(records)
    }
}

impl CaptureSink for CsvSink {
    fn write(&mut self, record: &CaptureRecord) -> Result<(), CaptureError> {
        self.writer.write_record([
            record.timestamp.to_rfc3339_opts(SecondsFormat::Millis, false),
            record.value.to_string(),
        ])?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Stamps readings as they arrive and hands them to a sink.
///
/// Timestamps never go backwards: if the wall clock steps back, the previous
/// timestamp is reused.
pub struct CaptureLog<S> {
    sink: S,
    last: Option<DateTime<Local>>,
    appended: usize,
}

impl<S: CaptureSink> CaptureLog<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            last: None,
            appended: 0,
        }
    }

    /// Append `value`, stamped with the current time.
    pub fn append(&mut self, value: f64) -> crate::Result<CaptureRecord> {
        let now = Local::now();
        let timestamp = match self.last {
            Some(last) if last > now => last,
            _ => now,
        };
        let record = CaptureRecord { timestamp, value };
        self.sink.write(&record)?;
        self.last = Some(timestamp);
        self.appended += 1;
        Ok(record)
    }

    /// Number of records appended through this log.
    pub fn len(&self) -> usize {
        self.appended
    }

    pub fn is_empty(&self) -> bool {
        self.appended == 0
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}

impl CaptureLog<MemorySink> {
    pub fn in_memory() -> Self {
        Self::new(MemorySink::default())
    }

    pub fn records(&self) -> &[CaptureRecord] {
        self.sink.records()
    }
}

impl CaptureLog<CsvSink> {
    pub fn csv<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        Ok(Self::new(CsvSink::open(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_append_preserves_order() {
        let mut log = CaptureLog::in_memory();
        let inputs = [3.0, 1.5, -2.0, 1.5];
        for value in inputs {
            log.append(value).unwrap();
        }

        let values: Vec<f64> = log.records().iter().map(|r| r.value).collect();
        assert_eq!(values, inputs.to_vec());
        assert_eq!(log.len(), 4);
        assert!(log
            .records()
            .windows(2)
            .all(|pair| pair[0].timestamp <= pair[1].timestamp));
    }

    #[test]
    fn test_timestamps_never_decrease() {
        let mut log = CaptureLog::in_memory();
        let future = Local::now() + chrono::Duration::hours(1);
        log.last = Some(future);

        let record = log.append(1.0).unwrap();
        assert_eq!(record.timestamp, future);
    }

    #[test]
    fn test_csv_sink_appends_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("captures.csv");

        {
            let mut log = CaptureLog::csv(&path).unwrap();
            log.append(30.0).unwrap();
            log.append(30.5).unwrap();
        }
        {
            let mut log = CaptureLog::csv(&path).unwrap();
            log.append(31.25).unwrap();
        }

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().filter(|l| l.starts_with("timestamp")).count(), 1);

        let records = CsvSink::read_records(&path).unwrap();
        let values: Vec<f64> = records.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![30.0, 30.5, 31.25]);
    }

    #[test]
    fn test_read_records_reports_bad_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.csv");
        std::fs::write(&path, "timestamp,value\nyesterday,1.0\n").unwrap();

        match CsvSink::read_records(&path) {
            Err(CaptureError::Parse { row, .. }) => assert_eq!(row, 2),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
