//! Row-per-cycle persistence sinks.
use crate::core::PollCycleResult;
use crate::error::{AppResult, DaqError};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Name of the leading time column in every recording.
pub const TIME_COLUMN: &str = "relative_time";

/// A sink receiving one row per poll cycle.
///
/// `write_row` must not return until the row is durable; a crash right after it
/// returns must not lose the row.
pub trait RowSink: Send {
    /// Persist one cycle, `relative_time` seconds after the run started.
    fn write_row(&mut self, relative_time: f64, cycle: &PollCycleResult) -> AppResult<()>;

    /// Flush and close. Called once when the run stops, including after a fault.
    fn finish(&mut self) -> AppResult<()>;
}

/// A writer for CSV files.
///
/// The header (`relative_time` followed by the channel ids) is written when the file
/// is opened. Absent values are written as empty fields.
#[cfg(feature = "storage_csv")]
pub struct CsvRowWriter {
    path: PathBuf,
    columns: Vec<String>,
    writer: Option<csv::Writer<File>>,
    rows: usize,
}

#[cfg(feature = "storage_csv")]
impl CsvRowWriter {
    /// Create (or truncate) `path` and write the header row.
    pub fn create<P: AsRef<Path>>(path: P, columns: &[String]) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| DaqError::Persistence(format!("{}: {e}", parent.display())))?;
        }
        let file = File::create(&path)
            .map_err(|e| DaqError::Persistence(format!("Failed to create CSV file: {e}")))?;

        let mut writer = csv::Writer::from_writer(file);
        let header = std::iter::once(TIME_COLUMN).chain(columns.iter().map(String::as_str));
        writer.write_record(header)?;
        sync(&mut writer)?;

        tracing::info!(path = %path.display(), columns = columns.len(), "CSV recording opened");
        Ok(Self {
            path,
            columns: columns.to_vec(),
            writer: Some(writer),
            rows: 0,
        })
    }

    /// File being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows written since the file was opened.
    pub fn rows(&self) -> usize {
        self.rows
    }
}

#[cfg(feature = "storage_csv")]
fn sync(writer: &mut csv::Writer<File>) -> AppResult<()> {
    writer
        .flush()
        .and_then(|_| writer.get_ref().sync_data())
        .map_err(|e| DaqError::Persistence(format!("Failed to sync CSV file: {e}")))
}

#[cfg(feature = "storage_csv")]
impl RowSink for CsvRowWriter {
    fn write_row(&mut self, relative_time: f64, cycle: &PollCycleResult) -> AppResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| DaqError::Persistence(format!("{} is closed", self.path.display())))?;

        let mut record = Vec::with_capacity(self.columns.len() + 1);
        record.push(format!("{relative_time:.3}"));
        for id in &self.columns {
            record.push(cycle.value(id).map_or_else(String::new, |v| v.to_string()));
        }
        writer.write_record(&record)?;
        sync(writer)?;
        self.rows += 1;
        Ok(())
    }

    fn finish(&mut self) -> AppResult<()> {
        if let Some(mut writer) = self.writer.take() {
            sync(&mut writer)?;
            tracing::info!(path = %self.path.display(), rows = self.rows, "CSV recording closed");
        }
        Ok(())
    }
}

#[cfg(not(feature = "storage_csv"))]
pub struct CsvRowWriter;

#[cfg(not(feature = "storage_csv"))]
impl CsvRowWriter {
    pub fn create<P: AsRef<Path>>(_path: P, _columns: &[String]) -> AppResult<Self> {
        Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
    }
}

#[cfg(not(feature = "storage_csv"))]
impl RowSink for CsvRowWriter {
    fn write_row(&mut self, _relative_time: f64, _cycle: &PollCycleResult) -> AppResult<()> {
        Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
    }

    fn finish(&mut self) -> AppResult<()> {
        Ok(())
    }
}

/// In-memory sink, handy for tests and dry runs.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    /// `(relative_time, values in column order)` for every row written.
    pub rows: Vec<(f64, Vec<Option<f64>>)>,
    columns: Vec<String>,
    pub finished: bool,
}

impl MemorySink {
    pub fn new(columns: &[String]) -> Self {
        Self {
            rows: Vec::new(),
            columns: columns.to_vec(),
            finished: false,
        }
    }
}

impl RowSink for MemorySink {
    fn write_row(&mut self, relative_time: f64, cycle: &PollCycleResult) -> AppResult<()> {
        let values = self.columns.iter().map(|id| cycle.value(id)).collect();
        self.rows.push((relative_time, values));
        Ok(())
    }

    fn finish(&mut self) -> AppResult<()> {
        self.finished = true;
        Ok(())
    }
}

#[cfg(all(test, feature = "storage_csv"))]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::time::Instant;

    #[test]
    fn writes_header_and_rows_immediately() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.csv");
        let columns = vec!["PV1".to_string(), "CMD".to_string()];
        let mut sink = CsvRowWriter::create(&path, &columns).unwrap();

        let cycle = PollCycleResult::new(Instant::now())
            .with("PV1", Some(21.5))
            .with("CMD", None);
        sink.write_row(2.0, &cycle).unwrap();

        // Visible on disk before `finish`.
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines, vec!["relative_time,PV1,CMD", "2.000,21.5,"]);
        assert_eq!(sink.rows(), 1);

        sink.finish().unwrap();
        assert!(sink.write_row(4.0, &cycle).is_err());
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("out.csv");
        let sink = CsvRowWriter::create(&path, &["A".to_string()]).unwrap();
        assert!(path.exists());
        assert_eq!(sink.path(), path.as_path());
    }
}
