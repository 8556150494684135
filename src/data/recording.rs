//! Reading persisted recordings back for inspection and identification work.
use crate::data::storage::TIME_COLUMN;
use crate::error::{AppResult, DaqError};
use std::collections::HashMap;
use std::path::Path;

/// A CSV recording loaded into named columns.
#[derive(Debug, Clone, Default)]
pub struct Recording {
    columns: Vec<String>,
    data: HashMap<String, Vec<Option<f64>>>,
}

/// Descriptive statistics for one column, ignoring absent values.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSummary {
    pub name: String,
    pub present: usize,
    pub missing: usize,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    /// Last present value relative to the first one.
    pub change: Option<f64>,
}

impl Recording {
    /// Load a recording written by [`CsvRowWriter`](crate::data::storage::CsvRowWriter)
    /// or any CSV with a header row and numeric fields.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        let mut reader = csv::Reader::from_path(path)
            .map_err(|e| DaqError::Persistence(format!("{}: {e}", path.display())))?;

        let columns: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();
        let mut data: HashMap<String, Vec<Option<f64>>> =
            columns.iter().map(|c| (c.clone(), Vec::new())).collect();

        for (line, record) in reader.records().enumerate() {
            let record = record?;
            for (name, field) in columns.iter().zip(record.iter()) {
                let field = field.trim();
                let value = if field.is_empty() {
                    None
                } else {
                    Some(field.parse::<f64>().map_err(|e| {
                        DaqError::Persistence(format!(
                            "{}: row {}, column '{name}': {e}",
                            path.display(),
                            line + 1
                        ))
                    })?)
                };
                if let Some(column) = data.get_mut(name) {
                    column.push(value);
                }
            }
        }

        Ok(Self { columns, data })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&[Option<f64>]> {
        self.data.get(name).map(Vec::as_slice)
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.columns
            .first()
            .and_then(|c| self.data.get(c))
            .map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Span covered by the time column, if there is one.
    pub fn duration(&self) -> Option<f64> {
        let time = self.column(TIME_COLUMN)?;
        let first = time.iter().find_map(|t| *t)?;
        let last = time.iter().rev().find_map(|t| *t)?;
        Some(last - first)
    }

    /// The column shifted so its first present value is zero.
    pub fn remove_initial_value(&self, name: &str) -> Option<Vec<Option<f64>>> {
        let column = self.column(name)?;
        let initial = column.iter().find_map(|v| *v).unwrap_or(0.0);
        Some(column.iter().map(|v| v.map(|x| x - initial)).collect())
    }

    /// Per-column statistics, in file order.
    pub fn summary(&self) -> Vec<ColumnSummary> {
        self.columns
            .iter()
            .map(|name| {
                let column = self.data.get(name).map(Vec::as_slice).unwrap_or_default();
                let present: Vec<f64> = column.iter().filter_map(|v| *v).collect();
                let mean = (!present.is_empty())
                    .then(|| present.iter().sum::<f64>() / present.len() as f64);
                ColumnSummary {
                    name: name.clone(),
                    present: present.len(),
                    missing: column.len() - present.len(),
                    min: present.iter().copied().reduce(f64::min),
                    max: present.iter().copied().reduce(f64::max),
                    mean,
                    change: self
                        .remove_initial_value(name)
                        .and_then(|shifted| shifted.iter().rev().find_map(|v| *v)),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn recording(contents: &str) -> Recording {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        Recording::load(file.path()).unwrap()
    }

    #[test]
    fn loads_columns_and_absent_values() {
        let rec = recording("relative_time,PV1,MV1\n0.0,25.0,10\n2.0,,10\n4.0,26.5,20\n");
        assert_eq!(rec.columns(), ["relative_time", "PV1", "MV1"]);
        assert_eq!(rec.len(), 3);
        assert_eq!(rec.column("PV1").unwrap(), &[Some(25.0), None, Some(26.5)]);
        assert_eq!(rec.duration(), Some(4.0));
    }

    #[test]
    fn removes_initial_value() {
        let rec = recording("relative_time,PV1\n0,25.0\n1,25.5\n2,27.0\n");
        assert_eq!(
            rec.remove_initial_value("PV1").unwrap(),
            vec![Some(0.0), Some(0.5), Some(2.0)]
        );
    }

    #[test]
    fn summarises_each_column() {
        let rec = recording("relative_time,PV1\n0,20\n1,\n2,30\n");
        let pv = &rec.summary()[1];
        assert_eq!(pv.present, 2);
        assert_eq!(pv.missing, 1);
        assert_eq!(pv.min, Some(20.0));
        assert_eq!(pv.max, Some(30.0));
        assert_eq!(pv.mean, Some(25.0));
        assert_eq!(pv.change, Some(10.0));
    }

    #[test]
    fn rejects_non_numeric_fields() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"relative_time,PV1\n0,warm\n").unwrap();
        let err = Recording::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("PV1"));
    }
}
