//! Partitioned output
//!
//! Rows land under `<base>/<table>/report_month=<YYYYMM>/` as JSON Lines
//! files named `data_<timestamp>_<id>.jsonl`. Files are written under a
//! hidden temporary name and renamed into place, so readers never see a
//! half-written file. Replacing a partition stages the new contents in a
//! hidden sibling directory first and swaps it in only after the write
//! succeeded.

use crate::error::WriteError;
use crate::source::Row;
use chrono::Utc;
use serde_jsonlines::JsonLinesWriter;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

/// Writes row batches into month partitions of an output table
#[derive(Debug, Clone)]
pub struct PartitionedWriter {
    base_path: PathBuf,
}

impl PartitionedWriter {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn partition_path(&self, table: &str, period_key: &str) -> PathBuf {
        self.base_path
            .join(table)
            .join(format!("report_month={}", period_key))
    }

    /// Whether the partition holds at least one data file
    pub fn has_data(&self, table: &str, period_key: &str) -> Result<bool, WriteError> {
        let dir = self.partition_path(table, period_key);
        Ok(!data_files(&dir)?.is_empty())
    }

    /// Write `rows` into the partition.
    ///
    /// Returns `false` without touching anything when the partition already
    /// has data and `force_overwrite` is off. With `force_overwrite` the old
    /// contents are replaced.
    pub fn write(
        &self,
        rows: &[Row],
        table: &str,
        period_key: &str,
        force_overwrite: bool,
    ) -> Result<bool, WriteError> {
        let partition = self.partition_path(table, period_key);
        let populated = self.has_data(table, period_key)?;

        if populated && !force_overwrite {
            info!(partition = %partition.display(), "Partition exists, skipping");
            return Ok(false);
        }

        if populated {
            self.replace(rows, table, &partition)?;
            info!(rows = rows.len(), partition = %partition.display(), "Replaced partition");
        } else {
            create_dir(&partition)?;
            write_file(rows, &partition)?;
            info!(rows = rows.len(), partition = %partition.display(), "Wrote partition");
        }
        Ok(true)
    }

    /// Add one more file to the partition, keeping what is already there
    pub fn append(&self, rows: &[Row], table: &str, period_key: &str) -> Result<(), WriteError> {
        let partition = self.partition_path(table, period_key);
        create_dir(&partition)?;
        write_file(rows, &partition)?;
        info!(rows = rows.len(), partition = %partition.display(), "Appended to partition");
        Ok(())
    }

    /// Every row stored in the partition, file by file
    pub fn read_partition(
        &self,
        table: &str,
        period_key: &str,
    ) -> Result<Vec<serde_json::Value>, WriteError> {
        let dir = self.partition_path(table, period_key);
        let mut rows = Vec::new();
        for file in data_files(&dir)? {
            let lines = serde_jsonlines::json_lines::<serde_json::Value, _>(&file).map_err(io_err(&file))?;
            for line in lines {
                rows.push(line.map_err(io_err(&file))?);
            }
        }
        Ok(rows)
    }

    fn replace(&self, rows: &[Row], table: &str, partition: &Path) -> Result<(), WriteError> {
        let table_dir = self.base_path.join(table);
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&table_dir)
            .map_err(io_err(&table_dir))?;
        write_file(rows, staging.path())?;

        std::fs::remove_dir_all(partition).map_err(io_err(partition))?;
        std::fs::rename(staging.path(), partition).map_err(io_err(partition))?;
        debug!(partition = %partition.display(), "Swapped staged partition into place");
        // `staging` now points at a path that no longer exists; its cleanup is a no-op
        Ok(())
    }
}

fn io_err(path: &Path) -> impl Fn(std::io::Error) -> WriteError + '_ {
    move |source| WriteError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn create_dir(dir: &Path) -> Result<(), WriteError> {
    std::fs::create_dir_all(dir).map_err(io_err(dir))
}

/// Visible files of a partition directory, sorted by name
fn data_files(dir: &Path) -> Result<Vec<PathBuf>, WriteError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(dir)(e)),
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(io_err(dir))?;
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if !hidden && entry.file_type().map_err(io_err(dir))?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Write one JSON Lines file into `dir` atomically
fn write_file(rows: &[Row], dir: &Path) -> Result<PathBuf, WriteError> {
    let file_name = format!(
        "data_{}_{}.jsonl",
        Utc::now().format("%Y%m%dT%H%M%S"),
        &Uuid::new_v4().simple().to_string()[..8]
    );
    let target = dir.join(file_name);

    let mut tmp = tempfile::Builder::new()
        .prefix(".data")
        .tempfile_in(dir)
        .map_err(io_err(dir))?;
    {
        let mut writer = JsonLinesWriter::new(BufWriter::new(tmp.as_file_mut()));
        for row in rows {
            writer.write(&row.fields).map_err(io_err(&target))?;
        }
        writer.flush().map_err(io_err(&target))?;
    }
    tmp.as_file().sync_all().map_err(io_err(&target))?;
    tmp.persist(&target).map_err(|e| WriteError::Persist {
        path: target.display().to_string(),
        source: e,
    })?;

    Ok(target)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use shoplens_common::unit::ExtractionUnit;
    use tempfile::TempDir;

    const TABLE: &str = "analytics_events_final";

    fn rows(day: &str, names: &[&str]) -> Vec<Row> {
        let unit: ExtractionUnit = day.parse().unwrap();
        names
            .iter()
            .map(|name| {
                let fields = json!({"event_date": day, "event_name": name});
                Row::new(unit, fields.as_object().unwrap().clone())
            })
            .collect()
    }

    fn event_names(writer: &PartitionedWriter, period: &str) -> Vec<String> {
        let mut names: Vec<String> = writer
            .read_partition(TABLE, period)
            .unwrap()
            .into_iter()
            .map(|row| row["event_name"].as_str().unwrap().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_partition_layout() {
        let dir = TempDir::new().unwrap();
        let writer = PartitionedWriter::new(dir.path());

        assert!(writer.write(&rows("2025-06-01", &["page_view"]), TABLE, "202506", false).unwrap());

        let partition = dir.path().join(TABLE).join("report_month=202506");
        let files = data_files(&partition).unwrap();
        assert_eq!(files.len(), 1);
        let name = files[0].file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("data_") && name.ends_with(".jsonl"));
    }

    #[test]
    fn test_current_period_overwrite_keeps_only_second_write() {
        let dir = TempDir::new().unwrap();
        let writer = PartitionedWriter::new(dir.path());

        assert!(writer.write(&rows("2025-06-01", &["a", "b"]), TABLE, "202506", true).unwrap());
        assert!(writer.write(&rows("2025-06-02", &["c"]), TABLE, "202506", true).unwrap());

        assert_eq!(event_names(&writer, "202506"), vec!["c"]);
        let partition = writer.partition_path(TABLE, "202506");
        assert_eq!(data_files(&partition).unwrap().len(), 1);
    }

    #[test]
    fn test_past_period_is_never_overwritten() {
        let dir = TempDir::new().unwrap();
        let writer = PartitionedWriter::new(dir.path());

        assert!(writer.write(&rows("2025-05-01", &["old"]), TABLE, "202505", false).unwrap());
        let before = data_files(&writer.partition_path(TABLE, "202505")).unwrap();

        assert!(!writer.write(&rows("2025-05-01", &["new"]), TABLE, "202505", false).unwrap());

        assert_eq!(data_files(&writer.partition_path(TABLE, "202505")).unwrap(), before);
        assert_eq!(event_names(&writer, "202505"), vec!["old"]);
    }

    #[test]
    fn test_append_adds_a_file() {
        let dir = TempDir::new().unwrap();
        let writer = PartitionedWriter::new(dir.path());

        writer.write(&rows("2025-06-01", &["a"]), TABLE, "202506", false).unwrap();
        writer.append(&rows("2025-06-03", &["b"]), TABLE, "202506").unwrap();

        assert_eq!(event_names(&writer, "202506"), vec!["a", "b"]);
        assert_eq!(data_files(&writer.partition_path(TABLE, "202506")).unwrap().len(), 2);
    }

    #[test]
    fn test_has_data_ignores_hidden_files() {
        let dir = TempDir::new().unwrap();
        let writer = PartitionedWriter::new(dir.path());
        let partition = writer.partition_path(TABLE, "202506");

        assert!(!writer.has_data(TABLE, "202506").unwrap());
        std::fs::create_dir_all(&partition).unwrap();
        std::fs::write(partition.join(".data-leftover"), "").unwrap();
        assert!(!writer.has_data(TABLE, "202506").unwrap());
        std::fs::write(partition.join("data_manual.jsonl"), "{}\n").unwrap();
        assert!(writer.has_data(TABLE, "202506").unwrap());
    }
}
