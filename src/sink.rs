use crate::models::OutputTable;
use crate::normalize::FlatRecord;
use indexmap::IndexSet;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

const WRITE_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv write failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("manifest write failed: {0}")]
    Manifest(#[from] serde_json::Error),
}

/// Destination for deduplicated record batches. Writes are append-only per table.
pub trait IngestionSink {
    /// Returns the number of rows written. An empty batch is a no-op unless
    /// `allow_empty` is set, in which case the table is still created.
    fn write(
        &mut self,
        records: &[FlatRecord],
        table: &OutputTable,
        allow_empty: bool,
    ) -> Result<usize, SinkError>;

    fn finish(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Drops records whose primary-key tuple was already seen in this run.
/// The first occurrence wins.
#[derive(Debug, Default)]
pub struct PrimaryKeyDeduper {
    seen: HashSet<Vec<String>>,
    dropped: u64,
}

impl PrimaryKeyDeduper {
    pub fn retain_new(&mut self, records: Vec<FlatRecord>, primary_key: &[String]) -> Vec<FlatRecord> {
        if primary_key.is_empty() {
            return records;
        }
        let before = records.len();
        let kept: Vec<FlatRecord> = records
            .into_iter()
            .filter(|record| {
                let key: Vec<String> = primary_key.iter().map(|c| record.text(c)).collect();
                self.seen.insert(key)
            })
            .collect();
        self.dropped += (before - kept.len()) as u64;
        kept
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[derive(Serialize)]
struct Manifest<'a> {
    incremental: bool,
    primary_key: &'a [String],
    columns: &'a [String],
}

struct TableWriter {
    writer: csv::Writer<BufWriter<File>>,
    header: Vec<String>,
    dropped_columns: HashSet<String>,
    rows: u64,
}

/// Writes `<dir>/<table>.csv` plus a `<table>.csv.manifest` next to it.
pub struct CsvTableSink {
    dir: PathBuf,
    tables: HashMap<String, TableWriter>,
}

impl CsvTableSink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            tables: HashMap::new(),
        })
    }

    pub fn table_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{table}.csv"))
    }

    pub fn rows_written(&self, table: &str) -> u64 {
        self.tables.get(table).map(|t| t.rows).unwrap_or(0)
    }

    fn open(&self, table: &OutputTable, header: Vec<String>) -> Result<TableWriter, SinkError> {
        let path = self.table_path(&table.name);
        let file = File::create(&path)?;
        let mut writer = csv::Writer::from_writer(BufWriter::with_capacity(WRITE_BUFFER_SIZE, file));
        writer.write_record(&header)?;
        write_manifest(&path, table, &header)?;
        debug!(
            target = "extractor.sink",
            table = %table.name,
            columns = header.len(),
            "table opened"
        );
        Ok(TableWriter {
            writer,
            header,
            dropped_columns: HashSet::new(),
            rows: 0,
        })
    }
}

fn write_manifest(csv_path: &Path, table: &OutputTable, columns: &[String]) -> Result<(), SinkError> {
    let mut manifest_path = csv_path.as_os_str().to_owned();
    manifest_path.push(".manifest");
    let manifest = Manifest {
        incremental: table.incremental,
        primary_key: &table.primary_key,
        columns,
    };
    let file = File::create(PathBuf::from(manifest_path))?;
    serde_json::to_writer_pretty(file, &manifest)?;
    Ok(())
}

/// Union of the batch's columns in first-seen order.
fn batch_columns(records: &[FlatRecord]) -> Vec<String> {
    let mut columns: IndexSet<&str> = IndexSet::new();
    for record in records {
        columns.extend(record.columns());
    }
    columns.into_iter().map(str::to_string).collect()
}

impl IngestionSink for CsvTableSink {
    fn write(
        &mut self,
        records: &[FlatRecord],
        table: &OutputTable,
        allow_empty: bool,
    ) -> Result<usize, SinkError> {
        if records.is_empty() && !allow_empty {
            return Ok(0);
        }
        if !self.tables.contains_key(&table.name) {
            let header = if records.is_empty() {
                table.primary_key.clone()
            } else {
                batch_columns(records)
            };
            let writer = self.open(table, header)?;
            self.tables.insert(table.name.clone(), writer);
        }
        let Some(out) = self.tables.get_mut(&table.name) else {
            return Ok(0);
        };

        for record in records {
            for column in record.columns() {
                if !out.header.iter().any(|h| h == column) && out.dropped_columns.insert(column.to_string()) {
                    warn!(
                        target = "extractor.sink",
                        table = %table.name,
                        column,
                        "column not in table header; dropped"
                    );
                }
            }
            out.writer
                .write_record(out.header.iter().map(|column| record.text(column)))?;
        }
        out.rows += records.len() as u64;
        crate::metrics::rows_written(&table.name, records.len());
        Ok(records.len())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        for (name, table) in &mut self.tables {
            table.writer.flush()?;
            info!(target = "extractor.sink", table = %name, rows = table.rows, "table written");
        }
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use indexmap::IndexMap;

    /// Collects writes in memory, keyed by table name.
    #[derive(Default)]
    pub struct MemorySink {
        pub tables: IndexMap<String, Vec<FlatRecord>>,
        pub writes: usize,
    }

    impl IngestionSink for MemorySink {
        fn write(
            &mut self,
            records: &[FlatRecord],
            table: &OutputTable,
            allow_empty: bool,
        ) -> Result<usize, SinkError> {
            if records.is_empty() && !allow_empty {
                return Ok(0);
            }
            self.writes += 1;
            self.tables
                .entry(table.name.clone())
                .or_default()
                .extend(records.iter().cloned());
            Ok(records.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn row(pairs: &[(&str, &str)]) -> FlatRecord {
        pairs.iter().map(|(k, v)| (*k, *v)).collect()
    }

    fn returns_table() -> OutputTable {
        OutputTable::new("returns", &["amazon_rma_id", "order_id"])
    }

    #[test]
    fn dedupe_keeps_first_occurrence() {
        let table = returns_table();
        let mut deduper = PrimaryKeyDeduper::default();
        let first = deduper.retain_new(
            vec![
                row(&[("amazon_rma_id", "R1"), ("order_id", "O1"), ("reason", "first")]),
                row(&[("amazon_rma_id", "R1"), ("order_id", "O1"), ("reason", "second")]),
                row(&[("amazon_rma_id", "R2"), ("order_id", "O1"), ("reason", "other")]),
            ],
            &table.primary_key,
        );
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].text("reason"), "first");

        let again = deduper.retain_new(
            vec![row(&[("amazon_rma_id", "R2"), ("order_id", "O1"), ("reason", "later")])],
            &table.primary_key,
        );
        assert!(again.is_empty());
        assert_eq!(deduper.dropped(), 2);
    }

    #[test]
    fn csv_sink_fixes_header_on_first_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvTableSink::new(dir.path().join("out/tables")).unwrap();
        let table = returns_table();
        sink.write(
            &[row(&[("amazon_rma_id", "R1"), ("order_id", "O1"), ("sku", "A")])],
            &table,
            false,
        )
        .unwrap();
        sink.write(
            &[row(&[("order_id", "O2"), ("amazon_rma_id", "R2"), ("surprise", "x")])],
            &table,
            false,
        )
        .unwrap();
        sink.finish().unwrap();

        let csv = std::fs::read_to_string(sink.table_path("returns")).unwrap();
        assert_eq!(csv, "amazon_rma_id,order_id,sku\nR1,O1,A\nR2,O2,\n");
        assert_eq!(sink.rows_written("returns"), 2);

        let manifest: Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("out/tables/returns.csv.manifest")).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest["incremental"], Value::Bool(true));
        assert_eq!(manifest["primary_key"][0], "amazon_rma_id");
        assert_eq!(manifest["columns"][2], "sku");
    }

    #[test]
    fn empty_batches_only_create_tables_when_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvTableSink::new(dir.path()).unwrap();
        let table = returns_table();
        assert_eq!(sink.write(&[], &table, false).unwrap(), 0);
        assert!(!sink.table_path("returns").exists());

        sink.write(&[], &table, true).unwrap();
        sink.finish().unwrap();
        let csv = std::fs::read_to_string(sink.table_path("returns")).unwrap();
        assert_eq!(csv, "amazon_rma_id,order_id\n");
    }
}
