//! Parquet snapshots of query tables plus a checksummed manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, BooleanArray, Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use pdc_core::{ColumnType, Table};
use pdc_storage::sha256_hex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::QueryOutcome;

const TABLE_FILE: &str = "query.parquet";
const REPORT_FILE: &str = "report.json";
const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub run_id: String,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub dir: PathBuf,
    pub table_path: PathBuf,
    pub report_path: PathBuf,
    pub manifest_path: PathBuf,
    pub manifest: ParquetManifest,
}

/// Write `table` as a single record batch. Text columns become nullable
/// Utf8, numbers Float64 and flags Boolean; missing cells are nulls.
pub fn export_table_parquet(table: &Table, path: &Path) -> Result<()> {
    let batch = record_batch(table)?;
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn record_batch(table: &Table) -> Result<RecordBatch> {
    let fields = table
        .columns()
        .iter()
        .map(|c| {
            let data_type = match c.kind {
                ColumnType::Text => DataType::Utf8,
                ColumnType::Number => DataType::Float64,
                ColumnType::Flag => DataType::Boolean,
            };
            ArrowField::new(c.name.as_str(), data_type, true)
        })
        .collect::<Vec<_>>();
    let schema = Arc::new(Schema::new(fields));

    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(table.columns().len());
    for column in table.columns() {
        let values = table.column_values(&column.name)?;
        let array: ArrayRef = match column.kind {
            ColumnType::Text => Arc::new(StringArray::from(
                values.iter().map(|v| v.as_text()).collect::<Vec<_>>(),
            )),
            ColumnType::Number => Arc::new(Float64Array::from(
                values.iter().map(|v| v.as_number()).collect::<Vec<_>>(),
            )),
            ColumnType::Flag => Arc::new(BooleanArray::from(
                values.iter().map(|v| v.as_flag()).collect::<Vec<_>>(),
            )),
        };
        arrays.push(array);
    }
    RecordBatch::try_new(schema, arrays).context("building query record batch")
}

/// `<output_dir>/<run_id>/` with the table, the query report and a manifest
/// of both.
pub fn write_query_outputs(output_dir: &Path, outcome: &QueryOutcome) -> Result<ExportSummary> {
    let run_id = outcome.report.run_id.to_string();
    let dir = output_dir.join(&run_id);
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

    let table_path = dir.join(TABLE_FILE);
    export_table_parquet(&outcome.table, &table_path)?;

    let report_path = dir.join(REPORT_FILE);
    let report = serde_json::to_vec_pretty(&outcome.report).context("encoding query report")?;
    std::fs::write(&report_path, report)
        .with_context(|| format!("writing {}", report_path.display()))?;

    let manifest = ParquetManifest {
        schema_version: 1,
        run_id,
        files: vec![
            manifest_entry("query", &dir, &table_path)?,
            manifest_entry("report", &dir, &report_path)?,
        ],
    };
    let manifest_path = dir.join(MANIFEST_FILE);
    let encoded = serde_json::to_vec_pretty(&manifest).context("encoding manifest")?;
    std::fs::write(&manifest_path, encoded)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    info!(dir = %dir.display(), rows = outcome.table.len(), "query outputs written");

    Ok(ExportSummary {
        dir,
        table_path,
        report_path,
        manifest_path,
        manifest,
    })
}

fn manifest_entry(name: &str, base: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(base)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}
