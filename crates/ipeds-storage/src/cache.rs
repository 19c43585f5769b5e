//! Parquet snapshots of fetched survey tables, one file per (dataset, year).

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::{
    Array, ArrayRef, Float64Array, Int64Array, RecordBatch, RecordBatchOptions, StringArray,
};
use arrow_schema::{ArrowError, DataType, Field, Schema};
use ipeds_core::{Column, ColumnData, Table, TableError};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::errors::ParquetError;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parquet: {0}")]
    Parquet(#[from] ParquetError),
    #[error("arrow: {0}")]
    Arrow(#[from] ArrowError),
    #[error("column {column} has unsupported type {data_type}")]
    UnsupportedType { column: String, data_type: String },
    #[error("column {0} could not be read back as its declared type")]
    Corrupt(String),
    #[error("refusing to snapshot a table with no columns")]
    NoColumns,
    #[error(transparent)]
    Table(#[from] TableError),
}

fn io_err<'a>(
    action: &'static str,
    path: &'a Path,
) -> impl FnOnce(std::io::Error) -> CacheError + 'a {
    move |source| CacheError::Io {
        action,
        path: path.to_path_buf(),
        source,
    }
}

/// Deterministically named snapshot files under a data directory.
#[derive(Debug, Clone)]
pub struct SnapshotCache {
    root: PathBuf,
}

impl SnapshotCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, dataset: &str, year: i32) -> PathBuf {
        self.root.join(format!("ipeds_{dataset}_{year}.parquet"))
    }

    pub fn contains(&self, dataset: &str, year: i32) -> bool {
        self.path_for(dataset, year).is_file()
    }

    pub fn store(&self, dataset: &str, year: i32, table: &Table) -> Result<PathBuf, CacheError> {
        let path = self.path_for(dataset, year);
        save(table, &path)?;
        Ok(path)
    }

    pub fn read(&self, dataset: &str, year: i32) -> Result<Table, CacheError> {
        load(&self.path_for(dataset, year))
    }
}

fn to_record_batch(table: &Table) -> Result<RecordBatch, CacheError> {
    if table.width() == 0 {
        return Err(CacheError::NoColumns);
    }

    let mut fields = Vec::with_capacity(table.width());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(table.width());
    for column in table.columns() {
        let (data_type, array): (DataType, ArrayRef) = match &column.data {
            ColumnData::Int(v) => (DataType::Int64, Arc::new(Int64Array::from(v.clone()))),
            ColumnData::Float(v) => (DataType::Float64, Arc::new(Float64Array::from(v.clone()))),
            ColumnData::Text(v) => (
                DataType::Utf8,
                Arc::new(StringArray::from(
                    v.iter().map(|s| s.as_deref()).collect::<Vec<_>>(),
                )),
            ),
        };
        fields.push(Field::new(column.name.as_str(), data_type, true));
        arrays.push(array);
    }

    let options = RecordBatchOptions::new().with_row_count(Some(table.row_count()));
    Ok(RecordBatch::try_new_with_options(
        Arc::new(Schema::new(fields)),
        arrays,
        &options,
    )?)
}

/// Serialize `table` to `path` through a temp file and atomic rename.
pub fn save(table: &Table, path: &Path) -> Result<(), CacheError> {
    let batch = to_record_batch(table)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(io_err("creating", parent))?;

    let temp_path = parent.join(format!(".{}.parquet.tmp", Uuid::new_v4()));
    let written = (|| -> Result<(), CacheError> {
        let file = File::create(&temp_path).map_err(io_err("creating", &temp_path))?;
        let mut writer = ArrowWriter::try_new(file, batch.schema(), None)?;
        writer.write(&batch)?;
        writer.close()?;
        fs::rename(&temp_path, path).map_err(io_err("renaming into", path))
    })();

    if written.is_err() {
        let _ = fs::remove_file(&temp_path);
    } else {
        debug!(path = %path.display(), rows = table.row_count(), "snapshot saved");
    }
    written
}

fn downcast<'a, T: 'static>(array: &'a ArrayRef, column: &str) -> Result<&'a T, CacheError> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| CacheError::Corrupt(column.to_string()))
}

/// Deserialize a snapshot written by [`save`].
pub fn load(path: &Path) -> Result<Table, CacheError> {
    let file = File::open(path).map_err(io_err("opening", path))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let schema = builder.schema().clone();

    let mut columns = schema
        .fields()
        .iter()
        .map(|field| {
            let data = match field.data_type() {
                DataType::Int64 => ColumnData::Int(Vec::new()),
                DataType::Float64 => ColumnData::Float(Vec::new()),
                DataType::Utf8 => ColumnData::Text(Vec::new()),
                other => {
                    return Err(CacheError::UnsupportedType {
                        column: field.name().clone(),
                        data_type: other.to_string(),
                    })
                }
            };
            Ok(Column::new(field.name().clone(), data))
        })
        .collect::<Result<Vec<_>, _>>()?;

    for batch in builder.build()? {
        let batch = batch?;
        for (column, array) in columns.iter_mut().zip(batch.columns()) {
            match &mut column.data {
                ColumnData::Int(values) => {
                    values.extend(downcast::<Int64Array>(array, &column.name)?.iter())
                }
                ColumnData::Float(values) => {
                    values.extend(downcast::<Float64Array>(array, &column.name)?.iter())
                }
                ColumnData::Text(values) => values.extend(
                    downcast::<StringArray>(array, &column.name)?
                        .iter()
                        .map(|s| s.map(ToString::to_string)),
                ),
            }
        }
    }

    Ok(Table::from_columns(columns)?)
}
