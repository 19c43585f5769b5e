//! Entity transforms: raw IPEDS survey tables in, typed warehouse rows out.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::NaiveDate;
use ipeds_core::{as_of_date, Column, Entity, Partition, Table, TableError};
use thiserror::Error;

pub mod enrollment;
pub mod finance;
pub mod institutions;
pub mod recode;
pub mod shape;

pub use enrollment::FallEnrollmentTransform;
pub use finance::{FinanceFieldsTransform, FinanceTransform};
pub use institutions::InstitutionsTransform;
pub use recode::RecodeAudit;

pub const CRATE_NAME: &str = "ipeds-transform";

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("source table {0} was not provided")]
    MissingSource(String),
    #[error("{dataset} is missing required column {column}")]
    MissingColumn { dataset: String, column: String },
    #[error("joining {left} and {right} on {key} produced no rows")]
    EmptyJoin {
        left: String,
        right: String,
        key: String,
    },
    #[error("{column} value {value} does not fit the warehouse column")]
    OutOfRange { column: &'static str, value: i64 },
    #[error("no as-of date for survey year {0}")]
    InvalidYear(i32),
    #[error(transparent)]
    Table(#[from] TableError),
}

/// Raw tables for one survey year, keyed by registry dataset name.
#[derive(Debug, Clone, Default)]
pub struct SourceTables {
    tables: BTreeMap<String, Table>,
}

impl SourceTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, dataset: impl Into<String>, table: Table) -> Self {
        self.insert(dataset, table);
        self
    }

    pub fn insert(&mut self, dataset: impl Into<String>, table: Table) {
        self.tables.insert(dataset.into(), table);
    }

    pub fn get(&self, dataset: &str) -> Result<&Table, TransformError> {
        self.tables
            .get(dataset)
            .ok_or_else(|| TransformError::MissingSource(dataset.to_string()))
    }
}

/// Output of one entity transform for one partition.
#[derive(Debug, Clone)]
pub struct EntityBatch<R> {
    pub entity: Entity,
    pub partition: Partition,
    pub rows: Vec<R>,
    pub audit: RecodeAudit,
    /// Source columns outside the warehouse model, left unloaded.
    pub ignored_columns: BTreeSet<String>,
}

pub trait EntityTransform: Send + Sync {
    type Row: Send + Sync + 'static;

    fn entity(&self) -> Entity;

    fn transform(
        &self,
        sources: &SourceTables,
        year: i32,
    ) -> Result<EntityBatch<Self::Row>, TransformError>;
}

pub(crate) fn date_key_for(year: i32) -> Result<NaiveDate, TransformError> {
    as_of_date(year).ok_or(TransformError::InvalidYear(year))
}

pub(crate) fn to_i32(column: &'static str, value: i64) -> Result<i32, TransformError> {
    i32::try_from(value).map_err(|_| TransformError::OutOfRange { column, value })
}

/// Name-indexed view over a projected table.
pub(crate) struct Frame<'a> {
    dataset: &'a str,
    columns: HashMap<&'a str, &'a Column>,
    rows: usize,
}

impl<'a> Frame<'a> {
    pub(crate) fn new(dataset: &'a str, table: &'a Table) -> Self {
        Self {
            dataset,
            columns: table.columns().iter().map(|c| (c.name.as_str(), c)).collect(),
            rows: table.row_count(),
        }
    }

    pub(crate) fn rows(&self) -> usize {
        self.rows
    }

    pub(crate) fn column(&self, name: &str) -> Result<&'a Column, TransformError> {
        self.columns
            .get(name)
            .copied()
            .ok_or_else(|| TransformError::MissingColumn {
                dataset: self.dataset.to_string(),
                column: name.to_string(),
            })
    }

    pub(crate) fn int(&self, name: &str, row: usize) -> Result<Option<i64>, TransformError> {
        Ok(self.column(name)?.i64_at(row))
    }

    pub(crate) fn float(&self, name: &str, row: usize) -> Result<Option<f64>, TransformError> {
        Ok(self.column(name)?.f64_at(row))
    }

    pub(crate) fn text(&self, name: &str, row: usize) -> Result<Option<String>, TransformError> {
        Ok(self.column(name)?.text_at(row))
    }
}
