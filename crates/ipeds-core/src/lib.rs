//! Core tabular value, warehouse row model, and partition keys for the IPEDS ETL.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "ipeds-core";

/// Month and day of the fall census date every survey year is keyed on.
pub const AS_OF_MONTH: u32 = 10;
pub const AS_OF_DAY: u32 = 15;

/// Partition key for a survey year (October 15 of that year).
pub fn as_of_date(year: i32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, AS_OF_MONTH, AS_OF_DAY)
}

/// Slice of a warehouse table that one load replaces wholesale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "date_key")]
pub enum Partition {
    /// Every row with this `date_key`.
    AsOf(NaiveDate),
    /// The whole table (static dimensions).
    Static,
}

impl Partition {
    pub fn for_year(year: i32) -> Option<Self> {
        as_of_date(year).map(Self::AsOf)
    }

    pub fn date_key(&self) -> Option<NaiveDate> {
        match self {
            Self::AsOf(date) => Some(*date),
            Self::Static => None,
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AsOf(date) => write!(f, "date_key={date}"),
            Self::Static => f.write_str("static"),
        }
    }
}

/// Storage type hint applied while parsing a source column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Int,
    Float,
    #[default]
    Text,
}

/// Per-column type hints keyed by lower-cased column name. Unlisted columns are text.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnTypes(BTreeMap<String, ColumnType>);

impl ColumnTypes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, column_type: ColumnType) -> Self {
        self.0.insert(name.trim().to_ascii_lowercase(), column_type);
        self
    }

    pub fn get(&self, name: &str) -> ColumnType {
        self.0.get(name).copied().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: AsRef<str>> FromIterator<(S, ColumnType)> for ColumnTypes {
    fn from_iter<I: IntoIterator<Item = (S, ColumnType)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(name, ty)| (name.as_ref().trim().to_ascii_lowercase(), ty))
                .collect(),
        )
    }
}

/// Loose numeric coercion for survey text cells: `.` and blanks are missing,
/// formatting characters (`,`, `$`, spaces) are stripped before parsing.
pub fn coerce_number(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "." {
        return None;
    }
    let cleaned = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect::<String>();
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn integral(value: f64) -> Option<i64> {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Some(value as i64)
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Int(Vec<Option<i64>>),
    Float(Vec<Option<f64>>),
    Text(Vec<Option<String>>),
}

impl ColumnData {
    pub fn nulls(column_type: ColumnType, len: usize) -> Self {
        match column_type {
            ColumnType::Int => Self::Int(vec![None; len]),
            ColumnType::Float => Self::Float(vec![None; len]),
            ColumnType::Text => Self::Text(vec![None; len]),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Int(v) => v.len(),
            Self::Float(v) => v.len(),
            Self::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            Self::Int(_) => ColumnType::Int,
            Self::Float(_) => ColumnType::Float,
            Self::Text(_) => ColumnType::Text,
        }
    }

    fn take(&self, rows: &[usize]) -> Self {
        match self {
            Self::Int(v) => Self::Int(rows.iter().map(|&r| v[r]).collect()),
            Self::Float(v) => Self::Float(rows.iter().map(|&r| v[r]).collect()),
            Self::Text(v) => Self::Text(rows.iter().map(|&r| v[r].clone()).collect()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub data: ColumnData,
}

impl Column {
    pub fn new(name: impl Into<String>, data: ColumnData) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    pub fn int(name: impl Into<String>, values: Vec<Option<i64>>) -> Self {
        Self::new(name, ColumnData::Int(values))
    }

    pub fn float(name: impl Into<String>, values: Vec<Option<f64>>) -> Self {
        Self::new(name, ColumnData::Float(values))
    }

    pub fn text<S: Into<String>>(name: impl Into<String>, values: Vec<Option<S>>) -> Self {
        Self::new(
            name,
            ColumnData::Text(values.into_iter().map(|v| v.map(Into::into)).collect()),
        )
    }

    pub fn nulls(name: impl Into<String>, column_type: ColumnType, len: usize) -> Self {
        Self::new(name, ColumnData::nulls(column_type, len))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn column_type(&self) -> ColumnType {
        self.data.column_type()
    }

    pub fn is_null(&self, row: usize) -> bool {
        match &self.data {
            ColumnData::Int(v) => v[row].is_none(),
            ColumnData::Float(v) => v[row].is_none(),
            ColumnData::Text(v) => v[row].as_deref().map_or(true, |s| s.trim().is_empty()),
        }
    }

    /// Integer view of a cell. Non-integral floats and unparseable text read as missing.
    pub fn i64_at(&self, row: usize) -> Option<i64> {
        match &self.data {
            ColumnData::Int(v) => v[row],
            ColumnData::Float(v) => v[row].and_then(integral),
            ColumnData::Text(v) => v[row].as_deref().and_then(coerce_number).and_then(integral),
        }
    }

    pub fn f64_at(&self, row: usize) -> Option<f64> {
        match &self.data {
            ColumnData::Int(v) => v[row].map(|x| x as f64),
            ColumnData::Float(v) => v[row],
            ColumnData::Text(v) => v[row].as_deref().and_then(coerce_number),
        }
    }

    /// Text view of a cell; blank strings read as missing.
    pub fn text_at(&self, row: usize) -> Option<String> {
        match &self.data {
            ColumnData::Int(v) => v[row].map(|x| x.to_string()),
            ColumnData::Float(v) => v[row].map(|x| x.to_string()),
            ColumnData::Text(v) => v[row]
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("column {name} has {actual} rows, table has {expected}")]
    LengthMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("duplicate column {0}")]
    DuplicateColumn(String),
}

/// In-memory columnar table: named, typed, nullable columns of equal length.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    columns: Vec<Column>,
    row_count: usize,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_columns(columns: Vec<Column>) -> Result<Self, TableError> {
        let mut table = Self::new();
        for column in columns {
            table.push_column(column)?;
        }
        Ok(table)
    }

    /// Build a table with a fixed row count; useful for zero-column tables.
    pub fn with_row_count(row_count: usize) -> Self {
        Self {
            columns: Vec::new(),
            row_count,
        }
    }

    pub fn push_column(&mut self, column: Column) -> Result<(), TableError> {
        if self.has_column(&column.name) {
            return Err(TableError::DuplicateColumn(column.name));
        }
        let actual = column.len();
        if self.columns.is_empty() && self.row_count == 0 {
            self.row_count = actual;
        } else if actual != self.row_count {
            return Err(TableError::LengthMismatch {
                name: column.name,
                expected: self.row_count,
                actual,
            });
        }
        self.columns.push(column);
        Ok(())
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn into_columns(self) -> Vec<Column> {
        self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn retain_columns(&mut self, mut keep: impl FnMut(&Column) -> bool) {
        self.columns.retain(|c| keep(c));
    }

    /// Gather the given row indices (in order, repeats allowed) into a new table.
    pub fn take_rows(&self, rows: &[usize]) -> Table {
        Table {
            columns: self
                .columns
                .iter()
                .map(|c| Column::new(c.name.clone(), c.data.take(rows)))
                .collect(),
            row_count: rows.len(),
        }
    }

    /// Append the columns of `other` (same row count) skipping names already present.
    pub fn extend_distinct(&mut self, other: Table) -> Result<(), TableError> {
        let existing: HashSet<String> = self.columns.iter().map(|c| c.name.clone()).collect();
        for column in other.columns {
            if !existing.contains(&column.name) {
                self.push_column(column)?;
            }
        }
        Ok(())
    }
}

/// Warehouse entities this pipeline owns and loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Entity {
    Institutions,
    FallEnrollment,
    Finance,
    FinanceFields,
}

impl Entity {
    /// Load order: the dimension precedes the facts that reference it.
    pub const ALL: [Entity; 4] = [
        Entity::FinanceFields,
        Entity::Institutions,
        Entity::FallEnrollment,
        Entity::Finance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Institutions => "institutions",
            Self::FallEnrollment => "fall-enrollment",
            Self::Finance => "finance",
            Self::FinanceFields => "finance-fields",
        }
    }

    pub fn table_name(&self) -> &'static str {
        match self {
            Self::Institutions => "ipeds_institutions",
            Self::FallEnrollment => "ipeds_fall_enrollment",
            Self::Finance => "ipeds_finance",
            Self::FinanceFields => "ipeds_finance_field_dimension",
        }
    }

    /// Source datasets (registry names) the entity is built from, in join order.
    pub fn datasets(&self) -> &'static [&'static str] {
        match self {
            Self::Institutions => &["hd", "ic"],
            Self::FallEnrollment => &["ef"],
            Self::Finance => &["f2"],
            Self::FinanceFields => &[],
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown entity {0:?} (expected one of institutions, fall-enrollment, finance, finance-fields)")]
pub struct ParseEntityError(String);

impl FromStr for Entity {
    type Err = ParseEntityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        Entity::ALL
            .into_iter()
            .find(|e| e.as_str() == normalized)
            .ok_or_else(|| ParseEntityError(s.to_string()))
    }
}

/// One row of `ipeds_institutions`, unique on (`unitid`, `date_key`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstitutionRow {
    pub unitid: i32,
    pub date_key: NaiveDate,
    pub institution_name: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub zip_code: Option<String>,
    pub web_address: Option<String>,
    pub state_fips: i32,
    pub county_fips: f64,
    pub service_academy: bool,
    pub institution_level: String,
    pub control: String,
    pub highest_level_offering: String,
    pub highest_degree_offering: String,
    pub undergraduate_offering: bool,
    pub graduate_offering: bool,
    pub degree_granting: bool,
    pub locale: String,
    pub parent_id: i32,
    pub year_closed: Option<i32>,
    pub active: bool,
    pub cbsa_id: i32,
    pub cbsa_type: String,
    pub csa_id: i32,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub system_member: bool,
    pub system_name: String,
    pub open_to_public: bool,
    pub landgrant: bool,
    pub hbcu: bool,
    pub hospital: bool,
    pub medical: bool,
    pub tribal: bool,
    pub rotc: bool,
    pub confno1: i32,
    pub confno2: i32,
    pub confno3: i32,
    pub confno4: i32,
}

impl InstitutionRow {
    pub const COLUMNS: &'static [&'static str] = &[
        "unitid",
        "date_key",
        "institution_name",
        "address",
        "city",
        "zip_code",
        "web_address",
        "state_fips",
        "county_fips",
        "service_academy",
        "institution_level",
        "control",
        "highest_level_offering",
        "highest_degree_offering",
        "undergraduate_offering",
        "graduate_offering",
        "degree_granting",
        "locale",
        "parent_id",
        "year_closed",
        "active",
        "cbsa_id",
        "cbsa_type",
        "csa_id",
        "longitude",
        "latitude",
        "system_member",
        "system_name",
        "open_to_public",
        "landgrant",
        "hbcu",
        "hospital",
        "medical",
        "tribal",
        "rotc",
        "confno1",
        "confno2",
        "confno3",
        "confno4",
    ];
}

/// One row of `ipeds_fall_enrollment`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallEnrollmentRow {
    pub unitid: i32,
    pub date_key: NaiveDate,
    pub time_status: String,
    pub career_level: String,
    pub degree_seeking: String,
    pub continuation_type: String,
    pub demographic_key: String,
    pub headcount: i32,
}

impl FallEnrollmentRow {
    pub const COLUMNS: &'static [&'static str] = &[
        "unitid",
        "date_key",
        "time_status",
        "career_level",
        "degree_seeking",
        "continuation_type",
        "demographic_key",
        "headcount",
    ];
}

/// One row of `ipeds_finance`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinanceRow {
    pub unitid: i32,
    pub date_key: NaiveDate,
    pub finance_field_key: String,
    pub amount: f64,
}

impl FinanceRow {
    pub const COLUMNS: &'static [&'static str] =
        &["unitid", "date_key", "finance_field_key", "amount"];
}

/// One row of `ipeds_finance_field_dimension`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinanceFieldRow {
    pub finance_field_key: String,
    pub finance_field: String,
}

impl FinanceFieldRow {
    pub const COLUMNS: &'static [&'static str] = &["finance_field_key", "finance_field"];
}
