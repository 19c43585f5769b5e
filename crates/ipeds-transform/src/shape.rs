//! Column projection, schema completion, and joins over raw survey tables.

use std::collections::HashMap;

use ipeds_core::{Column, ColumnType, Table};

use crate::TransformError;

/// Imputation-flag columns (`xlocale`, `xf2a01`, ...) start with this prefix.
pub const IMPUTATION_PREFIX: char = 'x';

/// One source column carried into an entity's projected frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnMapping {
    pub source: &'static str,
    pub target: &'static str,
    /// Type of the all-null column inserted when a year lacks the source column.
    pub column_type: ColumnType,
    pub required: bool,
}

impl ColumnMapping {
    pub const fn required(source: &'static str, target: &'static str) -> Self {
        Self {
            source,
            target,
            column_type: ColumnType::Int,
            required: true,
        }
    }

    pub const fn code(source: &'static str, target: &'static str) -> Self {
        Self {
            source,
            target,
            column_type: ColumnType::Int,
            required: false,
        }
    }

    pub const fn float(source: &'static str, target: &'static str) -> Self {
        Self {
            source,
            target,
            column_type: ColumnType::Float,
            required: false,
        }
    }

    pub const fn text(source: &'static str, target: &'static str) -> Self {
        Self {
            source,
            target,
            column_type: ColumnType::Text,
            required: false,
        }
    }
}

pub fn drop_imputation_flags(table: &mut Table) {
    table.retain_columns(|c| !c.name.starts_with(IMPUTATION_PREFIX));
}

/// Keep exactly the mapped columns, renamed and in mapping order. Optional
/// columns missing from this year's source are added as nulls; a missing
/// required column is an error.
pub fn project(
    dataset: &str,
    table: &Table,
    mapping: &[ColumnMapping],
) -> Result<Table, TransformError> {
    let mut projected = Table::with_row_count(table.row_count());
    for m in mapping {
        let column = match table.column(m.source) {
            Some(source) => Column::new(m.target, source.data.clone()),
            _ if m.required => {
                return Err(TransformError::MissingColumn {
                    dataset: dataset.to_string(),
                    column: m.source.to_string(),
                })
            }
            _ => Column::nulls(m.target, m.column_type, table.row_count()),
        };
        projected.push_column(column)?;
    }
    Ok(projected)
}

/// Inner join on an integer key. Rows with a missing key never match. Output
/// keeps left row order; right columns whose names already exist on the left
/// are dropped.
pub fn inner_join(
    left: (&str, &Table),
    right: (&str, &Table),
    key: &str,
) -> Result<Table, TransformError> {
    let missing = |dataset: &str| TransformError::MissingColumn {
        dataset: dataset.to_string(),
        column: key.to_string(),
    };
    let left_key = left.1.column(key).ok_or_else(|| missing(left.0))?;
    let right_key = right.1.column(key).ok_or_else(|| missing(right.0))?;

    let mut index: HashMap<i64, Vec<usize>> = HashMap::new();
    for row in 0..right.1.row_count() {
        if let Some(k) = right_key.i64_at(row) {
            index.entry(k).or_default().push(row);
        }
    }

    let mut left_rows = Vec::new();
    let mut right_rows = Vec::new();
    for row in 0..left.1.row_count() {
        let Some(k) = left_key.i64_at(row) else {
            continue;
        };
        if let Some(matches) = index.get(&k) {
            for &r in matches {
                left_rows.push(row);
                right_rows.push(r);
            }
        }
    }

    if left_rows.is_empty() {
        return Err(TransformError::EmptyJoin {
            left: left.0.to_string(),
            right: right.0.to_string(),
            key: key.to_string(),
        });
    }

    let mut joined = left.1.take_rows(&left_rows);
    joined.extend_distinct(right.1.take_rows(&right_rows))?;
    Ok(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hd() -> Table {
        Table::from_columns(vec![
            Column::int("unitid", vec![Some(1), Some(2), Some(3), None]),
            Column::text("instnm", vec![Some("A"), Some("B"), Some("C"), Some("D")]),
            Column::int("xinstnm", vec![None, None, None, None]),
        ])
        .unwrap()
    }

    fn ic() -> Table {
        Table::from_columns(vec![
            Column::int("unitid", vec![Some(3), Some(1), Some(9)]),
            Column::int("control", vec![Some(2), Some(1), Some(3)]),
            Column::text("instnm", vec![Some("ic-name"), None, None]),
        ])
        .unwrap()
    }

    #[test]
    fn imputation_flags_are_dropped() {
        let mut table = hd();
        drop_imputation_flags(&mut table);
        assert_eq!(table.column_names(), vec!["unitid", "instnm"]);
    }

    #[test]
    fn projection_renames_orders_and_completes() {
        let mapping = [
            ColumnMapping::text("instnm", "institution_name"),
            ColumnMapping::required("unitid", "unitid"),
            ColumnMapping::code("locale", "locale"),
        ];
        let projected = project("hd", &hd(), &mapping).unwrap();
        assert_eq!(
            projected.column_names(),
            vec!["institution_name", "unitid", "locale"]
        );
        assert_eq!(projected.row_count(), 4);
        let locale = projected.column("locale").unwrap();
        assert_eq!(locale.column_type(), ColumnType::Int);
        assert!((0..4).all(|r| locale.is_null(r)));
    }

    #[test]
    fn missing_required_column_is_an_error() {
        let mapping = [ColumnMapping::required("efalevel", "efalevel")];
        let err = project("ef", &hd(), &mapping).unwrap_err();
        assert!(matches!(
            err,
            TransformError::MissingColumn { ref dataset, ref column } if dataset == "ef" && column == "efalevel"
        ));
    }

    #[test]
    fn inner_join_keeps_left_order_and_left_duplicates() {
        let joined = inner_join(("hd", &hd()), ("ic", &ic()), "unitid").unwrap();
        assert_eq!(joined.row_count(), 2);
        assert_eq!(joined.column_names(), vec!["unitid", "instnm", "xinstnm", "control"]);
        let unitid = joined.column("unitid").unwrap();
        assert_eq!(unitid.i64_at(0), Some(1));
        assert_eq!(unitid.i64_at(1), Some(3));
        assert_eq!(joined.column("control").unwrap().i64_at(1), Some(2));
        assert_eq!(joined.column("instnm").unwrap().text_at(1).as_deref(), Some("C"));
    }

    #[test]
    fn join_without_matches_is_an_error() {
        let other = Table::from_columns(vec![Column::int("unitid", vec![Some(42)])]).unwrap();
        let err = inner_join(("hd", &hd()), ("ic", &other), "unitid").unwrap_err();
        assert!(matches!(err, TransformError::EmptyJoin { .. }));

        let keyless = Table::from_columns(vec![Column::int("id", vec![Some(1)])]).unwrap();
        let err = inner_join(("hd", &hd()), ("ic", &keyless), "unitid").unwrap_err();
        assert!(matches!(err, TransformError::MissingColumn { .. }));
    }
}
