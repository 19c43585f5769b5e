//! FASB (F2) finance facts and the static finance field dimension.

use std::collections::{BTreeMap, BTreeSet};

use ipeds_core::{Entity, FinanceFieldRow, FinanceRow, Partition, Table};
use tracing::debug;

use crate::recode::RecodeAudit;
use crate::shape::IMPUTATION_PREFIX;
use crate::{date_key_for, to_i32, EntityBatch, EntityTransform, SourceTables, TransformError};

pub const DATASET: &str = "f2";

/// F2 field codes and their labels. Codes are the lowercased survey column names.
/// Only the part totals are modeled; detail lines (F2C scholarship lines, F2D
/// restricted splits, F2E natural classification) are skipped.
pub const FINANCE_FIELDS: &[(&str, &str)] = &[
    ("f2a01", "Long-term investments"),
    ("f2a02", "Total assets"),
    ("f2a03", "Total liabilities"),
    ("f2a03a", "Debt related to property, plant, and equipment"),
    ("f2a04", "Total unrestricted net assets"),
    ("f2a05", "Total restricted net assets"),
    ("f2a05a", "Permanently restricted net assets included in total restricted net assets"),
    ("f2a05b", "Temporarily restricted net assets included in total restricted net assets"),
    ("f2a06", "Total net assets"),
    ("f2a11", "Land and land improvements"),
    ("f2a12", "Buildings"),
    ("f2a13", "Equipment, including art and library collections"),
    ("f2a15", "Construction in progress"),
    ("f2a16", "Other property, plant, and equipment"),
    ("f2a17", "Total property, plant, and equipment"),
    ("f2a18", "Accumulated depreciation"),
    ("f2a19", "Property, plant, and equipment, net of accumulated depreciation"),
    ("f2a20", "Intangible assets, net of accumulated amortization"),
    ("f2b01", "Total revenues and investment return"),
    ("f2b02", "Total expenses"),
    ("f2b03", "Other specific changes in total net assets"),
    ("f2b04", "Total change in net assets"),
    ("f2b05", "Net assets, beginning of year"),
    ("f2b06", "Adjustments to beginning of year net assets"),
    ("f2b07", "Net assets, end of year"),
    ("f2c08", "Discounts and allowances applied to tuition and fees"),
    ("f2d01", "Tuition and fees (net of allowances)"),
    ("f2d02", "Federal appropriations"),
    ("f2d03", "State appropriations"),
    ("f2d04", "Local appropriations"),
    ("f2d05", "Federal grants and contracts"),
    ("f2d06", "State grants and contracts"),
    ("f2d07", "Local grants and contracts"),
    ("f2d08", "Private gifts, grants, and contracts"),
    ("f2d09", "Contributions from affiliated entities"),
    ("f2d10", "Investment return"),
    ("f2d11", "Sales and services of educational activities"),
    ("f2d12", "Sales and services of auxiliary enterprises"),
    ("f2d13", "Hospital revenue"),
    ("f2d14", "Independent operations revenue"),
    ("f2d15", "Other revenue"),
    ("f2d16", "Total revenues and investment return (revenue detail)"),
    ("f2e011", "Instruction - total amount"),
    ("f2e021", "Research - total amount"),
    ("f2e031", "Public service - total amount"),
    ("f2e041", "Academic support - total amount"),
    ("f2e051", "Student services - total amount"),
    ("f2e061", "Institutional support - total amount"),
    ("f2e071", "Auxiliary enterprises - total amount"),
    ("f2e081", "Net grant aid to students - total amount"),
    ("f2e091", "Hospital services - total amount"),
    ("f2e101", "Independent operations - total amount"),
    ("f2e121", "Other expenses - total amount"),
    ("f2e131", "Total expenses - total amount"),
    ("f2h01", "Value of endowment assets at the beginning of the fiscal year"),
    ("f2h02", "Value of endowment assets at the end of the fiscal year"),
];

pub fn finance_fields() -> Vec<FinanceFieldRow> {
    FINANCE_FIELDS
        .iter()
        .map(|(key, label)| FinanceFieldRow {
            finance_field_key: key.to_string(),
            finance_field: label.to_string(),
        })
        .collect()
}

/// The whole dimension as one static-partition batch.
pub fn finance_field_batch() -> EntityBatch<FinanceFieldRow> {
    EntityBatch {
        entity: Entity::FinanceFields,
        partition: Partition::Static,
        rows: finance_fields(),
        audit: RecodeAudit::default(),
        ignored_columns: BTreeSet::new(),
    }
}

fn is_finance_field(column: &str) -> bool {
    FINANCE_FIELDS.iter().any(|(key, _)| *key == column)
}

pub fn finance(f2: &Table, year: i32) -> Result<EntityBatch<FinanceRow>, TransformError> {
    let date_key = date_key_for(year)?;
    let unitids = f2
        .column("unitid")
        .ok_or_else(|| TransformError::MissingColumn {
            dataset: DATASET.to_string(),
            column: "unitid".to_string(),
        })?;

    let mut fields = Vec::new();
    let mut ignored_columns = BTreeSet::new();
    for column in f2.columns() {
        let name = column.name.as_str();
        if name == "unitid" || name.starts_with(IMPUTATION_PREFIX) {
            continue;
        }
        if is_finance_field(name) {
            fields.push(column);
        } else {
            ignored_columns.insert(name.to_string());
        }
    }

    // Keyed on (unitid, field) so a unitid repeated in the file sums instead of colliding.
    let mut amounts: BTreeMap<(i64, &str), f64> = BTreeMap::new();
    for r in 0..f2.row_count() {
        let Some(unitid) = unitids.i64_at(r) else {
            continue;
        };
        for column in &fields {
            if let Some(amount) = column.f64_at(r) {
                *amounts.entry((unitid, column.name.as_str())).or_default() += amount;
            }
        }
    }

    let rows = amounts
        .into_iter()
        .map(|((unitid, key), amount)| {
            Ok(FinanceRow {
                unitid: to_i32("unitid", unitid)?,
                date_key,
                finance_field_key: key.to_string(),
                amount,
            })
        })
        .collect::<Result<Vec<_>, TransformError>>()?;

    debug!(
        year,
        rows = rows.len(),
        fields = fields.len(),
        ignored = ignored_columns.len(),
        "finance transformed"
    );
    Ok(EntityBatch {
        entity: Entity::Finance,
        partition: Partition::AsOf(date_key),
        rows,
        audit: RecodeAudit::default(),
        ignored_columns,
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FinanceTransform;

impl EntityTransform for FinanceTransform {
    type Row = FinanceRow;

    fn entity(&self) -> Entity {
        Entity::Finance
    }

    fn transform(
        &self,
        sources: &SourceTables,
        year: i32,
    ) -> Result<EntityBatch<FinanceRow>, TransformError> {
        finance(sources.get(DATASET)?, year)
    }
}

/// The dimension has no source files and no year; every run reloads the same list.
#[derive(Debug, Clone, Copy, Default)]
pub struct FinanceFieldsTransform;

impl EntityTransform for FinanceFieldsTransform {
    type Row = FinanceFieldRow;

    fn entity(&self) -> Entity {
        Entity::FinanceFields
    }

    fn transform(
        &self,
        _sources: &SourceTables,
        _year: i32,
    ) -> Result<EntityBatch<FinanceFieldRow>, TransformError> {
        Ok(finance_field_batch())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ipeds_core::Column;
    use std::collections::HashSet;

    fn f2() -> Table {
        Table::from_columns(vec![
            Column::text("unitid", vec![Some("100001"), Some("100002")]),
            Column::text("f2a01", vec![Some("1500.5"), Some(".")]),
            Column::text("f2d16", vec![Some("-20"), Some("300")]),
            Column::text("xf2a01", vec![Some("R"), Some("A")]),
            Column::text("f2z99", vec![Some("1"), Some("2")]),
        ])
        .unwrap()
    }

    #[test]
    fn field_codes_are_unique() {
        let keys: HashSet<_> = FINANCE_FIELDS.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys.len(), FINANCE_FIELDS.len());
        assert!(keys.iter().all(|k| k.starts_with("f2") && *k == k.to_lowercase()));
    }

    #[test]
    fn known_columns_are_unpivoted() {
        let batch = finance(&f2(), 2015).unwrap();
        let date = NaiveDate::from_ymd_opt(2015, 10, 15).unwrap();
        assert_eq!(batch.partition, Partition::AsOf(date));

        let facts: Vec<_> = batch
            .rows
            .iter()
            .map(|r| (r.unitid, r.finance_field_key.as_str(), r.amount))
            .collect();
        assert_eq!(
            facts,
            vec![
                (100001, "f2a01", 1500.5),
                (100001, "f2d16", -20.0),
                (100002, "f2d16", 300.0),
            ]
        );
        assert!(batch.rows.iter().all(|r| r.date_key == date));
    }

    #[test]
    fn columns_outside_the_dimension_are_set_aside_not_audited() {
        let batch = finance(&f2(), 2015).unwrap();
        assert_eq!(
            batch.ignored_columns.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["f2z99"]
        );
        assert!(batch.audit.is_empty());
        assert!(batch.rows.iter().all(|r| is_finance_field(&r.finance_field_key)));
    }

    #[test]
    fn dimension_is_static() {
        let batch = FinanceFieldsTransform
            .transform(&SourceTables::new(), 2015)
            .unwrap();
        assert_eq!(batch.partition, Partition::Static);
        assert_eq!(batch.rows.len(), FINANCE_FIELDS.len());
        assert_eq!(batch.rows[0].finance_field_key, "f2a01");
        assert_eq!(batch.rows[0].finance_field, "Long-term investments");
    }
}
