//! Fall enrollment by student level and demographic, from the EF "A" file.

use std::collections::BTreeMap;

use ipeds_core::{Column, Entity, FallEnrollmentRow, Partition, Table};
use tracing::debug;

use crate::recode::RecodeAudit;
use crate::{date_key_for, to_i32, EntityBatch, EntityTransform, SourceTables, TransformError};

pub const DATASET: &str = "ef";
pub const LEVEL_COLUMN: &str = "efalevel";

pub const RACES: [&str; 9] = [
    "nral", "unkn", "hisp", "aian", "asia", "bkaa", "nhpi", "whit", "2mor",
];
pub const SEXES: [&str; 2] = ["m", "w"];

const FULL_TIME: &str = "Full-time";
const PART_TIME: &str = "Part-time";
const UNDERGRADUATE: &str = "Undergraduate";
const GRADUATE: &str = "Graduate";
const DEGREE_SEEKING: &str = "Degree-seeking";
const NON_DEGREE_SEEKING: &str = "Non-degree-seeking";
const NOT_APPLICABLE: &str = "Not applicable";

/// The four descriptive attributes of an `efalevel` leaf line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StudentLevel {
    pub time_status: &'static str,
    pub career_level: &'static str,
    pub degree_seeking: &'static str,
    pub continuation_type: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelLine {
    Leaf(StudentLevel),
    /// Subtotal or grand-total line; its counts are sums of leaf lines.
    Total,
}

const fn undergraduate(
    time_status: &'static str,
    degree_seeking: &'static str,
    continuation_type: &'static str,
) -> LevelLine {
    LevelLine::Leaf(StudentLevel {
        time_status,
        career_level: UNDERGRADUATE,
        degree_seeking,
        continuation_type,
    })
}

const fn graduate(time_status: &'static str) -> LevelLine {
    LevelLine::Leaf(StudentLevel {
        time_status,
        career_level: GRADUATE,
        degree_seeking: NOT_APPLICABLE,
        continuation_type: NOT_APPLICABLE,
    })
}

/// Classify an `efalevel` code; `None` for codes the survey does not define.
pub fn student_level(code: i64) -> Option<LevelLine> {
    let line = match code {
        24 => undergraduate(FULL_TIME, DEGREE_SEEKING, "First-time"),
        39 => undergraduate(FULL_TIME, DEGREE_SEEKING, "Transfer-in"),
        40 => undergraduate(FULL_TIME, DEGREE_SEEKING, "Continuing"),
        31 => undergraduate(FULL_TIME, NON_DEGREE_SEEKING, NOT_APPLICABLE),
        32 => graduate(FULL_TIME),
        44 => undergraduate(PART_TIME, DEGREE_SEEKING, "First-time"),
        59 => undergraduate(PART_TIME, DEGREE_SEEKING, "Transfer-in"),
        60 => undergraduate(PART_TIME, DEGREE_SEEKING, "Continuing"),
        51 => undergraduate(PART_TIME, NON_DEGREE_SEEKING, NOT_APPLICABLE),
        52 => graduate(PART_TIME),
        1..=23 | 25 | 41..=43 | 45 => LevelLine::Total,
        _ => return None,
    };
    Some(line)
}

/// Demographic count columns present in this year's file, with their dimension keys.
fn demographic_columns(table: &Table) -> Vec<(String, &Column)> {
    RACES
        .iter()
        .flat_map(|race| SEXES.iter().map(move |sex| format!("{race}{sex}")))
        .filter_map(|key| {
            let column = table.column(&format!("ef{key}"))?;
            Some((key, column))
        })
        .collect()
}

pub fn fall_enrollment(
    ef: &Table,
    year: i32,
) -> Result<EntityBatch<FallEnrollmentRow>, TransformError> {
    let date_key = date_key_for(year)?;
    let missing = |column: &str| TransformError::MissingColumn {
        dataset: DATASET.to_string(),
        column: column.to_string(),
    };
    let unitids = ef.column("unitid").ok_or_else(|| missing("unitid"))?;
    let levels = ef.column(LEVEL_COLUMN).ok_or_else(|| missing(LEVEL_COLUMN))?;
    let demographics = demographic_columns(ef);

    let mut audit = RecodeAudit::default();
    let mut counts: BTreeMap<(i64, StudentLevel, &str), i64> = BTreeMap::new();

    for r in 0..ef.row_count() {
        let (Some(unitid), Some(code)) = (unitids.i64_at(r), levels.i64_at(r)) else {
            continue;
        };
        let level = match student_level(code) {
            Some(LevelLine::Leaf(level)) => level,
            Some(LevelLine::Total) => continue,
            None => {
                audit.record(LEVEL_COLUMN, code);
                continue;
            }
        };
        for (key, column) in &demographics {
            if let Some(n) = column.i64_at(r) {
                *counts.entry((unitid, level, key.as_str())).or_default() += n.max(0);
            }
        }
    }

    let rows = counts
        .into_iter()
        .map(|((unitid, level, key), headcount)| {
            Ok(FallEnrollmentRow {
                unitid: to_i32("unitid", unitid)?,
                date_key,
                time_status: level.time_status.to_string(),
                career_level: level.career_level.to_string(),
                degree_seeking: level.degree_seeking.to_string(),
                continuation_type: level.continuation_type.to_string(),
                demographic_key: key.to_string(),
                headcount: to_i32("headcount", headcount)?,
            })
        })
        .collect::<Result<Vec<_>, TransformError>>()?;

    debug!(year, rows = rows.len(), "fall enrollment transformed");
    Ok(EntityBatch {
        entity: Entity::FallEnrollment,
        partition: Partition::AsOf(date_key),
        rows,
        audit,
        ignored_columns: Default::default(),
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FallEnrollmentTransform;

impl EntityTransform for FallEnrollmentTransform {
    type Row = FallEnrollmentRow;

    fn entity(&self) -> Entity {
        Entity::FallEnrollment
    }

    fn transform(
        &self,
        sources: &SourceTables,
        year: i32,
    ) -> Result<EntityBatch<FallEnrollmentRow>, TransformError> {
        fall_enrollment(sources.get(DATASET)?, year)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ef() -> Table {
        Table::from_columns(vec![
            Column::int("unitid", vec![Some(100001), Some(100001), Some(100001), Some(100001), Some(100002)]),
            Column::int("efalevel", vec![Some(1), Some(24), Some(52), Some(77), Some(24)]),
            Column::int("efhispm", vec![Some(90), Some(10), Some(3), Some(5), Some(-2)]),
            Column::int("efhispw", vec![Some(90), Some(12), None, Some(5), Some(4)]),
            Column::int("efwhitw", vec![Some(50), Some(20), Some(1), Some(5), None]),
            Column::int("xefhispm", vec![None, None, None, None, None]),
        ])
        .unwrap()
    }

    #[test]
    fn leaf_levels_are_classified_and_totals_skipped() {
        assert_eq!(
            student_level(24),
            Some(LevelLine::Leaf(StudentLevel {
                time_status: "Full-time",
                career_level: "Undergraduate",
                degree_seeking: "Degree-seeking",
                continuation_type: "First-time",
            }))
        );
        assert!(matches!(
            student_level(52),
            Some(LevelLine::Leaf(StudentLevel { time_status: "Part-time", career_level: "Graduate", .. }))
        ));
        assert_eq!(student_level(1), Some(LevelLine::Total));
        assert_eq!(student_level(45), Some(LevelLine::Total));
        assert_eq!(student_level(77), None);
    }

    #[test]
    fn demographic_columns_are_unpivoted() {
        let batch = fall_enrollment(&ef(), 2015).unwrap();
        assert_eq!(batch.entity, Entity::FallEnrollment);

        let first_time: Vec<_> = batch
            .rows
            .iter()
            .filter(|r| r.unitid == 100001 && r.continuation_type == "First-time")
            .map(|r| (r.demographic_key.as_str(), r.headcount))
            .collect();
        assert_eq!(first_time, vec![("hispm", 10), ("hispw", 12), ("whitw", 20)]);

        let graduate: Vec<_> = batch
            .rows
            .iter()
            .filter(|r| r.career_level == "Graduate")
            .map(|r| r.demographic_key.as_str())
            .collect();
        assert_eq!(graduate, vec!["hispm", "whitw"]);
    }

    #[test]
    fn negatives_clamp_and_unknown_levels_are_audited() {
        let batch = fall_enrollment(&ef(), 2015).unwrap();
        let clamped = batch
            .rows
            .iter()
            .find(|r| r.unitid == 100002 && r.demographic_key == "hispm")
            .unwrap();
        assert_eq!(clamped.headcount, 0);
        assert!(batch.rows.iter().all(|r| r.headcount >= 0));
        assert_eq!(batch.audit.count("efalevel", "77"), 1);
        assert_eq!(batch.rows.len(), 3 + 2 + 2);
    }

    #[test]
    fn duplicate_keys_are_summed() {
        let ef = Table::from_columns(vec![
            Column::int("unitid", vec![Some(7), Some(7)]),
            Column::int("efalevel", vec![Some(32), Some(32)]),
            Column::int("ef2morm", vec![Some(2), Some(3)]),
        ])
        .unwrap();
        let batch = fall_enrollment(&ef, 2012).unwrap();
        assert_eq!(batch.rows.len(), 1);
        assert_eq!(batch.rows[0].headcount, 5);
        assert_eq!(batch.rows[0].demographic_key, "2morm");
    }

    #[test]
    fn level_column_is_required() {
        let ef = Table::from_columns(vec![Column::int("unitid", vec![Some(7)])]).unwrap();
        let err = fall_enrollment(&ef, 2012).unwrap_err();
        assert!(matches!(err, TransformError::MissingColumn { ref column, .. } if column == "efalevel"));
    }
}
