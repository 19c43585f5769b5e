//! Institution records from the directory (HD) and institutional characteristics (IC) files.

use ipeds_core::{Entity, InstitutionRow, Partition, Table};
use tracing::debug;

use crate::recode::{
    flag, geographic_code, parent_or_self, recode, year_closed, CbsaType, Control,
    HighestDegreeOffering, HighestLevelOffering, InstitutionLevel, Locale, RecodeAudit,
    NO_CONFERENCE, NO_SYSTEM, UNKNOWN,
};
use crate::shape::{inner_join, project, ColumnMapping};
use crate::{
    date_key_for, to_i32, EntityBatch, EntityTransform, Frame, SourceTables, TransformError,
};

pub const DIRECTORY: &str = "hd";
pub const CHARACTERISTICS: &str = "ic";
pub const JOIN_KEY: &str = "unitid";

/// `obereg` region code reserved for U.S. service schools.
pub const SERVICE_SCHOOLS_REGION: i64 = 0;

/// Survey column -> warehouse column, in warehouse order (`date_key` is attached separately).
pub const COLUMN_MAP: &[ColumnMapping] = &[
    ColumnMapping::required("unitid", "unitid"),
    ColumnMapping::text("instnm", "institution_name"),
    ColumnMapping::text("addr", "address"),
    ColumnMapping::text("city", "city"),
    ColumnMapping::text("zip", "zip_code"),
    ColumnMapping::text("webaddr", "web_address"),
    ColumnMapping::code("fips", "state_fips"),
    ColumnMapping::code("countycd", "county_fips"),
    ColumnMapping::code("obereg", "service_academy"),
    ColumnMapping::code("iclevel", "institution_level"),
    ColumnMapping::code("control", "control"),
    ColumnMapping::code("hloffer", "highest_level_offering"),
    ColumnMapping::code("hdegofr1", "highest_degree_offering"),
    ColumnMapping::code("ugoffer", "undergraduate_offering"),
    ColumnMapping::code("groffer", "graduate_offering"),
    ColumnMapping::code("deggrant", "degree_granting"),
    ColumnMapping::code("locale", "locale"),
    ColumnMapping::code("newid", "parent_id"),
    ColumnMapping::code("deathyr", "year_closed"),
    ColumnMapping::code("cyactive", "active"),
    ColumnMapping::code("cbsa", "cbsa_id"),
    ColumnMapping::code("cbsatype", "cbsa_type"),
    ColumnMapping::code("csa", "csa_id"),
    ColumnMapping::float("longitud", "longitude"),
    ColumnMapping::float("latitude", "latitude"),
    ColumnMapping::code("f1syscod", "system_member"),
    ColumnMapping::text("f1sysnam", "system_name"),
    ColumnMapping::code("openpubl", "open_to_public"),
    ColumnMapping::code("landgrnt", "landgrant"),
    ColumnMapping::code("hbcu", "hbcu"),
    ColumnMapping::code("hospital", "hospital"),
    ColumnMapping::code("medical", "medical"),
    ColumnMapping::code("tribal", "tribal"),
    ColumnMapping::code("slo5", "rotc"),
    ColumnMapping::code("confno1", "confno1"),
    ColumnMapping::code("confno2", "confno2"),
    ColumnMapping::code("confno3", "confno3"),
    ColumnMapping::code("confno4", "confno4"),
];

/// Join HD and IC on `unitid` and project onto the institution column set.
pub fn frame(hd: &Table, ic: &Table) -> Result<Table, TransformError> {
    let joined = inner_join((DIRECTORY, hd), (CHARACTERISTICS, ic), JOIN_KEY)?;
    project("hd+ic", &joined, COLUMN_MAP)
}

pub fn institutions(
    hd: &Table,
    ic: &Table,
    year: i32,
) -> Result<EntityBatch<InstitutionRow>, TransformError> {
    let date_key = date_key_for(year)?;
    let projected = frame(hd, ic)?;
    let f = Frame::new("hd+ic", &projected);
    let mut audit = RecodeAudit::default();
    let mut rows = Vec::with_capacity(f.rows());

    for r in 0..f.rows() {
        let Some(unitid) = f.int("unitid", r)? else {
            continue;
        };
        let conference = |name: &'static str| -> Result<i32, TransformError> {
            to_i32(name, f.int(name, r)?.unwrap_or(NO_CONFERENCE))
        };

        rows.push(InstitutionRow {
            unitid: to_i32("unitid", unitid)?,
            date_key,
            institution_name: f
                .text("institution_name", r)?
                .unwrap_or_else(|| UNKNOWN.to_string()),
            address: f.text("address", r)?,
            city: f.text("city", r)?,
            zip_code: f.text("zip_code", r)?,
            web_address: f.text("web_address", r)?,
            state_fips: to_i32("fips", geographic_code(f.int("state_fips", r)?))?,
            county_fips: geographic_code(f.int("county_fips", r)?) as f64 / 1000.0,
            service_academy: flag(f.int("service_academy", r)?, SERVICE_SCHOOLS_REGION),
            institution_level: recode::<InstitutionLevel>(f.int("institution_level", r)?, &mut audit)
                .to_string(),
            control: recode::<Control>(f.int("control", r)?, &mut audit).to_string(),
            highest_level_offering: recode::<HighestLevelOffering>(
                f.int("highest_level_offering", r)?,
                &mut audit,
            )
            .to_string(),
            highest_degree_offering: recode::<HighestDegreeOffering>(
                f.int("highest_degree_offering", r)?,
                &mut audit,
            )
            .to_string(),
            undergraduate_offering: flag(f.int("undergraduate_offering", r)?, 1),
            graduate_offering: flag(f.int("graduate_offering", r)?, 1),
            degree_granting: flag(f.int("degree_granting", r)?, 1),
            locale: recode::<Locale>(f.int("locale", r)?, &mut audit).to_string(),
            parent_id: to_i32("newid", parent_or_self(f.int("parent_id", r)?, unitid))?,
            year_closed: year_closed(f.int("year_closed", r)?)
                .map(|y| to_i32("deathyr", y))
                .transpose()?,
            active: flag(f.int("active", r)?, 1),
            cbsa_id: to_i32("cbsa", geographic_code(f.int("cbsa_id", r)?))?,
            cbsa_type: recode::<CbsaType>(f.int("cbsa_type", r)?, &mut audit).to_string(),
            csa_id: to_i32("csa", geographic_code(f.int("csa_id", r)?))?,
            longitude: f.float("longitude", r)?,
            latitude: f.float("latitude", r)?,
            system_member: flag(f.int("system_member", r)?, 1),
            system_name: f
                .text("system_name", r)?
                .unwrap_or_else(|| NO_SYSTEM.to_string()),
            open_to_public: flag(f.int("open_to_public", r)?, 1),
            landgrant: flag(f.int("landgrant", r)?, 1),
            hbcu: flag(f.int("hbcu", r)?, 1),
            hospital: flag(f.int("hospital", r)?, 1),
            medical: flag(f.int("medical", r)?, 1),
            tribal: flag(f.int("tribal", r)?, 1),
            rotc: flag(f.int("rotc", r)?, 1),
            confno1: conference("confno1")?,
            confno2: conference("confno2")?,
            confno3: conference("confno3")?,
            confno4: conference("confno4")?,
        });
    }

    debug!(year, rows = rows.len(), "institutions transformed");
    Ok(EntityBatch {
        entity: Entity::Institutions,
        partition: Partition::AsOf(date_key),
        rows,
        audit,
        ignored_columns: Default::default(),
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InstitutionsTransform;

impl EntityTransform for InstitutionsTransform {
    type Row = InstitutionRow;

    fn entity(&self) -> Entity {
        Entity::Institutions
    }

    fn transform(
        &self,
        sources: &SourceTables,
        year: i32,
    ) -> Result<EntityBatch<InstitutionRow>, TransformError> {
        institutions(sources.get(DIRECTORY)?, sources.get(CHARACTERISTICS)?, year)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ipeds_core::Column;

    fn hd_2015() -> Table {
        Table::from_columns(vec![
            Column::int("unitid", vec![Some(100001), Some(100002)]),
            Column::text("instnm", vec![Some("Test U"), Some("Branch College")]),
            Column::int("fips", vec![Some(31), Some(-3)]),
            Column::int("countycd", vec![Some(31109), Some(-2)]),
            Column::int("obereg", vec![Some(0), Some(7)]),
            Column::int("locale", vec![Some(23), Some(999)]),
            Column::int("newid", vec![Some(-2), Some(100001)]),
            Column::int("deathyr", vec![Some(15), Some(2016)]),
            Column::int("cyactive", vec![Some(1), Some(2)]),
            Column::int("cbsatype", vec![Some(-2), None]),
            Column::float("latitude", vec![Some(40.81), None]),
            Column::int("xlocale", vec![Some(1), Some(1)]),
        ])
        .unwrap()
    }

    fn ic_2015() -> Table {
        Table::from_columns(vec![
            Column::int("unitid", vec![Some(100002), Some(100001)]),
            Column::int("control", vec![Some(3), Some(1)]),
            Column::int("slo5", vec![Some(0), Some(1)]),
            Column::int("confno1", vec![Some(102), None]),
        ])
        .unwrap()
    }

    #[test]
    fn projected_frame_has_the_institution_column_set_for_any_year() {
        let sparse_hd = Table::from_columns(vec![Column::int("unitid", vec![Some(1)])]).unwrap();
        let sparse_ic = Table::from_columns(vec![Column::int("unitid", vec![Some(1)])]).unwrap();

        let expected: Vec<&str> = InstitutionRow::COLUMNS
            .iter()
            .copied()
            .filter(|c| *c != "date_key")
            .collect();
        for (hd, ic) in [(&hd_2015(), &ic_2015()), (&sparse_hd, &sparse_ic)] {
            let projected = frame(hd, ic).unwrap();
            assert_eq!(projected.column_names(), expected);
        }
    }

    #[test]
    fn end_to_end_join_builds_the_expected_record() {
        let batch = institutions(&hd_2015(), &ic_2015(), 2015).unwrap();
        let date = NaiveDate::from_ymd_opt(2015, 10, 15).unwrap();
        assert_eq!(batch.partition, Partition::AsOf(date));
        assert_eq!(batch.rows.len(), 2);

        let row = &batch.rows[0];
        assert_eq!(row.unitid, 100001);
        assert_eq!(row.institution_name, "Test U");
        assert_eq!(row.control, "Public");
        assert_eq!(row.date_key, date);
        assert_eq!(row.locale, "Suburb: Small");
        assert_eq!(row.parent_id, 100001);
        assert_eq!(row.year_closed, None);
        assert_eq!(row.state_fips, 31);
        assert!((row.county_fips - 31.109).abs() < 1e-9);
        assert!(row.service_academy);
        assert!(row.active);
        assert!(row.rotc);
        assert_eq!(row.cbsa_type, "Not applicable");
        assert_eq!(row.latitude, Some(40.81));
        assert_eq!(row.confno1, NO_CONFERENCE as i32);
        assert_eq!(row.system_name, NO_SYSTEM);
        assert_eq!(row.institution_level, UNKNOWN);
    }

    #[test]
    fn sentinels_and_unknown_codes_are_normalized() {
        let batch = institutions(&hd_2015(), &ic_2015(), 2015).unwrap();
        let row = &batch.rows[1];
        assert_eq!(row.unitid, 100002);
        assert_eq!(row.locale, UNKNOWN);
        assert_eq!(row.state_fips, 0);
        assert_eq!(row.county_fips, 0.0);
        assert_eq!(row.parent_id, 100001);
        assert_eq!(row.year_closed, Some(2016));
        assert!(!row.active);
        assert!(!row.service_academy);
        assert_eq!(row.control, "Private for-profit");
        assert_eq!(row.cbsa_type, UNKNOWN);
        assert_eq!(row.confno1, 102);

        assert_eq!(batch.audit.count("locale", "999"), 1);
        assert_eq!(batch.audit.total(), 1);
    }

    #[test]
    fn transform_reads_both_sources() {
        let sources = SourceTables::new().with(DIRECTORY, hd_2015());
        let err = InstitutionsTransform.transform(&sources, 2015).unwrap_err();
        assert!(matches!(err, TransformError::MissingSource(name) if name == "ic"));

        let sources = sources.with(CHARACTERISTICS, ic_2015());
        let batch = InstitutionsTransform.transform(&sources, 2015).unwrap();
        assert_eq!(batch.entity, Entity::Institutions);
        assert_eq!(batch.rows.len(), 2);
    }
}
