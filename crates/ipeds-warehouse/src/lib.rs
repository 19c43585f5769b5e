//! Postgres loader: replaces one partition of a warehouse table per call.

use std::fmt;

use async_trait::async_trait;
use ipeds_core::{FallEnrollmentRow, FinanceFieldRow, FinanceRow, InstitutionRow, Partition};
use sqlx::migrate::MigrateError;
use sqlx::postgres::PgPoolOptions;
use sqlx::query_builder::Separated;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "ipeds-warehouse";

/// Postgres caps a single statement at this many bind parameters.
pub const BIND_LIMIT: usize = 65_535;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("connecting to the warehouse: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("applying warehouse migrations: {0}")]
    Migrate(#[from] MigrateError),
    #[error("{table} cannot be loaded into partition {partition}")]
    PartitionMismatch {
        table: &'static str,
        partition: String,
    },
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
}

/// Rows deleted and inserted by one partition replacement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub deleted: u64,
    pub inserted: u64,
}

impl fmt::Display for LoadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "deleted={} inserted={}", self.deleted, self.inserted)
    }
}

/// A typed row with a fixed target table and column order.
pub trait WarehouseRow: Send + Sync + 'static {
    const TABLE: &'static str;
    const COLUMNS: &'static [&'static str];
    /// Primary key of a static (non-dated) table. Such tables are upserted on
    /// this column and pruned of keys missing from the batch.
    const STATIC_KEY: Option<&'static str> = None;

    fn static_key(&self) -> Option<&str> {
        None
    }

    /// Push one bind per entry of `COLUMNS`, in order.
    fn bind_row(&self, row: &mut Separated<'_, '_, Postgres, &'static str>);
}

impl WarehouseRow for InstitutionRow {
    const TABLE: &'static str = "ipeds_institutions";
    const COLUMNS: &'static [&'static str] = InstitutionRow::COLUMNS;

    fn bind_row(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.unitid)
            .push_bind(self.date_key)
            .push_bind(self.institution_name.clone())
            .push_bind(self.address.clone())
            .push_bind(self.city.clone())
            .push_bind(self.zip_code.clone())
            .push_bind(self.web_address.clone())
            .push_bind(self.state_fips)
            .push_bind(self.county_fips)
            .push_bind(self.service_academy)
            .push_bind(self.institution_level.clone())
            .push_bind(self.control.clone())
            .push_bind(self.highest_level_offering.clone())
            .push_bind(self.highest_degree_offering.clone())
            .push_bind(self.undergraduate_offering)
            .push_bind(self.graduate_offering)
            .push_bind(self.degree_granting)
            .push_bind(self.locale.clone())
            .push_bind(self.parent_id)
            .push_bind(self.year_closed)
            .push_bind(self.active)
            .push_bind(self.cbsa_id)
            .push_bind(self.cbsa_type.clone())
            .push_bind(self.csa_id)
            .push_bind(self.longitude)
            .push_bind(self.latitude)
            .push_bind(self.system_member)
            .push_bind(self.system_name.clone())
            .push_bind(self.open_to_public)
            .push_bind(self.landgrant)
            .push_bind(self.hbcu)
            .push_bind(self.hospital)
            .push_bind(self.medical)
            .push_bind(self.tribal)
            .push_bind(self.rotc)
            .push_bind(self.confno1)
            .push_bind(self.confno2)
            .push_bind(self.confno3)
            .push_bind(self.confno4);
    }
}

impl WarehouseRow for FallEnrollmentRow {
    const TABLE: &'static str = "ipeds_fall_enrollment";
    const COLUMNS: &'static [&'static str] = FallEnrollmentRow::COLUMNS;

    fn bind_row(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.unitid)
            .push_bind(self.date_key)
            .push_bind(self.time_status.clone())
            .push_bind(self.career_level.clone())
            .push_bind(self.degree_seeking.clone())
            .push_bind(self.continuation_type.clone())
            .push_bind(self.demographic_key.clone())
            .push_bind(self.headcount);
    }
}

impl WarehouseRow for FinanceRow {
    const TABLE: &'static str = "ipeds_finance";
    const COLUMNS: &'static [&'static str] = FinanceRow::COLUMNS;

    fn bind_row(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.unitid)
            .push_bind(self.date_key)
            .push_bind(self.finance_field_key.clone())
            .push_bind(self.amount);
    }
}

impl WarehouseRow for FinanceFieldRow {
    const TABLE: &'static str = "ipeds_finance_field_dimension";
    const COLUMNS: &'static [&'static str] = FinanceFieldRow::COLUMNS;
    const STATIC_KEY: Option<&'static str> = Some("finance_field_key");

    fn static_key(&self) -> Option<&str> {
        Some(&self.finance_field_key)
    }

    fn bind_row(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.finance_field_key.clone())
            .push_bind(self.finance_field.clone());
    }
}

/// Rows per INSERT statement that keep the bind count under [`BIND_LIMIT`].
pub fn rows_per_statement(columns: usize) -> usize {
    (BIND_LIMIT / columns.max(1)).max(1)
}

/// Multi-row INSERT for `rows`; static tables get an upsert clause.
pub fn insert_statement<R: WarehouseRow>(rows: &[R]) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(format!(
        "INSERT INTO {} ({}) ",
        R::TABLE,
        R::COLUMNS.join(", ")
    ));
    builder.push_values(rows, |mut b, row| row.bind_row(&mut b));
    if let Some(key) = R::STATIC_KEY {
        let updates = R::COLUMNS
            .iter()
            .filter(|c| **c != key)
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        builder.push(format!(" ON CONFLICT ({key}) DO UPDATE SET {updates}"));
    }
    builder
}

async fn delete_partition<R: WarehouseRow>(
    conn: &mut PgConnection,
    partition: &Partition,
    rows: &[R],
) -> Result<u64, LoadError> {
    let mismatch = || LoadError::PartitionMismatch {
        table: R::TABLE,
        partition: partition.to_string(),
    };
    let result = match (partition, R::STATIC_KEY) {
        (Partition::AsOf(date), None) => {
            sqlx::query(&format!("DELETE FROM {} WHERE date_key = $1", R::TABLE))
                .bind(*date)
                .execute(&mut *conn)
                .await?
        }
        (Partition::Static, Some(key)) => {
            let keep: Vec<String> = rows
                .iter()
                .filter_map(|r| r.static_key().map(ToString::to_string))
                .collect();
            sqlx::query(&format!("DELETE FROM {} WHERE {key} <> ALL($1)", R::TABLE))
                .bind(keep)
                .execute(&mut *conn)
                .await?
        }
        _ => return Err(mismatch()),
    };
    Ok(result.rows_affected())
}

async fn write_partition<R: WarehouseRow>(
    conn: &mut PgConnection,
    partition: &Partition,
    rows: &[R],
) -> Result<LoadReport, LoadError> {
    let deleted = delete_partition(conn, partition, rows).await?;
    let mut inserted = 0;
    for chunk in rows.chunks(rows_per_statement(R::COLUMNS.len())) {
        inserted += insert_statement(chunk)
            .build()
            .execute(&mut *conn)
            .await?
            .rows_affected();
    }
    Ok(LoadReport { deleted, inserted })
}

/// Destination for transformed rows.
#[async_trait]
pub trait RowSink: Send + Sync {
    /// Atomically replace everything in `partition` of `R::TABLE` with `rows`.
    async fn replace_partition<R: WarehouseRow>(
        &self,
        partition: &Partition,
        rows: &[R],
    ) -> Result<LoadReport, LoadError>;
}

#[derive(Debug, Clone)]
pub struct Warehouse {
    pool: PgPool,
}

impl Warehouse {
    pub async fn connect(database_url: &str) -> Result<Self, LoadError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .map_err(LoadError::Connect)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), LoadError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("warehouse migrations applied");
        Ok(())
    }
}

#[async_trait]
impl RowSink for Warehouse {
    async fn replace_partition<R: WarehouseRow>(
        &self,
        partition: &Partition,
        rows: &[R],
    ) -> Result<LoadReport, LoadError> {
        let mut tx = self.pool.begin().await?;
        match write_partition(&mut *tx, partition, rows).await {
            Ok(report) => {
                tx.commit().await?;
                info!(table = R::TABLE, %partition, deleted = report.deleted, inserted = report.inserted, "partition replaced");
                Ok(report)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(table = R::TABLE, %partition, error = %rollback, "rollback failed");
                }
                warn!(table = R::TABLE, %partition, error = %err, "partition load rolled back");
                Err(err)
            }
        }
    }
}
