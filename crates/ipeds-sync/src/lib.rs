//! Run orchestration: dataset registry, per-(entity, year) fetch/transform/load, run reports.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use ipeds_core::{Entity, Partition, Table};
use ipeds_storage::{FetcherConfig, HttpFetcher, RetryPolicy, SnapshotCache};
use ipeds_transform::finance::finance_field_batch;
use ipeds_transform::shape::drop_imputation_flags;
use ipeds_transform::{
    EntityBatch, EntityTransform, FallEnrollmentTransform, FinanceTransform,
    InstitutionsTransform, SourceTables,
};
use ipeds_warehouse::{RowSink, Warehouse, WarehouseRow};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod registry;
pub mod report;

pub use registry::{fiscal_code, DatasetConfig, DatasetRegistry};
pub use report::{Outcome, RunSummary, Stage, UnitReport};

pub const CRATE_NAME: &str = "ipeds-sync";

#[derive(Debug, Clone)]
pub struct EtlConfig {
    /// No default: credentials come from the environment or not at all.
    pub database_url: Option<String>,
    pub data_dir: PathBuf,
    pub registry_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub fetch_retries: u32,
    pub year_timeout_secs: u64,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl EtlConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            data_dir: std::env::var("IPEDS_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            registry_path: std::env::var("IPEDS_REGISTRY")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./datasets.yaml")),
            user_agent: std::env::var("IPEDS_USER_AGENT")
                .unwrap_or_else(|_| format!("ipeds-etl/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout_secs: env_or("IPEDS_HTTP_TIMEOUT_SECS", 120),
            fetch_retries: env_or("IPEDS_FETCH_RETRIES", 3),
            year_timeout_secs: env_or("IPEDS_YEAR_TIMEOUT_SECS", 900),
        }
    }

    /// Connection string for commands that touch the warehouse.
    pub fn database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL is not set; export the warehouse connection string")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.data_dir.join("reports")
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub entity: Option<Entity>,
    pub year: Option<i32>,
    /// Ignore cached snapshots and download again.
    pub refresh: bool,
    /// Transform without writing to the warehouse.
    pub dry_run: bool,
}

impl RunOptions {
    /// Entities to run, in load order. Selecting finance also reloads its
    /// field dimension so the facts' foreign keys resolve.
    pub fn entities(&self) -> Vec<Entity> {
        match self.entity {
            None => Entity::ALL.to_vec(),
            Some(Entity::Finance) => vec![Entity::FinanceFields, Entity::Finance],
            Some(entity) => vec![entity],
        }
    }
}

#[derive(Debug)]
struct UnitFailure {
    stage: Stage,
    error: anyhow::Error,
}

impl UnitFailure {
    fn at(stage: Stage) -> impl FnOnce(anyhow::Error) -> Self {
        move |error| Self { stage, error }
    }
}

impl fmt::Display for UnitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {:#}", self.stage, self.error)
    }
}

/// Rows and audit totals of one successful unit.
struct Delivered {
    outcome: Outcome,
    unmapped: usize,
    ignored_columns: BTreeSet<String>,
}

pub struct Pipeline<S = Warehouse> {
    registry: DatasetRegistry,
    fetcher: HttpFetcher,
    cache: SnapshotCache,
    sink: Option<S>,
    year_timeout: Duration,
}

impl<S: RowSink> Pipeline<S> {
    /// `sink: None` makes every run a dry run.
    pub fn new(config: &EtlConfig, registry: DatasetRegistry, sink: Option<S>) -> Result<Self> {
        let fetcher = HttpFetcher::new(FetcherConfig {
            request_timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: config.user_agent.clone(),
            retry: RetryPolicy {
                retries: config.fetch_retries,
                ..Default::default()
            },
        })?;
        Ok(Self {
            registry,
            fetcher,
            cache: SnapshotCache::new(config.data_dir.clone()),
            sink,
            year_timeout: Duration::from_secs(config.year_timeout_secs),
        })
    }

    pub fn registry(&self) -> &DatasetRegistry {
        &self.registry
    }

    /// Every selected (entity, year) unit in order. A failed unit is recorded
    /// and the run moves on to the next one.
    pub async fn run(&self, options: &RunOptions) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let dry_run = options.dry_run || self.sink.is_none();
        info!(%run_id, dry_run, "run started");

        let mut units = Vec::new();
        let mut ignored_columns = BTreeSet::new();
        for entity in options.entities() {
            let years = match self.registry.years_for(entity) {
                Ok(years) => years,
                Err(err) => {
                    warn!(%entity, error = %format!("{err:#}"), "entity skipped");
                    units.push(UnitReport {
                        target: entity.to_string(),
                        year: None,
                        partition: None,
                        outcome: Outcome::Failed {
                            stage: Stage::Registry,
                            message: format!("{err:#}"),
                        },
                        unmapped_values: 0,
                    });
                    continue;
                }
            };

            let Some(range) = years else {
                units.push(
                    self.run_unit(entity, None, options, dry_run, &mut ignored_columns)
                        .await,
                );
                continue;
            };
            let selected: Vec<i32> = range.filter(|y| options.year.map_or(true, |o| o == *y)).collect();
            if selected.is_empty() {
                warn!(%entity, year = ?options.year, "no registry years selected");
            }
            for year in selected {
                units.push(
                    self.run_unit(entity, Some(year), options, dry_run, &mut ignored_columns)
                        .await,
                );
            }
        }

        let summary = RunSummary {
            run_id,
            command: "run".to_string(),
            started_at,
            finished_at: Utc::now(),
            dry_run,
            units,
            ignored_columns,
        };
        if !summary.ignored_columns.is_empty() {
            debug!(
                %run_id,
                count = summary.ignored_columns.len(),
                columns = ?summary.ignored_columns,
                "source columns outside the warehouse model were not loaded"
            );
        }
        info!(%run_id, units = summary.units.len(), failed = summary.failures(), "run finished");
        Ok(summary)
    }

    /// Populate the snapshot cache without transforming or loading.
    pub async fn fetch(
        &self,
        dataset: Option<&str>,
        year: Option<i32>,
        refresh: bool,
    ) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let datasets: Vec<&DatasetConfig> = match dataset {
            Some(name) => vec![self.registry.dataset(name)?],
            None => self.registry.datasets.iter().collect(),
        };

        let mut units = Vec::new();
        for dataset in datasets {
            for y in dataset.years().filter(|y| year.map_or(true, |o| o == *y)) {
                let outcome = match self.source_table(dataset, y, refresh).await {
                    Ok((table, from_cache)) => Outcome::Fetched {
                        rows: table.row_count(),
                        from_cache,
                    },
                    Err(failure) => {
                        warn!(dataset = %dataset.name, year = y, error = %failure, "fetch failed");
                        Outcome::Failed {
                            stage: failure.stage,
                            message: format!("{:#}", failure.error),
                        }
                    }
                };
                units.push(UnitReport {
                    target: dataset.name.clone(),
                    year: Some(y),
                    partition: None,
                    outcome,
                    unmapped_values: 0,
                });
            }
        }

        Ok(RunSummary {
            run_id,
            command: "fetch".to_string(),
            started_at,
            finished_at: Utc::now(),
            dry_run: true,
            units,
            ignored_columns: BTreeSet::new(),
        })
    }

    async fn run_unit(
        &self,
        entity: Entity,
        year: Option<i32>,
        options: &RunOptions,
        dry_run: bool,
        ignored_columns: &mut BTreeSet<String>,
    ) -> UnitReport {
        let result = tokio::time::timeout(
            self.year_timeout,
            self.process(entity, year, options.refresh, dry_run),
        )
        .instrument(info_span!("unit", %entity, year = ?year))
        .await
        .unwrap_or_else(|_| {
            Err(UnitFailure {
                stage: Stage::Timeout,
                error: anyhow::anyhow!("exceeded {}s", self.year_timeout.as_secs()),
            })
        });

        let partition = match year {
            Some(year) => Partition::for_year(year),
            None => Some(Partition::Static),
        };
        match result {
            Ok(delivered) => {
                ignored_columns.extend(delivered.ignored_columns);
                let report = UnitReport {
                    target: entity.to_string(),
                    year,
                    partition,
                    outcome: delivered.outcome,
                    unmapped_values: delivered.unmapped,
                };
                info!(summary = %report, "unit finished");
                report
            }
            Err(failure) => {
                warn!(%entity, ?year, error = %failure, "unit failed; continuing");
                UnitReport {
                    target: entity.to_string(),
                    year,
                    partition,
                    outcome: Outcome::Failed {
                        stage: failure.stage,
                        message: format!("{:#}", failure.error),
                    },
                    unmapped_values: 0,
                }
            }
        }
    }

    async fn process(
        &self,
        entity: Entity,
        year: Option<i32>,
        refresh: bool,
        dry_run: bool,
    ) -> Result<Delivered, UnitFailure> {
        match (entity, year) {
            (Entity::FinanceFields, _) => self.deliver(finance_field_batch(), None, dry_run).await,
            (_, None) => Err(UnitFailure {
                stage: Stage::Registry,
                error: anyhow::anyhow!("{entity} is built per survey year but no year was given"),
            }),
            (Entity::Institutions, Some(year)) => {
                self.transform_and_deliver(&InstitutionsTransform, year, refresh, dry_run)
                    .await
            }
            (Entity::FallEnrollment, Some(year)) => {
                self.transform_and_deliver(&FallEnrollmentTransform, year, refresh, dry_run)
                    .await
            }
            (Entity::Finance, Some(year)) => {
                self.transform_and_deliver(&FinanceTransform, year, refresh, dry_run)
                    .await
            }
        }
    }

    /// Cached snapshot if present and readable, otherwise a fresh download that
    /// is then cached. The flag reports whether the cache served the table.
    async fn source_table(
        &self,
        dataset: &DatasetConfig,
        year: i32,
        refresh: bool,
    ) -> Result<(Table, bool), UnitFailure> {
        if !refresh && self.cache.contains(&dataset.name, year) {
            match self.cache.read(&dataset.name, year) {
                Ok(table) => {
                    debug!(dataset = %dataset.name, year, rows = table.row_count(), "cache hit");
                    return Ok((table, true));
                }
                Err(err) => {
                    warn!(dataset = %dataset.name, year, error = %err, "cached snapshot unreadable; re-fetching")
                }
            }
        }

        let url = dataset.url_for(year);
        let mut table = self
            .fetcher
            .fetch_table(&url, &dataset.type_hints(), &dataset.missing_value)
            .await
            .with_context(|| format!("fetching {} for {year} from {url}", dataset.name))
            .map_err(UnitFailure::at(Stage::Fetch))?;
        drop_imputation_flags(&mut table);

        if let Err(err) = self.cache.store(&dataset.name, year, &table) {
            warn!(dataset = %dataset.name, year, error = %err, "could not cache snapshot");
        }
        Ok((table, false))
    }

    async fn transform_and_deliver<T>(
        &self,
        transform: &T,
        year: i32,
        refresh: bool,
        dry_run: bool,
    ) -> Result<Delivered, UnitFailure>
    where
        T: EntityTransform,
        T::Row: WarehouseRow,
    {
        let mut sources = SourceTables::new();
        for name in transform.entity().datasets() {
            let dataset = self
                .registry
                .dataset(name)
                .map_err(UnitFailure::at(Stage::Registry))?;
            let (table, _) = self.source_table(dataset, year, refresh).await?;
            sources.insert(*name, table);
        }

        let batch = transform
            .transform(&sources, year)
            .with_context(|| format!("transforming {} for {year}", transform.entity()))
            .map_err(UnitFailure::at(Stage::Transform))?;
        self.deliver(batch, Some(year), dry_run).await
    }

    async fn deliver<R: WarehouseRow>(
        &self,
        batch: EntityBatch<R>,
        year: Option<i32>,
        dry_run: bool,
    ) -> Result<Delivered, UnitFailure> {
        batch.audit.log(batch.entity.as_str(), year);
        let unmapped = batch.audit.total();

        let sink = match &self.sink {
            Some(sink) if !dry_run => sink,
            _ => {
                return Ok(Delivered {
                    outcome: Outcome::Transformed {
                        rows: batch.rows.len(),
                    },
                    unmapped,
                    ignored_columns: batch.ignored_columns,
                })
            }
        };

        let report = sink
            .replace_partition(&batch.partition, &batch.rows)
            .await
            .with_context(|| format!("loading {} {}", batch.entity.table_name(), batch.partition))
            .map_err(UnitFailure::at(Stage::Load))?;
        Ok(Delivered {
            outcome: Outcome::Loaded {
                deleted: report.deleted,
                inserted: report.inserted,
            },
            unmapped,
            ignored_columns: batch.ignored_columns,
        })
    }
}

pub async fn run_from_env(options: RunOptions) -> Result<RunSummary> {
    let config = EtlConfig::from_env();
    let registry = DatasetRegistry::load(&config.registry_path).await?;
    let sink = if options.dry_run {
        None
    } else {
        Some(
            Warehouse::connect(config.database_url()?)
                .await
                .context("connecting to the warehouse")?,
        )
    };
    let pipeline = Pipeline::new(&config, registry, sink)?;
    let summary = pipeline.run(&options).await?;
    summary.write(&config.reports_dir()).await?;
    Ok(summary)
}

pub async fn fetch_from_env(
    dataset: Option<&str>,
    year: Option<i32>,
    refresh: bool,
) -> Result<RunSummary> {
    let config = EtlConfig::from_env();
    let registry = DatasetRegistry::load(&config.registry_path).await?;
    let pipeline = Pipeline::<Warehouse>::new(&config, registry, None)?;
    let summary = pipeline.fetch(dataset, year, refresh).await?;
    summary.write(&config.reports_dir()).await?;
    Ok(summary)
}

pub async fn migrate_from_env() -> Result<()> {
    let config = EtlConfig::from_env();
    let warehouse = Warehouse::connect(config.database_url()?)
        .await
        .context("connecting to the warehouse")?;
    warehouse.migrate().await.context("migrating the warehouse")?;
    Ok(())
}
