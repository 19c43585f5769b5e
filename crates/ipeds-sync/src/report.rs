//! Per-run summary: one outcome per (entity, year) unit, persisted as JSON.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ipeds_core::Partition;
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Registry,
    Fetch,
    Transform,
    Load,
    Timeout,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Registry => "registry",
            Self::Fetch => "fetch",
            Self::Transform => "transform",
            Self::Load => "load",
            Self::Timeout => "timeout",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Loaded { deleted: u64, inserted: u64 },
    /// Dry run: rows were built but not written.
    Transformed { rows: usize },
    Fetched { rows: usize, from_cache: bool },
    Failed { stage: Stage, message: String },
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitReport {
    /// Entity name for `run`, dataset name for `fetch`.
    pub target: String,
    pub year: Option<i32>,
    pub partition: Option<Partition>,
    pub outcome: Outcome,
    /// Values that fell back to a default label during recoding.
    pub unmapped_values: usize,
}

impl fmt::Display for UnitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.year {
            Some(year) => write!(f, "{} {year}: ", self.target)?,
            None => write!(f, "{}: ", self.target)?,
        }
        match &self.outcome {
            Outcome::Loaded { deleted, inserted } => {
                write!(f, "loaded deleted={deleted} inserted={inserted}")?
            }
            Outcome::Transformed { rows } => write!(f, "transformed rows={rows} (dry run)")?,
            Outcome::Fetched { rows, from_cache } => {
                let source = if *from_cache { "cache" } else { "remote" };
                write!(f, "fetched rows={rows} from {source}")?
            }
            Outcome::Failed { stage, message } => write!(f, "FAILED at {stage}: {message}")?,
        }
        if self.unmapped_values > 0 {
            write!(f, " unmapped={}", self.unmapped_values)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub units: Vec<UnitReport>,
    /// Source columns seen during the run that no warehouse table models.
    #[serde(default)]
    pub ignored_columns: BTreeSet<String>,
}

impl RunSummary {
    pub fn failures(&self) -> usize {
        self.units.iter().filter(|u| u.outcome.is_failure()).count()
    }

    pub fn rows_inserted(&self) -> u64 {
        self.units
            .iter()
            .map(|u| match u.outcome {
                Outcome::Loaded { inserted, .. } => inserted,
                _ => 0,
            })
            .sum()
    }

    pub fn total_line(&self) -> String {
        format!(
            "run {} ({}): units={} failed={} inserted={}",
            self.run_id,
            self.command,
            self.units.len(),
            self.failures(),
            self.rows_inserted()
        )
    }

    /// Write `<reports_dir>/<run_id>.json`.
    pub async fn write(&self, reports_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;
        let path = reports_dir.join(format!("{}.json", self.run_id));
        let bytes = serde_json::to_vec_pretty(self).context("serializing run summary")?;
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}
