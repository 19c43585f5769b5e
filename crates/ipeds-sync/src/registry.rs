//! `datasets.yaml`: where each survey file lives and which years it covers.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;
use std::path::Path;

use anyhow::{bail, Context, Result};
use ipeds_core::{ColumnType, ColumnTypes, Entity};
use ipeds_storage::MISSING_VALUE;
use serde::Deserialize;
use tokio::fs;

pub const YEAR_PLACEHOLDER: &str = "{year}";
pub const FISCAL_PLACEHOLDER: &str = "{fiscal}";

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetRegistry {
    pub datasets: Vec<DatasetConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub url_template: String,
    pub first_year: i32,
    pub last_year: i32,
    #[serde(default)]
    pub column_types: BTreeMap<String, ColumnType>,
    #[serde(default = "default_missing_value")]
    pub missing_value: String,
}

fn default_missing_value() -> String {
    MISSING_VALUE.to_string()
}

/// Two-digit fiscal-year code used in finance file names: 2015 -> `1415`.
pub fn fiscal_code(year: i32) -> String {
    format!("{:02}{:02}", (year - 1).rem_euclid(100), year.rem_euclid(100))
}

impl DatasetConfig {
    pub fn url_for(&self, year: i32) -> String {
        self.url_template
            .replace(YEAR_PLACEHOLDER, &year.to_string())
            .replace(FISCAL_PLACEHOLDER, &fiscal_code(year))
    }

    pub fn years(&self) -> RangeInclusive<i32> {
        self.first_year..=self.last_year
    }

    pub fn type_hints(&self) -> ColumnTypes {
        self.column_types.iter().map(|(name, ty)| (name, *ty)).collect()
    }
}

impl DatasetRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing dataset registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for dataset in &self.datasets {
            if !seen.insert(dataset.name.as_str()) {
                bail!("dataset {} is listed twice", dataset.name);
            }
            if dataset.first_year > dataset.last_year {
                bail!(
                    "dataset {} has first_year {} after last_year {}",
                    dataset.name,
                    dataset.first_year,
                    dataset.last_year
                );
            }
            if !dataset.url_template.contains(YEAR_PLACEHOLDER)
                && !dataset.url_template.contains(FISCAL_PLACEHOLDER)
            {
                bail!("dataset {} url_template has no year placeholder", dataset.name);
            }
        }
        Ok(())
    }

    pub fn dataset(&self, name: &str) -> Result<&DatasetConfig> {
        self.datasets
            .iter()
            .find(|d| d.name == name)
            .with_context(|| format!("dataset {name} is not in the registry"))
    }

    /// Years an entity can be built for: the intersection of its datasets' ranges.
    /// `None` for entities with no source datasets.
    pub fn years_for(&self, entity: Entity) -> Result<Option<RangeInclusive<i32>>> {
        let mut range: Option<RangeInclusive<i32>> = None;
        for name in entity.datasets() {
            let years = self.dataset(name)?.years();
            range = Some(match range {
                None => years,
                Some(r) => *r.start().max(years.start())..=*r.end().min(years.end()),
            });
        }
        Ok(range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = r#"
datasets:
  - name: hd
    url_template: "https://example.test/HD{year}.zip"
    first_year: 2002
    last_year: 2018
    column_types:
      UNITID: int
      locale: int
  - name: ic
    url_template: "https://example.test/IC{year}.zip"
    first_year: 2004
    last_year: 2016
  - name: f2
    url_template: "https://example.test/F{fiscal}_F2.zip"
    first_year: 2002
    last_year: 2018
    missing_value: ""
"#;

    #[test]
    fn fiscal_codes_wrap_centuries() {
        assert_eq!(fiscal_code(2015), "1415");
        assert_eq!(fiscal_code(2000), "9900");
        assert_eq!(fiscal_code(2010), "0910");
    }

    #[test]
    fn urls_fill_placeholders() {
        let registry = DatasetRegistry::from_yaml(REGISTRY).unwrap();
        assert_eq!(
            registry.dataset("hd").unwrap().url_for(2015),
            "https://example.test/HD2015.zip"
        );
        assert_eq!(
            registry.dataset("f2").unwrap().url_for(2015),
            "https://example.test/F1415_F2.zip"
        );
    }

    #[test]
    fn entity_years_intersect_dataset_ranges() {
        let registry = DatasetRegistry::from_yaml(REGISTRY).unwrap();
        assert_eq!(registry.years_for(Entity::Institutions).unwrap(), Some(2004..=2016));
        assert_eq!(registry.years_for(Entity::Finance).unwrap(), Some(2002..=2018));
        assert_eq!(registry.years_for(Entity::FinanceFields).unwrap(), None);
        assert!(registry.years_for(Entity::FallEnrollment).is_err());
    }

    #[test]
    fn type_hints_and_missing_values() {
        let registry = DatasetRegistry::from_yaml(REGISTRY).unwrap();
        let hd = registry.dataset("hd").unwrap();
        assert_eq!(hd.type_hints().get("unitid"), ColumnType::Int);
        assert_eq!(hd.type_hints().get("instnm"), ColumnType::Text);
        assert_eq!(hd.missing_value, ".");
        assert_eq!(registry.dataset("f2").unwrap().missing_value, "");
    }

    #[test]
    fn invalid_registries_are_rejected() {
        let reversed = r#"
datasets:
  - name: hd
    url_template: "HD{year}.zip"
    first_year: 2018
    last_year: 2002
"#;
        assert!(DatasetRegistry::from_yaml(reversed).is_err());

        let duplicate = r#"
datasets:
  - { name: hd, url_template: "HD{year}.zip", first_year: 2002, last_year: 2003 }
  - { name: hd, url_template: "HD{year}.zip", first_year: 2002, last_year: 2003 }
"#;
        assert!(DatasetRegistry::from_yaml(duplicate).is_err());

        let fixed = r#"
datasets:
  - { name: hd, url_template: "HD.zip", first_year: 2002, last_year: 2003 }
"#;
        assert!(DatasetRegistry::from_yaml(fixed).is_err());
    }
}
