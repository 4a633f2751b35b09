use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{
    Combination, OutputFormat, ProcessingLevel, RequestSpec, RequestStyle, Selection, YearSpec,
};
use crate::error::HarvestError;
use crate::keys::{KeyDeriver, KeyLayout};
use crate::retry::RetryPolicy;

pub const DEFAULT_CATALOG_FILE: &str = "cds-harvest.json";
pub const DEFAULT_DATASET: &str = "satellite-carbon-dioxide";
pub const DEFAULT_MIN_ARTIFACT_BYTES: u64 = 1024;
pub const DEFAULT_ARCHIVE_URL: &str = "https://cds.climate.copernicus.eu/api";

const BUILTIN_CATALOG: &str = include_str!("../catalog/sensors.json");

#[derive(Debug, Deserialize, Serialize)]
pub struct Catalog {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub dataset: Option<String>,
    #[serde(default)]
    pub storage: Option<StorageEntry>,
    #[serde(default)]
    pub min_artifact_bytes: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryEntry>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub sensors: Vec<SensorEntry>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct StorageEntry {
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub layout: Option<KeyLayout>,
    #[serde(default)]
    pub object_name: Option<String>,
    #[serde(default)]
    pub extension: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RetryEntry {
    #[serde(default)]
    pub submit: Option<PolicyEntry>,
    #[serde(default)]
    pub poll: Option<PolicyEntry>,
    #[serde(default)]
    pub download: Option<PolicyEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PolicyEntry {
    pub max_attempts: u32,
    #[serde(default = "default_multiplier")]
    pub multiplier_secs: f64,
    pub min_wait_secs: f64,
    pub max_wait_secs: f64,
}

fn default_multiplier() -> f64 {
    1.0
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum VariableEntry {
    Shorthand(String),
    List(Vec<String>),
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum YearsEntry {
    List(Vec<String>),
    Range { from: i32, to: i32 },
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SensorEntry {
    pub name: String,
    pub sensor: String,
    pub variables: VariableEntry,
    pub years: YearsEntry,
    #[serde(default)]
    pub dataset: Option<String>,
    #[serde(default)]
    pub style: Option<RequestStyle>,
    #[serde(default)]
    pub level: Option<ProcessingLevel>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub months: Option<Selection>,
    #[serde(default)]
    pub days: Option<Selection>,
    #[serde(default)]
    pub format: Option<OutputFormat>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

/// Read-only template for one sensor product.
#[derive(Debug, Clone, Serialize)]
pub struct SensorConfig {
    pub name: String,
    pub category: String,
    pub variables: Vec<String>,
    pub years: Vec<String>,
    pub template: RequestSpec,
}

impl SensorConfig {
    /// Materialises the template for one variable and year.
    pub fn request_for(&self, variable: &str, year: &str) -> RequestSpec {
        let mut spec = self.template.clone();
        spec.variable = variable.to_string();
        spec.year = YearSpec::Single(year.to_string());
        for value in spec.extra.values_mut() {
            substitute_year(value, year);
        }
        spec
    }
}

fn substitute_year(value: &mut Value, year: &str) {
    match value {
        Value::String(text) if text.contains("{year}") => {
            *text = text.replace("{year}", year);
        }
        Value::Array(items) => items.iter_mut().for_each(|item| substitute_year(item, year)),
        _ => {}
    }
}

/// `poll` waits for the archive job to finish; `submit` and `download` only
/// absorb short-lived server hiccups.
#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub submit: RetryPolicy,
    pub poll: RetryPolicy,
    pub download: RetryPolicy,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            submit: RetryPolicy::new(
                3,
                Duration::from_secs(1),
                Duration::from_secs(4),
                Duration::from_secs(10),
            ),
            poll: RetryPolicy::new(
                720,
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(30),
            ),
            download: RetryPolicy::new(
                5,
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(10),
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedCatalog {
    pub schema_version: u32,
    pub keys: KeyDeriver,
    pub min_artifact_bytes: u64,
    pub retry: RetrySettings,
    pub workers: usize,
    pub sensors: Vec<SensorConfig>,
}

/// Restricts a run to a subset of sensors and years. Empty lists match everything.
#[derive(Debug, Clone, Default)]
pub struct CombinationFilter {
    pub sensors: Vec<String>,
    pub years: Vec<String>,
}

impl ResolvedCatalog {
    pub fn sensor(&self, name: &str) -> Result<&SensorConfig, HarvestError> {
        self.sensors
            .iter()
            .find(|sensor| sensor.name == name || sensor.template.sensor == name)
            .ok_or_else(|| HarvestError::UnknownSensor(name.to_string()))
    }

    /// Sensors x years x variables in catalog order.
    pub fn combinations(
        &self,
        filter: &CombinationFilter,
    ) -> Result<Vec<Combination>, HarvestError> {
        let mut selected = Vec::new();
        if filter.sensors.is_empty() {
            selected.extend(self.sensors.iter());
        } else {
            for name in &filter.sensors {
                selected.push(self.sensor(name)?);
            }
        }

        let mut combinations = Vec::new();
        for sensor in selected {
            for year in &sensor.years {
                if !filter.years.is_empty() && !filter.years.contains(year) {
                    continue;
                }
                for variable in &sensor.variables {
                    combinations.push(Combination {
                        sensor_name: sensor.name.clone(),
                        variable: variable.clone(),
                        year: year.clone(),
                    });
                }
            }
        }
        Ok(combinations)
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedCatalog, HarvestError> {
        let catalog_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CATALOG_FILE),
        };

        if path.is_none() && !catalog_path.exists() {
            return Self::builtin();
        }

        let content = fs::read_to_string(&catalog_path)
            .map_err(|_| HarvestError::ConfigRead(catalog_path.clone()))?;
        Self::resolve_str(&content)
    }

    pub fn builtin() -> Result<ResolvedCatalog, HarvestError> {
        Self::resolve_str(BUILTIN_CATALOG)
    }

    pub fn resolve_str(content: &str) -> Result<ResolvedCatalog, HarvestError> {
        let catalog: Catalog = serde_json::from_str(content)
            .map_err(|err| HarvestError::ConfigParse(err.to_string()))?;
        Self::resolve_catalog(catalog)
    }

    pub fn resolve_catalog(catalog: Catalog) -> Result<ResolvedCatalog, HarvestError> {
        let schema_version = catalog.schema_version.unwrap_or(1);
        let default_dataset = catalog
            .dataset
            .unwrap_or_else(|| DEFAULT_DATASET.to_string());

        let storage = catalog.storage.unwrap_or_default();
        let keys = KeyDeriver::new(
            storage.prefix.as_deref().unwrap_or(crate::keys::DEFAULT_PREFIX),
            storage.layout.unwrap_or_default(),
        )?
        .with_object_name(storage.object_name);
        let keys = match storage.extension.as_deref().map(str::trim) {
            Some(extension) if !extension.is_empty() => keys.with_extension(extension),
            _ => keys,
        };

        let retry_entry = catalog.retry.unwrap_or_default();
        let defaults = RetrySettings::default();
        let retry = RetrySettings {
            submit: resolve_policy(retry_entry.submit, defaults.submit, "submit")?,
            poll: resolve_policy(retry_entry.poll, defaults.poll, "poll")?,
            download: resolve_policy(retry_entry.download, defaults.download, "download")?,
        };

        let workers = catalog.workers.unwrap_or(1);
        if workers == 0 {
            return Err(HarvestError::ConfigParse(
                "workers must be at least 1".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        let sensors = catalog
            .sensors
            .into_iter()
            .map(|entry| {
                if !seen.insert(entry.name.clone()) {
                    return Err(HarvestError::ConfigParse(format!(
                        "duplicate sensor entry: {}",
                        entry.name
                    )));
                }
                resolve_sensor(entry, &default_dataset)
            })
            .collect::<Result<Vec<_>, HarvestError>>()?;
        check_key_collisions(&keys, &sensors)?;

        Ok(ResolvedCatalog {
            schema_version,
            keys,
            min_artifact_bytes: catalog
                .min_artifact_bytes
                .unwrap_or(DEFAULT_MIN_ARTIFACT_BYTES),
            retry,
            workers,
            sensors,
        })
    }
}

/// Two combinations must never share an object key.
fn check_key_collisions(keys: &KeyDeriver, sensors: &[SensorConfig]) -> Result<(), HarvestError> {
    let mut seen = HashSet::new();
    for sensor in sensors {
        for year in &sensor.years {
            for variable in &sensor.variables {
                let category = category_for(sensor, variable, keys);
                let key = keys.derive_default(category, &sensor.template.sensor, year)?;
                if !seen.insert(key.clone()) {
                    return Err(HarvestError::ConfigParse(format!(
                        "sensor {} {variable} {year} maps to an already used key {key}",
                        sensor.name
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Storage category for one variable of a sensor.
pub fn category_for<'a>(
    sensor: &'a SensorConfig,
    variable: &'a str,
    keys: &KeyDeriver,
) -> &'a str {
    if sensor.variables.len() > 1 && keys.layout() == KeyLayout::CategorySensorYear {
        variable
    } else {
        &sensor.category
    }
}

fn resolve_policy(
    entry: Option<PolicyEntry>,
    default: RetryPolicy,
    name: &str,
) -> Result<RetryPolicy, HarvestError> {
    let Some(entry) = entry else {
        return Ok(default);
    };
    let valid = entry.max_attempts > 0
        && entry.multiplier_secs >= 0.0
        && entry.min_wait_secs >= 0.0
        && entry.max_wait_secs >= entry.min_wait_secs;
    if !valid {
        return Err(HarvestError::ConfigParse(format!(
            "invalid {name} retry policy"
        )));
    }
    Ok(RetryPolicy::new(
        entry.max_attempts,
        Duration::from_secs_f64(entry.multiplier_secs),
        Duration::from_secs_f64(entry.min_wait_secs),
        Duration::from_secs_f64(entry.max_wait_secs),
    ))
}

fn resolve_sensor(
    entry: SensorEntry,
    default_dataset: &str,
) -> Result<SensorConfig, HarvestError> {
    let invalid = |reason: String| HarvestError::InvalidRequest {
        sensor: entry.name.clone(),
        reason,
    };

    let variables = match &entry.variables {
        VariableEntry::Shorthand(value) => vec![value.clone()],
        VariableEntry::List(values) => values.clone(),
    };
    if variables.is_empty() || variables.iter().any(|value| value.trim().is_empty()) {
        return Err(invalid("at least one non-empty variable is required".to_string()));
    }

    let years = match &entry.years {
        YearsEntry::List(values) => values.clone(),
        YearsEntry::Range { from, to } => {
            if from > to {
                return Err(invalid(format!("year range {from}..{to} is empty")));
            }
            (*from..=*to).map(|year| year.to_string()).collect()
        }
    };
    if years.is_empty() {
        return Err(invalid("no valid years".to_string()));
    }
    let mut unique = HashSet::new();
    for year in &years {
        if year.len() != 4 || !year.chars().all(|ch| ch.is_ascii_digit()) {
            return Err(invalid(format!("invalid year: {year}")));
        }
        if !unique.insert(year.as_str()) {
            return Err(invalid(format!("duplicate year: {year}")));
        }
    }

    let months = entry
        .months
        .as_ref()
        .unwrap_or(&Selection::All)
        .normalized(12)
        .map_err(|reason| invalid(format!("months: {reason}")))?;
    let days = entry
        .days
        .as_ref()
        .map(|days| days.normalized(31))
        .transpose()
        .map_err(|reason| invalid(format!("days: {reason}")))?;

    let template = RequestSpec {
        dataset: entry
            .dataset
            .clone()
            .unwrap_or_else(|| default_dataset.to_string()),
        variable: variables[0].clone(),
        level: entry.level.unwrap_or(ProcessingLevel::Level2),
        sensor: entry.sensor.clone(),
        year: YearSpec::Set(years.clone()),
        months,
        days,
        version: entry.version.clone().unwrap_or_else(|| "latest".to_string()),
        format: entry.format.unwrap_or_default(),
        style: entry.style.unwrap_or_default(),
        extra: entry.extra.clone(),
    };
    template.validate()?;

    Ok(SensorConfig {
        category: entry.category.clone().unwrap_or_else(|| variables[0].clone()),
        name: entry.name,
        variables,
        years,
        template,
    })
}

/// Process environment needed to reach the archive and the object store.
#[derive(Debug, Clone)]
pub struct Settings {
    pub archive_url: String,
    pub archive_key: String,
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub timeout: Duration,
}

impl Settings {
    pub fn from_env(bucket: Option<String>) -> Result<Self, HarvestError> {
        dotenvy::dotenv().ok();

        let rc = BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".cdsapirc"))
            .and_then(|path| fs::read_to_string(path).ok())
            .map(|content| parse_cdsapirc(&content))
            .unwrap_or_default();

        let archive_url = non_empty_var("CDSAPI_URL")
            .or(rc.url)
            .unwrap_or_else(|| DEFAULT_ARCHIVE_URL.to_string());
        let archive_key = non_empty_var("CDSAPI_KEY").or(rc.key).ok_or_else(|| {
            HarvestError::MissingCredentials("archive API key (CDSAPI_KEY)".to_string())
        })?;
        let bucket = bucket
            .filter(|value| !value.trim().is_empty())
            .or_else(|| non_empty_var("CDS_HARVEST_BUCKET"))
            .ok_or_else(|| {
                HarvestError::MissingCredentials(
                    "object store bucket (CDS_HARVEST_BUCKET)".to_string(),
                )
            })?;
        let region = non_empty_var("AWS_REGION").unwrap_or_else(|| "us-east-1".to_string());
        let timeout = non_empty_var("CDS_HARVEST_TIMEOUT_SECS")
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(600);

        Ok(Self {
            archive_url,
            archive_key,
            bucket,
            region,
            endpoint: non_empty_var("AWS_ENDPOINT_URL"),
            timeout: Duration::from_secs(timeout),
        })
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ArchiveRc {
    pub url: Option<String>,
    pub key: Option<String>,
}

/// Parses the `url:` / `key:` lines of a `.cdsapirc` file.
pub fn parse_cdsapirc(content: &str) -> ArchiveRc {
    let mut rc = ArchiveRc::default();
    for line in content.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match name.trim() {
            "url" => rc.url = Some(value.to_string()),
            "key" => rc.key = Some(value.to_string()),
            _ => {}
        }
    }
    rc
}
