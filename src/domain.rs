use std::collections::BTreeMap;
use std::fmt;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::HarvestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingLevel {
    #[serde(rename = "level_2")]
    Level2,
    #[serde(rename = "level_3")]
    Level3,
}

impl ProcessingLevel {
    /// Level-3 products are merged multi-sensor aggregates.
    pub fn is_aggregated(self) -> bool {
        matches!(self, ProcessingLevel::Level3)
    }
}

impl fmt::Display for ProcessingLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessingLevel::Level2 => write!(f, "level_2"),
            ProcessingLevel::Level3 => write!(f, "level_3"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Zip,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Zip => "zip",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.extension())
    }
}

/// Field naming used by the archive dataset a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStyle {
    #[default]
    SatelliteCarbonDioxide,
    Agroproductivity,
}

/// Month or day enumeration: the archive's `"all"` sentinel or an explicit list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSelection", into = "RawSelection")]
pub enum Selection {
    All,
    Values(Vec<String>),
}

#[doc(hidden)]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawSelection {
    Word(String),
    List(Vec<String>),
}

impl TryFrom<RawSelection> for Selection {
    type Error = String;

    fn try_from(raw: RawSelection) -> Result<Self, Self::Error> {
        match raw {
            RawSelection::Word(word) if word == "all" => Ok(Selection::All),
            RawSelection::Word(word) => Ok(Selection::Values(vec![word])),
            RawSelection::List(values) => Ok(Selection::Values(values)),
        }
    }
}

impl From<Selection> for RawSelection {
    fn from(value: Selection) -> Self {
        match value {
            Selection::All => RawSelection::Word("all".to_string()),
            Selection::Values(values) => RawSelection::List(values),
        }
    }
}

impl Selection {
    /// Normalises every value to a zero-padded two digit string within `1..=max`.
    pub fn normalized(&self, max: u32) -> Result<Selection, String> {
        match self {
            Selection::All => Ok(Selection::All),
            Selection::Values(values) => {
                if values.is_empty() {
                    return Err("empty list (use \"all\" instead)".to_string());
                }
                let mut out = Vec::with_capacity(values.len());
                for value in values {
                    let number: u32 = value
                        .trim()
                        .parse()
                        .map_err(|_| format!("not a number: {value}"))?;
                    if number == 0 || number > max {
                        return Err(format!("{value} outside 01..{max:02}"));
                    }
                    out.push(format!("{number:02}"));
                }
                Ok(Selection::Values(out))
            }
        }
    }

    fn bounds(&self, max: u32) -> (u32, u32) {
        match self {
            Selection::All => (1, max),
            Selection::Values(values) => {
                let numbers = values
                    .iter()
                    .filter_map(|value| value.parse::<u32>().ok())
                    .collect::<Vec<_>>();
                let low = numbers.iter().copied().min().unwrap_or(1);
                let high = numbers.iter().copied().max().unwrap_or(max);
                (low, high)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum YearSpec {
    Single(String),
    Set(Vec<String>),
}

impl YearSpec {
    pub fn as_single(&self) -> Option<&str> {
        match self {
            YearSpec::Single(year) => Some(year),
            YearSpec::Set(years) if years.len() == 1 => Some(&years[0]),
            YearSpec::Set(_) => None,
        }
    }
}

/// One fully materialised archive request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSpec {
    pub dataset: String,
    pub variable: String,
    pub level: ProcessingLevel,
    pub sensor: String,
    pub year: YearSpec,
    pub months: Selection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days: Option<Selection>,
    pub version: String,
    #[serde(default)]
    pub format: OutputFormat,
    #[serde(default)]
    pub style: RequestStyle,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl RequestSpec {
    /// Day filtering is only meaningful for per-observation products.
    pub fn validate(&self) -> Result<(), HarvestError> {
        let invalid = |reason: String| HarvestError::InvalidRequest {
            sensor: self.sensor.clone(),
            reason,
        };
        if self.dataset.trim().is_empty() {
            return Err(invalid("dataset is empty".to_string()));
        }
        if self.variable.trim().is_empty() {
            return Err(invalid("variable is empty".to_string()));
        }
        if self.sensor.trim().is_empty() {
            return Err(invalid("sensor is empty".to_string()));
        }
        if self.level.is_aggregated() && matches!(self.days, Some(Selection::Values(_))) {
            return Err(invalid(format!(
                "{} products are pre-aggregated; days must be omitted or \"all\"",
                self.level
            )));
        }
        Ok(())
    }

    /// Body sent to the archive's `execute` endpoint under `inputs`.
    pub fn to_inputs(&self) -> Value {
        let mut inputs = Map::new();
        inputs.insert("variable".to_string(), Value::from(self.variable.clone()));
        match self.style {
            RequestStyle::SatelliteCarbonDioxide => {
                inputs.insert(
                    "processing_level".to_string(),
                    Value::from(self.level.to_string()),
                );
                inputs.insert(
                    "sensor_and_algorithm".to_string(),
                    Value::from(self.sensor.clone()),
                );
                inputs.insert("version".to_string(), Value::from(self.version.clone()));
            }
            RequestStyle::Agroproductivity => {
                inputs.insert("crop_type".to_string(), Value::from(self.sensor.clone()));
            }
        }
        inputs.insert("year".to_string(), year_value(&self.year));
        inputs.insert("month".to_string(), selection_value(&self.months));
        if let Some(days) = &self.days {
            inputs.insert("day".to_string(), selection_value(days));
        }
        inputs.insert("format".to_string(), Value::from(self.format.to_string()));
        for (key, value) in &self.extra {
            inputs.insert(key.clone(), value.clone());
        }
        Value::Object(inputs)
    }
}

fn year_value(year: &YearSpec) -> Value {
    match year {
        YearSpec::Single(year) => Value::from(year.clone()),
        YearSpec::Set(years) => Value::from(years.clone()),
    }
}

fn selection_value(selection: &Selection) -> Value {
    match selection {
        Selection::All => Value::from("all"),
        Selection::Values(values) => Value::from(values.clone()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub start: String,
    pub end: String,
}

impl DateRange {
    /// Inclusive calendar bounds covered by `months`/`days` within `year`.
    pub fn for_year(
        year: &str,
        months: &Selection,
        days: Option<&Selection>,
    ) -> Result<DateRange, HarvestError> {
        let invalid = |reason: String| HarvestError::InvalidRequest {
            sensor: String::new(),
            reason,
        };
        let year_number: i32 = year
            .parse()
            .map_err(|_| invalid(format!("invalid year: {year}")))?;
        let (start_month, end_month) = months.bounds(12);
        let (start_day, end_day) = days.map(|days| days.bounds(31)).unwrap_or((1, 31));

        let start = NaiveDate::from_ymd_opt(year_number, start_month, start_day)
            .ok_or_else(|| invalid(format!("invalid start date in {year}")))?;
        let last_of_month = last_day_of_month(year_number, end_month)
            .ok_or_else(|| invalid(format!("invalid end month in {year}")))?;
        let end = NaiveDate::from_ymd_opt(year_number, end_month, end_day.min(last_of_month.day()))
            .ok_or_else(|| invalid(format!("invalid end date in {year}")))?;

        Ok(DateRange {
            start: start.format("%Y-%m-%d").to_string(),
            end: end.format("%Y-%m-%d").to_string(),
        })
    }
}

fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1).and_then(|date| date.pred_opt())
}

/// One cell of the sensors x years x variables product.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Combination {
    pub sensor_name: String,
    pub variable: String,
    pub year: String,
}

impl fmt::Display for Combination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.sensor_name, self.variable, self.year)
    }
}
