use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

pub const DEFAULT_PREFIX: &str = "climate-data";
pub const DEFAULT_OBJECT_NAME: &str = "data";
pub const DEFAULT_EXTENSION: &str = "zip";

/// Which segments appear between the prefix and the year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyLayout {
    /// `<prefix>/<sensor>/<year>[/<suffix>].<ext>`
    ///
    /// The category is validated but not part of the key, so two categories
    /// of the same sensor and year share one key. Catalog resolution rejects
    /// such collisions.
    #[default]
    SensorYear,
    /// `<prefix>/<category>/<sensor>/<year>[/<suffix>].<ext>`
    CategorySensorYear,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct StorageKey(String);

impl StorageKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pure mapping from request coordinates to object-store keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDeriver {
    prefix: String,
    layout: KeyLayout,
    object_name: Option<String>,
    extension: String,
}

impl KeyDeriver {
    pub fn new(prefix: &str, layout: KeyLayout) -> Result<Self, HarvestError> {
        let prefix = prefix.trim_matches('/');
        check_component("prefix", prefix, true)?;
        Ok(Self {
            prefix: prefix.to_string(),
            layout,
            object_name: Some(DEFAULT_OBJECT_NAME.to_string()),
            extension: DEFAULT_EXTENSION.to_string(),
        })
    }

    /// Object name appended below the year; `None` turns the year itself into the file name.
    pub fn with_object_name(mut self, object_name: Option<String>) -> Self {
        if let Some(name) = object_name {
            let name = name.trim().to_string();
            self.object_name = (!name.is_empty()).then_some(name);
        }
        self
    }

    pub fn without_object_name(mut self) -> Self {
        self.object_name = None;
        self
    }

    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = extension.trim_start_matches('.').to_string();
        self
    }

    pub fn layout(&self) -> KeyLayout {
        self.layout
    }

    pub fn object_name(&self) -> Option<&str> {
        self.object_name.as_deref()
    }

    pub fn derive(
        &self,
        category: &str,
        sensor: &str,
        year: &str,
        suffix: Option<&str>,
    ) -> Result<StorageKey, HarvestError> {
        check_component("category", category, false)?;
        check_component("sensor", sensor, false)?;
        check_component("year", year, false)?;
        if let Some(suffix) = suffix {
            check_component("suffix", suffix, false)?;
        }

        let mut key = self.prefix.clone();
        if self.layout == KeyLayout::CategorySensorYear {
            key.push('/');
            key.push_str(category);
        }
        key.push('/');
        key.push_str(sensor);
        key.push('/');
        key.push_str(year);
        if let Some(suffix) = suffix {
            key.push('/');
            key.push_str(suffix);
        }
        key.push('.');
        key.push_str(&self.extension);
        Ok(StorageKey(key))
    }

    /// Derives with the configured object name as suffix.
    pub fn derive_default(
        &self,
        category: &str,
        sensor: &str,
        year: &str,
    ) -> Result<StorageKey, HarvestError> {
        self.derive(category, sensor, year, self.object_name.as_deref())
    }
}

fn check_component(
    component: &'static str,
    value: &str,
    allow_slash: bool,
) -> Result<(), HarvestError> {
    let reject = |reason: &str| HarvestError::InvalidKeyComponent {
        component,
        reason: reason.to_string(),
    };
    if value.trim().is_empty() {
        return Err(reject("empty"));
    }
    if value != value.trim() {
        return Err(reject("surrounding whitespace"));
    }
    if !allow_slash && value.contains('/') {
        return Err(reject("contains '/'"));
    }
    if value.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..") {
        return Err(reject("empty or relative path segment"));
    }
    Ok(())
}
