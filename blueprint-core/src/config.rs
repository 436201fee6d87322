//! Configuration types
//!
//! Every component config has sane defaults, `with_*` builders, an
//! environment loader (`BLUEPRINT_*` variables) and a TOML loader on the
//! top-level [`BlueprintConfig`]. Durations are written in milliseconds.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default name of the type discriminator field.
pub const DEFAULT_TYPENAME_FIELD: &str = "__typename";

/// Default name of the identity field.
pub const DEFAULT_ID_FIELD: &str = "id";

const DEFAULT_PREFETCH_INTERVAL_MS: u64 = 60_000;
const DEFAULT_PREFETCH_LIMIT: usize = 5;
const DEFAULT_FETCH_TIMEOUT_MS: u64 = 30_000;

// ============================================================================
// STORE
// ============================================================================

/// Normalized store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Field carrying the entity type discriminator.
    pub typename_field: String,
    /// Field carrying the entity id.
    pub id_field: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            typename_field: DEFAULT_TYPENAME_FIELD.to_string(),
            id_field: DEFAULT_ID_FIELD.to_string(),
        }
    }
}

impl StoreConfig {
    pub fn with_typename_field(mut self, field: impl Into<String>) -> Self {
        self.typename_field = field.into();
        self
    }

    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = field.into();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.typename_field.is_empty() {
            return Err(invalid("store.typename_field", "", "must not be empty"));
        }
        if self.id_field.is_empty() {
            return Err(invalid("store.id_field", "", "must not be empty"));
        }
        if self.typename_field == self.id_field {
            return Err(invalid(
                "store.id_field",
                &self.id_field,
                "must differ from typename_field",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// TRACKER
// ============================================================================

/// Access tracker settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Upper bound on retained access records; oldest are dropped first.
    /// `None` keeps the full log.
    pub max_records: Option<usize>,
}

impl TrackerConfig {
    pub fn with_max_records(mut self, max: usize) -> Self {
        self.max_records = Some(max);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_records == Some(0) {
            return Err(invalid("tracker.max_records", "0", "must be at least 1"));
        }
        Ok(())
    }
}

// ============================================================================
// QUERY
// ============================================================================

/// Query manager settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Stale time applied when a subscription does not set its own.
    #[serde(rename = "default_stale_time_ms", with = "option_duration_ms")]
    pub default_stale_time: Option<Duration>,
    /// Upper bound on a single transport call.
    #[serde(rename = "fetch_timeout_ms", with = "option_duration_ms")]
    pub fetch_timeout: Option<Duration>,
    /// Whether `clear` also collects orphaned store entries.
    pub gc_on_clear: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_stale_time: None,
            fetch_timeout: Some(Duration::from_millis(DEFAULT_FETCH_TIMEOUT_MS)),
            gc_on_clear: true,
        }
    }
}

impl QueryConfig {
    pub fn with_default_stale_time(mut self, stale_time: Duration) -> Self {
        self.default_stale_time = Some(stale_time);
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_gc_on_clear(mut self, enabled: bool) -> Self {
        self.gc_on_clear = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_stale_time == Some(Duration::ZERO) {
            return Err(invalid("query.default_stale_time_ms", "0", "must be positive"));
        }
        if self.fetch_timeout == Some(Duration::ZERO) {
            return Err(invalid("query.fetch_timeout_ms", "0", "must be positive"));
        }
        Ok(())
    }
}

// ============================================================================
// PREFETCH
// ============================================================================

/// Predictive prefetcher settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Time between prefetch cycles.
    #[serde(rename = "interval_ms", with = "duration_ms")]
    pub interval: Duration,
    /// Number of top-ranked entities considered per cycle.
    pub limit: usize,
    /// Entity types the prefetcher is allowed to warm.
    pub supported_types: Vec<String>,
    /// Quiet period before a hover prefetch fires. Zero fires immediately.
    #[serde(rename = "hover_delay_ms", with = "duration_ms")]
    pub hover_delay: Duration,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_PREFETCH_INTERVAL_MS),
            limit: DEFAULT_PREFETCH_LIMIT,
            supported_types: vec![
                "Component".to_string(),
                "ADR".to_string(),
                "Team".to_string(),
                "Environment".to_string(),
            ],
            hover_delay: Duration::ZERO,
        }
    }
}

impl PrefetchConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_supported_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.supported_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_hover_delay(mut self, delay: Duration) -> Self {
        self.hover_delay = delay;
        self
    }

    pub fn supports(&self, entity_type: &str) -> bool {
        self.supported_types.iter().any(|t| t == entity_type)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(invalid("prefetch.interval_ms", "0", "must be positive"));
        }
        if self.limit == 0 {
            return Err(invalid("prefetch.limit", "0", "must be at least 1"));
        }
        Ok(())
    }
}

// ============================================================================
// MASTER CONFIG
// ============================================================================

/// Master configuration struct.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlueprintConfig {
    pub store: StoreConfig,
    pub tracker: TrackerConfig,
    pub query: QueryConfig,
    pub prefetch: PrefetchConfig,
}

impl BlueprintConfig {
    /// Parse a TOML document. Missing sections and fields take defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Create config from environment variables.
    ///
    /// # Environment Variables
    /// - `BLUEPRINT_TYPENAME_FIELD`, `BLUEPRINT_ID_FIELD`
    /// - `BLUEPRINT_TRACKER_MAX_RECORDS`
    /// - `BLUEPRINT_STALE_TIME_MS`, `BLUEPRINT_FETCH_TIMEOUT_MS`, `BLUEPRINT_GC_ON_CLEAR`
    /// - `BLUEPRINT_PREFETCH_INTERVAL_MS`, `BLUEPRINT_PREFETCH_LIMIT`,
    ///   `BLUEPRINT_PREFETCH_TYPES` (comma separated), `BLUEPRINT_HOVER_DELAY_MS`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build config from an arbitrary variable lookup, starting from defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(field) = lookup("BLUEPRINT_TYPENAME_FIELD") {
            config.store.typename_field = field;
        }
        if let Some(field) = lookup("BLUEPRINT_ID_FIELD") {
            config.store.id_field = field;
        }
        if let Some(max) = parse_var::<usize, _>(&lookup, "BLUEPRINT_TRACKER_MAX_RECORDS")? {
            config.tracker.max_records = Some(max);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "BLUEPRINT_STALE_TIME_MS")? {
            config.query.default_stale_time = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "BLUEPRINT_FETCH_TIMEOUT_MS")? {
            // 0 disables the timeout
            config.query.fetch_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(flag) = lookup("BLUEPRINT_GC_ON_CLEAR") {
            config.query.gc_on_clear = !matches!(flag.to_lowercase().as_str(), "false" | "0");
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "BLUEPRINT_PREFETCH_INTERVAL_MS")? {
            config.prefetch.interval = Duration::from_millis(ms);
        }
        if let Some(limit) = parse_var::<usize, _>(&lookup, "BLUEPRINT_PREFETCH_LIMIT")? {
            config.prefetch.limit = limit;
        }
        if let Some(types) = lookup("BLUEPRINT_PREFETCH_TYPES") {
            config.prefetch.supported_types = types
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "BLUEPRINT_HOVER_DELAY_MS")? {
            config.prefetch.hover_delay = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.store.validate()?;
        self.tracker.validate()?;
        self.query.validate()?;
        self.prefetch.validate()
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(name, &raw, &e.to_string())),
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        let config = BlueprintConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.store.typename_field, "__typename");
        assert_eq!(config.store.id_field, "id");
        assert!(config.prefetch.supports("Component"));
        assert!(!config.prefetch.supports("Instance"));
    }

    #[test]
    fn test_toml_partial_document() {
        let config = BlueprintConfig::from_toml_str(
            r#"
            [query]
            default_stale_time_ms = 1000

            [prefetch]
            interval_ms = 500
            limit = 2
            supported_types = ["Component", "ADR"]
            "#,
        )
        .unwrap();

        assert_eq!(config.query.default_stale_time, Some(Duration::from_secs(1)));
        assert_eq!(config.prefetch.interval, Duration::from_millis(500));
        assert_eq!(config.prefetch.limit, 2);
        assert_eq!(config.prefetch.supported_types, vec!["Component", "ADR"]);
        assert_eq!(config.store, StoreConfig::default());
    }

    #[test]
    fn test_toml_rejects_invalid_values() {
        let err = BlueprintConfig::from_toml_str("[prefetch]\nlimit = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = BlueprintConfig::from_toml_str("[prefetch\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_from_lookup_reads_variables() {
        let vars: HashMap<&str, &str> = [
            ("BLUEPRINT_TYPENAME_FIELD", "kind"),
            ("BLUEPRINT_TRACKER_MAX_RECORDS", "100"),
            ("BLUEPRINT_FETCH_TIMEOUT_MS", "0"),
            ("BLUEPRINT_GC_ON_CLEAR", "false"),
            ("BLUEPRINT_PREFETCH_TYPES", "Component, Team ,"),
        ]
        .into_iter()
        .collect();

        let config =
            BlueprintConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string())).unwrap();

        assert_eq!(config.store.typename_field, "kind");
        assert_eq!(config.tracker.max_records, Some(100));
        assert_eq!(config.query.fetch_timeout, None);
        assert!(!config.query.gc_on_clear);
        assert_eq!(config.prefetch.supported_types, vec!["Component", "Team"]);
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let result = BlueprintConfig::from_lookup(|name| {
            (name == "BLUEPRINT_PREFETCH_LIMIT").then(|| "many".to_string())
        });
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_store_config_requires_distinct_fields() {
        let config = StoreConfig::default().with_id_field("__typename");
        assert!(config.validate().is_err());
        assert!(TrackerConfig::default().with_max_records(0).validate().is_err());
    }
}
