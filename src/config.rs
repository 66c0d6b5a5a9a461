//! Configuration
//!
//! The object-class catalog and I/O tuning, loaded from YAML or JSON.
//!
//! ```yaml
//! classes:
//!   - id: 2
//!     name: EC_4P2
//!     data_targets: 4
//!     parity_targets: 2
//!     cell_records: 65536
//! io:
//!   shard_timeout: 5s
//!   max_fetch_retries: 3
//!   fetch_retry_backoff: 50ms
//!   max_concurrent_recovery: 4
//!   layout_version: 1
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ec::geometry::Geometry;
use crate::error::{Error, Result};

/// Default cell length of the built-in classes, in records
pub const DEFAULT_CELL_RECORDS: u64 = 65536;

// =============================================================================
// Object Classes
// =============================================================================

/// One entry of the object-class catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassConfig {
    pub id: u32,
    pub name: String,
    pub data_targets: u32,
    pub parity_targets: u32,
    #[serde(default = "default_cell_records")]
    pub cell_records: u64,
}

fn default_cell_records() -> u64 {
    DEFAULT_CELL_RECORDS
}

impl ClassConfig {
    pub fn new(id: u32, name: impl Into<String>, data_targets: u32, parity_targets: u32) -> Self {
        Self {
            id,
            name: name.into(),
            data_targets,
            parity_targets,
            cell_records: DEFAULT_CELL_RECORDS,
        }
    }

    pub fn geometry(&self) -> Result<Geometry> {
        Geometry::new(self.data_targets, self.parity_targets, self.cell_records)
    }
}

// =============================================================================
// I/O Tuning
// =============================================================================

/// Dispatch, retry and recovery tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    /// Deadline of one shard operation
    #[serde(with = "duration_str")]
    pub shard_timeout: Duration,
    /// Fetch re-issues after a detected concurrent write
    pub max_fetch_retries: u32,
    #[serde(with = "duration_str")]
    pub fetch_retry_backoff: Duration,
    /// Recovery tasks running at once per fetch
    pub max_concurrent_recovery: usize,
    /// Target rotation scheme
    pub layout_version: u16,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            shard_timeout: Duration::from_secs(5),
            max_fetch_retries: 3,
            fetch_retry_backoff: Duration::ZERO,
            max_concurrent_recovery: 4,
            layout_version: 1,
        }
    }
}

// =============================================================================
// Top-Level Config
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcConfig {
    #[serde(default = "builtin_classes")]
    pub classes: Vec<ClassConfig>,
    #[serde(default)]
    pub io: IoConfig,
}

/// The classes shipped with the crate
pub fn builtin_classes() -> Vec<ClassConfig> {
    vec![
        ClassConfig::new(1, "EC_2P1", 2, 1),
        ClassConfig::new(2, "EC_4P2", 4, 2),
        ClassConfig::new(3, "EC_8P2", 8, 2),
        ClassConfig::new(4, "EC_16P2", 16, 2),
    ]
}

impl Default for EcConfig {
    fn default() -> Self {
        Self {
            classes: builtin_classes(),
            io: IoConfig::default(),
        }
    }
}

impl EcConfig {
    /// Load from a file, YAML unless the extension is `.json`
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&text)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?,
            _ => serde_yaml::from_str(&text)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?,
        };
        config.validate()?;
        info!(
            "Loaded {} object classes from {}",
            config.classes.len(),
            path.display()
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        for class in &self.classes {
            if !ids.insert(class.id) {
                return Err(Error::Config(format!("duplicate class id {}", class.id)));
            }
            if !names.insert(class.name.as_str()) {
                return Err(Error::Config(format!("duplicate class name {}", class.name)));
            }
            class.geometry()?;
        }
        if self.io.max_concurrent_recovery == 0 {
            return Err(Error::Config(
                "max_concurrent_recovery must be greater than 0".into(),
            ));
        }
        if self.io.shard_timeout.is_zero() {
            return Err(Error::Config("shard_timeout must be greater than 0".into()));
        }
        Ok(())
    }

    pub fn class_by_name(&self, name: &str) -> Option<&ClassConfig> {
        self.classes.iter().find(|c| c.name == name)
    }
}

// =============================================================================
// Duration Parsing
// =============================================================================

/// Parse a duration string such as `250ms`, `30s`, `5m`, `1h` or `1m30s`
///
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total = Duration::ZERO;
    let mut chars = s.chars().peekable();
    while chars.peek().is_some() {
        let mut num_buf = String::new();
        while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
            num_buf.push(c);
            chars.next();
        }
        let mut unit = String::new();
        while let Some(c) = chars.peek().copied().filter(char::is_ascii_alphabetic) {
            unit.push(c.to_ascii_lowercase());
            chars.next();
        }
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;

        let part = match unit.as_str() {
            "ms" => Duration::from_millis(num),
            "s" | "" => Duration::from_secs(num),
            "m" => Duration::from_secs(num * 60),
            "h" => Duration::from_secs(num * 3600),
            other => {
                return Err(Error::DurationParse(format!(
                    "unknown duration unit: {}",
                    other
                )))
            }
        };
        total += part;
    }
    Ok(total)
}

/// Render a duration the way [`parse_duration`] reads it
pub fn format_duration(d: Duration) -> String {
    if d.subsec_millis() != 0 || d.as_secs() == 0 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{}s", d.as_secs())
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(d)?;
        super::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    // =========================================================================
    // parse_duration Tests
    // =========================================================================

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1H").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn test_parse_duration_combined() {
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(
            parse_duration("1s500ms").unwrap(),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert_matches!(parse_duration(""), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("5x"), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("ms"), Err(Error::DurationParse(_)));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(5)), "5s");
        assert_eq!(format_duration(Duration::from_millis(50)), "50ms");
        assert_eq!(format_duration(Duration::ZERO), "0ms");
    }

    // =========================================================================
    // EcConfig Tests
    // =========================================================================

    #[test]
    fn test_default_catalog() {
        let config = EcConfig::default();
        config.validate().unwrap();
        let names: Vec<_> = config.classes.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["EC_2P1", "EC_4P2", "EC_8P2", "EC_16P2"]);
        assert!(config.classes.iter().all(|c| c.cell_records == 65536));
        assert_eq!(config.io.layout_version, 1);
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let mut config = EcConfig::default();
        config.classes.push(ClassConfig::new(2, "OTHER", 2, 1));
        assert_matches!(config.validate(), Err(Error::Config(_)));

        let mut config = EcConfig::default();
        config.classes.push(ClassConfig::new(9, "EC_4P2", 2, 1));
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_validate_rejects_bad_geometry_and_concurrency() {
        let mut config = EcConfig::default();
        config.classes.push(ClassConfig::new(9, "BAD", 0, 1));
        assert_matches!(config.validate(), Err(Error::InvalidEcConfig(_)));

        let mut config = EcConfig::default();
        config.io.max_concurrent_recovery = 0;
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_yaml_with_defaults() {
        let yaml = r#"
classes:
  - id: 7
    name: EC_3P1
    data_targets: 3
    parity_targets: 1
    cell_records: 16
io:
  shard_timeout: 250ms
  max_fetch_retries: 1
"#;
        let config: EcConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.classes.len(), 1);
        assert_eq!(config.io.shard_timeout, Duration::from_millis(250));
        assert_eq!(config.io.max_fetch_retries, 1);
        assert_eq!(config.io.max_concurrent_recovery, 4);
    }

    #[test]
    fn test_json_roundtrip() {
        let config = EcConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"shard_timeout\":\"5s\""));
        let back: EcConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_load_by_extension() {
        let dir = std::env::temp_dir().join(format!("ecobj-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();

        let json = dir.join("ec.json");
        std::fs::write(&json, r#"{"classes":[{"id":1,"name":"A","data_targets":2,"parity_targets":1}]}"#)
            .unwrap();
        let config = EcConfig::load(&json).unwrap();
        assert_eq!(config.classes[0].cell_records, DEFAULT_CELL_RECORDS);

        let yaml = dir.join("ec.yaml");
        std::fs::write(&yaml, "classes: []\nio:\n  max_concurrent_recovery: 0\n").unwrap();
        assert_matches!(EcConfig::load(&yaml), Err(Error::Config(_)));

        assert_matches!(EcConfig::load(dir.join("missing.yaml")), Err(Error::Io(_)));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
