//! Settings for the attachment core
//!
//! Settings are read from a JSON object. For each key the parser tells three
//! situations apart:
//! - key absent: use the default
//! - key present with `null`: configuration error (defaults must be picked by omission)
//! - key present with an empty or unrecognized value: validation error
//!
//! `cache_directory` is the one exception, where `null` also means "use the default".

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::{Map, Value};

use crate::compression::Compression;
use crate::digest::DigestAlgorithm;
use crate::error::{AttachmentError, Result};

/// Settings file name inside the config directory
pub const SETTINGS_FILE: &str = "settings.json";

/// Default maximum cache entry age
pub const DEFAULT_CACHE_MAX_AGE_HOURS: u64 = 24;

/// Default cache size budget (1 GiB)
pub const DEFAULT_CACHE_MAX_SIZE: u64 = 1024 * 1024 * 1024;

/// Where the attachment database lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    /// Private in-memory database, gone when the store is dropped
    Memory,
    /// SQLite database file
    File(PathBuf),
}

impl FromStr for DatabaseLocation {
    type Err = AttachmentError;

    /// Accepts `:memory:`, a plain path, or an SQLAlchemy-style
    /// `sqlite:///relative.db` / `sqlite:////absolute.db` URL.
    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(AttachmentError::invalid("database_location is empty"));
        }

        let path = match s.split_once("://") {
            Some(("sqlite", rest)) => rest.strip_prefix('/').unwrap_or(rest),
            Some((scheme, _)) => {
                return Err(AttachmentError::invalid(format!(
                    "unsupported database scheme {scheme:?}, only sqlite is available"
                )));
            }
            None => s,
        };

        match path {
            "" | ":memory:" => Ok(DatabaseLocation::Memory),
            path => Ok(DatabaseLocation::File(PathBuf::from(path))),
        }
    }
}

impl fmt::Display for DatabaseLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseLocation::Memory => f.write_str(":memory:"),
            DatabaseLocation::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Settings shared by every attachment component
#[derive(Debug, Clone)]
pub struct Settings {
    /// Digest used when a call doesn't name one
    pub digest_algorithm: DigestAlgorithm,
    /// Codec used when a call doesn't name one
    pub compression: Compression,
    /// Root of the decompressed cache
    pub cache_directory: PathBuf,
    /// Cache entries older than this are pruned
    pub cache_max_age: chrono::Duration,
    /// Pruning evicts oldest entries while the cache exceeds this many bytes
    pub cache_max_size: u64,
    pub database_location: DatabaseLocation,
    /// Re-hash cached files on every read instead of only when warming
    pub verify_cache_reads: bool,
}

/// Lookup result that keeps "absent" and "null" apart
enum Setting<'a> {
    Absent,
    Null,
    Present(&'a Value),
}

fn lookup<'a>(map: &'a Map<String, Value>, key: &str) -> Setting<'a> {
    match map.get(key) {
        None => Setting::Absent,
        Some(Value::Null) => Setting::Null,
        Some(value) => Setting::Present(value),
    }
}

fn null_error(key: &str) -> AttachmentError {
    AttachmentError::config(format!(
        "{key} must not be null; remove the key to use the default"
    ))
}

fn expect_str<'a>(key: &str, value: &'a Value) -> Result<&'a str> {
    value
        .as_str()
        .ok_or_else(|| AttachmentError::invalid(format!("{key} must be a string, got {value}")))
}

/// Accepts a non-negative integer or a string holding one
fn parse_count(key: &str, value: &Value) -> Result<u64> {
    match value {
        Value::Number(n) => n.as_u64().ok_or_else(|| {
            AttachmentError::invalid(format!("{key} must be a non-negative integer, got {n}"))
        }),
        Value::String(s) if s.trim().is_empty() => {
            Err(AttachmentError::invalid(format!("{key} is empty")))
        }
        Value::String(s) => s.trim().parse().map_err(|_| {
            AttachmentError::invalid(format!("{key} must be a non-negative integer, got {s:?}"))
        }),
        other => Err(AttachmentError::invalid(format!(
            "{key} must be an integer, got {other}"
        ))),
    }
}

/// Cache directory used when none is configured
pub fn default_cache_directory() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("attachments")
}

impl Settings {
    /// Settings with every default and the given database
    pub fn new(database_location: DatabaseLocation) -> Self {
        Self {
            digest_algorithm: DigestAlgorithm::default(),
            compression: Compression::default(),
            cache_directory: default_cache_directory(),
            cache_max_age: chrono::Duration::hours(DEFAULT_CACHE_MAX_AGE_HOURS as i64),
            cache_max_size: DEFAULT_CACHE_MAX_SIZE,
            database_location,
            verify_cache_reads: false,
        }
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_digest_algorithm(mut self, digest_algorithm: DigestAlgorithm) -> Self {
        self.digest_algorithm = digest_algorithm;
        self
    }

    pub fn with_cache_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_directory = dir.into();
        self
    }

    pub fn with_cache_max_age(mut self, max_age: chrono::Duration) -> Self {
        self.cache_max_age = max_age;
        self
    }

    pub fn with_cache_max_size(mut self, max_size: u64) -> Self {
        self.cache_max_size = max_size;
        self
    }

    pub fn with_verify_cache_reads(mut self, verify: bool) -> Self {
        self.verify_cache_reads = verify;
        self
    }

    /// Parse settings from a JSON object.
    ///
    /// The cache directory is created as part of validation; failing to
    /// create it is a configuration error.
    pub fn from_map(map: &Map<String, Value>) -> Result<Self> {
        const KNOWN: [&str; 7] = [
            "digest_algorithm",
            "compression",
            "cache_directory",
            "cache_max_age_hours",
            "cache_max_size",
            "database_location",
            "verify_cache_reads",
        ];
        for key in map.keys().filter(|k| !KNOWN.contains(&k.as_str())) {
            log::warn!("[ATTACH] Ignoring unknown setting {key:?}");
        }

        let database_location = match lookup(map, "database_location") {
            Setting::Absent => {
                return Err(AttachmentError::config("database_location is required"));
            }
            Setting::Null => return Err(null_error("database_location")),
            Setting::Present(value) => expect_str("database_location", value)?.parse()?,
        };

        let mut settings = Settings::new(database_location);

        match lookup(map, "digest_algorithm") {
            Setting::Absent => {}
            Setting::Null => return Err(null_error("digest_algorithm")),
            Setting::Present(value) => {
                settings.digest_algorithm = expect_str("digest_algorithm", value)?.parse()?;
            }
        }

        match lookup(map, "compression") {
            Setting::Absent => {}
            Setting::Null => return Err(null_error("compression")),
            Setting::Present(value) => {
                settings.compression = expect_str("compression", value)?.parse()?;
            }
        }

        if let Setting::Present(value) = lookup(map, "cache_directory") {
            let dir = expect_str("cache_directory", value)?;
            if dir.is_empty() {
                return Err(AttachmentError::invalid("cache_directory is empty"));
            }
            settings.cache_directory = PathBuf::from(dir);
        }

        match lookup(map, "cache_max_age_hours") {
            Setting::Absent => {}
            Setting::Null => return Err(null_error("cache_max_age_hours")),
            Setting::Present(value) => {
                let hours = parse_count("cache_max_age_hours", value)?;
                let hours = i64::try_from(hours).map_err(|_| {
                    AttachmentError::invalid(format!("cache_max_age_hours {hours} is too large"))
                })?;
                settings.cache_max_age = chrono::Duration::try_hours(hours).ok_or_else(|| {
                    AttachmentError::invalid(format!("cache_max_age_hours {hours} is too large"))
                })?;
            }
        }

        match lookup(map, "cache_max_size") {
            Setting::Absent => {}
            Setting::Null => return Err(null_error("cache_max_size")),
            Setting::Present(value) => {
                settings.cache_max_size = parse_count("cache_max_size", value)?;
            }
        }

        match lookup(map, "verify_cache_reads") {
            Setting::Absent => {}
            Setting::Null => return Err(null_error("verify_cache_reads")),
            Setting::Present(Value::Bool(verify)) => settings.verify_cache_reads = *verify,
            Setting::Present(other) => {
                return Err(AttachmentError::invalid(format!(
                    "verify_cache_reads must be a boolean, got {other}"
                )));
            }
        }

        settings.ensure_cache_directory()?;
        Ok(settings)
    }

    /// Parse settings from a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| AttachmentError::config(format!("settings are not valid JSON: {e}")))?;
        match value {
            Value::Object(map) => Self::from_map(&map),
            _ => Err(AttachmentError::config("settings must be a JSON object")),
        }
    }

    /// Load settings from a specific JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let map = config::load_json_object(path)
            .map_err(|e| AttachmentError::config(format!("{e:#}")))?;
        Self::from_map(&map)
    }

    /// Load settings from `settings.json` in the shared config directory
    pub fn load() -> Result<Self> {
        let path = config::config_path(SETTINGS_FILE)
            .ok_or_else(|| AttachmentError::config("could not determine config directory"))?;
        if !config::config_exists(SETTINGS_FILE) {
            return Err(AttachmentError::config(format!(
                "no settings file at {}",
                path.display()
            )));
        }
        Self::from_file(&path)
    }

    /// Create the cache directory if needed
    pub fn ensure_cache_directory(&self) -> Result<()> {
        std::fs::create_dir_all(&self.cache_directory).map_err(|e| {
            AttachmentError::config(format!(
                "cannot create cache directory {}: {e}",
                self.cache_directory.display()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;
    use tempfile::tempdir;

    enum Entry {
        Missing,
        Set(Value),
    }

    /// Build settings with one key overridden on top of a valid baseline
    fn settings_with(key: &str, entry: Entry) -> Result<Settings> {
        let dir = tempdir().unwrap();
        let mut map = Map::new();
        map.insert("database_location".into(), json!(":memory:"));
        map.insert(
            "cache_directory".into(),
            json!(dir.path().join("cache").to_str().unwrap()),
        );
        match entry {
            Entry::Missing => {
                map.remove(key);
            }
            Entry::Set(value) => {
                map.insert(key.into(), value);
            }
        }
        Settings::from_map(&map)
    }

    fn kind_of(result: Result<Settings>) -> Option<ErrorKind> {
        result.err().map(|e| e.kind())
    }

    #[test]
    fn test_configuration_matrix() {
        use Entry::{Missing, Set};

        let cases: Vec<(&str, Entry, Option<ErrorKind>)> = vec![
            ("digest_algorithm", Missing, None),
            ("digest_algorithm", Set(Value::Null), Some(ErrorKind::Configuration)),
            ("digest_algorithm", Set(json!("")), Some(ErrorKind::Validation)),
            ("digest_algorithm", Set(json!("sha256")), None),
            ("digest_algorithm", Set(json!("sha512")), None),
            ("digest_algorithm", Set(json!("whirlpool")), Some(ErrorKind::Validation)),
            ("compression", Missing, None),
            ("compression", Set(Value::Null), Some(ErrorKind::Configuration)),
            ("compression", Set(json!("")), Some(ErrorKind::Validation)),
            ("compression", Set(json!("bz2")), None),
            ("compression", Set(json!("lzma")), None),
            ("compression", Set(json!("gzip")), None),
            ("compression", Set(json!(3)), Some(ErrorKind::Validation)),
            ("cache_directory", Set(json!("")), Some(ErrorKind::Validation)),
            ("cache_max_age_hours", Missing, None),
            ("cache_max_age_hours", Set(Value::Null), Some(ErrorKind::Configuration)),
            ("cache_max_age_hours", Set(json!("")), Some(ErrorKind::Validation)),
            ("cache_max_age_hours", Set(json!("1")), None),
            ("cache_max_age_hours", Set(json!(-1)), Some(ErrorKind::Validation)),
            ("cache_max_size", Missing, None),
            ("cache_max_size", Set(Value::Null), Some(ErrorKind::Configuration)),
            ("cache_max_size", Set(json!("")), Some(ErrorKind::Validation)),
            ("cache_max_size", Set(json!("100")), None),
            ("cache_max_size", Set(json!(100)), None),
            ("database_location", Missing, Some(ErrorKind::Configuration)),
            ("database_location", Set(Value::Null), Some(ErrorKind::Configuration)),
            ("database_location", Set(json!("")), Some(ErrorKind::Validation)),
            ("database_location", Set(json!("sqlite:///:memory:")), None),
            ("database_location", Set(json!("postgres://db/x")), Some(ErrorKind::Validation)),
            ("verify_cache_reads", Set(json!(true)), None),
            ("verify_cache_reads", Set(json!("yes")), Some(ErrorKind::Validation)),
        ];

        for (key, entry, expected) in cases {
            let description = match &entry {
                Missing => "<missing>".to_string(),
                Set(value) => value.to_string(),
            };
            assert_eq!(
                kind_of(settings_with(key, entry)),
                expected,
                "{key} = {description}"
            );
        }
    }

    #[test]
    fn test_defaults() {
        let settings = settings_with("compression", Entry::Missing).unwrap();
        assert_eq!(settings.compression, Compression::Zstd);
        assert_eq!(settings.digest_algorithm, DigestAlgorithm::Sha256);
        assert_eq!(settings.cache_max_age, chrono::Duration::hours(24));
        assert_eq!(settings.cache_max_size, DEFAULT_CACHE_MAX_SIZE);
        assert!(!settings.verify_cache_reads);
    }

    #[test]
    fn test_values_applied() {
        let settings = settings_with("cache_max_age_hours", Entry::Set(json!("1"))).unwrap();
        assert_eq!(settings.cache_max_age, chrono::Duration::hours(1));

        let settings = settings_with("cache_max_size", Entry::Set(json!("100"))).unwrap();
        assert_eq!(settings.cache_max_size, 100);

        let settings = settings_with("compression", Entry::Set(json!("lzma"))).unwrap();
        assert_eq!(settings.compression, Compression::Lzma);
    }

    #[test]
    fn test_default_cache_directory() {
        assert!(default_cache_directory().ends_with("attachments"));
        let settings = Settings::new(DatabaseLocation::Memory);
        assert_eq!(settings.cache_directory, default_cache_directory());
    }

    #[test]
    fn test_cache_directory_created() {
        let dir = tempdir().unwrap();
        let cache = dir.path().join("nested").join("cache");
        let json = json!({
            "database_location": ":memory:",
            "cache_directory": cache.to_str().unwrap(),
        });
        Settings::from_json(&json.to_string()).unwrap();
        assert!(cache.is_dir());
    }

    #[test]
    fn test_cache_directory_creation_failure() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let json = json!({
            "database_location": ":memory:",
            "cache_directory": blocker.join("cache").to_str().unwrap(),
        });
        let err = Settings::from_json(&json.to_string()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_database_location_parsing() {
        assert_eq!(
            "sqlite:///:memory:".parse::<DatabaseLocation>().unwrap(),
            DatabaseLocation::Memory
        );
        assert_eq!(
            ":memory:".parse::<DatabaseLocation>().unwrap(),
            DatabaseLocation::Memory
        );
        assert_eq!(
            "sqlite:///attachments.db".parse::<DatabaseLocation>().unwrap(),
            DatabaseLocation::File(PathBuf::from("attachments.db"))
        );
        assert_eq!(
            "sqlite:////var/lib/attachments.db"
                .parse::<DatabaseLocation>()
                .unwrap(),
            DatabaseLocation::File(PathBuf::from("/var/lib/attachments.db"))
        );
        assert_eq!(
            "/tmp/a.db".parse::<DatabaseLocation>().unwrap(),
            DatabaseLocation::File(PathBuf::from("/tmp/a.db"))
        );
    }

    #[test]
    fn test_invalid_json() {
        let err = Settings::from_json("[]").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
