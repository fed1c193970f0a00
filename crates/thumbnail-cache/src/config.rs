//! Runtime configuration for the thumbnail pipeline

use crate::codec::DEFAULT_JPEG_QUALITY;
use crate::coordinator::{CoordinatorSettings, DEFAULT_THUMBNAIL_SIZE};
use crate::worker::DEFAULT_WORKER_COUNT;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MIB: f64 = 1024.0 * 1024.0;

const MEMORY_MAX_SIZE: &str = "/core/thumbnail/memory_cache/max_size";
const MEMORY_MAX_COUNT: &str = "/core/thumbnail/memory_cache/max_count";
const DISK_MAX_SIZE: &str = "/core/thumbnail/disk_cache/max_size";
const DISK_MAX_COUNT: &str = "/core/thumbnail/disk_cache/max_count";
const DISK_PATH: &str = "/core/thumbnail/disk_cache/path";
const THUMBNAIL_SIZE: &str = "/core/thumbnail/size";

/// Budgets and tuning for both cache tiers and the coordinator
///
/// Sizes are in bytes. Missing fields take their defaults when deserialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThumbnailConfig {
    pub memory_max_size: usize,
    pub memory_max_count: usize,
    pub disk_max_size: usize,
    pub disk_max_count: usize,
    /// `None` leaves the disk tier unconfigured
    pub disk_cache_path: Option<PathBuf>,
    pub thumbnail_size: u32,
    pub jpeg_quality: u8,
    pub worker_count: usize,
    pub notify_delay_ms: u64,
    pub queue_step_delay_ms: u64,
    pub generation_timeout_ms: Option<u64>,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            memory_max_size: usize::MAX,
            memory_max_count: usize::MAX,
            disk_max_size: usize::MAX,
            disk_max_count: usize::MAX,
            disk_cache_path: default_disk_cache_path(),
            thumbnail_size: DEFAULT_THUMBNAIL_SIZE,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            worker_count: DEFAULT_WORKER_COUNT,
            notify_delay_ms: 250,
            queue_step_delay_ms: 5,
            generation_timeout_ms: Some(30_000),
        }
    }
}

/// `<user cache dir>/thumbnail-cache`, when the platform has one
pub fn default_disk_cache_path() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("thumbnail-cache"))
}

impl ThumbnailConfig {
    /// Overlay the thumbnail entries of a preference document onto the defaults
    ///
    /// Byte budgets are given in MiB. Absent entries keep their defaults.
    pub fn from_preferences(prefs: &Value) -> Result<Self> {
        let mut config = Self::default();

        if let Some(mib) = read_f64(prefs, MEMORY_MAX_SIZE)? {
            config.memory_max_size = mib_to_bytes(mib);
        }
        if let Some(count) = read_u64(prefs, MEMORY_MAX_COUNT)? {
            config.memory_max_count = usize::try_from(count).unwrap_or(usize::MAX);
        }
        if let Some(mib) = read_f64(prefs, DISK_MAX_SIZE)? {
            config.disk_max_size = mib_to_bytes(mib);
        }
        if let Some(count) = read_u64(prefs, DISK_MAX_COUNT)? {
            config.disk_max_count = usize::try_from(count).unwrap_or(usize::MAX);
        }
        if let Some(path) = prefs.pointer(DISK_PATH) {
            let path = path
                .as_str()
                .with_context(|| format!("{} must be a string", DISK_PATH))?;
            config.disk_cache_path = (!path.is_empty()).then(|| expand_home(path));
        }
        if let Some(size) = read_u64(prefs, THUMBNAIL_SIZE)? {
            config.thumbnail_size = u32::try_from(size)
                .with_context(|| format!("{} out of range: {}", THUMBNAIL_SIZE, size))?;
        }

        Ok(config)
    }

    /// Load a JSON preference document from disk
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read preferences {}", path.display()))?;
        let prefs: Value = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse preferences {}", path.display()))?;
        Self::from_preferences(&prefs)
    }

    pub fn notify_delay(&self) -> Duration {
        Duration::from_millis(self.notify_delay_ms)
    }

    pub fn generation_timeout(&self) -> Option<Duration> {
        self.generation_timeout_ms.map(Duration::from_millis)
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            thumbnail_size: self.thumbnail_size,
            disk_max_size: self.disk_max_size,
            disk_max_count: self.disk_max_count,
            queue_step_delay: Duration::from_millis(self.queue_step_delay_ms),
            generation_timeout: self.generation_timeout(),
        }
    }
}

fn read_u64(prefs: &Value, pointer: &str) -> Result<Option<u64>> {
    match prefs.pointer(pointer) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => match value.as_u64() {
            Some(n) => Ok(Some(n)),
            None => bail!("{} must be a non-negative integer, got {}", pointer, value),
        },
    }
}

fn read_f64(prefs: &Value, pointer: &str) -> Result<Option<f64>> {
    match prefs.pointer(pointer) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => match value.as_f64() {
            Some(n) if n >= 0.0 => Ok(Some(n)),
            _ => bail!("{} must be a non-negative number, got {}", pointer, value),
        },
    }
}

fn mib_to_bytes(mib: f64) -> usize {
    let bytes = mib * MIB;
    if bytes >= usize::MAX as f64 {
        usize::MAX
    } else {
        bytes as usize
    }
}

/// Expand a leading `~` to the home directory
fn expand_home(path: &str) -> PathBuf {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => return PathBuf::from(path),
    };
    match dirs::home_dir() {
        Some(home) if rest.is_empty() => home,
        Some(home) => home.join(rest),
        None => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = ThumbnailConfig::default();
        assert_eq!(config.thumbnail_size, 256);
        assert_eq!(config.jpeg_quality, 85);
        assert_eq!(config.worker_count, 5);
        assert_eq!(config.notify_delay(), Duration::from_millis(250));
        assert_eq!(config.generation_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.memory_max_count, usize::MAX);
    }

    #[test]
    fn test_from_preferences() {
        let prefs = json!({
            "core": { "thumbnail": {
                "size": 128,
                "memory_cache": { "max_size": 512, "max_count": 2000 },
                "disk_cache": { "max_size": 0.5, "max_count": 10000, "path": "/var/cache/thumbs" }
            }}
        });

        let config = ThumbnailConfig::from_preferences(&prefs).unwrap();
        assert_eq!(config.thumbnail_size, 128);
        assert_eq!(config.memory_max_size, 512 * 1024 * 1024);
        assert_eq!(config.memory_max_count, 2000);
        assert_eq!(config.disk_max_size, 512 * 1024);
        assert_eq!(config.disk_max_count, 10000);
        assert_eq!(config.disk_cache_path, Some(PathBuf::from("/var/cache/thumbs")));
    }

    #[test]
    fn test_partial_preferences_keep_defaults() {
        let prefs = json!({ "core": { "thumbnail": { "size": 64 } } });
        let config = ThumbnailConfig::from_preferences(&prefs).unwrap();

        let defaults = ThumbnailConfig::default();
        assert_eq!(config.thumbnail_size, 64);
        assert_eq!(config.disk_max_size, defaults.disk_max_size);
        assert_eq!(config.disk_cache_path, defaults.disk_cache_path);
    }

    #[test]
    fn test_invalid_preferences_rejected() {
        let prefs = json!({ "core": { "thumbnail": { "memory_cache": { "max_count": "lots" } } } });
        let err = ThumbnailConfig::from_preferences(&prefs).unwrap_err();
        assert!(err.to_string().contains("max_count"));

        let prefs = json!({ "core": { "thumbnail": { "disk_cache": { "max_size": -1 } } } });
        assert!(ThumbnailConfig::from_preferences(&prefs).is_err());
    }

    #[test]
    fn test_empty_path_disables_disk_tier() {
        let prefs = json!({ "core": { "thumbnail": { "disk_cache": { "path": "" } } } });
        let config = ThumbnailConfig::from_preferences(&prefs).unwrap();
        assert_eq!(config.disk_cache_path, None);
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/abs/path"), PathBuf::from("/abs/path"));
        assert_eq!(expand_home("~user/x"), PathBuf::from("~user/x"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~"), home);
            assert_eq!(expand_home("~/thumbs"), home.join("thumbs"));
        }
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        fs::write(
            &path,
            r#"{"core":{"thumbnail":{"disk_cache":{"max_count":3}}}}"#,
        )
        .unwrap();

        let config = ThumbnailConfig::from_json_file(&path).unwrap();
        assert_eq!(config.disk_max_count, 3);

        assert!(ThumbnailConfig::from_json_file(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_serde_fills_missing_fields() {
        let config: ThumbnailConfig =
            serde_json::from_str(r#"{"thumbnail_size": 512, "generation_timeout_ms": null}"#).unwrap();
        assert_eq!(config.thumbnail_size, 512);
        assert_eq!(config.generation_timeout(), None);
        assert_eq!(config.worker_count, DEFAULT_WORKER_COUNT);
    }
}
