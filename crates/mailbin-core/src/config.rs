use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, StoreError};

pub const DEFAULT_TAG_PATTERN: &str = r"^[a-zA-Z0-9\- _]+$";

/// Store settings, read from the `[store]` table of a TOML document.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database: PathBuf,
    pub max_connections: u32,
    /// Suppress a second message carrying an already-stored Message-ID.
    pub ignore_duplicate_ids: bool,
    /// Use the Date header instead of arrival time for `created`.
    pub use_message_dates: bool,
    pub tag_pattern: String,
    pub tags_disable_x_tags: bool,
    pub tags_disable_plus: bool,
    /// Queries whose matches are tagged on arrival.
    pub tag_filters: Vec<TagFilterConfig>,
    /// Default per-mailbox ceiling; 0 disables count-based pruning.
    pub max_messages: u64,
    pub mailbox_limits: HashMap<String, u64>,
    /// Age limit in hours; 0 disables age-based pruning.
    pub max_age_hours: u64,
    pub prune_interval_secs: u64,
    pub prune_batch_size: u64,
    pub delete_batch_size: u64,
    pub backfill_batch_size: u64,
    pub event_queue_capacity: usize,
    /// Quiet period before reclaiming space; 0 disables vacuuming.
    pub vacuum_idle_secs: u64,
    /// Deleted bytes, as a percentage of stored bytes, that justify a vacuum.
    pub vacuum_min_deleted_percent: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TagFilterConfig {
    #[serde(rename = "match", default)]
    pub query: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
            max_connections: 4,
            ignore_duplicate_ids: false,
            use_message_dates: false,
            tag_pattern: DEFAULT_TAG_PATTERN.to_string(),
            tags_disable_x_tags: false,
            tags_disable_plus: false,
            tag_filters: Vec::new(),
            max_messages: 500,
            mailbox_limits: HashMap::new(),
            max_age_hours: 0,
            prune_interval_secs: 60,
            prune_batch_size: 5000,
            delete_batch_size: 5000,
            backfill_batch_size: 1000,
            event_queue_capacity: 256,
            vacuum_idle_secs: 300,
            vacuum_min_deleted_percent: 1,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    store: StoreConfig,
}

impl StoreConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|err| StoreError::Config(err.to_string()))?;
        file.store.validated()
    }

    /// Reads `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml_str(&content),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(StoreError::Config(format!("{}: {}", path.display(), err))),
        }
    }

    pub fn default_path() -> PathBuf {
        config_home().join("mailbin").join("config.toml")
    }

    /// Effective message ceiling for `mailbox`.
    pub fn limit_for(&self, mailbox: &str) -> u64 {
        self.mailbox_limits
            .get(mailbox)
            .copied()
            .unwrap_or(self.max_messages)
    }

    pub fn vacuum_idle(&self) -> Option<Duration> {
        (self.vacuum_idle_secs > 0).then(|| Duration::from_secs(self.vacuum_idle_secs))
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs.max(1))
    }

    fn validated(mut self) -> Result<Self> {
        if self.max_connections == 0 {
            return Err(StoreError::Config("max_connections must be positive".into()));
        }
        for (name, value) in [
            ("prune_batch_size", self.prune_batch_size),
            ("delete_batch_size", self.delete_batch_size),
            ("backfill_batch_size", self.backfill_batch_size),
        ] {
            if value == 0 {
                return Err(StoreError::Config(format!("{} must be positive", name)));
            }
        }
        if self.tag_pattern.trim().is_empty() {
            self.tag_pattern = DEFAULT_TAG_PATTERN.to_string();
        }
        Ok(self)
    }
}

fn config_home() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_database_path() -> PathBuf {
    std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local").join("share"))
        })
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mailbin")
        .join("mailbin.db")
}

#[cfg(test)]
mod tests {
    use super::{DEFAULT_TAG_PATTERN, StoreConfig};

    #[test]
    fn empty_document_uses_defaults() {
        let config = StoreConfig::from_toml_str("").unwrap();
        assert_eq!(config.max_messages, 500);
        assert_eq!(config.prune_interval_secs, 60);
        assert_eq!(config.prune_batch_size, 5000);
        assert_eq!(config.delete_batch_size, 5000);
        assert_eq!(config.backfill_batch_size, 1000);
        assert_eq!(config.tag_pattern, DEFAULT_TAG_PATTERN);
        assert!(!config.ignore_duplicate_ids);
    }

    #[test]
    fn store_table_overrides_and_mailbox_limits() {
        let config = StoreConfig::from_toml_str(
            r#"
            [store]
            database = "/tmp/x.db"
            max_messages = 100
            ignore_duplicate_ids = true

            [store.mailbox_limits]
            archive = 0
            qa = 20
            "#,
        )
        .unwrap();
        assert_eq!(config.database.to_str(), Some("/tmp/x.db"));
        assert!(config.ignore_duplicate_ids);
        assert_eq!(config.limit_for("default"), 100);
        assert_eq!(config.limit_for("qa"), 20);
        assert_eq!(config.limit_for("archive"), 0);
    }

    #[test]
    fn tag_filters_are_read_from_array_tables() {
        let config = StoreConfig::from_toml_str(
            r#"
            [[store.tag_filters]]
            match = "from:billing@example.com"
            tags = ["finance", "invoices"]

            [[store.tag_filters]]
            match = "has:attachment"
            tags = ["files"]
            "#,
        )
        .unwrap();
        assert_eq!(config.tag_filters.len(), 2);
        assert_eq!(config.tag_filters[0].query, "from:billing@example.com");
        assert_eq!(config.tag_filters[0].tags, vec!["finance", "invoices"]);
        assert_eq!(config.vacuum_idle_secs, 300);
        assert_eq!(config.vacuum_idle(), Some(std::time::Duration::from_secs(300)));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(StoreConfig::from_toml_str("[store]\ndelete_batch_size = 0").is_err());
        assert!(StoreConfig::from_toml_str("[store]\nmax_messages = \"many\"").is_err());
    }

    #[test]
    fn missing_file_loads_defaults() {
        let path = std::env::temp_dir().join("mailbin-config-does-not-exist.toml");
        let config = StoreConfig::load(&path).unwrap();
        assert_eq!(config.max_connections, 4);
    }
}
