//! Persistent settings for conversions.
//!
//! Settings are stored in a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/conda-convert/settings.json
//! - Linux: ~/.config/conda-convert/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\conda-convert\settings.json

use anyhow::Result;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::batch::{BatchOptions, DEFAULT_MB_PER_PACKAGE, DEFAULT_TARGET_SUFFIX};
use crate::cache::MetadataCache;
use crate::convert::{ConversionOptions, DEFAULT_BACKUP_SUFFIX, DEFAULT_BATCH_SIZE};

fn default_channels() -> Vec<String> {
    vec!["conda-forge".to_string()]
}

fn default_target_suffix() -> String {
    DEFAULT_TARGET_SUFFIX.to_string()
}

fn default_backup_suffix() -> String {
    DEFAULT_BACKUP_SUFFIX.to_string()
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_max_parallel() -> usize {
    1
}

fn default_max_depth() -> usize {
    3
}

fn default_cache_max_age_hours() -> u64 {
    24
}

fn default_mb_per_package() -> u64 {
    DEFAULT_MB_PER_PACKAGE
}

/// User settings, every field optional in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Package manager executable; `mamba` then `conda` on PATH when unset.
    #[serde(default)]
    pub manager: Option<PathBuf>,

    /// Channels to install from
    #[serde(default = "default_channels", deserialize_with = "deserialize_channel_list")]
    pub channels: Vec<String>,

    #[serde(default = "default_target_suffix")]
    pub target_suffix: String,

    /// Suffix of in-place backups, also used to pair a target with its source
    #[serde(default = "default_backup_suffix")]
    pub backup_suffix: String,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// How deep to walk extra search paths
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    #[serde(default)]
    pub search_paths: Vec<PathBuf>,

    #[serde(default = "default_cache_max_age_hours")]
    pub cache_max_age_hours: u64,

    /// Disk estimate per package for the batch preflight
    #[serde(default = "default_mb_per_package")]
    pub mb_per_package: u64,

    #[serde(default)]
    pub preserve_ownership: bool,

    #[serde(default)]
    pub check_availability: bool,
}

/// Deserialize a channel list that accepts both:
/// - `"conda-forge, bioconda"` (comma-separated string)
/// - `["conda-forge", "bioconda"]` (JSON array)
fn deserialize_channel_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    struct ChannelListVisitor;

    impl<'de> de::Visitor<'de> for ChannelListVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or array of strings")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Vec<String>, E> {
            Ok(v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect())
        }

        fn visit_seq<A: de::SeqAccess<'de>>(
            self,
            mut seq: A,
        ) -> std::result::Result<Vec<String>, A::Error> {
            let mut items = Vec::new();
            while let Some(item) = seq.next_element::<String>()? {
                let trimmed = item.trim().to_string();
                if !trimmed.is_empty() {
                    items.push(trimmed);
                }
            }
            Ok(items)
        }
    }

    let channels = deserializer.deserialize_any(ChannelListVisitor)?;
    Ok(if channels.is_empty() {
        default_channels()
    } else {
        channels
    })
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            manager: None,
            channels: default_channels(),
            target_suffix: default_target_suffix(),
            backup_suffix: default_backup_suffix(),
            batch_size: default_batch_size(),
            max_parallel: default_max_parallel(),
            max_depth: default_max_depth(),
            search_paths: vec![],
            cache_max_age_hours: default_cache_max_age_hours(),
            mb_per_package: default_mb_per_package(),
            preserve_ownership: false,
            check_availability: false,
        }
    }
}

impl Settings {
    /// Conversion options seeded from these settings.
    pub fn conversion_options(&self) -> ConversionOptions {
        ConversionOptions {
            batch_size: self.batch_size.max(1),
            preserve_ownership: self.preserve_ownership,
            check_availability: self.check_availability,
            backup_suffix: self.backup_suffix.clone(),
            ..Default::default()
        }
    }

    /// Batch options seeded from these settings.
    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            target_suffix: self.target_suffix.clone(),
            backup_suffix: self.backup_suffix.clone(),
            max_parallel: self.max_parallel.max(1),
            search_paths: self.search_paths.clone(),
            max_depth: self.max_depth,
            mb_per_package: self.mb_per_package,
            ..Default::default()
        }
    }

    /// The metadata cache at its default location with the configured TTL.
    pub fn metadata_cache(&self) -> MetadataCache {
        MetadataCache::new(crate::default_cache_dir())
            .with_max_age(Duration::from_secs(self.cache_max_age_hours * 3600))
    }
}

/// Get the path to the settings file
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("conda-convert")
        .join("settings.json")
}

/// Load settings from disk, returning defaults if file doesn't exist
pub fn load_settings() -> Settings {
    load_settings_from(&settings_path())
}

/// Load settings from `path`, returning defaults if it is missing or invalid
pub fn load_settings_from(path: &Path) -> Settings {
    if path.exists() {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| match serde_json::from_str(&s) {
                Ok(settings) => Some(settings),
                Err(e) => {
                    log::warn!("[settings] Ignoring invalid {:?}: {}", path, e);
                    None
                }
            })
            .unwrap_or_default()
    } else {
        Settings::default()
    }
}

/// Save settings to disk
pub fn save_settings(settings: &Settings) -> Result<()> {
    save_settings_to(settings, &settings_path())
}

pub fn save_settings_to(settings: &Settings, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}
