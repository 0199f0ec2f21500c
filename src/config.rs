use std::path::PathBuf;

use directories::ProjectDirs;
use serde::Deserialize;

use crate::continuity::EngineSettings;
use crate::db::models::SortingStrategy;

/// Application configuration loaded from TOML config file.
/// Every field has a default, so the config file is optional.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Custom state database path (overrides XDG default).
    pub db_path: Option<PathBuf>,
    /// Custom metadata cache path (overrides XDG default).
    pub cache_path: Option<PathBuf>,
    /// Root of the organised library (`TV Shows/`, `Movies/`).
    pub library_dir: PathBuf,
    /// Scratch directory the ripper writes into.
    pub rip_dir: PathBuf,
    pub makemkv: MakeMkvConfig,
    pub tmdb: TmdbConfig,
    /// Days before a cached metadata lookup is fetched again.
    pub cache_ttl_days: u32,
    pub poll_interval_secs: u64,
    /// Sorting strategy for series seen for the first time.
    pub default_sorting: SortingStrategy,
    /// A track this many times the median length is offered as a double.
    pub double_length_ratio: f64,
    /// Metadata matches at or above this confidence are accepted silently.
    pub min_match_confidence: f64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MakeMkvConfig {
    pub binary: PathBuf,
    /// Titles shorter than this are ignored.
    pub min_title_secs: u64,
}

impl Default for MakeMkvConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("makemkvcon"),
            min_title_secs: 600,
        }
    }
}

/// TMDB API configuration. Without a key the tool runs offline and asks
/// for every identification.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TmdbConfig {
    pub api_key: Option<String>,
    pub language: String,
    pub base_url: Option<String>,
}

impl Default for TmdbConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            language: "en-US".to_string(),
            base_url: None,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let settings = EngineSettings::default();
        Self {
            db_path: None,
            cache_path: None,
            library_dir: default_home_dir().join("Media"),
            rip_dir: default_home_dir().join("Media").join(".rips"),
            makemkv: MakeMkvConfig::default(),
            tmdb: TmdbConfig::default(),
            cache_ttl_days: 30,
            poll_interval_secs: 5,
            default_sorting: settings.default_sorting,
            double_length_ratio: settings.double_length_ratio,
            min_match_confidence: settings.min_match_confidence,
        }
    }
}

impl AppConfig {
    /// Load config from `~/.config/ripshelf/config.toml`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) if path.exists() => match std::fs::read_to_string(&path) {
                Ok(contents) => match Self::parse(&contents) {
                    Ok(config) => {
                        log::info!("Loaded config from {}", path.display());
                        config
                    }
                    Err(e) => {
                        log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                        Self::default()
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Engine tunables derived from this config.
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            min_title_secs: self.makemkv.min_title_secs,
            double_length_ratio: self.double_length_ratio,
            min_match_confidence: self.min_match_confidence,
            default_sorting: self.default_sorting,
        }
    }

    /// Get the config file path.
    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

fn default_home_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

fn data_file(name: &str) -> PathBuf {
    if let Some(dirs) = ProjectDirs::from("", "", crate::APP_NAME) {
        let data_dir = dirs.data_dir();
        std::fs::create_dir_all(data_dir).ok();
        data_dir.join(name)
    } else {
        // Fallback: current directory
        PathBuf::from(name)
    }
}

/// Resolve the default state database path using XDG data directory.
pub fn default_db_path() -> PathBuf {
    data_file("ripshelf.db")
}

/// The metadata cache lives in its own file so it can be deleted freely.
pub fn default_cache_path() -> PathBuf {
    data_file("metadata-cache.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_default() {
        let c = AppConfig::parse("").unwrap();
        assert_eq!(c.cache_ttl_days, 30);
        assert_eq!(c.makemkv.min_title_secs, 600);
        assert_eq!(c.default_sorting, SortingStrategy::TrackOrder);
        assert!(c.tmdb.api_key.is_none());
    }

    #[test]
    fn test_partial_config() {
        let c = AppConfig::parse(
            r#"
            library_dir = "/srv/media"
            default_sorting = "user_confirmed"

            [tmdb]
            api_key = "abc"

            [makemkv]
            min_title_secs = 300
            "#,
        )
        .unwrap();
        assert_eq!(c.library_dir, PathBuf::from("/srv/media"));
        assert_eq!(c.default_sorting, SortingStrategy::UserConfirmed);
        assert_eq!(c.tmdb.api_key.as_deref(), Some("abc"));
        assert_eq!(c.tmdb.language, "en-US");
        assert_eq!(c.makemkv.binary, PathBuf::from("makemkvcon"));
        assert_eq!(c.engine_settings().min_title_secs, 300);
    }

    #[test]
    fn test_bad_config_is_an_error() {
        assert!(AppConfig::parse("cache_ttl_days = \"soon\"").is_err());
    }
}
