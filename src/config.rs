use akari::compose::ComposeConfig;
use akari::dispatch::{DispatchConfig, RequestsConfig};
use akari::intake::IntakeConfig;
use akari::post::PostConfig;
use akari::ratelimit::RateLimitConfig;
use akari::scoring::ScoringConfig;
use akari::search::SearchConfig;
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub storage: StorageConfig,
    pub intake: IntakeConfig,
    pub scoring: ScoringConfig,
    pub compose: ComposeConfig,
    pub search: SearchConfig,
    pub post: PostConfig,
    pub dispatch: DispatchConfig,
    pub requests: RequestsConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Relative paths below resolve against `data_dir`
    pub queue_file: PathBuf,
    pub ratelimit_db: PathBuf,
    pub images_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("akari"),
            queue_file: PathBuf::from("queue.jsonl"),
            ratelimit_db: PathBuf::from("ratelimit.db"),
            images_dir: PathBuf::from("images"),
        }
    }
}

impl StorageConfig {
    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }

    pub fn queue_path(&self) -> PathBuf {
        self.resolve(&self.queue_file)
    }

    pub fn ratelimit_path(&self) -> PathBuf {
        self.resolve(&self.ratelimit_db)
    }

    pub fn images_path(&self) -> PathBuf {
        self.resolve(&self.images_dir)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            storage: StorageConfig::default(),
            intake: IntakeConfig::default(),
            scoring: ScoringConfig::default(),
            compose: ComposeConfig::default(),
            search: SearchConfig::default(),
            post: PostConfig::default(),
            dispatch: DispatchConfig::default(),
            requests: RequestsConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // ~/.config/akari/akari.yml
        let project_name = env!("CARGO_PKG_NAME");
        if let Some(config_dir) = dirs::config_dir() {
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // ./akari.yml
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use akari::dispatch::DrainPolicy;
    use akari::post::PosterKind;
    use tempfile::TempDir;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("akari.yml");
        fs::write(
            &path,
            "storage:\n  data_dir: /var/lib/akari\ndispatch:\n  drain_policy: at_cycle_start\npost:\n  poster: telegram\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.dispatch.drain_policy, DrainPolicy::AtCycleStart);
        assert_eq!(config.post.poster, PosterKind::Telegram);
        assert_eq!(config.compose.max_attempts, 5);
        assert_eq!(config.requests.tiers.len(), 2);
        assert_eq!(config.storage.queue_path(), PathBuf::from("/var/lib/akari/queue.jsonl"));
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        assert!(Config::load(Some(&temp.path().join("nope.yml"))).is_err());
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("akari.yml");
        fs::write(&path, "dispatch: [not, a, map").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn test_absolute_storage_paths_win() {
        let storage = StorageConfig {
            data_dir: PathBuf::from("/data"),
            ratelimit_db: PathBuf::from("/shared/limits.db"),
            ..Default::default()
        };
        assert_eq!(storage.ratelimit_path(), PathBuf::from("/shared/limits.db"));
        assert_eq!(storage.images_path(), PathBuf::from("/data/images"));
    }
}
