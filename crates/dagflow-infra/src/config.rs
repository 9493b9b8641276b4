//! Engine configuration loader.
//!
//! Reads `dagflow.toml` into [`EngineConfig`]. A missing file yields the
//! defaults; a file that exists but cannot be read or parsed is a startup
//! error rather than a silent fallback.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use dagflow_types::config::EngineConfig;

use crate::sqlite::pool::default_database_url;

/// Environment variable that overrides the data directory.
pub const DATA_DIR_ENV: &str = "DAGFLOW_DATA_DIR";

/// Config file name inside the data directory.
pub const CONFIG_FILE: &str = "dagflow.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Load configuration from `path`.
pub async fn load_engine_config(path: &Path) -> Result<EngineConfig, ConfigError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            return Ok(EngineConfig::default());
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    toml::from_str::<EngineConfig>(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolve the data directory.
///
/// Priority:
/// 1. `DAGFLOW_DATA_DIR` environment variable
/// 2. `~/.dagflow`
/// 3. `.dagflow` in the working directory
pub fn resolve_data_dir() -> PathBuf {
    data_dir_from(std::env::var_os(DATA_DIR_ENV), dirs::home_dir())
}

fn data_dir_from(env: Option<OsString>, home: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = env.filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    match home {
        Some(home) => home.join(".dagflow"),
        None => PathBuf::from(".dagflow"),
    }
}

/// The configured database URL, or the default file under `data_dir`.
pub fn resolve_database_url(config: &EngineConfig, data_dir: &Path) -> String {
    config
        .database_url
        .clone()
        .unwrap_or_else(|| default_database_url(data_dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagflow_types::config::StorageBackend;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(&tmp.path().join(CONFIG_FILE)).await.unwrap();
        assert_eq!(config.storage, StorageBackend::Sqlite);
        assert_eq!(config.bus.partitions, 4);
    }

    #[tokio::test]
    async fn load_engine_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE);
        tokio::fs::write(
            &path,
            r#"
database_url = "sqlite:///var/lib/dagflow/flows.db"

[poller]
interval_secs = 1

[observe]
otel = true
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(&path).await.unwrap();
        assert_eq!(config.poller.interval_secs, 1);
        assert_eq!(config.poller.batch_size, 100);
        assert!(config.observe.otel);
        assert_eq!(
            resolve_database_url(&config, tmp.path()),
            "sqlite:///var/lib/dagflow/flows.db"
        );
    }

    #[tokio::test]
    async fn load_engine_config_invalid_toml_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE);
        tokio::fs::write(&path, "this is not { valid toml !!!")
            .await
            .unwrap();

        let err = load_engine_config(&path).await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains(CONFIG_FILE));
    }

    #[test]
    fn data_dir_prefers_env_then_home() {
        let home = Some(PathBuf::from("/home/ops"));
        assert_eq!(
            data_dir_from(Some(OsString::from("/srv/dagflow")), home.clone()),
            PathBuf::from("/srv/dagflow")
        );
        assert_eq!(
            data_dir_from(Some(OsString::new()), home.clone()),
            PathBuf::from("/home/ops/.dagflow")
        );
        assert_eq!(data_dir_from(None, None), PathBuf::from(".dagflow"));
    }

    #[test]
    fn default_database_url_lives_in_data_dir() {
        let config = EngineConfig::default();
        let url = resolve_database_url(&config, Path::new("/srv/dagflow"));
        assert_eq!(url, "sqlite:///srv/dagflow/dagflow.db");
    }
}
