//! Storage settings stored in settings.toml

use anyhow::{bail, Context, Result};
use chatfork_core::registry::{BASE_DIR_KEY, DATABASE_KEY, FULL_TEXT_SEARCH_KEY, USER_ID_KEY};
use chatfork_core::{create_backend, Backend, BackendConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::PathManager;

/// Backend used when settings name none
pub const DEFAULT_BACKEND: &str = "filesystem";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Registry token of the storage backend ("filesystem", "sqlite", ...)
    pub backend: String,
    /// Session directory for the filesystem backend
    pub base_dir: Option<PathBuf>,
    /// Database path for the SQLite backend (":memory:" allowed)
    pub database: Option<String>,
    /// Owner of stored sessions; defaults to the OS user
    pub user_id: Option<String>,
    pub full_text_search: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: DEFAULT_BACKEND.to_string(),
            base_dir: None,
            database: None,
            user_id: None,
            full_text_search: true,
        }
    }
}

impl Settings {
    /// Load settings from the settings file, or return defaults if not found
    pub fn load() -> Self {
        let Some(path) = PathManager::settings_path() else {
            return Self::default();
        };
        Self::load_from(&path).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable settings");
            Self::default()
        })
    }

    /// Load from a specific file; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
        };
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Save settings to the settings file
    pub fn save(&self) -> Result<()> {
        let path = PathManager::settings_path().context("Could not determine settings path")?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config dir")?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize settings")?;
        fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    fn is_backend(&self, token: &str) -> bool {
        self.backend.trim().eq_ignore_ascii_case(token)
    }

    /// Registry config for the selected backend, with platform defaults
    /// filled in for anything the settings leave out
    pub fn backend_config(&self) -> Result<BackendConfig> {
        let mut config = BackendConfig::new();

        if let Some(base_dir) = self.base_dir.clone().or_else(PathManager::sessions_dir) {
            config.insert(BASE_DIR_KEY.to_string(), base_dir.to_string_lossy().into_owned());
        } else if self.is_backend("filesystem") || self.is_backend("fs") {
            bail!("No session directory configured and no platform data directory found");
        }

        let database = self
            .database
            .clone()
            .or_else(|| PathManager::db_path().map(|p| p.to_string_lossy().into_owned()));
        if let Some(database) = database {
            config.insert(DATABASE_KEY.to_string(), database);
        } else if self.is_backend("sqlite") {
            bail!("No database configured and no platform data directory found");
        }

        let user_id = self.user_id.clone().unwrap_or_else(whoami::username);
        config.insert(USER_ID_KEY.to_string(), user_id);
        config.insert(FULL_TEXT_SEARCH_KEY.to_string(), self.full_text_search.to_string());
        Ok(config)
    }

    /// Construct the configured backend through the registry
    pub fn open_backend(&self) -> Result<Arc<dyn Backend>> {
        let config = self.backend_config()?;
        let backend = create_backend(&self.backend, &config)
            .with_context(|| format!("Failed to open {} storage backend", self.backend))?;
        tracing::info!(backend = %self.backend, "Storage backend ready");
        Ok(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.backend, "filesystem");
        assert!(settings.full_text_search);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.toml");
        let settings = Settings {
            backend: "sqlite".into(),
            database: Some(":memory:".into()),
            user_id: Some("alice".into()),
            full_text_search: false,
            ..Settings::default()
        };
        settings.save_to(&path).unwrap();
        assert_eq!(Settings::load_from(&path).unwrap(), settings);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "backend = \"sqlite\"\n").unwrap();
        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.backend, "sqlite");
        assert!(settings.full_text_search);
    }

    #[test]
    fn test_unparsable_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "backend = [").unwrap();
        assert!(Settings::load_from(&path).is_err());
    }

    #[test]
    fn test_backend_config_prefers_explicit_values() {
        let settings = Settings {
            backend: "sqlite".into(),
            base_dir: Some(PathBuf::from("/srv/sessions")),
            database: Some(":memory:".into()),
            user_id: Some("bob".into()),
            full_text_search: false,
        };
        let config = settings.backend_config().unwrap();
        assert_eq!(config[BASE_DIR_KEY], "/srv/sessions");
        assert_eq!(config[DATABASE_KEY], ":memory:");
        assert_eq!(config[USER_ID_KEY], "bob");
        assert_eq!(config[FULL_TEXT_SEARCH_KEY], "false");
    }

    #[tokio::test]
    async fn test_open_backend() {
        let dir = TempDir::new().unwrap();
        let settings = Settings {
            base_dir: Some(dir.path().join("sessions")),
            ..Settings::default()
        };
        let backend = settings.open_backend().unwrap();
        assert_eq!(backend.kind(), "filesystem");
        assert!(backend.list_sessions().await.unwrap().is_empty());
    }
}
