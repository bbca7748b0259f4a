use directories::BaseDirs;
use std::path::PathBuf;
use std::sync::OnceLock;

static DATA_DIR_OVERRIDE: OnceLock<PathBuf> = OnceLock::new();

const APP_DIR: &str = "chatfork";

pub struct PathManager;

impl PathManager {
    /// Set a custom data directory. Only the first call takes effect.
    pub fn set_data_dir(path: PathBuf) {
        let _ = DATA_DIR_OVERRIDE.set(path);
    }

    pub fn data_dir() -> Option<PathBuf> {
        if let Some(d) = DATA_DIR_OVERRIDE.get() {
            return Some(d.clone());
        }
        BaseDirs::new().map(|d| d.data_dir().join(APP_DIR))
    }

    pub fn config_dir() -> Option<PathBuf> {
        // An overridden data dir holds config too, so tests and portable
        // installs stay self-contained
        if let Some(d) = DATA_DIR_OVERRIDE.get() {
            return Some(d.clone());
        }
        BaseDirs::new().map(|d| d.config_dir().join(APP_DIR))
    }

    /// Default `base_dir` of the filesystem backend
    pub fn sessions_dir() -> Option<PathBuf> {
        Self::data_dir().map(|d| d.join("sessions"))
    }

    /// Default `database` of the SQLite backend
    pub fn db_path() -> Option<PathBuf> {
        Self::data_dir().map(|d| d.join("sessions.db"))
    }

    pub fn settings_path() -> Option<PathBuf> {
        Self::config_dir().map(|d| d.join("settings.toml"))
    }

    pub fn logs_dir() -> Option<PathBuf> {
        Self::data_dir().map(|d| d.join("logs"))
    }

    pub fn log_file_path() -> Option<PathBuf> {
        Self::logs_dir().map(|d| d.join("chatfork.log"))
    }

    pub fn ensure_dirs_exist() -> std::io::Result<()> {
        let dirs = [
            Self::data_dir(),
            Self::config_dir(),
            Self::sessions_dir(),
            Self::logs_dir(),
        ];
        for dir in dirs.into_iter().flatten() {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}
