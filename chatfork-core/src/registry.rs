//! Backend registry: construct backends by type token and string config
//!
//! Built-in backends are installed on first use. Other crates add their own
//! with `register_backend`; registering an existing token replaces it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock, RwLock};

use crate::backend::Backend;
use crate::error::{Result, StorageError};
use crate::implementations::fs::{FsBackend, FS_BACKEND};
use crate::implementations::memory::{MemoryBackend, MEMORY_BACKEND};
#[cfg(feature = "sqlite")]
use crate::implementations::sqlite::{SqliteBackend, SqliteOptions, SQLITE_BACKEND};

/// Backend construction parameters, e.g. `base_dir` or `database`
pub type BackendConfig = HashMap<String, String>;

pub type BackendConstructor = Arc<dyn Fn(&BackendConfig) -> Result<Arc<dyn Backend>> + Send + Sync>;

pub const BASE_DIR_KEY: &str = "base_dir";
pub const DATABASE_KEY: &str = "database";
pub const USER_ID_KEY: &str = "user_id";
pub const FULL_TEXT_SEARCH_KEY: &str = "full_text_search";

/// Database path that opens a private in-memory SQLite database
pub const IN_MEMORY_DATABASE: &str = ":memory:";

static REGISTRY: OnceLock<RwLock<HashMap<String, BackendConstructor>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashMap<String, BackendConstructor>> {
    REGISTRY.get_or_init(|| RwLock::new(builtin_backends()))
}

fn builtin_backends() -> HashMap<String, BackendConstructor> {
    let mut backends: HashMap<String, BackendConstructor> = HashMap::new();
    backends.insert(FS_BACKEND.to_string(), Arc::new(filesystem_from_config));
    backends.insert("fs".to_string(), Arc::new(filesystem_from_config));
    backends.insert(MEMORY_BACKEND.to_string(), Arc::new(memory_from_config));
    #[cfg(feature = "sqlite")]
    backends.insert(SQLITE_BACKEND.to_string(), Arc::new(sqlite_from_config));
    backends
}

fn normalize(kind: &str) -> String {
    kind.trim().to_ascii_lowercase()
}

/// Register (or replace) a backend constructor under `kind`
pub fn register_backend<F>(kind: &str, constructor: F) -> Result<()>
where
    F: Fn(&BackendConfig) -> Result<Arc<dyn Backend>> + Send + Sync + 'static,
{
    let kind = normalize(kind);
    if kind.is_empty() {
        return Err(StorageError::InvalidBackend(kind));
    }
    let mut backends = registry()
        .write()
        .map_err(|_| StorageError::corrupted("backend registry", "lock poisoned"))?;
    if backends.insert(kind.clone(), Arc::new(constructor)).is_some() {
        tracing::debug!(backend = %kind, "Replaced backend constructor");
    }
    Ok(())
}

/// Construct a backend by type token
pub fn create_backend(kind: &str, config: &BackendConfig) -> Result<Arc<dyn Backend>> {
    let token = normalize(kind);
    let constructor = registry()
        .read()
        .map_err(|_| StorageError::corrupted("backend registry", "lock poisoned"))?
        .get(&token)
        .cloned()
        .ok_or_else(|| StorageError::InvalidBackend(kind.to_string()))?;
    let backend = constructor(config)?;
    tracing::debug!(backend = %token, "Created storage backend");
    Ok(backend)
}

/// Registered tokens, sorted
pub fn registered_backends() -> Vec<String> {
    let mut kinds: Vec<String> = registry()
        .read()
        .map(|backends| backends.keys().cloned().collect())
        .unwrap_or_default();
    kinds.sort();
    kinds
}

fn required<'a>(config: &'a BackendConfig, key: &str, backend: &str) -> Result<&'a str> {
    config
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| StorageError::InvalidConfig(format!("{} backend requires `{}`", backend, key)))
}

/// Parse a boolean config value; absent keys yield `default`
pub fn config_flag(config: &BackendConfig, key: &str, default: bool) -> Result<bool> {
    let Some(raw) = config.get(key) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(StorageError::InvalidConfig(format!(
            "`{}` must be true or false, got {:?}",
            key, raw
        ))),
    }
}

fn filesystem_from_config(config: &BackendConfig) -> Result<Arc<dyn Backend>> {
    let base_dir = required(config, BASE_DIR_KEY, FS_BACKEND)?;
    Ok(Arc::new(FsBackend::open(PathBuf::from(base_dir))?))
}

fn memory_from_config(_config: &BackendConfig) -> Result<Arc<dyn Backend>> {
    Ok(Arc::new(MemoryBackend::new()))
}

#[cfg(feature = "sqlite")]
fn sqlite_from_config(config: &BackendConfig) -> Result<Arc<dyn Backend>> {
    let database = required(config, DATABASE_KEY, SQLITE_BACKEND)?;
    let mut options = SqliteOptions::default();
    if let Some(user_id) = config.get(USER_ID_KEY).map(|u| u.trim()).filter(|u| !u.is_empty()) {
        options = options.with_user(user_id);
    }
    options.full_text_search = config_flag(config, FULL_TEXT_SEARCH_KEY, true)?;

    let backend = if database == IN_MEMORY_DATABASE {
        SqliteBackend::in_memory(options)?
    } else {
        SqliteBackend::open(database, options)?
    };
    Ok(Arc::new(backend))
}
