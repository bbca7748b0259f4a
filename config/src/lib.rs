//! Ambient configuration for chatfork: data paths, settings and logging

pub mod logging;
pub mod paths;
pub mod settings;

pub use logging::{init_logging, init_stderr_logging};
pub use paths::PathManager;
pub use settings::Settings;
