//! Global runtime configuration.
//!
//! The streaming writer keeps exactly one process-wide singleton: a handful of
//! knobs that are awkward to thread through every constructor and that the
//! original streaming engine also treated as process-global (the log level and
//! the default worker concurrency). Everything else — store paths, dimensions,
//! compression parameters — is explicit, passed through [`crate::stream::StreamConfig`]
//! and friends.

use std::sync::{OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Log verbosity passed through to whatever logger the embedding application
/// installs. This crate never calls [`log::set_max_level`] itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    None,
}

impl LogLevel {
    /// Convert to the `log` crate's level filter.
    #[must_use]
    pub const fn as_level_filter(self) -> log::LevelFilter {
        match self {
            Self::Debug => log::LevelFilter::Debug,
            Self::Info => log::LevelFilter::Info,
            Self::Warning => log::LevelFilter::Warn,
            Self::Error => log::LevelFilter::Error,
            Self::None => log::LevelFilter::Off,
        }
    }
}

/// Global configuration for the streaming writer.
///
/// Retrieve it with [`global_config`] and modify it with [`global_config_mut`].
#[derive(Debug)]
pub struct RuntimeConfig {
    log_level: LogLevel,
    default_concurrency: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            default_concurrency: None,
        }
    }
}

impl RuntimeConfig {
    /// The configured log level passthrough.
    #[must_use]
    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }

    /// Set the log level passthrough.
    pub fn set_log_level(&mut self, log_level: LogLevel) {
        self.log_level = log_level;
    }

    /// The worker thread count a newly created stream's thread pool should use,
    /// if the caller did not specify one explicitly. Defaults to
    /// [`std::thread::available_parallelism`].
    #[must_use]
    pub fn default_concurrency(&self) -> usize {
        self.default_concurrency
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, |n| n.get()))
    }

    /// Override the default worker thread count.
    pub fn set_default_concurrency(&mut self, concurrency: usize) {
        self.default_concurrency = Some(concurrency);
    }
}

static CONFIG: OnceLock<RwLock<RuntimeConfig>> = OnceLock::new();

/// Returns a reference to the global runtime configuration.
///
/// # Panics
/// Panics if the underlying lock has been poisoned.
pub fn global_config() -> RwLockReadGuard<'static, RuntimeConfig> {
    CONFIG
        .get_or_init(|| RwLock::new(RuntimeConfig::default()))
        .read()
        .unwrap()
}

/// Returns a mutable reference to the global runtime configuration.
///
/// # Panics
/// Panics if the underlying lock has been poisoned.
pub fn global_config_mut() -> RwLockWriteGuard<'static, RuntimeConfig> {
    CONFIG
        .get_or_init(|| RwLock::new(RuntimeConfig::default()))
        .write()
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_log_level_round_trips() {
        global_config_mut().set_log_level(LogLevel::Debug);
        assert_eq!(global_config().log_level(), LogLevel::Debug);
        global_config_mut().set_log_level(LogLevel::Info);
    }

    #[test]
    fn config_default_concurrency_falls_back_to_hardware() {
        assert!(global_config().default_concurrency() >= 1);
    }
}
