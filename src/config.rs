//! Host configuration for worker pools and thread queues.
//!
//! # Configuration Precedence
//!
//! Settings are resolved in this order (highest priority first):
//!
//! 1. **Programmatic**: values set with the `with_*` methods
//! 2. **Environment variables**: values from `COADAPT_*` env vars
//! 3. **Config file**: values loaded from a TOML file (requires `config-file` feature)
//! 4. **Defaults**: built-in defaults from [`HostConfig::default()`]
//!
//! # Supported Environment Variables
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `COADAPT_WORKER_THREADS` | `usize` | `worker_threads` |
//! | `COADAPT_THREAD_NAME_PREFIX` | `String` | `thread_name_prefix` |
//! | `COADAPT_THREAD_STACK_SIZE` | `usize` | `thread_stack_size` |
//! | `COADAPT_QUEUE_NAME` | `String` | `queue_name` |

use crate::tracing_compat::debug;

/// Environment variable name for the worker pool size.
pub const ENV_WORKER_THREADS: &str = "COADAPT_WORKER_THREADS";
/// Environment variable name for the worker thread name prefix.
pub const ENV_THREAD_NAME_PREFIX: &str = "COADAPT_THREAD_NAME_PREFIX";
/// Environment variable name for the stack size of spawned threads.
pub const ENV_THREAD_STACK_SIZE: &str = "COADAPT_THREAD_STACK_SIZE";
/// Environment variable name for the name of a dedicated queue thread.
pub const ENV_QUEUE_NAME: &str = "COADAPT_QUEUE_NAME";

const DEFAULT_THREAD_NAME_PREFIX: &str = "coadapt-worker";
const DEFAULT_QUEUE_NAME: &str = "coadapt-queue";
const DEFAULT_THREAD_STACK_SIZE: usize = 2 * 1024 * 1024;
const MIN_THREAD_STACK_SIZE: usize = 64 * 1024;

/// Errors raised while loading or applying configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable is set to an unparseable value.
    #[error("invalid value for {var}: expected {expected}, got {value:?}")]
    InvalidEnv {
        /// The variable name.
        var: &'static str,
        /// What the variable should hold.
        expected: &'static str,
        /// The rejected value.
        value: String,
    },
    /// The config file could not be read.
    #[cfg(feature = "config-file")]
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// The file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The config file is not valid TOML for [`HostConfig`].
    #[cfg(feature = "config-file")]
    #[error("failed to parse TOML config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Settings for the threads this crate spawns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Number of [`WorkerPool`](crate::WorkerPool) threads.
    pub worker_threads: usize,
    /// Prefix for worker thread names; workers are `{prefix}-{index}`.
    pub thread_name_prefix: String,
    /// Stack size, in bytes, of every spawned thread.
    pub thread_stack_size: usize,
    /// Thread name of a dedicated [`ThreadQueue`](crate::ThreadQueue).
    pub queue_name: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            worker_threads: std::thread::available_parallelism()
                .map_or(1, std::num::NonZeroUsize::get),
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
            thread_stack_size: DEFAULT_THREAD_STACK_SIZE,
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
        }
    }
}

impl HostConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.normalize();
        Ok(config)
    }

    /// Sets the worker pool size.
    #[must_use]
    pub fn with_worker_threads(mut self, workers: usize) -> Self {
        self.worker_threads = workers;
        self
    }

    /// Sets the worker thread name prefix.
    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Sets the stack size of spawned threads.
    #[must_use]
    pub fn with_thread_stack_size(mut self, bytes: usize) -> Self {
        self.thread_stack_size = bytes;
        self
    }

    /// Sets the dedicated queue thread name.
    #[must_use]
    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    /// Clamps values into their usable ranges.
    pub fn normalize(&mut self) {
        if self.worker_threads == 0 {
            self.worker_threads = 1;
        }
        if self.thread_name_prefix.trim().is_empty() {
            self.thread_name_prefix = DEFAULT_THREAD_NAME_PREFIX.to_string();
        }
        if self.queue_name.trim().is_empty() {
            self.queue_name = DEFAULT_QUEUE_NAME.to_string();
        }
        self.thread_stack_size = self.thread_stack_size.max(MIN_THREAD_STACK_SIZE);
    }

    /// Applies `COADAPT_*` environment variables that are set.
    ///
    /// Fails if a variable is set but unparseable.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(val) = read_env(ENV_WORKER_THREADS) {
            self.worker_threads = parse_usize(ENV_WORKER_THREADS, &val)?;
        }
        if let Some(val) = read_env(ENV_THREAD_NAME_PREFIX) {
            self.thread_name_prefix = val;
        }
        if let Some(val) = read_env(ENV_THREAD_STACK_SIZE) {
            self.thread_stack_size = parse_usize(ENV_THREAD_STACK_SIZE, &val)?;
        }
        if let Some(val) = read_env(ENV_QUEUE_NAME) {
            self.queue_name = val;
        }
        debug!(config = ?self, "applied environment overrides");
        Ok(())
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_usize(var: &'static str, val: &str) -> Result<usize, ConfigError> {
    val.trim().parse::<usize>().map_err(|_| ConfigError::InvalidEnv {
        var,
        expected: "unsigned integer",
        value: val.to_string(),
    })
}

// =========================================================================
// TOML config file support (feature-gated)
// =========================================================================

/// TOML-deserializable host configuration.
///
/// ```toml
/// [pool]
/// worker_threads = 4
/// thread_name_prefix = "myapp-worker"
/// thread_stack_size = 2097152
///
/// [queue]
/// name = "myapp-ui"
/// ```
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
#[serde(deny_unknown_fields)]
pub struct HostTomlConfig {
    /// Worker pool settings.
    #[serde(default)]
    pub pool: PoolToml,
    /// Thread queue settings.
    #[serde(default)]
    pub queue: QueueToml,
}

/// Pool section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
#[serde(deny_unknown_fields)]
pub struct PoolToml {
    /// Number of worker threads.
    pub worker_threads: Option<usize>,
    /// Name prefix for worker threads.
    pub thread_name_prefix: Option<String>,
    /// Stack size per thread in bytes.
    pub thread_stack_size: Option<usize>,
}

/// Queue section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
#[serde(deny_unknown_fields)]
pub struct QueueToml {
    /// Name of a dedicated queue thread.
    pub name: Option<String>,
}

#[cfg(feature = "config-file")]
impl HostConfig {
    /// Loads a TOML document, then applies environment overrides.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let file: HostTomlConfig = toml::from_str(toml_str)?;
        let mut config = Self::default();
        config.apply_toml(&file);
        config.apply_env_overrides()?;
        config.normalize();
        Ok(config)
    }

    /// Reads and loads a TOML file, then applies environment overrides.
    pub fn from_toml_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Applies the fields present in `file`.
    pub fn apply_toml(&mut self, file: &HostTomlConfig) {
        if let Some(v) = file.pool.worker_threads {
            self.worker_threads = v;
        }
        if let Some(ref v) = file.pool.thread_name_prefix {
            self.thread_name_prefix.clone_from(v);
        }
        if let Some(v) = file.pool.thread_stack_size {
            self.thread_stack_size = v;
        }
        if let Some(ref v) = file.queue.name {
            self.queue_name.clone_from(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ErrorKind};

    const ALL_VARS: [&str; 4] = [
        ENV_WORKER_THREADS,
        ENV_THREAD_NAME_PREFIX,
        ENV_THREAD_STACK_SIZE,
        ENV_QUEUE_NAME,
    ];

    fn with_envs<F, R>(vars: &[(&str, &str)], f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _guard = crate::test_utils::env_lock();
        for var in ALL_VARS {
            std::env::remove_var(var);
        }
        for (k, v) in vars {
            std::env::set_var(k, v);
        }
        let result = f();
        for (k, _) in vars {
            std::env::remove_var(k);
        }
        result
    }

    #[test]
    fn defaults_are_usable() {
        let config = HostConfig::default();
        assert!(config.worker_threads >= 1);
        assert_eq!(config.thread_name_prefix, "coadapt-worker");
        assert_eq!(config.queue_name, "coadapt-queue");
        let mut normalized = config.clone();
        normalized.normalize();
        assert_eq!(normalized, config);
    }

    #[test]
    fn normalize_clamps() {
        let mut config = HostConfig::default()
            .with_worker_threads(0)
            .with_thread_name_prefix("  ")
            .with_thread_stack_size(1)
            .with_queue_name("");
        config.normalize();
        assert_eq!(config.worker_threads, 1);
        assert_eq!(config.thread_name_prefix, "coadapt-worker");
        assert_eq!(config.thread_stack_size, 64 * 1024);
        assert_eq!(config.queue_name, "coadapt-queue");
    }

    #[test]
    fn env_overrides_apply() {
        with_envs(
            &[
                (ENV_WORKER_THREADS, " 3 "),
                (ENV_THREAD_NAME_PREFIX, "app-pool"),
                (ENV_QUEUE_NAME, "ui"),
            ],
            || {
                let config = HostConfig::from_env().expect("env config");
                assert_eq!(config.worker_threads, 3);
                assert_eq!(config.thread_name_prefix, "app-pool");
                assert_eq!(config.queue_name, "ui");
            },
        );
    }

    #[test]
    fn programmatic_values_win_over_env() {
        with_envs(&[(ENV_WORKER_THREADS, "3")], || {
            let config = HostConfig::from_env()
                .expect("env config")
                .with_worker_threads(5);
            assert_eq!(config.worker_threads, 5);
        });
    }

    #[test]
    fn invalid_env_value_is_reported() {
        with_envs(&[(ENV_THREAD_STACK_SIZE, "big")], || {
            let err = HostConfig::from_env().expect_err("invalid");
            assert!(err.to_string().contains(ENV_THREAD_STACK_SIZE));
            let err: Error = err.into();
            assert_eq!(err.kind(), ErrorKind::Config);
        });
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn toml_then_env() {
        let doc = r#"
            [pool]
            worker_threads = 6
            thread_name_prefix = "from-file"

            [queue]
            name = "file-queue"
        "#;
        with_envs(&[(ENV_QUEUE_NAME, "env-queue")], || {
            let config = HostConfig::from_toml_str(doc).expect("toml config");
            assert_eq!(config.worker_threads, 6);
            assert_eq!(config.thread_name_prefix, "from-file");
            assert_eq!(config.queue_name, "env-queue");
        });
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn toml_rejects_unknown_keys() {
        let err = HostConfig::from_toml_str("[pool]\nworkers = 2\n").expect_err("unknown key");
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
