use serde::{Serialize, Serializer};
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use crate::Cli;

/// Resolved runtime settings, built from the command line.
#[derive(Debug, Clone, Serialize, Default)]
pub struct SupervisorConfig {
    pub child: ChildConfig,
    pub watch: WatchConfig,
    pub restart: RestartConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChildConfig {
    pub command: String,
    /// Passed to the interpreter untouched, so non-UTF-8 paths survive.
    #[serde(serialize_with = "lossy_args")]
    pub args: Vec<OsString>,
}

fn lossy_args<S: Serializer>(args: &[OsString], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(args.iter().map(|arg| arg.to_string_lossy()))
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchConfig {
    pub enabled: bool,
    pub root: PathBuf,
    pub patterns: Vec<String>,
    pub ignore: Vec<String>,
    /// Files that already exist when watching starts are not reported as changes.
    pub ignore_initial: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestartConfig {
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShutdownConfig {
    /// Seconds to wait after SIGTERM before escalating to SIGKILL. 0 waits forever.
    pub stop_timeout_secs: u64,
    /// Seconds to wait after SIGKILL before giving up on the process tree.
    pub kill_timeout_secs: u64,
}

/// Errors that can occur while resolving settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot determine working directory: {0}")]
    WorkingDir(#[source] std::io::Error),
    #[error("script path is empty")]
    EmptyScript,
    #[error("interpreter command is empty")]
    EmptyCommand,
}

impl SupervisorConfig {
    /// Merge CLI overrides on top of the defaults.
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        if cli.script.as_os_str().is_empty() {
            return Err(ConfigError::EmptyScript);
        }
        if cli.exec.trim().is_empty() {
            return Err(ConfigError::EmptyCommand);
        }

        let mut config = SupervisorConfig::default();
        config.child = ChildConfig {
            command: cli.exec.clone(),
            args: vec![cli.script.clone().into_os_string()],
        };

        config.watch.root = std::env::current_dir().map_err(ConfigError::WorkingDir)?;
        config.watch.enabled = !cli.no_watch;
        config.watch.ignore_initial = !cli.initial;
        if !cli.watch.is_empty() {
            config.watch.patterns = cli.watch.clone();
        }
        config.watch.ignore.extend(cli.ignore.iter().cloned());

        config.restart.debounce_ms = cli.delay;
        config.shutdown.stop_timeout_secs = cli.stop_timeout;
        Ok(config)
    }
}

impl RestartConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl ShutdownConfig {
    pub fn stop_timeout(&self) -> Option<Duration> {
        match self.stop_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_timeout_secs)
    }
}

// --- Default implementations ---

impl Default for ChildConfig {
    fn default() -> Self {
        Self {
            command: "node".to_string(),
            args: Vec::new(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: PathBuf::from("."),
            patterns: vec![
                "**/*.js".to_string(),
                "**/*.mjs".to_string(),
                "**/*.cjs".to_string(),
                "**/*.json".to_string(),
                "**/*.env.*".to_string(),
                "**/.env".to_string(),
            ],
            ignore: vec!["**/node_modules".to_string()],
            ignore_initial: true,
        }
    }
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self { debounce_ms: 1000 }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            stop_timeout_secs: 10,
            kill_timeout_secs: 5,
        }
    }
}
