//! # Error types used by the legiond runtime.
//!
//! This module defines the error enums for the supervisor:
//!
//! - [`ConfigError`] defects in the configuration or roles documents.
//! - [`WatchError`] failures in the file/module watch subsystem.
//! - [`TaskError`] failures raised while driving a single task.
//! - [`LegionError`] failures of the orchestration runtime itself.
//!
//! All types provide `as_label()` for stable snake_case log labels.
//! Recovery policy is component-local: a [`TaskError`] never escapes the
//! owning task runtime, a [`ConfigError`] leaves the previous configuration
//! in force, and only [`LegionError::PidfileClaim`] and a start-window
//! failure are treated as fatal by the binary.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Defects found while loading or validating the configuration document
/// or the roles file.
///
/// Any of these leaves the previously loaded configuration in force.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The document could not be read from disk.
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The document is not parseable as YAML/JSON.
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// A required top-level key is missing.
    #[error("document has no '{key}' section")]
    MissingSection { key: &'static str },

    /// A task field failed structural validation.
    #[error("task '{task}': {reason}")]
    Task { task: String, reason: String },

    /// A task names a `requires` entry that is not a configured task.
    #[error("task '{task}' requires unknown task '{requires}'")]
    UnknownRequires { task: String, requires: String },

    /// The `requires` relation is not a DAG.
    #[error("requires cycle involving tasks: {remaining:?}")]
    RequiresCycle { remaining: Vec<String> },

    /// A `control` value that the grammar reserves but this build does not
    /// implement (`nowait`, `adopt`).
    #[error("task '{task}': control '{control}' is reserved and not implemented")]
    ReservedControl { task: String, control: String },

    /// An `onexit: start` entry targets a task that is not `once`.
    #[error("task '{task}': onexit start may only target 'once' tasks, '{target}' is not")]
    OnexitNotOnce { task: String, target: String },

    /// A `python` event on a task whose start command is not an analyzable
    /// script.
    #[error("task '{task}': python event rejected: {source}")]
    NotAnalyzable {
        task: String,
        #[source]
        source: WatchError,
    },

    /// An event action is malformed or names an unknown signal.
    #[error("task '{task}': bad event action '{action}'")]
    BadAction { task: String, action: String },

    /// A listener descriptor under `settings.http` is invalid.
    #[error("http listener {index}: {reason}")]
    Listener { index: usize, reason: String },
}

impl ConfigError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ConfigError::Io { .. } => "config_io",
            ConfigError::Parse { .. } => "config_parse",
            ConfigError::MissingSection { .. } => "config_missing_section",
            ConfigError::Task { .. } => "config_task",
            ConfigError::UnknownRequires { .. } => "config_unknown_requires",
            ConfigError::RequiresCycle { .. } => "config_requires_cycle",
            ConfigError::ReservedControl { .. } => "config_reserved_control",
            ConfigError::OnexitNotOnce { .. } => "config_onexit_not_once",
            ConfigError::NotAnalyzable { .. } => "config_not_analyzable",
            ConfigError::BadAction { .. } => "config_bad_action",
            ConfigError::Listener { .. } => "config_listener",
        }
    }
}

/// Errors from the watch subsystem.
///
/// `NotPython` is deliberately distinguishable from the I/O variants so the
/// config loader can reject `python` events at load time while treating
/// plain I/O trouble as a degradable condition.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum WatchError {
    /// The underlying path could not be opened or watched.
    #[error("cannot watch {path}: {reason}")]
    Watch { path: PathBuf, reason: String },

    /// A path was removed that was never added.
    #[error("path {path} was never added")]
    NeverAdded { path: PathBuf },

    /// A script handed to the module watcher is not analyzable as Python.
    #[error("{path} is not an analyzable python script")]
    NotPython { path: PathBuf },

    /// A command named by a `python`/`self` event could not be located.
    #[error("could not locate command '{command}'")]
    CommandNotFound { command: String },

    /// The native notification backend could not be constructed.
    #[error("native watch backend unavailable: {reason}")]
    Backend { reason: String },
}

impl WatchError {
    pub fn as_label(&self) -> &'static str {
        match self {
            WatchError::Watch { .. } => "watch_path",
            WatchError::NeverAdded { .. } => "watch_never_added",
            WatchError::NotPython { .. } => "watch_not_python",
            WatchError::CommandNotFound { .. } => "watch_command_not_found",
            WatchError::Backend { .. } => "watch_backend",
        }
    }

    /// True for the variant the config loader must surface as a config
    /// error rather than degrade.
    pub fn is_not_python(&self) -> bool {
        matches!(self, WatchError::NotPython { .. })
    }
}

/// Errors raised while driving one task.
///
/// These never propagate out of the owning task runtime; the legion logs
/// them and continues the event loop.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum TaskError {
    /// fork/exec failed. Treated as an immediate terminated transition
    /// with backoff.
    #[error("task '{task}' instance {instance}: spawn failed: {source}")]
    Spawn {
        task: String,
        instance: u32,
        #[source]
        source: std::io::Error,
    },

    /// A `user`/`group` setting does not resolve to a known identity.
    #[error("task '{task}': bad identity '{name}': {reason}")]
    Identity {
        task: String,
        name: String,
        reason: String,
    },

    /// The configured `cwd` does not exist.
    #[error("task '{task}': cwd '{cwd}' does not exist")]
    BadCwd { task: String, cwd: String },

    /// The start command resolved to an empty argv.
    #[error("task '{task}': no 'start' command in configuration")]
    NoStartCommand { task: String },

    /// A value resolved to something other than a single scalar.
    #[error("task '{task}': value resolved to {got}, expected one string")]
    NotScalar { task: String, got: String },

    /// The executable could not be located on PATH.
    #[error("task '{task}': could not determine full path for executable")]
    PathLookup { task: String },
}

impl TaskError {
    pub fn as_label(&self) -> &'static str {
        match self {
            TaskError::Spawn { .. } => "task_spawn",
            TaskError::Identity { .. } => "task_identity",
            TaskError::BadCwd { .. } => "task_bad_cwd",
            TaskError::NoStartCommand { .. } => "task_no_start",
            TaskError::NotScalar { .. } => "task_not_scalar",
            TaskError::PathLookup { .. } => "task_path_lookup",
        }
    }
}

/// Errors produced by the orchestration runtime itself.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum LegionError {
    /// The pidfile could not be claimed at startup. Fatal (exit 2).
    #[error("pidfile claim failed on {path}: {reason}")]
    PidfileClaim { path: PathBuf, reason: String },

    /// No configuration file was ever successfully loaded.
    #[error("no valid configuration: {source}")]
    NoConfig {
        #[source]
        source: ConfigError,
    },

    /// Shutdown overran the stop limit; some processes were abandoned.
    #[error("stop limit {limit:?} exceeded; still running: {stuck:?}")]
    StopLimitExceeded { limit: Duration, stuck: Vec<String> },

    /// Signal delivery to a running instance failed (`--stop`/`--reset`).
    #[error("cannot signal running instance: {reason}")]
    SendSignal { reason: String },
}

impl LegionError {
    pub fn as_label(&self) -> &'static str {
        match self {
            LegionError::PidfileClaim { .. } => "legion_pidfile_claim",
            LegionError::NoConfig { .. } => "legion_no_config",
            LegionError::StopLimitExceeded { .. } => "legion_stop_limit",
            LegionError::SendSignal { .. } => "legion_send_signal",
        }
    }

    /// Fatal errors abort startup with exit code 2 instead of entering the
    /// restart loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LegionError::PidfileClaim { .. })
    }
}
