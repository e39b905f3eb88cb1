use std::{
    collections::BTreeMap,
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Grace period granted to the child between closing its input and killing it.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Errors raised while building a [`ChannelConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("child command must not be empty")]
    EmptyCommand,
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse channel definition: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to parse {path}: {source}")]
    ParseFile {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// What happens to the child's stderr. It never carries protocol traffic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StderrMode {
    /// Share this process's stderr.
    #[default]
    Inherit,
    /// Discard it.
    Null,
}

/// Launch settings for a [`crate::Channel`].
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub current_dir: Option<PathBuf>,
    /// Variables set on the child, layered over the inherited environment.
    pub env: BTreeMap<OsString, OsString>,
    /// Start the child from an empty environment instead of inheriting ours.
    pub clear_env: bool,
    pub stderr: StderrMode,
    /// How long `close` waits for a voluntary exit after closing the child's input.
    pub shutdown_grace: Duration,
}

impl ChannelConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            env: BTreeMap::new(),
            clear_env: false,
            stderr: StderrMode::Inherit,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Splits a command string on whitespace into a program and its arguments.
    ///
    /// No shell quoting is interpreted.
    pub fn from_command_line(line: &str) -> Result<Self, ConfigError> {
        let mut words = line.split_whitespace();
        let program = words.next().ok_or(ConfigError::EmptyCommand)?;
        Ok(Self::new(program).args(words))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn clear_env(mut self, clear: bool) -> Self {
        self.clear_env = clear;
        self
    }

    pub fn stderr(mut self, mode: StderrMode) -> Self {
        self.stderr = mode;
        self
    }

    /// Use `Duration::ZERO` to kill a still-running child right away.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Human readable form of the command line, used in logs and spawn errors.
    pub fn describe(&self) -> String {
        let mut parts = vec![self.program.to_string_lossy().into_owned()];
        parts.extend(self.args.iter().map(|arg| arg.to_string_lossy().into_owned()));
        parts.join(" ")
    }
}

/// Serializable channel definition, typically stored as a TOML table.
///
/// ```toml
/// command = "snippet --verbose"
/// args = ["--port", "0"]
/// cwd = "/srv/snippet"
/// shutdown_grace_ms = 1000
///
/// [env]
/// RUST_LOG = "info"
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelDefinition {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub clear_env: bool,
    #[serde(default)]
    pub quiet_stderr: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_grace_ms: Option<u64>,
}

impl ChannelDefinition {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::ParseFile {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Resolves the definition into launch settings. Words after the program in
    /// `command` come before `args`.
    pub fn into_config(self) -> Result<ChannelConfig, ConfigError> {
        let mut config = ChannelConfig::from_command_line(&self.command)?
            .args(self.args)
            .clear_env(self.clear_env);

        if let Some(cwd) = self.cwd {
            config = config.current_dir(cwd);
        }
        for (key, value) in self.env {
            config = config.env(key, value);
        }
        if self.quiet_stderr {
            config = config.stderr(StderrMode::Null);
        }
        if let Some(ms) = self.shutdown_grace_ms {
            config = config.shutdown_grace(Duration::from_millis(ms));
        }

        Ok(config)
    }
}
