use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_SHELL: &str = "/bin/bash";
const DEFAULT_HOOK_SHELL: &str = "/bin/sh";
const DEFAULT_COMMAND_TIMEOUT: &str = "5m";
const DEFAULT_COMMAND_MAX_TIMEOUT: &str = "30m";
const DEFAULT_IDLE_TIMEOUT: &str = "30m";
const DEFAULT_SHUTDOWN_TIMEOUT: &str = "30s";
const DEFAULT_KILL_TIMEOUT: &str = "5s";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("the configuration file {path} could not be read: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("the configuration file could not be parsed: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("server.port must be between 1 and 65535, got {0}")]
    InvalidPort(i64),
    #[error("the timeout.{key} value {value:?} is invalid: {source}")]
    InvalidDuration {
        key: &'static str,
        value: String,
        #[source]
        source: humantime::DurationError,
    },
}

/// Validated daemon configuration with all defaults applied.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub shell: ShellConfig,
    pub timeout: TimeoutConfig,
    pub hooks: HooksConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub die_on_unlock: bool,
}

#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub command: String,
    pub working_directory: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub command: Duration,
    pub command_maximum: Duration,
    pub idle: Duration,
    pub shutdown: Duration,
    pub kill: Duration,
}

#[derive(Debug, Clone)]
pub struct HooksConfig {
    pub shell: String,
    pub lock: String,
    pub unlock: String,
}

// raw TOML shape; every key is optional and resolved against the defaults
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerSection,
    shell: ShellSection,
    timeout: TimeoutSection,
    hooks: HooksSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ServerSection {
    port: Option<i64>,
    die_on_unlock: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ShellSection {
    command: Option<String>,
    working_directory: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TimeoutSection {
    command: Option<String>,
    command_maximum: Option<String>,
    idle: Option<String>,
    shutdown: Option<String>,
    kill: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HooksSection {
    shell: Option<String>,
    lock: Option<String>,
    unlock: Option<String>,
}

impl Config {
    /// Reads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: ConfigFile = toml::from_str(&data)?;
        Config::resolve(file)
    }

    fn resolve(file: ConfigFile) -> Result<Config, ConfigError> {
        let port = match file.server.port {
            None => DEFAULT_PORT,
            Some(port) if (1..=65535).contains(&port) => port as u16,
            Some(port) => return Err(ConfigError::InvalidPort(port)),
        };

        Ok(Config {
            server: ServerConfig {
                port,
                die_on_unlock: file.server.die_on_unlock.unwrap_or(true),
            },
            shell: ShellConfig {
                command: file
                    .shell
                    .command
                    .unwrap_or_else(|| DEFAULT_SHELL.to_string()),
                working_directory: file.shell.working_directory,
            },
            timeout: TimeoutConfig {
                command: parse_timeout("command", file.timeout.command, DEFAULT_COMMAND_TIMEOUT)?,
                command_maximum: parse_timeout(
                    "command_maximum",
                    file.timeout.command_maximum,
                    DEFAULT_COMMAND_MAX_TIMEOUT,
                )?,
                idle: parse_timeout("idle", file.timeout.idle, DEFAULT_IDLE_TIMEOUT)?,
                shutdown: parse_timeout(
                    "shutdown",
                    file.timeout.shutdown,
                    DEFAULT_SHUTDOWN_TIMEOUT,
                )?,
                kill: parse_timeout("kill", file.timeout.kill, DEFAULT_KILL_TIMEOUT)?,
            },
            hooks: HooksConfig {
                shell: file
                    .hooks
                    .shell
                    .unwrap_or_else(|| DEFAULT_HOOK_SHELL.to_string()),
                lock: file.hooks.lock.unwrap_or_default(),
                unlock: file.hooks.unlock.unwrap_or_default(),
            },
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                port: DEFAULT_PORT,
                die_on_unlock: true,
            },
            shell: ShellConfig {
                command: DEFAULT_SHELL.to_string(),
                working_directory: None,
            },
            timeout: TimeoutConfig {
                command: Duration::from_secs(5 * 60),
                command_maximum: Duration::from_secs(30 * 60),
                idle: Duration::from_secs(30 * 60),
                shutdown: Duration::from_secs(30),
                kill: Duration::from_secs(5),
            },
            hooks: HooksConfig {
                shell: DEFAULT_HOOK_SHELL.to_string(),
                lock: String::new(),
                unlock: String::new(),
            },
        }
    }
}

fn parse_timeout(
    key: &'static str,
    value: Option<String>,
    default: &str,
) -> Result<Duration, ConfigError> {
    let text = value.unwrap_or_else(|| default.to_string());
    humantime::parse_duration(&text).map_err(|source| ConfigError::InvalidDuration {
        key,
        value: text,
        source,
    })
}
