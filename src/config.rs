use crate::error::RelayError;
use rustls::pki_types::ServerName;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(RelayError::Config(format!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Text
    }
}

impl std::str::FromStr for LogFormat {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(RelayError::Config(format!(
                "Invalid log format: {}. Must be one of: text, json",
                s
            ))),
        }
    }
}

/// Everything the relay needs for its lifetime. Loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    // Local side, where the IDE or browser connects
    pub listen_host: String,
    pub listen_port: u16,

    // Remote hub
    pub server_host: String,
    pub server_port: u16,
    /// Name the upstream certificate must be valid for. May differ from
    /// `server_host` when the hub sits behind a shared name.
    pub server_name: String,
    pub ca_cert: PathBuf,
    pub username: String,

    // Connection tuning
    pub buffer_size: usize,
    pub poll_delay_micros: u64,
    pub backlog: u32,
    pub connect_timeout_secs: u64,
    pub write_timeout_secs: u64,

    pub log_level: LogLevel,
    pub log_format: LogFormat,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_host: "localhost".to_string(),
            listen_port: 8000,
            server_host: "1.2.3.4".to_string(),
            server_port: 8000,
            server_name: "jupyterhub".to_string(),
            ca_cert: PathBuf::from("./my_sslca.cert"),
            username: "myusername".to_string(),
            buffer_size: 16 * 1024,
            poll_delay_micros: 0,
            backlog: 200,
            connect_timeout_secs: 10,
            write_timeout_secs: 30,
            log_level: LogLevel::Info,
            log_format: LogFormat::Text,
        }
    }
}

impl RelayConfig {
    pub fn from_file(path: &str) -> Result<Self, RelayError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("Failed to read config file {}: {}", path, e)))?;
        let config: RelayConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> Result<(), RelayError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn poll_delay(&self) -> Duration {
        Duration::from_micros(self.poll_delay_micros)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn listen_url(&self) -> String {
        format!("http://{}:{}", self.listen_host, self.listen_port)
    }

    pub fn upstream_url(&self) -> String {
        format!("https://{}:{}", self.server_host, self.server_port)
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        let mut errors = Vec::new();

        if self.listen_host.trim().is_empty() {
            errors.push("listen host must not be empty".to_string());
        }
        if self.server_host.trim().is_empty() {
            errors.push("server host must not be empty".to_string());
        }
        if self.listen_port == 0 || self.server_port == 0 {
            errors.push("ports must be non-zero".to_string());
        }
        if self.username.is_empty() {
            errors.push("username must not be empty".to_string());
        } else if self.username.contains('/') || self.username.chars().any(char::is_whitespace) {
            errors.push(format!(
                "username '{}' must not contain '/' or whitespace",
                self.username
            ));
        }
        if ServerName::try_from(self.server_name.clone()).is_err() {
            errors.push(format!("'{}' is not a valid TLS server name", self.server_name));
        }
        if self.buffer_size == 0 {
            errors.push("buffer size must be greater than zero".to_string());
        }
        if self.backlog == 0 {
            errors.push("backlog must be greater than zero".to_string());
        }
        if self.connect_timeout_secs == 0 || self.write_timeout_secs == 0 {
            errors.push("timeouts must be greater than zero".to_string());
        }
        if self.poll_delay() >= Duration::from_secs(1) {
            errors.push(format!(
                "poll delay of {}us would stall the relay",
                self.poll_delay_micros
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RelayError::Config(errors.join("; ")))
        }
    }
}
