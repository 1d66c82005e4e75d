//! Configuration management
//!
//! A TOML file provides defaults; the launcher overrides individual fields
//! from its command line before calling [`Config::target`] and
//! [`Config::listen_port`] to resolve the run mode.

use crate::protocol::PluginOptions;
use crate::sniffer::Target;
use crate::transport::HostAddress;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Dissector plugin name
    pub protocol: String,
    /// Plugin options, `key=value,key=value`
    pub options: String,
    /// Run as a SOCKS4/SOCKS5 proxy
    pub socks: bool,
    /// Forward every client to this `HOST:PORT`
    pub target: Option<String>,
    pub listen: ListenConfig,
    pub output: OutputConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content).map_err(|e| Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Where new connections are relayed to
    pub fn target(&self) -> Result<Target> {
        match (self.socks, &self.target) {
            (true, Some(_)) => Err(Error::Config(
                "invalid combination of options: SOCKS server and TCP server".to_string(),
            )),
            (true, None) => Ok(Target::Socks),
            (false, Some(target)) => Ok(Target::Forward(target.parse()?)),
            (false, None) => Err(Error::Config(
                "mandatory option is missing: SOCKS server or TCP server".to_string(),
            )),
        }
    }

    /// Port to listen at; a forwarder defaults to its remote port
    pub fn listen_port(&self) -> Result<u16> {
        match (self.listen.port, self.target()?) {
            (Some(0), _) => Err(Error::Config("invalid local port number: 0".to_string())),
            (Some(port), _) => Ok(port),
            (None, Target::Forward(HostAddress { port, .. })) => Ok(port),
            (None, Target::Socks) => Err(Error::Config(
                "mandatory option is missing: local port for the SOCKS server".to_string(),
            )),
        }
    }

    pub fn plugin_options(&self) -> PluginOptions {
        PluginOptions::parse(&self.options)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            protocol: "raw".to_string(),
            options: String::new(),
            socks: false,
            target: None,
            listen: ListenConfig::default(),
            output: OutputConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Accept-side configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Local port; required in SOCKS mode
    pub port: Option<u16>,
    /// Set `SO_REUSEADDR` on the listen socket
    pub reuse_address: bool,
    /// Read timeout for the SOCKS handshake
    pub handshake_timeout_secs: u64,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            port: None,
            reuse_address: false,
            handshake_timeout_secs: 10,
        }
    }
}

/// Dissection log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Log file; standard output when absent
    pub file: Option<PathBuf>,
    /// Append to the log file instead of truncating it
    pub append: bool,
    /// Dump the bytes behind every message
    pub raw_dump: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            file: None,
            append: false,
            raw_dump: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Example configuration written by `--generate-config`
pub fn generate_example_config() -> Config {
    Config {
        protocol: "bubuta".to_string(),
        target: Some("chat.example.com:5190".to_string()),
        listen: ListenConfig {
            port: Some(5190),
            ..ListenConfig::default()
        },
        output: OutputConfig {
            file: Some(PathBuf::from("wiretap.log")),
            append: true,
            raw_dump: true,
        },
        ..Config::default()
    }
}
