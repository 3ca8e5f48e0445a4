//! Server settings loaded from environment variables.

use log::info;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::modules::transfer::request::MAX_FILE_SIZE_FIELD;

pub const DEFAULT_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 9001;
pub const DEFAULT_CHUNK_SIZE: usize = 4096;
pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 4 * 1024 * 1024 * 1024;
/// Largest accepted `CHUNK_SIZE`
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerSettings {
    pub address: String,
    pub port: u16,
    pub storage_dir: PathBuf,
    pub chunk_size: usize,
    pub max_upload_size: u64,
    /// `None` waits on the peer indefinitely.
    pub io_timeout: Option<Duration>,
    pub enable_timing_logs: bool,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            address: DEFAULT_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            storage_dir: PathBuf::from("./storage"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
            io_timeout: None,
            enable_timing_logs: false,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
        }
    }
}

impl ServerSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable source, falling back to
    /// the defaults for anything unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = ServerSettings::default();

        let chunk_size = parse_var(&lookup, "CHUNK_SIZE", defaults.chunk_size)?;
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(invalid(
                "CHUNK_SIZE",
                chunk_size,
                format!("must be in 1..={}", MAX_CHUNK_SIZE),
            ));
        }

        let max_upload_size = parse_var(&lookup, "MAX_UPLOAD_SIZE", defaults.max_upload_size)?;
        if max_upload_size == 0 || max_upload_size > MAX_FILE_SIZE_FIELD {
            return Err(invalid(
                "MAX_UPLOAD_SIZE",
                max_upload_size,
                format!("must be in 1..={}", MAX_FILE_SIZE_FIELD),
            ));
        }

        let timeout_secs: u64 = parse_var(&lookup, "IO_TIMEOUT_SECS", 0)?;

        Ok(ServerSettings {
            address: lookup("SERVER_ADDRESS").unwrap_or(defaults.address),
            port: parse_var(&lookup, "SERVER_PORT", defaults.port)?,
            storage_dir: lookup("STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_dir),
            chunk_size,
            max_upload_size,
            io_timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            enable_timing_logs: lookup("ENABLE_TIMING_LOGS")
                .unwrap_or_else(|| "false".to_string())
                .parse()
                .unwrap_or(false),
            ffmpeg_path: lookup("FFMPEG_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.ffmpeg_path),
            ffprobe_path: lookup("FFPROBE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.ffprobe_path),
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            value,
            reason: e.to_string(),
        }),
    }
}

fn invalid(var: &'static str, value: impl ToString, reason: String) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason,
    }
}

pub fn log_timing(settings: &ServerSettings, message: &str, duration: Duration) {
    if settings.enable_timing_logs {
        info!("{}: {:?}", message, duration);
    }
}
