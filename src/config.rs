//! Server configuration
//!
//! Runtime settings come from an optional `raiden.conf` beside the
//! executable (falling back to the working directory), holding simple
//! `key = value` lines. A missing file means defaults for everything; an
//! invalid value for one key warns and falls back to that key's default.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::warn;

/// Port at which remote clients connect.
pub const DEFAULT_CLIENT_PORT: u16 = 12345;

/// Port at which the HTTP status server listens.
pub const DEFAULT_HTTP_PORT: u16 = 8000;

/// Maximum simultaneous clients.
pub const DEFAULT_MAX_CONNECTIONS: usize = 32;

/// Default length of a recording, in seconds.
pub const DEFAULT_RECORDING_LENGTH: u32 = 1000;

/// Default interval between reads from the data source, in milliseconds.
pub const DEFAULT_READ_INTERVAL: u32 = 10;

/// Maximum span of a single data chunk request, in seconds.
pub const DEFAULT_MAX_CHUNK_SIZE: f64 = 10.0;

/// Timestamp format for default recording filenames.
pub const SAVE_FILENAME_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";

/// Immutable server settings, fixed at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port for the client protocol listener.
    pub port: u16,
    /// Port for the HTTP status listener.
    pub http_port: u16,
    /// Connection cap; further clients are turned away at accept time.
    pub max_connections: usize,
    /// Initial recording length in seconds (clients may change it).
    pub recording_length: u32,
    /// Initial source read interval in milliseconds (clients may change it).
    pub read_interval: u32,
    /// Largest chunk of data, in seconds, a client may request at once.
    pub max_chunk_size: f64,
    /// Initial directory for recording files.
    pub save_directory: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_CLIENT_PORT,
            http_port: DEFAULT_HTTP_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            recording_length: DEFAULT_RECORDING_LENGTH,
            read_interval: DEFAULT_READ_INTERVAL,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            save_directory: default_save_directory(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from the standard locations, or defaults when no
    /// config file exists.
    pub fn load() -> Self {
        match find_config_file() {
            Some(path) => Self::from_file(&path),
            None => {
                warn!("No configuration file found. Using defaults for all values.");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific file, warning and falling back to
    /// the default for each key that fails to parse.
    pub fn from_file(path: &Path) -> Self {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                warn!(path = %path.display(), error = %e,
                    "Could not read configuration file. Using defaults for all values.");
                return Self::default();
            }
        };
        Self::from_str_lossy(&text)
    }

    /// Parse `key = value` lines, warning and keeping the default for any
    /// value that does not parse.
    pub fn from_str_lossy(text: &str) -> Self {
        let values = parse_ini(text);
        let mut config = Self::default();
        read_key(&values, "port", &mut config.port);
        read_key(&values, "http-port", &mut config.http_port);
        read_key(&values, "max-connections", &mut config.max_connections);
        read_key(&values, "recording-length", &mut config.recording_length);
        read_key(&values, "read-interval", &mut config.read_interval);
        read_key(&values, "max-chunk-size", &mut config.max_chunk_size);
        config
    }
}

/// Parse INI-style text into a key/value map. Section headers, blank lines
/// and `#`/`;` comments are skipped.
fn parse_ini(text: &str) -> HashMap<String, String> {
    let mut values = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') || line.starts_with('[')
        {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            values.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    values
}

fn read_key<T>(values: &HashMap<String, String>, key: &str, slot: &mut T)
where
    T: FromStr + std::fmt::Display + Copy,
{
    if let Some(raw) = values.get(key) {
        match raw.parse::<T>() {
            Ok(value) => *slot = value,
            Err(_) => warn!(
                "Invalid {key} in configuration file, using default of {slot}"
            ),
        }
    }
}

/// The user's desktop when a home directory is known, otherwise the working
/// directory.
fn default_save_directory() -> String {
    match std::env::var("HOME") {
        Ok(home) if !home.is_empty() => format!("{home}/Desktop"),
        _ => ".".to_string(),
    }
}

/// Look for `raiden.conf` beside the executable, then in the working
/// directory.
fn find_config_file() -> Option<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            candidates.push(dir.join("raiden.conf"));
        }
    }
    candidates.push(PathBuf::from("raiden.conf"));
    candidates.into_iter().find(|p| p.exists())
}
