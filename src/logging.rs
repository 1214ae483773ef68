//! Logging setup and frame dumps.
//!
//! Library code logs through the `log` facade. The binary installs `env_logger`
//! with the level from the configuration file; `RUST_LOG` still overrides it.

use log::{debug, log_enabled, Level, LevelFilter};

use crate::codec::MbapFrame;
use crate::dispatcher::ClientInfo;
use crate::utils::format::bytes_to_hex;

/// Log levels accepted in the configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// Error messages
    Error,
    /// Warning messages
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages, including frame dumps
    Debug,
}

impl LogLevel {
    /// Convert log level to string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }

    /// Parse a configured level name, case-insensitive; unknown names map to `Info`
    pub fn from_config(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "error" | "critical" => LogLevel::Error,
            "warn" | "warning" => LogLevel::Warn,
            "debug" | "trace" => LogLevel::Debug,
            _ => LogLevel::Info,
        }
    }

    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
        }
    }
}

/// Install `env_logger` at `level`; `RUST_LOG` directives take precedence
pub fn init_logger(level: LogLevel) -> Result<(), log::SetLoggerError> {
    env_logger::Builder::new()
        .filter_level(level.to_level_filter())
        .parse_default_env()
        .format_timestamp_millis()
        .try_init()
}

/// Direction of a dumped frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Rx,
    Tx,
}

impl PacketDirection {
    fn as_str(self) -> &'static str {
        match self {
            PacketDirection::Rx => "RX",
            PacketDirection::Tx => "TX",
        }
    }
}

/// Hex dump of a frame at debug level
pub fn log_frame(direction: PacketDirection, client: &ClientInfo, frame: &MbapFrame) {
    if !log_enabled!(Level::Debug) {
        return;
    }
    debug!(
        "[MODBUS-{}] {} {} {}",
        client.transport,
        direction.as_str(),
        client.peer,
        bytes_to_hex(&frame.to_bytes())
    );
}
