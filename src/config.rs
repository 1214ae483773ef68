//! Server configuration file.
//!
//! The configuration is a JSON document with a `server` and a `registers`
//! section. Every field has a default, so `{}` is a valid (if boring)
//! configuration. See `config/modbus_server.json` for a complete example.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ModbusError, ModbusResult};
use crate::logging::LogLevel;
use crate::protocol::RegisterKind;
use crate::register_bank::BankLayout;
use crate::seed::{prepare_bits, prepare_words, RawRegisterMap, SeedMode};
use crate::server::{ModbusTcpServerConfig, StreamTransport};
use crate::store::{BankSeed, RegisterSnapshot, RegisterStore};
use crate::tls::load_tls_acceptor;
use crate::DEFAULT_TCP_PORT;

/// Complete configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSettings {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub registers: RegistersConfig,
}

/// `server` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSection {
    pub listener_address: String,
    pub listener_port: u16,
    /// UDP listener port; `null` disables UDP
    pub udp_listener_port: Option<u16>,
    pub tls_params: TlsParams,
    pub logging: LoggingConfig,
    /// Seconds without a frame before a connection is closed; 0 disables
    pub idle_timeout_seconds: u64,
    pub max_connections: usize,
    pub persistence: PersistenceConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listener_address: "0.0.0.0".to_string(),
            listener_port: DEFAULT_TCP_PORT,
            udp_listener_port: None,
            tls_params: TlsParams::default(),
            logging: LoggingConfig::default(),
            idle_timeout_seconds: 300,
            max_connections: 1024,
            persistence: PersistenceConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

/// Certificate and key for the TLS listener
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsParams {
    pub private_key: Option<PathBuf>,
    pub certificate: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    pub log_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn level(&self) -> LogLevel {
        LogLevel::from_config(&self.log_level)
    }
}

/// Register snapshot persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub file: PathBuf,
    /// Seconds between saves
    pub save_interval: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            file: PathBuf::from("/app/data/registers.json"),
            save_interval: 30,
        }
    }
}

impl PersistenceConfig {
    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval)
    }
}

/// Prometheus metrics endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub listener_address: String,
    pub listener_port: u16,
    pub path: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listener_address: "0.0.0.0".to_string(),
            listener_port: 9090,
            path: "/metrics".to_string(),
        }
    }
}

impl TelemetryConfig {
    pub fn socket_addr(&self) -> ModbusResult<SocketAddr> {
        parse_socket_addr("telemetry.listenerAddress", &self.listener_address, self.listener_port)
    }
}

/// `registers` section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistersConfig {
    /// Addresses are storage indices when set; otherwise address `n` is index `n - 1`
    pub zero_mode: bool,
    /// Make every bank dense, even the seeded ones
    pub initialize_undefined_registers: bool,
    /// Sparse banks answer unconfigured addresses with the default value
    pub sparse_default_fill: bool,
    pub discrete_input: RawRegisterMap,
    pub coils: RawRegisterMap,
    pub holding_register: RawRegisterMap,
    pub input_register: RawRegisterMap,
}

impl RegistersConfig {
    /// Layout for a bank seeded with the entries that survived parsing
    fn layout_for<T>(&self, values: &BTreeMap<u16, T>) -> BankLayout {
        if values.is_empty() || self.initialize_undefined_registers {
            BankLayout::Dense
        } else {
            BankLayout::Sparse {
                default_fill: self.sparse_default_fill,
            }
        }
    }

    fn bit_seed(&self, kind: RegisterKind, raw: &RawRegisterMap) -> BankSeed<bool> {
        // Lenient parsing never fails
        let values = prepare_bits(kind, raw, SeedMode::Lenient).unwrap_or_default();
        BankSeed::new(self.layout_for(&values), values)
    }

    fn word_seed(&self, kind: RegisterKind, raw: &RawRegisterMap) -> BankSeed<u16> {
        let values = prepare_words(kind, raw, SeedMode::Lenient).unwrap_or_default();
        BankSeed::new(self.layout_for(&values), values)
    }

    /// Build the register store from the configured seeds and an optional snapshot
    ///
    /// Snapshot values replace configured ones at the same address; the bank
    /// layouts are decided by the configuration alone.
    pub fn build_store(&self, snapshot: Option<&RegisterSnapshot>) -> RegisterStore {
        let mut builder = RegisterStore::builder(self.zero_mode)
            .discrete_inputs(self.bit_seed(RegisterKind::DiscreteInputs, &self.discrete_input))
            .coils(self.bit_seed(RegisterKind::Coils, &self.coils))
            .holding_registers(self.word_seed(RegisterKind::HoldingRegisters, &self.holding_register))
            .input_registers(self.word_seed(RegisterKind::InputRegisters, &self.input_register));

        if let Some(snapshot) = snapshot {
            builder = builder.overlay_snapshot(snapshot);
        }
        builder.build()
    }
}

fn parse_socket_addr(field: &str, address: &str, port: u16) -> ModbusResult<SocketAddr> {
    let ip: IpAddr = address
        .trim()
        .parse()
        .map_err(|e| ModbusError::configuration(format!("{} {:?}: {}", field, address, e)))?;
    Ok(SocketAddr::new(ip, port))
}

impl ServerSettings {
    /// Read and parse a configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ModbusResult<Self> {
        let path = path.as_ref();
        debug!("Loading configuration from {}", path.display());
        let contents = fs::read_to_string(path).map_err(|e| {
            ModbusError::configuration(format!("Failed to read configuration file {}: {}", path.display(), e))
        })?;
        Self::from_json(&contents)
            .map_err(|e| ModbusError::configuration(format!("{}: {}", path.display(), e)))
    }

    /// Parse a configuration document
    pub fn from_json(contents: &str) -> ModbusResult<Self> {
        serde_json::from_str(contents)
            .map_err(|e| ModbusError::configuration(format!("Invalid configuration: {}", e)))
    }

    /// Check values serde cannot check
    pub fn validate(&self) -> ModbusResult<()> {
        let server = &self.server;
        if server.max_connections == 0 {
            return Err(ModbusError::configuration("server.maxConnections must be at least 1"));
        }
        if server.persistence.save_interval == 0 {
            return Err(ModbusError::configuration(
                "server.persistence.saveInterval must be at least 1 second",
            ));
        }

        let path = server.telemetry.path.as_str();
        if !path.starts_with('/') || path == "/" || path == "/health" {
            return Err(ModbusError::configuration(format!(
                "server.telemetry.path {:?} must start with '/' and must not be '/' or '/health'",
                path
            )));
        }

        self.listener_addr()?;
        if server.telemetry.enabled {
            server.telemetry.socket_addr()?;
        }
        Ok(())
    }

    /// Stream listener address
    pub fn listener_addr(&self) -> ModbusResult<SocketAddr> {
        parse_socket_addr(
            "server.listenerAddress",
            &self.server.listener_address,
            self.server.listener_port,
        )
    }

    /// UDP listener address, when a UDP port is configured
    pub fn udp_listener_addr(&self) -> ModbusResult<Option<SocketAddr>> {
        self.server
            .udp_listener_port
            .map(|port| parse_socket_addr("server.listenerAddress", &self.server.listener_address, port))
            .transpose()
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.server.idle_timeout_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Certificate and key paths, when both are configured and present on disk
    pub fn tls_files(&self) -> Option<(&Path, &Path)> {
        let params = &self.server.tls_params;
        match (&params.certificate, &params.private_key) {
            (Some(cert), Some(key)) => {
                if cert.is_file() && key.is_file() {
                    Some((cert.as_path(), key.as_path()))
                } else {
                    warn!(
                        "TLS certificate {} or key {} not found, serving plain TCP",
                        cert.display(),
                        key.display()
                    );
                    None
                }
            }
            (None, None) => None,
            _ => {
                warn!("TLS needs both tlsParams.certificate and tlsParams.privateKey, serving plain TCP");
                None
            }
        }
    }

    /// Server configuration for [`crate::server::ModbusTcpServer`]
    pub fn server_config(&self) -> ModbusResult<ModbusTcpServerConfig> {
        let transport = match self.tls_files() {
            Some((cert, key)) => StreamTransport::Tls(load_tls_acceptor(cert, key)?),
            None => StreamTransport::Plain,
        };

        Ok(ModbusTcpServerConfig {
            bind_address: self.listener_addr()?,
            udp_bind_address: self.udp_listener_addr()?,
            max_connections: self.server.max_connections,
            idle_timeout: self.idle_timeout(),
            transport,
        })
    }
}
