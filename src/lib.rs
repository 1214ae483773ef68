//! # Modbus Debug Server
//!
//! A configurable Modbus server for testing and simulating Modbus masters.
//! It serves one device context (four register banks) over Modbus TCP, optionally
//! TLS-wrapped, and optionally over UDP. Register contents can be seeded from the
//! configuration, persisted to a JSON snapshot and restored at startup, and every
//! request can be counted in Prometheus metrics.
//!
//! ## Features
//!
//! - **🔄 Concurrent Clients**: one task per connection, persistent connections
//! - **🔒 TLS**: rustls-based listener when a certificate and key are configured
//! - **🗂️ Dense and Sparse Banks**: 65536-entry tables or exactly the configured addresses
//! - **💾 Persistence**: atomic snapshot writes, skipped when nothing changed
//! - **📊 Metrics**: Prometheus counters per function, address and exception
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Server |
//! |------|----------|--------|
//! | 0x01 | Read Coils | ✅ |
//! | 0x02 | Read Discrete Inputs | ✅ |
//! | 0x03 | Read Holding Registers | ✅ |
//! | 0x04 | Read Input Registers | ✅ |
//! | 0x05 | Write Single Coil | ✅ |
//! | 0x06 | Write Single Register | ✅ |
//! | 0x0F | Write Multiple Coils | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ |
//!
//! Any other function code is answered with an `IllegalFunction` exception.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use modbus_debug_server::{ModbusServer, ModbusTcpServer, ModbusTcpServerConfig, NoopTelemetry, RegisterStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(RegisterStore::new(false));
//!     store.write_holding_registers(10, &[300])?;
//!
//!     let config = ModbusTcpServerConfig {
//!         bind_address: "127.0.0.1:5020".parse()?,
//!         ..Default::default()
//!     };
//!     let mut server = ModbusTcpServer::with_config(config, store, Arc::new(NoopTelemetry))?;
//!     server.start().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐
//! │ TCP / TLS / UDP │    │  Metrics (HTTP) │
//! │    listeners    │    └─────────────────┘
//! └─────────────────┘             ▲
//!          │                      │
//! ┌─────────────────┐    ┌─────────────────┐
//! │   MBAP codec    │    │ Telemetry sink  │
//! └─────────────────┘    └─────────────────┘
//!          │                      ▲
//! ┌─────────────────┐             │
//! │   Dispatcher    │─────────────┘
//! └─────────────────┘
//!          │
//! ┌─────────────────┐    ┌─────────────────┐
//! │ Register store  │◄──►│   Persistence   │
//! │ (4 banks)       │    │ (JSON snapshot) │
//! └─────────────────┘    └─────────────────┘
//! ```

/// Core error types and result handling
pub mod error;

/// Modbus protocol definitions and message handling
pub mod protocol;

/// Register bank storage layouts
pub mod register_bank;

/// The four-bank device context shared by all connections
pub mod store;

/// Parsing of address to value seed maps
pub mod seed;

/// MBAP framing and PDU encoding
pub mod codec;

/// Request execution and per-connection processing
pub mod dispatcher;

/// Modbus server implementations
pub mod server;

/// TLS acceptor setup
pub mod tls;

/// Request, error and connection counters
pub mod telemetry;

/// HTTP endpoint for the metrics
pub mod metrics_server;

/// Register snapshot persistence
pub mod persistence;

/// Configuration file model
pub mod config;

/// Logging setup
pub mod logging;

/// Utility functions
pub mod utils;

// Re-export main types for convenience
pub use config::ServerSettings;
pub use dispatcher::{ClientInfo, CloseReason, RequestDispatcher, TransportKind};
pub use error::{ModbusError, ModbusResult};
pub use logging::LogLevel;
pub use persistence::{load_snapshot, RegisterPersistence, SaveOutcome};
pub use protocol::{ModbusException, ModbusFunction, ModbusRequest, ModbusResponse, RegisterKind, RegisterValues};
pub use register_bank::{BankLayout, DenseBank, RegisterBank, SparseBank};
pub use server::{ModbusServer, ModbusTcpServer, ModbusTcpServerConfig, ServerStats, StreamTransport};
pub use store::{BankSeed, RegisterSnapshot, RegisterStore};
pub use telemetry::{ModbusMetrics, NoopTelemetry, TelemetrySink};

/// Maximum number of coils or discrete inputs in a single read
pub const MAX_COILS_PER_REQUEST: u16 = 2000;

/// Maximum number of registers in a single read
pub const MAX_REGISTERS_PER_REQUEST: u16 = 125;

/// Maximum number of coils in a single Write Multiple Coils request
pub const MAX_COILS_PER_WRITE: u16 = 1968;

/// Maximum number of registers in a single Write Multiple Registers request
pub const MAX_REGISTERS_PER_WRITE: u16 = 123;

/// Maximum Modbus TCP frame size (MBAP header + PDU)
pub const MAX_TCP_FRAME_SIZE: usize = 260;

/// Default listener port (unprivileged)
pub const DEFAULT_TCP_PORT: u16 = 5020;

/// Modbus TCP registered port
pub const MODBUS_STANDARD_PORT: u16 = 502;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Modbus Debug Server v{} - Modbus TCP/UDP/TLS simulation server", VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_limits_consistent() {
        assert_eq!(MAX_TCP_FRAME_SIZE, codec::MBAP_HEADER_SIZE + codec::MAX_PDU_SIZE);
        // 0x0F: fc + address + quantity + byte count + data
        assert!(6 + (MAX_COILS_PER_WRITE as usize + 7) / 8 <= codec::MAX_PDU_SIZE);
        // 0x10: fc + address + quantity + byte count + data
        assert!(6 + MAX_REGISTERS_PER_WRITE as usize * 2 <= codec::MAX_PDU_SIZE);
        assert!(info().contains(VERSION));
    }
}
