//! # Error Handling
//!
//! Error types for the Modbus debug server.
//!
//! ## Overview
//!
//! Two kinds of failure flow through the server and they are kept apart:
//!
//! - **Protocol exceptions** ([`ModbusException`](crate::protocol::ModbusException)) are
//!   answers. The store and the PDU decoder return them, the dispatcher turns them into
//!   exception responses, and the connection stays open.
//! - **Server errors** ([`ModbusError`]) are everything else: broken framing, socket
//!   failures, unreadable configuration, persistence and TLS problems.
//!
//! ## Error Categories
//!
//! ### Transport Errors
//! - **I/O Errors**: socket and file system failures
//! - **Connection Errors**: peer resets, handshake failures
//! - **Timeout Errors**: idle or handshake timeouts
//!
//! ### Protocol Errors
//! - **Frame Errors**: MBAP header violations; the connection is closed without a reply
//! - **Exception**: an exception reply, carried as an error where a `ModbusError` is required
//!
//! ### System Errors
//! - **Configuration Errors**: unreadable or invalid configuration
//! - **Persistence Errors**: snapshot load/save failures
//! - **TLS Errors**: certificate/key loading and TLS setup
//! - **Internal Errors**: lock poisoning, metric registration
//!
//! ```rust
//! use modbus_debug_server::ModbusError;
//!
//! let err = ModbusError::frame("protocol identifier must be 0, got 1");
//! assert!(err.is_framing_error());
//! assert!(err.closes_connection());
//! ```

use thiserror::Error;

use crate::protocol::ModbusException;

/// Result type alias for server operations
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Server error types
///
/// Each variant carries enough context to be logged on its own; the server never
/// sends these to a client.
#[derive(Error, Debug, Clone)]
pub enum ModbusError {
    /// I/O related errors (sockets, files)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection errors
    ///
    /// # Examples
    /// - Peer reset during a TLS handshake
    /// - Listener could not be bound
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Timeout errors
    ///
    /// Includes the operation that timed out and the configured limit.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Frame errors
    ///
    /// MBAP header violations and truncated frames. A framing error ends the
    /// connection it occurred on.
    ///
    /// # Examples
    /// - Non-zero protocol identifier
    /// - Length field below 2 or above 254
    /// - Stream closed in the middle of a frame
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Modbus exception
    ///
    /// Standard exception code answered for a request.
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception { function: u8, code: u8, message: String },

    /// Configuration errors
    ///
    /// # Examples
    /// - Configuration file missing or not valid JSON
    /// - Invalid listener address
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Persistence errors
    ///
    /// # Examples
    /// - Snapshot file is not valid JSON
    /// - Snapshot entry with a malformed address or value
    /// - Snapshot directory not writable
    #[error("Persistence error: {message}")]
    Persistence { message: String },

    /// TLS setup errors
    #[error("TLS error: {message}")]
    Tls { message: String },

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ModbusError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a new timeout error
    ///
    /// # Arguments
    ///
    /// * `operation` - Description of the operation that timed out
    /// * `timeout_ms` - Timeout duration in milliseconds
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a Modbus exception error
    ///
    /// # Arguments
    ///
    /// * `function` - Function code of the request that was answered
    /// * `exception` - Exception sent back
    pub fn exception(function: u8, exception: ModbusException) -> Self {
        Self::Exception {
            function,
            code: exception.to_u8(),
            message: exception.name().to_string(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create a persistence error
    pub fn persistence<S: Into<String>>(message: S) -> Self {
        Self::Persistence { message: message.into() }
    }

    /// Create a TLS error
    pub fn tls<S: Into<String>>(message: S) -> Self {
        Self::Tls { message: message.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if the error is a framing violation
    pub fn is_framing_error(&self) -> bool {
        matches!(self, Self::Frame { .. })
    }

    /// Check if the error is a network/transport issue
    ///
    /// ```rust
    /// use modbus_debug_server::ModbusError;
    ///
    /// assert!(ModbusError::connection("reset by peer").is_transport_error());
    /// assert!(!ModbusError::frame("bad length").is_transport_error());
    /// ```
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Connection { .. } | Self::Timeout { .. } | Self::Tls { .. }
        )
    }

    /// Check if the error is a protocol issue
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Self::Exception { .. } | Self::Frame { .. })
    }

    /// Check if the error ends the connection it happened on
    ///
    /// Exception replies keep the connection open; framing and transport
    /// failures do not.
    pub fn closes_connection(&self) -> bool {
        self.is_framing_error() || self.is_transport_error()
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// Converts Tokio's timeout errors to `ModbusError::Timeout` with a generic
/// message; callers that know the limit build the error themselves.
impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

impl From<prometheus::Error> for ModbusError {
    fn from(err: prometheus::Error) -> Self {
        Self::internal(format!("metrics registry: {}", err))
    }
}

impl From<rustls::Error> for ModbusError {
    fn from(err: rustls::Error) -> Self {
        Self::tls(err.to_string())
    }
}
