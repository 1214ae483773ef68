//! Request and register access telemetry.
//!
//! The dispatcher reports through [`TelemetrySink`]; nothing on the request path
//! waits on it. [`ModbusMetrics`] keeps Prometheus counters in its own registry
//! and renders them in the text exposition format:
//!
//! | Metric | Labels |
//! |--------|--------|
//! | `modbus_requests_total` | `function_code`, `function_name` |
//! | `modbus_register_reads_total` | `type`, `address` |
//! | `modbus_register_writes_total` | `type`, `address` |
//! | `modbus_errors_total` | `exception_code`, `exception_name` |
//! | `modbus_connected_clients` | |
//! | `modbus_server_uptime_seconds` | |

use prometheus::{Encoder, Gauge, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Mutex;
use std::time::Instant;

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{function_name, ModbusAddress, ModbusException, RegisterKind};

/// Receiver of server telemetry events
pub trait TelemetrySink: Send + Sync {
    /// A frame was decoded; `function_code` is the raw code, supported or not
    fn record_request(&self, function_code: u8);

    /// A request read or wrote `address` in the bank of `kind`
    fn record_register_access(&self, kind: RegisterKind, address: ModbusAddress, is_write: bool);

    /// An exception reply was sent
    fn record_error(&self, exception: ModbusException);

    fn client_connected(&self);

    fn client_disconnected(&self);
}

/// Sink that drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn record_request(&self, _function_code: u8) {}
    fn record_register_access(&self, _kind: RegisterKind, _address: ModbusAddress, _is_write: bool) {}
    fn record_error(&self, _exception: ModbusException) {}
    fn client_connected(&self) {}
    fn client_disconnected(&self) {}
}

fn function_code_label(function_code: u8) -> String {
    format!("{:02}", function_code)
}

fn exception_code_label(exception: ModbusException) -> String {
    format!("{:02}", exception.to_u8())
}

/// Prometheus-backed telemetry
pub struct ModbusMetrics {
    registry: Registry,
    requests: IntCounterVec,
    register_reads: IntCounterVec,
    register_writes: IntCounterVec,
    errors: IntCounterVec,
    connected_clients: IntGauge,
    uptime: Gauge,
    started: Mutex<Instant>,
}

impl ModbusMetrics {
    pub fn new() -> ModbusResult<Self> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("modbus_requests_total", "Total Modbus requests by function code"),
            &["function_code", "function_name"],
        )?;
        let register_reads = IntCounterVec::new(
            Opts::new("modbus_register_reads_total", "Total register reads by type and address"),
            &["type", "address"],
        )?;
        let register_writes = IntCounterVec::new(
            Opts::new("modbus_register_writes_total", "Total register writes by type and address"),
            &["type", "address"],
        )?;
        let errors = IntCounterVec::new(
            Opts::new("modbus_errors_total", "Total Modbus exception responses by exception code"),
            &["exception_code", "exception_name"],
        )?;
        let connected_clients = IntGauge::new("modbus_connected_clients", "Number of connected clients")?;
        let uptime = Gauge::new("modbus_server_uptime_seconds", "Server uptime in seconds")?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(register_reads.clone()))?;
        registry.register(Box::new(register_writes.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(connected_clients.clone()))?;
        registry.register(Box::new(uptime.clone()))?;

        Ok(Self {
            registry,
            requests,
            register_reads,
            register_writes,
            errors,
            connected_clients,
            uptime,
            started: Mutex::new(Instant::now()),
        })
    }

    fn update_uptime(&self) {
        if let Ok(started) = self.started.lock() {
            self.uptime.set(started.elapsed().as_secs_f64());
        }
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn render(&self) -> ModbusResult<String> {
        self.update_uptime();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| ModbusError::internal(format!("metrics output: {}", e)))
    }

    /// Clear every series and restart the uptime clock
    pub fn reset(&self) {
        self.requests.reset();
        self.register_reads.reset();
        self.register_writes.reset();
        self.errors.reset();
        self.connected_clients.set(0);
        if let Ok(mut started) = self.started.lock() {
            *started = Instant::now();
        }
        self.uptime.set(0.0);
    }

    /// Requests counted for a raw function code
    pub fn request_count(&self, function_code: u8) -> u64 {
        self.requests
            .with_label_values(&[&function_code_label(function_code), &function_name(function_code)])
            .get()
    }

    /// Exception replies counted for `exception`
    pub fn error_count(&self, exception: ModbusException) -> u64 {
        self.errors
            .with_label_values(&[&exception_code_label(exception), exception.name()])
            .get()
    }

    /// Accesses counted for one address
    pub fn register_access_count(&self, kind: RegisterKind, address: ModbusAddress, is_write: bool) -> u64 {
        let counter = if is_write { &self.register_writes } else { &self.register_reads };
        counter.with_label_values(&[kind.label(), &address.to_string()]).get()
    }

    pub fn connected_clients(&self) -> i64 {
        self.connected_clients.get()
    }
}

impl TelemetrySink for ModbusMetrics {
    fn record_request(&self, function_code: u8) {
        self.requests
            .with_label_values(&[&function_code_label(function_code), &function_name(function_code)])
            .inc();
    }

    fn record_register_access(&self, kind: RegisterKind, address: ModbusAddress, is_write: bool) {
        let counter = if is_write { &self.register_writes } else { &self.register_reads };
        counter.with_label_values(&[kind.label(), &address.to_string()]).inc();
    }

    fn record_error(&self, exception: ModbusException) {
        self.errors
            .with_label_values(&[&exception_code_label(exception), exception.name()])
            .inc();
    }

    fn client_connected(&self) {
        self.connected_clients.inc();
    }

    fn client_disconnected(&self) {
        if self.connected_clients.get() > 0 {
            self.connected_clients.dec();
        }
    }
}

impl std::fmt::Debug for ModbusMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusMetrics")
            .field("connected_clients", &self.connected_clients.get())
            .finish_non_exhaustive()
    }
}
