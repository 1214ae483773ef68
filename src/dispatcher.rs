/// Request dispatching and per-connection processing
///
/// The dispatcher owns the path from a decoded MBAP frame to its reply:
///
/// ```text
/// frame ─► decode PDU ─► check ranges ─► execute on store ─► encode reply
///              │               │                  │
///              └───────────────┴──── exception ───┴─► exception reply
/// ```
///
/// A connection is served by [`RequestDispatcher::serve_connection`] over any
/// `AsyncRead + AsyncWrite` stream (plain TCP, TLS, or a test mock). Frames on a
/// connection are handled strictly in order. Exceptions are answered and the
/// connection stays open; framing and transport errors close it. Datagram
/// transports call [`RequestDispatcher::handle_frame`] directly.

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::codec::{self, MbapCodec, MbapFrame};
use crate::error::ModbusError;
use crate::logging::{log_frame, PacketDirection};
use crate::protocol::{ModbusException, ModbusRequest, ModbusResponse, RegisterKind, RegisterValues};
use crate::store::RegisterStore;
use crate::telemetry::TelemetrySink;

/// Transport a client is connected through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Tls,
    Udp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
            TransportKind::Udp => "UDP",
        })
    }
}

/// Where a frame came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientInfo {
    pub peer: SocketAddr,
    pub transport: TransportKind,
}

impl ClientInfo {
    pub fn new(peer: SocketAddr, transport: TransportKind) -> Self {
        Self { peer, transport }
    }
}

impl fmt::Display for ClientInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.peer, self.transport)
    }
}

/// Why a connection ended
#[derive(Debug, Clone)]
pub enum CloseReason {
    /// Peer closed the stream between frames
    ClientClosed,
    /// Malformed MBAP header or truncated frame
    Framing(ModbusError),
    /// Read/write failure
    Transport(ModbusError),
    /// No frame within the idle timeout
    IdleTimeout,
    /// Server shutdown
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ClientClosed => f.write_str("closed by client"),
            CloseReason::Framing(e) => write!(f, "framing error: {}", e),
            CloseReason::Transport(e) => write!(f, "transport error: {}", e),
            CloseReason::IdleTimeout => f.write_str("idle timeout"),
            CloseReason::Shutdown => f.write_str("server shutdown"),
        }
    }
}

/// Dispatcher counters, kept regardless of the telemetry sink
#[derive(Debug, Default)]
pub struct DispatcherStats {
    frames_handled: AtomicU64,
    exceptions_sent: AtomicU64,
}

impl DispatcherStats {
    pub fn frames_handled(&self) -> u64 {
        self.frames_handled.load(Ordering::Relaxed)
    }

    pub fn exceptions_sent(&self) -> u64 {
        self.exceptions_sent.load(Ordering::Relaxed)
    }
}

/// Executes requests against the shared register store
pub struct RequestDispatcher {
    store: Arc<RegisterStore>,
    telemetry: Arc<dyn TelemetrySink>,
    stats: DispatcherStats,
}

impl RequestDispatcher {
    pub fn new(store: Arc<RegisterStore>, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            store,
            telemetry,
            stats: DispatcherStats::default(),
        }
    }

    pub fn store(&self) -> &Arc<RegisterStore> {
        &self.store
    }

    pub fn stats(&self) -> &DispatcherStats {
        &self.stats
    }

    /// Execute a decoded request
    pub fn execute(&self, request: &ModbusRequest) -> Result<ModbusResponse, ModbusException> {
        let store = &self.store;
        let response = match request {
            ModbusRequest::ReadCoils { address, quantity } => {
                ModbusResponse::ReadCoils(store.read_coils(*address, *quantity)?)
            }
            ModbusRequest::ReadDiscreteInputs { address, quantity } => {
                ModbusResponse::ReadDiscreteInputs(store.read_discrete_inputs(*address, *quantity)?)
            }
            ModbusRequest::ReadHoldingRegisters { address, quantity } => {
                ModbusResponse::ReadHoldingRegisters(store.read_holding_registers(*address, *quantity)?)
            }
            ModbusRequest::ReadInputRegisters { address, quantity } => {
                ModbusResponse::ReadInputRegisters(store.read_input_registers(*address, *quantity)?)
            }
            ModbusRequest::WriteSingleCoil { address, value } => {
                store.write(RegisterKind::Coils, *address, &RegisterValues::Bits(vec![*value]))?;
                ModbusResponse::WriteSingleCoil {
                    address: *address,
                    value: *value,
                }
            }
            ModbusRequest::WriteSingleRegister { address, value } => {
                store.write_holding_registers(*address, &[*value])?;
                ModbusResponse::WriteSingleRegister {
                    address: *address,
                    value: *value,
                }
            }
            ModbusRequest::WriteMultipleCoils { address, values } => {
                store.write_coils(*address, values)?;
                ModbusResponse::WriteMultipleCoils {
                    address: *address,
                    quantity: values.len() as u16,
                }
            }
            ModbusRequest::WriteMultipleRegisters { address, values } => {
                store.write_holding_registers(*address, values)?;
                ModbusResponse::WriteMultipleRegisters {
                    address: *address,
                    quantity: values.len() as u16,
                }
            }
        };

        self.record_access(request);
        Ok(response)
    }

    fn record_access(&self, request: &ModbusRequest) {
        let kind = request.register_kind();
        let is_write = request.function().is_write_function();
        let start = request.address() as u32;
        for address in start..start + request.quantity() as u32 {
            self.telemetry.record_register_access(kind, address as u16, is_write);
        }
    }

    /// Turn one request frame into its reply frame
    pub fn handle_frame(&self, frame: &MbapFrame, client: &ClientInfo) -> MbapFrame {
        log_frame(PacketDirection::Rx, client, frame);
        self.stats.frames_handled.fetch_add(1, Ordering::Relaxed);

        let function_code = frame.function_code();
        self.telemetry.record_request(function_code);

        let outcome = codec::decode_request(&frame.pdu).and_then(|request| {
            debug!(
                "Processing request from {}: TID={}, Unit={}, {:?}",
                client, frame.header.transaction_id, frame.header.unit_id, request
            );
            self.execute(&request)
        });

        let pdu = match outcome {
            Ok(response) => codec::encode_response(&response),
            Err(exception) => {
                debug!(
                    "Answering function 0x{:02X} from {} with {}",
                    function_code,
                    client,
                    exception.name()
                );
                self.stats.exceptions_sent.fetch_add(1, Ordering::Relaxed);
                self.telemetry.record_error(exception);
                codec::encode_exception(function_code, exception)
            }
        };

        let reply = frame.reply(pdu);
        log_frame(PacketDirection::Tx, client, &reply);
        reply
    }

    /// Serve one stream connection until it closes
    ///
    /// Cancellation is only observed while waiting for the next frame, so a
    /// request that has been received is always answered before the connection
    /// is dropped.
    pub async fn serve_connection<S>(
        &self,
        stream: S,
        client: ClientInfo,
        idle_timeout: Option<Duration>,
        shutdown: CancellationToken,
    ) -> CloseReason
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut framed = Framed::new(stream, MbapCodec);

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return CloseReason::Shutdown,
                next = async {
                    match idle_timeout {
                        Some(limit) => timeout(limit, framed.next()).await.ok(),
                        None => Some(framed.next().await),
                    }
                } => next,
            };

            let frame = match next {
                None => return CloseReason::IdleTimeout,
                Some(None) => return CloseReason::ClientClosed,
                Some(Some(Err(e))) if e.is_framing_error() => {
                    warn!("Closing {} after framing error: {}", client, e);
                    return CloseReason::Framing(e);
                }
                Some(Some(Err(e))) => return CloseReason::Transport(e),
                Some(Some(Ok(frame))) => frame,
            };

            let reply = self.handle_frame(&frame, &client);
            if let Err(e) = framed.send(reply).await {
                return CloseReason::Transport(e);
            }
        }
    }
}

impl fmt::Debug for RequestDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestDispatcher")
            .field("store", &self.store)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

/// Log the end of a connection at a level matching its reason
pub fn log_close(client: &ClientInfo, reason: &CloseReason) {
    match reason {
        CloseReason::Transport(_) => warn!("🔌 Client {} disconnected: {}", client, reason),
        _ => info!("🔌 Client {} disconnected: {}", client, reason),
    }
}
