/// Modbus server implementations
///
/// [`ModbusTcpServer`] accepts stream connections (plain TCP or TLS) and, when
/// configured, a UDP socket on its own port. Every stream connection runs in its
/// own task; all of them share one [`RequestDispatcher`] and therefore one
/// register store.
///
/// Shutdown: the accept loops stop, connections finish the request they are
/// working on and close, and [`ModbusServer::stop`] returns once every
/// connection task has ended.

use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use bytes::BytesMut;

use crate::codec::MbapCodec;
use crate::dispatcher::{log_close, ClientInfo, CloseReason, RequestDispatcher, TransportKind};
use crate::error::{ModbusError, ModbusResult};
use crate::store::{RegisterStore, RegisterStoreStats};
use crate::telemetry::TelemetrySink;
use crate::DEFAULT_TCP_PORT;

/// Largest datagram the UDP listener accepts
const MAX_UDP_DATAGRAM_SIZE: usize = 512;

/// Pause after a failed accept before trying again
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Modbus server trait
#[async_trait]
pub trait ModbusServer: Send + Sync {
    /// Start the server
    async fn start(&mut self) -> ModbusResult<()>;

    /// Stop the server and wait for open connections to finish
    async fn stop(&mut self) -> ModbusResult<()>;

    /// Check if server is running
    fn is_running(&self) -> bool;

    /// Get server statistics
    fn get_stats(&self) -> ServerStats;

    /// Get register store reference
    fn get_register_store(&self) -> Arc<RegisterStore>;
}

/// Server statistics
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub connections_count: u64,
    pub active_connections: u64,
    pub total_requests: u64,
    pub exception_responses: u64,
    pub uptime_seconds: u64,
    pub register_store_stats: Option<RegisterStoreStats>,
}

/// Stream transport flavour
#[derive(Clone)]
pub enum StreamTransport {
    Plain,
    Tls(TlsAcceptor),
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamTransport::Plain => f.write_str("Plain"),
            StreamTransport::Tls(_) => f.write_str("Tls"),
        }
    }
}

/// Modbus TCP server configuration
#[derive(Debug, Clone)]
pub struct ModbusTcpServerConfig {
    pub bind_address: SocketAddr,
    /// Optional UDP listener
    pub udp_bind_address: Option<SocketAddr>,
    pub max_connections: usize,
    /// Close connections idle for this long; `None` keeps them open
    pub idle_timeout: Option<Duration>,
    pub transport: StreamTransport,
}

impl Default for ModbusTcpServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], DEFAULT_TCP_PORT)),
            udp_bind_address: None,
            max_connections: 1024,
            idle_timeout: Some(Duration::from_secs(300)),
            transport: StreamTransport::Plain,
        }
    }
}

#[derive(Debug, Default)]
struct ConnectionCounters {
    total: AtomicU64,
    active: AtomicU64,
}

/// Modbus TCP/TLS/UDP server
pub struct ModbusTcpServer {
    config: ModbusTcpServerConfig,
    dispatcher: Arc<RequestDispatcher>,
    telemetry: Arc<dyn TelemetrySink>,
    counters: Arc<ConnectionCounters>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    is_running: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
    udp_local_addr: Option<SocketAddr>,
    start_time: Option<Instant>,
}

impl ModbusTcpServer {
    /// Create a new server over `store`, reporting to `telemetry`
    pub fn with_config(
        config: ModbusTcpServerConfig,
        store: Arc<RegisterStore>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> ModbusResult<Self> {
        if config.max_connections == 0 {
            return Err(ModbusError::configuration("max_connections must be at least 1"));
        }
        Ok(Self {
            config,
            dispatcher: Arc::new(RequestDispatcher::new(store, telemetry.clone())),
            telemetry,
            counters: Arc::new(ConnectionCounters::default()),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            is_running: Arc::new(AtomicBool::new(false)),
            local_addr: None,
            udp_local_addr: None,
            start_time: None,
        })
    }

    /// Address the stream listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Address the UDP socket is bound to, once started
    pub fn udp_local_addr(&self) -> Option<SocketAddr> {
        self.udp_local_addr
    }

    pub fn dispatcher(&self) -> &Arc<RequestDispatcher> {
        &self.dispatcher
    }

    /// Handle one accepted stream connection
    async fn handle_client(
        stream: TcpStream,
        peer: SocketAddr,
        transport: StreamTransport,
        dispatcher: Arc<RequestDispatcher>,
        idle_timeout: Option<Duration>,
        shutdown: CancellationToken,
    ) -> (ClientInfo, CloseReason) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        match transport {
            StreamTransport::Plain => {
                let client = ClientInfo::new(peer, TransportKind::Tcp);
                info!("📡 New client connected: {}", client);
                let reason = dispatcher.serve_connection(stream, client, idle_timeout, shutdown).await;
                (client, reason)
            }
            StreamTransport::Tls(acceptor) => {
                let client = ClientInfo::new(peer, TransportKind::Tls);
                let handshake = async {
                    let accept = acceptor.accept(stream);
                    match idle_timeout {
                        Some(limit) => match timeout(limit, accept).await {
                            Ok(result) => result.map_err(|e| {
                                ModbusError::connection(format!("TLS handshake failed: {}", e))
                            }),
                            Err(_) => Err(ModbusError::timeout("TLS handshake", limit.as_millis() as u64)),
                        },
                        None => accept
                            .await
                            .map_err(|e| ModbusError::connection(format!("TLS handshake failed: {}", e))),
                    }
                };
                let accepted = tokio::select! {
                    _ = shutdown.cancelled() => return (client, CloseReason::Shutdown),
                    accepted = handshake => accepted,
                };
                match accepted {
                    Ok(tls_stream) => {
                        info!("📡 New client connected: {}", client);
                        let reason = dispatcher
                            .serve_connection(tls_stream, client, idle_timeout, shutdown)
                            .await;
                        (client, reason)
                    }
                    Err(err) => (client, CloseReason::Transport(err)),
                }
            }
        }
    }

    /// Accept loop for stream connections
    #[allow(clippy::too_many_arguments)]
    async fn accept_loop(
        listener: TcpListener,
        transport: StreamTransport,
        dispatcher: Arc<RequestDispatcher>,
        telemetry: Arc<dyn TelemetrySink>,
        counters: Arc<ConnectionCounters>,
        limiter: Arc<Semaphore>,
        idle_timeout: Option<Duration>,
        tracker: TaskTracker,
        shutdown: CancellationToken,
    ) {
        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = limiter.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted connection from {}", peer);
                    let dispatcher = dispatcher.clone();
                    let telemetry = telemetry.clone();
                    let counters = counters.clone();
                    let transport = transport.clone();
                    let shutdown = shutdown.clone();

                    counters.total.fetch_add(1, Ordering::Relaxed);
                    counters.active.fetch_add(1, Ordering::Relaxed);
                    telemetry.client_connected();

                    tracker.spawn(async move {
                        let _permit = permit;
                        let (client, reason) = Self::handle_client(
                            stream,
                            peer,
                            transport,
                            dispatcher,
                            idle_timeout,
                            shutdown,
                        )
                        .await;
                        log_close(&client, &reason);
                        telemetry.client_disconnected();
                        counters.active.fetch_sub(1, Ordering::Relaxed);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    // Usually out of file descriptors; give open connections time to close
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
        info!("Shutdown signal received, no longer accepting connections");
    }

    /// Datagram loop: one datagram carries exactly one request frame
    async fn udp_loop(socket: UdpSocket, dispatcher: Arc<RequestDispatcher>, shutdown: CancellationToken) {
        let mut codec = MbapCodec;
        let mut buffer = vec![0u8; MAX_UDP_DATAGRAM_SIZE];

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = socket.recv_from(&mut buffer) => received,
            };

            let (len, peer) = match received {
                Ok(received) => received,
                Err(e) => {
                    error!("UDP receive failed: {}", e);
                    continue;
                }
            };

            let client = ClientInfo::new(peer, TransportKind::Udp);
            let mut datagram = BytesMut::from(&buffer[..len]);
            let frame = match codec.decode(&mut datagram) {
                Ok(Some(frame)) if datagram.is_empty() => frame,
                Ok(_) => {
                    warn!("Dropping datagram from {}: not exactly one frame ({} bytes)", client, len);
                    continue;
                }
                Err(e) => {
                    warn!("Dropping datagram from {}: {}", client, e);
                    continue;
                }
            };

            let reply = dispatcher.handle_frame(&frame, &client);
            let mut out = BytesMut::new();
            if let Err(e) = codec.encode(reply, &mut out) {
                error!("Failed to encode reply for {}: {}", client, e);
                continue;
            }
            if let Err(e) = socket.send_to(&out, peer).await {
                warn!("Failed to send reply to {}: {}", client, e);
            }
        }
        info!("UDP listener stopped");
    }

    /// Wait until every connection task has finished
    pub async fn wait(&self) {
        self.tracker.wait().await;
    }
}

#[async_trait]
impl ModbusServer for ModbusTcpServer {
    async fn start(&mut self) -> ModbusResult<()> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(ModbusError::connection("Server is already running"));
        }

        info!("🚀 Starting Modbus server on {}", self.config.bind_address);

        let listener = TcpListener::bind(self.config.bind_address).await.map_err(|e| {
            ModbusError::connection(format!("Failed to bind to {}: {}", self.config.bind_address, e))
        })?;
        self.local_addr = Some(listener.local_addr()?);

        let udp_socket = match self.config.udp_bind_address {
            Some(addr) => {
                let socket = UdpSocket::bind(addr)
                    .await
                    .map_err(|e| ModbusError::connection(format!("Failed to bind UDP to {}: {}", addr, e)))?;
                self.udp_local_addr = Some(socket.local_addr()?);
                Some(socket)
            }
            None => None,
        };

        self.start_time = Some(Instant::now());
        self.is_running.store(true, Ordering::SeqCst);

        let transport_name = match self.config.transport {
            StreamTransport::Plain => TransportKind::Tcp,
            StreamTransport::Tls(_) => TransportKind::Tls,
        };
        info!("✅ Modbus server started successfully");
        info!("📊 Server configuration:");
        info!("   - Stream listener: {} ({})", listener.local_addr()?, transport_name);
        if let Some(addr) = self.udp_local_addr {
            info!("   - UDP listener: {}", addr);
        }
        info!("   - Max connections: {}", self.config.max_connections);
        info!("   - Idle timeout: {:?}", self.config.idle_timeout);

        let limiter = Arc::new(Semaphore::new(self.config.max_connections));
        let is_running_flag = self.is_running.clone();
        let accept = Self::accept_loop(
            listener,
            self.config.transport.clone(),
            self.dispatcher.clone(),
            self.telemetry.clone(),
            self.counters.clone(),
            limiter,
            self.config.idle_timeout,
            self.tracker.clone(),
            self.shutdown.clone(),
        );
        self.tracker.spawn(async move {
            accept.await;
            is_running_flag.store(false, Ordering::SeqCst);
        });

        if let Some(socket) = udp_socket {
            self.tracker
                .spawn(Self::udp_loop(socket, self.dispatcher.clone(), self.shutdown.clone()));
        }

        Ok(())
    }

    async fn stop(&mut self) -> ModbusResult<()> {
        info!("Stopping Modbus server, waiting for open connections to finish");
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.is_running.store(false, Ordering::SeqCst);

        info!("⏹️  Modbus server stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    fn get_stats(&self) -> ServerStats {
        let dispatcher_stats = self.dispatcher.stats();
        ServerStats {
            connections_count: self.counters.total.load(Ordering::Relaxed),
            active_connections: self.counters.active.load(Ordering::Relaxed),
            total_requests: dispatcher_stats.frames_handled(),
            exception_responses: dispatcher_stats.exceptions_sent(),
            uptime_seconds: self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0),
            register_store_stats: Some(self.dispatcher.store().get_stats()),
        }
    }

    fn get_register_store(&self) -> Arc<RegisterStore> {
        self.dispatcher.store().clone()
    }
}
