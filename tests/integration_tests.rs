//! End-to-end tests: a real server on a loopback port, spoken to with raw MBAP frames.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use modbus_debug_server::config::ServerSettings;
use modbus_debug_server::persistence::{load_snapshot, RegisterPersistence};
use modbus_debug_server::tls::load_tls_acceptor;
use modbus_debug_server::{
    ModbusException, ModbusMetrics, ModbusServer, ModbusTcpServer, ModbusTcpServerConfig, NoopTelemetry,
    RegisterStore, StreamTransport, TelemetrySink,
};

const IO_TIMEOUT: Duration = Duration::from_secs(5);

fn local_config() -> ModbusTcpServerConfig {
    ModbusTcpServerConfig {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        ..Default::default()
    }
}

async fn start_server(
    config: ModbusTcpServerConfig,
    store: Arc<RegisterStore>,
    telemetry: Arc<dyn TelemetrySink>,
) -> (ModbusTcpServer, SocketAddr) {
    let mut server = ModbusTcpServer::with_config(config, store, telemetry).unwrap();
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();
    (server, addr)
}

/// Wrap `pdu` in an MBAP header for unit 1
fn frame(transaction_id: u16, pdu: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(7 + pdu.len());
    out.extend_from_slice(&transaction_id.to_be_bytes());
    out.extend_from_slice(&[0x00, 0x00]);
    out.extend_from_slice(&(pdu.len() as u16 + 1).to_be_bytes());
    out.push(0x01);
    out.extend_from_slice(pdu);
    out
}

/// Send one request and return the reply PDU, checking the echoed header
async fn transact<S>(stream: &mut S, transaction_id: u16, pdu: &[u8]) -> Vec<u8>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&frame(transaction_id, pdu)).await.unwrap();

    let mut header = [0u8; 7];
    timeout(IO_TIMEOUT, stream.read_exact(&mut header)).await.unwrap().unwrap();
    assert_eq!(u16::from_be_bytes([header[0], header[1]]), transaction_id);
    assert_eq!(&header[2..4], &[0x00, 0x00]);
    assert_eq!(header[6], 0x01);

    let length = u16::from_be_bytes([header[4], header[5]]) as usize;
    let mut reply = vec![0u8; length - 1];
    timeout(IO_TIMEOUT, stream.read_exact(&mut reply)).await.unwrap().unwrap();
    reply
}

#[tokio::test]
async fn test_coil_seed_read_write() {
    let settings = ServerSettings::from_json(r#"{"registers": {"zeroMode": false, "coils": {"3": true}}}"#).unwrap();
    let store = Arc::new(settings.registers.build_store(None));
    let (mut server, addr) = start_server(local_config(), store, Arc::new(NoopTelemetry)).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    assert_eq!(transact(&mut stream, 1, &[0x01, 0x00, 0x03, 0x00, 0x01]).await, vec![0x01, 0x01, 0x01]);
    assert_eq!(
        transact(&mut stream, 2, &[0x05, 0x00, 0x03, 0x00, 0x00]).await,
        vec![0x05, 0x00, 0x03, 0x00, 0x00]
    );
    assert_eq!(transact(&mut stream, 3, &[0x01, 0x00, 0x03, 0x00, 0x01]).await, vec![0x01, 0x01, 0x00]);

    // Only address 3 is configured
    assert_eq!(transact(&mut stream, 4, &[0x01, 0x00, 0x04, 0x00, 0x01]).await, vec![0x81, 0x02]);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_unsupported_function_counts_one_error() {
    let metrics = Arc::new(ModbusMetrics::new().unwrap());
    let (mut server, addr) =
        start_server(local_config(), Arc::new(RegisterStore::new(false)), metrics.clone()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    assert_eq!(transact(&mut stream, 9, &[0x63, 0x00, 0x00, 0x00, 0x01]).await, vec![0xE3, 0x01]);
    assert_eq!(metrics.error_count(ModbusException::IllegalFunction), 1);
    assert_eq!(metrics.request_count(99), 1);

    let exposition = metrics.render().unwrap();
    assert!(exposition.contains("function_99"));
    assert!(exposition.contains("illegal_function"));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_exceptions_keep_connection_open() {
    let (mut server, addr) =
        start_server(local_config(), Arc::new(RegisterStore::new(false)), Arc::new(NoopTelemetry)).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    // Address 0 does not exist outside zero mode
    assert_eq!(transact(&mut stream, 1, &[0x03, 0x00, 0x00, 0x00, 0x01]).await, vec![0x83, 0x02]);
    // Range runs past 65535
    assert_eq!(transact(&mut stream, 2, &[0x04, 0xFF, 0xFF, 0x00, 0x02]).await, vec![0x84, 0x02]);
    // Coil value must be 0xFF00 or 0x0000
    assert_eq!(transact(&mut stream, 3, &[0x05, 0x00, 0x01, 0x12, 0x34]).await, vec![0x85, 0x03]);
    // Quantity above the read limit
    assert_eq!(transact(&mut stream, 4, &[0x03, 0x00, 0x01, 0x00, 0x7E]).await, vec![0x83, 0x03]);
    // Byte count inconsistent with quantity
    assert_eq!(
        transact(&mut stream, 5, &[0x10, 0x00, 0x01, 0x00, 0x02, 0x02, 0x00, 0x01]).await,
        vec![0x90, 0x03]
    );

    // Still usable afterwards
    assert_eq!(
        transact(&mut stream, 6, &[0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x00, 0x0B]).await,
        vec![0x10, 0x00, 0x01, 0x00, 0x02]
    );
    assert_eq!(
        transact(&mut stream, 7, &[0x03, 0x00, 0x01, 0x00, 0x02]).await,
        vec![0x03, 0x04, 0x00, 0x0A, 0x00, 0x0B]
    );

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_framing_error_closes_connection() {
    let (mut server, addr) =
        start_server(local_config(), Arc::new(RegisterStore::new(false)), Arc::new(NoopTelemetry)).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    // Protocol identifier 7
    stream
        .write_all(&[0x00, 0x01, 0x00, 0x07, 0x00, 0x06, 0x01, 0x03, 0x00, 0x01, 0x00, 0x01])
        .await
        .unwrap();
    let mut buf = [0u8; 16];
    match timeout(IO_TIMEOUT, stream.read(&mut buf)).await.unwrap() {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("unexpected {} byte reply to a malformed frame", n),
    }

    // Other clients are unaffected
    let mut other = TcpStream::connect(addr).await.unwrap();
    assert_eq!(transact(&mut other, 1, &[0x04, 0x00, 0x01, 0x00, 0x01]).await, vec![0x04, 0x02, 0x00, 0x00]);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_snapshot_seeds_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registers.json");
    std::fs::write(&path, r#"{"holding_registers": {"10": 300}}"#).unwrap();

    let snapshot = load_snapshot(&path).unwrap();
    let settings = ServerSettings::default();
    let store = Arc::new(settings.registers.build_store(snapshot.as_ref()));
    let (mut server, addr) = start_server(local_config(), store, Arc::new(NoopTelemetry)).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    assert_eq!(
        transact(&mut stream, 1, &[0x03, 0x00, 0x0A, 0x00, 0x02]).await,
        vec![0x03, 0x04, 0x01, 0x2C, 0x00, 0x00]
    );

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_flushes_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("registers.json");
    let store = Arc::new(RegisterStore::new(false));
    let (mut server, addr) = start_server(local_config(), store.clone(), Arc::new(NoopTelemetry)).await;

    let persistence = Arc::new(RegisterPersistence::new(path.clone(), store, Duration::from_secs(3600)));
    let persistence_shutdown = CancellationToken::new();
    let auto_save = persistence.spawn_auto_save(persistence_shutdown.clone());

    let mut stream = TcpStream::connect(addr).await.unwrap();
    transact(&mut stream, 1, &[0x06, 0x00, 0x0A, 0x01, 0x2C]).await;
    transact(&mut stream, 2, &[0x0F, 0x00, 0x01, 0x00, 0x03, 0x01, 0x05]).await;

    server.stop().await.unwrap();
    persistence_shutdown.cancel();
    auto_save.await.unwrap();

    let saved = load_snapshot(&path).unwrap().unwrap();
    assert_eq!(saved.holding_registers.get(&10), Some(&300));
    assert_eq!(saved.coils.get(&1), Some(&true));
    assert_eq!(saved.coils.get(&2), None);
    assert_eq!(saved.coils.get(&3), Some(&true));

    // Restarting from the file reproduces the state
    let restored = ServerSettings::default().registers.build_store(Some(&saved));
    assert_eq!(restored.read_holding_registers(10, 1).unwrap(), vec![300]);
    assert_eq!(restored.read_coils(1, 3).unwrap(), vec![true, false, true]);
}

#[tokio::test]
async fn test_concurrent_writes_are_atomic() {
    let store = Arc::new(RegisterStore::new(true));
    let (mut server, addr) = start_server(local_config(), store.clone(), Arc::new(NoopTelemetry)).await;

    let mut writers = Vec::new();
    for client in 1..=4u16 {
        writers.push(tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            for round in 0..50u16 {
                let mut pdu = vec![0x10, 0x00, 0x00, 0x00, 0x10, 0x20];
                for _ in 0..16 {
                    pdu.extend_from_slice(&client.to_be_bytes());
                }
                let reply = transact(&mut stream, round, &pdu).await;
                assert_eq!(reply, vec![0x10, 0x00, 0x00, 0x00, 0x10]);
            }
        }));
    }

    let reader = tokio::spawn(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        for round in 0..100u16 {
            let reply = transact(&mut stream, round, &[0x03, 0x00, 0x00, 0x00, 0x10]).await;
            assert_eq!(reply[..2], [0x03, 0x20]);
            let first = &reply[2..4];
            assert!(reply[2..].chunks(2).all(|word| word == first), "torn read: {:?}", reply);
        }
    });

    for writer in writers {
        writer.await.unwrap();
    }
    reader.await.unwrap();

    let values = store.read_holding_registers(0, 16).unwrap();
    assert!(values.iter().all(|v| *v == values[0]));
    assert!((1..=4).contains(&values[0]));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_udp_datagrams() {
    let config = ModbusTcpServerConfig {
        udp_bind_address: Some("127.0.0.1:0".parse().unwrap()),
        ..local_config()
    };
    let store = Arc::new(RegisterStore::new(false));
    store.set_input_registers(5, &[0x1234]).unwrap();
    let (mut server, _) = start_server(config, store, Arc::new(NoopTelemetry)).await;
    let udp_addr = server.udp_local_addr().unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(&frame(0x0102, &[0x04, 0x00, 0x05, 0x00, 0x01]), udp_addr).await.unwrap();

    let mut buf = [0u8; 64];
    let (len, _) = timeout(IO_TIMEOUT, socket.recv_from(&mut buf)).await.unwrap().unwrap();
    assert_eq!(
        &buf[..len],
        &[0x01, 0x02, 0x00, 0x00, 0x00, 0x05, 0x01, 0x04, 0x02, 0x12, 0x34]
    );

    // A truncated datagram is dropped; the next valid one is still answered
    socket.send_to(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06], udp_addr).await.unwrap();
    socket.send_to(&frame(7, &[0x63]), udp_addr).await.unwrap();
    let (len, _) = timeout(IO_TIMEOUT, socket.recv_from(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..len], &[0x00, 0x07, 0x00, 0x00, 0x00, 0x03, 0x01, 0xE3, 0x01]);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_tls_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, generated.cert.pem()).unwrap();
    std::fs::write(&key_path, generated.key_pair.serialize_pem()).unwrap();

    let config = ModbusTcpServerConfig {
        transport: StreamTransport::Tls(load_tls_acceptor(&cert_path, &key_path).unwrap()),
        ..local_config()
    };
    let (mut server, addr) =
        start_server(config, Arc::new(RegisterStore::new(true)), Arc::new(NoopTelemetry)).await;

    let mut roots = rustls::RootCertStore::empty();
    roots.add(generated.cert.der().clone()).unwrap();
    let client_config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));

    let tcp = TcpStream::connect(addr).await.unwrap();
    let server_name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
    let mut tls = connector.connect(server_name, tcp).await.unwrap();

    assert_eq!(
        transact(&mut tls, 1, &[0x06, 0x00, 0x00, 0xBE, 0xEF]).await,
        vec![0x06, 0x00, 0x00, 0xBE, 0xEF]
    );
    assert_eq!(transact(&mut tls, 2, &[0x03, 0x00, 0x00, 0x00, 0x01]).await, vec![0x03, 0x02, 0xBE, 0xEF]);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_closes_idle_connections() {
    let (mut server, addr) =
        start_server(local_config(), Arc::new(RegisterStore::new(false)), Arc::new(NoopTelemetry)).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    transact(&mut stream, 1, &[0x01, 0x00, 0x01, 0x00, 0x01]).await;

    timeout(IO_TIMEOUT, server.stop()).await.unwrap().unwrap();
    assert!(!server.is_running());

    let mut buf = [0u8; 8];
    let read = timeout(IO_TIMEOUT, stream.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_stop_during_tls_handshake() {
    let dir = tempfile::tempdir().unwrap();
    let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, generated.cert.pem()).unwrap();
    std::fs::write(&key_path, generated.key_pair.serialize_pem()).unwrap();

    for idle_timeout in [Some(Duration::from_secs(300)), None] {
        let config = ModbusTcpServerConfig {
            transport: StreamTransport::Tls(load_tls_acceptor(&cert_path, &key_path).unwrap()),
            idle_timeout,
            ..local_config()
        };
        let (mut server, addr) =
            start_server(config, Arc::new(RegisterStore::new(true)), Arc::new(NoopTelemetry)).await;

        // Connected but never sends a ClientHello
        let _silent = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.get_stats().active_connections, 1);

        timeout(Duration::from_secs(3), server.stop())
            .await
            .expect("stop() waited on a pending TLS handshake")
            .unwrap();
        assert_eq!(server.get_stats().active_connections, 0);
    }
}
