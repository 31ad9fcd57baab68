//! Full client ↔ relay ↔ service loops over the in-memory relay transport

use portbridge_agent::ServiceAgent;
use portbridge_client::{PortForwarder, PortMapping};
use portbridge_transport::{
    memory_relay, RelayConnector, RelayStream, TransportError,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// TCP echo server; returns its bound address
async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

fn mapping(echo: SocketAddr, allowed_sources: &[&str], ttl_secs: u64) -> PortMapping {
    PortMapping {
        local_port: 0,
        bind_address: "127.0.0.1".parse().unwrap(),
        entity_path: "echo-tunnel".to_string(),
        remote_configuration_key: i32::from(echo.port()),
        allowed_sources: allowed_sources.iter().map(|s| s.to_string()).collect(),
        relay_channel_count: 1,
        relay_connection_ttl_secs: ttl_secs,
    }
}

fn endpoint_metadata(echo: SocketAddr) -> String {
    format!(r#"[{{"key":"endpoint","value":"{}:*"}}]"#, echo.ip())
}

/// Spin up agent + forwarder over a fresh memory relay; returns the
/// forwarder's bound address plus handles for teardown
async fn bridge(
    echo: SocketAddr,
    allowed_sources: &[&str],
) -> (SocketAddr, PortForwarder, Arc<ServiceAgent>) {
    let (connector, listener) = memory_relay(endpoint_metadata(echo));
    let agent = ServiceAgent::new(Arc::new(listener)).unwrap();
    {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run().await });
    }

    let forwarder = PortForwarder::new(mapping(echo, allowed_sources, 300), Arc::new(connector)).unwrap();
    let addr = forwarder.start().await.unwrap();
    (addr, forwarder, agent)
}

#[tokio::test]
async fn test_echo_round_trip() {
    let echo = spawn_echo().await;
    let (addr, forwarder, agent) = bridge(echo, &[]).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"Hello").await.unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"Hello");

    forwarder.stop().await;
    agent.shutdown().await;
}

#[tokio::test]
async fn test_large_payload_chunking_with_sibling_connections() {
    let echo = spawn_echo().await;
    let (addr, forwarder, agent) = bridge(echo, &[]).await;

    // A sibling connection chatting while the big transfer runs.
    let sibling = tokio::spawn(async move {
        let mut socket = TcpStream::connect(addr).await.unwrap();
        for n in 0..20u8 {
            let msg = [n; 100];
            socket.write_all(&msg).await.unwrap();
            let mut buf = [0u8; 100];
            socket.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, msg);
        }
    });

    // 500 KB: far past one frame's 65535-byte payload cap, so it must be
    // split and reassembled byte-identically.
    let payload: Vec<u8> = (0..500_000u32).map(|i| (i % 251) as u8).collect();
    let mut client = TcpStream::connect(addr).await.unwrap();
    let (mut read_half, mut write_half) = client.split();

    // Write and read concurrently so the echoed bytes never back up the pipe.
    let write = async {
        write_half.write_all(&payload).await.unwrap();
    };
    let read = async {
        let mut received = vec![0u8; payload.len()];
        read_half.read_exact(&mut received).await.unwrap();
        received
    };
    let (_, received) = tokio::join!(write, read);
    assert_eq!(received, payload);

    sibling.await.unwrap();
    forwarder.stop().await;
    agent.shutdown().await;
}

#[tokio::test]
async fn test_firewall_rejects_unlisted_source() {
    let echo = spawn_echo().await;
    // 127.0.0.1 is not inside the admitted range.
    let (addr, forwarder, agent) = bridge(echo, &["10.0.0.1-10.0.0.50"]).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    // The connection is closed immediately without any bytes exchanged.
    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).await.unwrap_or(0);
    assert_eq!(n, 0);

    forwarder.stop().await;
    agent.shutdown().await;
}

#[tokio::test]
async fn test_firewall_admits_listed_source() {
    let echo = spawn_echo().await;
    let (addr, forwarder, agent) = bridge(echo, &["127.0.0.1"]).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"ok").await.unwrap();
    let mut buf = [0u8; 2];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ok");

    forwarder.stop().await;
    agent.shutdown().await;
}

#[tokio::test]
async fn test_service_refuses_port_not_in_allowlist() {
    let echo = spawn_echo().await;
    // The listener only allows a port the client is not asking for.
    let metadata = format!(
        r#"[{{"key":"endpoint","value":"{}:1"}}]"#,
        echo.ip()
    );
    let (connector, listener) = memory_relay(metadata);
    let agent = ServiceAgent::new(Arc::new(listener)).unwrap();
    {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run().await });
    }

    let forwarder = PortForwarder::new(mapping(echo, &[], 300), Arc::new(connector)).unwrap();
    let addr = forwarder.start().await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"anyone there?").await.unwrap();
    // The service closes the relay stream after the preamble; the tunnel
    // collapses and the local connection with it.
    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).await.unwrap_or(0);
    assert_eq!(n, 0);
    assert_eq!(agent.active_tunnels(), 0);

    forwarder.stop().await;
    agent.shutdown().await;
}

/// Connector whose inner relay can be swapped, simulating the relay
/// routing to a restarted service agent
struct SwappableConnector {
    inner: Mutex<Arc<dyn RelayConnector>>,
}

impl SwappableConnector {
    fn new(inner: Arc<dyn RelayConnector>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(inner),
        })
    }

    fn swap(&self, inner: Arc<dyn RelayConnector>) {
        *self.inner.lock().unwrap() = inner;
    }
}

#[async_trait::async_trait]
impl RelayConnector for SwappableConnector {
    async fn open(&self, entity_path: &str) -> Result<RelayStream, TransportError> {
        let inner = self.inner.lock().unwrap().clone();
        inner.open(entity_path).await
    }
}

#[tokio::test]
async fn test_service_agent_restart_recovers_without_client_restart() {
    let echo = spawn_echo().await;

    let (connector1, listener1) = memory_relay(endpoint_metadata(echo));
    let agent1 = ServiceAgent::new(Arc::new(listener1)).unwrap();
    {
        let agent = agent1.clone();
        tokio::spawn(async move { agent.run().await });
    }

    let connector = SwappableConnector::new(Arc::new(connector1));
    let relay: Arc<dyn RelayConnector> = connector.clone();
    let forwarder = PortForwarder::new(mapping(echo, &[], 300), relay).unwrap();
    let addr = forwarder.start().await.unwrap();

    // Healthy before the restart.
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"before").await.unwrap();
    let mut buf = [0u8; 6];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"before");

    // Stop the service agent: the in-flight connection fails once.
    agent1.shutdown().await;
    let mut end = [0u8; 1];
    let n = client.read(&mut end).await.unwrap_or(0);
    assert_eq!(n, 0);

    // Bring up a fresh agent behind the same relay address.
    let (connector2, listener2) = memory_relay(endpoint_metadata(echo));
    let agent2 = ServiceAgent::new(Arc::new(listener2)).unwrap();
    {
        let agent = agent2.clone();
        tokio::spawn(async move { agent.run().await });
    }
    connector.swap(Arc::new(connector2));

    // The pool rotates out the dead tunnel; a new request succeeds without
    // restarting the client.
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"after").await.unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"after");

    forwarder.stop().await;
    agent2.shutdown().await;
}
