//! End-to-end scenarios: an in-process relay and agent wired through
//! real sockets on loopback.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
    sync::watch,
};
use uuid::Uuid;

use crate::porthole::{
    config::{AgentConfig, RelayConfig, StaticTunnelConfig},
    tunnel::{
        protocol::TunnelKind,
        registry::TunnelContext,
        relay::{self, RelayState},
        session::Supervisor,
    },
};

fn relay_cfg(tunnels: Vec<StaticTunnelConfig>) -> RelayConfig {
    RelayConfig {
        listen_addr: "127.0.0.1:0".into(),
        public_host: "127.0.0.1".into(),
        domain: "test.local".into(),
        auth_token: String::new(),
        max_streams_per_tunnel: 1024,
        udp_idle_timeout: Duration::from_secs(60),
        tunnels,
    }
}

fn agent_cfg(relay_addr: SocketAddr, tunnel_id: Uuid, kind: TunnelKind, local_port: u16) -> AgentConfig {
    AgentConfig {
        server_url: format!("http://{relay_addr}"),
        tunnel_id,
        kind,
        auth_token: String::new(),
        local_host: "127.0.0.1".into(),
        local_port,
        local_scheme: "http".into(),
        public_host: String::new(),
        public_port: 0,
        heartbeat_interval: Duration::from_secs(15),
    }
}

async fn spawn_relay(state: Arc<RelayState>) -> SocketAddr {
    let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = ln.local_addr().unwrap();
    let app = relay::router(state);
    tokio::spawn(async move {
        axum::serve(ln, app).await.unwrap();
    });
    addr
}

fn spawn_agent(cfg: AgentConfig) -> watch::Sender<bool> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = Supervisor::new(cfg).unwrap();
    tokio::spawn(async move {
        let _ = supervisor.run(shutdown_rx).await;
    });
    shutdown_tx
}

async fn wait_attached(state: &Arc<RelayState>, tunnel_id: Uuid) -> Arc<TunnelContext> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(ctx) = state.registry.get(tunnel_id) {
            if ctx.attached() {
                return ctx;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "agent did not attach in time"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn public_port(ctx: &Arc<TunnelContext>) -> u16 {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(handle) = ctx.listener.lock().await.as_ref() {
            return handle.port;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "public endpoint was not exposed in time"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn spawn_local_http() -> SocketAddr {
    let app = axum::Router::new().route(
        "/status",
        axum::routing::get(|| async {
            (
                [(axum::http::header::CONTENT_TYPE, "application/json")],
                r#"{"ok":true}"#,
            )
        }),
    );
    let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = ln.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(ln, app).await.unwrap();
    });
    addr
}

async fn spawn_udp_echo() -> SocketAddr {
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = sock.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        loop {
            let Ok((n, peer)) = sock.recv_from(&mut buf).await else {
                break;
            };
            let _ = sock.send_to(&buf[..n], peer).await;
        }
    });
    addr
}

#[tokio::test]
async fn http_request_flows_through_the_tunnel() {
    let local = spawn_local_http().await;
    let tunnel_id = Uuid::new_v4();

    let state = RelayState::new(relay_cfg(vec![StaticTunnelConfig {
        id: tunnel_id,
        kind: TunnelKind::Http,
        subdomain: "demo".into(),
    }]));
    let relay_addr = spawn_relay(state.clone()).await;

    let _agent = spawn_agent(agent_cfg(relay_addr, tunnel_id, TunnelKind::Http, local.port()));
    wait_attached(&state, tunnel_id).await;

    let mut sock = TcpStream::connect(relay_addr).await.unwrap();
    sock.write_all(
        b"GET /status HTTP/1.1\r\nHost: demo.test.local\r\nConnection: close\r\n\r\n",
    )
    .await
    .unwrap();
    let mut raw = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), sock.read_to_end(&mut raw))
        .await
        .expect("response within the forward timeout")
        .unwrap();

    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 200"), "got: {text}");
    assert!(text.contains(r#"{"ok":true}"#), "got: {text}");
}

#[tokio::test]
async fn unknown_host_is_a_404_and_detached_tunnel_a_502() {
    let tunnel_id = Uuid::new_v4();
    let state = RelayState::new(relay_cfg(vec![StaticTunnelConfig {
        id: tunnel_id,
        kind: TunnelKind::Http,
        subdomain: "demo".into(),
    }]));
    let relay_addr = spawn_relay(state.clone()).await;

    for (host, expected) in [("nope.test.local", "404"), ("demo.test.local", "502")] {
        let mut sock = TcpStream::connect(relay_addr).await.unwrap();
        let req = format!("GET / HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
        sock.write_all(req.as_bytes()).await.unwrap();
        let mut raw = Vec::new();
        sock.read_to_end(&mut raw).await.unwrap();
        let text = String::from_utf8_lossy(&raw);
        assert!(
            text.starts_with(&format!("HTTP/1.1 {expected}")),
            "host {host}: got {text}"
        );
    }
}

#[tokio::test]
async fn tcp_open_with_refused_local_service_closes_the_public_socket() {
    let tunnel_id = Uuid::new_v4();
    let state = RelayState::new(relay_cfg(vec![]));
    let relay_addr = spawn_relay(state.clone()).await;

    // Port 1 refuses connections; the agent must answer OPEN with CLOSE.
    let _agent = spawn_agent(agent_cfg(relay_addr, tunnel_id, TunnelKind::Tcp, 1));
    let ctx = wait_attached(&state, tunnel_id).await;
    let port = public_port(&ctx).await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("public socket must be closed promptly")
        .unwrap();
    assert_eq!(n, 0, "no data may be forwarded");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !ctx.streams.is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(ctx.streams.is_empty());
}

#[tokio::test]
async fn tcp_bytes_roundtrip_through_the_tunnel() {
    // Local echo service.
    let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_port = ln.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = ln.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut rd, mut wr) = sock.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });

    let tunnel_id = Uuid::new_v4();
    let state = RelayState::new(relay_cfg(vec![]));
    let relay_addr = spawn_relay(state.clone()).await;
    let _agent = spawn_agent(agent_cfg(relay_addr, tunnel_id, TunnelKind::Tcp, local_port));
    let ctx = wait_attached(&state, tunnel_id).await;
    let port = public_port(&ctx).await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(b"echo me through the relay").await.unwrap();
    let mut buf = [0u8; 25];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .expect("echo within deadline")
        .unwrap();
    assert_eq!(&buf, b"echo me through the relay");
}

#[tokio::test]
async fn udp_peers_get_independent_streams_and_correct_replies() {
    let local = spawn_udp_echo().await;
    let tunnel_id = Uuid::new_v4();
    let state = RelayState::new(relay_cfg(vec![]));
    let relay_addr = spawn_relay(state.clone()).await;
    let _agent = spawn_agent(agent_cfg(relay_addr, tunnel_id, TunnelKind::Udp, local.port()));
    let ctx = wait_attached(&state, tunnel_id).await;
    let port = public_port(&ctx).await;

    let peer_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    peer_a
        .send_to(b"payload-a", ("127.0.0.1", port))
        .await
        .unwrap();
    peer_b
        .send_to(b"payload-b", ("127.0.0.1", port))
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    let (n, _) = tokio::time::timeout(Duration::from_secs(5), peer_a.recv_from(&mut buf))
        .await
        .expect("peer A reply")
        .unwrap();
    assert_eq!(&buf[..n], b"payload-a");
    let (n, _) = tokio::time::timeout(Duration::from_secs(5), peer_b.recv_from(&mut buf))
        .await
        .expect("peer B reply")
        .unwrap();
    assert_eq!(&buf[..n], b"payload-b");

    assert_eq!(ctx.udp_flows.len(), 2, "one logical stream per peer");
}
