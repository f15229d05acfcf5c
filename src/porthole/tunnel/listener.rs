use std::{sync::Arc, sync::atomic::Ordering, time::Duration};

use tokio::{
    net::{TcpListener, UdpSocket},
    sync::watch,
};

use crate::porthole::tunnel::{
    mux,
    protocol::TunnelKind,
    registry::{ListenerHandle, TunnelContext},
};

const UDP_RECV_BUF: usize = 64 * 1024;
const UDP_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ExposeOptions {
    pub desired_port: u16,
    pub max_streams: usize,
    pub udp_idle_timeout: Duration,
}

/// Binds the externally visible socket for a TCP/UDP tunnel and starts
/// its accept/receive loop.
///
/// The desired port is a hint: when it is taken the relay falls back to
/// an ephemeral port, and the caller announces the actual one via
/// EXPOSED. Re-exposing a tunnel whose listener is still running (agent
/// reconnect) returns the existing port.
pub async fn expose(
    ctx: Arc<TunnelContext>,
    opts: ExposeOptions,
) -> anyhow::Result<u16> {
    let mut slot = ctx.listener.lock().await;
    if let Some(handle) = slot.as_ref() {
        if !handle.task.is_finished() {
            return Ok(handle.port);
        }
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let (port, task) = match ctx.kind {
        TunnelKind::Tcp => {
            let ln = bind_tcp(opts.desired_port).await?;
            let port = ln.local_addr()?.port();
            let task = tokio::spawn(tcp_accept_loop(ctx.clone(), ln, opts.max_streams, stop_rx));
            (port, task)
        }
        TunnelKind::Udp => {
            let sock = Arc::new(bind_udp(opts.desired_port).await?);
            let port = sock.local_addr()?.port();
            ctx.udp_socket.store(Some(sock.clone()));
            let task = tokio::spawn(udp_receive_loop(
                ctx.clone(),
                sock,
                opts.udp_idle_timeout,
                stop_rx,
            ));
            (port, task)
        }
        TunnelKind::Http => anyhow::bail!("http tunnels have no public listener"),
    };

    tracing::info!(tunnel = %ctx.id, kind = %ctx.kind, port, "relay: public endpoint exposed");
    *slot = Some(ListenerHandle {
        port,
        stop: stop_tx,
        task,
    });
    Ok(port)
}

/// Stops the public listener (if any) and forgets the UDP socket.
pub async fn shutdown(ctx: &Arc<TunnelContext>) {
    let mut slot = ctx.listener.lock().await;
    if let Some(handle) = slot.take() {
        let _ = handle.stop.send(true);
        handle.task.abort();
    }
    ctx.udp_socket.store(None);
}

async fn bind_tcp(desired_port: u16) -> anyhow::Result<TcpListener> {
    if desired_port > 0 {
        match TcpListener::bind(("0.0.0.0", desired_port)).await {
            Ok(ln) => return Ok(ln),
            Err(err) => {
                tracing::info!(port = desired_port, err = %err, "relay: tcp port busy; falling back to an ephemeral port");
            }
        }
    }
    Ok(TcpListener::bind(("0.0.0.0", 0)).await?)
}

async fn bind_udp(desired_port: u16) -> anyhow::Result<UdpSocket> {
    if desired_port > 0 {
        match UdpSocket::bind(("0.0.0.0", desired_port)).await {
            Ok(sock) => return Ok(sock),
            Err(err) => {
                tracing::info!(port = desired_port, err = %err, "relay: udp port busy; falling back to an ephemeral port");
            }
        }
    }
    Ok(UdpSocket::bind(("0.0.0.0", 0)).await?)
}

async fn tcp_accept_loop(
    ctx: Arc<TunnelContext>,
    ln: TcpListener,
    max_streams: usize,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                match res {
                    Ok((sock, peer)) => {
                        mux::open_public_tcp(ctx.clone(), max_streams, sock, peer).await;
                    }
                    Err(err) => {
                        tracing::warn!(tunnel = %ctx.id, err = %err, "relay: tcp accept failed");
                        break;
                    }
                }
            }
        }
    }
    tracing::debug!(tunnel = %ctx.id, "relay: tcp accept loop ended");
}

async fn udp_receive_loop(
    ctx: Arc<TunnelContext>,
    sock: Arc<UdpSocket>,
    idle_timeout: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; UDP_RECV_BUF];
    let mut sweep = tokio::time::interval(UDP_SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
            }
            _ = sweep.tick() => {
                evict_idle_flows(&ctx, idle_timeout);
            }
            res = sock.recv_from(&mut buf) => {
                match res {
                    Ok((n, peer)) => {
                        // The peer address string doubles as the
                        // connection id; UDP has no open handshake.
                        let connection_id = peer.to_string();
                        ctx.touch_udp_flow(&connection_id, peer);
                        ctx.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
                        if let Err(err) = ctx.send_frame(&connection_id, &buf[..n]).await {
                            tracing::debug!(tunnel = %ctx.id, peer = %peer, err = %err, "relay: udp datagram dropped");
                        }
                    }
                    Err(err) => {
                        tracing::warn!(tunnel = %ctx.id, err = %err, "relay: udp receive failed");
                        break;
                    }
                }
            }
        }
    }
    tracing::debug!(tunnel = %ctx.id, "relay: udp receive loop ended");
}

fn evict_idle_flows(ctx: &Arc<TunnelContext>, idle_timeout: Duration) {
    if idle_timeout.is_zero() {
        return;
    }
    let now = ctx.now_ms();
    let idle_ms = idle_timeout.as_millis() as u64;
    let before = ctx.udp_flows.len();
    ctx.udp_flows
        .retain(|_, flow| now.saturating_sub(flow.last_seen_ms.load(Ordering::Relaxed)) <= idle_ms);
    let evicted = before - ctx.udp_flows.len();
    if evicted > 0 {
        tracing::debug!(tunnel = %ctx.id, evicted, "relay: idle udp flows evicted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::porthole::tunnel::channel::{ControlChannel, WireMessage, WireSink};
    use crate::porthole::tunnel::protocol;
    use crate::porthole::tunnel::registry::Registry;
    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    struct CaptureSink(mpsc::UnboundedSender<WireMessage>);

    #[async_trait]
    impl WireSink for CaptureSink {
        async fn send(&mut self, msg: WireMessage) -> anyhow::Result<()> {
            let _ = self.0.send(msg);
            Ok(())
        }
        async fn close(&mut self, _reason: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn opts() -> ExposeOptions {
        ExposeOptions {
            desired_port: 0,
            max_streams: 0,
            udp_idle_timeout: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn expose_tcp_assigns_port_and_is_stable_across_reexpose() {
        let reg = Registry::new();
        let ctx = reg.get_or_create(Uuid::new_v4(), protocol::TunnelKind::Tcp);
        let port = expose(ctx.clone(), opts()).await.unwrap();
        assert_ne!(port, 0);
        let again = expose(ctx.clone(), opts()).await.unwrap();
        assert_eq!(port, again);
        shutdown(&ctx).await;
    }

    #[tokio::test]
    async fn desired_tcp_port_collision_falls_back_to_ephemeral() {
        let taken = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let taken_port = taken.local_addr().unwrap().port();

        let reg = Registry::new();
        let ctx = reg.get_or_create(Uuid::new_v4(), protocol::TunnelKind::Tcp);
        let port = expose(
            ctx.clone(),
            ExposeOptions {
                desired_port: taken_port,
                ..opts()
            },
        )
        .await
        .unwrap();
        assert_ne!(port, 0);
        assert_ne!(port, taken_port);
        shutdown(&ctx).await;
    }

    #[tokio::test]
    async fn udp_datagrams_become_frames_keyed_by_peer() {
        let reg = Registry::new();
        let ctx = reg.get_or_create(Uuid::new_v4(), protocol::TunnelKind::Udp);
        let (tx, mut wire) = mpsc::unbounded_channel();
        ctx.attach(ControlChannel::start(Box::new(CaptureSink(tx)), 16));

        let port = expose(ctx.clone(), opts()).await.unwrap();

        let peer_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer_a.send_to(b"from-a", ("127.0.0.1", port)).await.unwrap();
        peer_b.send_to(b"from-b", ("127.0.0.1", port)).await.unwrap();

        let mut ids = Vec::new();
        for _ in 0..2 {
            let frame = tokio::time::timeout(Duration::from_secs(2), async {
                loop {
                    match wire.recv().await {
                        Some(WireMessage::Binary(b)) => break b,
                        Some(_) => continue,
                        None => panic!("wire closed"),
                    }
                }
            })
            .await
            .unwrap();
            let (id, _payload) = protocol::decode_frame(&frame).unwrap();
            ids.push(id);
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 2, "two peers must map to two logical streams");
        assert_eq!(ctx.udp_flows.len(), 2);
        shutdown(&ctx).await;
    }

    #[tokio::test]
    async fn idle_udp_flows_are_evicted() {
        let reg = Registry::new();
        let ctx = reg.get_or_create(Uuid::new_v4(), protocol::TunnelKind::Udp);
        let peer: std::net::SocketAddr = "198.51.100.7:9999".parse().unwrap();
        ctx.touch_udp_flow("198.51.100.7:9999", peer);
        assert_eq!(ctx.udp_flows.len(), 1);

        // Pretend the flow went idle past the timeout.
        ctx.udp_flows
            .get("198.51.100.7:9999")
            .unwrap()
            .last_seen_ms
            .store(0, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(30)).await;
        evict_idle_flows(&ctx, Duration::from_millis(1));
        assert!(ctx.udp_flows.is_empty());
    }
}
