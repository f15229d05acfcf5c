use std::{net::SocketAddr, sync::Arc, sync::atomic::Ordering};

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
};
use uuid::Uuid;

use crate::porthole::tunnel::{
    protocol::{self, StreamMessage},
    registry::{BrowserEvent, PublicStream, TunnelContext},
};

const READ_BUF: usize = 8 * 1024;
const STREAM_QUEUE: usize = 64;

/// Registers a freshly accepted public TCP connection as a logical
/// stream and asks the agent to open its local counterpart.
///
/// The socket stays unread until OPEN_OK so nothing is forwarded before
/// the agent has connected to the local service.
pub async fn open_public_tcp(
    ctx: Arc<TunnelContext>,
    max_streams: usize,
    sock: TcpStream,
    peer: SocketAddr,
) {
    if max_streams > 0 && ctx.streams.len() >= max_streams {
        tracing::warn!(
            tunnel = %ctx.id,
            peer = %peer,
            cap = max_streams,
            "relay: stream cap reached; dropping public connection"
        );
        return;
    }

    let connection_id = Uuid::new_v4().to_string();
    ctx.streams
        .insert(connection_id.clone(), PublicStream::AwaitingAck { sock, peer });

    if let Err(err) = ctx
        .send_json(&StreamMessage::open(connection_id.clone(), None, None, None))
        .await
    {
        tracing::debug!(tunnel = %ctx.id, conn = %connection_id, err = %err, "relay: OPEN not sent; dropping stream");
        ctx.streams.remove(&connection_id);
        return;
    }
    tracing::debug!(tunnel = %ctx.id, conn = %connection_id, peer = %peer, "relay: public tcp stream opened");
}

/// The agent connected to the local service; start pumping both
/// directions.
pub fn on_open_ok(ctx: &Arc<TunnelContext>, connection_id: &str) {
    let Some((id, stream)) = ctx.streams.remove(connection_id) else {
        tracing::debug!(tunnel = %ctx.id, conn = %connection_id, "relay: OPEN_OK for unknown stream");
        return;
    };

    match stream {
        PublicStream::AwaitingAck { sock, peer } => {
            let (rd, wr) = sock.into_split();
            let (to_public, from_agent) = mpsc::channel::<Bytes>(STREAM_QUEUE);

            let read_task = tokio::spawn(pump_public_to_channel(ctx.clone(), id.clone(), rd));
            tokio::spawn(pump_channel_to_public(ctx.clone(), id.clone(), from_agent, wr));

            tracing::debug!(tunnel = %ctx.id, conn = %id, peer = %peer, "relay: stream acknowledged");
            ctx.streams.insert(
                id,
                PublicStream::Active {
                    to_public,
                    read_task,
                },
            );
        }
        // Duplicate OPEN_OK; put the live stream back untouched.
        active @ PublicStream::Active { .. } => {
            ctx.streams.insert(id, active);
        }
    }
}

/// Routes a binary frame from the agent to its public socket (TCP) or
/// back to the originating peer (UDP). Frames for unknown or not yet
/// acknowledged streams are dropped.
pub async fn on_frame_from_agent(ctx: &Arc<TunnelContext>, connection_id: &str, data: Bytes) {
    match ctx.kind {
        protocol::TunnelKind::Udp => {
            let peer = match ctx.udp_flows.get(connection_id) {
                Some(flow) => flow.peer,
                None => return,
            };
            let Some(sock) = ctx.udp_socket.load_full() else {
                return;
            };
            ctx.bytes_in.fetch_add(data.len() as u64, Ordering::Relaxed);
            if let Err(err) = sock.send_to(&data, peer).await {
                tracing::debug!(tunnel = %ctx.id, peer = %peer, err = %err, "relay: udp send failed");
            }
        }
        protocol::TunnelKind::Tcp => {
            let sender = match ctx.streams.get(connection_id) {
                Some(entry) => match &*entry {
                    PublicStream::Active { to_public, .. } => Some(to_public.clone()),
                    PublicStream::AwaitingAck { .. } => None,
                },
                None => None,
            };
            let Some(tx) = sender else {
                tracing::debug!(tunnel = %ctx.id, conn = %connection_id, "relay: frame for inactive stream dropped");
                return;
            };
            ctx.bytes_in.fetch_add(data.len() as u64, Ordering::Relaxed);
            let _ = tx.send(data).await;
        }
        // Browser WebSocket streams carry data as structured TEXT/BINARY
        // messages, never raw frames.
        protocol::TunnelKind::Http => {}
    }
}

/// Backward compatibility: older agents may send stream data as a
/// structured BINARY message with a base64 payload.
pub async fn on_legacy_binary(ctx: &Arc<TunnelContext>, msg: &StreamMessage) {
    let Some(b64) = msg.data_b64.as_deref() else {
        return;
    };
    match protocol::decode_b64(b64) {
        Ok(data) => on_frame_from_agent(ctx, &msg.connection_id, Bytes::from(data)).await,
        Err(err) => {
            tracing::debug!(tunnel = %ctx.id, conn = %msg.connection_id, err = %err, "relay: bad base64 payload dropped");
        }
    }
}

/// Tears down one logical stream.
///
/// Exactly-once close propagation: only the caller that wins the map
/// removal notifies the agent, so duplicate CLOSE signals (or a CLOSE
/// racing local teardown) are tolerated and ignored.
pub async fn close_stream(
    ctx: &Arc<TunnelContext>,
    connection_id: &str,
    notify_agent: bool,
    abort_reader: bool,
) {
    let Some((_, stream)) = ctx.streams.remove(connection_id) else {
        return;
    };

    if notify_agent {
        let _ = ctx.send_json(&StreamMessage::close(connection_id)).await;
    }

    if let PublicStream::Active { read_task, .. } = stream {
        if abort_reader {
            read_task.abort();
        }
        // Dropping `to_public` ends the write pump, which shuts the
        // public socket down on its way out.
    }
    tracing::debug!(tunnel = %ctx.id, conn = %connection_id, "relay: stream closed");
}

/// Handles an inbound CLOSE from the agent for any stream family.
pub async fn on_close_from_agent(ctx: &Arc<TunnelContext>, msg: &StreamMessage) {
    match ctx.kind {
        protocol::TunnelKind::Tcp => {
            close_stream(ctx, &msg.connection_id, false, true).await;
        }
        protocol::TunnelKind::Udp => {
            // No per-flow socket to close; just forget the peer mapping.
            ctx.udp_flows.remove(&msg.connection_id);
        }
        protocol::TunnelKind::Http => {
            if let Some((_, peer)) = ctx.browsers.remove(&msg.connection_id) {
                let _ = peer
                    .tx
                    .send(BrowserEvent::Close(msg.close_code, msg.close_reason.clone()))
                    .await;
            }
        }
    }
}

/// Tears down every logical stream of a tunnel (control channel lost or
/// tunnel stopped). Local sockets close, pump loops unblock, pending
/// HTTP requests fail over to their callers.
pub async fn close_all(ctx: &Arc<TunnelContext>) {
    let ids: Vec<String> = ctx.streams.iter().map(|e| e.key().clone()).collect();
    for id in ids {
        close_stream(ctx, &id, false, true).await;
    }

    let browser_ids: Vec<String> = ctx.browsers.iter().map(|e| e.key().clone()).collect();
    for id in browser_ids {
        if let Some((_, peer)) = ctx.browsers.remove(&id) {
            let _ = peer.tx.send(BrowserEvent::Close(None, None)).await;
        }
    }

    ctx.udp_flows.clear();
    ctx.drain_pending();
}

async fn pump_public_to_channel(
    ctx: Arc<TunnelContext>,
    connection_id: String,
    mut rd: tokio::net::tcp::OwnedReadHalf,
) {
    let mut buf = vec![0u8; READ_BUF];
    loop {
        match rd.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                ctx.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
                if ctx.send_frame(&connection_id, &buf[..n]).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                tracing::debug!(tunnel = %ctx.id, conn = %connection_id, err = %err, "relay: public read ended");
                break;
            }
        }
    }
    // This task is the reader; it must not abort itself before the CLOSE
    // notification goes out.
    close_stream(&ctx, &connection_id, true, false).await;
}

async fn pump_channel_to_public(
    ctx: Arc<TunnelContext>,
    connection_id: String,
    mut from_agent: mpsc::Receiver<Bytes>,
    mut wr: tokio::net::tcp::OwnedWriteHalf,
) {
    while let Some(chunk) = from_agent.recv().await {
        if let Err(err) = wr.write_all(&chunk).await {
            tracing::debug!(tunnel = %ctx.id, conn = %connection_id, err = %err, "relay: public write failed");
            break;
        }
    }
    let _ = wr.shutdown().await;
    close_stream(&ctx, &connection_id, true, true).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::porthole::tunnel::channel::{ControlChannel, WireMessage, WireSink};
    use crate::porthole::tunnel::protocol::{StreamType, TextFrame, TunnelKind};
    use crate::porthole::tunnel::registry::Registry;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::net::TcpListener;

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

    async fn tcp_ctx() -> (
        Arc<TunnelContext>,
        mpsc::UnboundedReceiver<WireMessage>,
    ) {
        let reg = Registry::new();
        let ctx = reg.get_or_create(Uuid::new_v4(), TunnelKind::Tcp);
        let (tx, rx) = mpsc::unbounded_channel();
        ctx.attach(ControlChannel::start(Box::new(CaptureSink(tx)), 16));
        (ctx, rx)
    }

    async fn accepted_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = ln.accept().await.unwrap();
        (client, server, peer)
    }

    fn recv_stream_msg(wire: &mut mpsc::UnboundedReceiver<WireMessage>) -> Option<StreamMessage> {
        loop {
            match wire.try_recv() {
                Ok(WireMessage::Text(t)) => match protocol::decode_text(&t) {
                    Ok(Some(TextFrame::Stream(s))) => return Some(s),
                    _ => continue,
                },
                Ok(WireMessage::Binary(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    #[tokio::test]
    async fn open_then_ack_starts_pumps_and_data_flows() {
        let (ctx, mut wire) = tcp_ctx().await;
        let (mut client, server, peer) = accepted_pair().await;

        open_public_tcp(ctx.clone(), 0, server, peer).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let open = recv_stream_msg(&mut wire).expect("OPEN sent");
        assert_eq!(open.ws_type, StreamType::Open);
        let conn_id = open.connection_id.clone();

        on_open_ok(&ctx, &conn_id);

        // Public bytes become frames tagged with the connection id.
        client.write_all(b"ping").await.unwrap();
        let frame = loop {
            match wire.try_recv() {
                Ok(WireMessage::Binary(b)) => break b,
                Ok(_) => continue,
                Err(_) => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            }
        };
        let (got_id, payload) = protocol::decode_frame(&frame).unwrap();
        assert_eq!(got_id, conn_id);
        assert_eq!(&payload[..], b"ping");

        // Frames from the agent land on the public socket.
        on_frame_from_agent(&ctx, &conn_id, Bytes::from_static(b"pong")).await;
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (ctx, mut wire) = tcp_ctx().await;
        let (_client, server, peer) = accepted_pair().await;

        open_public_tcp(ctx.clone(), 0, server, peer).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let conn_id = recv_stream_msg(&mut wire).unwrap().connection_id;
        on_open_ok(&ctx, &conn_id);

        close_stream(&ctx, &conn_id, true, true).await;
        assert!(ctx.streams.is_empty());

        // Second close and a late inbound CLOSE are no-ops.
        close_stream(&ctx, &conn_id, true, true).await;
        let late = StreamMessage::close(conn_id.clone());
        on_close_from_agent(&ctx, &late).await;
        assert!(ctx.streams.is_empty());
    }

    #[tokio::test]
    async fn stream_cap_drops_excess_connections() {
        let (ctx, mut wire) = tcp_ctx().await;

        let (_c1, s1, p1) = accepted_pair().await;
        open_public_tcp(ctx.clone(), 1, s1, p1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(recv_stream_msg(&mut wire).is_some());

        let (_c2, s2, p2) = accepted_pair().await;
        open_public_tcp(ctx.clone(), 1, s2, p2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(recv_stream_msg(&mut wire).is_none());
        assert_eq!(ctx.streams.len(), 1);
    }

    #[tokio::test]
    async fn frame_before_ack_is_dropped() {
        let (ctx, mut wire) = tcp_ctx().await;
        let (mut client, server, peer) = accepted_pair().await;

        open_public_tcp(ctx.clone(), 0, server, peer).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let conn_id = recv_stream_msg(&mut wire).unwrap().connection_id;

        // Not acknowledged yet; nothing may reach the public socket.
        on_frame_from_agent(&ctx, &conn_id, Bytes::from_static(b"early")).await;

        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_millis(100), client.read(&mut buf)).await;
        assert!(read.is_err(), "no bytes may flow before OPEN_OK");
    }
}
