use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use tokio::{
    net::UdpSocket,
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use uuid::Uuid;

use crate::porthole::tunnel::{
    channel::ControlChannel,
    protocol::{HttpMessage, TunnelKind},
};

/// Relay-side state of one public TCP connection multiplexed over a
/// control channel.
///
/// The public socket is held unread until the agent acknowledges the
/// OPEN; the kernel socket buffer is the pre-ack buffer, so no data is
/// lost and none is forwarded before OPEN_OK.
pub enum PublicStream {
    AwaitingAck { sock: tokio::net::TcpStream, peer: SocketAddr },
    Active {
        to_public: mpsc::Sender<Bytes>,
        read_task: JoinHandle<()>,
    },
}

/// One UDP flow, keyed by the peer address string that doubles as its
/// connection id. Lives until idle eviction or tunnel teardown.
pub struct UdpFlow {
    pub peer: SocketAddr,
    pub last_seen_ms: AtomicU64,
}

/// Events delivered to a bridged browser WebSocket task.
#[derive(Debug)]
pub enum BrowserEvent {
    Ack,
    Text(String),
    Binary(Bytes),
    Close(Option<u16>, Option<String>),
}

pub struct BrowserPeer {
    pub tx: mpsc::Sender<BrowserEvent>,
}

/// Handle on a running public listener (TCP accept loop or UDP receive
/// loop) for one tunnel.
pub struct ListenerHandle {
    pub port: u16,
    pub stop: watch::Sender<bool>,
    pub task: JoinHandle<()>,
}

/// Per-tunnel context: every concurrently accessed map the core needs,
/// owned here and passed explicitly instead of living in process-wide
/// globals.
pub struct TunnelContext {
    pub id: Uuid,
    pub kind: TunnelKind,
    started: Instant,

    /// Current control channel; replaced atomically on reconnect and
    /// read lock-free by everything that sends.
    channel: ArcSwapOption<ControlChannel>,
    /// Serializes attach/detach so a stale session ending late cannot
    /// clobber a fresh attachment.
    attach_lock: Mutex<()>,

    /// connection id -> public TCP stream.
    pub streams: DashMap<String, PublicStream>,
    /// connection id -> bridged browser WebSocket.
    pub browsers: DashMap<String, BrowserPeer>,
    /// request id -> pending HTTP request completion slot.
    pub pending: DashMap<String, oneshot::Sender<HttpMessage>>,
    /// peer address string -> UDP flow.
    pub udp_flows: DashMap<String, UdpFlow>,
    pub udp_socket: ArcSwapOption<UdpSocket>,

    pub listener: tokio::sync::Mutex<Option<ListenerHandle>>,

    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
}

impl std::fmt::Debug for TunnelContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelContext")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("attached", &self.attached())
            .finish_non_exhaustive()
    }
}

impl TunnelContext {
    fn new(id: Uuid, kind: TunnelKind) -> Self {
        TunnelContext {
            id,
            kind,
            started: Instant::now(),
            channel: ArcSwapOption::const_empty(),
            attach_lock: Mutex::new(()),
            streams: DashMap::new(),
            browsers: DashMap::new(),
            pending: DashMap::new(),
            udp_flows: DashMap::new(),
            udp_socket: ArcSwapOption::const_empty(),
            listener: tokio::sync::Mutex::new(None),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        }
    }

    pub fn channel(&self) -> Option<Arc<ControlChannel>> {
        self.channel.load_full()
    }

    pub fn attached(&self) -> bool {
        self.channel().is_some_and(|c| c.is_open())
    }

    /// Attaches a new control channel, returning the previous one (if
    /// any) so the caller can close it.
    pub fn attach(&self, channel: Arc<ControlChannel>) -> Option<Arc<ControlChannel>> {
        let _g = self.attach_lock.lock().expect("attach lock");
        self.channel.swap(Some(channel))
    }

    /// Detaches only if `current` is still the attached channel. A stale
    /// session that lost a reconnect race must not tear down its
    /// successor's state.
    pub fn detach_if(&self, current: &Arc<ControlChannel>) -> bool {
        let _g = self.attach_lock.lock().expect("attach lock");
        let cur = self.channel.load_full();
        if cur.as_ref().is_some_and(|c| Arc::ptr_eq(c, current)) {
            self.channel.store(None);
            true
        } else {
            false
        }
    }

    pub async fn send_json<T: Serialize>(&self, msg: &T) -> anyhow::Result<()> {
        match self.channel() {
            Some(ch) => ch.send_json(msg).await,
            None => anyhow::bail!("tunnel {}: no control channel attached", self.id),
        }
    }

    pub async fn send_frame(&self, connection_id: &str, payload: &[u8]) -> anyhow::Result<()> {
        match self.channel() {
            Some(ch) => ch.send_frame(connection_id, payload).await,
            None => anyhow::bail!("tunnel {}: no control channel attached", self.id),
        }
    }

    /// Milliseconds since this context was created; the monotonic clock
    /// behind UDP flow idle tracking.
    pub fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn touch_udp_flow(&self, connection_id: &str, peer: SocketAddr) {
        let now = self.now_ms();
        match self.udp_flows.get(connection_id) {
            Some(flow) => flow.last_seen_ms.store(now, Ordering::Relaxed),
            None => {
                self.udp_flows.insert(
                    connection_id.to_string(),
                    UdpFlow {
                        peer,
                        last_seen_ms: AtomicU64::new(now),
                    },
                );
            }
        }
    }

    /// Fails every pending HTTP request by dropping its completion slot;
    /// waiting forwards observe a closed channel.
    pub fn drain_pending(&self) {
        self.pending.clear();
    }
}

/// All tunnels known to this relay process.
pub struct Registry {
    tunnels: DashMap<Uuid, Arc<TunnelContext>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            tunnels: DashMap::new(),
        }
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<TunnelContext>> {
        self.tunnels.get(&id).map(|t| Arc::clone(t.value()))
    }

    pub fn get_or_create(&self, id: Uuid, kind: TunnelKind) -> Arc<TunnelContext> {
        let ctx = Arc::clone(
            self.tunnels
                .entry(id)
                .or_insert_with(|| Arc::new(TunnelContext::new(id, kind)))
                .value(),
        );
        if ctx.kind != kind {
            tracing::warn!(
                tunnel = %id,
                have = %ctx.kind,
                want = %kind,
                "relay: tunnel type mismatch; keeping the original"
            );
        }
        ctx
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.tunnels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::porthole::tunnel::channel::{WireMessage, WireSink};
    use async_trait::async_trait;

    struct NullSink;

    #[async_trait]
    impl WireSink for NullSink {
        async fn send(&mut self, _msg: WireMessage) -> anyhow::Result<()> {
            Ok(())
        }
        async fn close(&mut self, _reason: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn null_channel() -> Arc<ControlChannel> {
        ControlChannel::start(Box::new(NullSink), 4)
    }

    #[tokio::test]
    async fn attach_replaces_and_detach_is_guarded() {
        let reg = Registry::new();
        let ctx = reg.get_or_create(Uuid::new_v4(), TunnelKind::Tcp);

        let first = null_channel();
        assert!(ctx.attach(first.clone()).is_none());
        assert!(ctx.attached());

        let second = null_channel();
        let old = ctx.attach(second.clone()).expect("previous channel");
        assert!(Arc::ptr_eq(&old, &first));

        // The stale session must not detach the fresh channel.
        assert!(!ctx.detach_if(&first));
        assert!(ctx.attached());

        assert!(ctx.detach_if(&second));
        assert!(!ctx.attached());
    }

    #[tokio::test]
    async fn get_or_create_returns_same_context() {
        let reg = Registry::new();
        let id = Uuid::new_v4();
        let a = reg.get_or_create(id, TunnelKind::Http);
        let b = reg.get_or_create(id, TunnelKind::Http);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn send_without_channel_fails_fast() {
        let reg = Registry::new();
        let ctx = reg.get_or_create(Uuid::new_v4(), TunnelKind::Tcp);
        assert!(ctx.send_frame("c1", b"data").await.is_err());
    }
}
