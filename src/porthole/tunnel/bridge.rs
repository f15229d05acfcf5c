use std::{
    collections::HashMap,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use dashmap::{DashMap, mapref::entry::Entry};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_tungstenite::tungstenite::{
    Message as WsMessage, client::IntoClientRequest, protocol::CloseFrame,
    protocol::frame::coding::CloseCode,
};

use crate::porthole::{
    config::AgentConfig,
    tunnel::{
        channel::ControlChannel,
        protocol::{
            self, ControlMessage, ControlType, HttpKind, HttpMessage, StreamMessage, StreamType,
            TextFrame, TunnelKind,
        },
    },
};

pub const LOCAL_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_BUF: usize = 8 * 1024;
const STREAM_QUEUE: usize = 64;
const UDP_RECV_BUF: usize = 64 * 1024;

/// Edge-side state: the current control channel plus every local socket
/// pumping bytes for a logical stream.
pub struct AgentState {
    pub cfg: AgentConfig,
    channel: ArcSwapOption<ControlChannel>,
    tcp_locals: DashMap<String, LocalTcp>,
    udp_locals: DashMap<String, LocalUdp>,
    ws_locals: DashMap<String, LocalWs>,
    http: reqwest::Client,
    warned_reassignment: AtomicBool,
}

struct LocalTcp {
    to_local: mpsc::Sender<Bytes>,
    read_task: OnceLock<JoinHandle<()>>,
}

struct LocalUdp {
    sock: Arc<UdpSocket>,
    task: JoinHandle<()>,
}

struct LocalWs {
    tx: mpsc::Sender<LocalWsCmd>,
    task: OnceLock<JoinHandle<()>>,
}

enum LocalWsCmd {
    Text(String),
    Binary(Vec<u8>),
    Close(Option<u16>, Option<String>),
}

impl AgentState {
    pub fn new(cfg: AgentConfig) -> anyhow::Result<Arc<Self>> {
        // Redirects proxy back to the public client instead of being
        // followed here.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Arc::new(AgentState {
            cfg,
            channel: ArcSwapOption::const_empty(),
            tcp_locals: DashMap::new(),
            udp_locals: DashMap::new(),
            ws_locals: DashMap::new(),
            http,
            warned_reassignment: AtomicBool::new(false),
        }))
    }

    pub fn set_channel(&self, channel: Arc<ControlChannel>) {
        self.channel.store(Some(channel));
    }

    pub fn clear_channel(&self) {
        self.channel.store(None);
    }

    pub async fn send_json<T: Serialize>(&self, msg: &T) -> anyhow::Result<()> {
        match self.channel.load_full() {
            Some(ch) => ch.send_json(msg).await,
            None => anyhow::bail!("agent: no control channel"),
        }
    }

    pub async fn send_frame(&self, connection_id: &str, payload: &[u8]) -> anyhow::Result<()> {
        match self.channel.load_full() {
            Some(ch) => ch.send_frame(connection_id, payload).await,
            None => anyhow::bail!("agent: no control channel"),
        }
    }

    #[cfg(test)]
    fn tcp_local_count(&self) -> usize {
        self.tcp_locals.len()
    }
}

/// Handles one text message from the relay.
pub async fn dispatch_text(state: &Arc<AgentState>, raw: &str) {
    match protocol::decode_text(raw) {
        Ok(Some(TextFrame::Control(ctrl))) => {
            if ctrl.control_type == ControlType::Ping {
                let _ = state.send_json(&ControlMessage::pong()).await;
            }
        }
        Ok(Some(TextFrame::Http(msg))) => {
            if msg.kind == Some(HttpKind::Request) {
                // Offloaded so a slow local service never blocks the
                // control receive loop.
                let state = state.clone();
                tokio::spawn(async move { handle_http_request(state, msg).await });
            } else {
                tracing::debug!("agent: ignoring non-REQUEST http message");
            }
        }
        Ok(Some(TextFrame::Stream(msg))) => handle_stream(state, msg).await,
        Ok(None) => {}
        Err(err) => {
            tracing::debug!(err = %err, "agent: malformed control message dropped");
        }
    }
}

/// Routes a binary frame from the relay to its local socket.
pub async fn dispatch_frame(state: &Arc<AgentState>, connection_id: &str, data: Bytes) {
    match state.cfg.kind {
        TunnelKind::Tcp => {
            let sender = state
                .tcp_locals
                .get(connection_id)
                .map(|l| l.to_local.clone());
            match sender {
                Some(tx) => {
                    let _ = tx.send(data).await;
                }
                None => {
                    tracing::debug!(conn = %connection_id, "agent: frame for unknown stream dropped");
                }
            }
        }
        TunnelKind::Udp => {
            let sock = match local_udp(state, connection_id).await {
                Ok(sock) => sock,
                Err(err) => {
                    tracing::debug!(conn = %connection_id, err = %err, "agent: local udp socket failed");
                    return;
                }
            };
            if let Err(err) = sock.send(&data).await {
                tracing::debug!(conn = %connection_id, err = %err, "agent: local udp send failed");
            }
        }
        // Browser WebSocket data arrives as structured messages.
        TunnelKind::Http => {}
    }
}

async fn handle_stream(state: &Arc<AgentState>, msg: StreamMessage) {
    match msg.ws_type {
        StreamType::Exposed => on_exposed(state, &msg),
        StreamType::Open => match state.cfg.kind {
            TunnelKind::Tcp => {
                let state = state.clone();
                tokio::spawn(async move { open_local_tcp(state, msg.connection_id).await });
            }
            TunnelKind::Http => {
                let state = state.clone();
                tokio::spawn(async move { open_local_ws(state, msg).await });
            }
            // UDP has no per-flow open; acknowledge for compatibility.
            TunnelKind::Udp => {
                let _ = state
                    .send_json(&StreamMessage::open_ok(&msg.connection_id))
                    .await;
            }
        },
        StreamType::Text => {
            if let Some(tx) = ws_local_tx(state, &msg.connection_id) {
                let _ = tx
                    .send(LocalWsCmd::Text(msg.text.unwrap_or_default()))
                    .await;
            }
        }
        StreamType::Binary => on_legacy_binary(state, &msg).await,
        StreamType::Close => match state.cfg.kind {
            TunnelKind::Tcp => close_local_tcp(state, &msg.connection_id, false, true).await,
            TunnelKind::Http => {
                if let Some(tx) = ws_local_tx(state, &msg.connection_id) {
                    let _ = tx
                        .send(LocalWsCmd::Close(msg.close_code, msg.close_reason.clone()))
                        .await;
                }
            }
            TunnelKind::Udp => {
                if let Some((_, local)) = state.udp_locals.remove(&msg.connection_id) {
                    local.task.abort();
                }
            }
        },
        StreamType::OpenOk => {}
    }
}

fn on_exposed(state: &Arc<AgentState>, msg: &StreamMessage) {
    let (Some(host), Some(port)) = (msg.public_host.as_deref(), msg.public_port) else {
        return;
    };
    tracing::info!(public_host = %host, public_port = port, "agent: tunnel exposed");

    let cfg = &state.cfg;
    let host_differs = !cfg.public_host.is_empty() && cfg.public_host != host;
    let port_differs = cfg.public_port != 0 && cfg.public_port != port;
    if (host_differs || port_differs)
        && !state.warned_reassignment.swap(true, Ordering::SeqCst)
    {
        tracing::warn!(
            requested_host = %cfg.public_host,
            requested_port = cfg.public_port,
            actual_host = %host,
            actual_port = port,
            "agent: exposed on a different public endpoint than requested"
        );
    }
}

/// Backward compatibility: stream data as a structured BINARY message
/// with a base64 payload.
async fn on_legacy_binary(state: &Arc<AgentState>, msg: &StreamMessage) {
    match state.cfg.kind {
        TunnelKind::Http => {
            let Some(b64) = msg.data_b64.as_deref() else {
                return;
            };
            match protocol::decode_b64(b64) {
                Ok(data) => {
                    if let Some(tx) = ws_local_tx(state, &msg.connection_id) {
                        let _ = tx.send(LocalWsCmd::Binary(data)).await;
                    }
                }
                Err(err) => {
                    tracing::debug!(err = %err, "agent: bad base64 payload dropped");
                }
            }
        }
        TunnelKind::Tcp | TunnelKind::Udp => {
            let Some(b64) = msg.data_b64.as_deref() else {
                return;
            };
            match protocol::decode_b64(b64) {
                Ok(data) => dispatch_frame(state, &msg.connection_id, Bytes::from(data)).await,
                Err(err) => {
                    tracing::debug!(err = %err, "agent: bad base64 payload dropped");
                }
            }
        }
    }
}

fn ws_local_tx(state: &Arc<AgentState>, connection_id: &str) -> Option<mpsc::Sender<LocalWsCmd>> {
    state.ws_locals.get(connection_id).map(|l| l.tx.clone())
}

/// OPEN for a TCP tunnel: connect to the local service within a bounded
/// timeout and acknowledge, or refuse with an immediate CLOSE. An OPEN
/// is never silently dropped.
async fn open_local_tcp(state: Arc<AgentState>, connection_id: String) {
    let addr = (state.cfg.local_host.clone(), state.cfg.local_port);
    let sock = match tokio::time::timeout(LOCAL_CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(sock)) => sock,
        Ok(Err(err)) => {
            tracing::warn!(conn = %connection_id, err = %err, "agent: local connect failed");
            let _ = state
                .send_json(&StreamMessage::close(&connection_id))
                .await;
            return;
        }
        Err(_) => {
            tracing::warn!(conn = %connection_id, "agent: local connect timed out");
            let _ = state
                .send_json(&StreamMessage::close(&connection_id))
                .await;
            return;
        }
    };

    let (rd, wr) = sock.into_split();
    let (to_local, from_relay) = mpsc::channel::<Bytes>(STREAM_QUEUE);
    state.tcp_locals.insert(
        connection_id.clone(),
        LocalTcp {
            to_local,
            read_task: OnceLock::new(),
        },
    );
    tokio::spawn(pump_channel_to_local(
        state.clone(),
        connection_id.clone(),
        from_relay,
        wr,
    ));

    // The ack goes onto the writer queue before the read pump starts,
    // so the relay always sees OPEN_OK ahead of the first data frame.
    if state
        .send_json(&StreamMessage::open_ok(&connection_id))
        .await
        .is_err()
    {
        close_local_tcp(&state, &connection_id, false, true).await;
        return;
    }

    let read_task = tokio::spawn(pump_local_to_channel(
        state.clone(),
        connection_id.clone(),
        rd,
    ));
    match state.tcp_locals.get(&connection_id) {
        Some(entry) => {
            let _ = entry.read_task.set(read_task);
        }
        // Already closed while we were setting up.
        None => read_task.abort(),
    }
    tracing::debug!(conn = %connection_id, "agent: local tcp stream opened");
}

/// Tears down one local TCP stream; duplicate closes are no-ops and the
/// CLOSE signal goes to whoever wins the map removal.
async fn close_local_tcp(
    state: &Arc<AgentState>,
    connection_id: &str,
    notify_relay: bool,
    abort_reader: bool,
) {
    let Some((_, local)) = state.tcp_locals.remove(connection_id) else {
        return;
    };
    if notify_relay {
        let _ = state
            .send_json(&StreamMessage::close(connection_id))
            .await;
    }
    if abort_reader {
        if let Some(task) = local.read_task.get() {
            task.abort();
        }
    }
    tracing::debug!(conn = %connection_id, "agent: local tcp stream closed");
}

async fn pump_local_to_channel(
    state: Arc<AgentState>,
    connection_id: String,
    mut rd: tokio::net::tcp::OwnedReadHalf,
) {
    let mut buf = vec![0u8; READ_BUF];
    loop {
        match rd.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if state.send_frame(&connection_id, &buf[..n]).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                tracing::debug!(conn = %connection_id, err = %err, "agent: local read ended");
                break;
            }
        }
    }
    close_local_tcp(&state, &connection_id, true, false).await;
}

async fn pump_channel_to_local(
    state: Arc<AgentState>,
    connection_id: String,
    mut from_relay: mpsc::Receiver<Bytes>,
    mut wr: tokio::net::tcp::OwnedWriteHalf,
) {
    while let Some(chunk) = from_relay.recv().await {
        if let Err(err) = wr.write_all(&chunk).await {
            tracing::debug!(conn = %connection_id, err = %err, "agent: local write failed");
            break;
        }
    }
    let _ = wr.shutdown().await;
    close_local_tcp(&state, &connection_id, true, true).await;
}

/// One local UDP socket per connection id, created on first use and kept
/// for the tunnel's lifetime.
async fn local_udp(
    state: &Arc<AgentState>,
    connection_id: &str,
) -> anyhow::Result<Arc<UdpSocket>> {
    if let Some(local) = state.udp_locals.get(connection_id) {
        return Ok(local.sock.clone());
    }

    let sock = UdpSocket::bind("0.0.0.0:0").await?;
    sock.connect((state.cfg.local_host.as_str(), state.cfg.local_port))
        .await?;
    let sock = Arc::new(sock);

    let task = tokio::spawn(pump_udp_local_to_channel(
        state.clone(),
        connection_id.to_string(),
        sock.clone(),
    ));

    match state.udp_locals.entry(connection_id.to_string()) {
        Entry::Occupied(existing) => {
            // Lost a create race; keep the first socket.
            task.abort();
            Ok(existing.get().sock.clone())
        }
        Entry::Vacant(slot) => {
            slot.insert(LocalUdp {
                sock: sock.clone(),
                task,
            });
            Ok(sock)
        }
    }
}

async fn pump_udp_local_to_channel(
    state: Arc<AgentState>,
    connection_id: String,
    sock: Arc<UdpSocket>,
) {
    let mut buf = vec![0u8; UDP_RECV_BUF];
    loop {
        match sock.recv(&mut buf).await {
            Ok(n) => {
                if state.send_frame(&connection_id, &buf[..n]).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                tracing::debug!(conn = %connection_id, err = %err, "agent: local udp receive ended");
                break;
            }
        }
    }
    state.udp_locals.remove(&connection_id);
}

/// OPEN for an HTTP tunnel: bridge a browser WebSocket by dialing the
/// local service's WebSocket endpoint with the forwarded handshake
/// headers.
async fn open_local_ws(state: Arc<AgentState>, msg: StreamMessage) {
    let connection_id = msg.connection_id.clone();
    let scheme = if state.cfg.local_scheme == "https" {
        "wss"
    } else {
        "ws"
    };
    let mut url = format!(
        "{scheme}://{}:{}{}",
        state.cfg.local_host,
        state.cfg.local_port,
        msg.path.as_deref().unwrap_or("/")
    );
    if let Some(query) = msg.query.as_deref() {
        if !query.is_empty() {
            url.push('?');
            url.push_str(query);
        }
    }

    let request = match build_local_ws_request(&url, msg.headers.as_ref()) {
        Ok(req) => req,
        Err(err) => {
            tracing::warn!(conn = %connection_id, err = %err, "agent: bad local ws request");
            let _ = state
                .send_json(&StreamMessage::close(&connection_id))
                .await;
            return;
        }
    };

    let ws = match tokio::time::timeout(
        LOCAL_CONNECT_TIMEOUT,
        tokio_tungstenite::connect_async(request),
    )
    .await
    {
        Ok(Ok((ws, _resp))) => ws,
        Ok(Err(err)) => {
            tracing::warn!(conn = %connection_id, err = %err, "agent: local ws connect failed");
            let _ = state
                .send_json(&StreamMessage::close(&connection_id))
                .await;
            return;
        }
        Err(_) => {
            tracing::warn!(conn = %connection_id, "agent: local ws connect timed out");
            let _ = state
                .send_json(&StreamMessage::close(&connection_id))
                .await;
            return;
        }
    };

    let (tx, rx) = mpsc::channel::<LocalWsCmd>(STREAM_QUEUE);
    state.ws_locals.insert(
        connection_id.clone(),
        LocalWs {
            tx,
            task: OnceLock::new(),
        },
    );

    if state
        .send_json(&StreamMessage::open_ok(&connection_id))
        .await
        .is_err()
    {
        state.ws_locals.remove(&connection_id);
        return;
    }

    let task = tokio::spawn(run_local_ws(state.clone(), connection_id.clone(), ws, rx));
    match state.ws_locals.get(&connection_id) {
        Some(entry) => {
            let _ = entry.task.set(task);
        }
        None => task.abort(),
    }
    tracing::debug!(conn = %connection_id, "agent: local ws stream opened");
}

fn build_local_ws_request(
    url: &str,
    headers: Option<&HashMap<String, String>>,
) -> anyhow::Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
    let mut request = url.into_client_request()?;
    if let Some(headers) = headers {
        for (name, value) in headers {
            let lower = name.to_ascii_lowercase();
            if lower == "host"
                || lower == "connection"
                || lower == "upgrade"
                || lower.starts_with("sec-websocket")
            {
                continue;
            }
            let Ok(name) =
                tokio_tungstenite::tungstenite::http::HeaderName::try_from(name.as_str())
            else {
                continue;
            };
            if let Ok(value) =
                tokio_tungstenite::tungstenite::http::HeaderValue::try_from(value.as_str())
            {
                request.headers_mut().insert(name, value);
            }
        }
    }
    Ok(request)
}

async fn run_local_ws(
    state: Arc<AgentState>,
    connection_id: String,
    mut ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    mut rx: mpsc::Receiver<LocalWsCmd>,
) {
    let mut notify_relay = true;
    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(LocalWsCmd::Text(t)) => {
                    if ws.send(WsMessage::Text(t.into())).await.is_err() {
                        break;
                    }
                }
                Some(LocalWsCmd::Binary(b)) => {
                    if ws.send(WsMessage::Binary(b.into())).await.is_err() {
                        break;
                    }
                }
                Some(LocalWsCmd::Close(code, reason)) => {
                    let _ = ws
                        .send(WsMessage::Close(Some(CloseFrame {
                            code: code.map(CloseCode::from).unwrap_or(CloseCode::Normal),
                            reason: reason.unwrap_or_default().into(),
                        })))
                        .await;
                    notify_relay = false;
                    break;
                }
                None => {
                    notify_relay = false;
                    break;
                }
            },
            msg = ws.next() => match msg {
                Some(Ok(WsMessage::Text(t))) => {
                    if state
                        .send_json(&StreamMessage::text(&connection_id, t.to_string()))
                        .await
                        .is_err()
                    {
                        notify_relay = false;
                        break;
                    }
                }
                Some(Ok(WsMessage::Binary(b))) => {
                    if state
                        .send_json(&StreamMessage::binary(&connection_id, &b))
                        .await
                        .is_err()
                    {
                        notify_relay = false;
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    if notify_relay {
                        let (code, reason) = match frame {
                            Some(f) => (Some(u16::from(f.code)), Some(f.reason.to_string())),
                            None => (None, None),
                        };
                        if state.ws_locals.remove(&connection_id).is_some() {
                            let _ = state
                                .send_json(&StreamMessage::close_with(&connection_id, code, reason))
                                .await;
                        }
                        return;
                    }
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break,
            },
        }
    }

    if state.ws_locals.remove(&connection_id).is_some() && notify_relay {
        let _ = state
            .send_json(&StreamMessage::close(&connection_id))
            .await;
    }
}

/// Executes one tunneled HTTP request against the local service. Local
/// failures synthesize a 502 response; the control channel never fails
/// because of them.
pub async fn handle_http_request(state: Arc<AgentState>, request: HttpMessage) {
    let id = request.id.clone();
    let method = request.method.clone().unwrap_or_else(|| "GET".into());
    let path = request.path.clone().unwrap_or_else(|| "/".into());

    let response = match call_local(&state, &request).await {
        Ok(resp) => {
            tracing::debug!(method = %method, path = %path, status = resp.status.unwrap_or(0), "agent: request proxied");
            resp
        }
        Err(err) => {
            tracing::warn!(method = %method, path = %path, err = %err, "agent: local request failed");
            HttpMessage::error_response(id, 502, &format!("Bad Gateway: {err}"))
        }
    };

    if let Err(err) = state.send_json(&response).await {
        tracing::debug!(err = %err, "agent: response not sent");
    }
}

async fn call_local(
    state: &Arc<AgentState>,
    request: &HttpMessage,
) -> anyhow::Result<HttpMessage> {
    let cfg = &state.cfg;
    let mut url = format!(
        "{}://{}:{}{}",
        cfg.local_scheme,
        cfg.local_host,
        cfg.local_port,
        request.path.as_deref().unwrap_or("/")
    );
    if let Some(query) = request.query.as_deref() {
        if !query.is_empty() {
            url.push('?');
            url.push_str(query);
        }
    }

    let method =
        reqwest::Method::from_bytes(request.method.as_deref().unwrap_or("GET").as_bytes())?;
    let mut req = state.http.request(method, &url);

    if let Some(headers) = &request.headers {
        for (name, values) in headers {
            // The local client computes these itself.
            if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            for value in values {
                req = req.header(name.as_str(), value.as_str());
            }
        }
    }

    if let Some(b64) = request.body_b64.as_deref() {
        req = req.body(protocol::decode_b64(b64)?);
    }

    let resp = req.send().await?;
    let status = resp.status().as_u16();

    let mut resp_headers: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in resp.headers() {
        if let Ok(v) = value.to_str() {
            resp_headers
                .entry(name.as_str().to_string())
                .or_default()
                .push(v.to_string());
        }
    }

    let body = resp.bytes().await?;
    Ok(HttpMessage {
        id: request.id.clone(),
        kind: Some(HttpKind::Response),
        status: Some(status),
        resp_headers: Some(resp_headers),
        resp_body_b64: if body.is_empty() {
            None
        } else {
            Some(protocol::encode_b64(&body))
        },
        ..Default::default()
    })
}

/// Tears down every local stream (control channel lost or agent
/// stopping). Closing the sockets unblocks the pump loops.
pub async fn teardown(state: &Arc<AgentState>) {
    for entry in state.tcp_locals.iter() {
        if let Some(task) = entry.read_task.get() {
            task.abort();
        }
    }
    state.tcp_locals.clear();

    for entry in state.udp_locals.iter() {
        entry.task.abort();
    }
    state.udp_locals.clear();

    let ws_ids: Vec<String> = state.ws_locals.iter().map(|e| e.key().clone()).collect();
    for id in ws_ids {
        if let Some((_, local)) = state.ws_locals.remove(&id) {
            let _ = local.tx.try_send(LocalWsCmd::Close(None, None));
            if let Some(task) = local.task.get() {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::porthole::tunnel::channel::{WireMessage, WireSink};
    use async_trait::async_trait;
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

    fn agent_cfg(kind: TunnelKind, local_port: u16) -> AgentConfig {
        AgentConfig {
            server_url: "http://127.0.0.1:1".into(),
            tunnel_id: Uuid::new_v4(),
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

    fn wired_state(
        kind: TunnelKind,
        local_port: u16,
    ) -> (Arc<AgentState>, mpsc::UnboundedReceiver<WireMessage>) {
        let state = AgentState::new(agent_cfg(kind, local_port)).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        state.set_channel(ControlChannel::start(Box::new(CaptureSink(tx)), 16));
        (state, rx)
    }

    async fn next_stream_msg(rx: &mut mpsc::UnboundedReceiver<WireMessage>) -> StreamMessage {
        loop {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for wire message")
                .expect("wire closed")
            {
                WireMessage::Text(t) => {
                    if let Ok(Some(TextFrame::Stream(s))) = protocol::decode_text(&t) {
                        return s;
                    }
                }
                WireMessage::Binary(_) => {}
            }
        }
    }

    #[tokio::test]
    async fn open_with_refused_local_connect_replies_close() {
        // Port 1 is reliably closed.
        let (state, mut wire) = wired_state(TunnelKind::Tcp, 1);
        open_local_tcp(state.clone(), "c-refused".into()).await;
        let msg = next_stream_msg(&mut wire).await;
        assert_eq!(msg.ws_type, StreamType::Close);
        assert_eq!(msg.connection_id, "c-refused");
        assert_eq!(state.tcp_local_count(), 0);
    }

    #[tokio::test]
    async fn open_acks_then_pumps_local_bytes() {
        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = ln.local_addr().unwrap().port();
        let (state, mut wire) = wired_state(TunnelKind::Tcp, port);

        let accept = tokio::spawn(async move { ln.accept().await.unwrap().0 });
        open_local_tcp(state.clone(), "c-1".into()).await;

        let ack = next_stream_msg(&mut wire).await;
        assert_eq!(ack.ws_type, StreamType::OpenOk);
        assert_eq!(ack.connection_id, "c-1");

        // Local service speaks first; the bytes must become frames.
        let mut local = accept.await.unwrap();
        local.write_all(b"banner").await.unwrap();
        let frame = loop {
            match tokio::time::timeout(Duration::from_secs(2), wire.recv())
                .await
                .unwrap()
                .unwrap()
            {
                WireMessage::Binary(b) => break b,
                WireMessage::Text(_) => {}
            }
        };
        let (conn, payload) = protocol::decode_frame(&frame).unwrap();
        assert_eq!(conn, "c-1");
        assert_eq!(&payload[..], b"banner");

        // Frames from the relay land on the local socket.
        dispatch_frame(&state, "c-1", Bytes::from_static(b"hello")).await;
        let mut buf = [0u8; 5];
        local.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn close_is_idempotent_and_releases_the_socket_once() {
        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = ln.local_addr().unwrap().port();
        let (state, mut wire) = wired_state(TunnelKind::Tcp, port);

        let accept = tokio::spawn(async move { ln.accept().await.unwrap().0 });
        open_local_tcp(state.clone(), "c-2".into()).await;
        let _local = accept.await.unwrap();
        assert_eq!(next_stream_msg(&mut wire).await.ws_type, StreamType::OpenOk);

        close_local_tcp(&state, "c-2", false, true).await;
        assert_eq!(state.tcp_local_count(), 0);
        // Duplicate CLOSE from the relay and a second local close are
        // both no-ops.
        close_local_tcp(&state, "c-2", false, true).await;
        handle_stream(&state, StreamMessage::close("c-2")).await;
        assert_eq!(state.tcp_local_count(), 0);
    }

    #[tokio::test]
    async fn udp_frames_create_one_local_socket_per_connection() {
        let local = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = local.local_addr().unwrap().port();
        let (state, mut wire) = wired_state(TunnelKind::Udp, port);

        dispatch_frame(&state, "198.51.100.1:1111", Bytes::from_static(b"a1")).await;
        dispatch_frame(&state, "198.51.100.2:2222", Bytes::from_static(b"b1")).await;
        dispatch_frame(&state, "198.51.100.1:1111", Bytes::from_static(b"a2")).await;
        assert_eq!(state.udp_locals.len(), 2);

        // All three datagrams reach the local service.
        let mut buf = [0u8; 16];
        let mut got = Vec::new();
        for _ in 0..3 {
            let (n, _) = tokio::time::timeout(Duration::from_secs(2), local.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            got.push(buf[..n].to_vec());
        }
        got.sort();
        assert_eq!(got, vec![b"a1".to_vec(), b"a2".to_vec(), b"b1".to_vec()]);

        // A reply routes back as a frame tagged with the right peer id.
        let sender_port = {
            let entry = state.udp_locals.get("198.51.100.1:1111").unwrap();
            entry.sock.local_addr().unwrap().port()
        };
        local
            .send_to(b"reply", ("127.0.0.1", sender_port))
            .await
            .unwrap();
        let frame = loop {
            match tokio::time::timeout(Duration::from_secs(2), wire.recv())
                .await
                .unwrap()
                .unwrap()
            {
                WireMessage::Binary(b) => break b,
                WireMessage::Text(_) => {}
            }
        };
        let (conn, payload) = protocol::decode_frame(&frame).unwrap();
        assert_eq!(conn, "198.51.100.1:1111");
        assert_eq!(&payload[..], b"reply");
    }

    #[tokio::test]
    async fn http_request_against_dead_service_synthesizes_502() {
        let (state, mut wire) = wired_state(TunnelKind::Http, 1);
        let request = HttpMessage {
            id: Some("r-dead".into()),
            kind: Some(HttpKind::Request),
            method: Some("GET".into()),
            path: Some("/".into()),
            ..Default::default()
        };
        handle_http_request(state.clone(), request).await;

        let raw = loop {
            match tokio::time::timeout(Duration::from_secs(2), wire.recv())
                .await
                .unwrap()
                .unwrap()
            {
                WireMessage::Text(t) => break t,
                WireMessage::Binary(_) => {}
            }
        };
        let resp = match protocol::decode_text(&raw).unwrap().unwrap() {
            TextFrame::Http(h) => h,
            other => panic!("unexpected frame: {other:?}"),
        };
        assert_eq!(resp.id.as_deref(), Some("r-dead"));
        assert_eq!(resp.kind, Some(HttpKind::Response));
        assert_eq!(resp.status, Some(502));
    }
}
