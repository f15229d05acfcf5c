use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::watch;
use uuid::Uuid;

use crate::porthole::{
    config::RelayConfig,
    directory::{Directory, StaticDirectory, TunnelRoute},
    net,
    tunnel::{
        channel::{ControlChannel, RelaySink, SEND_QUEUE},
        correlator, ingress, listener, mux,
        protocol::{
            self, ControlMessage, ControlType, HttpKind, StreamMessage, StreamType, TextFrame,
            TunnelKind,
        },
        registry::{BrowserEvent, Registry, TunnelContext},
    },
};

pub struct RelayState {
    pub cfg: RelayConfig,
    pub registry: Registry,
    pub directory: Arc<dyn Directory>,
}

impl RelayState {
    pub fn new(cfg: RelayConfig) -> Arc<Self> {
        let directory = Arc::new(StaticDirectory::new(cfg.tunnels.iter().map(|t| {
            (
                t.subdomain.clone(),
                TunnelRoute {
                    tunnel_id: t.id,
                    kind: t.kind,
                },
            )
        })));
        Self::with_directory(cfg, directory)
    }

    pub fn with_directory(cfg: RelayConfig, directory: Arc<dyn Directory>) -> Arc<Self> {
        Arc::new(RelayState {
            cfg,
            registry: Registry::new(),
            directory,
        })
    }
}

/// Relay router: the control endpoint, the agent status routes, and a
/// fallback that serves public HTTP ingress by Host header.
pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/tunnel/{id}", get(control_upgrade))
        .route("/tunnels/{id}/connected", post(status_connected))
        .route("/tunnels/{id}/heartbeat", post(status_heartbeat))
        .route("/tunnels/{id}/closed", post(status_closed))
        .fallback(ingress::handle)
        .with_state(state)
}

pub async fn serve(
    state: Arc<RelayState>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = net::normalize_bind_addr(&state.cfg.listen_addr);
    let ln = tokio::net::TcpListener::bind(addr.as_ref())
        .await
        .with_context(|| format!("relay: bind {addr}"))?;
    tracing::info!(addr = %ln.local_addr()?, "relay: listening");

    axum::serve(ln, router(state))
        .with_graceful_shutdown(async move {
            loop {
                if shutdown.changed().await.is_err() {
                    break;
                }
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ControlParams {
    #[serde(rename = "type")]
    kind: Option<String>,
    port: Option<u16>,
    /// The public host the agent expects; informational, the relay
    /// announces the host it actually serves.
    #[serde(rename = "public-host")]
    public_host: Option<String>,
}

async fn control_upgrade(
    State(state): State<Arc<RelayState>>,
    Path(tunnel_id): Path<Uuid>,
    Query(params): Query<ControlParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !authorized(&state.cfg.auth_token, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let requested_kind = match TunnelKind::parse(params.kind.as_deref().unwrap_or("")) {
        Ok(k) => k,
        Err(err) => {
            tracing::debug!(tunnel = %tunnel_id, err = %err, "relay: bad control params");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    // HTTP tunnels must be resolvable or the ingress could never route
    // to them; TCP/UDP tunnels get their endpoint allocated on attach.
    let known = state.directory.resolve_id(tunnel_id).await;
    let kind = known.map(|r| r.kind).unwrap_or(requested_kind);
    if kind == TunnelKind::Http && known.is_none() {
        tracing::warn!(tunnel = %tunnel_id, "relay: unknown http tunnel");
        return StatusCode::NOT_FOUND.into_response();
    }

    let desired_port = params.port.unwrap_or(0);
    if let Some(expected) = params.public_host.as_deref() {
        if !expected.is_empty() && expected != state.cfg.public_host {
            tracing::debug!(tunnel = %tunnel_id, expected, actual = %state.cfg.public_host, "relay: agent expects a different public host");
        }
    }

    ws.on_upgrade(move |socket| run_session(state, tunnel_id, kind, desired_port, socket))
}

fn authorized(auth_token: &str, headers: &HeaderMap) -> bool {
    if auth_token.is_empty() {
        return true;
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {auth_token}"))
}

/// Owns one control connection end to end: expose the public endpoint,
/// announce it, attach, dispatch inbound messages, tear down on loss.
async fn run_session(
    state: Arc<RelayState>,
    tunnel_id: Uuid,
    kind: TunnelKind,
    desired_port: u16,
    socket: WebSocket,
) {
    let ctx = state.registry.get_or_create(tunnel_id, kind);
    let (sink, mut stream) = socket.split();
    let channel = ControlChannel::start(Box::new(RelaySink::new(sink)), SEND_QUEUE);

    if matches!(ctx.kind, TunnelKind::Tcp | TunnelKind::Udp) {
        let exposed = listener::expose(
            ctx.clone(),
            listener::ExposeOptions {
                desired_port,
                max_streams: state.cfg.max_streams_per_tunnel,
                udp_idle_timeout: state.cfg.udp_idle_timeout,
            },
        )
        .await;
        match exposed {
            Ok(port) => {
                let _ = channel
                    .send_json(&StreamMessage::exposed(state.cfg.public_host.clone(), port))
                    .await;
            }
            Err(err) => {
                tracing::warn!(tunnel = %tunnel_id, err = %err, "relay: expose failed");
                channel.close("expose failed").await;
                return;
            }
        }
    }

    if let Some(old) = ctx.attach(channel.clone()) {
        old.close("replaced by a new control connection").await;
    }
    if ctx.kind == TunnelKind::Http {
        state.directory.record_connected(tunnel_id).await;
    }
    tracing::info!(tunnel = %tunnel_id, kind = %ctx.kind, "relay: control channel attached");

    while let Some(next) = stream.next().await {
        match next {
            Ok(Message::Close(_)) => break,
            Ok(msg) => dispatch(&state, &ctx, &channel, msg).await,
            Err(err) => {
                tracing::debug!(tunnel = %tunnel_id, err = %err, "relay: control read failed");
                break;
            }
        }
    }

    // Only the session that still owns the attachment tears down; a
    // stale session losing a reconnect race must leave the new one be.
    if ctx.detach_if(&channel) {
        listener::shutdown(&ctx).await;
        mux::close_all(&ctx).await;
        if ctx.kind == TunnelKind::Http {
            state.directory.record_closed(tunnel_id).await;
        }
        tracing::info!(
            tunnel = %tunnel_id,
            bytes_in = ctx.bytes_in.load(std::sync::atomic::Ordering::Relaxed),
            bytes_out = ctx.bytes_out.load(std::sync::atomic::Ordering::Relaxed),
            "relay: control channel detached"
        );
    }
    channel.close("session ended").await;
}

async fn dispatch(
    state: &Arc<RelayState>,
    ctx: &Arc<TunnelContext>,
    channel: &Arc<ControlChannel>,
    msg: Message,
) {
    match msg {
        Message::Text(text) => handle_text(state, ctx, channel, text.as_str()).await,
        Message::Binary(frame) => match protocol::decode_frame(&frame) {
            Some((connection_id, data)) => {
                mux::on_frame_from_agent(ctx, &connection_id, data).await;
            }
            None => {
                tracing::debug!(tunnel = %ctx.id, "relay: malformed binary frame dropped");
            }
        },
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) => {}
    }
}

async fn handle_text(
    state: &Arc<RelayState>,
    ctx: &Arc<TunnelContext>,
    channel: &Arc<ControlChannel>,
    raw: &str,
) {
    match protocol::decode_text(raw) {
        Ok(Some(TextFrame::Control(ctrl))) => {
            if ctrl.control_type == ControlType::Ping {
                let _ = channel.send_json(&ControlMessage::pong()).await;
            }
        }
        Ok(Some(TextFrame::Http(msg))) => {
            if msg.kind == Some(HttpKind::Response) {
                correlator::on_response(ctx, msg);
            } else {
                tracing::debug!(tunnel = %ctx.id, "relay: ignoring non-RESPONSE http message from agent");
            }
        }
        Ok(Some(TextFrame::Stream(msg))) => handle_stream(state, ctx, &msg).await,
        Ok(None) => {}
        Err(err) => {
            tracing::debug!(tunnel = %ctx.id, err = %err, "relay: malformed control message dropped");
        }
    }
}

async fn handle_stream(_state: &Arc<RelayState>, ctx: &Arc<TunnelContext>, msg: &StreamMessage) {
    match msg.ws_type {
        StreamType::OpenOk => match ctx.kind {
            TunnelKind::Tcp => mux::on_open_ok(ctx, &msg.connection_id),
            TunnelKind::Http => {
                if let Some(tx) = browser_tx(ctx, &msg.connection_id) {
                    let _ = tx.send(BrowserEvent::Ack).await;
                }
            }
            TunnelKind::Udp => {}
        },
        StreamType::Close => mux::on_close_from_agent(ctx, msg).await,
        StreamType::Text => {
            if ctx.kind == TunnelKind::Http {
                if let Some(tx) = browser_tx(ctx, &msg.connection_id) {
                    let _ = tx
                        .send(BrowserEvent::Text(msg.text.clone().unwrap_or_default()))
                        .await;
                }
            }
        }
        StreamType::Binary => {
            if ctx.kind == TunnelKind::Http {
                let Some(b64) = msg.data_b64.as_deref() else {
                    return;
                };
                match protocol::decode_b64(b64) {
                    Ok(data) => {
                        if let Some(tx) = browser_tx(ctx, &msg.connection_id) {
                            let _ = tx.send(BrowserEvent::Binary(data.into())).await;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(tunnel = %ctx.id, err = %err, "relay: bad base64 browser payload");
                    }
                }
            } else {
                mux::on_legacy_binary(ctx, msg).await;
            }
        }
        // The agent never initiates streams and EXPOSED is relay-origin.
        StreamType::Open | StreamType::Exposed => {
            tracing::debug!(tunnel = %ctx.id, ws_type = ?msg.ws_type, "relay: unexpected stream message from agent");
        }
    }
}

fn browser_tx(
    ctx: &Arc<TunnelContext>,
    connection_id: &str,
) -> Option<tokio::sync::mpsc::Sender<BrowserEvent>> {
    ctx.browsers.get(connection_id).map(|peer| peer.tx.clone())
}

async fn status_connected(
    State(state): State<Arc<RelayState>>,
    Path(id): Path<Uuid>,
) -> StatusCode {
    state.directory.record_connected(id).await;
    StatusCode::NO_CONTENT
}

async fn status_heartbeat(
    State(state): State<Arc<RelayState>>,
    Path(id): Path<Uuid>,
) -> StatusCode {
    state.directory.record_heartbeat(id).await;
    StatusCode::NO_CONTENT
}

async fn status_closed(State(state): State<Arc<RelayState>>, Path(id): Path<Uuid>) -> StatusCode {
    state.directory.record_closed(id).await;
    StatusCode::NO_CONTENT
}
