use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::{
        FromRequestParts, Request, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket, close_code},
    },
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::porthole::tunnel::{
    correlator::{self, ForwardError},
    protocol::{self, HttpMessage, StreamMessage, TunnelKind},
    registry::{BrowserEvent, BrowserPeer, TunnelContext},
    relay::RelayState,
};

const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;
const BROWSER_QUEUE: usize = 64;
const OPEN_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Public ingress: every request that is not a relay route resolves its
/// Host header to a tunnel. Plain requests become correlated
/// REQUEST/RESPONSE exchanges; WebSocket upgrades become bridged
/// logical streams.
pub async fn handle(State(state): State<Arc<RelayState>>, req: Request) -> Response {
    let Some(host) = host_of(req.headers()) else {
        return plain(StatusCode::BAD_REQUEST, "missing Host header");
    };
    let lookup = subdomain_of(&host, &state.cfg.domain);

    let Some(route) = state.directory.resolve_host(&lookup).await else {
        return plain(StatusCode::NOT_FOUND, "unknown tunnel host");
    };
    if route.kind != TunnelKind::Http {
        // TCP/UDP tunnels are served by their own public sockets.
        return plain(StatusCode::BAD_GATEWAY, "not an http tunnel");
    }

    let ctx = state.registry.get_or_create(route.tunnel_id, route.kind);
    if !ctx.attached() {
        return plain(StatusCode::BAD_GATEWAY, "Bad Gateway: tunnel unavailable");
    }

    if wants_upgrade(req.headers()) {
        let (mut parts, _body) = req.into_parts();
        return match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
            Ok(ws) => {
                let path = parts.uri.path().to_string();
                let query = parts.uri.query().map(str::to_string);
                let headers = browser_open_headers(&parts.headers);
                ws.on_upgrade(move |socket| serve_browser(ctx, path, query, headers, socket))
                    .into_response()
            }
            Err(rejection) => rejection.into_response(),
        };
    }

    forward_http(&ctx, host, req).await
}

async fn forward_http(ctx: &Arc<TunnelContext>, host: String, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let body_bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(_) => return plain(StatusCode::PAYLOAD_TOO_LARGE, "request body too large"),
    };

    let mut headers: HashMap<String, Vec<String>> = HashMap::new();
    let mut body_content_type = None;
    for (name, value) in parts.headers.iter() {
        // Hop-by-hop headers stay on this hop.
        if name == &header::HOST || name == &header::CONNECTION {
            continue;
        }
        let Ok(v) = value.to_str() else { continue };
        if name == &header::CONTENT_TYPE {
            body_content_type = Some(v.to_string());
        }
        headers
            .entry(name.as_str().to_string())
            .or_default()
            .push(v.to_string());
    }
    headers.insert("X-Forwarded-Host".into(), vec![host]);
    headers.insert("X-Forwarded-Proto".into(), vec!["http".into()]);

    let msg = HttpMessage {
        method: Some(parts.method.as_str().to_string()),
        path: Some(parts.uri.path().to_string()),
        query: parts.uri.query().map(str::to_string),
        headers: Some(headers),
        body_b64: if body_bytes.is_empty() {
            None
        } else {
            Some(protocol::encode_b64(&body_bytes))
        },
        body_content_type,
        ..Default::default()
    };

    match correlator::forward(ctx, msg, correlator::DEFAULT_TIMEOUT).await {
        Ok(resp) => build_response(resp),
        Err(ForwardError::Timeout) => plain(
            StatusCode::GATEWAY_TIMEOUT,
            "Gateway Timeout: tunnel did not respond",
        ),
        Err(err) => {
            tracing::debug!(tunnel = %ctx.id, err = %err, "ingress: forward failed");
            plain(StatusCode::BAD_GATEWAY, "Bad Gateway: tunnel unavailable")
        }
    }
}

fn build_response(msg: HttpMessage) -> Response {
    let status = StatusCode::from_u16(msg.status.unwrap_or(502)).unwrap_or(StatusCode::BAD_GATEWAY);

    let body = match msg.resp_body_b64.as_deref() {
        Some(b64) => match protocol::decode_b64(b64) {
            Ok(bytes) => Body::from(bytes),
            Err(err) => {
                tracing::debug!(err = %err, "ingress: response body not valid base64");
                return plain(StatusCode::BAD_GATEWAY, "Bad Gateway: invalid tunnel response");
            }
        },
        None => Body::empty(),
    };

    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    if let Some(headers) = msg.resp_headers {
        for (name, values) in headers {
            if is_hop_by_hop(&name) {
                continue;
            }
            let Ok(name) = HeaderName::try_from(name.as_str()) else {
                continue;
            };
            for value in values {
                if let Ok(value) = HeaderValue::try_from(value.as_str()) {
                    resp.headers_mut().append(name.clone(), value);
                }
            }
        }
    }
    resp
}

fn is_hop_by_hop(name: &str) -> bool {
    name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("keep-alive")
}

fn plain(status: StatusCode, body: &'static str) -> Response {
    (status, body).into_response()
}

fn wants_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

fn host_of(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::HOST)?.to_str().ok()?.trim();
    if raw.is_empty() {
        return None;
    }
    // Strip the port, keeping bracketed IPv6 literals intact.
    let host = if let Some(rest) = raw.strip_prefix('[') {
        match rest.split_once(']') {
            Some((inside, _)) => inside.to_string(),
            None => raw.to_string(),
        }
    } else {
        match raw.split_once(':') {
            Some((h, _)) => h.to_string(),
            None => raw.to_string(),
        }
    };
    Some(host.to_ascii_lowercase())
}

fn subdomain_of(host: &str, domain: &str) -> String {
    match host.strip_suffix(&format!(".{domain}")) {
        Some(sub) if !sub.is_empty() => sub.to_string(),
        _ => host.to_string(),
    }
}

/// Headers forwarded to the agent in the OPEN message so it can replay
/// the handshake against the local service. The agent dials its own
/// WebSocket, so handshake mechanics stay on each hop.
fn browser_open_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for (name, value) in headers.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if lower == "host"
            || lower == "connection"
            || lower == "upgrade"
            || lower.starts_with("sec-websocket")
        {
            continue;
        }
        if let Ok(v) = value.to_str() {
            out.entry(name.as_str().to_string())
                .or_insert_with(|| v.to_string());
        }
    }
    out
}

enum BridgeEnd {
    /// We observed the close locally; tell the agent.
    NotifyAgent(Option<u16>, Option<String>),
    /// The agent (or tunnel teardown) closed us; nothing to echo.
    Quiet,
}

/// Bridges one public browser WebSocket to the tunnel as a logical
/// stream. No browser bytes are forwarded before the agent acknowledges
/// the OPEN.
async fn serve_browser(
    ctx: Arc<TunnelContext>,
    path: String,
    query: Option<String>,
    headers: HashMap<String, String>,
    mut socket: WebSocket,
) {
    let connection_id = Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::channel::<BrowserEvent>(BROWSER_QUEUE);
    ctx.browsers
        .insert(connection_id.clone(), BrowserPeer { tx });

    let open = StreamMessage::open(connection_id.clone(), Some(path), query, Some(headers));
    if ctx.send_json(&open).await.is_err() {
        ctx.browsers.remove(&connection_id);
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::AWAY,
                reason: "tunnel unavailable".into(),
            })))
            .await;
        return;
    }
    tracing::debug!(tunnel = %ctx.id, conn = %connection_id, "ingress: browser stream opened");

    if !await_ack(&mut rx).await {
        if ctx.browsers.remove(&connection_id).is_some() {
            let _ = ctx.send_json(&StreamMessage::close(&connection_id)).await;
        }
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::AWAY,
                reason: "tunnel did not accept the stream".into(),
            })))
            .await;
        return;
    }

    let end = relay_browser(&ctx, &connection_id, &mut rx, &mut socket).await;

    if ctx.browsers.remove(&connection_id).is_some() {
        if let BridgeEnd::NotifyAgent(code, reason) = end {
            let _ = ctx
                .send_json(&StreamMessage::close_with(&connection_id, code, reason))
                .await;
        }
    }
    tracing::debug!(tunnel = %ctx.id, conn = %connection_id, "ingress: browser stream closed");
}

async fn await_ack(rx: &mut mpsc::Receiver<BrowserEvent>) -> bool {
    let deadline = tokio::time::Instant::now() + OPEN_ACK_TIMEOUT;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(BrowserEvent::Ack)) => return true,
            // Data before the ack would violate the stream contract;
            // drop it and keep waiting.
            Ok(Some(BrowserEvent::Text(_))) | Ok(Some(BrowserEvent::Binary(_))) => continue,
            Ok(Some(BrowserEvent::Close(..))) | Ok(None) | Err(_) => return false,
        }
    }
}

async fn relay_browser(
    ctx: &Arc<TunnelContext>,
    connection_id: &str,
    rx: &mut mpsc::Receiver<BrowserEvent>,
    socket: &mut WebSocket,
) -> BridgeEnd {
    loop {
        tokio::select! {
            evt = rx.recv() => match evt {
                Some(BrowserEvent::Text(t)) => {
                    if socket.send(Message::Text(t.into())).await.is_err() {
                        return BridgeEnd::NotifyAgent(None, None);
                    }
                }
                Some(BrowserEvent::Binary(b)) => {
                    if socket.send(Message::Binary(b)).await.is_err() {
                        return BridgeEnd::NotifyAgent(None, None);
                    }
                }
                Some(BrowserEvent::Close(code, reason)) => {
                    let _ = socket
                        .send(Message::Close(Some(CloseFrame {
                            code: code.unwrap_or(close_code::NORMAL),
                            reason: reason.unwrap_or_default().into(),
                        })))
                        .await;
                    return BridgeEnd::Quiet;
                }
                Some(BrowserEvent::Ack) => {}
                None => return BridgeEnd::Quiet,
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(t))) => {
                    if ctx
                        .send_json(&StreamMessage::text(connection_id, t.to_string()))
                        .await
                        .is_err()
                    {
                        return BridgeEnd::Quiet;
                    }
                }
                Some(Ok(Message::Binary(b))) => {
                    if ctx
                        .send_json(&StreamMessage::binary(connection_id, &b))
                        .await
                        .is_err()
                    {
                        return BridgeEnd::Quiet;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(f) => (Some(f.code), Some(f.reason.to_string())),
                        None => (None, None),
                    };
                    return BridgeEnd::NotifyAgent(code, reason);
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => return BridgeEnd::NotifyAgent(None, None),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "Demo.Example.dev:8080".parse().unwrap());
        assert_eq!(host_of(&headers).unwrap(), "demo.example.dev");

        headers.insert(header::HOST, "[::1]:9000".parse().unwrap());
        assert_eq!(host_of(&headers).unwrap(), "::1");
    }

    #[test]
    fn subdomain_extraction() {
        assert_eq!(subdomain_of("demo.example.dev", "example.dev"), "demo");
        assert_eq!(subdomain_of("example.dev", "example.dev"), "example.dev");
        assert_eq!(subdomain_of("other.host", "example.dev"), "other.host");
    }

    #[test]
    fn response_build_filters_hop_by_hop_headers() {
        let mut resp_headers = HashMap::new();
        resp_headers.insert("Content-Type".to_string(), vec!["text/html".to_string()]);
        resp_headers.insert("Connection".to_string(), vec!["close".to_string()]);
        resp_headers.insert("Content-Length".to_string(), vec!["999".to_string()]);

        let msg = HttpMessage {
            status: Some(201),
            resp_headers: Some(resp_headers),
            resp_body_b64: Some(protocol::encode_b64(b"<ok>")),
            ..Default::default()
        };
        let resp = build_response(msg);
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(resp.headers().get("content-type").unwrap(), "text/html");
        assert!(resp.headers().get("connection").is_none());
        assert!(resp.headers().get("content-length").is_none());
    }

    #[test]
    fn missing_status_maps_to_bad_gateway() {
        let resp = build_response(HttpMessage::default());
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }
}
