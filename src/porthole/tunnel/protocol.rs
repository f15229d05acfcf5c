use std::collections::HashMap;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Envelope discriminator for heartbeat messages.
pub const KIND_CONTROL: &str = "CTRL";
/// Envelope discriminator for stream-control messages.
pub const KIND_STREAM: &str = "WS";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("connection id too long: {0} bytes")]
    IdTooLong(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelKind {
    Http,
    Tcp,
    Udp,
}

impl TunnelKind {
    /// Parses an expose mode. An empty string defaults to HTTP.
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "http" => Ok(TunnelKind::Http),
            "tcp" => Ok(TunnelKind::Tcp),
            "udp" => Ok(TunnelKind::Udp),
            other => anyhow::bail!("unknown tunnel type {other:?} (expected http|tcp|udp)"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelKind::Http => "http",
            TunnelKind::Tcp => "tcp",
            TunnelKind::Udp => "udp",
        }
    }
}

impl std::fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One whole-request/whole-response HTTP exchange riding the control
/// connection. `REQUEST` flows relay -> agent, `RESPONSE` flows back,
/// matched by `id`. Bodies ride base64-encoded so the envelope stays
/// valid JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HttpMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<HttpKind>,

    // Request fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, Vec<String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_b64: Option<String>,
    /// Original request body media type; the agent reconstructs the
    /// upstream request with the same Content-Type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_content_type: Option<String>,

    // Response fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resp_headers: Option<HashMap<String, Vec<String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resp_body_b64: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpKind {
    Request,
    Response,
}

impl HttpMessage {
    /// Synthesized error response (e.g. 502 when the local service is
    /// unreachable); never fails the control channel.
    pub fn error_response(id: Option<String>, status: u16, message: &str) -> Self {
        let mut headers = HashMap::new();
        headers.insert(
            "Content-Type".to_string(),
            vec!["text/plain; charset=utf-8".to_string()],
        );
        HttpMessage {
            id,
            kind: Some(HttpKind::Response),
            status: Some(status),
            resp_headers: Some(headers),
            resp_body_b64: Some(encode_b64(message.as_bytes())),
            ..Default::default()
        }
    }
}

/// Stream-control envelope: open/close signaling for multiplexed TCP/UDP
/// streams and text/binary relaying for bridged browser WebSockets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMessage {
    #[serde(default = "stream_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub connection_id: String,
    pub ws_type: StreamType,

    // OPEN details (browser WebSocket bridging).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,

    // Payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_b64: Option<String>,

    // Close details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<String>,

    // EXPOSED details: the actual public endpoint the relay bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_port: Option<u16>,
}

fn stream_kind() -> String {
    KIND_STREAM.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamType {
    Open,
    OpenOk,
    Text,
    Binary,
    Close,
    Exposed,
}

impl StreamMessage {
    pub fn new(ws_type: StreamType, connection_id: impl Into<String>) -> Self {
        StreamMessage {
            kind: stream_kind(),
            connection_id: connection_id.into(),
            ws_type,
            path: None,
            query: None,
            headers: None,
            text: None,
            data_b64: None,
            close_code: None,
            close_reason: None,
            public_host: None,
            public_port: None,
        }
    }

    pub fn open(
        connection_id: impl Into<String>,
        path: Option<String>,
        query: Option<String>,
        headers: Option<HashMap<String, String>>,
    ) -> Self {
        let mut m = Self::new(StreamType::Open, connection_id);
        m.path = path;
        m.query = query;
        m.headers = headers;
        m
    }

    pub fn open_ok(connection_id: impl Into<String>) -> Self {
        Self::new(StreamType::OpenOk, connection_id)
    }

    pub fn close(connection_id: impl Into<String>) -> Self {
        Self::new(StreamType::Close, connection_id)
    }

    pub fn close_with(
        connection_id: impl Into<String>,
        code: Option<u16>,
        reason: Option<String>,
    ) -> Self {
        let mut m = Self::new(StreamType::Close, connection_id);
        m.close_code = code;
        m.close_reason = reason;
        m
    }

    pub fn text(connection_id: impl Into<String>, text: String) -> Self {
        let mut m = Self::new(StreamType::Text, connection_id);
        m.text = Some(text);
        m
    }

    pub fn binary(connection_id: impl Into<String>, data: &[u8]) -> Self {
        let mut m = Self::new(StreamType::Binary, connection_id);
        m.data_b64 = Some(encode_b64(data));
        m
    }

    pub fn exposed(public_host: impl Into<String>, public_port: u16) -> Self {
        let mut m = Self::new(StreamType::Exposed, String::new());
        m.public_host = Some(public_host.into());
        m.public_port = Some(public_port);
        m
    }
}

/// Application-level heartbeat. Answered in kind, otherwise ignored by
/// business logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(default = "control_kind")]
    pub kind: String,
    #[serde(rename = "type")]
    pub control_type: ControlType,
    #[serde(default)]
    pub ts: u64,
}

fn control_kind() -> String {
    KIND_CONTROL.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ControlType {
    Ping,
    Pong,
}

impl ControlMessage {
    pub fn ping() -> Self {
        ControlMessage {
            kind: control_kind(),
            control_type: ControlType::Ping,
            ts: epoch_millis(),
        }
    }

    pub fn pong() -> Self {
        ControlMessage {
            kind: control_kind(),
            control_type: ControlType::Pong,
            ts: epoch_millis(),
        }
    }
}

pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Minimal probe used to route an incoming text message without parsing
/// the full payload. A missing `kind` means an HTTP tunnel message.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    kind: Option<String>,
}

#[derive(Debug, Clone)]
pub enum TextFrame {
    Http(HttpMessage),
    Stream(StreamMessage),
    Control(ControlMessage),
}

/// Decodes one text message from the control connection.
///
/// Returns `Ok(None)` for unrecognized `kind` discriminators so a mixed
/// fleet of agents and relays keeps working across versions.
pub fn decode_text(raw: &str) -> Result<Option<TextFrame>, ProtocolError> {
    let env: Envelope = serde_json::from_str(raw)?;
    match env.kind.as_deref() {
        Some(KIND_CONTROL) => Ok(Some(TextFrame::Control(serde_json::from_str(raw)?))),
        Some(KIND_STREAM) => Ok(Some(TextFrame::Stream(serde_json::from_str(raw)?))),
        None => Ok(Some(TextFrame::Http(serde_json::from_str(raw)?))),
        Some(_) => Ok(None),
    }
}

pub fn encode_json<T: Serialize>(msg: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(msg)?)
}

/// Encodes one binary multiplexing frame: a big-endian u16 length of the
/// UTF-8 connection id, the id bytes, then the raw payload. The transport
/// delivers message boundaries, so no trailing length field is needed.
pub fn encode_frame(connection_id: &str, payload: &[u8]) -> Result<Bytes, ProtocolError> {
    let id = connection_id.as_bytes();
    if id.len() > u16::MAX as usize {
        return Err(ProtocolError::IdTooLong(id.len()));
    }
    let mut buf = BytesMut::with_capacity(2 + id.len() + payload.len());
    buf.put_u16(id.len() as u16);
    buf.put_slice(id);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Decodes a binary multiplexing frame. Returns `None` for short or
/// garbled frames; the caller drops the single message and keeps the
/// connection open.
pub fn decode_frame(frame: &[u8]) -> Option<(String, Bytes)> {
    if frame.len() < 2 {
        return None;
    }
    let n = u16::from_be_bytes([frame[0], frame[1]]) as usize;
    if frame.len() < 2 + n {
        return None;
    }
    let id = std::str::from_utf8(&frame[2..2 + n]).ok()?.to_string();
    Some((id, Bytes::copy_from_slice(&frame[2 + n..])))
}

pub fn encode_b64(data: &[u8]) -> String {
    BASE64.encode(data)
}

pub fn decode_b64(s: &str) -> Result<Vec<u8>, ProtocolError> {
    Ok(BASE64.decode(s)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let cases: Vec<(&str, Vec<u8>)> = vec![
            ("11111111-2222-3333-4444-555555555555", b"hello".to_vec()),
            ("conn", Vec::new()),
            ("203.0.113.9:40312", vec![0xAB; 70 * 1024]),
            ("", b"payload with empty id".to_vec()),
        ];
        for (id, payload) in cases {
            let frame = encode_frame(id, &payload).unwrap();
            let (got_id, got_payload) = decode_frame(&frame).unwrap();
            assert_eq!(got_id, id);
            assert_eq!(&got_payload[..], &payload[..]);
        }
    }

    #[test]
    fn frame_rejects_short_input() {
        assert!(decode_frame(&[]).is_none());
        assert!(decode_frame(&[0x00]).is_none());
        // Declared id length longer than the frame.
        assert!(decode_frame(&[0x00, 0x10, b'a', b'b']).is_none());
    }

    #[test]
    fn frame_rejects_oversized_id() {
        let id = "x".repeat(u16::MAX as usize + 1);
        assert!(matches!(
            encode_frame(&id, b"data"),
            Err(ProtocolError::IdTooLong(_))
        ));
    }

    #[test]
    fn text_routing_by_kind() {
        let ctrl = decode_text(r#"{"kind":"CTRL","type":"PING","ts":123}"#)
            .unwrap()
            .unwrap();
        match ctrl {
            TextFrame::Control(c) => {
                assert_eq!(c.control_type, ControlType::Ping);
                assert_eq!(c.ts, 123);
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        let ws = decode_text(r#"{"kind":"WS","connectionId":"c1","wsType":"OPEN_OK"}"#)
            .unwrap()
            .unwrap();
        match ws {
            TextFrame::Stream(s) => {
                assert_eq!(s.connection_id, "c1");
                assert_eq!(s.ws_type, StreamType::OpenOk);
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        let http = decode_text(r#"{"id":"r1","type":"RESPONSE","status":200}"#)
            .unwrap()
            .unwrap();
        match http {
            TextFrame::Http(h) => {
                assert_eq!(h.kind, Some(HttpKind::Response));
                assert_eq!(h.status, Some(200));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_is_tolerated() {
        // A newer peer may introduce kinds this build does not know.
        let decoded = decode_text(r#"{"kind":"METRICS","windowMs":1000}"#).unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn unknown_ws_type_is_an_error_not_a_panic() {
        let res = decode_text(r#"{"kind":"WS","connectionId":"c1","wsType":"SPLICE"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn stream_message_field_names_are_stable() {
        let msg = StreamMessage::close_with("c9", Some(1000), Some("bye".into()));
        let raw = encode_json(&msg).unwrap();
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["kind"], "WS");
        assert_eq!(v["connectionId"], "c9");
        assert_eq!(v["wsType"], "CLOSE");
        assert_eq!(v["closeCode"], 1000);
        assert_eq!(v["closeReason"], "bye");
    }

    #[test]
    fn exposed_message_omits_connection_id() {
        let raw = encode_json(&StreamMessage::exposed("relay.example.dev", 41002)).unwrap();
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(v.get("connectionId").is_none());
        assert_eq!(v["publicHost"], "relay.example.dev");
        assert_eq!(v["publicPort"], 41002);
    }

    #[test]
    fn http_message_body_roundtrip() {
        let mut msg = HttpMessage {
            id: Some("req-1".into()),
            kind: Some(HttpKind::Request),
            method: Some("POST".into()),
            path: Some("/submit".into()),
            body_b64: Some(encode_b64(br#"{"a":1}"#)),
            body_content_type: Some("application/json".into()),
            ..Default::default()
        };
        msg.headers = Some(HashMap::from([(
            "X-Trace".to_string(),
            vec!["abc".to_string()],
        )]));

        let raw = encode_json(&msg).unwrap();
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["type"], "REQUEST");
        assert_eq!(v["bodyContentType"], "application/json");

        let back = match decode_text(&raw).unwrap().unwrap() {
            TextFrame::Http(h) => h,
            other => panic!("unexpected frame: {other:?}"),
        };
        assert_eq!(
            decode_b64(back.body_b64.as_deref().unwrap()).unwrap(),
            br#"{"a":1}"#
        );
    }

    #[test]
    fn error_response_shape() {
        let msg = HttpMessage::error_response(Some("r1".into()), 502, "Bad Gateway: refused");
        assert_eq!(msg.kind, Some(HttpKind::Response));
        assert_eq!(msg.status, Some(502));
        let body = decode_b64(msg.resp_body_b64.as_deref().unwrap()).unwrap();
        assert_eq!(body, b"Bad Gateway: refused");
    }
}
