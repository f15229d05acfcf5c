use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, stream::SplitSink};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::porthole::tunnel::protocol;

/// One message on the control connection. Text carries the JSON
/// envelopes; Binary carries multiplexing frames. The two are never
/// mixed into each other.
#[derive(Debug, Clone)]
pub enum WireMessage {
    Text(String),
    Binary(Bytes),
}

/// Write half of a message-oriented transport. The relay side wraps an
/// accepted WebSocket, the agent side a dialed one.
#[async_trait]
pub trait WireSink: Send {
    async fn send(&mut self, msg: WireMessage) -> anyhow::Result<()>;
    async fn close(&mut self, reason: &str) -> anyhow::Result<()>;
}

enum Command {
    Message(WireMessage),
    Close(String),
}

/// Send side of one live control connection.
///
/// The underlying transport is not safe for concurrent writers, so every
/// sender (multiplexer, correlator, heartbeat) goes through one bounded
/// queue drained by a single writer task. `send` suspends when the queue
/// is full. A channel is never reused after it closes; reconnecting
/// creates a new instance.
pub struct ControlChannel {
    tx: mpsc::Sender<Command>,
    open: AtomicBool,
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("open", &self.is_open())
            .finish()
    }
}

pub const SEND_QUEUE: usize = 64;

impl ControlChannel {
    pub fn start(sink: Box<dyn WireSink>, queue: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(queue.max(1));
        let chan = Arc::new(ControlChannel {
            tx,
            open: AtomicBool::new(true),
        });
        tokio::spawn(writer_loop(rx, sink, chan.clone()));
        chan
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub async fn send(&self, msg: WireMessage) -> anyhow::Result<()> {
        if !self.is_open() {
            anyhow::bail!("control channel is closed");
        }
        self.tx
            .send(Command::Message(msg))
            .await
            .map_err(|_| anyhow::anyhow!("control channel is closed"))
    }

    pub async fn send_json<T: Serialize>(&self, msg: &T) -> anyhow::Result<()> {
        self.send(WireMessage::Text(protocol::encode_json(msg)?))
            .await
    }

    pub async fn send_frame(&self, connection_id: &str, payload: &[u8]) -> anyhow::Result<()> {
        self.send(WireMessage::Binary(protocol::encode_frame(
            connection_id,
            payload,
        )?))
        .await
    }

    /// Orderly shutdown: marks the channel closed so senders fail fast,
    /// then asks the writer to emit a close frame. Safe to call more
    /// than once.
    pub async fn close(&self, reason: &str) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.tx.send(Command::Close(reason.to_string())).await;
    }
}

async fn writer_loop(
    mut rx: mpsc::Receiver<Command>,
    mut sink: Box<dyn WireSink>,
    chan: Arc<ControlChannel>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Message(msg) => {
                if let Err(err) = sink.send(msg).await {
                    tracing::debug!(err = %err, "channel: transport write failed");
                    break;
                }
            }
            Command::Close(reason) => {
                let _ = sink.close(&reason).await;
                break;
            }
        }
    }
    chan.open.store(false, Ordering::SeqCst);
    rx.close();
}

/// Relay-side sink over an accepted WebSocket.
pub struct RelaySink(SplitSink<axum::extract::ws::WebSocket, axum::extract::ws::Message>);

impl RelaySink {
    pub fn new(
        sink: SplitSink<axum::extract::ws::WebSocket, axum::extract::ws::Message>,
    ) -> Self {
        RelaySink(sink)
    }
}

#[async_trait]
impl WireSink for RelaySink {
    async fn send(&mut self, msg: WireMessage) -> anyhow::Result<()> {
        use axum::extract::ws::Message;
        let out = match msg {
            WireMessage::Text(s) => Message::Text(s.into()),
            WireMessage::Binary(b) => Message::Binary(b),
        };
        self.0.send(out).await?;
        Ok(())
    }

    async fn close(&mut self, reason: &str) -> anyhow::Result<()> {
        use axum::extract::ws::{CloseFrame, Message, close_code};
        self.0
            .send(Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: reason.to_string().into(),
            })))
            .await?;
        Ok(())
    }
}

/// Agent-side sink over a dialed WebSocket.
pub struct AgentSink(
    SplitSink<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        tokio_tungstenite::tungstenite::Message,
    >,
);

impl AgentSink {
    pub fn new(
        sink: SplitSink<
            tokio_tungstenite::WebSocketStream<
                tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
            >,
            tokio_tungstenite::tungstenite::Message,
        >,
    ) -> Self {
        AgentSink(sink)
    }
}

#[async_trait]
impl WireSink for AgentSink {
    async fn send(&mut self, msg: WireMessage) -> anyhow::Result<()> {
        use tokio_tungstenite::tungstenite::Message;
        let out = match msg {
            WireMessage::Text(s) => Message::Text(s.into()),
            WireMessage::Binary(b) => Message::Binary(b),
        };
        self.0.send(out).await?;
        Ok(())
    }

    async fn close(&mut self, reason: &str) -> anyhow::Result<()> {
        use tokio_tungstenite::tungstenite::Message;
        use tokio_tungstenite::tungstenite::protocol::CloseFrame;
        use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
        self.0
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: reason.to_string().into(),
            })))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingSink {
        tx: mpsc::UnboundedSender<WireMessage>,
        closed: mpsc::UnboundedSender<String>,
        fail_after: Option<usize>,
        sent: usize,
    }

    #[async_trait]
    impl WireSink for RecordingSink {
        async fn send(&mut self, msg: WireMessage) -> anyhow::Result<()> {
            if self.fail_after.is_some_and(|n| self.sent >= n) {
                anyhow::bail!("broken pipe");
            }
            self.sent += 1;
            let _ = self.tx.send(msg);
            Ok(())
        }

        async fn close(&mut self, reason: &str) -> anyhow::Result<()> {
            let _ = self.closed.send(reason.to_string());
            Ok(())
        }
    }

    fn recording_channel(
        fail_after: Option<usize>,
    ) -> (
        Arc<ControlChannel>,
        mpsc::UnboundedReceiver<WireMessage>,
        mpsc::UnboundedReceiver<String>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let chan = ControlChannel::start(
            Box::new(RecordingSink {
                tx,
                closed: closed_tx,
                fail_after,
                sent: 0,
            }),
            8,
        );
        (chan, rx, closed_rx)
    }

    #[tokio::test]
    async fn sends_preserve_order() {
        let (chan, mut rx, _closed) = recording_channel(None);
        for i in 0..10u8 {
            chan.send_frame("c1", &[i]).await.unwrap();
        }
        for i in 0..10u8 {
            match rx.recv().await.unwrap() {
                WireMessage::Binary(b) => assert_eq!(b.last(), Some(&i)),
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn close_emits_close_frame_and_fails_later_sends() {
        let (chan, _rx, mut closed) = recording_channel(None);
        chan.close("normal closure").await;
        assert_eq!(closed.recv().await.unwrap(), "normal closure");
        assert!(!chan.is_open());
        assert!(chan.send_json(&protocol::ControlMessage::ping()).await.is_err());
    }

    #[tokio::test]
    async fn transport_failure_closes_the_channel() {
        let (chan, _rx, _closed) = recording_channel(Some(0));
        // First send is queued fine; the writer task hits the broken sink.
        let _ = chan.send_frame("c1", b"x").await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!chan.is_open());
        assert!(chan.send_frame("c1", b"y").await.is_err());
    }
}
