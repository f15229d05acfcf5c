use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::{
    Message as WsMessage, client::IntoClientRequest, http::header,
};

use crate::porthole::{
    config::AgentConfig,
    directory::{HttpStatusReporter, StatusReporter},
    tunnel::{
        bridge::{self, AgentState},
        channel::{AgentSink, ControlChannel, SEND_QUEUE},
        protocol::{self, ControlMessage, TunnelKind},
    },
};

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Cadence of the REST "still alive" reports for TCP/UDP tunnels.
const STATUS_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

pub fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

/// Owns the agent's control-channel lifecycle: connect, heartbeat,
/// exponential-backoff reconnect, graceful shutdown, and status
/// reporting to the tunnel-metadata collaborator.
pub struct Supervisor {
    state: Arc<AgentState>,
    reporter: Arc<dyn StatusReporter>,
    /// Starts true so a tunnel that never attached reports nothing;
    /// armed on connect, fired at most once per attachment.
    closed_reported: AtomicBool,
}

impl Supervisor {
    pub fn new(cfg: AgentConfig) -> anyhow::Result<Self> {
        let reporter = Arc::new(HttpStatusReporter::new(
            cfg.server_url.clone(),
            cfg.auth_token.clone(),
        ));
        Self::with_reporter(cfg, reporter)
    }

    pub fn with_reporter(
        cfg: AgentConfig,
        reporter: Arc<dyn StatusReporter>,
    ) -> anyhow::Result<Self> {
        Ok(Supervisor {
            state: AgentState::new(cfg)?,
            reporter,
            closed_reported: AtomicBool::new(true),
        })
    }

    #[cfg(test)]
    pub fn agent_state(&self) -> Arc<AgentState> {
        self.state.clone()
    }

    /// DISCONNECTED -> CONNECTING -> CONNECTED -> (loss -> backoff ->
    /// CONNECTING)* -> STOPPED. Returns when the shutdown signal fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.run_once(shutdown.clone(), &mut backoff).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(
                        server = %self.state.cfg.server_url,
                        err = %err,
                        backoff = %humantime::format_duration(backoff),
                        "agent: disconnected; retrying"
                    );
                }
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = next_backoff(backoff);
        }
    }

    async fn run_once(
        &self,
        mut shutdown: watch::Receiver<bool>,
        backoff: &mut Duration,
    ) -> anyhow::Result<()> {
        let cfg = &self.state.cfg;

        let url = control_url(cfg);
        let mut request = url.as_str().into_client_request()?;
        if !cfg.auth_token.is_empty() {
            request.headers_mut().insert(
                header::AUTHORIZATION,
                format!("Bearer {}", cfg.auth_token).parse()?,
            );
        }

        tracing::debug!(url = %url, "agent: dialing relay");
        let (ws, _resp) = tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| anyhow::anyhow!("connect timed out"))??;

        // A successful attach resets the failure streak.
        *backoff = INITIAL_BACKOFF;

        let (sink, mut stream) = ws.split();
        let channel = ControlChannel::start(Box::new(AgentSink::new(sink)), SEND_QUEUE);
        self.state.set_channel(channel.clone());
        self.closed_reported.store(false, Ordering::SeqCst);
        tracing::info!(tunnel = %cfg.tunnel_id, kind = %cfg.kind, "agent: control channel connected");

        // HTTP tunnels are tracked by the relay through the control
        // connection itself; TCP/UDP report via REST.
        let mut status_task = None;
        if matches!(cfg.kind, TunnelKind::Tcp | TunnelKind::Udp) {
            let reporter = self.reporter.clone();
            let tunnel_id = cfg.tunnel_id;
            tokio::spawn(async move { reporter.connected(tunnel_id).await });

            let reporter = self.reporter.clone();
            status_task = Some(tokio::spawn(async move {
                let mut tick = tokio::time::interval(STATUS_HEARTBEAT_INTERVAL);
                loop {
                    tick.tick().await;
                    reporter.heartbeat(tunnel_id).await;
                }
            }));
        }

        let ping_task = {
            let channel = channel.clone();
            let interval = cfg.heartbeat_interval;
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    if channel.send_json(&ControlMessage::ping()).await.is_err() {
                        break;
                    }
                }
            })
        };

        let mut stopped = false;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        stopped = true;
                        channel.close("client exit").await;
                        break;
                    }
                }
                next = stream.next() => match next {
                    Some(Ok(WsMessage::Text(text))) => {
                        bridge::dispatch_text(&self.state, text.as_str()).await;
                    }
                    Some(Ok(WsMessage::Binary(frame))) => match protocol::decode_frame(&frame) {
                        Some((connection_id, data)) => {
                            bridge::dispatch_frame(&self.state, &connection_id, data).await;
                        }
                        None => {
                            tracing::debug!("agent: malformed binary frame dropped");
                        }
                    },
                    Some(Ok(WsMessage::Close(frame))) => {
                        tracing::info!(frame = ?frame, "agent: relay closed the control channel");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::debug!(err = %err, "agent: control read failed");
                        break;
                    }
                    None => break,
                }
            }
        }

        ping_task.abort();
        if let Some(task) = status_task {
            task.abort();
        }
        self.state.clear_channel();
        channel.close("connection lost").await;
        bridge::teardown(&self.state).await;
        self.report_closed_once().await;

        if stopped {
            tracing::info!(tunnel = %cfg.tunnel_id, "agent: stopped");
            Ok(())
        } else {
            anyhow::bail!("control channel closed")
        }
    }

    /// Terminal status goes out once per attachment even when a failure
    /// and an explicit close race each other.
    async fn report_closed_once(&self) {
        if matches!(self.state.cfg.kind, TunnelKind::Tcp | TunnelKind::Udp)
            && self
                .closed_reported
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            self.reporter.closed(self.state.cfg.tunnel_id).await;
        }
    }
}

fn control_url(cfg: &AgentConfig) -> String {
    let mut url = format!("{}/tunnel/{}", ws_base(&cfg.server_url), cfg.tunnel_id);
    if matches!(cfg.kind, TunnelKind::Tcp | TunnelKind::Udp) {
        url.push_str(&format!("?type={}&port={}", cfg.kind, cfg.public_port));
        if !cfg.public_host.is_empty() {
            url.push_str(&format!("&public-host={}", cfg.public_host));
        }
    }
    url
}

fn ws_base(server_url: &str) -> String {
    let trimmed = server_url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn backoff_doubles_to_the_cap() {
        let mut backoff = INITIAL_BACKOFF;
        for n in 0u32..8 {
            let expected = Duration::from_secs((1u64 << n).min(MAX_BACKOFF.as_secs()));
            assert_eq!(backoff, expected, "attempt {n}");
            backoff = next_backoff(backoff);
        }
        // Stays pinned at the cap afterwards.
        assert_eq!(next_backoff(backoff), MAX_BACKOFF);
    }

    #[test]
    fn control_url_for_net_tunnels_carries_params() {
        let id = Uuid::new_v4();
        let cfg = AgentConfig {
            server_url: "https://relay.example.dev".into(),
            tunnel_id: id,
            kind: TunnelKind::Tcp,
            auth_token: String::new(),
            local_host: "127.0.0.1".into(),
            local_port: 25565,
            local_scheme: "http".into(),
            public_host: "edge-2.example.dev".into(),
            public_port: 41002,
            heartbeat_interval: Duration::from_secs(15),
        };
        assert_eq!(
            control_url(&cfg),
            format!(
                "wss://relay.example.dev/tunnel/{id}?type=tcp&port=41002&public-host=edge-2.example.dev"
            )
        );
    }

    #[test]
    fn control_url_for_http_tunnels_is_bare() {
        let id = Uuid::new_v4();
        let cfg = AgentConfig {
            server_url: "http://127.0.0.1:8080/".into(),
            tunnel_id: id,
            kind: TunnelKind::Http,
            auth_token: String::new(),
            local_host: "127.0.0.1".into(),
            local_port: 3000,
            local_scheme: "http".into(),
            public_host: String::new(),
            public_port: 0,
            heartbeat_interval: Duration::from_secs(15),
        };
        assert_eq!(
            control_url(&cfg),
            format!("ws://127.0.0.1:8080/tunnel/{id}")
        );
    }
}
