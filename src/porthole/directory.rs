use std::collections::HashMap;

use async_trait::async_trait;
use uuid::Uuid;

use crate::porthole::tunnel::protocol::TunnelKind;

/// Where a public hostname leads.
#[derive(Debug, Clone, Copy)]
pub struct TunnelRoute {
    pub tunnel_id: Uuid,
    pub kind: TunnelKind,
}

/// Tunnel-metadata collaborator on the relay side.
///
/// Account management, reservations and persistence live outside the
/// core; the relay only needs to resolve hostnames to tunnels and to
/// hand off lifecycle records. The built-in implementation is a static
/// table from the config file.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Resolves a public subdomain (or full host) to a tunnel.
    async fn resolve_host(&self, host: &str) -> Option<TunnelRoute>;
    /// Looks a tunnel up by id, e.g. when a control connection arrives.
    async fn resolve_id(&self, tunnel_id: Uuid) -> Option<TunnelRoute>;

    // Lifecycle records are fire-and-forget; the core ignores failures.
    async fn record_connected(&self, tunnel_id: Uuid);
    async fn record_heartbeat(&self, tunnel_id: Uuid);
    async fn record_closed(&self, tunnel_id: Uuid);
}

pub struct StaticDirectory {
    by_host: HashMap<String, TunnelRoute>,
    by_id: HashMap<Uuid, TunnelRoute>,
}

impl StaticDirectory {
    pub fn new(entries: impl IntoIterator<Item = (String, TunnelRoute)>) -> Self {
        let mut by_host = HashMap::new();
        let mut by_id = HashMap::new();
        for (host, route) in entries {
            let host = host.trim().to_ascii_lowercase();
            if !host.is_empty() {
                by_host.insert(host, route);
            }
            by_id.insert(route.tunnel_id, route);
        }
        StaticDirectory { by_host, by_id }
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn resolve_host(&self, host: &str) -> Option<TunnelRoute> {
        self.by_host.get(&host.trim().to_ascii_lowercase()).copied()
    }

    async fn resolve_id(&self, tunnel_id: Uuid) -> Option<TunnelRoute> {
        self.by_id.get(&tunnel_id).copied()
    }

    async fn record_connected(&self, tunnel_id: Uuid) {
        tracing::debug!(tunnel = %tunnel_id, "directory: tunnel connected");
    }

    async fn record_heartbeat(&self, tunnel_id: Uuid) {
        tracing::trace!(tunnel = %tunnel_id, "directory: tunnel heartbeat");
    }

    async fn record_closed(&self, tunnel_id: Uuid) {
        tracing::debug!(tunnel = %tunnel_id, "directory: tunnel closed");
    }
}

/// Agent-side status reporting collaborator.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn connected(&self, tunnel_id: Uuid);
    async fn heartbeat(&self, tunnel_id: Uuid);
    async fn closed(&self, tunnel_id: Uuid);
}

/// Best-effort REST reporter: `POST /tunnels/{id}/connected`,
/// `.../heartbeat`, `.../closed`. Failures are logged and ignored.
pub struct HttpStatusReporter {
    http: reqwest::Client,
    base_url: String,
    auth_token: String,
}

impl HttpStatusReporter {
    pub fn new(base_url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        HttpStatusReporter {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token: auth_token.into(),
        }
    }

    async fn post(&self, tunnel_id: Uuid, what: &str) {
        let url = format!("{}/tunnels/{}/{}", self.base_url, tunnel_id, what);
        let mut req = self.http.post(&url).json(&serde_json::json!({}));
        if !self.auth_token.is_empty() {
            req = req.bearer_auth(&self.auth_token);
        }
        match req.send().await {
            Ok(resp) if !resp.status().is_success() => {
                tracing::debug!(url = %url, status = %resp.status(), "agent: status report rejected");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(url = %url, err = %err, "agent: status report failed");
            }
        }
    }
}

#[async_trait]
impl StatusReporter for HttpStatusReporter {
    async fn connected(&self, tunnel_id: Uuid) {
        self.post(tunnel_id, "connected").await;
    }

    async fn heartbeat(&self, tunnel_id: Uuid) {
        self.post(tunnel_id, "heartbeat").await;
    }

    async fn closed(&self, tunnel_id: Uuid) {
        self.post(tunnel_id, "closed").await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_directory_resolves_case_insensitively() {
        let id = Uuid::new_v4();
        let dir = StaticDirectory::new([(
            "Demo".to_string(),
            TunnelRoute {
                tunnel_id: id,
                kind: TunnelKind::Http,
            },
        )]);
        let route = dir.resolve_host("demo").await.unwrap();
        assert_eq!(route.tunnel_id, id);
        assert!(dir.resolve_host("other").await.is_none());
        assert!(dir.resolve_id(id).await.is_some());
    }
}
