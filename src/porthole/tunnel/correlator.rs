use std::time::Duration;

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::porthole::tunnel::{
    protocol::{HttpKind, HttpMessage},
    registry::TunnelContext,
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("tunnel has no control channel attached")]
    NotAttached,
    #[error("control channel closed while waiting for the response")]
    ChannelClosed,
    #[error("timed out waiting for the tunnel response")]
    Timeout,
}

/// Forwards one HTTP request down the tunnel's control channel and waits
/// for the matching response.
///
/// Assigns a request id when absent, records the pending slot, and
/// resolves it when `on_response` sees the same id. Many requests may be
/// in flight concurrently; there is no ordering between them. The entry
/// is removed on every exit path, so a response arriving after a timeout
/// finds nothing and is dropped.
pub async fn forward(
    ctx: &TunnelContext,
    mut request: HttpMessage,
    wait: Duration,
) -> Result<HttpMessage, ForwardError> {
    let channel = ctx.channel().ok_or(ForwardError::NotAttached)?;

    let id = request
        .id
        .get_or_insert_with(|| Uuid::new_v4().to_string())
        .clone();
    request.kind = Some(HttpKind::Request);

    let (tx, rx) = oneshot::channel();
    ctx.pending.insert(id.clone(), tx);

    if channel.send_json(&request).await.is_err() {
        ctx.pending.remove(&id);
        return Err(ForwardError::ChannelClosed);
    }

    match tokio::time::timeout(wait, rx).await {
        Ok(Ok(response)) => Ok(response),
        // Completion slot dropped: the tunnel detached and drained.
        Ok(Err(_)) => {
            ctx.pending.remove(&id);
            Err(ForwardError::ChannelClosed)
        }
        Err(_) => {
            ctx.pending.remove(&id);
            Err(ForwardError::Timeout)
        }
    }
}

/// Completes the pending request matching this response's id. A response
/// with no match (duplicate, or the request already timed out) is
/// silently dropped.
pub fn on_response(ctx: &TunnelContext, response: HttpMessage) {
    let Some(id) = response.id.clone() else {
        tracing::debug!(tunnel = %ctx.id, "correlator: response without id dropped");
        return;
    };
    if let Some((_, slot)) = ctx.pending.remove(&id) {
        let _ = slot.send(response);
    } else {
        tracing::debug!(tunnel = %ctx.id, request = %id, "correlator: no pending request for response");
    }
}
