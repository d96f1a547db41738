use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use weft_core::config::PeerConfig;
use weft_core::error::{Result, WeftError};
use weft_core::traits::RemotePeer;
use weft_core::types::{HandlerDefinition, NodeInvocation, NodeUpdate};
use weft_core::ExecutionContext;

use crate::protocol::{ExecuteRequest, EVENT_UPDATE, EXECUTIONS_PATH};
use crate::sse::SseStream;

/// A weft peer reached over HTTP.
///
/// Delegations open `POST /api/executions` and read the SSE response as
/// `NodeUpdate`s. Cancelling the caller's context sends
/// `DELETE /api/executions/{id}` while the stream is still open.
#[derive(Clone)]
pub struct HttpPeer {
    name: String,
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpPeer {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn from_config(config: &PeerConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        // No overall request timeout: it would cut long-running streams
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| WeftError::Config(format!("peer '{}': {}", config.name, e)))?;
        Ok(Self::new(config.name.clone(), config.url.clone())
            .with_client(client)
            .with_timeout(timeout))
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Bound on connecting and receiving response headers.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn transport(&self, err: impl std::fmt::Display) -> WeftError {
        WeftError::Transport(format!("peer '{}': {}", self.name, err))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        match tokio::time::timeout(self.timeout, request.send()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(self.transport(e)),
            Err(_) => Err(self.transport(format!(
                "no response within {}s",
                self.timeout.as_secs()
            ))),
        }
    }

    /// Map non-2xx statuses: 5xx may succeed on retry, 4xx will not.
    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            Err(self.transport(format!("{}: {}", status, body)))
        } else {
            Err(WeftError::Remote {
                route: format!("peer '{}'", self.name),
                message: format!("{}: {}", status, body),
            })
        }
    }

    pub async fn health(&self) -> Result<serde_json::Value> {
        let response = self.send(self.client.get(self.url("/api/health"))).await?;
        let response = self.check(response).await?;
        response.json().await.map_err(|e| self.transport(e))
    }

    /// Node types the peer runs locally.
    pub async fn node_types(&self) -> Result<Vec<HandlerDefinition>> {
        let response = self.send(self.client.get(self.url("/api/node-types"))).await?;
        let response = self.check(response).await?;
        response.json().await.map_err(|e| self.transport(e))
    }

    /// Spawn a watcher that sends `DELETE` for `execution_id` once `ctx` is
    /// cancelled. Dropping the returned token's guard stops the watcher.
    fn forward_cancellation(&self, execution_id: String, ctx: &ExecutionContext) -> CancellationToken {
        let done = CancellationToken::new();
        let stop = done.clone();
        let cancel = ctx.cancel_token();
        let client = self.client.clone();
        let url = self.url(&format!("{}/{}", EXECUTIONS_PATH, execution_id));
        let peer = self.name.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = cancel.cancelled() => {
                    debug!(peer = %peer, execution_id = %execution_id, "Forwarding cancellation");
                    if let Err(e) = client.delete(&url).send().await {
                        warn!(peer = %peer, error = %e, "Failed to forward cancellation");
                    }
                }
            }
        });
        done
    }
}

impl RemotePeer for HttpPeer {
    fn name(&self) -> &str {
        &self.name
    }

    fn delegate(
        &self,
        invocation: NodeInvocation,
        ctx: ExecutionContext,
    ) -> BoxFuture<'_, Result<BoxStream<'static, Result<NodeUpdate>>>> {
        Box::pin(async move {
            let execution_id = Uuid::new_v4().to_string();
            let request = ExecuteRequest::new(execution_id.clone(), invocation, &ctx);
            debug!(
                peer = %self.name,
                execution_id = %execution_id,
                node_type = %request.invocation.node_type,
                "Delegating firing"
            );

            let response = self
                .send(self.client.post(self.url(EXECUTIONS_PATH)).json(&request))
                .await?;
            let response = self.check(response).await?;

            let guard = self.forward_cancellation(execution_id, &ctx).drop_guard();
            let peer = self.name.clone();
            let updates = SseStream::new(Box::pin(response.bytes_stream()))
                .filter_map(move |item| {
                    let _watching = &guard;
                    let parsed = match item {
                        Ok(event) if event.event_type.as_deref().unwrap_or(EVENT_UPDATE) == EVENT_UPDATE => {
                            Some(serde_json::from_str::<NodeUpdate>(&event.data).map_err(|e| {
                                WeftError::Transport(format!("peer '{}' sent a malformed update: {}", peer, e))
                            }))
                        }
                        Ok(_) => None,
                        Err(e) => Some(Err(e)),
                    };
                    futures::future::ready(parsed)
                })
                .boxed();
            Ok(updates)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_trims_base_url() {
        let peer = HttpPeer::from_config(&PeerConfig {
            name: "gpu".into(),
            url: "http://10.0.0.5:18790/".into(),
            node_types: vec!["image.resize".into()],
            timeout_secs: 3,
        })
        .unwrap();
        assert_eq!(peer.name(), "gpu");
        assert_eq!(peer.base_url(), "http://10.0.0.5:18790");
        assert_eq!(peer.url("/api/health"), "http://10.0.0.5:18790/api/health");
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_transport_error() {
        let peer = HttpPeer::new("down", "http://127.0.0.1:1").with_timeout(Duration::from_secs(5));
        let err = peer
            .delegate(NodeInvocation::new("n", "t"), ExecutionContext::new())
            .await
            .err()
            .unwrap();
        assert!(err.is_transport());
        assert!(err.to_string().contains("peer 'down'"));
    }
}
