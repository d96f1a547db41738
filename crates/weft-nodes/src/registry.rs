use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::debug;

use weft_core::error::{Result, WeftError};
use weft_core::traits::{NodeHandler, RemotePeer};
use weft_core::types::{HandlerDefinition, NodeInvocation, OutputSnapshot};
use weft_core::ExecutionContext;

/// How a node type is served.
#[derive(Clone)]
pub enum Registration {
    /// Run in-process.
    Local(Arc<dyn NodeHandler>),
    /// Delegate to a remote peer.
    Remote(Arc<dyn RemotePeer>),
}

/// Registry mapping each node type to exactly one handler or remote peer.
pub struct HandlerRegistry {
    entries: HashMap<String, Registration>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register a local handler. Fails if the type is already registered.
    pub fn register(&mut self, handler: impl NodeHandler) -> Result<()> {
        self.register_arc(Arc::new(handler))
    }

    pub fn register_arc(&mut self, handler: Arc<dyn NodeHandler>) -> Result<()> {
        let node_type = handler.node_type().to_string();
        self.insert(node_type, Registration::Local(handler))
    }

    /// Mark a node type as served by a remote peer.
    pub fn register_remote(
        &mut self,
        node_type: impl Into<String>,
        peer: Arc<dyn RemotePeer>,
    ) -> Result<()> {
        self.insert(node_type.into(), Registration::Remote(peer))
    }

    fn insert(&mut self, node_type: String, registration: Registration) -> Result<()> {
        if self.entries.contains_key(&node_type) {
            return Err(WeftError::DuplicateHandler(node_type));
        }
        debug!(node_type = %node_type, "Registered node type");
        self.entries.insert(node_type, registration);
        Ok(())
    }

    pub fn get(&self, node_type: &str) -> Option<&Registration> {
        self.entries.get(node_type)
    }

    /// Local handler for a node type, if it runs in-process.
    pub fn local(&self, node_type: &str) -> Option<Arc<dyn NodeHandler>> {
        match self.entries.get(node_type) {
            Some(Registration::Local(handler)) => Some(Arc::clone(handler)),
            _ => None,
        }
    }

    /// Remote peer for a node type, if it is delegated.
    pub fn remote(&self, node_type: &str) -> Option<Arc<dyn RemotePeer>> {
        match self.entries.get(node_type) {
            Some(Registration::Remote(peer)) => Some(Arc::clone(peer)),
            _ => None,
        }
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.entries.contains_key(node_type)
    }

    /// Registered node types, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.entries.keys().map(|s| s.as_str()).collect();
        types.sort_unstable();
        types
    }

    /// Node types served in-process, sorted.
    pub fn local_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self
            .entries
            .iter()
            .filter(|(_, r)| matches!(r, Registration::Local(_)))
            .map(|(k, _)| k.as_str())
            .collect();
        types.sort_unstable();
        types
    }

    pub fn definitions(&self) -> Vec<HandlerDefinition> {
        let mut defs: Vec<HandlerDefinition> = self
            .entries
            .iter()
            .map(|(node_type, registration)| match registration {
                Registration::Local(handler) => HandlerDefinition {
                    node_type: node_type.clone(),
                    description: handler.description().to_string(),
                    route: "local".to_string(),
                },
                Registration::Remote(peer) => HandlerDefinition {
                    node_type: node_type.clone(),
                    description: String::new(),
                    route: format!("remote:{}", peer.name()),
                },
            })
            .collect();
        defs.sort_by(|a, b| a.node_type.cmp(&b.node_type));
        defs
    }

    /// Run a local handler to completion and collect every emission.
    pub async fn execute(
        &self,
        invocation: NodeInvocation,
        ctx: ExecutionContext,
    ) -> Result<Vec<OutputSnapshot>> {
        let node_type = invocation.node_type.clone();
        let handler = self
            .local(&node_type)
            .ok_or_else(|| WeftError::NoExecutor(node_type.clone()))?;

        let timeout = Duration::from_secs(handler.timeout_secs());
        let mut stream = handler.run(invocation, ctx);
        let collect = async move {
            let mut outputs = Vec::new();
            while let Some(item) = stream.next().await {
                outputs.push(item?);
            }
            Ok::<_, WeftError>(outputs)
        };

        match tokio::time::timeout(timeout, collect).await {
            Ok(result) => result,
            Err(_) => Err(WeftError::HandlerTimeout {
                node_type,
                timeout_secs: handler.timeout_secs(),
            }),
        }
    }

    /// Create a registry with all built-in node types registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for handler in crate::builtin::all() {
            let node_type = handler.node_type().to_string();
            registry
                .entries
                .insert(node_type, Registration::Local(handler));
        }
        registry
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::flow::{ConstantNode, FailNode};
    use serde_json::json;

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register(ConstantNode).unwrap();
        let err = registry.register(ConstantNode).unwrap_err();
        assert!(matches!(err, WeftError::DuplicateHandler(ref t) if t == "constant"));
    }

    #[test]
    fn test_builtins_registered_locally() {
        let registry = HandlerRegistry::with_builtins();
        for node_type in ["constant", "sequence", "template", "http_fetch", "iterate"] {
            assert!(registry.local(node_type).is_some(), "{node_type} missing");
        }
        assert_eq!(registry.list(), registry.local_types());
        assert!(registry
            .definitions()
            .iter()
            .all(|d| d.route == "local" && !d.description.is_empty()));
    }

    #[tokio::test]
    async fn test_execute_collects_emissions() {
        let registry = HandlerRegistry::with_builtins();
        let inv = NodeInvocation::new("c", "constant").with_metadata("value", json!(42));
        let outputs = registry
            .execute(inv, ExecutionContext::new())
            .await
            .unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0]["out"], json!(42));
    }

    #[tokio::test]
    async fn test_execute_surfaces_handler_error() {
        let mut registry = HandlerRegistry::new();
        registry.register(FailNode).unwrap();
        let inv = NodeInvocation::new("f", "fail").with_metadata("message", json!("boom"));
        let err = registry
            .execute(inv, ExecutionContext::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_execute_unknown_type() {
        let registry = HandlerRegistry::new();
        let err = registry
            .execute(NodeInvocation::new("x", "nope"), ExecutionContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::NoExecutor(_)));
    }
}
