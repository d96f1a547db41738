use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::WeftError;
use crate::types::{CorrelationId, Value};

/// Per-run state shared by every node of a run.
///
/// Cloning is cheap: clones share the cancellation token and the value bag.
#[derive(Clone)]
pub struct ExecutionContext {
    correlation_id: CorrelationId,
    cancel: CancellationToken,
    values: Arc<RwLock<BTreeMap<String, Value>>>,
    verbose_errors: bool,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            cancel: CancellationToken::new(),
            values: Arc::new(RwLock::new(BTreeMap::new())),
            verbose_errors: false,
        }
    }

    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = id;
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Attach full diagnostic detail to node errors (development deployments).
    pub fn with_verbose_errors(mut self, verbose: bool) -> Self {
        self.verbose_errors = verbose;
        self
    }

    /// Replace the value bag.
    pub fn with_values(mut self, values: BTreeMap<String, Value>) -> Self {
        self.values = Arc::new(RwLock::new(values));
        self
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the run is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// A context whose cancellation follows this one but can also be
    /// cancelled on its own. The value bag is shared.
    pub fn child(&self) -> Self {
        Self {
            correlation_id: self.correlation_id.clone(),
            cancel: self.cancel.child_token(),
            values: Arc::clone(&self.values),
            verbose_errors: self.verbose_errors,
        }
    }

    /// A child context cancelled automatically once `timeout` elapses.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_deadline(&self, timeout: Duration) -> Self {
        let child = self.child();
        let token = child.cancel_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    tracing::debug!(timeout_ms = timeout.as_millis() as u64, "Run deadline reached");
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        });
        child
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.read().ok().and_then(|v| v.get(key).cloned())
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        if let Ok(mut values) = self.values.write() {
            values.insert(key.into(), value);
        }
    }

    /// Copy of the value bag, for shipping to remote peers and workers.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.values.read().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn verbose_errors(&self) -> bool {
        self.verbose_errors
    }

    /// Render an error for a node's `fail` transition.
    pub fn render_error(&self, err: &WeftError) -> String {
        if self.verbose_errors {
            format!("{err} ({err:?})")
        } else {
            err.to_string()
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("correlation_id", &self.correlation_id)
            .field("cancelled", &self.is_cancelled())
            .field("verbose_errors", &self.verbose_errors)
            .finish_non_exhaustive()
    }
}
