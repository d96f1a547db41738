use thiserror::Error;

#[derive(Debug, Error)]
pub enum WeftError {
    // Graph errors
    #[error("Invalid graph: {0}")]
    Validation(String),

    #[error("Graph file parse error: {0}")]
    GraphParse(String),

    // Registry errors
    #[error("Handler already registered for node type: {0}")]
    DuplicateHandler(String),

    #[error("No executor available for node type: {0}")]
    NoExecutor(String),

    // Handler errors
    #[error("Node handler failed: {node_type}: {message}")]
    Handler { node_type: String, message: String },

    #[error("Node handler timeout after {timeout_secs}s: {node_type}")]
    HandlerTimeout { node_type: String, timeout_secs: u64 },

    #[error("Missing input '{slot}' for node type {node_type}")]
    MissingInput { node_type: String, slot: String },

    /// A peer or queue worker reported a failed firing.
    #[error("Execution failed on {route}: {message}")]
    Remote { route: String, message: String },

    #[error("Node {node_id} exceeded the limit of {limit} firings")]
    FiringLimit { node_id: String, limit: u32 },

    // Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Delivery failed after {attempts} attempts: {message}")]
    Delivery { attempts: u32, message: String },

    // Run errors
    #[error("Execution cancelled")]
    Cancelled,

    #[error("Deadlock: no progress for {idle_ms}ms with {in_flight} dispatch(es) in flight")]
    Deadlock { idle_ms: u64, in_flight: usize },

    #[error("Run task aborted: {0}")]
    RunAborted(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WeftError {
    /// Shorthand for a handler failure.
    pub fn handler(node_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            node_type: node_type.into(),
            message: message.into(),
        }
    }

    /// Whether the failure came from the transport and may succeed on a later attempt.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, WeftError>;
