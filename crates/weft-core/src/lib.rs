pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod graph;
pub mod retry;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use context::ExecutionContext;
pub use error::{Result, WeftError};
pub use event::EventBus;
pub use graph::{Edge, Endpoint, Graph, Mode, Node, ValueType};
pub use types::*;
