//! Queued dispatch: jobs published to a message broker and executed by
//! workers outside the scheduler's process.

pub mod backend;
pub mod bridge;
pub mod memory;
pub mod message;
pub mod redis_backend;
pub mod worker;

pub use backend::QueueBackend;
pub use bridge::{QueueBridge, QueueKeys};
pub use memory::MemoryBackend;
pub use message::{JobMessage, ResultMessage};
pub use redis_backend::{RedisBackend, RedisConnectionFactory};
pub use worker::{spawn_workers, JobDisposition, QueueWorker};
