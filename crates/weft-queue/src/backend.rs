use std::time::Duration;

use futures::future::BoxFuture;

use weft_core::error::Result;

/// List and flag primitives the bridge and workers are built on.
///
/// Lists follow Redis semantics: `push` adds at the head and consumers take
/// from the tail, so each list is FIFO. Every failure is a
/// `WeftError::Transport`.
pub trait QueueBackend: Send + Sync + 'static {
    /// Add `payload` to the head of `key`.
    fn push<'a>(&'a self, key: &'a str, payload: String) -> BoxFuture<'a, Result<()>>;

    /// Atomically move the oldest entry of `from` to the head of `to`,
    /// waiting up to `timeout` for one to appear.
    fn claim<'a>(
        &'a self,
        from: &'a str,
        to: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Option<String>>>;

    /// Remove and return the oldest entry of `key`, waiting up to `timeout`.
    fn pop<'a>(&'a self, key: &'a str, timeout: Duration) -> BoxFuture<'a, Result<Option<String>>>;

    /// Remove one occurrence of `payload` from `key`.
    fn remove<'a>(&'a self, key: &'a str, payload: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Move every entry of `from` onto `to`, oldest first. Returns the count.
    fn move_all<'a>(&'a self, from: &'a str, to: &'a str) -> BoxFuture<'a, Result<usize>>;

    /// Remove and return every entry of `key`, oldest first.
    fn drain<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Vec<String>>>;

    /// Set a flag that expires after `ttl`.
    fn set_flag<'a>(&'a self, key: &'a str, ttl: Duration) -> BoxFuture<'a, Result<()>>;

    fn has_flag<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>>;
}
