use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use weft_core::error::Result;

use crate::backend::QueueBackend;

#[derive(Default)]
struct State {
    lists: HashMap<String, VecDeque<String>>,
    flags: HashMap<String, Instant>,
}

/// In-process backend for tests and single-process deployments.
///
/// Lists are `VecDeque`s with the head at the front. Blocking reads wait on a
/// shared `Notify` that every push wakes.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
    pushed: Notify,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries of `key`, head first.
    pub async fn list(&self, key: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .lists
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn len(&self, key: &str) -> usize {
        let state = self.state.lock().await;
        state.lists.get(key).map(VecDeque::len).unwrap_or(0)
    }

    /// Take from the tail of `from`, pushing onto the head of `to` when given.
    async fn take(&self, from: &str, to: Option<&str>, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking so a push in between is not lost.
            let notified = self.pushed.notified();
            {
                let mut state = self.state.lock().await;
                if let Some(item) = state.lists.get_mut(from).and_then(VecDeque::pop_back) {
                    if let Some(to) = to {
                        state
                            .lists
                            .entry(to.to_string())
                            .or_default()
                            .push_front(item.clone());
                    }
                    return Some(item);
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }
}

impl QueueBackend for MemoryBackend {
    fn push<'a>(&'a self, key: &'a str, payload: String) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.lists.entry(key.to_string()).or_default().push_front(payload);
            drop(state);
            self.pushed.notify_waiters();
            Ok(())
        })
    }

    fn claim<'a>(
        &'a self,
        from: &'a str,
        to: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move { Ok(self.take(from, Some(to), timeout).await) })
    }

    fn pop<'a>(&'a self, key: &'a str, timeout: Duration) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move { Ok(self.take(key, None, timeout).await) })
    }

    fn remove<'a>(&'a self, key: &'a str, payload: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if let Some(list) = state.lists.get_mut(key) {
                if let Some(pos) = list.iter().position(|p| p == payload) {
                    list.remove(pos);
                }
            }
            Ok(())
        })
    }

    fn move_all<'a>(&'a self, from: &'a str, to: &'a str) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let Some(mut source) = state.lists.remove(from) else {
                return Ok(0);
            };
            let moved = source.len();
            let target = state.lists.entry(to.to_string()).or_default();
            while let Some(item) = source.pop_back() {
                target.push_front(item);
            }
            drop(state);
            if moved > 0 {
                self.pushed.notify_waiters();
            }
            Ok(moved)
        })
    }

    fn drain<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let list = state.lists.remove(key).unwrap_or_default();
            Ok(list.into_iter().rev().collect())
        })
    }

    fn set_flag<'a>(&'a self, key: &'a str, ttl: Duration) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.flags.insert(key.to_string(), Instant::now() + ttl);
            Ok(())
        })
    }

    fn has_flag<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            match state.flags.get(key) {
                Some(expires) if *expires > Instant::now() => Ok(true),
                Some(_) => {
                    state.flags.remove(key);
                    Ok(false)
                }
                None => Ok(false),
            }
        })
    }
}
