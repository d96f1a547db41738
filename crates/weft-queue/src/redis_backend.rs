use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use weft_core::config::QueueConfig;
use weft_core::error::{Result, WeftError};

use crate::backend::QueueBackend;

fn transport(context: &str, err: RedisError) -> WeftError {
    WeftError::Transport(format!("redis {}: {}", context, err))
}

/// Blocking commands take whole seconds; zero would block forever.
fn blocking_secs(timeout: Duration) -> u64 {
    timeout.as_secs().max(1)
}

/// Hands out multiplexed connections, at most `max_connections` at a time.
#[derive(Clone)]
pub struct RedisConnectionFactory {
    client: Client,
    permits: Arc<Semaphore>,
}

impl RedisConnectionFactory {
    pub fn new(url: &str, max_connections: usize) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| WeftError::Config(format!("invalid redis url '{}': {}", url, e)))?;
        Ok(Self {
            client,
            permits: Arc::new(Semaphore::new(max_connections.max(1))),
        })
    }

    pub async fn connection(&self) -> Result<RedisConnection> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WeftError::Transport("redis connection pool closed".into()))?;
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| transport("connect", e))?;
        Ok(RedisConnection {
            conn,
            _permit: permit,
        })
    }
}

/// A connection that holds its pool permit until dropped.
pub struct RedisConnection {
    conn: MultiplexedConnection,
    _permit: OwnedSemaphorePermit,
}

impl Deref for RedisConnection {
    type Target = MultiplexedConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for RedisConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

/// `QueueBackend` over Redis lists and expiring keys.
pub struct RedisBackend {
    factory: RedisConnectionFactory,
}

impl RedisBackend {
    pub fn new(factory: RedisConnectionFactory) -> Self {
        Self { factory }
    }

    pub fn from_config(config: &QueueConfig) -> Result<Self> {
        Ok(Self::new(RedisConnectionFactory::new(
            &config.url,
            config.max_connections,
        )?))
    }
}

impl QueueBackend for RedisBackend {
    fn push<'a>(&'a self, key: &'a str, payload: String) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut conn = self.factory.connection().await?;
            redis::cmd("LPUSH")
                .arg(key)
                .arg(payload)
                .query_async::<()>(&mut *conn)
                .await
                .map_err(|e| transport("LPUSH", e))
        })
    }

    fn claim<'a>(
        &'a self,
        from: &'a str,
        to: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move {
            let mut conn = self.factory.connection().await?;
            redis::cmd("BRPOPLPUSH")
                .arg(from)
                .arg(to)
                .arg(blocking_secs(timeout))
                .query_async::<Option<String>>(&mut *conn)
                .await
                .map_err(|e| transport("BRPOPLPUSH", e))
        })
    }

    fn pop<'a>(&'a self, key: &'a str, timeout: Duration) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move {
            let mut conn = self.factory.connection().await?;
            let popped: Option<(String, String)> = redis::cmd("BRPOP")
                .arg(key)
                .arg(blocking_secs(timeout))
                .query_async(&mut *conn)
                .await
                .map_err(|e| transport("BRPOP", e))?;
            Ok(popped.map(|(_, payload)| payload))
        })
    }

    fn remove<'a>(&'a self, key: &'a str, payload: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut conn = self.factory.connection().await?;
            redis::cmd("LREM")
                .arg(key)
                .arg(1)
                .arg(payload)
                .query_async::<()>(&mut *conn)
                .await
                .map_err(|e| transport("LREM", e))
        })
    }

    fn move_all<'a>(&'a self, from: &'a str, to: &'a str) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            let mut conn = self.factory.connection().await?;
            let mut moved = 0;
            loop {
                let item: Option<String> = redis::cmd("RPOPLPUSH")
                    .arg(from)
                    .arg(to)
                    .query_async(&mut *conn)
                    .await
                    .map_err(|e| transport("RPOPLPUSH", e))?;
                if item.is_none() {
                    break;
                }
                moved += 1;
            }
            debug!(from, to, moved, "Moved list entries");
            Ok(moved)
        })
    }

    fn drain<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            let mut conn = self.factory.connection().await?;
            let (mut items,): (Vec<String>,) = redis::pipe()
                .atomic()
                .cmd("LRANGE")
                .arg(key)
                .arg(0)
                .arg(-1)
                .cmd("DEL")
                .arg(key)
                .ignore()
                .query_async(&mut *conn)
                .await
                .map_err(|e| transport("LRANGE/DEL", e))?;
            // LRANGE lists head first; callers want oldest first.
            items.reverse();
            Ok(items)
        })
    }

    fn set_flag<'a>(&'a self, key: &'a str, ttl: Duration) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut conn = self.factory.connection().await?;
            redis::cmd("SET")
                .arg(key)
                .arg(1)
                .arg("PX")
                .arg(ttl.as_millis().max(1) as u64)
                .query_async::<()>(&mut *conn)
                .await
                .map_err(|e| transport("SET", e))
        })
    }

    fn has_flag<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let mut conn = self.factory.connection().await?;
            redis::cmd("EXISTS")
                .arg(key)
                .query_async::<bool>(&mut *conn)
                .await
                .map_err(|e| transport("EXISTS", e))
        })
    }
}
