//! Redis Streams implementation of the `MessageBus` trait.

use async_trait::async_trait;
use redis::Client;
use redis::aio::MultiplexedConnection;
use tracing::debug;

use relaykit_core::bus::MessageBus;
use relaykit_core::error::DomainError;
use relaykit_core::event::EventEnvelope;

use crate::error::bus_error;

/// Appends events to a Redis stream with `XADD`.
///
/// Each entry carries `event_id`, `type`, `tenant_id` and the JSON envelope
/// as `payload`. A batch is sent as one `MULTI`/`EXEC` pipeline, so it lands
/// in the stream entirely or not at all.
#[derive(Clone)]
pub struct RedisStreamBus {
    conn: MultiplexedConnection,
    stream: String,
    max_len: Option<usize>,
}

impl std::fmt::Debug for RedisStreamBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamBus")
            .field("stream", &self.stream)
            .field("max_len", &self.max_len)
            .finish_non_exhaustive()
    }
}

impl RedisStreamBus {
    /// Connects to `redis_url` and publishes to `stream`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Publish` if the URL is invalid or the server is
    /// unreachable.
    pub async fn connect(redis_url: &str, stream: impl Into<String>) -> Result<Self, DomainError> {
        let client = Client::open(redis_url).map_err(|e| bus_error("open redis client", &e))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| bus_error("connect to redis", &e))?;
        Ok(Self {
            conn,
            stream: stream.into(),
            max_len: None,
        })
    }

    /// Caps the stream at roughly `max_len` entries (`MAXLEN ~`).
    #[must_use]
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    /// Stream key events are appended to.
    #[must_use]
    pub fn stream(&self) -> &str {
        &self.stream
    }
}

#[async_trait]
impl MessageBus for RedisStreamBus {
    async fn publish(&self, events: &[EventEnvelope]) -> Result<(), DomainError> {
        if events.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for event in events {
            let payload = serde_json::to_string(event)?;
            let cmd = pipe.cmd("XADD").arg(&self.stream);
            if let Some(max_len) = self.max_len {
                cmd.arg("MAXLEN").arg("~").arg(max_len);
            }
            cmd.arg("*")
                .arg("event_id")
                .arg(event.event_id().to_string())
                .arg("type")
                .arg(&event.event_type)
                .arg("tenant_id")
                .arg(&event.metadata.tenant_id)
                .arg("payload")
                .arg(payload);
        }

        let mut conn = self.conn.clone();
        let entry_ids: Vec<String> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| bus_error("xadd", &e))?;
        debug!(stream = %self.stream, entries = entry_ids.len(), "events appended to stream");
        Ok(())
    }
}
