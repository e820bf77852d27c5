//! The bus contract shared by every backend.
//!
//! `SqliteEther` talks to the store directly; `ProxyEther` forwards each operation to an
//! `ether-proxy` process. Agents hold an `Arc<dyn Ether>` and do not care which one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;
use crate::models::{AsyncMessage, Channel, Posting, Trace};

/// Ordered, lazily polled sequence of messages returned by `Ether::recv`.
pub type MessageStream = BoxStream<'static, Result<AsyncMessage>>;

#[async_trait]
pub trait Ether: Send + Sync {
    /// Persist `msg` under its trace. Assigns `msg.id` and `msg.sent_at`.
    async fn send(&self, msg: &mut AsyncMessage) -> Result<i64>;

    /// Atomically create a trace and send `msg` as its first message.
    async fn begin_trace(
        &self,
        name: &str,
        msg: &mut AsyncMessage,
        duration: std::time::Duration,
    ) -> Result<Trace>;

    /// Mark `trace` inactive. Ending a trace twice is an error.
    async fn end_trace(&self, trace: &mut Trace) -> Result<()>;

    fn recv(&self, query: RecvQuery) -> MessageStream;

    async fn register(&self, agent: &str) -> Result<()> {
        tracing::debug!("Agent registered: {}", agent);
        Ok(())
    }

    async fn unregister(&self, agent: &str) -> Result<()> {
        tracing::debug!("Agent unregistered: {}", agent);
        Ok(())
    }

    async fn post(&self, posting: &Posting) -> Result<()>;
}

/// Filter and cursor for `Ether::recv`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecvQuery {
    pub channel: Channel,
    /// Pin a single trace. Unpinned queries only see messages of active traces.
    pub trace_id: Option<i64>,
    pub message_types: Option<Vec<String>>,
    pub senders: Option<Vec<String>>,
    pub blocking: bool,
    /// Initial watermark; `None` means "now", so only future messages are seen.
    pub start: Option<DateTime<Utc>>,
}

impl RecvQuery {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            trace_id: None,
            message_types: None,
            senders: None,
            blocking: true,
            start: None,
        }
    }

    pub fn for_trace(mut self, trace_id: i64) -> Self {
        self.trace_id = Some(trace_id);
        self
    }

    pub fn of_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.message_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    pub fn from_senders<I, S>(mut self, senders: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.senders = Some(senders.into_iter().map(Into::into).collect());
        self
    }

    pub fn non_blocking(mut self) -> Self {
        self.blocking = false;
        self
    }

    pub fn since(mut self, start: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self
    }

    pub fn start_or_now(&self) -> DateTime<Utc> {
        self.start.unwrap_or_else(Utc::now)
    }
}

/// End `stream` cleanly once `shutdown` fires (or its sender goes away).
///
/// Items are whole messages, so stopping between them never yields a partial batch.
pub fn until_shutdown(stream: MessageStream, mut shutdown: broadcast::Receiver<()>) -> MessageStream {
    stream
        .take_until(async move {
            let _ = shutdown.recv().await;
            tracing::info!("Shutdown signal received, stopping recv loop");
        })
        .boxed()
}
