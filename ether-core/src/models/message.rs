use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{Attachment, Channel, Trace};
use crate::error::{EtherError, Result};

/// Reference to a persisted message another message causally derives from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub message_id: i64,
    pub trace_id: i64,
}

/// A unit of communication on a channel.
///
/// `id` and `sent_at` are assigned by the store when the message is persisted. A message
/// can only be persisted once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncMessage {
    pub channel: Channel,
    #[serde(rename = "type")]
    pub message_type: String,
    pub sender: String,
    pub contents: Option<String>,
    #[serde(default)]
    pub sources: Vec<SourceRef>,
    pub trace: Option<Trace>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub id: Option<i64>,
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub starts_trace: bool,
}

impl AsyncMessage {
    pub fn new(
        channel: Channel,
        message_type: impl Into<String>,
        sender: impl Into<String>,
        contents: Option<String>,
    ) -> Self {
        Self {
            channel,
            message_type: message_type.into(),
            sender: sender.into(),
            contents,
            sources: Vec::new(),
            trace: None,
            attachments: Vec::new(),
            id: None,
            sent_at: None,
            starts_trace: false,
        }
    }

    /// Send this message as part of an existing trace.
    pub fn in_trace(mut self, trace: Trace) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Record the messages this one derives from. All sources must be persisted and must
    /// share a single trace.
    pub fn derived_from(mut self, sources: &[&AsyncMessage]) -> Result<Self> {
        let mut refs = Vec::with_capacity(sources.len());
        for src in sources {
            let message_id = src
                .id
                .ok_or_else(|| EtherError::precondition("source message has not been sent"))?;
            let trace_id = src
                .trace
                .as_ref()
                .and_then(|t| t.id)
                .ok_or_else(|| EtherError::precondition("source message has no trace"))?;
            refs.push(SourceRef {
                message_id,
                trace_id,
            });
        }

        if let Some(first) = refs.first() {
            if refs.iter().any(|r| r.trace_id != first.trace_id) {
                return Err(EtherError::precondition(
                    "cannot have sources from different traces",
                ));
            }
        }

        self.sources = refs;
        Ok(self)
    }

    pub fn attach(&mut self, attachment: Attachment) {
        self.attachments.push(attachment);
    }

    pub fn contents_or_empty(&self) -> &str {
        self.contents.as_deref().unwrap_or("")
    }

    fn check_unsent(&self) -> Result<()> {
        if let Some(id) = self.id {
            return Err(EtherError::precondition(format!(
                "can't resend message {}",
                id
            )));
        }
        Ok(())
    }

    fn check_supported(&self) -> Result<()> {
        if !self.sources.is_empty() {
            return Err(EtherError::unsupported("message sources"));
        }
        if !self.attachments.is_empty() {
            return Err(EtherError::unsupported("message attachments"));
        }
        Ok(())
    }

    /// Validate a message for `Ether::send`, returning the id of its trace.
    pub fn check_sendable(&self) -> Result<i64> {
        self.check_unsent()?;
        let trace = self.trace.as_ref().ok_or_else(|| {
            EtherError::precondition("message has no trace, use begin_trace to start one")
        })?;
        let trace_id = trace.require_id()?;
        self.check_supported()?;
        Ok(trace_id)
    }

    /// Validate a message for `Ether::begin_trace`.
    pub fn check_can_begin_trace(&self) -> Result<()> {
        self.check_unsent()?;
        if self.trace.is_some() {
            return Err(EtherError::precondition("message already belongs to a trace"));
        }
        self.check_supported()
    }
}

impl fmt::Display for AsyncMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let trace = self
            .trace
            .as_ref()
            .and_then(|t| t.id)
            .map_or_else(|| "-".to_string(), |id| id.to_string());
        let id = self.id.map_or_else(|| "-".to_string(), |id| id.to_string());
        write!(
            f,
            "AsyncMessage({}, {}, {}, {}, {}, {})",
            self.channel,
            trace,
            id,
            self.sender,
            self.message_type,
            self.contents_or_empty().len()
        )
    }
}
