use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{EtherError, Result};

/// A causal session grouping related messages.
///
/// Traces are created by `Ether::begin_trace` together with their first message and go
/// from active to inactive exactly once through `Ether::end_trace`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    pub id: Option<i64>,
    pub name: String,
    pub start: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
    pub active: bool,
}

impl Trace {
    /// An active trace expiring `duration` after `start`. Fails when that expiry is not
    /// representable.
    pub fn new(
        id: Option<i64>,
        name: impl Into<String>,
        start: DateTime<Utc>,
        duration: Duration,
    ) -> Result<Self> {
        let name = name.into();
        let expiry = start.checked_add_signed(duration).ok_or_else(|| {
            EtherError::precondition(format!("trace '{}' expiry overflows", name))
        })?;
        Ok(Self {
            id,
            name,
            start,
            expiry,
            active: true,
        })
    }

    pub fn duration(&self) -> Duration {
        self.expiry - self.start
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry
    }

    /// The store-assigned id, or a precondition error for an unpersisted trace.
    pub fn require_id(&self) -> Result<i64> {
        self.id
            .ok_or_else(|| EtherError::precondition(format!("trace '{}' has no id", self.name)))
    }

    pub fn check_can_end(&self) -> Result<i64> {
        let id = self.require_id()?;
        if !self.active {
            return Err(EtherError::precondition(format!(
                "trace {} is already ended",
                id
            )));
        }
        Ok(id)
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "Trace({}, {}, {}, active={})", id, self.name, self.start, self.active),
            None => write!(f, "Trace(-, {}, {}, active={})", self.name, self.start, self.active),
        }
    }
}
