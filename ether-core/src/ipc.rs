//! Proxy wire protocol.
//!
//! Frames are a 4-byte little-endian length prefix followed by a MessagePack body. Every
//! request gets exactly one reply.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

use crate::error::{EtherError, FaultKind, Result};
use crate::ether::RecvQuery;
use crate::models::{AsyncMessage, Trace};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum EtherRequest {
    Send {
        message: AsyncMessage,
    },
    /// One non-blocking poll starting at the client's watermark.
    Recv {
        query: RecvQuery,
        start: DateTime<Utc>,
    },
    BeginTrace {
        name: String,
        message: AsyncMessage,
        duration: std::time::Duration,
    },
    EndTrace {
        trace: Trace,
    },
}

impl EtherRequest {
    pub fn command(&self) -> &'static str {
        match self {
            Self::Send { .. } => "send",
            Self::Recv { .. } => "recv",
            Self::BeginTrace { .. } => "begin_trace",
            Self::EndTrace { .. } => "end_trace",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnValue {
    Sent {
        message_id: i64,
        sent_at: DateTime<Utc>,
    },
    TraceBegun {
        trace: Trace,
        message_id: i64,
        sent_at: DateTime<Utc>,
    },
    Nil,
    Messages(Vec<AsyncMessage>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum EtherReply {
    Ret { payload: ReturnValue },
    Fault { kind: FaultKind, message: String },
}

impl EtherReply {
    pub fn ret(payload: ReturnValue) -> Self {
        Self::Ret { payload }
    }

    pub fn fault(err: &EtherError) -> Self {
        Self::Fault {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// Unwrap a `ret` reply, turning a fault back into the matching error.
    pub fn into_result(self) -> Result<ReturnValue> {
        match self {
            Self::Ret { payload } => Ok(payload),
            Self::Fault { kind, message } => Err(EtherError::from_fault(kind, message)),
        }
    }
}

pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder().little_endian().new_codec()
}

pub fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(rmp_serde::to_vec_named(value)?))
}

pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(frame)?)
}
