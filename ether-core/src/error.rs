use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EtherError {
    #[error("Precondition violated: {0}")]
    PreconditionViolation(String),

    #[error("Not supported: {0}")]
    UnsupportedFeature(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid row: {0}")]
    InvalidRow(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EtherError>;

/// Coarse error class carried over the proxy wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Precondition,
    Unsupported,
    Transport,
    Storage,
}

impl EtherError {
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::PreconditionViolation(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedFeature(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn kind(&self) -> FaultKind {
        match self {
            Self::PreconditionViolation(_) => FaultKind::Precondition,
            Self::UnsupportedFeature(_) => FaultKind::Unsupported,
            Self::Transport(_) | Self::Io(_) => FaultKind::Transport,
            Self::Database(_) | Self::InvalidRow(_) | Self::Config(_) => FaultKind::Storage,
        }
    }

    /// Contract errors are the caller's fault and are never retried.
    pub fn is_contract(&self) -> bool {
        matches!(
            self.kind(),
            FaultKind::Precondition | FaultKind::Unsupported
        )
    }

    /// Rebuild an error from a fault reported by a remote proxy.
    pub fn from_fault(kind: FaultKind, message: String) -> Self {
        match kind {
            FaultKind::Precondition => Self::PreconditionViolation(message),
            FaultKind::Unsupported => Self::UnsupportedFeature(message),
            FaultKind::Transport => Self::Transport(message),
            FaultKind::Storage => Self::Database(sqlx::Error::Protocol(message)),
        }
    }
}

impl From<rmp_serde::encode::Error> for EtherError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Self::Transport(format!("encode failed: {}", e))
    }
}

impl From<rmp_serde::decode::Error> for EtherError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Self::Transport(format!("decode failed: {}", e))
    }
}
