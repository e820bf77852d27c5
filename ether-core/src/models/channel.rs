use serde::{Deserialize, Serialize};
use std::fmt;

/// A named partition of the message stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Channel {
    name: String,
}

impl Channel {
    pub const PROD: &'static str = "prod";
    pub const DEBUG: &'static str = "debug";

    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn prod() -> Self {
        Self::new(Self::PROD)
    }

    pub fn debug() -> Self {
        Self::new(Self::DEBUG)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Channel({})", self.name)
    }
}

impl From<&str> for Channel {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}
