use serde::{Deserialize, Serialize};

/// An ad-hoc named value published on the bus. Publishing a name again replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Posting {
    pub name: String,
    #[sqlx(rename = "type")]
    pub kind: String,
    pub contents: Vec<u8>,
}

impl Posting {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            contents: contents.into(),
        }
    }
}
