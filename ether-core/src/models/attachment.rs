use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    /// Opaque binary content.
    Blob,
    /// A packaged archive of files.
    Archive,
}

/// Binary side-payload bound to a message.
///
/// The persisted backend does not store attachments yet; sending a message that carries
/// one fails with `UnsupportedFeature`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub content_type: String,
    pub contents: Vec<u8>,
}

impl Attachment {
    pub fn blob(content_type: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: AttachmentKind::Blob,
            content_type: content_type.into(),
            contents: contents.into(),
        }
    }

    pub fn archive(contents: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: AttachmentKind::Archive,
            content_type: "application/x-tar".to_string(),
            contents: contents.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.contents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }
}
