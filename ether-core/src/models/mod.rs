mod attachment;
mod channel;
mod message;
mod posting;
mod trace;

pub use attachment::{Attachment, AttachmentKind};
pub use channel::Channel;
pub use message::{AsyncMessage, SourceRef};
pub use posting::Posting;
pub use trace::Trace;
