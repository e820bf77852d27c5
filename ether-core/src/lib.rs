pub mod config;
pub mod db;
pub mod error;
pub mod ether;
pub mod ipc;
pub mod models;
pub mod proxy;
pub mod sqlite_ether;

pub use config::EtherConfig;
pub use error::{EtherError, FaultKind, Result};
pub use ether::{until_shutdown, Ether, MessageStream, RecvQuery};
pub use models::{AsyncMessage, Attachment, AttachmentKind, Channel, Posting, SourceRef, Trace};
pub use proxy::ProxyEther;
pub use sqlite_ether::SqliteEther;
