//! Domain models for the folder mirror

mod accuracy;
mod address;
mod block;
mod body;
mod folder;
mod header;

pub use accuracy::{AccuracyRange, FullSyncInfo};
pub use address::EmailAddress;
pub use block::{BlockId, BlockKind, BodyBlock, FolderBlockInfo, HeaderBlock};
pub use body::{AttachmentInfo, BodyInfo, BodyRep, BodyRepKind};
pub use folder::{FolderMeta, FolderRecord};
pub use header::{HeaderInfo, MessageKey, Uid};
