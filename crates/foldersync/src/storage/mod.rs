//! Storage for the folder mirror
//!
//! [`FolderBlockStore`] owns the in-memory directory and block cache;
//! a [`BlockSource`] persists the serialized records behind it.

pub mod accuracy;
pub mod blocks;
mod file;
mod folder_store;
mod memory;
mod source;

pub use file::FileBlockSource;
pub use folder_store::{FolderBlockStore, MessagesInRange, Mutation};
pub use memory::InMemoryBlockSource;
pub use source::{BlockSource, RecordKey, RecordKind};
