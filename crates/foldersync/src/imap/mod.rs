//! Server-facing side of the sync engine

pub mod broker;
pub mod decoder;
pub mod memory;
mod transport;

pub use broker::{ConnectionPool, ConnectionSession, DeathHandle};
pub use decoder::{BodyDecoder, DecodeError, DecoderFactory, DefaultDecoderFactory, TransferDecoder};
pub use transport::{
    BodyPart, BodyStructure, Envelope, FetchedMessage, FlagsUpdate, ImapTransport, MailboxInfo,
    SearchCriteria, TransportError,
};
