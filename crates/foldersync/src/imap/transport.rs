//! The IMAP operations the sync engine consumes
//!
//! Framing, literals and parsing live behind [`ImapTransport`]; the engine
//! only sees UIDs, envelopes, body structures and raw part bytes.

use thiserror::Error;

use crate::date::{Timestamp, imap_date};
use crate::models::{EmailAddress, Uid};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("could not connect: {0}")]
    ConnectFailed(String),
    #[error("mailbox {mailbox} could not be opened: {reason}")]
    OpenFailed { mailbox: String, reason: String },
    #[error("no mailbox selected")]
    NotSelected,
    #[error("server rejected command: {0}")]
    Command(String),
}

impl TransportError {
    /// Whether the connection is unusable after this error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionLost(_) | TransportError::ConnectFailed(_)
        )
    }
}

/// Status returned when a mailbox is selected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxInfo {
    /// Message count (EXISTS)
    pub exists: u32,
    pub uid_validity: u32,
    pub highest_modseq: Option<String>,
}

/// `UID SEARCH NOT DELETED [SINCE d] [BEFORE d]`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchCriteria {
    pub since: Option<Timestamp>,
    pub before: Option<Timestamp>,
}

impl SearchCriteria {
    pub fn new(since: Option<Timestamp>, before: Option<Timestamp>) -> Self {
        Self { since, before }
    }

    pub fn to_imap_string(&self) -> String {
        let mut out = String::from("NOT DELETED");
        if let Some(since) = self.since {
            out.push_str(" SINCE ");
            out.push_str(&imap_date(since));
        }
        if let Some(before) = self.before {
            out.push_str(" BEFORE ");
            out.push_str(&imap_date(before));
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub from: Option<EmailAddress>,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub bcc: Vec<EmailAddress>,
    pub reply_to: Option<EmailAddress>,
    pub subject: String,
    pub message_id: Option<String>,
}

/// A leaf MIME part as reported by BODYSTRUCTURE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyPart {
    pub part_id: String,
    /// e.g. "text"
    pub media_type: String,
    /// e.g. "plain"
    pub subtype: String,
    pub charset: Option<String>,
    /// Content-Transfer-Encoding, lowercase
    pub encoding: String,
    pub size: usize,
    pub disposition: Option<String>,
    pub filename: Option<String>,
}

impl BodyPart {
    pub fn content_type(&self) -> String {
        format!("{}/{}", self.media_type, self.subtype)
    }

    pub fn is_attachment(&self) -> bool {
        self.disposition.as_deref() == Some("attachment") || self.filename.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyStructure {
    Part(BodyPart),
    Multipart {
        subtype: String,
        parts: Vec<BodyStructure>,
    },
}

impl BodyStructure {
    /// Leaf parts in document order
    pub fn leaves(&self) -> Vec<&BodyPart> {
        match self {
            BodyStructure::Part(part) => vec![part],
            BodyStructure::Multipart { parts, .. } => {
                parts.iter().flat_map(BodyStructure::leaves).collect()
            }
        }
    }
}

/// Result of the header + bodystructure fetch for a new UID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMessage {
    pub uid: Uid,
    pub flags: Vec<String>,
    pub internal_date: Timestamp,
    pub envelope: Envelope,
    pub structure: BodyStructure,
}

/// Result of the flags-only fetch for a known UID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagsUpdate {
    pub uid: Uid,
    pub flags: Vec<String>,
}

/// One IMAP connection. Calls block until the server answers.
pub trait ImapTransport: Send {
    fn open_box(&mut self, path: &str) -> Result<MailboxInfo, TransportError>;

    fn search(&mut self, criteria: &SearchCriteria) -> Result<Vec<Uid>, TransportError>;

    /// `UID FETCH` header fields, BODYSTRUCTURE, FLAGS and INTERNALDATE
    fn fetch_headers(&mut self, uids: &[Uid]) -> Result<Vec<FetchedMessage>, TransportError>;

    /// `UID FETCH` FLAGS
    fn fetch_flags(&mut self, uids: &[Uid]) -> Result<Vec<FlagsUpdate>, TransportError>;

    /// `UID FETCH BODY.PEEK[part]`, raw transfer-encoded bytes
    fn fetch_part(&mut self, uid: Uid, part_id: &str) -> Result<Vec<u8>, TransportError>;

    fn is_alive(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(id: &str, media: &str, sub: &str) -> BodyPart {
        BodyPart {
            part_id: id.to_string(),
            media_type: media.to_string(),
            subtype: sub.to_string(),
            charset: None,
            encoding: "7bit".to_string(),
            size: 10,
            disposition: None,
            filename: None,
        }
    }

    #[test]
    fn test_search_criteria_rendering() {
        let jan5 = 1_704_412_800_000;
        let jan9 = jan5 + 4 * crate::date::DAY_MILLIS;
        assert_eq!(SearchCriteria::default().to_imap_string(), "NOT DELETED");
        assert_eq!(
            SearchCriteria::new(Some(jan5), Some(jan9)).to_imap_string(),
            "NOT DELETED SINCE 5-Jan-2024 BEFORE 9-Jan-2024"
        );
        assert_eq!(
            SearchCriteria::new(None, Some(jan9)).to_imap_string(),
            "NOT DELETED BEFORE 9-Jan-2024"
        );
    }

    #[test]
    fn test_leaves_flatten_in_order() {
        let structure = BodyStructure::Multipart {
            subtype: "mixed".to_string(),
            parts: vec![
                BodyStructure::Multipart {
                    subtype: "alternative".to_string(),
                    parts: vec![
                        BodyStructure::Part(part("1.1", "text", "plain")),
                        BodyStructure::Part(part("1.2", "text", "html")),
                    ],
                },
                BodyStructure::Part(part("2", "application", "pdf")),
            ],
        };
        let ids: Vec<&str> = structure.leaves().iter().map(|p| p.part_id.as_str()).collect();
        assert_eq!(ids, vec!["1.1", "1.2", "2"]);
    }

    #[test]
    fn test_fatal_errors() {
        assert!(TransportError::ConnectionLost("reset".into()).is_fatal());
        assert!(!TransportError::Command("BAD".into()).is_fatal());
    }
}
