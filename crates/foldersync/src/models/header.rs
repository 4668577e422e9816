use serde::{Deserialize, Serialize};

use super::EmailAddress;
use crate::date::Timestamp;

/// Server-assigned message identifier, stable within a mailbox
pub type Uid = u32;

/// Composite ordering key for messages.
///
/// Storage keeps everything newest first, i.e. descending by this key.
/// The uid breaks ties between messages sharing a date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageKey {
    pub date: Timestamp,
    pub uid: Uid,
}

impl MessageKey {
    pub fn new(date: Timestamp, uid: Uid) -> Self {
        Self { date, uid }
    }
}

/// Summary information for a message, enough to render a message list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderInfo {
    pub id: Uid,
    pub author: EmailAddress,
    /// INTERNALDATE in UTC millis
    pub date: Timestamp,
    pub flags: Vec<String>,
    pub has_attachments: bool,
    pub subject: String,
    pub snippet: Option<String>,
}

impl HeaderInfo {
    pub fn key(&self) -> MessageKey {
        MessageKey::new(self.date, self.id)
    }

    /// Whether `flags` differs from the stored flags, ignoring order
    pub fn flags_differ(&self, flags: &[String]) -> bool {
        let mut mine: Vec<&str> = self.flags.iter().map(String::as_str).collect();
        let mut theirs: Vec<&str> = flags.iter().map(String::as_str).collect();
        mine.sort_unstable();
        theirs.sort_unstable();
        mine != theirs
    }

    pub fn is_seen(&self) -> bool {
        self.flags.iter().any(|f| f == "\\Seen")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(flags: &[&str]) -> HeaderInfo {
        HeaderInfo {
            id: 7,
            author: EmailAddress::new("a@example.com"),
            date: 1_000,
            flags: flags.iter().map(|f| f.to_string()).collect(),
            has_attachments: false,
            subject: "hi".to_string(),
            snippet: None,
        }
    }

    #[test]
    fn test_key_orders_by_date_then_uid() {
        assert!(MessageKey::new(10, 1) > MessageKey::new(9, 500));
        assert!(MessageKey::new(10, 2) > MessageKey::new(10, 1));
    }

    #[test]
    fn test_flags_differ_ignores_order() {
        let h = header(&["\\Seen", "\\Flagged"]);
        assert!(!h.flags_differ(&["\\Flagged".to_string(), "\\Seen".to_string()]));
        assert!(h.flags_differ(&["\\Seen".to_string()]));
        assert!(h.is_seen());
    }
}
