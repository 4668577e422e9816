use serde::{Deserialize, Serialize};

use super::EmailAddress;
use crate::date::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyRepKind {
    Plain,
    Html,
}

/// One displayable representation of a message body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyRep {
    pub kind: BodyRepKind,
    /// IMAP part specifier, e.g. "1.2"
    pub part_id: String,
    pub size_estimate: usize,
    pub content: Option<String>,
    pub is_downloaded: bool,
}

/// Attachment metadata; payloads are never fetched during sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentInfo {
    pub name: Option<String>,
    pub content_type: String,
    pub part_id: String,
    pub encoding: String,
    pub size_estimate: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyInfo {
    pub date: Timestamp,
    /// Estimated storage footprint, used for block sizing
    pub size: usize,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub bcc: Vec<EmailAddress>,
    pub reply_to: Option<EmailAddress>,
    pub attachments: Vec<AttachmentInfo>,
    pub body_reps: Vec<BodyRep>,
}

impl BodyInfo {
    /// Text of the first downloaded plain representation, falling back to html.
    pub fn body_text(&self) -> Option<&str> {
        let downloaded = |kind: BodyRepKind| {
            self.body_reps
                .iter()
                .filter(|rep| rep.kind == kind && rep.is_downloaded)
                .find_map(|rep| rep.content.as_deref())
        };
        downloaded(BodyRepKind::Plain).or_else(|| downloaded(BodyRepKind::Html))
    }

    /// True when some representation is still missing its content
    pub fn is_partially_downloaded(&self) -> bool {
        self.body_reps.iter().any(|rep| !rep.is_downloaded)
    }

    /// Recompute `size` from the representations currently held
    pub fn refresh_size(&mut self) {
        self.size = self
            .body_reps
            .iter()
            .map(|rep| rep.content.as_ref().map_or(rep.size_estimate, String::len))
            .sum::<usize>()
            + self.attachments.len() * 64;
    }
}
