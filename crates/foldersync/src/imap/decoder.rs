//! Body part decoding
//!
//! Each fetched part gets its own [`BodyDecoder`] from a [`DecoderFactory`],
//! so no decoding state is shared between parts or messages.

use thiserror::Error;

use super::transport::BodyPart;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unsupported transfer encoding: {0}")]
    UnsupportedEncoding(String),
    #[error("could not decode part: {0}")]
    Parse(#[from] mailparse::MailParseError),
}

/// Turns the raw bytes of one part into text
pub trait BodyDecoder: Send {
    fn decode(&mut self, raw: &[u8]) -> Result<String, DecodeError>;
}

pub trait DecoderFactory: Send + Sync {
    /// A fresh decoder for `part`
    fn decoder_for(&self, part: &BodyPart) -> Box<dyn BodyDecoder>;
}

const TRANSFER_ENCODINGS: &[&str] = &["7bit", "8bit", "binary", "base64", "quoted-printable"];

/// Content-Transfer-Encoding plus charset decoding
///
/// The part is rewrapped as a single MIME entity and handed to `mailparse`,
/// which undoes the transfer encoding and converts from the declared charset.
/// Labels it does not recognize fall back to latin-1.
#[derive(Debug, Clone)]
pub struct TransferDecoder {
    encoding: String,
    charset: String,
}

impl TransferDecoder {
    pub fn new(encoding: &str, charset: Option<&str>) -> Self {
        Self {
            encoding: encoding.trim().to_ascii_lowercase(),
            charset: charset.unwrap_or("utf-8").trim().to_ascii_lowercase(),
        }
    }

    fn entity(&self, raw: &[u8]) -> Vec<u8> {
        // Labels are tokens; anything else would break the header line
        let charset: String = self
            .charset
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
            .collect();
        let mut entity = format!("Content-Type: text/plain; charset=\"{charset}\"\r\n");
        if !self.encoding.is_empty() {
            entity.push_str(&format!("Content-Transfer-Encoding: {}\r\n", self.encoding));
        }
        entity.push_str("\r\n");

        let mut bytes = entity.into_bytes();
        bytes.extend_from_slice(raw);
        bytes
    }
}

impl BodyDecoder for TransferDecoder {
    fn decode(&mut self, raw: &[u8]) -> Result<String, DecodeError> {
        if !self.encoding.is_empty() && !TRANSFER_ENCODINGS.contains(&self.encoding.as_str()) {
            return Err(DecodeError::UnsupportedEncoding(self.encoding.clone()));
        }
        let entity = self.entity(raw);
        let parsed = mailparse::parse_mail(&entity)?;
        Ok(parsed.get_body()?)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDecoderFactory;

impl DecoderFactory for DefaultDecoderFactory {
    fn decoder_for(&self, part: &BodyPart) -> Box<dyn BodyDecoder> {
        Box::new(TransferDecoder::new(&part.encoding, part.charset.as_deref()))
    }
}

/// Short preview of a body: quoted lines dropped, whitespace collapsed.
pub fn make_snippet(text: &str, is_html: bool, max_chars: usize) -> String {
    let plain = if is_html { strip_html(text) } else { text.to_string() };

    let mut out = String::new();
    for line in plain.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('>') {
            continue;
        }
        for word in line.split_whitespace() {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(word);
        }
        if out.chars().count() >= max_chars {
            break;
        }
    }

    match out.char_indices().nth(max_chars) {
        Some((idx, _)) => out[..idx].to_string(),
        None => out,
    }
}

const BLOCK_TAGS: &[&str] = &[
    "br",
    "p",
    "div",
    "li",
    "tr",
    "blockquote",
    "h1",
    "h2",
    "h3",
    "h4",
    "h5",
    "h6",
];

fn strip_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut tag = String::new();
    let mut in_tag = false;

    for c in html.chars() {
        match (in_tag, c) {
            (false, '<') => {
                in_tag = true;
                tag.clear();
            }
            (true, '>') => {
                in_tag = false;
                let name: String = tag
                    .trim_start_matches('/')
                    .chars()
                    .take_while(|c| c.is_ascii_alphanumeric())
                    .collect::<String>()
                    .to_ascii_lowercase();
                if BLOCK_TAGS.contains(&name.as_str()) {
                    out.push('\n');
                }
            }
            (true, c) => tag.push(c),
            (false, c) => out.push(c),
        }
    }

    out.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}
