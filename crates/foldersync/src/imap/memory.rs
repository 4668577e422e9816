//! In-memory IMAP server
//!
//! A scripted mailbox host for offline runs and tests. SEARCH works in
//! server-local days: `SINCE d` matches messages whose local date is `d` or
//! later, `BEFORE d` those whose local date is earlier than `d`. Local time is
//! UTC plus the server's offset, zero unless set.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use super::broker::ConnectionPool;
use super::transport::{
    BodyPart, BodyStructure, Envelope, FetchedMessage, FlagsUpdate, ImapTransport, MailboxInfo,
    SearchCriteria, TransportError,
};
use crate::date::{Timestamp, quantize};
use crate::models::{EmailAddress, Uid};

/// A message as the server stores it
#[derive(Debug, Clone)]
pub struct ServerMessage {
    pub date: Timestamp,
    pub flags: Vec<String>,
    pub envelope: Envelope,
    /// Leaf parts with their raw, transfer-encoded payloads
    leaves: Vec<(BodyPart, Vec<u8>)>,
}

impl ServerMessage {
    /// Single-part text/plain message
    pub fn text(date: Timestamp, from: &str, subject: &str, body: &str) -> Self {
        let part = BodyPart {
            part_id: String::new(),
            media_type: "text".to_string(),
            subtype: "plain".to_string(),
            charset: Some("utf-8".to_string()),
            encoding: "8bit".to_string(),
            size: body.len(),
            disposition: None,
            filename: None,
        };
        Self {
            date,
            flags: Vec::new(),
            envelope: Envelope {
                from: Some(EmailAddress::parse(from)),
                to: vec![EmailAddress::new("me@example.com")],
                subject: subject.to_string(),
                ..Envelope::default()
            },
            leaves: vec![(part, body.as_bytes().to_vec())],
        }
    }

    pub fn with_flags(mut self, flags: &[&str]) -> Self {
        self.flags = flags.iter().map(|f| f.to_string()).collect();
        self
    }

    /// Add a text/html part
    pub fn with_html(self, html: &str) -> Self {
        let part = BodyPart {
            part_id: String::new(),
            media_type: "text".to_string(),
            subtype: "html".to_string(),
            charset: Some("utf-8".to_string()),
            encoding: "7bit".to_string(),
            size: html.len(),
            disposition: None,
            filename: None,
        };
        self.with_part(part, html.as_bytes().to_vec())
    }

    /// Add a base64 attachment
    pub fn with_attachment(self, filename: &str, content_type: &str, payload: &[u8]) -> Self {
        let (media, sub) = content_type.split_once('/').unwrap_or(("application", "octet-stream"));
        let encoded = STANDARD.encode(payload).into_bytes();
        let part = BodyPart {
            part_id: String::new(),
            media_type: media.to_string(),
            subtype: sub.to_string(),
            charset: None,
            encoding: "base64".to_string(),
            size: encoded.len(),
            disposition: Some("attachment".to_string()),
            filename: Some(filename.to_string()),
        };
        self.with_part(part, encoded)
    }

    /// Add an arbitrary leaf with its raw payload
    pub fn with_part(mut self, mut part: BodyPart, raw: Vec<u8>) -> Self {
        part.size = raw.len();
        self.leaves.push((part, raw));
        self
    }

    /// Replace the first leaf's payload, keeping its declared encoding
    pub fn with_raw_body(mut self, encoding: &str, raw: &[u8]) -> Self {
        if let Some((part, payload)) = self.leaves.first_mut() {
            part.encoding = encoding.to_string();
            part.size = raw.len();
            *payload = raw.to_vec();
        }
        self
    }

    /// Declare a different charset on the first leaf
    pub fn with_charset(mut self, charset: &str) -> Self {
        if let Some((part, _)) = self.leaves.first_mut() {
            part.charset = Some(charset.to_string());
        }
        self
    }

    fn numbered_leaves(&self) -> Vec<(BodyPart, &[u8])> {
        self.leaves
            .iter()
            .enumerate()
            .map(|(i, (part, raw))| {
                let mut part = part.clone();
                part.part_id = (i + 1).to_string();
                (part, raw.as_slice())
            })
            .collect()
    }

    fn structure(&self) -> BodyStructure {
        let mut parts: Vec<BodyStructure> = self
            .numbered_leaves()
            .into_iter()
            .map(|(part, _)| BodyStructure::Part(part))
            .collect();
        if parts.len() == 1 {
            return parts.remove(0);
        }
        BodyStructure::Multipart {
            subtype: "mixed".to_string(),
            parts,
        }
    }
}

/// Request counters, for asserting round-trips in tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxStats {
    pub searches: usize,
    pub header_fetches: usize,
    pub flag_fetches: usize,
    pub part_fetches: usize,
}

#[derive(Default)]
struct Failures {
    drop_on_search: bool,
    reject_search: bool,
    reject_fetch: bool,
    drop_on_part: bool,
    failing_parts: HashSet<(Uid, String)>,
}

struct MailboxState {
    messages: BTreeMap<Uid, ServerMessage>,
    next_uid: Uid,
    uid_validity: u32,
    modseq: u64,
    failures: Failures,
    stats: MailboxStats,
}

/// One server-side folder
pub struct InMemoryMailbox {
    state: Mutex<MailboxState>,
}

impl Default for InMemoryMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMailbox {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MailboxState {
                messages: BTreeMap::new(),
                next_uid: 1,
                uid_validity: 1,
                modseq: 1,
                failures: Failures::default(),
                stats: MailboxStats::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MailboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a message and return its UID
    pub fn add(&self, message: ServerMessage) -> Uid {
        let mut state = self.lock();
        let uid = state.next_uid;
        state.next_uid += 1;
        state.modseq += 1;
        state.messages.insert(uid, message);
        uid
    }

    pub fn remove(&self, uid: Uid) -> bool {
        let mut state = self.lock();
        state.modseq += 1;
        state.messages.remove(&uid).is_some()
    }

    pub fn set_flags(&self, uid: Uid, flags: &[&str]) {
        let mut state = self.lock();
        state.modseq += 1;
        if let Some(message) = state.messages.get_mut(&uid) {
            message.flags = flags.iter().map(|f| f.to_string()).collect();
        }
    }

    pub fn uids(&self) -> Vec<Uid> {
        self.lock().messages.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> MailboxStats {
        self.lock().stats
    }

    /// The next SEARCH drops the connection
    pub fn drop_connection_on_search(&self) {
        self.lock().failures.drop_on_search = true;
    }

    /// The next SEARCH answers NO but leaves the connection up
    pub fn reject_next_search(&self) {
        self.lock().failures.reject_search = true;
    }

    /// The next header or flags fetch answers NO but leaves the connection up
    pub fn reject_next_fetch(&self) {
        self.lock().failures.reject_fetch = true;
    }

    /// The next part fetch drops the connection
    pub fn drop_connection_on_part(&self) {
        self.lock().failures.drop_on_part = true;
    }

    /// Part fetches for `(uid, part_id)` answer NO until cleared
    pub fn fail_part(&self, uid: Uid, part_id: &str) {
        self.lock().failures.failing_parts.insert((uid, part_id.to_string()));
    }

    pub fn clear_failures(&self) {
        self.lock().failures = Failures::default();
    }

    fn info(&self) -> MailboxInfo {
        let state = self.lock();
        MailboxInfo {
            exists: state.messages.len() as u32,
            uid_validity: state.uid_validity,
            highest_modseq: Some(state.modseq.to_string()),
        }
    }
}

/// Hosts mailboxes by path
#[derive(Default)]
pub struct InMemoryServer {
    mailboxes: Mutex<HashMap<String, Arc<InMemoryMailbox>>>,
    tz_offset_ms: AtomicI64,
}

impl InMemoryServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Run the server's clock at UTC plus `offset_ms`
    pub fn set_tz_offset(&self, offset_ms: i64) {
        self.tz_offset_ms.store(offset_ms, Ordering::SeqCst);
    }

    /// Create (or fetch) the mailbox at `path`
    pub fn mailbox(&self, path: &str) -> Arc<InMemoryMailbox> {
        self.mailboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(path.to_string())
            .or_default()
            .clone()
    }

    fn find(&self, path: &str) -> Option<Arc<InMemoryMailbox>> {
        self.mailboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }
}

/// A connection to an [`InMemoryServer`]
pub struct InMemoryTransport {
    server: Arc<InMemoryServer>,
    selected: Option<Arc<InMemoryMailbox>>,
    alive: bool,
}

impl InMemoryTransport {
    pub fn new(server: Arc<InMemoryServer>) -> Self {
        Self {
            server,
            selected: None,
            alive: true,
        }
    }

    fn selected(&self) -> Result<&Arc<InMemoryMailbox>, TransportError> {
        if !self.alive {
            return Err(TransportError::ConnectionLost("connection closed".to_string()));
        }
        self.selected.as_ref().ok_or(TransportError::NotSelected)
    }

    fn drop_connection(&mut self) -> TransportError {
        self.alive = false;
        TransportError::ConnectionLost("connection reset by peer".to_string())
    }
}

impl ImapTransport for InMemoryTransport {
    fn open_box(&mut self, path: &str) -> Result<MailboxInfo, TransportError> {
        if !self.alive {
            return Err(TransportError::ConnectionLost("connection closed".to_string()));
        }
        let mailbox = self.server.find(path).ok_or_else(|| TransportError::OpenFailed {
            mailbox: path.to_string(),
            reason: "no such mailbox".to_string(),
        })?;
        let info = mailbox.info();
        self.selected = Some(mailbox);
        Ok(info)
    }

    fn search(&mut self, criteria: &SearchCriteria) -> Result<Vec<Uid>, TransportError> {
        let mailbox = self.selected()?.clone();
        let mut state = mailbox.lock();
        state.stats.searches += 1;
        if std::mem::take(&mut state.failures.drop_on_search) {
            drop(state);
            return Err(self.drop_connection());
        }
        if std::mem::take(&mut state.failures.reject_search) {
            return Err(TransportError::Command("NO search failed".to_string()));
        }

        let offset = self.server.tz_offset_ms.load(Ordering::SeqCst);
        let since = criteria.since.map(quantize);
        let before = criteria.before.map(quantize);
        Ok(state
            .messages
            .iter()
            .filter(|(_, m)| !m.flags.iter().any(|f| f == "\\Deleted"))
            .filter(|(_, m)| since.is_none_or(|s| m.date + offset >= s))
            .filter(|(_, m)| before.is_none_or(|b| m.date + offset < b))
            .map(|(uid, _)| *uid)
            .collect())
    }

    fn fetch_headers(&mut self, uids: &[Uid]) -> Result<Vec<FetchedMessage>, TransportError> {
        let mailbox = self.selected()?.clone();
        let mut state = mailbox.lock();
        state.stats.header_fetches += 1;
        if std::mem::take(&mut state.failures.reject_fetch) {
            return Err(TransportError::Command("NO header fetch failed".to_string()));
        }
        Ok(uids
            .iter()
            .filter_map(|uid| {
                state.messages.get(uid).map(|m| FetchedMessage {
                    uid: *uid,
                    flags: m.flags.clone(),
                    internal_date: m.date,
                    envelope: m.envelope.clone(),
                    structure: m.structure(),
                })
            })
            .collect())
    }

    fn fetch_flags(&mut self, uids: &[Uid]) -> Result<Vec<FlagsUpdate>, TransportError> {
        let mailbox = self.selected()?.clone();
        let mut state = mailbox.lock();
        state.stats.flag_fetches += 1;
        if std::mem::take(&mut state.failures.reject_fetch) {
            return Err(TransportError::Command("NO flags fetch failed".to_string()));
        }
        Ok(uids
            .iter()
            .filter_map(|uid| {
                state.messages.get(uid).map(|m| FlagsUpdate {
                    uid: *uid,
                    flags: m.flags.clone(),
                })
            })
            .collect())
    }

    fn fetch_part(&mut self, uid: Uid, part_id: &str) -> Result<Vec<u8>, TransportError> {
        let mailbox = self.selected()?.clone();
        let mut state = mailbox.lock();
        state.stats.part_fetches += 1;
        if std::mem::take(&mut state.failures.drop_on_part) {
            drop(state);
            return Err(self.drop_connection());
        }
        if state.failures.failing_parts.contains(&(uid, part_id.to_string())) {
            return Err(TransportError::Command(format!("NO part {part_id} of {uid} unavailable")));
        }
        state
            .messages
            .get(&uid)
            .and_then(|m| {
                m.numbered_leaves()
                    .into_iter()
                    .find(|(part, _)| part.part_id == part_id)
                    .map(|(_, raw)| raw.to_vec())
            })
            .ok_or_else(|| TransportError::Command(format!("NO no part {part_id} in {uid}")))
    }

    fn is_alive(&self) -> bool {
        self.alive
    }
}

/// How a connection came back to the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnedConnection {
    pub reusable: bool,
    pub resource_problem: bool,
}

/// Hands out [`InMemoryTransport`]s and records how they come back
pub struct InMemoryConnectionPool {
    server: Arc<InMemoryServer>,
    refuse: AtomicBool,
    demanded: AtomicUsize,
    returned: Mutex<Vec<ReturnedConnection>>,
}

impl InMemoryConnectionPool {
    pub fn new(server: Arc<InMemoryServer>) -> Arc<Self> {
        Arc::new(Self {
            server,
            refuse: AtomicBool::new(false),
            demanded: AtomicUsize::new(0),
            returned: Mutex::new(Vec::new()),
        })
    }

    /// Make every following demand fail
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn demanded(&self) -> usize {
        self.demanded.load(Ordering::SeqCst)
    }

    pub fn returned(&self) -> Vec<ReturnedConnection> {
        self.returned.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl ConnectionPool for InMemoryConnectionPool {
    fn demand_connection(&self, _label: &str) -> Result<Box<dyn ImapTransport>, TransportError> {
        self.demanded.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectFailed("connection refused".to_string()));
        }
        Ok(Box::new(InMemoryTransport::new(self.server.clone())))
    }

    fn done_with_connection(
        &self,
        _conn: Box<dyn ImapTransport>,
        reusable: bool,
        resource_problem: bool,
    ) {
        self.returned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ReturnedConnection {
                reusable,
                resource_problem,
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::date::DAY_MILLIS;

    const JAN1: Timestamp = 1_704_067_200_000;

    fn transport_for(server: &Arc<InMemoryServer>, path: &str) -> InMemoryTransport {
        let mut t = InMemoryTransport::new(server.clone());
        t.open_box(path).unwrap();
        t
    }

    #[test]
    fn test_search_uses_whole_days() {
        let server = InMemoryServer::new();
        let inbox = server.mailbox("INBOX");
        let a = inbox.add(ServerMessage::text(JAN1 + 1000, "a@x.com", "a", "a"));
        let b = inbox.add(ServerMessage::text(JAN1 + DAY_MILLIS + 5, "b@x.com", "b", "b"));
        let c = inbox.add(ServerMessage::text(JAN1 + 3 * DAY_MILLIS, "c@x.com", "c", "c"));

        let mut t = transport_for(&server, "INBOX");
        // SINCE mid-Jan-1 still includes all of Jan 1
        let found = t
            .search(&SearchCriteria::new(Some(JAN1 + 5000), Some(JAN1 + 2 * DAY_MILLIS)))
            .unwrap();
        assert_eq!(found, vec![a, b]);
        assert_eq!(t.search(&SearchCriteria::default()).unwrap(), vec![a, b, c]);
    }

    #[test]
    fn test_search_days_are_server_local() {
        let server = InMemoryServer::new();
        server.set_tz_offset(5 * 3_600_000);
        let inbox = server.mailbox("INBOX");
        // 20:00 UTC on Jan 1 is already Jan 2 at UTC+5
        let late = inbox.add(ServerMessage::text(JAN1 + 20 * 3_600_000, "a@x.com", "a", "a"));
        let early = inbox.add(ServerMessage::text(JAN1 - 4 * 3_600_000, "b@x.com", "b", "b"));

        let mut t = transport_for(&server, "INBOX");
        let jan1 = t
            .search(&SearchCriteria::new(Some(JAN1), Some(JAN1 + DAY_MILLIS)))
            .unwrap();
        assert_eq!(jan1, vec![early]);
        let jan2 = t
            .search(&SearchCriteria::new(Some(JAN1 + DAY_MILLIS), None))
            .unwrap();
        assert_eq!(jan2, vec![late]);
    }

    #[test]
    fn test_deleted_flag_hidden_from_search() {
        let server = InMemoryServer::new();
        let inbox = server.mailbox("INBOX");
        inbox.add(ServerMessage::text(JAN1, "a@x.com", "a", "a").with_flags(&["\\Deleted"]));
        let mut t = transport_for(&server, "INBOX");
        assert!(t.search(&SearchCriteria::default()).unwrap().is_empty());
    }

    #[test]
    fn test_multipart_numbering() {
        let server = InMemoryServer::new();
        let inbox = server.mailbox("INBOX");
        let uid = inbox.add(
            ServerMessage::text(JAN1, "a@x.com", "a", "plain")
                .with_html("<p>html</p>")
                .with_attachment("a.pdf", "application/pdf", b"%PDF"),
        );
        let mut t = transport_for(&server, "INBOX");
        let fetched = t.fetch_headers(&[uid]).unwrap();
        let ids: Vec<String> = fetched[0]
            .structure
            .leaves()
            .iter()
            .map(|p| p.part_id.clone())
            .collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(t.fetch_part(uid, "2").unwrap(), b"<p>html</p>");
        assert_eq!(t.fetch_part(uid, "3").unwrap(), STANDARD.encode(b"%PDF").into_bytes());
    }

    #[test]
    fn test_dropped_connection_stays_dead() {
        let server = InMemoryServer::new();
        let inbox = server.mailbox("INBOX");
        inbox.drop_connection_on_search();
        let mut t = transport_for(&server, "INBOX");
        assert!(t.search(&SearchCriteria::default()).unwrap_err().is_fatal());
        assert!(!t.is_alive());
        assert!(t.fetch_flags(&[1]).unwrap_err().is_fatal());
    }

    #[test]
    fn test_open_unknown_mailbox() {
        let server = InMemoryServer::new();
        let mut t = InMemoryTransport::new(server);
        assert!(matches!(t.open_box("Nope"), Err(TransportError::OpenFailed { .. })));
        assert!(matches!(t.search(&SearchCriteria::default()), Err(TransportError::NotSelected)));
    }
}
