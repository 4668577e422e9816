//! Server/local UID diffing and the fetch pipelines it drives
//!
//! Given the UIDs a SEARCH returned and the headers stored for the same
//! window, every UID is new, known or (locally only) deleted. New messages
//! get one batched header + BODYSTRUCTURE fetch and then one fetch per body
//! part; known messages get one batched flags fetch.

use std::collections::{HashMap, HashSet};

use log::{debug, warn};

use super::progress::ProgressEstimator;
use crate::error::SyncError;
use crate::imap::decoder::make_snippet;
use crate::imap::{BodyPart, DecoderFactory, FetchedMessage, ImapTransport, TransportError};
use crate::models::{AttachmentInfo, BodyInfo, BodyRep, BodyRepKind, HeaderInfo, Uid};
use crate::storage::FolderBlockStore;

/// Classification of one window's UIDs
#[derive(Debug, Clone, Default)]
pub struct DiffPlan {
    /// On the server, not stored locally, in server order
    pub new_uids: Vec<Uid>,
    /// Stored locally and still on the server
    pub known: Vec<HeaderInfo>,
    /// Stored locally but gone from the server
    pub deleted: Vec<HeaderInfo>,
}

pub fn classify(server_uids: &[Uid], local: Vec<HeaderInfo>) -> DiffPlan {
    let on_server: HashSet<Uid> = server_uids.iter().copied().collect();
    let (known, deleted): (Vec<HeaderInfo>, Vec<HeaderInfo>) =
        local.into_iter().partition(|h| on_server.contains(&h.id));

    let known_uids: HashSet<Uid> = known.iter().map(|h| h.id).collect();
    let new_uids = server_uids
        .iter()
        .copied()
        .filter(|uid| !known_uids.contains(uid))
        .collect();

    DiffPlan {
        new_uids,
        known,
        deleted,
    }
}

/// Counts from one run of the pipelines
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchReport {
    /// New messages committed to storage
    pub new_count: usize,
    /// Known messages flag-checked
    pub known_count: usize,
    pub deleted_count: usize,
    /// Committed with at least one body part missing
    pub partial_count: usize,
    /// Not committed because a body part could not be decoded
    pub skipped_count: usize,
    /// Known messages whose flags were written back
    pub flags_changed: usize,
}

/// A new message waiting for its body parts
struct PendingMessage {
    header: HeaderInfo,
    body: BodyInfo,
    /// Text parts to download, one fetch each
    parts: Vec<BodyPart>,
    /// Parts still outstanding
    remaining: usize,
    undecodable: bool,
}

pub struct MessageDiffFetcher<'a> {
    store: &'a FolderBlockStore,
    decoders: &'a dyn DecoderFactory,
    snippet_chars: usize,
}

impl<'a> MessageDiffFetcher<'a> {
    pub fn new(
        store: &'a FolderBlockStore,
        decoders: &'a dyn DecoderFactory,
        snippet_chars: usize,
    ) -> Self {
        Self {
            store,
            decoders,
            snippet_chars,
        }
    }

    /// Apply `plan`: deletions first, then the new and known pipelines.
    pub fn run(
        &self,
        conn: &mut dyn ImapTransport,
        plan: DiffPlan,
        progress: &mut ProgressEstimator<'_>,
    ) -> Result<FetchReport, SyncError> {
        let mut report = FetchReport {
            deleted_count: self.apply_deletions(&plan.deleted)?,
            known_count: plan.known.len(),
            ..FetchReport::default()
        };

        // Header fetch goes out before the flags fetch; parts follow both
        let mut pending = self.fetch_new_headers(conn, &plan.new_uids, progress)?;
        report.flags_changed = self.refresh_known(conn, &plan.known, progress)?;
        self.download_bodies(conn, &mut pending, progress, &mut report)?;

        Ok(report)
    }

    fn apply_deletions(&self, deleted: &[HeaderInfo]) -> Result<usize, SyncError> {
        for header in deleted {
            debug!("[SYNC] uid {} no longer on server, deleting", header.id);
            self.store.delete_message_header_and_body(header.date, header.id)?;
        }
        Ok(deleted.len())
    }

    fn fetch_new_headers(
        &self,
        conn: &mut dyn ImapTransport,
        uids: &[Uid],
        progress: &mut ProgressEstimator<'_>,
    ) -> Result<Vec<PendingMessage>, SyncError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let fetched = conn.fetch_headers(uids).map_err(SyncError::FetchFailed)?;
        progress.headers_fetched(uids.len());
        debug!("[SYNC] fetched {} of {} new headers", fetched.len(), uids.len());
        Ok(fetched.into_iter().map(pending_from_fetch).collect())
    }

    /// Write back flags that changed.
    ///
    /// # Returns
    /// Number of headers updated
    fn refresh_known(
        &self,
        conn: &mut dyn ImapTransport,
        known: &[HeaderInfo],
        progress: &mut ProgressEstimator<'_>,
    ) -> Result<usize, SyncError> {
        if known.is_empty() {
            return Ok(0);
        }
        let uids: Vec<Uid> = known.iter().map(|h| h.id).collect();
        let updates = conn.fetch_flags(&uids).map_err(SyncError::FetchFailed)?;
        progress.flags_fetched(uids.len());

        let by_uid: HashMap<Uid, Vec<String>> =
            updates.into_iter().map(|u| (u.uid, u.flags)).collect();
        let mut changed = 0;
        for header in known {
            match by_uid.get(&header.id) {
                Some(flags) if header.flags_differ(flags) => {
                    self.store.update_message_flags(header.date, header.id, flags.clone())?;
                    changed += 1;
                }
                Some(_) => {}
                // Expunged since SEARCH; the next sync of this window drops it
                None => debug!("[SYNC] uid {} missing from flags fetch", header.id),
            }
        }
        Ok(changed)
    }

    fn download_bodies(
        &self,
        conn: &mut dyn ImapTransport,
        pending: &mut [PendingMessage],
        progress: &mut ProgressEstimator<'_>,
        report: &mut FetchReport,
    ) -> Result<(), SyncError> {
        for msg in pending.iter_mut().filter(|msg| msg.remaining == 0) {
            self.commit(msg, progress, report)?;
        }

        let wanted: Vec<(usize, BodyPart)> = pending
            .iter()
            .enumerate()
            .flat_map(|(idx, msg)| msg.parts.iter().cloned().map(move |part| (idx, part)))
            .collect();

        for (idx, part) in wanted {
            let msg = &mut pending[idx];
            match conn.fetch_part(msg.header.id, &part.part_id) {
                Ok(raw) => {
                    let mut decoder = self.decoders.decoder_for(&part);
                    match decoder.decode(&raw) {
                        Ok(text) => msg.fill_part(&part.part_id, text),
                        Err(e) => {
                            warn!(
                                "[SYNC] uid {} part {}: could not decode: {}",
                                msg.header.id, part.part_id, e
                            );
                            msg.undecodable = true;
                        }
                    }
                }
                Err(e) if e.is_fatal() => return Err(SyncError::FetchFailed(e)),
                Err(e) => log_part_failure(msg.header.id, &part, &e),
            }

            msg.remaining -= 1;
            if msg.remaining == 0 {
                self.commit(msg, progress, report)?;
            }
        }
        Ok(())
    }

    fn commit(
        &self,
        msg: &mut PendingMessage,
        progress: &mut ProgressEstimator<'_>,
        report: &mut FetchReport,
    ) -> Result<(), SyncError> {
        progress.body_done();
        if msg.undecodable {
            report.skipped_count += 1;
            return Ok(());
        }

        msg.header.snippet = snippet_of(&msg.body, self.snippet_chars);
        msg.body.refresh_size();
        if msg.body.is_partially_downloaded() {
            report.partial_count += 1;
        }
        self.store
            .add_message(msg.header.clone(), std::mem::take(&mut msg.body))?;
        report.new_count += 1;
        Ok(())
    }
}

impl PendingMessage {
    fn fill_part(&mut self, part_id: &str, text: String) {
        if let Some(rep) = self.body.body_reps.iter_mut().find(|rep| rep.part_id == part_id) {
            rep.content = Some(text);
            rep.is_downloaded = true;
        }
    }
}

fn log_part_failure(uid: Uid, part: &BodyPart, err: &TransportError) {
    warn!(
        "[SYNC] uid {} part {}: fetch failed, leaving it undownloaded: {}",
        uid, part.part_id, err
    );
}

fn body_kind(part: &BodyPart) -> Option<BodyRepKind> {
    if part.is_attachment() || !part.media_type.eq_ignore_ascii_case("text") {
        return None;
    }
    match part.subtype.to_ascii_lowercase().as_str() {
        "plain" => Some(BodyRepKind::Plain),
        "html" => Some(BodyRepKind::Html),
        _ => None,
    }
}

fn pending_from_fetch(msg: FetchedMessage) -> PendingMessage {
    let leaves = msg.structure.leaves();
    let has_attachments = leaves.iter().any(|p| p.is_attachment());

    let attachments: Vec<AttachmentInfo> = leaves
        .iter()
        .filter(|p| p.is_attachment())
        .map(|p| AttachmentInfo {
            name: p.filename.clone(),
            content_type: p.content_type(),
            part_id: p.part_id.clone(),
            encoding: p.encoding.clone(),
            size_estimate: p.size,
        })
        .collect();

    let parts: Vec<BodyPart> = leaves
        .iter()
        .filter(|p| body_kind(p).is_some())
        .map(|p| (*p).clone())
        .collect();
    let body_reps: Vec<BodyRep> = parts
        .iter()
        .filter_map(|p| {
            Some(BodyRep {
                kind: body_kind(p)?,
                part_id: p.part_id.clone(),
                size_estimate: p.size,
                content: None,
                is_downloaded: false,
            })
        })
        .collect();

    let envelope = msg.envelope;
    let header = HeaderInfo {
        id: msg.uid,
        author: envelope.from.unwrap_or_default(),
        date: msg.internal_date,
        flags: msg.flags,
        has_attachments,
        subject: envelope.subject,
        snippet: None,
    };
    let body = BodyInfo {
        date: msg.internal_date,
        size: 0,
        to: envelope.to,
        cc: envelope.cc,
        bcc: envelope.bcc,
        reply_to: envelope.reply_to,
        attachments,
        body_reps,
    };

    PendingMessage {
        remaining: parts.len(),
        parts,
        header,
        body,
        undecodable: false,
    }
}

fn snippet_of(body: &BodyInfo, max_chars: usize) -> Option<String> {
    let rep = body
        .body_reps
        .iter()
        .filter(|rep| rep.is_downloaded)
        .min_by_key(|rep| rep.kind != BodyRepKind::Plain)?;
    let text = rep.content.as_deref()?;
    Some(make_snippet(text, rep.kind == BodyRepKind::Html, max_chars))
}
