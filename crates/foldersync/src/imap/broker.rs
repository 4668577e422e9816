//! Connection acquisition for a folder sync
//!
//! A [`ConnectionSession`] holds at most one pooled connection, already
//! inside the folder's mailbox. Losing it fires the session's deathback
//! exactly once, from whichever thread notices.

use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info, warn};

use super::transport::{ImapTransport, MailboxInfo, TransportError};
use crate::error::SyncError;

/// Source of connections shared by every folder of an account
pub trait ConnectionPool: Send + Sync {
    fn demand_connection(&self, label: &str) -> Result<Box<dyn ImapTransport>, TransportError>;

    /// Give a connection back. `reusable` is false when it must be closed;
    /// `resource_problem` flags a server-side failure rather than a local one.
    fn done_with_connection(
        &self,
        conn: Box<dyn ImapTransport>,
        reusable: bool,
        resource_problem: bool,
    );
}

type Deathback = Box<dyn FnOnce() + Send>;

/// Cloneable trigger for a session's deathback
#[derive(Clone, Default)]
pub struct DeathHandle {
    slot: Arc<Mutex<Option<Deathback>>>,
}

impl DeathHandle {
    fn arm(&self, deathback: Deathback) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(deathback);
    }

    fn disarm(&self) {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    pub fn is_armed(&self) -> bool {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Run the deathback if it hasn't run yet.
    ///
    /// # Returns
    /// `true` if this call ran it
    pub fn fire(&self) -> bool {
        let deathback = self.slot.lock().unwrap_or_else(PoisonError::into_inner).take();
        match deathback {
            Some(deathback) => {
                deathback();
                true
            }
            None => false,
        }
    }
}

/// The connection side of a folder sync
pub struct ConnectionSession {
    folder_path: String,
    pool: Arc<dyn ConnectionPool>,
    conn: Option<Box<dyn ImapTransport>>,
    mailbox: Option<MailboxInfo>,
    death: DeathHandle,
}

impl ConnectionSession {
    pub fn new(pool: Arc<dyn ConnectionPool>, folder_path: impl Into<String>) -> Self {
        Self {
            folder_path: folder_path.into(),
            pool,
            conn: None,
            mailbox: None,
            death: DeathHandle::default(),
        }
    }

    pub fn folder_path(&self) -> &str {
        &self.folder_path
    }

    /// Get a connection and enter the folder's mailbox.
    ///
    /// If the pool can't supply a connection, `deathback` runs only when
    /// `die_on_connect_failure` is set. If the mailbox can't be entered the
    /// connection goes back to the pool unhealthy and `deathback` runs.
    pub fn acquire_conn(
        &mut self,
        label: &str,
        die_on_connect_failure: bool,
        deathback: impl FnOnce() + Send + 'static,
    ) -> Result<MailboxInfo, SyncError> {
        if let (Some(_), Some(mailbox)) = (&self.conn, &self.mailbox) {
            return Ok(mailbox.clone());
        }

        let mut conn = match self.pool.demand_connection(label) {
            Ok(conn) => conn,
            Err(e) => {
                warn!("[SYNC] {}: no connection for {}: {}", self.folder_path, label, e);
                if die_on_connect_failure {
                    deathback();
                }
                return Err(SyncError::ConnectionUnavailable(e.to_string()));
            }
        };

        let mailbox = match conn.open_box(&self.folder_path) {
            Ok(mailbox) => mailbox,
            Err(e) => {
                warn!("[SYNC] {}: could not open mailbox: {}", self.folder_path, e);
                self.pool.done_with_connection(conn, false, true);
                deathback();
                return Err(SyncError::ConnectionUnavailable(e.to_string()));
            }
        };

        info!(
            "[SYNC] {}: acquired connection for {} ({} messages on server)",
            self.folder_path, label, mailbox.exists
        );
        self.death.arm(Box::new(deathback));
        self.conn = Some(conn);
        self.mailbox = Some(mailbox.clone());
        Ok(mailbox)
    }

    /// Hand a still-working connection back for other folders to use
    pub fn relinquish_conn(&mut self) {
        self.death.disarm();
        self.mailbox = None;
        if let Some(conn) = self.conn.take() {
            let reusable = conn.is_alive();
            debug!(
                "[SYNC] {}: relinquishing connection (reusable: {})",
                self.folder_path, reusable
            );
            self.pool.done_with_connection(conn, reusable, false);
        }
    }

    /// Drop a connection that failed underneath us and fire the deathback
    pub fn connection_died(&mut self) {
        self.mailbox = None;
        if let Some(conn) = self.conn.take() {
            warn!("[SYNC] {}: connection died", self.folder_path);
            self.pool.done_with_connection(conn, false, false);
        }
        self.death.fire();
    }

    pub fn death_handle(&self) -> DeathHandle {
        self.death.clone()
    }

    pub fn is_held(&self) -> bool {
        self.conn.is_some()
    }

    /// Status of the mailbox as of acquisition
    pub fn mailbox(&self) -> Option<&MailboxInfo> {
        self.mailbox.as_ref()
    }

    pub fn transport(&mut self) -> Option<&mut (dyn ImapTransport + 'static)> {
        self.conn.as_deref_mut()
    }

    /// Run `f` on the held connection, acquiring one first if needed
    pub fn with_connection<R>(
        &mut self,
        label: &str,
        f: impl FnOnce(&mut dyn ImapTransport, &MailboxInfo) -> Result<R, SyncError>,
    ) -> Result<R, SyncError> {
        if !self.is_held() {
            self.acquire_conn(label, false, || {})?;
        }
        match (self.conn.as_deref_mut(), self.mailbox.as_ref()) {
            (Some(conn), Some(mailbox)) => f(conn, mailbox),
            _ => Err(SyncError::ConnectionUnavailable("connection not held".to_string())),
        }
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        self.relinquish_conn();
    }
}
