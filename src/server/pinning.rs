//! Binding of a client connection to one upstream connection.
//!
//! Connection-oriented authentication schemes (NTLM, Negotiate) tie the
//! credentials to a single upstream TCP connection, so every later request of
//! the client must reuse it. The record is shared with dispatchers through
//! [`PinnedSlot`] handles.

use crate::http::request::Request;
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tracing::debug;

/// Upstream side of a pinned pair, owned by the forwarding layer.
pub trait UpstreamConnection: Send + Sync {
    fn is_open(&self) -> bool;
    fn close(&self);
}

pub(crate) struct PinningRecord {
    connection: Arc<dyn UpstreamConnection>,
    host: String,
    port: u16,
    peer: Option<String>,
    auth: bool,
    monitoring: bool,
    lent: bool,
}

impl fmt::Debug for PinningRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinningRecord")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("peer", &self.peer)
            .field("auth", &self.auth)
            .field("monitoring", &self.monitoring)
            .field("lent", &self.lent)
            .finish_non_exhaustive()
    }
}

impl PinningRecord {
    fn matches(&self, request: &Request, peer: Option<&str>) -> bool {
        let same_origin = request
            .authority()
            .is_some_and(|(host, port)| host.eq_ignore_ascii_case(&self.host) && port == self.port);

        same_origin && self.peer.as_deref() == peer
    }
}

/// Shared slot holding the pinning record of one client connection.
#[derive(Debug, Clone, Default)]
pub struct PinnedSlot(Arc<Mutex<Option<PinningRecord>>>);

/// Parameters of a new pinning.
pub struct Pin<'a> {
    pub connection: Arc<dyn UpstreamConnection>,
    pub request: &'a Request,
    /// Name of the cache peer the connection goes to, if any.
    pub peer: Option<&'a str>,
    /// Credentials are bound to the upstream connection.
    pub auth: bool,
    /// Watch the idle upstream connection for closure.
    pub monitor: bool,
}

impl PinnedSlot {
    fn lock(&self) -> MutexGuard<'_, Option<PinningRecord>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pins `pin.connection`, replacing and closing a different previous one.
    ///
    /// Returns `false` when the request names no origin to pin to.
    pub fn pin(&self, pin: Pin<'_>) -> bool {
        let Some((host, port)) = pin.request.authority() else {
            return false;
        };

        debug!(%host, port, auth = pin.auth, "connection pinned");
        let record = PinningRecord {
            connection: pin.connection.clone(),
            host: host.to_owned(),
            port,
            peer: pin.peer.map(str::to_owned),
            auth: pin.auth,
            monitoring: pin.monitor,
            lent: false,
        };

        let previous = self.lock().replace(record);
        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous.connection, &pin.connection) {
                previous.connection.close();
            }
        }
        true
    }

    /// Drops the record, closing the upstream connection if `and_close`.
    pub fn unpin(&self, and_close: bool) {
        if let Some(record) = self.lock().take() {
            debug!(host = %record.host, and_close, "connection unpinned");
            if and_close {
                record.connection.close();
            }
        }
    }

    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.lock().is_some()
    }

    /// Whether the pinned connection may serve `request` sent through `peer`.
    ///
    /// A closed upstream connection is unpinned. A mismatch leaves the record
    /// untouched; the caller decides what to do about it.
    pub fn validate(&self, request: &Request, peer: Option<&str>) -> bool {
        let mut slot = self.lock();

        match slot.as_ref() {
            Some(record) if !record.connection.is_open() => {
                debug!(host = %record.host, "pinned connection is gone");
                *slot = None;
                false
            }
            Some(record) => record.matches(request, peer),
            None => false,
        }
    }

    /// Lends the pinned connection for `request`.
    ///
    /// The connection is no longer monitored while lent; the returned guard
    /// gives it back when dropped.
    pub fn borrow(&self, request: &Request, peer: Option<&str>) -> Option<PinnedConnection> {
        if !self.validate(request, peer) {
            return None;
        }

        let mut slot = self.lock();
        let record = slot.as_mut().filter(|r| !r.lent)?;
        record.lent = true;
        record.monitoring = false;

        Some(PinnedConnection {
            connection: record.connection.clone(),
            slot: self.clone(),
        })
    }

    pub fn stop_monitoring(&self) {
        if let Some(record) = self.lock().as_mut() {
            record.monitoring = false;
        }
    }

    #[inline]
    pub fn is_monitoring(&self) -> bool {
        self.lock().as_ref().is_some_and(|r| r.monitoring)
    }

    /// The upstream closed the idle pinned connection.
    ///
    /// Returns `true` when credentials were bound to it, in which case the
    /// client must not send further requests on this connection.
    pub(crate) fn closed_by_peer(&self) -> bool {
        match self.lock().take() {
            Some(record) => {
                debug!(host = %record.host, "pinned connection closed by peer");
                record.auth
            }
            None => false,
        }
    }
}

/// Pinned upstream connection lent to one transaction.
pub struct PinnedConnection {
    connection: Arc<dyn UpstreamConnection>,
    slot: PinnedSlot,
}

impl PinnedConnection {
    #[inline(always)]
    pub fn connection(&self) -> &Arc<dyn UpstreamConnection> {
        &self.connection
    }
}

impl Drop for PinnedConnection {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();

        if let Some(record) = slot.as_mut() {
            if Arc::ptr_eq(&record.connection, &self.connection) {
                record.lent = false;
            }
        }
    }
}
