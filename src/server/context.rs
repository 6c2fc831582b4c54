//! Per-request transaction state kept by the pipeline.

use crate::{
    http::{request::Request, response::BodyLength, types::Version},
    StatusCode,
};
use std::{fmt, sync::Arc};

/// Stable reference to a transaction context.
///
/// Handles are generational: once a context leaves the pipeline its handle
/// stops resolving, even if the arena slot is reused by a later request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl fmt::Display for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}.{}", self.index, self.generation)
    }
}

/// Wire bytes that could not be written when they were produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DeferredChunk {
    pub(crate) data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Registered, not yet handed to the dispatcher.
    Parsed,
    Dispatched,
    /// The reply head was produced.
    Writing,
    /// The dispatcher called `finished`.
    Finished,
}

/// One parsed request and the progress of its reply.
#[derive(Debug)]
pub(crate) struct TransactionContext {
    /// `None` for the context carrying a canned error reply.
    pub(crate) request: Option<Arc<Request>>,
    pub(crate) version: Version,

    pub(crate) may_read: bool,
    pub(crate) may_write: bool,
    pub(crate) deferred: Option<DeferredChunk>,

    pub(crate) bytes_written: u64,
    pub(crate) body_written: u64,
    pub(crate) phase: Phase,
    pub(crate) finish_requested: bool,
    pub(crate) io_error: bool,

    pub(crate) reply_framing: Option<BodyLength>,
    pub(crate) reply_status: Option<StatusCode>,
    /// Whether the connection may be reused after this reply.
    pub(crate) keep_alive: bool,

    pub(crate) write_in_flight: bool,
    /// The producer is waiting for a `Resume`.
    pub(crate) resume_owed: bool,
    pub(crate) needs_last_chunk: bool,
    pub(crate) head_request: bool,
    /// Close the connection once this context leaves.
    pub(crate) close_after: bool,
    /// The connection wrote an error reply in place of the producer's.
    pub(crate) answered: bool,
}

impl TransactionContext {
    pub(crate) fn new(request: Arc<Request>) -> Self {
        let version = request.version();
        let keep_alive = request.is_keep_alive();
        let head_request = *request.method() == crate::Method::Head;

        TransactionContext {
            request: Some(request),
            head_request,
            keep_alive,
            ..Self::empty(version)
        }
    }

    /// Context for a request that failed to parse; it only carries the
    /// canned error reply.
    pub(crate) fn for_error(version: Version) -> Self {
        TransactionContext {
            close_after: true,
            ..Self::empty(version)
        }
    }

    fn empty(version: Version) -> Self {
        TransactionContext {
            request: None,
            version,

            may_read: false,
            may_write: false,
            deferred: None,

            bytes_written: 0,
            body_written: 0,
            phase: Phase::Parsed,
            finish_requested: false,
            io_error: false,

            reply_framing: None,
            reply_status: None,
            keep_alive: false,

            write_in_flight: false,
            resume_owed: false,
            needs_last_chunk: false,
            head_request: false,
            close_after: false,
            answered: false,
        }
    }

    /// Whether the reply was fully produced with the promised length.
    pub(crate) fn reply_complete(&self) -> bool {
        match self.reply_framing {
            Some(_) if self.head_request => true,
            Some(BodyLength::Length(len)) => self.body_written == len,
            Some(_) => true,
            None => false,
        }
    }

    /// Nothing more will ever be written for this context.
    pub(crate) fn is_drained(&self) -> bool {
        self.finish_requested
            && self.deferred.is_none()
            && !self.write_in_flight
            && !self.needs_last_chunk
    }

    /// A successful reply to `CONNECT` turns the rest of the stream into a tunnel.
    pub(crate) fn opens_tunnel(&self) -> bool {
        let connect = self
            .request
            .as_ref()
            .is_some_and(|r| *r.method() == crate::Method::Connect);

        connect
            && !self.io_error
            && self
                .reply_status
                .is_some_and(|s| (200..300).contains(&s.as_u16()))
    }
}
