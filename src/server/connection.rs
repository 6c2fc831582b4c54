//! Sans-IO state machine of one client connection.
//!
//! [`Connection`] owns the unconsumed client bytes, the pipeline of in-flight
//! transactions, the request body reader, the pinning record and the bump
//! decision. It performs no I/O: the driver feeds it [`Event`]s and carries
//! out the [`Action`]s it queues, in order.

use crate::{
    errors::{ErrorKind, IoError},
    http::{
        chunked::{encode_chunk, ChunkedDecoder, LAST_CHUNK},
        proxy_protocol::{parse_proxy_header, ProxiedClient},
        request::{Framing, ParseOutcome, Request, RequestParser},
        response::{BodyLength, Reply},
    },
    limits::{BumpMode, Limits},
    server::{
        bump::{
            enter_bumping, BumpState, BumpVerdict, CertificateProvider, ConnectionMode, TlsContext,
            TunnelStart,
        },
        context::{ContextHandle, DeferredChunk, Phase, TransactionContext},
        pinning::{Pin, PinnedConnection, PinnedSlot},
        pipeline::Pipeline,
    },
    Method, Version,
};
use std::{
    collections::VecDeque,
    fmt, io, mem,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{debug, error, trace, warn};

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Input delivered to [`Connection::handle`].
#[derive(Debug)]
pub enum Event {
    /// Bytes read from the client.
    Received(Vec<u8>),
    /// The client closed its sending half.
    ReadEof,
    ReadError(io::ErrorKind),
    /// No client bytes within `socket_read_timeout`.
    Timeout,

    /// The [`Action::Write`] of this context reached the socket.
    Written(ContextHandle),
    WriteError {
        handle: ContextHandle,
        kind: io::ErrorKind,
    },

    /// Interim `1xx` reply written ahead of the final one.
    ControlMessage {
        handle: ContextHandle,
        reply: Reply,
    },
    StartOfMessage {
        handle: ContextHandle,
        reply: Reply,
        body: Vec<u8>,
    },
    Body {
        handle: ContextHandle,
        data: Vec<u8>,
    },
    Finished(ContextHandle),
    IoError {
        handle: ContextHandle,
        kind: io::ErrorKind,
    },

    /// The body consumer took `bytes` out of its queue.
    BodySpaceAvailable {
        handle: ContextHandle,
        bytes: usize,
    },
    BodyConsumerAborted(ContextHandle),

    BumpVerdict(BumpVerdict),
    /// The monitored idle pinned connection was closed by the upstream.
    PinnedConnectionClosed,
    /// Stop accepting requests; close once the pipeline drains.
    StartShutdown,
    /// Close now, whatever is in flight.
    EndingShutdown,
    Kick,
}

/// Work queued by the connection for the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Hand a new request to the dispatch collaborator.
    Dispatch {
        handle: ContextHandle,
        request: Arc<Request>,
        has_body: bool,
    },
    /// Write to the client socket, then report [`Event::Written`].
    Write { handle: ContextHandle, data: Vec<u8> },
    /// The reply producer may send its next piece.
    Resume(ContextHandle),

    BodyData { handle: ContextHandle, data: Vec<u8> },
    BodyEnd(ContextHandle),
    BodyAborted {
        handle: ContextHandle,
        error: ErrorKind,
    },

    /// Client bytes buffered so far, for the bump policy to look at.
    Peek { data: Vec<u8> },
    /// Relay the stream untouched from here on.
    Splice { leftover: Vec<u8> },
    /// Terminate TLS on the client stream and feed the decrypted bytes back.
    StartTls {
        context: TlsContext,
        leftover: Vec<u8>,
    },

    /// The transaction was dropped by a teardown.
    Cancel(ContextHandle),
    Close,
}

/// Coarse connection state, for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    AwaitingFirstByte,
    ParsingRequests,
    AwaitingBody,
    /// One half is stopped or no more requests are accepted.
    Draining,
    Tunnel,
    Closed,
}

#[derive(Debug)]
enum BodyKind {
    Length { remaining: u64 },
    Chunked(ChunkedDecoder),
}

#[derive(Debug)]
struct BodyState {
    owner: ContextHandle,
    kind: BodyKind,
    /// Bytes the consumer accepts before it reports more space.
    space: usize,
    /// The consumer went away; the rest of the body is discarded.
    aborted: bool,
}

/// Client-side HTTP/1.x connection.
///
/// # Examples
/// ```
/// use pipeconn::{limits::Limits, Action, Connection, Event, Reply, StatusCode};
/// use std::sync::Arc;
///
/// let mut conn = Connection::new(Arc::new(Limits::default()));
/// conn.handle(Event::Received(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n".to_vec()));
///
/// let Some(Action::Dispatch { handle, .. }) = conn.poll_action() else {
///     unreachable!()
/// };
///
/// conn.handle(Event::StartOfMessage {
///     handle,
///     reply: Reply::new(StatusCode::Ok).content_length(2),
///     body: b"hi".to_vec(),
/// });
/// assert!(matches!(conn.poll_action(), Some(Action::Write { .. })));
/// ```
pub struct Connection {
    id: ConnectionId,
    limits: Arc<Limits>,

    parser: RequestParser,
    input: Vec<u8>,
    pipeline: Pipeline,
    body: Option<BodyState>,

    pinning: PinnedSlot,
    bump: BumpState,
    mode: ConnectionMode,
    certificates: Option<Arc<dyn CertificateProvider>>,
    /// Host of the `CONNECT` waiting for a bump verdict.
    peek_host: String,

    peer: Option<SocketAddr>,
    proxy_header_pending: bool,
    proxied: Option<ProxiedClient>,

    stopped_receiving: Option<&'static str>,
    stopped_sending: Option<&'static str>,
    no_more_requests: bool,
    shutting_down: bool,
    /// `CONNECT` context whose outcome decides whether a tunnel starts.
    tunnel: Option<ContextHandle>,

    actions: VecDeque<Action>,
    closed: bool,
    handed_off: bool,
    request_count: u64,
}

impl Connection {
    pub fn new(limits: Arc<Limits>) -> Self {
        Connection {
            id: ConnectionId::new(),
            parser: RequestParser::new(limits.req.clone()),
            proxy_header_pending: limits.conn.proxy_protocol,
            limits,

            input: Vec::new(),
            pipeline: Pipeline::default(),
            body: None,

            pinning: PinnedSlot::default(),
            bump: BumpState::Unset,
            mode: ConnectionMode::Plain,
            certificates: None,
            peek_host: String::new(),

            peer: None,
            proxied: None,

            stopped_receiving: None,
            stopped_sending: None,
            no_more_requests: false,
            shutting_down: false,
            tunnel: None,

            actions: VecDeque::new(),
            closed: false,
            handed_off: false,
            request_count: 0,
        }
    }

    /// Sets the collaborator minting certificates for bumped tunnels.
    pub fn with_certificates(mut self, provider: Arc<dyn CertificateProvider>) -> Self {
        self.certificates = Some(provider);
        self
    }

    /// Sets the address of the socket peer, checked against
    /// [`proxy_protocol_trusted`](crate::limits::ConnLimits::proxy_protocol_trusted).
    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    #[inline(always)]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[inline(always)]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Addresses from the PROXY protocol header, once it was read.
    #[inline(always)]
    pub fn proxied_client(&self) -> Option<&ProxiedClient> {
        self.proxied.as_ref()
    }

    /// The real client: the PROXY header source when there is one, else the peer.
    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.proxied.and_then(|p| p.source).or(self.peer)
    }

    #[inline(always)]
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    #[inline(always)]
    pub fn mode(&self) -> &ConnectionMode {
        &self.mode
    }

    #[inline(always)]
    pub fn bump_state(&self) -> BumpState {
        self.bump
    }

    /// Transactions currently in the pipeline.
    #[inline(always)]
    pub fn in_flight(&self) -> usize {
        self.pipeline.len()
    }

    /// Whether `handle` still names a context of the pipeline.
    #[inline]
    pub fn is_in_flight(&self, handle: ContextHandle) -> bool {
        self.pipeline.get(handle).is_ok()
    }

    /// Progress of the reply of `handle`.
    pub fn phase(&self, handle: ContextHandle) -> Result<Phase, ErrorKind> {
        self.pipeline.get(handle).map(|ctx| ctx.phase)
    }

    #[inline(always)]
    pub fn requests_parsed(&self) -> u64 {
        self.request_count
    }

    pub fn state(&self) -> ConnState {
        if self.closed {
            ConnState::Closed
        } else if self.handed_off || self.bump == BumpState::Peeking {
            ConnState::Tunnel
        } else if self.stopped_receiving.is_some()
            || self.stopped_sending.is_some()
            || self.no_more_requests
        {
            ConnState::Draining
        } else if self.body.is_some() {
            ConnState::AwaitingBody
        } else if self.request_count == 0 && self.input.is_empty() {
            ConnState::AwaitingFirstByte
        } else {
            ConnState::ParsingRequests
        }
    }

    /// Next queued action, oldest first.
    #[inline]
    pub fn poll_action(&mut self) -> Option<Action> {
        self.actions.pop_front()
    }

    /// Whether the driver should read from the client socket.
    ///
    /// Only the pipeline tail (or the idle connection) asks for input, and
    /// only while a new request, body bytes or peeked TLS bytes can be used.
    pub fn wants_read(&self) -> bool {
        if self.closed
            || self.handed_off
            || self.stopped_receiving.is_some()
            || self.input.len() >= self.limits.conn.input_buffer_size
        {
            return false;
        }

        if let Some(body) = &self.body {
            return body.aborted || body.space > 0;
        }
        if self.bump == BumpState::Peeking {
            return true;
        }
        if self.no_more_requests || self.tunnel.is_some() || self.stopped_sending.is_some() {
            return false;
        }

        match self.pipeline.tail() {
            None => true,
            Some(tail) => {
                self.pipeline.get(tail).is_ok_and(|ctx| ctx.may_read)
                    && self.pipeline.len() <= self.limits.conn.pipeline_prefetch
            }
        }
    }

    /// Request body bytes still to come from the client: `0` without a body,
    /// `-1` when the chunked framing leaves it unknown.
    pub fn may_need_to_read_more_body(&self) -> i64 {
        match &self.body {
            None => 0,
            Some(BodyState { kind: BodyKind::Chunked(_), .. }) => -1,
            Some(BodyState { kind: BodyKind::Length { remaining }, .. }) => {
                let left = remaining.saturating_sub(self.input.len() as u64);
                i64::try_from(left).unwrap_or(i64::MAX)
            }
        }
    }

    /// Single entry point: applies `event`, then makes all possible progress.
    pub fn handle(&mut self, event: Event) {
        match event {
            Event::Received(data) => self.on_received(data),
            Event::ReadEof => self.stop_receiving("client closed"),
            Event::Timeout => self.stop_receiving("read timeout"),
            Event::ReadError(kind) => {
                debug!(conn = %self.id, ?kind, "read failed");
                self.stop_receiving("read error");
            }

            Event::Written(handle) => self.on_written(handle),
            Event::WriteError { handle, kind } => {
                if let Ok(ctx) = self.pipeline.get_mut(handle) {
                    ctx.write_in_flight = false;
                }
                self.note_io_error(handle, kind);
                self.initiate_close("write error");
            }

            Event::ControlMessage { handle, reply } => {
                let result = self.send_control_message(handle, reply);
                self.check_contract(handle, result);
            }
            Event::StartOfMessage {
                handle,
                reply,
                body,
            } => {
                let result = self.send_start_of_message(handle, reply, &body);
                self.check_contract(handle, result);
            }
            Event::Body { handle, data } => {
                let result = self.send_body(handle, &data);
                self.check_contract(handle, result);
            }
            Event::Finished(handle) => self.finished(handle),
            Event::IoError { handle, kind } => self.note_io_error(handle, kind),

            Event::BodySpaceAvailable { handle, bytes } => {
                self.note_more_body_space_available(handle, bytes)
            }
            Event::BodyConsumerAborted(handle) => self.note_body_consumer_aborted(handle),

            Event::BumpVerdict(verdict) => self.on_bump_verdict(verdict),
            Event::PinnedConnectionClosed => self.pinned_connection_closed(),
            Event::StartShutdown => self.start_shutdown(),
            Event::EndingShutdown => self.ending_shutdown(),
            Event::Kick => {}
        }

        self.kick();
    }

    /// Makes every step that is currently possible: delivers body bytes,
    /// retires finished transactions, parses new requests and decides
    /// whether the connection ends. Idempotent.
    pub fn kick(&mut self) {
        loop {
            if self.closed || self.handed_off {
                return;
            }

            let mut progressed = self.read_proxy_header();
            progressed |= self.deliver_body();
            progressed |= self.advance_pipeline();
            progressed |= self.client_parse_requests();
            progressed |= self.abort_truncated_body();

            if !progressed {
                break;
            }
        }

        self.check_connection_end();
    }

    /// Re-enters request parsing after a transaction completed.
    pub fn read_next_request(&mut self) {
        if self.client_parse_requests() {
            self.kick();
        }
    }
}

// Replies
impl Connection {
    /// Writes an interim `1xx` reply (such as `100 Continue`) for `handle`,
    /// in pipeline order and ahead of its final reply.
    ///
    /// Clients older than `HTTP/1.1` do not get interim replies; the message
    /// is dropped and the producer resumed.
    pub fn send_control_message(&mut self, handle: ContextHandle, reply: Reply) -> Result<(), ErrorKind> {
        let ctx = self.pipeline.get_mut(handle)?;
        if ctx.answered {
            return Err(ErrorKind::ContextGone);
        }
        if ctx.reply_framing.is_some() {
            return Err(ErrorKind::ReplyStarted);
        }

        let status = reply.status();
        if !status.is_interim() {
            return Err(ErrorKind::NotInterim);
        }
        if ctx.version != Version::Http11 {
            trace!(conn = %self.id, ctx = %handle, version = %ctx.version, "control message dropped");
            self.actions.push_back(Action::Resume(handle));
            return Ok(());
        }

        let mut out = Vec::with_capacity(64);
        reply.encode_interim(ctx.version, &mut out);
        debug!(conn = %self.id, ctx = %handle, status = status.as_u16(), "control message");

        self.produce(handle, out)
    }

    /// Starts the reply of `handle`, with an optional first body piece.
    ///
    /// The bytes go to the socket when the context is the pipeline head and
    /// no write is in flight; otherwise they wait in its deferred slot.
    pub fn send_start_of_message(
        &mut self,
        handle: ContextHandle,
        reply: Reply,
        body: &[u8],
    ) -> Result<(), ErrorKind> {
        let reusable = !self.no_more_requests;
        let ctx = self.pipeline.get_mut(handle)?;
        if ctx.answered {
            return Err(ErrorKind::ContextGone);
        }
        if ctx.reply_framing.is_some() {
            return Err(ErrorKind::ReplyStarted);
        }

        let tunnel = ctx
            .request
            .as_ref()
            .is_some_and(|r| *r.method() == Method::Connect);

        let mut out = Vec::with_capacity(256 + body.len());
        let (framing, keep_alive) =
            reply.encode_head(ctx.version, ctx.keep_alive && reusable, tunnel, &mut out);

        ctx.reply_framing = Some(framing);
        ctx.reply_status = Some(reply.status());
        ctx.keep_alive = keep_alive;
        ctx.phase = Phase::Writing;
        ctx.needs_last_chunk = framing == BodyLength::Chunked && !ctx.head_request;

        let dropped = append_body(ctx, body, &mut out);
        debug!(
            conn = %self.id, ctx = %handle, status = reply.status().as_u16(), ?framing,
            "reply started"
        );
        if dropped > 0 {
            warn!(conn = %self.id, ctx = %handle, dropped, "reply body exceeds its length");
        }

        self.produce(handle, out)
    }

    /// Sends the next reply body piece; framing is applied here.
    pub fn send_body(&mut self, handle: ContextHandle, data: &[u8]) -> Result<(), ErrorKind> {
        let ctx = self.pipeline.get_mut(handle)?;
        if ctx.answered {
            return Err(ErrorKind::ContextGone);
        }
        if ctx.reply_framing.is_none() {
            return Err(ErrorKind::ReplyNotStarted);
        }
        if ctx.deferred.is_some() {
            return Err(ErrorKind::DeferredSlotOccupied);
        }

        let mut out = Vec::with_capacity(data.len() + 16);
        let dropped = append_body(ctx, data, &mut out);
        if dropped > 0 {
            warn!(conn = %self.id, ctx = %handle, dropped, "reply body exceeds its length");
        }

        self.produce(handle, out)
    }

    /// The reply of `handle` is complete. Idempotent; unknown handles are ignored.
    ///
    /// The context leaves the pipeline once it is the head and everything it
    /// produced has been written.
    pub fn finished(&mut self, handle: ContextHandle) {
        let Ok(ctx) = self.pipeline.get_mut(handle) else {
            return;
        };
        if ctx.finish_requested {
            return;
        }

        ctx.finish_requested = true;
        ctx.phase = Phase::Finished;
        if ctx.reply_framing.is_none() {
            debug!(conn = %self.id, ctx = %handle, "finished without a reply");
        }

        if ctx.needs_last_chunk && ctx.deferred.is_none() && !ctx.write_in_flight {
            match ctx.may_write {
                true => self.pull_data(handle),
                false => {
                    ctx.needs_last_chunk = false;
                    ctx.deferred = Some(DeferredChunk {
                        data: LAST_CHUNK.to_vec(),
                    });
                }
            }
        }
    }

    /// No further reply bytes can be delivered for `handle`; the connection
    /// closes once the context leaves the pipeline.
    pub fn note_io_error(&mut self, handle: ContextHandle, kind: io::ErrorKind) {
        let Some(ctx) = self.pipeline.get_mut(handle).ok().filter(|ctx| !ctx.answered) else {
            return;
        };
        debug!(conn = %self.id, ctx = %handle, ?kind, "transaction I/O error");

        ctx.io_error = true;
        ctx.deferred = None;
        ctx.needs_last_chunk = false;
        if mem::take(&mut ctx.resume_owed) {
            self.actions.push_back(Action::Resume(handle));
        }
    }

    fn produce(&mut self, handle: ContextHandle, out: Vec<u8>) -> Result<(), ErrorKind> {
        if out.is_empty() {
            self.actions.push_back(Action::Resume(handle));
            return Ok(());
        }

        self.emit(handle, out)?;
        if let Ok(ctx) = self.pipeline.get_mut(handle) {
            ctx.resume_owed |= ctx.write_in_flight || ctx.deferred.is_some();
        }
        Ok(())
    }

    /// Writes `data` now if `handle` may, otherwise parks it in the deferred slot.
    fn emit(&mut self, handle: ContextHandle, data: Vec<u8>) -> Result<(), ErrorKind> {
        let sending = self.stopped_sending.is_none();
        let ctx = self.pipeline.get_mut(handle)?;

        if !sending || ctx.io_error {
            trace!(conn = %self.id, ctx = %handle, bytes = data.len(), "reply bytes discarded");
            self.actions.push_back(Action::Resume(handle));
            return Ok(());
        }
        if ctx.deferred.is_some() {
            return Err(ErrorKind::DeferredSlotOccupied);
        }

        if ctx.may_write && !ctx.write_in_flight {
            self.write(handle, data);
        } else {
            trace!(conn = %self.id, ctx = %handle, bytes = data.len(), "reply bytes deferred");
            ctx.deferred = Some(DeferredChunk { data });
        }
        Ok(())
    }

    fn write(&mut self, handle: ContextHandle, data: Vec<u8>) {
        if self.stopped_sending.is_some() {
            return;
        }
        let Ok(ctx) = self.pipeline.get_mut(handle) else {
            return;
        };
        debug_assert!(ctx.may_write && !ctx.write_in_flight, "{handle} wrote out of turn");

        ctx.write_in_flight = true;
        ctx.bytes_written += data.len() as u64;
        trace!(conn = %self.id, ctx = %handle, bytes = data.len(), "write");
        self.actions.push_back(Action::Write { handle, data });
    }

    /// Moves the next pending piece of `handle` to the socket, or lets its
    /// producer continue when nothing is pending.
    fn pull_data(&mut self, handle: ContextHandle) {
        let Ok(ctx) = self.pipeline.get_mut(handle) else {
            return;
        };
        if !ctx.may_write || ctx.write_in_flight {
            return;
        }

        let data = if let Some(chunk) = ctx.deferred.take() {
            chunk.data
        } else if ctx.needs_last_chunk && ctx.finish_requested {
            ctx.needs_last_chunk = false;
            LAST_CHUNK.to_vec()
        } else {
            if mem::take(&mut ctx.resume_owed) {
                self.actions.push_back(Action::Resume(handle));
            }
            return;
        };

        self.write(handle, data);
    }

    fn on_written(&mut self, handle: ContextHandle) {
        let Ok(ctx) = self.pipeline.get_mut(handle) else {
            return;
        };
        ctx.write_in_flight = false;
        self.pull_data(handle);
    }

    fn check_contract(&mut self, handle: ContextHandle, result: Result<(), ErrorKind>) {
        match result {
            Ok(()) => {}
            Err(ErrorKind::ContextGone) => {
                debug!(conn = %self.id, ctx = %handle, "reply for a retired transaction ignored")
            }
            Err(e) => {
                error!(conn = %self.id, ctx = %handle, error = %e, "reply contract violated");
                self.note_io_error(handle, io::ErrorKind::InvalidInput);
                self.initiate_close("reply contract violated");
            }
        }
    }
}

/// Frames `data` per the reply framing of `ctx`. Returns how many bytes did
/// not fit the announced length.
fn append_body(ctx: &mut TransactionContext, data: &[u8], out: &mut Vec<u8>) -> usize {
    if data.is_empty() || ctx.head_request {
        return 0;
    }

    match ctx.reply_framing {
        Some(BodyLength::Length(len)) => {
            let left = len.saturating_sub(ctx.body_written);
            let take = usize::try_from(left).map_or(data.len(), |l| l.min(data.len()));

            out.extend_from_slice(&data[..take]);
            ctx.body_written += take as u64;
            data.len() - take
        }
        Some(BodyLength::Chunked) => {
            encode_chunk(data, out);
            ctx.body_written += data.len() as u64;
            0
        }
        Some(BodyLength::UntilClose) => {
            out.extend_from_slice(data);
            ctx.body_written += data.len() as u64;
            0
        }
        Some(BodyLength::Empty) | None => data.len(),
    }
}

// Requests and bodies
impl Connection {
    fn on_received(&mut self, data: Vec<u8>) {
        if self.closed || self.handed_off || self.stopped_receiving.is_some() {
            trace!(conn = %self.id, bytes = data.len(), "input after receiving stopped");
            return;
        }

        trace!(conn = %self.id, bytes = data.len(), "received");
        self.input.extend_from_slice(&data);

        if self.bump == BumpState::Peeking {
            self.actions.push_back(Action::Peek {
                data: self.input.clone(),
            });
        }
    }

    /// Frees the first `n` buffered bytes.
    #[inline]
    fn consume_input(&mut self, n: usize) {
        self.input.drain(..n);
    }

    fn may_parse(&self) -> bool {
        !self.closed
            && !self.handed_off
            && !self.proxy_header_pending
            && self.mode != ConnectionMode::Tunnel
            && self.body.is_none()
            && self.tunnel.is_none()
            && !self.no_more_requests
            && self.stopped_sending.is_none()
            && !self.input.is_empty()
            && self.pipeline.len() <= self.limits.conn.pipeline_prefetch
    }

    fn client_parse_requests(&mut self) -> bool {
        let mut progressed = false;

        while self.may_parse() {
            match self.parser.parse(&self.input) {
                ParseOutcome::Complete(request, consumed) => {
                    self.consume_input(consumed);
                    self.register_request(request);
                    progressed = true;
                }
                ParseOutcome::Incomplete => {
                    if self.input.len() >= self.limits.conn.input_buffer_size {
                        self.abort_request_parsing(ErrorKind::HeadersTooLarge);
                        progressed = true;
                    }
                    break;
                }
                ParseOutcome::Malformed(error) => {
                    self.abort_request_parsing(error);
                    progressed = true;
                    break;
                }
            }
        }

        progressed
    }

    fn register_request(&mut self, request: Request) {
        self.request_count += 1;

        let request = Arc::new(request);
        let mut context = TransactionContext::new(request.clone());
        context.phase = Phase::Dispatched;
        let handle = self.pipeline.register(context);

        debug!(
            conn = %self.id, ctx = %handle, method = %request.method(),
            target = request.target(), version = %request.version(), "request parsed"
        );

        let has_body = match request.framing() {
            Framing::Empty => false,
            Framing::Length(remaining) => {
                self.body = Some(BodyState {
                    owner: handle,
                    kind: BodyKind::Length { remaining },
                    space: self.limits.conn.input_buffer_size,
                    aborted: false,
                });
                true
            }
            Framing::Chunked => {
                if let Err(e) = self.start_dechunking_request(handle) {
                    error!(conn = %self.id, ctx = %handle, error = %e, "cannot read request body");
                    return self.teardown("concurrent chunked body");
                }
                true
            }
        };

        if *request.method() == Method::Connect {
            self.tunnel = Some(handle);
        } else if !request.is_keep_alive() {
            // Anything pipelined after it would never be answered.
            debug!(conn = %self.id, ctx = %handle, "last request of the connection");
            self.no_more_requests = true;
            if !has_body {
                self.stop_receiving("not persistent");
            }
        }

        self.actions.push_back(Action::Dispatch {
            handle,
            request,
            has_body,
        });
    }

    /// Puts a chunked decoder between the input buffer and the body consumer
    /// of `handle`. A connection reads at most one request body at a time.
    pub(crate) fn start_dechunking_request(&mut self, handle: ContextHandle) -> Result<(), ErrorKind> {
        if let Some(body) = &self.body {
            debug!(conn = %self.id, ctx = %handle, owner = %body.owner, "request body still being read");
            return Err(ErrorKind::ConcurrentChunkedBody);
        }

        self.pipeline.get(handle)?;
        self.body = Some(BodyState {
            owner: handle,
            kind: BodyKind::Chunked(ChunkedDecoder::new(&self.limits.req)),
            space: self.limits.conn.input_buffer_size,
            aborted: false,
        });
        Ok(())
    }

    /// Consumes the PROXY protocol header expected ahead of the first request.
    fn read_proxy_header(&mut self) -> bool {
        if !self.proxy_header_pending || self.closed || self.input.is_empty() {
            return false;
        }

        if let Some(peer) = self.peer {
            let trusted = &self.limits.conn.proxy_protocol_trusted;
            if !trusted.is_empty() && !trusted.contains(&peer.ip()) {
                let error = ErrorKind::UntrustedProxyClient;
                warn!(conn = %self.id, %peer, %error, "PROXY header refused");
                self.teardown("untrusted PROXY client");
                return true;
            }
        }

        match parse_proxy_header(&self.input) {
            Ok(Some((client, consumed))) => {
                debug!(
                    conn = %self.id, source = ?client.source, destination = ?client.destination,
                    "PROXY header read"
                );
                self.consume_input(consumed);
                self.proxy_header_pending = false;
                self.proxied = Some(client);
                true
            }
            Ok(None) if self.input.len() < self.limits.conn.input_buffer_size => false,
            Ok(None) => {
                warn!(conn = %self.id, bytes = self.input.len(), "PROXY header too large");
                self.teardown("malformed PROXY header");
                true
            }
            Err(error) => {
                warn!(conn = %self.id, %error, "PROXY header rejected");
                self.teardown("malformed PROXY header");
                true
            }
        }
    }

    /// Stops parsing for good and queues the canned error reply in pipeline
    /// order; the connection closes once it is written.
    fn abort_request_parsing(&mut self, error: ErrorKind) {
        warn!(conn = %self.id, %error, status = error.status().as_u16(), "malformed request");

        self.no_more_requests = true;
        self.input.clear();
        self.parser.reset();
        self.stop_receiving("malformed request");

        let mut context = TransactionContext::for_error(Version::Http11);
        context.finish_requested = true;
        context.phase = Phase::Finished;
        context.reply_status = Some(error.status());

        let handle = self.pipeline.register(context);
        let reply = error.as_http(Version::Http11, self.limits.conn.json_errors);
        if let Err(e) = self.emit(handle, reply) {
            error!(conn = %self.id, ctx = %handle, error = %e, "error reply lost");
        }
    }

    fn deliver_body(&mut self) -> bool {
        let Some(body) = self.body.as_mut() else {
            return false;
        };
        if self.input.is_empty() || (body.space == 0 && !body.aborted) {
            return false;
        }

        let (owner, aborted) = (body.owner, body.aborted);
        let outcome = match &mut body.kind {
            BodyKind::Length { remaining } => {
                let budget = if aborted { usize::MAX } else { body.space };
                let take = usize::try_from(*remaining)
                    .map_or(self.input.len(), |r| r.min(self.input.len()))
                    .min(budget);

                *remaining -= take as u64;
                let data: Vec<u8> = self.input.drain(..take).collect();
                Ok((data, take, *remaining == 0))
            }
            BodyKind::Chunked(decoder) => {
                let mut data = Vec::new();
                match decoder.decode(&self.input, &mut data) {
                    Ok(decoded) => {
                        self.consume_input(decoded.consumed);
                        Ok((data, decoded.consumed, decoded.done))
                    }
                    Err(e) => Err(e),
                }
            }
        };

        match outcome {
            Ok((data, consumed, done)) => {
                if let Some(body) = self.body.as_mut() {
                    if !aborted && !data.is_empty() {
                        body.space = body.space.saturating_sub(data.len());
                        trace!(conn = %self.id, ctx = %owner, bytes = data.len(), "body data");
                        self.actions.push_back(Action::BodyData {
                            handle: owner,
                            data,
                        });
                    }
                }

                if done {
                    debug!(conn = %self.id, ctx = %owner, "request body read");
                    self.body = None;
                    if !aborted {
                        self.actions.push_back(Action::BodyEnd(owner));
                    }
                }
                consumed > 0 || done
            }
            Err(error) => {
                warn!(conn = %self.id, ctx = %owner, %error, "malformed chunked body");

                self.body = None;
                self.answer_with_error(owner, &error);
                if !aborted {
                    self.actions.push_back(Action::BodyAborted {
                        handle: owner,
                        error,
                    });
                }
                self.no_more_requests = true;
                self.input.clear();
                self.stop_receiving("malformed chunked body");
                true
            }
        }
    }

    /// Fails a body that can no longer complete because input has stopped.
    fn abort_truncated_body(&mut self) -> bool {
        if self.stopped_receiving.is_none() {
            return false;
        }
        let Some(body) = self.body.as_ref() else {
            return false;
        };
        if body.space == 0 && !body.aborted && !self.input.is_empty() {
            // Buffered bytes are still waiting for the consumer.
            return false;
        }

        let (owner, aborted) = (body.owner, body.aborted);
        debug!(conn = %self.id, ctx = %owner, "request body truncated");

        let error = ErrorKind::Io(IoError(io::ErrorKind::UnexpectedEof));
        self.body = None;
        self.answer_with_error(owner, &error);
        if !aborted {
            self.actions.push_back(Action::BodyAborted { handle: owner, error });
        }
        self.no_more_requests = true;
        self.input.clear();
        true
    }

    /// Replaces the reply of `handle` with the canned reply for `error`,
    /// unless its producer already started one. The connection closes after it.
    fn answer_with_error(&mut self, handle: ContextHandle, error: &ErrorKind) {
        let json = self.limits.conn.json_errors;
        let Ok(ctx) = self.pipeline.get_mut(handle) else {
            return;
        };
        if ctx.reply_framing.is_some() || ctx.io_error {
            return;
        }

        let status = error.status();
        debug!(conn = %self.id, ctx = %handle, status = status.as_u16(), "answering with an error");

        ctx.answered = true;
        ctx.reply_framing = Some(BodyLength::Empty);
        ctx.reply_status = Some(status);
        ctx.keep_alive = false;
        ctx.close_after = true;
        ctx.finish_requested = true;
        ctx.phase = Phase::Finished;
        // A pending interim reply is superseded.
        ctx.deferred = None;
        if mem::take(&mut ctx.resume_owed) {
            self.actions.push_back(Action::Resume(handle));
        }

        let reply = error.as_http(ctx.version, json);
        if let Err(e) = self.emit(handle, reply) {
            error!(conn = %self.id, ctx = %handle, error = %e, "error reply lost");
        }
    }

    /// The consumer of `handle`'s body freed `bytes` of its queue.
    pub fn note_more_body_space_available(&mut self, handle: ContextHandle, bytes: usize) {
        if let Some(body) = self.body.as_mut().filter(|b| b.owner == handle) {
            body.space = body.space.saturating_add(bytes);
        }
    }

    /// The consumer of `handle`'s body went away; the rest is read and dropped.
    pub fn note_body_consumer_aborted(&mut self, handle: ContextHandle) {
        if let Some(body) = self.body.as_mut().filter(|b| b.owner == handle && !b.aborted) {
            debug!(conn = %self.id, ctx = %handle, "body consumer aborted, discarding");
            body.aborted = true;
        }
    }
}

// Pipeline and closing
impl Connection {
    fn advance_pipeline(&mut self) -> bool {
        let mut progressed = false;
        let hold = self.limits.conn.hold_context_until_body_read;

        while let Some(head) = self.pipeline.head() {
            let body_owner = self.body.as_ref().map(|b| b.owner);
            let removable = self
                .pipeline
                .get(head)
                .is_ok_and(|ctx| ctx.is_drained() && !(hold && body_owner == Some(head)));
            if !removable {
                break;
            }

            let Some((handle, context)) = self.pipeline.remove_head() else {
                break;
            };
            progressed = true;
            self.on_context_removed(handle, context);

            if self.closed || self.handed_off {
                break;
            }
            if let Some(next) = self.pipeline.head() {
                self.pull_data(next);
            }
        }

        progressed
    }

    fn on_context_removed(&mut self, handle: ContextHandle, ctx: TransactionContext) {
        debug!(
            conn = %self.id, ctx = %handle, bytes = ctx.bytes_written,
            status = ctx.reply_status.map(|s| s.as_u16()), "transaction done"
        );

        let connect = self.tunnel == Some(handle);
        if connect {
            self.tunnel = None;
        }

        if ctx.io_error {
            self.initiate_close("transaction I/O error");
        } else if connect && ctx.opens_tunnel() && !self.shutting_down {
            self.start_tunnel(&ctx);
        } else if ctx.close_after {
            self.initiate_close("error reply sent");
        } else if !ctx.reply_complete() {
            self.no_more_requests = true;
            self.initiate_close("incomplete reply");
        } else if !ctx.keep_alive {
            self.initiate_close("not persistent");
        }
    }

    /// Tears the connection down, except that a request body still being
    /// read keeps the receiving half open until it ends.
    pub fn initiate_close(&mut self, reason: &'static str) {
        if self.closed {
            return;
        }

        match self.body.is_some() {
            true => {
                debug!(conn = %self.id, reason, "closing after request body");
                self.stop_sending(reason);
            }
            false => self.teardown(reason),
        }
    }

    /// Graceful shutdown: no new request is accepted, the transactions in
    /// the pipeline are answered, then the connection closes. A request body
    /// being read is still read to its end.
    pub fn start_shutdown(&mut self) {
        if self.closed || self.handed_off {
            return;
        }
        debug!(conn = %self.id, in_flight = self.pipeline.len(), "shutting down");

        self.shutting_down = true;
        self.no_more_requests = true;
        if self.body.is_none() {
            self.stop_receiving("shutting down");
        }
    }

    /// The grace period is over: close now.
    pub fn ending_shutdown(&mut self) {
        if self.handed_off {
            return;
        }
        self.teardown("shutdown");
    }

    /// Stops reading client bytes. Idempotent; the latest reason is kept.
    pub fn stop_receiving(&mut self, reason: &'static str) {
        match self.stopped_receiving.replace(reason) {
            Some(previous) => trace!(conn = %self.id, previous, reason, "receiving already stopped"),
            None => debug!(conn = %self.id, reason, "receiving stopped"),
        }
    }

    /// Stops writing to the client; pending reply bytes are dropped and
    /// waiting producers are released.
    pub fn stop_sending(&mut self, reason: &'static str) {
        if let Some(previous) = self.stopped_sending.replace(reason) {
            trace!(conn = %self.id, previous, reason, "sending already stopped");
            return;
        }
        debug!(conn = %self.id, reason, "sending stopped");

        let handles: Vec<_> = self.pipeline.handles().collect();
        for handle in handles {
            if let Ok(ctx) = self.pipeline.get_mut(handle) {
                ctx.deferred = None;
                ctx.needs_last_chunk = false;
                if mem::take(&mut ctx.resume_owed) {
                    self.actions.push_back(Action::Resume(handle));
                }
            }
        }
    }

    fn check_connection_end(&mut self) {
        if self.closed || self.handed_off {
            return;
        }

        if self.bump == BumpState::Peeking {
            if self.stopped_receiving.is_some() && self.input.is_empty() {
                self.teardown("client closed while peeking");
            }
            return;
        }
        if self.body.is_some() {
            return;
        }

        if let Some(reason) = self.stopped_sending {
            self.teardown(reason);
        } else if self.pipeline.is_empty() {
            if self.no_more_requests {
                self.teardown("no more requests");
            } else if let Some(reason) = self.stopped_receiving {
                self.teardown(reason);
            }
        }
    }

    fn teardown(&mut self, reason: &'static str) {
        if self.closed {
            return;
        }

        self.stop_receiving(reason);
        self.stop_sending(reason);
        self.closed = true;

        for (handle, _) in self.pipeline.drain() {
            self.actions.push_back(Action::Cancel(handle));
        }
        if let Some(body) = self.body.take().filter(|b| !b.aborted) {
            self.actions.push_back(Action::BodyAborted {
                handle: body.owner,
                error: ErrorKind::Io(IoError(io::ErrorKind::ConnectionAborted)),
            });
        }

        self.pinning.unpin(true);
        self.input.clear();

        debug!(conn = %self.id, requests = self.request_count, reason, "connection closed");
        self.actions.push_back(Action::Close);
    }
}

// Tunnels
impl Connection {
    fn start_tunnel(&mut self, ctx: &TransactionContext) {
        let host = ctx
            .request
            .as_ref()
            .and_then(|r| r.authority())
            .map(|(host, _)| host.to_owned())
            .unwrap_or_default();

        self.no_more_requests = true;
        let mode = self.limits.bump.mode;
        debug!(conn = %self.id, %host, ?mode, "tunnel established");

        let start = match mode {
            BumpMode::None => Ok(TunnelStart::Splice),
            BumpMode::Splice => self
                .bump
                .transition(BumpState::Splicing)
                .map(|()| TunnelStart::Splice),
            BumpMode::Bump => enter_bumping(
                &mut self.bump,
                self.certificates.as_deref(),
                &host,
                self.limits.bump.on_certificate_error,
            ),
            BumpMode::Peek => match self.bump.transition(BumpState::Peeking) {
                Ok(()) => {
                    self.peek_host = host;
                    if !self.input.is_empty() {
                        self.actions.push_back(Action::Peek {
                            data: self.input.clone(),
                        });
                    }
                    return;
                }
                Err(e) => Err(e),
            },
        };

        self.begin_tunnel(start);
    }

    fn on_bump_verdict(&mut self, verdict: BumpVerdict) {
        if self.bump != BumpState::Peeking || self.closed {
            error!(conn = %self.id, ?verdict, state = %self.bump, "unexpected bump verdict");
            return;
        }

        debug!(conn = %self.id, ?verdict, "bump verdict");
        let start = match verdict {
            BumpVerdict::Splice => self
                .bump
                .transition(BumpState::Splicing)
                .map(|()| TunnelStart::Splice),
            BumpVerdict::Bump => enter_bumping(
                &mut self.bump,
                self.certificates.as_deref(),
                &mem::take(&mut self.peek_host),
                self.limits.bump.on_certificate_error,
            ),
        };

        self.begin_tunnel(start);
    }

    fn begin_tunnel(&mut self, start: Result<TunnelStart, ErrorKind>) {
        let start = match start {
            Ok(start) => start,
            Err(e) => {
                error!(conn = %self.id, error = %e, "bump decision rejected");
                return self.teardown("bump decision rejected");
            }
        };

        if matches!(self.bump, BumpState::Splicing | BumpState::Bumping) {
            if let Err(e) = self.bump.transition(BumpState::Done) {
                error!(conn = %self.id, error = %e, "bump decision rejected");
                return self.teardown("bump decision rejected");
            }
        }

        match start {
            TunnelStart::Splice => {
                self.mode = ConnectionMode::Tunnel;
                self.handed_off = true;

                let leftover = mem::take(&mut self.input);
                debug!(conn = %self.id, leftover = leftover.len(), "splicing");
                self.actions.push_back(Action::Splice { leftover });
            }
            TunnelStart::Tls(context) => {
                self.mode = ConnectionMode::Bumped(context.clone());
                self.no_more_requests = false;
                self.parser.reset();

                let leftover = mem::take(&mut self.input);
                debug!(conn = %self.id, host = %context.host, "bumping");
                self.actions.push_back(Action::StartTls { context, leftover });
            }
            TunnelStart::Close => self.teardown("certificate unavailable"),
        }
    }
}

// Pinning
impl Connection {
    /// Shared pinning slot, handed to dispatchers.
    #[inline(always)]
    pub fn pinning(&self) -> &PinnedSlot {
        &self.pinning
    }

    pub fn pin_connection(&mut self, pin: Pin<'_>) -> bool {
        self.pinning.pin(pin)
    }

    pub fn unpin_connection(&mut self, and_close: bool) {
        self.pinning.unpin(and_close)
    }

    pub fn borrow_pinned_connection(
        &mut self,
        request: &Request,
        peer: Option<&str>,
    ) -> Option<PinnedConnection> {
        self.pinning.borrow(request, peer)
    }

    pub fn validate_pinned_connection(&self, request: &Request, peer: Option<&str>) -> bool {
        self.pinning.validate(request, peer)
    }

    pub fn stop_pinned_connection_monitoring(&mut self) {
        self.pinning.stop_monitoring()
    }

    /// The upstream closed the monitored idle pinned connection. Requests
    /// authenticated through it cannot continue on this client connection.
    pub fn pinned_connection_closed(&mut self) {
        if !self.pinning.is_monitoring() {
            return;
        }

        if self.pinning.closed_by_peer() {
            debug!(conn = %self.id, "pinned credentials lost");
            self.no_more_requests = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        limits::CertificateFallback,
        server::{bump::tests::FakeAuthority, pinning::tests::*, pinning::UpstreamConnection},
        StatusCode,
    };

    struct Client {
        conn: Connection,
        wire: Vec<u8>,
        log: Vec<Action>,
        hold_writes: bool,
        pending: VecDeque<ContextHandle>,
    }

    impl Client {
        fn new() -> Self {
            Self::with(|_| {})
        }

        fn with(f: impl FnOnce(&mut Limits)) -> Self {
            let mut limits = Limits::default();
            f(&mut limits);
            Self::from(Connection::new(Arc::new(limits)))
        }

        fn from(conn: Connection) -> Self {
            Client {
                conn,
                wire: Vec::new(),
                log: Vec::new(),
                hold_writes: false,
                pending: VecDeque::new(),
            }
        }

        fn event(&mut self, event: Event) {
            self.conn.handle(event);
            self.pump();
        }

        fn send(&mut self, bytes: &[u8]) {
            self.event(Event::Received(bytes.to_vec()));
        }

        fn pump(&mut self) {
            while let Some(action) = self.conn.poll_action() {
                match action {
                    Action::Write { handle, data } => {
                        self.wire.extend_from_slice(&data);
                        match self.hold_writes {
                            true => self.pending.push_back(handle),
                            false => self.conn.handle(Event::Written(handle)),
                        }
                    }
                    other => self.log.push(other),
                }
            }
        }

        fn complete_writes(&mut self) {
            while let Some(handle) = self.pending.pop_front() {
                self.event(Event::Written(handle));
            }
        }

        fn reply(&mut self, handle: ContextHandle, body: &str) {
            self.event(Event::StartOfMessage {
                handle,
                reply: Reply::new(StatusCode::Ok).content_length(body.len() as u64),
                body: body.as_bytes().to_vec(),
            });
            self.event(Event::Finished(handle));
        }

        fn dispatched(&mut self) -> Vec<(ContextHandle, String)> {
            let mut out = Vec::new();
            self.log.retain(|action| match action {
                Action::Dispatch { handle, request, .. } => {
                    out.push((*handle, request.target().to_owned()));
                    false
                }
                _ => true,
            });
            out
        }

        fn body_data(&mut self) -> Vec<u8> {
            let mut out = Vec::new();
            self.log.retain(|action| match action {
                Action::BodyData { data, .. } => {
                    out.extend_from_slice(data);
                    false
                }
                _ => true,
            });
            out
        }

        fn wire(&mut self) -> String {
            String::from_utf8(mem::take(&mut self.wire)).unwrap()
        }

        fn take_log(&mut self) -> Vec<Action> {
            mem::take(&mut self.log)
        }
    }

    fn ok(body: &str) -> String {
        format!("HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n{body}", body.len())
    }

    fn targets(dispatched: &[(ContextHandle, String)]) -> Vec<&str> {
        dispatched.iter().map(|(_, t)| t.as_str()).collect()
    }

    const TWO_GETS: &[u8] = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n";

    #[test]
    fn connection_ids() {
        let (a, b) = (ConnectionId::new(), ConnectionId::new());

        assert!(b.as_u64() > a.as_u64());
        assert_eq!(a.to_string(), format!("conn-{}", a.as_u64()));
    }

    #[test]
    fn pipelined_replies_keep_order() {
        let mut c = Client::new();
        assert_eq!(c.conn.state(), ConnState::AwaitingFirstByte);

        c.send(TWO_GETS);
        let dispatched = c.dispatched();
        assert_eq!(targets(&dispatched), ["/a", "/b"]);
        let (a, b) = (dispatched[0].0, dispatched[1].0);

        // The second reply waits in its deferred slot.
        c.reply(b, "B");
        assert_eq!(c.wire(), "");
        assert!(!c.take_log().contains(&Action::Resume(b)));

        c.reply(a, "A");
        assert_eq!(c.wire(), ok("A") + &ok("B"));
        assert!(c.take_log().contains(&Action::Resume(b)));
        assert_eq!(c.conn.in_flight(), 0);
        assert_eq!(c.conn.state(), ConnState::ParsingRequests);
        assert!(c.conn.wants_read());
    }

    #[test]
    fn fragmented_input() {
        let mut c = Client::new();

        for &byte in TWO_GETS {
            c.send(&[byte]);
        }

        let dispatched = c.dispatched();
        assert_eq!(targets(&dispatched), ["/a", "/b"]);
        for (handle, _) in dispatched {
            c.reply(handle, "ok");
        }
        assert_eq!(c.wire(), ok("ok").repeat(2));
    }

    #[test]
    fn prefetch_bounds_the_pipeline() {
        #[rustfmt::skip]
        let cases = [
            (0, vec!["/a"]),
            (1, vec!["/a", "/b"]),
            (4, vec!["/a", "/b", "/c"]),
        ];

        for (prefetch, first) in cases {
            let mut c = Client::with(|l| l.conn.pipeline_prefetch = prefetch);
            c.send(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\nGET /c HTTP/1.1\r\n\r\n");

            let mut dispatched = c.dispatched();
            assert_eq!(targets(&dispatched), first, "prefetch {prefetch}");
            assert_eq!(c.conn.wants_read(), prefetch == 4);

            let mut all = Vec::new();
            while !dispatched.is_empty() {
                for (handle, target) in dispatched {
                    c.reply(handle, "x");
                    all.push(target);
                }
                dispatched = c.dispatched();
            }
            assert_eq!(all, ["/a", "/b", "/c"]);
        }
    }

    #[test]
    fn finished_is_idempotent() {
        let mut c = Client::new();
        c.send(b"GET /a HTTP/1.1\r\n\r\n");
        let a = c.dispatched()[0].0;

        assert_eq!(c.conn.send_body(a, b"x"), Err(ErrorKind::ReplyNotStarted));
        assert_eq!(c.conn.send_start_of_message(a, Reply::new(StatusCode::Ok), b""), Ok(()));
        assert_eq!(
            c.conn.send_start_of_message(a, Reply::new(StatusCode::Ok), b""),
            Err(ErrorKind::ReplyStarted)
        );
        c.pump();

        c.conn.finished(a);
        c.conn.finished(a);
        c.conn.kick();
        c.pump();
        assert_eq!(c.conn.in_flight(), 0);

        c.conn.finished(a);
        c.conn.kick();
        assert_eq!(c.conn.send_body(a, b"x"), Err(ErrorKind::ContextGone));
        assert_ne!(c.conn.state(), ConnState::Closed);
    }

    #[test]
    fn deferred_slot_is_never_overwritten() {
        let mut c = Client::new();
        c.send(TWO_GETS);
        let dispatched = c.dispatched();
        let (a, b) = (dispatched[0].0, dispatched[1].0);

        let reply = Reply::new(StatusCode::Ok).content_length(4);
        assert_eq!(c.conn.send_start_of_message(b, reply, b"B1"), Ok(()));
        assert_eq!(c.conn.send_body(b, b"xx"), Err(ErrorKind::DeferredSlotOccupied));
        c.pump();
        assert_eq!(c.wire(), "");

        c.reply(a, "A");
        assert_eq!(c.wire(), ok("A") + "HTTP/1.1 200 OK\r\ncontent-length: 4\r\n\r\nB1");

        c.event(Event::Body { handle: b, data: b"B2".to_vec() });
        c.event(Event::Finished(b));
        assert_eq!(c.wire(), "B2");
        assert_eq!(c.conn.in_flight(), 0);
    }

    #[test]
    fn contract_breach_closes() {
        let mut c = Client::new();
        c.send(TWO_GETS);
        let dispatched = c.dispatched();
        let (a, b) = (dispatched[0].0, dispatched[1].0);

        c.event(Event::StartOfMessage {
            handle: b,
            reply: Reply::new(StatusCode::Ok).content_length(4),
            body: b"B1".to_vec(),
        });
        c.event(Event::Body { handle: b, data: b"B2".to_vec() });

        let log = c.take_log();
        assert!(log.contains(&Action::Cancel(a)));
        assert!(log.contains(&Action::Cancel(b)));
        assert_eq!(log.last(), Some(&Action::Close));
        assert_eq!(c.wire(), "");
    }

    #[test]
    fn writes_wait_for_completion() {
        let mut c = Client::new();
        c.hold_writes = true;
        c.send(b"GET / HTTP/1.1\r\n\r\n");
        let a = c.dispatched()[0].0;

        c.event(Event::StartOfMessage {
            handle: a,
            reply: Reply::new(StatusCode::Ok).chunked(),
            body: b"hello".to_vec(),
        });
        // A second piece before the first write completes is parked.
        c.event(Event::Body { handle: a, data: b"world".to_vec() });
        c.event(Event::Finished(a));
        assert_eq!(c.wire(), "HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n5\r\nhello\r\n");
        assert_eq!(c.conn.in_flight(), 1);

        c.complete_writes();
        assert_eq!(c.wire(), "5\r\nworld\r\n0\r\n\r\n");
        assert_eq!(c.conn.in_flight(), 0);
        assert!(c.take_log().contains(&Action::Resume(a)));
    }

    #[test]
    fn head_reply_has_no_body() {
        let mut c = Client::new();
        c.send(b"HEAD / HTTP/1.1\r\n\r\n");
        let a = c.dispatched()[0].0;

        c.reply(a, "hello");
        assert_eq!(c.wire(), "HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\n");
        assert_eq!(c.conn.in_flight(), 0);
        assert_ne!(c.conn.state(), ConnState::Closed);
    }

    #[test]
    fn short_reply_closes() {
        let mut c = Client::new();
        c.send(TWO_GETS);
        let dispatched = c.dispatched();

        c.event(Event::StartOfMessage {
            handle: dispatched[0].0,
            reply: Reply::new(StatusCode::Ok).content_length(10),
            body: b"abc".to_vec(),
        });
        c.event(Event::Finished(dispatched[0].0));

        let log = c.take_log();
        assert!(log.contains(&Action::Cancel(dispatched[1].0)));
        assert_eq!(log.last(), Some(&Action::Close));
    }

    #[test]
    fn malformed_request_answered_in_order() {
        let mut c = Client::new();
        c.send(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nG@T /b HTTP/1.1\r\n\r\nGET /c HTTP/1.1\r\n\r\n");

        let dispatched = c.dispatched();
        assert_eq!(targets(&dispatched), ["/a"]);
        assert_eq!(c.wire(), "");
        assert!(!c.conn.wants_read());
        assert_eq!(c.conn.state(), ConnState::Draining);

        c.reply(dispatched[0].0, "A");
        let error = ErrorKind::InvalidMethod.as_http(Version::Http11, true);
        assert_eq!(c.wire(), ok("A") + std::str::from_utf8(&error).unwrap());
        assert_eq!(c.take_log().last(), Some(&Action::Close));
        assert_eq!(c.conn.state(), ConnState::Closed);
    }

    #[test]
    fn oversized_head_is_rejected() {
        let mut c = Client::with(|l| {
            l.req.header_size = 1 << 20;
            l.conn.input_buffer_size = 64;
        });
        c.send(b"GET / HTTP/1.1\r\nX-Long: ");
        c.send(&[b'a'; 64]);

        let error = ErrorKind::HeadersTooLarge.as_http(Version::Http11, true);
        assert_eq!(c.wire(), std::str::from_utf8(&error).unwrap());
        assert_eq!(c.take_log().last(), Some(&Action::Close));
    }

    #[test]
    fn chunked_request_body() {
        let mut c = Client::new();
        c.send(
            b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
              4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n\
              GET /next HTTP/1.1\r\n\r\n",
        );

        let dispatched = c.dispatched();
        assert_eq!(targets(&dispatched), ["/up", "/next"]);
        assert_eq!(c.body_data(), b"Wikipedia");
        assert!(c.take_log().contains(&Action::BodyEnd(dispatched[0].0)));
    }

    #[test]
    fn one_request_body_at_a_time() {
        #[rustfmt::skip]
        let cases: [(&[u8], i64); 2] = [
            (b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n", -1),
            (b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc",      7),
        ];

        for (input, left) in cases {
            let mut c = Client::new();
            c.send(input);
            let p = c.dispatched()[0].0;

            assert_eq!(c.conn.state(), ConnState::AwaitingBody);
            assert_eq!(c.conn.may_need_to_read_more_body(), left);
            assert_eq!(c.conn.start_dechunking_request(p), Err(ErrorKind::ConcurrentChunkedBody));
            assert_eq!(c.conn.may_need_to_read_more_body(), left, "{input:?}");
        }
    }

    #[test]
    fn chunked_request_waits_for_previous_body() {
        let mut c = Client::with(|l| l.conn.input_buffer_size = 4);
        c.send(b"POST /a HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n");
        let a = c.dispatched()[0].0;
        assert_eq!(c.body_data(), b"Wiki");

        // The consumer of /a is full: /b stays unparsed behind the body.
        c.send(b"0\r\n\r\nPOST /b HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n");
        assert!(c.dispatched().is_empty());
        assert_eq!(c.conn.state(), ConnState::AwaitingBody);
        assert_eq!(c.conn.may_need_to_read_more_body(), -1);
        assert_eq!(c.conn.start_dechunking_request(a), Err(ErrorKind::ConcurrentChunkedBody));

        c.event(Event::BodySpaceAvailable { handle: a, bytes: 4 });
        let dispatched = c.dispatched();
        assert_eq!(targets(&dispatched), ["/b"]);
        let b = dispatched[0].0;

        let log = c.take_log();
        assert!(log.contains(&Action::BodyEnd(a)));
        assert!(log.contains(&Action::BodyData { handle: b, data: b"abc".to_vec() }));
        assert!(log.contains(&Action::BodyEnd(b)));
    }

    #[test]
    fn malformed_chunk_stops_parsing() {
        let mut c = Client::new();
        c.send(
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
              zz\r\nGET /next HTTP/1.1\r\n\r\n",
        );

        let dispatched = c.dispatched();
        assert_eq!(targets(&dispatched), ["/"]);
        let p = dispatched[0].0;

        let error = ErrorKind::InvalidChunk.as_http(Version::Http11, true);
        assert_eq!(c.wire(), String::from_utf8(error).unwrap());
        let log = c.take_log();
        assert!(log.contains(&Action::BodyAborted {
            handle: p,
            error: ErrorKind::InvalidChunk
        }));
        assert_eq!(log.last(), Some(&Action::Close));

        // The producer's own reply arrives too late.
        c.reply(p, "bad");
        assert_eq!(c.wire(), "");
        assert!(c.dispatched().is_empty());
    }

    #[test]
    fn malformed_chunk_after_reply_started() {
        let mut c = Client::new();
        c.send(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n");
        let p = c.dispatched()[0].0;
        c.reply(p, "done");

        c.send(b"zz\r\n");
        assert_eq!(c.wire(), ok("done"));
        let log = c.take_log();
        assert!(log.contains(&Action::BodyAborted {
            handle: p,
            error: ErrorKind::InvalidChunk
        }));
        assert_eq!(log.last(), Some(&Action::Close));
    }

    #[test]
    fn remaining_body_bytes() {
        let mut c = Client::new();
        assert_eq!(c.conn.may_need_to_read_more_body(), 0);

        c.send(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc");
        assert_eq!(c.conn.may_need_to_read_more_body(), 7);

        c.send(b"defghij");
        assert_eq!(c.conn.may_need_to_read_more_body(), 0);
        assert_eq!(c.body_data(), b"abcdefghij");
    }

    #[test]
    fn early_response_orderings() {
        #[rustfmt::skip]
        let cases = [
            // hold   reply first   in flight after reply
            (true,  true,  1),
            (false, true,  0),
            (true,  false, 0),
            (false, false, 0),
        ];

        for (hold, reply_first, in_flight) in cases {
            let mut c = Client::with(|l| l.conn.hold_context_until_body_read = hold);
            c.send(b"POST /up HTTP/1.1\r\nContent-Length: 6\r\n\r\nabc");
            let p = c.dispatched()[0].0;

            if !reply_first {
                c.send(b"def");
            }
            c.reply(p, "done");
            assert_eq!(c.conn.in_flight(), in_flight, "hold {hold}, reply first {reply_first}");
            // The next request is never parsed before the body is gone.
            assert!(c.dispatched().is_empty());

            match reply_first {
                true => c.send(b"defGET /next HTTP/1.1\r\n\r\n"),
                false => c.send(b"GET /next HTTP/1.1\r\n\r\n"),
            }

            assert_eq!(targets(&c.dispatched()), ["/next"]);
            assert_eq!(c.body_data(), b"abcdef");
            assert!(c.take_log().contains(&Action::BodyEnd(p)));
            assert_eq!(c.wire(), ok("done"));
        }
    }

    #[test]
    fn discarded_body() {
        let mut c = Client::new();
        c.send(b"POST /up HTTP/1.1\r\nContent-Length: 6\r\n\r\nabc");
        let p = c.dispatched()[0].0;

        c.event(Event::BodyConsumerAborted(p));
        c.reply(p, "no");
        c.send(b"defGET /next HTTP/1.1\r\n\r\n");

        assert_eq!(targets(&c.dispatched()), ["/next"]);
        assert_eq!(c.body_data(), b"abc");
        assert!(!c.take_log().contains(&Action::BodyEnd(p)));
    }

    #[test]
    fn half_close_answers_buffered_requests() {
        let mut c = Client::new();
        c.send(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\nGET /c HTTP/1.1\r\n\r\n");
        c.event(Event::ReadEof);

        assert_eq!(c.conn.state(), ConnState::Draining);
        assert!(!c.conn.wants_read());

        let mut answered = Vec::new();
        loop {
            let dispatched = c.dispatched();
            if dispatched.is_empty() {
                break;
            }
            for (handle, target) in dispatched {
                c.reply(handle, &target);
                answered.push(target);
            }
        }

        assert_eq!(answered, ["/a", "/b", "/c"]);
        assert_eq!(c.wire(), ok("/a") + &ok("/b") + &ok("/c"));
        assert_eq!(c.take_log().last(), Some(&Action::Close));
    }

    #[test]
    fn truncated_body_on_eof() {
        let mut c = Client::new();
        c.send(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc");
        let p = c.dispatched()[0].0;

        c.event(Event::Timeout);
        let error = ErrorKind::Io(IoError(io::ErrorKind::UnexpectedEof));
        assert_eq!(c.wire(), String::from_utf8(error.as_http(Version::Http11, true)).unwrap());
        let log = c.take_log();
        assert!(log.contains(&Action::BodyAborted { handle: p, error }));
        assert_eq!(log.last(), Some(&Action::Close));

        c.reply(p, "x");
        assert_eq!(c.wire(), "");
    }

    #[test]
    fn close_waits_for_request_body() {
        let mut c = Client::new();
        c.send(b"POST / HTTP/1.1\r\nContent-Length: 4\r\n\r\nab");
        let p = c.dispatched()[0].0;

        c.conn.initiate_close("shutdown");
        c.pump();
        assert_eq!(c.conn.state(), ConnState::Draining);
        assert!(c.conn.wants_read());

        c.send(b"cd");
        let log = c.take_log();
        assert!(log.contains(&Action::Cancel(p)));
        assert_eq!(log.last(), Some(&Action::Close));
    }

    #[test]
    fn connect_splices_by_default() {
        let mut c = Client::new();
        c.send(b"CONNECT a.example:443 HTTP/1.1\r\nHost: a.example:443\r\n\r\n\x16\x03\x01");

        let dispatched = c.dispatched();
        assert_eq!(targets(&dispatched), ["a.example:443"]);
        assert!(!c.conn.wants_read());

        let h = dispatched[0].0;
        c.event(Event::StartOfMessage { handle: h, reply: Reply::new(StatusCode::Ok), body: vec![] });
        c.event(Event::Finished(h));

        assert_eq!(c.wire(), "HTTP/1.1 200 OK\r\n\r\n");
        assert!(c.take_log().contains(&Action::Splice { leftover: b"\x16\x03\x01".to_vec() }));
        assert_eq!(c.conn.state(), ConnState::Tunnel);
        assert_eq!(c.conn.mode(), &ConnectionMode::Tunnel);
        assert_eq!(c.conn.bump_state(), BumpState::Unset);
        assert!(!c.conn.wants_read());
    }

    #[test]
    fn refused_connect_resumes_parsing() {
        let mut c = Client::new();
        c.send(b"CONNECT a.example:443 HTTP/1.1\r\n\r\nGET /next HTTP/1.1\r\n\r\n");
        let h = c.dispatched()[0].0;

        c.event(Event::StartOfMessage {
            handle: h,
            reply: Reply::new(StatusCode::Forbidden),
            body: vec![],
        });
        c.event(Event::Finished(h));

        assert_eq!(c.wire(), "HTTP/1.1 403 Forbidden\r\ncontent-length: 0\r\n\r\n");
        assert_eq!(targets(&c.dispatched()), ["/next"]);
        assert_eq!(c.conn.mode(), &ConnectionMode::Plain);
    }

    fn tunnel(mode: BumpMode, fallback: CertificateFallback, hosts: &'static [&'static str]) -> Client {
        let mut limits = Limits::default();
        limits.bump.mode = mode;
        limits.bump.on_certificate_error = fallback;

        let conn = Connection::new(Arc::new(limits)).with_certificates(Arc::new(FakeAuthority(hosts)));
        let mut c = Client::from(conn);

        c.send(b"CONNECT a.example:443 HTTP/1.1\r\n\r\n");
        let h = c.dispatched()[0].0;
        c.event(Event::StartOfMessage { handle: h, reply: Reply::new(StatusCode::Ok), body: vec![] });
        c.event(Event::Finished(h));
        assert_eq!(c.wire(), "HTTP/1.1 200 OK\r\n\r\n");
        c
    }

    #[test]
    fn peek_then_bump() {
        let mut c = tunnel(BumpMode::Peek, CertificateFallback::Close, &["a.example"]);
        assert_eq!(c.conn.bump_state(), BumpState::Peeking);
        assert_eq!(c.conn.state(), ConnState::Tunnel);
        assert!(c.conn.wants_read());

        c.send(b"\x16\x03\x01");
        assert!(c.take_log().contains(&Action::Peek { data: b"\x16\x03\x01".to_vec() }));

        c.event(Event::BumpVerdict(BumpVerdict::Bump));
        let log = c.take_log();
        let Some(Action::StartTls { context, leftover }) = log.last() else {
            panic!("unexpected {log:?}");
        };
        assert_eq!(context.host, "a.example");
        assert_eq!(leftover, b"\x16\x03\x01");
        assert_eq!(c.conn.bump_state(), BumpState::Done);
        assert!(matches!(c.conn.mode(), ConnectionMode::Bumped(_)));

        // The decision is final.
        c.event(Event::BumpVerdict(BumpVerdict::Splice));
        assert_eq!(c.conn.bump_state(), BumpState::Done);
        assert!(c.take_log().is_empty());

        // Decrypted requests are parsed like clear-text ones.
        c.send(b"GET /inner HTTP/1.1\r\nHost: a.example\r\n\r\n");
        assert_eq!(targets(&c.dispatched()), ["/inner"]);
    }

    #[test]
    fn peek_then_splice() {
        let mut c = tunnel(BumpMode::Peek, CertificateFallback::Close, &[]);
        c.send(b"\x16");
        c.event(Event::BumpVerdict(BumpVerdict::Splice));

        assert!(c.take_log().contains(&Action::Splice { leftover: b"\x16".to_vec() }));
        assert_eq!(c.conn.bump_state(), BumpState::Done);
    }

    #[test]
    fn certificate_fallback() {
        #[rustfmt::skip]
        let cases: [(BumpMode, CertificateFallback, &'static [&'static str], &str); 4] = [
            (BumpMode::Bump,   CertificateFallback::Close,  &["a.example"], "tls"),
            (BumpMode::Bump,   CertificateFallback::Splice, &[],            "splice"),
            (BumpMode::Bump,   CertificateFallback::Close,  &[],            "close"),
            (BumpMode::Splice, CertificateFallback::Close,  &[],            "splice"),
        ];

        for (mode, fallback, hosts, expected) in cases {
            let mut c = tunnel(mode, fallback, hosts);

            let outcome = match c.take_log().last() {
                Some(Action::StartTls { .. }) => "tls",
                Some(Action::Splice { .. }) => "splice",
                Some(Action::Close) => "close",
                other => panic!("unexpected {other:?}"),
            };
            assert_eq!(outcome, expected, "{mode:?} {fallback:?} {hosts:?}");

            let done = expected != "close";
            assert_eq!(c.conn.bump_state() == BumpState::Done, done);
        }
    }

    #[test]
    fn pinning_through_the_connection() {
        let mut c = Client::new();
        let upstream = Arc::new(FakeUpstream::default());
        let pinned_for = request("GET / HTTP/1.1\r\nHost: a.example\r\n\r\n");

        assert!(c.conn.pin_connection(Pin {
            connection: upstream.clone(),
            request: &pinned_for,
            peer: None,
            auth: true,
            monitor: true,
        }));

        let other = request("GET / HTTP/1.1\r\nHost: b.example\r\n\r\n");
        assert!(!c.conn.validate_pinned_connection(&other, None));
        assert!(c.conn.borrow_pinned_connection(&other, None).is_none());
        assert!(c.conn.pinning().is_pinned());
        assert!(c.conn.validate_pinned_connection(&pinned_for, None));

        // Losing the credentials-bearing upstream ends the idle client connection.
        c.event(Event::PinnedConnectionClosed);
        assert!(!c.conn.pinning().is_pinned());
        assert_eq!(c.take_log().last(), Some(&Action::Close));
    }

    #[test]
    fn teardown_closes_pinned_upstream() {
        let mut c = Client::new();
        let upstream = Arc::new(FakeUpstream::default());

        c.conn.pin_connection(Pin {
            connection: upstream.clone(),
            request: &request("GET / HTTP/1.1\r\nHost: a.example\r\n\r\n"),
            peer: None,
            auth: false,
            monitor: false,
        });
        c.conn.stop_pinned_connection_monitoring();

        // Not monitored: the closure is the forwarder's business.
        c.event(Event::PinnedConnectionClosed);
        assert!(c.conn.pinning().is_pinned());

        c.event(Event::ReadEof);
        assert_eq!(c.take_log().last(), Some(&Action::Close));
        assert!(!upstream.is_open());
    }

    #[test]
    fn non_persistent_request_ends_the_pipeline() {
        #[rustfmt::skip]
        let cases: [(&[u8], &str); 3] = [
            (b"GET /a HTTP/1.1\r\nConnection: close\r\n\r\nPOST /b HTTP/1.1\r\nContent-Length: 1\r\n\r\nx",
                "HTTP/1.1 200 OK\r\ncontent-length: 1\r\nconnection: close\r\n\r\nA"),
            (b"GET /a HTTP/1.0\r\n\r\nPOST /b HTTP/1.0\r\nContent-Length: 1\r\n\r\nx",
                "HTTP/1.0 200 OK\r\ncontent-length: 1\r\nconnection: close\r\n\r\nA"),
            (b"GET /a\r\nGET /b\r\n", "A"),
        ];

        for (input, wire) in cases {
            let mut c = Client::with(|l| l.req.http09 = true);
            c.send(input);

            let dispatched = c.dispatched();
            assert_eq!(targets(&dispatched), ["/a"], "{input:?}");
            assert_eq!(c.conn.state(), ConnState::Draining);
            assert!(!c.conn.wants_read());

            c.reply(dispatched[0].0, "A");
            assert_eq!(c.wire(), wire);
            assert!(c.dispatched().is_empty());
            assert_eq!(c.take_log().last(), Some(&Action::Close));
        }
    }

    #[test]
    fn reply_phases() {
        let mut c = Client::new();
        c.hold_writes = true;
        c.send(b"GET / HTTP/1.1\r\n\r\n");
        let p = c.dispatched()[0].0;
        assert_eq!(c.conn.phase(p), Ok(Phase::Dispatched));

        c.event(Event::StartOfMessage {
            handle: p,
            reply: Reply::new(StatusCode::Ok).content_length(2),
            body: b"ok".to_vec(),
        });
        assert_eq!(c.conn.phase(p), Ok(Phase::Writing));

        c.event(Event::Finished(p));
        assert_eq!(c.conn.phase(p), Ok(Phase::Finished));

        c.complete_writes();
        assert_eq!(c.wire(), ok("ok"));
        assert_eq!(c.conn.phase(p), Err(ErrorKind::ContextGone));
    }

    #[test]
    fn control_messages_precede_the_reply() {
        let mut c = Client::new();
        c.send(
            b"GET /a HTTP/1.1\r\n\r\n\
              POST /b HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 2\r\n\r\n",
        );
        let dispatched = c.dispatched();
        assert_eq!(targets(&dispatched), ["/a", "/b"]);
        let (a, b) = (dispatched[0].0, dispatched[1].0);

        c.event(Event::ControlMessage {
            handle: a,
            reply: Reply::new(StatusCode::EarlyHints).header("link", "</a.css>; rel=preload"),
        });
        assert_eq!(c.wire(), "HTTP/1.1 103 Early Hints\r\nlink: </a.css>; rel=preload\r\n\r\n");

        // Not the head yet: the interim reply waits for /a.
        c.event(Event::ControlMessage { handle: b, reply: Reply::new(StatusCode::Continue) });
        assert_eq!(c.wire(), "");

        c.reply(a, "A");
        assert_eq!(c.wire(), ok("A") + "HTTP/1.1 100 Continue\r\n\r\n");
        assert!(c.take_log().contains(&Action::Resume(b)));

        c.send(b"hi");
        assert_eq!(c.body_data(), b"hi");

        let not_interim = c.conn.send_control_message(b, Reply::new(StatusCode::Ok));
        assert_eq!(not_interim, Err(ErrorKind::NotInterim));

        c.event(Event::StartOfMessage {
            handle: b,
            reply: Reply::new(StatusCode::Ok).content_length(1),
            body: b"B".to_vec(),
        });
        let late = c.conn.send_control_message(b, Reply::new(StatusCode::Continue));
        assert_eq!(late, Err(ErrorKind::ReplyStarted));

        c.event(Event::Finished(b));
        assert_eq!(c.wire(), ok("B"));
        assert_eq!(c.conn.state(), ConnState::ParsingRequests);
    }

    #[test]
    fn control_messages_skip_http10_clients() {
        let mut c = Client::new();
        c.send(b"POST / HTTP/1.0\r\nContent-Length: 2\r\n\r\n");
        let p = c.dispatched()[0].0;

        c.event(Event::ControlMessage { handle: p, reply: Reply::new(StatusCode::Continue) });
        assert_eq!(c.wire(), "");
        assert!(c.take_log().contains(&Action::Resume(p)));

        c.send(b"hi");
        assert_eq!(c.body_data(), b"hi");
        c.reply(p, "ok");
        assert_eq!(c.wire(), "HTTP/1.0 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok");
        assert_eq!(c.take_log().last(), Some(&Action::Close));
    }

    #[test]
    fn graceful_shutdown() {
        let mut idle = Client::new();
        idle.event(Event::StartShutdown);
        assert_eq!(idle.take_log(), [Action::Close]);

        let mut c = Client::with(|l| l.conn.pipeline_prefetch = 0);
        c.send(TWO_GETS);
        let dispatched = c.dispatched();
        assert_eq!(targets(&dispatched), ["/a"]);

        c.event(Event::StartShutdown);
        assert_eq!(c.conn.state(), ConnState::Draining);
        assert!(!c.conn.wants_read());

        c.reply(dispatched[0].0, "A");
        assert_eq!(c.wire(), "HTTP/1.1 200 OK\r\ncontent-length: 1\r\nconnection: close\r\n\r\nA");
        assert!(c.dispatched().is_empty());
        assert_eq!(c.take_log().last(), Some(&Action::Close));
    }

    #[test]
    fn ending_shutdown_cancels_in_flight() {
        let mut c = Client::new();
        c.send(TWO_GETS);
        let dispatched = c.dispatched();
        c.event(Event::StartShutdown);

        c.event(Event::EndingShutdown);
        let log = c.take_log();
        for (handle, _) in dispatched {
            assert!(log.contains(&Action::Cancel(handle)));
        }
        assert_eq!(log.last(), Some(&Action::Close));
        assert_eq!(c.conn.state(), ConnState::Closed);
        assert_eq!(c.wire(), "");
    }

    fn behind_balancer(peer: &str) -> Client {
        let mut limits = Limits::default();
        limits.conn.proxy_protocol = true;
        limits.conn.proxy_protocol_trusted = vec!["10.0.0.1".parse().unwrap()];

        let conn = Connection::new(Arc::new(limits)).with_peer(peer.parse().unwrap());
        Client::from(conn)
    }

    #[test]
    fn proxy_protocol_header() {
        let mut c = behind_balancer("10.0.0.1:9000");
        assert_eq!(c.conn.client_addr(), Some("10.0.0.1:9000".parse().unwrap()));

        c.send(b"PROXY TCP4 192.0.2.1 198.51");
        assert!(c.take_log().is_empty());
        assert!(c.conn.proxied_client().is_none());

        c.send(b".100.7 56324 3128\r\nGET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(targets(&c.dispatched()), ["/"]);
        assert_eq!(c.conn.client_addr(), Some("192.0.2.1:56324".parse().unwrap()));
        assert_eq!(c.conn.peer_addr(), Some("10.0.0.1:9000".parse().unwrap()));

        // Only the first bytes of the connection carry the header.
        let p = c.conn.proxied_client().copied();
        c.send(b"GET /next HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(c.conn.proxied_client().copied(), p);
    }

    #[test]
    fn proxy_protocol_rejections() {
        #[rustfmt::skip]
        let cases: [(&[u8], &str); 3] = [
            (b"GET / HTTP/1.1\r\nHost: x\r\n\r\n",                      "10.0.0.1:9000"),
            (b"PROXY TCP4 not-an-address 198.51.100.7 1 2\r\n",            "10.0.0.1:9000"),
            (b"PROXY TCP4 192.0.2.1 198.51.100.7 56324 3128\r\n",          "10.0.0.2:9000"),
        ];

        for (input, peer) in cases {
            let mut c = behind_balancer(peer);
            c.send(input);

            assert!(c.dispatched().is_empty(), "{input:?}");
            assert_eq!(c.take_log().last(), Some(&Action::Close));
            assert_eq!(c.wire(), "");
            assert!(c.conn.proxied_client().is_none());
        }
    }
}
