//! Tokio driver running a [`Connection`] over a byte stream.
//!
//! The driver owns the socket. It reads while the connection
//! [wants input](Connection::wants_read), carries out queued [`Action`]s in
//! order, and funnels everything reported by dispatch tasks back as
//! [`Event`]s. Each parsed request is handed to a [`Dispatcher`] in its own
//! task, together with a [`ReplySink`] and, when it has one, a [`BodyReader`].

use crate::{
    errors::ErrorKind,
    http::{request::Request, response::Reply},
    limits::Limits,
    server::{
        bump::{BumpVerdict, CertificateProvider, TlsContext},
        connection::{Action, Connection, ConnectionId, Event},
        context::ContextHandle,
        pinning::PinnedSlot,
    },
};
use crossbeam::queue::SegQueue;
use socket2::{SockRef, TcpKeepalive};
use std::{
    collections::HashMap,
    future::Future,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::{mpsc, watch, Notify},
    time::timeout,
};
use tracing::{debug, trace};

/// Collaborator answering parsed requests.
///
/// # Examples
/// ```
/// use pipeconn::{server::driver::{Dispatcher, Exchange}, Reply, StatusCode};
///
/// struct Hello;
///
/// impl Dispatcher for Hello {
///     async fn dispatch(&self, mut exchange: Exchange) {
///         let reply = Reply::new(StatusCode::Ok).content_length(5);
///         if exchange.reply.send_start_of_message(reply, b"hello").await.is_ok() {
///             exchange.reply.finished();
///         }
///     }
/// }
/// ```
pub trait Dispatcher: Send + Sync + 'static {
    /// Produces the reply of one request. Runs in its own task; replies are
    /// still written to the client in request order.
    fn dispatch(&self, exchange: Exchange) -> impl Future<Output = ()> + Send;

    /// Looks at the first client bytes of a peeked tunnel.
    ///
    /// `None` waits for more bytes.
    #[inline]
    fn bump_verdict(&self, client_hello: &[u8]) -> Option<BumpVerdict> {
        let _ = client_hello;
        None
    }
}

/// One request handed to the [`Dispatcher`].
pub struct Exchange {
    pub connection: ConnectionId,
    /// The client, as announced by a PROXY protocol header or seen on the socket.
    pub client: Option<SocketAddr>,
    pub handle: ContextHandle,
    pub request: Arc<Request>,
    /// Present when the request has a body.
    pub body: Option<BodyReader>,
    pub reply: ReplySink,
    /// Pinning record of the client connection.
    pub pinning: PinnedSlot,
    pub control: Control,
}

struct Funnel {
    events: SegQueue<Event>,
    notify: Notify,
}

impl Funnel {
    #[inline]
    fn push(&self, event: Event) {
        self.events.push(event);
        self.notify.notify_one();
    }
}

/// Connection-wide notifications from outside the request flow.
#[derive(Clone)]
pub struct Control(Arc<Funnel>);

impl Control {
    /// The upstream closed the idle pinned connection.
    pub fn pinned_connection_closed(&self) {
        self.0.push(Event::PinnedConnectionClosed)
    }

    /// Delivers the policy verdict of a peeked tunnel.
    pub fn bump_verdict(&self, verdict: BumpVerdict) {
        self.0.push(Event::BumpVerdict(verdict))
    }

    pub fn kick(&self) {
        self.0.push(Event::Kick)
    }
}

struct Shared {
    resume: Notify,
    cancelled: AtomicBool,
}

impl Shared {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.resume.notify_one();
    }

    #[inline]
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Reply side of one transaction.
///
/// Every send waits until the connection accepts the next piece. Dropping
/// the sink without [`finished`](ReplySink::finished) aborts the reply and
/// the client connection closes after it.
pub struct ReplySink {
    handle: ContextHandle,
    funnel: Arc<Funnel>,
    shared: Arc<Shared>,
    finished: bool,
}

impl ReplySink {
    /// Sends an interim `1xx` reply, such as `100 Continue` for a request
    /// that [expects it](Request::expects_continue).
    pub async fn send_control_message(&mut self, reply: Reply) -> Result<(), ErrorKind> {
        self.send(Event::ControlMessage {
            handle: self.handle,
            reply,
        })
        .await
    }

    pub async fn send_start_of_message(
        &mut self,
        reply: Reply,
        body: &[u8],
    ) -> Result<(), ErrorKind> {
        self.send(Event::StartOfMessage {
            handle: self.handle,
            reply,
            body: body.to_vec(),
        })
        .await
    }

    pub async fn send_body(&mut self, data: &[u8]) -> Result<(), ErrorKind> {
        self.send(Event::Body {
            handle: self.handle,
            data: data.to_vec(),
        })
        .await
    }

    async fn send(&mut self, event: Event) -> Result<(), ErrorKind> {
        if self.shared.is_cancelled() {
            return Err(ErrorKind::ContextGone);
        }

        self.funnel.push(event);
        self.shared.resume.notified().await;

        match self.shared.is_cancelled() {
            true => Err(ErrorKind::ContextGone),
            false => Ok(()),
        }
    }

    /// The reply cannot be completed; the connection closes after it.
    pub fn note_io_error(&self, kind: io::ErrorKind) {
        self.funnel.push(Event::IoError {
            handle: self.handle,
            kind,
        })
    }

    pub fn finished(mut self) {
        self.finished = true;
        self.funnel.push(Event::Finished(self.handle));
    }
}

impl Drop for ReplySink {
    fn drop(&mut self) {
        if !self.finished {
            self.note_io_error(io::ErrorKind::Interrupted);
            self.funnel.push(Event::Finished(self.handle));
        }
    }
}

type BodyItem = Result<Vec<u8>, ErrorKind>;

/// Request body of one transaction, dechunked.
///
/// Dropping the reader before the end makes the connection discard the
/// rest of the body.
pub struct BodyReader {
    handle: ContextHandle,
    funnel: Arc<Funnel>,
    rx: mpsc::UnboundedReceiver<BodyItem>,
    done: bool,
}

impl BodyReader {
    /// Next piece of the body; `None` at its end.
    pub async fn recv(&mut self) -> Option<Result<Vec<u8>, ErrorKind>> {
        let item = self.rx.recv().await;

        match &item {
            Some(Ok(data)) => self.funnel.push(Event::BodySpaceAvailable {
                handle: self.handle,
                bytes: data.len(),
            }),
            Some(Err(_)) | None => self.done = true,
        }
        item
    }

    /// Reads the rest of the body.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, ErrorKind> {
        let mut out = Vec::new();
        while let Some(data) = self.recv().await {
            out.extend_from_slice(&data?);
        }
        Ok(out)
    }
}

impl Drop for BodyReader {
    fn drop(&mut self) {
        if !self.done {
            self.funnel.push(Event::BodyConsumerAborted(self.handle));
        }
    }
}

/// How [`Driver::serve`] left the stream.
pub enum RunOutcome<S> {
    /// The connection is over and the stream was shut down.
    Closed,
    /// Relay `stream` untouched; `leftover` was already read from it.
    Splice { stream: S, leftover: Vec<u8> },
    /// Terminate TLS on `stream`, then resume `connection` with
    /// [`Driver::serve_connection`] over the decrypted stream.
    StartTls {
        stream: S,
        leftover: Vec<u8>,
        context: TlsContext,
        connection: Connection,
    },
}

enum Exit {
    Closed,
    Splice(Vec<u8>),
    StartTls(TlsContext, Vec<u8>),
}

#[derive(Default)]
struct Transaction {
    shared: Option<Arc<Shared>>,
    body: Option<mpsc::UnboundedSender<BodyItem>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shutdown {
    Running,
    Graceful,
    Immediate,
}

/// Serves client connections with one [`Dispatcher`].
pub struct Driver<D> {
    dispatcher: Arc<D>,
    limits: Arc<Limits>,
    certificates: Option<Arc<dyn CertificateProvider>>,
    shutdown: watch::Sender<Shutdown>,
}

impl<D: Dispatcher> Driver<D> {
    pub fn new(dispatcher: D, limits: Limits) -> Self {
        let (shutdown, _) = watch::channel(Shutdown::Running);
        Driver {
            dispatcher: Arc::new(dispatcher),
            limits: Arc::new(limits),
            certificates: None,
            shutdown,
        }
    }

    pub fn with_certificates(mut self, provider: Arc<dyn CertificateProvider>) -> Self {
        self.certificates = Some(provider);
        self
    }

    /// Stops every served connection from accepting new requests; each
    /// closes once its pipeline drains.
    pub fn start_shutdown(&self) {
        self.shutdown.send_if_modified(|state| {
            let changed = *state == Shutdown::Running;
            if changed {
                *state = Shutdown::Graceful;
            }
            changed
        });
    }

    /// Closes every served connection now.
    pub fn ending_shutdown(&self) {
        self.shutdown.send_replace(Shutdown::Immediate);
    }

    /// Applies socket options, then serves `stream`.
    pub async fn serve_tcp(&self, stream: TcpStream) -> RunOutcome<TcpStream> {
        if let Err(e) = configure_socket(&stream) {
            debug!(error = %e, "socket options not applied");
        }

        let mut conn = self.connection();
        match stream.peer_addr() {
            Ok(peer) => conn = conn.with_peer(peer),
            Err(e) => debug!(conn = %conn.id(), error = %e, "peer address unknown"),
        }
        self.serve_connection(stream, conn).await
    }

    pub async fn serve<S>(&self, stream: S) -> RunOutcome<S>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.serve_connection(stream, self.connection()).await
    }

    fn connection(&self) -> Connection {
        let conn = Connection::new(self.limits.clone());
        match &self.certificates {
            Some(provider) => conn.with_certificates(provider.clone()),
            None => conn,
        }
    }

    /// Runs `conn` over `stream` until it closes or hands the stream off.
    pub async fn serve_connection<S>(&self, mut stream: S, mut conn: Connection) -> RunOutcome<S>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let funnel = Arc::new(Funnel {
            events: SegQueue::new(),
            notify: Notify::new(),
        });
        let mut transactions: HashMap<ContextHandle, Transaction> = HashMap::new();
        let mut buf = vec![0; 16 * 1024];

        let (read_timeout, write_timeout) = (
            conn.limits().conn.socket_read_timeout,
            conn.limits().conn.socket_write_timeout,
        );
        debug!(conn = %conn.id(), "serving");
        let mut shutdown = self.shutdown.subscribe();
        let mut stage = Shutdown::Running;
        let requested = *shutdown.borrow_and_update();
        apply_shutdown(&mut conn, &mut stage, requested);
        conn.kick();

        let exit = loop {
            if let Some(exit) = self
                .run_actions(&mut stream, &mut conn, &funnel, &mut transactions, write_timeout)
                .await
            {
                break exit;
            }

            if funnel.events.is_empty() {
                let wants_read = conn.wants_read();

                tokio::select! {
                    read = timeout(read_timeout, stream.read(&mut buf)), if wants_read => {
                        let event = match read {
                            Ok(Ok(0)) => Event::ReadEof,
                            Ok(Ok(n)) => Event::Received(buf[..n].to_vec()),
                            Ok(Err(e)) => Event::ReadError(e.kind()),
                            Err(_) => Event::Timeout,
                        };
                        conn.handle(event);
                    }
                    _ = funnel.notify.notified() => {}
                    Ok(()) = shutdown.changed(), if stage != Shutdown::Immediate => {
                        let requested = *shutdown.borrow_and_update();
                        apply_shutdown(&mut conn, &mut stage, requested);
                    }
                }
            }

            while let Some(event) = funnel.events.pop() {
                trace!(conn = %conn.id(), ?event, "event");
                conn.handle(event);
            }
        };

        for (_, transaction) in transactions.drain() {
            if let Some(shared) = transaction.shared {
                shared.cancel();
            }
        }

        match exit {
            Exit::Closed => RunOutcome::Closed,
            Exit::Splice(leftover) => RunOutcome::Splice { stream, leftover },
            Exit::StartTls(context, leftover) => RunOutcome::StartTls {
                stream,
                leftover,
                context,
                connection: conn,
            },
        }
    }

    async fn run_actions<S>(
        &self,
        stream: &mut S,
        conn: &mut Connection,
        funnel: &Arc<Funnel>,
        transactions: &mut HashMap<ContextHandle, Transaction>,
        write_timeout: Duration,
    ) -> Option<Exit>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        while let Some(action) = conn.poll_action() {
            match action {
                Action::Dispatch {
                    handle,
                    request,
                    has_body,
                } => {
                    let shared = Arc::new(Shared {
                        resume: Notify::new(),
                        cancelled: AtomicBool::new(false),
                    });
                    let (body, reader) = match has_body {
                        true => {
                            let (tx, rx) = mpsc::unbounded_channel();
                            let reader = BodyReader {
                                handle,
                                funnel: funnel.clone(),
                                rx,
                                done: false,
                            };
                            (Some(tx), Some(reader))
                        }
                        false => (None, None),
                    };

                    let exchange = Exchange {
                        connection: conn.id(),
                        client: conn.client_addr(),
                        handle,
                        request,
                        body: reader,
                        reply: ReplySink {
                            handle,
                            funnel: funnel.clone(),
                            shared: shared.clone(),
                            finished: false,
                        },
                        pinning: conn.pinning().clone(),
                        control: Control(funnel.clone()),
                    };
                    transactions.insert(
                        handle,
                        Transaction {
                            shared: Some(shared),
                            body,
                        },
                    );

                    let dispatcher = self.dispatcher.clone();
                    tokio::spawn(async move { dispatcher.dispatch(exchange).await });
                }

                Action::Write { handle, data } => {
                    let event = match timeout(write_timeout, stream.write_all(&data)).await {
                        Ok(Ok(())) => Event::Written(handle),
                        Ok(Err(e)) => Event::WriteError {
                            handle,
                            kind: e.kind(),
                        },
                        Err(_) => Event::WriteError {
                            handle,
                            kind: io::ErrorKind::TimedOut,
                        },
                    };
                    conn.handle(event);
                }
                Action::Resume(handle) => {
                    if let Some(shared) = transactions.get(&handle).and_then(|t| t.shared.as_ref()) {
                        shared.resume.notify_one();
                    }
                }

                Action::BodyData { handle, data } => {
                    if let Some(tx) = transactions.get(&handle).and_then(|t| t.body.as_ref()) {
                        let _ = tx.send(Ok(data));
                    }
                }
                Action::BodyEnd(handle) => {
                    if let Some(transaction) = transactions.get_mut(&handle) {
                        transaction.body = None;
                    }
                }
                Action::BodyAborted { handle, error } => {
                    if let Some(tx) = transactions.get_mut(&handle).and_then(|t| t.body.take()) {
                        let _ = tx.send(Err(error));
                    }
                }

                Action::Peek { data } => {
                    if let Some(verdict) = self.dispatcher.bump_verdict(&data) {
                        conn.handle(Event::BumpVerdict(verdict));
                    }
                }
                Action::Splice { leftover } => {
                    debug!(conn = %conn.id(), "stream handed off for splicing");
                    return Some(Exit::Splice(leftover));
                }
                Action::StartTls { context, leftover } => {
                    debug!(conn = %conn.id(), host = %context.host, "stream handed off for TLS");
                    return Some(Exit::StartTls(context, leftover));
                }

                Action::Cancel(handle) => {
                    if let Some(shared) = transactions.remove(&handle).and_then(|t| t.shared) {
                        shared.cancel();
                    }
                }
                Action::Close => {
                    if let Err(e) = stream.shutdown().await {
                        trace!(conn = %conn.id(), error = %e, "shutdown failed");
                    }
                    return Some(Exit::Closed);
                }
            }
        }

        // Transactions that left the pipeline are done with their sinks.
        transactions.retain(|handle, t| {
            let live = conn.is_in_flight(*handle) || t.body.is_some();
            if !live {
                if let Some(shared) = &t.shared {
                    shared.cancel();
                }
            }
            live
        });
        None
    }
}

fn apply_shutdown(conn: &mut Connection, stage: &mut Shutdown, to: Shutdown) {
    match (*stage, to) {
        (Shutdown::Running, Shutdown::Graceful) => conn.handle(Event::StartShutdown),
        (Shutdown::Running | Shutdown::Graceful, Shutdown::Immediate) => {
            conn.handle(Event::EndingShutdown)
        }
        _ => return,
    }
    *stage = to;
}

/// Enables `TCP_NODELAY` and TCP keepalive probes on an accepted client socket.
pub fn configure_socket(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;

    let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(60));
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}
