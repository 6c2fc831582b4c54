//! pipeconn - client-side HTTP/1.x connection handling for forward proxies
//!
//! One [`Connection`] per accepted client socket: it parses pipelined
//! requests, dechunks request bodies, keeps replies in request order,
//! binds the client to a pinned upstream connection when authentication
//! requires it, and decides what happens to `CONNECT` tunnels.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1**: persistent connections, pipelining, chunked bodies both ways
//! - **HTTP/1.0**: `keep-alive` when asked for, close-delimited replies otherwise
//! - **HTTP/0.9**: [opt-in](limits::ReqLimits::http09), header-less `GET` only
//!
//! # Design
//!
//! - **Sans-IO core** - [`Connection`] consumes [`Event`]s and queues [`Action`]s, nothing else
//! - **Ordered replies** - only the pipeline head writes; later replies wait in a one-slot buffer
//! - **Bounded everything** - every byte count a client controls has a [limit](limits)
//! - **Async/await ready** - the [driver](server::driver) runs the core over any Tokio stream
//!
//! # Examples
//!
//! Driving the core by hand:
//! ```
//! use pipeconn::{limits::Limits, Action, Connection, Event, Reply, StatusCode};
//! use std::sync::Arc;
//!
//! let mut conn = Connection::new(Arc::new(Limits::default()));
//! conn.handle(Event::Received(
//!     b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n".to_vec(),
//! ));
//!
//! let mut handles = Vec::new();
//! while let Some(action) = conn.poll_action() {
//!     if let Action::Dispatch { handle, .. } = action {
//!         handles.push(handle);
//!     }
//! }
//! assert_eq!(handles.len(), 2);
//!
//! // The reply to `/b` is held back until `/a` is answered.
//! let reply = Reply::new(StatusCode::Ok).content_length(1);
//! conn.handle(Event::StartOfMessage { handle: handles[1], reply, body: b"b".to_vec() });
//! assert!(conn.poll_action().is_none());
//! ```
//!
//! Serving sockets:
//! ```no_run
//! use pipeconn::{limits::Limits, server::driver::{Dispatcher, Driver, Exchange}, Reply, StatusCode};
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! struct Forbid;
//!
//! impl Dispatcher for Forbid {
//!     async fn dispatch(&self, mut exchange: Exchange) {
//!         let reply = Reply::new(StatusCode::Forbidden);
//!         if exchange.reply.send_start_of_message(reply, b"").await.is_ok() {
//!             exchange.reply.finished();
//!         }
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let limits = Limits::load("limits.toml".as_ref()).unwrap_or_default();
//!     let driver = Arc::new(Driver::new(Forbid, limits));
//!     let listener = TcpListener::bind("127.0.0.1:3128").await.unwrap();
//!
//!     loop {
//!         let Ok((stream, _)) = listener.accept().await else {
//!             continue;
//!         };
//!         let driver = driver.clone();
//!         tokio::spawn(async move { driver.serve_tcp(stream).await });
//!     }
//! }
//! ```

pub(crate) mod http {
    pub(crate) mod chunked;
    pub(crate) mod proxy_protocol;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod tokenizer;
    pub(crate) mod types;
}
pub mod server {
    pub mod bump;
    pub mod connection;
    pub mod context;
    pub mod driver;
    pub mod pinning;
    pub(crate) mod pipeline;
}
pub(crate) mod errors;
pub mod limits;

pub use crate::{
    errors::{ErrorKind, IoError},
    http::{
        chunked::{encode_chunk, ChunkedDecoder, Decoded, LAST_CHUNK},
        proxy_protocol::ProxiedClient,
        request::{Framing, ParseOutcome, Request, RequestParser},
        response::{BodyLength, Reply},
        types::{Header, Method, StatusCode, Version},
    },
    server::{
        bump::{
            BumpState, BumpVerdict, CertificateError, CertificateProvider, ConnectionMode,
            TlsContext,
        },
        connection::{Action, ConnState, Connection, ConnectionId, Event},
        context::{ContextHandle, Phase},
        pinning::{Pin, PinnedConnection, PinnedSlot, UpstreamConnection},
    },
};
