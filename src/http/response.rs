//! Reply heads handed to the connection by the dispatch collaborator.

use crate::http::types::{StatusCode, Version};
use std::fmt::Display;

/// How the reply body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    /// No body; `content-length: 0` unless the status is bodiless.
    Empty,
    Length(u64),
    Chunked,
    /// The body ends when the connection closes.
    UntilClose,
}

/// Reply status line and headers.
///
/// Built by value and passed to
/// [`ReplySink::send_start_of_message`](crate::server::driver::ReplySink::send_start_of_message)
/// (or [`Connection::send_start_of_message`](crate::Connection::send_start_of_message)).
/// Framing and persistence headers are written by the connection, which
/// knows the client's protocol version and whether it may reuse the socket.
///
/// # Examples
/// ```
/// use pipeconn::{Reply, StatusCode};
///
/// let reply = Reply::new(StatusCode::Ok)
///     .header("content-type", "text/plain")
///     .header("x-cache", "MISS")
///     .content_length(13);
///
/// assert_eq!(reply.status(), StatusCode::Ok);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: BodyLength,
    keep_alive: bool,
}

impl Reply {
    #[inline]
    pub fn new(status: StatusCode) -> Self {
        Reply {
            status,
            headers: Vec::new(),
            body: BodyLength::Empty,
            keep_alive: true,
        }
    }

    /// Adds a header to the reply.
    ///
    /// PLEASE DO NOT ADD THE FOLLOWING HEADINGS:
    /// - `content-length` - use [`content_length()`](Reply::content_length)
    /// - `transfer-encoding` - use [`chunked()`](Reply::chunked)
    /// - `connection` - use [`close()`](Reply::close)
    ///
    /// # Panics
    /// Error message: `Framing headers are set by the connection`
    ///
    /// Panics in `debug` mode when one of the headers above is added.
    #[inline]
    #[track_caller]
    pub fn header<V: Display>(mut self, name: &str, value: V) -> Self {
        debug_assert!(
            !["content-length", "transfer-encoding", "connection"]
                .iter()
                .any(|h| name.eq_ignore_ascii_case(h)),
            "Framing headers are set by the connection"
        );

        self.headers.push((name.to_owned(), value.to_string()));
        self
    }

    #[inline]
    pub fn content_length(mut self, len: u64) -> Self {
        self.body = match len {
            0 => BodyLength::Empty,
            len => BodyLength::Length(len),
        };
        self
    }

    /// Body of unknown length, chunk-encoded for `HTTP/1.1` clients.
    #[inline]
    pub fn chunked(mut self) -> Self {
        self.body = BodyLength::Chunked;
        self
    }

    /// Body delimited by closing the connection.
    #[inline]
    pub fn until_close(mut self) -> Self {
        self.body = BodyLength::UntilClose;
        self.keep_alive = false;
        self
    }

    /// Forces the connection to close after this reply.
    #[inline]
    pub fn close(mut self) -> Self {
        self.keep_alive = false;
        self
    }

    #[inline(always)]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    #[inline(always)]
    pub const fn body_length(&self) -> BodyLength {
        self.body
    }

    #[inline(always)]
    pub const fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Serializes an interim `1xx` head: status line and headers, no framing.
    pub(crate) fn encode_interim(&self, version: Version, out: &mut Vec<u8>) {
        out.extend_from_slice(self.status.into_first_line(version));
        self.encode_headers(out);
        out.extend_from_slice(b"\r\n");
    }

    fn encode_headers(&self, out: &mut Vec<u8>) {
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }

    /// Serializes the head for a client speaking `version`.
    ///
    /// Returns the framing actually used and whether the connection may be
    /// reused afterwards. `HTTP/0.9` gets no head at all and a raw body.
    /// A `2xx` answer to `CONNECT` (`tunnel`) carries no framing headers.
    pub(crate) fn encode_head(
        &self,
        version: Version,
        client_keep_alive: bool,
        tunnel: bool,
        out: &mut Vec<u8>,
    ) -> (BodyLength, bool) {
        if version == Version::Http09 {
            return (BodyLength::UntilClose, false);
        }

        let tunnel = tunnel && (200..300).contains(&self.status.as_u16());
        let body = match (self.body, version) {
            _ if tunnel || self.status.is_bodiless() => BodyLength::Empty,
            (BodyLength::Chunked, Version::Http10) => BodyLength::UntilClose,
            (body, _) => body,
        };
        let keep_alive =
            client_keep_alive && self.keep_alive && body != BodyLength::UntilClose;

        out.extend_from_slice(self.status.into_first_line(version));
        self.encode_headers(out);

        match body {
            BodyLength::Empty if tunnel || self.status.is_bodiless() => {}
            BodyLength::Empty => out.extend_from_slice(b"content-length: 0\r\n"),
            BodyLength::Length(len) => {
                out.extend_from_slice(format!("content-length: {len}\r\n").as_bytes())
            }
            BodyLength::Chunked => out.extend_from_slice(b"transfer-encoding: chunked\r\n"),
            BodyLength::UntilClose => {}
        }

        match (keep_alive, version) {
            (false, _) => out.extend_from_slice(b"connection: close\r\n"),
            (true, Version::Http10) => out.extend_from_slice(b"connection: keep-alive\r\n"),
            (true, _) => {}
        }

        out.extend_from_slice(b"\r\n");
        (body, keep_alive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::*;

    fn head(reply: &Reply, version: Version, keep_alive: bool) -> (String, BodyLength, bool) {
        let mut out = Vec::new();
        let (body, keep_alive) = reply.encode_head(version, keep_alive, false, &mut out);
        (str_op(&out).to_owned(), body, keep_alive)
    }

    #[test]
    fn heads() {
        let ok = Reply::new(StatusCode::Ok).header("x-id", 7);

        #[rustfmt::skip]
        let cases = [
            (ok.clone().content_length(11), Version::Http11, true,
                "HTTP/1.1 200 OK\r\nx-id: 7\r\ncontent-length: 11\r\n\r\n", BodyLength::Length(11), true),
            (ok.clone(), Version::Http11, true,
                "HTTP/1.1 200 OK\r\nx-id: 7\r\ncontent-length: 0\r\n\r\n", BodyLength::Empty, true),
            (ok.clone().chunked(), Version::Http11, true,
                "HTTP/1.1 200 OK\r\nx-id: 7\r\ntransfer-encoding: chunked\r\n\r\n", BodyLength::Chunked, true),
            (ok.clone().chunked(), Version::Http10, true,
                "HTTP/1.0 200 OK\r\nx-id: 7\r\nconnection: close\r\n\r\n", BodyLength::UntilClose, false),
            (ok.clone().content_length(2), Version::Http10, true,
                "HTTP/1.0 200 OK\r\nx-id: 7\r\ncontent-length: 2\r\nconnection: keep-alive\r\n\r\n",
                BodyLength::Length(2), true),
            (ok.clone().content_length(2), Version::Http11, false,
                "HTTP/1.1 200 OK\r\nx-id: 7\r\ncontent-length: 2\r\nconnection: close\r\n\r\n",
                BodyLength::Length(2), false),
            (ok.clone().close(), Version::Http11, true,
                "HTTP/1.1 200 OK\r\nx-id: 7\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                BodyLength::Empty, false),
            (Reply::new(StatusCode::NotModified).content_length(5), Version::Http11, true,
                "HTTP/1.1 304 Not Modified\r\n\r\n", BodyLength::Empty, true),
            (ok.clone().content_length(3), Version::Http09, true,
                "", BodyLength::UntilClose, false),
        ];

        for (reply, version, keep_alive, text, body, reuse) in cases {
            assert_eq!(head(&reply, version, keep_alive), (text.to_owned(), body, reuse));
        }
    }

    #[test]
    fn tunnel_heads() {
        #[rustfmt::skip]
        let cases = [
            (Reply::new(StatusCode::Ok), "HTTP/1.1 200 OK\r\n\r\n"),
            (Reply::new(StatusCode::Ok).header("via", "1.1 proxy"),
                "HTTP/1.1 200 OK\r\nvia: 1.1 proxy\r\n\r\n"),
            (Reply::new(StatusCode::Forbidden),
                "HTTP/1.1 403 Forbidden\r\ncontent-length: 0\r\n\r\n"),
        ];

        for (reply, text) in cases {
            let mut out = Vec::new();
            reply.encode_head(Version::Http11, true, true, &mut out);
            assert_eq!(str_op(&out), text);
        }
    }

    #[test]
    fn interim_heads() {
        let mut out = Vec::new();
        Reply::new(StatusCode::Continue).encode_interim(Version::Http11, &mut out);
        Reply::new(StatusCode::EarlyHints)
            .header("link", "</style.css>; rel=preload")
            .content_length(9)
            .encode_interim(Version::Http11, &mut out);

        assert_eq!(
            str_op(&out),
            "HTTP/1.1 100 Continue\r\n\r\n\
             HTTP/1.1 103 Early Hints\r\nlink: </style.css>; rel=preload\r\n\r\n"
        );
    }

    #[test]
    #[should_panic(expected = "Framing headers are set by the connection")]
    fn framing_header_panics() {
        let _ = Reply::new(StatusCode::Ok).header("Content-Length", 3);
    }
}
