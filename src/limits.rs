//! Parser, connection and interception limits
//!
//! # Security-First Defaults
//!
//! Default limits are intentionally conservative to prevent:
//! - Unbounded buffering of attacker-controlled request lines and heads
//! - Header flooding
//! - Oversized chunk announcements
//! - Slowloris-style idle clients
//!
//! Everything a client controls is bounded by one of the fields below, and
//! every bound has a distinct error reply (see [`ErrorKind`](crate::ErrorKind)).
//!
//! # Loading
//!
//! All structs deserialize with `#[serde(default)]`, so a config file only
//! names what it changes. Durations are written in milliseconds.
//!
//! ```
//! use pipeconn::limits::Limits;
//!
//! let limits = Limits::from_toml(r#"
//!     [req]
//!     header_count = 64
//!     http09 = true
//!
//!     [conn]
//!     pipeline_prefetch = 4
//!     socket_read_timeout = 5000
//! "#).unwrap();
//!
//! assert_eq!(limits.conn.pipeline_prefetch, 4);
//! assert_eq!(limits.req.method_size, 32);
//! ```

use serde::Deserialize;
use std::{fs, io, net::IpAddr, path::Path, time::Duration};
use thiserror::Error;

/// Request parsing limits.
///
/// Applies to the request line, the header section and the request body
/// framing of every request read from a client connection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReqLimits {
    /// Empty lines tolerated before a request line (default: `8`)
    ///
    /// Clients sometimes send a stray `CRLF` after a body; a bounded number
    /// is skipped, more than that is
    /// [`TooMuchGarbage`](crate::ErrorKind::TooMuchGarbage).
    pub max_leading_garbage: usize,

    /// Maximum method token length (default: `32`)
    pub method_size: usize,

    /// Maximum request-target length (default: `8192`)
    ///
    /// Absolute-form targets sent to a proxy are longer than origin-form
    /// paths, so this is larger than a typical origin server would use.
    pub url_size: usize,

    /// Maximum request line length including `CRLF` (default: `8448`)
    ///
    /// Once this many bytes are buffered without a line terminator the
    /// request fails with [`RequestLineTooLong`](crate::ErrorKind::RequestLineTooLong)
    /// instead of waiting for more data.
    pub request_line_size: usize,

    /// Maximum size of the whole request head, request line included (default: `65536`)
    pub header_size: usize,

    /// Maximum number of header fields (default: `100`)
    pub header_count: usize,

    /// Maximum `Content-Length` accepted (default: `64 MiB`)
    pub body_size: u64,

    /// Maximum size of a single chunk in a chunked body (default: `16 MiB`)
    pub max_chunk_size: u64,

    /// Maximum length of a chunk-size line, extensions included (default: `4096`)
    pub chunk_line_size: usize,

    /// Accept the header-less `GET /path\r\n` form (default: `false`)
    pub http09: bool,

    #[doc(hidden)]
    #[serde(skip)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ReqLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            max_leading_garbage: 8,
            method_size: 32,
            url_size: 8192,
            request_line_size: 8192 + 256,
            header_size: 64 * 1024,
            header_count: 100,
            body_size: 64 * 1024 * 1024,
            max_chunk_size: 16 * 1024 * 1024,
            chunk_line_size: 4096,
            http09: false,

            _priv: (),
        }
    }
}

/// Connection-level limits and timeouts
///
/// Controls buffering, pipelining depth and the lifetime of idle clients.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConnLimits {
    /// Maximum unconsumed client bytes held by one connection (default: `128 KiB`)
    ///
    /// A request head that does not fit is answered with
    /// [`HeadersTooLarge`](crate::ErrorKind::HeadersTooLarge). Request body
    /// bytes are not read past this bound until the body consumer frees space.
    pub input_buffer_size: usize,

    /// Requests parsed ahead of the one currently answered (default: `1`)
    ///
    /// The pipeline holds at most `1 + pipeline_prefetch` contexts. With `0`
    /// pipelined requests stay in the buffer until the head finishes.
    pub pipeline_prefetch: usize,

    /// Maximum wait for client bytes while a read is wanted (default: `10 seconds`)
    ///
    /// Expiry behaves like the client closing its sending half.
    #[serde(deserialize_with = "millis")]
    pub socket_read_timeout: Duration,

    /// Maximum duration of one socket write (default: `3 seconds`)
    #[serde(deserialize_with = "millis")]
    pub socket_write_timeout: Duration,

    /// Format for error replies (default: `true`)
    ///
    /// # Examples
    /// If `true`, then on error the connection writes:
    /// ```text
    /// HTTP/1.1 400 Bad Request\r
    /// connection: close\r
    /// content-length: 55\r
    /// content-type: application/json\r
    /// \r
    /// {"error":"Invalid HTTP method","code":"INVALID_METHOD"}
    /// ```
    /// If `false`, then on error the connection writes:
    /// ```text
    /// HTTP/1.1 400 Bad Request\r
    /// connection: close\r
    /// content-length: 0\r
    /// \r
    /// ```
    pub json_errors: bool,

    /// Keep an answered context at the head until its request body is read (default: `true`)
    ///
    /// A collaborator may finish its reply before the client has sent the
    /// whole request body. When `true` the context leaves the pipeline only
    /// after the body is consumed, so the next request cannot be answered
    /// first. When `false` it leaves as soon as its reply is written; the
    /// next request is still parsed only after the body bytes are gone.
    pub hold_context_until_body_read: bool,

    /// Expect a PROXY protocol header (v1 or v2) before the first request (default: `false`)
    ///
    /// The header names the real client behind a load balancer. A
    /// connection that starts with anything else is closed without a reply.
    pub proxy_protocol: bool,

    /// Peers allowed to send the PROXY protocol header (default: empty, any peer)
    ///
    /// Only checked when the peer address of the connection is known.
    pub proxy_protocol_trusted: Vec<IpAddr>,

    #[doc(hidden)]
    #[serde(skip)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            input_buffer_size: 128 * 1024,
            pipeline_prefetch: 1,
            socket_read_timeout: Duration::from_secs(10),
            socket_write_timeout: Duration::from_secs(3),
            json_errors: true,
            hold_context_until_body_read: true,
            proxy_protocol: false,
            proxy_protocol_trusted: Vec::new(),

            _priv: (),
        }
    }
}

/// What to do with a `CONNECT` tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BumpMode {
    /// Relay the tunnel as opaque bytes without inspecting it.
    None,
    /// Peek at the client hello and let the policy verdict decide.
    Peek,
    /// Splice the tunnel, recording the decision.
    Splice,
    /// Intercept: terminate TLS with a generated certificate.
    Bump,
}

/// Fallback when no certificate can be produced for a bumped tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateFallback {
    Splice,
    Close,
}

/// TLS interception policy for `CONNECT` tunnels.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BumpLimits {
    /// Decision taken when a `CONNECT` request is dispatched (default: `None`)
    pub mode: BumpMode,

    /// Used when the certificate collaborator fails (default: `Close`)
    pub on_certificate_error: CertificateFallback,

    #[doc(hidden)]
    #[serde(skip)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for BumpLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            mode: BumpMode::None,
            on_certificate_error: CertificateFallback::Close,

            _priv: (),
        }
    }
}

/// Every limit a connection is created with.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub req: ReqLimits,
    pub conn: ConnLimits,
    pub bump: BumpLimits,
}

/// Error type for limits loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Validation failed: {0}")]
    Invalid(&'static str),
}

impl Limits {
    /// Parses and validates limits from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let limits: Limits = toml::from_str(text)?;
        limits.validate()?;
        Ok(limits)
    }

    /// Reads, parses and validates a TOML limits file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Rejects combinations under which no request could ever be parsed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let (req, conn) = (&self.req, &self.conn);

        if req.method_size == 0 || req.url_size == 0 {
            return Err(ConfigError::Invalid("method_size and url_size must be non-zero"));
        }
        if req.request_line_size <= req.method_size + req.url_size {
            return Err(ConfigError::Invalid(
                "request_line_size must exceed method_size + url_size",
            ));
        }
        if req.header_size < req.request_line_size {
            return Err(ConfigError::Invalid("header_size must cover request_line_size"));
        }
        if conn.input_buffer_size < req.header_size {
            return Err(ConfigError::Invalid("input_buffer_size must cover header_size"));
        }
        if req.chunk_line_size < 3 {
            return Err(ConfigError::Invalid("chunk_line_size must be at least 3"));
        }
        if conn.socket_read_timeout.is_zero() {
            return Err(ConfigError::Invalid("socket_read_timeout must be non-zero"));
        }

        Ok(())
    }
}

fn millis<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}
