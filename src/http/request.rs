use crate::{
    errors::ErrorKind,
    http::{
        tokenizer::{Probe, Tokenizer, FIELD_VALUE, OWS, TOKEN, VCHAR},
        types::{self, Header},
    },
    limits::ReqLimits,
    Method, Version,
};
use std::mem;

/// One parsed request head.
///
/// Owns its data, so it outlives the connection buffer it was parsed from
/// and can be shared with the dispatch collaborator.
///
/// # Input data requirements
///
/// #### Character encoding
///
/// The entire head must be `UTF-8`; otherwise the request is rejected with
/// [`InvalidEncoding`](ErrorKind::InvalidEncoding).
///
/// #### General designations
/// - `SP`: ASCII space (0x20)
/// - `CRLF`: Carriage return + line feed (`"\r\n"`) - **exactly this sequence required**
///
///   Only the empty lines skipped before a request line may be a bare `LF`.
///
/// ## First line
/// | Version    | Template                                           | Example                       |
/// |------------|----------------------------------------------------|-------------------------------|
/// | `HTTP/1.x` | `[METHOD] SP [TARGET] SP "HTTP/" [VERSION] CRLF`   | `GET /api/users HTTP/1.1\r\n` |
/// | `HTTP/0.9` | `"GET" SP [TARGET] CRLF`                           | `GET /api/users\r\n`          |
///
/// `HTTP/0.9` is accepted only with [`ReqLimits::http09`] and has no headers.
///
/// ## Header
///
/// ```text
/// [NAME] ":" OWS [VALUE] OWS CRLF
/// ```
///
/// A line starting with `SP` or `HTAB` (obsolete line folding) is rejected,
/// never merged into the previous value.
///
/// The parser extracts semantics from these headers (all of them are kept):
///
/// | Header              | Purpose            | Values                                  |
/// |---------------------|--------------------|-----------------------------------------|
/// | `Content-Length`    | Body framing       | Digits; repeats must agree              |
/// | `Transfer-Encoding` | Body framing       | `chunked` only                          |
/// | `Connection`        | Persistence        | `close` / `keep-alive` tokens           |
/// | `Expect`            | Interim reply      | `100-continue`                          |
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    method: Method,
    target: String,
    version: Version,

    headers: Vec<Header>,
    content_length: Option<u64>,
    chunked: bool,
    keep_alive: bool,
    connection_close: bool,
    expect_continue: bool,
}

/// How the request body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Empty,
    Length(u64),
    Chunked,
}

impl Request {
    fn new(method: Method, target: String, version: Version) -> Self {
        Request {
            method,
            target,
            version,

            headers: Vec::new(),
            content_length: None,
            chunked: false,
            keep_alive: version.default_keep_alive(),
            connection_close: false,
            expect_continue: false,
        }
    }

    fn apply_framing(&mut self, header: &Header, limits: &ReqLimits) -> Result<(), ErrorKind> {
        if header.is("content-length") {
            let len = types::slice_to_usize(header.value.as_bytes())
                .ok_or(ErrorKind::InvalidContentLength)? as u64;

            if self.content_length.is_some_and(|prev| prev != len) {
                return Err(ErrorKind::InvalidContentLength);
            }
            if len > limits.body_size {
                return Err(ErrorKind::BodyTooLarge);
            }
            self.content_length = Some(len);
        } else if header.is("transfer-encoding") {
            let codings = header.value.split(',').map(str::trim).filter(|c| !c.is_empty());

            for coding in codings {
                if self.chunked || !coding.eq_ignore_ascii_case("chunked") {
                    return Err(ErrorKind::UnsupportedTransferCoding);
                }
                self.chunked = true;
            }
        } else if header.is("connection") {
            if types::has_token(&header.value, "close") {
                self.connection_close = true;
            } else if types::has_token(&header.value, "keep-alive") {
                self.keep_alive = true;
            }
        } else if header.is("expect") {
            self.expect_continue |= header.value.eq_ignore_ascii_case("100-continue");
        }

        Ok(())
    }

    fn finish(mut self) -> Result<Self, ErrorKind> {
        if self.chunked && self.content_length.is_some() {
            return Err(ErrorKind::ConflictingFraming);
        }
        if self.connection_close {
            self.keep_alive = false;
        }
        Ok(self)
    }
}

// Public API
impl Request {
    #[inline(always)]
    pub const fn method(&self) -> &Method {
        &self.method
    }

    /// Request target exactly as sent (origin, absolute or authority form).
    #[inline(always)]
    pub fn target(&self) -> &str {
        &self.target
    }

    #[inline(always)]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Returns the first header value with case-insensitive name matching.
    /// Uses linear search.
    #[inline(always)]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.is(name))
            .map(|h| h.value.as_str())
    }

    #[inline(always)]
    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    #[inline(always)]
    pub const fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    #[inline(always)]
    pub const fn is_chunked(&self) -> bool {
        self.chunked
    }

    #[inline(always)]
    pub const fn framing(&self) -> Framing {
        match (self.chunked, self.content_length) {
            (true, _) => Framing::Chunked,
            (false, Some(0) | None) => Framing::Empty,
            (false, Some(len)) => Framing::Length(len),
        }
    }

    /// Whether the client allows further requests on this connection.
    #[inline(always)]
    pub const fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    #[inline(always)]
    pub const fn expects_continue(&self) -> bool {
        self.expect_continue
    }

    /// Host and port the request is meant for.
    ///
    /// Taken from the `CONNECT` target, then from an absolute-form target
    /// (default port by scheme), then from the `Host` header (default `80`).
    pub fn authority(&self) -> Option<(&str, u16)> {
        if self.method == Method::Connect {
            return split_host_port(&self.target, None);
        }

        if let Some((scheme, rest)) = self.target.split_once("://") {
            let default = match scheme.eq_ignore_ascii_case("https") {
                true => 443,
                false => 80,
            };
            let end = rest
                .find(|c| matches!(c, '/' | '?' | '#'))
                .unwrap_or(rest.len());
            let authority = &rest[..end];
            let authority = authority.rsplit_once('@').map_or(authority, |(_, host)| host);

            return split_host_port(authority, Some(default));
        }

        split_host_port(self.header("host")?, Some(80))
    }
}

fn split_host_port(authority: &str, default_port: Option<u16>) -> Option<(&str, u16)> {
    let (host, port) = match authority.strip_prefix('[') {
        Some(rest) => {
            let (host, tail) = rest.split_once(']')?;
            match tail {
                "" => (host, None),
                _ => (host, Some(tail.strip_prefix(':')?)),
            }
        }
        None => match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        },
    };

    if host.is_empty() {
        return None;
    }

    let port = match port {
        Some(port) => port.parse().ok()?,
        None => default_port?,
    };

    Some((host, port))
}

/// Result of one [`RequestParser::parse`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// A full head, and how many bytes of the pending region it used.
    Complete(Request, usize),
    /// More bytes are needed; call again with the grown region.
    Incomplete,
    Malformed(ErrorKind),
}

#[derive(Debug, Default)]
enum Stage {
    #[default]
    Garbage,
    RequestLine,
    Headers(Request),
}

/// Resumable HTTP/1.x request head parser.
///
/// Offsets are relative to the start of the pending region, which must not
/// shrink between calls that returned [`ParseOutcome::Incomplete`]. Only whole
/// lines are ever scanned, so a resumed call continues at the first line that
/// had not fully arrived.
#[derive(Debug)]
pub struct RequestParser {
    limits: ReqLimits,
    stage: Stage,
    cursor: usize,
    garbage: usize,
    head_start: usize,
}

impl RequestParser {
    pub fn new(limits: ReqLimits) -> Self {
        RequestParser {
            limits,
            stage: Stage::Garbage,
            cursor: 0,
            garbage: 0,
            head_start: 0,
        }
    }

    #[inline]
    pub fn reset(&mut self) {
        self.stage = Stage::Garbage;
        self.cursor = 0;
        self.garbage = 0;
        self.head_start = 0;
    }

    pub fn parse(&mut self, pending: &[u8]) -> ParseOutcome {
        match self.advance(pending) {
            Ok(Some((request, consumed))) => {
                self.reset();
                ParseOutcome::Complete(request, consumed)
            }
            Ok(None) => ParseOutcome::Incomplete,
            Err(e) => {
                self.reset();
                ParseOutcome::Malformed(e)
            }
        }
    }

    fn advance(&mut self, pending: &[u8]) -> Result<Option<(Request, usize)>, ErrorKind> {
        loop {
            match mem::take(&mut self.stage) {
                Stage::Garbage => {
                    let mut tk = Tokenizer::at(pending, self.cursor);
                    let probe = match tk.peek() {
                        Some(b'\n') => tk.skip_byte(b'\n'),
                        _ => tk.match_prefix(b"\r\n"),
                    };

                    match probe {
                        Probe::Hit => {
                            self.garbage += 1;
                            if self.garbage > self.limits.max_leading_garbage {
                                return Err(ErrorKind::TooMuchGarbage);
                            }
                            self.cursor = tk.position();
                        }
                        Probe::Short => return Ok(None),
                        Probe::Miss => {
                            self.head_start = self.cursor;
                            self.stage = Stage::RequestLine;
                        }
                    }
                }
                Stage::RequestLine => {
                    let Some((line, next)) = self.next_line(pending) else {
                        if pending.len() - self.cursor > self.limits.request_line_size {
                            return Err(ErrorKind::RequestLineTooLong);
                        }
                        self.stage = Stage::RequestLine;
                        return Ok(None);
                    };

                    if next - self.cursor > self.limits.request_line_size {
                        return Err(ErrorKind::RequestLineTooLong);
                    }

                    let line = line.strip_suffix(b"\r").ok_or(ErrorKind::InvalidVersion)?;
                    let request = self.parse_request_line(line)?;
                    self.cursor = next;

                    if request.version == Version::Http09 {
                        return Ok(Some((request, next)));
                    }
                    self.stage = Stage::Headers(request);
                }
                Stage::Headers(mut request) => {
                    let Some((line, next)) = self.next_line(pending) else {
                        if pending.len() - self.head_start > self.limits.header_size {
                            return Err(ErrorKind::HeadersTooLarge);
                        }
                        self.stage = Stage::Headers(request);
                        return Ok(None);
                    };

                    if next - self.head_start > self.limits.header_size {
                        return Err(ErrorKind::HeadersTooLarge);
                    }

                    let line = line.strip_suffix(b"\r").ok_or(ErrorKind::InvalidHeader)?;
                    if line.is_empty() {
                        return Ok(Some((request.finish()?, next)));
                    }

                    self.parse_header(&mut request, line)?;
                    self.cursor = next;
                    self.stage = Stage::Headers(request);
                }
            }
        }
    }

    /// Line at the cursor without its `LF`, plus the offset just past the `LF`.
    #[inline]
    fn next_line<'a>(&self, pending: &'a [u8]) -> Option<(&'a [u8], usize)> {
        let mut tk = Tokenizer::at(pending, self.cursor);
        let line = tk.consume_until_byte(b'\n')?;

        Some((line, tk.position() + 1))
    }

    fn parse_request_line(&self, line: &[u8]) -> Result<Request, ErrorKind> {
        let mut tk = Tokenizer::new(line);

        let method = tk.consume_while(&TOKEN);
        if method.is_empty() || method.len() > self.limits.method_size {
            return Err(ErrorKind::InvalidMethod);
        }
        if tk.skip_byte(b' ') != Probe::Hit {
            return Err(ErrorKind::InvalidMethod);
        }
        let method = Method::from_token(method);

        let target = tk.consume_while(&VCHAR);
        if target.is_empty() {
            return Err(ErrorKind::InvalidUrl);
        }
        if target.len() > self.limits.url_size {
            return Err(ErrorKind::RequestLineTooLong);
        }
        let target = utf8(target)?.to_owned();

        if tk.at_end() {
            return match self.limits.http09 && method == Method::Get {
                true => Ok(Request::new(method, target, Version::Http09)),
                false => Err(ErrorKind::InvalidVersion),
            };
        }

        if tk.skip_byte(b' ') != Probe::Hit {
            return Err(ErrorKind::InvalidUrl);
        }
        if tk.match_prefix(b"HTTP/") != Probe::Hit {
            return Err(ErrorKind::InvalidVersion);
        }

        let version = match tk.remaining() {
            [major, b'.', minor] if major.is_ascii_digit() && minor.is_ascii_digit() => {
                match (major, minor) {
                    (b'1', b'0') => Version::Http10,
                    // Higher 1.x minors are served as the highest supported one.
                    (b'1', _) => Version::Http11,
                    _ => return Err(ErrorKind::UnsupportedVersion),
                }
            }
            _ => return Err(ErrorKind::InvalidVersion),
        };

        Ok(Request::new(method, target, version))
    }

    fn parse_header(&self, request: &mut Request, line: &[u8]) -> Result<(), ErrorKind> {
        let header = parse_field(line)?;

        if request.headers.len() >= self.limits.header_count {
            return Err(ErrorKind::TooManyHeaders);
        }

        request.apply_framing(&header, &self.limits)?;
        request.headers.push(header);

        Ok(())
    }
}

/// One `name ":" OWS value OWS` field line, `CRLF` already stripped.
/// Shared by request heads and chunked trailers.
pub(crate) fn parse_field(line: &[u8]) -> Result<Header, ErrorKind> {
    if matches!(line.first(), Some(b' ' | b'\t')) {
        return Err(ErrorKind::ObsoleteFolding);
    }

    let mut tk = Tokenizer::new(line);

    let name = tk.consume_while(&TOKEN);
    if name.is_empty() || tk.skip_byte(b':') != Probe::Hit {
        return Err(ErrorKind::InvalidHeader);
    }

    tk.consume_while(&OWS);
    let value = trim_trailing_ows(tk.remaining());
    if !value.iter().all(|&b| FIELD_VALUE.contains(b)) {
        return Err(ErrorKind::InvalidHeader);
    }

    Ok(Header::new(utf8(name)?, utf8(value)?))
}

#[inline]
fn trim_trailing_ows(value: &[u8]) -> &[u8] {
    let end = value
        .iter()
        .rposition(|&b| !OWS.contains(b))
        .map_or(0, |i| i + 1);

    &value[..end]
}

#[inline]
fn utf8(bytes: &[u8]) -> Result<&str, ErrorKind> {
    simdutf8::basic::from_utf8(bytes).map_err(|_| ErrorKind::InvalidEncoding)
}
