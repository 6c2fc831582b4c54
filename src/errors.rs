use crate::{StatusCode, Version};
use std::io;
use thiserror::Error;

/// Every failure the parser, the decoder and the connection core can report.
///
/// Parse and limit errors carry a client-visible status (see [`ErrorKind::status`]);
/// the rest describe misuse of the connection by a collaborator or I/O trouble.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ErrorKind {
    #[error("too many empty lines before the request line")]
    TooMuchGarbage,
    #[error("invalid request method")]
    InvalidMethod,
    #[error("invalid request target")]
    InvalidUrl,
    #[error("request line exceeds the configured limit")]
    RequestLineTooLong,
    #[error("invalid protocol version")]
    InvalidVersion,
    #[error("unsupported protocol version")]
    UnsupportedVersion,

    #[error("invalid header field")]
    InvalidHeader,
    #[error("obsolete header line folding")]
    ObsoleteFolding,
    #[error("request head exceeds the configured limit")]
    HeadersTooLarge,
    #[error("too many header fields")]
    TooManyHeaders,
    #[error("request head is not valid UTF-8")]
    InvalidEncoding,

    #[error("invalid Content-Length")]
    InvalidContentLength,
    #[error("both Content-Length and Transfer-Encoding present")]
    ConflictingFraming,
    #[error("unsupported transfer coding")]
    UnsupportedTransferCoding,
    #[error("request body exceeds the configured limit")]
    BodyTooLarge,

    #[error("malformed chunked encoding")]
    InvalidChunk,
    #[error("chunk size exceeds the configured limit")]
    ChunkTooLarge,
    #[error("chunked trailer exceeds the configured limit")]
    TrailerTooLarge,

    #[error("transaction context no longer exists")]
    ContextGone,
    #[error("deferred reply slot is already occupied")]
    DeferredSlotOccupied,
    #[error("another request body is still being read")]
    ConcurrentChunkedBody,
    #[error("reply already started")]
    ReplyStarted,
    #[error("reply body before reply head")]
    ReplyNotStarted,
    #[error("bump decision cannot move from {from} to {to}")]
    BumpTransition {
        from: &'static str,
        to: &'static str,
    },
    #[error("control message is not an interim 1xx reply")]
    NotInterim,

    #[error("malformed PROXY protocol header")]
    InvalidProxyHeader,
    #[error("client may not send a PROXY protocol header")]
    UntrustedProxyClient,

    #[error("I/O error: {0:?}")]
    Io(IoError),
}

macro_rules! http_errors {
    ($($name:ident: $status:ident, $code:literal => $message:literal; )*) => {
        /// Status sent to the client when this error aborts a request.
        pub const fn status(&self) -> StatusCode {
            match self { $( Self::$name { .. } => StatusCode::$status, )* }
        }

        const fn parts(&self) -> (&'static str, &'static str) {
            match self { $( Self::$name { .. } => ($code, $message), )* }
        }
    };
}

impl ErrorKind {
    http_errors! {
        TooMuchGarbage: BadRequest, "TOO_MUCH_GARBAGE" => "Too many empty lines before request";
        InvalidMethod: BadRequest, "INVALID_METHOD" => "Invalid HTTP method";
        InvalidUrl: BadRequest, "INVALID_URL" => "Invalid request target";
        RequestLineTooLong: UriTooLong, "REQUEST_LINE_TOO_LONG" => "Request line too long";
        InvalidVersion: BadRequest, "INVALID_VERSION" => "Invalid HTTP version";
        UnsupportedVersion: HttpVersionNotSupported, "UNSUPPORTED_VERSION" => "HTTP version not supported";

        InvalidHeader: BadRequest, "INVALID_HEADER" => "Invalid header format";
        ObsoleteFolding: BadRequest, "OBSOLETE_FOLDING" => "Header line folding is not allowed";
        HeadersTooLarge: RequestHeaderFieldsTooLarge, "HEADERS_TOO_LARGE" => "Request headers too large";
        TooManyHeaders: RequestHeaderFieldsTooLarge, "TOO_MANY_HEADERS" => "Too many headers";
        InvalidEncoding: BadRequest, "INVALID_ENCODING" => "Request head is not valid UTF-8";

        InvalidContentLength: BadRequest, "INVALID_CONTENT_LENGTH" => "Invalid Content-Length";
        ConflictingFraming: BadRequest, "CONFLICTING_FRAMING" => "Conflicting message framing";
        UnsupportedTransferCoding: NotImplemented, "UNSUPPORTED_TRANSFER_CODING" => "Transfer coding not implemented";
        BodyTooLarge: PayloadTooLarge, "BODY_TOO_LARGE" => "Request body too large";

        InvalidChunk: BadRequest, "INVALID_CHUNK" => "Malformed chunked body";
        ChunkTooLarge: PayloadTooLarge, "CHUNK_TOO_LARGE" => "Chunk too large";
        TrailerTooLarge: RequestHeaderFieldsTooLarge, "TRAILER_TOO_LARGE" => "Chunked trailer too large";

        ContextGone: InternalServerError, "INTERNAL_ERROR" => "Internal error";
        DeferredSlotOccupied: InternalServerError, "INTERNAL_ERROR" => "Internal error";
        ConcurrentChunkedBody: InternalServerError, "INTERNAL_ERROR" => "Internal error";
        ReplyStarted: InternalServerError, "INTERNAL_ERROR" => "Internal error";
        ReplyNotStarted: InternalServerError, "INTERNAL_ERROR" => "Internal error";
        BumpTransition: InternalServerError, "INTERNAL_ERROR" => "Internal error";
        NotInterim: InternalServerError, "INTERNAL_ERROR" => "Internal error";

        InvalidProxyHeader: BadRequest, "INVALID_PROXY_HEADER" => "Malformed PROXY protocol header";
        UntrustedProxyClient: Forbidden, "UNTRUSTED_PROXY_CLIENT" => "PROXY protocol not permitted";

        Io: ServiceUnavailable, "IO_ERROR" => "I/O error occurred";
    }

    /// Whether the error is a resource limit rather than broken syntax.
    pub const fn is_limit(&self) -> bool {
        matches!(
            self,
            Self::RequestLineTooLong
                | Self::HeadersTooLarge
                | Self::TooManyHeaders
                | Self::BodyTooLarge
                | Self::ChunkTooLarge
                | Self::TrailerTooLarge
        )
    }

    /// Renders the complete error reply written before the connection closes.
    pub(crate) fn as_http(&self, version: Version, json: bool) -> Vec<u8> {
        let (code, message) = self.parts();
        let status = self.status();

        if version == Version::Http09 {
            let mut out = b"ERROR:".to_vec();
            out.extend_from_slice(status.as_u16_bytes());
            out.extend_from_slice(status.reason().as_bytes());
            out.extend_from_slice(b"\r\n");
            return out;
        }

        let body = match json {
            true => format!(r#"{{"error":"{message}","code":"{code}"}}"#),
            false => String::new(),
        };

        let mut out = Vec::with_capacity(128 + body.len());
        out.extend_from_slice(status.into_first_line(version));
        out.extend_from_slice(b"connection: close\r\n");
        out.extend_from_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
        if json {
            out.extend_from_slice(b"content-type: application/json\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(body.as_bytes());
        out
    }
}

impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        ErrorKind::Io(IoError(err.kind()))
    }
}

/// I/O failure reduced to its kind so errors stay comparable and cloneable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoError(pub io::ErrorKind);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::str_op;

    #[test]
    fn json_error_reply() {
        let reply = ErrorKind::InvalidMethod.as_http(Version::Http11, true);
        let body = r#"{"error":"Invalid HTTP method","code":"INVALID_METHOD"}"#;

        assert_eq!(
            str_op(&reply),
            format!(
                "HTTP/1.1 400 Bad Request\r\nconnection: close\r\ncontent-length: {}\r\n\
                 content-type: application/json\r\n\r\n{body}",
                body.len()
            )
        );
    }

    #[test]
    fn empty_error_reply() {
        #[rustfmt::skip]
        let cases = [
            (ErrorKind::RequestLineTooLong, Version::Http11,
                "HTTP/1.1 414 URI Too Long\r\nconnection: close\r\ncontent-length: 0\r\n\r\n"),
            (ErrorKind::TooManyHeaders, Version::Http10,
                "HTTP/1.0 431 Request Header Fields Too Large\r\nconnection: close\r\ncontent-length: 0\r\n\r\n"),
            (ErrorKind::UnsupportedVersion, Version::Http09,
                "ERROR: 505 HTTP Version Not Supported\r\n"),
        ];

        for (error, version, expected) in cases {
            assert_eq!(str_op(&error.as_http(version, false)), expected);
        }
    }

    #[test]
    fn limits_are_flagged() {
        assert!(ErrorKind::BodyTooLarge.is_limit());
        assert!(ErrorKind::HeadersTooLarge.is_limit());
        assert!(!ErrorKind::InvalidHeader.is_limit());
        assert!(!ErrorKind::ObsoleteFolding.is_limit());
    }

    #[test]
    fn io_errors_compare_by_kind() {
        let a: ErrorKind = io::Error::new(io::ErrorKind::BrokenPipe, "a").into();
        let b: ErrorKind = io::Error::new(io::ErrorKind::BrokenPipe, "b").into();
        assert_eq!(a, b);
    }
}
