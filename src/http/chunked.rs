//! `Transfer-Encoding: chunked` decoding for request bodies and encoding for replies.

use crate::{
    errors::ErrorKind,
    http::{
        request::parse_field,
        tokenizer::{CharSet, Probe, Tokenizer, HEXDIG, OWS},
        types::{self, Header},
    },
    limits::ReqLimits,
};

const EXT_START: CharSet = CharSet::EMPTY.with_bytes(b";");

/// Terminating zero-size chunk with an empty trailer section.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Appends `data` as one chunk. Empty data is skipped, since a zero-size
/// chunk would end the body.
pub fn encode_chunk(data: &[u8], out: &mut Vec<u8>) {
    if data.is_empty() {
        return;
    }

    out.reserve(data.len() + 20);
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Size,
    Data { remaining: u64 },
    DataCrlf,
    Trailers,
    Done,
}

/// Progress of one [`ChunkedDecoder::decode`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    /// Input bytes used; the caller drops them from its buffer.
    pub consumed: usize,
    /// The last chunk and the trailer section have been read.
    pub done: bool,
}

/// Incremental chunked body decoder.
///
/// Consumes every complete element of the input it is given, including
/// partial chunk data, and leaves incomplete size or trailer lines for the
/// next call. Bytes after the final `CRLF` are never consumed.
#[derive(Debug)]
pub struct ChunkedDecoder {
    phase: Phase,
    trailers: Vec<Header>,
    trailer_bytes: usize,

    max_chunk_size: u64,
    chunk_line_size: usize,
    trailer_size: usize,
    trailer_count: usize,
}

impl ChunkedDecoder {
    pub fn new(limits: &ReqLimits) -> Self {
        ChunkedDecoder {
            phase: Phase::Size,
            trailers: Vec::new(),
            trailer_bytes: 0,

            max_chunk_size: limits.max_chunk_size,
            chunk_line_size: limits.chunk_line_size,
            trailer_size: limits.header_size,
            trailer_count: limits.header_count,
        }
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    #[inline]
    pub fn trailers(&self) -> &[Header] {
        &self.trailers
    }

    pub fn decode(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<Decoded, ErrorKind> {
        let mut tk = Tokenizer::new(input);

        loop {
            match self.phase {
                Phase::Size => {
                    let Some(line) = tk.consume_until_byte(b'\n') else {
                        if tk.remaining().len() >= self.chunk_line_size {
                            return Err(ErrorKind::InvalidChunk);
                        }
                        break;
                    };
                    tk.skip(1);

                    if line.len() >= self.chunk_line_size {
                        return Err(ErrorKind::InvalidChunk);
                    }
                    let line = line.strip_suffix(b"\r").ok_or(ErrorKind::InvalidChunk)?;

                    let size = self.chunk_size(line)?;
                    self.phase = match size {
                        0 => Phase::Trailers,
                        _ => Phase::Data { remaining: size },
                    };
                }
                Phase::Data { remaining } => {
                    let rest = tk.remaining();
                    if rest.is_empty() {
                        break;
                    }

                    let take = usize::try_from(remaining).map_or(rest.len(), |r| r.min(rest.len()));
                    out.extend_from_slice(&rest[..take]);
                    tk.skip(take);

                    self.phase = match remaining - take as u64 {
                        0 => Phase::DataCrlf,
                        left => Phase::Data { remaining: left },
                    };
                }
                Phase::DataCrlf => match tk.match_prefix(b"\r\n") {
                    Probe::Hit => self.phase = Phase::Size,
                    Probe::Short => break,
                    Probe::Miss => return Err(ErrorKind::InvalidChunk),
                },
                Phase::Trailers => {
                    let Some(line) = tk.consume_until_byte(b'\n') else {
                        if self.trailer_bytes + tk.remaining().len() > self.trailer_size {
                            return Err(ErrorKind::TrailerTooLarge);
                        }
                        break;
                    };
                    tk.skip(1);

                    self.trailer_bytes += line.len() + 1;
                    if self.trailer_bytes > self.trailer_size {
                        return Err(ErrorKind::TrailerTooLarge);
                    }

                    let line = line.strip_suffix(b"\r").ok_or(ErrorKind::InvalidChunk)?;
                    if line.is_empty() {
                        self.phase = Phase::Done;
                        continue;
                    }

                    if self.trailers.len() >= self.trailer_count {
                        return Err(ErrorKind::TrailerTooLarge);
                    }
                    let trailer = parse_field(line).map_err(|_| ErrorKind::InvalidChunk)?;
                    self.trailers.push(trailer);
                }
                Phase::Done => break,
            }
        }

        Ok(Decoded {
            consumed: tk.position(),
            done: self.is_done(),
        })
    }

    /// `chunk-size [ BWS ";" chunk-ext ]`; extensions are skipped.
    fn chunk_size(&self, line: &[u8]) -> Result<u64, ErrorKind> {
        let size = Tokenizer::new(line).consume_until(&EXT_START).unwrap_or(line);
        let mut tk = Tokenizer::new(size);

        let digits = tk.consume_while(&HEXDIG);
        if digits.is_empty() {
            return Err(ErrorKind::InvalidChunk);
        }

        tk.consume_while(&OWS);
        if !tk.at_end() {
            return Err(ErrorKind::InvalidChunk);
        }

        match types::hex_to_u64(digits) {
            Some(size) if size <= self.max_chunk_size => Ok(size),
            _ => Err(ErrorKind::ChunkTooLarge),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder() -> ChunkedDecoder {
        ChunkedDecoder::new(&ReqLimits::default())
    }

    fn decode_all(input: &[u8]) -> Result<(Vec<u8>, Decoded), ErrorKind> {
        let mut out = Vec::new();
        let decoded = decoder().decode(input, &mut out)?;
        Ok((out, decoded))
    }

    #[test]
    fn wikipedia() {
        let input = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let mut decoder = decoder();
        let mut out = Vec::new();

        let decoded = decoder.decode(input, &mut out).unwrap();

        assert_eq!(out, b"Wikipedia");
        assert_eq!(decoded, Decoded { consumed: input.len(), done: true });
        assert!(decoder.trailers().is_empty());
    }

    #[test]
    fn byte_by_byte() {
        let input = b"4;ext=1\r\nWiki\r\n5 ; a ; b=\"c\"\r\npedia\r\n0\r\nX-Sum: 9\r\n\r\n";
        let mut decoder = decoder();
        let mut pending = Vec::new();
        let mut out = Vec::new();

        for &byte in input {
            assert!(!decoder.is_done());
            pending.push(byte);

            let decoded = decoder.decode(&pending, &mut out).unwrap();
            pending.drain(..decoded.consumed);
        }

        assert!(decoder.is_done());
        assert!(pending.is_empty());
        assert_eq!(out, b"Wikipedia");
        assert_eq!(decoder.trailers(), &[Header::new("X-Sum", "9")]);
    }

    #[test]
    fn encoded_payloads_decode_back() {
        let payloads: [&[u8]; 3] = [b"", b"x", &[0xab; 5000]];

        for payload in payloads {
            let mut encoded = Vec::new();
            for piece in payload.chunks(777) {
                encode_chunk(piece, &mut encoded);
            }
            encoded.extend_from_slice(LAST_CHUNK);

            let (out, decoded) = decode_all(&encoded).unwrap();
            assert_eq!(out, payload);
            assert!(decoded.done);
        }
    }

    #[test]
    fn stops_at_body_end() {
        let (out, decoded) = decode_all(b"3\r\nabc\r\n0\r\n\r\nGET / HTTP/1.1\r\n").unwrap();

        assert_eq!(out, b"abc");
        assert_eq!(decoded, Decoded { consumed: 13, done: true });
    }

    #[test]
    fn partial_data_is_delivered() {
        let mut decoder = decoder();
        let mut out = Vec::new();

        let decoded = decoder.decode(b"a\r\n0123", &mut out).unwrap();
        assert_eq!(decoded, Decoded { consumed: 7, done: false });
        assert_eq!(out, b"0123");

        // A half-received size line stays in the buffer.
        let decoded = decoder.decode(b"456789\r\n1", &mut out).unwrap();
        assert_eq!(decoded, Decoded { consumed: 8, done: false });
        assert_eq!(out, b"0123456789");
    }

    #[test]
    fn errors() {
        let long_line = format!("1;{}", "e".repeat(4096));
        let huge_trailer = format!("0\r\nX: {}\r\n\r\n", "v".repeat(64 * 1024));

        #[rustfmt::skip]
        let cases: [(&[u8], ErrorKind); 10] = [
            (b"zz\r\n",                   ErrorKind::InvalidChunk),
            (b"4 x\r\nWiki\r\n",          ErrorKind::InvalidChunk),
            (b"\r\n",                     ErrorKind::InvalidChunk),
            (b"4\nWiki\r\n",              ErrorKind::InvalidChunk),
            (b"4\r\nWikiXX",              ErrorKind::InvalidChunk),
            (b"1000001\r\n",              ErrorKind::ChunkTooLarge),
            (b"fffffffffffffffff\r\n",    ErrorKind::ChunkTooLarge),
            (long_line.as_bytes(),        ErrorKind::InvalidChunk),
            (b"0\r\nA: b\r\n c\r\n\r\n",  ErrorKind::InvalidChunk),
            (huge_trailer.as_bytes(),     ErrorKind::TrailerTooLarge),
        ];

        for (input, expected) in cases {
            assert_eq!(decode_all(input).map(|(_, d)| d), Err(expected), "{input:?}");
        }
    }

    #[test]
    fn padded_sizes() {
        #[rustfmt::skip]
        let cases: [(&[u8], &[u8]); 3] = [
            (b"00000000000000003\r\nabc\r\n0\r\n\r\n",   b"abc"),
            (b"0003 ;name=value\r\nabc\r\n0\r\n\r\n",     b"abc"),
            (b"2;a;b\r\nab\r\n00000\r\n\r\n",              b"ab"),
        ];

        for (input, body) in cases {
            let (out, decoded) = decode_all(input).unwrap();
            assert_eq!(out, body, "{input:?}");
            assert!(decoded.done);
        }
    }

    #[test]
    fn chunk_framing() {
        let mut out = Vec::new();
        encode_chunk(b"hello world", &mut out);
        encode_chunk(b"", &mut out);
        out.extend_from_slice(LAST_CHUNK);

        assert_eq!(out, b"b\r\nhello world\r\n0\r\n\r\n");
    }
}
