//! Zero-copy cursor over a received byte region.
//!
//! Every scanning operation tells "no match" apart from "need more data",
//! which is what lets the request parser stop with `Incomplete` instead of
//! guessing at a boundary that has not arrived yet.

use memchr::memchr;

/// Membership table over all 256 byte values.
#[derive(Clone, Copy)]
pub(crate) struct CharSet([bool; 256]);

impl CharSet {
    pub(crate) const EMPTY: CharSet = CharSet([false; 256]);

    pub(crate) const fn with_range(mut self, from: u8, to: u8) -> Self {
        let mut i = from as usize;
        while i <= to as usize {
            self.0[i] = true;
            i += 1;
        }
        self
    }

    pub(crate) const fn with_bytes(mut self, bytes: &[u8]) -> Self {
        let mut i = 0;
        while i < bytes.len() {
            self.0[bytes[i] as usize] = true;
            i += 1;
        }
        self
    }

    #[inline(always)]
    pub(crate) const fn contains(&self, byte: u8) -> bool {
        self.0[byte as usize]
    }
}

/// `tchar` from RFC 9110, Section 5.6.2.
pub(crate) const TOKEN: CharSet = CharSet::EMPTY
    .with_range(b'0', b'9')
    .with_range(b'a', b'z')
    .with_range(b'A', b'Z')
    .with_bytes(b"!#$%&'*+-.^_`|~");

/// Visible ASCII plus obs-text; no CTL, SP or DEL.
pub(crate) const VCHAR: CharSet = CharSet::EMPTY
    .with_range(0x21, 0x7e)
    .with_range(0x80, 0xff);

/// Header field value bytes: VCHAR, SP and HTAB.
pub(crate) const FIELD_VALUE: CharSet = VCHAR.with_bytes(b" \t");

pub(crate) const DIGIT: CharSet = CharSet::EMPTY.with_range(b'0', b'9');

pub(crate) const HEXDIG: CharSet = DIGIT.with_range(b'a', b'f').with_range(b'A', b'F');

pub(crate) const OWS: CharSet = CharSet::EMPTY.with_bytes(b" \t");

/// Result of a probe that may run past the end of the available bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Probe {
    Hit,
    Miss,
    /// Input ended while the prefix still matched.
    Short,
}

pub(crate) struct Tokenizer<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    #[inline(always)]
    pub(crate) const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Cursor starting at `pos`, clamped to the buffer.
    #[inline(always)]
    pub(crate) fn at(buf: &'a [u8], pos: usize) -> Self {
        Self {
            buf,
            pos: pos.min(buf.len()),
        }
    }

    #[inline(always)]
    pub(crate) const fn position(&self) -> usize {
        self.pos
    }

    #[inline(always)]
    pub(crate) fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    #[inline(always)]
    pub(crate) const fn at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    #[inline(always)]
    pub(crate) fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    pub(crate) fn match_prefix(&mut self, literal: &[u8]) -> Probe {
        let rest = self.remaining();

        if rest.len() >= literal.len() {
            if rest.starts_with(literal) {
                self.pos += literal.len();
                return Probe::Hit;
            }
            return Probe::Miss;
        }

        match literal.starts_with(rest) {
            true => Probe::Short,
            false => Probe::Miss,
        }
    }

    #[inline]
    pub(crate) fn skip_byte(&mut self, byte: u8) -> Probe {
        match self.peek() {
            Some(b) if b == byte => {
                self.pos += 1;
                Probe::Hit
            }
            Some(_) => Probe::Miss,
            None => Probe::Short,
        }
    }

    #[inline]
    pub(crate) fn skip(&mut self, count: usize) -> bool {
        if self.remaining().len() < count {
            return false;
        }
        self.pos += count;
        true
    }

    pub(crate) fn consume_while(&mut self, set: &CharSet) -> &'a [u8] {
        let rest = self.remaining();
        let len = rest.iter().take_while(|&&b| set.contains(b)).count();

        self.pos += len;
        &rest[..len]
    }

    /// Bytes up to (not including) the first member of `set`. `None` when no
    /// member has arrived yet; the cursor does not move in that case.
    pub(crate) fn consume_until(&mut self, set: &CharSet) -> Option<&'a [u8]> {
        let rest = self.remaining();
        let len = rest.iter().position(|&b| set.contains(b))?;

        self.pos += len;
        Some(&rest[..len])
    }

    #[inline]
    pub(crate) fn consume_until_byte(&mut self, byte: u8) -> Option<&'a [u8]> {
        let rest = self.remaining();
        let len = memchr(byte, rest)?;

        self.pos += len;
        Some(&rest[..len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_probe() {
        #[rustfmt::skip]
        let cases: [(&[u8], &[u8], Probe, usize); 6] = [
            (b"HTTP/1.1", b"HTTP/", Probe::Hit,   5),
            (b"HTTP/",    b"HTTP/", Probe::Hit,   5),
            (b"HTT",      b"HTTP/", Probe::Short, 0),
            (b"",         b"HTTP/", Probe::Short, 0),
            (b"HTX",      b"HTTP/", Probe::Miss,  0),
            (b"FTP/1.1",  b"HTTP/", Probe::Miss,  0),
        ];

        for (input, literal, probe, pos) in cases {
            let mut tk = Tokenizer::new(input);
            assert_eq!(tk.match_prefix(literal), probe, "{input:?}");
            assert_eq!(tk.position(), pos);
        }
    }

    #[test]
    fn scanning() {
        let mut tk = Tokenizer::new(b"GET /index HTTP/1.1\r\n");

        assert_eq!(tk.consume_while(&TOKEN), b"GET");
        assert_eq!(tk.skip_byte(b' '), Probe::Hit);
        assert_eq!(tk.consume_until_byte(b' '), Some(&b"/index"[..]));
        assert!(tk.skip(1));
        assert_eq!(tk.consume_until(&CharSet::EMPTY.with_bytes(b"\r\n")), Some(&b"HTTP/1.1"[..]));
        assert_eq!(tk.remaining(), b"\r\n");
        assert!(!tk.skip(3));
        assert!(tk.skip(2));
        assert!(tk.at_end());
        assert_eq!(tk.skip_byte(b'\r'), Probe::Short);
    }

    #[test]
    fn missing_delimiter_keeps_cursor() {
        let mut tk = Tokenizer::new(b"abc");

        assert_eq!(tk.consume_until_byte(b'\n'), None);
        assert_eq!(tk.consume_until(&OWS), None);
        assert_eq!(tk.position(), 0);
        assert_eq!(tk.consume_while(&DIGIT), b"");
    }

    #[test]
    fn charsets() {
        assert!(TOKEN.contains(b'~'));
        assert!(!TOKEN.contains(b':'));
        assert!(!VCHAR.contains(b' '));
        assert!(!VCHAR.contains(0x7f));
        assert!(VCHAR.contains(0xc3));
        assert!(FIELD_VALUE.contains(b'\t'));
        assert!(HEXDIG.contains(b'F'));
        assert!(!HEXDIG.contains(b'g'));
    }
}
