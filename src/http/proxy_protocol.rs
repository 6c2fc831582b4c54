//! PROXY protocol header (v1 text, v2 binary) sent by a load balancer in
//! front of the proxy, ahead of the first client byte.

use crate::{
    errors::ErrorKind,
    http::tokenizer::{Probe, Tokenizer},
};
use proxy_header::{Error, ParseConfig, ProxyHeader};
use std::net::SocketAddr;
use tracing::trace;

const V1_PREFIX: &[u8] = b"PROXY ";
const V2_SIGNATURE: &[u8] = b"\r\n\r\n\0\r\nQUIT\n";

/// Addresses announced by the PROXY protocol header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxiedClient {
    /// `None` for `LOCAL` and `UNKNOWN` headers: the peer is the client.
    pub source: Option<SocketAddr>,
    pub destination: Option<SocketAddr>,
}

/// Parses the header at the start of `input`.
///
/// `Ok(None)` when more bytes are needed. Returns the bytes the header took.
pub(crate) fn parse_proxy_header(input: &[u8]) -> Result<Option<(ProxiedClient, usize)>, ErrorKind> {
    let v1 = Tokenizer::new(input).match_prefix(V1_PREFIX);
    let v2 = Tokenizer::new(input).match_prefix(V2_SIGNATURE);

    match (v1, v2) {
        (Probe::Miss, Probe::Miss) => return Err(ErrorKind::InvalidProxyHeader),
        (Probe::Short, _) | (_, Probe::Short) => return Ok(None),
        _ => {}
    }

    match ProxyHeader::parse(input, ParseConfig::default()) {
        Ok((header, consumed)) => {
            let address = header.proxied_address();
            let client = ProxiedClient {
                source: address.map(|a| a.source),
                destination: address.map(|a| a.destination),
            };
            Ok(Some((client, consumed)))
        }
        Err(Error::BufferTooShort) => Ok(None),
        Err(e) => {
            trace!(error = ?e, "PROXY header parse failed");
            Err(ErrorKind::InvalidProxyHeader)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(text: &str) -> Option<SocketAddr> {
        Some(text.parse().unwrap())
    }

    fn v2(command: u8, family: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = V2_SIGNATURE.to_vec();
        out.extend_from_slice(&[0x20 | command, family]);
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn text_headers() {
        #[rustfmt::skip]
        let cases: [(&[u8], Option<&str>, Option<&str>, usize); 3] = [
            (b"PROXY TCP4 192.0.2.1 198.51.100.7 56324 3128\r\nGET / HTTP/1.1\r\n",
                Some("192.0.2.1:56324"), Some("198.51.100.7:3128"), 46),
            (b"PROXY TCP6 2001:db8::1 2001:db8::2 1000 443\r\n",
                Some("[2001:db8::1]:1000"), Some("[2001:db8::2]:443"), 45),
            (b"PROXY UNKNOWN\r\n", None, None, 15),
        ];

        for (input, source, destination, consumed) in cases {
            let (client, used) = parse_proxy_header(input).unwrap().unwrap();

            assert_eq!(client.source, source.and_then(addr), "{input:?}");
            assert_eq!(client.destination, destination.and_then(addr));
            assert_eq!(used, consumed);
        }
    }

    #[test]
    fn binary_headers() {
        let payload = [192, 0, 2, 1, 198, 51, 100, 7, 0xdc, 0x04, 0x0c, 0x38];
        let mut input = v2(0x1, 0x11, &payload);
        input.extend_from_slice(b"GET / HTTP/1.1\r\n");

        let (client, used) = parse_proxy_header(&input).unwrap().unwrap();
        assert_eq!(client.source, addr("192.0.2.1:56324"));
        assert_eq!(client.destination, addr("198.51.100.7:3128"));
        assert_eq!(used, 16 + payload.len());

        // Health checks of the balancer itself.
        let local = v2(0x0, 0x00, &[]);
        let (client, used) = parse_proxy_header(&local).unwrap().unwrap();
        assert_eq!(client.source, None);
        assert_eq!(used, 16);
    }

    #[test]
    fn incomplete_headers() {
        let binary = v2(0x1, 0x11, &[192, 0, 2, 1, 198, 51, 100, 7, 0, 80, 0, 80]);

        #[rustfmt::skip]
        let cases: [&[u8]; 5] = [
            b"PRO",
            b"PROXY TCP4 192.0.2.1 198.51",
            b"\r\n\r\n\0",
            &binary[..14],
            &binary[..20],
        ];

        for input in cases {
            assert_eq!(parse_proxy_header(input), Ok(None), "{input:?}");
        }
    }

    #[test]
    fn malformed_headers() {
        #[rustfmt::skip]
        let cases: [&[u8]; 3] = [
            b"GET / HTTP/1.1\r\n\r\n",
            b"PROXY TCP4 not-an-address 198.51.100.7 1 2\r\n",
            b"\r\n\r\nGET",
        ];

        for input in cases {
            assert_eq!(parse_proxy_header(input), Err(ErrorKind::InvalidProxyHeader), "{input:?}");
        }
    }
}
