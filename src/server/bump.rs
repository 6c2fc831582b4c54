//! TLS interception decisions for `CONNECT` tunnels.
//!
//! The handshake itself happens elsewhere; this module only decides between
//! relaying the tunnel untouched (splice) and terminating TLS locally (bump),
//! and records that the decision, once taken, never changes.

use crate::{errors::ErrorKind, limits::CertificateFallback};
use std::{fmt, sync::Arc};
use thiserror::Error;
use tracing::warn;

/// Bump decision progress of one client connection.
///
/// ```text
/// Unset --> Peeking --> Splicing --> Done
///   |          |                      ^
///   |          +------> Bumping ------+
///   +--> Splicing | Bumping
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BumpState {
    #[default]
    Unset,
    Peeking,
    Splicing,
    Bumping,
    Done,
}

impl BumpState {
    pub const fn as_str(self) -> &'static str {
        match self {
            BumpState::Unset => "unset",
            BumpState::Peeking => "peeking",
            BumpState::Splicing => "splicing",
            BumpState::Bumping => "bumping",
            BumpState::Done => "done",
        }
    }

    /// Moves to `to`, refusing anything outside the diagram above.
    pub fn transition(&mut self, to: BumpState) -> Result<(), ErrorKind> {
        use BumpState::*;

        match (*self, to) {
            (Unset, Peeking | Splicing | Bumping)
            | (Peeking, Splicing | Bumping)
            | (Splicing | Bumping, Done) => {
                *self = to;
                Ok(())
            }
            (from, to) => Err(ErrorKind::BumpTransition {
                from: from.as_str(),
                to: to.as_str(),
            }),
        }
    }
}

impl fmt::Display for BumpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Policy verdict delivered after peeking at the client's first TLS bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BumpVerdict {
    Splice,
    Bump,
}

/// Certificate material used to terminate a bumped tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsContext {
    /// Host name the certificate was minted for.
    pub host: String,
    /// DER-encoded certificate chain followed by the private key.
    pub material: Arc<[u8]>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CertificateError {
    #[error("no certificate authority configured")]
    NoAuthority,
    #[error("certificate generation failed for {host}: {reason}")]
    Generation { host: String, reason: String },
}

/// Produces certificates for bumped tunnels.
pub trait CertificateProvider: Send + Sync {
    fn tls_context(&self, host: &str) -> Result<TlsContext, CertificateError>;
}

/// What the client stream currently carries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionMode {
    /// HTTP requests in clear text.
    #[default]
    Plain,
    /// HTTP requests inside TLS terminated with this context.
    Bumped(TlsContext),
    /// Opaque bytes relayed to the origin.
    Tunnel,
}

/// How a tunnel starts once its decision is known.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TunnelStart {
    Splice,
    Tls(TlsContext),
    Close,
}

/// Enters `Bumping` when a certificate can be produced for `host`,
/// otherwise applies `fallback`.
pub(crate) fn enter_bumping(
    state: &mut BumpState,
    provider: Option<&dyn CertificateProvider>,
    host: &str,
    fallback: CertificateFallback,
) -> Result<TunnelStart, ErrorKind> {
    let result = match provider {
        Some(provider) => provider.tls_context(host),
        None => Err(CertificateError::NoAuthority),
    };

    match result {
        Ok(context) => {
            state.transition(BumpState::Bumping)?;
            Ok(TunnelStart::Tls(context))
        }
        Err(e) => {
            warn!(%host, error = %e, ?fallback, "certificate unavailable");

            match fallback {
                CertificateFallback::Splice => {
                    state.transition(BumpState::Splicing)?;
                    Ok(TunnelStart::Splice)
                }
                CertificateFallback::Close => Ok(TunnelStart::Close),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Mints a fake context for hosts it knows about.
    pub(crate) struct FakeAuthority(pub &'static [&'static str]);

    impl CertificateProvider for FakeAuthority {
        fn tls_context(&self, host: &str) -> Result<TlsContext, CertificateError> {
            match self.0.contains(&host) {
                true => Ok(TlsContext {
                    host: host.to_owned(),
                    material: Arc::from(&b"cert"[..]),
                }),
                false => Err(CertificateError::Generation {
                    host: host.to_owned(),
                    reason: "unknown host".to_owned(),
                }),
            }
        }
    }

    #[test]
    fn transitions() {
        use BumpState::*;

        #[rustfmt::skip]
        let cases = [
            (Unset,    Peeking,  true),
            (Unset,    Splicing, true),
            (Unset,    Bumping,  true),
            (Peeking,  Splicing, true),
            (Peeking,  Bumping,  true),
            (Splicing, Done,     true),
            (Bumping,  Done,     true),

            (Unset,    Done,     false),
            (Peeking,  Done,     false),
            (Peeking,  Peeking,  false),
            (Splicing, Bumping,  false),
            (Bumping,  Splicing, false),
            (Done,     Unset,    false),
            (Done,     Splicing, false),
            (Done,     Done,     false),
        ];

        for (from, to, allowed) in cases {
            let mut state = from;
            let result = state.transition(to);

            assert_eq!(result.is_ok(), allowed, "{from} -> {to}");
            assert_eq!(state, if allowed { to } else { from });
        }
    }

    #[test]
    fn rejected_transition_names_states() {
        let mut state = BumpState::Done;

        assert_eq!(
            state.transition(BumpState::Bumping),
            Err(ErrorKind::BumpTransition { from: "done", to: "bumping" })
        );
    }

    #[test]
    fn certificate_fallback() {
        let authority = FakeAuthority(&["good.example"]);

        #[rustfmt::skip]
        let cases = [
            ("good.example", CertificateFallback::Close,  BumpState::Bumping,  true),
            ("bad.example",  CertificateFallback::Splice, BumpState::Splicing, false),
            ("bad.example",  CertificateFallback::Close,  BumpState::Peeking,  false),
        ];

        for (host, fallback, expected_state, bumped) in cases {
            let mut state = BumpState::Peeking;
            let start = enter_bumping(&mut state, Some(&authority), host, fallback).unwrap();

            assert_eq!(state, expected_state);
            assert_eq!(matches!(start, TunnelStart::Tls(_)), bumped);
            if fallback == CertificateFallback::Close && !bumped {
                assert_eq!(start, TunnelStart::Close);
            }
        }

        let mut state = BumpState::Unset;
        let start = enter_bumping(&mut state, None, "good.example", CertificateFallback::Splice);
        assert_eq!(start, Ok(TunnelStart::Splice));
    }
}
