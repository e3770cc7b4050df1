//! Probe a server for the target information it leaks over NTLM.
//!
//! NTLM-enabled endpoints answer an anonymous Negotiate message with a
//! Challenge message whose target information block names the machine, its
//! domain and forest, and the server's local time, all before any credential
//! changes hands. This crate drives that single Negotiate→Challenge exchange
//! over HTTP or LDAP and projects the decoded AV pairs into a queryable,
//! printable result.
//!
//! Sample usage:
//! ```
//! use std::time::Duration;
//!
//! async fn probe() -> Result<(), ntlm_targetinfo::ExtractionError> {
//!     let info = ntlm_targetinfo::ntlm_target_information(
//!         "https://mail.example.com/ews/exchange.asmx",
//!         Duration::from_secs(5),
//!     ).await?;
//!
//!     if let Some(domain) = info.dns_domain_name() {
//!         println!("member of {}", domain);
//!     }
//!     // one sorted "label: value" line per AV pair
//!     println!("{}", info);
//!     Ok(())
//! }
//! ```
//!
//! The codec pieces are usable on their own: [`ChallengeMessage::parse`]
//! decodes a raw Challenge buffer obtained elsewhere, and
//! [`AvPairSequence::decode`] decodes a bare target information block.


pub mod avpair;
pub mod http;
pub mod ldap;
pub mod message;
pub mod targetinfo;


use std::fmt;
use std::io;
use std::time::Duration;

use bitflags::bitflags;

pub use crate::avpair::{AvFlags, AvId, AvPair, AvPairSequence, SingleHostData};
pub use crate::message::{ChallengeMessage, NegotiateMessage, OsVersion};
pub use crate::targetinfo::NtlmTargetInformation;


/// The magic value at the start of every NTLMSSP data packet.
pub const NTLMSSP_MAGIC: [u8; 8] = *b"NTLMSSP\0";

/// URL schemes a probe target may use, sorted.
pub const SUPPORTED_SCHEMES: [&str; 4] = ["http", "https", "ldap", "ldaps"];


bitflags! {
    /// NTLM operation flags.
    #[derive(Clone, Copy, Debug, Default, Hash, Eq, Ord, PartialEq, PartialOrd)]
    pub struct Flags: u32 {
        const NEGOTIATE_UNICODE = 0x0000_0001;
        const NEGOTIATE_OEM = 0x0000_0002;
        const REQUEST_TARGET = 0x0000_0004;
        const UNKNOWN_8 = 0x0000_0008;
        const NEGOTIATE_SIGN = 0x0000_0010;
        const NEGOTIATE_SEAL = 0x0000_0020;
        const NEGOTIATE_DATAGRAM = 0x0000_0040;
        const NEGOTIATE_LANMAN_KEY = 0x0000_0080;
        const NEGOTIATE_NETWARE = 0x0000_0100;
        const NEGOTIATE_NTLM = 0x0000_0200;
        const UNKNOWN_400 = 0x0000_0400;
        const NEGOTIATE_ANONYMOUS = 0x0000_0800;
        const NEGOTIATE_DOMAIN_SUPPLIED = 0x0000_1000;
        const NEGOTIATE_WORKSTATION_SUPPLIED = 0x0000_2000;
        const NEGOTIATE_LOCAL_CALL = 0x0000_4000;
        const NEGOTIATE_ALWAYS_SIGN = 0x0000_8000;
        const TARGET_TYPE_DOMAIN = 0x0001_0000;
        const TARGET_TYPE_SERVER = 0x0002_0000;
        const TARGET_TYPE_SHARE = 0x0004_0000;
        const NEGOTIATE_EXTENDED_SESSION_SECURITY = 0x0008_0000;
        const REQUEST_INIT_RESPONSE = 0x0010_0000;
        const REQUEST_ACCEPT_RESPONSE = 0x0020_0000;
        const REQUEST_NON_NT_SESSION_KEY = 0x0040_0000;
        const NEGOTIATE_TARGET_INFO = 0x0080_0000;
        const UNKNOWN_1000000 = 0x0100_0000;
        const NEGOTIATE_VERSION = 0x0200_0000;
        const UNKNOWN_4000000 = 0x0400_0000;
        const UNKNOWN_8000000 = 0x0800_0000;
        const UNKNOWN_10000000 = 0x1000_0000;
        const NEGOTIATE_128BIT = 0x2000_0000;
        const NEGOTIATE_KEY_EXCHANGE = 0x4000_0000;
        const NEGOTIATE_56BIT = 0x8000_0000;
    }
}
impl Flags {
    /// The minimum flag set an anonymous probe advertises: a target and
    /// extended session security are requested, no domain or workstation is
    /// supplied. Callers wanting a different negotiation add or remove
    /// individual bits from this set.
    pub fn anonymous_probe() -> Self {
        Self::NEGOTIATE_UNICODE
        | Self::NEGOTIATE_OEM
        | Self::REQUEST_TARGET
        | Self::NEGOTIATE_NTLM
        | Self::NEGOTIATE_ALWAYS_SIGN
        | Self::NEGOTIATE_EXTENDED_SESSION_SECURITY
    }
}


/// An error that may occur while decoding NTLM wire data.
///
/// Every variant means the message is structurally invalid; the probe that
/// hit it is over and is not retried.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum ProtocolError {
    /// The message does not start with the `NTLMSSP\0` signature.
    BadSignature { obtained: Vec<u8> },

    /// The message is not a Challenge message.
    WrongMessageType { obtained: u32 },

    /// A variable-length field claims bytes past the end of the buffer.
    FieldOutOfBounds { offset: usize, length: usize, buffer_len: usize },

    /// A declared length reaches past the end of the available data.
    Truncated { expected_at_least: usize, obtained: usize },

    /// The AV pair sequence ended without an end-of-list entry.
    Unterminated,

    /// A value could not be decoded as text or base64.
    Encoding { detail: String },

    /// A fixed-size value arrived with the wrong length.
    MalformedField { av_id: u16, expected_len: usize, obtained_len: usize },
}
impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadSignature { obtained }
                => write!(f, "mismatched signature (expected {:?}, obtained {:?})", NTLMSSP_MAGIC, obtained),
            Self::WrongMessageType { obtained }
                => write!(f, "message type {} is not a challenge message", obtained),
            Self::FieldOutOfBounds { offset, length, buffer_len }
                => write!(f, "field at offset {} with length {} reaches past the end of the {}-byte message", offset, length, buffer_len),
            Self::Truncated { expected_at_least, obtained }
                => write!(f, "data too short (expected at least {} bytes, obtained {})", expected_at_least, obtained),
            Self::Unterminated
                => write!(f, "AV pair sequence is not terminated by an end-of-list entry"),
            Self::Encoding { detail }
                => write!(f, "encoding error: {}", detail),
            Self::MalformedField { av_id, expected_len, obtained_len }
                => write!(f, "AV pair 0x{:04x} has length {} (expected {})", av_id, obtained_len, expected_len),
        }
    }
}
impl std::error::Error for ProtocolError {
}

/// A failure of one of the transport collaborators, surfaced verbatim.
#[derive(Debug)]
pub enum TransportError {
    /// The HTTP client failed.
    Http(reqwest::Error),

    /// Socket-level input/output failed.
    Io(io::Error),

    /// The TLS layer of an `ldaps` connection failed.
    Tls(native_tls::Error),
}
impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(error) => write!(f, "HTTP transport failure: {}", error),
            Self::Io(error) => write!(f, "transport failure: {}", error),
            Self::Tls(error) => write!(f, "TLS failure: {}", error),
        }
    }
}
impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Http(error) => Some(error),
            Self::Io(error) => Some(error),
            Self::Tls(error) => Some(error),
        }
    }
}

/// An error that may occur while probing a target for its NTLM metadata.
#[derive(Debug)]
pub enum ExtractionError {
    /// The target URL uses a scheme no acquisition path exists for.
    UnsupportedScheme { scheme: String },

    /// A transport collaborator failed before any NTLM exchange concluded.
    Transport(TransportError),

    /// The server's answer is not a structurally valid NTLM message.
    Protocol(ProtocolError),

    /// The HTTP response carried no `WWW-Authenticate` header at all.
    MissingAuthHeader,

    /// The HTTP response offered authentication schemes, none of them NTLM.
    NoNtlmScheme,

    /// The bind attempt finished without a Challenge message being captured.
    NoChallengeCaptured,

    /// The probe did not finish within its deadline.
    Timeout { limit: Duration },
}
impl fmt::Display for ExtractionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedScheme { scheme }
                => write!(f, "unsupported scheme {:?} (supported schemes: {})", scheme, SUPPORTED_SCHEMES.join(", ")),
            Self::Transport(error)
                => write!(f, "{}", error),
            Self::Protocol(error)
                => write!(f, "invalid NTLM challenge message: {}", error),
            Self::MissingAuthHeader
                => write!(f, "no WWW-Authenticate header in response"),
            Self::NoNtlmScheme
                => write!(f, "no NTLM authentication type in WWW-Authenticate header"),
            Self::NoChallengeCaptured
                => write!(f, "no NTLM challenge message was captured during the bind attempt"),
            Self::Timeout { limit }
                => write!(f, "probe timed out after {:?}", limit),
        }
    }
}
impl std::error::Error for ExtractionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(error) => Some(error),
            Self::Protocol(error) => Some(error),
            _ => None,
        }
    }
}
impl From<ProtocolError> for ExtractionError {
    fn from(error: ProtocolError) -> Self {
        Self::Protocol(error)
    }
}
impl From<TransportError> for ExtractionError {
    fn from(error: TransportError) -> Self {
        Self::Transport(error)
    }
}


/// Retrieves information about a target from the metadata in its NTLM
/// challenge message.
///
/// The URL scheme selects the acquisition path: `http`/`https` probe over
/// HTTP, `ldap`/`ldaps` over LDAP. The LDAP exchange is blocking and runs on
/// a worker thread, raced against the same `timeout` that also bounds its
/// socket operations.
pub async fn ntlm_target_information(url: &str, timeout: Duration) -> Result<NtlmTargetInformation, ExtractionError> {
    let scheme = url.split_once("://")
        .map(|(scheme, _)| scheme.to_ascii_lowercase())
        .unwrap_or_default();
    let challenge = match scheme.as_str() {
        "http" | "https" => http::acquire(url, timeout).await?,
        "ldap" | "ldaps" => {
            let url = url.to_owned();
            let probe = tokio::task::spawn_blocking(move || ldap::acquire(&url, timeout));
            match tokio::time::timeout(timeout, probe).await {
                Ok(Ok(outcome)) => outcome?,
                Ok(Err(join_error)) => {
                    return Err(ExtractionError::Transport(TransportError::Io(
                        io::Error::new(io::ErrorKind::Other, join_error),
                    )));
                },
                Err(_elapsed) => return Err(ExtractionError::Timeout { limit: timeout }),
            }
        },
        _ => return Err(ExtractionError::UnsupportedScheme { scheme }),
    };
    Ok(NtlmTargetInformation::new(challenge.target_info))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_scheme_is_rejected() {
        let error = ntlm_target_information("ftp://example.com", Duration::from_secs(1))
            .await.unwrap_err();
        match error {
            ExtractionError::UnsupportedScheme { scheme } => assert_eq!(scheme, "ftp"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_scheme_is_rejected() {
        let error = ntlm_target_information("example.com", Duration::from_secs(1))
            .await.unwrap_err();
        assert!(matches!(error, ExtractionError::UnsupportedScheme { scheme } if scheme.is_empty()));
    }
}
