//! Challenge acquisition over HTTP.
//!
//! One anonymous request carrying a Negotiate message is enough to make an
//! NTLM-enabled endpoint answer with a Challenge message in its
//! `WWW-Authenticate` header.


use std::time::Duration;

use base64::prelude::{Engine, BASE64_STANDARD};
use reqwest::header;
use tracing::debug;

use crate::message::{ChallengeMessage, NegotiateMessage};
use crate::{ExtractionError, ProtocolError, TransportError};


/// Probes `url` with one unauthenticated GET and parses the Challenge
/// message the server offers back.
///
/// The request is aborted once `timeout` elapses. Certificate validation is
/// disabled: the probe is after the NTLM metadata, not the server identity.
pub async fn acquire(url: &str, timeout: Duration) -> Result<ChallengeMessage, ExtractionError> {
    let negotiate = NegotiateMessage::anonymous_probe().to_bytes();

    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(timeout)
        .build()
        .map_err(|error| ExtractionError::Transport(TransportError::Http(error)))?;

    debug!(url, "sending NTLM negotiate probe");
    let response = client.get(url)
        .header(header::AUTHORIZATION, format!("NTLM {}", BASE64_STANDARD.encode(&negotiate)))
        .send().await
        .map_err(|error| {
            if error.is_timeout() {
                ExtractionError::Timeout { limit: timeout }
            } else {
                ExtractionError::Transport(TransportError::Http(error))
            }
        })?;

    let token = challenge_token(
        response.headers()
            .get_all(header::WWW_AUTHENTICATE)
            .iter()
            .map(|value| value.to_str().ok()),
    )?.to_owned();
    debug!(token_len = token.len(), "NTLM challenge token offered");

    let raw = BASE64_STANDARD.decode(token.as_bytes())
        .map_err(|error| ProtocolError::Encoding {
            detail: format!("challenge token is not valid base64: {}", error),
        })?;
    ChallengeMessage::parse(&raw)
        .map_err(ExtractionError::Protocol)
}

/// Picks the NTLM challenge token out of the `WWW-Authenticate` values.
///
/// A server may offer several schemes, comma-separated within one value or
/// spread over repeated headers; the first token with an `NTLM ` prefix
/// wins. Values that are not valid visible ASCII arrive as `None` and still
/// count as the header being present.
fn challenge_token<'a>(values: impl Iterator<Item = Option<&'a str>>) -> Result<&'a str, ExtractionError> {
    let mut header_present = false;
    for value in values {
        header_present = true;
        let Some(value) = value else { continue };
        for scheme in value.split(',') {
            if let Some(token) = scheme.trim().strip_prefix("NTLM ") {
                return Ok(token.trim());
            }
        }
    }
    if header_present {
        Err(ExtractionError::NoNtlmScheme)
    } else {
        Err(ExtractionError::MissingAuthHeader)
    }
}
