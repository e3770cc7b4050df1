//! Challenge acquisition over LDAP.
//!
//! Active Directory exposes NTLM through the sicily bind sequence: the
//! client first discovers the offered packages, then sends a Negotiate
//! message, and the server answers with the Challenge message inside the
//! `matchedDN` field of its bind response. The probe drives exactly that
//! exchange over a plain socket and hands the Challenge bytes to an injected
//! callback the moment they are read; the bind itself is abandoned
//! unanswered, so it never completes and its failure is of no interest.
//!
//! Only the handful of BER shapes this one exchange needs are implemented
//! here; the published LDAP client crates offer no hook to observe the
//! server credentials mid-bind.


use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use native_tls::TlsConnector;
use tracing::{debug, trace};

use crate::message::{ChallengeMessage, NegotiateMessage};
use crate::{ExtractionError, TransportError};


const LDAP_PORT: u16 = 389;
const LDAPS_PORT: u16 = 636;

const TAG_SEQUENCE: u8 = 0x30;
const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_ENUMERATED: u8 = 0x0A;
const TAG_BIND_REQUEST: u8 = 0x60;
const TAG_BIND_RESPONSE: u8 = 0x61;
const TAG_UNBIND_REQUEST: u8 = 0x42;
// AuthenticationChoice context tags of the sicily exchange.
const TAG_SICILY_PACKAGE_DISCOVERY: u8 = 0x89;
const TAG_SICILY_NEGOTIATE: u8 = 0x8A;


/// Probes `server` with one anonymous sicily NTLM bind and parses the
/// Challenge message captured along the way.
///
/// `timeout` bounds the connect as well as each read and write on the
/// socket. The bind attempt itself is allowed to fail however it likes, a
/// rejected connection included; what matters is whether a Challenge was
/// captured before that. An empty capture slot fails with
/// [`ExtractionError::NoChallengeCaptured`]. Only an expired deadline is
/// reported as what it is, [`ExtractionError::Timeout`].
pub fn acquire(server: &str, timeout: Duration) -> Result<ChallengeMessage, ExtractionError> {
    let endpoint = LdapEndpoint::parse(server)?;

    let mut captured: Option<Vec<u8>> = None;
    if let Err(error) = run_bind(&endpoint, timeout, &mut captured) {
        if matches!(
            &error,
            ExtractionError::Transport(TransportError::Io(inner))
                if matches!(inner.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
        ) {
            return Err(ExtractionError::Timeout { limit: timeout });
        }
        // a bind that goes nowhere is an expected outcome of probing with no
        // credentials; the empty capture slot is the reportable result
        debug!(%error, "bind attempt failed");
    }

    let raw = captured.ok_or(ExtractionError::NoChallengeCaptured)?;
    debug!(len = raw.len(), "challenge message captured");
    ChallengeMessage::parse(&raw)
        .map_err(ExtractionError::Protocol)
}

/// Connects to the endpoint and drives the bind, filling `captured` with the
/// first Challenge the server hands out.
fn run_bind(endpoint: &LdapEndpoint, timeout: Duration, captured: &mut Option<Vec<u8>>) -> Result<(), ExtractionError> {
    debug!(host = %endpoint.host, port = endpoint.port, tls = endpoint.tls, "connecting for NTLM bind attempt");

    let address = (endpoint.host.as_str(), endpoint.port)
        .to_socket_addrs()
        .map_err(|error| ExtractionError::Transport(TransportError::Io(error)))?
        .next()
        .ok_or_else(|| ExtractionError::Transport(TransportError::Io(
            io::Error::new(io::ErrorKind::NotFound, format!("no addresses resolved for {}", endpoint.host)),
        )))?;
    let stream = TcpStream::connect_timeout(&address, timeout)
        .map_err(|error| ExtractionError::Transport(TransportError::Io(error)))?;
    stream.set_read_timeout(Some(timeout))
        .map_err(|error| ExtractionError::Transport(TransportError::Io(error)))?;
    stream.set_write_timeout(Some(timeout))
        .map_err(|error| ExtractionError::Transport(TransportError::Io(error)))?;

    let negotiate = NegotiateMessage::anonymous_probe().to_bytes();
    let mut sink = |raw: &[u8]| {
        if captured.is_none() {
            *captured = Some(Vec::from(raw));
        }
    };
    if endpoint.tls {
        let connector = TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|error| ExtractionError::Transport(TransportError::Tls(error)))?;
        let mut stream = connector.connect(&endpoint.host, stream)
            .map_err(|error| match error {
                native_tls::HandshakeError::Failure(failure)
                    => ExtractionError::Transport(TransportError::Tls(failure)),
                native_tls::HandshakeError::WouldBlock(_)
                    => ExtractionError::Transport(TransportError::Io(
                        io::Error::new(io::ErrorKind::WouldBlock, "TLS handshake interrupted"),
                    )),
            })?;
        sicily_bind(&mut stream, &negotiate, &mut sink)
    } else {
        let mut stream = stream;
        sicily_bind(&mut stream, &negotiate, &mut sink)
    }
}


/// Host, port and TLS selection parsed out of an `ldap://` or `ldaps://` URL.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct LdapEndpoint {
    host: String,
    port: u16,
    tls: bool,
}
impl LdapEndpoint {
    fn parse(server: &str) -> Result<Self, ExtractionError> {
        let (scheme, rest) = server.split_once("://")
            .ok_or_else(|| ExtractionError::UnsupportedScheme { scheme: String::new() })?;
        let tls = match scheme.to_ascii_lowercase().as_str() {
            "ldap" => false,
            "ldaps" => true,
            other => return Err(ExtractionError::UnsupportedScheme { scheme: other.to_owned() }),
        };
        let default_port = if tls { LDAPS_PORT } else { LDAP_PORT };

        let authority = rest.split(['/', '?']).next().unwrap_or(rest);
        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            // bracketed IPv6 literal
            let (host, after) = bracketed.split_once(']')
                .ok_or_else(|| ExtractionError::Transport(TransportError::Io(
                    io::Error::new(io::ErrorKind::InvalidInput, format!("unclosed IPv6 literal in {:?}", authority)),
                )))?;
            let port = match after.strip_prefix(':') {
                Some(port_text) => parse_port(port_text, authority)?,
                None => default_port,
            };
            (host.to_owned(), port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port_text)) => (host.to_owned(), parse_port(port_text, authority)?),
                None => (authority.to_owned(), default_port),
            }
        };
        if host.is_empty() {
            return Err(ExtractionError::Transport(TransportError::Io(
                io::Error::new(io::ErrorKind::InvalidInput, format!("no host in {:?}", server)),
            )));
        }
        Ok(Self { host, port, tls })
    }
}

fn parse_port(text: &str, authority: &str) -> Result<u16, ExtractionError> {
    text.parse().map_err(|_| ExtractionError::Transport(TransportError::Io(
        io::Error::new(io::ErrorKind::InvalidInput, format!("invalid port in {:?}", authority)),
    )))
}


/// Drives the sicily bind exchange on an established stream.
///
/// `on_challenge` is invoked synchronously with the raw Challenge message
/// bytes at the moment they are read out of the server's bind response; the
/// exchange then stops without ever answering the challenge.
fn sicily_bind<S: Read + Write>(
    stream: &mut S,
    negotiate: &[u8],
    on_challenge: &mut dyn FnMut(&[u8]),
) -> Result<(), ExtractionError> {
    let request = bind_request(1, b"", TAG_SICILY_PACKAGE_DISCOVERY, b"");
    stream.write_all(&request).map_err(transport_io)?;
    stream.flush().map_err(transport_io)?;

    let body = read_ldap_message(stream).map_err(transport_io)?;
    let discovery = parse_bind_response(&body).map_err(transport_io)?;
    let packages = String::from_utf8_lossy(&discovery.matched).into_owned();
    trace!(result_code = discovery.result_code, %packages, "sicily package discovery answered");
    if !packages.split(';').any(|package| package.trim().eq_ignore_ascii_case("NTLM")) {
        debug!("server offers no NTLM sicily package");
        return Ok(());
    }

    let request = bind_request(2, b"NTLM", TAG_SICILY_NEGOTIATE, negotiate);
    stream.write_all(&request).map_err(transport_io)?;
    stream.flush().map_err(transport_io)?;

    let body = read_ldap_message(stream).map_err(transport_io)?;
    let response = parse_bind_response(&body).map_err(transport_io)?;
    trace!(
        result_code = response.result_code,
        diagnostic = %String::from_utf8_lossy(&response.diagnostic),
        creds_len = response.matched.len(),
        "sicily negotiate answered",
    );
    if !response.matched.is_empty() {
        on_challenge(&response.matched);
    }

    // abandon the bind; the server is owed an Authenticate message it will
    // never get
    let _ = stream.write_all(&unbind_request(3));
    let _ = stream.flush();
    Ok(())
}

fn transport_io(error: io::Error) -> ExtractionError {
    ExtractionError::Transport(TransportError::Io(error))
}


// BER plumbing


/// Encodes a BER length, long form where the short form does not reach.
fn ber_length(len: usize) -> Vec<u8> {
    if len < 0x80 {
        vec![len as u8]
    } else {
        let be = (len as u64).to_be_bytes();
        let first = be.iter().position(|&b| b != 0).unwrap_or(be.len() - 1);
        let mut ret = vec![0x80 | (be.len() - first) as u8];
        ret.extend_from_slice(&be[first..]);
        ret
    }
}

/// Encodes one tag/length/value element.
fn ber_element(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut ret = Vec::with_capacity(2 + body.len());
    ret.push(tag);
    ret.extend_from_slice(&ber_length(body.len()));
    ret.extend_from_slice(body);
    ret
}

/// A cursor over the elements of a BER-encoded body.
struct BerReader<'a> {
    data: &'a [u8],
    cursor: usize,
}
impl<'a> BerReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, cursor: 0 }
    }

    fn read_element(&mut self) -> io::Result<(u8, &'a [u8])> {
        if self.data.len() - self.cursor < 2 {
            return Err(invalid_data("BER element header out of data"));
        }
        let tag = self.data[self.cursor];
        let mut length = usize::from(self.data[self.cursor + 1]);
        self.cursor += 2;
        if length & 0x80 != 0 {
            let length_octets = length & 0x7F;
            if length_octets == 0 || length_octets > 4 {
                return Err(invalid_data("unsupported BER length form"));
            }
            if self.data.len() - self.cursor < length_octets {
                return Err(invalid_data("BER length out of data"));
            }
            length = self.data[self.cursor..self.cursor + length_octets]
                .iter()
                .fold(0usize, |acc, &b| (acc << 8) | usize::from(b));
            self.cursor += length_octets;
        }
        if self.data.len() - self.cursor < length {
            return Err(invalid_data("BER value out of data"));
        }
        let body = &self.data[self.cursor..self.cursor + length];
        self.cursor += length;
        Ok((tag, body))
    }
}

fn invalid_data(detail: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, detail.to_owned())
}

/// Assembles one LDAP bind request message.
fn bind_request(message_id: u8, name: &[u8], auth_tag: u8, credentials: &[u8]) -> Vec<u8> {
    let mut bind = Vec::new();
    bind.extend_from_slice(&ber_element(TAG_INTEGER, &[0x03])); // LDAP v3
    bind.extend_from_slice(&ber_element(TAG_OCTET_STRING, name));
    bind.extend_from_slice(&ber_element(auth_tag, credentials));

    let mut message = Vec::new();
    message.extend_from_slice(&ber_element(TAG_INTEGER, &[message_id]));
    message.extend_from_slice(&ber_element(TAG_BIND_REQUEST, &bind));
    ber_element(TAG_SEQUENCE, &message)
}

/// Assembles one LDAP unbind request message.
fn unbind_request(message_id: u8) -> Vec<u8> {
    let mut message = Vec::new();
    message.extend_from_slice(&ber_element(TAG_INTEGER, &[message_id]));
    message.extend_from_slice(&[TAG_UNBIND_REQUEST, 0x00]);
    ber_element(TAG_SEQUENCE, &message)
}

/// Reads one LDAP message off the stream and returns the body of its outer
/// SEQUENCE.
fn read_ldap_message<S: Read>(stream: &mut S) -> io::Result<Vec<u8>> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header)?;
    if header[0] != TAG_SEQUENCE {
        return Err(invalid_data("response does not start with an LDAPMessage SEQUENCE"));
    }
    let mut length = usize::from(header[1]);
    if length & 0x80 != 0 {
        let length_octets = length & 0x7F;
        if length_octets == 0 || length_octets > 4 {
            return Err(invalid_data("unsupported BER length form"));
        }
        let mut be = [0u8; 4];
        stream.read_exact(&mut be[4 - length_octets..])?;
        length = be.iter().fold(0usize, |acc, &b| (acc << 8) | usize::from(b));
    }
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body)?;
    Ok(body)
}

/// The fields of a bind response the probe cares about.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct BindResponse {
    result_code: u32,
    matched: Vec<u8>,
    diagnostic: Vec<u8>,
}

/// Parses a bind response out of an LDAPMessage body.
///
/// For the sicily stages the server's credentials, package list and
/// Challenge message alike, ride in the `matchedDN` field.
fn parse_bind_response(message_body: &[u8]) -> io::Result<BindResponse> {
    let mut reader = BerReader::new(message_body);
    let (tag, _message_id) = reader.read_element()?;
    if tag != TAG_INTEGER {
        return Err(invalid_data("LDAPMessage does not start with a message ID"));
    }
    let (tag, operation) = reader.read_element()?;
    if tag != TAG_BIND_RESPONSE {
        return Err(invalid_data("LDAPMessage does not carry a bind response"));
    }

    let mut operation_reader = BerReader::new(operation);
    let (tag, result_code_bytes) = operation_reader.read_element()?;
    if tag != TAG_ENUMERATED || result_code_bytes.is_empty() || result_code_bytes.len() > 4 {
        return Err(invalid_data("bind response does not start with a result code"));
    }
    let result_code = result_code_bytes.iter()
        .fold(0u32, |acc, &b| (acc << 8) | u32::from(b));
    let (tag, matched) = operation_reader.read_element()?;
    if tag != TAG_OCTET_STRING {
        return Err(invalid_data("bind response lacks a matchedDN field"));
    }
    let (tag, diagnostic) = operation_reader.read_element()?;
    if tag != TAG_OCTET_STRING {
        return Err(invalid_data("bind response lacks a diagnostic message"));
    }

    Ok(BindResponse {
        result_code,
        matched: Vec::from(matched),
        diagnostic: Vec::from(diagnostic),
    })
}
