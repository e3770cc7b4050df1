//! Encoding of Negotiate messages and defensive parsing of Challenge
//! messages.
//!
//! Challenge messages address their variable-length payload through
//! length/offset descriptors whose values the server controls; every
//! descriptor is bounds-checked against the actual buffer before any byte
//! behind it is read.


use crate::avpair::{utf16_le_bytes_to_string, AvPairSequence};
use crate::{Flags, ProtocolError, NTLMSSP_MAGIC};


/// Message type of an NTLM Negotiate message.
pub const NEGOTIATE_MESSAGE_TYPE: u32 = 0x0000_0001;

/// Message type of an NTLM Challenge message.
pub const CHALLENGE_MESSAGE_TYPE: u32 = 0x0000_0002;

/// Fixed portion of a Challenge message, up to and including the target
/// information descriptor.
const CHALLENGE_FIXED_LEN: usize = 48;

/// Fixed portion of a Challenge message including the version block.
const CHALLENGE_VERSIONED_LEN: usize = 56;


/// A descriptor addressing a variable-length field in the trailing payload
/// of a message: length, maximum length and offset from the message start.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct FieldDescriptor {
    pub length: u16,
    pub max_length: u16,
    pub offset: u32,
}
impl FieldDescriptor {
    /// Creates a descriptor for the given payload slice at the given offset.
    fn for_payload(data: &[u8], offset: u32) -> Self {
        let len_u16: u16 = data.len()
            .try_into().expect("payload too long for u16 length");
        Self {
            length: len_u16,
            max_length: len_u16,
            offset,
        }
    }

    /// Serializes the descriptor into its 8-byte wire form.
    fn to_bytes(self) -> [u8; 8] {
        let mut ret = [0; 8];
        ret[0..2].copy_from_slice(&self.length.to_le_bytes());
        ret[2..4].copy_from_slice(&self.max_length.to_le_bytes());
        ret[4..8].copy_from_slice(&self.offset.to_le_bytes());
        ret
    }

    /// Reads a descriptor at `at`; the caller guarantees `at + 8` is in range.
    fn read(buffer: &[u8], at: usize) -> Self {
        Self {
            length: u16::from_le_bytes(buffer[at..at+2].try_into().unwrap()),
            max_length: u16::from_le_bytes(buffer[at+2..at+4].try_into().unwrap()),
            offset: u32::from_le_bytes(buffer[at+4..at+8].try_into().unwrap()),
        }
    }

    /// Resolves the descriptor against the message buffer.
    ///
    /// The buffer is never dereferenced past its own end: a descriptor whose
    /// `offset + length` exceeds the buffer fails with
    /// [`ProtocolError::FieldOutOfBounds`] no matter what it claims.
    fn slice<'a>(&self, buffer: &'a [u8]) -> Result<&'a [u8], ProtocolError> {
        let offset = self.offset as usize;
        let length = usize::from(self.length);
        if length == 0 {
            return Ok(&buffer[0..0]);
        }
        if offset.checked_add(length).map_or(true, |end| end > buffer.len()) {
            return Err(ProtocolError::FieldOutOfBounds {
                offset,
                length,
                buffer_len: buffer.len(),
            });
        }
        Ok(&buffer[offset..offset+length])
    }
}


/// A structure representing the version of an operating system as well as the
/// NTLM revision used.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct OsVersion {
    pub major_version: u8,
    pub minor_version: u8,
    pub build_number: u16,
    pub reserved: [u8; 3],
    pub ntlm_revision: u8,
}
impl OsVersion {
    /// Serializes the version structure into bytes.
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut ret = [0; 8];
        ret[0] = self.major_version;
        ret[1] = self.minor_version;
        ret[2..4].copy_from_slice(&self.build_number.to_le_bytes());
        ret[4..7].copy_from_slice(&self.reserved);
        ret[7] = self.ntlm_revision;
        ret
    }

    /// Deserializes the version structure from its 8-byte wire form.
    pub fn from_bytes(value: [u8; 8]) -> Self {
        Self {
            major_version: value[0],
            minor_version: value[1],
            build_number: u16::from_le_bytes(value[2..4].try_into().unwrap()),
            reserved: value[4..7].try_into().unwrap(),
            ntlm_revision: value[7],
        }
    }
}


/// The contents of an NTLM Negotiate message.
///
/// The Negotiate message is the first message in an NTLM challenge-response
/// process and is sent by the client to the server; the server is expected to
/// respond with a Challenge message.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct NegotiateMessage {
    /// Stores which information has been specified and which NTLM behavior
    /// should be negotiated.
    pub flags: Flags,

    /// The domain against which the client wishes to authenticate.
    pub supplied_domain: String,

    /// The NT hostname of the client.
    pub supplied_workstation: String,

    /// Version information about the client's operating system.
    pub os_version: OsVersion,
}
impl NegotiateMessage {
    /// The Negotiate message this crate probes with: the minimum anonymous
    /// flag set and no supplied domain or workstation name.
    pub fn anonymous_probe() -> Self {
        Self::with_flags(Flags::anonymous_probe())
    }

    /// A Negotiate message carrying the given flags and no supplied domain
    /// or workstation name.
    pub fn with_flags(flags: Flags) -> Self {
        Self {
            flags,
            supplied_domain: String::new(),
            supplied_workstation: String::new(),
            os_version: OsVersion::default(),
        }
    }

    /// Serializes the Negotiate message into bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut payload_offset: u32
            = 8 // signature
            + 4 // message type
            + 4 // flags
            + 8 // supplied domain descriptor
            + 8 // supplied workstation descriptor
            + 8 // version
            ;

        let mut ret = Vec::new();
        let mut data_block = Vec::new();

        ret.extend_from_slice(&NTLMSSP_MAGIC);
        ret.extend_from_slice(&NEGOTIATE_MESSAGE_TYPE.to_le_bytes());
        ret.extend_from_slice(&self.flags.bits().to_le_bytes());
        append_name_field(&mut ret, &mut data_block, &mut payload_offset, self.flags, &self.supplied_domain);
        append_name_field(&mut ret, &mut data_block, &mut payload_offset, self.flags, &self.supplied_workstation);
        ret.extend_from_slice(&self.os_version.to_bytes());
        ret.append(&mut data_block);
        ret
    }
}

/// Appends a name field to the end of a message.
///
/// The descriptor is appended to `message_bytes` while the encoded name
/// itself is appended to `data_block`, which the caller appends to the
/// message once all fixed fields are in place. `payload_offset` tracks the
/// next free offset in the message at which field data can land.
fn append_name_field(message_bytes: &mut Vec<u8>, data_block: &mut Vec<u8>, payload_offset: &mut u32, flags: Flags, name: &str) {
    let encoded: Vec<u8> = if flags.contains(Flags::NEGOTIATE_UNICODE) {
        name.encode_utf16()
            .flat_map(|w| w.to_le_bytes())
            .collect()
    } else {
        name.as_bytes().to_vec()
    };

    data_block.extend_from_slice(&encoded);

    let descriptor = FieldDescriptor::for_payload(&encoded, *payload_offset);
    message_bytes.extend_from_slice(&descriptor.to_bytes());

    *payload_offset += u32::from(descriptor.length);
}

/// Converts field bytes into a string, as UTF-16 or the OEM fallback
/// depending on the `flags`.
fn name_bytes_to_string(flags: Flags, bytes: &[u8]) -> Result<String, ProtocolError> {
    if flags.contains(Flags::NEGOTIATE_UNICODE) {
        utf16_le_bytes_to_string(bytes)
    } else {
        String::from_utf8(Vec::from(bytes))
            .map_err(|_| ProtocolError::Encoding {
                detail: format!("OEM-encoded value is not valid UTF-8: {:02x?}", bytes),
            })
    }
}


/// The contents of an NTLM Challenge message.
///
/// The Challenge message is sent by the server in response to the client's
/// Negotiate message; it carries the nonce the client would have to respond
/// to, and with it the target information this crate is after.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChallengeMessage {
    /// The host against which the client is authenticating.
    pub target_name: String,

    /// Stores which NTLM behavior has been accepted by the server from the
    /// client's request.
    pub flags: Flags,

    /// The challenge value.
    pub challenge: [u8; 8],

    /// Eight reserved bytes following the challenge value.
    pub reserved: [u8; 8],

    /// Information about the targets of the authentication.
    pub target_info: AvPairSequence,

    /// Version information about the server's operating system.
    pub os_version: OsVersion,
}
impl ChallengeMessage {
    /// Parses a Challenge message from a raw buffer.
    ///
    /// The signature must equal `NTLMSSP\0` and the message type must be 2;
    /// both variable fields are bounds-checked before they are read. An
    /// empty or absent target information field parses to
    /// [`AvPairSequence::empty`], not an error.
    pub fn parse(buffer: &[u8]) -> Result<Self, ProtocolError> {
        if buffer.len() < 12 {
            return Err(ProtocolError::Truncated { expected_at_least: 12, obtained: buffer.len() });
        }
        let obtained_magic: [u8; 8] = buffer[0..8].try_into().unwrap();
        if obtained_magic != NTLMSSP_MAGIC {
            return Err(ProtocolError::BadSignature { obtained: Vec::from(obtained_magic) });
        }
        let message_type = u32::from_le_bytes(buffer[8..12].try_into().unwrap());
        if message_type != CHALLENGE_MESSAGE_TYPE {
            return Err(ProtocolError::WrongMessageType { obtained: message_type });
        }
        if buffer.len() < CHALLENGE_FIXED_LEN {
            return Err(ProtocolError::Truncated { expected_at_least: CHALLENGE_FIXED_LEN, obtained: buffer.len() });
        }

        let target_name_desc = FieldDescriptor::read(buffer, 12);
        let flags = Flags::from_bits_retain(u32::from_le_bytes(buffer[20..24].try_into().unwrap()));
        let challenge = buffer[24..32].try_into().unwrap();
        let reserved = buffer[32..40].try_into().unwrap();
        let target_info_desc = FieldDescriptor::read(buffer, 40);

        let os_version = if flags.contains(Flags::NEGOTIATE_VERSION) {
            if buffer.len() < CHALLENGE_VERSIONED_LEN {
                return Err(ProtocolError::Truncated { expected_at_least: CHALLENGE_VERSIONED_LEN, obtained: buffer.len() });
            }
            OsVersion::from_bytes(buffer[48..56].try_into().unwrap())
        } else {
            OsVersion::default()
        };

        let target_name = name_bytes_to_string(flags, target_name_desc.slice(buffer)?)?;

        let target_info_bytes = target_info_desc.slice(buffer)?;
        let target_info = if target_info_bytes.is_empty() {
            AvPairSequence::empty()
        } else {
            AvPairSequence::decode(target_info_bytes)?
        };

        Ok(Self {
            target_name,
            flags,
            challenge,
            reserved,
            target_info,
            os_version,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::avpair::{AvId, AvPair};

    fn utf16(text: &str) -> Vec<u8> {
        text.encode_utf16().flat_map(|w| w.to_le_bytes()).collect()
    }

    /// Lays out a Challenge message without a version block: fixed fields,
    /// then target name, then target info.
    fn challenge_fixture(target_name: &str, target_info: &[u8]) -> Vec<u8> {
        let name_bytes = utf16(target_name);
        let name_offset = CHALLENGE_FIXED_LEN;
        let info_offset = name_offset + name_bytes.len();

        let mut buf = Vec::new();
        buf.extend_from_slice(b"NTLMSSP\0");
        buf.extend_from_slice(&2u32.to_le_bytes());
        buf.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
        buf.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
        buf.extend_from_slice(&(name_offset as u32).to_le_bytes());
        let flags = Flags::NEGOTIATE_UNICODE | Flags::REQUEST_TARGET | Flags::NEGOTIATE_TARGET_INFO;
        buf.extend_from_slice(&flags.bits().to_le_bytes());
        buf.extend_from_slice(&[0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF]);
        buf.extend_from_slice(&[0u8; 8]);
        buf.extend_from_slice(&(target_info.len() as u16).to_le_bytes());
        buf.extend_from_slice(&(target_info.len() as u16).to_le_bytes());
        buf.extend_from_slice(&(info_offset as u32).to_le_bytes());
        buf.extend_from_slice(&name_bytes);
        buf.extend_from_slice(target_info);
        buf
    }

    #[test]
    fn negotiate_message_layout() {
        #[rustfmt::skip]
        let expected: &[u8] = &[
            // Signature (8 bytes):
            0x4E, 0x54, 0x4C, 0x4D, 0x53, 0x53, 0x50, 0x00,
            // MessageType (4 bytes):
            0x01, 0x00, 0x00, 0x00,
            // NegotiateFlags (4 bytes): UNICODE | OEM | REQUEST_TARGET
            //   | NTLM | ALWAYS_SIGN | EXTENDED_SESSION_SECURITY
            0x07, 0x82, 0x08, 0x00,
            // DomainNameFields (8 bytes): empty, offset 40
            0x00, 0x00, 0x00, 0x00, 0x28, 0x00, 0x00, 0x00,
            // WorkstationFields (8 bytes): empty, offset 40
            0x00, 0x00, 0x00, 0x00, 0x28, 0x00, 0x00, 0x00,
            // Version (8 bytes): zeroed
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        assert_eq!(NegotiateMessage::anonymous_probe().to_bytes(), expected);
    }

    #[test]
    fn parse_challenge_extracts_fields() {
        let mut info = Vec::new();
        info.extend_from_slice(&[0x04, 0x00, 0x08, 0x00]);
        info.extend_from_slice(&utf16("corp"));
        info.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        let buffer = challenge_fixture("CORP", &info);

        let challenge = ChallengeMessage::parse(&buffer).unwrap();
        assert_eq!(challenge.target_name, "CORP");
        assert_eq!(challenge.challenge, [0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF]);
        assert!(challenge.flags.contains(Flags::NEGOTIATE_TARGET_INFO));
        assert_eq!(
            challenge.target_info.find(AvId::DnsDomainName),
            Some(&AvPair::DnsDomainName("corp".to_owned())),
        );
    }

    #[test]
    fn parse_rejects_bad_signature() {
        let mut buffer = challenge_fixture("CORP", &[0x00, 0x00, 0x00, 0x00]);
        buffer[0] = b'X';
        assert_eq!(
            ChallengeMessage::parse(&buffer),
            Err(ProtocolError::BadSignature {
                obtained: vec![b'X', b'T', b'L', b'M', b'S', b'S', b'P', 0x00],
            }),
        );
    }

    #[test]
    fn parse_rejects_wrong_message_type() {
        let mut buffer = challenge_fixture("CORP", &[0x00, 0x00, 0x00, 0x00]);
        buffer[8] = 0x03;
        assert_eq!(
            ChallengeMessage::parse(&buffer),
            Err(ProtocolError::WrongMessageType { obtained: 3 }),
        );
    }

    #[test]
    fn parse_rejects_out_of_bounds_target_info() {
        let mut buffer = challenge_fixture("CORP", &[0x00, 0x00, 0x00, 0x00]);
        // inflate the target info length far past the end of the buffer
        let len = buffer.len();
        buffer[40..42].copy_from_slice(&0x4000u16.to_le_bytes());
        buffer[42..44].copy_from_slice(&0x4000u16.to_le_bytes());
        let err = ChallengeMessage::parse(&buffer).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::FieldOutOfBounds { offset: 56, length: 0x4000, buffer_len: len },
        );
    }

    #[test]
    fn parse_rejects_out_of_bounds_target_name() {
        let mut buffer = challenge_fixture("CORP", &[0x00, 0x00, 0x00, 0x00]);
        buffer[16..20].copy_from_slice(&0xFFFF_FFF0u32.to_le_bytes());
        assert!(matches!(
            ChallengeMessage::parse(&buffer),
            Err(ProtocolError::FieldOutOfBounds { .. }),
        ));
    }

    #[test]
    fn parse_empty_target_info_yields_empty_sequence() {
        let buffer = challenge_fixture("CORP", &[]);
        let challenge = ChallengeMessage::parse(&buffer).unwrap();
        assert!(challenge.target_info.is_empty());
        assert_eq!(challenge.target_info, AvPairSequence::empty());
    }

    #[test]
    fn parse_rejects_short_buffer() {
        assert_eq!(
            ChallengeMessage::parse(b"NTLMSSP\0\x02\x00"),
            Err(ProtocolError::Truncated { expected_at_least: 12, obtained: 10 }),
        );
        let mut buffer = Vec::from(&b"NTLMSSP\0"[..]);
        buffer.extend_from_slice(&2u32.to_le_bytes());
        buffer.extend_from_slice(&[0u8; 8]);
        assert_eq!(
            ChallengeMessage::parse(&buffer),
            Err(ProtocolError::Truncated { expected_at_least: 48, obtained: 20 }),
        );
    }
}
