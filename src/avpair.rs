//! The AV pair codec for the target information block of a Challenge message.
//!
//! Target information is a sequence of id/length/value triples terminated by
//! an end-of-list sentinel. The sequence is decoded into typed values where
//! the id assigns a meaning and kept verbatim where it does not; nothing the
//! server sent is dropped.


use std::fmt;

use bitflags::bitflags;
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};

use crate::ProtocolError;


/// Number of 100-nanosecond FILETIME ticks per second.
const FILETIME_TICKS_PER_SECOND: u64 = 10_000_000;

/// Wire size of a serialized [`SingleHostData`] structure.
const SINGLE_HOST_DATA_LEN: usize = 48;


/// The identifier of an AV pair within the target information block.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum AvId {
    /// Terminates the AV pair sequence.
    Eol,
    /// The server's NetBIOS computer name.
    NbComputerName,
    /// The server's NetBIOS domain name.
    NbDomainName,
    /// The fully qualified domain name of the computer.
    DnsComputerName,
    /// The fully qualified domain name of the domain.
    DnsDomainName,
    /// The fully qualified domain name of the forest.
    DnsTreeName,
    /// A 32-bit value indicating server or client configuration.
    Flags,
    /// A FILETIME timestamp containing the server's local time.
    Timestamp,
    /// A Single_Host_Data structure.
    SingleHost,
    /// The service principal name of the target server.
    TargetName,
    /// A channel bindings hash.
    ChannelBindings,
    /// An identifier this crate does not know about.
    Unrecognized(u16),
}
impl From<AvId> for u16 {
    fn from(id: AvId) -> Self {
        match id {
            AvId::Eol => 0x0000,
            AvId::NbComputerName => 0x0001,
            AvId::NbDomainName => 0x0002,
            AvId::DnsComputerName => 0x0003,
            AvId::DnsDomainName => 0x0004,
            AvId::DnsTreeName => 0x0005,
            AvId::Flags => 0x0006,
            AvId::Timestamp => 0x0007,
            AvId::SingleHost => 0x0008,
            AvId::TargetName => 0x0009,
            AvId::ChannelBindings => 0x000A,
            AvId::Unrecognized(w) => w,
        }
    }
}
impl From<u16> for AvId {
    fn from(w: u16) -> Self {
        match w {
            0x0000 => AvId::Eol,
            0x0001 => AvId::NbComputerName,
            0x0002 => AvId::NbDomainName,
            0x0003 => AvId::DnsComputerName,
            0x0004 => AvId::DnsDomainName,
            0x0005 => AvId::DnsTreeName,
            0x0006 => AvId::Flags,
            0x0007 => AvId::Timestamp,
            0x0008 => AvId::SingleHost,
            0x0009 => AvId::TargetName,
            0x000A => AvId::ChannelBindings,
            other => AvId::Unrecognized(other),
        }
    }
}


bitflags! {
    /// Configuration bits carried by an [`AvPair::Flags`] entry.
    #[derive(Clone, Copy, Debug, Default, Hash, Eq, Ord, PartialEq, PartialOrd)]
    pub struct AvFlags: u32 {
        const ACCOUNT_AUTHENTICATION_CONSTRAINED = 0x0000_0001;
        const MIC_PROVIDED = 0x0000_0002;
        const UNTRUSTED_SPN_SOURCE = 0x0000_0004;
    }
}


/// A Single_Host_Data structure identifying the originating host.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SingleHostData {
    pub size: u32,
    pub z4: u32,
    pub custom_data: [u8; 8],
    pub machine_id: [u8; 32],
}
impl SingleHostData {
    /// Serializes the structure into its fixed 48-byte wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut ret = Vec::with_capacity(SINGLE_HOST_DATA_LEN);
        ret.extend_from_slice(&self.size.to_le_bytes());
        ret.extend_from_slice(&self.z4.to_le_bytes());
        ret.extend_from_slice(&self.custom_data);
        ret.extend_from_slice(&self.machine_id);
        ret
    }
}
impl TryFrom<&[u8]> for SingleHostData {
    type Error = ProtocolError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() != SINGLE_HOST_DATA_LEN {
            return Err(ProtocolError::MalformedField {
                av_id: AvId::SingleHost.into(),
                expected_len: SINGLE_HOST_DATA_LEN,
                obtained_len: value.len(),
            });
        }
        Ok(Self {
            size: u32::from_le_bytes(value[0..4].try_into().unwrap()),
            z4: u32::from_le_bytes(value[4..8].try_into().unwrap()),
            custom_data: value[8..16].try_into().unwrap(),
            machine_id: value[16..48].try_into().unwrap(),
        })
    }
}
impl fmt::Display for SingleHostData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "size={} custom_data={} machine_id={}",
            self.size,
            hex::encode(self.custom_data),
            hex::encode(self.machine_id),
        )
    }
}


/// A single typed attribute/value entry of the target information block.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AvPair {
    Eol,
    NbComputerName(String),
    NbDomainName(String),
    DnsComputerName(String),
    DnsDomainName(String),
    DnsTreeName(String),
    Flags(AvFlags),
    Timestamp(DateTime<Utc>),
    SingleHost(SingleHostData),
    TargetName(Vec<u8>),
    ChannelBindings(Vec<u8>),
    Unrecognized { id: u16, data: Vec<u8> },
}
impl AvPair {
    /// Returns the identifier corresponding to this pair's variant.
    pub fn id(&self) -> AvId {
        match self {
            Self::Eol => AvId::Eol,
            Self::NbComputerName(_) => AvId::NbComputerName,
            Self::NbDomainName(_) => AvId::NbDomainName,
            Self::DnsComputerName(_) => AvId::DnsComputerName,
            Self::DnsDomainName(_) => AvId::DnsDomainName,
            Self::DnsTreeName(_) => AvId::DnsTreeName,
            Self::Flags(_) => AvId::Flags,
            Self::Timestamp(_) => AvId::Timestamp,
            Self::SingleHost(_) => AvId::SingleHost,
            Self::TargetName(_) => AvId::TargetName,
            Self::ChannelBindings(_) => AvId::ChannelBindings,
            Self::Unrecognized { id, .. } => AvId::Unrecognized(*id),
        }
    }

    /// Decodes the value bytes of one pair according to its identifier.
    fn decode_value(id: AvId, data: &[u8]) -> Result<Self, ProtocolError> {
        let pair = match id {
            AvId::Eol => Self::Eol,
            AvId::NbComputerName => Self::NbComputerName(utf16_le_bytes_to_string(data)?),
            AvId::NbDomainName => Self::NbDomainName(utf16_le_bytes_to_string(data)?),
            AvId::DnsComputerName => Self::DnsComputerName(utf16_le_bytes_to_string(data)?),
            AvId::DnsDomainName => Self::DnsDomainName(utf16_le_bytes_to_string(data)?),
            AvId::DnsTreeName => Self::DnsTreeName(utf16_le_bytes_to_string(data)?),
            AvId::Flags => {
                let bytes: [u8; 4] = data.try_into()
                    .map_err(|_| ProtocolError::MalformedField {
                        av_id: AvId::Flags.into(),
                        expected_len: 4,
                        obtained_len: data.len(),
                    })?;
                Self::Flags(AvFlags::from_bits_retain(u32::from_le_bytes(bytes)))
            },
            AvId::Timestamp => {
                let bytes: [u8; 8] = data.try_into()
                    .map_err(|_| ProtocolError::MalformedField {
                        av_id: AvId::Timestamp.into(),
                        expected_len: 8,
                        obtained_len: data.len(),
                    })?;
                Self::Timestamp(filetime_to_utc(u64::from_le_bytes(bytes)))
            },
            AvId::SingleHost => Self::SingleHost(SingleHostData::try_from(data)?),
            AvId::TargetName => Self::TargetName(Vec::from(data)),
            AvId::ChannelBindings => Self::ChannelBindings(Vec::from(data)),
            AvId::Unrecognized(code) => Self::Unrecognized { id: code, data: Vec::from(data) },
        };
        Ok(pair)
    }

    /// Serializes this pair's value into its wire form.
    fn value_bytes(&self) -> Vec<u8> {
        match self {
            Self::Eol => Vec::new(),
            Self::NbComputerName(name)
            | Self::NbDomainName(name)
            | Self::DnsComputerName(name)
            | Self::DnsDomainName(name)
            | Self::DnsTreeName(name) => {
                name.encode_utf16()
                    .flat_map(|w| w.to_le_bytes())
                    .collect()
            },
            Self::Flags(flags) => flags.bits().to_le_bytes().to_vec(),
            Self::Timestamp(when) => utc_to_filetime(*when).to_le_bytes().to_vec(),
            Self::SingleHost(host) => host.to_bytes(),
            Self::TargetName(data) => data.clone(),
            Self::ChannelBindings(data) => data.clone(),
            Self::Unrecognized { data, .. } => data.clone(),
        }
    }
}


/// The ordered sequence of AV pairs carried by a Challenge message.
///
/// The sequence always contains exactly one [`AvPair::Eol`] entry, which is
/// always the last one. Wire order is preserved so that re-serialization is
/// faithful; lookup is by identifier, first match wins.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AvPairSequence {
    pairs: Vec<AvPair>,
}
impl AvPairSequence {
    /// The sequence of a Challenge message without target information,
    /// consisting of nothing but the end-of-list sentinel.
    pub fn empty() -> Self {
        Self { pairs: vec![AvPair::Eol] }
    }

    /// Assembles a sequence from pairs already in wire order.
    ///
    /// The final pair must be [`AvPair::Eol`].
    pub fn from_pairs(pairs: Vec<AvPair>) -> Self {
        debug_assert_eq!(pairs.last(), Some(&AvPair::Eol));
        Self { pairs }
    }

    /// Decodes an AV pair sequence from the given buffer.
    ///
    /// Decoding stops at the first end-of-list entry; bytes following it are
    /// ignored. A declared value length reaching past the end of the buffer
    /// fails with [`ProtocolError::Truncated`]; running out of buffer without
    /// seeing the end-of-list entry fails with [`ProtocolError::Unterminated`].
    pub fn decode(buffer: &[u8]) -> Result<Self, ProtocolError> {
        let mut pairs = Vec::new();
        let mut cursor = 0;
        loop {
            if buffer.len() - cursor < 4 {
                return Err(ProtocolError::Unterminated);
            }
            let id_raw = u16::from_le_bytes(buffer[cursor..cursor+2].try_into().unwrap());
            let length: usize = u16::from_le_bytes(buffer[cursor+2..cursor+4].try_into().unwrap()).into();
            cursor += 4;

            if length > buffer.len() - cursor {
                return Err(ProtocolError::Truncated {
                    expected_at_least: cursor + length,
                    obtained: buffer.len(),
                });
            }
            let data = &buffer[cursor..cursor+length];
            cursor += length;

            let id = AvId::from(id_raw);
            if id == AvId::Eol {
                if length != 0 {
                    return Err(ProtocolError::MalformedField {
                        av_id: id_raw,
                        expected_len: 0,
                        obtained_len: length,
                    });
                }
                pairs.push(AvPair::Eol);
                return Ok(Self { pairs });
            }
            pairs.push(AvPair::decode_value(id, data)?);
        }
    }

    /// Serializes the sequence into bytes; the structural inverse of
    /// [`decode`](Self::decode).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for pair in &self.pairs {
            let data = pair.value_bytes();
            let data_len: u16 = data.len().try_into().expect("length of AV pair value does not fit into u16");
            buf.extend_from_slice(&u16::from(pair.id()).to_le_bytes());
            buf.extend_from_slice(&data_len.to_le_bytes());
            buf.extend_from_slice(&data);
        }
        buf
    }

    /// Returns the first pair carrying the given identifier.
    pub fn find(&self, id: AvId) -> Option<&AvPair> {
        self.pairs.iter().find(|pair| pair.id() == id)
    }

    /// Iterates over the pairs in wire order, end-of-list entry included.
    pub fn iter(&self) -> impl Iterator<Item = &AvPair> {
        self.pairs.iter()
    }

    /// Whether the sequence carries nothing but the end-of-list sentinel.
    pub fn is_empty(&self) -> bool {
        self.pairs.len() == 1
    }
}
impl Default for AvPairSequence {
    fn default() -> Self {
        Self::empty()
    }
}


/// Converts UTF-16 values stored as bytes in little-endian format into a string.
pub(crate) fn utf16_le_bytes_to_string(bytes: &[u8]) -> Result<String, ProtocolError> {
    if bytes.len() % 2 != 0 {
        return Err(ProtocolError::Encoding {
            detail: format!("UTF-16 value has odd byte length {}", bytes.len()),
        });
    }
    let units: Vec<u16> = bytes.chunks_exact(2)
        .map(|chk| u16::from_le_bytes(chk.try_into().unwrap()))
        .collect();
    String::from_utf16(&units)
        .map_err(|_| ProtocolError::Encoding {
            detail: format!("invalid UTF-16 code units: {:04x?}", units),
        })
}

/// The instant FILETIME values count from: 1601-01-01T00:00:00Z.
fn windows_epoch() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(1601, 1, 1)
        .expect("1601-01-01 is not a valid date?!")
        .and_hms_opt(0, 0, 0).expect("1601-01-01T00:00:00 is not a valid date-time?!")
        .and_utc()
}

/// Interprets a count of 100-nanosecond ticks since the Windows epoch as a
/// UTC instant. Total over the full `u64` range.
pub(crate) fn filetime_to_utc(filetime: u64) -> DateTime<Utc> {
    let secs = (filetime / FILETIME_TICKS_PER_SECOND) as i64;
    let nanos = ((filetime % FILETIME_TICKS_PER_SECOND) * 100) as u32;
    let delta = TimeDelta::new(secs, nanos)
        .expect("FILETIME range does not fit into TimeDelta?!");
    windows_epoch() + delta
}

/// Converts a UTC instant back into FILETIME ticks.
///
/// Instants before the Windows epoch clamp to zero.
pub(crate) fn utc_to_filetime(when: DateTime<Utc>) -> u64 {
    let delta = when - windows_epoch();
    let secs = delta.num_seconds();
    if secs < 0 {
        return 0;
    }
    (secs as u64) * FILETIME_TICKS_PER_SECOND + u64::from(delta.subsec_nanos().unsigned_abs() / 100)
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_host() -> SingleHostData {
        SingleHostData {
            size: SINGLE_HOST_DATA_LEN as u32,
            z4: 0,
            custom_data: [0xAA; 8],
            machine_id: [0x42; 32],
        }
    }

    #[test]
    fn round_trip() {
        let sequence = AvPairSequence::from_pairs(vec![
            AvPair::NbDomainName("CORP".to_owned()),
            AvPair::NbComputerName("DC01".to_owned()),
            AvPair::DnsDomainName("corp.example.com".to_owned()),
            AvPair::Timestamp(filetime_to_utc(132_500_000_000_000_000)),
            AvPair::Flags(AvFlags::MIC_PROVIDED),
            AvPair::SingleHost(sample_host()),
            AvPair::ChannelBindings(vec![0x11; 16]),
            AvPair::Unrecognized { id: 0x000C, data: vec![0xDE, 0xAD] },
            AvPair::Eol,
        ]);
        let decoded = AvPairSequence::decode(&sequence.encode()).unwrap();
        assert_eq!(sequence, decoded);
    }

    #[test]
    fn decode_ignores_bytes_after_eol() {
        let mut buffer = Vec::new();
        // NbDomainName = "AB"
        buffer.extend_from_slice(&[0x02, 0x00, 0x04, 0x00, b'A', 0x00, b'B', 0x00]);
        // EOL
        buffer.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        // trailing junk
        buffer.extend_from_slice(&[0xFF, 0xFF, 0xFF]);

        let sequence = AvPairSequence::decode(&buffer).unwrap();
        assert_eq!(
            sequence.find(AvId::NbDomainName),
            Some(&AvPair::NbDomainName("AB".to_owned())),
        );
        assert_eq!(sequence.iter().count(), 2);
    }

    #[test]
    fn decode_without_eol_is_unterminated() {
        let buffer = [0x02, 0x00, 0x04, 0x00, b'A', 0x00, b'B', 0x00];
        assert_eq!(
            AvPairSequence::decode(&buffer),
            Err(ProtocolError::Unterminated),
        );
    }

    #[test]
    fn decode_overlong_value_is_truncated() {
        // declares 8 value bytes but only 2 follow
        let buffer = [0x02, 0x00, 0x08, 0x00, b'A', 0x00];
        assert_eq!(
            AvPairSequence::decode(&buffer),
            Err(ProtocolError::Truncated { expected_at_least: 12, obtained: 6 }),
        );
    }

    #[test]
    fn decode_empty_buffer_is_unterminated() {
        assert_eq!(AvPairSequence::decode(&[]), Err(ProtocolError::Unterminated));
    }

    #[test]
    fn timestamp_matches_reference_instant() {
        // 132500000000000000 ticks = 13_250_000_000 s after 1601-01-01
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&[0x07, 0x00, 0x08, 0x00]);
        buffer.extend_from_slice(&132_500_000_000_000_000u64.to_le_bytes());
        buffer.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);

        let sequence = AvPairSequence::decode(&buffer).unwrap();
        let expected = Utc.with_ymd_and_hms(2020, 11, 16, 11, 33, 20).unwrap();
        assert_eq!(sequence.find(AvId::Timestamp), Some(&AvPair::Timestamp(expected)));
    }

    #[test]
    fn timestamp_keeps_subsecond_ticks() {
        let when = filetime_to_utc(132_500_000_000_000_007);
        assert_eq!(utc_to_filetime(when), 132_500_000_000_000_007);
    }

    #[test]
    fn short_timestamp_is_malformed() {
        let buffer = [0x07, 0x00, 0x04, 0x00, 0x01, 0x02, 0x03, 0x04];
        assert_eq!(
            AvPairSequence::decode(&buffer),
            Err(ProtocolError::MalformedField { av_id: 0x0007, expected_len: 8, obtained_len: 4 }),
        );
    }

    #[test]
    fn short_single_host_is_malformed() {
        let mut buffer = vec![0x08, 0x00, 27, 0x00];
        buffer.extend_from_slice(&[0u8; 27]);
        assert_eq!(
            AvPairSequence::decode(&buffer),
            Err(ProtocolError::MalformedField { av_id: 0x0008, expected_len: 48, obtained_len: 27 }),
        );
    }

    #[test]
    fn odd_length_name_is_encoding_error() {
        let buffer = [0x04, 0x00, 0x03, 0x00, b'a', 0x00, b'b', 0x00, 0x00, 0x00, 0x00];
        assert!(matches!(
            AvPairSequence::decode(&buffer),
            Err(ProtocolError::Encoding { .. }),
        ));
    }

    #[test]
    fn unpaired_surrogate_is_encoding_error() {
        // 0xD800 with no low surrogate following
        let buffer = [0x01, 0x00, 0x02, 0x00, 0x00, 0xD8, 0x00, 0x00, 0x00, 0x00];
        assert!(matches!(
            AvPairSequence::decode(&buffer),
            Err(ProtocolError::Encoding { .. }),
        ));
    }

    #[test]
    fn unrecognized_id_is_preserved() {
        let buffer = [0x4D, 0x00, 0x02, 0x00, 0xCA, 0xFE, 0x00, 0x00, 0x00, 0x00];
        let sequence = AvPairSequence::decode(&buffer).unwrap();
        assert_eq!(
            sequence.find(AvId::Unrecognized(0x004D)),
            Some(&AvPair::Unrecognized { id: 0x004D, data: vec![0xCA, 0xFE] }),
        );
        assert_eq!(sequence.encode(), buffer.to_vec());
    }

    #[test]
    fn nonzero_length_eol_is_malformed() {
        let buffer = [0x00, 0x00, 0x02, 0x00, 0x01, 0x02];
        assert_eq!(
            AvPairSequence::decode(&buffer),
            Err(ProtocolError::MalformedField { av_id: 0x0000, expected_len: 0, obtained_len: 2 }),
        );
    }

    #[test]
    fn lookup_prefers_first_match() {
        let sequence = AvPairSequence::from_pairs(vec![
            AvPair::DnsDomainName("first.example.com".to_owned()),
            AvPair::DnsDomainName("second.example.com".to_owned()),
            AvPair::Eol,
        ]);
        assert_eq!(
            sequence.find(AvId::DnsDomainName),
            Some(&AvPair::DnsDomainName("first.example.com".to_owned())),
        );
    }
}
