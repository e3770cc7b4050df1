//! A read-only projection over the AV pair sequence of a Challenge message.


use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::avpair::{AvFlags, AvId, AvPair, AvPairSequence, SingleHostData};


/// The target information a server revealed in its Challenge message.
///
/// Constructed once per successful probe and immutable afterwards. Every
/// accessor returns the decoded value or `None` when the server did not send
/// the corresponding pair; absence is never papered over with a placeholder.
#[derive(Clone, Debug)]
pub struct NtlmTargetInformation {
    pairs: AvPairSequence,
    rendered: OnceLock<String>,
}
impl NtlmTargetInformation {
    pub fn new(pairs: AvPairSequence) -> Self {
        Self {
            pairs,
            rendered: OnceLock::new(),
        }
    }

    /// The underlying AV pair sequence, in wire order.
    pub fn av_pairs(&self) -> &AvPairSequence {
        &self.pairs
    }

    fn find_text(&self, id: AvId) -> Option<&str> {
        match self.pairs.find(id) {
            Some(AvPair::NbComputerName(name))
            | Some(AvPair::NbDomainName(name))
            | Some(AvPair::DnsComputerName(name))
            | Some(AvPair::DnsDomainName(name))
            | Some(AvPair::DnsTreeName(name)) => Some(name.as_str()),
            _ => None,
        }
    }

    /// The server's NetBIOS computer name.
    pub fn nb_computer_name(&self) -> Option<&str> {
        self.find_text(AvId::NbComputerName)
    }

    /// The server's NetBIOS domain name.
    pub fn nb_domain_name(&self) -> Option<&str> {
        self.find_text(AvId::NbDomainName)
    }

    /// The fully qualified domain name of the computer.
    pub fn dns_computer_name(&self) -> Option<&str> {
        self.find_text(AvId::DnsComputerName)
    }

    /// The fully qualified domain name of the domain.
    pub fn dns_domain_name(&self) -> Option<&str> {
        self.find_text(AvId::DnsDomainName)
    }

    /// The fully qualified domain name of the forest.
    pub fn dns_tree_name(&self) -> Option<&str> {
        self.find_text(AvId::DnsTreeName)
    }

    /// The server's local time, in UTC.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self.pairs.find(AvId::Timestamp) {
            Some(AvPair::Timestamp(when)) => Some(*when),
            _ => None,
        }
    }

    /// Configuration bits the server attached to the target information.
    pub fn flags(&self) -> Option<AvFlags> {
        match self.pairs.find(AvId::Flags) {
            Some(AvPair::Flags(flags)) => Some(*flags),
            _ => None,
        }
    }

    /// The channel bindings hash.
    pub fn channel_bindings(&self) -> Option<&[u8]> {
        match self.pairs.find(AvId::ChannelBindings) {
            Some(AvPair::ChannelBindings(data)) => Some(data.as_slice()),
            _ => None,
        }
    }

    /// The service principal name of the target server.
    pub fn target_name(&self) -> Option<&[u8]> {
        match self.pairs.find(AvId::TargetName) {
            Some(AvPair::TargetName(data)) => Some(data.as_slice()),
            _ => None,
        }
    }

    /// The Single_Host_Data structure identifying the originating host.
    pub fn single_host(&self) -> Option<&SingleHostData> {
        match self.pairs.find(AvId::SingleHost) {
            Some(AvPair::SingleHost(host)) => Some(host),
            _ => None,
        }
    }

    /// Renders one `label: value` line per pair, sorted lexicographically by
    /// label and excluding the end-of-list sentinel. The rendering is
    /// computed on first use and cached for the lifetime of the value.
    pub fn render(&self) -> &str {
        self.rendered.get_or_init(|| {
            let mut lines: Vec<(String, String)> = self.pairs.iter()
                .filter(|pair| pair.id() != AvId::Eol)
                .map(|pair| (label(pair), value(pair)))
                .collect();
            lines.sort();
            let rendered: Vec<String> = lines.into_iter()
                .map(|(label, value)| format!("{}: {}", label, value))
                .collect();
            rendered.join("\n")
        })
    }
}
impl fmt::Display for NtlmTargetInformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

fn label(pair: &AvPair) -> String {
    match pair {
        AvPair::Eol => "Eol".to_owned(),
        AvPair::NbComputerName(_) => "NbComputerName".to_owned(),
        AvPair::NbDomainName(_) => "NbDomainName".to_owned(),
        AvPair::DnsComputerName(_) => "DnsComputerName".to_owned(),
        AvPair::DnsDomainName(_) => "DnsDomainName".to_owned(),
        AvPair::DnsTreeName(_) => "DnsTreeName".to_owned(),
        AvPair::Flags(_) => "Flags".to_owned(),
        AvPair::Timestamp(_) => "Timestamp".to_owned(),
        AvPair::SingleHost(_) => "SingleHost".to_owned(),
        AvPair::TargetName(_) => "TargetName".to_owned(),
        AvPair::ChannelBindings(_) => "ChannelBindings".to_owned(),
        AvPair::Unrecognized { id, .. } => format!("Unrecognized(0x{:04x})", id),
    }
}

fn value(pair: &AvPair) -> String {
    match pair {
        AvPair::Eol => String::new(),
        AvPair::NbComputerName(name)
        | AvPair::NbDomainName(name)
        | AvPair::DnsComputerName(name)
        | AvPair::DnsDomainName(name)
        | AvPair::DnsTreeName(name) => name.clone(),
        AvPair::Flags(flags) => format!("{:#010x}", flags.bits()),
        AvPair::Timestamp(when) => when.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        AvPair::SingleHost(host) => host.to_string(),
        AvPair::TargetName(data) => hex::encode(data),
        AvPair::ChannelBindings(data) => hex::encode(data),
        AvPair::Unrecognized { data, .. } => hex::encode(data),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn dns_domain_alone_leaves_other_accessors_absent() {
        let blob = {
            let mut buf = Vec::new();
            buf.extend_from_slice(&[0x04, 0x00, 0x20, 0x00]);
            buf.extend(
                "corp.example.com".encode_utf16().flat_map(|w| w.to_le_bytes()),
            );
            buf.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
            buf
        };
        let info = NtlmTargetInformation::new(AvPairSequence::decode(&blob).unwrap());

        assert_eq!(info.dns_domain_name(), Some("corp.example.com"));
        assert_eq!(info.nb_computer_name(), None);
        assert_eq!(info.nb_domain_name(), None);
        assert_eq!(info.dns_computer_name(), None);
        assert_eq!(info.dns_tree_name(), None);
        assert_eq!(info.timestamp(), None);
        assert_eq!(info.flags(), None);
        assert_eq!(info.channel_bindings(), None);
        assert_eq!(info.target_name(), None);
        assert_eq!(info.single_host(), None);
    }

    #[test]
    fn render_sorts_labels_regardless_of_wire_order() {
        let info = NtlmTargetInformation::new(AvPairSequence::from_pairs(vec![
            AvPair::NbDomainName("CORP".to_owned()),
            AvPair::DnsTreeName("corp.example.com".to_owned()),
            AvPair::Eol,
        ]));
        assert_eq!(
            info.render(),
            "DnsTreeName: corp.example.com\nNbDomainName: CORP",
        );
    }

    #[test]
    fn render_includes_timestamp_and_unrecognized_pairs() {
        let when = Utc.with_ymd_and_hms(2020, 11, 16, 11, 33, 20).unwrap();
        let info = NtlmTargetInformation::new(AvPairSequence::from_pairs(vec![
            AvPair::Unrecognized { id: 0x000C, data: vec![0xBE, 0xEF] },
            AvPair::Timestamp(when),
            AvPair::Eol,
        ]));
        assert_eq!(
            info.render(),
            "Timestamp: 2020-11-16T11:33:20Z\nUnrecognized(0x000c): beef",
        );
    }

    #[test]
    fn render_of_empty_sequence_is_empty() {
        let info = NtlmTargetInformation::new(AvPairSequence::empty());
        assert_eq!(info.render(), "");
    }

    #[test]
    fn display_matches_render() {
        let info = NtlmTargetInformation::new(AvPairSequence::from_pairs(vec![
            AvPair::NbDomainName("CORP".to_owned()),
            AvPair::Eol,
        ]));
        assert_eq!(info.to_string(), info.render());
    }
}
