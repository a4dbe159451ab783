// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Structural codec for the server's wg-quick configuration file.
//!
//! The file is split into blocks, one per `[Interface]` or `[Peer]` header.
//! Comment and blank lines that precede a header belong to that header's
//! block, which is how the `# Client: <name>` marker travels with its peer.
//! Every block keeps its exact source text, so serializing an untouched
//! block reproduces it byte for byte.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use peerward_types::PeerRecord;
use peerward_types::daemon::LivePeer;
use thiserror::Error;

use crate::keys;

pub const MARKER_PREFIX: &str = "# Client:";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("line {line}: unknown section {section}")]
    UnknownSection { line: usize, section: String },

    #[error("no [Interface] section")]
    MissingInterface,

    #[error("line {line}: [Interface] must be the first and only interface section")]
    MisplacedInterface { line: usize },

    #[error("line {line}: [Peer] has no `{MARKER_PREFIX} <name>` marker comment")]
    UnmarkedPeer { line: usize },

    #[error("line {line}: marker comment is not followed by a [Peer] section")]
    StrayMarker { line: usize },

    #[error("line {line}: missing {field}")]
    MissingField { line: usize, field: &'static str },

    #[error("line {line}: invalid {field}: {value}")]
    InvalidField {
        line: usize,
        field: &'static str,
        value: String,
    },

    #[error("peer name {0:?} appears more than once")]
    DuplicateName(String),

    #[error("address {0} is assigned to more than one peer")]
    DuplicateAddress(Ipv4Addr),

    #[error("public key {0} is used by more than one peer")]
    DuplicatePublicKey(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub private_key: String,
    pub address: Ipv4Network,
    pub listen_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Interface { raw: String, interface: Interface },
    Peer { raw: String, record: PeerRecord },
}

impl Block {
    pub fn raw(&self) -> &str {
        match self {
            Self::Interface { raw, .. } | Self::Peer { raw, .. } => raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    blocks: Vec<Block>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Interface,
    Peer,
}

struct Pending {
    kind: Kind,
    line: usize,
    raw: String,
    marker: Option<String>,
    entries: Vec<(usize, String, String)>,
}

fn marker_name(line: &str) -> Option<&str> {
    line.trim()
        .strip_prefix(MARKER_PREFIX)
        .map(str::trim)
        .filter(|name| !name.is_empty())
}

impl ServerConfig {
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let mut blocks = Vec::new();
        let mut current: Option<Pending> = None;
        let mut leading = String::new();
        let mut marker: Option<(usize, String)> = None;

        for (idx, line) in text.split_inclusive('\n').enumerate() {
            let line_num = idx + 1;
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                if let Some(name) = marker_name(trimmed) {
                    if let Some((first, _)) = marker {
                        return Err(ParseError::StrayMarker { line: first });
                    }
                    marker = Some((line_num, name.to_string()));
                }
                leading.push_str(line);
                continue;
            }

            if trimmed.starts_with('[') {
                if let Some(done) = current.take() {
                    blocks.push(finish(done)?);
                }
                let kind = if trimmed.eq_ignore_ascii_case("[interface]") {
                    Kind::Interface
                } else if trimmed.eq_ignore_ascii_case("[peer]") {
                    Kind::Peer
                } else {
                    return Err(ParseError::UnknownSection {
                        line: line_num,
                        section: trimmed.to_string(),
                    });
                };
                if kind == Kind::Interface && !blocks.is_empty() {
                    return Err(ParseError::MisplacedInterface { line: line_num });
                }
                if kind == Kind::Peer && blocks.is_empty() {
                    return Err(ParseError::MissingInterface);
                }
                let marker = marker.take();
                if kind == Kind::Interface {
                    if let Some((line, _)) = marker {
                        return Err(ParseError::StrayMarker { line });
                    }
                }
                let mut raw = std::mem::take(&mut leading);
                raw.push_str(line);
                current = Some(Pending {
                    kind,
                    line: line_num,
                    raw,
                    marker: marker.map(|(_, name)| name),
                    entries: Vec::new(),
                });
                continue;
            }

            let Some(block) = current.as_mut() else {
                return Err(ParseError::Syntax {
                    line: line_num,
                    message: "setting outside of any section".into(),
                });
            };
            if let Some((line, _)) = marker {
                return Err(ParseError::StrayMarker { line });
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ParseError::Syntax {
                    line: line_num,
                    message: format!("expected `Key = Value`, got: {trimmed}"),
                });
            };
            block.raw.push_str(std::mem::take(&mut leading).as_str());
            block.raw.push_str(line);
            block
                .entries
                .push((line_num, key.trim().to_ascii_lowercase(), value.trim().to_string()));
        }

        if let Some((line, _)) = marker {
            return Err(ParseError::StrayMarker { line });
        }
        match current {
            Some(mut done) => {
                done.raw.push_str(&leading);
                blocks.push(finish(done)?);
            }
            None => return Err(ParseError::MissingInterface),
        }

        let config = Self { blocks };
        config.check_uniqueness()?;
        Ok(config)
    }

    fn check_uniqueness(&self) -> Result<(), ParseError> {
        let mut names = HashSet::new();
        let mut addresses = HashSet::new();
        let mut public_keys = HashSet::new();
        for record in self.peers() {
            if !names.insert(record.name.as_str()) {
                return Err(ParseError::DuplicateName(record.name.clone()));
            }
            if !addresses.insert(record.address) {
                return Err(ParseError::DuplicateAddress(record.address));
            }
            if !public_keys.insert(record.public_key.as_str()) {
                return Err(ParseError::DuplicatePublicKey(record.public_key.clone()));
            }
        }
        Ok(())
    }

    pub fn to_text(&self) -> String {
        self.blocks.iter().map(Block::raw).collect()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn interface(&self) -> &Interface {
        match &self.blocks[0] {
            Block::Interface { interface, .. } => interface,
            Block::Peer { .. } => unreachable!("parse guarantees [Interface] comes first"),
        }
    }

    /// Public half of the `[Interface]` private key.
    pub fn server_public_key(&self) -> Result<keys::PublicKey, keys::KeyError> {
        let private: keys::PrivateKey = self.interface().private_key.parse()?;
        Ok(keys::derive_public_key(&private))
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerRecord> {
        self.blocks.iter().filter_map(|b| match b {
            Block::Peer { record, .. } => Some(record),
            Block::Interface { .. } => None,
        })
    }

    pub fn peer_count(&self) -> usize {
        self.peers().count()
    }

    pub fn find_peer(&self, name: &str) -> Option<&PeerRecord> {
        self.peers().find(|p| p.name == name)
    }

    pub fn used_addresses(&self) -> HashSet<Ipv4Addr> {
        self.peers().map(|p| p.address).collect()
    }

    /// The peer set the daemon should end up with.
    pub fn live_peers(&self) -> Vec<LivePeer> {
        self.peers()
            .map(|p| LivePeer {
                public_key: p.public_key.clone(),
                allowed_ips: vec![p.allowed_ip()],
                preshared_key: p.preshared_key.clone(),
            })
            .collect()
    }

    /// Append a peer stanza. Uniqueness is the caller's to check; this only
    /// guarantees the result still parses.
    pub fn push_peer(&mut self, record: PeerRecord) {
        let ends_with_newline = self.blocks.last().is_none_or(|b| b.raw().ends_with('\n'));
        let mut raw = String::new();
        if !ends_with_newline {
            raw.push('\n');
        }
        raw.push('\n');
        raw.push_str(&render_peer(&record));
        self.blocks.push(Block::Peer { raw, record });
    }

    /// Remove exactly the block whose marker names `name`.
    pub fn remove_peer(&mut self, name: &str) -> Option<PeerRecord> {
        let idx = self.blocks.iter().position(
            |b| matches!(b, Block::Peer { record, .. } if record.name == name),
        )?;
        match self.blocks.remove(idx) {
            Block::Peer { record, .. } => Some(record),
            Block::Interface { .. } => None,
        }
    }

    /// Rewrite `ListenPort` in the interface block, leaving every other line
    /// as it was. Returns the previous port.
    pub fn set_listen_port(&mut self, port: u16) -> Option<u16> {
        let Block::Interface { raw, interface } = &mut self.blocks[0] else {
            return None;
        };
        let previous = interface.listen_port.replace(port);
        let replacement = format!("ListenPort = {port}");

        let mut rewritten = String::with_capacity(raw.len() + replacement.len());
        let mut replaced = false;
        let mut in_section = false;
        for line in raw.split_inclusive('\n') {
            let trimmed = line.trim();
            if trimmed.eq_ignore_ascii_case("[interface]") {
                in_section = true;
                rewritten.push_str(line);
                if previous.is_none() {
                    rewritten.push_str(&replacement);
                    rewritten.push('\n');
                    replaced = true;
                }
                continue;
            }
            let is_port = in_section
                && !replaced
                && trimmed
                    .split_once('=')
                    .is_some_and(|(k, _)| k.trim().eq_ignore_ascii_case("listenport"));
            if is_port {
                rewritten.push_str(&replacement);
                if line.ends_with('\n') {
                    rewritten.push('\n');
                }
                replaced = true;
            } else {
                rewritten.push_str(line);
            }
        }
        *raw = rewritten;
        previous
    }
}

fn finish(pending: Pending) -> Result<Block, ParseError> {
    match pending.kind {
        Kind::Interface => finish_interface(pending),
        Kind::Peer => finish_peer(pending),
    }
}

fn finish_interface(pending: Pending) -> Result<Block, ParseError> {
    let mut private_key = None;
    let mut address = None;
    let mut listen_port = None;

    for (line, key, value) in &pending.entries {
        match key.as_str() {
            "privatekey" => {
                keys::decode_key(value).map_err(|_| ParseError::InvalidField {
                    line: *line,
                    field: "PrivateKey",
                    value: "<redacted>".into(),
                })?;
                private_key = Some(value.clone());
            }
            "address" => {
                // Dual-stack interfaces list several; the pool is IPv4.
                let net = value
                    .split(',')
                    .find_map(|entry| entry.trim().parse::<Ipv4Network>().ok())
                    .ok_or_else(|| ParseError::InvalidField {
                        line: *line,
                        field: "Address",
                        value: value.clone(),
                    })?;
                address = Some(net);
            }
            "listenport" => {
                let port = value.parse().map_err(|_| ParseError::InvalidField {
                    line: *line,
                    field: "ListenPort",
                    value: value.clone(),
                })?;
                listen_port = Some(port);
            }
            _ => {
                tracing::trace!(key = %key, "passing through interface setting");
            }
        }
    }

    let interface = Interface {
        private_key: private_key.ok_or(ParseError::MissingField {
            line: pending.line,
            field: "PrivateKey",
        })?,
        address: address.ok_or(ParseError::MissingField {
            line: pending.line,
            field: "Address",
        })?,
        listen_port,
    };
    Ok(Block::Interface {
        raw: pending.raw,
        interface,
    })
}

fn finish_peer(pending: Pending) -> Result<Block, ParseError> {
    let name = pending
        .marker
        .clone()
        .ok_or(ParseError::UnmarkedPeer { line: pending.line })?;

    let mut public_key = None;
    let mut preshared_key = None;
    let mut address = None;

    for (line, key, value) in &pending.entries {
        match key.as_str() {
            "publickey" => {
                keys::decode_key(value).map_err(|_| ParseError::InvalidField {
                    line: *line,
                    field: "PublicKey",
                    value: value.clone(),
                })?;
                public_key = Some(value.clone());
            }
            "presharedkey" => {
                keys::decode_key(value).map_err(|_| ParseError::InvalidField {
                    line: *line,
                    field: "PresharedKey",
                    value: "<redacted>".into(),
                })?;
                preshared_key = Some(value.clone());
            }
            "allowedips" => {
                address = Some(parse_host_route(value).ok_or_else(|| {
                    ParseError::InvalidField {
                        line: *line,
                        field: "AllowedIPs",
                        value: value.clone(),
                    }
                })?);
            }
            _ => {
                tracing::trace!(key = %key, peer = %name, "passing through peer setting");
            }
        }
    }

    let record = PeerRecord {
        name,
        public_key: public_key.ok_or(ParseError::MissingField {
            line: pending.line,
            field: "PublicKey",
        })?,
        address: address.ok_or(ParseError::MissingField {
            line: pending.line,
            field: "AllowedIPs",
        })?,
        preshared_key,
    };
    Ok(Block::Peer {
        raw: pending.raw,
        record,
    })
}

/// Managed peers route exactly one IPv4 host.
fn parse_host_route(value: &str) -> Option<Ipv4Addr> {
    let mut parts = value.split(',').map(str::trim).filter(|s| !s.is_empty());
    let only = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    let net: Ipv4Network = only.parse().ok()?;
    (net.prefix() == 32).then(|| net.ip())
}

pub fn render_peer(record: &PeerRecord) -> String {
    let mut out = String::new();
    writeln!(out, "{MARKER_PREFIX} {}", record.name).unwrap();
    writeln!(out, "[Peer]").unwrap();
    writeln!(out, "PublicKey = {}", record.public_key).unwrap();
    if let Some(ref psk) = record.preshared_key {
        writeln!(out, "PresharedKey = {psk}").unwrap();
    }
    writeln!(out, "AllowedIPs = {}", record.allowed_ip()).unwrap();
    out
}

/// A fresh server configuration with NAT rules for `egress`.
pub fn render_interface(
    private_key: &str,
    address: Ipv4Network,
    listen_port: u16,
    egress: &str,
) -> String {
    let mut out = String::new();
    writeln!(out, "[Interface]").unwrap();
    writeln!(out, "Address = {address}").unwrap();
    writeln!(out, "ListenPort = {listen_port}").unwrap();
    writeln!(out, "PrivateKey = {private_key}").unwrap();
    writeln!(
        out,
        "PostUp = iptables -A FORWARD -i %i -j ACCEPT; iptables -A FORWARD -o %i -j ACCEPT; \
         iptables -t nat -A POSTROUTING -o {egress} -j MASQUERADE"
    )
    .unwrap();
    writeln!(
        out,
        "PostDown = iptables -D FORWARD -i %i -j ACCEPT; iptables -D FORWARD -o %i -j ACCEPT; \
         iptables -t nat -D POSTROUTING -o {egress} -j MASQUERADE"
    )
    .unwrap();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    const SERVER_KEY: &str = "YWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWE=";
    const KEY_B: &str = "YmJiYmJiYmJiYmJiYmJiYmJiYmJiYmJiYmJiYmJiYmI=";
    const KEY_C: &str = "Y2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjYWE=";

    fn sample() -> String {
        format!(
            "[Interface]\n\
             Address = 10.13.13.1/24\n\
             ListenPort = 51820\n\
             PrivateKey = {SERVER_KEY}\n\
             PostUp = iptables -A FORWARD -i %i -j ACCEPT\n\
             \n\
             # Client: laptop\n\
             [Peer]\n\
             PublicKey = {KEY_B}\n\
             AllowedIPs = 10.13.13.2/32\n\
             \n\
             # Client: phone\n\
             [Peer]\n\
             PublicKey = {KEY_C}\n\
             AllowedIPs = 10.13.13.3/32\n"
        )
    }

    fn record(name: &str, key: &str, last: u8) -> PeerRecord {
        PeerRecord {
            name: name.into(),
            public_key: key.into(),
            address: Ipv4Addr::new(10, 13, 13, last),
            preshared_key: None,
        }
    }

    #[test]
    fn parse_then_serialize_is_identity() {
        let text = sample();
        let config = ServerConfig::parse(&text).unwrap();
        assert_eq!(config.to_text(), text);
    }

    #[test]
    fn parse_reads_interface_and_peers() {
        let config = ServerConfig::parse(&sample()).unwrap();
        let iface = config.interface();
        assert_eq!(iface.address.to_string(), "10.13.13.1/24");
        assert_eq!(iface.listen_port, Some(51820));
        let names: Vec<_> = config.peers().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["laptop", "phone"]);
        assert_eq!(
            config.find_peer("phone").unwrap().address,
            Ipv4Addr::new(10, 13, 13, 3)
        );
    }

    #[test]
    fn remove_keeps_other_blocks_byte_identical() {
        let text = sample();
        let mut config = ServerConfig::parse(&text).unwrap();
        let before: Vec<String> = config.blocks().iter().map(|b| b.raw().to_string()).collect();

        let removed = config.remove_peer("laptop").unwrap();
        assert_eq!(removed.public_key, KEY_B);

        let after: Vec<String> = config.blocks().iter().map(|b| b.raw().to_string()).collect();
        assert_eq!(after, vec![before[0].clone(), before[2].clone()]);
        assert!(ServerConfig::parse(&config.to_text()).is_ok());
    }

    #[test]
    fn remove_matches_whole_name_only() {
        let mut config = ServerConfig::parse(&sample()).unwrap();
        assert!(config.remove_peer("lap").is_none());
        assert!(config.remove_peer("laptop2").is_none());
        assert_eq!(config.peer_count(), 2);
    }

    #[test]
    fn push_then_remove_restores_text() {
        let text = sample();
        let mut config = ServerConfig::parse(&text).unwrap();
        config.push_peer(record("tablet", SERVER_KEY, 4));
        let grown = config.to_text();
        assert!(grown.ends_with("# Client: tablet\n[Peer]\nPublicKey = YWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWE=\nAllowedIPs = 10.13.13.4/32\n"));
        assert_eq!(ServerConfig::parse(&grown).unwrap(), config);

        config.remove_peer("tablet");
        assert_eq!(config.to_text(), text);
    }

    #[test]
    fn push_onto_file_without_trailing_newline() {
        let text = format!("[Interface]\nAddress = 10.13.13.1/24\nPrivateKey = {SERVER_KEY}");
        let mut config = ServerConfig::parse(&text).unwrap();
        config.push_peer(record("laptop", KEY_B, 2));
        let reparsed = ServerConfig::parse(&config.to_text()).unwrap();
        assert_eq!(reparsed.peer_count(), 1);
    }

    #[test]
    fn shared_key_prefix_does_not_confuse_removal() {
        // Both keys start with "Y2Nj"; the marker is the only handle used.
        let text = format!(
            "[Interface]\nAddress = 10.13.13.1/24\nPrivateKey = {SERVER_KEY}\n\n\
             # Client: a\n[Peer]\nPublicKey = {KEY_C}\nAllowedIPs = 10.13.13.2/32\n\n\
             # Client: b\n[Peer]\nPublicKey = Y2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2M=\nAllowedIPs = 10.13.13.3/32\n"
        );
        let mut config = ServerConfig::parse(&text).unwrap();
        config.remove_peer("a").unwrap();
        assert_eq!(config.peer_count(), 1);
        assert_eq!(config.find_peer("b").unwrap().address, Ipv4Addr::new(10, 13, 13, 3));
    }

    #[test]
    fn set_listen_port_rewrites_only_that_line() {
        let mut config = ServerConfig::parse(&sample()).unwrap();
        assert_eq!(config.set_listen_port(51999), Some(51820));
        let text = config.to_text();
        assert!(text.contains("ListenPort = 51999\n"));
        assert!(!text.contains("51820"));
        assert_eq!(text.len(), sample().len());
        assert_eq!(
            ServerConfig::parse(&text).unwrap().interface().listen_port,
            Some(51999)
        );
    }

    #[test]
    fn set_listen_port_inserts_when_absent() {
        let text = format!("[Interface]\nAddress = 10.13.13.1/24\nPrivateKey = {SERVER_KEY}\n");
        let mut config = ServerConfig::parse(&text).unwrap();
        assert_eq!(config.set_listen_port(51820), None);
        let reparsed = ServerConfig::parse(&config.to_text()).unwrap();
        assert_eq!(reparsed.interface().listen_port, Some(51820));
    }

    #[test]
    fn rendered_interface_parses() {
        let text = render_interface(SERVER_KEY, "10.13.13.1/24".parse().unwrap(), 51820, "eth0");
        let config = ServerConfig::parse(&text).unwrap();
        assert_eq!(config.peer_count(), 0);
        assert!(text.contains("-o eth0 -j MASQUERADE"));
    }

    #[test]
    fn live_peers_mirror_records() {
        let config = ServerConfig::parse(&sample()).unwrap();
        let live = config.live_peers();
        assert_eq!(live.len(), 2);
        assert_eq!(live[0].allowed_ips, vec!["10.13.13.2/32".to_string()]);
    }

    #[test_case("", ParseError::MissingInterface; "empty file")]
    #[test_case("# only a comment\n", ParseError::MissingInterface; "comments only")]
    #[test_case("[Peer]\nPublicKey = x\n", ParseError::MissingInterface; "peer before interface")]
    #[test_case("Address = 10.0.0.1/24\n", ParseError::Syntax { line: 1, message: "setting outside of any section".into() }; "setting before header")]
    #[test_case("[Wat]\n", ParseError::UnknownSection { line: 1, section: "[Wat]".into() }; "unknown section")]
    fn parse_rejects(text: &str, expected: ParseError) {
        assert_eq!(ServerConfig::parse(text).unwrap_err(), expected);
    }

    #[test]
    fn unmarked_peer_is_rejected() {
        let text = format!(
            "[Interface]\nAddress = 10.13.13.1/24\nPrivateKey = {SERVER_KEY}\n\n[Peer]\nPublicKey = {KEY_B}\nAllowedIPs = 10.13.13.2/32\n"
        );
        assert_eq!(
            ServerConfig::parse(&text).unwrap_err(),
            ParseError::UnmarkedPeer { line: 5 }
        );
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let text = format!(
            "[Interface]\nAddress = 10.13.13.1/24\nPrivateKey = {SERVER_KEY}\n\n\
             # Client: a\n[Peer]\nPublicKey = {KEY_B}\nAllowedIPs = 10.13.13.2/32\n\n\
             # Client: a\n[Peer]\nPublicKey = {KEY_C}\nAllowedIPs = 10.13.13.3/32\n"
        );
        assert_eq!(
            ServerConfig::parse(&text).unwrap_err(),
            ParseError::DuplicateName("a".into())
        );
    }

    #[test]
    fn duplicate_addresses_are_rejected() {
        let text = format!(
            "[Interface]\nAddress = 10.13.13.1/24\nPrivateKey = {SERVER_KEY}\n\n\
             # Client: a\n[Peer]\nPublicKey = {KEY_B}\nAllowedIPs = 10.13.13.2/32\n\n\
             # Client: b\n[Peer]\nPublicKey = {KEY_C}\nAllowedIPs = 10.13.13.2/32\n"
        );
        assert_eq!(
            ServerConfig::parse(&text).unwrap_err(),
            ParseError::DuplicateAddress(Ipv4Addr::new(10, 13, 13, 2))
        );
    }

    #[test_case("10.13.13.0/24"; "subnet route")]
    #[test_case("10.13.13.2/32, 10.13.13.3/32"; "two routes")]
    #[test_case("fd00::2/128"; "ipv6")]
    fn peers_must_route_one_host(allowed: &str) {
        let text = format!(
            "[Interface]\nAddress = 10.13.13.1/24\nPrivateKey = {SERVER_KEY}\n\n\
             # Client: a\n[Peer]\nPublicKey = {KEY_B}\nAllowedIPs = {allowed}\n"
        );
        assert!(matches!(
            ServerConfig::parse(&text),
            Err(ParseError::InvalidField { field: "AllowedIPs", .. })
        ));
    }

    #[test_case("fd00::1/64, 10.13.13.1/24", Some("10.13.13.1/24"); "ipv6 first")]
    #[test_case("10.13.13.1/24, fd00::1/64", Some("10.13.13.1/24"); "ipv4 first")]
    #[test_case("fd00::1/64", None; "ipv6 only")]
    #[test_case("not-an-address", None; "garbage")]
    fn interface_address_is_first_ipv4_entry(address: &str, expected: Option<&str>) {
        let text = format!("[Interface]\nAddress = {address}\nPrivateKey = {SERVER_KEY}\n");
        match (ServerConfig::parse(&text), expected) {
            (Ok(config), Some(want)) => {
                assert_eq!(config.interface().address.to_string(), want);
                assert_eq!(config.to_text(), text);
            }
            (Err(ParseError::InvalidField { field, .. }), None) => assert_eq!(field, "Address"),
            (other, _) => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn stray_marker_is_rejected() {
        let text = format!(
            "[Interface]\nAddress = 10.13.13.1/24\n# Client: ghost\nPrivateKey = {SERVER_KEY}\n"
        );
        assert_eq!(
            ServerConfig::parse(&text).unwrap_err(),
            ParseError::StrayMarker { line: 3 }
        );
    }
}
