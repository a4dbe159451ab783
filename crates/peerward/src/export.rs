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

use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr};

use ipnetwork::Ipv4Network;
use peerward_types::{ClientProfile, PeerRecord};
use thiserror::Error;
use tracing::{debug, info};

use crate::conf::MARKER_PREFIX;
use crate::keys::{self, PrivateKey};
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("client profile line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("client profile is missing {0}")]
    MissingField(&'static str),

    #[error("profile of peer {name:?} holds a private key that does not match its server record")]
    KeyMismatch { name: String },

    #[error("profile of peer {name:?} says {profile}, server record says {record}")]
    AddressMismatch {
        name: String,
        profile: Ipv4Addr,
        record: Ipv4Addr,
    },

    #[error("failed to render QR code: {0}")]
    Qr(#[from] qrcode::types::QrError),
}

/// Server-wide values shared by every exported profile.
#[derive(Debug, Clone)]
pub struct ProfileDefaults {
    pub server_public_key: String,
    pub endpoint: String,
    pub dns: Vec<IpAddr>,
    pub allowed_ips: Vec<String>,
    pub keepalive: u16,
}

/// `host:port`, bracketing bare IPv6 hosts.
pub fn endpoint(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

pub fn build_profile(
    record: &PeerRecord,
    private_key: &PrivateKey,
    defaults: &ProfileDefaults,
) -> ClientProfile {
    ClientProfile {
        name: record.name.clone(),
        private_key: private_key.to_string(),
        address: record.address,
        dns: defaults.dns.clone(),
        server_public_key: defaults.server_public_key.clone(),
        preshared_key: record.preshared_key.clone(),
        endpoint: defaults.endpoint.clone(),
        allowed_ips: defaults.allowed_ips.clone(),
        keepalive: defaults.keepalive,
    }
}

fn join<T: ToString>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn render(profile: &ClientProfile) -> String {
    let mut config = String::new();
    writeln!(config, "{MARKER_PREFIX} {}", profile.name).unwrap();
    writeln!(config, "[Interface]").unwrap();
    writeln!(config, "PrivateKey = {}", profile.private_key).unwrap();
    writeln!(config, "Address = {}/32", profile.address).unwrap();
    if !profile.dns.is_empty() {
        writeln!(config, "DNS = {}", join(&profile.dns)).unwrap();
    }
    writeln!(config).unwrap();
    writeln!(config, "[Peer]").unwrap();
    writeln!(config, "PublicKey = {}", profile.server_public_key).unwrap();
    if let Some(ref psk) = profile.preshared_key {
        writeln!(config, "PresharedKey = {psk}").unwrap();
    }
    writeln!(config, "Endpoint = {}", profile.endpoint).unwrap();
    writeln!(config, "AllowedIPs = {}", join(&profile.allowed_ips)).unwrap();
    if profile.keepalive > 0 {
        writeln!(config, "PersistentKeepalive = {}", profile.keepalive).unwrap();
    }
    config
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Interface,
    Peer,
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Read back a profile written by [`render`].
pub fn parse_profile(text: &str) -> Result<ClientProfile, ExportError> {
    let mut name = None;
    let mut private_key = None;
    let mut address = None;
    let mut dns = Vec::new();
    let mut server_public_key = None;
    let mut preshared_key = None;
    let mut endpoint = None;
    let mut allowed_ips = Vec::new();
    let mut keepalive = 0;
    let mut section = Section::None;

    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let err = |message: String| ExportError::Parse { line, message };
        let trimmed = raw.trim();

        if let Some(rest) = trimmed.strip_prefix(MARKER_PREFIX) {
            name = Some(rest.trim().to_string());
            continue;
        }
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match trimmed {
            "[Interface]" => {
                section = Section::Interface;
                continue;
            }
            "[Peer]" => {
                section = Section::Peer;
                continue;
            }
            _ => {}
        }

        let (key, value) = trimmed
            .split_once('=')
            .ok_or_else(|| err(format!("expected key = value, got {trimmed:?}")))?;
        let (key, value) = (key.trim(), value.trim());

        match (section, key) {
            (Section::Interface, "PrivateKey") => {
                keys::decode_key(value).map_err(|e| err(format!("PrivateKey: {e}")))?;
                private_key = Some(value.to_string());
            }
            (Section::Interface, "Address") => {
                let net: Ipv4Network = value
                    .parse()
                    .map_err(|e| err(format!("Address {value:?}: {e}")))?;
                address = Some(net.ip());
            }
            (Section::Interface, "DNS") => {
                dns = split_list(value)
                    .iter()
                    .map(|s| s.parse::<IpAddr>())
                    .collect::<Result<_, _>>()
                    .map_err(|e| err(format!("DNS {value:?}: {e}")))?;
            }
            (Section::Peer, "PublicKey") => {
                keys::decode_key(value).map_err(|e| err(format!("PublicKey: {e}")))?;
                server_public_key = Some(value.to_string());
            }
            (Section::Peer, "PresharedKey") => preshared_key = Some(value.to_string()),
            (Section::Peer, "Endpoint") => endpoint = Some(value.to_string()),
            (Section::Peer, "AllowedIPs") => allowed_ips = split_list(value),
            (Section::Peer, "PersistentKeepalive") => {
                keepalive = value
                    .parse()
                    .map_err(|e| err(format!("PersistentKeepalive {value:?}: {e}")))?;
            }
            (Section::None, _) => return Err(err(format!("{key} outside of any section"))),
            _ => debug!(line, key, "ignoring unknown profile field"),
        }
    }

    Ok(ClientProfile {
        name: name.ok_or(ExportError::MissingField("client marker"))?,
        private_key: private_key.ok_or(ExportError::MissingField("PrivateKey"))?,
        address: address.ok_or(ExportError::MissingField("Address"))?,
        dns,
        server_public_key: server_public_key.ok_or(ExportError::MissingField("PublicKey"))?,
        preshared_key,
        endpoint: endpoint.ok_or(ExportError::MissingField("Endpoint"))?,
        allowed_ips,
        keepalive,
    })
}

#[derive(Debug, Clone)]
pub struct Exported {
    pub record: PeerRecord,
    pub profile: ClientProfile,
    pub text: String,
}

/// Load a peer's profile and check it still belongs to the server record.
#[tracing::instrument(skip(store))]
pub async fn export(store: &Store, name: &str) -> Result<Exported, ExportError> {
    let record = store.find_peer(name).await?;
    let text = store.read_profile(name).await?;
    let profile = parse_profile(&text)?;

    let private: PrivateKey = profile
        .private_key
        .parse()
        .map_err(|_| ExportError::KeyMismatch { name: name.into() })?;
    if keys::derive_public_key(&private).to_string() != record.public_key {
        return Err(ExportError::KeyMismatch { name: name.into() });
    }
    if profile.address != record.address {
        return Err(ExportError::AddressMismatch {
            name: name.into(),
            profile: profile.address,
            record: record.address,
        });
    }

    info!(address = %record.address, "exported client profile");
    Ok(Exported {
        record,
        profile,
        text,
    })
}

/// Terminal-printable QR code of a profile, for mobile import.
pub fn render_qr(text: &str) -> Result<String, ExportError> {
    let code = qrcode::QrCode::new(text.as_bytes())?;
    Ok(code
        .render::<char>()
        .quiet_zone(true)
        .module_dimensions(2, 1)
        .build())
}
