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

//! peerward-types: record types shared by the peerward store, reconciler and
//! exporter.
//!
//! Keys are carried in their base64 text form, exactly as they appear in
//! WireGuard configuration files.

#![warn(missing_docs)]

pub mod daemon;

use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

/// A managed peer as recorded in the server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Human identifier, carried by the `# Client: <name>` marker comment.
    pub name: String,
    /// WireGuard public key (base64).
    pub public_key: String,
    /// The single VPN address routed to this peer.
    pub address: Ipv4Addr,
    /// Optional preshared key (base64).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<String>,
}

impl PeerRecord {
    /// The peer's `AllowedIPs` value on the server side.
    pub fn allowed_ip(&self) -> String {
        format!("{}/32", self.address)
    }
}

/// Everything a client needs to connect, rendered as one importable file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientProfile {
    /// Name of the peer this profile belongs to.
    pub name: String,
    /// Client private key (base64). Only ever stored in the profile file.
    pub private_key: String,
    /// Client VPN address.
    pub address: Ipv4Addr,
    /// DNS servers pushed to the client.
    pub dns: Vec<IpAddr>,
    /// Server public key (base64).
    pub server_public_key: String,
    /// Optional preshared key, mirrored from the server-side record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<String>,
    /// Server endpoint (host:port).
    pub endpoint: String,
    /// Routes sent through the tunnel.
    pub allowed_ips: Vec<String>,
    /// Persistent keepalive interval in seconds, 0 disables it.
    pub keepalive: u16,
}
