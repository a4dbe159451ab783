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

//! The live daemon's view of its peers.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A peer as reported by (or pushed to) the running WireGuard interface.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LivePeer {
    /// WireGuard public key (base64).
    pub public_key: String,
    /// Allowed IPs in CIDR notation, sorted.
    pub allowed_ips: Vec<String>,
    /// Optional preshared key (base64).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<String>,
}

/// Compare two peer sets ignoring order.
///
/// Preshared keys are not compared: the kernel reports an all-zero key for
/// peers without one, and never reports it back in a form worth diffing.
pub fn same_peers(a: &[LivePeer], b: &[LivePeer]) -> bool {
    let key = |p: &LivePeer| {
        let mut ips = p.allowed_ips.clone();
        ips.sort();
        (p.public_key.clone(), ips)
    };
    let a: BTreeSet<_> = a.iter().map(key).collect();
    let b: BTreeSet<_> = b.iter().map(key).collect();
    a == b
}
