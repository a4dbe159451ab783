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

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use thiserror::Error;
use tracing::debug;

use crate::conf::ServerConfig;

/// First offset handed to peers; 0 is the network address, 1 the server.
const FIRST_PEER_OFFSET: u32 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    #[error("address pool exhausted: all {capacity} addresses in {subnet} in use")]
    Exhausted { capacity: u32, subnet: Ipv4Network },

    #[error("address {address} is outside {subnet}")]
    OutOfRange {
        address: Ipv4Addr,
        subnet: Ipv4Network,
    },

    #[error("address {address} is reserved in {subnet}")]
    Reserved {
        address: Ipv4Addr,
        subnet: Ipv4Network,
    },

    #[error("address {address} is already assigned to peer {peer:?}")]
    InUse { address: Ipv4Addr, peer: String },
}

/// Usable peer addresses of a subnet: everything except the network and
/// broadcast addresses, offset 1, and wherever the server itself sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressPool {
    subnet: Ipv4Network,
    server: Ipv4Addr,
}

impl AddressPool {
    pub fn new(subnet: Ipv4Network, server: Ipv4Addr) -> Self {
        let subnet = Ipv4Network::new(subnet.network(), subnet.prefix()).unwrap_or(subnet);
        Self { subnet, server }
    }

    pub fn for_config(config: &ServerConfig, subnet: Ipv4Network) -> Self {
        Self::new(subnet, config.interface().address.ip())
    }

    pub fn subnet(&self) -> Ipv4Network {
        self.subnet
    }

    fn base(&self) -> u32 {
        u32::from(self.subnet.network())
    }

    /// Offset of the broadcast address; nothing at or past it is handed out.
    fn broadcast_offset(&self) -> u32 {
        self.subnet.size().saturating_sub(1)
    }

    fn server_offset(&self) -> Option<u32> {
        self.subnet
            .contains(self.server)
            .then(|| u32::from(self.server) - self.base())
    }

    fn is_usable_offset(&self, offset: u32) -> bool {
        offset >= FIRST_PEER_OFFSET
            && offset < self.broadcast_offset()
            && Some(offset) != self.server_offset()
    }

    pub fn capacity(&self) -> u32 {
        let span = self.broadcast_offset().saturating_sub(FIRST_PEER_OFFSET);
        match self.server_offset() {
            Some(offset) if offset >= FIRST_PEER_OFFSET && offset < self.broadcast_offset() => {
                span - 1
            }
            _ => span,
        }
    }

    /// Lowest usable address not assigned to any peer in `config`.
    ///
    /// This does not reserve anything: the caller must hold the store lock
    /// between picking an address and writing it.
    pub fn next_free(&self, config: &ServerConfig) -> Result<Ipv4Addr, AllocError> {
        let used = config.used_addresses();
        for offset in FIRST_PEER_OFFSET..self.broadcast_offset() {
            if !self.is_usable_offset(offset) {
                continue;
            }
            let candidate = Ipv4Addr::from(self.base() + offset);
            if !used.contains(&candidate) {
                debug!(address = %candidate, subnet = %self.subnet, "allocated address");
                return Ok(candidate);
            }
        }
        Err(AllocError::Exhausted {
            capacity: self.capacity(),
            subnet: self.subnet,
        })
    }

    /// Validate an operator-chosen address.
    pub fn check_requested(
        &self,
        config: &ServerConfig,
        address: Ipv4Addr,
    ) -> Result<Ipv4Addr, AllocError> {
        if !self.subnet.contains(address) {
            return Err(AllocError::OutOfRange {
                address,
                subnet: self.subnet,
            });
        }
        if !self.is_usable_offset(u32::from(address) - self.base()) {
            return Err(AllocError::Reserved {
                address,
                subnet: self.subnet,
            });
        }
        if let Some(peer) = config.peers().find(|p| p.address == address) {
            return Err(AllocError::InUse {
                address,
                peer: peer.name.clone(),
            });
        }
        Ok(address)
    }
}

pub fn next_free_address(
    config: &ServerConfig,
    subnet: Ipv4Network,
) -> Result<Ipv4Addr, AllocError> {
    AddressPool::for_config(config, subnet).next_free(config)
}
