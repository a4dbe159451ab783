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

use std::collections::HashSet;
use std::future::Future;
use std::net::IpAddr;

use peerward_types::daemon::LivePeer;
use thiserror::Error;

use crate::conf::ServerConfig;
use crate::keys::{self, KeyError};

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("not supported on this platform")]
    Unsupported,

    #[error("wireguard interface error: {0}")]
    Interface(String),

    #[error("interface {0} is not running")]
    NotRunning(String),

    #[error("bad {what}: {source}")]
    Key {
        what: String,
        #[source]
        source: KeyError,
    },

    #[error("bad allowed IP {0:?}")]
    Cidr(String),
}

/// The live WireGuard daemon, reached over netlink on Linux.
pub trait Daemon {
    /// Check that `config` would load, using the same decoding the reload
    /// path performs. Touches nothing.
    fn validate(&self, config: &ServerConfig)
    -> impl Future<Output = Result<(), DaemonError>> + Send;

    /// Bring the running interface in line with `config` without dropping
    /// sessions of peers that stay.
    fn reload(&self, config: &ServerConfig)
    -> impl Future<Output = Result<(), DaemonError>> + Send;

    fn peers(&self) -> impl Future<Output = Result<Vec<LivePeer>, DaemonError>> + Send;

    fn peer_count(&self) -> impl Future<Output = Result<usize, DaemonError>> + Send;

    fn listen_port(&self) -> impl Future<Output = Result<Option<u16>, DaemonError>> + Send;

    fn is_running(&self) -> impl Future<Output = Result<bool, DaemonError>> + Send;
}

#[cfg(target_os = "linux")]
pub type CurrentDaemon = linux::WgDaemon;

#[cfg(not(target_os = "linux"))]
pub type CurrentDaemon = StubDaemon;

pub fn parse_cidr(s: &str) -> Result<(IpAddr, u8), DaemonError> {
    let (addr, prefix) = s
        .split_once('/')
        .ok_or_else(|| DaemonError::Cidr(s.to_string()))?;
    let addr: IpAddr = addr.parse().map_err(|_| DaemonError::Cidr(s.to_string()))?;
    let prefix: u8 = prefix.parse().map_err(|_| DaemonError::Cidr(s.to_string()))?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(DaemonError::Cidr(s.to_string()));
    }
    Ok((addr, prefix))
}

fn decode(what: impl FnOnce() -> String, b64: &str) -> Result<[u8; 32], DaemonError> {
    keys::decode_key(b64).map_err(|source| DaemonError::Key {
        what: what(),
        source,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerPlan {
    pub public_key: [u8; 32],
    pub preshared_key: Option<[u8; 32]>,
    pub allowed_ips: Vec<(IpAddr, u8)>,
}

/// A server config decoded into the exact shape handed to the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePlan {
    pub private_key: [u8; 32],
    pub listen_port: Option<u16>,
    pub peers: Vec<PeerPlan>,
}

impl DevicePlan {
    pub fn from_config(config: &ServerConfig) -> Result<Self, DaemonError> {
        let interface = config.interface();
        let private_key = decode(|| "interface private key".into(), &interface.private_key)?;

        let peers = config
            .peers()
            .map(|p| {
                let public_key = decode(|| format!("public key of {}", p.name), &p.public_key)?;
                let preshared_key = p
                    .preshared_key
                    .as_deref()
                    .map(|psk| decode(|| format!("preshared key of {}", p.name), psk))
                    .transpose()?;
                let allowed_ips = vec![parse_cidr(&p.allowed_ip())?];
                Ok(PeerPlan {
                    public_key,
                    preshared_key,
                    allowed_ips,
                })
            })
            .collect::<Result<_, DaemonError>>()?;

        Ok(Self {
            private_key,
            listen_port: interface.listen_port,
            peers,
        })
    }

    /// Live peers that are absent from the plan and must be dropped.
    pub fn stale_peers(&self, live: &[LivePeer]) -> Result<Vec<[u8; 32]>, DaemonError> {
        let wanted: HashSet<[u8; 32]> = self.peers.iter().map(|p| p.public_key).collect();
        let mut stale = Vec::new();
        for peer in live {
            let key = decode(|| "live peer key".into(), &peer.public_key)?;
            if !wanted.contains(&key) {
                stale.push(key);
            }
        }
        Ok(stale)
    }
}

pub struct StubDaemon;

impl Daemon for StubDaemon {
    async fn validate(&self, config: &ServerConfig) -> Result<(), DaemonError> {
        DevicePlan::from_config(config).map(|_| ())
    }

    async fn reload(&self, _config: &ServerConfig) -> Result<(), DaemonError> {
        Err(DaemonError::Unsupported)
    }

    async fn peers(&self) -> Result<Vec<LivePeer>, DaemonError> {
        Err(DaemonError::Unsupported)
    }

    async fn peer_count(&self) -> Result<usize, DaemonError> {
        Err(DaemonError::Unsupported)
    }

    async fn listen_port(&self) -> Result<Option<u16>, DaemonError> {
        Err(DaemonError::Unsupported)
    }

    async fn is_running(&self) -> Result<bool, DaemonError> {
        Ok(false)
    }
}

#[cfg(target_os = "linux")]
pub mod linux {
    use peerward_types::daemon::LivePeer;
    use tracing::{debug, info};
    use wireguard_uapi::{DeviceInterface, RouteSocket, WgSocket, get, set};

    use super::{Daemon, DaemonError, DevicePlan};
    use crate::conf::ServerConfig;
    use crate::keys;

    pub struct WgDaemon {
        interface: String,
    }

    impl WgDaemon {
        pub fn new(interface: impl Into<String>) -> Self {
            Self {
                interface: interface.into(),
            }
        }

        fn device(&self) -> Result<get::Device, DaemonError> {
            let mut wg = WgSocket::connect().map_err(|e| DaemonError::Interface(e.to_string()))?;
            wg.get_device(DeviceInterface::from_name(self.interface.as_str()))
                .map_err(|e| DaemonError::Interface(e.to_string()))
        }

        fn exists(&self) -> Result<bool, DaemonError> {
            let mut route =
                RouteSocket::connect().map_err(|e| DaemonError::Interface(e.to_string()))?;
            let existing = route
                .list_device_names()
                .map_err(|e| DaemonError::Interface(e.to_string()))?;
            Ok(existing.iter().any(|n| n == &self.interface))
        }
    }

    fn live_peer(peer: &get::Peer) -> LivePeer {
        let preshared_key =
            (peer.preshared_key != [0u8; 32]).then(|| keys::encode_key(&peer.preshared_key));
        LivePeer {
            public_key: keys::encode_key(&peer.public_key),
            allowed_ips: peer
                .allowed_ips
                .iter()
                .map(|ip| format!("{}/{}", ip.ipaddr, ip.cidr_mask))
                .collect(),
            preshared_key,
        }
    }

    impl Daemon for WgDaemon {
        async fn validate(&self, config: &ServerConfig) -> Result<(), DaemonError> {
            let plan = DevicePlan::from_config(config)?;
            debug!(interface = %self.interface, peer_count = plan.peers.len(), "config decodes cleanly");
            Ok(())
        }

        async fn reload(&self, config: &ServerConfig) -> Result<(), DaemonError> {
            if !self.exists()? {
                return Err(DaemonError::NotRunning(self.interface.clone()));
            }
            let plan = DevicePlan::from_config(config)?;
            let live = self.peers().await?;
            let stale = plan.stale_peers(&live)?;

            let mut peers: Vec<set::Peer<'_>> = plan
                .peers
                .iter()
                .map(|p| {
                    let mut peer = set::Peer::from_public_key(&p.public_key)
                        .flags(vec![set::WgPeerF::ReplaceAllowedIps]);
                    if let Some(ref psk) = p.preshared_key {
                        peer = peer.preshared_key(psk);
                    }
                    let allowed_ips: Vec<set::AllowedIp<'_>> = p
                        .allowed_ips
                        .iter()
                        .map(|(addr, cidr)| {
                            let mut aip = set::AllowedIp::from_ipaddr(addr);
                            aip.cidr_mask = Some(*cidr);
                            aip
                        })
                        .collect();
                    peer.allowed_ips(allowed_ips)
                })
                .collect();

            peers.extend(
                stale
                    .iter()
                    .map(|key| set::Peer::from_public_key(key).flags(vec![set::WgPeerF::RemoveMe])),
            );

            let mut dev = set::Device::from_ifname(self.interface.as_str())
                .private_key(&plan.private_key)
                .peers(peers);
            if let Some(port) = plan.listen_port {
                dev = dev.listen_port(port);
            }

            let mut wg = WgSocket::connect().map_err(|e| DaemonError::Interface(e.to_string()))?;
            wg.set_device(dev)
                .map_err(|e| DaemonError::Interface(e.to_string()))?;

            info!(
                interface = %self.interface,
                upserted = plan.peers.len(),
                removed = stale.len(),
                "reloaded wireguard peers"
            );
            Ok(())
        }

        async fn peers(&self) -> Result<Vec<LivePeer>, DaemonError> {
            Ok(self.device()?.peers.iter().map(live_peer).collect())
        }

        async fn peer_count(&self) -> Result<usize, DaemonError> {
            Ok(self.device()?.peers.len())
        }

        async fn listen_port(&self) -> Result<Option<u16>, DaemonError> {
            let port = self.device()?.listen_port;
            Ok((port != 0).then_some(port))
        }

        async fn is_running(&self) -> Result<bool, DaemonError> {
            self.exists()
        }
    }
}
