use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirewallKind {
    #[default]
    None,
    Ufw,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub interface: String,
    pub server_config: PathBuf,
    pub profile_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub subnet: Ipv4Network,
    pub listen_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_host: Option<String>,
    pub ip_discovery_url: String,
    pub dns: Vec<IpAddr>,
    pub client_allowed_ips: Vec<String>,
    pub persistent_keepalive: u16,
    pub lock_timeout_secs: u64,
    pub preshared_keys: bool,
    pub egress_interface: String,
    pub firewall: FirewallKind,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            interface: "wg0".into(),
            server_config: PathBuf::from("/etc/wireguard/wg0.conf"),
            profile_dir: PathBuf::from("/etc/wireguard/clients"),
            archive_dir: PathBuf::from("/etc/wireguard/clients/archive"),
            subnet: Ipv4Network::new([10, 13, 13, 0].into(), 24).unwrap(),
            listen_port: 51820,
            endpoint_host: None,
            ip_discovery_url: "https://api.ipify.org".into(),
            dns: vec![[1, 1, 1, 1].into(), [1, 0, 0, 1].into()],
            client_allowed_ips: vec!["0.0.0.0/0".into(), "::/0".into()],
            persistent_keepalive: 25,
            lock_timeout_secs: 10,
            preshared_keys: false,
            egress_interface: "eth0".into(),
            firewall: FirewallKind::None,
        }
    }
}

impl Settings {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// The server's own address: offset 1 of the subnet.
    pub fn server_address(&self) -> Ipv4Network {
        let ip = u32::from(self.subnet.network()) + 1;
        Ipv4Network::new(ip.into(), self.subnet.prefix()).unwrap_or(self.subnet)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("subnet {0} is too small, need a prefix of /30 or shorter")]
    SubnetTooSmall(Ipv4Network),

    #[error("client_allowed_ips must not be empty")]
    NoClientRoutes,

    #[error("{field} must not be empty")]
    Empty { field: &'static str },
}

pub async fn load(path: &Path) -> Result<Settings, ConfigError> {
    debug!(path = %path.display(), "loading settings");

    let settings = match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let settings: Settings = toml::from_str(&contents)?;
            info!(
                path = %path.display(),
                interface = %settings.interface,
                subnet = %settings.subnet,
                "loaded settings"
            );
            settings
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "settings file not found, using defaults");
            Settings::default()
        }
        Err(e) => return Err(ConfigError::Read(e)),
    };

    validate(&settings)?;
    Ok(settings)
}

pub fn validate(settings: &Settings) -> Result<(), ConfigError> {
    if settings.subnet.prefix() > 30 {
        return Err(ConfigError::SubnetTooSmall(settings.subnet));
    }
    if settings.client_allowed_ips.is_empty() {
        return Err(ConfigError::NoClientRoutes);
    }
    if settings.interface.trim().is_empty() {
        return Err(ConfigError::Empty { field: "interface" });
    }
    if settings.egress_interface.trim().is_empty() {
        return Err(ConfigError::Empty {
            field: "egress_interface",
        });
    }
    debug!(interface = %settings.interface, "settings validated");
    Ok(())
}
