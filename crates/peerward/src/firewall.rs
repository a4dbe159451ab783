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

use std::future::Future;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::FirewallKind;

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: &'static str,
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// Whatever guards the host's inbound UDP ports.
pub trait Firewall {
    fn open_port(&self, port: u16) -> impl Future<Output = Result<(), FirewallError>> + Send;
    fn close_port(&self, port: u16) -> impl Future<Output = Result<(), FirewallError>> + Send;
}

/// Leaves the firewall to someone else.
pub struct NoFirewall;

impl Firewall for NoFirewall {
    async fn open_port(&self, port: u16) -> Result<(), FirewallError> {
        debug!(port, "no firewall configured, not opening port");
        Ok(())
    }

    async fn close_port(&self, port: u16) -> Result<(), FirewallError> {
        debug!(port, "no firewall configured, not closing port");
        Ok(())
    }
}

pub struct Ufw;

impl Ufw {
    async fn run(&self, args: &[String]) -> Result<(), FirewallError> {
        let output = Command::new("ufw")
            .args(args)
            .output()
            .await
            .map_err(|source| FirewallError::Spawn {
                program: "ufw",
                source,
            })?;
        if !output.status.success() {
            return Err(FirewallError::Failed {
                command: format!("ufw {}", args.join(" ")),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

pub fn ufw_rule(port: u16) -> String {
    format!("{port}/udp")
}

impl Firewall for Ufw {
    async fn open_port(&self, port: u16) -> Result<(), FirewallError> {
        self.run(&["allow".into(), ufw_rule(port)]).await?;
        info!(port, "opened udp port in ufw");
        Ok(())
    }

    async fn close_port(&self, port: u16) -> Result<(), FirewallError> {
        self.run(&["delete".into(), "allow".into(), ufw_rule(port)])
            .await?;
        info!(port, "closed udp port in ufw");
        Ok(())
    }
}

/// The firewall picked in settings.
pub enum ConfiguredFirewall {
    None(NoFirewall),
    Ufw(Ufw),
}

impl From<FirewallKind> for ConfiguredFirewall {
    fn from(kind: FirewallKind) -> Self {
        match kind {
            FirewallKind::None => Self::None(NoFirewall),
            FirewallKind::Ufw => Self::Ufw(Ufw),
        }
    }
}

impl Firewall for ConfiguredFirewall {
    async fn open_port(&self, port: u16) -> Result<(), FirewallError> {
        match self {
            Self::None(fw) => fw.open_port(port).await,
            Self::Ufw(fw) => fw.open_port(port).await,
        }
    }

    async fn close_port(&self, port: u16) -> Result<(), FirewallError> {
        match self {
            Self::None(fw) => fw.close_port(port).await,
            Self::Ufw(fw) => fw.close_port(port).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_is_udp() {
        assert_eq!(ufw_rule(51820), "51820/udp");
    }

    #[tokio::test]
    async fn none_is_a_no_op() {
        let fw = ConfiguredFirewall::from(FirewallKind::None);
        assert!(fw.open_port(51820).await.is_ok());
        assert!(fw.close_port(51820).await.is_ok());
    }
}
