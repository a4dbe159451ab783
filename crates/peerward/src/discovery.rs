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

use std::net::IpAddr;
use std::time::Duration;

use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{url} returned {status}")]
    Status { url: String, status: u16 },

    #[error("{url} returned {body:?}, which is not an IP address")]
    NotAnAddress { url: String, body: String },
}

pub fn client() -> Result<Client, DiscoveryError> {
    Ok(Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

/// Parse the plain-text body of an IP echo service.
pub fn parse_address(url: &str, body: &str) -> Result<IpAddr, DiscoveryError> {
    body.trim()
        .parse()
        .map_err(|_| DiscoveryError::NotAnAddress {
            url: url.to_string(),
            body: body.trim().to_string(),
        })
}

/// Ask an IP echo service for this host's public address.
#[tracing::instrument(skip(client))]
pub async fn external_address(client: &Client, url: &str) -> Result<IpAddr, DiscoveryError> {
    debug!("querying external address");
    let resp = client.get(url).send().await?;

    let status = resp.status().as_u16();
    if status != 200 {
        warn!(status, "address discovery returned unexpected status");
        return Err(DiscoveryError::Status {
            url: url.to_string(),
            status,
        });
    }

    let body = resp.text().await?;
    let address = parse_address(url, &body)?;
    info!(%address, "discovered external address");
    Ok(address)
}
