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

//! Every command the CLI can run, as data, plus the one place that runs it.
//!
//! In [`Mode::Simulate`] nothing is locked or written and the daemon and
//! firewall are only asked questions; the result lists the steps
//! [`Mode::Apply`] would take.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use peerward_types::PeerRecord;
use tracing::{error, info, warn};

use crate::alloc::AddressPool;
use crate::conf::{self, ServerConfig};
use crate::config::Settings;
use crate::daemon::Daemon;
use crate::discovery;
use crate::error::Error;
use crate::export::{self, Exported, ProfileDefaults};
use crate::firewall::Firewall;
use crate::keys;
use crate::reconcile::{self, ReconcileReport};
use crate::store::{self, Store, Transaction};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Init,
    AddPeer {
        name: String,
        address: Option<Ipv4Addr>,
    },
    RemovePeer {
        name: String,
    },
    ListPeers,
    ShowPeer {
        name: String,
        qr: bool,
    },
    Reconcile,
    SetListenPort {
        port: u16,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::AddPeer { .. } => "add",
            Self::RemovePeer { .. } => "remove",
            Self::ListPeers => "list",
            Self::ShowPeer { .. } => "show",
            Self::Reconcile => "reconcile",
            Self::SetListenPort { .. } => "set-port",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    Simulate,
    #[default]
    Apply,
}

#[derive(Debug)]
pub enum Outcome {
    /// What `Apply` would have done.
    Planned(Vec<String>),
    Initialized {
        path: PathBuf,
        public_key: String,
    },
    Added {
        record: PeerRecord,
        profile_path: PathBuf,
        report: ReconcileReport,
    },
    Removed {
        record: PeerRecord,
        report: ReconcileReport,
    },
    Peers(Vec<PeerRecord>),
    Shown {
        exported: Exported,
        qr: Option<String>,
    },
    Reconciled(ReconcileReport),
    PortChanged {
        previous: Option<u16>,
        port: u16,
        report: Option<ReconcileReport>,
    },
}

pub struct Dispatcher<D, F> {
    settings: Settings,
    store: Store,
    daemon: D,
    firewall: F,
}

impl<D: Daemon, F: Firewall> Dispatcher<D, F> {
    pub fn new(settings: Settings, daemon: D, firewall: F) -> Self {
        let store = Store::from_settings(&settings);
        Self {
            settings,
            store,
            daemon,
            firewall,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    #[tracing::instrument(skip(self), fields(command = op.name()))]
    pub async fn run(&self, op: Operation, mode: Mode) -> Result<Outcome, Error> {
        info!(?mode, "running operation");
        match (op, mode) {
            (Operation::Init, Mode::Apply) => self.init().await,
            (Operation::Init, Mode::Simulate) => self.plan_init().await,
            (Operation::AddPeer { name, address }, mode) => self
                .add(&name, address, mode)
                .await
                .map_err(|e| Error::peer("add", &name, e)),
            (Operation::RemovePeer { name }, mode) => self
                .remove(&name, mode)
                .await
                .map_err(|e| Error::peer("remove", &name, e)),
            (Operation::ListPeers, _) => Ok(Outcome::Peers(self.store.list_peers().await?)),
            (Operation::ShowPeer { name, qr }, _) => self
                .show(&name, qr)
                .await
                .map_err(|e| Error::peer("show", &name, e)),
            (Operation::Reconcile, mode) => self.reconcile(mode).await,
            (Operation::SetListenPort { port }, mode) => self.set_listen_port(port, mode).await,
        }
    }

    async fn init(&self) -> Result<Outcome, Error> {
        let pair = keys::generate_keypair();
        let text = conf::render_interface(
            &pair.private.to_string(),
            self.settings.server_address(),
            self.settings.listen_port,
            &self.settings.egress_interface,
        );
        self.store.init(&text).await?;
        tokio::fs::create_dir_all(&self.settings.profile_dir)
            .await
            .map_err(|source| store::StoreError::Io {
                op: "create directory",
                path: self.settings.profile_dir.clone(),
                source,
            })?;
        self.firewall.open_port(self.settings.listen_port).await?;
        info!(public_key = %pair.public, "initialized server");
        Ok(Outcome::Initialized {
            path: self.store.server_config_path().to_path_buf(),
            public_key: pair.public.to_string(),
        })
    }

    async fn plan_init(&self) -> Result<Outcome, Error> {
        let path = self.store.server_config_path();
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(store::StoreError::AlreadyInitialized(path.to_path_buf()).into());
        }
        Ok(Outcome::Planned(vec![
            "generate server keypair".into(),
            format!(
                "write {} with Address = {}, ListenPort = {}",
                path.display(),
                self.settings.server_address(),
                self.settings.listen_port
            ),
            format!("create {}", self.settings.profile_dir.display()),
            format!("open udp port {} ({:?} firewall)", self.settings.listen_port, self.settings.firewall),
        ]))
    }

    fn pick_address(
        &self,
        config: &ServerConfig,
        requested: Option<Ipv4Addr>,
    ) -> Result<Ipv4Addr, Error> {
        let pool = AddressPool::for_config(config, self.settings.subnet);
        Ok(match requested {
            Some(address) => pool.check_requested(config, address)?,
            None => pool.next_free(config)?,
        })
    }

    async fn endpoint(&self, config: &ServerConfig) -> Result<String, Error> {
        let port = config
            .interface()
            .listen_port
            .unwrap_or(self.settings.listen_port);
        let host = match self.settings.endpoint_host {
            Some(ref host) => host.clone(),
            None => {
                let client = discovery::client()?;
                discovery::external_address(&client, &self.settings.ip_discovery_url)
                    .await?
                    .to_string()
            }
        };
        Ok(export::endpoint(&host, port))
    }

    async fn profile_defaults(&self, config: &ServerConfig) -> Result<ProfileDefaults, Error> {
        Ok(ProfileDefaults {
            server_public_key: config.server_public_key()?.to_string(),
            endpoint: self.endpoint(config).await?,
            dns: self.settings.dns.clone(),
            allowed_ips: self.settings.client_allowed_ips.clone(),
            keepalive: self.settings.persistent_keepalive,
        })
    }

    async fn add(
        &self,
        name: &str,
        requested: Option<Ipv4Addr>,
        mode: Mode,
    ) -> Result<Outcome, Error> {
        store::validate_name(name)?;

        if mode == Mode::Simulate {
            let config = self.store.load_consistent().await?;
            if config.find_peer(name).is_some() {
                return Err(store::StoreError::DuplicateName(name.into()).into());
            }
            let address = self.pick_address(&config, requested)?;
            return Ok(Outcome::Planned(vec![
                format!("allocate {address}/32"),
                "generate client keypair".into(),
                format!("write {}", self.store.profile_path(name).display()),
                format!(
                    "append [Peer] stanza to {}",
                    self.store.server_config_path().display()
                ),
                format!("reload interface {}", self.settings.interface),
            ]));
        }

        let mut txn = self.store.begin().await?;
        let prepared = async {
            if txn.config().find_peer(name).is_some() {
                return Err(store::StoreError::DuplicateName(name.into()).into());
            }
            let address = self.pick_address(txn.config(), requested)?;
            let pair = keys::generate_keypair();
            let record = PeerRecord {
                name: name.to_string(),
                public_key: pair.public.to_string(),
                address,
                preshared_key: self
                    .settings
                    .preshared_keys
                    .then(keys::generate_preshared_key),
            };
            let defaults = self.profile_defaults(txn.config()).await?;
            let profile = export::render(&export::build_profile(&record, &pair.private, &defaults));
            Ok::<_, Error>((record, profile))
        }
        .await;

        let (record, profile) = match prepared {
            Ok(v) => v,
            Err(e) => return abort(txn, e).await,
        };
        if let Err(e) = txn.add_peer(record.clone(), &profile).await {
            return abort(txn, e).await;
        }

        let report = reconcile::apply(&self.daemon, txn).await?;
        Ok(Outcome::Added {
            profile_path: self.store.profile_path(name),
            record,
            report,
        })
    }

    async fn remove(&self, name: &str, mode: Mode) -> Result<Outcome, Error> {
        if mode == Mode::Simulate {
            let record = self.store.find_peer(name).await?;
            return Ok(Outcome::Planned(vec![
                format!(
                    "remove [Peer] stanza of {name} ({}) from {}",
                    record.address,
                    self.store.server_config_path().display()
                ),
                format!(
                    "archive {} into {}",
                    self.store.profile_path(name).display(),
                    self.settings.archive_dir.display()
                ),
                format!("reload interface {}", self.settings.interface),
            ]));
        }

        let mut txn = self.store.begin().await?;
        let record = match txn.remove_peer(name).await {
            Ok(record) => record,
            Err(e) => return abort(txn, e).await,
        };
        let report = reconcile::apply(&self.daemon, txn).await?;
        Ok(Outcome::Removed { record, report })
    }

    async fn show(&self, name: &str, qr: bool) -> Result<Outcome, Error> {
        let exported = export::export(&self.store, name).await?;
        let qr = qr.then(|| export::render_qr(&exported.text)).transpose()?;
        Ok(Outcome::Shown { exported, qr })
    }

    async fn reconcile(&self, mode: Mode) -> Result<Outcome, Error> {
        if mode == Mode::Simulate {
            let config = self.store.load_consistent().await?;
            self.daemon.validate(&config).await?;
            let running = self.daemon.is_running().await?;
            let step = if running {
                format!(
                    "sync {} peers into interface {}",
                    config.peer_count(),
                    self.settings.interface
                )
            } else {
                format!("nothing: interface {} is not running", self.settings.interface)
            };
            return Ok(Outcome::Planned(vec!["validate config".into(), step]));
        }

        // Hold the lock so no writer slips in while the daemon catches up.
        let txn = self.store.begin().await?;
        let report = reconcile::converge(&self.daemon, txn.config()).await;
        txn.commit();
        Ok(Outcome::Reconciled(report?))
    }

    async fn set_listen_port(&self, port: u16, mode: Mode) -> Result<Outcome, Error> {
        if port == 0 {
            return Err(Error::Validation("listen port must not be 0".into()));
        }

        if mode == Mode::Simulate {
            let config = self.store.load_consistent().await?;
            let previous = config.interface().listen_port;
            if previous == Some(port) {
                return Ok(Outcome::Planned(vec![format!("nothing: already listening on {port}")]));
            }
            let mut steps = vec![
                format!("open udp port {port}"),
                format!("set ListenPort = {port} in {}", self.store.server_config_path().display()),
                format!("reload interface {}", self.settings.interface),
            ];
            if let Some(old) = previous {
                steps.push(format!("close udp port {old}"));
            }
            return Ok(Outcome::Planned(steps));
        }

        let mut txn = self.store.begin().await?;
        if txn.config().interface().listen_port == Some(port) {
            txn.commit();
            return Ok(Outcome::PortChanged {
                previous: Some(port),
                port,
                report: None,
            });
        }

        if let Err(e) = self.firewall.open_port(port).await {
            return abort(txn, e).await;
        }
        let previous = match txn.set_listen_port(port).await {
            Ok(previous) => previous,
            Err(e) => {
                self.close_quietly(port).await;
                return abort(txn, e).await;
            }
        };
        let report = match reconcile::apply(&self.daemon, txn).await {
            Ok(report) => report,
            Err(e) => {
                self.close_quietly(port).await;
                return Err(e.into());
            }
        };

        if let Some(old) = previous {
            if let Err(e) = self.firewall.close_port(old).await {
                warn!(port = old, error = %e, "failed to close old port; needs manual reconciliation");
            }
        }
        Ok(Outcome::PortChanged {
            previous,
            port,
            report: Some(report),
        })
    }

    async fn close_quietly(&self, port: u16) {
        if let Err(e) = self.firewall.close_port(port).await {
            warn!(port, error = %e, "failed to close port after aborted change");
        }
    }
}

/// Roll back whatever `txn` wrote and return `err`.
async fn abort<T>(txn: Transaction<'_>, err: impl Into<Error>) -> Result<T, Error> {
    let err = err.into();
    if let Err(rollback) = txn.rollback().await {
        error!(error = %rollback, cause = %err, "rollback failed; needs manual reconciliation");
    }
    Err(err)
}
