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

//! Push a freshly written server config into the running daemon, or put the
//! file back if the daemon won't take it.

use std::fmt;

use peerward_types::daemon::same_peers;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::conf::ServerConfig;
use crate::daemon::{Daemon, DaemonError};
use crate::store::{StoreError, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileState {
    Pending,
    Validating,
    Valid,
    Invalid,
    Reloading,
    ReloadFailed,
    Verified,
    RolledBack,
    /// Interface is down; the file will be picked up when it next starts.
    Deferred,
    /// The daemon already runs exactly this peer set.
    AlreadyApplied,
}

impl fmt::Display for ReconcileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Validating => "validating",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Reloading => "reloading",
            Self::ReloadFailed => "reload failed",
            Self::Verified => "verified",
            Self::RolledBack => "rolled back",
            Self::Deferred => "deferred",
            Self::AlreadyApplied => "already applied",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub trace: Vec<ReconcileState>,
    pub peer_count: usize,
}

impl ReconcileReport {
    pub fn outcome(&self) -> ReconcileState {
        self.trace.last().copied().unwrap_or(ReconcileState::Pending)
    }
}

fn aftermath(restored: &bool) -> &'static str {
    if *restored {
        "change rolled back"
    } else {
        "needs manual reconciliation"
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("daemon rejected the new configuration ({source}); change rolled back")]
    Invalid { source: DaemonError },

    #[error("daemon reload failed ({source}); {}", aftermath(.restored))]
    ReloadFailed { source: DaemonError, restored: bool },

    #[error(
        "daemon reports {actual} peers after reload, expected {expected}; {}",
        aftermath(.restored)
    )]
    CountMismatch {
        expected: usize,
        actual: usize,
        restored: bool,
    },

    /// `rejected` is set when the daemon refused the config in validation,
    /// as opposed to failing after a reload.
    #[error("{cause}; restoring the previous config failed ({source}); needs manual reconciliation")]
    Rollback {
        cause: String,
        rejected: bool,
        source: StoreError,
    },
}

struct Tracker {
    trace: Vec<ReconcileState>,
}

impl Tracker {
    fn new() -> Self {
        Self {
            trace: vec![ReconcileState::Pending],
        }
    }

    fn enter(&mut self, state: ReconcileState) {
        debug!(from = %self.trace.last().copied().unwrap_or(ReconcileState::Pending), to = %state, "reconciler transition");
        self.trace.push(state);
    }

    fn report(self, peer_count: usize) -> ReconcileReport {
        ReconcileReport {
            trace: self.trace,
            peer_count,
        }
    }
}

/// Validate, reload and verify the config held by `txn`, committing it on
/// success and rolling the store back on any failure.
#[tracing::instrument(skip_all)]
pub async fn apply<D: Daemon>(
    daemon: &D,
    txn: Transaction<'_>,
) -> Result<ReconcileReport, ReconcileError> {
    let mut tracker = Tracker::new();
    let desired = txn.config().clone();
    let expected = desired.peer_count();

    tracker.enter(ReconcileState::Validating);
    if let Err(source) = daemon.validate(&desired).await {
        tracker.enter(ReconcileState::Invalid);
        let err = ReconcileError::Invalid { source };
        rollback(txn, err.to_string(), true).await?;
        tracker.enter(ReconcileState::RolledBack);
        warn!(trace = ?tracker.trace, "configuration rejected");
        return Err(err);
    }
    tracker.enter(ReconcileState::Valid);

    let previous = ServerConfig::parse(txn.snapshot()).ok();

    match push(daemon, &desired, &mut tracker).await {
        Ok(()) => {
            txn.commit();
            info!(outcome = %tracker.trace.last().copied().unwrap_or(ReconcileState::Pending), peer_count = expected, "reconciled");
            Ok(tracker.report(expected))
        }
        Err(failure) => {
            rollback(txn, failure.describe(), false).await?;
            let restored = match previous {
                Some(ref previous) => match daemon.reload(previous).await {
                    Ok(()) => true,
                    Err(e) => {
                        error!(error = %e, "reloading the restored config failed");
                        false
                    }
                },
                None => false,
            };
            tracker.enter(ReconcileState::RolledBack);
            let err = failure.into_error(restored);
            error!(trace = ?tracker.trace, error = %err, "reconciliation failed");
            Err(err)
        }
    }
}

/// Bring the daemon in line with what is on disk right now. Used after a
/// crash between a write and its reload; there is nothing to roll back to.
#[tracing::instrument(skip_all)]
pub async fn converge<D: Daemon>(
    daemon: &D,
    config: &ServerConfig,
) -> Result<ReconcileReport, ReconcileError> {
    let mut tracker = Tracker::new();

    tracker.enter(ReconcileState::Validating);
    if let Err(source) = daemon.validate(config).await {
        tracker.enter(ReconcileState::Invalid);
        return Err(ReconcileError::Invalid { source });
    }
    tracker.enter(ReconcileState::Valid);

    push(daemon, config, &mut tracker)
        .await
        .map_err(|failure| failure.into_error(false))?;
    info!(outcome = %tracker.trace.last().copied().unwrap_or(ReconcileState::Pending), "converged");
    Ok(tracker.report(config.peer_count()))
}

enum Failure {
    Reload(DaemonError),
    Count { expected: usize, actual: usize },
}

impl Failure {
    fn describe(&self) -> String {
        match self {
            Self::Reload(source) => format!("daemon reload failed ({source})"),
            Self::Count { expected, actual } => {
                format!("daemon reports {actual} peers after reload, expected {expected}")
            }
        }
    }

    fn into_error(self, restored: bool) -> ReconcileError {
        match self {
            Self::Reload(source) => ReconcileError::ReloadFailed { source, restored },
            Self::Count { expected, actual } => ReconcileError::CountMismatch {
                expected,
                actual,
                restored,
            },
        }
    }
}

async fn push<D: Daemon>(
    daemon: &D,
    desired: &ServerConfig,
    tracker: &mut Tracker,
) -> Result<(), Failure> {
    if !daemon.is_running().await.map_err(Failure::Reload)? {
        tracker.enter(ReconcileState::Deferred);
        info!("interface is not running, config will load on next start");
        return Ok(());
    }

    let live = daemon.peers().await.map_err(Failure::Reload)?;
    let wanted_port = desired.interface().listen_port;
    let port_matches = match wanted_port {
        Some(port) => daemon.listen_port().await.map_err(Failure::Reload)? == Some(port),
        None => true,
    };
    if port_matches && same_peers(&live, &desired.live_peers()) {
        tracker.enter(ReconcileState::AlreadyApplied);
        debug!(peer_count = live.len(), "daemon already matches config");
        return Ok(());
    }

    tracker.enter(ReconcileState::Reloading);
    if let Err(e) = daemon.reload(desired).await {
        tracker.enter(ReconcileState::ReloadFailed);
        return Err(Failure::Reload(e));
    }

    let expected = desired.peer_count();
    let actual = daemon.peer_count().await.map_err(|e| {
        tracker.enter(ReconcileState::ReloadFailed);
        Failure::Reload(e)
    })?;
    if actual != expected {
        tracker.enter(ReconcileState::ReloadFailed);
        return Err(Failure::Count { expected, actual });
    }
    tracker.enter(ReconcileState::Verified);
    Ok(())
}

async fn rollback(
    txn: Transaction<'_>,
    cause: String,
    rejected: bool,
) -> Result<(), ReconcileError> {
    txn.rollback().await.map_err(|source| ReconcileError::Rollback {
        cause,
        rejected,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use peerward_types::daemon::LivePeer;

    #[derive(Default)]
    struct FakeDaemon {
        live: Mutex<Vec<LivePeer>>,
        port: Mutex<Option<u16>>,
        down: bool,
        reject: bool,
        drop_one: bool,
        reloads: AtomicUsize,
    }

    impl Daemon for FakeDaemon {
        async fn validate(&self, _config: &ServerConfig) -> Result<(), DaemonError> {
            if self.reject {
                return Err(DaemonError::Cidr("nope".into()));
            }
            Ok(())
        }

        async fn reload(&self, config: &ServerConfig) -> Result<(), DaemonError> {
            self.reloads.fetch_add(1, Ordering::SeqCst);
            let mut peers = config.live_peers();
            if self.drop_one {
                peers.pop();
            }
            *self.live.lock().unwrap() = peers;
            *self.port.lock().unwrap() = config.interface().listen_port;
            Ok(())
        }

        async fn peers(&self) -> Result<Vec<LivePeer>, DaemonError> {
            Ok(self.live.lock().unwrap().clone())
        }

        async fn peer_count(&self) -> Result<usize, DaemonError> {
            Ok(self.live.lock().unwrap().len())
        }

        async fn listen_port(&self) -> Result<Option<u16>, DaemonError> {
            Ok(*self.port.lock().unwrap())
        }

        async fn is_running(&self) -> Result<bool, DaemonError> {
            Ok(!self.down)
        }
    }

    fn config() -> ServerConfig {
        let text = crate::conf::render_interface(
            "YWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWE=",
            "10.13.13.1/24".parse().unwrap(),
            51820,
            "eth0",
        ) + "\n# Client: laptop\n[Peer]\nPublicKey = YmJiYmJiYmJiYmJiYmJiYmJiYmJiYmJiYmJiYmJiYmI=\nAllowedIPs = 10.13.13.2/32\n";
        ServerConfig::parse(&text).unwrap()
    }

    use ReconcileState::*;

    #[tokio::test]
    async fn converge_reloads_then_verifies() {
        let daemon = FakeDaemon::default();
        let report = converge(&daemon, &config()).await.unwrap();
        assert_eq!(report.trace, vec![Pending, Validating, Valid, Reloading, Verified]);
        assert_eq!(report.peer_count, 1);
    }

    #[tokio::test]
    async fn converge_twice_is_a_no_op() {
        let daemon = FakeDaemon::default();
        converge(&daemon, &config()).await.unwrap();
        let report = converge(&daemon, &config()).await.unwrap();
        assert_eq!(report.outcome(), AlreadyApplied);
        assert_eq!(daemon.reloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn converge_defers_when_interface_down() {
        let daemon = FakeDaemon {
            down: true,
            ..Default::default()
        };
        let report = converge(&daemon, &config()).await.unwrap();
        assert_eq!(report.outcome(), Deferred);
        assert_eq!(daemon.reloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn converge_reports_invalid() {
        let daemon = FakeDaemon {
            reject: true,
            ..Default::default()
        };
        let err = converge(&daemon, &config()).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Invalid { .. }));
        assert_eq!(daemon.reloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn converge_count_mismatch_needs_manual_fix() {
        let daemon = FakeDaemon {
            drop_one: true,
            ..Default::default()
        };
        let err = converge(&daemon, &config()).await.unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::CountMismatch { expected: 1, actual: 0, restored: false }
        ));
        assert!(err.to_string().contains("needs manual reconciliation"));
    }

    #[tokio::test]
    async fn port_change_alone_triggers_reload() {
        let daemon = FakeDaemon::default();
        let mut cfg = config();
        converge(&daemon, &cfg).await.unwrap();

        cfg.set_listen_port(51999);
        let report = converge(&daemon, &cfg).await.unwrap();
        assert_eq!(report.outcome(), Verified);
        assert_eq!(*daemon.port.lock().unwrap(), Some(51999));
    }

    #[test]
    fn outcome_is_last_state() {
        let report = ReconcileReport {
            trace: vec![Pending, Validating, Invalid, RolledBack],
            peer_count: 0,
        };
        assert_eq!(report.outcome(), RolledBack);
    }

    #[tokio::test]
    async fn rejected_change_with_broken_rollback_keeps_config_invalid_kind() {
        use crate::store::Store;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(
            dir.path().join("wg0.conf"),
            dir.path().join("clients"),
            dir.path().join("archive"),
            Duration::from_millis(200),
        );
        store.init(&config().to_text()).await.unwrap();
        tokio::fs::create_dir_all(dir.path().join("clients")).await.unwrap();
        tokio::fs::write(store.profile_path("laptop"), "profile").await.unwrap();
        let before = tokio::fs::read_to_string(store.server_config_path()).await.unwrap();

        let mut txn = store.begin().await.unwrap();
        txn.remove_peer("laptop").await.unwrap();
        tokio::fs::remove_dir_all(dir.path().join("archive")).await.unwrap();

        let daemon = FakeDaemon {
            reject: true,
            ..FakeDaemon::default()
        };
        let err = apply(&daemon, txn).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Rollback { rejected: true, .. }), "{err}");
        assert_eq!(crate::Error::from(err).exit_code(), 16);

        let after = tokio::fs::read_to_string(store.server_config_path()).await.unwrap();
        assert_eq!(before, after);
        assert_eq!(daemon.reloads.load(Ordering::SeqCst), 0);
    }
}
