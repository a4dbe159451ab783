use thiserror::Error;

use crate::alloc::AllocError;
use crate::config::ConfigError;
use crate::daemon::DaemonError;
use crate::discovery::DiscoveryError;
use crate::export::ExportError;
use crate::firewall::FirewallError;
use crate::keys::KeyError;
use crate::lock::LockError;
use crate::reconcile::ReconcileError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{operation} {peer:?}: {source}")]
    Peer {
        operation: &'static str,
        peer: String,
        source: Box<Error>,
    },

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Firewall(#[from] FirewallError),

    #[error(transparent)]
    Daemon(#[from] DaemonError),
}

/// The failure classes a caller can act on, each with its own exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    DuplicatePeer,
    PeerNotFound,
    AddressExhausted,
    ReconciliationFailed,
    LockTimeout,
    ConfigInvalid,
    ConfigParse,
    Other,
}

impl ErrorKind {
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Other => 1,
            Self::Validation => 10,
            Self::DuplicatePeer => 11,
            Self::PeerNotFound => 12,
            Self::AddressExhausted => 13,
            Self::ReconciliationFailed => 14,
            Self::LockTimeout => 15,
            Self::ConfigInvalid => 16,
            Self::ConfigParse => 17,
        }
    }
}

fn store_kind(err: &StoreError) -> ErrorKind {
    match err {
        StoreError::Lock(LockError::Timeout { .. }) => ErrorKind::LockTimeout,
        StoreError::Parse { .. } => ErrorKind::ConfigParse,
        StoreError::InvalidName { .. } | StoreError::AlreadyInitialized(_) => {
            ErrorKind::Validation
        }
        StoreError::DuplicateName(_) | StoreError::DuplicateAddress { .. } => {
            ErrorKind::DuplicatePeer
        }
        StoreError::PeerNotFound(_) => ErrorKind::PeerNotFound,
        StoreError::Lock(LockError::Io { .. })
        | StoreError::Io { .. }
        | StoreError::NotInitialized(_)
        | StoreError::MissingProfile { .. } => ErrorKind::Other,
    }
}

impl Error {
    /// Attach the operation and peer name to an error.
    pub fn peer(operation: &'static str, peer: impl Into<String>, err: impl Into<Error>) -> Self {
        Self::Peer {
            operation,
            peer: peer.into(),
            source: Box::new(err.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Peer { source, .. } => source.kind(),
            Self::Validation(_) | Self::Key(_) => ErrorKind::Validation,
            Self::Config(ConfigError::Read(_)) => ErrorKind::Other,
            Self::Config(_) => ErrorKind::Validation,
            Self::Store(e) => store_kind(e),
            Self::Alloc(AllocError::Exhausted { .. }) => ErrorKind::AddressExhausted,
            Self::Alloc(AllocError::InUse { .. }) => ErrorKind::DuplicatePeer,
            Self::Alloc(AllocError::OutOfRange { .. } | AllocError::Reserved { .. }) => {
                ErrorKind::Validation
            }
            Self::Reconcile(
                ReconcileError::Invalid { .. } | ReconcileError::Rollback { rejected: true, .. },
            ) => ErrorKind::ConfigInvalid,
            Self::Reconcile(_) => ErrorKind::ReconciliationFailed,
            Self::Export(ExportError::Store(e)) => store_kind(e),
            Self::Export(ExportError::Parse { .. } | ExportError::MissingField(_)) => {
                ErrorKind::ConfigParse
            }
            Self::Export(_) | Self::Discovery(_) | Self::Firewall(_) | Self::Daemon(_) => {
                ErrorKind::Other
            }
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.kind().exit_code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::path::PathBuf;
    use std::time::Duration;
    use test_case::test_case;

    fn rollback_failed(rejected: bool) -> Error {
        ReconcileError::Rollback {
            cause: "daemon said no".into(),
            rejected,
            source: StoreError::NotInitialized(PathBuf::from("/x")),
        }
        .into()
    }

    #[test_case(Error::Validation("bad".into()), 10; "validation")]
    #[test_case(StoreError::DuplicateName("laptop".into()).into(), 11; "duplicate name")]
    #[test_case(AllocError::InUse { address: Ipv4Addr::new(10, 13, 13, 2), peer: "a".into() }.into(), 11; "address in use")]
    #[test_case(StoreError::PeerNotFound("ghost".into()).into(), 12; "not found")]
    #[test_case(AllocError::Exhausted { capacity: 253, subnet: "10.13.13.0/24".parse().unwrap() }.into(), 13; "exhausted")]
    #[test_case(ReconcileError::CountMismatch { expected: 2, actual: 1, restored: true }.into(), 14; "reconciliation")]
    #[test_case(StoreError::Lock(LockError::Timeout { path: PathBuf::from("/x"), waited: Duration::from_secs(10) }).into(), 15; "lock timeout")]
    #[test_case(ReconcileError::Invalid { source: DaemonError::Cidr("x".into()) }.into(), 16; "config invalid")]
    #[test_case(rollback_failed(true), 16; "rejected then rollback failed")]
    #[test_case(rollback_failed(false), 14; "reload failed then rollback failed")]
    #[test_case(StoreError::Parse { path: PathBuf::from("/x"), source: crate::conf::ParseError::MissingInterface }.into(), 17; "parse")]
    #[test_case(StoreError::NotInitialized(PathBuf::from("/x")).into(), 1; "other")]
    fn exit_codes(err: Error, code: u8) {
        assert_eq!(err.exit_code(), code);
    }

    #[test]
    fn peer_context_keeps_kind_and_names_peer() {
        let err = Error::peer("remove", "ghost", StoreError::PeerNotFound("ghost".into()));
        assert_eq!(err.kind(), ErrorKind::PeerNotFound);
        assert!(err.to_string().starts_with("remove \"ghost\": "));
    }
}
