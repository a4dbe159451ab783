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

//! The on-disk peer registry: the server config plus one profile per peer.
//!
//! Every mutation runs inside a [`Transaction`], which holds the exclusive
//! lock, starts from a fresh read of the file, and remembers enough to undo
//! itself. Nothing is cached between transactions.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use peerward_types::PeerRecord;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::conf::{ParseError, ServerConfig};
use crate::config::Settings;
use crate::lock::{self, LockError, LockGuard};

const READ_ATTEMPTS: u32 = 5;
const READ_BACKOFF: Duration = Duration::from_millis(20);
const MAX_NAME_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{} is not valid: {source}; repair it by hand before making changes", path.display())]
    Parse { path: PathBuf, source: ParseError },

    #[error("{} does not exist; run `peerward init` first", .0.display())]
    NotInitialized(PathBuf),

    #[error("{} already exists", .0.display())]
    AlreadyInitialized(PathBuf),

    #[error("invalid peer name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("peer {0:?} already exists")]
    DuplicateName(String),

    #[error("address {address} is already assigned to peer {peer:?}")]
    DuplicateAddress { address: Ipv4Addr, peer: String },

    #[error("peer {0:?} not found")]
    PeerNotFound(String),

    #[error("peer {name:?} has no client profile at {}", path.display())]
    MissingProfile { name: String, path: PathBuf },
}

fn io_error(op: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> StoreError {
    let path = path.to_path_buf();
    move |source| StoreError::Io { op, path, source }
}

pub fn validate_name(name: &str) -> Result<(), StoreError> {
    let invalid = |reason| StoreError::InvalidName {
        name: name.to_string(),
        reason,
    };
    if name.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("longer than 64 characters"));
    }
    if !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return Err(invalid("must start with a letter or digit"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(invalid("only letters, digits, '-', '_' and '.' are allowed"));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct Store {
    server_config: PathBuf,
    profile_dir: PathBuf,
    archive_dir: PathBuf,
    lock_timeout: Duration,
}

impl Store {
    pub fn new(
        server_config: impl Into<PathBuf>,
        profile_dir: impl Into<PathBuf>,
        archive_dir: impl Into<PathBuf>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            server_config: server_config.into(),
            profile_dir: profile_dir.into(),
            archive_dir: archive_dir.into(),
            lock_timeout,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            &settings.server_config,
            &settings.profile_dir,
            &settings.archive_dir,
            settings.lock_timeout(),
        )
    }

    pub fn server_config_path(&self) -> &Path {
        &self.server_config
    }

    pub fn profile_path(&self, name: &str) -> PathBuf {
        self.profile_dir.join(format!("{name}.conf"))
    }

    async fn lock(&self) -> Result<LockGuard, StoreError> {
        if let Some(parent) = self.server_config.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(io_error("create directory", parent))?;
        }
        let lock_path = lock::lock_path_for(&self.server_config);
        Ok(lock::acquire(&lock_path, self.lock_timeout).await?)
    }

    async fn read_text(&self) -> Result<String, StoreError> {
        match tokio::fs::read_to_string(&self.server_config).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotInitialized(self.server_config.clone()))
            }
            Err(e) => Err(io_error("read", &self.server_config)(e)),
        }
    }

    fn parse(&self, text: &str) -> Result<ServerConfig, StoreError> {
        ServerConfig::parse(text).map_err(|source| StoreError::Parse {
            path: self.server_config.clone(),
            source,
        })
    }

    /// Single lock-free read of the current file.
    pub async fn load(&self) -> Result<ServerConfig, StoreError> {
        let text = self.read_text().await?;
        self.parse(&text)
    }

    /// Lock-free read that rides out a concurrent writer: a parse failure is
    /// retried with exponential backoff before it is reported.
    pub async fn load_consistent(&self) -> Result<ServerConfig, StoreError> {
        let mut delay = READ_BACKOFF;
        let mut attempt = 1;
        loop {
            match self.load().await {
                Err(StoreError::Parse { .. }) if attempt < READ_ATTEMPTS => {
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "config did not parse, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    #[tracing::instrument(skip(self), fields(path = %self.server_config.display()))]
    pub async fn list_peers(&self) -> Result<Vec<PeerRecord>, StoreError> {
        let config = self.load_consistent().await?;
        Ok(config.peers().cloned().collect())
    }

    pub async fn find_peer(&self, name: &str) -> Result<PeerRecord, StoreError> {
        let config = self.load_consistent().await?;
        config
            .find_peer(name)
            .cloned()
            .ok_or_else(|| StoreError::PeerNotFound(name.to_string()))
    }

    pub async fn read_profile(&self, name: &str) -> Result<String, StoreError> {
        let path = self.profile_path(name);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::MissingProfile {
                name: name.to_string(),
                path,
            }),
            Err(e) => Err(io_error("read", &path)(e)),
        }
    }

    /// Write the very first server config. Refuses to touch an existing one.
    #[tracing::instrument(skip_all, fields(path = %self.server_config.display()))]
    pub async fn init(&self, text: &str) -> Result<(), StoreError> {
        let _lock = self.lock().await?;
        if tokio::fs::try_exists(&self.server_config)
            .await
            .map_err(io_error("stat", &self.server_config))?
        {
            return Err(StoreError::AlreadyInitialized(self.server_config.clone()));
        }
        self.parse(text)?;
        write_atomic(&self.server_config, text).await?;
        info!("wrote initial server config");
        Ok(())
    }

    /// Lock the registry and read it fresh.
    pub async fn begin(&self) -> Result<Transaction<'_>, StoreError> {
        let lock = self.lock().await?;
        let snapshot = self.read_text().await?;
        let config = self.parse(&snapshot)?;
        debug!(peer_count = config.peer_count(), "transaction started");
        Ok(Transaction {
            store: self,
            _lock: lock,
            snapshot,
            config,
            undo: Vec::new(),
            dirty: false,
        })
    }
}

#[derive(Debug)]
enum Undo {
    RemoveProfile(PathBuf),
    Unarchive { archived: PathBuf, original: PathBuf },
}

#[derive(Debug)]
pub struct Transaction<'a> {
    store: &'a Store,
    _lock: LockGuard,
    snapshot: String,
    config: ServerConfig,
    undo: Vec<Undo>,
    dirty: bool,
}

impl Transaction<'_> {
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The file contents as they were when the transaction began.
    pub fn snapshot(&self) -> &str {
        &self.snapshot
    }

    async fn write_config(&mut self, next: ServerConfig) -> Result<(), StoreError> {
        write_atomic(&self.store.server_config, &next.to_text()).await?;
        self.config = next;
        self.dirty = true;
        Ok(())
    }

    /// Append a peer and write its client profile. On a name or address
    /// collision nothing is written at all.
    #[tracing::instrument(skip_all, fields(peer = %record.name, address = %record.address))]
    pub async fn add_peer(
        &mut self,
        record: PeerRecord,
        profile: &str,
    ) -> Result<(), StoreError> {
        validate_name(&record.name)?;
        if self.config.find_peer(&record.name).is_some() {
            return Err(StoreError::DuplicateName(record.name));
        }
        if let Some(owner) = self.config.peers().find(|p| p.address == record.address) {
            return Err(StoreError::DuplicateAddress {
                address: record.address,
                peer: owner.name.clone(),
            });
        }

        // Profile first: a crash in between leaves an orphan profile, never
        // a peer without one.
        let profile_path = self.store.profile_path(&record.name);
        tokio::fs::create_dir_all(&self.store.profile_dir)
            .await
            .map_err(io_error("create directory", &self.store.profile_dir))?;
        write_atomic(&profile_path, profile).await?;
        self.undo.push(Undo::RemoveProfile(profile_path));

        let mut next = self.config.clone();
        next.push_peer(record);
        self.write_config(next).await?;
        info!("peer added to server config");
        Ok(())
    }

    /// Drop the peer's stanza and archive its profile.
    #[tracing::instrument(skip(self))]
    pub async fn remove_peer(&mut self, name: &str) -> Result<PeerRecord, StoreError> {
        let mut next = self.config.clone();
        let removed = next
            .remove_peer(name)
            .ok_or_else(|| StoreError::PeerNotFound(name.to_string()))?;
        self.write_config(next).await?;

        let original = self.store.profile_path(name);
        if tokio::fs::try_exists(&original)
            .await
            .map_err(io_error("stat", &original))?
        {
            let archived = self.archive_profile(name, &original).await?;
            self.undo.push(Undo::Unarchive { archived, original });
        } else {
            warn!(path = %original.display(), "removed peer had no client profile to archive");
        }
        info!(address = %removed.address, "peer removed from server config");
        Ok(removed)
    }

    async fn archive_profile(&self, name: &str, original: &Path) -> Result<PathBuf, StoreError> {
        let dir = &self.store.archive_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(io_error("create directory", dir))?;

        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let mut archived = dir.join(format!("{name}.conf.{stamp}"));
        let mut n = 1;
        while tokio::fs::try_exists(&archived)
            .await
            .map_err(io_error("stat", &archived))?
        {
            archived = dir.join(format!("{name}.conf.{stamp}-{n}"));
            n += 1;
        }
        tokio::fs::rename(original, &archived)
            .await
            .map_err(io_error("archive", original))?;
        info!(archived = %archived.display(), "archived client profile");
        Ok(archived)
    }

    /// Returns the previous port, if one was set.
    #[tracing::instrument(skip(self))]
    pub async fn set_listen_port(&mut self, port: u16) -> Result<Option<u16>, StoreError> {
        let mut next = self.config.clone();
        let previous = next.set_listen_port(port);
        if previous == Some(port) {
            debug!("listen port unchanged");
            return Ok(previous);
        }
        self.write_config(next).await?;
        info!(previous = ?previous, "listen port updated");
        Ok(previous)
    }

    /// Put the config file and profile directory back the way they were
    /// when the transaction began. The config is restored first; profile
    /// steps that fail are skipped and the first such error is returned.
    pub async fn rollback(mut self) -> Result<(), StoreError> {
        if self.dirty {
            write_atomic(&self.store.server_config, &self.snapshot).await?;
            self.config = self.store.parse(&self.snapshot)?;
            self.dirty = false;
            warn!(path = %self.store.server_config.display(), "rolled back server config");
        }

        let mut first_error = None;
        while let Some(step) = self.undo.pop() {
            let result = match step {
                Undo::RemoveProfile(path) => match tokio::fs::remove_file(&path).await {
                    Ok(()) => {
                        debug!(path = %path.display(), "removed new profile");
                        Ok(())
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(io_error("remove", &path)(e)),
                },
                Undo::Unarchive { archived, original } => {
                    match tokio::fs::rename(&archived, &original).await {
                        Ok(()) => {
                            debug!(path = %original.display(), "restored archived profile");
                            Ok(())
                        }
                        Err(e) => Err(io_error("restore", &archived)(e)),
                    }
                }
            };
            if let Err(e) = result {
                error!(error = %e, "could not undo profile change");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Keep what was written and release the lock.
    pub fn commit(self) {
        debug!(changed = self.dirty, "transaction committed");
    }
}

/// Write via a temp file in the same directory and rename it into place, so
/// readers see either the old file or the new one, never a partial write.
pub async fn write_atomic(path: &Path, contents: &str) -> Result<(), StoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));

    let result = async {
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(&tmp).await.map_err(io_error("create", &tmp))?;
        file.write_all(contents.as_bytes())
            .await
            .map_err(io_error("write", &tmp))?;
        file.sync_all().await.map_err(io_error("sync", &tmp))?;
        drop(file);
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(io_error("replace", path))
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
        return result;
    }

    #[cfg(unix)]
    if let Ok(dir_handle) = tokio::fs::File::open(dir).await {
        if let Err(e) = dir_handle.sync_all().await {
            debug!(dir = %dir.display(), error = %e, "directory sync failed");
        }
    }
    debug!(path = %path.display(), bytes = contents.len(), "wrote file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    const SERVER_KEY: &str = "YWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWE=";
    const KEY_B: &str = "YmJiYmJiYmJiYmJiYmJiYmJiYmJiYmJiYmJiYmJiYmI=";
    const KEY_C: &str = "Y2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjYWE=";

    async fn fresh_store(dir: &Path) -> Store {
        let store = Store::new(
            dir.join("wg0.conf"),
            dir.join("clients"),
            dir.join("clients/archive"),
            Duration::from_millis(200),
        );
        let text = crate::conf::render_interface(
            SERVER_KEY,
            "10.13.13.1/24".parse().unwrap(),
            51820,
            "eth0",
        );
        store.init(&text).await.unwrap();
        store
    }

    fn record(name: &str, key: &str, last: u8) -> PeerRecord {
        PeerRecord {
            name: name.into(),
            public_key: key.into(),
            address: Ipv4Addr::new(10, 13, 13, last),
            preshared_key: None,
        }
    }

    #[test_case("laptop", true; "simple")]
    #[test_case("dad-s_phone.2", true; "punctuation")]
    #[test_case("", false; "empty")]
    #[test_case("-laptop", false; "leading dash")]
    #[test_case("../etc/passwd", false; "path traversal")]
    #[test_case("my laptop", false; "space")]
    fn name_validation(name: &str, ok: bool) {
        assert_eq!(validate_name(name).is_ok(), ok);
    }

    #[tokio::test]
    async fn add_writes_stanza_and_profile() {
        let dir = tempfile::tempdir().unwrap();
        let store = fresh_store(dir.path()).await;

        let mut tx = store.begin().await.unwrap();
        tx.add_peer(record("laptop", KEY_B, 2), "profile").await.unwrap();
        tx.commit();

        let peers = store.list_peers().await.unwrap();
        assert_eq!(peers, vec![record("laptop", KEY_B, 2)]);
        assert_eq!(store.read_profile("laptop").await.unwrap(), "profile");
    }

    #[tokio::test]
    async fn duplicate_name_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = fresh_store(dir.path()).await;

        let mut tx = store.begin().await.unwrap();
        tx.add_peer(record("phone", KEY_B, 2), "p").await.unwrap();
        tx.commit();
        let before = tokio::fs::read(store.server_config_path()).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let err = tx.add_peer(record("phone", KEY_C, 3), "p2").await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateName(_)));
        tx.rollback().await.unwrap();

        let after = tokio::fs::read(store.server_config_path()).await.unwrap();
        assert_eq!(before, after);
        assert_eq!(store.read_profile("phone").await.unwrap(), "p");
    }

    #[tokio::test]
    async fn duplicate_address_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = fresh_store(dir.path()).await;

        let mut tx = store.begin().await.unwrap();
        tx.add_peer(record("a", KEY_B, 2), "p").await.unwrap();
        let err = tx.add_peer(record("b", KEY_C, 2), "p").await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateAddress { ref peer, .. } if peer == "a"));
    }

    #[tokio::test]
    async fn remove_archives_profile() {
        let dir = tempfile::tempdir().unwrap();
        let store = fresh_store(dir.path()).await;

        let mut tx = store.begin().await.unwrap();
        tx.add_peer(record("laptop", KEY_B, 2), "laptop profile").await.unwrap();
        tx.commit();

        let mut tx = store.begin().await.unwrap();
        let removed = tx.remove_peer("laptop").await.unwrap();
        tx.commit();
        assert_eq!(removed.address, Ipv4Addr::new(10, 13, 13, 2));

        assert!(store.list_peers().await.unwrap().is_empty());
        assert!(!store.profile_path("laptop").exists());
        let archived: Vec<_> = std::fs::read_dir(dir.path().join("clients/archive"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(archived.len(), 1);
        assert!(archived[0].starts_with("laptop.conf."));
    }

    #[tokio::test]
    async fn remove_unknown_peer_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = fresh_store(dir.path()).await;

        let mut tx = store.begin().await.unwrap();
        let err = tx.remove_peer("ghost").await.unwrap_err();
        assert!(matches!(err, StoreError::PeerNotFound(ref n) if n == "ghost"));
    }

    #[tokio::test]
    async fn repeated_archive_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = fresh_store(dir.path()).await;

        for round in 0..3 {
            let mut tx = store.begin().await.unwrap();
            tx.add_peer(record("laptop", KEY_B, 2), &format!("round {round}"))
                .await
                .unwrap();
            tx.commit();
            let mut tx = store.begin().await.unwrap();
            tx.remove_peer("laptop").await.unwrap();
            tx.commit();
        }
        let count = std::fs::read_dir(dir.path().join("clients/archive")).unwrap().count();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn rollback_restores_config_and_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let store = fresh_store(dir.path()).await;

        let mut tx = store.begin().await.unwrap();
        tx.add_peer(record("laptop", KEY_B, 2), "laptop profile").await.unwrap();
        tx.commit();
        let before = tokio::fs::read_to_string(store.server_config_path()).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.remove_peer("laptop").await.unwrap();
        tx.add_peer(record("phone", KEY_C, 3), "phone profile").await.unwrap();
        tx.rollback().await.unwrap();

        let after = tokio::fs::read_to_string(store.server_config_path()).await.unwrap();
        assert_eq!(before, after);
        assert_eq!(store.read_profile("laptop").await.unwrap(), "laptop profile");
        assert!(matches!(
            store.read_profile("phone").await,
            Err(StoreError::MissingProfile { .. })
        ));
    }

    #[tokio::test]
    async fn failed_profile_restore_still_restores_config() {
        let dir = tempfile::tempdir().unwrap();
        let store = fresh_store(dir.path()).await;

        let mut tx = store.begin().await.unwrap();
        tx.add_peer(record("laptop", KEY_B, 2), "laptop profile").await.unwrap();
        tx.commit();
        let before = tokio::fs::read_to_string(store.server_config_path()).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.remove_peer("laptop").await.unwrap();
        tokio::fs::remove_dir_all(dir.path().join("clients/archive"))
            .await
            .unwrap();
        let err = tx.rollback().await.unwrap_err();
        assert!(matches!(err, StoreError::Io { op: "restore", .. }), "{err}");

        let after = tokio::fs::read_to_string(store.server_config_path()).await.unwrap();
        assert_eq!(before, after);
        assert_eq!(store.list_peers().await.unwrap(), vec![record("laptop", KEY_B, 2)]);
    }

    #[tokio::test]
    async fn list_waits_out_a_half_written_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = fresh_store(dir.path()).await;
        let mut tx = store.begin().await.unwrap();
        tx.add_peer(record("laptop", KEY_B, 2), "profile").await.unwrap();
        tx.commit();

        let path = store.server_config_path().to_path_buf();
        let good = tokio::fs::read_to_string(&path).await.unwrap();
        tokio::fs::write(&path, "").await.unwrap();
        let repair = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            tokio::fs::write(&path, good).await.unwrap();
        });

        let peers = store.list_peers().await.unwrap();
        assert_eq!(peers, vec![record("laptop", KEY_B, 2)]);
        repair.await.unwrap();
    }

    #[tokio::test]
    async fn list_gives_up_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        let store = fresh_store(dir.path()).await;
        tokio::fs::write(store.server_config_path(), "[Peer]\n").await.unwrap();

        let started = std::time::Instant::now();
        assert!(matches!(store.list_peers().await, Err(StoreError::Parse { .. })));
        // 20 + 40 + 80 + 160 ms of backoff between the five attempts
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Add(&'static str),
        Remove(&'static str),
    }

    #[test_case(&[Step::Add("a"), Step::Add("b"), Step::Add("c"), Step::Remove("b"), Step::Add("d")]; "remove from middle")]
    #[test_case(&[Step::Add("a"), Step::Remove("a"), Step::Add("a"), Step::Add("b")]; "re-add same name")]
    #[test_case(&[Step::Add("a"), Step::Add("b"), Step::Remove("a"), Step::Remove("b"), Step::Add("c")]; "drain then add")]
    #[test_case(&[Step::Add("a"), Step::Add("b"), Step::Add("c"), Step::Remove("c"), Step::Remove("a"), Step::Add("e"), Step::Add("f")]; "mixed")]
    #[tokio::test]
    async fn listing_tracks_every_step(steps: &[Step]) {
        let dir = tempfile::tempdir().unwrap();
        let store = fresh_store(dir.path()).await;
        let subnet = "10.13.13.0/24".parse().unwrap();
        let mut expected: Vec<String> = Vec::new();

        for (i, step) in steps.iter().enumerate() {
            let mut tx = store.begin().await.unwrap();
            match *step {
                Step::Add(name) => {
                    let address = crate::alloc::next_free_address(tx.config(), subnet).unwrap();
                    let key = crate::keys::generate_keypair().public.to_string();
                    tx.add_peer(
                        PeerRecord {
                            name: name.into(),
                            public_key: key,
                            address,
                            preshared_key: None,
                        },
                        "profile",
                    )
                    .await
                    .unwrap();
                    expected.push(name.to_string());
                }
                Step::Remove(name) => {
                    tx.remove_peer(name).await.unwrap();
                    expected.retain(|n| n != name);
                }
            }
            tx.commit();

            let listed: Vec<String> = store
                .list_peers()
                .await
                .unwrap()
                .into_iter()
                .map(|p| p.name)
                .collect();
            assert_eq!(listed, expected, "after step {i}: {step:?}");
        }
    }

    #[tokio::test]
    async fn second_writer_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let store = fresh_store(dir.path()).await;

        let _held = store.begin().await.unwrap();
        let err = store.begin().await.unwrap_err();
        assert!(matches!(err, StoreError::Lock(LockError::Timeout { .. })));
    }

    #[tokio::test]
    async fn readers_do_not_need_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store = fresh_store(dir.path()).await;

        let _held = store.begin().await.unwrap();
        assert!(store.list_peers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = fresh_store(dir.path()).await;
        let err = store.init("[Interface]\n").await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyInitialized(_)));
    }

    #[tokio::test]
    async fn missing_config_is_not_initialized() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(
            dir.path().join("wg0.conf"),
            dir.path().join("clients"),
            dir.path().join("archive"),
            Duration::from_millis(100),
        );
        assert!(matches!(
            store.list_peers().await,
            Err(StoreError::NotInitialized(_))
        ));
    }

    #[tokio::test]
    async fn corrupt_config_blocks_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let store = fresh_store(dir.path()).await;
        tokio::fs::write(store.server_config_path(), "[Interface]\nnonsense\n")
            .await
            .unwrap();

        assert!(matches!(store.begin().await, Err(StoreError::Parse { .. })));
        assert!(matches!(store.list_peers().await, Err(StoreError::Parse { .. })));
        let text = tokio::fs::read_to_string(store.server_config_path()).await.unwrap();
        assert_eq!(text, "[Interface]\nnonsense\n", "never auto-corrected");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn written_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = fresh_store(dir.path()).await;
        let mut tx = store.begin().await.unwrap();
        tx.add_peer(record("laptop", KEY_B, 2), "secret").await.unwrap();
        tx.commit();

        for path in [store.server_config_path().to_path_buf(), store.profile_path("laptop")] {
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600, "{}", path.display());
        }
    }
}
