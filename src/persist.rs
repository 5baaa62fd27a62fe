//! The durable-state contract: a byte-array sink/source the core writes its
//! persistent triple (currentTerm, votedFor, log) through, plus the
//! encoding used to turn that triple into bytes.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::message::LogEntry;
use crate::PeerId;

/// The persistent-storage driver. An external collaborator of the
/// consensus core rather than part of the algorithm itself, but every peer
/// needs one, so this crate provides a filesystem-backed default
/// ([`FileSystemPersister`]) alongside the trait.
pub trait Persister: Send + Sync {
    /// Durably write `bytes`, replacing whatever was previously saved.
    fn save(&self, bytes: &[u8]) -> Result<()>;

    /// Read back the most recently saved bytes, or an empty vec if nothing
    /// has ever been saved.
    fn load(&self) -> Result<Vec<u8>>;
}

/// The decoded form of the bytes a [`Persister`] holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: u64,
    pub voted_for: Option<PeerId>,
    pub log: Vec<LogEntry>,
}

impl Default for PersistentState {
    fn default() -> Self {
        PersistentState {
            current_term: 0,
            voted_for: None,
            log: vec![LogEntry::sentinel()],
        }
    }
}

impl PersistentState {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).context("encoding persistent raft state")
    }

    /// Decode previously saved bytes. A zero-length blob (nothing ever
    /// saved, or a fresh [`Persister`]) yields the default initial state
    /// rather than an error.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(PersistentState::default());
        }
        bincode::deserialize(bytes).context("decoding persistent raft state")
    }
}

/// A marker produced only by successfully persisting a mutation.
///
/// Borrowed from the `MustPersistMetadata` idiom in a sibling Raft
/// implementation: it carries no data of its own, it exists so that an RPC
/// handler cannot construct a reply that depends on a persisted mutation
/// without having actually called the save path first — see
/// [`crate::peer::RaftPeer::persist_state`], the only producer.
pub struct Persisted(());

impl Persisted {
    pub(crate) fn new() -> Self {
        Persisted(())
    }
}

/// A [`Persister`] backed by a single file, written via a temp-file-then-
/// rename so a crash mid-write never leaves a half-written blob to be
/// loaded on restart.
pub struct FileSystemPersister {
    path: std::path::PathBuf,
}

impl FileSystemPersister {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        FileSystemPersister { path: path.into() }
    }
}

impl Persister for FileSystemPersister {
    fn save(&self, bytes: &[u8]) -> Result<()> {
        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, bytes)
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("renaming {} into place", self.path.display()))?;
        Ok(())
    }

    fn load(&self) -> Result<Vec<u8>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e).with_context(|| format!("reading {}", self.path.display())),
        }
    }
}

/// A [`Persister`] that keeps its blob in memory. Used by tests and by
/// anything that wants a peer without a filesystem footprint.
#[derive(Default)]
pub struct MemoryPersister {
    inner: std::sync::Mutex<Vec<u8>>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        MemoryPersister::default()
    }
}

impl Persister for MemoryPersister {
    fn save(&self, bytes: &[u8]) -> Result<()> {
        *self.inner.lock().unwrap() = bytes.to_vec();
        Ok(())
    }

    fn load(&self) -> Result<Vec<u8>> {
        Ok(self.inner.lock().unwrap().clone())
    }
}
