//! State snapshot storage.
//!
//! The [`StateStore`] trait abstracts where a node's [`PaxosState`] lives.
//! The engine calls [`StateStore::save`] after every mutation that a later
//! outgoing message depends on, and [`StateStore::load`] once on restart.
//!
//! Two implementations are provided:
//!
//! - [`InMemoryStateStore`]: a cloneable handle onto a shared slot. Clones
//!   see the same snapshot, so a test can "crash" an engine by dropping it
//!   and restart a new one on the same store.
//! - [`FileStateStore`]: one file per node holding a single line, truncated
//!   and rewritten on every save, then synced to disk.
//!
//! A crash in the middle of a file write can leave a truncated line behind.
//! Loading such a file fails with [`PaxosError::Codec`] instead of returning
//! partial state.

use std::cell::{Cell, RefCell};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::codec::WireFormat;
use crate::state::PaxosState;
use crate::types::{NodeId, PaxosError};

/// Trait for durable snapshot storage.
///
/// `save` must not return before the snapshot is durable: the engine sends
/// messages justified by the saved state right after it returns.
pub trait StateStore {
    /// Load the last saved snapshot, or `None` if nothing was ever saved.
    fn load(&self) -> Result<Option<PaxosState>, PaxosError>;

    /// Replace the stored snapshot.
    fn save(&mut self, state: &PaxosState) -> Result<(), PaxosError>;
}

/// In-memory snapshot slot, shared between clones.
///
/// Snapshots are held in encoded form so that a load goes through the same
/// decoder as a file-backed load.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStateStore {
    snapshot: Rc<RefCell<Option<String>>>,
    saves: Rc<Cell<u64>>,
}

impl InMemoryStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds `state`.
    pub fn with_snapshot(state: &PaxosState) -> Self {
        let store = Self::new();
        *store.snapshot.borrow_mut() = Some(state.encode());
        store
    }

    /// Number of successful saves through any clone.
    pub fn save_count(&self) -> u64 {
        self.saves.get()
    }

    /// The raw encoded snapshot, if any.
    pub fn raw(&self) -> Option<String> {
        self.snapshot.borrow().clone()
    }
}

impl StateStore for InMemoryStateStore {
    fn load(&self) -> Result<Option<PaxosState>, PaxosError> {
        match self.snapshot.borrow().as_deref() {
            None => Ok(None),
            Some(line) => Ok(Some(PaxosState::decode(line)?)),
        }
    }

    fn save(&mut self, state: &PaxosState) -> Result<(), PaxosError> {
        *self.snapshot.borrow_mut() = Some(state.encode());
        self.saves.set(self.saves.get() + 1);
        Ok(())
    }
}

/// File-backed snapshot storage, one file per node.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    /// Default directory for state files.
    pub const DEFAULT_DIR: &'static str = "states";

    /// Store snapshots at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store snapshots at `dir/node_{id}.state`.
    pub fn for_node(dir: impl AsRef<Path>, id: NodeId) -> Self {
        Self::new(dir.as_ref().join(format!("node_{}.state", id.index())))
    }

    /// The backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<Option<PaxosState>, PaxosError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let line = text.lines().next().unwrap_or_default();
        let state = PaxosState::decode(line)?;
        tracing::debug!(path = %self.path.display(), "loaded state snapshot");
        Ok(Some(state))
    }

    fn save(&mut self, state: &PaxosState) -> Result<(), PaxosError> {
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)?;
        }
        let mut file = File::create(&self.path)?;
        let mut line = state.encode();
        line.push('\n');
        file.write_all(line.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }
}
