//! Saved replication state.
//!
//! One small JSON file in the base directory records the node's replication
//! identity, the seqno it is known to be consistent at, and whether it is
//! safe to bootstrap a new cluster from it. The seqno is only defined while
//! the provider is cleanly stopped or paused; during normal operation the
//! file holds the undefined sentinel so a crash is distinguishable from a
//! clean shutdown.
//!
//! Writes go through a temp file and rename so a crash mid-update leaves
//! the previous state intact. Once marked corrupt the file stays corrupt
//! until an operator (or a state transfer) replaces it.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use syncrep_error::{Error, Result};
use syncrep_types::{NodeId, Seqno};

/// On-disk file name inside the base directory.
pub const STATE_FILE_NAME: &str = "grastate.json";

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
struct SavedState {
    uuid: NodeId,
    seqno: Seqno,
    safe_to_bootstrap: bool,
    #[serde(default)]
    corrupt: bool,
}

impl Default for SavedState {
    fn default() -> Self {
        Self {
            uuid: NodeId::UNDEFINED,
            seqno: Seqno::UNDEFINED,
            safe_to_bootstrap: true,
            corrupt: false,
        }
    }
}

/// Handle to the saved-state file.
#[derive(Debug)]
pub struct StateFile {
    path: PathBuf,
    current: Mutex<SavedState>,
    /// Depth of nested unsafe sections (total-order isolated actions).
    unsafe_depth: Mutex<u32>,
}

impl StateFile {
    /// Open (or create) the state file under `base_dir`.
    pub fn open(base_dir: &Path) -> Result<Self> {
        let path = base_dir.join(STATE_FILE_NAME);
        let state = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                tracing::warn!(path = %path.display(), %err, "unreadable state file, starting fresh");
                SavedState::default()
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => SavedState::default(),
            Err(err) => {
                return Err(Error::StateFile { path, source: err });
            }
        };
        tracing::info!(
            uuid = %state.uuid,
            seqno = %state.seqno,
            safe_to_bootstrap = state.safe_to_bootstrap,
            "saved state loaded"
        );
        Ok(Self {
            path,
            current: Mutex::new(state),
            unsafe_depth: Mutex::new(0),
        })
    }

    /// The recovered (uuid, seqno, safe_to_bootstrap) triple.
    #[must_use]
    pub fn get(&self) -> (NodeId, Seqno, bool) {
        let state = self.current.lock();
        (state.uuid, state.seqno, state.safe_to_bootstrap)
    }

    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        self.current.lock().corrupt
    }

    /// Record a confirmed state. No-op once the file is marked corrupt.
    pub fn set(&self, uuid: NodeId, seqno: Seqno, safe_to_bootstrap: bool) -> Result<()> {
        let mut state = self.current.lock();
        if state.corrupt {
            return Ok(());
        }
        state.uuid = uuid;
        state.seqno = seqno;
        state.safe_to_bootstrap = safe_to_bootstrap;
        self.write(&state)
    }

    /// Enter an unsafe section: the stored seqno becomes undefined until the
    /// matching [`StateFile::mark_safe`].
    pub fn mark_unsafe(&self) -> Result<()> {
        let mut depth = self.unsafe_depth.lock();
        *depth += 1;
        if *depth == 1 {
            let mut state = self.current.lock();
            if state.corrupt {
                return Ok(());
            }
            state.seqno = Seqno::UNDEFINED;
            self.write(&state)?;
        }
        Ok(())
    }

    /// Leave an unsafe section.
    pub fn mark_safe(&self) -> Result<()> {
        let mut depth = self.unsafe_depth.lock();
        debug_assert!(*depth > 0, "mark_safe without matching mark_unsafe");
        *depth = depth.saturating_sub(1);
        Ok(())
    }

    /// Mark the on-disk state corrupt. Sticky: later `set` calls are ignored.
    pub fn mark_corrupt(&self) {
        let mut state = self.current.lock();
        if state.corrupt {
            return;
        }
        state.corrupt = true;
        state.seqno = Seqno::UNDEFINED;
        tracing::error!(path = %self.path.display(), "marking saved state corrupt");
        if let Err(err) = self.write(&state) {
            // The node is going down anyway; the failed marker is logged so
            // the operator knows not to trust this state.
            tracing::error!(%err, "failed to persist corruption marker");
        }
    }

    fn write(&self, state: &SavedState) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        let render = |err| Error::StateFile {
            path: self.path.clone(),
            source: err,
        };
        let bytes = serde_json::to_vec_pretty(state).expect("saved state serializes");
        fs::write(&tmp, bytes).map_err(render)?;
        fs::rename(&tmp, &self.path).map_err(render)?;
        Ok(())
    }
}
