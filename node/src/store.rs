//! File-backed `StateStore`: a JSON document guarded by an advisory file
//! lock, atomically saved via temp-file-plus-rename-plus-fsync. `load`
//! takes a shared lock around a read, `update` takes an exclusive lock
//! around a read-modify-write.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use mpc_core::state::NodeState;
use mpc_core::traits::StateStore;
use mpc_core::{MpcError, Result};

pub struct FileStateStore {
    state_path: PathBuf,
    lock_path: PathBuf,
}

impl FileStateStore {
    /// Creates `state_dir` if absent and seeds `state.json` with a fresh
    /// `NodeState` for `node_id`/`index` if it does not already exist.
    /// Idempotent: reopening an existing state directory never clobbers it.
    pub fn open(state_dir: impl AsRef<Path>, node_id: &str, index: u32) -> Result<Self> {
        let state_dir = state_dir.as_ref();
        fs::create_dir_all(state_dir).map_err(|e| MpcError::StateError(e.to_string()))?;
        let state_path = state_dir.join("state.json");
        let lock_path = state_dir.join("state.lock");

        if !state_path.exists() {
            let fresh = NodeState::new(node_id.to_string(), index);
            write_atomic(&state_path, &fresh)?;
        }

        Ok(FileStateStore { state_path, lock_path })
    }

    fn lock_file(&self) -> Result<File> {
        File::options()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| MpcError::StateError(e.to_string()))
    }

    fn read_state(&self) -> Result<NodeState> {
        let data = fs::read(&self.state_path).map_err(|e| MpcError::StateError(e.to_string()))?;
        serde_json::from_slice(&data).map_err(|e| MpcError::StateError(e.to_string()))
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<NodeState> {
        let lock = self.lock_file()?;
        FileExt::lock_shared(&lock).map_err(|e| MpcError::StateError(e.to_string()))?;
        let result = self.read_state();
        let _ = FileExt::unlock(&lock);
        result
    }

    fn update(&self, f: &mut dyn FnMut(&mut NodeState) -> Result<()>) -> Result<()> {
        let lock = self.lock_file()?;
        FileExt::lock_exclusive(&lock).map_err(|e| MpcError::StateError(e.to_string()))?;
        let result = (|| {
            let mut state = self.read_state()?;
            f(&mut state)?;
            write_atomic(&self.state_path, &state)
        })();
        let _ = FileExt::unlock(&lock);
        result
    }
}

/// Write `value` to `path` via a sibling `.tmp` file, `fsync`, then
/// `rename` — so a crash mid-write never leaves a partially-written
/// `state.json` behind.
fn write_atomic(path: &Path, value: &NodeState) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| MpcError::StateError(e.to_string()))?;
    {
        let mut tmp = File::create(&tmp_path).map_err(|e| MpcError::StateError(e.to_string()))?;
        tmp.write_all(&bytes).map_err(|e| MpcError::StateError(e.to_string()))?;
        tmp.sync_all().map_err(|e| MpcError::StateError(e.to_string()))?;
    }
    fs::rename(&tmp_path, path).map_err(|e| MpcError::StateError(e.to_string()))
}
