//! SF-013: Snapshot persistence: load, save (atomic), path derivation.

use super::error::StateError;
use super::types::Snapshot;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Durable keyed store of stack snapshots.
pub trait StateStore: Send + Sync {
    /// Load the snapshot of `stack`. `None` if the stack was never applied.
    fn load(&self, stack: &str) -> Result<Option<Snapshot>, StateError>;

    /// Persist a snapshot, replacing any previous one for the same stack.
    fn save(&self, snapshot: &Snapshot) -> Result<(), StateError>;
}

/// Derive the snapshot path for a stack within the state directory.
pub fn state_file_path(state_dir: &Path, stack: &str) -> PathBuf {
    state_dir.join(stack).join("state.yaml")
}

/// Create an empty snapshot for a stack.
pub fn new_snapshot(stack: &str) -> Snapshot {
    Snapshot {
        schema: "1.0".to_string(),
        stack: stack.to_string(),
        generator: format!("stackform {}", env!("CARGO_PKG_VERSION")),
        resources: BTreeMap::new(),
        outputs: BTreeMap::new(),
    }
}

/// YAML files under a state directory, one per stack.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stacks that have a snapshot, sorted.
    pub fn stacks(&self) -> Result<Vec<String>, StateError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StateError::Io {
                    action: "read",
                    path: self.dir.clone(),
                    source,
                })
            }
        };
        let mut stacks: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().join("state.yaml").is_file())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        stacks.sort();
        Ok(stacks)
    }
}

impl StateStore for FileStateStore {
    fn load(&self, stack: &str) -> Result<Option<Snapshot>, StateError> {
        let path = state_file_path(&self.dir, stack);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StateError::Io {
                    action: "read",
                    path,
                    source,
                })
            }
        };
        let snapshot = serde_yaml_ng::from_str(&content)
            .map_err(|source| StateError::Parse { path, source })?;
        Ok(Some(snapshot))
    }

    /// Atomic write: temp file + rename, so a crash never leaves a torn file.
    fn save(&self, snapshot: &Snapshot) -> Result<(), StateError> {
        let path = state_file_path(&self.dir, &snapshot.stack);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StateError::Io {
                action: "create",
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let yaml = serde_yaml_ng::to_string(snapshot)?;

        let tmp_path = path.with_extension("yaml.tmp");
        std::fs::write(&tmp_path, &yaml).map_err(|source| StateError::Io {
            action: "write",
            path: tmp_path.clone(),
            source,
        })?;
        std::fs::rename(&tmp_path, &path).map_err(|source| StateError::Io {
            action: "rename",
            path: tmp_path,
            source,
        })
    }
}

/// In-process store for tests and previews.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    snapshots: Mutex<BTreeMap<String, Snapshot>>,
    saves: Mutex<usize>,
    fail_saves: Mutex<bool>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate with an existing snapshot.
    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        let store = Self::default();
        store
            .snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(snapshot.stack.clone(), snapshot);
        store
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every subsequent save fail.
    pub fn fail_saves(&self, fail: bool) {
        *self.fail_saves.lock().unwrap_or_else(|e| e.into_inner()) = fail;
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, stack: &str) -> Result<Option<Snapshot>, StateError> {
        Ok(self
            .snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(stack)
            .cloned())
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), StateError> {
        if *self.fail_saves.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(StateError::Unavailable("save disabled".to_string()));
        }
        self.snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(snapshot.stack.clone(), snapshot.clone());
        *self.saves.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }
}
