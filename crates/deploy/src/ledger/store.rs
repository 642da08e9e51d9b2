//! Durable backing stores for the ledger.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use fs2::FileExt;

use super::LedgerSnapshot;
use crate::DeployError;

/// Where a [`Ledger`](super::Ledger) keeps its durable state.
///
/// `persist` must be all-or-nothing: after an error the previously persisted snapshot is
/// still the one `load` returns.
pub trait LedgerStore: Send + 'static {
    /// The last persisted snapshot, or `None` if nothing was ever persisted.
    fn load(&self) -> Result<Option<LedgerSnapshot>, DeployError>;

    fn persist(&mut self, snapshot: &LedgerSnapshot) -> Result<(), DeployError>;
}

/// JSON ledger file, replaced atomically on every write.
///
/// An exclusive lock on `<ledger>.lock` is held for the lifetime of the store, so two
/// processes can never write the same ledger.
#[derive(Debug)]
pub struct FileLedgerStore {
    path: PathBuf,
    _lock: File,
}

impl FileLedgerStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, DeployError> {
        let path = path.into();
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| DeployError::LedgerIo { path, source }
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }

        let lock_path = sibling(&path, "lock");
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(io_err(&lock_path))?;
        lock.try_lock_exclusive()
            .map_err(|_| DeployError::LedgerLocked(path.clone()))?;

        // A leftover temp file is a write that never reached the rename.
        let tmp = sibling(&path, "tmp");
        if tmp.exists() {
            tracing::warn!(path = %tmp.display(), "Discarding incomplete ledger write");
            fs::remove_file(&tmp).map_err(io_err(&tmp))?;
        }

        tracing::debug!(path = %path.display(), "Ledger file locked");
        Ok(Self { path, _lock: lock })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> DeployError {
        DeployError::LedgerIo {
            path: self.path.clone(),
            source,
        }
    }
}

impl LedgerStore for FileLedgerStore {
    fn load(&self) -> Result<Option<LedgerSnapshot>, DeployError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };

        let snapshot =
            serde_json::from_str(&content).map_err(|source| DeployError::LedgerCorrupt {
                path: self.path.clone(),
                source,
            })?;
        Ok(Some(snapshot))
    }

    fn persist(&mut self, snapshot: &LedgerSnapshot) -> Result<(), DeployError> {
        self.write(snapshot, sync_parent)
    }
}

impl FileLedgerStore {
    /// Write through a temp file and rename it over the ledger, then sync the directory.
    fn write(
        &self,
        snapshot: &LedgerSnapshot,
        sync_dir: fn(&Path) -> io::Result<()>,
    ) -> Result<(), DeployError> {
        let json = serde_json::to_vec_pretty(snapshot).map_err(|e| self.io_error(e.into()))?;

        let tmp = sibling(&self.path, "tmp");
        let write = || -> io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&json)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
            drop(file);

            fs::rename(&tmp, &self.path)
        };

        write().map_err(|e| {
            let _ = fs::remove_file(&tmp);
            self.io_error(e)
        })?;

        // The rename already made the new snapshot the one `load` returns.
        if let Err(e) = sync_dir(&self.path) {
            tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "Ledger directory could not be synced after the write"
            );
        }
        Ok(())
    }
}

/// `ledger.json` -> `ledger.json.<suffix>`
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(unix)]
fn sync_parent(path: &Path) -> io::Result<()> {
    match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => File::open(parent)?.sync_all(),
        None => File::open(".")?.sync_all(),
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[derive(Debug, Default)]
struct MemoryState {
    snapshot: Option<LedgerSnapshot>,
    fail: bool,
    persists: usize,
}

/// In-memory store. Clones share the same state, so a test can keep a handle to inspect
/// what was persisted or to make subsequent writes fail.
#[derive(Debug, Clone, Default)]
pub struct MemoryLedgerStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryLedgerStore {
    /// A store that already holds `snapshot`.
    pub fn with_snapshot(snapshot: LedgerSnapshot) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                snapshot: Some(snapshot),
                ..Default::default()
            })),
        }
    }

    /// Make every following `persist` fail until switched off.
    pub fn fail_persists(&self, fail: bool) {
        self.state_mut().fail = fail;
    }

    /// The last successfully persisted snapshot.
    pub fn contents(&self) -> Option<LedgerSnapshot> {
        self.state_mut().snapshot.clone()
    }

    pub fn persist_count(&self) -> usize {
        self.state_mut().persists
    }

    fn state_mut(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn load(&self) -> Result<Option<LedgerSnapshot>, DeployError> {
        Ok(self.contents())
    }

    fn persist(&mut self, snapshot: &LedgerSnapshot) -> Result<(), DeployError> {
        let mut state = self.state_mut();
        if state.fail {
            return Err(DeployError::LedgerIo {
                path: PathBuf::from("<memory>"),
                source: io::Error::other("persist disabled"),
            });
        }
        state.snapshot = Some(snapshot.clone());
        state.persists += 1;
        Ok(())
    }
}
