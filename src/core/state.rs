//! On-disk persistence for the staging session and undo log.
//!
//! Layout under the project root:
//!
//! ```text
//! .patchwright/
//!   session.json   StagingSession (overlay + checkpoints)
//!   undo.json      UndoLog
//!   state.lock     held for one load-modify-save cycle
//! ```

use anyhow::{Context, Result};
use serde::{Serialize, de::DeserializeOwned};
use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

use crate::{
    core::{session::StagingSession, undo::UndoLog},
    infra::{io::write_atomic, paths::STATE_DIR},
};

const SESSION_FILE: &str = "session.json";
const UNDO_FILE: &str = "undo.json";
const LOCK_FILE: &str = "state.lock";

/// Locks older than this are treated as left behind by a crashed run.
const STALE_LOCK_SECS: u64 = 60;

/// Handle on `<root>/.patchwright`.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(root: &Path) -> Self {
        Self {
            dir: root.join(STATE_DIR),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the state directory if needed.
    pub fn ensure_dir(&self) -> Result<()> {
        if self.dir.is_dir() {
            return Ok(());
        }
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create state dir: {}", self.dir.display()))?;
        if let Some(parent) = self.dir.parent() {
            sync_dir(parent).ok();
        }
        debug!(dir = %self.dir.display(), "state dir created");
        Ok(())
    }

    /// Take the exclusive state lock; released when the guard drops.
    pub fn lock(&self) -> Result<StateLock> {
        self.ensure_dir()?;
        acquire_lock(&self.dir.join(LOCK_FILE))
    }

    /// Persisted session; a file naming a path outside the project is
    /// rejected like a corrupt one.
    pub fn load_session(&self) -> Result<StagingSession> {
        let session: StagingSession = self.load(SESSION_FILE)?.unwrap_or_default();
        session
            .validate_paths()
            .with_context(|| self.tampered(SESSION_FILE))?;
        Ok(session)
    }

    pub fn save_session(&self, session: &StagingSession) -> Result<()> {
        self.save(SESSION_FILE, session)
    }

    pub fn load_undo(&self) -> Result<UndoLog> {
        let undo: UndoLog = self.load(UNDO_FILE)?.unwrap_or_default();
        undo.validate_paths()
            .with_context(|| self.tampered(UNDO_FILE))?;
        Ok(undo)
    }

    fn tampered(&self, name: &str) -> String {
        format!(
            "{} names a path outside the project (delete it to start fresh)",
            self.dir.join(name).display()
        )
    }

    pub fn save_undo(&self, undo: &UndoLog) -> Result<()> {
        self.save(UNDO_FILE, undo)
    }

    /// Missing file → `None`; unreadable or corrupt file → error.
    fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.dir.join(name);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("read {}", path.display())));
            }
        };
        let value = serde_json::from_str(&raw)
            .with_context(|| format!("parse {} (delete it to start fresh)", path.display()))?;
        Ok(Some(value))
    }

    fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        self.ensure_dir()?;
        let path = self.dir.join(name);
        let json = serde_json::to_vec_pretty(value).context("serialize state")?;
        write_atomic(&path, &json).with_context(|| format!("write {}", path.display()))
    }
}

/// Held state lock; removes the lock file on drop.
#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
    file: File,
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = self.file.sync_all();
        let _ = fs::remove_file(&self.path);
    }
}

fn create_lock(lock_path: &Path) -> std::io::Result<StateLock> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)?;
    writeln!(file, "pid={}", std::process::id()).ok();
    file.sync_all().ok();
    Ok(StateLock {
        path: lock_path.to_path_buf(),
        file,
    })
}

fn acquire_lock(lock_path: &Path) -> Result<StateLock> {
    match create_lock(lock_path) {
        Ok(lock) => Ok(lock),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            if let Ok(meta) = fs::metadata(lock_path)
                && let Ok(modified) = meta.modified()
                && let Ok(elapsed) = modified.elapsed()
                && elapsed.as_secs() > STALE_LOCK_SECS
            {
                warn!(lock = %lock_path.display(), "removing stale state lock");
                if fs::remove_file(lock_path).is_ok() {
                    return create_lock(lock_path).with_context(|| {
                        format!("acquire lock after stale cleanup: {}", lock_path.display())
                    });
                }
            }
            Err(anyhow::Error::new(e).context(format!(
                "another pwr process holds {}",
                lock_path.display()
            )))
        }
        Err(e) => {
            Err(anyhow::Error::new(e).context(format!("acquire lock: {}", lock_path.display())))
        }
    }
}

#[cfg(unix)]
fn sync_dir(p: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let f = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECTORY)
        .open(p)?;
    f.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_p: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::workspace::MemoryWorkspace;
    use tempfile::TempDir;

    #[test]
    fn missing_state_loads_empty() -> Result<()> {
        let tmp = TempDir::new()?;
        let store = StateStore::new(tmp.path());
        assert!(store.load_session()?.is_empty());
        assert!(store.load_undo()?.is_empty());
        assert!(!store.dir().exists());
        Ok(())
    }

    #[test]
    fn session_round_trips_with_checkpoints() -> Result<()> {
        let tmp = TempDir::new()?;
        let store = StateStore::new(tmp.path());
        let ws = MemoryWorkspace::with_files([("a.txt", "old")]);

        let mut session = StagingSession::new();
        session.begin_step("first");
        session.stage_write(&ws, "a.txt", "new")?;
        session.stage_delete(&ws, "b.txt")?;
        store.save_session(&session)?;

        let loaded = store.load_session()?;
        assert_eq!(loaded.step(), 1);
        assert_eq!(loaded.list_staged(), session.list_staged());
        assert_eq!(loaded.checkpoints().count(), 1);
        Ok(())
    }

    #[test]
    fn corrupt_state_is_an_error() -> Result<()> {
        let tmp = TempDir::new()?;
        let store = StateStore::new(tmp.path());
        store.ensure_dir()?;
        fs::write(store.dir().join(UNDO_FILE), "{not json")?;

        let err = store.load_undo().unwrap_err();
        assert!(format!("{err:#}").contains("undo.json"));
        Ok(())
    }

    #[test]
    fn escaping_paths_in_state_files_are_rejected() -> Result<()> {
        let tmp = TempDir::new()?;
        let store = StateStore::new(tmp.path());
        let ws = MemoryWorkspace::new();

        let mut session = StagingSession::new();
        session.stage_write(&ws, "evil.txt", "x")?;
        store.save_session(&session)?;
        let path = store.dir().join(SESSION_FILE);
        let raw = fs::read_to_string(&path)?.replace("evil.txt", "../evil.txt");
        fs::write(&path, raw)?;

        let err = store.load_session().unwrap_err();
        assert!(format!("{err:#}").contains("outside the project"));

        fs::write(
            store.dir().join(UNDO_FILE),
            r#"{"batches":[{"id":"x","timestamp":"2024-01-01T00:00:00Z","label":"l",
               "ops":[{"path":"/etc/passwd","prior_exists":true,"prior_content":""}]}],"cap":20}"#,
        )?;
        assert!(store.load_undo().is_err());
        Ok(())
    }

    #[test]
    fn lock_is_exclusive_and_released_on_drop() -> Result<()> {
        let tmp = TempDir::new()?;
        let store = StateStore::new(tmp.path());

        let guard = store.lock()?;
        assert!(store.lock().is_err());
        drop(guard);
        assert!(!store.dir().join(LOCK_FILE).exists());
        let _again = store.lock()?;
        Ok(())
    }
}
