// ============================================================================
// SECTION 8: PID FILE LOCKS
// ============================================================================
// An exclusive advisory lock on a pid file marks a live process. The file
// content is the holder's decimal pid. The watchdog probes the agent's pid
// file at startup: a held lock means a live child to take over.
// ============================================================================

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{SupervisorError, SupervisorResult};

/// A held pid-file lock; released and removed on drop.
#[derive(Debug)]
pub struct PidLock {
    file: Option<File>,
    path: PathBuf,
}

/// Result of probing a pid file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockProbe {
    /// Nobody holds the lock
    Free,
    /// Another process holds the lock
    Held,
}

impl PidLock {
    /// Create the pid file if needed, take the lock and record our pid.
    pub fn acquire(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::acquire_with_pid(path, std::process::id())
    }

    /// As [`PidLock::acquire`] but recording an arbitrary pid.
    pub fn acquire_with_pid(path: impl AsRef<Path>, pid: u32) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.try_lock_exclusive()?;

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{}", pid)?;
        file.sync_all()?;

        Ok(Self {
            file: Some(file),
            path,
        })
    }

    /// Probe whether another process holds the lock on `path`.
    pub fn probe(path: impl AsRef<Path>) -> io::Result<LockProbe> {
        let path = path.as_ref();
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LockProbe::Free),
            Err(e) => return Err(e),
        };
        match file.try_lock_exclusive() {
            Ok(()) => {
                file.unlock()?;
                Ok(LockProbe::Free)
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(LockProbe::Held),
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unlock and remove the pid file.
    pub fn release(mut self) -> io::Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> io::Result<()> {
        if let Some(file) = self.file.take() {
            file.unlock()?;
            drop(file);
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let _ = self.release_inner();
    }
}

/// Read the decimal pid recorded in `path`.
pub fn read_pid(path: impl AsRef<Path>) -> SupervisorResult<u32> {
    let path = path.as_ref();
    let mut content = String::new();
    File::open(path)
        .and_then(|mut f| f.read_to_string(&mut content))
        .map_err(|e| SupervisorError::LoadChild {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    content
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|pid| *pid > 0)
        .ok_or_else(|| SupervisorError::LoadChild {
            path: path.to_path_buf(),
            message: format!("invalid pid content {:?}", content.trim()),
        })
}
