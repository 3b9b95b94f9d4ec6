//! Exclusive data-directory lock.
//!
//! One engine process per data directory: the lock file holds the owning
//! process id for debugging, and the OS-level lock releases automatically
//! when the process exits.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    pub fn lock<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(crate::error::write_err)?;

        Self::try_lock(&file).map_err(|e| {
            Error::StartupFailure(format!(
                "data directory {} is locked by another process: {e}",
                path.display()
            ))
        })?;

        writeln!(file, "{}", std::process::id()).map_err(crate::error::write_err)?;
        file.flush().map_err(crate::error::write_err)?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> std::io::Result<()> {
        use std::os::unix::io::AsRawFd;

        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> std::io::Result<()> {
        // Best effort on platforms without flock; the pid in the file is
        // the only witness.
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // The OS releases the lock when the file closes. The lock file
        // itself stays to avoid races with a concurrent opener.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testdir::TempDir;

    #[test]
    fn test_lock_and_contend() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tephra.lock");

        let lock = FileLock::lock(&path).expect("first lock succeeds");
        assert_eq!(lock.path(), path.as_path());
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains(&std::process::id().to_string()));

        assert!(
            matches!(FileLock::lock(&path), Err(Error::StartupFailure(_))),
            "second lock on the same file must fail"
        );
    }

    #[test]
    fn test_relock_after_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tephra.lock");
        {
            let _lock = FileLock::lock(&path).unwrap();
        }
        FileLock::lock(&path).expect("lock reacquirable after drop");
    }
}
