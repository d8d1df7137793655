use crate::CoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;

/// Exclusive advisory lock on a stack directory, released on drop.
pub struct StackLock {
    lock_file: File,
}

impl StackLock {
    fn open(lock_path: &Path) -> Result<File, CoreError> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)?)
    }

    /// Block until the lock is free.
    pub fn acquire(lock_path: &Path) -> Result<Self, CoreError> {
        let file = Self::open(lock_path)?;
        file.lock_exclusive()
            .map_err(|e| CoreError::Io(std::io::Error::new(std::io::ErrorKind::WouldBlock, e)))?;
        Ok(Self { lock_file: file })
    }

    pub fn try_acquire(lock_path: &Path) -> Result<Option<Self>, CoreError> {
        let file = Self::open(lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { lock_file: file })),
            Err(_) => Ok(None),
        }
    }

    /// Take the lock or fail fast with `CoreError::Locked`.
    pub fn acquire_or_fail(lock_path: &Path) -> Result<Self, CoreError> {
        Self::try_acquire(lock_path)?.ok_or_else(|| CoreError::Locked(lock_path.to_path_buf()))
    }
}

impl Drop for StackLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join(".stackup/lock");

        {
            let _lock = StackLock::acquire(&lock_path).unwrap();
            assert!(lock_path.exists());
        }
    }

    #[test]
    fn second_run_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("lock");

        let _lock = StackLock::acquire(&lock_path).unwrap();
        assert!(StackLock::try_acquire(&lock_path).unwrap().is_none());
        assert!(matches!(
            StackLock::acquire_or_fail(&lock_path),
            Err(CoreError::Locked(_))
        ));
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("lock");

        {
            let _lock = StackLock::acquire(&lock_path).unwrap();
        }

        assert!(StackLock::try_acquire(&lock_path).unwrap().is_some());
    }
}
