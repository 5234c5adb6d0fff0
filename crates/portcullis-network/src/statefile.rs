//! Host-wide JSON state files.
//!
//! Several portcullis processes may provision containers at once, so every
//! read-modify-write of shared state happens under an exclusive `flock` on
//! the state file itself. Waiting on that lock blocks the calling thread, so
//! async callers go through [`blocking`].

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use portcullis_common::{PortcullisError, PortcullisResult};
use rustix::fs::{FlockOperation, flock};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// An exclusively locked state file.
///
/// The lock is held until the value is dropped.
#[derive(Debug)]
pub struct LockedFile {
    file: File,
    path: PathBuf,
}

impl LockedFile {
    /// Open (creating if needed) and lock a state file.
    ///
    /// Blocks until any other holder releases the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or locked.
    pub fn open(path: impl AsRef<Path>) -> PortcullisResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        flock(&file, FlockOperation::LockExclusive).map_err(std::io::Error::from)?;

        tracing::trace!(path = %path.display(), "Locked state file");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Decode the file contents; an empty file decodes to `T::default()`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or holds invalid JSON.
    pub fn load<T: DeserializeOwned + Default>(&mut self) -> PortcullisResult<T> {
        let mut content = String::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_string(&mut content)?;

        if content.trim().is_empty() {
            return Ok(T::default());
        }
        Ok(serde_json::from_str(&content)?)
    }

    /// Replace the file contents with `value`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn store<T: Serialize>(&mut self, value: &T) -> PortcullisResult<()> {
        let json = serde_json::to_vec_pretty(value)?;
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&json)?;
        self.file.sync_all()?;

        tracing::trace!(path = %self.path.display(), "Stored state file");
        Ok(())
    }
}

/// Run state file work on the blocking thread pool.
///
/// # Errors
///
/// Returns `work`'s error, or an I/O error if the task panicked.
pub async fn blocking<T, F>(work: F) -> PortcullisResult<T>
where
    F: FnOnce() -> PortcullisResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await.map_err(|e| {
        PortcullisError::Io(std::io::Error::other(format!(
            "state file task failed: {e}"
        )))
    })?
}
