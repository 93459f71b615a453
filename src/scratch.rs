//! Scratch file naming and cleanup.
//!
//! Every file an execution creates in the scratch directory is held by a
//! [`ScratchFile`], which removes the file when dropped. Removal happens at
//! most once and a file that is already gone is not an error.

use std::{
    fs, io,
    path::{Path, PathBuf},
    process,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Returns a stem that no other execution will be handed, including ones
/// started in the same millisecond or by another process sharing the
/// scratch directory.
pub fn unique_stem(prefix: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);

    format!("{}_{}_{}_{}", prefix, millis, process::id(), seq)
}

#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
    removed: bool,
}

impl ScratchFile {
    /// Takes ownership of `path`. The file does not have to exist yet.
    pub fn new(path: PathBuf) -> Self {
        ScratchFile {
            path,
            removed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the file now rather than on drop.
    pub fn remove(mut self) -> io::Result<()> {
        self.remove_once()
    }

    fn remove_once(&mut self) -> io::Result<()> {
        if self.removed {
            return Ok(());
        }
        self.removed = true;

        match fs::remove_file(&self.path) {
            Ok(()) => {
                log::debug!("Removed scratch file {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if let Err(e) = self.remove_once() {
            log::warn!(
                "Unable to remove scratch file {}: {}",
                self.path.display(),
                e
            );
        }
    }
}
