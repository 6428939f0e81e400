use fs2::FileExt;
use std::{
    ffi::OsString,
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use todo_projector_events::StoreError;

const RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// `<index>.lock` next to the index file.
pub fn lock_path_for(index: &Path) -> PathBuf {
    let mut name = OsString::from(index.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

/// Exclusive advisory lock on an index's lock file.
///
/// Released on [`release`](Self::release) or on drop, whichever comes first.
#[derive(Debug)]
pub struct IndexLock {
    file: File,
    path: PathBuf,
}

impl IndexLock {
    /// Retry until the lock is free or `timeout` elapses.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let start = Instant::now();
        loop {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(path)?;

            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Err(err) if err.kind() != io::ErrorKind::WouldBlock && !is_contended(&err) => {
                    return Err(StoreError::Io(err));
                }
                Err(_) => {}
            }

            if start.elapsed() >= timeout {
                return Err(StoreError::LockContention {
                    path: path.to_path_buf(),
                    waited: start.elapsed(),
                });
            }

            thread::sleep(RETRY_INTERVAL);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(self) {
        drop(self);
    }
}

/// `fs2` reports contention with the platform's own error code.
fn is_contended(err: &io::Error) -> bool {
    err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
