//! Machine-wide lock serialising port selection and provisioning

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::retry::{Attempt, RetryPolicy};

/// Exclusive `flock` on a shared file, released on drop or [`LockGuard::release`]
pub struct LockGuard {
    lock: Option<Flock<File>>,
    path: PathBuf,
}

impl LockGuard {
    /// Poll for the lock until acquired or `policy` is exhausted
    pub async fn acquire(path: &Path, policy: RetryPolicy) -> Result<Self> {
        let guard = policy
            .run("cross-process lock", move |_| async move {
                match try_lock(path)? {
                    Some(lock) => Ok(Attempt::Ready(lock)),
                    None => Ok(Attempt::Retry(format!("{} is held", path.display()))),
                }
            })
            .await?;

        debug!(path = %path.display(), "acquired lock");
        Ok(Self {
            lock: Some(guard),
            path: path.to_path_buf(),
        })
    }

    /// Release the lock now instead of at drop
    pub fn release(mut self) -> Result<()> {
        self.unlock()
    }

    fn unlock(&mut self) -> Result<()> {
        let Some(lock) = self.lock.take() else {
            return Ok(());
        };
        match lock.unlock() {
            Ok(_file) => {
                debug!(path = %self.path.display(), "released lock");
                Ok(())
            }
            Err((_lock, errno)) => Err(Error::Io(std::io::Error::from(errno))),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.unlock() {
            warn!(path = %self.path.display(), "failed to release lock: {}", e);
        }
    }
}

/// Non-blocking exclusive lock attempt; `None` while another process holds it
fn try_lock(path: &Path) -> Result<Option<Flock<File>>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)?;

    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => Ok(Some(lock)),
        Err((_file, Errno::EWOULDBLOCK)) => Ok(None),
        Err((_file, errno)) => Err(Error::Io(std::io::Error::from(errno))),
    }
}
