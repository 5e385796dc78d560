//! Lock files shared by every process that opens a data directory.
//!
//! A lock is a file created with `create_new`, so exactly one holder owns it
//! at a time. The first line names the holder. A lock file whose mtime is
//! older than the stale limit is presumed left behind by a crashed process
//! and is taken over.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::trait_::{Result, StorageError};

const RETRY: Duration = Duration::from_millis(5);

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(0);

/// A held lock file, removed on drop.
#[derive(Debug)]
pub(crate) struct FileLock {
    path: PathBuf,
    token: String,
}

impl FileLock {
    /// Take the lock at `path`, polling until `wait` runs out.
    pub(crate) async fn acquire(path: PathBuf, stale_after: Duration, wait: Duration) -> Result<Self> {
        let token = format!(
            "{}:{}:{}",
            std::process::id(),
            NEXT_TOKEN.fetch_add(1, Ordering::Relaxed),
            chrono::Utc::now().timestamp_millis()
        );
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            match try_create(&path, &token).await {
                Ok(()) => return Ok(Self { path, token }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            if is_stale(&path, stale_after).await? {
                warn!("Taking over stale lock {}", path.display());
                match fs::remove_file(&path).await {
                    Ok(()) => continue,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(StorageError::Busy(format!(
                    "{} is held by another writer",
                    path.display()
                )));
            }
            tokio::time::sleep(RETRY).await;
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        match std::fs::read_to_string(&self.path) {
            Ok(content) if content.lines().next() == Some(self.token.as_str()) => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    warn!("Failed to release lock {}: {}", self.path.display(), e);
                }
            }
            Ok(_) => warn!("Lock {} was taken over before release", self.path.display()),
            Err(e) => debug!("Lock {} already gone: {}", self.path.display(), e),
        }
    }
}

async fn try_create(path: &Path, token: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path).await?;
    file.write_all(format!("{}\n", token).as_bytes()).await?;
    file.flush().await
}

/// Missing files are not stale; the next create attempt decides.
async fn is_stale(path: &Path, stale_after: Duration) -> Result<bool> {
    let modified = match fs::metadata(path).await {
        Ok(meta) => meta.modified()?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    Ok(SystemTime::now()
        .duration_since(modified)
        .is_ok_and(|age| age >= stale_after))
}
