//! Advisory, time-boxed lock over a descriptor's staging area.
//!
//! Each holder writes a unique token into the lock file. Only the holder
//! whose token is still in the file may renew or release it, so a holder
//! whose lock was reclaimed as abandoned cannot disturb its successor.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::errors::DependencyError;

/// Log target for lock handling.
pub(crate) const LOCK_TARGET: &str = "warden_runtime::lock";

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Exclusive hold on `staging.lock`; released on drop.
#[derive(Debug)]
pub struct StagingLock {
    path: PathBuf,
    token: String,
}

impl StagingLock {
    /// Takes the lock at `path`.
    ///
    /// A lock file older than `grace` is treated as abandoned and
    /// reclaimed.
    ///
    /// # Errors
    ///
    /// Returns [`DependencyError::LockContention`] when a live holder owns
    /// the lock, or [`DependencyError::Io`] when the file cannot be created.
    pub fn acquire(path: &Path, grace: Duration) -> Result<Self, DependencyError> {
        match create(path) {
            Ok(lock) => Ok(lock),
            Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
                let holder = read_holder(path);
                if !is_stale(path, grace) {
                    return Err(contention(path));
                }
                warn!(
                    target: LOCK_TARGET,
                    file = %path.display(),
                    holder = %holder,
                    "reclaiming abandoned staging lock"
                );
                set_aside(path, &holder)?;
                create(path).map_err(|error| {
                    if error.kind() == io::ErrorKind::AlreadyExists {
                        contention(path)
                    } else {
                        DependencyError::io("create lock", path, error)
                    }
                })
            }
            Err(error) => Err(DependencyError::io("create lock", path, error)),
        }
    }

    /// Retries [`Self::acquire`] up to `attempts` times, doubling the delay
    /// from `base_delay` between tries.
    ///
    /// # Errors
    ///
    /// Returns the last contention error once the attempts are spent, or
    /// any non-contention error immediately.
    pub fn acquire_with_backoff(
        path: &Path,
        grace: Duration,
        attempts: u32,
        base_delay: Duration,
    ) -> Result<Self, DependencyError> {
        let mut delay = base_delay;
        let mut attempt = 1;
        loop {
            match Self::acquire(path, grace) {
                Err(error) if error.is_contention() && attempt < attempts => {
                    debug!(
                        target: LOCK_TARGET,
                        attempt,
                        delay = ?delay,
                        "staging lock busy, retrying"
                    );
                    thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }

    /// Lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the lock file still carries this holder's token.
    #[must_use]
    pub fn is_held(&self) -> bool {
        read_holder(&self.path) == self.token
    }

    /// Moves the lock's modification time forward so long transfers are
    /// not mistaken for an abandoned lock.
    ///
    /// # Errors
    ///
    /// Returns [`DependencyError::LockLost`] when another holder has
    /// reclaimed the lock, or [`DependencyError::Io`] when the file cannot
    /// be touched.
    pub fn renew(&self) -> Result<(), DependencyError> {
        if !self.is_held() {
            return Err(DependencyError::LockLost {
                path: self.path.clone(),
            });
        }
        File::options()
            .write(true)
            .open(&self.path)
            .and_then(|file| file.set_modified(SystemTime::now()))
            .map_err(|source| DependencyError::io("renew lock", self.path.clone(), source))
    }
}

impl Drop for StagingLock {
    fn drop(&mut self) {
        if !self.is_held() {
            warn!(
                target: LOCK_TARGET,
                file = %self.path.display(),
                "staging lock was taken over, leaving it to the new holder"
            );
            return;
        }
        match fs::remove_file(&self.path) {
            Err(error) if error.kind() != io::ErrorKind::NotFound => {
                warn!(
                    target: LOCK_TARGET,
                    file = %self.path.display(),
                    %error,
                    "failed to remove staging lock"
                );
            }
            _ => debug!(target: LOCK_TARGET, file = %self.path.display(), "staging lock released"),
        }
    }
}

fn contention(path: &Path) -> DependencyError {
    DependencyError::LockContention {
        path: path.to_path_buf(),
    }
}

/// `<pid> <unix seconds> <nonce>`, unique per acquisition.
fn new_token() -> String {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!(
        "{} {} {:x}-{sequence:x}",
        std::process::id(),
        elapsed.as_secs(),
        elapsed.subsec_nanos()
    )
}

fn create(path: &Path) -> io::Result<StagingLock> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let lock = StagingLock {
        path: path.to_path_buf(),
        token: new_token(),
    };
    writeln!(file, "{}", lock.token)?;
    file.sync_all()?;
    info!(target: LOCK_TARGET, file = %path.display(), "acquired staging lock");
    Ok(lock)
}

/// Renames the abandoned lock out of the way so that a concurrent
/// reclaimer cannot delete a lock created after the staleness check.
///
/// `observed` is the holder seen when the lock was judged stale. If the
/// file moved aside belongs to someone else it is restored and the call
/// reports contention.
fn set_aside(path: &Path, observed: &str) -> Result<(), DependencyError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let aside = path.with_file_name(format!("{file_name}.stale-{}", new_token().replace(' ', "-")));
    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(error) => return Err(DependencyError::io("set aside stale lock", path, error)),
    }
    let moved = read_holder(&aside);
    if moved == observed {
        discard(&aside);
        return Ok(());
    }
    if let Err(error) = fs::hard_link(&aside, path) {
        warn!(
            target: LOCK_TARGET,
            file = %path.display(),
            %error,
            "failed to restore a live staging lock"
        );
    }
    discard(&aside);
    Err(contention(path))
}

fn discard(path: &Path) {
    if let Err(error) = fs::remove_file(path) {
        warn!(target: LOCK_TARGET, file = %path.display(), %error, "failed to remove lock file");
    }
}

fn is_stale(path: &Path, grace: Duration) -> bool {
    let modified = fs::metadata(path).and_then(|metadata| metadata.modified());
    match modified {
        Ok(modified) => SystemTime::now()
            .duration_since(modified)
            .is_ok_and(|age| age > grace),
        // Vanished between the failed create and this check.
        Err(_) => true,
    }
}

fn read_holder(path: &Path) -> String {
    fs::read_to_string(path)
        .map(|contents| contents.trim().to_owned())
        .unwrap_or_default()
}
