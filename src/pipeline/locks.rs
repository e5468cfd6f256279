//! Per-service serialisation and cooperative cancellation.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::{Dir, OpenOptions};
use fd_lock::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Directory under the output root holding one lock file per service.
pub const LOCK_DIR: &str = ".locks";

/// Pause between attempts to take a lock file another process holds.
pub(super) const LOCK_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Registry of per-service locks shared by concurrent pipelines.
///
/// Runs for different services proceed in parallel; runs for the same
/// service queue behind each other.
#[derive(Clone, Debug, Default)]
pub struct ServiceLocks {
    inner: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl ServiceLocks {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `service`.
    pub async fn acquire(&self, service: &str) -> OwnedMutexGuard<()> {
        self.lock_for(service).lock_owned().await
    }

    /// Takes the lock for `service` only if no other run holds it.
    #[must_use]
    pub fn try_acquire(&self, service: &str) -> Option<OwnedMutexGuard<()>> {
        self.lock_for(service).try_lock_owned().ok()
    }

    fn lock_for(&self, service: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(
            locks
                .entry(service.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

/// Advisory lock file guarding runs of one service across processes.
///
/// Every process deploying into the same output directory opens the same
/// `{output_dir}/.locks/{service}.lock`; the write lock is released when the
/// guard or the file is dropped, including when the process dies.
#[derive(Debug)]
pub struct ServiceLockFile {
    path: Utf8PathBuf,
    lock: RwLock<File>,
}

impl ServiceLockFile {
    /// Opens, creating if needed, the lock file for `service` under `root`.
    ///
    /// # Errors
    ///
    /// Returns the I/O error together with the path that could not be
    /// created or opened.
    pub fn open(root: &Utf8Path, service: &str) -> Result<Self, (Utf8PathBuf, io::Error)> {
        let dir_path = root.join(LOCK_DIR);
        let file_name = format!("{service}.lock");
        let path = dir_path.join(&file_name);
        Dir::create_ambient_dir_all(&dir_path, ambient_authority())
            .map_err(|err| (dir_path.clone(), err))?;
        let dir = Dir::open_ambient_dir(&dir_path, ambient_authority())
            .map_err(|err| (dir_path.clone(), err))?;
        let mut options = OpenOptions::new();
        options.create(true).write(true);
        let file = dir
            .open_with(&file_name, &options)
            .map_err(|err| (path.clone(), err))?;
        Ok(Self {
            path,
            lock: RwLock::new(file.into_std()),
        })
    }

    /// Returns the lock file path.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Gives access to the underlying advisory lock.
    pub const fn lock_mut(&mut self) -> &mut RwLock<File> {
        &mut self.lock
    }
}

/// Flag another task raises to abandon a run between phases.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Creates a lowered flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. The current phase finishes; the next one does
    /// not start.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once [`Self::cancel`] has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_root(dir: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
            .unwrap_or_else(|path| panic!("non utf-8 temp path: {}", path.display()))
    }

    #[test]
    fn lock_files_live_under_the_output_root() {
        let dir = TempDir::new().expect("temp dir");
        let root = temp_root(&dir);

        let lock_file = ServiceLockFile::open(&root, "demo").expect("lock file opens");

        assert_eq!(lock_file.path(), root.join(".locks").join("demo.lock"));
        assert!(lock_file.path().is_file());
    }

    #[test]
    fn second_handle_cannot_take_a_held_lock_file() {
        let dir = TempDir::new().expect("temp dir");
        let root = temp_root(&dir);
        let mut first = ServiceLockFile::open(&root, "demo").expect("first handle");
        let mut second = ServiceLockFile::open(&root, "demo").expect("second handle");
        let mut other = ServiceLockFile::open(&root, "shop").expect("other service");

        let held = first.lock_mut().try_write().expect("first lock");
        let err = second
            .lock_mut()
            .try_write()
            .expect_err("held by the first handle");
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert!(other.lock_mut().try_write().is_ok());

        drop(held);
        assert!(second.lock_mut().try_write().is_ok());
    }

    #[tokio::test]
    async fn same_service_is_exclusive() {
        let locks = ServiceLocks::new();

        let held = locks.acquire("demo").await;

        assert!(locks.try_acquire("demo").is_none());
        drop(held);
        assert!(locks.try_acquire("demo").is_some());
    }

    #[tokio::test]
    async fn different_services_do_not_contend() {
        let locks = ServiceLocks::new();

        let _demo = locks.acquire("demo").await;

        assert!(locks.try_acquire("api").is_some());
    }

    #[tokio::test]
    async fn clones_share_the_registry() {
        let locks = ServiceLocks::new();
        let shared = locks.clone();

        let _held = locks.acquire("demo").await;

        assert!(shared.try_acquire("demo").is_none());
    }

    #[test]
    fn cancel_is_visible_through_clones() {
        let flag = CancelFlag::new();
        let remote = flag.clone();

        remote.cancel();

        assert!(flag.is_cancelled());
    }
}
