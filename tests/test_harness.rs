//! Shared helpers for job manager integration tests.
//!
//! Every test gets its own temporary state directory and a configuration
//! with delays in the tens of milliseconds.

#![allow(dead_code)]

use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use gram_lite::config::ManagerConfig;
use gram_lite::error::{GramError, Result};
use gram_lite::manager::JobManager;
use gram_lite::registry::{JobKey, JobPhase, JobRecord};
use gram_lite::service::GramService;
use gram_lite::store::{FileStore, JobStore};

pub const SWAP_OUT_DELAY: Duration = Duration::from_millis(50);
pub const GRACE_PERIOD: Duration = Duration::from_millis(150);

/// Configuration with short delays and event streaming on.
pub fn test_config(dir: &Path) -> ManagerConfig {
    let mut config = ManagerConfig::new("testhost", "tester")
        .with_state_dir(dir)
        .with_event_stream(true)
        .with_delays(SWAP_OUT_DELAY, GRACE_PERIOD);
    config.poll_interval = Duration::from_millis(50);
    config
}

/// A temporary state directory plus the store and config pointing at it.
pub struct TestEnv {
    pub dir: TempDir,
    pub config: ManagerConfig,
    pub store: Arc<FileStore>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(|config| config)
    }

    pub fn with_config(adjust: impl FnOnce(ManagerConfig) -> ManagerConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let config = adjust(test_config(dir.path()));
        let store = Arc::new(FileStore::from_config(&config));
        Self { dir, config, store }
    }

    pub fn manager(&self) -> JobManager {
        JobManager::new(self.config.clone(), self.store.clone()).unwrap()
    }

    pub fn service(&self) -> GramService {
        GramService::new(self.config.clone()).unwrap()
    }

    pub fn state_file_exists(&self, key: &JobKey) -> bool {
        self.store.path_for(key).exists()
    }
}

pub fn job(uniq: u64, phase: JobPhase) -> JobRecord {
    let mut record = JobRecord::new(JobKey::new(uniq, uniq + 1000));
    record.phase = phase;
    record
}

/// Store that can be told to fail every save.
pub struct FlakyStore {
    inner: FileStore,
    fail_saves: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: FileStore) -> Self {
        Self {
            inner,
            fail_saves: AtomicBool::new(false),
        }
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

impl JobStore for FlakyStore {
    fn load(&self, key: &JobKey) -> Result<JobRecord> {
        self.inner.load(key)
    }

    fn save(&self, record: &JobRecord) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(GramError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        self.inner.save(record)
    }

    fn remove(&self, key: &JobKey) -> Result<()> {
        self.inner.remove(key)
    }

    fn enumerate_keys(&self) -> Result<Vec<JobKey>> {
        self.inner.enumerate_keys()
    }
}

/// Store whose saves take `delay` to complete.
pub struct SlowStore {
    inner: FileStore,
    delay: Duration,
    saves_started: AtomicUsize,
}

impl SlowStore {
    pub fn new(inner: FileStore, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            saves_started: AtomicUsize::new(0),
        }
    }

    pub fn saves_started(&self) -> usize {
        self.saves_started.load(Ordering::SeqCst)
    }
}

impl JobStore for SlowStore {
    fn load(&self, key: &JobKey) -> Result<JobRecord> {
        self.inner.load(key)
    }

    fn save(&self, record: &JobRecord) -> Result<()> {
        self.saves_started.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.inner.save(record)
    }

    fn remove(&self, key: &JobKey) -> Result<()> {
        self.inner.remove(key)
    }

    fn enumerate_keys(&self) -> Result<Vec<JobKey>> {
        self.inner.enumerate_keys()
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Resolve `future` or fail the test after `timeout`.
pub async fn within<T>(timeout: Duration, future: impl Future<Output = T>) -> T {
    tokio::time::timeout(timeout, future)
        .await
        .expect("operation timed out")
}
