//! Persistence of job records as per-job state files.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::config::ManagerConfig;
use crate::error::{GramError, Result};
use crate::registry::{JobKey, JobRecord};

/// Stable storage for job records, keyed by job contact.
///
/// Calls block; the manager runs them on the blocking thread pool and never
/// while holding its lock. Distinct keys may be used concurrently.
pub trait JobStore: Send + Sync + 'static {
    fn load(&self, key: &JobKey) -> Result<JobRecord>;

    fn save(&self, record: &JobRecord) -> Result<()>;

    /// Delete the state file of a finished job. Missing files are ignored.
    fn remove(&self, key: &JobKey) -> Result<()>;

    /// Keys of every state file currently stored.
    fn enumerate_keys(&self) -> Result<Vec<JobKey>>;
}

/// One JSON state file per job in a single directory.
///
/// Files are named `<prefix>.<u1>.<u2>`; anything else in the directory,
/// including in-progress `.tmp` files, is ignored by the scan.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
    prefix: String,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn from_config(config: &ManagerConfig) -> Self {
        Self::new(config.state_dir_path(), config.state_file_prefix())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the state directory and its parents, owner-only on unix.
    pub fn ensure_dir(&self) -> Result<()> {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder.create(&self.dir)?;
        Ok(())
    }

    pub fn path_for(&self, key: &JobKey) -> PathBuf {
        self.dir
            .join(format!("{}.{}.{}", self.prefix, key.uniq1, key.uniq2))
    }

    /// Parse a state file name, rejecting anything after the second id.
    pub fn parse_file_name(&self, name: &str) -> Option<JobKey> {
        let rest = name.strip_prefix(&self.prefix)?.strip_prefix('.')?;
        let (first, second) = rest.split_once('.')?;
        let number = |s: &str| -> Option<u64> {
            if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            s.parse().ok()
        };
        Some(JobKey::new(number(first)?, number(second)?))
    }
}

impl JobStore for FileStore {
    fn load(&self, key: &JobKey) -> Result<JobRecord> {
        let path = self.path_for(key);
        let data = fs::read(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => GramError::JobNotFound(*key),
            _ => GramError::Io(e),
        })?;
        let record: JobRecord = serde_json::from_slice(&data)?;
        if record.key != *key {
            return Err(GramError::Internal(format!(
                "state file {} holds job {}",
                path.display(),
                record.key
            )));
        }
        Ok(record)
    }

    fn save(&self, record: &JobRecord) -> Result<()> {
        let path = self.path_for(&record.key);
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let data = serde_json::to_vec_pretty(record)?;

        let mut file = fs::File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;

        tracing::debug!(job = %record.key, path = %path.display(), "State file written");
        Ok(())
    }

    fn remove(&self, key: &JobKey) -> Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn enumerate_keys(&self) -> Result<Vec<JobKey>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(key) = self.parse_file_name(name) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::JobPhase;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> FileStore {
        FileStore::new(dir.path(), "job.node1")
    }

    #[test]
    fn file_name_guard() {
        let store = FileStore::new("/tmp", "job.node1");
        assert_eq!(
            store.parse_file_name("job.node1.12.34"),
            Some(JobKey::new(12, 34))
        );
        assert_eq!(store.parse_file_name("job.node1.12.34.tmp"), None);
        assert_eq!(store.parse_file_name("job.node1.12.34x"), None);
        assert_eq!(store.parse_file_name("job.node1.12"), None);
        assert_eq!(store.parse_file_name("job.node2.12.34"), None);
        assert_eq!(store.parse_file_name("job.node1.-1.34"), None);
        assert_eq!(store.parse_file_name("job.node1.12.99999999999999999999"), None);
    }

    #[test]
    fn save_load_and_enumerate() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let mut record = JobRecord::new(JobKey::new(5, 6));
        record.phase = JobPhase::Poll2;
        record.restart_phase = JobPhase::Poll2;
        record.lrm_job_id = Some("4411.pbs".to_string());
        store.save(&record).unwrap();
        store.save(&JobRecord::new(JobKey::new(1, 2))).unwrap();
        fs::write(dir.path().join("job.node1.7.8.tmp"), b"partial").unwrap();
        fs::write(dir.path().join("unrelated"), b"x").unwrap();

        let loaded = store.load(&JobKey::new(5, 6)).unwrap();
        assert_eq!(loaded.restart_phase, JobPhase::Poll2);
        assert_eq!(loaded.lrm_job_id.as_deref(), Some("4411.pbs"));

        assert_eq!(
            store.enumerate_keys().unwrap(),
            vec![JobKey::new(1, 2), JobKey::new(5, 6)]
        );
    }

    #[test]
    fn missing_state_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(matches!(
            store.load(&JobKey::new(1, 1)),
            Err(GramError::JobNotFound(_))
        ));
        store.remove(&JobKey::new(1, 1)).unwrap();
    }

    #[test]
    fn ensure_dir_creates_parents() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("a/b/state"), "job.node1");
        store.ensure_dir().unwrap();
        store.ensure_dir().unwrap();
        assert!(store.dir().is_dir());
    }
}
