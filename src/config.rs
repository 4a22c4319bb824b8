use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SWAP_OUT_DELAY: Duration = Duration::from_secs(60);
const DEFAULT_GRACE_PERIOD_DELAY: Duration = Duration::from_secs(60);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_MAX_REQUESTS: usize = 10_000;

/// Configuration for one job manager instance.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Host name embedded in state file names.
    pub hostname: String,

    /// Local user name embedded in state file names when the default
    /// state directory is used.
    pub logname: String,

    /// Installation root. The default state directory lives below it.
    pub install_root: PathBuf,

    /// Explicit state directory. When set, state files are named
    /// `job.<hostname>.<u1>.<u2>` instead of `<logname>.<hostname>.<u1>.<u2>`.
    pub state_dir: Option<PathBuf>,

    /// How long an idle job in the poll-wait phase stays in memory before
    /// it is written out and freed.
    pub swap_out_delay: Duration,

    /// How long the manager waits after its last job left before it
    /// considers itself drained.
    pub grace_period_delay: Duration,

    /// Whether LRM completion events are delivered asynchronously.
    /// Enables LRM id splitting and poll-wait swap-out.
    pub event_stream_enabled: bool,

    /// Maximum number of job requests tracked at once.
    pub max_requests: usize,

    /// Poll interval for jobs when event streaming is off.
    pub poll_interval: Duration,

    /// Address for the HTTP status surface (optional).
    pub dashboard_addr: Option<SocketAddr>,

    /// Append log lines to this file instead of stderr.
    pub log_file: Option<PathBuf>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            logname: "gram".to_string(),
            install_root: PathBuf::from("/usr/local/gram"),
            state_dir: None,
            swap_out_delay: DEFAULT_SWAP_OUT_DELAY,
            grace_period_delay: DEFAULT_GRACE_PERIOD_DELAY,
            event_stream_enabled: false,
            max_requests: DEFAULT_MAX_REQUESTS,
            poll_interval: DEFAULT_POLL_INTERVAL,
            dashboard_addr: None,
            log_file: None,
        }
    }
}

impl ManagerConfig {
    pub fn new(hostname: impl Into<String>, logname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            logname: logname.into(),
            ..Default::default()
        }
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    pub fn with_event_stream(mut self, enabled: bool) -> Self {
        self.event_stream_enabled = enabled;
        self
    }

    pub fn with_delays(mut self, swap_out: Duration, grace_period: Duration) -> Self {
        self.swap_out_delay = swap_out;
        self.grace_period_delay = grace_period;
        self
    }

    /// Directory holding the job state files.
    pub fn state_dir_path(&self) -> PathBuf {
        match &self.state_dir {
            Some(dir) => dir.clone(),
            None => self.install_root.join("tmp").join("gram_job_state"),
        }
    }

    /// File name prefix shared by every state file of this instance.
    pub fn state_file_prefix(&self) -> String {
        match self.state_dir {
            Some(_) => format!("job.{}", self.hostname),
            None => format!("{}.{}", self.logname, self.hostname),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manager_config_default() {
        let cfg = ManagerConfig::default();
        assert_eq!(cfg.swap_out_delay, Duration::from_secs(60));
        assert_eq!(cfg.grace_period_delay, Duration::from_secs(60));
        assert!(!cfg.event_stream_enabled);
        assert_eq!(cfg.max_requests, 10_000);
        assert!(cfg.state_dir.is_none());
        assert!(cfg.dashboard_addr.is_none());
    }

    #[test]
    fn default_state_dir_is_below_install_root() {
        let cfg = ManagerConfig {
            install_root: PathBuf::from("/opt/grid"),
            ..ManagerConfig::new("node7", "alice")
        };
        assert_eq!(
            cfg.state_dir_path(),
            PathBuf::from("/opt/grid/tmp/gram_job_state")
        );
        assert_eq!(cfg.state_file_prefix(), "alice.node7");
    }

    #[test]
    fn explicit_state_dir_changes_prefix() {
        let cfg = ManagerConfig::new("node7", "alice").with_state_dir("/var/lib/gram");
        assert_eq!(cfg.state_dir_path(), PathBuf::from("/var/lib/gram"));
        assert_eq!(cfg.state_file_prefix(), "job.node7");
    }

    #[test]
    fn builder_helpers() {
        let cfg = ManagerConfig::default()
            .with_event_stream(true)
            .with_delays(Duration::from_millis(5), Duration::from_millis(7));
        assert!(cfg.event_stream_enabled);
        assert_eq!(cfg.swap_out_delay, Duration::from_millis(5));
        assert_eq!(cfg.grace_period_delay, Duration::from_millis(7));
    }
}
