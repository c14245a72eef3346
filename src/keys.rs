//! Layout of the coordination store keyspace.
//!
//! ```text
//! <root>jobs/<name>      JSON job definition
//! <root>killer/<name>    empty, lease-bound kill marker
//! <root>lock/<name>      lease-bound execution lock
//! <root>workers/<ip>     "online", lease-bound liveness entry
//! ```

pub const DEFAULT_ROOT: &str = "/cron/";

/// Value written under a worker's liveness key.
pub const WORKER_ONLINE: &str = "online";

/// Key prefixes for one scheduler deployment. Two deployments sharing a
/// store stay isolated as long as their roots differ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    root: String,
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT)
    }
}

impl Keyspace {
    pub fn new(root: impl Into<String>) -> Self {
        let mut root = root.into();
        if !root.ends_with('/') {
            root.push('/');
        }
        Self { root }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn jobs_prefix(&self) -> String {
        format!("{}jobs/", self.root)
    }

    pub fn killer_prefix(&self) -> String {
        format!("{}killer/", self.root)
    }

    pub fn lock_prefix(&self) -> String {
        format!("{}lock/", self.root)
    }

    pub fn workers_prefix(&self) -> String {
        format!("{}workers/", self.root)
    }

    pub fn job_key(&self, name: &str) -> String {
        format!("{}{}", self.jobs_prefix(), name)
    }

    pub fn kill_key(&self, name: &str) -> String {
        format!("{}{}", self.killer_prefix(), name)
    }

    pub fn lock_key(&self, name: &str) -> String {
        format!("{}{}", self.lock_prefix(), name)
    }

    pub fn worker_key(&self, ip: &str) -> String {
        format!("{}{}", self.workers_prefix(), ip)
    }

    /// Job name from a `jobs/` key, or `None` if the key lies elsewhere.
    pub fn job_name<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.jobs_prefix().as_str())
    }

    /// Job name from a `killer/` key.
    pub fn killed_job_name<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.killer_prefix().as_str())
    }

    /// Worker IP from a `workers/` key.
    pub fn worker_ip<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.workers_prefix().as_str())
    }
}
