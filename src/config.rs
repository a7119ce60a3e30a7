use std::path::PathBuf;
use std::time::Duration;

/// Per-platform defaults for script execution.
///
/// Requests may override the interpreter and working directory; the flag and
/// suffix always come from here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformDefaults {
    /// Interpreter binary (e.g., "/bin/bash")
    pub interpreter: String,
    /// Flag that makes the interpreter take a single command string (e.g., "-c")
    pub interpreter_flag: String,
    /// Suffix for the materialized script file (e.g., ".sh")
    pub script_suffix: String,
    /// Working directory used when a request does not name one
    pub work_dir: PathBuf,
    /// Scratch directory for script and output files; the OS temp dir if unset
    pub temp_dir: Option<PathBuf>,
}

impl PlatformDefaults {
    /// Defaults for the platform this binary was built for.
    #[cfg(target_os = "windows")]
    pub fn current() -> Self {
        Self {
            interpreter: "powershell".to_string(),
            interpreter_flag: "-Command".to_string(),
            script_suffix: ".ps1".to_string(),
            work_dir: PathBuf::from("C:\\Windows\\Temp"),
            temp_dir: None,
        }
    }

    /// Defaults for the platform this binary was built for.
    #[cfg(not(target_os = "windows"))]
    pub fn current() -> Self {
        Self {
            interpreter: "/bin/bash".to_string(),
            interpreter_flag: "-c".to_string(),
            script_suffix: ".sh".to_string(),
            work_dir: PathBuf::from("/tmp"),
            temp_dir: None,
        }
    }
}

impl PlatformDefaults {
    pub fn scratch_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

impl Default for PlatformDefaults {
    fn default() -> Self {
        Self::current()
    }
}

/// Timing and buffering for the control-plane session.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Delay between connect attempts while no server is reachable
    pub connect_retry_delay: Duration,
    /// Delay between registration attempts until the server acknowledges
    pub register_retry_delay: Duration,
    /// Keepalive interval on the write path
    pub heartbeat_interval: Duration,
    /// Upper bound on a single handshake (connect + load frame)
    pub probe_timeout: Duration,
    /// Capacity of the per-session outbound queue
    pub outbound_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_retry_delay: Duration::from_secs(5),
            register_retry_delay: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(10),
            outbound_capacity: 4096,
        }
    }
}

/// Inbound queue and worker pool sizing.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            queue_capacity: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Candidate control-plane endpoints (ws:// or wss:// URLs)
    pub servers: Vec<String>,
    /// File caching the generated agent id across restarts
    pub identity_path: PathBuf,
    /// SQLite file backing the durable task store
    pub store_path: PathBuf,
    pub connection: ConnectionConfig,
    pub dispatch: DispatchConfig,
    pub platform: PlatformDefaults,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            identity_path: PathBuf::from("uuid.txt"),
            store_path: PathBuf::from("tasks.db"),
            connection: ConnectionConfig::default(),
            dispatch: DispatchConfig::default(),
            platform: PlatformDefaults::current(),
        }
    }
}

impl AgentConfig {
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            servers,
            ..Default::default()
        }
    }

    pub fn with_server(mut self, url: impl Into<String>) -> Self {
        self.servers.push(url.into());
        self
    }

    /// Reject configurations the agent cannot start with.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.servers.is_empty() {
            return Err(crate::error::AgentError::Config(
                "at least one server address is required".to_string(),
            ));
        }
        if self.dispatch.workers == 0 {
            return Err(crate::error::AgentError::Config(
                "worker pool size must be greater than zero".to_string(),
            ));
        }
        if self.dispatch.queue_capacity == 0 || self.connection.outbound_capacity == 0 {
            return Err(crate::error::AgentError::Config(
                "queue capacities must be greater than zero".to_string(),
            ));
        }
        if self.connection.heartbeat_interval.is_zero() {
            return Err(crate::error::AgentError::Config(
                "heartbeat interval must be greater than zero".to_string(),
            ));
        }
        if self.connection.register_retry_delay.is_zero() {
            return Err(crate::error::AgentError::Config(
                "registration retry delay must be greater than zero".to_string(),
            ));
        }
        if self.connection.probe_timeout.is_zero() {
            return Err(crate::error::AgentError::Config(
                "probe timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
