//! Configuration for the orchestrator and launcher

use nix::sys::signal::Signal;
use std::ffi::OsString;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::daemon::{Role, Streams};

/// Default signal used to ask a predecessor to stop
pub const DEFAULT_STOP_SIGNAL: Signal = Signal::SIGUSR1;

/// Default wait between signalling a predecessor and claiming the slot
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(10);

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct HotConfig {
    /// Pid file location; `None` uses [`crate::pidfile::default_path`]
    pub pid_file: Option<PathBuf>,
    pub stop_signal: Signal,
    /// Fixed wait after signalling a live predecessor. Not confirmed by the
    /// predecessor, so shared resources may still be held when it elapses.
    pub grace_period: Duration,
    /// Spawn a detached worker instead of serving in this process
    pub daemon: Option<DaemonConfig>,
    pub role: Role,
}

impl Default for HotConfig {
    fn default() -> Self {
        Self {
            pid_file: None,
            stop_signal: DEFAULT_STOP_SIGNAL,
            grace_period: DEFAULT_GRACE_PERIOD,
            daemon: None,
            role: Role::detect(),
        }
    }
}

impl HotConfig {
    /// Defaults plus a launcher with default settings
    pub fn daemonized() -> Self {
        Self {
            daemon: Some(DaemonConfig::default()),
            ..Self::default()
        }
    }

    pub fn with_pid_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pid_file = Some(path.into());
        self
    }

    pub fn with_stop_signal(mut self, signal: Signal) -> Self {
        self.stop_signal = signal;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_daemon(mut self, daemon: DaemonConfig) -> Self {
        self.daemon = Some(daemon);
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }
}

/// Launcher settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    /// Program to spawn; `None` re-executes the current binary
    pub executable: Option<PathBuf>,
    /// Arguments after argv[0]
    pub args: Vec<OsString>,
    pub work_dir: PathBuf,
    pub streams: Streams,
}

impl Default for DaemonConfig {
    /// Re-executes the current binary with this process's own arguments
    fn default() -> Self {
        Self {
            executable: None,
            args: std::env::args_os().skip(1).collect(),
            work_dir: PathBuf::from("."),
            streams: Streams::default(),
        }
    }
}

/// Parse a signal given as `SIGUSR1`, `USR1`, `usr1` or a number
pub fn parse_signal(s: &str) -> Result<Signal, ConfigError> {
    let s = s.trim();
    if let Ok(num) = s.parse::<i32>() {
        return Signal::try_from(num).map_err(|_| ConfigError::UnknownSignal(s.to_string()));
    }

    let upper = s.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };
    Signal::from_str(&name).map_err(|_| ConfigError::UnknownSignal(s.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unknown signal: {0}")]
    UnknownSignal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HotConfig::default();
        assert_eq!(config.stop_signal, Signal::SIGUSR1);
        assert_eq!(config.grace_period, Duration::from_millis(10));
        assert!(config.pid_file.is_none());
        assert!(config.daemon.is_none());
    }

    #[test]
    fn test_daemonized_defaults() {
        let config = HotConfig::daemonized().with_role(Role::Spawned);
        let daemon = config.daemon.unwrap();
        assert!(daemon.executable.is_none());
        assert_eq!(daemon.work_dir, PathBuf::from("."));
        assert_eq!(daemon.streams, Streams::default());
        assert_eq!(config.role, Role::Spawned);
    }

    #[test]
    fn test_builder() {
        let config = HotConfig::default()
            .with_pid_file("/run/svc.pid")
            .with_stop_signal(Signal::SIGUSR2)
            .with_grace_period(Duration::from_millis(250));
        assert_eq!(config.pid_file, Some(PathBuf::from("/run/svc.pid")));
        assert_eq!(config.stop_signal, Signal::SIGUSR2);
        assert_eq!(config.grace_period, Duration::from_millis(250));
    }

    #[test]
    fn test_parse_signal() {
        assert_eq!(parse_signal("SIGUSR1").unwrap(), Signal::SIGUSR1);
        assert_eq!(parse_signal("usr2").unwrap(), Signal::SIGUSR2);
        assert_eq!(parse_signal("HUP").unwrap(), Signal::SIGHUP);
        assert_eq!(parse_signal("15").unwrap(), Signal::SIGTERM);
        assert!(parse_signal("SIGNOPE").is_err());
        assert!(parse_signal("0").is_err());
    }
}
