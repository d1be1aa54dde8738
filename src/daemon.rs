//! Detached process launcher
//!
//! Spawns a copy of the current executable carrying a marker environment
//! variable, so the copy knows it is the worker and must not spawn again.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::ffi::{OsStr, OsString};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio::process::{Child, Command};

use crate::config::DaemonConfig;

/// Marker variable set in the environment of spawned instances
pub const MARK_VAR: &str = "_DAEMON";
/// Value of [`MARK_VAR`] in spawned instances
pub const MARK_VALUE: &str = "yes";

/// Descriptor the fourth stream slot is bound to in the child
const EXTRA_FD: libc::c_int = 3;

/// Which side of the spawn boundary this process is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Started by a user or supervisor; may spawn a worker
    Origin,
    /// Spawned by an origin process; serves directly
    Spawned,
}

impl Role {
    /// Read the marker from this process's environment
    pub fn detect() -> Self {
        Self::from_marker(std::env::var_os(MARK_VAR).as_deref())
    }

    fn from_marker(value: Option<&OsStr>) -> Self {
        match value {
            Some(v) if v == MARK_VALUE => Role::Spawned,
            _ => Role::Origin,
        }
    }

    pub fn is_spawned(self) -> bool {
        self == Role::Spawned
    }
}

/// Where a child's stream slot points
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StreamBinding {
    /// Share the parent's descriptor
    #[default]
    Inherit,
    /// The null device
    Null,
    /// Append to a file, creating it if needed
    Append(PathBuf),
}

impl StreamBinding {
    fn open(&self) -> Result<Option<File>, LaunchError> {
        let (path, append) = match self {
            StreamBinding::Inherit => return Ok(None),
            StreamBinding::Null => (Path::new("/dev/null"), false),
            StreamBinding::Append(path) => (path.as_path(), true),
        };

        OpenOptions::new()
            .read(!append)
            .write(true)
            .append(append)
            .create(append)
            .open(path)
            .map(Some)
            .map_err(|source| LaunchError::StreamOpen {
                path: path.to_path_buf(),
                source,
            })
    }

    fn to_stdio(&self) -> Result<Stdio, LaunchError> {
        Ok(match self.open()? {
            Some(file) => Stdio::from(file),
            None => Stdio::inherit(),
        })
    }
}

/// Bindings for the child's stdin, stdout, stderr and descriptor 3
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Streams {
    pub stdin: StreamBinding,
    pub stdout: StreamBinding,
    pub stderr: StreamBinding,
    pub extra: StreamBinding,
}

impl Default for Streams {
    fn default() -> Self {
        Self {
            stdin: StreamBinding::Inherit,
            stdout: StreamBinding::Inherit,
            stderr: StreamBinding::Inherit,
            extra: StreamBinding::Null,
        }
    }
}

/// Pid of the last spawned worker, shared with stop handles
#[derive(Debug, Clone, Default)]
pub struct Launched(Arc<AtomicI32>);

impl Launched {
    fn set(&self, pid: Pid) {
        self.0.store(pid.as_raw(), Ordering::SeqCst);
    }

    pub fn get(&self) -> Option<Pid> {
        match self.0.load(Ordering::SeqCst) {
            0 => None,
            raw => Some(Pid::from_raw(raw)),
        }
    }
}

/// Launcher configured for one service
#[derive(Debug)]
pub struct Daemon {
    config: DaemonConfig,
    role: Role,
    launched: Launched,
}

impl Daemon {
    pub fn new(config: DaemonConfig, role: Role) -> Self {
        Self {
            config,
            role,
            launched: Launched::default(),
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// True if this process is itself a spawned worker
    pub fn is_marked_instance(&self) -> bool {
        self.role.is_spawned()
    }

    /// Spawn the configured executable and remember its pid
    pub fn launch(&self) -> Result<Child, LaunchError> {
        let executable = match &self.config.executable {
            Some(path) => path.clone(),
            None => invoked_path().map_err(LaunchError::CurrentExe)?,
        };

        let child = launch(
            &executable,
            &self.config.args,
            &self.config.work_dir,
            &self.config.streams,
        )?;

        if let Some(pid) = child.id() {
            self.launched.set(Pid::from_raw(pid as i32));
        }
        Ok(child)
    }

    /// Pid of the spawned worker, if any
    pub fn process_id(&self) -> Option<Pid> {
        self.launched.get()
    }

    pub(crate) fn launched(&self) -> Launched {
        self.launched.clone()
    }

    /// Send `sig` to the spawned worker
    pub fn signal(&self, sig: Signal) -> Result<(), LaunchError> {
        let pid = self.launched.get().ok_or(LaunchError::NotLaunched)?;
        signal(pid, sig)
    }
}

/// Absolute path this process was invoked by.
///
/// Symlinks in argv[0] are kept, so a release swapped in behind a symlink
/// still maps to the same path. A bare command name was found through PATH
/// and falls back to the resolved executable.
pub fn invoked_path() -> std::io::Result<PathBuf> {
    match std::env::args_os().next().filter(|arg0| names_a_path(arg0)) {
        Some(arg0) => std::path::absolute(arg0),
        None => std::env::current_exe(),
    }
}

fn names_a_path(arg0: &OsStr) -> bool {
    Path::new(arg0).components().nth(1).is_some()
}

/// Start `executable` with only the marker variable in its environment
pub fn launch(
    executable: &Path,
    args: &[OsString],
    work_dir: &Path,
    streams: &Streams,
) -> Result<Child, LaunchError> {
    let mut cmd = Command::new(executable);
    cmd.args(args);
    cmd.current_dir(work_dir);

    cmd.env_clear();
    cmd.env(MARK_VAR, MARK_VALUE);

    cmd.stdin(streams.stdin.to_stdio()?);
    cmd.stdout(streams.stdout.to_stdio()?);
    cmd.stderr(streams.stderr.to_stdio()?);

    // Kept open until spawn returns
    let extra = streams.extra.open()?;
    if let Some(file) = &extra {
        let fd = file.as_raw_fd();
        // Only async-signal-safe calls between fork and exec
        unsafe {
            cmd.pre_exec(move || {
                if fd == EXTRA_FD {
                    // dup2 onto itself keeps CLOEXEC, clear it instead
                    if libc::fcntl(fd, libc::F_SETFD, 0) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                } else if libc::dup2(fd, EXTRA_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let child = cmd.spawn().map_err(|source| LaunchError::Spawn {
        executable: executable.to_path_buf(),
        source,
    })?;
    drop(extra);

    log::info!(
        "Spawned {:?} as pid {}",
        executable,
        child.id().map(|p| p.to_string()).unwrap_or_else(|| "?".into())
    );
    Ok(child)
}

/// Send `sig` to `pid`. Fails if the process no longer exists.
pub fn signal(pid: Pid, sig: Signal) -> Result<(), LaunchError> {
    kill(pid, sig).map_err(|source| LaunchError::Signal { pid, source })
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Failed to spawn {executable:?}: {source}")]
    Spawn {
        executable: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to open stream target {path:?}: {source}")]
    StreamOpen {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("No process has been launched")]
    NotLaunched,

    #[error("Failed to signal pid {pid}: {source}")]
    Signal { pid: Pid, source: nix::Error },

    #[error("Cannot resolve executable path: {0}")]
    CurrentExe(std::io::Error),
}
