//! PID file management
//!
//! A PID file records which process owns a service slot. During a handoff the
//! successor renames the current file to `<path>.old` while it deals with the
//! predecessor, then claims `<path>` for itself.
//!
//! Format: the decimal pid, no trailing newline.

use nix::unistd::Pid;
use std::ffi::OsString;
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

/// Suffix appended to the pid file path for the handoff backup slot
pub const OLD_SUFFIX: &str = ".old";

/// Suffix appended to the executable path by [`default_path`]
pub const DEFAULT_SUFFIX: &str = ".pid";

const DIR_MODE: u32 = 0o750;
const FILE_MODE: u32 = 0o640;

/// An owned pid file slot
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    file: Option<File>,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this instance currently holds the file open
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Create the parent directory if needed, then open and truncate the file.
    pub fn open(&mut self) -> Result<(), PidFileError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                DirBuilder::new()
                    .recursive(true)
                    .mode(DIR_MODE)
                    .create(parent)
                    .map_err(|source| PidFileError::CreateDir {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(FILE_MODE)
            .open(&self.path)
            .map_err(|source| PidFileError::Open {
                path: self.path.clone(),
                source,
            })?;

        self.file = Some(file);
        Ok(())
    }

    /// Overwrite the file content with `pid`.
    ///
    /// The file is truncated to the written length, so a shorter pid never
    /// leaves digits of a longer previous one behind.
    pub fn write_pid(&mut self, pid: Pid) -> Result<(), PidFileError> {
        let file = self.file.as_mut().ok_or_else(|| PidFileError::NotOpen {
            path: self.path.clone(),
        })?;

        let content = pid.to_string();
        let write = |file: &mut File| -> io::Result<()> {
            file.seek(SeekFrom::Start(0))?;
            file.write_all(content.as_bytes())?;
            file.set_len(content.len() as u64)?;
            file.flush()
        };

        write(file).map_err(|source| PidFileError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

/// Path of the backup slot for `path`
pub fn old_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(OLD_SUFFIX);
    PathBuf::from(name)
}

pub fn exists(path: &Path) -> bool {
    fs::metadata(path).is_ok()
}

pub fn old_exists(path: &Path) -> bool {
    exists(&old_path(path))
}

/// Rename `path` to its backup slot. Fails if `path` does not exist.
pub fn move_to_old(path: &Path) -> Result<(), PidFileError> {
    let old = old_path(path);
    fs::rename(path, &old).map_err(|source| PidFileError::Rename {
        from: path.to_path_buf(),
        to: old,
        source,
    })
}

/// Delete `path`. A missing file is not an error.
pub fn remove(path: &Path) -> Result<(), PidFileError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(PidFileError::Remove {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Delete the backup slot of `path`. A missing file is not an error.
pub fn remove_old(path: &Path) -> Result<(), PidFileError> {
    remove(&old_path(path))
}

/// Read and parse the pid stored at `path`
pub fn read_pid(path: &Path) -> Result<Pid, PidFileError> {
    let content = fs::read_to_string(path).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            PidFileError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            PidFileError::Read {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;

    // Files written by hand usually end with a newline
    let raw = content.trim();
    raw.parse::<i32>()
        .map(Pid::from_raw)
        .map_err(|source| PidFileError::Parse {
            path: path.to_path_buf(),
            content: raw.to_string(),
            source,
        })
}

/// Default pid file location: the absolute path this process was invoked by
/// plus `.pid`. Symlinks are not resolved.
pub fn default_path() -> Result<PathBuf, PidFileError> {
    let exe = crate::daemon::invoked_path().map_err(PidFileError::CurrentExe)?;
    let mut name = exe.into_os_string();
    name.push(DEFAULT_SUFFIX);
    Ok(PathBuf::from(name))
}

#[derive(Debug, thiserror::Error)]
pub enum PidFileError {
    #[error("Failed to create pid directory {path:?}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("Failed to open pid file {path:?}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("Pid file {path:?} is not open")]
    NotOpen { path: PathBuf },

    #[error("Failed to write pid file {path:?}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("Pid file {path:?} not found")]
    NotFound { path: PathBuf },

    #[error("Failed to read pid file {path:?}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("Invalid pid {content:?} in {path:?}: {source}")]
    Parse {
        path: PathBuf,
        content: String,
        source: std::num::ParseIntError,
    },

    #[error("Failed to rename {from:?} to {to:?}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },

    #[error("Failed to remove {path:?}: {source}")]
    Remove { path: PathBuf, source: io::Error },

    #[error("Cannot resolve executable path: {0}")]
    CurrentExe(io::Error),
}
