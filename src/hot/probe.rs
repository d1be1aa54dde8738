//! Liveness probing of a pid read from a pid file

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

/// Turn a raw pid into a signal target.
///
/// Non-positive values address process groups (or every process) under
/// kill(2), so they never name a predecessor.
pub fn find_process(pid: Pid) -> Option<Pid> {
    (pid.as_raw() > 0).then_some(pid)
}

/// Result of probing a pid with the null signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Gone,
    /// The probe itself failed, e.g. EPERM for another user's process
    Unknown(Errno),
}

/// Send the null signal to `pid` to see whether it exists. Zombies count as gone.
pub fn probe(pid: Pid) -> Liveness {
    classify(kill(pid, None), || is_zombie(pid))
}

fn classify(result: nix::Result<()>, zombie: impl FnOnce() -> bool) -> Liveness {
    match result {
        Ok(()) if zombie() => Liveness::Gone,
        Ok(()) => Liveness::Alive,
        Err(Errno::ESRCH) => Liveness::Gone,
        Err(e) => Liveness::Unknown(e),
    }
}

/// Like [`probe`], with a failed probe counted as not alive.
///
/// A process owned by another user answers EPERM; it could not be stopped
/// anyway.
pub fn is_alive(pid: Pid) -> bool {
    match probe(pid) {
        Liveness::Alive => true,
        Liveness::Gone => false,
        Liveness::Unknown(e) => {
            log::warn!("Liveness probe of pid {} failed: {}", pid, e);
            false
        }
    }
}

/// Exited but not yet reaped by its parent
#[cfg(target_os = "linux")]
fn is_zombie(pid: Pid) -> bool {
    // Format: "pid (comm) state ...", comm may itself contain ')'
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| {
            stat.rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
        })
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: Pid) -> bool {
    false
}
