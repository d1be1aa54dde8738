//! Process-level handoff tests driving the hotd and hotctl binaries

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::io::{BufRead, BufReader};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use hot_restart::pidfile;

const HOTD: &str = env!("CARGO_BIN_EXE_hotd");
const HOTCTL: &str = env!("CARGO_BIN_EXE_hotctl");

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

fn unique_test_dir() -> PathBuf {
    let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = PathBuf::from(format!("/tmp/hot-handoff-test-{}-{}", std::process::id(), id));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// Grab a free port from the kernel
fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// Kills the process on drop so failed tests leave nothing behind
struct Guard(Child);

impl Guard {
    fn pid(&self) -> Pid {
        Pid::from_raw(self.0.id() as i32)
    }

    fn wait_exit(&mut self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(status) = self.0.try_wait().unwrap() {
                return Some(status);
            }
            thread::sleep(Duration::from_millis(20));
        }
        None
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn start_hotd(addr: SocketAddr, pid_file: &Path, message: &str) -> Guard {
    let child = Command::new(HOTD)
        .arg("--listen")
        .arg(addr.to_string())
        .arg("--pid-file")
        .arg(pid_file)
        .arg("--message")
        .arg(message)
        .arg("--grace-ms")
        .arg("300")
        .arg("--log-level")
        .arg("debug")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .spawn()
        .unwrap();
    Guard(child)
}

fn greeting(addr: SocketAddr) -> Option<String> {
    let stream = TcpStream::connect_timeout(&addr, Duration::from_millis(200)).ok()?;
    stream.set_read_timeout(Some(Duration::from_secs(1))).ok()?;
    let mut line = String::new();
    BufReader::new(stream).read_line(&mut line).ok()?;
    Some(line.trim_end().to_string())
}

fn wait_for_greeting(addr: SocketAddr, expected: &str) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if greeting(addr).as_deref() == Some(expected) {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

fn wait_for_owner(pid_file: &Path, pid: Pid) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if pidfile::read_pid(pid_file).ok() == Some(pid) {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

#[test]
fn test_stop_signal_leaves_pid_file() {
    let dir = unique_test_dir();
    let pid_file = dir.join("hotd.pid");
    let addr = free_addr();

    let mut a = start_hotd(addr, &pid_file, "v1");
    assert!(wait_for_greeting(addr, "v1"));
    assert!(wait_for_owner(&pid_file, a.pid()));

    kill(a.pid(), Signal::SIGUSR1).unwrap();
    let status = a.wait_exit(Duration::from_secs(5)).expect("hotd did not exit");
    assert!(status.success());

    assert_eq!(pidfile::read_pid(&pid_file).unwrap(), a.pid());
    assert!(greeting(addr).is_none());
}

#[test]
fn test_successor_replaces_running_instance() {
    let dir = unique_test_dir();
    let pid_file = dir.join("hotd.pid");
    let addr = free_addr();

    let mut a = start_hotd(addr, &pid_file, "v1");
    assert!(wait_for_greeting(addr, "v1"));
    assert!(wait_for_owner(&pid_file, a.pid()));

    let mut b = start_hotd(addr, &pid_file, "v2");
    let status = a.wait_exit(Duration::from_secs(5)).expect("predecessor did not exit");
    assert!(status.success());

    assert!(wait_for_greeting(addr, "v2"));
    assert!(wait_for_owner(&pid_file, b.pid()));
    assert!(!pidfile::old_exists(&pid_file));

    kill(b.pid(), Signal::SIGUSR1).unwrap();
    assert!(b.wait_exit(Duration::from_secs(5)).unwrap().success());
}

#[cfg(target_os = "linux")]
#[test]
fn test_detach_spawns_marked_worker() {
    let dir = unique_test_dir();
    let pid_file = dir.join("hotd.pid");
    let log_file = dir.join("worker.log");
    let addr = free_addr();

    let output = Command::new(HOTD)
        .arg("--detach")
        .arg("--listen")
        .arg(addr.to_string())
        .arg("--pid-file")
        .arg(&pid_file)
        .arg("--message")
        .arg("detached")
        .arg("--log-file")
        .arg(&log_file)
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let worker: i32 = stdout.trim().parse().expect("worker pid on stdout");
    let worker = Pid::from_raw(worker);

    assert!(wait_for_owner(&pid_file, worker));
    assert!(wait_for_greeting(addr, "detached"));

    let environ = fs::read(format!("/proc/{}/environ", worker)).unwrap();
    assert_eq!(environ, b"_DAEMON=yes\0");

    let status = Command::new(HOTCTL)
        .args(["status", "--pid-file"])
        .arg(&pid_file)
        .output()
        .unwrap();
    assert!(status.status.success());
    assert!(String::from_utf8_lossy(&status.stdout).contains("running"));

    let stop = Command::new(HOTCTL)
        .args(["stop", "--pid-file"])
        .arg(&pid_file)
        .output()
        .unwrap();
    if !stop.status.success() {
        let _ = kill(worker, Signal::SIGKILL);
        panic!("hotctl stop failed: {}", String::from_utf8_lossy(&stop.stderr));
    }
    assert!(greeting(addr).is_none());

    let status = Command::new(HOTCTL)
        .args(["status", "--pid-file"])
        .arg(&pid_file)
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(3));

    let log = fs::read_to_string(&log_file).unwrap();
    assert!(log.contains("Caught stop signal"));
}

/// Link `current-hotd` in a fresh directory to the built binary
fn symlinked_hotd(dir: &Path) -> PathBuf {
    let link = dir.join("current-hotd");
    std::os::unix::fs::symlink(HOTD, &link).unwrap();
    link
}

#[test]
fn test_default_pid_file_follows_invoked_symlink() {
    let dir = unique_test_dir();
    let link = symlinked_hotd(&dir);

    // An empty message fails prepare, after the pid file path is logged
    let output = Command::new(&link)
        .args(["--message", ""])
        .env_remove("RUST_LOG")
        .stdin(Stdio::null())
        .output()
        .unwrap();
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    let expected = format!("{:?}", dir.join("current-hotd.pid"));
    assert!(stderr.contains(&expected), "stderr: {}", stderr);
}

#[test]
fn test_detach_relaunches_invoked_symlink() {
    let dir = unique_test_dir();
    let link = symlinked_hotd(&dir);

    // The worker fails prepare, so --wait returns once it has exited
    let output = Command::new(&link)
        .args(["--detach", "--wait", "--message", ""])
        .arg("--pid-file")
        .arg(dir.join("hotd.pid"))
        .env_remove("RUST_LOG")
        .stdin(Stdio::null())
        .output()
        .unwrap();
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    let expected = format!("Spawned {:?}", link);
    assert!(stderr.contains(&expected), "stderr: {}", stderr);
}

#[test]
fn test_hotctl_status_without_pid_file() {
    let dir = unique_test_dir();
    let status = Command::new(HOTCTL)
        .args(["status", "--pid-file"])
        .arg(dir.join("missing.pid"))
        .stdout(Stdio::null())
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(3));
}
