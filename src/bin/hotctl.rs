//! hotctl - inspect or stop the owner of a hot-restart pid file

use clap::{Parser, Subcommand};
use nix::sys::signal::Signal;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hot_restart::config::{parse_signal, DEFAULT_STOP_SIGNAL};
use hot_restart::daemon;
use hot_restart::hot::probe;
use hot_restart::pidfile;

/// Exit code for "not running", as systemctl status uses
const EXIT_NOT_RUNNING: i32 = 3;

#[derive(Parser)]
#[command(name = "hotctl")]
#[command(about = "Inspect and stop the owner of a hot-restart pid file")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show which process owns a pid file
    Status {
        #[arg(long)]
        pid_file: PathBuf,
    },

    /// Send the stop signal to the owner and wait for it to exit
    Stop {
        #[arg(long)]
        pid_file: PathBuf,

        #[arg(long, default_value_t = DEFAULT_STOP_SIGNAL, value_parser = parse_signal)]
        signal: Signal,

        /// Give up waiting after this many milliseconds
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();

    match args.command {
        Command::Status { pid_file } => {
            if !status(&pid_file)? {
                std::process::exit(EXIT_NOT_RUNNING);
            }
        }
        Command::Stop {
            pid_file,
            signal,
            timeout_ms,
        } => {
            stop(&pid_file, signal, Duration::from_millis(timeout_ms)).await?;
        }
    }

    Ok(())
}

/// Print the owner of `path`. Returns whether it is running.
fn status(path: &Path) -> Result<bool, Box<dyn std::error::Error>> {
    if pidfile::old_exists(path) {
        println!("  {:?} exists (handoff in progress or interrupted)", pidfile::old_path(path));
    }

    if !pidfile::exists(path) {
        println!("● {} - no pid file", path.display());
        return Ok(false);
    }

    let pid = pidfile::read_pid(path)?;
    let running = probe::find_process(pid).is_some_and(probe::is_alive);
    println!(
        "● {} - pid {} ({})",
        path.display(),
        pid,
        if running { "running" } else { "dead" }
    );
    Ok(running)
}

async fn stop(
    path: &Path,
    signal: Signal,
    timeout: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let pid = pidfile::read_pid(path)?;
    let Some(pid) = probe::find_process(pid).filter(|pid| probe::is_alive(*pid)) else {
        println!("● {} - pid {} not running", path.display(), pid);
        return Ok(());
    };

    daemon::signal(pid, signal)?;
    log::info!("Sent {} to pid {}", signal, pid);

    let deadline = tokio::time::Instant::now() + timeout;
    let mut interval = tokio::time::interval(Duration::from_millis(50));
    while probe::is_alive(pid) {
        if tokio::time::Instant::now() >= deadline {
            return Err(format!("pid {} still running after {:?}", pid, timeout).into());
        }
        interval.tick().await;
    }

    println!("● {} - pid {} stopped", path.display(), pid);
    Ok(())
}
