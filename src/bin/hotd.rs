//! hotd - hot-restartable TCP greeter
//!
//! Answers every connection on `--listen` with `--message`. Starting a second
//! hotd with the same pid file replaces the first one in place:
//!
//! ```text
//! hotd --pid-file /tmp/hotd.pid --message v1 &
//! hotd --pid-file /tmp/hotd.pid --message v2 --grace-ms 200 &   # v1 exits
//! ```
//!
//! With `--detach` the process spawns a marked copy of itself to do the
//! serving, prints the worker pid and exits (or waits, with `--wait`).

use clap::Parser;
use log::info;
use nix::sys::signal::Signal;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use hot_restart::config::{parse_signal, DaemonConfig, HotConfig, DEFAULT_STOP_SIGNAL};
use hot_restart::{
    Hot, Instance, InstanceError, Prepare, Service, StopGate, StreamBinding, Streams,
};

#[derive(Parser)]
#[command(name = "hotd")]
#[command(about = "Hot-restartable TCP greeter")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:7878")]
    listen: SocketAddr,

    /// Line sent to every client
    #[arg(long, default_value = "hello")]
    message: String,

    /// Pid file (default: path of this executable plus .pid)
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Spawn a detached worker and exit
    #[arg(long, short = 'd')]
    detach: bool,

    /// With --detach, wait for the worker to exit
    #[arg(long, requires = "detach")]
    wait: bool,

    /// Milliseconds to wait after signalling the running instance
    #[arg(long, default_value_t = 10)]
    grace_ms: u64,

    /// Signal used to stop the running instance
    #[arg(long, default_value_t = DEFAULT_STOP_SIGNAL, value_parser = parse_signal)]
    signal: Signal,

    /// Log filter, used when RUST_LOG is unset (workers never see RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// With --detach, append the worker's stdout and stderr to this file
    #[arg(long, requires = "detach")]
    log_file: Option<PathBuf>,
}

struct Greeter {
    listen: SocketAddr,
    message: String,
    gate: StopGate,
}

impl Instance for Greeter {
    async fn run(&self) -> Result<(), InstanceError> {
        let guard = self.gate.begin();
        let listener = TcpListener::bind(self.listen).await?;
        info!("Listening on {}", self.listen);

        loop {
            tokio::select! {
                _ = guard.requested() => break,
                accepted = listener.accept() => match accepted {
                    Ok((mut stream, peer)) => {
                        let line = format!("{}\n", self.message);
                        tokio::spawn(async move {
                            if let Err(e) = stream.write_all(line.as_bytes()).await {
                                log::debug!("Write to {} failed: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => log::warn!("accept error: {}", e),
                },
            }
        }

        drop(listener);
        info!("Released {}", self.listen);
        Ok(())
    }

    async fn stop(&self) -> Result<(), InstanceError> {
        self.gate.stop().await;
        Ok(())
    }
}

impl Prepare for Greeter {
    async fn prepare(&self) -> Result<(), InstanceError> {
        if self.message.is_empty() || self.message.contains('\n') {
            return Err("message must be a single non-empty line".into());
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let mut config = HotConfig::default()
        .with_stop_signal(args.signal)
        .with_grace_period(Duration::from_millis(args.grace_ms));
    if let Some(path) = &args.pid_file {
        config = config.with_pid_file(path);
    }
    if args.detach {
        let mut daemon = DaemonConfig::default();
        if let Some(log_file) = &args.log_file {
            daemon.streams = Streams {
                stdout: StreamBinding::Append(log_file.clone()),
                stderr: StreamBinding::Append(log_file.clone()),
                ..Streams::default()
            };
        }
        config = config.with_daemon(daemon);
    }

    let greeter = Greeter {
        listen: args.listen,
        message: args.message.clone(),
        gate: StopGate::new(),
    };
    let mut hot = Hot::new(Service::prepared(greeter), config)?;
    info!(
        "hotd starting (pid={}, pid file {:?})",
        std::process::id(),
        hot.pid_file_path()
    );

    if args.wait {
        hot.run_and_wait().await?;
    } else if let Some(child) = hot.run_and_release().await? {
        if let Some(pid) = child.id() {
            println!("{}", pid);
        }
    }

    info!("hotd {} done", std::process::id());
    Ok(())
}
