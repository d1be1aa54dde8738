//! Restart orchestrator
//!
//! `Hot` sequences a restart:
//! 1. Spawn a detached worker and return, if a launcher is configured and
//!    this process is not already the worker
//! 2. Run the instance's prepare hook
//! 3. Drop a stale `.old` pid file
//! 4. If the pid file names another process: rename it to `.old`, send the
//!    stop signal if that process is alive, wait the grace period, delete `.old`
//! 5. Claim the pid file and write our pid
//! 6. Arm the stop signal and run the instance until it returns
//!
//! The grace period is a fixed sleep. Nothing confirms the predecessor has
//! released shared resources (e.g. a listening socket) when it elapses.

mod instance;
pub mod probe;

pub use instance::{Instance, InstanceError, Prepare, Service};

use nix::sys::signal::{kill, Signal};
use nix::unistd::{getpid, Pid};
use std::path::Path;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::watch;

use crate::config::HotConfig;
use crate::daemon::{self, Daemon, LaunchError, Launched};
use crate::pidfile::{self, PidFile, PidFileError};
use crate::signal;

/// What a call to [`Hot::run`] did
#[derive(Debug)]
pub enum Outcome {
    /// A worker was spawned; this process did not serve
    Spawned(Child),
    /// The instance ran in this process and has returned
    Served,
}

/// Hot restart orchestrator for one service slot
pub struct Hot<S> {
    service: Service<S>,
    daemon: Option<Daemon>,
    pid_file: PidFile,
    stop_signal: Signal,
    grace_period: Duration,
    /// Set when the last `run` failed before the instance started serving
    aborted: Arc<watch::Sender<bool>>,
}

impl<S: Instance> Hot<S> {
    pub fn new(service: Service<S>, config: HotConfig) -> Result<Self, HotError> {
        let path = match config.pid_file {
            Some(path) => path,
            None => pidfile::default_path()?,
        };
        let role = config.role;

        Ok(Self {
            service,
            daemon: config.daemon.map(|daemon| Daemon::new(daemon, role)),
            pid_file: PidFile::new(path),
            stop_signal: config.stop_signal,
            grace_period: config.grace_period,
            aborted: Arc::new(watch::channel(false).0),
        })
    }

    /// Serve in this process with default settings
    pub fn standalone(instance: S) -> Result<Self, HotError> {
        Self::new(Service::plain(instance), HotConfig::default())
    }

    /// Spawn a detached worker with default settings
    pub fn daemonized(instance: S) -> Result<Self, HotError> {
        Self::new(Service::plain(instance), HotConfig::daemonized())
    }

    pub fn service(&self) -> &Service<S> {
        &self.service
    }

    pub fn daemon(&self) -> Option<&Daemon> {
        self.daemon.as_ref()
    }

    pub fn pid_file_path(&self) -> &Path {
        self.pid_file.path()
    }

    pub fn stop_signal(&self) -> Signal {
        self.stop_signal
    }

    /// Handle for stopping whatever `run` started, usable while `run` is in progress
    pub fn stopper(&self) -> Stopper<S> {
        match &self.daemon {
            Some(daemon) if !daemon.is_marked_instance() => Stopper::Process {
                launched: daemon.launched(),
                signal: self.stop_signal,
            },
            _ => Stopper::Instance {
                instance: Arc::clone(self.service.instance()),
                aborted: Arc::clone(&self.aborted),
            },
        }
    }

    /// Spawn a worker, or take over the pid file and serve until stopped
    pub async fn run(&mut self) -> Result<Outcome, HotError> {
        if let Some(daemon) = self.daemon.as_ref().filter(|d| !d.is_marked_instance()) {
            let child = daemon.launch()?;
            return Ok(Outcome::Spawned(child));
        }

        self.aborted.send_replace(false);
        let (pid, watch) = match self.claim().await {
            Ok(claimed) => claimed,
            Err(e) => {
                // Releases stops waiting on a run that will not begin
                self.aborted.send_replace(true);
                return Err(e);
            }
        };

        let result = self.service.instance().run().await;
        watch.settle().await;

        result.map_err(HotError::Instance)?;
        log::info!("Pid {} stopped serving", pid);
        Ok(Outcome::Served)
    }

    /// Prepare, take the pid file over and arm the stop signal
    async fn claim(&mut self) -> Result<(Pid, signal::Watch), HotError> {
        self.service.prepare().await.map_err(HotError::Prepare)?;

        self.take_over().await?;

        self.pid_file.open()?;
        let pid = getpid();
        self.pid_file.write_pid(pid)?;
        log::info!("Pid {} owns {:?}", pid, self.pid_file.path());

        let stopper = self.stopper();
        let watch = signal::watch_and_handle(self.stop_signal, move || async move {
            log::info!("Caught stop signal at pid {}", getpid());
            if let Err(e) = stopper.stop().await {
                log::error!("Stop after signal failed: {}", e);
            }
        })
        .map_err(HotError::Arm)?;

        Ok((pid, watch))
    }

    /// Stop a predecessor named by the pid file, if any
    async fn take_over(&self) -> Result<(), HotError> {
        let path = self.pid_file.path();

        if pidfile::old_exists(path) {
            log::debug!("Removing stale {:?}", pidfile::old_path(path));
            if let Err(e) = pidfile::remove_old(path) {
                log::warn!("{}", e);
            }
        }

        if !pidfile::exists(path) {
            log::debug!("No pid file at {:?}, nothing to take over", path);
            return Ok(());
        }

        let pid = pidfile::read_pid(path)?;
        if pid == getpid() {
            log::debug!("{:?} already names this process", path);
            return Ok(());
        }

        pidfile::move_to_old(path)?;

        match probe::find_process(pid).map(probe::probe) {
            Some(probe::Liveness::Alive) => {
                log::info!("Found pid {}, sending {}", pid, self.stop_signal);
                kill(pid, self.stop_signal)
                    .map_err(|source| HotError::SignalPredecessor { pid, source })?;
                tokio::time::sleep(self.grace_period).await;
            }
            Some(probe::Liveness::Unknown(e)) => log::warn!(
                "Cannot probe pid {} ({}), claiming {:?} without stopping it",
                pid,
                e,
                path
            ),
            _ => log::debug!("Pid {} is not running", pid),
        }

        if let Err(e) = pidfile::remove_old(path) {
            log::warn!("{}", e);
        }
        Ok(())
    }

    /// Like [`Hot::run`], returning the spawned worker without waiting for it
    pub async fn run_and_release(&mut self) -> Result<Option<Child>, HotError> {
        match self.run().await? {
            Outcome::Spawned(child) => Ok(Some(child)),
            Outcome::Served => Ok(None),
        }
    }

    /// Like [`Hot::run`], then wait for a spawned worker to exit
    pub async fn run_and_wait(&mut self) -> Result<(), HotError> {
        match self.run().await? {
            Outcome::Spawned(mut child) => {
                let status = child.wait().await.map_err(HotError::Wait)?;
                if status.success() {
                    Ok(())
                } else {
                    Err(HotError::Exited(status))
                }
            }
            Outcome::Served => Ok(()),
        }
    }

    /// Signal the spawned worker, or stop the local instance
    pub async fn stop(&self) -> Result<(), HotError> {
        self.stopper().stop().await
    }
}

/// Stops the process or instance a [`Hot`] is responsible for
pub enum Stopper<S> {
    /// Signal the spawned worker
    Process { launched: Launched, signal: Signal },
    /// Call the instance's stop directly, unless `run` failed before serving
    Instance {
        instance: Arc<S>,
        aborted: Arc<watch::Sender<bool>>,
    },
}

impl<S> Clone for Stopper<S> {
    fn clone(&self) -> Self {
        match self {
            Stopper::Process { launched, signal } => Stopper::Process {
                launched: launched.clone(),
                signal: *signal,
            },
            Stopper::Instance { instance, aborted } => Stopper::Instance {
                instance: Arc::clone(instance),
                aborted: Arc::clone(aborted),
            },
        }
    }
}

impl<S: Instance> Stopper<S> {
    /// Signal the worker, or stop the local instance and wait for its run to
    /// unwind. Also returns once `run` fails before the instance started,
    /// whether the stop was issued before or after that failure.
    pub async fn stop(&self) -> Result<(), HotError> {
        match self {
            Stopper::Process { launched, signal } => {
                let pid = launched.get().ok_or(LaunchError::NotLaunched)?;
                daemon::signal(pid, *signal)?;
                Ok(())
            }
            Stopper::Instance { instance, aborted } => {
                let mut aborted = aborted.subscribe();
                tokio::select! {
                    result = instance.stop() => result.map_err(HotError::Stop),
                    _ = aborted.wait_for(|aborted| *aborted) => Ok(()),
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HotError {
    #[error("Error preparing instance: {0}")]
    Prepare(#[source] InstanceError),

    #[error(transparent)]
    PidFile(#[from] PidFileError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("Failed to signal predecessor pid {pid}: {source}")]
    SignalPredecessor { pid: Pid, source: nix::Error },

    #[error("Failed to arm stop signal: {0}")]
    Arm(#[source] std::io::Error),

    #[error("Instance failed: {0}")]
    Instance(#[source] InstanceError),

    #[error("Instance failed to stop: {0}")]
    Stop(#[source] InstanceError),

    #[error("Failed to wait for spawned process: {0}")]
    Wait(#[source] std::io::Error),

    #[error("Spawned process exited with {0}")]
    Exited(ExitStatus),
}
