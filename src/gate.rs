//! Synchronous stop rendezvous for service instances
//!
//! `StopGate::stop` resolves only after the matching run has unwound:
//!
//! ```ignore
//! async fn run(&self) -> Result<(), InstanceError> {
//!     let guard = self.gate.begin();
//!     let listener = TcpListener::bind(addr).await?;
//!     tokio::select! {
//!         _ = guard.requested() => {}
//!         res = serve(&listener) => res?,
//!     }
//!     Ok(())
//!     // listener is dropped before guard, then stop() returns
//! }
//! ```

use tokio::sync::watch;

/// Lifecycle of the guarded run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug)]
pub struct StopGate {
    phase: watch::Sender<Phase>,
}

impl Default for StopGate {
    fn default() -> Self {
        Self::new()
    }
}

impl StopGate {
    pub fn new() -> Self {
        let (phase, _) = watch::channel(Phase::Idle);
        Self { phase }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Mark the run as started. A stop requested earlier stays pending and
    /// is reported by [`RunGuard::requested`] right away.
    pub fn begin(&self) -> RunGuard<'_> {
        self.phase.send_modify(|phase| {
            if *phase != Phase::Stopping {
                *phase = Phase::Running;
            }
        });
        RunGuard { gate: self }
    }

    /// Request a stop and wait until the run has unwound.
    ///
    /// Returns immediately if the run already finished. Before any run has
    /// begun the request is remembered and waits for that run to end, so it
    /// never returns if no run begins. `Stopper::stop` covers that case for
    /// runs started through `Hot`.
    pub async fn stop(&self) {
        let mut rx = self.phase.subscribe();
        self.phase.send_if_modified(|phase| match *phase {
            Phase::Idle | Phase::Running => {
                *phase = Phase::Stopping;
                true
            }
            Phase::Stopping | Phase::Stopped => false,
        });
        let _ = rx.wait_for(|phase| *phase == Phase::Stopped).await;
    }
}

/// Held by the run for its whole duration; dropping it completes pending stops
#[derive(Debug)]
pub struct RunGuard<'a> {
    gate: &'a StopGate,
}

impl RunGuard<'_> {
    /// Resolves once a stop has been requested
    pub async fn requested(&self) {
        let mut rx = self.gate.phase.subscribe();
        let _ = rx.wait_for(|phase| *phase == Phase::Stopping).await;
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.gate.phase.send_replace(Phase::Stopped);
    }
}
