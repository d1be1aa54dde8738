//! Signal bridge
//!
//! Turns one OS signal into a single call of a caller-supplied handler.
//! The watcher is one-shot: after the handler has run, further deliveries of
//! the same signal are not observed (tokio keeps its OS handler installed, so
//! they are swallowed rather than terminating the process).

use nix::sys::signal::Signal;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;

/// Registered interest in one signal
pub struct Subscription {
    signal: Signal,
    inner: tokio::signal::unix::Signal,
}

/// Register interest in `sig`. Must be called within a tokio runtime.
pub fn arm(sig: Signal) -> io::Result<Subscription> {
    let inner = signal(SignalKind::from_raw(sig as libc::c_int))?;
    Ok(Subscription { signal: sig, inner })
}

impl Subscription {
    pub fn signal(&self) -> Signal {
        self.signal
    }

    /// Wait for the next delivery. Returns `None` once the runtime's signal
    /// driver is gone.
    pub async fn recv(&mut self) -> Option<()> {
        self.inner.recv().await
    }
}

/// Background watcher spawned by [`watch_and_handle`]
pub struct Watch {
    signal: Signal,
    fired: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Arm `sig` and run `handler` once on a background task when it arrives.
///
/// Arming happens before this returns, so a signal sent right after is not lost.
pub fn watch_and_handle<F, Fut>(sig: Signal, handler: F) -> io::Result<Watch>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut subscription = arm(sig)?;
    let fired = Arc::new(AtomicBool::new(false));
    let task_fired = Arc::clone(&fired);

    let handle = tokio::spawn(async move {
        if subscription.recv().await.is_none() {
            return;
        }
        task_fired.store(true, Ordering::SeqCst);
        log::debug!("Received {} (pid={})", sig, std::process::id());
        handler().await;
        // Subscription is dropped here; no re-arm
    });

    Ok(Watch {
        signal: sig,
        fired,
        handle,
    })
}

impl Watch {
    pub fn signal(&self) -> Signal {
        self.signal
    }

    /// Whether the signal has been delivered and the handler started
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Wind the watcher down.
    ///
    /// A handler that already started is awaited to completion; a watcher
    /// still waiting for delivery is cancelled.
    pub async fn settle(self) {
        if self.has_fired() {
            if let Err(e) = self.handle.await {
                log::warn!("Stop handler for {} failed: {}", self.signal, e);
            }
        } else {
            self.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_arm_rejects_forbidden_signal() {
        assert!(arm(Signal::SIGKILL).is_err());
    }

    #[tokio::test]
    async fn test_unfired_watch_is_cancelled() {
        // SIGWINCH is harmless and never sent in tests
        let watch = watch_and_handle(Signal::SIGWINCH, || async {
            panic!("handler must not run");
        })
        .unwrap();
        assert_eq!(watch.signal(), Signal::SIGWINCH);
        assert!(!watch.has_fired());
        watch.settle().await;
    }

    // The only test in this binary that raises SIGUSR2
    #[tokio::test]
    async fn test_handler_runs_once() {
        use nix::sys::signal::kill;
        use nix::unistd::getpid;
        use std::sync::atomic::AtomicU32;
        use std::time::Duration;

        let calls = Arc::new(AtomicU32::new(0));
        let handler_calls = Arc::clone(&calls);
        let watch = watch_and_handle(Signal::SIGUSR2, move || async move {
            handler_calls.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        kill(getpid(), Signal::SIGUSR2).unwrap();
        for _ in 0..200 {
            if watch.has_fired() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(watch.has_fired());
        watch.settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Second delivery is swallowed, not re-handled
        kill(getpid(), Signal::SIGUSR2).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
