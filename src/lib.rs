//! hot-restart - zero-downtime restarts through a PID file handoff
//!
//! A new instance of a service finds the running one through a PID file,
//! asks it to stop with a signal, waits a short grace period and takes the
//! slot over. Upgrading the binary or its config never leaves a window with
//! no instance running, but the handoff is best-effort: the predecessor's
//! release of shared resources is not confirmed.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                  Hot (orchestrator)              │
//! ├─────────────────────────────────────────────────┤
//! │  Daemon (launcher) │  PidFile  │  Signal bridge │
//! ├─────────────────────────────────────────────────┤
//! │            Service Instance (run / stop)         │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod daemon;
pub mod gate;
pub mod hot;
pub mod pidfile;
pub mod signal;

pub use config::{DaemonConfig, HotConfig};
pub use daemon::{Daemon, Role, StreamBinding, Streams};
pub use gate::StopGate;
pub use hot::{Hot, HotError, Instance, InstanceError, Outcome, Prepare, Service, Stopper};
pub use pidfile::PidFile;
