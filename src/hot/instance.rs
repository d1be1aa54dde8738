//! Service instance contract
//!
//! The orchestrator drives an [`Instance`] through `run` and `stop`. An
//! instance that needs a setup step before serving also implements
//! [`Prepare`] and is wrapped with [`Service::prepared`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Error type returned by service instances
pub type InstanceError = Box<dyn std::error::Error + Send + Sync>;

pub type BoxFuture<'a> = Pin<Box<dyn Future<Output = Result<(), InstanceError>> + Send + 'a>>;

/// A long-running service managed by the orchestrator
pub trait Instance: Send + Sync + 'static {
    /// Serve until stopped or failed
    fn run(&self) -> impl Future<Output = Result<(), InstanceError>> + Send;

    /// Make a concurrent `run` return. Must not resolve before `run` has
    /// fully unwound.
    fn stop(&self) -> impl Future<Output = Result<(), InstanceError>> + Send;
}

/// Optional setup hook, called once before the pid file handoff
pub trait Prepare: Instance {
    fn prepare(&self) -> impl Future<Output = Result<(), InstanceError>> + Send;
}

/// Type-erased call of [`Prepare::prepare`]
pub type PrepareFn<S> = for<'a> fn(&'a S) -> BoxFuture<'a>;

fn prepare_hook<S: Prepare>(instance: &S) -> BoxFuture<'_> {
    Box::pin(instance.prepare())
}

/// A service instance with its capabilities
pub enum Service<S> {
    /// Run and stop only
    Plain(Arc<S>),
    /// Run, stop and prepare
    Prepared(Arc<S>, PrepareFn<S>),
}

impl<S: Instance> Service<S> {
    pub fn plain(instance: S) -> Self {
        Service::Plain(Arc::new(instance))
    }

    pub fn prepared(instance: S) -> Self
    where
        S: Prepare,
    {
        Service::Prepared(Arc::new(instance), prepare_hook::<S>)
    }

    pub fn instance(&self) -> &Arc<S> {
        match self {
            Service::Plain(instance) | Service::Prepared(instance, _) => instance,
        }
    }

    pub fn can_prepare(&self) -> bool {
        matches!(self, Service::Prepared(..))
    }

    /// Run the prepare hook if the instance has one
    pub async fn prepare(&self) -> Result<(), InstanceError> {
        match self {
            Service::Plain(_) => Ok(()),
            Service::Prepared(instance, hook) => hook(instance.as_ref()).await,
        }
    }
}

impl<S> Clone for Service<S> {
    fn clone(&self) -> Self {
        match self {
            Service::Plain(instance) => Service::Plain(Arc::clone(instance)),
            Service::Prepared(instance, hook) => Service::Prepared(Arc::clone(instance), *hook),
        }
    }
}
