//! ingressgroup-controller keeps a live, eventually consistent local view of
//! every `IngressGroup` custom resource in a cluster.
//!
//! On start, the [`Controller`] registers the resource definition (a no-op if
//! a previous run already did), lists all existing instances into a
//! [`Store`], then watches for changes from the listing's resource version.
//! Each observed transition is delivered once to every registered
//! [`EventHandler`], in the order it was applied to the cache.
//! Disconnects and expired checkpoints are healed by relisting, which turns
//! anything missed into synthetic add, update or delete notifications.

pub mod cluster;
pub mod config;
pub use config::{BackoffConfig, ConnectConfig, ControllerConfig};
pub mod dispatcher;
pub use dispatcher::{EventHandler, HandlerFns, LogHandler};
pub mod list_watch;
pub mod registrar;
pub mod resource;
pub use resource::{IngressGroup, IngressGroupSpec, QualifiedName, ServiceItem};
mod runner;
pub use runner::{Controller, Phase, PhaseWatch, RunError};
pub mod store;
pub use store::{Store, Transition};

#[cfg(test)]
mod tests;
