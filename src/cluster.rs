//! The cluster API surface the controller consumes.
//!
//! Everything above this module talks to [`ClusterApi`] rather than to a
//! `kube_client::Client` directly, so the list-watch loop can run against
//! any source of list and watch responses.

use std::future::Future;

use futures::stream::BoxStream;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube_core::DynamicObject;

pub mod client;
pub use client::KubeCluster;

/// A full listing together with the checkpoint to watch from.
#[derive(Debug, Clone, Default)]
pub struct ObjectList {
    pub items: Vec<DynamicObject>,
    pub resource_version: String,
}

/// One change delivered by a watch stream.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(DynamicObject),
    Modified(DynamicObject),
    Deleted(DynamicObject),
    /// Advances the checkpoint without carrying an object change.
    Bookmark { resource_version: String },
}

impl WatchEvent {
    /// The resource version this event moves the checkpoint to.
    pub fn resource_version(&self) -> Option<&str> {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => {
                obj.metadata.resource_version.as_deref()
            }
            WatchEvent::Bookmark { resource_version } => Some(resource_version),
        }
    }
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, ApiError>>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("object already exists")]
    AlreadyExists,
    /// The cluster can no longer serve history from the requested checkpoint.
    #[error("resource version expired")]
    Expired,
    #[error("connection lost: {0}")]
    Disconnected(String),
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error(transparent)]
    Kube(kube_client::Error),
}

impl From<kube_client::Error> for ApiError {
    fn from(err: kube_client::Error) -> Self {
        match err {
            kube_client::Error::Api(resp) if resp.code == 409 => ApiError::AlreadyExists,
            kube_client::Error::Api(resp) if resp.code == 410 => ApiError::Expired,
            err => ApiError::Kube(err),
        }
    }
}

/// Operations the controller needs from the cluster.
pub trait ClusterApi: Send + Sync + 'static {
    /// Installs a resource definition. Fails with [`ApiError::AlreadyExists`]
    /// if one with the same name is already present.
    fn create_schema(
        &self,
        definition: &CustomResourceDefinition,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;

    /// Resolves once the named definition is being served.
    fn await_schema(&self, name: &str) -> impl Future<Output = Result<(), ApiError>> + Send;

    /// Lists all instances in scope.
    fn list(&self) -> impl Future<Output = Result<ObjectList, ApiError>> + Send;

    /// Opens a change stream starting after `resource_version`.
    fn watch(
        &self,
        resource_version: &str,
    ) -> impl Future<Output = Result<WatchStream, ApiError>> + Send;
}
