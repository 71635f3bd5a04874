use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube_client::{
    api::{ListParams, PostParams, WatchParams},
    config::{InferConfigError, KubeConfigOptions, Kubeconfig, KubeconfigError},
    Api, Client, Config,
};
use kube_core::DynamicObject;
use kube_runtime::wait::{await_condition, conditions};

use super::{ApiError, ClusterApi, ObjectList, WatchEvent, WatchStream};
use crate::config::{ConnectConfig, ControllerConfig};
use crate::resource::IngressGroup;

/// [`ClusterApi`] backed by a live API server.
#[derive(Clone)]
pub struct KubeCluster {
    objects: Api<DynamicObject>,
    definitions: Api<CustomResourceDefinition>,
    establish_timeout: Duration,
    watch_timeout_secs: u32,
}

impl KubeCluster {
    /// Scopes list and watch calls to the configured namespace, or to all
    /// namespaces.
    pub fn new(client: Client, config: &ControllerConfig) -> Self {
        let resource = IngressGroup::api_resource();
        let objects = match config.namespace.as_deref() {
            Some(namespace) => Api::namespaced_with(client.clone(), namespace, &resource),
            None => Api::all_with(client.clone(), &resource),
        };

        Self {
            objects,
            definitions: Api::all(client),
            establish_timeout: config.establish_timeout,
            watch_timeout_secs: config.watch_timeout_secs,
        }
    }

    /// Builds a client from the connection parameters and checks that the
    /// API server answers.
    pub async fn connect(config: &ConnectConfig) -> Result<Client, ConnectError> {
        let mut kube_config = match &config.kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
            }
            None => Config::infer().await?,
        };

        if let Some(master) = &config.master {
            kube_config.cluster_url = master.parse().map_err(|err| ConnectError::Master {
                url: master.clone(),
                reason: format!("{err}"),
            })?;
        }

        let client = Client::try_from(kube_config).map_err(ConnectError::Client)?;
        let version = client
            .apiserver_version()
            .await
            .map_err(ConnectError::Unreachable)?;
        log::info!("Connected to API server {}", version.git_version);

        Ok(client)
    }
}

impl ClusterApi for KubeCluster {
    async fn create_schema(&self, definition: &CustomResourceDefinition) -> Result<(), ApiError> {
        self.definitions
            .create(&PostParams::default(), definition)
            .await?;
        Ok(())
    }

    async fn await_schema(&self, name: &str) -> Result<(), ApiError> {
        let established = await_condition(
            self.definitions.clone(),
            name,
            conditions::is_crd_established(),
        );

        match tokio::time::timeout(self.establish_timeout, established).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(ApiError::Disconnected(err.to_string())),
            Err(_) => Err(ApiError::Timeout(format!("definition {name} to be established"))),
        }
    }

    async fn list(&self) -> Result<ObjectList, ApiError> {
        let list = self.objects.list(&ListParams::default()).await?;
        Ok(ObjectList {
            resource_version: list.metadata.resource_version.unwrap_or_default(),
            items: list.items,
        })
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream, ApiError> {
        let params = WatchParams::default().timeout(self.watch_timeout_secs);
        let stream = self.objects.watch(&params, resource_version).await?;

        Ok(stream
            .map(|event| match event {
                Ok(kube_core::WatchEvent::Added(obj)) => Ok(WatchEvent::Added(obj)),
                Ok(kube_core::WatchEvent::Modified(obj)) => Ok(WatchEvent::Modified(obj)),
                Ok(kube_core::WatchEvent::Deleted(obj)) => Ok(WatchEvent::Deleted(obj)),
                Ok(kube_core::WatchEvent::Bookmark(bookmark)) => Ok(WatchEvent::Bookmark {
                    resource_version: bookmark.metadata.resource_version,
                }),
                Ok(kube_core::WatchEvent::Error(resp)) => {
                    Err(ApiError::from(kube_client::Error::Api(resp)))
                }
                Err(err) => Err(ApiError::from(err)),
            })
            .boxed())
    }
}

/// Fatal startup failures while establishing the cluster connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("failed to infer cluster configuration: {0}")]
    Infer(#[from] InferConfigError),
    #[error("failed to load kubeconfig: {0}")]
    Kubeconfig(#[from] KubeconfigError),
    #[error("invalid master URL {url:?}: {reason}")]
    Master { url: String, reason: String },
    #[error("invalid API configuration: {0}")]
    Client(#[source] kube_client::Error),
    #[error("API server unreachable: {0}")]
    Unreachable(#[source] kube_client::Error),
}
