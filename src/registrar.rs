//! Installs the `IngressGroup` definition into the cluster.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

use crate::cluster::{ApiError, ClusterApi};

/// Outcome of a successful [`register`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    /// A previous run already installed the definition.
    AlreadyExists,
}

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("definition has no name")]
    Unnamed,
    #[error("failed to create definition {name}: {source}")]
    Create {
        name: String,
        #[source]
        source: ApiError,
    },
    #[error("definition {name} is not being served: {source}")]
    NotReady {
        name: String,
        #[source]
        source: ApiError,
    },
}

/// Creates `definition` unless it already exists, then waits until the
/// cluster serves it.
pub async fn register<A: ClusterApi>(
    api: &A,
    definition: &CustomResourceDefinition,
) -> Result<Registration, RegisterError> {
    let name = definition
        .metadata
        .name
        .clone()
        .ok_or(RegisterError::Unnamed)?;

    let registration = match api.create_schema(definition).await {
        Ok(()) => {
            log::info!("Created custom resource definition {name}");
            Registration::Created
        }
        Err(ApiError::AlreadyExists) => {
            log::info!("Custom resource definition {name} is already created");
            Registration::AlreadyExists
        }
        Err(source) => return Err(RegisterError::Create { name, source }),
    };

    if let Err(source) = api.await_schema(&name).await {
        return Err(RegisterError::NotReady { name, source });
    }

    Ok(registration)
}
