//! The `IngressGroup` custom resource: a named grouping of backend service bindings.

use std::{borrow::Cow, collections::BTreeSet, fmt};

use k8s_openapi::{apimachinery::pkg::apis::meta::v1::ObjectMeta, NamespaceResourceScope};
use kube_core::{ApiResource, DynamicObject, Resource};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub mod schema;
pub use schema::ValidationError;

pub const GROUP: &str = "cr.ingress.nginx.io";
pub const VERSION: &str = "v1";
pub const KIND: &str = "IngressGroup";
pub const LIST_KIND: &str = "IngressGroupList";
pub const PLURAL: &str = "ingressgroups";
pub const SINGULAR: &str = "ingressgroup";
pub const SHORT_NAMES: &[&str] = &["ig"];
pub const CATEGORIES: &[&str] = &["all"];

/// A namespaced grouping of backend services.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngressGroup {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: IngressGroupSpec,
}

/// Desired state of an [`IngressGroup`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressGroupSpec {
    /// Bound services. Order carries no meaning.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceItem>,
}

/// Reference to a backend service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceItem {
    pub name: String,
    pub namespace: String,
}

impl ServiceItem {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl IngressGroup {
    pub fn new(namespace: &str, name: &str, spec: IngressGroupSpec) -> Self {
        Self {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some(namespace.to_owned()),
                ..ObjectMeta::default()
            },
            spec,
        }
    }

    /// The [`ApiResource`] used to address this type through dynamic APIs.
    pub fn api_resource() -> ApiResource {
        ApiResource::erase::<Self>(&())
    }

    /// The cluster-assigned resource version, if the object has been persisted.
    pub fn resource_version(&self) -> Option<&str> {
        self.metadata.resource_version.as_deref()
    }

    /// Converts back into the untyped wire shape.
    pub fn to_dynamic(&self) -> DynamicObject {
        let name = self.metadata.name.as_deref().unwrap_or_default();
        let mut obj = DynamicObject::new(name, &Self::api_resource()).data(json!({
            "spec": self.spec
        }));
        obj.metadata = self.metadata.clone();
        obj
    }
}

impl IngressGroupSpec {
    /// Checks the typed payload against the same rules the cluster enforces,
    /// so callers can fail fast before submitting.
    pub fn validate(&self) -> Result<(), ValidationError> {
        schema::validate_spec(&serde_json::to_value(self).map_err(|err| {
            ValidationError::new("", schema::Reason::Malformed(err.to_string()))
        })?)
    }

    /// Services bound more than once. The schema admits duplicates,
    /// reconciliation logic should reject them.
    pub fn duplicate_services(&self) -> Vec<&ServiceItem> {
        let mut seen = BTreeSet::new();
        let mut dups = BTreeSet::new();
        for item in &self.services {
            if !seen.insert(item) {
                dups.insert(item);
            }
        }
        dups.into_iter().collect()
    }
}

impl Resource for IngressGroup {
    type DynamicType = ();
    type Scope = NamespaceResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        KIND.into()
    }

    fn group(_: &()) -> Cow<'_, str> {
        GROUP.into()
    }

    fn version(_: &()) -> Cow<'_, str> {
        VERSION.into()
    }

    fn plural(_: &()) -> Cow<'_, str> {
        PLURAL.into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Failure to turn a raw cluster object into an [`IngressGroup`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("object has no name")]
    MissingName,
    #[error("invalid spec: {0}")]
    Invalid(#[from] ValidationError),
    #[error("spec is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl TryFrom<DynamicObject> for IngressGroup {
    type Error = DecodeError;

    fn try_from(obj: DynamicObject) -> Result<Self, Self::Error> {
        if obj.metadata.name.is_none() {
            return Err(DecodeError::MissingName);
        }

        let spec = match obj.data.get("spec") {
            None | Some(Value::Null) => IngressGroupSpec::default(),
            Some(spec) => {
                schema::validate_spec(spec)?;
                serde_json::from_value(spec.clone())?
            }
        };

        Ok(Self {
            metadata: obj.metadata,
            spec,
        })
    }
}

/// Uniquely identifies an object of a known type by namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QualifiedName {
    /// The object namespace, if any
    pub namespace: Option<String>,
    /// The object name
    pub name: String,
}

impl QualifiedName {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: Some(namespace.to_owned()),
            name: name.to_owned(),
        }
    }

    /// Returns `None` for objects that have not been given a name.
    pub fn from_meta(meta: &ObjectMeta) -> Option<Self> {
        Some(Self {
            namespace: meta.namespace.clone(),
            name: meta.name.clone()?,
        })
    }

    pub fn from_resource<K: Resource>(resource: &K) -> Option<Self> {
        Self::from_meta(resource.meta())
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{namespace}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}
