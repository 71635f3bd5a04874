//! Structural rules for `IngressGroupSpec`.
//!
//! The same field table drives both the OpenAPI schema published with the
//! [`CustomResourceDefinition`] and the client-side [`validate_spec`] check,
//! so the two cannot drift apart.

use std::{collections::BTreeMap, fmt};

use k8s_openapi::{
    apiextensions_apiserver::pkg::apis::apiextensions::v1::{
        CustomResourceDefinition, CustomResourceDefinitionNames, CustomResourceDefinitionSpec,
        CustomResourceDefinitionVersion, CustomResourceValidation, JSONSchemaProps,
        JSONSchemaPropsOrArray,
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use serde_json::Value;

use super::{CATEGORIES, GROUP, KIND, LIST_KIND, PLURAL, SHORT_NAMES, SINGULAR, VERSION};

/// Required non-empty string fields of every `spec.services[]` entry.
pub const SERVICE_ITEM_FIELDS: &[&str] = &["name", "namespace"];

/// Why a field failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    Required,
    Empty,
    WrongType { expected: &'static str },
    Malformed(String),
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::Required => f.write_str("required"),
            Reason::Empty => f.write_str("must not be empty"),
            Reason::WrongType { expected } => write!(f, "expected {expected}"),
            Reason::Malformed(msg) => f.write_str(msg),
        }
    }
}

/// A field path relative to the spec, plus the rule it broke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub path: String,
    pub reason: Reason,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, reason: Reason) -> Self {
        Self {
            path: path.into(),
            reason,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.reason)
        } else {
            write!(f, "{}: {}", self.path, self.reason)
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validates a candidate spec payload, reporting the first offending field.
pub fn validate_spec(spec: &Value) -> Result<(), ValidationError> {
    let Value::Object(spec) = spec else {
        return Err(ValidationError::new(
            "",
            Reason::WrongType { expected: "object" },
        ));
    };

    let services = match spec.get("services") {
        None | Some(Value::Null) => return Ok(()),
        Some(Value::Array(services)) => services,
        Some(_) => {
            return Err(ValidationError::new(
                "services",
                Reason::WrongType { expected: "array" },
            ))
        }
    };

    for (i, item) in services.iter().enumerate() {
        let Value::Object(item) = item else {
            return Err(ValidationError::new(
                format!("services[{i}]"),
                Reason::WrongType { expected: "object" },
            ));
        };

        for &field in SERVICE_ITEM_FIELDS {
            let reason = match item.get(field) {
                None | Some(Value::Null) => Reason::Required,
                Some(Value::String(value)) if value.is_empty() => Reason::Empty,
                Some(Value::String(_)) => continue,
                Some(_) => Reason::WrongType { expected: "string" },
            };
            return Err(ValidationError::new(
                format!("services[{i}].{field}"),
                reason,
            ));
        }
    }

    Ok(())
}

/// Name of the definition object, `<plural>.<group>`.
pub fn definition_name() -> String {
    format!("{PLURAL}.{GROUP}")
}

/// The namespaced `IngressGroup` definition registered with the cluster.
pub fn definition() -> CustomResourceDefinition {
    CustomResourceDefinition {
        metadata: ObjectMeta {
            name: Some(definition_name()),
            ..ObjectMeta::default()
        },
        spec: CustomResourceDefinitionSpec {
            group: GROUP.to_owned(),
            names: CustomResourceDefinitionNames {
                kind: KIND.to_owned(),
                list_kind: Some(LIST_KIND.to_owned()),
                plural: PLURAL.to_owned(),
                singular: Some(SINGULAR.to_owned()),
                short_names: Some(SHORT_NAMES.iter().map(|&s| s.to_owned()).collect()),
                categories: Some(CATEGORIES.iter().map(|&s| s.to_owned()).collect()),
            },
            scope: "Namespaced".to_owned(),
            versions: vec![CustomResourceDefinitionVersion {
                name: VERSION.to_owned(),
                served: true,
                storage: true,
                schema: Some(CustomResourceValidation {
                    open_api_v3_schema: Some(open_api_schema()),
                }),
                ..CustomResourceDefinitionVersion::default()
            }],
            ..CustomResourceDefinitionSpec::default()
        },
        status: None,
    }
}

fn typed(type_: &str) -> JSONSchemaProps {
    JSONSchemaProps {
        type_: Some(type_.to_owned()),
        ..JSONSchemaProps::default()
    }
}

fn object(properties: impl IntoIterator<Item = (&'static str, JSONSchemaProps)>) -> JSONSchemaProps {
    JSONSchemaProps {
        properties: Some(
            properties
                .into_iter()
                .map(|(name, props)| (name.to_owned(), props))
                .collect::<BTreeMap<_, _>>(),
        ),
        ..typed("object")
    }
}

fn open_api_schema() -> JSONSchemaProps {
    let service_item = JSONSchemaProps {
        required: Some(SERVICE_ITEM_FIELDS.iter().map(|&s| s.to_owned()).collect()),
        ..object(SERVICE_ITEM_FIELDS.iter().map(|&field| {
            (
                field,
                JSONSchemaProps {
                    min_length: Some(1),
                    ..typed("string")
                },
            )
        }))
    };

    let services = JSONSchemaProps {
        items: Some(JSONSchemaPropsOrArray::Schema(Box::new(service_item))),
        ..typed("array")
    };

    object([("spec", object([("services", services)]))])
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn accepts_empty_and_populated_specs() {
        validate_spec(&json!({})).unwrap();
        validate_spec(&json!({"services": []})).unwrap();
        validate_spec(&json!({"services": [
            {"name": "svc1", "namespace": "default"},
            {"name": "svc1", "namespace": "default"}
        ]}))
        .unwrap();
    }

    #[test]
    fn reports_field_paths() {
        let cases = [
            (json!([]), "expected object"),
            (json!({"services": {}}), "services: expected array"),
            (json!({"services": ["svc1"]}), "services[0]: expected object"),
            (
                json!({"services": [{"namespace": "default"}]}),
                "services[0].name: required",
            ),
            (
                json!({"services": [
                    {"name": "svc1", "namespace": "default"},
                    {"name": "svc2", "namespace": "default"},
                    {"name": "svc3"}
                ]}),
                "services[2].namespace: required",
            ),
            (
                json!({"services": [{"name": "svc1", "namespace": ""}]}),
                "services[0].namespace: must not be empty",
            ),
            (
                json!({"services": [{"name": 1, "namespace": "default"}]}),
                "services[0].name: expected string",
            ),
        ];

        for (spec, expected) in cases {
            assert_eq!(validate_spec(&spec).unwrap_err().to_string(), expected);
        }
    }

    #[test]
    fn typed_spec_fails_fast_on_empty_fields() {
        let spec = crate::resource::IngressGroupSpec {
            services: vec![crate::resource::ServiceItem::new("default", "")],
        };
        let err = spec.validate().unwrap_err();
        assert_eq!(err.path, "services[0].name");
        assert_eq!(err.reason, Reason::Empty);
    }

    #[test]
    fn definition_publishes_names_and_rules() {
        let crd = definition();
        assert_eq!(crd.metadata.name.as_deref(), Some("ingressgroups.cr.ingress.nginx.io"));
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(crd.spec.names.plural, "ingressgroups");
        assert_eq!(crd.spec.names.short_names, Some(vec!["ig".to_owned()]));

        let schema = crd.spec.versions[0]
            .schema
            .as_ref()
            .and_then(|s| s.open_api_v3_schema.as_ref())
            .unwrap();
        let services = &schema.properties.as_ref().unwrap()["spec"]
            .properties
            .as_ref()
            .unwrap()["services"];
        let Some(JSONSchemaPropsOrArray::Schema(item)) = &services.items else {
            panic!("services items must be a single schema");
        };
        assert_eq!(
            item.required,
            Some(vec!["name".to_owned(), "namespace".to_owned()])
        );
    }
}
