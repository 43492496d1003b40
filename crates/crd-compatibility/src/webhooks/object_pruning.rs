//! Prunes custom resources down to the schema of a [`CompatibilityRequirement`].
//!
//! [`CompatibilityRequirement`]: crate::crd::CompatibilityRequirement
use std::sync::Arc;

use kube::core::{
    DynamicObject,
    admission::{AdmissionRequest, AdmissionResponse, Operation},
};
use serde_json::Value;
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::instrument;

use crate::{
    cache::{self, StructuralSchemaCache},
    pruning::prune_object,
    schema::StructuralSchema,
    store::{self, CompatibilityRequirementStore},
    webhooks::full_error_message,
};

/// Top-level fields which are never pruned.
const PRESERVED_FIELDS: [&str; 3] = ["apiVersion", "kind", "metadata"];

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get the CompatibilityRequirement"))]
    GetRequirement { source: store::Error },

    #[snafu(display("failed to get the structural schema"))]
    StructuralSchema { source: cache::Error },

    #[snafu(display("the {operation} admission request carries no object"))]
    MissingObject { operation: String },

    #[snafu(display("failed to serialize the object"))]
    SerializeObject { source: serde_json::Error },

    #[snafu(display("the object is not a JSON object"))]
    NotAnObject,
}

impl Error {
    /// The HTTP status code to answer with, if the error originates from the Kubernetes API.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::GetRequirement { source } => source.status_code(),
            _ => None,
        }
    }
}

pub struct ObjectPruningWebhook {
    store: Arc<dyn CompatibilityRequirementStore>,
    cache: StructuralSchemaCache,
}

impl ObjectPruningWebhook {
    pub fn new(store: Arc<dyn CompatibilityRequirementStore>) -> Self {
        Self {
            store,
            cache: StructuralSchemaCache::new(),
        }
    }

    /// Returns the compiled schema of `version` for the requirement named `requirement_name`.
    pub async fn structural_schema(
        &self,
        requirement_name: &str,
        version: &str,
    ) -> Result<Arc<StructuralSchema>, Error> {
        let requirement = self
            .store
            .requirement(requirement_name)
            .await
            .context(GetRequirementSnafu)?;

        self.cache
            .get_or_compile(&requirement, version)
            .context(StructuralSchemaSnafu)
    }

    /// Returns `object` with all fields removed which the schema of `requirement_name` does not
    /// declare for the API version of the object. `default_version` is used if the object does not
    /// carry an apiVersion.
    pub async fn prune(
        &self,
        requirement_name: &str,
        object: &DynamicObject,
        default_version: &str,
    ) -> Result<Value, Error> {
        let version = object
            .types
            .as_ref()
            .map(|types| api_version_to_version(&types.api_version))
            .unwrap_or(default_version);
        let schema = self.structural_schema(requirement_name, version).await?;

        let Value::Object(mut fields) = serde_json::to_value(object).context(SerializeObjectSnafu)?
        else {
            return NotAnObjectSnafu.fail();
        };

        let preserved: Vec<(String, Value)> = PRESERVED_FIELDS
            .iter()
            .filter_map(|field| fields.remove_entry(*field))
            .collect();
        prune_object(&mut fields, &schema);
        fields.extend(preserved);

        Ok(Value::Object(fields))
    }

    /// Answers an [`AdmissionRequest`] for an object governed by the requirement named
    /// `requirement_name` with a JSON patch removing all undeclared fields.
    #[instrument(
        skip(self, request),
        fields(compatibility_requirement = requirement_name, operation = ?request.operation)
    )]
    pub async fn handle(
        &self,
        requirement_name: &str,
        request: &AdmissionRequest<DynamicObject>,
    ) -> AdmissionResponse {
        let response = AdmissionResponse::from(request);
        if matches!(request.operation, Operation::Delete) {
            return response;
        }

        let patch = match self.pruning_patch(requirement_name, request).await {
            Ok(patch) => patch,
            Err(error) => {
                tracing::info!(
                    error = &error as &dyn std::error::Error,
                    "failed to prune object"
                );

                let code = error.status_code();
                let mut response = response.deny(full_error_message(&error));
                if let Some(code) = code {
                    response.result.code = code;
                }
                return response;
            }
        };

        tracing::debug!(operations = patch.0.len(), "pruned object");
        match response.with_patch(patch) {
            Ok(response) => response,
            Err(error) => AdmissionResponse::from(request)
                .deny(format!("failed to serialize the JSON patch: {error}")),
        }
    }

    async fn pruning_patch(
        &self,
        requirement_name: &str,
        request: &AdmissionRequest<DynamicObject>,
    ) -> Result<json_patch::Patch, Error> {
        let object = request.object.as_ref().context(MissingObjectSnafu {
            operation: format!("{:?}", request.operation),
        })?;

        let original = serde_json::to_value(object).context(SerializeObjectSnafu)?;
        let pruned = self
            .prune(requirement_name, object, &request.kind.version)
            .await?;

        Ok(json_patch::diff(&original, &pruned))
    }
}

/// Extracts the version from an apiVersion such as `example.com/v1` or `v1`.
fn api_version_to_version(api_version: &str) -> &str {
    api_version
        .rsplit_once('/')
        .map_or(api_version, |(_, version)| version)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::{
        cache::test_utils::{WIDGET_CRD, requirement_with_crd},
        store::test_utils::StaticStore,
    };

    fn webhook() -> ObjectPruningWebhook {
        ObjectPruningWebhook::new(Arc::new(StaticStore::new([requirement_with_crd(
            "widgets", 1, WIDGET_CRD,
        )])))
    }

    fn widget() -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": {
                "name": "my-widget",
                "namespace": "default",
                "labels": { "app": "widget" }
            },
            "spec": { "allowedField": "kept", "unknownField": "removed" },
            "status": { "phase": "Running", "unknownStatus": 1 },
            "unknownTopLevel": true
        }))
        .expect("test object is valid")
    }

    fn admission_request(
        operation: &str,
        object: Option<DynamicObject>,
    ) -> AdmissionRequest<DynamicObject> {
        let review: kube::core::admission::AdmissionReview<DynamicObject> =
            serde_json::from_value(json!({
                "apiVersion": "admission.k8s.io/v1",
                "kind": "AdmissionReview",
                "request": {
                    "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                    "kind": { "group": "example.com", "version": "v1", "kind": "Widget" },
                    "resource": { "group": "example.com", "version": "v1", "resource": "widgets" },
                    "name": "my-widget",
                    "namespace": "default",
                    "operation": operation,
                    "userInfo": { "username": "admin" },
                    "object": object,
                    "oldObject": widget(),
                    "dryRun": false
                }
            }))
            .expect("test review is valid");

        review.try_into().expect("review carries a request")
    }

    #[rstest]
    #[case("example.com/v1", "v1")]
    #[case("v1", "v1")]
    #[case("apps.example.com/v1beta2", "v1beta2")]
    fn versions_from_api_versions(#[case] api_version: &str, #[case] expected: &str) {
        assert_eq!(api_version_to_version(api_version), expected);
    }

    #[tokio::test]
    async fn prune_keeps_declared_fields_and_identity() {
        let pruned = webhook()
            .prune("widgets", &widget(), "v1")
            .await
            .expect("object can be pruned");

        assert_eq!(
            pruned,
            json!({
                "apiVersion": "example.com/v1",
                "kind": "Widget",
                "metadata": {
                    "name": "my-widget",
                    "namespace": "default",
                    "labels": { "app": "widget" }
                },
                "spec": { "allowedField": "kept" },
                "status": { "phase": "Running" }
            })
        );
    }

    #[tokio::test]
    async fn create_is_answered_with_patch() {
        let response = webhook()
            .handle("widgets", &admission_request("CREATE", Some(widget())))
            .await;

        assert!(response.allowed);
        let patch: Vec<Value> = serde_json::from_slice(
            response.patch.as_deref().expect("response carries a patch"),
        )
        .expect("patch is valid JSON");

        let mut paths: Vec<&str> = patch
            .iter()
            .map(|operation| operation["path"].as_str().expect("operations have a path"))
            .collect();
        paths.sort();
        assert_eq!(
            paths,
            vec!["/spec/unknownField", "/status/unknownStatus", "/unknownTopLevel"]
        );
    }

    #[tokio::test]
    async fn delete_is_always_admitted() {
        let response = webhook()
            .handle("does-not-exist", &admission_request("DELETE", None))
            .await;

        assert!(response.allowed);
        assert!(response.patch.is_none());
    }

    #[tokio::test]
    async fn missing_requirement_is_forwarded() {
        let response = webhook()
            .handle("does-not-exist", &admission_request("UPDATE", Some(widget())))
            .await;

        assert!(!response.allowed);
        assert_eq!(response.result.code, 404);
    }

    #[tokio::test]
    async fn missing_version_schema_is_denied() {
        let mut object = widget();
        if let Some(types) = object.types.as_mut() {
            types.api_version = "example.com/v2".to_owned();
        }

        let response = webhook()
            .handle("widgets", &admission_request("CREATE", Some(object)))
            .await;

        assert!(!response.allowed);
        assert!(
            response
                .result
                .message
                .contains("has no openAPIV3Schema"),
            "unexpected message: {}",
            response.result.message
        );
    }

    #[tokio::test]
    async fn structural_schemas_are_cached() {
        let webhook = webhook();

        let first = webhook
            .structural_schema("widgets", "v1")
            .await
            .expect("schema compiles");
        let second = webhook
            .structural_schema("widgets", "v1")
            .await
            .expect("schema is cached");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(webhook.cache.len(), 1);
    }
}
