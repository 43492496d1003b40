//! Validates changes to CustomResourceDefinitions against all [`CompatibilityRequirement`]s
//! referring to them.
use std::sync::Arc;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    ResourceExt,
    core::admission::{AdmissionRequest, AdmissionResponse, Operation},
};
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::instrument;

use crate::{
    checker::{self, Findings, SchemaCompatibilityChecker},
    crd::{self, CompatibilityRequirement, ValidationAction},
    schema::{excluded_fields, prune_excluded_fields},
    store::{self, CompatibilityRequirementStore},
    webhooks::full_error_message,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("the {operation:?} admission request carries no CustomResourceDefinition"))]
    MissingObject { operation: String },

    #[snafu(display(
        "failed to look up CompatibilityRequirements for CustomResourceDefinition {crd_name:?}"
    ))]
    ListRequirements {
        source: store::Error,
        crd_name: String,
    },

    #[snafu(display("failed to read the compatibility schema"))]
    ReadCompatibilitySchema { source: crd::Error },

    #[snafu(display(
        "failed to remove the excluded fields of CompatibilityRequirement {requirement:?}"
    ))]
    PruneExcludedFields {
        source: excluded_fields::Errors,
        requirement: String,
    },

    #[snafu(display("failed to check compatibility with CompatibilityRequirement {requirement:?}"))]
    CheckCompatibility {
        source: checker::Error,
        requirement: String,
    },

    #[snafu(display(
        "CompatibilityRequirement {requirement:?} uses an unknown schema validation action"
    ))]
    UnknownValidationAction { requirement: String },

    #[snafu(display("{}", errors.join("\n")))]
    Incompatible { errors: Vec<String> },

    #[snafu(display(
        "CustomResourceDefinition {crd_name:?} cannot be deleted, it is referenced by the CompatibilityRequirements {}",
        requirements.join(", ")
    ))]
    ReferencedByRequirements {
        crd_name: String,
        requirements: Vec<String>,
    },
}

/// A denied change, together with the warnings collected up to that point.
#[derive(Debug)]
pub struct Denial {
    pub warnings: Vec<String>,
    pub error: Error,
}

impl From<Error> for Denial {
    fn from(error: Error) -> Self {
        Self {
            warnings: Vec::new(),
            error,
        }
    }
}

pub struct CrdValidationWebhook {
    store: Arc<dyn CompatibilityRequirementStore>,
    checker: SchemaCompatibilityChecker,
}

impl CrdValidationWebhook {
    pub fn new(
        store: Arc<dyn CompatibilityRequirementStore>,
        checker: SchemaCompatibilityChecker,
    ) -> Self {
        Self { store, checker }
    }

    /// Validates a newly created CustomResourceDefinition. Returns the warnings to send back to
    /// the client on success.
    pub async fn validate_create(
        &self,
        crd: &CustomResourceDefinition,
    ) -> Result<Vec<String>, Denial> {
        self.validate_crd(crd).await
    }

    /// Validates an updated CustomResourceDefinition. Only the new object is relevant, the
    /// requirements describe the reference schema.
    pub async fn validate_update(
        &self,
        _old_crd: &CustomResourceDefinition,
        crd: &CustomResourceDefinition,
    ) -> Result<Vec<String>, Denial> {
        self.validate_crd(crd).await
    }

    /// Denies the deletion of a CustomResourceDefinition which is still referenced by any
    /// requirement.
    pub async fn validate_delete(
        &self,
        crd: &CustomResourceDefinition,
    ) -> Result<Vec<String>, Denial> {
        let crd_name = crd.name_any();
        let requirements = self
            .store
            .requirements_for_crd(&crd_name)
            .await
            .context(ListRequirementsSnafu {
                crd_name: &crd_name,
            })?;

        if requirements.is_empty() {
            return Ok(Vec::new());
        }

        let mut requirements: Vec<String> = requirements
            .iter()
            .map(|requirement| requirement.name_any())
            .collect();
        requirements.sort();

        Err(Error::ReferencedByRequirements {
            crd_name,
            requirements,
        }
        .into())
    }

    async fn validate_crd(&self, crd: &CustomResourceDefinition) -> Result<Vec<String>, Denial> {
        let crd_name = crd.name_any();
        let requirements = self
            .store
            .requirements_for_crd(&crd_name)
            .await
            .context(ListRequirementsSnafu {
                crd_name: &crd_name,
            })?;

        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        for requirement in requirements {
            let validation = &requirement.spec.custom_resource_definition_schema_validation;
            if validation.is_unset() {
                tracing::debug!(
                    k8s.crd.name = %crd_name,
                    compatibility_requirement = %requirement.name_any(),
                    "schema validation is not configured, skipping requirement"
                );
                continue;
            }

            let findings =
                check_requirement(&self.checker, &requirement, crd).map_err(|error| Denial {
                    warnings: warnings.clone(),
                    error,
                })?;
            let Some(findings) = findings else {
                continue;
            };

            let prefix = format!(
                "This requirement was added by CompatibilityRequirement {}: ",
                requirement.name_any()
            );
            let Findings {
                errors: requirement_errors,
                warnings: requirement_warnings,
            } = findings;

            match validation.action {
                Some(ValidationAction::Deny) => {
                    errors.extend(
                        requirement_errors
                            .into_iter()
                            .map(|e| format!("{prefix}{e}")),
                    );
                    warnings.extend(
                        requirement_warnings
                            .into_iter()
                            .map(|w| format!("{prefix}{w}")),
                    );
                }
                Some(ValidationAction::Warn) => {
                    warnings.extend(
                        requirement_errors
                            .into_iter()
                            .chain(requirement_warnings)
                            .map(|w| format!("{prefix}{w}")),
                    );
                }
                // `None` never gets here, unset validations are skipped above
                Some(ValidationAction::Unknown) | None => {
                    return Err(Denial {
                        warnings,
                        error: Error::UnknownValidationAction {
                            requirement: requirement.name_any(),
                        },
                    });
                }
            }
        }

        if errors.is_empty() {
            Ok(warnings)
        } else {
            Err(Denial {
                warnings,
                error: Error::Incompatible { errors },
            })
        }
    }

    /// Answers an [`AdmissionRequest`] for a CustomResourceDefinition.
    #[instrument(
        skip(self, request),
        fields(k8s.crd.name = %request.name, operation = ?request.operation)
    )]
    pub async fn handle(
        &self,
        request: &AdmissionRequest<CustomResourceDefinition>,
    ) -> AdmissionResponse {
        let response = AdmissionResponse::from(request);

        match self.validate_request(request).await {
            Ok(warnings) => {
                tracing::debug!(warnings = warnings.len(), "admitting CustomResourceDefinition");
                with_warnings(response, warnings)
            }
            Err(Denial { warnings, error }) => {
                tracing::info!(
                    error = &error as &dyn std::error::Error,
                    "denying CustomResourceDefinition"
                );
                with_warnings(response, warnings).deny(full_error_message(&error))
            }
        }
    }

    async fn validate_request(
        &self,
        request: &AdmissionRequest<CustomResourceDefinition>,
    ) -> Result<Vec<String>, Denial> {
        let object = || {
            request.object.as_ref().context(MissingObjectSnafu {
                operation: format!("{:?}", request.operation),
            })
        };

        match request.operation {
            Operation::Create => self.validate_create(object()?).await,
            Operation::Update => {
                let old_object = request.old_object.as_ref().context(MissingObjectSnafu {
                    operation: format!("{:?}", request.operation),
                })?;
                self.validate_update(old_object, object()?).await
            }
            Operation::Delete => {
                let old_object = request.old_object.as_ref().context(MissingObjectSnafu {
                    operation: format!("{:?}", request.operation),
                })?;
                self.validate_delete(old_object).await
            }
            Operation::Connect => Ok(Vec::new()),
        }
    }
}

/// Compares `crd` against the reference schema of `requirement`, minus its excluded fields.
///
/// Returns `None` if the reference schema describes a different CustomResourceDefinition, which
/// happens while `status.crdName` still lags behind an edited reference document.
fn check_requirement(
    checker: &SchemaCompatibilityChecker,
    requirement: &CompatibilityRequirement,
    crd: &CustomResourceDefinition,
) -> Result<Option<Findings>, Error> {
    let requirement_name = requirement.name_any();
    let required = requirement
        .compatibility_crd()
        .context(ReadCompatibilitySchemaSnafu)?;

    let required_crd_name = required.name_any();
    let crd_name = crd.name_any();
    if required_crd_name != crd_name {
        tracing::debug!(
            k8s.crd.name = %crd_name,
            compatibility_requirement = %requirement_name,
            reference_crd_name = %required_crd_name,
            "compatibility schema describes another CustomResourceDefinition, skipping requirement"
        );
        return Ok(None);
    }

    let required = prune_excluded_fields(&required, requirement.excluded_fields()).context(
        PruneExcludedFieldsSnafu {
            requirement: &requirement_name,
        },
    )?;

    checker
        .check_compatibility(&required, crd)
        .map(Some)
        .context(CheckCompatibilitySnafu {
            requirement: requirement_name,
        })
}

fn with_warnings(mut response: AdmissionResponse, warnings: Vec<String>) -> AdmissionResponse {
    if !warnings.is_empty() {
        response.warnings = Some(warnings);
    }
    response
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::{checker::test_utils::widget_crd, store::test_utils::StaticStore};

    fn crd_schema(spec_properties: serde_json::Value) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "spec": { "type": "object", "properties": spec_properties }
            }
        })
    }

    fn reference_crd() -> CustomResourceDefinition {
        widget_crd(&[(
            "v1",
            true,
            crd_schema(json!({"foo1": {"type": "string"}, "foo2": {"type": "string"}})),
        )])
    }

    fn incompatible_crd() -> CustomResourceDefinition {
        widget_crd(&[("v1", true, crd_schema(json!({"foo2": {"type": "string"}})))])
    }

    fn requirement(
        name: &str,
        action: Option<&str>,
        excluded_paths: &[&str],
    ) -> CompatibilityRequirement {
        let data = serde_yaml::to_string(&reference_crd()).expect("CRD serializes");
        let excluded_fields: Vec<_> = excluded_paths
            .iter()
            .map(|path| json!({ "path": path }))
            .collect();
        let validation = action
            .map(|action| json!({ "action": action }))
            .unwrap_or_else(|| json!({}));

        serde_json::from_value(json!({
            "apiVersion": "apiextensions.openshift.io/v1alpha1",
            "kind": "CompatibilityRequirement",
            "metadata": { "name": name },
            "spec": {
                "compatibilitySchema": {
                    "customResourceDefinition": { "data": data },
                    "excludedFields": excluded_fields
                },
                "customResourceDefinitionSchemaValidation": validation
            },
            "status": { "crdName": "widgets.example.com" }
        }))
        .expect("test requirement is valid")
    }

    fn webhook(
        requirements: impl IntoIterator<Item = CompatibilityRequirement>,
    ) -> CrdValidationWebhook {
        CrdValidationWebhook::new(
            Arc::new(StaticStore::new(requirements)),
            SchemaCompatibilityChecker::default(),
        )
    }

    #[tokio::test]
    async fn deny_blocks_incompatible_change() {
        let webhook = webhook([requirement("widgets", Some("Deny"), &[])]);

        let denial = webhook
            .validate_create(&incompatible_crd())
            .await
            .expect_err("foo1 was removed");

        assert!(denial.warnings.is_empty());
        assert_eq!(
            denial.error.to_string(),
            "This requirement was added by CompatibilityRequirement widgets: removed field : v1.^.spec.foo1"
        );
    }

    #[tokio::test]
    async fn warn_admits_incompatible_change() {
        let webhook = webhook([requirement("widgets", Some("Warn"), &[])]);

        let warnings = webhook
            .validate_update(&reference_crd(), &incompatible_crd())
            .await
            .expect("Warn never denies");

        assert_eq!(
            warnings,
            vec![
                "This requirement was added by CompatibilityRequirement widgets: removed field : v1.^.spec.foo1"
            ]
        );
    }

    #[tokio::test]
    async fn errors_of_all_requirements_are_joined() {
        let webhook = webhook([
            requirement("widgets-a", Some("Deny"), &[]),
            requirement("widgets-b", Some("Deny"), &[]),
            requirement("widgets-c", Some("Warn"), &[]),
        ]);

        let denial = webhook
            .validate_create(&incompatible_crd())
            .await
            .expect_err("foo1 was removed");

        assert_eq!(
            denial.error.to_string(),
            "This requirement was added by CompatibilityRequirement widgets-a: removed field : v1.^.spec.foo1\n\
             This requirement was added by CompatibilityRequirement widgets-b: removed field : v1.^.spec.foo1"
        );
        assert_eq!(
            denial.warnings,
            vec![
                "This requirement was added by CompatibilityRequirement widgets-c: removed field : v1.^.spec.foo1"
            ]
        );
    }

    #[tokio::test]
    async fn excluded_fields_are_ignored() {
        let webhook = webhook([requirement("widgets", Some("Deny"), &["spec.foo1"])]);

        let warnings = webhook
            .validate_create(&incompatible_crd())
            .await
            .expect("foo1 is excluded");
        assert!(warnings.is_empty());
    }

    #[tokio::test]
    async fn requirements_without_validation_are_skipped() {
        let webhook = webhook([requirement("widgets", None, &[])]);

        let warnings = webhook
            .validate_create(&incompatible_crd())
            .await
            .expect("validation is not configured");
        assert!(warnings.is_empty());
    }

    #[tokio::test]
    async fn unknown_action_is_fatal() {
        let webhook = webhook([requirement("widgets", Some("Audit"), &[])]);

        let denial = webhook
            .validate_create(&reference_crd())
            .await
            .expect_err("Audit is not a known action");
        assert!(matches!(
            denial.error,
            Error::UnknownValidationAction { ref requirement } if requirement == "widgets"
        ));
    }

    #[tokio::test]
    async fn requirement_for_another_crd_is_skipped() {
        let mut gadgets = reference_crd();
        gadgets.metadata.name = Some("gadgets.example.com".to_owned());

        // status.crdName still points at widgets, the reference document was edited since
        let mut stale = requirement("widgets", Some("Warn"), &[]);
        stale.spec.compatibility_schema.custom_resource_definition.data =
            serde_yaml::to_string(&gadgets).expect("CRD serializes");
        let webhook = webhook([stale]);

        let warnings = webhook
            .validate_update(&reference_crd(), &incompatible_crd())
            .await
            .expect("requirement describes another CRD");
        assert!(warnings.is_empty());
    }

    #[tokio::test]
    async fn malformed_reference_document_is_fatal() {
        let mut broken = requirement("widgets", Some("Warn"), &[]);
        broken.spec.compatibility_schema.custom_resource_definition.data = "spec: [".to_owned();
        let webhook = webhook([broken]);

        let denial = webhook
            .validate_create(&reference_crd())
            .await
            .expect_err("reference document is malformed");
        assert!(matches!(denial.error, Error::ReadCompatibilitySchema { .. }));
    }

    #[rstest]
    #[case::no_references(vec![], None)]
    #[case::two_references(
        vec![requirement("widgets-b", Some("Deny"), &[]), requirement("widgets-a", None, &[])],
        Some(
            "CustomResourceDefinition \"widgets.example.com\" cannot be deleted, it is referenced by \
             the CompatibilityRequirements widgets-a, widgets-b"
        )
    )]
    #[tokio::test]
    async fn delete_guard(
        #[case] requirements: Vec<CompatibilityRequirement>,
        #[case] expected_error: Option<&str>,
    ) {
        let result = webhook(requirements).validate_delete(&reference_crd()).await;

        match expected_error {
            None => assert!(result.expect("CRD is not referenced").is_empty()),
            Some(expected_error) => assert_eq!(
                result.expect_err("CRD is referenced").error.to_string(),
                expected_error
            ),
        }
    }

    #[tokio::test]
    async fn store_failures_are_fatal() {
        let webhook = CrdValidationWebhook::new(
            Arc::new(StaticStore {
                fail_with_status: Some(500),
                ..StaticStore::default()
            }),
            SchemaCompatibilityChecker::default(),
        );

        let denial = webhook
            .validate_create(&reference_crd())
            .await
            .expect_err("store is unavailable");
        assert!(matches!(denial.error, Error::ListRequirements { .. }));
    }
}
