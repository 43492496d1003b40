//! The `CompatibilityRequirement` custom resource.
//!
//! A [`CompatibilityRequirement`] pins the schema of a CustomResourceDefinition to a reference
//! document. The reference document is stored verbatim in
//! `spec.compatibilitySchema.customResourceDefinition.data` and is only ever parsed on demand, see
//! [`CompatibilityRequirement::compatibility_crd`].
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display(
        "failed to parse the compatibility CustomResourceDefinition of CompatibilityRequirement {requirement:?}"
    ))]
    ParseCompatibilityCrd {
        source: serde_yaml::Error,
        requirement: String,
    },
}

/// Declares that the schema of a CustomResourceDefinition must remain compatible with the schema
/// stored in this object, minus the explicitly excluded fields.
#[derive(Clone, CustomResource, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "apiextensions.openshift.io",
    version = "v1alpha1",
    kind = "CompatibilityRequirement",
    plural = "compatibilityrequirements",
    shortname = "compatreq",
    status = "CompatibilityRequirementStatus",
    printcolumn = r#"{"name":"CRD", "type":"string", "jsonPath":".status.crdName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CompatibilityRequirementSpec {
    /// The reference schema the CustomResourceDefinition must stay compatible with.
    pub compatibility_schema: CompatibilitySchema,

    /// Controls how incompatible changes to the CustomResourceDefinition are handled. If unset,
    /// changes to the CustomResourceDefinition are not validated against this requirement.
    #[serde(default)]
    pub custom_resource_definition_schema_validation: CustomResourceDefinitionSchemaValidation,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompatibilitySchema {
    pub custom_resource_definition: CustomResourceDefinitionSource,

    /// Fields which are ignored when comparing schemas.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_fields: Vec<ExcludedField>,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomResourceDefinitionSource {
    /// A complete CustomResourceDefinition, serialized as YAML or JSON.
    pub data: String,
}

/// A schema path which is exempt from compatibility checks.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExcludedField {
    /// Dot-separated property path relative to the root of a version schema, for example
    /// `spec.template.extraField`. Array items are traversed implicitly and never appear in the
    /// path.
    pub path: String,

    /// The versions this exclusion applies to. Applies to all versions if empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub versions: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomResourceDefinitionSchemaValidation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ValidationAction>,
}

impl CustomResourceDefinitionSchemaValidation {
    /// Returns `true` if schema validation is not configured at all.
    pub fn is_unset(&self) -> bool {
        *self == Self::default()
    }
}

/// What happens when a CustomResourceDefinition change breaks a requirement.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize, strum::Display,
)]
pub enum ValidationAction {
    /// Admit the change, but return the incompatibilities as warnings.
    Warn,

    /// Reject the change.
    Deny,

    /// Any action this version does not know about.
    #[serde(other)]
    #[schemars(skip)]
    Unknown,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompatibilityRequirementStatus {
    /// Name of the CustomResourceDefinition described by the compatibility schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crd_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<RequirementCondition>,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequirementCondition {
    #[serde(rename = "type")]
    pub type_: RequirementConditionType,
    pub status: ConditionStatus,
    pub reason: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize, strum::Display,
)]
pub enum RequirementConditionType {
    /// The compatibility schema could be parsed and names a CustomResourceDefinition.
    Admitted,

    /// The installed CustomResourceDefinition satisfies the requirement.
    Compatible,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize, strum::Display,
)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl CompatibilityRequirement {
    /// Parses the reference CustomResourceDefinition embedded in the spec.
    pub fn compatibility_crd(&self) -> Result<CustomResourceDefinition, Error> {
        serde_yaml::from_str(&self.spec.compatibility_schema.custom_resource_definition.data)
            .with_context(|_| ParseCompatibilityCrdSnafu {
                requirement: self.name_any(),
            })
    }

    pub fn excluded_fields(&self) -> &[ExcludedField] {
        &self.spec.compatibility_schema.excluded_fields
    }

    /// The key under which this requirement is indexed: the name of the CustomResourceDefinition
    /// it refers to, as recorded in `status.crdName`.
    pub fn crd_name_index_key(&self) -> Option<&str> {
        self.status.as_ref()?.crd_name.as_deref()
    }
}
