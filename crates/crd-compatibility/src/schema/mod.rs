//! Helpers to work with the OpenAPI schemas embedded in CustomResourceDefinitions.
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, CustomResourceDefinitionVersion, JSONSchemaProps,
    JSONSchemaPropsOrArray,
};

pub mod excluded_fields;
pub mod structural;

pub use excluded_fields::prune_excluded_fields;
pub use structural::{SchemaType, StructuralSchema};

/// Returns the version entry named `version` of the `crd`.
pub fn crd_version<'a>(
    crd: &'a CustomResourceDefinition,
    version: &str,
) -> Option<&'a CustomResourceDefinitionVersion> {
    crd.spec.versions.iter().find(|v| v.name == version)
}

/// Returns the `openAPIV3Schema` of the given version entry, if any.
pub fn version_schema(version: &CustomResourceDefinitionVersion) -> Option<&JSONSchemaProps> {
    version.schema.as_ref()?.open_api_v3_schema.as_ref()
}

pub(crate) fn version_schema_mut(
    version: &mut CustomResourceDefinitionVersion,
) -> Option<&mut JSONSchemaProps> {
    version.schema.as_mut()?.open_api_v3_schema.as_mut()
}

/// Returns the single items schema of an array schema.
///
/// Tuple-style `items` (a list of schemas) are not structural and are treated like a missing
/// items schema.
pub fn items_schema(schema: &JSONSchemaProps) -> Option<&JSONSchemaProps> {
    match schema.items.as_ref()? {
        JSONSchemaPropsOrArray::Schema(items) => Some(items),
        JSONSchemaPropsOrArray::Schemas(_) => None,
    }
}

pub(crate) fn items_schema_mut(schema: &mut JSONSchemaProps) -> Option<&mut JSONSchemaProps> {
    match schema.items.as_mut()? {
        JSONSchemaPropsOrArray::Schema(items) => Some(items),
        JSONSchemaPropsOrArray::Schemas(_) => None,
    }
}
