use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, JSONSchemaProps,
};

use crate::{
    checker::{Findings, ValidationRule},
    schema::{crd_version, items_schema, version_schema},
};

/// Marks the root of a version schema in reported paths.
const ROOT: &str = "^";

/// Reports every field of the required schema which no longer exists in the target schema.
///
/// Only versions present in both CRDs are compared. Array items are traversed without adding a
/// segment to the path. When a whole subtree is removed, only its topmost field is reported.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExistingFieldRemoval;

impl ValidationRule for ExistingFieldRemoval {
    fn name(&self) -> &'static str {
        "existing-field-removal"
    }

    fn check(
        &self,
        required: &CustomResourceDefinition,
        target: &CustomResourceDefinition,
    ) -> Findings {
        let empty = JSONSchemaProps::default();
        let mut findings = Findings::default();

        for required_version in &required.spec.versions {
            let Some(target_version) = crd_version(target, &required_version.name) else {
                continue;
            };
            let Some(required_schema) = version_schema(required_version) else {
                continue;
            };
            let target_schema = version_schema(target_version).unwrap_or(&empty);

            let mut removed = Vec::new();
            collect_removed_fields(required_schema, target_schema, ROOT, &mut removed);

            findings.errors.extend(
                removed
                    .into_iter()
                    .map(|path| format!("removed field : {}.{path}", required_version.name)),
            );
        }

        findings
    }
}

fn collect_removed_fields(
    required: &JSONSchemaProps,
    target: &JSONSchemaProps,
    path: &str,
    removed: &mut Vec<String>,
) {
    for (name, required_property) in required.properties.iter().flatten() {
        let property_path = format!("{path}.{name}");

        match target
            .properties
            .as_ref()
            .and_then(|properties| properties.get(name))
        {
            Some(target_property) => {
                collect_removed_fields(required_property, target_property, &property_path, removed);
            }
            None => removed.push(property_path),
        }
    }

    if let Some(required_items) = items_schema(required) {
        let empty = JSONSchemaProps::default();
        let target_items = items_schema(target).unwrap_or(&empty);
        collect_removed_fields(required_items, target_items, path, removed);
    }
}
