//! Removal of excluded field paths from CustomResourceDefinition schemas.
//!
//! Before two schemas are compared, every [`ExcludedField`] of a requirement is deleted from the
//! reference schema, so that changes to these fields can never be reported as incompatible.
use std::{collections::BTreeMap, fmt::Display};

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, JSONSchemaProps,
};
use snafu::{OptionExt, Snafu, ensure};

use crate::{
    crd::ExcludedField,
    schema::{items_schema_mut, version_schema_mut},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("excluded field path {desired_path:?} contains an empty segment"))]
    EmptyPathSegment { desired_path: String },

    #[snafu(display(
        "excluded field path {desired_path:?} not found in version {version:?}: {parent_path:?} has no property {segment:?}"
    ))]
    PathNotFound {
        version: String,
        desired_path: String,
        parent_path: String,
        segment: String,
    },

    #[snafu(display(
        "excluded field path {desired_path:?} cannot be resolved in version {version:?}: {parent_path:?} is an array without an items schema"
    ))]
    ArrayWithoutItems {
        version: String,
        desired_path: String,
        parent_path: String,
    },

    #[snafu(display(
        "excluded field path {desired_path:?} cannot be resolved in version {version:?}: {parent_path:?} is not an object (type {type_:?})"
    ))]
    NotAnObject {
        version: String,
        desired_path: String,
        parent_path: String,
        type_: String,
    },

    #[snafu(display("version {version:?} has no openAPIV3Schema to exclude fields from"))]
    MissingVersionSchema { version: String },
}

/// All errors encountered while pruning excluded fields.
#[derive(Debug)]
pub struct Errors(Vec<Error>);

impl Errors {
    pub fn iter(&self) -> impl Iterator<Item = &Error> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for Errors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, error) in self.0.iter().enumerate() {
            let prefix = match i {
                0 => "",
                _ => ", ",
            };
            write!(f, "{prefix}{error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Errors {}

/// The path currently being resolved, used to enrich errors.
struct DesiredPath<'a> {
    version: &'a str,
    path: &'a str,
}

/// Returns a copy of `crd` with all `excluded_fields` removed from the schemas of the versions
/// they apply to.
///
/// Exclusions without versions apply to every version of the CRD. Resolution problems are
/// collected for all paths and versions and returned together.
pub fn prune_excluded_fields(
    crd: &CustomResourceDefinition,
    excluded_fields: &[ExcludedField],
) -> Result<CustomResourceDefinition, Errors> {
    // `None` collects the exclusions which apply to all versions
    let mut paths_by_version: BTreeMap<Option<&str>, Vec<&str>> = BTreeMap::new();
    for excluded_field in excluded_fields {
        if excluded_field.versions.is_empty() {
            paths_by_version
                .entry(None)
                .or_default()
                .push(&excluded_field.path);
        }

        for version in &excluded_field.versions {
            paths_by_version
                .entry(Some(version.as_str()))
                .or_default()
                .push(&excluded_field.path);
        }
    }

    let mut pruned = crd.clone();
    let mut errors = Vec::new();

    for version in &mut pruned.spec.versions {
        let version_name = version.name.clone();
        let paths: Vec<&str> = [None, Some(version_name.as_str())]
            .iter()
            .filter_map(|key| paths_by_version.get(key))
            .flatten()
            .copied()
            .collect();

        if paths.is_empty() {
            continue;
        }

        let Some(schema) = version_schema_mut(version) else {
            errors.push(Error::MissingVersionSchema {
                version: version_name.clone(),
            });
            continue;
        };

        for path in paths {
            tracing::trace!(version = %version_name, path, "pruning excluded field");

            let desired_path = DesiredPath {
                version: &version_name,
                path,
            };
            let segments: Vec<&str> = path.split('.').collect();

            if let Err(error) = prune_path(schema, &desired_path, "", &segments) {
                errors.push(error);
            }
        }
    }

    if errors.is_empty() {
        Ok(pruned)
    } else {
        Err(Errors(errors))
    }
}

fn prune_path(
    schema: &mut JSONSchemaProps,
    desired_path: &DesiredPath<'_>,
    parent_path: &str,
    segments: &[&str],
) -> Result<(), Error> {
    let Some((segment, remaining)) = segments.split_first() else {
        return Ok(());
    };

    ensure!(
        !segment.is_empty(),
        EmptyPathSegmentSnafu {
            desired_path: desired_path.path
        }
    );

    // Removing a property which is already gone is fine, this keeps pruning idempotent.
    if remaining.is_empty() {
        remove_property(schema, segment);
        return Ok(());
    }

    let property = schema
        .properties
        .as_mut()
        .and_then(|properties| properties.get_mut(*segment))
        .context(PathNotFoundSnafu {
            version: desired_path.version,
            desired_path: desired_path.path,
            parent_path,
            segment: *segment,
        })?;

    let property_path = match parent_path {
        "" => (*segment).to_owned(),
        parent_path => format!("{parent_path}.{segment}"),
    };

    let type_ = property.type_.clone();
    match type_.as_deref() {
        Some("object") => prune_path(property, desired_path, &property_path, remaining),
        // The path never contains array indices, the items schema describes all elements.
        Some("array") => {
            let items = items_schema_mut(property).context(ArrayWithoutItemsSnafu {
                version: desired_path.version,
                desired_path: desired_path.path,
                parent_path: &property_path,
            })?;

            prune_path(items, desired_path, &property_path, remaining)
        }
        type_ => NotAnObjectSnafu {
            version: desired_path.version,
            desired_path: desired_path.path,
            parent_path: &property_path,
            type_: type_.unwrap_or_default(),
        }
        .fail(),
    }
}

fn remove_property(schema: &mut JSONSchemaProps, name: &str) {
    if let Some(properties) = schema.properties.as_mut() {
        properties.remove(name);
    }

    if let Some(required) = schema.required.as_mut() {
        required.retain(|field| field != name);

        if required.is_empty() {
            schema.required = None;
        }
    }
}
