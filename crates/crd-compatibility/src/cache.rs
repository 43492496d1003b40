//! Compiled [`StructuralSchema`]s per [`CompatibilityRequirement`] and version.
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use kube::ResourceExt;
use snafu::{OptionExt, ResultExt, Snafu};

use crate::{
    crd::{self, CompatibilityRequirement},
    schema::{self, StructuralSchema, structural},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read the compatibility schema"))]
    ReadCompatibilitySchema { source: crd::Error },

    #[snafu(display(
        "the compatibility schema of CompatibilityRequirement {requirement:?} has no version {version:?}"
    ))]
    VersionNotFound { requirement: String, version: String },

    #[snafu(display(
        "version {version:?} in the compatibility schema of CompatibilityRequirement {requirement:?} has no openAPIV3Schema"
    ))]
    MissingVersionSchema { requirement: String, version: String },

    #[snafu(display(
        "failed to compile the structural schema of version {version:?} of CompatibilityRequirement {requirement:?}"
    ))]
    CompileSchema {
        source: structural::Error,
        requirement: String,
        version: String,
    },
}

/// Identifies one compiled schema. Entries are only valid for the generation of the requirement
/// they were compiled from.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct CacheKey {
    pub uid: String,
    pub name: String,
    pub version: String,
    pub generation: i64,
}

impl CacheKey {
    pub fn new(requirement: &CompatibilityRequirement, version: &str) -> Self {
        Self {
            uid: requirement.uid().unwrap_or_default(),
            name: requirement.name_any(),
            version: version.to_owned(),
            generation: requirement.metadata.generation.unwrap_or_default(),
        }
    }

    fn same_object_and_version(&self, other: &Self) -> bool {
        self.uid == other.uid && self.name == other.name && self.version == other.version
    }
}

/// Thread-safe cache of compiled schemas.
///
/// Lookups only take the read lock. Parsing and compiling happens without holding any lock, so
/// two requests may compile the same schema concurrently; the last one to insert wins.
#[derive(Debug, Default)]
pub struct StructuralSchemaCache {
    entries: RwLock<HashMap<CacheKey, Arc<StructuralSchema>>>,
}

impl StructuralSchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the compiled schema for `version` of the reference document of `requirement`,
    /// compiling and caching it on a miss.
    pub fn get_or_compile(
        &self,
        requirement: &CompatibilityRequirement,
        version: &str,
    ) -> Result<Arc<StructuralSchema>, Error> {
        let key = CacheKey::new(requirement, version);

        if let Some(schema) = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(schema.clone());
        }

        let schema = Arc::new(compile(requirement, version)?);
        tracing::debug!(
            compatibility_requirement = %key.name,
            version,
            generation = key.generation,
            "compiled structural schema"
        );

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        evict_stale_locked(&mut entries, &key);
        entries.insert(key, schema.clone());

        Ok(schema)
    }

    /// Removes all entries for the same requirement and version as `key` whose generation differs
    /// from the generation of `key`.
    pub fn evict_stale(&self, key: &CacheKey) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        evict_stale_locked(&mut entries, key);
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn contains(&self, key: &CacheKey) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }
}

fn evict_stale_locked(entries: &mut HashMap<CacheKey, Arc<StructuralSchema>>, key: &CacheKey) {
    entries.retain(|cached, _| {
        !(cached.same_object_and_version(key) && cached.generation != key.generation)
    });
}

fn compile(
    requirement: &CompatibilityRequirement,
    version: &str,
) -> Result<StructuralSchema, Error> {
    let requirement_name = requirement.name_any();
    let crd = requirement
        .compatibility_crd()
        .context(ReadCompatibilitySchemaSnafu)?;

    let crd_version = schema::crd_version(&crd, version).context(VersionNotFoundSnafu {
        requirement: &requirement_name,
        version,
    })?;
    let open_api_schema =
        schema::version_schema(crd_version).context(MissingVersionSchemaSnafu {
            requirement: &requirement_name,
            version,
        })?;

    StructuralSchema::compile(open_api_schema).context(CompileSchemaSnafu {
        requirement: requirement_name,
        version,
    })
}
