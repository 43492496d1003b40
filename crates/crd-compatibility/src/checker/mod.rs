//! Compatibility checks between two versions of a CustomResourceDefinition.
//!
//! The [`SchemaCompatibilityChecker`] holds a registry of named [`ValidationRule`]s. Every rule
//! compares a *required* CRD (the reference the cluster must stay compatible with) against a
//! *target* CRD (the one about to be persisted) and reports its findings as plain strings.
use std::collections::BTreeMap;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::ResourceExt;
use snafu::{Snafu, ensure};

mod existing_field_removal;
mod served_version;

pub use existing_field_removal::ExistingFieldRemoval;
pub use served_version::{ServedVersion, ServedVersionPolicy};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display(
        "cannot compare CustomResourceDefinition {target:?} against requirements for {required:?}"
    ))]
    CrdNameMismatch { required: String, target: String },

    #[snafu(display("a validation rule named {name:?} is already registered"))]
    DuplicateRule { name: String },
}

/// The findings of one or more [`ValidationRule`]s.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Findings {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl Findings {
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }

    fn extend(&mut self, other: Self) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// A single compatibility check.
pub trait ValidationRule: Send + Sync {
    /// The unique name of this rule inside a [`SchemaCompatibilityChecker`].
    fn name(&self) -> &'static str;

    fn check(
        &self,
        required: &CustomResourceDefinition,
        target: &CustomResourceDefinition,
    ) -> Findings;
}

pub struct SchemaCompatibilityChecker {
    rules: BTreeMap<&'static str, Box<dyn ValidationRule>>,
}

impl Default for SchemaCompatibilityChecker {
    /// A checker with [`ExistingFieldRemoval`] and [`ServedVersion`] using the default
    /// [`ServedVersionPolicy`].
    fn default() -> Self {
        Self::with_served_version_policy(ServedVersionPolicy::default())
    }
}

impl SchemaCompatibilityChecker {
    /// A checker without any rules.
    pub fn empty() -> Self {
        Self {
            rules: BTreeMap::new(),
        }
    }

    pub fn with_served_version_policy(policy: ServedVersionPolicy) -> Self {
        let mut rules: BTreeMap<&'static str, Box<dyn ValidationRule>> = BTreeMap::new();
        rules.insert(ExistingFieldRemoval.name(), Box::new(ExistingFieldRemoval));

        let served_version = ServedVersion::new(policy);
        rules.insert(served_version.name(), Box::new(served_version));

        Self { rules }
    }

    /// Adds another rule. Rule names must be unique.
    pub fn register(&mut self, rule: impl ValidationRule + 'static) -> Result<(), Error> {
        let name = rule.name();
        ensure!(
            !self.rules.contains_key(name),
            DuplicateRuleSnafu { name }
        );

        self.rules.insert(name, Box::new(rule));
        Ok(())
    }

    pub fn rule_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.rules.keys().copied()
    }

    /// Runs all registered rules and returns their combined findings.
    pub fn check_compatibility(
        &self,
        required: &CustomResourceDefinition,
        target: &CustomResourceDefinition,
    ) -> Result<Findings, Error> {
        let required_name = required.name_any();
        let target_name = target.name_any();
        ensure!(
            required_name == target_name,
            CrdNameMismatchSnafu {
                required: required_name,
                target: target_name,
            }
        );

        let mut findings = Findings::default();
        for (name, rule) in &self.rules {
            let rule_findings = rule.check(required, target);
            tracing::debug!(
                rule = *name,
                k8s.crd.name = %target_name,
                errors = rule_findings.errors.len(),
                warnings = rule_findings.warnings.len(),
                "ran compatibility rule"
            );
            findings.extend(rule_findings);
        }

        Ok(findings)
    }
}
