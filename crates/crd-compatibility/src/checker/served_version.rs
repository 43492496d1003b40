use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

use crate::{
    checker::{Findings, ValidationRule},
    schema::crd_version,
};

/// How versions which are served by the required CRD, but no longer by the target CRD, are
/// reported.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, strum::Display, strum::EnumString)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[strum(serialize_all = "lowercase")]
pub enum ServedVersionPolicy {
    /// Versions which are no longer served are not reported.
    #[default]
    Ignore,

    /// Report versions which are no longer served as warnings.
    Warn,

    /// Report versions which are no longer served as errors.
    Deny,
}

/// Compares the served versions of the required and the target CRD.
#[derive(Clone, Copy, Debug, Default)]
pub struct ServedVersion {
    policy: ServedVersionPolicy,
}

impl ServedVersion {
    pub fn new(policy: ServedVersionPolicy) -> Self {
        Self { policy }
    }
}

impl ValidationRule for ServedVersion {
    fn name(&self) -> &'static str {
        "served-version"
    }

    fn check(
        &self,
        required: &CustomResourceDefinition,
        target: &CustomResourceDefinition,
    ) -> Findings {
        let mut findings = Findings::default();
        let bucket = match self.policy {
            ServedVersionPolicy::Ignore => return findings,
            ServedVersionPolicy::Warn => &mut findings.warnings,
            ServedVersionPolicy::Deny => &mut findings.errors,
        };

        for required_version in required.spec.versions.iter().filter(|v| v.served) {
            let still_served =
                crd_version(target, &required_version.name).is_some_and(|version| version.served);

            if !still_served {
                bucket.push(format!(
                    "served version {} is no longer served",
                    required_version.name
                ));
            }
        }

        findings
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::checker::test_utils::widget_crd;

    #[rstest]
    #[case(ServedVersionPolicy::Ignore, vec![], vec![])]
    #[case(
        ServedVersionPolicy::Warn,
        vec![],
        vec!["served version v1alpha1 is no longer served", "served version v1beta1 is no longer served"]
    )]
    #[case(
        ServedVersionPolicy::Deny,
        vec!["served version v1alpha1 is no longer served", "served version v1beta1 is no longer served"],
        vec![]
    )]
    fn removed_served_versions(
        #[case] policy: ServedVersionPolicy,
        #[case] errors: Vec<&str>,
        #[case] warnings: Vec<&str>,
    ) {
        let schema = json!({"type": "object"});
        let required = widget_crd(&[
            ("v1", true, schema.clone()),
            ("v1beta1", true, schema.clone()),
            ("v1alpha1", true, schema.clone()),
        ]);
        // v1beta1 is still present, but no longer served; v1alpha1 is gone
        let target = widget_crd(&[("v1", true, schema.clone()), ("v1beta1", false, schema)]);

        let findings = ServedVersion::new(policy).check(&required, &target);
        let mut reported_errors = findings.errors.clone();
        let mut reported_warnings = findings.warnings.clone();
        reported_errors.sort();
        reported_warnings.sort();

        assert_eq!(reported_errors, errors);
        assert_eq!(reported_warnings, warnings);
    }

    #[test]
    fn policy_from_str() {
        assert_eq!(
            "deny".parse::<ServedVersionPolicy>().expect("valid policy"),
            ServedVersionPolicy::Deny
        );
        assert!("audit".parse::<ServedVersionPolicy>().is_err());
    }
}
