//! Read access to [`CompatibilityRequirement`]s.
//!
//! Requirements are looked up by the CustomResourceDefinition they refer to, using the index key
//! returned by [`CompatibilityRequirement::crd_name_index_key`].
use std::sync::Arc;

use async_trait::async_trait;
use kube::{
    Api,
    api::ListParams,
    runtime::reflector::{ObjectRef, Store},
};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::crd::CompatibilityRequirement;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to list CompatibilityRequirements"))]
    ListRequirements { source: kube::Error },

    #[snafu(display("failed to get CompatibilityRequirement {name:?}"))]
    GetRequirement { source: kube::Error, name: String },

    #[snafu(display("CompatibilityRequirement {name:?} not found"))]
    RequirementNotFound { name: String },
}

impl Error {
    /// The HTTP status code of the Kubernetes API error behind this error, if there is one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::ListRequirements { source } | Self::GetRequirement { source, .. } => {
                match source {
                    kube::Error::Api(status) => Some(status.code),
                    _ => None,
                }
            }
            Self::RequirementNotFound { .. } => Some(404),
        }
    }
}

#[async_trait]
pub trait CompatibilityRequirementStore: Send + Sync {
    /// Returns all requirements which refer to the CustomResourceDefinition named `crd_name`.
    async fn requirements_for_crd(
        &self,
        crd_name: &str,
    ) -> Result<Vec<Arc<CompatibilityRequirement>>, Error>;

    /// Returns the requirement named `name`.
    async fn requirement(&self, name: &str) -> Result<Arc<CompatibilityRequirement>, Error>;
}

/// The reflector store of the requirement controller acts as an always up-to-date index.
#[async_trait]
impl CompatibilityRequirementStore for Store<CompatibilityRequirement> {
    async fn requirements_for_crd(
        &self,
        crd_name: &str,
    ) -> Result<Vec<Arc<CompatibilityRequirement>>, Error> {
        Ok(self
            .state()
            .into_iter()
            .filter(|requirement| requirement.crd_name_index_key() == Some(crd_name))
            .collect())
    }

    async fn requirement(&self, name: &str) -> Result<Arc<CompatibilityRequirement>, Error> {
        self.get(&ObjectRef::new(name))
            .context(RequirementNotFoundSnafu { name })
    }
}

/// Queries the Kubernetes API directly. Requirements are filtered client-side, as custom
/// resources only support field selectors on `metadata.name`.
#[async_trait]
impl CompatibilityRequirementStore for Api<CompatibilityRequirement> {
    async fn requirements_for_crd(
        &self,
        crd_name: &str,
    ) -> Result<Vec<Arc<CompatibilityRequirement>>, Error> {
        let requirements = self
            .list(&ListParams::default())
            .await
            .context(ListRequirementsSnafu)?;

        Ok(requirements
            .into_iter()
            .filter(|requirement| requirement.crd_name_index_key() == Some(crd_name))
            .map(Arc::new)
            .collect())
    }

    async fn requirement(&self, name: &str) -> Result<Arc<CompatibilityRequirement>, Error> {
        self.get_opt(name)
            .await
            .with_context(|_| GetRequirementSnafu { name })?
            .map(Arc::new)
            .context(RequirementNotFoundSnafu { name })
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use std::sync::Arc;

    use async_trait::async_trait;
    use kube::{ResourceExt, core::Status};

    use super::*;

    /// An in-memory store backed by a list of requirements.
    #[derive(Default)]
    pub struct StaticStore {
        pub requirements: Vec<Arc<CompatibilityRequirement>>,
        pub fail_with_status: Option<u16>,
    }

    impl StaticStore {
        pub fn new(requirements: impl IntoIterator<Item = CompatibilityRequirement>) -> Self {
            Self {
                requirements: requirements.into_iter().map(Arc::new).collect(),
                fail_with_status: None,
            }
        }

        fn api_error(&self) -> Option<kube::Error> {
            self.fail_with_status.map(|code| {
                kube::Error::Api(
                    Status::failure("injected failure", "InternalError")
                        .with_code(code)
                        .boxed(),
                )
            })
        }
    }

    #[async_trait]
    impl CompatibilityRequirementStore for StaticStore {
        async fn requirements_for_crd(
            &self,
            crd_name: &str,
        ) -> Result<Vec<Arc<CompatibilityRequirement>>, Error> {
            if let Some(source) = self.api_error() {
                return Err(Error::ListRequirements { source });
            }

            Ok(self
                .requirements
                .iter()
                .filter(|requirement| requirement.crd_name_index_key() == Some(crd_name))
                .cloned()
                .collect())
        }

        async fn requirement(&self, name: &str) -> Result<Arc<CompatibilityRequirement>, Error> {
            if let Some(source) = self.api_error() {
                return Err(Error::GetRequirement {
                    source,
                    name: name.to_owned(),
                });
            }

            self.requirements
                .iter()
                .find(|requirement| requirement.name_any() == name)
                .cloned()
                .context(RequirementNotFoundSnafu { name })
        }
    }
}

#[cfg(test)]
mod tests {
    use indoc::formatdoc;
    use kube::runtime::{reflector::store::Writer, watcher};

    use super::*;

    fn requirement(name: &str, crd_name: Option<&str>) -> CompatibilityRequirement {
        let status = crd_name
            .map(|crd_name| format!("status:\n  crdName: {crd_name}"))
            .unwrap_or_default();

        serde_yaml::from_str(&formatdoc! {"
            apiVersion: apiextensions.openshift.io/v1alpha1
            kind: CompatibilityRequirement
            metadata:
              name: {name}
            spec:
              compatibilitySchema:
                customResourceDefinition:
                  data: ''
            {status}
        "})
        .expect("test YAML is valid")
    }

    fn reflector_store() -> Store<CompatibilityRequirement> {
        let mut writer = Writer::<CompatibilityRequirement>::default();
        for requirement in [
            requirement("widgets-a", Some("widgets.example.com")),
            requirement("widgets-b", Some("widgets.example.com")),
            requirement("gadgets", Some("gadgets.example.com")),
            requirement("pending", None),
        ] {
            writer.apply_watcher_event(&watcher::Event::Apply(requirement));
        }

        writer.as_reader()
    }

    #[tokio::test]
    async fn reflector_store_filters_by_index_key() {
        let store = reflector_store();

        let mut names: Vec<String> = store
            .requirements_for_crd("widgets.example.com")
            .await
            .expect("reflector lookups never fail")
            .iter()
            .map(|requirement| kube::ResourceExt::name_any(requirement.as_ref()))
            .collect();
        names.sort();

        assert_eq!(names, vec!["widgets-a", "widgets-b"]);
        assert!(
            store
                .requirements_for_crd("unknown.example.com")
                .await
                .expect("reflector lookups never fail")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn reflector_store_get() {
        let store = reflector_store();

        let requirement = CompatibilityRequirementStore::requirement(&store, "gadgets")
            .await
            .expect("requirement exists");
        assert_eq!(requirement.crd_name_index_key(), Some("gadgets.example.com"));

        let error = CompatibilityRequirementStore::requirement(&store, "missing")
            .await
            .expect_err("requirement does not exist");
        assert!(matches!(error, Error::RequirementNotFound { ref name } if name == "missing"));
        assert_eq!(error.status_code(), Some(404));
    }
}
