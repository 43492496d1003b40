//! Keeps the status of [`CompatibilityRequirement`]s up to date.
//!
//! Besides reporting conditions, the status carries `status.crdName`, which the webhooks use to
//! find the requirements of a CustomResourceDefinition. The reflector store of this controller is
//! handed to the webhooks, see [`RequirementStatusController::store`].
use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    Api, Client, Resource, ResourceExt,
    api::{Patch, PatchParams},
    runtime::{
        Controller,
        controller::Action,
        reflector::{ObjectRef, Store},
        watcher,
    },
};
use snafu::{ResultExt, Snafu};
use strum::EnumDiscriminants;
use tracing::instrument;

use crate::{
    checker::SchemaCompatibilityChecker,
    crd::{
        self, CompatibilityRequirement, CompatibilityRequirementStatus, ConditionStatus,
        RequirementCondition, RequirementConditionType,
    },
    schema::prune_excluded_fields,
    webhooks::full_error_message,
};

const ERROR_REQUEUE_DURATION: Duration = Duration::from_secs(10);

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(strum::IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to get CustomResourceDefinition {crd_name:?}"))]
    GetCrd {
        source: kube::Error,
        crd_name: String,
    },

    #[snafu(display("failed to apply the status of CompatibilityRequirement {requirement:?}"))]
    ApplyStatus {
        source: kube::Error,
        requirement: String,
    },
}

impl Error {
    /// `PascalCase`d name of the error category.
    pub fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

struct Context {
    client: Client,
    checker: SchemaCompatibilityChecker,
    field_manager: String,
}

pub struct RequirementStatusController {
    controller: Controller<CompatibilityRequirement>,
    context: Arc<Context>,
}

impl RequirementStatusController {
    /// Watches all [`CompatibilityRequirement`]s, and all CustomResourceDefinitions they refer to.
    pub fn new(
        client: Client,
        checker: SchemaCompatibilityChecker,
        field_manager: impl Into<String>,
    ) -> Self {
        let requirements = Api::<CompatibilityRequirement>::all(client.clone());
        let crds = Api::<CustomResourceDefinition>::all(client.clone());

        let controller = Controller::new(requirements, watcher::Config::default());
        let store = controller.store();
        let controller = controller
            .watches(crds, watcher::Config::default(), move |crd| {
                requirements_referencing(&store, &crd.name_any())
            })
            .shutdown_on_signal();

        Self {
            controller,
            context: Arc::new(Context {
                client,
                checker,
                field_manager: field_manager.into(),
            }),
        }
    }

    /// A continuously updated view of all requirements.
    pub fn store(&self) -> Store<CompatibilityRequirement> {
        self.controller.store()
    }

    /// Runs the controller until a shutdown signal is received.
    pub async fn run(self) {
        tracing::info!("starting CompatibilityRequirement status controller");

        self.controller
            .run(reconcile, error_policy, self.context)
            .for_each(|result| async move {
                match result {
                    Ok((requirement, _)) => {
                        tracing::debug!(
                            compatibility_requirement = %requirement,
                            "reconciled CompatibilityRequirement"
                        );
                    }
                    Err(error) => {
                        tracing::error!(
                            error = &error as &dyn std::error::Error,
                            "failed to reconcile CompatibilityRequirement"
                        );
                    }
                }
            })
            .await;

        tracing::info!("CompatibilityRequirement status controller stopped");
    }
}

fn requirements_referencing(
    store: &Store<CompatibilityRequirement>,
    crd_name: &str,
) -> Vec<ObjectRef<CompatibilityRequirement>> {
    store
        .state()
        .iter()
        .filter(|requirement| requirement.crd_name_index_key() == Some(crd_name))
        .map(|requirement| ObjectRef::from_obj(requirement.as_ref()))
        .collect()
}

#[instrument(
    skip(requirement, context),
    fields(compatibility_requirement = %requirement.name_any())
)]
async fn reconcile(
    requirement: Arc<CompatibilityRequirement>,
    context: Arc<Context>,
) -> Result<Action, Error> {
    let reference = requirement.compatibility_crd();

    let crd_name = reference
        .as_ref()
        .ok()
        .map(|crd| crd.name_any())
        .filter(|crd_name| !crd_name.is_empty());

    let live_crd = match crd_name {
        Some(crd_name) => Api::<CustomResourceDefinition>::all(context.client.clone())
            .get_opt(&crd_name)
            .await
            .context(GetCrdSnafu {
                crd_name: &crd_name,
            })?,
        None => None,
    };

    let status = compute_status(&requirement, reference, live_crd.as_ref(), &context.checker);
    if requirement.status.as_ref() == Some(&status) {
        return Ok(Action::await_change());
    }

    let name = requirement.name_any();
    let patch = serde_json::json!({
        "apiVersion": CompatibilityRequirement::api_version(&()),
        "kind": CompatibilityRequirement::kind(&()),
        "status": status,
    });

    Api::<CompatibilityRequirement>::all(context.client.clone())
        .patch_status(
            &name,
            &PatchParams::apply(&context.field_manager).force(),
            &Patch::Apply(&patch),
        )
        .await
        .context(ApplyStatusSnafu { requirement: &name })?;

    tracing::info!(
        crd_name = ?status.crd_name,
        "updated CompatibilityRequirement status"
    );
    Ok(Action::await_change())
}

fn error_policy(
    requirement: Arc<CompatibilityRequirement>,
    error: &Error,
    _context: Arc<Context>,
) -> Action {
    tracing::warn!(
        compatibility_requirement = %requirement.name_any(),
        category = error.category(),
        error = error as &dyn std::error::Error,
        "reconciliation failed, requeueing"
    );
    Action::requeue(ERROR_REQUEUE_DURATION)
}

/// Computes the status of `requirement` from its parsed reference document and the currently
/// installed CustomResourceDefinition.
pub fn compute_status(
    requirement: &CompatibilityRequirement,
    reference: Result<CustomResourceDefinition, crd::Error>,
    live_crd: Option<&CustomResourceDefinition>,
    checker: &SchemaCompatibilityChecker,
) -> CompatibilityRequirementStatus {
    let generation = requirement.metadata.generation;
    let condition = |type_, status, reason: &str, message: String| RequirementCondition {
        type_,
        status,
        reason: reason.to_owned(),
        message,
        observed_generation: generation,
    };

    let reference = match reference {
        Ok(reference) if reference.name_any().is_empty() => Err((
            "MissingCrdName",
            "the compatibility schema does not name a CustomResourceDefinition".to_owned(),
        )),
        Ok(reference) => Ok(reference),
        Err(error) => Err(("InvalidCompatibilitySchema", full_error_message(&error))),
    };

    let reference = match reference {
        Ok(reference) => reference,
        Err((reason, message)) => {
            return CompatibilityRequirementStatus {
                crd_name: None,
                observed_generation: generation,
                conditions: vec![
                    condition(
                        RequirementConditionType::Admitted,
                        ConditionStatus::False,
                        reason,
                        message,
                    ),
                    condition(
                        RequirementConditionType::Compatible,
                        ConditionStatus::Unknown,
                        reason,
                        String::new(),
                    ),
                ],
            };
        }
    };

    let crd_name = reference.name_any();
    let admitted = condition(
        RequirementConditionType::Admitted,
        ConditionStatus::True,
        "Admitted",
        String::new(),
    );

    let compatible = match live_crd {
        None => condition(
            RequirementConditionType::Compatible,
            ConditionStatus::Unknown,
            "CrdNotFound",
            format!("CustomResourceDefinition {crd_name:?} is not installed"),
        ),
        Some(live_crd) => {
            let findings = prune_excluded_fields(&reference, requirement.excluded_fields())
                .map_err(|errors| ("InvalidExcludedFields", errors.to_string()))
                .and_then(|required| {
                    checker
                        .check_compatibility(&required, live_crd)
                        .map_err(|error| ("CheckFailed", full_error_message(&error)))
                });

            match findings {
                Ok(findings) if findings.errors.is_empty() => condition(
                    RequirementConditionType::Compatible,
                    ConditionStatus::True,
                    "Compatible",
                    findings.warnings.join("\n"),
                ),
                Ok(findings) => condition(
                    RequirementConditionType::Compatible,
                    ConditionStatus::False,
                    "Incompatible",
                    findings.errors.join("\n"),
                ),
                Err((reason, message)) => condition(
                    RequirementConditionType::Compatible,
                    ConditionStatus::False,
                    reason,
                    message,
                ),
            }
        }
    };

    CompatibilityRequirementStatus {
        crd_name: Some(crd_name),
        observed_generation: generation,
        conditions: vec![admitted, compatible],
    }
}
