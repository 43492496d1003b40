//! HTTP surface of the admission webhooks.
//!
//! The CustomResourceDefinition validation webhook is served on a fixed path. The object pruning
//! webhook is registered once per [`CompatibilityRequirement`](crate::crd::CompatibilityRequirement),
//! the name of the requirement is the last segment of its path.
use std::{error::Error, sync::Arc};

use axum::{
    Extension, Json, Router,
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::core::{
    DynamicObject,
    admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
};
use snafu::{Snafu, ensure};

pub use crd_validation::CrdValidationWebhook;
pub use object_pruning::ObjectPruningWebhook;

pub mod crd_validation;
pub mod object_pruning;

pub const CRD_VALIDATION_PATH: &str = "/validate-customresourcedefinition-compatibility";
pub const OBJECT_PRUNING_PATH_PREFIX: &str = "/compatibility-requirement-object-pruning/";

#[derive(Debug, PartialEq, Snafu)]
pub enum PathError {
    #[snafu(display("path {path:?} does not start with {prefix:?}"))]
    MissingPrefix { path: String, prefix: String },

    #[snafu(display("path {path:?} does not contain a CompatibilityRequirement name"))]
    EmptyRequirementName { path: String },

    #[snafu(display("path {path:?} contains more than one segment after the prefix"))]
    NestedRequirementName { path: String },
}

/// Returns the requirement name encoded in the request `path`, which is the single segment
/// following `prefix`.
pub fn requirement_name_from_path<'a>(path: &'a str, prefix: &str) -> Result<&'a str, PathError> {
    let name = path
        .strip_prefix(prefix)
        .ok_or_else(|| PathError::MissingPrefix {
            path: path.to_owned(),
            prefix: prefix.to_owned(),
        })?;

    ensure!(!name.is_empty(), EmptyRequirementNameSnafu { path });
    ensure!(!name.contains('/'), NestedRequirementNameSnafu { path });

    Ok(name)
}

/// The name of the [`CompatibilityRequirement`](crate::crd::CompatibilityRequirement) an object
/// pruning request was sent for. Inserted as a request extension by the routing middleware.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequirementName(pub String);

async fn extract_requirement_name(mut request: Request, next: Next) -> Response {
    let requirement_name =
        requirement_name_from_path(request.uri().path(), OBJECT_PRUNING_PATH_PREFIX)
            .map(|name| RequirementName(name.to_owned()));

    match requirement_name {
        Ok(requirement_name) => {
            request.extensions_mut().insert(requirement_name);
            next.run(request).await
        }
        Err(err) => {
            tracing::debug!(error = %err, "rejecting object pruning request");
            (StatusCode::BAD_REQUEST, err.to_string()).into_response()
        }
    }
}

#[derive(Clone)]
struct WebhookState {
    crd_validation: Arc<CrdValidationWebhook>,
    object_pruning: Arc<ObjectPruningWebhook>,
}

/// Builds the [`Router`] serving both webhooks and the `/health` endpoint.
pub fn router(
    crd_validation: Arc<CrdValidationWebhook>,
    object_pruning: Arc<ObjectPruningWebhook>,
) -> Router {
    let state = WebhookState {
        crd_validation,
        object_pruning,
    };

    let object_pruning_route = format!("{OBJECT_PRUNING_PATH_PREFIX}{{*requirement}}");
    tracing::debug!(
        crd_validation_route = CRD_VALIDATION_PATH,
        %object_pruning_route,
        "registering webhook routes"
    );

    Router::new()
        .route(CRD_VALIDATION_PATH, post(validate_crd))
        .route(
            &object_pruning_route,
            post(prune_object).route_layer(middleware::from_fn(extract_requirement_name)),
        )
        .with_state(state)
        .route("/health", get(|| async { "ok" }))
}

async fn validate_crd(
    State(state): State<WebhookState>,
    Json(review): Json<AdmissionReview<CustomResourceDefinition>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<CustomResourceDefinition> = match review.try_into() {
        Ok(request) => request,
        Err(err) => {
            return Json(
                AdmissionResponse::invalid(format!("failed to convert to request: {err}"))
                    .into_review(),
            );
        }
    };

    let response = state.crd_validation.handle(&request).await;
    Json(response.into_review())
}

async fn prune_object(
    State(state): State<WebhookState>,
    Extension(RequirementName(requirement_name)): Extension<RequirementName>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(request) => request,
        Err(err) => {
            return Json(
                AdmissionResponse::invalid(format!("failed to convert to request: {err}"))
                    .into_review(),
            );
        }
    };

    let response = state
        .object_pruning
        .handle(&requirement_name, &request)
        .await;
    Json(response.into_review())
}

/// Renders `error` followed by all of its sources, separated by `": "`.
pub(crate) fn full_error_message(error: &(dyn Error + 'static)) -> String {
    std::iter::successors(Some(error), |&error| error.source())
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(": ")
}
