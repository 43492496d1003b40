//! Guards CustomResourceDefinitions against incompatible schema changes.
//!
//! A [`CompatibilityRequirement`](crd::CompatibilityRequirement) stores a reference copy of a
//! CustomResourceDefinition. This crate provides
//!
//! - a validating admission webhook which compares changes to the CustomResourceDefinition against
//!   all requirements referring to it ([`webhooks::CrdValidationWebhook`]),
//! - a mutating admission webhook which prunes custom resources down to the reference schema
//!   ([`webhooks::ObjectPruningWebhook`]),
//! - a controller maintaining the status of the requirements
//!   ([`controller::RequirementStatusController`]).
pub mod cache;
pub mod checker;
pub mod controller;
pub mod crd;
pub mod pruning;
pub mod schema;
pub mod store;
pub mod webhooks;
