#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod bindings;
mod controller;
mod groups;
mod metrics;
mod publish;


pub use self::{
    bindings::ListBindings,
    controller::Controller,
    groups::OpenShiftGroups,
    metrics::ControllerMetrics,
    publish::{Config, ParentEvents, PublishStatus, Publisher},
};

/// Field manager of status patches and lease applies.
pub const FIELD_MANAGER: &str = "iam-policy-controller";
