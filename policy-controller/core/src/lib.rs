#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod compliance;
pub mod pattern;
pub mod principals;
mod registry;

pub use self::{
    pattern::{match_names, NamePattern},
    principals::{GroupMembership, InvalidIgnorePattern, Principals},
    registry::{Registry, ResourceId, SharedPolicy},
};

pub const CONTROLLER_NAME: &str = "iam-policy-controller";

/// Scope label of violations found in cluster-scoped bindings.
pub const CLUSTER_WIDE: &str = "cluster-wide";
