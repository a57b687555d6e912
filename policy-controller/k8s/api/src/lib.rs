#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod labels;
pub mod policy;

pub use self::policy::{
    ComplianceState, CompliancyDetail, IamPolicy, IamPolicySpec, IamPolicyStatus,
    RemediationAction, Target,
};
pub use k8s_openapi::{
    api::{
        self,
        coordination::v1::Lease,
        core::v1::ObjectReference,
        rbac::v1::{ClusterRoleBinding, RoleRef, Subject},
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
pub use kube::{
    api::{Api, ListParams, ObjectMeta, Patch, PatchParams, PostParams, Resource, ResourceExt},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client, Error,
};

/// The `apiVersion` of the parent `Policy` aggregator.
pub const PARENT_POLICY_API_VERSION: &str = "policy.open-cluster-management.io/v1";

pub const PARENT_POLICY_KIND: &str = "Policy";

/// Kind of a role reference that binds a cluster-scoped role.
pub const CLUSTER_ROLE_KIND: &str = "ClusterRole";

