#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use iam_policy_controller_core as core;
pub use iam_policy_controller_k8s_api as k8s;
pub use iam_policy_controller_k8s_status as status;

mod admission;
mod args;
mod dispatch;
mod lease;

#[cfg(test)]
mod tests;

pub use self::{
    admission::{Admission, ClusterStore, PolicyStore, Reconciled},
    args::Args,
    dispatch::Dispatcher,
};
