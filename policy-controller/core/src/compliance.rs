//! Derives a policy's compliance from the users bound to its cluster role.
//!
//! Each evaluation records a violation count and a display message for a
//! scope of the policy, then recomputes the compliance state from every
//! recorded scope. The structured count is authoritative; the message is
//! parsed only when a status was written without counts. A message that can't
//! be parsed is overwritten.

use crate::principals::{InvalidIgnorePattern, Principals};
use iam_policy_controller_k8s_api::{ComplianceState, IamPolicy, IamPolicyStatus};
use regex::Regex;

const UNDETERMINED: &str = "ComplianceState is still undetermined";

/// The outcome of evaluating a single policy.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Evaluation {
    /// The status changed and must be persisted.
    Updated,

    /// The status is identical to the previous evaluation.
    Unchanged,

    /// The user count could not be determined and the known state was kept.
    Suppressed,
}

/// Number of users above the allowed maximum. A `None` maximum disables the
/// check.
pub fn violation_count(observed: usize, max: Option<u64>) -> u64 {
    match max {
        Some(max) => (observed as u64).saturating_sub(max),
        None => 0,
    }
}

pub fn violation_message(role: &str, count: u64) -> String {
    format!("The number of users with the {role} role is at least {count} above the specified limit")
}

/// Recovers the count from a message produced by [`violation_message`].
pub fn parse_violation_count(message: &str, role: &str) -> Option<u64> {
    let re = Regex::new(&format!(
        r"^(?:The number of users with the {} role is at least )(\d+)(?: above the specified limit)$",
        regex::escape(role)
    ))
    .ok()?;
    re.captures(message)?.get(1)?.as_str().parse().ok()
}

/// Records `count` as the violation count of `scope`, replacing the scope's
/// message. Returns false if the count matches the previously recorded one, in
/// which case the message is left untouched.
pub fn record_violation(policy: &mut IamPolicy, role: &str, count: u64, scope: &str) -> bool {
    let name = policy.metadata.name.clone().unwrap_or_default();
    let status = policy.status.get_or_insert_with(Default::default);
    let messages = status
        .compliancy_details
        .entry(name)
        .or_default()
        .entry(scope.to_string())
        .or_default();

    let previous = messages.first().and_then(|msg| {
        status
            .violation_counts
            .get(scope)
            .copied()
            .or_else(|| parse_violation_count(msg, role))
    });
    status.violation_counts.insert(scope.to_string(), count);

    if previous == Some(count) {
        return false;
    }

    let message = violation_message(role, count);
    match messages.first_mut() {
        Some(first) => *first = message,
        None => messages.push(message),
    }
    true
}

/// Recomputes the compliance state from the recorded violations. A policy
/// without recorded violations is compliant.
pub fn derive_state(policy: &mut IamPolicy, role: &str) {
    let name = policy.metadata.name.as_deref().unwrap_or_default();
    let status = policy.status.get_or_insert_with(Default::default);

    let non_compliant = status
        .compliancy_details
        .get(name)
        .into_iter()
        .flatten()
        .any(|(scope, _)| recorded_count(status, name, scope, role).unwrap_or(0) != 0);

    status.compliance_state = Some(if non_compliant {
        ComplianceState::NonCompliant
    } else {
        ComplianceState::Compliant
    });
}

/// Evaluates `policy` against the users resolved for its cluster role and
/// records the result under `scope`.
///
/// When the users could not be fully resolved, a state that may be wrong is
/// never recorded: a known violation keeps the policy non-compliant, and a
/// policy that isn't already compliant is left as is.
pub fn evaluate(
    policy: &mut IamPolicy,
    scope: &str,
    resolved: Result<&Principals, &InvalidIgnorePattern>,
) -> Evaluation {
    let role = policy.spec.cluster_role().to_string();
    let (observed, indeterminate) = match resolved {
        Ok(principals) => (principals.count(), principals.is_partial()),
        Err(_) => (0, true),
    };
    let count = violation_count(observed, policy.spec.max_users());

    if indeterminate {
        let state = policy
            .status
            .as_ref()
            .map(IamPolicyStatus::state)
            .unwrap_or(ComplianceState::UnknownCompliancy);
        let known = if count > 0 {
            state == ComplianceState::NonCompliant
        } else {
            state != ComplianceState::Compliant
        };
        if known {
            return Evaluation::Suppressed;
        }
    }

    let before = policy.status.clone();
    record_violation(policy, &role, count, scope);
    derive_state(policy, &role);
    if policy.status == before {
        Evaluation::Unchanged
    } else {
        Evaluation::Updated
    }
}

/// Renders the status as an event note: the state followed by the messages of
/// each scope. Compliant scopes are omitted from a non-compliant summary.
pub fn summarize(policy: &IamPolicy) -> String {
    let Some(status) = policy.status.as_ref() else {
        return UNDETERMINED.to_string();
    };
    let Some(state) = status.compliance_state else {
        return UNDETERMINED.to_string();
    };

    let name = policy.metadata.name.as_deref().unwrap_or_default();
    let role = policy.spec.cluster_role();
    let mut summary = state.to_string();
    for (scope, messages) in status.compliancy_details.get(name).into_iter().flatten() {
        if state == ComplianceState::NonCompliant
            && recorded_count(status, name, scope, role) == Some(0)
        {
            continue;
        }
        summary.push_str("; ");
        summary.push_str(&messages.join(", "));
    }
    summary
}

fn recorded_count(status: &IamPolicyStatus, name: &str, scope: &str, role: &str) -> Option<u64> {
    let first = status
        .compliancy_details
        .get(name)?
        .get(scope)?
        .first()?;
    status
        .violation_counts
        .get(scope)
        .copied()
        .or_else(|| parse_violation_count(first, role))
}
