use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// Role evaluated when a policy does not name one.
pub const DEFAULT_CLUSTER_ROLE: &str = "cluster-admin";

/// Ignore pattern used when a policy does not list any.
pub const DEFAULT_IGNORE_CLUSTER_ROLE_BINDINGS: &str = "^system:.+$";

/// Limits the number of users bound to a cluster role.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "policy.open-cluster-management.io",
    version = "v1",
    kind = "IamPolicy",
    plural = "iampolicies",
    status = "IamPolicyStatus",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct IamPolicySpec {
    /// Regular expressions matching the names of cluster role bindings to
    /// ignore. Defaults to ignoring every binding prefixed with `system:`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore_cluster_role_bindings: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation_action: Option<RemediationAction>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<Target>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<BTreeMap<String, String>>,

    /// Maximum number of users that may be bound to the cluster role. A
    /// negative value disables the check.
    #[serde(default)]
    pub max_cluster_role_binding_users: i64,

    /// Name of the cluster role referenced by the bindings. Defaults to
    /// `cluster-admin`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_role: Option<String>,

    /// One of `low`, `medium`, `high`, or `critical`, in lower case or
    /// capitalised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
}

/// Only informing is supported; the controller never mutates bindings, so
/// `Enforce` behaves like `Inform`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum RemediationAction {
    #[serde(alias = "inform")]
    Inform,
    #[serde(alias = "enforce")]
    Enforce,
}

/// Namespaces to include or exclude.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Target {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

/// Violation messages of a policy, keyed by scope label.
pub type CompliancyDetail = BTreeMap<String, Vec<String>>;

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IamPolicyStatus {
    #[serde(
        rename = "compliant",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub compliance_state: Option<ComplianceState>,

    /// Human-readable violation messages, keyed by policy name and then by
    /// scope label. Only the first message of each scope is meaningful.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub compliancy_details: BTreeMap<String, CompliancyDetail>,

    /// The violation count behind each scope's message.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub violation_counts: BTreeMap<String, u64>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ComplianceState {
    Compliant,
    NonCompliant,
    UnknownCompliancy,
}

// === impl IamPolicySpec ===

impl IamPolicySpec {
    /// The cluster role whose bindings are counted.
    pub fn cluster_role(&self) -> &str {
        match self.cluster_role.as_deref() {
            Some(role) if !role.is_empty() => role,
            _ => DEFAULT_CLUSTER_ROLE,
        }
    }

    /// The effective ignore patterns. A non-empty list replaces the default
    /// rather than extending it.
    pub fn ignore_patterns(&self) -> Vec<String> {
        if self.ignore_cluster_role_bindings.is_empty() {
            return vec![DEFAULT_IGNORE_CLUSTER_ROLE_BINDINGS.to_string()];
        }
        self.ignore_cluster_role_bindings.clone()
    }

    /// The maximum number of users, or `None` when the check is disabled.
    pub fn max_users(&self) -> Option<u64> {
        u64::try_from(self.max_cluster_role_binding_users).ok()
    }
}

// === impl IamPolicyStatus ===

impl IamPolicyStatus {
    /// The recorded state, treating an absent state as unknown.
    pub fn state(&self) -> ComplianceState {
        self.compliance_state
            .unwrap_or(ComplianceState::UnknownCompliancy)
    }

    /// Drops all recorded details so that the next evaluation starts over.
    pub fn clear_details(&mut self) {
        self.compliancy_details.clear();
        self.violation_counts.clear();
    }
}

// === impl ComplianceState ===

impl ComplianceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compliant => "Compliant",
            Self::NonCompliant => "NonCompliant",
            Self::UnknownCompliancy => "UnknownCompliancy",
        }
    }
}

impl fmt::Display for ComplianceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn spec_defaults() {
        let spec: IamPolicySpec = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(spec.cluster_role(), DEFAULT_CLUSTER_ROLE);
        assert_eq!(
            spec.ignore_patterns(),
            vec![DEFAULT_IGNORE_CLUSTER_ROLE_BINDINGS.to_string()]
        );
        assert_eq!(spec.max_users(), Some(0));
    }

    #[test]
    fn ignore_patterns_replace_default() {
        let spec = IamPolicySpec {
            ignore_cluster_role_bindings: vec!["^tom.*".to_string()],
            ..Default::default()
        };
        assert_eq!(spec.ignore_patterns(), vec!["^tom.*".to_string()]);
    }

    #[test]
    fn negative_max_disables_check() {
        let spec = IamPolicySpec {
            max_cluster_role_binding_users: -1,
            ..Default::default()
        };
        assert_eq!(spec.max_users(), None);
    }

    #[test]
    fn empty_cluster_role_uses_default() {
        let spec = IamPolicySpec {
            cluster_role: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(spec.cluster_role(), DEFAULT_CLUSTER_ROLE);
    }

    #[test]
    fn status_wire_format() {
        let status = IamPolicyStatus {
            compliance_state: Some(ComplianceState::NonCompliant),
            compliancy_details: maplit::btreemap! {
                "foo".to_string() => maplit::btreemap! {
                    "cluster-wide".to_string() => vec!["msg".to_string()],
                },
            },
            violation_counts: maplit::btreemap! { "cluster-wide".to_string() => 2 },
        };
        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            serde_json::json!({
                "compliant": "NonCompliant",
                "compliancyDetails": { "foo": { "cluster-wide": ["msg"] } },
                "violationCounts": { "cluster-wide": 2 },
            })
        );

        let empty: IamPolicyStatus = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(empty.state(), ComplianceState::UnknownCompliancy);
    }

    #[test]
    fn remediation_action_accepts_both_cases() {
        for (s, expected) in [
            ("Inform", RemediationAction::Inform),
            ("inform", RemediationAction::Inform),
            ("Enforce", RemediationAction::Enforce),
            ("enforce", RemediationAction::Enforce),
        ] {
            let action: RemediationAction = serde_json::from_value(serde_json::json!(s)).unwrap();
            assert_eq!(action, expected, "{s}");
        }
    }

    #[test]
    fn enforcing_policy_deserializes() {
        let policy: IamPolicy = serde_json::from_value(serde_json::json!({
            "apiVersion": "policy.open-cluster-management.io/v1",
            "kind": "IamPolicy",
            "metadata": { "name": "foo", "namespace": "default" },
            "spec": {
                "remediationAction": "enforce",
                "maxClusterRoleBindingUsers": 2,
                "severity": "critical",
            },
        }))
        .unwrap();
        assert_eq!(
            policy.spec.remediation_action,
            Some(RemediationAction::Enforce)
        );
        assert_eq!(policy.spec.max_users(), Some(2));
    }
}
