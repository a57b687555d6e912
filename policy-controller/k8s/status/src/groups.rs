use anyhow::{Context, Result};
use iam_policy_controller_core::GroupMembership;
use iam_policy_controller_k8s_api::{Api, ApiResource, Client, DynamicObject, GroupVersionKind};
use tracing::debug;

const GROUP: &str = "user.openshift.io";
const VERSION: &str = "v1";
const KIND: &str = "Group";
const PLURAL: &str = "groups";

/// Resolves group members from OpenShift `Group` objects.
#[derive(Clone)]
pub struct OpenShiftGroups {
    api: Api<DynamicObject>,
}

// === impl OpenShiftGroups ===

impl OpenShiftGroups {
    pub fn new(client: Client) -> Self {
        let gvk = GroupVersionKind::gvk(GROUP, VERSION, KIND);
        let resource = ApiResource::from_gvk_with_plural(&gvk, PLURAL);
        Self {
            api: Api::all_with(client, &resource),
        }
    }
}

#[async_trait::async_trait]
impl GroupMembership for OpenShiftGroups {
    async fn group_members(&self, group: &str) -> Result<Vec<String>> {
        let obj = self
            .api
            .get_opt(group)
            .await
            .with_context(|| format!("failed to get group {group}"))?;
        match obj {
            Some(obj) => Ok(members(&obj)),
            None => {
                debug!(%group, "Group not found");
                Ok(vec![])
            }
        }
    }
}

/// Reads the `users` field of a group. A missing or malformed field has no
/// members.
fn members(group: &DynamicObject) -> Vec<String> {
    let Some(users) = group.data.get("users") else {
        return vec![];
    };
    match serde_json::from_value::<Option<Vec<String>>>(users.clone()) {
        Ok(users) => users.unwrap_or_default(),
        Err(error) => {
            debug!(group = ?group.metadata.name, %error, "Ignoring malformed group users");
            vec![]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn group(data: serde_json::Value) -> DynamicObject {
        let gvk = GroupVersionKind::gvk(GROUP, VERSION, KIND);
        let resource = ApiResource::from_gvk_with_plural(&gvk, PLURAL);
        DynamicObject::new("admins", &resource).data(data)
    }

    #[test]
    fn reads_users() {
        let obj = group(json!({ "users": ["tom.hanks", "han.solo"] }));
        assert_eq!(members(&obj), vec!["tom.hanks", "han.solo"]);
    }

    #[test]
    fn missing_users() {
        assert_eq!(members(&group(json!({}))), Vec::<String>::new());
        assert_eq!(members(&group(json!({ "users": null }))), Vec::<String>::new());
    }

    #[test]
    fn malformed_users() {
        assert_eq!(
            members(&group(json!({ "users": "tom.hanks" }))),
            Vec::<String>::new()
        );
        assert_eq!(
            members(&group(json!({ "users": [1, 2] }))),
            Vec::<String>::new()
        );
    }
}
