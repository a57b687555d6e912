use anyhow::Result;
use iam_policy_controller_k8s_api::{Api, ClusterRoleBinding, ListParams};

/// Lists the cluster-scoped role bindings evaluated on each tick.
#[async_trait::async_trait]
pub trait ListBindings {
    async fn list_bindings(&self) -> Result<Vec<ClusterRoleBinding>>;
}

#[async_trait::async_trait]
impl ListBindings for Api<ClusterRoleBinding> {
    async fn list_bindings(&self) -> Result<Vec<ClusterRoleBinding>> {
        let list = self.list(&ListParams::default()).await?;
        Ok(list.items)
    }
}
