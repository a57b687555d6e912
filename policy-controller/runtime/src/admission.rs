use crate::{
    core::{Registry, ResourceId},
    k8s::{labels, Api, Client, IamPolicy, PostParams},
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, info, warn};

/// Delay before retrying a policy whose labels could not be corrected.
const LABEL_RETRY: Duration = Duration::from_secs(5);

/// Reads and writes `IamPolicy` resources.
#[async_trait::async_trait]
pub trait PolicyStore {
    /// Fetches the policy, or `None` if it no longer exists.
    async fn get(&self, id: &ResourceId) -> Result<Option<IamPolicy>>;

    /// Replaces the policy's metadata and spec, returning the stored object.
    async fn replace(&self, policy: &IamPolicy) -> Result<IamPolicy>;
}

/// Stores policies in the cluster.
#[derive(Clone)]
pub struct ClusterStore {
    client: Client,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reconciled {
    Done,
    Requeue(Duration),
}

/// Curates the registry as policies are created, changed, and deleted.
///
/// Compliance is never computed here; the background loop evaluates whatever
/// is registered.
pub struct Admission<S> {
    registry: Arc<Registry>,
    store: S,
}

// === impl ClusterStore ===

impl ClusterStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<IamPolicy> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl PolicyStore for ClusterStore {
    async fn get(&self, id: &ResourceId) -> Result<Option<IamPolicy>> {
        self.api(&id.namespace)
            .get_opt(&id.name)
            .await
            .with_context(|| format!("failed to get IamPolicy {id}"))
    }

    async fn replace(&self, policy: &IamPolicy) -> Result<IamPolicy> {
        let id = ResourceId::of(policy);
        self.api(&id.namespace)
            .replace(&id.name, &PostParams::default(), policy)
            .await
            .with_context(|| format!("failed to update IamPolicy {id}"))
    }
}

// === impl Admission ===

impl<S: PolicyStore> Admission<S> {
    pub fn new(registry: Arc<Registry>, store: S) -> Self {
        Self { registry, store }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Registers the current version of the policy, or unregisters it if it
    /// no longer exists.
    pub async fn reconcile(&self, id: &ResourceId) -> Result<Reconciled> {
        let Some(mut policy) = self.store.get(id).await? else {
            let removed = self.registry.remove_policy(id);
            info!(%id.namespace, %id.name, removed, "IamPolicy deleted");
            return Ok(Reconciled::Done);
        };

        // Finalizers may keep a deleted policy around; it is no longer evaluated.
        if policy.metadata.deletion_timestamp.is_some() {
            let removed = self.registry.remove_policy(id);
            info!(%id.namespace, %id.name, removed, "IamPolicy is being deleted");
            return Ok(Reconciled::Done);
        }

        if labels::ensure_category(&mut policy.metadata) {
            match self.store.replace(&policy).await {
                Ok(updated) => {
                    debug!(%id.namespace, %id.name, "Corrected {} label", labels::CATEGORY);
                    policy = updated;
                }
                Err(error) => {
                    warn!(%id.namespace, %id.name, %error, "Failed to correct labels");
                    return Ok(Reconciled::Requeue(LABEL_RETRY));
                }
            }
        }

        // The next evaluation rewrites the details from scratch.
        if let Some(status) = policy.status.as_mut() {
            status.clear_details();
        }

        let key = self.registry.add_policy(policy);
        info!(%key, "IamPolicy registered");
        Ok(Reconciled::Done)
    }
}

/// True if the registered policy is at `generation`.
pub(crate) fn is_admitted(registry: &Registry, id: &ResourceId, generation: Option<i64>) -> bool {
    generation.is_some()
        && registry
            .get(&id.key())
            .map(|p| p.lock().metadata.generation == generation)
            .unwrap_or(false)
}
