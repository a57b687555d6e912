use crate::FIELD_MANAGER;
use anyhow::{bail, Context, Result};
use iam_policy_controller_core::{compliance, ResourceId, CONTROLLER_NAME};
use iam_policy_controller_k8s_api::{
    labels, Api, Client, ComplianceState, IamPolicy, ObjectReference, Patch, PatchParams,
    Resource, PARENT_POLICY_API_VERSION, PARENT_POLICY_KIND,
};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use std::{str::FromStr, sync::Arc};
use tracing::{debug, warn};

const EVENT_ACTION: &str = "ComplianceCheck";

/// Persists an evaluated policy's status.
#[async_trait::async_trait]
pub trait PublishStatus {
    async fn publish(&self, policy: &IamPolicy) -> Result<()>;
}

/// Whether status events are also emitted on a policy's parent.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ParentEvents {
    Yes,
    No,
    #[default]
    IfPresent,
}

/// Settings shared by the evaluation loop and the publisher. Fixed at
/// startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub cluster_name: String,

    /// The namespace policies are watched in, if restricted to one.
    pub watched_namespace: Option<String>,

    pub parent_events: ParentEvents,
}

/// Writes the status subresource and records events about it.
pub struct Publisher {
    client: Client,
    recorder: Recorder,
    config: Arc<Config>,
}

// === impl ParentEvents ===

impl FromStr for ParentEvents {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "yes" => Ok(Self::Yes),
            "no" => Ok(Self::No),
            "ifpresent" => Ok(Self::IfPresent),
            _ => bail!("invalid parent event mode: {s} (expected yes, no, or ifpresent)"),
        }
    }
}

// === impl Publisher ===

impl Publisher {
    pub fn new(client: Client, config: Arc<Config>) -> Self {
        let reporter = Reporter {
            controller: CONTROLLER_NAME.to_string(),
            instance: std::env::var("HOSTNAME").ok(),
        };
        Self {
            recorder: Recorder::new(client.clone(), reporter),
            client,
            config,
        }
    }

    async fn record(&self, event: &Event, reference: &ObjectReference) {
        if let Err(error) = self.recorder.publish(event, reference).await {
            warn!(
                kind = ?reference.kind,
                namespace = ?reference.namespace,
                name = ?reference.name,
                %error,
                "Failed to record event"
            );
        }
    }
}

#[async_trait::async_trait]
impl PublishStatus for Publisher {
    async fn publish(&self, policy: &IamPolicy) -> Result<()> {
        let id = ResourceId::of(policy);
        let api = Api::<IamPolicy>::namespaced(self.client.clone(), &id.namespace);
        let patch = Patch::Merge(serde_json::json!({ "status": policy.status }));
        api.patch_status(&id.name, &PatchParams::apply(FIELD_MANAGER), &patch)
            .await
            .with_context(|| format!("failed to update status of IamPolicy {id}"))?;
        debug!(%id.namespace, %id.name, "Updated status");

        let event = status_event(policy);
        if self.config.parent_events != ParentEvents::No {
            if let Some(parent) = parent_reference(policy, self.config.watched_namespace.as_deref())
            {
                self.record(&event, &parent).await;
            }
        }
        self.record(&event, &policy.object_ref(&())).await;

        Ok(())
    }
}

/// Summarizes a policy's status as an event.
fn status_event(policy: &IamPolicy) -> Event {
    let non_compliant = policy
        .status
        .as_ref()
        .and_then(|s| s.compliance_state)
        == Some(ComplianceState::NonCompliant);
    Event {
        type_: if non_compliant {
            EventType::Warning
        } else {
            EventType::Normal
        },
        reason: format!(
            "policy: {}/{}",
            policy.metadata.namespace.as_deref().unwrap_or_default(),
            policy.metadata.name.as_deref().unwrap_or_default(),
        ),
        note: Some(compliance::summarize(policy)),
        action: EVENT_ACTION.to_string(),
        secondary: None,
    }
}

/// References the `Policy` that owns `policy`, if its first owner reference
/// carries a UID.
///
/// The parent lives in the namespace named by the cluster-namespace label,
/// falling back to the watched namespace and then to the policy's own.
fn parent_reference(policy: &IamPolicy, watched_namespace: Option<&str>) -> Option<ObjectReference> {
    let owner = policy.metadata.owner_references.as_ref()?.first()?;
    if owner.uid.is_empty() {
        return None;
    }

    let namespace = labels::cluster_namespace(&policy.metadata)
        .or(watched_namespace.filter(|ns| !ns.is_empty()))
        .or(policy.metadata.namespace.as_deref())?;

    Some(ObjectReference {
        api_version: Some(PARENT_POLICY_API_VERSION.to_string()),
        kind: Some(PARENT_POLICY_KIND.to_string()),
        namespace: Some(namespace.to_string()),
        name: Some(owner.name.clone()),
        uid: Some(owner.uid.clone()),
        ..Default::default()
    })
}
