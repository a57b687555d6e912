use crate::{Config, ControllerMetrics, ListBindings, PublishStatus};
use iam_policy_controller_core::{
    compliance::{self, Evaluation},
    principals, GroupMembership, Registry, SharedPolicy, CLUSTER_WIDE,
};
use iam_policy_controller_k8s_api::{ClusterRoleBinding, IamPolicy, IamPolicyStatus};
use std::{future::Future, sync::Arc};
use tokio::time::{self, Duration, Instant};
use tracing::{debug, error, info, warn};

/// Periodically evaluates every registered policy and publishes the statuses
/// that changed.
pub struct Controller<L, G, P> {
    registry: Arc<Registry>,
    bindings: L,
    groups: G,
    publisher: P,
    config: Arc<Config>,
    metrics: ControllerMetrics,
}

/// A status that changed during a tick and has yet to be published.
struct Update {
    key: String,
    policy: SharedPolicy,
    previous: Option<IamPolicyStatus>,
    updated: IamPolicy,
}

// === impl Controller ===

impl<L, G, P> Controller<L, G, P>
where
    L: ListBindings + Send + Sync,
    G: GroupMembership + Send + Sync,
    P: PublishStatus + Send + Sync,
{
    pub fn new(
        registry: Arc<Registry>,
        bindings: L,
        groups: G,
        publisher: P,
        config: Arc<Config>,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            registry,
            bindings,
            groups,
            publisher,
            config,
            metrics,
        }
    }

    /// Runs a tick every `period` until `shutdown` completes.
    ///
    /// A tick that takes longer than the period is followed immediately by
    /// the next one. Shutdown is only observed between ticks.
    pub async fn run(self, period: Duration, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        info!(
            ?period,
            cluster = %self.config.cluster_name,
            namespace = self.config.watched_namespace.as_deref().unwrap_or("*"),
            "Evaluating policies"
        );

        loop {
            let started = Instant::now();
            self.tick().await;
            let remaining = period.saturating_sub(started.elapsed());

            tokio::select! {
                biased;
                () = &mut shutdown => {
                    info!("Stopping policy evaluation");
                    return;
                }
                () = time::sleep(remaining) => {}
            }
        }
    }

    /// Evaluates all registered policies once.
    pub async fn tick(&self) {
        self.metrics.ticks.inc();

        // Without the bindings no policy can be evaluated reliably.
        let bindings = match self.bindings.list_bindings().await {
            Ok(bindings) => bindings,
            Err(error) => {
                self.metrics.skipped_ticks.inc();
                error!(%error, "Failed to list ClusterRoleBindings");
                return;
            }
        };

        let policies = self.registry.snapshot();
        self.metrics
            .registered_policies
            .set(policies.len().try_into().unwrap_or(i64::MAX));
        if policies.is_empty() {
            debug!("Waiting for policies to be registered");
            return;
        }

        let mut updates = Vec::new();
        for (key, policy) in policies {
            if let Some(update) = self.evaluate(key, policy, &bindings).await {
                updates.push(update);
            }
        }

        // Each update is independent; a failure doesn't block the others.
        for update in updates {
            self.publish(update).await;
        }
    }

    async fn evaluate(
        &self,
        key: String,
        policy: SharedPolicy,
        bindings: &[ClusterRoleBinding],
    ) -> Option<Update> {
        let (role, ignore) = {
            let policy = policy.lock();
            (
                policy.spec.cluster_role().to_string(),
                policy.spec.ignore_cluster_role_bindings.clone(),
            )
        };

        let resolved = principals::resolve(bindings, &role, &ignore, &self.groups).await;
        if let Err(error) = &resolved {
            warn!(policy = %key, %error, "Failed to resolve users");
        }
        self.metrics.evaluations.inc();

        let mut guard = policy.lock();
        let previous = guard.status.clone();
        match compliance::evaluate(&mut guard, CLUSTER_WIDE, resolved.as_ref()) {
            Evaluation::Updated => {
                let updated = guard.clone();
                drop(guard);
                Some(Update {
                    key,
                    policy,
                    previous,
                    updated,
                })
            }
            Evaluation::Unchanged => None,
            Evaluation::Suppressed => {
                self.metrics.suppressed.inc();
                debug!(policy = %key, "Indeterminate result; keeping the current status");
                None
            }
        }
    }

    async fn publish(&self, update: Update) {
        let Update {
            key,
            policy,
            previous,
            updated,
        } = update;

        match self.publisher.publish(&updated).await {
            Ok(()) => {
                self.metrics.status_updates.inc();
                let state = updated
                    .status
                    .as_ref()
                    .map(IamPolicyStatus::state)
                    .map(|s| s.as_str())
                    .unwrap_or_default();
                info!(policy = %key, %state, "Updated status");
            }
            Err(error) => {
                self.metrics.status_update_failures.inc();
                error!(policy = %key, %error, "Failed to update status");

                // Roll back so that the next tick sees the change again,
                // unless the policy was changed in the meantime.
                let mut policy = policy.lock();
                if policy.status == updated.status {
                    policy.status = previous;
                }
            }
        }
    }
}
