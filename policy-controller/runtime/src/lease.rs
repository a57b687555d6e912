use crate::{
    k8s::{Api, Client, Lease, Patch, PatchParams},
    status::FIELD_MANAGER,
};
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use kube::config::{KubeConfigOptions, Kubeconfig};
use std::{future::Future, path::Path};
use tokio::time;
use tracing::{debug, warn};

pub const LEASE_NAME: &str = "iam-policy-controller";
const LEASE_DURATION: time::Duration = time::Duration::from_secs(60);

/// A lease renewed to report that the controller is alive.
pub struct Target {
    api: Api<Lease>,
    namespace: String,
}

impl Target {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }

    async fn renew(&self) -> Result<()> {
        let patch = lease_patch(Utc::now());
        self.api
            .patch(
                LEASE_NAME,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(patch),
            )
            .await
            .with_context(|| format!("failed to renew lease in {}", self.namespace))?;
        Ok(())
    }
}

/// Builds a client from a kubeconfig file.
pub async fn client_from_kubeconfig(path: &Path) -> Result<Client> {
    let kubeconfig = Kubeconfig::read_from(path)
        .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .with_context(|| format!("invalid kubeconfig {}", path.display()))?;
    Client::try_from(config).context("failed to build client")
}

/// Renews each lease once per lease duration until `shutdown` completes.
pub async fn run(targets: Vec<Target>, shutdown: impl Future<Output = ()>) {
    tokio::pin!(shutdown);
    let mut interval = time::interval(LEASE_DURATION);
    loop {
        tokio::select! {
            biased;
            () = &mut shutdown => return,
            _ = interval.tick() => {}
        }

        for target in &targets {
            match target.renew().await {
                Ok(()) => debug!(namespace = %target.namespace, "Renewed lease"),
                Err(error) => warn!(namespace = %target.namespace, %error, "Failed to renew lease"),
            }
        }
    }
}

fn lease_patch(now: DateTime<Utc>) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "coordination.k8s.io/v1",
        "kind": "Lease",
        "metadata": {
            "name": LEASE_NAME,
        },
        "spec": {
            "holderIdentity": LEASE_NAME,
            "leaseDurationSeconds": LEASE_DURATION.as_secs(),
            "renewTime": now.to_rfc3339_opts(SecondsFormat::Micros, true),
        },
    })
}
