use crate::{
    admission::{Admission, ClusterStore},
    core::Registry,
    dispatch::Dispatcher,
    k8s::{Api, Client, ClusterRoleBinding, IamPolicy},
    lease, status,
};
use anyhow::{bail, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry as Prometheus;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::time::Duration;
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "iam-policy-controller",
    about = "Reports the compliance of IamPolicy resources"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "iam_policy_controller=info,warn",
        env = "IAM_POLICY_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Seconds between evaluations of all policies.
    #[clap(long, default_value = "10")]
    update_frequency: u64,

    /// Whether status events are also sent to the parent policy: yes, no, or
    /// ifpresent.
    #[clap(long, default_value = "ifpresent")]
    parent_event: status::ParentEvents,

    #[clap(long, default_value = "mcm-managed-cluster")]
    cluster_name: String,

    /// Restricts the watch to a single namespace.
    #[clap(long, env = "WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// Reports liveness by renewing a lease.
    #[clap(long)]
    enable_lease: bool,

    /// The namespace the controller runs in, where its lease is kept.
    #[clap(long, env = "POD_NAMESPACE")]
    lease_namespace: Option<String>,

    #[clap(long, default_value = "/var/run/klusterlet/kubeconfig")]
    hub_kubeconfig_path: PathBuf,

    /// Evaluates bindings and groups in another cluster.
    #[clap(long)]
    target_kubeconfig_path: Option<PathBuf>,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            update_frequency,
            parent_event,
            cluster_name,
            watch_namespace,
            enable_lease,
            lease_namespace,
            hub_kubeconfig_path,
            target_kubeconfig_path,
        } = self;

        let watch_namespace = watch_namespace.filter(|ns| !ns.is_empty());
        let config = Arc::new(status::Config {
            cluster_name,
            watched_namespace: watch_namespace.clone(),
            parent_events: parent_event,
        });

        let mut prom = <Prometheus>::default();
        let metrics =
            status::ControllerMetrics::register(prom.sub_registry_with_prefix("iam_policy"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Bindings and groups may be read from another cluster; policies,
        // statuses, and events always live in this one.
        let target = match target_kubeconfig_path {
            Some(path) => {
                let client = lease::client_from_kubeconfig(&path).await?;
                info!(path = %path.display(), "Evaluating policies against the target cluster");
                client
            }
            None => runtime.client(),
        };

        let registry = Registry::shared();

        let api = match watch_namespace.as_deref() {
            Some(ns) => Api::<IamPolicy>::namespaced(runtime.client(), ns),
            None => Api::<IamPolicy>::all(runtime.client()),
        };
        let policies = runtime.watch(api, watcher::Config::default());
        let dispatcher = Dispatcher::new(Admission::new(
            registry.clone(),
            ClusterStore::new(runtime.client()),
        ));
        tokio::spawn(dispatcher.run(policies).instrument(info_span!("iampolicies")));

        let controller = status::Controller::new(
            registry,
            Api::<ClusterRoleBinding>::all(target.clone()),
            status::OpenShiftGroups::new(target),
            status::Publisher::new(runtime.client(), config.clone()),
            config.clone(),
            metrics,
        );
        let shutdown = runtime.shutdown_handle();
        tokio::spawn(
            controller
                .run(Duration::from_secs(update_frequency), async move {
                    let _release = shutdown.signaled().await;
                })
                .instrument(info_span!("evaluation")),
        );

        if enable_lease {
            let targets = lease_targets(
                runtime.client(),
                lease_namespace,
                &hub_kubeconfig_path,
                &config,
            )
            .await;
            if !targets.is_empty() {
                let shutdown = runtime.shutdown_handle();
                tokio::spawn(
                    lease::run(targets, async move {
                        let _release = shutdown.signaled().await;
                    })
                    .instrument(info_span!("lease")),
                );
            }
        } else {
            info!("Status reporting is not enabled");
        }

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

/// Leases are kept in the controller's namespace and, when the hub is
/// reachable, in the cluster's namespace on the hub.
async fn lease_targets(
    client: Client,
    namespace: Option<String>,
    hub_kubeconfig_path: &Path,
    config: &status::Config,
) -> Vec<lease::Target> {
    let Some(namespace) = namespace.filter(|ns| !ns.is_empty()) else {
        info!("Skipping lease; not running in a cluster");
        return vec![];
    };

    let mut targets = vec![lease::Target::new(client, &namespace)];
    match lease::client_from_kubeconfig(hub_kubeconfig_path).await {
        Ok(hub) => targets.push(lease::Target::new(hub, &config.cluster_name)),
        Err(error) => warn!(%error, "Could not load hub config; not reporting to the hub"),
    }
    info!(
        %namespace,
        name = lease::LEASE_NAME,
        hub = targets.len() > 1,
        "Reporting status with a lease"
    );
    targets
}
