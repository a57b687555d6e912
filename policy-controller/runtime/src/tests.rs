use crate::{
    core::{Registry, ResourceId},
    k8s::{labels, ComplianceState, IamPolicy, IamPolicySpec, IamPolicyStatus, ObjectMeta},
    Admission, Dispatcher, PolicyStore, Reconciled,
};
use anyhow::{bail, Result};
use futures::{stream, StreamExt};
use kube::runtime::watcher::Event;
use maplit::btreemap;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::time;

#[derive(Clone, Default)]
struct Store {
    policies: Arc<Mutex<HashMap<ResourceId, IamPolicy>>>,
    gets: Arc<AtomicUsize>,
    replaces: Arc<AtomicUsize>,
    failed_gets: Arc<AtomicBool>,
    // Number of replaces that fail before one succeeds.
    failed_replaces: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl PolicyStore for Store {
    async fn get(&self, id: &ResourceId) -> Result<Option<IamPolicy>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.failed_gets.load(Ordering::SeqCst) {
            bail!("connection refused");
        }
        Ok(self.policies.lock().get(id).cloned())
    }

    async fn replace(&self, policy: &IamPolicy) -> Result<IamPolicy> {
        self.replaces.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failed_replaces
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failed.is_ok() {
            bail!("the object has been modified");
        }
        self.policies
            .lock()
            .insert(ResourceId::of(policy), policy.clone());
        Ok(policy.clone())
    }
}

impl Store {
    fn insert(&self, policy: IamPolicy) {
        self.policies.lock().insert(ResourceId::of(&policy), policy);
    }

    fn remove(&self, name: &str) {
        self.policies.lock().remove(&ResourceId::new("default", name));
    }
}

fn policy(name: &str, generation: i64) -> IamPolicy {
    IamPolicy {
        metadata: ObjectMeta {
            namespace: Some("default".to_string()),
            name: Some(name.to_string()),
            generation: Some(generation),
            ..Default::default()
        },
        spec: IamPolicySpec {
            max_cluster_role_binding_users: 1,
            ..Default::default()
        },
        status: None,
    }
}

fn labeled(mut policy: IamPolicy) -> IamPolicy {
    labels::ensure_category(&mut policy.metadata);
    policy
}

fn with_status(mut policy: IamPolicy) -> IamPolicy {
    policy.status = Some(IamPolicyStatus {
        compliance_state: Some(ComplianceState::NonCompliant),
        compliancy_details: btreemap! {
            "foo".to_string() => btreemap! {
                "cluster-wide".to_string() => vec!["stale".to_string()],
            },
        },
        violation_counts: btreemap! { "cluster-wide".to_string() => 2 },
    });
    policy
}

fn id(name: &str) -> ResourceId {
    ResourceId::new("default", name)
}

fn admission(store: &Store) -> Admission<Store> {
    Admission::new(Registry::shared(), store.clone())
}

#[tokio::test]
async fn registers_with_category_label() {
    let store = Store::default();
    store.insert(policy("foo", 1));
    let admission = admission(&store);

    let reconciled = admission.reconcile(&id("foo")).await.unwrap();
    assert_eq!(reconciled, Reconciled::Done);
    assert_eq!(store.replaces.load(Ordering::SeqCst), 1);

    let registered = admission.registry().get("default.foo").unwrap();
    let registered = registered.lock();
    let category = registered
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(labels::CATEGORY))
        .cloned();
    assert_eq!(category.as_deref(), Some(labels::GRC_CATEGORY));
}

#[tokio::test]
async fn correct_labels_are_not_rewritten() {
    let store = Store::default();
    store.insert(labeled(policy("foo", 1)));
    let admission = admission(&store);

    admission.reconcile(&id("foo")).await.unwrap();
    assert_eq!(store.replaces.load(Ordering::SeqCst), 0);
    assert_eq!(admission.registry().len(), 1);
}

#[tokio::test]
async fn clears_details_but_keeps_state() {
    let store = Store::default();
    store.insert(labeled(with_status(policy("foo", 1))));
    let admission = admission(&store);

    admission.reconcile(&id("foo")).await.unwrap();

    let registered = admission.registry().get("default.foo").unwrap();
    let status = registered.lock().status.clone().unwrap();
    assert_eq!(status.compliance_state, Some(ComplianceState::NonCompliant));
    assert!(status.compliancy_details.is_empty());
    assert!(status.violation_counts.is_empty());
}

#[tokio::test]
async fn deleted_policies_are_unregistered() {
    let store = Store::default();
    store.insert(labeled(policy("foo", 1)));
    store.insert(labeled(policy("bar", 1)));
    let admission = admission(&store);
    admission.reconcile(&id("foo")).await.unwrap();
    admission.reconcile(&id("bar")).await.unwrap();
    assert_eq!(admission.registry().len(), 2);

    store.remove("foo");
    let reconciled = admission.reconcile(&id("foo")).await.unwrap();
    assert_eq!(reconciled, Reconciled::Done);
    assert!(admission.registry().get("default.foo").is_none());
    assert!(admission.registry().get("default.bar").is_some());

    // Already gone.
    assert_eq!(
        admission.reconcile(&id("foo")).await.unwrap(),
        Reconciled::Done
    );
}

#[tokio::test]
async fn terminating_policies_are_unregistered() {
    let store = Store::default();
    store.insert(labeled(policy("foo", 1)));
    let admission = admission(&store);
    admission.reconcile(&id("foo")).await.unwrap();
    assert_eq!(admission.registry().len(), 1);

    // Unlabeled, held by a finalizer.
    let mut terminating = policy("foo", 2);
    terminating.metadata.deletion_timestamp =
        Some(serde_json::from_value(serde_json::json!("2024-03-01T12:00:00Z")).unwrap());
    terminating.metadata.finalizers = Some(vec!["example.com/cleanup".to_string()]);
    store.insert(terminating);

    let reconciled = admission.reconcile(&id("foo")).await.unwrap();
    assert_eq!(reconciled, Reconciled::Done);
    assert!(admission.registry().is_empty());
    assert_eq!(store.replaces.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failed_label_corrections_are_requeued() {
    let store = Store::default();
    store.insert(policy("foo", 1));
    store.failed_replaces.store(1, Ordering::SeqCst);
    let admission = admission(&store);

    let reconciled = admission.reconcile(&id("foo")).await.unwrap();
    assert!(matches!(reconciled, Reconciled::Requeue(_)));
    assert!(admission.registry().is_empty());

    assert_eq!(
        admission.reconcile(&id("foo")).await.unwrap(),
        Reconciled::Done
    );
    assert_eq!(admission.registry().len(), 1);
}

#[tokio::test]
async fn failed_fetches_are_errors() {
    let store = Store::default();
    store.insert(labeled(policy("foo", 1)));
    store.failed_gets.store(true, Ordering::SeqCst);
    let admission = admission(&store);

    assert!(admission.reconcile(&id("foo")).await.is_err());
    assert!(admission.registry().is_empty());
}

#[tokio::test]
async fn status_updates_are_not_readmitted() {
    let store = Store::default();
    store.insert(labeled(policy("foo", 1)));
    let admission = admission(&store);
    let registry = admission.registry().clone();

    let events = vec![
        Event::Apply(labeled(policy("foo", 1))),
        // Only the status changed.
        Event::Apply(labeled(with_status(policy("foo", 1)))),
        Event::Apply(labeled(policy("foo", 2))),
    ];
    Dispatcher::new(admission).run(stream::iter(events)).await;

    assert_eq!(store.gets.load(Ordering::SeqCst), 2);
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn delete_events_unregister() {
    let store = Store::default();
    store.insert(labeled(policy("foo", 1)));
    let admission = admission(&store);
    let registry = admission.registry().clone();
    admission.reconcile(&id("foo")).await.unwrap();

    store.remove("foo");
    let events = vec![Event::Delete(labeled(policy("foo", 1)))];
    Dispatcher::new(admission).run(stream::iter(events)).await;

    assert!(registry.is_empty());
}

#[tokio::test]
async fn relists_remove_unseen_policies() {
    let store = Store::default();
    store.insert(labeled(policy("foo", 1)));
    store.insert(labeled(policy("bar", 1)));
    let admission = admission(&store);
    let registry = admission.registry().clone();
    admission.reconcile(&id("foo")).await.unwrap();
    admission.reconcile(&id("bar")).await.unwrap();

    // bar was deleted while the watch was down.
    store.remove("bar");
    let events = vec![
        Event::Init,
        Event::InitApply(labeled(policy("foo", 1))),
        Event::InitDone,
    ];
    Dispatcher::new(admission).run(stream::iter(events)).await;

    assert!(registry.get("default.foo").is_some());
    assert!(registry.get("default.bar").is_none());
    // foo was already admitted at this generation.
    assert_eq!(store.gets.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn requeued_policies_are_retried() {
    let store = Store::default();
    store.insert(policy("foo", 1));
    store.failed_replaces.store(1, Ordering::SeqCst);
    let admission = admission(&store);
    let registry = admission.registry().clone();

    let events = stream::iter(vec![Event::Apply(policy("foo", 1))]).chain(stream::pending());
    let task = tokio::spawn(Dispatcher::new(admission).run(events));

    time::sleep(time::Duration::from_secs(1)).await;
    assert!(registry.is_empty());

    time::sleep(time::Duration::from_secs(10)).await;
    assert_eq!(registry.len(), 1);
    assert_eq!(store.replaces.load(Ordering::SeqCst), 2);

    task.abort();
}
