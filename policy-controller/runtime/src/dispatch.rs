use crate::{
    admission::{self, Admission, PolicyStore, Reconciled},
    core::ResourceId,
    k8s::IamPolicy,
};
use ahash::AHashSet as HashSet;
use futures::prelude::*;
use kube::runtime::watcher::Event;
use tokio::{
    sync::mpsc,
    time::{self, Duration},
};
use tracing::{debug, error, trace};

/// Delay before retrying a policy that could not be reconciled.
const ERROR_RETRY: Duration = Duration::from_secs(10);

/// Feeds watch events for `IamPolicy` resources to the admission path.
pub struct Dispatcher<S> {
    admission: Admission<S>,
    relisted: Option<HashSet<ResourceId>>,
    retry_tx: mpsc::UnboundedSender<ResourceId>,
    retry_rx: mpsc::UnboundedReceiver<ResourceId>,
}

// === impl Dispatcher ===

impl<S: PolicyStore> Dispatcher<S> {
    pub fn new(admission: Admission<S>) -> Self {
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        Self {
            admission,
            relisted: None,
            retry_tx,
            retry_rx,
        }
    }

    /// Dispatches events until the watch ends.
    pub async fn run(mut self, events: impl Stream<Item = Event<IamPolicy>>) {
        tokio::pin!(events);
        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(event) => self.handle(event).await,
                    None => return,
                },
                Some(id) = self.retry_rx.recv() => self.reconcile(id).await,
            }
        }
    }

    async fn handle(&mut self, event: Event<IamPolicy>) {
        match event {
            Event::Init => {
                debug!("Relisting policies");
                self.relisted = Some(HashSet::new());
            }

            Event::InitApply(policy) => {
                let id = ResourceId::of(&policy);
                if let Some(relisted) = self.relisted.as_mut() {
                    relisted.insert(id.clone());
                }
                self.apply(id, policy.metadata.generation).await;
            }

            Event::InitDone => {
                let Some(relisted) = self.relisted.take() else {
                    return;
                };
                // Policies deleted while the watch was down.
                let removed = self.admission.registry().remove_where(|_, policy| {
                    !relisted.contains(&ResourceId::of(&policy.lock()))
                });
                debug!(removed, "Relisted policies");
            }

            Event::Apply(policy) => {
                let id = ResourceId::of(&policy);
                self.apply(id, policy.metadata.generation).await;
            }

            Event::Delete(policy) => self.reconcile(ResourceId::of(&policy)).await,
        }
    }

    async fn apply(&mut self, id: ResourceId, generation: Option<i64>) {
        // Status updates don't change the generation.
        if admission::is_admitted(self.admission.registry(), &id, generation) {
            trace!(%id.namespace, %id.name, ?generation, "Already admitted");
            return;
        }
        self.reconcile(id).await;
    }

    async fn reconcile(&mut self, id: ResourceId) {
        let delay = match self.admission.reconcile(&id).await {
            Ok(Reconciled::Done) => return,
            Ok(Reconciled::Requeue(delay)) => delay,
            Err(error) => {
                error!(%id.namespace, %id.name, %error, "Failed to reconcile IamPolicy");
                ERROR_RETRY
            }
        };

        debug!(%id.namespace, %id.name, ?delay, "Requeueing");
        let retry_tx = self.retry_tx.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = retry_tx.send(id);
        });
    }
}
