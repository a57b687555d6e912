use ahash::AHashMap as HashMap;
use iam_policy_controller_k8s_api::{IamPolicy, ResourceExt};
use parking_lot::Mutex;
use std::{fmt, sync::Arc};

/// A registered policy. The background loop updates its status in place.
pub type SharedPolicy = Arc<Mutex<IamPolicy>>;

#[derive(Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct ResourceId {
    pub namespace: String,
    pub name: String,
}

/// Active policies, keyed by `namespace.name`.
///
/// Every operation holds the same exclusive lock for its full duration.
/// Iteration happens over a [`Registry::snapshot`] so that the admission path
/// may add and remove entries while the background loop evaluates.
#[derive(Debug)]
pub struct Registry<T = SharedPolicy> {
    entries: Mutex<HashMap<String, T>>,
}

// === impl ResourceId ===

impl ResourceId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn of(policy: &IamPolicy) -> Self {
        Self::new(policy.namespace().unwrap_or_default(), policy.name_any())
    }

    /// The registry key of this resource.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

// === impl Registry ===

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> Registry<T> {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.entries.lock().get(key).cloned()
    }

    /// Inserts or replaces the entry for `key`.
    pub fn add(&self, key: impl Into<String>, value: T) {
        self.entries.lock().insert(key.into(), value);
    }

    pub fn remove(&self, key: &str) -> Option<T> {
        self.entries.lock().remove(key)
    }

    /// Removes every entry for which `f` returns true.
    pub fn remove_where(&self, mut f: impl FnMut(&str, &T) -> bool) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|k, v| !f(k, v));
        before - entries.len()
    }

    /// Copies out the current entries.
    pub fn snapshot(&self) -> Vec<(String, T)> {
        self.entries
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Registry<SharedPolicy> {
    /// Registers `policy` under its `namespace.name` key.
    pub fn add_policy(&self, policy: IamPolicy) -> ResourceId {
        let id = ResourceId::of(&policy);
        self.add(id.key(), Arc::new(Mutex::new(policy)));
        id
    }

    /// Removes the policy named `name` in `namespace`, regardless of the key
    /// it was registered under.
    pub fn remove_policy(&self, id: &ResourceId) -> usize {
        self.remove_where(|_, policy| {
            let policy = policy.lock();
            policy.metadata.name.as_deref() == Some(id.name.as_str())
                && policy.metadata.namespace.as_deref() == Some(id.namespace.as_str())
        })
    }
}
