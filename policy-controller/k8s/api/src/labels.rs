use kube::api::ObjectMeta;

/// Classification label every `IamPolicy` must carry.
pub const CATEGORY: &str = "category";
pub const GRC_CATEGORY: &str = "system-and-information-integrity";

/// Names the namespace of the parent `Policy` on the managed cluster.
pub const CLUSTER_NAMESPACE: &str = "policy.open-cluster-management.io/cluster-namespace";

/// Ensures the classification label is present and correct, returning true
/// if the metadata was changed.
pub fn ensure_category(meta: &mut ObjectMeta) -> bool {
    let labels = meta.labels.get_or_insert_with(Default::default);
    match labels.get(CATEGORY) {
        Some(value) if value == GRC_CATEGORY => false,
        _ => {
            labels.insert(CATEGORY.to_string(), GRC_CATEGORY.to_string());
            true
        }
    }
}

/// The parent namespace recorded on the object, if any.
pub fn cluster_namespace(meta: &ObjectMeta) -> Option<&str> {
    meta.labels
        .as_ref()?
        .get(CLUSTER_NAMESPACE)
        .map(String::as_str)
        .filter(|ns| !ns.is_empty())
}
