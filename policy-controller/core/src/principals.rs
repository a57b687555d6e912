use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use anyhow::Result;
use iam_policy_controller_k8s_api::{
    policy::DEFAULT_IGNORE_CLUSTER_ROLE_BINDINGS, ClusterRoleBinding, CLUSTER_ROLE_KIND,
};
use regex::Regex;
use thiserror::Error;
use tracing::{debug, trace, warn};

const USER_KIND: &str = "User";
const GROUP_KIND: &str = "Group";

/// Looks up the users that belong to a group.
#[async_trait::async_trait]
pub trait GroupMembership {
    /// Returns the members of `group`.
    ///
    /// A group that does not exist, or that has no readable member list, has
    /// no members. Errors are reserved for failed lookups.
    async fn group_members(&self, group: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Error)]
#[error("ignoreClusterRoleBindings value '{pattern}' is not a valid regular expression: {source}")]
pub struct InvalidIgnorePattern {
    pub pattern: String,
    #[source]
    pub source: regex::Error,
}

/// The users bound to a role.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Principals {
    pub(crate) users: HashSet<String>,
    pub(crate) failed_groups: Vec<String>,
}

/// Compiled ignore patterns for binding names.
#[derive(Clone, Debug)]
pub struct IgnorePatterns(Vec<Regex>);

/// Resolves the distinct users bound to the cluster role `role`.
///
/// Bindings whose name matches an ignore pattern are skipped. An empty list of
/// patterns ignores bindings prefixed with `system:`. Group subjects are
/// expanded through `groups`; a failed lookup contributes no users and marks
/// the result as partial.
pub async fn resolve<G>(
    bindings: &[ClusterRoleBinding],
    role: &str,
    ignore: &[String],
    groups: &G,
) -> Result<Principals, InvalidIgnorePattern>
where
    G: GroupMembership + ?Sized,
{
    let ignore = IgnorePatterns::compile(ignore)?;

    let mut principals = Principals::default();
    let mut members = HashMap::<String, Option<Vec<String>>>::new();

    for binding in bindings {
        let name = binding.metadata.name.as_deref().unwrap_or_default();
        if let Some(re) = ignore.matching(name) {
            trace!(binding = %name, pattern = %re, "Ignoring ClusterRoleBinding");
            continue;
        }

        let role_ref = &binding.role_ref;
        if role_ref.kind != CLUSTER_ROLE_KIND || role_ref.name != role {
            continue;
        }

        for subject in binding.subjects.iter().flatten() {
            match subject.kind.as_str() {
                USER_KIND => {
                    principals.users.insert(subject.name.clone());
                }
                GROUP_KIND => {
                    if !members.contains_key(&subject.name) {
                        let users = match groups.group_members(&subject.name).await {
                            Ok(users) => Some(users),
                            Err(error) => {
                                warn!(
                                    binding = %name,
                                    cluster_role = %role,
                                    group = %subject.name,
                                    %error,
                                    "Failed to retrieve users in group"
                                );
                                principals.failed_groups.push(subject.name.clone());
                                None
                            }
                        };
                        members.insert(subject.name.clone(), users);
                    }
                    if let Some(users) = members.get(&subject.name).and_then(Option::as_ref) {
                        principals.users.extend(users.iter().cloned());
                    }
                }
                kind => debug!(binding = %name, %kind, "Skipping subject"),
            }
        }
    }

    Ok(principals)
}

// === impl IgnorePatterns ===

impl IgnorePatterns {
    pub fn compile(patterns: &[String]) -> Result<Self, InvalidIgnorePattern> {
        let default = [DEFAULT_IGNORE_CLUSTER_ROLE_BINDINGS.to_string()];
        let patterns = if patterns.is_empty() {
            &default[..]
        } else {
            patterns
        };

        patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| InvalidIgnorePattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    /// Returns the first pattern that matches `name`.
    pub fn matching(&self, name: &str) -> Option<&Regex> {
        self.0.iter().find(|re| re.is_match(name))
    }
}

// === impl Principals ===

impl Principals {
    pub fn count(&self) -> usize {
        self.users.len()
    }

    pub fn contains(&self, user: &str) -> bool {
        self.users.contains(user)
    }

    /// True if some group could not be expanded, so the count is a lower bound.
    pub fn is_partial(&self) -> bool {
        !self.failed_groups.is_empty()
    }

    pub fn failed_groups(&self) -> &[String] {
        &self.failed_groups
    }
}

impl<S: Into<String>> FromIterator<S> for Principals {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self {
            users: iter.into_iter().map(Into::into).collect(),
            failed_groups: vec![],
        }
    }
}
