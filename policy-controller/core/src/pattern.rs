use ahash::AHashSet as HashSet;
use std::{convert::Infallible, fmt, str::FromStr};

/// Matches a name against a simple glob.
///
/// Only a leading and/or trailing `*` is understood. A `*` anywhere else
/// yields a pattern that never matches.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum NamePattern {
    /// `*`
    Any,

    /// `foo`
    Exact(String),

    /// `foo*`
    Prefix(String),

    /// `*foo`
    Suffix(String),

    /// `*foo*`
    Contains(String),

    Unsupported(String),
}

// === impl NamePattern ===

impl NamePattern {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(s) => name == s,
            Self::Prefix(s) => name.starts_with(s.as_str()),
            Self::Suffix(s) => name.ends_with(s.as_str()),
            Self::Contains(s) => name.contains(s.as_str()),
            Self::Unsupported(_) => false,
        }
    }

    /// Returns the names in `names` matched by this pattern.
    pub fn find<'n>(&self, names: &'n [String]) -> Vec<&'n String> {
        names.iter().filter(|n| self.matches(n)).collect()
    }
}

impl FromStr for NamePattern {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" {
            return Ok(Self::Any);
        }

        let pattern = match (s.strip_prefix('*'), s.strip_suffix('*')) {
            (None, None) => Self::Exact(s.to_string()),
            (None, Some(prefix)) => Self::Prefix(prefix.to_string()),
            (Some(suffix), None) => Self::Suffix(suffix.to_string()),
            (Some(_), Some(_)) => Self::Contains(s[1..s.len() - 1].to_string()),
        };

        let inner = match &pattern {
            Self::Exact(s) | Self::Prefix(s) | Self::Suffix(s) | Self::Contains(s) => s,
            _ => return Ok(pattern),
        };
        if inner.contains('*') {
            return Ok(Self::Unsupported(s.to_string()));
        }
        Ok(pattern)
    }
}

impl fmt::Display for NamePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Exact(s) | Self::Unsupported(s) => f.write_str(s),
            Self::Prefix(s) => write!(f, "{s}*"),
            Self::Suffix(s) => write!(f, "*{s}"),
            Self::Contains(s) => write!(f, "*{s}*"),
        }
    }
}

/// Returns true if `pattern` matches `name`.
pub fn matches(pattern: &str, name: &str) -> bool {
    match pattern.parse::<NamePattern>() {
        Ok(p) => p.matches(name),
        Err(never) => match never {},
    }
}

/// Resolves the names in `all` matched by any `included` pattern and by no
/// `excluded` pattern. The result is deduplicated and sorted.
pub fn match_names(all: &[String], included: &[String], excluded: &[String]) -> Vec<String> {
    let find = |patterns: &[String]| -> HashSet<String> {
        patterns
            .iter()
            .filter_map(|p| p.parse::<NamePattern>().ok())
            .flat_map(|p| p.find(all).into_iter().cloned().collect::<Vec<_>>())
            .collect()
    };

    let excluded = find(excluded);
    let mut names = find(included)
        .into_iter()
        .filter(|n| !excluded.contains(n))
        .collect::<Vec<_>>();
    names.sort();
    names
}
