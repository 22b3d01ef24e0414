//! Repository selection by ownership, visibility and exclusion list

use regex::Regex;
use tracing::{debug, warn};

use crate::config::FilterConfig;
use crate::repository::RepositoryDescriptor;

/// Selection policy for one run
#[derive(Debug, Clone)]
pub struct FilterPolicy {
    username: String,
    include_private: bool,
    include_other_owners: bool,
    exclude: Vec<ExcludeRule>,
}

#[derive(Debug, Clone)]
enum ExcludeRule {
    Exact(String),
    Glob(Regex),
}

impl ExcludeRule {
    fn parse(pattern: &str) -> Option<Self> {
        if !pattern.contains('*') {
            return Some(ExcludeRule::Exact(pattern.to_string()));
        }

        let pattern_regex = regex::escape(pattern).replace(r"\*", ".*");
        match Regex::new(&format!("^{}$", pattern_regex)) {
            Ok(re) => Some(ExcludeRule::Glob(re)),
            Err(e) => {
                warn!("Ignoring invalid exclude pattern '{}': {}", pattern, e);
                None
            }
        }
    }

    fn matches(&self, full_name: &str) -> bool {
        match self {
            ExcludeRule::Exact(name) => name == full_name,
            ExcludeRule::Glob(re) => re.is_match(full_name),
        }
    }
}

impl FilterPolicy {
    pub fn new(username: impl Into<String>, config: &FilterConfig) -> Self {
        Self {
            username: username.into(),
            include_private: config.include_private,
            include_other_owners: config.include_other_owners,
            exclude: config
                .exclude
                .iter()
                .filter_map(|p| ExcludeRule::parse(p))
                .collect(),
        }
    }

    pub fn allows(&self, repo: &RepositoryDescriptor) -> bool {
        if repo.is_private && !self.include_private {
            debug!("Excluding private repository: {}", repo.full_name);
            return false;
        }

        let own_name = format!("{}/{}", self.username, repo.name);
        if !self.include_other_owners && repo.full_name != own_name {
            debug!("Excluding repository not owned by {}: {}", self.username, repo.full_name);
            return false;
        }

        if self.exclude.iter().any(|rule| rule.matches(&repo.full_name)) {
            debug!("Excluding repository due to exclusion list: {}", repo.full_name);
            return false;
        }

        true
    }

    /// Narrow the inventory to the repositories this run should back up
    pub fn apply(&self, repos: Vec<RepositoryDescriptor>) -> Vec<RepositoryDescriptor> {
        repos.into_iter().filter(|repo| self.allows(repo)).collect()
    }
}
