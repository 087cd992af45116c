use std::collections::BTreeMap;

use crate::{error::PipelineError, model::DeployStage, types::StageDef};

/// Explicit `{branch -> stage}` table. Branch filters are mutually exclusive,
/// so a branch selects at most one deploy stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutingTable {
    routes: BTreeMap<String, DeployStage>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        let routes = DeployStage::CHAIN
            .iter()
            .map(|s| (s.as_str().to_string(), *s))
            .collect();
        Self { routes }
    }
}

impl RoutingTable {
    pub fn from_stages(stages: &[StageDef]) -> Result<Self, PipelineError> {
        let mut routes = BTreeMap::new();
        for def in stages {
            let branch = def.branch_filter.trim();
            if branch.is_empty() {
                return Err(PipelineError::Config(format!("stage {} has an empty branch filter", def.stage)));
            }
            if let Some(existing) = routes.insert(branch.to_string(), def.stage) {
                return Err(PipelineError::Config(format!(
                    "branch {branch} routes to both {existing} and {}",
                    def.stage
                )));
            }
        }
        Ok(Self { routes })
    }

    /// Exact, case-sensitive match on the triggering branch.
    pub fn route(&self, branch: &str) -> Option<DeployStage> {
        let branch = branch.strip_prefix("refs/heads/").unwrap_or(branch);
        self.routes.get(branch).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_routes_exact_branches() {
        let t = RoutingTable::default();
        assert_eq!(t.route("dev"), Some(DeployStage::Dev));
        assert_eq!(t.route("refs/heads/staging"), Some(DeployStage::Staging));
        assert_eq!(t.route("prod"), Some(DeployStage::Prod));
        assert_eq!(t.route("main"), None);
        assert_eq!(t.route("Dev"), None);
        assert_eq!(t.route("dev-feature"), None);
    }

    #[test]
    fn duplicate_branch_filters_are_rejected() {
        let mut a = StageDef::conventional(DeployStage::Dev, "app");
        let mut b = StageDef::conventional(DeployStage::Staging, "app");
        a.branch_filter = "release".into();
        b.branch_filter = "release".into();
        assert!(RoutingTable::from_stages(&[a, b]).is_err());
    }
}
