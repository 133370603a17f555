//! Import of exported trees: confidence preview and decision-driven apply.

pub mod executor;
pub mod matcher;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use executor::{Decision, ImportExecutor, ImportReport, parse_decisions};
pub use matcher::{
    Candidate, ChildAction, ExactMatch, ImportMatcher, MatchPreview, MatchResult, MatchStatus,
    MatchSummary,
};

/// How an import treats node-level failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ImportMode {
    /// Commit every node that succeeded and report the failures
    #[default]
    BestEffort,
    /// Roll the whole import back if any node failed
    Atomic,
}

impl std::str::FromStr for ImportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "best_effort" => Ok(Self::BestEffort),
            "atomic" => Ok(Self::Atomic),
            other => Err(format!("Unknown import mode '{}'", other)),
        }
    }
}
