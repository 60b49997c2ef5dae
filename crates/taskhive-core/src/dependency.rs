// Dependency edges between issues

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoordinationError, Result};

/// Kind of relationship a dependency edge expresses.
///
/// Only `Blocks` edges participate in readiness and cycle checks; the other
/// kinds are free to form arbitrary graphs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyType {
    Blocks,
    Related,
    ParentChild,
    DiscoveredFrom,
}

impl DependencyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyType::Blocks => "blocks",
            DependencyType::Related => "related",
            DependencyType::ParentChild => "parent-child",
            DependencyType::DiscoveredFrom => "discovered-from",
        }
    }
}

impl fmt::Display for DependencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DependencyType {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "blocks" => Ok(DependencyType::Blocks),
            "related" => Ok(DependencyType::Related),
            "parent-child" => Ok(DependencyType::ParentChild),
            "discovered-from" => Ok(DependencyType::DiscoveredFrom),
            _ => Err(CoordinationError::validation(
                "parse_dependency_type",
                format!("unknown dependency type {s:?}"),
            )),
        }
    }
}

/// A directed edge: `issue_id` depends on `depends_on_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    pub issue_id: String,
    pub depends_on_id: String,
    pub dep_type: DependencyType,
    pub created_at: DateTime<Utc>,
}

impl Dependency {
    pub fn new(
        issue_id: impl Into<String>,
        depends_on_id: impl Into<String>,
        dep_type: DependencyType,
    ) -> Self {
        Dependency {
            issue_id: issue_id.into(),
            depends_on_id: depends_on_id.into(),
            dep_type,
            created_at: Utc::now(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.issue_id.trim().is_empty() || self.depends_on_id.trim().is_empty() {
            return Err(CoordinationError::validation(
                "dependency",
                "both endpoints of a dependency must be non-empty",
            ));
        }
        if self.issue_id == self.depends_on_id {
            return Err(CoordinationError::validation(
                "dependency",
                format!("issue {} cannot depend on itself", self.issue_id),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_self_edges_and_empty_endpoints() {
        assert!(Dependency::new("th-1", "th-1", DependencyType::Blocks)
            .validate()
            .is_err());
        assert!(Dependency::new("", "th-2", DependencyType::Blocks)
            .validate()
            .is_err());
        assert!(Dependency::new("th-1", " ", DependencyType::Related)
            .validate()
            .is_err());
        assert!(Dependency::new("th-1", "th-2", DependencyType::Blocks)
            .validate()
            .is_ok());
    }

    #[test]
    fn type_strings_round_trip() {
        for t in [
            DependencyType::Blocks,
            DependencyType::Related,
            DependencyType::ParentChild,
            DependencyType::DiscoveredFrom,
        ] {
            assert_eq!(t.as_str().parse::<DependencyType>().unwrap(), t);
        }
    }
}
