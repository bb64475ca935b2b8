//! What happens when an incoming row collides with a stored primary key.
//!
//! `Replace` overwrites the whole row and is the default. `Merge` is only
//! available with an explicit rule for every non-key column; there is no
//! implicit per-column default, since a partial merge with guessed rules can
//! leave rows that no single source ever produced.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::writer::WriteError;

/// Per-column rule for [`ConflictStrategy::Merge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeRule {
    /// Keep the stored value.
    KeepExisting,
    /// Take the incoming value, null included.
    TakeIncoming,
    /// Take the incoming value unless it is null.
    TakeIncomingIfNotNull,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergePolicy {
    pub rules: BTreeMap<String, MergeRule>,
}

impl MergePolicy {
    pub fn new<I, S>(rules: I) -> Self
    where
        I: IntoIterator<Item = (S, MergeRule)>,
        S: Into<String>,
    {
        Self {
            rules: rules.into_iter().map(|(c, r)| (c.into(), r)).collect(),
        }
    }

    pub fn rule(&self, column: &str) -> Option<MergeRule> {
        self.rules.get(column).copied()
    }

    /// Every non-key column must have a rule.
    pub fn check_covers(&self, columns: &[String], keys: &[String]) -> Result<(), WriteError> {
        match columns
            .iter()
            .find(|c| !keys.contains(c) && !self.rules.contains_key(*c))
        {
            Some(c) => Err(WriteError::IncompleteMergePolicy(c.clone())),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum ConflictStrategy {
    /// Insert, replacing the full stored row on key conflict.
    #[default]
    Replace,
    /// Column-level merge under an explicit policy.
    Merge(MergePolicy),
}

impl ConflictStrategy {
    /// Parse a strategy name. Only `replace` stands on its own; a merge has to
    /// be built with its [`MergePolicy`].
    pub fn from_name(name: &str) -> Result<Self, WriteError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(ConflictStrategy::Replace),
            other => Err(WriteError::UnsupportedStrategy(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConflictStrategy::Replace => "replace",
            ConflictStrategy::Merge(_) => "merge",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_replace_parses_by_name() {
        assert_eq!(ConflictStrategy::from_name("REPLACE").unwrap(), ConflictStrategy::Replace);
        assert!(matches!(
            ConflictStrategy::from_name("merge"),
            Err(WriteError::UnsupportedStrategy(s)) if s == "merge"
        ));
        assert!(ConflictStrategy::from_name("upsert").is_err());
    }

    #[test]
    fn merge_policy_must_cover_non_key_columns() {
        let policy = MergePolicy::new([("close", MergeRule::TakeIncoming)]);
        let keys = vec!["entity_code".to_string()];
        let cols = vec!["entity_code".to_string(), "close".to_string()];
        assert!(policy.check_covers(&cols, &keys).is_ok());

        let cols = vec!["entity_code".to_string(), "close".to_string(), "volume".to_string()];
        assert!(matches!(
            policy.check_covers(&cols, &keys),
            Err(WriteError::IncompleteMergePolicy(c)) if c == "volume"
        ));
    }
}
