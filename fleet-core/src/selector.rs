//! Label selectors used by `list`.
//!
//! Textual form is a comma-separated list of requirements:
//!
//! ```text
//! env=prod,tier!=cache,owner,!fleet.io/inherited-from
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// One clause of a selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::DoesNotExist(k) => !labels.contains_key(k),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Equals(k, v) => write!(f, "{k}={v}"),
            Requirement::NotEquals(k, v) => write!(f, "{k}!={v}"),
            Requirement::Exists(k) => f.write_str(k),
            Requirement::DoesNotExist(k) => write!(f, "!{k}"),
        }
    }
}

/// Conjunction of requirements. The empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn with(mut self, requirement: Requirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.requirements.iter().map(ToString::to_string).collect();
        f.write_str(&parts.join(","))
    }
}

impl FromStr for LabelSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut selector = LabelSelector::default();
        for raw in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let requirement = if let Some((k, v)) = raw.split_once("!=") {
                Requirement::NotEquals(non_empty(k, raw)?, v.trim().to_string())
            } else if let Some((k, v)) = raw.split_once('=') {
                let v = v.strip_prefix('=').unwrap_or(v);
                Requirement::Equals(non_empty(k, raw)?, v.trim().to_string())
            } else if let Some(k) = raw.strip_prefix('!') {
                Requirement::DoesNotExist(non_empty(k, raw)?)
            } else {
                Requirement::Exists(non_empty(raw, raw)?)
            };
            selector.requirements.push(requirement);
        }
        Ok(selector)
    }
}

fn non_empty(key: &str, clause: &str) -> Result<String, String> {
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty label key in selector clause '{clause}'"));
    }
    Ok(key.to_string())
}
