use anyhow::{Context, Result};
use regex::Regex;

use crate::aggregate::snapshot::MetricKey;
use crate::config::{FilterConfig, NameRule};

/// Matches event or metric names.
#[derive(Debug, Clone)]
pub enum NameFilter {
    Any,
    Equal(String),
    StartsWith(String),
    Regex(Regex),
    OneOf(Vec<NameFilter>),
}

impl NameFilter {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Equal(s) => name == s,
            Self::StartsWith(prefix) => name.starts_with(prefix.as_str()),
            Self::Regex(re) => re.is_match(name),
            Self::OneOf(filters) => filters.iter().any(|f| f.matches(name)),
        }
    }

    fn from_rule(rule: &NameRule) -> Result<Self> {
        Ok(match rule {
            NameRule::Equal(s) => Self::Equal(s.clone()),
            NameRule::StartsWith(s) => Self::StartsWith(s.clone()),
            NameRule::Regex(pattern) => Self::Regex(
                Regex::new(pattern).with_context(|| format!("compiling regex {pattern:?}"))?,
            ),
        })
    }
}

/// Name rule combined with an optional category allowlist.
///
/// Used at ingest to drop unwanted events and by the query API to select
/// metrics out of stored windows.
#[derive(Debug, Clone)]
pub struct EventFilter {
    names: NameFilter,
    categories: Option<Vec<String>>,
}

impl EventFilter {
    /// A filter that accepts everything.
    pub fn accept_all() -> Self {
        Self {
            names: NameFilter::Any,
            categories: None,
        }
    }

    pub fn new(names: NameFilter, categories: Option<Vec<String>>) -> Self {
        Self { names, categories }
    }

    /// Builds a filter from its configuration, compiling any regex rules.
    pub fn from_config(cfg: &FilterConfig) -> Result<Self> {
        let mut rules = cfg
            .names
            .iter()
            .map(NameFilter::from_rule)
            .collect::<Result<Vec<_>>>()?;

        let names = match rules.len() {
            0 => NameFilter::Any,
            1 => rules.remove(0),
            _ => NameFilter::OneOf(rules),
        };

        let categories = if cfg.categories.is_empty() {
            None
        } else {
            Some(cfg.categories.clone())
        };

        Ok(Self { names, categories })
    }

    pub fn is_accept_all(&self) -> bool {
        matches!(self.names, NameFilter::Any) && self.categories.is_none()
    }

    pub fn matches(&self, name: &str, category: &str) -> bool {
        if let Some(categories) = &self.categories {
            if !categories.iter().any(|c| c == category) {
                return false;
            }
        }
        self.names.matches(name)
    }

    pub fn matches_key(&self, key: &MetricKey) -> bool {
        self.matches(&key.name, &key.category)
    }
}

impl Default for EventFilter {
    fn default() -> Self {
        Self::accept_all()
    }
}
