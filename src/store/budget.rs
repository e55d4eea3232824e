use std::collections::BTreeMap;

use serde::Serialize;

use crate::aggregate::snapshot::WindowSnapshot;

/// Mean of one metric checked against its configured budget.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetReport {
    pub name: String,
    pub category: String,
    pub mean: f64,
    pub budget: f64,
    pub exceeded: bool,
}

/// Per-metric budgets keyed by metric name (any category).
#[derive(Debug, Clone, Default)]
pub struct BudgetTable {
    budgets: BTreeMap<String, f64>,
}

impl BudgetTable {
    pub fn new<I, S>(budgets: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        Self {
            budgets: budgets.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.budgets.is_empty()
    }

    pub fn budget(&self, name: &str) -> Option<f64> {
        self.budgets.get(name).copied()
    }

    /// Reports every budgeted metric present in `snapshot`, in key order.
    pub fn evaluate(&self, snapshot: &WindowSnapshot) -> Vec<BudgetReport> {
        if self.budgets.is_empty() {
            return Vec::new();
        }

        snapshot
            .metrics
            .iter()
            .filter_map(|(key, stats)| {
                let budget = self.budget(&key.name)?;
                let mean = stats.mean();
                Some(BudgetReport {
                    name: key.name.to_string(),
                    category: key.category.to_string(),
                    mean,
                    budget,
                    exceeded: mean > budget,
                })
            })
            .collect()
    }
}
