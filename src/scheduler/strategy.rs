use crate::discovery::types::NodeRecord;

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Added to every node's cost share before consumption starts.
pub const SHARE_SLACK: f64 = 0.0;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum Strategy {
    /// Round-robin chunks of `cores` tasks per node, cost ignored.
    #[serde(rename = "simple")]
    Simple,
    /// Each node receives cost in proportion to its share of all cores.
    #[default]
    #[serde(rename = "cost")]
    CostProportional,
    /// Like `CostProportional`, with cores weighted by benchmark speed.
    #[serde(rename = "performance")]
    PerformanceBiased,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::Simple => "simple",
            Strategy::CostProportional => "cost",
            Strategy::PerformanceBiased => "performance",
        };
        f.write_str(name)
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "simple" => Ok(Strategy::Simple),
            "cost" => Ok(Strategy::CostProportional),
            "performance" => Ok(Strategy::PerformanceBiased),
            other => Err(format!("unknown strategy: {other}")),
        }
    }
}

/// The tasks one node receives in a dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeAssignment<T> {
    pub node: IpAddr,
    pub cores: usize,
    pub items: Vec<T>,
}

#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    strategy: Strategy,
}

impl Scheduler {
    pub fn new(strategy: Strategy) -> Self {
        Self { strategy }
    }

    /// Strategy actually applied to `nodes`. Performance bias needs a positive
    /// benchmark index from every node and falls back to cost otherwise.
    pub fn effective_strategy(&self, nodes: &[NodeRecord]) -> Strategy {
        match self.strategy {
            Strategy::PerformanceBiased if !all_benchmarked(nodes) => {
                tracing::warn!("Not every node has a performance index, using cost strategy");
                Strategy::CostProportional
            }
            strategy => strategy,
        }
    }

    /// Splits `items` (each with its cost, most expensive first) across
    /// `nodes`. Every item lands on exactly one node; nodes without items are
    /// left out.
    pub fn partition<T>(&self, nodes: &[NodeRecord], items: Vec<(T, u64)>) -> Vec<NodeAssignment<T>> {
        let total_cores: usize = nodes.iter().map(|node| node.cores).sum();
        if nodes.is_empty() || items.is_empty() || total_cores == 0 {
            return Vec::new();
        }

        let total_cost: u64 = items.iter().map(|(_, cost)| cost).sum();
        let strategy = match self.effective_strategy(nodes) {
            Strategy::Simple => Strategy::Simple,
            _ if total_cost == 0 => Strategy::Simple,
            strategy => strategy,
        };

        let assignments = match strategy {
            Strategy::Simple => round_robin(nodes, items),
            Strategy::CostProportional => {
                let weights: Vec<usize> = nodes.iter().map(|node| node.cores).collect();
                cost_proportional(nodes, &weights, items)
            }
            Strategy::PerformanceBiased => {
                let mut weights = biased_cores(nodes);
                if weights.iter().all(|weight| *weight == 0) {
                    tracing::warn!("Biased cores round to zero on every node, weighting by cores");
                    weights = nodes.iter().map(|node| node.cores).collect();
                }
                cost_proportional(nodes, &weights, items)
            }
        };

        for assignment in &assignments {
            tracing::info!(node = %assignment.node, "{} tasks ({})", assignment.items.len(), strategy);
        }
        assignments
    }
}

fn all_benchmarked(nodes: &[NodeRecord]) -> bool {
    nodes
        .iter()
        .all(|node| matches!(node.performance_index, Some(index) if index > 0.0))
}

/// `round(cores * best³ / index³)` per node, where `best` is the lowest index.
pub fn biased_cores(nodes: &[NodeRecord]) -> Vec<usize> {
    let best = nodes
        .iter()
        .filter_map(|node| node.performance_index)
        .fold(f64::INFINITY, f64::min);

    nodes
        .iter()
        .map(|node| match node.performance_index {
            Some(index) if index > 0.0 && best.is_finite() => {
                (node.cores as f64 * best.powi(3) / index.powi(3)).round() as usize
            }
            _ => node.cores,
        })
        .collect()
}

fn empty_assignments<T>(nodes: &[NodeRecord]) -> Vec<NodeAssignment<T>> {
    nodes
        .iter()
        .map(|node| NodeAssignment {
            node: node.address,
            cores: node.cores,
            items: Vec::new(),
        })
        .collect()
}

fn round_robin<T>(nodes: &[NodeRecord], items: Vec<(T, u64)>) -> Vec<NodeAssignment<T>> {
    let mut assignments = empty_assignments(nodes);
    let mut remaining: VecDeque<T> = items.into_iter().map(|(item, _)| item).collect();

    while !remaining.is_empty() {
        for assignment in assignments.iter_mut() {
            let take = assignment.cores.min(remaining.len());
            assignment.items.extend(remaining.drain(..take));
        }
    }

    assignments.retain(|assignment| !assignment.items.is_empty());
    assignments
}

/// One forward pass over the cost-sorted items. Node `i` consumes items while
/// its remaining share `total_cost * weight_i / total_weight` is positive; the
/// last node with weight takes whatever is left.
fn cost_proportional<T>(nodes: &[NodeRecord], weights: &[usize], items: Vec<(T, u64)>) -> Vec<NodeAssignment<T>> {
    let mut assignments = empty_assignments(nodes);
    let total_weight: usize = weights.iter().sum();
    let total_cost: u64 = items.iter().map(|(_, cost)| cost).sum();

    let last_weighted = weights.iter().rposition(|weight| *weight > 0);
    let mut remaining: VecDeque<(T, u64)> = items.into();

    if let Some(last) = last_weighted {
        for (index, assignment) in assignments.iter_mut().enumerate() {
            if index == last {
                assignment.items.extend(remaining.drain(..).map(|(item, _)| item));
                break;
            }

            let mut share = total_cost as f64 * weights[index] as f64 / total_weight as f64 + SHARE_SLACK;
            while share > 0.0 {
                let Some((item, cost)) = remaining.pop_front() else {
                    break;
                };
                assignment.items.push(item);
                share -= cost as f64;
            }
        }
    }

    assignments.retain(|assignment| !assignment.items.is_empty());
    assignments
}
