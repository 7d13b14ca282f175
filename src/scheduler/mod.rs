//! Work Partitioning Module
//!
//! Splits a cost-sorted asset list over the discovered nodes.
//!
//! ## Strategies
//! - **Simple**: round-robin chunks sized by each node's core count.
//! - **Cost**: each node gets `total_cost * cores / total_cores` worth of assets, handed out
//!   with a single forward pointer over the cost-sorted list.
//! - **Performance**: cost split over benchmark-weighted cores; needs a positive
//!   performance index on every node, otherwise falls back to cost.

pub mod strategy;
