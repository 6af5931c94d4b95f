//! Static execution-frequency estimation for a CFG-based IR.
//!
//! Given a module of procedures, the crate predicts how often every basic
//! block executes and how often every function is invoked, without running
//! the program. It layers three analyses in the style of Wu & Larus
//! ("Static branch frequency and program profile analysis", MICRO-27,
//! 1994): branch probabilities from combined heuristics, block and edge
//! frequencies from a loop-aware propagation, and call frequencies from a
//! propagation over the call graph. Indirect call sites can be resolved to
//! candidate targets by a def-use points-to tracer, and a per-opcode cost
//! table turns the frequencies into a program cost report.

pub mod block;
pub mod block_frequency;
pub mod branch_prediction;
pub mod call_frequency;
pub mod cost;
pub mod dominators;
pub mod inst;
pub mod module;
pub mod natural_loops;
pub mod opcode;
pub mod points_to;
pub mod procedure;
pub mod typ;

#[cfg(test)]
mod tests;

pub use block::{BasicBlock, BasicBlockBuilder, BlockId};
pub use block_frequency::BlockFrequencies;
pub use branch_prediction::{BranchHeuristic, BranchProbabilities, Edge};
pub use call_frequency::{CallEdge, CallFrequencies};
pub use cost::{estimate_cost, CostKind, CostReport};
pub use inst::{AggregateKind, Callee, CmpKind, Inst, InstData, InstId};
pub use module::{FuncId, Module};
pub use opcode::Opcode;
pub use points_to::PointsTo;
pub use procedure::Procedure;
pub use typ::{Type, TypeKind};

/// Cyclic probabilities are clamped to `1 - EPSILON` so the geometric sum
/// `1 / (1 - cyclic)` stays finite for loops that appear not to terminate.
pub const EPSILON: f64 = 1e-6;

/// Reporting granularity. The analyses always work per block; `Function`
/// only changes how consumers aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    BasicBlock,
    Function,
}

/// Knobs of the estimator.
#[derive(Debug, Clone)]
pub struct Options {
    /// Resolve indirect call sites with the points-to tracer. Off by
    /// default; without it indirect sites contribute nothing.
    pub use_points_to_analysis: bool,
    pub granularity: Granularity,
    /// Cost kinds the report is computed for.
    pub cost_kinds: Vec<CostKind>,
    /// Name of the program entry point; its invocation frequency anchors
    /// the propagation at 1.
    pub root_function: String,
    /// Give functions the propagation never reaches the sum of their
    /// incoming global call frequencies instead of 0.
    pub sum_unreached_invocations: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            use_points_to_analysis: false,
            granularity: Granularity::BasicBlock,
            cost_kinds: vec![CostKind::Latency],
            root_function: "main".to_string(),
            sum_unreached_invocations: false,
        }
    }
}
