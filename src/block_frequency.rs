use indexmap::IndexMap;

use crate::{
    block::BlockId,
    branch_prediction::{BranchProbabilities, Edge},
    dominators::{Graph, NodeSet},
    module::{FuncId, Module},
    procedure::Procedure,
    EPSILON,
};

/// Expected executions of each block and traversals of each edge per single
/// invocation of one function, propagated from the branch probabilities
/// (algorithm 2 of Wu & Larus). Loops are collapsed through the cyclic
/// probability of their back edges, clamped just below 1 so frequencies stay
/// finite.
pub struct BlockFrequencies {
    branch_probabilities: BranchProbabilities,
    block_frequencies: IndexMap<BlockId, f64>,
    edge_frequencies: IndexMap<Edge, f64>,
    not_visited: NodeSet<BlockId>,
    loops_visited: NodeSet<usize>,
    back_edge_probabilities: IndexMap<Edge, f64>,
}

impl BlockFrequencies {
    /// The procedure's CFG analyses must already be computed (see
    /// [`Module::compute_cfg_analyses`]).
    pub fn new(module: &Module, func: FuncId) -> Self {
        let proc = module.procedure(func);
        let mut this = Self {
            branch_probabilities: BranchProbabilities::new(module, func),
            block_frequencies: IndexMap::new(),
            edge_frequencies: IndexMap::new(),
            not_visited: NodeSet::new(),
            loops_visited: NodeSet::new(),
            back_edge_probabilities: IndexMap::new(),
        };

        // Propagate every loop innermost-first, then the whole function as
        // if the entry headed one outer loop.
        let loops = proc.natural_loops();
        for block in proc.blocks() {
            if let Some(loop_) = loops.header_of(block) {
                this.propagate_loop(proc, loop_.index());
            }
        }
        this.mark_reachable(proc, proc.entry());
        this.propagate_freq(proc, proc.entry());

        this.not_visited.clear();
        this.loops_visited.clear();
        this.back_edge_probabilities.clear();
        this
    }

    /// Executions of the block per invocation. Unanalyzed blocks report 0.
    pub fn block_frequency(&self, block: BlockId) -> f64 {
        self.block_frequencies.get(&block).copied().unwrap_or(0.0)
    }

    /// Traversals of the edge per invocation. Unknown edges report 0.
    pub fn edge_frequency(&self, src: BlockId, dst: BlockId) -> f64 {
        self.edge_frequencies
            .get(&(src, dst))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn branch_probabilities(&self) -> &BranchProbabilities {
        &self.branch_probabilities
    }

    /// Updated probability of a back edge; before loop propagation touches
    /// it, this is just the predicted edge probability.
    fn back_edge_probability(&self, edge: Edge) -> f64 {
        self.back_edge_probabilities
            .get(&edge)
            .copied()
            .unwrap_or_else(|| self.branch_probabilities.edge_probability(edge.0, edge.1))
    }

    /// Mark all blocks reachable from `root` as not yet visited.
    fn mark_reachable(&mut self, proc: &Procedure, root: BlockId) {
        self.not_visited.clear();
        let mut stack = vec![root];
        while let Some(block) = stack.pop() {
            if !self.not_visited.insert(block) {
                continue;
            }
            for succ in proc.successors(block).iter().copied() {
                stack.push(succ);
            }
        }
    }

    /// Propagate frequencies of inner loops before the loops containing
    /// them, so their cyclic probabilities are in place when the outer
    /// propagation crosses their headers.
    fn propagate_loop(&mut self, proc: &Procedure, loop_index: usize) {
        if !self.loops_visited.insert(loop_index) {
            return;
        }
        let children: Vec<usize> = proc
            .natural_loops()
            .loop_at(loop_index)
            .child_indices()
            .to_vec();
        for child in children {
            self.propagate_loop(proc, child);
        }

        let head = proc.natural_loops().loop_at(loop_index).header();
        self.mark_reachable(proc, head);
        self.propagate_freq(proc, head);
    }

    fn propagate_freq(&mut self, proc: &Procedure, head: BlockId) {
        let loops = proc.natural_loops();
        let mut stack = vec![head];

        while let Some(block) = stack.pop() {
            if !self.not_visited.contains(block) {
                continue;
            }

            // The head of the propagation executes once by definition.
            self.block_frequencies.insert(block, 1.0);

            if block != head {
                // Defer until every forward predecessor has a frequency; the
                // predecessor will push this block again when it gets one.
                let deferred = proc.predecessors(block).iter().any(|&pred| {
                    self.not_visited.contains(pred)
                        && !self
                            .branch_probabilities
                            .info()
                            .is_back_edge((pred, block))
                });
                if deferred {
                    continue;
                }

                let loop_head = loops.is_loop_header(block);
                let mut bfreq = 0.0;
                let mut cyclic_probability = 0.0;
                for pred in proc.predecessors(block).iter().copied() {
                    let edge = (pred, block);
                    if loop_head && self.branch_probabilities.info().is_back_edge(edge) {
                        cyclic_probability += self.back_edge_probability(edge);
                    } else {
                        bfreq += self.edge_frequencies.get(&edge).copied().unwrap_or(0.0);
                    }
                }

                // A loop that seems not to terminate would push the cyclic
                // probability to or past 1; bound it so the geometric sum
                // stays finite.
                if cyclic_probability > 1.0 - EPSILON {
                    cyclic_probability = 1.0 - EPSILON;
                }
                self.block_frequencies
                    .insert(block, bfreq / (1.0 - cyclic_probability));
            }

            self.not_visited.remove(block);
            let freq = self.block_frequencies[&block];

            for succ in proc.successors(block).iter().copied() {
                let edge = (block, succ);
                let prob = self.branch_probabilities.edge_probability(block, succ);
                let efreq = prob * freq;
                self.edge_frequencies.insert(edge, efreq);

                // Reaching the head again closes an iteration; remember the
                // accumulated probability for the enclosing propagation.
                if succ == head {
                    self.back_edge_probabilities.insert(edge, efreq);
                }
            }

            // Push forward successors in reverse so the leftmost is
            // processed first, like the recursive formulation would.
            let forward: Vec<BlockId> = proc
                .successors(block)
                .iter()
                .copied()
                .filter(|&succ| {
                    !self
                        .branch_probabilities
                        .info()
                        .is_back_edge((block, succ))
                })
                .collect();
            for succ in forward.into_iter().rev() {
                stack.push(succ);
            }
        }
    }
}
