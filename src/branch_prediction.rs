use indexmap::{IndexMap, IndexSet};

use crate::{
    block::BlockId,
    dominators::{Graph, NodeSet, PostDominators},
    inst::{Callee, CmpKind, InstData},
    module::{FuncId, Module},
    natural_loops::NaturalLoops,
    opcode::Opcode,
    procedure::{block_returns, Procedure},
};

/// An intra-procedural CFG edge.
pub type Edge = (BlockId, BlockId);

/// Per-function facts the branch heuristics consult: back and exit edges,
/// and which blocks call, store, or never return.
pub struct BranchPredictionInfo {
    back_edges: IndexSet<Edge>,
    exit_edges: IndexSet<Edge>,
    back_edge_count: Vec<usize>,
    has_call: NodeSet<BlockId>,
    has_store: NodeSet<BlockId>,
    calls_exit: NodeSet<BlockId>,
}

impl BranchPredictionInfo {
    pub fn build(module: &Module, func: FuncId) -> Self {
        let proc = module.procedure(func);
        let mut this = Self {
            back_edges: IndexSet::new(),
            exit_edges: IndexSet::new(),
            back_edge_count: vec![0; proc.num_nodes()],
            has_call: NodeSet::new(),
            has_store: NodeSet::new(),
            calls_exit: NodeSet::new(),
        };
        this.find_back_and_exit_edges(proc);
        this.find_calls_and_stores(module, proc);
        this
    }

    fn find_back_and_exit_edges(&mut self, proc: &Procedure) {
        let dominators = proc.dominators();
        for block in proc.blocks() {
            for succ in proc.successors(block).iter().copied() {
                if dominators.dominates(succ, block) {
                    self.back_edges.insert((block, succ));
                    self.back_edge_count[block.0] += 1;
                }
            }
        }

        let loops = proc.natural_loops();
        for loop_ in loops.loops() {
            for block in loop_.body().iter().copied() {
                for succ in proc.successors(block).iter().copied() {
                    if !loop_.contains(succ) {
                        self.exit_edges.insert((block, succ));
                    }
                }
            }
        }
    }

    fn find_calls_and_stores(&mut self, module: &Module, proc: &Procedure) {
        for block in proc.blocks() {
            for &inst in proc.block(block).iter() {
                match proc.inst(inst).opcode() {
                    Opcode::Store => {
                        self.has_store.insert(block);
                    }
                    Opcode::Call => match proc.inst(inst).callee() {
                        Callee::Direct(callee) => {
                            if !module.procedure(callee).is_intrinsic() {
                                self.has_call.insert(block);
                            }
                            if module.procedure(callee).is_no_return() {
                                self.calls_exit.insert(block);
                            }
                        }
                        Callee::Indirect(_) => {
                            self.has_call.insert(block);
                        }
                    },
                    _ => {}
                }
            }
        }
    }

    pub fn is_back_edge(&self, edge: Edge) -> bool {
        self.back_edges.contains(&edge)
    }

    pub fn is_exit_edge(&self, edge: Edge) -> bool {
        self.exit_edges.contains(&edge)
    }

    pub fn count_back_edges(&self, block: BlockId) -> usize {
        self.back_edge_count[block.0]
    }

    pub fn has_call(&self, block: BlockId) -> bool {
        self.has_call.contains(block)
    }

    pub fn has_store(&self, block: BlockId) -> bool {
        self.has_store.contains(block)
    }

    pub fn calls_exit(&self, block: BlockId) -> bool {
        self.calls_exit.contains(block)
    }

    pub fn back_edges(&self) -> impl Iterator<Item = Edge> + '_ {
        self.back_edges.iter().copied()
    }
}

/// The branch heuristics, in the order they are combined. Each nominates a
/// taken and a not-taken successor with a fixed probability pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchHeuristic {
    LoopBranch,
    Pointer,
    Call,
    Opcode,
    LoopExit,
    Return,
    Store,
    LoopHeader,
    Guard,
}

impl BranchHeuristic {
    pub const ALL: [BranchHeuristic; 9] = [
        BranchHeuristic::LoopBranch,
        BranchHeuristic::Pointer,
        BranchHeuristic::Call,
        BranchHeuristic::Opcode,
        BranchHeuristic::LoopExit,
        BranchHeuristic::Return,
        BranchHeuristic::Store,
        BranchHeuristic::LoopHeader,
        BranchHeuristic::Guard,
    ];

    /// Probability of the taken and not-taken successor, from the Wu-Larus
    /// paper's measured hit rates.
    pub fn probabilities(self) -> (f64, f64) {
        match self {
            BranchHeuristic::LoopBranch => (0.88, 0.12),
            BranchHeuristic::Pointer => (0.60, 0.40),
            BranchHeuristic::Call => (0.78, 0.22),
            BranchHeuristic::Opcode => (0.84, 0.16),
            BranchHeuristic::LoopExit => (0.80, 0.20),
            BranchHeuristic::Return => (0.72, 0.28),
            BranchHeuristic::Store => (0.55, 0.45),
            BranchHeuristic::LoopHeader => (0.75, 0.25),
            BranchHeuristic::Guard => (0.62, 0.38),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BranchHeuristic::LoopBranch => "loop branch",
            BranchHeuristic::Pointer => "pointer",
            BranchHeuristic::Call => "call",
            BranchHeuristic::Opcode => "opcode",
            BranchHeuristic::LoopExit => "loop exit",
            BranchHeuristic::Return => "return",
            BranchHeuristic::Store => "store",
            BranchHeuristic::LoopHeader => "loop header",
            BranchHeuristic::Guard => "guard",
        }
    }
}

/// A matched prediction: (taken successor, not-taken successor).
type Prediction = (BlockId, BlockId);

struct HeuristicMatcher<'a> {
    proc: &'a Procedure,
    info: &'a BranchPredictionInfo,
    post_dominators: &'a PostDominators,
    loops: &'a NaturalLoops<Procedure>,
}

impl<'a> HeuristicMatcher<'a> {
    fn match_heuristic(&self, heuristic: BranchHeuristic, block: BlockId) -> Option<Prediction> {
        let succs = self.proc.successors(block);
        let (s0, s1) = (succs[0], succs[1]);
        match heuristic {
            BranchHeuristic::LoopBranch => self.match_loop_branch(block, s0, s1),
            BranchHeuristic::Pointer => self.match_pointer(block, s0, s1),
            BranchHeuristic::Call => self.match_call(s0, s1),
            BranchHeuristic::Opcode => self.match_opcode(block, s0, s1),
            BranchHeuristic::LoopExit => self.match_loop_exit(block, s0, s1),
            BranchHeuristic::Return => self.match_return(s0, s1),
            BranchHeuristic::Store => self.match_store(s0, s1),
            BranchHeuristic::LoopHeader => self.match_loop_header(block, s0, s1),
            BranchHeuristic::Guard => self.match_guard(block, s0, s1),
        }
    }

    /// Iteration continues: a back edge is taken, an exit edge is not.
    fn match_loop_branch(&self, block: BlockId, s0: BlockId, s1: BlockId) -> Option<Prediction> {
        if self.info.is_back_edge((block, s0)) {
            Some((s0, s1))
        } else if self.info.is_back_edge((block, s1)) {
            Some((s1, s0))
        } else if self.info.is_exit_edge((block, s0)) {
            Some((s1, s0))
        } else if self.info.is_exit_edge((block, s1)) {
            Some((s0, s1))
        } else {
            None
        }
    }

    /// A pointer compared against null or against another pointer is
    /// expected to be unequal.
    fn match_pointer(&self, block: BlockId, s0: BlockId, s1: BlockId) -> Option<Prediction> {
        let cond = self.branch_condition(block)?;
        let cond = self.proc.inst(cond);
        if cond.opcode() != Opcode::Icmp {
            return None;
        }
        let lhs = self.proc.inst(cond.children()[0]);
        let rhs = self.proc.inst(cond.children()[1]);
        if !lhs.typ().is_ptr() && !rhs.typ().is_ptr() {
            return None;
        }
        match cond.cmp_kind() {
            CmpKind::Eq => Some((s1, s0)),
            CmpKind::Ne => Some((s0, s1)),
            _ => None,
        }
    }

    /// The event holds on every path through `block` when it is in the block
    /// itself or in a block post-dominating it.
    fn leads_to(&self, block: BlockId, event: impl Fn(BlockId) -> bool) -> bool {
        if event(block) {
            return true;
        }
        self.proc
            .blocks()
            .any(|other| event(other) && self.post_dominators.strictly_dominates(other, block))
    }

    /// A path that reaches a call is the unlikely one.
    fn match_call(&self, s0: BlockId, s1: BlockId) -> Option<Prediction> {
        let c0 = self.leads_to(s0, |b| self.info.has_call(b));
        let c1 = self.leads_to(s1, |b| self.info.has_call(b));
        match (c0, c1) {
            (true, false) => Some((s1, s0)),
            (false, true) => Some((s0, s1)),
            _ => None,
        }
    }

    /// Comparisons of an integer against zero or a negative constant are
    /// expected to fail.
    fn match_opcode(&self, block: BlockId, s0: BlockId, s1: BlockId) -> Option<Prediction> {
        let cond = self.branch_condition(block)?;
        let cond = self.proc.inst(cond);
        if cond.opcode() != Opcode::Icmp {
            return None;
        }
        let lhs = self.proc.inst(cond.children()[0]);
        let rhs = self.proc.inst(cond.children()[1]);
        if !lhs.typ().is_int() {
            return None;
        }
        let constant = match rhs.data() {
            InstData::IntConst(value) => *value,
            _ => return None,
        };
        if constant > 0 {
            return None;
        }
        match cond.cmp_kind() {
            CmpKind::Eq | CmpKind::Slt | CmpKind::Sle => Some((s1, s0)),
            CmpKind::Ne | CmpKind::Sgt | CmpKind::Sge => Some((s0, s1)),
        }
    }

    /// A branch in the middle of a loop body whose successors are not loop
    /// headers stays in the loop. The header's own exit test is already the
    /// loop branch heuristic's business.
    fn match_loop_exit(&self, block: BlockId, s0: BlockId, s1: BlockId) -> Option<Prediction> {
        let loop_ = self.loops.innermost_loop_of(block)?;
        if loop_.header() == block {
            return None;
        }
        if self.loops.is_loop_header(s0) || self.loops.is_loop_header(s1) {
            return None;
        }
        match (loop_.contains(s0), loop_.contains(s1)) {
            (true, false) => Some((s0, s1)),
            (false, true) => Some((s1, s0)),
            _ => None,
        }
    }

    fn match_return(&self, s0: BlockId, s1: BlockId) -> Option<Prediction> {
        let r0 = self.leads_to(s0, |b| block_returns(self.proc, b));
        let r1 = self.leads_to(s1, |b| block_returns(self.proc, b));
        match (r0, r1) {
            (true, false) => Some((s1, s0)),
            (false, true) => Some((s0, s1)),
            _ => None,
        }
    }

    fn match_store(&self, s0: BlockId, s1: BlockId) -> Option<Prediction> {
        let w0 = self.leads_to(s0, |b| self.info.has_store(b));
        let w1 = self.leads_to(s1, |b| self.info.has_store(b));
        match (w0, w1) {
            (true, false) => Some((s1, s0)),
            (false, true) => Some((s0, s1)),
            _ => None,
        }
    }

    /// Branching toward a loop header (or its pre-header) enters the loop.
    fn match_loop_header(&self, block: BlockId, s0: BlockId, s1: BlockId) -> Option<Prediction> {
        for (succ, other) in [(s0, s1), (s1, s0)] {
            let into_loop = self.loops.is_loop_header(succ)
                || self.loops.is_loop_pre_header(self.proc, succ);
            if into_loop && !self.info.is_back_edge((block, succ)) {
                return Some((succ, other));
            }
        }
        None
    }

    /// A successor that uses an operand of the comparison without
    /// post-dominating the branch is the guarded, expected path.
    fn match_guard(&self, block: BlockId, s0: BlockId, s1: BlockId) -> Option<Prediction> {
        let cond = self.branch_condition(block)?;
        let cond = self.proc.inst(cond);
        if cond.opcode() != Opcode::Icmp {
            return None;
        }
        let operands: Vec<_> = cond
            .children()
            .iter()
            .copied()
            .filter(|&op| !self.proc.inst(op).opcode().is_constant())
            .collect();
        if operands.is_empty() {
            return None;
        }

        for (succ, other) in [(s0, s1), (s1, s0)] {
            if self.post_dominators.dominates(succ, block) {
                continue;
            }
            let uses_operand = self.proc.block(succ).iter().any(|&inst| {
                self.proc
                    .inst(inst)
                    .children()
                    .iter()
                    .any(|child| operands.contains(child))
            });
            if uses_operand {
                return Some((succ, other));
            }
        }
        None
    }

    fn branch_condition(&self, block: BlockId) -> Option<crate::inst::InstId> {
        let term = self.proc.terminator(block);
        let term = self.proc.inst(term);
        if term.opcode() == Opcode::Branch {
            Some(term.children()[0])
        } else {
            None
        }
    }
}

/// Branch probabilities for every CFG edge of one function, produced by
/// combining the matching heuristics with the Dempster-Shafer evidence rule
/// (Wu & Larus, MICRO-27, 1994).
pub struct BranchProbabilities {
    edge_probabilities: IndexMap<Edge, f64>,
    info: BranchPredictionInfo,
}

impl BranchProbabilities {
    /// The procedure's dominators, post-dominators and loops must already be
    /// computed (see [`Module::compute_cfg_analyses`]).
    pub fn new(module: &Module, func: FuncId) -> Self {
        let proc = module.procedure(func);
        assert!(!proc.is_declaration(), "cannot predict a declaration");

        let info = BranchPredictionInfo::build(module, func);
        let mut this = Self {
            edge_probabilities: IndexMap::new(),
            info,
        };
        for block in proc.blocks() {
            this.calculate_branch_probabilities(proc, block);
        }
        this
    }

    /// Probability of the edge being traversed when its source executes.
    /// Unknown edges default to 1.0, i.e. unconditional.
    pub fn edge_probability(&self, src: BlockId, dst: BlockId) -> f64 {
        self.edge_probabilities
            .get(&(src, dst))
            .copied()
            .unwrap_or(1.0)
    }

    pub fn info(&self) -> &BranchPredictionInfo {
        &self.info
    }

    fn calculate_branch_probabilities(&mut self, proc: &Procedure, block: BlockId) {
        let successors: Vec<BlockId> = proc.successors(block).to_vec();
        let m = successors.len();
        let n = self.info.count_back_edges(block);

        if m == 0 {
            return;
        }

        if self.info.calls_exit(block) {
            // Nothing after a call that never returns executes.
            for &succ in successors.iter() {
                self.edge_probabilities.insert((block, succ), 0.0);
            }
        } else if n > 0 && n < m {
            // Back edges split the taken weight of the loop branch
            // heuristic; the remaining edges leave the loop and split the
            // not-taken weight.
            let (taken, not_taken) = BranchHeuristic::LoopBranch.probabilities();
            for &succ in successors.iter() {
                let prob = if self.info.is_back_edge((block, succ)) {
                    taken / n as f64
                } else {
                    not_taken / (m - n) as f64
                };
                self.edge_probabilities.insert((block, succ), prob);
            }
        } else if n > 0 || m != 2 {
            // Switches and all-back-edge terminators: uniform.
            for &succ in successors.iter() {
                self.edge_probabilities.insert((block, succ), 1.0 / m as f64);
            }
        } else {
            let (s0, s1) = (successors[0], successors[1]);
            self.edge_probabilities.insert((block, s0), 0.5);
            self.edge_probabilities.insert((block, s1), 0.5);

            let matcher = HeuristicMatcher {
                proc,
                info: &self.info,
                post_dominators: proc.post_dominators(),
                loops: proc.natural_loops(),
            };
            let mut predictions = Vec::new();
            for heuristic in BranchHeuristic::ALL {
                if let Some((taken, not_taken)) = matcher.match_heuristic(heuristic, block) {
                    log::trace!(
                        "{}: BB{} matched {} heuristic, taken BB{}",
                        proc.name(),
                        block.0,
                        heuristic.name(),
                        taken.0
                    );
                    predictions.push((heuristic, taken, not_taken));
                }
            }
            for (heuristic, taken, not_taken) in predictions {
                self.add_edge_probability(heuristic, block, taken, not_taken);
            }
        }
    }

    /// Fold a newly matched heuristic into the probabilities accumulated so
    /// far.
    fn add_edge_probability(
        &mut self,
        heuristic: BranchHeuristic,
        block: BlockId,
        taken: BlockId,
        not_taken: BlockId,
    ) {
        let old = (
            self.edge_probability(block, taken),
            self.edge_probability(block, not_taken),
        );
        let (new_taken, new_not_taken) = combine(old, heuristic.probabilities());
        self.edge_probabilities.insert((block, taken), new_taken);
        self.edge_probabilities
            .insert((block, not_taken), new_not_taken);
    }
}

/// Dempster-Shafer evidence combination of two (taken, not-taken) pairs; the
/// normalization keeps the result a distribution.
fn combine(old: (f64, f64), update: (f64, f64)) -> (f64, f64) {
    let d = old.0 * update.0 + old.1 * update.1;
    (old.0 * update.0 / d, old.1 * update.1 / d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combination_is_commutative() {
        for a in BranchHeuristic::ALL {
            for b in BranchHeuristic::ALL {
                let one_way = combine(combine((0.5, 0.5), a.probabilities()), b.probabilities());
                let other_way = combine(combine((0.5, 0.5), b.probabilities()), a.probabilities());
                assert!((one_way.0 - other_way.0).abs() <= 1e-12);
                assert!((one_way.1 - other_way.1).abs() <= 1e-12);
            }
        }
    }

    #[test]
    fn combination_stays_a_distribution() {
        let mut pair = (0.5, 0.5);
        for heuristic in BranchHeuristic::ALL {
            pair = combine(pair, heuristic.probabilities());
            assert!((pair.0 + pair.1 - 1.0).abs() <= 1e-9);
            assert!(pair.0 > 0.0 && pair.1 > 0.0);
        }
    }

    #[test]
    fn first_matching_heuristic_replaces_the_even_prior() {
        for heuristic in BranchHeuristic::ALL {
            let (taken, not_taken) = heuristic.probabilities();
            let combined = combine((0.5, 0.5), (taken, not_taken));
            assert!((combined.0 - taken).abs() <= 1e-12);
            assert!((combined.1 - not_taken).abs() <= 1e-12);
        }
    }
}
