use indexmap::{IndexMap, IndexSet};

use crate::{
    block::BlockId,
    block_frequency::BlockFrequencies,
    dominators::NodeSet,
    inst::Callee,
    module::{FuncId, Module},
    opcode::Opcode,
    points_to::PointsTo,
    Options, EPSILON,
};

/// A call-graph edge: (caller, callee).
pub type CallEdge = (FuncId, FuncId);

/// Module-wide result: per-function invocation frequencies and per-call-edge
/// local/global call frequencies (algorithm 3 of Wu & Larus), built on top
/// of the per-function block frequencies. Recursion cycles are collapsed the
/// same way CFG loops are, through a clamped cyclic probability.
pub struct CallFrequencies {
    block_frequencies: IndexMap<FuncId, BlockFrequencies>,
    /// Callees reachable from each function, in call-site order. Doubles as
    /// the call-graph adjacency.
    reachable: IndexMap<FuncId, IndexSet<FuncId>>,
    lfreqs: IndexMap<CallEdge, f64>,
    gfreqs: IndexMap<CallEdge, f64>,
    cfreqs: IndexMap<FuncId, f64>,
    back_edges: IndexSet<CallEdge>,
    back_edge_prob: IndexMap<CallEdge, f64>,
    visited: NodeSet<FuncId>,
    root: FuncId,
}

impl CallFrequencies {
    pub fn new(module: &mut Module, options: &Options) -> Self {
        module.compute_cfg_analyses();
        let module = &*module;

        let root = module
            .function_named(&options.root_function)
            .unwrap_or_else(|| panic!("root function {:?} not found", options.root_function));

        let mut this = Self {
            block_frequencies: IndexMap::new(),
            reachable: IndexMap::new(),
            lfreqs: IndexMap::new(),
            gfreqs: IndexMap::new(),
            cfreqs: IndexMap::new(),
            back_edges: IndexSet::new(),
            back_edge_prob: IndexMap::new(),
            visited: NodeSet::new(),
            root,
        };

        // Local frequencies first: every defined function gets its
        // intra-procedural analysis.
        for func in module.func_ids() {
            if !module.procedure(func).is_declaration() {
                this.block_frequencies
                    .insert(func, BlockFrequencies::new(module, func));
            }
        }

        this.build_call_graph(module, options);
        this.back_edge_prob = this.lfreqs.clone();
        this.propagate(module, options);
        this
    }

    /// Walk every call site, accumulating local call frequencies and the
    /// reachable-callee sets that form the call graph.
    fn build_call_graph(&mut self, module: &Module, options: &Options) {
        for func in module.func_ids() {
            self.reachable.entry(func).or_default();
            let proc = module.procedure(func);
            if proc.is_declaration() {
                continue;
            }
            for block in proc.blocks() {
                for &inst in proc.block(block).iter() {
                    if proc.inst(inst).opcode() != Opcode::Call {
                        continue;
                    }
                    match proc.inst(inst).callee() {
                        Callee::Direct(callee) => {
                            let freq = self.block_frequencies[&func].block_frequency(block);
                            *self.lfreqs.entry((func, callee)).or_insert(0.0) += freq;
                            self.reachable.get_mut(&func).unwrap().insert(callee);
                        }
                        Callee::Indirect(_) if options.use_points_to_analysis => {
                            let traced = PointsTo::new(module, &self.block_frequencies)
                                .resolve(func, inst);
                            for (callee, freq) in traced {
                                log::debug!(
                                    "{} may call {} with local frequency {}",
                                    proc.name(),
                                    module.name_of(callee),
                                    freq
                                );
                                *self.lfreqs.entry((func, callee)).or_insert(0.0) += freq;
                                self.reachable.get_mut(&func).unwrap().insert(callee);
                            }
                        }
                        Callee::Indirect(_) => {
                            // Without the tracer an indirect site contributes
                            // nothing.
                        }
                    }
                }
            }
        }
    }

    fn propagate(&mut self, module: &Module, options: &Options) {
        // Depth-first walk from the root, keeping the visit stack so an edge
        // closing back into it marks a call-graph loop head.
        let mut dfs_functions: Vec<FuncId> = vec![self.root];
        let mut loop_heads: IndexSet<FuncId> = IndexSet::new();
        let mut visited_stack: Vec<FuncId> = Vec::new();
        self.dfs(
            self.root,
            &mut dfs_functions,
            &mut visited_stack,
            &mut loop_heads,
        );

        // Settle each recursion cycle from its head, in reverse discovery
        // order so callees' cycles settle before their callers reach them.
        for &func in dfs_functions.iter().rev() {
            if loop_heads.contains(&func) {
                self.mark_unvisited_reachable_from(module, func);
                self.propagate_call_freq(func, func, false);
            }
        }

        // Final pass from the root, now feeding back-edge probabilities into
        // the cyclic correction.
        self.mark_unvisited_reachable_from(module, self.root);
        self.propagate_call_freq(self.root, self.root, true);

        if options.sum_unreached_invocations {
            // Functions the propagation never reached can still be given the
            // sum of their incoming global frequencies.
            for func in module.func_ids() {
                if self.cfreqs.contains_key(&func) {
                    continue;
                }
                let mut total = 0.0;
                for (&pred, reachable) in self.reachable.iter() {
                    if pred != func && reachable.contains(&func) {
                        total += self.gfreqs.get(&(pred, func)).copied().unwrap_or(0.0);
                    }
                }
                self.cfreqs.insert(func, total);
            }
        }
    }

    fn dfs(
        &mut self,
        func: FuncId,
        dfs_functions: &mut Vec<FuncId>,
        visited_stack: &mut Vec<FuncId>,
        loop_heads: &mut IndexSet<FuncId>,
    ) {
        visited_stack.push(func);
        let callees: Vec<FuncId> = self.reachable[&func].iter().copied().collect();
        for callee in callees {
            if !dfs_functions.contains(&callee) {
                dfs_functions.push(callee);
                self.dfs(callee, dfs_functions, visited_stack, loop_heads);
            } else if visited_stack.contains(&callee) {
                log::debug!("recursion: {:?} calls back into {:?}", func, callee);
                loop_heads.insert(callee);
                self.back_edges.insert((func, callee));
            }
        }
        visited_stack.pop();
    }

    /// Mark everything transitively reachable from `head` (including the
    /// head) as unvisited and the rest as visited, so propagation stays
    /// inside the region hanging off the head.
    fn mark_unvisited_reachable_from(&mut self, module: &Module, head: FuncId) {
        let mut reached: NodeSet<FuncId> = NodeSet::new();
        let mut stack = vec![head];
        while let Some(func) = stack.pop() {
            if !reached.insert(func) {
                continue;
            }
            for callee in self.reachable[&func].iter().copied() {
                stack.push(callee);
            }
        }

        self.visited.clear();
        for func in module.func_ids() {
            if !reached.contains(func) {
                self.visited.insert(func);
            }
        }
    }

    fn propagate_call_freq(&mut self, func: FuncId, head: FuncId, is_final: bool) {
        if self.visited.contains(func) {
            return;
        }

        // Every forward predecessor must already be settled; otherwise we
        // will be reached again from it.
        let mut preds: Vec<FuncId> = Vec::new();
        for (&pred, reachable) in self.reachable.iter() {
            if reachable.contains(&func) {
                let edge = (pred, func);
                if !self.visited.contains(pred) && !self.back_edges.contains(&edge) {
                    return;
                }
                preds.push(pred);
            }
        }

        let mut cfreq = if func == head { 1.0 } else { 0.0 };
        let mut cyclic_probability = 0.0;
        for pred in preds {
            let edge = (pred, func);
            if is_final && self.back_edges.contains(&edge) {
                cyclic_probability += self.back_edge_prob.get(&edge).copied().unwrap_or(0.0);
            } else if !self.back_edges.contains(&edge) {
                cfreq += self.gfreqs.get(&edge).copied().unwrap_or(0.0);
            }
        }
        if cyclic_probability > 1.0 - EPSILON {
            cyclic_probability = 1.0 - EPSILON;
        }
        cfreq /= 1.0 - cyclic_probability;
        self.cfreqs.insert(func, cfreq);
        self.visited.insert(func);

        let callees: Vec<FuncId> = self.reachable[&func].iter().copied().collect();
        for &callee in callees.iter() {
            let edge = (func, callee);
            let gfreq = self.lfreqs.get(&edge).copied().unwrap_or(0.0) * cfreq;
            self.gfreqs.insert(edge, gfreq);
            if callee == head && !is_final {
                self.back_edge_prob.insert(edge, gfreq);
            }
        }

        for callee in callees {
            if !self.back_edges.contains(&(func, callee)) {
                self.propagate_call_freq(callee, head, is_final);
            }
        }
    }

    pub fn root(&self) -> FuncId {
        self.root
    }

    /// Expected invocations of the function per program run. Unreached
    /// functions report 0.
    pub fn invocation_frequency(&self, func: FuncId) -> f64 {
        self.cfreqs.get(&func).copied().unwrap_or(0.0)
    }

    /// Expected calls from one invocation of the caller to the callee.
    pub fn local_call_frequency(&self, caller: FuncId, callee: FuncId) -> f64 {
        self.lfreqs.get(&(caller, callee)).copied().unwrap_or(0.0)
    }

    /// Expected calls across the edge per program run.
    pub fn global_call_frequency(&self, caller: FuncId, callee: FuncId) -> f64 {
        self.gfreqs.get(&(caller, callee)).copied().unwrap_or(0.0)
    }

    /// Every call edge with a nonzero local frequency, in discovery order.
    pub fn call_edges(&self) -> impl Iterator<Item = CallEdge> + '_ {
        self.lfreqs.keys().copied()
    }

    pub fn block_frequencies(&self, func: FuncId) -> Option<&BlockFrequencies> {
        self.block_frequencies.get(&func)
    }

    pub fn local_block_frequency(&self, func: FuncId, block: BlockId) -> f64 {
        self.block_frequencies
            .get(&func)
            .map(|bf| bf.block_frequency(block))
            .unwrap_or(0.0)
    }

    pub fn local_edge_frequency(&self, func: FuncId, src: BlockId, dst: BlockId) -> f64 {
        self.block_frequencies
            .get(&func)
            .map(|bf| bf.edge_frequency(src, dst))
            .unwrap_or(0.0)
    }

    pub fn edge_probability(&self, func: FuncId, src: BlockId, dst: BlockId) -> f64 {
        self.block_frequencies
            .get(&func)
            .map(|bf| bf.branch_probabilities().edge_probability(src, dst))
            .unwrap_or(1.0)
    }

    /// Expected executions of the block per program run: its local frequency
    /// scaled by its function's invocation frequency.
    pub fn global_block_frequency(&self, func: FuncId, block: BlockId) -> f64 {
        self.local_block_frequency(func, block) * self.invocation_frequency(func)
    }
}
