use std::collections::VecDeque;

use indexmap::IndexMap;

use crate::{
    block::BlockId,
    block_frequency::BlockFrequencies,
    dominators::{Graph, NodeSet},
    inst::{AggregateKind, Callee, InstData, InstId},
    module::{FuncId, Module},
    opcode::Opcode,
    procedure::Procedure,
};

/// How the tracer is approaching an instruction: `Regular` walks backwards
/// from a use towards the definitions that feed it, `Reverse` walks forward
/// from a definition towards the uses it feeds, and `Arg` enters a callee
/// through the parameter at the given position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TraceTag {
    Regular,
    Reverse,
    Arg(usize),
}

/// State of one trace. A trace is confined to a single function; following a
/// call's return value or argument spawns a nested trace whose result is
/// merged at the block of the instruction that initiated it.
struct TraceData {
    func: FuncId,
    ref_inst: InstId,
    first_inst: InstId,
    queue: VecDeque<(InstId, TraceTag)>,
    ancestors: NodeSet<BlockId>,
    /// Write events per block: which function (or null) the traced cell
    /// holds after this block runs, with an uncorrected weight.
    trace: IndexMap<BlockId, Vec<(Option<FuncId>, f64)>>,
    /// Memo for the path-correction DFS.
    bfreqs: IndexMap<BlockId, f64>,
}

impl TraceData {
    fn new(func: FuncId, ref_inst: InstId) -> Self {
        Self::with_first(func, ref_inst, ref_inst)
    }

    fn with_first(func: FuncId, ref_inst: InstId, first_inst: InstId) -> Self {
        Self {
            func,
            ref_inst,
            first_inst,
            queue: VecDeque::new(),
            ancestors: NodeSet::new(),
            trace: IndexMap::new(),
            bfreqs: IndexMap::new(),
        }
    }

    fn push_instr(&mut self, inst: InstId, tag: TraceTag) {
        self.queue.push_back((inst, tag));
    }

    /// Every block that can reach `block`, plus `block` itself.
    fn add_ancestors(&mut self, proc: &Procedure, block: BlockId) {
        let mut stack = vec![block];
        while let Some(current) = stack.pop() {
            if !self.ancestors.insert(current) {
                continue;
            }
            for pred in proc.predecessors(current).iter().copied() {
                stack.push(pred);
            }
        }
    }

    fn is_ancestor(&self, block: BlockId) -> bool {
        self.ancestors.contains(block)
    }

    fn has_trace(&self, block: BlockId) -> bool {
        self.trace.contains_key(&block)
    }

    fn add_cfreq(&mut self, block: BlockId, target: Option<FuncId>, weight: f64) {
        self.trace.entry(block).or_default().push((target, weight));
    }

    /// Merge every write event of `src` into this trace at `block`.
    fn merge_trace(&mut self, block: BlockId, src: TraceData) {
        if src.trace.is_empty() {
            return;
        }
        let dst = self.trace.entry(block).or_default();
        for (_, events) in src.trace {
            dst.extend(events);
        }
    }

    /// Scale every recorded weight, used when a callee-relative trace is
    /// folded into the caller.
    fn correct_trace(&mut self, correction: f64) {
        for (_, events) in self.trace.iter_mut() {
            for (_, weight) in events.iter_mut() {
                *weight *= correction;
            }
        }
    }

    fn sum_trace(&self, result: &mut IndexMap<FuncId, f64>) {
        for (_, events) in self.trace.iter() {
            for &(target, weight) in events.iter() {
                // Observed null writes don't call anything.
                if let Some(func) = target {
                    *result.entry(func).or_insert(0.0) += weight;
                }
            }
        }
    }
}

fn is_write_opcode(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::Store | Opcode::Call | Opcode::Phi | Opcode::Select
    )
}

/// Resolves an indirect call site to the set of functions it may invoke and
/// the fraction of the site's block frequency attributable to each. A
/// flow-sensitive def-use tracer: field-sensitive for structs, opaque for
/// arrays, with limited follow-through into callees via return values and
/// pointer arguments.
pub struct PointsTo<'a> {
    module: &'a Module,
    freqs: &'a IndexMap<FuncId, BlockFrequencies>,
}

impl<'a> PointsTo<'a> {
    pub fn new(module: &'a Module, freqs: &'a IndexMap<FuncId, BlockFrequencies>) -> Self {
        Self { module, freqs }
    }

    /// Trace the callee operand of an indirect call. The result maps each
    /// possible target to its local frequency at this site.
    pub fn resolve(&self, func: FuncId, call: InstId) -> IndexMap<FuncId, f64> {
        let proc = self.module.procedure(func);
        assert_eq!(proc.inst(call).opcode(), Opcode::Call);
        log::debug!(
            "tracing indirect call i{} in {}",
            call.0,
            proc.name()
        );

        let mut data = TraceData::new(func, call);
        self.trace_main(&mut data, TraceTag::Regular);

        let mut result = IndexMap::new();
        data.sum_trace(&mut result);
        for (target, freq) in result.iter() {
            log::debug!(
                "  may call {} with local frequency {}",
                self.module.name_of(*target),
                freq
            );
        }
        result
    }

    fn block_frequency(&self, func: FuncId, block: BlockId) -> f64 {
        self.freqs
            .get(&func)
            .map(|bf| bf.block_frequency(block))
            .unwrap_or(0.0)
    }

    fn edge_frequency(&self, func: FuncId, src: BlockId, dst: BlockId) -> f64 {
        self.freqs
            .get(&func)
            .map(|bf| bf.edge_frequency(src, dst))
            .unwrap_or(0.0)
    }

    fn trace_main(&self, data: &mut TraceData, initial_tag: TraceTag) {
        assert!(data.trace.is_empty() && data.queue.is_empty() && data.ancestors.is_empty());
        data.push_instr(data.first_inst, initial_tag);
        {
            let proc = self.module.procedure(data.func);
            let ref_block = proc.owner(data.ref_inst);
            data.add_ancestors(proc, ref_block);
        }

        while let Some((inst, tag)) = data.queue.pop_front() {
            let proc = self.module.procedure(data.func);
            let opcode = proc.inst(inst).opcode();

            // Later writes in ancestors dominate: once a block has a write
            // event, earlier writes in it are dead for this trace.
            if is_write_opcode(opcode) && data.has_trace(proc.owner(inst)) {
                continue;
            }

            log::trace!("  visiting i{} ({:?}, {:?})", inst.0, opcode, tag);
            match opcode {
                Opcode::Alloca => self.trace_alloca(data, inst, tag),
                Opcode::Load => self.trace_load(data, inst, tag),
                Opcode::Store => self.trace_store(data, inst, tag),
                Opcode::Call => self.trace_call(data, inst, tag),
                Opcode::Gep => self.trace_gep(data, inst, tag),
                Opcode::Phi => self.trace_phi(data, inst),
                Opcode::Select => self.trace_select(data, inst),
                Opcode::Return => self.trace_return(data, inst),
                other => panic!(
                    "points-to tracer cannot handle opcode {:?} (i{} in {})",
                    other,
                    inst.0,
                    proc.name()
                ),
            }
        }

        // Correct each block's weight by the fraction of paths from it that
        // reach the reference without being overwritten.
        let blocks: Vec<BlockId> = data.trace.keys().copied().collect();
        for block in blocks {
            let corrected = self.correct_freq(data, block);
            for (_, weight) in data.trace.get_mut(&block).unwrap().iter_mut() {
                *weight *= corrected;
            }
        }
    }

    fn trace_alloca(&self, data: &mut TraceData, alloca: InstId, tag: TraceTag) {
        let proc = self.module.procedure(data.func);
        match tag {
            TraceTag::Regular => {
                let ref_inst = data.ref_inst;
                let ref_block = proc.owner(ref_inst);
                let mut stores: IndexMap<BlockId, InstId> = IndexMap::new();
                // Walk users newest-first so the first store kept per block
                // is the last one the block executes.
                for &user in proc.inst(alloca).users().iter().rev() {
                    match proc.inst(user).opcode() {
                        Opcode::Store if proc.inst(user).store_ptr() == alloca => {
                            let store_block = proc.owner(user);
                            if store_block == ref_block && !proc.comes_before(user, ref_inst) {
                                continue; // Store after the use.
                            }
                            if !data.is_ancestor(store_block) {
                                continue;
                            }
                            if !stores.contains_key(&store_block) {
                                stores.insert(store_block, user);
                                data.push_instr(user, TraceTag::Regular);
                            }
                        }
                        Opcode::Call => {
                            // The cell's address escapes into the callee,
                            // which may set it through the parameter.
                            if let Some(pos) = argument_position(proc, user, alloca) {
                                data.push_instr(user, TraceTag::Arg(pos));
                            }
                        }
                        _ => {}
                    }
                }
            }
            TraceTag::Reverse => {
                for &user in proc.inst(alloca).users().iter() {
                    if proc.inst(user).opcode() == Opcode::Load {
                        data.push_instr(user, TraceTag::Reverse);
                    }
                }
            }
            TraceTag::Arg(_) => unreachable!("allocas take no argument tag"),
        }
    }

    fn trace_load(&self, data: &mut TraceData, load: InstId, tag: TraceTag) {
        let proc = self.module.procedure(data.func);
        match tag {
            TraceTag::Regular => {
                if load != data.ref_inst {
                    // The pointer was reloaded: resolve that load on its own
                    // and fold the result in where it happened.
                    let mut nested = TraceData::new(data.func, load);
                    self.trace_main(&mut nested, TraceTag::Regular);
                    data.merge_trace(proc.owner(load), nested);
                } else {
                    data.push_instr(proc.inst(load).load_ptr(), TraceTag::Regular);
                }
            }
            TraceTag::Reverse => {
                for &user in proc.inst(load).users().iter() {
                    match proc.inst(user).opcode() {
                        Opcode::Store => data.push_instr(user, TraceTag::Regular),
                        Opcode::Call => {
                            if let Some(pos) = argument_position(proc, user, load) {
                                data.push_instr(user, TraceTag::Arg(pos));
                            }
                        }
                        _ => {}
                    }
                }
            }
            TraceTag::Arg(_) => unreachable!("loads take no argument tag"),
        }
    }

    fn trace_store(&self, data: &mut TraceData, store: InstId, tag: TraceTag) {
        let proc = self.module.procedure(data.func);
        match tag {
            TraceTag::Regular => {
                let value = proc.inst(store).store_value();
                let block = proc.owner(store);
                match proc.inst(value).data() {
                    InstData::Func(func) => {
                        let func = *func;
                        data.add_cfreq(block, Some(func), self.block_frequency(data.func, block));
                    }
                    _ if proc.inst(value).opcode().is_constant() => {
                        data.add_cfreq(block, None, self.block_frequency(data.func, block));
                    }
                    _ => data.push_instr(value, TraceTag::Regular),
                }
            }
            TraceTag::Reverse => {
                data.push_instr(proc.inst(store).store_ptr(), TraceTag::Reverse);
            }
            TraceTag::Arg(_) => unreachable!("stores take no argument tag"),
        }
    }

    fn trace_call(&self, data: &mut TraceData, call: InstId, tag: TraceTag) {
        let proc = self.module.procedure(data.func);
        let call_block = proc.owner(call);
        match tag {
            TraceTag::Regular | TraceTag::Reverse => match proc.inst(call).callee() {
                Callee::Direct(callee) => {
                    // The traced pointer came out of this call: trace the
                    // callee's returned value, scaled to the call site.
                    let callee_proc = self.module.procedure(callee);
                    if callee_proc.is_declaration() {
                        log::debug!(
                            "  cannot trace through external callee {}",
                            callee_proc.name()
                        );
                        return;
                    }
                    let ret = callee_proc.terminator(callee_proc.back());
                    let mut nested = TraceData::new(callee, ret);
                    self.trace_main(&mut nested, TraceTag::Regular);
                    nested.correct_trace(self.block_frequency(data.func, call_block));
                    data.merge_trace(call_block, nested);
                }
                Callee::Indirect(ptr) => {
                    let mut nested = TraceData::new(data.func, ptr);
                    self.trace_main(&mut nested, TraceTag::Regular);
                    data.merge_trace(call_block, nested);
                }
            },
            TraceTag::Arg(pos) => {
                // The traced cell was passed by address; find stores through
                // the matching parameter inside the callee.
                let callee = match proc.inst(call).callee() {
                    Callee::Direct(callee) => callee,
                    Callee::Indirect(_) => {
                        panic!("cannot trace an argument through an indirect call")
                    }
                };
                let callee_proc = self.module.procedure(callee);
                if callee_proc.is_declaration() {
                    log::debug!(
                        "  cannot trace argument {} through external callee {}",
                        pos,
                        callee_proc.name()
                    );
                    return;
                }
                let Some(param) = callee_proc.param(pos) else {
                    return; // The callee never touches this parameter.
                };
                let ret = callee_proc.terminator(callee_proc.back());
                let param_users: Vec<InstId> = callee_proc.inst(param).users().to_vec();
                for user in param_users {
                    if callee_proc.inst(user).opcode() != Opcode::Store {
                        continue;
                    }
                    // The common shape spills the parameter into a local
                    // slot; chase the slot forward to the writes it
                    // receives. A store straight through the parameter is
                    // already the write.
                    let tag = if callee_proc.inst(user).store_value() == param {
                        TraceTag::Reverse
                    } else {
                        TraceTag::Regular
                    };
                    let mut nested = TraceData::with_first(callee, ret, user);
                    self.trace_main(&mut nested, tag);
                    data.merge_trace(call_block, nested);
                }
            }
        }
    }

    fn trace_gep(&self, data: &mut TraceData, gep: InstId, tag: TraceTag) {
        let proc = self.module.procedure(data.func);
        let (aggregate, indices) = match proc.inst(gep).data() {
            InstData::Gep { aggregate, indices } => (*aggregate, indices.clone()),
            _ => unreachable!(),
        };
        match tag {
            TraceTag::Regular => match aggregate {
                AggregateKind::Struct => {
                    // Other accesses to the same field are aliases of this
                    // cell; follow the ones that can precede the use.
                    let base = proc.inst(gep).gep_base();
                    let base_users: Vec<InstId> = proc.inst(base).users().to_vec();
                    for user in base_users {
                        if user == gep {
                            continue;
                        }
                        let same_field = match proc.inst(user).data() {
                            InstData::Gep {
                                indices: other_indices,
                                ..
                            } => *other_indices == indices,
                            _ => false,
                        };
                        if !same_field {
                            continue;
                        }
                        let same_block = proc.owner(user) == proc.owner(gep);
                        let visible = if same_block {
                            proc.comes_before(user, gep)
                        } else {
                            data.is_ancestor(proc.owner(user))
                        };
                        if visible {
                            data.push_instr(user, TraceTag::Reverse);
                        }
                    }
                }
                AggregateKind::Array => {
                    // Array elements are not tracked; a store through an
                    // array slot is invisible to the trace.
                    log::debug!("  array-indexed pointer store is not tracked (i{})", gep.0);
                }
                AggregateKind::Pointer => {
                    log::debug!("  raw pointer arithmetic is not tracked (i{})", gep.0);
                }
            },
            TraceTag::Reverse => {
                let gep_users: Vec<InstId> = proc.inst(gep).users().to_vec();
                for user in gep_users {
                    if proc.inst(user).opcode() == Opcode::Store
                        && proc.inst(user).store_ptr() == gep
                    {
                        data.push_instr(user, TraceTag::Regular);
                    }
                }
            }
            TraceTag::Arg(_) => unreachable!("geps take no argument tag"),
        }
    }

    fn trace_phi(&self, data: &mut TraceData, phi: InstId) {
        let proc = self.module.procedure(data.func);
        let phi_block = proc.owner(phi);
        let incoming: Vec<(InstId, BlockId)> = proc.inst(phi).phi_incoming().collect();
        for (value, pred) in incoming {
            match proc.inst(value).data() {
                InstData::Func(func) => {
                    let func = *func;
                    data.add_cfreq(
                        phi_block,
                        Some(func),
                        self.edge_frequency(data.func, pred, phi_block),
                    );
                }
                _ if proc.inst(value).opcode().is_constant() => {
                    data.add_cfreq(
                        phi_block,
                        None,
                        self.edge_frequency(data.func, pred, phi_block),
                    );
                }
                _ => {
                    let mut nested = TraceData::new(data.func, value);
                    self.trace_main(&mut nested, TraceTag::Regular);
                    data.merge_trace(phi_block, nested);
                }
            }
        }
    }

    fn trace_select(&self, data: &mut TraceData, select: InstId) {
        let proc = self.module.procedure(data.func);
        let block = proc.owner(select);
        let half = self.block_frequency(data.func, block) / 2.0;
        let children = proc.inst(select).children();
        for value in [children[1], children[2]] {
            let target = match proc.inst(value).data() {
                InstData::Func(func) => Some(*func),
                _ => None,
            };
            data.add_cfreq(block, target, half);
        }
    }

    fn trace_return(&self, data: &mut TraceData, ret: InstId) {
        let proc = self.module.procedure(data.func);
        let block = proc.owner(ret);
        let Some(value) = proc.inst(ret).return_value() else {
            return;
        };
        match proc.inst(value).data() {
            InstData::Func(func) => {
                let func = *func;
                data.add_cfreq(block, Some(func), self.block_frequency(data.func, block));
            }
            _ if proc.inst(value).opcode().is_constant() => {
                data.add_cfreq(block, None, self.block_frequency(data.func, block));
            }
            _ => data.push_instr(value, TraceTag::Regular),
        }
    }

    /// Fraction of `block`'s executions whose effect survives to the
    /// reference block: a DFS towards it that skips successors outside the
    /// reference's ancestry and successors whose own write events shadow
    /// this block's.
    fn correct_freq(&self, data: &mut TraceData, block: BlockId) -> f64 {
        if let Some(&memoized) = data.bfreqs.get(&block) {
            return memoized;
        }
        let proc = self.module.procedure(data.func);
        assert!(
            data.is_ancestor(block),
            "correcting frequency of a block that cannot reach the use"
        );

        let ref_block = proc.owner(data.ref_inst);
        if block == ref_block {
            data.bfreqs.insert(block, 1.0);
            return 1.0;
        }
        data.bfreqs.insert(block, 0.0);

        let succs: Vec<BlockId> = proc.successors(block).to_vec();
        let block_freq = self.block_frequency(data.func, block);
        let mut total = 0.0;
        for succ in succs {
            if !data.is_ancestor(succ) || data.has_trace(succ) {
                continue;
            }
            if block_freq > 0.0 {
                let ratio = self.edge_frequency(data.func, block, succ) / block_freq;
                total += ratio * self.correct_freq(data, succ);
            }
        }
        data.bfreqs.insert(block, total);
        total
    }
}

/// Position of `operand` in the call's argument list, if it is passed.
fn argument_position(proc: &Procedure, call: InstId, operand: InstId) -> Option<usize> {
    let inst = proc.inst(call);
    let num_args = match inst.callee() {
        Callee::Direct(_) => inst.children().len(),
        // The callee pointer rides along as the last child.
        Callee::Indirect(_) => inst.children().len() - 1,
    };
    inst.children()[..num_args]
        .iter()
        .position(|&arg| arg == operand)
}
