use std::{borrow::Cow, fmt::Debug, hash::Hash, marker::PhantomData};

use bitvec::vec::BitVec;

use crate::{block::BlockId, procedure::Procedure};

/// Directed graph with dense, index-shaped nodes. The CFG analyses are
/// written against this so they work for any graph whose nodes number
/// densely from zero.
pub trait Graph {
    type Node: Copy
        + Clone
        + PartialEq
        + Eq
        + PartialOrd
        + Ord
        + Hash
        + Debug
        + From<usize>
        + Into<usize>;

    fn num_nodes(&self) -> usize;
    fn root(&self) -> Self::Node;
    fn successors(&self, node: Self::Node) -> Cow<[Self::Node]>;
    fn predecessors(&self, node: Self::Node) -> Cow<[Self::Node]>;
}

/// Dense set of graph nodes backed by a bit vector.
pub struct NodeSet<N> {
    bits: BitVec,
    marker: PhantomData<N>,
}

impl<N: Copy + Into<usize>> NodeSet<N> {
    pub fn new() -> Self {
        Self {
            bits: BitVec::new(),
            marker: PhantomData,
        }
    }

    pub fn insert(&mut self, node: N) -> bool {
        let index: usize = node.into();
        if index >= self.bits.len() {
            self.bits.resize(index + 1, false);
        }
        !self.bits.replace(index, true)
    }

    pub fn remove(&mut self, node: N) -> bool {
        let index: usize = node.into();
        index < self.bits.len() && self.bits.replace(index, false)
    }

    pub fn contains(&self, node: N) -> bool {
        let index: usize = node.into();
        index < self.bits.len() && self.bits[index]
    }

    pub fn clear(&mut self) {
        self.bits.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.bits.not_any()
    }
}

impl<N: Copy + Into<usize>> Default for NodeSet<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Depth-first worklist that visits each node once.
pub struct GraphNodeWorklist<N> {
    seen: NodeSet<N>,
    stack: Vec<N>,
}

impl<N: Copy + Into<usize>> GraphNodeWorklist<N> {
    pub fn new() -> Self {
        Self {
            seen: NodeSet::new(),
            stack: Vec::new(),
        }
    }

    pub fn push(&mut self, node: N) -> bool {
        if self.seen.insert(node) {
            self.stack.push(node);
            true
        } else {
            false
        }
    }

    pub fn push_all<I: Iterator<Item = N>>(&mut self, iter: I) {
        for node in iter {
            self.push(node);
        }
    }

    pub fn saw(&self, node: N) -> bool {
        self.seen.contains(node)
    }

    pub fn pop(&mut self) -> Option<N> {
        self.stack.pop()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GraphVisitOrder {
    Pre,
    Post,
}

/// Worklist yielding both pre- and post-order events of a DFS.
pub struct PostOrderGraphNodeWorklist<N> {
    seen: NodeSet<N>,
    stack: Vec<(N, GraphVisitOrder)>,
}

impl<N: Copy + Into<usize>> PostOrderGraphNodeWorklist<N> {
    pub fn new() -> Self {
        Self {
            seen: NodeSet::new(),
            stack: Vec::new(),
        }
    }

    pub fn push_pre(&mut self, node: N) -> bool {
        if self.seen.insert(node) {
            self.stack.push((node, GraphVisitOrder::Pre));
            true
        } else {
            false
        }
    }

    pub fn push_post(&mut self, node: N) {
        self.stack.push((node, GraphVisitOrder::Post));
    }

    pub fn pop(&mut self) -> Option<(N, GraphVisitOrder)> {
        self.stack.pop()
    }
}

/// Post-order of the nodes reachable from the root, successors walked in
/// source order.
pub fn post_order<G: Graph>(graph: &G) -> Vec<G::Node> {
    let mut result = Vec::with_capacity(graph.num_nodes());
    let mut worklist = PostOrderGraphNodeWorklist::new();
    worklist.push_pre(graph.root());
    while let Some((node, order)) = worklist.pop() {
        match order {
            GraphVisitOrder::Pre => {
                worklist.push_post(node);
                for succ in graph.successors(node).iter().copied() {
                    worklist.push_pre(succ);
                }
            }
            GraphVisitOrder::Post => result.push(node),
        }
    }
    result
}

const UNNUMBERED: usize = usize::MAX;

fn ix<N: Into<usize>>(node: N) -> usize {
    node.into()
}

/// Dominator tree. Immediate dominators come from the iterative dataflow
/// over reverse postorder (Cooper, Harvey & Kennedy, "A Simple, Fast
/// Dominance Algorithm"); dominance queries then use the pre/post numbering
/// range-inclusion trick so `dominates` is O(1).
pub struct Dominators<G: Graph> {
    idom: Vec<Option<G::Node>>,
    kids: Vec<Vec<G::Node>>,
    pre: Vec<usize>,
    post: Vec<usize>,
    marker: PhantomData<fn() -> G::Node>,
}

impl<G: Graph> Clone for Dominators<G> {
    fn clone(&self) -> Self {
        Self {
            idom: self.idom.clone(),
            kids: self.kids.clone(),
            pre: self.pre.clone(),
            post: self.post.clone(),
            marker: PhantomData,
        }
    }
}

impl<G: Graph> Dominators<G> {
    pub fn new(graph: &G) -> Self {
        let n = graph.num_nodes();
        let po = post_order(graph);

        let mut po_number = vec![UNNUMBERED; n];
        for (i, &node) in po.iter().enumerate() {
            po_number[ix(node)] = i;
        }

        let root = graph.root();
        let mut idom: Vec<Option<G::Node>> = vec![None; n];
        idom[ix(root)] = Some(root);

        let intersect = |idom: &[Option<G::Node>], mut a: G::Node, mut b: G::Node| {
            while a != b {
                while po_number[ix(a)] < po_number[ix(b)] {
                    a = idom[ix(a)].unwrap();
                }
                while po_number[ix(b)] < po_number[ix(a)] {
                    b = idom[ix(b)].unwrap();
                }
            }
            a
        };

        let mut changed = true;
        while changed {
            changed = false;
            for &node in po.iter().rev() {
                if node == root {
                    continue;
                }
                let mut new_idom: Option<G::Node> = None;
                for pred in graph.predecessors(node).iter().copied() {
                    if po_number[ix(pred)] == UNNUMBERED || idom[ix(pred)].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(current) => intersect(&idom, current, pred),
                    });
                }
                if new_idom.is_some() && idom[ix(node)] != new_idom {
                    idom[ix(node)] = new_idom;
                    changed = true;
                }
            }
        }

        idom[ix(root)] = None;

        let mut kids: Vec<Vec<G::Node>> = vec![Vec::new(); n];
        for &node in po.iter().rev() {
            if let Some(parent) = idom[ix(node)] {
                kids[ix(parent)].push(node);
            }
        }

        // Pre/post numbers of the dominator tree itself, for the range
        // inclusion dominance check.
        let mut pre = vec![UNNUMBERED; n];
        let mut post = vec![UNNUMBERED; n];
        let mut next_pre = 0;
        let mut next_post = 0;
        let mut worklist = vec![(root, GraphVisitOrder::Pre)];
        while let Some((node, order)) = worklist.pop() {
            match order {
                GraphVisitOrder::Pre => {
                    pre[ix(node)] = next_pre;
                    next_pre += 1;
                    worklist.push((node, GraphVisitOrder::Post));
                    for &kid in kids[ix(node)].iter() {
                        worklist.push((kid, GraphVisitOrder::Pre));
                    }
                }
                GraphVisitOrder::Post => {
                    post[ix(node)] = next_post;
                    next_post += 1;
                }
            }
        }

        Self {
            idom,
            kids,
            pre,
            post,
            marker: PhantomData,
        }
    }

    pub fn is_reachable(&self, node: G::Node) -> bool {
        self.pre[ix(node)] != UNNUMBERED
    }

    /// Immediate dominator; `None` for the root and for unreachable nodes.
    pub fn idom(&self, node: G::Node) -> Option<G::Node> {
        self.idom[ix(node)]
    }

    pub fn strictly_dominates(&self, from: G::Node, to: G::Node) -> bool {
        self.is_reachable(from)
            && self.is_reachable(to)
            && self.pre[ix(to)] > self.pre[ix(from)]
            && self.post[ix(to)] < self.post[ix(from)]
    }

    pub fn dominates(&self, from: G::Node, to: G::Node) -> bool {
        from == to || self.strictly_dominates(from, to)
    }

    pub fn for_all_strict_dominators_of<F: FnMut(G::Node)>(&self, to: G::Node, mut f: F) {
        let mut node = self.idom[ix(to)];
        while let Some(dom) = node {
            f(dom);
            node = self.idom[ix(dom)];
        }
    }

    pub fn for_all_blocks_dominated_by<F: FnMut(G::Node)>(&self, from: G::Node, mut f: F) {
        let mut worklist = vec![from];
        while let Some(node) = worklist.pop() {
            f(node);
            worklist.extend(self.kids[ix(node)].iter().copied());
        }
    }
}

/// The CFG turned around, with a synthetic root fanning into the exits.
/// Infinite loops have no exit block, so any block that can't reach an exit
/// gets promoted to a root successor as well, highest index first.
struct ReversedCfg {
    succs: Vec<Vec<BlockId>>,
    preds: Vec<Vec<BlockId>>,
    root: BlockId,
}

impl ReversedCfg {
    fn new(proc: &Procedure) -> Self {
        let n = proc.num_nodes();
        let root = BlockId(n);
        let mut succs: Vec<Vec<BlockId>> = vec![Vec::new(); n + 1];
        let mut preds: Vec<Vec<BlockId>> = vec![Vec::new(); n + 1];

        for block in proc.blocks() {
            for succ in proc.successors(block).iter().copied() {
                succs[succ.0].push(block);
                preds[block.0].push(succ);
            }
        }

        let mut covered = GraphNodeWorklist::new();
        let mut add_exit = |exits: &mut Vec<BlockId>, covered: &mut GraphNodeWorklist<BlockId>, block: BlockId| {
            if covered.push(block) {
                exits.push(block);
                while let Some(node) = covered.pop() {
                    for pred in proc.predecessors(node).iter().copied() {
                        covered.push(pred);
                    }
                }
            }
        };

        let mut exits = Vec::new();
        for block in proc.blocks() {
            if proc.successors(block).is_empty() {
                add_exit(&mut exits, &mut covered, block);
            }
        }
        for index in (0..n).rev() {
            add_exit(&mut exits, &mut covered, BlockId(index));
        }

        for &exit in exits.iter() {
            preds[exit.0].push(root);
        }
        succs[n] = exits;

        Self { succs, preds, root }
    }
}

impl Graph for ReversedCfg {
    type Node = BlockId;

    fn num_nodes(&self) -> usize {
        self.succs.len()
    }

    fn root(&self) -> BlockId {
        self.root
    }

    fn successors(&self, node: BlockId) -> Cow<[BlockId]> {
        Cow::Borrowed(&self.succs[node.0])
    }

    fn predecessors(&self, node: BlockId) -> Cow<[BlockId]> {
        Cow::Borrowed(&self.preds[node.0])
    }
}

/// Post-dominator tree: the dominator tree of the reversed CFG.
pub struct PostDominators {
    inner: Dominators<ReversedCfg>,
    virtual_root: BlockId,
}

impl PostDominators {
    pub fn new(proc: &Procedure) -> Self {
        let reversed = ReversedCfg::new(proc);
        let virtual_root = reversed.root;
        Self {
            inner: Dominators::new(&reversed),
            virtual_root,
        }
    }

    /// Whether every path from `to` out of the function passes through
    /// `from`.
    pub fn dominates(&self, from: BlockId, to: BlockId) -> bool {
        self.inner.dominates(from, to)
    }

    pub fn strictly_dominates(&self, from: BlockId, to: BlockId) -> bool {
        self.inner.strictly_dominates(from, to)
    }

    pub fn ipostdom(&self, block: BlockId) -> Option<BlockId> {
        match self.inner.idom(block) {
            Some(parent) if parent != self.virtual_root => Some(parent),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BasicBlockBuilder;
    use crate::module::Module;

    fn diamond() -> (Module, crate::module::FuncId, [BlockId; 4]) {
        let mut module = Module::new();
        let func = module.add_procedure("f");
        let proc = module.procedure_mut(func);
        let b0 = proc.add_block();
        let b1 = proc.add_block();
        let b2 = proc.add_block();
        let b3 = proc.add_block();
        let mut builder = BasicBlockBuilder::new(proc, b0);
        let lhs = builder.param(0, crate::typ::Type::Int64);
        let rhs = builder.param(1, crate::typ::Type::Int64);
        let cond = builder.icmp(crate::inst::CmpKind::Slt, lhs, rhs);
        builder.branch(cond, b1, b2);
        BasicBlockBuilder::new(proc, b1).jump(b3);
        BasicBlockBuilder::new(proc, b2).jump(b3);
        BasicBlockBuilder::new(proc, b3).ret(None);
        (module, func, [b0, b1, b2, b3])
    }

    #[test]
    fn diamond_dominators() {
        let (module, func, [b0, b1, b2, b3]) = diamond();
        let proc = module.procedure(func);
        let dominators = Dominators::new(proc);

        assert_eq!(dominators.idom(b0), None);
        assert_eq!(dominators.idom(b1), Some(b0));
        assert_eq!(dominators.idom(b2), Some(b0));
        assert_eq!(dominators.idom(b3), Some(b0));
        assert!(dominators.dominates(b0, b3));
        assert!(!dominators.dominates(b1, b3));
        assert!(dominators.strictly_dominates(b0, b1));
        assert!(!dominators.strictly_dominates(b1, b1));
    }

    #[test]
    fn diamond_post_dominators() {
        let (module, func, [b0, b1, b2, b3]) = diamond();
        let proc = module.procedure(func);
        let post = PostDominators::new(proc);

        assert!(post.dominates(b3, b0));
        assert!(post.dominates(b3, b1));
        assert!(!post.dominates(b1, b0));
        assert_eq!(post.ipostdom(b0), Some(b3));
        assert_eq!(post.ipostdom(b3), None);
    }

    #[test]
    fn node_set_basics() {
        let mut set: NodeSet<BlockId> = NodeSet::new();
        assert!(set.insert(BlockId(3)));
        assert!(!set.insert(BlockId(3)));
        assert!(set.contains(BlockId(3)));
        assert!(!set.contains(BlockId(0)));
        assert!(set.remove(BlockId(3)));
        assert!(!set.remove(BlockId(3)));
        assert!(set.is_empty());
    }
}
