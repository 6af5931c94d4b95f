use std::borrow::Cow;
use std::rc::Rc;

use crate::{
    block::{BasicBlock, BlockId},
    dominators::{Dominators, Graph, PostDominators},
    inst::{Inst, InstId},
    module::FuncId,
    natural_loops::NaturalLoops,
    opcode::Opcode,
};

/// One function body: an arena of instructions laid out into basic blocks.
/// Block 0 is the entry. A procedure with no blocks is a declaration (an
/// external function the analyses treat as a terminal sink).
pub struct Procedure {
    pub(crate) name: String,
    pub(crate) index: usize,
    pub(crate) blocks: Vec<BasicBlock>,
    pub(crate) insts: Vec<Inst>,
    pub(crate) dominators: Option<Rc<Dominators<Self>>>,
    pub(crate) post_dominators: Option<Rc<PostDominators>>,
    pub(crate) natural_loops: Option<Rc<NaturalLoops<Self>>>,
    /// Calling this function terminates the program (`exit` and friends).
    pub(crate) no_return: bool,
    /// Intrinsics don't count as calls for the branch heuristics.
    pub(crate) intrinsic: bool,
}

impl Graph for Procedure {
    type Node = BlockId;

    fn num_nodes(&self) -> usize {
        self.blocks.len()
    }

    fn root(&self) -> Self::Node {
        BlockId(0)
    }

    fn successors(&self, block: Self::Node) -> Cow<[Self::Node]> {
        Cow::Borrowed(&self.blocks[block.0].successor_list)
    }

    fn predecessors(&self, block: Self::Node) -> Cow<[Self::Node]> {
        Cow::Borrowed(&self.blocks[block.0].predecessor_list)
    }
}

impl Procedure {
    pub(crate) fn new(name: impl Into<String>, index: usize) -> Self {
        Self {
            name: name.into(),
            index,
            blocks: Vec::new(),
            insts: Vec::new(),
            dominators: None,
            post_dominators: None,
            natural_loops: None,
            no_return: false,
            intrinsic: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> FuncId {
        FuncId(self.index)
    }

    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn is_no_return(&self) -> bool {
        self.no_return
    }

    pub fn is_intrinsic(&self) -> bool {
        self.intrinsic
    }

    pub fn entry(&self) -> BlockId {
        assert!(!self.blocks.is_empty(), "declaration has no entry block");
        BlockId(0)
    }

    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len());
        self.blocks.push(BasicBlock::new(id.0));
        id
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.0]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.0]
    }

    pub fn blocks(&self) -> impl Iterator<Item = BlockId> {
        (0..self.blocks.len()).map(BlockId)
    }

    pub fn add(&mut self, mut inst: Inst) -> InstId {
        let id = InstId(self.insts.len());
        inst.index = id.0;
        let children: Vec<InstId> = inst.children.iter().copied().collect();
        self.insts.push(inst);
        for child in children {
            self.insts[child.0].users.push(id);
        }
        id
    }

    pub fn add_to_block(&mut self, block: BlockId, inst: InstId) {
        self.insts[inst.0].owner = Some(block);
        self.blocks[block.0].append(inst);
    }

    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insts[id.0]
    }

    pub fn insts(&self) -> impl Iterator<Item = &Inst> {
        self.insts.iter()
    }

    /// Owner block of an instruction that has been inserted.
    pub fn owner(&self, inst: InstId) -> BlockId {
        self.insts[inst.0]
            .owner
            .expect("instruction not inserted into a block")
    }

    pub fn terminator(&self, block: BlockId) -> InstId {
        let term = self.blocks[block.0]
            .terminator()
            .expect("block without terminator");
        assert!(
            self.insts[term.0].opcode.is_terminator(),
            "block {:?} does not end in a terminator",
            block
        );
        term
    }

    /// The parameter instruction at the given position, if the body
    /// materializes it.
    pub fn param(&self, position: usize) -> Option<InstId> {
        self.insts.iter().find_map(|inst| match inst.data {
            crate::inst::InstData::Param(index) if index == position => Some(inst.id()),
            _ => None,
        })
    }

    /// Whether `a` appears before `b` in the same block.
    pub fn comes_before(&self, a: InstId, b: InstId) -> bool {
        let block = self.owner(a);
        assert_eq!(block, self.owner(b), "instructions in different blocks");
        let insts = &self.blocks[block.0].insts;
        let pos = |id: InstId| {
            insts
                .iter()
                .position(|&inst| inst == id)
                .expect("instruction not in its owner block")
        };
        pos(a) < pos(b)
    }

    pub fn dominators(&self) -> &Dominators<Self> {
        self.dominators.as_deref().expect("dominators not computed")
    }

    pub fn dominators_or_compute(&mut self) -> &Dominators<Self> {
        if self.dominators.is_none() {
            self.dominators = Some(Rc::new(Dominators::new(self)));
        }
        self.dominators.as_deref().unwrap()
    }

    pub fn post_dominators(&self) -> &PostDominators {
        self.post_dominators
            .as_deref()
            .expect("post-dominators not computed")
    }

    pub fn post_dominators_or_compute(&mut self) -> &PostDominators {
        if self.post_dominators.is_none() {
            self.post_dominators = Some(Rc::new(PostDominators::new(self)));
        }
        self.post_dominators.as_deref().unwrap()
    }

    pub fn natural_loops(&self) -> &NaturalLoops<Self> {
        self.natural_loops
            .as_deref()
            .expect("natural loops not computed")
    }

    pub fn natural_loops_or_compute(&mut self) -> &NaturalLoops<Self> {
        if self.natural_loops.is_none() {
            let dominators = self.dominators_or_compute().clone();
            self.natural_loops = Some(Rc::new(NaturalLoops::new(self, &dominators)));
        }
        self.natural_loops.as_deref().unwrap()
    }

    /// Computes every CFG analysis the estimator consumes.
    pub fn compute_cfg_analyses(&mut self) {
        if self.is_declaration() {
            return;
        }
        self.dominators_or_compute();
        self.post_dominators_or_compute();
        self.natural_loops_or_compute();
    }

    /// Returns the last block of the body, the one tracing a callee's return
    /// value starts from.
    pub fn back(&self) -> BlockId {
        assert!(!self.blocks.is_empty(), "declaration has no blocks");
        BlockId(self.blocks.len() - 1)
    }

    pub(crate) fn fmt_block<W: std::fmt::Write>(
        &self,
        f: &mut W,
        block: BlockId,
    ) -> std::fmt::Result {
        writeln!(f, "BB{}:", block.0)?;
        for &inst in self.blocks[block.0].insts.iter() {
            writeln!(f, "    i{} = {:?}", inst.0, self.insts[inst.0].opcode)?;
        }
        if !self.blocks[block.0].successor_list.is_empty() {
            write!(f, "  Successors:")?;
            for succ in self.blocks[block.0].successor_list.iter() {
                write!(f, " BB{}", succ.0)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Procedure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "fn {}:", self.name)?;
        for block in self.blocks() {
            self.fmt_block(f, block)?;
        }
        Ok(())
    }
}

/// `Opcode::Return` terminates the block, `no_return` callees end the whole
/// program; both matter to the heuristics.
pub fn block_returns(proc: &Procedure, block: BlockId) -> bool {
    proc.block(block)
        .terminator()
        .map(|term| proc.inst(term).opcode() == Opcode::Return)
        .unwrap_or(false)
}
