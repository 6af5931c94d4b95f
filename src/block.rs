use std::ops::{Deref, DerefMut};

use tinyvec::TinyVec;

use crate::{
    inst::{AggregateKind, Callee, CmpKind, Inst, InstData, InstId},
    module::FuncId,
    opcode::Opcode,
    procedure::Procedure,
    typ::Type,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub usize);

impl Default for BlockId {
    fn default() -> Self {
        Self(usize::MAX)
    }
}

impl From<usize> for BlockId {
    fn from(index: usize) -> Self {
        Self(index)
    }
}

impl From<BlockId> for usize {
    fn from(id: BlockId) -> usize {
        id.0
    }
}

pub struct BasicBlock {
    pub(crate) index: usize,
    pub(crate) insts: Vec<InstId>,
    pub(crate) predecessor_list: Vec<BlockId>,
    /// Successors in source order. Iteration order is observable: it decides
    /// tie-breaks in the frequency propagation.
    pub(crate) successor_list: Vec<BlockId>,
}

impl BasicBlock {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            insts: Vec::new(),
            predecessor_list: Vec::new(),
            successor_list: Vec::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn append(&mut self, inst: InstId) {
        self.insts.push(inst);
    }

    pub fn predecessor_list(&self) -> &[BlockId] {
        &self.predecessor_list
    }

    pub fn successor_list(&self) -> &[BlockId] {
        &self.successor_list
    }

    pub fn add_predecessor(&mut self, predecessor: BlockId) -> bool {
        if self.predecessor_list.contains(&predecessor) {
            false
        } else {
            self.predecessor_list.push(predecessor);
            true
        }
    }

    /// The terminator is always the last instruction of a sealed block.
    pub fn terminator(&self) -> Option<InstId> {
        self.insts.last().copied()
    }
}

impl Deref for BasicBlock {
    type Target = Vec<InstId>;

    fn deref(&self) -> &Self::Target {
        &self.insts
    }
}

impl DerefMut for BasicBlock {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.insts
    }
}

/// Appends instructions to one block of a procedure, keeping successor and
/// predecessor lists consistent when terminators are added.
pub struct BasicBlockBuilder<'a> {
    pub proc: &'a mut Procedure,
    pub block: BlockId,
}

impl<'a> BasicBlockBuilder<'a> {
    pub fn new(proc: &'a mut Procedure, block: BlockId) -> Self {
        Self { proc, block }
    }

    fn append(&mut self, inst: Inst) -> InstId {
        let id = self.proc.add(inst);
        self.proc.add_to_block(self.block, id);
        id
    }

    pub fn int_const(&mut self, typ: Type, value: i64) -> InstId {
        self.append(Inst::new(
            Opcode::IntConst,
            typ,
            InstData::IntConst(value),
            &[],
        ))
    }

    pub fn null_ptr(&mut self) -> InstId {
        self.append(Inst::new(Opcode::NullPtr, Type::Ptr, InstData::None, &[]))
    }

    pub fn func_addr(&mut self, func: FuncId) -> InstId {
        self.append(Inst::new(
            Opcode::FuncAddr,
            Type::Ptr,
            InstData::Func(func),
            &[],
        ))
    }

    pub fn param(&mut self, index: usize, typ: Type) -> InstId {
        self.append(Inst::new(
            Opcode::Param,
            typ,
            InstData::Param(index),
            &[],
        ))
    }

    pub fn alloca(&mut self) -> InstId {
        self.append(Inst::new(Opcode::Alloca, Type::Ptr, InstData::None, &[]))
    }

    pub fn load(&mut self, typ: Type, ptr: InstId) -> InstId {
        self.append(Inst::new(Opcode::Load, typ, InstData::None, &[ptr]))
    }

    pub fn store(&mut self, value: InstId, ptr: InstId) -> InstId {
        self.append(Inst::new(
            Opcode::Store,
            Type::Void,
            InstData::None,
            &[value, ptr],
        ))
    }

    pub fn gep(&mut self, aggregate: AggregateKind, base: InstId, indices: &[u32]) -> InstId {
        self.append(Inst::new(
            Opcode::Gep,
            Type::Ptr,
            InstData::Gep {
                aggregate,
                indices: indices.iter().copied().collect(),
            },
            &[base],
        ))
    }

    pub fn icmp(&mut self, kind: CmpKind, lhs: InstId, rhs: InstId) -> InstId {
        self.append(Inst::new(
            Opcode::Icmp,
            Type::Int32,
            InstData::Cmp(kind),
            &[lhs, rhs],
        ))
    }

    pub fn add(&mut self, typ: Type, lhs: InstId, rhs: InstId) -> InstId {
        self.append(Inst::new(Opcode::Add, typ, InstData::None, &[lhs, rhs]))
    }

    pub fn sub(&mut self, typ: Type, lhs: InstId, rhs: InstId) -> InstId {
        self.append(Inst::new(Opcode::Sub, typ, InstData::None, &[lhs, rhs]))
    }

    pub fn mul(&mut self, typ: Type, lhs: InstId, rhs: InstId) -> InstId {
        self.append(Inst::new(Opcode::Mul, typ, InstData::None, &[lhs, rhs]))
    }

    pub fn select(&mut self, cond: InstId, if_true: InstId, if_false: InstId) -> InstId {
        self.append(Inst::new(
            Opcode::Select,
            Type::Ptr,
            InstData::None,
            &[cond, if_true, if_false],
        ))
    }

    pub fn phi(&mut self, typ: Type, incoming: &[(InstId, BlockId)]) -> InstId {
        let values: Vec<InstId> = incoming.iter().map(|(value, _)| *value).collect();
        let blocks: TinyVec<[BlockId; 2]> = incoming.iter().map(|(_, block)| *block).collect();
        self.append(Inst::new(
            Opcode::Phi,
            typ,
            InstData::Phi { blocks },
            &values,
        ))
    }

    pub fn call(&mut self, typ: Type, callee: Callee, args: &[InstId]) -> InstId {
        let mut children: Vec<InstId> = args.to_vec();
        // An indirect callee is an operand too; keep it last so argument
        // positions stay stable.
        if let Callee::Indirect(ptr) = callee {
            children.push(ptr);
        }
        self.append(Inst::new(
            Opcode::Call,
            typ,
            InstData::Call(callee),
            &children,
        ))
    }

    pub fn jump(&mut self, to: BlockId) {
        self.append(Inst::new(Opcode::Jump, Type::Void, InstData::None, &[]));
        let block = self.block;
        self.proc.block_mut(block).successor_list = vec![to];
        self.proc.block_mut(to).add_predecessor(block);
    }

    pub fn branch(&mut self, cond: InstId, taken: BlockId, not_taken: BlockId) {
        self.append(Inst::new(Opcode::Branch, Type::Void, InstData::None, &[cond]));
        let block = self.block;
        self.proc.block_mut(block).successor_list = vec![taken, not_taken];
        self.proc.block_mut(taken).add_predecessor(block);
        self.proc.block_mut(not_taken).add_predecessor(block);
    }

    pub fn switch(&mut self, cond: InstId, targets: &[BlockId]) {
        self.append(Inst::new(Opcode::Switch, Type::Void, InstData::None, &[cond]));
        let block = self.block;
        self.proc.block_mut(block).successor_list = targets.to_vec();
        for &target in targets {
            self.proc.block_mut(target).add_predecessor(block);
        }
    }

    pub fn ret(&mut self, value: Option<InstId>) {
        let children: Vec<InstId> = value.into_iter().collect();
        self.append(Inst::new(
            Opcode::Return,
            Type::Void,
            InstData::None,
            &children,
        ));
    }
}
