use tinyvec::TinyVec;

use crate::{block::BlockId, module::FuncId, opcode::Opcode, typ::Type};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct InstId(pub usize);

impl From<usize> for InstId {
    fn from(index: usize) -> Self {
        Self(index)
    }
}

impl From<InstId> for usize {
    fn from(id: InstId) -> usize {
        id.0
    }
}

/// Comparison predicate carried by `Icmp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpKind {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
}

/// What a call instruction targets. Direct callees are known statically;
/// indirect callees are whatever instruction computed the pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Callee {
    Direct(FuncId),
    Indirect(InstId),
}

/// Aggregate kind a `Gep` indexes into. The tracer only follows struct
/// fields; array and raw-pointer arithmetic are opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateKind {
    Struct,
    Array,
    Pointer,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstData {
    None,
    IntConst(i64),
    Func(FuncId),
    Param(usize),
    Cmp(CmpKind),
    Call(Callee),
    Gep {
        aggregate: AggregateKind,
        indices: TinyVec<[u32; 4]>,
    },
    /// Incoming blocks, parallel to the instruction's children.
    Phi {
        blocks: TinyVec<[BlockId; 2]>,
    },
}

impl Default for InstData {
    fn default() -> Self {
        Self::None
    }
}

#[derive(Debug, Clone)]
pub struct Inst {
    pub(crate) index: usize,
    pub(crate) opcode: Opcode,
    pub(crate) typ: Type,
    pub(crate) data: InstData,
    pub(crate) owner: Option<BlockId>,
    pub(crate) children: TinyVec<[InstId; 3]>,
    /// Instructions that use this one as an operand, in insertion order.
    pub(crate) users: Vec<InstId>,
}

impl Inst {
    pub fn new(opcode: Opcode, typ: Type, data: InstData, children: &[InstId]) -> Self {
        Self {
            index: usize::MAX,
            opcode,
            typ,
            data,
            owner: None,
            children: children.iter().copied().collect(),
            users: Vec::new(),
        }
    }

    pub fn id(&self) -> InstId {
        InstId(self.index)
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn typ(&self) -> Type {
        self.typ
    }

    pub fn data(&self) -> &InstData {
        &self.data
    }

    /// The block this instruction was appended to. `None` only before
    /// insertion.
    pub fn owner(&self) -> Option<BlockId> {
        self.owner
    }

    pub fn children(&self) -> &[InstId] {
        &self.children
    }

    pub fn users(&self) -> &[InstId] {
        &self.users
    }

    pub fn cmp_kind(&self) -> CmpKind {
        match self.data {
            InstData::Cmp(kind) => kind,
            _ => panic!("not a comparison: {:?}", self.opcode),
        }
    }

    pub fn callee(&self) -> Callee {
        match self.data {
            InstData::Call(callee) => callee,
            _ => panic!("not a call: {:?}", self.opcode),
        }
    }

    /// For a `FuncAddr` constant, the function it names.
    pub fn func_addr(&self) -> FuncId {
        match self.data {
            InstData::Func(func) => func,
            _ => panic!("not a function address: {:?}", self.opcode),
        }
    }

    pub fn store_value(&self) -> InstId {
        assert_eq!(self.opcode, Opcode::Store);
        self.children[0]
    }

    pub fn store_ptr(&self) -> InstId {
        assert_eq!(self.opcode, Opcode::Store);
        self.children[1]
    }

    pub fn load_ptr(&self) -> InstId {
        assert_eq!(self.opcode, Opcode::Load);
        self.children[0]
    }

    pub fn gep_base(&self) -> InstId {
        assert_eq!(self.opcode, Opcode::Gep);
        self.children[0]
    }

    /// Return operand, if the function returns a value.
    pub fn return_value(&self) -> Option<InstId> {
        assert_eq!(self.opcode, Opcode::Return);
        self.children.first().copied()
    }

    /// Incoming (value, predecessor) pairs of a phi.
    pub fn phi_incoming(&self) -> impl Iterator<Item = (InstId, BlockId)> + '_ {
        let blocks = match &self.data {
            InstData::Phi { blocks } => blocks.as_slice(),
            _ => panic!("not a phi: {:?}", self.opcode),
        };
        assert_eq!(blocks.len(), self.children.len());
        self.children.iter().copied().zip(blocks.iter().copied())
    }
}
