#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Integer constant. Constants are materialized as instructions so that
    /// operand lists are uniform and def-use chains cover them.
    IntConst,
    /// The null pointer constant.
    NullPtr,
    /// The address of a function, usable as a call operand or stored through
    /// memory.
    FuncAddr,
    /// Incoming parameter of the enclosing function, by position.
    Param,

    /// Stack slot of one cell. The unit the points-to tracer follows stores
    /// into and loads out of.
    Alloca,
    Load,
    Store,
    /// Address of a field or element of an aggregate. Carries the aggregate
    /// kind and a constant index path.
    Gep,

    /// Integer/pointer comparison, yields Int32 0 or 1. Carries a predicate.
    Icmp,
    Add,
    Sub,
    Mul,
    /// Picks one of two first-class operands by condition.
    Select,
    Phi,

    /// Function call, direct or through a pointer. Children are the
    /// arguments; the callee lives in the payload.
    Call,

    /// Unconditional jump to the block's single successor.
    Jump,
    /// Two-way branch: successor 0 is the taken (true) target, successor 1
    /// the not-taken (false) target.
    Branch,
    /// Multi-way branch; one successor per case in source order.
    Switch,
    Return,
}

impl Opcode {
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Opcode::Jump | Opcode::Branch | Opcode::Switch | Opcode::Return
        )
    }

    pub fn is_constant(self) -> bool {
        matches!(self, Opcode::IntConst | Opcode::NullPtr | Opcode::FuncAddr)
    }
}
