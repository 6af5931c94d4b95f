#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeKind {
    Void,
    Int32,
    Int64,
    Ptr,
    Double,
}

impl Default for TypeKind {
    fn default() -> Self {
        Self::Void
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Type {
    kind: TypeKind,
}

#[allow(non_upper_case_globals)]
impl Type {
    pub const Void: Self = Self::new(TypeKind::Void);
    pub const Int32: Self = Self::new(TypeKind::Int32);
    pub const Int64: Self = Self::new(TypeKind::Int64);
    pub const Ptr: Self = Self::new(TypeKind::Ptr);
    pub const Double: Self = Self::new(TypeKind::Double);

    pub const fn new(kind: TypeKind) -> Self {
        Self { kind }
    }

    pub const fn kind(&self) -> TypeKind {
        self.kind
    }

    pub const fn is_int(&self) -> bool {
        matches!(self.kind, TypeKind::Int32 | TypeKind::Int64)
    }

    pub const fn is_ptr(&self) -> bool {
        matches!(self.kind, TypeKind::Ptr)
    }

    pub const fn is_numeric(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::Int32 | TypeKind::Int64 | TypeKind::Double
        )
    }
}

impl From<TypeKind> for Type {
    fn from(kind: TypeKind) -> Self {
        Self::new(kind)
    }
}
