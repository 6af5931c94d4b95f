use indexmap::IndexMap;

use crate::procedure::Procedure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub usize);

impl From<usize> for FuncId {
    fn from(index: usize) -> Self {
        Self(index)
    }
}

impl From<FuncId> for usize {
    fn from(id: FuncId) -> usize {
        id.0
    }
}

/// A whole program: procedures in definition order plus a name index. The
/// inter-procedural analyses iterate procedures in this order, which keeps
/// their output deterministic.
pub struct Module {
    procedures: Vec<Procedure>,
    by_name: IndexMap<String, FuncId>,
}

impl Module {
    pub fn new() -> Self {
        Self {
            procedures: Vec::new(),
            by_name: IndexMap::new(),
        }
    }

    pub fn add_procedure(&mut self, name: impl Into<String>) -> FuncId {
        let name = name.into();
        assert!(
            !self.by_name.contains_key(&name),
            "duplicate function name {:?}",
            name
        );
        let id = FuncId(self.procedures.len());
        self.procedures.push(Procedure::new(name.clone(), id.0));
        self.by_name.insert(name, id);
        id
    }

    /// Declares an external function: participates in the call graph as a
    /// terminal sink but has no body to analyze.
    pub fn declare_function(&mut self, name: impl Into<String>) -> FuncId {
        self.add_procedure(name)
    }

    pub fn set_no_return(&mut self, func: FuncId) {
        self.procedures[func.0].no_return = true;
    }

    pub fn set_intrinsic(&mut self, func: FuncId) {
        self.procedures[func.0].intrinsic = true;
    }

    pub fn procedure(&self, id: FuncId) -> &Procedure {
        &self.procedures[id.0]
    }

    pub fn procedure_mut(&mut self, id: FuncId) -> &mut Procedure {
        &mut self.procedures[id.0]
    }

    pub fn num_procedures(&self) -> usize {
        self.procedures.len()
    }

    pub fn procedures(&self) -> impl Iterator<Item = &Procedure> {
        self.procedures.iter()
    }

    pub fn func_ids(&self) -> impl Iterator<Item = FuncId> {
        (0..self.procedures.len()).map(FuncId)
    }

    pub fn function_named(&self, name: &str) -> Option<FuncId> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, func: FuncId) -> &str {
        self.procedures[func.0].name()
    }

    /// Computes dominators, post-dominators and loops for every defined
    /// procedure. The frequency analyses consume these read-only.
    pub fn compute_cfg_analyses(&mut self) {
        for proc in self.procedures.iter_mut() {
            proc.compute_cfg_analyses();
        }
    }
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}
