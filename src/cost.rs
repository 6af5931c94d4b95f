use serde::Serialize;

use crate::{
    call_frequency::CallFrequencies,
    inst::Inst,
    module::Module,
    opcode::Opcode,
};

/// Which notion of per-instruction cost the estimate is weighted by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CostKind {
    Latency,
    RecipThroughput,
    CodeSize,
    SizeAndLatency,
    /// Every instruction costs one; the estimate counts executed
    /// instructions.
    One,
    /// Reserved for measured costs; reports zero.
    Dynamic,
}

impl CostKind {
    pub fn name(self) -> &'static str {
        match self {
            CostKind::Latency => "Latency",
            CostKind::RecipThroughput => "Recipthroughput",
            CostKind::CodeSize => "Codesize",
            CostKind::SizeAndLatency => "Sizeandlatency",
            CostKind::One => "One",
            CostKind::Dynamic => "Dynamic",
        }
    }

    /// Parse the spelling used by the `prediction-cost-kind` option.
    pub fn from_name(name: &str) -> Option<CostKind> {
        match name {
            "latency" => Some(CostKind::Latency),
            "recipthroughput" => Some(CostKind::RecipThroughput),
            "codesize" => Some(CostKind::CodeSize),
            "sizeandlatency" => Some(CostKind::SizeAndLatency),
            "one" => Some(CostKind::One),
            "dynamic" => Some(CostKind::Dynamic),
            _ => None,
        }
    }
}

fn latency(inst: &Inst) -> f64 {
    match inst.opcode() {
        Opcode::IntConst | Opcode::NullPtr | Opcode::FuncAddr | Opcode::Param => 1.0,
        Opcode::Alloca | Opcode::Gep | Opcode::Phi => 1.0,
        Opcode::Add | Opcode::Sub | Opcode::Icmp | Opcode::Select => 1.0,
        Opcode::Mul => 3.0,
        Opcode::Load => 4.0,
        Opcode::Store => 1.0,
        Opcode::Call => 10.0,
        Opcode::Jump | Opcode::Branch | Opcode::Switch | Opcode::Return => 1.0,
    }
}

fn code_size(inst: &Inst) -> f64 {
    match inst.opcode() {
        // Phis resolve to moves on edges; they take no space of their own.
        Opcode::Phi => 0.0,
        Opcode::Call | Opcode::Switch => 2.0,
        _ => 1.0,
    }
}

/// The stand-in for a target's cost table.
pub fn instruction_cost(inst: &Inst, kind: CostKind) -> f64 {
    match kind {
        CostKind::Latency => latency(inst),
        CostKind::RecipThroughput => latency(inst) / 4.0,
        CostKind::CodeSize => code_size(inst),
        CostKind::SizeAndLatency => latency(inst) + code_size(inst),
        CostKind::One => 1.0,
        CostKind::Dynamic => 0.0,
    }
}

#[derive(Debug, Serialize)]
pub struct FunctionCost {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Cost")]
    pub cost: f64,
}

#[derive(Debug, Serialize)]
struct FunctionEntry {
    #[serde(rename = "Function")]
    function: FunctionCost,
}

#[derive(Debug, Serialize)]
pub struct CostOption {
    #[serde(rename = "Name")]
    pub name: &'static str,
    #[serde(rename = "Functions")]
    functions: Vec<FunctionEntry>,
    #[serde(rename = "Total cost")]
    pub total: f64,
}

#[derive(Debug, Serialize)]
struct OptionEntry {
    #[serde(rename = "Option")]
    option: CostOption,
}

/// Per-cost-kind program cost estimate, one entry per requested kind.
#[derive(Debug, Serialize)]
pub struct CostReport {
    #[serde(rename = "Cost_options")]
    options: Vec<OptionEntry>,
}

impl CostReport {
    pub fn to_yaml(&self) -> serde_yaml::Result<String> {
        serde_yaml::to_string(self)
    }

    pub fn option(&self, kind: CostKind) -> Option<&CostOption> {
        self.options
            .iter()
            .map(|entry| &entry.option)
            .find(|option| option.name == kind.name())
    }
}

impl CostOption {
    pub fn function_cost(&self, name: &str) -> Option<f64> {
        self.functions
            .iter()
            .find(|entry| entry.function.name == name)
            .map(|entry| entry.function.cost)
    }
}

/// Weight every instruction's cost by its block's global frequency and sum
/// per function.
pub fn estimate_cost(
    module: &Module,
    frequencies: &CallFrequencies,
    kinds: &[CostKind],
) -> CostReport {
    let mut options = Vec::with_capacity(kinds.len());
    for &kind in kinds {
        let mut functions = Vec::new();
        let mut total = 0.0;
        for func in module.func_ids() {
            let proc = module.procedure(func);
            if proc.is_declaration() {
                continue;
            }
            let mut cost = 0.0;
            for block in proc.blocks() {
                let freq = frequencies.global_block_frequency(func, block);
                for &inst in proc.block(block).iter() {
                    cost += instruction_cost(proc.inst(inst), kind) * freq;
                }
            }
            total += cost;
            functions.push(FunctionEntry {
                function: FunctionCost {
                    name: proc.name().to_string(),
                    cost,
                },
            });
        }
        options.push(OptionEntry {
            option: CostOption {
                name: kind.name(),
                functions,
                total,
            },
        });
    }
    CostReport { options }
}
