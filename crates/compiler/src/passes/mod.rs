//! Optimization passes over SSA modules.
//!
//! Every pass is a transform from module to module that must leave the
//! module well-formed. [`PassRunner`] assembles the pipeline for an
//! optimization level, runs it in order, and in debug mode dumps the IR
//! after every pass and validates it, aborting with the pass index on the
//! first violation.

pub mod addr_table;
pub mod branch_elim;
pub mod canonicalize;
pub mod control_flow_opt;
pub mod dead_code;
pub mod dead_func_elim;
pub mod heap_to_stack;
pub mod inlining;
pub mod licm;
pub mod loop_inversion;
pub mod peephole;
pub mod precompute;
pub mod sroa;
pub mod stack_to_reg;

use std::error::Error;
use std::fmt;
use std::fs;
use std::path::PathBuf;

use tracing::debug;

use crate::config::Config;
use crate::ssa::validator::Validator;
use crate::ssa::writer::write_module;
use crate::ssa::{BasicBlock, Function, Module, Operand, VirtualRegister};
use crate::target::Target;

pub trait Pass {
    fn name(&self) -> &'static str;
    fn run(&mut self, module: &mut Module, target: &Target);
}

/// Validation failed after a pass; the module is in an undefined state and
/// compilation aborts.
#[derive(Debug)]
pub struct PipelineError {
    pub pass_index: usize,
    pub pass_name: &'static str,
    pub report: String,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IR validation failed after pass {} ({}):\n{}",
            self.pass_index, self.pass_name, self.report
        )
    }
}

impl Error for PipelineError {}

pub struct PassRunner {
    config: Config,
    /// Directory for debug dumps; `logs` unless overridden.
    pub dump_dir: PathBuf,
}

impl PassRunner {
    pub fn new(config: Config) -> PassRunner {
        PassRunner {
            config,
            dump_dir: PathBuf::from("logs"),
        }
    }

    pub fn run(&self, module: &mut Module) -> Result<(), PipelineError> {
        let mut passes = create_opt_passes(self.config.opt_level);

        if self.config.generate_addr_table {
            passes.push(Box::new(addr_table::AddrTablePass::new()));
        }

        for (index, pass) in passes.iter_mut().enumerate() {
            self.run_pass(pass.as_mut(), index, module)?;
        }

        Ok(())
    }

    fn run_pass(
        &self,
        pass: &mut dyn Pass,
        index: usize,
        module: &mut Module,
    ) -> Result<(), PipelineError> {
        debug!(pass = pass.name(), index, "running pass");
        pass.run(module, &self.config.target);

        if self.config.debug {
            let file_name = format!("ssa_pass{:02}_{}.ir", index, pass.name());
            let _ = fs::create_dir_all(&self.dump_dir);
            let _ = fs::write(self.dump_dir.join(file_name), write_module(module));

            let mut validator = Validator::new();
            if !validator.validate(module) {
                return Err(PipelineError {
                    pass_index: index,
                    pass_name: pass.name(),
                    report: validator.report().to_string(),
                });
            }
        }

        Ok(())
    }
}

fn create_opt_passes(opt_level: u8) -> Vec<Box<dyn Pass>> {
    let mut passes: Vec<Box<dyn Pass>> = vec![Box::new(dead_func_elim::DeadFuncElimPass)];

    if opt_level >= 1 {
        passes.push(Box::new(control_flow_opt::ControlFlowOptPass));
        passes.push(Box::new(sroa::SroaPass::new()));
        passes.push(Box::new(stack_to_reg::StackToRegPass));
    }

    if opt_level >= 2 {
        passes.push(Box::new(loop_inversion::LoopInversionPass));
    }

    if opt_level >= 1 {
        passes.push(Box::new(peephole::PeepholePass));
        passes.push(Box::new(branch_elim::BranchElimPass));
        passes.push(Box::new(inlining::InliningPass::new()));
        passes.push(Box::new(control_flow_opt::ControlFlowOptPass));
        passes.push(Box::new(sroa::SroaPass::new()));
        passes.push(Box::new(stack_to_reg::StackToRegPass));
    }

    if opt_level >= 2 {
        passes.push(Box::new(licm::LicmPass));
        passes.push(Box::new(heap_to_stack::HeapToStackPass));
    }

    if opt_level >= 1 {
        passes.push(Box::new(precompute::PrecomputePass));
        passes.push(Box::new(canonicalize::CanonicalizePass));
        passes.push(Box::new(peephole::PeepholePass));
        passes.push(Box::new(dead_func_elim::DeadFuncElimPass));
        passes.push(Box::new(control_flow_opt::ControlFlowOptPass));
    }

    passes
}

// ---- shared rewrite helpers ----

/// Calls `f` for every register operand, including branch-target arguments.
pub fn for_each_reg(operands: &[Operand], f: &mut impl FnMut(VirtualRegister)) {
    for operand in operands {
        match operand {
            Operand::Register(reg, _) => f(*reg),
            Operand::BranchTarget(target) => for_each_reg(&target.args, f),
            _ => {}
        }
    }
}

/// Calls `f` for every value-position operand slot, including branch-target
/// arguments.
pub fn for_each_value_mut(operands: &mut [Operand], f: &mut impl FnMut(&mut Operand)) {
    for operand in operands {
        if let Operand::BranchTarget(target) = operand {
            for_each_value_mut(&mut target.args, f);
        } else {
            f(operand);
        }
    }
}

/// Replaces every use of `reg` with `value` (retyped per use site)
/// throughout the function.
pub fn replace_in_func(func: &mut Function, reg: VirtualRegister, value: &Operand) {
    for block_id in func.blocks.ids().collect::<Vec<_>>() {
        replace_in_block(func.blocks.get_mut(block_id), reg, value);
    }
}

pub fn replace_in_block(block: &mut BasicBlock, reg: VirtualRegister, value: &Operand) {
    for instr_id in block.instrs.ids().collect::<Vec<_>>() {
        let instr = block.instrs.get_mut(instr_id);
        for_each_value_mut(&mut instr.operands, &mut |operand| {
            if operand.is_register_of(reg) {
                *operand = value.with_type(operand.ty());
            }
        });
    }
}

/// Renames a register definition and all its uses within one block.
pub fn rename_in_block(block: &mut BasicBlock, old: VirtualRegister, new: VirtualRegister) {
    for instr_id in block.instrs.ids().collect::<Vec<_>>() {
        let instr = block.instrs.get_mut(instr_id);
        if instr.dest == Some(old) {
            instr.dest = Some(new);
        }
        for_each_value_mut(&mut instr.operands, &mut |operand| {
            if operand.is_register_of(old) {
                let ty = operand.ty();
                *operand = Operand::from_register(new, ty);
            }
        });
    }
}
