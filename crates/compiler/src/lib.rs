//! Opal Compiler Middle-End
//!
//! The pipeline from a resolved AST down to optimized SSA:
//!
//! 1. [`symbols`] and [`types`] model the declared entities and the
//!    language-level type system; [`resolver`] handles import forwarding,
//!    overload selection and generic instantiation.
//! 2. [`lower`] walks the resolved AST and emits typed SSA ([`ssa`]),
//!    encoding ownership-based destruction, closures, protocol dispatch and
//!    tagged unions into flat IR.
//! 3. [`passes`] transforms the SSA module in place, gated by the
//!    optimization level in [`config::Config`].
//! 4. [`ssa::validator`] asserts structural invariants; [`ssa::writer`] and
//!    [`ssa::parser`] provide the round-trippable textual form.
//!
//! The lexer, parser and semantic analysis live in the front-end crates; a
//! machine-code back-end consumes the final [`ssa::Module`].

pub mod ast;
pub mod config;
pub mod diagnostics;
pub mod lower;
pub mod passes;
pub mod resolver;
pub mod ssa;
pub mod symbols;
pub mod target;
pub mod types;

pub use config::Config;
pub use diagnostics::{Diagnostic, DiagnosticBuffer, Severity};
pub use target::Target;

/// Lowers a resolved unit and runs the optimization pipeline over the
/// result. Returns the final module; diagnostics accumulate in `diags` and
/// the caller decides the exit status from them.
pub fn compile_unit(
    unit: &mut symbols::Unit,
    ast: &mut ast::Ast,
    config: &Config,
    diags: &mut DiagnosticBuffer,
) -> Result<ssa::Module, passes::PipelineError> {
    let mut module = lower::lower_unit(unit, ast, config, diags);
    passes::PassRunner::new(config.clone()).run(&mut module)?;
    Ok(module)
}
