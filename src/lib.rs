//! dirk: a self-hosting compiler and execution engine for a small C
//! dialect.
//!
//! The pipeline is deliberately single-pass: the scanner feeds a parser that
//! emits stack-machine instructions as it reads, so the "intermediate
//! representation" is the VM's own instruction set. Compilation produces a
//! [`Program`] (code words, data image, entry address); the [`vm`] executes
//! it in-process, and the dialect is rich enough that the compiler's own
//! source (see `testdata/dirk.c`) compiles and re-compiles itself.
//!
//! ```text
//! source → lexer → (expression/statement emitter ⇄ symbol table)
//!        → code pool + data pool → VM → exit code
//! ```

pub mod code;
pub mod diagnostic;
pub mod lexeme;
pub mod lexer;
pub mod parser;
pub mod sym;
pub mod types;
pub mod vm;

use std::io::Write;

pub use diagnostic::{Diagnostic, Span};
pub use vm::{ExecutionResult, Layout, Vm, VmError};

/// Default size of each memory arena (code, data, heap, stack).
pub const DEFAULT_POOL_SIZE: usize = 256 * 1024;

/// Knobs for a single compilation.
#[derive(Clone, Copy, Debug)]
pub struct CompileOptions {
    /// Print each source line followed by the instructions emitted for it.
    pub listing: bool,
    /// Size of each memory arena in bytes.
    pub pool_size: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            listing: false,
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

/// A compiled guest program.
#[derive(Clone, Debug)]
pub struct Program {
    /// Instruction and operand words; jump operands index this vector.
    pub code: Vec<i64>,
    /// Data image: globals and string literals, based at the layout's
    /// `data_base`.
    pub data: Vec<u8>,
    /// Code address of `main`.
    pub entry: usize,
    /// The address-space layout both sides agreed on.
    pub layout: Layout,
}

/// Compile one translation unit. The first error aborts compilation.
pub fn compile(source: &str, options: &CompileOptions) -> Result<Program, Diagnostic> {
    parser::Parser::parse(source.as_bytes(), options)
}

/// Execute a compiled program, the way the CLI does: `args` becomes the
/// guest's argc/argv and `out` receives everything the guest prints.
pub fn run_program<W: Write>(
    program: &Program,
    args: &[String],
    debug: bool,
    out: W,
) -> Result<ExecutionResult, VmError> {
    Vm::with_output(program, args, out)?.debug(debug).run()
}
