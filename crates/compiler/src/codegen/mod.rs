//! Lua code generation: IR → Lua source.
//!
//! Two complementary strategies, mirroring the IR's stack discipline:
//!
//! 1. **Direct translation** - every opcode has a Lua template over a small
//!    operand-stack array (`__push`/`__pop` in the prelude).
//! 2. **Symbolic expression reconstruction** - a per-instruction model
//!    tracks a symbolic expression for each virtual stack slot, and when a
//!    store's operands are all pure the emitter collapses the push/pop chain
//!    into one direct assignment. Impure values and control flow fall back
//!    to the stack form; the model resets at every block boundary.
//!
//! The emitted chunk is: prelude, DATA initializer and restore-table
//! registrations, file-scope variable declarations, global sub/function
//! definitions, then a `__main()` driven through `pcall` so runtime errors
//! are annotated with the BASIC line recorded in `__BL`.
//!
//! # Module structure
//!
//! - `instr.rs`: per-instruction emission and the symbolic stack model
//! - `names.rs`: identifier mangling and literal formatting
//! - `prelude.rs`: the emitted Lua prelude text

mod instr;
pub mod names;
mod prelude;

pub use instr::SymEntry;

use crate::ast::ValueType;
use crate::config::CompilerConfig;
use crate::ir::{Instr, IrProc, IrProgram};
use crate::semantic::{ProcKind, SymbolTable};
use basic_core::ConstantsStore;
use names::{lua_number, lua_string, mangle_proc, mangle_var};
use std::collections::HashMap;
use std::fmt::Write as _;

/// Error type for code generation.
///
/// Logical errors (an IR shape that should not exist) and formatting errors
/// both propagate with `?`.
#[derive(Debug)]
pub enum CodeGenError {
    Logic(String),
    Format(std::fmt::Error),
}

impl std::fmt::Display for CodeGenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodeGenError::Logic(s) => write!(f, "{}", s),
            CodeGenError::Format(e) => write!(f, "Lua generation error: {}", e),
        }
    }
}

impl std::error::Error for CodeGenError {}

impl From<String> for CodeGenError {
    fn from(s: String) -> Self {
        CodeGenError::Logic(s)
    }
}

impl From<std::fmt::Error> for CodeGenError {
    fn from(e: std::fmt::Error) -> Self {
        CodeGenError::Format(e)
    }
}

/// Which body is being emitted; controls `Ret` and variable resolution.
#[derive(Debug, Clone)]
pub(crate) enum Region {
    Main,
    Proc {
        /// Suffix-qualified BASIC name; stores to it set the return slot.
        name: String,
        has_ret: bool,
    },
}

pub struct LuaCodeGen<'a> {
    symbols: &'a SymbolTable,
    constants: &'a ConstantsStore,
    emit_comments: bool,
    exit_on_error: bool,
    pub(crate) output: String,
    pub(crate) indent: usize,
    /// Symbolic mirror of the operand stack (top = last).
    pub(crate) model: Vec<SymEntry>,
    pub(crate) region: Region,
    /// GOSUB resume labels for the region, in registration order.
    pub(crate) resumes: Vec<String>,
    /// `OPTION BASE` value, for 1-based Lua index rebasing.
    pub(crate) base: i64,
    /// Numeric value of a true comparison: -1 under `OPTION BITWISE` (so
    /// bitwise NOT negates truth, as the classic dialects rely on), 1 under
    /// `OPTION LOGICAL` (matching the boolean constants).
    pub(crate) true_lit: &'static str,
}

impl<'a> LuaCodeGen<'a> {
    pub fn new(symbols: &'a SymbolTable, constants: &'a ConstantsStore, config: &CompilerConfig) -> Self {
        LuaCodeGen {
            symbols,
            constants,
            emit_comments: config.emit_comments,
            exit_on_error: config.exit_on_error,
            output: String::new(),
            indent: 0,
            model: Vec::new(),
            region: Region::Main,
            resumes: Vec::new(),
            base: 0,
            true_lit: "-1",
        }
    }

    /// Generate the complete Lua chunk for a program.
    pub fn generate(mut self, program: &IrProgram) -> Result<String, CodeGenError> {
        self.base = program.options.array_base;
        self.true_lit = match program.options.logic_mode {
            crate::config::LogicMode::Bitwise => "-1",
            crate::config::LogicMode::Logical => "1",
        };
        if self.emit_comments {
            self.line("-- Generated by fbc")?;
        }
        self.output.push_str(prelude::PRELUDE);
        self.line("local __BL = 0")?;

        self.emit_data(program)?;
        self.emit_declarations(program)?;

        for proc in &program.procs {
            self.emit_proc(proc)?;
        }

        self.line("local function __main()")?;
        self.indent += 1;
        self.region = Region::Main;
        self.emit_body(&program.main)?;
        self.indent -= 1;
        self.line("end")?;

        self.emit_wrapper()?;
        Ok(self.output)
    }

    pub(crate) fn line(&mut self, text: &str) -> Result<(), CodeGenError> {
        for _ in 0..self.indent {
            self.output.push_str("  ");
        }
        writeln!(&mut self.output, "{}", text)?;
        Ok(())
    }

    pub(crate) fn comment(&mut self, text: &str) -> Result<(), CodeGenError> {
        if self.emit_comments {
            self.line(&format!("-- {}", text))?;
        }
        Ok(())
    }

    /// The DATA segment initializer and restore-table registrations the host
    /// runtime wires up at program start.
    fn emit_data(&mut self, program: &IrProgram) -> Result<(), CodeGenError> {
        if program.data.is_empty() {
            return Ok(());
        }
        self.comment("DATA segment")?;
        let values: Vec<String> = program
            .data
            .values()
            .iter()
            .map(|v| match v {
                basic_core::Value::Int(n) => n.to_string(),
                basic_core::Value::Double(d) => lua_number(*d),
                basic_core::Value::Str(s) => lua_string(s),
            })
            .collect();
        self.line(&format!("data_init({{{}}})", values.join(", ")))?;
        let mut lines: Vec<(u32, usize)> = program
            .data
            .line_restore_points()
            .iter()
            .map(|(l, i)| (*l, *i))
            .collect();
        lines.sort();
        for (line, index) in lines {
            self.line(&format!("data_restore_point({}, {})", line, index))?;
        }
        let mut labels: Vec<(String, usize)> = program
            .data
            .label_restore_points()
            .iter()
            .map(|(l, i)| (l.clone(), *i))
            .collect();
        labels.sort();
        for (label, index) in labels {
            self.line(&format!(
                "data_restore_label_point({}, {})",
                lua_string(&label),
                index
            ))?;
        }
        Ok(())
    }

    /// File-scope variable declarations: every global scalar/array plus the
    /// compiler's loop and dispatch temporaries.
    fn emit_declarations(&mut self, program: &IrProgram) -> Result<(), CodeGenError> {
        self.comment("variables")?;
        let mut decls: Vec<(String, bool, ValueType)> = self
            .symbols
            .variables
            .values()
            .map(|info| (mangle_var(&info.key), info.is_array, info.ty))
            .collect();
        decls.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, is_array, ty) in decls {
            if is_array {
                self.line(&format!("local {}", name))?;
            } else if ty == ValueType::String {
                self.line(&format!("local {} = \"\"", name))?;
            } else {
                self.line(&format!("local {} = 0", name))?;
            }
        }
        for temp in &program.temps {
            self.line(&format!("local {} = 0", temp))?;
        }
        Ok(())
    }

    fn emit_proc(&mut self, proc: &IrProc) -> Result<(), CodeGenError> {
        let params: Vec<String> = proc.params.iter().map(|p| mangle_var(p)).collect();
        match proc.kind {
            ProcKind::Sub => self.comment(&format!("SUB {}", proc.name))?,
            ProcKind::Function => self.comment(&format!("FUNCTION {}", proc.name))?,
            ProcKind::DefFn => self.comment(&format!("DEF FN {}", proc.name))?,
        }
        self.line(&format!(
            "function {}({})",
            mangle_proc(&proc.name),
            params.join(", ")
        ))?;
        self.indent += 1;
        if proc.ret.is_some() {
            let zero = if proc.ret == Some(ValueType::String) {
                "\"\""
            } else {
                "0"
            };
            self.line(&format!("local __ret = {}", zero))?;
        }
        self.region = Region::Proc {
            name: proc.name.clone(),
            has_ret: proc.ret.is_some(),
        };
        self.emit_body(&proc.body)?;
        self.region = Region::Main;
        self.indent -= 1;
        self.line("end")?;
        Ok(())
    }

    fn emit_body(&mut self, instrs: &[Instr]) -> Result<(), CodeGenError> {
        // Assign GOSUB return-site indices for this region up front; RETURN
        // dispatches over them.
        self.resumes = instrs
            .iter()
            .filter_map(|i| match i {
                Instr::Gosub { resume, .. } => Some(resume.clone()),
                _ => None,
            })
            .collect();
        self.model.clear();
        for instr in instrs {
            self.emit_instr(instr)?;
        }
        if !self.model.is_empty() {
            return Err(CodeGenError::Logic(format!(
                "{} unconsumed expression(s) at end of body",
                self.model.len()
            )));
        }
        Ok(())
    }

    /// The `pcall` wrapper that annotates runtime failures with the BASIC
    /// line. With exit-on-error disabled the failure is reported and the
    /// program ends normally instead of propagating.
    fn emit_wrapper(&mut self) -> Result<(), CodeGenError> {
        self.line("local __ok, __err = pcall(__main)")?;
        self.line("basic_timer_stop_all()")?;
        self.line("file_close_all()")?;
        // END inside a sub raises the __HALT__ sentinel; that is a normal
        // exit, not a failure.
        self.line("if not __ok and tostring(__err) ~= \"__HALT__\" then")?;
        self.indent += 1;
        self.line("local __msg = \"Runtime error at BASIC line \" .. tostring(__BL) .. \": \" .. tostring(__err)")?;
        if self.exit_on_error {
            self.line("error(__msg, 0)")?;
        } else {
            self.line("terminal_print_str(__msg)")?;
            self.line("terminal_print_nl()")?;
        }
        self.indent -= 1;
        self.line("end")?;
        Ok(())
    }

    // -- helpers shared with instr.rs --------------------------------------

    /// Lua name for a variable key within the current region.
    pub(crate) fn lua_var(&self, key: &str) -> String {
        if let Region::Proc { name, has_ret } = &self.region
            && *has_ret
            && name == key
        {
            return "__ret".to_string();
        }
        mangle_var(key)
    }

    /// Is this variable integer-typed (so stores truncate)?
    pub(crate) fn is_int_var(&self, key: &str) -> bool {
        let proc = match &self.region {
            Region::Proc { name, .. } => Some(name.as_str()),
            Region::Main => None,
        };
        self.symbols.var_type(key, proc) == ValueType::Integer
    }

    /// Element initializer for an array's type.
    pub(crate) fn array_init(&self, key: &str) -> &'static str {
        match self
            .symbols
            .variables
            .get(key)
            .map(|v| v.ty)
        {
            Some(ValueType::String) => "\"\"",
            _ => "0",
        }
    }

    /// Literal text for a constant-store entry.
    pub(crate) fn const_text(&self, index: usize) -> Result<(String, bool), CodeGenError> {
        match self.constants.get(index) {
            Some(basic_core::Value::Int(n)) => Ok((n.to_string(), false)),
            Some(basic_core::Value::Double(d)) => Ok((lua_number(*d), false)),
            Some(basic_core::Value::Str(s)) => Ok((lua_string(s), true)),
            None => Err(CodeGenError::Logic(format!(
                "Constant index {} out of range",
                index
            ))),
        }
    }

    /// GOSUB return-site index for a resume label (1-based).
    pub(crate) fn resume_index(&self, resume: &str) -> Result<usize, CodeGenError> {
        self.resumes
            .iter()
            .position(|r| r == resume)
            .map(|i| i + 1)
            .ok_or_else(|| {
                CodeGenError::Logic(format!("GOSUB resume label {} not registered", resume))
            })
    }
}

/// Convenience entry point used by the pipeline.
pub fn generate_lua(
    program: &IrProgram,
    symbols: &SymbolTable,
    constants: &ConstantsStore,
    config: &CompilerConfig,
) -> Result<String, CodeGenError> {
    LuaCodeGen::new(symbols, constants, config).generate(program)
}

/// Referenced-label scan used by tests and `-v` diagnostics: every label a
/// body references must exist exactly once.
pub fn check_labels(instrs: &[Instr]) -> Result<(), String> {
    let mut defined: HashMap<&str, usize> = HashMap::new();
    for instr in instrs {
        if let Instr::Label(l) = instr {
            *defined.entry(l.as_str()).or_insert(0) += 1;
        }
    }
    for (label, count) in &defined {
        if *count > 1 {
            return Err(format!("label {} defined {} times", label, count));
        }
    }
    for instr in instrs {
        let refs: Vec<&str> = match instr {
            Instr::Jmp(l) | Instr::Jz(l) | Instr::Jnz(l) => vec![l.as_str()],
            Instr::Gosub { target, resume } => vec![target.as_str(), resume.as_str()],
            _ => Vec::new(),
        };
        for l in refs {
            if !defined.contains_key(l) {
                return Err(format!("jump to undefined label {}", l));
            }
        }
    }
    Ok(())
}
