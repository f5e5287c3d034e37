//! FasterBASIC compiler library.
//!
//! Compiles a line-numbered BASIC dialect to Lua source for an embedded
//! interpreter. The pipeline is a straight line:
//!
//! ```text
//! source → preprocessor → lexer → parser → semantic → [AST optimizer]
//!        → CFG → IR → [peephole] → Lua emitter
//! ```
//!
//! with the shared command registry and constants store consulted by every
//! phase. Parse errors stop the pipeline after the parser, semantic errors
//! before CFG construction; warnings never stop anything. Later-phase
//! invariant violations surface as distinct compiler-bug diagnostics.
//!
//! # Extending the compiler
//!
//! Plugins contribute commands through TOML manifests loaded before
//! compilation begins:
//!
//! ```rust,ignore
//! fbc::initialize(&CompilerConfig::new().with_plugin_manifest("sound.toml"))?;
//! let output = fbc::compile_source(&source, Path::new("."), &config)?;
//! ```

pub mod ast;
pub mod cfg;
pub mod codegen;
pub mod config;
pub mod diagnostics;
pub mod ir;
pub mod irgen;
pub mod lexer;
pub mod optimizer;
pub mod parser;
pub mod peephole;
pub mod plugins;
pub mod preprocessor;
pub mod semantic;
pub mod token;

pub use config::{CompilerConfig, CompilerOptions};
pub use diagnostics::{Diagnostic, DiagnosticKind, Severity, format_diagnostics, has_errors};

use basic_core::{ConstantsStore, DataSegment, builtins, constants, registry};
use std::path::Path;
use std::time::{Duration, Instant};

/// Per-phase wall-clock timings for `--profile`.
#[derive(Debug, Default, Clone)]
pub struct PhaseTimings {
    pub preprocess: Duration,
    pub lex: Duration,
    pub parse: Duration,
    pub semantic: Duration,
    pub ast_opt: Duration,
    pub cfg: Duration,
    pub ir: Duration,
    pub peephole: Duration,
    pub codegen: Duration,
}

impl PhaseTimings {
    pub fn total(&self) -> Duration {
        self.preprocess
            + self.lex
            + self.parse
            + self.semantic
            + self.ast_opt
            + self.cfg
            + self.ir
            + self.peephole
            + self.codegen
    }

    pub fn report(&self) -> String {
        let mut out = String::from("=== Compilation Phase Timing ===\n");
        let row = |name: &str, d: Duration| format!("  {:<18}{:>9.3} ms\n", name, d.as_secs_f64() * 1000.0);
        out.push_str(&row("Preprocessor:", self.preprocess));
        out.push_str(&row("Lexer:", self.lex));
        out.push_str(&row("Parser:", self.parse));
        out.push_str(&row("Semantic:", self.semantic));
        if self.ast_opt != Duration::ZERO {
            out.push_str(&row("AST Optimizer:", self.ast_opt));
        }
        out.push_str(&row("CFG Builder:", self.cfg));
        out.push_str(&row("IR Generator:", self.ir));
        if self.peephole != Duration::ZERO {
            out.push_str(&row("Peephole Opt:", self.peephole));
        }
        out.push_str(&row("Lua CodeGen:", self.codegen));
        out.push_str(&row("Total:", self.total()));
        out
    }
}

/// Compilation statistics for `-v` and `--opt-stats`.
#[derive(Debug, Default, Clone)]
pub struct CompileStats {
    pub tokens: usize,
    pub program_lines: usize,
    pub variables: usize,
    pub procs: usize,
    pub labels: usize,
    pub cfg_blocks: usize,
    pub ir_instructions: usize,
    pub lua_bytes: usize,
    pub ast_opt_report: Option<String>,
    pub peephole_report: Option<String>,
}

/// A successful compilation.
#[derive(Debug)]
pub struct CompileOutput {
    pub lua: String,
    /// The DATA segment and restore tables the host wires up (also baked
    /// into the emitted initializer).
    pub data: DataSegment,
    /// Constants snapshot for `constants_get`.
    pub constants: ConstantsStore,
    pub options: CompilerOptions,
    pub warnings: Vec<Diagnostic>,
    pub stats: CompileStats,
    pub timings: PhaseTimings,
}

/// One-time process initialization: core command set, plugin manifests, then
/// seal the registry and constants store. Call before the first compile.
pub fn initialize(config: &CompilerConfig) -> Result<(), String> {
    builtins::ensure_core_registered();
    plugins::load_plugins(&config.plugin_manifests)?;
    registry::mark_initialized();
    constants::mark_initialized();
    Ok(())
}

/// Include expansion plus REM normalization - the `-p` output.
pub fn preprocess_source(
    source: &str,
    base_dir: &Path,
    diagnostics: &mut Vec<Diagnostic>,
) -> String {
    let expanded = preprocessor::expand_includes(source, base_dir, diagnostics);
    preprocessor::normalize_rem(&expanded)
}

/// Everything `-l` shows: includes, REM normalization and the line-number→
/// label rewrite.
pub fn label_rewritten_source(
    source: &str,
    base_dir: &Path,
    diagnostics: &mut Vec<Diagnostic>,
) -> String {
    let preprocessed = preprocess_source(source, base_dir, diagnostics);
    preprocessor::rewrite_line_numbers(&preprocessed)
}

/// Compile BASIC source to Lua. On failure every collected diagnostic is
/// returned (errors and warnings, each carrying its BASIC line).
pub fn compile_source(
    source: &str,
    base_dir: &Path,
    config: &CompilerConfig,
) -> Result<CompileOutput, Vec<Diagnostic>> {
    builtins::ensure_core_registered();
    let mut stats = CompileStats::default();
    let mut timings = PhaseTimings::default();
    let mut diagnostics: Vec<Diagnostic> = Vec::new();

    // Preprocess: includes, REM, DATA extraction, line-number labels.
    let phase = Instant::now();
    let expanded = preprocessor::expand_includes(source, base_dir, &mut diagnostics);
    let rem_stripped = preprocessor::normalize_rem(&expanded);
    let (no_data, data) = preprocessor::extract_data(&rem_stripped);
    let prepared = preprocessor::rewrite_line_numbers(&no_data);
    timings.preprocess = phase.elapsed();

    let mut constants_store = constants::snapshot();

    // Lex.
    let phase = Instant::now();
    let lexed = {
        let reg = registry::read();
        lexer::tokenize(&prepared, &reg, config.max_errors)
    };
    timings.lex = phase.elapsed();
    stats.tokens = lexed.tokens.len();
    diagnostics.extend(lexed.diagnostics);

    // Parse.
    let phase = Instant::now();
    let parsed = {
        let reg = registry::read();
        parser::Parser::new(
            lexed.tokens,
            &lexed.mapping,
            &mut constants_store,
            &reg,
            config.max_errors,
        )
        .parse()
    };
    timings.parse = phase.elapsed();
    stats.program_lines = parsed.program.lines.len();
    diagnostics.extend(parsed.diagnostics);
    if has_errors(&diagnostics) {
        return Err(diagnostics);
    }
    let options = parsed.options;
    let mut program = parsed.program;

    // Semantic analysis.
    let phase = Instant::now();
    let sem = {
        let reg = registry::read();
        semantic::SemanticAnalyzer::new(&options, &reg, &constants_store).analyze(&mut program)
    };
    timings.semantic = phase.elapsed();
    stats.variables = sem.symbols.variables.len();
    stats.procs = sem.symbols.procs.len();
    stats.labels = sem.symbols.labels.len();
    diagnostics.extend(sem.diagnostics);
    if has_errors(&diagnostics) {
        return Err(diagnostics);
    }
    let symbols = sem.symbols;

    // Optional AST optimization.
    if config.opt_ast {
        let phase = Instant::now();
        let mut optimizer = optimizer::AstOptimizer::new(options);
        optimizer.optimize(&mut program);
        timings.ast_opt = phase.elapsed();
        stats.ast_opt_report = Some(optimizer.report());
    }

    // CFG construction.
    let phase = Instant::now();
    let (program_cfg, cfg_diags) = cfg::build(&program);
    timings.cfg = phase.elapsed();
    stats.cfg_blocks = program_cfg.main.blocks.len()
        + program_cfg
            .procs
            .iter()
            .map(|p| p.cfg.blocks.len())
            .sum::<usize>();
    diagnostics.extend(cfg_diags);
    if has_errors(&diagnostics) {
        return Err(diagnostics);
    }

    // IR generation.
    let phase = Instant::now();
    let ir_out = {
        let reg = registry::read();
        irgen::generate(
            &program_cfg,
            &symbols,
            &constants_store,
            &reg,
            options,
            config,
            data.clone(),
        )
    };
    timings.ir = phase.elapsed();
    diagnostics.extend(ir_out.diagnostics);
    if has_errors(&diagnostics) {
        return Err(diagnostics);
    }
    let mut ir_program = ir_out.program;
    stats.ir_instructions = ir_program.instruction_count();

    // Optional peephole optimization.
    if config.opt_peephole {
        let phase = Instant::now();
        let mut peephole = peephole::PeepholeOptimizer::new();
        peephole.optimize(&mut ir_program);
        timings.peephole = phase.elapsed();
        stats.peephole_report = Some(peephole.report());
        stats.ir_instructions = ir_program.instruction_count();
    }

    // Lua emission.
    let phase = Instant::now();
    let lua = match codegen::generate_lua(&ir_program, &symbols, &constants_store, config) {
        Ok(lua) => lua,
        Err(e) => {
            diagnostics.push(Diagnostic::new(
                DiagnosticKind::CompilerBug,
                e.to_string(),
                token::SourceLoc::default(),
            ));
            return Err(diagnostics);
        }
    };
    timings.codegen = phase.elapsed();
    stats.lua_bytes = lua.len();

    Ok(CompileOutput {
        lua,
        data: ir_program.data.clone(),
        constants: constants_store,
        options,
        warnings: diagnostics,
        stats,
        timings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(src: &str) -> Result<CompileOutput, Vec<Diagnostic>> {
        compile_source(src, Path::new("."), &CompilerConfig::default())
    }

    #[test]
    fn hello_world_compiles() {
        let out = compile("10 PRINT \"HI\"\n").unwrap();
        assert!(out.lua.contains("terminal_print_str(\"HI\")"));
        assert!(out.lua.contains("terminal_print_nl()"));
        assert!(out.lua.contains("local function __main()"));
    }

    #[test]
    fn empty_source_compiles() {
        let out = compile("").unwrap();
        assert!(out.lua.contains("__main"));
    }

    #[test]
    fn reconstruction_collapses_to_direct_assignment() {
        let out = compile("10 C = 5 + 10\n").unwrap();
        assert!(out.lua.contains("C = (5 + 10)"), "{}", out.lua);
        assert!(!out.lua.contains("C = __pop()"));
    }

    #[test]
    fn parse_errors_stop_the_pipeline() {
        let errs = compile("10 X = \n").unwrap_err();
        assert!(errs.iter().any(|d| d.kind == DiagnosticKind::SyntaxError));
    }

    #[test]
    fn semantic_errors_stop_before_cfg() {
        let errs = compile("10 OPTION EXPLICIT\n20 X = 5\n").unwrap_err();
        let first = errs.iter().find(|d| d.is_error()).unwrap();
        assert_eq!(first.kind, DiagnosticKind::SemanticError);
        assert_eq!(first.basic_line, Some(20));
        assert!(first.message.contains("Undeclared"));
        assert!(first.message.contains('X'));
    }

    #[test]
    fn warnings_do_not_stop_compilation() {
        let out = compile("10 A% = 2.5\n").unwrap();
        assert!(out
            .warnings
            .iter()
            .any(|d| d.kind == DiagnosticKind::Warning));
    }

    #[test]
    fn data_flows_into_output_and_emitter() {
        let out = compile("10 DATA 1, 2, \"three\"\n20 READ A%, B%, C$\n").unwrap();
        assert_eq!(out.data.len(), 3);
        assert!(out.lua.contains("data_init({1, 2, \"three\"})"), "{}", out.lua);
        assert!(out.lua.contains("data_restore_point(10, 0)"));
    }

    #[test]
    fn goto_rewrites_to_labels_end_to_end() {
        let out = compile("10 GOTO 30\n20 PRINT \"NO\"\n30 PRINT \"YES\"\n").unwrap();
        assert!(out.lua.contains("goto L30"), "{}", out.lua);
        assert!(out.lua.contains("::L30::"), "{}", out.lua);
    }

    #[test]
    fn option_base_changes_emitted_indices() {
        let base0 = compile("10 DIM A(3)\n20 A(1) = 5\n").unwrap();
        assert!(base0.lua.contains("A[((1) - 0 + 1)]") || base0.lua.contains("A[2]"), "{}", base0.lua);
        let base1 = compile("10 OPTION BASE 1\n20 DIM A(3)\n30 A(1) = 5\n").unwrap();
        assert!(base1.lua.contains("A[1]"), "{}", base1.lua);
    }

    #[test]
    fn optimizers_report_stats() {
        let config = CompilerConfig::new().with_all_optimizations();
        let out = compile_source("10 X = 1 + 2\n", Path::new("."), &config).unwrap();
        assert!(out.stats.ast_opt_report.is_some());
        assert!(out.stats.peephole_report.is_some());
    }

    #[test]
    fn yield_checks_only_on_back_edges() {
        let out = compile("10 WHILE A < 3\n20 A = A + 1\n30 WEND\n40 B = 1\n").unwrap();
        assert_eq!(out.lua.matches("basic_pump_events()").count(), 1, "{}", out.lua);
    }

    #[test]
    fn timers_emit_registration_calls() {
        let out = compile(
            "10 EVERY 100 MS TICK\n20 STOP TIMER ALL\n30 SUB TICK : T% = T% + 1 : ENDSUB\n",
        )
        .unwrap();
        assert!(out.lua.contains("basic_timer_every_ms(100, \"PROC_TICK\")"), "{}", out.lua);
        assert!(out.lua.contains("basic_timer_stop_all()"));
        assert!(out.lua.contains("function PROC_TICK()"));
    }
}
