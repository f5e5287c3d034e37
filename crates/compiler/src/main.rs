//! FasterBASIC compiler CLI.
//!
//! Default behavior compiles and immediately executes the program through
//! the embedded Lua runtime. `-o` compiles to a Lua file instead; `-p` and
//! `-l` dump intermediate preprocessor output and exit.

use clap::{CommandFactory, Parser as ClapParser};
use clap_complete::{Shell, generate};
use fbc::{CompilerConfig, format_diagnostics};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

#[derive(ClapParser)]
#[command(name = "fbc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "FasterBASIC compiler - compiles and runs BASIC programs via Lua", long_about = None)]
struct Cli {
    /// Input .bas source file
    input: Option<PathBuf>,

    /// Write Lua output to a file and exit (compile-only mode)
    #[arg(short = 'o', value_name = "FILE")]
    output: Option<PathBuf>,

    /// Write preprocessed BASIC (REM-stripped) to a file and exit
    #[arg(short = 'p', value_name = "FILE")]
    preprocessed: Option<PathBuf>,

    /// Write BASIC with line numbers converted to labels and exit
    #[arg(short = 'l', value_name = "FILE")]
    labeled: Option<PathBuf>,

    /// Time program execution and display elapsed time
    #[arg(short = 't')]
    time: bool,

    /// Emit comments in generated Lua
    #[arg(short = 'c')]
    comments: bool,

    /// Verbose output (compilation stats)
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Show detailed timing for each compilation phase
    #[arg(long)]
    profile: bool,

    /// Enable the AST optimizer (constant folding, dead code)
    #[arg(long = "opt-ast")]
    opt_ast: bool,

    /// Enable the peephole optimizer (IR-level optimizations)
    #[arg(long = "opt-peep")]
    opt_peep: bool,

    /// Enable all optimizers
    #[arg(long = "opt-all")]
    opt_all: bool,

    /// Show detailed optimization statistics
    #[arg(long = "opt-stats")]
    opt_stats: bool,

    /// Plugin command manifest(s) to load before compiling
    #[arg(long = "plugin", value_name = "MANIFEST")]
    plugins: Vec<PathBuf>,

    /// Cap on collected lex/parse errors
    #[arg(long = "max-errors", default_value_t = 50)]
    max_errors: usize,

    /// Generate shell completion scripts and exit
    #[arg(long, value_enum, value_name = "SHELL")]
    completions: Option<Shell>,
}

fn main() {
    let cli = Cli::parse();

    if let Some(shell) = cli.completions {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "fbc", &mut std::io::stdout());
        return;
    }

    let Some(input) = cli.input.clone() else {
        eprintln!("Error: no input file specified\n");
        let _ = Cli::command().print_help();
        process::exit(1);
    };

    let mut config = CompilerConfig::new()
        .with_max_errors(cli.max_errors)
        .with_plugin_manifests(cli.plugins.iter().cloned());
    if cli.comments {
        config = config.with_comments();
    }
    if cli.opt_ast || cli.opt_all {
        config = config.with_ast_optimizer();
    }
    if cli.opt_peep || cli.opt_all {
        config = config.with_peephole_optimizer();
    }

    if let Err(e) = fbc::initialize(&config) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }

    let verbose = cli.verbose || cli.profile;
    if verbose {
        eprintln!("Reading: {}", input.display());
    }
    let source = match std::fs::read_to_string(&input) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: cannot open file {}: {}", input.display(), e);
            process::exit(1);
        }
    };
    let base_dir = input
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    // Intermediate-output modes.
    if let Some(path) = &cli.preprocessed {
        let mut diags = Vec::new();
        let text = fbc::preprocess_source(&source, &base_dir, &mut diags);
        write_or_die(path, &text, verbose, "Preprocessed source");
        return;
    }
    if let Some(path) = &cli.labeled {
        let mut diags = Vec::new();
        let text = fbc::label_rewritten_source(&source, &base_dir, &mut diags);
        write_or_die(path, &text, verbose, "Label-rewritten source");
        return;
    }

    // Compile.
    let output = match fbc::compile_source(&source, &base_dir, &config) {
        Ok(output) => output,
        Err(diagnostics) => {
            eprintln!("\nCompilation failed:");
            eprint!("{}", format_diagnostics(&diagnostics));
            if let Some(first) = diagnostics.iter().find(|d| d.is_error()) {
                send_to_error_sink(&first.to_string());
            }
            eprintln!("Compilation aborted.");
            process::exit(1);
        }
    };

    for warning in &output.warnings {
        eprintln!("  {}", warning);
    }
    if verbose {
        let s = &output.stats;
        eprintln!("Tokens: {}", s.tokens);
        eprintln!("Program lines: {}", s.program_lines);
        eprintln!(
            "Symbols: {} variables, {} subs/functions, {} labels",
            s.variables, s.procs, s.labels
        );
        eprintln!("CFG blocks: {}", s.cfg_blocks);
        eprintln!("IR instructions: {}", s.ir_instructions);
        eprintln!("Generated Lua size: {} bytes", s.lua_bytes);
    }
    if cli.opt_stats || verbose {
        if let Some(report) = &output.stats.ast_opt_report {
            eprint!("{}", report);
        }
        if let Some(report) = &output.stats.peephole_report {
            eprint!("{}", report);
        }
    }
    if cli.profile {
        eprint!("\n{}", output.timings.report());
    }

    // Compile-only mode.
    if let Some(path) = &cli.output {
        write_or_die(path, &output.lua, verbose, "Lua output");
        if verbose {
            eprintln!("Compilation successful!");
        }
        return;
    }

    // Default: compile and run.
    if verbose {
        eprintln!("Compilation successful! Running program...");
    }
    let interrupt = Arc::new(AtomicBool::new(false));
    if let Err(e) = basic_runtime::install_interrupt_handler(interrupt.clone()) {
        eprintln!("Warning: {}", e);
    }

    let started = std::time::Instant::now();
    let run = basic_runtime::execute(
        &output.lua,
        basic_runtime::ExecConfig {
            capture_output: false,
            scripted_input: Vec::new(),
            constants: output.constants.values().to_vec(),
            interrupt: Some(interrupt),
        },
    );
    let elapsed = started.elapsed();

    let exit_code = match run {
        Ok(_) => 0,
        Err(message) => {
            if message.contains(basic_runtime::INTERRUPTED) {
                // Ctrl+C is not a real error.
                eprintln!("^C (Interrupted by user)");
                0
            } else {
                eprintln!("{}", message);
                send_to_error_sink(&message);
                1
            }
        }
    };

    if cli.time {
        eprintln!("\nExecution time: {:.6} seconds", elapsed.as_secs_f64());
    }
    process::exit(exit_code);
}

fn write_or_die(path: &Path, text: &str, verbose: bool, what: &str) {
    if let Err(e) = std::fs::write(path, text) {
        eprintln!("Error: cannot write to file {}: {}", path.display(), e);
        process::exit(1);
    }
    if verbose {
        eprintln!("{} written to: {}", what, path.display());
    }
}

/// Pipe a failure message to the host-configurable error sink - a command
/// named in FBC_ERROR_SINK (e.g. `pbcopy` or `xclip -selection clipboard`).
/// Failures here are silent; the sink is advisory.
fn send_to_error_sink(message: &str) {
    let Ok(sink) = std::env::var("FBC_ERROR_SINK") else {
        return;
    };
    let mut parts = sink.split_whitespace();
    let Some(program) = parts.next() else { return };
    let args: Vec<&str> = parts.collect();
    if let Ok(mut child) = process::Command::new(program)
        .args(&args)
        .stdin(process::Stdio::piped())
        .stdout(process::Stdio::null())
        .stderr(process::Stdio::null())
        .spawn()
    {
        if let Some(stdin) = child.stdin.as_mut() {
            let _ = stdin.write_all(message.as_bytes());
        }
        let _ = child.wait();
    }
}
