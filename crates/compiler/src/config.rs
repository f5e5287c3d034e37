//! Compiler configuration.
//!
//! Two distinct records flow through the pipeline:
//!
//! - [`CompilerConfig`]: how the driver wants the compiler to behave
//!   (optimizer toggles, comment emission, plugin manifests). Built by the
//!   CLI or embedding code, builder-style.
//! - [`CompilerOptions`]: what the *program* declared via `OPTION`
//!   directives. Collected by the parser and consumed by every later phase.

use std::path::PathBuf;

/// Meaning of `AND`/`OR`/`NOT`/`XOR`/`EQV`/`IMP` on numeric operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogicMode {
    /// Operate on the integer bit patterns (the classic dialect default).
    #[default]
    Bitwise,
    /// Operate on truthiness, producing 0/1.
    Logical,
}

/// Directives collected from `OPTION` statements while parsing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompilerOptions {
    /// `OPTION BASE {0|1}` - lowest valid array index.
    pub array_base: i64,
    /// `OPTION EXPLICIT` - every variable must be DIM'd before use.
    pub explicit: bool,
    /// `OPTION UNICODE` - string indexing is by code point.
    pub unicode: bool,
    /// `OPTION BITWISE|LOGICAL`.
    pub logic_mode: LogicMode,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        CompilerOptions {
            array_base: 0,
            explicit: false,
            unicode: false,
            logic_mode: LogicMode::Bitwise,
        }
    }
}

/// Driver-side configuration, builder-style.
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Run the AST optimizer (constant folding, dead code elimination).
    pub opt_ast: bool,
    /// Run the IR peephole optimizer.
    pub opt_peephole: bool,
    /// Emit explanatory comments into the generated Lua.
    pub emit_comments: bool,
    /// When false, wrap each statement so runtime errors report and continue
    /// to the error handler instead of aborting inline.
    pub exit_on_error: bool,
    /// Emit a yield check at every loop back-edge.
    pub yield_on_backedge: bool,
    /// Cap on collected lex/parse errors before giving up.
    pub max_errors: usize,
    /// Plugin command manifests to load before compilation.
    pub plugin_manifests: Vec<PathBuf>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            opt_ast: false,
            opt_peephole: false,
            emit_comments: false,
            exit_on_error: true,
            yield_on_backedge: true,
            max_errors: 50,
            plugin_manifests: Vec::new(),
        }
    }
}

impl CompilerConfig {
    pub fn new() -> Self {
        CompilerConfig::default()
    }

    /// Enable both optimizers.
    pub fn with_all_optimizations(mut self) -> Self {
        self.opt_ast = true;
        self.opt_peephole = true;
        self
    }

    pub fn with_ast_optimizer(mut self) -> Self {
        self.opt_ast = true;
        self
    }

    pub fn with_peephole_optimizer(mut self) -> Self {
        self.opt_peephole = true;
        self
    }

    pub fn with_comments(mut self) -> Self {
        self.emit_comments = true;
        self
    }

    pub fn with_max_errors(mut self, cap: usize) -> Self {
        self.max_errors = cap;
        self
    }

    pub fn with_plugin_manifest(mut self, path: impl Into<PathBuf>) -> Self {
        self.plugin_manifests.push(path.into());
        self
    }

    pub fn with_plugin_manifests(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.plugin_manifests.extend(paths);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = CompilerOptions::default();
        assert_eq!(opts.array_base, 0);
        assert!(!opts.explicit);
        assert_eq!(opts.logic_mode, LogicMode::Bitwise);

        let cfg = CompilerConfig::default();
        assert!(!cfg.opt_ast);
        assert!(cfg.exit_on_error);
        assert!(cfg.yield_on_backedge);
        assert_eq!(cfg.max_errors, 50);
    }

    #[test]
    fn builder() {
        let cfg = CompilerConfig::new()
            .with_all_optimizations()
            .with_comments()
            .with_max_errors(10)
            .with_plugin_manifest("plugins/sound.toml");
        assert!(cfg.opt_ast && cfg.opt_peephole && cfg.emit_comments);
        assert_eq!(cfg.max_errors, 10);
        assert_eq!(cfg.plugin_manifests.len(), 1);
    }
}
