//! IR generation: CFG → linear stack instructions.
//!
//! Blocks are emitted entry-first in reverse post-order (successors visited
//! so that fall-through targets land adjacent where possible); every block
//! begins with its label and jumps are inserted only when the target is not
//! the next emitted block. Expressions emit post-order onto the implicit
//! stack. Invariant violations found here (an unresolved node surviving
//! validation, a block with nonzero stack effect) are reported as
//! compiler-bug diagnostics rather than panics.

use crate::ast::*;
use crate::cfg::{BasicBlock, BlockId, BlockStmt, Cfg, ProgramCfg, Terminator};
use crate::config::{CompilerConfig, CompilerOptions, LogicMode};
use crate::diagnostics::{Diagnostic, DiagnosticKind};
use crate::ir::{Instr, IrProc, IrProgram};
use crate::semantic::{ProcKind, SymbolTable, expr_type};
use basic_core::{CommandRegistry, ConstantsStore, DataSegment};
use std::collections::HashSet;

#[derive(Debug)]
pub struct IrGenOutput {
    pub program: IrProgram,
    pub diagnostics: Vec<Diagnostic>,
}

pub struct IrGenerator<'a> {
    symbols: &'a SymbolTable,
    constants: &'a ConstantsStore,
    registry: &'a CommandRegistry,
    options: CompilerOptions,
    yield_on_backedge: bool,
    diagnostics: Vec<Diagnostic>,
    temps: HashSet<String>,
    /// Monotonic counter for dispatch temporaries and synthetic labels.
    seq: usize,
    current_proc: Option<String>,
    current_line: Option<u32>,
    out: Vec<Instr>,
}

/// Generate IR for the whole program. The preprocessor's DATA segment is
/// materialized into the IR, with line-keyed restore points aliased under
/// their `L<n>` label spelling so rewritten `RESTORE L20` resolves.
pub fn generate(
    cfg: &ProgramCfg<'_>,
    symbols: &SymbolTable,
    constants: &ConstantsStore,
    registry: &CommandRegistry,
    options: CompilerOptions,
    config: &CompilerConfig,
    data: DataSegment,
) -> IrGenOutput {
    let mut data = data;
    let aliases: Vec<(String, usize)> = data
        .line_restore_points()
        .iter()
        .map(|(line, index)| (format!("L{}", line), *index))
        .collect();
    for (label, index) in aliases {
        if data.restore_index_for_label(&label).is_none() {
            data.add_label_restore(&label, index);
        }
    }

    let mut generator = IrGenerator {
        symbols,
        constants,
        registry,
        options,
        yield_on_backedge: config.yield_on_backedge,
        diagnostics: Vec::new(),
        temps: HashSet::new(),
        seq: 0,
        current_proc: None,
        current_line: None,
        out: Vec::new(),
    };

    let main = generator.emit_region(&cfg.main, false);
    let mut procs = Vec::new();
    for proc in &cfg.procs {
        generator.current_proc = Some(proc.name.clone());
        generator.current_line = None;
        let body = generator.emit_region(&proc.cfg, true);
        procs.push(IrProc {
            name: proc.name.clone(),
            kind: proc.kind,
            params: proc.params.iter().map(VarRef::key).collect(),
            ret: proc.ret,
            body,
        });
        generator.current_proc = None;
    }
    for def_fn in &cfg.def_fns {
        generator.current_proc = Some(def_fn.name.key());
        generator.current_line = None;
        generator.out = Vec::new();
        generator.emit_expr(def_fn.body);
        generator.out.push(Instr::Store(def_fn.name.key()));
        generator.out.push(Instr::Ret);
        let body = std::mem::take(&mut generator.out);
        procs.push(IrProc {
            name: def_fn.name.key(),
            kind: ProcKind::DefFn,
            params: def_fn.params.iter().map(VarRef::key).collect(),
            ret: Some(def_fn.name.value_type()),
            body,
        });
        generator.current_proc = None;
    }

    let mut temps: Vec<String> = generator.temps.iter().cloned().collect();
    temps.sort();

    let program = IrProgram {
        main,
        procs,
        data,
        temps,
        options,
    };

    let mut diagnostics = generator.diagnostics;
    verify_balance(&program, &mut diagnostics);
    IrGenOutput {
        program,
        diagnostics,
    }
}

/// Reverse post-order over reachable blocks, entry first. Successors are
/// pushed in declaration order, which makes the first successor (the
/// preferred fall-through target) land adjacent to its predecessor.
fn reverse_post_order(cfg: &Cfg<'_>) -> Vec<BlockId> {
    let mut visited = vec![false; cfg.blocks.len()];
    let mut postorder = Vec::new();
    // Iterative DFS with an explicit done-marker stack.
    let mut stack = vec![(cfg.entry, false)];
    while let Some((id, processed)) = stack.pop() {
        if processed {
            postorder.push(id);
            continue;
        }
        if visited[id.0] {
            continue;
        }
        visited[id.0] = true;
        stack.push((id, true));
        for succ in cfg.blocks[id.0].terminator.successors() {
            if !visited[succ.0] {
                stack.push((succ, false));
            }
        }
    }
    postorder.reverse();
    postorder
}

impl<'a> IrGenerator<'a> {
    fn bug(&mut self, loc: crate::token::SourceLoc, line: Option<u32>, message: String) {
        self.diagnostics.push(
            Diagnostic::new(DiagnosticKind::CompilerBug, message, loc).with_basic_line(line),
        );
    }

    fn fresh(&mut self, prefix: &str) -> String {
        self.seq += 1;
        format!("{}{}", prefix, self.seq)
    }

    fn temp(&mut self, prefix: &str) -> String {
        let name = self.fresh(prefix);
        self.temps.insert(name.clone());
        name
    }

    fn label_of(block: &BasicBlock<'_>) -> String {
        match &block.label {
            Some(name) => name.clone(),
            None => format!("__B{}", block.id.0),
        }
    }

    fn emit_region(&mut self, cfg: &Cfg<'_>, is_proc: bool) -> Vec<Instr> {
        self.out = Vec::new();
        let order = reverse_post_order(cfg);
        for (idx, id) in order.iter().enumerate() {
            let block = cfg.block(*id);
            let next = order.get(idx + 1).copied();
            self.out.push(Instr::Label(Self::label_of(block)));
            for entry in &block.stmts {
                self.emit_block_stmt(entry);
            }
            self.emit_terminator(cfg, block, next, is_proc);
        }
        std::mem::take(&mut self.out)
    }

    fn emit_block_stmt(&mut self, entry: &BlockStmt<'_>) {
        match entry {
            BlockStmt::Stmt(stmt) => self.emit_stmt(stmt),
            BlockStmt::ForInit {
                loop_id,
                var,
                from,
                to,
                step,
            } => {
                let limit = format!("__FL{}", loop_id);
                let stepv = format!("__FS{}", loop_id);
                self.temps.insert(limit.clone());
                self.temps.insert(stepv.clone());
                self.emit_expr(from);
                self.out.push(Instr::Store(var.key()));
                self.emit_expr(to);
                self.out.push(Instr::Store(limit));
                match step {
                    Some(step) => self.emit_expr(step),
                    None => self.out.push(Instr::PushInt(1)),
                }
                self.out.push(Instr::Store(stepv));
            }
            BlockStmt::ForIncr { loop_id, var } => {
                self.out.push(Instr::Load(var.key()));
                self.out.push(Instr::Load(format!("__FS{}", loop_id)));
                self.out.push(Instr::Add);
                self.out.push(Instr::Store(var.key()));
            }
        }
    }

    fn emit_terminator(
        &mut self,
        cfg: &Cfg<'_>,
        block: &BasicBlock<'_>,
        next: Option<BlockId>,
        is_proc: bool,
    ) {
        let label = |id: BlockId| Self::label_of(cfg.block(id));
        match &block.terminator {
            Terminator::FallThrough(target) => {
                if next != Some(*target) {
                    self.out.push(Instr::Jmp(label(*target)));
                }
            }
            Terminator::Jump { target, back_edge } => {
                if *back_edge && self.yield_on_backedge {
                    self.out.push(Instr::YieldCheck);
                }
                if next != Some(*target) || *back_edge {
                    self.out.push(Instr::Jmp(label(*target)));
                }
            }
            Terminator::Branch {
                cond,
                then_block,
                else_block,
                back_edge,
            } => {
                if *back_edge && self.yield_on_backedge {
                    self.out.push(Instr::YieldCheck);
                }
                self.emit_expr(cond);
                if next == Some(*then_block) {
                    self.out.push(Instr::Jz(label(*else_block)));
                } else {
                    self.out.push(Instr::Jnz(label(*then_block)));
                    if next != Some(*else_block) {
                        self.out.push(Instr::Jmp(label(*else_block)));
                    }
                }
            }
            Terminator::ForCond {
                loop_id,
                var,
                body,
                exit,
            } => {
                let limit = format!("__FL{}", loop_id);
                let stepv = format!("__FS{}", loop_id);
                // (step >= 0 AND var <= limit) OR (step < 0 AND var >= limit)
                self.out.push(Instr::Load(stepv.clone()));
                self.out.push(Instr::PushInt(0));
                self.out.push(Instr::Ge);
                self.out.push(Instr::Load(var.key()));
                self.out.push(Instr::Load(limit.clone()));
                self.out.push(Instr::Le);
                self.out.push(Instr::LogAnd);
                self.out.push(Instr::Load(stepv));
                self.out.push(Instr::PushInt(0));
                self.out.push(Instr::Lt);
                self.out.push(Instr::Load(var.key()));
                self.out.push(Instr::Load(limit));
                self.out.push(Instr::Ge);
                self.out.push(Instr::LogAnd);
                self.out.push(Instr::LogOr);
                self.out.push(Instr::Jz(label(*exit)));
                if next != Some(*body) {
                    self.out.push(Instr::Jmp(label(*body)));
                }
            }
            Terminator::Multi {
                selector,
                targets,
                default,
                gosub,
            } => {
                let sel = self.temp("__ON");
                self.emit_expr(selector);
                if expr_type(selector, self.symbols, self.constants, self.registry,
                    self.current_proc.as_deref())
                    != ValueType::Integer
                {
                    self.out.push(Instr::Invoke {
                        target: "math.floor".to_string(),
                        arity: 1,
                        returns: true,
                        pure: true,
                    });
                }
                self.out.push(Instr::Store(sel.clone()));
                for (i, target) in targets.iter().enumerate() {
                    self.out.push(Instr::Load(sel.clone()));
                    self.out.push(Instr::PushInt(i as i64 + 1));
                    self.out.push(Instr::Eq);
                    if *gosub {
                        let skip = self.fresh("__ONG");
                        self.out.push(Instr::Jz(skip.clone()));
                        self.out.push(Instr::Gosub {
                            target: label(*target),
                            resume: label(*default),
                        });
                        self.out.push(Instr::Label(skip));
                    } else {
                        self.out.push(Instr::Jnz(label(*target)));
                    }
                }
                if next != Some(*default) {
                    self.out.push(Instr::Jmp(label(*default)));
                }
            }
            Terminator::Select {
                selector,
                arms,
                default,
            } => {
                let sel = self.temp("__SEL");
                self.emit_expr(selector);
                self.out.push(Instr::Store(sel.clone()));
                for (tests, target) in arms {
                    for test in *tests {
                        self.out.push(Instr::Load(sel.clone()));
                        match test {
                            CaseTest::Value(value) => {
                                self.emit_expr(value);
                                self.out.push(Instr::Eq);
                            }
                            CaseTest::Is(op, value) => {
                                self.emit_expr(value);
                                self.out.push(comparison_instr(*op));
                            }
                        }
                        self.out.push(Instr::Jnz(label(*target)));
                    }
                }
                if next != Some(*default) {
                    self.out.push(Instr::Jmp(label(*default)));
                }
            }
            Terminator::Gosub { target, return_to } => {
                self.out.push(Instr::Gosub {
                    target: label(*target),
                    resume: label(*return_to),
                });
            }
            Terminator::Return => {
                if is_proc {
                    self.out.push(Instr::Ret);
                } else {
                    self.out.push(Instr::GosubRet);
                }
            }
            Terminator::Halt => {
                self.out.push(Instr::Halt);
            }
        }
    }

    // -- statements --------------------------------------------------------

    fn emit_stmt(&mut self, stmt: &Statement) {
        if let Some(line) = stmt.basic_line
            && self.current_line != Some(line)
        {
            self.out.push(Instr::Line(line));
            self.current_line = Some(line);
        }

        match &stmt.kind {
            StmtKind::Assign { target, value } => {
                self.emit_assignment(target, value);
            }
            StmtKind::Print { channel, items } => self.emit_print(channel.as_ref(), items),
            StmtKind::Input {
                prompt,
                channel,
                targets,
            } => self.emit_input(prompt.as_deref(), channel.as_ref(), targets),
            StmtKind::LineInput { channel, target } => {
                match channel {
                    Some(ch) => {
                        self.emit_expr(ch);
                        self.out.push(Instr::Invoke {
                            target: "file_line_input".to_string(),
                            arity: 1,
                            returns: true,
                            pure: false,
                        });
                    }
                    None => {
                        self.out.push(Instr::Invoke {
                            target: "terminal_line_input".to_string(),
                            arity: 0,
                            returns: true,
                            pure: false,
                        });
                    }
                }
                self.emit_store_lvalue_from_stack(target);
            }
            StmtKind::Read(targets) => {
                for target in targets {
                    self.emit_lvalue_indices(target);
                    let read = match self.lvalue_type(target) {
                        ValueType::Integer => Instr::ReadInt,
                        ValueType::String => Instr::ReadStr,
                        _ => Instr::ReadReal,
                    };
                    self.out.push(read);
                    self.emit_store_after_indices(target);
                }
            }
            StmtKind::Restore(target) => {
                let instr = match target {
                    RestoreTarget::Start => Instr::Restore,
                    RestoreTarget::Line(n) => Instr::RestoreLine(*n),
                    RestoreTarget::Label(name) => Instr::RestoreLabel(name.to_uppercase()),
                };
                self.out.push(instr);
            }
            StmtKind::Dim(decls) => {
                for decl in decls {
                    for dim in &decl.dims {
                        self.emit_expr(dim);
                    }
                    self.out.push(Instr::DimArray {
                        name: decl.var.key(),
                        arity: decl.dims.len(),
                        preserve: false,
                    });
                }
            }
            StmtKind::Redim { preserve, decls } => {
                for decl in decls {
                    for dim in &decl.dims {
                        self.emit_expr(dim);
                    }
                    self.out.push(Instr::DimArray {
                        name: decl.var.key(),
                        arity: decl.dims.len(),
                        preserve: *preserve,
                    });
                }
            }
            StmtKind::Erase(vars) => {
                for var in vars {
                    self.out.push(Instr::EraseArray(var.key()));
                }
            }
            StmtKind::Command { name, args } => {
                for arg in args {
                    self.emit_expr(arg);
                }
                match self.registry.command(name) {
                    Some(def) => {
                        let returns = def.ret != basic_core::ReturnType::None;
                        self.out.push(Instr::Invoke {
                            target: def.target.clone(),
                            arity: args.len(),
                            returns,
                            pure: def.pure,
                        });
                        if returns {
                            self.out.push(Instr::Pop);
                        }
                    }
                    None => self.bug(
                        stmt.loc,
                        stmt.basic_line,
                        format!("Command '{}' vanished from the registry", name),
                    ),
                }
            }
            StmtKind::CallSub { name, args } => {
                for arg in args {
                    self.emit_expr(arg);
                }
                self.out.push(Instr::Call {
                    name: name.clone(),
                    arity: args.len(),
                    returns: false,
                });
            }
            StmtKind::Open { path, mode, number } => {
                self.emit_expr(path);
                self.out.push(Instr::PushStr(mode.as_str().to_string()));
                self.emit_expr(number);
                self.out.push(Instr::Invoke {
                    target: "file_open".to_string(),
                    arity: 3,
                    returns: false,
                    pure: false,
                });
            }
            StmtKind::Close { number } => match number {
                Some(n) => {
                    self.emit_expr(n);
                    self.out.push(Instr::Invoke {
                        target: "file_close".to_string(),
                        arity: 1,
                        returns: false,
                        pure: false,
                    });
                }
                None => {
                    self.out.push(Instr::Invoke {
                        target: "file_close_all".to_string(),
                        arity: 0,
                        returns: false,
                        pure: false,
                    });
                }
            },
            StmtKind::Write { channel, items } => {
                let ch = self.temp("__CH");
                self.emit_expr(channel);
                self.out.push(Instr::Store(ch.clone()));
                for (i, item) in items.iter().enumerate() {
                    self.out.push(Instr::Load(ch.clone()));
                    self.emit_expr(item);
                    self.out.push(Instr::PushInt((i == 0) as i64));
                    self.out.push(Instr::Invoke {
                        target: "file_write_item".to_string(),
                        arity: 3,
                        returns: false,
                        pure: false,
                    });
                }
                self.out.push(Instr::Load(ch));
                self.out.push(Instr::Invoke {
                    target: "file_write_nl".to_string(),
                    arity: 1,
                    returns: false,
                    pure: false,
                });
            }
            StmtKind::Timer {
                every,
                amount,
                unit,
                handler,
            } => {
                self.emit_expr(amount);
                if *unit == TimeUnit::Secs {
                    self.out.push(Instr::PushInt(1000));
                    self.out.push(Instr::Mul);
                }
                let instr = match (every, unit) {
                    (false, TimeUnit::Frames) => Instr::AfterFrames(handler.clone()),
                    (true, TimeUnit::Frames) => Instr::EveryFrames(handler.clone()),
                    (false, _) => Instr::AfterMs(handler.clone()),
                    (true, _) => Instr::EveryMs(handler.clone()),
                };
                self.out.push(instr);
            }
            StmtKind::StopTimer(target) => match target {
                StopTimerTarget::All => self.out.push(Instr::StopTimerAll),
                StopTimerTarget::Handler(name) => {
                    self.out.push(Instr::StopTimerNamed(name.clone()))
                }
                StopTimerTarget::Id(expr) => {
                    self.emit_expr(expr);
                    self.out.push(Instr::StopTimerId);
                }
            },
            StmtKind::Rem | StmtKind::Const { .. } => {}
            _ => {
                // Control statements were lowered by the CFG builder; one
                // surviving here is an invariant violation.
                self.bug(
                    stmt.loc,
                    stmt.basic_line,
                    "A control statement escaped CFG lowering".to_string(),
                );
            }
        }
    }

    fn emit_assignment(&mut self, target: &LValue, value: &Expr) {
        match target {
            LValue::Var(var) => {
                self.emit_expr(value);
                self.out.push(Instr::Store(var.key()));
            }
            LValue::Array(var, indices) => {
                for index in indices {
                    self.emit_expr(index);
                }
                self.emit_expr(value);
                self.out.push(Instr::StoreIndex {
                    name: var.key(),
                    arity: indices.len(),
                });
            }
        }
    }

    fn emit_print(&mut self, channel: Option<&Expr>, items: &[PrintItem]) {
        let file_channel = channel.map(|ch| {
            let temp = self.temp("__CH");
            self.emit_expr(ch);
            self.out.push(Instr::Store(temp.clone()));
            temp
        });

        let invoke = |target: &str, arity: usize| Instr::Invoke {
            target: target.to_string(),
            arity,
            returns: false,
            pure: false,
        };

        for item in items {
            let is_string = self.expr_is_string(&item.expr);
            match &file_channel {
                Some(ch) => {
                    self.out.push(Instr::Load(ch.clone()));
                    self.emit_expr(&item.expr);
                    self.out.push(invoke("file_print", 2));
                }
                None => {
                    self.emit_expr(&item.expr);
                    if is_string {
                        self.out.push(invoke("terminal_print_str", 1));
                    } else {
                        self.out.push(invoke("terminal_print_num", 1));
                    }
                }
            }
            if item.sep == Some(PrintSep::Comma) {
                match &file_channel {
                    Some(ch) => {
                        self.out.push(Instr::Load(ch.clone()));
                        self.out.push(Instr::PushStr("\t".to_string()));
                        self.out.push(invoke("file_print", 2));
                    }
                    None => self.out.push(invoke("terminal_print_tab", 0)),
                }
            }
        }

        let newline = items.last().map(|item| item.sep.is_none()).unwrap_or(true);
        if newline {
            match &file_channel {
                Some(ch) => {
                    self.out.push(Instr::Load(ch.clone()));
                    self.out.push(invoke("file_print_nl", 1));
                }
                None => self.out.push(invoke("terminal_print_nl", 0)),
            }
        }
    }

    fn emit_input(&mut self, prompt: Option<&str>, channel: Option<&Expr>, targets: &[LValue]) {
        if let Some(text) = prompt {
            self.out.push(Instr::PushStr(text.to_string()));
            self.out.push(Instr::Invoke {
                target: "terminal_print_str".to_string(),
                arity: 1,
                returns: false,
                pure: false,
            });
        }
        let file_channel = channel.map(|ch| {
            let temp = self.temp("__CH");
            self.emit_expr(ch);
            self.out.push(Instr::Store(temp.clone()));
            temp
        });

        for target in targets {
            self.emit_lvalue_indices(target);
            let is_string = self.lvalue_type(target) == ValueType::String;
            match &file_channel {
                Some(ch) => {
                    self.out.push(Instr::Load(ch.clone()));
                    self.out.push(Instr::Invoke {
                        target: if is_string {
                            "file_input_str".to_string()
                        } else {
                            "file_input_num".to_string()
                        },
                        arity: 1,
                        returns: true,
                        pure: false,
                    });
                }
                None => {
                    self.out.push(Instr::Invoke {
                        target: if is_string {
                            "terminal_input_str".to_string()
                        } else {
                            "terminal_input_num".to_string()
                        },
                        arity: 0,
                        returns: true,
                        pure: false,
                    });
                }
            }
            self.emit_store_after_indices(target);
        }
    }

    /// Push an lvalue's indices (a no-op for scalars).
    fn emit_lvalue_indices(&mut self, target: &LValue) {
        if let LValue::Array(_, indices) = target {
            for index in indices {
                self.emit_expr(index);
            }
        }
    }

    /// Store the top of stack into an lvalue whose indices are already below
    /// it on the stack.
    fn emit_store_after_indices(&mut self, target: &LValue) {
        match target {
            LValue::Var(var) => self.out.push(Instr::Store(var.key())),
            LValue::Array(var, indices) => self.out.push(Instr::StoreIndex {
                name: var.key(),
                arity: indices.len(),
            }),
        }
    }

    /// Store the top of stack into an lvalue, emitting indices first (used
    /// when the value was produced before the indices could be).
    fn emit_store_lvalue_from_stack(&mut self, target: &LValue) {
        match target {
            LValue::Var(var) => self.out.push(Instr::Store(var.key())),
            LValue::Array(var, indices) => {
                // Value is on top; spill it to a temp to reorder under the
                // indices.
                let temp = self.temp("__T");
                self.out.push(Instr::Store(temp.clone()));
                for index in indices {
                    self.emit_expr(index);
                }
                self.out.push(Instr::Load(temp));
                self.out.push(Instr::StoreIndex {
                    name: var.key(),
                    arity: indices.len(),
                });
            }
        }
    }

    fn lvalue_type(&self, target: &LValue) -> ValueType {
        self.symbols
            .var_type(&target.var().key(), self.current_proc.as_deref())
    }

    fn expr_is_string(&self, expr: &Expr) -> bool {
        expr_type(
            expr,
            self.symbols,
            self.constants,
            self.registry,
            self.current_proc.as_deref(),
        ) == ValueType::String
    }

    // -- expressions -------------------------------------------------------

    fn emit_expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::IntLit(n) => self.out.push(Instr::PushInt(*n)),
            ExprKind::RealLit(d) => self.out.push(Instr::PushReal(*d)),
            ExprKind::StrLit(s) => self.out.push(Instr::PushStr(s.clone())),
            ExprKind::ConstRef(index, _) => self.out.push(Instr::LoadConst(*index)),
            ExprKind::Var(var) => self.out.push(Instr::Load(var.key())),
            ExprKind::ArrayRef(var, indices) => {
                for index in indices {
                    self.emit_expr(index);
                }
                self.out.push(Instr::LoadIndex {
                    name: var.key(),
                    arity: indices.len(),
                });
            }
            ExprKind::FnCall { name, args } => {
                for arg in args {
                    self.emit_expr(arg);
                }
                match self.registry.function(name) {
                    Some(def) => self.out.push(Instr::Invoke {
                        target: def.target.clone(),
                        arity: args.len(),
                        returns: true,
                        pure: def.pure,
                    }),
                    None => self.bug(
                        expr.loc,
                        self.current_line,
                        format!("Function '{}' vanished from the registry", name),
                    ),
                }
            }
            ExprKind::UserCall { name, args } => {
                for arg in args {
                    self.emit_expr(arg);
                }
                self.out.push(Instr::Call {
                    name: name.clone(),
                    arity: args.len(),
                    returns: true,
                });
            }
            ExprKind::Unary(op, operand) => {
                self.emit_expr(operand);
                let instr = match op {
                    UnOp::Neg => Instr::Neg,
                    UnOp::Not => match self.options.logic_mode {
                        LogicMode::Bitwise => Instr::BitNot,
                        LogicMode::Logical => Instr::LogNot,
                    },
                };
                self.out.push(instr);
            }
            ExprKind::Binary(op, lhs, rhs) => {
                self.emit_expr(lhs);
                self.emit_expr(rhs);
                self.out.push(self.binary_instr(*op, lhs));
            }
            ExprKind::IndexOrCall(var, _) => {
                self.bug(
                    expr.loc,
                    self.current_line,
                    format!("Unresolved reference {} escaped validation", var.key()),
                );
            }
        }
    }

    fn binary_instr(&self, op: BinOp, lhs: &Expr) -> Instr {
        match op {
            BinOp::Add => {
                if self.expr_is_string(lhs) {
                    Instr::Concat
                } else {
                    Instr::Add
                }
            }
            BinOp::Sub => Instr::Sub,
            BinOp::Mul => Instr::Mul,
            BinOp::Div => Instr::Div,
            BinOp::IntDiv => Instr::IntDiv,
            BinOp::Mod => Instr::Mod,
            BinOp::Pow => Instr::Pow,
            BinOp::Eq => Instr::Eq,
            BinOp::Ne => Instr::Ne,
            BinOp::Lt => Instr::Lt,
            BinOp::Le => Instr::Le,
            BinOp::Gt => Instr::Gt,
            BinOp::Ge => Instr::Ge,
            BinOp::And | BinOp::Or | BinOp::Xor | BinOp::Eqv | BinOp::Imp => {
                match self.options.logic_mode {
                    LogicMode::Bitwise => match op {
                        BinOp::And => Instr::BitAnd,
                        BinOp::Or => Instr::BitOr,
                        BinOp::Xor => Instr::BitXor,
                        BinOp::Eqv => Instr::BitEqv,
                        _ => Instr::BitImp,
                    },
                    LogicMode::Logical => match op {
                        BinOp::And => Instr::LogAnd,
                        BinOp::Or => Instr::LogOr,
                        BinOp::Xor => Instr::LogXor,
                        BinOp::Eqv => Instr::LogEqv,
                        _ => Instr::LogImp,
                    },
                }
            }
        }
    }
}

fn comparison_instr(op: BinOp) -> Instr {
    match op {
        BinOp::Eq => Instr::Eq,
        BinOp::Ne => Instr::Ne,
        BinOp::Lt => Instr::Lt,
        BinOp::Le => Instr::Le,
        BinOp::Gt => Instr::Gt,
        BinOp::Ge => Instr::Ge,
        _ => Instr::Eq,
    }
}

/// Invariant check: within every body, the simulated stack depth never goes
/// negative and returns to zero at every control transfer.
fn verify_balance(program: &IrProgram, diagnostics: &mut Vec<Diagnostic>) {
    let mut check = |name: &str, instrs: &[Instr]| {
        let mut depth: isize = 0;
        let mut line: Option<u32> = None;
        for instr in instrs {
            if let Instr::Line(n) = instr {
                line = Some(*n);
            }
            depth += instr.stack_effect();
            if depth < 0 {
                diagnostics.push(
                    Diagnostic::new(
                        DiagnosticKind::CompilerBug,
                        format!("Stack under-run in {} at '{}'", name, instr),
                        crate::token::SourceLoc::default(),
                    )
                    .with_basic_line(line),
                );
                return;
            }
            if instr.is_control() && depth != 0 {
                diagnostics.push(
                    Diagnostic::new(
                        DiagnosticKind::CompilerBug,
                        format!(
                            "Nonzero stack depth ({}) at control transfer '{}' in {}",
                            depth, instr, name
                        ),
                        crate::token::SourceLoc::default(),
                    )
                    .with_basic_line(line),
                );
                return;
            }
        }
    };
    check("main", &program.main);
    for proc in &program.procs {
        check(&proc.name, &proc.body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer;
    use crate::parser::Parser;
    use crate::semantic::SemanticAnalyzer;
    use basic_core::{CommandRegistry, builtins};

    fn lower(src: &str) -> IrGenOutput {
        let mut reg = CommandRegistry::new();
        builtins::register_core_functions(&mut reg).unwrap();
        builtins::register_core_commands(&mut reg).unwrap();
        let mut constants = ConstantsStore::with_predefined();
        let lexed = lexer::tokenize(src, &reg, 50);
        let parsed = Parser::new(lexed.tokens, &lexed.mapping, &mut constants, &reg, 50).parse();
        assert!(parsed.diagnostics.is_empty(), "{:?}", parsed.diagnostics);
        let mut program = parsed.program;
        let sem = SemanticAnalyzer::new(&parsed.options, &reg, &constants).analyze(&mut program);
        assert!(
            sem.diagnostics.iter().all(|d| !d.is_error()),
            "{:?}",
            sem.diagnostics
        );
        let (cfg, cfg_diags) = crate::cfg::build(&program);
        assert!(cfg_diags.is_empty(), "{:?}", cfg_diags);
        generate(
            &cfg,
            &sem.symbols,
            &constants,
            &reg,
            parsed.options,
            &CompilerConfig::default(),
            DataSegment::new(),
        )
    }

    fn labels_of(instrs: &[Instr]) -> Vec<String> {
        instrs
            .iter()
            .filter_map(|i| match i {
                Instr::Label(l) => Some(l.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn assignment_lowers_to_stack_code() {
        let out = lower("10 X = 1 + 2\n");
        assert!(out.diagnostics.is_empty(), "{:?}", out.diagnostics);
        let body: Vec<String> = out.program.main.iter().map(|i| i.to_string()).collect();
        let joined = body.join("\n");
        assert!(joined.contains("push_int 1"));
        assert!(joined.contains("push_int 2"));
        assert!(joined.contains("add"));
        assert!(joined.contains("store X"));
    }

    #[test]
    fn every_jump_target_has_exactly_one_label() {
        let out = lower(
            "10 FOR I = 1 TO 3\n20 IF I = 2 THEN PRINT I\n30 NEXT I\n40 GOTO L60\n50 PRINT 0\n60 L60: PRINT 1\n",
        );
        assert!(out.diagnostics.is_empty(), "{:?}", out.diagnostics);
        let labels = labels_of(&out.program.main);
        let mut sorted = labels.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(labels.len(), sorted.len(), "duplicate labels");
        for instr in &out.program.main {
            let target = match instr {
                Instr::Jmp(l) | Instr::Jz(l) | Instr::Jnz(l) => Some(l),
                Instr::Gosub { target, .. } => Some(target),
                _ => None,
            };
            if let Some(t) = target {
                assert!(labels.contains(t), "jump to unknown label {}", t);
            }
        }
    }

    #[test]
    fn stack_depth_is_balanced() {
        let out = lower(
            "10 DIM A(3)\n20 FOR I = 1 TO 3\n30 A(I) = I * I\n40 NEXT I\n50 PRINT A(1); A(2); A(3)\n",
        );
        assert!(out.diagnostics.is_empty(), "{:?}", out.diagnostics);
    }

    #[test]
    fn read_emits_typed_reads() {
        let out = lower("10 READ A%, B, C$\n");
        let dump = out.program.dump();
        assert!(dump.contains("read_int"));
        assert!(dump.contains("read_real"));
        assert!(dump.contains("read_str"));
    }

    #[test]
    fn restore_targets_lower_distinctly() {
        let out = lower("10 RESTORE\n20 RESTORE 10\n30 RESTORE SPOT\n40 SPOT: PRINT 1\n");
        let dump = out.program.dump();
        assert!(dump.contains("restore\n"));
        assert!(dump.contains("restore_to_line 10"));
        assert!(dump.contains("restore_to_label SPOT"));
    }

    #[test]
    fn back_edge_gets_yield_check() {
        let out = lower("10 WHILE A < 3\n20 A = A + 1\n30 WEND\n");
        assert!(out.program.main.contains(&Instr::YieldCheck));
    }

    #[test]
    fn timer_units_convert_to_ms() {
        let out = lower("10 AFTER 2 SECS DONE\n20 SUB DONE : ENDSUB\n");
        let dump = out.program.dump();
        assert!(dump.contains("push_int 1000"));
        assert!(dump.contains("after_ms DONE"));
    }

    #[test]
    fn subs_become_procs() {
        let out = lower("10 SUB TICK : T% = T% + 1 : ENDSUB\n20 PRINT 1\n");
        assert_eq!(out.program.procs.len(), 1);
        assert_eq!(out.program.procs[0].name, "TICK");
        assert!(out.program.procs[0].body.iter().any(|i| matches!(i, Instr::Ret)));
    }

    #[test]
    fn line_restore_points_are_aliased_as_labels() {
        let mut data = DataSegment::new();
        data.push(basic_core::Value::Int(1));
        data.add_line_restore(20, 0);

        let mut reg = CommandRegistry::new();
        builtins::register_core_functions(&mut reg).unwrap();
        builtins::register_core_commands(&mut reg).unwrap();
        let mut constants = ConstantsStore::with_predefined();
        let lexed = lexer::tokenize("10 READ A%\n", &reg, 50);
        let parsed = Parser::new(lexed.tokens, &lexed.mapping, &mut constants, &reg, 50).parse();
        let mut program = parsed.program;
        let sem = SemanticAnalyzer::new(&parsed.options, &reg, &constants).analyze(&mut program);
        let (cfg, _) = crate::cfg::build(&program);
        let out = generate(
            &cfg,
            &sem.symbols,
            &constants,
            &reg,
            parsed.options,
            &CompilerConfig::default(),
            data,
        );
        assert_eq!(out.program.data.restore_index_for_label("L20"), Some(0));
    }

    #[test]
    fn on_goto_emits_dispatch_chain() {
        let out = lower("10 ON X GOTO A1, A2\n20 END\n30 A1: END\n40 A2: END\n");
        let dump = out.program.dump();
        assert!(dump.contains("push_int 1"));
        assert!(dump.contains("push_int 2"));
        assert!(dump.matches("jnz").count() >= 2);
    }
}
