//! Control-flow graph construction.
//!
//! Splits the main program and each sub/function body into basic blocks with
//! typed terminators. Blocks live in an arena (`Vec<BasicBlock>`) and refer
//! to one another by [`BlockId`]; statements are borrowed from the AST, never
//! mutated. A new block begins at the program start, at every label, after
//! every branch, at loop headers and at case arms. Unreachable blocks are
//! marked, not deleted.

use crate::ast::*;
use crate::diagnostics::{Diagnostic, DiagnosticKind};
use crate::semantic::ProcKind;
use std::collections::HashMap;

/// Index-based handle into a [`Cfg`]'s block arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub usize);

/// A block entry: a plain statement or a piece of loop bookkeeping the
/// builder synthesized while flattening a `FOR`.
#[derive(Debug)]
pub enum BlockStmt<'a> {
    Stmt(&'a Statement),
    /// Evaluate start/limit/step and initialize the counter.
    ForInit {
        loop_id: usize,
        var: &'a VarRef,
        from: &'a Expr,
        to: &'a Expr,
        step: Option<&'a Expr>,
    },
    /// Advance the counter by the loop's step.
    ForIncr { loop_id: usize, var: &'a VarRef },
}

/// How a basic block ends.
#[derive(Debug)]
pub enum Terminator<'a> {
    /// Sequential flow into another block.
    FallThrough(BlockId),
    /// Unconditional jump. `back_edge` marks loop back-edges, where the
    /// emitter inserts a yield check.
    Jump { target: BlockId, back_edge: bool },
    /// Two-way conditional on an expression.
    Branch {
        cond: &'a Expr,
        then_block: BlockId,
        else_block: BlockId,
        back_edge: bool,
    },
    /// Counted-loop continuation test against the loop's limit/step.
    ForCond {
        loop_id: usize,
        var: &'a VarRef,
        body: BlockId,
        exit: BlockId,
    },
    /// `ON e GOTO/GOSUB` - 1-based selection, out of range falls through.
    Multi {
        selector: &'a Expr,
        targets: Vec<BlockId>,
        default: BlockId,
        gosub: bool,
    },
    /// `SELECT CASE` dispatch: arms tested top to bottom.
    Select {
        selector: &'a Expr,
        arms: Vec<(&'a [CaseTest], BlockId)>,
        default: BlockId,
    },
    /// `GOSUB`: jump to `target`, resuming at `return_to` on RETURN.
    Gosub { target: BlockId, return_to: BlockId },
    /// `RETURN` from a GOSUB.
    Return,
    /// `END` or falling off the end of the program.
    Halt,
}

impl<'a> Terminator<'a> {
    /// Every block this terminator can transfer control to.
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::FallThrough(t) => vec![*t],
            Terminator::Jump { target, .. } => vec![*target],
            Terminator::Branch {
                then_block,
                else_block,
                ..
            } => vec![*then_block, *else_block],
            Terminator::ForCond { body, exit, .. } => vec![*body, *exit],
            Terminator::Multi {
                targets, default, ..
            } => {
                let mut all = targets.clone();
                all.push(*default);
                all
            }
            Terminator::Select { arms, default, .. } => {
                let mut all: Vec<BlockId> = arms.iter().map(|(_, b)| *b).collect();
                all.push(*default);
                all
            }
            Terminator::Gosub { target, return_to } => vec![*target, *return_to],
            Terminator::Return | Terminator::Halt => Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct BasicBlock<'a> {
    pub id: BlockId,
    /// Source label attached to this block, if any.
    pub label: Option<String>,
    pub stmts: Vec<BlockStmt<'a>>,
    pub terminator: Terminator<'a>,
    pub reachable: bool,
}

#[derive(Debug)]
pub struct Cfg<'a> {
    pub entry: BlockId,
    pub blocks: Vec<BasicBlock<'a>>,
}

impl<'a> Cfg<'a> {
    pub fn block(&self, id: BlockId) -> &BasicBlock<'a> {
        &self.blocks[id.0]
    }
}

/// A sub or function body with its own graph.
#[derive(Debug)]
pub struct ProcCfg<'a> {
    pub name: String,
    pub kind: ProcKind,
    pub params: Vec<VarRef>,
    pub ret: Option<ValueType>,
    pub cfg: Cfg<'a>,
}

/// A single-expression `DEF FN` body.
#[derive(Debug)]
pub struct DefFnBody<'a> {
    pub name: &'a VarRef,
    pub params: &'a [VarRef],
    pub body: &'a Expr,
}

/// The whole program's graphs: main plus one per sub/function.
#[derive(Debug)]
pub struct ProgramCfg<'a> {
    pub main: Cfg<'a>,
    pub procs: Vec<ProcCfg<'a>>,
    pub def_fns: Vec<DefFnBody<'a>>,
}

/// Loop context for EXIT and back-edge wiring.
struct LoopFrame {
    kind: LoopKind,
    exit: BlockId,
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum LoopKind {
    For,
    While,
    Do,
}

pub struct CfgBuilder<'a> {
    blocks: Vec<BasicBlock<'a>>,
    current: BlockId,
    labels: HashMap<String, BlockId>,
    loops: Vec<LoopFrame>,
    next_loop_id: usize,
    diagnostics: Vec<Diagnostic>,
}

/// Build the CFGs for a validated program. Internal inconsistencies (which
/// validation should have excluded) surface as compiler-bug diagnostics.
pub fn build<'a>(program: &'a Program) -> (ProgramCfg<'a>, Vec<Diagnostic>) {
    let mut diagnostics = Vec::new();
    let mut procs = Vec::new();
    let mut def_fns = Vec::new();
    let mut main_stmts: Vec<&'a Statement> = Vec::new();

    for line in &program.lines {
        for stmt in &line.statements {
            match &stmt.kind {
                StmtKind::Sub { name, params, body } => {
                    let (cfg, mut diags) = build_region(body, true);
                    diagnostics.append(&mut diags);
                    procs.push(ProcCfg {
                        name: name.clone(),
                        kind: ProcKind::Sub,
                        params: params.clone(),
                        ret: None,
                        cfg,
                    });
                }
                StmtKind::Function { name, params, body } => {
                    let (cfg, mut diags) = build_region(body, true);
                    diagnostics.append(&mut diags);
                    procs.push(ProcCfg {
                        name: name.key(),
                        kind: ProcKind::Function,
                        params: params.clone(),
                        ret: Some(name.value_type()),
                        cfg,
                    });
                }
                StmtKind::DefFn { name, params, body } => {
                    def_fns.push(DefFnBody { name, params, body });
                }
                _ => main_stmts.push(stmt),
            }
        }
    }

    let (main, mut diags) = build_region_from_refs(&main_stmts, false);
    diagnostics.append(&mut diags);
    (
        ProgramCfg {
            main,
            procs,
            def_fns,
        },
        diagnostics,
    )
}

fn build_region<'a>(body: &'a [Statement], is_proc: bool) -> (Cfg<'a>, Vec<Diagnostic>) {
    let refs: Vec<&'a Statement> = body.iter().collect();
    build_region_from_refs(&refs, is_proc)
}

fn build_region_from_refs<'a>(
    stmts: &[&'a Statement],
    is_proc: bool,
) -> (Cfg<'a>, Vec<Diagnostic>) {
    let mut builder = CfgBuilder {
        blocks: Vec::new(),
        current: BlockId(0),
        labels: HashMap::new(),
        loops: Vec::new(),
        next_loop_id: 0,
        diagnostics: Vec::new(),
    };
    let entry = builder.new_block();
    builder.current = entry;
    for stmt in stmts {
        builder.lower_stmt(stmt);
    }
    // Falling off the end halts (main) or returns (proc bodies).
    let tail = if is_proc {
        Terminator::Return
    } else {
        Terminator::Halt
    };
    builder.set_terminator(tail);

    let mut cfg = Cfg {
        entry,
        blocks: builder.blocks,
    };
    mark_reachable(&mut cfg);
    (cfg, builder.diagnostics)
}

impl<'a> CfgBuilder<'a> {
    fn new_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len());
        self.blocks.push(BasicBlock {
            id,
            label: None,
            stmts: Vec::new(),
            // Placeholder until sealed; the final pass gives the last block
            // its real terminator.
            terminator: Terminator::Halt,
            reachable: false,
        });
        id
    }

    fn push(&mut self, entry: BlockStmt<'a>) {
        self.blocks[self.current.0].stmts.push(entry);
    }

    /// Seal the current block with `terminator` and open a fresh one.
    fn finish_with(&mut self, terminator: Terminator<'a>) -> BlockId {
        self.blocks[self.current.0].terminator = terminator;
        let next = self.new_block();
        self.current = next;
        next
    }

    fn set_terminator(&mut self, terminator: Terminator<'a>) {
        self.blocks[self.current.0].terminator = terminator;
    }

    /// Block for a label, creating a placeholder on first reference.
    fn label_block(&mut self, name: &str) -> BlockId {
        let key = name.to_uppercase();
        if let Some(id) = self.labels.get(&key) {
            return *id;
        }
        let id = BlockId(self.blocks.len());
        self.blocks.push(BasicBlock {
            id,
            label: Some(key.clone()),
            stmts: Vec::new(),
            terminator: Terminator::Halt,
            reachable: false,
        });
        self.labels.insert(key, id);
        id
    }

    fn lower_stmt(&mut self, stmt: &'a Statement) {
        match &stmt.kind {
            StmtKind::Rem | StmtKind::Const { .. } => {}
            StmtKind::Label(name) => {
                let block = self.label_block(name);
                self.set_terminator(Terminator::FallThrough(block));
                self.current = block;
            }
            StmtKind::Goto(target) => {
                let block = self.label_block(target);
                self.finish_with(Terminator::Jump {
                    target: block,
                    back_edge: false,
                });
            }
            StmtKind::Gosub(target) => {
                let target_block = self.label_block(target);
                let return_to = self.new_block();
                self.set_terminator(Terminator::Gosub {
                    target: target_block,
                    return_to,
                });
                self.current = return_to;
            }
            StmtKind::Return => {
                self.finish_with(Terminator::Return);
            }
            StmtKind::End => {
                self.finish_with(Terminator::Halt);
            }
            StmtKind::OnGoto {
                selector,
                targets,
                gosub,
            } => {
                let target_blocks: Vec<BlockId> =
                    targets.iter().map(|t| self.label_block(t)).collect();
                let default = self.new_block();
                self.set_terminator(Terminator::Multi {
                    selector,
                    targets: target_blocks,
                    default,
                    gosub: *gosub,
                });
                self.current = default;
            }
            StmtKind::If { arms, else_body } => self.lower_if(arms, else_body.as_deref()),
            StmtKind::Select {
                selector,
                arms,
                else_body,
            } => self.lower_select(selector, arms, else_body.as_deref()),
            StmtKind::For {
                var,
                from,
                to,
                step,
                body,
            } => self.lower_for(var, from, to, step.as_ref(), body),
            StmtKind::While { cond, body } => self.lower_while(cond, body),
            StmtKind::Repeat { body, until } => self.lower_repeat(body, until),
            StmtKind::DoLoop { pre, post, body } => self.lower_do(pre, post, body),
            StmtKind::Exit(kind) => self.lower_exit(*kind, stmt),
            // Everything else is straight-line.
            _ => self.push(BlockStmt::Stmt(stmt)),
        }
    }

    fn set_terminator_on(&mut self, id: BlockId, terminator: Terminator<'a>) {
        self.blocks[id.0].terminator = terminator;
    }

    fn lower_if(&mut self, arms: &'a [(Expr, Vec<Statement>)], else_body: Option<&'a [Statement]>) {
        let mut arm_ends: Vec<BlockId> = Vec::new();
        let mut next_test = self.current;

        for (cond, body) in arms {
            self.current = next_test;
            let then_block = self.new_block();
            let else_block = self.new_block();
            self.set_terminator(Terminator::Branch {
                cond,
                then_block,
                else_block,
                back_edge: false,
            });
            self.current = then_block;
            for s in body {
                self.lower_stmt(s);
            }
            arm_ends.push(self.current);
            next_test = else_block;
        }

        self.current = next_test;
        if let Some(body) = else_body {
            for s in body {
                self.lower_stmt(s);
            }
        }
        let after_else = self.current;
        let end_block = self.new_block();
        // The else chain (or empty else) falls through to the join point.
        self.set_terminator_on(after_else, Terminator::FallThrough(end_block));
        for arm_end in arm_ends {
            self.set_terminator_on(
                arm_end,
                Terminator::Jump {
                    target: end_block,
                    back_edge: false,
                },
            );
        }
        self.current = end_block;
    }

    fn lower_select(
        &mut self,
        selector: &'a Expr,
        arms: &'a [CaseArm],
        else_body: Option<&'a [Statement]>,
    ) {
        let dispatch = self.current;
        let mut arm_blocks = Vec::new();
        let mut arm_ends = Vec::new();

        for arm in arms {
            let block = self.new_block();
            self.current = block;
            for s in &arm.body {
                self.lower_stmt(s);
            }
            arm_blocks.push((arm.tests.as_slice(), block));
            arm_ends.push(self.current);
        }

        let default = self.new_block();
        self.current = default;
        if let Some(body) = else_body {
            for s in body {
                self.lower_stmt(s);
            }
        }
        let default_end = self.current;

        let end = self.new_block();
        self.set_terminator_on(default_end, Terminator::FallThrough(end));
        for arm_end in arm_ends {
            self.set_terminator_on(
                arm_end,
                Terminator::Jump {
                    target: end,
                    back_edge: false,
                },
            );
        }
        self.set_terminator_on(
            dispatch,
            Terminator::Select {
                selector,
                arms: arm_blocks,
                default,
            },
        );
        self.current = end;
    }

    fn lower_for(
        &mut self,
        var: &'a VarRef,
        from: &'a Expr,
        to: &'a Expr,
        step: Option<&'a Expr>,
        body: &'a [Statement],
    ) {
        let loop_id = self.next_loop_id;
        self.next_loop_id += 1;
        self.push(BlockStmt::ForInit {
            loop_id,
            var,
            from,
            to,
            step,
        });

        let prev = self.current;
        let cond_block = self.new_block();
        let body_block = self.new_block();
        let exit_block = self.new_block();
        self.set_terminator_on(prev, Terminator::FallThrough(cond_block));
        self.set_terminator_on(
            cond_block,
            Terminator::ForCond {
                loop_id,
                var,
                body: body_block,
                exit: exit_block,
            },
        );

        self.loops.push(LoopFrame {
            kind: LoopKind::For,
            exit: exit_block,
        });
        self.current = body_block;
        for s in body {
            self.lower_stmt(s);
        }
        self.loops.pop();

        // Footer: increment and loop back.
        self.push(BlockStmt::ForIncr { loop_id, var });
        self.set_terminator(Terminator::Jump {
            target: cond_block,
            back_edge: true,
        });
        self.current = exit_block;
    }

    fn lower_while(&mut self, cond: &'a Expr, body: &'a [Statement]) {
        let prev = self.current;
        let head = self.new_block();
        self.set_terminator_on(prev, Terminator::FallThrough(head));

        let body_block = self.new_block();
        let exit_block = self.new_block();
        self.set_terminator_on(
            head,
            Terminator::Branch {
                cond,
                then_block: body_block,
                else_block: exit_block,
                back_edge: false,
            },
        );

        self.loops.push(LoopFrame {
            kind: LoopKind::While,
            exit: exit_block,
        });
        self.current = body_block;
        for s in body {
            self.lower_stmt(s);
        }
        self.loops.pop();
        self.set_terminator(Terminator::Jump {
            target: head,
            back_edge: true,
        });
        self.current = exit_block;
    }

    fn lower_repeat(&mut self, body: &'a [Statement], until: &'a Expr) {
        let prev = self.current;
        let head = self.new_block();
        self.set_terminator_on(prev, Terminator::FallThrough(head));

        let exit_block = self.new_block();
        self.loops.push(LoopFrame {
            kind: LoopKind::Do,
            exit: exit_block,
        });
        self.current = head;
        for s in body {
            self.lower_stmt(s);
        }
        self.loops.pop();

        // Post-test: loop again while the condition is false.
        self.set_terminator(Terminator::Branch {
            cond: until,
            then_block: exit_block,
            else_block: head,
            back_edge: true,
        });
        self.current = exit_block;
    }

    fn lower_do(
        &mut self,
        pre: &'a Option<(DoCond, Expr)>,
        post: &'a Option<(DoCond, Expr)>,
        body: &'a [Statement],
    ) {
        let prev = self.current;
        let head = self.new_block();
        self.set_terminator_on(prev, Terminator::FallThrough(head));

        let body_block;
        let exit_block;
        match pre {
            Some((kind, cond)) => {
                body_block = self.new_block();
                exit_block = self.new_block();
                let (then_block, else_block) = match kind {
                    DoCond::While => (body_block, exit_block),
                    DoCond::Until => (exit_block, body_block),
                };
                self.set_terminator_on(
                    head,
                    Terminator::Branch {
                        cond,
                        then_block,
                        else_block,
                        back_edge: false,
                    },
                );
            }
            None => {
                body_block = head;
                exit_block = self.new_block();
            }
        }

        self.loops.push(LoopFrame {
            kind: LoopKind::Do,
            exit: exit_block,
        });
        self.current = if pre.is_some() { body_block } else { head };
        for s in body {
            self.lower_stmt(s);
        }
        self.loops.pop();

        match post {
            Some((kind, cond)) => {
                let (then_block, else_block) = match kind {
                    DoCond::While => (head, exit_block),
                    DoCond::Until => (exit_block, head),
                };
                self.set_terminator(Terminator::Branch {
                    cond,
                    then_block,
                    else_block,
                    back_edge: true,
                });
            }
            None => {
                self.set_terminator(Terminator::Jump {
                    target: head,
                    back_edge: true,
                });
            }
        }
        self.current = exit_block;
    }

    fn lower_exit(&mut self, kind: ExitKind, stmt: &'a Statement) {
        let wanted = match kind {
            ExitKind::For => Some(LoopKind::For),
            ExitKind::While => Some(LoopKind::While),
            ExitKind::Do => Some(LoopKind::Do),
            ExitKind::Sub | ExitKind::Function => None,
        };
        match wanted {
            Some(loop_kind) => {
                let exit = self
                    .loops
                    .iter()
                    .rev()
                    .find(|f| f.kind == loop_kind)
                    .map(|f| f.exit);
                match exit {
                    Some(exit) => {
                        self.finish_with(Terminator::Jump {
                            target: exit,
                            back_edge: false,
                        });
                    }
                    None => {
                        // Semantic analysis rejects this; reaching it here is
                        // a compiler bug.
                        self.diagnostics.push(
                            Diagnostic::new(
                                DiagnosticKind::CompilerBug,
                                "EXIT without enclosing loop survived validation".to_string(),
                                stmt.loc,
                            )
                            .with_basic_line(stmt.basic_line),
                        );
                    }
                }
            }
            None => {
                // EXIT SUB / EXIT FUNCTION leave the procedure body.
                self.finish_with(Terminator::Return);
            }
        }
    }
}

/// Mark every block reachable from the entry.
fn mark_reachable(cfg: &mut Cfg<'_>) {
    let mut worklist = vec![cfg.entry];
    while let Some(id) = worklist.pop() {
        if cfg.blocks[id.0].reachable {
            continue;
        }
        cfg.blocks[id.0].reachable = true;
        for succ in cfg.blocks[id.0].terminator.successors() {
            if !cfg.blocks[succ.0].reachable {
                worklist.push(succ);
            }
        }
    }
}
