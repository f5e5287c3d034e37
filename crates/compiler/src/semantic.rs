//! Two-pass semantic analysis.
//!
//! Pass 1 collects declarations: array dimensions, sub/function signatures,
//! labels and line numbers. Pass 2 validates every use: variable resolution
//! (implicit declaration unless `OPTION EXPLICIT`), array arity, assignment
//! coercibility, control-flow placement, branch targets, and registry call
//! signatures (filling optional parameters with their declared defaults).
//!
//! The analyzer also settles the two constructs the parser left ambiguous:
//! `name(args)` becomes an array reference or a user-function call, and a
//! bare identifier statement becomes a sub call or a `GOTO`.

use crate::ast::*;
use crate::config::CompilerOptions;
use crate::diagnostics::{Diagnostic, DiagnosticKind};
use crate::token::{SourceLoc, TypeSuffix};
use basic_core::{CommandDef, CommandRegistry, ConstantsStore, ParamType, ReturnType, Value};
use std::collections::{HashMap, HashSet};

/// What kind of callable a name resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcKind {
    Sub,
    Function,
    DefFn,
}

/// A user-defined sub, function or DEF FN.
#[derive(Debug, Clone)]
pub struct ProcInfo {
    /// Key with suffix for functions (`F%`), bare name for subs.
    pub name: String,
    pub kind: ProcKind,
    /// Parameter keys (suffix included) and their types, in order.
    pub params: Vec<(String, ValueType)>,
    /// Function return type (from the name's suffix); `None` for subs.
    pub ret: Option<ValueType>,
}

/// A scalar or array variable.
#[derive(Debug, Clone)]
pub struct VariableInfo {
    /// Suffix-qualified key, e.g. `A$`.
    pub key: String,
    pub ty: ValueType,
    /// Declared through `DIM`, or implicitly on first use?
    pub declared: bool,
    pub is_array: bool,
    /// Number of dimensions for arrays, 0 for scalars.
    pub dim_count: usize,
    /// Statically-known upper bounds, per axis, when the DIM used constants.
    pub dims: Vec<Option<i64>>,
}

/// Where a label was defined.
#[derive(Debug, Clone, Copy)]
pub struct LabelInfo {
    pub loc: SourceLoc,
    pub basic_line: Option<u32>,
}

/// Four disjoint maps: variables, procs, labels, and the line numbers seen in
/// the source (for validating numeric branch targets during recovery).
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    pub variables: HashMap<String, VariableInfo>,
    pub procs: HashMap<String, ProcInfo>,
    pub labels: HashMap<String, LabelInfo>,
    pub line_numbers: HashSet<u32>,
}

impl SymbolTable {
    /// Resolve a variable's type: proc parameters shadow globals, and an
    /// unknown name infers from its suffix.
    pub fn var_type(&self, key: &str, proc: Option<&str>) -> ValueType {
        if let Some(proc_name) = proc
            && let Some(info) = self.procs.get(proc_name)
        {
            if let Some((_, ty)) = info.params.iter().find(|(k, _)| k == key) {
                return *ty;
            }
            // Assignment to a function's own name sets the return value.
            if info.name == key
                && let Some(ret) = info.ret
            {
                return ret;
            }
        }
        if let Some(info) = self.variables.get(key) {
            return info.ty;
        }
        let suffix = key
            .chars()
            .last()
            .and_then(TypeSuffix::from_char)
            .unwrap_or(TypeSuffix::None);
        ValueType::from_suffix(suffix)
    }
}

/// Output of analysis: the symbol table plus diagnostics (errors and
/// warnings, each carrying the BASIC line).
#[derive(Debug)]
pub struct SemanticOutput {
    pub symbols: SymbolTable,
    pub diagnostics: Vec<Diagnostic>,
}

/// Loop context for EXIT placement checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopCtx {
    For,
    While,
    Do,
}

pub struct SemanticAnalyzer<'a> {
    options: &'a CompilerOptions,
    registry: &'a CommandRegistry,
    constants: &'a ConstantsStore,
    symbols: SymbolTable,
    diagnostics: Vec<Diagnostic>,
    /// Name of the sub/function being validated, if any.
    current_proc: Option<String>,
    loop_stack: Vec<LoopCtx>,
    referenced_labels: HashSet<String>,
}

impl<'a> SemanticAnalyzer<'a> {
    pub fn new(
        options: &'a CompilerOptions,
        registry: &'a CommandRegistry,
        constants: &'a ConstantsStore,
    ) -> Self {
        SemanticAnalyzer {
            options,
            registry,
            constants,
            symbols: SymbolTable::default(),
            diagnostics: Vec::new(),
            current_proc: None,
            loop_stack: Vec::new(),
            referenced_labels: HashSet::new(),
        }
    }

    pub fn analyze(mut self, program: &mut Program) -> SemanticOutput {
        self.collect(program);
        self.validate(program);
        self.warn_unused_labels();
        SemanticOutput {
            symbols: self.symbols,
            diagnostics: self.diagnostics,
        }
    }

    fn error(&mut self, stmt_line: Option<u32>, loc: SourceLoc, message: String) {
        self.diagnostics.push(
            Diagnostic::new(DiagnosticKind::SemanticError, message, loc)
                .with_basic_line(stmt_line),
        );
    }

    fn warn(&mut self, stmt_line: Option<u32>, loc: SourceLoc, message: String) {
        self.diagnostics.push(
            Diagnostic::new(DiagnosticKind::Warning, message, loc).with_basic_line(stmt_line),
        );
    }

    // -- pass 1: declaration collection ------------------------------------

    fn collect(&mut self, program: &Program) {
        for line in &program.lines {
            if let Some(n) = line.basic_line {
                self.symbols.line_numbers.insert(n);
            }
            for stmt in &line.statements {
                self.collect_stmt(stmt, 0);
            }
        }
    }

    fn collect_stmt(&mut self, stmt: &Statement, depth: usize) {
        let line = stmt.basic_line;
        if depth > 0
            && matches!(
                stmt.kind,
                StmtKind::Sub { .. } | StmtKind::Function { .. } | StmtKind::DefFn { .. }
            )
        {
            self.error(
                line,
                stmt.loc,
                "SUB/FUNCTION declarations must be at the top level".to_string(),
            );
            return;
        }
        match &stmt.kind {
            StmtKind::Label(name) => {
                let key = name.to_uppercase();
                if self.symbols.labels.contains_key(&key) {
                    self.error(line, stmt.loc, format!("Duplicate label '{}'", name));
                } else {
                    self.symbols.labels.insert(
                        key,
                        LabelInfo {
                            loc: stmt.loc,
                            basic_line: line,
                        },
                    );
                }
            }
            StmtKind::Dim(decls) => {
                for decl in decls {
                    self.declare_array(decl, line, false);
                }
            }
            StmtKind::Redim { decls, .. } => {
                for decl in decls {
                    self.declare_array(decl, line, true);
                }
            }
            StmtKind::Sub { name, params, body } => {
                self.declare_proc(name.clone(), ProcKind::Sub, params, None, line, stmt.loc);
                for s in body {
                    self.collect_stmt(s, depth + 1);
                }
            }
            StmtKind::Function { name, params, body } => {
                let ret = Some(name.value_type());
                self.declare_proc(name.key(), ProcKind::Function, params, ret, line, stmt.loc);
                for s in body {
                    self.collect_stmt(s, depth + 1);
                }
            }
            StmtKind::DefFn { name, params, .. } => {
                let ret = Some(name.value_type());
                self.declare_proc(name.key(), ProcKind::DefFn, params, ret, line, stmt.loc);
            }
            // Recurse into every construct that nests statements.
            StmtKind::If { arms, else_body } => {
                for (_, body) in arms {
                    for s in body {
                        self.collect_stmt(s, depth + 1);
                    }
                }
                if let Some(body) = else_body {
                    for s in body {
                        self.collect_stmt(s, depth + 1);
                    }
                }
            }
            StmtKind::Select { arms, else_body, .. } => {
                for arm in arms {
                    for s in &arm.body {
                        self.collect_stmt(s, depth + 1);
                    }
                }
                if let Some(body) = else_body {
                    for s in body {
                        self.collect_stmt(s, depth + 1);
                    }
                }
            }
            StmtKind::For { body, .. }
            | StmtKind::While { body, .. }
            | StmtKind::Repeat { body, .. }
            | StmtKind::DoLoop { body, .. } => {
                for s in body {
                    self.collect_stmt(s, depth + 1);
                }
            }
            _ => {}
        }
    }

    fn declare_array(&mut self, decl: &ArrayDecl, line: Option<u32>, redim: bool) {
        let key = decl.var.key();
        if !redim
            && let Some(existing) = self.symbols.variables.get(&key)
            && existing.is_array
        {
            self.error(
                line,
                decl.var.loc,
                format!("Array {} is already dimensioned", key),
            );
            return;
        }
        let dims = decl
            .dims
            .iter()
            .map(|e| self.const_int(e))
            .collect::<Vec<_>>();
        self.symbols.variables.insert(
            key.clone(),
            VariableInfo {
                key,
                ty: decl.var.value_type(),
                declared: true,
                is_array: true,
                dim_count: decl.dims.len(),
                dims,
            },
        );
    }

    fn declare_proc(
        &mut self,
        name: String,
        kind: ProcKind,
        params: &[VarRef],
        ret: Option<ValueType>,
        line: Option<u32>,
        loc: SourceLoc,
    ) {
        if self.symbols.procs.contains_key(&name) {
            self.error(line, loc, format!("Duplicate SUB/FUNCTION '{}'", name));
            return;
        }
        let params = params
            .iter()
            .map(|p| (p.key(), p.value_type()))
            .collect::<Vec<_>>();
        self.symbols.procs.insert(
            name.clone(),
            ProcInfo {
                name,
                kind,
                params,
                ret,
            },
        );
    }

    /// Fold an expression to a compile-time integer when possible.
    fn const_int(&self, expr: &Expr) -> Option<i64> {
        match &expr.kind {
            ExprKind::IntLit(n) => Some(*n),
            ExprKind::RealLit(d) => Some(*d as i64),
            ExprKind::ConstRef(index, _) => self.constants.get(*index).map(Value::as_int),
            ExprKind::Unary(UnOp::Neg, inner) => self.const_int(inner).map(|n| -n),
            _ => None,
        }
    }

    // -- pass 2: usage validation ------------------------------------------

    fn validate(&mut self, program: &mut Program) {
        for line in &mut program.lines {
            let stmts = &mut line.statements;
            self.validate_block(stmts);
        }
    }

    fn validate_block(&mut self, stmts: &mut Vec<Statement>) {
        let mut unreachable_from: Option<usize> = None;
        for (idx, stmt) in stmts.iter_mut().enumerate() {
            if unreachable_from == Some(idx)
                && !matches!(stmt.kind, StmtKind::Label(_) | StmtKind::Rem) {
                self.diagnostics.push(
                    Diagnostic::new(
                        DiagnosticKind::Warning,
                        "Unreachable code after unconditional branch".to_string(),
                        stmt.loc,
                    )
                    .with_basic_line(stmt.basic_line),
                );
            }
            if matches!(
                stmt.kind,
                StmtKind::Goto(_) | StmtKind::Return | StmtKind::End
            ) {
                unreachable_from = Some(idx + 1);
            }
            self.validate_stmt(stmt);
        }
    }

    fn validate_stmt(&mut self, stmt: &mut Statement) {
        let line = stmt.basic_line;
        let loc = stmt.loc;

        // Resolve the two parser-deferred forms up front, rewriting the node
        // in place before the main dispatch.
        if let StmtKind::ImplicitCall(name) = &stmt.kind {
            // A bare identifier: a parameterless sub call, or a GOTO to a
            // label (which is how a rewritten `THEN 30` arrives).
            let name = name.clone();
            if self.symbols.procs.contains_key(&name) {
                self.check_user_call(&name, 0, true, line, loc);
                stmt.kind = StmtKind::CallSub {
                    name,
                    args: Vec::new(),
                };
            } else if self.symbols.labels.contains_key(&name.to_uppercase()) {
                self.referenced_labels.insert(name.to_uppercase());
                stmt.kind = StmtKind::Goto(name);
            } else {
                self.error(line, loc, format!("Unknown statement '{}'", name));
            }
            return;
        }
        if let StmtKind::StopTimer(StopTimerTarget::Handler(name)) = &stmt.kind {
            // An unsuffixed identifier that is not a sub names a timer-id
            // variable, not a handler.
            let name = name.clone();
            if !self.symbols.procs.contains_key(&name) {
                let var = VarRef {
                    name,
                    suffix: TypeSuffix::None,
                    loc,
                };
                let mut expr = Expr::new(ExprKind::Var(var), loc);
                self.validate_expr(&mut expr, line);
                stmt.kind = StmtKind::StopTimer(StopTimerTarget::Id(expr));
            }
            return;
        }

        match &mut stmt.kind {
            StmtKind::Assign { target, value } => {
                let value_ty = self.validate_expr(value, line);
                let target_ty = self.validate_lvalue(target, line);
                self.check_assign(target_ty, value_ty, line, loc);
            }
            StmtKind::Print { channel, items } => {
                if let Some(ch) = channel {
                    self.require_numeric(ch, line, "PRINT # file number");
                }
                for item in items {
                    self.validate_expr(&mut item.expr, line);
                }
            }
            StmtKind::Input { channel, targets, .. } => {
                if let Some(ch) = channel {
                    self.require_numeric(ch, line, "INPUT # file number");
                }
                for target in targets {
                    self.validate_lvalue(target, line);
                }
            }
            StmtKind::LineInput { channel, target } => {
                if let Some(ch) = channel {
                    self.require_numeric(ch, line, "LINE INPUT # file number");
                }
                let ty = self.validate_lvalue(target, line);
                if ty != ValueType::String {
                    self.error(line, loc, "LINE INPUT target must be a string".to_string());
                }
            }
            StmtKind::If { arms, else_body } => {
                for (cond, body) in arms.iter_mut() {
                    self.require_numeric(cond, line, "IF condition");
                    self.validate_block(body);
                }
                if let Some(body) = else_body {
                    self.validate_block(body);
                }
            }
            StmtKind::Select {
                selector,
                arms,
                else_body,
            } => {
                let sel_ty = self.validate_expr(selector, line);
                for arm in arms.iter_mut() {
                    for test in arm.tests.iter_mut() {
                        let test_expr = match test {
                            CaseTest::Value(e) => e,
                            CaseTest::Is(_, e) => e,
                        };
                        let ty = self.validate_expr(test_expr, line);
                        if ty.is_numeric() != sel_ty.is_numeric() {
                            self.error(
                                line,
                                test_expr.loc,
                                "CASE value type does not match the SELECT selector".to_string(),
                            );
                        }
                    }
                    self.validate_block(&mut arm.body);
                }
                if let Some(body) = else_body {
                    self.validate_block(body);
                }
            }
            StmtKind::For {
                var,
                from,
                to,
                step,
                body,
            } => {
                if !var.value_type().is_numeric() {
                    self.error(line, var.loc, "FOR counter must be numeric".to_string());
                }
                self.touch_variable(var, line);
                self.require_numeric(from, line, "FOR start");
                self.require_numeric(to, line, "FOR limit");
                if let Some(step) = step {
                    self.require_numeric(step, line, "FOR step");
                    if self.const_int(step) == Some(0) {
                        self.error(
                            line,
                            step.loc,
                            "FOR with STEP 0 never terminates".to_string(),
                        );
                    }
                }
                self.loop_stack.push(LoopCtx::For);
                self.validate_block(body);
                self.loop_stack.pop();
            }
            StmtKind::While { cond, body } => {
                self.require_numeric(cond, line, "WHILE condition");
                self.loop_stack.push(LoopCtx::While);
                self.validate_block(body);
                self.loop_stack.pop();
            }
            StmtKind::Repeat { body, until } => {
                self.loop_stack.push(LoopCtx::Do);
                self.validate_block(body);
                self.loop_stack.pop();
                self.require_numeric(until, line, "UNTIL condition");
            }
            StmtKind::DoLoop { pre, post, body } => {
                if let Some((_, cond)) = pre {
                    self.require_numeric(cond, line, "DO condition");
                }
                self.loop_stack.push(LoopCtx::Do);
                self.validate_block(body);
                self.loop_stack.pop();
                if let Some((_, cond)) = post {
                    self.require_numeric(cond, line, "LOOP condition");
                }
            }
            StmtKind::Goto(target) | StmtKind::Gosub(target) => {
                let target = target.clone();
                self.check_label(&target, line, loc);
            }
            StmtKind::OnGoto {
                selector, targets, ..
            } => {
                self.require_numeric(selector, line, "ON selector");
                for target in targets.clone() {
                    self.check_label(&target, line, loc);
                }
            }
            StmtKind::Return => {
                if self.current_proc.is_some() {
                    self.error(
                        line,
                        loc,
                        "RETURN is only valid in GOSUB context, not inside SUB/FUNCTION"
                            .to_string(),
                    );
                }
            }
            StmtKind::Read(targets) => {
                for target in targets {
                    self.validate_lvalue(target, line);
                }
            }
            StmtKind::Restore(_) | StmtKind::Rem | StmtKind::End | StmtKind::Label(_) => {}
            StmtKind::Dim(decls) | StmtKind::Redim { decls, .. } => {
                for decl in decls.iter_mut() {
                    for dim in decl.dims.iter_mut() {
                        self.require_numeric(dim, line, "array bound");
                    }
                }
            }
            StmtKind::Erase(vars) => {
                for var in vars.clone() {
                    let key = var.key();
                    if !self.symbols.variables.get(&key).is_some_and(|v| v.is_array) {
                        self.error(line, var.loc, format!("ERASE of unknown array {}", key));
                    }
                }
            }
            StmtKind::Const { .. } => {
                // Folded into the constants store by the parser.
            }
            StmtKind::DefFn { name, params, body } => {
                let proc_name = name.key();
                let saved = self.current_proc.replace(proc_name);
                let _ = params;
                self.validate_expr(body, line);
                self.current_proc = saved;
            }
            StmtKind::Sub { name, body, .. } => {
                let saved = self.current_proc.replace(name.clone());
                self.validate_block(body);
                self.current_proc = saved;
            }
            StmtKind::Function { name, body, .. } => {
                let saved = self.current_proc.replace(name.key());
                self.validate_block(body);
                self.current_proc = saved;
            }
            StmtKind::CallSub { name, args } => {
                let name = name.clone();
                for arg in args.iter_mut() {
                    self.validate_expr(arg, line);
                }
                self.check_user_call(&name, args.len(), true, line, loc);
            }
            StmtKind::ImplicitCall(_) => unreachable!("resolved before dispatch"),
            StmtKind::Command { name, args } => {
                let name = name.clone();
                for arg in args.iter_mut() {
                    self.validate_expr(arg, line);
                }
                let def = self.registry.command(&name).cloned();
                match def {
                    Some(def) => self.check_registry_call(&def, args, line, loc),
                    None => self.error(line, loc, format!("Unknown command '{}'", name)),
                }
            }
            StmtKind::Exit(kind) => {
                let kind = *kind;
                self.check_exit(kind, line, loc);
            }
            StmtKind::Open { path, number, .. } => {
                let ty = self.validate_expr(path, line);
                if ty != ValueType::String {
                    self.error(line, loc, "OPEN path must be a string".to_string());
                }
                self.require_numeric(number, line, "file number");
            }
            StmtKind::Close { number } => {
                if let Some(n) = number {
                    self.require_numeric(n, line, "file number");
                }
            }
            StmtKind::Write { channel, items } => {
                self.require_numeric(channel, line, "WRITE # file number");
                for item in items {
                    self.validate_expr(item, line);
                }
            }
            StmtKind::Timer { amount, handler, .. } => {
                self.require_numeric(amount, line, "timer duration");
                let handler = handler.clone();
                match self.symbols.procs.get(&handler) {
                    Some(info) if info.kind == ProcKind::Sub => {
                        if !info.params.is_empty() {
                            self.error(
                                line,
                                loc,
                                format!("Timer handler {} must take no parameters", handler),
                            );
                        }
                    }
                    _ => {
                        self.error(line, loc, format!("Timer handler {} is not a SUB", handler));
                    }
                }
            }
            StmtKind::StopTimer(target) => match target {
                StopTimerTarget::All | StopTimerTarget::Handler(_) => {}
                StopTimerTarget::Id(expr) => {
                    self.require_numeric(expr, line, "timer id");
                }
            },
        }
    }

    fn check_exit(&mut self, kind: ExitKind, line: Option<u32>, loc: SourceLoc) {
        let ok = match kind {
            ExitKind::For => self.loop_stack.contains(&LoopCtx::For),
            ExitKind::While => self.loop_stack.contains(&LoopCtx::While),
            ExitKind::Do => self.loop_stack.contains(&LoopCtx::Do),
            ExitKind::Sub => self
                .current_proc
                .as_ref()
                .and_then(|p| self.symbols.procs.get(p))
                .is_some_and(|p| p.kind == ProcKind::Sub),
            ExitKind::Function => self
                .current_proc
                .as_ref()
                .and_then(|p| self.symbols.procs.get(p))
                .is_some_and(|p| p.kind == ProcKind::Function),
        };
        if !ok {
            let what = match kind {
                ExitKind::For => "FOR",
                ExitKind::While => "WHILE",
                ExitKind::Do => "DO",
                ExitKind::Sub => "SUB",
                ExitKind::Function => "FUNCTION",
            };
            self.error(
                line,
                loc,
                format!("EXIT {} outside a matching construct", what),
            );
        }
    }

    fn check_label(&mut self, target: &str, line: Option<u32>, loc: SourceLoc) {
        let key = target.to_uppercase();
        if self.symbols.labels.contains_key(&key) {
            self.referenced_labels.insert(key);
        } else {
            self.error(line, loc, format!("Unknown branch target '{}'", target));
        }
    }

    fn check_user_call(
        &mut self,
        name: &str,
        arg_count: usize,
        statement: bool,
        line: Option<u32>,
        loc: SourceLoc,
    ) {
        match self.symbols.procs.get(name) {
            Some(info) => {
                let is_not_sub = statement && info.kind != ProcKind::Sub;
                let param_count = info.params.len();
                if is_not_sub {
                    self.error(line, loc, format!("{} is a FUNCTION, not a SUB", name));
                }
                if param_count != arg_count {
                    self.error(
                        line,
                        loc,
                        format!(
                            "{} expects {} argument(s), got {}",
                            name, param_count, arg_count
                        ),
                    );
                }
            }
            None => self.error(line, loc, format!("Unknown SUB or FUNCTION '{}'", name)),
        }
    }

    fn check_registry_call(
        &mut self,
        def: &CommandDef,
        args: &mut Vec<Expr>,
        line: Option<u32>,
        loc: SourceLoc,
    ) {
        if args.len() < def.min_args() || args.len() > def.max_args() {
            self.error(
                line,
                loc,
                format!(
                    "{} expects {}..{} argument(s), got {}",
                    def.name,
                    def.min_args(),
                    def.max_args(),
                    args.len()
                ),
            );
            return;
        }
        // Fill omitted optional parameters with their declared defaults.
        while args.len() < def.params.len() {
            let param = &def.params[args.len()];
            let default = param.default.clone().unwrap_or(Value::Int(0));
            let kind = match default {
                Value::Int(n) => ExprKind::IntLit(n),
                Value::Double(d) => ExprKind::RealLit(d),
                Value::Str(s) => ExprKind::StrLit(s),
            };
            args.push(Expr::new(kind, loc));
        }
        for (arg, param) in args.iter().zip(def.params.iter()) {
            let ty = self.expr_type(arg);
            let ok = match param.ty {
                ParamType::Integer | ParamType::Number => ty.is_numeric(),
                ParamType::String => ty == ValueType::String,
                ParamType::Any => true,
                ParamType::Array => matches!(arg.kind, ExprKind::ArrayRef(_, _)),
            };
            if !ok {
                self.error(
                    line,
                    arg.loc,
                    format!(
                        "Argument '{}' of {} expects {:?}",
                        param.name, def.name, param.ty
                    ),
                );
            }
        }
    }

    // -- expression validation ---------------------------------------------

    /// Validate an expression, resolving `IndexOrCall` nodes, and return its
    /// type.
    fn validate_expr(&mut self, expr: &mut Expr, line: Option<u32>) -> ValueType {
        let loc = expr.loc;
        match &mut expr.kind {
            ExprKind::IntLit(_) => ValueType::Integer,
            ExprKind::RealLit(_) => ValueType::Double,
            ExprKind::StrLit(_) => ValueType::String,
            ExprKind::ConstRef(index, _) => match self.constants.get(*index) {
                Some(Value::Str(_)) => ValueType::String,
                Some(Value::Int(_)) => ValueType::Integer,
                _ => ValueType::Double,
            },
            ExprKind::Var(var) => {
                let var = var.clone();
                self.touch_variable(&var, line);
                self.symbols.var_type(&var.key(), self.current_proc.as_deref())
            }
            ExprKind::IndexOrCall(var, args) => {
                // Array reference, user function call, or error.
                let var = var.clone();
                let key = var.key();
                let mut args = std::mem::take(args);
                for arg in args.iter_mut() {
                    self.validate_expr(arg, line);
                }
                if self.symbols.variables.get(&key).is_some_and(|v| v.is_array) {
                    let info = self.symbols.variables.get(&key).unwrap();
                    let (dim_count, ty) = (info.dim_count, info.ty);
                    if args.len() != dim_count {
                        self.error(
                            line,
                            loc,
                            format!(
                                "Array {} has {} dimension(s), got {} index(es)",
                                key,
                                dim_count,
                                args.len()
                            ),
                        );
                    }
                    for index in &args {
                        let ity = self.expr_type(index);
                        if !ity.is_numeric() {
                            self.error(line, index.loc, "Array index must be numeric".to_string());
                        }
                    }
                    expr.kind = ExprKind::ArrayRef(var, args);
                    ty
                } else if let Some(info) = self.symbols.procs.get(&key).cloned() {
                    if info.kind == ProcKind::Sub {
                        self.error(line, loc, format!("{} is a SUB, not a FUNCTION", key));
                    }
                    if info.params.len() != args.len() {
                        self.error(
                            line,
                            loc,
                            format!(
                                "{} expects {} argument(s), got {}",
                                key,
                                info.params.len(),
                                args.len()
                            ),
                        );
                    }
                    expr.kind = ExprKind::UserCall { name: key, args };
                    info.ret.unwrap_or(ValueType::Double)
                } else {
                    self.error(
                        line,
                        loc,
                        format!("{} is neither a dimensioned array nor a FUNCTION", key),
                    );
                    ValueType::Double
                }
            }
            ExprKind::ArrayRef(var, args) => {
                let ty = var.value_type();
                for arg in args.iter_mut() {
                    self.validate_expr(arg, line);
                }
                ty
            }
            ExprKind::FnCall { name, args } => {
                let name = name.clone();
                for arg in args.iter_mut() {
                    self.validate_expr(arg, line);
                }
                let def = self.registry.function(&name).cloned();
                match def {
                    Some(def) => {
                        self.check_registry_call(&def, args, line, loc);
                        match def.ret {
                            ReturnType::String => ValueType::String,
                            ReturnType::Integer => ValueType::Integer,
                            _ => ValueType::Double,
                        }
                    }
                    None => {
                        self.error(line, loc, format!("Unknown function '{}'", name));
                        ValueType::Double
                    }
                }
            }
            ExprKind::UserCall { name, args } => {
                let ret = self
                    .symbols
                    .procs
                    .get(name)
                    .and_then(|p| p.ret)
                    .unwrap_or(ValueType::Double);
                for arg in args.iter_mut() {
                    self.validate_expr(arg, line);
                }
                ret
            }
            ExprKind::Unary(op, operand) => {
                let op = *op;
                let ty = self.validate_expr(operand, line);
                if !ty.is_numeric() {
                    let name = if op == UnOp::Neg { "negation" } else { "NOT" };
                    self.error(line, loc, format!("Operand of {} must be numeric", name));
                }
                match op {
                    UnOp::Neg => ty,
                    UnOp::Not => ValueType::Integer,
                }
            }
            ExprKind::Binary(op, lhs, rhs) => {
                let op = *op;
                let lt = self.validate_expr(lhs, line);
                let rt = self.validate_expr(rhs, line);
                self.binary_type(op, lt, rt, line, loc)
            }
        }
    }

    fn binary_type(
        &mut self,
        op: BinOp,
        lt: ValueType,
        rt: ValueType,
        line: Option<u32>,
        loc: SourceLoc,
    ) -> ValueType {
        let both_str = lt == ValueType::String && rt == ValueType::String;
        let both_num = lt.is_numeric() && rt.is_numeric();
        match op {
            BinOp::Add => {
                if both_str {
                    ValueType::String
                } else if both_num {
                    self.numeric_join(lt, rt)
                } else {
                    self.error(
                        line,
                        loc,
                        "Cannot mix string and number; use STR$ or VAL".to_string(),
                    );
                    ValueType::Double
                }
            }
            BinOp::Sub | BinOp::Mul => {
                if !both_num {
                    self.error(line, loc, "Arithmetic requires numeric operands".to_string());
                }
                self.numeric_join(lt, rt)
            }
            BinOp::Div | BinOp::Pow => {
                if !both_num {
                    self.error(line, loc, "Arithmetic requires numeric operands".to_string());
                }
                ValueType::Double
            }
            BinOp::IntDiv | BinOp::Mod => {
                if !both_num {
                    self.error(line, loc, "Arithmetic requires numeric operands".to_string());
                }
                ValueType::Integer
            }
            op if op.is_comparison() => {
                if !both_str && !both_num {
                    self.error(
                        line,
                        loc,
                        "Comparison requires operands of the same type".to_string(),
                    );
                }
                ValueType::Integer
            }
            _ => {
                // Logical / bitwise family.
                if !both_num {
                    self.error(
                        line,
                        loc,
                        "Logical operators require numeric operands".to_string(),
                    );
                }
                ValueType::Integer
            }
        }
    }

    fn numeric_join(&self, lt: ValueType, rt: ValueType) -> ValueType {
        if lt == ValueType::Integer && rt == ValueType::Integer {
            ValueType::Integer
        } else {
            ValueType::Double
        }
    }

    /// Public helper for later phases: the type of a validated expression.
    pub fn expr_type(&self, expr: &Expr) -> ValueType {
        expr_type(expr, &self.symbols, self.constants, self.registry, self.current_proc.as_deref())
    }

    fn validate_lvalue(&mut self, target: &mut LValue, line: Option<u32>) -> ValueType {
        match target {
            LValue::Var(var) => {
                let var = var.clone();
                // A scalar write to a dimensioned array is an arity error.
                if self
                    .symbols
                    .variables
                    .get(&var.key())
                    .is_some_and(|v| v.is_array)
                {
                    self.error(
                        line,
                        var.loc,
                        format!("Array {} needs index(es)", var.key()),
                    );
                }
                self.touch_variable(&var, line);
                self.symbols.var_type(&var.key(), self.current_proc.as_deref())
            }
            LValue::Array(var, indices) => {
                let var = var.clone();
                for index in indices.iter_mut() {
                    let ty = self.validate_expr(index, line);
                    if !ty.is_numeric() {
                        self.error(line, index.loc, "Array index must be numeric".to_string());
                    }
                }
                match self.symbols.variables.get(&var.key()) {
                    Some(info) if info.is_array => {
                        if info.dim_count != indices.len() {
                            let (dim_count, key) = (info.dim_count, var.key());
                            self.error(
                                line,
                                var.loc,
                                format!(
                                    "Array {} has {} dimension(s), got {} index(es)",
                                    key,
                                    dim_count,
                                    indices.len()
                                ),
                            );
                        }
                    }
                    _ => {
                        self.error(
                            line,
                            var.loc,
                            format!("Array {} used before DIM", var.key()),
                        );
                    }
                }
                var.value_type()
            }
        }
    }

    /// Record a scalar use: under `OPTION EXPLICIT` an unknown variable is an
    /// error, otherwise first use declares it implicitly.
    fn touch_variable(&mut self, var: &VarRef, line: Option<u32>) {
        let key = var.key();
        // Proc parameters and the function's own name are always resolved.
        if let Some(proc_name) = self.current_proc.clone()
            && let Some(info) = self.symbols.procs.get(&proc_name)
            && (info.params.iter().any(|(k, _)| *k == key) || info.name == key)
        {
            return;
        }
        if self.symbols.variables.contains_key(&key) {
            return;
        }
        if self.options.explicit {
            self.error(
                line,
                var.loc,
                format!("Undeclared variable {} (OPTION EXPLICIT is in effect)", key),
            );
        }
        self.symbols.variables.insert(
            key.clone(),
            VariableInfo {
                key,
                ty: var.value_type(),
                declared: false,
                is_array: false,
                dim_count: 0,
                dims: Vec::new(),
            },
        );
    }

    fn check_assign(
        &mut self,
        target: ValueType,
        value: ValueType,
        line: Option<u32>,
        loc: SourceLoc,
    ) {
        if target == ValueType::String && value != ValueType::String {
            self.error(
                line,
                loc,
                "Cannot assign a number to a string variable; use STR$".to_string(),
            );
        } else if target != ValueType::String && value == ValueType::String {
            self.error(
                line,
                loc,
                "Cannot assign a string to a numeric variable; use VAL".to_string(),
            );
        } else if target == ValueType::Integer
            && matches!(value, ValueType::Double | ValueType::Single)
        {
            self.warn(
                line,
                loc,
                "Implicit coercion to integer may lose precision".to_string(),
            );
        }
    }

    fn require_numeric(&mut self, expr: &mut Expr, line: Option<u32>, what: &str) {
        let ty = self.validate_expr(expr, line);
        if !ty.is_numeric() {
            self.error(line, expr.loc, format!("{} must be numeric", what));
        }
    }

    fn warn_unused_labels(&mut self) {
        let unused: Vec<(String, LabelInfo)> = self
            .symbols
            .labels
            .iter()
            .filter(|(name, _)| !self.referenced_labels.contains(*name))
            .map(|(name, info)| (name.clone(), *info))
            .collect();
        for (name, info) in unused {
            self.warn(
                info.basic_line,
                info.loc,
                format!("Label '{}' is never referenced", name),
            );
        }
    }
}

/// Stateless expression typing used by the IR generator after validation.
pub fn expr_type(
    expr: &Expr,
    symbols: &SymbolTable,
    constants: &ConstantsStore,
    registry: &CommandRegistry,
    proc: Option<&str>,
) -> ValueType {
    match &expr.kind {
        ExprKind::IntLit(_) => ValueType::Integer,
        ExprKind::RealLit(_) => ValueType::Double,
        ExprKind::StrLit(_) => ValueType::String,
        ExprKind::ConstRef(index, _) => match constants.get(*index) {
            Some(Value::Str(_)) => ValueType::String,
            Some(Value::Int(_)) => ValueType::Integer,
            _ => ValueType::Double,
        },
        ExprKind::Var(var) => symbols.var_type(&var.key(), proc),
        ExprKind::ArrayRef(var, _) | ExprKind::IndexOrCall(var, _) => var.value_type(),
        ExprKind::FnCall { name, .. } => match registry.function(name).map(|d| d.ret) {
            Some(ReturnType::String) => ValueType::String,
            Some(ReturnType::Integer) => ValueType::Integer,
            _ => ValueType::Double,
        },
        ExprKind::UserCall { name, .. } => symbols
            .procs
            .get(name)
            .and_then(|p| p.ret)
            .unwrap_or(ValueType::Double),
        ExprKind::Unary(UnOp::Not, _) => ValueType::Integer,
        ExprKind::Unary(UnOp::Neg, operand) => {
            expr_type(operand, symbols, constants, registry, proc)
        }
        ExprKind::Binary(op, lhs, rhs) => match op {
            BinOp::Add => {
                let lt = expr_type(lhs, symbols, constants, registry, proc);
                if lt == ValueType::String {
                    ValueType::String
                } else {
                    let rt = expr_type(rhs, symbols, constants, registry, proc);
                    if lt == ValueType::Integer && rt == ValueType::Integer {
                        ValueType::Integer
                    } else {
                        ValueType::Double
                    }
                }
            }
            BinOp::Sub | BinOp::Mul => {
                let lt = expr_type(lhs, symbols, constants, registry, proc);
                let rt = expr_type(rhs, symbols, constants, registry, proc);
                if lt == ValueType::Integer && rt == ValueType::Integer {
                    ValueType::Integer
                } else {
                    ValueType::Double
                }
            }
            BinOp::Div | BinOp::Pow => ValueType::Double,
            _ => ValueType::Integer,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer;
    use crate::parser::Parser;
    use basic_core::builtins;

    fn analyze_source(src: &str) -> (Program, CompilerOptions, SemanticOutput) {
        let mut reg = CommandRegistry::new();
        builtins::register_core_functions(&mut reg).unwrap();
        builtins::register_core_commands(&mut reg).unwrap();
        let mut constants = ConstantsStore::with_predefined();
        let lexed = lexer::tokenize(src, &reg, 50);
        assert!(lexed.diagnostics.is_empty(), "{:?}", lexed.diagnostics);
        let parsed = Parser::new(lexed.tokens, &lexed.mapping, &mut constants, &reg, 50).parse();
        assert!(parsed.diagnostics.is_empty(), "{:?}", parsed.diagnostics);
        let mut program = parsed.program;
        let out = SemanticAnalyzer::new(&parsed.options, &reg, &constants).analyze(&mut program);
        (program, parsed.options, out)
    }

    fn errors(out: &SemanticOutput) -> Vec<&Diagnostic> {
        out.diagnostics.iter().filter(|d| d.is_error()).collect()
    }

    #[test]
    fn implicit_declaration_by_suffix() {
        let (_, _, out) = analyze_source("10 A$ = \"x\"\n20 B% = 1\n30 C = 2.5\n");
        assert!(errors(&out).is_empty(), "{:?}", out.diagnostics);
        assert_eq!(out.symbols.variables["A$"].ty, ValueType::String);
        assert_eq!(out.symbols.variables["B%"].ty, ValueType::Integer);
        assert_eq!(out.symbols.variables["C"].ty, ValueType::Double);
        assert!(!out.symbols.variables["C"].declared);
    }

    #[test]
    fn option_explicit_rejects_undeclared_with_basic_line() {
        let (_, _, out) = analyze_source("10 OPTION EXPLICIT\n20 X = 5\n");
        let errs = errors(&out);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].basic_line, Some(20));
        assert!(errs[0].message.contains("Undeclared"));
        assert!(errs[0].message.contains('X'));
    }

    #[test]
    fn array_arity_is_checked() {
        let (_, _, out) = analyze_source("10 DIM A(3, 4)\n20 A(1) = 5\n");
        assert!(errors(&out)[0].message.contains("dimension"));
    }

    #[test]
    fn array_use_before_dim_is_an_error() {
        let (_, _, out) = analyze_source("10 B(1) = 5\n");
        assert!(errors(&out)[0].message.contains("before DIM"));
    }

    #[test]
    fn string_number_assignment_mismatch() {
        let (_, _, out) = analyze_source("10 A$ = 5\n");
        assert!(errors(&out)[0].message.contains("STR$"));
        let (_, _, out) = analyze_source("10 A% = \"x\"\n");
        assert!(errors(&out)[0].message.contains("VAL"));
    }

    #[test]
    fn precision_loss_warns() {
        let (_, _, out) = analyze_source("10 A% = 2.5\n");
        assert!(errors(&out).is_empty());
        assert!(out
            .diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::Warning && d.message.contains("precision")));
    }

    #[test]
    fn step_zero_is_rejected() {
        let (_, _, out) = analyze_source("10 FOR I = 1 TO 1 STEP 0\n20 NEXT I\n");
        assert!(errors(&out)[0].message.contains("STEP 0"));
    }

    #[test]
    fn unknown_branch_target() {
        let (_, _, out) = analyze_source("10 GOTO NOWHERE\n");
        assert!(errors(&out)[0].message.contains("NOWHERE"));
    }

    #[test]
    fn duplicate_label_is_an_error() {
        let (_, _, out) = analyze_source("10 SPOT: PRINT 1\n20 SPOT: PRINT 2\n30 GOTO SPOT\n");
        assert!(errors(&out)[0].message.contains("Duplicate label"));
    }

    #[test]
    fn exit_placement() {
        let (_, _, out) = analyze_source("10 EXIT FOR\n");
        assert!(errors(&out)[0].message.contains("EXIT"));
        let (_, _, out) =
            analyze_source("10 FOR I = 1 TO 3\n20 EXIT FOR\n30 NEXT I\n");
        assert!(errors(&out).is_empty());
    }

    #[test]
    fn index_or_call_resolution() {
        let (program, _, out) =
            analyze_source("10 DIM A(3)\n20 X = A(1)\n30 FUNCTION F%(N%)\n40 F% = N%\n50 ENDFUNCTION\n60 Y = F%(2)\n");
        assert!(errors(&out).is_empty(), "{:?}", out.diagnostics);
        // Line 20 resolved to an array reference.
        match &program.lines[1].statements[0].kind {
            StmtKind::Assign { value, .. } => {
                assert!(matches!(value.kind, ExprKind::ArrayRef(_, _)));
            }
            other => panic!("unexpected {:?}", other),
        }
        // Line 60 resolved to a user call.
        match &program.lines[3].statements[0].kind {
            StmtKind::Assign { value, .. } => {
                assert!(matches!(value.kind, ExprKind::UserCall { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn registry_arity_and_defaults() {
        let (program, _, out) = analyze_source("10 X = INSTR(\"ab\", \"b\")\n");
        assert!(errors(&out).is_empty(), "{:?}", out.diagnostics);
        match &program.lines[0].statements[0].kind {
            StmtKind::Assign { value, .. } => match &value.kind {
                ExprKind::FnCall { args, .. } => {
                    // The optional start parameter was filled with 1.
                    assert_eq!(args.len(), 3);
                    assert!(matches!(args[2].kind, ExprKind::IntLit(1)));
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }

        let (_, _, out) = analyze_source("10 X = LEN()\n");
        assert!(!errors(&out).is_empty());
    }

    #[test]
    fn registry_argument_types() {
        let (_, _, out) = analyze_source("10 X = LEN(5)\n");
        assert!(errors(&out)[0].message.contains("LEN"));
    }

    #[test]
    fn timer_handler_must_be_sub() {
        let (_, _, out) = analyze_source("10 EVERY 100 MS TICK\n");
        assert!(errors(&out)[0].message.contains("TICK"));
        let (_, _, out) =
            analyze_source("10 EVERY 100 MS TICK\n20 SUB TICK : ENDSUB\n");
        assert!(errors(&out).is_empty(), "{:?}", out.diagnostics);
    }

    #[test]
    fn then_target_resolves_to_goto() {
        let (program, _, out) =
            analyze_source("10 IF A THEN L30\n20 PRINT \"NO\"\n30 L30: PRINT \"YES\"\n");
        assert!(errors(&out).is_empty(), "{:?}", out.diagnostics);
        match &program.lines[0].statements[0].kind {
            StmtKind::If { arms, .. } => {
                assert!(matches!(&arms[0].1[0].kind, StmtKind::Goto(t) if t == "L30"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unused_label_warns() {
        let (_, _, out) = analyze_source("10 SPOT: PRINT 1\n");
        assert!(out
            .diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::Warning && d.message.contains("SPOT")));
    }

    #[test]
    fn dead_code_after_goto_warns() {
        let (_, _, out) = analyze_source("10 DONE: GOTO DONE : PRINT 1\n");
        assert!(out
            .diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::Warning && d.message.contains("Unreachable")));
    }

    #[test]
    fn type_suffix_collision_makes_distinct_variables() {
        let (_, _, out) = analyze_source("10 A$ = \"x\"\n20 A% = 1\n30 A = 2.5\n");
        assert!(errors(&out).is_empty());
        assert_eq!(out.symbols.variables.len(), 3);
    }

    #[test]
    fn return_inside_sub_is_rejected() {
        let (_, _, out) = analyze_source("10 SUB S : RETURN : ENDSUB\n");
        assert!(errors(&out)[0].message.contains("RETURN"));
    }
}
