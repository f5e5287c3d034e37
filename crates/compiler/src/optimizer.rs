//! AST optimization passes: constant folding, algebraic identities and dead
//! code elimination.
//!
//! Every rewrite preserves observable behavior and types: integer folds wrap
//! like the runtime's 64-bit arithmetic, doubles follow IEEE-754, and the
//! logical-operator family respects `OPTION BITWISE|LOGICAL`. The optimizer
//! counts applications per rule so `--opt-stats` can report them.

use crate::ast::*;
use crate::config::{CompilerOptions, LogicMode};

#[derive(Debug, Default)]
pub struct AstOptimizer {
    options: CompilerOptions,
    constant_folds: usize,
    identities: usize,
    dead_statements: usize,
    folded_branches: usize,
}

impl AstOptimizer {
    pub fn new(options: CompilerOptions) -> Self {
        AstOptimizer {
            options,
            ..AstOptimizer::default()
        }
    }

    pub fn optimize(&mut self, program: &mut Program) {
        for line in &mut program.lines {
            self.optimize_block(&mut line.statements);
        }
    }

    /// Human-readable per-rule counters, in the shape `--opt-stats` prints.
    pub fn report(&self) -> String {
        format!(
            "AST optimizer: {} constant fold(s), {} identity rewrite(s), \
             {} dead statement(s) removed, {} branch(es) folded\n",
            self.constant_folds, self.identities, self.dead_statements, self.folded_branches
        )
    }

    pub fn total_rewrites(&self) -> usize {
        self.constant_folds + self.identities + self.dead_statements + self.folded_branches
    }

    // -- statements --------------------------------------------------------

    fn optimize_block(&mut self, stmts: &mut Vec<Statement>) {
        for stmt in stmts.iter_mut() {
            self.optimize_stmt(stmt);
        }

        // Dead code elimination: drop statements between an unconditional
        // branch and the next label.
        let mut dead = false;
        let before = stmts.len();
        stmts.retain(|stmt| {
            if matches!(stmt.kind, StmtKind::Label(_)) {
                dead = false;
            }
            let keep = !dead;
            if matches!(
                stmt.kind,
                StmtKind::Goto(_) | StmtKind::Return | StmtKind::End
            ) {
                dead = true;
            }
            keep
        });
        self.dead_statements += before - stmts.len();

        // Fold IF arms with literal conditions.
        for stmt in stmts.iter_mut() {
            self.fold_literal_if(stmt);
        }
    }

    fn optimize_stmt(&mut self, stmt: &mut Statement) {
        match &mut stmt.kind {
            StmtKind::Assign { value, .. } => self.fold_expr(value),
            StmtKind::Print { channel, items } => {
                if let Some(ch) = channel {
                    self.fold_expr(ch);
                }
                for item in items {
                    self.fold_expr(&mut item.expr);
                }
            }
            StmtKind::If { arms, else_body } => {
                for (cond, body) in arms.iter_mut() {
                    self.fold_expr(cond);
                    self.optimize_block(body);
                }
                if let Some(body) = else_body {
                    self.optimize_block(body);
                }
            }
            StmtKind::Select {
                selector,
                arms,
                else_body,
            } => {
                self.fold_expr(selector);
                for arm in arms {
                    for test in &mut arm.tests {
                        match test {
                            CaseTest::Value(e) | CaseTest::Is(_, e) => self.fold_expr(e),
                        }
                    }
                    self.optimize_block(&mut arm.body);
                }
                if let Some(body) = else_body {
                    self.optimize_block(body);
                }
            }
            StmtKind::For {
                from,
                to,
                step,
                body,
                ..
            } => {
                self.fold_expr(from);
                self.fold_expr(to);
                if let Some(step) = step {
                    self.fold_expr(step);
                }
                self.optimize_block(body);
            }
            StmtKind::While { cond, body } => {
                self.fold_expr(cond);
                self.optimize_block(body);
            }
            StmtKind::Repeat { body, until } => {
                self.optimize_block(body);
                self.fold_expr(until);
            }
            StmtKind::DoLoop { pre, post, body } => {
                if let Some((_, cond)) = pre {
                    self.fold_expr(cond);
                }
                self.optimize_block(body);
                if let Some((_, cond)) = post {
                    self.fold_expr(cond);
                }
            }
            StmtKind::OnGoto { selector, .. } => self.fold_expr(selector),
            StmtKind::CallSub { args, .. } | StmtKind::Command { args, .. } => {
                for arg in args {
                    self.fold_expr(arg);
                }
            }
            StmtKind::Write { channel, items } => {
                self.fold_expr(channel);
                for item in items {
                    self.fold_expr(item);
                }
            }
            StmtKind::Timer { amount, .. } => self.fold_expr(amount),
            StmtKind::StopTimer(StopTimerTarget::Id(expr)) => self.fold_expr(expr),
            StmtKind::Open { path, number, .. } => {
                self.fold_expr(path);
                self.fold_expr(number);
            }
            StmtKind::Close { number: Some(n) } => self.fold_expr(n),
            StmtKind::Sub { body, .. } | StmtKind::Function { body, .. } => {
                self.optimize_block(body);
            }
            StmtKind::DefFn { body, .. } => self.fold_expr(body),
            StmtKind::Dim(decls) | StmtKind::Redim { decls, .. } => {
                for decl in decls {
                    for dim in &mut decl.dims {
                        self.fold_expr(dim);
                    }
                }
            }
            _ => {}
        }
    }

    /// `IF 1 THEN a ELSE b` → `a`; `IF 0 THEN a ELSE b` → `b`. Only applies
    /// when the surviving body contains no labels needed by other code, which
    /// is guaranteed here because label statements make the arm non-foldable.
    fn fold_literal_if(&mut self, stmt: &mut Statement) {
        let StmtKind::If { arms, else_body } = &stmt.kind else {
            return;
        };
        let Some(first) = arms.first() else { return };
        let truth = match first.0.kind {
            ExprKind::IntLit(n) => Some(n != 0),
            ExprKind::RealLit(d) => Some(d != 0.0),
            _ => None,
        };
        let Some(truth) = truth else { return };

        let has_labels = |body: &[Statement]| {
            body.iter().any(|s| matches!(s.kind, StmtKind::Label(_)))
        };

        if truth {
            if has_labels(&first.1) {
                return;
            }
            let body = arms[0].1.clone();
            self.folded_branches += 1;
            stmt.kind = wrap_body(body);
        } else if arms.len() == 1 {
            let replacement = else_body.clone().unwrap_or_default();
            if has_labels(&replacement) {
                return;
            }
            self.folded_branches += 1;
            stmt.kind = wrap_body(replacement);
        }
    }

    // -- expressions -------------------------------------------------------

    fn fold_expr(&mut self, expr: &mut Expr) {
        match &mut expr.kind {
            ExprKind::Unary(op, operand) => {
                self.fold_expr(operand);
                let op = *op;
                if let Some(folded) = self.fold_unary(op, operand) {
                    self.constant_folds += 1;
                    expr.kind = folded;
                    return;
                }
                // -(-x) → x, NOT NOT x → x
                if let ExprKind::Unary(inner_op, inner) = &operand.kind
                    && *inner_op == op
                {
                    self.identities += 1;
                    expr.kind = inner.kind.clone();
                }
            }
            ExprKind::Binary(op, lhs, rhs) => {
                self.fold_expr(lhs);
                self.fold_expr(rhs);
                let op = *op;
                if let Some(folded) = self.fold_binary(op, lhs, rhs) {
                    self.constant_folds += 1;
                    expr.kind = folded;
                    return;
                }
                if let Some(rewritten) = self.algebraic_identity(op, lhs, rhs) {
                    self.identities += 1;
                    expr.kind = rewritten;
                }
            }
            ExprKind::ArrayRef(_, args)
            | ExprKind::IndexOrCall(_, args)
            | ExprKind::FnCall { args, .. }
            | ExprKind::UserCall { args, .. } => {
                for arg in args {
                    self.fold_expr(arg);
                }
            }
            _ => {}
        }
    }

    fn fold_unary(&self, op: UnOp, operand: &Expr) -> Option<ExprKind> {
        match (op, &operand.kind) {
            (UnOp::Neg, ExprKind::IntLit(n)) => Some(ExprKind::IntLit(n.wrapping_neg())),
            (UnOp::Neg, ExprKind::RealLit(d)) => Some(ExprKind::RealLit(-d)),
            (UnOp::Not, ExprKind::IntLit(n)) => Some(ExprKind::IntLit(match self.options.logic_mode
            {
                LogicMode::Bitwise => !n,
                LogicMode::Logical => {
                    if *n == 0 {
                        1
                    } else {
                        0
                    }
                }
            })),
            _ => None,
        }
    }

    fn fold_binary(&self, op: BinOp, lhs: &Expr, rhs: &Expr) -> Option<ExprKind> {
        use ExprKind::{IntLit, RealLit, StrLit};

        if let (StrLit(a), StrLit(b)) = (&lhs.kind, &rhs.kind) {
            return match op {
                BinOp::Add => Some(StrLit(format!("{}{}", a, b))),
                BinOp::Eq => Some(IntLit((a == b) as i64)),
                BinOp::Ne => Some(IntLit((a != b) as i64)),
                BinOp::Lt => Some(IntLit((a < b) as i64)),
                BinOp::Le => Some(IntLit((a <= b) as i64)),
                BinOp::Gt => Some(IntLit((a > b) as i64)),
                BinOp::Ge => Some(IntLit((a >= b) as i64)),
                _ => None,
            };
        }

        if let (IntLit(a), IntLit(b)) = (&lhs.kind, &rhs.kind) {
            let (a, b) = (*a, *b);
            return match op {
                BinOp::Add => Some(IntLit(a.wrapping_add(b))),
                BinOp::Sub => Some(IntLit(a.wrapping_sub(b))),
                BinOp::Mul => Some(IntLit(a.wrapping_mul(b))),
                BinOp::Div => {
                    if b != 0 {
                        Some(RealLit(a as f64 / b as f64))
                    } else {
                        None
                    }
                }
                BinOp::IntDiv => {
                    if b != 0 {
                        Some(IntLit(a.wrapping_div(b)))
                    } else {
                        None
                    }
                }
                BinOp::Mod => {
                    if b != 0 {
                        Some(IntLit(a.wrapping_rem(b)))
                    } else {
                        None
                    }
                }
                BinOp::Pow => Some(RealLit((a as f64).powf(b as f64))),
                BinOp::Eq => Some(IntLit((a == b) as i64)),
                BinOp::Ne => Some(IntLit((a != b) as i64)),
                BinOp::Lt => Some(IntLit((a < b) as i64)),
                BinOp::Le => Some(IntLit((a <= b) as i64)),
                BinOp::Gt => Some(IntLit((a > b) as i64)),
                BinOp::Ge => Some(IntLit((a >= b) as i64)),
                BinOp::And | BinOp::Or | BinOp::Xor | BinOp::Eqv | BinOp::Imp => {
                    Some(IntLit(self.fold_logic(op, a, b)))
                }
            };
        }

        // Mixed numeric literals fold as doubles.
        let as_double = |e: &Expr| match e.kind {
            IntLit(n) => Some(n as f64),
            RealLit(d) => Some(d),
            _ => None,
        };
        if let (Some(a), Some(b)) = (as_double(lhs), as_double(rhs)) {
            return match op {
                BinOp::Add => Some(RealLit(a + b)),
                BinOp::Sub => Some(RealLit(a - b)),
                BinOp::Mul => Some(RealLit(a * b)),
                BinOp::Div => Some(RealLit(a / b)),
                BinOp::Pow => Some(RealLit(a.powf(b))),
                BinOp::Eq => Some(IntLit((a == b) as i64)),
                BinOp::Ne => Some(IntLit((a != b) as i64)),
                BinOp::Lt => Some(IntLit((a < b) as i64)),
                BinOp::Le => Some(IntLit((a <= b) as i64)),
                BinOp::Gt => Some(IntLit((a > b) as i64)),
                BinOp::Ge => Some(IntLit((a >= b) as i64)),
                _ => None,
            };
        }
        None
    }

    fn fold_logic(&self, op: BinOp, a: i64, b: i64) -> i64 {
        match self.options.logic_mode {
            LogicMode::Bitwise => match op {
                BinOp::And => a & b,
                BinOp::Or => a | b,
                BinOp::Xor => a ^ b,
                BinOp::Eqv => !(a ^ b),
                BinOp::Imp => !a | b,
                _ => unreachable!(),
            },
            LogicMode::Logical => {
                let (ta, tb) = (a != 0, b != 0);
                let result = match op {
                    BinOp::And => ta && tb,
                    BinOp::Or => ta || tb,
                    BinOp::Xor => ta != tb,
                    BinOp::Eqv => ta == tb,
                    BinOp::Imp => !ta || tb,
                    _ => unreachable!(),
                };
                result as i64
            }
        }
    }

    /// `x+0`, `x-0`, `x*1`, `x/1`, `x*0` (pure x only).
    fn algebraic_identity(&self, op: BinOp, lhs: &Expr, rhs: &Expr) -> Option<ExprKind> {
        let is_zero = |e: &Expr| {
            matches!(e.kind, ExprKind::IntLit(0)) || matches!(e.kind, ExprKind::RealLit(d) if d == 0.0)
        };
        let is_one = |e: &Expr| {
            matches!(e.kind, ExprKind::IntLit(1)) || matches!(e.kind, ExprKind::RealLit(d) if d == 1.0)
        };

        match op {
            BinOp::Add => {
                if is_zero(rhs) && is_pure_numeric(lhs) {
                    return Some(lhs.kind.clone());
                }
                if is_zero(lhs) && is_pure_numeric(rhs) {
                    return Some(rhs.kind.clone());
                }
            }
            BinOp::Sub => {
                if is_zero(rhs) && is_pure_numeric(lhs) {
                    return Some(lhs.kind.clone());
                }
            }
            BinOp::Mul => {
                if is_one(rhs) && is_pure_numeric(lhs) {
                    return Some(lhs.kind.clone());
                }
                if is_one(lhs) && is_pure_numeric(rhs) {
                    return Some(rhs.kind.clone());
                }
                if (is_zero(rhs) && is_pure_numeric(lhs))
                    || (is_zero(lhs) && is_pure_numeric(rhs))
                {
                    return Some(ExprKind::IntLit(0));
                }
            }
            BinOp::Div => {
                if is_one(rhs) && is_pure_numeric(lhs) {
                    return Some(lhs.kind.clone());
                }
            }
            _ => {}
        }
        None
    }
}

/// Re-wrap a folded IF arm as a statement kind.
fn wrap_body(mut body: Vec<Statement>) -> StmtKind {
    match body.len() {
        0 => StmtKind::Rem,
        1 => body.remove(0).kind,
        // Multiple statements survive as a trivially-true IF arm.
        _ => StmtKind::If {
            arms: vec![(Expr::int(1, crate::token::SourceLoc::default()), body)],
            else_body: None,
        },
    }
}

/// Side-effect-free and numeric: literals, variables, constants, and
/// compositions of them. Calls are never pure here.
fn is_pure_numeric(expr: &Expr) -> bool {
    match &expr.kind {
        ExprKind::IntLit(_) | ExprKind::RealLit(_) => true,
        ExprKind::Var(v) => v.value_type().is_numeric(),
        ExprKind::ConstRef(_, _) => true,
        ExprKind::Unary(_, inner) => is_pure_numeric(inner),
        ExprKind::Binary(op, lhs, rhs) => {
            !matches!(op, BinOp::Div | BinOp::IntDiv | BinOp::Mod)
                && is_pure_numeric(lhs)
                && is_pure_numeric(rhs)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::SourceLoc;

    fn int(n: i64) -> Expr {
        Expr::int(n, SourceLoc::default())
    }

    fn bin(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::new(
            ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)),
            SourceLoc::default(),
        )
    }

    fn optimizer() -> AstOptimizer {
        AstOptimizer::new(CompilerOptions::default())
    }

    #[test]
    fn folds_integer_arithmetic_with_wraparound() {
        let mut opt = optimizer();
        let mut e = bin(BinOp::Add, int(i64::MAX), int(1));
        opt.fold_expr(&mut e);
        assert_eq!(e.kind, ExprKind::IntLit(i64::MIN));
        assert_eq!(opt.constant_folds, 1);
    }

    #[test]
    fn folds_nested_expressions() {
        let mut opt = optimizer();
        let mut e = bin(BinOp::Mul, bin(BinOp::Add, int(2), int(3)), int(4));
        opt.fold_expr(&mut e);
        assert_eq!(e.kind, ExprKind::IntLit(20));
    }

    #[test]
    fn division_by_zero_is_left_to_runtime() {
        let mut opt = optimizer();
        let mut e = bin(BinOp::IntDiv, int(1), int(0));
        opt.fold_expr(&mut e);
        assert!(matches!(e.kind, ExprKind::Binary(BinOp::IntDiv, _, _)));
    }

    #[test]
    fn string_concat_folds() {
        let mut opt = optimizer();
        let mut e = bin(
            BinOp::Add,
            Expr::new(ExprKind::StrLit("foo".into()), SourceLoc::default()),
            Expr::new(ExprKind::StrLit("bar".into()), SourceLoc::default()),
        );
        opt.fold_expr(&mut e);
        assert_eq!(e.kind, ExprKind::StrLit("foobar".into()));
    }

    #[test]
    fn logic_mode_changes_not_folding() {
        let mut bitwise = optimizer();
        let mut e = Expr::new(
            ExprKind::Unary(UnOp::Not, Box::new(int(0))),
            SourceLoc::default(),
        );
        bitwise.fold_expr(&mut e);
        assert_eq!(e.kind, ExprKind::IntLit(-1));

        let mut logical = AstOptimizer::new(CompilerOptions {
            logic_mode: LogicMode::Logical,
            ..CompilerOptions::default()
        });
        let mut e = Expr::new(
            ExprKind::Unary(UnOp::Not, Box::new(int(0))),
            SourceLoc::default(),
        );
        logical.fold_expr(&mut e);
        assert_eq!(e.kind, ExprKind::IntLit(1));
    }

    #[test]
    fn identity_x_plus_zero() {
        let mut opt = optimizer();
        let x = Expr::new(
            ExprKind::Var(VarRef {
                name: "X".into(),
                suffix: crate::token::TypeSuffix::None,
                loc: SourceLoc::default(),
            }),
            SourceLoc::default(),
        );
        let mut e = bin(BinOp::Add, x.clone(), int(0));
        opt.fold_expr(&mut e);
        assert_eq!(e.kind, x.kind);
        assert_eq!(opt.identities, 1);
    }

    #[test]
    fn x_times_zero_requires_purity() {
        let mut opt = optimizer();
        // A call operand must not be erased.
        let call = Expr::new(
            ExprKind::UserCall {
                name: "F%".into(),
                args: vec![],
            },
            SourceLoc::default(),
        );
        let mut e = bin(BinOp::Mul, call.clone(), int(0));
        opt.fold_expr(&mut e);
        assert_eq!(e.kind, ExprKind::Binary(BinOp::Mul, Box::new(call), Box::new(int(0))));
    }

    #[test]
    fn double_negation_cancels() {
        let mut opt = optimizer();
        let x = Expr::new(
            ExprKind::Var(VarRef {
                name: "X".into(),
                suffix: crate::token::TypeSuffix::None,
                loc: SourceLoc::default(),
            }),
            SourceLoc::default(),
        );
        let mut e = Expr::new(
            ExprKind::Unary(
                UnOp::Neg,
                Box::new(Expr::new(
                    ExprKind::Unary(UnOp::Neg, Box::new(x.clone())),
                    SourceLoc::default(),
                )),
            ),
            SourceLoc::default(),
        );
        opt.fold_expr(&mut e);
        assert_eq!(e.kind, x.kind);
    }

    #[test]
    fn dead_code_removed_until_label() {
        let mk = |kind| Statement::new(kind, SourceLoc::default(), None);
        let mut stmts = vec![
            mk(StmtKind::Goto("L1".into())),
            mk(StmtKind::Assign {
                target: LValue::Var(VarRef {
                    name: "X".into(),
                    suffix: crate::token::TypeSuffix::None,
                    loc: SourceLoc::default(),
                }),
                value: int(1),
            }),
            mk(StmtKind::Label("L1".into())),
            mk(StmtKind::End),
        ];
        let mut opt = optimizer();
        opt.optimize_block(&mut stmts);
        assert_eq!(stmts.len(), 3);
        assert!(matches!(stmts[1].kind, StmtKind::Label(_)));
        assert_eq!(opt.dead_statements, 1);
    }

    #[test]
    fn literal_if_folds_to_taken_arm() {
        let mk = |kind| Statement::new(kind, SourceLoc::default(), None);
        let mut stmts = vec![mk(StmtKind::If {
            arms: vec![(int(0), vec![mk(StmtKind::End)])],
            else_body: Some(vec![mk(StmtKind::Rem)]),
        })];
        let mut opt = optimizer();
        opt.optimize_block(&mut stmts);
        assert!(matches!(stmts[0].kind, StmtKind::Rem));
        assert_eq!(opt.folded_branches, 1);
    }
}
