//! Abstract syntax tree for BASIC programs.
//!
//! Two tagged families, [`Statement`] and [`Expr`], under a [`Program`] whose
//! leaves are BASIC lines. Every node carries its source location; statements
//! additionally carry the originating BASIC line number when the source had
//! one, so downstream diagnostics and runtime errors can cite it.
//!
//! The parser leaves two constructs unresolved for the semantic analyzer to
//! settle: [`ExprKind::IndexOrCall`] (array reference vs. user-function call)
//! and [`StmtKind::ImplicitCall`] (parameterless sub call vs. `GOTO` to a
//! label, which is how a rewritten `IF … THEN L30` arrives).

use crate::token::{SourceLoc, TypeSuffix};

/// Scalar value categories tracked by the type rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Integer,
    Single,
    Double,
    String,
}

impl ValueType {
    pub fn is_numeric(&self) -> bool {
        !matches!(self, ValueType::String)
    }

    /// The type a bare identifier infers from its suffix.
    pub fn from_suffix(suffix: TypeSuffix) -> ValueType {
        match suffix {
            TypeSuffix::Str => ValueType::String,
            TypeSuffix::Int => ValueType::Integer,
            TypeSuffix::Double => ValueType::Double,
            TypeSuffix::Single => ValueType::Single,
            TypeSuffix::None => ValueType::Double,
        }
    }
}

/// A variable reference: canonical upper-case name plus the type suffix that
/// is part of its identity.
#[derive(Debug, Clone, PartialEq)]
pub struct VarRef {
    pub name: String,
    pub suffix: TypeSuffix,
    pub loc: SourceLoc,
}

impl VarRef {
    /// Symbol-table key: the name with its suffix character appended, so
    /// `A$`, `A%` and `A` stay distinct.
    pub fn key(&self) -> String {
        match self.suffix.as_char() {
            Some(c) => format!("{}{}", self.name, c),
            None => self.name.clone(),
        }
    }

    pub fn value_type(&self) -> ValueType {
        ValueType::from_suffix(self.suffix)
    }
}

/// Binary operators in precedence-climbing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Imp,
    Eqv,
    Or,
    Xor,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    IntDiv,
    Mod,
    Pow,
}

impl BinOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, BinOp::And | BinOp::Or | BinOp::Xor | BinOp::Eqv | BinOp::Imp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

/// Expression node.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub loc: SourceLoc,
}

impl Expr {
    pub fn new(kind: ExprKind, loc: SourceLoc) -> Self {
        Expr { kind, loc }
    }

    pub fn int(n: i64, loc: SourceLoc) -> Self {
        Expr::new(ExprKind::IntLit(n), loc)
    }

    /// A literal of any shape?
    pub fn is_literal(&self) -> bool {
        matches!(
            self.kind,
            ExprKind::IntLit(_) | ExprKind::RealLit(_) | ExprKind::StrLit(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    IntLit(i64),
    RealLit(f64),
    StrLit(String),
    Var(VarRef),
    /// Resolved array element reference.
    ArrayRef(VarRef, Vec<Expr>),
    /// `name(args)` before resolution: array reference or user function call.
    IndexOrCall(VarRef, Vec<Expr>),
    /// Call to a registered function.
    FnCall {
        name: String,
        args: Vec<Expr>,
    },
    /// Call to a user `FUNCTION` or `DEF FN`.
    UserCall {
        name: String,
        args: Vec<Expr>,
    },
    /// Resolved compile-time constant (index into the constants store).
    ConstRef(usize, String),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

/// Assignment / READ / INPUT target.
#[derive(Debug, Clone, PartialEq)]
pub enum LValue {
    Var(VarRef),
    Array(VarRef, Vec<Expr>),
}

impl LValue {
    pub fn var(&self) -> &VarRef {
        match self {
            LValue::Var(v) => v,
            LValue::Array(v, _) => v,
        }
    }
}

/// Separator after a PRINT item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintSep {
    /// `;` - no separator, suppresses the trailing newline when last.
    Semicolon,
    /// `,` - advance to the next tab zone.
    Comma,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrintItem {
    pub expr: Expr,
    /// Separator following the item; `None` on the final item means the
    /// statement ends with a newline.
    pub sep: Option<PrintSep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Ms,
    Secs,
    Frames,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopTimerTarget {
    All,
    Id(Expr),
    Handler(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Input,
    Output,
    Append,
    Random,
}

impl FileMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileMode::Input => "INPUT",
            FileMode::Output => "OUTPUT",
            FileMode::Append => "APPEND",
            FileMode::Random => "RANDOM",
        }
    }
}

/// One `CASE` test.
#[derive(Debug, Clone, PartialEq)]
pub enum CaseTest {
    /// `CASE v` - equality against the selector.
    Value(Expr),
    /// `CASE IS op v`.
    Is(BinOp, Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaseArm {
    pub tests: Vec<CaseTest>,
    pub body: Vec<Statement>,
    pub loc: SourceLoc,
}

/// `DO`/`LOOP` test polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoCond {
    While,
    Until,
}

/// Which construct an `EXIT` leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    For,
    While,
    Do,
    Sub,
    Function,
}

/// `DIM` / `REDIM` declarator.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayDecl {
    pub var: VarRef,
    pub dims: Vec<Expr>,
}

/// Statement node.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub kind: StmtKind,
    pub loc: SourceLoc,
    pub basic_line: Option<u32>,
}

impl Statement {
    pub fn new(kind: StmtKind, loc: SourceLoc, basic_line: Option<u32>) -> Self {
        Statement {
            kind,
            loc,
            basic_line,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Assign {
        target: LValue,
        value: Expr,
    },
    Print {
        channel: Option<Expr>,
        items: Vec<PrintItem>,
    },
    Input {
        prompt: Option<String>,
        channel: Option<Expr>,
        targets: Vec<LValue>,
    },
    LineInput {
        channel: Option<Expr>,
        target: LValue,
    },
    /// Block IF: `(cond, body)` arms in order, then the optional ELSE body.
    If {
        arms: Vec<(Expr, Vec<Statement>)>,
        else_body: Option<Vec<Statement>>,
    },
    Select {
        selector: Expr,
        arms: Vec<CaseArm>,
        else_body: Option<Vec<Statement>>,
    },
    For {
        var: VarRef,
        from: Expr,
        to: Expr,
        step: Option<Expr>,
        body: Vec<Statement>,
    },
    While {
        cond: Expr,
        body: Vec<Statement>,
    },
    Repeat {
        body: Vec<Statement>,
        until: Expr,
    },
    DoLoop {
        pre: Option<(DoCond, Expr)>,
        post: Option<(DoCond, Expr)>,
        body: Vec<Statement>,
    },
    Goto(String),
    Gosub(String),
    Return,
    OnGoto {
        selector: Expr,
        targets: Vec<String>,
        gosub: bool,
    },
    Read(Vec<LValue>),
    Restore(RestoreTarget),
    Dim(Vec<ArrayDecl>),
    Redim {
        preserve: bool,
        decls: Vec<ArrayDecl>,
    },
    Erase(Vec<VarRef>),
    Const {
        name: String,
        value: Expr,
    },
    DefFn {
        name: VarRef,
        params: Vec<VarRef>,
        body: Expr,
    },
    Sub {
        name: String,
        params: Vec<VarRef>,
        body: Vec<Statement>,
    },
    Function {
        name: VarRef,
        params: Vec<VarRef>,
        body: Vec<Statement>,
    },
    /// `CALL name(args)` or `name args` with arguments.
    CallSub {
        name: String,
        args: Vec<Expr>,
    },
    /// Bare identifier in statement position; the semantic analyzer resolves
    /// it to a sub call or a `GOTO`.
    ImplicitCall(String),
    /// Invocation of a registered command.
    Command {
        name: String,
        args: Vec<Expr>,
    },
    Exit(ExitKind),
    Open {
        path: Expr,
        mode: FileMode,
        number: Expr,
    },
    Close {
        number: Option<Expr>,
    },
    Write {
        channel: Expr,
        items: Vec<Expr>,
    },
    Timer {
        every: bool,
        amount: Expr,
        unit: TimeUnit,
        handler: String,
    },
    StopTimer(StopTimerTarget),
    Label(String),
    Rem,
    End,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RestoreTarget {
    Start,
    Line(u32),
    Label(String),
}

/// One source line: the optional BASIC line number and its statements.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramLine {
    pub basic_line: Option<u32>,
    pub statements: Vec<Statement>,
    pub loc: SourceLoc,
}

/// A parsed program.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    pub lines: Vec<ProgramLine>,
}

impl Program {
    pub fn new() -> Self {
        Program::default()
    }

    /// Iterate every top-level statement in source order.
    pub fn statements(&self) -> impl Iterator<Item = &Statement> {
        self.lines.iter().flat_map(|l| l.statements.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_keys_distinguish_suffixes() {
        let loc = SourceLoc::default();
        let a_str = VarRef { name: "A".into(), suffix: TypeSuffix::Str, loc };
        let a_int = VarRef { name: "A".into(), suffix: TypeSuffix::Int, loc };
        let a = VarRef { name: "A".into(), suffix: TypeSuffix::None, loc };
        assert_eq!(a_str.key(), "A$");
        assert_eq!(a_int.key(), "A%");
        assert_eq!(a.key(), "A");
    }

    #[test]
    fn suffix_types() {
        assert_eq!(ValueType::from_suffix(TypeSuffix::Str), ValueType::String);
        assert_eq!(ValueType::from_suffix(TypeSuffix::Int), ValueType::Integer);
        assert_eq!(ValueType::from_suffix(TypeSuffix::None), ValueType::Double);
        assert!(ValueType::Integer.is_numeric());
        assert!(!ValueType::String.is_numeric());
    }
}
