//! The stack-based intermediate representation.
//!
//! A linear instruction sequence over an implicit operand stack. Every
//! straight-line region has a statically computable stack effect, and every
//! basic block nets to zero. The IR owns the DATA segment and restore tables
//! alongside the instructions; the AST and CFG can be dropped once IR
//! generation completes.

use crate::ast::ValueType;
use crate::config::CompilerOptions;
use crate::semantic::ProcKind;
use basic_core::DataSegment;
use std::fmt;

/// One stack instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    // Constants and variable access
    PushInt(i64),
    PushReal(f64),
    PushStr(String),
    Load(String),
    Store(String),
    LoadIndex { name: String, arity: usize },
    StoreIndex { name: String, arity: usize },
    LoadConst(usize),
    /// Discard the top of stack.
    Pop,

    // Arithmetic and comparison
    Add,
    Concat,
    Sub,
    Mul,
    Div,
    IntDiv,
    Mod,
    Pow,
    Neg,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,

    // Logical family (OPTION LOGICAL)
    LogAnd,
    LogOr,
    LogNot,
    LogXor,
    LogEqv,
    LogImp,

    // Bitwise family (OPTION BITWISE)
    BitAnd,
    BitOr,
    BitNot,
    BitXor,
    BitEqv,
    BitImp,

    // Control flow
    Jmp(String),
    Jz(String),
    Jnz(String),
    Label(String),
    /// Call a user-defined sub/function; `returns` pushes one value.
    Call {
        name: String,
        arity: usize,
        returns: bool,
    },
    Ret,
    /// `GOSUB`: record `resume` and jump to `target`. The `resume` label is
    /// emitted immediately after.
    Gosub { target: String, resume: String },
    /// `RETURN` to the most recent GOSUB resume point.
    GosubRet,
    Halt,

    // Registry/host invocation
    Invoke {
        target: String,
        arity: usize,
        returns: bool,
        pure: bool,
    },

    // Arrays
    DimArray {
        name: String,
        arity: usize,
        preserve: bool,
    },
    EraseArray(String),

    // DATA / READ / RESTORE
    ReadInt,
    ReadReal,
    ReadStr,
    Restore,
    RestoreLine(u32),
    RestoreLabel(String),

    // Timers and events
    AfterMs(String),
    EveryMs(String),
    AfterFrames(String),
    EveryFrames(String),
    StopTimerId,
    StopTimerNamed(String),
    StopTimerAll,
    /// Cooperative yield: pump timer events and the interrupt flag.
    YieldCheck,

    /// Statement boundary: the BASIC line now executing (for runtime error
    /// annotation).
    Line(u32),
}

impl Instr {
    /// Net stack effect (pushes minus pops). Used by the block-balance
    /// invariant check after IR generation.
    pub fn stack_effect(&self) -> isize {
        match self {
            Instr::PushInt(_) | Instr::PushReal(_) | Instr::PushStr(_) => 1,
            Instr::Load(_) | Instr::LoadConst(_) => 1,
            Instr::LoadIndex { arity, .. } => 1 - *arity as isize,
            Instr::Store(_) | Instr::Pop => -1,
            Instr::StoreIndex { arity, .. } => -(*arity as isize) - 1,
            Instr::Add
            | Instr::Concat
            | Instr::Sub
            | Instr::Mul
            | Instr::Div
            | Instr::IntDiv
            | Instr::Mod
            | Instr::Pow
            | Instr::Eq
            | Instr::Ne
            | Instr::Lt
            | Instr::Le
            | Instr::Gt
            | Instr::Ge
            | Instr::LogAnd
            | Instr::LogOr
            | Instr::LogXor
            | Instr::LogEqv
            | Instr::LogImp
            | Instr::BitAnd
            | Instr::BitOr
            | Instr::BitXor
            | Instr::BitEqv
            | Instr::BitImp => -1,
            Instr::Neg | Instr::LogNot | Instr::BitNot => 0,
            Instr::Jz(_) | Instr::Jnz(_) => -1,
            Instr::Jmp(_)
            | Instr::Label(_)
            | Instr::Ret
            | Instr::Gosub { .. }
            | Instr::GosubRet
            | Instr::Halt
            | Instr::YieldCheck
            | Instr::Line(_) => 0,
            Instr::Call { arity, returns, .. } | Instr::Invoke { arity, returns, .. } => {
                (*returns as isize) - *arity as isize
            }
            Instr::DimArray { arity, .. } => -(*arity as isize),
            Instr::EraseArray(_) => 0,
            Instr::ReadInt | Instr::ReadReal | Instr::ReadStr => 1,
            Instr::Restore | Instr::RestoreLine(_) | Instr::RestoreLabel(_) => 0,
            Instr::AfterMs(_) | Instr::EveryMs(_) | Instr::AfterFrames(_) | Instr::EveryFrames(_) => {
                -1
            }
            Instr::StopTimerId => -1,
            Instr::StopTimerNamed(_) | Instr::StopTimerAll => 0,
        }
    }

    /// True for instructions that transfer control (and thus terminate any
    /// in-flight expression reconstruction).
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Instr::Jmp(_)
                | Instr::Jz(_)
                | Instr::Jnz(_)
                | Instr::Label(_)
                | Instr::Ret
                | Instr::Gosub { .. }
                | Instr::GosubRet
                | Instr::Halt
        )
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::PushInt(n) => write!(f, "push_int {}", n),
            Instr::PushReal(d) => write!(f, "push_real {}", d),
            Instr::PushStr(s) => write!(f, "push_str {:?}", s),
            Instr::Load(name) => write!(f, "load {}", name),
            Instr::Store(name) => write!(f, "store {}", name),
            Instr::LoadIndex { name, arity } => write!(f, "load_index {} {}", name, arity),
            Instr::StoreIndex { name, arity } => write!(f, "store_index {} {}", name, arity),
            Instr::LoadConst(i) => write!(f, "load_const {}", i),
            Instr::Pop => write!(f, "pop"),
            Instr::Add => write!(f, "add"),
            Instr::Concat => write!(f, "concat"),
            Instr::Sub => write!(f, "sub"),
            Instr::Mul => write!(f, "mul"),
            Instr::Div => write!(f, "div"),
            Instr::IntDiv => write!(f, "idiv"),
            Instr::Mod => write!(f, "mod"),
            Instr::Pow => write!(f, "pow"),
            Instr::Neg => write!(f, "neg"),
            Instr::Eq => write!(f, "eq"),
            Instr::Ne => write!(f, "ne"),
            Instr::Lt => write!(f, "lt"),
            Instr::Le => write!(f, "le"),
            Instr::Gt => write!(f, "gt"),
            Instr::Ge => write!(f, "ge"),
            Instr::LogAnd => write!(f, "land"),
            Instr::LogOr => write!(f, "lor"),
            Instr::LogNot => write!(f, "lnot"),
            Instr::LogXor => write!(f, "lxor"),
            Instr::LogEqv => write!(f, "leqv"),
            Instr::LogImp => write!(f, "limp"),
            Instr::BitAnd => write!(f, "band"),
            Instr::BitOr => write!(f, "bor"),
            Instr::BitNot => write!(f, "bnot"),
            Instr::BitXor => write!(f, "bxor"),
            Instr::BitEqv => write!(f, "beqv"),
            Instr::BitImp => write!(f, "bimp"),
            Instr::Jmp(l) => write!(f, "jmp {}", l),
            Instr::Jz(l) => write!(f, "jz {}", l),
            Instr::Jnz(l) => write!(f, "jnz {}", l),
            Instr::Label(l) => write!(f, "{}:", l),
            Instr::Call { name, arity, .. } => write!(f, "call {} {}", name, arity),
            Instr::Ret => write!(f, "ret"),
            Instr::Gosub { target, resume } => write!(f, "gosub {} -> {}", target, resume),
            Instr::GosubRet => write!(f, "gosub_ret"),
            Instr::Halt => write!(f, "halt"),
            Instr::Invoke { target, arity, .. } => write!(f, "invoke {} {}", target, arity),
            Instr::DimArray { name, arity, preserve } => {
                if *preserve {
                    write!(f, "redim_preserve {} {}", name, arity)
                } else {
                    write!(f, "dim {} {}", name, arity)
                }
            }
            Instr::EraseArray(name) => write!(f, "erase {}", name),
            Instr::ReadInt => write!(f, "read_int"),
            Instr::ReadReal => write!(f, "read_real"),
            Instr::ReadStr => write!(f, "read_str"),
            Instr::Restore => write!(f, "restore"),
            Instr::RestoreLine(n) => write!(f, "restore_to_line {}", n),
            Instr::RestoreLabel(l) => write!(f, "restore_to_label {}", l),
            Instr::AfterMs(h) => write!(f, "after_ms {}", h),
            Instr::EveryMs(h) => write!(f, "every_ms {}", h),
            Instr::AfterFrames(h) => write!(f, "after_frames {}", h),
            Instr::EveryFrames(h) => write!(f, "every_frames {}", h),
            Instr::StopTimerId => write!(f, "stop_timer"),
            Instr::StopTimerNamed(h) => write!(f, "stop_timer {}", h),
            Instr::StopTimerAll => write!(f, "stop_timer_all"),
            Instr::YieldCheck => write!(f, "yield_check"),
            Instr::Line(n) => write!(f, "line {}", n),
        }
    }
}

/// A compiled sub or function body.
#[derive(Debug, Clone)]
pub struct IrProc {
    pub name: String,
    pub kind: ProcKind,
    /// Parameter keys (suffix-qualified), in call order.
    pub params: Vec<String>,
    pub ret: Option<ValueType>,
    pub body: Vec<Instr>,
}

/// The complete IR for one program, carrying the DATA segment and restore
/// tables alongside the instructions.
#[derive(Debug, Clone)]
pub struct IrProgram {
    pub main: Vec<Instr>,
    pub procs: Vec<IrProc>,
    pub data: DataSegment,
    /// Synthesized loop/dispatch temporaries needing declarations.
    pub temps: Vec<String>,
    pub options: CompilerOptions,
}

impl IrProgram {
    pub fn instruction_count(&self) -> usize {
        self.main.len() + self.procs.iter().map(|p| p.body.len()).sum::<usize>()
    }

    /// Disassembly-style dump, for `-v` diagnostics and tests.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        out.push_str("; main\n");
        for instr in &self.main {
            out.push_str(&format!("  {}\n", instr));
        }
        for proc in &self.procs {
            out.push_str(&format!("; {} {}({})\n",
                match proc.kind {
                    ProcKind::Sub => "sub",
                    ProcKind::Function => "function",
                    ProcKind::DefFn => "def fn",
                },
                proc.name,
                proc.params.join(", ")
            ));
            for instr in &proc.body {
                out.push_str(&format!("  {}\n", instr));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_effects_balance_simple_assignment() {
        // X = 1 + 2
        let seq = [
            Instr::PushInt(1),
            Instr::PushInt(2),
            Instr::Add,
            Instr::Store("X".into()),
        ];
        let net: isize = seq.iter().map(Instr::stack_effect).sum();
        assert_eq!(net, 0);
    }

    #[test]
    fn invoke_effect_accounts_for_return() {
        let call = Instr::Invoke {
            target: "BASIC_LEFT".into(),
            arity: 2,
            returns: true,
            pure: true,
        };
        assert_eq!(call.stack_effect(), -1);
        let stmt = Instr::Invoke {
            target: "terminal_cls".into(),
            arity: 0,
            returns: false,
            pure: false,
        };
        assert_eq!(stmt.stack_effect(), 0);
    }

    #[test]
    fn control_instructions_are_flagged() {
        assert!(Instr::Jmp("L".into()).is_control());
        assert!(Instr::Label("L".into()).is_control());
        assert!(!Instr::Add.is_control());
        assert!(!Instr::YieldCheck.is_control());
    }

    #[test]
    fn display_round_trip_shapes() {
        assert_eq!(Instr::PushInt(5).to_string(), "push_int 5");
        assert_eq!(Instr::Load("A%".into()).to_string(), "load A%");
        assert_eq!(Instr::Jz("L1".into()).to_string(), "jz L1");
        assert_eq!(
            Instr::RestoreLabel("RESET".into()).to_string(),
            "restore_to_label RESET"
        );
    }
}
