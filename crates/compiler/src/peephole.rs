//! Peephole optimization over the stack IR.
//!
//! Local pattern rewrites applied to fixpoint within a bounded number of
//! iterations. Each rule preserves the observable behavior of the program;
//! folding only applies to total operations (no division by zero, no
//! impure invokes touched). Per-rule counters feed `--opt-stats`.

use crate::ir::{Instr, IrProgram};

/// Upper bound on rewrite iterations per body; each pass shrinks the
/// instruction vector or leaves it unchanged, so this is rarely reached.
const MAX_PASSES: usize = 8;

#[derive(Debug, Default)]
pub struct PeepholeOptimizer {
    additive_identity: usize,
    constant_folds: usize,
    jump_to_next: usize,
    unreachable_removed: usize,
    push_pop_pairs: usize,
}

impl PeepholeOptimizer {
    pub fn new() -> Self {
        PeepholeOptimizer::default()
    }

    pub fn optimize(&mut self, program: &mut IrProgram) {
        self.optimize_body(&mut program.main);
        for proc in &mut program.procs {
            self.optimize_body(&mut proc.body);
        }
    }

    pub fn report(&self) -> String {
        format!(
            "Peephole optimizer: {} identity op(s), {} constant fold(s), \
             {} jump(s) to next, {} unreachable instruction(s), {} push/pop pair(s)\n",
            self.additive_identity,
            self.constant_folds,
            self.jump_to_next,
            self.unreachable_removed,
            self.push_pop_pairs
        )
    }

    pub fn total_rewrites(&self) -> usize {
        self.additive_identity
            + self.constant_folds
            + self.jump_to_next
            + self.unreachable_removed
            + self.push_pop_pairs
    }

    fn optimize_body(&mut self, instrs: &mut Vec<Instr>) {
        for _ in 0..MAX_PASSES {
            let changed = self.remove_unreachable(instrs)
                | self.rewrite_windows(instrs)
                | self.drop_jumps_to_next(instrs);
            if !changed {
                break;
            }
        }
    }

    /// Remove instructions between an unconditional transfer and the next
    /// label.
    fn remove_unreachable(&mut self, instrs: &mut Vec<Instr>) -> bool {
        let mut dead = false;
        let before = instrs.len();
        instrs.retain(|instr| {
            if matches!(instr, Instr::Label(_)) {
                dead = false;
            }
            let keep = !dead;
            if matches!(
                instr,
                Instr::Jmp(_) | Instr::Halt | Instr::Ret | Instr::GosubRet
            ) {
                dead = true;
            }
            keep
        });
        let removed = before - instrs.len();
        self.unreachable_removed += removed;
        removed > 0
    }

    /// `jmp L` immediately followed by `L:` collapses to the label.
    fn drop_jumps_to_next(&mut self, instrs: &mut Vec<Instr>) -> bool {
        let mut changed = false;
        let mut result: Vec<Instr> = Vec::with_capacity(instrs.len());
        let mut i = 0;
        while i < instrs.len() {
            if let Instr::Jmp(target) = &instrs[i]
                && let Some(Instr::Label(label)) = instrs.get(i + 1)
                && target == label
            {
                self.jump_to_next += 1;
                changed = true;
                i += 1; // drop the jmp, keep the label
                continue;
            }
            result.push(instrs[i].clone());
            i += 1;
        }
        *instrs = result;
        changed
    }

    /// Two- and three-instruction window rewrites.
    fn rewrite_windows(&mut self, instrs: &mut Vec<Instr>) -> bool {
        let mut changed = false;
        let mut result: Vec<Instr> = Vec::with_capacity(instrs.len());
        let mut i = 0;
        while i < instrs.len() {
            // push k; pop  →  (nothing), for side-effect-free pushes.
            if is_pure_push(&instrs[i]) && matches!(instrs.get(i + 1), Some(Instr::Pop)) {
                self.push_pop_pairs += 1;
                changed = true;
                i += 2;
                continue;
            }

            // push_int 0; add / sub  and  push_int 1; mul / idiv.
            if let Instr::PushInt(k) = instrs[i] {
                let next = instrs.get(i + 1);
                let identity = matches!((k, next), (0, Some(Instr::Add)) | (0, Some(Instr::Sub)))
                    || matches!((k, next), (1, Some(Instr::Mul)) | (1, Some(Instr::IntDiv)));
                if identity {
                    self.additive_identity += 1;
                    changed = true;
                    i += 2;
                    continue;
                }
            }

            // push_int a; push_int b; <total binop>  →  push_int result.
            if let (Instr::PushInt(a), Some(Instr::PushInt(b))) = (&instrs[i], instrs.get(i + 1))
                && let Some(op) = instrs.get(i + 2)
                && let Some(folded) = fold_int_pair(*a, *b, op)
            {
                self.constant_folds += 1;
                changed = true;
                result.push(folded);
                i += 3;
                continue;
            }

            result.push(instrs[i].clone());
            i += 1;
        }
        *instrs = result;
        changed
    }
}

fn is_pure_push(instr: &Instr) -> bool {
    matches!(
        instr,
        Instr::PushInt(_)
            | Instr::PushReal(_)
            | Instr::PushStr(_)
            | Instr::Load(_)
            | Instr::LoadConst(_)
    )
}

/// Fold `a <op> b` for operations that are total over i64.
fn fold_int_pair(a: i64, b: i64, op: &Instr) -> Option<Instr> {
    let result = match op {
        Instr::Add => a.wrapping_add(b),
        Instr::Sub => a.wrapping_sub(b),
        Instr::Mul => a.wrapping_mul(b),
        Instr::Eq => (a == b) as i64,
        Instr::Ne => (a != b) as i64,
        Instr::Lt => (a < b) as i64,
        Instr::Le => (a <= b) as i64,
        Instr::Gt => (a > b) as i64,
        Instr::Ge => (a >= b) as i64,
        Instr::BitAnd => a & b,
        Instr::BitOr => a | b,
        Instr::BitXor => a ^ b,
        Instr::BitEqv => !(a ^ b),
        Instr::BitImp => !a | b,
        _ => return None,
    };
    Some(Instr::PushInt(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerOptions;
    use basic_core::DataSegment;

    fn program(main: Vec<Instr>) -> IrProgram {
        IrProgram {
            main,
            procs: Vec::new(),
            data: DataSegment::new(),
            temps: Vec::new(),
            options: CompilerOptions::default(),
        }
    }

    #[test]
    fn add_zero_is_dropped() {
        let mut prog = program(vec![
            Instr::Load("X".into()),
            Instr::PushInt(0),
            Instr::Add,
            Instr::Store("Y".into()),
        ]);
        let mut opt = PeepholeOptimizer::new();
        opt.optimize(&mut prog);
        assert_eq!(
            prog.main,
            vec![Instr::Load("X".into()), Instr::Store("Y".into())]
        );
        assert_eq!(opt.additive_identity, 1);
    }

    #[test]
    fn jump_to_next_label_collapses() {
        let mut prog = program(vec![
            Instr::Jmp("L1".into()),
            Instr::Label("L1".into()),
            Instr::Halt,
        ]);
        let mut opt = PeepholeOptimizer::new();
        opt.optimize(&mut prog);
        assert_eq!(prog.main, vec![Instr::Label("L1".into()), Instr::Halt]);
    }

    #[test]
    fn unreachable_between_jump_and_label_removed() {
        let mut prog = program(vec![
            Instr::Jmp("L2".into()),
            Instr::PushInt(1),
            Instr::Store("X".into()),
            Instr::Label("L2".into()),
            Instr::Halt,
        ]);
        let mut opt = PeepholeOptimizer::new();
        opt.optimize(&mut prog);
        // The dead stores go first; the jmp then collapses into its label.
        assert_eq!(prog.main, vec![Instr::Label("L2".into()), Instr::Halt]);
        assert_eq!(opt.unreachable_removed, 2);
        assert_eq!(opt.jump_to_next, 1);
    }

    #[test]
    fn adjacent_int_pushes_fold() {
        let mut prog = program(vec![
            Instr::PushInt(2),
            Instr::PushInt(3),
            Instr::Add,
            Instr::Store("X".into()),
        ]);
        let mut opt = PeepholeOptimizer::new();
        opt.optimize(&mut prog);
        assert_eq!(
            prog.main,
            vec![Instr::PushInt(5), Instr::Store("X".into())]
        );
    }

    #[test]
    fn division_is_not_folded() {
        let mut prog = program(vec![
            Instr::PushInt(1),
            Instr::PushInt(0),
            Instr::IntDiv,
            Instr::Store("X".into()),
        ]);
        let mut opt = PeepholeOptimizer::new();
        opt.optimize(&mut prog);
        assert_eq!(prog.main.len(), 4);
        assert_eq!(opt.constant_folds, 0);
    }

    #[test]
    fn pure_push_then_pop_vanishes() {
        let mut prog = program(vec![
            Instr::Load("X".into()),
            Instr::Pop,
            Instr::Halt,
        ]);
        let mut opt = PeepholeOptimizer::new();
        opt.optimize(&mut prog);
        assert_eq!(prog.main, vec![Instr::Halt]);
    }

    #[test]
    fn impure_invoke_result_pop_is_kept() {
        let mut prog = program(vec![
            Instr::Invoke {
                target: "terminal_inkey".into(),
                arity: 0,
                returns: true,
                pure: false,
            },
            Instr::Pop,
            Instr::Halt,
        ]);
        let mut opt = PeepholeOptimizer::new();
        opt.optimize(&mut prog);
        assert_eq!(prog.main.len(), 3);
    }

    #[test]
    fn fixpoint_cascades() {
        // ((1 + 2) + 3) folds completely.
        let mut prog = program(vec![
            Instr::PushInt(1),
            Instr::PushInt(2),
            Instr::Add,
            Instr::PushInt(3),
            Instr::Add,
            Instr::Store("X".into()),
        ]);
        let mut opt = PeepholeOptimizer::new();
        opt.optimize(&mut prog);
        assert_eq!(
            prog.main,
            vec![Instr::PushInt(6), Instr::Store("X".into())]
        );
        assert_eq!(opt.constant_folds, 2);
    }
}
