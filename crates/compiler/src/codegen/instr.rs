//! Per-instruction Lua emission and the symbolic stack model.
//!
//! The model mirrors the operand stack with one [`SymEntry`] per virtual
//! slot. Pure operations combine entries textually without emitting
//! anything; any instruction that actually emits a statement first spills
//! the entries it will not consume (evaluating them, in order, onto the real
//! runtime stack), which both preserves effect ordering and implements the
//! in-block SSA rule: an entry that cached a variable load is forced to
//! memory before any store could invalidate it. Control-flow opcodes flush
//! the whole model and reset it.

use super::names::{lua_number, lua_string, mangle_proc};
use super::{CodeGenError, LuaCodeGen, Region};
use crate::ir::Instr;

/// One symbolic stack slot.
#[derive(Debug, Clone)]
pub struct SymEntry {
    /// Lua expression text.
    pub text: String,
    /// Free of side effects; impure entries are evaluated exactly once and
    /// never reordered past an emitted statement.
    pub pure: bool,
    /// Carries a Lua boolean (comparison/logical result) rather than a
    /// number or string.
    pub boolish: bool,
}

impl SymEntry {
    fn pure_value(text: String) -> Self {
        SymEntry {
            text,
            pure: true,
            boolish: false,
        }
    }

    fn impure_value(text: String) -> Self {
        SymEntry {
            text,
            pure: false,
            boolish: false,
        }
    }

    fn boolean(text: String, pure: bool) -> Self {
        SymEntry {
            text,
            pure,
            boolish: true,
        }
    }

    /// The entry as a numeric/string Lua value; `true_lit` is the numeric
    /// rendering of a true comparison.
    fn value(&self, true_lit: &str) -> String {
        if self.boolish {
            format!("(({}) and {} or 0)", self.text, true_lit)
        } else {
            self.text.clone()
        }
    }

    /// The entry as a Lua condition.
    fn cond(&self) -> String {
        if self.boolish {
            self.text.clone()
        } else {
            format!("__bool({})", self.text)
        }
    }
}

/// Heuristic: does this expression text evaluate to a Lua integer already?
fn looks_integer(text: &str) -> bool {
    if text.parse::<i64>().is_ok() {
        return true;
    }
    text.ends_with("_INT") && text.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl LuaCodeGen<'_> {
    // -- model plumbing ----------------------------------------------------

    fn push_sym(&mut self, entry: SymEntry) {
        self.model.push(entry);
    }

    /// Pop the top `n` entries, preserving their order, if the model holds
    /// at least that many.
    fn take(&mut self, n: usize) -> Option<Vec<SymEntry>> {
        if self.model.len() < n {
            return None;
        }
        Some(self.model.split_off(self.model.len() - n))
    }

    /// Evaluate and push every pending entry onto the runtime stack.
    pub(crate) fn flush(&mut self) -> Result<(), CodeGenError> {
        let pending = std::mem::take(&mut self.model);
        for entry in pending {
            let text = entry.value(self.true_lit);
            self.line(&format!("__push({})", text))?;
        }
        Ok(())
    }

    /// Spill every entry below the top `keep`, so an emitted statement
    /// cannot reorder around them.
    fn spill_below(&mut self, keep: usize) -> Result<(), CodeGenError> {
        if self.model.len() <= keep {
            return Ok(());
        }
        let kept = self.model.split_off(self.model.len() - keep);
        let spilled = std::mem::take(&mut self.model);
        for entry in spilled {
            let text = entry.value(self.true_lit);
            self.line(&format!("__push({})", text))?;
        }
        self.model = kept;
        Ok(())
    }

    /// Array index adjustment: BASIC index → 1-based Lua index.
    fn index_text(&self, entry_text: &str) -> String {
        if let Ok(n) = entry_text.parse::<i64>() {
            return (n - self.base + 1).to_string();
        }
        let raw = if looks_integer(entry_text) {
            format!("({})", entry_text)
        } else {
            format!("__toint({})", entry_text)
        };
        match self.base {
            1 => raw,
            0 => format!("({} + 1)", raw),
            base => format!("({} - {} + 1)", raw, base - 1),
        }
    }

    fn indexed_ref(&self, name: &str, indices: &[String]) -> String {
        let mut out = name.to_string();
        for index in indices {
            out.push('[');
            out.push_str(index);
            out.push(']');
        }
        out
    }

    /// Coerce a value expression for storage into `key`.
    fn store_value(&self, key: &str, value: String) -> String {
        if self.is_int_var(key) && !looks_integer(&value) {
            format!("__toint({})", value)
        } else {
            value
        }
    }

    // -- instruction dispatch ----------------------------------------------

    pub(crate) fn emit_instr(&mut self, instr: &Instr) -> Result<(), CodeGenError> {
        match instr {
            Instr::PushInt(n) => self.push_sym(SymEntry::pure_value(n.to_string())),
            Instr::PushReal(d) => self.push_sym(SymEntry::pure_value(lua_number(*d))),
            Instr::PushStr(s) => self.push_sym(SymEntry::pure_value(lua_string(s))),
            Instr::Load(key) => {
                let name = self.lua_var(key);
                self.push_sym(SymEntry::pure_value(name));
            }
            Instr::LoadConst(index) => {
                let (text, _is_str) = self.const_text(*index)?;
                self.push_sym(SymEntry::pure_value(text));
            }
            Instr::Store(key) => self.emit_store(key)?,
            Instr::LoadIndex { name, arity } => self.emit_load_index(name, *arity)?,
            Instr::StoreIndex { name, arity } => self.emit_store_index(name, *arity)?,
            Instr::Pop => self.emit_pop()?,

            Instr::Add => self.binary("(%a + %b)", false)?,
            Instr::Concat => self.binary("(%a .. %b)", false)?,
            Instr::Sub => self.binary("(%a - %b)", false)?,
            Instr::Mul => self.binary("(%a * %b)", false)?,
            Instr::Div => self.binary("(%a / %b)", false)?,
            Instr::IntDiv => self.binary("BASIC_IDIV(%a, %b)", false)?,
            Instr::Mod => self.binary("BASIC_MOD(%a, %b)", false)?,
            Instr::Pow => self.binary("(%a ^ %b)", false)?,
            Instr::Eq => self.binary("(%a == %b)", true)?,
            Instr::Ne => self.binary("(%a ~= %b)", true)?,
            Instr::Lt => self.binary("(%a < %b)", true)?,
            Instr::Le => self.binary("(%a <= %b)", true)?,
            Instr::Gt => self.binary("(%a > %b)", true)?,
            Instr::Ge => self.binary("(%a >= %b)", true)?,

            Instr::LogAnd => self.logical("(%a and %b)")?,
            Instr::LogOr => self.logical("(%a or %b)")?,
            Instr::LogXor => self.logical("(%a ~= %b)")?,
            Instr::LogEqv => self.logical("(%a == %b)")?,
            Instr::LogImp => self.logical("((not %a) or %b)")?,
            Instr::LogNot => self.unary_logical()?,

            Instr::BitAnd => self.binary("(__bits(%a) & __bits(%b))", false)?,
            Instr::BitOr => self.binary("(__bits(%a) | __bits(%b))", false)?,
            Instr::BitXor => self.binary("(__bits(%a) ~ __bits(%b))", false)?,
            Instr::BitEqv => self.binary("(~(__bits(%a) ~ __bits(%b)))", false)?,
            Instr::BitImp => self.binary("((~__bits(%a)) | __bits(%b))", false)?,
            Instr::BitNot => self.unary("(~__bits(%a))")?,
            Instr::Neg => self.unary("(-%a)")?,

            Instr::Jmp(label) => {
                self.flush()?;
                self.line(&format!("goto {}", label))?;
            }
            Instr::Jz(label) => self.emit_conditional_jump(label, true)?,
            Instr::Jnz(label) => self.emit_conditional_jump(label, false)?,
            Instr::Label(label) => {
                self.flush()?;
                self.line(&format!("::{}::", label))?;
            }
            Instr::Call {
                name,
                arity,
                returns,
            } => self.emit_call(name, *arity, *returns)?,
            Instr::Ret => {
                self.flush()?;
                let has_ret = matches!(&self.region, Region::Proc { has_ret: true, .. });
                if has_ret {
                    self.line("do return __ret end")?;
                } else {
                    self.line("do return end")?;
                }
            }
            Instr::Gosub { target, resume } => {
                self.flush()?;
                let index = self.resume_index(resume)?;
                self.line(&format!("__gosub[#__gosub + 1] = {}", index))?;
                self.line(&format!("goto {}", target))?;
            }
            Instr::GosubRet => self.emit_gosub_return()?,
            Instr::Halt => {
                self.flush()?;
                match self.region {
                    Region::Main => self.line("do return end")?,
                    // END inside a sub halts the whole program; the wrapper
                    // recognizes the sentinel.
                    Region::Proc { .. } => self.line("error(\"__HALT__\", 0)")?,
                }
            }

            Instr::Invoke {
                target,
                arity,
                returns,
                pure,
            } => self.emit_invoke(target, *arity, *returns, *pure)?,

            Instr::DimArray {
                name,
                arity,
                preserve,
            } => self.emit_dim(name, *arity, *preserve)?,
            Instr::EraseArray(name) => {
                let lua = self.lua_var(name);
                self.line(&format!("{} = nil", lua))?;
            }

            Instr::ReadInt => self.push_sym(SymEntry::impure_value("data_read_int()".to_string())),
            Instr::ReadReal => {
                self.push_sym(SymEntry::impure_value("data_read_double()".to_string()))
            }
            Instr::ReadStr => {
                self.push_sym(SymEntry::impure_value("data_read_string()".to_string()))
            }
            Instr::Restore => {
                self.spill_below(0)?;
                self.line("data_restore()")?;
            }
            Instr::RestoreLine(n) => {
                self.spill_below(0)?;
                self.line(&format!("data_restore_line({})", n))?;
            }
            Instr::RestoreLabel(label) => {
                self.spill_below(0)?;
                self.line(&format!("data_restore_label({})", lua_string(label)))?;
            }

            Instr::AfterMs(handler) => self.emit_timer("basic_timer_after_ms", handler)?,
            Instr::EveryMs(handler) => self.emit_timer("basic_timer_every_ms", handler)?,
            Instr::AfterFrames(handler) => self.emit_timer("basic_timer_after_frames", handler)?,
            Instr::EveryFrames(handler) => self.emit_timer("basic_timer_every_frames", handler)?,
            Instr::StopTimerId => {
                let id = match self.take(1) {
                    Some(mut args) => {
                        self.spill_below(0)?;
                        args.remove(0).value(self.true_lit)
                    }
                    None => "__pop()".to_string(),
                };
                self.line(&format!("basic_timer_stop({})", id))?;
            }
            Instr::StopTimerNamed(handler) => {
                self.spill_below(0)?;
                self.line(&format!(
                    "basic_timer_stop_name({})",
                    lua_string(&mangle_proc(handler))
                ))?;
            }
            Instr::StopTimerAll => {
                self.spill_below(0)?;
                self.line("basic_timer_stop_all()")?;
            }
            Instr::YieldCheck => {
                self.flush()?;
                self.line("basic_pump_events()")?;
            }

            Instr::Line(n) => {
                self.comment(&format!("BASIC line {}", n))?;
                self.line(&format!("__BL = {}", n))?;
            }
        }
        Ok(())
    }

    // -- expression operators ----------------------------------------------

    fn apply(template: &str, a: &str, b: Option<&str>) -> String {
        let mut text = template.replace("%a", a);
        if let Some(b) = b {
            text = text.replace("%b", b);
        }
        text
    }

    fn binary(&mut self, template: &str, comparison: bool) -> Result<(), CodeGenError> {
        match self.take(2) {
            Some(args) => {
                let (a, b) = (args[0].value(self.true_lit), args[1].value(self.true_lit));
                let text = Self::apply(template, &a, Some(&b));
                let pure = args[0].pure && args[1].pure;
                if comparison {
                    self.push_sym(SymEntry::boolean(text, pure));
                } else {
                    self.push_sym(SymEntry {
                        text,
                        pure,
                        boolish: false,
                    });
                }
            }
            None => {
                self.flush()?;
                let expr = Self::apply(template, "__a", Some("__b"));
                let pushed = if comparison {
                    format!("({}) and {} or 0", expr, self.true_lit)
                } else {
                    expr
                };
                self.line(&format!(
                    "do local __b = __pop() local __a = __pop() __push({}) end",
                    pushed
                ))?;
            }
        }
        Ok(())
    }

    /// Truthiness-based logical operators: operands as conditions, result a
    /// boolean entry.
    fn logical(&mut self, template: &str) -> Result<(), CodeGenError> {
        match self.take(2) {
            Some(args) => {
                let (a, b) = (args[0].cond(), args[1].cond());
                let text = Self::apply(template, &a, Some(&b));
                let pure = args[0].pure && args[1].pure;
                self.push_sym(SymEntry::boolean(text, pure));
            }
            None => {
                self.flush()?;
                let expr = Self::apply(template, "__bool(__a)", Some("__bool(__b)"));
                self.line(&format!(
                    "do local __b = __pop() local __a = __pop() __push(({}) and {} or 0) end",
                    expr, self.true_lit
                ))?;
            }
        }
        Ok(())
    }

    fn unary(&mut self, template: &str) -> Result<(), CodeGenError> {
        match self.take(1) {
            Some(args) => {
                let text = Self::apply(template, &args[0].value(self.true_lit), None);
                let pure = args[0].pure;
                self.push_sym(SymEntry {
                    text,
                    pure,
                    boolish: false,
                });
            }
            None => {
                let expr = Self::apply(template, "__a", None);
                self.line(&format!("do local __a = __pop() __push({}) end", expr))?;
            }
        }
        Ok(())
    }

    fn unary_logical(&mut self) -> Result<(), CodeGenError> {
        match self.take(1) {
            Some(args) => {
                let text = format!("(not {})", args[0].cond());
                let pure = args[0].pure;
                self.push_sym(SymEntry::boolean(text, pure));
            }
            None => {
                self.line(&format!(
                    "do local __a = __pop() __push((not __bool(__a)) and {} or 0) end",
                    self.true_lit
                ))?;
            }
        }
        Ok(())
    }

    // -- stores and loads --------------------------------------------------

    fn emit_store(&mut self, key: &str) -> Result<(), CodeGenError> {
        let name = self.lua_var(key);
        match self.take(1) {
            Some(mut args) => {
                self.spill_below(0)?;
                let value = self.store_value(key, args.remove(0).value(self.true_lit));
                self.line(&format!("{} = {}", name, value))?;
            }
            None => {
                let value = self.store_value(key, "__pop()".to_string());
                self.line(&format!("{} = {}", name, value))?;
            }
        }
        Ok(())
    }

    fn emit_load_index(&mut self, key: &str, arity: usize) -> Result<(), CodeGenError> {
        let name = self.lua_var(key);
        match self.take(arity) {
            Some(args) => {
                let indices: Vec<String> =
                    args.iter().map(|a| self.index_text(&a.value(self.true_lit))).collect();
                let pure = args.iter().all(|a| a.pure);
                let text = self.indexed_ref(&name, &indices);
                self.push_sym(SymEntry {
                    text,
                    pure,
                    boolish: false,
                });
            }
            None => {
                self.flush()?;
                let (locals, indices) = self.pop_locals("__i", arity);
                let indices: Vec<String> = indices.iter().map(|i| self.index_text(i)).collect();
                self.line(&format!(
                    "do {} __push({}) end",
                    locals,
                    self.indexed_ref(&name, &indices)
                ))?;
            }
        }
        Ok(())
    }

    fn emit_store_index(&mut self, key: &str, arity: usize) -> Result<(), CodeGenError> {
        let name = self.lua_var(key);
        let elem_int = self
            .symbols_elem_int(key);
        match self.take(arity + 1) {
            Some(mut args) => {
                self.spill_below(0)?;
                let value = args.pop().map(|v| v.value(self.true_lit)).unwrap_or_default();
                let value = if elem_int && !looks_integer(&value) {
                    format!("__toint({})", value)
                } else {
                    value
                };
                let indices: Vec<String> =
                    args.iter().map(|a| self.index_text(&a.value(self.true_lit))).collect();
                self.line(&format!("{} = {}", self.indexed_ref(&name, &indices), value))?;
            }
            None => {
                self.flush()?;
                let mut body = String::from("do local __v = __pop() ");
                let (locals, indices) = self.pop_locals("__i", arity);
                body.push_str(&locals);
                let indices: Vec<String> = indices.iter().map(|i| self.index_text(i)).collect();
                let value = if elem_int {
                    "__toint(__v)".to_string()
                } else {
                    "__v".to_string()
                };
                body.push_str(&format!(
                    " {} = {} end",
                    self.indexed_ref(&name, &indices),
                    value
                ));
                self.line(&body)?;
            }
        }
        Ok(())
    }

    /// `local __i2 = __pop() local __i1 = __pop()` plus the names in source
    /// order. The reversed pops mirror the stack layout.
    fn pop_locals(&self, prefix: &str, count: usize) -> (String, Vec<String>) {
        let mut decls = String::new();
        let mut names = Vec::new();
        for i in (1..=count).rev() {
            decls.push_str(&format!("local {}{} = __pop() ", prefix, i));
        }
        for i in 1..=count {
            names.push(format!("{}{}", prefix, i));
        }
        (decls, names)
    }

    fn symbols_elem_int(&self, key: &str) -> bool {
        self.is_int_var(key)
    }

    fn emit_pop(&mut self) -> Result<(), CodeGenError> {
        match self.take(1) {
            Some(args) => {
                let entry = &args[0];
                if !entry.pure {
                    // Impure results are always call expressions, which Lua
                    // accepts as statements.
                    self.spill_below(0)?;
                    let text = entry.text.clone();
                    self.line(&text)?;
                }
            }
            None => self.line("__pop()")?,
        }
        Ok(())
    }

    // -- control and calls -------------------------------------------------

    fn emit_conditional_jump(&mut self, label: &str, on_false: bool) -> Result<(), CodeGenError> {
        let cond = match self.take(1) {
            Some(args) => {
                self.flush()?; // anything below must already be materialized
                args[0].cond()
            }
            None => "__bool(__pop())".to_string(),
        };
        if on_false {
            self.line(&format!("if not {} then goto {} end", cond, label))?;
        } else {
            self.line(&format!("if {} then goto {} end", cond, label))?;
        }
        Ok(())
    }

    fn emit_call(&mut self, name: &str, arity: usize, returns: bool) -> Result<(), CodeGenError> {
        let lua_name = mangle_proc(name);
        match self.take(arity) {
            Some(args) => {
                self.spill_below(0)?;
                let texts: Vec<String> = args.iter().map(|a| a.value(self.true_lit)).collect();
                let call = format!("{}({})", lua_name, texts.join(", "));
                if returns {
                    self.push_sym(SymEntry::impure_value(call));
                } else {
                    self.line(&call)?;
                }
            }
            None => {
                self.flush()?;
                let (locals, names) = self.pop_locals("__a", arity);
                let call = format!("{}({})", lua_name, names.join(", "));
                if returns {
                    self.line(&format!("do {} __push({}) end", locals, call))?;
                } else {
                    self.line(&format!("do {} {} end", locals, call))?;
                }
            }
        }
        Ok(())
    }

    fn emit_invoke(
        &mut self,
        target: &str,
        arity: usize,
        returns: bool,
        pure: bool,
    ) -> Result<(), CodeGenError> {
        match self.take(arity) {
            Some(args) => {
                let texts: Vec<String> = args.iter().map(|a| a.value(self.true_lit)).collect();
                let call = format!("{}({})", target, texts.join(", "));
                if pure && returns {
                    let args_pure = args.iter().all(|a| a.pure);
                    self.push_sym(SymEntry {
                        text: call,
                        pure: args_pure,
                        boolish: false,
                    });
                } else if returns {
                    self.spill_below(0)?;
                    self.push_sym(SymEntry::impure_value(call));
                } else {
                    self.spill_below(0)?;
                    self.line(&call)?;
                }
            }
            None => {
                self.flush()?;
                let (locals, names) = self.pop_locals("__a", arity);
                let call = format!("{}({})", target, names.join(", "));
                if returns {
                    self.line(&format!("do {} __push({}) end", locals, call))?;
                } else if arity == 0 {
                    self.line(&call)?;
                } else {
                    self.line(&format!("do {} {} end", locals, call))?;
                }
            }
        }
        Ok(())
    }

    fn emit_dim(&mut self, key: &str, arity: usize, preserve: bool) -> Result<(), CodeGenError> {
        let name = self.lua_var(key);
        let init = self.array_init(key);
        match self.take(arity) {
            Some(args) => {
                self.spill_below(0)?;
                let dims: Vec<String> = args.iter().map(|a| a.value(self.true_lit)).collect();
                if preserve {
                    self.line(&format!(
                        "{} = BASIC_REDIM({}, {}, {}, {})",
                        name,
                        name,
                        init,
                        self.base,
                        dims.join(", ")
                    ))?;
                } else {
                    self.line(&format!(
                        "{} = BASIC_DIM({}, {}, {})",
                        name,
                        init,
                        self.base,
                        dims.join(", ")
                    ))?;
                }
            }
            None => {
                self.flush()?;
                let (locals, names) = self.pop_locals("__d", arity);
                let ctor = if preserve {
                    format!(
                        "{} = BASIC_REDIM({}, {}, {}, {})",
                        name,
                        name,
                        init,
                        self.base,
                        names.join(", ")
                    )
                } else {
                    format!(
                        "{} = BASIC_DIM({}, {}, {})",
                        name,
                        init,
                        self.base,
                        names.join(", ")
                    )
                };
                self.line(&format!("do {} {} end", locals, ctor))?;
            }
        }
        Ok(())
    }

    fn emit_timer(&mut self, api: &str, handler: &str) -> Result<(), CodeGenError> {
        let duration = match self.take(1) {
            Some(mut args) => {
                self.spill_below(0)?;
                args.remove(0).value(self.true_lit)
            }
            None => "__pop()".to_string(),
        };
        self.line(&format!(
            "{}({}, {})",
            api,
            duration,
            lua_string(&mangle_proc(handler))
        ))?;
        Ok(())
    }

    fn emit_gosub_return(&mut self) -> Result<(), CodeGenError> {
        self.flush()?;
        self.line("do")?;
        self.indent += 1;
        self.line("local __r = table.remove(__gosub)")?;
        self.line("if __r == nil then error(\"RETURN without GOSUB\", 0) end")?;
        let resumes = self.resumes.clone();
        for (i, resume) in resumes.iter().enumerate() {
            let head = if i == 0 { "if" } else { "elseif" };
            self.line(&format!("{} __r == {} then goto {}", head, i + 1, resume))?;
        }
        if !resumes.is_empty() {
            self.line("end")?;
        }
        self.indent -= 1;
        self.line("end")?;
        Ok(())
    }
}
