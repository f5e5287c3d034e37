//! The core command/function set.
//!
//! Registered into the global [`CommandRegistry`](crate::CommandRegistry) at
//! process start, before any plugin manifests are loaded. Each entry names
//! the Lua symbol the emitter invokes; pure entries (math and string
//! helpers) are eligible for the emitter's expression reconstruction, impure
//! ones (terminal, file, timing) are not.

use crate::registry::{
    self, CommandDef, CommandKind, CommandRegistry, ParamSpec, ParamType, ReturnType,
};
use crate::value::Value;
use std::sync::Once;

use CommandKind::{Command, Function};
use ParamType::{Any, Integer, Number, String as StringTy};

fn fun(name: &str, category: &str, target: &str) -> CommandDef {
    CommandDef::new(name, Function, category, target)
}

fn cmd(name: &str, category: &str, target: &str) -> CommandDef {
    CommandDef::new(name, Command, category, target)
}

fn p(name: &str, ty: ParamType) -> ParamSpec {
    ParamSpec::required(name, ty)
}

fn opt(name: &str, ty: ParamType, default: Value) -> ParamSpec {
    ParamSpec::optional(name, ty, default)
}

/// Register the core function set (expression position).
pub fn register_core_functions(reg: &mut CommandRegistry) -> Result<(), String> {
    let defs = vec![
        // Numeric
        fun("ABS", "math", "math.abs")
            .with_params(vec![p("n", Number)])
            .returning(ReturnType::Number)
            .pure(),
        fun("INT", "math", "math.floor")
            .with_params(vec![p("n", Number)])
            .returning(ReturnType::Integer)
            .pure(),
        fun("FIX", "math", "BASIC_FIX")
            .with_params(vec![p("n", Number)])
            .returning(ReturnType::Integer)
            .pure(),
        fun("SGN", "math", "BASIC_SGN")
            .with_params(vec![p("n", Number)])
            .returning(ReturnType::Integer)
            .pure(),
        fun("SQR", "math", "math.sqrt")
            .with_params(vec![p("n", Number)])
            .returning(ReturnType::Number)
            .pure(),
        fun("SIN", "math", "math.sin")
            .with_params(vec![p("n", Number)])
            .returning(ReturnType::Number)
            .pure(),
        fun("COS", "math", "math.cos")
            .with_params(vec![p("n", Number)])
            .returning(ReturnType::Number)
            .pure(),
        fun("TAN", "math", "math.tan")
            .with_params(vec![p("n", Number)])
            .returning(ReturnType::Number)
            .pure(),
        fun("ATN", "math", "math.atan")
            .with_params(vec![p("n", Number)])
            .returning(ReturnType::Number)
            .pure(),
        fun("LOG", "math", "math.log")
            .with_params(vec![p("n", Number)])
            .returning(ReturnType::Number)
            .pure(),
        fun("EXP", "math", "math.exp")
            .with_params(vec![p("n", Number)])
            .returning(ReturnType::Number)
            .pure(),
        // RND re-seeds internal state, so it is never reconstruction-safe.
        fun("RND", "math", "BASIC_RND")
            .with_params(vec![opt("n", Number, Value::Int(1))])
            .returning(ReturnType::Number),
        fun("TIMER", "time", "BASIC_TIMER").returning(ReturnType::Number),
        // String
        fun("LEN", "string", "BASIC_LEN")
            .with_params(vec![p("s", StringTy)])
            .returning(ReturnType::Integer)
            .pure(),
        fun("LEFT$", "string", "BASIC_LEFT")
            .with_params(vec![p("s", StringTy), p("n", Integer)])
            .returning(ReturnType::String)
            .pure(),
        fun("RIGHT$", "string", "BASIC_RIGHT")
            .with_params(vec![p("s", StringTy), p("n", Integer)])
            .returning(ReturnType::String)
            .pure(),
        fun("MID$", "string", "BASIC_MID")
            .with_params(vec![
                p("s", StringTy),
                p("start", Integer),
                opt("length", Integer, Value::Int(-1)),
            ])
            .returning(ReturnType::String)
            .pure(),
        fun("CHR$", "string", "CHR_STRING")
            .with_params(vec![p("code", Integer)])
            .returning(ReturnType::String)
            .pure(),
        fun("ASC", "string", "ASC")
            .with_params(vec![p("s", StringTy)])
            .returning(ReturnType::Integer)
            .pure(),
        fun("STR$", "string", "STR_STRING")
            .with_params(vec![p("n", Number)])
            .returning(ReturnType::String)
            .pure(),
        fun("VAL", "string", "VAL")
            .with_params(vec![p("s", StringTy)])
            .returning(ReturnType::Number)
            .pure(),
        fun("HEX$", "string", "HEX_STRING")
            .with_params(vec![p("n", Integer)])
            .returning(ReturnType::String)
            .pure(),
        fun("OCT$", "string", "OCT_STRING")
            .with_params(vec![p("n", Integer)])
            .returning(ReturnType::String)
            .pure(),
        fun("BIN$", "string", "BIN_STRING")
            .with_params(vec![p("n", Integer)])
            .returning(ReturnType::String)
            .pure(),
        fun("UCASE$", "string", "BASIC_UCASE")
            .with_params(vec![p("s", StringTy)])
            .returning(ReturnType::String)
            .pure(),
        fun("LCASE$", "string", "BASIC_LCASE")
            .with_params(vec![p("s", StringTy)])
            .returning(ReturnType::String)
            .pure(),
        fun("TRIM$", "string", "BASIC_TRIM")
            .with_params(vec![p("s", StringTy)])
            .returning(ReturnType::String)
            .pure(),
        fun("LTRIM$", "string", "BASIC_LTRIM")
            .with_params(vec![p("s", StringTy)])
            .returning(ReturnType::String)
            .pure(),
        fun("RTRIM$", "string", "BASIC_RTRIM")
            .with_params(vec![p("s", StringTy)])
            .returning(ReturnType::String)
            .pure(),
        fun("SPACE$", "string", "BASIC_SPACE")
            .with_params(vec![p("n", Integer)])
            .returning(ReturnType::String)
            .pure(),
        fun("STRING$", "string", "BASIC_STRING")
            .with_params(vec![p("n", Integer), p("s", Any)])
            .returning(ReturnType::String)
            .pure(),
        fun("INSTR", "string", "BASIC_INSTR")
            .with_params(vec![
                p("s", StringTy),
                p("find", StringTy),
                opt("start", Integer, Value::Int(1)),
            ])
            .returning(ReturnType::Integer)
            .pure(),
        fun("TAB", "string", "BASIC_TAB")
            .with_params(vec![p("n", Integer)])
            .returning(ReturnType::String)
            .pure(),
        // Terminal
        fun("INKEY$", "terminal", "terminal_inkey").returning(ReturnType::String),
        fun("KEY", "terminal", "terminal_key")
            .with_params(vec![p("code", Integer)])
            .returning(ReturnType::Integer),
        fun("SCREENWIDTH", "terminal", "terminal_width").returning(ReturnType::Integer),
        fun("SCREENHEIGHT", "terminal", "terminal_height").returning(ReturnType::Integer),
        // File I/O
        fun("EOF", "file", "file_eof")
            .with_params(vec![p("filenum", Integer)])
            .returning(ReturnType::Integer),
        fun("LOC", "file", "file_loc")
            .with_params(vec![p("filenum", Integer)])
            .returning(ReturnType::Integer),
        fun("LOF", "file", "file_lof")
            .with_params(vec![p("filenum", Integer)])
            .returning(ReturnType::Integer),
        fun("PTR", "file", "file_ptr")
            .with_params(vec![p("filenum", Integer)])
            .returning(ReturnType::Integer),
        fun("BGET", "file", "file_bget")
            .with_params(vec![p("filenum", Integer)])
            .returning(ReturnType::Integer),
    ];

    for def in defs {
        reg.register(def, false)?;
    }
    Ok(())
}

/// Register the core command set (statement position).
pub fn register_core_commands(reg: &mut CommandRegistry) -> Result<(), String> {
    let defs = vec![
        cmd("CLS", "terminal", "terminal_cls"),
        cmd("LOCATE", "terminal", "terminal_locate")
            .with_params(vec![p("row", Integer), p("col", Integer)]),
        cmd("BEEP", "terminal", "terminal_beep"),
        cmd("COLOR", "terminal", "terminal_set_color")
            .with_params(vec![p("fg", Integer), opt("bg", Integer, Value::Int(-1))]),
        cmd("RESETCOLORS", "terminal", "terminal_reset_colors"),
        cmd("SLEEP", "time", "basic_sleep").with_params(vec![p("seconds", Number)]),
        cmd("WAIT_MS", "time", "wait_ms").with_params(vec![p("ms", Integer)]),
        cmd("WAIT_FRAMES", "time", "WAIT_FRAMES")
            .with_params(vec![opt("frames", Integer, Value::Int(1))]),
        cmd("RANDOMIZE", "math", "BASIC_RANDOMIZE")
            .with_params(vec![opt("seed", Integer, Value::Int(0))]),
        cmd("BPUT", "file", "file_bput")
            .with_params(vec![p("filenum", Integer), p("byte", Integer)]),
    ];

    for def in defs {
        reg.register(def, false)?;
    }
    Ok(())
}

static CORE_INIT: Once = Once::new();

/// Register the core set into the global registry, once per process. Safe to
/// call from any number of entry points (driver, tests).
pub fn ensure_core_registered() {
    CORE_INIT.call_once(|| {
        let mut reg = registry::global()
            .write()
            .expect("command registry lock poisoned");
        register_core_functions(&mut reg).expect("core function registration failed");
        register_core_commands(&mut reg).expect("core command registration failed");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_set_registers_cleanly() {
        let mut reg = CommandRegistry::new();
        register_core_functions(&mut reg).unwrap();
        register_core_commands(&mut reg).unwrap();
        assert!(reg.function("abs").is_some());
        assert!(reg.function("LEFT$").is_some());
        assert!(reg.command("cls").is_some());
        assert!(reg.command("ABS").is_none());
    }

    #[test]
    fn purity_flags() {
        let mut reg = CommandRegistry::new();
        register_core_functions(&mut reg).unwrap();
        assert!(reg.function("CHR$").unwrap().pure);
        assert!(!reg.function("RND").unwrap().pure);
        assert!(!reg.function("INKEY$").unwrap().pure);
    }

    #[test]
    fn optional_parameters_carry_defaults() {
        let mut reg = CommandRegistry::new();
        register_core_functions(&mut reg).unwrap();
        let instr = reg.function("INSTR").unwrap();
        assert_eq!(instr.min_args(), 2);
        assert_eq!(instr.max_args(), 3);
        assert_eq!(instr.params[2].default, Some(Value::Int(1)));
    }
}
