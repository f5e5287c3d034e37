//! The extensible command/function registry.
//!
//! Every phase of the compiler consults this registry: the lexer to decide
//! whether an identifier is a command keyword, the parser for signatures, the
//! semantic analyzer for argument typing, and the Lua emitter for the target
//! symbol to invoke. Plugins append entries during process initialization;
//! after [`mark_initialized`] the registry is read-only and any further
//! registration fails with an error.

use crate::value::Value;
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock, RwLockReadGuard};

/// Whether an entry is usable in statement position, expression position,
/// or both (grammar context disambiguates shared names).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Statement-position command, e.g. `CLS` or `LOCATE 1, 1`.
    Command,
    /// Expression-position function, e.g. `ABS(X)`.
    Function,
}

/// Declared type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Integer,
    Number,
    String,
    Any,
    Array,
}

/// Declared return type of a function entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnType {
    None,
    Integer,
    Number,
    String,
    Any,
}

/// A single declared parameter.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    pub ty: ParamType,
    pub optional: bool,
    /// Literal substituted when an optional parameter is omitted.
    pub default: Option<Value>,
}

impl ParamSpec {
    pub fn required(name: &str, ty: ParamType) -> Self {
        ParamSpec {
            name: name.to_string(),
            ty,
            optional: false,
            default: None,
        }
    }

    pub fn optional(name: &str, ty: ParamType, default: Value) -> Self {
        ParamSpec {
            name: name.to_string(),
            ty,
            optional: true,
            default: Some(default),
        }
    }
}

/// A registered command or function.
#[derive(Debug, Clone)]
pub struct CommandDef {
    /// Canonical (upper-case) name as written in BASIC source.
    pub name: String,
    pub kind: CommandKind,
    /// Grouping tag used by help and listing tools.
    pub category: String,
    pub params: Vec<ParamSpec>,
    pub ret: ReturnType,
    /// Lua symbol the emitter invokes for this entry.
    pub target: String,
    /// Whether the emitter's expression reconstruction may treat a call as a
    /// pure expression. Defaults to impure.
    pub pure: bool,
}

impl CommandDef {
    /// Builder-style constructor; `name` is canonicalized to upper case.
    pub fn new(name: &str, kind: CommandKind, category: &str, target: &str) -> Self {
        CommandDef {
            name: name.to_uppercase(),
            kind,
            category: category.to_string(),
            params: Vec::new(),
            ret: ReturnType::None,
            target: target.to_string(),
            pure: false,
        }
    }

    pub fn with_params(mut self, params: Vec<ParamSpec>) -> Self {
        self.params = params;
        self
    }

    pub fn returning(mut self, ret: ReturnType) -> Self {
        self.ret = ret;
        self
    }

    pub fn pure(mut self) -> Self {
        self.pure = true;
        self
    }

    /// Number of arguments that must be present at a call site.
    pub fn min_args(&self) -> usize {
        self.params.iter().filter(|p| !p.optional).count()
    }

    pub fn max_args(&self) -> usize {
        self.params.len()
    }
}

/// Keyed store of command/function signatures.
///
/// Names are stored upper-cased; lookup accepts any casing. A name may carry
/// both a statement entry and a function entry (`kind` keys the slot), which
/// is how e.g. `MID$` can be both a statement and a function in classic
/// dialects.
#[derive(Debug, Default)]
pub struct CommandRegistry {
    commands: HashMap<String, CommandDef>,
    functions: HashMap<String, CommandDef>,
    initialized: bool,
}

impl CommandRegistry {
    pub fn new() -> Self {
        CommandRegistry::default()
    }

    /// Register an entry. Fails after [`CommandRegistry::mark_initialized`],
    /// and on duplicate names unless `overwrite` is set.
    pub fn register(&mut self, def: CommandDef, overwrite: bool) -> Result<(), String> {
        if self.initialized {
            return Err(format!(
                "Cannot register '{}': the command registry is sealed (compilation has started)",
                def.name
            ));
        }
        let slot = match def.kind {
            CommandKind::Command => &mut self.commands,
            CommandKind::Function => &mut self.functions,
        };
        if slot.contains_key(&def.name) && !overwrite {
            return Err(format!(
                "Command '{}' is already registered (use override to replace it)",
                def.name
            ));
        }
        slot.insert(def.name.clone(), def);
        Ok(())
    }

    /// Seal the registry. All subsequent accesses must be reads.
    pub fn mark_initialized(&mut self) {
        self.initialized = true;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Statement-position lookup, any casing.
    pub fn command(&self, name: &str) -> Option<&CommandDef> {
        self.commands.get(&name.to_uppercase())
    }

    /// Expression-position lookup, any casing.
    pub fn function(&self, name: &str) -> Option<&CommandDef> {
        self.functions.get(&name.to_uppercase())
    }

    /// Is this name registered in either namespace? Used by the lexer to
    /// decide whether to tokenize an identifier as a command keyword.
    pub fn is_registered(&self, name: &str) -> bool {
        let upper = name.to_uppercase();
        self.commands.contains_key(&upper) || self.functions.contains_key(&upper)
    }

    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    /// All entries in a category, for help/listing tools.
    pub fn in_category<'a>(&'a self, category: &str) -> Vec<&'a CommandDef> {
        self.commands
            .values()
            .chain(self.functions.values())
            .filter(|d| d.category == category)
            .collect()
    }
}

static GLOBAL: OnceLock<RwLock<CommandRegistry>> = OnceLock::new();

/// The process-wide registry shared by all compilations.
pub fn global() -> &'static RwLock<CommandRegistry> {
    GLOBAL.get_or_init(|| RwLock::new(CommandRegistry::new()))
}

/// Read access to the global registry. Lock poisoning is unrecoverable here;
/// it means another thread panicked while registering.
pub fn read() -> RwLockReadGuard<'static, CommandRegistry> {
    global().read().expect("command registry lock poisoned")
}

/// Register a definition into the global registry.
pub fn register_global(def: CommandDef, overwrite: bool) -> Result<(), String> {
    global()
        .write()
        .map_err(|_| "command registry lock poisoned".to_string())?
        .register(def, overwrite)
}

/// Seal the global registry; call once process initialization is complete.
pub fn mark_initialized() {
    if let Ok(mut reg) = global().write() {
        reg.mark_initialized();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cls() -> CommandDef {
        CommandDef::new("Cls", CommandKind::Command, "terminal", "terminal_cls")
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let mut reg = CommandRegistry::new();
        reg.register(cls(), false).unwrap();
        assert!(reg.command("CLS").is_some());
        assert!(reg.command("cls").is_some());
        assert!(reg.command("Cls").is_some());
        assert!(reg.function("cls").is_none());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut reg = CommandRegistry::new();
        reg.register(cls(), false).unwrap();
        assert!(reg.register(cls(), false).is_err());
        assert!(reg.register(cls(), true).is_ok());
    }

    #[test]
    fn sealed_registry_rejects_writes() {
        let mut reg = CommandRegistry::new();
        reg.mark_initialized();
        let err = reg.register(cls(), false).unwrap_err();
        assert!(err.contains("sealed"));
    }

    #[test]
    fn same_name_in_both_namespaces() {
        let mut reg = CommandRegistry::new();
        reg.register(
            CommandDef::new("MID$", CommandKind::Command, "string", "basic_mid_set"),
            false,
        )
        .unwrap();
        reg.register(
            CommandDef::new("MID$", CommandKind::Function, "string", "BASIC_MID")
                .returning(ReturnType::String)
                .pure(),
            false,
        )
        .unwrap();
        assert!(reg.command("mid$").is_some());
        assert!(reg.function("mid$").is_some());
    }

    #[test]
    fn arity_bounds() {
        let def = CommandDef::new("LOCATE", CommandKind::Command, "terminal", "terminal_locate")
            .with_params(vec![
                ParamSpec::required("row", ParamType::Integer),
                ParamSpec::optional("col", ParamType::Integer, Value::Int(1)),
            ]);
        assert_eq!(def.min_args(), 1);
        assert_eq!(def.max_args(), 2);
    }
}
