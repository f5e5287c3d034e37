//! Plugin command manifests.
//!
//! Plugins extend the command registry without recompiling the core: a TOML
//! manifest declares commands and functions (name, category, parameters,
//! return type, Lua target symbol, purity), and the driver loads it before
//! compilation begins - the registry is sealed once compilation starts.
//!
//! ```toml
//! [[command]]
//! name = "VOICE"
//! category = "sound"
//! target = "plugin_voice"
//! params = [
//!   { name = "channel", type = "integer" },
//!   { name = "wave", type = "integer", optional = true, default = 1 },
//! ]
//!
//! [[function]]
//! name = "NOISE"
//! category = "sound"
//! target = "plugin_noise"
//! returns = "number"
//! pure = true
//! params = [{ name = "seed", type = "integer" }]
//! ```

use basic_core::{
    CommandDef, CommandKind, CommandRegistry, ParamSpec, ParamType, ReturnType, Value, registry,
};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Default literal for an optional parameter.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DefaultLiteral {
    Int(i64),
    Float(f64),
    Str(String),
}

impl DefaultLiteral {
    fn to_value(&self) -> Value {
        match self {
            DefaultLiteral::Int(n) => Value::Int(*n),
            DefaultLiteral::Float(d) => Value::Double(*d),
            DefaultLiteral::Str(s) => Value::Str(s.clone()),
        }
    }
}

/// One declared parameter.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestParam {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: String,
    #[serde(default)]
    pub optional: bool,
    pub default: Option<DefaultLiteral>,
}

impl ManifestParam {
    fn param_type(&self) -> Result<ParamType, String> {
        Ok(match self.param_type.to_lowercase().as_str() {
            "integer" => ParamType::Integer,
            "number" => ParamType::Number,
            "string" => ParamType::String,
            "any" => ParamType::Any,
            "array" => ParamType::Array,
            other => {
                return Err(format!(
                    "Parameter '{}' has unknown type '{}'",
                    self.name, other
                ));
            }
        })
    }
}

/// One command or function entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    /// BASIC-side name, any casing.
    pub name: String,
    #[serde(default = "default_category")]
    pub category: String,
    /// Lua symbol the emitter invokes.
    pub target: String,
    #[serde(default)]
    pub params: Vec<ManifestParam>,
    /// Return type for functions: integer, number, string or any.
    pub returns: Option<String>,
    /// Eligible for expression reconstruction.
    #[serde(default)]
    pub pure: bool,
    /// Replace an existing registration instead of erroring.
    #[serde(rename = "override", default)]
    pub override_existing: bool,
}

fn default_category() -> String {
    "plugin".to_string()
}

impl ManifestEntry {
    fn return_type(&self) -> Result<ReturnType, String> {
        Ok(match self.returns.as_deref().map(str::to_lowercase).as_deref() {
            None => ReturnType::None,
            Some("integer") => ReturnType::Integer,
            Some("number") => ReturnType::Number,
            Some("string") => ReturnType::String,
            Some("any") => ReturnType::Any,
            Some(other) => {
                return Err(format!(
                    "Entry '{}' has unknown return type '{}'",
                    self.name, other
                ));
            }
        })
    }

    fn to_def(&self, kind: CommandKind) -> Result<CommandDef, String> {
        let mut params = Vec::new();
        let mut saw_optional = false;
        for p in &self.params {
            let ty = p.param_type()?;
            if p.optional {
                saw_optional = true;
                let default = p
                    .default
                    .as_ref()
                    .map(DefaultLiteral::to_value)
                    .ok_or_else(|| {
                        format!(
                            "Optional parameter '{}' of '{}' needs a default",
                            p.name, self.name
                        )
                    })?;
                params.push(ParamSpec::optional(&p.name, ty, default));
            } else {
                if saw_optional {
                    return Err(format!(
                        "Required parameter '{}' of '{}' follows an optional one",
                        p.name, self.name
                    ));
                }
                params.push(ParamSpec::required(&p.name, ty));
            }
        }
        let mut def = CommandDef::new(&self.name, kind, &self.category, &self.target)
            .with_params(params)
            .returning(self.return_type()?);
        if self.pure {
            def = def.pure();
        }
        Ok(def)
    }
}

/// Top-level manifest structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PluginManifest {
    #[serde(rename = "command", default)]
    pub commands: Vec<ManifestEntry>,
    #[serde(rename = "function", default)]
    pub functions: Vec<ManifestEntry>,
}

impl PluginManifest {
    /// Parse and validate a manifest from TOML content.
    pub fn parse(content: &str) -> Result<Self, String> {
        let manifest: Self = toml::from_str(content)
            .map_err(|e| format!("Failed to parse plugin manifest: {}", e))?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), String> {
        if self.commands.is_empty() && self.functions.is_empty() {
            return Err("Plugin manifest declares no commands or functions".to_string());
        }
        for entry in self.commands.iter().chain(self.functions.iter()) {
            if entry.name.trim().is_empty() {
                return Err("Plugin entry with empty name".to_string());
            }
            if entry.target.trim().is_empty() {
                return Err(format!("Entry '{}' has an empty target symbol", entry.name));
            }
            // Target symbols must be plain Lua identifiers (dotted access
            // allowed), never arbitrary code.
            for c in entry.target.chars() {
                if !c.is_ascii_alphanumeric() && c != '_' && c != '.' {
                    return Err(format!(
                        "Entry '{}' has invalid character '{}' in target '{}'",
                        entry.name, c, entry.target
                    ));
                }
            }
        }
        for function in &self.functions {
            if function.returns.is_none() {
                return Err(format!(
                    "Function '{}' must declare a return type",
                    function.name
                ));
            }
        }
        Ok(())
    }

    /// Register every entry into a registry. Returns the number registered.
    pub fn apply(&self, reg: &mut CommandRegistry) -> Result<usize, String> {
        let mut count = 0;
        for entry in &self.commands {
            reg.register(entry.to_def(CommandKind::Command)?, entry.override_existing)?;
            count += 1;
        }
        for entry in &self.functions {
            reg.register(entry.to_def(CommandKind::Function)?, entry.override_existing)?;
            count += 1;
        }
        Ok(count)
    }
}

/// Load manifest files into the global registry. Must run before the
/// registry is sealed.
pub fn load_plugins(paths: &[std::path::PathBuf]) -> Result<usize, String> {
    let mut total = 0;
    for path in paths {
        total += load_plugin_file(path)?;
    }
    Ok(total)
}

fn load_plugin_file(path: &Path) -> Result<usize, String> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("Cannot read plugin manifest '{}': {}", path.display(), e))?;
    let manifest = PluginManifest::parse(&content)
        .map_err(|e| format!("{}: {}", path.display(), e))?;
    let mut reg = registry::global()
        .write()
        .map_err(|_| "command registry lock poisoned".to_string())?;
    manifest.apply(&mut reg)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOUND: &str = r#"
[[command]]
name = "VOICE"
category = "sound"
target = "plugin_voice"
params = [
  { name = "channel", type = "integer" },
  { name = "wave", type = "integer", optional = true, default = 1 },
]

[[function]]
name = "NOISE"
category = "sound"
target = "plugin_noise"
returns = "number"
pure = true
params = [{ name = "seed", type = "integer" }]
"#;

    #[test]
    fn manifest_parses_and_applies() {
        let manifest = PluginManifest::parse(SOUND).unwrap();
        let mut reg = CommandRegistry::new();
        assert_eq!(manifest.apply(&mut reg).unwrap(), 2);

        let voice = reg.command("voice").unwrap();
        assert_eq!(voice.min_args(), 1);
        assert_eq!(voice.max_args(), 2);
        assert_eq!(voice.params[1].default, Some(Value::Int(1)));
        assert_eq!(voice.target, "plugin_voice");

        let noise = reg.function("NOISE").unwrap();
        assert!(noise.pure);
        assert_eq!(noise.ret, ReturnType::Number);
    }

    #[test]
    fn empty_manifest_is_rejected() {
        assert!(PluginManifest::parse("").is_err());
    }

    #[test]
    fn function_without_return_type_is_rejected() {
        let bad = r#"
[[function]]
name = "F"
target = "f"
"#;
        assert!(PluginManifest::parse(bad).is_err());
    }

    #[test]
    fn optional_without_default_is_rejected() {
        let bad = r#"
[[command]]
name = "C"
target = "c"
params = [{ name = "x", type = "integer", optional = true }]
"#;
        let manifest = PluginManifest::parse(bad).unwrap();
        let mut reg = CommandRegistry::new();
        assert!(manifest.apply(&mut reg).is_err());
    }

    #[test]
    fn target_symbols_are_validated() {
        let bad = r#"
[[command]]
name = "C"
target = "os.execute('rm')"
"#;
        assert!(PluginManifest::parse(bad).is_err());
    }

    #[test]
    fn duplicate_without_override_is_rejected() {
        let manifest = PluginManifest::parse(SOUND).unwrap();
        let mut reg = CommandRegistry::new();
        manifest.apply(&mut reg).unwrap();
        assert!(manifest.apply(&mut reg).is_err());
    }

    #[test]
    fn sealed_registry_rejects_plugins() {
        let manifest = PluginManifest::parse(SOUND).unwrap();
        let mut reg = CommandRegistry::new();
        reg.mark_initialized();
        assert!(manifest.apply(&mut reg).is_err());
    }
}
