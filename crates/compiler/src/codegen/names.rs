//! Name mangling: BASIC identifiers → Lua identifiers.
//!
//! BASIC names are canonically upper case, which already dodges every Lua
//! reserved word (all lower case). The type suffix, which is part of a BASIC
//! identifier's identity, maps through a total function so `A$`, `A%` and
//! `A` stay distinct in the emitted source. User procs get a `PROC_` prefix
//! so a sub and a variable sharing a name cannot collide.

/// Mangle a suffix-qualified variable key (`A$` → `A_STRING`).
pub fn mangle_var(key: &str) -> String {
    let mut chars = key.chars();
    let last = chars.next_back();
    match last {
        Some('$') => format!("{}_STRING", chars.as_str()),
        Some('%') => format!("{}_INT", chars.as_str()),
        Some('#') => format!("{}_DOUBLE", chars.as_str()),
        Some('!') => format!("{}_SINGLE", chars.as_str()),
        _ => key.to_string(),
    }
}

/// Mangle a sub/function name (`F%` → `PROC_F_INT`).
pub fn mangle_proc(key: &str) -> String {
    format!("PROC_{}", mangle_var(key))
}

/// Quote a string for a Lua source literal.
pub fn lua_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\{}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Format a double as a Lua numeric literal that round-trips.
pub fn lua_number(d: f64) -> String {
    if d.is_nan() {
        return "(0/0)".to_string();
    }
    if d.is_infinite() {
        return if d > 0.0 { "(1/0)" } else { "(-1/0)" }.to_string();
    }
    let s = format!("{}", d);
    // A bare integral double must stay a float in Lua 5.4.
    if s.contains('.') || s.contains('e') || s.contains('E') {
        s
    } else {
        format!("{}.0", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffixes_map_totally() {
        assert_eq!(mangle_var("A$"), "A_STRING");
        assert_eq!(mangle_var("A%"), "A_INT");
        assert_eq!(mangle_var("A#"), "A_DOUBLE");
        assert_eq!(mangle_var("A!"), "A_SINGLE");
        assert_eq!(mangle_var("A"), "A");
        assert_eq!(mangle_var("__FL1"), "__FL1");
    }

    #[test]
    fn suffix_variants_stay_distinct() {
        let mangled = ["A$", "A%", "A#", "A!", "A"].map(mangle_var);
        let mut unique = mangled.to_vec();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 5);
    }

    #[test]
    fn procs_cannot_collide_with_variables() {
        assert_ne!(mangle_proc("TICK"), mangle_var("TICK"));
        assert_eq!(mangle_proc("F%"), "PROC_F_INT");
    }

    #[test]
    fn lua_strings_escape() {
        assert_eq!(lua_string("hi"), "\"hi\"");
        assert_eq!(lua_string("a\"b"), "\"a\\\"b\"");
        assert_eq!(lua_string("a\nb"), "\"a\\nb\"");
    }

    #[test]
    fn lua_numbers_stay_floats() {
        assert_eq!(lua_number(2.5), "2.5");
        assert_eq!(lua_number(3.0), "3.0");
        assert_eq!(lua_number(1e21), "1e21");
    }
}
