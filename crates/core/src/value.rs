//! Tagged values for DATA items and named constants.
//!
//! A [`Value`] is one of a 64-bit integer, a double, or a string. Conversions
//! never fail: the readers coerce with the same rules the runtime uses, so a
//! `READ A%` over the string `"12"` behaves identically whether the value was
//! parsed early (by the preprocessor) or late (by the runtime).

use std::fmt;

/// A typed DATA/constant value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Double(f64),
    Str(String),
}

impl Value {
    /// Coerce to integer. Strings parse leniently; unparseable strings are 0.
    pub fn as_int(&self) -> i64 {
        match self {
            Value::Int(n) => *n,
            Value::Double(d) => *d as i64,
            Value::Str(s) => s.trim().parse::<i64>().unwrap_or_else(|_| {
                s.trim().parse::<f64>().map(|d| d as i64).unwrap_or(0)
            }),
        }
    }

    /// Coerce to double. Unparseable strings are 0.0.
    pub fn as_double(&self) -> f64 {
        match self {
            Value::Int(n) => *n as f64,
            Value::Double(d) => *d,
            Value::Str(s) => s.trim().parse::<f64>().unwrap_or(0.0),
        }
    }

    /// Coerce to string.
    pub fn as_str(&self) -> String {
        match self {
            Value::Int(n) => n.to_string(),
            Value::Double(d) => format_double(*d),
            Value::Str(s) => s.clone(),
        }
    }

    /// Parse a raw DATA value using the classification ladder:
    /// empty → empty string; fully quoted (`"…"` or `'…'`) → unquoted string;
    /// integer text without `.`/`e`/`E` → integer; double text → double;
    /// anything else → the trimmed text.
    pub fn parse_data(raw: &str) -> Value {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Value::Str(String::new());
        }

        if trimmed.len() >= 2 {
            let first = trimmed.chars().next().unwrap();
            let last = trimmed.chars().last().unwrap();
            if (first == '"' && last == '"') || (first == '\'' && last == '\'') {
                return Value::Str(trimmed[1..trimmed.len() - 1].to_string());
            }
        }

        let has_decimal = trimmed.contains('.');
        let has_exponent = trimmed.contains('e') || trimmed.contains('E');
        if !has_decimal && !has_exponent {
            if let Ok(n) = trimmed.parse::<i64>() {
                return Value::Int(n);
            }
        }

        if let Ok(d) = trimmed.parse::<f64>() {
            return Value::Double(d);
        }

        Value::Str(trimmed.to_string())
    }

    /// One-word tag for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "integer",
            Value::Double(_) => "double",
            Value::Str(_) => "string",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Double(d) => write!(f, "{}", format_double(*d)),
            Value::Str(s) => write!(f, "{}", s),
        }
    }
}

/// Format a double the way BASIC prints one: integral values drop the
/// fractional part, everything else uses the shortest round-trip form.
pub fn format_double(d: f64) -> String {
    if d.is_finite() && d.fract() == 0.0 && d.abs() < 1e15 {
        format!("{}", d as i64)
    } else {
        format!("{}", d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_data_empty_is_empty_string() {
        assert_eq!(Value::parse_data(""), Value::Str(String::new()));
        assert_eq!(Value::parse_data("   "), Value::Str(String::new()));
    }

    #[test]
    fn parse_data_quoted_strings() {
        assert_eq!(Value::parse_data("\"hello\""), Value::Str("hello".into()));
        assert_eq!(Value::parse_data("'x'"), Value::Str("x".into()));
        // Quotes preserve interior whitespace
        assert_eq!(Value::parse_data("\" a \""), Value::Str(" a ".into()));
    }

    #[test]
    fn parse_data_integers() {
        assert_eq!(Value::parse_data("42"), Value::Int(42));
        assert_eq!(Value::parse_data(" -7 "), Value::Int(-7));
        assert_eq!(Value::parse_data("+3"), Value::Int(3));
    }

    #[test]
    fn parse_data_doubles() {
        assert_eq!(Value::parse_data("3.14"), Value::Double(3.14));
        assert_eq!(Value::parse_data("1e3"), Value::Double(1000.0));
        // A trailing dot still forces the double rung
        assert_eq!(Value::parse_data("1."), Value::Double(1.0));
    }

    #[test]
    fn parse_data_bare_text_is_trimmed_string() {
        assert_eq!(Value::parse_data("  apple  "), Value::Str("apple".into()));
        assert_eq!(Value::parse_data("12abc"), Value::Str("12abc".into()));
    }

    #[test]
    fn coercions() {
        assert_eq!(Value::Str("12".into()).as_int(), 12);
        assert_eq!(Value::Str("2.5".into()).as_int(), 2);
        assert_eq!(Value::Int(3).as_double(), 3.0);
        assert_eq!(Value::Double(2.0).as_str(), "2");
        assert_eq!(Value::Double(2.5).as_str(), "2.5");
    }
}
