//! Terminal I/O bindings.
//!
//! Output goes through a pluggable [`Sink`] - stdout for normal runs, an
//! in-memory buffer for tests and embedders. Cursor addressing and colors
//! use ANSI escapes. `PRINT`-list numeric items print with one trailing
//! space; the separator-handling lives in the compiler, which calls the
//! `terminal_print_*` family per item.

use basic_core::value::format_double;
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

/// Where terminal output lands.
#[derive(Clone)]
pub enum Sink {
    Stdout,
    Buffer(Rc<RefCell<String>>),
}

impl Sink {
    pub fn buffer() -> (Sink, Rc<RefCell<String>>) {
        let buf = Rc::new(RefCell::new(String::new()));
        (Sink::Buffer(buf.clone()), buf)
    }

    pub fn write(&self, text: &str) {
        match self {
            Sink::Stdout => {
                let mut out = std::io::stdout();
                let _ = out.write_all(text.as_bytes());
                let _ = out.flush();
            }
            Sink::Buffer(buf) => buf.borrow_mut().push_str(text),
        }
    }
}

/// Format a numeric PRINT item: integral values without a fraction, and a
/// single trailing space after every numeric item.
pub fn print_num_text(value: &mlua::Value) -> String {
    match value {
        mlua::Value::Integer(n) => format!("{} ", n),
        mlua::Value::Number(d) => format!("{} ", format_double(*d)),
        other => format!("{} ", lua_display(other)),
    }
}

pub fn lua_display(value: &mlua::Value) -> String {
    match value {
        mlua::Value::Nil => String::new(),
        mlua::Value::Boolean(b) => if *b { "1" } else { "0" }.to_string(),
        mlua::Value::Integer(n) => n.to_string(),
        mlua::Value::Number(d) => format_double(*d),
        mlua::Value::String(s) => s.to_string_lossy().to_string(),
        other => format!("{:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_sink_collects() {
        let (sink, buf) = Sink::buffer();
        sink.write("a");
        sink.write("b");
        assert_eq!(*buf.borrow(), "ab");
    }

    #[test]
    fn numeric_items_get_a_trailing_space() {
        assert_eq!(print_num_text(&mlua::Value::Integer(314)), "314 ");
        assert_eq!(print_num_text(&mlua::Value::Number(2.5)), "2.5 ");
        assert_eq!(print_num_text(&mlua::Value::Number(16.0)), "16 ");
    }
}
