//! Host runtime for compiled FasterBASIC programs.
//!
//! Registers the compiled-program protocol into an embedded Lua state:
//! `terminal_*` over a pluggable output sink, the DATA reader, numbered file
//! handles, the timer/event API, `constants_get`, and the cooperative yield
//! probes (`basic_pump_events`, `check_should_stop`, `wait_ms`,
//! `WAIT_FRAMES`, `basic_sleep`). Timer handlers run serialized on the
//! evaluation thread, FIFO, only at suspension points; the interrupt flag is
//! observed at every yield site and raises `interrupted by user`.

pub mod files;
pub mod terminal;
pub mod timers;

use basic_core::{DataSegment, Value};
use files::{FileItem, FileManager};
use mlua::{Lua, Variadic};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::BufRead;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use terminal::Sink;
use timers::TimerManager;

/// The message the yield probes raise when the interrupt flag is set. The
/// driver recognizes and suppresses it.
pub const INTERRUPTED: &str = "interrupted by user";

struct DataState {
    segment: DataSegment,
    pos: usize,
}

impl DataState {
    fn next(&mut self) -> mlua::Result<&Value> {
        match self.segment.values().get(self.pos) {
            Some(value) => {
                self.pos += 1;
                Ok(value)
            }
            None => Err(mlua::Error::RuntimeError("OUT OF DATA".to_string())),
        }
    }
}

struct RuntimeState {
    sink: Sink,
    input: RefCell<VecDeque<String>>,
    use_stdin: bool,
    data: RefCell<DataState>,
    files: RefCell<FileManager>,
    timers: RefCell<TimerManager>,
    constants: Vec<Value>,
    interrupt: Arc<AtomicBool>,
}

impl RuntimeState {
    fn read_input_line(&self) -> String {
        if self.use_stdin {
            let mut line = String::new();
            let _ = std::io::stdin().lock().read_line(&mut line);
            line.trim_end_matches(['\n', '\r']).to_string()
        } else {
            self.input.borrow_mut().pop_front().unwrap_or_default()
        }
    }
}

/// How to execute a compiled program.
#[derive(Default)]
pub struct ExecConfig {
    /// Collect terminal output into a buffer instead of stdout.
    pub capture_output: bool,
    /// Scripted INPUT lines (used when non-empty; otherwise stdin).
    pub scripted_input: Vec<String>,
    /// Constants snapshot for `constants_get`.
    pub constants: Vec<Value>,
    /// Externally-owned interrupt flag (Ctrl+C); a private one otherwise.
    pub interrupt: Option<Arc<AtomicBool>>,
}

/// Result of a completed run.
pub struct ExecResult {
    /// Captured terminal output when `capture_output` was set.
    pub output: Option<String>,
}

/// Install a SIGINT handler that sets `flag`.
pub fn install_interrupt_handler(flag: Arc<AtomicBool>) -> Result<(), String> {
    signal_hook::flag::register(signal_hook::consts::SIGINT, flag)
        .map(|_| ())
        .map_err(|e| format!("Cannot install SIGINT handler: {}", e))
}

fn rt_err(message: String) -> mlua::Error {
    mlua::Error::RuntimeError(message)
}

/// Pump the event model once: interrupt check, then fire due timers FIFO.
fn pump(lua: &Lua, state: &Rc<RuntimeState>) -> mlua::Result<()> {
    if state.interrupt.load(Ordering::SeqCst) {
        return Err(rt_err(INTERRUPTED.to_string()));
    }
    let due = state.timers.borrow_mut().collect_due(Instant::now());
    for (id, handler) in due {
        state.timers.borrow_mut().set_running(id, true);
        let outcome: mlua::Result<()> = lua
            .globals()
            .get::<mlua::Function>(handler.as_str())
            .and_then(|f| f.call::<()>(()));
        state.timers.borrow_mut().set_running(id, false);
        outcome?;
    }
    Ok(())
}

fn wait_with_pump(lua: &Lua, state: &Rc<RuntimeState>, total: Duration) -> mlua::Result<()> {
    let end = Instant::now() + total;
    loop {
        pump(lua, state)?;
        let now = Instant::now();
        if now >= end {
            return Ok(());
        }
        std::thread::sleep((end - now).min(Duration::from_millis(5)));
    }
}

fn lua_value_to_item(value: &mlua::Value) -> FileItem {
    match value {
        mlua::Value::Integer(n) => FileItem::Int(*n),
        mlua::Value::Number(d) => FileItem::Num(*d),
        other => FileItem::Str(terminal::lua_display(other)),
    }
}

/// Register the whole protocol into a Lua state.
fn register(lua: &Lua, state: Rc<RuntimeState>) -> mlua::Result<()> {
    let globals = lua.globals();

    // -- terminal ----------------------------------------------------------
    {
        let s = state.clone();
        globals.set(
            "terminal_print_str",
            lua.create_function(move |_, text: String| {
                s.sink.write(&text);
                Ok(())
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "terminal_print_num",
            lua.create_function(move |_, value: mlua::Value| {
                s.sink.write(&terminal::print_num_text(&value));
                Ok(())
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "terminal_print_nl",
            lua.create_function(move |_, ()| {
                s.sink.write("\n");
                Ok(())
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "terminal_print_tab",
            lua.create_function(move |_, ()| {
                s.sink.write("\t");
                Ok(())
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "terminal_cls",
            lua.create_function(move |_, ()| {
                s.sink.write("\x1b[2J\x1b[H");
                Ok(())
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "terminal_locate",
            lua.create_function(move |_, (row, col): (i64, i64)| {
                s.sink.write(&format!("\x1b[{};{}H", row.max(1), col.max(1)));
                Ok(())
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "terminal_beep",
            lua.create_function(move |_, ()| {
                s.sink.write("\x07");
                Ok(())
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "terminal_set_color",
            lua.create_function(move |_, (fg, bg): (i64, i64)| {
                s.sink.write(&format!("\x1b[38;5;{}m", fg.rem_euclid(256)));
                if bg >= 0 {
                    s.sink.write(&format!("\x1b[48;5;{}m", bg.rem_euclid(256)));
                }
                Ok(())
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "terminal_reset_colors",
            lua.create_function(move |_, ()| {
                s.sink.write("\x1b[0m");
                Ok(())
            })?,
        )?;
        globals.set(
            "terminal_width",
            lua.create_function(|_, ()| Ok(80i64))?,
        )?;
        globals.set(
            "terminal_height",
            lua.create_function(|_, ()| Ok(24i64))?,
        )?;
        globals.set(
            "terminal_inkey",
            lua.create_function(|_, ()| Ok(String::new()))?,
        )?;
        globals.set(
            "terminal_key",
            lua.create_function(|_, _code: i64| Ok(0i64))?,
        )?;
        let s = state.clone();
        globals.set(
            "terminal_input_num",
            lua.create_function(move |lua, ()| {
                pump(lua, &s)?;
                let line = s.read_input_line();
                Ok(line.trim().parse::<f64>().unwrap_or(0.0))
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "terminal_input_str",
            lua.create_function(move |lua, ()| {
                pump(lua, &s)?;
                Ok(s.read_input_line())
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "terminal_line_input",
            lua.create_function(move |lua, ()| {
                pump(lua, &s)?;
                Ok(s.read_input_line())
            })?,
        )?;
    }

    // -- DATA --------------------------------------------------------------
    {
        let s = state.clone();
        globals.set(
            "data_init",
            lua.create_function(move |_, values: mlua::Table| {
                let mut data = s.data.borrow_mut();
                data.segment = DataSegment::new();
                data.pos = 0;
                for entry in values.sequence_values::<mlua::Value>() {
                    let value = match entry? {
                        mlua::Value::Integer(n) => Value::Int(n),
                        mlua::Value::Number(d) => Value::Double(d),
                        other => Value::Str(terminal::lua_display(&other)),
                    };
                    data.segment.push(value);
                }
                Ok(())
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "data_restore_point",
            lua.create_function(move |_, (line, index): (i64, usize)| {
                s.data
                    .borrow_mut()
                    .segment
                    .add_line_restore(line.max(0) as u32, index);
                Ok(())
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "data_restore_label_point",
            lua.create_function(move |_, (label, index): (String, usize)| {
                s.data.borrow_mut().segment.add_label_restore(&label, index);
                Ok(())
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "data_read_int",
            lua.create_function(move |_, ()| {
                let mut data = s.data.borrow_mut();
                data.next().map(Value::as_int)
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "data_read_double",
            lua.create_function(move |_, ()| {
                let mut data = s.data.borrow_mut();
                data.next().map(Value::as_double)
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "data_read_string",
            lua.create_function(move |_, ()| {
                let mut data = s.data.borrow_mut();
                data.next().map(Value::as_str)
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "data_restore",
            lua.create_function(move |_, ()| {
                s.data.borrow_mut().pos = 0;
                Ok(())
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "data_restore_line",
            lua.create_function(move |_, line: i64| {
                let mut data = s.data.borrow_mut();
                data.pos = data
                    .segment
                    .restore_index_for_line(line.max(0) as u32)
                    .unwrap_or(0);
                Ok(())
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "data_restore_label",
            lua.create_function(move |_, label: String| {
                let mut data = s.data.borrow_mut();
                match data.segment.restore_index_for_label(&label) {
                    Some(index) => {
                        data.pos = index;
                        Ok(())
                    }
                    None => Err(rt_err(format!("RESTORE: unknown DATA label '{}'", label))),
                }
            })?,
        )?;
    }

    // -- files -------------------------------------------------------------
    {
        let s = state.clone();
        globals.set(
            "file_open",
            lua.create_function(move |_, (path, mode, number): (String, String, i64)| {
                s.files.borrow_mut().open(&path, &mode, number).map_err(rt_err)
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "file_close",
            lua.create_function(move |_, number: i64| {
                s.files.borrow_mut().close(number).map_err(rt_err)
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "file_close_all",
            lua.create_function(move |_, ()| {
                s.files.borrow_mut().close_all();
                Ok(())
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "file_print",
            lua.create_function(move |_, (number, value): (i64, mlua::Value)| {
                let text = match &value {
                    mlua::Value::String(text) => text.to_string_lossy().to_string(),
                    other => terminal::print_num_text(other),
                };
                s.files.borrow_mut().print(number, &text).map_err(rt_err)
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "file_print_nl",
            lua.create_function(move |_, number: i64| {
                s.files.borrow_mut().print(number, "\n").map_err(rt_err)
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "file_write_item",
            lua.create_function(
                move |_, (number, value, first): (i64, mlua::Value, i64)| {
                    s.files
                        .borrow_mut()
                        .write_item(number, lua_value_to_item(&value), first != 0)
                        .map_err(rt_err)
                },
            )?,
        )?;
        let s = state.clone();
        globals.set(
            "file_write_nl",
            lua.create_function(move |_, number: i64| {
                s.files.borrow_mut().print(number, "\n").map_err(rt_err)
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "file_line_input",
            lua.create_function(move |_, number: i64| {
                s.files.borrow_mut().line_input(number).map_err(rt_err)
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "file_input_str",
            lua.create_function(move |_, number: i64| {
                s.files.borrow_mut().input_item(number).map_err(rt_err)
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "file_input_num",
            lua.create_function(move |_, number: i64| {
                let item = s.files.borrow_mut().input_item(number).map_err(rt_err)?;
                Ok(item.trim().parse::<f64>().unwrap_or(0.0))
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "file_bget",
            lua.create_function(move |_, number: i64| {
                s.files.borrow_mut().bget(number).map_err(rt_err)
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "file_bput",
            lua.create_function(move |_, (number, byte): (i64, i64)| {
                s.files.borrow_mut().bput(number, byte).map_err(rt_err)
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "file_eof",
            lua.create_function(move |_, number: i64| {
                s.files
                    .borrow_mut()
                    .eof(number)
                    .map(|eof| if eof { 1i64 } else { 0i64 })
                    .map_err(rt_err)
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "file_loc",
            lua.create_function(move |_, number: i64| {
                s.files.borrow_mut().loc(number).map_err(rt_err)
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "file_lof",
            lua.create_function(move |_, number: i64| {
                s.files.borrow_mut().lof(number).map_err(rt_err)
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "file_ptr",
            lua.create_function(move |_, number: i64| {
                s.files.borrow_mut().ptr(number).map_err(rt_err)
            })?,
        )?;
    }

    // -- timers and yields -------------------------------------------------
    {
        let s = state.clone();
        globals.set(
            "basic_timer_after_ms",
            lua.create_function(move |_, (ms, handler): (f64, String)| {
                Ok(s.timers.borrow_mut().after_ms(ms.max(0.0) as u64, &handler))
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "basic_timer_every_ms",
            lua.create_function(move |_, (ms, handler): (f64, String)| {
                Ok(s.timers.borrow_mut().every_ms(ms.max(0.0) as u64, &handler))
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "basic_timer_after_frames",
            lua.create_function(move |_, (frames, handler): (f64, String)| {
                Ok(s
                    .timers
                    .borrow_mut()
                    .after_frames(frames.max(0.0) as u64, &handler))
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "basic_timer_every_frames",
            lua.create_function(move |_, (frames, handler): (f64, String)| {
                Ok(s
                    .timers
                    .borrow_mut()
                    .every_frames(frames.max(0.0) as u64, &handler))
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "basic_timer_stop",
            lua.create_function(move |_, id: i64| {
                s.timers.borrow_mut().stop(id.max(0) as u64);
                Ok(())
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "basic_timer_stop_name",
            lua.create_function(move |_, handler: String| {
                s.timers.borrow_mut().stop_by_handler(&handler);
                Ok(())
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "basic_timer_stop_all",
            lua.create_function(move |_, ()| {
                s.timers.borrow_mut().stop_all();
                Ok(())
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "basic_timer_active",
            lua.create_function(move |_, id: i64| {
                Ok(if s.timers.borrow().is_active(id.max(0) as u64) {
                    1i64
                } else {
                    0i64
                })
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "basic_pump_events",
            lua.create_function(move |lua, ()| pump(lua, &s))?,
        )?;
        let s = state.clone();
        globals.set(
            "check_should_stop",
            lua.create_function(move |_, ()| {
                if s.interrupt.load(Ordering::SeqCst) {
                    return Err(rt_err(INTERRUPTED.to_string()));
                }
                Ok(())
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "wait_ms",
            lua.create_function(move |lua, ms: f64| {
                wait_with_pump(lua, &s, Duration::from_millis(ms.max(0.0) as u64))
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "basic_sleep",
            lua.create_function(move |lua, seconds: f64| {
                wait_with_pump(
                    lua,
                    &s,
                    Duration::from_millis((seconds.max(0.0) * 1000.0) as u64),
                )
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "wait_frame",
            lua.create_function(move |lua, ()| {
                s.timers.borrow_mut().advance_frame();
                wait_with_pump(lua, &s, Duration::from_millis(16))
            })?,
        )?;
        let s = state.clone();
        globals.set(
            "WAIT_FRAMES",
            lua.create_function(move |lua, frames: Variadic<f64>| {
                let count = frames.first().copied().unwrap_or(1.0).max(0.0) as u64;
                for _ in 0..count.max(1) {
                    s.timers.borrow_mut().advance_frame();
                    wait_with_pump(lua, &s, Duration::from_millis(16))?;
                }
                Ok(())
            })?,
        )?;
    }

    // -- constants ---------------------------------------------------------
    {
        let s = state.clone();
        globals.set(
            "constants_get",
            lua.create_function(move |lua, index: usize| {
                match s.constants.get(index) {
                    Some(Value::Int(n)) => Ok(mlua::Value::Integer(*n)),
                    Some(Value::Double(d)) => Ok(mlua::Value::Number(*d)),
                    Some(Value::Str(text)) => {
                        Ok(mlua::Value::String(lua.create_string(text)?))
                    }
                    None => Err(rt_err(format!("Unknown constant index {}", index))),
                }
            })?,
        )?;
    }

    Ok(())
}

/// Execute a compiled Lua program with the full protocol wired up.
pub fn execute(lua_source: &str, config: ExecConfig) -> Result<ExecResult, String> {
    let (sink, buffer) = if config.capture_output {
        let (sink, buffer) = Sink::buffer();
        (sink, Some(buffer))
    } else {
        (Sink::Stdout, None)
    };

    let use_stdin = config.scripted_input.is_empty();
    let state = Rc::new(RuntimeState {
        sink,
        input: RefCell::new(config.scripted_input.into_iter().collect()),
        use_stdin,
        data: RefCell::new(DataState {
            segment: DataSegment::new(),
            pos: 0,
        }),
        files: RefCell::new(FileManager::new()),
        timers: RefCell::new(TimerManager::new()),
        constants: config.constants,
        interrupt: config
            .interrupt
            .unwrap_or_else(|| Arc::new(AtomicBool::new(false))),
    });

    let lua = Lua::new();
    register(&lua, state.clone()).map_err(|e| format!("Runtime registration failed: {}", e))?;

    let outcome = lua.load(lua_source).set_name("program").exec();

    let output = buffer.map(|b| b.borrow().clone());
    match outcome {
        Ok(()) => Ok(ExecResult { output }),
        Err(e) => {
            let message = match &e {
                mlua::Error::RuntimeError(m) => m.clone(),
                other => other.to_string(),
            };
            Err(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_captured(src: &str) -> Result<String, String> {
        execute(
            src,
            ExecConfig {
                capture_output: true,
                ..ExecConfig::default()
            },
        )
        .map(|r| r.output.unwrap_or_default())
    }

    #[test]
    fn terminal_output_is_captured() {
        let out = run_captured("terminal_print_str(\"HI\") terminal_print_nl()").unwrap();
        assert_eq!(out, "HI\n");
    }

    #[test]
    fn numeric_print_has_trailing_space() {
        let out = run_captured("terminal_print_num(314)").unwrap();
        assert_eq!(out, "314 ");
    }

    #[test]
    fn data_round_trip_with_labels() {
        let out = run_captured(
            r#"
data_init({1, 2, "three", 4, 5})
data_restore_label_point("RESET", 3)
local a = data_read_int()
local b = data_read_int()
local c = data_read_string()
data_restore_label("RESET")
local d = data_read_int()
terminal_print_num(d)
terminal_print_str(c)
"#,
        )
        .unwrap();
        assert_eq!(out, "4 three");
    }

    #[test]
    fn read_past_end_raises_out_of_data() {
        let err = run_captured("data_init({1}) data_read_int() data_read_int()").unwrap_err();
        assert!(err.contains("OUT OF DATA"), "{}", err);
    }

    #[test]
    fn timers_fire_during_wait() {
        let out = run_captured(
            r#"
T = 0
function PROC_TICK() T = T + 1 end
basic_timer_every_ms(20, "PROC_TICK")
wait_ms(70)
basic_timer_stop_all()
terminal_print_num(T)
"#,
        )
        .unwrap();
        let fired: i64 = out.trim().parse().unwrap();
        assert!((3..=4).contains(&fired), "fired {}", fired);
    }

    #[test]
    fn interrupt_raises_at_yield() {
        let flag = Arc::new(AtomicBool::new(true));
        let err = execute(
            "basic_pump_events()",
            ExecConfig {
                capture_output: true,
                interrupt: Some(flag),
                ..ExecConfig::default()
            },
        )
        .map(|_| ())
        .unwrap_err();
        assert!(err.contains(INTERRUPTED));
    }

    #[test]
    fn scripted_input_feeds_terminal_input() {
        let result = execute(
            "terminal_print_num(terminal_input_num()) terminal_print_str(terminal_input_str())",
            ExecConfig {
                capture_output: true,
                scripted_input: vec!["42".into(), "hello".into()],
                ..ExecConfig::default()
            },
        )
        .unwrap();
        assert_eq!(result.output.unwrap(), "42 hello");
    }

    #[test]
    fn constants_get_returns_tagged_values() {
        let result = execute(
            "terminal_print_num(constants_get(0))",
            ExecConfig {
                capture_output: true,
                constants: vec![Value::Int(7)],
                ..ExecConfig::default()
            },
        )
        .unwrap();
        assert_eq!(result.output.unwrap(), "7 ");
    }
}
