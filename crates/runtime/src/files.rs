//! Numbered file handles for OPEN/CLOSE/PRINT#/INPUT#/WRITE#/BGET/BPUT.
//!
//! File numbers run 1..255 and are released on CLOSE. `BGET` returns -1 at
//! end of file. `WRITE#` quotes strings with doubled embedded quotes;
//! `PRINT#` writes text unquoted.

use basic_core::value::format_double;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

#[derive(Debug)]
struct OpenFile {
    file: File,
    readable: bool,
    writable: bool,
}

#[derive(Debug, Default)]
pub struct FileManager {
    files: HashMap<u8, OpenFile>,
}

/// A typed WRITE#/PRINT# item.
pub enum FileItem {
    Int(i64),
    Num(f64),
    Str(String),
}

impl FileManager {
    pub fn new() -> Self {
        FileManager::default()
    }

    fn check_number(number: i64) -> Result<u8, String> {
        if (1..=255).contains(&number) {
            Ok(number as u8)
        } else {
            Err(format!("Invalid file number {}", number))
        }
    }

    fn handle(&mut self, number: i64) -> Result<&mut OpenFile, String> {
        let n = Self::check_number(number)?;
        self.files
            .get_mut(&n)
            .ok_or_else(|| format!("File #{} is not open", number))
    }

    pub fn open(&mut self, path: &str, mode: &str, number: i64) -> Result<(), String> {
        let n = Self::check_number(number)?;
        if self.files.contains_key(&n) {
            return Err(format!("File #{} is already open", number));
        }
        let (file, readable, writable) = match mode.to_uppercase().as_str() {
            "INPUT" => (
                File::open(path).map_err(|e| format!("Cannot open '{}': {}", path, e))?,
                true,
                false,
            ),
            "OUTPUT" => (
                File::create(path).map_err(|e| format!("Cannot create '{}': {}", path, e))?,
                false,
                true,
            ),
            "APPEND" => (
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| format!("Cannot append '{}': {}", path, e))?,
                false,
                true,
            ),
            "RANDOM" => (
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(path)
                    .map_err(|e| format!("Cannot open '{}': {}", path, e))?,
                true,
                true,
            ),
            other => return Err(format!("Unknown OPEN mode '{}'", other)),
        };
        self.files.insert(
            n,
            OpenFile {
                file,
                readable,
                writable,
            },
        );
        Ok(())
    }

    pub fn close(&mut self, number: i64) -> Result<(), String> {
        let n = Self::check_number(number)?;
        self.files
            .remove(&n)
            .map(|_| ())
            .ok_or_else(|| format!("File #{} is not open", number))
    }

    pub fn close_all(&mut self) {
        self.files.clear();
    }

    /// Read one byte; -1 at end of file.
    pub fn bget(&mut self, number: i64) -> Result<i64, String> {
        let handle = self.handle(number)?;
        if !handle.readable {
            return Err(format!("File #{} is not open for reading", number));
        }
        let mut byte = [0u8; 1];
        match handle.file.read(&mut byte) {
            Ok(0) => Ok(-1),
            Ok(_) => Ok(byte[0] as i64),
            Err(e) => Err(format!("Read error on #{}: {}", number, e)),
        }
    }

    pub fn bput(&mut self, number: i64, byte: i64) -> Result<(), String> {
        let handle = self.handle(number)?;
        if !handle.writable {
            return Err(format!("File #{} is not open for writing", number));
        }
        handle
            .file
            .write_all(&[(byte & 0xFF) as u8])
            .map_err(|e| format!("Write error on #{}: {}", number, e))
    }

    /// Read up to the next newline; strips the line terminator.
    pub fn line_input(&mut self, number: i64) -> Result<String, String> {
        let handle = self.handle(number)?;
        if !handle.readable {
            return Err(format!("File #{} is not open for reading", number));
        }
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match handle.file.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    if byte[0] == b'\n' {
                        break;
                    }
                    if byte[0] != b'\r' {
                        line.push(byte[0]);
                    }
                }
                Err(e) => return Err(format!("Read error on #{}: {}", number, e)),
            }
        }
        Ok(String::from_utf8_lossy(&line).to_string())
    }

    /// `INPUT #` - one comma- or newline-separated datum, honoring quoted
    /// strings.
    pub fn input_item(&mut self, number: i64) -> Result<String, String> {
        let handle = self.handle(number)?;
        if !handle.readable {
            return Err(format!("File #{} is not open for reading", number));
        }
        let mut byte = [0u8; 1];
        let mut item = Vec::new();
        let mut in_quote = false;
        let mut started = false;
        loop {
            match handle.file.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    let c = byte[0];
                    if !started && (c == b' ' || c == b'\t' || c == b'\r' || c == b'\n') {
                        continue;
                    }
                    if !started && c == b'"' {
                        started = true;
                        in_quote = true;
                        continue;
                    }
                    started = true;
                    if in_quote {
                        if c == b'"' {
                            in_quote = false;
                        } else {
                            item.push(c);
                        }
                        continue;
                    }
                    if c == b',' || c == b'\n' {
                        break;
                    }
                    if c != b'\r' {
                        item.push(c);
                    }
                }
                Err(e) => return Err(format!("Read error on #{}: {}", number, e)),
            }
        }
        Ok(String::from_utf8_lossy(&item).trim_end().to_string())
    }

    /// `PRINT #` - unquoted text.
    pub fn print(&mut self, number: i64, text: &str) -> Result<(), String> {
        let handle = self.handle(number)?;
        if !handle.writable {
            return Err(format!("File #{} is not open for writing", number));
        }
        handle
            .file
            .write_all(text.as_bytes())
            .map_err(|e| format!("Write error on #{}: {}", number, e))
    }

    /// `WRITE #` - comma separated, strings quoted with `""`-doubled
    /// embedded quotes.
    pub fn write_item(&mut self, number: i64, item: FileItem, first: bool) -> Result<(), String> {
        let mut text = String::new();
        if !first {
            text.push(',');
        }
        match item {
            FileItem::Int(n) => text.push_str(&n.to_string()),
            FileItem::Num(d) => text.push_str(&format_double(d)),
            FileItem::Str(s) => {
                text.push('"');
                text.push_str(&s.replace('"', "\"\""));
                text.push('"');
            }
        }
        self.print(number, &text)
    }

    pub fn eof(&mut self, number: i64) -> Result<bool, String> {
        let handle = self.handle(number)?;
        let pos = handle
            .file
            .stream_position()
            .map_err(|e| format!("Seek error on #{}: {}", number, e))?;
        let len = handle
            .file
            .metadata()
            .map_err(|e| format!("Stat error on #{}: {}", number, e))?
            .len();
        Ok(pos >= len)
    }

    pub fn loc(&mut self, number: i64) -> Result<i64, String> {
        let handle = self.handle(number)?;
        handle
            .file
            .stream_position()
            .map(|p| p as i64)
            .map_err(|e| format!("Seek error on #{}: {}", number, e))
    }

    pub fn lof(&mut self, number: i64) -> Result<i64, String> {
        let handle = self.handle(number)?;
        handle
            .file
            .metadata()
            .map(|m| m.len() as i64)
            .map_err(|e| format!("Stat error on #{}: {}", number, e))
    }

    pub fn ptr(&mut self, number: i64) -> Result<i64, String> {
        self.loc(number)
    }

    pub fn set_ptr(&mut self, number: i64, position: i64) -> Result<(), String> {
        let handle = self.handle(number)?;
        handle
            .file
            .seek(SeekFrom::Start(position.max(0) as u64))
            .map(|_| ())
            .map_err(|e| format!("Seek error on #{}: {}", number, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_write_read_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let path = path.to_str().unwrap();

        let mut files = FileManager::new();
        files.open(path, "OUTPUT", 1).unwrap();
        files.print(1, "hello\n").unwrap();
        files.close(1).unwrap();

        files.open(path, "INPUT", 1).unwrap();
        assert_eq!(files.line_input(1).unwrap(), "hello");
        assert!(files.eof(1).unwrap());
        files.close(1).unwrap();
    }

    #[test]
    fn write_quotes_strings_with_doubled_quotes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("w.txt");
        let path = path.to_str().unwrap();

        let mut files = FileManager::new();
        files.open(path, "OUTPUT", 2).unwrap();
        files
            .write_item(2, FileItem::Str("say \"hi\"".into()), true)
            .unwrap();
        files.write_item(2, FileItem::Int(42), false).unwrap();
        files.close(2).unwrap();

        let written = std::fs::read_to_string(path).unwrap();
        assert_eq!(written, "\"say \"\"hi\"\"\",42");
    }

    #[test]
    fn bget_returns_minus_one_at_eof() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("b.bin");
        let path = path.to_str().unwrap();

        let mut files = FileManager::new();
        files.open(path, "OUTPUT", 1).unwrap();
        files.bput(1, 65).unwrap();
        files.close(1).unwrap();

        files.open(path, "INPUT", 1).unwrap();
        assert_eq!(files.bget(1).unwrap(), 65);
        assert_eq!(files.bget(1).unwrap(), -1);
        files.close(1).unwrap();
    }

    #[test]
    fn file_numbers_are_validated_and_released() {
        let mut files = FileManager::new();
        assert!(files.open("x", "OUTPUT", 0).is_err());
        assert!(files.open("x", "OUTPUT", 256).is_err());
        assert!(files.close(3).is_err());

        let dir = tempdir().unwrap();
        let path = dir.path().join("n.txt");
        let path = path.to_str().unwrap();
        files.open(path, "OUTPUT", 3).unwrap();
        assert!(files.open(path, "OUTPUT", 3).is_err());
        files.close(3).unwrap();
        files.open(path, "OUTPUT", 3).unwrap();
        files.close_all();
        assert!(files.close(3).is_err());
    }
}
