//! The DATA/READ/RESTORE model.
//!
//! The preprocessor extracts every `DATA` statement into a [`DataSegment`]:
//! an ordered vector of typed values plus two restore maps, one keyed by
//! BASIC line number and one by label name. The segment is immutable once
//! preprocessing completes; the runtime wraps it in a [`DataReader`] that
//! carries the read cursor.

use crate::value::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Raised when `READ` runs past the last DATA value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutOfDataError;

impl fmt::Display for OutOfDataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OUT OF DATA")
    }
}

impl std::error::Error for OutOfDataError {}

/// Ordered DATA values with restore points.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataSegment {
    values: Vec<Value>,
    line_restore: BTreeMap<u32, usize>,
    label_restore: HashMap<String, usize>,
}

impl DataSegment {
    pub fn new() -> Self {
        DataSegment::default()
    }

    /// Append a parsed value, returning its index.
    pub fn push(&mut self, value: Value) -> usize {
        self.values.push(value);
        self.values.len() - 1
    }

    /// Record a restore point at `index` for a BASIC line number.
    pub fn add_line_restore(&mut self, line: u32, index: usize) {
        self.line_restore.insert(line, index);
    }

    /// Record a restore point at `index` for a label. Labels are compared
    /// case-insensitively (upper-cased keys).
    pub fn add_label_restore(&mut self, label: &str, index: usize) {
        self.label_restore.insert(label.to_uppercase(), index);
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn line_restore_points(&self) -> &BTreeMap<u32, usize> {
        &self.line_restore
    }

    pub fn label_restore_points(&self) -> &HashMap<String, usize> {
        &self.label_restore
    }

    pub fn restore_index_for_line(&self, line: u32) -> Option<usize> {
        self.line_restore.get(&line).copied()
    }

    pub fn restore_index_for_label(&self, label: &str) -> Option<usize> {
        self.label_restore.get(&label.to_uppercase()).copied()
    }
}

/// A read cursor over a [`DataSegment`].
#[derive(Debug, Clone)]
pub struct DataReader {
    segment: DataSegment,
    pos: usize,
}

impl DataReader {
    pub fn new(segment: DataSegment) -> Self {
        DataReader { segment, pos: 0 }
    }

    fn next(&mut self) -> Result<&Value, OutOfDataError> {
        let value = self.segment.values.get(self.pos).ok_or(OutOfDataError)?;
        self.pos += 1;
        Ok(value)
    }

    pub fn read_value(&mut self) -> Result<Value, OutOfDataError> {
        self.next().cloned()
    }

    pub fn read_int(&mut self) -> Result<i64, OutOfDataError> {
        self.next().map(Value::as_int)
    }

    pub fn read_double(&mut self) -> Result<f64, OutOfDataError> {
        self.next().map(Value::as_double)
    }

    pub fn read_string(&mut self) -> Result<String, OutOfDataError> {
        self.next().map(Value::as_str)
    }

    /// `RESTORE` with no target: rewind to the first value.
    pub fn restore(&mut self) {
        self.pos = 0;
    }

    /// `RESTORE <line>`: unknown lines rewind to the start, matching the
    /// permissive runtime behavior of the dialect.
    pub fn restore_to_line(&mut self, line: u32) {
        self.pos = self.segment.restore_index_for_line(line).unwrap_or(0);
    }

    /// `RESTORE <label>`.
    pub fn restore_to_label(&mut self, label: &str) -> Result<(), String> {
        match self.segment.restore_index_for_label(label) {
            Some(index) => {
                self.pos = index;
                Ok(())
            }
            None => Err(format!("RESTORE: unknown DATA label '{}'", label)),
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn has_more(&self) -> bool {
        self.pos < self.segment.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DataSegment {
        let mut seg = DataSegment::new();
        seg.push(Value::Int(1));
        seg.push(Value::Int(2));
        seg.push(Value::Str("three".into()));
        seg.add_line_restore(10, 0);
        seg.add_label_restore("Reset", 2);
        seg
    }

    #[test]
    fn sequential_reads_with_coercion() {
        let mut reader = DataReader::new(sample());
        assert_eq!(reader.read_int().unwrap(), 1);
        assert_eq!(reader.read_double().unwrap(), 2.0);
        assert_eq!(reader.read_string().unwrap(), "three");
        assert_eq!(reader.read_value(), Err(OutOfDataError));
    }

    #[test]
    fn out_of_data_message() {
        assert_eq!(OutOfDataError.to_string(), "OUT OF DATA");
    }

    #[test]
    fn restore_targets() {
        let mut reader = DataReader::new(sample());
        reader.read_int().unwrap();
        reader.read_int().unwrap();
        reader.restore_to_line(10);
        assert_eq!(reader.read_int().unwrap(), 1);
        reader.restore_to_label("RESET").unwrap();
        assert_eq!(reader.read_string().unwrap(), "three");
        reader.restore();
        assert_eq!(reader.position(), 0);
        assert!(reader.restore_to_label("nope").is_err());
    }

    #[test]
    fn unknown_line_restores_to_start() {
        let mut reader = DataReader::new(sample());
        reader.read_int().unwrap();
        reader.restore_to_line(999);
        assert_eq!(reader.position(), 0);
    }
}
