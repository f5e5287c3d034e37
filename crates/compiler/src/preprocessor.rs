//! Source preprocessing: include expansion, REM normalization, DATA
//! extraction and line-number→label rewriting.
//!
//! All passes operate on raw text, before the lexer runs, and none of them
//! can fail - the worst case is a pass-through. Every pass preserves the
//! source line count (removed lines become blank lines) so the line mapping
//! built later by the lexer stays valid.

use crate::diagnostics::{Diagnostic, DiagnosticKind};
use crate::token::SourceLoc;
use basic_core::{DataSegment, Value};
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

fn is_ws(c: char) -> bool {
    c == ' ' || c == '\t' || c == '\r'
}

/// Character-index cursor over one line. All preprocessor scanning is
/// byte-oriented ASCII; multi-byte characters only ever appear inside string
/// literals, which the scanners skip over as opaque runs.
fn skip_ws(bytes: &[u8], pos: &mut usize) {
    while *pos < bytes.len() && is_ws(bytes[*pos] as char) {
        *pos += 1;
    }
}

/// Parse a leading line number at `pos`, advancing past it and trailing
/// whitespace. Returns `None` when the line does not start with digits.
fn extract_line_number(bytes: &[u8], pos: &mut usize) -> Option<u32> {
    skip_ws(bytes, pos);
    let start = *pos;
    let mut value: u32 = 0;
    while *pos < bytes.len() && bytes[*pos].is_ascii_digit() {
        value = value.wrapping_mul(10).wrapping_add((bytes[*pos] - b'0') as u32);
        *pos += 1;
    }
    if *pos == start {
        return None;
    }
    skip_ws(bytes, pos);
    Some(value)
}

/// Parse a `name:` label at `pos`, advancing past it and trailing
/// whitespace. The name must not be a keyword-shaped word followed by
/// anything other than `:`.
fn extract_label(bytes: &[u8], pos: &mut usize) -> Option<String> {
    let start = *pos;
    if *pos >= bytes.len() || !(bytes[*pos].is_ascii_alphabetic() || bytes[*pos] == b'_') {
        return None;
    }
    let mut name = String::new();
    let mut p = *pos;
    while p < bytes.len() && (bytes[p].is_ascii_alphanumeric() || bytes[p] == b'_') {
        name.push(bytes[p] as char);
        p += 1;
    }
    if p < bytes.len() && bytes[p] == b':' {
        *pos = p + 1;
        skip_ws(bytes, pos);
        Some(name)
    } else {
        *pos = start;
        None
    }
}

/// True when `word` (upper-case) occurs at `pos` as a whole word.
fn word_at(upper: &[u8], pos: usize, word: &str) -> bool {
    let w = word.as_bytes();
    if pos + w.len() > upper.len() || &upper[pos..pos + w.len()] != w {
        return false;
    }
    let before_ok = pos == 0 || !(upper[pos - 1].is_ascii_alphanumeric() || upper[pos - 1] == b'_');
    let after = pos + w.len();
    let after_ok =
        after >= upper.len() || !(upper[after].is_ascii_alphanumeric() || upper[after] == b'_');
    before_ok && after_ok
}

// ---------------------------------------------------------------------------
// Include expansion
// ---------------------------------------------------------------------------

/// Textually merge `INCLUDE "path" [ONCE]` directives before lexing.
///
/// A visited set prevents cycles; `ONCE` suppresses repeated inclusion of the
/// same canonical path. Unresolvable includes produce a diagnostic and the
/// directive line becomes blank.
pub fn expand_includes(
    source: &str,
    base_dir: &Path,
    diagnostics: &mut Vec<Diagnostic>,
) -> String {
    let mut visited = HashSet::new();
    let mut once_seen = HashSet::new();
    expand_includes_inner(source, base_dir, &mut visited, &mut once_seen, diagnostics)
}

fn expand_includes_inner(
    source: &str,
    base_dir: &Path,
    visited: &mut HashSet<PathBuf>,
    once_seen: &mut HashSet<PathBuf>,
    diagnostics: &mut Vec<Diagnostic>,
) -> String {
    let mut out = String::new();
    for (idx, line) in source.lines().enumerate() {
        match parse_include_directive(line) {
            Some((path, once)) => {
                let full = base_dir.join(&path);
                let canonical = full.canonicalize().unwrap_or_else(|_| full.clone());
                if once && once_seen.contains(&canonical) {
                    out.push('\n');
                    continue;
                }
                if visited.contains(&canonical) {
                    diagnostics.push(Diagnostic::new(
                        DiagnosticKind::SyntaxError,
                        format!("INCLUDE cycle detected at \"{}\"", path),
                        SourceLoc::new(idx, 0),
                    ));
                    out.push('\n');
                    continue;
                }
                match fs::read_to_string(&full) {
                    Ok(text) => {
                        visited.insert(canonical.clone());
                        once_seen.insert(canonical.clone());
                        let nested_dir = full.parent().unwrap_or(base_dir).to_path_buf();
                        out.push_str(&expand_includes_inner(
                            &text,
                            &nested_dir,
                            visited,
                            once_seen,
                            diagnostics,
                        ));
                        if !out.ends_with('\n') {
                            out.push('\n');
                        }
                        visited.remove(&canonical);
                    }
                    Err(e) => {
                        diagnostics.push(Diagnostic::new(
                            DiagnosticKind::SyntaxError,
                            format!("Cannot read INCLUDE file \"{}\": {}", path, e),
                            SourceLoc::new(idx, 0),
                        ));
                        out.push('\n');
                    }
                }
            }
            None => {
                out.push_str(line);
                out.push('\n');
            }
        }
    }
    out
}

/// Recognize `[line#] INCLUDE "path" [ONCE]`, returning the path and the
/// ONCE flag.
fn parse_include_directive(line: &str) -> Option<(String, bool)> {
    let bytes = line.as_bytes();
    let upper: Vec<u8> = bytes.iter().map(|b| b.to_ascii_uppercase()).collect();
    let mut pos = 0;
    extract_line_number(bytes, &mut pos);
    if !word_at(&upper, pos, "INCLUDE") {
        return None;
    }
    pos += "INCLUDE".len();
    skip_ws(bytes, &mut pos);
    if pos >= bytes.len() || bytes[pos] != b'"' {
        return None;
    }
    pos += 1;
    let start = pos;
    while pos < bytes.len() && bytes[pos] != b'"' {
        pos += 1;
    }
    if pos >= bytes.len() {
        return None;
    }
    let path = line[start..pos].to_string();
    pos += 1;
    skip_ws(bytes, &mut pos);
    let once = word_at(&upper, pos, "ONCE");
    Some((path, once))
}

// ---------------------------------------------------------------------------
// REM normalization
// ---------------------------------------------------------------------------

fn is_rem_at(upper: &[u8], pos: usize) -> bool {
    word_at(upper, pos, "REM")
}

/// Strip comment text, keeping the line number and the bare `REM`.
///
/// `1820 REM This is a comment` becomes `1820 REM`; a `REM` after a
/// statement separator keeps everything up to and including the colon.
/// Quoted strings are respected when looking for inline `REM`.
pub fn normalize_rem(source: &str) -> String {
    let mut out = String::new();
    for line in source.lines() {
        let bytes = line.as_bytes();
        let upper: Vec<u8> = bytes.iter().map(|b| b.to_ascii_uppercase()).collect();

        let mut pos = 0;
        skip_ws(bytes, &mut pos);
        let number_start = pos;
        let mut number_end = pos;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            pos += 1;
            number_end = pos;
        }
        skip_ws(bytes, &mut pos);
        extract_label(bytes, &mut pos);

        if is_rem_at(&upper, pos) {
            if number_end > number_start {
                out.push_str(&line[number_start..number_end]);
                out.push_str(" REM\n");
            } else {
                out.push_str("REM\n");
            }
            continue;
        }

        // Look for an inline REM after a colon, outside string literals.
        let mut in_quote = false;
        let mut quote = b'\0';
        let mut found = false;
        let mut i = pos;
        while i < bytes.len() {
            let c = bytes[i];
            if in_quote {
                if c == quote {
                    in_quote = false;
                }
            } else if c == b'"' || c == b'\'' {
                in_quote = true;
                quote = c;
            } else if c == b':' {
                let mut after = i + 1;
                skip_ws(bytes, &mut after);
                if is_rem_at(&upper, after) {
                    out.push_str(&line[..=i]);
                    out.push_str(" REM\n");
                    found = true;
                    break;
                }
            }
            i += 1;
        }
        if !found {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

// ---------------------------------------------------------------------------
// DATA extraction
// ---------------------------------------------------------------------------

/// True when the line is `[line#] [label:] DATA …`.
fn is_data_line(line: &str) -> Option<(Option<u32>, Option<String>, usize)> {
    let bytes = line.as_bytes();
    let upper: Vec<u8> = bytes.iter().map(|b| b.to_ascii_uppercase()).collect();
    let mut pos = 0;
    let number = extract_line_number(bytes, &mut pos);
    let label = extract_label(bytes, &mut pos);
    if word_at(&upper, pos, "DATA") {
        Some((number, label, pos + 4))
    } else {
        None
    }
}

/// Split the comma-separated values of a DATA clause, respecting double and
/// single quotes. A `'` or `REM` outside quotes ends the clause.
fn split_data_values(line: &str, mut pos: usize) -> Vec<String> {
    let bytes = line.as_bytes();
    let upper: Vec<u8> = bytes.iter().map(|b| b.to_ascii_uppercase()).collect();
    skip_ws(bytes, &mut pos);

    let mut values = Vec::new();
    let mut current = String::new();
    let mut any = false;
    let mut in_quote = false;
    let mut quote = b'\0';

    while pos < bytes.len() {
        let c = bytes[pos];
        if in_quote {
            current.push(c as char);
            if c == quote {
                in_quote = false;
            }
            pos += 1;
            continue;
        }
        if c == b'"' || (c == b'\'' && current.trim().is_empty()) {
            // A quote opens a string; an apostrophe only does so at the
            // start of a value - mid-value it is a comment marker.
            in_quote = true;
            quote = c;
            current.push(c as char);
            pos += 1;
        } else if c == b'\'' {
            break;
        } else if c == b',' {
            values.push(current.clone());
            any = true;
            current.clear();
            pos += 1;
            skip_ws(bytes, &mut pos);
        } else {
            if is_rem_at(&upper, pos) {
                break;
            }
            current.push(c as char);
            pos += 1;
        }
    }
    if any || !current.trim().is_empty() {
        values.push(current);
    }
    values
}

/// Extract every DATA statement into a [`DataSegment`], replacing extracted
/// lines with blank lines. Restore points are recorded by BASIC line number
/// and by label - either a label on the DATA line itself or a lone label
/// line immediately preceding it.
pub fn extract_data(source: &str) -> (String, DataSegment) {
    let mut segment = DataSegment::new();
    let mut out = String::new();
    // A label-only line is held back: it names the next DATA run if one
    // follows, otherwise it is emitted unchanged.
    let mut pending: Option<(String, String)> = None;

    for line in source.lines() {
        if let Some((number, label, data_end)) = is_data_line(line) {
            let start_index = segment.len();
            if let Some(n) = number {
                segment.add_line_restore(n, start_index);
            }
            let held = pending.take().map(|(name, _text)| {
                // The held label line is consumed; keep its slot blank.
                out.push('\n');
                name
            });
            if let Some(name) = label.or(held) {
                segment.add_label_restore(&name, start_index);
            }
            for raw in split_data_values(line, data_end) {
                segment.push(Value::parse_data(&raw));
            }
            out.push('\n');
            continue;
        }

        if let Some((_, text)) = pending.take() {
            out.push_str(&text);
            out.push('\n');
        }

        // Hold back label-only lines; they may name the next DATA run.
        let bytes = line.as_bytes();
        let mut pos = 0;
        extract_line_number(bytes, &mut pos);
        if let Some(name) = extract_label(bytes, &mut pos) {
            skip_ws(bytes, &mut pos);
            if pos >= bytes.len() {
                pending = Some((name, line.to_string()));
                continue;
            }
        }

        out.push_str(line);
        out.push('\n');
    }
    if let Some((_, text)) = pending {
        out.push_str(&text);
        out.push('\n');
    }
    (out, segment)
}

// ---------------------------------------------------------------------------
// Line-number → label rewriting
// ---------------------------------------------------------------------------

const BRANCH_KEYWORDS: [&str; 4] = ["GOTO", "GOSUB", "RESTORE", "THEN"];

/// Pass A: collect every line number used as a branch target after `GOTO`,
/// `GOSUB`, `ON … GOTO/GOSUB`, `RESTORE` and `IF … THEN <n>`.
fn collect_goto_targets(source: &str) -> BTreeSet<u32> {
    let mut targets = BTreeSet::new();
    for line in source.lines() {
        let bytes = line.as_bytes();
        let upper: Vec<u8> = bytes.iter().map(|b| b.to_ascii_uppercase()).collect();

        // Skip pure comment lines.
        let mut pos = 0;
        extract_line_number(bytes, &mut pos);
        extract_label(bytes, &mut pos);
        if is_rem_at(&upper, pos) {
            continue;
        }

        for keyword in BRANCH_KEYWORDS {
            let mut search = 0;
            while let Some(found) = find_word(&upper, keyword, search) {
                search = found + keyword.len();
                let only_first = keyword == "THEN";
                collect_numbers_after(bytes, search, only_first, &mut targets);
            }
        }
    }
    targets
}

fn find_word(upper: &[u8], word: &str, from: usize) -> Option<usize> {
    let w = word.as_bytes();
    if upper.len() < w.len() {
        return None;
    }
    for pos in from..=(upper.len() - w.len()) {
        if word_at(upper, pos, word) {
            return Some(pos);
        }
    }
    None
}

/// Collect the comma-separated numeric targets following a branch keyword.
fn collect_numbers_after(bytes: &[u8], mut pos: usize, only_first: bool, out: &mut BTreeSet<u32>) {
    loop {
        skip_ws(bytes, &mut pos);
        let start = pos;
        let mut value: u32 = 0;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            value = value.wrapping_mul(10).wrapping_add((bytes[pos] - b'0') as u32);
            pos += 1;
        }
        if pos == start {
            return;
        }
        out.insert(value);
        if only_first {
            return;
        }
        skip_ws(bytes, &mut pos);
        if pos < bytes.len() && bytes[pos] == b',' {
            pos += 1;
        } else {
            return;
        }
    }
}

/// Replace the numeric targets following a branch keyword with `L<n>` when
/// they are in the target set.
fn replace_numbers_after(line: &str, start: usize, targets: &BTreeSet<u32>, only_first: bool) -> String {
    let mut result = line.to_string();
    let mut pos = start;
    loop {
        let bytes = result.as_bytes().to_vec();
        let mut p = pos;
        skip_ws(&bytes, &mut p);
        let num_start = p;
        let mut value: u32 = 0;
        while p < bytes.len() && bytes[p].is_ascii_digit() {
            value = value.wrapping_mul(10).wrapping_add((bytes[p] - b'0') as u32);
            p += 1;
        }
        if p == num_start {
            return result;
        }
        if targets.contains(&value) {
            let label = format!("L{}", &result[num_start..p]);
            let label_len = label.len();
            result.replace_range(num_start..p, &label);
            p = num_start + label_len;
        }
        if only_first {
            return result;
        }
        let bytes = result.as_bytes();
        let mut q = p;
        skip_ws(bytes, &mut q);
        if q < bytes.len() && bytes[q] == b',' {
            pos = q + 1;
        } else {
            return result;
        }
    }
}

/// Pass B: attach `L<n>:` labels to target lines (after the line number) and
/// rewrite the numeric targets after the whitelisted keywords. Numbers
/// anywhere else are never touched.
fn convert_line_numbers_to_labels(source: &str, targets: &BTreeSet<u32>) -> String {
    let mut out = String::new();
    for line in source.lines() {
        let bytes = line.as_bytes();
        let mut pos = 0;
        let mut labeled = String::new();
        if let Some(number) = extract_line_number(bytes, &mut pos) {
            if targets.contains(&number) {
                // Keep the line number (the line mapping needs it) and
                // insert the label directly after it.
                let mut p = 0;
                skip_ws(bytes, &mut p);
                while p < bytes.len() && bytes[p].is_ascii_digit() {
                    p += 1;
                }
                labeled.push_str(&line[..p]);
                labeled.push_str(&format!(" L{}: ", number));
                labeled.push_str(line[p..].trim_start());
            } else {
                labeled.push_str(line);
            }
        } else {
            labeled.push_str(line);
        }

        // Rewrite numeric targets after each whitelisted keyword occurrence.
        let mut rewritten = labeled;
        for keyword in BRANCH_KEYWORDS {
            let mut search = 0;
            loop {
                let upper: Vec<u8> = rewritten.bytes().map(|b| b.to_ascii_uppercase()).collect();
                match find_word(&upper, keyword, search) {
                    Some(found) => {
                        search = found + keyword.len();
                        rewritten = replace_numbers_after(
                            &rewritten,
                            search,
                            targets,
                            keyword == "THEN",
                        );
                    }
                    None => break,
                }
            }
        }
        out.push_str(&rewritten);
        out.push('\n');
    }
    out
}

/// The complete two-pass line-number→label rewrite.
pub fn rewrite_line_numbers(source: &str) -> String {
    let targets = collect_goto_targets(source);
    if targets.is_empty() {
        return source.to_string();
    }
    convert_line_numbers_to_labels(source, &targets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rem_line_is_stripped_keeping_number() {
        let out = normalize_rem("1820 REM This is a comment\n20 PRINT 1\n");
        assert_eq!(out, "1820 REM\n20 PRINT 1\n");
    }

    #[test]
    fn inline_rem_after_colon() {
        let out = normalize_rem("10 PRINT 1 : REM trailing words\n");
        assert_eq!(out, "10 PRINT 1 : REM\n");
    }

    #[test]
    fn rem_inside_string_is_preserved() {
        let src = "10 PRINT \"a : REM b\"\n";
        assert_eq!(normalize_rem(src), src);
    }

    #[test]
    fn rem_is_not_matched_inside_identifiers() {
        let src = "10 REMAINDER = 4\n";
        assert_eq!(normalize_rem(src), src);
    }

    #[test]
    fn data_values_are_typed() {
        let (_, seg) = extract_data("10 DATA 1, 2.5, \"three\", four,\n");
        assert_eq!(
            seg.values(),
            &[
                Value::Int(1),
                Value::Double(2.5),
                Value::Str("three".into()),
                Value::Str("four".into()),
                Value::Str(String::new()),
            ]
        );
        assert_eq!(seg.restore_index_for_line(10), Some(0));
    }

    #[test]
    fn data_line_becomes_blank_preserving_count() {
        let (clean, _) = extract_data("10 DATA 1,2\n20 PRINT 1\n");
        assert_eq!(clean, "\n20 PRINT 1\n");
    }

    #[test]
    fn label_on_data_line_records_restore_point() {
        let (_, seg) = extract_data("10 DATA 1, 2\n20 RESET: DATA 4, 5\n");
        assert_eq!(seg.restore_index_for_label("reset"), Some(2));
        assert_eq!(seg.restore_index_for_line(20), Some(2));
    }

    #[test]
    fn pending_label_line_names_following_data() {
        let (clean, seg) = extract_data("100 TABLE:\n110 DATA 7, 8\n120 PRINT 1\n");
        assert_eq!(seg.restore_index_for_label("TABLE"), Some(0));
        assert_eq!(clean, "\n\n120 PRINT 1\n");
    }

    #[test]
    fn label_only_line_without_data_is_kept() {
        let (clean, _) = extract_data("100 TOP:\n110 PRINT 1\n");
        assert_eq!(clean, "100 TOP:\n110 PRINT 1\n");
    }

    #[test]
    fn goto_targets_get_labels_and_references_rewrite() {
        let out = rewrite_line_numbers("10 GOTO 30\n20 PRINT \"NO\"\n30 PRINT \"YES\"\n");
        assert_eq!(out, "10 GOTO L30\n20 PRINT \"NO\"\n30 L30: PRINT \"YES\"\n");
    }

    #[test]
    fn on_goto_lists_rewrite_every_target() {
        let out = rewrite_line_numbers("10 ON X GOTO 100, 200\n100 PRINT 1\n200 PRINT 2\n");
        assert!(out.contains("ON X GOTO L100, L200"));
        assert!(out.contains("100 L100: PRINT 1"));
        assert!(out.contains("200 L200: PRINT 2"));
    }

    #[test]
    fn then_rewrites_only_the_first_number() {
        let out = rewrite_line_numbers("10 IF A = 30 THEN 30\n30 PRINT 1\n");
        // The comparison literal is untouched; only the branch target moves.
        assert!(out.contains("IF A = 30 THEN L30"), "{}", out);
    }

    #[test]
    fn unrelated_numbers_are_untouched() {
        let out = rewrite_line_numbers("10 GOTO 30\n20 X = 30\n30 PRINT X\n");
        assert!(out.contains("20 X = 30"), "{}", out);
    }

    #[test]
    fn rewrite_is_idempotent() {
        let once = rewrite_line_numbers("10 GOTO 30\n30 PRINT \"YES\"\n");
        let twice = rewrite_line_numbers(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn include_directive_shapes() {
        assert_eq!(
            parse_include_directive("INCLUDE \"lib.bas\""),
            Some(("lib.bas".to_string(), false))
        );
        assert_eq!(
            parse_include_directive("10 include \"lib.bas\" once"),
            Some(("lib.bas".to_string(), true))
        );
        assert_eq!(parse_include_directive("10 PRINT \"INCLUDE\""), None);
    }
}
