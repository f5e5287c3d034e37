//! Lexer: character stream → token stream.
//!
//! Keyword matching is case-insensitive; identifiers keep a canonical
//! upper-case spelling plus their type suffix. Multi-word keywords (`END IF`,
//! `EXIT FOR`, `GO TO`, `STOP TIMER`, `LINE INPUT`) are collapsed to a single
//! token with one word of lookahead. Leading digit runs at line start are
//! line numbers and populate the line mapping as the lexer advances.
//!
//! Bad characters and unterminated strings yield lex errors with precise
//! locations; lexing continues past a failure so multiple errors are reported
//! in one run, up to a configurable cap.

use crate::diagnostics::{Diagnostic, DiagnosticKind};
use crate::token::{Keyword, LineMapping, Punct, SourceLoc, Token, TokenKind, TypeSuffix};
use basic_core::CommandRegistry;

/// Everything the lexer produces in one pass.
#[derive(Debug)]
pub struct LexOutput {
    pub tokens: Vec<Token>,
    pub mapping: LineMapping,
    pub diagnostics: Vec<Diagnostic>,
}

pub struct Lexer<'r> {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
    at_line_start: bool,
    at_statement_start: bool,
    registry: &'r CommandRegistry,
    max_errors: usize,
    tokens: Vec<Token>,
    mapping: LineMapping,
    diagnostics: Vec<Diagnostic>,
}

impl<'r> Lexer<'r> {
    pub fn new(source: &str, registry: &'r CommandRegistry, max_errors: usize) -> Self {
        Lexer {
            chars: source.chars().collect(),
            pos: 0,
            line: 0,
            column: 0,
            at_line_start: true,
            at_statement_start: true,
            registry,
            max_errors,
            tokens: Vec::new(),
            mapping: LineMapping::new(),
            diagnostics: Vec::new(),
        }
    }

    pub fn tokenize(mut self) -> LexOutput {
        self.mapping.record(0, None);
        while self.pos < self.chars.len() {
            if self.diagnostics.len() >= self.max_errors {
                break;
            }
            self.lex_one();
        }
        let loc = self.loc();
        self.push(Token::new(TokenKind::Eof, "", loc));
        LexOutput {
            tokens: self.tokens,
            mapping: self.mapping,
            diagnostics: self.diagnostics,
        }
    }

    fn loc(&self) -> SourceLoc {
        SourceLoc::new(self.line, self.column)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 0;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn push(&mut self, token: Token) {
        self.at_statement_start = matches!(
            token.kind,
            TokenKind::Eol
                | TokenKind::Punct(Punct::Colon)
                | TokenKind::Label(_)
                | TokenKind::LineNumber(_)
                | TokenKind::Keyword(Keyword::Then)
                | TokenKind::Keyword(Keyword::Else)
        );
        self.tokens.push(token);
    }

    fn error(&mut self, message: String, loc: SourceLoc) {
        self.diagnostics
            .push(Diagnostic::new(DiagnosticKind::LexError, message, loc));
    }

    fn lex_one(&mut self) {
        let c = match self.peek() {
            Some(c) => c,
            None => return,
        };

        match c {
            ' ' | '\t' | '\r' => {
                self.bump();
            }
            '\n' => {
                let loc = self.loc();
                self.bump();
                self.push(Token::new(TokenKind::Eol, "\n", loc));
                self.at_line_start = true;
                self.mapping.record(self.line, None);
            }
            '\'' => {
                // Apostrophe comment: skip to end of line.
                while let Some(c) = self.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.bump();
                }
            }
            '"' => self.lex_string(),
            '0'..='9' => self.lex_number(),
            '.' if self.peek_at(1).is_some_and(|d| d.is_ascii_digit()) => self.lex_number(),
            '&' => self.lex_radix_literal(),
            c if c.is_ascii_alphabetic() || c == '_' => self.lex_word(),
            _ => self.lex_punct(),
        }
    }

    fn lex_string(&mut self) {
        let loc = self.loc();
        self.bump(); // opening quote
        let mut value = String::new();
        loop {
            match self.peek() {
                Some('"') => {
                    self.bump();
                    break;
                }
                Some('\n') | None => {
                    self.error("Unterminated string literal".to_string(), loc);
                    break;
                }
                Some(c) => {
                    value.push(c);
                    self.bump();
                }
            }
        }
        self.at_line_start = false;
        let text = format!("\"{}\"", value);
        self.push(Token::new(TokenKind::StrLit(value), text, loc));
    }

    fn lex_number(&mut self) {
        let loc = self.loc();
        let line_start = self.at_line_start;
        self.at_line_start = false;

        let mut text = String::new();
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            text.push(self.bump().unwrap());
        }

        let mut is_real = false;
        if self.peek() == Some('.') {
            is_real = true;
            text.push(self.bump().unwrap());
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                text.push(self.bump().unwrap());
            }
        }
        if self.peek().is_some_and(|c| c == 'e' || c == 'E') {
            let next = self.peek_at(1);
            let next2 = self.peek_at(2);
            let exp_ok = next.is_some_and(|c| c.is_ascii_digit())
                || (next.is_some_and(|c| c == '+' || c == '-')
                    && next2.is_some_and(|c| c.is_ascii_digit()));
            if exp_ok {
                is_real = true;
                text.push(self.bump().unwrap());
                if self.peek().is_some_and(|c| c == '+' || c == '-') {
                    text.push(self.bump().unwrap());
                }
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    text.push(self.bump().unwrap());
                }
            }
        }

        if line_start && !is_real {
            // A leading digit run is the BASIC line number of this line.
            let number: u32 = text.parse().unwrap_or(0);
            self.mapping.record(self.line, Some(number));
            self.push(Token::new(TokenKind::LineNumber(number), text, loc));
            return;
        }

        if is_real {
            match text.parse::<f64>() {
                Ok(d) => self.push(Token::new(TokenKind::RealLit(d), text, loc)),
                Err(_) => self.error(format!("Malformed number '{}'", text), loc),
            }
        } else {
            match text.parse::<i64>() {
                Ok(n) => self.push(Token::new(TokenKind::IntLit(n), text, loc)),
                Err(_) => {
                    // Overflowing integer literals degrade to doubles.
                    match text.parse::<f64>() {
                        Ok(d) => self.push(Token::new(TokenKind::RealLit(d), text, loc)),
                        Err(_) => self.error(format!("Malformed number '{}'", text), loc),
                    }
                }
            }
        }
    }

    /// `&H` / `&O` / `&B` prefixed integer literals.
    fn lex_radix_literal(&mut self) {
        let loc = self.loc();
        self.at_line_start = false;
        self.bump(); // '&'
        let (radix, digits_ok): (u32, fn(char) -> bool) = match self.peek() {
            Some('h') | Some('H') => (16, |c| c.is_ascii_hexdigit()),
            Some('o') | Some('O') => (8, |c| ('0'..='7').contains(&c)),
            Some('b') | Some('B') => (2, |c| c == '0' || c == '1'),
            _ => {
                self.error("Expected H, O or B after '&'".to_string(), loc);
                return;
            }
        };
        self.bump();
        let mut digits = String::new();
        while self.peek().is_some_and(digits_ok) {
            digits.push(self.bump().unwrap());
        }
        if digits.is_empty() {
            self.error("Missing digits in radix literal".to_string(), loc);
            return;
        }
        match i64::from_str_radix(&digits, radix) {
            Ok(n) => {
                let text = format!("&{}", digits);
                self.push(Token::new(TokenKind::IntLit(n), text, loc));
            }
            Err(_) => self.error(format!("Radix literal '&{}' out of range", digits), loc),
        }
    }

    fn lex_word(&mut self) {
        let loc = self.loc();
        self.at_line_start = false;
        let statement_start = self.at_statement_start;

        let mut word = String::new();
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            word.push(self.bump().unwrap().to_ascii_uppercase());
        }
        let suffix = self
            .peek()
            .and_then(TypeSuffix::from_char)
            .inspect(|_| {
                self.bump();
            })
            .unwrap_or(TypeSuffix::None);

        if suffix == TypeSuffix::None {
            if let Some(keyword) = Keyword::from_upper(&word) {
                let keyword = self.combine_compound(keyword);
                if keyword == Keyword::Rem {
                    // Comment body (if any survived preprocessing) is noise.
                    self.push(Token::new(TokenKind::Keyword(Keyword::Rem), "REM", loc));
                    while self.peek().is_some_and(|c| c != '\n') {
                        self.bump();
                    }
                    return;
                }
                let text = format!("{:?}", keyword).to_uppercase();
                self.push(Token::new(TokenKind::Keyword(keyword), text, loc));
                return;
            }
        }

        // A plain identifier directly followed by ':' at statement start is
        // a label definition.
        if statement_start
            && suffix == TypeSuffix::None
            && self.peek() == Some(':')
            && !self.registry.is_registered(&word)
        {
            self.bump();
            let text = format!("{}:", word);
            self.push(Token::new(TokenKind::Label(word), text, loc));
            return;
        }

        let with_suffix = match suffix.as_char() {
            Some(c) => format!("{}{}", word, c),
            None => word.clone(),
        };
        let kind = if self.registry.is_registered(&with_suffix) {
            TokenKind::Command(with_suffix.clone())
        } else {
            TokenKind::Identifier
        };
        let mut token = Token::new(kind, with_suffix, loc);
        token.suffix = suffix;
        self.push(token);
    }

    /// One word of lookahead for compound keywords.
    fn combine_compound(&mut self, first: Keyword) -> Keyword {
        let follow = |lexer: &Self| -> Option<(String, usize)> {
            let mut p = lexer.pos;
            while lexer.chars.get(p).is_some_and(|c| *c == ' ' || *c == '\t') {
                p += 1;
            }
            let start = p;
            let mut word = String::new();
            while lexer
                .chars
                .get(p)
                .is_some_and(|c| c.is_ascii_alphanumeric() || *c == '_')
            {
                word.push(lexer.chars[p].to_ascii_uppercase());
                p += 1;
            }
            // A type suffix means this is an identifier, never a keyword.
            if lexer.chars.get(p).is_some_and(|c| TypeSuffix::from_char(*c).is_some()) {
                return None;
            }
            if word.is_empty() { None } else { Some((word, p - lexer.pos)) }
        };

        let combined = |word: &str| -> Option<Keyword> {
            Some(match (first, word) {
                (Keyword::End, "IF") => Keyword::EndIf,
                (Keyword::End, "SUB") => Keyword::EndSub,
                (Keyword::End, "FUNCTION") => Keyword::EndFunction,
                (Keyword::End, "SELECT") => Keyword::EndSelect,
                (Keyword::Exit, "FOR") => Keyword::ExitFor,
                (Keyword::Exit, "WHILE") => Keyword::ExitWhile,
                (Keyword::Exit, "DO") => Keyword::ExitDo,
                (Keyword::Exit, "SUB") => Keyword::ExitSub,
                (Keyword::Exit, "FUNCTION") => Keyword::ExitFunction,
                (Keyword::Go, "TO") => Keyword::Goto,
                (Keyword::Stop, "TIMER") => Keyword::StopTimer,
                (Keyword::Line, "INPUT") => Keyword::LineInput,
                (Keyword::Else, "IF") => Keyword::ElseIf,
                _ => return None,
            })
        };

        if let Some((word, advance)) = follow(self)
            && let Some(keyword) = combined(&word)
        {
            for _ in 0..advance {
                self.bump();
            }
            return keyword;
        }
        first
    }

    fn lex_punct(&mut self) {
        let loc = self.loc();
        self.at_line_start = false;
        let c = self.bump().unwrap();
        let punct = match c {
            '+' => Punct::Plus,
            '-' => Punct::Minus,
            '*' => Punct::Star,
            '/' => Punct::Slash,
            '\\' => Punct::Backslash,
            '^' => Punct::Caret,
            '=' => Punct::Eq,
            '(' => Punct::LParen,
            ')' => Punct::RParen,
            ',' => Punct::Comma,
            ';' => Punct::Semicolon,
            ':' => Punct::Colon,
            '#' => Punct::Hash,
            '<' => match self.peek() {
                Some('>') => {
                    self.bump();
                    Punct::Ne
                }
                Some('=') => {
                    self.bump();
                    Punct::Le
                }
                _ => Punct::Lt,
            },
            '>' => match self.peek() {
                Some('=') => {
                    self.bump();
                    Punct::Ge
                }
                _ => Punct::Gt,
            },
            other => {
                self.error(format!("Unexpected character '{}'", other), loc);
                return;
            }
        };
        let text = punct.as_str().to_string();
        self.push(Token::new(TokenKind::Punct(punct), text, loc));
    }
}

/// Convenience wrapper used by the pipeline.
pub fn tokenize(source: &str, registry: &CommandRegistry, max_errors: usize) -> LexOutput {
    Lexer::new(source, registry, max_errors).tokenize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use basic_core::builtins;

    fn registry() -> CommandRegistry {
        let mut reg = CommandRegistry::new();
        builtins::register_core_functions(&mut reg).unwrap();
        builtins::register_core_commands(&mut reg).unwrap();
        reg
    }

    fn kinds(source: &str) -> Vec<TokenKind> {
        let reg = registry();
        tokenize(source, &reg, 50)
            .tokens
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn line_numbers_only_at_line_start() {
        let toks = kinds("10 PRINT 10\n");
        assert_eq!(toks[0], TokenKind::LineNumber(10));
        assert_eq!(toks[1], TokenKind::Keyword(Keyword::Print));
        assert_eq!(toks[2], TokenKind::IntLit(10));
    }

    #[test]
    fn keywords_are_case_insensitive() {
        let toks = kinds("10 print \"x\"\n");
        assert_eq!(toks[1], TokenKind::Keyword(Keyword::Print));
    }

    #[test]
    fn compound_keywords_collapse() {
        let toks = kinds("END IF\nEXIT FOR\nGO TO 10\nSTOP TIMER ALL\n");
        assert_eq!(toks[0], TokenKind::Keyword(Keyword::EndIf));
        assert_eq!(toks[2], TokenKind::Keyword(Keyword::ExitFor));
        assert_eq!(toks[4], TokenKind::Keyword(Keyword::Goto));
        assert_eq!(toks[7], TokenKind::Keyword(Keyword::StopTimer));
        assert_eq!(toks[8], TokenKind::Keyword(Keyword::All));
    }

    #[test]
    fn type_suffix_is_part_of_identity() {
        let reg = registry();
        let out = tokenize("A$ = A% + A\n", &reg, 50);
        assert_eq!(out.tokens[0].text, "A$");
        assert_eq!(out.tokens[0].suffix, TypeSuffix::Str);
        assert_eq!(out.tokens[2].text, "A%");
        assert_eq!(out.tokens[2].suffix, TypeSuffix::Int);
        assert_eq!(out.tokens[4].text, "A");
        assert_eq!(out.tokens[4].suffix, TypeSuffix::None);
    }

    #[test]
    fn registered_names_tokenize_as_commands() {
        let toks = kinds("CLS\nX = ABS(1)\n");
        assert_eq!(toks[0], TokenKind::Command("CLS".into()));
        assert!(toks.contains(&TokenKind::Command("ABS".into())));
    }

    #[test]
    fn labels_at_statement_start() {
        let toks = kinds("30 L30: PRINT \"YES\"\n");
        assert_eq!(toks[0], TokenKind::LineNumber(30));
        assert_eq!(toks[1], TokenKind::Label("L30".into()));
    }

    #[test]
    fn numeric_literal_shapes() {
        let toks = kinds("X = 1.5 + 2e3 + &HFF + &B101\n");
        assert!(toks.contains(&TokenKind::RealLit(1.5)));
        assert!(toks.contains(&TokenKind::RealLit(2000.0)));
        assert!(toks.contains(&TokenKind::IntLit(255)));
        assert!(toks.contains(&TokenKind::IntLit(5)));
    }

    #[test]
    fn unterminated_string_reports_and_continues() {
        let reg = registry();
        let out = tokenize("10 PRINT \"oops\n20 PRINT \"ok\"\n", &reg, 50);
        assert_eq!(out.diagnostics.len(), 1);
        assert!(out.diagnostics[0].message.contains("Unterminated"));
        // Lexing continued onto line 2.
        assert!(out.tokens.iter().any(|t| t.kind == TokenKind::LineNumber(20)));
    }

    #[test]
    fn line_mapping_is_populated() {
        let reg = registry();
        let out = tokenize("10 PRINT 1\nPRINT 2\n30 PRINT 3\n", &reg, 50);
        assert_eq!(out.mapping.basic_line(0), Some(10));
        assert_eq!(out.mapping.basic_line(1), None);
        assert_eq!(out.mapping.basic_line(2), Some(30));
    }

    #[test]
    fn rem_swallows_rest_of_line() {
        let toks = kinds("10 REM anything at all\n20 PRINT 1\n");
        assert_eq!(toks[1], TokenKind::Keyword(Keyword::Rem));
        assert_eq!(toks[2], TokenKind::Eol);
        assert_eq!(toks[3], TokenKind::LineNumber(20));
    }
}
