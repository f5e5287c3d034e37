//! Recursive-descent parser with precedence climbing.
//!
//! Consumes the token stream, the constants store and the command registry,
//! and produces the AST plus the `OPTION` directives found along the way.
//! Parse errors are collected (recovering to the next `:` or end of line) and
//! the best-effort AST is always returned; the caller checks the diagnostic
//! list to decide whether to continue.

use crate::ast::*;
use crate::config::{CompilerOptions, LogicMode};
use crate::diagnostics::{Diagnostic, DiagnosticKind};
use crate::token::{Keyword, LineMapping, Punct, SourceLoc, Token, TokenKind, TypeSuffix};
use basic_core::{CommandRegistry, ConstantsStore};

/// Everything the parser produces in one pass.
#[derive(Debug)]
pub struct ParseOutput {
    pub program: Program,
    pub options: CompilerOptions,
    pub diagnostics: Vec<Diagnostic>,
}

pub struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    mapping: &'a LineMapping,
    constants: &'a mut ConstantsStore,
    registry: &'a CommandRegistry,
    options: CompilerOptions,
    diagnostics: Vec<Diagnostic>,
    max_errors: usize,
}

impl<'a> Parser<'a> {
    pub fn new(
        tokens: Vec<Token>,
        mapping: &'a LineMapping,
        constants: &'a mut ConstantsStore,
        registry: &'a CommandRegistry,
        max_errors: usize,
    ) -> Self {
        Parser {
            tokens,
            pos: 0,
            mapping,
            constants,
            registry,
            options: CompilerOptions::default(),
            diagnostics: Vec::new(),
            max_errors,
        }
    }

    pub fn parse(mut self) -> ParseOutput {
        let mut program = Program::new();
        while !self.at_eof() && self.diagnostics.len() < self.max_errors {
            self.skip_eols();
            if self.at_eof() {
                break;
            }
            let loc = self.peek().loc;
            let basic_line = self.take_line_number();
            let mut statements = Vec::new();
            self.parse_statement_list(&mut statements, &[]);
            program.lines.push(ProgramLine {
                basic_line,
                statements,
                loc,
            });
        }
        ParseOutput {
            program,
            options: self.options,
            diagnostics: self.diagnostics,
        }
    }

    // -- token plumbing ----------------------------------------------------

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek_kind(), TokenKind::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn check_keyword(&self, kw: Keyword) -> bool {
        self.peek().is_keyword(kw)
    }

    fn check_punct(&self, p: Punct) -> bool {
        self.peek().is_punct(p)
    }

    fn consume_keyword(&mut self, kw: Keyword) -> bool {
        if self.check_keyword(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume_punct(&mut self, p: Punct) -> bool {
        if self.check_punct(p) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn basic_line_at(&self, loc: SourceLoc) -> Option<u32> {
        self.mapping.basic_line(loc.line)
    }

    fn error_at(&mut self, loc: SourceLoc, message: String) {
        let basic_line = self.basic_line_at(loc);
        self.diagnostics.push(
            Diagnostic::new(DiagnosticKind::SyntaxError, message, loc).with_basic_line(basic_line),
        );
    }

    fn error_here(&mut self, message: String) {
        let loc = self.peek().loc;
        self.error_at(loc, message);
    }

    fn expect_punct(&mut self, p: Punct) -> bool {
        if self.consume_punct(p) {
            true
        } else {
            let found = self.peek().text.clone();
            self.error_here(format!("Expected '{}', found '{}'", p.as_str(), found));
            false
        }
    }

    fn expect_keyword(&mut self, kw: Keyword, what: &str) -> bool {
        if self.consume_keyword(kw) {
            true
        } else {
            let found = self.peek().text.clone();
            self.error_here(format!("Expected {}, found '{}'", what, found));
            false
        }
    }

    /// Skip to the next statement separator or line boundary.
    fn recover(&mut self) {
        while !self.at_eof() {
            if self.peek().ends_statement() {
                return;
            }
            self.advance();
        }
    }

    fn skip_eols(&mut self) {
        while matches!(self.peek_kind(), TokenKind::Eol) {
            self.advance();
        }
    }

    fn take_line_number(&mut self) -> Option<u32> {
        if let TokenKind::LineNumber(n) = *self.peek_kind() {
            self.advance();
            Some(n)
        } else {
            None
        }
    }

    // -- statement sequencing ----------------------------------------------

    /// True when the current token opens one of the given block terminators.
    fn at_terminator(&self, terminators: &[Keyword]) -> bool {
        terminators.iter().any(|kw| self.check_keyword(*kw))
    }

    /// Parse statements until end of line (when `terminators` is empty) or
    /// until one of the terminator keywords is reached (not consumed). Line
    /// numbers and labels inside the region are handled along the way.
    fn parse_statement_list(&mut self, out: &mut Vec<Statement>, terminators: &[Keyword]) {
        loop {
            if self.at_eof() || self.diagnostics.len() >= self.max_errors {
                return;
            }
            if matches!(self.peek_kind(), TokenKind::Eol) {
                if terminators.is_empty() {
                    return;
                }
                self.advance();
                self.take_line_number();
                continue;
            }
            if self.consume_punct(Punct::Colon) {
                continue;
            }
            if self.at_terminator(terminators) {
                return;
            }
            if let TokenKind::Label(name) = self.peek_kind().clone() {
                let loc = self.peek().loc;
                self.advance();
                out.push(self.make_stmt(StmtKind::Label(name), loc));
                continue;
            }
            match self.parse_statement() {
                Some(stmt) => out.push(stmt),
                None => self.recover(),
            }
        }
    }

    fn make_stmt(&self, kind: StmtKind, loc: SourceLoc) -> Statement {
        Statement::new(kind, loc, self.basic_line_at(loc))
    }

    // -- statements --------------------------------------------------------

    fn parse_statement(&mut self) -> Option<Statement> {
        let loc = self.peek().loc;
        let kind = match self.peek_kind().clone() {
            TokenKind::Keyword(kw) => self.parse_keyword_statement(kw, loc)?,
            TokenKind::Command(name) => {
                self.advance();
                self.parse_command_statement(&name)?
            }
            TokenKind::Identifier => self.parse_identifier_statement()?,
            other => {
                self.error_here(format!("Unexpected token '{}'", self.peek().text));
                let _ = other;
                return None;
            }
        };
        Some(self.make_stmt(kind, loc))
    }

    fn parse_keyword_statement(&mut self, kw: Keyword, loc: SourceLoc) -> Option<StmtKind> {
        match kw {
            Keyword::Let => {
                self.advance();
                self.parse_assignment()
            }
            Keyword::Print => {
                self.advance();
                self.parse_print()
            }
            Keyword::Input => {
                self.advance();
                self.parse_input()
            }
            Keyword::LineInput => {
                self.advance();
                self.parse_line_input()
            }
            Keyword::If => {
                self.advance();
                self.parse_if()
            }
            Keyword::Select => {
                self.advance();
                self.parse_select()
            }
            Keyword::For => {
                self.advance();
                self.parse_for()
            }
            Keyword::While => {
                self.advance();
                let cond = self.parse_expr()?;
                let mut body = Vec::new();
                self.parse_statement_list(&mut body, &[Keyword::Wend]);
                self.expect_keyword(Keyword::Wend, "WEND");
                Some(StmtKind::While { cond, body })
            }
            Keyword::Repeat => {
                self.advance();
                let mut body = Vec::new();
                self.parse_statement_list(&mut body, &[Keyword::Until]);
                self.expect_keyword(Keyword::Until, "UNTIL");
                let until = self.parse_expr()?;
                Some(StmtKind::Repeat { body, until })
            }
            Keyword::Do => {
                self.advance();
                self.parse_do()
            }
            Keyword::Goto => {
                self.advance();
                let target = self.parse_branch_target()?;
                Some(StmtKind::Goto(target))
            }
            Keyword::Gosub => {
                self.advance();
                let target = self.parse_branch_target()?;
                Some(StmtKind::Gosub(target))
            }
            Keyword::Return => {
                self.advance();
                Some(StmtKind::Return)
            }
            Keyword::On => {
                self.advance();
                self.parse_on_goto()
            }
            Keyword::Read => {
                self.advance();
                let mut targets = vec![self.parse_lvalue()?];
                while self.consume_punct(Punct::Comma) {
                    targets.push(self.parse_lvalue()?);
                }
                Some(StmtKind::Read(targets))
            }
            Keyword::Restore => {
                self.advance();
                self.parse_restore()
            }
            Keyword::Dim => {
                self.advance();
                let decls = self.parse_array_decls()?;
                Some(StmtKind::Dim(decls))
            }
            Keyword::Redim => {
                self.advance();
                let preserve = self.consume_keyword(Keyword::Preserve);
                let decls = self.parse_array_decls()?;
                Some(StmtKind::Redim { preserve, decls })
            }
            Keyword::Erase => {
                self.advance();
                let mut vars = vec![self.parse_var_ref()?];
                while self.consume_punct(Punct::Comma) {
                    vars.push(self.parse_var_ref()?);
                }
                Some(StmtKind::Erase(vars))
            }
            Keyword::Const => {
                self.advance();
                self.parse_const()
            }
            Keyword::Def => {
                self.advance();
                self.parse_def_fn()
            }
            Keyword::Sub => {
                self.advance();
                self.parse_sub()
            }
            Keyword::Function => {
                self.advance();
                self.parse_function()
            }
            Keyword::Call => {
                self.advance();
                let name = self.parse_name("sub name")?;
                let args = if self.consume_punct(Punct::LParen) {
                    let args = self.parse_expr_list(Punct::RParen)?;
                    self.expect_punct(Punct::RParen);
                    args
                } else {
                    Vec::new()
                };
                Some(StmtKind::CallSub { name, args })
            }
            Keyword::ExitFor => {
                self.advance();
                Some(StmtKind::Exit(ExitKind::For))
            }
            Keyword::ExitWhile => {
                self.advance();
                Some(StmtKind::Exit(ExitKind::While))
            }
            Keyword::ExitDo => {
                self.advance();
                Some(StmtKind::Exit(ExitKind::Do))
            }
            Keyword::ExitSub => {
                self.advance();
                Some(StmtKind::Exit(ExitKind::Sub))
            }
            Keyword::ExitFunction => {
                self.advance();
                Some(StmtKind::Exit(ExitKind::Function))
            }
            Keyword::Open => {
                self.advance();
                self.parse_open()
            }
            Keyword::Close => {
                self.advance();
                let number = if self.peek().ends_statement() {
                    None
                } else {
                    self.consume_punct(Punct::Hash);
                    Some(self.parse_expr()?)
                };
                Some(StmtKind::Close { number })
            }
            Keyword::Write => {
                self.advance();
                self.expect_punct(Punct::Hash);
                let channel = self.parse_expr()?;
                self.expect_punct(Punct::Comma);
                let items = self.parse_expr_list_to_end()?;
                Some(StmtKind::Write { channel, items })
            }
            Keyword::After => {
                self.advance();
                self.parse_timer(false)
            }
            Keyword::Every => {
                self.advance();
                self.parse_timer(true)
            }
            Keyword::StopTimer => {
                self.advance();
                self.parse_stop_timer()
            }
            Keyword::Option => {
                self.advance();
                self.parse_option()
            }
            Keyword::Rem => {
                self.advance();
                Some(StmtKind::Rem)
            }
            Keyword::End | Keyword::Stop => {
                self.advance();
                Some(StmtKind::End)
            }
            Keyword::Data => {
                self.error_here(
                    "DATA must appear as the only statement on its line".to_string(),
                );
                None
            }
            other => {
                self.error_at(loc, format!("Unexpected keyword '{:?}'", other));
                None
            }
        }
    }

    /// `name = expr` or `name(indices) = expr`, with `name` already current.
    fn parse_assignment(&mut self) -> Option<StmtKind> {
        let target = self.parse_lvalue()?;
        self.expect_punct(Punct::Eq);
        let value = self.parse_expr()?;
        Some(StmtKind::Assign { target, value })
    }

    fn parse_identifier_statement(&mut self) -> Option<StmtKind> {
        let var = self.parse_var_ref()?;

        if self.check_punct(Punct::Eq) {
            self.advance();
            let value = self.parse_expr()?;
            return Some(StmtKind::Assign {
                target: LValue::Var(var),
                value,
            });
        }

        if self.check_punct(Punct::LParen) {
            self.advance();
            let args = self.parse_expr_list(Punct::RParen)?;
            self.expect_punct(Punct::RParen);
            if self.consume_punct(Punct::Eq) {
                let value = self.parse_expr()?;
                return Some(StmtKind::Assign {
                    target: LValue::Array(var, args),
                    value,
                });
            }
            // A call with parenthesized arguments.
            return Some(StmtKind::CallSub {
                name: var.key(),
                args,
            });
        }

        if self.peek().ends_statement() || self.check_keyword(Keyword::Else) {
            // Bare identifier: sub call or (post-rewrite) a GOTO target.
            return Some(StmtKind::ImplicitCall(var.key()));
        }

        // `MYSUB 1, 2` - call with unparenthesized arguments.
        let args = self.parse_expr_list_to_end()?;
        Some(StmtKind::CallSub {
            name: var.key(),
            args,
        })
    }

    fn parse_command_statement(&mut self, name: &str) -> Option<StmtKind> {
        if self.registry.command(name).is_none() {
            self.error_here(format!("'{}' is a function, not a command", name));
            return None;
        }
        let parenthesized = self.consume_punct(Punct::LParen);
        let args = if parenthesized {
            let args = self.parse_expr_list(Punct::RParen)?;
            self.expect_punct(Punct::RParen);
            args
        } else if self.peek().ends_statement() || self.check_keyword(Keyword::Else) {
            Vec::new()
        } else {
            self.parse_expr_list_to_end()?
        };
        Some(StmtKind::Command {
            name: name.to_string(),
            args,
        })
    }

    fn parse_print(&mut self) -> Option<StmtKind> {
        let channel = if self.consume_punct(Punct::Hash) {
            let ch = self.parse_expr()?;
            self.expect_punct(Punct::Comma);
            Some(ch)
        } else {
            None
        };

        let mut items = Vec::new();
        while !self.peek().ends_statement() && !self.check_keyword(Keyword::Else) {
            let expr = self.parse_expr()?;
            let sep = if self.consume_punct(Punct::Semicolon) {
                Some(PrintSep::Semicolon)
            } else if self.consume_punct(Punct::Comma) {
                Some(PrintSep::Comma)
            } else {
                None
            };
            let done = sep.is_none();
            items.push(PrintItem { expr, sep });
            if done {
                break;
            }
            // A trailing separator with nothing after it suppresses the
            // newline; the loop exits on the statement end.
        }
        Some(StmtKind::Print { channel, items })
    }

    fn parse_input(&mut self) -> Option<StmtKind> {
        let channel = if self.consume_punct(Punct::Hash) {
            let ch = self.parse_expr()?;
            self.expect_punct(Punct::Comma);
            Some(ch)
        } else {
            None
        };

        let mut prompt = None;
        if channel.is_none()
            && let TokenKind::StrLit(text) = self.peek_kind().clone()
        {
            // `INPUT "prompt"; A` / `INPUT "prompt", A`
            let next = self.tokens.get(self.pos + 1);
            let is_prompt = next.is_some_and(|t| {
                t.is_punct(Punct::Semicolon) || t.is_punct(Punct::Comma)
            });
            if is_prompt {
                self.advance();
                self.advance();
                prompt = Some(text);
            }
        }

        let mut targets = vec![self.parse_lvalue()?];
        while self.consume_punct(Punct::Comma) {
            targets.push(self.parse_lvalue()?);
        }
        Some(StmtKind::Input {
            prompt,
            channel,
            targets,
        })
    }

    fn parse_line_input(&mut self) -> Option<StmtKind> {
        let channel = if self.consume_punct(Punct::Hash) {
            let ch = self.parse_expr()?;
            self.expect_punct(Punct::Comma);
            Some(ch)
        } else {
            None
        };
        let target = self.parse_lvalue()?;
        Some(StmtKind::LineInput { channel, target })
    }

    fn parse_if(&mut self) -> Option<StmtKind> {
        let cond = self.parse_expr()?;
        self.expect_keyword(Keyword::Then, "THEN");

        if matches!(self.peek_kind(), TokenKind::Eol) {
            return self.parse_if_block(cond);
        }

        // Single-line form: `IF e THEN stmts [ELSE stmts]`.
        let then_body = self.parse_inline_arm()?;
        let else_body = if self.consume_keyword(Keyword::Else) {
            Some(self.parse_inline_arm()?)
        } else {
            None
        };
        Some(StmtKind::If {
            arms: vec![(cond, then_body)],
            else_body,
        })
    }

    /// The statements of one arm of a single-line IF. A bare line number
    /// target (`THEN 30` / `ELSE 30`) becomes a GOTO to the rewritten label.
    fn parse_inline_arm(&mut self) -> Option<Vec<Statement>> {
        let loc = self.peek().loc;
        if let TokenKind::IntLit(n) = *self.peek_kind() {
            self.advance();
            return Some(vec![self.make_stmt(StmtKind::Goto(format!("L{}", n)), loc)]);
        }
        let mut body = Vec::new();
        loop {
            if self.peek().ends_statement() || self.check_keyword(Keyword::Else) {
                break;
            }
            match self.parse_statement() {
                Some(stmt) => body.push(stmt),
                None => {
                    self.recover();
                    break;
                }
            }
            if !self.consume_punct(Punct::Colon) {
                break;
            }
        }
        Some(body)
    }

    /// Multi-line `IF … THEN / ELSEIF / ELSE / ENDIF`.
    fn parse_if_block(&mut self, first_cond: Expr) -> Option<StmtKind> {
        const ENDS: [Keyword; 3] = [Keyword::ElseIf, Keyword::Else, Keyword::EndIf];
        let mut arms = Vec::new();
        let mut body = Vec::new();
        self.parse_statement_list(&mut body, &ENDS);
        arms.push((first_cond, body));

        let mut else_body = None;
        loop {
            if self.consume_keyword(Keyword::ElseIf) {
                let cond = self.parse_expr()?;
                self.expect_keyword(Keyword::Then, "THEN");
                let mut body = Vec::new();
                self.parse_statement_list(&mut body, &ENDS);
                arms.push((cond, body));
            } else if self.consume_keyword(Keyword::Else) {
                let mut body = Vec::new();
                self.parse_statement_list(&mut body, &[Keyword::EndIf]);
                else_body = Some(body);
            } else {
                break;
            }
        }
        self.expect_keyword(Keyword::EndIf, "ENDIF");
        Some(StmtKind::If { arms, else_body })
    }

    fn parse_select(&mut self) -> Option<StmtKind> {
        self.expect_keyword(Keyword::Case, "CASE after SELECT");
        let selector = self.parse_expr()?;
        const ENDS: [Keyword; 2] = [Keyword::Case, Keyword::EndSelect];

        // Statements before the first CASE are not allowed; skip blank lines.
        self.skip_eols();

        let mut arms = Vec::new();
        let mut else_body = None;
        while self.consume_keyword(Keyword::Case) {
            let arm_loc = self.peek().loc;
            if self.consume_keyword(Keyword::Else) {
                let mut body = Vec::new();
                self.parse_statement_list(&mut body, &ENDS);
                else_body = Some(body);
                continue;
            }
            let mut tests = vec![self.parse_case_test()?];
            while self.consume_punct(Punct::Comma) {
                tests.push(self.parse_case_test()?);
            }
            let mut body = Vec::new();
            self.parse_statement_list(&mut body, &ENDS);
            arms.push(CaseArm {
                tests,
                body,
                loc: arm_loc,
            });
        }
        self.expect_keyword(Keyword::EndSelect, "ENDSELECT");
        Some(StmtKind::Select {
            selector,
            arms,
            else_body,
        })
    }

    fn parse_case_test(&mut self) -> Option<CaseTest> {
        if self.consume_keyword(Keyword::Is) {
            let op = match self.peek_kind() {
                TokenKind::Punct(Punct::Eq) => BinOp::Eq,
                TokenKind::Punct(Punct::Ne) => BinOp::Ne,
                TokenKind::Punct(Punct::Lt) => BinOp::Lt,
                TokenKind::Punct(Punct::Le) => BinOp::Le,
                TokenKind::Punct(Punct::Gt) => BinOp::Gt,
                TokenKind::Punct(Punct::Ge) => BinOp::Ge,
                _ => {
                    self.error_here("Expected a comparison operator after IS".to_string());
                    return None;
                }
            };
            self.advance();
            let value = self.parse_expr()?;
            Some(CaseTest::Is(op, value))
        } else {
            let value = self.parse_expr()?;
            Some(CaseTest::Value(value))
        }
    }

    fn parse_for(&mut self) -> Option<StmtKind> {
        let var = self.parse_var_ref()?;
        self.expect_punct(Punct::Eq);
        let from = self.parse_expr()?;
        self.expect_keyword(Keyword::To, "TO");
        let to = self.parse_expr()?;
        let step = if self.consume_keyword(Keyword::Step) {
            Some(self.parse_expr()?)
        } else {
            None
        };

        let mut body = Vec::new();
        self.parse_statement_list(&mut body, &[Keyword::Next]);
        self.expect_keyword(Keyword::Next, "NEXT");
        if matches!(self.peek_kind(), TokenKind::Identifier) {
            let next_var = self.parse_var_ref()?;
            if next_var.key() != var.key() {
                self.error_at(
                    next_var.loc,
                    format!(
                        "NEXT {} does not match the innermost FOR {}",
                        next_var.key(),
                        var.key()
                    ),
                );
            }
        }
        Some(StmtKind::For {
            var,
            from,
            to,
            step,
            body,
        })
    }

    fn parse_do(&mut self) -> Option<StmtKind> {
        let pre = if self.consume_keyword(Keyword::While) {
            Some((DoCond::While, self.parse_expr()?))
        } else if self.consume_keyword(Keyword::Until) {
            Some((DoCond::Until, self.parse_expr()?))
        } else {
            None
        };

        let mut body = Vec::new();
        self.parse_statement_list(&mut body, &[Keyword::Loop]);
        self.expect_keyword(Keyword::Loop, "LOOP");

        let post = if self.consume_keyword(Keyword::While) {
            Some((DoCond::While, self.parse_expr()?))
        } else if self.consume_keyword(Keyword::Until) {
            Some((DoCond::Until, self.parse_expr()?))
        } else {
            None
        };

        if pre.is_some() && post.is_some() {
            self.error_here("DO/LOOP cannot test a condition at both ends".to_string());
            return None;
        }
        Some(StmtKind::DoLoop { pre, post, body })
    }

    /// A branch target: a label name or a raw line number (pre-rewrite
    /// sources), which maps onto the preprocessor's `L<n>` spelling.
    fn parse_branch_target(&mut self) -> Option<String> {
        match self.peek_kind().clone() {
            TokenKind::Identifier => {
                let token = self.advance();
                Some(token.text)
            }
            TokenKind::IntLit(n) => {
                self.advance();
                Some(format!("L{}", n))
            }
            TokenKind::LineNumber(n) => {
                self.advance();
                Some(format!("L{}", n))
            }
            _ => {
                self.error_here(format!(
                    "Expected a label or line number, found '{}'",
                    self.peek().text
                ));
                None
            }
        }
    }

    fn parse_on_goto(&mut self) -> Option<StmtKind> {
        let selector = self.parse_expr()?;
        let gosub = if self.consume_keyword(Keyword::Goto) {
            false
        } else if self.consume_keyword(Keyword::Gosub) {
            true
        } else {
            self.error_here("Expected GOTO or GOSUB after ON <expr>".to_string());
            return None;
        };
        let mut targets = vec![self.parse_branch_target()?];
        while self.consume_punct(Punct::Comma) {
            targets.push(self.parse_branch_target()?);
        }
        Some(StmtKind::OnGoto {
            selector,
            targets,
            gosub,
        })
    }

    fn parse_restore(&mut self) -> Option<StmtKind> {
        let target = match self.peek_kind().clone() {
            TokenKind::Eol | TokenKind::Eof | TokenKind::Punct(Punct::Colon) => {
                RestoreTarget::Start
            }
            TokenKind::IntLit(n) => {
                self.advance();
                RestoreTarget::Line(n as u32)
            }
            TokenKind::Identifier => {
                let token = self.advance();
                RestoreTarget::Label(token.text)
            }
            _ => {
                self.error_here(format!(
                    "Expected a line number or label after RESTORE, found '{}'",
                    self.peek().text
                ));
                return None;
            }
        };
        Some(StmtKind::Restore(target))
    }

    fn parse_array_decls(&mut self) -> Option<Vec<ArrayDecl>> {
        let mut decls = Vec::new();
        loop {
            let var = self.parse_var_ref()?;
            self.expect_punct(Punct::LParen);
            let dims = self.parse_expr_list(Punct::RParen)?;
            self.expect_punct(Punct::RParen);
            if dims.is_empty() {
                self.error_at(var.loc, format!("Array {} needs at least one bound", var.key()));
                return None;
            }
            decls.push(ArrayDecl { var, dims });
            if !self.consume_punct(Punct::Comma) {
                break;
            }
        }
        Some(decls)
    }

    fn parse_def_fn(&mut self) -> Option<StmtKind> {
        let name = self.parse_var_ref()?;
        let mut params = Vec::new();
        if self.consume_punct(Punct::LParen) {
            if !self.check_punct(Punct::RParen) {
                params.push(self.parse_var_ref()?);
                while self.consume_punct(Punct::Comma) {
                    params.push(self.parse_var_ref()?);
                }
            }
            self.expect_punct(Punct::RParen);
        }
        self.expect_punct(Punct::Eq);
        let body = self.parse_expr()?;
        Some(StmtKind::DefFn { name, params, body })
    }

    fn parse_params(&mut self) -> Option<Vec<VarRef>> {
        let mut params = Vec::new();
        if self.consume_punct(Punct::LParen) {
            if !self.check_punct(Punct::RParen) {
                params.push(self.parse_var_ref()?);
                while self.consume_punct(Punct::Comma) {
                    params.push(self.parse_var_ref()?);
                }
            }
            self.expect_punct(Punct::RParen);
        }
        Some(params)
    }

    fn parse_sub(&mut self) -> Option<StmtKind> {
        let name = self.parse_name("sub name")?;
        let params = self.parse_params()?;
        let mut body = Vec::new();
        self.parse_statement_list(&mut body, &[Keyword::EndSub]);
        self.expect_keyword(Keyword::EndSub, "ENDSUB");
        Some(StmtKind::Sub { name, params, body })
    }

    fn parse_function(&mut self) -> Option<StmtKind> {
        let name = self.parse_var_ref()?;
        let params = self.parse_params()?;
        let mut body = Vec::new();
        self.parse_statement_list(&mut body, &[Keyword::EndFunction]);
        self.expect_keyword(Keyword::EndFunction, "ENDFUNCTION");
        Some(StmtKind::Function { name, params, body })
    }

    fn parse_open(&mut self) -> Option<StmtKind> {
        let path = self.parse_expr()?;
        self.expect_keyword(Keyword::For, "FOR");
        let mode = if self.consume_keyword(Keyword::Input) {
            FileMode::Input
        } else if self.consume_keyword(Keyword::Output) {
            FileMode::Output
        } else if self.consume_keyword(Keyword::Append) {
            FileMode::Append
        } else if self.consume_keyword(Keyword::Random) {
            FileMode::Random
        } else {
            self.error_here("Expected INPUT, OUTPUT, APPEND or RANDOM".to_string());
            return None;
        };
        self.expect_keyword(Keyword::As, "AS");
        self.consume_punct(Punct::Hash);
        let number = self.parse_expr()?;
        Some(StmtKind::Open { path, mode, number })
    }

    fn parse_timer(&mut self, every: bool) -> Option<StmtKind> {
        let amount = self.parse_expr()?;
        let unit = if self.consume_keyword(Keyword::Ms) {
            TimeUnit::Ms
        } else if self.consume_keyword(Keyword::Secs) {
            TimeUnit::Secs
        } else if self.consume_keyword(Keyword::Frames) {
            TimeUnit::Frames
        } else {
            self.error_here("Expected MS, SECS or FRAMES".to_string());
            return None;
        };
        let handler = self.parse_name("timer handler sub name")?;
        Some(StmtKind::Timer {
            every,
            amount,
            unit,
            handler,
        })
    }

    fn parse_stop_timer(&mut self) -> Option<StmtKind> {
        if self.consume_keyword(Keyword::All) {
            return Some(StmtKind::StopTimer(StopTimerTarget::All));
        }
        if matches!(self.peek_kind(), TokenKind::Identifier)
            && self.peek().suffix == TypeSuffix::None
        {
            let token = self.advance();
            return Some(StmtKind::StopTimer(StopTimerTarget::Handler(token.text)));
        }
        let id = self.parse_expr()?;
        Some(StmtKind::StopTimer(StopTimerTarget::Id(id)))
    }

    /// `CONST name = literal`. Constants are resolved while parsing, so the
    /// value must be a literal (optionally negated). Redeclaration is a
    /// semantic error.
    fn parse_const(&mut self) -> Option<StmtKind> {
        let loc = self.peek().loc;
        let name = self.parse_name("constant name")?;
        self.expect_punct(Punct::Eq);
        let value = self.parse_expr()?;

        let folded = match &value.kind {
            ExprKind::IntLit(n) => Some(basic_core::Value::Int(*n)),
            ExprKind::RealLit(d) => Some(basic_core::Value::Double(*d)),
            ExprKind::StrLit(s) => Some(basic_core::Value::Str(s.clone())),
            ExprKind::Unary(UnOp::Neg, inner) => match &inner.kind {
                ExprKind::IntLit(n) => Some(basic_core::Value::Int(-n)),
                ExprKind::RealLit(d) => Some(basic_core::Value::Double(-d)),
                _ => None,
            },
            _ => None,
        };
        match folded {
            Some(v) => {
                if let Err(message) = self.constants.define(&name, v) {
                    let basic_line = self.basic_line_at(loc);
                    self.diagnostics.push(
                        Diagnostic::new(DiagnosticKind::SemanticError, message, loc)
                            .with_basic_line(basic_line),
                    );
                }
            }
            None => {
                self.error_at(loc, format!("CONST {} requires a literal value", name));
            }
        }
        Some(StmtKind::Const { name, value })
    }

    fn parse_option(&mut self) -> Option<StmtKind> {
        if self.consume_keyword(Keyword::Base) {
            match *self.peek_kind() {
                TokenKind::IntLit(n) if n == 0 || n == 1 => {
                    self.advance();
                    self.options.array_base = n;
                }
                _ => {
                    self.error_here("OPTION BASE requires 0 or 1".to_string());
                    return None;
                }
            }
        } else if self.consume_keyword(Keyword::Explicit) {
            self.options.explicit = true;
        } else if self.consume_keyword(Keyword::Unicode) {
            self.options.unicode = true;
        } else if self.consume_keyword(Keyword::Bitwise) {
            self.options.logic_mode = LogicMode::Bitwise;
        } else if self.consume_keyword(Keyword::Logical) {
            self.options.logic_mode = LogicMode::Logical;
        } else {
            self.error_here(format!("Unknown OPTION '{}'", self.peek().text));
            return None;
        }
        Some(StmtKind::Rem)
    }

    // -- shared pieces -----------------------------------------------------

    fn parse_var_ref(&mut self) -> Option<VarRef> {
        if matches!(self.peek_kind(), TokenKind::Identifier) {
            let token = self.advance();
            let name = match token.suffix.as_char() {
                Some(c) => token.text.trim_end_matches(c).to_string(),
                None => token.text.clone(),
            };
            Some(VarRef {
                name,
                suffix: token.suffix,
                loc: token.loc,
            })
        } else {
            self.error_here(format!("Expected an identifier, found '{}'", self.peek().text));
            None
        }
    }

    fn parse_name(&mut self, what: &str) -> Option<String> {
        match self.peek_kind() {
            TokenKind::Identifier => Some(self.advance().text),
            _ => {
                self.error_here(format!("Expected {}, found '{}'", what, self.peek().text));
                None
            }
        }
    }

    fn parse_lvalue(&mut self) -> Option<LValue> {
        let var = self.parse_var_ref()?;
        if self.consume_punct(Punct::LParen) {
            let indices = self.parse_expr_list(Punct::RParen)?;
            self.expect_punct(Punct::RParen);
            Some(LValue::Array(var, indices))
        } else {
            Some(LValue::Var(var))
        }
    }

    fn parse_expr_list(&mut self, closer: Punct) -> Option<Vec<Expr>> {
        let mut list = Vec::new();
        if self.check_punct(closer) {
            return Some(list);
        }
        list.push(self.parse_expr()?);
        while self.consume_punct(Punct::Comma) {
            list.push(self.parse_expr()?);
        }
        Some(list)
    }

    fn parse_expr_list_to_end(&mut self) -> Option<Vec<Expr>> {
        let mut list = vec![self.parse_expr()?];
        while self.consume_punct(Punct::Comma) {
            list.push(self.parse_expr()?);
        }
        Some(list)
    }

    // -- expressions (precedence climbing) ---------------------------------

    pub fn parse_expr(&mut self) -> Option<Expr> {
        self.parse_imp()
    }

    fn parse_imp(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_eqv()?;
        while self.consume_keyword(Keyword::Imp) {
            let rhs = self.parse_eqv()?;
            let loc = lhs.loc;
            lhs = Expr::new(ExprKind::Binary(BinOp::Imp, Box::new(lhs), Box::new(rhs)), loc);
        }
        Some(lhs)
    }

    fn parse_eqv(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_or()?;
        while self.consume_keyword(Keyword::Eqv) {
            let rhs = self.parse_or()?;
            let loc = lhs.loc;
            lhs = Expr::new(ExprKind::Binary(BinOp::Eqv, Box::new(lhs), Box::new(rhs)), loc);
        }
        Some(lhs)
    }

    fn parse_or(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_and()?;
        loop {
            let op = if self.consume_keyword(Keyword::Or) {
                BinOp::Or
            } else if self.consume_keyword(Keyword::Xor) {
                BinOp::Xor
            } else {
                break;
            };
            let rhs = self.parse_and()?;
            let loc = lhs.loc;
            lhs = Expr::new(ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)), loc);
        }
        Some(lhs)
    }

    fn parse_and(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_not()?;
        while self.consume_keyword(Keyword::And) {
            let rhs = self.parse_not()?;
            let loc = lhs.loc;
            lhs = Expr::new(ExprKind::Binary(BinOp::And, Box::new(lhs), Box::new(rhs)), loc);
        }
        Some(lhs)
    }

    fn parse_not(&mut self) -> Option<Expr> {
        if self.check_keyword(Keyword::Not) {
            let loc = self.peek().loc;
            self.advance();
            let operand = self.parse_not()?;
            return Some(Expr::new(ExprKind::Unary(UnOp::Not, Box::new(operand)), loc));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Punct(Punct::Eq) => BinOp::Eq,
                TokenKind::Punct(Punct::Ne) => BinOp::Ne,
                TokenKind::Punct(Punct::Lt) => BinOp::Lt,
                TokenKind::Punct(Punct::Le) => BinOp::Le,
                TokenKind::Punct(Punct::Gt) => BinOp::Gt,
                TokenKind::Punct(Punct::Ge) => BinOp::Ge,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_additive()?;
            let loc = lhs.loc;
            lhs = Expr::new(ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)), loc);
        }
        Some(lhs)
    }

    fn parse_additive(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Punct(Punct::Plus) => BinOp::Add,
                TokenKind::Punct(Punct::Minus) => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_multiplicative()?;
            let loc = lhs.loc;
            lhs = Expr::new(ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)), loc);
        }
        Some(lhs)
    }

    fn parse_multiplicative(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_power()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Punct(Punct::Star) => BinOp::Mul,
                TokenKind::Punct(Punct::Slash) => BinOp::Div,
                TokenKind::Punct(Punct::Backslash) => BinOp::IntDiv,
                TokenKind::Keyword(Keyword::Mod) => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_power()?;
            let loc = lhs.loc;
            lhs = Expr::new(ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)), loc);
        }
        Some(lhs)
    }

    fn parse_power(&mut self) -> Option<Expr> {
        let lhs = self.parse_unary()?;
        if self.consume_punct(Punct::Caret) {
            // Right-associative.
            let rhs = self.parse_power()?;
            let loc = lhs.loc;
            return Some(Expr::new(
                ExprKind::Binary(BinOp::Pow, Box::new(lhs), Box::new(rhs)),
                loc,
            ));
        }
        Some(lhs)
    }

    fn parse_unary(&mut self) -> Option<Expr> {
        if self.check_punct(Punct::Minus) {
            let loc = self.peek().loc;
            self.advance();
            let operand = self.parse_unary()?;
            return Some(Expr::new(ExprKind::Unary(UnOp::Neg, Box::new(operand)), loc));
        }
        if self.check_punct(Punct::Plus) {
            self.advance();
            return self.parse_unary();
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Option<Expr> {
        let loc = self.peek().loc;
        match self.peek_kind().clone() {
            TokenKind::IntLit(n) => {
                self.advance();
                Some(Expr::new(ExprKind::IntLit(n), loc))
            }
            TokenKind::RealLit(d) => {
                self.advance();
                Some(Expr::new(ExprKind::RealLit(d), loc))
            }
            TokenKind::StrLit(s) => {
                self.advance();
                Some(Expr::new(ExprKind::StrLit(s), loc))
            }
            TokenKind::Punct(Punct::LParen) => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect_punct(Punct::RParen);
                Some(inner)
            }
            TokenKind::Identifier => {
                let var = self.parse_var_ref()?;
                // Constants shadow variables and commands in expression
                // position.
                if var.suffix == TypeSuffix::None
                    && let Some(index) = self.constants.index_of(&var.name)
                {
                    return Some(Expr::new(ExprKind::ConstRef(index, var.name), loc));
                }
                if self.consume_punct(Punct::LParen) {
                    let args = self.parse_expr_list(Punct::RParen)?;
                    self.expect_punct(Punct::RParen);
                    return Some(Expr::new(ExprKind::IndexOrCall(var, args), loc));
                }
                Some(Expr::new(ExprKind::Var(var), loc))
            }
            TokenKind::Command(name) => {
                self.advance();
                if let Some(index) = self.constants.index_of(&name) {
                    return Some(Expr::new(ExprKind::ConstRef(index, name), loc));
                }
                if self.registry.function(&name).is_none() {
                    self.error_at(loc, format!("'{}' is a command, not a function", name));
                    return None;
                }
                let args = if self.consume_punct(Punct::LParen) {
                    let args = self.parse_expr_list(Punct::RParen)?;
                    self.expect_punct(Punct::RParen);
                    args
                } else {
                    Vec::new()
                };
                Some(Expr::new(ExprKind::FnCall { name, args }, loc))
            }
            _ => {
                self.error_here(format!(
                    "Expected an expression, found '{}'",
                    self.peek().text
                ));
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer;
    use basic_core::builtins;

    fn parse_source(src: &str) -> ParseOutput {
        let mut reg = CommandRegistry::new();
        builtins::register_core_functions(&mut reg).unwrap();
        builtins::register_core_commands(&mut reg).unwrap();
        let mut constants = ConstantsStore::with_predefined();
        let lexed = lexer::tokenize(src, &reg, 50);
        assert!(lexed.diagnostics.is_empty(), "lex errors: {:?}", lexed.diagnostics);
        Parser::new(lexed.tokens, &lexed.mapping, &mut constants, &reg, 50).parse()
    }

    fn parse_ok(src: &str) -> Program {
        let out = parse_source(src);
        assert!(out.diagnostics.is_empty(), "parse errors: {:?}", out.diagnostics);
        out.program
    }

    fn first_stmt(program: &Program) -> &Statement {
        program.lines[0]
            .statements
            .first()
            .expect("expected a statement")
    }

    #[test]
    fn assignment_forms() {
        let program = parse_ok("10 A% = 1\n20 LET B = 2\n30 A(1, 2) = 3\n");
        match &first_stmt(&program).kind {
            StmtKind::Assign { target: LValue::Var(v), .. } => assert_eq!(v.key(), "A%"),
            other => panic!("unexpected {:?}", other),
        }
        match &program.lines[2].statements[0].kind {
            StmtKind::Assign { target: LValue::Array(v, idx), .. } => {
                assert_eq!(v.key(), "A");
                assert_eq!(idx.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn statements_carry_basic_lines() {
        let program = parse_ok("10 A = 1\n20 B = 2\n");
        assert_eq!(program.lines[0].statements[0].basic_line, Some(10));
        assert_eq!(program.lines[1].statements[0].basic_line, Some(20));
    }

    #[test]
    fn precedence_and_mod_backslash() {
        let program = parse_ok("10 X = 1 + 2 * 3\n");
        match &first_stmt(&program).kind {
            StmtKind::Assign { value, .. } => match &value.kind {
                ExprKind::Binary(BinOp::Add, lhs, rhs) => {
                    assert!(matches!(lhs.kind, ExprKind::IntLit(1)));
                    assert!(matches!(rhs.kind, ExprKind::Binary(BinOp::Mul, _, _)));
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }

        let program = parse_ok("10 X = 7 MOD 2 + 9 \\ 4\n");
        match &first_stmt(&program).kind {
            StmtKind::Assign { value, .. } => {
                assert!(matches!(value.kind, ExprKind::Binary(BinOp::Add, _, _)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn logical_precedence_is_below_comparison() {
        let program = parse_ok("10 X = A = 1 AND B = 2\n");
        match &first_stmt(&program).kind {
            StmtKind::Assign { value, .. } => {
                assert!(matches!(value.kind, ExprKind::Binary(BinOp::And, _, _)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn power_is_right_associative() {
        let program = parse_ok("10 X = 2 ^ 3 ^ 2\n");
        match &first_stmt(&program).kind {
            StmtKind::Assign { value, .. } => match &value.kind {
                ExprKind::Binary(BinOp::Pow, _, rhs) => {
                    assert!(matches!(rhs.kind, ExprKind::Binary(BinOp::Pow, _, _)));
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn constants_resolve_in_expressions() {
        let program = parse_ok("10 X = PI * 2\n");
        match &first_stmt(&program).kind {
            StmtKind::Assign { value, .. } => match &value.kind {
                ExprKind::Binary(BinOp::Mul, lhs, _) => {
                    assert!(matches!(lhs.kind, ExprKind::ConstRef(_, _)));
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn print_separators() {
        let program = parse_ok("10 PRINT A; \" \"; B$\n");
        match &first_stmt(&program).kind {
            StmtKind::Print { items, channel } => {
                assert!(channel.is_none());
                assert_eq!(items.len(), 3);
                assert_eq!(items[0].sep, Some(PrintSep::Semicolon));
                assert_eq!(items[2].sep, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn single_line_if_with_else() {
        let program = parse_ok("10 IF A > 1 THEN PRINT 1 ELSE PRINT 2\n");
        match &first_stmt(&program).kind {
            StmtKind::If { arms, else_body } => {
                assert_eq!(arms.len(), 1);
                assert_eq!(arms[0].1.len(), 1);
                assert_eq!(else_body.as_ref().unwrap().len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn then_line_number_becomes_goto() {
        let program = parse_ok("10 IF A THEN 30\n");
        match &first_stmt(&program).kind {
            StmtKind::If { arms, .. } => match &arms[0].1[0].kind {
                StmtKind::Goto(target) => assert_eq!(target, "L30"),
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn block_if_with_elseif() {
        let program = parse_ok(
            "10 IF A = 1 THEN\n20 PRINT 1\n30 ELSEIF A = 2 THEN\n40 PRINT 2\n50 ELSE\n60 PRINT 3\n70 ENDIF\n",
        );
        match &first_stmt(&program).kind {
            StmtKind::If { arms, else_body } => {
                assert_eq!(arms.len(), 2);
                assert!(else_body.is_some());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn for_next_single_line() {
        let program = parse_ok("30 FOR I = 1 TO 3 : A(I) = I * I : NEXT I\n");
        match &first_stmt(&program).kind {
            StmtKind::For { var, body, step, .. } => {
                assert_eq!(var.key(), "I");
                assert!(step.is_none());
                assert_eq!(body.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn next_var_mismatch_is_an_error() {
        let out = parse_source("10 FOR I = 1 TO 3\n20 NEXT J\n");
        assert!(out.diagnostics.iter().any(|d| d.message.contains("NEXT")));
    }

    #[test]
    fn select_case_arms() {
        let program = parse_ok(
            "10 SELECT CASE X\n20 CASE 1, 2\n30 PRINT 1\n40 CASE IS > 5\n50 PRINT 2\n60 CASE ELSE\n70 PRINT 3\n80 ENDSELECT\n",
        );
        match &first_stmt(&program).kind {
            StmtKind::Select { arms, else_body, .. } => {
                assert_eq!(arms.len(), 2);
                assert_eq!(arms[0].tests.len(), 2);
                assert!(matches!(arms[1].tests[0], CaseTest::Is(BinOp::Gt, _)));
                assert!(else_body.is_some());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn on_goto_list() {
        let program = parse_ok("10 ON X GOTO L100, L200\n");
        match &first_stmt(&program).kind {
            StmtKind::OnGoto { targets, gosub, .. } => {
                assert_eq!(targets, &vec!["L100".to_string(), "L200".to_string()]);
                assert!(!gosub);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn timer_statements() {
        let program = parse_ok("10 EVERY 100 MS TICK\n20 AFTER 2 SECS DONE\n30 STOP TIMER ALL\n");
        match &program.lines[0].statements[0].kind {
            StmtKind::Timer { every, unit, handler, .. } => {
                assert!(*every);
                assert_eq!(*unit, TimeUnit::Ms);
                assert_eq!(handler, "TICK");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            program.lines[2].statements[0].kind,
            StmtKind::StopTimer(StopTimerTarget::All)
        ));
    }

    #[test]
    fn sub_and_function_declarations() {
        let program = parse_ok(
            "10 SUB TICK : T% = T% + 1 : ENDSUB\n20 FUNCTION F%(X%)\n30 F% = X% * 2\n40 ENDFUNCTION\n",
        );
        assert!(matches!(program.lines[0].statements[0].kind, StmtKind::Sub { .. }));
        match &program.lines[1].statements[0].kind {
            StmtKind::Function { name, params, body } => {
                assert_eq!(name.key(), "F%");
                assert_eq!(params.len(), 1);
                assert_eq!(body.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn open_close_write() {
        let program = parse_ok(
            "10 OPEN \"out.txt\" FOR OUTPUT AS #1\n20 WRITE #1, A$, B\n30 CLOSE #1\n",
        );
        assert!(matches!(
            program.lines[0].statements[0].kind,
            StmtKind::Open { mode: FileMode::Output, .. }
        ));
        assert!(matches!(program.lines[1].statements[0].kind, StmtKind::Write { .. }));
        assert!(matches!(program.lines[2].statements[0].kind, StmtKind::Close { .. }));
    }

    #[test]
    fn options_are_collected() {
        let out = parse_source("10 OPTION BASE 1\n20 OPTION EXPLICIT\n30 OPTION LOGICAL\n");
        assert_eq!(out.options.array_base, 1);
        assert!(out.options.explicit);
        assert_eq!(out.options.logic_mode, LogicMode::Logical);
    }

    #[test]
    fn registry_function_without_parens() {
        let program = parse_ok("10 K$ = INKEY$\n");
        match &first_stmt(&program).kind {
            StmtKind::Assign { value, .. } => {
                assert!(matches!(&value.kind, ExprKind::FnCall { name, .. } if name == "INKEY$"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn error_recovery_collects_multiple_errors() {
        let out = parse_source("10 X = \n20 Y = )\n30 Z = 1\n");
        assert!(out.diagnostics.len() >= 2);
        // Line 30 still parsed.
        assert!(out
            .program
            .lines
            .iter()
            .any(|l| l.basic_line == Some(30) && !l.statements.is_empty()));
        // Diagnostics carry BASIC lines.
        assert!(out.diagnostics.iter().all(|d| d.basic_line.is_some()));
    }

    #[test]
    fn do_loop_with_both_tests_is_rejected() {
        let out = parse_source("10 DO WHILE A\n20 LOOP UNTIL B\n");
        assert!(!out.diagnostics.is_empty());
    }
}
