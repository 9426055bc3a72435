//! Recursive-descent parser (spec.md §4.2): a strict 14-level precedence
//! climb over the token stream, allocating into the tree's arena.
//!
//! Walks the token stream one production at a time, bottoming out at the
//! lowest operator-precedence level.

use crate::ast::{AggregateKind, InfixOp, Jump, Literal, MapItem, MatchCase, Node, NodeId, Pattern, PrefixOp, Tree, TypeOp};
use crate::diagnostics::Diagnostics;
use crate::token::{Token, TokenKind};
use crate::tokenizer::Tokenizer;

/// Which stage produced the first fatal diagnostic, so the host boundary can
/// pick `BogError::TokenizeError` vs `BogError::ParseError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseFailure {
    Tokenize,
    Parse,
}

pub fn parse(source: &str, diagnostics: &mut Diagnostics) -> Result<Tree, ParseFailure> {
    let mut parser = Parser::new(source, diagnostics);
    let tree = parser.parse_program();
    if parser.tokenizer.failed() {
        Err(ParseFailure::Tokenize)
    } else if parser.failed {
        Err(ParseFailure::Parse)
    } else {
        Ok(tree)
    }
}

struct Parser<'src, 'd> {
    tokenizer: Tokenizer<'src>,
    diagnostics: &'d mut Diagnostics,
    current: Token,
    /// Whether we are inside a bracketed context (`()`/`[]`/`{}` other than a
    /// block) where newlines are insignificant (spec.md §4.2).
    skip_nl: bool,
    tree: Tree,
    failed: bool,
}

impl<'src, 'd> Parser<'src, 'd> {
    fn new(source: &'src str, diagnostics: &'d mut Diagnostics) -> Self {
        let mut tokenizer = Tokenizer::new(source);
        let current = tokenizer.next_token(diagnostics);
        Self {
            tokenizer,
            diagnostics,
            current,
            skip_nl: false,
            tree: Tree::new(),
            failed: false,
        }
    }

    fn bump(&mut self) -> Token {
        let next = self.tokenizer.next_token(self.diagnostics);
        std::mem::replace(&mut self.current, next)
    }

    fn skip_nl_if_needed(&mut self) {
        while self.skip_nl && self.current.kind == TokenKind::Nl {
            self.bump();
        }
    }

    fn expect(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.bump();
        } else {
            self.error(message);
        }
    }

    /// Records a diagnostic, marks the parse as failed, and returns a
    /// placeholder node so callers can keep building a tree shape without
    /// panicking. The parser does not attempt recovery (spec.md §4.2).
    fn error(&mut self, message: impl Into<String>) -> NodeId {
        let offset = self.current.offset;
        self.diagnostics.err(message, offset);
        self.failed = true;
        self.tree.push(Node::Literal(Literal::None), offset)
    }

    fn starts_expr(&self) -> bool {
        !matches!(
            self.current.kind,
            TokenKind::Nl
                | TokenKind::Eof
                | TokenKind::RParen
                | TokenKind::RBracket
                | TokenKind::RBrace
                | TokenKind::Comma
                | TokenKind::Colon
        )
    }

    fn parse_program(&mut self) -> Tree {
        loop {
            while self.current.kind == TokenKind::Nl {
                self.bump();
            }
            if self.current.kind == TokenKind::Eof || self.failed {
                break;
            }
            let stmt = self.parse_expr();
            self.tree.statements.push(stmt);
            if self.failed {
                break;
            }
            match self.current.kind {
                TokenKind::Nl => {
                    self.bump();
                }
                TokenKind::Eof => break,
                _ => {
                    self.error("expected a newline or end of input after a statement");
                    break;
                }
            }
        }
        std::mem::take(&mut self.tree)
    }

    // Level 1: `fn` literal, jump expressions, `let` bindings.
    fn parse_expr(&mut self) -> NodeId {
        match &self.current.kind {
            TokenKind::Fn => self.parse_fn_literal(),
            TokenKind::Return => self.parse_return(),
            TokenKind::Break => self.parse_break(),
            TokenKind::Continue => {
                let offset = self.current.offset;
                self.bump();
                self.tree.push(Node::Jump(Jump::Continue), offset)
            }
            TokenKind::Let => self.parse_let(),
            _ => self.parse_assignment(),
        }
    }

    fn parse_fn_literal(&mut self) -> NodeId {
        let offset = self.current.offset;
        self.bump();
        let name = if let TokenKind::Ident(name) = &self.current.kind {
            let name = name.clone();
            self.bump();
            Some(name)
        } else {
            None
        };
        self.expect(TokenKind::LParen, "expected '(' to start a function's parameter list");
        let prev_skip = self.skip_nl;
        self.skip_nl = true;
        let params = self.parse_pattern_list(TokenKind::RParen);
        self.expect(TokenKind::RParen, "expected ')' to close a function's parameter list");
        self.skip_nl = prev_skip;
        let body = self.parse_expr();
        self.tree.push(Node::Fn { name, params, body }, offset)
    }

    fn parse_return(&mut self) -> NodeId {
        let offset = self.current.offset;
        self.bump();
        let value = if self.starts_expr() { Some(self.parse_expr()) } else { None };
        self.tree.push(Node::Jump(Jump::Return(value)), offset)
    }

    fn parse_break(&mut self) -> NodeId {
        let offset = self.current.offset;
        self.bump();
        let value = if self.starts_expr() { Some(self.parse_expr()) } else { None };
        self.tree.push(Node::Jump(Jump::Break(value)), offset)
    }

    fn parse_let(&mut self) -> NodeId {
        let offset = self.current.offset;
        self.bump();
        let pattern = self.parse_pattern();
        self.expect(TokenKind::Assign, "expected '=' after a 'let' pattern");
        let value = self.parse_expr();
        self.tree.push(Node::Let { pattern, value }, offset)
    }

    // Level 2: assignment (not valid inside bracketed contexts).
    fn parse_assignment(&mut self) -> NodeId {
        let lhs = self.parse_boolean();
        let op = match self.current.kind {
            TokenKind::Assign => InfixOp::Assign,
            TokenKind::PlusEq => InfixOp::AddAssign,
            TokenKind::MinusEq => InfixOp::SubAssign,
            TokenKind::StarEq => InfixOp::MulAssign,
            TokenKind::StarStarEq => InfixOp::PowAssign,
            TokenKind::SlashEq => InfixOp::DivAssign,
            TokenKind::SlashSlashEq => InfixOp::DivFloorAssign,
            TokenKind::PercentEq => InfixOp::ModAssign,
            TokenKind::ShlEq => InfixOp::ShlAssign,
            TokenKind::ShrEq => InfixOp::ShrAssign,
            TokenKind::AmpEq => InfixOp::BitAndAssign,
            TokenKind::PipeEq => InfixOp::BitOrAssign,
            TokenKind::CaretEq => InfixOp::BitXorAssign,
            _ => return lhs,
        };
        if self.skip_nl {
            self.error("assignment is not valid inside a bracketed expression");
            return lhs;
        }
        let offset = self.tree.offset(lhs);
        self.bump();
        let rhs = if op == InfixOp::Assign {
            self.parse_expr()
        } else {
            self.parse_bitwise()
        };
        self.tree.push(Node::Infix { op, lhs, rhs }, offset)
    }

    // Level 3: boolean `not`/`and`/`or` — a chain may not mix `and` and `or`.
    fn parse_boolean(&mut self) -> NodeId {
        let mut lhs = self.parse_bool_operand();
        match self.current.kind {
            TokenKind::And => {
                while self.current.kind == TokenKind::And {
                    let offset = self.tree.offset(lhs);
                    self.bump();
                    self.skip_nl_if_needed();
                    let rhs = self.parse_bool_operand();
                    lhs = self.tree.push(Node::Infix { op: InfixOp::And, lhs, rhs }, offset);
                }
            }
            TokenKind::Or => {
                while self.current.kind == TokenKind::Or {
                    let offset = self.tree.offset(lhs);
                    self.bump();
                    self.skip_nl_if_needed();
                    let rhs = self.parse_bool_operand();
                    lhs = self.tree.push(Node::Infix { op: InfixOp::Or, lhs, rhs }, offset);
                }
            }
            _ => {}
        }
        lhs
    }

    fn parse_bool_operand(&mut self) -> NodeId {
        if self.current.kind == TokenKind::Not {
            let offset = self.current.offset;
            self.bump();
            let rhs = self.parse_bool_operand();
            return self.tree.push(Node::Prefix { op: PrefixOp::BoolNot, rhs }, offset);
        }
        self.parse_comparison()
    }

    // Level 4: non-associative comparison, plus `is TYPENAME`.
    fn parse_comparison(&mut self) -> NodeId {
        let lhs = self.parse_range();
        let op = match self.current.kind {
            TokenKind::Lt => Some(InfixOp::Lt),
            TokenKind::LtEq => Some(InfixOp::LtEq),
            TokenKind::Gt => Some(InfixOp::Gt),
            TokenKind::GtEq => Some(InfixOp::GtEq),
            TokenKind::Eq => Some(InfixOp::Eq),
            TokenKind::NotEq => Some(InfixOp::NotEq),
            TokenKind::In => Some(InfixOp::In),
            _ => None,
        };
        if let Some(op) = op {
            let offset = self.tree.offset(lhs);
            self.bump();
            self.skip_nl_if_needed();
            let rhs = self.parse_range();
            return self.tree.push(Node::Infix { op, lhs, rhs }, offset);
        }
        if self.current.kind == TokenKind::Is {
            let offset = self.tree.offset(lhs);
            self.bump();
            self.skip_nl_if_needed();
            let type_name = self.parse_type_name();
            return self.tree.push(
                Node::TypeInfix {
                    op: TypeOp::Is,
                    lhs,
                    type_name,
                },
                offset,
            );
        }
        lhs
    }

    fn parse_type_name(&mut self) -> String {
        if let TokenKind::Ident(name) = &self.current.kind {
            let name = name.clone();
            self.bump();
            name
        } else {
            self.error("expected a type name");
            String::new()
        }
    }

    // Level 5: non-associative range `...`.
    fn parse_range(&mut self) -> NodeId {
        let lhs = self.parse_bitwise();
        if self.current.kind == TokenKind::DotDotDot {
            let offset = self.tree.offset(lhs);
            self.bump();
            self.skip_nl_if_needed();
            let rhs = self.parse_bitwise();
            return self.tree.push(Node::Infix { op: InfixOp::Range, lhs, rhs }, offset);
        }
        lhs
    }

    // Level 6: single-operator bitwise chains, plus `catch`.
    fn parse_bitwise(&mut self) -> NodeId {
        let mut lhs = self.parse_shift();
        let chain_op = match self.current.kind {
            TokenKind::Amp => Some(InfixOp::BitAnd),
            TokenKind::Pipe => Some(InfixOp::BitOr),
            TokenKind::Caret => Some(InfixOp::BitXor),
            _ => None,
        };
        if let Some(op) = chain_op {
            let token_matches = |kind: &TokenKind| match op {
                InfixOp::BitAnd => *kind == TokenKind::Amp,
                InfixOp::BitOr => *kind == TokenKind::Pipe,
                InfixOp::BitXor => *kind == TokenKind::Caret,
                _ => false,
            };
            while token_matches(&self.current.kind) {
                let offset = self.tree.offset(lhs);
                self.bump();
                self.skip_nl_if_needed();
                let rhs = self.parse_shift();
                lhs = self.tree.push(Node::Infix { op, lhs, rhs }, offset);
            }
        }
        if self.current.kind == TokenKind::Catch {
            let offset = self.tree.offset(lhs);
            self.bump();
            self.skip_nl_if_needed();
            let binding = if self.current.kind == TokenKind::Let {
                self.bump();
                let pattern = self.parse_pattern();
                self.expect(TokenKind::Colon, "expected ':' after a 'catch let' pattern");
                Some(pattern)
            } else {
                None
            };
            let rhs = self.parse_expr();
            return self.tree.push(Node::Catch { lhs, binding, rhs }, offset);
        }
        lhs
    }

    // Level 7: shift.
    fn parse_shift(&mut self) -> NodeId {
        let mut lhs = self.parse_additive();
        loop {
            let op = match self.current.kind {
                TokenKind::Shl => InfixOp::Shl,
                TokenKind::Shr => InfixOp::Shr,
                _ => break,
            };
            let offset = self.tree.offset(lhs);
            self.bump();
            self.skip_nl_if_needed();
            let rhs = self.parse_additive();
            lhs = self.tree.push(Node::Infix { op, lhs, rhs }, offset);
        }
        lhs
    }

    // Level 8: additive.
    fn parse_additive(&mut self) -> NodeId {
        let mut lhs = self.parse_multiplicative();
        loop {
            let op = match self.current.kind {
                TokenKind::Plus => InfixOp::Add,
                TokenKind::Minus => InfixOp::Sub,
                _ => break,
            };
            let offset = self.tree.offset(lhs);
            self.bump();
            self.skip_nl_if_needed();
            let rhs = self.parse_multiplicative();
            lhs = self.tree.push(Node::Infix { op, lhs, rhs }, offset);
        }
        lhs
    }

    // Level 9: multiplicative.
    fn parse_multiplicative(&mut self) -> NodeId {
        let mut lhs = self.parse_cast();
        loop {
            let op = match self.current.kind {
                TokenKind::Star => InfixOp::Mul,
                TokenKind::Slash => InfixOp::Div,
                TokenKind::SlashSlash => InfixOp::DivFloor,
                TokenKind::Percent => InfixOp::Mod,
                _ => break,
            };
            let offset = self.tree.offset(lhs);
            self.bump();
            self.skip_nl_if_needed();
            let rhs = self.parse_cast();
            lhs = self.tree.push(Node::Infix { op, lhs, rhs }, offset);
        }
        lhs
    }

    // Level 10: cast `expr as TYPENAME`.
    fn parse_cast(&mut self) -> NodeId {
        let mut lhs = self.parse_prefix();
        while self.current.kind == TokenKind::As {
            let offset = self.tree.offset(lhs);
            self.bump();
            self.skip_nl_if_needed();
            let type_name = self.parse_type_name();
            lhs = self.tree.push(Node::TypeInfix { op: TypeOp::As, lhs, type_name }, offset);
        }
        lhs
    }

    // Level 11: prefix `try`, unary `-`/`+`, `~`.
    fn parse_prefix(&mut self) -> NodeId {
        let op = match self.current.kind {
            TokenKind::Try => Some(PrefixOp::Try),
            TokenKind::Minus => Some(PrefixOp::Neg),
            TokenKind::Plus => Some(PrefixOp::Pos),
            TokenKind::Tilde => Some(PrefixOp::BitNot),
            _ => None,
        };
        if let Some(op) = op {
            let offset = self.current.offset;
            self.bump();
            let rhs = self.parse_prefix();
            return self.tree.push(Node::Prefix { op, rhs }, offset);
        }
        self.parse_power()
    }

    // Level 12: right-associative power. The exponent re-enters at prefix
    // level so `2 ** -2` parses.
    fn parse_power(&mut self) -> NodeId {
        let lhs = self.parse_suffix();
        if self.current.kind == TokenKind::StarStar {
            let offset = self.tree.offset(lhs);
            self.bump();
            self.skip_nl_if_needed();
            let rhs = self.parse_prefix();
            return self.tree.push(Node::Infix { op: InfixOp::Pow, lhs, rhs }, offset);
        }
        lhs
    }

    // Level 13: chained suffixes — index, call, member access.
    fn parse_suffix(&mut self) -> NodeId {
        let mut expr = self.parse_primary();
        loop {
            match self.current.kind {
                TokenKind::LBracket => {
                    let offset = self.tree.offset(expr);
                    self.bump();
                    let prev_skip = self.skip_nl;
                    self.skip_nl = true;
                    self.skip_nl_if_needed();
                    let index = self.parse_expr();
                    self.skip_nl_if_needed();
                    self.expect(TokenKind::RBracket, "expected ']' to close an index expression");
                    self.skip_nl = prev_skip;
                    expr = self.tree.push(Node::Index { target: expr, index }, offset);
                }
                TokenKind::LParen => {
                    let offset = self.tree.offset(expr);
                    self.bump();
                    let prev_skip = self.skip_nl;
                    self.skip_nl = true;
                    let args = self.parse_expr_list(TokenKind::RParen);
                    self.expect(TokenKind::RParen, "expected ')' to close a call's argument list");
                    self.skip_nl = prev_skip;
                    expr = self.tree.push(Node::Call { target: expr, args }, offset);
                }
                TokenKind::Dot => {
                    let offset = self.tree.offset(expr);
                    self.bump();
                    let name = if let TokenKind::Ident(name) = &self.current.kind {
                        let name = name.clone();
                        self.bump();
                        name
                    } else {
                        self.error("expected a member name after '.'");
                        String::new()
                    };
                    expr = self.tree.push(Node::Member { target: expr, name }, offset);
                }
                _ => break,
            }
            if self.failed {
                break;
            }
        }
        expr
    }

    /// A comma-separated list of expressions up to (not including) `end`,
    /// allowing a trailing comma.
    fn parse_expr_list(&mut self, end: TokenKind) -> Vec<NodeId> {
        self.skip_nl_if_needed();
        let mut items = Vec::new();
        if self.current.kind == end {
            return items;
        }
        loop {
            items.push(self.parse_expr());
            self.skip_nl_if_needed();
            if self.current.kind == TokenKind::Comma {
                self.bump();
                self.skip_nl_if_needed();
                if self.current.kind == end {
                    break;
                }
            } else {
                break;
            }
            if self.failed {
                break;
            }
        }
        items
    }

    // Level 14: primary expressions.
    fn parse_primary(&mut self) -> NodeId {
        let offset = self.current.offset;
        match self.current.kind.clone() {
            TokenKind::Int(v) => {
                self.bump();
                self.tree.push(Node::Literal(Literal::Int(v)), offset)
            }
            TokenKind::Num(v) => {
                self.bump();
                self.tree.push(Node::Literal(Literal::Num(v)), offset)
            }
            TokenKind::Str(bytes) => {
                self.bump();
                self.tree.push(Node::Literal(Literal::Str(bytes)), offset)
            }
            TokenKind::True => {
                self.bump();
                self.tree.push(Node::Literal(Literal::Bool(true)), offset)
            }
            TokenKind::False => {
                self.bump();
                self.tree.push(Node::Literal(Literal::Bool(false)), offset)
            }
            TokenKind::None => {
                self.bump();
                self.tree.push(Node::Literal(Literal::None), offset)
            }
            TokenKind::Underscore => {
                self.bump();
                self.tree.push(Node::Discard, offset)
            }
            TokenKind::Ident(name) => {
                self.bump();
                self.tree.push(Node::Ident(name), offset)
            }
            TokenKind::If => self.parse_if(),
            TokenKind::While => self.parse_while(),
            TokenKind::For => self.parse_for(),
            TokenKind::Match => self.parse_match(),
            TokenKind::Error => self.parse_error_expr(),
            TokenKind::Import => self.parse_import(),
            TokenKind::LParen => self.parse_paren_or_tuple(),
            TokenKind::LBracket => self.parse_list(),
            TokenKind::LBrace => self.parse_brace(),
            other => self.error(format!("expected a primary expression, found {other:?}")),
        }
    }

    fn parse_optional_let_binding(&mut self) -> Option<Pattern> {
        if self.current.kind == TokenKind::Let {
            self.bump();
            let pattern = self.parse_pattern();
            self.expect(TokenKind::Assign, "expected '=' in a 'let' binding header");
            Some(pattern)
        } else {
            None
        }
    }

    fn parse_if(&mut self) -> NodeId {
        let offset = self.current.offset;
        self.bump();
        self.expect(TokenKind::LParen, "expected '(' after 'if'");
        let prev_skip = self.skip_nl;
        self.skip_nl = true;
        self.skip_nl_if_needed();
        let binding = self.parse_optional_let_binding();
        self.skip_nl_if_needed();
        let cond = self.parse_boolean();
        self.skip_nl_if_needed();
        self.expect(TokenKind::RParen, "expected ')' to close an 'if' condition");
        self.skip_nl = prev_skip;
        let body = self.parse_expr();
        let else_branch = if self.current.kind == TokenKind::Else {
            self.bump();
            Some(self.parse_expr())
        } else {
            None
        };
        self.tree.push(
            Node::If {
                binding,
                cond,
                body,
                else_branch,
            },
            offset,
        )
    }

    fn parse_while(&mut self) -> NodeId {
        let offset = self.current.offset;
        self.bump();
        self.expect(TokenKind::LParen, "expected '(' after 'while'");
        let prev_skip = self.skip_nl;
        self.skip_nl = true;
        self.skip_nl_if_needed();
        let binding = self.parse_optional_let_binding();
        self.skip_nl_if_needed();
        let cond = self.parse_boolean();
        self.skip_nl_if_needed();
        self.expect(TokenKind::RParen, "expected ')' to close a 'while' condition");
        self.skip_nl = prev_skip;
        let body = self.parse_expr();
        self.tree.push(Node::While { binding, cond, body }, offset)
    }

    fn parse_for(&mut self) -> NodeId {
        let offset = self.current.offset;
        self.bump();
        self.expect(TokenKind::LParen, "expected '(' after 'for'");
        let prev_skip = self.skip_nl;
        self.skip_nl = true;
        self.skip_nl_if_needed();
        self.expect(TokenKind::Let, "expected 'let' in a 'for' header");
        let pattern = self.parse_pattern();
        self.expect(TokenKind::In, "expected 'in' in a 'for' header");
        self.skip_nl_if_needed();
        let iterable = self.parse_range();
        self.skip_nl_if_needed();
        self.expect(TokenKind::RParen, "expected ')' to close a 'for' header");
        self.skip_nl = prev_skip;
        let body = self.parse_expr();
        self.tree.push(Node::For { pattern, iterable, body }, offset)
    }

    fn parse_match(&mut self) -> NodeId {
        let offset = self.current.offset;
        self.bump();
        self.expect(TokenKind::LParen, "expected '(' after 'match'");
        let prev_skip = self.skip_nl;
        self.skip_nl = true;
        self.skip_nl_if_needed();
        let scrutinee = self.parse_expr();
        self.skip_nl_if_needed();
        self.expect(TokenKind::RParen, "expected ')' after a 'match' scrutinee");
        self.skip_nl = prev_skip;
        self.expect(TokenKind::LBrace, "expected '{' to start a 'match' body");
        while self.current.kind == TokenKind::Nl {
            self.bump();
        }
        let mut cases = Vec::new();
        while self.current.kind != TokenKind::RBrace && self.current.kind != TokenKind::Eof && !self.failed {
            cases.push(self.parse_match_case());
            if self.current.kind != TokenKind::RBrace {
                self.expect(TokenKind::Nl, "expected a newline after a 'match' case");
            }
            while self.current.kind == TokenKind::Nl {
                self.bump();
            }
        }
        self.expect(TokenKind::RBrace, "expected '}' to close a 'match' body");
        self.tree.push(Node::Match { scrutinee, cases }, offset)
    }

    fn parse_match_case(&mut self) -> MatchCase {
        if self.current.kind == TokenKind::Underscore {
            self.bump();
            self.expect(TokenKind::Colon, "expected ':' after '_' in a 'match' case");
            let body = self.parse_expr();
            return MatchCase::CatchAll(body);
        }
        if self.current.kind == TokenKind::Let {
            self.bump();
            let pattern = self.parse_pattern();
            self.expect(TokenKind::Colon, "expected ':' after a 'match let' pattern");
            let body = self.parse_expr();
            return MatchCase::Let(pattern, body);
        }
        let mut values = vec![self.parse_expr()];
        while self.current.kind == TokenKind::Comma {
            self.bump();
            if self.current.kind == TokenKind::Colon {
                break;
            }
            values.push(self.parse_expr());
        }
        self.expect(TokenKind::Colon, "expected ':' after a 'match' case's values");
        let body = self.parse_expr();
        MatchCase::Values(values, body)
    }

    fn parse_error_expr(&mut self) -> NodeId {
        let offset = self.current.offset;
        self.bump();
        self.expect(TokenKind::LParen, "expected '(' after 'error'");
        let prev_skip = self.skip_nl;
        self.skip_nl = true;
        self.skip_nl_if_needed();
        let value = self.parse_expr();
        self.skip_nl_if_needed();
        self.expect(TokenKind::RParen, "expected ')' to close 'error(...)'");
        self.skip_nl = prev_skip;
        self.tree.push(Node::Error(value), offset)
    }

    fn parse_import(&mut self) -> NodeId {
        let offset = self.current.offset;
        self.bump();
        self.expect(TokenKind::LParen, "expected '(' after 'import'");
        let prev_skip = self.skip_nl;
        self.skip_nl = true;
        self.skip_nl_if_needed();
        let path = if let TokenKind::Str(bytes) = self.current.kind.clone() {
            self.bump();
            bytes
        } else {
            self.error("expected a string literal path in 'import(...)'");
            Vec::new()
        };
        self.skip_nl_if_needed();
        self.expect(TokenKind::RParen, "expected ')' to close 'import(...)'");
        self.skip_nl = prev_skip;
        self.tree.push(Node::Import { path }, offset)
    }

    fn parse_paren_or_tuple(&mut self) -> NodeId {
        let offset = self.current.offset;
        self.bump();
        let prev_skip = self.skip_nl;
        self.skip_nl = true;
        self.skip_nl_if_needed();
        if self.current.kind == TokenKind::RParen {
            self.bump();
            self.skip_nl = prev_skip;
            return self.tree.push(
                Node::Aggregate {
                    kind: AggregateKind::Tuple,
                    items: Vec::new(),
                },
                offset,
            );
        }
        let first = self.parse_expr();
        self.skip_nl_if_needed();
        if self.current.kind == TokenKind::Comma {
            let mut items = vec![first];
            while self.current.kind == TokenKind::Comma {
                self.bump();
                self.skip_nl_if_needed();
                if self.current.kind == TokenKind::RParen {
                    break;
                }
                items.push(self.parse_expr());
                self.skip_nl_if_needed();
            }
            self.expect(TokenKind::RParen, "expected ')' to close a tuple literal");
            self.skip_nl = prev_skip;
            return self.tree.push(Node::Aggregate { kind: AggregateKind::Tuple, items }, offset);
        }
        self.expect(TokenKind::RParen, "expected ')' to close a grouped expression");
        self.skip_nl = prev_skip;
        self.tree.push(Node::Grouped(first), offset)
    }

    fn parse_list(&mut self) -> NodeId {
        let offset = self.current.offset;
        self.bump();
        let prev_skip = self.skip_nl;
        self.skip_nl = true;
        let items = self.parse_expr_list(TokenKind::RBracket);
        self.expect(TokenKind::RBracket, "expected ']' to close a list literal");
        self.skip_nl = prev_skip;
        self.tree.push(Node::Aggregate { kind: AggregateKind::List, items }, offset)
    }

    fn parse_brace(&mut self) -> NodeId {
        let offset = self.current.offset;
        self.bump();
        if self.current.kind == TokenKind::Nl {
            return self.parse_block_body(offset);
        }
        let prev_skip = self.skip_nl;
        self.skip_nl = true;
        self.skip_nl_if_needed();
        let mut items = Vec::new();
        if self.current.kind != TokenKind::RBrace {
            loop {
                items.push(self.parse_map_item());
                self.skip_nl_if_needed();
                if self.current.kind == TokenKind::Comma {
                    self.bump();
                    self.skip_nl_if_needed();
                    if self.current.kind == TokenKind::RBrace {
                        break;
                    }
                } else {
                    break;
                }
                if self.failed {
                    break;
                }
            }
        }
        self.expect(TokenKind::RBrace, "expected '}' to close a map literal");
        self.skip_nl = prev_skip;
        self.tree.push(Node::Aggregate { kind: AggregateKind::Map, items }, offset)
    }

    fn parse_block_body(&mut self, offset: usize) -> NodeId {
        let prev_skip = self.skip_nl;
        self.skip_nl = false;
        while self.current.kind == TokenKind::Nl {
            self.bump();
        }
        let mut items = Vec::new();
        while self.current.kind != TokenKind::RBrace && self.current.kind != TokenKind::Eof && !self.failed {
            items.push(self.parse_expr());
            match self.current.kind {
                TokenKind::Nl => {
                    while self.current.kind == TokenKind::Nl {
                        self.bump();
                    }
                }
                TokenKind::RBrace => {}
                _ => {
                    self.error("expected a newline between block statements");
                    break;
                }
            }
        }
        self.expect(TokenKind::RBrace, "expected '}' to close a block");
        self.skip_nl = prev_skip;
        self.tree.push(Node::Aggregate { kind: AggregateKind::Block, items }, offset)
    }

    fn parse_map_item(&mut self) -> NodeId {
        let offset = self.current.offset;
        let first = self.parse_expr();
        if self.current.kind == TokenKind::Colon {
            self.bump();
            self.skip_nl_if_needed();
            let value = self.parse_expr();
            self.tree.push(Node::MapItem(MapItem { key: Some(first), value }), offset)
        } else {
            self.tree.push(Node::MapItem(MapItem { key: None, value: first }), offset)
        }
    }

    // Patterns (spec.md §4.2 "unwrap"): identifier | tuple | list | map | `error(pattern)` | `_`.
    fn parse_pattern(&mut self) -> Pattern {
        match self.current.kind.clone() {
            TokenKind::Ident(name) => {
                self.bump();
                Pattern::Ident(name)
            }
            TokenKind::Underscore => {
                self.bump();
                Pattern::Discard
            }
            TokenKind::LParen => {
                self.bump();
                let items = self.parse_sub_pattern_list(TokenKind::RParen);
                self.expect(TokenKind::RParen, "expected ')' to close a tuple pattern");
                Pattern::Tuple(items)
            }
            TokenKind::LBracket => {
                self.bump();
                let items = self.parse_sub_pattern_list(TokenKind::RBracket);
                self.expect(TokenKind::RBracket, "expected ']' to close a list pattern");
                Pattern::List(items)
            }
            TokenKind::LBrace => {
                self.bump();
                let items = self.parse_map_pattern_list();
                self.expect(TokenKind::RBrace, "expected '}' to close a map pattern");
                Pattern::Map(items)
            }
            TokenKind::Error => {
                self.bump();
                self.expect(TokenKind::LParen, "expected '(' after 'error' in a pattern");
                let inner = self.parse_pattern();
                self.expect(TokenKind::RParen, "expected ')' to close an 'error(...)' pattern");
                Pattern::Error(Box::new(inner))
            }
            other => {
                self.error(format!("expected a pattern, found {other:?}"));
                Pattern::Discard
            }
        }
    }

    fn parse_sub_pattern_list(&mut self, end: TokenKind) -> Vec<Pattern> {
        let prev_skip = self.skip_nl;
        self.skip_nl = true;
        self.skip_nl_if_needed();
        let mut items = Vec::new();
        if self.current.kind != end {
            loop {
                items.push(self.parse_pattern());
                self.skip_nl_if_needed();
                if self.current.kind == TokenKind::Comma {
                    self.bump();
                    self.skip_nl_if_needed();
                    if self.current.kind == end {
                        break;
                    }
                } else {
                    break;
                }
                if self.failed {
                    break;
                }
            }
        }
        self.skip_nl = prev_skip;
        items
    }

    fn parse_map_pattern_list(&mut self) -> Vec<(Option<String>, Pattern)> {
        let prev_skip = self.skip_nl;
        self.skip_nl = true;
        self.skip_nl_if_needed();
        let mut items = Vec::new();
        if self.current.kind != TokenKind::RBrace {
            loop {
                if let TokenKind::Ident(name) = self.current.kind.clone() {
                    self.bump();
                    if self.current.kind == TokenKind::Colon {
                        self.bump();
                        self.skip_nl_if_needed();
                        let pattern = self.parse_pattern();
                        items.push((Some(name), pattern));
                    } else {
                        items.push((Some(name.clone()), Pattern::Ident(name)));
                    }
                } else {
                    let pattern = self.parse_pattern();
                    items.push((None, pattern));
                }
                self.skip_nl_if_needed();
                if self.current.kind == TokenKind::Comma {
                    self.bump();
                    self.skip_nl_if_needed();
                    if self.current.kind == TokenKind::RBrace {
                        break;
                    }
                } else {
                    break;
                }
                if self.failed {
                    break;
                }
            }
        }
        self.skip_nl = prev_skip;
        items
    }

    fn parse_pattern_list(&mut self, end: TokenKind) -> Vec<Pattern> {
        self.parse_sub_pattern_list(end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Node;

    fn parse_ok(source: &str) -> Tree {
        let mut diagnostics = Diagnostics::new();
        match parse(source, &mut diagnostics) {
            Ok(tree) => tree,
            Err(_) => panic!("expected parse to succeed, diagnostics: {diagnostics}"),
        }
    }

    #[test]
    fn parses_let_and_return() {
        let tree = parse_ok("let x = 1 + 2\nreturn x\n");
        assert_eq!(tree.statements.len(), 2);
        assert!(matches!(tree.get(tree.statements[0]), Node::Let { .. }));
        assert!(matches!(tree.get(tree.statements[1]), Node::Jump(Jump::Return(Some(_)))));
    }

    #[test]
    fn parses_named_fn_literal() {
        let tree = parse_ok("fn pow(x) x * x\n");
        match tree.get(tree.statements[0]) {
            Node::Fn { name, params, .. } => {
                assert_eq!(name.as_deref(), Some("pow"));
                assert_eq!(params.len(), 1);
            }
            other => panic!("expected Fn node, got {other:?}"),
        }
    }

    #[test]
    fn parses_for_loop_over_list() {
        let tree = parse_ok("let xs = [1,2,3]\nlet s = 0\nfor (let v in xs) s += v\nreturn s\n");
        assert_eq!(tree.statements.len(), 4);
        assert!(matches!(tree.get(tree.statements[2]), Node::For { .. }));
    }

    #[test]
    fn assignment_rejected_inside_brackets() {
        let mut diagnostics = Diagnostics::new();
        let result = parse("let x = [a = 1]\n", &mut diagnostics);
        assert!(result.is_err());
    }

    #[test]
    fn and_or_chain_mixing_is_a_single_level_only() {
        // `a and b` parses as a single And chain; a following `or` is not
        // consumed by parse_boolean's And-branch, so it is left for the
        // caller (here, the statement terminator check) and fails.
        let mut diagnostics = Diagnostics::new();
        let result = parse("a and b or c\n", &mut diagnostics);
        assert!(result.is_err());
    }

    #[test]
    fn parses_match_with_catch_all() {
        let tree = parse_ok("match (x) {\n_: 1\n}\n");
        assert!(matches!(tree.get(tree.statements[0]), Node::Match { .. }));
    }
}
