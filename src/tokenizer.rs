//! The lexical scanner (spec.md §4.1): a single-pass, non-recovering state
//! machine over a UTF-8 source buffer.
//!
//! A cursor-owning struct with a `next_token` entry point that either
//! returns a token or records a diagnostic and latches into a failed state:
//! the tokenizer is driven token-at-a-time by the parser, so the failure is
//! recorded on the shared [`Diagnostics`] sink and then every subsequent
//! call reports `Eof` so the parser can unwind cleanly.

use crate::diagnostics::Diagnostics;
use crate::token::{Token, TokenKind};

/// Unicode horizontal-whitespace code points besides ASCII space/tab
/// (spec.md §4.1).
fn is_horizontal_ws(c: char) -> bool {
    matches!(
        c,
        ' ' | '\t'
            | '\u{00A0}'
            | '\u{1680}'
            | '\u{180E}'
            | '\u{2000}'..='\u{200A}'
            | '\u{202F}'
            | '\u{205F}'
            | '\u{3000}'
            | '\u{FEFF}'
            | '\u{FFA0}'
    )
}

pub struct Tokenizer<'a> {
    source: &'a str,
    pos: usize,
    failed: bool,
}

impl<'a> Tokenizer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            pos: 0,
            failed: false,
        }
    }

    /// Whether the tokenizer has already recorded a diagnostic. Once set,
    /// every further call to [`Tokenizer::next_token`] yields `Eof` without
    /// re-scanning — the tokenizer does not recover (spec.md §4.1).
    pub fn failed(&self) -> bool {
        self.failed
    }

    fn peek(&self) -> Option<char> {
        self.source[self.pos..].chars().next()
    }

    fn peek2(&self) -> Option<char> {
        let mut chars = self.source[self.pos..].chars();
        chars.next();
        chars.next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn fail(&mut self, diagnostics: &mut Diagnostics, message: impl Into<String>, offset: usize) -> Token {
        diagnostics.err(message, offset);
        self.failed = true;
        Token::new(TokenKind::Eof, offset)
    }

    pub fn next_token(&mut self, diagnostics: &mut Diagnostics) -> Token {
        if self.failed {
            return Token::new(TokenKind::Eof, self.pos);
        }
        loop {
            let start = self.pos;
            let c = match self.peek() {
                None => return Token::new(TokenKind::Eof, start),
                Some(c) => c,
            };

            if c == '\\' {
                self.bump();
                if self.eat('\n') {
                    continue;
                }
                if self.peek() == Some('\r') && self.peek2() == Some('\n') {
                    self.bump();
                    self.bump();
                    continue;
                }
                return self.fail(diagnostics, "stray '\\' outside a string literal", start);
            }
            if c == '\n' {
                self.bump();
                return Token::new(TokenKind::Nl, start);
            }
            if c == '\r' {
                self.bump();
                if !self.eat('\n') {
                    return self.fail(diagnostics, "a bare carriage return must be followed by '\\n'", start);
                }
                return Token::new(TokenKind::Nl, start);
            }
            if c == '#' {
                while let Some(c) = self.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.bump();
                }
                continue;
            }
            if is_horizontal_ws(c) {
                self.bump();
                continue;
            }
            if c.is_ascii_digit() {
                return self.scan_number(diagnostics, start);
            }
            if c == '\'' || c == '"' {
                return self.scan_string(diagnostics, c, start);
            }
            if c.is_ascii_alphabetic() || c == '_' {
                return self.scan_ident(start);
            }
            if c.is_ascii() {
                return self.scan_operator(diagnostics, start);
            }
            return self.fail(diagnostics, format!("unexpected character '{c}'"), start);
        }
    }

    fn scan_ident(&mut self, start: usize) -> Token {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if text == "_" {
            return Token::new(TokenKind::Underscore, start);
        }
        if let Some(kind) = TokenKind::keyword(&text) {
            return Token::new(kind, start);
        }
        Token::new(TokenKind::Ident(text), start)
    }

    fn scan_operator(&mut self, diagnostics: &mut Diagnostics, start: usize) -> Token {
        let c = self.bump().expect("caller peeked a character");
        let kind = match c {
            '+' => {
                if self.eat('=') {
                    TokenKind::PlusEq
                } else {
                    TokenKind::Plus
                }
            }
            '-' => {
                if self.eat('=') {
                    TokenKind::MinusEq
                } else {
                    TokenKind::Minus
                }
            }
            '*' => {
                if self.eat('*') {
                    if self.eat('=') {
                        TokenKind::StarStarEq
                    } else {
                        TokenKind::StarStar
                    }
                } else if self.eat('=') {
                    TokenKind::StarEq
                } else {
                    TokenKind::Star
                }
            }
            '/' => {
                if self.eat('/') {
                    if self.eat('=') {
                        TokenKind::SlashSlashEq
                    } else {
                        TokenKind::SlashSlash
                    }
                } else if self.eat('=') {
                    TokenKind::SlashEq
                } else {
                    TokenKind::Slash
                }
            }
            '%' => {
                if self.eat('=') {
                    TokenKind::PercentEq
                } else {
                    TokenKind::Percent
                }
            }
            '&' => {
                if self.eat('=') {
                    TokenKind::AmpEq
                } else {
                    TokenKind::Amp
                }
            }
            '|' => {
                if self.eat('=') {
                    TokenKind::PipeEq
                } else {
                    TokenKind::Pipe
                }
            }
            '^' => {
                if self.eat('=') {
                    TokenKind::CaretEq
                } else {
                    TokenKind::Caret
                }
            }
            '~' => TokenKind::Tilde,
            '<' => {
                if self.eat('<') {
                    if self.eat('=') {
                        TokenKind::ShlEq
                    } else {
                        TokenKind::Shl
                    }
                } else if self.eat('=') {
                    TokenKind::LtEq
                } else {
                    TokenKind::Lt
                }
            }
            '>' => {
                if self.eat('>') {
                    if self.eat('=') {
                        TokenKind::ShrEq
                    } else {
                        TokenKind::Shr
                    }
                } else if self.eat('=') {
                    TokenKind::GtEq
                } else {
                    TokenKind::Gt
                }
            }
            '=' => {
                if self.eat('=') {
                    TokenKind::Eq
                } else {
                    TokenKind::Assign
                }
            }
            '!' => {
                if self.eat('=') {
                    TokenKind::NotEq
                } else {
                    return self.fail(diagnostics, "'!' is not a valid operator on its own", start);
                }
            }
            '.' => {
                if self.peek() == Some('.') && self.peek2() == Some('.') {
                    self.bump();
                    self.bump();
                    TokenKind::DotDotDot
                } else {
                    TokenKind::Dot
                }
            }
            ',' => TokenKind::Comma,
            ':' => TokenKind::Colon,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            other => return self.fail(diagnostics, format!("unexpected character '{other}'"), start),
        };
        Token::new(kind, start)
    }

    /// Collects a run of digits (and `_` separators) matching `valid`,
    /// returning the text with separators stripped.
    fn collect_digits(&mut self, valid: impl Fn(char) -> bool) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if c == '_' {
                self.bump();
            } else if valid(c) {
                out.push(c);
                self.bump();
            } else {
                break;
            }
        }
        out
    }

    fn scan_number(&mut self, diagnostics: &mut Diagnostics, start: usize) -> Token {
        if self.peek() == Some('0') {
            self.bump();
            match self.peek() {
                Some('b') | Some('B') => {
                    self.bump();
                    return self.scan_radix_int(diagnostics, start, 2, |c| matches!(c, '0' | '1'));
                }
                Some('o') | Some('O') => {
                    self.bump();
                    return self.scan_radix_int(diagnostics, start, 8, |c| ('0'..='7').contains(&c));
                }
                Some('x') | Some('X') => {
                    self.bump();
                    return self.scan_hex_number(diagnostics, start);
                }
                Some(c) if c.is_ascii_digit() => {
                    return self.fail(
                        diagnostics,
                        "a leading zero must not be followed by another decimal digit",
                        start,
                    );
                }
                Some('.') if self.peek2().map(|c| c.is_ascii_digit()).unwrap_or(false) => {
                    return self.scan_decimal_tail(diagnostics, start, "0".to_string());
                }
                _ => return Token::new(TokenKind::Int(0), start),
            }
        }
        let first = self.bump().expect("caller verified a leading digit");
        let mut digits = String::from(first);
        digits.push_str(&self.collect_digits(|c| c.is_ascii_digit()));
        self.scan_decimal_tail(diagnostics, start, digits)
    }

    /// Continues a decimal literal after its integer digits have been
    /// collected: optional `.digits` fraction, optional `e[+-]?digits`
    /// exponent.
    fn scan_decimal_tail(&mut self, diagnostics: &mut Diagnostics, start: usize, int_part: String) -> Token {
        let mut text = int_part;
        let mut is_float = false;

        if self.peek() == Some('.') && self.peek2().map(|c| c.is_ascii_digit()).unwrap_or(false) {
            self.bump();
            is_float = true;
            text.push('.');
            text.push_str(&self.collect_digits(|c| c.is_ascii_digit()));
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            is_float = true;
            text.push('e');
            self.bump();
            if self.peek() == Some('+') || self.peek() == Some('-') {
                text.push(self.bump().unwrap());
            }
            let exponent = self.collect_digits(|c| c.is_ascii_digit());
            if exponent.is_empty() {
                return self.fail(diagnostics, "numeric literal exponent has no digits", start);
            }
            text.push_str(&exponent);
        }

        if is_float {
            match text.parse::<f64>() {
                Ok(v) => Token::new(TokenKind::Num(v), start),
                Err(_) => self.fail(diagnostics, "invalid floating point literal", start),
            }
        } else {
            match text.parse::<i64>() {
                Ok(v) => Token::new(TokenKind::Int(v), start),
                Err(_) => self.fail(diagnostics, "integer literal out of range", start),
            }
        }
    }

    fn scan_radix_int(
        &mut self,
        diagnostics: &mut Diagnostics,
        start: usize,
        radix: u32,
        valid: impl Fn(char) -> bool,
    ) -> Token {
        let digits = self.collect_digits(valid);
        if digits.is_empty() {
            return self.fail(diagnostics, "numeric literal has no digits", start);
        }
        match i64::from_str_radix(&digits, radix) {
            Ok(v) => Token::new(TokenKind::Int(v), start),
            Err(_) => self.fail(diagnostics, "integer literal out of range", start),
        }
    }

    fn scan_hex_number(&mut self, diagnostics: &mut Diagnostics, start: usize) -> Token {
        let int_digits = self.collect_digits(|c| c.is_ascii_hexdigit());
        let mut is_float = false;
        let mut frac_digits = String::new();
        if self.peek() == Some('.') {
            is_float = true;
            self.bump();
            frac_digits = self.collect_digits(|c| c.is_ascii_hexdigit());
        }
        let mut exponent: i32 = 0;
        if matches!(self.peek(), Some('p') | Some('P')) {
            is_float = true;
            self.bump();
            let negative = if self.peek() == Some('+') {
                self.bump();
                false
            } else if self.peek() == Some('-') {
                self.bump();
                true
            } else {
                false
            };
            let exp_digits = self.collect_digits(|c| c.is_ascii_digit());
            if exp_digits.is_empty() {
                return self.fail(diagnostics, "hexadecimal exponent has no digits", start);
            }
            let magnitude: i32 = exp_digits.parse().unwrap_or(i32::MAX);
            exponent = if negative { -magnitude } else { magnitude };
        }

        if int_digits.is_empty() && frac_digits.is_empty() {
            return self.fail(diagnostics, "numeric literal has no digits", start);
        }

        if !is_float {
            return match i64::from_str_radix(&int_digits, 16) {
                Ok(v) => Token::new(TokenKind::Int(v), start),
                Err(_) => self.fail(diagnostics, "integer literal out of range", start),
            };
        }

        let mut value = if int_digits.is_empty() {
            0.0
        } else {
            u64::from_str_radix(&int_digits, 16).unwrap_or(u64::MAX) as f64
        };
        if !frac_digits.is_empty() {
            let frac_value = u64::from_str_radix(&frac_digits, 16).unwrap_or(0) as f64;
            value += frac_value / 16f64.powi(frac_digits.chars().count() as i32);
        }
        value *= 2f64.powi(exponent);
        Token::new(TokenKind::Num(value), start)
    }

    fn scan_string(&mut self, diagnostics: &mut Diagnostics, quote: char, start: usize) -> Token {
        self.bump();
        let mut bytes: Vec<u8> = Vec::new();
        loop {
            match self.peek() {
                None => return self.fail(diagnostics, "unterminated string literal", start),
                Some(c) if c == quote => {
                    self.bump();
                    return Token::new(TokenKind::Str(bytes), start);
                }
                Some('\n') | Some('\r') => {
                    return self.fail(diagnostics, "unescaped newline inside a string literal", start);
                }
                Some('\\') => {
                    self.bump();
                    match self.scan_string_escape(diagnostics, start, &mut bytes) {
                        Ok(()) => {}
                        Err(token) => return token,
                    }
                }
                Some(c) => {
                    let mut buf = [0u8; 4];
                    bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                    self.bump();
                }
            }
        }
    }

    fn scan_string_escape(
        &mut self,
        diagnostics: &mut Diagnostics,
        start: usize,
        bytes: &mut Vec<u8>,
    ) -> Result<(), Token> {
        match self.peek() {
            Some('\'') => {
                bytes.push(b'\'');
                self.bump();
            }
            Some('"') => {
                bytes.push(b'"');
                self.bump();
            }
            Some('\\') => {
                bytes.push(b'\\');
                self.bump();
            }
            Some('n') => {
                bytes.push(b'\n');
                self.bump();
            }
            Some('r') => {
                bytes.push(b'\r');
                self.bump();
            }
            Some('t') => {
                bytes.push(b'\t');
                self.bump();
            }
            Some('\n') => {
                self.bump();
            }
            Some('\r') => {
                self.bump();
                self.eat('\n');
            }
            Some('x') => {
                self.bump();
                let digits = self.collect_digits(|c| c.is_ascii_hexdigit());
                if digits.is_empty() || digits.len() > 2 {
                    return Err(self.fail(diagnostics, "'\\x' escape requires 1 or 2 hex digits", start));
                }
                bytes.push(u8::from_str_radix(&digits, 16).unwrap_or(0));
            }
            Some('u') => {
                self.bump();
                if !self.eat('{') {
                    return Err(self.fail(diagnostics, "'\\u' escape requires '{'", start));
                }
                let digits = self.collect_digits(|c| c.is_ascii_hexdigit());
                if !self.eat('}') {
                    return Err(self.fail(diagnostics, "'\\u' escape requires a closing '}'", start));
                }
                if digits.is_empty() || digits.len() > 6 {
                    return Err(self.fail(diagnostics, "'\\u' escape requires 1 to 6 hex digits", start));
                }
                let code = u32::from_str_radix(&digits, 16).unwrap_or(u32::MAX);
                match char::from_u32(code) {
                    Some(ch) => {
                        let mut buf = [0u8; 4];
                        bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                    }
                    None => {
                        return Err(self.fail(diagnostics, "'\\u' escape is not a valid code point", start));
                    }
                }
            }
            Some(other) => {
                return Err(self.fail(diagnostics, format!("unknown escape sequence '\\{other}'"), start));
            }
            None => return Err(self.fail(diagnostics, "unterminated string literal", start)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(source: &str) -> (Vec<TokenKind>, Diagnostics) {
        let mut tokenizer = Tokenizer::new(source);
        let mut diagnostics = Diagnostics::new();
        let mut kinds = Vec::new();
        loop {
            let token = tokenizer.next_token(&mut diagnostics);
            let done = token.kind == TokenKind::Eof;
            kinds.push(token.kind);
            if done {
                break;
            }
        }
        (kinds, diagnostics)
    }

    #[test]
    fn simple_let_statement() {
        let (kinds, diags) = tokens("let x = 1 + 2\n");
        assert!(diags.is_empty());
        assert_eq!(
            kinds,
            vec![
                TokenKind::Let,
                TokenKind::Ident("x".into()),
                TokenKind::Assign,
                TokenKind::Int(1),
                TokenKind::Plus,
                TokenKind::Int(2),
                TokenKind::Nl,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn hex_float_with_exponent_is_one_number_token() {
        let (kinds, diags) = tokens("0xdeadP2");
        assert!(diags.is_empty());
        assert_eq!(kinds.len(), 2);
        assert!(matches!(kinds[0], TokenKind::Num(_)));
    }

    #[test]
    fn leading_zero_then_digit_is_an_error() {
        let (_kinds, diags) = tokens("09");
        assert!(!diags.is_empty());
    }

    #[test]
    fn string_escapes_resolve_to_bytes() {
        let (kinds, diags) = tokens(r#""a\tb\u{41}""#);
        assert!(diags.is_empty());
        assert_eq!(kinds[0], TokenKind::Str(b"a\tbA".to_vec()));
    }

    #[test]
    fn underscore_alone_is_discard() {
        let (kinds, _) = tokens("_");
        assert_eq!(kinds[0], TokenKind::Underscore);
    }

    #[test]
    fn triple_dot_is_range_operator() {
        let (kinds, diags) = tokens("1...2");
        assert!(diags.is_empty());
        assert_eq!(kinds[1], TokenKind::DotDotDot);
    }

    #[test]
    fn unescaped_newline_in_string_is_an_error() {
        let (_kinds, diags) = tokens("\"a\nb\"");
        assert!(!diags.is_empty());
    }

    #[test]
    fn compound_assignment_operators() {
        let (kinds, diags) = tokens("a **= 2");
        assert!(diags.is_empty());
        assert_eq!(kinds[1], TokenKind::StarStarEq);
    }
}
