use std::{error, fmt};

use crate::scalar::ucs4_of_str;

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    UnexpectedChar(char),
    MalformedNumber,
    UnterminatedString,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedChar(c) => write!(f, "unexpected character `{c}`"),
            Self::MalformedNumber => f.write_str("malformed numeric literal"),
            Self::UnterminatedString => f.write_str("unterminated string literal"),
        }
    }
}

impl error::Error for Error {}

/// One lexeme with its zero-based source offset.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokKind,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokKind {
    Ident(String),
    /// Integer magnitude; a leading sign is a unary operator
    Int(u64),
    Float(f64),
    /// UTF-8 source text decoded to UCS-4
    StrLit(Box<[u32]>),
    Plus,
    Minus,
    Star,
    /// `**`, the only power operator (`^` is xor)
    StarStar,
    Slash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Bang,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    Ne,
    Shl,
    Shr,
    LParen,
    RParen,
    Comma,
    Colon,
    Assign,
    /// `+=` and friends carry the underlying operator token
    AugAssign(Box<TokKind>),
    Eof,
}

/// Offset-tracking scanner over one source fragment. The DSL front-end runs
/// one `Lexer` per logical line with the line's base offset.
pub struct Lexer<'src> {
    src: &'src str,
    pos: usize,
    base: usize,
}

impl<'src> Lexer<'src> {
    #[must_use]
    pub fn new(src: &'src str, base: usize) -> Self {
        Self { src, pos: 0, base }
    }

    /// Absolute offset of the next unread character
    #[must_use]
    pub fn offset(&self) -> usize {
        self.base + self.pos
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn peek2(&self) -> Option<char> {
        let mut it = self.src[self.pos..].chars();
        it.next();
        it.next()
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

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if c == ' ' || c == '\t' || c == '\r' {
                self.bump();
            } else if c == '#' {
                // comment runs to end of fragment (the DSL splits lines)
                self.pos = self.src.len();
            } else {
                break;
            }
        }
    }

    /// Scan every remaining token, ending with `Eof`.
    pub fn tokenize(mut self) -> Result<Vec<Token>, (Error, usize)> {
        let mut out = Vec::new();
        loop {
            let tok = self.next_token().map_err(|e| (e, self.offset()))?;
            let done = tok.kind == TokKind::Eof;
            out.push(tok);
            if done {
                return Ok(out);
            }
        }
    }

    pub fn next_token(&mut self) -> Result<Token, Error> {
        self.skip_whitespace();
        let offset = self.offset();
        let Some(c) = self.peek() else {
            return Ok(Token { kind: TokKind::Eof, offset });
        };
        let kind = match c {
            '0'..='9' => self.number()?,
            '.' if matches!(self.peek2(), Some('0'..='9')) => self.number()?,
            'a'..='z' | 'A'..='Z' | '_' => self.ident(),
            '"' | '\'' => self.string(c)?,
            _ => self.punct()?,
        };
        Ok(Token { kind, offset })
    }

    fn ident(&mut self) -> TokKind {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                self.bump();
            } else {
                break;
            }
        }
        TokKind::Ident(self.src[start..self.pos].to_owned())
    }

    fn number(&mut self) -> Result<TokKind, Error> {
        let start = self.pos;
        if self.eat('0') && (self.eat('x') || self.eat('X')) {
            let hex_start = self.pos;
            while matches!(self.peek(), Some(c) if c.is_ascii_hexdigit() || c == '_') {
                self.bump();
            }
            let digits: String = self.src[hex_start..self.pos]
                .chars()
                .filter(|&c| c != '_')
                .collect();
            return u64::from_str_radix(&digits, 16)
                .map(TokKind::Int)
                .map_err(|_| Error::MalformedNumber);
        }
        let mut is_float = false;
        while matches!(self.peek(), Some('0'..='9' | '_')) {
            self.bump();
        }
        if self.peek() == Some('.') && self.peek2() != Some('.') {
            is_float = true;
            self.bump();
            while matches!(self.peek(), Some('0'..='9' | '_')) {
                self.bump();
            }
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            is_float = true;
            self.bump();
            if matches!(self.peek(), Some('+' | '-')) {
                self.bump();
            }
            if !matches!(self.peek(), Some('0'..='9')) {
                return Err(Error::MalformedNumber);
            }
            while matches!(self.peek(), Some('0'..='9' | '_')) {
                self.bump();
            }
        }
        let text: String = self.src[start..self.pos]
            .chars()
            .filter(|&c| c != '_')
            .collect();
        if is_float {
            text.parse::<f64>()
                .map(TokKind::Float)
                .map_err(|_| Error::MalformedNumber)
        } else {
            text.parse::<u64>()
                .map(TokKind::Int)
                .map_err(|_| Error::MalformedNumber)
        }
    }

    fn string(&mut self, quote: char) -> Result<TokKind, Error> {
        self.bump();
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(Error::UnterminatedString),
                Some(c) if c == quote => break,
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('\\') => out.push('\\'),
                    Some(c) if c == quote => out.push(c),
                    Some(c) => {
                        out.push('\\');
                        out.push(c);
                    }
                    None => return Err(Error::UnterminatedString),
                },
                Some(c) => out.push(c),
            }
        }
        Ok(TokKind::StrLit(ucs4_of_str(&out)))
    }

    fn punct(&mut self) -> Result<TokKind, Error> {
        let c = self.bump().expect("peeked");
        let simple = match c {
            '+' => TokKind::Plus,
            '-' => TokKind::Minus,
            '*' => {
                if self.eat('*') {
                    TokKind::StarStar
                } else {
                    TokKind::Star
                }
            }
            '/' => TokKind::Slash,
            '%' => TokKind::Percent,
            '&' => TokKind::Amp,
            '|' => TokKind::Pipe,
            '^' => TokKind::Caret,
            '~' => TokKind::Tilde,
            '(' => TokKind::LParen,
            ')' => TokKind::RParen,
            ',' => TokKind::Comma,
            ':' => TokKind::Colon,
            '<' => {
                if self.eat('=') {
                    TokKind::Le
                } else if self.eat('<') {
                    TokKind::Shl
                } else {
                    TokKind::Lt
                }
            }
            '>' => {
                if self.eat('=') {
                    TokKind::Ge
                } else if self.eat('>') {
                    TokKind::Shr
                } else {
                    TokKind::Gt
                }
            }
            '=' => {
                if self.eat('=') {
                    TokKind::EqEq
                } else {
                    TokKind::Assign
                }
            }
            '!' => {
                if self.eat('=') {
                    TokKind::Ne
                } else {
                    TokKind::Bang
                }
            }
            other => return Err(Error::UnexpectedChar(other)),
        };
        // augmented assignment only forms from a bare operator followed by `=`
        if matches!(
            simple,
            TokKind::Plus
                | TokKind::Minus
                | TokKind::Star
                | TokKind::Slash
                | TokKind::Percent
                | TokKind::StarStar
                | TokKind::Amp
                | TokKind::Pipe
                | TokKind::Caret
        ) && self.peek() == Some('=')
        {
            self.bump();
            return Ok(TokKind::AugAssign(Box::new(simple)));
        }
        Ok(simple)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokKind> {
        Lexer::new(src, 0)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn numbers() {
        assert_eq!(kinds("42"), vec![TokKind::Int(42), TokKind::Eof]);
        assert_eq!(kinds("0xff"), vec![TokKind::Int(255), TokKind::Eof]);
        assert_eq!(kinds("1_000"), vec![TokKind::Int(1000), TokKind::Eof]);
        assert_eq!(kinds("1.5"), vec![TokKind::Float(1.5), TokKind::Eof]);
        assert_eq!(kinds("2e3"), vec![TokKind::Float(2000.0), TokKind::Eof]);
        assert_eq!(kinds(".5"), vec![TokKind::Float(0.5), TokKind::Eof]);
        assert!(Lexer::new("1e", 0).tokenize().is_err());
    }

    #[test]
    fn operators() {
        assert_eq!(
            kinds("a ** b ^ c"),
            vec![
                TokKind::Ident("a".into()),
                TokKind::StarStar,
                TokKind::Ident("b".into()),
                TokKind::Caret,
                TokKind::Ident("c".into()),
                TokKind::Eof,
            ]
        );
        assert_eq!(
            kinds("x <= y != z >> 2"),
            vec![
                TokKind::Ident("x".into()),
                TokKind::Le,
                TokKind::Ident("y".into()),
                TokKind::Ne,
                TokKind::Ident("z".into()),
                TokKind::Shr,
                TokKind::Int(2),
                TokKind::Eof,
            ]
        );
        assert_eq!(
            kinds("acc += 1"),
            vec![
                TokKind::Ident("acc".into()),
                TokKind::AugAssign(Box::new(TokKind::Plus)),
                TokKind::Int(1),
                TokKind::Eof,
            ]
        );
    }

    #[test]
    fn strings_and_offsets() {
        assert_eq!(
            kinds("\"ab\""),
            vec![
                TokKind::StrLit(vec![u32::from('a'), u32::from('b')].into()),
                TokKind::Eof
            ]
        );
        let toks = Lexer::new("  a + b", 10).tokenize().unwrap();
        assert_eq!(toks[0].offset, 12);
        assert_eq!(toks[1].offset, 14);
        assert_eq!(toks[2].offset, 16);
        let err = Lexer::new("'abc", 0).tokenize().unwrap_err();
        assert_eq!(err.0, Error::UnterminatedString);
    }

    #[test]
    fn comments_end_the_fragment() {
        assert_eq!(kinds("a # trailing"), vec![TokKind::Ident("a".into()), TokKind::Eof]);
    }
}
