//! Forward-only JSON token reader.
//!
//! Fileset and index entries are read one token at a time so an arbitrarily long
//! array never has to be held in memory. Scalars are unescaped with `serde_json`;
//! this module only tracks structure.

use std::fmt;
use std::io::{BufRead, BufReader, Read};

use crate::error::{Result, VolumeError};

#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    StartObject,
    EndObject,
    StartArray,
    EndArray,
    PropertyName(String),
    String(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Null,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    StartObject,
    EndObject,
    StartArray,
    EndArray,
    PropertyName,
    String,
    Integer,
    Float,
    Bool,
    Null,
}

impl Token {
    pub fn kind(&self) -> TokenKind {
        match self {
            Token::StartObject => TokenKind::StartObject,
            Token::EndObject => TokenKind::EndObject,
            Token::StartArray => TokenKind::StartArray,
            Token::EndArray => TokenKind::EndArray,
            Token::PropertyName(_) => TokenKind::PropertyName,
            Token::String(_) => TokenKind::String,
            Token::Integer(_) => TokenKind::Integer,
            Token::Float(_) => TokenKind::Float,
            Token::Bool(_) => TokenKind::Bool,
            Token::Null => TokenKind::Null,
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::PropertyName(s) | Token::String(s) => write!(f, "{} {:?}", self.kind(), s),
            Token::Integer(v) => write!(f, "Integer {v}"),
            Token::Float(v) => write!(f, "Float {v}"),
            Token::Bool(v) => write!(f, "Bool {v}"),
            _ => write!(f, "{}", self.kind()),
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Frame {
    ObjectKeyOrEnd,
    ObjectValue,
    ObjectCommaOrEnd,
    ArrayValueOrEnd,
    ArrayCommaOrEnd,
}

pub struct JsonReader<R> {
    inner: BufReader<R>,
    offset: u64,
    stack: Vec<Frame>,
    top_level_done: bool,
    /// Entry name, used in error messages.
    source: String,
}

impl<R: Read> JsonReader<R> {
    pub fn new(inner: R, source: impl Into<String>) -> Self {
        Self {
            inner: BufReader::new(inner),
            offset: 0,
            stack: Vec::new(),
            top_level_done: false,
            source: source.into(),
        }
    }

    /// Nesting depth of the last token read.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    fn lex_error(&self, message: impl Into<String>) -> VolumeError {
        VolumeError::InvalidJson {
            offset: self.offset,
            message: format!("{} in {}", message.into(), self.source),
        }
    }

    /// Build the error for a token that is not the one the format calls for.
    pub fn unexpected(&self, expected: impl fmt::Display, actual: Option<&Token>) -> VolumeError {
        VolumeError::InvalidFilesetData {
            expected: expected.to_string(),
            actual: actual.map_or_else(|| "EOF".to_string(), Token::to_string),
            context: format!("{} at byte {}", self.source, self.offset),
        }
    }

    fn peek(&mut self) -> Result<Option<u8>> {
        Ok(self.inner.fill_buf()?.first().copied())
    }

    fn bump(&mut self) {
        self.inner.consume(1);
        self.offset += 1;
    }

    fn next_byte(&mut self) -> Result<Option<u8>> {
        let b = self.peek()?;
        if b.is_some() {
            self.bump();
        }
        Ok(b)
    }

    fn skip_ws(&mut self) -> Result<Option<u8>> {
        while let Some(b) = self.peek()? {
            if !matches!(b, b' ' | b'\t' | b'\r' | b'\n') {
                return Ok(Some(b));
            }
            self.bump();
        }
        Ok(None)
    }

    fn expect_byte(&mut self, want: u8) -> Result<()> {
        match self.skip_ws()? {
            Some(b) if b == want => {
                self.bump();
                Ok(())
            }
            Some(b) => Err(self.lex_error(format!(
                "expected '{}', found '{}'",
                want as char,
                b.escape_ascii()
            ))),
            None => Err(self.lex_error(format!("expected '{}', found EOF", want as char))),
        }
    }

    /// Read the next token. `None` means the input ended, wherever that happened.
    pub fn read(&mut self) -> Result<Option<Token>> {
        let Some(b) = self.skip_ws()? else {
            return Ok(None);
        };
        match self.stack.last().copied() {
            None if self.top_level_done => Err(self.lex_error("trailing data after document")),
            None => {
                self.top_level_done = true;
                self.value(b).map(Some)
            }
            Some(Frame::ObjectKeyOrEnd) => match b {
                b'}' => self.close(),
                b'"' => self.property_name().map(Some),
                _ => Err(self.lex_error("expected property name or '}'")),
            },
            Some(Frame::ObjectCommaOrEnd) => match b {
                b'}' => self.close(),
                b',' => {
                    self.bump();
                    match self.skip_ws()? {
                        Some(b'"') => self.property_name().map(Some),
                        Some(_) => Err(self.lex_error("expected property name after ','")),
                        None => Ok(None),
                    }
                }
                _ => Err(self.lex_error("expected ',' or '}'")),
            },
            Some(Frame::ObjectValue) => self.value(b).map(Some),
            Some(Frame::ArrayValueOrEnd) => match b {
                b']' => self.close(),
                _ => self.value(b).map(Some),
            },
            Some(Frame::ArrayCommaOrEnd) => match b {
                b']' => self.close(),
                b',' => {
                    self.bump();
                    match self.skip_ws()? {
                        Some(b) => self.value(b).map(Some),
                        None => Ok(None),
                    }
                }
                _ => Err(self.lex_error("expected ',' or ']'")),
            },
        }
    }

    fn close(&mut self) -> Result<Option<Token>> {
        let b = self.next_byte()?;
        let frame = self.stack.pop();
        match (b, frame) {
            (Some(b'}'), Some(Frame::ObjectKeyOrEnd | Frame::ObjectCommaOrEnd)) => {
                Ok(Some(Token::EndObject))
            }
            (Some(b']'), Some(Frame::ArrayValueOrEnd | Frame::ArrayCommaOrEnd)) => {
                Ok(Some(Token::EndArray))
            }
            _ => Err(self.lex_error("mismatched closing bracket")),
        }
    }

    fn property_name(&mut self) -> Result<Token> {
        let name = self.string()?;
        self.expect_byte(b':')?;
        if let Some(top) = self.stack.last_mut() {
            *top = Frame::ObjectValue;
        }
        Ok(Token::PropertyName(name))
    }

    fn value(&mut self, first: u8) -> Result<Token> {
        // Whatever follows this value in the parent is a separator or the end.
        match self.stack.last_mut() {
            Some(top @ Frame::ObjectValue) => *top = Frame::ObjectCommaOrEnd,
            Some(top @ (Frame::ArrayValueOrEnd | Frame::ArrayCommaOrEnd)) => {
                *top = Frame::ArrayCommaOrEnd
            }
            _ => {}
        }
        match first {
            b'{' => {
                self.bump();
                self.stack.push(Frame::ObjectKeyOrEnd);
                Ok(Token::StartObject)
            }
            b'[' => {
                self.bump();
                self.stack.push(Frame::ArrayValueOrEnd);
                Ok(Token::StartArray)
            }
            b'"' => Ok(Token::String(self.string()?)),
            b'-' | b'0'..=b'9' => self.number(),
            b't' => self.literal(b"true", Token::Bool(true)),
            b'f' => self.literal(b"false", Token::Bool(false)),
            b'n' => self.literal(b"null", Token::Null),
            other => Err(self.lex_error(format!("unexpected '{}'", other.escape_ascii()))),
        }
    }

    fn string(&mut self) -> Result<String> {
        let mut raw = Vec::with_capacity(48);
        // opening quote
        if let Some(b) = self.next_byte()? {
            raw.push(b);
        }
        loop {
            match self.next_byte()? {
                Some(b'"') => {
                    raw.push(b'"');
                    break;
                }
                Some(b'\\') => {
                    raw.push(b'\\');
                    match self.next_byte()? {
                        Some(b) => raw.push(b),
                        None => return Err(self.lex_error("unterminated string")),
                    }
                }
                Some(b) => raw.push(b),
                None => return Err(self.lex_error("unterminated string")),
            }
        }
        serde_json::from_slice(&raw).map_err(|e| self.lex_error(format!("bad string: {e}")))
    }

    fn number(&mut self) -> Result<Token> {
        let mut text = String::new();
        while let Some(b) = self.peek()? {
            if !matches!(b, b'-' | b'+' | b'.' | b'e' | b'E' | b'0'..=b'9') {
                break;
            }
            text.push(b as char);
            self.bump();
        }
        if text.contains(['.', 'e', 'E']) {
            text.parse()
                .map(Token::Float)
                .map_err(|_| self.lex_error(format!("bad number {text:?}")))
        } else {
            text.parse()
                .map(Token::Integer)
                .map_err(|_| self.lex_error(format!("bad integer {text:?}")))
        }
    }

    fn literal(&mut self, word: &[u8], token: Token) -> Result<Token> {
        for &want in word {
            if self.next_byte()? != Some(want) {
                return Err(self.lex_error(format!(
                    "expected literal {}",
                    String::from_utf8_lossy(word)
                )));
            }
        }
        Ok(token)
    }

    /// Read a token that must exist and be of `kind`.
    pub fn expect(&mut self, kind: TokenKind) -> Result<Token> {
        match self.read()? {
            Some(t) if t.kind() == kind => Ok(t),
            other => Err(self.unexpected(kind, other.as_ref())),
        }
    }

    /// Read `"name": <value of kind>` and return the value token.
    pub fn read_property(&mut self, name: &str, kind: TokenKind) -> Result<Token> {
        match self.read()? {
            Some(Token::PropertyName(p)) if p == name => {}
            other => {
                return Err(self.unexpected(format!("property \"{name}\""), other.as_ref()));
            }
        }
        self.expect(kind)
    }

    pub fn read_string_property(&mut self, name: &str) -> Result<String> {
        match self.read_property(name, TokenKind::String)? {
            Token::String(s) => Ok(s),
            _ => unreachable!("expect() checked the kind"),
        }
    }

    pub fn read_i64_property(&mut self, name: &str) -> Result<i64> {
        match self.read_property(name, TokenKind::Integer)? {
            Token::Integer(v) => Ok(v),
            _ => unreachable!("expect() checked the kind"),
        }
    }

    /// Skip tokens until the container that is open at `depth` closes.
    ///
    /// Counts brackets only; the skipped tokens are never interpreted.
    pub fn skip_to_depth(&mut self, depth: usize) -> Result<()> {
        while self.stack.len() > depth {
            if self.read()?.is_none() {
                return Err(self.unexpected("end of entry", None));
            }
        }
        Ok(())
    }

    /// Skip the rest of the object whose `StartObject` was the last container opened.
    pub fn skip_object(&mut self) -> Result<()> {
        self.skip_to_depth(self.depth().saturating_sub(1))
    }
}
