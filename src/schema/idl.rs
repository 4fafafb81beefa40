//! Thrift IDL reader.
//!
//! Parses the subset of the Thrift interface definition language the gateway needs to type
//! check JSON payloads: namespaces, includes, typedefs, enums, structs, unions, exceptions
//! and services. Constant definitions, default values and annotations are accepted and
//! skipped. Included files are recorded but not followed.

use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

const MAX_TYPE_DEPTH: usize = 32;

/// A parse failure with the 1-based line it was detected on
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

type Result<T> = std::result::Result<T, ParseError>;

/// A field or argument type as written in the document
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Bool,
    Byte,
    I16,
    I32,
    I64,
    Double,
    String,
    Binary,
    List(Box<FieldType>),
    Set(Box<FieldType>),
    Map(Box<FieldType>, Box<FieldType>),
    /// A typedef, enum or struct declared elsewhere in the document
    Named(String),
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Bool => write!(f, "bool"),
            FieldType::Byte => write!(f, "byte"),
            FieldType::I16 => write!(f, "i16"),
            FieldType::I32 => write!(f, "i32"),
            FieldType::I64 => write!(f, "i64"),
            FieldType::Double => write!(f, "double"),
            FieldType::String => write!(f, "string"),
            FieldType::Binary => write!(f, "binary"),
            FieldType::List(inner) => write!(f, "list<{}>", inner),
            FieldType::Set(inner) => write!(f, "set<{}>", inner),
            FieldType::Map(key, value) => write!(f, "map<{},{}>", key, value),
            FieldType::Named(name) => write!(f, "{}", name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requiredness {
    Required,
    Optional,
    /// No qualifier; treated as optional when validating
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub id: Option<i32>,
    pub name: String,
    pub requiredness: Requiredness,
    pub ty: FieldType,
}

impl Field {
    pub fn is_required(&self) -> bool {
        self.requiredness == Requiredness::Required
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructKind {
    Struct,
    Union,
    Exception,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructDef {
    pub name: String,
    pub kind: StructKind,
    pub fields: Vec<Field>,
}

impl StructDef {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|field| field.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumDef {
    pub name: String,
    pub members: Vec<(String, i64)>,
}

impl EnumDef {
    pub fn value_of(&self, member: &str) -> Option<i64> {
        self.members
            .iter()
            .find(|(name, _)| name == member)
            .map(|(_, value)| *value)
    }

    pub fn contains_value(&self, value: i64) -> bool {
        self.members.iter().any(|(_, v)| *v == value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub name: String,
    pub oneway: bool,
    /// `None` for `void`
    pub return_type: Option<FieldType>,
    pub arguments: Vec<Field>,
    pub throws: Vec<Field>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDef {
    pub name: String,
    pub extends: Option<String>,
    pub functions: Vec<Function>,
}

/// Everything declared in one IDL document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    pub namespaces: Vec<(String, String)>,
    pub includes: Vec<String>,
    pub typedefs: HashMap<String, FieldType>,
    pub enums: HashMap<String, EnumDef>,
    pub structs: HashMap<String, StructDef>,
    pub services: Vec<ServiceDef>,
}

impl Document {
    pub fn service(&self, name: &str) -> Option<&ServiceDef> {
        self.services.iter().find(|service| service.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Double(f64),
    Literal(String),
    LBrace,
    RBrace,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Lt,
    Gt,
    Comma,
    Semicolon,
    Colon,
    Equals,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(name) => format!("identifier '{}'", name),
            Token::Int(value) => format!("integer {}", value),
            Token::Double(value) => format!("number {}", value),
            Token::Literal(value) => format!("literal \"{}\"", value),
            Token::LBrace => "'{'".to_string(),
            Token::RBrace => "'}'".to_string(),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
            Token::LBracket => "'['".to_string(),
            Token::RBracket => "']'".to_string(),
            Token::Lt => "'<'".to_string(),
            Token::Gt => "'>'".to_string(),
            Token::Comma => "','".to_string(),
            Token::Semicolon => "';'".to_string(),
            Token::Colon => "':'".to_string(),
            Token::Equals => "'='".to_string(),
        }
    }
}

fn is_ident_start(byte: u8) -> bool {
    byte.is_ascii_alphabetic() || byte == b'_'
}

fn is_ident_continue(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'.'
}

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut line = 1;
    let mut i = 0;

    while i < bytes.len() {
        let byte = bytes[i];
        match byte {
            b'\n' => {
                line += 1;
                i += 1;
            }
            b' ' | b'\t' | b'\r' => i += 1,
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let start_line = line;
                i += 2;
                loop {
                    match bytes.get(i) {
                        None => {
                            return Err(ParseError {
                                line: start_line,
                                message: "unterminated block comment".to_string(),
                            })
                        }
                        Some(b'*') if bytes.get(i + 1) == Some(&b'/') => {
                            i += 2;
                            break;
                        }
                        Some(b'\n') => {
                            line += 1;
                            i += 1;
                        }
                        Some(_) => i += 1,
                    }
                }
            }
            b'"' | b'\'' => {
                let quote = byte;
                let start = i + 1;
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    if bytes[i] == b'\n' {
                        line += 1;
                    }
                    i += 1;
                }
                if i >= bytes.len() {
                    return Err(ParseError {
                        line,
                        message: "unterminated string literal".to_string(),
                    });
                }
                tokens.push((Token::Literal(source[start..i].to_string()), line));
                i += 1;
            }
            b'{' => {
                tokens.push((Token::LBrace, line));
                i += 1;
            }
            b'}' => {
                tokens.push((Token::RBrace, line));
                i += 1;
            }
            b'(' => {
                tokens.push((Token::LParen, line));
                i += 1;
            }
            b')' => {
                tokens.push((Token::RParen, line));
                i += 1;
            }
            b'[' => {
                tokens.push((Token::LBracket, line));
                i += 1;
            }
            b']' => {
                tokens.push((Token::RBracket, line));
                i += 1;
            }
            b'<' => {
                tokens.push((Token::Lt, line));
                i += 1;
            }
            b'>' => {
                tokens.push((Token::Gt, line));
                i += 1;
            }
            b',' => {
                tokens.push((Token::Comma, line));
                i += 1;
            }
            b';' => {
                tokens.push((Token::Semicolon, line));
                i += 1;
            }
            b':' => {
                tokens.push((Token::Colon, line));
                i += 1;
            }
            b'=' => {
                tokens.push((Token::Equals, line));
                i += 1;
            }
            b'*' => {
                tokens.push((Token::Ident("*".to_string()), line));
                i += 1;
            }
            b'-' | b'+' | b'0'..=b'9' => {
                let (token, next) = lex_number(source, i, line)?;
                tokens.push((token, line));
                i = next;
            }
            _ if is_ident_start(byte) => {
                let start = i;
                while i < bytes.len() && is_ident_continue(bytes[i]) {
                    i += 1;
                }
                tokens.push((Token::Ident(source[start..i].to_string()), line));
            }
            _ => {
                return Err(ParseError {
                    line,
                    message: format!("unexpected character '{}'", byte as char),
                })
            }
        }
    }

    Ok(tokens)
}

fn lex_number(source: &str, start: usize, line: usize) -> Result<(Token, usize)> {
    let bytes = source.as_bytes();
    let mut i = start;
    if matches!(bytes.get(i), Some(b'-') | Some(b'+')) {
        i += 1;
    }

    if bytes.get(i) == Some(&b'0') && matches!(bytes.get(i + 1), Some(b'x') | Some(b'X')) {
        let digits_start = i + 2;
        i = digits_start;
        while bytes.get(i).is_some_and(u8::is_ascii_hexdigit) {
            i += 1;
        }
        let magnitude = i64::from_str_radix(&source[digits_start..i], 16).map_err(|e| ParseError {
            line,
            message: format!("invalid hex literal: {}", e),
        })?;
        let value = if bytes[start] == b'-' { -magnitude } else { magnitude };
        return Ok((Token::Int(value), i));
    }

    let mut is_double = false;
    while let Some(&byte) = bytes.get(i) {
        match byte {
            b'0'..=b'9' => i += 1,
            b'.' | b'e' | b'E' => {
                is_double = true;
                i += 1;
                if matches!(bytes.get(i), Some(b'-') | Some(b'+')) && byte != b'.' {
                    i += 1;
                }
            }
            _ => break,
        }
    }

    let text = &source[start..i];
    if is_double {
        text.parse::<f64>()
            .map(|value| (Token::Double(value), i))
            .map_err(|e| ParseError {
                line,
                message: format!("invalid number literal '{}': {}", text, e),
            })
    } else {
        text.parse::<i64>()
            .map(|value| (Token::Int(value), i))
            .map_err(|e| ParseError {
                line,
                message: format!("invalid integer literal '{}': {}", text, e),
            })
    }
}

/// Parse an IDL document
pub fn parse(source: &str) -> Result<Document> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        document: Document::default(),
    };
    parser.parse_document()?;
    Ok(parser.document)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    document: Document,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(token, _)| token)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|(_, line)| *line)
            .unwrap_or(1)
    }

    fn error<T>(&self, message: impl Into<String>) -> Result<T> {
        Err(ParseError {
            line: self.line(),
            message: message.into(),
        })
    }

    fn next(&mut self) -> Result<Token> {
        match self.tokens.get(self.pos) {
            Some((token, _)) => {
                let token = token.clone();
                self.pos += 1;
                Ok(token)
            }
            None => self.error("unexpected end of document"),
        }
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        let token = self.next()?;
        if token == expected {
            Ok(())
        } else {
            self.pos -= 1;
            self.error(format!(
                "expected {}, found {}",
                expected.describe(),
                token.describe()
            ))
        }
    }

    fn eat(&mut self, candidate: &Token) -> bool {
        if self.peek() == Some(candidate) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        match self.peek() {
            Some(Token::Ident(name)) if name == keyword => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    fn ident(&mut self) -> Result<String> {
        match self.next()? {
            Token::Ident(name) => Ok(name),
            other => {
                self.pos -= 1;
                self.error(format!("expected identifier, found {}", other.describe()))
            }
        }
    }

    fn literal(&mut self) -> Result<String> {
        match self.next()? {
            Token::Literal(value) => Ok(value),
            other => {
                self.pos -= 1;
                self.error(format!("expected string literal, found {}", other.describe()))
            }
        }
    }

    fn skip_separator(&mut self) {
        if !self.eat(&Token::Comma) {
            self.eat(&Token::Semicolon);
        }
    }

    /// Skip a balanced `open ... close` group, the opening token already peeked
    fn skip_group(&mut self, open: Token, close: Token) -> Result<()> {
        self.expect(open.clone())?;
        let mut depth = 1;
        while depth > 0 {
            let token = self.next()?;
            if token == open {
                depth += 1;
            } else if token == close {
                depth -= 1;
            }
        }
        Ok(())
    }

    fn skip_annotations(&mut self) -> Result<()> {
        if self.peek() == Some(&Token::LParen) {
            self.skip_group(Token::LParen, Token::RParen)?;
        }
        Ok(())
    }

    fn skip_const_value(&mut self) -> Result<()> {
        match self.peek() {
            Some(Token::LBracket) => self.skip_group(Token::LBracket, Token::RBracket),
            Some(Token::LBrace) => self.skip_group(Token::LBrace, Token::RBrace),
            Some(Token::Int(_))
            | Some(Token::Double(_))
            | Some(Token::Literal(_))
            | Some(Token::Ident(_)) => {
                self.pos += 1;
                Ok(())
            }
            Some(other) => {
                let found = other.describe();
                self.error(format!("expected constant value, found {}", found))
            }
            None => self.error("unexpected end of document"),
        }
    }

    fn parse_document(&mut self) -> Result<()> {
        while let Some(token) = self.peek() {
            let keyword = match token {
                Token::Ident(keyword) => keyword.clone(),
                other => {
                    let found = other.describe();
                    return self.error(format!("expected a definition, found {}", found));
                }
            };
            self.pos += 1;

            match keyword.as_str() {
                "namespace" => {
                    let scope = self.ident()?;
                    let name = self.ident()?;
                    self.skip_annotations()?;
                    self.document.namespaces.push((scope, name));
                }
                "include" | "cpp_include" => {
                    let path = self.literal()?;
                    if keyword == "include" {
                        self.document.includes.push(path);
                    }
                }
                "typedef" => {
                    let ty = self.parse_type(0)?;
                    let name = self.ident()?;
                    self.skip_annotations()?;
                    self.skip_separator();
                    self.document.typedefs.insert(name, ty);
                }
                "const" => {
                    self.parse_type(0)?;
                    self.ident()?;
                    self.expect(Token::Equals)?;
                    self.skip_const_value()?;
                    self.skip_separator();
                }
                "enum" => self.parse_enum()?,
                "struct" => self.parse_struct(StructKind::Struct)?,
                "union" => self.parse_struct(StructKind::Union)?,
                "exception" => self.parse_struct(StructKind::Exception)?,
                "service" => self.parse_service()?,
                other => {
                    self.pos -= 1;
                    return self.error(format!("unsupported definition '{}'", other));
                }
            }
        }
        Ok(())
    }

    fn parse_type(&mut self, depth: usize) -> Result<FieldType> {
        if depth > MAX_TYPE_DEPTH {
            return self.error("type nesting is too deep");
        }

        let name = self.ident()?;
        let ty = match name.as_str() {
            "bool" => FieldType::Bool,
            "byte" | "i8" => FieldType::Byte,
            "i16" => FieldType::I16,
            "i32" => FieldType::I32,
            "i64" => FieldType::I64,
            "double" => FieldType::Double,
            "string" => FieldType::String,
            "binary" => FieldType::Binary,
            "list" | "set" => {
                self.expect(Token::Lt)?;
                let inner = Box::new(self.parse_type(depth + 1)?);
                self.expect(Token::Gt)?;
                if name == "list" {
                    FieldType::List(inner)
                } else {
                    FieldType::Set(inner)
                }
            }
            "map" => {
                self.expect(Token::Lt)?;
                let key = Box::new(self.parse_type(depth + 1)?);
                self.expect(Token::Comma)?;
                let value = Box::new(self.parse_type(depth + 1)?);
                self.expect(Token::Gt)?;
                FieldType::Map(key, value)
            }
            _ => FieldType::Named(name),
        };
        self.skip_annotations()?;
        Ok(ty)
    }

    fn parse_enum(&mut self) -> Result<()> {
        let name = self.ident()?;
        self.expect(Token::LBrace)?;

        let mut members = Vec::new();
        let mut next_value = 0i64;
        while !self.eat(&Token::RBrace) {
            let member = self.ident()?;
            let value = if self.eat(&Token::Equals) {
                match self.next()? {
                    Token::Int(value) => value,
                    other => {
                        self.pos -= 1;
                        return self.error(format!(
                            "expected enum value, found {}",
                            other.describe()
                        ));
                    }
                }
            } else {
                next_value
            };
            if members.iter().any(|(existing, _)| existing == &member) {
                return self.error(format!("duplicate enum member {}.{}", name, member));
            }
            members.push((member, value));
            next_value = value + 1;
            self.skip_annotations()?;
            self.skip_separator();
        }
        self.skip_annotations()?;

        self.document
            .enums
            .insert(name.clone(), EnumDef { name, members });
        Ok(())
    }

    fn parse_struct(&mut self, kind: StructKind) -> Result<()> {
        let name = self.ident()?;
        self.eat_keyword("xsd_all");
        self.expect(Token::LBrace)?;

        let fields = self.parse_fields(Token::RBrace)?;
        self.skip_annotations()?;

        if self.document.structs.contains_key(&name) {
            return self.error(format!("duplicate definition of {}", name));
        }
        self.document
            .structs
            .insert(name.clone(), StructDef { name, kind, fields });
        Ok(())
    }

    /// Fields up to and including `close`
    fn parse_fields(&mut self, close: Token) -> Result<Vec<Field>> {
        let mut fields: Vec<Field> = Vec::new();
        while !self.eat(&close) {
            let field = self.parse_field()?;
            if fields.iter().any(|existing| existing.name == field.name) {
                return self.error(format!("duplicate field '{}'", field.name));
            }
            fields.push(field);
        }
        Ok(fields)
    }

    fn parse_field(&mut self) -> Result<Field> {
        let id = match self.peek() {
            Some(Token::Int(value)) => {
                let value = *value;
                self.pos += 1;
                self.expect(Token::Colon)?;
                Some(i32::try_from(value).map_err(|_| ParseError {
                    line: self.line(),
                    message: format!("field id {} out of range", value),
                })?)
            }
            _ => None,
        };

        let requiredness = if self.eat_keyword("required") {
            Requiredness::Required
        } else if self.eat_keyword("optional") {
            Requiredness::Optional
        } else {
            Requiredness::Default
        };

        let ty = self.parse_type(0)?;
        let name = self.ident()?;
        if self.eat(&Token::Equals) {
            self.skip_const_value()?;
        }
        self.skip_annotations()?;
        self.skip_separator();

        Ok(Field {
            id,
            name,
            requiredness,
            ty,
        })
    }

    fn parse_service(&mut self) -> Result<()> {
        let name = self.ident()?;
        let extends = if self.eat_keyword("extends") {
            Some(self.ident()?)
        } else {
            None
        };
        self.expect(Token::LBrace)?;

        let mut functions: Vec<Function> = Vec::new();
        while !self.eat(&Token::RBrace) {
            let oneway = self.eat_keyword("oneway");
            let return_type = if self.eat_keyword("void") {
                None
            } else {
                Some(self.parse_type(0)?)
            };
            let function_name = self.ident()?;
            self.expect(Token::LParen)?;
            let arguments = self.parse_fields(Token::RParen)?;
            let throws = if self.eat_keyword("throws") {
                self.expect(Token::LParen)?;
                self.parse_fields(Token::RParen)?
            } else {
                Vec::new()
            };
            self.skip_annotations()?;
            self.skip_separator();

            if functions.iter().any(|f| f.name == function_name) {
                return self.error(format!(
                    "duplicate method {}.{}",
                    name, function_name
                ));
            }
            functions.push(Function {
                name: function_name,
                oneway,
                return_type,
                arguments,
                throws,
            });
        }
        self.skip_annotations()?;

        self.document.services.push(ServiceDef {
            name,
            extends,
            functions,
        });
        Ok(())
    }
}
