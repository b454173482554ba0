use std::{
    collections::VecDeque,
    fmt,
    io::{BufRead, ErrorKind},
};

use lazy_static::lazy_static;
use regex::Regex;

#[derive(Debug, PartialEq, Clone)]
pub enum Token {
    Eof,
    Def,
    Extern,
    If,
    Then,
    Else,
    Ident(String),
    Number(f64),
    Char(char),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Eof => write!(f, "end of input"),
            Token::Def => write!(f, "'def'"),
            Token::Extern => write!(f, "'extern'"),
            Token::If => write!(f, "'if'"),
            Token::Then => write!(f, "'then'"),
            Token::Else => write!(f, "'else'"),
            Token::Ident(ident) => write!(f, "identifier '{}'", ident),
            Token::Number(num) => write!(f, "number {}", num),
            Token::Char(c) => write!(f, "'{}'", c),
        }
    }
}

#[derive(Debug, PartialEq, Clone, thiserror::Error)]
pub enum LexError {
    #[error("malformed number '{0}'")]
    MalformedNumber(String),
    #[error("unexpected character '{0}'")]
    UnexpectedCharacter(String),
    #[error("failed to read input: {0}")]
    Read(String),
}

lazy_static! {
    static ref IGNORE_RE: Regex = Regex::new(r"(?m)#.*$").unwrap();
    static ref TOKEN_RE: Regex = Regex::new(
        &[
            r"(?P<ident>[A-Za-z][A-Za-z0-9]*)",
            r"(?P<number>[0-9.]+)",
            r"(?P<char>\S)",
        ]
        .join("|")
    )
    .unwrap();
}

fn preprocess(input: &str) -> String {
    IGNORE_RE.replace_all(input, "").to_string()
}

fn keyword_or_ident(ident: &str) -> Token {
    match ident {
        "def" => Token::Def,
        "extern" => Token::Extern,
        "if" => Token::If,
        "then" => Token::Then,
        "else" => Token::Else,
        _ => Token::Ident(ident.to_string()),
    }
}

/// lex a chunk of source in order. A bad lexeme becomes an `Err` in place
/// and lexing carries on after it.
pub fn lex(input: &str) -> Vec<Result<Token, LexError>> {
    let preprocessed = preprocess(input);

    TOKEN_RE
        .captures_iter(&preprocessed)
        .map(|cap| {
            if let Some(ident) = cap.name("ident") {
                Ok(keyword_or_ident(ident.as_str()))
            } else if let Some(number) = cap.name("number") {
                number
                    .as_str()
                    .parse()
                    .map(Token::Number)
                    .map_err(|_| LexError::MalformedNumber(number.as_str().to_string()))
            } else {
                let lexeme = &cap[0];
                lexeme
                    .chars()
                    .next()
                    .filter(char::is_ascii)
                    .map(Token::Char)
                    .ok_or_else(|| LexError::UnexpectedCharacter(lexeme.to_string()))
            }
        })
        .collect()
}

/// Pulls source from a reader one line at a time. No lexeme spans a newline,
/// so this behaves like lexing the raw character stream.
pub struct Lexer<R> {
    reader: R,
    pending: VecDeque<Result<Token, LexError>>,
    at_eof: bool,
}

impl<R: BufRead> Lexer<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            pending: VecDeque::new(),
            at_eof: false,
        }
    }

    /// Returns `Token::Eof` forever once the reader is exhausted.
    pub fn next_token(&mut self) -> Result<Token, LexError> {
        loop {
            if let Some(token) = self.pending.pop_front() {
                return token;
            }
            if self.at_eof {
                return Ok(Token::Eof);
            }

            // a line that is not UTF-8 is one bad lexeme, not the end of input
            let mut line = Vec::new();
            match self.reader.read_until(b'\n', &mut line) {
                Ok(0) => self.at_eof = true,
                Ok(_) => match String::from_utf8(line) {
                    Ok(line) => self.pending.extend(lex(&line)),
                    Err(e) => return Err(LexError::Read(e.to_string())),
                },
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    self.at_eof = true;
                    return Err(LexError::Read(e.to_string()));
                }
            }
        }
    }
}
