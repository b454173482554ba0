use std::{collections::HashMap, io::BufRead};

use crate::{
    ast::{ASTNode, Expression, Function, Prototype},
    lexer::{LexError, Lexer, Token},
};

#[derive(Debug, PartialEq, Clone, thiserror::Error)]
pub enum ParserError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error("unknown token {0} when expecting an expression")]
    InvalidToken(Token),
    #[error("expected {expected}, found {found}")]
    Expected {
        expected: &'static str,
        found: Token,
    },
}

pub type PartialParseResult = Result<Expression, ParserError>;

/// `<` binds loosest, then additive, then multiplicative operators
pub fn default_precedence() -> HashMap<char, u32> {
    let mut operator_precedence = HashMap::new();
    operator_precedence.insert('<', 10);
    operator_precedence.insert('+', 20);
    operator_precedence.insert('-', 20);
    operator_precedence.insert('*', 40);
    operator_precedence.insert('/', 40);
    operator_precedence
}

/// Recursive descent parser with one token of lookahead. The lookahead is
/// only pulled from the lexer when something asks for it. A lex error sitting
/// in the lookahead only ends the expression in progress; it is reported by
/// whichever parse actually needs that token.
pub struct Parser<R> {
    lexer: Lexer<R>,
    current: Option<Result<Token, LexError>>,
    operator_precedence: HashMap<char, u32>,
}

impl<'a> Parser<&'a [u8]> {
    pub fn from_source(source: &'a str) -> Self {
        Parser::new(Lexer::new(source.as_bytes()))
    }
}

impl<R: BufRead> Parser<R> {
    pub fn new(lexer: Lexer<R>) -> Self {
        Self::with_precedence(lexer, default_precedence())
    }

    pub fn with_precedence(lexer: Lexer<R>, operator_precedence: HashMap<char, u32>) -> Self {
        Self {
            lexer,
            current: None,
            operator_precedence,
        }
    }

    fn peek(&mut self) -> Result<&Token, ParserError> {
        let current = match self.current.take() {
            Some(current) => current,
            None => self.lexer.next_token(),
        };
        match self.current.insert(current) {
            Ok(token) => Ok(token),
            Err(e) => Err(e.clone().into()),
        }
    }

    fn bump(&mut self) -> Result<Token, ParserError> {
        let current = match self.current.take() {
            Some(current) => current,
            None => self.lexer.next_token(),
        };
        Ok(current?)
    }

    fn expect(&mut self, token: Token, expected: &'static str) -> Result<(), ParserError> {
        let found = self.peek()?;
        if *found == token {
            self.bump()?;
            Ok(())
        } else {
            Err(ParserError::Expected {
                expected,
                found: found.clone(),
            })
        }
    }

    /// discard the token a failed parse stopped at
    pub fn skip_token(&mut self) -> Result<(), ParserError> {
        match self.current.take() {
            Some(_) => Ok(()),
            None => self.lexer.next_token().map(|_| ()).map_err(Into::into),
        }
    }

    fn token_precedence(&mut self) -> Option<(char, u32)> {
        let op = match self.peek() {
            Ok(Token::Char(op)) => *op,
            _ => return None,
        };
        self.operator_precedence.get(&op).map(|&pr| (op, pr))
    }

    fn parse_identifier(&mut self, ident: String) -> PartialParseResult {
        if !matches!(self.peek(), Ok(Token::Char('('))) {
            return Ok(Expression::Variable(ident));
        }
        self.bump()?;

        let mut args = Vec::new();
        if *self.peek()? != Token::Char(')') {
            loop {
                args.push(self.parse_expr()?);
                match self.peek()?.clone() {
                    Token::Char(')') => break,
                    Token::Char(',') => {
                        self.bump()?;
                    }
                    found => {
                        return Err(ParserError::Expected {
                            expected: "')' or ',' in argument list",
                            found,
                        })
                    }
                }
            }
        }
        self.bump()?;

        Ok(Expression::Call(ident, args))
    }

    fn parse_nested(&mut self) -> PartialParseResult {
        self.expect(Token::Char('('), "'('")?;
        let res = self.parse_expr()?;
        self.expect(Token::Char(')'), "')'")?;
        Ok(res)
    }

    fn parse_conditional(&mut self) -> PartialParseResult {
        self.expect(Token::If, "'if'")?;
        let condition = self.parse_expr()?;
        self.expect(Token::Then, "'then'")?;
        let then = self.parse_expr()?;
        self.expect(Token::Else, "'else'")?;
        let otherwise = self.parse_expr()?;

        Ok(Expression::Conditional {
            condition: Box::new(condition),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    fn parse_primary(&mut self) -> PartialParseResult {
        match self.peek()?.clone() {
            Token::Number(num) => {
                self.bump()?;
                Ok(Expression::Literal(num))
            }
            Token::Ident(ident) => {
                self.bump()?;
                self.parse_identifier(ident)
            }
            Token::Char('(') => self.parse_nested(),
            Token::If => self.parse_conditional(),
            tok => Err(ParserError::InvalidToken(tok)),
        }
    }

    /// Precedence climbing: fold operators binding at least as tight as
    /// `expr_precedence` onto `lhs`. An operator that binds tighter than the
    /// one just consumed pulls the right operand into its own subtree.
    fn parse_rhs(&mut self, expr_precedence: u32, lhs: Expression) -> PartialParseResult {
        let mut result = lhs;

        loop {
            let (operator, precedence) = match self.token_precedence() {
                Some((op, pr)) if pr >= expr_precedence => (op, pr),
                _ => return Ok(result),
            };
            self.bump()?;

            let mut rhs = self.parse_primary()?;

            if let Some((_, next_precedence)) = self.token_precedence() {
                if precedence < next_precedence {
                    rhs = self.parse_rhs(precedence + 1, rhs)?;
                }
            }

            result = Expression::Binary(operator, Box::new(result), Box::new(rhs));
        }
    }

    pub fn parse_expr(&mut self) -> PartialParseResult {
        let lhs = self.parse_primary()?;
        self.parse_rhs(0, lhs)
    }

    /// Parameters are plain identifiers; a single comma between two of them
    /// is tolerated.
    pub fn parse_prototype(&mut self) -> Result<Prototype, ParserError> {
        let name = match self.peek()?.clone() {
            Token::Ident(name) => {
                self.bump()?;
                name
            }
            found => {
                return Err(ParserError::Expected {
                    expected: "function name in prototype",
                    found,
                })
            }
        };
        self.expect(Token::Char('('), "'(' in prototype")?;

        let mut args = Vec::new();
        let mut after_comma = false;
        loop {
            match self.peek()?.clone() {
                Token::Ident(arg) => {
                    self.bump()?;
                    args.push(arg);
                    after_comma = false;
                }
                Token::Char(',') if !args.is_empty() && !after_comma => {
                    self.bump()?;
                    after_comma = true;
                }
                Token::Char(')') if !after_comma => {
                    self.bump()?;
                    break;
                }
                found => {
                    return Err(ParserError::Expected {
                        expected: "')' in prototype",
                        found,
                    })
                }
            }
        }

        Ok(Prototype { name, args })
    }

    pub fn parse_definition(&mut self) -> Result<Function, ParserError> {
        self.expect(Token::Def, "'def'")?;
        let prototype = self.parse_prototype()?;
        let body = self.parse_expr()?;
        Ok(Function { prototype, body })
    }

    pub fn parse_extern(&mut self) -> Result<Prototype, ParserError> {
        self.expect(Token::Extern, "'extern'")?;
        self.parse_prototype()
    }

    pub fn parse_top_level_expr(&mut self) -> Result<Function, ParserError> {
        let body = self.parse_expr()?;
        Ok(Function {
            prototype: Prototype::anonymous(),
            body,
        })
    }

    /// Parse the next top-level construct, or `None` at end of input. Stray
    /// `;` separators between constructs are skipped.
    pub fn parse_top_level(&mut self) -> Result<Option<ASTNode>, ParserError> {
        loop {
            let node = match self.peek()?.clone() {
                Token::Eof => return Ok(None),
                Token::Char(';') => {
                    self.bump()?;
                    continue;
                }
                Token::Def => ASTNode::Function(self.parse_definition()?),
                Token::Extern => ASTNode::Extern(self.parse_extern()?),
                _ => ASTNode::Expression(self.parse_top_level_expr()?),
            };
            return Ok(Some(node));
        }
    }
}

pub fn parse_str(source: &str) -> Result<Vec<ASTNode>, ParserError> {
    let mut parser = Parser::from_source(source);
    let mut ast = Vec::new();
    while let Some(node) = parser.parse_top_level()? {
        ast.push(node);
    }
    Ok(ast)
}
