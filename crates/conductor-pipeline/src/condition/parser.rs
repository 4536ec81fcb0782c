//! Recursive-descent parser producing an [`Expr`] tree.
//!
//! ```text
//! expression := or
//! or         := and ( OR and )*
//! and        := equality ( AND equality )*
//! equality   := comparison ( ( '!=' | '==' ) comparison )*
//! comparison := unary ( ( '>' | '>=' | '<' | '<=' | CONTAINS | MATCHES ) unary )*
//! unary      := '!' unary | primary
//! primary    := NUMBER | STRING | TRUE | FALSE | IDENTIFIER
//!             | IDENTIFIER '(' IDENTIFIER ')' | '(' expression ')'
//! ```

use conductor_types::Result;

use super::make_error;
use super::scanner::{Literal, Token, TokenKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Equal,
    NotEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Contains,
    Matches,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiteralValue {
    Bool(bool),
    Number(f64),
    Str(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Grouping(Box<Expr>),
    Literal(LiteralValue),
    /// Logical negation; `!` is the only unary operator.
    Unary(Box<Expr>),
    Variable(String),
    Call {
        function: String,
        argument: String,
    },
}

/// Parse a complete token stream. Trailing tokens are an error.
pub fn parse(tokens: &[Token]) -> Result<Expr> {
    let mut parser = Parser { tokens, current: 0 };
    let expr = parser.expression()?;
    if !parser.check(TokenKind::Eof) {
        let tok = parser.peek();
        return Err(make_error(&format!(
            "unexpected token '{}' at offset {}",
            tok.lexeme, tok.position
        )));
    }
    Ok(expr)
}

struct Parser<'t> {
    tokens: &'t [Token],
    current: usize,
}

impl<'t> Parser<'t> {
    fn expression(&mut self) -> Result<Expr> {
        self.or()
    }

    fn or(&mut self) -> Result<Expr> {
        let mut expr = self.and()?;
        while self.match_kind(&[TokenKind::Or]).is_some() {
            let right = self.and()?;
            expr = binary(expr, BinaryOp::Or, right);
        }
        Ok(expr)
    }

    fn and(&mut self) -> Result<Expr> {
        let mut expr = self.equality()?;
        while self.match_kind(&[TokenKind::And]).is_some() {
            let right = self.equality()?;
            expr = binary(expr, BinaryOp::And, right);
        }
        Ok(expr)
    }

    fn equality(&mut self) -> Result<Expr> {
        let mut expr = self.comparison()?;
        while let Some(kind) = self.match_kind(&[TokenKind::BangEqual, TokenKind::EqualEqual]) {
            let op = if kind == TokenKind::BangEqual {
                BinaryOp::NotEqual
            } else {
                BinaryOp::Equal
            };
            let right = self.comparison()?;
            expr = binary(expr, op, right);
        }
        Ok(expr)
    }

    fn comparison(&mut self) -> Result<Expr> {
        let mut expr = self.unary()?;
        while let Some(kind) = self.match_kind(&[
            TokenKind::Greater,
            TokenKind::GreaterEqual,
            TokenKind::Less,
            TokenKind::LessEqual,
            TokenKind::Contains,
            TokenKind::Matches,
        ]) {
            let op = match kind {
                TokenKind::Greater => BinaryOp::Greater,
                TokenKind::GreaterEqual => BinaryOp::GreaterEqual,
                TokenKind::Less => BinaryOp::Less,
                TokenKind::LessEqual => BinaryOp::LessEqual,
                TokenKind::Contains => BinaryOp::Contains,
                _ => BinaryOp::Matches,
            };
            let right = self.unary()?;
            expr = binary(expr, op, right);
        }
        Ok(expr)
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.match_kind(&[TokenKind::Bang]).is_some() {
            let right = self.unary()?;
            return Ok(Expr::Unary(Box::new(right)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr> {
        let token = self.advance().clone();
        match token.kind {
            TokenKind::True => Ok(Expr::Literal(LiteralValue::Bool(true))),
            TokenKind::False => Ok(Expr::Literal(LiteralValue::Bool(false))),
            TokenKind::Number => match token.literal {
                Some(Literal::Num(n)) => Ok(Expr::Literal(LiteralValue::Number(n))),
                _ => Err(make_error("number token without value")),
            },
            TokenKind::String => match token.literal {
                Some(Literal::Str(s)) => Ok(Expr::Literal(LiteralValue::Str(s))),
                _ => Err(make_error("string token without value")),
            },
            TokenKind::Identifier => {
                if self.match_kind(&[TokenKind::LeftParen]).is_some() {
                    let argument = self.consume(TokenKind::Identifier, "expected stage id")?;
                    self.consume(TokenKind::RightParen, "expected ')' after argument")?;
                    return Ok(Expr::Call {
                        function: token.lexeme,
                        argument: argument.lexeme,
                    });
                }
                Ok(Expr::Variable(token.lexeme))
            }
            TokenKind::LeftParen => {
                let inner = self.expression()?;
                self.consume(TokenKind::RightParen, "expected ')' after expression")?;
                Ok(Expr::Grouping(Box::new(inner)))
            }
            TokenKind::Eof => Err(make_error("unexpected end of expression")),
            _ => Err(make_error(&format!(
                "expected expression, found '{}' at offset {}",
                token.lexeme, token.position
            ))),
        }
    }

    // -- token helpers --

    fn match_kind(&mut self, kinds: &[TokenKind]) -> Option<TokenKind> {
        let kind = self.peek().kind;
        if kinds.contains(&kind) {
            self.advance();
            Some(kind)
        } else {
            None
        }
    }

    fn consume(&mut self, kind: TokenKind, msg: &str) -> Result<Token> {
        if self.check(kind) {
            return Ok(self.advance().clone());
        }
        let tok = self.peek();
        Err(make_error(&format!(
            "{msg}, found '{}' at offset {}",
            tok.lexeme, tok.position
        )))
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek().kind == kind
    }

    fn advance(&mut self) -> &Token {
        if !self.check(TokenKind::Eof) {
            self.current += 1;
            return &self.tokens[self.current - 1];
        }
        self.peek()
    }

    fn peek(&self) -> &Token {
        // The scanner always appends Eof, so the last token is a safe fallback.
        &self.tokens[self.current.min(self.tokens.len() - 1)]
    }
}

fn binary(left: Expr, op: BinaryOp, right: Expr) -> Expr {
    Expr::Binary {
        left: Box::new(left),
        op,
        right: Box::new(right),
    }
}
