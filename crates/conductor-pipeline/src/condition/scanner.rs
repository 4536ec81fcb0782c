//! Tokenizer for condition expressions.

use conductor_types::Result;

use super::make_error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    LeftParen,
    RightParen,
    Bang,
    BangEqual,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Identifier,
    String,
    Number,
    And,
    Or,
    True,
    False,
    Contains,
    Matches,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    /// Literal payload for strings (unquoted text) and numbers.
    pub literal: Option<Literal>,
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Num(f64),
}

/// Split `source` into tokens, terminated by a single [`TokenKind::Eof`].
pub fn scan(source: &str) -> Result<Vec<Token>> {
    Scanner::new(source).scan_tokens()
}

struct Scanner<'a> {
    source: &'a str,
    chars: Vec<(usize, char)>,
    tokens: Vec<Token>,
    start: usize,
    current: usize,
}

impl<'a> Scanner<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().collect(),
            tokens: Vec::new(),
            start: 0,
            current: 0,
        }
    }

    fn scan_tokens(mut self) -> Result<Vec<Token>> {
        while !self.is_at_end() {
            self.start = self.current;
            self.scan_token()?;
        }
        self.tokens.push(Token {
            kind: TokenKind::Eof,
            lexeme: String::new(),
            literal: None,
            position: self.source.len(),
        });
        Ok(self.tokens)
    }

    fn scan_token(&mut self) -> Result<()> {
        let c = self.advance();
        match c {
            '(' => self.add(TokenKind::LeftParen, None),
            ')' => self.add(TokenKind::RightParen, None),
            '!' => {
                let kind = if self.matches('=') {
                    TokenKind::BangEqual
                } else {
                    TokenKind::Bang
                };
                self.add(kind, None);
            }
            '=' => {
                if !self.matches('=') {
                    return Err(self.error("expected '==' but found '='"));
                }
                self.add(TokenKind::EqualEqual, None);
            }
            '>' => {
                let kind = if self.matches('=') {
                    TokenKind::GreaterEqual
                } else {
                    TokenKind::Greater
                };
                self.add(kind, None);
            }
            '<' => {
                let kind = if self.matches('=') {
                    TokenKind::LessEqual
                } else {
                    TokenKind::Less
                };
                self.add(kind, None);
            }
            '&' => {
                if !self.matches('&') {
                    return Err(self.error("expected '&&'"));
                }
                self.add(TokenKind::And, None);
            }
            '|' => {
                if !self.matches('|') {
                    return Err(self.error("expected '||'"));
                }
                self.add(TokenKind::Or, None);
            }
            '"' | '\'' => self.string(c)?,
            c if c.is_whitespace() => {}
            c if c.is_ascii_digit() => self.number()?,
            c if is_alpha(c) => self.identifier(),
            other => return Err(self.error(&format!("unexpected character '{other}'"))),
        }
        Ok(())
    }

    fn identifier(&mut self) {
        while is_alphanumeric(self.peek()) {
            self.advance();
        }
        let text = self.lexeme();
        let kind = match text.to_ascii_lowercase().as_str() {
            "and" => TokenKind::And,
            "or" => TokenKind::Or,
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "contains" => TokenKind::Contains,
            "matches" => TokenKind::Matches,
            _ => TokenKind::Identifier,
        };
        self.add(kind, None);
    }

    fn number(&mut self) -> Result<()> {
        while self.peek().is_ascii_digit() {
            self.advance();
        }
        if self.peek() == '.' && self.peek_next().is_ascii_digit() {
            self.advance();
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }
        let text = self.lexeme();
        let value: f64 = text
            .parse()
            .map_err(|_| self.error(&format!("invalid number '{text}'")))?;
        self.add(TokenKind::Number, Some(Literal::Num(value)));
        Ok(())
    }

    fn string(&mut self, quote: char) -> Result<()> {
        while self.peek() != quote && !self.is_at_end() {
            self.advance();
        }
        if self.is_at_end() {
            return Err(self.error("unterminated string"));
        }
        // closing quote
        self.advance();
        let text = self.lexeme();
        let value = text[1..text.len() - 1].to_string();
        self.add(TokenKind::String, Some(Literal::Str(value)));
        Ok(())
    }

    fn add(&mut self, kind: TokenKind, literal: Option<Literal>) {
        let lexeme = self.lexeme();
        let position = self.byte_offset(self.start);
        self.tokens.push(Token {
            kind,
            lexeme,
            literal,
            position,
        });
    }

    fn lexeme(&self) -> String {
        let from = self.byte_offset(self.start);
        let to = self.byte_offset(self.current);
        self.source[from..to].to_string()
    }

    fn byte_offset(&self, index: usize) -> usize {
        self.chars
            .get(index)
            .map(|(offset, _)| *offset)
            .unwrap_or(self.source.len())
    }

    fn matches(&mut self, expected: char) -> bool {
        if self.peek() != expected || self.is_at_end() {
            return false;
        }
        self.current += 1;
        true
    }

    fn advance(&mut self) -> char {
        let c = self.peek();
        self.current += 1;
        c
    }

    fn peek(&self) -> char {
        self.chars.get(self.current).map(|(_, c)| *c).unwrap_or('\0')
    }

    fn peek_next(&self) -> char {
        self.chars
            .get(self.current + 1)
            .map(|(_, c)| *c)
            .unwrap_or('\0')
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.chars.len()
    }

    fn error(&self, msg: &str) -> conductor_types::ConductorError {
        make_error(&format!("{msg} at offset {}", self.byte_offset(self.start)))
    }
}

fn is_alpha(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '.' || c == '-'
}

fn is_alphanumeric(c: char) -> bool {
    is_alpha(c) || c.is_ascii_digit()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        scan(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn operators_and_aliases() {
        assert_eq!(
            kinds("a && b || !c"),
            vec![
                TokenKind::Identifier,
                TokenKind::And,
                TokenKind::Identifier,
                TokenKind::Or,
                TokenKind::Bang,
                TokenKind::Identifier,
                TokenKind::Eof,
            ]
        );
        assert_eq!(
            kinds("x >= 1 != y <= 2 == z < 3 > 4"),
            vec![
                TokenKind::Identifier,
                TokenKind::GreaterEqual,
                TokenKind::Number,
                TokenKind::BangEqual,
                TokenKind::Identifier,
                TokenKind::LessEqual,
                TokenKind::Number,
                TokenKind::EqualEqual,
                TokenKind::Identifier,
                TokenKind::Less,
                TokenKind::Number,
                TokenKind::Greater,
                TokenKind::Number,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn keywords_are_case_insensitive() {
        assert_eq!(
            kinds("TRUE And false OR x CONTAINS 'y' Matches 'z'"),
            vec![
                TokenKind::True,
                TokenKind::And,
                TokenKind::False,
                TokenKind::Or,
                TokenKind::Identifier,
                TokenKind::Contains,
                TokenKind::String,
                TokenKind::Matches,
                TokenKind::String,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn identifiers_with_dots_and_dashes() {
        let tokens = scan("quality-check.metadata.score_2").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Identifier);
        assert_eq!(tokens[0].lexeme, "quality-check.metadata.score_2");
    }

    #[test]
    fn string_and_number_literals() {
        let tokens = scan(r#"'single' "double" 42 3.25"#).unwrap();
        assert_eq!(tokens[0].literal, Some(Literal::Str("single".into())));
        assert_eq!(tokens[1].literal, Some(Literal::Str("double".into())));
        assert_eq!(tokens[2].literal, Some(Literal::Num(42.0)));
        assert_eq!(tokens[3].literal, Some(Literal::Num(3.25)));
    }

    #[test]
    fn scan_errors() {
        assert!(scan("'open").is_err());
        assert!(scan("a = b").is_err());
        assert!(scan("a & b").is_err());
        assert!(scan("a | b").is_err());
        assert!(scan("a # b").is_err());
    }

    #[test]
    fn non_ascii_string_content() {
        let tokens = scan("x contains 'héllo'").unwrap();
        assert_eq!(tokens[2].literal, Some(Literal::Str("héllo".into())));
    }
}
