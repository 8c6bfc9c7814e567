//! Hand-written lexer for the C-family Quince syntax

use crate::error::SyntaxError;
use crate::token::{Token, TokenType};

pub struct Lexer {
    source: Vec<char>,
    pos: usize,
    line: u32,
    column: u32,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    pub fn next_token(&mut self) -> Result<Token, SyntaxError> {
        self.skip_whitespace_and_comments()?;

        let line = self.line;
        let column = self.column;

        let c = match self.peek() {
            Some(c) => c,
            None => return Ok(Token::new(TokenType::Eof, "", line, column)),
        };

        if c.is_ascii_digit() {
            return self.read_number(line, column);
        }
        if c.is_alphabetic() || c == '_' {
            return Ok(self.read_identifier(line, column));
        }
        if c == '"' {
            return self.read_string(line, column);
        }

        self.advance();
        let make = |t: TokenType, v: &str| Ok(Token::new(t, v, line, column));
        match c {
            '+' => make(TokenType::Plus, "+"),
            '-' => make(TokenType::Minus, "-"),
            '*' => make(TokenType::Star, "*"),
            '/' => make(TokenType::Slash, "/"),
            '%' => make(TokenType::Percent, "%"),
            '^' => make(TokenType::Caret, "^"),
            '?' => make(TokenType::Question, "?"),
            '(' => make(TokenType::LParen, "("),
            ')' => make(TokenType::RParen, ")"),
            '{' => make(TokenType::LBrace, "{"),
            '}' => make(TokenType::RBrace, "}"),
            '[' => make(TokenType::LBracket, "["),
            ']' => make(TokenType::RBracket, "]"),
            ',' => make(TokenType::Comma, ","),
            '.' => make(TokenType::Dot, "."),
            ':' => make(TokenType::Colon, ":"),
            ';' => make(TokenType::Semicolon, ";"),
            '=' => {
                if self.match_char('=') {
                    make(TokenType::Eq, "==")
                } else {
                    make(TokenType::Assign, "=")
                }
            }
            '!' => {
                if self.match_char('=') {
                    make(TokenType::Ne, "!=")
                } else {
                    make(TokenType::Not, "!")
                }
            }
            '<' => {
                if self.match_char('=') {
                    make(TokenType::Le, "<=")
                } else {
                    make(TokenType::Lt, "<")
                }
            }
            '>' => {
                if self.match_char('=') {
                    make(TokenType::Ge, ">=")
                } else {
                    make(TokenType::Gt, ">")
                }
            }
            _ => Err(SyntaxError::new(
                format!("Unexpected character '{}'", c),
                line,
                column,
            )),
        }
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), SyntaxError> {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.advance();
                }
                Some('/') if self.peek_next() == Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                Some('/') if self.peek_next() == Some('*') => {
                    let (line, column) = (self.line, self.column);
                    self.advance();
                    self.advance();
                    loop {
                        match self.peek() {
                            Some('*') if self.peek_next() == Some('/') => {
                                self.advance();
                                self.advance();
                                break;
                            }
                            Some(_) => {
                                self.advance();
                            }
                            None => {
                                return Err(SyntaxError::new(
                                    "Unterminated block comment",
                                    line,
                                    column,
                                ))
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn read_number(&mut self, line: u32, column: u32) -> Result<Token, SyntaxError> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
        }
        if self.peek() == Some('.') && self.peek_next().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.advance();
            }
        }
        // Scientific notation: 1e9, 2.5e-3
        if self.peek().is_some_and(|c| c == 'e' || c == 'E') {
            let after_e = self.peek_next();
            let digits_follow = match after_e {
                Some(c) if c.is_ascii_digit() => true,
                Some('+') | Some('-') => self
                    .source
                    .get(self.pos + 2)
                    .is_some_and(|c| c.is_ascii_digit()),
                _ => false,
            };
            if digits_follow {
                self.advance();
                if self.peek() == Some('+') || self.peek() == Some('-') {
                    self.advance();
                }
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.advance();
                }
            }
        }
        let text: String = self.source[start..self.pos].iter().collect();
        if text.parse::<f64>().is_err() {
            return Err(SyntaxError::new(
                format!("Invalid number literal '{}'", text),
                line,
                column,
            ));
        }
        Ok(Token::new(TokenType::Number, text, line, column))
    }

    fn read_identifier(&mut self, line: u32, column: u32) -> Token {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || c == '_')
        {
            self.advance();
        }
        let text: String = self.source[start..self.pos].iter().collect();
        let token_type = match text.as_str() {
            "fun" => TokenType::Fun,
            "if" => TokenType::If,
            "else" => TokenType::Else,
            "while" => TokenType::While,
            "for" => TokenType::For,
            "in" => TokenType::In,
            "return" => TokenType::Return,
            "true" => TokenType::True,
            "false" => TokenType::False,
            "nil" => TokenType::Nil,
            "import" => TokenType::Import,
            "from" => TokenType::From,
            "export" => TokenType::Export,
            "var" => TokenType::Var,
            "class" => TokenType::Class,
            "this" => TokenType::This,
            "strict" => TokenType::Strict,
            "and" => TokenType::And,
            "or" => TokenType::Or,
            "not" => TokenType::Not,
            _ => TokenType::Identifier,
        };
        Token::new(token_type, text, line, column)
    }

    fn read_string(&mut self, line: u32, column: u32) -> Result<Token, SyntaxError> {
        self.advance(); // opening quote
        let mut value = String::new();
        loop {
            match self.peek() {
                None => return Err(SyntaxError::new("Unterminated string", line, column)),
                Some('"') => {
                    self.advance();
                    break;
                }
                Some('\\') => {
                    self.advance();
                    let escaped = match self.peek() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some('"') => '"',
                        Some('\\') => '\\',
                        Some('0') => '\0',
                        Some(c) => {
                            return Err(SyntaxError::new(
                                format!("Invalid escape sequence '\\{}'", c),
                                self.line,
                                self.column,
                            ))
                        }
                        None => return Err(SyntaxError::new("Unterminated string", line, column)),
                    };
                    value.push(escaped);
                    self.advance();
                }
                Some(c) => {
                    value.push(c);
                    self.advance();
                }
            }
        }
        Ok(Token::new(TokenType::Str, value, line, column))
    }

    fn peek(&self) -> Option<char> {
        self.source.get(self.pos).copied()
    }

    fn peek_next(&self) -> Option<char> {
        self.source.get(self.pos + 1).copied()
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.source.get(self.pos).copied();
        if let Some(c) = c {
            self.pos += 1;
            if c == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        c
    }
}
