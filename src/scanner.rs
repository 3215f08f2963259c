//! Lexical analysis.
//!
//! Contains the [Scanner], which yields [Lexeme]s on demand, each of which
//! represents a [Token].
//!
//! # Example
//!
//! ```
//! use rlox::scanner::{Scanner, Token};
//! let mut scanner = Scanner::new("print 1 + 2;");
//! let mut tokens = Vec::new();
//! loop {
//!     let lexeme = scanner.scan_token();
//!     if lexeme.token() == Token::Eof {
//!         break;
//!     }
//!     tokens.push(lexeme.token());
//! }
//!
//! use Token::*;
//! assert_eq!(vec![Print, Number, Plus, Number, Semicolon], tokens);
//! ```
//!
//! # Note on terminology
//!
//! Crafting Interpreters' "Token"/"TokenType" map to [Lexeme]/[Token] here —
//! "Token" was too easily confused with "the type of a lexeme" in code that
//! needs both.

/// A lexeme from one contiguous span of source code.
#[derive(Clone, Copy, Debug)]
pub struct Lexeme<'a> {
    token: Token,
    text: &'a str,
    line: usize,
}

/// What _kind_ of [Lexeme] you have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[rustfmt::skip]
pub enum Token {
    // Single-character tokens.
    LeftParen, RightParen,
    LeftBrace, RightBrace,
    Comma, Dot, Minus, Plus,
    Semicolon, Star, Slash,
    // One or two character tokens.
    Bang, BangEqual,
    Equal, EqualEqual,
    Greater, GreaterEqual,
    Less, LessEqual,
    // Literals.
    Identifier, StrLiteral, Number,
    // Keywords.
    And, Class, Else, False,
    For, Fun, If, Nil, Or,
    Print, Return, Super, This,
    True, Var, While,

    // Others.
    Error, Eof,
}

/// Scans source code and yields [Lexeme]s one at a time.
///
/// The scanner is stateful and does a single pass over the source string.
/// Once the source is exhausted, it yields [Token::Eof] forever.
#[derive(Debug)]
pub struct Scanner<'a> {
    start: &'a str,
    current: &'a str,
    line: usize,
}

impl<'a> Scanner<'a> {
    /// Start scanning the given string of source code.
    pub fn new(source: &'a str) -> Self {
        Scanner {
            start: source,
            current: source,
            line: 1,
        }
    }

    /// Yield the next [Lexeme] from the string. Once end-of-file is
    /// reached, this always returns an end-of-file lexeme.
    pub fn scan_token(&mut self) -> Lexeme<'a> {
        self.skip_whitespace_and_comments();
        self.start = self.current;

        if self.is_at_end() {
            return self.make_lexeme(Token::Eof);
        }

        match self.advance() {
            c if is_id_start(c) => self.identifier(),
            c if c.is_ascii_digit() => self.number(),
            '(' => self.make_lexeme(Token::LeftParen),
            ')' => self.make_lexeme(Token::RightParen),
            '{' => self.make_lexeme(Token::LeftBrace),
            '}' => self.make_lexeme(Token::RightBrace),
            ';' => self.make_lexeme(Token::Semicolon),
            ',' => self.make_lexeme(Token::Comma),
            '.' => self.make_lexeme(Token::Dot),
            '-' => self.make_lexeme(Token::Minus),
            '+' => self.make_lexeme(Token::Plus),
            '/' => self.make_lexeme(Token::Slash),
            '*' => self.make_lexeme(Token::Star),
            '!' => {
                let followed_by_equal = self.match_and_advance('=');
                self.make_lexeme(if followed_by_equal {
                    Token::BangEqual
                } else {
                    Token::Bang
                })
            }
            '=' => {
                let followed_by_equal = self.match_and_advance('=');
                self.make_lexeme(if followed_by_equal {
                    Token::EqualEqual
                } else {
                    Token::Equal
                })
            }
            '<' => {
                let followed_by_equal = self.match_and_advance('=');
                self.make_lexeme(if followed_by_equal {
                    Token::LessEqual
                } else {
                    Token::Less
                })
            }
            '>' => {
                let followed_by_equal = self.match_and_advance('=');
                self.make_lexeme(if followed_by_equal {
                    Token::GreaterEqual
                } else {
                    Token::Greater
                })
            }
            '"' => self.string(),
            _ => self.error_token("Unexpected character"),
        }
    }

    /// Returns `true` if we've reached the end of the source code.
    pub fn is_at_end(&self) -> bool {
        self.current.is_empty()
    }

    /// Advances `self.current`. Returns the next char.
    ///
    /// # Panics
    ///
    /// If this is called at the end of the source.
    fn advance(&mut self) -> char {
        let c = self
            .current
            .chars()
            .next()
            .expect("called advance() at end of file");

        self.current = &self.current[c.len_utf8()..];
        c
    }

    /// Peek at the first char in `self.current`.
    fn peek(&self) -> char {
        self.current.chars().next().unwrap_or('\0')
    }

    /// Peek at the second char in `self.current`.
    fn peek_next(&self) -> char {
        let mut chars = self.current.chars();
        chars.next();
        chars.next().unwrap_or('\0')
    }

    /// If the next character matches `expected`, consumes it and returns
    /// `true`. Otherwise, leaves `self.current` untouched and returns `false`.
    fn match_and_advance(&mut self, expected: char) -> bool {
        if self.peek() != expected {
            return false;
        }
        self.current = &self.current[expected.len_utf8()..];
        true
    }

    /// Skips whitespace and `//` line comments.
    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                ' ' | '\r' | '\t' => {
                    self.advance();
                }
                '\n' => {
                    self.line += 1;
                    self.advance();
                }
                '/' if self.peek_next() == '/' => {
                    while self.peek() != '\n' && !self.is_at_end() {
                        self.advance();
                    }
                }
                _ => return,
            }
        }
    }

    /// Scan an identifier or keyword.
    fn identifier(&mut self) -> Lexeme<'a> {
        while is_id_continue(self.peek()) {
            self.advance();
        }
        self.make_lexeme(self.identifier_type())
    }

    /// Scan a string literal. Expects the starting quote to have been consumed.
    fn string(&mut self) -> Lexeme<'a> {
        while self.peek() != '"' && !self.is_at_end() {
            if self.peek() == '\n' {
                self.line += 1;
            }
            self.advance();
        }

        if self.is_at_end() {
            return self.error_token("Unterminated string");
        }

        self.advance(); // closing quote
        self.make_lexeme(Token::StrLiteral)
    }

    /// Scan a number literal. Expects the first digit to have already been consumed.
    fn number(&mut self) -> Lexeme<'a> {
        while self.peek().is_ascii_digit() {
            self.advance();
        }

        if self.peek() == '.' && self.peek_next().is_ascii_digit() {
            self.advance(); // the '.'
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }

        self.make_lexeme(Token::Number)
    }

    /// Check whether the lexeme just scanned is a keyword or a plain identifier.
    fn identifier_type(&self) -> Token {
        let mut chars = self.start.chars();
        match chars.next().unwrap_or('\0') {
            'a' => self.check_keyword("and", Token::And),
            'c' => self.check_keyword("class", Token::Class),
            'e' => self.check_keyword("else", Token::Else),
            'f' => match chars.next().unwrap_or('\0') {
                'a' => self.check_keyword("false", Token::False),
                'o' => self.check_keyword("for", Token::For),
                'u' => self.check_keyword("fun", Token::Fun),
                _ => Token::Identifier,
            },
            'i' => self.check_keyword("if", Token::If),
            'n' => self.check_keyword("nil", Token::Nil),
            'o' => self.check_keyword("or", Token::Or),
            'p' => self.check_keyword("print", Token::Print),
            'r' => self.check_keyword("return", Token::Return),
            's' => self.check_keyword("super", Token::Super),
            't' => match chars.next().unwrap_or('\0') {
                'h' => self.check_keyword("this", Token::This),
                'r' => self.check_keyword("true", Token::True),
                _ => Token::Identifier,
            },
            'v' => self.check_keyword("var", Token::Var),
            'w' => self.check_keyword("while", Token::While),
            _ => Token::Identifier,
        }
    }

    fn check_keyword(&self, keyword_text: &'static str, keyword: Token) -> Token {
        let token_length = self.start.len() - self.current.len();
        let lexeme = &self.start[..token_length];

        if lexeme == keyword_text {
            keyword
        } else {
            Token::Identifier
        }
    }

    fn error_token(&self, message: &'a str) -> Lexeme<'a> {
        Lexeme {
            token: Token::Error,
            text: message,
            line: self.line,
        }
    }

    /// Returns a [Lexeme] from the span between `self.start` and `self.current`.
    fn make_lexeme(&self, token: Token) -> Lexeme<'a> {
        let extent = self.start.len() - self.current.len();
        let text = &self.start[..extent];

        Lexeme {
            token,
            text,
            line: self.line,
        }
    }
}

impl<'a> Lexeme<'a> {
    /// A placeholder lexeme, used to seed `Parser::previous` before any real
    /// token has been scanned.
    pub fn placeholder(message: &'a str) -> Lexeme<'a> {
        Lexeme {
            token: Token::Error,
            text: message,
            line: 0,
        }
    }

    /// Returns the line number this lexeme was found on.
    pub fn line(&self) -> usize {
        self.line
    }

    /// Returns the literal text of this lexeme. For string literals, this
    /// always includes the quotes (they're stripped only by the compiler,
    /// per §4.2).
    pub fn text(&self) -> &'a str {
        self.text
    }

    /// Returns the [Token] kind of this lexeme.
    pub fn token(&self) -> Token {
        self.token
    }
}

/// Returns true if this char can start an identifier or keyword.
fn is_id_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

/// Returns true if this char can continue an identifier or keyword.
fn is_id_continue(c: char) -> bool {
    is_id_start(c) || c.is_ascii_digit()
}

#[cfg(test)]
mod test {
    use super::*;

    fn all_tokens(source: &str) -> Vec<Token> {
        let mut scanner = Scanner::new(source);
        let mut tokens = Vec::new();
        loop {
            let lexeme = scanner.scan_token();
            let token = lexeme.token();
            if token == Token::Eof {
                break;
            }
            tokens.push(token);
        }
        tokens
    }

    #[test]
    fn scanning_every_keyword() {
        use Token::*;

        let source_code = "class classic {
            fun fund() {
                if (ifree and anders or orvile) {
                    print printer;
                } else {
                    for (former = 0; former < 10; former = former + 1) {
                    nill = nil;
                    }
                    super.falseFlag = truede;
                    this.thistle = true;
                    superMario = false or true;
                    return returned;
                }
                var varied;
                while (whileLoop) {
                    0;
                }
            }
        }";

        #[rustfmt::skip]
        let expected_tokens = vec![
            Class, Identifier, LeftBrace,
                Fun, Identifier, LeftParen, RightParen, LeftBrace,
                    If, LeftParen, Identifier, And, Identifier, Or, Identifier, RightParen, LeftBrace,
                        Print, Identifier, Semicolon,
                    RightBrace, Else, LeftBrace,
                        For, LeftParen, Identifier, Equal, Number, Semicolon, Identifier, Less, Number, Semicolon, Identifier, Equal, Identifier, Plus, Number, RightParen, LeftBrace,
                            Identifier, Equal, Nil, Semicolon,
                        RightBrace,
                        Super, Dot, Identifier, Equal, Identifier, Semicolon,
                        This, Dot, Identifier, Equal,
                        True, Semicolon, Identifier, Equal, False, Or, True, Semicolon,
                        Return, Identifier, Semicolon,
                    RightBrace,
                    Var, Identifier, Semicolon,
                    While, LeftParen, Identifier, RightParen, LeftBrace,
                        Number, Semicolon,
                    RightBrace,
                RightBrace,
            RightBrace,
        ];

        assert_eq!(expected_tokens, all_tokens(source_code));
    }

    #[test]
    fn line_comments_are_skipped() {
        let tokens = all_tokens("// a comment\nprint 1; // trailing\n");
        assert_eq!(vec![Token::Print, Token::Number, Token::Semicolon], tokens);
    }

    #[test]
    fn unterminated_string_is_an_error_token() {
        let mut scanner = Scanner::new("\"unterminated");
        assert_eq!(Token::Error, scanner.scan_token().token());
    }

    #[test]
    fn number_with_fraction() {
        let mut scanner = Scanner::new("3.14");
        let lexeme = scanner.scan_token();
        assert_eq!(Token::Number, lexeme.token());
        assert_eq!("3.14", lexeme.text());
    }

    #[test]
    fn string_lexeme_keeps_quotes() {
        let mut scanner = Scanner::new("\"hi\"");
        let lexeme = scanner.scan_token();
        assert_eq!(Token::StrLiteral, lexeme.token());
        assert_eq!("\"hi\"", lexeme.text());
    }

    #[test]
    fn unknown_byte_is_an_error_token() {
        let mut scanner = Scanner::new("@");
        assert_eq!(Token::Error, scanner.scan_token().token());
    }

    #[test]
    fn line_numbers_track_newlines() {
        let mut scanner = Scanner::new("1\n2\n3");
        assert_eq!(1, scanner.scan_token().line());
        assert_eq!(2, scanner.scan_token().line());
        assert_eq!(3, scanner.scan_token().line());
    }
}
