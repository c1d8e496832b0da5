//! Pull-based tokenizer with one-token lookahead.
//!
//! The lexer turns one source chunk into a stream of [`Token`]s via
//! [`Lexer::peek`] and [`Lexer::dequeue`]. Newlines are significant (they
//! produce end-of-line tokens and advance the 1-based line counter), `;` is
//! an end-of-line that does not advance the counter, and a synthetic EOL is
//! returned forever once the input is exhausted.

use crate::error::{Error, Result};

/// Reserved words. All of these lex as [`TokenKind::Keyword`].
const KEYWORDS: &[&str] = &[
    "break", "continue", "else", "end", "for", "function", "if", "in", "isa", "new", "null",
    "then", "repeat", "return", "while", "and", "or", "not", "true", "false",
];

pub fn is_keyword(word: &str) -> bool {
    KEYWORDS.contains(&word)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Unknown,
    Keyword,
    Number,
    Str,
    Identifier,
    OpAssign,
    OpPlus,
    OpMinus,
    OpTimes,
    OpDivide,
    OpMod,
    OpPower,
    OpEqual,
    OpNotEqual,
    OpGreater,
    OpGreatEqual,
    OpLesser,
    OpLessEqual,
    AddressOf,
    Comma,
    Colon,
    Dot,
    LParen,
    RParen,
    LSquare,
    RSquare,
    LCurly,
    RCurly,
    EOL,
}

/// One token: kind, text, and whether whitespace preceded it.
///
/// For string tokens, `text` is the decoded content (doubled `""` already
/// collapsed). For everything else it is the raw lexeme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub after_space: bool,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>, after_space: bool) -> Self {
        Self {
            kind,
            text: text.into(),
            after_space,
        }
    }

    pub fn eol(after_space: bool) -> Self {
        Self::new(TokenKind::EOL, "\n", after_space)
    }

    pub fn is_keyword(&self, word: &str) -> bool {
        self.kind == TokenKind::Keyword && self.text == word
    }
}

fn is_identifier_start(c: char) -> bool {
    c == '_' || c.is_ascii_alphabetic() || (c as u32) > 0x9F
}

fn is_identifier_char(c: char) -> bool {
    c == '_' || c.is_ascii_alphanumeric() || (c as u32) > 0x9F
}

/// The tokenizer. Construct one per source chunk; line numbers are 1-based.
pub struct Lexer {
    chars: Vec<char>,
    position: usize,
    line_num: u32,
    pending: Option<Token>,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Self {
            chars: input.chars().collect(),
            position: 0,
            line_num: 1,
            pending: None,
        }
    }

    pub fn line_num(&self) -> u32 {
        self.line_num
    }

    /// True once the input is exhausted and no real token is buffered.
    pub fn at_end(&self) -> bool {
        self.position >= self.chars.len()
            && self.pending.as_ref().is_none_or(|t| t.kind == TokenKind::EOL)
    }

    /// Look at the next token without consuming it.
    pub fn peek(&mut self) -> Result<Token> {
        if self.pending.is_none() {
            let tok = self.read_token()?;
            self.pending = Some(tok);
        }
        Ok(self.pending.clone().unwrap())
    }

    /// Consume and return the next token.
    pub fn dequeue(&mut self) -> Result<Token> {
        match self.pending.take() {
            Some(tok) => Ok(tok),
            None => self.read_token(),
        }
    }

    fn read_token(&mut self) -> Result<Token> {
        let mut after_space = false;
        loop {
            while self
                .chars
                .get(self.position)
                .is_some_and(|c| *c == ' ' || *c == '\t')
            {
                self.position += 1;
                after_space = true;
            }
            if self.position >= self.chars.len() {
                return Ok(Token::eol(after_space));
            }
            // a comment runs to end of line and is consumed silently
            if self.chars[self.position] == '/' && self.chars.get(self.position + 1) == Some(&'/') {
                while self
                    .chars
                    .get(self.position)
                    .is_some_and(|c| *c != '\r' && *c != '\n')
                {
                    self.position += 1;
                }
                after_space = true;
                continue;
            }
            break;
        }

        let c = self.chars[self.position];
        let next = self.chars.get(self.position + 1).copied();

        // End-of-line: CR, LF, CRLF, or ';' (which keeps the line count).
        match c {
            '\r' => {
                self.position += 1;
                if self.chars.get(self.position) == Some(&'\n') {
                    self.position += 1;
                }
                self.line_num += 1;
                return Ok(Token::eol(after_space));
            }
            '\n' => {
                self.position += 1;
                self.line_num += 1;
                return Ok(Token::eol(after_space));
            }
            ';' => {
                self.position += 1;
                return Ok(Token::eol(after_space));
            }
            _ => {}
        }

        // Two-character operators before their one-character prefixes.
        if next == Some('=') {
            let kind = match c {
                '=' => Some(TokenKind::OpEqual),
                '!' => Some(TokenKind::OpNotEqual),
                '>' => Some(TokenKind::OpGreatEqual),
                '<' => Some(TokenKind::OpLessEqual),
                _ => None,
            };
            if let Some(kind) = kind {
                self.position += 2;
                return Ok(Token::new(kind, format!("{}=", c), after_space));
            }
        }

        let single = match c {
            '=' => Some(TokenKind::OpAssign),
            '+' => Some(TokenKind::OpPlus),
            '-' => Some(TokenKind::OpMinus),
            '*' => Some(TokenKind::OpTimes),
            '/' => Some(TokenKind::OpDivide),
            '%' => Some(TokenKind::OpMod),
            '^' => Some(TokenKind::OpPower),
            '>' => Some(TokenKind::OpGreater),
            '<' => Some(TokenKind::OpLesser),
            '@' => Some(TokenKind::AddressOf),
            ',' => Some(TokenKind::Comma),
            ':' => Some(TokenKind::Colon),
            '(' => Some(TokenKind::LParen),
            ')' => Some(TokenKind::RParen),
            '[' => Some(TokenKind::LSquare),
            ']' => Some(TokenKind::RSquare),
            '{' => Some(TokenKind::LCurly),
            '}' => Some(TokenKind::RCurly),
            _ => None,
        };
        if let Some(kind) = single {
            self.position += 1;
            return Ok(Token::new(kind, c.to_string(), after_space));
        }

        if c == '"' {
            return self.read_string(after_space);
        }

        // Numbers, including a leading '.' when a digit follows.
        if c.is_ascii_digit() || (c == '.' && next.is_some_and(|n| n.is_ascii_digit())) {
            return Ok(self.read_number(after_space));
        }
        if c == '.' {
            self.position += 1;
            return Ok(Token::new(TokenKind::Dot, ".", after_space));
        }

        if is_identifier_start(c) {
            return self.read_word(after_space);
        }

        self.position += 1;
        Ok(Token::new(TokenKind::Unknown, c.to_string(), after_space))
    }

    fn read_string(&mut self, after_space: bool) -> Result<Token> {
        self.position += 1; // opening quote
        let mut text = String::new();
        loop {
            let Some(&c) = self.chars.get(self.position) else {
                return Err(Error::lexer("missing closing quote in string literal"));
            };
            self.position += 1;
            if c == '"' {
                // a doubled quote encodes a single one
                if self.chars.get(self.position) == Some(&'"') {
                    text.push('"');
                    self.position += 1;
                } else {
                    break;
                }
            } else {
                if c == '\n' {
                    self.line_num += 1;
                }
                text.push(c);
            }
        }
        Ok(Token::new(TokenKind::Str, text, after_space))
    }

    fn read_number(&mut self, after_space: bool) -> Token {
        let start = self.position;
        while self
            .chars
            .get(self.position)
            .is_some_and(|c| c.is_ascii_digit())
        {
            self.position += 1;
        }
        if self.chars.get(self.position) == Some(&'.')
            && self
                .chars
                .get(self.position + 1)
                .is_some_and(|c| c.is_ascii_digit())
        {
            self.position += 1;
            while self
                .chars
                .get(self.position)
                .is_some_and(|c| c.is_ascii_digit())
            {
                self.position += 1;
            }
        }
        if self
            .chars
            .get(self.position)
            .is_some_and(|c| *c == 'e' || *c == 'E')
        {
            let mut probe = self.position + 1;
            if self
                .chars
                .get(probe)
                .is_some_and(|c| *c == '+' || *c == '-')
            {
                probe += 1;
            }
            if self.chars.get(probe).is_some_and(|c| c.is_ascii_digit()) {
                self.position = probe;
                while self
                    .chars
                    .get(self.position)
                    .is_some_and(|c| c.is_ascii_digit())
                {
                    self.position += 1;
                }
            }
        }
        let text: String = self.chars[start..self.position].iter().collect();
        Token::new(TokenKind::Number, text, after_space)
    }

    fn read_word(&mut self, after_space: bool) -> Result<Token> {
        let start = self.position;
        while self
            .chars
            .get(self.position)
            .is_some_and(|c| is_identifier_char(*c))
        {
            self.position += 1;
        }
        let mut text: String = self.chars[start..self.position].iter().collect();

        if !is_keyword(&text) {
            return Ok(Token::new(TokenKind::Identifier, text, after_space));
        }

        if text == "end" {
            // "end" must conjoin with the keyword that follows it
            let save = self.position;
            while self
                .chars
                .get(self.position)
                .is_some_and(|c| *c == ' ' || *c == '\t')
            {
                self.position += 1;
            }
            let word_start = self.position;
            while self
                .chars
                .get(self.position)
                .is_some_and(|c| is_identifier_char(*c))
            {
                self.position += 1;
            }
            let word: String = self.chars[word_start..self.position].iter().collect();
            if word.is_empty() || !is_keyword(&word) {
                self.position = save;
                return Err(Error::lexer(format!(
                    "'end' without matching keyword ('{}')",
                    word
                )));
            }
            text = format!("end {}", word);
        } else if text == "else" {
            // "else if" conjoins when "if" follows as a whole word
            let save = self.position;
            while self
                .chars
                .get(self.position)
                .is_some_and(|c| *c == ' ' || *c == '\t')
            {
                self.position += 1;
            }
            let word_start = self.position;
            while self
                .chars
                .get(self.position)
                .is_some_and(|c| is_identifier_char(*c))
            {
                self.position += 1;
            }
            let word: String = self.chars[word_start..self.position].iter().collect();
            if word == "if" {
                text = "else if".to_string();
            } else {
                self.position = save;
            }
        }

        Ok(Token::new(TokenKind::Keyword, text, after_space))
    }

    // -----------------------------------------------------------------------
    // Static helpers for the REPL driver
    // -----------------------------------------------------------------------

    /// The last meaningful (non-EOL) token of a source chunk, used to decide
    /// whether an interactive line continues onto the next one. Best-effort:
    /// lex errors end the scan with whatever was seen so far.
    pub fn last_token(source: &str) -> Token {
        let mut lexer = Lexer::new(source);
        let mut last = Token::eol(false);
        while !lexer.at_end() {
            match lexer.dequeue() {
                Ok(tok) => {
                    if tok.kind != TokenKind::EOL {
                        last = tok;
                    }
                }
                Err(_) => break,
            }
        }
        last
    }

    /// Byte offset where an end-of-line comment starts, if any, respecting
    /// string literals (`//` inside a string is not a comment).
    pub fn comment_start(line: &str) -> Option<usize> {
        let mut in_string = false;
        let mut prev_slash_at: Option<usize> = None;
        for (i, c) in line.char_indices() {
            if c == '"' {
                in_string = !in_string;
                prev_slash_at = None;
            } else if c == '/' && !in_string {
                if let Some(start) = prev_slash_at {
                    return Some(start);
                }
                prev_slash_at = Some(i);
            } else {
                prev_slash_at = None;
            }
        }
        None
    }

    /// Strip a trailing comment from one line of source.
    pub fn trim_comment(line: &str) -> &str {
        match Self::comment_start(line) {
            Some(i) => &line[..i],
            None => line,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn kinds(source: &str) -> Vec<(TokenKind, String)> {
        let mut lexer = Lexer::new(source);
        let mut out = Vec::new();
        while !lexer.at_end() {
            let tok = lexer.dequeue().unwrap();
            out.push((tok.kind, tok.text));
        }
        out
    }

    #[test]
    fn test_basic_tokens() {
        let toks = kinds("42 * 3.14158");
        assert_eq!(
            toks,
            vec![
                (TokenKind::Number, "42".to_string()),
                (TokenKind::OpTimes, "*".to_string()),
                (TokenKind::Number, "3.14158".to_string()),
            ]
        );
        let mut lexer = Lexer::new("42 * 3.14158");
        while !lexer.at_end() {
            lexer.dequeue().unwrap();
        }
        assert_eq!(lexer.line_num(), 1);
    }

    #[test]
    fn test_conjoined_keywords_and_comment() {
        let toks = kinds("6*(.1-foo) end if // and a comment");
        // the comment is consumed silently, leaving "end if" and the EOL
        assert_eq!(toks[toks.len() - 1].0, TokenKind::EOL);
        assert_eq!(
            toks[toks.len() - 2],
            (TokenKind::Keyword, "end if".to_string())
        );
        assert!(toks.contains(&(TokenKind::Number, ".1".to_string())));
    }

    #[test]
    fn test_else_if_conjoins_only_on_whole_word() {
        let toks = kinds("else if x");
        assert_eq!(toks[0], (TokenKind::Keyword, "else if".to_string()));
        let toks = kinds("else iffy");
        assert_eq!(toks[0], (TokenKind::Keyword, "else".to_string()));
        assert_eq!(toks[1], (TokenKind::Identifier, "iffy".to_string()));
    }

    #[test]
    fn test_bare_end_fails() {
        let mut lexer = Lexer::new("end");
        assert!(lexer.dequeue().is_err());
    }

    #[test]
    fn test_doubled_quotes() {
        let toks = kinds(r#""isn't ""real""""#);
        assert_eq!(toks, vec![(TokenKind::Str, "isn't \"real\"".to_string())]);
    }

    #[test]
    fn test_unterminated_string() {
        let mut lexer = Lexer::new("\"oops");
        let err = lexer.dequeue().unwrap_err();
        assert!(err.to_string().starts_with("Lexer Error"));
    }

    #[test]
    fn test_semicolon_is_eol_without_line_count() {
        let mut lexer = Lexer::new("a;b\nc");
        assert_eq!(lexer.dequeue().unwrap().text, "a");
        assert_eq!(lexer.dequeue().unwrap().kind, TokenKind::EOL);
        assert_eq!(lexer.line_num(), 1);
        assert_eq!(lexer.dequeue().unwrap().text, "b");
        assert_eq!(lexer.dequeue().unwrap().kind, TokenKind::EOL);
        assert_eq!(lexer.line_num(), 2);
        assert_eq!(lexer.dequeue().unwrap().text, "c");
    }

    #[test]
    fn test_two_char_operators() {
        let toks = kinds("a >= b == c");
        assert_eq!(toks[1].0, TokenKind::OpGreatEqual);
        assert_eq!(toks[3].0, TokenKind::OpEqual);
    }

    #[test]
    fn test_comment_inside_string_is_text() {
        let toks = kinds(r#"x = "https://example" // real comment"#);
        assert!(toks.contains(&(TokenKind::Str, "https://example".to_string())));
        assert_eq!(Lexer::comment_start(r#""no // here""#), None);
        assert_eq!(Lexer::comment_start("x = 1 // yes"), Some(6));
        assert_eq!(Lexer::trim_comment("x = 1 // yes"), "x = 1 ");
    }

    #[test]
    fn test_last_token() {
        assert_eq!(Lexer::last_token("x = [1,").kind, TokenKind::Comma);
        assert_eq!(Lexer::last_token("x = 1 + ").kind, TokenKind::OpPlus);
        assert_eq!(Lexer::last_token("x = 1").kind, TokenKind::Number);
        assert_eq!(Lexer::last_token("print y // trailing").kind, TokenKind::Identifier);
    }

    #[test]
    fn test_unicode_identifiers() {
        let toks = kinds("π = 3");
        assert_eq!(toks[0], (TokenKind::Identifier, "π".to_string()));
    }
}
