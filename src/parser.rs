// src/parser.rs
use serde_json::Value;

use crate::errors::{IslError, Position};

/// Character cursor over script source with line/column tracking.
pub struct Parser<'a> {
    s: &'a str,
    i: usize,
    file: &'a str,
}

impl<'a> Parser<'a> {
    pub fn new(s: &'a str) -> Self {
        Self::with_file(s, "")
    }

    pub fn with_file(s: &'a str, file: &'a str) -> Self {
        Self { s, i: 0, file }
    }

    pub fn source(&self) -> &'a str {
        self.s
    }

    /// 1-based line, 0-based column of the cursor.
    pub fn position(&self) -> Position {
        let before = &self.s[..self.i];
        let line = before.matches('\n').count() + 1;
        let column = before.rsplit('\n').next().map_or(0, |l| l.chars().count());
        Position::new(self.file, line, column)
    }

    pub fn error(&self, message: impl Into<String>) -> IslError {
        IslError::Parse {
            message: message.into(),
            position: self.position(),
        }
    }

    pub fn parse_identifier(&mut self) -> Result<String, IslError> {
        let start = self.i;
        while let Some(c) = self.peek_char() {
            if c == '_' || c.is_ascii_alphanumeric() {
                self.i += 1;
            } else {
                break;
            }
        }
        if self.i == start {
            return Err(self.error("identifier expected"));
        }
        Ok(self.s[start..self.i].to_string())
    }

    /// `$name`, returned with its `$`.
    pub fn parse_variable(&mut self) -> Result<String, IslError> {
        if !self.consume_char('$') {
            return Err(self.error("variable expected"));
        }
        Ok(format!("${}", self.parse_identifier()?))
    }

    pub fn parse_number_literal(&mut self) -> Result<Value, IslError> {
        let start = self.i;
        if self.peek_char() == Some('-') {
            self.i += 1;
        }
        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                self.i += 1;
            } else {
                break;
            }
        }
        if self.peek_char() == Some('.') && self.peek_nth(1).is_some_and(|c| c.is_ascii_digit()) {
            self.i += 1;
            while let Some(c) = self.peek_char() {
                if c.is_ascii_digit() {
                    self.i += 1;
                } else {
                    break;
                }
            }
        }
        let s = &self.s[start..self.i];
        if s.is_empty() || s == "-" {
            return Err(self.error("number expected"));
        }
        if s.contains('.') {
            let f: f64 = s.parse().map_err(|_| self.error("bad float"))?;
            Ok(Value::from(f))
        } else {
            let i: i64 = s.parse().map_err(|_| self.error("bad int"))?;
            Ok(Value::from(i))
        }
    }

    pub fn parse_quoted_string(&mut self) -> Result<String, IslError> {
        let quote = self.peek_char().ok_or_else(|| self.error("string"))?;
        if quote != '\'' && quote != '"' {
            return Err(self.error("expected quoted string"));
        }
        self.i += 1;
        let mut out = String::new();
        while let Some(c) = self.peek_char() {
            self.i += c.len_utf8();
            if c == quote {
                return Ok(out);
            }
            if c == '\\' {
                if let Some(nc) = self.peek_char() {
                    self.i += nc.len_utf8();
                    match nc {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        '\\' => out.push('\\'),
                        '"' => out.push('"'),
                        '\'' => out.push('\''),
                        _ => {
                            out.push('\\');
                            out.push(nc);
                        }
                    }
                } else {
                    break;
                }
            } else {
                out.push(c);
            }
        }
        Err(self.error("unterminated string"))
    }

    pub fn expect(&mut self, c: char) -> Result<(), IslError> {
        self.skip_ws();
        if self.consume_char(c) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{c}'")))
        }
    }

    pub fn consume_char(&mut self, c: char) -> bool {
        if self.peek_char() == Some(c) {
            self.i += c.len_utf8();
            true
        } else {
            false
        }
    }

    pub fn consume_str(&mut self, lit: &str) -> bool {
        if self.peek_str(lit) {
            self.i += lit.len();
            true
        } else {
            false
        }
    }

    pub fn peek_char(&self) -> Option<char> {
        self.s[self.i..].chars().next()
    }

    pub fn peek_nth(&self, n: usize) -> Option<char> {
        self.s[self.i..].chars().nth(n)
    }

    pub fn peek_str(&self, lit: &str) -> bool {
        self.s[self.i..].starts_with(lit)
    }

    /// `word` at the cursor, not followed by another identifier character.
    pub fn peek_keyword(&self, word: &str) -> bool {
        let rest = &self.s[self.i..];
        rest.len() >= word.len()
            && rest.is_char_boundary(word.len())
            && rest[..word.len()].eq_ignore_ascii_case(word)
            && !rest[word.len()..]
                .chars()
                .next()
                .is_some_and(|c| c == '_' || c.is_ascii_alphanumeric())
    }

    pub fn consume_keyword(&mut self, word: &str) -> bool {
        if self.peek_keyword(word) {
            self.i += word.len();
            true
        } else {
            false
        }
    }

    /// Skips whitespace and `//` or `/* */` comments.
    pub fn skip_ws(&mut self) {
        loop {
            while let Some(c) = self.peek_char() {
                if c.is_whitespace() {
                    self.i += c.len_utf8();
                } else {
                    break;
                }
            }
            if self.peek_str("//") {
                while let Some(c) = self.peek_char() {
                    self.i += c.len_utf8();
                    if c == '\n' {
                        break;
                    }
                }
            } else if self.peek_str("/*") {
                match self.s[self.i + 2..].find("*/") {
                    Some(end) => self.i += end + 4,
                    None => self.i = self.s.len(),
                }
            } else {
                break;
            }
        }
    }

    pub fn eof(&self) -> bool {
        self.i >= self.s.len()
    }

    pub fn mark(&self) -> usize {
        self.i
    }

    pub fn reset(&mut self, mark: usize) {
        self.i = mark;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn tracks_line_and_column() {
        let mut p = Parser::with_file("fun a() {\n  // note\n  $x = 1;\n}", "main");
        p.parse_identifier().unwrap();
        p.skip_ws();
        assert_eq!(p.parse_identifier().unwrap(), "a");
        p.reset(9);
        p.skip_ws();
        assert_eq!(p.position(), Position::new("main", 3, 2));
        assert_eq!(p.parse_variable().unwrap(), "$x");
    }

    #[test]
    fn literals() {
        assert_eq!(Parser::new("-12").parse_number_literal().unwrap(), Value::from(-12));
        assert_eq!(Parser::new("1.5").parse_number_literal().unwrap(), Value::from(1.5));
        assert_eq!(Parser::new(r#"'it\'s'"#).parse_quoted_string().unwrap(), "it's");
        assert!(Parser::new("'open").parse_quoted_string().is_err());
    }

    #[test]
    fn keywords_need_a_boundary() {
        let p = Parser::new("format");
        assert!(!p.peek_keyword("for"));
        assert!(Parser::new("IF (").peek_keyword("if"));
    }
}
