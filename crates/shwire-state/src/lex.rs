//! Minimal shell word lexer for `declare -p` / `typeset -p` output.
//!
//! Understands single quotes, double quotes, `$'...'` ANSI-C quoting and
//! backslash escapes, which covers everything bash and zsh print when
//! describing variables.

use crate::StateError;

pub(crate) struct Lexer<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub(crate) fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    pub(crate) fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.src.len()
    }

    pub(crate) fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        self.rest().chars().nth(1)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    pub(crate) fn advance(&mut self, bytes: usize) {
        self.pos = (self.pos + bytes).min(self.src.len());
    }

    pub(crate) fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    /// Skip spaces and tabs
    pub(crate) fn skip_blank(&mut self) {
        while matches!(self.peek(), Some(' ') | Some('\t')) {
            self.bump();
        }
    }

    /// Skip all whitespace including newlines
    pub(crate) fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    /// Read characters up to `=` or whitespace, without unquoting
    pub(crate) fn raw_name(&mut self) -> &'a str {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == '=' || c.is_whitespace() {
                break;
            }
            self.bump();
        }
        &self.src[start..self.pos]
    }

    /// Read one shell word, removing quoting, stopping at unquoted whitespace
    /// or any of `stops`
    pub(crate) fn word(&mut self, stops: &[char]) -> Result<String, StateError> {
        let mut out: Vec<u8> = Vec::new();
        let mut utf8 = [0u8; 4];

        while let Some(c) = self.peek() {
            if c.is_whitespace() || stops.contains(&c) {
                break;
            }
            match c {
                '\'' => {
                    self.bump();
                    let rest = self.rest();
                    let end = rest.find('\'').ok_or_else(|| unterminated("single quote"))?;
                    out.extend_from_slice(rest[..end].as_bytes());
                    self.advance(end + 1);
                }
                '"' => {
                    self.bump();
                    self.double_quoted(&mut out)?;
                }
                '$' if self.peek_second() == Some('\'') => {
                    self.bump();
                    self.bump();
                    self.ansi_c_quoted(&mut out)?;
                }
                '\\' => {
                    self.bump();
                    match self.bump() {
                        Some('\n') | None => {}
                        Some(escaped) => out.extend_from_slice(escaped.encode_utf8(&mut utf8).as_bytes()),
                    }
                }
                other => {
                    self.bump();
                    out.extend_from_slice(other.encode_utf8(&mut utf8).as_bytes());
                }
            }
        }

        String::from_utf8(out).map_err(|_| StateError::NonUtf8("quoted word".to_string()))
    }

    fn double_quoted(&mut self, out: &mut Vec<u8>) -> Result<(), StateError> {
        let mut utf8 = [0u8; 4];
        loop {
            match self.bump() {
                None => return Err(unterminated("double quote")),
                Some('"') => return Ok(()),
                Some('\\') => match self.bump() {
                    None => return Err(unterminated("double quote")),
                    Some('\n') => {}
                    Some(c @ ('$' | '`' | '"' | '\\')) => out.push(c as u8),
                    Some(c) => {
                        out.push(b'\\');
                        out.extend_from_slice(c.encode_utf8(&mut utf8).as_bytes());
                    }
                },
                Some(c) => out.extend_from_slice(c.encode_utf8(&mut utf8).as_bytes()),
            }
        }
    }

    fn ansi_c_quoted(&mut self, out: &mut Vec<u8>) -> Result<(), StateError> {
        let mut utf8 = [0u8; 4];
        loop {
            let c = self.bump().ok_or_else(|| unterminated("$' quote"))?;
            if c == '\'' {
                return Ok(());
            }
            if c != '\\' {
                out.extend_from_slice(c.encode_utf8(&mut utf8).as_bytes());
                continue;
            }
            let escape = self.bump().ok_or_else(|| unterminated("$' quote"))?;
            match escape {
                'a' => out.push(0x07),
                'b' => out.push(0x08),
                'e' | 'E' => out.push(0x1b),
                'f' => out.push(0x0c),
                'n' => out.push(b'\n'),
                'r' => out.push(b'\r'),
                't' => out.push(b'\t'),
                'v' => out.push(0x0b),
                'c' => {
                    let ctl = self.bump().ok_or_else(|| unterminated("$' quote"))?;
                    out.push((ctl as u8) & 0x1f);
                }
                'x' => {
                    let value = self.radix_digits(16, 2);
                    out.push(value.unwrap_or(0) as u8);
                }
                'u' | 'U' => {
                    let max = if escape == 'u' { 4 } else { 8 };
                    let ch = self.radix_digits(16, max).and_then(char::from_u32).unwrap_or('\u{fffd}');
                    out.extend_from_slice(ch.encode_utf8(&mut utf8).as_bytes());
                }
                '0'..='7' => {
                    let mut value = escape.to_digit(8).unwrap_or(0);
                    for _ in 0..2 {
                        match self.peek().and_then(|d| d.to_digit(8)) {
                            Some(d) => {
                                value = value * 8 + d;
                                self.bump();
                            }
                            None => break,
                        }
                    }
                    out.push(value as u8);
                }
                other => out.extend_from_slice(other.encode_utf8(&mut utf8).as_bytes()),
            }
        }
    }

    fn radix_digits(&mut self, radix: u32, max: usize) -> Option<u32> {
        let mut value: Option<u32> = None;
        for _ in 0..max {
            match self.peek().and_then(|d| d.to_digit(radix)) {
                Some(d) => {
                    value = Some(value.unwrap_or(0) * radix + d);
                    self.bump();
                }
                None => break,
            }
        }
        value
    }
}

fn unterminated(what: &str) -> StateError {
    StateError::InvalidCapture(format!("unterminated {}", what))
}
