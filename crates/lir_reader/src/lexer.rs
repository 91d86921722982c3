//! Lexical analysis for the textual IR form.

use std::str::CharIndices;

/// A token returned from the `Lexer`. Variants may borrow the source text.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Token<'a> {
    LPar,     // '('
    RPar,     // ')'
    LBrace,   // '{'
    RBrace,   // '}'
    LBracket, // '['
    RBracket, // ']'
    Comma,    // ','
    Dot,      // '.'
    Colon,    // ':'
    Equal,    // '='
    Arrow,    // '->'
    /// Integer or float immediate, including `0x` bit patterns.
    Number(&'a str),
    /// `v12`
    Value(u32),
    /// `block3`
    Block(u32),
    /// `fn2`
    FuncRef(u32),
    /// `ss0`
    StackSlot(u32),
    /// `gv1`
    Global(u32),
    /// `%arbitrary_name`
    Name(&'a str),
    /// Unrecognized identifier: opcode, type, keyword.
    Identifier(&'a str),
}

/// A `Token` with the line it came from.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct LocatedToken<'a> {
    pub token: Token<'a>,
    pub line: usize,
}

/// Count the decimal digits at the end of `s`.
fn trailing_digits(s: &str) -> usize {
    s.as_bytes().iter().rev().take_while(|&&b| b.is_ascii_digit()).count()
}

/// Pre-parse an entity name into a head of lowercase ASCII letters and a
/// numeric tail.
fn split_entity_name(name: &str) -> Option<(&str, u32)> {
    let (head, tail) = name.split_at(name.len() - trailing_digits(name));
    if tail.len() > 1 && tail.starts_with('0') {
        None
    } else {
        tail.parse().ok().map(|n| (head, n))
    }
}

pub struct Lexer<'a> {
    source: &'a str,
    chars: CharIndices<'a>,
    /// Next character to be processed, or `None` at the end.
    lookahead: Option<char>,
    /// Index into `source` of the lookahead character.
    pos: usize,
    line: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        let mut lex =
            Lexer { source, chars: source.char_indices(), lookahead: None, pos: 0, line: 1 };
        lex.next_ch();
        lex
    }

    fn next_ch(&mut self) -> Option<char> {
        if self.lookahead == Some('\n') {
            self.line += 1;
        }
        match self.chars.next() {
            Some((idx, ch)) => {
                self.pos = idx;
                self.lookahead = Some(ch);
            }
            None => {
                self.pos = self.source.len();
                self.lookahead = None;
            }
        }
        self.lookahead
    }

    fn scan_char(&mut self, token: Token<'a>) -> LocatedToken<'a> {
        let line = self.line;
        self.next_ch();
        LocatedToken { token, line }
    }

    /// Numbers cover integers, floats with exponents, and `0x` bit
    /// patterns; a `-`/`+` directly after `e` stays part of the number.
    fn scan_number(&mut self) -> LocatedToken<'a> {
        let begin = self.pos;
        let line = self.line;
        let mut prev = '\0';
        while let Some(ch) = self.lookahead {
            let continues = ch.is_ascii_alphanumeric()
                || ch == '.'
                || ch == '_'
                || ((ch == '-' || ch == '+') && (prev == 'e' || prev == 'E'))
                || (ch == '-' && self.pos == begin);
            if !continues {
                break;
            }
            prev = ch;
            self.next_ch();
        }
        LocatedToken { token: Token::Number(&self.source[begin..self.pos]), line }
    }

    fn scan_word(&mut self) -> LocatedToken<'a> {
        let begin = self.pos;
        let line = self.line;
        while let Some(ch) = self.lookahead {
            if !ch.is_ascii_alphanumeric() && ch != '_' {
                break;
            }
            self.next_ch();
        }
        let word = &self.source[begin..self.pos];
        let token = split_entity_name(word)
            .and_then(|(head, num)| {
                let token = match head {
                    "v" => Token::Value(num),
                    "block" => Token::Block(num),
                    "fn" => Token::FuncRef(num),
                    "ss" => Token::StackSlot(num),
                    "gv" => Token::Global(num),
                    _ => return None,
                };
                Some(token)
            })
            .unwrap_or(Token::Identifier(word));
        LocatedToken { token, line }
    }

    fn scan_name(&mut self) -> LocatedToken<'a> {
        let line = self.line;
        self.next_ch();
        let begin = self.pos;
        while let Some(ch) = self.lookahead {
            if !ch.is_ascii_alphanumeric() && ch != '_' && ch != '.' {
                break;
            }
            self.next_ch();
        }
        LocatedToken { token: Token::Name(&self.source[begin..self.pos]), line }
    }

    /// Get the next token, or `None` at the end of the source.
    pub fn next(&mut self) -> Option<Result<LocatedToken<'a>, usize>> {
        loop {
            let ch = self.lookahead?;
            let token = match ch {
                ' ' | '\t' | '\r' | '\n' => {
                    self.next_ch();
                    continue;
                }
                ';' => {
                    // Line comment.
                    while let Some(ch) = self.next_ch() {
                        if ch == '\n' {
                            break;
                        }
                    }
                    continue;
                }
                '(' => self.scan_char(Token::LPar),
                ')' => self.scan_char(Token::RPar),
                '{' => self.scan_char(Token::LBrace),
                '}' => self.scan_char(Token::RBrace),
                '[' => self.scan_char(Token::LBracket),
                ']' => self.scan_char(Token::RBracket),
                ',' => self.scan_char(Token::Comma),
                '.' => self.scan_char(Token::Dot),
                ':' => self.scan_char(Token::Colon),
                '=' => self.scan_char(Token::Equal),
                '%' => self.scan_name(),
                '-' => {
                    if self.source[self.pos..].starts_with("->") {
                        let line = self.line;
                        self.next_ch();
                        self.next_ch();
                        LocatedToken { token: Token::Arrow, line }
                    } else {
                        self.scan_number()
                    }
                }
                '0'..='9' => self.scan_number(),
                'a'..='z' | 'A'..='Z' | '_' => self.scan_word(),
                _ => return Some(Err(self.line)),
            };
            return Some(Ok(token));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(src: &str) -> Vec<Token<'_>> {
        let mut lexer = Lexer::new(src);
        let mut out = Vec::new();
        while let Some(tok) = lexer.next() {
            out.push(tok.unwrap().token);
        }
        out
    }

    #[test]
    fn entities_and_numbers() {
        assert_eq!(
            tokens("v1 = fadd.f64 v2, -3.5 ; comment\nblock2 fn0 ss1 gv3 %foo ->"),
            vec![
                Token::Value(1),
                Token::Equal,
                Token::Identifier("fadd"),
                Token::Dot,
                Token::Identifier("f64"),
                Token::Value(2),
                Token::Comma,
                Token::Number("-3.5"),
                Token::Block(2),
                Token::FuncRef(0),
                Token::StackSlot(1),
                Token::Global(3),
                Token::Name("foo"),
                Token::Arrow,
            ]
        );
    }

    #[test]
    fn exponents_keep_their_sign() {
        assert_eq!(tokens("1.5e-7 0x400921fb54442d18"), vec![
            Token::Number("1.5e-7"),
            Token::Number("0x400921fb54442d18"),
        ]);
    }
}
