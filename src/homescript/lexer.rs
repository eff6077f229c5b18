//! Per-line tokenizer. Statements never span lines, so every token stream
//! belongs to exactly one source line.

use super::error::ScriptError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Var(String),
    Number(f64),
    Str(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Assign,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Token {
    /// True when the token is the bare word `word` (case-insensitive).
    pub fn is_word(&self, word: &str) -> bool {
        matches!(self, Token::Ident(ident) if ident.eq_ignore_ascii_case(word))
    }
}

pub fn tokenize(source: &str, line: usize) -> Result<Vec<Token>, ScriptError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' => i += 1,
            '#' => break,
            '"' | '\'' => {
                let (text, next) = read_string(&chars, i, line)?;
                tokens.push(Token::Str(text));
                i = next;
            }
            '$' => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len()
                    && (chars[end].is_ascii_alphanumeric() || chars[end] == '_')
                {
                    end += 1;
                }
                if end == start {
                    return Err(ScriptError::syntax("Expected variable name after '$'", line));
                }
                tokens.push(Token::Var(chars[start..end].iter().collect()));
                i = end;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                if i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit() {
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| ScriptError::syntax(format!("Invalid number '{}'", text), line))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => {
                let next = chars.get(i + 1).copied();
                let (token, width) = match (c, next) {
                    ('=', Some('=')) => (Token::Eq, 2),
                    ('!', Some('=')) => (Token::NotEq, 2),
                    ('<', Some('=')) => (Token::Le, 2),
                    ('>', Some('=')) => (Token::Ge, 2),
                    ('=', _) => (Token::Assign, 1),
                    ('<', _) => (Token::Lt, 1),
                    ('>', _) => (Token::Gt, 1),
                    ('(', _) => (Token::LParen, 1),
                    (')', _) => (Token::RParen, 1),
                    ('[', _) => (Token::LBracket, 1),
                    (']', _) => (Token::RBracket, 1),
                    ('{', _) => (Token::LBrace, 1),
                    ('}', _) => (Token::RBrace, 1),
                    (',', _) => (Token::Comma, 1),
                    (':', _) => (Token::Colon, 1),
                    ('.', _) => (Token::Dot, 1),
                    ('+', _) => (Token::Plus, 1),
                    ('-', _) => (Token::Minus, 1),
                    ('*', _) => (Token::Star, 1),
                    ('/', _) => (Token::Slash, 1),
                    ('%', _) => (Token::Percent, 1),
                    _ => {
                        return Err(ScriptError::syntax(
                            format!("Unexpected character '{}'", c),
                            line,
                        ));
                    }
                };
                tokens.push(token);
                i += width;
            }
        }
    }

    Ok(tokens)
}

fn read_string(chars: &[char], start: usize, line: usize) -> Result<(String, usize), ScriptError> {
    let quote = chars[start];
    let mut text = String::new();
    let mut i = start + 1;

    while i < chars.len() {
        let c = chars[i];
        if c == quote {
            return Ok((text, i + 1));
        }
        if c == '\\' {
            let escaped = chars
                .get(i + 1)
                .ok_or_else(|| ScriptError::syntax("Unterminated string literal", line))?;
            text.push(match escaped {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                other => *other,
            });
            i += 2;
            continue;
        }
        text.push(c);
        i += 1;
    }

    Err(ScriptError::syntax("Unterminated string literal", line))
}
