//! Statement and expression parser.
//!
//! HomeScript is line-oriented: one statement per line, blocks closed by
//! `END`. Blank lines and `#` comments are ignored, which keeps every parsed
//! statement aligned with the executable-line numbering used for breakpoints.

use super::declarations::{Declaration, Declarations, parse_declarations};
use super::error::ScriptError;
use super::lexer::{Token, tokenize};
use super::value::ScriptValue;

/// Upper bound on nested blocks, and on expression depth within one line.
pub const MAX_NESTING_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(ScriptValue),
    Var(String),
    List(Vec<Expr>),
    Map(Vec<(String, Expr)>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Index(Box<Expr>, Box<Expr>),
    Field(Box<Expr>, String),
    Call(String, Vec<Expr>),
}

/// Service or entity reference: a bare dotted path or a computed string.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Path(String),
    Dynamic(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// Header declaration, bound when execution reaches its line.
    Declare(Declaration),
    /// Declaration after the header; ignored.
    LateDeclaration,
    Set { name: String, value: Expr },
    Print(Expr),
    Log { level: LogLevel, message: Expr },
    CallService { service: Target, args: Option<Expr>, bind: Option<String> },
    GetState { entity: Target, bind: String },
    SetState { entity: Target, value: Expr, bind: Option<String> },
    If { branches: Vec<(Expr, Vec<Stmt>)>, otherwise: Option<Vec<Stmt>> },
    While { condition: Expr, body: Vec<Stmt> },
    For { var: String, iterable: Expr, body: Vec<Stmt> },
    Import(String),
    Return(Option<Expr>),
    Fail { message: Expr, status: Option<u16> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub line: usize,
    pub kind: StmtKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

enum Terminator {
    End,
    Else,
    ElseIf(Expr),
}

pub fn parse_program(code: &str) -> Result<Program, ScriptError> {
    let header = parse_declarations(code);
    let lines = code
        .lines()
        .enumerate()
        .map(|(index, raw)| (index + 1, raw.trim()))
        .filter(|(_, text)| !text.is_empty() && !text.starts_with('#'))
        .collect();

    let mut parser = BlockParser {
        lines,
        pos: 0,
        depth: 0,
        header,
    };
    let (statements, terminator) = parser.parse_block()?;
    if let Some((line, _)) = terminator {
        return Err(ScriptError::syntax("Unexpected END or ELSE", line));
    }
    Ok(Program { statements })
}

/// Parses a standalone expression, e.g. a declaration condition.
pub fn parse_expression(source: &str, line: usize) -> Result<Expr, ScriptError> {
    let tokens = tokenize(source, line)?;
    let mut cursor = Cursor::new(&tokens, line);
    let expr = cursor.parse_expr()?;
    cursor.expect_end()?;
    Ok(expr)
}

struct BlockParser<'a> {
    lines: Vec<(usize, &'a str)>,
    pos: usize,
    depth: usize,
    header: Declarations,
}

fn split_keyword(text: &str) -> (&str, &str) {
    match text.find(char::is_whitespace) {
        Some(idx) => (&text[..idx], text[idx..].trim()),
        None => (text, ""),
    }
}

impl<'a> BlockParser<'a> {
    fn parse_block(&mut self) -> Result<(Vec<Stmt>, Option<(usize, Terminator)>), ScriptError> {
        let mut statements = Vec::new();

        while self.pos < self.lines.len() {
            let (line, text) = self.lines[self.pos];
            self.pos += 1;
            let (keyword, rest) = split_keyword(text);

            match keyword {
                "END" => {
                    if !rest.is_empty() {
                        return Err(ScriptError::syntax("Unexpected tokens after END", line));
                    }
                    return Ok((statements, Some((line, Terminator::End))));
                }
                "ELSE" => {
                    let terminator = if rest.is_empty() {
                        Terminator::Else
                    } else {
                        let (next, condition) = split_keyword(rest);
                        if next != "IF" {
                            return Err(ScriptError::syntax("Expected IF after ELSE", line));
                        }
                        Terminator::ElseIf(parse_condition(condition, line, "THEN")?)
                    };
                    return Ok((statements, Some((line, terminator))));
                }
                "IF" => statements.push(self.parse_if(line, rest)?),
                "WHILE" => {
                    let condition = parse_condition(rest, line, "DO")?;
                    let body = self.parse_body_until_end(line, "WHILE")?;
                    statements.push(Stmt {
                        line,
                        kind: StmtKind::While { condition, body },
                    });
                }
                "FOR" => statements.push(self.parse_for(line, rest)?),
                "REQUIRED" | "OPTIONAL" => {
                    let kind = if let Some(declaration) = self.header.at_line(line) {
                        StmtKind::Declare(declaration.clone())
                    } else if parse_declarations(text).is_empty() {
                        return Err(ScriptError::syntax("Malformed declaration", line));
                    } else {
                        StmtKind::LateDeclaration
                    };
                    statements.push(Stmt { line, kind });
                }
                "IMPORT" => {
                    let name = rest.trim_matches(|c| c == '"' || c == '\'').trim();
                    if name.is_empty() {
                        return Err(ScriptError::syntax("IMPORT requires a script name", line));
                    }
                    statements.push(Stmt {
                        line,
                        kind: StmtKind::Import(name.to_string()),
                    });
                }
                _ => statements.push(parse_simple_statement(text, line)?),
            }
        }

        Ok((statements, None))
    }

    /// Parses a block nested one level below the current one.
    fn parse_nested(
        &mut self,
        line: usize,
    ) -> Result<(Vec<Stmt>, Option<(usize, Terminator)>), ScriptError> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(ScriptError::syntax(
                format!("Blocks nested deeper than {}", MAX_NESTING_DEPTH),
                line,
            ));
        }
        self.depth += 1;
        let block = self.parse_block();
        self.depth -= 1;
        block
    }

    fn parse_body_until_end(
        &mut self,
        line: usize,
        construct: &str,
    ) -> Result<Vec<Stmt>, ScriptError> {
        match self.parse_nested(line)? {
            (body, Some((_, Terminator::End))) => Ok(body),
            (_, Some((other, _))) => Err(ScriptError::syntax(
                format!("ELSE is not allowed inside {}", construct),
                other,
            )),
            (_, None) => Err(ScriptError::syntax(format!("{} without END", construct), line)),
        }
    }

    fn parse_if(&mut self, line: usize, rest: &str) -> Result<Stmt, ScriptError> {
        let mut branches = Vec::new();
        let mut condition = parse_condition(rest, line, "THEN")?;

        loop {
            let (body, terminator) = self.parse_nested(line)?;
            branches.push((condition, body));
            match terminator {
                Some((_, Terminator::End)) => {
                    return Ok(Stmt {
                        line,
                        kind: StmtKind::If {
                            branches,
                            otherwise: None,
                        },
                    });
                }
                Some((_, Terminator::ElseIf(next))) => condition = next,
                Some((_, Terminator::Else)) => {
                    let otherwise = self.parse_body_until_end(line, "IF")?;
                    return Ok(Stmt {
                        line,
                        kind: StmtKind::If {
                            branches,
                            otherwise: Some(otherwise),
                        },
                    });
                }
                None => return Err(ScriptError::syntax("IF without END", line)),
            }
        }
    }

    fn parse_for(&mut self, line: usize, rest: &str) -> Result<Stmt, ScriptError> {
        let tokens = tokenize(rest, line)?;
        let mut cursor = Cursor::new(&tokens, line);
        let var = cursor.expect_var()?;
        if !cursor.eat_word("IN") {
            return Err(ScriptError::syntax("Expected IN in FOR statement", line));
        }
        let iterable = cursor.parse_expr()?;
        cursor.eat_word("DO");
        cursor.expect_end()?;
        let body = self.parse_body_until_end(line, "FOR")?;
        Ok(Stmt {
            line,
            kind: StmtKind::For {
                var,
                iterable,
                body,
            },
        })
    }
}

fn parse_condition(source: &str, line: usize, trailing: &str) -> Result<Expr, ScriptError> {
    let tokens = tokenize(source, line)?;
    let mut cursor = Cursor::new(&tokens, line);
    if cursor.at_end() {
        return Err(ScriptError::syntax("Missing condition", line));
    }
    let condition = cursor.parse_expr()?;
    cursor.eat_word(trailing);
    cursor.expect_end()?;
    Ok(condition)
}

fn parse_simple_statement(text: &str, line: usize) -> Result<Stmt, ScriptError> {
    let tokens = tokenize(text, line)?;
    let mut cursor = Cursor::new(&tokens, line);
    let keyword = match cursor.next() {
        Some(Token::Ident(word)) => word.clone(),
        _ => return Err(ScriptError::syntax("Expected a statement", line)),
    };

    let kind = match keyword.as_str() {
        "SET" => {
            let name = cursor.expect_var()?;
            cursor.expect(&Token::Assign, "'='")?;
            StmtKind::Set {
                name,
                value: cursor.parse_expr()?,
            }
        }
        "PRINT" => StmtKind::Print(cursor.parse_expr()?),
        "LOG" => {
            let level = match cursor.peek() {
                Some(token) if cursor.remaining() > 1 => match token {
                    t if t.is_word("DEBUG") => Some(LogLevel::Debug),
                    t if t.is_word("INFO") => Some(LogLevel::Info),
                    t if t.is_word("WARN") || t.is_word("WARNING") => Some(LogLevel::Warn),
                    t if t.is_word("ERROR") => Some(LogLevel::Error),
                    _ => None,
                },
                _ => None,
            };
            if level.is_some() {
                cursor.next();
            }
            StmtKind::Log {
                level: level.unwrap_or(LogLevel::Info),
                message: cursor.parse_expr()?,
            }
        }
        "CALL" => {
            let service = cursor.parse_target()?;
            let args = if cursor.eat_word("WITH") {
                Some(cursor.parse_expr()?)
            } else {
                None
            };
            let bind = cursor.parse_binding()?;
            StmtKind::CallService {
                service,
                args,
                bind,
            }
        }
        "GET" => {
            let entity = cursor.parse_target()?;
            let bind = cursor
                .parse_binding()?
                .ok_or_else(|| ScriptError::syntax("GET requires AS $variable", line))?;
            StmtKind::GetState { entity, bind }
        }
        "STATE" => {
            let entity = cursor.parse_target()?;
            cursor.expect(&Token::Assign, "'='")?;
            let value = cursor.parse_expr()?;
            let bind = cursor.parse_binding()?;
            StmtKind::SetState {
                entity,
                value,
                bind,
            }
        }
        "RETURN" => {
            if cursor.at_end() {
                StmtKind::Return(None)
            } else {
                StmtKind::Return(Some(cursor.parse_expr()?))
            }
        }
        "FAIL" => {
            let message = cursor.parse_expr()?;
            let status = if cursor.eat_word("STATUS") {
                match cursor.next() {
                    Some(Token::Number(n)) if *n >= 100.0 && *n <= 599.0 && n.fract() == 0.0 => {
                        Some(*n as u16)
                    }
                    _ => return Err(ScriptError::syntax("STATUS must be 100-599", line)),
                }
            } else {
                None
            };
            StmtKind::Fail { message, status }
        }
        other => {
            return Err(ScriptError::syntax(
                format!("Unknown statement '{}'", other),
                line,
            ));
        }
    };

    cursor.expect_end()?;
    Ok(Stmt { line, kind })
}

struct Cursor<'t> {
    tokens: &'t [Token],
    pos: usize,
    line: usize,
    depth: usize,
}

impl<'t> Cursor<'t> {
    fn new(tokens: &'t [Token], line: usize) -> Self {
        Self {
            tokens,
            pos: 0,
            line,
            depth: 0,
        }
    }

    /// Enters one level of expression nesting.
    fn descend(&mut self) -> Result<(), ScriptError> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(self.error(format!(
                "Expression nested deeper than {}",
                MAX_NESTING_DEPTH
            )));
        }
        self.depth += 1;
        Ok(())
    }

    fn ascend(&mut self, levels: usize) {
        self.depth -= levels;
    }

    fn peek(&self) -> Option<&'t Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&'t Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn remaining(&self) -> usize {
        self.tokens.len() - self.pos
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn error(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::syntax(message, self.line)
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), ScriptError> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            _ => Err(self.error(format!("Expected {}", what))),
        }
    }

    fn expect_end(&self) -> Result<(), ScriptError> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(self.error(format!("Unexpected token {:?}", token))),
        }
    }

    fn expect_var(&mut self) -> Result<String, ScriptError> {
        match self.next() {
            Some(Token::Var(name)) => Ok(name.clone()),
            _ => Err(self.error("Expected $variable")),
        }
    }

    fn eat_word(&mut self, word: &str) -> bool {
        if self.peek().map(|t| t.is_word(word)).unwrap_or(false) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_binding(&mut self) -> Result<Option<String>, ScriptError> {
        if self.eat_word("AS") {
            Ok(Some(self.expect_var()?))
        } else {
            Ok(None)
        }
    }

    fn parse_target(&mut self) -> Result<Target, ScriptError> {
        if let Some(Token::Ident(first)) = self.peek() {
            self.pos += 1;
            let mut path = first.clone();
            while self.peek() == Some(&Token::Dot) {
                self.pos += 1;
                match self.next() {
                    Some(Token::Ident(part)) => {
                        path.push('.');
                        path.push_str(part);
                    }
                    Some(Token::Number(n)) if n.fract() == 0.0 => {
                        path.push('.');
                        path.push_str(&format!("{}", *n as i64));
                    }
                    _ => return Err(self.error("Malformed entity reference")),
                }
            }
            return Ok(Target::Path(path));
        }
        Ok(Target::Dynamic(self.parse_expr()?))
    }

    // Every tree level costs one unit of depth: parenthesised or bracketed
    // sub-expressions, prefix operators and each link of an operator chain.
    fn parse_expr(&mut self) -> Result<Expr, ScriptError> {
        self.descend()?;
        let expr = self.parse_or()?;
        self.ascend(1);
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.parse_and()?;
        let mut links = 0;
        while self.eat_word("OR") {
            self.descend()?;
            links += 1;
            let right = self.parse_and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        self.ascend(links);
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.parse_not()?;
        let mut links = 0;
        while self.eat_word("AND") {
            self.descend()?;
            links += 1;
            let right = self.parse_not()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        self.ascend(links);
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ScriptError> {
        if self.eat_word("NOT") {
            self.descend()?;
            let operand = self.parse_not()?;
            self.ascend(1);
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(operand)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.parse_additive()?;
        let mut links = 0;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinaryOp::Eq,
                Some(Token::NotEq) => BinaryOp::NotEq,
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::Le) => BinaryOp::Le,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::Ge) => BinaryOp::Ge,
                _ => break,
            };
            self.pos += 1;
            self.descend()?;
            links += 1;
            let right = self.parse_additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        self.ascend(links);
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.parse_term()?;
        let mut links = 0;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            self.descend()?;
            links += 1;
            let right = self.parse_term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        self.ascend(links);
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.parse_unary()?;
        let mut links = 0;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Mod,
                _ => break,
            };
            self.pos += 1;
            self.descend()?;
            links += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        self.ascend(links);
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ScriptError> {
        if self.peek() == Some(&Token::Minus) {
            self.pos += 1;
            self.descend()?;
            let operand = self.parse_unary()?;
            self.ascend(1);
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(operand)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ScriptError> {
        let mut expr = self.parse_primary()?;
        let mut links = 0;
        loop {
            match self.peek() {
                Some(Token::LBracket) => {
                    self.pos += 1;
                    self.descend()?;
                    links += 1;
                    let index = self.parse_expr()?;
                    self.expect(&Token::RBracket, "']'")?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                Some(Token::Dot) => {
                    self.pos += 1;
                    self.descend()?;
                    links += 1;
                    match self.next() {
                        Some(Token::Ident(field)) => {
                            expr = Expr::Field(Box::new(expr), field.clone());
                        }
                        _ => return Err(self.error("Expected field name after '.'")),
                    }
                }
                _ => break,
            }
        }
        self.ascend(links);
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ScriptError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(ScriptValue::Number(*n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(ScriptValue::String(s.clone()))),
            Some(Token::Var(name)) => Ok(Expr::Var(name.clone())),
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if self.peek() != Some(&Token::RBracket) {
                    loop {
                        items.push(self.parse_expr()?);
                        if self.peek() == Some(&Token::Comma) {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(&Token::RBracket, "']'")?;
                Ok(Expr::List(items))
            }
            Some(Token::LBrace) => {
                let mut entries = Vec::new();
                if self.peek() != Some(&Token::RBrace) {
                    loop {
                        let key = match self.next() {
                            Some(Token::Str(s)) | Some(Token::Ident(s)) => s.clone(),
                            _ => return Err(self.error("Expected map key")),
                        };
                        self.expect(&Token::Colon, "':'")?;
                        entries.push((key, self.parse_expr()?));
                        if self.peek() == Some(&Token::Comma) {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(&Token::RBrace, "'}'")?;
                Ok(Expr::Map(entries))
            }
            Some(Token::Ident(word)) => {
                if word.eq_ignore_ascii_case("true") {
                    return Ok(Expr::Literal(ScriptValue::Boolean(true)));
                }
                if word.eq_ignore_ascii_case("false") {
                    return Ok(Expr::Literal(ScriptValue::Boolean(false)));
                }
                if word.eq_ignore_ascii_case("null") {
                    return Ok(Expr::Literal(ScriptValue::Null));
                }
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.parse_expr()?);
                            if self.peek() == Some(&Token::Comma) {
                                self.pos += 1;
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(&Token::RParen, "')'")?;
                    return Ok(Expr::Call(word.to_ascii_lowercase(), args));
                }
                Err(self.error(format!("Unexpected identifier '{}'", word)))
            }
            Some(token) => Err(self.error(format!("Unexpected token {:?}", token))),
            None => Err(self.error("Unexpected end of line")),
        }
    }
}
