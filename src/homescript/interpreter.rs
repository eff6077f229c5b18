//! Cooperative HomeScript execution engine.
//!
//! A run is a single task that suspends only while awaiting a hook call or a
//! breakpoint decision. All side effects go through [`ScriptHooks`], so the
//! same engine serves webhooks, debug runs with mocked state and live
//! connections.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use super::declarations::{Declaration, Declarations, parse_declarations};
use super::error::{HookError, ScriptError, ScriptErrorKind};
use super::parser::{BinaryOp, Expr, LogLevel, Program, Stmt, StmtKind, Target, UnaryOp};
use super::parser::{MAX_NESTING_DEPTH, parse_expression, parse_program};
use super::value::ScriptValue;

/// Upper bound on WHILE iterations in a single loop.
pub const MAX_LOOP_ITERATIONS: usize = 10_000;

/// Upper bound on nested IMPORTs.
pub const MAX_IMPORT_DEPTH: usize = 16;

/// What to do after a breakpoint pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum BreakpointDecision {
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceEventType {
    Line,
    Breakpoint,
    Declaration,
    Print,
    Log,
    Import,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for TraceLevel {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => TraceLevel::Debug,
            LogLevel::Info => TraceLevel::Info,
            LogLevel::Warn => TraceLevel::Warn,
            LogLevel::Error => TraceLevel::Error,
        }
    }
}

/// Instrumentation event emitted while a script runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    #[serde(rename = "type")]
    pub event_type: TraceEventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<TraceLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl TraceEvent {
    pub fn new(
        event_type: TraceEventType,
        line: Option<usize>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            line,
            message: message.into(),
            level: None,
            details: None,
        }
    }

    pub fn with_level(mut self, level: TraceLevel) -> Self {
        self.level = Some(level);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Side-effect and suspension interface of the engine.
#[async_trait]
pub trait ScriptHooks: Send + Sync {
    /// Invoked for every `CALL domain.service`.
    async fn on_call(&self, service: &str, args: ScriptValue) -> Result<ScriptValue, HookError>;

    /// Current external value, or the string `"unknown"`.
    async fn on_get(&self, entity_id: &str) -> Result<ScriptValue, HookError>;

    /// Writes external state and returns the stored value.
    async fn on_set(&self, entity_id: &str, value: ScriptValue) -> Result<ScriptValue, HookError>;

    /// Source code of the script registered under `name`.
    async fn import_script(&self, name: &str) -> Result<String, HookError>;

    /// Awaited before a breakpointed line takes effect.
    async fn on_breakpoint(&self, _line: usize) -> BreakpointDecision {
        BreakpointDecision::Continue
    }

    fn on_event(&self, _event: TraceEvent) {}
}

/// Successful result of [`Engine::execute`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionOutcome {
    pub output: String,
    pub variables: IndexMap<String, ScriptValue>,
}

/// Configured run of a single script.
pub struct Engine {
    variables: IndexMap<String, ScriptValue>,
    query: IndexMap<String, String>,
    debug: bool,
    breakpoints: BTreeSet<usize>,
    script_name: Option<String>,
    hooks: Arc<dyn ScriptHooks>,
}

impl Engine {
    pub fn new(hooks: Arc<dyn ScriptHooks>) -> Self {
        Self {
            variables: IndexMap::new(),
            query: IndexMap::new(),
            debug: false,
            breakpoints: BTreeSet::new(),
            script_name: None,
            hooks,
        }
    }

    /// Initial bindings: resolved declarations plus request inputs.
    pub fn with_variables(mut self, variables: IndexMap<String, ScriptValue>) -> Self {
        self.variables = variables;
        self
    }

    /// Raw query parameters, readable through `query(name)`.
    pub fn with_query(mut self, query: IndexMap<String, String>) -> Self {
        self.query = query;
        self
    }

    /// Emit a `line` trace event before every statement.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_breakpoints(mut self, lines: impl IntoIterator<Item = usize>) -> Self {
        self.breakpoints = lines.into_iter().collect();
        self
    }

    /// Endpoint of the script being run; seeds import cycle detection.
    pub fn with_script_name(mut self, name: impl Into<String>) -> Self {
        self.script_name = Some(name.into());
        self
    }

    pub async fn execute(self, code: &str) -> Result<ExecutionOutcome, ScriptError> {
        let hooks = Arc::clone(&self.hooks);
        let result = self.run(code).await;
        if let Err(err) = &result {
            hooks.on_event(
                TraceEvent::new(TraceEventType::Error, err.line, err.message.clone())
                    .with_level(TraceLevel::Error)
                    .with_details(serde_json::json!({ "status": err.status })),
            );
        }
        result
    }

    async fn run(self, code: &str) -> Result<ExecutionOutcome, ScriptError> {
        let program = parse_program(code)?;
        let declarations = parse_declarations(code);

        let mut run = Run {
            vars: self.variables,
            query: self.query,
            debug: self.debug,
            breakpoints: self.breakpoints,
            hooks: self.hooks,
            output: Vec::new(),
            import_chain: self.script_name.into_iter().collect(),
            nesting: 0,
        };

        run.check_required(&declarations)?;
        run.exec_block(&program.statements, 0).await?;

        Ok(ExecutionOutcome {
            output: run.output.join("\n"),
            variables: run.vars,
        })
    }
}

enum Flow {
    Next,
    Return,
}

struct Run {
    vars: IndexMap<String, ScriptValue>,
    query: IndexMap<String, String>,
    debug: bool,
    breakpoints: BTreeSet<usize>,
    hooks: Arc<dyn ScriptHooks>,
    output: Vec<String>,
    import_chain: Vec<String>,
    /// Blocks and imports currently open, across the whole import chain.
    nesting: usize,
}

impl Run {
    fn emit(&self, event: TraceEvent) {
        self.hooks.on_event(event);
    }

    /// Fails on the first unconditional REQUIRED input that is unbound, before
    /// any statement runs.
    fn check_required(&self, declarations: &Declarations) -> Result<(), ScriptError> {
        for required in declarations.required() {
            if required.condition.is_none() && !self.vars.contains_key(&required.name) {
                return Err(ScriptError::missing_required(&required.name, required.line));
            }
        }
        Ok(())
    }

    /// Binds one header declaration when execution reaches its line.
    async fn declare(&mut self, declaration: &Declaration) -> Result<(), ScriptError> {
        let line = declaration.line();
        let condition = match declaration {
            Declaration::Required(d) => d.condition.as_deref(),
            Declaration::Optional(d) => d.condition.as_deref(),
        };
        if let Some(source) = condition {
            let expr = parse_expression(source, line)?;
            if !self.eval(&expr).await?.is_truthy() {
                return Ok(());
            }
        }

        match declaration {
            Declaration::Required(d) => {
                if !self.vars.contains_key(&d.name) {
                    return Err(ScriptError::missing_required(&d.name, line));
                }
            }
            Declaration::Optional(d) => {
                if !self.vars.contains_key(&d.name) {
                    let value = d.default_value.clone().unwrap_or(ScriptValue::Null);
                    if self.debug {
                        self.emit(
                            TraceEvent::new(
                                TraceEventType::Declaration,
                                Some(line),
                                format!("${} defaulted to {}", d.name, value),
                            )
                            .with_level(TraceLevel::Debug),
                        );
                    }
                    self.vars.insert(d.name.clone(), value);
                }
            }
        }
        Ok(())
    }

    /// Runs a block one level deeper: an IF/WHILE/FOR body or an import.
    async fn exec_nested(
        &mut self,
        statements: &[Stmt],
        depth: usize,
    ) -> Result<Flow, ScriptError> {
        if self.nesting >= MAX_NESTING_DEPTH {
            return Err(ScriptError::new(
                ScriptErrorKind::NestingLimit,
                format!("Blocks and imports nested deeper than {}", MAX_NESTING_DEPTH),
            ));
        }
        self.nesting += 1;
        let flow = self.exec_block(statements, depth).await;
        self.nesting -= 1;
        flow
    }

    fn exec_block<'a>(
        &'a mut self,
        statements: &'a [Stmt],
        depth: usize,
    ) -> BoxFuture<'a, Result<Flow, ScriptError>> {
        async move {
            for stmt in statements {
                // Line events and breakpoints refer to the top-level script only.
                if depth == 0 {
                    if self.debug {
                        self.emit(TraceEvent::new(
                            TraceEventType::Line,
                            Some(stmt.line),
                            format!("line {}", stmt.line),
                        ));
                    }
                    if self.breakpoints.contains(&stmt.line) {
                        self.emit(
                            TraceEvent::new(
                                TraceEventType::Breakpoint,
                                Some(stmt.line),
                                format!("paused at line {}", stmt.line),
                            )
                            .with_level(TraceLevel::Info),
                        );
                        match self.hooks.on_breakpoint(stmt.line).await {
                            BreakpointDecision::Continue => {}
                        }
                    }
                }

                let flow = self
                    .exec_stmt(stmt, depth)
                    .await
                    .map_err(|e| e.at_line(stmt.line))?;
                if let Flow::Return = flow {
                    return Ok(Flow::Return);
                }
            }
            Ok(Flow::Next)
        }
        .boxed()
    }

    async fn exec_stmt(&mut self, stmt: &Stmt, depth: usize) -> Result<Flow, ScriptError> {
        match &stmt.kind {
            StmtKind::Declare(declaration) => self.declare(declaration).await?,
            StmtKind::LateDeclaration => {
                self.emit(
                    TraceEvent::new(
                        TraceEventType::Declaration,
                        Some(stmt.line),
                        "declaration after the header is ignored",
                    )
                    .with_level(TraceLevel::Warn),
                );
            }
            StmtKind::Set { name, value } => {
                let value = self.eval(value).await?;
                self.vars.insert(name.clone(), value);
            }
            StmtKind::Print(expr) => {
                let text = self.eval(expr).await?.to_string();
                if self.debug {
                    self.emit(
                        TraceEvent::new(TraceEventType::Print, Some(stmt.line), text.clone())
                            .with_level(TraceLevel::Info),
                    );
                }
                self.output.push(text);
            }
            StmtKind::Log { level, message } => {
                let text = self.eval(message).await?.to_string();
                debug!(line = stmt.line, "script log: {}", text);
                self.emit(
                    TraceEvent::new(TraceEventType::Log, Some(stmt.line), text)
                        .with_level((*level).into()),
                );
            }
            StmtKind::CallService {
                service,
                args,
                bind,
            } => {
                let service = self.resolve_target(service).await?;
                if !service.contains('.') {
                    return Err(ScriptError::runtime(format!(
                        "Invalid service reference '{}', expected domain.service",
                        service
                    )));
                }
                let args = match args {
                    Some(expr) => self.eval(expr).await?,
                    None => ScriptValue::Map(IndexMap::new()),
                };
                let result = self.hooks.on_call(&service, args).await?;
                if let Some(name) = bind {
                    self.vars.insert(name.clone(), result);
                }
            }
            StmtKind::GetState { entity, bind } => {
                let entity = self.resolve_target(entity).await?;
                let value = self.hooks.on_get(&entity).await?;
                self.vars.insert(bind.clone(), value);
            }
            StmtKind::SetState {
                entity,
                value,
                bind,
            } => {
                let entity = self.resolve_target(entity).await?;
                let value = self.eval(value).await?;
                let stored = self.hooks.on_set(&entity, value).await?;
                if let Some(name) = bind {
                    self.vars.insert(name.clone(), stored);
                }
            }
            StmtKind::If {
                branches,
                otherwise,
            } => {
                for (condition, body) in branches {
                    if self.eval(condition).await?.is_truthy() {
                        return self.exec_nested(body, depth).await;
                    }
                }
                if let Some(body) = otherwise {
                    return self.exec_nested(body, depth).await;
                }
            }
            StmtKind::While { condition, body } => {
                let mut iterations = 0;
                while self.eval(condition).await?.is_truthy() {
                    iterations += 1;
                    if iterations > MAX_LOOP_ITERATIONS {
                        return Err(ScriptError::new(
                            ScriptErrorKind::IterationLimit,
                            format!("WHILE exceeded {} iterations", MAX_LOOP_ITERATIONS),
                        ));
                    }
                    if let Flow::Return = self.exec_nested(body, depth).await? {
                        return Ok(Flow::Return);
                    }
                }
            }
            StmtKind::For {
                var,
                iterable,
                body,
            } => {
                let items = match self.eval(iterable).await? {
                    ScriptValue::List(items) => items,
                    ScriptValue::Map(entries) => {
                        entries.into_keys().map(ScriptValue::String).collect()
                    }
                    other => {
                        return Err(ScriptError::runtime(format!(
                            "Cannot iterate over {}",
                            other.type_name()
                        )));
                    }
                };
                for item in items {
                    self.vars.insert(var.clone(), item);
                    if let Flow::Return = self.exec_nested(body, depth).await? {
                        return Ok(Flow::Return);
                    }
                }
            }
            StmtKind::Import(name) => self.import(name, stmt.line, depth).await?,
            StmtKind::Return(expr) => {
                if let Some(expr) = expr {
                    let text = self.eval(expr).await?.to_string();
                    self.output.push(text);
                }
                return Ok(Flow::Return);
            }
            StmtKind::Fail { message, status } => {
                let text = self.eval(message).await?.to_string();
                let mut err = ScriptError::new(ScriptErrorKind::Raised, text);
                if let Some(status) = status {
                    err = err.with_status(*status);
                }
                return Err(err);
            }
        }
        Ok(Flow::Next)
    }

    async fn import(&mut self, name: &str, line: usize, depth: usize) -> Result<(), ScriptError> {
        if self.import_chain.iter().any(|n| n == name) {
            let mut chain = self.import_chain.clone();
            chain.push(name.to_string());
            return Err(ScriptError::new(
                ScriptErrorKind::ImportCycle,
                format!("Import cycle detected: {}", chain.join(" -> ")),
            ));
        }
        if depth >= MAX_IMPORT_DEPTH {
            return Err(ScriptError::new(
                ScriptErrorKind::ImportDepth,
                format!("Imports nested deeper than {}", MAX_IMPORT_DEPTH),
            ));
        }

        let source = self.hooks.import_script(name).await.map_err(|e| match e {
            HookError::NotFound(_) => ScriptError::new(
                ScriptErrorKind::ImportNotFound,
                format!("Imported script '{}' not found", name),
            )
            .with_status(404),
            other => ScriptError::from(other),
        })?;

        self.emit(
            TraceEvent::new(TraceEventType::Import, Some(line), format!("importing {}", name))
                .with_level(TraceLevel::Debug),
        );

        let program: Program = parse_program(&source).map_err(|e| nested_error(name, e))?;
        let declarations = parse_declarations(&source);

        self.import_chain.push(name.to_string());
        let result = match self.check_required(&declarations) {
            Ok(()) => self
                .exec_nested(&program.statements, depth + 1)
                .await
                .map(|_| ()),
            Err(err) => Err(err),
        };
        self.import_chain.pop();

        result.map_err(|e| nested_error(name, e))
    }

    async fn resolve_target(&self, target: &Target) -> Result<String, ScriptError> {
        match target {
            Target::Path(path) => Ok(path.clone()),
            Target::Dynamic(expr) => match self.eval(expr).await? {
                ScriptValue::String(s) => Ok(s),
                other => Err(ScriptError::runtime(format!(
                    "Expected an entity or service name, got {}",
                    other.type_name()
                ))),
            },
        }
    }

    fn eval<'a>(&'a self, expr: &'a Expr) -> BoxFuture<'a, Result<ScriptValue, ScriptError>> {
        async move {
            match expr {
                Expr::Literal(value) => Ok(value.clone()),
                Expr::Var(name) => self
                    .vars
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ScriptError::runtime(format!("Undefined variable ${}", name))),
                Expr::List(items) => {
                    let mut values = Vec::with_capacity(items.len());
                    for item in items {
                        values.push(self.eval(item).await?);
                    }
                    bounded(ScriptValue::List(values))
                }
                Expr::Map(entries) => {
                    let mut values = IndexMap::new();
                    for (key, item) in entries {
                        values.insert(key.clone(), self.eval(item).await?);
                    }
                    bounded(ScriptValue::Map(values))
                }
                Expr::Unary(op, operand) => {
                    let value = self.eval(operand).await?;
                    match op {
                        UnaryOp::Not => Ok(ScriptValue::Boolean(!value.is_truthy())),
                        UnaryOp::Neg => value
                            .as_number()
                            .map(|n| ScriptValue::Number(-n))
                            .ok_or_else(|| {
                                ScriptError::runtime(format!("Cannot negate {}", value.type_name()))
                            }),
                    }
                }
                Expr::Binary(BinaryOp::And, left, right) => {
                    if !self.eval(left).await?.is_truthy() {
                        return Ok(ScriptValue::Boolean(false));
                    }
                    Ok(ScriptValue::Boolean(self.eval(right).await?.is_truthy()))
                }
                Expr::Binary(BinaryOp::Or, left, right) => {
                    if self.eval(left).await?.is_truthy() {
                        return Ok(ScriptValue::Boolean(true));
                    }
                    Ok(ScriptValue::Boolean(self.eval(right).await?.is_truthy()))
                }
                Expr::Binary(op, left, right) => {
                    let left = self.eval(left).await?;
                    let right = self.eval(right).await?;
                    binary(*op, left, right)
                }
                Expr::Index(target, index) => {
                    let target = self.eval(target).await?;
                    let index = self.eval(index).await?;
                    index_value(target, index)
                }
                Expr::Field(target, field) => match self.eval(target).await? {
                    ScriptValue::Map(entries) => {
                        Ok(entries.get(field).cloned().unwrap_or(ScriptValue::Null))
                    }
                    other => Err(ScriptError::runtime(format!(
                        "Cannot read field '{}' of {}",
                        field,
                        other.type_name()
                    ))),
                },
                Expr::Call(name, args) => {
                    let mut values = Vec::with_capacity(args.len());
                    for arg in args {
                        values.push(self.eval(arg).await?);
                    }
                    self.call_builtin(name, values).await
                }
            }
        }
        .boxed()
    }

    async fn call_builtin(
        &self,
        name: &str,
        args: Vec<ScriptValue>,
    ) -> Result<ScriptValue, ScriptError> {
        let arity = |expected: usize| {
            if args.len() == expected {
                Ok(())
            } else {
                Err(ScriptError::runtime(format!(
                    "{}() expects {} argument(s), got {}",
                    name,
                    expected,
                    args.len()
                )))
            }
        };

        match name {
            "state" => {
                arity(1)?;
                let entity = args[0]
                    .as_str()
                    .ok_or_else(|| ScriptError::runtime("state() expects an entity id"))?;
                Ok(self.hooks.on_get(entity).await?)
            }
            "query" => {
                arity(1)?;
                let key = args[0].to_string();
                Ok(self
                    .query
                    .get(&key)
                    .map(|v| ScriptValue::String(v.clone()))
                    .unwrap_or(ScriptValue::Null))
            }
            "len" => {
                arity(1)?;
                match &args[0] {
                    ScriptValue::String(s) => Ok(ScriptValue::Number(s.chars().count() as f64)),
                    ScriptValue::List(items) => Ok(ScriptValue::Number(items.len() as f64)),
                    ScriptValue::Map(entries) => Ok(ScriptValue::Number(entries.len() as f64)),
                    other => Err(ScriptError::runtime(format!(
                        "len() is not defined for {}",
                        other.type_name()
                    ))),
                }
            }
            "str" => {
                arity(1)?;
                Ok(ScriptValue::String(args[0].to_string()))
            }
            "num" => {
                arity(1)?;
                args[0]
                    .coerce_number()
                    .map(ScriptValue::Number)
                    .ok_or_else(|| {
                        ScriptError::runtime(format!("Cannot convert '{}' to a number", args[0]))
                    })
            }
            "contains" => {
                arity(2)?;
                let found = match (&args[0], &args[1]) {
                    (ScriptValue::String(haystack), needle) => {
                        haystack.contains(needle.to_string().as_str())
                    }
                    (ScriptValue::List(items), needle) => items.iter().any(|i| i.loose_eq(needle)),
                    (ScriptValue::Map(entries), needle) => {
                        entries.contains_key(needle.to_string().as_str())
                    }
                    (other, _) => {
                        return Err(ScriptError::runtime(format!(
                            "contains() is not defined for {}",
                            other.type_name()
                        )));
                    }
                };
                Ok(ScriptValue::Boolean(found))
            }
            "round" => {
                if args.is_empty() || args.len() > 2 {
                    return Err(ScriptError::runtime("round() expects 1 or 2 arguments"));
                }
                let value = args[0]
                    .as_number()
                    .ok_or_else(|| ScriptError::runtime("round() expects a number"))?;
                let digits = args.get(1).and_then(ScriptValue::as_number).unwrap_or(0.0);
                let factor = 10f64.powi(digits.clamp(0.0, 10.0) as i32);
                Ok(ScriptValue::Number((value * factor).round() / factor))
            }
            "upper" => {
                arity(1)?;
                Ok(ScriptValue::String(args[0].to_string().to_uppercase()))
            }
            "lower" => {
                arity(1)?;
                Ok(ScriptValue::String(args[0].to_string().to_lowercase()))
            }
            other => Err(ScriptError::runtime(format!("Unknown function '{}'", other))),
        }
    }
}

/// Rejects list and map values nested past [`MAX_NESTING_DEPTH`].
fn bounded(value: ScriptValue) -> Result<ScriptValue, ScriptError> {
    if value.depth() > MAX_NESTING_DEPTH {
        return Err(ScriptError::new(
            ScriptErrorKind::NestingLimit,
            format!("Values nested deeper than {}", MAX_NESTING_DEPTH),
        ));
    }
    Ok(value)
}

fn nested_error(name: &str, err: ScriptError) -> ScriptError {
    let location = err
        .line
        .map(|line| format!(" line {}", line))
        .unwrap_or_default();
    ScriptError {
        message: format!("In import '{}'{}: {}", name, location, err.message),
        line: None,
        ..err
    }
}

fn binary(op: BinaryOp, left: ScriptValue, right: ScriptValue) -> Result<ScriptValue, ScriptError> {
    use ScriptValue::{List, Number, String};

    let type_error = |left: &ScriptValue, right: &ScriptValue| {
        ScriptError::runtime(format!(
            "Unsupported operand types for {:?}: {} and {}",
            op,
            left.type_name(),
            right.type_name()
        ))
    };

    match op {
        BinaryOp::Add => match (left, right) {
            (Number(a), Number(b)) => Ok(Number(a + b)),
            (List(mut a), List(b)) => {
                a.extend(b);
                Ok(List(a))
            }
            (String(a), b) => Ok(String(format!("{}{}", a, b))),
            (a, String(b)) => Ok(String(format!("{}{}", a, b))),
            (a, b) => Err(type_error(&a, &b)),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            let (a, b) = match (left.as_number(), right.as_number()) {
                (Some(a), Some(b)) => (a, b),
                _ => return Err(type_error(&left, &right)),
            };
            match op {
                BinaryOp::Sub => Ok(Number(a - b)),
                BinaryOp::Mul => Ok(Number(a * b)),
                _ if b == 0.0 => Err(ScriptError::runtime("Division by zero")),
                BinaryOp::Div => Ok(Number(a / b)),
                _ => Ok(Number(a % b)),
            }
        }
        BinaryOp::Eq => Ok(ScriptValue::Boolean(left.loose_eq(&right))),
        BinaryOp::NotEq => Ok(ScriptValue::Boolean(!left.loose_eq(&right))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = left
                .partial_compare(&right)
                .ok_or_else(|| type_error(&left, &right))?;
            let result = match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            };
            Ok(ScriptValue::Boolean(result))
        }
        BinaryOp::And => Ok(ScriptValue::Boolean(left.is_truthy() && right.is_truthy())),
        BinaryOp::Or => Ok(ScriptValue::Boolean(left.is_truthy() || right.is_truthy())),
    }
}

fn index_value(target: ScriptValue, index: ScriptValue) -> Result<ScriptValue, ScriptError> {
    match (target, index) {
        (ScriptValue::List(items), ScriptValue::Number(n)) => {
            if n < 0.0 || n.fract() != 0.0 || n as usize >= items.len() {
                return Err(ScriptError::runtime(format!(
                    "Index {} out of range for list of length {}",
                    n,
                    items.len()
                )));
            }
            Ok(items[n as usize].clone())
        }
        (ScriptValue::Map(entries), key) => Ok(entries
            .get(key.to_string().as_str())
            .cloned()
            .unwrap_or(ScriptValue::Null)),
        (target, index) => Err(ScriptError::runtime(format!(
            "Cannot index {} with {}",
            target.type_name(),
            index.type_name()
        ))),
    }
}
