use thiserror::Error;

/// Default status for script failures that do not pick their own.
pub const DEFAULT_SCRIPT_STATUS: u16 = 400;

/// Status reported when a REQUIRED variable is left unbound.
pub const MISSING_REQUIRED_STATUS: u16 = 422;

/// Classification of engine failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptErrorKind {
    Syntax,
    Runtime,
    MissingRequired,
    ImportNotFound,
    ImportCycle,
    ImportDepth,
    IterationLimit,
    NestingLimit,
    Hook,
    /// Raised by the script itself via `FAIL`
    Raised,
}

/// Error raised by a HomeScript run.
///
/// `line` is the 1-based source line of the statement that failed, when it is
/// known. `status` is the HTTP-style status chosen by the engine; callers must
/// pass both through unchanged.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message}")]
pub struct ScriptError {
    pub kind: ScriptErrorKind,
    pub message: String,
    pub line: Option<usize>,
    pub status: u16,
}

impl ScriptError {
    pub fn new(kind: ScriptErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            line: None,
            status: DEFAULT_SCRIPT_STATUS,
        }
    }

    pub fn syntax(message: impl Into<String>, line: usize) -> Self {
        Self::new(ScriptErrorKind::Syntax, message).at_line(line)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ScriptErrorKind::Runtime, message)
    }

    pub fn missing_required(name: &str, line: usize) -> Self {
        Self::new(
            ScriptErrorKind::MissingRequired,
            format!("Missing required variable ${}", name),
        )
        .at_line(line)
        .with_status(MISSING_REQUIRED_STATUS)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    /// Attributes the error to `line` unless a more precise line is already set.
    pub fn at_line(mut self, line: usize) -> Self {
        if self.line.is_none() {
            self.line = Some(line);
        }
        self
    }
}

/// Failure reported by a hook implementation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HookError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{message}")]
    Failed { message: String, status: u16 },
}

impl HookError {
    /// Upstream failure with the conventional 502 status
    pub fn upstream(message: impl Into<String>) -> Self {
        HookError::Failed {
            message: message.into(),
            status: 502,
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            HookError::NotFound(_) => 404,
            HookError::Failed { status, .. } => *status,
        }
    }
}

impl From<HookError> for ScriptError {
    fn from(err: HookError) -> Self {
        let status = err.status();
        ScriptError::new(ScriptErrorKind::Hook, err.to_string()).with_status(status)
    }
}
