//! HomeScript: the small automation language run by the server.

pub mod declarations;
pub mod error;
pub mod interpreter;
pub mod lexer;
pub mod parser;
pub mod value;

pub use declarations::{
    CodeSource, Declaration, Declarations, EffectiveCode, OptionalDecl, RequiredDecl,
    effective_code, executable_lines, normalize_default, parse_declarations,
};
pub use error::{HookError, ScriptError, ScriptErrorKind};
pub use interpreter::{
    BreakpointDecision, Engine, ExecutionOutcome, ScriptHooks, TraceEvent, TraceEventType,
    TraceLevel,
};
pub use value::ScriptValue;
