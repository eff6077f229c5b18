use async_trait::async_trait;
use homescript::homescript::{
    BreakpointDecision, Engine, HookError, ScriptErrorKind, ScriptHooks, ScriptValue, TraceEvent,
    TraceEventType,
};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Hooks that record every interaction in order.
#[derive(Default)]
struct RecordingHooks {
    log: Mutex<Vec<String>>,
    states: Mutex<HashMap<String, ScriptValue>>,
    scripts: HashMap<String, String>,
    fail_calls: bool,
    events: Mutex<Vec<TraceEvent>>,
}

impl RecordingHooks {
    fn with_scripts(scripts: &[(&str, &str)]) -> Self {
        Self {
            scripts: scripts
                .iter()
                .map(|(name, code)| (name.to_string(), code.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScriptHooks for RecordingHooks {
    async fn on_call(&self, service: &str, args: ScriptValue) -> Result<ScriptValue, HookError> {
        self.log.lock().unwrap().push(format!("call {} {}", service, args));
        if self.fail_calls {
            return Err(HookError::upstream("service unavailable"));
        }
        Ok(ScriptValue::Boolean(true))
    }

    async fn on_get(&self, entity_id: &str) -> Result<ScriptValue, HookError> {
        self.log.lock().unwrap().push(format!("get {}", entity_id));
        Ok(self
            .states
            .lock()
            .unwrap()
            .get(entity_id)
            .cloned()
            .unwrap_or_else(|| ScriptValue::string("unknown")))
    }

    async fn on_set(&self, entity_id: &str, value: ScriptValue) -> Result<ScriptValue, HookError> {
        self.log.lock().unwrap().push(format!("set {} {}", entity_id, value));
        self.states
            .lock()
            .unwrap()
            .insert(entity_id.to_string(), value.clone());
        Ok(value)
    }

    async fn import_script(&self, name: &str) -> Result<String, HookError> {
        self.scripts
            .get(name)
            .cloned()
            .ok_or_else(|| HookError::NotFound(name.to_string()))
    }

    async fn on_breakpoint(&self, line: usize) -> BreakpointDecision {
        self.log.lock().unwrap().push(format!("break {}", line));
        BreakpointDecision::Continue
    }

    fn on_event(&self, event: TraceEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn vars(pairs: &[(&str, ScriptValue)]) -> IndexMap<String, ScriptValue> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[tokio::test]
async fn test_missing_required_fails_before_any_hook() {
    let hooks = Arc::new(RecordingHooks::default());
    let err = Engine::new(hooks.clone())
        .execute("REQUIRED $room\nCALL light.turn_on WITH {\"entity_id\": $room}")
        .await
        .unwrap_err();

    assert_eq!(err.kind, ScriptErrorKind::MissingRequired);
    assert_eq!(err.status, 422);
    assert_eq!(err.line, Some(1));
    assert!(hooks.log().is_empty());
}

#[tokio::test]
async fn test_optional_defaults_are_bound() {
    let hooks = Arc::new(RecordingHooks::default());
    let outcome = Engine::new(hooks)
        .with_variables(vars(&[("room", "hall".into())]))
        .execute("REQUIRED $room\nOPTIONAL $level = 40\nOPTIONAL $note\nPRINT $room + \":\" + $level")
        .await
        .unwrap();

    assert_eq!(outcome.output, "hall:40");
    assert_eq!(outcome.variables.get("level"), Some(&ScriptValue::Number(40.0)));
    assert_eq!(outcome.variables.get("note"), Some(&ScriptValue::Null));
}

#[tokio::test]
async fn test_conditional_required() {
    let code = "OPTIONAL $mode = \"auto\"\nREQUIRED $level IF ($mode == \"manual\")\nPRINT $mode";

    let outcome = Engine::new(Arc::new(RecordingHooks::default()))
        .execute(code)
        .await
        .unwrap();
    assert_eq!(outcome.output, "auto");

    let err = Engine::new(Arc::new(RecordingHooks::default()))
        .with_variables(vars(&[("mode", "manual".into())]))
        .execute(code)
        .await
        .unwrap_err();
    assert_eq!(err.status, 422);
    assert_eq!(err.line, Some(2));
}

#[tokio::test]
async fn test_hooks_run_in_source_order() {
    let hooks = Arc::new(RecordingHooks::default());
    let code = "\
CALL light.turn_on WITH {\"entity_id\": \"light.kitchen\"} AS $ok
STATE input_number.level = 3
GET input_number.level AS $level
SET $double = $level * 2
PRINT $double";

    let outcome = Engine::new(hooks.clone()).execute(code).await.unwrap();

    assert_eq!(outcome.output, "6");
    assert_eq!(outcome.variables.get("ok"), Some(&ScriptValue::Boolean(true)));
    assert_eq!(
        hooks.log(),
        vec![
            "call light.turn_on {\"entity_id\":\"light.kitchen\"}".to_string(),
            "set input_number.level 3".to_string(),
            "get input_number.level".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_unknown_state_reads_as_unknown() {
    let outcome = Engine::new(Arc::new(RecordingHooks::default()))
        .execute("GET sensor.missing AS $v\nPRINT state(\"sensor.missing\")")
        .await
        .unwrap();
    assert_eq!(outcome.variables.get("v"), Some(&ScriptValue::string("unknown")));
    assert_eq!(outcome.output, "unknown");
}

#[tokio::test]
async fn test_hook_failure_aborts_with_line() {
    let hooks = Arc::new(RecordingHooks {
        fail_calls: true,
        ..Default::default()
    });
    let err = Engine::new(hooks.clone())
        .execute("PRINT \"before\"\nCALL light.turn_on\nSTATE light.kitchen = \"on\"")
        .await
        .unwrap_err();

    assert_eq!(err.kind, ScriptErrorKind::Hook);
    assert_eq!(err.status, 502);
    assert_eq!(err.line, Some(2));
    assert_eq!(hooks.log().len(), 1);
}

#[tokio::test]
async fn test_fail_statement_status_and_line() {
    let err = Engine::new(Arc::new(RecordingHooks::default()))
        .execute("SET $a = 1\nIF $a == 1\nFAIL \"conflict\" STATUS 409\nEND")
        .await
        .unwrap_err();
    assert_eq!(err.message, "conflict");
    assert_eq!(err.status, 409);
    assert_eq!(err.line, Some(3));

    let err = Engine::new(Arc::new(RecordingHooks::default()))
        .execute("PRINT $nope")
        .await
        .unwrap_err();
    assert_eq!(err.status, 400);
    assert_eq!(err.line, Some(1));
}

#[tokio::test]
async fn test_import_runs_inline() {
    let hooks = Arc::new(RecordingHooks::with_scripts(&[(
        "helpers",
        "OPTIONAL $greeting = \"hi\"\nSET $shared = upper($greeting)",
    )]));
    let outcome = Engine::new(hooks)
        .execute("IMPORT helpers\nPRINT $shared")
        .await
        .unwrap();
    assert_eq!(outcome.output, "HI");
    assert_eq!(outcome.variables.get("greeting"), Some(&ScriptValue::string("hi")));
}

#[tokio::test]
async fn test_import_cycle_is_detected() {
    let hooks = Arc::new(RecordingHooks::with_scripts(&[
        ("a", "IMPORT b"),
        ("b", "IMPORT a"),
    ]));
    let err = Engine::new(hooks)
        .with_script_name("main")
        .execute("IMPORT a")
        .await
        .unwrap_err();
    assert_eq!(err.kind, ScriptErrorKind::ImportCycle);
    assert_eq!(err.line, Some(1));
}

#[tokio::test]
async fn test_self_import_is_a_cycle() {
    let hooks = Arc::new(RecordingHooks::with_scripts(&[("main", "PRINT 1")]));
    let err = Engine::new(hooks)
        .with_script_name("main")
        .execute("IMPORT main")
        .await
        .unwrap_err();
    assert_eq!(err.kind, ScriptErrorKind::ImportCycle);
}

#[tokio::test]
async fn test_diamond_imports_are_allowed() {
    let hooks = Arc::new(RecordingHooks::with_scripts(&[
        ("left", "IMPORT base"),
        ("right", "IMPORT base"),
        ("base", "PRINT \"base\""),
    ]));
    let outcome = Engine::new(hooks)
        .execute("IMPORT left\nIMPORT right")
        .await
        .unwrap();
    assert_eq!(outcome.output, "base\nbase");
}

#[tokio::test]
async fn test_missing_import_is_not_found() {
    let err = Engine::new(Arc::new(RecordingHooks::default()))
        .execute("PRINT 1\nIMPORT nowhere")
        .await
        .unwrap_err();
    assert_eq!(err.kind, ScriptErrorKind::ImportNotFound);
    assert_eq!(err.status, 404);
    assert_eq!(err.line, Some(2));
}

#[tokio::test]
async fn test_breakpoint_pauses_before_line_effects() {
    let hooks = Arc::new(RecordingHooks::default());
    Engine::new(hooks.clone())
        .with_debug(true)
        .with_breakpoints([2])
        .execute("STATE a.b = 1\nSTATE a.c = 2")
        .await
        .unwrap();

    assert_eq!(
        hooks.log(),
        vec![
            "set a.b 1".to_string(),
            "break 2".to_string(),
            "set a.c 2".to_string(),
        ]
    );
    assert!(
        hooks
            .events()
            .iter()
            .any(|e| e.event_type == TraceEventType::Breakpoint && e.line == Some(2))
    );
}

#[tokio::test]
async fn test_trace_events_only_in_debug() {
    let hooks = Arc::new(RecordingHooks::default());
    Engine::new(hooks.clone())
        .execute("PRINT 1\nPRINT 2")
        .await
        .unwrap();
    assert!(hooks.events().is_empty());

    let hooks = Arc::new(RecordingHooks::default());
    Engine::new(hooks.clone())
        .with_debug(true)
        .execute("PRINT 1\nPRINT 2")
        .await
        .unwrap();
    let lines: Vec<Option<usize>> = hooks
        .events()
        .iter()
        .filter(|e| e.event_type == TraceEventType::Line)
        .map(|e| e.line)
        .collect();
    assert_eq!(lines, vec![Some(1), Some(2)]);
}

#[tokio::test]
async fn test_error_emits_error_event() {
    let hooks = Arc::new(RecordingHooks::default());
    let _ = Engine::new(hooks.clone())
        .execute("PRINT 1\nFAIL \"boom\"")
        .await;
    let events = hooks.events();
    let last = events.last().unwrap();
    assert_eq!(last.event_type, TraceEventType::Error);
    assert_eq!(last.line, Some(2));
}

#[tokio::test]
async fn test_query_echo() {
    let mut query = IndexMap::new();
    query.insert("source".to_string(), "button".to_string());
    let outcome = Engine::new(Arc::new(RecordingHooks::default()))
        .with_query(query)
        .execute("PRINT query(\"source\")\nPRINT query(\"other\")")
        .await
        .unwrap();
    assert_eq!(outcome.output, "button\nnull");
}

#[tokio::test]
async fn test_while_iteration_cap() {
    let err = Engine::new(Arc::new(RecordingHooks::default()))
        .execute("SET $i = 0\nWHILE true\nSET $i = $i + 1\nEND")
        .await
        .unwrap_err();
    assert_eq!(err.kind, ScriptErrorKind::IterationLimit);
    assert_eq!(err.line, Some(2));
}

#[tokio::test]
async fn test_for_and_return() {
    let code = "\
SET $total = 0
FOR $n IN [1, 2, 3, 4]
SET $total = $total + $n
IF $total > 5
RETURN \"stopped at \" + $n
END
END
PRINT \"unreachable\"";
    let outcome = Engine::new(Arc::new(RecordingHooks::default()))
        .execute(code)
        .await
        .unwrap();
    assert_eq!(outcome.output, "stopped at 3");
    assert_eq!(outcome.variables.get("total"), Some(&ScriptValue::Number(6.0)));
}

#[tokio::test]
async fn test_breakpoint_on_declaration_precedes_binding() {
    let hooks = Arc::new(RecordingHooks::default());
    let outcome = Engine::new(hooks.clone())
        .with_debug(true)
        .with_breakpoints([1])
        .execute("OPTIONAL $a = 5\nPRINT $a")
        .await
        .unwrap();
    assert_eq!(outcome.output, "5");

    let line_one: Vec<TraceEventType> = hooks
        .events()
        .iter()
        .filter(|e| e.line == Some(1))
        .map(|e| e.event_type)
        .collect();
    assert_eq!(
        line_one,
        vec![
            TraceEventType::Line,
            TraceEventType::Breakpoint,
            TraceEventType::Declaration,
        ]
    );
}

#[tokio::test]
async fn test_missing_required_fails_before_declaration_breakpoint() {
    let hooks = Arc::new(RecordingHooks::default());
    let err = Engine::new(hooks.clone())
        .with_breakpoints([1, 2])
        .execute("REQUIRED $room\nPRINT $room")
        .await
        .unwrap_err();
    assert_eq!(err.status, 422);
    assert!(hooks.log().is_empty());
}

#[tokio::test]
async fn test_deeply_nested_expression_is_a_syntax_error() {
    let hooks = Arc::new(RecordingHooks::default());
    let code = format!(
        "PRINT 1\nSET $x = {}1{}",
        "(".repeat(20_000),
        ")".repeat(20_000)
    );
    let err = Engine::new(hooks.clone()).execute(&code).await.unwrap_err();
    assert_eq!(err.kind, ScriptErrorKind::Syntax);
    assert_eq!(err.line, Some(2));
    assert!(hooks.log().is_empty());
}

#[tokio::test]
async fn test_nesting_across_imports_is_bounded() {
    let scripts: Vec<(String, String)> = (0..10)
        .map(|i| {
            let inner = if i == 9 {
                "PRINT \"deep\"".to_string()
            } else {
                format!("IMPORT s{}", i + 1)
            };
            (
                format!("s{}", i),
                format!("{}{}\n{}", "IF true\n".repeat(10), inner, "END\n".repeat(10)),
            )
        })
        .collect();
    let refs: Vec<(&str, &str)> = scripts
        .iter()
        .map(|(name, code)| (name.as_str(), code.as_str()))
        .collect();

    let err = Engine::new(Arc::new(RecordingHooks::with_scripts(&refs)))
        .execute("IMPORT s0")
        .await
        .unwrap_err();
    assert_eq!(err.kind, ScriptErrorKind::NestingLimit);
    assert_eq!(err.line, Some(1));
}

#[tokio::test]
async fn test_values_nested_in_a_loop_are_bounded() {
    let code = "\
SET $v = 0
SET $n = 0
WHILE $n < 1000
SET $v = [$v]
SET $n = $n + 1
END";
    let err = Engine::new(Arc::new(RecordingHooks::default()))
        .execute(code)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ScriptErrorKind::NestingLimit);
    assert_eq!(err.line, Some(4));
}
