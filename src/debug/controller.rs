//! Debug runs: effective code, breakpoint set, mocked hooks and the
//! per-endpoint session snapshot.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

use super::sessions::{LiveDebugSession, LiveSessionStore};
use crate::homescript::value::variables_from_json;
use crate::homescript::{
    BreakpointDecision, CodeSource, Engine, HookError, ScriptHooks, ScriptValue, TraceEvent,
    effective_code, executable_lines,
};
use crate::repository::{Repository, Script};

pub const DEFAULT_LINE_DELAY_MS: u64 = 180;
pub const MAX_LINE_DELAY_MS: u64 = 5000;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DebugOptions {
    #[serde(default)]
    pub highlight_all_lines: bool,
    #[serde(default)]
    pub line_delay_ms: Option<f64>,
    #[serde(default)]
    pub breakpoints: Vec<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DebugRunRequest {
    #[serde(default)]
    pub inputs: serde_json::Value,
    #[serde(default)]
    pub mock_states: serde_json::Value,
    #[serde(default)]
    pub debug_options: DebugOptions,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCallRecord {
    pub service: String,
    pub args: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DebugRunResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<IndexMap<String, ScriptValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub effective_code: String,
    pub source: CodeSource,
    pub line_delay_ms: u64,
    pub requested_breakpoints: Vec<usize>,
    pub breakpoints: Vec<usize>,
    pub breakpoint_hits: Vec<usize>,
    pub trace_events: Vec<TraceEvent>,
    pub service_calls: Vec<ServiceCallRecord>,
    pub mock_states: IndexMap<String, ScriptValue>,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
}

/// Clamps a requested per-hit delay to `[0, 5000]` ms; absent or non-finite
/// values use the default.
pub fn clamp_line_delay(requested: Option<f64>) -> u64 {
    match requested {
        Some(ms) if ms.is_finite() => ms.round().clamp(0.0, MAX_LINE_DELAY_MS as f64) as u64,
        _ => DEFAULT_LINE_DELAY_MS,
    }
}

/// Explicit lines, plus every executable line when `highlight_all` is set.
pub fn compute_breakpoints(
    code: &str,
    requested: &[usize],
    highlight_all: bool,
) -> BTreeSet<usize> {
    let mut lines: BTreeSet<usize> = requested.iter().copied().filter(|&l| l > 0).collect();
    if highlight_all {
        lines.extend(executable_lines(code));
    }
    lines
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hooks for debug runs. Service calls are recorded and always succeed;
/// state lives in the caller-seeded mock map.
pub struct DebugHooks {
    repository: Arc<Repository>,
    line_delay: Duration,
    mock_states: Mutex<IndexMap<String, ScriptValue>>,
    service_calls: Mutex<Vec<ServiceCallRecord>>,
    breakpoint_hits: Mutex<Vec<usize>>,
    trace_events: Mutex<Vec<TraceEvent>>,
}

impl DebugHooks {
    pub fn new(
        repository: Arc<Repository>,
        mock_states: IndexMap<String, ScriptValue>,
        line_delay_ms: u64,
    ) -> Self {
        Self {
            repository,
            line_delay: Duration::from_millis(line_delay_ms),
            mock_states: Mutex::new(mock_states),
            service_calls: Mutex::new(Vec::new()),
            breakpoint_hits: Mutex::new(Vec::new()),
            trace_events: Mutex::new(Vec::new()),
        }
    }

    pub fn mock_states(&self) -> IndexMap<String, ScriptValue> {
        lock(&self.mock_states).clone()
    }

    pub fn service_calls(&self) -> Vec<ServiceCallRecord> {
        lock(&self.service_calls).clone()
    }

    pub fn breakpoint_hits(&self) -> Vec<usize> {
        lock(&self.breakpoint_hits).clone()
    }

    pub fn trace_events(&self) -> Vec<TraceEvent> {
        lock(&self.trace_events).clone()
    }
}

#[async_trait]
impl ScriptHooks for DebugHooks {
    async fn on_call(&self, service: &str, args: ScriptValue) -> Result<ScriptValue, HookError> {
        lock(&self.service_calls).push(ServiceCallRecord {
            service: service.to_string(),
            args: args.to_json(),
            timestamp: Utc::now(),
        });
        Ok(ScriptValue::from(serde_json::json!({
            "success": true,
            "service": service,
            "mocked": true,
        })))
    }

    async fn on_get(&self, entity_id: &str) -> Result<ScriptValue, HookError> {
        Ok(lock(&self.mock_states)
            .get(entity_id)
            .cloned()
            .unwrap_or_else(|| ScriptValue::string("unknown")))
    }

    async fn on_set(&self, entity_id: &str, value: ScriptValue) -> Result<ScriptValue, HookError> {
        lock(&self.mock_states).insert(entity_id.to_string(), value.clone());
        Ok(value)
    }

    async fn import_script(&self, name: &str) -> Result<String, HookError> {
        self.repository
            .get_script_by_endpoint(name)
            .map(|script| script.code)
            .ok_or_else(|| HookError::NotFound(name.to_string()))
    }

    async fn on_breakpoint(&self, line: usize) -> BreakpointDecision {
        lock(&self.breakpoint_hits).push(line);
        if !self.line_delay.is_zero() {
            tokio::time::sleep(self.line_delay).await;
        }
        BreakpointDecision::Continue
    }

    fn on_event(&self, event: TraceEvent) {
        lock(&self.trace_events).push(event);
    }
}

/// Drives debug runs and keeps the last session of every endpoint.
pub struct DebugController {
    repository: Arc<Repository>,
    sessions: Arc<LiveSessionStore>,
}

impl DebugController {
    pub fn new(repository: Arc<Repository>, sessions: Arc<LiveSessionStore>) -> Self {
        Self {
            repository,
            sessions,
        }
    }

    pub fn sessions(&self) -> &LiveSessionStore {
        &self.sessions
    }

    /// Script test parameters with the request inputs layered on top.
    fn inputs(script: &Script, request: &DebugRunRequest) -> IndexMap<String, ScriptValue> {
        let mut variables = variables_from_json(&script.test_params);
        variables.extend(variables_from_json(&request.inputs));
        variables
    }

    /// Runs `script` under the debugger. Script failures are reported in the
    /// response, never as an `Err`. Every run replaces the endpoint's session.
    pub async fn run(&self, script: &Script, request: DebugRunRequest) -> DebugRunResponse {
        let effective = effective_code(&script.code, script.debug_code.as_deref());
        let options = &request.debug_options;
        let line_delay_ms = clamp_line_delay(options.line_delay_ms);
        let breakpoints = compute_breakpoints(
            &effective.code,
            &options.breakpoints,
            options.highlight_all_lines,
        );

        debug!(
            endpoint = %script.endpoint,
            source = ?effective.source,
            breakpoints = breakpoints.len(),
            line_delay_ms,
            "Starting debug run"
        );

        let hooks = Arc::new(DebugHooks::new(
            self.repository.clone(),
            variables_from_json(&request.mock_states),
            line_delay_ms,
        ));
        let result = Engine::new(hooks.clone())
            .with_variables(Self::inputs(script, &request))
            .with_debug(true)
            .with_breakpoints(breakpoints.iter().copied())
            .with_script_name(script.endpoint.clone())
            .execute(&effective.code)
            .await;

        let session_id = uuid::Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let mut response = DebugRunResponse {
            success: result.is_ok(),
            output: None,
            variables: None,
            error: None,
            line: None,
            status: None,
            effective_code: effective.code,
            source: effective.source,
            line_delay_ms,
            requested_breakpoints: options.breakpoints.clone(),
            breakpoints: breakpoints.into_iter().collect(),
            breakpoint_hits: hooks.breakpoint_hits(),
            trace_events: hooks.trace_events(),
            service_calls: hooks.service_calls(),
            mock_states: hooks.mock_states(),
            session_id: session_id.clone(),
            created_at,
        };
        match result {
            Ok(outcome) => {
                response.output = Some(outcome.output);
                response.variables = Some(outcome.variables);
            }
            Err(err) => {
                response.error = Some(err.message);
                response.line = err.line;
                response.status = Some(err.status);
            }
        }

        info!(
            endpoint = %script.endpoint,
            session_id = %session_id,
            success = response.success,
            "Debug run finished"
        );
        self.sessions.store(LiveDebugSession {
            session_id,
            endpoint: script.endpoint.clone(),
            created_at,
            payload: response.clone(),
        });

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_line_delay() {
        assert_eq!(clamp_line_delay(None), DEFAULT_LINE_DELAY_MS);
        assert_eq!(clamp_line_delay(Some(-5.0)), 0);
        assert_eq!(clamp_line_delay(Some(0.0)), 0);
        assert_eq!(clamp_line_delay(Some(250.4)), 250);
        assert_eq!(clamp_line_delay(Some(99_999.0)), MAX_LINE_DELAY_MS);
        assert_eq!(clamp_line_delay(Some(f64::NAN)), DEFAULT_LINE_DELAY_MS);
    }

    #[test]
    fn test_breakpoint_union_deduplicates() {
        let code = "SET $a = 1\n\nSET $b = 2\n# note\nPRINT $a + $b";
        let set = compute_breakpoints(code, &[3], true);
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec![1, 3, 5]);
    }

    #[test]
    fn test_explicit_breakpoints_only() {
        let code = "SET $a = 1\nSET $b = 2";
        let set = compute_breakpoints(code, &[2, 2, 0], false);
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_request_deserializes_camel_case() {
        let request: DebugRunRequest = serde_json::from_str(
            r#"{"inputs":{"a":1},"mockStates":{"light.x":"on"},
                "debugOptions":{"highlightAllLines":true,"lineDelayMs":0,"breakpoints":[2]}}"#,
        )
        .unwrap();
        assert!(request.debug_options.highlight_all_lines);
        assert_eq!(request.debug_options.line_delay_ms, Some(0.0));
        assert_eq!(request.debug_options.breakpoints, vec![2]);
    }

    #[tokio::test]
    async fn test_mock_state_reads_observe_writes() {
        let hooks = DebugHooks::new(Arc::new(Repository::new()), IndexMap::new(), 0);
        assert_eq!(hooks.on_get("light.x").await.unwrap(), ScriptValue::string("unknown"));
        hooks
            .on_set("light.x", ScriptValue::string("on"))
            .await
            .unwrap();
        assert_eq!(hooks.on_get("light.x").await.unwrap(), ScriptValue::string("on"));
    }
}
