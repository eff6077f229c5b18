//! Declaration header parsing.
//!
//! A script may open with a block of `REQUIRED` / `OPTIONAL` statements that
//! describe its inputs. The block is the leading run of non-blank,
//! non-comment lines; it ends for good at the first line that is not a
//! declaration, so declarations further down are never picked up.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

use super::value::ScriptValue;

lazy_static! {
    static ref REQUIRED_RE: Regex =
        Regex::new(r"^REQUIRED\s+\$([A-Za-z_][A-Za-z0-9_]*)(?:\s+IF\s*\((.*)\))?\s*$")
            .expect("valid REQUIRED pattern");
    static ref OPTIONAL_RE: Regex = Regex::new(
        r"^OPTIONAL\s+\$([A-Za-z_][A-Za-z0-9_]*)(?:\s*=\s*(.+?))?(?:\s+IF\s*\((.*)\))?\s*$"
    )
    .expect("valid OPTIONAL pattern");
    static ref NUMBER_RE: Regex =
        Regex::new(r"^[+-]?(?:\d+(?:\.\d+)?|\.\d+)$").expect("valid number pattern");
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequiredDecl {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptionalDecl {
    pub name: String,
    /// Default as written in the source, if any
    #[serde(rename = "defaultRaw", skip_serializing_if = "Option::is_none")]
    pub default_raw: Option<String>,
    #[serde(rename = "defaultValue", skip_serializing_if = "Option::is_none")]
    pub default_value: Option<ScriptValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Declaration {
    Required(RequiredDecl),
    Optional(OptionalDecl),
}

impl Declaration {
    pub fn name(&self) -> &str {
        match self {
            Declaration::Required(d) => &d.name,
            Declaration::Optional(d) => &d.name,
        }
    }

    pub fn line(&self) -> usize {
        match self {
            Declaration::Required(d) => d.line,
            Declaration::Optional(d) => d.line,
        }
    }
}

/// Declarations in source order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Declarations {
    pub items: Vec<Declaration>,
}

impl Declarations {
    pub fn required(&self) -> impl Iterator<Item = &RequiredDecl> {
        self.items.iter().filter_map(|d| match d {
            Declaration::Required(r) => Some(r),
            _ => None,
        })
    }

    pub fn optional(&self) -> impl Iterator<Item = &OptionalDecl> {
        self.items.iter().filter_map(|d| match d {
            Declaration::Optional(o) => Some(o),
            _ => None,
        })
    }

    /// Header declaration on `line`, if any.
    pub fn at_line(&self, line: usize) -> Option<&Declaration> {
        self.items.iter().find(|d| d.line() == line)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

fn is_skippable(trimmed: &str) -> bool {
    trimmed.is_empty() || trimmed.starts_with('#')
}

/// Parses the declaration header of `code`.
pub fn parse_declarations(code: &str) -> Declarations {
    let mut items = Vec::new();

    for (index, raw) in code.lines().enumerate() {
        let line = index + 1;
        let trimmed = raw.trim();
        if is_skippable(trimmed) {
            continue;
        }

        if let Some(caps) = REQUIRED_RE.captures(trimmed) {
            items.push(Declaration::Required(RequiredDecl {
                name: caps[1].to_string(),
                condition: caps.get(2).map(|m| m.as_str().trim().to_string()),
                line,
            }));
        } else if let Some(caps) = OPTIONAL_RE.captures(trimmed) {
            let default_raw = caps.get(2).map(|m| m.as_str().trim().to_string());
            let default_value = default_raw.as_deref().map(normalize_default);
            items.push(Declaration::Optional(OptionalDecl {
                name: caps[1].to_string(),
                default_raw,
                default_value,
                condition: caps.get(3).map(|m| m.as_str().trim().to_string()),
                line,
            }));
        } else {
            break;
        }
    }

    Declarations { items }
}

/// Coerces a default literal written after `OPTIONAL $name =`.
///
/// Double-quoted text is JSON-decoded, `true`/`false` (any case) become
/// booleans, signed integers and decimals become numbers, anything else is
/// kept as a string with surrounding quotes removed.
pub fn normalize_default(raw: &str) -> ScriptValue {
    let raw = raw.trim();

    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        return match serde_json::from_str::<String>(raw) {
            Ok(decoded) => ScriptValue::String(decoded),
            Err(_) => ScriptValue::String(raw[1..raw.len() - 1].to_string()),
        };
    }

    if raw.eq_ignore_ascii_case("true") {
        return ScriptValue::Boolean(true);
    }
    if raw.eq_ignore_ascii_case("false") {
        return ScriptValue::Boolean(false);
    }

    if NUMBER_RE.is_match(raw)
        && let Ok(n) = raw.parse::<f64>()
    {
        return ScriptValue::Number(n);
    }

    if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        return ScriptValue::String(raw[1..raw.len() - 1].to_string());
    }

    ScriptValue::String(raw.to_string())
}

/// 1-based numbers of every non-blank, non-comment line.
pub fn executable_lines(code: &str) -> Vec<usize> {
    code.lines()
        .enumerate()
        .filter(|(_, raw)| !is_skippable(raw.trim()))
        .map(|(index, _)| index + 1)
        .collect()
}

/// Which stored source a run used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeSource {
    Main,
    Debug,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveCode {
    pub code: String,
    pub source: CodeSource,
}

/// Picks the trimmed debug override when it is non-empty, else the main code.
///
/// The source is reported by comparing the chosen text with the main code, so
/// an override identical to the main code reports `main`.
pub fn effective_code(main: &str, debug_override: Option<&str>) -> EffectiveCode {
    let code = match debug_override.map(str::trim) {
        Some(debug) if !debug.is_empty() => debug.to_string(),
        _ => main.to_string(),
    };
    let source = if code == main {
        CodeSource::Main
    } else {
        CodeSource::Debug
    };
    EffectiveCode { code, source }
}
