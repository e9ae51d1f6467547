use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ========================= Action Model =========================

/// Closed set of executable device actions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionType {
    Click,
    DoubleClick,
    RightClick,
    Type,
    Press,
    Hotkey,
    Scroll,
    Wait,
    Navigate,
    Drag,
    Hover,
}

impl ActionType {
    /// Normalize a loose surface string ("left-click", "doubleclick",
    /// "shortcut", ...) onto the closed set. Returns `None` for anything
    /// unrecognized; the caller treats that as "no action determined".
    pub fn from_loose(raw: &str) -> Option<Self> {
        let norm: String = raw
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c == '_' || c == ' ' { '-' } else { c })
            .collect();
        let t = match norm.as_str() {
            "click" | "left-click" | "leftclick" | "single-click" | "tap" => Self::Click,
            "double-click" | "doubleclick" | "dblclick" => Self::DoubleClick,
            "right-click" | "rightclick" | "context-click" | "context-menu" => Self::RightClick,
            "type" | "input" | "enter-text" | "text-entry" => Self::Type,
            "press" | "key" | "keypress" | "key-press" => Self::Press,
            "hotkey" | "shortcut" | "key-combo" | "combo" => Self::Hotkey,
            "scroll" | "wheel" => Self::Scroll,
            "wait" | "pause" | "sleep" | "delay" => Self::Wait,
            "navigate" | "open" | "goto" | "go-to" | "launch" | "browse" => Self::Navigate,
            "drag" | "drag-drop" | "dragdrop" | "drag-and-drop" => Self::Drag,
            "hover" | "mouseover" | "mouse-over" | "move" => Self::Hover,
            _ => return None,
        };
        Some(t)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Click => "click",
            Self::DoubleClick => "double-click",
            Self::RightClick => "right-click",
            Self::Type => "type",
            Self::Press => "press",
            Self::Hotkey => "hotkey",
            Self::Scroll => "scroll",
            Self::Wait => "wait",
            Self::Navigate => "navigate",
            Self::Drag => "drag",
            Self::Hover => "hover",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i64,
    pub y: i64,
}

/// One structured, executable unit of device interaction. Immutable once
/// produced by the parser; consumed by the safety validator, the retry
/// coordinator and the executor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParsedAction {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub description: String,
    pub target: Option<String>,
    pub coordinates: Option<Point>,
    pub params: Map<String, Value>,
    pub confidence: f64,
}

impl ParsedAction {
    /// String parameter lookup with an owned copy, used all over the safety
    /// checks.
    pub fn param_str(&self, key: &str) -> Option<String> {
        self.params
            .get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }
}

/// Parsed screen analysis from a vision-prompted model call.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ScreenAnalysis {
    pub is_task_complete: bool,
    pub current_state: String,
    pub visible_elements: Vec<String>,
    pub suggestions: Vec<String>,
}

// ========================= Parser =========================

const HEURISTIC_CONFIDENCE: f64 = 0.3;
const STRUCTURED_CONFIDENCE: f64 = 0.8;
const DESCRIPTION_PREVIEW_CHARS: usize = 200;

/// Convert raw model output into a structured action.
///
/// Extraction layers, in order: whole-text JSON parse, fenced code block,
/// first balanced object literal, natural-language heuristic. Models do not
/// reliably emit well-formed structured output, so a formatting slip degrades
/// to the heuristic path instead of failing the step outright. Returns `None`
/// only when no layer can determine an action; never panics.
pub fn parse_action(raw: &str) -> Option<ParsedAction> {
    if let Some(v) = structured_value(raw) {
        if let Some(action) = decode_action(&v) {
            return Some(action);
        }
    }
    heuristic_action(raw)
}

/// Parse a list of actions: a JSON array, an `{"actions": [...]}` wrapper, or
/// one action per line. Unparseable entries are skipped.
pub fn parse_actions(raw: &str) -> Vec<ParsedAction> {
    if let Some(v) = structured_value(raw) {
        let items = match &v {
            Value::Array(items) => Some(items.clone()),
            Value::Object(obj) => obj.get("actions").and_then(|a| a.as_array()).cloned(),
            _ => None,
        };
        if let Some(items) = items {
            return items.iter().filter_map(decode_action).collect();
        }
        if let Some(single) = decode_action(&v) {
            return vec![single];
        }
    }
    raw.lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .filter_map(parse_action)
        .collect()
}

/// Parse a screen-analysis response. Structured answers are decoded field by
/// field; anything else goes through a text heuristic, so this never fails.
/// An unreadable analysis is just "not complete, state unknown".
pub fn parse_analysis(raw: &str) -> ScreenAnalysis {
    if let Some(v) = structured_value(raw) {
        if let Some(obj) = v.as_object() {
            return ScreenAnalysis {
                is_task_complete: get_any(obj, &["isTaskComplete", "is_task_complete", "taskComplete", "complete", "done"])
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
                current_state: get_any(obj, &["currentState", "current_state", "state"])
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                visible_elements: string_list(get_any(obj, &["visibleElements", "visible_elements", "elements"])),
                suggestions: string_list(get_any(obj, &["suggestions", "nextSteps", "next_steps"])),
            };
        }
    }
    heuristic_analysis(raw)
}

/// Layered structured extraction shared by the three parse entry points and
/// by the planner's plan-response handling.
pub(crate) fn structured_value(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        if v.is_object() || v.is_array() {
            return Some(v);
        }
    }
    if let Some(block) = fenced_block(trimmed) {
        if let Ok(v) = serde_json::from_str::<Value>(block.trim()) {
            if v.is_object() || v.is_array() {
                return Some(v);
            }
        }
    }
    first_object_literal(trimmed)
}

/// Contents of the first fenced code block, language tag stripped.
fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let rest = &text[start + 3..];
    let body_start = rest.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &rest[body_start..];
    let end = body.find("```")?;
    Some(&body[..end])
}

/// Scan for the first balanced `{...}` literal that parses as JSON, honoring
/// string escapes so braces inside quoted text do not end the scan early.
fn first_object_literal(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find('{') {
        let open = search_from + offset;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (i, &b) in bytes[open..].iter().enumerate() {
            if escaped {
                escaped = false;
                continue;
            }
            match b {
                b'\\' if in_string => escaped = true,
                b'"' => in_string = !in_string,
                b'{' if !in_string => depth += 1,
                b'}' if !in_string => {
                    depth -= 1;
                    if depth == 0 {
                        let candidate = &text[open..=open + i];
                        if let Ok(v) = serde_json::from_str::<Value>(candidate) {
                            return Some(v);
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
        search_from = open + 1;
    }
    None
}

fn get_any<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k))
}

fn string_list(v: Option<&Value>) -> Vec<String> {
    v.and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

/// Decode a structured object into a `ParsedAction`. Unrecognized types
/// yield `None`; missing per-type parameters get explicit defaults so a
/// structurally valid but incomplete answer never produces an action with
/// undefined required fields.
fn decode_action(v: &Value) -> Option<ParsedAction> {
    let obj = v.as_object()?;
    let type_str = get_any(obj, &["type", "action", "actionType", "action_type"])?.as_str()?;
    let action_type = ActionType::from_loose(type_str)?;

    let mut params = obj
        .get("params")
        .and_then(|p| p.as_object())
        .cloned()
        .unwrap_or_default();

    // Per-type parameter defaults.
    match action_type {
        ActionType::Scroll => {
            let direction = get_any(obj, &["direction"])
                .and_then(|d| d.as_str())
                .map(|s| s.to_string())
                .or_else(|| params.get("direction").and_then(|d| d.as_str()).map(|s| s.to_string()))
                .unwrap_or_else(|| "down".to_string());
            let amount = get_any(obj, &["amount"])
                .and_then(Value::as_i64)
                .or_else(|| params.get("amount").and_then(Value::as_i64))
                .unwrap_or(3);
            params.insert("direction".into(), Value::String(direction));
            params.insert("amount".into(), Value::from(amount));
        }
        ActionType::Wait => {
            let ms = get_any(obj, &["duration", "ms", "milliseconds"])
                .and_then(Value::as_i64)
                .or_else(|| params.get("duration").and_then(Value::as_i64))
                .unwrap_or(1000);
            params.insert("duration".into(), Value::from(ms));
        }
        ActionType::Type => {
            let text = get_any(obj, &["text", "value"])
                .and_then(|t| t.as_str())
                .map(|s| s.to_string())
                .or_else(|| params.get("text").and_then(|t| t.as_str()).map(|s| s.to_string()))
                .unwrap_or_default();
            params.insert("text".into(), Value::String(text));
        }
        ActionType::Press => {
            let key = get_any(obj, &["key"])
                .and_then(|k| k.as_str())
                .map(|s| s.to_string())
                .or_else(|| params.get("key").and_then(|k| k.as_str()).map(|s| s.to_string()))
                .unwrap_or_default();
            params.insert("key".into(), Value::String(key));
        }
        ActionType::Hotkey => {
            let keys = get_any(obj, &["keys", "combo"])
                .cloned()
                .or_else(|| params.get("keys").cloned())
                .unwrap_or(Value::Array(vec![]));
            params.insert("keys".into(), keys);
        }
        ActionType::Navigate => {
            for k in ["url", "app"] {
                if let Some(val) = get_any(obj, &[k]).and_then(|u| u.as_str()) {
                    params.insert(k.into(), Value::String(val.to_string()));
                }
            }
        }
        _ => {}
    }

    let target = get_any(obj, &["target", "element", "selector"])
        .and_then(|t| t.as_str())
        .map(|s| s.to_string())
        .or_else(|| params.get("target").and_then(|t| t.as_str()).map(|s| s.to_string()));

    let description = get_any(obj, &["description", "desc", "reason"])
        .and_then(|d| d.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("{} action", action_type.as_str()));

    let confidence = get_any(obj, &["confidence"])
        .and_then(Value::as_f64)
        .unwrap_or(STRUCTURED_CONFIDENCE)
        .clamp(0.0, 1.0);

    Some(ParsedAction {
        action_type,
        description,
        target,
        coordinates: read_coordinates(obj, &params),
        params,
        confidence,
    })
}

/// Coordinates appear in three shapes: `coordinates: {x, y}`, top-level
/// `x`/`y`, or `params.x`/`params.y`. Components are coerced to integers and
/// default to 0; a malformed coordinate never fails the whole action.
fn read_coordinates(obj: &Map<String, Value>, params: &Map<String, Value>) -> Option<Point> {
    if let Some(coords) = obj.get("coordinates").and_then(|c| c.as_object()) {
        return Some(Point {
            x: coerce_int(coords.get("x")),
            y: coerce_int(coords.get("y")),
        });
    }
    if obj.contains_key("x") || obj.contains_key("y") {
        return Some(Point {
            x: coerce_int(obj.get("x")),
            y: coerce_int(obj.get("y")),
        });
    }
    if params.contains_key("x") || params.contains_key("y") {
        return Some(Point {
            x: coerce_int(params.get("x")),
            y: coerce_int(params.get("y")),
        });
    }
    None
}

fn coerce_int(v: Option<&Value>) -> i64 {
    match v {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse::<f64>().map(|f| f as i64).unwrap_or(0),
        _ => 0,
    }
}

// ========================= Heuristic fallback =========================

/// Natural-language fallback: pattern-match verbs with a fixed low
/// confidence. Coarse; its job is graceful degradation, not full coverage.
fn heuristic_action(raw: &str) -> Option<ParsedAction> {
    let lower = raw.to_lowercase();
    let mut params = Map::new();
    let mut target = None;

    let action_type = if lower.contains("double-click") || lower.contains("double click") {
        ActionType::DoubleClick
    } else if lower.contains("right-click") || lower.contains("right click") {
        ActionType::RightClick
    } else if lower.contains("click") {
        ActionType::Click
    } else if lower.contains("press ") {
        if let Some(key) = word_after(&lower, "press ") {
            params.insert("key".into(), Value::String(key));
        }
        ActionType::Press
    } else if lower.contains("type ") || lower.contains("enter ") {
        params.insert(
            "text".into(),
            Value::String(quoted_fragment(raw).unwrap_or_default()),
        );
        ActionType::Type
    } else if lower.contains("scroll") {
        let direction = if lower.contains("up") { "up" } else { "down" };
        params.insert("direction".into(), Value::String(direction.to_string()));
        params.insert("amount".into(), Value::from(3));
        ActionType::Scroll
    } else if lower.contains("open ") || lower.contains("go to ") || lower.contains("navigate") {
        target = remainder_after(raw, &lower, &["open ", "go to ", "navigate to ", "navigate "]);
        ActionType::Navigate
    } else if lower.contains("hover") {
        ActionType::Hover
    } else if lower.contains("drag") {
        ActionType::Drag
    } else if lower.contains("wait") {
        params.insert("duration".into(), Value::from(1000));
        ActionType::Wait
    } else {
        return None;
    };

    let description: String = raw.trim().chars().take(DESCRIPTION_PREVIEW_CHARS).collect();
    Some(ParsedAction {
        action_type,
        description,
        target,
        coordinates: None,
        params,
        confidence: HEURISTIC_CONFIDENCE,
    })
}

fn heuristic_analysis(raw: &str) -> ScreenAnalysis {
    let lower = raw.to_lowercase();
    let is_task_complete = lower.contains("task complete")
        || lower.contains("task is complete")
        || lower.contains("completed successfully")
        || lower.contains("all done");
    let current_state = raw
        .lines()
        .map(|l| l.trim())
        .find(|l| !l.is_empty())
        .unwrap_or("")
        .chars()
        .take(DESCRIPTION_PREVIEW_CHARS)
        .collect();
    let visible_elements = raw
        .lines()
        .map(|l| l.trim())
        .filter_map(|l| l.strip_prefix("- ").or_else(|| l.strip_prefix("* ")))
        .map(|l| l.to_string())
        .collect();
    ScreenAnalysis {
        is_task_complete,
        current_state,
        visible_elements,
        suggestions: Vec::new(),
    }
}

/// First single- or double-quoted fragment of the text, if any.
fn quoted_fragment(raw: &str) -> Option<String> {
    for quote in ['"', '\''] {
        if let Some(start) = raw.find(quote) {
            if let Some(len) = raw[start + 1..].find(quote) {
                return Some(raw[start + 1..start + 1 + len].to_string());
            }
        }
    }
    None
}

fn word_after(lower: &str, prefix: &str) -> Option<String> {
    let idx = lower.find(prefix)?;
    lower[idx + prefix.len()..]
        .split_whitespace()
        .next()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric() && c != '+').to_string())
}

fn remainder_after(raw: &str, lower: &str, prefixes: &[&str]) -> Option<String> {
    for p in prefixes {
        if let Some(idx) = lower.find(p) {
            let rest = raw[idx + p.len()..].trim().trim_end_matches('.');
            if !rest.is_empty() {
                return Some(rest.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn direct_json_parses() {
        let raw = r#"{"type": "click", "description": "Click the OK button", "coordinates": {"x": 100, "y": 200}}"#;
        let a = parse_action(raw).unwrap();
        assert_eq!(a.action_type, ActionType::Click);
        assert_eq!(a.coordinates, Some(Point { x: 100, y: 200 }));
        assert_eq!(a.description, "Click the OK button");
    }

    #[test]
    fn fenced_block_equals_direct_json() {
        let inner = r#"{"type": "type", "text": "hello", "description": "Type greeting"}"#;
        let fenced = format!("Here is the action:\n```json\n{}\n```\nDone.", inner);
        let a = parse_action(inner).unwrap();
        let b = parse_action(&fenced).unwrap();
        assert_eq!(a.action_type, b.action_type);
        assert_eq!(a.description, b.description);
        assert_eq!(a.params.get("text"), b.params.get("text"));
    }

    #[test]
    fn embedded_object_literal_is_found() {
        let raw = r#"I think the next step is {"type": "scroll", "direction": "up"} based on the page."#;
        let a = parse_action(raw).unwrap();
        assert_eq!(a.action_type, ActionType::Scroll);
        assert_eq!(a.param_str("direction").unwrap(), "up");
    }

    #[test]
    fn braces_inside_strings_do_not_break_extraction() {
        let raw = r#"note {"type": "type", "text": "set x to {1}", "description": "d"} end"#;
        let a = parse_action(raw).unwrap();
        assert_eq!(a.param_str("text").unwrap(), "set x to {1}");
    }

    #[test]
    fn synonyms_normalize_to_closed_set() {
        for (loose, want) in [
            ("left-click", ActionType::Click),
            ("doubleclick", ActionType::DoubleClick),
            ("shortcut", ActionType::Hotkey),
            ("mouseover", ActionType::Hover),
            ("go_to", ActionType::Navigate),
            ("keypress", ActionType::Press),
        ] {
            assert_eq!(ActionType::from_loose(loose), Some(want), "{loose}");
        }
        assert_eq!(ActionType::from_loose("teleport"), None);
    }

    #[test]
    fn unknown_type_returns_none() {
        assert!(parse_action(r#"{"type": "levitate", "description": "x"}"#).is_none());
    }

    #[test]
    fn scroll_and_wait_defaults() {
        let s = parse_action(r#"{"type": "scroll"}"#).unwrap();
        assert_eq!(s.param_str("direction").unwrap(), "down");
        assert_eq!(s.params.get("amount").unwrap().as_i64(), Some(3));

        let w = parse_action(r#"{"type": "wait"}"#).unwrap();
        assert_eq!(w.params.get("duration").unwrap().as_i64(), Some(1000));
    }

    #[test]
    fn coordinates_from_three_shapes() {
        let nested = parse_action(r#"{"type":"click","coordinates":{"x":5,"y":6}}"#).unwrap();
        assert_eq!(nested.coordinates, Some(Point { x: 5, y: 6 }));

        let toplevel = parse_action(r#"{"type":"click","x":7,"y":8}"#).unwrap();
        assert_eq!(toplevel.coordinates, Some(Point { x: 7, y: 8 }));

        let in_params = parse_action(r#"{"type":"click","params":{"x":9,"y":10}}"#).unwrap();
        assert_eq!(in_params.coordinates, Some(Point { x: 9, y: 10 }));

        // Missing components coerce to 0 instead of failing.
        let partial = parse_action(r#"{"type":"click","coordinates":{"x":"12.7"}}"#).unwrap();
        assert_eq!(partial.coordinates, Some(Point { x: 12, y: 0 }));
    }

    #[test]
    fn heuristic_fallback_gets_low_confidence() {
        let a = parse_action("Click the blue Submit button in the corner").unwrap();
        assert_eq!(a.action_type, ActionType::Click);
        assert!((a.confidence - 0.3).abs() < f64::EPSILON);

        let t = parse_action(r#"Type "weather" into the search box"#).unwrap();
        assert_eq!(t.action_type, ActionType::Type);
        assert_eq!(t.param_str("text").unwrap(), "weather");

        let n = parse_action("Open Chrome").unwrap();
        assert_eq!(n.action_type, ActionType::Navigate);
        assert_eq!(n.target.as_deref(), Some("Chrome"));
    }

    #[test]
    fn garbage_returns_none_without_panicking() {
        for raw in ["", "   ", "{{{{", "]]]", "\u{0}\u{1}", "0.5", "true", "just some prose"] {
            let _ = parse_action(raw);
        }
        assert!(parse_action("just some prose with no verbs").is_none());
    }

    #[test]
    fn confidence_is_clamped() {
        let a = parse_action(r#"{"type":"click","confidence":3.5}"#).unwrap();
        assert!((a.confidence - 1.0).abs() < f64::EPSILON);
        let b = parse_action(r#"{"type":"click","confidence":-1}"#).unwrap();
        assert_eq!(b.confidence, 0.0);
    }

    #[test]
    fn analysis_structured_and_heuristic() {
        let structured = parse_analysis(
            r#"{"isTaskComplete": true, "currentState": "browser open", "visibleElements": ["search box"], "suggestions": ["type query"]}"#,
        );
        assert!(structured.is_task_complete);
        assert_eq!(structured.current_state, "browser open");
        assert_eq!(structured.visible_elements, vec!["search box"]);

        let heuristic = parse_analysis("The task is complete. Everything worked.\n- results list");
        assert!(heuristic.is_task_complete);
        assert_eq!(heuristic.visible_elements, vec!["results list"]);

        let unknown = parse_analysis("hmm");
        assert!(!unknown.is_task_complete);
    }

    #[test]
    fn multiple_actions_from_array_and_wrapper() {
        let arr = json!([
            {"type": "click", "x": 1, "y": 2},
            {"type": "type", "text": "hi"},
            {"type": "levitate"}
        ])
        .to_string();
        let actions = parse_actions(&arr);
        assert_eq!(actions.len(), 2);

        let wrapped = json!({"actions": [{"type": "wait"}]}).to_string();
        assert_eq!(parse_actions(&wrapped).len(), 1);

        let lines = "Click the icon\nType \"abc\" in the field";
        assert_eq!(parse_actions(lines).len(), 2);
    }
}
