//! LLM response JSON extraction (`spec.md` §4.9.3, §4.9.5, §4.9.6).
//!
//! Every pattern that needs structured data out of a free-form agent
//! response — the router's route id, the evaluator's score/issues/fixes,
//! the orchestrator's task list — goes through the same three-step
//! fallback: direct JSON parse, then a fenced ```json code block, then the
//! first balanced-looking `{...}` substring. Generalizes the teacher's
//! `executor::parser::ResponseParser::extract_json` (which extracted a
//! fixed `status`/`result`/`error` shape) to an arbitrary `Deserialize`
//! target per caller.

use crate::error::{EngineError, Result};
use serde::de::DeserializeOwned;

/// Finds the most likely JSON payload in `text`: a fenced ```json block
/// first, then the widest `{...}` span. Returns `None` if neither is
/// present.
pub fn extract_json(text: &str) -> Option<&str> {
    for fence in ["```json", "```JSON"] {
        if let Some(start) = text.find(fence) {
            let content = &text[start + fence.len()..];
            if let Some(end) = content.find("```") {
                return Some(content[..end].trim());
            }
        }
    }
    let brace = text.find('{').map(|start| (start, '}'));
    let bracket = text.find('[').map(|start| (start, ']'));
    let (start, close) = match (brace, bracket) {
        (Some(b), Some(k)) if k.0 < b.0 => k,
        (Some(b), _) => b,
        (None, Some(k)) => k,
        (None, None) => return None,
    };
    let end = text.rfind(close)?;
    if end > start {
        Some(text[start..=end].trim())
    } else {
        None
    }
}

/// Parses `raw` into `T` via [`extract_json`], attributing failures to
/// `stage`. `attempt` is carried through only for the error message — the
/// retry loop itself is the caller's job, via
/// `pattern::shared::StageRunner::run_stage_with_parse_retry` (`spec.md`
/// §7: parse errors retry at most twice).
pub fn parse_json<T: DeserializeOwned>(stage: &str, raw: &str, attempt: u32) -> Result<T> {
    let candidate = extract_json(raw).unwrap_or(raw.trim());
    serde_json::from_str(candidate).map_err(|e| EngineError::Parse {
        stage: stage.to_string(),
        attempts: attempt,
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct RouteDecision {
        route: String,
    }

    #[test]
    fn extracts_fenced_json_block() {
        let text = "Here you go:\n```json\n{\"route\": \"billing\"}\n```\nDone.";
        assert_eq!(extract_json(text).unwrap(), r#"{"route": "billing"}"#);
    }

    #[test]
    fn extracts_raw_json_object() {
        let text = r#"The decision is {"route": "billing"} based on the input."#;
        assert_eq!(extract_json(text).unwrap(), r#"{"route": "billing"}"#);
    }

    #[test]
    fn returns_none_without_json() {
        assert!(extract_json("no json anywhere").is_none());
    }

    #[test]
    fn extracts_raw_json_array() {
        let text = r#"Here's the plan: [{"task": "a"}, {"task": "b"}] — let me know."#;
        assert_eq!(extract_json(text).unwrap(), r#"[{"task": "a"}, {"task": "b"}]"#);
    }

    #[test]
    fn parse_json_succeeds_through_fence() {
        let text = "```json\n{\"route\": \"support\"}\n```";
        let decision: RouteDecision = parse_json("router", text, 1).unwrap();
        assert_eq!(decision, RouteDecision { route: "support".to_string() });
    }

    #[test]
    fn parse_json_reports_stage_and_attempt_on_failure() {
        let err = parse_json::<RouteDecision>("router", "not json", 2).unwrap_err();
        assert!(matches!(err, EngineError::Parse { stage, attempts: 2, .. } if stage == "router"));
    }
}
