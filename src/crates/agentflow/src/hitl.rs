//! HITL Gate (C7, `spec.md` §4.7).
//!
//! Two execution modes, chosen by whether an `HitlHandler` is installed:
//!
//! - **non-interactive** (no handler): the gate signals `Pause`, the
//!   engine checkpoints the session as `AwaitingHitl` and returns to the
//!   caller (exit code `HITL_PAUSE`). A later `resume()` call supplies the
//!   response and continues from the same stage.
//! - **interactive** (handler installed): the gate calls the handler
//!   in-process and continues immediately with its response.
//!
//! Router-review responses follow a small fixed grammar (`spec.md` §4.2):
//! the literal `approved` keeps the router's original route, or
//! `route:<id>` overrides it to `<id>`.

use crate::error::{EngineError, HitlErrorKind, Result};
use async_trait::async_trait;

/// Raw human response to a plain (non-router) HITL gate.
#[derive(Debug, Clone)]
pub enum HitlDecision {
    Paused,
    Responded(String),
}

#[async_trait]
pub trait HitlHandler: Send + Sync {
    async fn prompt(&self, stage: &str, rendered_prompt: &str) -> String;
}

enum Mode {
    NonInteractive,
    Interactive(std::sync::Arc<dyn HitlHandler>),
    /// Resuming a previously paused run: the caller's response is handed
    /// back exactly once, to whichever gate is reached first. A second
    /// gate reached later in the same resumed run (a chain can have more
    /// than one) falls back to pausing again, same as non-interactive mode.
    ResumeOnce(tokio::sync::Mutex<Option<String>>),
}

pub struct HitlGate {
    mode: Mode,
}

impl HitlGate {
    pub fn non_interactive() -> Self {
        Self { mode: Mode::NonInteractive }
    }

    pub fn interactive(handler: std::sync::Arc<dyn HitlHandler>) -> Self {
        Self { mode: Mode::Interactive(handler) }
    }

    pub fn resume_once(response: String) -> Self {
        Self { mode: Mode::ResumeOnce(tokio::sync::Mutex::new(Some(response))) }
    }

    /// Requests a plain (non-router) human response. Returns
    /// `HitlDecision::Paused` in non-interactive mode — the caller must
    /// checkpoint and stop; there is nothing more this call can do.
    pub async fn request(&self, stage: &str, rendered_prompt: &str) -> HitlDecision {
        match &self.mode {
            Mode::NonInteractive => HitlDecision::Paused,
            Mode::Interactive(handler) => HitlDecision::Responded(handler.prompt(stage, rendered_prompt).await),
            Mode::ResumeOnce(slot) => match slot.lock().await.take() {
                Some(response) => HitlDecision::Responded(response),
                None => HitlDecision::Paused,
            },
        }
    }
}

/// The route a router-review gate resolved to: either the router's
/// original pick, or an override named by the human.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterReviewDecision {
    Approved,
    Override(String),
}

/// Parses the fixed router-review grammar. Anything else is
/// `HitlErrorKind::InvalidResponse`.
pub fn parse_router_review(raw: &str) -> Result<RouterReviewDecision> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("approved") {
        return Ok(RouterReviewDecision::Approved);
    }
    if let Some(route_id) = trimmed.strip_prefix("route:") {
        let route_id = route_id.trim();
        if !route_id.is_empty() {
            return Ok(RouterReviewDecision::Override(route_id.to_string()));
        }
    }
    Err(EngineError::Hitl { kind: HitlErrorKind::InvalidResponse { response: raw.to_string() } })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler(String);

    #[async_trait]
    impl HitlHandler for EchoHandler {
        async fn prompt(&self, _stage: &str, _rendered_prompt: &str) -> String {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn non_interactive_mode_pauses() {
        let gate = HitlGate::non_interactive();
        let decision = gate.request("steps[1]", "continue?").await;
        assert!(matches!(decision, HitlDecision::Paused));
    }

    #[tokio::test]
    async fn interactive_mode_responds_immediately() {
        let gate = HitlGate::interactive(std::sync::Arc::new(EchoHandler("go ahead".into())));
        let decision = gate.request("steps[1]", "continue?").await;
        assert!(matches!(decision, HitlDecision::Responded(r) if r == "go ahead"));
    }

    #[tokio::test]
    async fn resume_once_answers_the_first_gate_then_pauses_again() {
        let gate = HitlGate::resume_once("yes".into());
        let first = gate.request("steps[1]", "approve?").await;
        assert!(matches!(first, HitlDecision::Responded(r) if r == "yes"));
        let second = gate.request("steps[3]", "approve again?").await;
        assert!(matches!(second, HitlDecision::Paused));
    }

    #[test]
    fn parses_approved() {
        assert_eq!(parse_router_review("approved").unwrap(), RouterReviewDecision::Approved);
        assert_eq!(parse_router_review("  Approved  ").unwrap(), RouterReviewDecision::Approved);
    }

    #[test]
    fn parses_route_override() {
        assert_eq!(
            parse_router_review("route:billing").unwrap(),
            RouterReviewDecision::Override("billing".to_string())
        );
    }

    #[test]
    fn rejects_malformed_response() {
        assert!(parse_router_review("sure, go with billing").is_err());
        assert!(parse_router_review("route:").is_err());
        assert!(parse_router_review("").is_err());
    }
}
