//! Error taxonomy for the engine.
//!
//! One enum carries every error kind spec'd for the core: render, condition,
//! transient/permanent agent failures, JSON parsing, budget, session,
//! HITL, artifact, graph, and capability errors. Each variant carries enough
//! context (stage identifier, kind-specific payload) to produce an
//! actionable message and to map deterministically onto an exit code
//! (see `crate::engine::ExitCode`).

use std::fmt;

/// Stage or node identifier used in error messages, e.g. `steps[2]`,
/// `tasks.analysis`, `nodes.review`, `branches.b1`, `workers[3]`.
pub type StageId = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderErrorKind {
    /// Reference to a name not present in the context.
    UndefinedVariable { name: String },
    /// Reference to a filter not on the whitelist.
    UnknownFilter { name: String },
    /// Attribute access to a dunder-prefixed member, or any other
    /// sandbox-violating construct.
    SecurityViolation { violation_type: String, template_preview: String },
    /// Template could not be parsed.
    Syntax { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HitlErrorKind {
    InvalidResponse { response: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactErrorKind {
    Overwrite { path: String },
    Io { path: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphErrorKind {
    CycleLimit { max_iterations: usize, node: String },
    NoMatch { node: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionErrorKind {
    NotFound,
    SpecChanged { expected: String, found: String },
    Io { message: String },
    Corrupt { message: String },
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum EngineError {
    #[error("render error at {stage}: {kind:?}")]
    Render { stage: StageId, kind: RenderErrorKind },

    #[error("condition error at {stage}: {message}")]
    Condition { stage: StageId, message: String },

    #[error("transient error at {stage}: {message}")]
    Transient { stage: StageId, message: String },

    #[error("permanent error at {stage}: {message}")]
    Permanent { stage: StageId, message: String },

    #[error("parse error at {stage} after {attempts} attempt(s): {message}")]
    Parse { stage: StageId, attempts: u32, message: String },

    #[error("budget exceeded at {stage}: used {used}, requested {requested}, max {max}")]
    Budget { stage: StageId, used: u64, requested: u64, max: u64 },

    #[error("session error: {kind:?}")]
    Session { kind: SessionErrorKind },

    #[error("hitl error: {kind:?}")]
    Hitl { kind: HitlErrorKind },

    #[error("artifact error: {kind:?}")]
    Artifact { kind: ArtifactErrorKind },

    #[error("graph error at {stage}: {kind:?}")]
    Graph { stage: StageId, kind: GraphErrorKind },

    #[error("routing error at {stage}: no matching route and no else route")]
    RoutingNoMatch { stage: StageId },

    #[error("capability error: {message}")]
    Capability { message: String },

    #[error("unsupported feature: {message}")]
    Unsupported { message: String },
}

impl EngineError {
    pub fn render(stage: impl Into<String>, kind: RenderErrorKind) -> Self {
        EngineError::Render { stage: stage.into(), kind }
    }

    pub fn condition(stage: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Condition { stage: stage.into(), message: message.into() }
    }

    pub fn transient(stage: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Transient { stage: stage.into(), message: message.into() }
    }

    pub fn permanent(stage: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Permanent { stage: stage.into(), message: message.into() }
    }

    /// True for errors the retry wrapper should retry (`spec.md` §7:
    /// only `TransientError` and `ParseError` are recoverable).
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Transient { .. } | EngineError::Parse { .. })
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Session { kind: SessionErrorKind::Corrupt { message: e.to_string() } }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Session { kind: SessionErrorKind::Io { message: e.to_string() } }
    }
}

/// Human-facing formatting helper used by the event dispatcher and CLI
/// layers: kind, stage identifier, actionable hint when applicable.
impl fmt::Display for RenderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderErrorKind::UndefinedVariable { name } => {
                write!(f, "undefined variable '{name}'")
            }
            RenderErrorKind::UnknownFilter { name } => write!(f, "unknown filter '{name}'"),
            RenderErrorKind::SecurityViolation { violation_type, template_preview } => {
                write!(f, "security violation ({violation_type}) in template: {template_preview}")
            }
            RenderErrorKind::Syntax { message } => write!(f, "syntax error: {message}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
