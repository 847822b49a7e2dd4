//! Engine error taxonomy.
//!
//! Every pipeline failure is an [`EngineError`] wrapped in a [`StageError`]
//! that records which stage raised it. Hallucination guards (bad route index,
//! phantom supersede target) are recovered inline and never reach this type.

use std::time::Duration;

/// The four pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ValidateInput,
    LoadBranches,
    ClassifyRoute,
    ExecuteRoute,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidateInput => "validate-input",
            Self::LoadBranches => "load-branches",
            Self::ClassifyRoute => "classify-route",
            Self::ExecuteRoute => "execute-route",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure categories for a routing request.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Missing or invalid required input. Maps to a 4xx; never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A referenced conversation or branch does not exist (or belongs to
    /// another tenant).
    #[error("not found: {0}")]
    NotFound(String),

    /// Classifier or embedding collaborator failed. The caller may retry the
    /// whole request; the engine does not retry internally.
    #[error("external call failed: {0}")]
    External(#[source] anyhow::Error),

    /// The classifier returned output that does not satisfy the structured
    /// contract. Deliberately not defaulted to STAY — a silent default would
    /// mask misrouting.
    #[error("malformed classifier response: {0}")]
    MalformedResponse(String),

    /// Store read or write failed.
    #[error("store error: {0}")]
    Store(#[source] anyhow::Error),

    /// The pipeline exceeded its overall timeout budget.
    #[error("pipeline timed out after {0:?}")]
    Timeout(Duration),
}

/// An [`EngineError`] attributed to the stage that raised it.
#[derive(Debug, thiserror::Error)]
#[error("{stage} failed: {source}")]
pub struct StageError {
    pub stage: Stage,
    #[source]
    pub source: EngineError,
}

impl StageError {
    pub fn new(stage: Stage, source: EngineError) -> Self {
        Self { stage, source }
    }
}

/// Extension for attributing plain engine errors to a stage.
pub trait AtStage<T> {
    fn at_stage(self, stage: Stage) -> Result<T, StageError>;
}

impl<T> AtStage<T> for Result<T, EngineError> {
    fn at_stage(self, stage: Stage) -> Result<T, StageError> {
        self.map_err(|source| StageError { stage, source })
    }
}
