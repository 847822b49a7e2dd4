//! The routing pipeline orchestrator.
//!
//! Four stages run in a fixed order — `validate-input`, `load-branches`,
//! `classify-route`, `execute-route` — each consuming the [`Context`] and
//! returning a new one or a [`StageError`]. The first two stages perform no
//! writes, so any failure there leaves no partial state; `execute-route`
//! performs all side effects and offers no rollback (a failed request must
//! be treated as not-completed by the caller).
//!
//! Concurrent requests for different conversations are independent.
//! Requests for the *same* conversation are not serialized here — callers
//! are expected to await each response before sending the next message.

mod classify;
mod execute;
mod load;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::classify::{Classifier, RoutedDecision};
use crate::config::RoutingConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{AtStage, EngineError, Stage, StageError};
use crate::model::{Branch, BranchSummary, Conversation, Role, RouteOutcome};
use crate::reextract::ReextractQueue;
use crate::store::RoutingStore;

/// One message to route.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub tenant_id: String,
    pub conversation_id: String,
    pub content: String,
    pub role: Role,
    /// Explicit current-branch override; takes priority over the
    /// conversation's last-active pointer.
    pub branch_id: Option<String>,
    /// When `false`, only the routing decision is requested from the
    /// classifier (no facts, no context summary).
    pub extract_facts: bool,
}

/// Accumulated pipeline state, rebuilt by each stage rather than mutated in
/// place.
#[derive(Debug)]
pub struct Context {
    pub request: RouteRequest,
    pub conversation: Option<Conversation>,
    /// Branch the message starts in; `None` for a new conversation.
    pub current_branch: Option<Branch>,
    /// Bounded candidate summaries, most recently updated first, current
    /// branch flagged.
    pub candidates: Vec<BranchSummary>,
    pub decision: Option<RoutedDecision>,
    pub outcome: Option<RouteOutcome>,
    /// Ordered human-readable diagnostic codes.
    pub reason_codes: Vec<String>,
}

impl Context {
    fn new(request: RouteRequest) -> Self {
        Self {
            request,
            conversation: None,
            current_branch: None,
            candidates: Vec::new(),
            decision: None,
            outcome: None,
            reason_codes: Vec::new(),
        }
    }

    /// Candidate summaries excluding the current branch — the numbered
    /// "other topics" list ROUTE indexes refer to.
    pub fn other_candidates(&self) -> Vec<BranchSummary> {
        self.candidates
            .iter()
            .filter(|c| !c.is_current)
            .cloned()
            .collect()
    }
}

/// The drift routing engine: wires the store, classifier, optional embedding
/// provider, and optional re-extraction queue into the four-stage pipeline.
pub struct Pipeline {
    store: Arc<dyn RoutingStore>,
    classifier: Arc<dyn Classifier>,
    embedding: Option<Arc<dyn EmbeddingProvider>>,
    reextract: Option<ReextractQueue>,
    config: RoutingConfig,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn RoutingStore>,
        classifier: Arc<dyn Classifier>,
        embedding: Option<Arc<dyn EmbeddingProvider>>,
        reextract: Option<ReextractQueue>,
        config: RoutingConfig,
    ) -> Self {
        Self {
            store,
            classifier,
            embedding,
            reextract,
            config,
        }
    }

    /// Route one message through the full pipeline.
    ///
    /// The whole invocation shares one timeout budget; exceeding it aborts
    /// with a timeout error attributed to the stage that was running.
    /// Cancellation is all-or-nothing at this boundary.
    pub async fn route_message(&self, request: RouteRequest) -> Result<RouteOutcome, StageError> {
        let budget = Duration::from_secs(self.config.pipeline_timeout_secs);
        let deadline = Instant::now() + budget;

        let ctx = Context::new(request);
        let ctx = validate_input(ctx).at_stage(Stage::ValidateInput)?;
        let ctx = self
            .bounded(deadline, budget, Stage::LoadBranches, load::load_branches(self, ctx))
            .await?;
        let ctx = self
            .bounded(
                deadline,
                budget,
                Stage::ClassifyRoute,
                classify::classify_route(self, ctx),
            )
            .await?;
        let ctx = self
            .bounded(
                deadline,
                budget,
                Stage::ExecuteRoute,
                execute::execute_route(self, ctx),
            )
            .await?;

        let outcome = ctx
            .outcome
            .expect("execute stage always populates the outcome");
        tracing::info!(
            action = %outcome.action,
            branch = %outcome.branch_id,
            codes = ?outcome.reason_codes,
            "message routed"
        );
        Ok(outcome)
    }

    /// Run one stage under the shared deadline.
    async fn bounded<F>(
        &self,
        deadline: Instant,
        budget: Duration,
        stage: Stage,
        fut: F,
    ) -> Result<Context, StageError>
    where
        F: std::future::Future<Output = Result<Context, StageError>>,
    {
        match tokio::time::timeout_at(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(StageError::new(stage, EngineError::Timeout(budget))),
        }
    }

    pub(crate) fn store(&self) -> &dyn RoutingStore {
        &*self.store
    }

    pub(crate) fn classifier(&self) -> &dyn Classifier {
        &*self.classifier
    }

    pub(crate) fn embedding(&self) -> Option<&dyn EmbeddingProvider> {
        self.embedding.as_deref()
    }

    pub(crate) fn reextract_queue(&self) -> Option<&ReextractQueue> {
        self.reextract.as_ref()
    }

    pub(crate) fn config(&self) -> &RoutingConfig {
        &self.config
    }
}

/// Stage 1: reject structurally invalid input before anything is loaded.
fn validate_input(ctx: Context) -> Result<Context, EngineError> {
    if ctx.request.tenant_id.trim().is_empty() {
        return Err(EngineError::InvalidInput("tenant_id must not be empty".into()));
    }
    if ctx.request.conversation_id.trim().is_empty() {
        return Err(EngineError::InvalidInput(
            "conversation_id must not be empty".into(),
        ));
    }
    if ctx.request.content.trim().is_empty() {
        return Err(EngineError::InvalidInput("content must not be empty".into()));
    }
    Ok(ctx)
}
