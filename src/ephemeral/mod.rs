//! Ephemeral variant: the same routing and fact-merge semantics, replayed
//! in memory for stateless-server use.
//!
//! The caller supplies the full message list plus the opaque state returned
//! by the previous call; only messages past `last_processed_index` are
//! classified. Branch ids are deterministic — conversation id plus a
//! monotonic branch index — so repeated calls with a growing message list
//! reuse the ids already handed out and never rename a topic. Message
//! provenance uses the message's position in the list.
//!
//! State lives behind [`state_store::StateStore`]; a state blob passed in
//! the request takes priority over the store. Callers must not process two
//! requests for the same conversation key concurrently.

pub mod state_store;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::classify::{self, Classifier, Decision, DecisionRequest, RoutedDecision};
use crate::config::RoutingConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{AtStage, EngineError, Stage, StageError};
use crate::model::centroid::update_centroid;
use crate::model::facts::{merge_facts, FactMap};
use crate::model::{BranchSummary, Role, RouteAction, TokenUsage};
use state_store::StateStore;

/// One client-supplied message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EphemeralMessage {
    pub role: Role,
    pub content: String,
}

/// An in-memory branch. Same semantics as the persisted record, minus
/// timestamps (recency is tracked by the index of the last message routed
/// here).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EphemeralBranch {
    pub id: String,
    pub parent_id: Option<String>,
    pub topic: String,
    pub context: Option<String>,
    pub message_count: u32,
    pub centroid: Vec<f32>,
    pub depth: u32,
    pub facts: FactMap,
    /// Index of the last message routed here, for recency ordering.
    pub last_touched: u64,
}

/// The opaque state blob returned to (and replayed by) the client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EphemeralState {
    pub branches: Vec<EphemeralBranch>,
    pub active_branch_id: Option<String>,
    /// Branch id each processed message was routed to, aligned with the
    /// message list.
    pub message_branches: Vec<String>,
    /// Messages before this index have already been processed.
    pub last_processed_index: usize,
    /// Next value of the monotonic branch index (ids are 1-based).
    pub next_branch_index: u32,
    /// Token usage accumulated across all calls.
    pub usage: TokenUsage,
}

impl EphemeralState {
    pub fn branch(&self, id: &str) -> Option<&EphemeralBranch> {
        self.branches.iter().find(|b| b.id == id)
    }

    fn branch_mut(&mut self, id: &str) -> Option<&mut EphemeralBranch> {
        self.branches.iter_mut().find(|b| b.id == id)
    }
}

#[derive(Debug, Clone)]
pub struct EphemeralRequest {
    pub conversation_id: String,
    pub messages: Vec<EphemeralMessage>,
    /// Previously returned state; takes priority over the state store.
    pub state: Option<EphemeralState>,
    pub extract_facts: bool,
}

/// Routing decision for one newly processed message.
#[derive(Debug, Clone, Serialize)]
pub struct EphemeralStep {
    pub message_index: usize,
    pub action: RouteAction,
    pub branch_id: String,
    pub topic: String,
    pub reason: String,
    pub created_branch: bool,
    /// Ordered diagnostic codes, same vocabulary as the persisted pipeline.
    pub reason_codes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EphemeralOutcome {
    pub steps: Vec<EphemeralStep>,
    pub state: EphemeralState,
}

/// Stateless-server adapter around the shared classification and fact-merge
/// rules.
pub struct EphemeralEngine {
    classifier: Arc<dyn Classifier>,
    embedding: Option<Arc<dyn EmbeddingProvider>>,
    states: Arc<dyn StateStore>,
    config: RoutingConfig,
}

impl EphemeralEngine {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        embedding: Option<Arc<dyn EmbeddingProvider>>,
        states: Arc<dyn StateStore>,
        config: RoutingConfig,
    ) -> Self {
        Self {
            classifier,
            embedding,
            states,
            config,
        }
    }

    /// Process all unhandled messages, returning per-message decisions and
    /// the updated state blob.
    pub async fn process(
        &self,
        request: EphemeralRequest,
    ) -> Result<EphemeralOutcome, StageError> {
        let conversation_id = request.conversation_id.trim();
        if conversation_id.is_empty() {
            return Err(StageError::new(
                Stage::ValidateInput,
                EngineError::InvalidInput("conversation_id must not be empty".into()),
            ));
        }

        let mut state = request
            .state
            .or_else(|| self.states.get(conversation_id))
            .unwrap_or_default();
        validate_state(&state).at_stage(Stage::ValidateInput)?;

        // A shrunken message list resets nothing; we simply have nothing new.
        let start = state.last_processed_index.min(request.messages.len());
        let mut steps = Vec::new();

        for index in start..request.messages.len() {
            let step = self
                .process_one(conversation_id, &request.messages, index, request.extract_facts, &mut state)
                .await?;
            steps.push(step);
        }

        state.last_processed_index = state.last_processed_index.max(request.messages.len());

        // Nothing ever branched (empty message list replay): synthesize a
        // default branch so callers always have one to attach to.
        if state.branches.is_empty() {
            let id = deterministic_branch_id(conversation_id, &mut state);
            state.branches.push(EphemeralBranch {
                id: id.clone(),
                parent_id: None,
                topic: self.config.fallback_topic.clone(),
                context: None,
                message_count: 0,
                centroid: Vec::new(),
                depth: 0,
                facts: FactMap::new(),
                last_touched: 0,
            });
            state.active_branch_id = Some(id);
        }

        self.states.put(conversation_id, state.clone());
        Ok(EphemeralOutcome { steps, state })
    }

    async fn process_one(
        &self,
        conversation_id: &str,
        messages: &[EphemeralMessage],
        index: usize,
        extract_facts: bool,
        state: &mut EphemeralState,
    ) -> Result<EphemeralStep, StageError> {
        let message = &messages[index];
        let current_id = state.active_branch_id.clone();
        let candidates = self.candidate_summaries(state, current_id.as_deref());
        let others: Vec<BranchSummary> =
            candidates.iter().filter(|c| !c.is_current).cloned().collect();
        let current_summary = candidates.iter().find(|c| c.is_current).cloned();

        let mut reason_codes = Vec::new();
        let decision = self
            .decide(
                message,
                messages,
                index,
                extract_facts,
                current_summary,
                &others,
                state,
                &mut reason_codes,
            )
            .await?;

        state.usage.add(decision.usage);
        let message_id = format!("{conversation_id}-m{index}");
        Ok(self.apply(
            conversation_id,
            index,
            message,
            decision,
            &message_id,
            reason_codes,
            state,
        ))
    }

    async fn decide(
        &self,
        message: &EphemeralMessage,
        messages: &[EphemeralMessage],
        index: usize,
        extract_facts: bool,
        current: Option<BranchSummary>,
        others: &[BranchSummary],
        state: &EphemeralState,
        reason_codes: &mut Vec<String>,
    ) -> Result<RoutedDecision, StageError> {
        // Same short-circuits as the persisted pipeline: assistant messages
        // never reach the classifier.
        if message.role == Role::Assistant {
            reason_codes.push("assistant_short_circuit".into());
            if current.is_some() {
                return Ok(classify::assistant_stay());
            }
            reason_codes.push("first_message_override".into());
            return Ok(classify::first_message_branch(
                &message.content,
                None,
                &self.config,
            ));
        }

        let recent_messages = current
            .as_ref()
            .map(|c| self.recent_same_role(messages, index, &c.id, message.role, state))
            .unwrap_or_default();

        let ancestor_topics = current
            .as_ref()
            .map(|c| ancestor_topics(state, &c.id))
            .unwrap_or_default();

        let request = DecisionRequest {
            content: message.content.clone(),
            role: message.role,
            current: current.clone(),
            ancestor_topics,
            others: others.to_vec(),
            recent_messages,
            extract_facts,
        };

        let reply = self
            .classifier
            .classify(&request)
            .await
            .at_stage(Stage::ClassifyRoute)?;

        Ok(classify::resolve_reply(
            reply,
            current.as_ref(),
            others,
            &message.content,
            &self.config,
            reason_codes,
        ))
    }

    /// Apply one decision to the in-memory state. Mirrors the persisted
    /// execute stage: branch creation or selection, centroid update, fact
    /// merge, active pointer.
    fn apply(
        &self,
        conversation_id: &str,
        index: usize,
        message: &EphemeralMessage,
        decision: RoutedDecision,
        message_id: &str,
        reason_codes: Vec<String>,
        state: &mut EphemeralState,
    ) -> EphemeralStep {
        let embedding = self
            .embedding
            .as_ref()
            .and_then(|p| p.embed(&message.content).ok());

        let (action, target_id, created) = match &decision.decision {
            Decision::Stay => {
                let id = state
                    .active_branch_id
                    .clone()
                    .expect("STAY only resolves with a current branch");
                (RouteAction::Stay, id, false)
            }
            Decision::Route { target_id } => (RouteAction::Route, target_id.clone(), false),
            Decision::Branch { topic } => {
                let id = deterministic_branch_id(conversation_id, state);
                let parent = state.active_branch_id.clone();
                let depth = parent
                    .as_deref()
                    .and_then(|p| state.branch(p))
                    .map_or(0, |b| b.depth + 1);
                state.branches.push(EphemeralBranch {
                    id: id.clone(),
                    parent_id: parent,
                    topic: topic.clone(),
                    context: None,
                    message_count: 0,
                    centroid: embedding.clone().unwrap_or_default(),
                    depth,
                    facts: FactMap::new(),
                    last_touched: index as u64,
                });
                (RouteAction::Branch, id, true)
            }
        };

        let branch = state
            .branch_mut(&target_id)
            .expect("target branch exists in state");
        branch.message_count += 1;
        branch.last_touched = index as u64;

        if let (Some(emb), RouteAction::Stay | RouteAction::Route) = (&embedding, action) {
            branch.centroid = update_centroid(&branch.centroid, emb, branch.message_count);
        }

        if !decision.facts.is_empty() {
            merge_facts(&mut branch.facts, &decision.facts, message_id);
        }
        if let Some(context) = &decision.branch_context {
            branch.context = Some(context.clone());
        }
        let topic = branch.topic.clone();

        state.active_branch_id = Some(target_id.clone());
        state.message_branches.push(target_id.clone());

        EphemeralStep {
            message_index: index,
            action,
            branch_id: target_id,
            topic,
            reason: decision.reason,
            created_branch: created,
            reason_codes,
        }
    }

    /// Candidate summaries, most recently touched first, bounded by config.
    fn candidate_summaries(
        &self,
        state: &EphemeralState,
        current_id: Option<&str>,
    ) -> Vec<BranchSummary> {
        let mut branches: Vec<&EphemeralBranch> = state.branches.iter().collect();
        branches.sort_by(|a, b| b.last_touched.cmp(&a.last_touched));
        branches
            .into_iter()
            .take(self.config.max_candidate_branches)
            .map(|b| BranchSummary {
                id: b.id.clone(),
                topic: b.topic.clone(),
                context: b.context.clone(),
                message_count: b.message_count,
                fact_keys: b.facts.keys(),
                is_current: Some(b.id.as_str()) == current_id,
            })
            .collect()
    }

    /// Recent same-role messages already routed to `branch_id`, oldest
    /// first, bounded by the configured window.
    fn recent_same_role(
        &self,
        messages: &[EphemeralMessage],
        before: usize,
        branch_id: &str,
        role: Role,
        state: &EphemeralState,
    ) -> Vec<String> {
        let mut recent: Vec<String> = (0..before.min(state.message_branches.len()))
            .rev()
            .filter(|i| state.message_branches[*i] == branch_id && messages[*i].role == role)
            .take(self.config.recent_message_window)
            .map(|i| messages[i].content.clone())
            .collect();
        recent.reverse();
        recent
    }
}

/// Reject state blobs whose branch bookkeeping is internally inconsistent.
/// The blob is client-supplied; a broken one must fail the request, not the
/// process.
fn validate_state(state: &EphemeralState) -> Result<(), EngineError> {
    match &state.active_branch_id {
        Some(id) if state.branch(id).is_none() => Err(EngineError::InvalidInput(format!(
            "state active branch does not exist: {id}"
        ))),
        None if !state.branches.is_empty() => Err(EngineError::InvalidInput(
            "state has branches but no active branch".into(),
        )),
        _ => Ok(()),
    }
}

/// Topics of a branch's ancestors, nearest parent first. Depth bounds the
/// walk.
fn ancestor_topics(state: &EphemeralState, branch_id: &str) -> Vec<String> {
    let mut topics = Vec::new();
    let mut cursor = state.branch(branch_id);
    while let Some(branch) = cursor {
        match branch.parent_id.as_deref().and_then(|p| state.branch(p)) {
            Some(parent) => {
                topics.push(parent.topic.clone());
                cursor = Some(parent);
            }
            None => break,
        }
        if topics.len() > state.branches.len() {
            break;
        }
    }
    topics
}

/// `<conversation>-b<N>` with a monotonically increasing N, never reused.
fn deterministic_branch_id(conversation_id: &str, state: &mut EphemeralState) -> String {
    state.next_branch_index += 1;
    format!("{conversation_id}-b{}", state.next_branch_index)
}
