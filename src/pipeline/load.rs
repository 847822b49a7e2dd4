//! Stage 2: branch resolution.
//!
//! Loads the conversation's branches, resolves the *current* branch by
//! priority (caller-supplied id, then the conversation's last-active
//! pointer, then the most recently updated branch), and builds the bounded
//! candidate summary list the classifier reasons over.

use crate::error::{AtStage, EngineError, Stage, StageError};
use crate::model::{Branch, BranchSummary};
use crate::pipeline::{Context, Pipeline};

pub(super) async fn load_branches(
    pipeline: &Pipeline,
    mut ctx: Context,
) -> Result<Context, StageError> {
    let store = pipeline.store();

    let conversation = store
        .get_or_create_conversation(&ctx.request.tenant_id, &ctx.request.conversation_id)
        .at_stage(Stage::LoadBranches)?;

    let branches = store
        .list_branches(&conversation.id)
        .at_stage(Stage::LoadBranches)?;

    if branches.is_empty() {
        ctx.reason_codes.push("new_conversation".into());
        ctx.conversation = Some(conversation);
        return Ok(ctx);
    }

    let current = resolve_current(&ctx, &conversation, &branches).at_stage(Stage::LoadBranches)?;

    let max = pipeline.config().max_candidate_branches;
    let mut selected: Vec<&Branch> = branches.iter().take(max).collect();

    // An explicitly requested current branch can fall outside the recency
    // window; it still belongs in the summaries, displacing the least
    // recent candidate.
    if !selected.iter().any(|b| b.id == current.id) {
        selected.pop();
        if let Some(resolved) = branches.iter().find(|b| b.id == current.id) {
            selected.push(resolved);
        }
    }

    let mut candidates = Vec::with_capacity(selected.len());
    for branch in selected {
        let fact_keys = store.load_facts(&branch.id).at_stage(Stage::LoadBranches)?.keys();
        candidates.push(BranchSummary {
            id: branch.id.clone(),
            topic: branch.topic.clone(),
            context: branch.context.clone(),
            message_count: branch.message_count,
            fact_keys,
            is_current: branch.id == current.id,
        });
    }

    tracing::debug!(
        conversation = %conversation.id,
        branches = branches.len(),
        current = %current.id,
        "branches loaded"
    );

    ctx.conversation = Some(conversation);
    ctx.current_branch = Some(current);
    ctx.candidates = candidates;
    Ok(ctx)
}

/// Current-branch priority: explicit caller id, last-active pointer, most
/// recently updated. An explicit id that does not belong to the
/// conversation is a not-found error; a stale last-active pointer silently
/// falls through.
fn resolve_current(
    ctx: &Context,
    conversation: &crate::model::Conversation,
    branches: &[Branch],
) -> Result<Branch, EngineError> {
    if let Some(requested) = &ctx.request.branch_id {
        return branches
            .iter()
            .find(|b| &b.id == requested)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("branch not found: {requested}")));
    }

    if let Some(active) = &conversation.active_branch_id {
        if let Some(branch) = branches.iter().find(|b| &b.id == active) {
            return Ok(branch.clone());
        }
        tracing::warn!(branch = %active, "active-branch pointer is stale, falling back");
    }

    // list_branches orders most recently updated first
    Ok(branches[0].clone())
}
