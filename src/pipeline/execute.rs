//! Stage 4: execution.
//!
//! Turns the validated decision into writes: branch creation or selection,
//! message persistence, centroid update, fact merge, and the conversation's
//! last-active pointer. Leaving a branch (ROUTE or BRANCH away from it)
//! enqueues a fire-and-forget fact re-extraction job for it. There is no
//! rollback — a failure partway leaves the caller with an error and an
//! operation that must be treated as not-completed.

use anyhow::anyhow;

use crate::classify::Decision;
use crate::error::{AtStage, EngineError, Stage, StageError};
use crate::model::centroid::update_centroid;
use crate::model::facts::merge_facts;
use crate::model::{Branch, RouteAction, RouteOutcome};
use crate::pipeline::{Context, Pipeline};
use crate::reextract::ReextractJob;
use crate::store::{BranchUpdate, NewBranch, NewMessage};

pub(super) async fn execute_route(
    pipeline: &Pipeline,
    mut ctx: Context,
) -> Result<Context, StageError> {
    let store = pipeline.store();
    let decision = ctx
        .decision
        .take()
        .expect("classify stage always populates the decision");
    let conversation = ctx
        .conversation
        .clone()
        .expect("load stage always populates the conversation");

    let embedding = match pipeline.embedding() {
        Some(provider) => Some(
            provider
                .embed(&ctx.request.content)
                .map_err(|e| EngineError::External(anyhow!(e)))
                .at_stage(Stage::ExecuteRoute)?,
        ),
        None => None,
    };

    // Resolve or create the target branch.
    let (action, target, created) = match &decision.decision {
        Decision::Stay => {
            let current = ctx
                .current_branch
                .clone()
                .ok_or_else(|| EngineError::NotFound("no current branch to stay in".into()))
                .at_stage(Stage::ExecuteRoute)?;
            (RouteAction::Stay, current, false)
        }
        Decision::Route { target_id } => {
            let target = store
                .get_branch(target_id)
                .at_stage(Stage::ExecuteRoute)?
                .ok_or_else(|| EngineError::NotFound(format!("branch not found: {target_id}")))
                .at_stage(Stage::ExecuteRoute)?;
            (RouteAction::Route, target, false)
        }
        Decision::Branch { topic } => {
            let parent = ctx.current_branch.as_ref();
            let branch = store
                .create_branch(NewBranch {
                    conversation_id: &conversation.id,
                    parent_id: parent.map(|b| b.id.as_str()),
                    topic,
                    context: decision.branch_context.as_deref(),
                    centroid: embedding.as_deref().unwrap_or(&[]),
                    depth: parent.map_or(0, |b| b.depth + 1),
                })
                .at_stage(Stage::ExecuteRoute)?;
            (RouteAction::Branch, branch, true)
        }
    };

    // Leaving a branch triggers background fact re-extraction for it.
    let leaving = ctx
        .current_branch
        .as_ref()
        .filter(|current| current.id != target.id);
    if let (Some(left), Some(queue)) = (leaving, pipeline.reextract_queue()) {
        queue.enqueue(ReextractJob {
            branch_id: left.id.clone(),
        });
        ctx.reason_codes.push("reextract_enqueued".into());
    }

    let message = store
        .append_message(NewMessage {
            branch_id: &target.id,
            role: ctx.request.role,
            content: &ctx.request.content,
            embedding: embedding.as_deref(),
            action,
            reason: &decision.reason,
        })
        .at_stage(Stage::ExecuteRoute)?;

    let message_count = target.message_count + 1;

    // A brand-new branch's centroid is just seeded; averaging starts with
    // the second embedded message.
    let new_centroid = match (&embedding, action) {
        (Some(emb), RouteAction::Stay | RouteAction::Route) => {
            Some(update_centroid(&target.centroid, emb, message_count))
        }
        _ => None,
    };

    if !decision.facts.is_empty() {
        let mut facts = store.load_facts(&target.id).at_stage(Stage::ExecuteRoute)?;
        merge_facts(&mut facts, &decision.facts, &message.id);
        store
            .replace_facts(&target.id, &facts)
            .at_stage(Stage::ExecuteRoute)?;
        ctx.reason_codes.push("facts_merged".into());
    }

    store
        .update_branch(
            &target.id,
            BranchUpdate {
                context: decision.branch_context.as_deref(),
                centroid: new_centroid.as_deref(),
                message_count: Some(message_count),
            },
        )
        .at_stage(Stage::ExecuteRoute)?;

    store
        .set_active_branch(&conversation.id, &target.id)
        .at_stage(Stage::ExecuteRoute)?;

    let previous_branch_id = previous_branch(&ctx, &target);
    ctx.outcome = Some(RouteOutcome {
        action,
        branch_id: target.id.clone(),
        message_id: message.id,
        previous_branch_id,
        created_branch: created,
        topic: target.topic.clone(),
        reason: decision.reason,
        confidence: decision.confidence,
        reason_codes: ctx.reason_codes.clone(),
        usage: decision.usage,
        extracted_facts: decision.facts,
    });
    Ok(ctx)
}

/// The branch the message started in, when the action moved away from it.
fn previous_branch(ctx: &Context, target: &Branch) -> Option<String> {
    ctx.current_branch
        .as_ref()
        .filter(|current| current.id != target.id)
        .map(|current| current.id.clone())
}
