//! Stage 3: classification.
//!
//! Assistant messages short-circuit to STAY without an external call. User
//! messages build a decision request from the current and candidate branch
//! summaries (plus a short window of recent same-role messages for
//! continuity), invoke the classifier, and resolve the raw reply through the
//! deterministic validation rules.

use crate::classify::{self, DecisionRequest};
use crate::error::{AtStage, Stage, StageError};
use crate::model::Role;
use crate::pipeline::{Context, Pipeline};

pub(super) async fn classify_route(
    pipeline: &Pipeline,
    mut ctx: Context,
) -> Result<Context, StageError> {
    // Assistant replies never drift on their own; they continue whatever
    // branch the user is in. No external call, maximal confidence.
    if ctx.request.role == Role::Assistant && ctx.current_branch.is_some() {
        ctx.reason_codes.push("assistant_short_circuit".into());
        ctx.decision = Some(classify::assistant_stay());
        return Ok(ctx);
    }

    // First message of a conversation with role assistant: still no
    // external call, the safety override decides.
    if ctx.request.role == Role::Assistant {
        ctx.reason_codes.push("assistant_short_circuit".into());
        ctx.reason_codes.push("first_message_override".into());
        ctx.decision = Some(classify::first_message_branch(
            &ctx.request.content,
            None,
            pipeline.config(),
        ));
        return Ok(ctx);
    }

    let others = ctx.other_candidates();
    let current = ctx
        .candidates
        .iter()
        .find(|c| c.is_current)
        .cloned();

    let (recent_messages, ancestor_topics) = match &ctx.current_branch {
        Some(branch) => {
            let recent = pipeline
                .store()
                .recent_messages(
                    &branch.id,
                    ctx.request.role,
                    pipeline.config().recent_message_window,
                )
                .at_stage(Stage::ClassifyRoute)?;
            let ancestors = pipeline
                .store()
                .ancestor_chain(&branch.id)
                .at_stage(Stage::ClassifyRoute)?
                .into_iter()
                .map(|b| b.topic)
                .collect();
            (recent, ancestors)
        }
        None => (Vec::new(), Vec::new()),
    };

    let request = DecisionRequest {
        content: ctx.request.content.clone(),
        role: ctx.request.role,
        current: current.clone(),
        ancestor_topics,
        others: others.clone(),
        recent_messages,
        extract_facts: ctx.request.extract_facts,
    };

    let reply = pipeline
        .classifier()
        .classify(&request)
        .await
        .at_stage(Stage::ClassifyRoute)?;

    tracing::debug!(
        action = %reply.action,
        confidence = reply.confidence,
        facts = reply.facts.len(),
        "classifier replied"
    );

    let decision = classify::resolve_reply(
        reply,
        current.as_ref(),
        &others,
        &ctx.request.content,
        pipeline.config(),
        &mut ctx.reason_codes,
    );

    ctx.decision = Some(decision);
    Ok(ctx)
}
