//! Classification protocol: decision requests, the classifier collaborator
//! trait, and deterministic validation of its replies.
//!
//! The classifier is an external text-classification call. Its reply is
//! loosely structured (action plus action-dependent optional fields); this
//! module resolves it into the tagged [`Decision`] union, applying the
//! safety rules in a fixed order:
//!
//! 1. BRANCH without a topic gets the configured fallback label.
//! 2. ROUTE with a missing or out-of-range index falls back to BRANCH.
//! 3. ROUTE resolving to the current branch downgrades to STAY.
//! 4. The conversation's first message is always forced to BRANCH.
//!
//! Assistant-role messages never reach the classifier at all — they
//! short-circuit to STAY in the current branch.

pub mod http;

use async_trait::async_trait;

use crate::config::RoutingConfig;
use crate::error::EngineError;
use crate::model::facts::ExtractedFact;
use crate::model::{BranchSummary, Role, TokenUsage};

/// Everything the classifier needs to place one message.
#[derive(Debug, Clone)]
pub struct DecisionRequest {
    pub content: String,
    pub role: Role,
    /// Summary of the branch the message starts in, if any.
    pub current: Option<BranchSummary>,
    /// Topics of the current branch's ancestors, nearest parent first.
    pub ancestor_topics: Vec<String>,
    /// Other candidate branches, most recently updated first. ROUTE indexes
    /// are 1-based into this list.
    pub others: Vec<BranchSummary>,
    /// Recent same-role messages from the current branch, oldest first.
    pub recent_messages: Vec<String>,
    /// When `false`, only the routing decision is requested (cheaper call).
    pub extract_facts: bool,
}

/// Context handed to the classifier when re-extracting a branch's facts
/// after the conversation has moved away from it.
#[derive(Debug, Clone)]
pub struct ReextractRequest {
    pub topic: String,
    pub context: Option<String>,
    pub known_fact_keys: Vec<String>,
    /// The branch's recent messages, oldest first.
    pub transcript: Vec<String>,
}

/// Fresh context and facts for a branch being left.
#[derive(Debug, Clone)]
pub struct ReextractReply {
    pub branch_context: Option<String>,
    pub facts: Vec<ExtractedFact>,
    pub usage: TokenUsage,
}

/// Raw structured reply from the classifier, before validation.
///
/// Providers must return [`EngineError::MalformedResponse`] for output they
/// cannot parse into this shape; they must not guess an action.
#[derive(Debug, Clone)]
pub struct ClassifierReply {
    pub action: crate::model::RouteAction,
    /// 1-based index into [`DecisionRequest::others`], for ROUTE.
    pub target_index: Option<i64>,
    /// Short topic label, for BRANCH.
    pub new_topic: Option<String>,
    pub reason: String,
    pub confidence: f64,
    /// Rolling one-sentence branch summary, present with fact extraction.
    pub branch_context: Option<String>,
    pub facts: Vec<ExtractedFact>,
    pub usage: TokenUsage,
}

/// A validated routing decision. Each variant carries exactly the fields
/// valid for that action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Stay,
    Route { target_id: String },
    Branch { topic: String },
}

/// The fully resolved output of the classify stage.
#[derive(Debug, Clone)]
pub struct RoutedDecision {
    pub decision: Decision,
    pub reason: String,
    pub confidence: f64,
    pub branch_context: Option<String>,
    pub facts: Vec<ExtractedFact>,
    pub usage: TokenUsage,
}

/// External text-classification collaborator.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classify one message against the current and candidate branches.
    async fn classify(&self, request: &DecisionRequest) -> Result<ClassifierReply, EngineError>;

    /// Re-extract a branch's context and facts from its transcript. Used by
    /// the background worker when a branch is left.
    async fn reextract(&self, request: &ReextractRequest) -> Result<ReextractReply, EngineError>;
}

/// Create a classifier provider from config.
pub fn create_classifier(
    config: &crate::config::ClassifierConfig,
) -> anyhow::Result<std::sync::Arc<dyn Classifier>> {
    match config.provider.as_str() {
        "openai" => Ok(std::sync::Arc::new(http::HttpClassifier::new(config)?)),
        other => anyhow::bail!("unknown classifier provider: {other}. Supported: openai"),
    }
}

/// Derive a topic label from message content: the first
/// `max_chars` characters, cut on a char boundary, whitespace-trimmed.
pub fn topic_from_content(content: &str, max_chars: usize) -> String {
    let prefix: String = content.chars().take(max_chars).collect();
    prefix.trim().to_string()
}

/// Short-circuit decision for assistant messages: STAY in the current
/// branch at maximal confidence, no external call.
pub fn assistant_stay() -> RoutedDecision {
    RoutedDecision {
        decision: Decision::Stay,
        reason: "assistant reply continues the current branch".into(),
        confidence: 1.0,
        branch_context: None,
        facts: vec![],
        usage: TokenUsage::default(),
    }
}

/// Forced decision for a conversation's first message, applied when there is
/// no current branch and no candidates. Uses `suggested_topic` if the
/// classifier offered one, otherwise a content prefix.
pub fn first_message_branch(
    content: &str,
    suggested_topic: Option<&str>,
    config: &RoutingConfig,
) -> RoutedDecision {
    let topic = match suggested_topic.map(str::trim).filter(|t| !t.is_empty()) {
        Some(t) => t.to_string(),
        None => {
            let prefix = topic_from_content(content, config.topic_prefix_chars);
            if prefix.is_empty() {
                config.fallback_topic.clone()
            } else {
                prefix
            }
        }
    };
    RoutedDecision {
        decision: Decision::Branch { topic },
        reason: "first message of the conversation starts a new branch".into(),
        confidence: 1.0,
        branch_context: None,
        facts: vec![],
        usage: TokenUsage::default(),
    }
}

/// Resolve a raw classifier reply into a [`RoutedDecision`], applying the
/// validation rules in order. Appends a diagnostic code to `reason_codes`
/// for every rule that fires.
pub fn resolve_reply(
    reply: ClassifierReply,
    current: Option<&BranchSummary>,
    others: &[BranchSummary],
    content: &str,
    config: &RoutingConfig,
    reason_codes: &mut Vec<String>,
) -> RoutedDecision {
    use crate::model::RouteAction;

    // Rule 4 dominates everything the classifier said: the first message of
    // a conversation must BRANCH.
    if current.is_none() && others.is_empty() {
        reason_codes.push("first_message_override".into());
        let mut decision = first_message_branch(content, reply.new_topic.as_deref(), config);
        decision.branch_context = reply.branch_context;
        decision.facts = reply.facts;
        decision.usage = reply.usage;
        return decision;
    }

    let decision = match reply.action {
        RouteAction::Stay => Decision::Stay,
        RouteAction::Branch => Decision::Branch {
            topic: branch_topic(reply.new_topic.as_deref(), config, reason_codes),
        },
        RouteAction::Route => match resolve_route_target(reply.target_index, others) {
            Some(target_id) => {
                if current.is_some_and(|c| c.id == target_id) {
                    // Rule 3: routing to the branch we are already in is a no-op.
                    reason_codes.push("self_route_downgraded".into());
                    Decision::Stay
                } else {
                    Decision::Route { target_id }
                }
            }
            None => {
                // Rule 2: no valid target exists — treat as a new topic.
                reason_codes.push("invalid_route_index".into());
                Decision::Branch {
                    topic: branch_topic(reply.new_topic.as_deref(), config, reason_codes),
                }
            }
        },
    };

    RoutedDecision {
        decision,
        reason: reply.reason,
        confidence: reply.confidence.clamp(0.0, 1.0),
        branch_context: reply.branch_context,
        facts: reply.facts,
        usage: reply.usage,
    }
}

/// Rule 1: a BRANCH without a usable topic gets the fallback label.
fn branch_topic(
    new_topic: Option<&str>,
    config: &RoutingConfig,
    reason_codes: &mut Vec<String>,
) -> String {
    match new_topic.map(str::trim).filter(|t| !t.is_empty()) {
        Some(t) => t.to_string(),
        None => {
            reason_codes.push("fallback_topic_substituted".into());
            config.fallback_topic.clone()
        }
    }
}

/// Map a 1-based candidate index back to a concrete branch id. Returns
/// `None` for a missing or out-of-range index.
fn resolve_route_target(target_index: Option<i64>, others: &[BranchSummary]) -> Option<String> {
    let index = target_index?;
    if index < 1 || index as usize > others.len() {
        return None;
    }
    Some(others[index as usize - 1].id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RouteAction;

    fn summary(id: &str, current: bool) -> BranchSummary {
        BranchSummary {
            id: id.into(),
            topic: format!("topic {id}"),
            context: None,
            message_count: 3,
            fact_keys: vec![],
            is_current: current,
        }
    }

    fn reply(action: RouteAction) -> ClassifierReply {
        ClassifierReply {
            action,
            target_index: None,
            new_topic: None,
            reason: "test".into(),
            confidence: 0.8,
            branch_context: None,
            facts: vec![],
            usage: TokenUsage::default(),
        }
    }

    fn config() -> RoutingConfig {
        RoutingConfig::default()
    }

    #[test]
    fn stay_passes_through() {
        let current = summary("b1", true);
        let mut codes = vec![];
        let resolved = resolve_reply(
            reply(RouteAction::Stay),
            Some(&current),
            &[summary("b2", false)],
            "hello",
            &config(),
            &mut codes,
        );
        assert_eq!(resolved.decision, Decision::Stay);
        assert!(codes.is_empty());
    }

    #[test]
    fn branch_without_topic_uses_fallback() {
        let current = summary("b1", true);
        let mut codes = vec![];
        let resolved = resolve_reply(
            reply(RouteAction::Branch),
            Some(&current),
            &[],
            "hello",
            &config(),
            &mut codes,
        );
        assert_eq!(
            resolved.decision,
            Decision::Branch {
                topic: "New Topic".into()
            }
        );
        assert!(codes.contains(&"fallback_topic_substituted".to_string()));
    }

    #[test]
    fn route_resolves_one_based_index() {
        let current = summary("b1", true);
        let others = vec![summary("b2", false), summary("b3", false)];
        let mut reply = reply(RouteAction::Route);
        reply.target_index = Some(2);

        let mut codes = vec![];
        let resolved = resolve_reply(reply, Some(&current), &others, "hi", &config(), &mut codes);
        assert_eq!(
            resolved.decision,
            Decision::Route {
                target_id: "b3".into()
            }
        );
        assert!(codes.is_empty());
    }

    #[test]
    fn route_out_of_range_falls_back_to_branch() {
        let current = summary("b1", true);
        let others = vec![summary("b2", false)];
        let mut reply = reply(RouteAction::Route);
        reply.target_index = Some(2);

        let mut codes = vec![];
        let resolved = resolve_reply(reply, Some(&current), &others, "hi", &config(), &mut codes);
        assert!(matches!(resolved.decision, Decision::Branch { .. }));
        assert!(codes.contains(&"invalid_route_index".to_string()));
        // No topic supplied either, so the fallback label fires too
        assert!(codes.contains(&"fallback_topic_substituted".to_string()));
    }

    #[test]
    fn route_missing_index_falls_back_to_branch() {
        let current = summary("b1", true);
        let others = vec![summary("b2", false)];
        let mut reply = reply(RouteAction::Route);
        reply.new_topic = Some("Side quest".into());

        let mut codes = vec![];
        let resolved = resolve_reply(reply, Some(&current), &others, "hi", &config(), &mut codes);
        assert_eq!(
            resolved.decision,
            Decision::Branch {
                topic: "Side quest".into()
            }
        );
        assert!(codes.contains(&"invalid_route_index".to_string()));
    }

    #[test]
    fn self_route_downgrades_to_stay() {
        let current = summary("b1", true);
        // The current branch leaked into the numbered list
        let others = vec![summary("b1", true)];
        let mut reply = reply(RouteAction::Route);
        reply.target_index = Some(1);

        let mut codes = vec![];
        let resolved = resolve_reply(reply, Some(&current), &others, "hi", &config(), &mut codes);
        assert_eq!(resolved.decision, Decision::Stay);
        assert!(codes.contains(&"self_route_downgraded".to_string()));
    }

    #[test]
    fn first_message_forces_branch_regardless_of_action() {
        for action in [RouteAction::Stay, RouteAction::Route, RouteAction::Branch] {
            let mut codes = vec![];
            let resolved = resolve_reply(
                reply(action),
                None,
                &[],
                "I want to plan a trip to Paris",
                &config(),
                &mut codes,
            );
            assert_eq!(
                resolved.decision,
                Decision::Branch {
                    topic: "I want to plan a trip to Paris".into()
                }
            );
            assert!(codes.contains(&"first_message_override".to_string()));
        }
    }

    #[test]
    fn first_message_prefers_classifier_topic() {
        let mut r = reply(RouteAction::Branch);
        r.new_topic = Some("Paris Trip Planning".into());
        let mut codes = vec![];
        let resolved = resolve_reply(r, None, &[], "long message...", &config(), &mut codes);
        assert_eq!(
            resolved.decision,
            Decision::Branch {
                topic: "Paris Trip Planning".into()
            }
        );
    }

    #[test]
    fn topic_prefix_is_char_safe_and_bounded() {
        let content = "é".repeat(300);
        let topic = topic_from_content(&content, 100);
        assert_eq!(topic.chars().count(), 100);
    }

    #[test]
    fn confidence_is_clamped() {
        let current = summary("b1", true);
        let mut r = reply(RouteAction::Stay);
        r.confidence = 3.5;
        let mut codes = vec![];
        let resolved =
            resolve_reply(r, Some(&current), &[], "hi", &config(), &mut codes);
        assert_eq!(resolved.confidence, 1.0);
    }

    #[test]
    fn assistant_stay_is_maximal_confidence() {
        let decision = assistant_stay();
        assert_eq!(decision.decision, Decision::Stay);
        assert_eq!(decision.confidence, 1.0);
    }
}
