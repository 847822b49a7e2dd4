//! Core record definitions.
//!
//! Defines [`Role`] and [`RouteAction`] (the routing vocabulary),
//! [`Conversation`], [`Branch`], and [`Message`] (the persisted records),
//! [`BranchSummary`] (what the classifier reasons over), and [`RouteOutcome`]
//! (the result contract returned to callers).

pub mod centroid;
pub mod facts;

use serde::{Deserialize, Serialize};

use crate::model::facts::ExtractedFact;

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            _ => Err(format!("unknown role: {s}")),
        }
    }
}

/// The three routing actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RouteAction {
    /// Continue in the current branch.
    Stay,
    /// Switch to an existing branch.
    Route,
    /// Create a new branch.
    Branch,
}

impl RouteAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stay => "STAY",
            Self::Route => "ROUTE",
            Self::Branch => "BRANCH",
        }
    }
}

impl std::fmt::Display for RouteAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RouteAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STAY" => Ok(Self::Stay),
            "ROUTE" => Ok(Self::Route),
            "BRANCH" => Ok(Self::Branch),
            _ => Err(format!("unknown route action: {s}")),
        }
    }
}

/// Root grouping of branches for one user-facing chat session.
///
/// Created lazily on the first message; never deleted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Caller-supplied conversation identifier; unique across tenants.
    pub id: String,
    /// Owning tenant, part of the composite lookup key.
    pub tenant_id: String,
    /// Id of the branch that last received a message, if any.
    pub active_branch_id: Option<String>,
    /// ISO 8601 creation timestamp.
    pub created_at: String,
    /// ISO 8601 last-modification timestamp.
    pub updated_at: String,
}

/// A contiguous topic segment of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    /// UUID v7 primary key (deterministic ids in ephemeral mode).
    pub id: String,
    pub conversation_id: String,
    /// `None` only for the conversation's first branch.
    pub parent_id: Option<String>,
    /// Short display label, assigned once at BRANCH time and never renamed.
    pub topic: String,
    /// Rolling one-sentence summary, overwritten on every classification
    /// that included fact extraction.
    pub context: Option<String>,
    /// Number of messages routed here.
    pub message_count: u32,
    /// Running average of all message embeddings routed here. Empty until
    /// the first embedded message.
    pub centroid: Vec<f32>,
    /// Parent depth + 1; 0 for the root branch.
    pub depth: u32,
    /// ISO 8601 creation timestamp.
    pub created_at: String,
    /// ISO 8601 last-modification timestamp.
    pub updated_at: String,
}

/// One role-tagged utterance. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// UUID v7 primary key.
    pub id: String,
    /// Branch this message was routed to.
    pub branch_id: String,
    pub role: Role,
    pub content: String,
    /// Embedding vector, if an embedding provider was available.
    pub embedding: Option<Vec<f32>>,
    /// The classification action that placed this message.
    pub action: RouteAction,
    /// Natural-language reason from the classifier (or the safety override).
    pub reason: String,
    /// ISO 8601 creation timestamp.
    pub created_at: String,
}

/// Condensed branch view offered to the classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchSummary {
    pub id: String,
    pub topic: String,
    pub context: Option<String>,
    pub message_count: u32,
    /// Keys of facts known on this branch (values omitted — key-level
    /// reasoning only).
    pub fact_keys: Vec<String>,
    /// Whether this is the branch the message starts in.
    pub is_current: bool,
}

/// Token counts reported by the classifier provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Result contract returned to the caller after a routed message.
#[derive(Debug, Clone, Serialize)]
pub struct RouteOutcome {
    /// Action taken, after all validation overrides.
    pub action: RouteAction,
    /// Branch the message ended up in.
    pub branch_id: String,
    /// Id of the persisted message.
    pub message_id: String,
    /// Branch the message started in, when the action changed branches.
    pub previous_branch_id: Option<String>,
    /// `true` when a new branch (and topic) was created.
    pub created_branch: bool,
    /// Topic label of the resolved branch.
    pub topic: String,
    /// Natural-language reason for the decision.
    pub reason: String,
    /// Classifier confidence in `[0.0, 1.0]`.
    pub confidence: f64,
    /// Ordered diagnostic reason codes accumulated by the pipeline.
    pub reason_codes: Vec<String>,
    /// Token usage for this request, when the classifier was invoked.
    pub usage: TokenUsage,
    /// Facts extracted alongside the decision, when requested.
    pub extracted_facts: Vec<ExtractedFact>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn role_round_trips() {
        assert_eq!(Role::from_str("user").unwrap(), Role::User);
        assert_eq!(Role::from_str("assistant").unwrap(), Role::Assistant);
        assert_eq!(Role::User.to_string(), "user");
        assert!(Role::from_str("system").is_err());
    }

    #[test]
    fn action_round_trips() {
        for action in [RouteAction::Stay, RouteAction::Route, RouteAction::Branch] {
            assert_eq!(RouteAction::from_str(action.as_str()).unwrap(), action);
        }
        assert!(RouteAction::from_str("stay").is_err());
    }

    #[test]
    fn usage_accumulates() {
        let mut usage = TokenUsage::default();
        usage.add(TokenUsage {
            prompt_tokens: 120,
            completion_tokens: 40,
        });
        usage.add(TokenUsage {
            prompt_tokens: 80,
            completion_tokens: 10,
        });
        assert_eq!(usage.prompt_tokens, 200);
        assert_eq!(usage.total(), 250);
    }
}
