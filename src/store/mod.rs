//! Persistence collaborator for the routing pipeline.
//!
//! [`RoutingStore`] is the seam between the pipeline and durable state:
//! composite-key conversation lookup (tenant + conversation id), branch
//! CRUD, append-only messages, and transactional bulk-replace of a branch's
//! fact rows. The sqlite implementation lives in [`sqlite`]; the ephemeral
//! variant keeps its state elsewhere and does not go through this trait.

pub mod sqlite;

use crate::error::EngineError;
use crate::model::facts::FactMap;
use crate::model::{Branch, Conversation, Message, Role, RouteAction};

/// Parameters for creating a branch.
#[derive(Debug, Clone)]
pub struct NewBranch<'a> {
    pub conversation_id: &'a str,
    /// `None` only for the conversation's first branch.
    pub parent_id: Option<&'a str>,
    pub topic: &'a str,
    pub context: Option<&'a str>,
    /// Seed centroid — the message embedding, when available.
    pub centroid: &'a [f32],
    pub depth: u32,
}

/// Parameters for persisting a routed message.
#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub branch_id: &'a str,
    pub role: Role,
    pub content: &'a str,
    pub embedding: Option<&'a [f32]>,
    pub action: RouteAction,
    pub reason: &'a str,
}

/// Mutations applied to a branch after a message is routed to it.
#[derive(Debug, Clone, Default)]
pub struct BranchUpdate<'a> {
    /// New rolling context summary; overwrites, never merges.
    pub context: Option<&'a str>,
    /// New centroid, when an embedding was folded in.
    pub centroid: Option<&'a [f32]>,
    /// New message count.
    pub message_count: Option<u32>,
}

/// Storage operations the pipeline depends on. Implementations serialize
/// their own interior access; methods are synchronous (sqlite under a
/// mutex, per the single-connection model).
pub trait RoutingStore: Send + Sync {
    /// Look up a conversation by (tenant, id), creating it if absent.
    fn get_or_create_conversation(
        &self,
        tenant_id: &str,
        conversation_id: &str,
    ) -> Result<Conversation, EngineError>;

    /// All branches of a conversation, most recently updated first.
    fn list_branches(&self, conversation_id: &str) -> Result<Vec<Branch>, EngineError>;

    fn get_branch(&self, branch_id: &str) -> Result<Option<Branch>, EngineError>;

    fn create_branch(&self, branch: NewBranch<'_>) -> Result<Branch, EngineError>;

    fn append_message(&self, message: NewMessage<'_>) -> Result<Message, EngineError>;

    fn update_branch(&self, branch_id: &str, update: BranchUpdate<'_>)
        -> Result<(), EngineError>;

    /// Update the conversation's last-active-branch pointer.
    fn set_active_branch(&self, conversation_id: &str, branch_id: &str)
        -> Result<(), EngineError>;

    /// The full fact map of a branch.
    fn load_facts(&self, branch_id: &str) -> Result<FactMap, EngineError>;

    /// Transactionally replace all fact rows of a branch with the given map.
    fn replace_facts(&self, branch_id: &str, facts: &FactMap) -> Result<(), EngineError>;

    /// Content of the most recent messages of `role` on a branch, oldest
    /// first, bounded by `limit`.
    fn recent_messages(
        &self,
        branch_id: &str,
        role: Role,
        limit: usize,
    ) -> Result<Vec<String>, EngineError>;

    /// Content of the most recent messages of any role on a branch, oldest
    /// first, bounded by `limit`. Used for fact re-extraction transcripts.
    fn branch_transcript(&self, branch_id: &str, limit: usize)
        -> Result<Vec<String>, EngineError>;

    /// The branch's ancestor chain, nearest parent first, root last. Bounded
    /// by the branch's depth, so it always terminates.
    fn ancestor_chain(&self, branch_id: &str) -> Result<Vec<Branch>, EngineError>;
}
