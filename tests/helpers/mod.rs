#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use branchline::classify::{
    Classifier, ClassifierReply, DecisionRequest, ReextractReply, ReextractRequest,
};
use branchline::config::RoutingConfig;
use branchline::db;
use branchline::embedding::HashEmbeddingProvider;
use branchline::error::EngineError;
use branchline::model::{Role, RouteAction, TokenUsage};
use branchline::pipeline::{Pipeline, RouteRequest};
use branchline::store::sqlite::SqliteStore;
use branchline::store::RoutingStore;

/// Open a fresh in-memory store with schema and migrations applied.
pub fn test_store() -> Arc<SqliteStore> {
    let conn = db::open_memory_database().unwrap();
    Arc::new(SqliteStore::new(conn))
}

/// A classifier that replays queued replies in order and falls back to STAY.
/// Counts how often the external call was made.
pub struct ScriptedClassifier {
    replies: Mutex<VecDeque<ClassifierReply>>,
    calls: AtomicUsize,
    last_request: Mutex<Option<DecisionRequest>>,
}

impl ScriptedClassifier {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    pub fn push(&self, reply: ClassifierReply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The most recent decision request seen, for prompt-shape assertions.
    pub fn last_request(&self) -> Option<DecisionRequest> {
        self.last_request.lock().unwrap().clone()
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(&self, request: &DecisionRequest) -> Result<ClassifierReply, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request.clone());
        Ok(self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| reply(RouteAction::Stay)))
    }

    async fn reextract(&self, _request: &ReextractRequest) -> Result<ReextractReply, EngineError> {
        Ok(ReextractReply {
            branch_context: None,
            facts: vec![],
            usage: TokenUsage::default(),
        })
    }
}

/// A minimal well-formed reply for the given action.
pub fn reply(action: RouteAction) -> ClassifierReply {
    ClassifierReply {
        action,
        target_index: None,
        new_topic: None,
        reason: "scripted".into(),
        confidence: 0.9,
        branch_context: None,
        facts: vec![],
        usage: TokenUsage {
            prompt_tokens: 100,
            completion_tokens: 20,
        },
    }
}

pub fn branch_reply(topic: &str) -> ClassifierReply {
    let mut r = reply(RouteAction::Branch);
    r.new_topic = Some(topic.into());
    r
}

pub fn route_reply(target_index: i64) -> ClassifierReply {
    let mut r = reply(RouteAction::Route);
    r.target_index = Some(target_index);
    r
}

/// Wire a pipeline over an in-memory store, the scripted classifier, and the
/// deterministic hash embedder. No re-extraction worker.
pub fn test_pipeline(store: Arc<SqliteStore>, classifier: Arc<ScriptedClassifier>) -> Pipeline {
    Pipeline::new(
        store as Arc<dyn RoutingStore>,
        classifier,
        Some(Arc::new(HashEmbeddingProvider::new(64))),
        None,
        RoutingConfig::default(),
    )
}

pub fn user_message(content: &str) -> RouteRequest {
    RouteRequest {
        tenant_id: "tenant-a".into(),
        conversation_id: "conv-1".into(),
        content: content.into(),
        role: Role::User,
        branch_id: None,
        extract_facts: true,
    }
}

pub fn assistant_message(content: &str) -> RouteRequest {
    RouteRequest {
        role: Role::Assistant,
        ..user_message(content)
    }
}
