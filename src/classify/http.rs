//! Chat-completions classifier provider.
//!
//! Speaks an OpenAI-compatible `/chat/completions` contract via `reqwest`.
//! The model is instructed to answer with a single JSON object; that object
//! is parsed strictly — anything that does not satisfy the structured
//! contract surfaces as [`EngineError::MalformedResponse`], never a guessed
//! action. A non-numeric `target_index` is the one tolerated deviation (the
//! validation layer recovers it by falling back to BRANCH).

use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::classify::{
    Classifier, ClassifierReply, DecisionRequest, ReextractReply, ReextractRequest,
};
use crate::config::ClassifierConfig;
use crate::error::EngineError;
use crate::model::facts::ExtractedFact;
use crate::model::{RouteAction, TokenUsage};

pub struct HttpClassifier {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl HttpClassifier {
    pub fn new(config: &ClassifierConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow!("classifier API key env var {} not set", config.api_key_env))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
        })
    }

    async fn complete(&self, system: &str, user: &str) -> Result<(String, TokenUsage), EngineError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: user.to_string(),
                },
            ],
            temperature: 0.0,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| EngineError::External(anyhow!(e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::External(anyhow!(
                "classifier endpoint returned {status}: {body}"
            )));
        }

        let completion: ChatResponse = response
            .json()
            .await
            .map_err(|e| EngineError::External(anyhow!(e)))?;

        let usage = completion
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        let content = completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| EngineError::MalformedResponse("no choices in completion".into()))?;

        Ok((content, usage))
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, request: &DecisionRequest) -> Result<ClassifierReply, EngineError> {
        let user_prompt = build_decision_prompt(request);
        let (content, usage) = self.complete(DECISION_SYSTEM_PROMPT, &user_prompt).await?;

        tracing::debug!(chars = content.len(), "classifier reply received");
        let mut reply = parse_decision(&content)?;
        reply.usage = usage;
        Ok(reply)
    }

    async fn reextract(&self, request: &ReextractRequest) -> Result<ReextractReply, EngineError> {
        let user_prompt = build_reextract_prompt(request);
        let (content, usage) = self.complete(REEXTRACT_SYSTEM_PROMPT, &user_prompt).await?;

        let wire: WireReextract = serde_json::from_str(strip_fences(&content))
            .map_err(|e| EngineError::MalformedResponse(format!("re-extraction reply: {e}")))?;
        Ok(ReextractReply {
            branch_context: wire.branch_context,
            facts: wire.facts.unwrap_or_default(),
            usage,
        })
    }
}

const DECISION_SYSTEM_PROMPT: &str = "You are a conversation topic router. \
Decide whether the new message continues the current topic (STAY), returns to \
one of the numbered other topics (ROUTE), or starts a new topic (BRANCH). \
Respond with a single JSON object: {\"action\": \"STAY\"|\"ROUTE\"|\"BRANCH\", \
\"target_index\": <1-based number, ROUTE only>, \"new_topic\": \"<3-6 word \
label, BRANCH only>\", \"reason\": \"<one sentence>\", \"confidence\": <0..1>, \
\"branch_context\": \"<one-sentence rolling summary>\", \"facts\": [{\"key\": \
\"snake_case_key\", \"is_update\": <bool>, \"values\": [{\"value\": \"...\", \
\"confidence\": <0..1>, \"supersedes\": [\"<exact prior value>\"]}]}]}";

const REEXTRACT_SYSTEM_PROMPT: &str = "You are a fact extractor. Given a \
topic and its transcript, produce a fresh one-sentence summary and the \
structured facts asserted in it. Respond with a single JSON object: \
{\"branch_context\": \"<one sentence>\", \"facts\": [{\"key\": \
\"snake_case_key\", \"is_update\": <bool>, \"values\": [{\"value\": \"...\", \
\"confidence\": <0..1>, \"supersedes\": []}]}]}";

fn build_decision_prompt(request: &DecisionRequest) -> String {
    let mut prompt = String::new();

    match &request.current {
        Some(current) => {
            prompt.push_str(&format!("Current topic: {}\n", current.topic));
            if let Some(context) = &current.context {
                prompt.push_str(&format!("Current context: {context}\n"));
            }
            if !current.fact_keys.is_empty() {
                prompt.push_str(&format!(
                    "Known fact keys: {}\n",
                    current.fact_keys.join(", ")
                ));
            }
        }
        None => prompt.push_str("No current topic.\n"),
    }

    if !request.ancestor_topics.is_empty() {
        prompt.push_str(&format!(
            "Parent topics: {}\n",
            request.ancestor_topics.join(" < ")
        ));
    }

    if request.others.is_empty() {
        prompt.push_str("No other topics.\n");
    } else {
        prompt.push_str("Other topics:\n");
        for (i, branch) in request.others.iter().enumerate() {
            prompt.push_str(&format!(
                "{}. {} ({} messages)",
                i + 1,
                branch.topic,
                branch.message_count
            ));
            if let Some(context) = &branch.context {
                prompt.push_str(&format!(" — {context}"));
            }
            prompt.push('\n');
        }
    }

    if !request.recent_messages.is_empty() {
        prompt.push_str("Recent messages in the current topic:\n");
        for message in &request.recent_messages {
            prompt.push_str(&format!("- {message}\n"));
        }
    }

    if !request.extract_facts {
        prompt.push_str("Do not extract facts; omit the facts field.\n");
    }

    prompt.push_str(&format!("\nNew message ({}): {}", request.role, request.content));
    prompt
}

fn build_reextract_prompt(request: &ReextractRequest) -> String {
    let mut prompt = format!("Topic: {}\n", request.topic);
    if let Some(context) = &request.context {
        prompt.push_str(&format!("Previous summary: {context}\n"));
    }
    if !request.known_fact_keys.is_empty() {
        prompt.push_str(&format!(
            "Known fact keys: {}\n",
            request.known_fact_keys.join(", ")
        ));
    }
    prompt.push_str("Transcript:\n");
    for message in &request.transcript {
        prompt.push_str(&format!("- {message}\n"));
    }
    prompt
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Decision object as the model writes it. `target_index` stays a raw JSON
/// value here so a non-numeric index degrades to "missing" instead of
/// failing the whole reply.
#[derive(Deserialize)]
struct WireDecision {
    action: String,
    #[serde(default)]
    target_index: Option<serde_json::Value>,
    #[serde(default)]
    new_topic: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    branch_context: Option<String>,
    #[serde(default)]
    facts: Option<Vec<ExtractedFact>>,
}

#[derive(Deserialize)]
struct WireReextract {
    #[serde(default)]
    branch_context: Option<String>,
    #[serde(default)]
    facts: Option<Vec<ExtractedFact>>,
}

/// Parse the model's JSON decision into a [`ClassifierReply`].
fn parse_decision(content: &str) -> Result<ClassifierReply, EngineError> {
    let wire: WireDecision = serde_json::from_str(strip_fences(content))
        .map_err(|e| EngineError::MalformedResponse(format!("decision reply: {e}")))?;

    let action: RouteAction = wire
        .action
        .to_uppercase()
        .parse()
        .map_err(|e: String| EngineError::MalformedResponse(e))?;

    Ok(ClassifierReply {
        action,
        target_index: wire.target_index.and_then(|v| v.as_i64()),
        new_topic: wire.new_topic,
        reason: wire.reason.unwrap_or_default(),
        confidence: wire.confidence.unwrap_or(0.5),
        branch_context: wire.branch_context,
        facts: wire.facts.unwrap_or_default(),
        usage: TokenUsage::default(),
    })
}

/// Tolerate models that wrap their JSON in a markdown code fence.
fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_stay_decision() {
        let reply = parse_decision(
            r#"{"action": "STAY", "reason": "same topic", "confidence": 0.92}"#,
        )
        .unwrap();
        assert_eq!(reply.action, RouteAction::Stay);
        assert_eq!(reply.reason, "same topic");
        assert!(reply.facts.is_empty());
    }

    #[test]
    fn parse_route_with_numeric_index() {
        let reply = parse_decision(
            r#"{"action": "ROUTE", "target_index": 2, "reason": "back to hotels", "confidence": 0.8}"#,
        )
        .unwrap();
        assert_eq!(reply.action, RouteAction::Route);
        assert_eq!(reply.target_index, Some(2));
    }

    #[test]
    fn non_numeric_index_degrades_to_none() {
        let reply = parse_decision(
            r#"{"action": "ROUTE", "target_index": "two", "reason": "", "confidence": 0.8}"#,
        )
        .unwrap();
        assert_eq!(reply.target_index, None);
    }

    #[test]
    fn parse_branch_with_facts() {
        let reply = parse_decision(
            r#"{
                "action": "BRANCH",
                "new_topic": "Paris trip planning",
                "reason": "new topic",
                "confidence": 0.95,
                "branch_context": "User is planning a trip to Paris.",
                "facts": [{
                    "key": "destination",
                    "is_update": false,
                    "values": [{"value": "Paris", "confidence": 0.9, "supersedes": []}]
                }]
            }"#,
        )
        .unwrap();
        assert_eq!(reply.action, RouteAction::Branch);
        assert_eq!(reply.new_topic.as_deref(), Some("Paris trip planning"));
        assert_eq!(reply.facts.len(), 1);
        assert_eq!(reply.facts[0].key, "destination");
    }

    #[test]
    fn unknown_action_is_malformed() {
        let err = parse_decision(r#"{"action": "MERGE", "reason": "", "confidence": 0.5}"#)
            .unwrap_err();
        assert!(matches!(err, EngineError::MalformedResponse(_)));
    }

    #[test]
    fn unparseable_json_is_malformed() {
        let err = parse_decision("I think the user changed topic").unwrap_err();
        assert!(matches!(err, EngineError::MalformedResponse(_)));
    }

    #[test]
    fn fenced_json_is_tolerated() {
        let reply = parse_decision(
            "```json\n{\"action\": \"STAY\", \"reason\": \"x\", \"confidence\": 0.7}\n```",
        )
        .unwrap();
        assert_eq!(reply.action, RouteAction::Stay);
    }

    #[test]
    fn decision_prompt_numbers_other_topics() {
        use crate::model::{BranchSummary, Role};
        let request = DecisionRequest {
            content: "what about museums?".into(),
            role: Role::User,
            current: Some(BranchSummary {
                id: "b1".into(),
                topic: "Paris trip".into(),
                context: Some("Planning a trip to Paris.".into()),
                message_count: 4,
                fact_keys: vec!["destination".into()],
                is_current: true,
            }),
            ancestor_topics: vec!["Vacation ideas".into()],
            others: vec![
                BranchSummary {
                    id: "b2".into(),
                    topic: "Work project".into(),
                    context: None,
                    message_count: 7,
                    fact_keys: vec![],
                    is_current: false,
                },
                BranchSummary {
                    id: "b3".into(),
                    topic: "Dinner plans".into(),
                    context: None,
                    message_count: 2,
                    fact_keys: vec![],
                    is_current: false,
                },
            ],
            recent_messages: vec!["Which hotels are good?".into()],
            extract_facts: true,
        };

        let prompt = build_decision_prompt(&request);
        assert!(prompt.contains("Current topic: Paris trip"));
        assert!(prompt.contains("Parent topics: Vacation ideas"));
        assert!(prompt.contains("1. Work project"));
        assert!(prompt.contains("2. Dinner plans"));
        assert!(prompt.contains("Known fact keys: destination"));
        assert!(prompt.contains("what about museums?"));
    }
}
