//! Provenance-tracked fact storage and the merge & supersession algorithm.
//!
//! A branch's facts map each key to an ordered list of value entries. Entries
//! are only ever created or transitioned (`active` → `superseded`), never
//! deleted — superseded entries are retained for audit. The merge algorithm
//! is replay-safe: merging the same extraction twice produces the same
//! active-value set as merging it once.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a fact value entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactStatus {
    Active,
    Superseded,
    Removed,
}

impl FactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Superseded => "superseded",
            Self::Removed => "removed",
        }
    }
}

/// A single asserted value with provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactValue {
    /// The asserted value text.
    pub value: String,
    /// Id of the message that introduced this value.
    pub source_message_id: String,
    /// Classifier confidence in `[0.0, 1.0]`.
    pub confidence: f64,
    pub status: FactStatus,
    /// Id of the message that superseded this value, if any.
    pub superseded_by: Option<String>,
}

impl FactValue {
    fn active(value: &str, message_id: &str, confidence: f64) -> Self {
        Self {
            value: value.to_string(),
            source_message_id: message_id.to_string(),
            confidence,
            status: FactStatus::Active,
            superseded_by: None,
        }
    }
}

/// Per-branch fact map: key → ordered value-entry history.
///
/// `BTreeMap` keeps key iteration deterministic for summaries and tests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FactMap(pub BTreeMap<String, Vec<FactValue>>);

impl FactMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// All known fact keys, in sorted order.
    pub fn keys(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    /// Currently active values for a key.
    pub fn active_values(&self, key: &str) -> Vec<&str> {
        self.0
            .get(key)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.status == FactStatus::Active)
                    .map(|e| e.value.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn entries(&self, key: &str) -> Option<&[FactValue]> {
        self.0.get(key).map(|v| v.as_slice())
    }
}

/// One candidate value supplied by the classifier for a fact key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedValue {
    pub value: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Prior value texts this value contradicts and replaces.
    #[serde(default)]
    pub supersedes: Vec<String>,
}

fn default_confidence() -> f64 {
    1.0
}

/// One fact extracted by the classifier alongside a routing decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedFact {
    pub key: String,
    /// `true` if the classifier believes this key already exists on the
    /// target branch.
    #[serde(default)]
    pub is_update: bool,
    pub values: Vec<ExtractedValue>,
}

/// Normalize a classifier-supplied fact key: lowercase alphanumerics with
/// single underscores. Keys that normalize to nothing are kept verbatim.
pub fn canonicalize_key(key: &str) -> String {
    let raw = key.trim();
    let mut out = String::with_capacity(raw.len());
    let mut last_was_sep = false;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep && !out.is_empty() {
            out.push('_');
            last_was_sep = true;
        }
    }
    let trimmed = out.trim_end_matches('_');
    if trimmed.is_empty() {
        raw.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Merge classifier-extracted facts into a branch's fact map.
///
/// Per extracted fact:
/// - fresh key (or `is_update == false`): the supplied values become the
///   entry list, all active, attributed to `message_id`;
/// - existing key with `is_update == true`: each value's `supersedes` list is
///   processed first — an exact-text match among the *active* entries is
///   marked superseded and stamped with `message_id`; requests naming values
///   that do not exist or are already inactive are ignored (hallucination
///   guard). The value itself is then appended active, unless an entry with
///   the exact same text already exists for the key (duplicate guard).
pub fn merge_facts(map: &mut FactMap, extracted: &[ExtractedFact], message_id: &str) {
    for fact in extracted {
        let key = canonicalize_key(&fact.key);
        if key.is_empty() || fact.values.is_empty() {
            continue;
        }

        let exists = map.0.contains_key(&key);
        if !fact.is_update || !exists {
            let entries: Vec<FactValue> = fact
                .values
                .iter()
                .map(|v| FactValue::active(&v.value, message_id, v.confidence))
                .collect();
            tracing::debug!(key = %key, entries = entries.len(), "fact key written fresh");
            map.0.insert(key, entries);
            continue;
        }

        let entries = map.0.get_mut(&key).expect("key checked above");
        for value in &fact.values {
            for superseded_text in &value.supersedes {
                supersede_exact(entries, superseded_text, message_id, &key);
            }

            // Duplicate guard: any entry with the same text, regardless of
            // status, blocks the append — replays cannot resurrect
            // superseded values.
            if entries.iter().any(|e| e.value == value.value) {
                tracing::debug!(key = %key, value = %value.value, "duplicate value skipped");
                continue;
            }
            entries.push(FactValue::active(&value.value, message_id, value.confidence));
        }
    }
}

/// Mark the first active entry whose text matches exactly as superseded.
/// Missing or inactive targets are ignored rather than failed.
fn supersede_exact(entries: &mut [FactValue], target: &str, message_id: &str, key: &str) {
    match entries
        .iter_mut()
        .find(|e| e.status == FactStatus::Active && e.value == target)
    {
        Some(entry) => {
            entry.status = FactStatus::Superseded;
            entry.superseded_by = Some(message_id.to_string());
            tracing::debug!(key = %key, value = %target, "fact value superseded");
        }
        None => {
            tracing::debug!(key = %key, value = %target, "supersede target not active, ignored");
        }
    }
}
