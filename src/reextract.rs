//! Background fact re-extraction for branches being left.
//!
//! When a message ROUTEs or BRANCHes away from a branch, the execution stage
//! enqueues a job here and returns immediately — re-extraction must never
//! add latency to the routing response. A spawned worker drains the queue:
//! it loads the branch's recent transcript, asks the classifier for a fresh
//! context and fact set, merges through the standard algorithm, and
//! bulk-replaces the branch's fact rows. Worker failures are logged at
//! `warn` and dropped; the merge is idempotent, so racing a concurrent
//! routing request on the same branch is tolerated.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::classify::{Classifier, ReextractRequest};
use crate::model::facts::merge_facts;
use crate::store::{BranchUpdate, RoutingStore};

/// How many messages of the branch feed the re-extraction transcript.
const TRANSCRIPT_LIMIT: usize = 20;

/// A request to refresh one branch's context and facts.
#[derive(Debug, Clone)]
pub struct ReextractJob {
    pub branch_id: String,
}

/// Sending half of the re-extraction queue.
#[derive(Clone)]
pub struct ReextractQueue {
    tx: mpsc::UnboundedSender<ReextractJob>,
}

impl ReextractQueue {
    /// Enqueue a job. A closed worker is logged and ignored — enqueue
    /// failure must not affect the routing result.
    pub fn enqueue(&self, job: ReextractJob) {
        if self.tx.send(job).is_err() {
            tracing::warn!("re-extraction worker is gone, job dropped");
        }
    }
}

/// Spawn the worker task and return the queue handle.
pub fn spawn_worker(
    store: Arc<dyn RoutingStore>,
    classifier: Arc<dyn Classifier>,
) -> ReextractQueue {
    let (tx, mut rx) = mpsc::unbounded_channel::<ReextractJob>();

    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            if let Err(e) = process_job(&*store, &*classifier, &job).await {
                tracing::warn!(branch = %job.branch_id, error = %e, "re-extraction failed");
            }
        }
        tracing::debug!("re-extraction worker stopped");
    });

    ReextractQueue { tx }
}

/// Re-extract one branch. Pulled out of the loop so failures are a single
/// `?` chain.
async fn process_job(
    store: &dyn RoutingStore,
    classifier: &dyn Classifier,
    job: &ReextractJob,
) -> anyhow::Result<()> {
    let Some(branch) = store.get_branch(&job.branch_id)? else {
        anyhow::bail!("branch disappeared: {}", job.branch_id);
    };

    let transcript = store.branch_transcript(&branch.id, TRANSCRIPT_LIMIT)?;
    if transcript.is_empty() {
        return Ok(());
    }

    let mut facts = store.load_facts(&branch.id)?;
    let request = ReextractRequest {
        topic: branch.topic.clone(),
        context: branch.context.clone(),
        known_fact_keys: facts.keys(),
        transcript,
    };

    let reply = classifier.reextract(&request).await?;

    // Re-extracted values are attributed to the branch itself rather than a
    // single message; they were derived from the whole transcript.
    let provenance = format!("reextract:{}", branch.id);
    merge_facts(&mut facts, &reply.facts, &provenance);
    store.replace_facts(&branch.id, &facts)?;

    if let Some(context) = reply.branch_context.as_deref() {
        store.update_branch(
            &branch.id,
            BranchUpdate {
                context: Some(context),
                ..Default::default()
            },
        )?;
    }

    tracing::debug!(branch = %branch.id, keys = facts.keys().len(), "branch re-extracted");
    Ok(())
}
