//! Incremental branch centroid maintenance.
//!
//! A branch centroid is the running mean of all message embeddings routed to
//! it, updated one embedding at a time with the numerically stable
//! incremental formula rather than re-averaging the history.

/// Update a centroid with one new embedding.
///
/// `count_after` is the branch's message count *after* this message was
/// added. An empty old centroid means the branch has no prior embeddings and
/// the new embedding seeds it as-is.
///
/// `new[i] = old[i] + (embedding[i] - old[i]) / count_after`
pub fn update_centroid(old: &[f32], embedding: &[f32], count_after: u32) -> Vec<f32> {
    if old.is_empty() {
        return embedding.to_vec();
    }
    debug_assert_eq!(old.len(), embedding.len());
    let n = count_after.max(1) as f32;
    old.iter()
        .zip(embedding.iter())
        .map(|(o, e)| o + (e - o) / n)
        .collect()
}
