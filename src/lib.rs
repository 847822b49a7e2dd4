//! Drift routing and fact provenance for branching conversations.
//!
//! Branchline watches a conversation one message at a time and keeps it
//! topic-coherent: each incoming message is classified as **STAY** (continue
//! the current branch), **ROUTE** (switch to an existing branch), or
//! **BRANCH** (start a new one). Every branch carries a topic label, a
//! rolling context summary, an embedding centroid, and a set of facts whose
//! every value records which message introduced it and whether a later
//! statement superseded it.
//!
//! # Architecture
//!
//! - **Pipeline**: four fixed stages (validate, load, classify, execute)
//!   sharing one timeout budget; see [`pipeline`]
//! - **Classifier**: an external chat-completions call behind the
//!   [`classify::Classifier`] trait, with deterministic validation of its
//!   replies
//! - **Storage**: SQLite via [`store::RoutingStore`], with an audit log of
//!   every routing operation
//! - **Ephemeral mode**: the same semantics replayed in memory for
//!   stateless servers, with deterministic branch ids; see [`ephemeral`]
//!
//! # Modules
//!
//! - [`config`] — configuration from TOML files and environment variables
//! - [`pipeline`] — the four-stage routing pipeline
//! - [`classify`] — decision protocol and reply validation
//! - [`model`] — records, fact merging, centroid math
//! - [`store`] — persistence trait and the SQLite implementation
//! - [`ephemeral`] — stateless replay variant
//! - [`reextract`] — background fact re-extraction for branches being left
//! - [`server`] — HTTP adapter

pub mod classify;
pub mod config;
pub mod db;
pub mod embedding;
pub mod ephemeral;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod reextract;
pub mod server;
pub mod store;
