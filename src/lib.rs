//! A deterministic, content-addressed document index.
//!
//! Documents and chunks live in a working tree until [`dag::Dag::save_tree`]
//! freezes them into a content-addressed [`domain::Tree`], and
//! [`dag::Dag::create_commit`] gives that tree a place in a commit DAG
//! exactly like git's. From a frozen tree, [`fts::Fts::build_fts_tree`]
//! builds a gated full-text index and [`embeddings::Embeddings::build_embeddings`]
//! builds a vector index; [`retriever::Retriever`] fuses both into hybrid
//! search. [`gc::Gc::gc_artifacts`] reclaims derived artifacts no kept
//! ref can reach; commits, trees, and blobs are never deleted.
//! [`scheduler::Scheduler`] persists durable task records for an
//! out-of-process executor. Every call through [`tools`] is wrapped in an
//! [`audit::AuditEnvelope`] before it reaches the caller.
//!
//! Every identity hash in this crate is `sha256(canonical(x))` for some
//! fixed shape `x` — see [`codec`]. Nothing here reads the wall clock:
//! every stored timestamp is [`domain::EPOCH`].

pub mod audit;
pub mod codec;
pub mod dag;
pub mod domain;
pub mod embeddings;
pub mod engine;
pub mod error;
pub mod fts;
pub mod gc;
pub mod retriever;
pub mod scheduler;
pub mod store;
pub mod tools;

pub use engine::Engine;
pub use error::{EngineError, ErrorCode, Result};
