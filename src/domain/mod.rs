//! Domain types for the document index engine.
//!
//! These mirror the persisted tables one-to-one: a `Document`/`Chunk` pair
//! describes working-tree state, a `Tree` is their frozen snapshot, and a
//! `Commit`/`Ref` pair gives that snapshot a place in history.

use serde::{Deserialize, Serialize};

/// A repository groups documents under one namespace; the engine can hold
/// more than one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub id: String,
    pub name: String,
}

/// Working-tree document: current full text of one logical file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: String,
    pub repo_id: String,
    pub title: String,
    pub content: String,
    pub content_hash: String,
}

impl Document {
    pub fn new(doc_id: impl Into<String>, repo_id: impl Into<String>, title: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        let content_hash = crate::codec::sha256_hex(content.as_bytes());
        Self {
            doc_id: doc_id.into(),
            repo_id: repo_id.into(),
            title: title.into(),
            content,
            content_hash,
        }
    }
}

/// Working-tree chunk: a substring span of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub span_start: usize,
    pub span_end: usize,
    pub text: String,
    pub content_hash: String,
}

impl Chunk {
    pub fn new(chunk_id: impl Into<String>, doc_id: impl Into<String>, span_start: usize, span_end: usize, text: impl Into<String>) -> Self {
        let text = text.into();
        let content_hash = crate::codec::sha256_hex(text.as_bytes());
        Self {
            chunk_id: chunk_id.into(),
            doc_id: doc_id.into(),
            span_start,
            span_end,
            text,
            content_hash,
        }
    }
}

/// One entry in a frozen tree: binds a doc+chunk pair to their content
/// hashes and span. Sorted `(doc_id, chunk_id)` across a tree's entries is
/// what makes `tree_hash` deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub doc_id: String,
    pub doc_content_hash: String,
    pub title: String,
    pub chunk_id: String,
    pub chunk_content_hash: String,
    pub span_start: i64,
    pub span_end: i64,
}

/// A frozen snapshot of documents + chunks. Identity = sha256 of the
/// canonical sorted entry list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    pub tree_hash: String,
    pub entries: Vec<TreeEntry>,
}

/// A commit: `{tree_hash, parents}` is the sole identity input; `message`
/// and `created_at` are stored but play no role in `commit_hash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub commit_hash: String,
    pub tree_hash: String,
    pub parents: Vec<String>,
    pub message: String,
    pub created_at: String,
}

/// Epoch timestamp fixed into every commit's `created_at`, per the
/// no-wall-clock-dependence non-goal.
pub const EPOCH: &str = "1970-01-01T00:00:00.000Z";

/// A mutable named pointer to a commit hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefPointer {
    pub name: String,
    pub commit_hash: String,
}

/// Cross-chunk dependency edge, carried from the teacher's domain model.
/// Plain CRUD; participates in no hashing or GC logic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub from_chunk_id: String,
    pub to_chunk_id: String,
    pub dep_type: String,
}

/// Result of comparing two trees at the document-file level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffResult {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}
