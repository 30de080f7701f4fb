//! Content-addressed versioning layer: blobs, trees, commits, refs.
//!
//! Identity rule used throughout: every hash is `sha256_hex(canonical(x))`
//! for some fixed JSON shape `x` (see [`crate::codec`]). Blobs, trees, and
//! commits are write-once — `INSERT OR IGNORE` — so an identity collision
//! is proof of content equivalence, never a conflict to resolve.

use rusqlite::{params, OptionalExtension};

use crate::codec::sha256_hex_of;
use crate::domain::{Commit, DiffResult, TreeEntry, EPOCH};
use crate::error::{EngineError, Result};
use crate::store::Store;

/// A bare 64-character lowercase hex string, the shape of every
/// content hash this engine produces.
fn looks_like_commit_hash(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

pub struct TreeBuildResult {
    pub tree_hash: String,
    pub entries: Vec<TreeEntry>,
    pub row_count: usize,
    pub repo_id: String,
}

pub struct Dag<'s> {
    store: &'s Store,
}

impl<'s> Dag<'s> {
    pub fn new(store: &'s Store) -> Self {
        Self { store }
    }

    /// Join `documents` ⋈ `chunks` for one repository, ordered
    /// `(doc_id ASC, chunk_id ASC)`, and hash the resulting entry list.
    pub fn create_tree_from_current_state(&self, repo_id: &str) -> Result<TreeBuildResult> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT d.doc_id, d.title, d.content_hash, c.chunk_id, c.span_start, c.span_end, c.content_hash, c.text
                 FROM documents d
                 JOIN chunks c ON c.doc_id = d.doc_id
                 WHERE d.repo_id = ?1
                 ORDER BY d.doc_id ASC, c.chunk_id ASC",
            )?;
            let rows = stmt.query_map(params![repo_id], |row| {
                let span_start: Option<i64> = row.get(4)?;
                let span_end: Option<i64> = row.get(5)?;
                let text: String = row.get(7)?;
                Ok(TreeEntry {
                    doc_id: row.get(0)?,
                    title: row.get(1)?,
                    doc_content_hash: row.get(2)?,
                    chunk_id: row.get(3)?,
                    span_start: span_start.unwrap_or(0),
                    span_end: span_end.unwrap_or(text.len() as i64),
                    chunk_content_hash: row.get(6)?,
                })
            })?;
            let entries: Vec<TreeEntry> = rows.collect::<std::result::Result<_, _>>()?;
            let tree_hash = sha256_hex_of(&entries);
            let row_count = entries.len();
            Ok(TreeBuildResult {
                tree_hash,
                entries,
                row_count,
                repo_id: repo_id.to_string(),
            })
        })
    }

    /// Idempotent insert of the tree plus its doc/chunk projections.
    pub fn save_tree(&self, tree_hash: &str, repo_id: &str, entries: &[TreeEntry]) -> Result<()> {
        let entries_json = serde_json::to_string(entries)?;
        self.store.transaction(|tx| {
            tx.execute(
                "INSERT OR IGNORE INTO trees (tree_hash, entries_json) VALUES (?1, ?2)",
                params![tree_hash, entries_json],
            )?;

            let mut seen_docs = std::collections::HashSet::new();
            for entry in entries {
                if seen_docs.insert(entry.doc_id.clone()) {
                    tx.execute(
                        "INSERT OR IGNORE INTO tree_docs (tree_hash, doc_id, repo_id, doc_content_hash, title) VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![tree_hash, entry.doc_id, repo_id, entry.doc_content_hash, entry.title],
                    )?;
                }
                tx.execute(
                    "INSERT OR IGNORE INTO tree_chunks (tree_hash, chunk_id, doc_id, span_start, span_end, content_hash)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![tree_hash, entry.chunk_id, entry.doc_id, entry.span_start, entry.span_end, entry.chunk_content_hash],
                )?;
            }
            Ok(())
        })
    }

    /// `commit_hash = sha256(canonical({tree_hash, parents}))`. Message
    /// and `created_at` are stored but excluded from identity;
    /// `created_at` is fixed to the epoch.
    pub fn create_commit(&self, tree_hash: &str, parents: &[String], message: &str) -> Result<Commit> {
        #[derive(serde::Serialize)]
        struct Identity<'a> {
            tree_hash: &'a str,
            parents: &'a [String],
        }
        let commit_hash = sha256_hex_of(&Identity { tree_hash, parents });
        let parents_json = serde_json::to_string(parents)?;

        self.store.transaction(|tx| {
            let tree_exists: Option<String> = tx
                .query_row(
                    "SELECT tree_hash FROM trees WHERE tree_hash = ?1",
                    params![tree_hash],
                    |r| r.get(0),
                )
                .optional()?;
            if tree_exists.is_none() {
                return Err(EngineError::tree_hash_missing(format!(
                    "tree {tree_hash} has not been saved"
                )));
            }

            tx.execute(
                "INSERT OR IGNORE INTO commits (commit_hash, tree_hash, parents_json, message, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![commit_hash, tree_hash, parents_json, message, EPOCH],
            )?;
            Ok(())
        })?;

        Ok(Commit {
            commit_hash,
            tree_hash: tree_hash.to_string(),
            parents: parents.to_vec(),
            message: message.to_string(),
            created_at: EPOCH.to_string(),
        })
    }

    pub fn get_commit(&self, commit_hash: &str) -> Result<Commit> {
        self.store.read(|conn| {
            conn.query_row(
                "SELECT commit_hash, tree_hash, parents_json, message, created_at FROM commits WHERE commit_hash = ?1",
                params![commit_hash],
                |row| {
                    let parents_json: String = row.get(2)?;
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        parents_json,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?
            .map(|(commit_hash, tree_hash, parents_json, message, created_at)| {
                let parents: Vec<String> = serde_json::from_str(&parents_json)?;
                Ok(Commit {
                    commit_hash,
                    tree_hash,
                    parents,
                    message,
                    created_at,
                })
            })
            .unwrap_or_else(|| Err(EngineError::commit_not_found(commit_hash)))
        })
    }

    pub fn update_ref(&self, name: &str, commit_hash: &str) -> Result<()> {
        self.store.transaction(|tx| {
            let exists: Option<String> = tx
                .query_row(
                    "SELECT commit_hash FROM commits WHERE commit_hash = ?1",
                    params![commit_hash],
                    |r| r.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(EngineError::commit_not_found(commit_hash));
            }
            tx.execute(
                "INSERT INTO refs (ref_name, commit_hash) VALUES (?1, ?2)
                 ON CONFLICT(ref_name) DO UPDATE SET commit_hash = excluded.commit_hash",
                params![name, commit_hash],
            )?;
            Ok(())
        })
    }

    /// Resolve `s` to a commit hash: a known ref name wins first, then a
    /// bare 64-hex commit hash literal, else `None`.
    pub fn resolve_target(&self, s: &str) -> Result<Option<String>> {
        self.store.read(|conn| {
            let by_ref: Option<String> = conn
                .query_row(
                    "SELECT commit_hash FROM refs WHERE ref_name = ?1",
                    params![s],
                    |r| r.get(0),
                )
                .optional()?;
            if by_ref.is_some() {
                return Ok(by_ref);
            }
            if looks_like_commit_hash(s) {
                return Ok(Some(s.to_string()));
            }
            Ok(None)
        })
    }

    pub fn get_tree_entries(&self, tree_hash: &str) -> Result<Vec<TreeEntry>> {
        self.store.read(|conn| {
            let entries_json: Option<String> = conn
                .query_row(
                    "SELECT entries_json FROM trees WHERE tree_hash = ?1",
                    params![tree_hash],
                    |r| r.get(0),
                )
                .optional()?;
            let entries_json = entries_json.ok_or_else(|| EngineError::tree_not_found(tree_hash))?;
            serde_json::from_str(&entries_json)
                .map_err(|e| EngineError::data_corruption(format!("malformed tree entries: {e}")))
        })
    }

    /// Checkout: rewrite the working `documents`/`chunks`/`chunks_fts`
    /// tables from a frozen tree.
    pub fn materialize_tree(&self, tree_hash: &str) -> Result<()> {
        let entries = self.get_tree_entries(tree_hash)?;

        self.store.transaction(|tx| {
            // Step 2: every blob referenced by tree_docs must exist.
            let mut doc_stmt = tx.prepare(
                "SELECT doc_id, repo_id, doc_content_hash, title FROM tree_docs WHERE tree_hash = ?1",
            )?;
            let docs: Vec<(String, String, String, String)> = doc_stmt
                .query_map(params![tree_hash], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?
                .collect::<std::result::Result<_, _>>()?;
            drop(doc_stmt);

            if docs.is_empty() {
                return Err(EngineError::tree_docs_missing(format!(
                    "no tree_docs rows for tree {tree_hash}"
                )));
            }

            for (_, _, content_hash, _) in &docs {
                let exists: Option<String> = tx
                    .query_row(
                        "SELECT content_hash FROM blobs WHERE content_hash = ?1",
                        params![content_hash],
                        |r| r.get(0),
                    )
                    .optional()?;
                if exists.is_none() {
                    return Err(EngineError::blob_missing(content_hash.clone()));
                }
            }

            // Step 3: FK order — chunks before documents.
            tx.execute("DELETE FROM chunks", [])?;
            tx.execute("DELETE FROM documents", [])?;

            // Step 4: reinsert documents at the epoch, reinsert chunks
            // sliced from their document blob.
            for (doc_id, repo_id, content_hash, title) in &docs {
                tx.execute(
                    "INSERT INTO documents (doc_id, repo_id, title, content_hash, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![doc_id, repo_id, title, content_hash, EPOCH],
                )?;
            }

            for entry in &entries {
                let doc_bytes: Vec<u8> = tx.query_row(
                    "SELECT data FROM blobs WHERE content_hash = ?1",
                    params![entry.doc_content_hash],
                    |r| r.get(0),
                )?;
                let doc_text = String::from_utf8(doc_bytes)
                    .map_err(|e| EngineError::data_corruption(format!("non-utf8 document blob: {e}")))?;
                let start = entry.span_start.max(0) as usize;
                let end = entry.span_end.max(0) as usize;
                let chunk_text: String = doc_text.get(start..end).unwrap_or_default().to_string();
                tx.execute(
                    "INSERT INTO chunks (chunk_id, doc_id, span_start, span_end, text, content_hash) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![entry.chunk_id, entry.doc_id, entry.span_start, entry.span_end, chunk_text, entry.chunk_content_hash],
                )?;
            }
            // Step 5: chunks_fts is rebuilt by the AFTER INSERT triggers
            // on `chunks` fired above — no separate pass needed.
            Ok(())
        })
    }

    /// File-level diff between two trees' `{doc_id -> doc_content_hash}`
    /// projections.
    pub fn diff_index(&self, from: &str, to: &str) -> Result<DiffResult> {
        let from_entries = self.get_tree_entries(from)?;
        let to_entries = self.get_tree_entries(to)?;

        let mut from_docs = std::collections::HashMap::new();
        for e in &from_entries {
            from_docs.insert(e.doc_id.clone(), e.doc_content_hash.clone());
        }
        let mut to_docs = std::collections::HashMap::new();
        for e in &to_entries {
            to_docs.insert(e.doc_id.clone(), e.doc_content_hash.clone());
        }

        let mut added = Vec::new();
        let mut removed = Vec::new();
        let mut changed = Vec::new();

        for (doc_id, hash) in &to_docs {
            match from_docs.get(doc_id) {
                None => added.push(doc_id.clone()),
                Some(old_hash) if old_hash != hash => changed.push(doc_id.clone()),
                Some(_) => {}
            }
        }
        for doc_id in from_docs.keys() {
            if !to_docs.contains_key(doc_id) {
                removed.push(doc_id.clone());
            }
        }

        added.sort();
        removed.sort();
        changed.sort();

        Ok(DiffResult {
            added,
            removed,
            changed,
        })
    }

    /// Record a cross-chunk dependency edge. Plain upsert; the edge
    /// participates in no hash and is never touched by GC.
    pub fn add_dependency(&self, dep: &crate::domain::Dependency) -> Result<()> {
        self.store.transaction(|tx| {
            tx.execute(
                "INSERT OR IGNORE INTO dependencies (from_chunk_id, to_chunk_id, dep_type) VALUES (?1, ?2, ?3)",
                params![dep.from_chunk_id, dep.to_chunk_id, dep.dep_type],
            )?;
            Ok(())
        })
    }

    /// Every edge touching `chunk_id`, either as source or target.
    pub fn list_dependencies(&self, chunk_id: &str) -> Result<Vec<crate::domain::Dependency>> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT from_chunk_id, to_chunk_id, dep_type FROM dependencies
                 WHERE from_chunk_id = ?1 OR to_chunk_id = ?1
                 ORDER BY from_chunk_id ASC, to_chunk_id ASC, dep_type ASC",
            )?;
            let rows = stmt.query_map(params![chunk_id], |row| {
                Ok(crate::domain::Dependency {
                    from_chunk_id: row.get(0)?,
                    to_chunk_id: row.get(1)?,
                    dep_type: row.get(2)?,
                })
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>().map_err(EngineError::from)
        })
    }

    pub fn remove_dependency(&self, dep: &crate::domain::Dependency) -> Result<()> {
        self.store.transaction(|tx| {
            tx.execute(
                "DELETE FROM dependencies WHERE from_chunk_id = ?1 AND to_chunk_id = ?2 AND dep_type = ?3",
                params![dep.from_chunk_id, dep.to_chunk_id, dep.dep_type],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Chunk, Document};

    fn seed_document(store: &Store, repo_id: &str, doc_id: &str, title: &str, content: &str) {
        let doc = Document::new(doc_id, repo_id, title, content);
        store
            .transaction(|tx| {
                tx.execute(
                    "INSERT OR IGNORE INTO repositories (id, name) VALUES (?1, ?1)",
                    params![repo_id],
                )?;
                tx.execute(
                    "INSERT OR IGNORE INTO blobs (content_hash, data) VALUES (?1, ?2)",
                    params![doc.content_hash, doc.content.as_bytes()],
                )?;
                tx.execute(
                    "INSERT INTO documents (doc_id, repo_id, title, content_hash, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![doc.doc_id, doc.repo_id, doc.title, doc.content_hash, crate::domain::EPOCH],
                )?;
                Ok(())
            })
            .unwrap();
    }

    fn seed_chunk(store: &Store, doc_id: &str, chunk_id: &str, start: usize, end: usize, text: &str) {
        let chunk = Chunk::new(chunk_id, doc_id, start, end, text);
        store
            .transaction(|tx| {
                tx.execute(
                    "INSERT INTO chunks (chunk_id, doc_id, span_start, span_end, text, content_hash) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![chunk.chunk_id, chunk.doc_id, chunk.span_start as i64, chunk.span_end as i64, chunk.text, chunk.content_hash],
                )?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn stable_commit_identity_across_replay() {
        let store1 = Store::open_in_memory().unwrap();
        seed_document(&store1, "repo", "A", "A", "hello");
        seed_chunk(&store1, "A", "A#0", 0, 5, "hello");
        seed_document(&store1, "repo", "B", "B", "world");
        seed_chunk(&store1, "B", "B#0", 0, 5, "world");
        let dag1 = Dag::new(&store1);
        let built1 = dag1.create_tree_from_current_state("repo").unwrap();
        dag1.save_tree(&built1.tree_hash, &built1.repo_id, &built1.entries).unwrap();
        let commit1 = dag1.create_commit(&built1.tree_hash, &[], "initial").unwrap();

        let store2 = Store::open_in_memory().unwrap();
        seed_document(&store2, "repo", "A", "A", "hello");
        seed_chunk(&store2, "A", "A#0", 0, 5, "hello");
        seed_document(&store2, "repo", "B", "B", "world");
        seed_chunk(&store2, "B", "B#0", 0, 5, "world");
        let dag2 = Dag::new(&store2);
        let built2 = dag2.create_tree_from_current_state("repo").unwrap();
        dag2.save_tree(&built2.tree_hash, &built2.repo_id, &built2.entries).unwrap();
        let commit2 = dag2.create_commit(&built2.tree_hash, &[], "initial").unwrap();

        assert_eq!(built1.tree_hash, built2.tree_hash);
        assert_eq!(commit1.commit_hash, commit2.commit_hash);
    }

    #[test]
    fn diff_correctness() {
        let store = Store::open_in_memory().unwrap();
        seed_document(&store, "repo", "A", "A", "x");
        seed_chunk(&store, "A", "A#0", 0, 1, "x");
        seed_document(&store, "repo", "B", "B", "y");
        seed_chunk(&store, "B", "B#0", 0, 1, "y");
        let dag = Dag::new(&store);
        let built1 = dag.create_tree_from_current_state("repo").unwrap();
        dag.save_tree(&built1.tree_hash, &built1.repo_id, &built1.entries).unwrap();

        store
            .transaction(|tx| {
                tx.execute("DELETE FROM chunks WHERE doc_id = 'B'", [])?;
                tx.execute("DELETE FROM documents WHERE doc_id = 'B'", [])?;
                Ok(())
            })
            .unwrap();
        seed_document(&store, "repo", "B", "B", "y2");
        seed_chunk(&store, "B", "B#0", 0, 2, "y2");
        seed_document(&store, "repo", "C", "C", "z");
        seed_chunk(&store, "C", "C#0", 0, 1, "z");

        let built2 = dag.create_tree_from_current_state("repo").unwrap();
        dag.save_tree(&built2.tree_hash, &built2.repo_id, &built2.entries).unwrap();

        let diff = dag.diff_index(&built1.tree_hash, &built2.tree_hash).unwrap();
        assert_eq!(diff.added, vec!["C".to_string()]);
        assert!(diff.removed.is_empty());
        assert_eq!(diff.changed, vec!["B".to_string()]);
    }

    #[test]
    fn resolve_target_prefers_ref_then_hex_literal_then_none() {
        let store = Store::open_in_memory().unwrap();
        seed_document(&store, "repo", "A", "A", "x");
        seed_chunk(&store, "A", "A#0", 0, 1, "x");
        let dag = Dag::new(&store);
        let built = dag.create_tree_from_current_state("repo").unwrap();
        dag.save_tree(&built.tree_hash, &built.repo_id, &built.entries).unwrap();
        let commit = dag.create_commit(&built.tree_hash, &[], "m").unwrap();
        dag.update_ref("HEAD", &commit.commit_hash).unwrap();

        assert_eq!(dag.resolve_target("HEAD").unwrap(), Some(commit.commit_hash.clone()));
        assert_eq!(dag.resolve_target(&commit.commit_hash).unwrap(), Some(commit.commit_hash.clone()));
        assert_eq!(dag.resolve_target("not-a-hash").unwrap(), None);
    }

    #[test]
    fn checkout_round_trip() {
        let store = Store::open_in_memory().unwrap();
        seed_document(&store, "repo", "A", "A", "hello world");
        seed_chunk(&store, "A", "A#0", 0, 5, "hello");
        let dag = Dag::new(&store);
        let built = dag.create_tree_from_current_state("repo").unwrap();
        dag.save_tree(&built.tree_hash, &built.repo_id, &built.entries).unwrap();

        // Mutate working tree.
        store
            .transaction(|tx| {
                tx.execute("DELETE FROM chunks", [])?;
                tx.execute("DELETE FROM documents", [])?;
                Ok(())
            })
            .unwrap();

        dag.materialize_tree(&built.tree_hash).unwrap();

        let after = dag.create_tree_from_current_state("repo").unwrap();
        assert_eq!(after.tree_hash, built.tree_hash);
    }

    #[test]
    fn dependency_crud_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let dag = Dag::new(&store);
        let dep = crate::domain::Dependency {
            from_chunk_id: "A#0".to_string(),
            to_chunk_id: "B#0".to_string(),
            dep_type: "imports".to_string(),
        };
        dag.add_dependency(&dep).unwrap();
        dag.add_dependency(&dep).unwrap();

        let from_a = dag.list_dependencies("A#0").unwrap();
        assert_eq!(from_a, vec![dep.clone()]);
        let from_b = dag.list_dependencies("B#0").unwrap();
        assert_eq!(from_b, vec![dep.clone()]);

        dag.remove_dependency(&dep).unwrap();
        assert!(dag.list_dependencies("A#0").unwrap().is_empty());
    }
}
