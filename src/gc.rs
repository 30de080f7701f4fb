//! Artifact GC: reachability from kept refs, projected onto trees, with
//! unreachable derived artifacts (FTS bundles, embeddings) deleted in
//! FK-safe order. Commits, trees, and blobs are never touched here — this
//! module only reclaims the derived-artifact layer built on top of them.

use std::collections::HashSet;

use rusqlite::params;

use crate::error::Result;
use crate::store::Store;

#[derive(Debug, Default)]
pub struct GcReport {
    pub reachable_refs: Vec<String>,
    pub reachable_commits: usize,
    pub reachable_trees: usize,
    pub unreachable_trees: Vec<String>,
    pub deleted_artifacts: usize,
    pub deleted_embedding_trees: usize,
    pub dry_run: bool,
}

pub struct Gc<'s> {
    store: &'s Store,
}

impl<'s> Gc<'s> {
    pub fn new(store: &'s Store) -> Self {
        Self { store }
    }

    /// `keep_refs` names the roots to walk; `None` means every row of
    /// `refs`. `kinds` optionally restricts which `index_artifacts.kind`
    /// values are eligible for deletion (embeddings are always considered
    /// regardless of `kinds`, since they live in their own table).
    /// `dry_run = true` computes and returns the plan without deleting
    /// anything; `dry_run = false` executes it inside one transaction.
    pub fn gc_artifacts(&self, dry_run: bool, keep_refs: Option<&[String]>, kinds: Option<&[String]>) -> Result<GcReport> {
        let (reachable_refs, reachable_commits, reachable_trees) = self.store.read(|conn| {
            let roots: Vec<(String, String)> = match keep_refs {
                Some(names) => {
                    let mut out = Vec::with_capacity(names.len());
                    for name in names {
                        let commit_hash: Option<String> = conn
                            .query_row("SELECT commit_hash FROM refs WHERE ref_name = ?1", params![name], |r| r.get(0))
                            .ok();
                        if let Some(commit_hash) = commit_hash {
                            out.push((name.clone(), commit_hash));
                        }
                    }
                    out
                }
                None => conn
                    .prepare("SELECT ref_name, commit_hash FROM refs")?
                    .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
                    .collect::<std::result::Result<_, _>>()?,
            };
            let reachable_refs: Vec<String> = roots.iter().map(|(name, _)| name.clone()).collect();

            let mut reachable_commits: HashSet<String> = HashSet::new();
            let mut stack: Vec<String> = roots.into_iter().map(|(_, commit_hash)| commit_hash).collect();
            while let Some(commit_hash) = stack.pop() {
                if !reachable_commits.insert(commit_hash.clone()) {
                    continue;
                }
                let parents_json: Option<String> = conn
                    .query_row(
                        "SELECT parents_json FROM commits WHERE commit_hash = ?1",
                        params![commit_hash],
                        |r| r.get(0),
                    )
                    .ok();
                if let Some(parents_json) = parents_json {
                    let parents: Vec<String> = serde_json::from_str(&parents_json).unwrap_or_default();
                    stack.extend(parents);
                }
            }

            let mut reachable_trees: HashSet<String> = HashSet::new();
            for commit_hash in &reachable_commits {
                let tree_hash: Option<String> = conn
                    .query_row(
                        "SELECT tree_hash FROM commits WHERE commit_hash = ?1",
                        params![commit_hash],
                        |r| r.get(0),
                    )
                    .ok();
                if let Some(tree_hash) = tree_hash {
                    reachable_trees.insert(tree_hash);
                }
            }

            Ok::<_, crate::error::EngineError>((reachable_refs, reachable_commits, reachable_trees))
        })?;

        let mut report = GcReport {
            reachable_refs,
            reachable_commits: reachable_commits.len(),
            reachable_trees: reachable_trees.len(),
            dry_run,
            ..Default::default()
        };

        let unreachable_artifact_trees: Vec<String> = self.store.read(|conn| {
            let sql = match kinds {
                Some(kinds) if !kinds.is_empty() => {
                    let placeholders = kinds.iter().map(|_| "?").collect::<Vec<_>>().join(",");
                    format!("SELECT DISTINCT tree_hash FROM index_artifacts WHERE kind IN ({placeholders})")
                }
                _ => "SELECT DISTINCT tree_hash FROM index_artifacts".to_string(),
            };
            let mut stmt = conn.prepare(&sql)?;
            let rows = match kinds {
                Some(kinds) if !kinds.is_empty() => {
                    let query_params: Vec<&dyn rusqlite::ToSql> = kinds.iter().map(|k| k as &dyn rusqlite::ToSql).collect();
                    stmt.query_map(query_params.as_slice(), |r| r.get::<_, String>(0))?
                        .collect::<std::result::Result<Vec<_>, _>>()?
                }
                _ => stmt
                    .query_map([], |r| r.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?,
            };
            Ok::<_, crate::error::EngineError>(rows.into_iter().filter(|t| !reachable_trees.contains(t)).collect())
        })?;

        let unreachable_embedding_trees: Vec<String> = self.store.read(|conn| {
            let rows: Vec<String> = conn
                .prepare("SELECT DISTINCT tree_hash FROM chunk_embeddings")?
                .query_map([], |r| r.get::<_, String>(0))?
                .collect::<std::result::Result<_, _>>()?;
            Ok::<_, crate::error::EngineError>(rows.into_iter().filter(|t| !reachable_trees.contains(t)).collect())
        })?;

        let mut unreachable_trees: Vec<String> = unreachable_artifact_trees.clone();
        for tree_hash in &unreachable_embedding_trees {
            if !unreachable_trees.contains(tree_hash) {
                unreachable_trees.push(tree_hash.clone());
            }
        }
        unreachable_trees.sort();
        report.unreachable_trees = unreachable_trees;
        report.deleted_embedding_trees = unreachable_embedding_trees.len();

        if dry_run {
            let artifact_count: usize = self.store.read(|conn| {
                let mut total = 0usize;
                for tree_hash in &unreachable_artifact_trees {
                    let count: i64 = conn.query_row(
                        "SELECT COUNT(*) FROM index_artifacts WHERE tree_hash = ?1",
                        params![tree_hash],
                        |r| r.get(0),
                    )?;
                    total += count as usize;
                }
                Ok::<_, crate::error::EngineError>(total)
            })?;
            report.deleted_artifacts = artifact_count;
            return Ok(report);
        }

        self.store.transaction(|tx| {
            for tree_hash in &unreachable_artifact_trees {
                let artifact_count: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM index_artifacts WHERE tree_hash = ?1",
                    params![tree_hash],
                    |r| r.get(0),
                )?;
                report.deleted_artifacts += artifact_count as usize;

                tx.execute(
                    "DELETE FROM artifact_refs WHERE artifact_id IN (SELECT artifact_id FROM index_artifacts WHERE tree_hash = ?1)",
                    params![tree_hash],
                )?;
                tx.execute("DELETE FROM index_artifacts WHERE tree_hash = ?1", params![tree_hash])?;
            }
            for tree_hash in &unreachable_embedding_trees {
                tx.execute("DELETE FROM chunk_embeddings WHERE tree_hash = ?1", params![tree_hash])?;
            }
            Ok(())
        })?;

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::Dag;
    use crate::domain::{Chunk, Document};
    use crate::fts::Fts;

    fn seed(store: &Store, doc_id: &str, chunk_id: &str, text: &str) {
        let doc = Document::new(doc_id, "repo", doc_id, text);
        let chunk = Chunk::new(chunk_id, doc_id, 0, text.len(), text);
        store
            .transaction(|tx| {
                tx.execute(
                    "INSERT OR IGNORE INTO blobs (content_hash, data) VALUES (?1, ?2)",
                    params![doc.content_hash, doc.content.as_bytes()],
                )?;
                tx.execute(
                    "INSERT INTO documents (doc_id, repo_id, title, content_hash, updated_at) VALUES (?1, 'repo', ?2, ?3, ?4)",
                    params![doc.doc_id, doc.title, doc.content_hash, crate::domain::EPOCH],
                )?;
                tx.execute(
                    "INSERT INTO chunks (chunk_id, doc_id, span_start, span_end, text, content_hash) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![chunk.chunk_id, chunk.doc_id, chunk.span_start as i64, chunk.span_end as i64, chunk.text, chunk.content_hash],
                )?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn artifacts_of_a_commit_still_reachable_via_head_survive() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, "A", "A#0", "hello");
        let dag = Dag::new(&store);
        let built1 = dag.create_tree_from_current_state("repo").unwrap();
        dag.save_tree(&built1.tree_hash, &built1.repo_id, &built1.entries).unwrap();
        let commit1 = dag.create_commit(&built1.tree_hash, &[], "first").unwrap();

        let fts = Fts::new(&store);
        fts.build_fts_tree(&built1.tree_hash, false).unwrap();

        store
            .transaction(|tx| {
                tx.execute("DELETE FROM chunks", [])?;
                tx.execute("DELETE FROM documents", [])?;
                Ok(())
            })
            .unwrap();
        seed(&store, "A", "A#0", "hello again");
        let built2 = dag.create_tree_from_current_state("repo").unwrap();
        dag.save_tree(&built2.tree_hash, &built2.repo_id, &built2.entries).unwrap();
        let commit2 = dag.create_commit(&built2.tree_hash, &[commit1.commit_hash.clone()], "second").unwrap();
        dag.update_ref("HEAD", &commit2.commit_hash).unwrap();

        let gc = Gc::new(&store);
        let report = gc.gc_artifacts(false, None, None).unwrap();
        // commit1's tree is still reachable via HEAD -> commit2 -> commit1 parent chain.
        assert_eq!(report.deleted_artifacts, 0);
        assert_eq!(report.reachable_commits, 2);

        store
            .read(|conn| {
                let count: i64 = conn.query_row("SELECT COUNT(*) FROM commits", [], |r| r.get(0))?;
                assert_eq!(count, 2, "GC must never delete commits");
                let artifact_count: i64 = conn.query_row("SELECT COUNT(*) FROM index_artifacts", [], |r| r.get(0))?;
                assert_eq!(artifact_count, 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn artifacts_of_an_unreferenced_commit_are_collected_but_the_commit_survives() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, "A", "A#0", "hello");
        let dag = Dag::new(&store);
        let built = dag.create_tree_from_current_state("repo").unwrap();
        dag.save_tree(&built.tree_hash, &built.repo_id, &built.entries).unwrap();
        dag.create_commit(&built.tree_hash, &[], "orphan").unwrap();

        let fts = Fts::new(&store);
        fts.build_fts_tree(&built.tree_hash, false).unwrap();

        let provider = crate::embeddings::LocalDeterministicProvider::new(8);
        let embeddings = crate::embeddings::Embeddings::new(&store);
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(embeddings.build_embeddings(&dag, &built.tree_hash, &provider, None))
            .unwrap();

        let gc = Gc::new(&store);
        let dry = gc.gc_artifacts(true, None, None).unwrap();
        assert_eq!(dry.reachable_commits, 0);
        assert_eq!(dry.deleted_artifacts, 1);
        assert_eq!(dry.unreachable_trees, vec![built.tree_hash.clone()]);

        let report = gc.gc_artifacts(false, None, None).unwrap();
        assert_eq!(report.deleted_artifacts, 1);
        assert_eq!(report.deleted_embedding_trees, 1);

        store
            .read(|conn| {
                let commit_count: i64 = conn.query_row("SELECT COUNT(*) FROM commits", [], |r| r.get(0))?;
                assert_eq!(commit_count, 1, "GC must never delete commits, only derived artifacts");
                let tree_count: i64 = conn.query_row("SELECT COUNT(*) FROM trees", [], |r| r.get(0))?;
                assert_eq!(tree_count, 1, "GC must never delete trees");
                let artifact_count: i64 = conn.query_row("SELECT COUNT(*) FROM index_artifacts", [], |r| r.get(0))?;
                assert_eq!(artifact_count, 0);
                let embedding_count: i64 = conn.query_row("SELECT COUNT(*) FROM chunk_embeddings", [], |r| r.get(0))?;
                assert_eq!(embedding_count, 0);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn keep_refs_restricts_the_root_set() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, "A", "A#0", "hello");
        let dag = Dag::new(&store);
        let built = dag.create_tree_from_current_state("repo").unwrap();
        dag.save_tree(&built.tree_hash, &built.repo_id, &built.entries).unwrap();
        let commit = dag.create_commit(&built.tree_hash, &[], "only").unwrap();
        dag.update_ref("experimental", &commit.commit_hash).unwrap();

        let fts = Fts::new(&store);
        fts.build_fts_tree(&built.tree_hash, false).unwrap();

        let gc = Gc::new(&store);
        // Asking to keep only "HEAD" (which was never set) treats this ref's
        // tree as unreachable even though "experimental" points to it.
        let report = gc.gc_artifacts(true, Some(&["HEAD".to_string()]), None).unwrap();
        assert_eq!(report.reachable_refs, Vec::<String>::new());
        assert_eq!(report.deleted_artifacts, 1);
    }

    #[test]
    fn kinds_filter_limits_candidate_artifacts() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, "A", "A#0", "hello");
        let dag = Dag::new(&store);
        let built = dag.create_tree_from_current_state("repo").unwrap();
        dag.save_tree(&built.tree_hash, &built.repo_id, &built.entries).unwrap();
        dag.create_commit(&built.tree_hash, &[], "orphan").unwrap();

        let fts = Fts::new(&store);
        fts.build_fts_tree(&built.tree_hash, false).unwrap();

        let gc = Gc::new(&store);
        let report = gc.gc_artifacts(true, None, Some(&["embeddings".to_string()])).unwrap();
        assert_eq!(report.deleted_artifacts, 0);
    }
}
