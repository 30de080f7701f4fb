//! Gated FTS bundle construction: the `fts_chunks`/`fts_chunks_fts` pair
//! only accepts writes while the `fts_maintenance` singleton is open, and
//! the gate is opened and closed exactly once per [`build_fts_tree`] call
//! so a crash mid-build leaves the gate closed rather than half-open.

use rusqlite::params;
use unicode_normalization::UnicodeNormalization;

use crate::codec::lower63_bits;
use crate::error::{EngineError, Result};
use crate::store::schema::EXPECTED_GATE_TRIGGER_DDL;
use crate::store::Store;

const MAX_ROWID_ATTEMPTS: u32 = 10;

pub struct FtsBuildReport {
    pub tree_hash: String,
    pub chunk_count: usize,
    pub skipped: bool,
}

pub struct FtsValidationReport {
    pub tree_hash: String,
    pub chunk_count: usize,
    pub bundle_hash: String,
}

pub struct Fts<'s> {
    store: &'s Store,
}

impl<'s> Fts<'s> {
    pub fn new(store: &'s Store) -> Self {
        Self { store }
    }

    /// Build the gated FTS bundle for a frozen tree.
    ///
    /// 1. tree must be frozen (`tree_chunks` non-empty), else `ERR_NOT_FROZEN`.
    /// 2. if an artifact already exists for `(tree_hash, 'fts', '')`,
    ///    recompute its payload hash: equal means this is a harmless
    ///    replay (`skipped: true`), unequal means `ERR_ARTIFACT_DRIFT`.
    /// 3. if no artifact exists but `fts_chunks` already has rows for this
    ///    tree, someone wrote outside this path: `ERR_DIRTY_STATE` unless
    ///    `force_rebuild` clears them first.
    /// 4. NFKC-normalize each chunk's text before indexing.
    /// 5. open the gate, insert one `fts_chunks` row per tree_chunk
    ///    (rowid = `lower63_bits(sha256(tree_hash:chunk_id:attempt))`,
    ///    retried up to 10 times on collision), close the gate.
    /// 6. record the artifact manifest (`index_artifacts` + `artifact_refs`).
    pub fn build_fts_tree(&self, tree_hash: &str, force_rebuild: bool) -> Result<FtsBuildReport> {
        let tree_chunks = self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT chunk_id, doc_id, content_hash, span_start, span_end
                 FROM tree_chunks WHERE tree_hash = ?1 ORDER BY chunk_id ASC",
            )?;
            let rows = stmt.query_map(params![tree_hash], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(EngineError::from)
        })?;

        if tree_chunks.is_empty() {
            return Err(EngineError::not_frozen(format!(
                "tree {tree_hash} has no tree_chunks rows; call save_tree first"
            )));
        }

        let expected_payload_hash = crate::codec::sha256_hex_of(
            &tree_chunks.iter().map(|(id, _, h, _, _)| (id.clone(), h.clone())).collect::<Vec<_>>(),
        );

        // Reconstruct chunk text from the frozen snapshot (tree_docs ⋈
        // blobs), never from the mutable working `chunks` table — a
        // history-correct index must not drift when the working tree does.
        let doc_blobs: Vec<(String, Vec<u8>)> = self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT td.doc_id, b.data
                 FROM tree_docs td
                 JOIN blobs b ON b.content_hash = td.doc_content_hash
                 WHERE td.tree_hash = ?1",
            )?;
            let rows = stmt.query_map(params![tree_hash], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(EngineError::from)
        })?;

        let mut doc_texts: std::collections::HashMap<String, String> =
            std::collections::HashMap::with_capacity(doc_blobs.len());
        for (doc_id, data) in doc_blobs {
            let text = String::from_utf8(data).map_err(|e| {
                EngineError::data_corruption(format!("non-utf8 document blob for {doc_id}: {e}"))
            })?;
            doc_texts.insert(doc_id, text);
        }

        let existing: Option<(String, String)> = self.store.read(|conn| {
            conn.query_row(
                "SELECT artifact_id, payload_hash FROM index_artifacts WHERE tree_hash = ?1 AND kind = 'fts' AND model_id = ''",
                params![tree_hash],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional_engine()
        })?;

        if let Some((_, stored_payload_hash)) = existing {
            if stored_payload_hash == expected_payload_hash {
                return Ok(FtsBuildReport {
                    tree_hash: tree_hash.to_string(),
                    chunk_count: tree_chunks.len(),
                    skipped: true,
                });
            }
            return Err(EngineError::artifact_drift(format!(
                "tree {tree_hash} has an fts artifact whose payload no longer matches its tree_chunks"
            )));
        }

        // Reconstruct and hash-verify every chunk's text up front, outside
        // any transaction — a bad document or a tampered content_hash
        // should fail before the gate ever opens, not mid-write.
        let mut resolved_chunks: Vec<(String, String, String)> = Vec::with_capacity(tree_chunks.len());
        for (chunk_id, doc_id, content_hash, span_start, span_end) in &tree_chunks {
            let doc_text = doc_texts.get(doc_id).ok_or_else(|| {
                EngineError::tree_docs_missing(format!(
                    "tree {tree_hash}: chunk {chunk_id} references doc {doc_id} with no tree_docs/blob row"
                ))
            })?;
            let normalized_doc: String = doc_text.nfkc().collect();
            let start = (*span_start).max(0) as usize;
            let end = (*span_end).max(0) as usize;
            let normalized: String = normalized_doc.get(start..end).unwrap_or_default().to_string();

            let actual_hash = crate::codec::sha256_hex(normalized.as_bytes());
            if &actual_hash != content_hash {
                return Err(EngineError::data_corruption(format!(
                    "tree {tree_hash}: chunk {chunk_id} text hash mismatch (expected {content_hash}, got {actual_hash})"
                )));
            }
            resolved_chunks.push((chunk_id.clone(), content_hash.clone(), normalized));
        }

        let dirty_rows: i64 = self.store.read(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM fts_chunks WHERE tree_hash = ?1",
                params![tree_hash],
                |r| r.get(0),
            )
        })?;
        if dirty_rows > 0 && !force_rebuild {
            return Err(EngineError::dirty_state(format!(
                "tree {tree_hash} already has fts_chunks rows but no recorded artifact; pass force_rebuild to clear them"
            )));
        }

        self.store.transaction(|tx| {
            if dirty_rows > 0 {
                tx.execute("UPDATE fts_maintenance SET enabled = 1 WHERE id = 1", [])?;
                tx.execute("DELETE FROM fts_chunks WHERE tree_hash = ?1", params![tree_hash])?;
                tx.execute("UPDATE fts_maintenance SET enabled = 0 WHERE id = 1", [])?;
            }

            tx.execute("UPDATE fts_maintenance SET enabled = 1 WHERE id = 1", [])?;

            for (chunk_id, content_hash, normalized) in &resolved_chunks {
                let mut attempt = 0u32;
                loop {
                    let salted = format!("{tree_hash}:{chunk_id}:{attempt}");
                    let rowid = lower63_bits(salted.as_bytes());
                    let result = tx.execute(
                        "INSERT INTO fts_chunks (rowid, tree_hash, chunk_id, text, content_hash) VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![rowid, tree_hash, chunk_id, normalized, content_hash],
                    );
                    match result {
                        Ok(_) => break,
                        Err(rusqlite::Error::SqliteFailure(e, _))
                            if e.code == rusqlite::ErrorCode::ConstraintViolation
                                && attempt + 1 < MAX_ROWID_ATTEMPTS =>
                        {
                            attempt += 1;
                            continue;
                        }
                        Err(e) => {
                            let _ = tx.execute("UPDATE fts_maintenance SET enabled = 0 WHERE id = 1", []);
                            return Err(EngineError::rowid_collision(format!(
                                "could not allocate a free rowid for chunk {chunk_id}: {e}"
                            )));
                        }
                    }
                }
            }

            tx.execute("UPDATE fts_maintenance SET enabled = 0 WHERE id = 1", [])?;

            // Step 7: bidirectional completeness between tree_chunks and
            // fts_chunks for this tree.
            let expected_ids: std::collections::HashSet<String> =
                tree_chunks.iter().map(|(id, _, _, _, _)| id.clone()).collect();
            let actual_ids: std::collections::HashSet<String> = tx
                .prepare("SELECT chunk_id FROM fts_chunks WHERE tree_hash = ?1")?
                .query_map(params![tree_hash], |r| r.get::<_, String>(0))?
                .collect::<std::result::Result<_, _>>()?;
            if expected_ids.difference(&actual_ids).next().is_some() {
                return Err(EngineError::fts_incomplete(format!(
                    "tree {tree_hash}: tree_chunks rows missing from fts_chunks after build"
                )));
            }
            if actual_ids.difference(&expected_ids).next().is_some() {
                return Err(EngineError::fts_extra_rows(format!(
                    "tree {tree_hash}: fts_chunks has rows with no matching tree_chunks entry"
                )));
            }

            let manifest = serde_json::json!({
                "kind": "fts",
                "tokenizer": "unicode61",
                "tree_hash": tree_hash,
                "payload_hash": expected_payload_hash,
                "chunk_count": tree_chunks.len(),
                "rowid_strategy": "lower63(sha256(tree_hash:chunk_id:attempt))",
                "fts_sync": "trigger-mirrored",
            });
            let artifact_id = crate::codec::sha256_hex_of(&serde_json::json!({
                "manifest": manifest,
                "payload_hash": expected_payload_hash,
            }));
            let manifest_json = manifest.to_string();
            tx.execute(
                "INSERT INTO index_artifacts (artifact_id, tree_hash, kind, model_id, manifest_json, payload_hash, chunk_count, created_at)
                 VALUES (?1, ?2, 'fts', '', ?3, ?4, ?5, ?6)",
                params![artifact_id, tree_hash, manifest_json, expected_payload_hash, tree_chunks.len() as i64, crate::domain::EPOCH],
            )?;
            tx.execute(
                "INSERT INTO artifact_refs (ref_type, ref_name, kind, artifact_id) VALUES ('tree', ?1, 'fts', ?2)",
                params![tree_hash, artifact_id],
            )?;

            Ok(())
        })?;

        Ok(FtsBuildReport {
            tree_hash: tree_hash.to_string(),
            chunk_count: tree_chunks.len(),
            skipped: false,
        })
    }

    /// Inverse attestation: the gate is closed, every expected trigger
    /// exists with its logical predicate intact (schema-normalized SQL
    /// match against this crate's own DDL), no unexpected trigger touches
    /// the gated tables, `tree_chunks`/`fts_chunks` counts agree, a canary
    /// term from a stored chunk retrieves it, and an fts5 integrity-check
    /// finds no ghost or missing rowid pairs. Produces a stable
    /// `bundle_hash` over the sorted `(trigger name, sha256(sql))` tuples.
    pub fn validate_fts(&self, tree_hash: &str) -> Result<FtsValidationReport> {
        self.store.read(|conn| {
            let gate_enabled: i64 =
                conn.query_row("SELECT enabled FROM fts_maintenance WHERE id = 1", [], |r| r.get(0))?;
            if gate_enabled != 0 {
                return Err(EngineError::dirty_state(
                    "fts gate is open at rest; a prior build may have crashed mid-flight",
                ));
            }

            let expected_ddl: std::collections::HashMap<&str, String> =
                EXPECTED_GATE_TRIGGER_DDL.iter().map(|(name, sql)| (*name, normalize_sql(sql))).collect();

            let stored: Vec<(String, Option<String>)> = conn
                .prepare(
                    "SELECT name, sql FROM sqlite_master WHERE type = 'trigger'
                     AND tbl_name IN ('fts_chunks', 'fts_chunks_fts', 'fts_maintenance')",
                )?
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<std::result::Result<_, _>>()?;

            let mut seen = std::collections::HashSet::new();
            let mut bundle_items: Vec<(String, String)> = Vec::with_capacity(stored.len());
            for (name, sql) in &stored {
                seen.insert(name.clone());
                let normalized_actual = normalize_sql(sql.as_deref().unwrap_or_default());
                match expected_ddl.get(name.as_str()) {
                    Some(expected) if expected == &normalized_actual => {}
                    Some(_) => {
                        return Err(EngineError::gate_missing(format!(
                            "trigger {name} exists but its body no longer matches the gate's DDL"
                        )));
                    }
                    None => {
                        return Err(EngineError::gate_missing(format!(
                            "unexpected trigger {name} touches a gated fts table"
                        )));
                    }
                }
                bundle_items.push((name.clone(), crate::codec::sha256_hex(normalized_actual.as_bytes())));
            }
            for (name, _) in EXPECTED_GATE_TRIGGER_DDL {
                if !seen.contains(*name) {
                    return Err(EngineError::gate_missing(format!("expected gate trigger {name} is missing")));
                }
            }
            bundle_items.sort();

            let expected_ids: Vec<String> = conn
                .prepare("SELECT chunk_id FROM tree_chunks WHERE tree_hash = ?1 ORDER BY chunk_id ASC")?
                .query_map(params![tree_hash], |r| r.get(0))?
                .collect::<std::result::Result<_, _>>()?;
            let actual_ids: Vec<String> = conn
                .prepare("SELECT chunk_id FROM fts_chunks WHERE tree_hash = ?1 ORDER BY chunk_id ASC")?
                .query_map(params![tree_hash], |r| r.get(0))?
                .collect::<std::result::Result<_, _>>()?;

            let expected_set: std::collections::HashSet<_> = expected_ids.iter().collect();
            let actual_set: std::collections::HashSet<_> = actual_ids.iter().collect();

            let missing: Vec<_> = expected_set.difference(&actual_set).collect();
            if !missing.is_empty() {
                return Err(EngineError::fts_incomplete(format!(
                    "{} expected chunk(s) missing from fts_chunks",
                    missing.len()
                )));
            }
            let extra: Vec<_> = actual_set.difference(&expected_set).collect();
            if !extra.is_empty() {
                return Err(EngineError::fts_extra_rows(format!(
                    "{} unexpected chunk(s) present in fts_chunks",
                    extra.len()
                )));
            }

            // Canary-term retrieval: one stored chunk's first term must
            // resolve back to that same chunk via the mirrored fts5 index.
            let canary: Option<(String, String)> = conn
                .query_row(
                    "SELECT chunk_id, text FROM fts_chunks WHERE tree_hash = ?1 ORDER BY chunk_id ASC LIMIT 1",
                    params![tree_hash],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional_engine()?;
            if let Some((canary_chunk_id, canary_text)) = canary {
                if let Some(term) = canary_text.split_whitespace().next() {
                    let found: i64 = conn.query_row(
                        "SELECT COUNT(*) FROM fts_chunks_fts f
                         JOIN fts_chunks fc ON fc.rowid = f.rowid
                         WHERE f.fts_chunks_fts MATCH ?1 AND fc.tree_hash = ?2 AND fc.chunk_id = ?3",
                        params![term, tree_hash, canary_chunk_id],
                        |r| r.get(0),
                    )?;
                    if found == 0 {
                        return Err(EngineError::fts_incomplete(format!(
                            "canary term {term:?} from chunk {canary_chunk_id} did not retrieve via fts_chunks_fts"
                        )));
                    }
                }
            }

            // Deep audit: fts5's own integrity-check walks the external-
            // content shadow tables for ghost or missing rowid pairs.
            conn.execute("INSERT INTO fts_chunks_fts(fts_chunks_fts) VALUES ('integrity-check')", [])
                .map_err(|e| EngineError::fts_incomplete(format!("fts5 integrity-check failed: {e}")))?;

            let bundle_hash = crate::codec::sha256_hex_of(&bundle_items);
            Ok(FtsValidationReport {
                tree_hash: tree_hash.to_string(),
                chunk_count: actual_ids.len(),
                bundle_hash,
            })
        })
    }
}

/// Collapse a trigger's stored SQL body to single-spaced tokens so
/// whitespace differences between the DDL as written and as round-
/// tripped through `sqlite_master` don't register as drift.
fn normalize_sql(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

trait OptionalEngine<T> {
    fn optional_engine(self) -> Result<Option<T>>;
}

impl<T> OptionalEngine<T> for std::result::Result<T, rusqlite::Error> {
    fn optional_engine(self) -> Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::Dag;
    use crate::domain::{Chunk, Document};

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

    fn built_tree(store: &Store) -> String {
        seed(store, "A", "A#0", "hello world");
        let dag = Dag::new(store);
        let built = dag.create_tree_from_current_state("repo").unwrap();
        dag.save_tree(&built.tree_hash, &built.repo_id, &built.entries).unwrap();
        built.tree_hash
    }

    #[test]
    fn build_rejects_tree_without_tree_chunks() {
        let store = Store::open_in_memory().unwrap();
        let fts = Fts::new(&store);
        let result = fts.build_fts_tree(&"0".repeat(64), false);
        assert!(result.is_err());
    }

    #[test]
    fn build_then_validate_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let tree_hash = built_tree(&store);
        let fts = Fts::new(&store);

        let report = fts.build_fts_tree(&tree_hash, false).unwrap();
        assert_eq!(report.chunk_count, 1);

        let validation = fts.validate_fts(&tree_hash).unwrap();
        assert_eq!(validation.chunk_count, 1);
        assert!(!validation.bundle_hash.is_empty());

        store
            .read(|conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM fts_chunks_fts WHERE fts_chunks_fts MATCH 'hello'",
                    [],
                    |r| r.get(0),
                )?;
                assert_eq!(count, 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn build_twice_is_idempotent_skip() {
        let store = Store::open_in_memory().unwrap();
        let tree_hash = built_tree(&store);
        let fts = Fts::new(&store);
        let first = fts.build_fts_tree(&tree_hash, false).unwrap();
        assert!(!first.skipped);
        let second = fts.build_fts_tree(&tree_hash, false).unwrap();
        assert!(second.skipped);
    }

    #[test]
    fn drift_after_tree_chunks_mutation_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let tree_hash = built_tree(&store);
        let fts = Fts::new(&store);
        fts.build_fts_tree(&tree_hash, false).unwrap();

        // tree_chunks is meant to be immutable; simulate corruption so the
        // recomputed payload hash no longer matches the recorded artifact.
        store
            .transaction(|tx| {
                tx.execute(
                    "UPDATE tree_chunks SET content_hash = 'deadbeef' WHERE tree_hash = ?1",
                    params![tree_hash],
                )?;
                Ok(())
            })
            .unwrap();

        let result = fts.build_fts_tree(&tree_hash, false);
        assert!(result.is_err());
    }

    #[test]
    fn force_rebuild_clears_dirty_fts_chunks_without_an_artifact() {
        let store = Store::open_in_memory().unwrap();
        let tree_hash = built_tree(&store);
        let fts = Fts::new(&store);

        // Rows present in fts_chunks with no recorded artifact: someone
        // wrote outside this path.
        store
            .transaction(|tx| {
                tx.execute("UPDATE fts_maintenance SET enabled = 1 WHERE id = 1", [])?;
                tx.execute(
                    "INSERT INTO fts_chunks (rowid, tree_hash, chunk_id, text, content_hash) VALUES (1, ?1, 'A#0', 'stale', 'stale-hash')",
                    params![tree_hash],
                )?;
                tx.execute("UPDATE fts_maintenance SET enabled = 0 WHERE id = 1", [])?;
                Ok(())
            })
            .unwrap();

        assert!(fts.build_fts_tree(&tree_hash, false).is_err());
        let rebuilt = fts.build_fts_tree(&tree_hash, true).unwrap();
        assert!(!rebuilt.skipped);
        assert_eq!(rebuilt.chunk_count, 1);
    }

    #[test]
    fn gate_is_closed_after_build() {
        let store = Store::open_in_memory().unwrap();
        let tree_hash = built_tree(&store);
        let fts = Fts::new(&store);
        fts.build_fts_tree(&tree_hash, false).unwrap();
        store
            .read(|conn| {
                let enabled: i64 =
                    conn.query_row("SELECT enabled FROM fts_maintenance WHERE id = 1", [], |r| r.get(0))?;
                assert_eq!(enabled, 0);
                Ok(())
            })
            .unwrap();
    }
}
