//! Schema DDL. Applied idempotently (`CREATE TABLE IF NOT EXISTS`) on
//! every `Store::open`.

pub const SCHEMA_VERSION: i64 = 1;

pub const CREATE_META: &str = "
CREATE TABLE IF NOT EXISTS meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL
);";

pub const CREATE_REPOSITORIES: &str = "
CREATE TABLE IF NOT EXISTS repositories (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL
);";

pub const CREATE_BLOBS: &str = "
CREATE TABLE IF NOT EXISTS blobs (
    content_hash TEXT PRIMARY KEY,
    data BLOB NOT NULL
);";

pub const CREATE_DOCUMENTS: &str = "
CREATE TABLE IF NOT EXISTS documents (
    doc_id TEXT PRIMARY KEY,
    repo_id TEXT NOT NULL,
    title TEXT NOT NULL,
    content_hash TEXT NOT NULL REFERENCES blobs(content_hash),
    updated_at TEXT NOT NULL
);";

pub const CREATE_CHUNKS: &str = "
CREATE TABLE IF NOT EXISTS chunks (
    chunk_id TEXT PRIMARY KEY,
    doc_id TEXT NOT NULL REFERENCES documents(doc_id) ON DELETE CASCADE,
    span_start INTEGER NOT NULL,
    span_end INTEGER NOT NULL,
    text TEXT NOT NULL,
    content_hash TEXT NOT NULL
);";

pub const CREATE_CHUNKS_FTS: &str = "
CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
    chunk_id UNINDEXED,
    text,
    content='chunks',
    content_rowid='rowid'
);";

pub const CREATE_CHUNKS_FTS_TRIGGERS: &[&str] = &[
    "CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunks BEGIN
        INSERT INTO chunks_fts(rowid, chunk_id, text) VALUES (new.rowid, new.chunk_id, new.text);
    END;",
    "CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON chunks BEGIN
        INSERT INTO chunks_fts(chunks_fts, rowid, chunk_id, text) VALUES ('delete', old.rowid, old.chunk_id, old.text);
    END;",
];

pub const CREATE_DEPENDENCIES: &str = "
CREATE TABLE IF NOT EXISTS dependencies (
    from_chunk_id TEXT NOT NULL,
    to_chunk_id TEXT NOT NULL,
    dep_type TEXT NOT NULL,
    PRIMARY KEY (from_chunk_id, to_chunk_id, dep_type)
);";

pub const CREATE_TREES: &str = "
CREATE TABLE IF NOT EXISTS trees (
    tree_hash TEXT PRIMARY KEY,
    entries_json TEXT NOT NULL
);";

pub const CREATE_TREE_DOCS: &str = "
CREATE TABLE IF NOT EXISTS tree_docs (
    tree_hash TEXT NOT NULL REFERENCES trees(tree_hash),
    doc_id TEXT NOT NULL,
    repo_id TEXT NOT NULL,
    doc_content_hash TEXT NOT NULL REFERENCES blobs(content_hash),
    title TEXT NOT NULL,
    PRIMARY KEY (tree_hash, doc_id)
);";

pub const CREATE_TREE_CHUNKS: &str = "
CREATE TABLE IF NOT EXISTS tree_chunks (
    tree_hash TEXT NOT NULL REFERENCES trees(tree_hash),
    chunk_id TEXT NOT NULL,
    doc_id TEXT NOT NULL,
    span_start INTEGER NOT NULL,
    span_end INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    chunker_id TEXT NOT NULL DEFAULT 'default',
    PRIMARY KEY (tree_hash, chunk_id)
);";

pub const CREATE_COMMITS: &str = "
CREATE TABLE IF NOT EXISTS commits (
    commit_hash TEXT PRIMARY KEY,
    tree_hash TEXT NOT NULL REFERENCES trees(tree_hash),
    parents_json TEXT NOT NULL,
    message TEXT NOT NULL,
    created_at TEXT NOT NULL
);";

pub const CREATE_REFS: &str = "
CREATE TABLE IF NOT EXISTS refs (
    ref_name TEXT PRIMARY KEY,
    commit_hash TEXT NOT NULL REFERENCES commits(commit_hash)
);";

pub const CREATE_FTS_MAINTENANCE: &str = "
CREATE TABLE IF NOT EXISTS fts_maintenance (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    enabled INTEGER NOT NULL
);";

pub const CREATE_FTS_MAINTENANCE_NO_DELETE_TRIGGER: &str = "
CREATE TRIGGER IF NOT EXISTS fts_maintenance_no_delete BEFORE DELETE ON fts_maintenance
BEGIN
    SELECT RAISE(ABORT, 'fts_maintenance is immutable');
END;";

pub const SEED_FTS_MAINTENANCE: &str =
    "INSERT OR IGNORE INTO fts_maintenance (id, enabled) VALUES (1, 0);";

pub const CREATE_FTS_CHUNKS: &str = "
CREATE TABLE IF NOT EXISTS fts_chunks (
    rowid INTEGER PRIMARY KEY,
    tree_hash TEXT NOT NULL,
    chunk_id TEXT NOT NULL,
    text TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    UNIQUE (tree_hash, chunk_id)
);";

pub const CREATE_FTS_CHUNKS_FTS: &str = "
CREATE VIRTUAL TABLE IF NOT EXISTS fts_chunks_fts USING fts5(
    text,
    content='fts_chunks',
    content_rowid='rowid',
    tokenize='unicode61'
);";

/// Gate guard triggers: reject INSERT/DELETE on `fts_chunks` while the
/// singleton's `enabled` flag is 0; reject UPDATE unconditionally (the
/// table is append/delete-only, never mutated in place).
pub const CREATE_FTS_CHUNKS_GATE_TRIGGERS: &[&str] = &[
    "CREATE TRIGGER IF NOT EXISTS fts_chunks_gate_insert BEFORE INSERT ON fts_chunks
     WHEN (SELECT enabled FROM fts_maintenance WHERE id = 1) = 0
     BEGIN
         SELECT RAISE(ABORT, 'fts gate is closed');
     END;",
    "CREATE TRIGGER IF NOT EXISTS fts_chunks_gate_delete BEFORE DELETE ON fts_chunks
     WHEN (SELECT enabled FROM fts_maintenance WHERE id = 1) = 0
     BEGIN
         SELECT RAISE(ABORT, 'fts gate is closed');
     END;",
    "CREATE TRIGGER IF NOT EXISTS fts_chunks_no_update BEFORE UPDATE ON fts_chunks
     BEGIN
         SELECT RAISE(ABORT, 'fts_chunks rows are immutable');
     END;",
    "CREATE TRIGGER IF NOT EXISTS fts_chunks_mirror_insert AFTER INSERT ON fts_chunks
     BEGIN
         INSERT INTO fts_chunks_fts(rowid, text) VALUES (new.rowid, new.text);
     END;",
    "CREATE TRIGGER IF NOT EXISTS fts_chunks_mirror_delete AFTER DELETE ON fts_chunks
     BEGIN
         INSERT INTO fts_chunks_fts(fts_chunks_fts, rowid, text) VALUES ('delete', old.rowid, old.text);
     END;",
];

/// Name-to-DDL pairs for the six gate triggers, so `validate_fts` can
/// schema-normalize each trigger's stored `sqlite_master.sql` and compare
/// it against the exact body this crate creates it with, rather than
/// trusting presence-by-name alone. Kept textually in sync with
/// `CREATE_FTS_CHUNKS_GATE_TRIGGERS` and
/// `CREATE_FTS_MAINTENANCE_NO_DELETE_TRIGGER` above.
pub const EXPECTED_GATE_TRIGGER_DDL: &[(&str, &str)] = &[
    (
        "fts_chunks_gate_insert",
        "CREATE TRIGGER IF NOT EXISTS fts_chunks_gate_insert BEFORE INSERT ON fts_chunks
     WHEN (SELECT enabled FROM fts_maintenance WHERE id = 1) = 0
     BEGIN
         SELECT RAISE(ABORT, 'fts gate is closed');
     END;",
    ),
    (
        "fts_chunks_gate_delete",
        "CREATE TRIGGER IF NOT EXISTS fts_chunks_gate_delete BEFORE DELETE ON fts_chunks
     WHEN (SELECT enabled FROM fts_maintenance WHERE id = 1) = 0
     BEGIN
         SELECT RAISE(ABORT, 'fts gate is closed');
     END;",
    ),
    (
        "fts_chunks_no_update",
        "CREATE TRIGGER IF NOT EXISTS fts_chunks_no_update BEFORE UPDATE ON fts_chunks
     BEGIN
         SELECT RAISE(ABORT, 'fts_chunks rows are immutable');
     END;",
    ),
    (
        "fts_chunks_mirror_insert",
        "CREATE TRIGGER IF NOT EXISTS fts_chunks_mirror_insert AFTER INSERT ON fts_chunks
     BEGIN
         INSERT INTO fts_chunks_fts(rowid, text) VALUES (new.rowid, new.text);
     END;",
    ),
    (
        "fts_chunks_mirror_delete",
        "CREATE TRIGGER IF NOT EXISTS fts_chunks_mirror_delete AFTER DELETE ON fts_chunks
     BEGIN
         INSERT INTO fts_chunks_fts(fts_chunks_fts, rowid, text) VALUES ('delete', old.rowid, old.text);
     END;",
    ),
    (
        "fts_maintenance_no_delete",
        "CREATE TRIGGER IF NOT EXISTS fts_maintenance_no_delete BEFORE DELETE ON fts_maintenance
BEGIN
    SELECT RAISE(ABORT, 'fts_maintenance is immutable');
END;",
    ),
];

pub const CREATE_INDEX_ARTIFACTS: &str = "
CREATE TABLE IF NOT EXISTS index_artifacts (
    artifact_id TEXT PRIMARY KEY,
    tree_hash TEXT NOT NULL,
    kind TEXT NOT NULL,
    model_id TEXT NOT NULL DEFAULT '',
    manifest_json TEXT NOT NULL,
    payload_hash TEXT NOT NULL,
    chunk_count INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (tree_hash, kind, model_id)
);";

pub const CREATE_ARTIFACT_REFS: &str = "
CREATE TABLE IF NOT EXISTS artifact_refs (
    ref_type TEXT NOT NULL CHECK (ref_type IN ('ref', 'commit', 'tree')),
    ref_name TEXT NOT NULL,
    kind TEXT NOT NULL,
    artifact_id TEXT NOT NULL REFERENCES index_artifacts(artifact_id) ON DELETE CASCADE,
    PRIMARY KEY (ref_type, ref_name, kind, artifact_id),
    CHECK (
        (ref_type = 'ref' AND ref_name IN ('HEAD', 'main'))
        OR (ref_type != 'ref' AND length(ref_name) = 64)
    )
);";

pub const CREATE_CHUNK_EMBEDDINGS: &str = "
CREATE TABLE IF NOT EXISTS chunk_embeddings (
    tree_hash TEXT NOT NULL,
    chunk_id TEXT NOT NULL,
    model_id TEXT NOT NULL,
    blob BLOB NOT NULL,
    dims INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    PRIMARY KEY (tree_hash, chunk_id, model_id)
);";

pub const CREATE_TASKS: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    task_id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    action TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    next_run_at TEXT NOT NULL,
    idempotency_key TEXT UNIQUE,
    status TEXT NOT NULL CHECK (status IN ('pending','running','completed','canceled','failed')),
    created_at TEXT NOT NULL
);";

pub const CREATE_TASK_RUNS: &str = "
CREATE TABLE IF NOT EXISTS task_runs (
    run_id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL REFERENCES tasks(task_id),
    status TEXT NOT NULL CHECK (status IN ('started','succeeded','failed')),
    result_hash TEXT,
    started_at TEXT NOT NULL,
    finished_at TEXT
);";

pub const CREATE_AUDIT_LOG: &str = "
CREATE TABLE IF NOT EXISTS audit_log (
    request_id TEXT PRIMARY KEY,
    tool_name TEXT NOT NULL,
    envelope_json TEXT NOT NULL,
    created_at TEXT NOT NULL
);";

/// All non-trigger DDL, applied in FK-safe order.
pub const CREATE_TABLES: &[&str] = &[
    CREATE_META,
    CREATE_REPOSITORIES,
    CREATE_BLOBS,
    CREATE_DOCUMENTS,
    CREATE_CHUNKS,
    CREATE_CHUNKS_FTS,
    CREATE_DEPENDENCIES,
    CREATE_TREES,
    CREATE_TREE_DOCS,
    CREATE_TREE_CHUNKS,
    CREATE_COMMITS,
    CREATE_REFS,
    CREATE_FTS_MAINTENANCE,
    CREATE_FTS_CHUNKS,
    CREATE_FTS_CHUNKS_FTS,
    CREATE_INDEX_ARTIFACTS,
    CREATE_ARTIFACT_REFS,
    CREATE_CHUNK_EMBEDDINGS,
    CREATE_TASKS,
    CREATE_TASK_RUNS,
    CREATE_AUDIT_LOG,
];
