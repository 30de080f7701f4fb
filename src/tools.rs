//! The audited tool surface an agent actually calls. Every function here
//! validates its input, delegates to the layer that owns the behavior
//! (each of which is already one atomic `Store` transaction), and always
//! returns an [`AuditEnvelope`] — success or failure alike — after a
//! best-effort audit append. A tool call never "throws" past this layer:
//! callers inspect `envelope.errors` instead of matching on `Result`.

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audit::AuditEnvelope;
use crate::dag::Dag;
use crate::domain::DiffResult;
use crate::embeddings::EmbeddingProvider;
use crate::error::{EngineError, Result};
use crate::fts::{Fts, FtsBuildReport, FtsValidationReport};
use crate::gc::GcReport;
use crate::retriever::{RetrievedChunk, Retriever};
use crate::scheduler::{Scheduler, TaskRecord};
use crate::store::Store;

/// Build the envelope for a tool call's outcome and append it
/// best-effort before handing it back to the caller.
fn envelope_for<I: Serialize, O: Serialize>(
    store: &Store,
    tool_name: &str,
    input: &I,
    outcome: Result<O>,
    warnings: Vec<String>,
    provenance: Vec<String>,
) -> AuditEnvelope {
    let envelope = match &outcome {
        Ok(output) => AuditEnvelope::success(tool_name, input, output, warnings, provenance),
        Err(err) => AuditEnvelope::failure(tool_name, input, err),
    };
    envelope.append_to(store);
    envelope
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommitIndexInput {
    pub repo_id: String,
    pub parents: Vec<String>,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommitIndexOutput {
    pub commit_hash: String,
    pub tree_hash: String,
}

pub fn commit_index(store: &Store, input: CommitIndexInput) -> AuditEnvelope {
    let outcome: Result<CommitIndexOutput> = (|| {
        let dag = Dag::new(store);
        let built = dag.create_tree_from_current_state(&input.repo_id)?;
        dag.save_tree(&built.tree_hash, &built.repo_id, &built.entries)?;
        let commit = dag.create_commit(&built.tree_hash, &input.parents, &input.message)?;
        Ok(CommitIndexOutput {
            commit_hash: commit.commit_hash,
            tree_hash: commit.tree_hash,
        })
    })();
    envelope_for(store, "commit_index", &input, outcome, vec![], vec![])
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckoutIndexInput {
    pub target: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckoutIndexOutput {
    pub tree_hash: String,
}

pub fn checkout_index(store: &Store, input: CheckoutIndexInput) -> AuditEnvelope {
    let outcome: Result<CheckoutIndexOutput> = (|| {
        let dag = Dag::new(store);
        let commit_hash = dag
            .resolve_target(&input.target)?
            .ok_or_else(|| EngineError::ref_not_found(&input.target))?;
        let commit = dag.get_commit(&commit_hash)?;
        dag.materialize_tree(&commit.tree_hash)?;
        Ok(CheckoutIndexOutput {
            tree_hash: commit.tree_hash,
        })
    })();
    envelope_for(store, "checkout_index", &input, outcome, vec![], vec![])
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DiffIndexInput {
    pub from: String,
    pub to: String,
}

pub fn diff_index(store: &Store, input: DiffIndexInput) -> AuditEnvelope {
    let outcome: Result<DiffResult> = (|| {
        let dag = Dag::new(store);
        let from_commit = dag
            .resolve_target(&input.from)?
            .ok_or_else(|| EngineError::ref_not_found(&input.from))?;
        let to_commit = dag
            .resolve_target(&input.to)?
            .ok_or_else(|| EngineError::ref_not_found(&input.to))?;
        let from_tree = dag.get_commit(&from_commit)?.tree_hash;
        let to_tree = dag.get_commit(&to_commit)?.tree_hash;
        dag.diff_index(&from_tree, &to_tree)
    })();
    envelope_for(store, "diff_index", &input, outcome, vec![], vec![])
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResolveRefInput {
    pub target: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResolveRefOutput {
    pub commit_hash: String,
}

pub fn resolve_ref(store: &Store, input: ResolveRefInput) -> AuditEnvelope {
    let outcome: Result<ResolveRefOutput> = (|| {
        let dag = Dag::new(store);
        let commit_hash = dag
            .resolve_target(&input.target)?
            .ok_or_else(|| EngineError::ref_not_found(&input.target))?;
        Ok(ResolveRefOutput { commit_hash })
    })();
    envelope_for(store, "resolve_ref", &input, outcome, vec![], vec![])
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateRefInput {
    pub name: String,
    pub commit_hash: String,
}

pub fn update_ref(store: &Store, input: UpdateRefInput) -> AuditEnvelope {
    let outcome: Result<()> = (|| {
        let dag = Dag::new(store);
        dag.update_ref(&input.name, &input.commit_hash)
    })();
    envelope_for(store, "update_ref", &input, outcome, vec![], vec![])
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BuildFtsTreeInput {
    pub target: String,
    #[serde(default)]
    pub force_rebuild: bool,
}

/// Resolve `target` → commit → tree, build (or skip/rebuild) the FTS
/// bundle for that tree, then register `artifact_refs` for the commit
/// and, when `target` names `HEAD`/`main`, the ref itself — on top of
/// the `("tree", tree_hash)` registration `Fts::build_fts_tree` already
/// performs.
pub fn build_fts_tree(store: &Store, input: BuildFtsTreeInput) -> AuditEnvelope {
    let outcome: Result<FtsBuildReport> = (|| {
        let dag = Dag::new(store);
        let commit_hash = dag
            .resolve_target(&input.target)?
            .ok_or_else(|| EngineError::ref_not_found(&input.target))?;
        let commit = dag.get_commit(&commit_hash)?;
        let fts = Fts::new(store);
        let report = fts.build_fts_tree(&commit.tree_hash, input.force_rebuild)?;

        store.transaction(|tx| {
            let artifact_id: Option<String> = tx
                .query_row(
                    "SELECT artifact_id FROM index_artifacts WHERE tree_hash = ?1 AND kind = 'fts'",
                    params![commit.tree_hash],
                    |r| r.get(0),
                )
                .optional()?;
            if let Some(artifact_id) = artifact_id {
                tx.execute(
                    "INSERT OR IGNORE INTO artifact_refs (ref_type, ref_name, kind, artifact_id) VALUES ('commit', ?1, 'fts', ?2)",
                    params![commit_hash, artifact_id],
                )?;
                if input.target == "HEAD" || input.target == "main" {
                    tx.execute(
                        "INSERT OR IGNORE INTO artifact_refs (ref_type, ref_name, kind, artifact_id) VALUES ('ref', ?1, 'fts', ?2)",
                        params![input.target, artifact_id],
                    )?;
                }
            }
            Ok(())
        })?;

        Ok(report)
    })();
    envelope_for(store, "build_fts_tree", &input, outcome, vec![], vec![])
}

impl Serialize for FtsBuildReport {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut st = s.serialize_struct("FtsBuildReport", 3)?;
        st.serialize_field("tree_hash", &self.tree_hash)?;
        st.serialize_field("chunk_count", &self.chunk_count)?;
        st.serialize_field("skipped", &self.skipped)?;
        st.end()
    }
}

impl Serialize for FtsValidationReport {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut st = s.serialize_struct("FtsValidationReport", 3)?;
        st.serialize_field("tree_hash", &self.tree_hash)?;
        st.serialize_field("chunk_count", &self.chunk_count)?;
        st.serialize_field("bundle_hash", &self.bundle_hash)?;
        st.end()
    }
}

impl Serialize for GcReport {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut st = s.serialize_struct("GcReport", 7)?;
        st.serialize_field("reachable_refs", &self.reachable_refs)?;
        st.serialize_field("reachable_commits", &self.reachable_commits)?;
        st.serialize_field("reachable_trees", &self.reachable_trees)?;
        st.serialize_field("unreachable_trees", &self.unreachable_trees)?;
        st.serialize_field("deleted_artifacts", &self.deleted_artifacts)?;
        st.serialize_field("deleted_embedding_trees", &self.deleted_embedding_trees)?;
        st.serialize_field("dry_run", &self.dry_run)?;
        st.end()
    }
}

impl Serialize for RetrievedChunk {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut st = s.serialize_struct("RetrievedChunk", 3)?;
        st.serialize_field("chunk_id", &self.chunk_id)?;
        st.serialize_field("doc_id", &self.doc_id)?;
        st.serialize_field("score", &self.score)?;
        st.end()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValidateFtsInput {
    pub tree_hash: String,
}

pub fn validate_fts(store: &Store, input: ValidateFtsInput) -> AuditEnvelope {
    let outcome: Result<FtsValidationReport> = (|| {
        let fts = Fts::new(store);
        fts.validate_fts(&input.tree_hash)
    })();
    envelope_for(store, "validate_fts", &input, outcome, vec![], vec![])
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BuildEmbeddingsInput {
    pub tree_hash: String,
    pub model_id: String,
    #[serde(default)]
    pub batch_size: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BuildEmbeddingsOutput {
    pub tree_hash: String,
    pub model_id: String,
    pub chunk_count: usize,
    pub skipped: bool,
}

pub async fn build_embeddings(store: &Store, provider: &dyn EmbeddingProvider, input: BuildEmbeddingsInput) -> AuditEnvelope {
    let outcome: Result<BuildEmbeddingsOutput> = async {
        if provider.model_id() != input.model_id {
            return Err(EngineError::embeddings_not_found(format!(
                "requested model {} but registry resolved {}",
                input.model_id,
                provider.model_id()
            )));
        }
        let dag = Dag::new(store);
        let embeddings = crate::embeddings::Embeddings::new(store);
        let report = embeddings
            .build_embeddings(&dag, &input.tree_hash, provider, input.batch_size)
            .await?;
        Ok(BuildEmbeddingsOutput {
            tree_hash: report.tree_hash,
            model_id: report.model_id,
            chunk_count: report.chunk_count,
            skipped: report.skipped,
        })
    }
    .await;
    envelope_for(store, "build_embeddings", &input, outcome, vec![], vec![])
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RetrieveInput {
    pub repo_id: String,
    pub query: String,
    pub top_k: usize,
    #[serde(default)]
    pub index_version: Option<String>,
}

/// Working-tree BM25 search, with the same-named warnings the working
/// spec requires: `WARN_NO_COMMITS` when `HEAD` has never been set,
/// `WARN_WORKING_TREE_DIRTY` when the working tree has drifted from
/// `HEAD`'s tree, and `WARN_VERSION_MISMATCH` when the caller's requested
/// `index_version` disagrees with the effective one.
pub fn retrieve(store: &Store, input: RetrieveInput) -> AuditEnvelope {
    let mut warnings = Vec::new();
    let outcome: Result<Vec<RetrievedChunk>> = (|| {
        let dag = Dag::new(store);
        let working = dag.create_tree_from_current_state(&input.repo_id)?;
        let effective_version = match dag.resolve_target("HEAD")? {
            None => {
                warnings.push("WARN_NO_COMMITS".to_string());
                working.tree_hash.clone()
            }
            Some(head_commit) => {
                let head_tree = dag.get_commit(&head_commit)?.tree_hash;
                if head_tree != working.tree_hash {
                    warnings.push("WARN_WORKING_TREE_DIRTY".to_string());
                    working.tree_hash.clone()
                } else {
                    head_tree
                }
            }
        };
        if let Some(requested) = &input.index_version {
            if requested != &effective_version {
                warnings.push("WARN_VERSION_MISMATCH".to_string());
            }
        }
        let retriever = Retriever::new(store);
        retriever.retrieve(&input.query, input.top_k)
    })();
    envelope_for(store, "retrieve", &input, outcome, warnings, vec![])
}

fn default_bm25_k() -> usize {
    200
}

fn default_vector_k() -> usize {
    500
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RetrieveWithEmbeddingsInput {
    pub tree_hash: String,
    pub query: String,
    pub alpha: f64,
    pub top_k: usize,
    #[serde(default = "default_bm25_k")]
    pub bm25_k: usize,
    #[serde(default = "default_vector_k")]
    pub vector_k: usize,
}

pub async fn retrieve_with_embeddings(store: &Store, provider: &dyn EmbeddingProvider, input: RetrieveWithEmbeddingsInput) -> AuditEnvelope {
    let retriever = Retriever::new(store);
    let outcome = retriever
        .retrieve_with_embeddings(
            &input.tree_hash,
            &input.query,
            input.alpha,
            input.top_k,
            input.bm25_k,
            input.vector_k,
            provider,
        )
        .await;
    envelope_for(store, "retrieve_with_embeddings", &input, outcome, vec![], vec![])
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GcArtifactsInput {
    pub dry_run: bool,
    #[serde(default)]
    pub keep_refs: Option<Vec<String>>,
    #[serde(default)]
    pub kinds: Option<Vec<String>>,
}

pub fn gc_artifacts(store: &Store, input: GcArtifactsInput) -> AuditEnvelope {
    let outcome: Result<GcReport> = (|| {
        let gc = crate::gc::Gc::new(store);
        gc.gc_artifacts(input.dry_run, input.keep_refs.as_deref(), input.kinds.as_deref())
    })();
    envelope_for(store, "gc_artifacts", &input, outcome, vec![], vec![])
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScheduleTaskInput {
    pub dry_run: bool,
    pub title: String,
    pub action: String,
    pub payload: Value,
    #[serde(default)]
    pub run_at: Option<String>,
    #[serde(default)]
    pub reference_time: Option<String>,
    #[serde(default)]
    pub interval_seconds: Option<i64>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl Serialize for TaskRecord {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut st = s.serialize_struct("TaskRecord", 6)?;
        st.serialize_field("task_id", &self.task_id)?;
        st.serialize_field("title", &self.title)?;
        st.serialize_field("action", &self.action)?;
        st.serialize_field("payload", &self.payload)?;
        st.serialize_field("next_run_at", &self.next_run_at)?;
        st.serialize_field("status", &self.status)?;
        st.end()
    }
}

pub fn schedule_task(store: &Store, input: ScheduleTaskInput) -> AuditEnvelope {
    let outcome: Result<TaskRecord> = (|| {
        let scheduler = Scheduler::new(store);
        scheduler.schedule_task(
            input.dry_run,
            &input.title,
            &input.action,
            &input.payload,
            input.run_at.as_deref(),
            input.reference_time.as_deref(),
            input.interval_seconds,
            input.idempotency_key.as_deref(),
        )
    })();
    envelope_for(store, "schedule_task", &input, outcome, vec![], vec![])
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddDependencyInput {
    pub from_chunk_id: String,
    pub to_chunk_id: String,
    pub dep_type: String,
}

pub fn add_dependency(store: &Store, input: AddDependencyInput) -> AuditEnvelope {
    let outcome: Result<()> = (|| {
        let dag = Dag::new(store);
        dag.add_dependency(&crate::domain::Dependency {
            from_chunk_id: input.from_chunk_id.clone(),
            to_chunk_id: input.to_chunk_id.clone(),
            dep_type: input.dep_type.clone(),
        })
    })();
    envelope_for(store, "add_dependency", &input, outcome, vec![], vec![])
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemoveDependencyInput {
    pub from_chunk_id: String,
    pub to_chunk_id: String,
    pub dep_type: String,
}

pub fn remove_dependency(store: &Store, input: RemoveDependencyInput) -> AuditEnvelope {
    let outcome: Result<()> = (|| {
        let dag = Dag::new(store);
        dag.remove_dependency(&crate::domain::Dependency {
            from_chunk_id: input.from_chunk_id.clone(),
            to_chunk_id: input.to_chunk_id.clone(),
            dep_type: input.dep_type.clone(),
        })
    })();
    envelope_for(store, "remove_dependency", &input, outcome, vec![], vec![])
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListDependenciesInput {
    pub chunk_id: String,
}

pub fn list_dependencies(store: &Store, input: ListDependenciesInput) -> AuditEnvelope {
    let outcome: Result<Vec<crate::domain::Dependency>> = (|| {
        let dag = Dag::new(store);
        dag.list_dependencies(&input.chunk_id)
    })();
    envelope_for(store, "list_dependencies", &input, outcome, vec![], vec![])
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordTaskRunInput {
    pub task_id: String,
    pub status: String,
    #[serde(default)]
    pub result_hash: Option<String>,
    pub started_at: String,
    #[serde(default)]
    pub finished_at: Option<String>,
}

/// Report a task run's outcome back from an out-of-process executor.
/// Transitions the owning task to `completed`/`failed` when the run
/// itself is `succeeded`/`failed`; a `started` run leaves the task
/// `pending` (there is no `running` transition modeled here — the
/// executor that owns that state machine is out of scope).
pub fn record_task_run(store: &Store, input: RecordTaskRunInput) -> AuditEnvelope {
    let outcome: Result<crate::scheduler::TaskRunRecord> = (|| {
        let scheduler = Scheduler::new(store);
        scheduler.record_task_run(
            &input.task_id,
            &input.status,
            input.result_hash.as_deref(),
            &input.started_at,
            input.finished_at.as_deref(),
        )
    })();
    envelope_for(store, "record_task_run", &input, outcome, vec![], vec![])
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListPendingTasksInput {}

pub fn list_pending_tasks(store: &Store, input: ListPendingTasksInput) -> AuditEnvelope {
    let outcome: Result<Vec<TaskRecord>> = (|| {
        let scheduler = Scheduler::new(store);
        scheduler.list_pending_tasks()
    })();
    envelope_for(store, "list_pending_tasks", &input, outcome, vec![], vec![])
}
