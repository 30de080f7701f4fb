//! Error taxonomy for the document index engine.
//!
//! Every fallible operation returns a [`EngineError`] carrying one of the
//! stable [`ErrorCode`] values from the external interface contract. Codes
//! are part of the wire contract: tool callers match on `code.as_str()`,
//! not on the `Display` message.

use std::fmt;
use thiserror::Error;

/// Stable error codes, exposed verbatim to tool callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    RefMismatch,
    RefNotFound,
    CommitNotFound,
    TreeNotFound,
    TreeHashMissing,
    TreeDocsMissing,
    TreeChunksMissing,
    TreePayloadMissing,
    BlobMissing,
    DataCorruption,
    NotFrozen,
    DirtyState,
    ArtifactDrift,
    GateMissing,
    RowidCollision,
    FtsIncomplete,
    FtsExtraRows,
    BuildFailed,
    WorkingTreeDirty,
    EmbeddingDims,
    EmbeddingsNotFound,
    InvalidSchedule,
    Determinism,
    IdempotencyRequired,
    ToolFailure,
    // Ambient: not part of the tool-facing taxonomy but needed for the
    // store/codec layers underneath it.
    Database,
    Serialization,
    Config,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::RefMismatch => "ERR_REF_MISMATCH",
            ErrorCode::RefNotFound => "ERR_REF_NOT_FOUND",
            ErrorCode::CommitNotFound => "ERR_COMMIT_NOT_FOUND",
            ErrorCode::TreeNotFound => "ERR_TREE_NOT_FOUND",
            ErrorCode::TreeHashMissing => "ERR_TREE_HASH_MISSING",
            ErrorCode::TreeDocsMissing => "ERR_TREE_DOCS_MISSING",
            ErrorCode::TreeChunksMissing => "ERR_TREE_CHUNKS_MISSING",
            ErrorCode::TreePayloadMissing => "ERR_TREE_PAYLOAD_MISSING",
            ErrorCode::BlobMissing => "ERR_BLOB_MISSING",
            ErrorCode::DataCorruption => "ERR_DATA_CORRUPTION",
            ErrorCode::NotFrozen => "ERR_NOT_FROZEN",
            ErrorCode::DirtyState => "ERR_DIRTY_STATE",
            ErrorCode::ArtifactDrift => "ERR_ARTIFACT_DRIFT",
            ErrorCode::GateMissing => "ERR_GATE_MISSING",
            ErrorCode::RowidCollision => "ERR_ROWID_COLLISION",
            ErrorCode::FtsIncomplete => "ERR_FTS_INCOMPLETE",
            ErrorCode::FtsExtraRows => "ERR_FTS_EXTRA_ROWS",
            ErrorCode::BuildFailed => "ERR_BUILD_FAILED",
            ErrorCode::WorkingTreeDirty => "ERR_WORKING_TREE_DIRTY",
            ErrorCode::EmbeddingDims => "ERR_EMBEDDING_DIMS",
            ErrorCode::EmbeddingsNotFound => "ERR_EMBEDDINGS_NOT_FOUND",
            ErrorCode::InvalidSchedule => "ERR_INVALID_SCHEDULE",
            ErrorCode::Determinism => "ERR_DETERMINISM",
            ErrorCode::IdempotencyRequired => "ERR_IDEMPOTENCY_REQUIRED",
            ErrorCode::ToolFailure => "ERR_TOOL_FAILURE",
            ErrorCode::Database => "ERR_DATABASE",
            ErrorCode::Serialization => "ERR_SERIALIZATION",
            ErrorCode::Config => "ERR_CONFIG",
        }
    }

    /// Whether a retry (by the out-of-scope executor) could plausibly
    /// succeed. Data-integrity and validation errors never are.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::ToolFailure | ErrorCode::Database)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Engine error type.
#[derive(Debug, Error)]
#[error("[{code}] {message}")]
pub struct EngineError {
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub code: ErrorCode,
    pub message: String,
}

impl EngineError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

macro_rules! ctor {
    ($name:ident, $code:ident) => {
        pub fn $name(message: impl Into<String>) -> Self {
            Self::new(ErrorCode::$code, message)
        }
    };
}

impl EngineError {
    ctor!(ref_mismatch, RefMismatch);
    ctor!(ref_not_found, RefNotFound);
    ctor!(commit_not_found, CommitNotFound);
    ctor!(tree_not_found, TreeNotFound);
    ctor!(tree_hash_missing, TreeHashMissing);
    ctor!(tree_docs_missing, TreeDocsMissing);
    ctor!(tree_chunks_missing, TreeChunksMissing);
    ctor!(tree_payload_missing, TreePayloadMissing);
    ctor!(blob_missing, BlobMissing);
    ctor!(data_corruption, DataCorruption);
    ctor!(not_frozen, NotFrozen);
    ctor!(dirty_state, DirtyState);
    ctor!(artifact_drift, ArtifactDrift);
    ctor!(gate_missing, GateMissing);
    ctor!(rowid_collision, RowidCollision);
    ctor!(fts_incomplete, FtsIncomplete);
    ctor!(fts_extra_rows, FtsExtraRows);
    ctor!(build_failed, BuildFailed);
    ctor!(working_tree_dirty, WorkingTreeDirty);
    ctor!(embedding_dims, EmbeddingDims);
    ctor!(embeddings_not_found, EmbeddingsNotFound);
    ctor!(invalid_schedule, InvalidSchedule);
    ctor!(determinism, Determinism);
    ctor!(idempotency_required, IdempotencyRequired);
    ctor!(tool_failure, ToolFailure);
    ctor!(database, Database);
    ctor!(serialization, Serialization);
    ctor!(config, Config);
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::database(format!("sqlite error: {err}")).with_source(err)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::serialization(format!("json error: {err}")).with_source(err)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_has_code_and_message() {
        let err = EngineError::ref_not_found("HEAD");
        let msg = format!("{err}");
        assert!(msg.contains("ERR_REF_NOT_FOUND"));
        assert!(msg.contains("HEAD"));
    }

    #[test]
    fn retryable_classification() {
        assert!(ErrorCode::ToolFailure.is_retryable());
        assert!(!ErrorCode::DataCorruption.is_retryable());
        assert!(!ErrorCode::ArtifactDrift.is_retryable());
    }

    #[test]
    fn from_rusqlite_error() {
        let e: EngineError = rusqlite::Error::QueryReturnedNoRows.into();
        assert_eq!(e.code, ErrorCode::Database);
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let e: EngineError = json_err.into();
        assert_eq!(e.code, ErrorCode::Serialization);
    }
}
