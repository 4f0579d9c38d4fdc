//! Error types for the preprocessing pipeline.

use std::path::PathBuf;

use thiserror::Error;

use crate::ASSISTANT_MARKER;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised during corpus loading, tokenization and batch iteration.
///
/// Every variant is fatal to the operation that raised it. This is
/// offline batch preprocessing: callers fix their inputs or configuration
/// rather than recover in place, so there are no retry or skip semantics.
#[derive(Debug, Error)]
pub enum Error {
    /// A canonical thread was missing or misusing one of its required fields.
    #[error("thread for prompt {prompt:?} violates the canonical schema: {reason}")]
    SchemaViolation { prompt: String, reason: String },

    #[error("unknown dataset '{0}'")]
    UnknownCorpus(String),

    #[error("unknown truncation mode: {0}")]
    UnknownTruncationMode(String),

    /// A batch field name did not end in a recognized padding suffix.
    #[error("unexpected key in batch '{0}'")]
    UnexpectedField(String),

    /// Raw text already contained the end-of-sequence token before
    /// tokenization appended one.
    #[error("{field} contains EOS token: {text}")]
    EosInText { field: &'static str, text: String },

    #[error("must specify either n_epochs or n_examples or completed_examples")]
    MissingStoppingCriterion,

    /// A paired transcript did not contain the assistant turn marker.
    #[error("transcript does not contain '{marker}': {0}", marker = ASSISTANT_MARKER)]
    MissingAssistantMarker(String),

    #[error("malformed row at line {line} in {path:?}: {source}")]
    MalformedRow {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },

    #[error("no JSONL shards found under {0:?}")]
    NoShards(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
