//! Core preprocessing logic for pairwise-preference fine-tuning data.
//!
//! This crate turns heterogeneous preference corpora (scored Q&A answers,
//! paired chat transcripts, ranked conversation trees) into one canonical
//! schema of (prompt, candidate responses, preference pairs, SFT target),
//! then tokenizes, truncates, label-masks and batches the result into a
//! deterministic, resumable stream for a training loop.

/// Trait for tokenization operations.
///
/// Implementors map text to token ids without inserting any special
/// tokens; the pipeline appends the end-of-sequence id itself. For real
/// runs, wrap a pretrained tokenizer (see the CLI crate). Tests use a
/// character-based stand-in.
pub trait Tokenizer {
    /// Tokenize `text` into ids and attention values, adding no special tokens.
    fn encode(&self, text: &str) -> Encoding;

    /// Id used to fill padded positions of `*_input_ids` batch fields.
    fn pad_token_id(&self) -> i64;

    /// End-of-sequence id appended to every response before truncation.
    fn eos_token_id(&self) -> i64;
}

/// Token ids and per-token attention values for one piece of text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Encoding {
    pub input_ids: Vec<i64>,
    pub attention_mask: Vec<i64>,
}

// Blanket implementation for references to Tokenizers
impl<T: Tokenizer + ?Sized> Tokenizer for &T {
    fn encode(&self, text: &str) -> Encoding {
        (*self).encode(text)
    }

    fn pad_token_id(&self) -> i64 {
        (*self).pad_token_id()
    }

    fn eos_token_id(&self) -> i64 {
        (*self).eos_token_id()
    }
}

mod collator;
mod corpus;
mod error;
mod iterator;
mod thread;
mod tokenize;
mod tree;

pub use collator::{collate, Batch};
pub use corpus::{
    discover_shards, load_corpus, load_hh, load_oa, load_se, load_shp, HhRow, OaRow, SeAnswer,
    SeRow, ShpRow,
};
pub use error::{Error, Result};
pub use iterator::{truncation_mode_for, BatchIterator, IteratorOptions};
pub use thread::{PreferenceThread, ThreadBuilder, ThreadMap};
pub use tokenize::{tokenize_example, TokenizedExample, TruncationMode};
pub use tree::{extract_threads, MessageNode, MessageTree, Role};

/// Label value marking prompt-span positions as excluded from the loss.
pub const LABEL_MASK_ID: i64 = -100;

/// Turn marker opening a human turn in a canonical prompt.
pub const HUMAN_MARKER: &str = "\n\nHuman:";

/// Turn marker a canonical prompt ends with.
pub const ASSISTANT_MARKER: &str = "\n\nAssistant:";

/// Default maximum combined prompt + response length in tokens.
pub const DEFAULT_MAX_LENGTH: usize = 512;

/// Default prompt length in tokens after truncation.
pub const DEFAULT_MAX_PROMPT_LENGTH: usize = 128;
