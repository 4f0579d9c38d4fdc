//! Tokenization, truncation and label masking for one training example.

use std::str::FromStr;

use crate::error::{Error, Result};
use crate::{Encoding, Tokenizer, LABEL_MASK_ID};

/// Which end of an over-length prompt survives truncation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncationMode {
    KeepStart,
    KeepEnd,
}

impl FromStr for TruncationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "keep_start" => Ok(Self::KeepStart),
            "keep_end" => Ok(Self::KeepEnd),
            other => Err(Error::UnknownTruncationMode(other.to_string())),
        }
    }
}

/// One tokenized, truncated, label-masked training example.
///
/// Labels mirror the full input ids except over the prompt span, which is
/// masked out of the loss. Rejected-side fields are `None` in
/// supervised-target mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenizedExample {
    pub prompt: String,
    pub chosen: String,
    pub rejected: Option<String>,
    pub chosen_response_only: String,
    pub rejected_response_only: Option<String>,
    pub prompt_input_ids: Vec<i64>,
    pub prompt_attention_mask: Vec<i64>,
    pub chosen_input_ids: Vec<i64>,
    pub chosen_attention_mask: Vec<i64>,
    pub chosen_labels: Vec<i64>,
    pub rejected_input_ids: Option<Vec<i64>>,
    pub rejected_attention_mask: Option<Vec<i64>>,
    pub rejected_labels: Option<Vec<i64>>,
}

impl TokenizedExample {
    /// Drop every rejected-side field (supervised-target mode).
    pub fn drop_rejected(&mut self) {
        self.rejected = None;
        self.rejected_response_only = None;
        self.rejected_input_ids = None;
        self.rejected_attention_mask = None;
        self.rejected_labels = None;
    }
}

/// Tokenize one (prompt, chosen, rejected) triple.
///
/// The prompt is truncated to `max_prompt_length` when the combined
/// sequence would exceed `max_length`; if that still is not enough, both
/// responses lose their tail. None of the raw strings may already contain
/// the end-of-sequence token.
pub fn tokenize_example<T: Tokenizer>(
    tokenizer: &T,
    prompt: &str,
    chosen: &str,
    rejected: &str,
    truncation_mode: TruncationMode,
    max_length: usize,
    max_prompt_length: usize,
) -> Result<TokenizedExample> {
    let mut prompt_tokens = tokenizer.encode(prompt);
    let mut chosen_tokens = tokenizer.encode(chosen);
    let mut rejected_tokens = tokenizer.encode(rejected);

    let eos = tokenizer.eos_token_id();
    ensure_no_eos("prompt", prompt, &prompt_tokens, eos)?;
    ensure_no_eos("chosen response", chosen, &chosen_tokens, eos)?;
    ensure_no_eos("rejected response", rejected, &rejected_tokens, eos)?;

    chosen_tokens.input_ids.push(eos);
    chosen_tokens.attention_mask.push(1);
    rejected_tokens.input_ids.push(eos);
    rejected_tokens.attention_mask.push(1);

    let longer_response_length = chosen_tokens
        .input_ids
        .len()
        .max(rejected_tokens.input_ids.len());

    // if the combined sequence is too long, truncate the prompt
    if prompt_tokens.input_ids.len() + longer_response_length > max_length {
        prompt_tokens = truncate_prompt(prompt_tokens, truncation_mode, max_prompt_length);
    }

    // if that's still too long, truncate the responses
    if prompt_tokens.input_ids.len() + longer_response_length > max_length {
        let keep = max_length.saturating_sub(max_prompt_length);
        chosen_tokens.input_ids.truncate(keep);
        chosen_tokens.attention_mask.truncate(keep);
        rejected_tokens.input_ids.truncate(keep);
        rejected_tokens.attention_mask.truncate(keep);
    }

    let prompt_len = prompt_tokens.input_ids.len();
    let chosen_sequence = concat_encodings(&prompt_tokens, &chosen_tokens);
    let rejected_sequence = concat_encodings(&prompt_tokens, &rejected_tokens);
    let chosen_labels = masked_labels(&chosen_sequence.input_ids, prompt_len);
    let rejected_labels = masked_labels(&rejected_sequence.input_ids, prompt_len);

    Ok(TokenizedExample {
        prompt: prompt.to_string(),
        chosen: format!("{prompt}{chosen}"),
        rejected: Some(format!("{prompt}{rejected}")),
        chosen_response_only: chosen.to_string(),
        rejected_response_only: Some(rejected.to_string()),
        prompt_input_ids: prompt_tokens.input_ids,
        prompt_attention_mask: prompt_tokens.attention_mask,
        chosen_input_ids: chosen_sequence.input_ids,
        chosen_attention_mask: chosen_sequence.attention_mask,
        chosen_labels,
        rejected_input_ids: Some(rejected_sequence.input_ids),
        rejected_attention_mask: Some(rejected_sequence.attention_mask),
        rejected_labels: Some(rejected_labels),
    })
}

fn ensure_no_eos(field: &'static str, text: &str, encoding: &Encoding, eos: i64) -> Result<()> {
    if encoding.input_ids.contains(&eos) {
        return Err(Error::EosInText {
            field,
            text: text.to_string(),
        });
    }
    Ok(())
}

fn truncate_prompt(
    mut encoding: Encoding,
    mode: TruncationMode,
    max_prompt_length: usize,
) -> Encoding {
    match mode {
        TruncationMode::KeepStart => {
            encoding.input_ids.truncate(max_prompt_length);
            encoding.attention_mask.truncate(max_prompt_length);
            encoding
        }
        TruncationMode::KeepEnd => {
            let start = encoding.input_ids.len().saturating_sub(max_prompt_length);
            Encoding {
                input_ids: encoding.input_ids.split_off(start),
                attention_mask: encoding.attention_mask.split_off(start),
            }
        }
    }
}

fn concat_encodings(prompt: &Encoding, response: &Encoding) -> Encoding {
    let mut input_ids = prompt.input_ids.clone();
    input_ids.extend_from_slice(&response.input_ids);
    let mut attention_mask = prompt.attention_mask.clone();
    attention_mask.extend_from_slice(&response.attention_mask);
    Encoding {
        input_ids,
        attention_mask,
    }
}

fn masked_labels(input_ids: &[i64], prompt_len: usize) -> Vec<i64> {
    let mut labels = input_ids.to_vec();
    for label in labels.iter_mut().take(prompt_len) {
        *label = LABEL_MASK_ID;
    }
    labels
}
