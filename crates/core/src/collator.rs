//! Batch collation with suffix-driven padding rules.

use ndarray::Array2;

use crate::error::{Error, Result};
use crate::tokenize::TokenizedExample;
use crate::LABEL_MASK_ID;

/// A padded batch ready for a training step.
///
/// Numeric fields are `[batch_size, max_len]` arrays. Prompt fields are
/// padded on the left so every prompt ends at the same column (batched
/// generation-style decoding needs that alignment); everything else pads
/// on the right. Text fields pass through unpadded. Rejected-side fields
/// are `None` in supervised-target mode.
#[derive(Debug, Clone)]
pub struct Batch {
    pub prompt: Vec<String>,
    pub chosen: Vec<String>,
    pub rejected: Option<Vec<String>>,
    pub chosen_response_only: Vec<String>,
    pub rejected_response_only: Option<Vec<String>>,
    pub prompt_input_ids: Array2<i64>,
    pub prompt_attention_mask: Array2<i64>,
    pub chosen_input_ids: Array2<i64>,
    pub chosen_attention_mask: Array2<i64>,
    pub chosen_labels: Array2<i64>,
    pub rejected_input_ids: Option<Array2<i64>>,
    pub rejected_attention_mask: Option<Array2<i64>>,
    pub rejected_labels: Option<Array2<i64>>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.prompt.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompt.is_empty()
    }

    /// Non-padding token count on the chosen side.
    pub fn chosen_token_count(&self) -> usize {
        self.chosen_attention_mask
            .iter()
            .map(|&value| value as usize)
            .sum()
    }
}

/// Fill value for a numeric batch field, derived from its name suffix.
fn padding_value(field: &str, pad_token_id: i64) -> Result<i64> {
    if field.ends_with("_input_ids") {
        Ok(pad_token_id)
    } else if field.ends_with("_labels") {
        Ok(LABEL_MASK_ID)
    } else if field.ends_with("_attention_mask") {
        Ok(0)
    } else {
        Err(Error::UnexpectedField(field.to_string()))
    }
}

/// Pad rows out to the longest row. Fields whose name contains "prompt"
/// are reversed before padding and flipped back after, which lands the
/// padding on the left.
fn pad_field(field: &str, rows: &[&[i64]], pad_token_id: i64) -> Result<Array2<i64>> {
    let fill = padding_value(field, pad_token_id)?;
    let left_align = field.contains("prompt");
    let width = rows.iter().map(|row| row.len()).max().unwrap_or(0);
    let mut out = Array2::from_elem((rows.len(), width), fill);
    for (i, row) in rows.iter().enumerate() {
        let mut padded: Vec<i64> = if left_align {
            row.iter().rev().copied().collect()
        } else {
            row.to_vec()
        };
        padded.resize(width, fill);
        if left_align {
            padded.reverse();
        }
        for (j, value) in padded.into_iter().enumerate() {
            out[[i, j]] = value;
        }
    }
    Ok(out)
}

/// Pad a list of tokenized examples into one batch.
///
/// Rejected-side fields collate only when present on every example.
pub fn collate(examples: &[TokenizedExample], pad_token_id: i64) -> Result<Batch> {
    let with_rejected = examples
        .iter()
        .all(|example| example.rejected_input_ids.is_some());

    let numeric = |field: &str, rows: Vec<&[i64]>| pad_field(field, &rows, pad_token_id);

    let prompt_input_ids = numeric(
        "prompt_input_ids",
        examples
            .iter()
            .map(|e| e.prompt_input_ids.as_slice())
            .collect(),
    )?;
    let prompt_attention_mask = numeric(
        "prompt_attention_mask",
        examples
            .iter()
            .map(|e| e.prompt_attention_mask.as_slice())
            .collect(),
    )?;
    let chosen_input_ids = numeric(
        "chosen_input_ids",
        examples
            .iter()
            .map(|e| e.chosen_input_ids.as_slice())
            .collect(),
    )?;
    let chosen_attention_mask = numeric(
        "chosen_attention_mask",
        examples
            .iter()
            .map(|e| e.chosen_attention_mask.as_slice())
            .collect(),
    )?;
    let chosen_labels = numeric(
        "chosen_labels",
        examples.iter().map(|e| e.chosen_labels.as_slice()).collect(),
    )?;

    let (rejected_input_ids, rejected_attention_mask, rejected_labels) = if with_rejected {
        (
            Some(numeric(
                "rejected_input_ids",
                examples
                    .iter()
                    .map(|e| e.rejected_input_ids.as_deref().unwrap_or_default())
                    .collect(),
            )?),
            Some(numeric(
                "rejected_attention_mask",
                examples
                    .iter()
                    .map(|e| e.rejected_attention_mask.as_deref().unwrap_or_default())
                    .collect(),
            )?),
            Some(numeric(
                "rejected_labels",
                examples
                    .iter()
                    .map(|e| e.rejected_labels.as_deref().unwrap_or_default())
                    .collect(),
            )?),
        )
    } else {
        (None, None, None)
    };

    Ok(Batch {
        prompt: examples.iter().map(|e| e.prompt.clone()).collect(),
        chosen: examples.iter().map(|e| e.chosen.clone()).collect(),
        rejected: if with_rejected {
            Some(
                examples
                    .iter()
                    .map(|e| e.rejected.clone().unwrap_or_default())
                    .collect(),
            )
        } else {
            None
        },
        chosen_response_only: examples
            .iter()
            .map(|e| e.chosen_response_only.clone())
            .collect(),
        rejected_response_only: if with_rejected {
            Some(
                examples
                    .iter()
                    .map(|e| e.rejected_response_only.clone().unwrap_or_default())
                    .collect(),
            )
        } else {
            None
        },
        prompt_input_ids,
        prompt_attention_mask,
        chosen_input_ids,
        chosen_attention_mask,
        chosen_labels,
        rejected_input_ids,
        rejected_attention_mask,
        rejected_labels,
    })
}
