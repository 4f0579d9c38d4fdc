//! Canonical thread records shared by every corpus adapter.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// One canonical training thread: a turn-structured prompt, its candidate
/// responses, preference pairs over those responses, and the single best
/// response used as the supervised fine-tuning target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreferenceThread {
    pub prompt: String,
    /// Candidate continuations, insertion order significant.
    pub responses: Vec<String>,
    /// (preferred_index, other_index) into `responses`.
    pub pairs: Vec<(usize, usize)>,
    pub sft_target: String,
}

/// Accumulator for one prompt's thread while an adapter is still adding
/// rows. [`ThreadBuilder::finalize`] validates field completeness, so a
/// `PreferenceThread` only ever exists with exactly the canonical fields
/// filled in.
#[derive(Debug, Default)]
pub struct ThreadBuilder {
    responses: Vec<String>,
    scores: Vec<Option<i64>>,
    pairs: Vec<(usize, usize)>,
    sft_target: Option<String>,
}

impl ThreadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a candidate response, returning its index.
    pub fn add_response(&mut self, text: impl Into<String>) -> usize {
        self.responses.push(text.into());
        self.scores.push(None);
        self.responses.len() - 1
    }

    /// Append a candidate response carrying an adapter score. The SFT
    /// target defaults to the highest-scoring response unless set
    /// explicitly.
    pub fn add_scored_response(&mut self, text: impl Into<String>, score: i64) -> usize {
        self.responses.push(text.into());
        self.scores.push(Some(score));
        self.responses.len() - 1
    }

    /// Append a preference pair (preferred index, other index).
    pub fn add_pair(&mut self, preferred: usize, other: usize) {
        self.pairs.push((preferred, other));
    }

    /// Set the supervised target explicitly, overriding score derivation.
    pub fn set_sft_target(&mut self, text: impl Into<String>) {
        self.sft_target = Some(text.into());
    }

    /// Validate field completeness and produce the immutable thread.
    pub fn finalize(self, prompt: impl Into<String>) -> Result<PreferenceThread> {
        let prompt = prompt.into();
        if self.responses.is_empty() {
            return Err(Error::SchemaViolation {
                prompt,
                reason: "no responses".to_string(),
            });
        }
        for &(preferred, other) in &self.pairs {
            if preferred >= self.responses.len() || other >= self.responses.len() {
                return Err(Error::SchemaViolation {
                    prompt,
                    reason: format!(
                        "pair ({preferred}, {other}) out of bounds for {} responses",
                        self.responses.len()
                    ),
                });
            }
        }
        let sft_target = match self.sft_target {
            Some(target) => target,
            // Highest score wins, first occurrence on ties.
            None => match best_scored(&self.scores) {
                Some(index) => self.responses[index].clone(),
                None => {
                    return Err(Error::SchemaViolation {
                        prompt,
                        reason: "sft_target missing and no scored responses".to_string(),
                    })
                }
            },
        };
        Ok(PreferenceThread {
            prompt,
            responses: self.responses,
            pairs: self.pairs,
            sft_target,
        })
    }
}

fn best_scored(scores: &[Option<i64>]) -> Option<usize> {
    let mut best: Option<(i64, usize)> = None;
    for (index, score) in scores.iter().enumerate() {
        if let Some(score) = *score {
            if best.map_or(true, |(best_score, _)| score > best_score) {
                best = Some((score, index));
            }
        }
    }
    best.map(|(_, index)| index)
}

/// Insertion-ordered mapping from prompt string to its thread accumulator.
///
/// Iteration order is first-insertion order, which keeps the flat example
/// list deterministic before any seeded shuffle is applied.
#[derive(Debug, Default)]
pub struct ThreadMap {
    prompts: Vec<String>,
    builders: Vec<ThreadBuilder>,
    index: HashMap<String, usize>,
}

impl ThreadMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the accumulator for `prompt`.
    pub fn entry(&mut self, prompt: &str) -> &mut ThreadBuilder {
        let index = match self.index.get(prompt) {
            Some(&index) => index,
            None => self.push_empty(prompt),
        };
        &mut self.builders[index]
    }

    /// Install `builder` for `prompt`, replacing any previous accumulator
    /// while keeping the prompt's original position.
    pub fn replace(&mut self, prompt: &str, builder: ThreadBuilder) {
        let index = match self.index.get(prompt) {
            Some(&index) => index,
            None => self.push_empty(prompt),
        };
        self.builders[index] = builder;
    }

    pub fn len(&self) -> usize {
        self.builders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }

    /// Validate every accumulator and produce the finalized threads in
    /// insertion order.
    pub fn finalize(self) -> Result<Vec<PreferenceThread>> {
        self.prompts
            .into_iter()
            .zip(self.builders)
            .map(|(prompt, builder)| builder.finalize(prompt))
            .collect()
    }

    fn push_empty(&mut self, prompt: &str) -> usize {
        let index = self.builders.len();
        self.prompts.push(prompt.to_string());
        self.builders.push(ThreadBuilder::new());
        self.index.insert(prompt.to_string(), index);
        index
    }
}
