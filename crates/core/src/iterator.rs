//! Deterministic, resumable batch generation over canonical threads.

use std::path::Path;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};

use crate::collator::{collate, Batch};
use crate::corpus::load_corpus;
use crate::error::{Error, Result};
use crate::thread::PreferenceThread;
use crate::tokenize::{tokenize_example, TokenizedExample, TruncationMode};
use crate::Tokenizer;
use crate::{DEFAULT_MAX_LENGTH, DEFAULT_MAX_PROMPT_LENGTH};

/// Truncation policy is fixed per corpus: paired dialogue transcripts
/// keep their most recent turns, everything else keeps the head.
pub fn truncation_mode_for(name: &str) -> TruncationMode {
    if name == "hh" {
        TruncationMode::KeepEnd
    } else {
        TruncationMode::KeepStart
    }
}

/// Options for [`BatchIterator`].
///
/// At least one stopping criterion (`n_epochs`, `n_examples` or
/// `completed_examples`) must be set.
#[derive(Debug, Clone)]
pub struct IteratorOptions {
    /// Names of the corpora to load and concatenate.
    pub names: Vec<String>,
    pub split: String,
    pub batch_size: usize,
    /// Reshuffle the flat example list at the start of every epoch.
    pub shuffle: bool,
    /// Maximum combined prompt + response length in tokens.
    pub max_length: usize,
    /// Prompt length in tokens after truncation.
    pub max_prompt_length: usize,
    /// Tokenize the SFT target on both sides and drop rejected fields.
    pub sft_mode: bool,
    /// Stop after this many full passes over the data.
    pub n_epochs: Option<usize>,
    /// Stop after this many tokenized examples.
    pub n_examples: Option<usize>,
    /// Examples already completed by a previous run; converted into an
    /// example limit over the remainder of the data.
    pub completed_examples: Option<usize>,
    pub seed: u64,
    pub silent: bool,
}

impl Default for IteratorOptions {
    fn default() -> Self {
        Self {
            names: Vec::new(),
            split: "train".to_string(),
            batch_size: 1,
            shuffle: true,
            max_length: DEFAULT_MAX_LENGTH,
            max_prompt_length: DEFAULT_MAX_PROMPT_LENGTH,
            sft_mode: false,
            n_epochs: None,
            n_examples: None,
            completed_examples: None,
            seed: 0,
            silent: false,
        }
    }
}

#[derive(Debug, Clone)]
struct FlatExample {
    thread: PreferenceThread,
    truncation_mode: TruncationMode,
}

/// Source of one shuffle seed per epoch.
///
/// A dedicated generator is seeded once from the caller's seed; each
/// epoch shuffle then runs on a freshly built generator scoped to that
/// call, so nothing outside the iterator ever observes or perturbs this
/// randomness.
#[derive(Debug)]
struct EpochSeeds {
    rng: StdRng,
}

impl EpochSeeds {
    fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn next_seed(&mut self) -> u64 {
        self.rng.next_u64()
    }
}

/// Shuffle `items` in place with a generator scoped to this call.
fn scoped_shuffle<T>(items: &mut [T], seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    items.shuffle(&mut rng);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IterState {
    NotStarted,
    /// Position within the current epoch: next thread to expand and the
    /// next pair within it.
    InEpoch { cursor: usize, pair_cursor: usize },
    Exhausted,
}

/// Pull-based generator of padded batches over the combined corpora.
///
/// One call to [`BatchIterator::next_batch`] produces exactly one batch;
/// abandoning the iterator early is always safe. Two iterators built with
/// the same options and corpora yield identical batch streams.
pub struct BatchIterator<T: Tokenizer> {
    tokenizer: T,
    options: IteratorOptions,
    flat: Vec<FlatExample>,
    seeds: EpochSeeds,
    state: IterState,
    pending: Vec<TokenizedExample>,
    epoch_idx: usize,
    example_idx: usize,
    n_examples: Option<usize>,
}

impl<T: Tokenizer> BatchIterator<T> {
    /// Load every named corpus from `cache_dir` and build an iterator
    /// over the concatenated threads.
    pub fn new(options: IteratorOptions, cache_dir: &Path, tokenizer: T) -> Result<Self> {
        let mut flat = Vec::new();
        for name in &options.names {
            let truncation_mode = truncation_mode_for(name);
            for thread in load_corpus(name, &options.split, cache_dir, options.silent)? {
                flat.push(FlatExample {
                    thread,
                    truncation_mode,
                });
            }
        }
        Self::from_flat(options, flat, tokenizer)
    }

    /// Build an iterator over already-loaded threads.
    pub fn from_threads(
        options: IteratorOptions,
        threads: Vec<(PreferenceThread, TruncationMode)>,
        tokenizer: T,
    ) -> Result<Self> {
        let flat = threads
            .into_iter()
            .map(|(thread, truncation_mode)| FlatExample {
                thread,
                truncation_mode,
            })
            .collect();
        Self::from_flat(options, flat, tokenizer)
    }

    fn from_flat(options: IteratorOptions, flat: Vec<FlatExample>, tokenizer: T) -> Result<Self> {
        if options.n_epochs.is_none()
            && options.n_examples.is_none()
            && options.completed_examples.is_none()
        {
            return Err(Error::MissingStoppingCriterion);
        }
        // A resume offset wins over an explicit example limit.
        let n_examples = match options.completed_examples {
            Some(completed) => Some(flat.len().saturating_sub(completed)),
            None => options.n_examples,
        };
        let seeds = EpochSeeds::new(options.seed);
        Ok(Self {
            tokenizer,
            options,
            flat,
            seeds,
            state: IterState::NotStarted,
            pending: Vec::new(),
            epoch_idx: 0,
            example_idx: 0,
            n_examples,
        })
    }

    /// Number of canonical threads across the loaded corpora.
    pub fn thread_count(&self) -> usize {
        self.flat.len()
    }

    /// Tokenized examples produced so far.
    pub fn examples_generated(&self) -> usize {
        self.example_idx
    }

    /// Produce the next padded batch, or `None` once a stopping criterion
    /// has been reached. Errors are fatal to the iteration.
    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        loop {
            let (cursor, pair_cursor) = match self.state {
                IterState::Exhausted => return Ok(None),
                IterState::NotStarted => {
                    self.begin_epoch();
                    continue;
                }
                IterState::InEpoch {
                    cursor,
                    pair_cursor,
                } => (cursor, pair_cursor),
            };

            if cursor >= self.flat.len() {
                // epoch complete; a trailing partial batch is dropped
                self.pending.clear();
                self.epoch_idx += 1;
                self.state = IterState::NotStarted;
                continue;
            }

            let per_thread = if self.options.sft_mode {
                1
            } else {
                self.flat[cursor].thread.pairs.len()
            };
            if pair_cursor >= per_thread {
                self.state = IterState::InEpoch {
                    cursor: cursor + 1,
                    pair_cursor: 0,
                };
                continue;
            }

            let example = self.tokenize_entry(cursor, pair_cursor)?;
            self.pending.push(example);
            self.example_idx += 1;
            self.state = IterState::InEpoch {
                cursor,
                pair_cursor: pair_cursor + 1,
            };

            if self.pending.len() == self.options.batch_size {
                let batch = collate(&self.pending, self.tokenizer.pad_token_id())?;
                self.pending.clear();
                if let Some(limit) = self.n_examples {
                    if self.example_idx >= limit {
                        if !self.options.silent {
                            eprintln!(
                                "Finished generating {limit} examples on {} split",
                                self.options.split
                            );
                        }
                        self.state = IterState::Exhausted;
                    }
                }
                return Ok(Some(batch));
            }
        }
    }

    /// Start the next epoch, or finish when the epoch limit is reached.
    fn begin_epoch(&mut self) {
        if self.flat.is_empty() {
            self.state = IterState::Exhausted;
            return;
        }
        if let Some(limit) = self.options.n_epochs {
            if self.epoch_idx >= limit {
                if !self.options.silent {
                    eprintln!(
                        "Finished generating {limit} epochs on {} split",
                        self.options.split
                    );
                }
                self.state = IterState::Exhausted;
                return;
            }
        }
        if self.options.shuffle {
            let seed = self.seeds.next_seed();
            scoped_shuffle(&mut self.flat, seed);
        }
        self.state = IterState::InEpoch {
            cursor: 0,
            pair_cursor: 0,
        };
    }

    fn tokenize_entry(&self, cursor: usize, pair_cursor: usize) -> Result<TokenizedExample> {
        let entry = &self.flat[cursor];
        let thread = &entry.thread;
        if self.options.sft_mode {
            let mut example = tokenize_example(
                &self.tokenizer,
                &thread.prompt,
                &thread.sft_target,
                &thread.sft_target,
                entry.truncation_mode,
                self.options.max_length,
                self.options.max_prompt_length,
            )?;
            example.drop_rejected();
            Ok(example)
        } else {
            let (preferred, other) = thread.pairs[pair_cursor];
            tokenize_example(
                &self.tokenizer,
                &thread.prompt,
                &thread.responses[preferred],
                &thread.responses[other],
                entry.truncation_mode,
                self.options.max_length,
                self.options.max_prompt_length,
            )
        }
    }
}

impl<T: Tokenizer> Iterator for BatchIterator<T> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_batch() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => None,
            Err(error) => {
                self.state = IterState::Exhausted;
                Some(Err(error))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Encoding, ThreadBuilder};

    /// Character-based tokenizer stand-in: one id per char.
    struct MockTokenizer;

    impl Tokenizer for MockTokenizer {
        fn encode(&self, text: &str) -> Encoding {
            let input_ids: Vec<i64> = text.chars().map(|c| c as i64).collect();
            let attention_mask = vec![1; input_ids.len()];
            Encoding {
                input_ids,
                attention_mask,
            }
        }

        fn pad_token_id(&self) -> i64 {
            0
        }

        fn eos_token_id(&self) -> i64 {
            2
        }
    }

    fn thread(prompt: &str, responses: &[&str], pairs: &[(usize, usize)]) -> PreferenceThread {
        let mut builder = ThreadBuilder::new();
        for (index, response) in responses.iter().enumerate() {
            builder.add_scored_response(*response, responses.len() as i64 - index as i64);
        }
        for &(preferred, other) in pairs {
            builder.add_pair(preferred, other);
        }
        builder.finalize(prompt).unwrap()
    }

    fn options() -> IteratorOptions {
        IteratorOptions {
            batch_size: 1,
            shuffle: false,
            n_epochs: Some(1),
            silent: true,
            ..IteratorOptions::default()
        }
    }

    fn two_pair_threads() -> Vec<(PreferenceThread, TruncationMode)> {
        vec![
            (
                thread("p1:", &[" a", " b", " c"], &[(0, 1), (1, 2)]),
                TruncationMode::KeepStart,
            ),
            (
                thread("p2:", &[" d", " e", " f"], &[(2, 0), (0, 1)]),
                TruncationMode::KeepStart,
            ),
        ]
    }

    #[test]
    fn test_truncation_mode_fixed_per_corpus() {
        assert_eq!(truncation_mode_for("hh"), TruncationMode::KeepEnd);
        assert_eq!(truncation_mode_for("se"), TruncationMode::KeepStart);
        assert_eq!(truncation_mode_for("oa"), TruncationMode::KeepStart);
    }

    #[test]
    fn test_iterates_from_cached_corpus() {
        use std::io::Write;

        let temp = tempfile::TempDir::new().unwrap();
        let dir = temp.path().join("hh").join("train");
        std::fs::create_dir_all(&dir).unwrap();
        let mut file = std::fs::File::create(dir.join("00.jsonl")).unwrap();
        writeln!(
            file,
            "{}",
            r#"{"chosen": "\n\nHuman: Hi\n\nAssistant: Yes.", "rejected": "\n\nHuman: Hi\n\nAssistant: No."}"#
        )
        .unwrap();

        let opts = IteratorOptions {
            names: vec!["hh".to_string()],
            ..options()
        };
        let mut iterator = BatchIterator::new(opts, temp.path(), MockTokenizer).unwrap();
        assert_eq!(iterator.thread_count(), 1);
        let batch = iterator.next_batch().unwrap().expect("one batch");
        assert_eq!(batch.prompt[0], "\n\nHuman: Hi\n\nAssistant:");
        assert_eq!(batch.chosen_response_only[0], " Yes.");
        assert_eq!(batch.rejected_response_only.as_ref().unwrap()[0], " No.");
        assert!(iterator.next_batch().unwrap().is_none());
    }

    #[test]
    fn test_example_limit_stops_after_one_batch() {
        let opts = IteratorOptions {
            batch_size: 3,
            n_epochs: None,
            n_examples: Some(3),
            ..options()
        };
        let mut iterator =
            BatchIterator::from_threads(opts, two_pair_threads(), MockTokenizer).unwrap();
        let batch = iterator.next_batch().unwrap().expect("one batch");
        assert_eq!(batch.len(), 3);
        assert!(iterator.next_batch().unwrap().is_none());
        assert_eq!(iterator.examples_generated(), 3);
    }

    #[test]
    fn test_epoch_limit_and_pair_expansion() {
        let opts = IteratorOptions {
            batch_size: 2,
            n_epochs: Some(2),
            ..options()
        };
        let mut iterator =
            BatchIterator::from_threads(opts, two_pair_threads(), MockTokenizer).unwrap();
        let mut batches = 0;
        while let Some(batch) = iterator.next_batch().unwrap() {
            assert_eq!(batch.len(), 2);
            batches += 1;
        }
        // 4 examples per epoch, 2 epochs, batch size 2
        assert_eq!(batches, 4);
        assert_eq!(iterator.examples_generated(), 8);
    }

    #[test]
    fn test_trailing_partial_batch_is_discarded() {
        let opts = IteratorOptions {
            batch_size: 3,
            ..options()
        };
        let threads = vec![(
            thread("p:", &[" a"], &[(0, 0)]),
            TruncationMode::KeepStart,
        )];
        let mut iterator = BatchIterator::from_threads(opts, threads, MockTokenizer).unwrap();
        assert!(iterator.next_batch().unwrap().is_none());
    }

    #[test]
    fn test_preference_mode_uses_pair_order() {
        let threads = vec![(
            thread("p:", &[" best", " worst"], &[(1, 0)]),
            TruncationMode::KeepStart,
        )];
        let mut iterator =
            BatchIterator::from_threads(options(), threads, MockTokenizer).unwrap();
        let batch = iterator.next_batch().unwrap().expect("one batch");
        assert_eq!(batch.chosen[0], "p: worst");
        assert_eq!(batch.rejected.as_ref().unwrap()[0], "p: best");
    }

    #[test]
    fn test_sft_mode_drops_rejected_fields() {
        let opts = IteratorOptions {
            sft_mode: true,
            ..options()
        };
        let mut iterator =
            BatchIterator::from_threads(opts, two_pair_threads(), MockTokenizer).unwrap();
        let batch = iterator.next_batch().unwrap().expect("one batch");
        assert!(batch.rejected.is_none());
        assert!(batch.rejected_input_ids.is_none());
        // the chosen side carries the SFT target
        assert_eq!(batch.chosen[0], "p1: a");
        // one example per thread in sft mode
        let batch = iterator.next_batch().unwrap().expect("second batch");
        assert_eq!(batch.chosen[0], "p2: d");
        assert!(iterator.next_batch().unwrap().is_none());
    }

    #[test]
    fn test_missing_stopping_criterion_is_fatal() {
        let opts = IteratorOptions {
            n_epochs: None,
            ..options()
        };
        assert!(matches!(
            BatchIterator::from_threads(opts, two_pair_threads(), MockTokenizer),
            Err(Error::MissingStoppingCriterion)
        ));
    }

    #[test]
    fn test_resume_offset_limits_remaining_examples() {
        let opts = IteratorOptions {
            sft_mode: true,
            n_epochs: None,
            completed_examples: Some(1),
            ..options()
        };
        let mut iterator =
            BatchIterator::from_threads(opts, two_pair_threads(), MockTokenizer).unwrap();
        // 2 threads - 1 completed = 1 remaining example
        assert!(iterator.next_batch().unwrap().is_some());
        assert!(iterator.next_batch().unwrap().is_none());
        assert_eq!(iterator.examples_generated(), 1);
    }

    #[test]
    fn test_same_seed_yields_identical_streams() {
        let opts = IteratorOptions {
            shuffle: true,
            seed: 7,
            n_epochs: Some(3),
            ..options()
        };
        let mut first =
            BatchIterator::from_threads(opts.clone(), two_pair_threads(), MockTokenizer).unwrap();
        let mut second =
            BatchIterator::from_threads(opts, two_pair_threads(), MockTokenizer).unwrap();
        loop {
            let a = first.next_batch().unwrap();
            let b = second.next_batch().unwrap();
            match (a, b) {
                (None, None) => break,
                (Some(a), Some(b)) => {
                    assert_eq!(a.prompt, b.prompt);
                    assert_eq!(a.chosen, b.chosen);
                    assert_eq!(a.chosen_input_ids, b.chosen_input_ids);
                    assert_eq!(a.prompt_input_ids, b.prompt_input_ids);
                }
                _ => panic!("streams diverged in length"),
            }
        }
    }

    #[test]
    fn test_different_seeds_reorder_examples() {
        let threads: Vec<(PreferenceThread, TruncationMode)> = (0..16)
            .map(|index| {
                (
                    thread(&format!("p{index}:"), &[" a", " b"], &[(0, 1)]),
                    TruncationMode::KeepStart,
                )
            })
            .collect();
        let collect_prompts = |seed: u64| -> Vec<String> {
            let opts = IteratorOptions {
                shuffle: true,
                seed,
                ..options()
            };
            let mut iterator =
                BatchIterator::from_threads(opts, threads.clone(), MockTokenizer).unwrap();
            let mut prompts = Vec::new();
            while let Some(batch) = iterator.next_batch().unwrap() {
                prompts.extend(batch.prompt);
            }
            prompts
        };
        let first = collect_prompts(3);
        let second = collect_prompts(4);
        assert_eq!(first.len(), second.len());
        assert_ne!(first, second);
    }
}
