//! CLI tool for preparing pairwise-preference fine-tuning batches.
//!
//! This tool loads cached preference corpora, streams them through the
//! deterministic batch iterator with a HuggingFace tokenizer, and writes
//! a metadata.json summary. It is the quickest way to validate a corpus
//! snapshot and a batching configuration before handing the stream to a
//! training loop.

use std::path::PathBuf;

use clap::Parser;
use tokenizers::Tokenizer as HfTokenizer;

use preference_prep_core::{
    BatchIterator, Encoding, IteratorOptions, Tokenizer, DEFAULT_MAX_LENGTH,
    DEFAULT_MAX_PROMPT_LENGTH,
};

/// Stream preference corpora into padded training batches.
#[derive(Parser, Debug)]
#[command(name = "preference-prep")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding the cached corpus snapshots
    #[arg(long)]
    cache_dir: PathBuf,

    /// Comma-separated corpus names (se, shp, hh, oa)
    #[arg(long, value_delimiter = ',', required = true)]
    corpora: Vec<String>,

    /// Which split to use
    #[arg(long, default_value = "train")]
    split: String,

    /// HuggingFace tokenizer model name or tokenizer.json path
    #[arg(long)]
    tokenizer: String,

    /// Token whose id terminates every response
    #[arg(long, default_value = "<|endoftext|>")]
    eos_token: String,

    /// Token whose id fills padded input positions (defaults to the EOS id)
    #[arg(long)]
    pad_token: Option<String>,

    /// Batch size
    #[arg(long, default_value = "1")]
    batch_size: usize,

    /// Disable reshuffling at the start of every epoch
    #[arg(long)]
    no_shuffle: bool,

    /// Maximum combined prompt + response length in tokens
    #[arg(long, default_value_t = DEFAULT_MAX_LENGTH)]
    max_length: usize,

    /// Prompt length in tokens after truncation
    #[arg(long, default_value_t = DEFAULT_MAX_PROMPT_LENGTH)]
    max_prompt_length: usize,

    /// Tokenize the SFT target on both sides and drop rejected fields
    #[arg(long)]
    sft_mode: bool,

    /// Stop after this many full passes over the data
    #[arg(long)]
    n_epochs: Option<usize>,

    /// Stop after this many tokenized examples
    #[arg(long)]
    n_examples: Option<usize>,

    /// Examples already completed by a previous run
    #[arg(long)]
    completed_examples: Option<usize>,

    /// Random seed for epoch shuffling
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Silence progress output
    #[arg(long)]
    silent: bool,

    /// Directory for the metadata.json summary
    #[arg(long)]
    output_dir: PathBuf,
}

/// Wrapper around HuggingFace tokenizers implementing the core trait.
///
/// Uses the Rust-native tokenizers library, which is `Send + Sync` and
/// needs no Python runtime for tokenization.
struct PretrainedTokenizer {
    inner: HfTokenizer,
    pad_id: i64,
    eos_id: i64,
}

impl PretrainedTokenizer {
    /// Load a tokenizer from a local tokenizer.json path or a hub model
    /// name, and resolve the special-token ids.
    fn load(
        model: &str,
        eos_token: &str,
        pad_token: Option<&str>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let inner = if std::path::Path::new(model).is_file() {
            HfTokenizer::from_file(model).map_err(|e| e as Box<dyn std::error::Error>)?
        } else {
            HfTokenizer::from_pretrained(model, None)
                .map_err(|e| e as Box<dyn std::error::Error>)?
        };
        let eos_id = inner
            .token_to_id(eos_token)
            .ok_or_else(|| format!("tokenizer has no token '{eos_token}'"))?
            as i64;
        let pad_id = match pad_token {
            Some(token) => inner
                .token_to_id(token)
                .ok_or_else(|| format!("tokenizer has no token '{token}'"))?
                as i64,
            // the usual convention for models without a pad token
            None => eos_id,
        };
        Ok(Self {
            inner,
            pad_id,
            eos_id,
        })
    }
}

impl Tokenizer for PretrainedTokenizer {
    fn encode(&self, text: &str) -> Encoding {
        let encoding = self
            .inner
            .encode(text, false)
            .expect("Failed to encode text with tokenizer");
        Encoding {
            input_ids: encoding.get_ids().iter().map(|&id| id as i64).collect(),
            attention_mask: encoding
                .get_attention_mask()
                .iter()
                .map(|&value| value as i64)
                .collect(),
        }
    }

    fn pad_token_id(&self) -> i64 {
        self.pad_id
    }

    fn eos_token_id(&self) -> i64 {
        self.eos_id
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    println!("Loading tokenizer from {}...", args.tokenizer);
    let tokenizer =
        PretrainedTokenizer::load(&args.tokenizer, &args.eos_token, args.pad_token.as_deref())?;

    let options = IteratorOptions {
        names: args.corpora.clone(),
        split: args.split.clone(),
        batch_size: args.batch_size,
        shuffle: !args.no_shuffle,
        max_length: args.max_length,
        max_prompt_length: args.max_prompt_length,
        sft_mode: args.sft_mode,
        n_epochs: args.n_epochs,
        n_examples: args.n_examples,
        completed_examples: args.completed_examples,
        seed: args.seed,
        silent: args.silent,
    };

    let mut iterator = BatchIterator::new(options, &args.cache_dir, &tokenizer)?;
    println!("Loaded {} prompt threads", iterator.thread_count());

    let mut batch_count = 0usize;
    let mut example_count = 0usize;
    let mut token_count = 0usize;
    while let Some(batch) = iterator.next_batch()? {
        batch_count += 1;
        example_count += batch.len();
        token_count += batch.chosen_token_count();
        if !args.silent && batch_count % 100 == 0 {
            eprintln!("Generated {batch_count} batches...");
        }
    }

    std::fs::create_dir_all(&args.output_dir)?;
    let metadata_path = args.output_dir.join("metadata.json");
    let metadata = serde_json::json!({
        "config": {
            "cache_dir": args.cache_dir.to_string_lossy(),
            "corpora": args.corpora,
            "split": args.split,
            "tokenizer": args.tokenizer,
            "batch_size": args.batch_size,
            "shuffle": !args.no_shuffle,
            "max_length": args.max_length,
            "max_prompt_length": args.max_prompt_length,
            "sft_mode": args.sft_mode,
            "n_epochs": args.n_epochs,
            "n_examples": args.n_examples,
            "completed_examples": args.completed_examples,
            "seed": args.seed,
        },
        "counts": {
            "prompt_threads": iterator.thread_count(),
            "batches": batch_count,
            "examples": example_count,
        },
        "stats": {
            "chosen_tokens": token_count,
            "avg_examples_per_batch": if batch_count > 0 {
                example_count as f64 / batch_count as f64
            } else {
                0.0
            },
            "avg_chosen_tokens_per_example": if example_count > 0 {
                token_count as f64 / example_count as f64
            } else {
                0.0
            },
        },
    });
    std::fs::write(&metadata_path, serde_json::to_string_pretty(&metadata)?)?;

    println!("\n[summary]");
    println!("  Prompt threads loaded: {}", iterator.thread_count());
    println!("  Batches generated: {batch_count}");
    println!("  Examples generated: {example_count}");
    println!("  Chosen-side tokens: {token_count}");
    println!("  Metadata: {metadata_path:?}");

    Ok(())
}
