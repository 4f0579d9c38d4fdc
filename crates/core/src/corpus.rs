//! Corpus adapters: per-source transforms from cached raw rows into
//! canonical preference threads.
//!
//! Remote retrieval and HTML cleanup stay outside this crate. The
//! retrieval side materializes each corpus split as JSONL snapshots under
//! `<cache_dir>/<corpus>/<split>/`, one row per line, possibly sharded
//! across several files; shards are consumed in sorted path order.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::thread::{PreferenceThread, ThreadBuilder, ThreadMap};
use crate::tree::{extract_threads, MessageTree};
use crate::{ASSISTANT_MARKER, HUMAN_MARKER};

/// A StackExchange-style question with scored answers. Answer text is
/// assumed already stripped of markup by the retrieval side.
#[derive(Debug, Clone, Deserialize)]
pub struct SeRow {
    pub question: String,
    pub answers: Vec<SeAnswer>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeAnswer {
    pub text: String,
    pub pm_score: i64,
}

/// A two-response comparison with community vote scores.
#[derive(Debug, Clone, Deserialize)]
pub struct ShpRow {
    pub history: String,
    #[serde(rename = "human_ref_A")]
    pub human_ref_a: String,
    #[serde(rename = "human_ref_B")]
    pub human_ref_b: String,
    #[serde(rename = "score_A")]
    pub score_a: i64,
    #[serde(rename = "score_B")]
    pub score_b: i64,
    /// 1 when response A was preferred, 0 when B was.
    pub labels: i64,
}

/// A paired chosen/rejected dialogue, both transcripts sharing a prompt
/// prefix that ends at the last assistant marker.
#[derive(Debug, Clone, Deserialize)]
pub struct HhRow {
    pub chosen: String,
    pub rejected: String,
}

/// One message of a flat conversation-tree dump. The dump lists every
/// node's descendants contiguously right after it.
#[derive(Debug, Clone, Deserialize)]
pub struct OaRow {
    pub message_id: String,
    pub parent_id: Option<String>,
    pub text: String,
    /// `prompter` or `assistant`.
    pub role: String,
    pub rank: Option<i64>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub review_result: bool,
}

/// Discover every JSONL shard under `root`, in sorted path order.
pub fn discover_shards(root: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map_or(false, |ext| ext == "jsonl"))
        .map(|e| e.path().to_path_buf())
        .collect();
    paths.sort();
    paths
}

/// Read every row of one cached corpus split.
fn read_rows<R: DeserializeOwned>(cache_dir: &Path, name: &str, split: &str) -> Result<Vec<R>> {
    let split_dir = cache_dir.join(name).join(split);
    let shards = discover_shards(&split_dir);
    if shards.is_empty() {
        return Err(Error::NoShards(split_dir));
    }
    let mut rows = Vec::new();
    for shard in shards {
        let file = File::open(&shard)?;
        for (line_idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let row = serde_json::from_str(&line).map_err(|source| Error::MalformedRow {
                path: shard.clone(),
                line: line_idx + 1,
                source,
            })?;
            rows.push(row);
        }
    }
    Ok(rows)
}

fn dialogue_prompt(history: &str) -> String {
    format!("{HUMAN_MARKER} {history}{ASSISTANT_MARKER}")
}

/// Convert StackExchange-style rows into canonical threads. Every answer
/// pair is ordered by score; the SFT target is the top-scored answer.
pub fn load_se(rows: Vec<SeRow>) -> Result<Vec<PreferenceThread>> {
    let mut data = ThreadMap::new();
    for row in rows {
        let prompt = dialogue_prompt(&row.question);
        let mut builder = ThreadBuilder::new();
        for answer in &row.answers {
            builder.add_scored_response(format!(" {}", answer.text), answer.pm_score);
        }
        for i in 0..row.answers.len() {
            for j in (i + 1)..row.answers.len() {
                if row.answers[i].pm_score > row.answers[j].pm_score {
                    builder.add_pair(i, j);
                } else {
                    builder.add_pair(j, i);
                }
            }
        }
        data.replace(&prompt, builder);
    }
    data.finalize()
}

/// Convert comparison rows into canonical threads, accumulating every row
/// that shares a history. Comparisons with a score ratio under 2 are
/// dropped as low-confidence.
pub fn load_shp(rows: Vec<ShpRow>) -> Result<Vec<PreferenceThread>> {
    let mut data = ThreadMap::new();
    for row in rows {
        let ratio = f64::max(
            row.score_a as f64 / row.score_b as f64,
            row.score_b as f64 / row.score_a as f64,
        );
        if ratio < 2.0 {
            continue;
        }
        let prompt = dialogue_prompt(&row.history);
        let builder = data.entry(&prompt);
        let a = builder.add_scored_response(format!(" {}", row.human_ref_a), row.score_a);
        let b = builder.add_scored_response(format!(" {}", row.human_ref_b), row.score_b);
        if row.labels == 1 {
            builder.add_pair(a, b);
        } else {
            builder.add_pair(b, a);
        }
    }
    data.finalize()
}

/// Split a full transcript into its shared prompt (everything up to and
/// including the last assistant marker) and the continuation after it.
fn split_prompt_and_response(transcript: &str) -> Result<(&str, &str)> {
    let idx = transcript
        .rfind(ASSISTANT_MARKER)
        .ok_or_else(|| Error::MissingAssistantMarker(transcript.to_string()))?;
    let boundary = idx + ASSISTANT_MARKER.len();
    Ok((&transcript[..boundary], &transcript[boundary..]))
}

/// Convert paired chosen/rejected transcripts into canonical threads.
/// Each row contributes a fixed two-way pair; the SFT target is the
/// chosen continuation.
pub fn load_hh(rows: Vec<HhRow>) -> Result<Vec<PreferenceThread>> {
    let mut data = ThreadMap::new();
    for row in rows {
        let (prompt, chosen) = split_prompt_and_response(&row.chosen)?;
        let rejected = row.rejected.get(prompt.len()..).unwrap_or("");
        let builder = data.entry(prompt);
        let c = builder.add_response(chosen);
        let r = builder.add_response(rejected);
        builder.add_pair(c, r);
        builder.set_sft_target(chosen);
    }
    data.finalize()
}

/// Reconstruct the conversation tree from a flat message dump and emit
/// one thread per qualifying human-turn branch point.
pub fn load_oa(rows: Vec<OaRow>) -> Result<Vec<PreferenceThread>> {
    let mut tree = MessageTree::build(rows);
    let mut data = ThreadMap::new();
    extract_threads(&mut tree, &mut data);
    data.finalize()
}

/// Load the named corpus split from its cached snapshot. Supported names
/// are `se`, `shp`, `hh` and `oa`.
pub fn load_corpus(
    name: &str,
    split: &str,
    cache_dir: &Path,
    silent: bool,
) -> Result<Vec<PreferenceThread>> {
    if !silent {
        eprintln!("Loading {name} dataset ({split} split) from {cache_dir:?}...");
    }
    let threads = match name {
        "se" => load_se(read_rows(cache_dir, "se", split)?)?,
        "shp" => load_shp(read_rows(cache_dir, "shp", split)?)?,
        "hh" => load_hh(read_rows(cache_dir, "hh", split)?)?,
        "oa" => {
            // The tree snapshot publishes no test split of its own.
            let split = if split == "test" { "validation" } else { split };
            load_oa(read_rows(cache_dir, "oa", split)?)?
        }
        other => return Err(Error::UnknownCorpus(other.to_string())),
    };
    if !silent {
        eprintln!("done ({} prompts)", threads.len());
    }
    Ok(threads)
}
