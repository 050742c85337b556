//! Deterministic provenance-priority ranking.
//!
//! Blended scores alone say nothing about *where* a result came from. A
//! pinned fact and a transcript excerpt with nearly the same score should
//! not be ordered by floating-point noise, so the ranker reorders near-ties
//! by provenance class and breaks the rest on a stable key.
//!
//! # Algorithm
//!
//! 1. Drop non-finite scores; dedupe by id, keeping the highest score.
//! 2. Sort by score (desc), id (asc). This fixes the anchor order and
//!    removes any dependence on input order.
//! 3. Repeatedly pick the next result:
//!    - the anchor is the highest-scoring remaining item;
//!    - contenders are the anchor, every same-class item tied with it, and
//!      every higher-class item whose gap to the anchor is below
//!      `override_delta`;
//!    - the highest class among contenders wins; within that class the
//!      items tied with the class's best score are ordered by
//!      `(path, start_line, id)` and the first is emitted.
//!
//! Two scores are tied when their gap is at most `absolute_epsilon` or at
//! most `relative_epsilon × max(|a|, |b|)`. Either test is sufficient.
//! `override_delta` is never narrower than the absolute tie window.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::store::{task_owner, TASK_MEMORY_DIR};

/// Source tag of pin virtual files.
pub const PINS_SOURCE: &str = "pins";
/// Source tag of session transcript excerpts.
pub const SESSIONS_SOURCE: &str = "sessions";

/// Where a result came from, in ascending priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvenanceClass {
    Transcript,
    MemoryNote,
    TaskFile,
    PinnedFact,
}

impl ProvenanceClass {
    /// Classify a chunk by its source tag and path.
    ///
    /// ```rust
    /// use memory_harness_core::ranking::ProvenanceClass;
    ///
    /// assert_eq!(ProvenanceClass::classify("pins/p1", "pins"), ProvenanceClass::PinnedFact);
    /// assert_eq!(ProvenanceClass::classify("memory/tasks/t1.md", "memory"), ProvenanceClass::TaskFile);
    /// assert_eq!(ProvenanceClass::classify("MEMORY.md", "memory"), ProvenanceClass::MemoryNote);
    /// assert_eq!(ProvenanceClass::classify("sessions/a.jsonl", "sessions"), ProvenanceClass::Transcript);
    /// ```
    pub fn classify(path: &str, source: &str) -> Self {
        if source == PINS_SOURCE {
            ProvenanceClass::PinnedFact
        } else if source == SESSIONS_SOURCE {
            ProvenanceClass::Transcript
        } else if path.starts_with(TASK_MEMORY_DIR) && task_owner(path).is_some() {
            ProvenanceClass::TaskFile
        } else {
            ProvenanceClass::MemoryNote
        }
    }

    pub fn priority(self) -> u8 {
        match self {
            ProvenanceClass::Transcript => 0,
            ProvenanceClass::MemoryNote => 1,
            ProvenanceClass::TaskFile => 2,
            ProvenanceClass::PinnedFact => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProvenanceClass::Transcript => "transcript",
            ProvenanceClass::MemoryNote => "memory_note",
            ProvenanceClass::TaskFile => "task_file",
            ProvenanceClass::PinnedFact => "pinned_fact",
        }
    }
}

/// Tie window and override policy. Every field is explicit; there are no
/// hidden defaults inside [`rank_deterministic`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingPolicy {
    pub relative_epsilon: f64,
    pub absolute_epsilon: f64,
    pub override_delta: f64,
}

impl Default for RankingPolicy {
    fn default() -> Self {
        Self {
            relative_epsilon: 0.02,
            absolute_epsilon: 0.005,
            override_delta: 0.15,
        }
    }
}

impl RankingPolicy {
    /// Whether `a` and `b` fall inside the tie window.
    pub fn is_tie(&self, a: f64, b: f64) -> bool {
        let gap = (a - b).abs();
        gap <= self.absolute_epsilon.max(0.0)
            || gap <= self.relative_epsilon.max(0.0) * a.abs().max(b.abs())
    }

    fn effective_override(&self) -> f64 {
        self.override_delta.max(self.absolute_epsilon).max(0.0)
    }
}

/// Anything the ranker can order.
pub trait Rankable {
    fn rank_id(&self) -> &str;
    fn rank_score(&self) -> f64;
    fn provenance(&self) -> ProvenanceClass;
    /// Final tie-break key: `(path, start_line)`; the id is appended.
    fn stable_key(&self) -> (&str, i64);
}

fn stable_cmp<T: Rankable>(a: &T, b: &T) -> Ordering {
    a.stable_key()
        .cmp(&b.stable_key())
        .then_with(|| a.rank_id().cmp(b.rank_id()))
}

/// Order `items` by score with provenance-priority near-tie handling.
///
/// The output depends only on the item values and `policy`; any
/// permutation of the same input yields the same order.
pub fn rank_deterministic<T: Rankable>(items: Vec<T>, policy: &RankingPolicy) -> Vec<T> {
    let mut best: HashMap<String, T> = HashMap::new();
    for item in items {
        if !item.rank_score().is_finite() {
            continue;
        }
        match best.get(item.rank_id()) {
            Some(existing) => {
                let replace = match item.rank_score().total_cmp(&existing.rank_score()) {
                    Ordering::Greater => true,
                    Ordering::Equal => stable_cmp(&item, existing) == Ordering::Less,
                    Ordering::Less => false,
                };
                if replace {
                    best.insert(item.rank_id().to_string(), item);
                }
            }
            None => {
                best.insert(item.rank_id().to_string(), item);
            }
        }
    }

    let mut remaining: Vec<T> = best.into_values().collect();
    remaining.sort_by(|a, b| {
        b.rank_score()
            .total_cmp(&a.rank_score())
            .then_with(|| a.rank_id().cmp(b.rank_id()))
    });

    let override_delta = policy.effective_override();
    let mut ranked = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let anchor_score = remaining[0].rank_score();
        let anchor_class = remaining[0].provenance();

        let contenders: Vec<usize> = remaining
            .iter()
            .enumerate()
            .filter(|(_, item)| {
                let class = item.provenance();
                let score = item.rank_score();
                if class == anchor_class {
                    policy.is_tie(anchor_score, score)
                } else if class > anchor_class {
                    anchor_score - score < override_delta
                } else {
                    false
                }
            })
            .map(|(i, _)| i)
            .collect();

        let top_class = contenders
            .iter()
            .map(|&i| remaining[i].provenance())
            .max()
            .unwrap_or(anchor_class);
        let class_best = contenders
            .iter()
            .filter(|&&i| remaining[i].provenance() == top_class)
            .map(|&i| remaining[i].rank_score())
            .fold(f64::NEG_INFINITY, f64::max);

        let winner = contenders
            .iter()
            .copied()
            .filter(|&i| {
                remaining[i].provenance() == top_class
                    && policy.is_tie(class_best, remaining[i].rank_score())
            })
            .min_by(|&a, &b| stable_cmp(&remaining[a], &remaining[b]))
            .unwrap_or(0);

        ranked.push(remaining.remove(winner));
    }

    ranked
}
