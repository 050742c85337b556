//! Claim extraction from structured memory.
//!
//! Pure transforms from a [`TaskMemorySnapshot`] and [`PinRecord`]s into
//! claim drafts. Drafts are deduplicated against a caller-supplied set of
//! existing ids and within the batch; open questions never become claims.
//!
//! | Input | Claim type | Confidence |
//! |-------|------------|------------|
//! | `goal`, `decisions[]` | decision | 0.7 |
//! | `key_entities[]` | fact | 0.6 |
//! | `pinned[]` | inferred by keyword | 0.9 |
//! | pin records | mapped from pin type | 0.9 |

use std::collections::HashSet;

use anyhow::Result;

use crate::claims::{new_claim, normalize_claim_text};
use crate::models::{Claim, ClaimType, PinRecord, PinType, Scope, TaskMemorySnapshot};
use crate::store::ClaimStore;

pub const DECISION_CONFIDENCE: f64 = 0.7;
pub const ENTITY_CONFIDENCE: f64 = 0.6;
pub const PINNED_CONFIDENCE: f64 = 0.9;

const RULE_KEYWORDS: &[&str] = &[
    "must",
    "never",
    "always",
    "require",
    "requires",
    "required",
    "requiring",
    "requirement",
    "requirements",
    "constrain",
    "constrains",
    "constrained",
    "constraint",
    "constraints",
];
const PREFERENCE_KEYWORDS: &[&str] = &[
    "prefer",
    "prefers",
    "preferred",
    "preferring",
    "preference",
    "like",
    "likes",
    "liked",
    "want",
    "wants",
    "wanted",
    "favor",
    "favors",
    "favored",
    "favour",
    "favours",
    "favoured",
];
const DECISION_KEYWORDS: &[&str] = &["decided", "chose", "chosen"];

/// Infer the claim type of free-form pinned text.
///
/// Keywords match whole words, including the listed inflections, so
/// "required" counts as a rule while "likely" and "mustard" do not. Rule
/// keywords win over preference keywords, which win over decision keywords.
pub fn infer_claim_type(text: &str) -> ClaimType {
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let has = |keywords: &[&str]| words.iter().any(|w| keywords.contains(w));

    if has(RULE_KEYWORDS) {
        ClaimType::Rule
    } else if has(PREFERENCE_KEYWORDS) {
        ClaimType::Preference
    } else if has(DECISION_KEYWORDS) {
        ClaimType::Decision
    } else {
        ClaimType::Fact
    }
}

/// Claim type for a pin record.
pub fn pin_claim_type(pin_type: PinType) -> ClaimType {
    match pin_type {
        PinType::Fact => ClaimType::Fact,
        PinType::Preference => ClaimType::Preference,
        PinType::Constraint => ClaimType::Rule,
        PinType::Temporary => ClaimType::Fact,
        PinType::Default => ClaimType::Fact,
    }
}

/// Collects drafts while dropping empty text and duplicate ids.
struct DraftBatch<'a> {
    existing: &'a HashSet<String>,
    seen: HashSet<String>,
    drafts: Vec<Claim>,
}

impl<'a> DraftBatch<'a> {
    fn new(existing: &'a HashSet<String>) -> Self {
        Self {
            existing,
            seen: HashSet::new(),
            drafts: Vec::new(),
        }
    }

    fn push(&mut self, claim: Claim) {
        if normalize_claim_text(&claim.text).is_empty() {
            return;
        }
        if self.existing.contains(&claim.id) || !self.seen.insert(claim.id.clone()) {
            return;
        }
        self.drafts.push(claim);
    }
}

/// Derive claim drafts from a task memory snapshot.
pub fn extract_claims_from_snapshot(
    snapshot: &TaskMemorySnapshot,
    existing_ids: &HashSet<String>,
    now: i64,
) -> Vec<Claim> {
    let task_id = snapshot.task_id.as_deref();
    let scope = if task_id.is_some() {
        Scope::Task
    } else {
        Scope::Global
    };
    let make = |text: &str, claim_type: ClaimType, confidence: f64| {
        let mut claim = new_claim(text, claim_type, scope, task_id, confidence, now);
        claim.source_path = snapshot.source_path.clone();
        claim
    };

    let mut batch = DraftBatch::new(existing_ids);

    if let Some(ref goal) = snapshot.goal {
        batch.push(make(goal, ClaimType::Decision, DECISION_CONFIDENCE));
    }
    for decision in &snapshot.decisions {
        batch.push(make(decision, ClaimType::Decision, DECISION_CONFIDENCE));
    }
    for entity in &snapshot.key_entities {
        batch.push(make(entity, ClaimType::Fact, ENTITY_CONFIDENCE));
    }
    for pinned in &snapshot.pinned {
        batch.push(make(pinned, infer_claim_type(pinned), PINNED_CONFIDENCE));
    }
    // open_questions are uncertainty, not assertions.

    batch.drafts
}

/// Derive claim drafts from pin records.
pub fn extract_claims_from_pins(
    pins: &[PinRecord],
    existing_ids: &HashSet<String>,
    now: i64,
) -> Vec<Claim> {
    let mut batch = DraftBatch::new(existing_ids);
    for pin in pins {
        let mut claim = new_claim(
            &pin.text,
            pin_claim_type(pin.pin_type),
            pin.scope,
            pin.task_id.as_deref(),
            PINNED_CONFIDENCE,
            now,
        );
        claim.evidence_refs = vec![pin.id.clone()];
        batch.push(claim);
    }
    batch.drafts
}

/// Write drafts, skipping any whose normalized text already sits at the
/// same id. Returns the number of claims actually written.
pub async fn store_extracted_claims<S: ClaimStore + ?Sized>(
    store: &S,
    drafts: &[Claim],
) -> Result<usize> {
    let mut written = 0;
    for draft in drafts {
        if let Some(existing) = store.get_claim(&draft.id).await? {
            if normalize_claim_text(&existing.text) == normalize_claim_text(&draft.text) {
                continue;
            }
        }
        store.upsert_claim(draft).await?;
        written += 1;
    }
    Ok(written)
}
