//! Claim promotion: feedback-driven confidence and status transitions.
//!
//! # State machine
//!
//! | Event | Confidence | Status |
//! |-------|------------|--------|
//! | positive | `+ positive_boost` (cap 1) | → `verified` when crossing `verify_threshold` |
//! | negative / correction | `- negative_penalty` (floor 0) | `verified` → `disputed`; else ≤ `deprecate_threshold` → `deprecated`; else `unverified` → `disputed` |
//! | any, on `deprecated` | unchanged | unchanged (absorbing) |
//!
//! A transition that changes neither confidence nor status reports `None`
//! rather than producing a vacuous write.
//!
//! Implicit acceptance is a separate, smaller path: a claim that keeps
//! being retrieved without dispute gains a fixed `+0.05`, but never past
//! `0.70`, so it can never reach `verified` without explicit feedback.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::claims::clamp_confidence;
use crate::models::{now_ms, Claim, ClaimStatus};
use crate::store::{ClaimStore, QaStore};

/// Confidence gained per implicit acceptance.
pub const IMPLICIT_ACCEPTANCE_BOOST: f64 = 0.05;
/// Implicit acceptance never raises confidence past this.
pub const IMPLICIT_ACCEPTANCE_CAP: f64 = 0.70;
/// Minimum confidence for implicit acceptance to apply.
pub const IMPLICIT_ACCEPTANCE_MIN_CONFIDENCE: f64 = 0.30;
/// Minimum consecutive undisputed turns for implicit acceptance.
pub const IMPLICIT_ACCEPTANCE_MIN_TURNS: u32 = 2;

/// Tunable promotion thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionThresholds {
    pub positive_boost: f64,
    pub negative_penalty: f64,
    pub verify_threshold: f64,
    pub deprecate_threshold: f64,
}

impl Default for PromotionThresholds {
    fn default() -> Self {
        Self {
            positive_boost: 0.15,
            negative_penalty: 0.25,
            verify_threshold: 0.85,
            deprecate_threshold: 0.20,
        }
    }
}

/// A feedback event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feedback {
    Positive,
    Negative,
    Correction,
}

impl Feedback {
    pub fn as_str(self) -> &'static str {
        match self {
            Feedback::Positive => "positive",
            Feedback::Negative => "negative",
            Feedback::Correction => "correction",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "positive" => Some(Feedback::Positive),
            "negative" => Some(Feedback::Negative),
            "correction" => Some(Feedback::Correction),
            _ => None,
        }
    }
}

/// One applied transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromotionDelta {
    pub claim_id: String,
    pub previous_confidence: f64,
    pub new_confidence: f64,
    pub previous_status: ClaimStatus,
    pub new_status: ClaimStatus,
}

impl PromotionDelta {
    pub fn status_changed(&self) -> bool {
        self.previous_status != self.new_status
    }
}

/// Compute the transition for one feedback event. Pure.
///
/// Returns `None` for deprecated claims and for events that change
/// neither confidence nor status.
pub fn apply_feedback(
    claim: &Claim,
    feedback: Feedback,
    thresholds: &PromotionThresholds,
) -> Option<PromotionDelta> {
    if claim.status == ClaimStatus::Deprecated {
        return None;
    }

    let prev_conf = clamp_confidence(claim.confidence);
    let prev_status = claim.status;

    let (new_conf, new_status) = match feedback {
        Feedback::Positive => {
            let conf = clamp_confidence(prev_conf + thresholds.positive_boost);
            let status = if conf >= thresholds.verify_threshold
                && prev_status != ClaimStatus::Verified
            {
                ClaimStatus::Verified
            } else {
                prev_status
            };
            (conf, status)
        }
        Feedback::Negative | Feedback::Correction => {
            let conf = clamp_confidence(prev_conf - thresholds.negative_penalty);
            let status = if prev_status == ClaimStatus::Verified {
                ClaimStatus::Disputed
            } else if conf <= thresholds.deprecate_threshold {
                ClaimStatus::Deprecated
            } else if prev_status == ClaimStatus::Unverified {
                ClaimStatus::Disputed
            } else {
                prev_status
            };
            (conf, status)
        }
    };

    if new_conf == prev_conf && new_status == prev_status {
        return None;
    }

    Some(PromotionDelta {
        claim_id: claim.id.clone(),
        previous_confidence: prev_conf,
        new_confidence: new_conf,
        previous_status: prev_status,
        new_status,
    })
}

/// Projected outcome of a batch of feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectedOutcome {
    Verified,
    Deprecated,
    Disputed,
    Unchanged,
}

/// Result of [`evaluate_claim_promotion`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PromotionProjection {
    pub projected_confidence: f64,
    pub outcome: ProjectedOutcome,
}

/// What-if projection: apply `positive_count` boosts, then
/// `negative_count` penalties, and classify. Never mutates anything.
pub fn evaluate_claim_promotion(
    claim: &Claim,
    positive_count: u32,
    negative_count: u32,
    thresholds: &PromotionThresholds,
) -> PromotionProjection {
    let start = clamp_confidence(claim.confidence);
    if claim.status == ClaimStatus::Deprecated {
        return PromotionProjection {
            projected_confidence: start,
            outcome: ProjectedOutcome::Unchanged,
        };
    }

    let mut conf = start;
    for _ in 0..positive_count {
        conf = clamp_confidence(conf + thresholds.positive_boost);
    }
    for _ in 0..negative_count {
        conf = clamp_confidence(conf - thresholds.negative_penalty);
    }

    let outcome = if conf >= thresholds.verify_threshold {
        if claim.status == ClaimStatus::Verified {
            ProjectedOutcome::Unchanged
        } else {
            ProjectedOutcome::Verified
        }
    } else if conf <= thresholds.deprecate_threshold {
        ProjectedOutcome::Deprecated
    } else if negative_count > 0 {
        ProjectedOutcome::Disputed
    } else {
        ProjectedOutcome::Unchanged
    };

    PromotionProjection {
        projected_confidence: conf,
        outcome,
    }
}

/// Why implicit acceptance did or did not apply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImplicitAcceptance {
    pub applied: bool,
    pub reason: String,
    pub previous_confidence: Option<f64>,
    pub new_confidence: Option<f64>,
}

impl ImplicitAcceptance {
    fn refused(reason: &str, confidence: Option<f64>) -> Self {
        Self {
            applied: false,
            reason: reason.to_string(),
            previous_confidence: confidence,
            new_confidence: confidence,
        }
    }
}

/// Check the implicit-acceptance guardrails for `claim`. Pure.
pub fn evaluate_implicit_acceptance(
    claim: &Claim,
    was_retrieved: bool,
    consecutive_non_dispute_turns: u32,
) -> ImplicitAcceptance {
    let conf = clamp_confidence(claim.confidence);

    if claim.status == ClaimStatus::Deprecated {
        return ImplicitAcceptance::refused("claim is deprecated", Some(conf));
    }
    if !was_retrieved {
        return ImplicitAcceptance::refused("claim was not retrieved", Some(conf));
    }
    if consecutive_non_dispute_turns < IMPLICIT_ACCEPTANCE_MIN_TURNS {
        return ImplicitAcceptance::refused("not enough undisputed turns", Some(conf));
    }
    if conf < IMPLICIT_ACCEPTANCE_MIN_CONFIDENCE {
        return ImplicitAcceptance::refused("confidence below floor", Some(conf));
    }
    if conf >= IMPLICIT_ACCEPTANCE_CAP {
        return ImplicitAcceptance::refused("confidence at implicit cap", Some(conf));
    }

    let new_conf = (conf + IMPLICIT_ACCEPTANCE_BOOST).min(IMPLICIT_ACCEPTANCE_CAP);
    ImplicitAcceptance {
        applied: true,
        reason: "accepted".to_string(),
        previous_confidence: Some(conf),
        new_confidence: Some(new_conf),
    }
}

/// Apply implicit acceptance to a stored claim. Status never changes.
pub async fn apply_implicit_acceptance<S: ClaimStore + ?Sized>(
    store: &S,
    claim_id: &str,
    was_retrieved: bool,
    consecutive_non_dispute_turns: u32,
) -> Result<ImplicitAcceptance> {
    let claim = match store.get_claim(claim_id).await? {
        Some(c) => c,
        None => return Ok(ImplicitAcceptance::refused("claim not found", None)),
    };

    let outcome = evaluate_implicit_acceptance(&claim, was_retrieved, consecutive_non_dispute_turns);
    if let (true, Some(conf)) = (outcome.applied, outcome.new_confidence) {
        store
            .update_claim_confidence(&claim.id, conf, claim.status, now_ms())
            .await?;
    }
    Ok(outcome)
}

/// Apply feedback directly to one claim.
///
/// `None` when the claim is unknown or nothing changed.
pub async fn process_claim_feedback<S: ClaimStore + ?Sized>(
    store: &S,
    claim_id: &str,
    feedback: Feedback,
    thresholds: &PromotionThresholds,
) -> Result<Option<PromotionDelta>> {
    let claim = match store.get_claim(claim_id).await? {
        Some(c) => c,
        None => return Ok(None),
    };

    let delta = match apply_feedback(&claim, feedback, thresholds) {
        Some(d) => d,
        None => return Ok(None),
    };

    store
        .update_claim_confidence(&claim.id, delta.new_confidence, delta.new_status, now_ms())
        .await?;
    tracing::debug!(
        claim_id,
        feedback = feedback.as_str(),
        from = delta.previous_status.as_str(),
        to = delta.new_status.as_str(),
        confidence = delta.new_confidence,
        "claim feedback applied"
    );
    Ok(Some(delta))
}

/// Text recorded on a Q/A pair for a feedback verdict.
pub fn qa_feedback_text(feedback: Feedback, correction: Option<&str>) -> String {
    match (feedback, correction) {
        (Feedback::Correction, Some(text)) => format!("correction: {}", text),
        _ => feedback.as_str().to_string(),
    }
}

/// Record feedback on a Q/A pair and propagate it to every claim the
/// pair references.
///
/// Returns `None` when `qa_id` is unknown; otherwise every delta that was
/// applied (dangling claim refs are skipped).
pub async fn process_qa_feedback<S>(
    store: &S,
    qa_id: &str,
    feedback: Feedback,
    correction: Option<&str>,
    thresholds: &PromotionThresholds,
) -> Result<Option<Vec<PromotionDelta>>>
where
    S: ClaimStore + QaStore + ?Sized,
{
    let pair = match store.get_qa_pair(qa_id).await? {
        Some(p) => p,
        None => return Ok(None),
    };

    store
        .update_qa_feedback(qa_id, &qa_feedback_text(feedback, correction), correction)
        .await?;

    let mut deltas = Vec::new();
    for claim_id in &pair.claim_refs {
        if let Some(delta) = process_claim_feedback(store, claim_id, feedback, thresholds).await? {
            deltas.push(delta);
        }
    }
    Ok(Some(deltas))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::new_claim;
    use crate::models::{ClaimType, QaPair, Scope};
    use crate::store::memory::InMemoryStore;

    const EPS: f64 = 1e-9;

    fn claim_at(confidence: f64, status: ClaimStatus) -> Claim {
        let mut c = new_claim("the cache is redis", ClaimType::Fact, Scope::Global, None, confidence, 0);
        c.status = status;
        c
    }

    fn run(claim: &mut Claim, feedback: Feedback, n: usize) -> Vec<Option<PromotionDelta>> {
        let t = PromotionThresholds::default();
        (0..n)
            .map(|_| {
                let d = apply_feedback(claim, feedback, &t);
                if let Some(ref d) = d {
                    claim.confidence = d.new_confidence;
                    claim.status = d.new_status;
                }
                d
            })
            .collect()
    }

    #[test]
    fn test_three_positives_verify() {
        let mut c = claim_at(0.75, ClaimStatus::Unverified);
        run(&mut c, Feedback::Positive, 3);
        assert!(c.confidence >= 0.85);
        assert!(c.confidence <= 1.0);
        assert_eq!(c.status, ClaimStatus::Verified);
    }

    #[test]
    fn test_confidence_clamps_at_one() {
        let mut c = claim_at(0.95, ClaimStatus::Verified);
        let deltas = run(&mut c, Feedback::Positive, 2);
        assert_eq!(c.confidence, 1.0);
        assert!(deltas[0].is_some());
        // Already verified at 1.0: nothing to change.
        assert!(deltas[1].is_none());
    }

    #[test]
    fn test_three_negatives_deprecate() {
        let mut c = claim_at(0.5, ClaimStatus::Unverified);
        let deltas = run(&mut c, Feedback::Negative, 3);
        assert_eq!(c.confidence, 0.0);
        assert_eq!(c.status, ClaimStatus::Deprecated);
        assert_eq!(deltas[0].as_ref().unwrap().new_status, ClaimStatus::Disputed);
        assert_eq!(deltas[1].as_ref().unwrap().new_status, ClaimStatus::Deprecated);
        assert!(deltas[2].is_none());
    }

    #[test]
    fn test_verified_negative_becomes_disputed() {
        let mut c = claim_at(0.9, ClaimStatus::Verified);
        let d = run(&mut c, Feedback::Correction, 1).remove(0).unwrap();
        assert_eq!(d.new_status, ClaimStatus::Disputed);
        assert!((d.new_confidence - 0.65).abs() < EPS);
    }

    #[test]
    fn test_deprecated_is_absorbing() {
        let c = claim_at(0.5, ClaimStatus::Deprecated);
        let t = PromotionThresholds::default();
        assert!(apply_feedback(&c, Feedback::Positive, &t).is_none());
        assert!(apply_feedback(&c, Feedback::Negative, &t).is_none());
        assert!(apply_feedback(&c, Feedback::Correction, &t).is_none());
    }

    #[test]
    fn test_disputed_negative_above_floor_keeps_status() {
        let mut c = claim_at(0.8, ClaimStatus::Disputed);
        let d = run(&mut c, Feedback::Negative, 1).remove(0).unwrap();
        assert_eq!(d.new_status, ClaimStatus::Disputed);
        assert!((d.new_confidence - 0.55).abs() < EPS);
    }

    #[test]
    fn test_evaluate_projection_does_not_mutate() {
        let c = claim_at(0.5, ClaimStatus::Unverified);
        let t = PromotionThresholds::default();
        let p = evaluate_claim_promotion(&c, 3, 0, &t);
        assert_eq!(p.outcome, ProjectedOutcome::Verified);
        assert!((p.projected_confidence - 0.95).abs() < EPS);
        assert_eq!(c.confidence, 0.5);

        assert_eq!(
            evaluate_claim_promotion(&c, 0, 2, &t).outcome,
            ProjectedOutcome::Deprecated
        );
        assert_eq!(
            evaluate_claim_promotion(&c, 1, 1, &t).outcome,
            ProjectedOutcome::Disputed
        );
        assert_eq!(
            evaluate_claim_promotion(&c, 0, 0, &t).outcome,
            ProjectedOutcome::Unchanged
        );
    }

    #[test]
    fn test_implicit_acceptance_guardrails() {
        let c = claim_at(0.5, ClaimStatus::Unverified);
        assert!(!evaluate_implicit_acceptance(&c, false, 5).applied);
        assert!(!evaluate_implicit_acceptance(&c, true, 1).applied);
        assert!(!evaluate_implicit_acceptance(&claim_at(0.29, ClaimStatus::Unverified), true, 5).applied);
        assert!(!evaluate_implicit_acceptance(&claim_at(0.70, ClaimStatus::Unverified), true, 5).applied);
        assert!(!evaluate_implicit_acceptance(&claim_at(0.5, ClaimStatus::Deprecated), true, 5).applied);

        let ok = evaluate_implicit_acceptance(&c, true, 2);
        assert!(ok.applied);
        assert!((ok.new_confidence.unwrap() - 0.55).abs() < EPS);
    }

    #[test]
    fn test_implicit_acceptance_caps() {
        let c = claim_at(0.68, ClaimStatus::Unverified);
        let ok = evaluate_implicit_acceptance(&c, true, 3);
        assert_eq!(ok.new_confidence, Some(IMPLICIT_ACCEPTANCE_CAP));
    }

    #[tokio::test]
    async fn test_implicit_acceptance_never_verifies() {
        let store = InMemoryStore::new();
        let c = claim_at(0.6, ClaimStatus::Unverified);
        store.upsert_claim(&c).await.unwrap();
        for _ in 0..10 {
            apply_implicit_acceptance(&store, &c.id, true, 4).await.unwrap();
        }
        let stored = store.get_claim(&c.id).await.unwrap().unwrap();
        assert!((stored.confidence - IMPLICIT_ACCEPTANCE_CAP).abs() < EPS);
        assert_eq!(stored.status, ClaimStatus::Unverified);
    }

    #[tokio::test]
    async fn test_implicit_acceptance_refusal_does_not_write() {
        let store = InMemoryStore::new();
        let c = claim_at(0.5, ClaimStatus::Unverified);
        store.upsert_claim(&c).await.unwrap();
        let out = apply_implicit_acceptance(&store, &c.id, false, 4).await.unwrap();
        assert!(!out.applied);
        let stored = store.get_claim(&c.id).await.unwrap().unwrap();
        assert_eq!(stored, c);

        let missing = apply_implicit_acceptance(&store, "claim_missing", true, 4)
            .await
            .unwrap();
        assert!(!missing.applied);
    }

    #[tokio::test]
    async fn test_process_claim_feedback_unknown() {
        let store = InMemoryStore::new();
        let t = PromotionThresholds::default();
        let res = process_claim_feedback(&store, "claim_nope", Feedback::Positive, &t)
            .await
            .unwrap();
        assert!(res.is_none());
    }

    #[tokio::test]
    async fn test_qa_feedback_end_to_end() {
        let store = InMemoryStore::new();
        let t = PromotionThresholds::default();
        let claim = claim_at(0.5, ClaimStatus::Unverified);
        store.upsert_claim(&claim).await.unwrap();
        store
            .store_qa_pair(&QaPair {
                id: "qa_1".to_string(),
                question: "what cache do we use?".to_string(),
                answer: "redis".to_string(),
                question_embedding: None,
                session_key: None,
                task_id: None,
                claim_refs: vec![claim.id.clone(), "claim_dangling".to_string()],
                chunk_refs: vec![],
                model: None,
                feedback: None,
                correction: None,
                created_at: 0,
            })
            .await
            .unwrap();

        let deltas = process_qa_feedback(&store, "qa_1", Feedback::Positive, None, &t)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deltas.len(), 1);
        let pair = store.get_qa_pair("qa_1").await.unwrap().unwrap();
        assert_eq!(pair.feedback.as_deref(), Some("positive"));
        let c = store.get_claim(&claim.id).await.unwrap().unwrap();
        assert!((c.confidence - 0.65).abs() < EPS);
        assert_eq!(c.status, ClaimStatus::Unverified);

        for _ in 0..2 {
            process_qa_feedback(&store, "qa_1", Feedback::Positive, None, &t)
                .await
                .unwrap();
        }
        let c = store.get_claim(&claim.id).await.unwrap().unwrap();
        assert!((c.confidence - 0.95).abs() < EPS);
        assert_eq!(c.status, ClaimStatus::Verified);
    }

    #[tokio::test]
    async fn test_qa_correction_text_and_unknown_pair() {
        let store = InMemoryStore::new();
        let t = PromotionThresholds::default();
        assert!(
            process_qa_feedback(&store, "qa_missing", Feedback::Negative, None, &t)
                .await
                .unwrap()
                .is_none()
        );

        store
            .store_qa_pair(&QaPair {
                id: "qa_2".to_string(),
                question: "q".to_string(),
                answer: "a".to_string(),
                question_embedding: None,
                session_key: None,
                task_id: None,
                claim_refs: vec![],
                chunk_refs: vec![],
                model: None,
                feedback: None,
                correction: None,
                created_at: 0,
            })
            .await
            .unwrap();
        let deltas = process_qa_feedback(&store, "qa_2", Feedback::Correction, Some("use memcached"), &t)
            .await
            .unwrap()
            .unwrap();
        assert!(deltas.is_empty());
        let pair = store.get_qa_pair("qa_2").await.unwrap().unwrap();
        assert_eq!(pair.feedback.as_deref(), Some("correction: use memcached"));
        assert_eq!(pair.correction.as_deref(), Some("use memcached"));
    }
}
