//! Claim identity and canonical text.
//!
//! A claim's id is content-addressed: the SHA-256 of its normalized text,
//! scope and task id, so re-inserting the same assertion in the same scope
//! always lands on the same row.
//!
//! ```rust
//! use memory_harness_core::claims::generate_claim_id;
//! use memory_harness_core::models::Scope;
//!
//! let a = generate_claim_id("Use  Postgres ", Scope::Global, None);
//! let b = generate_claim_id("use postgres", Scope::Global, None);
//! assert_eq!(a, b);
//! assert!(a.starts_with("claim_"));
//! ```

use sha2::{Digest, Sha256};

use crate::models::{Claim, ClaimStatus, ClaimType, Scope};

/// Prefix of every claim id.
pub const CLAIM_ID_PREFIX: &str = "claim_";

/// Hex characters of the digest kept in the id.
const CLAIM_ID_HEX_LEN: usize = 24;

/// Lowercase, collapse whitespace runs to a single space, trim.
pub fn normalize_claim_text(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Deterministic id for a claim. Pure, no I/O.
pub fn generate_claim_id(text: &str, scope: Scope, task_id: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_claim_text(text).as_bytes());
    hasher.update(b"|");
    hasher.update(scope.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(task_id.unwrap_or("").as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{}{}", CLAIM_ID_PREFIX, &digest[..CLAIM_ID_HEX_LEN])
}

/// Clamp a confidence into `[0, 1]`. Non-finite input collapses to `0`.
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Build a fresh `unverified` claim with its content-addressed id.
pub fn new_claim(
    text: &str,
    claim_type: ClaimType,
    scope: Scope,
    task_id: Option<&str>,
    confidence: f64,
    now: i64,
) -> Claim {
    Claim {
        id: generate_claim_id(text, scope, task_id),
        text: text.trim().to_string(),
        claim_type,
        scope,
        task_id: task_id.map(str::to_string),
        status: ClaimStatus::Unverified,
        confidence: clamp_confidence(confidence),
        evidence_refs: Vec::new(),
        source_path: None,
        source_start_line: None,
        source_end_line: None,
        embedding: None,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_whitespace() {
        assert_eq!(
            normalize_claim_text("  The API\tuses\n\nJSON  "),
            "the api uses json"
        );
    }

    #[test]
    fn test_normalize_empty() {
        assert_eq!(normalize_claim_text(" \n\t "), "");
    }

    #[test]
    fn test_id_stable_under_whitespace_variation() {
        let a = generate_claim_id("Deploy on Fridays", Scope::Task, Some("t1"));
        let b = generate_claim_id("  deploy   on\nfridays ", Scope::Task, Some("t1"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_id_differs_across_scope_and_task() {
        let global = generate_claim_id("x is y", Scope::Global, None);
        let task_a = generate_claim_id("x is y", Scope::Task, Some("a"));
        let task_b = generate_claim_id("x is y", Scope::Task, Some("b"));
        assert_ne!(global, task_a);
        assert_ne!(task_a, task_b);
    }

    #[test]
    fn test_id_shape() {
        let id = generate_claim_id("anything", Scope::Global, None);
        assert!(id.starts_with(CLAIM_ID_PREFIX));
        assert_eq!(id.len(), CLAIM_ID_PREFIX.len() + CLAIM_ID_HEX_LEN);
    }

    #[test]
    fn test_clamp_confidence() {
        assert_eq!(clamp_confidence(1.4), 1.0);
        assert_eq!(clamp_confidence(-0.2), 0.0);
        assert_eq!(clamp_confidence(0.42), 0.42);
        assert_eq!(clamp_confidence(f64::NAN), 0.0);
    }

    #[test]
    fn test_new_claim_defaults() {
        let c = new_claim(" Rust is fast ", ClaimType::Fact, Scope::Global, None, 1.7, 10);
        assert_eq!(c.text, "Rust is fast");
        assert_eq!(c.status, ClaimStatus::Unverified);
        assert_eq!(c.confidence, 1.0);
        assert_eq!(c.created_at, 10);
        assert_eq!(c.updated_at, 10);
    }
}
