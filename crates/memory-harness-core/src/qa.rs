//! Q/A pair identity.
//!
//! Unlike claims, Q/A ids are opaque: the same question asked twice is two
//! pairs, each with its own feedback.

use uuid::Uuid;

use crate::models::QaPair;

/// Prefix of every Q/A pair id.
pub const QA_ID_PREFIX: &str = "qa_";

/// A fresh random Q/A id.
pub fn generate_qa_id() -> String {
    format!("{}{}", QA_ID_PREFIX, Uuid::new_v4().simple())
}

/// Build a Q/A pair with no refs, embedding or feedback.
pub fn new_qa_pair(question: &str, answer: &str, now: i64) -> QaPair {
    QaPair {
        id: generate_qa_id(),
        question: question.to_string(),
        answer: answer.to_string(),
        question_embedding: None,
        session_key: None,
        task_id: None,
        claim_refs: Vec::new(),
        chunk_refs: Vec::new(),
        model: None,
        feedback: None,
        correction: None,
        created_at: now,
    }
}
