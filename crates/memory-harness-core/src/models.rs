//! Core data models for the memory engine.
//!
//! These types are the strongly-typed rows of every persisted table
//! (files, chunks, embedding cache, claims, Q/A pairs, pins) plus the
//! structured inputs that upstream producers hand to claim extraction.
//!
//! Enumerations that are stored as text columns expose `as_str` /
//! `parse` pairs; the string forms are part of the on-disk contract.

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch, the timestamp unit of every table.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// An indexed source file.
///
/// One row per `(path)`; replaced on every sync that observes a new
/// content hash and removed when the path disappears.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub path: String,
    pub source: String,
    pub hash: String,
    pub mtime: i64,
    pub size: i64,
}

/// A chunk of an indexed file; the unit of retrieval.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub path: String,
    pub source: String,
    pub start_line: i64,
    pub end_line: i64,
    pub hash: String,
    pub model: String,
    pub text: String,
    pub embedding: Option<Vec<f32>>,
    pub updated_at: i64,
}

/// Memoized embedding keyed by provider identity and content hash.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingCacheEntry {
    pub provider: String,
    pub model: String,
    pub provider_key: String,
    pub hash: String,
    pub embedding: Vec<f32>,
    pub dims: usize,
    pub updated_at: i64,
}

/// Kind of assertion a claim makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimType {
    Fact,
    Decision,
    Rule,
    Preference,
    Definition,
}

impl ClaimType {
    pub fn as_str(self) -> &'static str {
        match self {
            ClaimType::Fact => "fact",
            ClaimType::Decision => "decision",
            ClaimType::Rule => "rule",
            ClaimType::Preference => "preference",
            ClaimType::Definition => "definition",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fact" => Some(ClaimType::Fact),
            "decision" => Some(ClaimType::Decision),
            "rule" => Some(ClaimType::Rule),
            "preference" => Some(ClaimType::Preference),
            "definition" => Some(ClaimType::Definition),
            _ => None,
        }
    }
}

/// Visibility of a claim or pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Global,
    Task,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Task => "task",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "global" => Some(Scope::Global),
            "task" => Some(Scope::Task),
            _ => None,
        }
    }
}

/// Lifecycle status of a claim. `Deprecated` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    Unverified,
    Verified,
    Disputed,
    Deprecated,
}

impl ClaimStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ClaimStatus::Unverified => "unverified",
            ClaimStatus::Verified => "verified",
            ClaimStatus::Disputed => "disputed",
            ClaimStatus::Deprecated => "deprecated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unverified" => Some(ClaimStatus::Unverified),
            "verified" => Some(ClaimStatus::Verified),
            "disputed" => Some(ClaimStatus::Disputed),
            "deprecated" => Some(ClaimStatus::Deprecated),
            _ => None,
        }
    }
}

/// A structured, independently verifiable assertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub id: String,
    pub text: String,
    pub claim_type: ClaimType,
    pub scope: Scope,
    pub task_id: Option<String>,
    pub status: ClaimStatus,
    pub confidence: f64,
    pub evidence_refs: Vec<String>,
    pub source_path: Option<String>,
    pub source_start_line: Option<i64>,
    pub source_end_line: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A claim paired with its similarity to a query vector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredClaim {
    pub claim: Claim,
    pub similarity: f64,
}

/// A cached question/answer pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaPair {
    pub id: String,
    pub question: String,
    pub answer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question_embedding: Option<Vec<f32>>,
    pub session_key: Option<String>,
    pub task_id: Option<String>,
    pub claim_refs: Vec<String>,
    pub chunk_refs: Vec<String>,
    pub model: Option<String>,
    pub feedback: Option<String>,
    pub correction: Option<String>,
    pub created_at: i64,
}

/// A Q/A pair paired with its similarity to a query vector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredQaPair {
    pub pair: QaPair,
    pub similarity: f64,
}

/// Kind of a user pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinType {
    Fact,
    Preference,
    Constraint,
    Temporary,
    Default,
}

impl PinType {
    pub fn as_str(self) -> &'static str {
        match self {
            PinType::Fact => "fact",
            PinType::Preference => "preference",
            PinType::Constraint => "constraint",
            PinType::Temporary => "temporary",
            PinType::Default => "default",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fact" => Some(PinType::Fact),
            "preference" => Some(PinType::Preference),
            "constraint" => Some(PinType::Constraint),
            "temporary" => Some(PinType::Temporary),
            "default" => Some(PinType::Default),
            _ => None,
        }
    }
}

/// A user-pinned statement, optionally expiring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinRecord {
    pub id: String,
    pub text: String,
    pub pin_type: PinType,
    pub scope: Scope,
    pub task_id: Option<String>,
    pub created_at: i64,
    pub expires_at: Option<i64>,
}

/// Structured sections of a task's working memory, as produced upstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskMemorySnapshot {
    pub task_id: Option<String>,
    pub goal: Option<String>,
    pub decisions: Vec<String>,
    pub key_entities: Vec<String>,
    pub pinned: Vec<String>,
    pub open_questions: Vec<String>,
    pub source_path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_names_match_stored_names() {
        for status in [
            ClaimStatus::Unverified,
            ClaimStatus::Verified,
            ClaimStatus::Disputed,
            ClaimStatus::Deprecated,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            assert_eq!(ClaimStatus::parse(status.as_str()), Some(status));
        }
        for pin_type in [PinType::Fact, PinType::Constraint, PinType::Default] {
            let json = serde_json::to_string(&pin_type).unwrap();
            assert_eq!(json, format!("\"{}\"", pin_type.as_str()));
        }
        assert_eq!(ClaimType::parse("opinion"), None);
    }

    #[test]
    fn test_snapshot_sections_default_to_empty() {
        let snapshot: TaskMemorySnapshot =
            serde_json::from_str(r#"{"task_id":"t1","decisions":["Use CSV"]}"#).unwrap();
        assert_eq!(snapshot.task_id.as_deref(), Some("t1"));
        assert_eq!(snapshot.decisions, vec!["Use CSV".to_string()]);
        assert!(snapshot.goal.is_none());
        assert!(snapshot.pinned.is_empty());
    }
}
