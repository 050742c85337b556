//! # Memory Harness Core
//!
//! Pure logic for the Memory Harness agent memory engine: data models,
//! claim identity and lifecycle, the embedding circuit breaker, the
//! deterministic ranker, hybrid search, and the storage traits.
//!
//! This crate contains no tokio runtime, sqlx, or filesystem I/O. The
//! `memory-harness` crate supplies the SQLite store, embedding providers,
//! indexing and retention on top of it.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Files, chunks, claims, Q/A pairs, pins, snapshots |
//! | [`claims`] | Claim text normalization and content-addressed ids |
//! | [`extract`] | Snapshot / pin → claim drafts |
//! | [`promotion`] | Feedback-driven confidence and status transitions |
//! | [`qa`] | Q/A pair ids |
//! | [`breaker`] | Embedding circuit breaker and weight projection |
//! | [`ranking`] | Provenance-priority deterministic ordering |
//! | [`search`] | Keyword + vector merge over a [`store::ChunkStore`] |
//! | [`chunk`] | Line-window chunking |
//! | [`embedding`] | `Embedder` trait, BLOB codec, cosine ranking |
//! | [`store`] | Storage traits and the in-memory store |

pub mod breaker;
pub mod chunk;
pub mod claims;
pub mod embedding;
pub mod extract;
pub mod models;
pub mod promotion;
pub mod qa;
pub mod ranking;
pub mod search;
pub mod store;
