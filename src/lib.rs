//! # Memory Harness
//!
//! A local-first memory engine for AI agents.
//!
//! Memory Harness indexes an agent's workspace memory (`MEMORY.md`,
//! `memory/**/*.md` and user pins) into SQLite, serves hybrid keyword +
//! vector search with a deterministic provenance-aware ranking, and keeps a
//! claims knowledge base and a Q/A cache whose confidence moves with user
//! feedback. Embedding failures trip a circuit breaker that degrades search
//! to keyword-only instead of failing it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌──────────┐
//! │ Workspace   │──▶│  Indexing   │──▶│  SQLite  │
//! │ memory+pins │   │ Chunk+Embed │   │ FTS5+Vec │
//! └─────────────┘   └──────┬──────┘   └────┬─────┘
//!                          │               │
//!                    ┌─────▼─────┐   ┌─────▼──────┐
//!                    │  Breaker  │──▶│   Search   │
//!                    └───────────┘   │ + Ranking  │
//!                                    └────────────┘
//! ```
//!
//! The pure logic (models, claims, promotion, breaker, ranking, search)
//! lives in `memory-harness-core`; this crate adds the SQLite store,
//! embedding providers, indexing, retention and the [`engine::MemoryEngine`]
//! facade.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema setup and migrations |
//! | [`sqlite_store`] | SQLite implementation of the storage traits |
//! | [`embedding`] | Embedding providers (OpenAI, Ollama) |
//! | [`ingest`] | Workspace and pin indexing |
//! | [`get`] | Snippet fetch by path |
//! | [`retention`] | Rate-limited retention sweeps |
//! | [`engine`] | The `MemoryEngine` facade |

pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod get;
pub mod ingest;
pub mod migrate;
pub mod retention;
pub mod sqlite_store;

pub use memory_harness_core as core;
