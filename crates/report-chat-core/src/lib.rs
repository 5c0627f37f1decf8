//! # Report Chat Core
//!
//! Shared, runtime-agnostic logic for Report Chat: data models, the
//! deterministic chunker, the index reconciliation engine, storage and
//! embedding traits, citation formatting, prompt templates, and the
//! per-run state machine.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem I/O. Concrete
//! backends (SQLite, Weaviate, OpenAI, LangSmith) live in the `report-chat`
//! application crate.

pub mod chunk;
pub mod citation;
pub mod embedding;
pub mod index;
pub mod models;
pub mod prompt;
pub mod run;
pub mod store;
