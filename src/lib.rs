//! # Report Chat
//!
//! Retrieval-augmented question answering over a folder of PDF reports.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌───────────────────┐
//! │ PDF reports │──▶│ Chunk + hash │──▶│ Reconcile + embed │
//! └─────────────┘   └──────────────┘   └─────────┬─────────┘
//!                                                ▼
//!                                ┌──────────────────────────────┐
//!                                │ vector store + record store  │
//!                                └──────────────┬───────────────┘
//!                                               │
//!   question ──▶ rewrite ──▶ retrieve ──────────┘
//!                              │
//!                              ▼
//!                         synthesize ──▶ NDJSON stream (sources, tokens, run id)
//! ```
//!
//! The domain types and the storage-agnostic algorithms (chunking, index
//! reconciliation, citations, prompts, run state) live in the
//! `report-chat-core` crate. This crate adds the backends, the model and
//! tracing clients, the CLI commands, and the HTTP service.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration with environment overrides |
//! | [`db`], [`migrate`] | SQLite pools and schemas |
//! | [`record_sqlite`] | Record store for index reconciliation |
//! | [`vector_sqlite`], [`vector_weaviate`], [`stores`] | Vector store backends |
//! | [`openai`], [`embedding`], [`llm`] | OpenAI-compatible embedding and chat clients |
//! | [`loader`], [`pages`], [`ingest`] | PDF loading and the ingestion pass |
//! | [`reports`] | Report display metadata |
//! | [`retriever`], [`chain`] | Rewrite, retrieve, synthesize |
//! | [`tracer`] | Run tracing, feedback, and share links |
//! | [`server`] | HTTP service |
//! | [`ask`], [`eval`], [`status`] | Remaining CLI commands |

pub mod ask;
pub mod chain;
pub mod config;
pub mod db;
pub mod embedding;
pub mod eval;
pub mod ingest;
pub mod llm;
pub mod loader;
pub mod migrate;
pub mod openai;
pub mod pages;
pub mod record_sqlite;
pub mod reports;
pub mod retriever;
pub mod server;
pub mod status;
pub mod stores;
pub mod tracer;
pub mod vector_sqlite;
pub mod vector_weaviate;
