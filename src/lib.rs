//! # rag-session
//!
//! Session context engine for a conversational retrieval-augmented assistant.
//!
//! Each turn retrieves passages for the user's query, numbers them as
//! citable sources, asks a chat model to answer with inline `[n]` markers,
//! works out which sources the answer actually used, renumbers them densely,
//! and appends the turn to a bounded per-session history that compacts older
//! turns into a summary.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────┐   ┌───────────┐   ┌────────────┐
//! │ Retriever  │──▶│ Source map │──▶│ ChatModel │──▶│ Citations  │
//! │ azure/...  │   │  1..5      │   │           │   │ renumber   │
//! └────────────┘   └────────────┘   └───────────┘   └─────┬──────┘
//!                                                         ▼
//!                   ┌──────────┐    ┌──────────────────────────────┐
//!                   │ TurnLog  │◀───│ Session (window + summary)   │
//!                   └──────────┘    └──────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! rags init                         # create the turn-log database
//! rags ask "Which pump handles 40 bar?"
//! rags chat --session demo          # interactive
//! rags serve                        # HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`source_map`] | Numbered, citable context block per turn |
//! | [`citations`] | Citation attribution and dense renumbering |
//! | [`window`] | Bounded conversation log with compaction |
//! | [`summarize`] | Model-backed summarizer for compaction |
//! | [`prompts`] | System prompt and message framing |
//! | [`traits`] | Retriever, chat model, and turn logger seams |
//! | [`llm`] | OpenAI / Azure OpenAI chat client |
//! | [`embedding`] | Query embeddings for vector search |
//! | [`retrieval`] | Azure AI Search, context-harness, static corpus |
//! | [`session`] | Session store with per-session locking |
//! | [`engine`] | Turn orchestration |
//! | [`error`] | Caller-facing turn errors |
//! | [`turn_log`] | Turn logger backends |
//! | [`server`] | HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod citations;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod prompts;
pub mod retrieval;
pub mod server;
pub mod session;
pub mod source_map;
pub mod summarize;
pub mod traits;
pub mod turn_log;
pub mod window;
