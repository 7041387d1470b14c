//! # convograph
//!
//! An incremental, content-addressed pipeline that turns conversation
//! exports into a property graph and a vector index.
//!
//! Every unit (conversation, message, chunk, load entity) is identified by a
//! SHA-256 digest of its content. Each stage keeps an append-only manifest
//! of the digests it has processed, so re-running the pipeline over an
//! unchanged export does no work.
//!
//! ## Architecture
//!
//! ```text
//! export ─▶ Extract ─▶ Chunk ─▶ Enrich ─▶ Embed ─▶ Cluster ─▶ Position ─▶ Load
//!                                 │          │                            │
//!                            inference   embedding              ┌─────────┴─────────┐
//!                             service     provider              ▼                   ▼
//!                                                         GraphStore          VectorIndex
//!                                                               └──── Retrieval ────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! cgx init                      # create store schemas
//! cgx run                       # run every stage
//! cgx audit --strict            # compare the two stores
//! cgx search "borrow checker"   # nearest chunks, expanded through the graph
//! cgx filter --tag rust         # chunks tagged #rust
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`hasher`] | Content digests |
//! | [`manifest`], [`artifact`] | Processed-hash logs and JSONL streams |
//! | [`pipeline`], [`stages`] | Stage runner and the seven stages |
//! | [`enrich`], [`inference`] | Annotation via an inference service |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`cluster`], [`layout`] | HDBSCAN clustering and 2D positioning |
//! | [`graph`], [`vector`] | Store abstractions and backends |
//! | [`writer`] | Phased dual-store writer |
//! | [`audit`] | Cross-store consistency auditor |
//! | [`retrieval`] | Similarity search and graph filters |

pub mod artifact;
pub mod audit;
pub mod chunk;
pub mod cluster;
pub mod config;
pub mod context;
pub mod corpus;
pub mod db;
pub mod embedding;
pub mod enrich;
pub mod error;
pub mod graph;
pub mod hasher;
pub mod inference;
pub mod layout;
pub mod linalg;
pub mod manifest;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod retrieval;
pub mod retry;
pub mod stages;
pub mod vector;
pub mod writer;

pub use error::{Error, ErrorKind, Result};
