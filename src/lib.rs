//! # Merkle Watch
//!
//! A change-gated Merkle tree service: periodically scan a directory tree,
//! derive a content-addressed Merkle tree from the files discovered, and
//! commit the tree to durable storage, but only when its root hash differs
//! from the most recently committed root.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Scheduler                             │
//! │  • Periodic tick at the configured interval                 │
//! │  • Single-flight: overlapping ticks dropped, never queued   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Build Orchestrator                      │
//! │  • Walker: deterministic, sorted file enumeration           │
//! │  • Builder: streaming SHA-256 leaves, pairwise reduction    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Change-Gated Sync                        │
//! │  • Latest root: cache first, backend on miss                │
//! │  • Unchanged root → no write at all                         │
//! │  • Cache updated only after the backend accepts             │
//! └─────────────────────────────────────────────────────────────┘
//!                     │                      │
//!                     ▼                      ▼
//! ┌──────────────────────────┐  ┌──────────────────────────────┐
//! │     Cache (Redis)        │  │   Backend (SQL | S3 | mem)   │
//! │  • TTL'd accelerator     │  │  • Root records + tree body  │
//! │  • Safe on outage        │  │  • Source of truth           │
//! └──────────────────────────┘  └──────────────────────────────┘
//! ```
//!
//! An operator HTTP surface exposes health, statistics, manual triggers and
//! cache maintenance; a companion CLI (`merkle-tree`) builds trees offline
//! and generates/verifies inclusion proofs over the same primitives.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use merkle_watch::tree::MerkleTree;
//! use merkle_watch::proof::verify_data;
//!
//! let tree = MerkleTree::from_data(&["a", "b", "c"]);
//! let root = tree.root_hash().unwrap();
//!
//! let proof = tree.prove_data("c").unwrap();
//! assert!(verify_data("c", &proof, root));
//! ```
//!
//! ## Modules
//!
//! - [`hasher`]: SHA-256 of byte strings and streamed files
//! - [`walker`]: deterministic directory enumeration
//! - [`tree`]: bottom-up Merkle tree construction
//! - [`proof`]: inclusion-proof generation and verification
//! - [`cache`]: TTL'd Redis accelerator, safe on outage
//! - [`storage`]: durable backends behind one contract
//! - [`sync`]: change-gated commit
//! - [`scheduler`]: periodic single-flight builds
//! - [`orchestrator`]: walk → build → sync pipeline
//! - [`server`]: operator HTTP surface

pub mod backoff;
pub mod cache;
pub mod config;
pub mod error;
pub mod hasher;
pub mod metrics;
pub mod orchestrator;
pub mod proof;
pub mod scheduler;
pub mod server;
pub mod storage;
pub mod sync;
pub mod tree;
pub mod walker;

pub use cache::TreeCache;
pub use config::Config;
pub use error::{Error, Result};
pub use orchestrator::{BuildOutcome, LastBuild, Orchestrator};
pub use proof::{verify_data, verify_hash, Position, ProofStep};
pub use scheduler::Scheduler;
pub use storage::{RootRecord, TreeStore};
pub use sync::{SyncOutcome, TreeSync};
pub use tree::MerkleTree;
