//! # pairwise-dedup
//!
//! Similarity dedup pipeline on top of the job queue.
//!
//! This crate provides:
//! - [`DedupService`]: rule management, idempotent pair ingestion, batch
//!   runs, review with optional workflow trigger, reports and CSV export
//! - [`SimilarityMatchHandler`]: the `similarity_match` job handler that
//!   searches the vision service and ingests matches above threshold
//! - Artifact stores and workflow trigger adapters
//! - The `pairwise-worker` binary
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use pairwise_dedup::{DedupService, FilesystemArtifactStore, SimilarityMatchHandler};
//! use pairwise_jobs::{JobQueue, WorkerBuilder};
//!
//! let queue = JobQueue::new(Arc::new(db.jobs.clone()));
//! let service = DedupService::from_database(&db, queue.clone());
//! let handler = SimilarityMatchHandler::new(
//!     service,
//!     Arc::new(VisionClient::from_env()?),
//!     Arc::new(FilesystemArtifactStore::from_env()),
//! );
//! let worker = WorkerBuilder::new(queue).with_handler(handler).build().await;
//! let handle = worker.start();
//! ```

pub mod artifacts;
pub mod handler;
pub mod report;
pub mod rules;
pub mod service;
pub mod workflow;

pub use artifacts::{sha256_hex, FilesystemArtifactStore, MemoryArtifactStore};
pub use handler::SimilarityMatchHandler;
pub use report::{to_csv, DedupReport, ExportRow, CSV_HEADER};
pub use rules::{select_applicable, validate_rule, MatchSettings};
pub use service::{DedupService, RunBatchOptions, RunBatchOutcome, WORKFLOW_CLAIM_PREFIX};
pub use workflow::{DisabledWorkflowTrigger, HttpWorkflowTrigger};
