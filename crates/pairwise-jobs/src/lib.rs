//! # pairwise-jobs
//!
//! Background job queue and worker pool for the pairwise pipeline.
//!
//! This crate provides:
//! - [`JobQueue`]: enqueue with dedupe-key promotion, lease, complete, fail,
//!   reclaim and cancel over any [`JobRepository`]
//! - [`JobWorker`]: a fixed pool of executors with per-job timeout, panic
//!   isolation and a stale-lease reaper
//! - Worker events via broadcast channels
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use pairwise_jobs::{JobQueue, NoOpHandler, WorkerBuilder, WorkerConfig};
//!
//! let queue = JobQueue::new(Arc::new(db.jobs.clone()));
//! let worker = WorkerBuilder::new(queue.clone())
//!     .with_config(WorkerConfig::from_env())
//!     .with_handler(NoOpHandler::new("noop"))
//!     .build()
//!     .await;
//!
//! let handle = worker.start();
//! // ...
//! handle.shutdown().await?;
//! ```

pub mod handler;
pub mod queue;
pub mod worker;

// Re-export core types
pub use pairwise_core::*;

pub use handler::{JobContext, JobHandler, JobResult, NoOpHandler};
pub use queue::JobQueue;
pub use worker::{JobWorker, WorkerBuilder, WorkerConfig, WorkerEvent, WorkerHandle};
