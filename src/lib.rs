//! # Treeline
//!
//! A fault-tolerant, multi-worker job pipeline over a hierarchical realtime
//! database. Tasks are plain JSON records under a single location; workers on
//! any number of hosts cooperate to drain them, coordinating through nothing
//! but the backend's compare-and-set transactions.
//!
//! ## Why Treeline?
//!
//! - **Optimistic everywhere** - every mutation is a pure transition function
//!   run inside a transaction; contention aborts cleanly and retries
//! - **At-most-one owner** - claims are fenced by owner tokens, so two workers
//!   can never both hold a task
//! - **Crash-safe** - a timeout reaper returns tasks abandoned by dead
//!   workers to the start state
//! - **Embeddable** - a library, not a service; the in-memory backend runs in
//!   your process and remote backends implement one trait
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use serde_json::json;
//! use treeline::{MemoryDb, ProcessorFn, QueueWorker};
//!
//! let db = Arc::new(MemoryDb::new());
//! let worker = QueueWorker::builder()
//!     .tasks(db.clone())
//!     .process_id("worker-1")
//!     .processor(ProcessorFn(|payload, job| async move {
//!         // ... do the work ...
//!         job.resolve(Some(json!({ "output": "ok" }))).await;
//!         Ok(())
//!     }))
//!     .build()?;
//!
//! worker
//!     .set_task_spec(Some(&json!({
//!         "in_progress_state": "in_progress",
//!         "finished_state": "done",
//!         "timeout": 30_000
//!     })))
//!     .await;
//!
//! db.push(json!({ "job": "encode", "frames": 24 })).await?;
//! ```

pub mod db;
pub mod spec;
pub mod task;
pub mod transition;
pub mod worker;

pub use db::memory::MemoryDb;
pub use db::{
    ChildEvent, ChildSnapshot, Database, DbError, StateFilter, Subscription, TaskQuery, TxnResult,
};
pub use spec::{TaskSpec, DEFAULT_ERROR_STATE, DEFAULT_RETRIES};
pub use task::{server_timestamp, ErrorDetails, Task};
pub use transition::{Transition, Transitions};
pub use worker::{
    JobHandle, Processor, ProcessorFn, ProgressError, QueueWorker, WorkerBuilder, WorkerError,
};
