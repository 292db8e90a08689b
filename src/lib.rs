//! Interlend Core Library
//!
//! This library implements the resumable chunked synchronization engine of an
//! interlibrary resource sharing broker: it harvests bibliographic records
//! from heterogeneous host library systems through a two-phase cursor
//! (bootstrap, then deltas since a watermark) and periodically re-derives
//! availability data, with crash-resumable at-least-once delivery and tightly
//! bounded concurrency toward both the remote systems and the local store.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`db`] - Database connection and schema management
//! - [`txn`] - Explicit transaction scopes and propagation modes
//! - [`checkpoint`] - Durable per-job progress state
//! - [`harvest`] - Cursor codec and page-driving paginator
//! - [`source`] - Host system adapters (Sierra, Polaris, synthetic)
//! - [`dispatch`] - Source-grouped throttling and write smoothing
//! - [`job`] - Chunk protocol, job contract, and the generic runner
//! - [`lock`] - Cluster-wide run leases
//! - [`scheduler`] - Cadence, office hours gating, graceful shutdown
//! - [`records`] - Harvested record and availability persistence
//! - [`config`] - File and flag configuration

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod checkpoint;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod harvest;
pub mod job;
pub mod lock;
pub mod records;
pub mod scheduler;
pub mod source;
pub mod txn;

// Re-export commonly used types
pub use checkpoint::{CheckpointError, CheckpointFields, CheckpointStore, SqliteCheckpointStore};
pub use config::FileConfig;
pub use db::Database;
pub use dispatch::{ItemOutcome, ThrottledDispatcher, WriteThrottle};
pub use harvest::{Cursor, Paginator, RunState};
pub use job::{
    Chunk, ChunkFeed, ChunkKind, HarvestJob, JobRunner, RecheckJob, RunOutcome, RunSummary,
    SyncJob,
};
pub use lock::RunLock;
pub use records::{BibRecord, RecordStore};
pub use scheduler::{HoursGate, JobSchedule, Scheduler};
pub use source::{
    FailureType, PageResult, RetryPolicy, SourceAdapter, SourceError, SourceRecord, build_registry,
};
pub use txn::{Propagation, TxScope, UnitOutcome};
