//! Weekly OTC transparency ingestion pipeline.
//!
//! Ingests weekly FINRA OTC transparency files into versioned partitions,
//! tracks per-stage progress in a durable manifest, detects late revisions
//! and data anomalies, and derives the readiness signal downstream consumers
//! check before trusting a partition.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        PipelineRunner                           │
//! │  (drives ingest → normalize → calculate per partition)          │
//! └─────────────────────────────────────────────────────────────────┘
//!         │                   │                     │
//!         ▼                   ▼                     ▼
//! ┌─────────────┐      ┌─────────────┐      ┌──────────────┐
//! │SourceFetcher│      │ StageLogic  │      │RevisionDetect│
//! │ (external)  │      │ (pure fns)  │      │ NEW/IDENT/REV│
//! └─────────────┘      └─────────────┘      └──────────────┘
//!         │                   │                     │
//!         └───────────┬───────┴─────────────────────┘
//!                     ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │              Durable store (SQLite, single handle)              │
//! │  manifest + attempts │ raw fingerprint index │ derived tables   │
//! │  anomaly log │ readiness cache + override audit                 │
//! └─────────────────────────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  ReadinessEvaluator — pure derivation of manifest + anomaly     │
//! │  state under an injectable completeness policy                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - **Idempotent re-runs**: byte-identical source content classifies as
//!   IDENTICAL and leaves derived tables untouched.
//! - **Auditable revisions**: a changed source file supersedes (never
//!   deletes) prior manifest entries and replaces derived rows by natural
//!   key, so no aggregate is double-counted.
//! - **Single writer per stage**: entering RUNNING is a compare-and-set in
//!   the store; a racing run is rejected with `ConcurrentRunConflict`.
//! - **Readiness is a projection**: recomputable at any time, overridable
//!   only through an audited operation that expires on state change.

pub mod anomaly;
pub mod config;
pub mod fingerprint;
pub mod manifest;
pub mod partition;
pub mod readiness;
pub mod records;
pub mod revision;
pub mod runner;
pub mod stages;
pub mod store;

#[cfg(test)]
mod runner_tests;

// Re-exports for convenience
pub use anomaly::{Anomaly, AnomalyStore, Category, Severity};
pub use config::PipelineConfig;
pub use fingerprint::{batch_digest, record_fingerprint, BatchDigest, RecordFingerprint};
pub use manifest::{ManifestEntry, ManifestStore, Stage, StageStatus};
pub use partition::{Partition, Tier, OTC_TRANSPARENCY_DOMAIN};
pub use readiness::{ReadinessEvaluator, ReadinessPolicy, ReadinessRecord};
pub use records::{NormalizedRow, RawRecord, RecordStore, SummaryRow};
pub use revision::BatchClass;
pub use runner::{PipelineRunner, RunOptions, RunOutcome, StageResult};
pub use stages::{FsSourceFetcher, SourceFetcher, SourceFile, SourceRow, StageLogic};
pub use store::{Db, StoreError};
