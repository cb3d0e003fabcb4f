//! Revision detection.
//!
//! Classifies an incoming batch's digest against the manifest's recorded
//! digest for the same partition. The classification alone never mutates
//! state; the runner acts on it (skip downstream on IDENTICAL, supersede and
//! re-run from NORMALIZE on REVISION).

use serde::{Deserialize, Serialize};

/// How an incoming batch relates to the partition's recorded history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchClass {
    /// No prior successful RAW entry exists for the partition.
    New,
    /// Digest matches the prior successful entry exactly; the run is a no-op
    /// unless explicitly forced.
    Identical,
    /// Digest differs: a late revision of the source file. Prior
    /// NORMALIZE/CALC entries are superseded and recomputed.
    Revision,
}

impl BatchClass {
    pub fn label(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Identical => "IDENTICAL",
            Self::Revision => "REVISION",
        }
    }
}

impl std::fmt::Display for BatchClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Classify an incoming digest against the prior successful RAW digest.
pub fn classify(prior_digest: Option<&str>, incoming_digest: &str) -> BatchClass {
    match prior_digest {
        None => BatchClass::New,
        Some(prior) if prior == incoming_digest => BatchClass::Identical,
        Some(_) => BatchClass::Revision,
    }
}

/// Whether downstream stages should run for this classification.
///
/// IDENTICAL short-circuits unless `force` is set; force exists so a
/// downstream bug fix can be recomputed over unchanged source data.
pub fn should_run_downstream(class: BatchClass, force: bool) -> bool {
    match class {
        BatchClass::New | BatchClass::Revision => true,
        BatchClass::Identical => force,
    }
}
