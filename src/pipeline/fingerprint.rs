//! Content identity for ingested records.
//!
//! Every raw record gets a deterministic SHA-256 fingerprint over its semantic
//! fields, stable across re-serialization and ingestion batches. Fingerprints
//! serve two purposes:
//!
//! 1. Store-level de-duplication: re-ingesting an identical source file is a
//!    counted no-op, enforced by a UNIQUE index on the fingerprint column.
//! 2. Revision comparison: a batch digest over the sorted fingerprint set
//!    gives O(1) equality between the incoming batch and the last recorded
//!    one, independent of row order in the source file.

use crate::pipeline::partition::Partition;
use crate::pipeline::records::RawRecord;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Fingerprint format version, mixed into every hash. Bump when the canonical
/// field set changes so old and new fingerprints can never collide silently.
pub const FINGERPRINT_VERSION: &str = "OTCFP_V1";

/// SHA-256 fingerprint of one record's semantic content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordFingerprint([u8; 32]);

impl RecordFingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex encoding used for storage and logging.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl std::fmt::Display for RecordFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Fingerprint a raw record's semantic fields.
///
/// Canonical field order: version, domain, week, tier, symbol, venue, share
/// volume, trade count. Ingestion metadata (source row number, batch id,
/// timestamps) is deliberately excluded: identical semantic content must hash
/// identically regardless of when or how it arrived.
pub fn record_fingerprint(partition: &Partition, record: &RawRecord) -> RecordFingerprint {
    let mut hasher = Sha256::new();
    hasher.update(FINGERPRINT_VERSION.as_bytes());
    hasher.update(b"|");
    hasher.update(partition.domain.as_bytes());
    hasher.update(b"|");
    hasher.update(partition.week_ending.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(partition.tier.label().as_bytes());
    hasher.update(b"|");
    hasher.update(record.symbol.as_bytes());
    hasher.update(b"|");
    hasher.update(record.venue.as_bytes());
    hasher.update(b"|");
    hasher.update(record.share_volume.to_le_bytes());
    hasher.update(record.trade_count.to_le_bytes());
    RecordFingerprint(hasher.finalize().into())
}

/// Digest over a whole batch's fingerprint set.
///
/// Hex SHA-256 over the lexicographically sorted fingerprints, so equality is
/// order-independent: two source files with the same rows in different order
/// produce the same digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchDigest {
    hex: String,
    record_count: u64,
}

impl BatchDigest {
    pub fn as_hex(&self) -> &str {
        &self.hex
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }
}

impl std::fmt::Display for BatchDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hex)
    }
}

/// Accumulates record fingerprints into a [`BatchDigest`].
#[derive(Debug, Default)]
pub struct DigestBuilder {
    fingerprints: BTreeSet<RecordFingerprint>,
}

impl DigestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one record fingerprint. Duplicate fingerprints collapse, matching
    /// the store-level de-duplication semantics.
    pub fn add(&mut self, fp: RecordFingerprint) {
        self.fingerprints.insert(fp);
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }

    pub fn build(self) -> BatchDigest {
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_VERSION.as_bytes());
        for fp in &self.fingerprints {
            hasher.update(fp.as_bytes());
        }
        BatchDigest {
            hex: hex::encode(hasher.finalize()),
            record_count: self.fingerprints.len() as u64,
        }
    }
}

/// Digest a slice of records for a partition in one call.
pub fn batch_digest(partition: &Partition, records: &[RawRecord]) -> BatchDigest {
    let mut builder = DigestBuilder::new();
    for record in records {
        builder.add(record_fingerprint(partition, record));
    }
    builder.build()
}

fn field_fingerprint(partition: &Partition, fields: &[&[u8]]) -> RecordFingerprint {
    let mut hasher = Sha256::new();
    hasher.update(FINGERPRINT_VERSION.as_bytes());
    hasher.update(b"|");
    hasher.update(partition.domain.as_bytes());
    hasher.update(b"|");
    hasher.update(partition.week_ending.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(partition.tier.label().as_bytes());
    for field in fields {
        hasher.update(b"|");
        hasher.update(field);
    }
    RecordFingerprint(hasher.finalize().into())
}

/// Digest over a normalize stage's output rows.
pub fn normalized_digest(
    partition: &Partition,
    rows: &[crate::pipeline::records::NormalizedRow],
) -> BatchDigest {
    let mut builder = DigestBuilder::new();
    for row in rows {
        builder.add(field_fingerprint(
            partition,
            &[
                b"normalized",
                row.symbol.as_bytes(),
                row.venue.as_bytes(),
                &row.share_volume.to_le_bytes(),
                &row.trade_count.to_le_bytes(),
            ],
        ));
    }
    builder.build()
}

/// Digest over a calculate stage's output rows.
pub fn summary_digest(
    partition: &Partition,
    rows: &[crate::pipeline::records::SummaryRow],
) -> BatchDigest {
    let mut builder = DigestBuilder::new();
    for row in rows {
        builder.add(field_fingerprint(
            partition,
            &[
                b"summary",
                row.symbol.as_bytes(),
                &row.total_share_volume.to_le_bytes(),
                &row.total_trade_count.to_le_bytes(),
                &row.venue_count.to_le_bytes(),
                &row.market_share.to_le_bytes(),
            ],
        ));
    }
    builder.build()
}
