//! Manifest: durable registry of partitions and per-stage completion state.
//!
//! The manifest is the source of truth for "what exists and what has run".
//! One latest row per `(partition, stage)` plus an append-only attempts log,
//! so every processing attempt stays inspectable. Transitions are
//! append-or-update; nothing is deleted.
//!
//! # Mutual exclusion
//!
//! At most one entry may be RUNNING per `(partition, stage)`. The transition
//! into RUNNING is a check-then-write executed while holding the store's
//! connection mutex, which makes it an atomic compare-and-set: a second
//! batch racing into the same stage observes the first batch's RUNNING row
//! and is rejected with [`StoreError::ConcurrentRunConflict`], with no state
//! change.

use crate::pipeline::partition::{Partition, Tier};
use crate::pipeline::store::{
    decode_ts, decode_ts_opt, decode_week, encode_ts, encode_week, Db, StoreError,
};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// One step of the fixed pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    Raw,
    Normalize,
    Calc,
}

impl Stage {
    /// Pipeline order.
    pub const ORDER: [Stage; 3] = [Stage::Raw, Stage::Normalize, Stage::Calc];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Raw => "RAW",
            Self::Normalize => "NORMALIZE",
            Self::Calc => "CALC",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "RAW" => Some(Self::Raw),
            "NORMALIZE" => Some(Self::Normalize),
            "CALC" => Some(Self::Calc),
            _ => None,
        }
    }

    /// The stage this one consumes output from, if any.
    pub fn upstream(&self) -> Option<Stage> {
        match self {
            Self::Raw => None,
            Self::Normalize => Some(Self::Raw),
            Self::Calc => Some(Self::Normalize),
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Processing state of a stage for one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// A later revision of the source data replaced the batch this entry was
    /// computed from. The entry is kept, never deleted.
    Superseded,
}

impl StageStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Superseded => "SUPERSEDED",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            "SUPERSEDED" => Some(Self::Superseded),
            _ => None,
        }
    }

    /// Terminal for a given batch attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Superseded)
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Latest manifest state for one `(partition, stage)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub partition: Partition,
    pub stage: Stage,
    pub status: StageStatus,
    pub record_count: u64,
    /// Digest over the fingerprint set of records this stage produced.
    pub digest: Option<String>,
    /// Digest of the upstream stage's output this entry was computed from.
    /// An entry is current only while this matches the upstream stage's
    /// latest SUCCEEDED digest.
    pub upstream_digest: Option<String>,
    pub batch_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
}

/// Durable manifest store.
#[derive(Clone)]
pub struct ManifestStore {
    db: Db,
}

impl ManifestStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Transition a stage's status for a partition.
    ///
    /// Entering RUNNING is guarded: if the latest entry for the same
    /// `(partition, stage)` is RUNNING under a different batch id, the call
    /// fails with `ConcurrentRunConflict` and changes nothing. All other
    /// transitions replace the latest row and append to the attempts log.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_entry(
        &self,
        partition: &Partition,
        stage: Stage,
        status: StageStatus,
        record_count: u64,
        digest: Option<&str>,
        upstream_digest: Option<&str>,
        batch_id: &str,
    ) -> Result<ManifestEntry, StoreError> {
        // Guard scope: the connection lock must be released before the
        // read-back below re-locks it.
        {
            let mut conn = self.db.lock();
            let tx = conn.transaction()?;

            let existing: Option<(String, String)> = tx
                .query_row(
                    "SELECT status, batch_id FROM manifest_entries
                     WHERE domain = ?1 AND week_ending = ?2 AND tier = ?3 AND stage = ?4",
                    params![
                        partition.domain,
                        encode_week(partition.week_ending),
                        partition.tier.label(),
                        stage.label(),
                    ],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            if status == StageStatus::Running {
                if let Some((prev_status, prev_batch)) = &existing {
                    if prev_status == StageStatus::Running.label() && prev_batch != batch_id {
                        return Err(StoreError::ConcurrentRunConflict {
                            partition_key: partition.partition_key(),
                            stage: stage.label().to_string(),
                            running_batch_id: prev_batch.clone(),
                        });
                    }
                }
            }

            let now = Utc::now();
            let completed_at = status.is_terminal().then_some(now);
            let heartbeat_at = (status == StageStatus::Running).then_some(now);

            tx.execute(
                "INSERT INTO manifest_entries
                    (domain, week_ending, tier, stage, status, record_count, digest,
                     upstream_digest, batch_id, started_at, completed_at, heartbeat_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(domain, week_ending, tier, stage) DO UPDATE SET
                    status          = excluded.status,
                    record_count    = excluded.record_count,
                    digest          = excluded.digest,
                    upstream_digest = excluded.upstream_digest,
                    batch_id        = excluded.batch_id,
                    started_at      = CASE WHEN excluded.status = 'RUNNING'
                                           THEN excluded.started_at
                                           ELSE manifest_entries.started_at END,
                    completed_at    = excluded.completed_at,
                    heartbeat_at    = excluded.heartbeat_at",
                params![
                    partition.domain,
                    encode_week(partition.week_ending),
                    partition.tier.label(),
                    stage.label(),
                    status.label(),
                    record_count as i64,
                    digest,
                    upstream_digest,
                    batch_id,
                    encode_ts(now),
                    completed_at.map(encode_ts),
                    heartbeat_at.map(encode_ts),
                ],
            )?;

            append_attempt(
                &tx,
                partition,
                stage,
                status,
                record_count,
                digest,
                upstream_digest,
                batch_id,
                now,
            )?;

            tx.commit()?;
        }
        debug!(
            partition = %partition.partition_key(),
            stage = %stage,
            status = %status,
            batch = batch_id,
            "manifest transition"
        );

        let entry = self.get_entry(partition, stage)?.ok_or_else(|| {
            StoreError::NotFound(format!("manifest entry {} {}", partition, stage))
        })?;
        Ok(entry)
    }

    /// Latest entry for one `(partition, stage)`.
    pub fn get_entry(
        &self,
        partition: &Partition,
        stage: Stage,
    ) -> Result<Option<ManifestEntry>, StoreError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT domain, week_ending, tier, stage, status, record_count, digest,
                    upstream_digest, batch_id, started_at, completed_at, heartbeat_at
             FROM manifest_entries
             WHERE domain = ?1 AND week_ending = ?2 AND tier = ?3 AND stage = ?4",
        )?;
        let row = stmt
            .query_row(
                params![
                    partition.domain,
                    encode_week(partition.week_ending),
                    partition.tier.label(),
                    stage.label(),
                ],
                map_entry_row,
            )
            .optional()?;
        row.map(decode_entry).transpose()
    }

    /// Latest entry per stage, in pipeline order. Stages never attempted are
    /// simply absent.
    pub fn get_stage_chain(&self, partition: &Partition) -> Result<Vec<ManifestEntry>, StoreError> {
        let mut chain = Vec::new();
        for stage in Stage::ORDER {
            if let Some(entry) = self.get_entry(partition, stage)? {
                chain.push(entry);
            }
        }
        Ok(chain)
    }

    /// Partitions with any manifest row, for gap detection.
    pub fn list_partitions(
        &self,
        domain: &str,
        week_range: (NaiveDate, NaiveDate),
        tiers: &[Tier],
    ) -> Result<BTreeSet<Partition>, StoreError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT week_ending, tier FROM manifest_entries
             WHERE domain = ?1 AND week_ending >= ?2 AND week_ending <= ?3",
        )?;
        let rows = stmt.query_map(
            params![
                domain,
                encode_week(week_range.0),
                encode_week(week_range.1)
            ],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )?;
        let mut partitions = BTreeSet::new();
        for row in rows {
            let (week, tier_label) = row?;
            let tier = Tier::parse(&tier_label)
                .ok_or_else(|| StoreError::Corrupt(format!("tier '{}'", tier_label)))?;
            if tiers.contains(&tier) {
                partitions.insert(Partition::new(domain, decode_week(&week)?, tier));
            }
        }
        Ok(partitions)
    }

    /// Refresh the heartbeat on the RUNNING entry owned by `batch_id`.
    ///
    /// A no-op when the entry is not RUNNING or belongs to another batch;
    /// only the reaper may take a stage away from its owner.
    pub fn heartbeat(
        &self,
        partition: &Partition,
        stage: Stage,
        batch_id: &str,
    ) -> Result<(), StoreError> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE manifest_entries SET heartbeat_at = ?1
             WHERE domain = ?2 AND week_ending = ?3 AND tier = ?4 AND stage = ?5
               AND status = 'RUNNING' AND batch_id = ?6",
            params![
                encode_ts(Utc::now()),
                partition.domain,
                encode_week(partition.week_ending),
                partition.tier.label(),
                stage.label(),
                batch_id,
            ],
        )?;
        Ok(())
    }

    /// Reclassify RUNNING entries whose heartbeat is older than `staleness`
    /// to FAILED. Returns the reaped entries. Only this reaper may force a
    /// RUNNING entry out from under its batch; concurrent run attempts never
    /// do.
    pub fn reap_stale(&self, staleness: Duration) -> Result<Vec<ManifestEntry>, StoreError> {
        let cutoff = Utc::now() - staleness;
        let stale: Vec<ManifestEntry> = {
            let conn = self.db.lock();
            let mut stmt = conn.prepare(
                "SELECT domain, week_ending, tier, stage, status, record_count, digest,
                        upstream_digest, batch_id, started_at, completed_at, heartbeat_at
                 FROM manifest_entries
                 WHERE status = 'RUNNING' AND heartbeat_at < ?1",
            )?;
            let rows = stmt.query_map(params![encode_ts(cutoff)], map_entry_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .map(decode_entry)
                .collect::<Result<Vec<_>, _>>()?
        };

        let mut reaped = Vec::new();
        for entry in stale {
            warn!(
                partition = %entry.partition.partition_key(),
                stage = %entry.stage,
                batch = %entry.batch_id,
                "reaping stale RUNNING entry"
            );
            let reaped_entry = self.upsert_entry(
                &entry.partition,
                entry.stage,
                StageStatus::Failed,
                entry.record_count,
                entry.digest.as_deref(),
                entry.upstream_digest.as_deref(),
                &entry.batch_id,
            )?;
            reaped.push(reaped_entry);
        }
        if !reaped.is_empty() {
            info!(count = reaped.len(), "reaped stale running entries");
        }
        Ok(reaped)
    }

    /// Flip prior SUCCEEDED entries for the given stages to SUPERSEDED when a
    /// revision batch arrives. Entries already failed or running are left
    /// alone; supersession only ever replaces a success.
    pub fn mark_superseded(
        &self,
        partition: &Partition,
        stages: &[Stage],
        revising_batch_id: &str,
    ) -> Result<usize, StoreError> {
        let mut superseded = 0;
        for &stage in stages {
            let Some(entry) = self.get_entry(partition, stage)? else {
                continue;
            };
            if entry.status != StageStatus::Succeeded {
                continue;
            }
            info!(
                partition = %partition.partition_key(),
                stage = %stage,
                old_batch = %entry.batch_id,
                new_batch = revising_batch_id,
                "marking stage superseded by revision"
            );
            self.upsert_entry(
                partition,
                stage,
                StageStatus::Superseded,
                entry.record_count,
                entry.digest.as_deref(),
                entry.upstream_digest.as_deref(),
                &entry.batch_id,
            )?;
            superseded += 1;
        }
        Ok(superseded)
    }

    /// Full attempt history for a partition, oldest first.
    pub fn attempts(&self, partition: &Partition) -> Result<Vec<AttemptRow>, StoreError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, stage, status, record_count, digest, batch_id, recorded_at
             FROM manifest_attempts
             WHERE domain = ?1 AND week_ending = ?2 AND tier = ?3
             ORDER BY id",
        )?;
        let rows = stmt.query_map(
            params![
                partition.domain,
                encode_week(partition.week_ending),
                partition.tier.label(),
            ],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            },
        )?;
        let mut attempts = Vec::new();
        for row in rows {
            let (id, stage, status, record_count, digest, batch_id, recorded_at) = row?;
            attempts.push(AttemptRow {
                id,
                stage: Stage::parse(&stage)
                    .ok_or_else(|| StoreError::Corrupt(format!("stage '{}'", stage)))?,
                status: StageStatus::parse(&status)
                    .ok_or_else(|| StoreError::Corrupt(format!("status '{}'", status)))?,
                record_count: record_count as u64,
                digest,
                batch_id,
                recorded_at: decode_ts(&recorded_at)?,
            });
        }
        Ok(attempts)
    }
}

/// One row of the append-only attempts log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRow {
    pub id: i64,
    pub stage: Stage,
    pub status: StageStatus,
    pub record_count: u64,
    pub digest: Option<String>,
    pub batch_id: String,
    pub recorded_at: DateTime<Utc>,
}

#[allow(clippy::too_many_arguments)]
fn append_attempt(
    conn: &Connection,
    partition: &Partition,
    stage: Stage,
    status: StageStatus,
    record_count: u64,
    digest: Option<&str>,
    upstream_digest: Option<&str>,
    batch_id: &str,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO manifest_attempts
            (domain, week_ending, tier, stage, status, record_count, digest,
             upstream_digest, batch_id, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            partition.domain,
            encode_week(partition.week_ending),
            partition.tier.label(),
            stage.label(),
            status.label(),
            record_count as i64,
            digest,
            upstream_digest,
            batch_id,
            encode_ts(now),
        ],
    )?;
    Ok(())
}

type RawEntryRow = (
    String,
    String,
    String,
    String,
    String,
    i64,
    Option<String>,
    Option<String>,
    String,
    String,
    Option<String>,
    Option<String>,
);

fn map_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEntryRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
    ))
}

fn decode_entry(raw: RawEntryRow) -> Result<ManifestEntry, StoreError> {
    let (
        domain,
        week,
        tier,
        stage,
        status,
        record_count,
        digest,
        upstream_digest,
        batch_id,
        started_at,
        completed_at,
        heartbeat_at,
    ) = raw;
    Ok(ManifestEntry {
        partition: Partition::new(
            domain,
            decode_week(&week)?,
            Tier::parse(&tier).ok_or_else(|| StoreError::Corrupt(format!("tier '{}'", tier)))?,
        ),
        stage: Stage::parse(&stage)
            .ok_or_else(|| StoreError::Corrupt(format!("stage '{}'", stage)))?,
        status: StageStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("status '{}'", status)))?,
        record_count: record_count as u64,
        digest,
        upstream_digest,
        batch_id,
        started_at: decode_ts(&started_at)?,
        completed_at: decode_ts_opt(completed_at)?,
        heartbeat_at: decode_ts_opt(heartbeat_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition() -> Partition {
        Partition::otc("2026-01-09".parse().unwrap(), Tier::NmsTier1)
    }

    fn store() -> ManifestStore {
        ManifestStore::new(Db::in_memory().unwrap())
    }

    #[test]
    fn test_running_conflict_rejected_for_other_batch() {
        let m = store();
        let p = partition();
        m.upsert_entry(&p, Stage::Raw, StageStatus::Running, 0, None, None, "batch-a")
            .unwrap();

        let err = m
            .upsert_entry(&p, Stage::Raw, StageStatus::Running, 0, None, None, "batch-b")
            .unwrap_err();
        match err {
            StoreError::ConcurrentRunConflict {
                running_batch_id, ..
            } => assert_eq!(running_batch_id, "batch-a"),
            other => panic!("expected ConcurrentRunConflict, got {:?}", other),
        }

        // The owner itself may re-assert RUNNING (heartbeat path).
        m.upsert_entry(&p, Stage::Raw, StageStatus::Running, 0, None, None, "batch-a")
            .unwrap();
    }

    #[test]
    fn test_conflict_leaves_state_unchanged() {
        let m = store();
        let p = partition();
        m.upsert_entry(&p, Stage::Raw, StageStatus::Running, 0, None, None, "batch-a")
            .unwrap();
        let _ = m.upsert_entry(&p, Stage::Raw, StageStatus::Running, 0, None, None, "batch-b");

        let entry = m.get_entry(&p, Stage::Raw).unwrap().unwrap();
        assert_eq!(entry.batch_id, "batch-a");
        assert_eq!(entry.status, StageStatus::Running);
        // No attempt row was appended for the rejected batch.
        let attempts = m.attempts(&p).unwrap();
        assert!(attempts.iter().all(|a| a.batch_id == "batch-a"));
    }

    #[test]
    fn test_different_stage_does_not_conflict() {
        let m = store();
        let p = partition();
        m.upsert_entry(&p, Stage::Raw, StageStatus::Running, 0, None, None, "batch-a")
            .unwrap();
        m.upsert_entry(&p, Stage::Normalize, StageStatus::Running, 0, None, None, "batch-b")
            .unwrap();
    }

    #[test]
    fn test_stage_chain_in_pipeline_order() {
        let m = store();
        let p = partition();
        m.upsert_entry(&p, Stage::Calc, StageStatus::Pending, 0, None, None, "b")
            .unwrap();
        m.upsert_entry(&p, Stage::Raw, StageStatus::Succeeded, 10, Some("d1"), None, "b")
            .unwrap();

        let chain = m.get_stage_chain(&p).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].stage, Stage::Raw);
        assert_eq!(chain[1].stage, Stage::Calc);
    }

    #[test]
    fn test_attempt_history_is_append_only() {
        let m = store();
        let p = partition();
        m.upsert_entry(&p, Stage::Raw, StageStatus::Running, 0, None, None, "b1")
            .unwrap();
        m.upsert_entry(&p, Stage::Raw, StageStatus::Succeeded, 5, Some("d1"), None, "b1")
            .unwrap();
        m.upsert_entry(&p, Stage::Raw, StageStatus::Running, 0, None, None, "b2")
            .unwrap();
        m.upsert_entry(&p, Stage::Raw, StageStatus::Failed, 0, None, None, "b2")
            .unwrap();

        let attempts = m.attempts(&p).unwrap();
        let statuses: Vec<StageStatus> = attempts.iter().map(|a| a.status).collect();
        assert_eq!(
            statuses,
            vec![
                StageStatus::Running,
                StageStatus::Succeeded,
                StageStatus::Running,
                StageStatus::Failed
            ]
        );
        // Latest row reflects the last attempt only.
        let entry = m.get_entry(&p, Stage::Raw).unwrap().unwrap();
        assert_eq!(entry.status, StageStatus::Failed);
        assert_eq!(entry.batch_id, "b2");
    }

    #[test]
    fn test_list_partitions_filters_by_range_and_tier() {
        let m = store();
        let w1: NaiveDate = "2026-01-02".parse().unwrap();
        let w2: NaiveDate = "2026-01-09".parse().unwrap();
        for (week, tier) in [(w1, Tier::NmsTier1), (w2, Tier::NmsTier1), (w2, Tier::Otce)] {
            let p = Partition::otc(week, tier);
            m.upsert_entry(&p, Stage::Raw, StageStatus::Succeeded, 1, Some("d"), None, "b")
                .unwrap();
        }

        let found = m
            .list_partitions(
                crate::pipeline::partition::OTC_TRANSPARENCY_DOMAIN,
                (w2, w2),
                &[Tier::NmsTier1],
            )
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found.iter().next().unwrap().week_ending, w2);
    }

    #[test]
    fn test_mark_superseded_only_touches_succeeded() {
        let m = store();
        let p = partition();
        m.upsert_entry(&p, Stage::Normalize, StageStatus::Succeeded, 5, Some("d"), Some("r"), "b1")
            .unwrap();
        m.upsert_entry(&p, Stage::Calc, StageStatus::Failed, 0, None, None, "b1")
            .unwrap();

        let n = m
            .mark_superseded(&p, &[Stage::Normalize, Stage::Calc], "b2")
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(
            m.get_entry(&p, Stage::Normalize).unwrap().unwrap().status,
            StageStatus::Superseded
        );
        assert_eq!(
            m.get_entry(&p, Stage::Calc).unwrap().unwrap().status,
            StageStatus::Failed
        );
    }

    #[test]
    fn test_reap_stale_skips_fresh_heartbeats() {
        let m = store();
        let p = partition();
        m.upsert_entry(&p, Stage::Raw, StageStatus::Running, 0, None, None, "b1")
            .unwrap();

        // Entry was just started; a generous threshold reaps nothing.
        let reaped = m.reap_stale(Duration::minutes(30)).unwrap();
        assert!(reaped.is_empty());

        // Zero threshold treats the current heartbeat as stale.
        let reaped = m.reap_stale(Duration::seconds(-1)).unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(
            m.get_entry(&p, Stage::Raw).unwrap().unwrap().status,
            StageStatus::Failed
        );
    }

    #[test]
    fn test_upstream_ordering() {
        assert_eq!(Stage::Raw.upstream(), None);
        assert_eq!(Stage::Normalize.upstream(), Some(Stage::Raw));
        assert_eq!(Stage::Calc.upstream(), Some(Stage::Normalize));
    }
}
