//! Readiness: the single authoritative "is this partition safe to read"
//! signal.
//!
//! A readiness verdict is a pure derivation of manifest state + anomaly state
//! under an injectable policy. The cached [`ReadinessRecord`] is a projection:
//! it may be recomputed at any time and is never the sole source of truth.
//! Manual overrides exist for operational remediation, but they are audited
//! writes with a state stamp, and they expire automatically as soon as the
//! partition's underlying state changes.

use crate::pipeline::anomaly::{AnomalyStore, Severity};
use crate::pipeline::manifest::{ManifestStore, Stage, StageStatus};
use crate::pipeline::partition::Partition;
use crate::pipeline::store::{decode_ts, encode_ts, encode_week, Db, StoreError};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

/// Completeness policy for readiness evaluation. Injectable configuration:
/// which stages must have succeeded, how much trailing history calculations
/// need, and which anomaly severity blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessPolicy {
    /// Stages that must be SUCCEEDED, in pipeline order.
    pub require_stages: Vec<Stage>,
    /// Consecutive prior weeks whose CALC stage must have SUCCEEDED before
    /// the current week counts as present. Zero disables the gate.
    pub min_trailing_weeks: u32,
    /// Minimum unresolved anomaly severity that blocks readiness.
    pub blocking_severity: Severity,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            require_stages: Stage::ORDER.to_vec(),
            min_trailing_weeks: 0,
            blocking_severity: Severity::Critical,
        }
    }
}

/// Derived readiness verdict for one partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessRecord {
    pub partition: Partition,
    pub is_ready: bool,
    pub all_partitions_present: bool,
    pub all_stages_complete: bool,
    pub no_critical_anomalies: bool,
    /// Every failing sub-condition's reason, never just the first.
    pub blocking_issues: Vec<String>,
    /// True when a manual override pinned the verdict.
    pub overridden: bool,
    pub updated_at: DateTime<Utc>,
}

impl ReadinessRecord {
    /// Human-readable concatenation of the blocking issues.
    pub fn blocking_summary(&self) -> String {
        self.blocking_issues.join("; ")
    }
}

/// One audited manual override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideRow {
    pub id: i64,
    pub is_ready: bool,
    pub operator: String,
    pub note: String,
    pub state_stamp: String,
    pub applied_at: DateTime<Utc>,
    pub expired_at: Option<DateTime<Utc>>,
}

/// Evaluates and caches readiness.
#[derive(Clone)]
pub struct ReadinessEvaluator {
    db: Db,
    manifest: ManifestStore,
    anomalies: AnomalyStore,
}

impl ReadinessEvaluator {
    pub fn new(db: Db, manifest: ManifestStore, anomalies: AnomalyStore) -> Self {
        Self {
            db,
            manifest,
            anomalies,
        }
    }

    /// Pure evaluation: reads manifest + anomaly state, writes nothing.
    /// Recomputing twice without intervening writes yields an identical
    /// verdict.
    pub fn evaluate(
        &self,
        partition: &Partition,
        policy: &ReadinessPolicy,
    ) -> Result<ReadinessRecord, StoreError> {
        let mut issues = Vec::new();

        // Every required stage's latest entry must be SUCCEEDED and current
        // with respect to its upstream digest. SUPERSEDED-without-replacement
        // shows up here as a non-SUCCEEDED latest entry.
        let mut all_stages_complete = true;
        for &stage in &policy.require_stages {
            match self.manifest.get_entry(partition, stage)? {
                None => {
                    all_stages_complete = false;
                    issues.push(format!("stage {} has not run", stage));
                }
                Some(entry) => match entry.status {
                    StageStatus::Succeeded => {
                        if let Some(upstream) = stage.upstream() {
                            let upstream_digest = self
                                .manifest
                                .get_entry(partition, upstream)?
                                .filter(|e| e.status == StageStatus::Succeeded)
                                .and_then(|e| e.digest);
                            if upstream_digest.is_some()
                                && entry.upstream_digest != upstream_digest
                            {
                                all_stages_complete = false;
                                issues.push(format!(
                                    "stage {} is stale relative to a newer {} revision",
                                    stage, upstream
                                ));
                            }
                        }
                    }
                    StageStatus::Superseded => {
                        all_stages_complete = false;
                        issues.push(format!(
                            "stage {} was superseded by a revision and has not been recomputed",
                            stage
                        ));
                    }
                    status => {
                        all_stages_complete = false;
                        issues.push(format!("stage {} latest attempt is {}", stage, status));
                    }
                },
            }
        }

        // Trailing-history completeness gate.
        let mut missing_weeks = Vec::new();
        for n in 1..=policy.min_trailing_weeks {
            let prior = partition.weeks_back(n);
            let calc_ok = self
                .manifest
                .get_entry(&prior, Stage::Calc)?
                .map(|e| e.status == StageStatus::Succeeded)
                .unwrap_or(false);
            if !calc_ok {
                missing_weeks.push(prior.week_ending.to_string());
            }
        }
        let all_partitions_present = missing_weeks.is_empty();
        if !all_partitions_present {
            issues.push(format!(
                "insufficient trailing history: missing weeks {}",
                missing_weeks.join(", ")
            ));
        }

        // Unresolved anomalies at or above the blocking severity.
        let blocking = self
            .anomalies
            .unresolved(partition, policy.blocking_severity)?;
        let no_critical_anomalies = blocking.is_empty();
        if !no_critical_anomalies {
            for anomaly in &blocking {
                issues.push(format!(
                    "unresolved {} {} anomaly at {}: {}",
                    anomaly.severity, anomaly.category, anomaly.stage, anomaly.message
                ));
            }
        }

        let is_ready = all_stages_complete && all_partitions_present && no_critical_anomalies;
        Ok(ReadinessRecord {
            partition: partition.clone(),
            is_ready,
            all_partitions_present,
            all_stages_complete,
            no_critical_anomalies,
            blocking_issues: issues,
            overridden: false,
            updated_at: Utc::now(),
        })
    }

    /// Stamp of the partition's underlying manifest + anomaly state. An
    /// override stays valid only while this stamp is unchanged. Batch ids are
    /// excluded: an IDENTICAL re-ingest tracks a new attempt without changing
    /// the underlying state, and must not expire an override.
    pub fn state_stamp(&self, partition: &Partition) -> Result<String, StoreError> {
        let mut hasher = Sha256::new();
        for entry in self.manifest.get_stage_chain(partition)? {
            hasher.update(entry.stage.label().as_bytes());
            hasher.update(b"|");
            hasher.update(entry.status.label().as_bytes());
            hasher.update(b"|");
            hasher.update(entry.digest.as_deref().unwrap_or("").as_bytes());
            hasher.update(b";");
        }
        for anomaly in self.anomalies.unresolved(partition, Severity::Info)? {
            hasher.update(anomaly.id.to_le_bytes());
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Recompute the cached projection, honoring a still-valid manual
    /// override and expiring one whose state stamp no longer matches.
    pub fn recompute(
        &self,
        partition: &Partition,
        policy: &ReadinessPolicy,
    ) -> Result<ReadinessRecord, StoreError> {
        let mut record = self.evaluate(partition, policy)?;

        if let Some(active) = self.active_override(partition)? {
            let stamp = self.state_stamp(partition)?;
            if active.state_stamp == stamp {
                record.overridden = true;
                record.is_ready = active.is_ready;
                record.blocking_issues.push(format!(
                    "readiness manually overridden to {} by {}: {}",
                    active.is_ready, active.operator, active.note
                ));
            } else {
                // Underlying state changed; the override no longer applies.
                self.expire_override(active.id)?;
                info!(
                    partition = %partition.partition_key(),
                    override_id = active.id,
                    "readiness override expired after state change"
                );
            }
        }

        self.write_cache(&record)?;
        debug!(
            partition = %partition.partition_key(),
            is_ready = record.is_ready,
            "readiness recomputed"
        );
        Ok(record)
    }

    /// Cached verdict, recomputing on a cache miss.
    pub fn get_readiness(
        &self,
        partition: &Partition,
        policy: &ReadinessPolicy,
    ) -> Result<ReadinessRecord, StoreError> {
        if let Some(record) = self.read_cache(partition)? {
            return Ok(record);
        }
        self.recompute(partition, policy)
    }

    /// Manually pin a partition's readiness verdict. Recorded as an audit
    /// event, never a silent mutation; the pin drops automatically when the
    /// partition's manifest or anomaly state next changes.
    pub fn override_readiness(
        &self,
        partition: &Partition,
        is_ready: bool,
        operator: impl Into<String>,
        note: impl Into<String>,
        policy: &ReadinessPolicy,
    ) -> Result<ReadinessRecord, StoreError> {
        let operator = operator.into();
        let note = note.into();
        let stamp = self.state_stamp(partition)?;

        {
            let conn = self.db.lock();
            // A new override supersedes any active one; keep both in the
            // audit trail.
            conn.execute(
                "UPDATE readiness_overrides SET expired_at = ?1
                 WHERE domain = ?2 AND week_ending = ?3 AND tier = ?4 AND expired_at IS NULL",
                params![
                    encode_ts(Utc::now()),
                    partition.domain,
                    encode_week(partition.week_ending),
                    partition.tier.label(),
                ],
            )?;
            conn.execute(
                "INSERT INTO readiness_overrides
                    (domain, week_ending, tier, is_ready, operator, note, state_stamp, applied_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    partition.domain,
                    encode_week(partition.week_ending),
                    partition.tier.label(),
                    is_ready,
                    operator,
                    note,
                    stamp,
                    encode_ts(Utc::now()),
                ],
            )?;
        }
        info!(
            partition = %partition.partition_key(),
            is_ready,
            operator = %operator,
            "readiness override applied"
        );
        self.recompute(partition, policy)
    }

    /// Audit trail of overrides for a partition, oldest first.
    pub fn overrides(&self, partition: &Partition) -> Result<Vec<OverrideRow>, StoreError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, is_ready, operator, note, state_stamp, applied_at, expired_at
             FROM readiness_overrides
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
                    row.get::<_, bool>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            },
        )?;
        let mut overrides = Vec::new();
        for row in rows {
            let (id, is_ready, operator, note, state_stamp, applied_at, expired_at) = row?;
            overrides.push(OverrideRow {
                id,
                is_ready,
                operator,
                note,
                state_stamp,
                applied_at: decode_ts(&applied_at)?,
                expired_at: expired_at.map(|s| decode_ts(&s)).transpose()?,
            });
        }
        Ok(overrides)
    }

    fn active_override(&self, partition: &Partition) -> Result<Option<OverrideRow>, StoreError> {
        Ok(self
            .overrides(partition)?
            .into_iter()
            .rev()
            .find(|o| o.expired_at.is_none()))
    }

    fn expire_override(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE readiness_overrides SET expired_at = ?1 WHERE id = ?2",
            params![encode_ts(Utc::now()), id],
        )?;
        Ok(())
    }

    fn write_cache(&self, record: &ReadinessRecord) -> Result<(), StoreError> {
        let issues = serde_json::to_string(&record.blocking_issues)?;
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO readiness_cache
                (domain, week_ending, tier, is_ready, all_partitions_present,
                 all_stages_complete, no_critical_anomalies, blocking_issues,
                 overridden, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(domain, week_ending, tier) DO UPDATE SET
                is_ready               = excluded.is_ready,
                all_partitions_present = excluded.all_partitions_present,
                all_stages_complete    = excluded.all_stages_complete,
                no_critical_anomalies  = excluded.no_critical_anomalies,
                blocking_issues        = excluded.blocking_issues,
                overridden             = excluded.overridden,
                updated_at             = excluded.updated_at",
            params![
                record.partition.domain,
                encode_week(record.partition.week_ending),
                record.partition.tier.label(),
                record.is_ready,
                record.all_partitions_present,
                record.all_stages_complete,
                record.no_critical_anomalies,
                issues,
                record.overridden,
                encode_ts(record.updated_at),
            ],
        )?;
        Ok(())
    }

    fn read_cache(&self, partition: &Partition) -> Result<Option<ReadinessRecord>, StoreError> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                "SELECT is_ready, all_partitions_present, all_stages_complete,
                        no_critical_anomalies, blocking_issues, overridden, updated_at
                 FROM readiness_cache
                 WHERE domain = ?1 AND week_ending = ?2 AND tier = ?3",
                params![
                    partition.domain,
                    encode_week(partition.week_ending),
                    partition.tier.label(),
                ],
                |row| {
                    Ok((
                        row.get::<_, bool>(0)?,
                        row.get::<_, bool>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, bool>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, bool>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;
        let Some((
            is_ready,
            all_partitions_present,
            all_stages_complete,
            no_critical_anomalies,
            issues,
            overridden,
            updated_at,
        )) = row
        else {
            return Ok(None);
        };
        Ok(Some(ReadinessRecord {
            partition: partition.clone(),
            is_ready,
            all_partitions_present,
            all_stages_complete,
            no_critical_anomalies,
            blocking_issues: serde_json::from_str(&issues)?,
            overridden,
            updated_at: decode_ts(&updated_at)?,
        }))
    }
}
