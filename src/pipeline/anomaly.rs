//! Anomaly tracking.
//!
//! Structured, severity-tagged issues discovered at any stage, keyed to a
//! partition and stage. The log is append-only and never deduplicates
//! automatically; operators resolve entries explicitly. Unresolved CRITICAL
//! anomalies are the default readiness blocker.

use crate::pipeline::manifest::Stage;
use crate::pipeline::partition::{Partition, Tier};
use crate::pipeline::store::{decode_ts, decode_ts_opt, decode_week, encode_ts, encode_week, Db, StoreError};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Anomaly severity. Ordering matters: INFO < WARNING < CRITICAL, used for
/// blocking-severity comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "INFO" => Some(Self::Info),
            "WARNING" => Some(Self::Warning),
            "CRITICAL" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Anomaly category. Open: the known variants cover the pipeline's own
/// classifications, `Other` round-trips free-form labels from operators or
/// future stages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    Fetch,
    Schema,
    Processing,
    Completeness,
    Other(String),
}

impl Category {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Fetch => "FETCH",
            Self::Schema => "SCHEMA",
            Self::Processing => "PROCESSING",
            Self::Completeness => "COMPLETENESS",
            Self::Other(label) => label,
        }
    }

    pub fn parse(label: &str) -> Self {
        match label {
            "FETCH" => Self::Fetch,
            "SCHEMA" => Self::Schema,
            "PROCESSING" => Self::Processing,
            "COMPLETENESS" => Self::Completeness,
            other => Self::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One recorded issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: i64,
    pub partition: Partition,
    pub stage: Stage,
    pub severity: Severity,
    pub category: Category,
    pub message: String,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_note: Option<String>,
}

impl Anomaly {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

/// Durable anomaly log.
#[derive(Clone)]
pub struct AnomalyStore {
    db: Db,
}

impl AnomalyStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Append a new anomaly. Never deduplicates; every detection is its own
    /// row.
    pub fn record(
        &self,
        partition: &Partition,
        stage: Stage,
        severity: Severity,
        category: Category,
        message: impl Into<String>,
    ) -> Result<Anomaly, StoreError> {
        let message = message.into();
        let now = Utc::now();
        let id = {
            let conn = self.db.lock();
            conn.execute(
                "INSERT INTO anomalies
                    (domain, week_ending, tier, stage, severity, category, message, detected_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    partition.domain,
                    encode_week(partition.week_ending),
                    partition.tier.label(),
                    stage.label(),
                    severity.label(),
                    category.as_str(),
                    message,
                    encode_ts(now),
                ],
            )?;
            conn.last_insert_rowid()
        };
        if severity >= Severity::Warning {
            warn!(
                partition = %partition.partition_key(),
                stage = %stage,
                severity = %severity,
                category = %category,
                "{}",
                message
            );
        }
        Ok(Anomaly {
            id,
            partition: partition.clone(),
            stage,
            severity,
            category,
            message,
            detected_at: now,
            resolved_at: None,
            resolution_note: None,
        })
    }

    /// Close an anomaly with an operator note.
    pub fn resolve(&self, anomaly_id: i64, note: impl Into<String>) -> Result<(), StoreError> {
        let conn = self.db.lock();
        let changed = conn.execute(
            "UPDATE anomalies SET resolved_at = ?1, resolution_note = ?2
             WHERE id = ?3 AND resolved_at IS NULL",
            params![encode_ts(Utc::now()), note.into(), anomaly_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!(
                "unresolved anomaly id {}",
                anomaly_id
            )));
        }
        Ok(())
    }

    /// Unresolved anomalies for one partition at or above `min_severity`.
    pub fn unresolved(
        &self,
        partition: &Partition,
        min_severity: Severity,
    ) -> Result<Vec<Anomaly>, StoreError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, domain, week_ending, tier, stage, severity, category, message,
                    detected_at, resolved_at, resolution_note
             FROM anomalies
             WHERE domain = ?1 AND week_ending = ?2 AND tier = ?3 AND resolved_at IS NULL
             ORDER BY id",
        )?;
        let rows = stmt.query_map(
            params![
                partition.domain,
                encode_week(partition.week_ending),
                partition.tier.label(),
            ],
            map_anomaly_row,
        )?;
        collect_filtered(rows, min_severity)
    }

    /// Unresolved anomalies across a week range, for the operational listing
    /// interface.
    pub fn unresolved_in_range(
        &self,
        domain: &str,
        week_range: (NaiveDate, NaiveDate),
        min_severity: Severity,
    ) -> Result<Vec<Anomaly>, StoreError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, domain, week_ending, tier, stage, severity, category, message,
                    detected_at, resolved_at, resolution_note
             FROM anomalies
             WHERE domain = ?1 AND week_ending >= ?2 AND week_ending <= ?3
               AND resolved_at IS NULL
             ORDER BY week_ending, id",
        )?;
        let rows = stmt.query_map(
            params![
                domain,
                encode_week(week_range.0),
                encode_week(week_range.1)
            ],
            map_anomaly_row,
        )?;
        collect_filtered(rows, min_severity)
    }
}

type RawAnomalyRow = (
    i64,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
);

fn map_anomaly_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawAnomalyRow> {
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
    ))
}

fn decode_anomaly(raw: RawAnomalyRow) -> Result<Anomaly, StoreError> {
    let (id, domain, week, tier, stage, severity, category, message, detected_at, resolved_at, note) =
        raw;
    Ok(Anomaly {
        id,
        partition: Partition::new(
            domain,
            decode_week(&week)?,
            Tier::parse(&tier).ok_or_else(|| StoreError::Corrupt(format!("tier '{}'", tier)))?,
        ),
        stage: Stage::parse(&stage)
            .ok_or_else(|| StoreError::Corrupt(format!("stage '{}'", stage)))?,
        severity: Severity::parse(&severity)
            .ok_or_else(|| StoreError::Corrupt(format!("severity '{}'", severity)))?,
        category: Category::parse(&category),
        message,
        detected_at: decode_ts(&detected_at)?,
        resolved_at: decode_ts_opt(resolved_at)?,
        resolution_note: note,
    })
}

fn collect_filtered(
    rows: impl Iterator<Item = rusqlite::Result<RawAnomalyRow>>,
    min_severity: Severity,
) -> Result<Vec<Anomaly>, StoreError> {
    let mut anomalies = Vec::new();
    for row in rows {
        let anomaly = decode_anomaly(row?)?;
        if anomaly.severity >= min_severity {
            anomalies.push(anomaly);
        }
    }
    Ok(anomalies)
}
