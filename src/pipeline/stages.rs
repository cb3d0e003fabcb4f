//! External stage interfaces.
//!
//! The pipeline core orchestrates three pieces of outside logic and records
//! their outcomes; it owns none of them:
//!
//! - a [`SourceFetcher`] that produces the weekly file's raw field rows,
//! - a normalize function over parsed raw records,
//! - a calculate function over normalized rows plus historical context.
//!
//! Normalize and calculate are pure functions. The shipped
//! [`StageLogic::standard`] implementations are the reference aggregation;
//! callers with their own formulas inject replacements.

use crate::pipeline::partition::Tier;
use crate::pipeline::records::{NormalizedRow, RawRecord, SummaryRow};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// One raw field row from a source file, before schema validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRow {
    pub row_number: u32,
    pub fields: Vec<String>,
}

/// A fetched weekly file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub source_file_id: String,
    pub rows: Vec<SourceRow>,
}

/// Upstream file missing or unreadable. Surfaced as a FETCH anomaly, not a
/// fatal pipeline error; retry is permitted on the next scheduled run.
#[derive(Debug)]
pub struct SourceUnavailable {
    pub reason: String,
}

impl std::fmt::Display for SourceUnavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "source unavailable: {}", self.reason)
    }
}

impl std::error::Error for SourceUnavailable {}

/// Raw file source. The download mechanism behind it is an external
/// collaborator; the pipeline only sees rows.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(
        &self,
        domain: &str,
        week_ending: NaiveDate,
        tier: Tier,
    ) -> Result<SourceFile, SourceUnavailable>;
}

/// A malformed source row, skipped with a SCHEMA anomaly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    pub row_number: u32,
    pub reason: String,
}

impl std::fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "row {}: {}", self.row_number, self.reason)
    }
}

/// Parse one source row into a raw record.
///
/// Expected fields: symbol, venue MPID, share volume, trade count. Violations
/// are per-row: one bad row never fails the batch by itself.
pub fn parse_source_row(row: &SourceRow) -> Result<RawRecord, SchemaViolation> {
    if row.fields.len() != 4 {
        return Err(SchemaViolation {
            row_number: row.row_number,
            reason: format!("expected 4 fields, got {}", row.fields.len()),
        });
    }
    let symbol = row.fields[0].trim();
    let venue = row.fields[1].trim();
    if symbol.is_empty() {
        return Err(SchemaViolation {
            row_number: row.row_number,
            reason: "empty symbol".to_string(),
        });
    }
    if venue.is_empty() {
        return Err(SchemaViolation {
            row_number: row.row_number,
            reason: "empty venue".to_string(),
        });
    }
    let share_volume: u64 = row.fields[2].trim().parse().map_err(|_| SchemaViolation {
        row_number: row.row_number,
        reason: format!("unparseable share volume '{}'", row.fields[2]),
    })?;
    let trade_count: u64 = row.fields[3].trim().parse().map_err(|_| SchemaViolation {
        row_number: row.row_number,
        reason: format!("unparseable trade count '{}'", row.fields[3]),
    })?;
    Ok(RawRecord {
        symbol: symbol.to_ascii_uppercase(),
        venue: venue.to_ascii_uppercase(),
        share_volume,
        trade_count,
        source_row: row.row_number,
    })
}

/// Prior weeks' summaries handed to the calculate function.
#[derive(Debug, Clone, Default)]
pub struct HistoricalContext {
    /// `(week_ending, summary rows)` for each available trailing week,
    /// most recent first.
    pub prior_weeks: Vec<(NaiveDate, Vec<SummaryRow>)>,
}

pub type NormalizeFn = dyn Fn(&[RawRecord]) -> Vec<NormalizedRow> + Send + Sync;
pub type CalculateFn = dyn Fn(&[NormalizedRow], &HistoricalContext) -> Vec<SummaryRow> + Send + Sync;

/// The injectable pure stage functions.
pub struct StageLogic {
    pub normalize: Box<NormalizeFn>,
    pub calculate: Box<CalculateFn>,
}

impl StageLogic {
    /// Reference implementations: merge duplicate (symbol, venue) pairs, then
    /// aggregate per symbol with volume-based market share.
    pub fn standard() -> Self {
        Self {
            normalize: Box::new(standard_normalize),
            calculate: Box::new(standard_calculate),
        }
    }
}

fn standard_normalize(records: &[RawRecord]) -> Vec<NormalizedRow> {
    let mut merged: BTreeMap<(String, String), (u64, u64)> = BTreeMap::new();
    for record in records {
        let entry = merged
            .entry((record.symbol.clone(), record.venue.clone()))
            .or_default();
        entry.0 += record.share_volume;
        entry.1 += record.trade_count;
    }
    merged
        .into_iter()
        .map(|((symbol, venue), (share_volume, trade_count))| NormalizedRow {
            symbol,
            venue,
            share_volume,
            trade_count,
        })
        .collect()
}

fn standard_calculate(rows: &[NormalizedRow], _context: &HistoricalContext) -> Vec<SummaryRow> {
    let total_volume: u64 = rows.iter().map(|r| r.share_volume).sum();
    let mut per_symbol: BTreeMap<String, (u64, u64, u32)> = BTreeMap::new();
    for row in rows {
        let entry = per_symbol.entry(row.symbol.clone()).or_default();
        entry.0 += row.share_volume;
        entry.1 += row.trade_count;
        entry.2 += 1;
    }
    per_symbol
        .into_iter()
        .map(|(symbol, (volume, trades, venues))| SummaryRow {
            symbol,
            total_share_volume: volume,
            total_trade_count: trades,
            venue_count: venues,
            market_share: if total_volume > 0 {
                volume as f64 / total_volume as f64
            } else {
                0.0
            },
        })
        .collect()
}

/// Fetcher reading pipe-delimited weekly files from a local directory,
/// named `{week}_{tier}.psv`. Operational stand-in for the external download
/// collaborator; also what the CLI uses.
pub struct FsSourceFetcher {
    data_dir: PathBuf,
}

impl FsSourceFetcher {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn file_path(&self, week_ending: NaiveDate, tier: Tier) -> PathBuf {
        self.data_dir
            .join(format!("{}_{}.psv", week_ending, tier.label()))
    }
}

#[async_trait]
impl SourceFetcher for FsSourceFetcher {
    async fn fetch(
        &self,
        _domain: &str,
        week_ending: NaiveDate,
        tier: Tier,
    ) -> Result<SourceFile, SourceUnavailable> {
        let path = self.file_path(week_ending, tier);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| SourceUnavailable {
                reason: format!("{}: {}", path.display(), e),
            })?;
        let mut rows = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            // Header rows start with the column name in FINRA exports.
            if idx == 0 && line.to_ascii_uppercase().starts_with("SYMBOL|") {
                continue;
            }
            rows.push(SourceRow {
                row_number: (idx + 1) as u32,
                fields: line.split('|').map(str::to_string).collect(),
            });
        }
        Ok(SourceFile {
            source_file_id: path.display().to_string(),
            rows,
        })
    }
}
