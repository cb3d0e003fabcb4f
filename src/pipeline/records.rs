//! Raw and derived row storage.
//!
//! Raw records are content-addressed and append-only: the UNIQUE fingerprint
//! index turns re-ingestion of identical rows into a counted duplicate
//! outcome. Derived tables (normalized, summary) upsert by natural key, so a
//! revision overwrites the derived row for that key instead of appending a
//! second one.

use crate::pipeline::fingerprint::record_fingerprint;
use crate::pipeline::partition::Partition;
use crate::pipeline::store::{encode_ts, encode_week, Db, StoreError};
use chrono::Utc;
use rusqlite::params;
use serde::{Deserialize, Serialize};

/// One ingested observation from a weekly transparency file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub symbol: String,
    /// Market participant identifier (MPID) of the reporting venue.
    pub venue: String,
    pub share_volume: u64,
    pub trade_count: u64,
    /// Row number in the source file. Ingestion metadata; excluded from the
    /// content fingerprint.
    pub source_row: u32,
}

/// Cleaned per-(symbol, venue) row produced by the normalize stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRow {
    pub symbol: String,
    pub venue: String,
    pub share_volume: u64,
    pub trade_count: u64,
}

/// Per-symbol aggregate produced by the calculate stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub symbol: String,
    pub total_share_volume: u64,
    pub total_trade_count: u64,
    pub venue_count: u32,
    /// Share of the partition's total volume attributed to this symbol.
    pub market_share: f64,
}

/// Outcome counts from one raw ingestion pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub inserted: u64,
    /// Rows whose fingerprint already existed. Duplicates are a normal
    /// outcome of re-running a partition, not an error.
    pub duplicates: u64,
}

/// Store for raw and derived rows.
#[derive(Clone)]
pub struct RecordStore {
    db: Db,
}

impl RecordStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Insert raw records, de-duplicating on fingerprint.
    ///
    /// Existing rows keep their semantic fields and ingested_at; only
    /// last_batch_id is refreshed so a later stage can select the rows the
    /// current batch observed.
    pub fn upsert_raw(
        &self,
        partition: &Partition,
        records: &[RawRecord],
        batch_id: &str,
    ) -> Result<IngestStats, StoreError> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let now = encode_ts(Utc::now());
        let mut stats = IngestStats::default();
        for record in records {
            let fp = record_fingerprint(partition, record).to_hex();
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM raw_records WHERE fingerprint = ?1)",
                params![fp],
                |row| row.get(0),
            )?;
            if exists {
                // Semantic fields and ingested_at are immutable; only the
                // observing batch is refreshed.
                tx.execute(
                    "UPDATE raw_records SET last_batch_id = ?1 WHERE fingerprint = ?2",
                    params![batch_id, fp],
                )?;
                stats.duplicates += 1;
            } else {
                tx.execute(
                    "INSERT INTO raw_records
                        (domain, week_ending, tier, symbol, venue, share_volume,
                         trade_count, source_row, fingerprint, last_batch_id, ingested_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        partition.domain,
                        encode_week(partition.week_ending),
                        partition.tier.label(),
                        record.symbol,
                        record.venue,
                        record.share_volume as i64,
                        record.trade_count as i64,
                        record.source_row,
                        fp,
                        batch_id,
                        now,
                    ],
                )?;
                stats.inserted += 1;
            }
        }
        tx.commit()?;
        Ok(stats)
    }

    /// Raw records last observed by the given batch, in source-row order.
    pub fn raw_for_batch(
        &self,
        partition: &Partition,
        batch_id: &str,
    ) -> Result<Vec<RawRecord>, StoreError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT symbol, venue, share_volume, trade_count, source_row
             FROM raw_records
             WHERE domain = ?1 AND week_ending = ?2 AND tier = ?3 AND last_batch_id = ?4
             ORDER BY source_row",
        )?;
        let rows = stmt.query_map(
            params![
                partition.domain,
                encode_week(partition.week_ending),
                partition.tier.label(),
                batch_id,
            ],
            |row| {
                Ok(RawRecord {
                    symbol: row.get(0)?,
                    venue: row.get(1)?,
                    share_volume: row.get::<_, i64>(2)? as u64,
                    trade_count: row.get::<_, i64>(3)? as u64,
                    source_row: row.get(4)?,
                })
            },
        )?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Upsert normalized rows by natural key (week, tier, symbol, venue).
    pub fn upsert_normalized(
        &self,
        partition: &Partition,
        rows: &[NormalizedRow],
        batch_id: &str,
    ) -> Result<usize, StoreError> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let now = encode_ts(Utc::now());
        for row in rows {
            tx.execute(
                "INSERT INTO normalized_rows
                    (domain, week_ending, tier, symbol, venue, share_volume,
                     trade_count, batch_id, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(domain, week_ending, tier, symbol, venue) DO UPDATE SET
                    share_volume = excluded.share_volume,
                    trade_count  = excluded.trade_count,
                    batch_id     = excluded.batch_id,
                    updated_at   = excluded.updated_at",
                params![
                    partition.domain,
                    encode_week(partition.week_ending),
                    partition.tier.label(),
                    row.symbol,
                    row.venue,
                    row.share_volume as i64,
                    row.trade_count as i64,
                    batch_id,
                    now,
                ],
            )?;
        }
        tx.commit()?;
        Ok(rows.len())
    }

    pub fn normalized_rows(&self, partition: &Partition) -> Result<Vec<NormalizedRow>, StoreError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT symbol, venue, share_volume, trade_count
             FROM normalized_rows
             WHERE domain = ?1 AND week_ending = ?2 AND tier = ?3
             ORDER BY symbol, venue",
        )?;
        let rows = stmt.query_map(
            params![
                partition.domain,
                encode_week(partition.week_ending),
                partition.tier.label(),
            ],
            |row| {
                Ok(NormalizedRow {
                    symbol: row.get(0)?,
                    venue: row.get(1)?,
                    share_volume: row.get::<_, i64>(2)? as u64,
                    trade_count: row.get::<_, i64>(3)? as u64,
                })
            },
        )?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Upsert summary rows by natural key (week, tier, symbol).
    pub fn upsert_summary(
        &self,
        partition: &Partition,
        rows: &[SummaryRow],
        batch_id: &str,
    ) -> Result<usize, StoreError> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let now = encode_ts(Utc::now());
        for row in rows {
            tx.execute(
                "INSERT INTO summary_rows
                    (domain, week_ending, tier, symbol, total_share_volume,
                     total_trade_count, venue_count, market_share, batch_id, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(domain, week_ending, tier, symbol) DO UPDATE SET
                    total_share_volume = excluded.total_share_volume,
                    total_trade_count  = excluded.total_trade_count,
                    venue_count        = excluded.venue_count,
                    market_share       = excluded.market_share,
                    batch_id           = excluded.batch_id,
                    updated_at         = excluded.updated_at",
                params![
                    partition.domain,
                    encode_week(partition.week_ending),
                    partition.tier.label(),
                    row.symbol,
                    row.total_share_volume as i64,
                    row.total_trade_count as i64,
                    row.venue_count,
                    row.market_share,
                    batch_id,
                    now,
                ],
            )?;
        }
        tx.commit()?;
        Ok(rows.len())
    }

    pub fn summary_rows(&self, partition: &Partition) -> Result<Vec<SummaryRow>, StoreError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT symbol, total_share_volume, total_trade_count, venue_count, market_share
             FROM summary_rows
             WHERE domain = ?1 AND week_ending = ?2 AND tier = ?3
             ORDER BY symbol",
        )?;
        let rows = stmt.query_map(
            params![
                partition.domain,
                encode_week(partition.week_ending),
                partition.tier.label(),
            ],
            |row| {
                Ok(SummaryRow {
                    symbol: row.get(0)?,
                    total_share_volume: row.get::<_, i64>(1)? as u64,
                    total_trade_count: row.get::<_, i64>(2)? as u64,
                    venue_count: row.get(3)?,
                    market_share: row.get(4)?,
                })
            },
        )?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::partition::Tier;

    fn partition() -> Partition {
        Partition::otc("2026-01-09".parse().unwrap(), Tier::NmsTier1)
    }

    fn record(symbol: &str, venue: &str, shares: u64, trades: u64, row: u32) -> RawRecord {
        RawRecord {
            symbol: symbol.to_string(),
            venue: venue.to_string(),
            share_volume: shares,
            trade_count: trades,
            source_row: row,
        }
    }

    #[test]
    fn test_raw_reingest_is_counted_noop() {
        let store = RecordStore::new(Db::in_memory().unwrap());
        let p = partition();
        let records = vec![
            record("AAPL", "XNAS", 1000, 10, 1),
            record("MSFT", "ARCX", 500, 5, 2),
        ];

        let first = store.upsert_raw(&p, &records, "batch-1").unwrap();
        assert_eq!(first.inserted, 2);
        assert_eq!(first.duplicates, 0);

        let second = store.upsert_raw(&p, &records, "batch-2").unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, 2);

        // The re-ingest batch still sees the full row set.
        assert_eq!(store.raw_for_batch(&p, "batch-2").unwrap().len(), 2);
    }

    #[test]
    fn test_revision_leaves_old_rows_behind_new_batch_filter() {
        let store = RecordStore::new(Db::in_memory().unwrap());
        let p = partition();
        store
            .upsert_raw(&p, &[record("AAPL", "XNAS", 1000, 10, 1)], "batch-1")
            .unwrap();
        // Revision: volume changed, so a new fingerprint is created.
        store
            .upsert_raw(&p, &[record("AAPL", "XNAS", 1200, 12, 1)], "batch-2")
            .unwrap();

        let current = store.raw_for_batch(&p, "batch-2").unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].share_volume, 1200);
        // The superseded row is retained under the old batch id.
        assert_eq!(store.raw_for_batch(&p, "batch-1").unwrap().len(), 1);
    }

    #[test]
    fn test_normalized_upsert_replaces_by_natural_key() {
        let store = RecordStore::new(Db::in_memory().unwrap());
        let p = partition();
        let row = NormalizedRow {
            symbol: "AAPL".to_string(),
            venue: "XNAS".to_string(),
            share_volume: 1000,
            trade_count: 10,
        };
        store.upsert_normalized(&p, &[row.clone()], "batch-1").unwrap();

        let revised = NormalizedRow {
            share_volume: 1200,
            ..row
        };
        store.upsert_normalized(&p, &[revised], "batch-2").unwrap();

        let rows = store.normalized_rows(&p).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].share_volume, 1200);
    }

    #[test]
    fn test_summary_upsert_replaces_by_natural_key() {
        let store = RecordStore::new(Db::in_memory().unwrap());
        let p = partition();
        let row = SummaryRow {
            symbol: "AAPL".to_string(),
            total_share_volume: 1000,
            total_trade_count: 10,
            venue_count: 1,
            market_share: 1.0,
        };
        store.upsert_summary(&p, &[row.clone()], "batch-1").unwrap();
        store
            .upsert_summary(
                &p,
                &[SummaryRow {
                    total_share_volume: 1500,
                    ..row
                }],
                "batch-2",
            )
            .unwrap();

        let rows = store.summary_rows(&p).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_share_volume, 1500);
    }

    #[test]
    fn test_partitions_do_not_leak_rows() {
        let store = RecordStore::new(Db::in_memory().unwrap());
        let p1 = partition();
        let p2 = Partition::otc("2026-01-09".parse().unwrap(), Tier::Otce);
        store
            .upsert_raw(&p1, &[record("AAPL", "XNAS", 1000, 10, 1)], "b1")
            .unwrap();
        store
            .upsert_raw(&p2, &[record("OTCX", "CDEL", 50, 2, 1)], "b1")
            .unwrap();
        assert_eq!(store.raw_for_batch(&p1, "b1").unwrap().len(), 1);
        assert_eq!(store.raw_for_batch(&p2, "b1").unwrap().len(), 1);
        assert_eq!(store.raw_for_batch(&p1, "b1").unwrap()[0].symbol, "AAPL");
    }
}
