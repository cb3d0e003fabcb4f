//! Pipeline Runner Scenario Tests
//!
//! These tests verify the orchestration behavior end to end against an
//! in-memory store and a scripted source fetcher:
//! 1. Idempotence: byte-identical re-ingest classifies IDENTICAL and leaves
//!    downstream manifest entries and derived tables unchanged
//! 2. Revision correctness: one changed record supersedes and replaces the
//!    derived row for its natural key (row count stays 1)
//! 3. Mutual exclusion: a racing run is rejected with ConcurrentRunConflict
//! 4. Failure surface: fetch and schema failures become anomalies, not errors
//! 5. Force and only-stage modes

use crate::pipeline::anomaly::{Category, Severity};
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::manifest::{Stage, StageStatus};
use crate::pipeline::partition::{Partition, Tier};
use crate::pipeline::revision::BatchClass;
use crate::pipeline::runner::{PipelineRunner, RunOptions, StageResult};
use crate::pipeline::stages::{SourceFetcher, SourceFile, SourceRow, SourceUnavailable, StageLogic};
use crate::pipeline::store::{Db, StoreError};
use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;

/// Scripted fetcher: per-(week, tier) rows or an unavailability reason.
#[derive(Default)]
struct FakeFetcher {
    files: Mutex<HashMap<(NaiveDate, Tier), Result<Vec<Vec<String>>, String>>>,
}

impl FakeFetcher {
    fn set_rows(&self, week: NaiveDate, tier: Tier, rows: &[&[&str]]) {
        let rows = rows
            .iter()
            .map(|fields| fields.iter().map(|s| s.to_string()).collect())
            .collect();
        self.files.lock().insert((week, tier), Ok(rows));
    }

    fn set_missing(&self, week: NaiveDate, tier: Tier, reason: &str) {
        self.files
            .lock()
            .insert((week, tier), Err(reason.to_string()));
    }
}

#[async_trait]
impl SourceFetcher for FakeFetcher {
    async fn fetch(
        &self,
        _domain: &str,
        week_ending: NaiveDate,
        tier: Tier,
    ) -> Result<SourceFile, SourceUnavailable> {
        let scripted = self
            .files
            .lock()
            .get(&(week_ending, tier))
            .cloned()
            .unwrap_or_else(|| Err("no file scripted".to_string()));
        match scripted {
            Ok(rows) => Ok(SourceFile {
                source_file_id: format!("fake:{}_{}", week_ending, tier.label()),
                rows: rows
                    .into_iter()
                    .enumerate()
                    .map(|(i, fields)| SourceRow {
                        row_number: (i + 1) as u32,
                        fields,
                    })
                    .collect(),
            }),
            Err(reason) => Err(SourceUnavailable { reason }),
        }
    }
}

/// Fetcher that parks until released, to hold a stage in RUNNING.
struct BlockingFetcher {
    release: Arc<Notify>,
}

#[async_trait]
impl SourceFetcher for BlockingFetcher {
    async fn fetch(
        &self,
        _domain: &str,
        _week_ending: NaiveDate,
        _tier: Tier,
    ) -> Result<SourceFile, SourceUnavailable> {
        self.release.notified().await;
        Ok(SourceFile {
            source_file_id: "blocking".to_string(),
            rows: vec![SourceRow {
                row_number: 1,
                fields: vec!["AAPL".into(), "XNAS".into(), "1000".into(), "10".into()],
            }],
        })
    }
}

fn test_config() -> PipelineConfig {
    PipelineConfig::default()
}

fn runner_with(fetcher: Arc<dyn SourceFetcher>, config: PipelineConfig) -> Arc<PipelineRunner> {
    let db = Db::in_memory().unwrap();
    Arc::new(PipelineRunner::new(config, db, fetcher, StageLogic::standard()))
}

fn partition() -> Partition {
    Partition::otc("2026-01-09".parse().unwrap(), Tier::NmsTier1)
}

const WEEK_ROWS: &[&[&str]] = &[
    &["AAPL", "XNAS", "1000", "10"],
    &["AAPL", "ARCX", "500", "5"],
    &["MSFT", "XNAS", "2000", "20"],
];

// =============================================================================
// TEST 1: FULL RUN + IDEMPOTENCE
// =============================================================================

#[tokio::test]
async fn test_full_run_succeeds_and_is_ready() {
    let fetcher = Arc::new(FakeFetcher::default());
    let p = partition();
    fetcher.set_rows(p.week_ending, p.tier, WEEK_ROWS);
    let runner = runner_with(fetcher, test_config());

    let outcome = runner.run_partition(&p, RunOptions::default()).await.unwrap();

    assert_eq!(outcome.classification, Some(BatchClass::New));
    assert!(outcome.stage_result(Stage::Raw).unwrap().is_success());
    assert!(outcome.stage_result(Stage::Normalize).unwrap().is_success());
    assert!(outcome.stage_result(Stage::Calc).unwrap().is_success());

    let readiness = outcome.readiness.unwrap();
    assert!(readiness.is_ready, "issues: {:?}", readiness.blocking_issues);

    // Two symbols aggregated across three venue rows.
    let summaries = runner.records().summary_rows(&p).unwrap();
    assert_eq!(summaries.len(), 2);
    let aapl = summaries.iter().find(|s| s.symbol == "AAPL").unwrap();
    assert_eq!(aapl.total_share_volume, 1500);
    assert_eq!(aapl.venue_count, 2);
    assert!((aapl.market_share - 1500.0 / 3500.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_identical_reingest_is_noop_downstream() {
    let fetcher = Arc::new(FakeFetcher::default());
    let p = partition();
    fetcher.set_rows(p.week_ending, p.tier, WEEK_ROWS);
    let runner = runner_with(fetcher, test_config());

    runner.run_partition(&p, RunOptions::default()).await.unwrap();
    let normalize_before = runner.manifest().get_entry(&p, Stage::Normalize).unwrap().unwrap();
    let calc_before = runner.manifest().get_entry(&p, Stage::Calc).unwrap().unwrap();

    let second = runner.run_partition(&p, RunOptions::default()).await.unwrap();
    assert_eq!(second.classification, Some(BatchClass::Identical));
    assert!(matches!(
        second.stage_result(Stage::Normalize).unwrap(),
        StageResult::Skipped { .. }
    ));
    assert!(matches!(
        second.stage_result(Stage::Calc).unwrap(),
        StageResult::Skipped { .. }
    ));

    // Downstream manifest entries are untouched: same batch, same digest.
    let normalize_after = runner.manifest().get_entry(&p, Stage::Normalize).unwrap().unwrap();
    let calc_after = runner.manifest().get_entry(&p, Stage::Calc).unwrap().unwrap();
    assert_eq!(normalize_before.batch_id, normalize_after.batch_id);
    assert_eq!(calc_before.batch_id, calc_after.batch_id);
    assert_eq!(calc_before.digest, calc_after.digest);

    // No duplicate rows in derived tables.
    assert_eq!(runner.records().summary_rows(&p).unwrap().len(), 2);
    assert_eq!(runner.records().normalized_rows(&p).unwrap().len(), 3);

    // Readiness still holds.
    assert!(second.readiness.unwrap().is_ready);
}

// =============================================================================
// TEST 2: REVISION CORRECTNESS
// =============================================================================

#[tokio::test]
async fn test_revision_supersedes_and_replaces_derived_rows() {
    let fetcher = Arc::new(FakeFetcher::default());
    let p = partition();
    fetcher.set_rows(p.week_ending, p.tier, WEEK_ROWS);
    let runner = runner_with(fetcher.clone(), test_config());
    runner.run_partition(&p, RunOptions::default()).await.unwrap();

    // Late revision: one record's volume corrected upstream.
    fetcher.set_rows(
        p.week_ending,
        p.tier,
        &[
            &["AAPL", "XNAS", "1100", "11"],
            &["AAPL", "ARCX", "500", "5"],
            &["MSFT", "XNAS", "2000", "20"],
        ],
    );
    let outcome = runner.run_partition(&p, RunOptions::default()).await.unwrap();
    assert_eq!(outcome.classification, Some(BatchClass::Revision));
    assert!(outcome.stage_result(Stage::Calc).unwrap().is_success());

    // The summary row for the revised key is replaced, not duplicated.
    let summaries = runner.records().summary_rows(&p).unwrap();
    let aapl: Vec<_> = summaries.iter().filter(|s| s.symbol == "AAPL").collect();
    assert_eq!(aapl.len(), 1, "revision must not duplicate the summary row");
    assert_eq!(aapl[0].total_share_volume, 1600);

    // Supersession is visible in the attempt history, not erased.
    let attempts = runner.manifest().attempts(&p).unwrap();
    assert!(attempts
        .iter()
        .any(|a| a.stage == Stage::Calc && a.status == StageStatus::Superseded));

    assert!(outcome.readiness.unwrap().is_ready);
}

#[tokio::test]
async fn test_revision_with_only_stage_raw_leaves_partition_blocked() {
    let fetcher = Arc::new(FakeFetcher::default());
    let p = partition();
    fetcher.set_rows(p.week_ending, p.tier, WEEK_ROWS);
    let runner = runner_with(fetcher.clone(), test_config());
    runner.run_partition(&p, RunOptions::default()).await.unwrap();

    fetcher.set_rows(p.week_ending, p.tier, &[&["AAPL", "XNAS", "9999", "99"]]);
    let outcome = runner
        .run_partition(
            &p,
            RunOptions {
                only_stage: Some(Stage::Raw),
                ..RunOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.classification, Some(BatchClass::Revision));

    // Downstream was superseded and not recomputed, so the partition is not
    // ready until the next full run.
    let readiness = outcome.readiness.unwrap();
    assert!(!readiness.is_ready);
    assert!(readiness
        .blocking_issues
        .iter()
        .any(|i| i.contains("superseded")));
}

// =============================================================================
// TEST 3: MUTUAL EXCLUSION
// =============================================================================

#[tokio::test]
async fn test_concurrent_runs_one_wins_one_conflicts() {
    let release = Arc::new(Notify::new());
    let blocking = Arc::new(BlockingFetcher {
        release: release.clone(),
    });
    let runner = runner_with(blocking, test_config());
    let p = partition();

    // First run parks inside fetch while holding RAW in RUNNING.
    let first = {
        let runner = Arc::clone(&runner);
        let p = p.clone();
        tokio::spawn(async move { runner.run_partition(&p, RunOptions::default()).await })
    };
    // Let the first run reach the fetch suspension point.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let second = runner.run_partition(&p, RunOptions::default()).await;
    match second {
        Err(StoreError::ConcurrentRunConflict { stage, .. }) => {
            assert_eq!(stage, "RAW");
        }
        other => panic!("expected ConcurrentRunConflict, got {:?}", other.map(|o| o.stages)),
    }

    // Release the first run; it completes normally.
    release.notify_one();
    let outcome = first.await.unwrap().unwrap();
    assert!(outcome.stage_result(Stage::Raw).unwrap().is_success());
}

// =============================================================================
// TEST 4: FAILURE SURFACE
// =============================================================================

#[tokio::test]
async fn test_missing_source_is_fetch_anomaly_and_retryable() {
    let fetcher = Arc::new(FakeFetcher::default());
    let p = partition();
    fetcher.set_missing(p.week_ending, p.tier, "404 from upstream");
    let runner = runner_with(fetcher.clone(), test_config());

    let outcome = runner.run_partition(&p, RunOptions::default()).await.unwrap();
    assert!(matches!(
        outcome.stage_result(Stage::Raw).unwrap(),
        StageResult::Failed { .. }
    ));
    assert!(matches!(
        outcome.stage_result(Stage::Normalize).unwrap(),
        StageResult::Skipped { .. }
    ));

    let anomalies = runner.anomalies().unresolved(&p, Severity::Info).unwrap();
    assert!(anomalies
        .iter()
        .any(|a| a.category == Category::Fetch && a.severity == Severity::Warning));
    assert_eq!(
        runner.manifest().get_entry(&p, Stage::Raw).unwrap().unwrap().status,
        StageStatus::Failed
    );

    // The file appears later; the next scheduled run retries from RAW.
    fetcher.set_rows(p.week_ending, p.tier, WEEK_ROWS);
    let retry = runner.run_partition(&p, RunOptions::default()).await.unwrap();
    assert_eq!(retry.classification, Some(BatchClass::New));
    assert!(retry.stage_result(Stage::Calc).unwrap().is_success());
}

#[tokio::test]
async fn test_schema_skips_under_threshold_succeed_with_warning() {
    let fetcher = Arc::new(FakeFetcher::default());
    let p = partition();
    // 39 good rows and one malformed: 2.5% skip rate, under the 5% default.
    let good: &[&str] = &["AAPL", "XNAS", "1000", "10"];
    let bad: &[&str] = &["BROKEN", "XNAS", "not-a-number", "10"];
    let mut rows: Vec<&[&str]> = vec![good; 39];
    rows.push(bad);
    fetcher.set_rows(p.week_ending, p.tier, &rows);
    let runner = runner_with(fetcher, test_config());

    let outcome = runner.run_partition(&p, RunOptions::default()).await.unwrap();
    match outcome.stage_result(Stage::Raw).unwrap() {
        StageResult::Succeeded { record_count } => assert_eq!(*record_count, 39),
        other => panic!("expected success, got {:?}", other),
    }

    let anomalies = runner.anomalies().unresolved(&p, Severity::Info).unwrap();
    // One per-row SCHEMA anomaly plus the aggregate warning.
    assert!(anomalies.iter().any(|a| a.severity == Severity::Info
        && a.category == Category::Schema
        && a.message.contains("row 40")));
    assert!(anomalies.iter().any(|a| a.severity == Severity::Warning
        && a.category == Category::Schema
        && a.message.contains("skipped 1 of 40")));
    // Warnings do not block readiness under the default policy.
    assert!(outcome.readiness.unwrap().is_ready);
}

#[tokio::test]
async fn test_schema_skips_over_threshold_fail_critically() {
    let fetcher = Arc::new(FakeFetcher::default());
    let p = partition();
    fetcher.set_rows(
        p.week_ending,
        p.tier,
        &[
            &["AAPL", "XNAS", "1000", "10"],
            &["BAD", "XNAS", "x", "10"],
            &["WORSE", "", "1000", "10"],
        ],
    );
    let runner = runner_with(fetcher, test_config());

    let outcome = runner.run_partition(&p, RunOptions::default()).await.unwrap();
    assert!(matches!(
        outcome.stage_result(Stage::Raw).unwrap(),
        StageResult::Failed { .. }
    ));

    let anomalies = runner.anomalies().unresolved(&p, Severity::Critical).unwrap();
    assert!(anomalies
        .iter()
        .any(|a| a.category == Category::Processing));
    assert!(!outcome.readiness.unwrap().is_ready);
}

#[tokio::test]
async fn test_calc_only_rerun_preserves_upstream_stages() {
    // A calc-only re-run must not recompute successful upstream stages.
    let fetcher = Arc::new(FakeFetcher::default());
    let p = partition();
    fetcher.set_rows(p.week_ending, p.tier, WEEK_ROWS);
    let runner = runner_with(fetcher, test_config());
    runner.run_partition(&p, RunOptions::default()).await.unwrap();

    let raw_before = runner.manifest().get_entry(&p, Stage::Raw).unwrap().unwrap();

    let outcome = runner
        .run_partition(
            &p,
            RunOptions {
                only_stage: Some(Stage::Calc),
                force: true,
            },
        )
        .await
        .unwrap();
    assert!(outcome.stage_result(Stage::Calc).unwrap().is_success());
    assert!(outcome.stage_result(Stage::Raw).is_none());

    let raw_after = runner.manifest().get_entry(&p, Stage::Raw).unwrap().unwrap();
    assert_eq!(raw_before.batch_id, raw_after.batch_id);
}

// =============================================================================
// TEST 5: FORCE MODE AND OPERATIONAL SURFACE
// =============================================================================

#[tokio::test]
async fn test_force_recomputes_downstream_on_identical_content() {
    let fetcher = Arc::new(FakeFetcher::default());
    let p = partition();
    fetcher.set_rows(p.week_ending, p.tier, WEEK_ROWS);
    let runner = runner_with(fetcher, test_config());

    runner.run_partition(&p, RunOptions::default()).await.unwrap();
    let calc_before = runner.manifest().get_entry(&p, Stage::Calc).unwrap().unwrap();

    let outcome = runner
        .run_partition(
            &p,
            RunOptions {
                force: true,
                ..RunOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.classification, Some(BatchClass::Identical));
    assert!(outcome.stage_result(Stage::Calc).unwrap().is_success());

    // Recomputed under a new batch; derived rows still not duplicated.
    let calc_after = runner.manifest().get_entry(&p, Stage::Calc).unwrap().unwrap();
    assert_ne!(calc_before.batch_id, calc_after.batch_id);
    assert_eq!(calc_before.digest, calc_after.digest);
    assert_eq!(runner.records().summary_rows(&p).unwrap().len(), 2);
}

#[tokio::test]
async fn test_run_many_processes_partitions_concurrently() {
    let fetcher = Arc::new(FakeFetcher::default());
    let week: NaiveDate = "2026-01-09".parse().unwrap();
    for tier in Tier::ALL {
        fetcher.set_rows(week, tier, WEEK_ROWS);
    }
    let runner = runner_with(fetcher, test_config());

    let partitions: Vec<Partition> = Tier::ALL
        .iter()
        .map(|&tier| Partition::otc(week, tier))
        .collect();
    let results = runner.run_many(partitions, RunOptions::default()).await;

    assert_eq!(results.len(), 3);
    for (partition, result) in results {
        let outcome = result.unwrap();
        assert!(
            outcome.stage_result(Stage::Calc).unwrap().is_success(),
            "partition {} should complete",
            partition
        );
    }
}

#[tokio::test]
async fn test_missing_partitions_gap_detection() {
    let fetcher = Arc::new(FakeFetcher::default());
    let p = partition();
    fetcher.set_rows(p.week_ending, p.tier, WEEK_ROWS);
    let runner = runner_with(fetcher, test_config());
    runner.run_partition(&p, RunOptions::default()).await.unwrap();

    let from: NaiveDate = "2026-01-02".parse().unwrap();
    let missing = runner
        .missing_partitions((from, p.week_ending), &[Tier::NmsTier1])
        .unwrap();
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].week_ending, from);
}

#[tokio::test]
async fn test_reaper_records_anomaly_and_recomputes_readiness() {
    let fetcher = Arc::new(FakeFetcher::default());
    let mut config = test_config();
    // Immediate staleness so the just-written heartbeat already qualifies.
    config.stale_run_threshold = chrono::Duration::seconds(-1);
    let runner = runner_with(fetcher, config);
    let p = partition();

    runner
        .manifest()
        .upsert_entry(&p, Stage::Raw, StageStatus::Running, 0, None, None, "dead-batch")
        .unwrap();

    let reaped = runner.reap_stale().unwrap();
    assert_eq!(reaped.len(), 1);
    assert_eq!(
        runner.manifest().get_entry(&p, Stage::Raw).unwrap().unwrap().status,
        StageStatus::Failed
    );
    let anomalies = runner.anomalies().unresolved(&p, Severity::Warning).unwrap();
    assert!(anomalies
        .iter()
        .any(|a| a.category == Category::Processing && a.message.contains("dead-batch")));
}

#[tokio::test]
async fn test_trailing_policy_blocks_current_week_until_history_complete() {
    let fetcher = Arc::new(FakeFetcher::default());
    let p = partition();
    let mut config = test_config();
    config.readiness.min_trailing_weeks = 2;
    for n in 0..3u32 {
        let prior = p.weeks_back(n);
        fetcher.set_rows(prior.week_ending, prior.tier, WEEK_ROWS);
    }
    let runner = runner_with(fetcher, config);

    // Only one of the two required trailing weeks has been processed.
    runner
        .run_partition(&p.weeks_back(1), RunOptions::default())
        .await
        .unwrap();
    let outcome = runner.run_partition(&p, RunOptions::default()).await.unwrap();
    let readiness = outcome.readiness.unwrap();
    assert!(!readiness.is_ready);
    let missing_week = p.weeks_back(2).week_ending.to_string();
    assert!(readiness
        .blocking_issues
        .iter()
        .any(|i| i.contains(&missing_week)));

    // Backfilling the missing week unblocks the current one.
    runner
        .run_partition(&p.weeks_back(2), RunOptions::default())
        .await
        .unwrap();
    let record = runner.get_readiness(&p).unwrap();
    assert!(record.is_ready, "issues: {:?}", record.blocking_issues);
}
