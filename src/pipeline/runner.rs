//! Pipeline orchestration.
//!
//! Drives each partition through ingest → normalize → calculate, invoking the
//! external stage logic and recording every outcome in the manifest and the
//! anomaly log. The runner itself holds no pipeline state: everything it
//! knows on the next run comes from the durable stores, so a crash mid-batch
//! leaves the manifest at the last durably recorded transition and the next
//! attempt resumes from the failed stage.
//!
//! Within a partition stages are strictly sequential; across partitions runs
//! are independent and execute concurrently. Mutual exclusion per
//! `(partition, stage)` is the manifest's conflict check, not a lock here.

use crate::pipeline::anomaly::{Anomaly, AnomalyStore, Category, Severity};
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::fingerprint::{batch_digest, normalized_digest, summary_digest};
use crate::pipeline::manifest::{ManifestEntry, ManifestStore, Stage, StageStatus};
use crate::pipeline::partition::{weeks_in_range, Partition, Tier};
use crate::pipeline::readiness::{OverrideRow, ReadinessEvaluator, ReadinessRecord};
use crate::pipeline::records::{NormalizedRow, RawRecord, RecordStore};
use crate::pipeline::revision::{classify, should_run_downstream, BatchClass};
use crate::pipeline::stages::{
    parse_source_row, HistoricalContext, SourceFetcher, StageLogic,
};
use crate::pipeline::store::{Db, StoreError};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-run options.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Re-run downstream stages even when the source content is IDENTICAL.
    /// Exists so a downstream fix can be recomputed over unchanged data.
    pub force: bool,
    /// Run a single stage instead of the full chain.
    pub only_stage: Option<Stage>,
}

/// Result of one stage within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageResult {
    Succeeded { record_count: u64 },
    Failed { reason: String },
    Skipped { reason: String },
}

impl StageResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// Outcome of one `run_partition` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub partition: Partition,
    pub batch_id: String,
    /// How the ingested batch related to recorded history. None when the RAW
    /// stage did not get as far as classification.
    pub classification: Option<BatchClass>,
    pub stages: Vec<(Stage, StageResult)>,
    /// Readiness after the final stage transition of this run.
    pub readiness: Option<ReadinessRecord>,
}

impl RunOutcome {
    pub fn stage_result(&self, stage: Stage) -> Option<&StageResult> {
        self.stages.iter().find(|(s, _)| *s == stage).map(|(_, r)| r)
    }
}

/// Orchestrates the stage sequence per partition.
pub struct PipelineRunner {
    config: PipelineConfig,
    manifest: ManifestStore,
    anomalies: AnomalyStore,
    records: RecordStore,
    readiness: ReadinessEvaluator,
    fetcher: Arc<dyn SourceFetcher>,
    logic: StageLogic,
}

impl PipelineRunner {
    pub fn new(
        config: PipelineConfig,
        db: Db,
        fetcher: Arc<dyn SourceFetcher>,
        logic: StageLogic,
    ) -> Self {
        let manifest = ManifestStore::new(db.clone());
        let anomalies = AnomalyStore::new(db.clone());
        let records = RecordStore::new(db.clone());
        let readiness = ReadinessEvaluator::new(db, manifest.clone(), anomalies.clone());
        Self {
            config,
            manifest,
            anomalies,
            records,
            readiness,
            fetcher,
            logic,
        }
    }

    pub fn manifest(&self) -> &ManifestStore {
        &self.manifest
    }

    pub fn anomalies(&self) -> &AnomalyStore {
        &self.anomalies
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    pub fn readiness_evaluator(&self) -> &ReadinessEvaluator {
        &self.readiness
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run one partition through the stage sequence.
    ///
    /// Stage failures are recorded and reported in the outcome, not returned
    /// as errors: the system prefers partial success with a recorded anomaly
    /// over a hard failure. The error path is reserved for storage failures
    /// and [`StoreError::ConcurrentRunConflict`], both of which abort the
    /// batch with no further state change.
    pub async fn run_partition(
        &self,
        partition: &Partition,
        options: RunOptions,
    ) -> Result<RunOutcome, StoreError> {
        let batch_id = Uuid::new_v4().to_string();
        info!(
            partition = %partition.partition_key(),
            batch = %batch_id,
            force = options.force,
            only_stage = ?options.only_stage,
            "starting pipeline run"
        );

        let mut outcome = RunOutcome {
            partition: partition.clone(),
            batch_id: batch_id.clone(),
            classification: None,
            stages: Vec::new(),
            readiness: None,
        };

        let wants = |stage: Stage| options.only_stage.map_or(true, |only| only == stage);

        // Records produced by this batch's RAW stage, handed straight to
        // NORMALIZE so a full run never re-reads what it just wrote.
        let mut current_records: Option<Vec<RawRecord>> = None;
        let mut downstream_ok = true;

        if wants(Stage::Raw) {
            match self.run_raw(partition, &batch_id, options, &mut outcome).await? {
                RawStageFlow::Continue { records } => {
                    current_records = Some(records);
                }
                RawStageFlow::Stop => {
                    downstream_ok = false;
                }
            }
        }

        let mut current_normalized: Option<Vec<NormalizedRow>> = None;
        if wants(Stage::Normalize) {
            if downstream_ok {
                match self.run_normalize(partition, &batch_id, current_records, &mut outcome)? {
                    Some(rows) => current_normalized = Some(rows),
                    None => downstream_ok = false,
                }
            } else {
                outcome.stages.push((
                    Stage::Normalize,
                    StageResult::Skipped {
                        reason: "upstream stage did not complete".to_string(),
                    },
                ));
            }
        }

        if wants(Stage::Calc) {
            if downstream_ok {
                self.run_calc(partition, &batch_id, current_normalized, &mut outcome)?;
            } else {
                outcome.stages.push((
                    Stage::Calc,
                    StageResult::Skipped {
                        reason: "upstream stage did not complete".to_string(),
                    },
                ));
            }
        }

        outcome.readiness = Some(
            self.readiness
                .get_readiness(partition, &self.config.readiness)?,
        );
        info!(
            partition = %partition.partition_key(),
            batch = %batch_id,
            classification = ?outcome.classification,
            is_ready = outcome.readiness.as_ref().map(|r| r.is_ready),
            "pipeline run finished"
        );
        Ok(outcome)
    }

    /// Run many partitions concurrently. Each partition is independent; a
    /// conflict or storage error on one never blocks the others.
    pub async fn run_many(
        self: &Arc<Self>,
        partitions: Vec<Partition>,
        options: RunOptions,
    ) -> Vec<(Partition, Result<RunOutcome, StoreError>)> {
        let mut set = JoinSet::new();
        for partition in partitions {
            let runner = Arc::clone(self);
            set.spawn(async move {
                let result = runner.run_partition(&partition, options).await;
                (partition, result)
            });
        }
        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(pair) => results.push(pair),
                Err(e) => warn!("partition task panicked: {}", e),
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    async fn run_raw(
        &self,
        partition: &Partition,
        batch_id: &str,
        options: RunOptions,
        outcome: &mut RunOutcome,
    ) -> Result<RawStageFlow, StoreError> {
        let prior_digest = self
            .manifest
            .get_entry(partition, Stage::Raw)?
            .filter(|e| e.status == StageStatus::Succeeded)
            .and_then(|e| e.digest);

        self.manifest.upsert_entry(
            partition,
            Stage::Raw,
            StageStatus::Running,
            0,
            None,
            None,
            batch_id,
        )?;

        let source = match self
            .fetcher
            .fetch(&partition.domain, partition.week_ending, partition.tier)
            .await
        {
            Ok(source) => source,
            Err(e) => {
                self.anomalies.record(
                    partition,
                    Stage::Raw,
                    Severity::Warning,
                    Category::Fetch,
                    e.to_string(),
                )?;
                self.fail_stage(partition, Stage::Raw, batch_id, e.to_string(), outcome)?;
                return Ok(RawStageFlow::Stop);
            }
        };
        self.manifest.heartbeat(partition, Stage::Raw, batch_id)?;

        let total_rows = source.rows.len();
        let mut records = Vec::with_capacity(total_rows);
        let mut skipped = 0usize;
        for row in &source.rows {
            match parse_source_row(row) {
                Ok(record) => records.push(record),
                Err(violation) => {
                    skipped += 1;
                    self.anomalies.record(
                        partition,
                        Stage::Raw,
                        Severity::Info,
                        Category::Schema,
                        violation.to_string(),
                    )?;
                }
            }
        }

        let skip_rate = if total_rows > 0 {
            skipped as f64 / total_rows as f64
        } else {
            0.0
        };
        if skip_rate > self.config.max_schema_skip_rate {
            let reason = format!(
                "{} of {} rows failed schema validation (skip rate {:.1}% exceeds {:.1}%)",
                skipped,
                total_rows,
                skip_rate * 100.0,
                self.config.max_schema_skip_rate * 100.0
            );
            self.anomalies.record(
                partition,
                Stage::Raw,
                Severity::Critical,
                Category::Processing,
                reason.clone(),
            )?;
            self.fail_stage(partition, Stage::Raw, batch_id, reason, outcome)?;
            return Ok(RawStageFlow::Stop);
        }
        if skipped > 0 {
            self.anomalies.record(
                partition,
                Stage::Raw,
                Severity::Warning,
                Category::Schema,
                format!(
                    "skipped {} of {} rows from {} for schema violations",
                    skipped, total_rows, source.source_file_id
                ),
            )?;
        }

        let digest = batch_digest(partition, &records);
        let classification = classify(prior_digest.as_deref(), digest.as_hex());
        outcome.classification = Some(classification);
        debug!(
            partition = %partition.partition_key(),
            classification = %classification,
            records = records.len(),
            "classified incoming batch"
        );

        let stats = self.records.upsert_raw(partition, &records, batch_id)?;
        if classification == BatchClass::Revision {
            self.manifest
                .mark_superseded(partition, &[Stage::Normalize, Stage::Calc], batch_id)?;
        }

        self.manifest.upsert_entry(
            partition,
            Stage::Raw,
            StageStatus::Succeeded,
            records.len() as u64,
            Some(digest.as_hex()),
            None,
            batch_id,
        )?;
        self.readiness
            .recompute(partition, &self.config.readiness)?;
        outcome.stages.push((
            Stage::Raw,
            StageResult::Succeeded {
                record_count: records.len() as u64,
            },
        ));
        debug!(
            partition = %partition.partition_key(),
            inserted = stats.inserted,
            duplicates = stats.duplicates,
            "raw ingest complete"
        );

        if !should_run_downstream(classification, options.force) {
            let reason = "source content identical to prior successful ingest".to_string();
            if options.only_stage.is_none() {
                outcome
                    .stages
                    .push((Stage::Normalize, StageResult::Skipped { reason: reason.clone() }));
                outcome
                    .stages
                    .push((Stage::Calc, StageResult::Skipped { reason }));
            }
            return Ok(RawStageFlow::Stop);
        }
        Ok(RawStageFlow::Continue { records })
    }

    fn run_normalize(
        &self,
        partition: &Partition,
        batch_id: &str,
        current_records: Option<Vec<RawRecord>>,
        outcome: &mut RunOutcome,
    ) -> Result<Option<Vec<NormalizedRow>>, StoreError> {
        let Some(raw_entry) = self
            .manifest
            .get_entry(partition, Stage::Raw)?
            .filter(|e| e.status == StageStatus::Succeeded)
        else {
            outcome.stages.push((
                Stage::Normalize,
                StageResult::Skipped {
                    reason: "RAW stage has no successful entry".to_string(),
                },
            ));
            return Ok(None);
        };

        self.manifest.upsert_entry(
            partition,
            Stage::Normalize,
            StageStatus::Running,
            0,
            None,
            None,
            batch_id,
        )?;
        self.manifest
            .heartbeat(partition, Stage::Normalize, batch_id)?;

        let records = match current_records {
            Some(records) => records,
            None => self.records.raw_for_batch(partition, &raw_entry.batch_id)?,
        };
        let rows = (self.logic.normalize)(&records);
        self.records.upsert_normalized(partition, &rows, batch_id)?;

        let digest = normalized_digest(partition, &rows);
        self.manifest.upsert_entry(
            partition,
            Stage::Normalize,
            StageStatus::Succeeded,
            rows.len() as u64,
            Some(digest.as_hex()),
            raw_entry.digest.as_deref(),
            batch_id,
        )?;
        self.readiness
            .recompute(partition, &self.config.readiness)?;
        outcome.stages.push((
            Stage::Normalize,
            StageResult::Succeeded {
                record_count: rows.len() as u64,
            },
        ));
        Ok(Some(rows))
    }

    fn run_calc(
        &self,
        partition: &Partition,
        batch_id: &str,
        current_normalized: Option<Vec<NormalizedRow>>,
        outcome: &mut RunOutcome,
    ) -> Result<(), StoreError> {
        let raw_digest = self
            .manifest
            .get_entry(partition, Stage::Raw)?
            .filter(|e| e.status == StageStatus::Succeeded)
            .and_then(|e| e.digest);
        let Some(normalize_entry) = self
            .manifest
            .get_entry(partition, Stage::Normalize)?
            .filter(|e| e.status == StageStatus::Succeeded)
        else {
            outcome.stages.push((
                Stage::Calc,
                StageResult::Skipped {
                    reason: "NORMALIZE stage has no successful entry".to_string(),
                },
            ));
            return Ok(());
        };
        // A normalize entry computed from a superseded raw batch must be
        // recomputed first; calculating from it would serve stale data.
        if raw_digest.is_some() && normalize_entry.upstream_digest != raw_digest {
            outcome.stages.push((
                Stage::Calc,
                StageResult::Skipped {
                    reason: "NORMALIZE output is stale relative to the latest RAW revision"
                        .to_string(),
                },
            ));
            return Ok(());
        }

        self.manifest.upsert_entry(
            partition,
            Stage::Calc,
            StageStatus::Running,
            0,
            None,
            None,
            batch_id,
        )?;
        self.manifest.heartbeat(partition, Stage::Calc, batch_id)?;

        let rows = match current_normalized {
            Some(rows) => rows,
            None => self.records.normalized_rows(partition)?,
        };
        let context = self.historical_context(partition)?;
        let summaries = (self.logic.calculate)(&rows, &context);
        self.records.upsert_summary(partition, &summaries, batch_id)?;

        let digest = summary_digest(partition, &summaries);
        self.manifest.upsert_entry(
            partition,
            Stage::Calc,
            StageStatus::Succeeded,
            summaries.len() as u64,
            Some(digest.as_hex()),
            normalize_entry.digest.as_deref(),
            batch_id,
        )?;
        self.readiness
            .recompute(partition, &self.config.readiness)?;
        outcome.stages.push((
            Stage::Calc,
            StageResult::Succeeded {
                record_count: summaries.len() as u64,
            },
        ));
        Ok(())
    }

    fn fail_stage(
        &self,
        partition: &Partition,
        stage: Stage,
        batch_id: &str,
        reason: String,
        outcome: &mut RunOutcome,
    ) -> Result<(), StoreError> {
        self.manifest.upsert_entry(
            partition,
            stage,
            StageStatus::Failed,
            0,
            None,
            None,
            batch_id,
        )?;
        self.readiness
            .recompute(partition, &self.config.readiness)?;
        outcome.stages.push((stage, StageResult::Failed { reason }));
        Ok(())
    }

    /// Summaries for the trailing weeks the calculate function may consult.
    fn historical_context(&self, partition: &Partition) -> Result<HistoricalContext, StoreError> {
        let mut prior_weeks = Vec::new();
        for n in 1..=self.config.readiness.min_trailing_weeks {
            let prior = partition.weeks_back(n);
            let rows = self.records.summary_rows(&prior)?;
            if !rows.is_empty() {
                prior_weeks.push((prior.week_ending, rows));
            }
        }
        Ok(HistoricalContext { prior_weeks })
    }

    // ------------------------------------------------------------------
    // Exposed interfaces for collaborators (UI, reports, operational tooling)
    // ------------------------------------------------------------------

    /// Readiness answered on demand: a fresh pull over manifest + anomaly
    /// state (which also refreshes the cached projection). Trailing-history
    /// conditions depend on other partitions, so serving only the cache here
    /// could hand out a stale verdict.
    pub fn get_readiness(&self, partition: &Partition) -> Result<ReadinessRecord, StoreError> {
        self.readiness.recompute(partition, &self.config.readiness)
    }

    pub fn get_manifest(&self, partition: &Partition) -> Result<Vec<ManifestEntry>, StoreError> {
        self.manifest.get_stage_chain(partition)
    }

    pub fn list_unresolved_anomalies(
        &self,
        week_range: (NaiveDate, NaiveDate),
        min_severity: Severity,
    ) -> Result<Vec<Anomaly>, StoreError> {
        self.anomalies
            .unresolved_in_range(&self.config.domain, week_range, min_severity)
    }

    pub fn resolve_anomaly(&self, anomaly_id: i64, note: &str) -> Result<(), StoreError> {
        self.anomalies.resolve(anomaly_id, note)
    }

    pub fn override_readiness(
        &self,
        partition: &Partition,
        is_ready: bool,
        operator: &str,
        note: &str,
    ) -> Result<ReadinessRecord, StoreError> {
        self.readiness
            .override_readiness(partition, is_ready, operator, note, &self.config.readiness)
    }

    pub fn readiness_overrides(
        &self,
        partition: &Partition,
    ) -> Result<Vec<OverrideRow>, StoreError> {
        self.readiness.overrides(partition)
    }

    /// Reclassify stale RUNNING entries to FAILED, recording a PROCESSING
    /// anomaly per reaped entry and recomputing readiness for the affected
    /// partitions.
    pub fn reap_stale(&self) -> Result<Vec<ManifestEntry>, StoreError> {
        let reaped = self.manifest.reap_stale(self.config.stale_run_threshold)?;
        for entry in &reaped {
            self.anomalies.record(
                &entry.partition,
                entry.stage,
                Severity::Warning,
                Category::Processing,
                format!(
                    "stage {} reaped after stale heartbeat (batch {})",
                    entry.stage, entry.batch_id
                ),
            )?;
            self.readiness
                .recompute(&entry.partition, &self.config.readiness)?;
        }
        Ok(reaped)
    }

    /// Expected-vs-present gap detection over a week range.
    pub fn missing_partitions(
        &self,
        week_range: (NaiveDate, NaiveDate),
        tiers: &[Tier],
    ) -> Result<Vec<Partition>, StoreError> {
        let present = self
            .manifest
            .list_partitions(&self.config.domain, week_range, tiers)?;
        let mut missing = Vec::new();
        for week in weeks_in_range(week_range.0, week_range.1) {
            for &tier in tiers {
                let expected = Partition::new(&self.config.domain, week, tier);
                if !present.contains(&expected) {
                    missing.push(expected);
                }
            }
        }
        Ok(missing)
    }
}

enum RawStageFlow {
    Continue { records: Vec<RawRecord> },
    Stop,
}
