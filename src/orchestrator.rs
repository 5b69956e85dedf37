//! Run orchestration.
//!
//! A run is: list the log directory, extract and classify every file one after another,
//! then replay the resulting category maps in priority order. All state lives in a
//! [`RunContext`] owned by the run; nothing outlives it.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ReplayConfig;
use crate::errors::ReplayError;
use crate::replay::{
    classify_payload, CategoryMaps, CategoryReport, CounterSnapshot, FlowPoint, Insertion,
    LogExtractor, ReplayPool, ReplayScheduler, ReplayService, RunCounters, ServiceClient,
};

/// Scan-phase tallies, reported with the final summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub files_scanned: usize,
    pub files_failed: usize,
    pub payloads_extracted: usize,
    pub marker_mismatches: usize,
    pub parse_failures: usize,
    pub unknown_flow_points: usize,
    pub duplicates_replaced: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub log_dir: PathBuf,
    pub service_url: String,
    pub scan: ScanStats,
    pub categories: Vec<CategoryReport>,
    #[serde(flatten)]
    pub counts: CounterSnapshot,
}

impl RunSummary {
    pub fn log(&self) {
        for category in &self.categories {
            info!(
                flow_point = %category.flow_point,
                records = category.records,
                success = category.success,
                fail = category.fail,
                elapsed_ms = category.elapsed_ms,
                "Category replayed"
            );
        }
        info!(run_id = %self.run_id, "Total request count: {}", self.counts.total);
        info!(run_id = %self.run_id, "Success request count: {}", self.counts.success);
        info!(run_id = %self.run_id, "Fail request count: {}", self.counts.fail);
    }
}

pub struct RunContext {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    config: ReplayConfig,
    extractor: LogExtractor,
    maps: CategoryMaps,
    counters: Arc<RunCounters>,
    stats: ScanStats,
}

impl RunContext {
    pub fn new(config: ReplayConfig) -> Self {
        let extractor = LogExtractor::new(
            config.extraction.marker.clone(),
            config.extraction.strategy,
        );
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            config,
            extractor,
            maps: CategoryMaps::new(),
            counters: Arc::new(RunCounters::new()),
            stats: ScanStats::default(),
        }
    }

    pub fn maps(&self) -> &CategoryMaps {
        &self.maps
    }

    pub fn stats(&self) -> &ScanStats {
        &self.stats
    }

    pub fn counters(&self) -> Arc<RunCounters> {
        self.counters.clone()
    }

    /// Reads every file of the log directory in name order. A file that cannot be read
    /// is logged and skipped.
    pub fn scan_directory(&mut self) -> Result<(), ReplayError> {
        let dir = self.config.log_dir.clone();
        let files = list_log_files(&dir)?;
        info!(dir = %dir.display(), "The directory contains {} files", files.len());

        for path in files {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());

            info!(file = %name, "Read log file start");
            match read_log_file(&path) {
                Ok(text) => {
                    self.ingest_text(&name, &text);
                    info!(file = %name, "Read log file end");
                }
                Err(e) => {
                    self.stats.files_failed += 1;
                    error!(file = %name, error = %e, "Read log file error");
                }
            }
        }
        Ok(())
    }

    /// Extracts and classifies one file's text into the category maps.
    pub fn ingest_text(&mut self, file: &str, text: &str) {
        self.stats.files_scanned += 1;
        let mut per_flow_point: BTreeMap<FlowPoint, usize> = BTreeMap::new();

        let mut payloads = self.extractor.payloads(text);
        for raw in payloads.by_ref() {
            let record = match classify_payload(raw) {
                Ok(record) => record,
                Err(e) => {
                    self.stats.parse_failures += 1;
                    warn!(file, error = %e, "Unparseable payload dropped");
                    continue;
                }
            };

            let identity = record.identity.clone();
            match self.maps.insert(record) {
                Insertion::Inserted(fp) => *per_flow_point.entry(fp).or_default() += 1,
                Insertion::Replaced(fp) => {
                    *per_flow_point.entry(fp).or_default() += 1;
                    self.stats.duplicates_replaced += 1;
                    debug!(
                        file,
                        identity = %identity,
                        flow_point = %fp,
                        "Earlier capture replaced"
                    );
                }
                Insertion::Discarded { token } => {
                    self.stats.unknown_flow_points += 1;
                    info!(file, identity = %identity, "Can't find fromflowpoint: {}", token);
                }
            }
        }

        let extraction = payloads.stats();
        self.stats.payloads_extracted += extraction.extracted;
        self.stats.marker_mismatches += extraction.mismatched;

        info!(
            file,
            markers = extraction.markers,
            mismatched = extraction.mismatched,
            "request count: {}",
            extraction.extracted
        );
        for flow_point in FlowPoint::PRIORITY_ORDER {
            info!(
                file,
                "Count {}: {}",
                flow_point,
                per_flow_point.get(&flow_point).copied().unwrap_or(0)
            );
        }
    }

    /// Replays the category maps. On pool saturation the remaining work is abandoned.
    pub async fn replay(
        &self,
        service: Arc<dyn ReplayService>,
    ) -> Result<Vec<CategoryReport>, ReplayError> {
        let pool = ReplayPool::start(&self.config.pool, service, self.counters.clone());
        let result = ReplayScheduler::new(&pool, self.config.pool.batch_size)
            .replay_all(&self.maps)
            .await;

        match result {
            Ok(reports) => {
                pool.shutdown().await;
                Ok(reports)
            }
            Err(e) => {
                pool.abort();
                Err(e)
            }
        }
    }

    pub fn summary(&self, categories: Vec<CategoryReport>) -> RunSummary {
        RunSummary {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            log_dir: self.config.log_dir.clone(),
            service_url: self.config.service_url.clone(),
            scan: self.stats.clone(),
            categories,
            counts: self.counters.snapshot(),
        }
    }
}

/// Non-directory entries of `dir`, sorted by path. A missing directory is an empty run.
pub fn list_log_files(dir: &Path) -> Result<Vec<PathBuf>, ReplayError> {
    if !dir.exists() {
        warn!(dir = %dir.display(), "The directory does not exist");
        return Ok(Vec::new());
    }

    let entries = fs::read_dir(dir).map_err(|source| ReplayError::DirectoryList {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let path = match entry {
            Ok(entry) => entry.path(),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Skipping unreadable directory entry");
                continue;
            }
        };
        if path.is_dir() {
            debug!(path = %path.display(), "Skipping subdirectory");
            continue;
        }
        files.push(path);
    }

    files.sort();
    Ok(files)
}

/// Whole file as text; bytes that are not UTF-8 are replaced rather than rejected.
pub fn read_log_file(path: &Path) -> Result<String, ReplayError> {
    let bytes = fs::read(path).map_err(|source| ReplayError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Full run against the configured decision service.
pub async fn run(config: ReplayConfig) -> Result<RunSummary> {
    config.validate()?;
    let client = ServiceClient::new(config.service_url.clone(), &config.client)?;
    info!(url = %client.url(), "Replaying against decision service");
    Ok(run_with_service(config, Arc::new(client)).await?)
}

pub async fn run_with_service(
    config: ReplayConfig,
    service: Arc<dyn ReplayService>,
) -> Result<RunSummary, ReplayError> {
    let mut ctx = RunContext::new(config);
    info!(run_id = %ctx.run_id, "Replay run start");

    ctx.scan_directory()?;
    info!(
        af1001 = ctx.maps.len(FlowPoint::Af1001),
        af1002 = ctx.maps.len(FlowPoint::Af1002),
        parse_failures = ctx.stats.parse_failures,
        unknown_flow_points = ctx.stats.unknown_flow_points,
        "Scan finished"
    );

    let reports = ctx.replay(service).await?;
    let summary = ctx.summary(reports);
    summary.log();
    Ok(summary)
}
