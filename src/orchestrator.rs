//! Clip orchestration.
//!
//! Turns polygons into per-polygon outcomes:
//!
//! ```text
//! polygon ──▶ name ──▶ matcher ──▶ skip / plan ──▶ executor ──▶ ClipResult
//!              │          │           │
//!              ▼          ▼           ▼
//!     MissingNamingValue  no-tiles   output-exists
//! ```
//!
//! Planning is sequential and happens entirely before dispatch, so a
//! duplicate output path aborts the run before any file is touched. Clip
//! jobs then run on the blocking pool, admitted through a semaphore sized
//! by `concurrency`. Every polygon produces exactly one [`ClipResult`],
//! reported in polygon order.

use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::clipper::{partial_path, ClipExecutor};
use crate::error::{DiceError, JobError};
use crate::matcher::TileMatcher;
use crate::models::{
    BatchReport, ClipAction, ClipJob, ClipResult, PolygonFeature, SKIP_CANCELLED,
    SKIP_NO_TILES, SKIP_OUTPUT_EXISTS,
};
use crate::naming::{self, NamingOptions};
use crate::progress::{ProgressEvent, ProgressReporter};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub output_dir: PathBuf,
    pub naming: NamingOptions,
    pub overwrite: bool,
    /// Plan only: record what would happen without invoking the executor.
    pub dry_run: bool,
    pub concurrency: usize,
}

/// Cooperative cancellation shared between the CLI and the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What planning decided for one polygon.
#[derive(Debug)]
pub enum Plan {
    /// Final without running the executor.
    Done(ClipResult),
    Job(ClipJob),
}

/// Decide the fate of every polygon, in order.
///
/// Fails with [`DiceError::DuplicateOutputPath`] when two polygons with
/// matched tiles would write the same file.
pub fn plan(
    polygons: &[PolygonFeature],
    matcher: &dyn TileMatcher,
    options: &RunOptions,
) -> Result<Vec<Plan>, DiceError> {
    let mut plans = Vec::with_capacity(polygons.len());
    let mut claimed: HashMap<PathBuf, i64> = HashMap::new();

    for feature in polygons {
        let output = match naming::output_path(feature, &options.output_dir, &options.naming) {
            Ok(output) => output,
            Err(e) => {
                plans.push(Plan::Done(ClipResult::failed(feature.fid, None, 0, &e)));
                continue;
            }
        };

        let tiles: Vec<PathBuf> = matcher
            .matching_tiles(&feature.geometry)
            .into_iter()
            .map(|t| t.path.clone())
            .collect();
        if tiles.is_empty() {
            plans.push(Plan::Done(ClipResult::skipped(feature.fid, output, 0, SKIP_NO_TILES)));
            continue;
        }

        if let Some(&first_fid) = claimed.get(&output) {
            return Err(DiceError::DuplicateOutputPath {
                path: output,
                first_fid,
                second_fid: feature.fid,
            });
        }
        claimed.insert(output.clone(), feature.fid);

        let action = match (output.exists(), options.overwrite) {
            (false, _) => ClipAction::Build,
            (true, true) => ClipAction::Overwrite,
            (true, false) => ClipAction::SkipExisting,
        };
        if action == ClipAction::SkipExisting {
            plans.push(Plan::Done(ClipResult {
                action: Some(action),
                ..ClipResult::skipped(feature.fid, output, tiles.len(), SKIP_OUTPUT_EXISTS)
            }));
            continue;
        }

        plans.push(Plan::Job(ClipJob {
            fid: feature.fid,
            polygon: feature.geometry.clone(),
            tiles,
            output,
            action,
        }));
    }

    Ok(plans)
}

type Finished = (usize, ClipJob, Result<u64, JobError>);

struct Tally<'a> {
    results: Vec<Option<ClipResult>>,
    done: u64,
    total: u64,
    reporter: &'a dyn ProgressReporter,
}

impl Tally<'_> {
    fn record(&mut self, slot: usize, result: ClipResult) {
        self.done += 1;
        self.reporter.report(ProgressEvent::Clipping {
            n: self.done,
            total: self.total,
            fid: result.fid,
            status: result.status,
        });
        self.results[slot] = Some(result);
    }

    fn finish(&mut self, (slot, job, outcome): Finished) {
        let result = match outcome {
            Ok(points) => {
                tracing::info!(fid = job.fid, output = %job.output.display(), points, "clip succeeded");
                ClipResult::succeeded(&job, points)
            }
            Err(e) => {
                tracing::warn!(fid = job.fid, output = %job.output.display(), error = %e, "clip failed");
                ClipResult {
                    action: Some(job.action),
                    ..ClipResult::failed(job.fid, Some(job.output.clone()), job.tiles.len(), &e)
                }
            }
        };
        self.record(slot, result);
    }
}

/// Run one clip, turning a panic into a failure of that job alone.
fn clip_isolated(executor: &dyn ClipExecutor, job: &ClipJob) -> Result<u64, JobError> {
    match panic::catch_unwind(AssertUnwindSafe(|| {
        executor.clip(&job.tiles, &job.polygon, &job.output)
    })) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let _ = std::fs::remove_file(partial_path(&job.output));
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(JobError::ClipExecutionFailure {
                detail: format!("clip panicked: {}", message),
            })
        }
    }
}

/// Plan and execute clip jobs for every polygon.
pub async fn run(
    polygons: &[PolygonFeature],
    matcher: &dyn TileMatcher,
    executor: Arc<dyn ClipExecutor>,
    options: &RunOptions,
    reporter: &dyn ProgressReporter,
    cancel: &CancelFlag,
) -> Result<BatchReport> {
    let started_at = Utc::now();
    let plans = plan(polygons, matcher, options)?;

    let mut tally = Tally {
        results: vec![None; plans.len()],
        done: 0,
        total: plans.len() as u64,
        reporter,
    };

    let mut jobs = Vec::new();
    for (slot, plan) in plans.into_iter().enumerate() {
        match plan {
            Plan::Done(result) => tally.record(slot, result),
            Plan::Job(job) if options.dry_run => tally.record(slot, ClipResult::planned(&job)),
            Plan::Job(job) => jobs.push((slot, job)),
        }
    }

    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut set: JoinSet<Finished> = JoinSet::new();

    for (slot, job) in jobs {
        // Wait for a free slot, recording jobs as they finish.
        let permit = loop {
            if let Ok(permit) = semaphore.clone().try_acquire_owned() {
                break permit;
            }
            match set.join_next().await {
                Some(joined) => tally.finish(joined?),
                None => break semaphore.clone().acquire_owned().await?,
            }
        };

        if cancel.is_cancelled() {
            drop(permit);
            tally.record(
                slot,
                ClipResult::skipped(job.fid, job.output.clone(), job.tiles.len(), SKIP_CANCELLED),
            );
            continue;
        }

        let executor = executor.clone();
        set.spawn_blocking(move || {
            let _permit = permit;
            let outcome = clip_isolated(executor.as_ref(), &job);
            (slot, job, outcome)
        });
    }

    while let Some(joined) = set.join_next().await {
        tally.finish(joined?);
    }

    let results: Vec<ClipResult> = tally.results.into_iter().flatten().collect();
    Ok(BatchReport {
        dry_run: options.dry_run,
        cancelled: cancel.is_cancelled(),
        started_at,
        finished_at: Utc::now(),
        results,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crs::Crs;
    use crate::matcher::{BoundingBoxMatcher, TileSpatialIndex};
    use crate::models::{AttributeValue, BoundaryMode, ClipStatus, TileIndex, TileRecord};
    use crate::progress::NoProgress;
    use geo::{Coord, MultiPolygon, Polygon, Rect};
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> Polygon<f64> {
        Rect::new(Coord { x: x0, y: y0 }, Coord { x: x1, y: y1 }).to_polygon()
    }

    fn feature(fid: i64, name: Option<&str>, poly: Polygon<f64>) -> PolygonFeature {
        let mut attributes = BTreeMap::new();
        attributes.insert(
            "name".to_string(),
            name.map(|n| AttributeValue::Text(n.into()))
                .unwrap_or(AttributeValue::Null),
        );
        PolygonFeature {
            fid,
            attributes,
            geometry: MultiPolygon::new(vec![poly]),
        }
    }

    fn matcher() -> BoundingBoxMatcher {
        let records = vec![rect(0.0, 0.0, 10.0, 10.0), rect(10.0, 0.0, 20.0, 10.0)]
            .into_iter()
            .enumerate()
            .map(|(i, footprint)| TileRecord {
                fid: i as i64 + 1,
                path: PathBuf::from(format!("/tiles/t{}.las", i + 1)),
                footprint,
                crs: Crs::Epsg(2056),
                point_count: 1,
            })
            .collect();
        BoundingBoxMatcher::new(Arc::new(TileSpatialIndex::new(TileIndex {
            location: PathBuf::from("tindex.gpkg"),
            layer: "las_tiles".into(),
            crs: Crs::Epsg(2056),
            boundary_mode: BoundaryMode::Fast,
            records,
        })))
    }

    /// Records calls and writes a marker file instead of clipping.
    #[derive(Default)]
    struct FakeExecutor {
        calls: Mutex<Vec<(PathBuf, usize)>>,
    }

    impl ClipExecutor for FakeExecutor {
        fn clip(&self, tiles: &[PathBuf], _polygon: &MultiPolygon<f64>, output: &Path) -> Result<u64, JobError> {
            self.calls.lock().unwrap().push((output.to_path_buf(), tiles.len()));
            if output.file_stem().map(|s| s == "corrupt").unwrap_or(false) {
                panic!("decoder blew up");
            }
            if output.file_stem().map(|s| s == "broken").unwrap_or(false) {
                return Err(JobError::ClipExecutionFailure {
                    detail: "simulated".into(),
                });
            }
            std::fs::write(output, b"clip")?;
            Ok(tiles.len() as u64 * 100)
        }
    }

    fn options(dir: &Path) -> RunOptions {
        RunOptions {
            output_dir: dir.to_path_buf(),
            naming: NamingOptions {
                field: "name".into(),
                suffix: None,
                extension: "laz".into(),
            },
            overwrite: false,
            dry_run: false,
            concurrency: 2,
        }
    }

    #[tokio::test]
    async fn outcomes_follow_polygon_order() {
        let tmp = TempDir::new().unwrap();
        let polygons = vec![
            feature(1, Some("west"), rect(1.0, 1.0, 2.0, 2.0)),
            feature(2, None, rect(1.0, 1.0, 2.0, 2.0)),
            feature(3, Some("far"), rect(100.0, 100.0, 101.0, 101.0)),
            feature(4, Some("broken"), rect(12.0, 1.0, 13.0, 2.0)),
            feature(5, Some("both"), rect(8.0, 1.0, 12.0, 2.0)),
        ];
        let executor = Arc::new(FakeExecutor::default());
        let report = run(
            &polygons,
            &matcher(),
            executor.clone(),
            &options(tmp.path()),
            &NoProgress,
            &CancelFlag::new(),
        )
        .await
        .unwrap();

        let statuses: Vec<ClipStatus> = report.results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                ClipStatus::Succeeded,
                ClipStatus::Failed,
                ClipStatus::Skipped,
                ClipStatus::Failed,
                ClipStatus::Succeeded,
            ]
        );
        assert_eq!(report.result_for(2).unwrap().error_kind.as_deref(), Some("MissingNamingValue"));
        assert_eq!(report.result_for(3).unwrap().reason.as_deref(), Some(SKIP_NO_TILES));
        assert_eq!(report.result_for(5).unwrap().point_count, Some(200));
        assert!(!tmp.path().join("far.laz").exists());
        assert_eq!(executor.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn existing_outputs_are_skipped_unless_overwrite() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("west.laz"), b"old").unwrap();
        let polygons = vec![feature(1, Some("west"), rect(1.0, 1.0, 2.0, 2.0))];

        let executor = Arc::new(FakeExecutor::default());
        let report = run(&polygons, &matcher(), executor.clone(), &options(tmp.path()), &NoProgress, &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(report.results[0].reason.as_deref(), Some(SKIP_OUTPUT_EXISTS));
        assert_eq!(report.results[0].action, Some(ClipAction::SkipExisting));
        assert!(executor.calls.lock().unwrap().is_empty());

        let mut opts = options(tmp.path());
        opts.overwrite = true;
        let report = run(&polygons, &matcher(), executor.clone(), &opts, &NoProgress, &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(report.results[0].status, ClipStatus::Succeeded);
        assert_eq!(report.results[0].action, Some(ClipAction::Overwrite));
    }

    #[tokio::test]
    async fn duplicate_output_paths_abort_before_dispatch() {
        let tmp = TempDir::new().unwrap();
        let polygons = vec![
            feature(1, Some("same"), rect(1.0, 1.0, 2.0, 2.0)),
            feature(2, Some("same"), rect(3.0, 3.0, 4.0, 4.0)),
        ];
        let executor = Arc::new(FakeExecutor::default());
        let err = run(&polygons, &matcher(), executor.clone(), &options(tmp.path()), &NoProgress, &CancelFlag::new())
            .await
            .unwrap_err();
        match err.downcast_ref::<DiceError>() {
            Some(DiceError::DuplicateOutputPath { first_fid, second_fid, .. }) => {
                assert_eq!((*first_fid, *second_fid), (1, 2));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(executor.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dry_run_plans_without_executing() {
        let tmp = TempDir::new().unwrap();
        let polygons = vec![feature(1, Some("west"), rect(1.0, 1.0, 2.0, 2.0))];
        let mut opts = options(tmp.path());
        opts.dry_run = true;
        let executor = Arc::new(FakeExecutor::default());
        let report = run(&polygons, &matcher(), executor.clone(), &opts, &NoProgress, &CancelFlag::new())
            .await
            .unwrap();
        assert!(report.dry_run);
        assert_eq!(report.planned(), 1);
        assert_eq!(report.results[0].action, Some(ClipAction::Build));
        assert!(executor.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_runs_dispatch_nothing_further() {
        let tmp = TempDir::new().unwrap();
        let polygons = vec![
            feature(1, Some("a"), rect(1.0, 1.0, 2.0, 2.0)),
            feature(2, Some("b"), rect(3.0, 3.0, 4.0, 4.0)),
        ];
        let cancel = CancelFlag::new();
        cancel.cancel();
        let executor = Arc::new(FakeExecutor::default());
        let report = run(&polygons, &matcher(), executor.clone(), &options(tmp.path()), &NoProgress, &cancel)
            .await
            .unwrap();
        assert!(report.cancelled);
        assert!(report
            .results
            .iter()
            .all(|r| r.reason.as_deref() == Some(SKIP_CANCELLED)));
        assert!(executor.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn panicking_job_fails_alone() {
        let tmp = TempDir::new().unwrap();
        let polygons = vec![
            feature(1, Some("good"), rect(1.0, 1.0, 2.0, 2.0)),
            feature(2, Some("corrupt"), rect(3.0, 3.0, 4.0, 4.0)),
            feature(3, Some("fine"), rect(12.0, 1.0, 13.0, 2.0)),
        ];
        let executor = Arc::new(FakeExecutor::default());
        let report = run(
            &polygons,
            &matcher(),
            executor.clone(),
            &options(tmp.path()),
            &NoProgress,
            &CancelFlag::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 1);
        let corrupt = report.result_for(2).unwrap();
        assert_eq!(corrupt.error_kind.as_deref(), Some("ClipExecutionFailure"));
        assert!(corrupt.error.as_deref().unwrap().contains("decoder blew up"));
        assert!(tmp.path().join("good.laz").exists());
        assert!(tmp.path().join("fine.laz").exists());
    }
}
