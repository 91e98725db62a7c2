//! End-to-end flows.
//!
//! `run` executes, in order and only if every earlier step succeeds:
//!
//! 1. CRS validation of the polygon source and every tile.
//! 2. Tile index build (when absent or `rebuild_index`) or reuse.
//! 3. Tile index inspection, rejecting empty indexes.
//! 4. Clip orchestration.
//!
//! `clip` skips steps 1–2 and works from an existing index; the index CRS
//! must equal the polygon CRS.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::clipper::{ClipExecutor, LasClipExecutor};
use crate::config::Config;
use crate::crs::{self, GoverningCrs};
use crate::error::DiceError;
use crate::matcher::{matcher_for, TileMatcher, TileSpatialIndex};
use crate::models::{BatchReport, IndexMetadata};
use crate::naming::NamingOptions;
use crate::orchestrator::{self, CancelFlag, RunOptions};
use crate::polygons;
use crate::progress::ProgressReporter;
use crate::tiles::TileWarning;
use crate::tindex::{self, BuildRequest, BuildSummary};

/// Per-invocation switches layered over the config.
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Write outputs. Without it the run is a preview.
    pub execute: bool,
    pub overwrite: bool,
    pub rebuild_index: bool,
    /// Overrides `run.concurrency`.
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub governing: GoverningCrs,
    /// Present when this run (re)built the index.
    pub build: Option<BuildSummary>,
    pub index: IndexMetadata,
    pub report: BatchReport,
}

impl PipelineOutcome {
    /// Unreadable tiles seen during validation and build.
    pub fn warnings(&self) -> Vec<TileWarning> {
        let mut warnings = self.governing.warnings.clone();
        if let Some(build) = &self.build {
            for w in &build.warnings {
                if !warnings.iter().any(|existing| existing.path == w.path) {
                    warnings.push(w.clone());
                }
            }
        }
        warnings
    }
}

/// Build request for the configured index.
pub fn build_request(config: &Config, governing: &GoverningCrs, overwrite: bool) -> BuildRequest {
    BuildRequest {
        tile_roots: config.tiles.roots.clone(),
        discovery: config.tiles.discovery(),
        location: config.tindex.path.clone(),
        layer: config.tindex.layer.clone(),
        boundary_mode: config.tindex.boundary,
        overwrite,
        governing_crs: governing.crs.clone(),
        protected_paths: vec![config.polygons.path.clone()],
    }
}

/// Run the full pipeline described by `config`.
pub async fn run_pipeline(
    config: &Config,
    options: &PipelineOptions,
    reporter: Arc<dyn ProgressReporter>,
    cancel: &CancelFlag,
) -> Result<PipelineOutcome> {
    tindex::check_location(&config.tindex.path, &[config.polygons.path.clone()])?;

    let governing = crs::validate(
        &config.polygons.path,
        config.polygons.layer.as_deref(),
        &config.tiles.roots,
        &config.tiles.discovery(),
    )
    .await?;

    let exists = tindex::index_exists(&config.tindex.path, &config.tindex.layer).await?;
    let build = if !exists || options.rebuild_index {
        let request = build_request(config, &governing, options.rebuild_index);
        Some(tindex::build(&request, reporter.clone()).await?)
    } else {
        tracing::info!(index = %config.tindex.path.display(), "reusing existing tile index");
        None
    };

    let naming = config.naming();
    let run_options = RunOptions {
        output_dir: config.output.dir.clone(),
        naming,
        overwrite: options.overwrite || config.run.overwrite,
        dry_run: !options.execute,
        concurrency: options.concurrency.unwrap_or(config.run.concurrency),
    };

    let (index, report) = clip_from_index(
        &config.polygons.path,
        config.polygons.layer.as_deref(),
        &config.tindex.path,
        &config.tindex.layer,
        &run_options,
        Arc::new(LasClipExecutor),
        reporter.as_ref(),
        cancel,
    )
    .await?;

    Ok(PipelineOutcome {
        governing,
        build,
        index,
        report,
    })
}

/// Inspect an existing index, check it against the polygon CRS and
/// orchestrate the clips.
#[allow(clippy::too_many_arguments)]
pub async fn clip_from_index(
    polygon_source: &Path,
    polygon_layer: Option<&str>,
    index_location: &Path,
    index_layer: &str,
    options: &RunOptions,
    executor: Arc<dyn ClipExecutor>,
    reporter: &dyn ProgressReporter,
    cancel: &CancelFlag,
) -> Result<(IndexMetadata, BatchReport)> {
    let metadata = tindex::inspect(index_location, index_layer).await?;
    metadata.require_records()?;

    let layer = polygons::read_polygons(polygon_source, polygon_layer).await?;
    let polygon_crs = layer.crs.clone().ok_or_else(|| DiceError::UndefinedCrs {
        origin: polygon_source.to_path_buf(),
    })?;

    let index = tindex::load(index_location, index_layer).await?;
    if index.crs != polygon_crs {
        return Err(DiceError::MixedCrs {
            first: polygon_source.to_path_buf(),
            first_crs: polygon_crs.to_string(),
            second: index_location.to_path_buf(),
            second_crs: index.crs.to_string(),
        }
        .into());
    }

    let mode = index.boundary_mode;
    let spatial = Arc::new(TileSpatialIndex::new(index));
    let matcher = matcher_for(mode, spatial);
    tracing::info!(
        polygons = layer.features.len(),
        tiles = metadata.record_count,
        matcher = matcher.name(),
        dry_run = options.dry_run,
        "starting clip"
    );

    let report = orchestrator::run(
        &layer.features,
        matcher.as_ref(),
        executor,
        options,
        reporter,
        cancel,
    )
    .await?;

    Ok((metadata, report))
}

/// Inputs of the config-free `clip` command.
#[derive(Debug, Clone)]
pub struct DirectClip {
    pub polygons: PathBuf,
    pub layer: Option<String>,
    pub index: PathBuf,
    pub index_layer: String,
    pub output_dir: PathBuf,
    pub naming: NamingOptions,
    pub overwrite: bool,
    pub execute: bool,
    pub concurrency: usize,
}

/// Clip with explicit paths and no config file.
pub async fn run_direct(
    request: &DirectClip,
    reporter: Arc<dyn ProgressReporter>,
    cancel: &CancelFlag,
) -> Result<(IndexMetadata, BatchReport)> {
    tindex::check_location(&request.index, &[request.polygons.clone()])?;
    let options = RunOptions {
        output_dir: request.output_dir.clone(),
        naming: request.naming.clone(),
        overwrite: request.overwrite,
        dry_run: !request.execute,
        concurrency: request.concurrency,
    };
    clip_from_index(
        &request.polygons,
        request.layer.as_deref(),
        &request.index,
        &request.index_layer,
        &options,
        Arc::new(LasClipExecutor),
        reporter.as_ref(),
        cancel,
    )
    .await
}
