//! Core data models used throughout LAS Dice.
//!
//! These types represent the polygons, tile records, clip jobs and results
//! that flow through the clip pipeline.

use chrono::{DateTime, Utc};
use geo::{MultiPolygon, Polygon};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::crs::Crs;
use crate::error::{DiceError, JobError};

/// Skip reason when no tile footprint intersects the polygon.
pub const SKIP_NO_TILES: &str = "no-intersecting-tiles";
/// Skip reason when the output file is already present.
pub const SKIP_OUTPUT_EXISTS: &str = "output-exists";
/// Skip reason for jobs left undispatched after cancellation.
pub const SKIP_CANCELLED: &str = "cancelled";

/// A single attribute value read from a polygon layer.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Null => write!(f, "NULL"),
            AttributeValue::Integer(v) => write!(f, "{}", v),
            // Reals keep a fractional digit so 12.0 never reads as the integer 12.
            AttributeValue::Real(v) if v.is_finite() && v.fract() == 0.0 => write!(f, "{:.1}", v),
            AttributeValue::Real(v) => write!(f, "{}", v),
            AttributeValue::Text(v) => write!(f, "{}", v),
        }
    }
}

/// A polygon feature read from the polygon source.
#[derive(Debug, Clone)]
pub struct PolygonFeature {
    /// Primary key of the feature in its source layer.
    pub fid: i64,
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Empty when the source row has a null geometry.
    pub geometry: MultiPolygon<f64>,
}

impl PolygonFeature {
    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }
}

/// How tile footprints are derived when the index is built, and which
/// predicate is used to match polygons against them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BoundaryMode {
    /// Header bounding boxes; bbox intersection is the final predicate.
    #[default]
    Fast,
    /// Point-derived boundaries; bbox pre-filter then geometric intersection.
    Exact,
}

impl BoundaryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BoundaryMode::Fast => "fast",
            BoundaryMode::Exact => "exact",
        }
    }
}

impl fmt::Display for BoundaryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BoundaryMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" => Ok(BoundaryMode::Fast),
            "exact" => Ok(BoundaryMode::Exact),
            other => anyhow::bail!("Unknown boundary mode: '{}'. Must be fast or exact.", other),
        }
    }
}

/// One point-cloud tile in the tile index.
#[derive(Debug, Clone)]
pub struct TileRecord {
    pub fid: i64,
    /// Absolute path to the LAS/LAZ file.
    pub path: PathBuf,
    pub footprint: Polygon<f64>,
    pub crs: Crs,
    pub point_count: u64,
}

/// The tile index loaded from its GeoPackage layer.
#[derive(Debug, Clone)]
pub struct TileIndex {
    pub location: PathBuf,
    pub layer: String,
    pub crs: Crs,
    pub boundary_mode: BoundaryMode,
    pub records: Vec<TileRecord>,
}

/// Metadata reported by the tile index validator.
#[derive(Debug, Clone, Serialize)]
pub struct IndexMetadata {
    pub location: PathBuf,
    pub layer: String,
    pub record_count: u64,
    /// `None` when the layer's spatial reference is undefined.
    pub crs: Option<String>,
    pub geometry_type: String,
    /// `None` for layers not written by `build-tindex`.
    pub boundary_mode: Option<BoundaryMode>,
    pub sample_paths: Vec<String>,
}

impl IndexMetadata {
    /// Pre-clip gate: an index without records can never match a polygon.
    pub fn require_records(&self) -> Result<(), DiceError> {
        if self.record_count == 0 {
            return Err(DiceError::EmptyIndex {
                path: self.location.clone(),
                layer: self.layer.clone(),
            });
        }
        Ok(())
    }
}

/// What the orchestrator decided to do with a polygon whose tiles matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClipAction {
    Build,
    Overwrite,
    SkipExisting,
}

impl ClipAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClipAction::Build => "build",
            ClipAction::Overwrite => "overwrite",
            ClipAction::SkipExisting => "skip-existing",
        }
    }
}

/// A planned clip of one polygon. Created and consumed within one run.
#[derive(Debug, Clone)]
pub struct ClipJob {
    pub fid: i64,
    pub polygon: MultiPolygon<f64>,
    pub tiles: Vec<PathBuf>,
    pub output: PathBuf,
    pub action: ClipAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClipStatus {
    Skipped,
    Succeeded,
    Failed,
    /// Dry runs only: the job would have been executed.
    Planned,
}

impl ClipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClipStatus::Skipped => "skipped",
            ClipStatus::Succeeded => "succeeded",
            ClipStatus::Failed => "failed",
            ClipStatus::Planned => "planned",
        }
    }
}

/// Outcome of one polygon. Flat so it serializes cleanly to JSON Lines and CSV.
#[derive(Debug, Clone, Serialize)]
pub struct ClipResult {
    pub fid: i64,
    pub output: Option<PathBuf>,
    pub status: ClipStatus,
    pub action: Option<ClipAction>,
    pub tiles: usize,
    pub point_count: Option<u64>,
    pub reason: Option<String>,
    pub error_kind: Option<String>,
    pub error: Option<String>,
}

impl ClipResult {
    fn base(fid: i64, output: Option<PathBuf>, status: ClipStatus, tiles: usize) -> Self {
        Self {
            fid,
            output,
            status,
            action: None,
            tiles,
            point_count: None,
            reason: None,
            error_kind: None,
            error: None,
        }
    }

    pub fn skipped(fid: i64, output: PathBuf, tiles: usize, reason: &str) -> Self {
        Self {
            reason: Some(reason.to_string()),
            ..Self::base(fid, Some(output), ClipStatus::Skipped, tiles)
        }
    }

    pub fn succeeded(job: &ClipJob, point_count: u64) -> Self {
        Self {
            action: Some(job.action),
            point_count: Some(point_count),
            ..Self::base(job.fid, Some(job.output.clone()), ClipStatus::Succeeded, job.tiles.len())
        }
    }

    pub fn failed(fid: i64, output: Option<PathBuf>, tiles: usize, err: &JobError) -> Self {
        Self {
            error_kind: Some(err.kind().to_string()),
            error: Some(err.to_string()),
            ..Self::base(fid, output, ClipStatus::Failed, tiles)
        }
    }

    pub fn planned(job: &ClipJob) -> Self {
        Self {
            action: Some(job.action),
            ..Self::base(job.fid, Some(job.output.clone()), ClipStatus::Planned, job.tiles.len())
        }
    }
}

/// Terminal artifact of a run.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub dry_run: bool,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// One entry per polygon, in polygon source order.
    pub results: Vec<ClipResult>,
}

impl BatchReport {
    fn count(&self, status: ClipStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(ClipStatus::Succeeded)
    }

    pub fn skipped(&self) -> usize {
        self.count(ClipStatus::Skipped)
    }

    pub fn failed(&self) -> usize {
        self.count(ClipStatus::Failed)
    }

    pub fn planned(&self) -> usize {
        self.count(ClipStatus::Planned)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ClipResult> {
        self.results
            .iter()
            .filter(|r| r.status == ClipStatus::Failed)
    }

    pub fn result_for(&self, fid: i64) -> Option<&ClipResult> {
        self.results.iter().find(|r| r.fid == fid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_mode_parses_case_insensitively() {
        assert_eq!("FAST".parse::<BoundaryMode>().unwrap(), BoundaryMode::Fast);
        assert_eq!(" exact".parse::<BoundaryMode>().unwrap(), BoundaryMode::Exact);
        assert!("hexbin".parse::<BoundaryMode>().is_err());
    }

    #[test]
    fn empty_index_fails_gate() {
        let meta = IndexMetadata {
            location: PathBuf::from("tindex.gpkg"),
            layer: "las_tiles".into(),
            record_count: 0,
            crs: Some("EPSG:2056".into()),
            geometry_type: "POLYGON".into(),
            boundary_mode: Some(BoundaryMode::Fast),
            sample_paths: vec![],
        };
        assert!(matches!(
            meta.require_records(),
            Err(DiceError::EmptyIndex { .. })
        ));
    }

    #[test]
    fn report_counts_by_status() {
        let now = Utc::now();
        let report = BatchReport {
            dry_run: false,
            cancelled: false,
            started_at: now,
            finished_at: now,
            results: vec![
                ClipResult::skipped(1, PathBuf::from("a.laz"), 0, SKIP_NO_TILES),
                ClipResult::failed(2, None, 0, &JobError::MissingNamingValue { field: "name".into() }),
                ClipResult::skipped(3, PathBuf::from("c.laz"), 2, SKIP_OUTPUT_EXISTS),
            ],
        };
        assert_eq!(report.skipped(), 2);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.succeeded(), 0);
        assert_eq!(report.failures().next().unwrap().fid, 2);
    }
}
