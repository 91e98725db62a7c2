//! Point-cloud tile discovery and header access.
//!
//! Tiles are found by walking the configured roots and filtering relative
//! paths through include/exclude glob sets (case-insensitive, so `.LAZ`
//! matches `**/*.laz`). Headers are read through the `las` crate without
//! decoding point records; only the `exact` footprint mode streams points.

use anyhow::{bail, Result};
use geo::{Area, ConvexHull, Coord, MultiPoint, Polygon, Rect};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::Serialize;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::crs::{crs_from_vlrs, Crs};
use crate::models::BoundaryMode;

/// Grid resolution used to collect boundary candidates in `exact` mode.
const BOUNDARY_GRID: usize = 512;

/// Controls which files under the tile roots are treated as tiles.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub include_globs: Vec<String>,
    pub exclude_globs: Vec<String>,
    pub follow_symlinks: bool,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

pub fn default_include_globs() -> Vec<String> {
    vec!["**/*.las".to_string(), "**/*.laz".to_string()]
}

/// Header facts about one tile.
#[derive(Debug, Clone)]
pub struct TileHeader {
    pub path: PathBuf,
    pub crs: Option<Crs>,
    pub bounds: Rect<f64>,
    pub point_count: u64,
}

/// A tile that could not be read. Advisory only.
#[derive(Debug, Clone, Serialize)]
pub struct TileWarning {
    pub path: PathBuf,
    pub reason: String,
}

/// Recursively discover tiles under `roots`.
///
/// Returns absolute, sorted, de-duplicated paths. A root may also name a
/// single file, which is kept when its file name matches the include set.
pub fn discover_tiles(roots: &[PathBuf], options: &DiscoveryOptions) -> Result<Vec<PathBuf>> {
    if roots.is_empty() {
        bail!("At least one tile root is required");
    }

    let include_set = build_globset(&options.include_globs)?;
    let exclude_set = build_globset(&options.exclude_globs)?;

    let mut tiles = Vec::new();
    for root in roots {
        if !root.exists() {
            bail!("Tile root does not exist: {}", root.display());
        }
        let root = root.canonicalize()?;

        if root.is_file() {
            let name = root
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if include_set.is_match(&name) && !exclude_set.is_match(&name) {
                tiles.push(root);
            }
            continue;
        }

        for entry in WalkDir::new(&root).follow_links(options.follow_symlinks) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(&root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().replace('\\', "/");

            if exclude_set.is_match(&rel_str) {
                continue;
            }
            if !include_set.is_match(&rel_str) {
                continue;
            }
            tiles.push(path.to_path_buf());
        }
    }

    // Sort for deterministic ordering
    tiles.sort();
    tiles.dedup();
    Ok(tiles)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(GlobBuilder::new(pattern).case_insensitive(true).build()?);
    }
    Ok(builder.build()?)
}

/// Read the header of a single tile.
pub fn read_header(path: &Path) -> Result<TileHeader> {
    let reader = las::Reader::from_path(path)?;
    let header = reader.header();
    let bounds = header.bounds();
    Ok(TileHeader {
        path: path.to_path_buf(),
        crs: crs_from_vlrs(header.vlrs().iter().chain(header.evlrs().iter())),
        bounds: Rect::new(
            Coord {
                x: bounds.min.x,
                y: bounds.min.y,
            },
            Coord {
                x: bounds.max.x,
                y: bounds.max.y,
            },
        ),
        point_count: header.number_of_points(),
    })
}

/// Read many headers, separating unreadable tiles into warnings.
pub fn read_headers(paths: &[PathBuf]) -> (Vec<TileHeader>, Vec<TileWarning>) {
    let mut headers = Vec::with_capacity(paths.len());
    let mut warnings = Vec::new();
    for path in paths {
        match read_header(path) {
            Ok(header) => headers.push(header),
            Err(e) => warnings.push(TileWarning {
                path: path.clone(),
                reason: e.to_string(),
            }),
        }
    }
    (headers, warnings)
}

/// Compute the index footprint of a tile.
pub fn footprint(header: &TileHeader, mode: BoundaryMode) -> Result<Polygon<f64>> {
    match mode {
        BoundaryMode::Fast => Ok(header.bounds.to_polygon()),
        BoundaryMode::Exact => point_boundary(&header.path, header.bounds),
    }
}

/// Convex hull of the extreme points of every grid row and column.
///
/// Falls back to the header bounds for empty or degenerate tiles.
fn point_boundary(path: &Path, bounds: Rect<f64>) -> Result<Polygon<f64>> {
    let mut reader = las::Reader::from_path(path)?;
    let mut grid = ExtremeGrid::new(bounds, BOUNDARY_GRID);
    for point in reader.points() {
        let point = point?;
        grid.add(Coord {
            x: point.x,
            y: point.y,
        });
    }

    let candidates = grid.into_coords();
    if candidates.len() < 3 {
        return Ok(bounds.to_polygon());
    }
    let hull = MultiPoint::from(candidates).convex_hull();
    if hull.unsigned_area() <= 0.0 {
        return Ok(bounds.to_polygon());
    }
    Ok(hull)
}

/// Tracks, per column, the lowest and highest point and, per row, the
/// left- and right-most point.
///
/// A hull vertex can sit up to one cell away from the tracked extreme of its
/// column or row, so each extreme is emitted at both edges of its cell. The
/// hull of those candidates contains every added point.
struct ExtremeGrid {
    origin: Coord<f64>,
    max: Coord<f64>,
    cell: Coord<f64>,
    size: usize,
    columns: Vec<Option<(Coord<f64>, Coord<f64>)>>,
    rows: Vec<Option<(Coord<f64>, Coord<f64>)>>,
}

impl ExtremeGrid {
    fn new(bounds: Rect<f64>, size: usize) -> Self {
        let cell_w = bounds.width() / size as f64;
        let cell_h = bounds.height() / size as f64;
        Self {
            origin: bounds.min(),
            max: bounds.max(),
            cell: Coord {
                x: if cell_w > 0.0 { cell_w } else { 1.0 },
                y: if cell_h > 0.0 { cell_h } else { 1.0 },
            },
            size,
            columns: vec![None; size],
            rows: vec![None; size],
        }
    }

    fn bucket(&self, value: f64, origin: f64, cell: f64) -> usize {
        let idx = ((value - origin) / cell).floor();
        (idx.max(0.0) as usize).min(self.size - 1)
    }

    /// Extent of cell `i` along one axis, clamped to the bounds and widened
    /// to cover points outside them.
    fn span(&self, i: usize, origin: f64, cell: f64, max: f64, a: f64, b: f64) -> (f64, f64) {
        let lo = (origin + i as f64 * cell).min(max);
        let hi = if i + 1 == self.size {
            max
        } else {
            (origin + (i + 1) as f64 * cell).min(max)
        };
        (lo.min(a).min(b), hi.max(a).max(b))
    }

    fn add(&mut self, c: Coord<f64>) {
        let col = self.bucket(c.x, self.origin.x, self.cell.x);
        let row = self.bucket(c.y, self.origin.y, self.cell.y);

        let column = &mut self.columns[col];
        *column = Some(match *column {
            None => (c, c),
            Some((low, high)) => (
                if c.y < low.y { c } else { low },
                if c.y > high.y { c } else { high },
            ),
        });

        let row = &mut self.rows[row];
        *row = Some(match *row {
            None => (c, c),
            Some((left, right)) => (
                if c.x < left.x { c } else { left },
                if c.x > right.x { c } else { right },
            ),
        });
    }

    fn into_coords(self) -> Vec<Coord<f64>> {
        let mut coords = Vec::new();
        for (i, extremes) in self.columns.iter().enumerate() {
            if let Some((low, high)) = extremes {
                let (x0, x1) = self.span(i, self.origin.x, self.cell.x, self.max.x, low.x, high.x);
                for y in [low.y, high.y] {
                    coords.push(Coord { x: x0, y });
                    coords.push(Coord { x: x1, y });
                }
            }
        }
        for (i, extremes) in self.rows.iter().enumerate() {
            if let Some((left, right)) = extremes {
                let (y0, y1) = self.span(i, self.origin.y, self.cell.y, self.max.y, left.y, right.y);
                for x in [left.x, right.x] {
                    coords.push(Coord { x, y: y0 });
                    coords.push(Coord { x, y: y1 });
                }
            }
        }
        coords.sort_by(|a, b| {
            a.x.partial_cmp(&b.x)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.y.partial_cmp(&b.y).unwrap_or(std::cmp::Ordering::Equal))
        });
        coords.dedup();
        coords
    }
}
