//! Tile index build, load and inspection.
//!
//! The tile index is a GeoPackage feature layer with one record per
//! readable tile:
//!
//! | Column | Type | Content |
//! |--------|------|---------|
//! | `fid` | INTEGER PK | record id |
//! | `geom` | POLYGON | footprint (header bbox or point-derived boundary) |
//! | `filepath` | TEXT | absolute tile path |
//! | `crs` | TEXT | tile CRS key, always the governing CRS |
//! | `point_count` | INTEGER | point count from the header |
//!
//! The build mode is recorded in the layer's `gpkg_contents.description`
//! as `boundary=fast` or `boundary=exact`.
//!
//! The index must never live in the polygon source file, and a rebuild
//! replaces the layer inside a single transaction.

use anyhow::Result;
use geo::{BoundingRect, Geometry, Polygon, Rect};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::crs::Crs;
use crate::error::DiceError;
use crate::gpkg::{self, FieldType, LayerInfo, LayerSpec};
use crate::models::{AttributeValue, BoundaryMode, IndexMetadata, TileIndex, TileRecord};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::tiles::{self, DiscoveryOptions, TileWarning};

pub const DEFAULT_LAYER: &str = "las_tiles";
/// Attribute holding the tile path.
pub const PATH_FIELD: &str = "filepath";
const CRS_FIELD: &str = "crs";
const COUNT_FIELD: &str = "point_count";
const BOUNDARY_PREFIX: &str = "boundary=";
const SAMPLE_LIMIT: i64 = 5;

/// Everything the builder needs. No prompting happens past this point.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub tile_roots: Vec<PathBuf>,
    pub discovery: DiscoveryOptions,
    pub location: PathBuf,
    pub layer: String,
    pub boundary_mode: BoundaryMode,
    pub overwrite: bool,
    pub governing_crs: Crs,
    /// Files the index must never be written into (the polygon source).
    pub protected_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct BuildSummary {
    pub location: PathBuf,
    pub layer: String,
    pub boundary_mode: BoundaryMode,
    pub indexed: usize,
    /// Tiles excluded because they could not be read.
    pub warnings: Vec<TileWarning>,
}

/// Resolve a path for comparison even when the file does not exist yet.
fn normalize(path: &Path) -> PathBuf {
    if let Ok(p) = path.canonicalize() {
        return p;
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|d| d.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|p| p.join(name))
            .unwrap_or(absolute),
        _ => absolute,
    }
}

/// Reject index locations that coincide with a protected file.
pub fn check_location(location: &Path, protected: &[PathBuf]) -> Result<(), DiceError> {
    let target = normalize(location);
    if protected.iter().any(|p| normalize(p) == target) {
        return Err(DiceError::UnsafeIndexLocation {
            index: location.to_path_buf(),
        });
    }
    Ok(())
}

fn unreadable(path: &Path, err: impl std::fmt::Display) -> anyhow::Error {
    DiceError::IndexUnreadable {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
    .into()
}

fn not_found(path: &Path, layer: &str) -> anyhow::Error {
    DiceError::IndexNotFound {
        path: path.to_path_buf(),
        layer: layer.to_string(),
    }
    .into()
}

/// Whether `layer` exists in the GeoPackage at `location`.
pub async fn index_exists(location: &Path, layer: &str) -> Result<bool> {
    if !location.is_file() {
        return Ok(false);
    }
    let pool = gpkg::open_read_only(location)
        .await
        .map_err(|e| unreadable(location, e))?;
    let info = gpkg::layer_info(&pool, layer)
        .await
        .map_err(|e| unreadable(location, e))?;
    pool.close().await;
    Ok(info.is_some())
}

/// One tile ready to be written.
struct IndexedTile {
    path: PathBuf,
    footprint: Polygon<f64>,
    point_count: u64,
}

/// Header and footprint of one tile. Unreadable tiles come back as
/// warnings; a CRS mismatch is fatal.
fn scan_tile(
    path: &Path,
    mode: BoundaryMode,
    governing: &Crs,
) -> Result<Result<IndexedTile, TileWarning>, DiceError> {
    let header = match tiles::read_header(path) {
        Ok(header) => header,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "skipping unreadable tile");
            return Ok(Err(TileWarning {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }));
        }
    };

    match &header.crs {
        Some(crs) if crs == governing => {}
        other => {
            return Err(DiceError::InconsistentCrs {
                path: path.to_path_buf(),
                expected: governing.to_string(),
                found: other
                    .as_ref()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "undefined".to_string()),
            });
        }
    }

    Ok(match tiles::footprint(&header, mode) {
        Ok(footprint) => Ok(IndexedTile {
            path: header.path,
            footprint,
            point_count: header.point_count,
        }),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "could not derive tile boundary");
            Err(TileWarning {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
        }
    })
}

/// Read headers and footprints for every tile. Runs on a blocking thread.
///
/// Every tile, indexed or not, advances the `Indexing` counter by one.
fn scan_tiles(
    paths: &[PathBuf],
    mode: BoundaryMode,
    governing: &Crs,
    reporter: &dyn ProgressReporter,
) -> Result<(Vec<IndexedTile>, Vec<TileWarning>), DiceError> {
    let total = paths.len() as u64;
    let mut indexed = Vec::with_capacity(paths.len());
    let mut warnings = Vec::new();

    for (i, path) in paths.iter().enumerate() {
        match scan_tile(path, mode, governing)? {
            Ok(tile) => indexed.push(tile),
            Err(warning) => warnings.push(warning),
        }
        reporter.report(ProgressEvent::Indexing {
            n: i as u64 + 1,
            total,
        });
    }

    Ok((indexed, warnings))
}

/// Build (or rebuild) the tile index.
pub async fn build(request: &BuildRequest, reporter: Arc<dyn ProgressReporter>) -> Result<BuildSummary> {
    check_location(&request.location, &request.protected_paths)?;

    if index_exists(&request.location, &request.layer).await? && !request.overwrite {
        return Err(DiceError::IndexExists {
            path: request.location.clone(),
            layer: request.layer.clone(),
        }
        .into());
    }

    let paths = tiles::discover_tiles(&request.tile_roots, &request.discovery)?;
    if paths.is_empty() {
        return Err(DiceError::NoTilesFound {
            roots: request.tile_roots.clone(),
        }
        .into());
    }
    reporter.report(ProgressEvent::Scanning {
        tiles: paths.len() as u64,
    });

    let mode = request.boundary_mode;
    let governing = request.governing_crs.clone();
    let scan_reporter = reporter.clone();
    let (indexed, warnings) = tokio::task::spawn_blocking(move || {
        scan_tiles(&paths, mode, &governing, scan_reporter.as_ref())
    })
    .await??;

    let pool = gpkg::open_or_create(&request.location).await?;
    let mut tx = pool.begin().await?;

    gpkg::drop_feature_layer(&mut tx, &request.layer).await?;
    let srs_id = gpkg::register_srs(&mut tx, &request.governing_crs).await?;
    gpkg::create_feature_layer(
        &mut tx,
        &LayerSpec {
            name: request.layer.clone(),
            geometry_type: "POLYGON".to_string(),
            srs_id,
            description: format!("{}{}", BOUNDARY_PREFIX, mode.as_str()),
            fields: vec![
                (PATH_FIELD.to_string(), FieldType::Text),
                (CRS_FIELD.to_string(), FieldType::Text),
                (COUNT_FIELD.to_string(), FieldType::Integer),
            ],
        },
    )
    .await?;

    let crs_key = request.governing_crs.key();
    let mut extent: Option<Rect<f64>> = None;
    for tile in &indexed {
        let attributes = [
            (
                PATH_FIELD.to_string(),
                AttributeValue::Text(tile.path.to_string_lossy().to_string()),
            ),
            (CRS_FIELD.to_string(), AttributeValue::Text(crs_key.clone())),
            (
                COUNT_FIELD.to_string(),
                AttributeValue::Integer(tile.point_count as i64),
            ),
        ];
        gpkg::insert_feature(
            &mut tx,
            &request.layer,
            &Geometry::Polygon(tile.footprint.clone()),
            srs_id,
            &attributes,
        )
        .await?;

        if let Some(rect) = tile.footprint.bounding_rect() {
            extent = Some(match extent {
                None => rect,
                Some(e) => Rect::new(
                    geo::Coord {
                        x: e.min().x.min(rect.min().x),
                        y: e.min().y.min(rect.min().y),
                    },
                    geo::Coord {
                        x: e.max().x.max(rect.max().x),
                        y: e.max().y.max(rect.max().y),
                    },
                ),
            });
        }
    }
    if let Some(extent) = extent {
        gpkg::update_extent(&mut tx, &request.layer, extent).await?;
    }

    tx.commit().await?;
    pool.close().await;

    tracing::info!(
        index = %request.location.display(),
        layer = %request.layer,
        tiles = indexed.len(),
        skipped = warnings.len(),
        boundary = %mode,
        "tile index built"
    );

    Ok(BuildSummary {
        location: request.location.clone(),
        layer: request.layer.clone(),
        boundary_mode: mode,
        indexed: indexed.len(),
        warnings,
    })
}

fn boundary_from_description(description: &str) -> Option<BoundaryMode> {
    description
        .split(|c: char| c == ';' || c.is_whitespace())
        .find_map(|part| part.strip_prefix(BOUNDARY_PREFIX))
        .and_then(|mode| mode.parse().ok())
}

/// Open the index read-only and resolve its layer.
async fn open_layer(location: &Path, layer: &str) -> Result<(sqlx::SqlitePool, LayerInfo)> {
    if !location.is_file() {
        return Err(not_found(location, layer));
    }
    let pool = gpkg::open_read_only(location)
        .await
        .map_err(|e| unreadable(location, e))?;
    let info = gpkg::layer_info(&pool, layer)
        .await
        .map_err(|e| unreadable(location, e))?
        .ok_or_else(|| not_found(location, layer))?;
    if !info.fields.iter().any(|f| f == PATH_FIELD) {
        return Err(unreadable(
            location,
            format!("layer '{}' has no '{}' column", layer, PATH_FIELD),
        ));
    }
    Ok((pool, info))
}

/// Report index metadata without modifying anything.
pub async fn inspect(location: &Path, layer: &str) -> Result<IndexMetadata> {
    let (pool, info) = open_layer(location, layer).await?;

    let record_count = gpkg::count_features(&pool, layer)
        .await
        .map_err(|e| unreadable(location, e))?;
    let sample_paths: Vec<Option<String>> = sqlx::query_scalar(&format!(
        "SELECT {} FROM {} ORDER BY {} LIMIT ?",
        gpkg::quote_ident(PATH_FIELD),
        gpkg::quote_ident(layer),
        gpkg::quote_ident(&info.primary_key)
    ))
    .bind(SAMPLE_LIMIT)
    .fetch_all(&pool)
    .await
    .map_err(|e| unreadable(location, e))?;
    pool.close().await;

    Ok(IndexMetadata {
        location: location.to_path_buf(),
        layer: info.name,
        record_count,
        crs: info.crs.map(|c| c.to_string()),
        geometry_type: info.geometry_type,
        boundary_mode: boundary_from_description(&info.description),
        sample_paths: sample_paths.into_iter().flatten().collect(),
    })
}

/// Load every record of the index.
pub async fn load(location: &Path, layer: &str) -> Result<TileIndex> {
    let (pool, info) = open_layer(location, layer).await?;
    let rows = gpkg::read_features(&pool, &info)
        .await
        .map_err(|e| unreadable(location, format!("{:#}", e)))?;
    pool.close().await;

    let crs = info.crs.clone().ok_or_else(|| DiceError::UndefinedCrs {
        origin: location.to_path_buf(),
    })?;

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let path = match row.attributes.get(PATH_FIELD) {
            Some(AttributeValue::Text(p)) if !p.is_empty() => PathBuf::from(p),
            _ => {
                return Err(unreadable(
                    location,
                    format!("record {} has no {}", row.fid, PATH_FIELD),
                ))
            }
        };
        let footprint = match row.geometry {
            Some(Geometry::Polygon(p)) => p,
            Some(Geometry::MultiPolygon(mut mp)) if mp.0.len() == 1 => mp.0.remove(0),
            Some(Geometry::Rect(r)) => r.to_polygon(),
            _ => {
                return Err(unreadable(
                    location,
                    format!("record {} has no polygon footprint", row.fid),
                ))
            }
        };
        let point_count = match row.attributes.get(COUNT_FIELD) {
            Some(AttributeValue::Integer(n)) if *n >= 0 => *n as u64,
            _ => 0,
        };
        records.push(TileRecord {
            fid: row.fid,
            path,
            footprint,
            crs: crs.clone(),
            point_count,
        });
    }

    Ok(TileIndex {
        location: location.to_path_buf(),
        layer: info.name,
        crs,
        boundary_mode: boundary_from_description(&info.description).unwrap_or_default(),
        records,
    })
}
