//! Polygon source access.
//!
//! The polygon source is a GeoPackage feature layer or an ESRI shapefile.
//! Its CRS governs the whole run, and one of its attribute fields names the
//! outputs.

use anyhow::Result;
use geo::{Geometry, MultiPolygon};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};

use crate::crs::Crs;
use crate::error::DiceError;
use crate::gpkg::{self, LayerInfo};
use crate::models::PolygonFeature;
use crate::shp::{self, ShapefileLayer};
use crate::wkb;

/// All features of one polygon layer.
#[derive(Debug, Clone)]
pub struct PolygonLayer {
    pub path: PathBuf,
    pub layer: String,
    pub crs: Option<Crs>,
    pub fields: Vec<String>,
    pub features: Vec<PolygonFeature>,
}

fn source_error(path: &Path, reason: impl Into<String>) -> anyhow::Error {
    DiceError::PolygonSource {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
    .into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceKind {
    GeoPackage,
    Shapefile,
}

fn source_kind(path: &Path) -> Result<SourceKind> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    let kind = match ext.as_str() {
        "gpkg" => SourceKind::GeoPackage,
        "shp" => SourceKind::Shapefile,
        _ => {
            return Err(source_error(
                path,
                "only GeoPackage (.gpkg) and shapefile (.shp) polygon sources are supported",
            ))
        }
    };
    if !path.is_file() {
        return Err(source_error(path, "file not found"));
    }
    Ok(kind)
}

async fn open(path: &Path) -> Result<SqlitePool> {
    gpkg::open_read_only(path)
        .await
        .map_err(|e| source_error(path, e.to_string()))
}

/// A shapefile holds one unnamed layer, so naming one is a config error.
fn reject_layer(path: &Path, layer: Option<&str>) -> Result<()> {
    match layer {
        Some(name) => Err(source_error(
            path,
            format!("shapefiles have a single layer; unset polygons.layer ('{}')", name),
        )),
        None => Ok(()),
    }
}

async fn read_shapefile(path: &Path) -> Result<ShapefileLayer> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || shp::read(&owned))
        .await?
        .map_err(|e| source_error(path, format!("{:#}", e)))
}

/// Resolve the requested layer. Without a name, the container must hold
/// exactly one feature layer.
async fn resolve_layer(pool: &SqlitePool, path: &Path, layer: Option<&str>) -> Result<LayerInfo> {
    let name = match layer {
        Some(name) => name.to_string(),
        None => {
            let layers = gpkg::feature_layers(pool)
                .await
                .map_err(|e| source_error(path, e.to_string()))?;
            match layers.as_slice() {
                [only] => only.clone(),
                [] => return Err(source_error(path, "no feature layers")),
                many => {
                    return Err(source_error(
                        path,
                        format!(
                            "{} feature layers ({}); set polygons.layer",
                            many.len(),
                            many.join(", ")
                        ),
                    ))
                }
            }
        }
    };

    gpkg::layer_info(pool, &name)
        .await
        .map_err(|e| source_error(path, e.to_string()))?
        .ok_or_else(|| source_error(path, format!("layer '{}' not found", name)))
}

/// Names of the feature layers in a polygon source.
pub async fn list_layers(path: &Path) -> Result<Vec<String>> {
    if source_kind(path)? == SourceKind::Shapefile {
        return Ok(vec![shp::layer_name(path)]);
    }
    let pool = open(path).await?;
    let layers = gpkg::feature_layers(&pool)
        .await
        .map_err(|e| source_error(path, e.to_string()))?;
    pool.close().await;
    Ok(layers)
}

/// The declared CRS of a polygon layer; `None` when undefined.
pub async fn read_layer_crs(path: &Path, layer: Option<&str>) -> Result<Option<Crs>> {
    if source_kind(path)? == SourceKind::Shapefile {
        reject_layer(path, layer)?;
        return shp::read_prj(path).map_err(|e| source_error(path, format!("{:#}", e)));
    }
    let pool = open(path).await?;
    let info = resolve_layer(&pool, path, layer).await?;
    pool.close().await;
    Ok(info.crs)
}

/// What `list-fields` shows about a layer.
#[derive(Debug, Clone)]
pub struct LayerSummary {
    pub name: String,
    pub geometry_type: String,
    pub feature_count: u64,
    pub crs: Option<Crs>,
    pub fields: Vec<String>,
}

/// Geometry type, feature count, CRS and attribute fields of a layer.
pub async fn describe_layer(path: &Path, layer: Option<&str>) -> Result<LayerSummary> {
    if source_kind(path)? == SourceKind::Shapefile {
        reject_layer(path, layer)?;
        let shapefile = read_shapefile(path).await?;
        return Ok(LayerSummary {
            name: shapefile.name,
            geometry_type: shapefile.geometry_type,
            feature_count: shapefile.features.len() as u64,
            crs: shapefile.crs,
            fields: shapefile.fields,
        });
    }
    let pool = open(path).await?;
    let info = resolve_layer(&pool, path, layer).await?;
    let feature_count = gpkg::count_features(&pool, &info.name)
        .await
        .map_err(|e| source_error(path, e.to_string()))?;
    pool.close().await;
    Ok(LayerSummary {
        name: info.name,
        geometry_type: info.geometry_type,
        feature_count,
        crs: info.crs,
        fields: info.fields,
    })
}

/// Read every polygon feature, in key order.
///
/// Null geometries become empty multipolygons (they can never match a
/// tile). Non-polygonal geometries are rejected.
pub async fn read_polygons(path: &Path, layer: Option<&str>) -> Result<PolygonLayer> {
    if source_kind(path)? == SourceKind::Shapefile {
        reject_layer(path, layer)?;
        let shapefile = read_shapefile(path).await?;
        if shapefile.features.is_empty() {
            return Err(source_error(path, format!("layer '{}' has no features", shapefile.name)));
        }
        return Ok(PolygonLayer {
            path: path.to_path_buf(),
            layer: shapefile.name,
            crs: shapefile.crs,
            fields: shapefile.fields,
            features: shapefile.features,
        });
    }

    let pool = open(path).await?;
    let info = resolve_layer(&pool, path, layer).await?;
    let rows = gpkg::read_features(&pool, &info)
        .await
        .map_err(|e| source_error(path, format!("{:#}", e)))?;
    pool.close().await;

    if rows.is_empty() {
        return Err(source_error(path, format!("layer '{}' has no features", info.name)));
    }

    let mut features = Vec::with_capacity(rows.len());
    for row in rows {
        let geometry = match row.geometry {
            None => MultiPolygon::new(vec![]),
            Some(geometry) => to_multi_polygon(geometry).map_err(|kind| {
                source_error(
                    path,
                    format!("feature {} has a {} geometry; polygons are required", row.fid, kind),
                )
            })?,
        };
        features.push(PolygonFeature {
            fid: row.fid,
            attributes: row.attributes,
            geometry,
        });
    }

    Ok(PolygonLayer {
        path: path.to_path_buf(),
        layer: info.name,
        crs: info.crs,
        fields: info.fields,
        features,
    })
}

/// Flatten polygonal geometries; the error carries the offending type name.
fn to_multi_polygon(geometry: Geometry<f64>) -> std::result::Result<MultiPolygon<f64>, &'static str> {
    match geometry {
        Geometry::Polygon(p) => Ok(MultiPolygon::new(vec![p])),
        Geometry::MultiPolygon(mp) => Ok(mp),
        Geometry::Rect(r) => Ok(MultiPolygon::new(vec![r.to_polygon()])),
        Geometry::GeometryCollection(gc) => {
            let mut polygons = Vec::new();
            for member in gc.0 {
                polygons.extend(to_multi_polygon(member)?.0);
            }
            Ok(MultiPolygon::new(polygons))
        }
        other => Err(wkb::geometry_name(&other)),
    }
}
