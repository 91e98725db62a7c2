//! Shared fixtures: tiny LAS tiles and polygon GeoPackages on disk.

#![allow(dead_code)]

use geo::{polygon, Geometry, Polygon};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use las_dice::config::{Config, OutputConfig, PolygonsConfig, RunConfig, TilesConfig, TindexConfig};
use las_dice::crs::{geokey_vlr, wkt_vlr, Crs};
use las_dice::gpkg::{self, FieldType, LayerSpec};
use las_dice::models::{AttributeValue, BoundaryMode};
use las_dice::tiles;

/// CH1903+ / LV95 with LN02 heights, as some producers tag Swiss tiles.
pub const LV95_LN02_WKT: &str = concat!(
    r#"COMPD_CS["CH1903+ / LV95 + LN02 height","#,
    r#"PROJCS["CH1903+ / LV95",GEOGCS["CH1903+",DATUM["CH1903+",SPHEROID["Bessel 1841",6377397.155,299.1528128]],"#,
    r#"PRIMEM["Greenwich",0],UNIT["degree",0.0174532925199433]],PROJECTION["Hotine_Oblique_Mercator_Azimuth_Center"],"#,
    r#"UNIT["metre",1],AUTHORITY["EPSG","2056"]],"#,
    r#"VERT_CS["LN02 height",VERT_DATUM["Landesnivellement 1902",2005],UNIT["metre",1],AUTHORITY["EPSG","5728"]],"#,
    r#"AUTHORITY["EPSG","9518"]]"#,
);

/// Write a LAS 1.2 tile carrying `vlr`; `.laz` when `compressed`.
pub fn write_tile_with(path: &Path, vlr: las::Vlr, compressed: bool, points: &[(f64, f64)]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let mut builder = las::Builder::from((1, 2));
    builder.point_format.is_compressed = compressed;
    builder.vlrs.push(vlr);
    let header = builder.into_header().unwrap();
    let mut writer = las::Writer::from_path(path, header).unwrap();
    for &(x, y) in points {
        writer
            .write_point(las::Point {
                x,
                y,
                z: 100.0,
                ..Default::default()
            })
            .unwrap();
    }
    writer.close().unwrap();
}

/// Write an uncompressed LAS 1.2 tile tagged with `epsg`.
pub fn write_tile(path: &Path, epsg: u16, points: &[(f64, f64)]) {
    write_tile_with(path, geokey_vlr(epsg), false, points);
}

/// Write a LAZ tile tagged with `epsg`.
pub fn write_laz_tile(path: &Path, epsg: u16, points: &[(f64, f64)]) {
    write_tile_with(path, geokey_vlr(epsg), true, points);
}

/// Write an uncompressed tile whose CRS is an OGC WKT record.
pub fn write_wkt_tile(path: &Path, wkt: &str, points: &[(f64, f64)]) {
    write_tile_with(path, wkt_vlr(wkt), false, points);
}

pub fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> Polygon<f64> {
    polygon![
        (x: x0, y: y0),
        (x: x1, y: y0),
        (x: x1, y: y1),
        (x: x0, y: y1),
        (x: x0, y: y0),
    ]
}

/// Write a polygon layer `parcels` with one text field `name`.
pub async fn write_polygons(path: &Path, epsg: Option<u32>, features: &[(Option<&str>, Polygon<f64>)]) {
    let pool = gpkg::open_or_create(path).await.unwrap();
    let mut conn = pool.acquire().await.unwrap();
    let srs_id = match epsg {
        Some(code) => gpkg::register_srs(&mut conn, &Crs::Epsg(code)).await.unwrap(),
        None => -1,
    };
    gpkg::create_feature_layer(
        &mut conn,
        &LayerSpec {
            name: "parcels".into(),
            geometry_type: "POLYGON".into(),
            srs_id,
            description: String::new(),
            fields: vec![("name".into(), FieldType::Text)],
        },
    )
    .await
    .unwrap();
    for (name, polygon) in features {
        let value = match name {
            Some(n) => AttributeValue::Text(n.to_string()),
            None => AttributeValue::Null,
        };
        gpkg::insert_feature(
            &mut conn,
            "parcels",
            &Geometry::Polygon(polygon.clone()),
            srs_id,
            &[("name".into(), value)],
        )
        .await
        .unwrap();
    }
    drop(conn);
    pool.close().await;
}

/// A workspace laid out the way `las-dice init` expects.
pub struct Workspace {
    pub tmp: TempDir,
    pub polygons: PathBuf,
    pub tiles: PathBuf,
    pub tindex: PathBuf,
    pub output: PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        Self {
            polygons: root.join("parcels.gpkg"),
            tiles: root.join("tiles"),
            tindex: root.join("work/tindex.gpkg"),
            output: root.join("clips"),
            tmp,
        }
    }

    /// Three tiles: t1 and t2 side by side in the north, t3 in the south.
    pub fn write_scenario_tiles(&self, epsg: u16) {
        write_tile(&self.tiles.join("t1.las"), epsg, &[(1.0, 1.0), (5.0, 5.0), (9.0, 9.0)]);
        write_tile(&self.tiles.join("t2.las"), epsg, &[(11.0, 1.0), (19.0, 9.0)]);
        write_tile(&self.tiles.join("sub/t3.las"), epsg, &[(5.0, 31.0), (15.0, 39.0)]);
    }

    pub fn north() -> Polygon<f64> {
        rect(0.0, 0.0, 20.0, 10.0)
    }

    pub fn south() -> Polygon<f64> {
        rect(0.0, 30.0, 20.0, 40.0)
    }

    pub async fn write_scenario(&self) {
        self.write_scenario_tiles(2056);
        write_polygons(
            &self.polygons,
            Some(2056),
            &[(Some("north"), Self::north()), (Some("south"), Self::south())],
        )
        .await;
    }

    pub fn config(&self) -> Config {
        Config {
            polygons: PolygonsConfig {
                path: self.polygons.clone(),
                layer: None,
                name_field: "name".into(),
            },
            tiles: TilesConfig {
                roots: vec![self.tiles.clone()],
                include_globs: tiles::default_include_globs(),
                exclude_globs: vec![],
                follow_symlinks: false,
            },
            tindex: TindexConfig {
                path: self.tindex.clone(),
                layer: "las_tiles".into(),
                boundary: BoundaryMode::Fast,
            },
            output: OutputConfig {
                dir: self.output.clone(),
                suffix: None,
                extension: "laz".into(),
            },
            run: RunConfig {
                concurrency: 2,
                ..RunConfig::default()
            },
        }
    }

    pub fn output_file(&self, name: &str) -> PathBuf {
        self.output.join(name)
    }
}

pub fn point_count(path: &Path) -> u64 {
    las::Reader::from_path(path)
        .unwrap()
        .header()
        .number_of_points()
}
