//! Minimal GeoPackage container access over SQLite.
//!
//! Both the polygon source and the tile index are GeoPackages. This module
//! owns the connection setup, the core metadata tables and the geometry
//! blob format; higher layers only deal with [`LayerInfo`] and
//! [`FeatureRow`].
//!
//! # Tables
//!
//! ```text
//! gpkg_spatial_ref_sys   (srs_id PK, organization, organization_coordsys_id, definition)
//! gpkg_contents          (table_name PK, data_type, description, extent, srs_id)
//! gpkg_geometry_columns  (table_name, column_name, geometry_type_name, srs_id, z, m)
//! ```
//!
//! Geometry blobs use the standard binary header: `GP`, version, flags,
//! `srs_id`, optional envelope, then WKB.

use anyhow::{bail, Context, Result};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use geo::{BoundingRect, Geometry, Rect};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::Path;

use crate::crs::Crs;
use crate::models::AttributeValue;
use crate::wkb;

/// `PRAGMA application_id` for GeoPackage ("GPKG").
pub const APPLICATION_ID: i32 = 0x4750_4B47;
/// `PRAGMA user_version` for GeoPackage 1.3.
pub const USER_VERSION: i32 = 10300;

const UNDEFINED_CARTESIAN_SRS: i64 = -1;
const UNDEFINED_GEOGRAPHIC_SRS: i64 = 0;
const FIRST_CUSTOM_SRS: i64 = 100_000;

const WGS84_WKT: &str = r#"GEOGCS["WGS 84",DATUM["WGS_1984",SPHEROID["WGS 84",6378137,298.257223563,AUTHORITY["EPSG","7030"]],AUTHORITY["EPSG","6326"]],PRIMEM["Greenwich",0,AUTHORITY["EPSG","8901"]],UNIT["degree",0.0174532925199433,AUTHORITY["EPSG","9122"]],AUTHORITY["EPSG","4326"]]"#;

/// Open an existing GeoPackage without write access.
pub async fn open_read_only(path: &Path) -> Result<SqlitePool> {
    if !path.is_file() {
        bail!("GeoPackage not found: {}", path.display());
    }
    let options = SqliteConnectOptions::new()
        .filename(path)
        .read_only(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(pool)
}

/// Open a GeoPackage for writing, creating it (and its parent directory)
/// when missing. The core tables are created if absent.
pub async fn open_or_create(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;

    init_schema(&pool).await?;
    Ok(pool)
}

/// Create the GeoPackage core tables. Idempotent.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(&format!("PRAGMA application_id = {}", APPLICATION_ID))
        .execute(pool)
        .await?;
    sqlx::query(&format!("PRAGMA user_version = {}", USER_VERSION))
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS gpkg_spatial_ref_sys (
            srs_name TEXT NOT NULL,
            srs_id INTEGER PRIMARY KEY,
            organization TEXT NOT NULL,
            organization_coordsys_id INTEGER NOT NULL,
            definition TEXT NOT NULL,
            description TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS gpkg_contents (
            table_name TEXT NOT NULL PRIMARY KEY,
            data_type TEXT NOT NULL,
            identifier TEXT UNIQUE,
            description TEXT DEFAULT '',
            last_change DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
            min_x DOUBLE,
            min_y DOUBLE,
            max_x DOUBLE,
            max_y DOUBLE,
            srs_id INTEGER,
            CONSTRAINT fk_gc_r_srs_id FOREIGN KEY (srs_id) REFERENCES gpkg_spatial_ref_sys(srs_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS gpkg_geometry_columns (
            table_name TEXT NOT NULL,
            column_name TEXT NOT NULL,
            geometry_type_name TEXT NOT NULL,
            srs_id INTEGER NOT NULL,
            z TINYINT NOT NULL,
            m TINYINT NOT NULL,
            CONSTRAINT pk_geom_cols PRIMARY KEY (table_name, column_name),
            CONSTRAINT uk_gc_table_name UNIQUE (table_name),
            CONSTRAINT fk_gc_tn FOREIGN KEY (table_name) REFERENCES gpkg_contents(table_name),
            CONSTRAINT fk_gc_srs FOREIGN KEY (srs_id) REFERENCES gpkg_spatial_ref_sys(srs_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    let defaults: [(&str, i64, &str, i64, &str); 3] = [
        ("Undefined cartesian SRS", UNDEFINED_CARTESIAN_SRS, "NONE", -1, "undefined"),
        ("Undefined geographic SRS", UNDEFINED_GEOGRAPHIC_SRS, "NONE", 0, "undefined"),
        ("WGS 84 geodetic", 4326, "EPSG", 4326, WGS84_WKT),
    ];
    for (name, srs_id, org, org_id, definition) in defaults {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO gpkg_spatial_ref_sys
                (srs_name, srs_id, organization, organization_coordsys_id, definition)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(name)
        .bind(srs_id)
        .bind(org)
        .bind(org_id)
        .bind(definition)
        .execute(pool)
        .await?;
    }

    Ok(())
}

/// Quote an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

async fn table_exists(pool: &SqlitePool, table: &str) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?",
    )
    .bind(table)
    .fetch_one(pool)
    .await?;
    Ok(exists)
}

/// Names of all feature layers, in table-name order.
pub async fn feature_layers(pool: &SqlitePool) -> Result<Vec<String>> {
    if !table_exists(pool, "gpkg_contents").await? {
        bail!("not a GeoPackage (gpkg_contents is missing)");
    }
    let names: Vec<String> = sqlx::query_scalar(
        "SELECT table_name FROM gpkg_contents WHERE data_type = 'features' ORDER BY table_name",
    )
    .fetch_all(pool)
    .await?;
    Ok(names)
}

/// Description of one feature layer.
#[derive(Debug, Clone)]
pub struct LayerInfo {
    pub name: String,
    pub geometry_column: String,
    pub geometry_type: String,
    pub srs_id: i64,
    /// `None` when the layer uses an undefined spatial reference.
    pub crs: Option<Crs>,
    pub description: String,
    pub primary_key: String,
    /// Attribute columns (everything but the key and geometry), in table order.
    pub fields: Vec<String>,
}

/// Look up a feature layer; `Ok(None)` when the container has no such layer.
pub async fn layer_info(pool: &SqlitePool, layer: &str) -> Result<Option<LayerInfo>> {
    if !table_exists(pool, "gpkg_contents").await? {
        bail!("not a GeoPackage (gpkg_contents is missing)");
    }

    let row = sqlx::query(
        r#"
        SELECT c.table_name, COALESCE(c.description, '') AS description,
               g.column_name, g.geometry_type_name, g.srs_id,
               s.organization, s.organization_coordsys_id, s.definition
        FROM gpkg_contents c
        JOIN gpkg_geometry_columns g ON g.table_name = c.table_name
        LEFT JOIN gpkg_spatial_ref_sys s ON s.srs_id = g.srs_id
        WHERE c.table_name = ? AND c.data_type = 'features'
        "#,
    )
    .bind(layer)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let srs_id: i64 = row.get("srs_id");
    let organization: Option<String> = row.get("organization");
    let org_id: Option<i64> = row.get("organization_coordsys_id");
    let definition: Option<String> = row.get("definition");
    let crs = srs_to_crs(srs_id, organization.as_deref(), org_id, definition.as_deref());
    let geometry_column: String = row.get("column_name");

    let columns = sqlx::query(&format!("PRAGMA table_info({})", quote_ident(layer)))
        .fetch_all(pool)
        .await?;
    let mut primary_key = None;
    let mut fields = Vec::new();
    for column in &columns {
        let name: String = column.get("name");
        let pk: i64 = column.get("pk");
        if pk > 0 && primary_key.is_none() {
            primary_key = Some(name);
        } else if name != geometry_column {
            fields.push(name);
        }
    }

    Ok(Some(LayerInfo {
        name: row.get("table_name"),
        geometry_column,
        geometry_type: row.get("geometry_type_name"),
        srs_id,
        crs,
        description: row.get("description"),
        primary_key: primary_key.unwrap_or_else(|| "rowid".to_string()),
        fields,
    }))
}

fn srs_to_crs(
    srs_id: i64,
    organization: Option<&str>,
    org_id: Option<i64>,
    definition: Option<&str>,
) -> Option<Crs> {
    if srs_id == UNDEFINED_CARTESIAN_SRS || srs_id == UNDEFINED_GEOGRAPHIC_SRS {
        return None;
    }
    if let (Some(org), Some(code)) = (organization, org_id) {
        if org.eq_ignore_ascii_case("EPSG") && code > 0 {
            return Some(Crs::Epsg(code as u32));
        }
    }
    definition.and_then(Crs::from_wkt)
}

/// Ensure `crs` has a row in `gpkg_spatial_ref_sys` and return its id.
pub async fn register_srs(conn: &mut SqliteConnection, crs: &Crs) -> Result<i64> {
    match crs {
        Crs::Epsg(code) => {
            let srs_id = *code as i64;
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO gpkg_spatial_ref_sys
                    (srs_name, srs_id, organization, organization_coordsys_id, definition)
                VALUES (?, ?, 'EPSG', ?, 'undefined')
                "#,
            )
            .bind(format!("EPSG:{}", code))
            .bind(srs_id)
            .bind(srs_id)
            .execute(&mut *conn)
            .await?;
            Ok(srs_id)
        }
        Crs::Wkt(wkt) => {
            let existing: Option<i64> = sqlx::query_scalar(
                "SELECT srs_id FROM gpkg_spatial_ref_sys WHERE definition = ? LIMIT 1",
            )
            .bind(wkt)
            .fetch_optional(&mut *conn)
            .await?;
            if let Some(id) = existing {
                return Ok(id);
            }
            let next: i64 = sqlx::query_scalar(
                "SELECT MAX(COALESCE(MAX(srs_id), 0), ?) + 1 FROM gpkg_spatial_ref_sys",
            )
            .bind(FIRST_CUSTOM_SRS - 1)
            .fetch_one(&mut *conn)
            .await?;
            sqlx::query(
                r#"
                INSERT INTO gpkg_spatial_ref_sys
                    (srs_name, srs_id, organization, organization_coordsys_id, definition)
                VALUES ('custom', ?, 'NONE', ?, ?)
                "#,
            )
            .bind(next)
            .bind(next)
            .bind(wkt)
            .execute(&mut *conn)
            .await?;
            Ok(next)
        }
    }
}

/// Column type of an attribute field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Integer,
    Real,
    Text,
}

impl FieldType {
    fn sql(&self) -> &'static str {
        match self {
            FieldType::Integer => "INTEGER",
            FieldType::Real => "REAL",
            FieldType::Text => "TEXT",
        }
    }
}

/// Definition of a feature layer to create.
#[derive(Debug, Clone)]
pub struct LayerSpec {
    pub name: String,
    pub geometry_type: String,
    pub srs_id: i64,
    pub description: String,
    pub fields: Vec<(String, FieldType)>,
}

/// Create a feature table and register it in the metadata tables.
///
/// The key column is `fid` and the geometry column is `geom`.
pub async fn create_feature_layer(conn: &mut SqliteConnection, spec: &LayerSpec) -> Result<()> {
    let mut columns = vec![
        "fid INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL".to_string(),
        format!("geom {}", spec.geometry_type),
    ];
    for (name, ty) in &spec.fields {
        columns.push(format!("{} {}", quote_ident(name), ty.sql()));
    }
    sqlx::query(&format!(
        "CREATE TABLE {} ({})",
        quote_ident(&spec.name),
        columns.join(", ")
    ))
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO gpkg_contents (table_name, data_type, identifier, description, srs_id)
        VALUES (?, 'features', ?, ?, ?)
        "#,
    )
    .bind(&spec.name)
    .bind(&spec.name)
    .bind(&spec.description)
    .bind(spec.srs_id)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO gpkg_geometry_columns
            (table_name, column_name, geometry_type_name, srs_id, z, m)
        VALUES (?, 'geom', ?, ?, 0, 0)
        "#,
    )
    .bind(&spec.name)
    .bind(&spec.geometry_type)
    .bind(spec.srs_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Remove a feature layer and its metadata rows. No-op when absent.
pub async fn drop_feature_layer(conn: &mut SqliteConnection, layer: &str) -> Result<()> {
    sqlx::query("DELETE FROM gpkg_geometry_columns WHERE table_name = ?")
        .bind(layer)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM gpkg_contents WHERE table_name = ?")
        .bind(layer)
        .execute(&mut *conn)
        .await?;
    sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(layer)))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Insert one feature. `attributes` must follow the layer's field order.
pub async fn insert_feature(
    conn: &mut SqliteConnection,
    layer: &str,
    geometry: &Geometry<f64>,
    srs_id: i64,
    attributes: &[(String, AttributeValue)],
) -> Result<i64> {
    let mut names = vec!["geom".to_string()];
    names.extend(attributes.iter().map(|(name, _)| quote_ident(name)));
    let placeholders = vec!["?"; names.len()].join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(layer),
        names.join(", "),
        placeholders
    );

    let mut query = sqlx::query(&sql).bind(encode_geometry(geometry, srs_id as i32)?);
    for (_, value) in attributes {
        query = match value {
            AttributeValue::Null => query.bind(None::<String>),
            AttributeValue::Integer(v) => query.bind(*v),
            AttributeValue::Real(v) => query.bind(*v),
            AttributeValue::Text(v) => query.bind(v.clone()),
        };
    }
    let result = query.execute(&mut *conn).await?;
    Ok(result.last_insert_rowid())
}

/// Record the layer extent in `gpkg_contents`.
pub async fn update_extent(conn: &mut SqliteConnection, layer: &str, extent: Rect<f64>) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE gpkg_contents
        SET min_x = ?, min_y = ?, max_x = ?, max_y = ?,
            last_change = strftime('%Y-%m-%dT%H:%M:%fZ','now')
        WHERE table_name = ?
        "#,
    )
    .bind(extent.min().x)
    .bind(extent.min().y)
    .bind(extent.max().x)
    .bind(extent.max().y)
    .bind(layer)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// A feature row as read from a layer.
#[derive(Debug, Clone)]
pub struct FeatureRow {
    pub fid: i64,
    /// `None` for null or empty geometries.
    pub geometry: Option<Geometry<f64>>,
    pub attributes: BTreeMap<String, AttributeValue>,
}

/// Read every feature of a layer in key order.
pub async fn read_features(pool: &SqlitePool, info: &LayerInfo) -> Result<Vec<FeatureRow>> {
    let mut columns = vec![quote_ident(&info.primary_key), quote_ident(&info.geometry_column)];
    columns.extend(info.fields.iter().map(|f| quote_ident(f)));
    let sql = format!(
        "SELECT {} FROM {} ORDER BY {}",
        columns.join(", "),
        quote_ident(&info.name),
        quote_ident(&info.primary_key)
    );

    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    let mut features = Vec::with_capacity(rows.len());
    for row in &rows {
        let fid: i64 = row.try_get(0)?;
        let blob: Option<Vec<u8>> = row.try_get(1)?;
        let geometry = match blob {
            Some(bytes) => decode_geometry(&bytes)
                .with_context(|| format!("feature {} of layer '{}'", fid, info.name))?,
            None => None,
        };
        let attributes = info
            .fields
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), attribute_value(row, i + 2)))
            .collect();
        features.push(FeatureRow {
            fid,
            geometry,
            attributes,
        });
    }
    Ok(features)
}

/// Decode a column using the storage class of the value itself.
fn attribute_value(row: &SqliteRow, idx: usize) -> AttributeValue {
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(AttributeValue::Integer).unwrap_or(AttributeValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(AttributeValue::Real).unwrap_or(AttributeValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map(AttributeValue::Text).unwrap_or(AttributeValue::Null);
    }
    AttributeValue::Null
}

/// Count the rows of a layer.
pub async fn count_features(pool: &SqlitePool, layer: &str) -> Result<u64> {
    let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", quote_ident(layer)))
        .fetch_one(pool)
        .await?;
    Ok(count as u64)
}

const FLAG_LITTLE_ENDIAN: u8 = 0x01;
const FLAG_ENVELOPE_XY: u8 = 0x02;
const FLAG_EMPTY: u8 = 0x10;

/// Encode a geometry as a GeoPackage binary blob with an XY envelope.
pub fn encode_geometry(geometry: &Geometry<f64>, srs_id: i32) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(b"GP");
    out.write_u8(0)?;
    match geometry.bounding_rect() {
        Some(envelope) => {
            out.write_u8(FLAG_LITTLE_ENDIAN | FLAG_ENVELOPE_XY)?;
            out.write_i32::<LittleEndian>(srs_id)?;
            // Envelope order is minx, maxx, miny, maxy.
            out.write_f64::<LittleEndian>(envelope.min().x)?;
            out.write_f64::<LittleEndian>(envelope.max().x)?;
            out.write_f64::<LittleEndian>(envelope.min().y)?;
            out.write_f64::<LittleEndian>(envelope.max().y)?;
        }
        None => {
            out.write_u8(FLAG_LITTLE_ENDIAN | FLAG_EMPTY)?;
            out.write_i32::<LittleEndian>(srs_id)?;
        }
    }
    out.extend_from_slice(&wkb::encode(geometry)?);
    Ok(out)
}

/// Decode a GeoPackage binary blob. Empty geometries decode to `None`.
pub fn decode_geometry(blob: &[u8]) -> Result<Option<Geometry<f64>>> {
    if blob.len() < 8 || &blob[..2] != b"GP" {
        bail!("not a GeoPackage geometry blob");
    }
    let flags = blob[3];
    if flags & 0x20 != 0 {
        bail!("extended GeoPackage geometries are not supported");
    }
    let envelope_len = match (flags >> 1) & 0x07 {
        0 => 0,
        1 => 32,
        2 | 3 => 48,
        4 => 64,
        other => bail!("invalid envelope indicator {}", other),
    };
    let mut header = Cursor::new(&blob[4..8]);
    let _srs_id = if flags & FLAG_LITTLE_ENDIAN != 0 {
        header.read_i32::<LittleEndian>()?
    } else {
        header.read_i32::<BigEndian>()?
    };
    if flags & FLAG_EMPTY != 0 {
        return Ok(None);
    }
    let start = 8 + envelope_len;
    if blob.len() <= start {
        bail!("truncated GeoPackage geometry blob");
    }
    Ok(Some(wkb::decode(&blob[start..])?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{polygon, MultiPolygon};
    use tempfile::TempDir;

    fn square() -> Geometry<f64> {
        Geometry::Polygon(polygon![
            (x: 0.0, y: 0.0),
            (x: 4.0, y: 0.0),
            (x: 4.0, y: 2.0),
            (x: 0.0, y: 2.0),
            (x: 0.0, y: 0.0),
        ])
    }

    #[test]
    fn blob_header_carries_envelope() {
        let blob = encode_geometry(&square(), 2056).unwrap();
        assert_eq!(&blob[..2], b"GP");
        assert_eq!(blob[3], 0x03);
        let mut cursor = Cursor::new(&blob[4..40]);
        assert_eq!(cursor.read_i32::<LittleEndian>().unwrap(), 2056);
        let env: Vec<f64> = (0..4)
            .map(|_| cursor.read_f64::<LittleEndian>().unwrap())
            .collect();
        assert_eq!(env, vec![0.0, 4.0, 0.0, 2.0]);
        assert_eq!(decode_geometry(&blob).unwrap(), Some(square()));
    }

    #[test]
    fn empty_geometry_sets_flag() {
        let empty = Geometry::MultiPolygon(MultiPolygon::<f64>::new(vec![]));
        let blob = encode_geometry(&empty, 2056).unwrap();
        assert_eq!(blob[3] & FLAG_EMPTY, FLAG_EMPTY);
        assert_eq!(decode_geometry(&blob).unwrap(), None);
    }

    #[test]
    fn garbage_blob_is_rejected() {
        assert!(decode_geometry(b"XX\0\x01\0\0\0\0").is_err());
    }

    #[tokio::test]
    async fn layer_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/test.gpkg");
        let pool = open_or_create(&path).await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        let srs_id = register_srs(&mut conn, &Crs::Epsg(2056)).await.unwrap();
        assert_eq!(srs_id, 2056);
        create_feature_layer(
            &mut conn,
            &LayerSpec {
                name: "parcels".into(),
                geometry_type: "POLYGON".into(),
                srs_id,
                description: "test".into(),
                fields: vec![
                    ("name".into(), FieldType::Text),
                    ("area".into(), FieldType::Real),
                ],
            },
        )
        .await
        .unwrap();
        insert_feature(
            &mut conn,
            "parcels",
            &square(),
            srs_id,
            &[
                ("name".into(), AttributeValue::Text("north".into())),
                ("area".into(), AttributeValue::Real(8.0)),
            ],
        )
        .await
        .unwrap();
        drop(conn);

        assert_eq!(feature_layers(&pool).await.unwrap(), vec!["parcels"]);
        let info = layer_info(&pool, "parcels").await.unwrap().unwrap();
        assert_eq!(info.crs, Some(Crs::Epsg(2056)));
        assert_eq!(info.fields, vec!["name", "area"]);
        assert_eq!(info.primary_key, "fid");

        let rows = read_features(&pool, &info).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].geometry, Some(square()));
        assert_eq!(
            rows[0].attributes.get("name"),
            Some(&AttributeValue::Text("north".into()))
        );
        assert_eq!(rows[0].attributes.get("area"), Some(&AttributeValue::Real(8.0)));
        assert_eq!(count_features(&pool, "parcels").await.unwrap(), 1);

        let mut conn = pool.acquire().await.unwrap();
        drop_feature_layer(&mut conn, "parcels").await.unwrap();
        drop(conn);
        assert!(layer_info(&pool, "parcels").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn custom_wkt_srs_is_reused() {
        let tmp = TempDir::new().unwrap();
        let pool = open_or_create(&tmp.path().join("x.gpkg")).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let crs = Crs::Wkt("LOCAL_CS[\"site\"]".into());
        let a = register_srs(&mut conn, &crs).await.unwrap();
        let b = register_srs(&mut conn, &crs).await.unwrap();
        assert_eq!(a, b);
        assert!(a >= FIRST_CUSTOM_SRS);
    }
}
