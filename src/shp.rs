//! ESRI shapefile polygon sources.
//!
//! A shapefile is a single layer named after its file stem. Geometry comes
//! from the `.shp`, attributes from the `.dbf`, and the CRS from the `.prj`
//! sidecar (absent `.prj` means an undefined CRS).

use anyhow::{Context, Result};
use geo::{Coord, LineString, MultiPolygon, Polygon};
use shapefile::dbase::{self, FieldValue};
use shapefile::{PolygonRing, Shape, ShapeReader, ShapeType};
use std::collections::BTreeMap;
use std::path::Path;

use crate::crs::Crs;
use crate::models::{AttributeValue, PolygonFeature};

/// Contents of one shapefile.
#[derive(Debug, Clone)]
pub struct ShapefileLayer {
    pub name: String,
    pub geometry_type: String,
    pub crs: Option<Crs>,
    pub fields: Vec<String>,
    pub features: Vec<PolygonFeature>,
}

pub fn layer_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// CRS declared by the `.prj` sidecar.
pub fn read_prj(path: &Path) -> Result<Option<Crs>> {
    let prj = path.with_extension("prj");
    if !prj.is_file() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&prj).with_context(|| format!("reading {}", prj.display()))?;
    Ok(Crs::from_wkt(&text))
}

fn geometry_type_name(shape_type: ShapeType) -> String {
    match shape_type {
        ShapeType::Polygon | ShapeType::PolygonM | ShapeType::PolygonZ => "MULTIPOLYGON".to_string(),
        other => format!("{:?}", other).to_uppercase(),
    }
}

/// Read the whole file. Features are numbered from 1 in record order.
pub fn read(path: &Path) -> Result<ShapefileLayer> {
    let reader = ShapeReader::from_path(path).with_context(|| format!("opening {}", path.display()))?;
    let geometry_type = geometry_type_name(reader.header().shape_type);
    let shapes = reader
        .read()
        .with_context(|| format!("reading shapes of {}", path.display()))?;

    let dbf = path.with_extension("dbf");
    let mut table =
        dbase::Reader::from_path(&dbf).with_context(|| format!("opening {}", dbf.display()))?;
    let fields: Vec<String> = table
        .fields()
        .iter()
        .map(|f| f.name().to_string())
        .filter(|name| name != "DeletionFlag")
        .collect();
    let records = table
        .read()
        .with_context(|| format!("reading records of {}", dbf.display()))?;
    if records.len() != shapes.len() {
        anyhow::bail!(
            "{} shapes but {} attribute records",
            shapes.len(),
            records.len()
        );
    }

    let mut features = Vec::with_capacity(shapes.len());
    for (i, (shape, record)) in shapes.into_iter().zip(records).enumerate() {
        let fid = i as i64 + 1;
        let geometry = to_multi_polygon(shape).map_err(|kind| {
            anyhow::anyhow!("feature {} has a {} geometry; polygons are required", fid, kind)
        })?;
        let attributes: BTreeMap<String, AttributeValue> = fields
            .iter()
            .map(|name| {
                let value = record.get(name).map(attribute).unwrap_or(AttributeValue::Null);
                (name.clone(), value)
            })
            .collect();
        features.push(PolygonFeature {
            fid,
            attributes,
            geometry,
        });
    }

    Ok(ShapefileLayer {
        name: layer_name(path),
        geometry_type,
        crs: read_prj(path)?,
        fields,
        features,
    })
}

/// dBASE numerics carry no integer flag; integral values read as integers.
fn attribute(value: &FieldValue) -> AttributeValue {
    match value {
        FieldValue::Character(Some(s)) | FieldValue::Memo(s) => AttributeValue::Text(s.trim_end().to_string()),
        FieldValue::Numeric(Some(v)) if v.fract() == 0.0 && v.abs() < 9.0e15 => {
            AttributeValue::Integer(*v as i64)
        }
        FieldValue::Numeric(Some(v)) | FieldValue::Double(v) | FieldValue::Currency(v) => AttributeValue::Real(*v),
        FieldValue::Float(Some(v)) => AttributeValue::Real(*v as f64),
        FieldValue::Integer(v) => AttributeValue::Integer(*v as i64),
        FieldValue::Logical(Some(b)) => AttributeValue::Integer(*b as i64),
        FieldValue::Date(Some(d)) => {
            AttributeValue::Text(format!("{:04}-{:02}-{:02}", d.year(), d.month(), d.day()))
        }
        _ => AttributeValue::Null,
    }
}

/// Outer rings open a new polygon; inner rings attach to the last one.
fn rings_to_multi_polygon<I>(rings: I) -> MultiPolygon<f64>
where
    I: IntoIterator<Item = (bool, Vec<Coord<f64>>)>,
{
    let mut polygons: Vec<(LineString<f64>, Vec<LineString<f64>>)> = Vec::new();
    for (outer, coords) in rings {
        let ring = LineString::from(coords);
        match polygons.last_mut() {
            Some((_, holes)) if !outer => holes.push(ring),
            _ => polygons.push((ring, Vec::new())),
        }
    }
    MultiPolygon::new(
        polygons
            .into_iter()
            .map(|(exterior, holes)| Polygon::new(exterior, holes))
            .collect(),
    )
}

macro_rules! rings_of {
    ($polygon:expr) => {
        $polygon.rings().iter().map(|ring| {
            let coords: Vec<Coord<f64>> = ring.points().iter().map(|p| Coord { x: p.x, y: p.y }).collect();
            (matches!(ring, PolygonRing::Outer(_)), coords)
        })
    };
}

fn to_multi_polygon(shape: Shape) -> std::result::Result<MultiPolygon<f64>, String> {
    match shape {
        Shape::NullShape => Ok(MultiPolygon::new(vec![])),
        Shape::Polygon(p) => Ok(rings_to_multi_polygon(rings_of!(p))),
        Shape::PolygonM(p) => Ok(rings_to_multi_polygon(rings_of!(p))),
        Shape::PolygonZ(p) => Ok(rings_to_multi_polygon(rings_of!(p))),
        other => Err(format!("{:?}", other.shapetype()).to_uppercase()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shapefile::dbase::{FieldName, Record, TableWriterBuilder};
    use shapefile::{Point, Polyline, Writer};
    use tempfile::TempDir;

    const LV95_WKT: &str = r#"PROJCS["CH1903+ / LV95",GEOGCS["CH1903+",DATUM["CH1903+",SPHEROID["Bessel 1841",6377397.155,299.1528128]],PRIMEM["Greenwich",0],UNIT["degree",0.0174532925199433]],PROJECTION["Hotine_Oblique_Mercator_Azimuth_Center"],UNIT["metre",1],AUTHORITY["EPSG","2056"]]"#;

    fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> shapefile::Polygon {
        shapefile::Polygon::new(PolygonRing::Outer(vec![
            Point::new(x0, y0),
            Point::new(x0, y1),
            Point::new(x1, y1),
            Point::new(x1, y0),
            Point::new(x0, y0),
        ]))
    }

    fn write_parcels(path: &Path, prj: Option<&str>) {
        let table = TableWriterBuilder::new()
            .add_character_field(FieldName::try_from("name").unwrap(), 32)
            .add_numeric_field(FieldName::try_from("lot").unwrap(), 10, 0);
        let mut writer = Writer::from_path(path, table).unwrap();
        for (name, lot, shape) in [
            ("north", 7.0, square(0.0, 0.0, 20.0, 10.0)),
            ("south", 8.0, square(0.0, 30.0, 20.0, 40.0)),
        ] {
            let mut record = Record::default();
            record.insert("name".to_string(), FieldValue::Character(Some(name.to_string())));
            record.insert("lot".to_string(), FieldValue::Numeric(Some(lot)));
            writer.write_shape_and_record(&shape, &record).unwrap();
        }
        drop(writer);
        if let Some(wkt) = prj {
            std::fs::write(path.with_extension("prj"), wkt).unwrap();
        }
    }

    #[test]
    fn reads_polygons_attributes_and_prj() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("parcels.shp");
        write_parcels(&path, Some(LV95_WKT));

        let layer = read(&path).unwrap();
        assert_eq!(layer.name, "parcels");
        assert_eq!(layer.geometry_type, "MULTIPOLYGON");
        assert_eq!(layer.crs, Some(Crs::Epsg(2056)));
        assert_eq!(layer.fields, vec!["name".to_string(), "lot".to_string()]);
        assert_eq!(layer.features.len(), 2);
        let north = &layer.features[0];
        assert_eq!(north.fid, 1);
        assert_eq!(north.attribute("name"), Some(&AttributeValue::Text("north".into())));
        assert_eq!(north.attribute("lot"), Some(&AttributeValue::Integer(7)));
        assert_eq!(north.geometry.0.len(), 1);
        assert_eq!(layer.features[1].fid, 2);
    }

    #[test]
    fn missing_prj_is_undefined_crs() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("parcels.shp");
        write_parcels(&path, None);
        assert_eq!(read(&path).unwrap().crs, None);
    }

    #[test]
    fn holes_attach_to_preceding_outer_ring() {
        let rings = vec![
            (true, vec![Coord { x: 0.0, y: 0.0 }, Coord { x: 0.0, y: 10.0 }, Coord { x: 10.0, y: 10.0 }, Coord { x: 0.0, y: 0.0 }]),
            (false, vec![Coord { x: 1.0, y: 1.0 }, Coord { x: 2.0, y: 1.0 }, Coord { x: 2.0, y: 2.0 }, Coord { x: 1.0, y: 1.0 }]),
            (true, vec![Coord { x: 20.0, y: 0.0 }, Coord { x: 20.0, y: 5.0 }, Coord { x: 25.0, y: 5.0 }, Coord { x: 20.0, y: 0.0 }]),
        ];
        let mp = rings_to_multi_polygon(rings);
        assert_eq!(mp.0.len(), 2);
        assert_eq!(mp.0[0].interiors().len(), 1);
        assert!(mp.0[1].interiors().is_empty());
    }

    #[test]
    fn line_shapes_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("roads.shp");
        let table = TableWriterBuilder::new().add_character_field(FieldName::try_from("name").unwrap(), 16);
        let mut writer = Writer::from_path(&path, table).unwrap();
        let line = Polyline::new(vec![Point::new(0.0, 0.0), Point::new(5.0, 5.0)]);
        let mut record = Record::default();
        record.insert("name".to_string(), FieldValue::Character(Some("a1".into())));
        writer.write_shape_and_record(&line, &record).unwrap();
        drop(writer);

        let err = read(&path).unwrap_err();
        assert!(err.to_string().contains("POLYLINE"), "{}", err);
    }
}
