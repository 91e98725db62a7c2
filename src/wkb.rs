//! Well-known binary (WKB) geometry codec.
//!
//! Decoding accepts ISO (`1003`, `3006`, …) and extended (high-bit flags)
//! dimension encodings in either byte order and keeps only X/Y. Encoding
//! always writes little-endian 2D geometries.

use anyhow::{bail, Result};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use geo::{
    Coord, Geometry, GeometryCollection, LineString, MultiLineString, MultiPoint, MultiPolygon,
    Point, Polygon,
};
use std::io::Cursor;

const WKB_POINT: u32 = 1;
const WKB_LINESTRING: u32 = 2;
const WKB_POLYGON: u32 = 3;
const WKB_MULTIPOINT: u32 = 4;
const WKB_MULTILINESTRING: u32 = 5;
const WKB_MULTIPOLYGON: u32 = 6;
const WKB_GEOMETRYCOLLECTION: u32 = 7;

const EWKB_Z: u32 = 0x8000_0000;
const EWKB_M: u32 = 0x4000_0000;
const EWKB_SRID: u32 = 0x2000_0000;

/// Decode a WKB geometry.
pub fn decode(bytes: &[u8]) -> Result<Geometry<f64>> {
    let mut reader = WkbReader {
        cursor: Cursor::new(bytes),
        little: true,
    };
    reader.geometry()
}

/// Encode a polygonal geometry as little-endian 2D WKB.
pub fn encode(geometry: &Geometry<f64>) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match geometry {
        Geometry::Polygon(polygon) => write_polygon(&mut out, polygon)?,
        Geometry::MultiPolygon(multi) => {
            out.write_u8(1)?;
            out.write_u32::<LittleEndian>(WKB_MULTIPOLYGON)?;
            out.write_u32::<LittleEndian>(multi.0.len() as u32)?;
            for polygon in &multi.0 {
                write_polygon(&mut out, polygon)?;
            }
        }
        other => bail!("unsupported geometry for encoding: {}", geometry_name(other)),
    }
    Ok(out)
}

fn write_polygon(out: &mut Vec<u8>, polygon: &Polygon<f64>) -> Result<()> {
    out.write_u8(1)?;
    out.write_u32::<LittleEndian>(WKB_POLYGON)?;
    let rings: Vec<&LineString<f64>> = std::iter::once(polygon.exterior())
        .chain(polygon.interiors())
        .filter(|ring| !ring.0.is_empty())
        .collect();
    out.write_u32::<LittleEndian>(rings.len() as u32)?;
    for ring in rings {
        out.write_u32::<LittleEndian>(ring.0.len() as u32)?;
        for c in &ring.0 {
            out.write_f64::<LittleEndian>(c.x)?;
            out.write_f64::<LittleEndian>(c.y)?;
        }
    }
    Ok(())
}

pub fn geometry_name(geometry: &Geometry<f64>) -> &'static str {
    match geometry {
        Geometry::Point(_) => "POINT",
        Geometry::Line(_) => "LINE",
        Geometry::LineString(_) => "LINESTRING",
        Geometry::Polygon(_) => "POLYGON",
        Geometry::MultiPoint(_) => "MULTIPOINT",
        Geometry::MultiLineString(_) => "MULTILINESTRING",
        Geometry::MultiPolygon(_) => "MULTIPOLYGON",
        Geometry::GeometryCollection(_) => "GEOMETRYCOLLECTION",
        Geometry::Rect(_) => "RECT",
        Geometry::Triangle(_) => "TRIANGLE",
    }
}

struct WkbReader<'a> {
    cursor: Cursor<&'a [u8]>,
    little: bool,
}

impl WkbReader<'_> {
    fn u32(&mut self) -> Result<u32> {
        Ok(if self.little {
            self.cursor.read_u32::<LittleEndian>()?
        } else {
            self.cursor.read_u32::<BigEndian>()?
        })
    }

    fn f64(&mut self) -> Result<f64> {
        Ok(if self.little {
            self.cursor.read_f64::<LittleEndian>()?
        } else {
            self.cursor.read_f64::<BigEndian>()?
        })
    }

    fn coord(&mut self, dims: usize) -> Result<Coord<f64>> {
        let x = self.f64()?;
        let y = self.f64()?;
        for _ in 2..dims {
            self.f64()?;
        }
        Ok(Coord { x, y })
    }

    fn line_string(&mut self, dims: usize) -> Result<LineString<f64>> {
        let count = self.u32()? as usize;
        let mut coords = Vec::with_capacity(count.min(1 << 20));
        for _ in 0..count {
            coords.push(self.coord(dims)?);
        }
        Ok(LineString::new(coords))
    }

    fn polygon(&mut self, dims: usize) -> Result<Polygon<f64>> {
        let ring_count = self.u32()? as usize;
        if ring_count == 0 {
            return Ok(Polygon::new(LineString::new(vec![]), vec![]));
        }
        let exterior = self.line_string(dims)?;
        let mut interiors = Vec::with_capacity(ring_count - 1);
        for _ in 1..ring_count {
            interiors.push(self.line_string(dims)?);
        }
        Ok(Polygon::new(exterior, interiors))
    }

    /// Read a byte order marker and type word, returning (kind, dims).
    fn header(&mut self) -> Result<(u32, usize)> {
        self.little = match self.cursor.read_u8()? {
            0 => false,
            1 => true,
            other => bail!("invalid WKB byte order marker: {}", other),
        };
        let raw = self.u32()?;
        if raw & EWKB_SRID != 0 {
            self.u32()?;
        }
        let base = raw & 0x0FFF_FFFF;
        let (kind, iso) = (base % 1000, base / 1000);
        let mut dims = match iso {
            0 => 2,
            1 | 2 => 3,
            3 => 4,
            _ => bail!("invalid WKB geometry type: {}", raw),
        };
        if raw & EWKB_Z != 0 {
            dims += 1;
        }
        if raw & EWKB_M != 0 {
            dims += 1;
        }
        Ok((kind, dims))
    }

    fn geometry(&mut self) -> Result<Geometry<f64>> {
        let (kind, dims) = self.header()?;
        let geometry = match kind {
            WKB_POINT => Geometry::Point(Point::from(self.coord(dims)?)),
            WKB_LINESTRING => Geometry::LineString(self.line_string(dims)?),
            WKB_POLYGON => Geometry::Polygon(self.polygon(dims)?),
            WKB_MULTIPOINT => {
                let mut points = Vec::new();
                for member in self.members()? {
                    match member {
                        Geometry::Point(p) => points.push(p),
                        other => bail!("MULTIPOINT member is {}", geometry_name(&other)),
                    }
                }
                Geometry::MultiPoint(MultiPoint::new(points))
            }
            WKB_MULTILINESTRING => {
                let mut lines = Vec::new();
                for member in self.members()? {
                    match member {
                        Geometry::LineString(l) => lines.push(l),
                        other => bail!("MULTILINESTRING member is {}", geometry_name(&other)),
                    }
                }
                Geometry::MultiLineString(MultiLineString::new(lines))
            }
            WKB_MULTIPOLYGON => {
                let mut polygons = Vec::new();
                for member in self.members()? {
                    match member {
                        Geometry::Polygon(p) => polygons.push(p),
                        other => bail!("MULTIPOLYGON member is {}", geometry_name(&other)),
                    }
                }
                Geometry::MultiPolygon(MultiPolygon::new(polygons))
            }
            WKB_GEOMETRYCOLLECTION => {
                Geometry::GeometryCollection(GeometryCollection::new_from(self.members()?))
            }
            other => bail!("unsupported WKB geometry type: {}", other),
        };
        Ok(geometry)
    }

    /// Members of a multi geometry each carry their own header and byte order.
    fn members(&mut self) -> Result<Vec<Geometry<f64>>> {
        let count = self.u32()? as usize;
        let outer = self.little;
        let mut members = Vec::with_capacity(count.min(1 << 16));
        for _ in 0..count {
            members.push(self.geometry()?);
        }
        self.little = outer;
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;

    #[test]
    fn polygon_round_trip() {
        let poly: Polygon<f64> = polygon![
            (x: 0.0, y: 0.0),
            (x: 10.0, y: 0.0),
            (x: 10.0, y: 5.0),
            (x: 0.0, y: 0.0),
        ];
        let bytes = encode(&Geometry::Polygon(poly.clone())).unwrap();
        assert_eq!(decode(&bytes).unwrap(), Geometry::Polygon(poly));
    }

    #[test]
    fn big_endian_polygon_z_is_flattened() {
        // ISO PolygonZ (1003), one ring of four XYZ points.
        let mut bytes = vec![0u8];
        bytes.write_u32::<BigEndian>(1003).unwrap();
        bytes.write_u32::<BigEndian>(1).unwrap();
        bytes.write_u32::<BigEndian>(4).unwrap();
        for (x, y) in [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 0.0)] {
            bytes.write_f64::<BigEndian>(x).unwrap();
            bytes.write_f64::<BigEndian>(y).unwrap();
            bytes.write_f64::<BigEndian>(99.0).unwrap();
        }
        match decode(&bytes).unwrap() {
            Geometry::Polygon(p) => {
                assert_eq!(p.exterior().0.len(), 4);
                assert_eq!(p.exterior().0[2], Coord { x: 1.0, y: 1.0 });
            }
            other => panic!("expected polygon, got {}", geometry_name(&other)),
        }
    }

    #[test]
    fn multipolygon_members_may_switch_byte_order() {
        let square: Polygon<f64> = polygon![
            (x: 0.0, y: 0.0),
            (x: 1.0, y: 0.0),
            (x: 1.0, y: 1.0),
            (x: 0.0, y: 1.0),
            (x: 0.0, y: 0.0),
        ];
        let member = encode(&Geometry::Polygon(square.clone())).unwrap();
        let mut bytes = vec![0u8];
        bytes.write_u32::<BigEndian>(WKB_MULTIPOLYGON).unwrap();
        bytes.write_u32::<BigEndian>(2).unwrap();
        bytes.extend_from_slice(&member);
        bytes.extend_from_slice(&member);
        match decode(&bytes).unwrap() {
            Geometry::MultiPolygon(mp) => {
                assert_eq!(mp.0.len(), 2);
                assert_eq!(mp.0[1], square);
            }
            other => panic!("expected multipolygon, got {}", geometry_name(&other)),
        }
    }

    #[test]
    fn truncated_input_is_an_error() {
        let bytes = encode(&Geometry::MultiPolygon(MultiPolygon::new(vec![]))).unwrap();
        assert!(decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn lines_are_not_encodable() {
        let line = Geometry::LineString(LineString::from(vec![(0.0, 0.0), (1.0, 1.0)]));
        assert!(encode(&line).is_err());
    }
}
