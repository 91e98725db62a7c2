//! Polygon-to-tile matching strategies.
//!
//! Both strategies share one R-tree over the footprint envelopes, so a
//! query costs `O(log n + k)` instead of a scan over every tile.
//!
//! | Strategy | Predicate |
//! |----------|-----------|
//! | [`BoundingBoxMatcher`] | envelope of each polygon part intersects the tile envelope |
//! | [`ExactMatcher`] | envelope pre-filter, then geometric intersection with the footprint |
//!
//! Results are always returned in index record order.

use geo::{BoundingRect, Intersects, MultiPolygon, Rect};
use rstar::{RTree, RTreeObject, AABB};
use std::sync::Arc;

use crate::models::{BoundaryMode, TileIndex, TileRecord};

struct FootprintEnvelope {
    record: usize,
    env: AABB<[f64; 2]>,
}

impl RTreeObject for FootprintEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.env
    }
}

fn aabb(rect: Rect<f64>) -> AABB<[f64; 2]> {
    AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y])
}

/// A loaded tile index plus its R-tree. Shared read-only between jobs.
pub struct TileSpatialIndex {
    index: TileIndex,
    tree: RTree<FootprintEnvelope>,
}

impl TileSpatialIndex {
    pub fn new(index: TileIndex) -> Self {
        let envelopes: Vec<FootprintEnvelope> = index
            .records
            .iter()
            .enumerate()
            .filter_map(|(record, tile)| {
                tile.footprint
                    .bounding_rect()
                    .map(|rect| FootprintEnvelope {
                        record,
                        env: aabb(rect),
                    })
            })
            .collect();
        Self {
            tree: RTree::bulk_load(envelopes),
            index,
        }
    }

    pub fn index(&self) -> &TileIndex {
        &self.index
    }

    pub fn len(&self) -> usize {
        self.index.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.records.is_empty()
    }

    /// Records whose envelope intersects the envelope of any polygon part.
    fn candidates(&self, polygon: &MultiPolygon<f64>) -> Vec<usize> {
        let mut hits: Vec<usize> = polygon
            .0
            .iter()
            .filter_map(|part| part.bounding_rect())
            .flat_map(|rect| {
                self.tree
                    .locate_in_envelope_intersecting(&aabb(rect))
                    .map(|e| e.record)
                    .collect::<Vec<_>>()
            })
            .collect();
        hits.sort_unstable();
        hits.dedup();
        hits
    }
}

/// Selects the tiles a polygon must be clipped against.
pub trait TileMatcher: Send + Sync {
    /// Short identifier used in logs (`fast` / `exact`).
    fn name(&self) -> &'static str;

    /// Tiles relevant to `polygon`, in index record order. Empty polygons
    /// match nothing.
    fn matching_tiles(&self, polygon: &MultiPolygon<f64>) -> Vec<&TileRecord>;
}

/// Envelope intersection only. May over-select; the clip's point-level
/// containment makes the output exact anyway.
pub struct BoundingBoxMatcher {
    index: Arc<TileSpatialIndex>,
}

impl BoundingBoxMatcher {
    pub fn new(index: Arc<TileSpatialIndex>) -> Self {
        Self { index }
    }
}

impl TileMatcher for BoundingBoxMatcher {
    fn name(&self) -> &'static str {
        "fast"
    }

    fn matching_tiles(&self, polygon: &MultiPolygon<f64>) -> Vec<&TileRecord> {
        self.index
            .candidates(polygon)
            .into_iter()
            .map(|i| &self.index.index.records[i])
            .collect()
    }
}

/// Envelope pre-filter, then true geometric intersection (boundary contact
/// counts).
pub struct ExactMatcher {
    index: Arc<TileSpatialIndex>,
}

impl ExactMatcher {
    pub fn new(index: Arc<TileSpatialIndex>) -> Self {
        Self { index }
    }
}

impl TileMatcher for ExactMatcher {
    fn name(&self) -> &'static str {
        "exact"
    }

    fn matching_tiles(&self, polygon: &MultiPolygon<f64>) -> Vec<&TileRecord> {
        self.index
            .candidates(polygon)
            .into_iter()
            .map(|i| &self.index.index.records[i])
            .filter(|tile| tile.footprint.intersects(polygon))
            .collect()
    }
}

/// The matcher for a boundary mode.
pub fn matcher_for(mode: BoundaryMode, index: Arc<TileSpatialIndex>) -> Box<dyn TileMatcher> {
    match mode {
        BoundaryMode::Fast => Box::new(BoundingBoxMatcher::new(index)),
        BoundaryMode::Exact => Box::new(ExactMatcher::new(index)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crs::Crs;
    use geo::{polygon, Coord, Polygon};
    use std::path::PathBuf;

    fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> Polygon<f64> {
        Rect::new(Coord { x: x0, y: y0 }, Coord { x: x1, y: y1 }).to_polygon()
    }

    fn index(footprints: Vec<Polygon<f64>>) -> Arc<TileSpatialIndex> {
        let records = footprints
            .into_iter()
            .enumerate()
            .map(|(i, footprint)| TileRecord {
                fid: i as i64 + 1,
                path: PathBuf::from(format!("/tiles/{}.las", i + 1)),
                footprint,
                crs: Crs::Epsg(2056),
                point_count: 10,
            })
            .collect();
        Arc::new(TileSpatialIndex::new(TileIndex {
            location: PathBuf::from("tindex.gpkg"),
            layer: "las_tiles".into(),
            crs: Crs::Epsg(2056),
            boundary_mode: BoundaryMode::Fast,
            records,
        }))
    }

    fn fids(tiles: Vec<&TileRecord>) -> Vec<i64> {
        tiles.iter().map(|t| t.fid).collect()
    }

    #[test]
    fn bbox_matcher_over_selects_diagonal_neighbours() {
        // Triangle whose envelope touches tile 2 but whose area does not.
        let idx = index(vec![rect(0.0, 0.0, 10.0, 10.0), rect(10.0, 10.0, 20.0, 20.0)]);
        let triangle: Polygon<f64> = polygon![
            (x: 1.0, y: 1.0),
            (x: 12.0, y: 1.0),
            (x: 1.0, y: 12.0),
            (x: 1.0, y: 1.0),
        ];
        let mp = MultiPolygon::new(vec![triangle]);
        assert_eq!(fids(BoundingBoxMatcher::new(idx.clone()).matching_tiles(&mp)), vec![1, 2]);
        assert_eq!(fids(ExactMatcher::new(idx).matching_tiles(&mp)), vec![1]);
    }

    #[test]
    fn boundary_contact_counts_as_intersection() {
        let idx = index(vec![rect(0.0, 0.0, 10.0, 10.0)]);
        let touching = MultiPolygon::new(vec![rect(10.0, 0.0, 15.0, 5.0)]);
        assert_eq!(fids(ExactMatcher::new(idx).matching_tiles(&touching)), vec![1]);
    }

    #[test]
    fn multipolygon_parts_are_queried_separately() {
        let idx = index(vec![
            rect(0.0, 0.0, 10.0, 10.0),
            rect(10.0, 0.0, 20.0, 10.0),
            rect(20.0, 0.0, 30.0, 10.0),
        ]);
        let parts = MultiPolygon::new(vec![rect(1.0, 1.0, 2.0, 2.0), rect(25.0, 1.0, 26.0, 2.0)]);
        let matcher = matcher_for(BoundaryMode::Fast, idx);
        assert_eq!(matcher.name(), "fast");
        assert_eq!(fids(matcher.matching_tiles(&parts)), vec![1, 3]);
    }

    #[test]
    fn empty_polygon_matches_nothing() {
        let idx = index(vec![rect(0.0, 0.0, 10.0, 10.0)]);
        let empty = MultiPolygon::<f64>::new(vec![]);
        assert!(matcher_for(BoundaryMode::Exact, idx).matching_tiles(&empty).is_empty());
    }
}
