//! # LAS Dice
//!
//! Clip LAS/LAZ point-cloud tiles by polygon footprints through a tile index.
//!
//! Given a GeoPackage (or shapefile) of polygons and a directory tree of
//! point-cloud tiles, LAS Dice validates that every input shares one coordinate reference system,
//! builds (or reuses) a GeoPackage tile index of tile footprints, matches each
//! polygon to the tiles it touches and writes one clipped LAS/LAZ file per
//! polygon, named from a polygon attribute.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌───────────┐   ┌────────────┐   ┌─────────────┐
//! │  Polygons │──▶│    CRS    │──▶│ Tile index │──▶│ Orchestrator│
//! │  (GPKG)   │   │ validator │   │  (GPKG)    │   │  + clipper  │
//! └───────────┘   └─────▲─────┘   └─────▲──────┘   └──────┬──────┘
//!                       │               │                 ▼
//!                 ┌─────┴───────────────┴┐          ┌────────────┐
//!                 │   LAS/LAZ tiles      │          │ clips/*.laz│
//!                 └──────────────────────┘          └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! las-dice init --polygons parcels.gpkg --name-field name \
//!     --tiles /data/lidar --tindex work/tindex.gpkg --output clips
//! las-dice run               # preview
//! las-dice run --execute     # write clips
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Fatal and per-job error taxonomy |
//! | [`crs`] | CRS extraction and validation |
//! | [`tiles`] | Tile discovery and header reading |
//! | [`gpkg`] | GeoPackage storage over SQLite |
//! | [`wkb`] | Well-Known Binary geometry codec |
//! | [`polygons`] | Polygon source reader |
//! | [`shp`] | Shapefile polygon sources |
//! | [`tindex`] | Tile index build, inspection and loading |
//! | [`matcher`] | Polygon to tile matching |
//! | [`naming`] | Output file naming |
//! | [`clipper`] | Point-level clip execution |
//! | [`orchestrator`] | Concurrent clip jobs |
//! | [`pipeline`] | End-to-end flows |
//! | [`progress`] | Progress reporting |
//! | [`report`] | Summaries and report files |

pub mod clipper;
pub mod config;
pub mod crs;
pub mod error;
pub mod gpkg;
pub mod matcher;
pub mod models;
pub mod naming;
pub mod orchestrator;
pub mod pipeline;
pub mod polygons;
pub mod progress;
pub mod report;
pub mod shp;
pub mod tiles;
pub mod tindex;
pub mod wkb;
