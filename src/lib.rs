//! Live bus position tracking for RED Santiago routes.
//!
//! The arrivals feed only reports how far a bus is from a stop. This crate
//! turns that distance into a point on the route polyline and keeps a map
//! marker at that point while new readings arrive.
//!
//! - [`projector`] walks a polyline backwards from a stop.
//! - [`tracker`] owns the single live tracking session and its poll loop.
//! - [`client`] talks to the arrivals and route geometry services.
//! - [`map`] is the rendering surface the tracker draws on.

pub mod client;
pub mod config;
pub mod error;
pub mod geo;
pub mod map;
pub mod model;
pub mod projector;
pub mod tracker;

pub use client::{ArrivalsSource, RedClient, RouteGeometrySource};
pub use config::{ClientConfig, TrackerConfig};
pub use error::TrackerError;
pub use geo::GeoPoint;
pub use map::{MapSnapshot, MapSurface, MapView};
pub use model::{ArrivalReading, RouteGeometry, Stop};
pub use projector::project;
pub use tracker::{TrackRequest, Tracker, TrackerStatus};
