//! Rendering surface for the tracked bus.
//!
//! [`MapSurface`] is what the tracker draws on. [`MapView`] keeps the drawn
//! state in memory so the HTTP layer can hand it to a browser map.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::geo::GeoPoint;
use crate::model::{RouteGeometry, Stop};

/// Commands the tracker issues to whatever displays the map.
pub trait MapSurface: Send + Sync {
    /// Draws the route polyline and its stops, replacing any previous route.
    fn draw_route(&self, geometry: &RouteGeometry);

    fn place_bus_marker(&self, position: GeoPoint, label: &str);

    fn move_bus_marker(&self, position: GeoPoint);

    fn set_bus_label(&self, label: &str);

    fn show_error(&self, message: &str);

    /// Removes route, marker and error message.
    fn clear(&self);
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteOverlay {
    pub route_id: String,
    pub name: Option<String>,
    pub color: String,
    pub path: Vec<GeoPoint>,
    pub stops: Vec<Stop>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusMarker {
    pub position: GeoPoint,
    pub label: String,
    pub updated_at: DateTime<Utc>,
}

/// Everything currently drawn.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MapSnapshot {
    pub route: Option<RouteOverlay>,
    pub bus_marker: Option<BusMarker>,
    pub error: Option<String>,
}

/// In-memory [`MapSurface`].
#[derive(Debug, Default)]
pub struct MapView {
    state: RwLock<MapSnapshot>,
}

impl MapView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MapSnapshot {
        self.state.read().clone()
    }

    /// Position of the bus marker, if one is shown.
    pub fn bus_position(&self) -> Option<GeoPoint> {
        self.state.read().bus_marker.as_ref().map(|m| m.position)
    }
}

impl MapSurface for MapView {
    fn draw_route(&self, geometry: &RouteGeometry) {
        self.state.write().route = Some(RouteOverlay {
            route_id: geometry.route_id.clone(),
            name: geometry.name.clone(),
            color: geometry.color.clone(),
            path: geometry.path.clone(),
            stops: geometry.stops.clone(),
        });
    }

    fn place_bus_marker(&self, position: GeoPoint, label: &str) {
        let mut state = self.state.write();
        state.bus_marker = Some(BusMarker {
            position,
            label: label.to_string(),
            updated_at: Utc::now(),
        });
        state.error = None;
    }

    fn move_bus_marker(&self, position: GeoPoint) {
        if let Some(marker) = self.state.write().bus_marker.as_mut() {
            marker.position = position;
            marker.updated_at = Utc::now();
        }
    }

    fn set_bus_label(&self, label: &str) {
        if let Some(marker) = self.state.write().bus_marker.as_mut() {
            marker.label = label.to_string();
            marker.updated_at = Utc::now();
        }
    }

    fn show_error(&self, message: &str) {
        self.state.write().error = Some(message.to_string());
    }

    fn clear(&self) {
        *self.state.write() = MapSnapshot::default();
    }
}
