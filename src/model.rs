use serde::{Deserialize, Serialize};

use crate::geo::GeoPoint;

/// Color RED uses when a route has none of its own.
pub const DEFAULT_ROUTE_COLOR: &str = "#004A8F";

/// Plate shown for arrivals the feed reports without one.
pub const UNKNOWN_PLATE: &str = "N/A";

/// A bus stop (paradero) on a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub code: String,
    pub name: String,
    pub position: GeoPoint,
}

/// Outbound path and stops of one route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteGeometry {
    pub route_id: String,
    pub name: Option<String>,
    pub color: String,
    pub path: Vec<GeoPoint>,
    pub stops: Vec<Stop>,
}

impl RouteGeometry {
    /// Finds a stop by code, ignoring case and surrounding whitespace.
    pub fn find_stop(&self, code: &str) -> Option<&Stop> {
        let code = normalize_code(code);
        self.stops.iter().find(|stop| normalize_code(&stop.code) == code)
    }
}

/// One row of a stop's next arrivals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrivalReading {
    pub route_id: String,
    pub plate: String,
    /// `None` when the feed has no distance for this bus.
    pub distance_meters: Option<f64>,
    pub eta_label: String,
}

impl ArrivalReading {
    pub fn matches(&self, route_id: &str, plate: &str) -> bool {
        self.route_id == route_id && self.plate == plate
    }

    /// Popup text for this reading.
    pub fn marker_label(&self) -> String {
        match self.distance_meters {
            Some(meters) => format!(
                "{} ({}): {} (aprox. {:.0} mts)",
                self.route_id, self.plate, self.eta_label, meters
            ),
            None => format!(
                "{} ({}): {} (distancia desconocida)",
                self.route_id, self.plate, self.eta_label
            ),
        }
    }
}

/// False for plates the feed left out, which cannot tell two buses apart.
pub fn is_known_plate(plate: &str) -> bool {
    let plate = plate.trim();
    !plate.is_empty() && plate != UNKNOWN_PLATE
}

/// Stop codes and route ids are typed by people, e.g. " pf1126 ".
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}
