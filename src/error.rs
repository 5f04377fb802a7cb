use thiserror::Error;

/// Errors raised while tracking a bus.
///
/// None of these are fatal: the tracker recovers from each one where it
/// happens and only `start` hands them back to the caller.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TrackerError {
    #[error("Network failure: {0}")]
    NetworkFailure(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Route geometry has {points} point(s), at least 2 are needed")]
    GeometryDegenerate { points: usize },

    #[error("Stop '{stop_code}' not found in route '{route_id}'")]
    StopNotFoundInGeometry { stop_code: String, route_id: String },

    #[error("Bus {plate} on route {route_id} not found in arrivals")]
    BusNotInArrivals { route_id: String, plate: String },

    #[error("Bus on route {route_id} has no plate and cannot be tracked")]
    UnidentifiedBus { route_id: String },

    #[error("Tracking session was replaced before it finished loading")]
    Superseded,
}

impl From<reqwest::Error> for TrackerError {
    fn from(err: reqwest::Error) -> Self {
        TrackerError::NetworkFailure(err.to_string())
    }
}

impl From<serde_json::Error> for TrackerError {
    fn from(err: serde_json::Error) -> Self {
        TrackerError::MalformedPayload(err.to_string())
    }
}
