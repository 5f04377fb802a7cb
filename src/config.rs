//! Runtime configuration.

use std::time::Duration;

/// Arrivals proxy for RED stops.
pub const ARRIVALS_BASE_URL: &str = "https://red-api.chewy.workers.dev";
/// RED route lookup service.
pub const ROUTES_BASE_URL: &str = "https://red.cl/restservice_v2/rest/conocerecorrido";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);
/// Shorter intervals are raised to this.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Tracking session settings.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Time between arrivals refreshes while a bus is tracked.
    pub poll_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Settings for the HTTP client talking to the RED services.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub arrivals_base_url: String,
    pub routes_base_url: String,
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            arrivals_base_url: ARRIVALS_BASE_URL.to_string(),
            routes_base_url: ROUTES_BASE_URL.to_string(),
            timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }
}
