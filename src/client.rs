//! Arrivals and route geometry sources.
//!
//! The tracker only sees the [`ArrivalsSource`] and [`RouteGeometrySource`]
//! traits so tests can swap in canned data. [`RedClient`] is the real
//! implementation against the RED web services.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use serde::{Deserialize, Deserializer};
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::TrackerError;
use crate::geo::GeoPoint;
use crate::model::{
    normalize_code, ArrivalReading, RouteGeometry, Stop, DEFAULT_ROUTE_COLOR, UNKNOWN_PLATE,
};

/// Next arrivals at a stop.
pub trait ArrivalsSource: Send + Sync {
    fn next_arrivals<'a>(
        &'a self,
        stop_code: &'a str,
    ) -> BoxFuture<'a, Result<Vec<ArrivalReading>, TrackerError>>;
}

/// Outbound polyline and stops of a route.
pub trait RouteGeometrySource: Send + Sync {
    fn route_geometry<'a>(
        &'a self,
        route_id: &'a str,
    ) -> BoxFuture<'a, Result<RouteGeometry, TrackerError>>;
}

/// HTTP client for the RED arrivals proxy and route service.
#[derive(Debug, Clone)]
pub struct RedClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl RedClient {
    pub fn new(config: ClientConfig) -> Result<Self, TrackerError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| {
                TrackerError::NetworkFailure(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self { client, config })
    }

    fn arrivals_url(&self, stop_code: &str) -> String {
        format!(
            "{}/stops/{}/next_arrivals",
            self.config.arrivals_base_url.trim_end_matches('/'),
            normalize_code(stop_code)
        )
    }

    async fn fetch(&self, request: reqwest::RequestBuilder) -> Result<Vec<u8>, TrackerError> {
        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let url = response.url().to_string();
            let body = response.text().await.unwrap_or_default();
            return Err(TrackerError::NetworkFailure(format!(
                "HTTP {} from {}: {}",
                status, url, body
            )));
        }

        Ok(response.bytes().await?.to_vec())
    }

    pub async fn fetch_arrivals(&self, stop_code: &str) -> Result<Vec<ArrivalReading>, TrackerError> {
        let url = self.arrivals_url(stop_code);
        debug!(url = %url, "Fetching arrivals");

        let body = self.fetch(self.client.get(&url)).await?;
        parse_arrivals(&body)
    }

    pub async fn fetch_route_geometry(&self, route_id: &str) -> Result<RouteGeometry, TrackerError> {
        let route_id = normalize_code(route_id);
        debug!(route_id = %route_id, "Fetching route geometry");

        let request = self
            .client
            .get(&self.config.routes_base_url)
            .query(&[("codsint", route_id.as_str())]);
        let body = self.fetch(request).await?;
        parse_route_geometry(&route_id, &body)
    }
}

impl ArrivalsSource for RedClient {
    fn next_arrivals<'a>(
        &'a self,
        stop_code: &'a str,
    ) -> BoxFuture<'a, Result<Vec<ArrivalReading>, TrackerError>> {
        self.fetch_arrivals(stop_code).boxed()
    }
}

impl RouteGeometrySource for RedClient {
    fn route_geometry<'a>(
        &'a self,
        route_id: &'a str,
    ) -> BoxFuture<'a, Result<RouteGeometry, TrackerError>> {
        self.fetch_route_geometry(route_id).boxed()
    }
}

// Wire payloads

#[derive(Debug, Deserialize)]
struct ArrivalsPayload {
    results: Vec<ArrivalRecord>,
}

#[derive(Debug, Deserialize)]
struct ArrivalRecord {
    route_id: String,
    #[serde(default)]
    bus_plate_number: Option<String>,
    #[serde(default, deserialize_with = "lenient_meters")]
    bus_distance: Option<f64>,
    #[serde(default)]
    arrival_estimation: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RoutePayload {
    ida: DirectionPayload,
    #[serde(default)]
    negocio: Option<BusinessPayload>,
}

#[derive(Debug, Deserialize)]
struct DirectionPayload {
    #[serde(default)]
    path: Vec<[f64; 2]>,
    #[serde(default)]
    paraderos: Vec<StopRecord>,
}

#[derive(Debug, Deserialize)]
struct StopRecord {
    cod: String,
    #[serde(default)]
    name: String,
    pos: [f64; 2],
}

#[derive(Debug, Deserialize)]
struct BusinessPayload {
    #[serde(default)]
    color: Option<String>,
    #[serde(default)]
    nombre: Option<String>,
}

/// The feed sends distances as numbers, numeric strings or null.
fn lenient_meters<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    let meters = match value {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    Ok(meters.filter(|m| m.is_finite() && *m >= 0.0))
}

/// Parses a `next_arrivals` response body.
pub fn parse_arrivals(body: &[u8]) -> Result<Vec<ArrivalReading>, TrackerError> {
    let payload: ArrivalsPayload = serde_json::from_slice(body)?;

    Ok(payload
        .results
        .into_iter()
        .map(|record| ArrivalReading {
            route_id: record.route_id,
            plate: record
                .bus_plate_number
                .filter(|plate| !plate.is_empty())
                .unwrap_or_else(|| UNKNOWN_PLATE.to_string()),
            distance_meters: record.bus_distance,
            eta_label: record.arrival_estimation.unwrap_or_default(),
        })
        .collect())
}

/// Parses a `conocerecorrido` response body, keeping the outbound direction.
pub fn parse_route_geometry(route_id: &str, body: &[u8]) -> Result<RouteGeometry, TrackerError> {
    let payload: RoutePayload = serde_json::from_slice(body)?;
    let (color, name) = match payload.negocio {
        Some(business) => (business.color, business.nombre),
        None => (None, None),
    };

    Ok(RouteGeometry {
        route_id: route_id.to_string(),
        name,
        color: color
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| DEFAULT_ROUTE_COLOR.to_string()),
        path: payload.ida.path.into_iter().map(GeoPoint::from).collect(),
        stops: payload
            .ida
            .paraderos
            .into_iter()
            .map(|record| Stop {
                code: record.cod,
                name: record.name,
                position: GeoPoint::from(record.pos),
            })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arrivals() {
        let body = br#"{
            "results": [
                {"route_id": "F03", "bus_plate_number": "FLXG-42", "bus_distance": 812, "arrival_estimation": "Entre 03 Y 05 min."},
                {"route_id": "F03c", "bus_plate_number": null, "bus_distance": "1450", "arrival_estimation": "Entre 05 Y 09 min."},
                {"route_id": "D18", "bus_plate_number": "", "bus_distance": null, "arrival_estimation": "Mas de 45 min."}
            ]
        }"#;

        let arrivals = parse_arrivals(body).unwrap();
        assert_eq!(arrivals.len(), 3);

        assert_eq!(arrivals[0].plate, "FLXG-42");
        assert_eq!(arrivals[0].distance_meters, Some(812.0));
        assert_eq!(arrivals[0].eta_label, "Entre 03 Y 05 min.");

        assert_eq!(arrivals[1].plate, "N/A");
        assert_eq!(arrivals[1].distance_meters, Some(1450.0));

        assert_eq!(arrivals[2].plate, "N/A");
        assert_eq!(arrivals[2].distance_meters, None);
    }

    #[test]
    fn test_parse_arrivals_empty_list() {
        assert!(parse_arrivals(br#"{"results": []}"#).unwrap().is_empty());
    }

    #[test]
    fn test_parse_arrivals_missing_results_is_malformed() {
        let err = parse_arrivals(br#"{"error": "stop not found"}"#).unwrap_err();
        assert!(matches!(err, TrackerError::MalformedPayload(_)));

        let err = parse_arrivals(b"<html>").unwrap_err();
        assert!(matches!(err, TrackerError::MalformedPayload(_)));
    }

    #[test]
    fn test_negative_distance_is_unknown() {
        let body = br#"{"results": [{"route_id": "F03", "bus_distance": -5}]}"#;
        assert_eq!(parse_arrivals(body).unwrap()[0].distance_meters, None);
    }

    #[test]
    fn test_parse_route_geometry() {
        let body = br##"{
            "negocio": {"color": "#00A77E", "nombre": "Metbus"},
            "ida": {
                "path": [[-33.45, -70.62], [-33.46, -70.63]],
                "paraderos": [{"cod": "PF1126", "name": "Parada 3", "pos": [-33.46, -70.63]}]
            },
            "regreso": {"path": [], "paraderos": []}
        }"##;

        let geometry = parse_route_geometry("F03", body).unwrap();
        assert_eq!(geometry.route_id, "F03");
        assert_eq!(geometry.color, "#00A77E");
        assert_eq!(geometry.name.as_deref(), Some("Metbus"));
        assert_eq!(geometry.path.len(), 2);
        assert_eq!(geometry.path[0], GeoPoint::new(-33.45, -70.62));
        assert_eq!(geometry.stops[0].code, "PF1126");
        assert_eq!(geometry.stops[0].position, GeoPoint::new(-33.46, -70.63));
    }

    #[test]
    fn test_route_without_business_uses_default_color() {
        let body = br#"{"ida": {"path": [], "paraderos": []}}"#;
        let geometry = parse_route_geometry("F03", body).unwrap();
        assert_eq!(geometry.color, DEFAULT_ROUTE_COLOR);
        assert!(geometry.path.is_empty());
    }

    #[test]
    fn test_route_missing_outbound_is_malformed() {
        let err = parse_route_geometry("F03", br#"{"negocio": {}}"#).unwrap_err();
        assert!(matches!(err, TrackerError::MalformedPayload(_)));
    }

    #[test]
    fn test_arrivals_url_normalizes_stop() {
        let client = RedClient::new(ClientConfig {
            arrivals_base_url: "http://localhost:8787/".to_string(),
            ..ClientConfig::default()
        })
        .unwrap();
        assert_eq!(
            client.arrivals_url(" pf1126"),
            "http://localhost:8787/stops/PF1126/next_arrivals"
        );
    }
}
