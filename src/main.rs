use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use clap::Parser;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use redbus_tracker::config::{ARRIVALS_BASE_URL, ROUTES_BASE_URL};
use redbus_tracker::{
    ArrivalReading, ClientConfig, MapSnapshot, MapView, RedClient, RouteGeometry, TrackRequest,
    Tracker, TrackerConfig, TrackerError, TrackerStatus,
};

#[derive(Parser, Debug)]
#[command(name = "redbus-tracker", about = "Live RED bus position tracker")]
struct Args {
    /// Address the HTTP API listens on
    #[arg(long, env = "REDBUS_BIND", default_value = "0.0.0.0:3030")]
    bind: SocketAddr,

    /// Base URL of the stop arrivals service
    #[arg(long, env = "REDBUS_ARRIVALS_URL", default_value = ARRIVALS_BASE_URL)]
    arrivals_url: String,

    /// URL of the route geometry service
    #[arg(long, env = "REDBUS_ROUTES_URL", default_value = ROUTES_BASE_URL)]
    routes_url: String,

    /// Seconds between position refreshes
    #[arg(long, env = "REDBUS_POLL_SECS", default_value = "15")]
    poll_secs: u64,

    /// HTTP timeout for upstream requests in seconds
    #[arg(long, env = "REDBUS_TIMEOUT_SECS", default_value = "10")]
    timeout_secs: u64,
}

#[derive(Clone)]
struct AppState {
    client: Arc<RedClient>,
    map: Arc<MapView>,
    tracker: Tracker,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
struct TrackingView {
    status: TrackerStatus,
    map: MapSnapshot,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(err: TrackerError) -> ApiError {
    let status = match err {
        TrackerError::NetworkFailure(_) | TrackerError::MalformedPayload(_) => {
            StatusCode::BAD_GATEWAY
        }
        TrackerError::GeometryDegenerate { .. }
        | TrackerError::StopNotFoundInGeometry { .. }
        | TrackerError::BusNotInArrivals { .. } => StatusCode::NOT_FOUND,
        TrackerError::UnidentifiedBus { .. } => StatusCode::BAD_REQUEST,
        TrackerError::Superseded => StatusCode::CONFLICT,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if let Err(err) = run(args).await {
        error!(error = %err, "Server failed");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let client = Arc::new(RedClient::new(ClientConfig {
        arrivals_base_url: args.arrivals_url,
        routes_base_url: args.routes_url,
        timeout: Duration::from_secs(args.timeout_secs),
    })?);
    let map = Arc::new(MapView::new());
    let tracker = Tracker::new(
        client.clone(),
        client.clone(),
        map.clone(),
        TrackerConfig {
            poll_interval: Duration::from_secs(args.poll_secs),
        },
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/stops/{stop_code}/arrivals", get(get_stop_arrivals))
        .route("/routes/{route_id}", get(get_route))
        .route(
            "/track",
            get(get_tracking).post(start_tracking).delete(stop_tracking),
        )
        .layer(cors)
        .with_state(AppState {
            client,
            map,
            tracker,
        });

    let listener = tokio::net::TcpListener::bind(args.bind).await?;

    info!(addr = %args.bind, "Server is running");
    axum::serve(listener, app).await?;
    Ok(())
}

// Axum handler for /stops/{stop_code}/arrivals
async fn get_stop_arrivals(
    State(state): State<AppState>,
    Path(stop_code): Path<String>,
) -> Result<Json<Vec<ArrivalReading>>, ApiError> {
    let arrivals = state
        .client
        .fetch_arrivals(&stop_code)
        .await
        .map_err(api_error)?;

    info!(stop_code = %stop_code, count = arrivals.len(), "Listed arrivals");
    Ok(Json(arrivals))
}

// Axum handler for /routes/{route_id}
async fn get_route(
    State(state): State<AppState>,
    Path(route_id): Path<String>,
) -> Result<Json<RouteGeometry>, ApiError> {
    let geometry = state
        .client
        .fetch_route_geometry(&route_id)
        .await
        .map_err(api_error)?;

    info!(route_id = %geometry.route_id, stops = geometry.stops.len(), "Loaded route");
    Ok(Json(geometry))
}

fn tracking_view(state: &AppState) -> TrackingView {
    TrackingView {
        status: state.tracker.status(),
        map: state.map.snapshot(),
    }
}

async fn get_tracking(State(state): State<AppState>) -> Json<TrackingView> {
    Json(tracking_view(&state))
}

async fn start_tracking(
    State(state): State<AppState>,
    Json(request): Json<TrackRequest>,
) -> Result<Json<TrackingView>, ApiError> {
    state.tracker.start(request).await.map_err(api_error)?;
    Ok(Json(tracking_view(&state)))
}

async fn stop_tracking(State(state): State<AppState>) -> StatusCode {
    state.tracker.stop();
    StatusCode::NO_CONTENT
}
