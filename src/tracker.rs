//! Live tracking session.
//!
//! A [`Tracker`] watches at most one (stop, route, plate) triple at a time.
//! Starting a session tears down the previous one, loads the route geometry,
//! places the bus marker and spawns a poll loop that refreshes the marker
//! from the arrivals feed every `poll_interval`.
//!
//! # Session lifecycle
//!
//! ```text
//!  Idle ──start──► Loading ──geometry ok──► Tracking ◄──tick──┐
//!   ▲                 │                        │  └───────────┘
//!   └──── fetch err ──┘                        │
//!   └───────────────────── stop / start ───────┘
//! ```
//!
//! Every session gets a fresh id. Work that was started for an older id
//! (a slow `start`, a poll tick still waiting on the network) checks the id
//! again before touching the map and drops its result when it no longer
//! matches.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{ArrivalsSource, RouteGeometrySource};
use crate::config::{TrackerConfig, MIN_POLL_INTERVAL};
use crate::error::TrackerError;
use crate::geo::GeoPoint;
use crate::map::MapSurface;
use crate::model::{is_known_plate, normalize_code, ArrivalReading, RouteGeometry};
use crate::projector::project;

/// A bus picked off a stop's arrivals list.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackRequest {
    pub stop_code: String,
    pub route_id: String,
    pub plate: String,
    #[serde(default)]
    pub distance_meters: Option<f64>,
    #[serde(default)]
    pub eta: Option<String>,
}

/// Observable state of the tracker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TrackerStatus {
    Idle,
    Loading {
        stop_code: String,
        route_id: String,
        plate: String,
    },
    Tracking {
        stop_code: String,
        route_id: String,
        plate: String,
        position: GeoPoint,
        /// Last refresh could not move the marker.
        stale: bool,
    },
}

#[derive(Debug, Clone)]
struct SessionKey {
    id: u64,
    stop_code: String,
    route_id: String,
    plate: String,
}

#[derive(Debug)]
struct TrackingSession {
    key: SessionKey,
    last_known_position: GeoPoint,
    poll: CancellationToken,
    stale: bool,
}

#[derive(Debug)]
enum Phase {
    Idle,
    Loading(SessionKey),
    Tracking(TrackingSession),
}

impl Phase {
    fn session_id(&self) -> Option<u64> {
        match self {
            Phase::Idle => None,
            Phase::Loading(key) => Some(key.id),
            Phase::Tracking(session) => Some(session.key.id),
        }
    }
}

struct Inner {
    arrivals: Arc<dyn ArrivalsSource>,
    geometry: Arc<dyn RouteGeometrySource>,
    surface: Arc<dyn MapSurface>,
    config: TrackerConfig,
    phase: Mutex<Phase>,
    next_session: AtomicU64,
    active_polls: AtomicUsize,
}

/// Controller for the single live tracking session.
///
/// Cloning is cheap and every clone drives the same session.
#[derive(Clone)]
pub struct Tracker {
    inner: Arc<Inner>,
}

impl Tracker {
    /// Poll intervals below [`MIN_POLL_INTERVAL`] are raised to it.
    pub fn new(
        arrivals: Arc<dyn ArrivalsSource>,
        geometry: Arc<dyn RouteGeometrySource>,
        surface: Arc<dyn MapSurface>,
        mut config: TrackerConfig,
    ) -> Self {
        if config.poll_interval < MIN_POLL_INTERVAL {
            warn!(
                requested = ?config.poll_interval,
                "Poll interval too short, using {:?}",
                MIN_POLL_INTERVAL
            );
            config.poll_interval = MIN_POLL_INTERVAL;
        }

        Self {
            inner: Arc::new(Inner {
                arrivals,
                geometry,
                surface,
                config,
                phase: Mutex::new(Phase::Idle),
                next_session: AtomicU64::new(0),
                active_polls: AtomicUsize::new(0),
            }),
        }
    }

    /// Starts tracking a bus, replacing any current session.
    ///
    /// Returns the initial marker position. On error the tracker is back in
    /// `Idle` and the error has been shown on the map, except for
    /// [`TrackerError::Superseded`] where a newer call owns the map, and
    /// [`TrackerError::UnidentifiedBus`] which is rejected before the current
    /// session is touched.
    ///
    /// Dropping the returned future while the route is loading puts the
    /// tracker back in `Idle`.
    pub async fn start(&self, request: TrackRequest) -> Result<GeoPoint, TrackerError> {
        // Without a plate every tick would match whichever plate-less bus on
        // the route comes first.
        if !is_known_plate(&request.plate) {
            return Err(TrackerError::UnidentifiedBus {
                route_id: request.route_id.trim().to_string(),
            });
        }

        let key = SessionKey {
            id: self.inner.next_session.fetch_add(1, Ordering::Relaxed) + 1,
            stop_code: normalize_code(&request.stop_code),
            route_id: request.route_id.trim().to_string(),
            plate: request.plate.trim().to_string(),
        };

        {
            let mut phase = self.inner.phase.lock();
            self.teardown(&mut phase);
            *phase = Phase::Loading(key.clone());
        }
        let _loading = LoadingGuard {
            inner: &self.inner,
            session: key.id,
        };

        info!(
            session = key.id,
            stop_code = %key.stop_code,
            route_id = %key.route_id,
            plate = %key.plate,
            "Starting tracking session"
        );

        let loaded = self
            .inner
            .geometry
            .route_geometry(&key.route_id)
            .await
            .and_then(|geometry| {
                let position = initial_position(&geometry, &key.stop_code, request.distance_meters)?;
                Ok((geometry, position))
            });

        let mut phase = self.inner.phase.lock();
        if phase.session_id() != Some(key.id) {
            debug!(session = key.id, "Session replaced while loading, dropping result");
            return Err(TrackerError::Superseded);
        }

        let (geometry, position) = match loaded {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!(session = key.id, error = %err, "Failed to start tracking session");
                *phase = Phase::Idle;
                self.inner
                    .surface
                    .show_error(&format!("No se pudo cargar el recorrido {}: {}", key.route_id, err));
                return Err(err);
            }
        };

        let label = ArrivalReading {
            route_id: key.route_id.clone(),
            plate: key.plate.clone(),
            distance_meters: request.distance_meters,
            eta_label: request.eta.unwrap_or_default(),
        }
        .marker_label();

        self.inner.surface.draw_route(&geometry);
        self.inner.surface.place_bus_marker(position, &label);

        let poll = CancellationToken::new();
        *phase = Phase::Tracking(TrackingSession {
            key: key.clone(),
            last_known_position: position,
            poll: poll.clone(),
            stale: false,
        });

        self.inner.active_polls.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(self.clone().poll_loop(key.id, poll));

        info!(session = key.id, lat = position.lat, lng = position.lng, "Bus marker placed");
        Ok(position)
    }

    /// Ends the current session. Does nothing when already idle.
    pub fn stop(&self) {
        let mut phase = self.inner.phase.lock();
        self.teardown(&mut phase);
    }

    pub fn status(&self) -> TrackerStatus {
        match &*self.inner.phase.lock() {
            Phase::Idle => TrackerStatus::Idle,
            Phase::Loading(key) => TrackerStatus::Loading {
                stop_code: key.stop_code.clone(),
                route_id: key.route_id.clone(),
                plate: key.plate.clone(),
            },
            Phase::Tracking(session) => TrackerStatus::Tracking {
                stop_code: session.key.stop_code.clone(),
                route_id: session.key.route_id.clone(),
                plate: session.key.plate.clone(),
                position: session.last_known_position,
                stale: session.stale,
            },
        }
    }

    /// Number of poll loops that have not exited yet.
    pub fn active_polls(&self) -> usize {
        self.inner.active_polls.load(Ordering::SeqCst)
    }

    fn teardown(&self, phase: &mut Phase) {
        match std::mem::replace(phase, Phase::Idle) {
            Phase::Tracking(session) => {
                session.poll.cancel();
                info!(session = session.key.id, "Tracking session stopped");
            }
            Phase::Loading(key) => {
                debug!(session = key.id, "Abandoning session that was still loading");
            }
            Phase::Idle => {}
        }
        self.inner.surface.clear();
    }

    async fn poll_loop(self, session: u64, cancel: CancellationToken) {
        let _active = ActivePoll(self.inner.clone());

        let period = self.inner.config.poll_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.tick(session).await;
        }

        debug!(session, "Poll loop exited");
    }

    async fn tick(&self, session: u64) {
        let Some(key) = self.current_key(session) else {
            return;
        };

        let arrivals = match self.inner.arrivals.next_arrivals(&key.stop_code).await {
            Ok(arrivals) => arrivals,
            Err(err) => {
                warn!(session, stop_code = %key.stop_code, error = %err, "Arrivals refresh failed, keeping last position");
                self.mark_stale(session);
                return;
            }
        };

        let Some(reading) = arrivals
            .into_iter()
            .find(|reading| reading.matches(&key.route_id, &key.plate))
        else {
            let err = TrackerError::BusNotInArrivals {
                route_id: key.route_id.clone(),
                plate: key.plate.clone(),
            };
            warn!(session, stop_code = %key.stop_code, error = %err, "Keeping last position");
            self.mark_stale(session);
            return;
        };

        let distance = reading
            .distance_meters
            .filter(|distance| distance.is_finite() && *distance >= 0.0);

        let position = match distance {
            Some(distance) => match self.locate(&key, distance).await {
                Ok(position) => Some(position),
                Err(err) => {
                    warn!(session, error = %err, "Could not reposition bus marker");
                    None
                }
            },
            None => {
                debug!(session, "Arrival has no usable distance, refreshing label only");
                None
            }
        };

        self.apply(session, &reading.marker_label(), position);
    }

    /// Re-fetches the route and projects the bus position.
    async fn locate(&self, key: &SessionKey, distance: f64) -> Result<GeoPoint, TrackerError> {
        let geometry = self.inner.geometry.route_geometry(&key.route_id).await?;
        let stop = geometry
            .find_stop(&key.stop_code)
            .ok_or_else(|| TrackerError::StopNotFoundInGeometry {
                stop_code: key.stop_code.clone(),
                route_id: key.route_id.clone(),
            })?;

        project(&geometry.path, &stop.position, distance).ok_or(TrackerError::GeometryDegenerate {
            points: geometry.path.len(),
        })
    }

    fn apply(&self, session: u64, label: &str, position: Option<GeoPoint>) {
        let mut phase = self.inner.phase.lock();
        let current = match &mut *phase {
            Phase::Tracking(current) if current.key.id == session => current,
            _ => {
                debug!(session, "Discarding refresh for a session that is no longer current");
                return;
            }
        };

        self.inner.surface.set_bus_label(label);

        match position {
            Some(position) => {
                self.inner.surface.move_bus_marker(position);
                current.last_known_position = position;
                current.stale = false;
                debug!(session, lat = position.lat, lng = position.lng, "Bus marker moved");
            }
            None => current.stale = true,
        }
    }

    fn current_key(&self, session: u64) -> Option<SessionKey> {
        match &*self.inner.phase.lock() {
            Phase::Tracking(current) if current.key.id == session => Some(current.key.clone()),
            _ => None,
        }
    }

    fn mark_stale(&self, session: u64) {
        if let Phase::Tracking(current) = &mut *self.inner.phase.lock() {
            if current.key.id == session {
                current.stale = true;
            }
        }
    }
}

/// Resets a session that is still `Loading` to `Idle` when its `start` is
/// dropped before finishing.
struct LoadingGuard<'a> {
    inner: &'a Inner,
    session: u64,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        let mut phase = self.inner.phase.lock();
        if matches!(&*phase, Phase::Loading(key) if key.id == self.session) {
            debug!(session = self.session, "Start abandoned while loading");
            *phase = Phase::Idle;
        }
    }
}

struct ActivePoll(Arc<Inner>);

impl Drop for ActivePoll {
    fn drop(&mut self) {
        self.0.active_polls.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Where to put the marker when a session starts.
///
/// Falls back to the first polyline point when the stop is not on the route,
/// the distance is unknown or the projection fails. Only an empty polyline is
/// an error, since then there is nowhere to put the marker.
fn initial_position(
    geometry: &RouteGeometry,
    stop_code: &str,
    distance_meters: Option<f64>,
) -> Result<GeoPoint, TrackerError> {
    let first = *geometry
        .path
        .first()
        .ok_or(TrackerError::GeometryDegenerate { points: 0 })?;

    let Some(stop) = geometry.find_stop(stop_code) else {
        warn!(
            stop_code,
            route_id = %geometry.route_id,
            "Stop not on route, placing bus at route start"
        );
        return Ok(first);
    };

    let position = distance_meters
        .filter(|distance| *distance >= 0.0)
        .and_then(|distance| project(&geometry.path, &stop.position, distance));

    Ok(position.unwrap_or(first))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Stop, DEFAULT_ROUTE_COLOR};

    fn geometry(path: Vec<GeoPoint>) -> RouteGeometry {
        RouteGeometry {
            route_id: "F03".to_string(),
            name: None,
            color: DEFAULT_ROUTE_COLOR.to_string(),
            path,
            stops: vec![Stop {
                code: "PF1126".to_string(),
                name: "Parada 3".to_string(),
                position: GeoPoint::new(0.0, 2.0),
            }],
        }
    }

    fn line() -> Vec<GeoPoint> {
        vec![
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(0.0, 1.0),
            GeoPoint::new(0.0, 2.0),
        ]
    }

    #[test]
    fn test_initial_position_projects_from_stop() {
        let geometry = geometry(line());
        let distance = GeoPoint::new(0.0, 2.0).distance_to(&GeoPoint::new(0.0, 1.0));

        let position = initial_position(&geometry, "pf1126", Some(distance)).unwrap();
        assert!(position.approx_eq(&GeoPoint::new(0.0, 1.0), 1e-9));
    }

    #[test]
    fn test_initial_position_fallbacks() {
        let geometry = geometry(line());
        let first = GeoPoint::new(0.0, 0.0);

        assert_eq!(initial_position(&geometry, "PF1126", None).unwrap(), first);
        assert_eq!(initial_position(&geometry, "PF1126", Some(-1.0)).unwrap(), first);
        assert_eq!(initial_position(&geometry, "PX0000", Some(10.0)).unwrap(), first);
    }

    #[test]
    fn test_initial_position_single_point_route() {
        let only = GeoPoint::new(0.0, 5.0);
        let geometry = geometry(vec![only]);
        assert_eq!(initial_position(&geometry, "PF1126", Some(10.0)).unwrap(), only);
    }

    #[test]
    fn test_initial_position_empty_route_is_degenerate() {
        let err = initial_position(&geometry(vec![]), "PF1126", Some(10.0)).unwrap_err();
        assert_eq!(err, TrackerError::GeometryDegenerate { points: 0 });
    }
}
