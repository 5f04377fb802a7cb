//! Back-distance projection along a route polyline.
//!
//! The arrivals feed says "bus is N meters from stop S". To draw the bus we
//! find the polyline vertex closest to S (the anchor) and walk the polyline
//! backwards from there, summing segment lengths until N meters are covered.
//! The final segment is interpolated linearly in lat/lng.

use crate::geo::GeoPoint;

/// Point lying `distance_meters` before `target` along `polyline`.
///
/// Returns `None` when the polyline has fewer than two points. When the
/// distance is longer than the route from its start to the anchor, the
/// first polyline point is returned.
pub fn project(
    polyline: &[GeoPoint],
    target: &GeoPoint,
    distance_meters: f64,
) -> Option<GeoPoint> {
    let anchor = anchor_index(polyline, target)?;

    let mut accumulated = 0.0;
    let mut last_point = polyline[anchor];

    for next_point in polyline[..anchor].iter().rev() {
        let segment = last_point.distance_to(next_point);

        if accumulated + segment >= distance_meters {
            let fraction = if segment > 0.0 {
                (distance_meters - accumulated) / segment
            } else {
                0.0
            };
            return Some(last_point.lerp(next_point, fraction));
        }

        accumulated += segment;
        last_point = *next_point;
    }

    polyline.first().copied()
}

/// Index of the polyline vertex closest to `target`.
///
/// Vertices are visited pairwise along the polyline and the best one only
/// changes on a strictly smaller distance, so ties go to the earliest vertex.
pub fn anchor_index(polyline: &[GeoPoint], target: &GeoPoint) -> Option<usize> {
    if polyline.len() < 2 {
        return None;
    }

    let mut best: Option<(usize, f64)> = None;

    for (i, pair) in polyline.windows(2).enumerate() {
        for (offset, point) in pair.iter().enumerate() {
            let distance = point.distance_to(target);
            match best {
                Some((_, best_distance)) if distance >= best_distance => {}
                _ if distance.is_nan() => {}
                _ => best = Some((i + offset, distance)),
            }
        }
    }

    best.map(|(index, _)| index)
}
