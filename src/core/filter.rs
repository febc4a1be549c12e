//! Point filter: drops invalid and stationary points

use crate::core::config::FilterOptions;
use crate::core::context::RunContext;
use crate::core::geo::haversine_distance;
use crate::core::model::{Diagnostic, Route, Stage, TrackPoint};
use crate::{Error, Result};

/// Share of dropped points above which the filter warns
const DROP_WARNING_RATIO: f64 = 0.1;

fn is_usable(point: &TrackPoint, options: &FilterOptions) -> bool {
    let position = point.position();
    position.is_valid() && (options.allow_null_island || !position.is_null_island())
}

fn is_slow(point: &TrackPoint, options: &FilterOptions) -> bool {
    point.speed.is_some_and(|speed| speed < options.speed_epsilon)
}

/// Whether `candidate` moved away from the last kept point
///
/// A run of stationary points collapses to its first member, which stays the
/// anchor until the track moves beyond the tolerance again.
fn has_moved(anchor: &TrackPoint, candidate: &TrackPoint, options: &FilterOptions) -> bool {
    if is_slow(anchor, options) && is_slow(candidate, options) {
        return false;
    }
    haversine_distance(anchor.position(), candidate.position()) > options.distance_tolerance_m
}

/// Remove invalid and stationary points, preserving order
///
/// Re-filtering the output is a no-op: every kept point lies beyond the
/// tolerance of its predecessor and is not a stationary continuation of it.
pub fn filter(route: &Route, options: &FilterOptions, ctx: &RunContext) -> Result<Route> {
    let started = ctx.start_stage(Stage::Filter);
    let mut kept: Vec<TrackPoint> = Vec::with_capacity(route.len());
    let mut invalid = 0usize;

    for point in route.points() {
        if !is_usable(point, options) {
            invalid += 1;
            continue;
        }
        match kept.last() {
            Some(anchor) if !has_moved(anchor, point, options) => {}
            _ => kept.push(point.clone()),
        }
    }

    if kept.len() < 2 {
        return Err(Error::InsufficientData {
            required: 2,
            actual: kept.len(),
        });
    }

    let dropped = route.len() - kept.len();
    let mut filtered = route.derive(kept);
    if invalid > 0 {
        ctx.debug(Stage::Filter, format_args!("{invalid} points with invalid coordinates removed"));
    }
    if dropped as f64 > route.len() as f64 * DROP_WARNING_RATIO {
        let message = format!(
            "{dropped} of {} points ({:.1}%) removed, {invalid} of them invalid",
            route.len(),
            dropped as f64 * 100.0 / route.len() as f64
        );
        ctx.warn(Stage::Filter, &message);
        filtered.diagnostics.push(Diagnostic::route(Stage::Filter, message));
    }

    ctx.finish_stage(Stage::Filter, started, filtered.len());
    Ok(filtered)
}
