//! Map matching: snaps filtered points onto the road network
//!
//! Sequence length is preserved: unmatched points keep their raw position
//! and are flagged `matched = false`. A batch that keeps failing after its
//! retries degrades to unmatched points unless the run is strict.
//!
//! Matched points also carry the routed speed of their leg (`speed_osrm`)
//! and a distance-weighted average of it over a sliding window
//! (`speed_osrm_filtered`).

use crate::core::batch::{balanced_ranges, run_batches, CallPolicy};
use crate::core::config::MatchOptions;
use crate::core::context::RunContext;
use crate::core::model::{ColumnType, Diagnostic, Route, Stage, TrackPoint, Value};
use crate::core::retry::with_retry;
use crate::services::{MatchBatch, MatchedPoint, MatchingService};
use crate::{Error, Result, Service};

pub const MATCHED_COLUMN: &str = "matched";
pub const MATCH_DISTANCE_COLUMN: &str = "match_distance";
pub const MATCH_CONFIDENCE_COLUMN: &str = "match_confidence";
pub const SPEED_OSRM_COLUMN: &str = "speed_osrm";
pub const SPEED_OSRM_FILTERED_COLUMN: &str = "speed_osrm_filtered";
pub const ORIGINAL_LATITUDE_COLUMN: &str = "original_latitude";
pub const ORIGINAL_LONGITUDE_COLUMN: &str = "original_longitude";

/// OSRM needs at least two coordinates per request
const MIN_BATCH_LEN: usize = 2;

/// Columns added by the matcher, in output order
pub fn match_columns(options: &MatchOptions) -> Vec<(&'static str, ColumnType)> {
    let mut columns = vec![
        (MATCHED_COLUMN, ColumnType::Flag),
        (MATCH_DISTANCE_COLUMN, ColumnType::Number),
        (MATCH_CONFIDENCE_COLUMN, ColumnType::Number),
        (SPEED_OSRM_COLUMN, ColumnType::Number),
        (SPEED_OSRM_FILTERED_COLUMN, ColumnType::Number),
    ];
    if options.keep_original_position {
        columns.push((ORIGINAL_LATITUDE_COLUMN, ColumnType::Number));
        columns.push((ORIGINAL_LONGITUDE_COLUMN, ColumnType::Number));
    }
    columns
}

fn annotate(point: &TrackPoint, matched: Option<&MatchedPoint>, options: &MatchOptions) -> TrackPoint {
    let mut out = point.clone();
    if options.keep_original_position {
        out.attributes
            .insert(ORIGINAL_LATITUDE_COLUMN.to_string(), Value::Number(point.latitude));
        out.attributes
            .insert(ORIGINAL_LONGITUDE_COLUMN.to_string(), Value::Number(point.longitude));
    }
    match matched {
        Some(m) => {
            out.latitude = m.position.latitude;
            out.longitude = m.position.longitude;
            out.attributes.insert(MATCHED_COLUMN.to_string(), Value::Bool(true));
            out.attributes
                .insert(MATCH_DISTANCE_COLUMN.to_string(), Value::Number(m.distance_m));
            out.attributes
                .insert(MATCH_CONFIDENCE_COLUMN.to_string(), Value::Number(m.confidence));
            out.attributes
                .insert(SPEED_OSRM_COLUMN.to_string(), m.speed_mps.into());
        }
        None => {
            out.attributes.insert(MATCHED_COLUMN.to_string(), Value::Bool(false));
            out.attributes.insert(MATCH_DISTANCE_COLUMN.to_string(), Value::Null);
            out.attributes.insert(MATCH_CONFIDENCE_COLUMN.to_string(), Value::Null);
            out.attributes.insert(SPEED_OSRM_COLUMN.to_string(), Value::Null);
        }
    }
    out
}

/// Distance-weighted mean speed around each point
///
/// The window of `window` metres is centred halfway between a point and the
/// next one, and also takes the first point past its far end. Each speed is
/// weighted by the distance travelled to reach its point. The last point and
/// points whose window carries no weight keep their own speed.
fn smooth_speeds(distances: &[f64], speeds: &[Option<f64>], window: f64) -> Vec<Option<f64>> {
    let n = speeds.len();
    (0..n)
        .map(|i| {
            if i + 1 >= n {
                return speeds[i];
            }
            let centre = (distances[i] + distances[i + 1]) / 2.0;
            let start = distances.partition_point(|&d| d < centre - window / 2.0);
            let end = distances.partition_point(|&d| d <= centre + window / 2.0);
            if start >= end {
                return speeds[i];
            }

            let (mut weighted, mut total) = (0.0, 0.0);
            for j in start..(end + 1).min(n) {
                let Some(speed) = speeds[j] else { continue };
                let step = if j == 0 { 0.0 } else { distances[j] - distances[j - 1] };
                weighted += speed * step;
                total += step;
            }
            if total > 0.0 {
                Some(weighted / total)
            } else {
                speeds[i]
            }
        })
        .collect()
}

/// Snap every point of `route` through `service`
pub async fn match_route<S: MatchingService>(
    route: &Route,
    service: &S,
    options: &MatchOptions,
    calls: &CallPolicy,
    ctx: &RunContext,
) -> Result<Route> {
    let started = ctx.start_stage(Stage::Match);
    let coordinates = route.coordinates();
    let ranges = balanced_ranges(coordinates.len(), options.batch_size, MIN_BATCH_LEN);
    ctx.debug(
        Stage::Match,
        format_args!("{} points in {} batches", coordinates.len(), ranges.len()),
    );

    let batches = run_batches(ranges, calls.parallelism, Stage::Match, ctx, |range| {
        let slice = &coordinates[range];
        async move {
            let batch: MatchBatch = with_retry(&calls.retry, Service::Matching, Stage::Match, ctx, || {
                service.match_batch(slice)
            })
            .await?;
            if batch.points.len() != slice.len() {
                return Err(Error::ServiceRejected {
                    service: Service::Matching,
                    message: format!(
                        "{} results returned for {} coordinates",
                        batch.points.len(),
                        slice.len()
                    ),
                });
            }
            Ok(batch)
        }
    })
    .await;

    let mut diagnostics = Vec::new();
    let mut points = Vec::with_capacity(route.len());
    let mut matched_count = 0usize;

    for batch in batches {
        let range = batch.range;
        let source = &route.points()[range.clone()];
        match batch.result {
            Ok(result) => {
                if result.sub_matchings > 1 {
                    let message = format!(
                        "points {}..{} were split into {} separate matchings",
                        range.start, range.end, result.sub_matchings
                    );
                    if ctx.strict {
                        return Err(Error::MapMatch(message));
                    }
                    ctx.warn(Stage::Match, &message);
                    diagnostics.push(Diagnostic::point(Stage::Match, range.start, message));
                }

                let low = result
                    .points
                    .iter()
                    .flatten()
                    .map(|m| m.confidence)
                    .fold(f64::INFINITY, f64::min);
                if low < options.min_confidence {
                    let message = format!(
                        "points {}..{} matched with confidence {low:.2} below {:.2}",
                        range.start, range.end, options.min_confidence
                    );
                    if ctx.strict {
                        return Err(Error::MapMatch(message));
                    }
                    ctx.warn(Stage::Match, &message);
                    diagnostics.push(Diagnostic::point(Stage::Match, range.start, message));
                }

                for (point, matched) in source.iter().zip(&result.points) {
                    matched_count += usize::from(matched.is_some());
                    points.push(annotate(point, matched.as_ref(), options));
                }
            }
            Err(e) => {
                if ctx.strict {
                    return Err(Error::MapMatch(format!(
                        "points {}..{}: {e}",
                        range.start, range.end
                    )));
                }
                let message = format!(
                    "points {}..{} left unmatched: {e}",
                    range.start, range.end
                );
                ctx.warn(Stage::Match, &message);
                diagnostics.push(Diagnostic::point(Stage::Match, range.start, message));
                points.extend(source.iter().map(|p| annotate(p, None, options)));
            }
        }
    }

    let distances = route.derive(points.clone()).cumulative_distances();
    let speeds: Vec<Option<f64>> = points
        .iter()
        .map(|p| p.value(SPEED_OSRM_COLUMN).as_f64())
        .collect();
    for (point, smoothed) in points.iter_mut().zip(smooth_speeds(&distances, &speeds, options.speed_window_m)) {
        point
            .attributes
            .insert(SPEED_OSRM_FILTERED_COLUMN.to_string(), smoothed.into());
    }

    let mut matched = route.derive(points);
    matched.diagnostics.extend(diagnostics);
    for (name, kind) in match_columns(options) {
        matched.declare_column(name, kind);
    }

    ctx.info(
        Stage::Match,
        format_args!("{matched_count} of {} points matched", matched.len()),
    );
    ctx.finish_stage(Stage::Match, started, matched.len());
    Ok(matched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::Coordinate;
    use crate::core::retry::RetryPolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Shifts every point slightly east; fails the batches listed in `failing`
    struct FakeMatcher {
        failing: Vec<usize>,
        split: bool,
        calls: AtomicUsize,
    }

    impl FakeMatcher {
        fn new() -> Self {
            Self {
                failing: Vec::new(),
                split: false,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl MatchingService for FakeMatcher {
        async fn match_batch(&self, coordinates: &[Coordinate]) -> Result<MatchBatch> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let first_lat = coordinates[0].latitude;
            if self.failing.iter().any(|&i| (first_lat - 50.0 - i as f64 * 0.002).abs() < 1e-9) {
                return Err(Error::ServiceUnavailable {
                    service: Service::Matching,
                    message: "down".to_string(),
                });
            }
            Ok(MatchBatch {
                points: coordinates
                    .iter()
                    .enumerate()
                    .map(|(i, c)| {
                        (i != 1).then(|| MatchedPoint {
                            position: Coordinate::new(c.latitude, c.longitude + 0.00001),
                            distance_m: 0.7,
                            confidence: 0.9,
                            speed_mps: Some(10.0 + i as f64),
                        })
                    })
                    .collect(),
                sub_matchings: if self.split { 2 } else { 1 },
            })
        }
    }

    fn route(n: usize) -> Route {
        let points = (0..n)
            .map(|i| TrackPoint::new(50.0 + i as f64 * 0.001, 4.0))
            .collect();
        Route::new("r", points).unwrap()
    }

    fn calls() -> CallPolicy {
        CallPolicy {
            parallelism: 2,
            retry: RetryPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(1),
                timeout: Duration::from_secs(5),
            },
        }
    }

    fn options() -> MatchOptions {
        MatchOptions {
            batch_size: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_length_preserved_and_flags_set() {
        let input = route(5);
        let out = match_route(&input, &FakeMatcher::new(), &options(), &calls(), &RunContext::new("t"))
            .await
            .unwrap();

        assert_eq!(out.len(), input.len());
        let flags: Vec<Value> = out.points().iter().map(|p| p.value(MATCHED_COLUMN)).collect();
        // batches 0..2, 2..5: second point of each batch is unmatched
        assert_eq!(
            flags,
            vec![
                Value::Bool(true),
                Value::Bool(false),
                Value::Bool(true),
                Value::Bool(false),
                Value::Bool(true)
            ]
        );
        assert_eq!(out.points()[1].longitude, 4.0);
        assert!((out.points()[0].longitude - 4.00001).abs() < 1e-12);
        assert_eq!(out.points()[0].value(MATCH_DISTANCE_COLUMN), Value::Number(0.7));
        assert!(out.declared_columns.iter().any(|(n, _)| n == MATCH_CONFIDENCE_COLUMN));
        assert!(out.diagnostics.is_empty());
    }

    #[tokio::test]
    async fn test_failed_batch_degrades() {
        let service = FakeMatcher {
            failing: vec![1], // batch starting at point 2
            ..FakeMatcher::new()
        };
        let out = match_route(&route(4), &service, &options(), &calls(), &RunContext::new("t"))
            .await
            .unwrap();

        assert_eq!(out.len(), 4);
        assert_eq!(out.points()[2].value(MATCHED_COLUMN), Value::Bool(false));
        assert_eq!(out.points()[3].value(MATCHED_COLUMN), Value::Bool(false));
        assert_eq!(out.diagnostics.len(), 1);
        // first attempt + one retry for the failing batch, one call for the other
        assert_eq!(service.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_batch_is_fatal_when_strict() {
        let service = FakeMatcher {
            failing: vec![0],
            ..FakeMatcher::new()
        };
        let ctx = RunContext::new("t").with_strict(true);
        let err = match_route(&route(4), &service, &options(), &calls(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MapMatch(_)));
    }

    #[tokio::test]
    async fn test_split_matching_warns() {
        let service = FakeMatcher {
            split: true,
            ..FakeMatcher::new()
        };
        let out = match_route(&route(2), &service, &options(), &calls(), &RunContext::new("t"))
            .await
            .unwrap();
        assert_eq!(out.diagnostics.len(), 1);
        assert!(out.diagnostics[0].message.contains("2 separate matchings"));
    }

    #[test]
    fn test_smooth_speeds() {
        let distances = [0.0, 50.0, 100.0, 150.0];
        let speeds = [Some(10.0), Some(20.0), Some(20.0), Some(10.0)];
        let smoothed = smooth_speeds(&distances, &speeds, 100.0);
        assert_eq!(smoothed[0], Some(20.0));
        assert!((smoothed[1].unwrap() - 50.0 / 3.0).abs() < 1e-9);
        assert_eq!(smoothed[2], Some(15.0));
        assert_eq!(smoothed[3], Some(10.0));

        // unmatched points carry no weight
        let gaps = [Some(10.0), None, Some(20.0), Some(10.0)];
        assert_eq!(smooth_speeds(&distances, &gaps, 100.0)[0], Some(20.0));
        assert_eq!(smooth_speeds(&distances, &[None, None, None, None], 100.0), vec![None; 4]);
    }

    #[tokio::test]
    async fn test_routed_speed_columns() {
        let out = match_route(&route(4), &FakeMatcher::new(), &options(), &calls(), &RunContext::new("t"))
            .await
            .unwrap();
        let raw: Vec<Value> = out.points().iter().map(|p| p.value(SPEED_OSRM_COLUMN)).collect();
        assert_eq!(raw, vec![Value::Number(10.0), Value::Null, Value::Number(10.0), Value::Null]);
        let filtered = out.points()[0].value(SPEED_OSRM_FILTERED_COLUMN).as_f64().unwrap();
        assert_eq!(filtered, 10.0);
        assert!(out.declared_columns.iter().any(|(n, _)| n == SPEED_OSRM_FILTERED_COLUMN));
    }

    #[tokio::test]
    async fn test_original_position_kept() {
        let options = MatchOptions {
            keep_original_position: true,
            ..options()
        };
        let out = match_route(&route(2), &FakeMatcher::new(), &options, &calls(), &RunContext::new("t"))
            .await
            .unwrap();
        assert_eq!(out.points()[0].value(ORIGINAL_LONGITUDE_COLUMN), Value::Number(4.0));
    }
}
