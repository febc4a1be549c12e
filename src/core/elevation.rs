//! Terrain elevation from a bulk lookup service

use crate::core::batch::{batch_ranges, run_batches, CallPolicy};
use crate::core::config::ElevationOptions;
use crate::core::context::RunContext;
use crate::core::model::{Diagnostic, Route, Stage};
use crate::core::retry::with_retry;
use crate::services::ElevationService;
use crate::{Error, Result, Service};

/// Replace each point's elevation with the service's terrain elevation
///
/// Elevations are correlated to points by position within the batch. A
/// missing value, or a batch that keeps failing, leaves that elevation null
/// without failing the route (strict runs fail instead).
pub async fn enrich_elevation<S: ElevationService>(
    route: &Route,
    service: &S,
    options: &ElevationOptions,
    calls: &CallPolicy,
    ctx: &RunContext,
) -> Result<Route> {
    let started = ctx.start_stage(Stage::Elevation);
    let coordinates = route.coordinates();

    let batches = run_batches(
        batch_ranges(coordinates.len(), options.batch_size),
        calls.parallelism,
        Stage::Elevation,
        ctx,
        |range| {
            let slice = &coordinates[range];
            async move {
                let elevations = with_retry(&calls.retry, Service::Elevation, Stage::Elevation, ctx, || {
                    service.lookup(slice)
                })
                .await?;
                if elevations.len() != slice.len() {
                    return Err(Error::ServiceRejected {
                        service: Service::Elevation,
                        message: format!("{} elevations for {} locations", elevations.len(), slice.len()),
                    });
                }
                Ok(elevations)
            }
        },
    )
    .await;

    let mut points = route.points().to_vec();
    let mut diagnostics = Vec::new();
    let mut missing = 0usize;

    for batch in batches {
        match batch.result {
            Ok(elevations) => {
                for (offset, elevation) in elevations.into_iter().enumerate() {
                    missing += usize::from(elevation.is_none());
                    points[batch.range.start + offset].elevation = elevation;
                }
            }
            Err(e) if ctx.strict => return Err(e),
            Err(e) => {
                let message = format!(
                    "points {}..{} have no elevation: {e}",
                    batch.range.start, batch.range.end
                );
                ctx.warn(Stage::Elevation, &message);
                diagnostics.push(Diagnostic::point(Stage::Elevation, batch.range.start, message));
                for point in &mut points[batch.range.clone()] {
                    point.elevation = None;
                }
                missing += batch.range.len();
            }
        }
    }

    if missing > 0 {
        ctx.info(
            Stage::Elevation,
            format_args!("{missing} of {} points without elevation", points.len()),
        );
    }

    let mut enriched = route.derive(points);
    enriched.diagnostics.extend(diagnostics);
    ctx.finish_stage(Stage::Elevation, started, enriched.len());
    Ok(enriched)
}
