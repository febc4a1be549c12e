//! Stage orchestration
//!
//! raw points -> filter -> match -> {metadata, elevation} -> segmentation.
//! Metadata and elevation only depend on the matched route, so they run
//! concurrently and are merged back by point index.

use std::collections::BTreeSet;

use crate::core::batch::CallPolicy;
use crate::core::config::Config;
use crate::core::context::RunContext;
use crate::core::elevation::enrich_elevation;
use crate::core::filter::filter;
use crate::core::matcher::{match_columns, match_route};
use crate::core::metadata::{enrich_metadata, reserved_columns, EnrichOptions};
use crate::core::model::{Coordinate, Diagnostic, Route, Stage, BASE_COLUMNS};
use crate::core::segment::{segment, SegmentationConfig, Segmented};
use crate::core::table::Table;
use crate::services::{ElevationService, GeodataService, MatchingService, OpenElevationClient, OsrmClient, OverpassClient};
use crate::{Error, Result};

/// Everything a run produced
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    route: Route,
    standardized: Table,
    segmented: Option<Segmented>,
}

impl PipelineOutput {
    /// Enriched route before segmentation
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Point geometry after filtering and matching
    pub fn points(&self) -> Vec<Coordinate> {
        self.route.coordinates()
    }

    /// One row per retained point, fixed column order
    pub fn standardized(&self) -> &Table {
        &self.standardized
    }

    /// Resampled output, `None` when segmentation was disabled
    pub fn segmented(&self) -> Option<&Segmented> {
        self.segmented.as_ref()
    }

    /// The final table: segmented if available, otherwise standardized
    pub fn table(&self) -> Result<Table> {
        match &self.segmented {
            Some(segmented) => segmented.to_table(),
            None => Ok(self.standardized.clone()),
        }
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        match &self.segmented {
            Some(segmented) => &segmented.diagnostics,
            None => &self.route.diagnostics,
        }
    }
}

/// Configured pipeline bound to its three services
pub struct Pipeline<M, E, G> {
    config: Config,
    enrichers: EnrichOptions,
    segmentation: Option<SegmentationConfig>,
    matching: M,
    elevation: E,
    geodata: G,
}

impl Pipeline<OsrmClient, OpenElevationClient, OverpassClient> {
    /// Pipeline talking to the HTTP services named in the configuration
    pub fn from_config(config: Config, enrichers: EnrichOptions) -> Result<Self> {
        let matching = OsrmClient::new(&config.services)?;
        let elevation = OpenElevationClient::new(&config.services)?;
        let geodata = OverpassClient::new(&config.services)?;
        Self::new(config, enrichers, matching, elevation, geodata)
    }
}

impl<M, E, G> Pipeline<M, E, G>
where
    M: MatchingService,
    E: ElevationService,
    G: GeodataService,
{
    /// Validate the configuration and bind the services
    pub fn new(config: Config, enrichers: EnrichOptions, matching: M, elevation: E, geodata: G) -> Result<Self> {
        config.validate()?;
        let match_names: Vec<&str> = match_columns(&config.matching).into_iter().map(|(n, _)| n).collect();
        enrichers.validate(&reserved_columns(&match_names))?;
        let segmentation = if config.stages.segmentation {
            Some(config.segmentation_config()?)
        } else {
            None
        };
        Ok(Self {
            config,
            enrichers,
            segmentation,
            matching,
            elevation,
            geodata,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn call_policy(&self) -> CallPolicy {
        CallPolicy {
            parallelism: self.config.network.parallelism,
            retry: self.config.retry_policy(),
        }
    }

    /// Columns the enriched route can have, given the input route's attributes
    pub fn predicted_columns(&self, route: &Route) -> Vec<String> {
        let mut columns: Vec<String> = BASE_COLUMNS.iter().map(|s| s.to_string()).collect();
        let mut push = |name: &str| {
            if !columns.iter().any(|c| c == name) {
                columns.push(name.to_string());
            }
        };
        for point in route.points() {
            for name in point.attributes.keys() {
                push(name);
            }
        }
        if self.config.stages.matching {
            for (name, _) in match_columns(&self.config.matching) {
                push(name);
            }
        }
        if self.config.stages.metadata {
            for (name, _) in self.enrichers.declared_columns() {
                push(&name);
            }
        }
        columns
    }

    /// Setup checks that depend on the input route
    fn check_route(&self, route: &Route) -> Result<()> {
        let predicted = self.predicted_columns(route);
        if let Some(segmentation) = &self.segmentation {
            segmentation.check_columns(&predicted)?;
        }
        if self.config.stages.metadata {
            let own: BTreeSet<&String> = route.points().iter().flat_map(|p| p.attributes.keys()).collect();
            if let Some((name, _)) = self
                .enrichers
                .declared_columns()
                .into_iter()
                .find(|(name, _)| own.contains(name))
            {
                return Err(Error::Configuration(format!(
                    "input already has a '{name}' column, which metadata enrichment would overwrite"
                )));
            }
        }
        Ok(())
    }

    /// Run every enabled stage over `route`
    pub async fn run(&self, route: &Route, ctx: &RunContext) -> Result<PipelineOutput> {
        self.check_route(route)?;
        ctx.info(
            Stage::Filter,
            format_args!("processing route '{}' with {} points", route.id, route.len()),
        );
        let calls = self.call_policy();

        let filtered = filter(route, &self.config.filter, ctx)?;
        let matched = if self.config.stages.matching {
            match_route(&filtered, &self.matching, &self.config.matching, &calls, ctx).await?
        } else {
            filtered
        };

        let metadata = async {
            if self.config.stages.metadata {
                let retry = calls.retry;
                enrich_metadata(&matched, &self.geodata, &self.config.metadata, &self.enrichers, &retry, ctx)
                    .await
                    .map(Some)
            } else {
                Ok(None)
            }
        };
        let elevation = async {
            if self.config.stages.elevation {
                enrich_elevation(&matched, &self.elevation, &self.config.elevation, &calls, ctx)
                    .await
                    .map(Some)
            } else {
                Ok(None)
            }
        };
        let (metadata, elevation) = tokio::try_join!(metadata, elevation)?;
        let enriched = merge(&matched, metadata, elevation)?;

        let standardized = Table::from_route(&enriched)?;
        let segmented = match &self.segmentation {
            Some(config) => {
                let (config, dropped) = prune_policies(config, &standardized);
                let mut input = enriched.clone();
                for column in dropped {
                    let message = format!("no value was produced for '{column}', its policy is ignored");
                    ctx.warn(Stage::Segmentation, &message);
                    input.diagnostics.push(Diagnostic::route(Stage::Segmentation, message));
                }
                Some(segment(&input, &config, ctx)?)
            }
            None => None,
        };

        Ok(PipelineOutput {
            route: enriched,
            standardized,
            segmented,
        })
    }
}

/// Drop policies for columns the run ended up not producing
fn prune_policies(config: &SegmentationConfig, table: &Table) -> (SegmentationConfig, Vec<String>) {
    let mut pruned = config.clone();
    let dropped: Vec<String> = config
        .policies
        .keys()
        .filter(|name| table.column_index(name).is_none())
        .cloned()
        .collect();
    for name in &dropped {
        pruned.policies.remove(name);
    }
    (pruned, dropped)
}

/// Combine the outputs of the independent enrichment stages by point index
fn merge(base: &Route, metadata: Option<Route>, elevation: Option<Route>) -> Result<Route> {
    let mut merged = base.clone();
    let known = base.diagnostics.len();

    for stage_output in [&metadata, &elevation].into_iter().flatten() {
        if stage_output.len() != base.len() {
            return Err(Error::SchemaMismatch {
                column: String::new(),
                message: format!(
                    "enrichment returned {} points for {}",
                    stage_output.len(),
                    base.len()
                ),
            });
        }
        merged
            .diagnostics
            .extend(stage_output.diagnostics.iter().skip(known).cloned());
    }

    let mut points = merged.points().to_vec();
    if let Some(metadata) = &metadata {
        for (point, source) in points.iter_mut().zip(metadata.points()) {
            for (name, value) in &source.attributes {
                point.attributes.entry(name.clone()).or_insert_with(|| value.clone());
            }
        }
        for (name, kind) in &metadata.declared_columns {
            if metadata.event_columns.contains(name) {
                merged.declare_event_column(name, *kind);
            } else {
                merged.declare_column(name, *kind);
            }
            if metadata.categorical_columns.contains(name) {
                merged.mark_categorical(name);
            }
        }
    }
    if let Some(elevation) = &elevation {
        for (point, source) in points.iter_mut().zip(elevation.points()) {
            point.elevation = source.elevation;
        }
    }

    Ok(merged.derive(points))
}
