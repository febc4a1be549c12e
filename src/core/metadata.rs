//! Metadata enrichment: nearest way and node tags plus user column enrichers
//!
//! The geodata service is queried once for the padded bounding box of the
//! whole route. Ways and nodes are indexed in an R-tree over a local metric
//! projection, so each point resolves its nearest way and node in
//! logarithmic time.

use std::collections::BTreeSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use rstar::primitives::GeomWithData;
use rstar::{PointDistance, RTree, RTreeObject, AABB};

use crate::core::config::MetadataOptions;
use crate::core::context::RunContext;
use crate::core::geo::{BoundingBox, LocalProjection};
use crate::core::junction::{classify, find_junctions, Junction, INTERSECTION_COLUMN};
use crate::core::model::{ColumnMap, ColumnType, Diagnostic, Route, Stage, TagMap, Value, BASE_COLUMNS};
use crate::core::retry::{with_retry, RetryPolicy};
use crate::services::{GeodataExtract, GeodataService};
use crate::{Error, Result, Service};

pub const WAY_ID_COLUMN: &str = "way_id";
pub const WAY_TAGS_COLUMN: &str = "way_tags";
pub const NODE_ID_COLUMN: &str = "node_id";
pub const NODE_TAGS_COLUMN: &str = "node_tags";

/// Tag keys whose values are numbers (with an optional unit)
const NUMERIC_TAGS: [&str; 4] = ["maxspeed", "lanes", "width", "layer"];

const KMH_PER_MPH: f64 = 1.609_344;

/// Typed column enrichment from a tag mapping
///
/// Implementations must be pure and total: the same tags always give the
/// same columns, and failure is reported through `Err`, not by panicking.
/// `schema` lists every column `enrich` may return; it is validated once
/// when the run is set up.
pub trait ColumnEnricher: Send + Sync {
    fn schema(&self) -> Vec<(String, ColumnType)>;

    fn enrich(&self, tags: &TagMap) -> std::result::Result<ColumnMap, String>;
}

/// Enricher backed by a closure
pub struct FnEnricher<F> {
    schema: Vec<(String, ColumnType)>,
    function: F,
}

impl<F> FnEnricher<F>
where
    F: Fn(&TagMap) -> std::result::Result<ColumnMap, String> + Send + Sync,
{
    pub fn new(schema: Vec<(&str, ColumnType)>, function: F) -> Self {
        Self {
            schema: schema.into_iter().map(|(n, k)| (n.to_string(), k)).collect(),
            function,
        }
    }
}

impl<F> ColumnEnricher for FnEnricher<F>
where
    F: Fn(&TagMap) -> std::result::Result<ColumnMap, String> + Send + Sync,
{
    fn schema(&self) -> Vec<(String, ColumnType)> {
        self.schema.clone()
    }

    fn enrich(&self, tags: &TagMap) -> std::result::Result<ColumnMap, String> {
        (self.function)(tags)
    }
}

/// Copies selected tag keys into `<prefix>_<key>` columns
///
/// Keys such as `maxspeed` or `lanes` become numbers (`"30 mph"` is
/// converted to km/h); everything else is kept as text.
#[derive(Debug, Clone, PartialEq)]
pub struct TagSelector {
    prefix: String,
    keys: Vec<String>,
}

impl TagSelector {
    pub fn new(prefix: &str, keys: &[String]) -> Self {
        Self {
            prefix: prefix.to_string(),
            keys: keys.to_vec(),
        }
    }

    fn column(&self, key: &str) -> String {
        format!("{}_{}", self.prefix, key.replace(':', "_"))
    }
}

fn parse_numeric_tag(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let end = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
        .unwrap_or(raw.len());
    let number: f64 = raw[..end].parse().ok()?;
    if raw[end..].trim().eq_ignore_ascii_case("mph") {
        Some(number * KMH_PER_MPH)
    } else {
        Some(number)
    }
}

impl ColumnEnricher for TagSelector {
    fn schema(&self) -> Vec<(String, ColumnType)> {
        self.keys
            .iter()
            .map(|key| {
                let kind = if NUMERIC_TAGS.contains(&key.as_str()) {
                    ColumnType::Number
                } else {
                    ColumnType::Text
                };
                (self.column(key), kind)
            })
            .collect()
    }

    fn enrich(&self, tags: &TagMap) -> std::result::Result<ColumnMap, String> {
        let mut columns = ColumnMap::new();
        for key in &self.keys {
            let Some(raw) = tags.get(key) else { continue };
            let value = if NUMERIC_TAGS.contains(&key.as_str()) {
                parse_numeric_tag(raw).map(Value::Number).unwrap_or(Value::Null)
            } else {
                Value::Text(raw.clone())
            };
            columns.insert(self.column(key), value);
        }
        Ok(columns)
    }
}

/// Optional per-point enrichment of way and node tags
#[derive(Clone, Default)]
pub struct EnrichOptions {
    pub way_enrichment: Option<Arc<dyn ColumnEnricher>>,
    pub node_enrichment: Option<Arc<dyn ColumnEnricher>>,
}

impl fmt::Debug for EnrichOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnrichOptions")
            .field("way_enrichment", &self.way_enrichment.as_ref().map(|e| e.schema()))
            .field("node_enrichment", &self.node_enrichment.as_ref().map(|e| e.schema()))
            .finish()
    }
}

impl EnrichOptions {
    /// Enrichers built from tag key lists in the configuration
    pub fn from_config(options: &MetadataOptions) -> Self {
        let selector = |prefix: &str, keys: &Vec<String>| -> Option<Arc<dyn ColumnEnricher>> {
            (!keys.is_empty()).then(|| Arc::new(TagSelector::new(prefix, keys)) as Arc<dyn ColumnEnricher>)
        };
        Self {
            way_enrichment: selector("way", &options.way_columns),
            node_enrichment: selector("node", &options.node_columns),
        }
    }

    /// Check declared enricher columns against `reserved` and each other
    pub fn validate(&self, reserved: &[String]) -> Result<()> {
        let mut seen: BTreeSet<String> = reserved.iter().cloned().collect();
        for (label, enricher) in [("way", &self.way_enrichment), ("node", &self.node_enrichment)] {
            let Some(enricher) = enricher else { continue };
            for (name, _) in enricher.schema() {
                if name.trim().is_empty() {
                    return Err(Error::Configuration(format!(
                        "{label} enrichment declares an empty column name"
                    )));
                }
                if !seen.insert(name.clone()) {
                    return Err(Error::Configuration(format!(
                        "{label} enrichment column '{name}' collides with an existing column"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Every column enrichment may add, in output order
    pub fn declared_columns(&self) -> Vec<(String, ColumnType)> {
        let mut columns = vec![
            (WAY_ID_COLUMN.to_string(), ColumnType::Number),
            (WAY_TAGS_COLUMN.to_string(), ColumnType::Tags),
            (NODE_ID_COLUMN.to_string(), ColumnType::Number),
            (NODE_TAGS_COLUMN.to_string(), ColumnType::Tags),
            (INTERSECTION_COLUMN.to_string(), ColumnType::Text),
        ];
        for enricher in [&self.way_enrichment, &self.node_enrichment].into_iter().flatten() {
            columns.extend(enricher.schema());
        }
        columns
    }
}

/// Columns reserved by the base model and the metadata stage itself
pub fn reserved_columns(extra: &[&str]) -> Vec<String> {
    BASE_COLUMNS
        .iter()
        .chain([WAY_ID_COLUMN, WAY_TAGS_COLUMN, NODE_ID_COLUMN, NODE_TAGS_COLUMN, INTERSECTION_COLUMN].iter())
        .chain(extra.iter())
        .map(|s| s.to_string())
        .collect()
}

/// One straight piece of a way, in projected metres
#[derive(Debug, Clone, Copy, PartialEq)]
struct WaySegment {
    from: [f64; 2],
    to: [f64; 2],
    way: usize,
}

impl RTreeObject for WaySegment {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(self.from, self.to)
    }
}

impl PointDistance for WaySegment {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let [ax, ay] = self.from;
        let [bx, by] = self.to;
        let (dx, dy) = (bx - ax, by - ay);
        let len_2 = dx * dx + dy * dy;
        let t = if len_2 > 0.0 {
            (((point[0] - ax) * dx + (point[1] - ay) * dy) / len_2).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let (px, py) = (ax + t * dx - point[0], ay + t * dy - point[1]);
        px * px + py * py
    }
}

/// Nearest-feature lookup over one geodata extract
struct FeatureIndex {
    projection: LocalProjection,
    ways: RTree<WaySegment>,
    nodes: RTree<GeomWithData<[f64; 2], usize>>,
    junctions: RTree<GeomWithData<[f64; 2], usize>>,
}

impl FeatureIndex {
    fn build(extract: &GeodataExtract, junctions: &[Junction], projection: LocalProjection) -> Self {
        let mut segments = Vec::new();
        for (way, w) in extract.ways.iter().enumerate() {
            let projected: Vec<[f64; 2]> = w.geometry.iter().map(|c| projection.project(*c)).collect();
            if projected.len() == 1 {
                segments.push(WaySegment {
                    from: projected[0],
                    to: projected[0],
                    way,
                });
            }
            for pair in projected.windows(2) {
                segments.push(WaySegment {
                    from: pair[0],
                    to: pair[1],
                    way,
                });
            }
        }
        let nodes = extract
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| GeomWithData::new(projection.project(n.position), i))
            .collect();
        let junctions = junctions
            .iter()
            .enumerate()
            .map(|(i, j)| GeomWithData::new(projection.project(j.position), i))
            .collect();

        Self {
            projection,
            ways: RTree::bulk_load(segments),
            nodes: RTree::bulk_load(nodes),
            junctions: RTree::bulk_load(junctions),
        }
    }

    fn nearest_way(&self, point: [f64; 2], max_distance: f64) -> Option<usize> {
        self.ways
            .nearest_neighbor(&point)
            .filter(|s| s.distance_2(&point) <= max_distance * max_distance)
            .map(|s| s.way)
    }

    fn nearest_node(&self, point: [f64; 2], max_distance: f64) -> Option<usize> {
        self.nodes
            .nearest_neighbor(&point)
            .filter(|n| n.distance_2(&point) <= max_distance * max_distance)
            .map(|n| n.data)
    }

    fn nearest_junction(&self, point: [f64; 2], max_distance: f64) -> Option<usize> {
        self.junctions
            .nearest_neighbor(&point)
            .filter(|j| j.distance_2(&point) <= max_distance * max_distance)
            .map(|j| j.data)
    }
}

/// Run one enricher for one point, checking its output against the schema
fn run_enricher(
    enricher: &dyn ColumnEnricher,
    schema: &[(String, ColumnType)],
    tags: &TagMap,
) -> std::result::Result<ColumnMap, (String, String)> {
    let output = catch_unwind(AssertUnwindSafe(|| enricher.enrich(tags)));
    let columns = match output {
        Ok(Ok(columns)) => columns,
        Ok(Err(message)) => return Err((String::new(), message)),
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            return Err((String::new(), format!("enricher panicked: {reason}")));
        }
    };

    for (name, value) in &columns {
        match schema.iter().find(|(declared, _)| declared == name) {
            None => return Err((name.clone(), "column not declared in the enricher schema".to_string())),
            Some((_, kind)) => {
                if let Some(actual) = value.kind() {
                    if actual != *kind {
                        return Err((name.clone(), format!("declared as {kind} but returned {actual}")));
                    }
                }
            }
        }
    }
    Ok(columns)
}

/// Attach way/node tags and enricher columns to every point
pub async fn enrich_metadata<S: GeodataService>(
    route: &Route,
    service: &S,
    options: &MetadataOptions,
    enrichers: &EnrichOptions,
    retry: &RetryPolicy,
    ctx: &RunContext,
) -> Result<Route> {
    let started = ctx.start_stage(Stage::Metadata);
    let coordinates = route.coordinates();
    let padding = options.max_way_distance_m.max(options.max_node_distance_m);
    let Some(bbox) = BoundingBox::around(&coordinates, padding) else {
        return Ok(route.derive(Vec::new()));
    };

    ctx.report_progress(Stage::Metadata, 0, 1);
    let mut diagnostics = Vec::new();
    let extract = match with_retry(retry, Service::Geodata, Stage::Metadata, ctx, || service.query_bbox(bbox)).await {
        Ok(extract) => extract,
        Err(e) if ctx.strict => return Err(e),
        Err(e) => {
            let message = format!("geodata unavailable, way and node columns left empty: {e}");
            ctx.warn(Stage::Metadata, &message);
            diagnostics.push(Diagnostic::route(Stage::Metadata, message));
            GeodataExtract::default()
        }
    };
    ctx.report_progress(Stage::Metadata, 1, 1);
    ctx.debug(
        Stage::Metadata,
        format_args!("{} ways, {} nodes in bounding box", extract.ways.len(), extract.nodes.len()),
    );

    let junctions = find_junctions(&extract);
    let index = FeatureIndex::build(&extract, &junctions, LocalProjection::new(coordinates[0]));
    let way_schema = enrichers.way_enrichment.as_ref().map(|e| e.schema()).unwrap_or_default();
    let node_schema = enrichers.node_enrichment.as_ref().map(|e| e.schema()).unwrap_or_default();
    let mut produced: BTreeSet<String> = BTreeSet::new();
    let mut points = Vec::with_capacity(route.len());
    let mut junction_ways = Vec::with_capacity(route.len());
    let mut highways = Vec::with_capacity(route.len());

    for (i, point) in route.points().iter().enumerate() {
        let projected = index.projection.project(point.position());
        let mut out = point.clone();

        let way = index.nearest_way(projected, options.max_way_distance_m).map(|w| &extract.ways[w]);
        let node = index.nearest_node(projected, options.max_node_distance_m).map(|n| &extract.nodes[n]);
        let junction = index
            .nearest_junction(projected, options.max_node_distance_m)
            .map(|j| junctions[j].ways.iter().map(|&w| &extract.ways[w].tags).collect::<Vec<_>>());
        junction_ways.push(junction);
        highways.push(way.and_then(|w| w.tags.get("highway")).map(String::as_str));

        out.attributes.insert(
            WAY_ID_COLUMN.to_string(),
            way.map(|w| Value::Number(w.id as f64)).unwrap_or(Value::Null),
        );
        out.attributes.insert(
            WAY_TAGS_COLUMN.to_string(),
            way.map(|w| Value::Tags(w.tags.clone())).unwrap_or(Value::Null),
        );
        out.attributes.insert(
            NODE_ID_COLUMN.to_string(),
            node.map(|n| Value::Number(n.id as f64)).unwrap_or(Value::Null),
        );
        out.attributes.insert(
            NODE_TAGS_COLUMN.to_string(),
            node.map(|n| Value::Tags(n.tags.clone())).unwrap_or(Value::Null),
        );

        let calls = [
            ("way", &enrichers.way_enrichment, &way_schema, way.map(|w| &w.tags)),
            ("node", &enrichers.node_enrichment, &node_schema, node.map(|n| &n.tags)),
        ];
        for (label, enricher, schema, tags) in calls {
            let (Some(enricher), Some(tags)) = (enricher, tags) else { continue };
            match run_enricher(enricher.as_ref(), schema, tags) {
                Ok(columns) => {
                    for (name, value) in columns {
                        produced.insert(name.clone());
                        out.attributes.insert(name, value);
                    }
                }
                Err((column, message)) => {
                    if ctx.strict {
                        return Err(Error::SchemaMismatch { column, message });
                    }
                    let text = if column.is_empty() {
                        format!("{label} enrichment failed: {message}")
                    } else {
                        format!("{label} enrichment column '{column}': {message}")
                    };
                    ctx.debug(Stage::Metadata, format_args!("point {i}: {text}"));
                    diagnostics.push(Diagnostic::point(Stage::Metadata, i, text));
                }
            }
        }
        points.push(out);
    }

    for (point, label) in points.iter_mut().zip(classify(&junction_ways, &highways)) {
        let value = label.map(|l| Value::Text(l.to_string())).unwrap_or(Value::Null);
        point.attributes.insert(INTERSECTION_COLUMN.to_string(), value);
    }

    let failures = diagnostics.iter().filter(|d| d.index.is_some()).count();
    if failures > 0 {
        ctx.warn(
            Stage::Metadata,
            format_args!("enrichment failed for {failures} points, recorded as missing values"),
        );
    }

    let mut enriched = route.derive(points);
    enriched.diagnostics.extend(diagnostics);
    enriched.declare_column(WAY_ID_COLUMN, ColumnType::Number);
    enriched.declare_column(WAY_TAGS_COLUMN, ColumnType::Tags);
    enriched.declare_event_column(NODE_ID_COLUMN, ColumnType::Number);
    enriched.declare_event_column(NODE_TAGS_COLUMN, ColumnType::Tags);
    enriched.declare_event_column(INTERSECTION_COLUMN, ColumnType::Text);
    enriched.mark_categorical(WAY_ID_COLUMN);
    enriched.mark_categorical(NODE_ID_COLUMN);
    for (name, kind) in &way_schema {
        if produced.contains(name) {
            enriched.declare_column(name, *kind);
        }
    }
    for (name, kind) in &node_schema {
        if produced.contains(name) {
            enriched.declare_event_column(name, *kind);
        }
    }

    ctx.finish_stage(Stage::Metadata, started, enriched.len());
    Ok(enriched)
}
