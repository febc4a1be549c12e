//! Junction classification
//!
//! A junction is an OSM node shared by at least two road ways, or any node of
//! a roundabout. Each point near a junction gets a label describing the
//! crossing: roundabout, indistinct, or a transition between main and side
//! roads judged from the road class before and after the point.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::core::model::{Coordinate, TagMap};
use crate::services::GeodataExtract;

pub const INTERSECTION_COLUMN: &str = "intersection";

/// Road classes from most to least important
const HIGHWAY_PRIORITY: [&str; 14] = [
    "motorway",
    "motorway_link",
    "trunk",
    "trunk_link",
    "primary",
    "primary_link",
    "secondary",
    "secondary_link",
    "tertiary",
    "tertiary_link",
    "residential",
    "living_street",
    "service",
    "unclassified",
];

/// Rank of a road class, lower is more important; unknown classes rank last
fn priority(highway: Option<&str>) -> usize {
    highway
        .and_then(|h| HIGHWAY_PRIORITY.iter().position(|p| *p == h))
        .unwrap_or(HIGHWAY_PRIORITY.len() - 1)
}

fn is_road(tags: &TagMap) -> bool {
    tags.get("highway")
        .is_some_and(|h| HIGHWAY_PRIORITY.contains(&h.as_str()))
}

fn is_roundabout(tags: &TagMap) -> bool {
    tags.get("junction").is_some_and(|j| j == "roundabout")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JunctionKind {
    Roundabout,
    /// Several distinct roads of the same class, or no usable context
    Indistinct,
    MainToSide,
    SideToMain,
    MainToMain,
    SideToSide,
}

impl JunctionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JunctionKind::Roundabout => "roundabout",
            JunctionKind::Indistinct => "indistinct",
            JunctionKind::MainToSide => "main_to_side",
            JunctionKind::SideToMain => "side_to_main",
            JunctionKind::MainToMain => "main_to_main",
            JunctionKind::SideToSide => "side_to_side",
        }
    }
}

impl fmt::Display for JunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Node shared by road ways, with the indices of those ways in the extract
#[derive(Debug, Clone, PartialEq)]
pub struct Junction {
    pub id: i64,
    pub position: Coordinate,
    pub ways: Vec<usize>,
}

/// Collect junction nodes from the node lists of the road ways in `extract`
pub fn find_junctions(extract: &GeodataExtract) -> Vec<Junction> {
    let mut by_node: BTreeMap<i64, Junction> = BTreeMap::new();
    for (index, way) in extract.ways.iter().enumerate() {
        if !is_road(&way.tags) || way.nodes.len() != way.geometry.len() {
            continue;
        }
        for (&id, &position) in way.nodes.iter().zip(&way.geometry) {
            let junction = by_node.entry(id).or_insert_with(|| Junction {
                id,
                position,
                ways: Vec::new(),
            });
            // closed ways list their first node twice
            if junction.ways.last() != Some(&index) {
                junction.ways.push(index);
            }
        }
    }

    by_node
        .into_values()
        .filter(|j| {
            j.ways.len() > 1 || j.ways.iter().any(|&w| is_roundabout(&extract.ways[w].tags))
        })
        .collect()
}

/// Label from the ways at a junction alone
///
/// Ways sharing a `ref` or a `name` with an earlier way count as the same road.
fn base_label(ways: &[&TagMap]) -> Option<JunctionKind> {
    if ways.iter().any(|tags| is_roundabout(tags)) {
        return Some(JunctionKind::Roundabout);
    }
    let mut distinct: Vec<&TagMap> = Vec::new();
    for &tags in ways {
        let same_road = distinct.iter().any(|seen| {
            ["ref", "name"]
                .iter()
                .any(|key| tags.get(*key).is_some() && tags.get(*key) == seen.get(*key))
        });
        if distinct.is_empty() || !same_road {
            distinct.push(tags);
        }
    }
    (distinct.len() > 1).then_some(JunctionKind::Indistinct)
}

/// Refine an indistinct junction with the road class before and after it
fn refine(ways: &[&TagMap], previous: Option<&str>, next: Option<&str>) -> JunctionKind {
    let classes: BTreeSet<usize> = ways
        .iter()
        .map(|tags| priority(tags.get("highway").map(String::as_str)))
        .collect();
    let previous = priority(previous);
    let next = priority(next);

    if classes.len() == 1 {
        JunctionKind::Indistinct
    } else if previous == next {
        if classes.iter().any(|&c| c < previous) {
            JunctionKind::SideToSide
        } else {
            JunctionKind::MainToMain
        }
    } else if previous < next {
        JunctionKind::MainToSide
    } else {
        JunctionKind::SideToMain
    }
}

/// Mark points lying in one- or two-point gaps between roundabout points
fn fill_roundabout_gaps(labels: &mut [Option<JunctionKind>]) {
    for width in [3, 4] {
        if labels.len() < width {
            continue;
        }
        for start in 0..=labels.len() - width {
            let end = start + width - 1;
            if labels[start] == Some(JunctionKind::Roundabout) && labels[end] == Some(JunctionKind::Roundabout) {
                labels[start..=end].fill(Some(JunctionKind::Roundabout));
            }
        }
    }
}

/// Label every point of a route
///
/// `junctions[i]` holds the tags of the ways meeting at the junction nearest
/// to point `i`, if any; `highways[i]` is the `highway` tag of the way the
/// point itself is on.
pub fn classify(junctions: &[Option<Vec<&TagMap>>], highways: &[Option<&str>]) -> Vec<Option<JunctionKind>> {
    let last = junctions.len().saturating_sub(1);
    let mut labels: Vec<Option<JunctionKind>> = junctions
        .iter()
        .enumerate()
        .map(|(i, ways)| {
            let ways = ways.as_deref()?;
            match base_label(ways)? {
                JunctionKind::Indistinct if i > 0 && i < last => {
                    Some(refine(ways, highways[i - 1], highways.get(i + 1).copied().flatten()))
                }
                label => Some(label),
            }
        })
        .collect();
    fill_roundabout_gaps(&mut labels);
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::Way;

    fn tags(pairs: &[(&str, &str)]) -> TagMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn way(id: i64, nodes: &[i64], highway: &str) -> Way {
        Way {
            id,
            geometry: nodes.iter().map(|&n| Coordinate::new(50.0 + n as f64 * 0.001, 4.0)).collect(),
            nodes: nodes.to_vec(),
            tags: tags(&[("highway", highway)]),
        }
    }

    #[test]
    fn test_find_junctions() {
        let mut footway = way(3, &[2, 9], "footway");
        footway.tags.insert("name".into(), "path".into());
        let mut roundabout = way(4, &[20, 21, 22, 20], "primary");
        roundabout.tags.insert("junction".into(), "roundabout".into());
        let extract = GeodataExtract {
            ways: vec![way(1, &[1, 2, 3], "primary"), way(2, &[2, 5], "residential"), footway, roundabout],
            nodes: Vec::new(),
        };

        let junctions = find_junctions(&extract);
        let ids: Vec<i64> = junctions.iter().map(|j| j.id).collect();
        // node 2 joins two roads (the footway does not count), the roundabout nodes qualify alone
        assert_eq!(ids, vec![2, 20, 21, 22]);
        assert_eq!(junctions[0].ways, vec![0, 1]);
        assert_eq!(junctions[1].ways, vec![3]);
        assert_eq!(junctions[0].position, Coordinate::new(50.002, 4.0));
    }

    #[test]
    fn test_same_road_is_not_a_junction() {
        let a = tags(&[("highway", "primary"), ("ref", "N4")]);
        let b = tags(&[("highway", "primary"), ("ref", "N4"), ("name", "Main")]);
        assert_eq!(base_label(&[&a, &b]), None);

        let c = tags(&[("highway", "residential"), ("name", "Side")]);
        assert_eq!(base_label(&[&a, &c]), Some(JunctionKind::Indistinct));

        let ring = tags(&[("highway", "primary"), ("junction", "roundabout")]);
        assert_eq!(base_label(&[&ring]), Some(JunctionKind::Roundabout));
    }

    #[test]
    fn test_transitions() {
        let primary = tags(&[("highway", "primary"), ("name", "Main")]);
        let residential = tags(&[("highway", "residential"), ("name", "Side")]);
        let motorway = tags(&[("highway", "motorway"), ("name", "Ring")]);
        let ways = vec![&primary, &residential];

        assert_eq!(refine(&ways, Some("primary"), Some("residential")), JunctionKind::MainToSide);
        assert_eq!(refine(&ways, Some("residential"), Some("primary")), JunctionKind::SideToMain);
        assert_eq!(refine(&ways, Some("primary"), Some("primary")), JunctionKind::MainToMain);
        assert_eq!(refine(&ways, Some("residential"), Some("residential")), JunctionKind::SideToSide);
        assert_eq!(
            refine(&[&motorway, &primary], Some("primary"), Some("primary")),
            JunctionKind::SideToSide
        );
        // unknown classes rank as unclassified, below both crossing roads
        assert_eq!(refine(&ways, Some("track"), None), JunctionKind::SideToSide);
        let other = tags(&[("highway", "primary"), ("name", "Other")]);
        assert_eq!(refine(&[&primary, &other], Some("primary"), Some("residential")), JunctionKind::Indistinct);
    }

    #[test]
    fn test_classify_route() {
        let primary = tags(&[("highway", "primary"), ("name", "Main")]);
        let residential = tags(&[("highway", "residential"), ("name", "Side")]);
        let crossing = Some(vec![&primary, &residential]);
        let junctions = vec![crossing.clone(), None, crossing, None];
        let highways = vec![Some("primary"), Some("primary"), Some("primary"), Some("residential")];

        let labels = classify(&junctions, &highways);
        // endpoints keep the plain label, inner junctions get a transition
        assert_eq!(
            labels,
            vec![Some(JunctionKind::Indistinct), None, Some(JunctionKind::MainToSide), None]
        );
    }

    #[test]
    fn test_roundabout_gaps_are_filled() {
        use crate::core::junction::JunctionKind::Roundabout as R;
        let mut labels = vec![Some(R), None, Some(R), None, None, Some(R), None, None, None, Some(R)];
        fill_roundabout_gaps(&mut labels);
        let expected = vec![
            Some(R),
            Some(R),
            Some(R),
            Some(R),
            Some(R),
            Some(R),
            None,
            None,
            None,
            Some(R),
        ];
        assert_eq!(labels, expected);
    }
}
