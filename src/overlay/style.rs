use geojson::{Feature, GeoJson};
use serde_json::Value as JsonValue;

use crate::overlay::bounds::Bounds;
use crate::overlay::registry::Paint;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tier {
    Highlighted,
    Dimmed,
}

/// Style handed to the map for one overlay layer
#[derive(Clone, Debug, PartialEq)]
pub enum LayerStyle {
    Uniform(Paint),
    /// One tier per feature, in payload order
    Tiered {
        tiers: Vec<Tier>,
        highlighted: Paint,
        dimmed: Paint,
    },
}

/// Result of evaluating every feature against a selection key
#[derive(Clone, Debug, PartialEq)]
pub struct Classification {
    pub tiers: Vec<Tier>,
    pub matches: usize,
    /// Union of the matching features' bounds
    pub matched_bounds: Option<Bounds>,
}

/// Borrow the features of a payload in order
pub fn features(geojson: &GeoJson) -> &[Feature] {
    match geojson {
        GeoJson::FeatureCollection(fc) => &fc.features,
        GeoJson::Feature(f) => std::slice::from_ref(f),
        GeoJson::Geometry(_) => &[],
    }
}

/// Property value rendered as display text; `None` for missing or null
pub fn property_text(feature: &Feature, attribute: &str) -> Option<String> {
    feature
        .properties
        .as_ref()
        .and_then(|p| p.get(attribute))
        .and_then(value_text)
}

pub fn value_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

/// Two-tier classification: features whose `attribute` equals `key` are
/// highlighted, every other feature is dimmed.
pub fn classify(geojson: &GeoJson, attribute: &str, key: &str) -> Classification {
    let mut matches = 0;
    let mut matched_bounds: Option<Bounds> = None;

    let tiers = features(geojson)
        .iter()
        .map(|feature| {
            if property_text(feature, attribute).as_deref() != Some(key) {
                return Tier::Dimmed;
            }
            matches += 1;
            if let Some(b) = Bounds::of_feature(feature) {
                matched_bounds = Some(matched_bounds.map_or(b, |acc| acc.union(b)));
            }
            Tier::Highlighted
        })
        .collect();

    Classification {
        tiers,
        matches,
        matched_bounds,
    }
}
