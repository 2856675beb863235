use std::collections::BTreeMap;
use std::rc::Rc;

use geojson::JsonObject;

use crate::overlay::registry::OverlaySpec;
use crate::overlay::style::value_text;
use crate::service::{Cursor, FeatureClick, Hover, Popup};

const MISSING: &str = "N/A";

/// Stateless click/hover resolution for one overlay
#[derive(Clone, Debug)]
pub struct FeatureInteraction {
    overlay_id: String,
    attribute: Option<String>,
    aliases: Vec<String>,
    notes: Rc<BTreeMap<String, String>>,
}

impl FeatureInteraction {
    pub fn for_overlay(spec: &OverlaySpec) -> Self {
        Self {
            overlay_id: spec.id.clone(),
            attribute: spec.popup_attribute.clone(),
            aliases: spec.popup_aliases.clone(),
            notes: Rc::new(spec.notes.clone()),
        }
    }

    /// Resolve the (key, value) pair shown for a feature's properties.
    ///
    /// Order: configured attribute, then aliases; when an attribute is
    /// configured but absent the attribute is shown as N/A. Without a
    /// configured attribute the first declared property is used.
    pub fn resolve(&self, properties: Option<&JsonObject>) -> (String, String) {
        let lookup = |key: &str| properties.and_then(|p| p.get(key)).and_then(value_text);

        if let Some(attribute) = &self.attribute {
            let found = std::iter::once(attribute)
                .chain(&self.aliases)
                .find_map(|key| lookup(key.as_str()).map(|value| (key.clone(), value)));
            return found.unwrap_or_else(|| (attribute.clone(), MISSING.to_string()));
        }

        properties
            .and_then(|p| p.iter().next())
            .map(|(key, value)| (key.clone(), value_text(value).unwrap_or_else(|| MISSING.to_string())))
            .unwrap_or_else(|| (self.overlay_id.clone(), MISSING.to_string()))
    }

    pub fn popup(&self, click: &FeatureClick) -> Popup {
        let (key, value) = self.resolve(click.properties.as_ref());
        let note = self.notes.get(&value).cloned();
        Popup {
            at: click.at,
            key,
            value,
            note,
        }
    }

    pub fn cursor(hover: Hover) -> Cursor {
        match hover {
            Hover::Enter => Cursor::Pointer,
            Hover::Leave => Cursor::Default,
        }
    }
}
