use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Line/fill paint for a rendered overlay
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Paint {
    pub stroke_color: String,
    #[serde(default = "default_stroke_width")]
    pub stroke_width: f64,
    #[serde(default)]
    pub fill_color: Option<String>,
    #[serde(default)]
    pub fill_opacity: f64,
}

fn default_stroke_width() -> f64 {
    1.0
}

impl Paint {
    pub fn line(color: &str, width: f64) -> Self {
        Self {
            stroke_color: color.to_string(),
            stroke_width: width,
            fill_color: None,
            fill_opacity: 0.0,
        }
    }

    pub fn filled(mut self, color: &str, opacity: f64) -> Self {
        self.fill_color = Some(color.to_string());
        self.fill_opacity = opacity;
        self
    }

    /// Paint for features matching a drill-down key
    pub fn highlight() -> Self {
        Self::line("#ff3300", 2.5).filled("#ffcc00", 0.6)
    }

    /// Paint for every other feature of a drill-down child
    pub fn dimmed() -> Self {
        Self::line("#999999", 0.5).filled("#cccccc", 0.1)
    }
}

fn default_true() -> bool {
    true
}

/// Static description of one overlay source
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OverlaySpec {
    pub id: String,
    pub locator: String,
    #[serde(default)]
    pub label: Option<String>,
    pub style: Paint,
    #[serde(default = "default_true")]
    pub visible: bool,
    /// Feature property surfaced on click
    #[serde(default)]
    pub popup_attribute: Option<String>,
    /// Tried in order when `popup_attribute` is missing from a feature
    #[serde(default)]
    pub popup_aliases: Vec<String>,
    /// Property compared against a drill-down selection key (defaults to `popup_attribute`)
    #[serde(default)]
    pub match_attribute: Option<String>,
    /// Overlay this one drills down from
    #[serde(default)]
    pub parent: Option<String>,
    /// Insert the rendered layer before this layer id
    #[serde(default)]
    pub before: Option<String>,
    #[serde(default = "default_true")]
    pub interactive: bool,
    /// Extra popup text keyed by popup value
    #[serde(default)]
    pub notes: BTreeMap<String, String>,
    /// Selection keys offered for a child overlay
    #[serde(default)]
    pub choices: Vec<String>,
}

impl OverlaySpec {
    pub fn new(id: &str, locator: &str, style: Paint) -> Self {
        Self {
            id: id.to_string(),
            locator: locator.to_string(),
            label: None,
            style,
            visible: true,
            popup_attribute: None,
            popup_aliases: Vec::new(),
            match_attribute: None,
            parent: None,
            before: None,
            interactive: true,
            notes: BTreeMap::new(),
            choices: Vec::new(),
        }
    }

    pub fn with_popup(mut self, attribute: &str) -> Self {
        self.popup_attribute = Some(attribute.to_string());
        self
    }

    pub fn with_aliases(mut self, aliases: &[&str]) -> Self {
        self.popup_aliases = aliases.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_parent(mut self, parent: &str) -> Self {
        self.parent = Some(parent.to_string());
        self
    }

    pub fn with_choices(mut self, choices: &[&str]) -> Self {
        self.choices = choices.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_note(mut self, value: &str, note: &str) -> Self {
        self.notes.insert(value.to_string(), note.to_string());
        self
    }

    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.id)
    }

    /// Property used to match a drill-down selection key
    pub fn match_key(&self) -> Option<&str> {
        self.match_attribute.as_deref().or(self.popup_attribute.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    DuplicateId(String),
    UnknownParent { id: String, parent: String },
    NotFound(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::DuplicateId(id) => write!(f, "overlay id '{}' is registered twice", id),
            RegistryError::UnknownParent { id, parent } => {
                write!(f, "overlay '{}' drills down from unknown overlay '{}'", id, parent)
            }
            RegistryError::NotFound(id) => write!(f, "overlay '{}' is not registered", id),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Immutable table of overlay sources, in declaration order
#[derive(Debug, Clone)]
pub struct OverlayRegistry {
    specs: Vec<OverlaySpec>,
    index: HashMap<String, usize>,
}

impl OverlayRegistry {
    /// Build and validate: ids unique, parents resolvable
    pub fn new(specs: Vec<OverlaySpec>) -> Result<Self, RegistryError> {
        let mut index = HashMap::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            if index.insert(spec.id.clone(), i).is_some() {
                return Err(RegistryError::DuplicateId(spec.id.clone()));
            }
        }

        for spec in &specs {
            if let Some(parent) = &spec.parent {
                if !index.contains_key(parent) {
                    return Err(RegistryError::UnknownParent {
                        id: spec.id.clone(),
                        parent: parent.clone(),
                    });
                }
            }
        }

        Ok(Self { specs, index })
    }

    pub fn resolve(&self, id: &str) -> Result<&OverlaySpec, RegistryError> {
        self.index
            .get(id)
            .map(|&i| &self.specs[i])
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Child overlay drilled into from `parent_id`: the registered child of
    /// that parent, else the conventional `<parent>-detail` entry.
    pub fn child_of(&self, parent_id: &str) -> Result<&OverlaySpec, RegistryError> {
        self.specs
            .iter()
            .find(|s| s.parent.as_deref() == Some(parent_id))
            .map_or_else(|| self.resolve(&format!("{}-detail", parent_id)), Ok)
    }

    /// Overlays without a parent, in declaration order
    pub fn top_level(&self) -> impl Iterator<Item = &OverlaySpec> {
        self.specs.iter().filter(|s| s.parent.is_none())
    }

    pub fn iter(&self) -> impl Iterator<Item = &OverlaySpec> {
        self.specs.iter()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}
