use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::overlay::{OverlayRegistry, OverlaySpec, Paint};

/// How the sidebar drives the overlay set
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// One checkbox per overlay, any number shown at once
    #[default]
    Independent,
    /// One top-level overlay with an optional drill-down child
    DrillDown,
}

/// Initial map view; zoom is in viewport units (1.0 = whole world)
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct View {
    pub lon: f64,
    pub lat: f64,
    pub zoom: f64,
}

impl View {
    /// Centered on India
    pub const INDIA: View = View {
        lon: 78.9629,
        lat: 22.5937,
        zoom: 6.0,
    };
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub mode: Mode,
    pub overlays: Vec<OverlaySpec>,
    #[serde(default = "Paint::highlight")]
    pub highlight: Paint,
    #[serde(default = "Paint::dimmed")]
    pub dimmed: Paint,
    #[serde(default)]
    pub view: Option<View>,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_json(&content).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Validated registry of the configured overlays
    pub fn registry(&self) -> Result<OverlayRegistry> {
        OverlayRegistry::new(self.overlays.clone()).context("invalid overlay registry")
    }

    pub fn view(&self) -> View {
        self.view.unwrap_or(View::INDIA)
    }
}

impl Default for AppConfig {
    /// India base layers, each toggled independently
    fn default() -> Self {
        let mut india = OverlaySpec::new("india", "india.geojson", Paint::line("#000000", 2.0));
        india.label = Some("India".to_string());
        india.interactive = false;

        let states = OverlaySpec::new("states", "states.geojson", Paint::line("#3333cc", 1.5))
            .with_popup("NAME_1")
            .with_note("Madhya Pradesh", "High deforestation risk detected in central regions.")
            .with_note("Tripura", "Flood-prone zones identified near major rivers.")
            .with_note("Odisha", "Cyclone impact zones show infrastructure vulnerability.")
            .with_note("Telangana", "Urban heat island effect rising in Hyderabad.");

        let districts = OverlaySpec::new("districts", "districts.geojson", Paint::line("#999999", 0.8))
            .with_popup("NAME_2")
            .with_aliases(&["name"]);

        let rivers = OverlaySpec::new("rivers", "rivers.geojson", Paint::line("#0000ff", 1.0))
            .with_popup("NAME")
            .with_aliases(&["name"]);

        let roads = OverlaySpec::new("roads", "roads.geojson", Paint::line("#ff6600", 1.0))
            .with_popup("NAME")
            .with_aliases(&["name"]);

        let mut overlays = vec![india, states, districts, rivers, roads];
        for spec in overlays.iter_mut().skip(1) {
            spec.label = Some(capitalize(&spec.id));
        }

        Self {
            mode: Mode::Independent,
            overlays,
            highlight: Paint::highlight(),
            dimmed: Paint::dimmed(),
            view: Some(View::INDIA),
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
