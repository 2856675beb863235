use std::collections::HashMap;

use anyhow::{bail, Result};
use geojson::{GeoJson, Geometry, JsonObject, Value};
use log::{debug, warn};
use rayon::prelude::*;

use crate::braille::BrailleCanvas;
use crate::map::geometry::{draw_linestring, LineString};
use crate::map::projection::Viewport;
use crate::overlay::{features, Bounds, LayerStyle, Paint, Tier};
use crate::service::{ClickHandler, Cursor, FeatureClick, Hover, HoverHandler, LngLat, MapService};

/// Stroke widths at or above this are drawn double
const THICK_STROKE: f64 = 2.0;

/// One feature flattened for drawing and hit-testing
#[derive(Clone, Debug)]
struct Shape {
    lines: Vec<LineString>,
    bounds: Option<Bounds>,
    properties: Option<JsonObject>,
}

#[derive(Clone, Debug)]
struct Layer {
    id: String,
    source: String,
    style: LayerStyle,
    visible: bool,
}

/// Rasterized layer ready to be colored by the UI
#[derive(Clone, Debug)]
pub struct RenderedLayer {
    pub id: String,
    pub canvas: BrailleCanvas,
    pub paint: Paint,
}

/// Popup currently anchored on the map, as plain text
#[derive(Clone, Debug, PartialEq)]
pub struct MapPopup {
    pub at: LngLat,
    pub text: String,
}

/// Braille terminal implementation of the map service
pub struct TerminalMap {
    pub viewport: Viewport,
    sources: HashMap<String, Vec<Shape>>,
    /// Bottom to top
    layers: Vec<Layer>,
    clicks: HashMap<String, ClickHandler>,
    hovers: HashMap<String, HoverHandler>,
    hovered: Option<String>,
    popup: Option<MapPopup>,
    cursor: Cursor,
}

impl TerminalMap {
    pub fn new(viewport: Viewport) -> Self {
        Self {
            viewport,
            sources: HashMap::new(),
            layers: Vec::new(),
            clicks: HashMap::new(),
            hovers: HashMap::new(),
            hovered: None,
            popup: None,
            cursor: Cursor::Default,
        }
    }

    pub fn resize(&mut self, pixel_width: usize, pixel_height: usize) {
        self.viewport.width = pixel_width;
        self.viewport.height = pixel_height;
    }

    pub fn layer_ids(&self) -> Vec<&str> {
        self.layers.iter().map(|l| l.id.as_str()).collect()
    }

    pub fn is_layer_visible(&self, id: &str) -> Option<bool> {
        self.layers.iter().find(|l| l.id == id).map(|l| l.visible)
    }

    pub fn popup(&self) -> Option<&MapPopup> {
        self.popup.as_ref()
    }

    pub fn close_popup(&mut self) {
        self.popup = None;
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    /// Rasterize every visible layer onto its own canvas, bottom to top.
    /// Tiered layers yield a dimmed canvas followed by a highlighted one.
    pub fn render(&self, width: usize, height: usize, viewport: &Viewport) -> Vec<RenderedLayer> {
        let sources = &self.sources;

        self.layers
            .par_iter()
            .filter(|layer| layer.visible)
            .map(|layer| {
                let shapes = sources.get(&layer.source).map(Vec::as_slice).unwrap_or(&[]);
                rasterize(layer, shapes, width, height, viewport)
            })
            .collect::<Vec<_>>()
            .into_iter()
            .flatten()
            .collect()
    }

    /// Dispatch a click at canvas pixel (px, py). A click on empty map
    /// closes the popup.
    pub fn click_at(&mut self, px: i32, py: i32) -> bool {
        let (lon, lat) = self.viewport.unproject(px, py);
        let at = LngLat { lon, lat };

        let Some((layer_id, shape)) = self.hit_test(at, |id| self.clicks.contains_key(id)) else {
            self.popup = None;
            return false;
        };

        let click = FeatureClick {
            layer_id: layer_id.clone(),
            properties: shape.properties.clone(),
            at,
        };
        debug!("Click on layer '{}' at {:.3}, {:.3}", layer_id, lon, lat);
        let popup = self.clicks.get(&layer_id).and_then(|handler| handler(&click));
        match popup {
            Some(popup) => self.show_popup(popup.at, &popup.html()),
            None => self.popup = None,
        }
        true
    }

    /// Track the hovered layer at canvas pixel (px, py), firing leave/enter
    pub fn hover_at(&mut self, px: i32, py: i32) {
        let (lon, lat) = self.viewport.unproject(px, py);
        let target = self
            .hit_test(LngLat { lon, lat }, |id| self.hovers.contains_key(id))
            .map(|(id, _)| id);
        if target == self.hovered {
            return;
        }

        if let Some(previous) = self.hovered.take() {
            if let Some(cursor) = self.hovers.get(&previous).map(|h| h(Hover::Leave)) {
                self.set_cursor(cursor);
            }
        }
        if let Some(current) = &target {
            if let Some(cursor) = self.hovers.get(current).map(|h| h(Hover::Enter)) {
                self.set_cursor(cursor);
            }
        }
        self.hovered = target;
    }

    /// Smallest feature containing `at` on the topmost visible layer that
    /// passes `bound`
    fn hit_test(&self, at: LngLat, bound: impl Fn(&str) -> bool) -> Option<(String, &Shape)> {
        self.layers
            .iter()
            .rev()
            .filter(|layer| layer.visible && bound(layer.id.as_str()))
            .find_map(|layer| {
                self.sources
                    .get(&layer.source)?
                    .iter()
                    .filter(|shape| shape.bounds.is_some_and(|b| b.contains(at)))
                    .min_by(|a, b| area(a).total_cmp(&area(b)))
                    .map(|shape| (layer.id.clone(), shape))
            })
    }
}

fn area(shape: &Shape) -> f64 {
    shape.bounds.map_or(f64::INFINITY, |b| b.area())
}

fn rasterize(layer: &Layer, shapes: &[Shape], width: usize, height: usize, viewport: &Viewport) -> Vec<RenderedLayer> {
    let draw = |paint: &Paint, include: &dyn Fn(usize) -> bool| {
        let mut canvas = BrailleCanvas::new(width, height);
        let thick = paint.stroke_width >= THICK_STROKE;
        for (_, shape) in shapes.iter().enumerate().filter(|(i, _)| include(*i)) {
            for line in &shape.lines {
                draw_linestring(&mut canvas, line, viewport, thick);
            }
        }
        RenderedLayer {
            id: layer.id.clone(),
            canvas,
            paint: paint.clone(),
        }
    };

    match &layer.style {
        LayerStyle::Uniform(paint) => vec![draw(paint, &|_: usize| true)],
        LayerStyle::Tiered {
            tiers,
            highlighted,
            dimmed,
        } => {
            let tier = |i: usize| tiers.get(i).copied().unwrap_or(Tier::Dimmed);
            vec![
                draw(dimmed, &|i: usize| tier(i) == Tier::Dimmed),
                draw(highlighted, &|i: usize| tier(i) == Tier::Highlighted),
            ]
        }
    }
}

/// Flatten payload features into drawable shapes, keeping feature order
fn shapes_of(payload: &GeoJson) -> Vec<Shape> {
    features(payload)
        .iter()
        .map(|feature| {
            let mut lines = Vec::new();
            if let Some(geometry) = &feature.geometry {
                flatten(geometry, &mut lines);
            }
            Shape {
                lines,
                bounds: Bounds::of_feature(feature),
                properties: feature.properties.clone(),
            }
        })
        .collect()
}

fn line(coords: &[Vec<f64>]) -> LineString {
    coords.iter().map(|c| (c[0], c[1])).collect()
}

fn flatten(geometry: &Geometry, out: &mut Vec<LineString>) {

    match &geometry.value {
        Value::Point(c) => out.push(vec![(c[0], c[1])]),
        Value::MultiPoint(points) => out.extend(points.iter().map(|c| vec![(c[0], c[1])])),
        Value::LineString(coords) => out.push(line(coords)),
        Value::MultiLineString(lines) => out.extend(lines.iter().map(|l| line(l))),
        Value::Polygon(rings) => out.extend(rings.iter().map(|r| line(r))),
        Value::MultiPolygon(polygons) => {
            for rings in polygons {
                out.extend(rings.iter().map(|r| line(r)));
            }
        }
        Value::GeometryCollection(geometries) => {
            for g in geometries {
                flatten(g, out);
            }
        }
    }
}

/// Popup HTML reduced to terminal text: block ends become line breaks
fn html_to_text(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    let mut tag = String::new();

    for ch in html.chars() {
        match ch {
            '<' => {
                in_tag = true;
                tag.clear();
            }
            '>' if in_tag => {
                in_tag = false;
                if matches!(tag.as_str(), "/h3" | "/p" | "br" | "br/") && !text.is_empty() {
                    text.push('\n');
                }
            }
            _ if in_tag => tag.push(ch),
            _ => text.push(ch),
        }
    }

    text.trim_end()
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

impl MapService for TerminalMap {
    fn add_source(&mut self, id: &str, payload: &GeoJson) -> Result<()> {
        if self.sources.contains_key(id) {
            bail!("source '{}' already exists", id);
        }
        let shapes = shapes_of(payload);
        debug!("Added source '{}' with {} features", id, shapes.len());
        self.sources.insert(id.to_string(), shapes);
        Ok(())
    }

    fn remove_source(&mut self, id: &str) {
        self.sources.remove(id);
    }

    fn add_overlay_layer(&mut self, id: &str, source_id: &str, style: &LayerStyle, before: Option<&str>) -> Result<()> {
        if !self.sources.contains_key(source_id) {
            bail!("layer '{}' refers to missing source '{}'", id, source_id);
        }
        if self.layers.iter().any(|l| l.id == id) {
            bail!("layer '{}' already exists", id);
        }

        let layer = Layer {
            id: id.to_string(),
            source: source_id.to_string(),
            style: style.clone(),
            visible: true,
        };
        let position = before.and_then(|b| {
            let found = self.layers.iter().position(|l| l.id == b);
            if found.is_none() {
                warn!("Layer '{}' not found; adding '{}' on top", b, id);
            }
            found
        });
        match position {
            Some(i) => self.layers.insert(i, layer),
            None => self.layers.push(layer),
        }
        Ok(())
    }

    fn remove_layer(&mut self, id: &str) {
        self.layers.retain(|l| l.id != id);
        self.clicks.remove(id);
        self.hovers.remove(id);
        if self.hovered.as_deref() == Some(id) {
            self.hovered = None;
            self.cursor = Cursor::Default;
        }
    }

    fn set_layer_visibility(&mut self, id: &str, visible: bool) {
        match self.layers.iter_mut().find(|l| l.id == id) {
            Some(layer) => layer.visible = visible,
            None => warn!("Visibility change for missing layer '{}'", id),
        }
    }

    fn fit_bounds(&mut self, bounds: Bounds) {
        self.viewport.fit(bounds);
    }

    fn on_feature_click(&mut self, layer_id: &str, handler: ClickHandler) {
        self.clicks.insert(layer_id.to_string(), handler);
    }

    fn on_feature_hover(&mut self, layer_id: &str, handler: HoverHandler) {
        self.hovers.insert(layer_id.to_string(), handler);
    }

    fn show_popup(&mut self, at: LngLat, html: &str) {
        self.popup = Some(MapPopup {
            at,
            text: html_to_text(html),
        });
    }

    fn set_cursor(&mut self, cursor: Cursor) {
        self.cursor = cursor;
    }
}
