//! Test doubles for the fetch, map and status collaborators.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use futures::channel::oneshot;
use futures::future::{self, FutureExt, LocalBoxFuture};
use geojson::{GeoJson, JsonObject};

use crate::overlay::bounds::Bounds;
use crate::overlay::style::LayerStyle;
use crate::service::{
    ClickHandler, Cursor, FeatureClick, Fetch, Hover, HoverHandler, LngLat, MapService, StatusSink,
    TransportError,
};

type Body = Result<Vec<u8>, TransportError>;

/// Unit square of the `i`th generated feature
pub fn square_bounds(i: usize) -> Bounds {
    let lon = 70.0 + 2.0 * i as f64;
    Bounds {
        min_lon: lon,
        min_lat: 20.0,
        max_lon: lon + 1.0,
        max_lat: 21.0,
    }
}

/// FeatureCollection body with one square polygon per (property, value)
pub fn feature_collection(features: &[(&str, &str)]) -> Vec<u8> {
    let features: Vec<serde_json::Value> = features
        .iter()
        .enumerate()
        .map(|(i, (key, value))| {
            let b = square_bounds(i);
            serde_json::json!({
                "type": "Feature",
                "properties": { *key: *value },
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[
                        [b.min_lon, b.min_lat],
                        [b.max_lon, b.min_lat],
                        [b.max_lon, b.max_lat],
                        [b.min_lon, b.max_lat],
                        [b.min_lon, b.min_lat]
                    ]]
                }
            })
        })
        .collect();
    serde_json::to_vec(&serde_json::json!({ "type": "FeatureCollection", "features": features }))
        .expect("serializable")
}

#[derive(Default)]
struct FetcherState {
    responses: HashMap<String, Body>,
    gates: HashMap<String, VecDeque<oneshot::Receiver<Body>>>,
    calls: HashMap<String, usize>,
}

/// Fetcher answering from scripted responses; gated locators stay pending
/// until the test opens the gate.
#[derive(Clone, Default)]
pub struct TestFetcher {
    state: Rc<RefCell<FetcherState>>,
}

pub struct Gate(oneshot::Sender<Body>);

impl Gate {
    pub fn open(self, body: Vec<u8>) {
        let _ = self.0.send(Ok(body));
    }

    pub fn fail(self, err: TransportError) {
        let _ = self.0.send(Err(err));
    }
}

impl TestFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, locator: &str, body: Vec<u8>) -> Self {
        self.state.borrow_mut().responses.insert(locator.to_string(), Ok(body));
        self
    }

    pub fn fail(self, locator: &str, err: TransportError) -> Self {
        self.state.borrow_mut().responses.insert(locator.to_string(), Err(err));
        self
    }

    /// Hold the next fetch of `locator` until the returned gate is opened
    pub fn gate(&self, locator: &str) -> Gate {
        let (tx, rx) = oneshot::channel();
        self.state
            .borrow_mut()
            .gates
            .entry(locator.to_string())
            .or_default()
            .push_back(rx);
        Gate(tx)
    }

    pub fn calls(&self, locator: &str) -> usize {
        self.state.borrow().calls.get(locator).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.state.borrow().calls.values().sum()
    }
}

impl Fetch for TestFetcher {
    fn fetch(&self, locator: &str) -> LocalBoxFuture<'static, Body> {
        let mut state = self.state.borrow_mut();
        *state.calls.entry(locator.to_string()).or_default() += 1;

        if let Some(rx) = state.gates.get_mut(locator).and_then(VecDeque::pop_front) {
            return rx
                .map(|r| r.unwrap_or_else(|_| Err(TransportError::Network("gate dropped".into()))))
                .boxed_local();
        }

        let body = state
            .responses
            .get(locator)
            .cloned()
            .unwrap_or_else(|| Err(TransportError::Network(format!("no route to {}", locator))));
        future::ready(body).boxed_local()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MapCall {
    AddSource(String),
    RemoveSource(String),
    AddLayer { id: String, source: String, style: LayerStyle, before: Option<String> },
    RemoveLayer(String),
    Visibility(String, bool),
    FitBounds(Bounds),
    OnClick(String),
    OnHover(String),
    Popup(LngLat, String),
    Cursor(Cursor),
}

/// Map double recording every call and keeping the attached ids
#[derive(Default)]
pub struct RecordingMap {
    pub calls: Vec<MapCall>,
    pub sources: Vec<String>,
    pub layers: Vec<String>,
    pub payloads: HashMap<String, GeoJson>,
    pub fail_layer: Option<String>,
    clicks: HashMap<String, ClickHandler>,
    hovers: HashMap<String, HoverHandler>,
}

impl RecordingMap {
    pub fn shared() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self::default()))
    }

    pub fn mutations(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| !matches!(c, MapCall::Popup(..) | MapCall::Cursor(_)))
            .count()
    }

    pub fn fits(&self) -> Vec<Bounds> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                MapCall::FitBounds(b) => Some(*b),
                _ => None,
            })
            .collect()
    }

    pub fn last_style(&self, layer: &str) -> Option<LayerStyle> {
        self.calls.iter().rev().find_map(|c| match c {
            MapCall::AddLayer { id, style, .. } if id == layer => Some(style.clone()),
            _ => None,
        })
    }

    pub fn click(&mut self, layer: &str, properties: Option<JsonObject>, at: LngLat) -> bool {
        let click = FeatureClick {
            layer_id: layer.to_string(),
            properties,
            at,
        };
        let popup = match self.clicks.get(layer) {
            Some(handler) => handler(&click),
            None => return false,
        };
        if let Some(popup) = popup {
            self.show_popup(popup.at, &popup.html());
        }
        true
    }

    pub fn hover(&mut self, layer: &str, hover: Hover) {
        if let Some(cursor) = self.hovers.get(layer).map(|h| h(hover)) {
            self.set_cursor(cursor);
        }
    }
}

impl MapService for RecordingMap {
    fn add_source(&mut self, id: &str, payload: &GeoJson) -> anyhow::Result<()> {
        anyhow::ensure!(!self.sources.iter().any(|s| s == id), "source '{}' already exists", id);
        self.calls.push(MapCall::AddSource(id.to_string()));
        self.sources.push(id.to_string());
        self.payloads.insert(id.to_string(), payload.clone());
        Ok(())
    }

    fn remove_source(&mut self, id: &str) {
        self.calls.push(MapCall::RemoveSource(id.to_string()));
        self.sources.retain(|s| s != id);
        self.payloads.remove(id);
    }

    fn add_overlay_layer(
        &mut self,
        id: &str,
        source_id: &str,
        style: &LayerStyle,
        before: Option<&str>,
    ) -> anyhow::Result<()> {
        if self.fail_layer.as_deref() == Some(id) {
            anyhow::bail!("layer '{}' rejected", id);
        }
        anyhow::ensure!(!self.layers.iter().any(|l| l == id), "layer '{}' already exists", id);
        self.calls.push(MapCall::AddLayer {
            id: id.to_string(),
            source: source_id.to_string(),
            style: style.clone(),
            before: before.map(str::to_string),
        });
        self.layers.push(id.to_string());
        Ok(())
    }

    fn remove_layer(&mut self, id: &str) {
        self.calls.push(MapCall::RemoveLayer(id.to_string()));
        self.layers.retain(|l| l != id);
        self.clicks.remove(id);
        self.hovers.remove(id);
    }

    fn set_layer_visibility(&mut self, id: &str, visible: bool) {
        self.calls.push(MapCall::Visibility(id.to_string(), visible));
    }

    fn fit_bounds(&mut self, bounds: Bounds) {
        self.calls.push(MapCall::FitBounds(bounds));
    }

    fn on_feature_click(&mut self, layer_id: &str, handler: ClickHandler) {
        self.calls.push(MapCall::OnClick(layer_id.to_string()));
        self.clicks.insert(layer_id.to_string(), handler);
    }

    fn on_feature_hover(&mut self, layer_id: &str, handler: HoverHandler) {
        self.calls.push(MapCall::OnHover(layer_id.to_string()));
        self.hovers.insert(layer_id.to_string(), handler);
    }

    fn show_popup(&mut self, at: LngLat, html: &str) {
        self.calls.push(MapCall::Popup(at, html.to_string()));
    }

    fn set_cursor(&mut self, cursor: Cursor) {
        self.calls.push(MapCall::Cursor(cursor));
    }
}

#[derive(Default)]
pub struct RecordingStatus {
    pub messages: Vec<(String, bool)>,
}

impl RecordingStatus {
    pub fn shared() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self::default()))
    }

    pub fn errors(&self) -> Vec<&str> {
        self.messages
            .iter()
            .filter(|(_, is_error)| *is_error)
            .map(|(m, _)| m.as_str())
            .collect()
    }

    pub fn last(&self) -> Option<&(String, bool)> {
        self.messages.last()
    }
}

impl StatusSink for RecordingStatus {
    fn set_status(&mut self, message: &str, is_error: bool) {
        self.messages.push((message.to_string(), is_error));
    }
}
