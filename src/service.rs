//! Narrow interfaces to the collaborators the overlay controller drives:
//! the map rendering service, the data fetcher and the UI status sink.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use futures::future::LocalBoxFuture;

use geojson::{GeoJson, JsonObject};

use crate::overlay::{Bounds, LayerStyle};

/// Geographic position of a pointer event
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LngLat {
    pub lon: f64,
    pub lat: f64,
}

/// Pointer cursor requested from the map
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Cursor {
    #[default]
    Default,
    Pointer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Hover {
    Enter,
    Leave,
}

/// A click that landed on a rendered feature
#[derive(Clone, Debug)]
pub struct FeatureClick {
    pub layer_id: String,
    pub properties: Option<JsonObject>,
    pub at: LngLat,
}

/// Anchored popup content
#[derive(Clone, Debug, PartialEq)]
pub struct Popup {
    pub at: LngLat,
    pub key: String,
    pub value: String,
    pub note: Option<String>,
}

impl Popup {
    /// Plain `key: value` rendering, with the note on a second line
    pub fn text(&self) -> String {
        match &self.note {
            Some(note) => format!("{}: {}\n{}", self.key, self.value, note),
            None => format!("{}: {}", self.key, self.value),
        }
    }

    pub fn html(&self) -> String {
        let mut html = format!("<h3>{}: {}</h3>", escape_html(&self.key), escape_html(&self.value));
        if let Some(note) = &self.note {
            html.push_str(&format!("<p>{}</p>", escape_html(note)));
        }
        html
    }
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Invoked by the map when a feature of the bound layer is clicked; the map
/// shows the returned popup at its anchor.
pub type ClickHandler = Box<dyn Fn(&FeatureClick) -> Option<Popup>>;

/// Invoked on hover enter/leave; the map applies the returned cursor.
pub type HoverHandler = Box<dyn Fn(Hover) -> Cursor>;

/// Map rendering engine as seen by the overlay controller
pub trait MapService {
    fn add_source(&mut self, id: &str, payload: &GeoJson) -> anyhow::Result<()>;
    fn remove_source(&mut self, id: &str);
    fn add_overlay_layer(
        &mut self,
        id: &str,
        source_id: &str,
        style: &LayerStyle,
        before: Option<&str>,
    ) -> anyhow::Result<()>;
    fn remove_layer(&mut self, id: &str);
    fn set_layer_visibility(&mut self, id: &str, visible: bool);
    fn fit_bounds(&mut self, bounds: Bounds);
    fn on_feature_click(&mut self, layer_id: &str, handler: ClickHandler);
    fn on_feature_hover(&mut self, layer_id: &str, handler: HoverHandler);
    fn show_popup(&mut self, at: LngLat, html: &str);
    fn set_cursor(&mut self, cursor: Cursor);
}

/// Failure reported by the data-fetch collaborator
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportError {
    /// Connection/IO failure before any status was received
    Network(String),
    /// Non-success HTTP-like status
    Status(u16),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Network(detail) => write!(f, "network error: {}", detail),
            TransportError::Status(code) => write!(f, "HTTP {}", code),
        }
    }
}

impl std::error::Error for TransportError {}

/// Raw body fetch for an overlay locator
pub trait Fetch {
    fn fetch(&self, locator: &str) -> LocalBoxFuture<'static, Result<Vec<u8>, TransportError>>;
}

/// Sidebar/status text sink
pub trait StatusSink {
    fn set_status(&mut self, message: &str, is_error: bool);
}

impl<T: MapService + ?Sized> MapService for Rc<RefCell<T>> {
    fn add_source(&mut self, id: &str, payload: &GeoJson) -> anyhow::Result<()> {
        self.borrow_mut().add_source(id, payload)
    }

    fn remove_source(&mut self, id: &str) {
        self.borrow_mut().remove_source(id)
    }

    fn add_overlay_layer(
        &mut self,
        id: &str,
        source_id: &str,
        style: &LayerStyle,
        before: Option<&str>,
    ) -> anyhow::Result<()> {
        self.borrow_mut().add_overlay_layer(id, source_id, style, before)
    }

    fn remove_layer(&mut self, id: &str) {
        self.borrow_mut().remove_layer(id)
    }

    fn set_layer_visibility(&mut self, id: &str, visible: bool) {
        self.borrow_mut().set_layer_visibility(id, visible)
    }

    fn fit_bounds(&mut self, bounds: Bounds) {
        self.borrow_mut().fit_bounds(bounds)
    }

    fn on_feature_click(&mut self, layer_id: &str, handler: ClickHandler) {
        self.borrow_mut().on_feature_click(layer_id, handler)
    }

    fn on_feature_hover(&mut self, layer_id: &str, handler: HoverHandler) {
        self.borrow_mut().on_feature_hover(layer_id, handler)
    }

    fn show_popup(&mut self, at: LngLat, html: &str) {
        self.borrow_mut().show_popup(at, html)
    }

    fn set_cursor(&mut self, cursor: Cursor) {
        self.borrow_mut().set_cursor(cursor)
    }
}

impl<T: StatusSink + ?Sized> StatusSink for Rc<RefCell<T>> {
    fn set_status(&mut self, message: &str, is_error: bool) {
        self.borrow_mut().set_status(message, is_error)
    }
}
