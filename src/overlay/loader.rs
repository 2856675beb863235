use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use futures::future::{FutureExt, LocalBoxFuture, Shared};
use geojson::GeoJson;
use log::{debug, warn};

use crate::service::{Fetch, TransportError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadErrorKind {
    Network,
    ParseError,
    NotOk,
}

/// Tagged failure of one overlay load
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadError {
    pub kind: LoadErrorKind,
    pub detail: String,
}

impl LoadError {
    pub fn parse(detail: impl fmt::Display) -> Self {
        Self {
            kind: LoadErrorKind::ParseError,
            detail: detail.to_string(),
        }
    }
}

impl From<TransportError> for LoadError {
    fn from(err: TransportError) -> Self {
        let kind = match err {
            TransportError::Network(_) => LoadErrorKind::Network,
            TransportError::Status(_) => LoadErrorKind::NotOk,
        };
        Self {
            kind,
            detail: err.to_string(),
        }
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            LoadErrorKind::Network => "network failure",
            LoadErrorKind::ParseError => "invalid GeoJSON",
            LoadErrorKind::NotOk => "request rejected",
        };
        write!(f, "{} ({})", kind, self.detail)
    }
}

impl std::error::Error for LoadError {}

pub type LoadResult = Result<Rc<GeoJson>, LoadError>;

type PendingLoad = Shared<LocalBoxFuture<'static, LoadResult>>;

/// Parse a raw body as a GeoJSON Feature or FeatureCollection
pub fn parse_geojson(body: &mut [u8]) -> Result<GeoJson, LoadError> {
    let value: serde_json::Value = simd_json::serde::from_slice(body).map_err(LoadError::parse)?;
    match GeoJson::from_json_value(value).map_err(LoadError::parse)? {
        GeoJson::Geometry(_) => Err(LoadError::parse("expected a Feature or FeatureCollection, found a bare geometry")),
        geojson => Ok(geojson),
    }
}

/// Fetches overlay payloads, keeping at most one request in flight per id.
///
/// The loader never caches: every call that does not join an in-flight
/// request issues a fresh fetch.
pub struct OverlayLoader<F> {
    fetcher: Rc<F>,
    in_flight: RefCell<HashMap<String, PendingLoad>>,
}

impl<F: Fetch + 'static> OverlayLoader<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher: Rc::new(fetcher),
            in_flight: RefCell::new(HashMap::new()),
        }
    }

    /// Load `id` from `locator`, joining an outstanding request for the same id
    pub async fn load(&self, id: &str, locator: &str) -> LoadResult {
        let pending = {
            let mut in_flight = self.in_flight.borrow_mut();
            match in_flight.get(id) {
                Some(pending) => {
                    debug!("Joining in-flight load for '{}'", id);
                    pending.clone()
                }
                None => {
                    debug!("Fetching '{}' from {}", id, locator);
                    let pending = fetch_and_parse(self.fetcher.clone(), locator.to_string())
                        .boxed_local()
                        .shared();
                    in_flight.insert(id.to_string(), pending.clone());
                    pending
                }
            }
        };

        let result = pending.clone().await;

        // A newer request may already occupy the slot once this one settles
        let mut in_flight = self.in_flight.borrow_mut();
        if in_flight.get(id).is_some_and(|p| p.ptr_eq(&pending)) {
            in_flight.remove(id);
        }
        drop(in_flight);

        if let Err(err) = &result {
            warn!("Failed to load '{}' from {}: {}", id, locator, err);
        }
        result
    }

    pub fn is_loading(&self, id: &str) -> bool {
        self.in_flight.borrow().contains_key(id)
    }
}

async fn fetch_and_parse<F: Fetch>(fetcher: Rc<F>, locator: String) -> LoadResult {
    let mut body = fetcher.fetch(&locator).await?;
    parse_geojson(&mut body).map(Rc::new)
}
