//! Overlay lifecycle: registry lookup, loading, styling and the controller
//! that keeps the map in step with the user's selection.

mod bounds;
mod interaction;
mod loader;
mod manager;
mod registry;
mod style;

#[cfg(test)]
pub(crate) mod testing;

pub use bounds::Bounds;
pub use interaction::FeatureInteraction;
pub use loader::{parse_geojson, LoadError, LoadErrorKind, LoadResult, OverlayLoader};
pub use manager::{
    ActiveOverlay, ActiveOverlaySet, ChildSelection, LoadState, LoadedOverlay, OverlayError, OverlayManager,
    Outcome, Role, SelectionContext, SelectionEvent, CHILD_CONTROL, REFRESH_CONTROL, TOGGLE_PREFIX,
    TOP_LEVEL_CONTROL,
};
pub use registry::{OverlayRegistry, OverlaySpec, Paint, RegistryError};
pub use style::{classify, features, property_text, Classification, LayerStyle, Tier};
