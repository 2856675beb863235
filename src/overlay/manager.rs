use std::cell::{Ref, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::rc::Rc;

use futures::future::join_all;
use geojson::GeoJson;
use log::{debug, error, info, warn};

use crate::overlay::bounds::Bounds;
use crate::overlay::interaction::FeatureInteraction;
use crate::overlay::loader::{LoadError, OverlayLoader};
use crate::overlay::registry::{OverlayRegistry, OverlaySpec, Paint, RegistryError};
use crate::overlay::style::{classify, features, LayerStyle, Tier};
use crate::service::{FeatureClick, Fetch, MapService, StatusSink};

/// UI control ids understood by [`OverlayManager::handle_selection`]
pub const TOP_LEVEL_CONTROL: &str = "top-level";
pub const CHILD_CONTROL: &str = "child";
pub const REFRESH_CONTROL: &str = "refresh";
pub const TOGGLE_PREFIX: &str = "toggle-";

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum LoadState {
    #[default]
    Idle,
    Loading,
    Ready,
    Failed(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Checkbox-driven, additive
    Independent,
    /// Exclusive drill-down parent
    TopLevel,
    /// Exclusive drill-down child of the top-level overlay
    Child,
}

#[derive(Clone, Debug)]
pub struct LoadedOverlay {
    pub id: String,
    pub payload: Rc<GeoJson>,
    pub state: LoadState,
}

#[derive(Clone, Debug)]
pub struct ActiveOverlay {
    pub overlay: LoadedOverlay,
    pub role: Role,
    pub attached: bool,
    pub visible: bool,
    pub style: LayerStyle,
    pub bounds: Option<Bounds>,
    /// Drill-down key the child overlay is styled against
    pub key: Option<String>,
}

/// Overlays currently attached to the map, keyed by id
#[derive(Debug, Default)]
pub struct ActiveOverlaySet {
    entries: BTreeMap<String, ActiveOverlay>,
}

impl ActiveOverlaySet {
    pub fn get(&self, id: &str) -> Option<&ActiveOverlay> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn top_level(&self) -> Option<&str> {
        self.with_role(Role::TopLevel).next()
    }

    pub fn child(&self) -> Option<&ActiveOverlay> {
        self.entries.values().find(|e| e.role == Role::Child)
    }

    fn with_role(&self, role: Role) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(move |(_, e)| e.role == role)
            .map(|(id, _)| id.as_str())
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut ActiveOverlay> {
        self.entries.get_mut(id)
    }

    fn insert(&mut self, entry: ActiveOverlay) {
        self.entries.insert(entry.overlay.id.clone(), entry);
    }

    fn remove(&mut self, id: &str) -> Option<ActiveOverlay> {
        self.entries.remove(id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildSelection {
    pub overlay: String,
    pub key: String,
}

/// What the user currently wants on the map
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SelectionContext {
    pub top_level: Option<String>,
    pub child: Option<ChildSelection>,
    /// Independent overlays checked on
    pub toggled: BTreeSet<String>,
}

/// UI selection change
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectionEvent {
    pub control_id: String,
    pub value: String,
    pub checked: Option<bool>,
}

impl SelectionEvent {
    pub fn select(control_id: &str, value: &str) -> Self {
        Self {
            control_id: control_id.to_string(),
            value: value.to_string(),
            checked: None,
        }
    }

    pub fn toggle(id: &str, checked: bool) -> Self {
        Self {
            control_id: format!("{}{}", TOGGLE_PREFIX, id),
            value: id.to_string(),
            checked: Some(checked),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OverlayError {
    NotFoundInRegistry(String),
    Load { id: String, locator: String, error: LoadError },
    FeatureNotFound { overlay: String, key: String },
    Map { id: String, detail: String },
    /// Registry inconsistency surfaced at selection time
    Registry(RegistryError),
}

impl fmt::Display for OverlayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverlayError::NotFoundInRegistry(id) => write!(f, "Unknown overlay '{}'", id),
            OverlayError::Load { locator, error, .. } => write!(f, "Failed to load {}: {}", locator, error),
            OverlayError::FeatureNotFound { overlay, key } => {
                write!(f, "'{}' was not found in {}; showing the whole layer", key, overlay)
            }
            OverlayError::Map { id, detail } => write!(f, "Map rejected overlay '{}': {}", id, detail),
            OverlayError::Registry(err) => write!(f, "Invalid overlay registry: {}", err),
        }
    }
}

impl std::error::Error for OverlayError {}

impl From<RegistryError> for OverlayError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => OverlayError::NotFoundInRegistry(id),
            err @ (RegistryError::DuplicateId(_) | RegistryError::UnknownParent { .. }) => OverlayError::Registry(err),
        }
    }
}

/// Result of one controller operation; failures have already been reported
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Unchanged,
    /// Response arrived after the selection moved on
    Discarded,
    /// Applied with a non-fatal problem
    Degraded(OverlayError),
    Failed(OverlayError),
}

/// Request re-issued by `refresh` after a failure
#[derive(Clone, Debug)]
enum Request {
    TopLevel,
    Child { parent: String, key: String },
    Toggle,
}

/// Owns the overlays attached to the map and sequences every change to them
pub struct OverlayManager<M, F, S> {
    registry: Rc<OverlayRegistry>,
    loader: OverlayLoader<F>,
    map: RefCell<M>,
    status: RefCell<S>,
    active: RefCell<ActiveOverlaySet>,
    selection: RefCell<SelectionContext>,
    load_states: RefCell<HashMap<String, LoadState>>,
    failed: RefCell<HashMap<String, Request>>,
    highlighted: Paint,
    dimmed: Paint,
}

impl<M, F, S> OverlayManager<M, F, S>
where
    M: MapService,
    F: Fetch + 'static,
    S: StatusSink,
{
    pub fn new(registry: Rc<OverlayRegistry>, fetcher: F, map: M, status: S) -> Self {
        Self {
            registry,
            loader: OverlayLoader::new(fetcher),
            map: RefCell::new(map),
            status: RefCell::new(status),
            active: RefCell::new(ActiveOverlaySet::default()),
            selection: RefCell::new(SelectionContext::default()),
            load_states: RefCell::new(HashMap::new()),
            failed: RefCell::new(HashMap::new()),
            highlighted: Paint::highlight(),
            dimmed: Paint::dimmed(),
        }
    }

    pub fn with_tier_paints(mut self, highlighted: Paint, dimmed: Paint) -> Self {
        self.highlighted = highlighted;
        self.dimmed = dimmed;
        self
    }

    pub fn registry(&self) -> &OverlayRegistry {
        &self.registry
    }

    pub fn active(&self) -> Ref<'_, ActiveOverlaySet> {
        self.active.borrow()
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.active.borrow().ids().map(str::to_string).collect()
    }

    pub fn is_visible(&self, id: &str) -> Option<bool> {
        self.active.borrow().get(id).map(|e| e.visible)
    }

    pub fn selection(&self) -> SelectionContext {
        self.selection.borrow().clone()
    }

    pub fn load_state(&self, id: &str) -> LoadState {
        self.load_states.borrow().get(id).cloned().unwrap_or_default()
    }

    /// Route a UI selection event to the matching operation
    pub async fn handle_selection(&self, event: SelectionEvent) -> Outcome {
        if let Some(id) = event.control_id.strip_prefix(TOGGLE_PREFIX) {
            return self.toggle(id, event.checked.unwrap_or(true)).await;
        }

        match event.control_id.as_str() {
            TOP_LEVEL_CONTROL if event.value.is_empty() => {
                let current = self.selection.borrow().top_level.clone();
                match current {
                    Some(id) => self.clear(&id),
                    None => Outcome::Unchanged,
                }
            }
            TOP_LEVEL_CONTROL => self.select_top_level(&event.value).await,
            CHILD_CONTROL => {
                let parent = self.selection.borrow().top_level.clone();
                let Some(parent) = parent else {
                    debug!("Ignoring child selection '{}' without a top-level selection", event.value);
                    return Outcome::Unchanged;
                };
                if event.value.is_empty() {
                    self.clear_child()
                } else {
                    self.select_child(&parent, &event.value).await
                }
            }
            REFRESH_CONTROL => self.refresh(&event.value).await,
            other => {
                warn!("Ignoring event from unknown control '{}'", other);
                Outcome::Unchanged
            }
        }
    }

    /// Toggle layout visibility of an attached overlay
    pub fn set_visible(&self, id: &str, visible: bool) -> Outcome {
        let mut active = self.active.borrow_mut();
        match active.get_mut(id) {
            Some(entry) if entry.attached => {
                self.map.borrow_mut().set_layer_visibility(id, visible);
                entry.visible = visible;
                Outcome::Applied
            }
            _ => {
                warn!("Visibility change for '{}' ignored: overlay is not attached", id);
                Outcome::Unchanged
            }
        }
    }

    /// Checkbox-driven membership: checking loads and attaches once, after
    /// which checks only flip visibility.
    pub async fn toggle(&self, id: &str, checked: bool) -> Outcome {
        {
            let mut selection = self.selection.borrow_mut();
            if checked {
                selection.toggled.insert(id.to_string());
            } else {
                selection.toggled.remove(id);
            }
        }

        if self.active.borrow().contains(id) {
            return self.set_visible(id, checked);
        }
        if !checked {
            return Outcome::Unchanged;
        }

        let spec = match self.registry.resolve(id) {
            Ok(spec) => spec,
            Err(err) => {
                self.selection.borrow_mut().toggled.remove(id);
                return self.fail(err.into());
            }
        };
        self.attach_independent(spec, true).await
    }

    /// Load every top-level overlay concurrently and attach each with its
    /// default visibility
    pub async fn show_defaults(&self) -> Vec<Outcome> {
        let specs: Vec<&OverlaySpec> = self.registry.top_level().collect();
        {
            let mut selection = self.selection.borrow_mut();
            selection.toggled.extend(specs.iter().map(|s| s.id.clone()));
        }
        join_all(specs.into_iter().map(|spec| self.attach_independent(spec, spec.visible))).await
    }

    /// Make `id` the single drill-down top-level overlay
    pub async fn select_top_level(&self, id: &str) -> Outcome {
        let spec = match self.registry.resolve(id) {
            Ok(spec) => spec,
            Err(err) => return self.fail(err.into()),
        };

        {
            let mut selection = self.selection.borrow_mut();
            selection.top_level = Some(id.to_string());
            selection.child = None;
        }

        // Re-selecting the attached overlay reuses its Ready payload
        let attached = self.active.borrow().get(id).filter(|e| e.role == Role::TopLevel).map(|e| e.bounds);
        if let Some(bounds) = attached {
            self.evict_role(Role::Child, None);
            if let Some(bounds) = bounds {
                self.map.borrow_mut().fit_bounds(bounds);
            }
            return Outcome::Applied;
        }

        let payload = match self.fetch(spec).await {
            Ok(payload) => payload,
            Err(err) => {
                if !self.wants_top_level(id) {
                    return self.discard(id);
                }
                self.restore_selection();
                self.failed.borrow_mut().insert(id.to_string(), Request::TopLevel);
                return self.fail(err);
            }
        };
        if !self.wants_top_level(id) {
            return self.discard(id);
        }

        let style = LayerStyle::Uniform(spec.style.clone());
        let bounds = Bounds::of_geojson(&payload);
        if let Err(err) = self.install(spec, payload, Role::TopLevel, style, None, true) {
            self.restore_selection();
            return self.fail(err);
        }

        self.evict_role(Role::TopLevel, Some(id));
        self.evict_role(Role::Child, None);
        if let Some(bounds) = bounds {
            self.map.borrow_mut().fit_bounds(bounds);
        }
        self.notify(&format!("Showing {}", spec.label()));
        Outcome::Applied
    }

    /// Drill into the child overlay of the active top-level `parent_id`,
    /// highlighting features whose match attribute equals `key`
    pub async fn select_child(&self, parent_id: &str, key: &str) -> Outcome {
        let parent_active = self.active.borrow().top_level() == Some(parent_id);
        let parent_wanted = self.wants_top_level(parent_id);
        if !(parent_active && parent_wanted) {
            debug!("Ignoring child '{}': '{}' is not the active top-level overlay", key, parent_id);
            return Outcome::Unchanged;
        }

        let spec = match self.registry.child_of(parent_id) {
            Ok(spec) => spec,
            Err(err) => return self.fail(err.into()),
        };

        self.selection.borrow_mut().child = Some(ChildSelection {
            overlay: spec.id.clone(),
            key: key.to_string(),
        });

        let cached = self
            .active
            .borrow()
            .get(&spec.id)
            .filter(|e| e.role == Role::Child)
            .map(|e| e.overlay.payload.clone());
        let payload = match cached {
            Some(payload) => payload,
            None => match self.fetch(spec).await {
                Ok(payload) => payload,
                Err(err) => {
                    if !self.wants_child(parent_id, &spec.id, key) {
                        return self.discard(&spec.id);
                    }
                    self.restore_selection();
                    let request = Request::Child {
                        parent: parent_id.to_string(),
                        key: key.to_string(),
                    };
                    self.failed.borrow_mut().insert(spec.id.clone(), request);
                    return self.fail(err);
                }
            },
        };
        if !self.wants_child(parent_id, &spec.id, key) {
            return self.discard(&spec.id);
        }

        self.apply_child(spec, payload, key, true)
    }

    /// Detach and discard an overlay; idempotent
    pub fn clear(&self, id: &str) -> Outcome {
        {
            let mut selection = self.selection.borrow_mut();
            if selection.top_level.as_deref() == Some(id) {
                selection.top_level = None;
                selection.child = None;
            }
            if selection.child.as_ref().is_some_and(|c| c.overlay == id) {
                selection.child = None;
            }
            selection.toggled.remove(id);
        }

        let role = self.active.borrow().get(id).map(|e| e.role);
        match role {
            None => Outcome::Unchanged,
            Some(role) => {
                if role == Role::TopLevel {
                    self.evict_role(Role::Child, None);
                }
                self.evict(id);
                Outcome::Applied
            }
        }
    }

    /// Clear the drill-down child, keeping the top-level overlay
    pub fn clear_child(&self) -> Outcome {
        let child = self.selection.borrow_mut().child.take();
        let attached = self.active.borrow().child().map(|e| e.overlay.id.clone());
        match attached.or(child.map(|c| c.overlay)) {
            Some(id) => self.clear(&id),
            None => Outcome::Unchanged,
        }
    }

    /// Reload an attached overlay (payload replaced wholesale), or retry the
    /// request that last failed for `id`
    pub async fn refresh(&self, id: &str) -> Outcome {
        let attached = self.active.borrow().get(id).map(|e| (e.role, e.visible));
        let Some((role, visible)) = attached else {
            let retry = self.failed.borrow_mut().remove(id);
            return match retry {
                Some(Request::TopLevel) => self.select_top_level(id).await,
                Some(Request::Child { parent, key }) => self.select_child(&parent, &key).await,
                Some(Request::Toggle) => self.toggle(id, true).await,
                None => {
                    warn!("Nothing to refresh for '{}'", id);
                    Outcome::Unchanged
                }
            };
        };

        let spec = match self.registry.resolve(id) {
            Ok(spec) => spec,
            Err(err) => return self.fail(err.into()),
        };
        let payload = match self.fetch(spec).await {
            Ok(payload) => payload,
            Err(err) => {
                if !self.active.borrow().contains(id) {
                    return self.discard(id);
                }
                // The previous payload stays attached
                self.set_state(id, LoadState::Ready);
                return self.fail(err);
            }
        };

        match role {
            Role::Child => {
                let wanted = self.selection.borrow().child.clone();
                match wanted {
                    Some(child) if child.overlay == id && self.active.borrow().contains(id) => {
                        self.apply_child(spec, payload, &child.key, false)
                    }
                    _ => self.discard(id),
                }
            }
            Role::TopLevel | Role::Independent => {
                let wanted = match role {
                    Role::TopLevel => self.wants_top_level(id),
                    _ => self.selection.borrow().toggled.contains(id),
                };
                if !wanted || !self.active.borrow().contains(id) {
                    return self.discard(id);
                }
                let style = LayerStyle::Uniform(spec.style.clone());
                match self.install(spec, payload, role, style, None, visible) {
                    Ok(()) => {
                        self.notify(&format!("Reloaded {}", spec.label()));
                        Outcome::Applied
                    }
                    Err(err) => self.fail(err),
                }
            }
        }
    }

    async fn attach_independent(&self, spec: &OverlaySpec, visible: bool) -> Outcome {
        let payload = match self.fetch(spec).await {
            Ok(payload) => payload,
            Err(err) => {
                if !self.selection.borrow().toggled.contains(&spec.id) {
                    return self.discard(&spec.id);
                }
                self.selection.borrow_mut().toggled.remove(&spec.id);
                self.failed.borrow_mut().insert(spec.id.clone(), Request::Toggle);
                return self.fail(err);
            }
        };
        if !self.selection.borrow().toggled.contains(&spec.id) {
            return self.discard(&spec.id);
        }

        let style = LayerStyle::Uniform(spec.style.clone());
        match self.install(spec, payload, Role::Independent, style, None, visible) {
            Ok(()) => {
                self.notify(&format!("Loaded {}", spec.label()));
                Outcome::Applied
            }
            Err(err) => {
                self.selection.borrow_mut().toggled.remove(&spec.id);
                self.fail(err)
            }
        }
    }

    /// Two-tier restyle of a child payload against `key`, then fit the view
    fn apply_child(&self, spec: &OverlaySpec, payload: Rc<GeoJson>, key: &str, evict_siblings: bool) -> Outcome {
        let (tiers, matches, matched_bounds) = match spec.match_key() {
            Some(attribute) => {
                let c = classify(&payload, attribute, key);
                (c.tiers, c.matches, c.matched_bounds)
            }
            None => (vec![Tier::Dimmed; features(&payload).len()], 0, None),
        };
        let whole = Bounds::of_geojson(&payload);

        let style = LayerStyle::Tiered {
            tiers,
            highlighted: self.highlighted.clone(),
            dimmed: self.dimmed.clone(),
        };
        let visible = self.active.borrow().get(&spec.id).map_or(true, |e| e.visible);
        if let Err(err) = self.install(spec, payload, Role::Child, style, Some(key.to_string()), visible) {
            self.restore_selection();
            return self.fail(err);
        }
        if evict_siblings {
            self.evict_role(Role::Child, Some(&spec.id));
        }

        match (matches > 0, matched_bounds.or(whole)) {
            (true, Some(bounds)) => {
                self.map.borrow_mut().fit_bounds(bounds);
                self.notify(&format!("Showing {} in {}", key, spec.label()));
                Outcome::Applied
            }
            (true, None) => Outcome::Applied,
            (false, bounds) => {
                if let Some(bounds) = bounds {
                    self.map.borrow_mut().fit_bounds(bounds);
                }
                let err = OverlayError::FeatureNotFound {
                    overlay: spec.label().to_string(),
                    key: key.to_string(),
                };
                warn!("{}", err);
                self.status.borrow_mut().set_status(&err.to_string(), true);
                Outcome::Degraded(err)
            }
        }
    }

    async fn fetch(&self, spec: &OverlaySpec) -> Result<Rc<GeoJson>, OverlayError> {
        self.set_state(&spec.id, LoadState::Loading);
        match self.loader.load(&spec.id, &spec.locator).await {
            Ok(payload) => Ok(payload),
            Err(error) => {
                self.set_state(&spec.id, LoadState::Failed(error.to_string()));
                Err(OverlayError::Load {
                    id: spec.id.clone(),
                    locator: spec.locator.clone(),
                    error,
                })
            }
        }
    }

    /// Attach `payload` as overlay `spec.id`, replacing any previous payload.
    /// On failure the map and set keep whatever was attached before.
    fn install(
        &self,
        spec: &OverlaySpec,
        payload: Rc<GeoJson>,
        role: Role,
        style: LayerStyle,
        key: Option<String>,
        visible: bool,
    ) -> Result<(), OverlayError> {
        let previous = self.active.borrow_mut().remove(&spec.id);

        if let Some(prev) = &previous {
            if Rc::ptr_eq(&prev.overlay.payload, &payload) && prev.role == role && prev.style == style {
                debug!("'{}' already attached with this payload", spec.id);
                self.active.borrow_mut().insert(prev.clone());
                self.set_state(&spec.id, LoadState::Ready);
                return Ok(());
            }
            self.detach(&spec.id);
        }

        if let Err(err) = self.attach(spec, &payload, &style, visible) {
            if let Some(prev) = previous {
                match self.attach(spec, &prev.overlay.payload, &prev.style, prev.visible) {
                    Ok(()) => {
                        self.active.borrow_mut().insert(prev);
                        self.set_state(&spec.id, LoadState::Ready);
                    }
                    Err(restore) => {
                        error!("Could not restore '{}' after a failed replace: {}", spec.id, restore);
                        self.set_state(&spec.id, LoadState::Idle);
                    }
                }
            } else {
                self.set_state(&spec.id, LoadState::Idle);
            }
            return Err(err);
        }

        let bounds = Bounds::of_geojson(&payload);
        self.active.borrow_mut().insert(ActiveOverlay {
            overlay: LoadedOverlay {
                id: spec.id.clone(),
                payload,
                state: LoadState::Ready,
            },
            role,
            attached: true,
            visible,
            style,
            bounds,
            key,
        });
        self.set_state(&spec.id, LoadState::Ready);
        self.failed.borrow_mut().remove(&spec.id);
        info!("Attached overlay '{}'", spec.id);
        Ok(())
    }

    /// Source + layer + handlers, all or nothing
    fn attach(&self, spec: &OverlaySpec, payload: &GeoJson, style: &LayerStyle, visible: bool) -> Result<(), OverlayError> {
        let map_error = |err: anyhow::Error| OverlayError::Map {
            id: spec.id.clone(),
            detail: format!("{:#}", err),
        };

        let mut map = self.map.borrow_mut();
        map.add_source(&spec.id, payload).map_err(map_error)?;
        if let Err(err) = map.add_overlay_layer(&spec.id, &spec.id, style, spec.before.as_deref()) {
            map.remove_source(&spec.id);
            return Err(map_error(err));
        }
        if !visible {
            map.set_layer_visibility(&spec.id, false);
        }

        if spec.interactive {
            let interaction = FeatureInteraction::for_overlay(spec);
            map.on_feature_click(&spec.id, Box::new(move |click: &FeatureClick| Some(interaction.popup(click))));
            map.on_feature_hover(&spec.id, Box::new(FeatureInteraction::cursor));
        }
        Ok(())
    }

    fn detach(&self, id: &str) {
        let mut map = self.map.borrow_mut();
        map.remove_layer(id);
        map.remove_source(id);
    }

    fn evict(&self, id: &str) {
        if self.active.borrow_mut().remove(id).is_some() {
            self.detach(id);
            self.set_state(id, LoadState::Idle);
            debug!("Evicted overlay '{}'", id);
        }
    }

    /// Evict every overlay with `role`, except `keep`
    fn evict_role(&self, role: Role, keep: Option<&str>) {
        let ids: Vec<String> = self
            .active
            .borrow()
            .with_role(role)
            .filter(|id| Some(*id) != keep)
            .map(str::to_string)
            .collect();
        for id in ids {
            self.evict(&id);
        }
    }

    fn wants_top_level(&self, id: &str) -> bool {
        self.selection.borrow().top_level.as_deref() == Some(id)
    }

    fn wants_child(&self, parent_id: &str, overlay: &str, key: &str) -> bool {
        let selection = self.selection.borrow();
        selection.top_level.as_deref() == Some(parent_id)
            && selection
                .child
                .as_ref()
                .is_some_and(|c| c.overlay == overlay && c.key == key)
    }

    /// Point the selection back at what is actually attached
    fn restore_selection(&self) {
        let active = self.active.borrow();
        let mut selection = self.selection.borrow_mut();
        selection.top_level = active.top_level().map(str::to_string);
        selection.child = active.child().and_then(|e| {
            e.key.as_ref().map(|key| ChildSelection {
                overlay: e.overlay.id.clone(),
                key: key.clone(),
            })
        });
    }

    fn discard(&self, id: &str) -> Outcome {
        debug!("Discarding stale response for '{}'", id);
        let state = if self.active.borrow().contains(id) {
            LoadState::Ready
        } else {
            LoadState::Idle
        };
        self.set_state(id, state);
        Outcome::Discarded
    }

    /// Record a load state transition, mirrored onto the attached entry
    fn set_state(&self, id: &str, state: LoadState) {
        if let Some(entry) = self.active.borrow_mut().get_mut(id) {
            entry.overlay.state = state.clone();
        }
        self.load_states.borrow_mut().insert(id.to_string(), state);
    }

    fn notify(&self, message: &str) {
        info!("{}", message);
        self.status.borrow_mut().set_status(message, false);
    }

    fn fail(&self, err: OverlayError) -> Outcome {
        error!("{}", err);
        self.status.borrow_mut().set_status(&err.to_string(), true);
        Outcome::Failed(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::loader::LoadErrorKind;
    use crate::overlay::testing::{
        feature_collection, square_bounds, MapCall, RecordingMap, RecordingStatus, TestFetcher,
    };
    use crate::service::{LngLat, TransportError};
    use futures::executor::block_on;
    use serde_json::json;

    type Manager = OverlayManager<Rc<RefCell<RecordingMap>>, TestFetcher, Rc<RefCell<RecordingStatus>>>;

    struct Harness {
        manager: Manager,
        map: Rc<RefCell<RecordingMap>>,
        status: Rc<RefCell<RecordingStatus>>,
        fetcher: TestFetcher,
    }

    fn registry() -> OverlayRegistry {
        OverlayRegistry::new(vec![
            OverlaySpec::new("india", "india.geojson", Paint::line("#000000", 2.0)).with_popup("NAME_0"),
            OverlaySpec::new("states", "states.geojson", Paint::line("#3333cc", 1.5))
                .with_parent("india")
                .with_popup("NAME_1")
                .with_note("Odisha", "Cyclone impact zones show infrastructure vulnerability."),
            OverlaySpec::new("madhya-pradesh", "mp.geojson", Paint::line("#006600", 1.0)),
            OverlaySpec::new("rivers", "rivers.geojson", Paint::line("#0000ff", 1.0))
                .with_popup("NAME")
                .with_aliases(&["name"]),
        ])
        .unwrap()
    }

    fn harness(fetcher: TestFetcher) -> Harness {
        let map = RecordingMap::shared();
        let status = RecordingStatus::shared();
        let manager = OverlayManager::new(Rc::new(registry()), fetcher.clone(), map.clone(), status.clone());
        Harness {
            manager,
            map,
            status,
            fetcher,
        }
    }

    fn india_body() -> Vec<u8> {
        feature_collection(&[("NAME_0", "India")])
    }

    fn states_body() -> Vec<u8> {
        feature_collection(&[("NAME_1", "Bihar"), ("NAME_1", "Odisha"), ("NAME_1", "Kerala")])
    }

    fn drill_down() -> Harness {
        harness(
            TestFetcher::new()
                .respond("india.geojson", india_body())
                .respond("states.geojson", states_body())
                .respond("mp.geojson", feature_collection(&[("NAME_1", "Madhya Pradesh")]))
                .respond("rivers.geojson", feature_collection(&[("NAME", "Ganga")])),
        )
    }

    fn count(map: &RecordingMap, pred: impl Fn(&MapCall) -> bool) -> usize {
        map.calls.iter().filter(|c| pred(c)).count()
    }

    fn tiers(style: Option<LayerStyle>) -> Vec<Tier> {
        match style {
            Some(LayerStyle::Tiered { tiers, .. }) => tiers,
            other => panic!("expected a tiered style, got {:?}", other),
        }
    }

    #[test]
    fn test_select_top_level_twice_is_idempotent() {
        let h = drill_down();
        assert_eq!(block_on(h.manager.select_top_level("india")), Outcome::Applied);
        assert_eq!(block_on(h.manager.select_top_level("india")), Outcome::Applied);

        assert_eq!(h.manager.active_ids(), ["india"]);
        assert_eq!(h.manager.load_state("india"), LoadState::Ready);
        assert_eq!(h.fetcher.calls("india.geojson"), 1);
        assert_eq!(count(&h.map.borrow(), |c| matches!(c, MapCall::AddSource(_))), 1);
        assert_eq!(h.map.borrow().fits(), [square_bounds(0), square_bounds(0)]);
    }

    #[test]
    fn test_concurrent_duplicate_selection_attaches_once() {
        let h = harness(TestFetcher::new());
        let gate = h.fetcher.gate("india.geojson");

        let (a, b, _) = block_on(async {
            futures::join!(
                h.manager.select_top_level("india"),
                h.manager.select_top_level("india"),
                async { gate.open(india_body()) }
            )
        });

        assert_eq!((a, b), (Outcome::Applied, Outcome::Applied));
        assert_eq!(h.fetcher.calls("india.geojson"), 1);
        assert_eq!(count(&h.map.borrow(), |c| matches!(c, MapCall::AddLayer { .. })), 1);
        assert_eq!(h.manager.active_ids(), ["india"]);
    }

    #[test]
    fn test_switching_top_level_evicts_previous() {
        let h = drill_down();
        block_on(h.manager.select_top_level("india"));
        block_on(h.manager.select_top_level("madhya-pradesh"));

        assert_eq!(h.manager.active_ids(), ["madhya-pradesh"]);
        assert_eq!(h.map.borrow().sources, ["madhya-pradesh"]);
        assert_eq!(h.manager.load_state("india"), LoadState::Idle);
    }

    #[test]
    fn test_stale_top_level_response_is_discarded() {
        let h = drill_down();
        let gate = h.fetcher.gate("india.geojson");

        let (india, mp) = block_on(async {
            futures::join!(h.manager.select_top_level("india"), async {
                let outcome = h.manager.select_top_level("madhya-pradesh").await;
                gate.open(india_body());
                outcome
            })
        });

        assert_eq!(india, Outcome::Discarded);
        assert_eq!(mp, Outcome::Applied);
        assert_eq!(h.manager.active_ids(), ["madhya-pradesh"]);
        assert_eq!(h.map.borrow().sources, ["madhya-pradesh"]);
        assert_eq!(h.manager.load_state("india"), LoadState::Idle);
        assert!(h.status.borrow().errors().is_empty());
    }

    #[test]
    fn test_not_found_leaves_map_untouched() {
        let h = harness(TestFetcher::new().fail("mp.geojson", TransportError::Status(404)));

        match block_on(h.manager.select_top_level("madhya-pradesh")) {
            Outcome::Failed(OverlayError::Load { id, error, .. }) => {
                assert_eq!(id, "madhya-pradesh");
                assert_eq!(error.kind, LoadErrorKind::NotOk);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(h.manager.active().is_empty());
        assert!(h.map.borrow().calls.is_empty());
        assert_eq!(h.status.borrow().errors().len(), 1);
        assert!(matches!(h.manager.load_state("madhya-pradesh"), LoadState::Failed(_)));
        assert_eq!(h.manager.selection().top_level, None);
    }

    #[test]
    fn test_failed_selection_keeps_previous_top_level() {
        let h = drill_down();
        h.fetcher.clone().fail("mp.geojson", TransportError::Network("offline".into()));

        block_on(h.manager.select_top_level("india"));
        let outcome = block_on(h.manager.select_top_level("madhya-pradesh"));

        assert!(matches!(outcome, Outcome::Failed(_)));
        assert_eq!(h.manager.active_ids(), ["india"]);
        assert_eq!(h.manager.selection().top_level.as_deref(), Some("india"));
    }

    #[test]
    fn test_unknown_id_fails_without_fetching() {
        let h = drill_down();
        let outcome = block_on(h.manager.select_top_level("atlantis"));
        assert_eq!(outcome, Outcome::Failed(OverlayError::NotFoundInRegistry("atlantis".into())));
        assert_eq!(h.fetcher.total_calls(), 0);
    }

    #[test]
    fn test_child_without_active_parent_is_noop() {
        let h = drill_down();
        assert_eq!(block_on(h.manager.select_child("india", "Odisha")), Outcome::Unchanged);
        assert_eq!(h.fetcher.total_calls(), 0);
        assert!(h.map.borrow().calls.is_empty());
    }

    #[test]
    fn test_child_single_match_highlights_and_fits() {
        let h = drill_down();
        block_on(h.manager.select_top_level("india"));
        assert_eq!(block_on(h.manager.select_child("india", "Odisha")), Outcome::Applied);

        let map = h.map.borrow();
        assert_eq!(tiers(map.last_style("states")), [Tier::Dimmed, Tier::Highlighted, Tier::Dimmed]);
        assert_eq!(map.fits().last(), Some(&square_bounds(1)));
        assert_eq!(map.sources, ["india", "states"]);
        assert_eq!(
            h.manager.selection().child,
            Some(ChildSelection {
                overlay: "states".into(),
                key: "Odisha".into()
            })
        );
    }

    #[test]
    fn test_child_without_match_dims_all_and_fits_collection() {
        let h = drill_down();
        block_on(h.manager.select_top_level("india"));

        match block_on(h.manager.select_child("india", "Atlantis")) {
            Outcome::Degraded(OverlayError::FeatureNotFound { key, .. }) => assert_eq!(key, "Atlantis"),
            other => panic!("unexpected {:?}", other),
        }

        let map = h.map.borrow();
        assert!(tiers(map.last_style("states")).iter().all(|t| *t == Tier::Dimmed));
        assert_eq!(map.fits().last(), Some(&square_bounds(0).union(square_bounds(2))));
        let status = h.status.borrow();
        let (message, _) = status.last().unwrap();
        assert!(message.contains("Atlantis"));
        assert_eq!(h.manager.active_ids(), ["india", "states"]);
    }

    #[test]
    fn test_changing_child_key_restyles_cached_payload() {
        let h = drill_down();
        block_on(h.manager.select_top_level("india"));
        block_on(h.manager.select_child("india", "Odisha"));
        block_on(h.manager.select_child("india", "Kerala"));

        assert_eq!(h.fetcher.calls("states.geojson"), 1);
        let map = h.map.borrow();
        assert_eq!(tiers(map.last_style("states")), [Tier::Dimmed, Tier::Dimmed, Tier::Highlighted]);
        assert_eq!(map.layers, ["india", "states"]);
    }

    #[test]
    fn test_reselecting_top_level_evicts_child() {
        let h = drill_down();
        block_on(h.manager.select_top_level("india"));
        block_on(h.manager.select_child("india", "Odisha"));
        assert_eq!(block_on(h.manager.select_top_level("india")), Outcome::Applied);

        assert_eq!(h.fetcher.calls("india.geojson"), 1);
        assert_eq!(h.manager.active_ids(), ["india"]);
        assert_eq!(h.manager.selection().child, None);
        assert_eq!(h.map.borrow().layers, ["india"]);
    }

    #[test]
    fn test_clear_is_idempotent_and_takes_child() {
        let h = drill_down();
        block_on(h.manager.select_top_level("india"));
        block_on(h.manager.select_child("india", "Odisha"));

        assert_eq!(h.manager.clear("india"), Outcome::Applied);
        assert!(h.manager.active().is_empty());
        assert!(h.map.borrow().sources.is_empty());
        assert_eq!(h.manager.selection(), SelectionContext::default());

        let calls = h.map.borrow().calls.len();
        assert_eq!(h.manager.clear("india"), Outcome::Unchanged);
        assert_eq!(h.map.borrow().calls.len(), calls);
    }

    #[test]
    fn test_layer_failure_rolls_back_source() {
        let h = drill_down();
        h.map.borrow_mut().fail_layer = Some("india".into());

        let outcome = block_on(h.manager.select_top_level("india"));

        assert!(matches!(outcome, Outcome::Failed(OverlayError::Map { .. })));
        assert!(h.map.borrow().sources.is_empty());
        assert!(h.manager.active().is_empty());
        assert_eq!(h.manager.selection().top_level, None);
        assert_eq!(h.status.borrow().errors().len(), 1);
    }

    #[test]
    fn test_rapid_visibility_toggles_settle_on_last() {
        let h = drill_down();
        assert_eq!(block_on(h.manager.toggle("rivers", true)), Outcome::Applied);

        for visible in [false, true, false] {
            assert_eq!(h.manager.set_visible("rivers", visible), Outcome::Applied);
        }

        assert_eq!(h.manager.is_visible("rivers"), Some(false));
        assert_eq!(h.fetcher.calls("rivers.geojson"), 1);
        let map = h.map.borrow();
        assert_eq!(map.calls.last(), Some(&MapCall::Visibility("rivers".into(), false)));
    }

    #[test]
    fn test_set_visible_on_unattached_overlay_is_noop() {
        let h = drill_down();
        assert_eq!(h.manager.set_visible("rivers", true), Outcome::Unchanged);
        assert!(h.map.borrow().calls.is_empty());
    }

    #[test]
    fn test_toggle_off_before_load_discards_response() {
        let h = harness(TestFetcher::new());
        let gate = h.fetcher.gate("rivers.geojson");

        let (on, off) = block_on(async {
            futures::join!(h.manager.toggle("rivers", true), async {
                let outcome = h.manager.toggle("rivers", false).await;
                gate.open(feature_collection(&[("NAME", "Ganga")]));
                outcome
            })
        });

        assert_eq!((on, off), (Outcome::Discarded, Outcome::Unchanged));
        assert!(h.manager.active().is_empty());
        assert!(h.map.borrow().calls.is_empty());
    }

    #[test]
    fn test_show_defaults_respects_default_visibility() {
        let mut hidden = OverlaySpec::new("rivers", "rivers.geojson", Paint::line("#0000ff", 1.0));
        hidden.visible = false;
        let registry = OverlayRegistry::new(vec![
            OverlaySpec::new("india", "india.geojson", Paint::line("#000000", 2.0)),
            hidden,
        ])
        .unwrap();
        let fetcher = TestFetcher::new()
            .respond("india.geojson", india_body())
            .respond("rivers.geojson", feature_collection(&[("NAME", "Ganga")]));
        let map = RecordingMap::shared();
        let manager = OverlayManager::new(Rc::new(registry), fetcher, map.clone(), RecordingStatus::shared());

        let outcomes = block_on(manager.show_defaults());

        assert_eq!(outcomes, [Outcome::Applied, Outcome::Applied]);
        assert_eq!(manager.is_visible("india"), Some(true));
        assert_eq!(manager.is_visible("rivers"), Some(false));
        assert!(map.borrow().calls.contains(&MapCall::Visibility("rivers".into(), false)));
    }

    #[test]
    fn test_refresh_replaces_payload() {
        let h = drill_down();
        block_on(h.manager.select_top_level("india"));
        h.fetcher
            .clone()
            .respond("india.geojson", feature_collection(&[("NAME_0", "India"), ("NAME_0", "Bharat")]));

        assert_eq!(block_on(h.manager.refresh("india")), Outcome::Applied);

        let map = h.map.borrow();
        match &map.payloads["india"] {
            GeoJson::FeatureCollection(fc) => assert_eq!(fc.features.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(count(&map, |c| matches!(c, MapCall::RemoveSource(_))), 1);
        assert_eq!(map.sources, ["india"]);
    }

    #[test]
    fn test_refresh_retries_failed_selection() {
        let h = harness(TestFetcher::new().fail("mp.geojson", TransportError::Status(503)));
        assert!(matches!(block_on(h.manager.select_top_level("madhya-pradesh")), Outcome::Failed(_)));

        h.fetcher
            .clone()
            .respond("mp.geojson", feature_collection(&[("NAME_1", "Madhya Pradesh")]));
        assert_eq!(block_on(h.manager.refresh("madhya-pradesh")), Outcome::Applied);
        assert_eq!(h.manager.active_ids(), ["madhya-pradesh"]);
        assert_eq!(block_on(h.manager.refresh("nothing")), Outcome::Unchanged);
    }

    #[test]
    fn test_stale_child_response_is_discarded() {
        let h = drill_down();
        block_on(h.manager.select_top_level("india"));
        let gate = h.fetcher.gate("states.geojson");

        let (child, mp) = block_on(async {
            futures::join!(h.manager.select_child("india", "Odisha"), async {
                let outcome = h.manager.select_top_level("madhya-pradesh").await;
                gate.open(states_body());
                outcome
            })
        });

        assert_eq!(child, Outcome::Discarded);
        assert_eq!(mp, Outcome::Applied);
        assert!(h.manager.active().child().is_none());
        assert_eq!(h.manager.active_ids(), ["madhya-pradesh"]);
        assert!(!h.map.borrow().calls.contains(&MapCall::AddSource("states".into())));
        assert_eq!(h.manager.load_state("states"), LoadState::Idle);
        assert_eq!(h.manager.selection().child, None);
    }

    #[test]
    fn test_stale_child_failure_is_not_reported() {
        let h = drill_down();
        block_on(h.manager.select_top_level("india"));
        let gate = h.fetcher.gate("states.geojson");

        let (child, _) = block_on(async {
            futures::join!(h.manager.select_child("india", "Odisha"), async {
                let outcome = h.manager.select_top_level("madhya-pradesh").await;
                gate.fail(TransportError::Status(500));
                outcome
            })
        });

        assert_eq!(child, Outcome::Discarded);
        assert!(h.status.borrow().errors().is_empty());
        assert!(h.manager.active().child().is_none());
        assert_eq!(h.manager.load_state("states"), LoadState::Idle);
        assert_eq!(h.manager.selection().top_level.as_deref(), Some("madhya-pradesh"));
    }

    #[test]
    fn test_failed_refresh_of_cleared_overlay_is_idle() {
        let h = drill_down();
        block_on(h.manager.select_top_level("india"));
        let gate = h.fetcher.gate("india.geojson");

        let (refresh, clear) = block_on(async {
            futures::join!(h.manager.refresh("india"), async {
                let outcome = h.manager.clear("india");
                gate.fail(TransportError::Network("offline".into()));
                outcome
            })
        });

        assert_eq!((refresh, clear), (Outcome::Discarded, Outcome::Applied));
        assert_eq!(h.manager.load_state("india"), LoadState::Idle);
        assert!(h.manager.active().is_empty());
        assert!(h.status.borrow().errors().is_empty());
    }

    #[test]
    fn test_failed_refresh_keeps_attached_payload_ready() {
        let h = drill_down();
        block_on(h.manager.select_top_level("india"));
        h.fetcher.clone().fail("india.geojson", TransportError::Status(503));

        assert!(matches!(block_on(h.manager.refresh("india")), Outcome::Failed(_)));
        assert_eq!(h.manager.load_state("india"), LoadState::Ready);
        assert_eq!(h.manager.active_ids(), ["india"]);
        assert_eq!(h.status.borrow().errors().len(), 1);
    }

    #[test]
    fn test_attached_entry_tracks_load_state() {
        let h = drill_down();
        block_on(h.manager.select_top_level("india"));
        let state = |h: &Harness| h.manager.active().get("india").map(|e| e.overlay.state.clone());
        assert_eq!(state(&h), Some(LoadState::Ready));

        let gate = h.fetcher.gate("india.geojson");
        let (refresh, during) = block_on(async {
            futures::join!(h.manager.refresh("india"), async {
                let during = state(&h);
                gate.open(india_body());
                during
            })
        });

        assert_eq!(refresh, Outcome::Applied);
        assert_eq!(during, Some(LoadState::Loading));
        assert_eq!(state(&h), Some(LoadState::Ready));
    }

    #[test]
    fn test_registry_errors_keep_their_message() {
        let duplicate: OverlayError = RegistryError::DuplicateId("india".into()).into();
        assert_eq!(duplicate, OverlayError::Registry(RegistryError::DuplicateId("india".into())));
        assert_eq!(duplicate.to_string(), "Invalid overlay registry: overlay id 'india' is registered twice");

        let missing: OverlayError = RegistryError::NotFound("atlantis".into()).into();
        assert_eq!(missing, OverlayError::NotFoundInRegistry("atlantis".into()));
    }

    #[test]
    fn test_click_on_child_shows_popup_with_note() {
        let h = drill_down();
        block_on(h.manager.select_top_level("india"));
        block_on(h.manager.select_child("india", "Odisha"));

        let props = json!({"NAME_1": "Odisha"}).as_object().cloned();
        let at = LngLat { lon: 72.5, lat: 20.5 };
        assert!(h.map.borrow_mut().click("states", props, at));

        let map = h.map.borrow();
        match map.calls.last() {
            Some(MapCall::Popup(popup_at, html)) => {
                assert_eq!(*popup_at, at);
                assert!(html.contains("NAME_1: Odisha"));
                assert!(html.contains("Cyclone impact zones"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_hover_switches_cursor() {
        let h = drill_down();
        block_on(h.manager.select_top_level("india"));
        h.map.borrow_mut().hover("india", crate::service::Hover::Enter);
        h.map.borrow_mut().hover("india", crate::service::Hover::Leave);

        let map = h.map.borrow();
        let cursors: Vec<_> = map
            .calls
            .iter()
            .filter_map(|c| match c {
                MapCall::Cursor(cursor) => Some(*cursor),
                _ => None,
            })
            .collect();
        assert_eq!(cursors, [crate::service::Cursor::Pointer, crate::service::Cursor::Default]);
    }

    #[test]
    fn test_handle_selection_routes_controls() {
        let h = drill_down();

        let outcome = block_on(h.manager.handle_selection(SelectionEvent::select(TOP_LEVEL_CONTROL, "india")));
        assert_eq!(outcome, Outcome::Applied);
        let outcome = block_on(h.manager.handle_selection(SelectionEvent::select(CHILD_CONTROL, "Odisha")));
        assert_eq!(outcome, Outcome::Applied);
        let outcome = block_on(h.manager.handle_selection(SelectionEvent::select(CHILD_CONTROL, "")));
        assert_eq!(outcome, Outcome::Applied);
        assert_eq!(h.manager.active_ids(), ["india"]);

        let outcome = block_on(h.manager.handle_selection(SelectionEvent::toggle("rivers", true)));
        assert_eq!(outcome, Outcome::Applied);
        assert_eq!(h.manager.is_visible("rivers"), Some(true));

        let outcome = block_on(h.manager.handle_selection(SelectionEvent::select("zoom", "3")));
        assert_eq!(outcome, Outcome::Unchanged);

        let outcome = block_on(h.manager.handle_selection(SelectionEvent::select(TOP_LEVEL_CONTROL, "")));
        assert_eq!(outcome, Outcome::Applied);
        assert_eq!(h.manager.active_ids(), ["rivers"]);
    }
}
