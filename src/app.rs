use std::cell::RefCell;
use std::rc::Rc;

use overlay_map::config::{Mode, View};
use overlay_map::data::SourceFetcher;
use overlay_map::map::{TerminalMap, Viewport};
use overlay_map::overlay::{
    LoadState, OverlayManager, SelectionEvent, CHILD_CONTROL, REFRESH_CONTROL, TOP_LEVEL_CONTROL,
};
use overlay_map::service::StatusSink;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::widgets::{Block, Borders};

pub type SharedMap = Rc<RefCell<TerminalMap>>;
pub type SharedStatus = Rc<RefCell<StatusLine>>;
pub type Controller = OverlayManager<SharedMap, SourceFetcher, SharedStatus>;

const SIDEBAR_WIDTH: u16 = 28;

/// Last status message shown in the status bar
#[derive(Debug, Default)]
pub struct StatusLine {
    pub message: String,
    pub is_error: bool,
}

impl StatusSink for StatusLine {
    fn set_status(&mut self, message: &str, is_error: bool) {
        self.message = message.to_string();
        self.is_error = is_error;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Marker {
    Checked,
    Unchecked,
    Selected,
    Unselected,
}

/// One selectable sidebar line and the event it emits when activated
#[derive(Clone, Debug, PartialEq)]
pub struct SidebarRow {
    pub label: String,
    pub marker: Marker,
    pub indent: bool,
    pub overlay: String,
    pub state: LoadState,
    pub event: SelectionEvent,
}

/// Screen regions; `map_inner` is the braille drawing area inside the border
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AppLayout {
    pub sidebar: Rect,
    pub map: Rect,
    pub map_inner: Rect,
    pub status: Rect,
}

impl AppLayout {
    pub fn new(area: Rect) -> Self {
        let rows = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(3), Constraint::Length(1)])
            .split(area);
        let columns = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Length(SIDEBAR_WIDTH), Constraint::Min(10)])
            .split(rows[0]);

        Self {
            sidebar: columns[0],
            map: columns[1],
            map_inner: Block::default().borders(Borders::ALL).inner(columns[1]),
            status: rows[1],
        }
    }
}

/// Application state
pub struct App {
    pub controller: Rc<Controller>,
    pub map: SharedMap,
    pub status: SharedStatus,
    pub mode: Mode,
    pub home: View,
    /// Highlighted sidebar row
    pub selected: usize,
    pub should_quit: bool,
    /// Last mouse position for drag tracking
    pub last_mouse: Option<(u16, u16)>,
    /// Current mouse position for cursor marker
    pub mouse_pos: Option<(u16, u16)>,
    /// Press position, cleared once the press turns into a drag
    press: Option<(u16, u16)>,
    layout: AppLayout,
}

impl App {
    pub fn new(controller: Rc<Controller>, map: SharedMap, status: SharedStatus, mode: Mode, home: View) -> Self {
        Self {
            controller,
            map,
            status,
            mode,
            home,
            selected: 0,
            should_quit: false,
            last_mouse: None,
            mouse_pos: None,
            press: None,
            layout: AppLayout::default(),
        }
    }

    pub fn layout(&self) -> AppLayout {
        self.layout
    }

    /// Recompute screen regions; the viewport gets 2x4 braille pixels per cell
    pub fn resize(&mut self, width: u16, height: u16) {
        self.layout = AppLayout::new(Rect::new(0, 0, width, height));
        let inner = self.layout.map_inner;
        self.map
            .borrow_mut()
            .resize(inner.width as usize * 2, inner.height as usize * 4);
    }

    pub fn reset_view(&mut self) {
        let mut map = self.map.borrow_mut();
        let (width, height) = (map.viewport.width, map.viewport.height);
        map.viewport = Viewport::new(self.home.lon, self.home.lat, self.home.zoom, width, height);
        map.close_popup();
    }

    pub fn pan(&mut self, dx: i32, dy: i32) {
        self.map.borrow_mut().viewport.pan(dx, dy);
    }

    pub fn zoom_in(&mut self) {
        self.map.borrow_mut().viewport.zoom_in();
    }

    pub fn zoom_out(&mut self) {
        self.map.borrow_mut().viewport.zoom_out();
    }

    pub fn zoom_in_at(&mut self, col: u16, row: u16) {
        if let Some((px, py)) = self.map_pixel(col, row) {
            self.map.borrow_mut().viewport.zoom_in_at(px, py);
        }
    }

    pub fn zoom_out_at(&mut self, col: u16, row: u16) {
        if let Some((px, py)) = self.map_pixel(col, row) {
            self.map.borrow_mut().viewport.zoom_out_at(px, py);
        }
    }

    pub fn quit(&mut self) {
        self.should_quit = true;
    }

    pub fn zoom_level(&self) -> String {
        format!("{:.1}x", self.map.borrow().viewport.zoom)
    }

    pub fn center_coords(&self) -> String {
        let map = self.map.borrow();
        let viewport = &map.viewport;
        format!(
            "{:.1}°{}, {:.1}°{}",
            viewport.center_lat.abs(),
            if viewport.center_lat >= 0.0 { "N" } else { "S" },
            viewport.center_lon.abs(),
            if viewport.center_lon >= 0.0 { "E" } else { "W" }
        )
    }

    /// Terminal cell to braille pixel inside the map, `None` outside it
    pub fn map_pixel(&self, col: u16, row: u16) -> Option<(i32, i32)> {
        let inner = self.layout.map_inner;
        let inside = col >= inner.x && col < inner.x + inner.width && row >= inner.y && row < inner.y + inner.height;
        inside.then(|| ((col - inner.x) as i32 * 2, (row - inner.y) as i32 * 4))
    }

    /// Sidebar row index under a terminal cell
    pub fn sidebar_row_at(&self, col: u16, row: u16) -> Option<usize> {
        let sidebar = self.layout.sidebar;
        if col <= sidebar.x || col + 1 >= sidebar.x + sidebar.width || row <= sidebar.y {
            return None;
        }
        let index = (row - sidebar.y - 1) as usize;
        (index < self.rows().len()).then_some(index)
    }

    pub fn set_mouse_pos(&mut self, col: u16, row: u16) {
        self.mouse_pos = Some((col, row));
    }

    /// Mouse position in braille pixel coordinates (for the cursor marker)
    pub fn mouse_pixel_pos(&self) -> Option<(i32, i32)> {
        self.mouse_pos.and_then(|(col, row)| self.map_pixel(col, row))
    }

    pub fn press(&mut self, col: u16, row: u16) {
        self.last_mouse = Some((col, row));
        self.press = Some((col, row));
    }

    pub fn handle_drag(&mut self, x: u16, y: u16) {
        if let Some((last_x, last_y)) = self.last_mouse {
            let dx = last_x as i32 - x as i32;
            let dy = last_y as i32 - y as i32;
            // Less sensitive when zoomed out
            let zoom = self.map.borrow().viewport.zoom;
            let scale = if zoom < 2.0 {
                2
            } else if zoom < 4.0 {
                3
            } else {
                4
            };
            self.pan(dx * scale, dy * scale);
        }
        if self.press != Some((x, y)) {
            self.press = None;
        }
        self.last_mouse = Some((x, y));
    }

    /// End a press; one that never moved is a click on the map
    pub fn release(&mut self, col: u16, row: u16) {
        if self.press.take() == Some((col, row)) {
            if let Some((px, py)) = self.map_pixel(col, row) {
                self.map.borrow_mut().click_at(px, py);
            }
        }
        self.last_mouse = None;
    }

    pub fn hover(&mut self, col: u16, row: u16) {
        if let Some((px, py)) = self.map_pixel(col, row) {
            self.map.borrow_mut().hover_at(px, py);
        }
    }

    pub fn close_popup(&mut self) -> bool {
        let mut map = self.map.borrow_mut();
        let open = map.popup().is_some();
        map.close_popup();
        open
    }

    /// Sidebar rows for the current mode and selection
    pub fn rows(&self) -> Vec<SidebarRow> {
        let controller = &self.controller;
        let registry = controller.registry();
        let selection = controller.selection();

        match self.mode {
            Mode::Independent => registry
                .top_level()
                .map(|spec| {
                    let checked = controller
                        .is_visible(&spec.id)
                        .unwrap_or_else(|| selection.toggled.contains(&spec.id));
                    SidebarRow {
                        label: spec.label().to_string(),
                        marker: if checked { Marker::Checked } else { Marker::Unchecked },
                        indent: false,
                        overlay: spec.id.clone(),
                        state: controller.load_state(&spec.id),
                        event: SelectionEvent::toggle(&spec.id, !checked),
                    }
                })
                .collect(),
            Mode::DrillDown => {
                let mut rows = Vec::new();
                for spec in registry.top_level() {
                    let chosen = selection.top_level.as_deref() == Some(spec.id.as_str());
                    rows.push(SidebarRow {
                        label: spec.label().to_string(),
                        marker: if chosen { Marker::Selected } else { Marker::Unselected },
                        indent: false,
                        overlay: spec.id.clone(),
                        state: controller.load_state(&spec.id),
                        event: SelectionEvent::select(TOP_LEVEL_CONTROL, &spec.id),
                    });
                    if !chosen {
                        continue;
                    }

                    let Ok(child) = registry.child_of(&spec.id) else {
                        continue;
                    };
                    for key in &child.choices {
                        let active = selection.child.as_ref().is_some_and(|c| &c.key == key);
                        rows.push(SidebarRow {
                            label: key.clone(),
                            marker: if active { Marker::Selected } else { Marker::Unselected },
                            indent: true,
                            overlay: child.id.clone(),
                            state: if active { controller.load_state(&child.id) } else { LoadState::Idle },
                            // Activating the active key clears the drill-down
                            event: SelectionEvent::select(CHILD_CONTROL, if active { "" } else { key }),
                        });
                    }
                }
                rows
            }
        }
    }

    pub fn move_selection(&mut self, delta: i32) {
        let len = self.rows().len();
        if len == 0 {
            self.selected = 0;
            return;
        }
        self.selected = (self.selected as i32 + delta).rem_euclid(len as i32) as usize;
    }

    /// Event for the highlighted row
    pub fn activate(&self) -> Option<SelectionEvent> {
        self.rows().get(self.selected).map(|row| row.event.clone())
    }

    pub fn refresh_selected(&self) -> Option<SelectionEvent> {
        self.rows()
            .get(self.selected)
            .map(|row| SelectionEvent::select(REFRESH_CONTROL, &row.overlay))
    }

    pub fn clear_selection(&self) -> Option<SelectionEvent> {
        (self.mode == Mode::DrillDown).then(|| SelectionEvent::select(TOP_LEVEL_CONTROL, ""))
    }
}
