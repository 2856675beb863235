use crate::app::{App, Marker};
use overlay_map::braille::BrailleCanvas;
use overlay_map::map::{MapPopup, RenderedLayer, Viewport};
use overlay_map::overlay::LoadState;
use overlay_map::service::Cursor;
use ratatui::{
    buffer::Buffer,
    layout::Rect,
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Paragraph, Widget, Wrap},
    Frame,
};

const POPUP_WIDTH: u16 = 36;

/// Render the UI
pub fn render(frame: &mut Frame, app: &App) {
    let layout = app.layout();

    render_sidebar(frame, app, layout.sidebar);
    render_map(frame, app, layout.map);
    render_status_bar(frame, app, layout.status);
}

fn render_sidebar(frame: &mut Frame, app: &App, area: Rect) {
    let lines: Vec<Line> = app
        .rows()
        .into_iter()
        .enumerate()
        .map(|(i, row)| {
            let marker = match row.marker {
                Marker::Checked => "[x]",
                Marker::Unchecked => "[ ]",
                Marker::Selected => "(•)",
                Marker::Unselected => "( )",
            };
            let (suffix, suffix_color) = match row.state {
                LoadState::Loading => (" …", Color::Yellow),
                LoadState::Failed(_) => (" !", Color::Red),
                LoadState::Idle | LoadState::Ready => ("", Color::Reset),
            };

            let mut style = Style::default().fg(if row.indent { Color::Gray } else { Color::White });
            if i == app.selected {
                style = style.add_modifier(Modifier::REVERSED);
            }

            Line::from(vec![
                Span::styled(format!("{}{} {}", if row.indent { "  " } else { "" }, marker, row.label), style),
                Span::styled(suffix, Style::default().fg(suffix_color)),
            ])
        })
        .collect();

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray))
        .title(Span::styled(
            " Overlays ",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ));
    frame.render_widget(Paragraph::new(lines).block(block), area);
}

fn render_map(frame: &mut Frame, app: &App, area: Rect) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray))
        .title(Span::styled(
            " Map ",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ));

    let inner = block.inner(area);
    frame.render_widget(block, area);

    let map = app.map.borrow();
    // Braille gives 2x4 resolution per character
    let mut viewport = map.viewport.clone();
    viewport.width = inner.width as usize * 2;
    viewport.height = inner.height as usize * 4;

    let layers = map.render(inner.width as usize, inner.height as usize, &viewport);

    let cursor_pos = app.mouse_pixel_pos().and_then(|(px, py)| {
        let cx = (px / 2) as u16;
        let cy = (py / 4) as u16;
        (cx < inner.width && cy < inner.height).then_some((cx, cy))
    });

    frame.render_widget(
        MapWidget {
            layers,
            cursor_pos,
            pointer: map.cursor() == Cursor::Pointer,
        },
        inner,
    );

    if let Some(popup) = map.popup() {
        render_popup(frame, popup, &viewport, inner);
    }
}

/// Braille overlay layers with the cursor marker on top
struct MapWidget {
    layers: Vec<RenderedLayer>,
    cursor_pos: Option<(u16, u16)>,
    pointer: bool,
}

impl MapWidget {
    fn render_layer(canvas: &BrailleCanvas, style: Style, area: Rect, buf: &mut Buffer) {
        for row in 0..canvas.height().min(area.height as usize) {
            for col in 0..canvas.width().min(area.width as usize) {
                if let Some(ch) = canvas.glyph(col, row) {
                    let (x, y) = (area.x + col as u16, area.y + row as u16);
                    buf[(x, y)].set_char(ch).set_style(style);
                }
            }
        }
    }
}

impl Widget for MapWidget {
    fn render(self, area: Rect, buf: &mut Buffer) {
        // Bottom to top, later layers overwrite shared cells
        for layer in &self.layers {
            let mut style = Style::default().fg(parse_color(&layer.paint.stroke_color));
            if layer.paint.stroke_width >= 2.0 {
                style = style.add_modifier(Modifier::BOLD);
            }
            Self::render_layer(&layer.canvas, style, area, buf);
        }

        if let Some((cx, cy)) = self.cursor_pos {
            let x = area.x + cx;
            let y = area.y + cy;
            if x < area.x + area.width && y < area.y + area.height {
                let color = if self.pointer { Color::Yellow } else { Color::Red };
                buf[(x, y)].set_char('╋').set_fg(color);
            }
        }
    }
}

fn render_popup(frame: &mut Frame, popup: &MapPopup, viewport: &Viewport, inner: Rect) {
    let (px, py) = viewport.project(popup.at.lon, popup.at.lat);
    if px < 0 || py < 0 {
        return;
    }

    let lines: Vec<&str> = popup.text.lines().collect();
    let width = POPUP_WIDTH.min(inner.width);
    let height = (lines.len() as u16 + 2).min(inner.height).max(3);

    // Anchor below-right of the feature, flipped to stay inside the map
    let (cx, cy) = ((px / 2) as u16, (py / 4) as u16);
    let x = if cx + width > inner.width { inner.width.saturating_sub(width) } else { cx };
    let y = if cy + 1 + height > inner.height { cy.saturating_sub(height) } else { cy + 1 };
    let area = Rect::new(inner.x + x, inner.y + y, width, height).intersection(inner);

    let paragraph = Paragraph::new(lines.into_iter().map(Line::from).collect::<Vec<_>>())
        .wrap(Wrap { trim: true })
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Yellow)),
        );
    frame.render_widget(Clear, area);
    frame.render_widget(paragraph, area);
}

fn render_status_bar(frame: &mut Frame, app: &App, area: Rect) {
    let status = app.status.borrow();
    let message_color = if status.is_error { Color::Red } else { Color::Green };

    let line = Line::from(vec![
        Span::styled(format!(" {} ", status.message), Style::default().fg(message_color)),
        Span::styled("| Zoom: ", Style::default().fg(Color::DarkGray)),
        Span::styled(app.zoom_level(), Style::default().fg(Color::Yellow)),
        Span::styled(" | ", Style::default().fg(Color::DarkGray)),
        Span::styled(app.center_coords(), Style::default().fg(Color::Cyan)),
        Span::styled(
            " | tab:select enter:apply x:clear R:reload hjkl:pan +/-:zoom r:reset q:quit",
            Style::default().fg(Color::DarkGray),
        ),
    ]);

    frame.render_widget(Paragraph::new(line), area);
}

/// `#rgb` or `#rrggbb` to a terminal color. Near-black is drawn white so it
/// stays visible on dark terminals.
pub fn parse_color(hex: &str) -> Color {
    let digits = hex.trim_start_matches('#');
    let expanded: String = match digits.len() {
        3 => digits.chars().flat_map(|c| [c, c]).collect(),
        6 => digits.to_string(),
        _ => return Color::White,
    };

    let channel = |i: usize| u8::from_str_radix(&expanded[i..i + 2], 16).ok();
    match (channel(0), channel(2), channel(4)) {
        (Some(r), Some(g), Some(b)) if r as u16 + g as u16 + b as u16 <= 0x30 => Color::White,
        (Some(r), Some(g), Some(b)) => Color::Rgb(r, g, b),
        _ => Color::White,
    }
}
