mod app;
mod cli;
mod ui;

use std::cell::RefCell;
use std::fs::File;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use app::{App, StatusLine};
use clap::Parser;
use cli::Cli;
use crossterm::event::{
    self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind, MouseButton,
    MouseEvent, MouseEventKind,
};
use crossterm::execute;
use log::info;
use overlay_map::config::{AppConfig, Mode};
use overlay_map::data::SourceFetcher;
use overlay_map::map::{TerminalMap, Viewport};
use overlay_map::overlay::{OverlayManager, OverlayRegistry, SelectionEvent};
use ratatui::DefaultTerminal;
use tokio::task::LocalSet;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    // Bad configuration fails before the terminal is taken over
    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    if let Some(mode) = cli.mode {
        config.mode = mode;
    }
    let registry = config.registry()?;
    info!("Loaded {} overlays in {:?} mode", registry.len(), config.mode);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("start async runtime")?;

    let mut terminal = ratatui::init();
    terminal.clear()?;
    execute!(std::io::stdout(), EnableMouseCapture)?;

    let local = LocalSet::new();
    let result = local.block_on(&runtime, run(&mut terminal, config, registry, &cli));

    let _ = execute!(std::io::stdout(), DisableMouseCapture);
    ratatui::restore();

    result
}

fn init_logging(cli: &Cli) -> Result<()> {
    let file = File::create(&cli.log_file).with_context(|| format!("create log file {}", cli.log_file.display()))?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cli.log_filter()))
        .target(env_logger::Target::Pipe(Box::new(file)))
        .init();
    Ok(())
}

/// Hand a selection event to the controller without blocking the UI loop
fn dispatch(app: &App, event: SelectionEvent) {
    let controller = app.controller.clone();
    tokio::task::spawn_local(async move {
        controller.handle_selection(event).await;
    });
}

/// Handle mouse events for panning, zooming and sidebar clicks
fn handle_mouse(app: &mut App, mouse: MouseEvent) {
    // Always track mouse position for cursor marker
    app.set_mouse_pos(mouse.column, mouse.row);

    match mouse.kind {
        // Scroll wheel for zooming towards mouse position
        MouseEventKind::ScrollUp => app.zoom_in_at(mouse.column, mouse.row),
        MouseEventKind::ScrollDown => app.zoom_out_at(mouse.column, mouse.row),
        // Horizontal scroll for panning (trackpad two-finger swipe)
        MouseEventKind::ScrollLeft => app.pan(-15, 0),
        MouseEventKind::ScrollRight => app.pan(15, 0),
        MouseEventKind::Down(MouseButton::Left) => {
            if let Some(row) = app.sidebar_row_at(mouse.column, mouse.row) {
                app.selected = row;
                if let Some(event) = app.activate() {
                    dispatch(app, event);
                }
            } else {
                app.press(mouse.column, mouse.row);
            }
        }
        MouseEventKind::Drag(MouseButton::Left) => {
            app.handle_drag(mouse.column, mouse.row);
        }
        MouseEventKind::Up(MouseButton::Left) => {
            app.release(mouse.column, mouse.row);
        }
        MouseEventKind::Moved => app.hover(mouse.column, mouse.row),
        _ => {}
    }
}

async fn run(terminal: &mut DefaultTerminal, config: AppConfig, registry: OverlayRegistry, cli: &Cli) -> Result<()> {
    let view = config.view();
    let map = Rc::new(RefCell::new(TerminalMap::new(Viewport::new(view.lon, view.lat, view.zoom, 0, 0))));
    let status = Rc::new(RefCell::new(StatusLine::default()));
    let controller = Rc::new(
        OverlayManager::new(Rc::new(registry), SourceFetcher::new(&cli.data_dir), map.clone(), status.clone())
            .with_tier_paints(config.highlight.clone(), config.dimmed.clone()),
    );

    let mut app = App::new(controller.clone(), map, status, config.mode, view);
    let size = terminal.size()?;
    app.resize(size.width, size.height);

    if config.mode == Mode::Independent {
        tokio::task::spawn_local(async move {
            controller.show_defaults().await;
        });
    }

    // Main loop
    loop {
        terminal.draw(|frame| ui::render(frame, &app))?;

        while event::poll(Duration::ZERO)? {
            match event::read()? {
                Event::Key(key) => {
                    // Only handle key press events (not release)
                    if key.kind != KeyEventKind::Press {
                        continue;
                    }
                    match key.code {
                        KeyCode::Char('q') => app.quit(),
                        KeyCode::Esc => {
                            if !app.close_popup() {
                                app.quit();
                            }
                        }

                        // Pan with hjkl or arrow keys
                        KeyCode::Left | KeyCode::Char('h') => app.pan(-10, 0),
                        KeyCode::Right | KeyCode::Char('l') => app.pan(10, 0),
                        KeyCode::Up | KeyCode::Char('k') => app.pan(0, -6),
                        KeyCode::Down | KeyCode::Char('j') => app.pan(0, 6),

                        // Zoom
                        KeyCode::Char('+') | KeyCode::Char('=') => app.zoom_in(),
                        KeyCode::Char('-') | KeyCode::Char('_') => app.zoom_out(),

                        // Sidebar
                        KeyCode::Tab => app.move_selection(1),
                        KeyCode::BackTab => app.move_selection(-1),
                        KeyCode::Enter | KeyCode::Char(' ') => {
                            if let Some(event) = app.activate() {
                                dispatch(&app, event);
                            }
                        }
                        KeyCode::Char('x') => {
                            if let Some(event) = app.clear_selection() {
                                dispatch(&app, event);
                            }
                        }
                        KeyCode::Char('R') => {
                            if let Some(event) = app.refresh_selected() {
                                dispatch(&app, event);
                            }
                        }

                        // Reset view
                        KeyCode::Char('r') | KeyCode::Char('0') => app.reset_view(),

                        _ => {}
                    }
                }
                Event::Mouse(mouse) => handle_mouse(&mut app, mouse),
                Event::Resize(width, height) => app.resize(width, height),
                _ => {}
            }
        }

        if app.should_quit {
            break;
        }

        // ~60fps; overlay loads make progress while we wait
        tokio::time::sleep(Duration::from_millis(16)).await;
    }

    Ok(())
}
