//! Interactive terminal front-end.
//!
//! A scrollable list of configured devices with alias, on/off state and
//! last-reported power draw. Digit keys 1-9 toggle the corresponding row's
//! target state; `q`/Esc exits. Runs entirely on the calling thread and
//! shares the dispatcher behind the caller's lock.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::execute;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::Constraint;
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::Line;
use ratatui::widgets::{Block, Borders, Row, Table};
use ratatui::Terminal;
use thiserror::Error;

use crate::dispatcher::Dispatcher;

/// Errors bringing up or tearing down the terminal UI.
#[derive(Error, Debug)]
pub enum TuiError {
    #[error("terminal I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Run the interactive device list until the user quits.
///
/// `dispatcher` is shared with the background polling thread; each redraw
/// takes the lock just long enough to snapshot status.
pub fn run(dispatcher: Arc<Mutex<Dispatcher>>) -> Result<(), TuiError> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run_loop(&mut terminal, &dispatcher);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

fn run_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    dispatcher: &Arc<Mutex<Dispatcher>>,
) -> Result<(), TuiError> {
    loop {
        let rows = snapshot(dispatcher);

        terminal.draw(|frame| {
            let header = Row::new(vec!["#", "MAC", "alias", "state", "power (W)"])
                .style(Style::default().add_modifier(Modifier::BOLD));
            let body: Vec<Row> = rows
                .iter()
                .enumerate()
                .map(|(i, r)| {
                    let state_style = match r.is_on {
                        Some(true) => Style::default().fg(Color::Green),
                        Some(false) => Style::default().fg(Color::Red),
                        None => Style::default().fg(Color::DarkGray),
                    };
                    Row::new(vec![
                        Line::from((i + 1).to_string()),
                        Line::from(r.mac.clone()),
                        Line::from(r.alias.clone()),
                        Line::styled(r.state_label.clone(), state_style),
                        Line::from(r.power_label.clone()),
                    ])
                })
                .collect();

            let table = Table::new(
                body,
                [
                    Constraint::Length(3),
                    Constraint::Length(18),
                    Constraint::Min(10),
                    Constraint::Length(8),
                    Constraint::Length(10),
                ],
            )
            .header(header)
            .block(Block::default().borders(Borders::ALL).title("asokad  (1-9 toggle, q quit)"));

            frame.render_widget(table, frame.area());
        })?;

        if event::poll(Duration::from_millis(500))? {
            if let Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                match key.code {
                    KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
                    KeyCode::Char(c) if c.is_ascii_digit() && c != '0' => {
                        let index = c as usize - '1' as usize;
                        toggle(dispatcher, &rows, index);
                    }
                    _ => {}
                }
            }
        }
    }
}

struct DeviceRow {
    mac: String,
    alias: String,
    state_label: String,
    power_label: String,
    is_on: Option<bool>,
}

fn snapshot(dispatcher: &Arc<Mutex<Dispatcher>>) -> Vec<DeviceRow> {
    let dispatcher = dispatcher.lock().expect("dispatcher lock poisoned");
    dispatcher
        .device_order()
        .iter()
        .filter_map(|mac| {
            let info = dispatcher.device_info(*mac).ok()?;
            Some(DeviceRow {
                mac: mac.to_string(),
                alias: info.alias.unwrap_or_default(),
                state_label: match info.is_on {
                    Some(true) => "on".to_string(),
                    Some(false) => "off".to_string(),
                    None => "?".to_string(),
                },
                power_label: info
                    .power_w
                    .map(|p| format!("{p:.1}"))
                    .unwrap_or_default(),
                is_on: info.is_on,
            })
        })
        .collect()
}

fn toggle(dispatcher: &Arc<Mutex<Dispatcher>>, rows: &[DeviceRow], index: usize) {
    let Some(row) = rows.get(index) else { return };
    let Ok(mac) = row.mac.parse() else { return };
    let mut dispatcher = dispatcher.lock().expect("dispatcher lock poisoned");
    let turn_on = row.is_on != Some(true);
    let result = if turn_on {
        dispatcher.device_on(mac)
    } else {
        dispatcher.device_off(mac)
    };
    if let Err(e) = result {
        log::warn!("toggle failed: {e}");
    }
}
