//! Host picker
//!
//! Full-screen list of declared hosts. Up/Down (or k/j) move, Enter opens a
//! shell on the selected host, `r` refreshes and `q` quits. Keys come from
//! the shared stdin reader so the shell bridge and the picker never race
//! for input.

use std::io::{self, Stdout};

use crossterm::execute;
use crossterm::terminal::{EnterAlternateScreen, LeaveAlternateScreen};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph},
    Frame, Terminal,
};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};
use vte::{Params, Parser, Perform};

use crate::bridge::{shared_stdin, stdin_is_tty, RawModeGuard};
use crate::cli::{attach_shell, render_error};
use crate::dispatcher::{Dispatcher, HostStatus};
use crate::error::Result;

const HINT: &str = "Up/Down select  Enter open shell  r refresh  q quit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Up,
    Down,
    Enter,
    Refresh,
    Quit,
}

/// Turns raw terminal input into picker keys.
pub struct KeyDecoder {
    parser: Parser,
    keys: KeyCollector,
}

#[derive(Default)]
struct KeyCollector {
    keys: Vec<Key>,
    /// After `ESC O`, arrows arrive as plain letters
    ss3: bool,
}

impl Default for KeyDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyDecoder {
    pub fn new() -> Self {
        Self {
            parser: Parser::new(),
            keys: KeyCollector::default(),
        }
    }

    /// Keys completed by `bytes`. Partial escape sequences wait for the
    /// next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Key> {
        self.parser.advance(&mut self.keys, bytes);
        std::mem::take(&mut self.keys.keys)
    }
}

impl Perform for KeyCollector {
    fn print(&mut self, c: char) {
        let key = if std::mem::take(&mut self.ss3) {
            match c {
                'A' => Some(Key::Up),
                'B' => Some(Key::Down),
                _ => None,
            }
        } else {
            match c {
                'k' => Some(Key::Up),
                'j' => Some(Key::Down),
                'r' => Some(Key::Refresh),
                'q' => Some(Key::Quit),
                _ => None,
            }
        };
        self.keys.extend(key);
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            b'\r' | b'\n' => self.keys.push(Key::Enter),
            // Ctrl-C in raw mode
            0x03 => self.keys.push(Key::Quit),
            _ => {}
        }
    }

    fn csi_dispatch(&mut self, _params: &Params, _intermediates: &[u8], _ignore: bool, action: char) {
        match action {
            'A' => self.keys.push(Key::Up),
            'B' => self.keys.push(Key::Down),
            _ => {}
        }
    }

    fn esc_dispatch(&mut self, _intermediates: &[u8], _ignore: bool, byte: u8) {
        self.ss3 = byte == b'O';
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    None,
    Open { id: String, name: String },
    Refresh,
    Quit,
}

/// Rows plus selection
pub struct Picker {
    rows: Vec<HostStatus>,
    state: ListState,
}

impl Picker {
    pub fn new(rows: Vec<HostStatus>) -> Self {
        let mut picker = Self {
            rows,
            state: ListState::default(),
        };
        picker.clamp();
        picker
    }

    /// Replace the rows, keeping the same host selected if it is still listed.
    pub fn set_rows(&mut self, rows: Vec<HostStatus>) {
        let keep = self.selected().map(|row| row.id.clone());
        self.rows = rows;
        if let Some(index) = keep.and_then(|id| self.rows.iter().position(|row| row.id == id)) {
            self.state.select(Some(index));
        }
        self.clamp();
    }

    pub fn selected(&self) -> Option<&HostStatus> {
        self.state.selected().and_then(|index| self.rows.get(index))
    }

    pub fn apply(&mut self, key: Key) -> Action {
        match key {
            Key::Down => {
                if let Some(index) = self.state.selected() {
                    if index + 1 < self.rows.len() {
                        self.state.select(Some(index + 1));
                    }
                }
                Action::None
            }
            Key::Up => {
                if let Some(index) = self.state.selected() {
                    self.state.select(Some(index.saturating_sub(1)));
                }
                Action::None
            }
            Key::Enter => self.selected().map_or(Action::None, |row| Action::Open {
                id: row.id.clone(),
                name: row.name.clone(),
            }),
            Key::Refresh => Action::Refresh,
            Key::Quit => Action::Quit,
        }
    }

    fn clamp(&mut self) {
        if self.rows.is_empty() {
            self.state.select(None);
        } else {
            let index = self.state.selected().unwrap_or(0).min(self.rows.len() - 1);
            self.state.select(Some(index));
        }
    }
}

pub fn draw(frame: &mut Frame, picker: &mut Picker, notice: Option<&str>) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(3), Constraint::Length(1)])
        .split(frame.area());

    let items: Vec<ListItem> = picker
        .rows
        .iter()
        .map(|row| {
            let status_style = if row.is_idle() {
                Style::default().fg(Color::DarkGray)
            } else {
                Style::default().fg(Color::Green)
            };
            ListItem::new(Line::from(vec![
                Span::raw(row.name.clone()),
                Span::raw("  "),
                Span::styled(row.kind.to_string(), Style::default().fg(Color::Cyan)),
                Span::raw("  "),
                Span::styled(row.status.clone(), status_style),
            ]))
        })
        .collect();

    let title = format!("XPipe connections ({})", picker.rows.len());
    let list = List::new(items)
        .block(Block::default().title(title).borders(Borders::ALL))
        .highlight_style(
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol("> ");
    frame.render_stateful_widget(list, chunks[0], &mut picker.state);

    let footer = match notice {
        Some(text) => Line::from(Span::styled(text.to_string(), Style::default().fg(Color::Yellow))),
        None => Line::from(Span::styled(HINT, Style::default().fg(Color::DarkGray))),
    };
    frame.render_widget(Paragraph::new(footer), chunks[1]);
}

/// Alternate screen in raw mode; restored on drop
struct Screen {
    terminal: Terminal<CrosstermBackend<Stdout>>,
    raw: Option<RawModeGuard>,
}

impl Screen {
    fn enter() -> io::Result<Self> {
        let raw = RawModeGuard::new(true);
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen)?;
        let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;
        terminal.hide_cursor()?;
        Ok(Self {
            terminal,
            raw: Some(raw),
        })
    }

    /// Hand the terminal back for a shell.
    fn suspend(&mut self) -> io::Result<()> {
        execute!(self.terminal.backend_mut(), LeaveAlternateScreen)?;
        self.terminal.show_cursor()?;
        self.raw = None;
        Ok(())
    }

    fn resume(&mut self) -> io::Result<()> {
        self.raw = Some(RawModeGuard::new(true));
        execute!(self.terminal.backend_mut(), EnterAlternateScreen)?;
        self.terminal.hide_cursor()?;
        self.terminal.clear()
    }
}

impl Drop for Screen {
    fn drop(&mut self) {
        if self.raw.is_some() {
            if let Err(e) = execute!(self.terminal.backend_mut(), LeaveAlternateScreen) {
                warn!("Failed to leave alternate screen: {}", e);
            }
            let _ = self.terminal.show_cursor();
        }
    }
}

/// Run the picker until `q` or end of input.
pub async fn run(dispatcher: &Dispatcher) -> Result<u8> {
    if !stdin_is_tty() {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "browse needs an interactive terminal",
        )
        .into());
    }

    let mut picker = Picker::new(dispatcher.list().await?);
    let mut input = shared_stdin();
    let mut decoder = KeyDecoder::new();
    let mut notice: Option<String> = None;
    let mut screen = Screen::enter()?;
    let mut buf = [0u8; 64];

    'events: loop {
        screen
            .terminal
            .draw(|frame| draw(frame, &mut picker, notice.as_deref()))?;

        let n = input.read(&mut buf).await?;
        if n == 0 {
            debug!("stdin closed, leaving picker");
            break;
        }

        for key in decoder.feed(&buf[..n]) {
            match picker.apply(key) {
                Action::None => {}
                Action::Quit => break 'events,
                Action::Refresh => notice = refresh(dispatcher, &mut picker).await,
                Action::Open { id, name } => {
                    screen.suspend()?;
                    let result = attach_shell(dispatcher, &id, &name).await;
                    screen.resume()?;

                    notice = match result {
                        Ok(outcome) => Some(outcome.status_line(&name)),
                        Err(e) => Some(render_error(&e, false)),
                    };
                    if let Some(err) = refresh(dispatcher, &mut picker).await {
                        notice = Some(err);
                    }
                    // Keys typed alongside Enter belonged to the shell
                    decoder = KeyDecoder::new();
                    continue 'events;
                }
            }
        }
    }
    Ok(0)
}

/// Reload rows. Returns an error line on failure.
async fn refresh(dispatcher: &Dispatcher, picker: &mut Picker) -> Option<String> {
    match dispatcher.list().await {
        Ok(rows) => {
            picker.set_rows(rows);
            None
        }
        Err(e) => Some(render_error(&e, false)),
    }
}
