//! Ratatui TUI client for the ticker relay.
//!
//! Connects to the relay's live WebSocket endpoint and renders the ranked
//! top-20 table. A lost connection is retried every 5 seconds while the UI
//! keeps running.
//!
//! ```bash
//! cargo run --release --bin relay-client                                        # localhost:8080
//! cargo run --release --bin relay-client -- ws://server:8080/api/crypto/live    # custom address
//! ```

use std::time::{Duration, Instant};

use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use futures_util::StreamExt;
use ratatui::{
    Frame,
    layout::Alignment,
    style::{Color, Style, Stylize},
    text::{Line, Span},
    widgets::{Block, Borders, Padding, Paragraph},
};
use rust_decimal::prelude::ToPrimitive;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use ticker_relay::types::{InstrumentQuote, Snapshot};

const DEFAULT_URL: &str = "ws://localhost:8080/api/crypto/live";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

// ── Connection task ─────────────────────────────────────────────────────────

enum Update {
    Connected,
    Snapshot(Snapshot),
    Disconnected(String),
}

/// Connect, forward snapshots, wait, repeat. Exits once the UI drops its receiver.
async fn stream_snapshots(url: String, tx: mpsc::Sender<Update>) {
    loop {
        let reason = match connect_async(url.as_str()).await {
            Ok((mut ws, _)) => {
                if tx.send(Update::Connected).await.is_err() {
                    return;
                }
                loop {
                    match ws.next().await {
                        Some(Ok(Message::Text(text))) => match serde_json::from_str::<Snapshot>(&text) {
                            Ok(snapshot) => {
                                if tx.send(Update::Snapshot(snapshot)).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => break format!("bad payload: {e}"),
                        },
                        Some(Ok(Message::Close(_))) | None => break "connection closed".to_string(),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break e.to_string(),
                    }
                }
            }
            Err(e) => e.to_string(),
        };
        if tx.send(Update::Disconnected(reason)).await.is_err() {
            return;
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

// ── App state ───────────────────────────────────────────────────────────────

struct App {
    url: String,
    snapshot: Option<Snapshot>,
    status: Result<(), String>,
    connected: bool,
    updates: u64,
    start: Instant,
}

impl App {
    fn new(url: String) -> Self {
        Self {
            url,
            snapshot: None,
            status: Ok(()),
            connected: false,
            updates: 0,
            start: Instant::now(),
        }
    }

    fn apply(&mut self, update: Update) {
        match update {
            Update::Connected => {
                self.connected = true;
                self.status = Ok(());
            }
            Update::Snapshot(snapshot) => {
                self.snapshot = Some(snapshot);
                self.updates += 1;
            }
            Update::Disconnected(reason) => {
                self.connected = false;
                self.status = Err(reason);
            }
        }
    }

    fn updates_per_sec(&self) -> f64 {
        let elapsed = self.start.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.updates as f64 / elapsed
        } else {
            0.0
        }
    }
}

// ── Terminal guard ──────────────────────────────────────────────────────────

/// Ensures the terminal is restored even on panic.
struct TermGuard;

impl Drop for TermGuard {
    fn drop(&mut self) {
        ratatui::restore();
    }
}

// ── Rendering ───────────────────────────────────────────────────────────────

const GREEN: Color = Color::Rgb(81, 207, 102);
const RED: Color = Color::Rgb(235, 87, 87);
const YELLOW: Color = Color::Rgb(229, 192, 72);
const DIM: Color = Color::DarkGray;
const BAR_WIDTH: usize = 20;

fn render(frame: &mut Frame, app: &App) {
    let (conn_text, conn_color) = match (&app.status, app.connected) {
        (_, true) => ("live".to_string(), GREEN),
        (Err(reason), false) => (format!("reconnecting in 5s ({reason})"), RED),
        (Ok(()), false) => ("connecting".to_string(), YELLOW),
    };
    let status = Line::from(vec![
        Span::styled(format!(" {conn_text} "), Style::new().fg(conn_color)),
        Span::raw(format!("│  Updates: {:.1}/s  │  q to quit ", app.updates_per_sec())),
    ]);

    let outer = Block::default()
        .borders(Borders::ALL)
        .title(format!(" Top Instruments ─ {} ", app.url))
        .title_style(Style::new().bold())
        .title_bottom(status.alignment(Alignment::Center))
        .padding(Padding::new(1, 1, 1, 0));

    let body = match &app.snapshot {
        None => Paragraph::new("Waiting for data...").alignment(Alignment::Center),
        Some(snapshot) if snapshot.is_empty() => {
            Paragraph::new("No instruments yet").alignment(Alignment::Center)
        }
        Some(snapshot) => Paragraph::new(table(snapshot)),
    };
    frame.render_widget(body.block(outer), frame.area());
}

fn table(snapshot: &Snapshot) -> Vec<Line<'static>> {
    // Snapshot arrives ranked, so the first row carries the max price.
    let max_price = snapshot
        .iter()
        .next()
        .and_then(|q| q.price.to_f64())
        .unwrap_or(0.0);

    let mut lines = Vec::with_capacity(snapshot.len() + 1);
    lines.push(Line::from(Span::styled(
        format!("  {:>3}  {:<22}{:<12}{:>16}", "#", "NAME", "PAIR", "ASK"),
        Style::new().fg(DIM).bold(),
    )));
    for (rank, quote) in snapshot.iter().enumerate() {
        lines.push(format_row(rank + 1, quote, max_price));
    }
    lines
}

fn format_row(rank: usize, quote: &InstrumentQuote, max_price: f64) -> Line<'static> {
    let price = quote.price.to_f64().unwrap_or(0.0);
    let bar_len = if max_price > 0.0 {
        #[allow(clippy::cast_sign_loss)] // prices in a snapshot are never negative
        { ((price / max_price) * BAR_WIDTH as f64).round() as usize }
    } else {
        0
    };

    Line::from(vec![
        Span::styled(format!("  {rank:>3}  "), Style::new().fg(DIM)),
        Span::styled(format!("{:<22}", truncate(&quote.name, 21)), Style::new().bold()),
        Span::styled(format!("{:<12}", quote.pair), Style::new().fg(DIM)),
        Span::styled(format!("{:>16}", quote.price.to_string()), Style::new().fg(GREEN)),
        Span::raw("  "),
        Span::styled("█".repeat(bar_len), Style::new().fg(GREEN)),
    ])
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

// ── Main ────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let url = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_URL.to_string());

    let (tx, mut rx) = mpsc::channel(16);
    let connection = tokio::spawn(stream_snapshots(url.clone(), tx));

    // Init terminal.
    let mut terminal = ratatui::init();
    let _guard = TermGuard;

    let mut app = App::new(url);

    loop {
        terminal.draw(|frame| render(frame, &app))?;

        tokio::select! {
            update = rx.recv() => match update {
                Some(update) => app.apply(update),
                None => break,
            },
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }

        // Check for quit keys (non-blocking).
        if event::poll(Duration::ZERO)?
            && let Event::Key(key) = event::read()?
            && key.kind == KeyEventKind::Press
        {
            match key.code {
                KeyCode::Char('q') | KeyCode::Esc => break,
                KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                    break;
                }
                _ => {}
            }
        }
    }

    connection.abort();
    Ok(())
}
