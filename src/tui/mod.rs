//! Interactive terminal sessions over SSH.
//!
//! Each interactive session owns a main loop consuming (a) key events
//! parsed from the channel byte stream, (b) a periodic tick, and (c)
//! signal-bus wake-ups. Background refreshes run inline in the loop; the
//! ratatui terminal draws through a writer that flushes to the channel.

pub mod clipboard_ui;
pub mod mail_ui;
pub mod menu;

use std::future::Future;
use std::io::Write as _;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crossterm::{cursor, terminal};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::Rect;
use ratatui::{Frame, Terminal, TerminalOptions, Viewport};

use crate::bus::SignalBus;
use crate::ssh::session::{SessionInput, SessionIo};
use crate::ssh::term::{KeyEvent, KeyParser, TermWriter};
use crate::storage::AccountRow;
use crate::AppContext;

/// Background refresh cadence for interactive views.
const TICK_INTERVAL: Duration = Duration::from_secs(30);

/// An established terminal session on an SSH channel.
pub struct UiSession<'a> {
    pub ctx: Arc<AppContext>,
    pub io: &'a mut SessionIo,
    pub account: AccountRow,
    pub pubkey_wire: Option<Vec<u8>>,
    pub term: Terminal<CrosstermBackend<TermWriter>>,
    keys: KeyParser,
}

impl<'a> UiSession<'a> {
    /// Switches the client terminal into the alternate screen and builds a
    /// fixed-viewport terminal sized to the negotiated PTY.
    pub async fn start(
        ctx: Arc<AppContext>,
        io: &'a mut SessionIo,
        account: AccountRow,
        pubkey_wire: Option<Vec<u8>>,
    ) -> Result<Self> {
        let pty = io
            .pty
            .clone()
            .ok_or_else(|| anyhow!("interactive session without a pty"))?;

        let mut writer = TermWriter::start(io.handle(), io.channel());
        crossterm::execute!(writer, terminal::EnterAlternateScreen, cursor::Hide)
            .context("could not enter alternate screen")?;

        let backend = CrosstermBackend::new(writer);
        let area = Rect::new(0, 0, pty.width, pty.height);
        let term = Terminal::with_options(
            backend,
            TerminalOptions {
                viewport: Viewport::Fixed(area),
            },
        )
        .context("could not create terminal")?;

        Ok(Self {
            ctx,
            io,
            account,
            pubkey_wire,
            term,
            keys: KeyParser::default(),
        })
    }

    /// Restores the client terminal. Must run before the exit status is
    /// sent regardless of how the session went.
    pub async fn close(&mut self) -> Result<()> {
        crossterm::execute!(
            self.term.backend_mut(),
            terminal::LeaveAlternateScreen,
            cursor::Show
        )
        .context("could not leave alternate screen")?;
        Ok(())
    }
}

/// What a model tells the driver after handling an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
    /// Menu only: hand the session over to the named app's model.
    Launch(&'static str),
}

#[async_trait]
pub trait UiModel: Send {
    fn render(&mut self, frame: &mut Frame);

    async fn on_key(&mut self, key: KeyEvent) -> Result<Flow>;

    async fn on_wake(&mut self, _value: i64) -> Result<Flow> {
        Ok(Flow::Continue)
    }

    async fn on_tick(&mut self) -> Result<Flow> {
        Ok(Flow::Continue)
    }
}

/// Runs a model's event loop until it quits or launches an app.
///
/// The bus waiter stays registered across loop iterations; it is re-armed
/// only after it fires so ticks and keystrokes do not pile up abandoned
/// waiter slots. The session router cleans up whatever is still registered
/// when the session ends.
pub async fn drive<'b, M>(
    ui: &mut UiSession<'_>,
    model: &mut M,
    bus: Option<&'b SignalBus<i64, i64>>,
) -> Result<Flow>
where
    M: UiModel,
{
    let account_id = ui.account.id;

    let arm = |bus: Option<&'b SignalBus<i64, i64>>| -> Pin<
        Box<dyn Future<Output = (i64, bool)> + Send + 'b>,
    > {
        match bus {
            Some(bus) => Box::pin(bus.wait(account_id)),
            None => Box::pin(std::future::pending()),
        }
    };
    let mut wake = arm(bus);

    let mut tick = tokio::time::interval(TICK_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tick.tick().await;

    loop {
        ui.term.draw(|frame| model.render(frame))?;

        let flow = tokio::select! {
            input = ui.io.next_input() => match input {
                SessionInput::Eof => Flow::Quit,
                SessionInput::Resize(width, height) => {
                    ui.term.resize(Rect::new(0, 0, width, height))?;
                    Flow::Continue
                }
                SessionInput::Data(bytes) => {
                    let mut flow = Flow::Continue;
                    for key in ui.keys.feed(&bytes) {
                        flow = model.on_key(key).await?;
                        if flow != Flow::Continue {
                            break;
                        }
                    }
                    flow
                }
            },

            _ = tick.tick() => model.on_tick().await?,

            (value, aborted) = wake.as_mut() => {
                wake = arm(bus);
                if aborted {
                    Flow::Quit
                } else {
                    model.on_wake(value).await?
                }
            }
        };

        if flow != Flow::Continue {
            return Ok(flow);
        }
    }
}

/// Renders how long ago a stored RFC 3339 timestamp was, rounded to the
/// largest sensible unit.
pub fn rounded_age(created_at: &str) -> String {
    let Ok(at) = DateTime::parse_from_rfc3339(created_at) else {
        return "?".to_string();
    };
    let elapsed = Utc::now().signed_duration_since(at.with_timezone(&Utc));

    if elapsed.num_days() > 0 {
        format!("{}d", elapsed.num_days())
    } else if elapsed.num_hours() > 0 {
        format!("{}h", elapsed.num_hours())
    } else if elapsed.num_minutes() > 0 {
        format!("{}m", elapsed.num_minutes())
    } else {
        "now".to_string()
    }
}
