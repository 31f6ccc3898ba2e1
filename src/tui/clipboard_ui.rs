//! The clipboard viewer.
//!
//! Shows the decrypted slot for the session's account and refreshes when
//! another session replaces it.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ratatui::layout::{Constraint, Direction, Layout, Margin};
use ratatui::style::{Color, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Paragraph, Wrap};
use ratatui::Frame;

use crate::clipboard::crypto;
use crate::ssh::term::{KeyCode, KeyEvent};
use crate::tui::{drive, menu::render_help, rounded_age, Flow, UiModel, UiSession};
use crate::AppContext;

struct ClipboardModel {
    ctx: Arc<AppContext>,
    account_id: i64,
    pubkey_wire: Option<Vec<u8>>,
    /// Decrypted contents and their creation time, when a slot exists.
    content: Option<(String, String)>,
}

pub async fn run(ui: &mut UiSession<'_>) -> Result<()> {
    let mut model = ClipboardModel {
        ctx: ui.ctx.clone(),
        account_id: ui.account.id,
        pubkey_wire: ui.pubkey_wire.clone(),
        content: None,
    };
    model.reload().await?;

    let bus = ui.ctx.clone();
    drive(ui, &mut model, Some(&bus.clipboard_signal)).await?;
    Ok(())
}

impl ClipboardModel {
    async fn reload(&mut self) -> Result<()> {
        let Some(item) = self
            .ctx
            .storage
            .get_clipboard(self.account_id)
            .await
            .context("could not fetch the clipboard")?
        else {
            self.content = None;
            return Ok(());
        };

        let Some(wire) = self.pubkey_wire.as_deref() else {
            self.content = None;
            return Ok(());
        };
        let key = crypto::derive_key(wire, &self.ctx.config.entropy);
        let mut value = item.value;
        crypto::decrypt(&key, &item.iv, &mut value)?;

        self.content = Some((
            String::from_utf8_lossy(&value).to_string(),
            item.created_at,
        ));
        Ok(())
    }

    async fn clear(&mut self) -> Result<()> {
        self.ctx
            .storage
            .delete_clipboard(self.account_id)
            .await
            .context("could not clear the clipboard")?;
        self.content = None;
        Ok(())
    }
}

#[async_trait]
impl UiModel for ClipboardModel {
    fn render(&mut self, frame: &mut Frame) {
        let area = frame.area();
        let rows = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(3), Constraint::Length(1)])
            .split(area);
        let body = rows[0].inner(Margin {
            horizontal: 1,
            vertical: 0,
        });

        match &self.content {
            None => {
                let empty = Paragraph::new("clipboard is empty :(")
                    .style(Style::default().fg(Color::DarkGray))
                    .centered();
                frame.render_widget(empty, body);
            }
            Some((value, created_at)) => {
                let mut lines = vec![
                    Line::from(Span::styled(
                        format!("put {} ago", rounded_age(created_at)),
                        Style::default().fg(Color::DarkGray),
                    )),
                    Line::from(""),
                ];
                for line in value.lines() {
                    lines.push(Line::from(line.to_string()));
                }
                let view = Paragraph::new(lines).wrap(Wrap { trim: false });
                frame.render_widget(view, body);
            }
        }

        render_help(frame, rows[1], " c: clear  |  q: quit");
    }

    async fn on_key(&mut self, key: KeyEvent) -> Result<Flow> {
        if key.is_char('c') {
            self.clear().await?;
        } else if key.code == KeyCode::Esc || key.is_char('q') || key.is_ctrl('c') {
            return Ok(Flow::Quit);
        }
        Ok(Flow::Continue)
    }

    async fn on_wake(&mut self, _item_id: i64) -> Result<Flow> {
        self.reload().await?;
        Ok(Flow::Continue)
    }

    async fn on_tick(&mut self) -> Result<Flow> {
        self.reload().await?;
        Ok(Flow::Continue)
    }
}
