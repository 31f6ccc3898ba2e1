//! The app picker shown when an interactive session names no app.

use anyhow::Result;
use async_trait::async_trait;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{List, ListItem, Paragraph};
use ratatui::Frame;

use crate::apps::Registry;
use crate::ssh::term::{KeyCode, KeyEvent};
use crate::tui::{drive, Flow, UiModel, UiSession};

struct Entry {
    name: &'static str,
    title: &'static str,
    description: &'static str,
}

struct MenuModel {
    host: String,
    entries: Vec<Entry>,
    cursor: usize,
}

/// Runs the menu loop: pick an app, run its model, return to the menu.
pub async fn run(ui: &mut UiSession<'_>, registry: &Registry) -> Result<()> {
    let entries: Vec<Entry> = registry
        .iter()
        .filter(|app| app.has_ui())
        .map(|app| {
            let info = app.info();
            Entry {
                name: info.name,
                title: info.title,
                description: info.description,
            }
        })
        .collect();

    if entries.is_empty() {
        return Ok(());
    }

    let mut model = MenuModel {
        host: ui.ctx.config.host_label().to_string(),
        entries,
        cursor: 0,
    };

    loop {
        match drive(ui, &mut model, None).await? {
            Flow::Launch(name) => {
                if let Some(app) = crate::apps::find(registry, name) {
                    let app = app.clone();
                    app.run_ui(ui).await?;
                }
                ui.term.clear()?;
            }
            _ => return Ok(()),
        }
    }
}

#[async_trait]
impl UiModel for MenuModel {
    fn render(&mut self, frame: &mut Frame) {
        let area = frame.area();

        let rows = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(2),
                Constraint::Min(3),
                Constraint::Length(1),
            ])
            .split(area);

        let header = Paragraph::new(format!(" {}", self.host))
            .style(Style::default().add_modifier(Modifier::BOLD))
            .alignment(Alignment::Left);
        frame.render_widget(header, rows[0]);

        let items: Vec<ListItem> = self
            .entries
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let highlighted = index == self.cursor;
                let marker = if highlighted { "> " } else { "  " };
                let style = if highlighted {
                    Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)
                } else {
                    Style::default()
                };
                ListItem::new(Line::from(vec![
                    Span::styled(format!("{marker}{:<12}", entry.title), style),
                    Span::styled(entry.description, Style::default().fg(Color::DarkGray)),
                ]))
            })
            .collect();
        frame.render_widget(List::new(items), rows[1].inner(ratatui::layout::Margin {
            horizontal: 1,
            vertical: 0,
        }));

        render_help(frame, rows[2], " ↑/↓: choose  |  enter: open  |  q: quit");
    }

    async fn on_key(&mut self, key: KeyEvent) -> Result<Flow> {
        if key.code == KeyCode::Up || key.is_char('k') {
            self.cursor = self.cursor.saturating_sub(1);
        } else if key.code == KeyCode::Down || key.is_char('j') {
            if self.cursor + 1 < self.entries.len() {
                self.cursor += 1;
            }
        } else if key.code == KeyCode::Enter {
            return Ok(Flow::Launch(self.entries[self.cursor].name));
        } else if key.code == KeyCode::Esc || key.is_char('q') || key.is_ctrl('c') {
            return Ok(Flow::Quit);
        }
        Ok(Flow::Continue)
    }
}

pub(crate) fn render_help(frame: &mut Frame, area: Rect, text: &str) {
    let help = Paragraph::new(text).style(Style::default().fg(Color::DarkGray));
    frame.render_widget(help, area);
}
