//! The mailbox and mail browser.
//!
//! Left pane: mailboxes with unread badges. Right pane: mails in the
//! highlighted mailbox. Enter opens a mail and marks it seen. Bus wake-ups
//! re-query the store so a landing mail shows up while the view is open.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ratatui::layout::{Constraint, Direction, Layout, Margin};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Cell, List, ListItem, Paragraph, Row, Table, Wrap};
use ratatui::Frame;

use crate::mail::{names, parse};
use crate::ssh::term::{KeyCode, KeyEvent};
use crate::storage::{MailRow, MailboxWithUnread};
use crate::tui::{drive, menu::render_help, rounded_age, Flow, UiModel, UiSession};
use crate::AppContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Focus {
    Mailboxes,
    Mails,
    Reading,
}

struct MailModel {
    ctx: Arc<AppContext>,
    account_id: i64,
    mx_host: String,

    mailboxes: Vec<MailboxWithUnread>,
    mailbox_cursor: usize,
    mails: Vec<MailRow>,
    mail_cursor: usize,
    reading: Option<MailRow>,

    focus: Focus,
    notice: Option<String>,
}

pub async fn run(ui: &mut UiSession<'_>) -> Result<()> {
    let mut model = MailModel {
        ctx: ui.ctx.clone(),
        account_id: ui.account.id,
        mx_host: ui.ctx.config.mx_host.clone(),
        mailboxes: Vec::new(),
        mailbox_cursor: 0,
        mails: Vec::new(),
        mail_cursor: 0,
        reading: None,
        focus: Focus::Mailboxes,
        notice: None,
    };
    model.refresh_mailboxes(false).await?;

    let bus = ui.ctx.clone();
    drive(ui, &mut model, Some(&bus.mail_signal)).await?;
    Ok(())
}

impl MailModel {
    fn current_mailbox(&self) -> Option<&MailboxWithUnread> {
        self.mailboxes.get(self.mailbox_cursor)
    }

    fn address(&self, name: &str) -> String {
        crate::mail::mailbox_address(name, &self.mx_host)
    }

    /// Re-queries the mailbox list. A passive refresh keeps the cursor and
    /// the loaded mail pane; an active one reloads the mails too.
    async fn refresh_mailboxes(&mut self, passive: bool) -> Result<()> {
        let current = self.current_mailbox().map(|m| m.id);

        self.mailboxes = self
            .ctx
            .storage
            .list_mailboxes_with_unread(self.account_id)
            .await
            .context("could not load mailboxes")?;

        // Keep the highlight on the same mailbox when it still exists.
        if let Some(id) = current {
            if let Some(index) = self.mailboxes.iter().position(|m| m.id == id) {
                self.mailbox_cursor = index;
            }
        }
        if self.mailbox_cursor >= self.mailboxes.len() {
            self.mailbox_cursor = self.mailboxes.len().saturating_sub(1);
        }

        if !passive {
            self.refresh_mails().await?;
        }
        Ok(())
    }

    async fn refresh_mails(&mut self) -> Result<()> {
        let Some(mailbox) = self.current_mailbox() else {
            self.mails.clear();
            return Ok(());
        };
        self.mails = self
            .ctx
            .storage
            .list_mails(mailbox.id)
            .await
            .context("could not load mails")?;
        if self.mail_cursor >= self.mails.len() {
            self.mail_cursor = self.mails.len().saturating_sub(1);
        }
        if self.mails.is_empty() && self.focus == Focus::Mails {
            self.focus = Focus::Mailboxes;
        }
        Ok(())
    }

    async fn open_mail(&mut self) -> Result<()> {
        let Some(mail) = self.mails.get(self.mail_cursor).cloned() else {
            return Ok(());
        };
        if !mail.seen {
            self.ctx
                .storage
                .mark_mail_seen(mail.id)
                .await
                .context("could not mark mail seen")?;
            if let Some(mailbox) = self.mailboxes.get_mut(self.mailbox_cursor) {
                mailbox.unread = (mailbox.unread - 1).max(0);
            }
            if let Some(row) = self.mails.get_mut(self.mail_cursor) {
                row.seen = true;
            }
        }
        self.reading = Some(mail);
        self.focus = Focus::Reading;
        Ok(())
    }

    async fn create_mailbox(&mut self) -> Result<()> {
        match names::create_random_mailbox(&self.ctx.storage, self.account_id).await {
            Ok(_) => {
                self.notice = None;
                self.refresh_mailboxes(false).await?;
            }
            Err(err) => self.notice = Some(err.to_string()),
        }
        Ok(())
    }

    async fn delete_mailbox(&mut self) -> Result<()> {
        let Some(mailbox) = self.current_mailbox() else {
            return Ok(());
        };
        self.ctx
            .storage
            .delete_mailbox(mailbox.id)
            .await
            .context("could not delete mailbox")?;
        self.refresh_mailboxes(false).await?;
        Ok(())
    }
}

#[async_trait]
impl UiModel for MailModel {
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

        if let Some(mail) = &self.reading {
            if self.focus == Focus::Reading {
                render_mail(frame, body, mail, &self.mx_host, self.current_mailbox());
                render_help(frame, rows[1], " esc: back  |  q: quit");
                return;
            }
        }

        if self.mailboxes.is_empty() {
            let empty = Paragraph::new("no mailboxes :(")
                .style(Style::default().fg(Color::DarkGray))
                .centered();
            frame.render_widget(empty, body);
            render_help(frame, rows[1], " ctrl+n: generate mailbox  |  q: quit");
            return;
        }

        let panes = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(34), Constraint::Percentage(66)])
            .split(body);

        self.render_mailboxes(frame, panes[0]);
        self.render_mails(frame, panes[1]);

        let help = match self.focus {
            Focus::Mailboxes => {
                " ctrl+n: generate  |  ctrl+k: delete  |  enter: select  |  →: mails  |  q: quit"
            }
            _ => " enter: open  |  ←: mailboxes  |  q: quit",
        };
        render_help(frame, rows[1], help);

        if let Some(notice) = &self.notice {
            let line = Paragraph::new(notice.as_str()).style(Style::default().fg(Color::Red));
            frame.render_widget(line, rows[1]);
        }
    }

    async fn on_key(&mut self, key: KeyEvent) -> Result<Flow> {
        if key.is_ctrl('c') {
            return Ok(Flow::Quit);
        }

        match self.focus {
            Focus::Reading => {
                if key.code == KeyCode::Esc
                    || key.code == KeyCode::Left
                    || key.is_char('h')
                {
                    self.reading = None;
                    self.focus = if self.mails.is_empty() {
                        Focus::Mailboxes
                    } else {
                        Focus::Mails
                    };
                } else if key.is_char('q') {
                    return Ok(Flow::Quit);
                }
            }

            Focus::Mailboxes => {
                if key.code == KeyCode::Up || key.is_char('k') {
                    self.mailbox_cursor = self.mailbox_cursor.saturating_sub(1);
                    self.refresh_mails().await?;
                } else if key.code == KeyCode::Down || key.is_char('j') {
                    if self.mailbox_cursor + 1 < self.mailboxes.len() {
                        self.mailbox_cursor += 1;
                        self.refresh_mails().await?;
                    }
                } else if key.code == KeyCode::Enter {
                    self.refresh_mails().await?;
                    if !self.mails.is_empty() {
                        self.mail_cursor = 0;
                        self.focus = Focus::Mails;
                    }
                } else if key.code == KeyCode::Right || key.is_char('l') {
                    if !self.mails.is_empty() {
                        self.focus = Focus::Mails;
                    }
                } else if key.is_ctrl('n') {
                    self.create_mailbox().await?;
                } else if key.is_ctrl('k') {
                    self.delete_mailbox().await?;
                } else if key.code == KeyCode::Esc || key.is_char('q') {
                    return Ok(Flow::Quit);
                }
            }

            Focus::Mails => {
                if key.code == KeyCode::Up || key.is_char('k') {
                    self.mail_cursor = self.mail_cursor.saturating_sub(1);
                } else if key.code == KeyCode::Down || key.is_char('j') {
                    if self.mail_cursor + 1 < self.mails.len() {
                        self.mail_cursor += 1;
                    }
                } else if key.code == KeyCode::Enter {
                    self.open_mail().await?;
                } else if key.code == KeyCode::Left
                    || key.is_char('h')
                    || key.code == KeyCode::Esc
                {
                    self.focus = Focus::Mailboxes;
                } else if key.is_char('q') {
                    return Ok(Flow::Quit);
                }
            }
        }

        Ok(Flow::Continue)
    }

    async fn on_wake(&mut self, mailbox_id: i64) -> Result<Flow> {
        let current = self.current_mailbox().map(|m| m.id);
        self.refresh_mailboxes(true).await?;
        if current == Some(mailbox_id) {
            self.refresh_mails().await?;
        }
        Ok(Flow::Continue)
    }

    async fn on_tick(&mut self) -> Result<Flow> {
        self.refresh_mailboxes(true).await?;
        Ok(Flow::Continue)
    }
}

impl MailModel {
    fn render_mailboxes(&self, frame: &mut Frame, area: ratatui::layout::Rect) {
        let mut items = vec![ListItem::new(Line::from(Span::styled(
            "Mailboxes",
            Style::default().fg(Color::DarkGray),
        )))];

        items.extend(self.mailboxes.iter().enumerate().map(|(index, mailbox)| {
            let highlighted = index == self.mailbox_cursor;
            let style = if highlighted {
                Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)
            } else {
                Style::default()
            };
            let marker = if highlighted && self.focus == Focus::Mailboxes {
                "> "
            } else {
                "  "
            };
            let badge = if mailbox.unread > 0 {
                format!(" ({})", mailbox.unread)
            } else {
                String::new()
            };
            ListItem::new(Line::from(vec![
                Span::styled(format!("{marker}{}", self.address(&mailbox.name)), style),
                Span::styled(badge, Style::default().fg(Color::DarkGray)),
            ]))
        }));

        frame.render_widget(List::new(items), area);
    }

    fn render_mails(&self, frame: &mut Frame, area: ratatui::layout::Rect) {
        if self.mails.is_empty() {
            let address = self
                .current_mailbox()
                .map(|m| self.address(&m.name))
                .unwrap_or_default();
            let empty = Paragraph::new(format!(
                "no mails in {address}, incoming mails are only stored for 48h"
            ))
            .style(Style::default().fg(Color::DarkGray))
            .wrap(Wrap { trim: true });
            frame.render_widget(empty, area);
            return;
        }

        let rows: Vec<Row> = self
            .mails
            .iter()
            .enumerate()
            .map(|(index, mail)| {
                let highlighted = index == self.mail_cursor && self.focus == Focus::Mails;
                let mut style = if highlighted {
                    Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)
                } else {
                    Style::default()
                };
                if !mail.seen {
                    style = style.add_modifier(Modifier::BOLD);
                }
                Row::new(vec![
                    Cell::from(mail.subject.clone()),
                    Cell::from(mail.from_address.clone()),
                    Cell::from(format!("{} ago", rounded_age(&mail.created_at))),
                ])
                .style(style)
            })
            .collect();

        let table = Table::new(
            rows,
            [
                Constraint::Percentage(60),
                Constraint::Percentage(30),
                Constraint::Percentage(10),
            ],
        )
        .header(
            Row::new(vec!["Subject", "From", "At"])
                .style(Style::default().fg(Color::DarkGray))
                .bottom_margin(1),
        );
        frame.render_widget(table, area);
    }
}

fn render_mail(
    frame: &mut Frame,
    area: ratatui::layout::Rect,
    mail: &MailRow,
    mx_host: &str,
    mailbox: Option<&MailboxWithUnread>,
) {
    let to = mailbox
        .map(|m| crate::mail::mailbox_address(&m.name, mx_host))
        .unwrap_or_default();

    let from = if mail.from_name.is_empty() {
        mail.from_address.clone()
    } else {
        format!("{} <{}>", mail.from_name, mail.from_address)
    };

    let mut lines = vec![
        Line::from(vec![
            Span::styled("From: ", Style::default().fg(Color::DarkGray)),
            Span::raw(from),
        ]),
        Line::from(vec![
            Span::styled("To: ", Style::default().fg(Color::DarkGray)),
            Span::raw(to),
        ]),
        Line::from(vec![
            Span::styled("Subject: ", Style::default().fg(Color::DarkGray)),
            Span::styled(
                mail.subject.clone(),
                Style::default().add_modifier(Modifier::BOLD),
            ),
        ]),
        Line::from(""),
    ];
    for line in parse::normalize_newlines(&mail.text).lines() {
        lines.push(Line::from(line.to_string()));
    }

    let view = Paragraph::new(lines).wrap(Wrap { trim: false });
    frame.render_widget(view, area);
}
