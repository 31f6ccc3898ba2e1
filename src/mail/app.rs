//! The temporary mail application: owns the SMTP front door, the mailbox
//! naming policy and the stale-mail sweeper.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::apps::{App, AppInfo, Outcome, Request};
use crate::mail::smtp;
use crate::tui::{self, UiSession};
use crate::AppContext;

/// Mails older than this are swept.
const MAIL_RETENTION: chrono::Duration = chrono::Duration::hours(48);

/// How often the sweeper wakes.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub struct MailApp {
    ctx: Arc<AppContext>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl MailApp {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self {
            ctx,
            workers: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl App for MailApp {
    fn info(&self) -> AppInfo {
        AppInfo {
            name: "mail",
            title: "Mail",
            description: "Temporary mail",
        }
    }

    async fn init(&self) -> Result<()> {
        let listener = smtp::bind(&self.ctx).await?;

        let smtp_worker = {
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(err) = smtp::serve(ctx, listener).await {
                    error!(err = %err, "smtp server stopped");
                }
            })
        };

        let sweeper = {
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(SWEEP_INTERVAL);
                loop {
                    interval.tick().await;
                    info!("cleaning up stale mails");
                    let cutoff = Utc::now() - MAIL_RETENTION;
                    match ctx.storage.delete_mails_older_than(cutoff).await {
                        Ok(count) => debug!(count, "cleaned up stale mails"),
                        Err(err) => debug!(err = %err, "could not clean up stale mails"),
                    }
                }
            })
        };

        let mut workers = self.workers.lock().expect("mail workers lock poisoned");
        workers.push(smtp_worker);
        workers.push(sweeper);
        Ok(())
    }

    async fn handle(&self, request: Request<'_>) -> Outcome {
        if !request.interactive {
            return Outcome::fail(1, anyhow!("mail app can only be run interactively"));
        }

        let ui = UiSession::start(
            self.ctx.clone(),
            request.io,
            request.account,
            request.pubkey_wire,
        )
        .await;
        let mut ui = match ui {
            Ok(ui) => ui,
            Err(err) => return Outcome::fail(1, err),
        };

        let outcome = tui::mail_ui::run(&mut ui).await;
        let closed = ui.close().await;
        match outcome.and(closed) {
            Ok(()) => Outcome::ok(),
            Err(err) => Outcome::fail(1, err),
        }
    }

    fn has_ui(&self) -> bool {
        true
    }

    async fn run_ui(&self, ui: &mut UiSession<'_>) -> Result<()> {
        tui::mail_ui::run(ui).await
    }

    async fn cleanup(&self) {
        let workers = {
            let mut workers = self.workers.lock().expect("mail workers lock poisoned");
            std::mem::take(&mut *workers)
        };
        for worker in workers {
            worker.abort();
        }
    }
}
