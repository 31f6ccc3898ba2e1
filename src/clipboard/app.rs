//! The shared clipboard application: one encrypted slot per account.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::apps::args::ClipboardCommand;
use crate::apps::{App, AppCommand, AppInfo, Outcome, Request};
use crate::clipboard::crypto;
use crate::tui::{self, UiSession};
use crate::AppContext;

/// How often the retention sweeper wakes.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub struct ClipboardApp {
    ctx: Arc<AppContext>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ClipboardApp {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self {
            ctx,
            sweeper: Mutex::new(None),
        }
    }

    async fn put(&self, request: &mut Request<'_>) -> Result<()> {
        let max = self.ctx.config.clipboard_max_content_size;
        let value = request
            .io
            .read_to_limit(max)
            .await
            .context("could not read contents")?;
        if value.len() > max {
            anyhow::bail!(
                "could not put on the clipboard: contents exceed the max size limit of {max} bytes"
            );
        }
        if std::str::from_utf8(&value).is_err() {
            anyhow::bail!("could not put on the clipboard: contents are not a text string");
        }

        let wire = request
            .pubkey_wire
            .as_deref()
            .ok_or_else(|| anyhow!("clipboard needs a public key backed session"))?;
        let key = crypto::derive_key(wire, &self.ctx.config.entropy);
        let iv = crypto::random_iv();

        let mut ciphered = value;
        crypto::encrypt(&key, &iv, &mut ciphered)?;

        debug!(account = request.account.id, "creating clipboard item");
        let item_id = self
            .ctx
            .storage
            .put_clipboard(request.account.id, &iv, &ciphered)
            .await
            .context("could not write to database")?;

        // Wake any interactive session watching this clipboard.
        self.ctx.clipboard_signal.emit(request.account.id, item_id);
        Ok(())
    }

    async fn get(&self, request: &mut Request<'_>) -> Result<Option<()>> {
        let Some(item) = self
            .ctx
            .storage
            .get_clipboard(request.account.id)
            .await
            .context("could not fetch the clipboard")?
        else {
            return Ok(None);
        };

        let wire = request
            .pubkey_wire
            .as_deref()
            .ok_or_else(|| anyhow!("clipboard needs a public key backed session"))?;
        let key = crypto::derive_key(wire, &self.ctx.config.entropy);

        let mut value = item.value;
        crypto::decrypt(&key, &item.iv, &mut value)?;

        request
            .io
            .write(&value)
            .await
            .context("could not write to the session")?;
        Ok(Some(()))
    }
}

#[async_trait]
impl App for ClipboardApp {
    fn info(&self) -> AppInfo {
        AppInfo {
            name: "clipboard",
            title: "Clipboard",
            description: "Shared clipboard",
        }
    }

    async fn init(&self) -> Result<()> {
        debug!("initializing clipboard");

        // Clipboards are ephemeral; whatever survived the last run goes.
        let cleared = self.ctx.storage.delete_all_clipboards().await?;
        info!(count = cleared, "cleaning up all clipboard items");

        let worker = {
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(SWEEP_INTERVAL);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    info!("cleaning up expired clipboard items");
                    let retention = chrono::Duration::from_std(ctx.config.clipboard_retention)
                        .unwrap_or_else(|_| chrono::Duration::minutes(5));
                    let cutoff = Utc::now() - retention;
                    if let Err(err) = ctx.storage.delete_clipboards_older_than(cutoff).await {
                        debug!(err = %err, "could not clean up clipboard items");
                    }
                }
            })
        };
        *self.sweeper.lock().expect("clipboard sweeper lock poisoned") = Some(worker);
        Ok(())
    }

    async fn handle(&self, mut request: Request<'_>) -> Outcome {
        let command = match &request.command {
            AppCommand::Clipboard { command } => *command,
            _ => return Outcome::fail(1, anyhow!("unknown operation")),
        };

        // Interactive sessions get the viewer unless an explicitly
        // mutating subcommand was given.
        if request.interactive {
            if matches!(
                command,
                Some(ClipboardCommand::Put) | Some(ClipboardCommand::Clear)
            ) {
                return Outcome::fail(1, anyhow!("command not supported in interactive mode"));
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
            let outcome = tui::clipboard_ui::run(&mut ui).await;
            let closed = ui.close().await;
            return match outcome.and(closed) {
                Ok(()) => Outcome::ok(),
                Err(err) => Outcome::fail(1, err),
            };
        }

        match command {
            Some(ClipboardCommand::Put) => match self.put(&mut request).await {
                Ok(()) => Outcome::ok(),
                Err(err) => Outcome::fail(1, err),
            },
            Some(ClipboardCommand::Clear) => {
                match self.ctx.storage.delete_clipboard(request.account.id).await {
                    Ok(()) => Outcome::ok(),
                    Err(err) => Outcome::fail(
                        1,
                        anyhow::Error::new(err).context("could not clear the clipboard"),
                    ),
                }
            }
            Some(ClipboardCommand::Get) | None => match self.get(&mut request).await {
                // An empty clipboard prints nothing and signals via the
                // exit code.
                Ok(None) => Outcome::code(1),
                Ok(Some(())) => Outcome::ok(),
                Err(err) => Outcome::fail(1, err),
            },
        }
    }

    fn has_ui(&self) -> bool {
        true
    }

    async fn run_ui(&self, ui: &mut UiSession<'_>) -> Result<()> {
        tui::clipboard_ui::run(ui).await
    }

    async fn cleanup(&self) {
        debug!("cleaning up clipboard");
        if let Some(worker) = self
            .sweeper
            .lock()
            .expect("clipboard sweeper lock poisoned")
            .take()
        {
            worker.abort();
        }
    }
}
