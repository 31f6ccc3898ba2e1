//! Per-session plumbing and the request router.
//!
//! Each accepted channel gets a task running [`run`]: resolve the account,
//! then either hand the session to the interactive menu or parse the
//! command line and dispatch to the owning app.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::apps::{self, args, Outcome, Registry, Request};
use crate::ssh::resolver;
use crate::tui::{self, UiSession};
use crate::AppContext;

/// Raw events the connection handler forwards into a session task.
#[derive(Debug)]
pub enum SessionInput {
    Data(Vec<u8>),
    Resize(u16, u16),
    Eof,
}

#[derive(Debug, Clone)]
pub struct PtyInfo {
    pub term: String,
    pub width: u16,
    pub height: u16,
}

/// The session-side ends of an SSH channel.
pub struct SessionIo {
    handle: Handle,
    channel: ChannelId,
    input: mpsc::UnboundedReceiver<SessionInput>,
    pub pty: Option<PtyInfo>,
    /// Input bytes received but not yet consumed by a line read.
    pending: VecDeque<u8>,
    eof: bool,
}

impl SessionIo {
    pub fn new(
        handle: Handle,
        channel: ChannelId,
        input: mpsc::UnboundedReceiver<SessionInput>,
        pty: Option<PtyInfo>,
    ) -> Self {
        Self {
            handle,
            channel,
            input,
            pty,
            pending: VecDeque::new(),
            eof: false,
        }
    }

    pub fn is_interactive(&self) -> bool {
        self.pty.is_some()
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub async fn write(&self, bytes: &[u8]) -> Result<()> {
        self.handle
            .data(self.channel, CryptoVec::from(bytes.to_vec()))
            .await
            .map_err(|_| anyhow::anyhow!("session closed while writing"))
    }

    pub async fn write_str(&self, text: &str) -> Result<()> {
        self.write(text.as_bytes()).await
    }

    pub async fn write_line(&self, text: &str) -> Result<()> {
        self.write_str(&format!("{text}\r\n")).await
    }

    /// Writes a line to the session's stderr stream.
    pub async fn write_err_line(&self, text: &str) -> Result<()> {
        self.handle
            .extended_data(
                self.channel,
                1,
                CryptoVec::from(format!("{text}\r\n").into_bytes()),
            )
            .await
            .map_err(|_| anyhow::anyhow!("session closed while writing"))
    }

    /// Next raw input event. Buffered bytes take precedence so interleaved
    /// line reads and event reads observe input in order.
    pub async fn next_input(&mut self) -> SessionInput {
        if !self.pending.is_empty() {
            let bytes: Vec<u8> = self.pending.drain(..).collect();
            return SessionInput::Data(bytes);
        }
        if self.eof {
            return SessionInput::Eof;
        }
        match self.input.recv().await {
            Some(SessionInput::Eof) | None => {
                self.eof = true;
                SessionInput::Eof
            }
            Some(event) => event,
        }
    }

    /// Reads one line of input, echoing when the session has a PTY (raw
    /// mode clients rely on the server to echo).
    pub async fn read_line(&mut self) -> Result<String> {
        let echo = self.is_interactive();
        let mut line: Vec<u8> = Vec::new();

        loop {
            while let Some(byte) = self.pending.pop_front() {
                match byte {
                    b'\r' | b'\n' => {
                        if echo {
                            self.write(b"\r\n").await?;
                        }
                        return Ok(String::from_utf8_lossy(&line).trim().to_string());
                    }
                    0x7f | 0x08 => {
                        if line.pop().is_some() && echo {
                            self.write(b"\x08 \x08").await?;
                        }
                    }
                    0x03 | 0x04 => anyhow::bail!("input interrupted"),
                    byte => {
                        line.push(byte);
                        if echo {
                            self.write(&[byte]).await?;
                        }
                    }
                }
            }

            if self.eof {
                return Ok(String::from_utf8_lossy(&line).trim().to_string());
            }
            match self.input.recv().await {
                Some(SessionInput::Data(bytes)) => self.pending.extend(bytes),
                Some(SessionInput::Resize(..)) => {}
                Some(SessionInput::Eof) | None => self.eof = true,
            }
        }
    }

    /// Reads the whole input stream, stopping early once more than `limit`
    /// bytes have arrived.
    pub async fn read_to_limit(&mut self, limit: usize) -> Result<Vec<u8>> {
        let mut data: Vec<u8> = self.pending.drain(..).collect();

        while data.len() <= limit && !self.eof {
            match self.input.recv().await {
                Some(SessionInput::Data(bytes)) => data.extend(bytes),
                Some(SessionInput::Resize(..)) => {}
                Some(SessionInput::Eof) | None => self.eof = true,
            }
        }
        Ok(data)
    }

    /// Reports the exit status and closes the channel.
    pub async fn exit(&self, code: i32) {
        let _ = self
            .handle
            .exit_status_request(self.channel, code.max(0) as u32)
            .await;
        let _ = self.handle.eof(self.channel).await;
        let _ = self.handle.close(self.channel).await;
    }
}

/// Everything a spawned session task needs to serve one channel.
pub struct SessionTask {
    pub ctx: Arc<AppContext>,
    pub registry: Arc<Registry>,
    pub io: SessionIo,
    pub username: String,
    pub pubkey_wire: Option<Vec<u8>>,
    pub command: Vec<String>,
}

/// Runs a full session: request log, account resolution, routing, exit.
pub async fn run(task: SessionTask) {
    let SessionTask {
        ctx,
        registry,
        mut io,
        username,
        pubkey_wire,
        command,
    } = task;

    let at = Instant::now();
    let term = io.pty.as_ref().map(|pty| pty.term.clone());
    info!(
        user = %username,
        interactive = io.is_interactive(),
        term = term.as_deref().unwrap_or(""),
        "client connected",
    );

    let code = serve(&ctx, &registry, &mut io, &username, pubkey_wire, command).await;
    io.exit(code).await;

    info!(user = %username, alive = ?at.elapsed(), "client disconnected");
}

async fn serve(
    ctx: &Arc<AppContext>,
    registry: &Arc<Registry>,
    io: &mut SessionIo,
    username: &str,
    pubkey_wire: Option<Vec<u8>>,
    command: Vec<String>,
) -> i32 {
    // Bind the session to an account before anything else.
    let account = match resolver::resolve(ctx, io, username, pubkey_wire.as_deref()).await {
        Ok(account) => account,
        Err(err) => {
            let _ = io.write_line(&format!("{err:#}")).await;
            return 1;
        }
    };
    let account_id = account.id;

    let code = route(ctx, registry, io, account, pubkey_wire, command).await;

    // Drain any waiters this session registered on the buses.
    ctx.cleanup_session_signals(account_id);
    code
}

async fn route(
    ctx: &Arc<AppContext>,
    registry: &Arc<Registry>,
    io: &mut SessionIo,
    account: crate::storage::AccountRow,
    pubkey_wire: Option<Vec<u8>>,
    command: Vec<String>,
) -> i32 {
    let interactive = io.is_interactive();

    // No explicit app requested: present the menu.
    if command.is_empty() && interactive {
        let mut ui = match UiSession::start(ctx.clone(), io, account, pubkey_wire).await {
            Ok(ui) => ui,
            Err(err) => {
                error!(err = %err, "could not start terminal session");
                return 1;
            }
        };
        let outcome = tui::menu::run(&mut ui, registry).await;
        let closed = ui.close().await;
        return match (outcome, closed) {
            (Ok(()), Ok(())) => 0,
            (Err(err), _) | (_, Err(err)) => {
                error!(err = %err, "interactive session failed");
                1
            }
        };
    }

    let parsed = args::parse(&command);
    let command = match parsed {
        args::ParseOutcome::Consumed { retcode, output } => {
            let write = if retcode == 0 {
                io.write_str(&output).await
            } else {
                io.write_err_line(&output).await
            };
            let _ = write;
            return retcode;
        }
        args::ParseOutcome::Command(command) => command,
    };

    let Some(app) = apps::find(registry, command.app_name()) else {
        let _ = io
            .write_err_line(&format!("{} app is disabled", command.app_name()))
            .await;
        return 1;
    };
    let app = app.clone();

    let name = app.info().name;
    let Outcome { retcode, error } = app
        .handle(Request {
            command,
            io,
            account: account.clone(),
            pubkey_wire,
            interactive,
        })
        .await;

    match error {
        None => retcode,
        Some(err) => {
            error!(
                app = name,
                account = account.id,
                err = %err,
                "could not process the request",
            );
            let _ = io
                .write_err_line(&format!("could not process your request: {err:#}"))
                .await;
            retcode.max(1)
        }
    }
}

/// Splits an exec request into argv words, honoring shell quoting.
pub fn split_command(raw: &str) -> Result<Vec<String>> {
    shell_words::split(raw.trim()).context("could not parse command line")
}
