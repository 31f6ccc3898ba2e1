//! The SSH front door.
//!
//! Accepts connections, optionally gated by an authorized_keys ACL, and
//! spawns a session task per channel. Identity beyond the ACL is
//! established at the application layer by the account resolver.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use russh::server::{Auth, Config, Handler, Msg, Server, Session};
use russh::{Channel, ChannelId, Pty};
use russh_keys::key::{KeyPair, PublicKey};
use russh_keys::PublicKeyBase64;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::apps::Registry;
use crate::ssh::fingerprint;
use crate::ssh::session::{self, PtyInfo, SessionInput, SessionIo, SessionTask};
use crate::AppContext;

pub async fn serve(ctx: Arc<AppContext>, registry: Arc<Registry>) -> Result<()> {
    let key = load_or_create_host_key(&ctx.config.ssh_host_key_path)?;

    let acl = match &ctx.config.ssh_authorized_keys_path {
        Some(path) => Some(Arc::new(load_authorized_keys(path)?)),
        None => None,
    };

    let config = Arc::new(Config {
        auth_rejection_time: Duration::from_secs(3),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keys: vec![key],
        ..Default::default()
    });

    info!(at = %ctx.config.ssh_bind_addr, "starting ssh server");
    let mut server = SshServer { ctx, registry, acl };
    let addr = server.ctx.config.ssh_bind_addr.clone();
    server
        .run_on_address(config, addr.as_str())
        .await
        .context("failed serving ssh connections")?;
    Ok(())
}

struct SshServer {
    ctx: Arc<AppContext>,
    registry: Arc<Registry>,
    acl: Option<Arc<HashSet<String>>>,
}

impl Server for SshServer {
    type Handler = ClientHandler;

    fn new_client(&mut self, _peer: Option<std::net::SocketAddr>) -> ClientHandler {
        ClientHandler {
            ctx: self.ctx.clone(),
            registry: self.registry.clone(),
            acl: self.acl.clone(),
            username: String::new(),
            pubkey_wire: None,
            channels: HashMap::new(),
        }
    }
}

/// State for one open channel before its session task starts.
struct ChannelState {
    input_tx: mpsc::UnboundedSender<SessionInput>,
    input_rx: Option<mpsc::UnboundedReceiver<SessionInput>>,
    pty: Option<PtyInfo>,
    started: bool,
}

pub struct ClientHandler {
    ctx: Arc<AppContext>,
    registry: Arc<Registry>,
    acl: Option<Arc<HashSet<String>>>,
    username: String,
    pubkey_wire: Option<Vec<u8>>,
    channels: HashMap<ChannelId, ChannelState>,
}

impl ClientHandler {
    /// Moves the channel into a running session task. Subsequent shell or
    /// exec requests on the same channel are ignored.
    fn start_session(&mut self, channel: ChannelId, session: &Session, command: Vec<String>) {
        let Some(state) = self.channels.get_mut(&channel) else {
            return;
        };
        if state.started {
            return;
        }
        let Some(input_rx) = state.input_rx.take() else {
            return;
        };
        state.started = true;

        let io = SessionIo::new(session.handle(), channel, input_rx, state.pty.clone());
        let task = SessionTask {
            ctx: self.ctx.clone(),
            registry: self.registry.clone(),
            io,
            username: self.username.clone(),
            pubkey_wire: self.pubkey_wire.clone(),
            command,
        };
        tokio::spawn(session::run(task));
    }

    fn forward(&mut self, channel: ChannelId, input: SessionInput) {
        if let Some(state) = self.channels.get(&channel) {
            let _ = state.input_tx.send(input);
        }
    }
}

#[async_trait]
impl Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let wire = key.public_key_bytes();

        if let Some(acl) = &self.acl {
            if !acl.contains(&fingerprint(&wire)) {
                info!(user, "rejected key not present in authorized_keys");
                return Ok(Auth::Reject {
                    proceed_with_methods: None,
                });
            }
        }

        self.username = user.to_string();
        self.pubkey_wire = Some(wire);
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        self.channels.insert(
            channel.id(),
            ChannelState {
                input_tx,
                input_rx: Some(input_rx),
                pty: None,
                started: false,
            },
        );
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            state.pty = Some(PtyInfo {
                term: term.to_string(),
                width: col_width.max(1) as u16,
                height: row_height.max(1) as u16,
            });
        }
        session.channel_success(channel);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(
            channel,
            SessionInput::Resize(col_width.max(1) as u16, row_height.max(1) as u16),
        );
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.start_session(channel, session, Vec::new());
        session.channel_success(channel);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let raw = String::from_utf8_lossy(data).to_string();
        match session::split_command(&raw) {
            Ok(command) => {
                self.start_session(channel, session, command);
                session.channel_success(channel);
            }
            Err(err) => {
                warn!(err = %err, "unparseable exec request");
                session.channel_failure(channel);
            }
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, SessionInput::Data(data.to_vec()));
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, SessionInput::Eof);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        Ok(())
    }
}

/// Loads the host key, generating and persisting one on first start.
/// Failing to write the key file is fatal.
fn load_or_create_host_key(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        return russh_keys::load_secret_key(path, None)
            .with_context(|| format!("could not load host key from {}", path.display()));
    }

    info!(path = %path.display(), "generating ssh host key");
    let key = russh_keys::key::KeyPair::generate_ed25519()
        .context("could not generate host key")?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("could not create {}", parent.display()))?;
    }
    let file = std::fs::File::create(path)
        .with_context(|| format!("could not create host key file {}", path.display()))?;
    russh_keys::encode_pkcs8_pem(&key, file).context("could not write host key")?;

    Ok(key)
}

/// Parses an authorized_keys file into the set of admissible fingerprints.
fn load_authorized_keys(path: &Path) -> Result<HashSet<String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("could not read authorized_keys at {}", path.display()))?;

    let mut keys = HashSet::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        // "<algo> <base64> [comment]"
        let mut fields = line.split_whitespace();
        let (Some(_algo), Some(blob)) = (fields.next(), fields.next()) else {
            continue;
        };
        match russh_keys::parse_public_key_base64(blob) {
            Ok(key) => {
                keys.insert(fingerprint(&key.public_key_bytes()));
            }
            Err(err) => warn!(err = %err, "skipping unparseable authorized_keys entry"),
        }
    }
    Ok(keys)
}
