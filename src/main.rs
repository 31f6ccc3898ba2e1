use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use campd::accounts::AccountsApp;
use campd::apps::Registry;
use campd::clipboard::ClipboardApp;
use campd::config::Config;
use campd::mail::MailApp;
use campd::ssh::server;
use campd::storage::Storage;
use campd::AppContext;
use clap::Parser;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "campd",
    about = "Disposable mailboxes and a shared clipboard, served over SSH",
    version
)]
struct Args {
    /// SQLite database URI
    #[arg(long, default_value = "sqlite:campd.db", env = "DB_URI")]
    db_uri: String,

    /// Create the database schema on startup
    #[arg(long, default_value_t = true, env = "DB_MIGRATE", action = clap::ArgAction::Set)]
    db_migrate: bool,

    /// SSH listen address
    #[arg(long, default_value = "127.0.0.1:2222", env = "SSH_BIND_ADDR")]
    ssh_bind_addr: String,

    /// SSH host key path (generated on first start)
    #[arg(long, default_value = "campd_host_key", env = "SSH_HOST_KEY_PATH")]
    ssh_host_key_path: PathBuf,

    /// Restrict connections to keys listed in this file
    #[arg(long, env = "SSH_AUTHORIZED_KEYS_PATH")]
    ssh_authorized_keys_path: Option<PathBuf>,

    /// The domain inbound mail is accepted for
    #[arg(long, default_value = "localhost", env = "MX_HOST")]
    mx_host: String,

    /// SMTP listen address
    #[arg(long, default_value = "127.0.0.1:1025", env = "SMTP_BIND_ADDR")]
    smtp_bind_addr: String,

    /// Serve the mail app
    #[arg(long, default_value_t = true, env = "MAIL_APP_ENABLED", action = clap::ArgAction::Set)]
    mail_app_enabled: bool,

    /// Serve the clipboard app
    #[arg(long, default_value_t = true, env = "CLIPBOARD_APP_ENABLED", action = clap::ArgAction::Set)]
    clipboard_app_enabled: bool,

    /// Largest accepted clipboard payload, in bytes
    #[arg(long, default_value_t = 8208, env = "CLIPBOARD_MAX_CONTENTS_SIZE")]
    clipboard_max_contents_size: usize,

    /// Seconds a clipboard item survives before it is swept
    #[arg(long, default_value_t = 300, env = "CLIPBOARD_RETENTION_SECS")]
    clipboard_retention_secs: u64,

    /// Server-side salt for clipboard encryption keys. Required; rotate to
    /// invalidate all stored clipboards.
    #[arg(long, env = "ENTROPY")]
    entropy: String,

    /// Log filter (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "CAMPD_LOG")]
    log: String,

    /// Shorthand for --log debug
    #[arg(long, env = "DEBUG", action = clap::ArgAction::SetTrue)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug { "debug" } else { args.log.as_str() };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .init();
    info!(version = env!("CARGO_PKG_VERSION"), "starting up");

    let config = Arc::new(Config {
        db_uri: args.db_uri,
        db_migrate: args.db_migrate,
        ssh_bind_addr: args.ssh_bind_addr,
        ssh_host_key_path: args.ssh_host_key_path,
        ssh_authorized_keys_path: args.ssh_authorized_keys_path,
        mx_host: args.mx_host,
        smtp_bind_addr: args.smtp_bind_addr,
        mail_app_enabled: args.mail_app_enabled,
        clipboard_app_enabled: args.clipboard_app_enabled,
        clipboard_max_content_size: args.clipboard_max_contents_size,
        clipboard_retention: Duration::from_secs(args.clipboard_retention_secs),
        entropy: args.entropy,
    });

    let storage = Arc::new(
        Storage::connect(&config.db_uri, config.db_migrate)
            .await
            .context("opening db failed")?,
    );

    let ctx = Arc::new(AppContext::new(config.clone(), storage));

    let mut registry: Registry = vec![Arc::new(AccountsApp::new(ctx.clone()))];
    if config.mail_app_enabled {
        registry.push(Arc::new(MailApp::new(ctx.clone())));
    }
    if config.clipboard_app_enabled {
        registry.push(Arc::new(ClipboardApp::new(ctx.clone())));
    }

    for app in &registry {
        info!(name = app.info().name, "enabling app");
    }
    for app in &registry {
        app.init()
            .await
            .with_context(|| format!("could not initialize {}", app.info().name))?;
    }

    let registry = Arc::new(registry);
    let result = tokio::select! {
        served = server::serve(ctx.clone(), registry.clone()) => served,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    };

    for app in registry.iter() {
        app.cleanup().await;
    }

    result
}
