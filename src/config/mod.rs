use std::path::PathBuf;

/// Runtime configuration, resolved once at startup from the command line
/// and environment (see the `Args` struct in `main.rs`).
#[derive(Debug, Clone)]
pub struct Config {
    pub db_uri: String,
    pub db_migrate: bool,

    pub ssh_bind_addr: String,
    pub ssh_host_key_path: PathBuf,
    /// When set, only keys listed in this file may connect at all.
    pub ssh_authorized_keys_path: Option<PathBuf>,

    /// The domain this server accepts inbound mail for.
    pub mx_host: String,
    pub smtp_bind_addr: String,

    pub mail_app_enabled: bool,
    pub clipboard_app_enabled: bool,

    /// Upper bound on a clipboard payload, in bytes.
    pub clipboard_max_content_size: usize,
    /// How long a clipboard item survives before the sweeper removes it.
    pub clipboard_retention: std::time::Duration,

    /// Server-side salt mixed into every clipboard encryption key.
    /// Rotating it invalidates all stored clipboards.
    pub entropy: String,
}

impl Config {
    /// The hostname users see in mailbox addresses and login hints.
    pub fn host_label(&self) -> &str {
        &self.mx_host
    }
}
