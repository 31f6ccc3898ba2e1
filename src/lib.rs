pub mod accounts;
pub mod apps;
pub mod bus;
pub mod clipboard;
pub mod config;
pub mod mail;
pub mod ssh;
pub mod storage;
pub mod tui;

use std::sync::Arc;

use bus::SignalBus;
use config::Config;
use storage::Storage;

/// Shared application state passed to every app, session task and
/// background worker.
pub struct AppContext {
    pub config: Arc<Config>,
    pub storage: Arc<Storage>,
    /// Fires (account id → mailbox id) whenever a mail lands in a mailbox.
    pub mail_signal: SignalBus<i64, i64>,
    /// Fires (account id → clipboard item id) whenever the clipboard changes.
    pub clipboard_signal: SignalBus<i64, i64>,
}

impl AppContext {
    pub fn new(config: Arc<Config>, storage: Arc<Storage>) -> Self {
        Self {
            config,
            storage,
            mail_signal: SignalBus::new(),
            clipboard_signal: SignalBus::new(),
        }
    }

    /// Drain every waiter registered for an account. Must run when a
    /// session ends so abandoned waits resolve instead of leaking.
    pub fn cleanup_session_signals(&self, account_id: i64) {
        self.mail_signal.cleanup(account_id);
        self.clipboard_signal.cleanup(account_id);
    }
}
