//! The contract every embedded app implements, and the registry the
//! session router selects from.

pub mod args;

use anyhow::Result;
use async_trait::async_trait;

use crate::ssh::session::SessionIo;
use crate::storage::AccountRow;
use crate::tui::UiSession;

pub use args::{AppCommand, AppArgs};

#[derive(Debug, Clone, Copy)]
pub struct AppInfo {
    pub name: &'static str,
    pub title: &'static str,
    pub description: &'static str,
}

/// A request routed to an app after authentication and argument parsing.
pub struct Request<'a> {
    pub command: AppCommand,
    pub io: &'a mut SessionIo,
    pub account: AccountRow,
    /// Wire form of the public key the client authenticated with, when the
    /// session presented one.
    pub pubkey_wire: Option<Vec<u8>>,
    pub interactive: bool,
}

/// What a handled request resolves to. The session router prints the error
/// (if any) to the session's stderr and exits with the retcode, clamped to
/// at least 1 whenever an error is present.
pub struct Outcome {
    pub retcode: i32,
    pub error: Option<anyhow::Error>,
}

impl Outcome {
    pub fn ok() -> Self {
        Self { retcode: 0, error: None }
    }

    pub fn code(retcode: i32) -> Self {
        Self { retcode, error: None }
    }

    pub fn fail(retcode: i32, error: impl Into<anyhow::Error>) -> Self {
        Self {
            retcode,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait App: Send + Sync {
    /// Name (used for routing), title and description of the application.
    fn info(&self) -> AppInfo;

    /// Runs before any request is served. Workers are spawned here.
    async fn init(&self) -> Result<()>;

    /// Handles a routed request, interactively or not.
    async fn handle(&self, request: Request<'_>) -> Outcome;

    /// Whether the interactive menu offers this app.
    fn has_ui(&self) -> bool {
        false
    }

    /// Runs the app's interactive model inside an established terminal
    /// session. Only called when `has_ui` is true.
    async fn run_ui(&self, ui: &mut UiSession<'_>) -> Result<()> {
        let _ = ui;
        anyhow::bail!("{} does not support interactive mode", self.info().name)
    }

    /// Called during shutdown to stop workers.
    async fn cleanup(&self);
}

/// The set of enabled apps, in menu order.
pub type Registry = Vec<std::sync::Arc<dyn App>>;

/// Finds an enabled app by name.
pub fn find<'a>(registry: &'a Registry, name: &str) -> Option<&'a std::sync::Arc<dyn App>> {
    registry.iter().find(|app| app.info().name == name)
}
