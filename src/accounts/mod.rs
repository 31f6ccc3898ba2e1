//! Key and token management, and account deletion.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::DateTime;

use crate::apps::args::AccountsCommand;
use crate::apps::{App, AppCommand, AppInfo, Outcome, Request};
use crate::ssh::resolver;
use crate::storage::DEFAULT_TOKEN_TTL;
use crate::AppContext;

pub struct AccountsApp {
    ctx: Arc<AppContext>,
}

impl AccountsApp {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    async fn serve(&self, request: &mut Request<'_>) -> Result<()> {
        let command = match &request.command {
            AppCommand::Accounts { command } => command.clone(),
            _ => return Err(anyhow!("unknown operation")),
        };
        let account = request.account.clone();

        match command {
            AccountsCommand::ListKeys => {
                let keys = self
                    .ctx
                    .storage
                    .list_keys(account.id)
                    .await
                    .context("could not list keys")?;
                for key in keys {
                    request
                        .io
                        .write_line(&format!(
                            "{} {}",
                            short_timestamp(&key.created_at),
                            key.fingerprint
                        ))
                        .await?;
                }
            }

            AccountsCommand::AddKey { key } => {
                self.ctx
                    .storage
                    .add_key(account.id, &key)
                    .await
                    .context("could not add key")?;
            }

            AccountsCommand::RemoveKey { key } => {
                self.ctx
                    .storage
                    .remove_key(account.id, &key)
                    .await
                    .context("could not remove key")?;
            }

            AccountsCommand::ListTokens => {
                let tokens = self
                    .ctx
                    .storage
                    .list_tokens(account.id)
                    .await
                    .context("could not list tokens")?;
                for token in tokens {
                    request
                        .io
                        .write_line(&format!(
                            "{} {} (expires {})",
                            short_timestamp(&token.created_at),
                            token.name,
                            short_timestamp(&token.expires_at),
                        ))
                        .await?;
                }
            }

            AccountsCommand::IssueToken { validity } => {
                let ttl = validity
                    .and_then(|v| chrono::Duration::from_std(v).ok())
                    .unwrap_or(DEFAULT_TOKEN_TTL);
                let token = self
                    .ctx
                    .storage
                    .issue_token(account.id, ttl)
                    .await
                    .context("could not issue token")?;

                request.io.write_line(&token.token).await?;
                request.io.write_line("").await?;
                request
                    .io
                    .write_line("You can use it to login with,")
                    .await?;
                request
                    .io
                    .write_line(&format!(
                        "ssh {}@{}",
                        token.token,
                        self.ctx.config.host_label()
                    ))
                    .await?;
            }

            AccountsCommand::RemoveToken { name } => {
                let affected = self
                    .ctx
                    .storage
                    .remove_token(account.id, &name)
                    .await
                    .context("could not delete tokens")?;
                request
                    .io
                    .write_line(&format!("{affected} token(s) deleted"))
                    .await?;
            }

            AccountsCommand::DeleteAccount => {
                let consent = resolver::ask_consent(
                    request.io,
                    &format!(
                        "This operation will delete your account on {}.\r\n\
                         Are you sure? (yes/no) ",
                        self.ctx.config.host_label()
                    ),
                )
                .await?;
                if !consent {
                    return Err(anyhow!("aborting account deletion operation"));
                }

                self.ctx
                    .storage
                    .delete_account(account.id)
                    .await
                    .context("could not delete account")?;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl App for AccountsApp {
    fn info(&self) -> AppInfo {
        AppInfo {
            name: "accounts",
            title: "Accounts",
            description: "Manage your account",
        }
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn handle(&self, mut request: Request<'_>) -> Outcome {
        match self.serve(&mut request).await {
            Ok(()) => Outcome::ok(),
            Err(err) => Outcome::fail(1, err),
        }
    }

    async fn cleanup(&self) {}
}

/// Renders a stored RFC 3339 timestamp the way a key listing wants it.
fn short_timestamp(value: &str) -> String {
    match DateTime::parse_from_rfc3339(value) {
        Ok(at) => at.format("%Y-%m-%d %H:%M:%S").to_string(),
        Err(_) => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_render_compactly() {
        assert_eq!(
            short_timestamp("2026-03-01T09:30:00+00:00"),
            "2026-03-01 09:30:00"
        );
        // Unparseable values pass through untouched.
        assert_eq!(short_timestamp("not a time"), "not a time");
    }
}
