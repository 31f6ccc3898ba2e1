//! Binds an incoming session to an account.
//!
//! Resolution order: bearer token carried in the SSH username, then the
//! public key fingerprint, then — interactively — an offer to create an
//! account keyed on the presented public key.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::info;

use crate::ssh::fingerprint;
use crate::ssh::session::SessionIo;
use crate::storage::AccountRow;
use crate::AppContext;

pub async fn resolve(
    ctx: &Arc<AppContext>,
    io: &mut SessionIo,
    username: &str,
    pubkey_wire: Option<&[u8]>,
) -> Result<AccountRow> {
    // We always receive a username even when the client didn't set one
    // explicitly, so an unknown token is not an error by itself.
    let token = username.trim();
    if !token.is_empty() {
        if let Some(account) = ctx
            .storage
            .account_by_token(token)
            .await
            .context("could not look up token")?
        {
            info!(account = account.id, "resolved account from token");
            return Ok(account);
        }
    }

    let fp = pubkey_wire.map(fingerprint);
    if let Some(fp) = &fp {
        if let Some(account) = ctx
            .storage
            .account_by_fingerprint(fp)
            .await
            .context("could not look up key")?
        {
            info!(account = account.id, "resolved account from public key");
            return Ok(account);
        }
    }

    if !io.is_interactive() {
        return Err(anyhow!(
            "could not find an account with your username or public key: \
             try interactive mode to create one"
        ));
    }

    let consent = ask_consent(
        io,
        "We could not find an account with your username or public key.\r\n\
         Would you like to create one? (yes/no) ",
    )
    .await?;
    if !consent {
        return Err(anyhow!("not creating account, have a good day :)"));
    }

    let fp = fp.ok_or_else(|| anyhow!("cannot create an account without a public key"))?;
    let account = ctx
        .storage
        .create_account(&fp)
        .await
        .context("could not create account")?;
    info!(account = account.id, "created account interactively");
    Ok(account)
}

/// Prompts the session and reads a single line of consent.
pub async fn ask_consent(io: &mut SessionIo, prompt: &str) -> Result<bool> {
    io.write_str(prompt).await?;
    let reply = io.read_line().await?;
    Ok(reply.trim().eq_ignore_ascii_case("yes"))
}
