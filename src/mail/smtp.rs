//! Inbound SMTP front door.
//!
//! Implements the canonical receive-only state machine: EHLO/HELO, MAIL,
//! RCPT, DATA, RSET, NOOP, QUIT. Messages are accepted for mailboxes that
//! already exist or can be wildcard-provisioned from a reserved account
//! prefix; everything else is rejected at RCPT time.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mailparse::MailHeaderMap;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::mail::{names, parse};
use crate::storage::MailboxRow;
use crate::AppContext;

/// Hung SMTP peers are cut off after this long without a command.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// Upper bound on an accepted message, headers included.
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Binds the SMTP listener. Called during app init so a bind failure is a
/// startup failure, not a background one.
pub async fn bind(ctx: &AppContext) -> Result<TcpListener> {
    let listener = TcpListener::bind(&ctx.config.smtp_bind_addr)
        .await
        .with_context(|| format!("could not bind smtp on {}", ctx.config.smtp_bind_addr))?;
    info!(at = %ctx.config.smtp_bind_addr, "starting smtp server");
    Ok(listener)
}

pub async fn serve(ctx: Arc<AppContext>, listener: TcpListener) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            debug!(%peer, "smtp client connected");
            if let Err(err) = handle_session(ctx, stream).await {
                debug!(%peer, err = %err, "smtp session ended abnormally");
            }
        });
    }
}

/// A single mail transaction being assembled over a connection.
#[derive(Default)]
struct Transaction {
    from: Option<String>,
    mailboxes: Vec<MailboxRow>,
}

/// Drives one SMTP connection. Generic over the stream so tests can run it
/// over an in-memory pipe.
pub async fn handle_session<S>(ctx: Arc<AppContext>, stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    let mx = ctx.config.mx_host.clone();
    write_reply(&mut writer, &format!("220 {mx} ESMTP service ready")).await?;

    let mut transaction = Transaction::default();
    let mut line = String::new();

    loop {
        line.clear();
        let read = tokio::time::timeout(COMMAND_TIMEOUT, reader.read_line(&mut line))
            .await
            .context("smtp command timeout")??;
        if read == 0 {
            return Ok(());
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        let (verb, args) = split_command(trimmed);

        match verb.as_str() {
            "EHLO" | "HELO" => {
                transaction = Transaction::default();
                write_reply(&mut writer, &format!("250 {mx} greets you")).await?;
            }

            "MAIL" => {
                debug!(from = args, "> MAIL");
                match parse_path(args, "FROM:") {
                    Some(address) if address_domain(&address) == Some(mx.as_str()) => {
                        write_reply(&mut writer, "550 outgoing email not supported").await?;
                    }
                    Some(address) => {
                        transaction.from = Some(address);
                        transaction.mailboxes.clear();
                        write_reply(&mut writer, "250 OK").await?;
                    }
                    None => {
                        write_reply(&mut writer, "501 could not parse from address").await?;
                    }
                }
            }

            "RCPT" => {
                debug!(to = args, "> RCPT");
                if transaction.from.is_none() {
                    write_reply(&mut writer, "503 need MAIL before RCPT").await?;
                    continue;
                }
                let Some(address) = parse_path(args, "TO:") else {
                    write_reply(&mut writer, "501 could not parse recipient address").await?;
                    continue;
                };
                if address_domain(&address) != Some(mx.as_str()) {
                    write_reply(&mut writer, &format!("550 unrecognized domain: {address}"))
                        .await?;
                    continue;
                }

                let local = address.split('@').next().unwrap_or_default();
                match names::resolve_delivery(&ctx.storage, local).await {
                    Ok(mailbox) => {
                        debug!(mailbox = mailbox.id, "found matching mailbox");
                        transaction.mailboxes.push(mailbox);
                        write_reply(&mut writer, "250 OK").await?;
                    }
                    Err(names::DeliveryError::UnknownRecipient) => {
                        write_reply(&mut writer, &format!("550 unknown recipient: {address}"))
                            .await?;
                    }
                    Err(err) => {
                        warn!(err = %err, "recipient lookup failed");
                        write_reply(&mut writer, "451 could not look up recipient").await?;
                    }
                }
            }

            "DATA" => {
                if transaction.mailboxes.is_empty() {
                    write_reply(&mut writer, "503 need RCPT before DATA").await?;
                    continue;
                }
                write_reply(&mut writer, "354 end data with <CRLF>.<CRLF>").await?;

                match read_data(&mut reader).await? {
                    Some(raw) => {
                        let delivered = deliver(&ctx, &transaction, &raw).await;
                        if delivered > 0 {
                            write_reply(&mut writer, "250 OK: message accepted").await?;
                        } else {
                            write_reply(&mut writer, "451 could not deliver message").await?;
                        }
                    }
                    None => {
                        write_reply(&mut writer, "552 message exceeds maximum size").await?;
                    }
                }
                transaction = Transaction::default();
            }

            "RSET" => {
                transaction = Transaction::default();
                write_reply(&mut writer, "250 OK").await?;
            }

            "NOOP" => {
                write_reply(&mut writer, "250 OK").await?;
            }

            "QUIT" => {
                write_reply(&mut writer, "221 bye").await?;
                return Ok(());
            }

            _ => {
                write_reply(&mut writer, "502 command not implemented").await?;
            }
        }
    }
}

/// Stores the message for every accumulated mailbox and wakes any live
/// session watching them. Per-mailbox failures are logged; the transaction
/// counts as delivered if at least one insert went through.
async fn deliver(ctx: &AppContext, transaction: &Transaction, raw: &[u8]) -> usize {
    let from_address = transaction.from.clone().unwrap_or_default();

    let parsed = match mailparse::parse_mail(raw) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(err = %err, "could not parse incoming message");
            return 0;
        }
    };
    let text = match parse::extract_plain_text(&parsed) {
        Ok(text) => text,
        Err(err) => {
            warn!(err = %err, "could not extract message text");
            return 0;
        }
    };
    let subject = parsed
        .headers
        .get_first_value("Subject")
        .unwrap_or_default();
    let from_name = parsed
        .headers
        .get_first_value("From")
        .and_then(|value| display_name(&value))
        .unwrap_or_default();

    let mut delivered = 0;
    for mailbox in &transaction.mailboxes {
        let inserted = ctx
            .storage
            .insert_mail(mailbox.id, &from_address, &from_name, &subject, &text)
            .await;
        match inserted {
            Ok(_) => {
                debug!(from = %from_address, mailbox = mailbox.id, "added mail to mailbox");
                ctx.mail_signal.emit(mailbox.account_id, mailbox.id);
                delivered += 1;
            }
            Err(err) => {
                info!(
                    from = %from_address,
                    mailbox = mailbox.id,
                    err = %err,
                    "could not add mail to mailbox",
                );
            }
        }
    }
    delivered
}

/// Reads the DATA payload up to the terminating dot line, undoing dot
/// stuffing. Returns `None` when the message exceeds the size cap (the
/// remainder is still drained so the connection stays usable).
async fn read_data<R>(reader: &mut BufReader<R>) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut raw: Vec<u8> = Vec::new();
    let mut oversized = false;
    let mut line = String::new();

    loop {
        line.clear();
        let read = tokio::time::timeout(COMMAND_TIMEOUT, reader.read_line(&mut line))
            .await
            .context("smtp data timeout")??;
        if read == 0 {
            anyhow::bail!("connection closed inside DATA");
        }

        let body = line.trim_end_matches(['\r', '\n']);
        if body == "." {
            break;
        }
        if oversized {
            continue;
        }

        let body = if body.starts_with("..") { &body[1..] } else { body };
        raw.extend_from_slice(body.as_bytes());
        raw.extend_from_slice(b"\r\n");
        if raw.len() > MAX_MESSAGE_SIZE {
            oversized = true;
        }
    }

    Ok(if oversized { None } else { Some(raw) })
}

fn split_command(line: &str) -> (String, &str) {
    match line.split_once(' ') {
        Some((verb, rest)) => (verb.to_ascii_uppercase(), rest.trim()),
        None => (line.to_ascii_uppercase(), ""),
    }
}

/// Extracts the address out of a `FROM:<a@b>` / `TO:<a@b>` argument.
fn parse_path(args: &str, keyword: &str) -> Option<String> {
    let rest = strip_keyword(args, keyword)?;
    let address = match (rest.find('<'), rest.rfind('>')) {
        (Some(open), Some(close)) if open < close => &rest[open + 1..close],
        _ => rest,
    };
    let address = address.trim();
    if address.is_empty() || !address.contains('@') {
        return None;
    }
    Some(address.to_string())
}

fn strip_keyword<'a>(args: &'a str, keyword: &str) -> Option<&'a str> {
    if args.len() < keyword.len() || !args[..keyword.len()].eq_ignore_ascii_case(keyword) {
        return None;
    }
    Some(args[keyword.len()..].trim())
}

fn address_domain(address: &str) -> Option<&str> {
    address.rsplit_once('@').map(|(_, domain)| domain)
}

/// Pulls the display name out of a From header, if it carries one.
fn display_name(header: &str) -> Option<String> {
    let parsed = mailparse::addrparse(header).ok()?;
    match parsed.first()? {
        mailparse::MailAddr::Single(single) => single.display_name.clone(),
        mailparse::MailAddr::Group(group) => Some(group.group_name.clone()),
    }
}

async fn write_reply<W>(writer: &mut W, reply: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(reply.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_split_uppercases_the_verb() {
        assert_eq!(split_command("mail FROM:<a@b>"), ("MAIL".into(), "FROM:<a@b>"));
        assert_eq!(split_command("quit"), ("QUIT".into(), ""));
    }

    #[test]
    fn path_parsing_handles_brackets_and_bare_addresses() {
        assert_eq!(
            parse_path("FROM:<sender@example.org>", "FROM:"),
            Some("sender@example.org".into())
        );
        assert_eq!(
            parse_path("from: sender@example.org", "FROM:"),
            Some("sender@example.org".into())
        );
        assert_eq!(parse_path("FROM:<>", "FROM:"), None);
        assert_eq!(parse_path("TO:<x@y>", "FROM:"), None);
    }

    #[test]
    fn domains_are_extracted_from_the_right() {
        assert_eq!(address_domain("a@b@c"), Some("c"));
        assert_eq!(address_domain("plain"), None);
    }

    #[test]
    fn display_names_come_from_the_header() {
        assert_eq!(
            display_name("Jane Doe <jane@example.org>"),
            Some("Jane Doe".into())
        );
        assert_eq!(display_name("jane@example.org"), None);
    }
}
