//! SMTP front-door transactions over an in-memory pipe.

use std::sync::Arc;
use std::time::Duration;

use campd::config::Config;
use campd::mail::smtp;
use campd::storage::Storage;
use campd::AppContext;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};

const MX: &str = "camp.test";

async fn context() -> (TempDir, Arc<AppContext>) {
    let dir = TempDir::new().expect("tempdir");
    let uri = format!("sqlite:{}/test.db", dir.path().display());
    let storage = Arc::new(Storage::connect(&uri, true).await.expect("storage"));

    let config = Arc::new(Config {
        db_uri: uri,
        db_migrate: true,
        ssh_bind_addr: "127.0.0.1:0".into(),
        ssh_host_key_path: dir.path().join("host_key"),
        ssh_authorized_keys_path: None,
        mx_host: MX.into(),
        smtp_bind_addr: "127.0.0.1:0".into(),
        mail_app_enabled: true,
        clipboard_app_enabled: true,
        clipboard_max_content_size: 8208,
        clipboard_retention: Duration::from_secs(300),
        entropy: "test-entropy".into(),
    });

    (dir, Arc::new(AppContext::new(config, storage)))
}

struct Client {
    reader: BufReader<tokio::io::ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

/// Connects a client pipe to a spawned SMTP session and consumes the
/// greeting.
async fn connect(ctx: Arc<AppContext>) -> Client {
    let (client, server) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        let _ = smtp::handle_session(ctx, server).await;
    });

    let (read_half, writer) = tokio::io::split(client);
    let mut client = Client {
        reader: BufReader::new(read_half),
        writer,
    };
    let greeting = client.read_reply().await;
    assert!(greeting.starts_with("220"), "unexpected greeting: {greeting}");
    client
}

impl Client {
    async fn read_reply(&mut self) -> String {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("reply timeout")
            .expect("reply read");
        line.trim_end().to_string()
    }

    async fn send(&mut self, line: &str) -> String {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .expect("write");
        self.read_reply().await
    }

    /// Sends a DATA payload (terminator included) and returns the reply.
    async fn send_data(&mut self, body: &str) -> String {
        self.writer
            .write_all(body.as_bytes())
            .await
            .expect("write data");
        self.writer
            .write_all(b"\r\n.\r\n")
            .await
            .expect("write terminator");
        self.read_reply().await
    }
}

#[tokio::test]
async fn a_full_transaction_delivers_and_notifies() {
    let (_dir, ctx) = context().await;
    let account = ctx
        .storage
        .create_account("SHA256:deliverytestkeyfingerprint")
        .await
        .unwrap();
    let mailbox = ctx
        .storage
        .create_mailbox(account.id, "randomwordsmailbox")
        .await
        .unwrap();

    // Register the watcher before the mail lands, like a live TUI would.
    let waiter = {
        let ctx = ctx.clone();
        let account_id = account.id;
        tokio::spawn(async move { ctx.mail_signal.wait(account_id).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut client = connect(ctx.clone()).await;
    assert!(client.send("EHLO relay.example").await.starts_with("250"));
    assert!(client
        .send("MAIL FROM:<x@other.example>")
        .await
        .starts_with("250"));
    assert!(client
        .send(&format!("RCPT TO:<randomwordsmailbox@{MX}>"))
        .await
        .starts_with("250"));
    assert!(client.send("DATA").await.starts_with("354"));
    let reply = client
        .send_data("Subject: Hello\r\nFrom: Jane Doe <x@other.example>\r\n\r\nBody")
        .await;
    assert!(reply.starts_with("250"), "delivery failed: {reply}");

    let mails = ctx.storage.list_mails(mailbox.id).await.unwrap();
    assert_eq!(mails.len(), 1);
    assert_eq!(mails[0].subject, "Hello");
    assert_eq!(mails[0].from_address, "x@other.example");
    assert_eq!(mails[0].from_name, "Jane Doe");
    assert_eq!(mails[0].text.trim_end(), "Body");
    assert!(!mails[0].seen);

    // The pre-registered waiter observed the insert.
    let (woken_mailbox, aborted) =
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter timeout")
            .expect("waiter join");
    assert!(!aborted);
    assert_eq!(woken_mailbox, mailbox.id);

    assert!(client.send("QUIT").await.starts_with("221"));
}

#[tokio::test]
async fn outgoing_mail_is_refused() {
    let (_dir, ctx) = context().await;
    let mut client = connect(ctx).await;

    client.send("HELO relay.example").await;
    let reply = client.send(&format!("MAIL FROM:<someone@{MX}>")).await;
    assert!(reply.starts_with("550"), "expected rejection: {reply}");
    assert!(reply.contains("outgoing email not supported"));
}

#[tokio::test]
async fn unknown_recipients_are_rejected() {
    let (_dir, ctx) = context().await;
    let mut client = connect(ctx).await;

    client.send("HELO relay.example").await;
    client.send("MAIL FROM:<x@other.example>").await;

    let reply = client.send(&format!("RCPT TO:<nobodyhere@{MX}>")).await;
    assert!(reply.starts_with("550"), "expected rejection: {reply}");

    let reply = client.send("RCPT TO:<someone@elsewhere.example>").await;
    assert!(reply.starts_with("550"), "expected rejection: {reply}");
}

#[tokio::test]
async fn wildcard_recipients_provision_a_mailbox() {
    let (_dir, ctx) = context().await;
    let account = ctx
        .storage
        .create_account("SHA256:wildcardtestkeyfingerprint")
        .await
        .unwrap();
    ctx.storage.reserve_prefix(account.id, "alice").await.unwrap();

    let mut client = connect(ctx.clone()).await;
    client.send("HELO relay.example").await;
    client.send("MAIL FROM:<x@other.example>").await;
    assert!(client
        .send(&format!("RCPT TO:<alice.signup@{MX}>"))
        .await
        .starts_with("250"));
    client.send("DATA").await;
    client.send_data("Subject: Welcome\r\n\r\nFirst").await;

    let mailbox = ctx
        .storage
        .mailbox_by_name("alice.signup")
        .await
        .unwrap()
        .expect("provisioned mailbox");
    assert_eq!(mailbox.account_id, account.id);

    // A second mail to the same address reuses the mailbox.
    client.send("MAIL FROM:<x@other.example>").await;
    client.send(&format!("RCPT TO:<alice.signup@{MX}>")).await;
    client.send("DATA").await;
    client.send_data("Subject: Again\r\n\r\nSecond").await;

    let mails = ctx.storage.list_mails(mailbox.id).await.unwrap();
    assert_eq!(mails.len(), 2);
}

#[tokio::test]
async fn rset_clears_the_transaction() {
    let (_dir, ctx) = context().await;
    let account = ctx
        .storage
        .create_account("SHA256:rsettestkeyfingerprintvalue")
        .await
        .unwrap();
    ctx.storage
        .create_mailbox(account.id, "rsettargetmailbox")
        .await
        .unwrap();

    let mut client = connect(ctx).await;
    client.send("HELO relay.example").await;
    client.send("MAIL FROM:<x@other.example>").await;
    client.send(&format!("RCPT TO:<rsettargetmailbox@{MX}>")).await;
    assert!(client.send("RSET").await.starts_with("250"));

    // The accumulated state is gone on both ends.
    assert!(client.send("DATA").await.starts_with("503"));
    assert!(client
        .send(&format!("RCPT TO:<rsettargetmailbox@{MX}>"))
        .await
        .starts_with("503"));
}

#[tokio::test]
async fn commands_out_of_order_are_rejected() {
    let (_dir, ctx) = context().await;
    let mut client = connect(ctx).await;

    client.send("HELO relay.example").await;
    assert!(client
        .send(&format!("RCPT TO:<whatever@{MX}>"))
        .await
        .starts_with("503"));
    assert!(client.send("DATA").await.starts_with("503"));
    assert!(client.send("BDAT 100").await.starts_with("502"));
}
