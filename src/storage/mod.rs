//! Transactional record keeper for accounts, login keys, bearer tokens,
//! mailboxes, mails and clipboard items.
//!
//! Uniqueness races are resolved by the database: every check-then-insert
//! path either runs inside a transaction or maps a unique-constraint
//! violation to a domain error kind.

use std::str::FromStr;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::RngCore;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use tracing::info;

/// Default validity of an issued login token.
pub const DEFAULT_TOKEN_TTL: chrono::Duration = chrono::Duration::hours(72);

/// Errors a caller is expected to tell apart. Anything else surfaces as
/// `StoreError::Db` and is reported as a wrapped message.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("an account with this key already exists")]
    DuplicateKey,
    #[error("this key was already added to your account")]
    KeyAlreadyYours,
    #[error("this key is already attached to another account")]
    KeyTakenElsewhere,
    #[error("key not found")]
    KeyNotFound,
    #[error("this will leave your account without any keys")]
    LastKey,
    #[error("bad fingerprint: {0}")]
    BadFingerprint(&'static str),
    #[error("this prefix is already reserved")]
    PrefixTaken,
    #[error("invalid mailbox: {0}")]
    InvalidMailbox(String),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AccountRow {
    pub id: i64,
    pub reserved_prefix: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct KeyRow {
    pub id: i64,
    pub fingerprint: String,
    pub account_id: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TokenRow {
    pub id: i64,
    pub name: String,
    pub token: String,
    pub expires_at: String,
    pub account_id: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MailboxRow {
    pub id: i64,
    pub name: String,
    pub account_id: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MailboxWithUnread {
    pub id: i64,
    pub name: String,
    pub account_id: i64,
    pub created_at: String,
    pub unread: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MailRow {
    pub id: i64,
    pub from_address: String,
    pub from_name: String,
    pub subject: String,
    pub text: String,
    pub seen: bool,
    pub important: bool,
    pub mailbox_id: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClipboardRow {
    pub id: i64,
    pub iv: Vec<u8>,
    pub value: Vec<u8>,
    pub account_id: i64,
    pub created_at: String,
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn connect(db_uri: &str, migrate: bool) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(db_uri)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        if migrate {
            info!("creating tables");
            Self::migrate(&pool).await?;
        }
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for stmt in include_str!("migrations/001_init.sql").split(';') {
            let stmt = stmt.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt).execute(pool).await?;
            }
        }
        Ok(())
    }

    // ─── Accounts ────────────────────────────────────────────────────────────

    pub async fn account_by_id(&self, id: i64) -> Result<Option<AccountRow>, StoreError> {
        Ok(sqlx::query_as("SELECT * FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Looks up the account that owns a login token. Expired tokens do not
    /// resolve.
    pub async fn account_by_token(&self, token: &str) -> Result<Option<AccountRow>, StoreError> {
        Ok(sqlx::query_as(
            "SELECT account.* FROM accounts AS account
             JOIN tokens AS token ON token.account_id = account.id
             WHERE token.token = ? AND token.expires_at > ?",
        )
        .bind(token)
        .bind(now())
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn account_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<AccountRow>, StoreError> {
        Ok(sqlx::query_as(
            "SELECT account.* FROM accounts AS account
             JOIN keys AS key ON key.account_id = account.id
             WHERE key.fingerprint = ?",
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn account_by_reserved_prefix(
        &self,
        prefix: &str,
    ) -> Result<Option<AccountRow>, StoreError> {
        Ok(
            sqlx::query_as("SELECT * FROM accounts WHERE reserved_prefix = ?")
                .bind(prefix)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// Creates an account along with its first login key in one transaction.
    pub async fn create_account(&self, fingerprint: &str) -> Result<AccountRow, StoreError> {
        let at = now();
        let mut tx = self.pool.begin().await?;

        let account_id = sqlx::query("INSERT INTO accounts (created_at) VALUES (?)")
            .bind(&at)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

        let result = sqlx::query(
            "INSERT INTO keys (fingerprint, account_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(fingerprint)
        .bind(account_id)
        .bind(&at)
        .execute(&mut *tx)
        .await;
        if let Err(err) = result {
            return Err(if is_unique_violation(&err) {
                StoreError::DuplicateKey
            } else {
                err.into()
            });
        }

        tx.commit().await?;
        info!(account = account_id, "created account");

        Ok(AccountRow {
            id: account_id,
            reserved_prefix: None,
            created_at: at,
        })
    }

    /// Reserves a wildcard prefix for an account. Prefixes are seeded by an
    /// operator; there is no self-service surface for them.
    pub async fn reserve_prefix(&self, account_id: i64, prefix: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE accounts SET reserved_prefix = ? WHERE id = ?")
            .bind(prefix)
            .bind(account_id)
            .execute(&self.pool)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(StoreError::PrefixTaken),
            Err(err) => Err(err.into()),
        }
    }

    /// Deletes the account. Keys, tokens, mailboxes, mails and the clipboard
    /// share a cascading relationship with it and are removed by the engine.
    pub async fn delete_account(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM accounts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ─── Keys ────────────────────────────────────────────────────────────────

    pub async fn add_key(&self, account_id: i64, fingerprint: &str) -> Result<(), StoreError> {
        let fingerprint = fingerprint.trim();
        validate_fingerprint(fingerprint)?;

        let mut tx = self.pool.begin().await?;

        let existing: Option<KeyRow> = sqlx::query_as("SELECT * FROM keys WHERE fingerprint = ?")
            .bind(fingerprint)
            .fetch_optional(&mut *tx)
            .await?;
        if let Some(key) = existing {
            return Err(if key.account_id == account_id {
                StoreError::KeyAlreadyYours
            } else {
                StoreError::KeyTakenElsewhere
            });
        }

        sqlx::query("INSERT INTO keys (fingerprint, account_id, created_at) VALUES (?, ?, ?)")
            .bind(fingerprint)
            .bind(account_id)
            .bind(now())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Removes a key, refusing to leave the account with none.
    pub async fn remove_key(&self, account_id: i64, fingerprint: &str) -> Result<(), StoreError> {
        let fingerprint = fingerprint.trim();
        info!(account = account_id, fingerprint, "deleting key");

        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM keys WHERE account_id = ? AND fingerprint = ?")
            .bind(account_id)
            .bind(fingerprint)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(StoreError::KeyNotFound);
        }

        let (remaining,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM keys WHERE account_id = ?")
                .bind(account_id)
                .fetch_one(&mut *tx)
                .await?;
        if remaining == 0 {
            // Dropping the transaction rolls the delete back.
            return Err(StoreError::LastKey);
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn list_keys(&self, account_id: i64) -> Result<Vec<KeyRow>, StoreError> {
        Ok(
            sqlx::query_as("SELECT * FROM keys WHERE account_id = ? ORDER BY created_at ASC")
                .bind(account_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    // ─── Tokens ──────────────────────────────────────────────────────────────

    /// Issues a keyless login token. The token value is returned exactly
    /// once; the name is a short stable prefix of it.
    pub async fn issue_token(
        &self,
        account_id: i64,
        ttl: chrono::Duration,
    ) -> Result<TokenRow, StoreError> {
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);

        let token = hex(&nonce);
        let name = hex(&nonce[..3]);
        let at = now();
        let expires_at = (Utc::now() + ttl).to_rfc3339();

        let id = sqlx::query(
            "INSERT INTO tokens (name, token, expires_at, account_id, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&name)
        .bind(&token)
        .bind(&expires_at)
        .bind(account_id)
        .bind(&at)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(TokenRow {
            id,
            name,
            token,
            expires_at,
            account_id,
            created_at: at,
        })
    }

    pub async fn list_tokens(&self, account_id: i64) -> Result<Vec<TokenRow>, StoreError> {
        Ok(
            sqlx::query_as("SELECT * FROM tokens WHERE account_id = ? ORDER BY created_at ASC")
                .bind(account_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Deletes tokens whose name equals the argument or whose value starts
    /// with it, scoped to the caller's account. Returns the affected count.
    pub async fn remove_token(
        &self,
        account_id: i64,
        name_or_prefix: &str,
    ) -> Result<u64, StoreError> {
        let affected = sqlx::query(
            "DELETE FROM tokens
             WHERE account_id = ? AND (name = ? OR token LIKE ? || '%')",
        )
        .bind(account_id)
        .bind(name_or_prefix)
        .bind(name_or_prefix)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected)
    }

    // ─── Mailboxes ───────────────────────────────────────────────────────────

    pub async fn mailbox_by_name(&self, name: &str) -> Result<Option<MailboxRow>, StoreError> {
        Ok(sqlx::query_as("SELECT * FROM mailboxes WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Inserts a mailbox with an already-validated name. A name collision
    /// maps to `InvalidMailbox`.
    pub async fn create_mailbox(
        &self,
        account_id: i64,
        name: &str,
    ) -> Result<MailboxRow, StoreError> {
        let at = now();
        let result = sqlx::query(
            "INSERT INTO mailboxes (name, account_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(name)
        .bind(account_id)
        .bind(&at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(MailboxRow {
                id: done.last_insert_rowid(),
                name: name.to_string(),
                account_id,
                created_at: at,
            }),
            Err(err) if is_unique_violation(&err) => Err(StoreError::InvalidMailbox(
                "a mailbox with this name already exists".into(),
            )),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn list_mailboxes_with_unread(
        &self,
        account_id: i64,
    ) -> Result<Vec<MailboxWithUnread>, StoreError> {
        Ok(sqlx::query_as(
            "SELECT mailbox.*, COUNT(mail.id) AS unread
             FROM mailboxes AS mailbox
             LEFT JOIN mails AS mail
               ON mail.mailbox_id = mailbox.id AND mail.seen = 0
             WHERE mailbox.account_id = ?
             GROUP BY mailbox.id
             ORDER BY mailbox.id DESC",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn delete_mailbox(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM mailboxes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ─── Mails ───────────────────────────────────────────────────────────────

    pub async fn insert_mail(
        &self,
        mailbox_id: i64,
        from_address: &str,
        from_name: &str,
        subject: &str,
        text: &str,
    ) -> Result<i64, StoreError> {
        let id = sqlx::query(
            "INSERT INTO mails (from_address, from_name, subject, text, mailbox_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(from_address)
        .bind(from_name)
        .bind(subject)
        .bind(text)
        .bind(mailbox_id)
        .bind(now())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    pub async fn list_mails(&self, mailbox_id: i64) -> Result<Vec<MailRow>, StoreError> {
        Ok(
            sqlx::query_as("SELECT * FROM mails WHERE mailbox_id = ? ORDER BY id DESC")
                .bind(mailbox_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn mark_mail_seen(&self, mail_id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE mails SET seen = 1 WHERE id = ?")
            .bind(mail_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_mails_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        Ok(sqlx::query("DELETE FROM mails WHERE created_at <= ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?
            .rows_affected())
    }

    // ─── Clipboard ───────────────────────────────────────────────────────────

    /// Replaces the account's clipboard slot. Readers never observe a state
    /// with both the old and the new row.
    pub async fn put_clipboard(
        &self,
        account_id: i64,
        iv: &[u8],
        value: &[u8],
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM clipboard_items WHERE account_id = ?")
            .bind(account_id)
            .execute(&mut *tx)
            .await?;

        let id = sqlx::query(
            "INSERT INTO clipboard_items (iv, value, account_id, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(iv)
        .bind(value)
        .bind(account_id)
        .bind(now())
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        tx.commit().await?;
        Ok(id)
    }

    pub async fn get_clipboard(&self, account_id: i64) -> Result<Option<ClipboardRow>, StoreError> {
        Ok(
            sqlx::query_as("SELECT * FROM clipboard_items WHERE account_id = ?")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn delete_clipboard(&self, account_id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM clipboard_items WHERE account_id = ?")
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_all_clipboards(&self) -> Result<u64, StoreError> {
        Ok(sqlx::query("DELETE FROM clipboard_items")
            .execute(&self.pool)
            .await?
            .rows_affected())
    }

    pub async fn delete_clipboards_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        Ok(
            sqlx::query("DELETE FROM clipboard_items WHERE created_at <= ?")
                .bind(cutoff.to_rfc3339())
                .execute(&self.pool)
                .await?
                .rows_affected(),
        )
    }
}

/// Accepts only the canonical `SHA256:<base64>` fingerprint shape.
fn validate_fingerprint(fingerprint: &str) -> Result<(), StoreError> {
    let Some((algo, value)) = fingerprint.split_once(':') else {
        return Err(StoreError::BadFingerprint(
            "use a Base64 encoded SHA256 fingerprint",
        ));
    };
    if algo != "SHA256" {
        return Err(StoreError::BadFingerprint(
            "unsupported hash algorithm, use SHA256",
        ));
    }
    if value.is_empty()
        || !value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=')
    {
        return Err(StoreError::BadFingerprint(
            "unknown encoding, use Base64 encoded SHA256",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_shape() {
        assert!(validate_fingerprint("SHA256:AAAA+/=abc123").is_ok());
        assert!(validate_fingerprint("MD5:AAAA").is_err());
        assert!(validate_fingerprint("SHA256:").is_err());
        assert!(validate_fingerprint("SHA256:white space").is_err());
        assert!(validate_fingerprint("no-colon").is_err());
    }

    #[test]
    fn hex_encodes_lower_case() {
        assert_eq!(hex(&[0x00, 0xff, 0x1a]), "00ff1a");
    }
}
