//! Store invariants against a throwaway SQLite database.

use campd::storage::{Storage, StoreError};
use chrono::Utc;
use tempfile::TempDir;

async fn store() -> (TempDir, Storage) {
    let dir = TempDir::new().expect("tempdir");
    let uri = format!("sqlite:{}/test.db", dir.path().display());
    let storage = Storage::connect(&uri, true).await.expect("storage");
    (dir, storage)
}

const FP_A: &str = "SHA256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
const FP_B: &str = "SHA256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
const FP_C: &str = "SHA256:ccccccccccccccccccccccccccccccccccccccccccc";

#[tokio::test]
async fn account_creation_binds_the_first_key() {
    let (_dir, storage) = store().await;

    let account = storage.create_account(FP_A).await.unwrap();
    let resolved = storage.account_by_fingerprint(FP_A).await.unwrap();
    assert_eq!(resolved.unwrap().id, account.id);

    let keys = storage.list_keys(account.id).await.unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].fingerprint, FP_A);
}

#[tokio::test]
async fn duplicate_first_key_is_rejected() {
    let (_dir, storage) = store().await;

    storage.create_account(FP_A).await.unwrap();
    assert!(matches!(
        storage.create_account(FP_A).await,
        Err(StoreError::DuplicateKey)
    ));
}

#[tokio::test]
async fn key_ownership_conflicts_are_distinguished() {
    let (_dir, storage) = store().await;

    let mine = storage.create_account(FP_A).await.unwrap();
    let theirs = storage.create_account(FP_B).await.unwrap();

    assert!(matches!(
        storage.add_key(mine.id, FP_A).await,
        Err(StoreError::KeyAlreadyYours)
    ));
    assert!(matches!(
        storage.add_key(theirs.id, FP_A).await,
        Err(StoreError::KeyTakenElsewhere)
    ));
    assert!(matches!(
        storage.add_key(mine.id, "not-a-fingerprint").await,
        Err(StoreError::BadFingerprint(_))
    ));
}

#[tokio::test]
async fn removing_the_last_key_fails_and_rolls_back() {
    let (_dir, storage) = store().await;
    let account = storage.create_account(FP_A).await.unwrap();

    assert!(matches!(
        storage.remove_key(account.id, FP_A).await,
        Err(StoreError::LastKey)
    ));
    // The delete must have been rolled back.
    assert_eq!(storage.list_keys(account.id).await.unwrap().len(), 1);

    assert!(matches!(
        storage.remove_key(account.id, FP_C).await,
        Err(StoreError::KeyNotFound)
    ));

    storage.add_key(account.id, FP_B).await.unwrap();
    storage.remove_key(account.id, FP_A).await.unwrap();
    let keys = storage.list_keys(account.id).await.unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].fingerprint, FP_B);
}

#[tokio::test]
async fn tokens_authenticate_until_they_expire() {
    let (_dir, storage) = store().await;
    let account = storage.create_account(FP_A).await.unwrap();

    let token = storage
        .issue_token(account.id, chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(token.token.len(), 32);
    assert_eq!(token.name, token.token[..6]);

    let resolved = storage.account_by_token(&token.token).await.unwrap();
    assert_eq!(resolved.unwrap().id, account.id);

    let expired = storage
        .issue_token(account.id, chrono::Duration::hours(-1))
        .await
        .unwrap();
    assert!(storage
        .account_by_token(&expired.token)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn tokens_are_removed_by_name_or_value_prefix() {
    let (_dir, storage) = store().await;
    let account = storage.create_account(FP_A).await.unwrap();
    let other = storage.create_account(FP_B).await.unwrap();

    let token = storage
        .issue_token(account.id, chrono::Duration::hours(1))
        .await
        .unwrap();
    let foreign = storage
        .issue_token(other.id, chrono::Duration::hours(1))
        .await
        .unwrap();

    // Another account cannot remove it, by name or prefix.
    assert_eq!(
        storage.remove_token(other.id, &token.name).await.unwrap(),
        0
    );

    assert_eq!(
        storage.remove_token(account.id, &token.name).await.unwrap(),
        1
    );
    assert!(storage
        .account_by_token(&token.token)
        .await
        .unwrap()
        .is_none());

    // Value prefix works too.
    assert_eq!(
        storage
            .remove_token(other.id, &foreign.token[..10])
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn mailbox_names_are_globally_unique() {
    let (_dir, storage) = store().await;
    let a = storage.create_account(FP_A).await.unwrap();
    let b = storage.create_account(FP_B).await.unwrap();

    storage.create_mailbox(a.id, "sharedname").await.unwrap();
    assert!(matches!(
        storage.create_mailbox(b.id, "sharedname").await,
        Err(StoreError::InvalidMailbox(_))
    ));
}

#[tokio::test]
async fn unread_counts_follow_seen_state() {
    let (_dir, storage) = store().await;
    let account = storage.create_account(FP_A).await.unwrap();
    let mailbox = storage.create_mailbox(account.id, "inboxnumberone").await.unwrap();

    let first = storage
        .insert_mail(mailbox.id, "x@other", "", "One", "body")
        .await
        .unwrap();
    storage
        .insert_mail(mailbox.id, "x@other", "", "Two", "body")
        .await
        .unwrap();

    let listed = storage.list_mailboxes_with_unread(account.id).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].unread, 2);

    storage.mark_mail_seen(first).await.unwrap();
    let listed = storage.list_mailboxes_with_unread(account.id).await.unwrap();
    assert_eq!(listed[0].unread, 1);

    // Newest first.
    let mails = storage.list_mails(mailbox.id).await.unwrap();
    assert_eq!(mails[0].subject, "Two");
    assert_eq!(mails[1].subject, "One");
}

#[tokio::test]
async fn stale_mails_are_swept_by_cutoff() {
    let (_dir, storage) = store().await;
    let account = storage.create_account(FP_A).await.unwrap();
    let mailbox = storage.create_mailbox(account.id, "sweepermailbox").await.unwrap();

    storage
        .insert_mail(mailbox.id, "x@other", "", "Fresh", "body")
        .await
        .unwrap();

    // A cutoff in the past deletes nothing.
    let removed = storage
        .delete_mails_older_than(Utc::now() - chrono::Duration::hours(48))
        .await
        .unwrap();
    assert_eq!(removed, 0);

    // A cutoff in the future catches the fresh mail.
    let removed = storage
        .delete_mails_older_than(Utc::now() + chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(storage.list_mails(mailbox.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn clipboard_keeps_a_single_slot_per_account() {
    let (_dir, storage) = store().await;
    let account = storage.create_account(FP_A).await.unwrap();

    storage
        .put_clipboard(account.id, b"iv-one", b"cipher-one")
        .await
        .unwrap();
    storage
        .put_clipboard(account.id, b"iv-two", b"cipher-two")
        .await
        .unwrap();

    let item = storage.get_clipboard(account.id).await.unwrap().unwrap();
    assert_eq!(item.iv, b"iv-two");
    assert_eq!(item.value, b"cipher-two");

    storage.delete_clipboard(account.id).await.unwrap();
    assert!(storage.get_clipboard(account.id).await.unwrap().is_none());
}

#[tokio::test]
async fn clipboard_sweepers_cover_startup_and_retention() {
    let (_dir, storage) = store().await;
    let a = storage.create_account(FP_A).await.unwrap();
    let b = storage.create_account(FP_B).await.unwrap();

    storage.put_clipboard(a.id, b"iv", b"one").await.unwrap();
    storage.put_clipboard(b.id, b"iv", b"two").await.unwrap();

    let removed = storage
        .delete_clipboards_older_than(Utc::now() + chrono::Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(removed, 2);

    storage.put_clipboard(a.id, b"iv", b"three").await.unwrap();
    assert_eq!(storage.delete_all_clipboards().await.unwrap(), 1);
}

#[tokio::test]
async fn deleting_an_account_cascades() {
    let (_dir, storage) = store().await;
    let account = storage.create_account(FP_A).await.unwrap();
    let token = storage
        .issue_token(account.id, chrono::Duration::hours(1))
        .await
        .unwrap();
    let mailbox = storage
        .create_mailbox(account.id, "cascadingmailbox")
        .await
        .unwrap();
    storage
        .insert_mail(mailbox.id, "x@other", "", "Hello", "body")
        .await
        .unwrap();
    storage.put_clipboard(account.id, b"iv", b"value").await.unwrap();

    storage.delete_account(account.id).await.unwrap();

    assert!(storage.account_by_fingerprint(FP_A).await.unwrap().is_none());
    assert!(storage.account_by_token(&token.token).await.unwrap().is_none());
    assert!(storage
        .mailbox_by_name("cascadingmailbox")
        .await
        .unwrap()
        .is_none());
    assert!(storage.get_clipboard(account.id).await.unwrap().is_none());
}

#[tokio::test]
async fn reserved_prefixes_are_unique() {
    let (_dir, storage) = store().await;
    let a = storage.create_account(FP_A).await.unwrap();
    let b = storage.create_account(FP_B).await.unwrap();

    storage.reserve_prefix(a.id, "alice").await.unwrap();
    let found = storage.account_by_reserved_prefix("alice").await.unwrap();
    assert_eq!(found.unwrap().id, a.id);

    assert!(matches!(
        storage.reserve_prefix(b.id, "alice").await,
        Err(StoreError::PrefixTaken)
    ));
}
