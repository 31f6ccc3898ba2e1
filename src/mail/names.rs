//! Mailbox naming policy and delivery-time provisioning.
//!
//! Two kinds of mailbox names exist and must never collide:
//!
//! - wildcard mailboxes are `<prefix>.<suffix>` where the prefix is an
//!   account's reserved, purely alphanumeric prefix of at most 16
//!   characters;
//! - random mailboxes are built from dictionary words, contain no period
//!   and are at least 18 characters long.
//!
//! Since every wildcard name contains a period right after a short prefix
//! and random names contain none, the two sets are disjoint.

use std::sync::OnceLock;

use rand::Rng;
use regex::Regex;
use thiserror::Error;
use tracing::warn;

use crate::storage::{MailboxRow, Storage, StoreError};

const WILDCARD_PREFIX_MAX_LEN: usize = 16;
const RANDOM_NAME_MIN_LEN: usize = 18;
const NAME_MAX_LEN: usize = 128;

/// Attempts at finding an unused random name before giving up.
const RANDOM_NAME_ATTEMPTS: usize = 32;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("unknown recipient")]
    UnknownRecipient,
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z0-9][a-z0-9._\-+]+[a-z0-9]$").expect("static mailbox name pattern")
    })
}

/// Normalizes and validates a mailbox name against the naming policy.
pub fn validate(name: &str) -> Result<String, StoreError> {
    let name = name.trim().to_lowercase();

    if name.len() <= 2 {
        return Err(StoreError::InvalidMailbox(
            "name is too short, it needs to be longer than 2 characters".into(),
        ));
    }
    if name.len() > NAME_MAX_LEN {
        return Err(StoreError::InvalidMailbox(format!(
            "a name cannot be longer than {NAME_MAX_LEN} characters"
        )));
    }
    if !name_pattern().is_match(&name) {
        return Err(StoreError::InvalidMailbox(
            "invalid name, a name can only contain lower case letters, numbers, periods, \
             underscores, hyphens or pluses, and it needs to begin and end with an \
             alphanumeric character"
                .into(),
        ));
    }
    for symbol in ["..", "--", "__"] {
        if name.contains(symbol) {
            return Err(StoreError::InvalidMailbox(
                "invalid name, a name cannot contain consecutive special symbols \
                 (periods, underscores or hyphens)"
                    .into(),
            ));
        }
    }

    Ok(name)
}

/// Creates a mailbox with a free dictionary-word name for the account.
pub async fn create_random_mailbox(
    storage: &Storage,
    account_id: i64,
) -> Result<MailboxRow, StoreError> {
    for _ in 0..RANDOM_NAME_ATTEMPTS {
        let name = random_name();
        if storage.mailbox_by_name(&name).await?.is_some() {
            continue;
        }

        let name = validate(&name)?;
        match storage.create_mailbox(account_id, &name).await {
            // Lost the race for the name; try another one.
            Err(StoreError::InvalidMailbox(_)) => continue,
            other => return other,
        }
    }

    warn!(account = account_id, "exhausted random mailbox name attempts");
    Err(StoreError::InvalidMailbox(
        "could not find a free mailbox name, try again".into(),
    ))
}

/// Creates `<reserved_prefix>.<suffix>` for an account that reserved a
/// wildcard prefix.
pub async fn create_wildcard_mailbox(
    storage: &Storage,
    account_id: i64,
    prefix: &str,
    suffix: &str,
) -> Result<MailboxRow, StoreError> {
    if prefix.is_empty()
        || prefix.len() > WILDCARD_PREFIX_MAX_LEN
        || !prefix.bytes().all(|b| b.is_ascii_alphanumeric())
    {
        return Err(StoreError::InvalidMailbox(
            "reserved prefix must be alphanumeric and at most 16 characters".into(),
        ));
    }
    if suffix.is_empty() {
        return Err(StoreError::InvalidMailbox("cannot have an empty suffix".into()));
    }

    let name = validate(&format!("{prefix}.{suffix}"))?;
    storage.create_mailbox(account_id, &name).await
}

/// Resolves the mailbox a message addressed to `local` should land in,
/// provisioning a wildcard mailbox when the local part names a reserved
/// prefix.
pub async fn resolve_delivery(
    storage: &Storage,
    local: &str,
) -> Result<MailboxRow, DeliveryError> {
    let name = local.trim().to_lowercase();

    if let Some(mailbox) = storage.mailbox_by_name(&name).await? {
        return Ok(mailbox);
    }

    if let Some((head, tail)) = name.split_once('.') {
        if let Some(account) = storage.account_by_reserved_prefix(head).await? {
            let prefix = account
                .reserved_prefix
                .as_deref()
                .unwrap_or(head)
                .to_string();
            return match create_wildcard_mailbox(storage, account.id, &prefix, tail).await {
                Ok(mailbox) => Ok(mailbox),
                // Provisioned concurrently by another delivery.
                Err(StoreError::InvalidMailbox(_)) => storage
                    .mailbox_by_name(&name)
                    .await?
                    .ok_or(DeliveryError::UnknownRecipient),
                Err(err) => Err(err.into()),
            };
        }
    }

    Err(DeliveryError::UnknownRecipient)
}

fn random_name() -> String {
    let mut rng = rand::thread_rng();
    let mut name = String::new();
    while name.len() < RANDOM_NAME_MIN_LEN {
        name.push_str(WORDS[rng.gen_range(0..WORDS.len())]);
    }
    name
}

/// Whether a name has the random-mailbox shape.
pub fn is_random(name: &str) -> bool {
    name.len() >= RANDOM_NAME_MIN_LEN && !name.contains('.')
}

/// Whether a name has the wildcard-mailbox shape.
pub fn is_wildcard(name: &str) -> bool {
    name.contains('.')
}

const WORDS: &[&str] = &[
    "acorn", "amber", "anchor", "apple", "arrow", "aspen", "atlas", "autumn", "badger", "bamboo",
    "basil", "beacon", "birch", "bison", "blossom", "breeze", "brook", "butter", "canyon", "cedar",
    "cherry", "cinder", "clover", "cobalt", "comet", "copper", "coral", "cotton", "cricket",
    "crystal", "dahlia", "dawn", "delta", "drift", "ember", "falcon", "fern", "flint", "forest",
    "fox", "garnet", "ginger", "glacier", "grove", "harbor", "hazel", "heron", "hollow", "indigo",
    "iris", "ivory", "jade", "jasper", "juniper", "kestrel", "lagoon", "lantern", "larch", "lark",
    "lemon", "lilac", "linen", "lotus", "lunar", "maple", "marble", "meadow", "mint", "mist",
    "moss", "nectar", "nimbus", "north", "oak", "ocean", "olive", "onyx", "opal", "orchid",
    "otter", "pebble", "pine", "plum", "pond", "poppy", "prairie", "quartz", "quill", "raven",
    "reed", "ridge", "river", "robin", "rose", "rowan", "saffron", "sage", "sandal", "sierra",
    "silver", "sorrel", "sparrow", "spruce", "stone", "storm", "summit", "sunny", "swan",
    "tansy", "thistle", "thorn", "tidal", "timber", "topaz", "trout", "tulip", "tundra",
    "umber", "vale", "velvet", "violet", "walnut", "willow", "winter", "wren", "zephyr",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names_are_normalized() {
        assert_eq!(validate("  Hello.World  ").unwrap(), "hello.world");
        assert_eq!(validate("a1b2c3").unwrap(), "a1b2c3");
        assert_eq!(validate("with-dash_and+plus").unwrap(), "with-dash_and+plus");
    }

    #[test]
    fn short_and_long_names_are_rejected() {
        assert!(validate("ab").is_err());
        assert!(validate(&"a".repeat(200)).is_err());
    }

    #[test]
    fn symbol_placement_is_enforced() {
        assert!(validate(".leading").is_err());
        assert!(validate("trailing.").is_err());
        assert!(validate("spa ce").is_err());
        assert!(validate("Ümlaut").is_err());
    }

    #[test]
    fn consecutive_symbols_are_rejected() {
        assert!(validate("a..b").is_err());
        assert!(validate("a--b").is_err());
        assert!(validate("a__b").is_err());
        assert!(validate("a.-b").is_ok());
    }

    #[test]
    fn random_names_are_long_and_dot_free() {
        for _ in 0..64 {
            let name = random_name();
            assert!(name.len() >= RANDOM_NAME_MIN_LEN);
            assert!(!name.contains('.'));
            assert!(validate(&name).is_ok());
        }
    }

    #[test]
    fn random_and_wildcard_shapes_are_disjoint() {
        let random = random_name();
        assert!(is_random(&random));
        assert!(!is_wildcard(&random));

        let wildcard = "alice.signup";
        assert!(is_wildcard(wildcard));
        assert!(!is_random(wildcard));
    }
}
