//! The command line users pass after `ssh <host>`.
//!
//! All subcommands of every app are aggregated here so a single `--help`
//! can describe the whole surface.

use std::time::Duration;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "campd", about = "disposable mailboxes and a shared clipboard over ssh")]
pub struct AppArgs {
    #[command(subcommand)]
    pub command: AppCommand,
}

#[derive(Debug, Subcommand)]
pub enum AppCommand {
    /// A disposable email app
    Mail,

    /// A clipboard app
    Clipboard {
        #[command(subcommand)]
        command: Option<ClipboardCommand>,
    },

    /// Manage your account
    Accounts {
        #[command(subcommand)]
        command: AccountsCommand,
    },
}

impl AppCommand {
    /// The name of the app that owns this subcommand.
    pub fn app_name(&self) -> &'static str {
        match self {
            AppCommand::Mail => "mail",
            AppCommand::Clipboard { .. } => "clipboard",
            AppCommand::Accounts { .. } => "accounts",
        }
    }
}

#[derive(Debug, Clone, Copy, Subcommand)]
pub enum ClipboardCommand {
    /// Retrieve contents currently on the clipboard
    Get,
    /// Put text from stdin on the clipboard
    Put,
    /// Clear the contents on the clipboard
    Clear,
}

#[derive(Debug, Clone, Subcommand)]
pub enum AccountsCommand {
    /// List all keys attached to the account
    ListKeys,
    /// Add a key to your account
    AddKey {
        /// SHA256 fingerprint of the key to add
        key: String,
    },
    /// Remove a key from your account
    RemoveKey {
        /// SHA256 fingerprint of the key to remove
        key: String,
    },
    /// List the login tokens on the account
    ListTokens,
    /// Issue a keyless login token
    IssueToken {
        /// How long the token stays valid, e.g. 1h or 3d
        #[arg(long, value_parser = humantime::parse_duration)]
        validity: Option<Duration>,
    },
    /// Remove login tokens by name or value prefix
    RemoveToken { name: String },
    /// Delete the current account
    DeleteAccount,
}

/// How an argument parse concluded when it did not yield a command.
pub enum ParseOutcome {
    Command(AppCommand),
    /// The parser consumed the session (help output or a usage error);
    /// dispatch short-circuits with this retcode and output.
    Consumed { retcode: i32, output: String },
}

/// Parses a client command line the way a shell-side binary would, but
/// renders all output into a string for the session stream.
pub fn parse(command: &[String]) -> ParseOutcome {
    let argv = std::iter::once("campd".to_string()).chain(command.iter().cloned());

    match AppArgs::try_parse_from(argv) {
        Ok(args) => ParseOutcome::Command(args.command),
        Err(err) => {
            let retcode = match err.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
                _ => 255,
            };
            ParseOutcome::Consumed {
                retcode,
                output: err.render().to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn known_subcommands_parse() {
        assert!(matches!(
            parse(&argv(&["mail"])),
            ParseOutcome::Command(AppCommand::Mail)
        ));
        assert!(matches!(
            parse(&argv(&["clipboard", "put"])),
            ParseOutcome::Command(AppCommand::Clipboard {
                command: Some(ClipboardCommand::Put)
            })
        ));
        assert!(matches!(
            parse(&argv(&["clipboard"])),
            ParseOutcome::Command(AppCommand::Clipboard { command: None })
        ));
        assert!(matches!(
            parse(&argv(&["accounts", "list-keys"])),
            ParseOutcome::Command(AppCommand::Accounts {
                command: AccountsCommand::ListKeys
            })
        ));
    }

    #[test]
    fn positional_arguments_are_captured() {
        match parse(&argv(&["accounts", "add-key", "SHA256:abcd"])) {
            ParseOutcome::Command(AppCommand::Accounts {
                command: AccountsCommand::AddKey { key },
            }) => assert_eq!(key, "SHA256:abcd"),
            _ => panic!("expected add-key"),
        }
    }

    #[test]
    fn validity_accepts_human_durations() {
        match parse(&argv(&["accounts", "issue-token", "--validity", "1h"])) {
            ParseOutcome::Command(AppCommand::Accounts {
                command: AccountsCommand::IssueToken { validity },
            }) => assert_eq!(validity, Some(Duration::from_secs(3600))),
            _ => panic!("expected issue-token"),
        }
    }

    #[test]
    fn help_consumes_with_retcode_zero() {
        match parse(&argv(&["--help"])) {
            ParseOutcome::Consumed { retcode, output } => {
                assert_eq!(retcode, 0);
                assert!(output.contains("clipboard"));
            }
            _ => panic!("expected consumed parse"),
        }
    }

    #[test]
    fn bad_arguments_consume_with_retcode_255() {
        match parse(&argv(&["frobnicate"])) {
            ParseOutcome::Consumed { retcode, .. } => assert_eq!(retcode, 255),
            _ => panic!("expected consumed parse"),
        }
        match parse(&argv(&["accounts", "add-key"])) {
            ParseOutcome::Consumed { retcode, .. } => assert_eq!(retcode, 255),
            _ => panic!("expected consumed parse"),
        }
    }
}
