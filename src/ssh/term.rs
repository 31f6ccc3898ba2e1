//! Terminal plumbing between an SSH channel and the TUI layer.
//!
//! Output: a `std::io::Write` implementation that batches bytes and ships
//! them to the channel through a forwarder task, so a ratatui backend can
//! draw over SSH. Input: a small parser turning raw channel bytes into key
//! events (the channel delivers keystrokes, not terminal events).

use std::io;

use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use tokio::sync::mpsc;

pub use crossterm::event::{KeyCode, KeyModifiers};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub code: KeyCode,
    pub modifiers: KeyModifiers,
}

impl KeyEvent {
    fn plain(code: KeyCode) -> Self {
        Self {
            code,
            modifiers: KeyModifiers::NONE,
        }
    }

    fn ctrl(c: char) -> Self {
        Self {
            code: KeyCode::Char(c),
            modifiers: KeyModifiers::CONTROL,
        }
    }

    pub fn is_ctrl(&self, c: char) -> bool {
        self.code == KeyCode::Char(c) && self.modifiers.contains(KeyModifiers::CONTROL)
    }

    pub fn is_char(&self, c: char) -> bool {
        self.code == KeyCode::Char(c) && !self.modifiers.contains(KeyModifiers::CONTROL)
    }
}

/// Writer half of the SSH terminal. Bytes accumulate until `flush`, which
/// hands the batch to the forwarder task. Dropping the writer stops the
/// forwarder.
pub struct TermWriter {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    buf: Vec<u8>,
}

impl TermWriter {
    /// Spawns the forwarder task that pushes flushed batches down the
    /// channel. Send failures mean the session is gone and are dropped.
    pub fn start(handle: Handle, channel: ChannelId) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                if handle.data(channel, CryptoVec::from(chunk)).await.is_err() {
                    break;
                }
            }
        });
        Self { tx, buf: Vec::new() }
    }
}

impl io::Write for TermWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::take(&mut self.buf);
        self.tx
            .send(chunk)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "ssh channel closed"))
    }
}

/// Incremental parser for the byte stream a terminal-mode SSH client sends.
/// Escape sequences can split across reads, so unfinished input carries
/// over to the next feed.
#[derive(Default)]
pub struct KeyParser {
    pending: Vec<u8>,
}

impl KeyParser {
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<KeyEvent> {
        self.pending.extend_from_slice(bytes);
        let mut events = Vec::new();

        let mut i = 0;
        let buf = std::mem::take(&mut self.pending);
        while i < buf.len() {
            match buf[i] {
                0x1b => {
                    match parse_escape(&buf[i..]) {
                        Escape::Key(event, used) => {
                            events.push(event);
                            i += used;
                        }
                        // Sequence still arriving; keep the tail for the
                        // next feed.
                        Escape::Incomplete => {
                            self.pending = buf[i..].to_vec();
                            return events;
                        }
                    }
                }
                b'\r' | b'\n' => {
                    events.push(KeyEvent::plain(KeyCode::Enter));
                    i += 1;
                }
                0x7f | 0x08 => {
                    events.push(KeyEvent::plain(KeyCode::Backspace));
                    i += 1;
                }
                b'\t' => {
                    events.push(KeyEvent::plain(KeyCode::Tab));
                    i += 1;
                }
                b @ 0x01..=0x1a => {
                    events.push(KeyEvent::ctrl((b'a' + b - 1) as char));
                    i += 1;
                }
                b if b < 0x80 => {
                    if !(b as char).is_control() {
                        events.push(KeyEvent::plain(KeyCode::Char(b as char)));
                    }
                    i += 1;
                }
                _ => {
                    // Multi-byte UTF-8 scalar.
                    let tail = &buf[i..];
                    match next_utf8_char(tail) {
                        Some((c, used)) => {
                            events.push(KeyEvent::plain(KeyCode::Char(c)));
                            i += used;
                        }
                        None => {
                            self.pending = tail.to_vec();
                            return events;
                        }
                    }
                }
            }
        }

        events
    }
}

enum Escape {
    Key(KeyEvent, usize),
    Incomplete,
}

/// Decodes one escape sequence starting at `buf[0] == ESC`.
fn parse_escape(buf: &[u8]) -> Escape {
    if buf.len() == 1 {
        // A bare escape arrives alone in its own packet.
        return Escape::Key(KeyEvent::plain(KeyCode::Esc), 1);
    }
    if buf[1] != b'[' {
        return Escape::Key(KeyEvent::plain(KeyCode::Esc), 1);
    }
    // CSI: parameters, then a final byte in 0x40..=0x7e.
    for (offset, &b) in buf.iter().enumerate().skip(2) {
        if (0x40..=0x7e).contains(&b) {
            let used = offset + 1;
            let code = match b {
                b'A' => KeyCode::Up,
                b'B' => KeyCode::Down,
                b'C' => KeyCode::Right,
                b'D' => KeyCode::Left,
                b'H' => KeyCode::Home,
                b'F' => KeyCode::End,
                b'~' => match &buf[2..offset] {
                    b"3" => KeyCode::Delete,
                    b"5" => KeyCode::PageUp,
                    b"6" => KeyCode::PageDown,
                    _ => KeyCode::Null,
                },
                _ => KeyCode::Null,
            };
            return Escape::Key(KeyEvent::plain(code), used);
        }
    }
    Escape::Incomplete
}

fn next_utf8_char(buf: &[u8]) -> Option<(char, usize)> {
    for len in 2..=4.min(buf.len()) {
        if let Ok(s) = std::str::from_utf8(&buf[..len]) {
            if let Some(c) = s.chars().next() {
                return Some((c, len));
            }
        }
    }
    if buf.len() >= 4 {
        // Not valid UTF-8 at all; consume one byte and move on.
        return Some((char::REPLACEMENT_CHARACTER, 1));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_characters_become_key_events() {
        let mut parser = KeyParser::default();
        let events = parser.feed(b"ab");
        assert_eq!(events.len(), 2);
        assert!(events[0].is_char('a'));
        assert!(events[1].is_char('b'));
    }

    #[test]
    fn control_bytes_map_to_ctrl_keys() {
        let mut parser = KeyParser::default();
        let events = parser.feed(&[0x03, 0x0e]);
        assert!(events[0].is_ctrl('c'));
        assert!(events[1].is_ctrl('n'));
    }

    #[test]
    fn arrow_keys_decode_from_csi() {
        let mut parser = KeyParser::default();
        let events = parser.feed(b"\x1b[A\x1b[D");
        assert_eq!(events[0].code, KeyCode::Up);
        assert_eq!(events[1].code, KeyCode::Left);
    }

    #[test]
    fn split_escape_sequences_carry_over() {
        let mut parser = KeyParser::default();
        assert!(parser.feed(b"\x1b[").is_empty());
        let events = parser.feed(b"B");
        assert_eq!(events[0].code, KeyCode::Down);
    }

    #[test]
    fn bare_escape_is_escape() {
        let mut parser = KeyParser::default();
        let events = parser.feed(&[0x1b]);
        assert_eq!(events[0].code, KeyCode::Esc);
    }

    #[test]
    fn enter_and_backspace() {
        let mut parser = KeyParser::default();
        let events = parser.feed(b"\r\x7f");
        assert_eq!(events[0].code, KeyCode::Enter);
        assert_eq!(events[1].code, KeyCode::Backspace);
    }

    #[test]
    fn utf8_characters_decode() {
        let mut parser = KeyParser::default();
        let events = parser.feed("é".as_bytes());
        assert!(events[0].is_char('é'));
    }
}
