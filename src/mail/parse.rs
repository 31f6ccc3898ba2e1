//! Reduces an arbitrarily nested internet message to one plain-text string.
//!
//! Selection order:
//! 1. A message without a Content-Type header is read whole as text.
//! 2. Attachment parts (disposition `attachment`, or any part carrying a
//!    `filename` parameter) are skipped.
//! 3. Multipart containers are walked recursively; the walk stops as soon
//!    as a `text/plain` part has been captured.
//! 4. The first `text/html` part is kept as a fallback and converted once
//!    the walk finishes without a text part.
//! 5. A message with neither yields a fixed placeholder.

use anyhow::{Context, Result};
use mailparse::{DispositionType, MailHeaderMap, ParsedMail};

const EMPTY_MESSAGE: &str = "empty message :(";

pub fn extract_plain_text(message: &ParsedMail) -> Result<String> {
    let mut text: Option<String> = None;
    let mut html: Option<String> = None;

    resolve(message, &mut text, &mut html)?;

    if let Some(text) = text {
        return Ok(text);
    }
    if let Some(html) = html {
        let rendered = html2text::from_read(html.as_bytes(), 80);
        return Ok(rendered);
    }
    Ok(EMPTY_MESSAGE.to_string())
}

fn resolve(part: &ParsedMail, text: &mut Option<String>, html: &mut Option<String>) -> Result<()> {
    // No declared content type at all: the entire body is the message.
    if part.headers.get_first_value("Content-Type").is_none() && part.subparts.is_empty() {
        *text = Some(part.get_body().context("could not read message body")?);
        return Ok(());
    }

    // We hate attachments.
    let disposition = part.get_content_disposition();
    if disposition.disposition == DispositionType::Attachment
        || disposition.params.contains_key("filename")
    {
        return Ok(());
    }

    if part.ctype.mimetype.starts_with("multipart/") {
        for sub in &part.subparts {
            resolve(sub, text, html)?;
            if text.is_some() {
                return Ok(());
            }
        }
        return Ok(());
    }

    match part.ctype.mimetype.as_str() {
        "text/plain" => {
            *text = Some(part.get_body().context("could not read text part")?);
        }
        "text/html" => {
            if html.is_none() {
                *html = Some(part.get_body().context("could not read html part")?);
            }
        }
        _ => {}
    }

    Ok(())
}

/// SMTP delivers CRLF-delimited text; terminal rendering wants plain
/// newlines.
pub fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(raw: &str) -> String {
        let parsed = mailparse::parse_mail(raw.as_bytes()).expect("parse failed");
        extract_plain_text(&parsed).expect("extract failed")
    }

    #[test]
    fn single_text_part_passes_through() {
        let raw = concat!(
            "From: a@example.org\r\n",
            "Subject: hi\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "hello there",
        );
        assert_eq!(extract(raw), "hello there");
    }

    #[test]
    fn message_without_content_type_is_read_whole() {
        let raw = concat!("From: a@example.org\r\n", "\r\n", "bare body");
        assert_eq!(extract(raw), "bare body");
    }

    #[test]
    fn text_wins_over_html_in_multipart() {
        let raw = concat!(
            "Content-Type: multipart/alternative; boundary=\"xyz\"\r\n",
            "\r\n",
            "--xyz\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<p>rich</p>\r\n",
            "--xyz\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "plain\r\n",
            "--xyz--\r\n",
        );
        assert_eq!(extract(raw).trim_end(), "plain");
    }

    #[test]
    fn html_is_converted_when_no_text_exists() {
        let raw = concat!(
            "Content-Type: multipart/alternative; boundary=\"xyz\"\r\n",
            "\r\n",
            "--xyz\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<html><body><p>only markup</p></body></html>\r\n",
            "--xyz--\r\n",
        );
        assert!(extract(raw).contains("only markup"));
    }

    #[test]
    fn attachments_are_skipped() {
        let raw = concat!(
            "Content-Type: multipart/mixed; boundary=\"xyz\"\r\n",
            "\r\n",
            "--xyz\r\n",
            "Content-Type: text/plain\r\n",
            "Content-Disposition: attachment; filename=\"notes.txt\"\r\n",
            "\r\n",
            "attached text\r\n",
            "--xyz\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "inline text\r\n",
            "--xyz--\r\n",
        );
        assert_eq!(extract(raw).trim_end(), "inline text");
    }

    #[test]
    fn nested_multipart_is_walked() {
        let raw = concat!(
            "Content-Type: multipart/mixed; boundary=\"outer\"\r\n",
            "\r\n",
            "--outer\r\n",
            "Content-Type: multipart/alternative; boundary=\"inner\"\r\n",
            "\r\n",
            "--inner\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "deep plain\r\n",
            "--inner--\r\n",
            "--outer--\r\n",
        );
        assert_eq!(extract(raw).trim_end(), "deep plain");
    }

    #[test]
    fn empty_message_yields_placeholder() {
        let raw = concat!(
            "Content-Type: multipart/mixed; boundary=\"xyz\"\r\n",
            "\r\n",
            "--xyz\r\n",
            "Content-Type: application/octet-stream\r\n",
            "\r\n",
            "binary\r\n",
            "--xyz--\r\n",
        );
        assert_eq!(extract(raw), EMPTY_MESSAGE);
    }

    #[test]
    fn newlines_are_normalized() {
        assert_eq!(normalize_newlines("a\r\nb\r\nc"), "a\nb\nc");
        assert_eq!(normalize_newlines("plain\nalready"), "plain\nalready");
    }
}
