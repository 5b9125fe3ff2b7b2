//! RFC 822 parsing into the fields the engine stores.

use chrono::{DateTime, Utc};
use mailparse::{DispositionType, MailAddr, MailHeaderMap, ParsedMail};

use crate::Result;
use crate::message::EmailAddress;

/// Characters kept in a snippet.
const SNIPPET_CHARS: usize = 200;

/// An attachment body extracted from a MIME tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAttachment {
    /// Original filename, or a generated one.
    pub filename: String,
    /// MIME type, lower-cased.
    pub content_type: String,
    /// Shown inline rather than as a download.
    pub inline: bool,
    /// `Content-ID` without angle brackets.
    pub content_id: Option<String>,
    /// Decoded body.
    pub data: Vec<u8>,
}

/// Headers and bodies of a raw message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedMessage {
    /// `Message-ID`, normalized to `<id>`.
    pub message_id: Option<String>,
    /// First `In-Reply-To` ID.
    pub in_reply_to: Option<String>,
    /// `References` IDs in header order.
    pub references: Vec<String>,
    /// Decoded subject.
    pub subject: String,
    /// From.
    pub from: Vec<EmailAddress>,
    /// To.
    pub to: Vec<EmailAddress>,
    /// Cc.
    pub cc: Vec<EmailAddress>,
    /// Bcc.
    pub bcc: Vec<EmailAddress>,
    /// `Date` header.
    pub date: Option<DateTime<Utc>>,
    /// First text/plain part.
    pub text_body: Option<String>,
    /// First text/html part.
    pub html_body: Option<String>,
    /// Attachments and inline non-text parts.
    pub attachments: Vec<ParsedAttachment>,
}

impl ParsedMessage {
    /// Parses a raw message.
    ///
    /// # Errors
    ///
    /// Returns an error if the MIME structure cannot be parsed.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let mail = mailparse::parse_mail(raw)?;
        let headers = &mail.headers;

        let mut parsed = Self {
            message_id: headers
                .get_first_value("Message-ID")
                .and_then(|v| message_ids(&v).into_iter().next()),
            in_reply_to: headers
                .get_first_value("In-Reply-To")
                .and_then(|v| message_ids(&v).into_iter().next()),
            references: headers
                .get_first_value("References")
                .map(|v| message_ids(&v))
                .unwrap_or_default(),
            subject: headers.get_first_value("Subject").unwrap_or_default(),
            from: address_list(headers.get_first_value("From").as_deref()),
            to: address_list(headers.get_first_value("To").as_deref()),
            cc: address_list(headers.get_first_value("Cc").as_deref()),
            bcc: address_list(headers.get_first_value("Bcc").as_deref()),
            date: headers
                .get_first_value("Date")
                .and_then(|v| mailparse::dateparse(&v).ok())
                .and_then(|secs| DateTime::from_timestamp(secs, 0)),
            ..Self::default()
        };

        walk_mime_parts(&mail, &mut parsed);
        Ok(parsed)
    }

    /// Reply-matching candidates: In-Reply-To first, then References newest first.
    #[must_use]
    pub fn thread_candidates(&self) -> (Vec<String>, Vec<String>) {
        let direct: Vec<String> = self.in_reply_to.iter().cloned().collect();
        let references = self
            .references
            .iter()
            .rev()
            .filter(|id| !direct.contains(id))
            .cloned()
            .collect();
        (direct, references)
    }

    /// Whitespace-collapsed preview of the body.
    #[must_use]
    pub fn snippet(&self) -> String {
        let source = match (&self.text_body, &self.html_body) {
            (Some(text), _) if !text.trim().is_empty() => text.clone(),
            (_, Some(html)) => strip_tags(html),
            _ => String::new(),
        };
        source
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .chars()
            .take(SNIPPET_CHARS)
            .collect()
    }
}

/// Reads only the `Message-ID` header of a raw message.
///
/// Returns `None` when the header is missing or the header block is malformed.
#[must_use]
pub fn header_message_id(raw: &[u8]) -> Option<String> {
    let (headers, _) = mailparse::parse_headers(raw).ok()?;
    headers
        .get_first_value("Message-ID")
        .and_then(|v| message_ids(&v).into_iter().next())
}

/// Extracts `<id>` tokens from a Message-ID style header value.
///
/// Values without angle brackets are split on whitespace and wrapped.
#[must_use]
pub fn message_ids(value: &str) -> Vec<String> {
    let mut ids = Vec::new();
    let mut rest = value;
    while let Some(start) = rest.find('<') {
        let Some(len) = rest[start..].find('>') else {
            break;
        };
        let inner = rest[start + 1..start + len].trim();
        if !inner.is_empty() {
            ids.push(format!("<{inner}>"));
        }
        rest = &rest[start + len + 1..];
    }

    if ids.is_empty() {
        ids = value
            .split_whitespace()
            .map(|token| token.trim_matches(|c| c == '<' || c == '>'))
            .filter(|token| !token.is_empty())
            .map(|token| format!("<{token}>"))
            .collect();
    }
    ids
}

fn address_list(value: Option<&str>) -> Vec<EmailAddress> {
    let Some(value) = value.filter(|v| !v.trim().is_empty()) else {
        return Vec::new();
    };

    match mailparse::addrparse(value) {
        Ok(list) => list
            .iter()
            .flat_map(|addr| match addr {
                MailAddr::Single(info) => vec![EmailAddress {
                    name: info.display_name.clone(),
                    address: info.addr.clone(),
                }],
                MailAddr::Group(group) => group
                    .addrs
                    .iter()
                    .map(|info| EmailAddress {
                        name: info.display_name.clone(),
                        address: info.addr.clone(),
                    })
                    .collect(),
            })
            .collect(),
        Err(_) => vec![EmailAddress::new(value.trim())],
    }
}

fn walk_mime_parts(part: &ParsedMail<'_>, parsed: &mut ParsedMessage) {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            walk_mime_parts(sub, parsed);
        }
        return;
    }

    let content_type = part.ctype.mimetype.to_lowercase();
    let disposition = part.get_content_disposition();
    let is_attachment = disposition.disposition == DispositionType::Attachment;
    let is_inline_non_text =
        disposition.disposition == DispositionType::Inline && !content_type.starts_with("text/");
    let named = disposition.params.contains_key("filename") || part.ctype.params.contains_key("name");

    if is_attachment || is_inline_non_text || (named && !content_type.starts_with("text/")) {
        let Ok(data) = part.get_body_raw() else {
            return;
        };
        let filename = disposition
            .params
            .get("filename")
            .or_else(|| part.ctype.params.get("name"))
            .cloned()
            .unwrap_or_else(|| format!("attachment-{}", parsed.attachments.len() + 1));
        let content_id = part
            .headers
            .get_first_value("Content-ID")
            .map(|id| id.trim().trim_matches(|c| c == '<' || c == '>').to_string());

        parsed.attachments.push(ParsedAttachment {
            filename,
            content_type,
            inline: !is_attachment,
            content_id,
            data,
        });
    } else if content_type == "text/plain" && parsed.text_body.is_none() {
        parsed.text_body = part.get_body().ok();
    } else if content_type == "text/html" && parsed.html_body.is_none() {
        parsed.html_body = part.get_body().ok();
    }
}

fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const MULTIPART: &[u8] = b"Message-ID: <root@example.com>\r\n\
In-Reply-To: <parent@example.com>\r\n\
References: <grand@example.com> <parent@example.com>\r\n\
From: Alice <alice@example.com>\r\n\
To: bob@example.com, Carol <carol@example.com>\r\n\
Subject: =?UTF-8?Q?Caf=C3=A9?= plans\r\n\
Date: Tue, 1 Oct 2024 10:00:00 +0000\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"b1\"\r\n\
\r\n\
--b1\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Lunch   at\r\n noon?\r\n\
--b1\r\n\
Content-Type: application/pdf; name=\"menu.pdf\"\r\n\
Content-Disposition: attachment; filename=\"menu.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0=\r\n\
--b1--\r\n";

    #[test]
    fn header_message_id_skips_body() {
        assert_eq!(header_message_id(MULTIPART).as_deref(), Some("<root@example.com>"));
        assert_eq!(header_message_id(b"Subject: none\r\n\r\nbody"), None);
    }

    #[test]
    fn parses_headers_bodies_and_attachments() {
        let parsed = ParsedMessage::parse(MULTIPART).unwrap();

        assert_eq!(parsed.message_id.as_deref(), Some("<root@example.com>"));
        assert_eq!(parsed.in_reply_to.as_deref(), Some("<parent@example.com>"));
        assert_eq!(
            parsed.references,
            vec!["<grand@example.com>", "<parent@example.com>"]
        );
        assert_eq!(parsed.subject, "Café plans");
        assert_eq!(parsed.from[0].address, "alice@example.com");
        assert_eq!(parsed.from[0].name.as_deref(), Some("Alice"));
        assert_eq!(parsed.to.len(), 2);
        assert_eq!(parsed.date.unwrap().to_rfc3339(), "2024-10-01T10:00:00+00:00");
        assert_eq!(parsed.snippet(), "Lunch at noon?");

        assert_eq!(parsed.attachments.len(), 1);
        let attachment = &parsed.attachments[0];
        assert_eq!(attachment.filename, "menu.pdf");
        assert_eq!(attachment.content_type, "application/pdf");
        assert!(!attachment.inline);
        assert_eq!(attachment.data, b"%PDF-");
    }

    #[test]
    fn candidates_prefer_in_reply_to() {
        let parsed = ParsedMessage::parse(MULTIPART).unwrap();
        let (direct, references) = parsed.thread_candidates();
        assert_eq!(direct, vec!["<parent@example.com>"]);
        assert_eq!(references, vec!["<grand@example.com>"]);
    }

    #[test]
    fn missing_message_id_is_none() {
        let parsed = ParsedMessage::parse(b"Subject: hi\r\n\r\nbody").unwrap();
        assert!(parsed.message_id.is_none());
        assert!(parsed.from.is_empty());
    }

    #[test]
    fn message_ids_tolerate_missing_brackets() {
        assert_eq!(message_ids("<a@x> <b@x>"), vec!["<a@x>", "<b@x>"]);
        assert_eq!(message_ids("a@x"), vec!["<a@x>"]);
        assert!(message_ids("  ").is_empty());
    }

    #[test]
    fn html_only_snippet_drops_markup() {
        let raw = b"Content-Type: text/html\r\n\r\n<p>Hello <b>there</b></p>";
        let parsed = ParsedMessage::parse(raw).unwrap();
        assert_eq!(parsed.snippet(), "Hello there");
    }
}
