//! Turning raw RFC 822 bytes into the pieces the archiver stores.

use chrono::{DateTime, TimeZone, Utc};
use mailparse::{DispositionType, MailHeaderMap, ParsedMail};
use tracing::warn;

use crate::error::{MailstashError, Result};

/// One message as delivered by the fetch stream.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub seq: u32,
    pub body: Vec<u8>,
    pub internal_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content: Vec<u8>,
}

/// An attachment whose transfer encoding could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokenAttachment {
    pub filename: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct DecodedMessage {
    pub sender: String,
    pub subject: String,
    pub date: DateTime<Utc>,
    pub html: String,
    pub attachments: Vec<Attachment>,
    pub broken_attachments: Vec<BrokenAttachment>,
}

#[derive(Default)]
struct Parts {
    html: Option<String>,
    text: Option<String>,
    attachments: Vec<Attachment>,
    broken_attachments: Vec<BrokenAttachment>,
}

impl DecodedMessage {
    pub fn parse(raw: &RawMessage) -> Result<Self> {
        let parsed = mailparse::parse_mail(&raw.body)
            .map_err(|e| MailstashError::Decode(format!("message #{}: {e}", raw.seq)))?;
        let headers = parsed.get_headers();

        let date = headers
            .get_first_value("Date")
            .and_then(|v| mailparse::dateparse(&v).ok())
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .or(raw.internal_date)
            .ok_or_else(|| {
                MailstashError::Decode(format!("message #{} has no usable date", raw.seq))
            })?;

        let sender = headers.get_first_value("From").unwrap_or_default();
        let subject = headers.get_first_value("Subject").unwrap_or_default();

        let mut parts = Parts::default();
        collect_parts(&parsed, raw.seq, &mut parts);

        let html = match (parts.html, parts.text) {
            (Some(html), _) => html,
            (None, Some(text)) => text_as_html(&text),
            (None, None) => String::new(),
        };

        Ok(Self {
            sender: sender.trim().to_string(),
            subject: subject.trim().to_string(),
            date,
            html,
            attachments: parts.attachments,
            broken_attachments: parts.broken_attachments,
        })
    }
}

/// Walk the MIME tree. A part that fails to decode only loses itself: bad
/// attachments are kept aside for reporting, bad bodies are skipped.
fn collect_parts(part: &ParsedMail, seq: u32, parts: &mut Parts) {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            collect_parts(sub, seq, parts);
        }
        return;
    }

    let disposition = part.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .cloned();
    let mimetype = part.ctype.mimetype.to_ascii_lowercase();

    let is_attachment = disposition.disposition == DispositionType::Attachment
        || (filename.is_some() && !mimetype.starts_with("text/"));
    if is_attachment {
        let filename = filename.unwrap_or_default();
        match part.get_body_raw() {
            Ok(content) => parts.attachments.push(Attachment { filename, content }),
            Err(e) => parts.broken_attachments.push(BrokenAttachment {
                filename,
                reason: e.to_string(),
            }),
        }
        return;
    }

    let slot = match mimetype.as_str() {
        "text/html" if parts.html.is_none() => &mut parts.html,
        "text/plain" if parts.text.is_none() => &mut parts.text,
        _ => return,
    };
    match part.get_body() {
        Ok(body) => *slot = Some(body),
        Err(e) => warn!(seq, mimetype = %mimetype, "skipping undecodable body part: {e}"),
    }
}

/// Render a plain text body as minimal HTML: blank lines split paragraphs,
/// single newlines become `<br/>`.
pub fn text_as_html(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n");
    let paragraphs: Vec<String> = normalized
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| format!("<p>{}</p>", escape_html(p).replace('\n', "<br/>")))
        .collect();
    paragraphs.join("")
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(seq: u32, body: &str) -> RawMessage {
        RawMessage {
            seq,
            body: body.replace('\n', "\r\n").into_bytes(),
            internal_date: None,
        }
    }

    #[test]
    fn prefers_html_part() {
        let msg = raw(
            7,
            "From: Alice <alice@trusted.example>\n\
             Subject: Invoice\n\
             Date: Tue, 05 Mar 2024 14:07:09 +0000\n\
             MIME-Version: 1.0\n\
             Content-Type: multipart/alternative; boundary=\"b\"\n\
             \n\
             --b\n\
             Content-Type: text/plain\n\
             \n\
             plain\n\
             --b\n\
             Content-Type: text/html\n\
             \n\
             <b>rich</b>\n\
             --b--\n",
        );

        let decoded = DecodedMessage::parse(&msg).unwrap();

        assert_eq!(decoded.sender, "Alice <alice@trusted.example>");
        assert_eq!(decoded.subject, "Invoice");
        assert_eq!(decoded.date.to_rfc3339(), "2024-03-05T14:07:09+00:00");
        assert!(decoded.html.contains("<b>rich</b>"));
        assert!(decoded.attachments.is_empty());
    }

    #[test]
    fn falls_back_to_text_as_html() {
        let msg = raw(
            1,
            "From: bob@example.org\n\
             Date: Tue, 05 Mar 2024 14:07:09 +0000\n\
             Content-Type: text/plain\n\
             \n\
             a < b\n\
             second line\n\
             \n\
             next\n",
        );

        let decoded = DecodedMessage::parse(&msg).unwrap();

        assert_eq!(
            decoded.html,
            "<p>a &lt; b<br/>second line</p><p>next</p>"
        );
    }

    #[test]
    fn extracts_attachments_in_order() {
        let msg = raw(
            3,
            "From: carol@example.org\n\
             Date: Wed, 06 Mar 2024 08:00:00 +0100\n\
             Content-Type: multipart/mixed; boundary=\"m\"\n\
             \n\
             --m\n\
             Content-Type: text/html\n\
             \n\
             <p>see attached</p>\n\
             --m\n\
             Content-Type: application/pdf; name=\"scan.pdf\"\n\
             Content-Disposition: attachment; filename=\"scan.pdf\"\n\
             Content-Transfer-Encoding: base64\n\
             \n\
             JVBERi0=\n\
             --m\n\
             Content-Type: text/csv\n\
             Content-Disposition: attachment; filename=\"data.csv\"\n\
             \n\
             a,b\n\
             --m--\n",
        );

        let decoded = DecodedMessage::parse(&msg).unwrap();

        let names: Vec<_> = decoded.attachments.iter().map(|a| a.filename.as_str()).collect();
        assert_eq!(names, ["scan.pdf", "data.csv"]);
        assert_eq!(decoded.attachments[0].content, b"%PDF-");
        assert!(decoded.html.contains("see attached"));
    }

    #[test]
    fn bad_attachment_encoding_keeps_the_rest_of_the_message() {
        let msg = raw(
            11,
            "From: erin@example.org\n\
             Date: Thu, 07 Mar 2024 10:00:00 +0000\n\
             Content-Type: multipart/mixed; boundary=\"m\"\n\
             \n\
             --m\n\
             Content-Type: text/html\n\
             \n\
             <p>body survives</p>\n\
             --m\n\
             Content-Type: application/octet-stream\n\
             Content-Disposition: attachment; filename=\"broken.bin\"\n\
             Content-Transfer-Encoding: base64\n\
             \n\
             !!!not*base64@@@\n\
             --m\n\
             Content-Type: text/csv\n\
             Content-Disposition: attachment; filename=\"ok.csv\"\n\
             \n\
             a,b\n\
             --m--\n",
        );

        let decoded = DecodedMessage::parse(&msg).unwrap();

        assert!(decoded.html.contains("body survives"));
        assert_eq!(decoded.attachments.len(), 1);
        assert_eq!(decoded.attachments[0].filename, "ok.csv");
        assert_eq!(decoded.broken_attachments.len(), 1);
        assert_eq!(decoded.broken_attachments[0].filename, "broken.bin");
    }

    #[test]
    fn uses_internal_date_without_date_header() {
        let mut msg = raw(2, "From: dave@example.org\nContent-Type: text/plain\n\nhi\n");
        let internal = Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 0).unwrap();

        assert!(matches!(
            DecodedMessage::parse(&msg),
            Err(MailstashError::Decode(_))
        ));

        msg.internal_date = Some(internal);
        assert_eq!(DecodedMessage::parse(&msg).unwrap().date, internal);
    }
}
