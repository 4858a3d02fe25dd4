use mailparse::{DispositionType, MailAddr, MailHeaderMap, ParsedMail, SingleInfo};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SNIPPET_CHARS: usize = 250;
const HTML_TEXT_WIDTH: usize = 200;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("message is empty")]
    Empty,
    #[error("message has no header block")]
    NoHeaders,
    #[error("malformed message: {0}")]
    Malformed(#[from] mailparse::MailParseError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub address: String,
}

impl Address {
    pub fn display(&self) -> String {
        match self.name.as_deref() {
            Some(name) if !self.address.is_empty() => format!("{} <{}>", name, self.address),
            Some(name) => name.to_string(),
            None => self.address.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    pub part_id: String,
    pub filename: String,
    pub content_type: String,
    pub content_id: Option<String>,
    pub size: usize,
}

#[derive(Debug, Clone)]
pub struct PartData {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Structured view of a raw message. Header fields that are missing or do
/// not parse are left empty.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub from: Option<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub reply_to: Vec<Address>,
    pub return_path: String,
    pub subject: String,
    pub message_id: String,
    /// Date header in milliseconds since the epoch.
    pub date: Option<i64>,
    pub x_tags: Vec<String>,
    pub text: String,
    pub html: String,
    pub attachments: Vec<Part>,
    pub inlines: Vec<Part>,
}

enum LeafKind {
    Attachment,
    Inline,
    Body,
}

pub fn parse(raw: &[u8]) -> Result<Envelope, CodecError> {
    if raw.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(CodecError::Empty);
    }
    let parsed = mailparse::parse_mail(raw)?;
    if parsed.headers.is_empty() {
        return Err(CodecError::NoHeaders);
    }

    let headers = &parsed.headers;
    let mut envelope = Envelope {
        from: from_address(&parsed),
        to: address_list(&parsed, "To"),
        cc: address_list(&parsed, "Cc"),
        bcc: address_list(&parsed, "Bcc"),
        reply_to: address_list(&parsed, "Reply-To"),
        return_path: headers
            .get_first_value("Return-Path")
            .map(|v| trim_angles(&v))
            .unwrap_or_default(),
        subject: headers
            .get_first_value("Subject")
            .map(|v| v.trim().to_string())
            .unwrap_or_default(),
        message_id: headers
            .get_first_value("Message-ID")
            .map(|v| trim_angles(&v))
            .unwrap_or_default(),
        date: headers
            .get_first_value("Date")
            .and_then(|v| mailparse::dateparse(v.trim()).ok())
            .map(|secs| secs * 1000),
        x_tags: headers
            .get_all_values("X-Tags")
            .iter()
            .flat_map(|v| v.split(','))
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect(),
        ..Envelope::default()
    };

    let mut leaves = Vec::new();
    collect_leaves(&parsed, "", &mut leaves);
    for (part_id, part) in leaves {
        let filename = part_filename(part);
        let content_id = part_content_id(part);
        let ctype = part.ctype.mimetype.to_lowercase();
        match classify(part, &ctype, filename.as_deref(), content_id.as_deref()) {
            LeafKind::Body => {
                let Ok(body) = part.get_body() else {
                    continue;
                };
                if ctype == "text/html" && envelope.html.is_empty() {
                    envelope.html = body;
                } else if ctype != "text/html" && envelope.text.is_empty() {
                    envelope.text = body;
                }
            }
            kind => {
                let meta = Part {
                    part_id,
                    filename: filename.unwrap_or_default(),
                    content_type: ctype,
                    content_id,
                    size: part.get_body_raw().map(|b| b.len()).unwrap_or(0),
                };
                if matches!(kind, LeafKind::Inline) {
                    envelope.inlines.push(meta);
                } else {
                    envelope.attachments.push(meta);
                }
            }
        }
    }

    Ok(envelope)
}

/// Decoded bytes of one attachment or inline part, addressed by its part id.
pub fn part_data(raw: &[u8], part_id: &str) -> Result<Option<PartData>, CodecError> {
    let parsed = mailparse::parse_mail(raw)?;
    let mut leaves = Vec::new();
    collect_leaves(&parsed, "", &mut leaves);
    for (id, part) in leaves {
        if id != part_id {
            continue;
        }
        return Ok(Some(PartData {
            filename: part_filename(part).unwrap_or_default(),
            content_type: part.ctype.mimetype.to_lowercase(),
            data: part.get_body_raw()?,
        }));
    }
    Ok(None)
}

/// Lower-cased, punctuation-collapsed text used for full-text matching.
pub fn search_text(envelope: &Envelope) -> String {
    let mut buf = String::new();
    if let Some(from) = &envelope.from {
        push_word(&mut buf, &from.display());
    }
    push_word(&mut buf, &envelope.subject);
    for list in [&envelope.to, &envelope.cc, &envelope.bcc, &envelope.reply_to] {
        for addr in list {
            push_word(&mut buf, &addr.display());
        }
    }
    push_word(&mut buf, &envelope.return_path);
    push_word(&mut buf, &readable_body(envelope));
    for part in &envelope.attachments {
        push_word(&mut buf, &part.filename);
    }
    clean_text(&buf)
}

pub fn snippet(envelope: &Envelope) -> String {
    let collapsed = envelope_words(&readable_body(envelope));
    if collapsed.chars().count() <= SNIPPET_CHARS {
        return collapsed;
    }
    let mut out: String = collapsed.chars().take(SNIPPET_CHARS).collect();
    out.truncate(out.trim_end().len());
    out.push_str("...");
    out
}

/// Tags requested by the message itself: `X-Tags` values and plus-address
/// suffixes (`user+tag@host`). Returned uncleaned.
pub fn suggested_tags(envelope: &Envelope, x_tags: bool, plus_addresses: bool) -> Vec<String> {
    let mut out = Vec::new();
    if x_tags {
        out.extend(envelope.x_tags.iter().cloned());
    }
    if plus_addresses {
        let lists = [&envelope.to, &envelope.cc, &envelope.bcc];
        let addrs = envelope.from.iter().chain(lists.into_iter().flatten());
        for addr in addrs {
            if let Some(tag) = plus_suffix(&addr.address) {
                out.push(tag);
            }
        }
    }
    out
}

pub fn clean_text(input: &str) -> String {
    let replaced: String = input
        .chars()
        .map(|c| match c {
            '\r' | '\n' | '\t' | '<' | '>' | '"' | ',' | ';' | ':' | '(' | ')' | '\u{feff}' => ' ',
            c => c,
        })
        .collect();
    envelope_words(&replaced).to_lowercase()
}

pub fn html_to_text(html: &str) -> String {
    let text = html2text::from_read(html.as_bytes(), HTML_TEXT_WIDTH);
    html_escape::decode_html_entities(&text).to_string()
}

fn readable_body(envelope: &Envelope) -> String {
    if !envelope.html.is_empty() {
        html_to_text(&envelope.html)
    } else {
        envelope.text.clone()
    }
}

fn envelope_words(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn push_word(buf: &mut String, value: &str) {
    if value.trim().is_empty() {
        return;
    }
    if !buf.is_empty() {
        buf.push(' ');
    }
    buf.push_str(value);
}

fn plus_suffix(address: &str) -> Option<String> {
    let (local, _) = address.split_once('@')?;
    let (_, tag) = local.split_once('+')?;
    let tag = tag.trim();
    if tag.is_empty() {
        None
    } else {
        Some(tag.to_string())
    }
}

fn trim_angles(value: &str) -> String {
    value
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
        .to_string()
}

fn collect_leaves<'a, 'b>(
    part: &'b ParsedMail<'a>,
    prefix: &str,
    out: &mut Vec<(String, &'b ParsedMail<'a>)>,
) {
    if part.subparts.is_empty() {
        let id = if prefix.is_empty() { "1" } else { prefix };
        out.push((id.to_string(), part));
        return;
    }
    for (idx, sub) in part.subparts.iter().enumerate() {
        let child = if prefix.is_empty() {
            (idx + 1).to_string()
        } else {
            format!("{}.{}", prefix, idx + 1)
        };
        collect_leaves(sub, &child, out);
    }
}

fn classify(
    part: &ParsedMail,
    ctype: &str,
    filename: Option<&str>,
    content_id: Option<&str>,
) -> LeafKind {
    // mailparse reports `inline` when the header is absent.
    let explicit = part.headers.get_first_value("Content-Disposition").is_some();
    match part.get_content_disposition().disposition {
        DispositionType::Attachment => LeafKind::Attachment,
        DispositionType::Inline if explicit && (filename.is_some() || content_id.is_some()) => {
            LeafKind::Inline
        }
        _ if content_id.is_some() && !ctype.starts_with("text/") => LeafKind::Inline,
        _ if filename.is_some() => LeafKind::Attachment,
        _ if ctype.starts_with("text/") => LeafKind::Body,
        _ => LeafKind::Attachment,
    }
}

fn part_filename(part: &ParsedMail) -> Option<String> {
    part.get_content_disposition()
        .params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

fn part_content_id(part: &ParsedMail) -> Option<String> {
    part.headers
        .get_first_value("Content-ID")
        .map(|v| trim_angles(&v))
        .filter(|v| !v.is_empty())
}

fn from_address(parsed: &ParsedMail) -> Option<Address> {
    let header = parsed.headers.get_first_header("From")?;
    let value = header.get_value();
    if value.trim().is_empty() {
        return None;
    }
    let parsed_list = mailparse::addrparse_header(header).ok();
    let first = parsed_list
        .as_ref()
        .and_then(|list| mailaddrs_to_addresses(list).into_iter().next());
    match first {
        Some(addr) => Some(addr),
        None => Some(Address {
            name: Some(value.trim().to_string()),
            address: String::new(),
        }),
    }
}

fn address_list(parsed: &ParsedMail, name: &str) -> Vec<Address> {
    let Some(header) = parsed.headers.get_first_header(name) else {
        return Vec::new();
    };
    match mailparse::addrparse_header(header) {
        Ok(list) => mailaddrs_to_addresses(&list),
        Err(_) => Vec::new(),
    }
}

fn mailaddrs_to_addresses(addrs: &[MailAddr]) -> Vec<Address> {
    let mut out = Vec::new();
    for addr in addrs {
        match addr {
            MailAddr::Single(info) => out.push(single_to_address(info)),
            MailAddr::Group(group) => out.extend(group.addrs.iter().map(single_to_address)),
        }
    }
    out
}

fn single_to_address(info: &SingleInfo) -> Address {
    Address {
        name: info
            .display_name
            .as_ref()
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty()),
        address: info.addr.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::{CodecError, clean_text, parse, part_data, search_text, snippet, suggested_tags};

    const MULTIPART: &str = "From: Alice Example <alice@example.com>\r\n\
To: Bob <bob+invoices@example.com>, carol@example.com\r\n\
Cc: Team: dave@example.com, erin@example.com;\r\n\
Subject: Quarterly (report); draft\r\n\
Message-ID: <abc123@example.com>\r\n\
Date: Tue, 01 Jul 2025 10:00:00 +0000\r\n\
X-Tags: finance, Q3\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"outer\"\r\n\
\r\n\
--outer\r\n\
Content-Type: multipart/alternative; boundary=\"inner\"\r\n\
\r\n\
--inner\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Plain body text\r\n\
--inner\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<html><body><p>Hello World &amp; friends</p></body></html>\r\n\
--inner--\r\n\
--outer\r\n\
Content-Type: image/png\r\n\
Content-Disposition: inline; filename=\"logo.png\"\r\n\
Content-ID: <logo@example.com>\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
iVBORw0KGgo=\r\n\
--outer\r\n\
Content-Type: application/pdf; name=\"Report-Q3.pdf\"\r\n\
Content-Disposition: attachment; filename=\"Report-Q3.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0xLjQK\r\n\
--outer--\r\n";

    #[test]
    fn parse_extracts_headers_bodies_and_parts() {
        let env = parse(MULTIPART.as_bytes()).unwrap();
        let from = env.from.clone().unwrap();
        assert_eq!(from.address, "alice@example.com");
        assert_eq!(from.name.as_deref(), Some("Alice Example"));
        assert_eq!(env.to.len(), 2);
        assert_eq!(env.cc.len(), 2, "group members are flattened");
        assert_eq!(env.message_id, "abc123@example.com");
        assert_eq!(env.date, Some(1_751_364_000_000));
        assert_eq!(env.x_tags, vec!["finance".to_string(), "Q3".to_string()]);
        assert!(env.text.contains("Plain body text"));
        assert!(env.html.contains("Hello World"));
        assert_eq!(env.inlines.len(), 1);
        assert_eq!(env.inlines[0].content_id.as_deref(), Some("logo@example.com"));
        assert_eq!(env.attachments.len(), 1);
        assert_eq!(env.attachments[0].filename, "Report-Q3.pdf");
        assert_eq!(env.attachments[0].content_type, "application/pdf");
    }

    #[test]
    fn missing_headers_are_empty_not_errors() {
        let env = parse(b"X-Other: 1\r\n\r\nbody\r\n").unwrap();
        assert!(env.from.is_none());
        assert!(env.to.is_empty());
        assert_eq!(env.subject, "");
        assert_eq!(env.message_id, "");
        assert!(env.date.is_none());
        assert_eq!(env.text.trim(), "body");
    }

    #[test]
    fn empty_input_is_a_parse_error() {
        assert!(matches!(parse(b""), Err(CodecError::Empty)));
        assert!(matches!(parse(b"  \r\n"), Err(CodecError::Empty)));
        assert!(parse(b"\r\n\r\nbody without headers").is_err());
    }

    #[test]
    fn search_text_prefers_html_and_strips_punctuation() {
        let env = parse(MULTIPART.as_bytes()).unwrap();
        let text = search_text(&env);
        assert!(text.starts_with("alice example alice@example.com quarterly report draft"));
        assert!(text.contains("hello world & friends"));
        assert!(!text.contains("plain body text"));
        assert!(text.ends_with("report-q3.pdf"));
        for ch in ['<', '>', '"', ',', ';', ':', '(', ')', '\n', '\t'] {
            assert!(!text.contains(ch), "found {:?} in {}", ch, text);
        }
        assert!(!text.contains("  "));
        assert_eq!(text, text.to_lowercase());
    }

    #[test]
    fn search_text_is_deterministic() {
        let a = search_text(&parse(MULTIPART.as_bytes()).unwrap());
        let b = search_text(&parse(MULTIPART.as_bytes()).unwrap());
        assert_eq!(a, b);
    }

    #[test]
    fn clean_text_collapses_whitespace_and_lowercases() {
        assert_eq!(clean_text("  Foo:\tBar\r\n(\"Baz\")  "), "foo bar baz");
        assert_eq!(clean_text("\u{feff}Hi"), "hi");
    }

    #[test]
    fn snippet_is_collapsed_and_truncated() {
        let body = "word ".repeat(100);
        let raw = format!("Subject: s\r\n\r\n{}", body);
        let env = parse(raw.as_bytes()).unwrap();
        let snip = snippet(&env);
        assert!(snip.ends_with("..."));
        assert!(snip.chars().count() <= super::SNIPPET_CHARS + 3);
        assert!(!snip.contains("  "));

        let short = parse(b"Subject: s\r\n\r\nshort\r\n  body").unwrap();
        assert_eq!(snippet(&short), "short body");
    }

    #[test]
    fn suggested_tags_come_from_x_tags_and_plus_addresses() {
        let env = parse(MULTIPART.as_bytes()).unwrap();
        let all = suggested_tags(&env, true, true);
        assert_eq!(all, vec!["finance", "Q3", "invoices"]);
        assert_eq!(suggested_tags(&env, false, true), vec!["invoices"]);
        assert!(suggested_tags(&env, false, false).is_empty());
    }

    #[test]
    fn part_data_returns_decoded_attachment() {
        let env = parse(MULTIPART.as_bytes()).unwrap();
        let id = env.attachments[0].part_id.clone();
        let data = part_data(MULTIPART.as_bytes(), &id).unwrap().unwrap();
        assert_eq!(data.filename, "Report-Q3.pdf");
        assert!(data.data.starts_with(b"%PDF"));
        assert!(part_data(MULTIPART.as_bytes(), "9.9").unwrap().is_none());
    }
}
