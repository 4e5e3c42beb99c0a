//! IMAP response reading and message parsing.
//!
//! Everything here is free of I/O except through a caller-supplied
//! `BufRead`, so the session code stays thin and the parsing is testable.

use std::io::BufRead;
use std::sync::LazyLock;

use mail_parser::MessageParser;
use regex::Regex;

use crate::error::MailError;
use crate::mail::{Envelope, FullMessage, Uid};

/// Largest literal payload accepted from the server.
pub const MAX_LITERAL_LEN: usize = 64 * 1024 * 1024;

static LITERAL_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(\d+)\+?\}\r?\n$").unwrap());
static LIST_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)^\* LIST \(([^)]*)\) (?:NIL|"(?:[^"\\]|\\.)*") ?(.*)$"#).unwrap()
});
static FETCH_UID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bUID (\d+)").unwrap());
static FETCH_FLAGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bFLAGS \(([^)]*)\)").unwrap());
static EXISTS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^\* (\d+) EXISTS").unwrap());

/// One untagged server response. Literal payloads are lifted out of
/// `text` into `literals`, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Untagged {
    pub text: String,
    pub literals: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    No,
    Bad,
}

/// All responses to a single tagged command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub untagged: Vec<Untagged>,
    pub status: Status,
    /// Text after the status word on the tagged line.
    pub detail: String,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// Read one logical response line, following any `{N}` literals.
pub fn read_logical_line<R: BufRead>(reader: &mut R) -> Result<Untagged, MailError> {
    let mut out = Untagged::default();
    loop {
        let mut buf = Vec::new();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            return Err(MailError::Protocol("IMAP connection closed".into()));
        }
        let chunk = String::from_utf8_lossy(&buf).into_owned();

        let Some(caps) = LITERAL_MARKER.captures(&chunk) else {
            out.text.push_str(chunk.trim_end_matches(['\r', '\n']));
            return Ok(out);
        };

        let len: usize = caps[1]
            .parse()
            .map_err(|_| MailError::Protocol(format!("bad literal length in {chunk:?}")))?;
        if len > MAX_LITERAL_LEN {
            return Err(MailError::Protocol(format!(
                "literal of {len} bytes exceeds {MAX_LITERAL_LEN} byte limit"
            )));
        }
        let marker_start = caps.get(0).map_or(chunk.len(), |m| m.start());
        out.text.push_str(&chunk[..marker_start]);

        let mut literal = vec![0u8; len];
        reader.read_exact(&mut literal)?;
        out.literals.push(literal);
    }
}

/// Read responses until the tagged completion for `tag`.
pub fn read_response<R: BufRead>(reader: &mut R, tag: &str) -> Result<Response, MailError> {
    let prefix = format!("{tag} ");
    let mut untagged = Vec::new();
    loop {
        let line = read_logical_line(reader)?;
        let Some(rest) = line.text.strip_prefix(&prefix) else {
            untagged.push(line);
            continue;
        };

        let (word, detail) = rest.split_once(' ').unwrap_or((rest, ""));
        let status = match word.to_ascii_uppercase().as_str() {
            "OK" => Status::Ok,
            "NO" => Status::No,
            "BAD" => Status::Bad,
            other => {
                return Err(MailError::Protocol(format!(
                    "unexpected completion {other:?} for {tag}"
                )));
            }
        };
        return Ok(Response {
            untagged,
            status,
            detail: detail.to_string(),
        });
    }
}

/// Quote a string for use as an IMAP quoted argument.
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn unquote(s: &str) -> String {
    let inner = s
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s);
    let mut out = String::with_capacity(inner.len());
    let mut escaped = false;
    for c in inner.chars() {
        if escaped {
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else {
            out.push(c);
        }
    }
    out
}

/// Folder name from a `* LIST` response. `None` for other responses and
/// for folders that cannot be selected.
pub fn parse_list(line: &Untagged) -> Option<String> {
    let caps = LIST_LINE.captures(&line.text)?;
    let attrs = caps[1].to_ascii_lowercase();
    if attrs
        .split_whitespace()
        .any(|a| a == "\\noselect" || a == "\\nonexistent")
    {
        return None;
    }

    let raw = caps[2].trim();
    if raw.is_empty() {
        let literal = line.literals.first()?;
        return Some(String::from_utf8_lossy(literal).into_owned());
    }
    Some(unquote(raw))
}

/// Message count from a `* n EXISTS` response.
pub fn parse_exists(line: &Untagged) -> Option<u32> {
    EXISTS.captures(&line.text)?[1].parse().ok()
}

/// UID, flags and first literal payload of a `* n FETCH` response.
pub fn parse_fetch(line: &Untagged) -> Option<(Uid, Vec<String>, Option<&[u8]>)> {
    if !line.text.to_ascii_uppercase().contains(" FETCH ") {
        return None;
    }
    let uid = FETCH_UID.captures(&line.text)?[1].parse().ok()?;
    let flags = FETCH_FLAGS
        .captures(&line.text)
        .map(|c| c[1].split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();
    Some((uid, flags, line.literals.first().map(Vec::as_slice)))
}

/// Compress UIDs into an IMAP sequence set, e.g. `1:3,7,9:10`.
pub fn uid_set(uids: &[Uid]) -> String {
    let mut sorted = uids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts = Vec::new();
    let mut iter = sorted.into_iter();
    let Some(mut start) = iter.next() else {
        return String::new();
    };
    let mut end = start;
    for uid in iter {
        if uid == end + 1 {
            end = uid;
            continue;
        }
        parts.push(range(start, end));
        start = uid;
        end = uid;
    }
    parts.push(range(start, end));
    parts.join(",")
}

fn range(start: Uid, end: Uid) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{start}:{end}")
    }
}

/// Addresses from a parsed address header, flattening groups.
pub fn extract_addresses(addr: Option<&mail_parser::Address>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    match addr {
        mail_parser::Address::List(addrs) => addrs
            .iter()
            .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            .collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| {
                g.addresses
                    .iter()
                    .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            })
            .collect(),
    }
}

/// Build an envelope from the FROM/SUBJECT/MESSAGE-ID header block.
pub fn envelope_from_headers(uid: Uid, flags: Vec<String>, headers: &[u8]) -> Envelope {
    let parsed = MessageParser::default().parse(headers);
    let (from, subject, message_id) = match &parsed {
        Some(msg) => (
            extract_addresses(msg.from()).into_iter().next().unwrap_or_default(),
            msg.subject().unwrap_or_default().to_string(),
            msg.message_id().unwrap_or_default().to_string(),
        ),
        None => Default::default(),
    };
    Envelope {
        uid,
        message_id,
        from: from.to_lowercase(),
        subject,
        flags,
    }
}

/// Parse a complete RFC 5322 message. `None` if it cannot be parsed.
pub fn full_message(uid: Uid, raw: &[u8]) -> Option<FullMessage> {
    let parsed = MessageParser::default().parse(raw)?;

    let date = parsed
        .date()
        .and_then(|d| {
            chrono::NaiveDate::from_ymd_opt(i32::from(d.year), u32::from(d.month), u32::from(d.day))
                .and_then(|date| {
                    date.and_hms_opt(u32::from(d.hour), u32::from(d.minute), u32::from(d.second))
                })
        })
        .map(|n| n.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default();

    Some(FullMessage {
        uid,
        message_id: parsed.message_id().unwrap_or_default().to_string(),
        from: extract_addresses(parsed.from())
            .into_iter()
            .next()
            .unwrap_or_default(),
        to: extract_addresses(parsed.to()).join(", "),
        subject: parsed.subject().unwrap_or_default().to_string(),
        date,
        headers: header_block(raw),
        body_text: parsed
            .body_text(0)
            .map(|t| t.into_owned())
            .unwrap_or_default(),
        body_html: parsed
            .body_html(0)
            .map(|h| h.into_owned())
            .unwrap_or_default(),
        has_attachments: parsed.attachments().next().is_some(),
    })
}

/// Raw header section: everything before the first blank line.
fn header_block(raw: &[u8]) -> String {
    let end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .or_else(|| raw.windows(2).position(|w| w == b"\n\n"))
        .unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn untagged(text: &str) -> Untagged {
        Untagged {
            text: text.to_string(),
            literals: Vec::new(),
        }
    }

    #[test]
    fn reads_until_tagged_completion() {
        let mut input = Cursor::new(b"* 3 EXISTS\r\n* 0 RECENT\r\nA1 OK [READ-WRITE] done\r\n".to_vec());
        let resp = read_response(&mut input, "A1").unwrap();
        assert!(resp.is_ok());
        assert_eq!(resp.untagged.len(), 2);
        assert_eq!(resp.detail, "[READ-WRITE] done");
        assert_eq!(parse_exists(&resp.untagged[0]), Some(3));
    }

    #[test]
    fn tagged_no_is_reported() {
        let mut input = Cursor::new(b"A7 NO [NONEXISTENT] Mailbox doesn't exist\r\n".to_vec());
        let resp = read_response(&mut input, "A7").unwrap();
        assert_eq!(resp.status, Status::No);
        assert!(resp.detail.contains("NONEXISTENT"));
    }

    #[test]
    fn oversized_literal_is_rejected_before_reading() {
        let mut input = Cursor::new(b"* 1 FETCH (BODY[] {999999999999}\r\nshort".to_vec());
        match read_logical_line(&mut input) {
            Err(MailError::Protocol(reason)) => assert!(reason.contains("exceeds")),
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn closed_connection_is_error() {
        let mut input = Cursor::new(b"* 1 EXISTS\r\n".to_vec());
        assert!(matches!(
            read_response(&mut input, "A1"),
            Err(MailError::Protocol(_))
        ));
    }

    #[test]
    fn literal_payload_is_lifted() {
        let body = b"From: a@b.com\r\nSubject: Hi\r\n\r\n";
        let mut raw = format!("* 1 FETCH (UID 42 FLAGS (\\Seen) BODY[HEADER] {{{}}}\r\n", body.len())
            .into_bytes();
        raw.extend_from_slice(body);
        raw.extend_from_slice(b")\r\nA2 OK FETCH completed\r\n");

        let resp = read_response(&mut Cursor::new(raw), "A2").unwrap();
        assert_eq!(resp.untagged.len(), 1);
        let line = &resp.untagged[0];
        assert_eq!(line.literals, vec![body.to_vec()]);

        let (uid, flags, payload) = parse_fetch(line).unwrap();
        assert_eq!(uid, 42);
        assert_eq!(flags, vec!["\\Seen"]);
        assert_eq!(payload, Some(&body[..]));
    }

    #[test]
    fn fetch_with_uid_after_literal() {
        let body = b"x";
        let mut raw = b"* 2 FETCH (BODY[] {1}\r\n".to_vec();
        raw.extend_from_slice(body);
        raw.extend_from_slice(b" UID 9)\r\nA3 OK\r\n");
        let resp = read_response(&mut Cursor::new(raw), "A3").unwrap();
        let (uid, flags, payload) = parse_fetch(&resp.untagged[0]).unwrap();
        assert_eq!(uid, 9);
        assert!(flags.is_empty());
        assert_eq!(payload, Some(&b"x"[..]));
    }

    #[test]
    fn fetch_without_uid_is_ignored() {
        assert!(parse_fetch(&untagged("* 4 FETCH (FLAGS (\\Deleted))")).is_none());
        assert!(parse_fetch(&untagged("* 4 EXPUNGE")).is_none());
    }

    #[test]
    fn list_quoted_names() {
        assert_eq!(
            parse_list(&untagged(r#"* LIST (\HasNoChildren) "/" "INBOX""#)),
            Some("INBOX".into())
        );
        assert_eq!(
            parse_list(&untagged(r#"* LIST (\HasNoChildren) "/" "USPIS/Transactional Only""#)),
            Some("USPIS/Transactional Only".into())
        );
        assert_eq!(
            parse_list(&untagged(r#"* LIST () "/" "Say \"hi\"""#)),
            Some("Say \"hi\"".into())
        );
    }

    #[test]
    fn list_atom_and_nil_delimiter() {
        assert_eq!(parse_list(&untagged("* LIST () NIL Archive")), Some("Archive".into()));
    }

    #[test]
    fn list_literal_name() {
        let line = Untagged {
            text: r#"* LIST (\HasNoChildren) "/" "#.into(),
            literals: vec![b"Receipts 2024".to_vec()],
        };
        assert_eq!(parse_list(&line), Some("Receipts 2024".into()));
    }

    #[test]
    fn list_skips_noselect() {
        assert_eq!(
            parse_list(&untagged(r#"* LIST (\Noselect \HasChildren) "/" "[Gmail]""#)),
            None
        );
        assert_eq!(parse_list(&untagged("* 3 EXISTS")), None);
    }

    #[test]
    fn uid_sets_are_compressed() {
        assert_eq!(uid_set(&[]), "");
        assert_eq!(uid_set(&[5]), "5");
        assert_eq!(uid_set(&[3, 1, 2, 7, 9, 10, 10]), "1:3,7,9:10");
    }

    #[test]
    fn quote_escapes() {
        assert_eq!(quote("USPIS/Block"), "\"USPIS/Block\"");
        assert_eq!(quote(r#"a"b\c"#), r#""a\"b\\c""#);
    }

    #[test]
    fn envelope_lower_cases_sender() {
        let headers = b"From: Deals <Deals@Shop.COM>\r\nSubject: Flash Sale\r\nMessage-ID: <m1@shop.com>\r\n\r\n";
        let env = envelope_from_headers(11, vec!["\\Seen".into()], headers);
        assert_eq!(env.uid, 11);
        assert_eq!(env.from, "deals@shop.com");
        assert_eq!(env.subject, "Flash Sale");
        assert_eq!(env.message_id, "m1@shop.com");
    }

    #[test]
    fn envelope_tolerates_missing_headers() {
        let env = envelope_from_headers(1, Vec::new(), b"\r\n");
        assert_eq!(env.from, "");
        assert_eq!(env.subject, "");
    }

    #[test]
    fn full_message_extracts_parts() {
        let raw = b"From: Shop <orders@shop.com>\r\n\
To: me@icloud.com, other@icloud.com\r\n\
Subject: Your receipt\r\n\
Message-ID: <r1@shop.com>\r\n\
Date: Tue, 02 Jan 2024 03:04:05 +0000\r\n\
Content-Type: text/plain\r\n\
\r\n\
Thanks for your order.\r\n";
        let msg = full_message(5, raw).unwrap();
        assert_eq!(msg.from, "orders@shop.com");
        assert_eq!(msg.to, "me@icloud.com, other@icloud.com");
        assert_eq!(msg.subject, "Your receipt");
        assert_eq!(msg.date, "2024-01-02 03:04:05");
        assert!(msg.headers.starts_with("From: Shop"));
        assert!(!msg.headers.contains("Thanks"));
        assert!(msg.body_text.contains("Thanks for your order."));
        assert!(!msg.has_attachments);
    }
}
