//! Turns a raw RFC 5322 blob into a `NormalizedRecord`.
//!
//! Parsing is delegated to `mail-parser`. Field-level problems degrade to
//! defaults with a warning; only a blob that is not a message at all is
//! rejected.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use mail_parser::{Address, Message, MessageParser, MessagePart, MimeHeaders, PartType};
use tracing::{debug, warn};

use crate::error::NormalizeError;
use crate::pipeline::types::{split_header_block, AttachmentMeta, NormalizedRecord, ParseRequest};

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Normalize a boundary request, using `received_at` when the message
/// carries no usable `Date` header.
pub fn normalize(
    request: &ParseRequest,
    received_at: DateTime<Utc>,
) -> Result<NormalizedRecord, NormalizeError> {
    let blob = request.raw_email.trim_start_matches(['\r', '\n']);
    if blob.trim().is_empty() {
        return Err(NormalizeError::Malformed("empty message".into()));
    }

    let (header_block, _) = split_header_block(blob);
    if !starts_with_header_line(header_block) {
        return Err(NormalizeError::Malformed("no header block".into()));
    }

    let message = MessageParser::default()
        .parse(blob.as_bytes())
        .ok_or_else(|| NormalizeError::Malformed("unparsable MIME structure".into()))?;

    let subject = match message.subject() {
        Some(subject) => subject.to_string(),
        None => raw_header_value(header_block, "Subject").unwrap_or_default(),
    };

    let from_addr = format_addresses(message.from())
        .or_else(|| raw_header_value(header_block, "From"))
        .unwrap_or_default();
    let to_addr = format_addresses(message.to())
        .or_else(|| raw_header_value(header_block, "To"))
        .unwrap_or_default();
    let cc_addr = format_addresses(message.cc());

    let sent_at = resolve_date(&message, header_block).unwrap_or_else(|| {
        warn!(
            external_id = request.external_id.as_deref().unwrap_or("-"),
            "No usable Date header, using receipt time"
        );
        received_at
    });

    let raw_body = extract_body(&message);
    let attachments = extract_attachments(&message);

    debug!(
        external_id = request.external_id.as_deref().unwrap_or("-"),
        subject = %subject,
        attachments = attachments.len(),
        "Normalized message"
    );

    Ok(NormalizedRecord {
        external_id: request.external_id.clone(),
        provider: request.provider.clone(),
        from_addr,
        to_addr,
        cc_addr,
        subject,
        sent_at,
        raw_headers: header_block.to_string(),
        raw_body,
        mailbox: request.mailbox.clone(),
        attachments,
    })
}

/// Normalize with the current time as receipt time.
pub fn normalize_now(request: &ParseRequest) -> Result<NormalizedRecord, NormalizeError> {
    normalize(request, Utc::now())
}

/// True when the first line looks like `Name: value`.
fn starts_with_header_line(header_block: &str) -> bool {
    let Some(first) = header_block.lines().next() else {
        return false;
    };
    match first.split_once(':') {
        Some((name, _)) => {
            !name.is_empty() && name.bytes().all(|b| b.is_ascii_graphic() && b != b':')
        }
        None => false,
    }
}

/// Unfolded raw value of the first header named `name`.
fn raw_header_value(header_block: &str, name: &str) -> Option<String> {
    let mut value: Option<String> = None;
    for line in header_block.lines() {
        if let Some(current) = value.as_mut() {
            if line.starts_with([' ', '\t']) {
                current.push(' ');
                current.push_str(line.trim());
                continue;
            }
            break;
        }
        if let Some((header, rest)) = line.split_once(':')
            && header.trim().eq_ignore_ascii_case(name)
        {
            value = Some(rest.trim().to_string());
        }
    }
    value.filter(|v| !v.is_empty())
}

/// Render an address header as `Name <addr>, addr2`.
fn format_addresses(address: Option<&Address>) -> Option<String> {
    let rendered: Vec<String> = match address? {
        Address::List(addrs) => addrs.iter().filter_map(format_addr).collect(),
        Address::Group(groups) => groups
            .iter()
            .flat_map(|g| g.addresses.iter().filter_map(format_addr))
            .collect(),
    };
    if rendered.is_empty() {
        None
    } else {
        Some(rendered.join(", "))
    }
}

fn format_addr(addr: &mail_parser::Addr) -> Option<String> {
    match (addr.name(), addr.address()) {
        (Some(name), Some(address)) => Some(format!("{name} <{address}>")),
        (None, Some(address)) => Some(address.to_string()),
        (Some(name), None) => Some(name.to_string()),
        (None, None) => None,
    }
}

/// Strict RFC 2822 first, then mail-parser's lenient date.
fn resolve_date(message: &Message, header_block: &str) -> Option<DateTime<Utc>> {
    if let Some(raw) = raw_header_value(header_block, "Date")
        && let Ok(parsed) = DateTime::parse_from_rfc2822(&raw)
    {
        return Some(parsed.with_timezone(&Utc));
    }
    message.date().and_then(checked_date)
}

/// A lenient parse can carry out-of-range fields; keep only real instants.
fn checked_date(d: &mail_parser::DateTime) -> Option<DateTime<Utc>> {
    if d.tz_minute >= 60 {
        return None;
    }
    let naive = NaiveDate::from_ymd_opt(i32::from(d.year), u32::from(d.month), u32::from(d.day))?
        .and_hms_opt(u32::from(d.hour), u32::from(d.minute), u32::from(d.second))?;
    let offset_secs = i32::from(d.tz_hour) * 3600 + i32::from(d.tz_minute) * 60;
    let offset = FixedOffset::east_opt(if d.tz_before_gmt {
        -offset_secs
    } else {
        offset_secs
    })?;
    naive
        .and_local_timezone(offset)
        .single()
        .map(|local| local.with_timezone(&Utc))
}

/// First text/plain part for multipart messages, the root payload otherwise.
fn extract_body(message: &Message) -> String {
    let Some(root) = message.parts.first() else {
        return String::new();
    };

    if !matches!(root.body, PartType::Multipart(_)) {
        return part_text(root);
    }

    // `parts` is stored in depth-first order.
    message
        .parts
        .iter()
        .skip(1)
        .find(|part| is_plain_text(part) && !is_attachment(part))
        .map(part_text)
        .unwrap_or_default()
}

fn part_text(part: &MessagePart) -> String {
    match &part.body {
        PartType::Text(text) | PartType::Html(text) => text.to_string(),
        PartType::Binary(bytes) | PartType::InlineBinary(bytes) => {
            String::from_utf8_lossy(bytes).into_owned()
        }
        PartType::Message(_) | PartType::Multipart(_) => String::new(),
    }
}

fn is_plain_text(part: &MessagePart) -> bool {
    if !matches!(part.body, PartType::Text(_)) {
        return false;
    }
    match part.content_type() {
        Some(ct) => {
            ct.ctype().eq_ignore_ascii_case("text")
                && ct.subtype().is_none_or(|s| s.eq_ignore_ascii_case("plain"))
        }
        None => true,
    }
}

fn is_attachment(part: &MessagePart) -> bool {
    part.content_disposition()
        .is_some_and(|d| d.ctype().eq_ignore_ascii_case("attachment"))
}

/// Every part with an attachment disposition and a filename.
fn extract_attachments(message: &Message) -> Vec<AttachmentMeta> {
    message
        .parts
        .iter()
        .filter(|part| is_attachment(part))
        .filter_map(|part| {
            let filename = part.attachment_name()?.to_string();
            let mime_type = part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string())
                .to_ascii_lowercase();
            let size_bytes = part.offset_end.saturating_sub(part.offset_body) as u64;
            Some(AttachmentMeta {
                filename,
                mime_type,
                size_bytes,
            })
        })
        .collect()
}
