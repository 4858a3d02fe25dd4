//! Query grammar: whitespace-separated terms, ANDed together.
//!
//! A term is `prefix:value` or a bare word. Double quotes group a run that
//! contains spaces and may appear anywhere inside a term
//! (`subject:"weekly report"`); an unterminated quote runs to the end of the
//! input. A leading `-` or `!` negates the term. Recognised prefixes are
//! case-insensitive:
//!
//! | prefix | match |
//! |---|---|
//! | `from:` `to:` `cc:` `bcc:` `reply-to:` | substring of the address field |
//! | `addressed:` | substring of any address field; negated, of none |
//! | `subject:` `message-id:` | substring |
//! | `tag:` | substring of any tag |
//! | `is:read` `is:unread` `is:tagged` | flags |
//! | `has:attachment` `has:inline` | part counts |
//! | `after:` `before:` | inclusive `created` bounds, naive times in the caller's timezone |
//! | `larger:` `smaller:` | raw size, with `k`/`kb`/`m`/`mb` suffixes |
//!
//! Anything else is matched against the derived search text.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone};
use mailbin_content::clean_text;
use tracing::warn;

use crate::db::SqlValue;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub negate: bool,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    From,
    To,
    Cc,
    Bcc,
    ReplyTo,
    /// Any of from, to, cc, bcc and reply-to.
    Addressed,
    Subject,
    MessageId,
    Tag,
}

impl Field {
    fn from_prefix(prefix: &str) -> Option<Self> {
        Some(match prefix {
            "from" => Field::From,
            "to" => Field::To,
            "cc" => Field::Cc,
            "bcc" => Field::Bcc,
            "reply-to" => Field::ReplyTo,
            "addressed" => Field::Addressed,
            "subject" => Field::Subject,
            "message-id" => Field::MessageId,
            "tag" => Field::Tag,
            _ => return None,
        })
    }

    fn columns(self) -> &'static [&'static str] {
        const FROM: &str = "COALESCE(m.from_addr, '')";
        match self {
            Field::From => &[FROM],
            Field::To => &["m.to_addr"],
            Field::Cc => &["m.cc_addr"],
            Field::Bcc => &["m.bcc_addr"],
            Field::ReplyTo => &["m.reply_to_addr"],
            Field::Addressed => &[
                "m.to_addr",
                FROM,
                "m.cc_addr",
                "m.bcc_addr",
                "m.reply_to_addr",
            ],
            Field::Subject => &["m.subject"],
            Field::MessageId => &["COALESCE(m.message_id, '')"],
            Field::Tag => &["json_each.value"],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsFlag {
    Read,
    Unread,
    Tagged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HasFlag {
    Attachment,
    Inline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateBound {
    After,
    Before,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeBound {
    Larger,
    Smaller,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Clause {
    FieldMatch {
        field: Field,
        negate: bool,
        value: String,
    },
    Is {
        flag: IsFlag,
        negate: bool,
    },
    Has {
        flag: HasFlag,
        negate: bool,
    },
    Date {
        bound: DateBound,
        negate: bool,
        at_ms: i64,
    },
    Size {
        bound: SizeBound,
        negate: bool,
        bytes: i64,
    },
    FullText {
        negate: bool,
        value: String,
    },
}

/// One SQL boolean expression over the `mailbox` table aliased as `m`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    pub sql: String,
    pub values: Vec<SqlValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledQuery {
    pub clauses: Vec<Clause>,
    pub predicates: Vec<Predicate>,
}

impl CompiledQuery {
    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// `" AND (p1) AND (p2)"`, ready to append to a `WHERE` clause.
    pub fn where_sql(&self) -> String {
        let mut out = String::new();
        for predicate in &self.predicates {
            out.push_str(" AND (");
            out.push_str(&predicate.sql);
            out.push(')');
        }
        out
    }

    pub fn values(&self) -> Vec<SqlValue> {
        self.predicates
            .iter()
            .flat_map(|p| p.values.iter().cloned())
            .collect()
    }

    pub(crate) fn push(&mut self, predicate: Predicate) {
        self.predicates.push(predicate);
    }
}

pub fn compile(query: &str, timezone: Option<&str>) -> CompiledQuery {
    let clauses = parse(query, timezone);
    let predicates = clauses.iter().map(predicate_for).collect();
    CompiledQuery {
        clauses,
        predicates,
    }
}

pub fn tokenize(query: &str) -> Vec<Token> {
    let mut out = Vec::new();
    let mut buf = String::new();
    let mut in_quote = false;
    for ch in query.chars() {
        if ch == '"' {
            in_quote = !in_quote;
            continue;
        }
        if ch.is_whitespace() && !in_quote {
            flush_token(&mut buf, &mut out);
            continue;
        }
        buf.push(ch);
    }
    flush_token(&mut buf, &mut out);
    out
}

fn flush_token(buf: &mut String, out: &mut Vec<Token>) {
    let text = std::mem::take(buf);
    if text.trim().is_empty() {
        return;
    }
    let mut chars = text.chars();
    let negate = matches!(chars.next(), Some('-' | '!')) && text.chars().count() > 1;
    let text = if negate {
        chars.as_str().to_string()
    } else {
        text
    };
    out.push(Token { negate, text });
}

pub fn parse(query: &str, timezone: Option<&str>) -> Vec<Clause> {
    let offset = timezone.and_then(|tz| {
        let parsed = parse_offset(tz);
        if parsed.is_none() {
            warn!("[search] ignoring unknown timezone {:?}", tz);
        }
        parsed
    });

    let mut out = Vec::new();
    for token in tokenize(query) {
        if let Some(clause) = parse_token(&token, offset) {
            out.push(clause);
        }
    }
    out
}

fn parse_token(token: &Token, offset: Option<FixedOffset>) -> Option<Clause> {
    let negate = token.negate;
    let full_text = || {
        let value = clean_text(&token.text);
        (!value.is_empty()).then_some(Clause::FullText { negate, value })
    };

    let Some((prefix, value)) = token.text.split_once(':') else {
        return full_text();
    };
    let prefix = prefix.to_ascii_lowercase();
    let value = value.trim();

    if let Some(field) = Field::from_prefix(&prefix) {
        if value.is_empty() {
            return None;
        }
        return Some(Clause::FieldMatch {
            field,
            negate,
            value: value.to_string(),
        });
    }

    match prefix.as_str() {
        "is" => {
            let flag = match value.to_ascii_lowercase().as_str() {
                "read" => IsFlag::Read,
                "unread" => IsFlag::Unread,
                "tagged" => IsFlag::Tagged,
                _ => return full_text(),
            };
            Some(Clause::Is { flag, negate })
        }
        "has" => {
            let flag = match value.to_ascii_lowercase().as_str() {
                "attachment" | "attachments" => HasFlag::Attachment,
                "inline" | "inlines" => HasFlag::Inline,
                _ => return full_text(),
            };
            Some(Clause::Has { flag, negate })
        }
        "after" | "before" => {
            let bound = if prefix == "after" {
                DateBound::After
            } else {
                DateBound::Before
            };
            match parse_date(value, offset) {
                Some(at_ms) => Some(Clause::Date {
                    bound,
                    negate,
                    at_ms,
                }),
                None => {
                    warn!("[search] ignoring unparsable date {:?}", value);
                    None
                }
            }
        }
        "larger" | "smaller" => {
            let bound = if prefix == "larger" {
                SizeBound::Larger
            } else {
                SizeBound::Smaller
            };
            match size_to_bytes(value) {
                Some(bytes) => Some(Clause::Size {
                    bound,
                    negate,
                    bytes,
                }),
                None => {
                    warn!("[search] ignoring unparsable size {:?}", value);
                    None
                }
            }
        }
        _ => full_text(),
    }
}

fn predicate_for(clause: &Clause) -> Predicate {
    match clause {
        Clause::FieldMatch {
            field: Field::Tag,
            negate,
            value,
        } => Predicate {
            sql: format!(
                r"{}EXISTS (SELECT 1 FROM json_each({}) WHERE json_each.value LIKE ? ESCAPE '\')",
                if *negate { "NOT " } else { "" },
                crate::tags::TAGS_JSON
            ),
            values: vec![SqlValue::Text(like_pattern(value))],
        },
        Clause::FieldMatch {
            field,
            negate,
            value,
        } => any_column_like(field.columns(), *negate, value),
        Clause::FullText { negate, value } => {
            like_predicate("COALESCE(m.search_text, '')", *negate, value)
        }
        Clause::Is { flag, negate } => {
            let sql = match (flag, negate) {
                (IsFlag::Read, false) | (IsFlag::Unread, true) => "m.is_read = 1",
                (IsFlag::Read, true) | (IsFlag::Unread, false) => "m.is_read = 0",
                (IsFlag::Tagged, false) => "m.tags NOT IN ('', '[]')",
                (IsFlag::Tagged, true) => "m.tags IN ('', '[]')",
            };
            Predicate {
                sql: sql.to_string(),
                values: Vec::new(),
            }
        }
        Clause::Has { flag, negate } => {
            let column = match flag {
                HasFlag::Attachment => "m.attachment_count",
                HasFlag::Inline => "m.inline_count",
            };
            let op = if *negate { "= 0" } else { "> 0" };
            Predicate {
                sql: format!("{} {}", column, op),
                values: Vec::new(),
            }
        }
        Clause::Date {
            bound,
            negate,
            at_ms,
        } => {
            // Both bounds include the instant itself, negated or not.
            let op = match (bound, negate) {
                (DateBound::After, false) | (DateBound::Before, true) => ">=",
                (DateBound::After, true) | (DateBound::Before, false) => "<=",
            };
            Predicate {
                sql: format!("m.created {} ?", op),
                values: vec![SqlValue::Int(*at_ms)],
            }
        }
        Clause::Size {
            bound,
            negate,
            bytes,
        } => {
            let op = match (bound, negate) {
                (SizeBound::Larger, false) => ">",
                (SizeBound::Larger, true) => "<",
                (SizeBound::Smaller, false) => "<",
                (SizeBound::Smaller, true) => ">",
            };
            Predicate {
                sql: format!("m.size {} ?", op),
                values: vec![SqlValue::Int(*bytes)],
            }
        }
    }
}

fn like_predicate(column: &str, negate: bool, value: &str) -> Predicate {
    Predicate {
        sql: format!(
            r"{} {}LIKE ? ESCAPE '\'",
            column,
            if negate { "NOT " } else { "" }
        ),
        values: vec![SqlValue::Text(like_pattern(value))],
    }
}

/// Matches when any column contains `value`; negated, when none does.
fn any_column_like(columns: &[&str], negate: bool, value: &str) -> Predicate {
    if let [column] = columns {
        return like_predicate(column, negate, value);
    }
    let parts: Vec<Predicate> = columns
        .iter()
        .map(|column| like_predicate(column, negate, value))
        .collect();
    let joiner = if negate { " AND " } else { " OR " };
    Predicate {
        sql: parts
            .iter()
            .map(|p| p.sql.as_str())
            .collect::<Vec<_>>()
            .join(joiner),
        values: parts.into_iter().flat_map(|p| p.values).collect(),
    }
}

/// `%value%` with LIKE metacharacters in `value` escaped by `\`.
pub fn like_pattern(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('%');
    for ch in value.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('%');
    out
}

/// `UTC`, `Z`, `GMT`, or a fixed offset such as `+10:00`, `-0500`, `+02`.
pub fn parse_offset(tz: &str) -> Option<FixedOffset> {
    let tz = tz.trim();
    if tz.eq_ignore_ascii_case("utc") || tz.eq_ignore_ascii_case("gmt") || tz == "Z" {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match tz.chars().next()? {
        '+' => (1, &tz[1..]),
        '-' => (-1, &tz[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (hours, minutes) = match digits.len() {
        2 => (digits.parse::<i32>().ok()?, 0),
        4 => (digits[..2].parse::<i32>().ok()?, digits[2..].parse::<i32>().ok()?),
        _ => return None,
    };
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Milliseconds since the epoch; naive values are read in `offset` (UTC when
/// absent).
pub fn parse_date(value: &str, offset: Option<FixedOffset>) -> Option<i64> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt.timestamp_millis());
    }
    let naive = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })?;
    let offset = offset.or_else(|| FixedOffset::east_opt(0))?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.timestamp_millis())
}

pub fn size_to_bytes(value: &str) -> Option<i64> {
    let lower = value.trim().to_ascii_lowercase();
    let (number, multiplier) = if let Some(n) = lower.strip_suffix("mb") {
        (n, 1024.0 * 1024.0)
    } else if let Some(n) = lower.strip_suffix('m') {
        (n, 1024.0 * 1024.0)
    } else if let Some(n) = lower.strip_suffix("kb") {
        (n, 1024.0)
    } else if let Some(n) = lower.strip_suffix('k') {
        (n, 1024.0)
    } else if let Some(n) = lower.strip_suffix('b') {
        (n, 1.0)
    } else {
        (lower.as_str(), 1.0)
    };
    let number: f64 = number.trim().parse().ok()?;
    if !number.is_finite() || number < 0.0 {
        return None;
    }
    Some((number * multiplier).round() as i64)
}
