//! Core ticket model, coercion rules and classification for itlog.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

use bigdecimal::num_bigint::Sign;
use bigdecimal::{BigDecimal, RoundingMode, ToPrimitive};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;

pub mod query;
pub mod summary;
pub mod taxonomy;

pub use query::TicketQuery;
pub use summary::{summarize, CategoryShare, DashboardSummary, ReportingWindow};
pub use taxonomy::{CategoryGroup, StatusClass};

pub const CRATE_NAME: &str = "itlog-core";

pub const DEFAULT_CATEGORY: &str = "Uncategorized";
pub const DEFAULT_REPORTER_NAME: &str = "Unknown";
pub const DEFAULT_STATUS: &str = "closed";

/// Non-negative money amount with two-decimal semantics, stored as hundredths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Cost(i64);

impl Cost {
    pub const ZERO: Cost = Cost(0);

    pub fn from_cents(cents: i64) -> Self {
        Self(cents.max(0))
    }

    pub fn cents(self) -> i64 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / 100.0
    }

    /// Parses the leading decimal number of `text`, the way upstream cost fields
    /// are written. Exponent forms are honored; anything unparsable or negative
    /// becomes zero.
    pub fn parse_lenient(text: &str) -> Self {
        let Some(token) = leading_number(text) else {
            return Self::ZERO;
        };
        let Ok(amount) = BigDecimal::from_str(&token) else {
            return Self::ZERO;
        };
        if amount.sign() != Sign::Plus {
            return Self::ZERO;
        }
        // magnitude checks keep huge exponents from allocating giant integers
        let (digits, scale) = amount.as_bigint_and_exponent();
        let magnitude = digits.to_string().len() as i64 - scale;
        if magnitude < -2 {
            return Self::ZERO;
        }
        if magnitude > 17 {
            return Self(i64::MAX);
        }
        let (cents, _) = amount
            .with_scale_round(2, RoundingMode::HalfUp)
            .into_bigint_and_exponent();
        Self(cents.to_i64().unwrap_or(i64::MAX))
    }
}

/// Longest numeric prefix of `text`: optional sign, digits with thousands
/// commas, a fraction, then an exponent when digits follow it.
fn leading_number(text: &str) -> Option<String> {
    let mut chars = text.trim_start().chars().peekable();
    let mut token = String::new();
    match chars.peek() {
        Some('-') => {
            token.push('-');
            chars.next();
        }
        Some('+') => {
            chars.next();
        }
        _ => {}
    }

    let mut seen_digit = false;
    let mut seen_dot = false;
    while let Some(&ch) = chars.peek() {
        match ch {
            '0'..='9' => {
                seen_digit = true;
                token.push(ch);
            }
            ',' if seen_digit && !seen_dot => {}
            '.' if !seen_dot => {
                seen_dot = true;
                if !seen_digit {
                    token.push('0');
                }
                token.push('.');
            }
            _ => break,
        }
        chars.next();
    }
    if !seen_digit {
        return None;
    }
    if token.ends_with('.') {
        token.pop();
    }

    if matches!(chars.peek(), Some('e' | 'E')) {
        chars.next();
        let mut exponent = String::from("e");
        match chars.peek() {
            Some('-') => {
                exponent.push('-');
                chars.next();
            }
            Some('+') => {
                chars.next();
            }
            _ => {}
        }
        let exponent_digits = chars
            .take_while(char::is_ascii_digit)
            .collect::<String>();
        if !exponent_digits.is_empty() {
            token.push_str(&exponent);
            token.push_str(&exponent_digits);
        }
    }
    Some(token)
}

impl fmt::Display for Cost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

impl Add for Cost {
    type Output = Cost;

    fn add(self, rhs: Cost) -> Cost {
        Cost(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Cost {
    fn add_assign(&mut self, rhs: Cost) {
        *self = *self + rhs;
    }
}

impl Sum for Cost {
    fn sum<I: Iterator<Item = Cost>>(iter: I) -> Cost {
        iter.fold(Cost::ZERO, Add::add)
    }
}

impl<'a> Sum<&'a Cost> for Cost {
    fn sum<I: Iterator<Item = &'a Cost>>(iter: I) -> Cost {
        iter.copied().sum()
    }
}

impl Serialize for Cost {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

impl<'de> Deserialize<'de> for Cost {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = JsonValue::deserialize(deserializer)?;
        Ok(json_text(&value)
            .map(|text| Cost::parse_lenient(&text))
            .unwrap_or_default())
    }
}

/// Renders a scalar JSON value as text; objects, arrays and null have no text form.
pub fn json_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Like [`json_text`], but JSON numbers are read as epoch milliseconds.
pub fn json_timestamp_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .map(|ts| ts.to_rfc3339()),
        other => json_text(other),
    }
}

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Parses upstream timestamp text. Naive forms are read as UTC; anything
/// unrecognized is `None`.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn lenient_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(json_text))
}

fn lenient_timestamp<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(json_timestamp_text))
}

/// Normalizer output: one upstream record mapped onto ticket columns, values
/// still raw. Defaults are applied by [`TicketDraft::into_record`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TicketDraft {
    #[serde(default, deserialize_with = "lenient_text")]
    pub ticket_no: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub category: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub details: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub solution: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub cost: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub reporter_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub reporter_dept: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_date: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub finished_date: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub responsible_person: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub responsible_dept: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub status: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl TicketDraft {
    /// Trimmed ticket number, or `None` when the draft carries no usable key.
    pub fn key(&self) -> Option<&str> {
        self.ticket_no
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }

    /// Applies the default-substitution and coercion rules. Returns `None` for
    /// drafts without a ticket number.
    pub fn into_record(self) -> Option<TicketRecord> {
        let ticket_no = self.key()?.to_string();
        let fields = TicketFields {
            category: non_blank(self.category).unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
            details: non_blank(self.details).unwrap_or_default(),
            solution: non_blank(self.solution),
            cost: self
                .cost
                .as_deref()
                .map(Cost::parse_lenient)
                .unwrap_or_default(),
            reporter_name: non_blank(self.reporter_name)
                .unwrap_or_else(|| DEFAULT_REPORTER_NAME.to_string()),
            reporter_dept: non_blank(self.reporter_dept).unwrap_or_default(),
            created_date: self.created_date.as_deref().and_then(parse_timestamp),
            finished_date: self.finished_date.as_deref().and_then(parse_timestamp),
            responsible_person: non_blank(self.responsible_person).unwrap_or_default(),
            responsible_dept: non_blank(self.responsible_dept).unwrap_or_default(),
            status: non_blank(self.status).unwrap_or_else(|| DEFAULT_STATUS.to_string()),
        };
        Some(TicketRecord { ticket_no, fields })
    }
}

/// Every reconciled column of a ticket except its key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketFields {
    pub category: String,
    pub details: String,
    pub solution: Option<String>,
    pub cost: Cost,
    pub reporter_name: String,
    pub reporter_dept: String,
    pub created_date: Option<DateTime<Utc>>,
    pub finished_date: Option<DateTime<Utc>>,
    pub responsible_person: String,
    pub responsible_dept: String,
    pub status: String,
}

impl TicketFields {
    /// Names of the columns whose values differ between `self` and `other`.
    pub fn diff(&self, other: &TicketFields) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.category != other.category {
            changed.push("category");
        }
        if self.details != other.details {
            changed.push("details");
        }
        if self.solution != other.solution {
            changed.push("solution");
        }
        if self.cost != other.cost {
            changed.push("cost");
        }
        if self.reporter_name != other.reporter_name {
            changed.push("reporter_name");
        }
        if self.reporter_dept != other.reporter_dept {
            changed.push("reporter_dept");
        }
        if self.created_date != other.created_date {
            changed.push("created_date");
        }
        if self.finished_date != other.finished_date {
            changed.push("finished_date");
        }
        if self.responsible_person != other.responsible_person {
            changed.push("responsible_person");
        }
        if self.responsible_dept != other.responsible_dept {
            changed.push("responsible_dept");
        }
        if self.status != other.status {
            changed.push("status");
        }
        changed
    }
}

/// A normalized ticket ready to be written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRecord {
    pub ticket_no: String,
    #[serde(flatten)]
    pub fields: TicketFields,
}

/// Persisted ticket, including the store's bookkeeping timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub ticket_no: String,
    #[serde(flatten)]
    pub fields: TicketFields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Ticket paired with its taxonomy lookups, as list consumers display it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifiedTicket {
    #[serde(flatten)]
    pub ticket: Ticket,
    pub status_label: String,
    pub status_order: u32,
    pub category_label: String,
    pub category_order: u32,
    pub category_group: CategoryGroup,
}

impl ClassifiedTicket {
    pub fn from_ticket(ticket: Ticket) -> Self {
        let category_label = taxonomy::category_label(&ticket.fields.category);
        Self {
            status_label: taxonomy::status_label(&ticket.fields.status),
            status_order: taxonomy::status_order(&ticket.fields.status),
            category_order: taxonomy::category_order(&ticket.fields.category),
            category_group: taxonomy::category_group(&category_label),
            category_label,
            ticket,
        }
    }
}

/// Classifies tickets and orders them newest first; undated tickets go last.
pub fn classify_tickets(tickets: impl IntoIterator<Item = Ticket>) -> Vec<ClassifiedTicket> {
    let mut out = tickets
        .into_iter()
        .map(ClassifiedTicket::from_ticket)
        .collect::<Vec<_>>();
    out.sort_by(|a, b| {
        match (a.ticket.fields.created_date, b.ticket.fields.created_date) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        }
        .then_with(|| a.ticket.ticket_no.cmp(&b.ticket.ticket_no))
    });
    out
}
