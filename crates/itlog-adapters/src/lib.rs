//! Source adapter contracts + per-source ticket normalizers.

use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use itlog_core::{json_text, json_timestamp_text, TicketDraft};
use itlog_storage::{FetchError, RecordFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "itlog-adapters";

/// Upstream field carrying the ticket number in every source.
pub const UPSTREAM_KEY_FIELD: &str = "ticket_on";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Helpdesk,
    AccessRequest,
    CctvRequest,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [
        SourceKind::Helpdesk,
        SourceKind::AccessRequest,
        SourceKind::CctvRequest,
    ];

    pub fn source_id(self) -> &'static str {
        match self {
            SourceKind::Helpdesk => "helpdesk",
            SourceKind::AccessRequest => "access-request",
            SourceKind::CctvRequest => "cctv-request",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            SourceKind::Helpdesk => "General helpdesk",
            SourceKind::AccessRequest => "Access requests",
            SourceKind::CctvRequest => "CCTV requests",
        }
    }

    /// Collection path relative to the upstream base URL.
    pub fn default_path(self) -> &'static str {
        match self {
            SourceKind::Helpdesk => "/helpdesks/service/all",
            SourceKind::AccessRequest => "/empauth/request/all",
            SourceKind::CctvRequest => "/cctv/request/all",
        }
    }

    pub fn from_source_id(source_id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.source_id() == source_id)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.source_id())
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("unknown source `{0}`")]
    UnknownSource(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Drafts produced from one upstream collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedBatch {
    pub drafts: Vec<TicketDraft>,
    /// Records dropped for not being objects or carrying no ticket number.
    pub skipped: usize,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Maps one raw record. `None` when the record has no usable ticket number.
    fn normalize(&self, record: &JsonValue) -> Option<TicketDraft>;

    fn parse_records(&self, records: &[JsonValue]) -> NormalizedBatch {
        let mut batch = NormalizedBatch::default();
        for record in records {
            match self.normalize(record) {
                Some(draft) => batch.drafts.push(draft),
                None => batch.skipped += 1,
            }
        }
        batch
    }

    async fn fetch_drafts(
        &self,
        fetcher: &dyn RecordFetcher,
        url: &str,
    ) -> Result<NormalizedBatch, AdapterError> {
        let records = fetcher.fetch_records(self.kind().source_id(), url).await?;
        Ok(self.parse_records(&records))
    }
}

fn text(record: &JsonValue, key: &str) -> Option<String> {
    record
        .get(key)
        .and_then(json_text)
        .filter(|v| !v.trim().is_empty())
}

fn timestamp(record: &JsonValue, key: &str) -> Option<String> {
    record.get(key).and_then(json_timestamp_text)
}

fn ticket_key(record: &JsonValue) -> Option<String> {
    if !record.is_object() {
        return None;
    }
    text(record, UPSTREAM_KEY_FIELD).map(|k| k.trim().to_string())
}

/// Columns every source fills from the same upstream fields.
fn shared_columns(record: &JsonValue, ticket_no: String) -> TicketDraft {
    TicketDraft {
        ticket_no: Some(ticket_no),
        reporter_dept: text(record, "reporter_division_code"),
        created_date: timestamp(record, "create_date"),
        finished_date: timestamp(record, "write_date"),
        responsible_dept: text(record, "division_code"),
        status: text(record, "status"),
        ..Default::default()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HelpdeskAdapter;

impl SourceAdapter for HelpdeskAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Helpdesk
    }

    fn normalize(&self, record: &JsonValue) -> Option<TicketDraft> {
        let ticket_no = ticket_key(record)?;
        Some(TicketDraft {
            category: text(record, "category"),
            details: text(record, "details"),
            solution: text(record, "manage_comment"),
            cost: text(record, "total_all"),
            reporter_name: text(record, "create_user"),
            responsible_person: text(record, "assigned_user"),
            ..shared_columns(record, ticket_no)
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AccessRequestAdapter;

impl SourceAdapter for AccessRequestAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::AccessRequest
    }

    fn normalize(&self, record: &JsonValue) -> Option<TicketDraft> {
        let ticket_no = ticket_key(record)?;
        let request = text(record, "request");
        Some(TicketDraft {
            details: request.as_ref().map(|r| format!("Request: {r}")),
            category: request,
            solution: text(record, "close_memo"),
            cost: Some("0".into()),
            reporter_name: text(record, "employee_name"),
            responsible_person: text(record, "operator"),
            ..shared_columns(record, ticket_no)
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CctvRequestAdapter;

impl CctvRequestAdapter {
    /// Base details with point, period and company appended when present.
    pub fn compose_details(record: &JsonValue) -> String {
        let mut details = text(record, "details").unwrap_or_default();
        if let Some(point) = text(record, "cctv_ref") {
            details.push_str(&format!(" (Point: {point})"));
        }
        if let Some(period) = text(record, "date_range") {
            details.push_str(&format!(" [Period: {period}]"));
        }
        if let Some(company) = text(record, "company") {
            details.push_str(&format!(" [{company}]"));
        }
        details
    }
}

impl SourceAdapter for CctvRequestAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::CctvRequest
    }

    fn normalize(&self, record: &JsonValue) -> Option<TicketDraft> {
        let ticket_no = ticket_key(record)?;
        Some(TicketDraft {
            category: text(record, "request_type"),
            details: Some(Self::compose_details(record)),
            solution: None,
            cost: Some("0".into()),
            reporter_name: text(record, "create_user"),
            responsible_person: text(record, "operator"),
            ..shared_columns(record, ticket_no)
        })
    }
}

pub fn adapter_for_kind(kind: SourceKind) -> Box<dyn SourceAdapter> {
    match kind {
        SourceKind::Helpdesk => Box::new(HelpdeskAdapter),
        SourceKind::AccessRequest => Box::new(AccessRequestAdapter),
        SourceKind::CctvRequest => Box::new(CctvRequestAdapter),
    }
}

pub fn adapter_for_source(source_id: &str) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    SourceKind::from_source_id(source_id)
        .map(adapter_for_kind)
        .ok_or_else(|| AdapterError::UnknownSource(source_id.to_string()))
}

/// Reads a JSON array of records from disk. A bare object is read as one record.
pub fn read_json_records(path: impl AsRef<Path>) -> Result<Vec<JsonValue>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let value: JsonValue =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(match value {
        JsonValue::Array(items) => items,
        other => vec![other],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use itlog_core::Cost;
    use serde_json::json;

    #[test]
    fn helpdesk_maps_every_column() {
        let record = json!({
            "ticket_on": "H1",
            "category": "Printer",
            "details": "Paper jam",
            "manage_comment": "Cleared tray",
            "total_all": "150.5",
            "create_user": "Somchai",
            "reporter_division_code": "FIN",
            "create_date": "2025-03-10 08:00:00",
            "write_date": "2025-03-10 10:00:00",
            "assigned_user": "Anan",
            "division_code": "IT",
            "status": "closed"
        });
        let draft = HelpdeskAdapter.normalize(&record).unwrap();
        assert_eq!(draft.key(), Some("H1"));
        assert_eq!(draft.solution.as_deref(), Some("Cleared tray"));
        assert_eq!(draft.reporter_dept.as_deref(), Some("FIN"));
        assert_eq!(draft.responsible_person.as_deref(), Some("Anan"));

        let ticket = draft.into_record().unwrap();
        assert_eq!(ticket.fields.cost, Cost::from_cents(15050));
        assert_eq!(ticket.fields.responsible_dept, "IT");
        assert!(ticket.fields.finished_date.is_some());
    }

    #[test]
    fn access_request_prefixes_details_and_zeroes_cost() {
        let record = json!({
            "ticket_on": "R1",
            "request": "VPN",
            "employee_name": "Malee",
            "operator": "Anan",
            "status": "เรียบร้อย",
            "total_all": "999"
        });
        let ticket = AccessRequestAdapter.normalize(&record).unwrap().into_record().unwrap();
        assert_eq!(ticket.fields.category, "VPN");
        assert_eq!(ticket.fields.details, "Request: VPN");
        assert_eq!(ticket.fields.solution, None);
        assert_eq!(ticket.fields.cost, Cost::ZERO);
        assert_eq!(ticket.fields.reporter_name, "Malee");
        assert_eq!(ticket.fields.responsible_person, "Anan");
    }

    #[test]
    fn cctv_details_append_only_present_annotations() {
        let full = json!({
            "ticket_on": "C1",
            "request_type": "ขอดูย้อนหลัง",
            "details": "Lobby",
            "cctv_ref": "A1",
            "date_range": "1-2 Mar",
            "company": "ACME"
        });
        assert_eq!(
            CctvRequestAdapter::compose_details(&full),
            "Lobby (Point: A1) [Period: 1-2 Mar] [ACME]"
        );

        let partial = json!({"ticket_on": "C2", "details": "Gate", "company": "ACME", "cctv_ref": ""});
        assert_eq!(CctvRequestAdapter::compose_details(&partial), "Gate [ACME]");

        let bare = json!({"ticket_on": "C3", "date_range": "today"});
        assert_eq!(CctvRequestAdapter::compose_details(&bare), " [Period: today]");

        let ticket = CctvRequestAdapter.normalize(&full).unwrap().into_record().unwrap();
        assert_eq!(ticket.fields.cost, Cost::ZERO);
        assert_eq!(ticket.fields.solution, None);
    }

    #[test]
    fn records_without_ticket_number_are_skipped() {
        let records = vec![
            json!({"ticket_on": "H1"}),
            json!({"ticket_on": null}),
            json!({"ticket_on": "  "}),
            json!({"category": "Printer"}),
            json!("not an object"),
            json!({"ticket_on": 42}),
        ];
        let batch = HelpdeskAdapter.parse_records(&records);
        let keys = batch.drafts.iter().filter_map(|d| d.key()).collect::<Vec<_>>();
        assert_eq!(keys, vec!["H1", "42"]);
        assert_eq!(batch.skipped, 4);
    }

    #[test]
    fn adapters_resolve_by_source_id() {
        for kind in SourceKind::ALL {
            assert_eq!(adapter_for_source(kind.source_id()).unwrap().kind(), kind);
        }
        assert!(matches!(
            adapter_for_source("nope"),
            Err(AdapterError::UnknownSource(_))
        ));
        assert_eq!(
            serde_json::to_value(SourceKind::AccessRequest).unwrap(),
            json!("access-request")
        );
    }
}
