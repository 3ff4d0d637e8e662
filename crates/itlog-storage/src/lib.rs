//! Durable ticket storage + upstream record fetching for itlog.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itlog_core::{Cost, Ticket, TicketFields, TicketRecord};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info_span, warn, Instrument};

pub const CRATE_NAME: &str = "itlog-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("ticket {0} already exists")]
    Duplicate(String),
    #[error("ticket {0} does not exist")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Keyed ticket storage. Implementations maintain `created_at`/`updated_at`.
#[async_trait]
pub trait TicketStore: Send + Sync {
    async fn find(&self, ticket_no: &str) -> Result<Option<Ticket>, StoreError>;

    /// Fails with [`StoreError::Duplicate`] when the key is taken.
    async fn insert(&self, record: &TicketRecord) -> Result<(), StoreError>;

    /// Overwrites every column of an existing ticket.
    async fn update(&self, record: &TicketRecord) -> Result<(), StoreError>;

    /// Creates the ticket only if its key is free; never overwrites.
    async fn insert_if_absent(&self, record: &TicketRecord) -> Result<bool, StoreError>;

    /// All tickets, newest `created_date` first, undated last.
    async fn list(&self) -> Result<Vec<Ticket>, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;

    /// Removes every ticket, returning how many were deleted.
    async fn clear(&self) -> Result<u64, StoreError>;
}

fn list_order(a: &Ticket, b: &Ticket) -> std::cmp::Ordering {
    b.fields
        .created_date
        .is_some()
        .cmp(&a.fields.created_date.is_some())
        .then_with(|| b.fields.created_date.cmp(&a.fields.created_date))
        .then_with(|| a.ticket_no.cmp(&b.ticket_no))
}

/// Process-local store, used for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryTicketStore {
    tickets: RwLock<BTreeMap<String, Ticket>>,
}

impl MemoryTicketStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn new_ticket(record: &TicketRecord, now: DateTime<Utc>) -> Ticket {
    Ticket {
        ticket_no: record.ticket_no.clone(),
        fields: record.fields.clone(),
        created_at: now,
        updated_at: now,
    }
}

#[async_trait]
impl TicketStore for MemoryTicketStore {
    async fn find(&self, ticket_no: &str) -> Result<Option<Ticket>, StoreError> {
        Ok(self.tickets.read().await.get(ticket_no).cloned())
    }

    async fn insert(&self, record: &TicketRecord) -> Result<(), StoreError> {
        let mut tickets = self.tickets.write().await;
        if tickets.contains_key(&record.ticket_no) {
            return Err(StoreError::Duplicate(record.ticket_no.clone()));
        }
        tickets.insert(record.ticket_no.clone(), new_ticket(record, Utc::now()));
        Ok(())
    }

    async fn update(&self, record: &TicketRecord) -> Result<(), StoreError> {
        let mut tickets = self.tickets.write().await;
        let Some(existing) = tickets.get_mut(&record.ticket_no) else {
            return Err(StoreError::NotFound(record.ticket_no.clone()));
        };
        existing.fields = record.fields.clone();
        existing.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_if_absent(&self, record: &TicketRecord) -> Result<bool, StoreError> {
        let mut tickets = self.tickets.write().await;
        if tickets.contains_key(&record.ticket_no) {
            return Ok(false);
        }
        tickets.insert(record.ticket_no.clone(), new_ticket(record, Utc::now()));
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<Ticket>, StoreError> {
        let mut out = self.tickets.read().await.values().cloned().collect::<Vec<_>>();
        out.sort_by(list_order);
        Ok(out)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.tickets.read().await.len() as u64)
    }

    async fn clear(&self) -> Result<u64, StoreError> {
        let mut tickets = self.tickets.write().await;
        let removed = tickets.len() as u64;
        tickets.clear();
        Ok(removed)
    }
}

const TICKETS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tickets (
    ticket_no          TEXT PRIMARY KEY NOT NULL,
    category           TEXT NOT NULL,
    details            TEXT NOT NULL,
    solution           TEXT,
    cost_cents         INTEGER NOT NULL DEFAULT 0 CHECK (cost_cents >= 0),
    reporter_name      TEXT NOT NULL,
    reporter_dept      TEXT NOT NULL,
    created_date       TEXT,
    finished_date      TEXT,
    responsible_person TEXT NOT NULL,
    responsible_dept   TEXT NOT NULL,
    status             TEXT NOT NULL,
    created_at         TEXT NOT NULL,
    updated_at         TEXT NOT NULL
)
"#;

const TICKETS_CREATED_DATE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS tickets_created_date_idx ON tickets (created_date)";

const INSERT_TICKET: &str = r#"
INSERT INTO tickets (
    ticket_no, category, details, solution, cost_cents, reporter_name, reporter_dept,
    created_date, finished_date, responsible_person, responsible_dept, status,
    created_at, updated_at
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

/// SQLite-backed store; the schema is created by [`SqliteTicketStore::migrate`].
#[derive(Debug, Clone)]
pub struct SqliteTicketStore {
    pool: SqlitePool,
}

impl SqliteTicketStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing database url {database_url}"))?
            .create_if_missing(true);

        // every connection to an in-memory database gets its own copy
        let pool_options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {database_url}"))?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(TICKETS_SCHEMA).execute(&self.pool).await?;
        sqlx::query(TICKETS_CREATED_DATE_INDEX)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_with(&self, sql: &str, record: &TicketRecord) -> Result<u64, StoreError> {
        let now = Utc::now();
        let f = &record.fields;
        let result = sqlx::query(sql)
            .bind(&record.ticket_no)
            .bind(&f.category)
            .bind(&f.details)
            .bind(&f.solution)
            .bind(f.cost.cents())
            .bind(&f.reporter_name)
            .bind(&f.reporter_dept)
            .bind(f.created_date)
            .bind(f.finished_date)
            .bind(&f.responsible_person)
            .bind(&f.responsible_dept)
            .bind(&f.status)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await;

        match result {
            Ok(done) => Ok(done.rows_affected()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::Duplicate(record.ticket_no.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn ticket_from_row(row: &SqliteRow) -> Result<Ticket, sqlx::Error> {
    Ok(Ticket {
        ticket_no: row.try_get("ticket_no")?,
        fields: TicketFields {
            category: row.try_get("category")?,
            details: row.try_get("details")?,
            solution: row.try_get("solution")?,
            cost: Cost::from_cents(row.try_get("cost_cents")?),
            reporter_name: row.try_get("reporter_name")?,
            reporter_dept: row.try_get("reporter_dept")?,
            created_date: row.try_get("created_date")?,
            finished_date: row.try_get("finished_date")?,
            responsible_person: row.try_get("responsible_person")?,
            responsible_dept: row.try_get("responsible_dept")?,
            status: row.try_get("status")?,
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl TicketStore for SqliteTicketStore {
    async fn find(&self, ticket_no: &str) -> Result<Option<Ticket>, StoreError> {
        let row = sqlx::query("SELECT * FROM tickets WHERE ticket_no = ?")
            .bind(ticket_no)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(ticket_from_row).transpose()?)
    }

    async fn insert(&self, record: &TicketRecord) -> Result<(), StoreError> {
        self.insert_with(INSERT_TICKET, record).await.map(|_| ())
    }

    async fn update(&self, record: &TicketRecord) -> Result<(), StoreError> {
        let f = &record.fields;
        let done = sqlx::query(
            r#"
            UPDATE tickets
               SET category = ?, details = ?, solution = ?, cost_cents = ?,
                   reporter_name = ?, reporter_dept = ?, created_date = ?,
                   finished_date = ?, responsible_person = ?, responsible_dept = ?,
                   status = ?, updated_at = ?
             WHERE ticket_no = ?
            "#,
        )
        .bind(&f.category)
        .bind(&f.details)
        .bind(&f.solution)
        .bind(f.cost.cents())
        .bind(&f.reporter_name)
        .bind(&f.reporter_dept)
        .bind(f.created_date)
        .bind(f.finished_date)
        .bind(&f.responsible_person)
        .bind(&f.responsible_dept)
        .bind(&f.status)
        .bind(Utc::now())
        .bind(&record.ticket_no)
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound(record.ticket_no.clone()));
        }
        Ok(())
    }

    async fn insert_if_absent(&self, record: &TicketRecord) -> Result<bool, StoreError> {
        let sql = format!("{} ON CONFLICT (ticket_no) DO NOTHING", INSERT_TICKET.trim_end());
        Ok(self.insert_with(&sql, record).await? == 1)
    }

    async fn list(&self) -> Result<Vec<Ticket>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT *
              FROM tickets
             ORDER BY created_date IS NULL, created_date DESC, ticket_no
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(ticket_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tickets")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn clear(&self) -> Result<u64, StoreError> {
        let done = sqlx::query("DELETE FROM tickets").execute(&self.pool).await?;
        Ok(done.rows_affected())
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("reading fixture {path}: {source}")]
    Fixture {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Source client seam: fetch one upstream collection as raw JSON records.
#[async_trait]
pub trait RecordFetcher: Send + Sync {
    async fn fetch_records(&self, source_id: &str, url: &str) -> Result<Vec<JsonValue>, FetchError>;
}

/// Decodes an upstream body. Anything but a JSON array counts as zero records.
pub fn records_from_body(source_id: &str, body: &[u8]) -> Vec<JsonValue> {
    match serde_json::from_slice::<JsonValue>(body) {
        Ok(JsonValue::Array(items)) => items,
        Ok(other) => {
            let kind = match other {
                JsonValue::Object(_) => "object",
                JsonValue::String(_) => "string",
                JsonValue::Null => "null",
                _ => "scalar",
            };
            warn!(source_id, kind, "upstream body is not a JSON array; using zero records");
            Vec::new()
        }
        Err(err) => {
            warn!(source_id, error = %err, "upstream body is not valid JSON; using zero records");
            Vec::new()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, url);
        async {
            let mut attempt = 0usize;
            loop {
                match self.client.get(url).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();

                        if status.is_success() {
                            let body = resp.bytes().await?.to_vec();
                            return Ok(FetchedResponse {
                                status,
                                final_url,
                                body,
                            });
                        }

                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            warn!(status = status.as_u16(), attempt, "retrying upstream fetch");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }

                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            warn!(error = %err, attempt, "retrying upstream fetch");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchError::Request(err));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl RecordFetcher for HttpFetcher {
    async fn fetch_records(&self, source_id: &str, url: &str) -> Result<Vec<JsonValue>, FetchError> {
        let resp = self.fetch_bytes(source_id, url).await?;
        Ok(records_from_body(source_id, &resp.body))
    }
}

/// Serves `<root>/<source_id>/records.json` instead of calling upstream.
#[derive(Debug, Clone)]
pub struct FixtureFetcher {
    root: PathBuf,
}

impl FixtureFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn records_path(&self, source_id: &str) -> PathBuf {
        self.root.join(source_id).join("records.json")
    }
}

#[async_trait]
impl RecordFetcher for FixtureFetcher {
    async fn fetch_records(&self, source_id: &str, _url: &str) -> Result<Vec<JsonValue>, FetchError> {
        let path = self.records_path(source_id);
        let body = tokio::fs::read(&path)
            .await
            .map_err(|source| FetchError::Fixture {
                path: path.display().to_string(),
                source,
            })?;
        Ok(records_from_body(source_id, &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itlog_core::TicketDraft;
    use serde_json::json;
    use tempfile::tempdir;

    fn record(no: &str, status: &str, created: Option<&str>) -> TicketRecord {
        TicketDraft {
            ticket_no: Some(no.into()),
            category: Some("Printer".into()),
            status: Some(status.into()),
            cost: Some("150.5".into()),
            created_date: created.map(str::to_string),
            ..Default::default()
        }
        .into_record()
        .unwrap()
    }

    async fn exercise_store(store: &dyn TicketStore) {
        assert!(store.find("H1").await.unwrap().is_none());

        store.insert(&record("H1", "claim", Some("2025-03-10"))).await.unwrap();
        store.insert(&record("H2", "closed", None)).await.unwrap();
        store.insert(&record("H3", "closed", Some("2025-05-01"))).await.unwrap();
        assert!(matches!(
            store.insert(&record("H1", "closed", None)).await,
            Err(StoreError::Duplicate(no)) if no == "H1"
        ));

        let found = store.find("H1").await.unwrap().unwrap();
        assert_eq!(found.fields.status, "claim");
        assert_eq!(found.fields.cost.cents(), 15050);
        assert_eq!(found.created_at, found.updated_at);

        store.update(&record("H1", "closed", Some("2025-03-10"))).await.unwrap();
        let updated = store.find("H1").await.unwrap().unwrap();
        assert_eq!(updated.fields.status, "closed");
        assert_eq!(updated.created_at, found.created_at);
        assert!(updated.updated_at >= found.updated_at);
        assert!(matches!(
            store.update(&record("NOPE", "closed", None)).await,
            Err(StoreError::NotFound(_))
        ));

        assert!(!store.insert_if_absent(&record("H1", "fix", None)).await.unwrap());
        assert_eq!(store.find("H1").await.unwrap().unwrap().fields.status, "closed");
        assert!(store.insert_if_absent(&record("H4", "fix", None)).await.unwrap());

        let listed = store.list().await.unwrap();
        let order = listed.iter().map(|t| t.ticket_no.as_str()).collect::<Vec<_>>();
        assert_eq!(order, vec!["H3", "H1", "H2", "H4"]);
        assert_eq!(store.count().await.unwrap(), 4);

        assert_eq!(store.clear().await.unwrap(), 4);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn memory_store_honours_the_store_contract() {
        exercise_store(&MemoryTicketStore::new()).await;
    }

    #[tokio::test]
    async fn sqlite_store_honours_the_store_contract() {
        let store = SqliteTicketStore::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn sqlite_store_round_trips_every_column_across_reconnects() {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("itlog.db").display());
        let mut full = record("C7", "เสร็จสิ้น", Some("2025-03-10T08:30:00+07:00"));
        full.fields.solution = Some("replaced cable".into());
        full.fields.finished_date = itlog_core::parse_timestamp("2025-03-11 09:00:00");
        full.fields.details = "Lobby camera (Point: A1)".into();

        {
            let store = SqliteTicketStore::connect(&url).await.unwrap();
            store.migrate().await.unwrap();
            store.insert(&full).await.unwrap();
        }

        let store = SqliteTicketStore::connect(&url).await.unwrap();
        store.migrate().await.unwrap();
        let loaded = store.find("C7").await.unwrap().unwrap();
        assert_eq!(loaded.fields, full.fields);
    }

    #[test]
    fn non_array_bodies_are_zero_records() {
        assert_eq!(records_from_body("helpdesk", br#"[{"a":1},{"b":2}]"#).len(), 2);
        assert!(records_from_body("helpdesk", br#"{"error":"down"}"#).is_empty());
        assert!(records_from_body("helpdesk", b"<html>502</html>").is_empty());
        assert!(records_from_body("helpdesk", b"").is_empty());
    }

    #[tokio::test]
    async fn fixture_fetcher_reads_per_source_files() {
        let dir = tempdir().expect("tempdir");
        let fetcher = FixtureFetcher::new(dir.path());
        std::fs::create_dir_all(dir.path().join("helpdesk")).unwrap();
        std::fs::write(
            fetcher.records_path("helpdesk"),
            serde_json::to_vec(&json!([{"ticket_on": "H1"}])).unwrap(),
        )
        .unwrap();

        let records = fetcher.fetch_records("helpdesk", "ignored").await.unwrap();
        assert_eq!(records, vec![json!({"ticket_on": "H1"})]);
        assert!(matches!(
            fetcher.fetch_records("cctv-request", "ignored").await,
            Err(FetchError::Fixture { .. })
        ));
    }

    #[test]
    fn retryable_statuses_are_server_errors_and_throttling() {
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }
}
